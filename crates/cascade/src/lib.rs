#![forbid(unsafe_code)]

//! Cascade public facade crate.
//!
//! Declare targets and the sources they accept, then push sources through a
//! [`Broker`](prelude::Broker); every changed target is notified once per
//! update.

pub mod prelude {
    pub use cascade_core as core;
    pub use cascade_runtime as runtime;

    pub use cascade_core::{
        Broadcast, Couple, Coupling, Source, SourceKind, Stream, Subscription, Target, UpdateBy,
        UpdateError, Wiring,
    };
    pub use cascade_runtime::{
        Binder, Broker, BrokerBuilder, BrokerConfig, BrokerError, BrokerStats, CouplingStatus,
        Holder,
    };
}

#[cfg(feature = "logging")]
pub mod logging {
    //! Process-wide log output.

    use tracing_subscriber::EnvFilter;

    /// Filter used when `RUST_LOG` is unset.
    pub const DEFAULT_FILTER: &str = "warn,cascade_runtime=info";

    /// Install a global fmt subscriber filtered by `RUST_LOG`.
    ///
    /// Fails if a global subscriber is already installed.
    pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        #[cfg(feature = "logging-json")]
        let builder = builder.json();
        builder.try_init()
    }
}
