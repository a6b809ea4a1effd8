#![forbid(unsafe_code)]

//! Runtime: the broker, per-type holders, and binders.
//!
//! ```
//! use cascade_core::{Source, Target, UpdateBy, UpdateError, Wiring};
//! use cascade_runtime::Broker;
//!
//! struct Score { value: i64 }
//! impl Source for Score {}
//!
//! #[derive(Clone, Default)]
//! struct ScoreDisplay { text: String }
//!
//! impl Target for ScoreDisplay {
//!     fn wire(wiring: &mut Wiring<Self>) {
//!         wiring.accepts::<Score>();
//!     }
//! }
//!
//! impl UpdateBy<Score> for ScoreDisplay {
//!     fn update_by(&mut self, source: &Score) -> Result<bool, UpdateError> {
//!         self.text = source.value.to_string();
//!         Ok(true)
//!     }
//! }
//!
//! let broker = Broker::builder().target::<ScoreDisplay>().build();
//! broker.update_by(&Score { value: 10 });
//! assert_eq!(broker.get::<ScoreDisplay>().text, "10");
//! ```

pub mod binder;
pub mod broker;
pub mod config;
pub mod error;
pub mod holder;
mod queue;
pub mod stats;

pub use binder::Binder;
pub use broker::{Broker, BrokerBuilder, CouplingStatus};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use holder::Holder;
pub use stats::BrokerStats;
