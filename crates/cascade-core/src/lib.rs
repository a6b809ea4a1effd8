#![forbid(unsafe_code)]

//! Core: source/target contracts, couplings, and broadcast streams.

pub mod contract;
pub mod coupling;
pub mod error;
pub mod stream;

pub use contract::{Source, SourceKind, Target, UpdateBy, Wiring, descends_from, lineage};
pub use coupling::{Couple, Coupling};
pub use error::UpdateError;
pub use stream::{Broadcast, EmitReport, Stream, Subscription};
