//! Domain models for the trace analyzer
//!
//! Traces, endpoints, data fields and alerts, plus the identifiers and
//! vocabularies they share.

mod alert;
mod data_field;
mod endpoint;
mod trace;
mod types;

pub use alert::*;
pub use data_field::*;
pub use endpoint::*;
pub use trace::*;
pub use types::*;
