//! Trace processing pipeline
//!
//! A [`PipelineRunner`] pops trace ids and hands each trace to the analyzer,
//! then to the [`Committer`] which writes the result in one unit of work.

mod committer;
mod runner;

pub use committer::{CommitOutcome, Committer, DEFAULT_MAX_ATTEMPTS};
pub use runner::{PipelineConfig, PipelineRunner, PipelineStats, TraceOutcome};
