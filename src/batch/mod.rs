//! Concurrent alignment of many document pairs

mod cancel;
mod runner;

pub use cancel::CancellationToken;
pub use runner::{BatchReport, BatchRunner, JobOutcome, DEFAULT_WORKERS};
