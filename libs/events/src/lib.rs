//! # fleet-events
//!
//! Wire types shared between runners, the fleet manager and downstream log
//! consumers.
//!
//! ## Job outcome records
//!
//! Each runner writes one [`JobOutcomeRecord`] to the metrics exchange before
//! it exits:
//!
//! ```json
//! {"timestamp":1700000000,"status":"normal","status_info":{"code":0}}
//! ```
//!
//! Field names, field order and value types are a compatibility contract with
//! log consumers. The manager re-emits the record unchanged, only wrapping it
//! with the runner id and flavor.
//!
//! ## Metric events
//!
//! [`MetricEvent`] is the line format of the metric log, tagged by `event`:
//! - `runner_job_outcome`: one per runner, after it is gone
//! - `reconciliation`: one per flavor per pass

mod error;
mod types;

pub use error::EventError;
pub use types::*;
