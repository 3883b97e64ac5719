//! Outcome record and metric event definitions.

use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Status code used when a runner vanished without writing its record.
pub const UNKNOWN_STATUS_CODE: i64 = -1;

// =============================================================================
// Job Outcome Record
// =============================================================================

/// Overall result reported by a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Normal,
    Abnormal,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Normal => "normal",
            OutcomeStatus::Abnormal => "abnormal",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail attached to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub code: i64,
}

/// Record a runner writes to the metrics exchange before it exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcomeRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub status: OutcomeStatus,
    pub status_info: StatusInfo,
}

impl JobOutcomeRecord {
    /// Parses a record from raw exchange bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::InvalidRecord(e.to_string()))
    }

    /// The record emitted on behalf of a runner that never wrote one.
    pub fn unknown(at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.timestamp(),
            status: OutcomeStatus::Abnormal,
            status_info: StatusInfo {
                code: UNKNOWN_STATUS_CODE,
            },
        }
    }

    /// Returns true if this record was synthesized by [`JobOutcomeRecord::unknown`].
    pub fn is_unknown(&self) -> bool {
        self.status == OutcomeStatus::Abnormal && self.status_info.code == UNKNOWN_STATUS_CODE
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Metric Events
// =============================================================================

/// One line of the metric log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    /// Outcome of the single job a runner executed.
    RunnerJobOutcome {
        instance_id: InstanceId,
        flavor: String,
        #[serde(flatten)]
        record: JobOutcomeRecord,
    },

    /// Per-flavor summary of one reconciliation pass.
    Reconciliation(ReconciliationMetric),
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricEvent::RunnerJobOutcome { .. } => "runner_job_outcome",
            MetricEvent::Reconciliation(_) => "reconciliation",
        }
    }

    pub fn to_json_line(&self) -> Result<String, EventError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Per-flavor counts observed during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationMetric {
    /// Unix seconds at pass start.
    pub timestamp: i64,
    pub flavor: String,
    /// Runners that disappeared without finishing normally, or were removed
    /// as unhealthy.
    pub crashed_runners: u32,
    pub idle_runners: u32,
    pub active_runners: u32,
    pub expected_runners: u32,
    /// Pass duration in seconds.
    pub duration: f64,
}

// =============================================================================
// Tests
// =============================================================================
