//! Comparison jobs: configuration, lifecycle states, and summaries.
//!
//! A job's state is monotone: `Pending → Running → {Completed, Failed}`
//! and nothing else. Records are created by the scheduler and mutated
//! only by the worker that owns them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::ConnDescriptor;

/// What a job compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Table,
    Schema,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Table => "table",
            JobKind::Schema => "schema",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(JobKind::Table),
            "schema" => Some(JobKind::Schema),
            _ => None,
        }
    }
}

/// Monotone job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Which diff algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Hash,
    Join,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Hash => "hash",
            Algorithm::Join => "join",
        }
    }
}

/// The `comparison_config` block of a table-comparison request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    pub source_table: String,
    #[serde(default)]
    pub target_table: Option<String>,
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub compare_columns: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_columns: Option<Vec<String>>,
    #[serde(default)]
    pub where_condition: Option<String>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub sample_size: Option<u64>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub case_insensitive: Option<bool>,
    #[serde(default)]
    pub materialize_results: Option<bool>,
    #[serde(default)]
    pub enable_column_statistics: Option<bool>,
    #[serde(default)]
    pub timeline_column: Option<String>,
    #[serde(default)]
    pub bisection_threshold: Option<u64>,
    #[serde(default)]
    pub bisection_factor: Option<usize>,
}

impl ComparisonConfig {
    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.source_table)
    }

    pub fn materialize(&self) -> bool {
        self.materialize_results.unwrap_or(true)
    }
}

/// A full table-comparison request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    pub source_config: ConnDescriptor,
    pub target_config: ConnDescriptor,
    pub comparison_config: ComparisonConfig,
}

/// A schema-comparison request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCompareRequest {
    pub source_config: ConnDescriptor,
    pub target_config: ConnDescriptor,
    #[serde(default)]
    pub source_namespaces: Option<Vec<String>>,
    #[serde(default)]
    pub target_namespaces: Option<Vec<String>>,
}

/// Aggregate result of a completed comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub rows_compared: u64,
    pub rows_matched: u64,
    pub rows_different: u64,
    pub match_rate: f64,
    pub exclusive_source: u64,
    pub exclusive_target: u64,
    pub mismatched_rows: u64,
    #[serde(default)]
    pub per_column_null_rates: BTreeMap<String, f64>,
    pub duration_ms: u64,
    pub sql_round_trips: u64,
}

/// One orchestrator-managed job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: JobState,
    /// The submitted request, echoed for reproducibility.
    pub config: serde_json::Value,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_ts: Option<DateTime<Utc>>,
    /// Absent on failed or cancelled jobs: any persisted diff rows are
    /// partial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl Job {
    pub fn new(kind: JobKind, config: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: JobState::Pending,
            config,
            warnings: Vec::new(),
            error_kind: None,
            error: None,
            created_ts: Utc::now(),
            started_ts: None,
            finished_ts: None,
            summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_are_monotone() {
        use JobState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_state_labels_round_trip() {
        for s in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobState::parse("nope"), None);
    }

    #[test]
    fn test_comparison_config_defaults() {
        let cfg: ComparisonConfig = serde_json::from_value(serde_json::json!({
            "source_table": "users",
            "key_columns": ["id"],
        }))
        .unwrap();
        assert_eq!(cfg.algorithm, Algorithm::Hash);
        assert_eq!(cfg.target_table(), "users");
        assert!(cfg.materialize());
        assert!(cfg.compare_columns.is_none());
    }

    #[test]
    fn test_request_round_trip() {
        let body = serde_json::json!({
            "source_config": {"dialect": "postgres", "host": "a", "database": "x"},
            "target_config": {"dialect": "mysql", "host": "b", "database": "y"},
            "comparison_config": {
                "source_table": "t1",
                "target_table": "t2",
                "key_columns": ["id"],
                "algorithm": "join",
                "tolerance": 0.001,
            }
        });
        let req: CompareRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.comparison_config.algorithm, Algorithm::Join);
        assert_eq!(req.comparison_config.target_table(), "t2");
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(JobKind::Table, serde_json::json!({}));
        assert_eq!(job.state, JobState::Pending);
        assert!(job.summary.is_none());
        assert!(job.started_ts.is_none());
    }
}
