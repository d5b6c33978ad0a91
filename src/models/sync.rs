//! Synchronization data models: directions, conflicts, results and events.

use crate::error::ErrorPayload;
use crate::models::query::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    #[serde(rename = "A_to_B")]
    AToB,
    #[serde(rename = "B_to_A")]
    BToA,
    #[serde(rename = "bidirectional")]
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AToB => "A_to_B",
            Self::BToA => "B_to_A",
            Self::Bidirectional => "bidirectional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a_to_b" => Some(Self::AToB),
            "b_to_a" => Some(Self::BToA),
            "bidirectional" => Some(Self::Bidirectional),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            format!(
                "unknown direction '{}', expected A_to_B, B_to_A or bidirectional",
                s
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides created the record independently
    InsertInsert,
    UpdateUpdate,
    /// One side soft-deleted, the other updated
    DeleteUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    LatestWins,
    CustomRule,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LatestWins => "latest_wins",
            Self::CustomRule => "custom_rule",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest_wins" => Some(Self::LatestWins),
            "custom_rule" => Some(Self::CustomRule),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record modified on both backends since the last known sync point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub table: String,
    pub record_id: String,
    pub conflict_type: ConflictType,
    /// `None` when the record is absent on that side
    pub data_a: Option<Row>,
    pub data_b: Option<Row>,
    pub resolution: ResolutionStrategy,
    pub detected_at: DateTime<Utc>,
}

/// Which side a resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChosenSource {
    A,
    B,
    /// Custom rule produced data equal to neither side
    #[serde(rename = "merged")]
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub success: bool,
    pub strategy: ResolutionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_source: Option<ChosenSource>,
    pub requires_manual_intervention: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one table synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub table: String,
    pub direction: SyncDirection,
    pub success: bool,
    /// Writes actually applied to a destination backend
    pub records_synchronized: u64,
    pub records_failed: u64,
    pub conflicts: Vec<Conflict>,
    pub conflicts_resolved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Watermark the caller can resume from
    pub last_sync_time: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// A run that never got started.
    pub fn failed(
        table: impl Into<String>,
        direction: SyncDirection,
        error: ErrorPayload,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            table: table.into(),
            direction,
            success: false,
            records_synchronized: 0,
            records_failed: 0,
            conflicts: Vec::new(),
            conflicts_resolved: 0,
            error: Some(error),
            last_sync_time,
            started_at: now,
            finished_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissingRecords {
    pub missing_in_a: Vec<String>,
    pub missing_in_b: Vec<String>,
}

impl MissingRecords {
    pub fn is_empty(&self) -> bool {
        self.missing_in_a.is_empty() && self.missing_in_b.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInA,
    MissingInB,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub record_id: String,
    pub kind: DiscrepancyKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub table_name: String,
    pub is_consistent: bool,
    pub count_a: u64,
    pub count_b: u64,
    pub discrepancies: Vec<Discrepancy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsistencySummary {
    pub total_tables: usize,
    pub consistent: usize,
    pub inconsistent: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub table_results: Vec<ConsistencyReport>,
    pub overall_consistency: bool,
    pub summary: ConsistencySummary,
    pub checked_at: DateTime<Utc>,
}

/// Domain events published while synchronizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        table: String,
        direction: SyncDirection,
        incremental: bool,
        at: DateTime<Utc>,
    },
    Progress {
        table: String,
        processed: usize,
        total: usize,
    },
    ConflictDetected {
        table: String,
        record_id: String,
        conflict_type: ConflictType,
    },
    Completed {
        table: String,
        records_synchronized: u64,
        conflicts: usize,
        at: DateTime<Utc>,
    },
    Failed {
        table: String,
        error: ErrorPayload,
    },
}

impl SyncEvent {
    pub fn table(&self) -> &str {
        match self {
            Self::Started { table, .. }
            | Self::Progress { table, .. }
            | Self::ConflictDetected { table, .. }
            | Self::Completed { table, .. }
            | Self::Failed { table, .. } => table,
        }
    }
}
