//! Recurring synchronization schedules.

use crate::error::ErrorPayload;
use crate::models::sync::{ResolutionStrategy, SyncDirection, SyncResult};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Known schedule intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncInterval {
    #[serde(rename = "every_5_minutes")]
    Every5Minutes,
    #[serde(rename = "every_15_minutes")]
    Every15Minutes,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
}

impl SyncInterval {
    pub const ALL: [SyncInterval; 5] = [
        Self::Every5Minutes,
        Self::Every15Minutes,
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Every5Minutes => "every_5_minutes",
            Self::Every15Minutes => "every_15_minutes",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|i| i.as_str() == s)
    }

    pub fn period(&self) -> TimeDelta {
        match self {
            Self::Every5Minutes => TimeDelta::minutes(5),
            Self::Every15Minutes => TimeDelta::minutes(15),
            Self::Hourly => TimeDelta::hours(1),
            Self::Daily => TimeDelta::days(1),
            Self::Weekly => TimeDelta::weeks(1),
        }
    }

    /// Next run strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + self.period()
    }
}

impl std::fmt::Display for SyncInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unvalidated schedule request, as received from a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub tables: Vec<String>,
    pub interval: String,
    pub direction: String,
    /// Defaults to `latest_wins`
    #[serde(default)]
    pub conflict_resolution: Option<String>,
}

/// A validated, persisted schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub tables: Vec<String>,
    pub interval: SyncInterval,
    pub direction: SyncDirection,
    pub conflict_resolution: ResolutionStrategy,
    pub next_run_time: DateTime<Utc>,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_time <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub schedule_id: String,
    /// True only when every table synchronized successfully
    pub success: bool,
    pub executed_at: DateTime<Utc>,
    pub sync_results: Vec<SyncResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}
