//! Per-record conflict resolution.

use crate::models::record::{UPDATED_AT_COLUMN, timestamp_of};
use crate::models::{ChosenSource, Conflict, ResolutionStrategy, Resolution, Row};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Caller-supplied merge: `(data_a, data_b) -> chosen data`.
pub type CustomRule = Arc<dyn Fn(&Row, &Row) -> Row + Send + Sync>;

/// Resolves conflicts with the strategy recorded on each [`Conflict`].
///
/// Clones share the queue of conflicts waiting for manual review.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    timestamp_field: String,
    manual_queue: Arc<Mutex<Vec<Conflict>>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            timestamp_field: UPDATED_AT_COLUMN.to_string(),
            manual_queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Field compared by `latest_wins`. Defaults to `updated_at`.
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    pub fn resolve_conflict(
        &self,
        conflict: &Conflict,
        custom_rule: Option<&CustomRule>,
    ) -> Resolution {
        let resolution = match conflict.resolution {
            ResolutionStrategy::LatestWins => self.latest_wins(conflict),
            ResolutionStrategy::CustomRule => Self::custom(conflict, custom_rule),
            ResolutionStrategy::Manual => self.manual(conflict),
        };
        debug!(
            table = %conflict.table,
            record_id = %conflict.record_id,
            strategy = %conflict.resolution,
            success = resolution.success,
            chosen = ?resolution.chosen_source,
            "Conflict resolved"
        );
        resolution
    }

    fn timestamp(&self, data: Option<&Row>) -> Option<DateTime<Utc>> {
        data.and_then(|row| row.get(&self.timestamp_field))
            .and_then(timestamp_of)
    }

    /// Strictly later timestamp wins; ties go to A; a side without a usable
    /// timestamp loses to one that has it.
    fn latest_wins(&self, conflict: &Conflict) -> Resolution {
        let ts_a = self.timestamp(conflict.data_a.as_ref());
        let ts_b = self.timestamp(conflict.data_b.as_ref());

        let chosen = match (ts_a, ts_b) {
            (Some(a), Some(b)) if b > a => ChosenSource::B,
            (Some(_), _) => ChosenSource::A,
            (None, Some(_)) => ChosenSource::B,
            (None, None) => {
                return Resolution {
                    success: false,
                    strategy: ResolutionStrategy::LatestWins,
                    resolved_data: None,
                    chosen_source: None,
                    requires_manual_intervention: false,
                    reason: Some(format!(
                        "neither side has a usable '{}' timestamp",
                        self.timestamp_field
                    )),
                };
            }
        };

        let data = match chosen {
            ChosenSource::B => conflict.data_b.clone(),
            _ => conflict.data_a.clone(),
        };
        let reason = match (ts_a, ts_b) {
            (Some(a), Some(b)) if a == b => {
                Some("equal timestamps, backend A preferred".to_string())
            }
            _ => None,
        };

        Resolution {
            success: data.is_some(),
            strategy: ResolutionStrategy::LatestWins,
            resolved_data: data,
            chosen_source: Some(chosen),
            requires_manual_intervention: false,
            reason,
        }
    }

    fn custom(conflict: &Conflict, custom_rule: Option<&CustomRule>) -> Resolution {
        let Some(rule) = custom_rule else {
            return Resolution {
                success: false,
                strategy: ResolutionStrategy::CustomRule,
                resolved_data: None,
                chosen_source: None,
                requires_manual_intervention: false,
                reason: Some("custom_rule strategy requires a rule".to_string()),
            };
        };

        let empty = Row::new();
        let a = conflict.data_a.as_ref().unwrap_or(&empty);
        let b = conflict.data_b.as_ref().unwrap_or(&empty);
        let chosen_data = rule(a, b);
        let chosen = if conflict.data_a.as_ref() == Some(&chosen_data) {
            ChosenSource::A
        } else if conflict.data_b.as_ref() == Some(&chosen_data) {
            ChosenSource::B
        } else {
            ChosenSource::Merged
        };

        Resolution {
            success: true,
            strategy: ResolutionStrategy::CustomRule,
            resolved_data: Some(chosen_data),
            chosen_source: Some(chosen),
            requires_manual_intervention: false,
            reason: None,
        }
    }

    fn manual(&self, conflict: &Conflict) -> Resolution {
        self.manual_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conflict.clone());
        info!(
            table = %conflict.table,
            record_id = %conflict.record_id,
            "Conflict queued for manual review"
        );
        Resolution {
            success: false,
            strategy: ResolutionStrategy::Manual,
            resolved_data: None,
            chosen_source: None,
            requires_manual_intervention: true,
            reason: Some("queued for operator review".to_string()),
        }
    }

    /// Conflicts waiting for an operator.
    pub fn pending_manual(&self) -> Vec<Conflict> {
        self.manual_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the manual review queue.
    pub fn take_pending_manual(&self) -> Vec<Conflict> {
        std::mem::take(&mut *self.manual_queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
