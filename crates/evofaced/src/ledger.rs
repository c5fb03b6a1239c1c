//! Attendance ledger: debounced live check-ins and administrative backfill.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use evoface_core::attendance::{logical_day, resolve_backfill_timestamp};
use serde::Serialize;

use crate::store::{
    parse_timestamp, AppendOutcome, AttendanceEvent, IdentityStore, LogEntry, StoreError,
};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Minimum spacing between accepted events of one identity.
    pub debounce: chrono::Duration,
    /// Clock hour before which a time belongs to the previous business day.
    pub day_cutoff_hour: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            debounce: chrono::Duration::minutes(5),
            day_cutoff_hour: 4,
        }
    }
}

/// Per-event matcher scores stored alongside the row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Diagnostics {
    pub base_score: f32,
    pub dynamic_score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Accepted { log_id: i64 },
    Debounced { remaining_secs: u64 },
}

impl RecordOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, RecordOutcome::Accepted { .. })
    }

    pub fn message(&self, name: &str) -> String {
        match self {
            RecordOutcome::Accepted { .. } => format!("check-in recorded for {name}"),
            RecordOutcome::Debounced { remaining_secs } => {
                format!("{name} already checked in; try again in {remaining_secs}s")
            }
        }
    }
}

/// A log row annotated with the business day it counts toward.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub entry: LogEntry,
    pub business_day: NaiveDate,
}

#[derive(Clone)]
pub struct Ledger {
    store: IdentityStore,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(store: IdentityStore, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Record a live check-in at `now`, unless the identity already has one
    /// inside the debounce window. Check and insert are one transaction.
    pub async fn record(
        &self,
        identity_id: &str,
        confidence: f32,
        diagnostics: Diagnostics,
        evidence_ref: Option<String>,
        now: NaiveDateTime,
    ) -> Result<RecordOutcome, StoreError> {
        let event = AttendanceEvent {
            identity_id: identity_id.to_string(),
            timestamp: now,
            confidence,
            base_score: diagnostics.base_score,
            dynamic_score: diagnostics.dynamic_score,
            evidence_ref,
        };
        let outcome = match self
            .store
            .append_log_debounced(&event, self.config.debounce)
            .await?
        {
            AppendOutcome::Inserted { log_id } => {
                tracing::info!(identity_id, log_id, confidence, "attendance recorded");
                RecordOutcome::Accepted { log_id }
            }
            AppendOutcome::Debounced { remaining_secs } => {
                tracing::debug!(identity_id, remaining_secs, "attendance debounced");
                RecordOutcome::Debounced { remaining_secs }
            }
        };
        Ok(outcome)
    }

    /// Write an event for business day `date` at clock `time`, bypassing the
    /// debounce window. Returns the resolved timestamp.
    pub async fn backfill(
        &self,
        identity_id: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<NaiveDateTime, StoreError> {
        let timestamp = resolve_backfill_timestamp(date, time, self.config.day_cutoff_hour);
        let event = AttendanceEvent {
            identity_id: identity_id.to_string(),
            timestamp,
            confidence: 1.0,
            base_score: 0.0,
            dynamic_score: 0.0,
            evidence_ref: Some("backfill".to_string()),
        };
        let log_id = self.store.append_log(&event).await?;
        tracing::info!(identity_id, log_id, %timestamp, "attendance backfilled");
        Ok(timestamp)
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>, StoreError> {
        let cutoff = self.config.day_cutoff_hour;
        self.store
            .recent_logs(limit)
            .await?
            .into_iter()
            .map(|entry| {
                let ts = parse_timestamp(&entry.timestamp)?;
                Ok(LedgerEntry {
                    entry,
                    business_day: logical_day(ts, cutoff),
                })
            })
            .collect()
    }
}
