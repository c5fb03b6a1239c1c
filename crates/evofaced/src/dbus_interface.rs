use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use evoface_core::ExecutionBackend;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::{EngineHandle, FrameReport};
use crate::ledger::{Ledger, LedgerConfig};
use crate::store::{format_timestamp, IdentityStore, StoreError};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: IdentityStore,
    pub ledger: Ledger,
    pub backend: ExecutionBackend,
}

/// D-Bus interface for the EvoFace attendance daemon.
///
/// Bus name: org.evoface.Attendance1
/// Object path: /org/evoface/Attendance1
pub struct AttendanceService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Parse `YYYY-MM-DD` and `HH:MM` or `HH:MM:SS`.
fn parse_backfill_args(date: &str, time: &str) -> Result<(NaiveDate, NaiveTime), String> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{date}': {e} (expected YYYY-MM-DD)"))?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M"))
        .map_err(|e| format!("invalid time '{time}': {e} (expected HH:MM[:SS])"))?;
    Ok((date, time))
}

/// Status document served by `Status`. Fails if the identity count cannot
/// be read.
async fn status_document(
    store: &IdentityStore,
    report: &FrameReport,
    config: &Config,
    ledger: &LedgerConfig,
    backend: ExecutionBackend,
) -> Result<serde_json::Value, StoreError> {
    let identities = store.count_identities().await?;
    Ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "backend": backend.to_string(),
        "frame_source": config.frame_dir,
        "identities_enrolled": identities,
        "recognition_threshold": config.recognition_confidence,
        "debounce_minutes": ledger.debounce.num_minutes(),
        "day_cutoff_hour": ledger.day_cutoff_hour,
        "frames_processed": report.sequence,
        "liveness_locked": report.locked,
        "cooling_down": report.cooldown,
    }))
}

#[interface(name = "org.evoface.Attendance1")]
impl AttendanceService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let report = state.engine.latest_report();
        let document = status_document(
            &state.store,
            &report,
            &state.config,
            state.ledger.config(),
            state.backend,
        )
        .await
        .map_err(failed)?;
        Ok(document.to_string())
    }

    /// Latest per-frame report (gate status, box, progress, last outcome) as JSON.
    async fn last_report(&self) -> zbus::fdo::Result<String> {
        let report = self.state.lock().await.engine.latest_report();
        serde_json::to_string(&report).map_err(failed)
    }

    /// Most recent attendance events, newest first, as JSON.
    async fn recent_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        let ledger = self.state.lock().await.ledger.clone();
        let entries = ledger.recent(limit).await.map_err(failed)?;
        serde_json::to_string(&entries).map_err(failed)
    }

    /// Rebuild the in-memory identity table from the database.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        let engine = self.state.lock().await.engine.clone();
        let count = engine.reload().await.map_err(|e| {
            tracing::error!(error = %e, "reload failed");
            failed(e)
        })?;
        Ok(count as u32)
    }

    /// Enroll the face in `image_path` under `id` (the largest one when the
    /// image holds several). An empty `default_shift` stores no shift.
    async fn enroll(
        &self,
        id: &str,
        name: &str,
        image_path: &str,
        default_shift: &str,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(id, name, image_path, "enroll requested");
        if id.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity id is empty".into()));
        }

        let image = image::open(Path::new(image_path))
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("cannot read {image_path}: {e}")))?
            .to_rgb8();
        let shift = (!default_shift.is_empty()).then(|| default_shift.to_string());

        let engine = self.state.lock().await.engine.clone();
        engine
            .enroll(id.to_string(), name.to_string(), shift, image)
            .await
            .map_err(|e| {
                tracing::error!(id, error = %e, "enroll failed");
                failed(e)
            })?;
        Ok(true)
    }

    /// Remove an identity and its attendance history.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove requested");
        let engine = self.state.lock().await.engine.clone();
        let removed = engine.remove(id.to_string()).await.map_err(failed)?;
        if !removed {
            tracing::warn!(id, "remove: identity not found");
        }
        Ok(removed)
    }

    /// Record an event for business day `date` at clock `time`. Returns the
    /// stored timestamp.
    async fn backfill(&self, id: &str, date: &str, time: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, date, time, "backfill requested");
        let (date, time) = parse_backfill_args(date, time).map_err(zbus::fdo::Error::InvalidArgs)?;
        let ledger = self.state.lock().await.ledger.clone();
        let ts = ledger.backfill(id, date, time).await.map_err(|e| {
            tracing::error!(id, error = %e, "backfill failed");
            failed(e)
        })?;
        Ok(format_timestamp(&ts))
    }

    /// Record a live event for `id` chosen by an operator. Returns whether
    /// it was recorded and a message for display.
    async fn manual_check_in(&self, id: &str) -> zbus::fdo::Result<(bool, String)> {
        tracing::info!(id, "manual check-in requested");
        let engine = self.state.lock().await.engine.clone();
        engine.manual_check_in(id.to_string()).await.map_err(failed)
    }

    /// Clear liveness progress and any cooldown.
    async fn reset_liveness(&self) -> zbus::fdo::Result<()> {
        let engine = self.state.lock().await.engine.clone();
        engine.reset_gate().await.map_err(failed)
    }
}
