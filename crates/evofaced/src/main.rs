use std::sync::Arc;

use anyhow::{Context, Result};
use evoface_core::{
    available_backends, select_backend, ArcFaceExtractor, IdentityTable, MiniFasNetClassifier,
    ScrfdDetector, EMBEDDING_DIM,
};
use evoface_models::ModelRole;
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod evidence;
mod ledger;
mod source;
mod store;

use config::Config;
use dbus_interface::{AppState, AttendanceService};
use engine::{CycleOutcome, EngineHandle, Models, Pipeline, PipelineConfig};
use ledger::Ledger;
use source::{DirectorySource, FrameSource, NoSource};
use store::IdentityStore;

const BUS_NAME: &str = "org.evoface.Attendance1";
const OBJECT_PATH: &str = "/org/evoface/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("evofaced starting");

    let config = Config::load().context("failed to load configuration")?;

    evoface_models::verify_models_dir(&config.model_dir)
        .context("model files missing or corrupt; run `evoface setup`")?;

    let backend = select_backend(config.device_mode, &available_backends());
    tracing::info!(%backend, mode = ?config.device_mode, "execution backend selected");

    let models = Models {
        detector: Box::new(
            ScrfdDetector::load(
                &config.model_path(ModelRole::Detector),
                backend,
                config.detection_confidence,
            )
            .context("failed to load face detector")?,
        ),
        classifier: Box::new(
            MiniFasNetClassifier::load(&config.model_path(ModelRole::AntiSpoof), backend)
                .context("failed to load liveness classifier")?,
        ),
        extractor: Box::new(
            ArcFaceExtractor::load(&config.model_path(ModelRole::Recognizer), backend)
                .context("failed to load face recognizer")?,
        ),
    };
    tracing::info!("models loaded");

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = IdentityStore::open(&config.db_path)
        .await
        .context("failed to open attendance database")?;
    let records = store.load_all().await?;
    let table = IdentityTable::from_records(EMBEDDING_DIM, records)?;
    tracing::info!(identities = table.len(), db = %config.db_path.display(), "identity table loaded");

    let ledger = Ledger::new(store.clone(), config.ledger_config());
    let pipeline = Pipeline::new(
        models,
        table,
        store.clone(),
        ledger.clone(),
        PipelineConfig {
            gate: config.gate_config(),
            matcher: config.matcher_config(),
            evolution: config.evolution_config(),
            cooldown: config.cooldown(),
            evidence_dir: config.evidence_dir.clone(),
        },
        tokio::runtime::Handle::current(),
    );

    let source: Box<dyn FrameSource + Send> = match &config.frame_dir {
        Some(dir) => Box::new(DirectorySource::open(dir)?),
        None => {
            tracing::warn!("no frame source configured; serving control requests only");
            Box::new(NoSource)
        }
    };
    let engine = engine::spawn_engine(pipeline, source, config.frame_interval())?;
    tokio::spawn(log_outcomes(engine.clone()));

    let session_bus = config.session_bus;
    let state = Arc::new(Mutex::new(AppState {
        config,
        engine: engine.clone(),
        store,
        ledger,
        backend,
    }));
    let service = AttendanceService { state };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to acquire bus name {BUS_NAME}"))?;

    tracing::info!(bus = if session_bus { "session" } else { "system" }, "evofaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("evofaced shutting down");
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine did not acknowledge shutdown");
    }

    Ok(())
}

/// One log line per completed cycle.
async fn log_outcomes(engine: EngineHandle) {
    let mut outcomes = engine.subscribe();
    loop {
        match outcomes.recv().await {
            Ok(CycleOutcome::Accepted {
                identity_id,
                name,
                result,
                evolution,
                ..
            }) => tracing::info!(
                identity_id,
                name,
                fused = result.fused_score,
                evolution = ?evolution,
                "check-in accepted"
            ),
            Ok(CycleOutcome::Debounced {
                name,
                remaining_secs,
                ..
            }) => tracing::info!(name, remaining_secs, "already checked in"),
            Ok(other) => tracing::debug!(outcome = ?other, "cycle complete"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "outcome log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
