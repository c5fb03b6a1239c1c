use std::path::PathBuf;
use std::time::{Duration, Instant};

use evoface_core::align::align_face;
use evoface_core::{
    BoundingBox, Embedding, EmbeddingError, EmbeddingExtractor, EvolutionConfig, EvolutionPlan,
    FaceLandmarker, FeatureEvolution, GateConfig, GateStatus, IdentityMatcher, IdentityMeta,
    IdentityRecord, IdentityTable, LivenessClassifier, LivenessGate, MatchResult, MatcherConfig,
    ModelError, SkipReason, TableError,
};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::evidence::EvidenceSink;
use crate::ledger::{Diagnostics, Ledger, RecordOutcome};
use crate::source::FrameSource;
use crate::store::{IdentityStore, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("identity table error: {0}")]
    Table(#[from] TableError),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("face landmarks are degenerate, cannot align")]
    AlignmentFailed,
    #[error("unknown identity '{0}'")]
    UnknownIdentity(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The three external model collaborators, owned by the engine thread.
pub struct Models {
    pub detector: Box<dyn FaceLandmarker + Send>,
    pub classifier: Box<dyn LivenessClassifier + Send>,
    pub extractor: Box<dyn EmbeddingExtractor + Send>,
}

pub struct PipelineConfig {
    pub gate: GateConfig,
    pub matcher: MatcherConfig,
    pub evolution: EvolutionConfig,
    pub cooldown: Duration,
    pub evidence_dir: Option<PathBuf>,
}

/// What happened to the accepted identity's dynamic template.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "evolution", rename_all = "snake_case")]
pub enum EvolutionSummary {
    Skipped { reason: SkipReason },
    ColdStart,
    Blended,
    WriteFailed { error: String },
}

/// Result of one matching cycle (or a manual check-in).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    Accepted {
        identity_id: String,
        name: String,
        log_id: i64,
        result: MatchResult,
        evolution: EvolutionSummary,
    },
    Debounced {
        identity_id: String,
        name: String,
        remaining_secs: u64,
        result: MatchResult,
    },
    Rejected {
        result: MatchResult,
    },
    Ambiguous {
        result: MatchResult,
    },
    RecordFailed {
        identity_id: String,
        result: MatchResult,
        error: String,
    },
    /// The locked frame produced no usable embedding; the next frame retries.
    ExtractionFailed {
        error: String,
    },
    Manual {
        identity_id: String,
        name: String,
        outcome: RecordOutcome,
    },
}

/// Published for every processed frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub sequence: u64,
    /// Gate status; `None` while cooling down (the gate is not consulted).
    pub status: Option<GateStatus>,
    pub bbox: Option<BoundingBox>,
    pub locked: bool,
    pub progress: f32,
    pub cooldown: bool,
    pub outcome: Option<CycleOutcome>,
}

/// Sequential capture-to-ledger pipeline. Owns the gate, the identity table
/// and the cooldown clock; storage calls are driven through `rt`.
pub struct Pipeline {
    models: Models,
    gate: LivenessGate,
    matcher: IdentityMatcher,
    evolution: FeatureEvolution,
    table: IdentityTable,
    store: IdentityStore,
    ledger: Ledger,
    evidence: Option<EvidenceSink>,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
    sequence: u64,
    rt: Handle,
}

impl Pipeline {
    pub fn new(
        models: Models,
        table: IdentityTable,
        store: IdentityStore,
        ledger: Ledger,
        config: PipelineConfig,
        rt: Handle,
    ) -> Self {
        Self {
            models,
            gate: LivenessGate::new(config.gate),
            matcher: IdentityMatcher::new(config.matcher),
            evolution: FeatureEvolution::new(config.evolution),
            table,
            store,
            ledger,
            evidence: config.evidence_dir.map(EvidenceSink::new),
            cooldown: config.cooldown,
            cooldown_until: None,
            sequence: 0,
            rt,
        }
    }

    pub fn process_frame(&mut self, frame: &RgbImage, now: Instant) -> FrameReport {
        self.sequence += 1;

        if let Some(until) = self.cooldown_until {
            if now < until {
                return FrameReport {
                    sequence: self.sequence,
                    status: None,
                    bbox: None,
                    locked: self.gate.state().locked,
                    progress: self.gate.progress(),
                    cooldown: true,
                    outcome: None,
                };
            }
            self.cooldown_until = None;
            self.gate.reset();
            tracing::debug!("cooldown over, liveness gate re-armed");
        }

        let faces = match self.models.detector.detect(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                Vec::new()
            }
        };
        let gate = self
            .gate
            .process(frame, &faces, self.models.classifier.as_mut());

        let outcome = gate.face.as_ref().map(|face| self.run_cycle(face, now));
        FrameReport {
            sequence: self.sequence,
            status: Some(gate.status),
            bbox: gate.bbox,
            locked: gate.locked,
            progress: gate.progress,
            cooldown: false,
            outcome,
        }
    }

    fn run_cycle(&mut self, face: &RgbImage, now: Instant) -> CycleOutcome {
        let probe = match self.extract(face) {
            Ok(probe) => probe,
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed; frame skipped");
                return CycleOutcome::ExtractionFailed {
                    error: e.to_string(),
                };
            }
        };

        let result = self.matcher.identify(&self.table, &probe);
        let outcome = if result.ambiguous {
            tracing::info!(
                candidate = ?result.candidate_id,
                fused = result.fused_score,
                runner_up = ?result.runner_up_score,
                "ambiguous match, subject must re-present"
            );
            CycleOutcome::Ambiguous { result }
        } else if let Some(identity_id) = result.identity_id.clone() {
            self.commit(&identity_id, &probe, result, face)
        } else {
            tracing::info!(
                candidate = ?result.candidate_id,
                fused = result.fused_score,
                base = result.base_score,
                "no identity above recognition threshold"
            );
            CycleOutcome::Rejected { result }
        };

        self.enter_cooldown(now);
        outcome
    }

    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, EngineError> {
        let raw = self.models.extractor.extract(face)?;
        Ok(Embedding::from_raw(raw)?)
    }

    fn commit(
        &mut self,
        identity_id: &str,
        probe: &Embedding,
        result: MatchResult,
        face: &RgbImage,
    ) -> CycleOutcome {
        let name = self.display_name(identity_id);
        let wall = chrono::Local::now().naive_local();
        let evidence = self
            .evidence
            .as_ref()
            .and_then(|sink| sink.save(identity_id, wall, face));
        let diagnostics = Diagnostics {
            base_score: result.base_score,
            dynamic_score: result.dynamic_score,
        };
        if result.warning {
            tracing::warn!(
                identity_id,
                base = result.base_score,
                "accepted match diverges from enrollment template"
            );
        }

        let recorded = self.rt.block_on(self.ledger.record(
            identity_id,
            result.fused_score,
            diagnostics,
            evidence.clone(),
            wall,
        ));

        match recorded {
            Ok(RecordOutcome::Accepted { log_id }) => {
                let evolution = self.evolve(identity_id, probe, &result);
                CycleOutcome::Accepted {
                    identity_id: identity_id.to_string(),
                    name,
                    log_id,
                    result,
                    evolution,
                }
            }
            Ok(RecordOutcome::Debounced { remaining_secs }) => {
                self.discard_evidence(evidence.as_deref());
                CycleOutcome::Debounced {
                    identity_id: identity_id.to_string(),
                    name,
                    remaining_secs,
                    result,
                }
            }
            Err(e) => {
                tracing::error!(identity_id, error = %e, "attendance write failed");
                self.discard_evidence(evidence.as_deref());
                CycleOutcome::RecordFailed {
                    identity_id: identity_id.to_string(),
                    result,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Persist the planned template first; the table row is swapped only
    /// once the store has it.
    fn evolve(
        &mut self,
        identity_id: &str,
        probe: &Embedding,
        result: &MatchResult,
    ) -> EvolutionSummary {
        let plan = self.evolution.plan(&self.table, identity_id, probe, result);
        let (updated, summary) = match plan {
            EvolutionPlan::Skip(reason) => return EvolutionSummary::Skipped { reason },
            EvolutionPlan::ColdStart(e) => (e, EvolutionSummary::ColdStart),
            EvolutionPlan::Blend(e) => (e, EvolutionSummary::Blended),
        };

        match self.rt.block_on(self.store.update_dynamic(identity_id, &updated)) {
            Ok(true) => {}
            Ok(false) => {
                return EvolutionSummary::Skipped {
                    reason: SkipReason::UnknownIdentity,
                }
            }
            Err(e) => {
                tracing::error!(identity_id, error = %e, "dynamic template write failed");
                return EvolutionSummary::WriteFailed {
                    error: e.to_string(),
                };
            }
        }
        if let Err(e) = self.table.set_dynamic(identity_id, &updated) {
            return EvolutionSummary::WriteFailed {
                error: e.to_string(),
            };
        }
        tracing::debug!(identity_id, summary = ?summary, "dynamic template updated");
        summary
    }

    fn enter_cooldown(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.cooldown);
    }

    fn discard_evidence(&self, evidence: Option<&str>) {
        if let (Some(sink), Some(path)) = (&self.evidence, evidence) {
            sink.discard(path);
        }
    }

    fn display_name(&self, identity_id: &str) -> String {
        self.table
            .row_of(identity_id)
            .map(|row| self.table.meta(row).name.clone())
            .unwrap_or_else(|| identity_id.to_string())
    }

    // ── Control operations ───────────────────────────────────────────────────

    /// Rebuild the identity table from the store.
    pub fn reload(&mut self) -> Result<usize, EngineError> {
        let records = self.rt.block_on(self.store.load_all())?;
        self.table.reload(records)?;
        tracing::info!(identities = self.table.len(), "identity table reloaded");
        Ok(self.table.len())
    }

    /// Enroll the face of a still image as `id`. With several faces the one
    /// with the largest box is used.
    pub fn enroll(
        &mut self,
        id: String,
        name: String,
        default_shift: Option<String>,
        image: &RgbImage,
    ) -> Result<(), EngineError> {
        let faces = self.models.detector.detect(image)?;
        let face = faces
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
            .ok_or(EngineError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::info!(
                faces = faces.len(),
                area = face.bbox.area(),
                "enrollment image has several faces; using the largest"
            );
        }
        let aligned = align_face(image, &face.landmarks).ok_or(EngineError::AlignmentFailed)?;
        let base = self.extract(&aligned)?;

        let meta = IdentityMeta {
            id,
            name,
            default_shift,
        };
        self.rt.block_on(self.store.register_identity(&meta, &base))?;
        tracing::info!(identity_id = %meta.id, confidence = face.confidence, "identity enrolled");
        self.table.upsert_row(IdentityRecord {
            meta,
            base,
            dynamic: None,
        })?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<bool, EngineError> {
        let removed = self.rt.block_on(self.store.remove_identity(id))?;
        self.table.remove_row(id);
        if removed {
            tracing::info!(identity_id = id, "identity removed");
        }
        Ok(removed)
    }

    pub fn reset_gate(&mut self) {
        self.gate.reset();
        self.cooldown_until = None;
    }

    /// Record an event for an identity chosen outside the matcher, then cool down.
    pub fn manual_check_in(&mut self, id: &str, now: Instant) -> Result<CycleOutcome, EngineError> {
        if self.table.row_of(id).is_none() {
            return Err(EngineError::UnknownIdentity(id.to_string()));
        }
        let wall = chrono::Local::now().naive_local();
        let outcome = self.rt.block_on(self.ledger.record(
            id,
            1.0,
            Diagnostics::default(),
            Some("manual".to_string()),
            wall,
        ))?;
        self.enter_cooldown(now);
        Ok(CycleOutcome::Manual {
            identity_id: id.to_string(),
            name: self.display_name(id),
            outcome,
        })
    }
}

// ── Engine thread ────────────────────────────────────────────────────────────

enum EngineRequest {
    Reload {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Enroll {
        id: String,
        name: String,
        default_shift: Option<String>,
        image: RgbImage,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    ResetGate {
        reply: oneshot::Sender<()>,
    },
    ManualCheckIn {
        id: String,
        reply: oneshot::Sender<Result<(bool, String), EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    reports: watch::Receiver<FrameReport>,
    outcomes: broadcast::Sender<CycleOutcome>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn reload(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Reload { reply }).await?
    }

    pub async fn enroll(
        &self,
        id: String,
        name: String,
        default_shift: Option<String>,
        image: RgbImage,
    ) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            id,
            name,
            default_shift,
            image,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Remove { id, reply }).await?
    }

    pub async fn reset_gate(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::ResetGate { reply }).await
    }

    /// Returns whether the event was recorded, with a human-readable message.
    pub async fn manual_check_in(&self, id: String) -> Result<(bool, String), EngineError> {
        self.request(|reply| EngineRequest::ManualCheckIn { id, reply })
            .await?
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply }).await
    }

    /// Most recent frame report (latest wins).
    pub fn latest_report(&self) -> FrameReport {
        self.reports.borrow().clone()
    }

    /// Receive every completed cycle outcome.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleOutcome> {
        self.outcomes.subscribe()
    }
}

/// Spawn the pipeline on a dedicated OS thread.
///
/// Frames are pulled from `source` at most every `frame_interval`; control
/// requests are drained between frames. Once the source is exhausted the
/// thread keeps serving requests until shutdown.
pub fn spawn_engine(
    mut pipeline: Pipeline,
    mut source: Box<dyn FrameSource + Send>,
    frame_interval: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let (report_tx, report_rx) = watch::channel(FrameReport::default());
    let (outcome_tx, _) = broadcast::channel::<CycleOutcome>(64);
    let outcomes = outcome_tx.clone();

    std::thread::Builder::new()
        .name("evoface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut streaming = true;
            loop {
                loop {
                    match rx.try_recv() {
                        Ok(req) => {
                            if !handle_request(&mut pipeline, req, &outcome_tx) {
                                tracing::info!("engine thread exiting");
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }

                if !streaming {
                    let keep_running = match rx.blocking_recv() {
                        Some(req) => handle_request(&mut pipeline, req, &outcome_tx),
                        None => false,
                    };
                    if !keep_running {
                        tracing::info!("engine thread exiting");
                        return;
                    }
                    continue;
                }

                let started = Instant::now();
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        let report = pipeline.process_frame(&frame, started);
                        if let Some(outcome) = &report.outcome {
                            let _ = outcome_tx.send(outcome.clone());
                        }
                        report_tx.send_replace(report);
                    }
                    Ok(None) => {
                        tracing::info!("frame source exhausted; serving control requests only");
                        streaming = false;
                        continue;
                    }
                    Err(e) => tracing::warn!(error = %e, "frame skipped"),
                }
                if let Some(rest) = frame_interval.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        reports: report_rx,
        outcomes,
    })
}

/// Apply one control request. Returns false on shutdown.
fn handle_request(
    pipeline: &mut Pipeline,
    req: EngineRequest,
    outcomes: &broadcast::Sender<CycleOutcome>,
) -> bool {
    match req {
        EngineRequest::Reload { reply } => {
            let _ = reply.send(pipeline.reload());
        }
        EngineRequest::Enroll {
            id,
            name,
            default_shift,
            image,
            reply,
        } => {
            let _ = reply.send(pipeline.enroll(id, name, default_shift, &image));
        }
        EngineRequest::Remove { id, reply } => {
            let _ = reply.send(pipeline.remove(&id));
        }
        EngineRequest::ResetGate { reply } => {
            pipeline.reset_gate();
            let _ = reply.send(());
        }
        EngineRequest::ManualCheckIn { id, reply } => {
            let result = pipeline.manual_check_in(&id, Instant::now()).map(|outcome| {
                let reply = match &outcome {
                    CycleOutcome::Manual { name, outcome, .. } => {
                        (outcome.accepted(), outcome.message(name))
                    }
                    _ => (false, String::new()),
                };
                let _ = outcomes.send(outcome);
                reply
            });
            let _ = reply.send(result);
        }
        EngineRequest::Shutdown { reply } => {
            let _ = reply.send(());
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::source::NoSource;
    use crate::store::tests::{meta, unit};
    use evoface_core::align::ARCFACE_TEMPLATE;
    use evoface_core::{DetectedFace, EMBEDDING_DIM};
    use std::collections::VecDeque;
    use std::path::Path;
    use tokio::runtime::Runtime;

    struct OneFace;

    impl FaceLandmarker for OneFace {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<DetectedFace>, ModelError> {
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x1: 10.0,
                    y1: 10.0,
                    x2: 90.0,
                    y2: 90.0,
                },
                landmarks: ARCFACE_TEMPLATE.map(|(x, y)| (x * 0.6 + 15.0, y * 0.6 + 15.0)),
                confidence: 0.99,
            }])
        }
    }

    /// A small face with degenerate keypoints next to the usable one.
    struct TwoFaces;

    impl FaceLandmarker for TwoFaces {
        fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ModelError> {
            let mut faces = OneFace.detect(frame)?;
            faces.insert(
                0,
                DetectedFace {
                    bbox: BoundingBox {
                        x1: 0.0,
                        y1: 0.0,
                        x2: 8.0,
                        y2: 8.0,
                    },
                    landmarks: [(4.0, 4.0); 5],
                    confidence: 0.99,
                },
            );
            Ok(faces)
        }
    }

    struct NoFaces;

    impl FaceLandmarker for NoFaces {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<DetectedFace>, ModelError> {
            Ok(Vec::new())
        }
    }

    struct AlwaysLive;

    impl LivenessClassifier for AlwaysLive {
        fn score(&mut self, _face: &RgbImage) -> Result<f32, ModelError> {
            Ok(0.99)
        }
    }

    /// Replays scripted outputs (`None` = failure); the last entry repeats.
    struct Scripted {
        outputs: VecDeque<Option<Vec<f32>>>,
    }

    impl EmbeddingExtractor for Scripted {
        fn extract(&mut self, _aligned: &RgbImage) -> Result<Vec<f32>, ModelError> {
            let next = if self.outputs.len() > 1 {
                self.outputs.pop_front().flatten()
            } else {
                self.outputs.front().cloned().flatten()
            };
            next.ok_or_else(|| ModelError::Inference("scripted failure".into()))
        }
    }

    /// Opposite of Alice: every enrolled score is clearly negative.
    fn stranger() -> Vec<f32> {
        unit(1).as_slice().iter().map(|v| -v).collect()
    }

    fn harness(outputs: Vec<Option<Vec<f32>>>) -> (Runtime, Pipeline, IdentityStore) {
        let rt = Runtime::new().unwrap();
        let store = rt
            .block_on(IdentityStore::open(Path::new(":memory:")))
            .unwrap();
        rt.block_on(store.register_identity(&meta("e01", "Alice"), &unit(1)))
            .unwrap();
        rt.block_on(store.register_identity(&meta("e02", "Bob"), &unit(2)))
            .unwrap();
        let records = rt.block_on(store.load_all()).unwrap();
        let table = IdentityTable::from_records(EMBEDDING_DIM, records).unwrap();

        let models = Models {
            detector: Box::new(OneFace),
            classifier: Box::new(AlwaysLive),
            extractor: Box::new(Scripted {
                outputs: outputs.into(),
            }),
        };
        let config = PipelineConfig {
            gate: GateConfig {
                required_pass_frames: 3,
                stability_enabled: false,
                ..GateConfig::default()
            },
            matcher: MatcherConfig::default(),
            evolution: EvolutionConfig::default(),
            cooldown: Duration::from_secs(1),
            evidence_dir: None,
        };
        let ledger = Ledger::new(store.clone(), LedgerConfig::default());
        let pipeline = Pipeline::new(models, table, store.clone(), ledger, config, rt.handle().clone());
        (rt, pipeline, store)
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(100, 100, image::Rgb([128, 128, 128]))
    }

    /// Feed frames 10 ms apart starting at `start` until one carries an outcome.
    fn run_until_outcome(p: &mut Pipeline, start: Instant, max: u32) -> (CycleOutcome, Instant) {
        for i in 0..max {
            let now = start + Duration::from_millis(10 * i as u64);
            if let Some(outcome) = p.process_frame(&frame(), now).outcome {
                return (outcome, now);
            }
        }
        panic!("no outcome within {max} frames");
    }

    #[test]
    fn test_accept_records_and_cold_starts_dynamic() {
        let (rt, mut p, store) = harness(vec![Some(unit(1).into_vec())]);
        let start = Instant::now();

        let first = p.process_frame(&frame(), start);
        assert!(first.outcome.is_none());
        assert_eq!(first.status, Some(GateStatus::Tracking));

        let (outcome, _) = run_until_outcome(&mut p, start, 5);
        let CycleOutcome::Accepted {
            identity_id,
            evolution,
            result,
            ..
        } = outcome
        else {
            panic!("expected accept");
        };
        assert_eq!(identity_id, "e01");
        assert!((result.fused_score - 1.0).abs() < 1e-5);
        assert_eq!(evolution, EvolutionSummary::ColdStart);

        let row = p.table.row_of("e01").unwrap();
        assert!(p.table.has_dynamic(row));
        let stored = rt.block_on(store.get_identity("e01")).unwrap().unwrap();
        assert!(stored.dynamic.is_some());
        assert_eq!(rt.block_on(store.recent_logs(10)).unwrap().len(), 1);
    }

    #[test]
    fn test_cooldown_suppresses_then_rearms_gate() {
        let (_rt, mut p, _store) = harness(vec![Some(unit(1).into_vec())]);
        let start = Instant::now();
        let (_, accepted_at) = run_until_outcome(&mut p, start, 5);

        let quiet = p.process_frame(&frame(), accepted_at + Duration::from_millis(500));
        assert!(quiet.cooldown);
        assert!(quiet.outcome.is_none());
        assert!(quiet.locked, "gate is not reset during cooldown");

        let rearmed = p.process_frame(&frame(), accepted_at + Duration::from_millis(1100));
        assert!(!rearmed.cooldown);
        assert!(!rearmed.locked);
        assert!((rearmed.progress - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_second_presence_is_debounced() {
        let (rt, mut p, store) = harness(vec![Some(unit(1).into_vec())]);
        let start = Instant::now();
        let (_, accepted_at) = run_until_outcome(&mut p, start, 5);

        let (outcome, _) = run_until_outcome(&mut p, accepted_at + Duration::from_secs(2), 5);
        let CycleOutcome::Debounced { remaining_secs, .. } = outcome else {
            panic!("expected debounce");
        };
        assert!(remaining_secs > 290 && remaining_secs <= 300);
        assert_eq!(rt.block_on(store.recent_logs(10)).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_face_rejected_with_diagnostics() {
        let (rt, mut p, store) = harness(vec![Some(stranger())]);
        let (outcome, accepted_at) = run_until_outcome(&mut p, Instant::now(), 5);
        let CycleOutcome::Rejected { result } = outcome else {
            panic!("expected reject");
        };
        assert!(result.identity_id.is_none());
        assert!(result.candidate_id.is_some());
        assert!(rt.block_on(store.recent_logs(10)).unwrap().is_empty());

        let next = p.process_frame(&frame(), accepted_at + Duration::from_millis(10));
        assert!(next.cooldown);
    }

    #[test]
    fn test_extraction_failure_skips_frame_without_cooldown() {
        let (_rt, mut p, _store) = harness(vec![None, Some(unit(2).into_vec())]);
        let (outcome, failed_at) = run_until_outcome(&mut p, Instant::now(), 5);
        assert!(matches!(outcome, CycleOutcome::ExtractionFailed { .. }));

        let retry = p.process_frame(&frame(), failed_at + Duration::from_millis(10));
        assert!(!retry.cooldown);
        assert!(retry.locked);
        assert!(matches!(
            retry.outcome,
            Some(CycleOutcome::Accepted { ref identity_id, .. }) if identity_id == "e02"
        ));
    }

    #[test]
    fn test_enroll_remove_and_reload() {
        let (rt, mut p, store) = harness(vec![Some(unit(7).into_vec())]);
        p.enroll("e03".into(), "Carol".into(), Some("night".into()), &frame())
            .unwrap();
        assert_eq!(p.table.len(), 3);
        let stored = rt.block_on(store.get_identity("e03")).unwrap().unwrap();
        assert_eq!(stored.meta.default_shift.as_deref(), Some("night"));

        assert!(p.remove("e01").unwrap());
        assert!(p.table.row_of("e01").is_none());
        assert!(!p.remove("e01").unwrap());

        assert_eq!(p.reload().unwrap(), 2);
        assert!(p.table.row_of("e03").is_some());
    }

    #[test]
    fn test_enroll_uses_largest_face() {
        let (rt, mut p, store) = harness(vec![Some(unit(7).into_vec())]);
        p.models.detector = Box::new(TwoFaces);
        p.enroll("e03".into(), "Carol".into(), None, &frame()).unwrap();
        assert!(p.table.row_of("e03").is_some());
        assert!(rt.block_on(store.get_identity("e03")).unwrap().is_some());

        p.models.detector = Box::new(NoFaces);
        assert!(matches!(
            p.enroll("e04".into(), "Dan".into(), None, &frame()),
            Err(EngineError::NoFaceDetected)
        ));
        assert!(p.table.row_of("e04").is_none());
    }

    #[test]
    fn test_manual_check_in_records_and_cools_down() {
        let (rt, mut p, store) = harness(vec![Some(stranger())]);
        let now = Instant::now();
        let CycleOutcome::Manual { outcome, name, .. } = p.manual_check_in("e02", now).unwrap() else {
            panic!("expected manual outcome");
        };
        assert!(outcome.accepted());
        assert_eq!(name, "Bob");
        let logs = rt.block_on(store.recent_logs(10)).unwrap();
        assert_eq!(logs[0].evidence_ref.as_deref(), Some("manual"));
        assert!(p.process_frame(&frame(), now + Duration::from_millis(10)).cooldown);

        assert!(matches!(
            p.manual_check_in("ghost", now),
            Err(EngineError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_reset_gate_clears_cooldown() {
        let (_rt, mut p, _store) = harness(vec![Some(unit(1).into_vec())]);
        let (_, accepted_at) = run_until_outcome(&mut p, Instant::now(), 5);
        p.reset_gate();
        let report = p.process_frame(&frame(), accepted_at + Duration::from_millis(10));
        assert!(!report.cooldown);
        assert!(!report.locked);
    }

    #[test]
    fn test_engine_handle_roundtrip() {
        let (rt, p, _store) = harness(vec![Some(unit(1).into_vec())]);
        let handle = spawn_engine(p, Box::new(NoSource), Duration::from_millis(1)).unwrap();

        rt.block_on(async {
            assert_eq!(handle.reload().await.unwrap(), 2);
            let mut events = handle.subscribe();
            let (accepted, message) = handle.manual_check_in("e01".into()).await.unwrap();
            assert!(accepted);
            assert!(message.contains("Alice"));
            assert!(matches!(events.recv().await.unwrap(), CycleOutcome::Manual { .. }));

            let (accepted, message) = handle.manual_check_in("e01".into()).await.unwrap();
            assert!(!accepted);
            assert!(message.contains("try again"));

            assert!(handle.remove("e02".into()).await.unwrap());
            handle.reset_gate().await.unwrap();
            handle.shutdown().await.unwrap();
            assert!(matches!(handle.reload().await, Err(EngineError::ChannelClosed)));
        });
    }
}
