//! Per-frame liveness gate.
//!
//! The gate turns raw per-frame signals into a sticky locked/unlocked
//! decision. A subject must produce `required_pass_frames` consecutive
//! passing frames; a single failing frame, a missing face, a second face or a
//! face that is too small erases all progress. Once locked the gate stays
//! locked until [`LivenessGate::reset`].
//!
//! Two signals feed each frame:
//!
//! - **Landmark stability** (optional, no model): a printed photograph yields
//!   near-identical eye landmarks across consecutive frames, while a live
//!   subject shows involuntary micro-movement. A suspiciously static window
//!   fails the frame without calling the classifier.
//! - **Texture classifier**: the anti-spoof model's live probability for the
//!   padded face region, compared against `texture_threshold`.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, static images, most screen replays
//!   (texture model).
//! - **Does not block:** high-quality 3D masks or adversarial displays tuned
//!   against the classifier.

use std::collections::VecDeque;

use image::RgbImage;
use serde::Serialize;

use crate::align::align_face;
use crate::antispoof::LivenessClassifier;
use crate::types::{BoundingBox, DetectedFace, Landmarks5};

/// Default minimum eye displacement (in pixels) below which frames are
/// considered suspiciously static. Even a steady gaze produces >1.0 px of
/// involuntary eye movement between frames at 30 fps on a 640×480 sensor; a
/// printed photo produces <0.3 px (sensor noise only).
pub const DEFAULT_MIN_EYE_DISPLACEMENT: f32 = 0.8;

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Consecutive passing frames needed to lock.
    pub required_pass_frames: u32,
    /// Minimum classifier live probability for a passing frame.
    pub texture_threshold: f32,
    /// Minimum face box area as a fraction of the frame area.
    pub min_face_ratio: f32,
    /// Padding around the face box for the classifier crop, per side.
    pub padding_ratio: f32,
    pub stability_enabled: bool,
    pub stability_min_displacement: f32,
    /// Number of recent frames the stability check looks at.
    pub stability_window: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_pass_frames: 10,
            texture_threshold: 0.95,
            min_face_ratio: 0.4,
            padding_ratio: 0.6,
            stability_enabled: true,
            stability_min_displacement: DEFAULT_MIN_EYE_DISPLACEMENT,
            stability_window: 5,
        }
    }
}

/// Per-frame status reported alongside the gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    NoFace,
    MultipleFaces,
    FaceTooSmall,
    /// Exactly one adequately sized face is being tracked.
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    Searching,
    Accumulating,
    Locked,
}

/// Mutable gate state, scoped to one orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessState {
    pub pass_count: u32,
    pub locked: bool,
}

/// Gate output for one frame.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub status: GateStatus,
    pub bbox: Option<BoundingBox>,
    pub locked: bool,
    /// pass_count / required, in [0, 1].
    pub progress: f32,
    /// Aligned 112×112 crop, present only when locked.
    pub face: Option<RgbImage>,
}

pub struct LivenessGate {
    config: GateConfig,
    state: LivenessState,
    recent_landmarks: VecDeque<Landmarks5>,
}

impl LivenessGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: LivenessState::default(),
            recent_landmarks: VecDeque::new(),
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn phase(&self) -> GatePhase {
        match self.state {
            LivenessState { locked: true, .. } => GatePhase::Locked,
            LivenessState { pass_count: 0, .. } => GatePhase::Searching,
            _ => GatePhase::Accumulating,
        }
    }

    pub fn progress(&self) -> f32 {
        if self.config.required_pass_frames == 0 {
            return if self.state.locked { 1.0 } else { 0.0 };
        }
        (self.state.pass_count as f32 / self.config.required_pass_frames as f32).min(1.0)
    }

    /// Clear all progress and unlock.
    pub fn reset(&mut self) {
        self.state = LivenessState::default();
        self.recent_landmarks.clear();
    }

    /// Feed one frame's pass/fail signal. Returns the locked flag.
    pub fn observe(&mut self, passed: bool) -> bool {
        if self.state.locked {
            return true;
        }
        if passed {
            self.state.pass_count += 1;
        } else {
            self.state.pass_count = 0;
        }
        if self.state.pass_count >= self.config.required_pass_frames {
            self.state.pass_count = self.config.required_pass_frames;
            self.state.locked = true;
            tracing::info!(frames = self.state.pass_count, "liveness locked");
        }
        self.state.locked
    }

    /// Run the gate on one frame given the detector's faces.
    pub fn process(
        &mut self,
        frame: &RgbImage,
        faces: &[DetectedFace],
        classifier: &mut dyn LivenessClassifier,
    ) -> GateReport {
        let face = match faces {
            [] => return self.reject(GateStatus::NoFace, None),
            [face] => face,
            _ => return self.reject(GateStatus::MultipleFaces, None),
        };

        let frame_area = frame.width() as f32 * frame.height() as f32;
        let ratio = if frame_area > 0.0 {
            face.bbox.area() / frame_area
        } else {
            0.0
        };
        if ratio < self.config.min_face_ratio {
            return self.reject(GateStatus::FaceTooSmall, Some(face.bbox));
        }

        if !self.state.locked {
            let passed = self.stability_passes(&face.landmarks)
                && self.texture_passes(frame, &face.bbox, classifier);
            self.observe(passed);
        }

        let aligned = if self.state.locked {
            let aligned = align_face(frame, &face.landmarks);
            if aligned.is_none() {
                tracing::debug!("liveness: alignment degenerate, no crop this frame");
            }
            aligned
        } else {
            None
        };

        GateReport {
            status: GateStatus::Tracking,
            bbox: Some(face.bbox),
            locked: self.state.locked,
            progress: self.progress(),
            face: aligned,
        }
    }

    fn reject(&mut self, status: GateStatus, bbox: Option<BoundingBox>) -> GateReport {
        self.reset();
        GateReport {
            status,
            bbox,
            locked: false,
            progress: 0.0,
            face: None,
        }
    }

    fn stability_passes(&mut self, landmarks: &Landmarks5) -> bool {
        if !self.config.stability_enabled {
            return true;
        }
        self.recent_landmarks.push_back(*landmarks);
        while self.recent_landmarks.len() > self.config.stability_window.max(2) {
            self.recent_landmarks.pop_front();
        }
        let window: Vec<Landmarks5> = self.recent_landmarks.iter().copied().collect();
        let result = check_landmark_stability(&window, Some(self.config.stability_min_displacement));
        if !result.is_live {
            tracing::debug!(
                displacement = result.mean_eye_displacement,
                pairs = result.frame_pairs_analysed,
                "liveness: landmarks static"
            );
        }
        result.is_live
    }

    fn texture_passes(
        &self,
        frame: &RgbImage,
        bbox: &BoundingBox,
        classifier: &mut dyn LivenessClassifier,
    ) -> bool {
        let roi = bbox.padded(self.config.padding_ratio, frame.width(), frame.height());
        let x = roi.x1.floor() as u32;
        let y = roi.y1.floor() as u32;
        let w = (roi.x2.ceil() as u32).saturating_sub(x);
        let h = (roi.y2.ceil() as u32).saturating_sub(y);
        if w == 0 || h == 0 {
            return false;
        }
        let crop = image::imageops::crop_imm(frame, x, y, w, h).to_image();
        match classifier.score(&crop) {
            Ok(score) => score >= self.config.texture_threshold,
            Err(e) => {
                tracing::warn!(error = %e, "liveness classifier failed; counting frame as fail");
                false
            }
        }
    }
}

/// Result of a landmark stability liveness check.
#[derive(Debug, Clone)]
pub struct StabilityResult {
    /// Whether the frames passed the liveness check (true = likely live).
    pub is_live: bool,
    /// Mean Euclidean displacement of eye landmarks across consecutive frame pairs.
    pub mean_eye_displacement: f32,
    /// Number of frame pairs analysed.
    pub frame_pairs_analysed: usize,
}

/// Check whether a sequence of detected facial landmarks exhibits sufficient
/// eye movement to indicate a live subject.
///
/// Indices 0 and 1 of each landmark set are the left and right eye centres.
/// Returns `is_live = true` if fewer than 2 frames are provided, since the
/// check requires at least one frame pair.
pub fn check_landmark_stability(
    landmark_sequence: &[Landmarks5],
    min_displacement: Option<f32>,
) -> StabilityResult {
    let threshold = min_displacement.unwrap_or(DEFAULT_MIN_EYE_DISPLACEMENT);

    if landmark_sequence.len() < 2 {
        return StabilityResult {
            is_live: true,
            mean_eye_displacement: 0.0,
            frame_pairs_analysed: 0,
        };
    }

    let eye_shift = |prev: (f32, f32), curr: (f32, f32)| {
        let dx = curr.0 - prev.0;
        let dy = curr.1 - prev.1;
        (dx * dx + dy * dy).sqrt()
    };

    let pair_count = landmark_sequence.len() - 1;
    let total: f32 = landmark_sequence
        .windows(2)
        .map(|pair| (eye_shift(pair[0][0], pair[1][0]) + eye_shift(pair[0][1], pair[1][1])) / 2.0)
        .sum();
    let mean = total / pair_count as f32;

    StabilityResult {
        is_live: mean >= threshold,
        mean_eye_displacement: mean,
        frame_pairs_analysed: pair_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelError;

    /// Classifier that replays a fixed sequence of scores.
    struct Scripted {
        scores: Vec<f32>,
        calls: usize,
    }

    impl Scripted {
        fn new(scores: Vec<f32>) -> Self {
            Self { scores, calls: 0 }
        }
    }

    impl LivenessClassifier for Scripted {
        fn score(&mut self, _face: &RgbImage) -> Result<f32, ModelError> {
            let s = self.scores.get(self.calls).copied().unwrap_or(0.0);
            self.calls += 1;
            Ok(s)
        }
    }

    struct Failing;

    impl LivenessClassifier for Failing {
        fn score(&mut self, _face: &RgbImage) -> Result<f32, ModelError> {
            Err(ModelError::Inference("boom".into()))
        }
    }

    fn landmarks_with_eyes(left: (f32, f32), right: (f32, f32)) -> Landmarks5 {
        [left, right, (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)]
    }

    /// A face filling most of a 100×100 frame with plausible keypoints.
    fn face(jitter: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x1: 10.0, y1: 10.0, x2: 90.0, y2: 90.0 },
            landmarks: [
                (35.0 + jitter, 40.0),
                (65.0 + jitter, 40.0),
                (50.0, 55.0),
                (38.0, 72.0),
                (62.0, 72.0),
            ],
            confidence: 0.99,
        }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(100, 100, image::Rgb([120, 110, 100]))
    }

    fn no_stability() -> GateConfig {
        GateConfig {
            stability_enabled: false,
            ..GateConfig::default()
        }
    }

    #[test]
    fn test_ten_passes_lock() {
        let mut gate = LivenessGate::new(GateConfig::default());
        for i in 0..9 {
            assert!(!gate.observe(true), "locked early at {i}");
        }
        assert!(gate.observe(true));
        assert_eq!(gate.phase(), GatePhase::Locked);
        assert_eq!(gate.state().pass_count, 10);
    }

    #[test]
    fn test_failure_erases_progress() {
        let mut gate = LivenessGate::new(GateConfig::default());
        let seq = [vec![true; 4], vec![false], vec![true; 9]].concat();
        for passed in seq {
            gate.observe(passed);
        }
        assert!(!gate.state().locked);
        assert_eq!(gate.state().pass_count, 9);
        assert!(gate.observe(true));
    }

    #[test]
    fn test_lock_is_sticky_and_clamped() {
        let mut gate = LivenessGate::new(GateConfig::default());
        for _ in 0..10 {
            gate.observe(true);
        }
        assert!(gate.observe(false));
        assert!(gate.observe(true));
        assert_eq!(gate.state().pass_count, 10);
        assert_eq!(gate.progress(), 1.0);

        gate.reset();
        assert_eq!(gate.state(), LivenessState::default());
        assert_eq!(gate.phase(), GatePhase::Searching);
    }

    #[test]
    fn test_process_locks_and_emits_crop() {
        let mut gate = LivenessGate::new(no_stability());
        let mut cls = Scripted::new(vec![0.99; 10]);
        let img = frame();
        for i in 0..9 {
            let r = gate.process(&img, &[face(0.0)], &mut cls);
            assert_eq!(r.status, GateStatus::Tracking);
            assert!(!r.locked);
            assert!(r.face.is_none());
            assert!((r.progress - (i + 1) as f32 / 10.0).abs() < 1e-6);
        }
        let r = gate.process(&img, &[face(0.0)], &mut cls);
        assert!(r.locked);
        let crop = r.face.expect("crop when locked");
        assert_eq!(crop.dimensions(), (112, 112));

        // Locked frames no longer consult the classifier.
        let calls = cls.calls;
        gate.process(&img, &[face(0.0)], &mut cls);
        assert_eq!(cls.calls, calls);
    }

    #[test]
    fn test_low_texture_score_resets() {
        let mut gate = LivenessGate::new(no_stability());
        let mut cls = Scripted::new(vec![0.99, 0.99, 0.99, 0.5, 0.99]);
        let img = frame();
        for _ in 0..4 {
            gate.process(&img, &[face(0.0)], &mut cls);
        }
        assert_eq!(gate.state().pass_count, 0);
        gate.process(&img, &[face(0.0)], &mut cls);
        assert_eq!(gate.state().pass_count, 1);
    }

    #[test]
    fn test_face_conditions_reset_gate() {
        let img = frame();
        let mut cls = Scripted::new(vec![0.99; 100]);

        let mut gate = LivenessGate::new(no_stability());
        gate.process(&img, &[face(0.0)], &mut cls);
        let r = gate.process(&img, &[], &mut cls);
        assert_eq!(r.status, GateStatus::NoFace);
        assert_eq!(gate.state().pass_count, 0);

        gate.process(&img, &[face(0.0)], &mut cls);
        let r = gate.process(&img, &[face(0.0), face(1.0)], &mut cls);
        assert_eq!(r.status, GateStatus::MultipleFaces);
        assert_eq!(gate.state().pass_count, 0);

        gate.process(&img, &[face(0.0)], &mut cls);
        let mut small = face(0.0);
        small.bbox = BoundingBox { x1: 0.0, y1: 0.0, x2: 20.0, y2: 20.0 };
        let r = gate.process(&img, &[small], &mut cls);
        assert_eq!(r.status, GateStatus::FaceTooSmall);
        assert!(r.bbox.is_some());
        assert_eq!(gate.state().pass_count, 0);
    }

    #[test]
    fn test_classifier_error_counts_as_fail() {
        let mut gate = LivenessGate::new(no_stability());
        gate.observe(true);
        let r = gate.process(&frame(), &[face(0.0)], &mut Failing);
        assert_eq!(r.status, GateStatus::Tracking);
        assert_eq!(gate.state().pass_count, 0);
    }

    #[test]
    fn test_static_landmarks_block_lock() {
        let mut gate = LivenessGate::new(GateConfig::default());
        let mut cls = Scripted::new(vec![0.99; 100]);
        let img = frame();
        for _ in 0..20 {
            gate.process(&img, &[face(0.0)], &mut cls);
        }
        assert!(!gate.state().locked);

        // Alternating eye positions look like natural movement.
        gate.reset();
        for i in 0..10 {
            let jitter = if i % 2 == 0 { 0.0 } else { 1.5 };
            gate.process(&img, &[face(jitter)], &mut cls);
        }
        assert!(gate.state().locked);
    }

    #[test]
    fn test_stability_single_frame_passes() {
        let seq = vec![landmarks_with_eyes((100.0, 50.0), (140.0, 50.0))];
        let result = check_landmark_stability(&seq, None);
        assert!(result.is_live);
        assert_eq!(result.frame_pairs_analysed, 0);
    }

    #[test]
    fn test_stability_identical_landmarks_rejected() {
        let lm = landmarks_with_eyes((100.0, 50.0), (140.0, 50.0));
        let result = check_landmark_stability(&[lm, lm, lm], None);
        assert!(!result.is_live);
        assert_eq!(result.frame_pairs_analysed, 2);
        assert!(result.mean_eye_displacement < 1e-6);
    }

    #[test]
    fn test_stability_displacement_accuracy() {
        // Right eye moves 3px right, 4px down → 5.0; left eye still → mean 2.5
        let seq = vec![
            landmarks_with_eyes((100.0, 50.0), (140.0, 50.0)),
            landmarks_with_eyes((100.0, 50.0), (143.0, 54.0)),
        ];
        let result = check_landmark_stability(&seq, None);
        assert!((result.mean_eye_displacement - 2.5).abs() < 1e-6);
        assert!(result.is_live);
    }

    #[test]
    fn test_stability_custom_threshold() {
        let seq = vec![
            landmarks_with_eyes((100.0, 50.0), (140.0, 50.0)),
            landmarks_with_eyes((101.0, 50.5), (141.0, 50.5)),
        ];
        assert!(!check_landmark_stability(&seq, Some(5.0)).is_live);
        assert!(check_landmark_stability(&seq, Some(0.1)).is_live);
    }
}
