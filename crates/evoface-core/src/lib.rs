pub mod align;
pub mod antispoof;
pub mod attendance;
pub mod backend;
pub mod detector;
pub mod evolution;
pub mod liveness;
pub mod matcher;
mod onnx;
pub mod recognizer;
pub mod table;
pub mod types;

pub use antispoof::{LivenessClassifier, MiniFasNetClassifier};
pub use backend::{available_backends, select_backend, DeviceMode, ExecutionBackend};
pub use detector::{FaceLandmarker, ScrfdDetector};
pub use evolution::{EvolutionConfig, EvolutionPlan, FeatureEvolution, SkipReason};
pub use liveness::{GateConfig, GatePhase, GateReport, GateStatus, LivenessGate, LivenessState};
pub use matcher::{IdentityMatcher, MatchResult, MatcherConfig};
pub use recognizer::{ArcFaceExtractor, EmbeddingExtractor};
pub use table::{IdentityMeta, IdentityRecord, IdentityTable, TableError};
pub use types::{
    BoundingBox, DetectedFace, Embedding, EmbeddingError, Landmarks5, ModelError, EMBEDDING_DIM,
};
