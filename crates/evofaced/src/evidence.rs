use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use image::RgbImage;

/// Writes the aligned face of an accepted live event next to its log row.
#[derive(Debug, Clone)]
pub struct EvidenceSink {
    dir: PathBuf,
}

impl EvidenceSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Save `face` as `{identity_id}_{YYYYmmdd_HHMMSS}_{uuid}.jpg`.
    /// Failures only warn: the event is still recorded without evidence.
    pub fn save(&self, identity_id: &str, at: NaiveDateTime, face: &RgbImage) -> Option<String> {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "evidence directory unavailable");
            return None;
        }
        let path = self.dir.join(format!(
            "{}_{}_{}.jpg",
            sanitize(identity_id),
            at.format("%Y%m%d_%H%M%S"),
            uuid::Uuid::new_v4().simple()
        ));
        match face.save(&path) {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write evidence image");
                None
            }
        }
    }

    /// Remove an evidence file whose event was not recorded.
    pub fn discard(&self, evidence_ref: &str) {
        if let Err(e) = std::fs::remove_file(Path::new(evidence_ref)) {
            tracing::debug!(path = evidence_ref, error = %e, "evidence cleanup failed");
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
