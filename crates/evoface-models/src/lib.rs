use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which pipeline stage a model file serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Detector,
    AntiSpoof,
    Recognizer,
}

/// Model file descriptor. `url` and `sha256` are `None` for models that are
/// not published at a stable location and must be placed by hand.
pub struct ModelFile {
    pub role: ModelRole,
    pub name: &'static str,
    pub url: Option<&'static str>,
    pub sha256: Option<&'static str>,
    pub size_display: &'static str,
}

// Checksums verified from HuggingFace Git LFS pointer files (oid sha256: field).
// Source: https://huggingface.co/public-data/insightface/raw/main/models/buffalo_l/
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        role: ModelRole::Detector,
        name: "det_10g.onnx",
        url: Some("https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx"),
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
        size_display: "16 MB",
    },
    ModelFile {
        role: ModelRole::AntiSpoof,
        name: "2.7_80x80_MiniFASNetV2.onnx",
        url: None,
        sha256: None,
        size_display: "2 MB",
    },
    ModelFile {
        role: ModelRole::Recognizer,
        name: "w600k_r50.onnx",
        url: Some("https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/w600k_r50.onnx"),
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
        size_display: "166 MB",
    },
];

/// Manifest entry for a pipeline stage.
pub fn model_for(role: ModelRole) -> &'static ModelFile {
    match role {
        ModelRole::Detector => &MODELS[0],
        ModelRole::AntiSpoof => &MODELS[1],
        ModelRole::Recognizer => &MODELS[2],
    }
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Determine the model directory.
///
/// Root (UID 0) uses `/var/lib/evoface/models`; everyone else
/// `$XDG_DATA_HOME/evoface/models` (~/.local/share/evoface/models).
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/evoface/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("evoface/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check that `path` exists and, when a checksum is pinned, that it matches.
pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: Option<&str>,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let Some(expected) = expected_sha256 else {
        tracing::debug!(name, "no pinned checksum, presence check only");
        return Ok(());
    };

    let digest = sha256_file_hex(path)?;
    if digest != expected {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected.to_string(),
            got: digest,
        });
    }

    Ok(())
}

pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_dir.join(model.name);
        verify_file_sha256(model.name, &path, model.sha256)?;
    }

    Ok(())
}
