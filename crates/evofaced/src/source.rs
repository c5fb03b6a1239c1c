use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to list frame directory {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Supplier of RGB frames to the engine loop.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Replays the images of a directory (jpg/jpeg/png), sorted by file name.
pub struct DirectorySource {
    pending: VecDeque<PathBuf>,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let list_err = |source| SourceError::List {
            path: dir.to_path_buf(),
            source,
        };
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(list_err)? {
            let path = entry.map_err(list_err)?.path();
            if is_image(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        tracing::info!(dir = %dir.display(), frames = frames.len(), "frame directory opened");
        Ok(Self {
            pending: frames.into(),
        })
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let frame = image::open(&path)
            .map_err(|source| SourceError::Decode { path, source })?
            .to_rgb8();
        Ok(Some(frame))
    }
}

/// No camera configured: the engine serves control requests only.
pub struct NoSource;

impl FrameSource for NoSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        Ok(None)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}
