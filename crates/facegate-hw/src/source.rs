//! Frame sources: anything the capture engine can grab the current frame from.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source not found: {0}")]
    NotFound(String),
    #[error("no images in {0}")]
    Empty(String),
    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of the current video frame.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Frame, SourceError>;
}

fn load_frame(path: &Path, sequence: u32) -> Result<Frame, SourceError> {
    let image = image::open(path).map_err(|e| SourceError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(Frame::from_image(&image, sequence))
}

/// Replays the images of a directory in file-name order, cycling.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    next: usize,
    sequence: u32,
}

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(SourceError::NotFound(dir.display().to_string()));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Empty(dir.display().to_string()));
        }
        tracing::info!(dir = %dir.display(), frames = paths.len(), "opened image directory source");

        Ok(Self {
            paths,
            next: 0,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn grab(&mut self) -> Result<Frame, SourceError> {
        let path = &self.paths[self.next % self.paths.len()];
        let frame = load_frame(path, self.sequence)?;
        tracing::trace!(path = %path.display(), sequence = self.sequence, "frame grabbed");
        self.next = (self.next + 1) % self.paths.len();
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

/// Returns the same still frame on every grab.
pub struct StillSource {
    frame: Frame,
    sequence: u32,
}

impl StillSource {
    pub fn new(frame: Frame) -> Self {
        Self { frame, sequence: 0 }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }
        Ok(Self::new(load_frame(path, 0)?))
    }
}

impl FrameSource for StillSource {
    fn grab(&mut self) -> Result<Frame, SourceError> {
        let mut frame = self.frame.clone();
        frame.sequence = self.sequence;
        frame.timestamp = std::time::Instant::now();
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}
