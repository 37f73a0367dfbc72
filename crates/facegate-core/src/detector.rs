//! Face detector oracle contract and model-source loading.
//!
//! The detector itself is an external collaborator: anything that turns an
//! RGB frame into a bounding box and named landmark sets. This module fixes
//! the contract, the ordered-fallback loading strategy, and ships a replay
//! detector backed by recorded detections.

use crate::types::FaceDetection;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;

pub type DetectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<FaceDetection>, DetectorError>> + Send + 'a>>;

/// One model source that failed to load, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub location: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector source not found: {0}")]
    ModelNotFound(String),
    #[error("face detector unavailable, every source failed: {}", describe_failures(.failures))]
    Unavailable { failures: Vec<SourceFailure> },
    #[error("invalid detection recording at line {line}: {reason}")]
    InvalidRecording { line: usize, reason: String },
    #[error("detection failed: {0}")]
    DetectionFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_failures(failures: &[SourceFailure]) -> String {
    if failures.is_empty() {
        return "no sources configured".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} ({})", f.location, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-frame face detector.
///
/// Returns the single most prominent face, or `None` when no face is found.
pub trait FaceDetector: Send + Sync {
    fn detect<'a>(&'a self, rgb: &'a [u8], width: u32, height: u32) -> DetectFuture<'a>;
}

/// Try each model source once, in order. The first success wins; if all
/// fail, one consolidated [`DetectorError::Unavailable`] lists every failure.
pub async fn load_first_available<D, F, Fut>(
    sources: &[String],
    mut load: F,
) -> Result<(D, String), DetectorError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<D, DetectorError>>,
{
    let mut failures = Vec::with_capacity(sources.len());

    for source in sources {
        tracing::info!(source = %source, "loading face detector");
        match load(source.clone()).await {
            Ok(detector) => {
                tracing::info!(source = %source, "face detector loaded");
                return Ok((detector, source.clone()));
            }
            Err(err) => {
                tracing::warn!(source = %source, error = %err, "face detector source failed");
                failures.push(SourceFailure {
                    location: source.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    tracing::error!(attempted = failures.len(), "no face detector source could be loaded");
    Err(DetectorError::Unavailable { failures })
}

/// Detector that replays recorded results, one per `detect` call, cycling.
///
/// The recording is JSON lines: each line is a [`FaceDetection`] object or
/// `null` for a frame without a face. Blank lines are skipped.
pub struct ReplayDetector {
    frames: Vec<Option<FaceDetection>>,
    cursor: Mutex<usize>,
}

impl ReplayDetector {
    pub fn new(frames: Vec<Option<FaceDetection>>) -> Self {
        Self {
            frames,
            cursor: Mutex::new(0),
        }
    }

    /// Parse a JSON-lines recording.
    pub fn parse(text: &str) -> Result<Self, DetectorError> {
        let mut frames = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let frame: Option<FaceDetection> =
                serde_json::from_str(line).map_err(|e| DetectorError::InvalidRecording {
                    line: i + 1,
                    reason: e.to_string(),
                })?;
            frames.push(frame);
        }
        if frames.is_empty() {
            return Err(DetectorError::InvalidRecording {
                line: 0,
                reason: "recording holds no frames".to_string(),
            });
        }
        Ok(Self::new(frames))
    }

    /// Load a recording from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let detector = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), frames = detector.len(), "loaded detection recording");
        Ok(detector)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn next_frame(&self) -> Result<Option<FaceDetection>, DetectorError> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| DetectorError::DetectionFailed("replay cursor poisoned".into()))?;
        if self.frames.is_empty() {
            return Ok(None);
        }
        let frame = self.frames[*cursor % self.frames.len()].clone();
        *cursor = (*cursor + 1) % self.frames.len();
        Ok(frame)
    }
}

impl FaceDetector for ReplayDetector {
    fn detect<'a>(&'a self, _rgb: &'a [u8], _width: u32, _height: u32) -> DetectFuture<'a> {
        Box::pin(async move { self.next_frame() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RECORDING: &str = r#"
null
{"bounding_box":{"x":10,"y":10,"width":20,"height":20}}

{"bounding_box":{"x":30,"y":25,"width":40,"height":50},"landmarks":{"nose":[],"left_eye":[],"right_eye":[]},"confidence":0.93}
"#;

    #[tokio::test]
    async fn test_replay_cycles_through_recording() {
        let det = ReplayDetector::parse(RECORDING).unwrap();
        assert_eq!(det.len(), 3);

        let mut widths = Vec::new();
        for _ in 0..4 {
            let frame = det.detect(&[], 100, 100).await.unwrap();
            widths.push(frame.and_then(|f| f.bounding_box).map(|b| b.width));
        }
        assert_eq!(widths, vec![None, Some(20.0), Some(40.0), None]);
    }

    #[test]
    fn test_replay_rejects_bad_line() {
        let err = ReplayDetector::parse("null\n{not json}\n").err().unwrap();
        assert!(matches!(err, DetectorError::InvalidRecording { line: 2, .. }));
    }

    #[test]
    fn test_replay_rejects_empty_recording() {
        assert!(ReplayDetector::parse("\n\n").is_err());
    }

    #[test]
    fn test_open_missing_file() {
        let err = ReplayDetector::open("/nonexistent/detections.jsonl").err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_open_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RECORDING.as_bytes()).unwrap();
        let det = ReplayDetector::open(file.path()).unwrap();
        assert_eq!(det.len(), 3);
    }

    #[tokio::test]
    async fn test_first_available_source_wins() {
        let sources: Vec<String> = vec!["cdn".into(), "mirror".into(), "local".into()];
        let mut attempted = Vec::new();

        let (value, used) = load_first_available(&sources, |src| {
            attempted.push(src.clone());
            async move {
                if src == "cdn" {
                    Err(DetectorError::ModelNotFound(src))
                } else {
                    Ok(src.len())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(used, "mirror");
        assert_eq!(value, 6);
        assert_eq!(attempted, vec!["cdn", "mirror"]);
    }

    #[tokio::test]
    async fn test_all_sources_fail_consolidated() {
        let sources: Vec<String> = vec!["cdn".into(), "mirror".into()];
        let err = load_first_available::<(), _, _>(&sources, |src| async move {
            Err(DetectorError::DetectionFailed(format!("{src} unreachable")))
        })
        .await
        .unwrap_err();

        match &err {
            DetectorError::Unavailable { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].location, "cdn");
                assert_eq!(failures[1].location, "mirror");
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("cdn (detection failed: cdn unreachable)"), "{msg}");
        assert!(msg.contains("mirror"), "{msg}");
    }

    #[tokio::test]
    async fn test_no_sources_is_unavailable() {
        let err = load_first_available::<(), _, _>(&[], |src| async move {
            Err(DetectorError::ModelNotFound(src))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no sources configured"));
    }
}
