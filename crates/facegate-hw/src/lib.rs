//! Frame sources for the capture engine.
//!
//! Provides the RGB [`Frame`] type, JPEG screenshot encoding, and the
//! [`FrameSource`] trait with file-backed implementations.

pub mod frame;
pub mod source;

pub use frame::{Frame, FrameError};
pub use source::{FrameSource, ImageDirSource, SourceError, StillSource};
