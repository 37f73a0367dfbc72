//! Capture admission control.
//!
//! Turns the stream of per-poll frame classifications into capture events,
//! enforcing a short cooldown between manual captures and a long interval
//! between automatic ones. The controller owns the last-capture timestamp;
//! callers pass `now` explicitly so timing is deterministic under test.

use crate::geometry::FrameStatus;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MANUAL_COOLDOWN: Duration = Duration::from_millis(3_000);
pub const DEFAULT_AUTO_INTERVAL: Duration = Duration::from_millis(90_000);

/// How captures are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Only an explicit trigger captures.
    Manual,
    /// Fires once when the face is ready, then waits for [`AdmissionController::reset`].
    AutoSingleShot,
    /// Fires whenever the face is ready and the auto interval has elapsed.
    AutoRepeating,
}

impl CaptureMode {
    pub fn is_automatic(self) -> bool {
        !matches!(self, CaptureMode::Manual)
    }
}

#[derive(Debug, Error)]
#[error("unknown capture mode {0:?} (expected manual, auto or auto-single)")]
pub struct ParseModeError(String);

impl FromStr for CaptureMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(CaptureMode::Manual),
            "auto" | "auto-repeating" => Ok(CaptureMode::AutoRepeating),
            "auto-single" | "auto-single-shot" => Ok(CaptureMode::AutoSingleShot),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Timing policy for the admission controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    pub mode: CaptureMode,
    /// Minimum time between two accepted manual captures.
    pub manual_cooldown: Duration,
    /// Minimum time between two automatic captures.
    pub auto_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Manual,
            manual_cooldown: DEFAULT_MANUAL_COOLDOWN,
            auto_interval: DEFAULT_AUTO_INTERVAL,
        }
    }
}

/// Observable admission state for the current poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// The current frame is not capturable.
    Idle,
    /// The frame is ready but a recent capture or the pipeline holds captures back.
    CoolingDown,
    ReadyToCapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTrigger {
    Manual,
    Automatic,
}

/// An accepted capture: the caller should grab the current frame now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEvent {
    pub at: Instant,
    pub trigger: CaptureTrigger,
}

/// Why a capture request was refused. Refusals are expected and never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("face detector is not loaded yet")]
    DetectorNotReady,
    #[error("face position not accepted: {0}")]
    NotReady(FrameStatus),
    #[error("wait {}ms before the next capture", .remaining.as_millis())]
    CoolingDown { remaining: Duration },
    #[error("a capture is already being processed")]
    Busy,
    #[error("capture session has been torn down")]
    TornDown,
}

/// Per-capture-UI admission state machine.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    status: FrameStatus,
    last_capture_at: Option<Instant>,
    detector_ready: bool,
    in_flight: bool,
    single_shot_spent: bool,
    torn_down: bool,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            status: FrameStatus::NoFace,
            last_capture_at: None,
            detector_ready: false,
            in_flight: false,
            single_shot_spent: false,
            torn_down: false,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn mode(&self) -> CaptureMode {
        self.config.mode
    }

    /// Classification recorded by the latest [`observe`](Self::observe).
    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn last_capture_at(&self) -> Option<Instant> {
        self.last_capture_at
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// The detector oracle finished loading; captures may be admitted.
    pub fn mark_detector_ready(&mut self) {
        if !self.torn_down {
            self.detector_ready = true;
        }
    }

    /// Record this poll's classification. In automatic modes this is also
    /// where captures fire.
    pub fn observe(&mut self, status: FrameStatus, now: Instant) -> Option<CaptureEvent> {
        if self.torn_down {
            return None;
        }
        self.status = status;

        if !self.config.mode.is_automatic() {
            return None;
        }
        if self.config.mode == CaptureMode::AutoSingleShot && self.single_shot_spent {
            return None;
        }
        if let Err(rejection) = self.check(now, self.config.auto_interval) {
            if !matches!(rejection, Rejection::NotReady(_)) {
                tracing::trace!(%rejection, "auto capture held back");
            }
            return None;
        }

        self.single_shot_spent = true;
        Some(self.stamp(now, CaptureTrigger::Automatic))
    }

    /// Explicit capture request (e.g. a button press).
    pub fn trigger(&mut self, now: Instant) -> Result<CaptureEvent, Rejection> {
        if let Err(rejection) = self.check(now, self.config.manual_cooldown) {
            tracing::debug!(%rejection, "manual capture ignored");
            return Err(rejection);
        }
        Ok(self.stamp(now, CaptureTrigger::Manual))
    }

    /// Admission state as seen at `now`.
    pub fn state(&self, now: Instant) -> AdmissionState {
        match self.check(now, self.threshold()) {
            Ok(()) => AdmissionState::ReadyToCapture,
            Err(Rejection::CoolingDown { .. } | Rejection::Busy) => AdmissionState::CoolingDown,
            Err(_) => AdmissionState::Idle,
        }
    }

    /// Time left before the next capture is admitted, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_capture_at?;
        self.threshold()
            .checked_sub(now.saturating_duration_since(last))
            .filter(|d| !d.is_zero())
    }

    /// A captured image is being processed (countdown, submission).
    pub fn begin_processing(&mut self) {
        if !self.torn_down {
            self.in_flight = true;
        }
    }

    pub fn finish_processing(&mut self) {
        self.in_flight = false;
    }

    /// Discard the current capture. Re-arms single-shot mode; the cooldown
    /// stays anchored to the last capture time.
    pub fn reset(&mut self) {
        if self.torn_down {
            return;
        }
        self.in_flight = false;
        self.single_shot_spent = false;
    }

    /// The capture UI is going away; every later call is a no-op.
    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.in_flight = false;
        self.detector_ready = false;
    }

    fn threshold(&self) -> Duration {
        if self.config.mode.is_automatic() {
            self.config.auto_interval
        } else {
            self.config.manual_cooldown
        }
    }

    fn check(&self, now: Instant, threshold: Duration) -> Result<(), Rejection> {
        if self.torn_down {
            return Err(Rejection::TornDown);
        }
        if !self.detector_ready {
            return Err(Rejection::DetectorNotReady);
        }
        if self.in_flight {
            return Err(Rejection::Busy);
        }
        if !self.status.is_ready() {
            return Err(Rejection::NotReady(self.status));
        }
        if let Some(last) = self.last_capture_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < threshold {
                return Err(Rejection::CoolingDown {
                    remaining: threshold - elapsed,
                });
            }
        }
        Ok(())
    }

    fn stamp(&mut self, now: Instant, trigger: CaptureTrigger) -> CaptureEvent {
        self.last_capture_at = Some(now);
        tracing::debug!(?trigger, "capture admitted");
        CaptureEvent { at: now, trigger }
    }
}
