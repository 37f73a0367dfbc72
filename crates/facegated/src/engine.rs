//! Capture engine.
//!
//! One tokio task owns every piece of capture state: the frame source, the
//! detector, the admission controller, the registration session, both
//! countdowns and the in-flight submission. Callers talk to it through a
//! clone-safe [`EngineHandle`]; live status is published on a watch channel
//! and discrete events on an unbounded channel.

use facegate_core::admission::{
    AdmissionConfig, AdmissionController, AdmissionState, CaptureMode, CaptureTrigger, Rejection,
};
use facegate_core::countdown::{Countdown, CountdownStep};
use facegate_core::detector::{load_first_available, DetectorError, FaceDetector, ReplayDetector};
use facegate_core::geometry::{EvaluatorConfig, FrameClassification, FrameEvaluator, FrameStatus};
use facegate_core::session::{CaptureSession, RegistrationForm, SessionError};
use facegate_core::sink::{
    AttendanceReceipt, AttendanceSink, Identity, RegistrationSink, SubmissionError,
};
use facegate_core::types::{CapturedImage, FaceDetection};
use facegate_hw::{Frame, FrameError, FrameSource};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Deferred detector initialisation, run inside the engine task.
pub type DetectorLoad = BoxFuture<Result<(Arc<dyn FaceDetector>, String), DetectorError>>;

const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);
const REQUEST_QUEUE: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("{0} is not available in this capture flow")]
    WrongFlow(&'static str),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Timing and policy knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub evaluator: EvaluatorConfig,
    pub admission: AdmissionConfig,
    /// Seconds counted down between an attendance capture and its submission.
    pub submit_delay_secs: u32,
    /// Seconds a successful attendance stays on screen before the reset.
    pub success_reset_secs: u32,
    pub jpeg_quality: u8,
}

/// What accepted captures are for.
pub enum Flow {
    /// Each capture is submitted to the attendance sink on its own.
    Attendance {
        sink: Arc<dyn AttendanceSink>,
        /// Room or session sent with each submission.
        context: Option<String>,
    },
    /// Captures accumulate into a three-photo registration session.
    Registration { sink: Arc<dyn RegistrationSink> },
}

impl Flow {
    fn is_registration(&self) -> bool {
        matches!(self, Flow::Registration { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    LoadingDetector,
    Running,
    /// Every detector source failed; capture stays disabled.
    DetectorUnavailable(String),
    TornDown,
}

/// Live engine state, republished after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub phase: Phase,
    pub classification: FrameClassification,
    pub admission: AdmissionState,
    /// Seconds left before a pending attendance submission.
    pub countdown: Option<u32>,
    pub photos: usize,
    pub submitting: bool,
    pub last_receipt: Option<AttendanceReceipt>,
    pub last_error: Option<String>,
}

impl EngineStatus {
    fn initial() -> Self {
        Self {
            phase: Phase::LoadingDetector,
            classification: FrameClassification::no_face(),
            admission: AdmissionState::Idle,
            countdown: None,
            photos: 0,
            submitting: false,
            last_receipt: None,
            last_error: None,
        }
    }

    /// Hint for whoever stands in front of the camera.
    pub fn message(&self) -> &str {
        match &self.phase {
            Phase::LoadingDetector => "Loading face detector...",
            Phase::DetectorUnavailable(_) => "Face detector unavailable, capture disabled",
            Phase::TornDown => "Capture stopped",
            Phase::Running => self.classification.status.message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    DetectorReady { source: String },
    DetectorUnavailable { message: String },
    Captured { trigger: CaptureTrigger },
    PhotoAdded { count: usize },
    CountdownTick { remaining: u32 },
    Submitted { receipt: AttendanceReceipt },
    Registered { identity: Identity },
    SubmissionFailed { message: String },
    SessionReset,
}

enum EngineRequest {
    Trigger {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RemovePhoto {
        index: usize,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    SubmitRegistration {
        form: RegistrationForm,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Teardown {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Manual capture request.
    pub async fn trigger(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Trigger { reply }).await
    }

    /// Discard the current capture (or registration photos) and cancel countdowns.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Reset { reply }).await
    }

    /// Drop one registration photo. Returns the remaining count.
    pub async fn remove_photo(&self, index: usize) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::RemovePhoto { index, reply })
            .await
    }

    /// Submit the three registration photos with `form`. Resolves when the
    /// sink answers.
    pub async fn submit_registration(&self, form: RegistrationForm) -> Result<Identity, EngineError> {
        self.call(|reply| EngineRequest::SubmitRegistration { form, reply })
            .await
    }

    /// Stop the engine. Every later call fails with [`EngineError::ChannelClosed`].
    pub async fn teardown(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Teardown { reply }).await
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }
}

/// Load the first detector recording in `sources` that opens.
pub fn replay_detector(sources: Vec<String>) -> DetectorLoad {
    Box::pin(async move {
        let (detector, source) =
            load_first_available(&sources, |path| async move { ReplayDetector::open(path) })
                .await?;
        tracing::debug!(source = %source, entries = detector.len(), "replay detector ready");
        let detector: Arc<dyn FaceDetector> = Arc::new(detector);
        Ok((detector, source))
    })
}

/// Spawn the engine on the current tokio runtime.
///
/// The detector is loaded inside the engine task; captures requested before
/// it is ready are rejected. The registration flow always captures manually.
pub fn spawn_engine(
    settings: EngineSettings,
    source: Box<dyn FrameSource>,
    detector: DetectorLoad,
    flow: Flow,
) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let mut admission = settings.admission;
    if flow.is_registration() && admission.mode != CaptureMode::Manual {
        tracing::info!(configured = ?admission.mode, "registration captures manually");
        admission.mode = CaptureMode::Manual;
    }

    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let (status_tx, status_rx) = watch::channel(EngineStatus::initial());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let engine = Engine {
        evaluator: FrameEvaluator::new(settings.evaluator),
        admission: AdmissionController::new(admission),
        settings,
        source: Arc::new(Mutex::new(source)),
        flow,
        session: CaptureSession::new(),
        detector: None,
        loading: Some(detector),
        detection: None,
        frame: None,
        pending: None,
        submit_timer: None,
        reset_timer: None,
        submission: None,
        registration_reply: None,
        skipped_polls: 0,
        status: EngineStatus::initial(),
        status_tx,
        events: events_tx,
    };
    tokio::spawn(engine.run(rx));

    (
        EngineHandle {
            tx,
            status: status_rx,
        },
        events_rx,
    )
}

/// A running 1-second countdown.
struct Timer {
    countdown: Countdown,
    interval: Interval,
}

impl Timer {
    fn start(seconds: u32) -> Self {
        let mut interval =
            tokio::time::interval_at(Instant::now() + COUNTDOWN_PERIOD, COUNTDOWN_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            countdown: Countdown::new(seconds),
            interval,
        }
    }
}

enum Submission {
    Attendance(Result<AttendanceReceipt, SubmissionError>),
    Registration(Result<Identity, SubmissionError>),
}

/// Shared with the blocking pool while a grab is in flight.
type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// One poll: the grabbed frame and what the detector found in it, or why the
/// grab failed.
type Detection = Result<(Frame, Result<Option<FaceDetection>, DetectorError>), String>;

/// Grab a frame on the blocking pool; sources decode images from disk.
async fn grab(source: SharedSource) -> Result<Frame, String> {
    tokio::task::spawn_blocking(move || {
        let mut source = source
            .lock()
            .map_err(|_| "frame source mutex poisoned".to_string())?;
        source.grab().map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| format!("grab task failed: {e}"))?
}

struct Engine {
    settings: EngineSettings,
    evaluator: FrameEvaluator,
    admission: AdmissionController,
    source: SharedSource,
    flow: Flow,
    session: CaptureSession,
    detector: Option<Arc<dyn FaceDetector>>,
    loading: Option<DetectorLoad>,
    detection: Option<BoxFuture<Detection>>,
    /// Frame behind the current classification.
    frame: Option<Frame>,
    /// Attendance capture waiting for its countdown.
    pending: Option<CapturedImage>,
    submit_timer: Option<Timer>,
    reset_timer: Option<Timer>,
    submission: Option<BoxFuture<Submission>>,
    registration_reply: Option<oneshot::Sender<Result<Identity, EngineError>>>,
    skipped_polls: u64,
    status: EngineStatus,
    status_tx: watch::Sender<EngineStatus>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

async fn complete<T>(slot: &mut Option<BoxFuture<T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Timer>) {
    match timer {
        Some(t) => {
            t.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            mode = ?self.admission.mode(),
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            registration = self.flow.is_registration(),
            "capture engine started"
        );

        loop {
            tokio::select! {
                biased;

                request = rx.recv() => match request {
                    Some(EngineRequest::Teardown { reply }) => {
                        self.teardown();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(request) => self.handle(request),
                    None => {
                        tracing::info!("all engine handles dropped");
                        self.teardown();
                        break;
                    }
                },
                result = complete(&mut self.loading) => {
                    self.loading = None;
                    self.on_detector_loaded(result);
                }
                polled = complete(&mut self.detection) => {
                    self.detection = None;
                    match polled {
                        Ok((frame, result)) => self.on_detection(frame, result),
                        Err(err) => tracing::warn!(error = %err, "frame grab failed"),
                    }
                }
                outcome = complete(&mut self.submission) => {
                    self.submission = None;
                    self.on_submission(outcome);
                }
                _ = tick(&mut self.submit_timer) => self.on_submit_tick(),
                _ = tick(&mut self.reset_timer) => self.on_reset_tick(),
                _ = poll.tick() => self.on_poll(),
            }
        }

        tracing::info!(skipped_polls = self.skipped_polls, "capture engine stopped");
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        self.status.admission = self.admission.state(now());
        self.status_tx.send_replace(self.status.clone());
    }

    fn on_detector_loaded(&mut self, result: Result<(Arc<dyn FaceDetector>, String), DetectorError>) {
        match result {
            Ok((detector, source)) => {
                tracing::info!(source = %source, "capture enabled");
                self.detector = Some(detector);
                self.admission.mark_detector_ready();
                self.status.phase = Phase::Running;
                self.emit(EngineEvent::DetectorReady { source });
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(error = %message, "face detector unavailable, capture disabled");
                self.status.phase = Phase::DetectorUnavailable(message.clone());
                self.status.last_error = Some(message.clone());
                self.emit(EngineEvent::DetectorUnavailable { message });
            }
        }
        self.publish();
    }

    fn on_poll(&mut self) {
        let Some(detector) = self.detector.as_ref() else {
            return;
        };
        if self.detection.is_some() {
            self.skipped_polls += 1;
            tracing::trace!(skipped = self.skipped_polls, "detector busy, poll skipped");
            return;
        }

        let source = Arc::clone(&self.source);
        let detector = Arc::clone(detector);
        self.detection = Some(Box::pin(async move {
            let frame = grab(source).await?;
            let result = detector.detect(&frame.data, frame.width, frame.height).await;
            Ok::<_, String>((frame, result))
        }));
    }

    fn on_detection(&mut self, frame: Frame, result: Result<Option<FaceDetection>, DetectorError>) {
        let at = now();
        let detection = result.unwrap_or_else(|err| {
            tracing::warn!(error = %err, sequence = frame.sequence, "detection failed");
            None
        });

        let classification = self
            .evaluator
            .evaluate(detection.as_ref(), frame.width, frame.height);
        if classification.status != self.status.classification.status {
            tracing::debug!(
                status = %classification.status,
                face_ratio = ?classification.face_ratio,
                deviation = ?classification.deviation,
                "frame status changed"
            );
        }
        self.status.classification = classification;
        self.frame = Some(frame);

        if let Some(event) = self.admission.observe(classification.status, at) {
            if let Err(err) = self.capture(event.trigger, at) {
                tracing::warn!(error = %err, "automatic capture failed");
            }
        }
        self.publish();
    }

    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Trigger { reply } => {
                let result = self.trigger();
                let _ = reply.send(result);
            }
            EngineRequest::Reset { reply } => {
                let result = if self.submission.is_some() {
                    Err(Rejection::Busy.into())
                } else {
                    self.reset_session();
                    Ok(())
                };
                let _ = reply.send(result);
            }
            EngineRequest::RemovePhoto { index, reply } => {
                let _ = reply.send(self.remove_photo(index));
            }
            EngineRequest::SubmitRegistration { form, reply } => self.submit_registration(form, reply),
            EngineRequest::Teardown { .. } => {}
        }
    }

    fn trigger(&mut self) -> Result<(), EngineError> {
        if self.flow.is_registration() && self.session.is_full() {
            return Err(SessionError::SessionFull.into());
        }
        let at = now();
        let event = self.admission.trigger(at)?;
        self.capture(event.trigger, at)
    }

    fn capture(&mut self, trigger: CaptureTrigger, at: std::time::Instant) -> Result<(), EngineError> {
        let frame = self
            .frame
            .as_ref()
            .ok_or(Rejection::NotReady(FrameStatus::NoFace))?;
        let image = CapturedImage {
            jpeg: frame.encode_jpeg(self.settings.jpeg_quality)?,
            width: frame.width,
            height: frame.height,
            captured_at: at,
        };
        tracing::info!(trigger = ?trigger, bytes = image.jpeg.len(), "frame captured");
        self.emit(EngineEvent::Captured { trigger });

        if self.flow.is_registration() {
            let count = self
                .session
                .add_photo(image, self.status.classification.status)?;
            self.status.photos = count;
            self.emit(EngineEvent::PhotoAdded { count });
        } else {
            self.admission.begin_processing();
            self.pending = Some(image);
            let delay = self.settings.submit_delay_secs;
            if delay == 0 {
                self.start_attendance_submission();
            } else {
                self.submit_timer = Some(Timer::start(delay));
                self.status.countdown = Some(delay);
                self.emit(EngineEvent::CountdownTick { remaining: delay });
            }
        }
        self.publish();
        Ok(())
    }

    fn start_attendance_submission(&mut self) {
        let Flow::Attendance { sink, context } = &self.flow else {
            return;
        };
        let Some(image) = self.pending.take() else {
            return;
        };
        let sink = Arc::clone(sink);
        let context = context.clone();

        tracing::info!(room = ?context, "submitting attendance");
        self.status.submitting = true;
        self.submission = Some(Box::pin(async move {
            Submission::Attendance(sink.submit(&image, context.as_deref()).await)
        }));
    }

    fn on_submit_tick(&mut self) {
        let Some(timer) = self.submit_timer.as_mut() else {
            return;
        };
        match timer.countdown.tick() {
            CountdownStep::Remaining(remaining) => {
                self.status.countdown = Some(remaining);
                self.emit(EngineEvent::CountdownTick { remaining });
            }
            CountdownStep::Elapsed => {
                self.submit_timer = None;
                self.status.countdown = None;
                self.emit(EngineEvent::CountdownTick { remaining: 0 });
                self.start_attendance_submission();
            }
            CountdownStep::Cancelled => {
                self.submit_timer = None;
                self.status.countdown = None;
            }
        }
        self.publish();
    }

    fn on_reset_tick(&mut self) {
        let Some(timer) = self.reset_timer.as_mut() else {
            return;
        };
        match timer.countdown.tick() {
            CountdownStep::Remaining(_) => {}
            CountdownStep::Elapsed => {
                self.reset_timer = None;
                self.reset_session();
            }
            CountdownStep::Cancelled => self.reset_timer = None,
        }
    }

    fn on_submission(&mut self, outcome: Submission) {
        self.status.submitting = false;
        match outcome {
            Submission::Attendance(Ok(receipt)) => {
                tracing::info!(identity = %receipt.identity_label, "attendance accepted");
                self.status.last_receipt = Some(receipt.clone());
                self.status.last_error = None;
                self.emit(EngineEvent::Submitted { receipt });
                let hold = self.settings.success_reset_secs;
                if hold == 0 {
                    self.reset_session();
                } else {
                    self.reset_timer = Some(Timer::start(hold));
                }
            }
            Submission::Attendance(Err(err)) => {
                let message = err.to_string();
                tracing::warn!(error = %message, "attendance submission failed");
                self.admission.finish_processing();
                self.status.last_error = Some(message.clone());
                self.emit(EngineEvent::SubmissionFailed { message });
            }
            Submission::Registration(result) => {
                self.admission.finish_processing();
                let reply = self.registration_reply.take();
                let result = match result {
                    Ok(identity) => {
                        self.session.clear();
                        self.status.photos = 0;
                        self.status.last_error = None;
                        self.emit(EngineEvent::Registered {
                            identity: identity.clone(),
                        });
                        Ok(identity)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        self.status.last_error = Some(message.clone());
                        self.emit(EngineEvent::SubmissionFailed { message });
                        Err(err.into())
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
        self.publish();
    }

    fn remove_photo(&mut self, index: usize) -> Result<usize, EngineError> {
        if !self.flow.is_registration() {
            return Err(EngineError::WrongFlow("remove_photo"));
        }
        if self.submission.is_some() {
            return Err(Rejection::Busy.into());
        }
        self.session.remove_photo(index)?;
        self.status.photos = self.session.len();
        tracing::debug!(index, remaining = self.session.len(), "registration photo removed");
        self.publish();
        Ok(self.session.len())
    }

    fn submit_registration(
        &mut self,
        form: RegistrationForm,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    ) {
        let Flow::Registration { sink } = &self.flow else {
            let _ = reply.send(Err(EngineError::WrongFlow("submit_registration")));
            return;
        };
        if self.submission.is_some() {
            let _ = reply.send(Err(Rejection::Busy.into()));
            return;
        }

        let sink = Arc::clone(sink);
        self.session.set_form(form);
        if let Err(err) = self.session.validate() {
            let _ = reply.send(Err(SubmissionError::from(err).into()));
            return;
        }

        let session = self.session.clone();
        self.admission.begin_processing();
        self.registration_reply = Some(reply);
        self.status.submitting = true;
        self.submission = Some(Box::pin(async move {
            Submission::Registration(session.submit(sink.as_ref()).await)
        }));
        self.publish();
    }

    /// Discard the current capture and cancel both countdowns. The cooldown
    /// stays anchored to the last capture.
    fn reset_session(&mut self) {
        self.submit_timer = None;
        self.reset_timer = None;
        self.pending = None;
        self.admission.reset();
        if self.flow.is_registration() {
            self.session.clear();
            self.status.photos = 0;
        }
        self.status.countdown = None;
        self.status.last_receipt = None;
        self.status.last_error = None;
        tracing::debug!("capture session reset");
        self.emit(EngineEvent::SessionReset);
        self.publish();
    }

    fn teardown(&mut self) {
        self.submit_timer = None;
        self.reset_timer = None;
        self.submission = None;
        self.detection = None;
        self.loading = None;
        self.pending = None;
        self.registration_reply = None;
        self.admission.teardown();
        self.status.phase = Phase::TornDown;
        self.status.countdown = None;
        self.status.submitting = false;
        self.publish();
        tracing::info!("capture engine torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::admission::{DEFAULT_AUTO_INTERVAL, DEFAULT_MANUAL_COOLDOWN};
    use facegate_core::detector::{DetectFuture, ReplayDetector};
    use facegate_core::sink::{RegistrationRequest, SinkFuture};
    use facegate_core::types::{BoundingBox, Landmarks, Point};
    use facegate_hw::StillSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    const FRAME_SIDE: u32 = 100;

    /// Face with eyes centred on x = 50 and the nose tip on the same line.
    fn face(bbox: BoundingBox) -> FaceDetection {
        let eye = |from: f32| -> Vec<Point> {
            (0..6).map(|i| Point::new(from + i as f32, 40.0)).collect()
        };
        FaceDetection {
            bounding_box: Some(bbox),
            landmarks: Landmarks {
                nose: (0..9).map(|i| Point::new(50.0, 45.0 + i as f32)).collect(),
                left_eye: eye(40.0),
                right_eye: eye(55.0),
            },
            confidence: Some(0.9),
        }
    }

    fn ready() -> Option<FaceDetection> {
        Some(face(BoundingBox::new(30.0, 25.0, 40.0, 50.0)))
    }

    fn too_far() -> Option<FaceDetection> {
        Some(face(BoundingBox::new(45.0, 45.0, 10.0, 10.0)))
    }

    fn source() -> Box<dyn FrameSource> {
        let side = FRAME_SIDE as usize;
        let frame = Frame::new(vec![90; side * side * 3], FRAME_SIDE, FRAME_SIDE, 0).unwrap();
        Box::new(StillSource::new(frame))
    }

    fn replay(frames: Vec<Option<FaceDetection>>) -> DetectorLoad {
        Box::pin(async move {
            let detector: Arc<dyn FaceDetector> = Arc::new(ReplayDetector::new(frames));
            Ok((detector, "replay".to_string()))
        })
    }

    fn settings(mode: CaptureMode, submit_delay_secs: u32, success_reset_secs: u32) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(100),
            evaluator: EvaluatorConfig::default(),
            admission: AdmissionConfig {
                mode,
                manual_cooldown: DEFAULT_MANUAL_COOLDOWN,
                auto_interval: DEFAULT_AUTO_INTERVAL,
            },
            submit_delay_secs,
            success_reset_secs,
            jpeg_quality: 80,
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        submissions: Mutex<Vec<(std::time::Instant, Option<String>)>>,
        fail_with: Option<String>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.submissions.lock().unwrap().len()
        }
    }

    impl AttendanceSink for RecordingSink {
        fn submit<'a>(
            &'a self,
            image: &'a CapturedImage,
            context: Option<&'a str>,
        ) -> SinkFuture<'a, AttendanceReceipt> {
            Box::pin(async move {
                self.submissions
                    .lock()
                    .unwrap()
                    .push((image.captured_at, context.map(String::from)));
                match &self.fail_with {
                    Some(message) => Err(SubmissionError::SubmissionFailed(message.clone())),
                    None => Ok(AttendanceReceipt {
                        identity_label: "Jane Doe".into(),
                    }),
                }
            })
        }
    }

    struct EchoRegistry;

    impl RegistrationSink for EchoRegistry {
        fn register<'a>(&'a self, request: &'a RegistrationRequest) -> SinkFuture<'a, Identity> {
            Box::pin(async move {
                Ok(Identity {
                    id: "user-1".into(),
                    identifier: request.identifier.clone(),
                    display_name: request.display_name.clone(),
                })
            })
        }
    }

    fn attendance(sink: &Arc<RecordingSink>) -> Flow {
        Flow::Attendance {
            sink: Arc::clone(sink) as Arc<dyn AttendanceSink>,
            context: Some("B-201".into()),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_attendance_fires_once_when_ready() {
        let sink = Arc::new(RecordingSink::default());
        let start = now();
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::AutoRepeating, 0, 2),
            source(),
            replay(vec![None, too_far(), ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_secs(10)).await;

        let submissions = sink.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 1);
        // polls at 0, 100 and 200 ms: no face, too far, ready
        assert_eq!(submissions[0].0 - start, Duration::from_millis(200));
        assert_eq!(submissions[0].1.as_deref(), Some("B-201"));

        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                EngineEvent::DetectorReady {
                    source: "replay".into()
                },
                EngineEvent::Captured {
                    trigger: CaptureTrigger::Automatic
                },
                EngineEvent::Submitted {
                    receipt: AttendanceReceipt {
                        identity_label: "Jane Doe".into()
                    }
                },
                EngineEvent::SessionReset,
            ]
        );
        assert!(!handle.status().submitting);
        assert_eq!(handle.status().phase, Phase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_capture_repeats_after_interval() {
        let sink = Arc::new(RecordingSink::default());
        let (_handle, _events) = spawn_engine(
            settings(CaptureMode::AutoRepeating, 0, 2),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(89_950)).await;
        assert_eq!(sink.count(), 1);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_waits_for_reset() {
        let mut s = settings(CaptureMode::AutoSingleShot, 0, 0);
        s.admission.auto_interval = Duration::from_secs(1);
        let sink = Arc::new(RecordingSink {
            fail_with: Some("Face not recognised".into()),
            ..RecordingSink::default()
        });
        let (handle, _events) = spawn_engine(s, source(), replay(vec![ready()]), attendance(&sink));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.count(), 1);

        handle.reset().await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_cooldown() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(250)).await;
        handle.trigger().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.count(), 1);

        // 2999 ms after the first capture
        sleep(Duration::from_millis(2_989)).await;
        let err = handle.trigger().await.unwrap_err();
        assert!(
            matches!(
                err,
                EngineError::Rejected(Rejection::CoolingDown { remaining })
                    if remaining == Duration::from_millis(1)
            ),
            "{err}"
        );

        sleep(Duration::from_millis(1)).await;
        handle.trigger().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_needs_ready_frame() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            source(),
            replay(vec![too_far()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(250)).await;
        let err = handle.trigger().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rejected(Rejection::NotReady(FrameStatus::TooFar))
        ));
        assert_eq!(handle.status().classification.status, FrameStatus::TooFar);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_before_detector_loaded() {
        let sink = Arc::new(RecordingSink::default());
        let slow: DetectorLoad = Box::pin(async {
            sleep(Duration::from_secs(1)).await;
            let detector: Arc<dyn FaceDetector> = Arc::new(ReplayDetector::new(vec![ready()]));
            Ok((detector, "slow".to_string()))
        });
        let (handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            source(),
            slow,
            attendance(&sink),
        );

        let err = handle.trigger().await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(Rejection::DetectorNotReady)));
        assert_eq!(handle.status().phase, Phase::LoadingDetector);

        sleep(Duration::from_millis(1_250)).await;
        assert_eq!(handle.status().phase, Phase::Running);
        handle.trigger().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_unavailable_disables_capture() {
        let sink = Arc::new(RecordingSink::default());
        let failing: DetectorLoad = Box::pin(async {
            Err(DetectorError::Unavailable {
                failures: Vec::new(),
            })
        });
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::AutoRepeating, 0, 0),
            source(),
            failing,
            attendance(&sink),
        );

        sleep(Duration::from_secs(1)).await;
        assert!(matches!(handle.status().phase, Phase::DetectorUnavailable(_)));
        assert!(matches!(
            handle.trigger().await,
            Err(EngineError::Rejected(Rejection::DetectorNotReady))
        ));
        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EngineEvent::DetectorUnavailable { .. }));
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_delay_counts_down() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::Manual, 3, 2),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(250)).await;
        handle.trigger().await.unwrap();
        assert_eq!(handle.status().countdown, Some(3));

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(sink.count(), 0);
        // pipeline in flight: further triggers are refused
        assert!(matches!(
            handle.trigger().await,
            Err(EngineError::Rejected(Rejection::Busy))
        ));

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(sink.count(), 1);

        let ticks: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::CountdownTick { remaining } => Some(remaining),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_countdown() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::Manual, 3, 2),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(250)).await;
        handle.trigger().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;
        handle.teardown().await.unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(handle.status().phase, Phase::TornDown);
        assert!(matches!(handle.trigger().await, Err(EngineError::ChannelClosed)));
        assert!(matches!(handle.reset().await, Err(EngineError::ChannelClosed)));

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen.last(),
            Some(&EngineEvent::CountdownTick { remaining: 2 })
        );
        assert!(!seen
            .iter()
            .any(|e| matches!(e, EngineEvent::Submitted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_engine() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::AutoRepeating, 3, 2),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );
        let mut status = handle.watch_status();
        drop(handle);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(status.borrow_and_update().phase, Phase::TornDown);
        assert_eq!(sink.count(), 0);
        while events.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_allows_retry() {
        let sink = Arc::new(RecordingSink {
            fail_with: Some("Face not recognised".into()),
            ..RecordingSink::default()
        });
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 2),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(250)).await;
        handle.trigger().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let status = handle.status();
        assert_eq!(status.last_error.as_deref(), Some("Face not recognised"));
        assert!(!status.submitting);
        assert!(drain(&mut events).contains(&EngineEvent::SubmissionFailed {
            message: "Face not recognised".into()
        }));

        sleep(Duration::from_secs(3)).await;
        handle.trigger().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_detector_skips_polls() {
        struct SlowDetector {
            calls: AtomicUsize,
        }

        impl FaceDetector for SlowDetector {
            fn detect<'a>(&'a self, _rgb: &'a [u8], _w: u32, _h: u32) -> DetectFuture<'a> {
                Box::pin(async move {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(350)).await;
                    Ok(None)
                })
            }
        }

        let slow = Arc::new(SlowDetector {
            calls: AtomicUsize::new(0),
        });
        let detector: Arc<dyn FaceDetector> = slow.clone();
        let load: DetectorLoad = Box::pin(async move { Ok((detector, "slow".to_string())) });
        let sink = Arc::new(RecordingSink::default());
        let (_handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            source(),
            load,
            attendance(&sink),
        );

        sleep(Duration::from_millis(1_000)).await;
        // detections start at 0, 400 and 800 ms; the polls in between are skipped
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
    }

    /// Still source that records which thread each grab ran on.
    struct ThreadRecordingSource {
        inner: StillSource,
        threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl FrameSource for ThreadRecordingSource {
        fn grab(&mut self) -> Result<Frame, facegate_hw::SourceError> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            self.inner.grab()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grab_runs_off_the_engine_thread() {
        let side = FRAME_SIDE as usize;
        let frame = Frame::new(vec![90; side * side * 3], FRAME_SIDE, FRAME_SIDE, 0).unwrap();
        let threads = Arc::new(Mutex::new(Vec::new()));
        let source = ThreadRecordingSource {
            inner: StillSource::new(frame),
            threads: Arc::clone(&threads),
        };
        let sink = Arc::new(RecordingSink::default());
        let (handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            Box::new(source),
            replay(vec![ready()]),
            attendance(&sink),
        );

        sleep(Duration::from_millis(350)).await;
        assert_eq!(handle.status().classification.status, FrameStatus::Ready);

        // current-thread runtime: the engine task runs on the test thread
        let runtime_thread = std::thread::current().id();
        let threads = threads.lock().unwrap();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_flow() {
        let (handle, mut events) = spawn_engine(
            settings(CaptureMode::AutoRepeating, 0, 0),
            source(),
            replay(vec![ready()]),
            Flow::Registration {
                sink: Arc::new(EchoRegistry),
            },
        );

        // registration never captures on its own
        sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.status().photos, 0);

        for expected in 1..=3 {
            handle.trigger().await.unwrap();
            assert_eq!(handle.status().photos, expected);
            sleep(Duration::from_secs(3)).await;
        }
        assert!(matches!(
            handle.trigger().await,
            Err(EngineError::Session(SessionError::SessionFull))
        ));

        assert_eq!(handle.remove_photo(0).await.unwrap(), 2);
        assert!(matches!(
            handle.remove_photo(5).await,
            Err(EngineError::Session(SessionError::IndexOutOfRange { index: 5, len: 2 }))
        ));
        handle.trigger().await.unwrap();

        let short = RegistrationForm::new("jdoe", "abc", "Jane Doe");
        assert!(matches!(
            handle.submit_registration(short).await,
            Err(EngineError::Submission(SubmissionError::Invalid(_)))
        ));

        let identity = handle
            .submit_registration(RegistrationForm::new("jdoe", "abcdef", "Jane Doe"))
            .await
            .unwrap();
        assert_eq!(identity.identifier, "jdoe");
        assert_eq!(identity.display_name, "Jane Doe");
        assert_eq!(handle.status().photos, 0);

        let photo_counts: Vec<usize> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::PhotoAdded { count } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(photo_counts, vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_replay_detector_skips_missing_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        std::fs::write(&path, "null\n").unwrap();
        let recording = path.display().to_string();

        let (_, source) = replay_detector(vec!["/nonexistent/a.jsonl".into(), recording.clone()])
            .await
            .unwrap();
        assert_eq!(source, recording);

        let err = replay_detector(vec!["/nonexistent/a.jsonl".into()])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/a.jsonl"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attendance_has_no_photos_to_remove() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _events) = spawn_engine(
            settings(CaptureMode::Manual, 0, 0),
            source(),
            replay(vec![ready()]),
            attendance(&sink),
        );
        assert!(matches!(
            handle.remove_photo(0).await,
            Err(EngineError::WrongFlow(_))
        ));
        assert!(matches!(
            handle
                .submit_registration(RegistrationForm::new("jdoe", "abcdef", "Jane Doe"))
                .await,
            Err(EngineError::WrongFlow(_))
        ));
    }
}
