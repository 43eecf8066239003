//! # Processing pipeline
//!
//! Owns the detector, the scheduler and the pose snapshot pair, and runs
//! them on a dedicated thread fed through the frame mailbox. The capture
//! side submits frames and polls results; it never blocks on processing.

use crate::frame::Frame;
use crate::mailbox::FrameMailbox;
use crate::motion::{MotionConfig, MotionDetector, MotionObservation};
use crate::pose::{PoseProvider, PoseSnapshot, RobotState};
use crate::schedule::{ModeSchedule, ModeScheduler, ModeSet, VisionMode};
use crate::viz::DebugImageList;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

/// Everything produced for one processed frame.
///
/// Exactly one of these is published per frame picked up from the mailbox,
/// even when the pipeline is idle; consumers can use the stream itself as a
/// liveness signal.
#[derive(Clone, Debug, Default)]
pub struct VisionResult {
    pub timestamp_ms: u32,
    pub observations: Vec<MotionObservation>,
    /// Modes the schedule selected for this frame.
    pub modes_processed: ModeSet,
    pub debug_images: DebugImageList,
}

enum ControlRequest {
    Enable(VisionMode, bool),
    PushSchedule(ModeSchedule),
    PopSchedule,
}

/// Handle to the processing thread.
///
/// Dropping the handle stops the thread; an in-flight frame finishes first.
pub struct VisionPipeline {
    mailbox: Arc<FrameMailbox<VisionResult>>,
    running: Arc<AtomicBool>,
    control: mpsc::Sender<ControlRequest>,
    worker: Option<JoinHandle<()>>,
}

impl VisionPipeline {
    /// Spawn the processing thread.
    ///
    /// # Arguments
    ///
    /// * `config` - motion detector tunables.
    /// * `pose_provider` - builds a pose snapshot for every processed frame.
    /// * `base_schedule` - permanent bottom of the schedule stack.
    /// * `capture_debug` - whether detectors record named debug rasters.
    pub fn new(
        config: MotionConfig,
        pose_provider: impl PoseProvider + Send + 'static,
        base_schedule: ModeSchedule,
        capture_debug: bool,
    ) -> Self {
        let mailbox = Arc::new(FrameMailbox::new());
        let running = Arc::new(AtomicBool::new(true));
        let (control, control_rx) = mpsc::channel();

        let worker = {
            let mailbox = mailbox.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                run(
                    &mailbox,
                    &running,
                    control_rx,
                    config,
                    pose_provider,
                    base_schedule,
                    capture_debug,
                )
            })
        };

        Self {
            mailbox,
            running,
            control,
            worker: Some(worker),
        }
    }

    /// Shared mailbox, for consumers that want to read frames directly.
    pub fn mailbox(&self) -> Arc<FrameMailbox<VisionResult>> {
        self.mailbox.clone()
    }

    /// Hand a captured frame to the processing thread. Never blocks; an
    /// unprocessed older frame is dropped.
    pub fn submit_frame(&self, frame: Frame, state: RobotState) {
        self.mailbox.submit_frame(frame, state);
    }

    /// Non-blocking poll of the oldest unread result.
    pub fn try_pop_result(&self) -> Option<VisionResult> {
        self.mailbox.try_pop_result()
    }

    /// Request enabling or disabling a mode. Takes effect at the next frame
    /// boundary.
    pub fn enable_mode(&self, mode: VisionMode, enabled: bool) -> Result<()> {
        self.send(ControlRequest::Enable(mode, enabled))
    }

    /// Request a temporary schedule override.
    pub fn push_schedule(&self, schedule: ModeSchedule) -> Result<()> {
        self.send(ControlRequest::PushSchedule(schedule))
    }

    /// Request removal of the top schedule override.
    pub fn pop_schedule(&self) -> Result<()> {
        self.send(ControlRequest::PopSchedule)
    }

    fn send(&self, request: ControlRequest) -> Result<()> {
        self.control
            .send(request)
            .map_err(|_| anyhow!("vision pipeline thread is gone"))
    }
}

impl Drop for VisionPipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("vision pipeline thread panicked");
            }
        }
    }
}

fn run(
    mailbox: &FrameMailbox<VisionResult>,
    running: &AtomicBool,
    control: mpsc::Receiver<ControlRequest>,
    config: MotionConfig,
    mut pose_provider: impl PoseProvider,
    base_schedule: ModeSchedule,
    capture_debug: bool,
) {
    let mut detector = MotionDetector::new(config);
    let mut scheduler = ModeScheduler::new(base_schedule);
    let mut prev_snapshot: Option<PoseSnapshot> = None;

    log::info!("vision pipeline running");

    while running.load(Ordering::Acquire) {
        // Queue up control requests; the scheduler applies them at the next
        // frame boundary
        while let Ok(request) = control.try_recv() {
            match request {
                ControlRequest::Enable(mode, enabled) => scheduler.enable(mode, enabled),
                ControlRequest::PushSchedule(schedule) => scheduler.push_schedule(schedule),
                ControlRequest::PopSchedule => scheduler.pop_schedule(),
            }
        }

        let (frame, state) = match mailbox.advance() {
            Some(entry) => entry,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        scheduler.begin_frame();
        let snapshot = pose_provider.snapshot(&state, frame.timestamp_ms);

        let mut result = VisionResult {
            timestamp_ms: frame.timestamp_ms,
            modes_processed: VisionMode::ALL
                .into_iter()
                .filter(|m| scheduler.should_process(*m))
                .collect(),
            ..Default::default()
        };

        if scheduler.should_process(VisionMode::Motion) {
            let prev = prev_snapshot.as_ref().unwrap_or(&snapshot);
            let mut debug = capture_debug.then(DebugImageList::default);

            match detector.detect(&frame, &snapshot, prev, debug.as_mut()) {
                Ok(observations) => result.observations = observations,
                Err(err) => log::error!("motion detection failed: {err}"),
            }
            if let Some(debug) = debug {
                result.debug_images = debug;
            }
        }

        // Idle frames still publish, with nothing in them
        mailbox.push_result(result);
        prev_snapshot = Some(snapshot);
    }

    log::info!("vision pipeline stopped");
}

/// Convenience constructor for standalone use: every mode runs on every
/// frame it is enabled for.
pub fn default_schedule() -> ModeSchedule {
    ModeSchedule::default()
}
