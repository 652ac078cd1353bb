//! Per-sensor capture pipeline: USB callbacks, fast analysis worker, long
//! analysis worker.
//!
//! Lock discipline: the sensor lock protects frame ownership (the three
//! queues plus the current capture slot), the shutdown flag and the stats.
//! It is never held while calling into the tracker or a device; callbacks
//! collect the upstream work under the lock and perform it after unlocking.

use std::sync::{Arc, Weak};
use std::time::Instant;

use nalgebra::Isometry3;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use constel_types::{ExposureInfo, Intrinsics};

use crate::correspondence;
use crate::frame::{CaptureFrame, DeviceCaptureState, NUM_CAPTURE_BUFFERS};
use crate::frame_queue::FrameQueue;
use crate::tracker::Tracker;
use crate::vision::{BlobExtractor, CorrespondenceSolver, PnpSolver, PoseEvaluator};
use crate::{Error, Result};

/// Static sensor configuration from the calibration reader.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub serial: String,
    pub intrinsics: Intrinsics,
}

/// Pipeline counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SensorStats {
    pub frames_started: u64,
    pub frames_delivered: u64,
    pub dropped_frames: u64,
    pub frames_without_exposure: u64,
    pub fast_analyses: u64,
    pub long_analyses: u64,
    pub poses_found: u64,
}

/// Everything a frame release must tell the tracker after the sensor lock
/// is dropped.
struct ReleaseInfo {
    start_ts: u64,
    exposure: Option<ExposureInfo>,
    already_released: Vec<bool>,
}

impl ReleaseInfo {
    fn from_frame(frame: &mut CaptureFrame) -> Self {
        ReleaseInfo {
            start_ts: frame.start_ts,
            exposure: frame.exposure.take(),
            already_released: frame
                .device_state
                .iter()
                .map(|d| d.exposure_released)
                .collect(),
        }
    }
}

struct SensorShared {
    capture_q: FrameQueue,
    fast_q: FrameQueue,
    long_q: FrameQueue,
    cur_capture: Option<Box<CaptureFrame>>,
    /// Latest exposure broadcast received from the tracker.
    last_exposure: Option<ExposureInfo>,
    long_busy: bool,
    shutdown: bool,
    stats: SensorStats,
    have_camera_pose: bool,
    /// Camera-to-world rigid transform, valid once `have_camera_pose`.
    camera_pose: Isometry3<f64>,
}

/// One infrared sensor and its analysis pipeline.
pub struct Sensor {
    serial: String,
    intrinsics: Intrinsics,
    tracker: Weak<Tracker>,
    adopt_window_ns: u64,
    epoch: Instant,
    shared: Mutex<SensorShared>,
    cond: Condvar,
    pub(crate) detector: Mutex<Box<dyn BlobExtractor>>,
    pub(crate) solver: Mutex<Box<dyn CorrespondenceSolver>>,
    evaluator: Arc<dyn PoseEvaluator>,
    pnp: Arc<dyn PnpSolver>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Sensor {
    pub fn new(
        config: SensorConfig,
        tracker: &Arc<Tracker>,
        detector: Box<dyn BlobExtractor>,
        solver: Box<dyn CorrespondenceSolver>,
        evaluator: Arc<dyn PoseEvaluator>,
        pnp: Arc<dyn PnpSolver>,
    ) -> Result<Arc<Sensor>> {
        let intr = &config.intrinsics;
        if intr.width == 0 || intr.height == 0 {
            return Err(Error::InvalidCalibration("zero frame dimensions"));
        }
        if intr.camera_matrix[(0, 0)] <= 0.0 || intr.camera_matrix[(1, 1)] <= 0.0 {
            return Err(Error::InvalidCalibration("non-positive focal length"));
        }

        let mut capture_q = FrameQueue::new();
        for id in 0..NUM_CAPTURE_BUFFERS {
            capture_q.push(Box::new(CaptureFrame::new(id, intr.width, intr.height)));
        }

        let adopt_window_ns = tracker.config().exposure_adopt_window_us * 1000;
        Ok(Arc::new(Sensor {
            serial: config.serial,
            intrinsics: config.intrinsics,
            tracker: Arc::downgrade(tracker),
            adopt_window_ns,
            epoch: Instant::now(),
            shared: Mutex::new(SensorShared {
                capture_q,
                fast_q: FrameQueue::new(),
                long_q: FrameQueue::new(),
                cur_capture: None,
                last_exposure: None,
                long_busy: false,
                shutdown: false,
                stats: SensorStats::default(),
                have_camera_pose: false,
                camera_pose: Isometry3::identity(),
            }),
            cond: Condvar::new(),
            detector: Mutex::new(detector),
            solver: Mutex::new(solver),
            evaluator,
            pnp,
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn stats(&self) -> SensorStats {
        self.shared.lock().stats
    }

    /// Spawn the fast and long analysis workers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(Error::AlreadyStarted);
        }
        let fast = {
            let sensor = Arc::clone(self);
            std::thread::Builder::new()
                .name(format!("constel-fast-{}", self.serial))
                .spawn(move || sensor.run_fast())?
        };
        let long = {
            let sensor = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name(format!("constel-long-{}", self.serial))
                .spawn(move || sensor.run_long());
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    // Don't leave the fast worker running half-started.
                    self.shared.lock().shutdown = true;
                    self.cond.notify_all();
                    let _ = fast.join();
                    return Err(e.into());
                }
            }
        };
        workers.push(fast);
        workers.push(long);
        info!(serial = %self.serial, "sensor workers started");
        Ok(())
    }

    /// Stop the workers and release every in-flight frame.
    pub fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            shared.shutdown = true;
        }
        self.cond.notify_all();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for w in workers {
            let _ = w.join();
        }

        // Drain leftover frames with the normal accounting.
        loop {
            let frame = {
                let mut shared = self.shared.lock();
                shared
                    .fast_q
                    .pop()
                    .or_else(|| shared.long_q.pop())
                    .or_else(|| shared.cur_capture.take())
            };
            match frame {
                Some(f) => self.release_frame(f),
                None => break,
            }
        }
        info!(serial = %self.serial, "sensor stopped");
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn tracker_handle(&self) -> Option<Arc<Tracker>> {
        self.tracker.upgrade()
    }

    pub(crate) fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub(crate) fn evaluator(&self) -> &Arc<dyn PoseEvaluator> {
        &self.evaluator
    }

    pub(crate) fn pnp(&self) -> &Arc<dyn PnpSolver> {
        &self.pnp
    }

    /// The sensor's camera-to-world transform once bootstrapped.
    pub fn camera_pose(&self) -> Option<Isometry3<f64>> {
        let shared = self.shared.lock();
        shared.have_camera_pose.then_some(shared.camera_pose)
    }

    /// Install the bootstrapped camera pose. Only the first call per sensor
    /// lifetime takes effect.
    pub(crate) fn set_camera_pose(&self, pose: Isometry3<f64>) {
        let mut shared = self.shared.lock();
        if shared.have_camera_pose {
            debug!(serial = %self.serial, "camera pose already set; ignoring");
            return;
        }
        shared.have_camera_pose = true;
        shared.camera_pose = pose;
        info!(serial = %self.serial, "camera pose bootstrapped");
    }

    pub(crate) fn bump_poses_found(&self) {
        self.shared.lock().stats.poses_found += 1;
    }

    /// USB start-of-frame callback. Never blocks: a frame is taken from the
    /// pool, reclaimed from the fast queue (dropping its analysis), or the
    /// undelivered current capture is reused.
    pub fn on_start_of_frame(&self, start_ts: u64) {
        let mut synthetic: Option<ReleaseInfo> = None;
        let frame = {
            let mut shared = self.shared.lock();
            if shared.shutdown {
                return;
            }
            let exposure = shared.last_exposure.clone();

            let mut frame = if let Some(mut prev) = shared.cur_capture.take() {
                // The previous capture never completed; reuse its buffer and
                // pair its announced start with a synthetic release.
                warn!(
                    serial = %self.serial,
                    start_ts = prev.start_ts,
                    "capture never delivered; reusing frame"
                );
                shared.stats.dropped_frames += 1;
                synthetic = Some(ReleaseInfo::from_frame(&mut prev));
                prev
            } else if let Some(f) = shared.capture_q.pop() {
                f
            } else if let Some(mut f) = shared.fast_q.rewind() {
                // Analysis is running behind; sacrifice the most recently
                // queued frame.
                warn!(
                    serial = %self.serial,
                    start_ts = f.start_ts,
                    "no free frame; reclaiming from fast queue"
                );
                shared.stats.dropped_frames += 1;
                synthetic = Some(ReleaseInfo::from_frame(&mut f));
                f
            } else {
                panic!("no capture frame available at start-of-frame");
            };

            frame.reset_for_capture(start_ts, exposure);
            shared.stats.frames_started += 1;
            frame
        };

        // Settle the claims before the frame becomes visible for exposure
        // adoption, so a concurrent exposure change always finds its claims
        // in place.
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.frame_started(start_ts, frame.exposure.as_ref());
            if let Some(rel) = synthetic {
                tracker.frame_released(rel.start_ts, rel.exposure.as_ref(), &rel.already_released);
            }
        }

        let mut shared = self.shared.lock();
        if shared.shutdown {
            // Raced with stop(): the drain already ran, release by hand.
            drop(shared);
            self.release_frame(frame);
            return;
        }
        // An exposure that arrived while the claims were settling applies to
        // the next frame; this one keeps its start-of-frame snapshot.
        if let Some(stale) = shared.cur_capture.replace(frame) {
            drop(shared);
            self.release_frame(stale);
        }
    }

    /// USB frame-complete callback. `start_ts` must match the in-progress
    /// capture announced by the last `on_start_of_frame`.
    pub fn on_frame_captured(&self, start_ts: u64, pixels: &[u8]) {
        let no_exposure_release = {
            let mut shared = self.shared.lock();
            if shared.shutdown {
                return;
            }
            let mut frame = shared
                .cur_capture
                .take()
                .expect("frame delivered with no capture in progress");
            assert_eq!(
                frame.start_ts, start_ts,
                "delivered frame is not the current capture"
            );

            if frame.exposure.is_none() {
                // Nothing to analyse against; straight back to the pool.
                shared.stats.frames_without_exposure += 1;
                let rel = ReleaseInfo::from_frame(&mut frame);
                shared.capture_q.push(frame);
                Some(rel)
            } else {
                let n = pixels.len().min(frame.pixels.len());
                frame.pixels[..n].copy_from_slice(&pixels[..n]);
                frame.timestamps.delivered = Some(self.now_ns());

                let device_state: Vec<_> = frame
                    .exposure
                    .as_ref()
                    .expect("exposure checked above")
                    .devices
                    .iter()
                    .map(|d| {
                        let gravity_error_rad =
                            (d.rot_error.x.powi(2) + d.rot_error.z.powi(2)).sqrt();
                        DeviceCaptureState::new(d.capture_pose, gravity_error_rad)
                    })
                    .collect();
                frame.device_state = device_state;

                shared.stats.frames_delivered += 1;
                shared.fast_q.push(frame);
                None
            }
        };

        match no_exposure_release {
            Some(rel) => {
                if let Some(tracker) = self.tracker.upgrade() {
                    tracker.frame_released(rel.start_ts, rel.exposure.as_ref(), &[]);
                }
            }
            None => {
                self.cond.notify_all();
            }
        }
    }

    /// Tracker broadcast of a (possibly new) exposure. May bind it to the
    /// frame currently in capture: unconditionally when the frame has none
    /// yet, otherwise only within the adoption window of its start-of-frame
    /// timestamp.
    pub(crate) fn sensor_update_exposure(&self, info: &ExposureInfo) {
        enum Adopt {
            Claim(ExposureInfo),
            Change(ExposureInfo, ExposureInfo),
        }

        let action = {
            let mut shared = self.shared.lock();
            shared.last_exposure = Some(info.clone());
            match &mut shared.cur_capture {
                Some(frame) => {
                    let cur_count = frame.exposure.as_ref().map(|e| e.count);
                    match cur_count {
                        None => {
                            frame.exposure = Some(info.clone());
                            Some(Adopt::Claim(info.clone()))
                        }
                        Some(count) if count != info.count => {
                            if info.local_ts.abs_diff(frame.start_ts) <= self.adopt_window_ns {
                                let old =
                                    frame.exposure.replace(info.clone()).expect("count checked");
                                Some(Adopt::Change(old, info.clone()))
                            } else {
                                debug!(
                                    serial = %self.serial,
                                    count = info.count,
                                    "late exposure not adopted"
                                );
                                None
                            }
                        }
                        Some(_) => None,
                    }
                }
                None => None,
            }
        };

        match action {
            Some(Adopt::Claim(new)) => {
                if let Some(tracker) = self.tracker.upgrade() {
                    tracker.frame_changed_exposure(None, &new);
                }
            }
            Some(Adopt::Change(old, new)) => {
                if let Some(tracker) = self.tracker.upgrade() {
                    tracker.frame_changed_exposure(Some(&old), &new);
                }
            }
            None => {}
        }
    }

    /// Return a frame to the pool and settle its claims with the tracker.
    fn release_frame(&self, mut frame: Box<CaptureFrame>) {
        let rel = ReleaseInfo::from_frame(&mut frame);
        frame.observation = None;
        {
            let mut shared = self.shared.lock();
            shared.capture_q.push(frame);
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.frame_released(rel.start_ts, rel.exposure.as_ref(), &rel.already_released);
        }
    }

    fn run_fast(self: Arc<Self>) {
        loop {
            let mut frame = {
                let mut shared = self.shared.lock();
                loop {
                    if shared.shutdown {
                        return;
                    }
                    if let Some(f) = shared.fast_q.pop() {
                        shared.stats.fast_analyses += 1;
                        break f;
                    }
                    self.cond.wait(&mut shared);
                }
            };

            frame.timestamps.fast_analysis_start = Some(self.now_ns());
            correspondence::process_frame_fast(&self, &mut frame);
            frame.timestamps.fast_analysis_finish = Some(self.now_ns());

            let to_release = {
                let mut shared = self.shared.lock();
                if frame.need_long_analysis && !shared.shutdown {
                    // Only one pending long frame; the newest wins.
                    let displaced = shared.long_q.rewind();
                    shared.long_q.push(frame);
                    drop(shared);
                    self.cond.notify_all();
                    displaced
                } else {
                    Some(frame)
                }
            };
            if let Some(f) = to_release {
                self.release_frame(f);
            }
        }
    }

    fn run_long(self: Arc<Self>) {
        loop {
            let mut frame = {
                let mut shared = self.shared.lock();
                loop {
                    if shared.shutdown {
                        return;
                    }
                    if let Some(f) = shared.long_q.pop() {
                        shared.long_busy = true;
                        shared.stats.long_analyses += 1;
                        break f;
                    }
                    self.cond.wait(&mut shared);
                }
            };

            frame.timestamps.long_analysis_start = Some(self.now_ns());
            correspondence::process_frame_long(&self, &mut frame);
            frame.timestamps.long_analysis_finish = Some(self.now_ns());

            self.shared.lock().long_busy = false;
            self.release_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn bad_calibration_is_rejected() {
        let tracker = Tracker::new(Default::default());
        let intr = Intrinsics {
            camera_matrix: Matrix3::identity(),
            distortion: [0.0; 5],
            dist_fisheye: false,
            width: 0,
            height: 960,
        };
        let err = Sensor::new(
            SensorConfig {
                serial: "BAD".into(),
                intrinsics: intr,
            },
            &tracker,
            Box::new(NullDetector),
            Box::new(NullSolver),
            Arc::new(crate::ProjectiveEvaluator::default()),
            Arc::new(NullPnp),
        )
        .err();
        assert!(matches!(err, Some(Error::InvalidCalibration(_))));
    }

    #[test]
    fn stats_serialize_for_telemetry() {
        let stats = SensorStats {
            frames_started: 3,
            dropped_frames: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: SensorStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }

    struct NullDetector;
    impl BlobExtractor for NullDetector {
        fn process(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _led_phase: u8,
        ) -> crate::vision::BlobObservation {
            Default::default()
        }
        fn update_labels(
            &mut self,
            _observation: &crate::vision::BlobObservation,
            _device: constel_types::DeviceId,
        ) {
        }
    }

    struct NullSolver;
    impl CorrespondenceSolver for NullSolver {
        fn set_model(
            &mut self,
            _device: constel_types::DeviceId,
            _model: &constel_types::LedModel,
        ) -> bool {
            true
        }
        fn set_blobs(&mut self, _blobs: &[constel_types::Blob]) {}
        fn find_pose(
            &mut self,
            _device: constel_types::DeviceId,
            _flags: constel_types::SearchFlags,
        ) -> Option<(Isometry3<f64>, constel_types::PoseMetrics)> {
            None
        }
        fn find_pose_aligned(
            &mut self,
            _device: constel_types::DeviceId,
            _flags: constel_types::SearchFlags,
            _gravity: &nalgebra::Vector3<f64>,
            _tolerance_rad: f64,
        ) -> Option<(Isometry3<f64>, constel_types::PoseMetrics)> {
            None
        }
    }

    struct NullPnp;
    impl PnpSolver for NullPnp {
        fn estimate(
            &self,
            _blobs: &[constel_types::Blob],
            _device: constel_types::DeviceId,
            _model: &constel_types::LedModel,
            _intrinsics: &Intrinsics,
            _initial: &Isometry3<f64>,
        ) -> Option<Isometry3<f64>> {
            None
        }
    }
}
