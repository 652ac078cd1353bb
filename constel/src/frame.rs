//! Capture frames and their per-device analysis state.

use nalgebra::Isometry3;

use constel_types::{ExposureInfo, PoseMetrics};

use crate::vision::BlobObservation;

/// Frames in flight per sensor: one capturing, one in fast analysis, one in
/// long analysis, one queued.
pub const NUM_CAPTURE_BUFFERS: usize = 4;

/// Telemetry timestamps for one trip through the pipeline, nanoseconds on
/// the sensor's local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimestamps {
    pub delivered: Option<u64>,
    pub fast_analysis_start: Option<u64>,
    pub blob_extract_finish: Option<u64>,
    pub fast_analysis_finish: Option<u64>,
    pub long_analysis_start: Option<u64>,
    pub long_analysis_finish: Option<u64>,
}

/// Per-device state snapshotted into a frame when its capture completes,
/// then filled in by the analysis stages.
#[derive(Debug, Clone)]
pub struct DeviceCaptureState {
    /// Fusion pose of the device at exposure time, world frame.
    pub capture_world_pose: Isometry3<f64>,
    /// Gravity-vector uncertainty at exposure time, radians
    /// (`sqrt(rot_error.x² + rot_error.z²)`).
    pub gravity_error_rad: f64,
    /// Refined object-to-camera pose once a match was accepted.
    pub final_cam_pose: Option<Isometry3<f64>>,
    /// A pose for this device was accepted and applied upstream.
    pub found_device_pose: bool,
    /// The device's exposure claim was already released (early release on
    /// pose acceptance); the final frame release must skip it.
    pub exposure_released: bool,
    pub score: PoseMetrics,
}

impl DeviceCaptureState {
    pub(crate) fn new(capture_world_pose: Isometry3<f64>, gravity_error_rad: f64) -> Self {
        DeviceCaptureState {
            capture_world_pose,
            gravity_error_rad,
            final_cam_pose: None,
            found_device_pose: false,
            exposure_released: false,
            score: PoseMetrics::default(),
        }
    }
}

/// One owned frame buffer cycling through the capture pipeline.
///
/// A frame is reachable from exactly one place at any time: the capture
/// queue, the fast queue, the long queue, the sensor's current-capture slot,
/// or a worker's hands.
#[derive(Debug)]
pub struct CaptureFrame {
    pub id: usize,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// USB start-of-frame timestamp, nanoseconds.
    pub start_ts: u64,
    /// Exposure snapshot bound at start-of-frame (or adopted shortly after).
    /// `None` means the frame has no exposure and skips analysis.
    pub exposure: Option<ExposureInfo>,
    /// Blobs extracted by the fast stage.
    pub observation: Option<BlobObservation>,
    /// One entry per device known at exposure time.
    pub device_state: Vec<DeviceCaptureState>,
    pub timestamps: FrameTimestamps,
    pub need_long_analysis: bool,
    pub long_analysis_found_new_blobs: bool,
}

impl CaptureFrame {
    pub(crate) fn new(id: usize, width: u32, height: u32) -> Self {
        CaptureFrame {
            id,
            pixels: vec![0u8; (width * height) as usize],
            width,
            height,
            start_ts: 0,
            exposure: None,
            observation: None,
            device_state: Vec::new(),
            timestamps: FrameTimestamps::default(),
            need_long_analysis: false,
            long_analysis_found_new_blobs: false,
        }
    }

    /// Devices known when this frame's exposure began.
    #[inline]
    pub fn n_devices(&self) -> usize {
        self.device_state.len()
    }

    /// Reset per-capture state for reuse. Pixel storage is kept.
    pub(crate) fn reset_for_capture(&mut self, start_ts: u64, exposure: Option<ExposureInfo>) {
        self.start_ts = start_ts;
        self.exposure = exposure;
        self.observation = None;
        self.device_state.clear();
        self.timestamps = FrameTimestamps::default();
        self.need_long_analysis = false;
        self.long_analysis_found_new_blobs = false;
    }
}
