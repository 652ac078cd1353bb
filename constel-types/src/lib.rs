//! Shared types for the constellation tracker.
//!
//! Everything here is plain data: device identity, LED constellation models,
//! blob observations, exposure bookkeeping and tracker configuration. The
//! pipeline crates (`constel`, `constel-fusion`) depend on this crate; it
//! depends on nothing but math and serde.

use bitflags::bitflags;
use nalgebra::{Isometry3, Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Number of Kalman delay slots per tracked device.
pub const NUM_POSE_DELAY_SLOTS: usize = 3;

/// Identifies one tracked device. Device 0 is conventionally the HMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u8);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// What kind of device this is, fixed at construction.
///
/// The HMD gets the special-case behavior (view-axis mirroring, exhaustive
/// blob matching, camera-pose bootstrap source); controllers do not. Keeping
/// this as a capability carrier avoids id checks scattered through the
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Hmd,
    Controller,
}

impl DeviceKind {
    /// HMD poses are mirrored in XZ to convert device axes to view axes.
    #[inline]
    pub fn mirrors_view_axes(&self) -> bool {
        matches!(self, DeviceKind::Hmd)
    }

    /// The deep search tries to account for every blob for this device.
    #[inline]
    pub fn matches_all_blobs(&self) -> bool {
        matches!(self, DeviceKind::Hmd)
    }

    /// Only a confident HMD observation may bootstrap a sensor's
    /// world-to-camera transform.
    #[inline]
    pub fn can_bootstrap_camera_pose(&self) -> bool {
        matches!(self, DeviceKind::Hmd)
    }
}

/// One delay slot within a device's fusion filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u8);

impl SlotId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Packed blob label: device id in the high byte, LED index in the low byte.
///
/// `LedLabel::INVALID` marks an unlabelled blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedLabel(u16);

impl LedLabel {
    pub const INVALID: LedLabel = LedLabel(u16::MAX);

    #[inline]
    pub fn new(device: DeviceId, led_index: u8) -> Self {
        LedLabel(((device.0 as u16) << 8) | led_index as u16)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != LedLabel::INVALID
    }

    /// The device this label belongs to, if the label is valid.
    #[inline]
    pub fn device(&self) -> Option<DeviceId> {
        if self.is_valid() {
            Some(DeviceId((self.0 >> 8) as u8))
        } else {
            None
        }
    }

    #[inline]
    pub fn led_index(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl Default for LedLabel {
    fn default() -> Self {
        LedLabel::INVALID
    }
}

/// A bright connected region extracted from a captured frame: a candidate
/// LED observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    /// Center, in distorted pixel coordinates.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Current label, assigned by matching against an accepted pose.
    pub led_id: LedLabel,
    /// Label from the previous frame, kept for fast re-acquisition.
    pub prev_led_id: LedLabel,
    /// Accumulated blink-pattern bits for this blob track.
    pub pattern: u16,
    /// Number of frames this blob track has been observed.
    pub pattern_age: u32,
}

impl Blob {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Blob {
            x,
            y,
            width,
            height,
            led_id: LedLabel::INVALID,
            prev_led_id: LedLabel::INVALID,
            pattern: 0,
            pattern_age: 0,
        }
    }

    /// The device this blob is currently or was previously labelled to.
    pub fn labelled_device(&self) -> Option<DeviceId> {
        self.led_id.device().or_else(|| self.prev_led_id.device())
    }
}

/// One LED of a device's constellation model, in model coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedPoint {
    pub pos: Point3<f64>,
    /// Outward emission direction (unit vector).
    pub dir: Vector3<f64>,
}

/// The known 3D LED constellation of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedModel {
    pub points: Vec<LedPoint>,
}

impl LedModel {
    pub fn new(points: Vec<LedPoint>) -> Self {
        LedModel { points }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Pinhole intrinsics plus distortion for one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub camera_matrix: Matrix3<f64>,
    /// Plumb-bob coefficients `{k1, k2, p1, p2, k3}` at indices `{0..4}`.
    pub distortion: [f64; 5],
    /// Fisheye (equidistant) distortion model instead of plumb bob.
    pub dist_fisheye: bool,
    pub width: u32,
    pub height: u32,
}

impl Intrinsics {
    /// Project a camera-frame point through the camera matrix.
    ///
    /// Distortion is not applied here; the callers that need distorted
    /// coordinates run through the external undistortion tables.
    pub fn project(&self, pt: &Point3<f64>) -> Option<Point2<f64>> {
        if pt.z <= 0.0 {
            return None;
        }
        let k = &self.camera_matrix;
        let x = pt.x / pt.z;
        let y = pt.y / pt.z;
        Some(Point2::new(
            k[(0, 0)] * x + k[(0, 2)],
            k[(1, 1)] * y + k[(1, 2)],
        ))
    }
}

bitflags! {
    /// Flags controlling one correspondence-search invocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SearchFlags: u8 {
        /// Return as soon as a strong match is found.
        const STOP_FOR_STRONG_MATCH = 0b0001;
        /// Try to account for every blob (HMD only).
        const MATCH_ALL_BLOBS       = 0b0010;
        /// Bounded-depth search pass.
        const SHALLOW_SEARCH        = 0b0100;
        /// Full search pass.
        const DEEP_SEARCH           = 0b1000;
    }
}

/// Result of scoring a candidate pose against the current blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseMetrics {
    pub matched_blobs: u32,
    pub visible_leds: u32,
    /// RMS reprojection distance over matched blobs, in pixels.
    pub reproj_error: f64,
    pub good_pose_match: bool,
    pub strong_pose_match: bool,
}

/// Reference pose plus uncertainty, for prior-aware scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct PosePrior {
    pub pose: Isometry3<f64>,
    /// Positional standard deviation per world axis, meters.
    pub pos_error: Vector3<f64>,
    /// Rotational standard deviation per axis, radians.
    pub rot_error: Vector3<f64>,
}

/// Per-device entry of an exposure broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureDeviceInfo {
    /// Device clock at the moment the exposure began, nanoseconds.
    pub device_time_ns: u64,
    /// Fusion pose of the device at exposure time, model frame.
    pub capture_pose: Isometry3<f64>,
    pub pos_error: Vector3<f64>,
    pub rot_error: Vector3<f64>,
    /// Delay slot reserved for this exposure, `None` when none was free.
    pub fusion_slot: Option<SlotId>,
}

/// Tracker-wide exposure snapshot, bound to frames at start-of-frame.
///
/// `count` is monotonic. `devices` holds the devices known when the exposure
/// began; devices added later do not get retroactive slots.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureInfo {
    /// Host monotonic clock when the exposure was registered, nanoseconds.
    pub local_ts: u64,
    /// HMD wall timestamp of the exposure report.
    pub hmd_ts: u32,
    pub count: u16,
    pub led_pattern_phase: u8,
    pub devices: Vec<ExposureDeviceInfo>,
}

/// Which filter operation an accepted camera pose feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Full 6-DoF pose update.
    #[default]
    PoseUpdate,
    /// Position-only update; orientation comes from the IMU alone.
    PositionUpdate,
}

fn default_pose_lost_threshold_ms() -> u64 {
    500
}

fn default_exposure_adopt_window_us() -> u64 {
    5000
}

fn default_position_smoothing() -> f64 {
    0.6
}

fn default_orientation_smoothing() -> f64 {
    0.7
}

fn default_imu_pending_capacity() -> usize {
    256
}

/// Runtime tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    /// After this long without a camera observation, the reported position
    /// freezes while orientation keeps following the filter.
    #[serde(default = "default_pose_lost_threshold_ms")]
    pub pose_lost_threshold_ms: u64,
    /// A mid-capture exposure change is adopted only within this window of
    /// the frame's start-of-frame timestamp.
    #[serde(default = "default_exposure_adopt_window_us")]
    pub exposure_adopt_window_us: u64,
    /// Exponential smoothing factor for the reported position, 0..1.
    /// Higher follows the filter more quickly.
    #[serde(default = "default_position_smoothing")]
    pub position_smoothing: f64,
    /// Exponential smoothing factor for the reported orientation, 0..1.
    #[serde(default = "default_orientation_smoothing")]
    pub orientation_smoothing: f64,
    /// Bound on the per-device pending-IMU telemetry buffer.
    #[serde(default = "default_imu_pending_capacity")]
    pub imu_pending_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            update_policy: UpdatePolicy::default(),
            pose_lost_threshold_ms: default_pose_lost_threshold_ms(),
            exposure_adopt_window_us: default_exposure_adopt_window_us(),
            position_smoothing: default_position_smoothing(),
            orientation_smoothing: default_orientation_smoothing(),
            imu_pending_capacity: default_imu_pending_capacity(),
        }
    }
}
