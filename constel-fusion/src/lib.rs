//! 6-DoF inertial/visual fusion for the constellation tracker.
//!
//! The tracker core drives a fusion filter through the [`PoseFilter`] trait:
//! IMU samples stream in continuously, camera observations arrive late and
//! are injected at their historical capture time through pre-registered
//! *delay slots*. [`ConstantVelocityFilter`] is a reference implementation;
//! production builds may substitute a full unscented filter behind the same
//! trait.

use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};

use constel_types::SlotId;

mod cv_filter;
mod motion_model;

pub use cv_filter::{ConstantVelocityFilter, CvFilterParams};

/// Filter output at a requested device time.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredPose {
    pub pose: Isometry3<f64>,
    /// Linear velocity, world frame, m/s.
    pub velocity: Vector3<f64>,
    /// Angular velocity, body frame, rad/s.
    pub angular_velocity: Vector3<f64>,
    /// Linear acceleration with gravity removed, world frame, m/s².
    pub acceleration: Vector3<f64>,
    /// Positional standard deviation per world axis, meters.
    pub pos_error: Vector3<f64>,
    /// Rotational standard deviation per axis, radians.
    pub rot_error: Vector3<f64>,
}

/// One IMU sample on the device's nanosecond timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub device_time_ns: u64,
    /// Body-frame angular velocity, rad/s.
    pub ang_vel: Vector3<f64>,
    /// Body-frame specific force, m/s².
    pub accel: Vector3<f64>,
    pub mag: Option<Vector3<f64>>,
}

/// The five filter operations the tracker core uses, plus IMU input.
///
/// All times are nanoseconds on the device's monotonic clock. Implementations
/// must accept a `pose_update`/`position_update` for any slot previously
/// passed to `prepare_delay_slot` and not yet released.
pub trait PoseFilter: Send {
    /// Reset to the initial state, dropping all delay slots.
    fn clear(&mut self);

    fn imu_update(&mut self, sample: &ImuSample);

    /// Register `slot` so a later measurement can be applied as if it had
    /// arrived at `device_time_ns`.
    fn prepare_delay_slot(&mut self, device_time_ns: u64, slot: SlotId);

    /// Drop `slot` without applying a measurement.
    fn release_delay_slot(&mut self, slot: SlotId);

    /// Apply a full 6-DoF observation at the time registered for `slot`.
    fn pose_update(&mut self, device_time_ns: u64, pose: &Isometry3<f64>, slot: SlotId);

    /// Apply a position-only observation at the time registered for `slot`.
    fn position_update(&mut self, device_time_ns: u64, pos: &Point3<f64>, slot: SlotId);

    /// Pose, derivatives and uncertainty extrapolated to `device_time_ns`.
    fn get_pose_at(&self, device_time_ns: u64) -> FilteredPose;
}

pub(crate) fn quat_from_body_rates(ang_vel: &Vector3<f64>, dt: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(ang_vel * dt)
}
