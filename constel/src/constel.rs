//! Optical 6-DoF tracking of LED-constellation devices.
//!
//! One or more infrared sensors each observe the LEDs of a head-mounted
//! display and its controllers. Per sensor, a three-actor pipeline (USB
//! capture callback, fast analysis worker, long analysis worker) extracts
//! blobs from every frame, matches them against each device's known LED
//! model, and feeds accepted poses into the device's inertial fusion filter
//! at the exposure's historical timestamp through a bounded set of delay
//! slots.
//!
//! The crate is transport-agnostic: the USB/UVC layer drives a
//! [`Sensor`] through [`Sensor::on_start_of_frame`] /
//! [`Sensor::on_frame_captured`], and IMU drivers feed
//! [`Device::imu_update`]. The blob detector, PnP solver and
//! correspondence search are consumed through the traits in [`vision`].

mod correspondence;
mod device;
mod error;
mod frame;
mod frame_queue;
mod score;
mod sensor;
mod tracker;
pub mod vision;

pub use crate::device::{DelaySlotSnapshot, Device, PendingImu};
pub use crate::error::Error;
pub use crate::frame::{CaptureFrame, DeviceCaptureState, FrameTimestamps, NUM_CAPTURE_BUFFERS};
pub use crate::score::ProjectiveEvaluator;
pub use crate::sensor::{Sensor, SensorConfig, SensorStats};
pub use crate::tracker::Tracker;

pub type Result<T> = std::result::Result<T, Error>;

/// Most devices a tracker will accept: the HMD plus two controllers.
pub const MAX_TRACKED_DEVICES: usize = 3;
