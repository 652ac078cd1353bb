//! Per-device record: fusion filter handle, delay-slot bookkeeping, the
//! device's monotonic clock, and the smoothed output pose.

use std::collections::VecDeque;
use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use parking_lot::Mutex;
use tracing::{debug, warn};

use constel_fusion::{FilteredPose, ImuSample, PoseFilter};
use constel_types::{
    DeviceId, DeviceKind, ExposureDeviceInfo, LedModel, SlotId, TrackerConfig, UpdatePolicy,
    NUM_POSE_DELAY_SLOTS,
};

/// Mirror a pose in XZ, converting between device axes and view-plane axes.
/// This is an involution.
pub(crate) fn mirror_xz(pose: &Isometry3<f64>) -> Isometry3<f64> {
    let t = pose.translation.vector;
    let q = pose.rotation.quaternion();
    Isometry3::from_parts(
        Translation3::new(-t.x, t.y, -t.z),
        UnitQuaternion::from_quaternion(Quaternion::new(q.w, -q.i, q.j, -q.k)),
    )
}

/// An IMU sample buffered for telemetry flush.
#[derive(Debug, Clone, Copy)]
pub struct PendingImu {
    /// Host timestamp when the sample arrived, nanoseconds.
    pub local_ts: u64,
    pub sample: ImuSample,
}

/// Introspection snapshot of one delay slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySlotSnapshot {
    pub valid: bool,
    pub use_count: u32,
    pub device_time_ns: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DelaySlotState {
    valid: bool,
    use_count: u32,
    device_time_ns: u64,
}

struct Reported {
    device_time_ns: u64,
    pose: FilteredPose,
}

struct DeviceInner {
    filter: Box<dyn PoseFilter>,
    /// Extended 64-bit nanosecond device clock.
    device_time_ns: u64,
    last_device_ts: Option<u32>,
    slots: [DelaySlotState; NUM_POSE_DELAY_SLOTS],
    next_slot: usize,
    pending_imu: VecDeque<PendingImu>,
    last_observed_pose_ts: Option<u64>,
    last_observed_pose: Option<Isometry3<f64>>,
    /// Last smoothed view pose handed out.
    reported: Option<Reported>,
    /// Last model pose handed out, for the stale-position freeze.
    last_model_pose: Option<Isometry3<f64>>,
}

/// One tracked device. All mutable state sits behind the device lock; the
/// identity, LED model and IMU-to-model offset are fixed at construction.
pub struct Device {
    id: DeviceId,
    kind: DeviceKind,
    leds: LedModel,
    /// Rigid transform from the fusion (IMU) frame to the LED model frame.
    fusion_to_model: Isometry3<f64>,
    config: Arc<TrackerConfig>,
    inner: Mutex<DeviceInner>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        kind: DeviceKind,
        fusion_to_model: Isometry3<f64>,
        leds: LedModel,
        filter: Box<dyn PoseFilter>,
        config: Arc<TrackerConfig>,
    ) -> Self {
        Device {
            id,
            kind,
            leds,
            fusion_to_model,
            config,
            inner: Mutex::new(DeviceInner {
                filter,
                device_time_ns: 0,
                last_device_ts: None,
                slots: [DelaySlotState::default(); NUM_POSE_DELAY_SLOTS],
                next_slot: 0,
                pending_imu: VecDeque::new(),
                last_observed_pose_ts: None,
                last_observed_pose: None,
                reported: None,
                last_model_pose: None,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    #[inline]
    pub fn leds(&self) -> &LedModel {
        &self.leds
    }

    pub fn device_time_ns(&self) -> u64 {
        self.inner.lock().device_time_ns
    }

    /// Feed one IMU sample. `device_ts` is the device's raw 32-bit
    /// microsecond counter; it is extended to a monotonic 64-bit nanosecond
    /// timeline, handling wrap-around via unsigned subtraction.
    pub fn imu_update(
        &self,
        local_ts: u64,
        device_ts: u32,
        ang_vel: Vector3<f64>,
        accel: Vector3<f64>,
        mag: Option<Vector3<f64>>,
    ) {
        let mut inner = self.inner.lock();
        match inner.last_device_ts {
            None => inner.device_time_ns = device_ts as u64 * 1000,
            Some(last) => {
                inner.device_time_ns += device_ts.wrapping_sub(last) as u64 * 1000;
            }
        }
        inner.last_device_ts = Some(device_ts);

        let sample = ImuSample {
            device_time_ns: inner.device_time_ns,
            ang_vel,
            accel,
            mag,
        };
        inner.filter.imu_update(&sample);

        if inner.pending_imu.len() >= self.config.imu_pending_capacity {
            inner.pending_imu.pop_front();
        }
        inner.pending_imu.push_back(PendingImu { local_ts, sample });
    }

    /// Return and clear the buffered IMU samples.
    pub fn drain_pending_imu(&self) -> Vec<PendingImu> {
        self.inner.lock().pending_imu.drain(..).collect()
    }

    /// Begin a new exposure: allocate a delay slot round-robin (if one is
    /// free), register it with the filter, and report the device's fusion
    /// pose and uncertainty at the current device time.
    pub(crate) fn update_exposure(&self) -> ExposureDeviceInfo {
        let mut inner = self.inner.lock();
        let t = inner.device_time_ns;

        let (capture_pose, pos_error, rot_error) = Self::model_pose_locked(
            &mut inner,
            self.kind,
            &self.fusion_to_model,
            self.config.pose_lost_threshold_ms,
            t,
        );

        let mut fusion_slot = None;
        for k in 0..NUM_POSE_DELAY_SLOTS {
            let idx = (inner.next_slot + k) % NUM_POSE_DELAY_SLOTS;
            if inner.slots[idx].use_count != 0 {
                continue;
            }
            if inner.slots[idx].valid {
                // Leftover from an exposure no frame ever claimed.
                inner.filter.release_delay_slot(SlotId(idx as u8));
            }
            inner.slots[idx] = DelaySlotState {
                valid: true,
                use_count: 0,
                device_time_ns: t,
            };
            inner.filter.prepare_delay_slot(t, SlotId(idx as u8));
            inner.next_slot = (idx + 1) % NUM_POSE_DELAY_SLOTS;
            fusion_slot = Some(SlotId(idx as u8));
            break;
        }
        if fusion_slot.is_none() {
            warn!(device = %self.id, "no free delay slot for exposure");
        }

        ExposureDeviceInfo {
            device_time_ns: t,
            capture_pose,
            pos_error,
            rot_error,
            fusion_slot,
        }
    }

    fn slot_matching<'a>(
        slots: &'a mut [DelaySlotState; NUM_POSE_DELAY_SLOTS],
        info: &ExposureDeviceInfo,
    ) -> Option<&'a mut DelaySlotState> {
        let sid = info.fusion_slot?;
        let slot = &mut slots[sid.index()];
        (slot.valid && slot.device_time_ns == info.device_time_ns).then_some(slot)
    }

    /// Frame-start hook: take a reference on this exposure's delay slot.
    pub(crate) fn claim_exposure(&self, info: &ExposureDeviceInfo) {
        let mut inner = self.inner.lock();
        Self::claim_locked(&mut inner, info, self.id);
    }

    /// Frame-release hook: drop a reference; the slot is released back to
    /// the filter when the last reference goes away.
    pub(crate) fn release_exposure(&self, info: &ExposureDeviceInfo) {
        let mut inner = self.inner.lock();
        Self::release_locked(&mut inner, info, self.id);
    }

    /// Frame adopted a different exposure mid-capture: paired release+claim.
    pub(crate) fn change_exposure(&self, old: &ExposureDeviceInfo, new: &ExposureDeviceInfo) {
        let mut inner = self.inner.lock();
        Self::release_locked(&mut inner, old, self.id);
        Self::claim_locked(&mut inner, new, self.id);
    }

    fn claim_locked(inner: &mut DeviceInner, info: &ExposureDeviceInfo, id: DeviceId) {
        match Self::slot_matching(&mut inner.slots, info) {
            Some(slot) => slot.use_count += 1,
            None => {
                if info.fusion_slot.is_some() {
                    debug!(device = %id, "claim on overwritten delay slot ignored");
                }
            }
        }
    }

    fn release_locked(inner: &mut DeviceInner, info: &ExposureDeviceInfo, id: DeviceId) {
        let Some(sid) = info.fusion_slot else { return };
        match Self::slot_matching(&mut inner.slots, info) {
            Some(slot) => {
                if slot.use_count == 0 {
                    // A release that raced ahead of its claim; the claim side
                    // will find the slot still valid.
                    debug!(device = %id, "unbalanced delay-slot release ignored");
                    return;
                }
                slot.use_count -= 1;
                if slot.use_count == 0 {
                    slot.valid = false;
                    inner.filter.release_delay_slot(sid);
                }
            }
            None => {
                debug!(device = %id, "release on overwritten delay slot ignored");
            }
        }
    }

    /// Apply an accepted world-frame pose observation for this device.
    ///
    /// The pose is converted to the fusion (IMU) frame, the matching delay
    /// slot is looked up by `{fusion_slot, device_time_ns}`, and the
    /// observation is injected at the exposure's historical time. Without a
    /// matching slot the observation is dropped from the filter but still
    /// surfaces in the logs.
    pub fn model_pose_update(
        &self,
        local_ts: u64,
        frame_start_ts: u64,
        dev_info: &ExposureDeviceInfo,
        world_pose: &Isometry3<f64>,
        source: &str,
    ) {
        let mut inner = self.inner.lock();
        let mut pose = world_pose * self.fusion_to_model.inverse();
        if self.kind.mirrors_view_axes() {
            pose = mirror_xz(&pose);
        }

        let matching = dev_info.fusion_slot.and_then(|sid| {
            let slot = &inner.slots[sid.index()];
            (slot.valid && slot.device_time_ns == dev_info.device_time_ns).then_some(sid)
        });
        match matching {
            Some(sid) => {
                match self.config.update_policy {
                    UpdatePolicy::PoseUpdate => {
                        inner.filter.pose_update(dev_info.device_time_ns, &pose, sid)
                    }
                    UpdatePolicy::PositionUpdate => inner.filter.position_update(
                        dev_info.device_time_ns,
                        &Point3::from(pose.translation.vector),
                        sid,
                    ),
                }
                inner.last_observed_pose_ts = Some(dev_info.device_time_ns);
                inner.last_observed_pose = Some(pose);
                debug!(
                    device = %self.id,
                    source,
                    local_ts,
                    frame_start_ts,
                    "pose observation applied"
                );
            }
            None => {
                debug!(
                    device = %self.id,
                    source,
                    local_ts,
                    frame_start_ts,
                    "pose observation dropped: no matching delay slot"
                );
            }
        }
    }

    /// Model-frame fusion pose plus device-frame uncertainties at
    /// `device_time_ns`, for the fast stage's prior.
    pub fn get_model_pose(&self, device_time_ns: u64) -> (Isometry3<f64>, Vector3<f64>, Vector3<f64>) {
        let mut inner = self.inner.lock();
        Self::model_pose_locked(
            &mut inner,
            self.kind,
            &self.fusion_to_model,
            self.config.pose_lost_threshold_ms,
            device_time_ns,
        )
    }

    fn model_pose_locked(
        inner: &mut DeviceInner,
        kind: DeviceKind,
        fusion_to_model: &Isometry3<f64>,
        pose_lost_threshold_ms: u64,
        device_time_ns: u64,
    ) -> (Isometry3<f64>, Vector3<f64>, Vector3<f64>) {
        let out = inner.filter.get_pose_at(device_time_ns);
        let mut pose = out.pose;
        if kind.mirrors_view_axes() {
            pose = mirror_xz(&pose);
        }
        let mut model_pose = pose * fusion_to_model;

        let lost = inner
            .last_observed_pose_ts
            .map_or(true, |o| device_time_ns.saturating_sub(o) > pose_lost_threshold_ms * 1_000_000);
        if lost {
            if let Some(prev) = &inner.last_model_pose {
                model_pose.translation = prev.translation;
            }
        }
        inner.last_model_pose = Some(model_pose);

        // Rotate the world-frame uncertainty into the device frame so the
        // scorer can compare against camera-space deltas.
        let to_local = model_pose.rotation.inverse();
        let pos_error = (to_local * out.pos_error).abs();
        let rot_error = (to_local * out.rot_error).abs();
        (model_pose, pos_error, rot_error)
    }

    /// Smoothed pose for presentation. When no camera observation arrived
    /// within the pose-lost threshold, the reported position freezes while
    /// orientation keeps following the filter.
    pub fn get_view_pose(&self) -> FilteredPose {
        let mut inner = self.inner.lock();
        let t = inner.device_time_ns;
        if let Some(rep) = &inner.reported {
            if rep.device_time_ns == t {
                return rep.pose.clone();
            }
        }

        let mut out = inner.filter.get_pose_at(t);
        let lost = inner
            .last_observed_pose_ts
            .map_or(true, |o| t.saturating_sub(o) > self.config.pose_lost_threshold_ms * 1_000_000);
        if lost {
            if let Some(rep) = &inner.reported {
                out.pose.translation = rep.pose.pose.translation;
            }
            out.velocity = Vector3::zeros();
        }

        let smoothed = match &inner.reported {
            Some(rep) => {
                let prev = &rep.pose;
                let a = self.config.position_smoothing;
                let pos = prev
                    .pose
                    .translation
                    .vector
                    .lerp(&out.pose.translation.vector, a);
                let b = self.config.orientation_smoothing;
                let delta = prev.pose.rotation.rotation_to(&out.pose.rotation);
                let orient =
                    UnitQuaternion::from_scaled_axis(delta.scaled_axis() * b) * prev.pose.rotation;
                FilteredPose {
                    pose: Isometry3::from_parts(Translation3::from(pos), orient),
                    ..out
                }
            }
            None => out,
        };
        inner.reported = Some(Reported {
            device_time_ns: t,
            pose: smoothed.clone(),
        });
        smoothed
    }

    /// Snapshot of the delay-slot states, for telemetry and tests.
    pub fn delay_slots(&self) -> [DelaySlotSnapshot; NUM_POSE_DELAY_SLOTS] {
        let inner = self.inner.lock();
        let mut out = [DelaySlotSnapshot {
            valid: false,
            use_count: 0,
            device_time_ns: 0,
        }; NUM_POSE_DELAY_SLOTS];
        for (snap, slot) in out.iter_mut().zip(inner.slots.iter()) {
            *snap = DelaySlotSnapshot {
                valid: slot.valid,
                use_count: slot.use_count,
                device_time_ns: slot.device_time_ns,
            };
        }
        out
    }

    pub fn last_observed_pose(&self) -> Option<(u64, Isometry3<f64>)> {
        let inner = self.inner.lock();
        match (inner.last_observed_pose_ts, inner.last_observed_pose) {
            (Some(ts), Some(pose)) => Some((ts, pose)),
            _ => None,
        }
    }
}
