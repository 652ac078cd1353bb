//! Reference fusion filter: constant-velocity Kalman translation plus
//! complementary-filtered orientation, with delay-slot rollback and replay.

use adskalman::{
    CovarianceUpdateMethod, ObservationModel, StateAndCovariance, TransitionModelLinearNoControl,
};
use nalgebra::{
    Isometry3, Matrix3, Matrix6, OMatrix, OVector, Point3, Translation3, UnitQuaternion, Vector3,
    Vector6, U3, U6,
};
use tracing::debug;

use constel_types::SlotId;

use crate::motion_model::ConstantVelocityModel;
use crate::{quat_from_body_rates, FilteredPose, ImuSample, PoseFilter};

const GRAVITY_MPS2: f64 = 9.80665;

/// World up. The camera-frame gravity handling elsewhere assumes +Y up too.
fn up() -> Vector3<f64> {
    Vector3::y()
}

/// Direct position observation of the [x y z xvel yvel zvel] state.
#[derive(Debug)]
struct PositionObservationModel {
    observation_matrix: OMatrix<f64, U3, U6>,
    observation_matrix_transpose: OMatrix<f64, U6, U3>,
    observation_noise_covariance: Matrix3<f64>,
}

impl PositionObservationModel {
    fn new(noise_std: f64) -> Self {
        let mut observation_matrix = OMatrix::<f64, U3, U6>::zeros();
        observation_matrix
            .fixed_columns_mut::<3>(0)
            .copy_from(&Matrix3::identity());
        let observation_matrix_transpose = observation_matrix.transpose();
        let observation_noise_covariance = Matrix3::identity() * noise_std.powi(2);
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }
}

impl ObservationModel<f64, U6, U3> for PositionObservationModel {
    fn H(&self) -> &OMatrix<f64, U3, U6> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<f64, U6, U3> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &Matrix3<f64> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<f64, U6>) -> OVector<f64, U3> {
        self.observation_matrix * state
    }
}

/// Filter parameters.
#[derive(Debug, Clone)]
pub struct CvFilterParams {
    /// Process noise scale for the constant-velocity model.
    pub motion_noise_scale: f64,
    /// Standard deviation of a vision position observation, meters.
    pub obs_noise_pos: f64,
    /// Standard deviation of a vision orientation observation, radians.
    pub obs_noise_rot: f64,
    /// Gyro integration noise density, rad/s.
    pub gyro_noise: f64,
    /// Accelerometer tilt-correction gain per sample, 0..1.
    pub tilt_gain: f64,
    /// Bound on the per-slot IMU replay buffer.
    pub replay_capacity: usize,
    /// Initial positional standard deviation, meters.
    pub initial_pos_std: f64,
    /// Initial velocity standard deviation, m/s.
    pub initial_vel_std: f64,
}

impl Default for CvFilterParams {
    fn default() -> Self {
        CvFilterParams {
            motion_noise_scale: 20.0,
            obs_noise_pos: 0.005,
            obs_noise_rot: 0.02,
            gyro_noise: 0.02,
            tilt_gain: 0.02,
            replay_capacity: 64,
            initial_pos_std: 1.0,
            initial_vel_std: 1.0,
        }
    }
}

/// Complete filter state, cheap to snapshot for delay slots.
#[derive(Debug, Clone)]
struct FilterState {
    time_ns: Option<u64>,
    est: StateAndCovariance<f64, U6>,
    orient: UnitQuaternion<f64>,
    ang_vel: Vector3<f64>,
    /// Linear acceleration, world frame, gravity removed.
    accel_world: Vector3<f64>,
    /// Per-axis orientation variance, rad².
    rot_var: Vector3<f64>,
}

#[derive(Debug, Clone)]
struct DelaySlot {
    device_time_ns: u64,
    saved: FilterState,
    replay: Vec<ImuSample>,
    /// Replay buffer overflowed; measurement will apply at latest time.
    degraded: bool,
    active: bool,
}

/// Reference [`PoseFilter`] implementation.
///
/// Translation is a 6-state constant-velocity Kalman filter; orientation is
/// gyro integration with accelerometer tilt correction. A delay slot holds a
/// snapshot of the whole state plus the IMU samples seen since `prepare`, so
/// a late vision measurement rewinds, applies, and replays.
pub struct ConstantVelocityFilter {
    params: CvFilterParams,
    motion_model: ConstantVelocityModel,
    obs_model: PositionObservationModel,
    state: FilterState,
    slots: Vec<Option<DelaySlot>>,
}

impl ConstantVelocityFilter {
    pub fn new(n_delay_slots: usize, params: CvFilterParams) -> Self {
        let motion_model = ConstantVelocityModel::new(params.motion_noise_scale);
        let obs_model = PositionObservationModel::new(params.obs_noise_pos);
        let state = Self::initial_state(&params);
        ConstantVelocityFilter {
            params,
            motion_model,
            obs_model,
            state,
            slots: vec![None; n_delay_slots],
        }
    }

    fn initial_state(params: &CvFilterParams) -> FilterState {
        let mut covar = Matrix6::<f64>::identity() * params.initial_pos_std.powi(2);
        for i in 3..6 {
            covar[(i, i)] = params.initial_vel_std.powi(2);
        }
        FilterState {
            time_ns: None,
            est: StateAndCovariance::new(Vector6::zeros(), covar),
            orient: UnitQuaternion::identity(),
            ang_vel: Vector3::zeros(),
            accel_world: Vector3::zeros(),
            rot_var: Vector3::repeat(1.0),
        }
    }

    /// Advance `state` by one IMU sample. Does not touch the slots.
    fn step(&self, state: &mut FilterState, sample: &ImuSample) {
        let dt = match state.time_ns {
            Some(prev) if sample.device_time_ns > prev => {
                (sample.device_time_ns - prev) as f64 * 1e-9
            }
            Some(_) => 0.0,
            None => {
                state.time_ns = Some(sample.device_time_ns);
                state.ang_vel = sample.ang_vel;
                return;
            }
        };
        state.time_ns = Some(sample.device_time_ns);
        state.ang_vel = sample.ang_vel;

        if dt > 0.0 {
            let mm = self.motion_model.calc_for_dt(dt);
            state.est = mm.predict(&state.est);
            state.orient *= quat_from_body_rates(&sample.ang_vel, dt);
            let gyro_var = (self.params.gyro_noise * dt).powi(2);
            state.rot_var += Vector3::repeat(gyro_var);
        }

        // Accelerometer tilt correction: nudge the world-frame measured
        // specific force toward +Y when the magnitude is near 1 g.
        let accel_world = state.orient * sample.accel;
        let norm = accel_world.norm();
        if (norm - GRAVITY_MPS2).abs() < 0.3 * GRAVITY_MPS2 && norm > 1e-6 {
            let measured_up = accel_world / norm;
            let correction = UnitQuaternion::rotation_between(&measured_up, &up())
                .unwrap_or_else(UnitQuaternion::identity);
            let nudge =
                UnitQuaternion::from_scaled_axis(correction.scaled_axis() * self.params.tilt_gain);
            state.orient = nudge * state.orient;
            // Tilt (XZ) uncertainty is bounded by the correction.
            let keep = 1.0 - self.params.tilt_gain;
            state.rot_var.x *= keep;
            state.rot_var.z *= keep;
        }
        state.accel_world = accel_world - up() * GRAVITY_MPS2;
    }

    /// Kalman measurement update of the translational state.
    fn apply_position(&self, state: &mut FilterState, pos: &Point3<f64>) {
        let observation = Vector3::new(pos.x, pos.y, pos.z);
        match self.obs_model.update(
            &state.est,
            &observation,
            CovarianceUpdateMethod::JosephForm,
        ) {
            Ok(posterior) => state.est = posterior,
            Err(e) => debug!("position update failed: {e}"),
        }
    }

    fn apply_orientation(&self, state: &mut FilterState, orient: &UnitQuaternion<f64>) {
        let obs_var = self.params.obs_noise_rot.powi(2);
        let mean_var = state.rot_var.mean();
        let gain = mean_var / (mean_var + obs_var);
        let delta = state.orient.rotation_to(orient);
        state.orient = UnitQuaternion::from_scaled_axis(delta.scaled_axis() * gain) * state.orient;
        state.rot_var *= 1.0 - gain;
        state.rot_var += Vector3::repeat(obs_var * gain * gain);
    }

    fn rewound_state(&mut self, slot: SlotId) -> Option<(FilterState, Vec<ImuSample>, bool)> {
        let entry = self.slots.get_mut(slot.index())?.as_mut()?;
        if !entry.active {
            return None;
        }
        Some((
            entry.saved.clone(),
            std::mem::take(&mut entry.replay),
            entry.degraded,
        ))
    }

    fn finish_delayed_update(
        &mut self,
        slot: SlotId,
        state_at_slot_time: FilterState,
        replay: Vec<ImuSample>,
    ) {
        let mut replayed = state_at_slot_time.clone();
        for sample in &replay {
            self.step(&mut replayed, sample);
        }
        self.state = replayed;
        // A second sensor may observe the same exposure: keep a snapshot that
        // includes this measurement so the next rewind does not discard it.
        if let Some(Some(entry)) = self.slots.get_mut(slot.index()).map(|s| s.as_mut()) {
            entry.saved = state_at_slot_time;
            entry.replay = replay;
        }
    }
}

impl PoseFilter for ConstantVelocityFilter {
    fn clear(&mut self) {
        self.state = Self::initial_state(&self.params);
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    fn imu_update(&mut self, sample: &ImuSample) {
        let mut state = self.state.clone();
        self.step(&mut state, sample);
        self.state = state;

        let capacity = self.params.replay_capacity;
        for entry in self.slots.iter_mut().flatten() {
            if !entry.active {
                continue;
            }
            if entry.replay.len() >= capacity {
                if !entry.degraded {
                    debug!(
                        slot_time_ns = entry.device_time_ns,
                        "delay slot replay buffer overflow"
                    );
                }
                entry.degraded = true;
            } else {
                entry.replay.push(*sample);
            }
        }
    }

    fn prepare_delay_slot(&mut self, device_time_ns: u64, slot: SlotId) {
        let saved = self.state.clone();
        if let Some(entry) = self.slots.get_mut(slot.index()) {
            *entry = Some(DelaySlot {
                device_time_ns,
                saved,
                replay: Vec::new(),
                degraded: false,
                active: true,
            });
        }
    }

    fn release_delay_slot(&mut self, slot: SlotId) {
        if let Some(entry) = self.slots.get_mut(slot.index()) {
            *entry = None;
        }
    }

    fn pose_update(&mut self, device_time_ns: u64, pose: &Isometry3<f64>, slot: SlotId) {
        match self.rewound_state(slot) {
            Some((mut state, replay, degraded)) if !degraded => {
                self.apply_position(&mut state, &Point3::from(pose.translation.vector));
                self.apply_orientation(&mut state, &pose.rotation);
                self.finish_delayed_update(slot, state, replay);
            }
            Some((_, replay, _)) => {
                // Degraded slot: apply at the latest time instead.
                let mut state = self.state.clone();
                self.apply_position(&mut state, &Point3::from(pose.translation.vector));
                self.apply_orientation(&mut state, &pose.rotation);
                self.state = state;
                if let Some(Some(entry)) = self.slots.get_mut(slot.index()).map(|s| s.as_mut()) {
                    entry.replay = replay;
                }
            }
            None => {
                debug!(
                    device_time_ns,
                    slot = slot.0,
                    "pose update for unprepared slot dropped"
                );
            }
        }
    }

    fn position_update(&mut self, device_time_ns: u64, pos: &Point3<f64>, slot: SlotId) {
        match self.rewound_state(slot) {
            Some((mut state, replay, degraded)) if !degraded => {
                self.apply_position(&mut state, pos);
                self.finish_delayed_update(slot, state, replay);
            }
            Some((_, replay, _)) => {
                let mut state = self.state.clone();
                self.apply_position(&mut state, pos);
                self.state = state;
                if let Some(Some(entry)) = self.slots.get_mut(slot.index()).map(|s| s.as_mut()) {
                    entry.replay = replay;
                }
            }
            None => {
                debug!(
                    device_time_ns,
                    slot = slot.0,
                    "position update for unprepared slot dropped"
                );
            }
        }
    }

    fn get_pose_at(&self, device_time_ns: u64) -> FilteredPose {
        let mut state = self.state.clone();
        if let Some(prev) = state.time_ns {
            if device_time_ns > prev {
                let dt = (device_time_ns - prev) as f64 * 1e-9;
                let mm = self.motion_model.calc_for_dt(dt);
                state.est = mm.predict(&state.est);
                state.orient *= quat_from_body_rates(&state.ang_vel, dt);
            }
        }
        let x = state.est.state();
        let p = state.est.covariance();
        FilteredPose {
            pose: Isometry3::from_parts(
                Translation3::new(x[0], x[1], x[2]),
                state.orient,
            ),
            velocity: Vector3::new(x[3], x[4], x[5]),
            angular_velocity: state.ang_vel,
            acceleration: state.accel_world,
            pos_error: Vector3::new(
                p[(0, 0)].max(0.0).sqrt(),
                p[(1, 1)].max(0.0).sqrt(),
                p[(2, 2)].max(0.0).sqrt(),
            ),
            rot_error: state.rot_var.map(|v| v.max(0.0).sqrt()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn static_sample(t_ns: u64) -> ImuSample {
        ImuSample {
            device_time_ns: t_ns,
            ang_vel: Vector3::zeros(),
            accel: Vector3::new(0.0, GRAVITY_MPS2, 0.0),
            mag: None,
        }
    }

    #[test]
    fn static_imu_keeps_identity_orientation() {
        let mut filt = ConstantVelocityFilter::new(3, CvFilterParams::default());
        for i in 0..500u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }
        let out = filt.get_pose_at(500_000_000);
        assert_relative_eq!(out.pose.rotation.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn delayed_update_equals_prompt_update_without_interleaved_imu() {
        // With no IMU samples between prepare and update, rewinding is a
        // no-op and the delayed update must match an immediate one.
        let params = CvFilterParams::default();
        let mut delayed = ConstantVelocityFilter::new(3, params.clone());
        let mut prompt = ConstantVelocityFilter::new(3, params);

        for f in [&mut delayed, &mut prompt] {
            for i in 0..10u64 {
                f.imu_update(&static_sample(i * 1_000_000));
            }
        }

        let pose = Isometry3::translation(0.1, 0.2, 0.3);
        delayed.prepare_delay_slot(9_000_000, SlotId(0));
        prompt.prepare_delay_slot(9_000_000, SlotId(0));
        delayed.pose_update(9_000_000, &pose, SlotId(0));
        prompt.pose_update(9_000_000, &pose, SlotId(0));

        let a = delayed.get_pose_at(10_000_000);
        let b = prompt.get_pose_at(10_000_000);
        assert_relative_eq!(
            a.pose.translation.vector,
            b.pose.translation.vector,
            epsilon = 1e-12
        );
    }

    #[test]
    fn delayed_update_rewinds_and_replays() {
        let params = CvFilterParams::default();
        let mut filt = ConstantVelocityFilter::new(3, params);
        for i in 0..10u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }

        filt.prepare_delay_slot(9_000_000, SlotId(1));
        for i in 10..20u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }

        let before = filt.get_pose_at(20_000_000);
        let pose = Isometry3::translation(0.5, 1.0, -0.2);
        filt.pose_update(9_000_000, &pose, SlotId(1));
        let after = filt.get_pose_at(20_000_000);

        // The measurement pulled the estimate toward the observed position.
        let target = Vector3::new(0.5, 1.0, -0.2);
        assert!(
            (after.pose.translation.vector - target).norm()
                < (before.pose.translation.vector - target).norm()
        );
        // Uncertainty shrank.
        assert!(after.pos_error.norm() < before.pos_error.norm());
    }

    #[test]
    fn unprepared_slot_update_is_dropped() {
        let mut filt = ConstantVelocityFilter::new(3, CvFilterParams::default());
        for i in 0..5u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }
        let before = filt.get_pose_at(5_000_000);
        filt.pose_update(
            4_000_000,
            &Isometry3::translation(9.0, 9.0, 9.0),
            SlotId(2),
        );
        let after = filt.get_pose_at(5_000_000);
        assert_relative_eq!(
            before.pose.translation.vector,
            after.pose.translation.vector
        );
    }

    #[test]
    fn replay_overflow_degrades_but_still_updates() {
        let params = CvFilterParams {
            replay_capacity: 4,
            ..Default::default()
        };
        let mut filt = ConstantVelocityFilter::new(3, params);
        for i in 0..5u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }
        filt.prepare_delay_slot(4_000_000, SlotId(0));
        for i in 5..20u64 {
            filt.imu_update(&static_sample(i * 1_000_000));
        }
        let before = filt.get_pose_at(20_000_000);
        filt.position_update(4_000_000, &Point3::new(0.3, 0.0, 0.0), SlotId(0));
        let after = filt.get_pose_at(20_000_000);
        assert!(
            (after.pose.translation.vector - Vector3::new(0.3, 0.0, 0.0)).norm()
                < (before.pose.translation.vector - Vector3::new(0.3, 0.0, 0.0)).norm()
        );
    }
}
