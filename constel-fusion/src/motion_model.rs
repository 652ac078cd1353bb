//! Constant-velocity translational motion model.
//!
//! The state vector is [x y z xvel yvel zvel].

use adskalman::TransitionModelLinearNoControl;
use nalgebra::{Matrix6, U6};

#[derive(Debug, Clone)]
pub(crate) struct ConstantVelocityModel {
    motion_noise_scale: f64,
}

impl ConstantVelocityModel {
    pub(crate) fn new(motion_noise_scale: f64) -> Self {
        Self { motion_noise_scale }
    }

    /// Motion model for a specific `dt`.
    pub(crate) fn calc_for_dt(&self, dt: f64) -> MotionModelFixedDt {
        // This is "A" in most Kalman filter descriptions.
        #[rustfmt::skip]
        let transition_model = Matrix6::<f64>::from_row_slice(
            &[1.0, 0.0, 0.0,  dt, 0.0, 0.0,
              0.0, 1.0, 0.0, 0.0,  dt, 0.0,
              0.0, 0.0, 1.0, 0.0, 0.0,  dt,
              0.0, 0.0, 0.0, 1.0, 0.0, 0.0,
              0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
              0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let transition_model_transpose = transition_model.transpose();

        let t33 = (dt * dt * dt) / 3.0;
        let t22 = (dt * dt) / 2.0;

        // This is "Q" in most Kalman filter descriptions.
        #[rustfmt::skip]
        let transition_noise_covariance = Matrix6::<f64>::from_row_slice(
            &[t33, 0.0, 0.0, t22, 0.0, 0.0,
              0.0, t33, 0.0, 0.0, t22, 0.0,
              0.0, 0.0, t33, 0.0, 0.0, t22,
              t22, 0.0, 0.0,  dt, 0.0, 0.0,
              0.0, t22, 0.0, 0.0,  dt, 0.0,
              0.0, 0.0, t22, 0.0, 0.0,  dt]) * self.motion_noise_scale;

        MotionModelFixedDt {
            transition_model,
            transition_model_transpose,
            transition_noise_covariance,
        }
    }
}

#[derive(Debug)]
pub(crate) struct MotionModelFixedDt {
    pub(crate) transition_model: Matrix6<f64>,
    pub(crate) transition_model_transpose: Matrix6<f64>,
    pub(crate) transition_noise_covariance: Matrix6<f64>,
}

impl TransitionModelLinearNoControl<f64, U6> for MotionModelFixedDt {
    fn F(&self) -> &Matrix6<f64> {
        &self.transition_model
    }
    fn FT(&self) -> &Matrix6<f64> {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &Matrix6<f64> {
        &self.transition_noise_covariance
    }
}
