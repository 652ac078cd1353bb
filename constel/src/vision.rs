//! Seams to the image-processing and correspondence-search libraries.
//!
//! The pipeline consumes these through trait objects so the heavy vision
//! code (binary morphology, PnP, the full constellation search) stays
//! replaceable; [`crate::ProjectiveEvaluator`] is the built-in scorer.

use nalgebra::{Isometry3, Vector3};

use constel_types::{Blob, DeviceId, Intrinsics, LedModel, PoseMetrics, PosePrior, SearchFlags};

/// Blobs extracted from one frame.
#[derive(Debug, Clone, Default)]
pub struct BlobObservation {
    pub blobs: Vec<Blob>,
}

/// Extracts bright blobs from grayscale frames and tracks their labels
/// across frames.
pub trait BlobExtractor: Send {
    fn process(&mut self, pixels: &[u8], width: u32, height: u32, led_phase: u8)
        -> BlobObservation;

    /// Publish refined labels for `device` back into the detector state so
    /// the next frame's blobs carry them as `prev_led_id`.
    fn update_labels(&mut self, observation: &BlobObservation, device: DeviceId);
}

/// Scores a candidate pose against the observed blobs.
pub trait PoseEvaluator: Send + Sync {
    fn evaluate(
        &self,
        pose: &Isometry3<f64>,
        blobs: &[Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) -> PoseMetrics;

    /// Like `evaluate`, but additionally rejects candidates whose delta from
    /// the prior exceeds the supplied positional/rotational uncertainty.
    fn evaluate_with_prior(
        &self,
        pose: &Isometry3<f64>,
        prior: &PosePrior,
        blobs: &[Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) -> PoseMetrics;

    /// Label blobs matching `pose` in place. Only blobs unclaimed or already
    /// belonging to `device` are touched.
    fn label_blobs(
        &self,
        pose: &Isometry3<f64>,
        blobs: &mut [Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    );
}

/// Pose-from-n-points refinement over labelled blobs.
pub trait PnpSolver: Send + Sync {
    fn estimate(
        &self,
        blobs: &[Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
        initial: &Isometry3<f64>,
    ) -> Option<Isometry3<f64>>;
}

/// Full correspondence search: match blobs against a device's LED model
/// with no (or only a gravity) prior.
pub trait CorrespondenceSolver: Send {
    fn set_model(&mut self, device: DeviceId, model: &LedModel) -> bool;

    fn set_blobs(&mut self, blobs: &[Blob]);

    fn find_pose(
        &mut self,
        device: DeviceId,
        flags: SearchFlags,
    ) -> Option<(Isometry3<f64>, PoseMetrics)>;

    /// Search constrained to poses whose swing component agrees with the
    /// camera-frame gravity within `tolerance_rad`.
    fn find_pose_aligned(
        &mut self,
        device: DeviceId,
        flags: SearchFlags,
        gravity: &Vector3<f64>,
        tolerance_rad: f64,
    ) -> Option<(Isometry3<f64>, PoseMetrics)>;
}
