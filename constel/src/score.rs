//! Built-in projective pose scorer and blob labeller.

use nalgebra::Isometry3;

use constel_types::{
    Blob, DeviceId, Intrinsics, LedLabel, LedModel, PoseMetrics, PosePrior,
};

use crate::vision::PoseEvaluator;

/// Scores a pose by projecting the LED model through the pinhole intrinsics
/// and counting blobs that land within a pixel radius of a camera-facing
/// LED. Blobs claimed by another device are unavailable.
#[derive(Debug, Clone)]
pub struct ProjectiveEvaluator {
    /// Maximum pixel distance between a projected LED and a blob center.
    pub match_radius_px: f64,
    /// An LED is visible when its normal makes at least this cosine with
    /// the direction to the camera.
    pub facing_cos: f64,
    /// Minimum matched blobs for a good match.
    pub good_min_matched: u32,
    /// Minimum matched blobs for a strong match.
    pub strong_min_matched: u32,
    /// Positional gate for prior-aware scoring, in standard deviations.
    pub prior_pos_sigmas: f64,
    /// Rotational gate for prior-aware scoring, in standard deviations.
    pub prior_rot_sigmas: f64,
}

impl Default for ProjectiveEvaluator {
    fn default() -> Self {
        ProjectiveEvaluator {
            match_radius_px: 6.0,
            facing_cos: 0.2,
            good_min_matched: 4,
            strong_min_matched: 6,
            prior_pos_sigmas: 3.0,
            prior_rot_sigmas: 3.0,
        }
    }
}

struct Projected {
    led_index: u8,
    px: f64,
    py: f64,
}

impl ProjectiveEvaluator {
    /// Project LEDs that face the camera under `pose`.
    fn visible_leds(
        &self,
        pose: &Isometry3<f64>,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) -> Vec<Projected> {
        let mut out = Vec::with_capacity(model.len());
        for (i, led) in model.points.iter().enumerate() {
            let p_cam = pose * led.pos;
            if p_cam.z <= 0.0 {
                continue;
            }
            let normal_cam = pose.rotation * led.dir;
            let to_camera = -p_cam.coords.normalize();
            if normal_cam.dot(&to_camera) < self.facing_cos {
                continue;
            }
            if let Some(px) = intrinsics.project(&p_cam) {
                if px.x < 0.0
                    || px.y < 0.0
                    || px.x >= intrinsics.width as f64
                    || px.y >= intrinsics.height as f64
                {
                    continue;
                }
                out.push(Projected {
                    led_index: i as u8,
                    px: px.x,
                    py: px.y,
                });
            }
        }
        out
    }

    /// Greedy nearest-blob matching; each blob is used at most once.
    /// Returns `(matches, sum_sq_dist)` with matches as `(led, blob index)`.
    fn match_blobs(
        &self,
        projected: &[Projected],
        blobs: &[Blob],
        device: DeviceId,
    ) -> (Vec<(u8, usize)>, f64) {
        let mut used = vec![false; blobs.len()];
        let mut matches = Vec::new();
        let mut sum_sq = 0.0;
        for led in projected {
            let mut best: Option<(usize, f64)> = None;
            for (bi, blob) in blobs.iter().enumerate() {
                if used[bi] {
                    continue;
                }
                // A blob labelled to another device is claimed.
                if let Some(owner) = blob.led_id.device() {
                    if owner != device {
                        continue;
                    }
                }
                let dx = blob.x as f64 - led.px;
                let dy = blob.y as f64 - led.py;
                let d2 = dx * dx + dy * dy;
                if d2 <= self.match_radius_px * self.match_radius_px
                    && best.map(|(_, bd2)| d2 < bd2).unwrap_or(true)
                {
                    best = Some((bi, d2));
                }
            }
            if let Some((bi, d2)) = best {
                used[bi] = true;
                matches.push((led.led_index, bi));
                sum_sq += d2;
            }
        }
        (matches, sum_sq)
    }

    fn metrics_from(&self, matched: usize, visible: usize, sum_sq: f64) -> PoseMetrics {
        let matched_blobs = matched as u32;
        let visible_leds = visible as u32;
        let reproj_error = if matched > 0 {
            (sum_sq / matched as f64).sqrt()
        } else {
            f64::INFINITY
        };
        // Over half the visible LEDs must be accounted for; strong matches
        // need two thirds.
        let good_pose_match =
            matched_blobs >= self.good_min_matched && 2 * matched_blobs >= visible_leds;
        let strong_pose_match = good_pose_match
            && matched_blobs >= self.strong_min_matched
            && 3 * matched_blobs >= 2 * visible_leds;
        PoseMetrics {
            matched_blobs,
            visible_leds,
            reproj_error,
            good_pose_match,
            strong_pose_match,
        }
    }
}

impl PoseEvaluator for ProjectiveEvaluator {
    fn evaluate(
        &self,
        pose: &Isometry3<f64>,
        blobs: &[Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) -> PoseMetrics {
        let projected = self.visible_leds(pose, model, intrinsics);
        let (matches, sum_sq) = self.match_blobs(&projected, blobs, device);
        self.metrics_from(matches.len(), projected.len(), sum_sq)
    }

    fn evaluate_with_prior(
        &self,
        pose: &Isometry3<f64>,
        prior: &PosePrior,
        blobs: &[Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) -> PoseMetrics {
        let mut metrics = self.evaluate(pose, blobs, device, model, intrinsics);

        let pos_delta = (pose.translation.vector - prior.pose.translation.vector).norm();
        let pos_gate = self.prior_pos_sigmas * prior.pos_error.norm().max(1e-3);
        let rot_delta = pose.rotation.angle_to(&prior.pose.rotation);
        let rot_gate = self.prior_rot_sigmas * prior.rot_error.norm().max(1e-3);
        if pos_delta > pos_gate || rot_delta > rot_gate {
            metrics.good_pose_match = false;
            metrics.strong_pose_match = false;
        }
        metrics
    }

    fn label_blobs(
        &self,
        pose: &Isometry3<f64>,
        blobs: &mut [Blob],
        device: DeviceId,
        model: &LedModel,
        intrinsics: &Intrinsics,
    ) {
        let projected = self.visible_leds(pose, model, intrinsics);
        let (matches, _) = self.match_blobs(&projected, blobs, device);
        for (led_index, bi) in matches {
            blobs[bi].led_id = LedLabel::new(device, led_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Point3, Translation3, UnitQuaternion, Vector3};

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            camera_matrix: Matrix3::new(700.0, 0.0, 640.0, 0.0, 700.0, 480.0, 0.0, 0.0, 1.0),
            distortion: [0.0; 5],
            dist_fisheye: false,
            width: 1280,
            height: 960,
        }
    }

    /// Eight LEDs on the front face of a 10 cm cube, normals toward -Z
    /// (toward the camera once the device sits in front of it).
    fn cube_model() -> constel_types::LedModel {
        let mut points = Vec::new();
        for ix in 0..4 {
            for iy in 0..2 {
                points.push(constel_types::LedPoint {
                    pos: Point3::new(ix as f64 * 0.03 - 0.045, iy as f64 * 0.05 - 0.025, 0.0),
                    dir: Vector3::new(0.0, 0.0, -1.0),
                });
            }
        }
        constel_types::LedModel::new(points)
    }

    fn blobs_for_pose(
        pose: &Isometry3<f64>,
        model: &constel_types::LedModel,
        intr: &Intrinsics,
    ) -> Vec<Blob> {
        model
            .points
            .iter()
            .filter_map(|led| {
                let p = pose * led.pos;
                intr.project(&p).map(|px| Blob::new(px.x as f32, px.y as f32, 4.0, 4.0))
            })
            .collect()
    }

    fn facing_pose() -> Isometry3<f64> {
        // Device 70 cm in front of the camera, LED normals (-Z) toward it.
        Isometry3::from_parts(Translation3::new(0.0, 0.0, 0.7), UnitQuaternion::identity())
    }

    #[test]
    fn true_pose_scores_strong() {
        let intr = intrinsics();
        let model = cube_model();
        let pose = facing_pose();
        let blobs = blobs_for_pose(&pose, &model, &intr);
        let ev = ProjectiveEvaluator::default();
        let m = ev.evaluate(&pose, &blobs, DeviceId(0), &model, &intr);
        assert_eq!(m.matched_blobs, 8);
        assert!(m.good_pose_match);
        assert!(m.strong_pose_match);
        assert!(m.reproj_error < 1.0);
    }

    #[test]
    fn displaced_pose_scores_badly() {
        let intr = intrinsics();
        let model = cube_model();
        let pose = facing_pose();
        let blobs = blobs_for_pose(&pose, &model, &intr);
        let off = Isometry3::from_parts(
            Translation3::new(0.3, 0.0, 0.7),
            pose.rotation,
        );
        let ev = ProjectiveEvaluator::default();
        let m = ev.evaluate(&off, &blobs, DeviceId(0), &model, &intr);
        assert!(!m.good_pose_match);
    }

    #[test]
    fn prior_gate_rejects_distant_candidate() {
        let intr = intrinsics();
        let model = cube_model();
        let pose = facing_pose();
        let blobs = blobs_for_pose(&pose, &model, &intr);
        let ev = ProjectiveEvaluator::default();
        let prior = PosePrior {
            pose: Isometry3::from_parts(Translation3::new(1.0, 0.0, 0.7), pose.rotation),
            pos_error: Vector3::repeat(0.01),
            rot_error: Vector3::repeat(0.01),
        };
        let m = ev.evaluate_with_prior(&pose, &prior, &blobs, DeviceId(0), &model, &intr);
        // Geometrically perfect but a meter away from the prior.
        assert_eq!(m.matched_blobs, 8);
        assert!(!m.good_pose_match);
    }

    #[test]
    fn labelling_skips_blobs_claimed_by_other_device() {
        let intr = intrinsics();
        let model = cube_model();
        let pose = facing_pose();
        let mut blobs = blobs_for_pose(&pose, &model, &intr);
        blobs[0].led_id = LedLabel::new(DeviceId(1), 0);
        let ev = ProjectiveEvaluator::default();
        ev.label_blobs(&pose, &mut blobs, DeviceId(0), &model, &intr);
        assert_eq!(blobs[0].led_id.device(), Some(DeviceId(1)));
        let ours = blobs
            .iter()
            .filter(|b| b.led_id.device() == Some(DeviceId(0)))
            .count();
        assert_eq!(ours, 7);
    }
}
