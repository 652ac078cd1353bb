//! Blob-to-LED-model correspondence: the fast re-acquisition stage, the
//! two-pass deep search, and the camera-pose bootstrap.

use std::sync::Arc;

use nalgebra::{Isometry3, Vector3};
use tracing::debug;

use constel_types::{ExposureDeviceInfo, PoseMetrics, PosePrior, SearchFlags};

use crate::device::Device;
use crate::frame::{CaptureFrame, DeviceCaptureState};
use crate::sensor::Sensor;
use crate::vision::BlobObservation;

/// Gravity uncertainty above which the aligned search is not trusted.
const ALIGNED_MAX_GRAVITY_ERROR_RAD: f64 = 45.0 * std::f64::consts::PI / 180.0;
/// Floor of the aligned-search swing tolerance.
const ALIGNED_MIN_TOLERANCE_RAD: f64 = 10.0 * std::f64::consts::PI / 180.0;
/// Gravity uncertainty below which an HMD match may bootstrap the camera
/// pose.
const BOOTSTRAP_MAX_GRAVITY_ERROR_RAD: f64 = 15.0 * std::f64::consts::PI / 180.0;
/// More labelled blobs than this allow a PnP re-acquisition attempt.
const PNP_MIN_LABELLED_BLOBS: usize = 4;

/// Stage 1: per-device fast re-acquisition from the fusion prior.
///
/// Runs on the fast worker with no sensor lock held. Devices that cannot be
/// re-acquired here set `need_long_analysis` and wait for stage 2.
pub(crate) fn process_frame_fast(sensor: &Sensor, frame: &mut CaptureFrame) {
    let Some(exposure) = frame.exposure.clone() else {
        return;
    };

    let mut obs = {
        let mut detector = sensor.detector.lock();
        detector.process(
            &frame.pixels,
            frame.width,
            frame.height,
            exposure.led_pattern_phase,
        )
    };
    frame.timestamps.blob_extract_finish = Some(sensor.now_ns());

    let Some(tracker) = sensor.tracker_handle() else {
        frame.observation = Some(obs);
        return;
    };
    let devices = tracker.devices();
    let camera_pose = sensor.camera_pose();
    let intr = sensor.intrinsics();
    let evaluator = sensor.evaluator().clone();

    for i in 0..frame.n_devices() {
        let entry = &exposure.devices[i];
        if entry.fusion_slot.is_none() {
            continue;
        }
        let Some(device) = devices.get(i) else { break };

        // Until the camera pose is bootstrapped there is no usable prior:
        // only the deep search can resolve anything.
        let Some(cam_pose) = camera_pose else {
            frame.need_long_analysis = true;
            continue;
        };

        let obj_cam_pose = cam_pose.inverse() * frame.device_state[i].capture_world_pose;
        let prior = PosePrior {
            pose: obj_cam_pose,
            pos_error: entry.pos_error,
            rot_error: entry.rot_error,
        };

        let metrics = evaluator.evaluate_with_prior(
            &obj_cam_pose,
            &prior,
            &obs.blobs,
            device.id(),
            device.leds(),
            intr,
        );
        let mut accepted = metrics.good_pose_match.then_some(obj_cam_pose);

        if accepted.is_none() {
            // Enough blobs still carry this device's labels from earlier
            // frames to try a direct PnP re-acquisition.
            let labelled = obs
                .blobs
                .iter()
                .filter(|b| b.labelled_device() == Some(device.id()))
                .count();
            if labelled > PNP_MIN_LABELLED_BLOBS {
                if let Some(candidate) =
                    sensor
                        .pnp()
                        .estimate(&obs.blobs, device.id(), device.leds(), intr, &obj_cam_pose)
                {
                    let m = evaluator.evaluate_with_prior(
                        &candidate,
                        &prior,
                        &obs.blobs,
                        device.id(),
                        device.leds(),
                        intr,
                    );
                    if m.good_pose_match {
                        accepted = Some(candidate);
                    }
                }
            }
        }

        match accepted {
            Some(pose) => {
                update_device_and_blobs(
                    sensor,
                    frame.start_ts,
                    &mut frame.device_state[i],
                    &mut obs,
                    device,
                    entry,
                    pose,
                    "fast",
                );
            }
            None => frame.need_long_analysis = true,
        }
    }

    frame.observation = Some(obs);
}

/// A pass-0 match that was good but not strong, parked for pass 1.
struct ParkedCandidate {
    pose: Isometry3<f64>,
    metrics: PoseMetrics,
    /// Value of the strong-match counter when this candidate was scored.
    strong_seq: u64,
}

/// Stage 2: two-pass deep search with shared blob claims across devices.
///
/// Pass 0 (shallow) only accepts strong matches so a confident device
/// cannot be starved of blobs by an uncertain one; pass 1 (deep) accepts
/// good matches and re-checks candidates that may have lost blobs to a
/// stronger device in the meantime.
pub(crate) fn process_frame_long(sensor: &Sensor, frame: &mut CaptureFrame) {
    let Some(exposure) = frame.exposure.clone() else {
        return;
    };
    let Some(mut obs) = frame.observation.take() else {
        return;
    };
    let Some(tracker) = sensor.tracker_handle() else {
        frame.observation = Some(obs);
        return;
    };
    let devices = tracker.devices();
    let intr = sensor.intrinsics();
    let evaluator = sensor.evaluator().clone();

    let camera_pose = sensor.camera_pose();
    let cam_gravity = camera_pose.map(|cp| cp.rotation.inverse() * Vector3::y());

    let mut solver = sensor.solver.lock();
    for i in 0..frame.n_devices() {
        if let Some(device) = devices.get(i) {
            solver.set_model(device.id(), device.leds());
        }
    }
    solver.set_blobs(&obs.blobs);

    let n = frame.n_devices();
    let mut parked: Vec<Option<ParkedCandidate>> = (0..n).map(|_| None).collect();
    let mut strong_seq: u64 = 0;

    for pass in 0..2 {
        for i in 0..n {
            if frame.device_state[i].found_device_pose {
                continue;
            }
            let entry = &exposure.devices[i];
            if entry.fusion_slot.is_none() {
                continue;
            }
            let Some(device) = devices.get(i) else { break };

            let mut flags = SearchFlags::STOP_FOR_STRONG_MATCH;
            if device.kind().matches_all_blobs() {
                flags |= SearchFlags::MATCH_ALL_BLOBS;
            }
            flags |= if pass == 0 {
                SearchFlags::SHALLOW_SEARCH
            } else {
                SearchFlags::DEEP_SEARCH
            };

            let gravity_error = frame.device_state[i].gravity_error_rad;
            let aligned = cam_gravity.filter(|_| gravity_error < ALIGNED_MAX_GRAVITY_ERROR_RAD);
            let tolerance = (2.0 * gravity_error).max(ALIGNED_MIN_TOLERANCE_RAD);

            if pass == 1 {
                if let Some(cand) = parked[i].take() {
                    // A stronger device may have claimed blobs this match
                    // relied on since it was scored.
                    let survives = if strong_seq > cand.strong_seq {
                        let m = match (aligned.as_ref(), camera_pose.as_ref()) {
                            (Some(_), Some(cp)) => {
                                let prior = PosePrior {
                                    pose: cp.inverse()
                                        * frame.device_state[i].capture_world_pose,
                                    pos_error: entry.pos_error,
                                    rot_error: entry.rot_error,
                                };
                                evaluator.evaluate_with_prior(
                                    &cand.pose,
                                    &prior,
                                    &obs.blobs,
                                    device.id(),
                                    device.leds(),
                                    intr,
                                )
                            }
                            _ => evaluator.evaluate(
                                &cand.pose,
                                &obs.blobs,
                                device.id(),
                                device.leds(),
                                intr,
                            ),
                        };
                        m.good_pose_match
                    } else {
                        cand.metrics.good_pose_match
                    };

                    if survives {
                        frame.long_analysis_found_new_blobs = true;
                        let good = update_device_and_blobs(
                            sensor,
                            frame.start_ts,
                            &mut frame.device_state[i],
                            &mut obs,
                            device,
                            entry,
                            cand.pose,
                            "long",
                        );
                        if good {
                            if frame.device_state[i].score.strong_pose_match {
                                strong_seq += 1;
                            }
                            publish_labels(sensor, &obs, device);
                            solver.set_blobs(&obs.blobs);
                        }
                        continue;
                    }
                    // Lost too many blobs: fall back to a fresh shallow
                    // search this pass.
                    debug!(device = %device.id(), "parked match no longer good; re-searching");
                    flags.remove(SearchFlags::DEEP_SEARCH);
                    flags |= SearchFlags::SHALLOW_SEARCH;
                }
            }

            let found = match aligned.as_ref() {
                Some(gravity) => solver.find_pose_aligned(device.id(), flags, gravity, tolerance),
                None => solver.find_pose(device.id(), flags),
            };
            let Some((pose, metrics)) = found else {
                continue;
            };

            if pass == 0 && !metrics.strong_pose_match {
                if metrics.good_pose_match {
                    // Park it for pass 1, but let its blobs take part in
                    // the cross-device claims already.
                    evaluator.label_blobs(&pose, &mut obs.blobs, device.id(), device.leds(), intr);
                    solver.set_blobs(&obs.blobs);
                    parked[i] = Some(ParkedCandidate {
                        pose,
                        metrics,
                        strong_seq,
                    });
                }
                continue;
            }
            if !metrics.good_pose_match {
                continue;
            }

            frame.long_analysis_found_new_blobs = true;
            let good = update_device_and_blobs(
                sensor,
                frame.start_ts,
                &mut frame.device_state[i],
                &mut obs,
                device,
                entry,
                pose,
                "long",
            );
            if good {
                if frame.device_state[i].score.strong_pose_match {
                    strong_seq += 1;
                }
                publish_labels(sensor, &obs, device);
                solver.set_blobs(&obs.blobs);
            }
        }
    }

    frame.observation = Some(obs);
}

fn publish_labels(sensor: &Sensor, obs: &BlobObservation, device: &Arc<Device>) {
    let mut detector = sensor.detector.lock();
    detector.update_labels(obs, device.id());
}

/// Accept `pose` for `device`: refresh this device's blob labels, refine by
/// PnP, and either feed the pose upstream (when the camera pose is known)
/// or bootstrap the camera pose from a confident HMD match.
///
/// Returns whether the refined pose still scored as a good match.
#[allow(clippy::too_many_arguments)]
fn update_device_and_blobs(
    sensor: &Sensor,
    frame_start_ts: u64,
    state: &mut DeviceCaptureState,
    obs: &mut BlobObservation,
    device: &Arc<Device>,
    entry: &ExposureDeviceInfo,
    pose: Isometry3<f64>,
    source: &str,
) -> bool {
    let intr = sensor.intrinsics();
    let evaluator = sensor.evaluator();

    let relabel = |obs: &mut BlobObservation, pose: &Isometry3<f64>| {
        for blob in &mut obs.blobs {
            if blob.led_id.device() == Some(device.id()) {
                blob.prev_led_id = blob.led_id;
                blob.led_id = constel_types::LedLabel::INVALID;
            }
        }
        evaluator.label_blobs(pose, &mut obs.blobs, device.id(), device.leds(), intr);
    };

    relabel(obs, &pose);

    let mut refined = pose;
    if let Some(better) = sensor
        .pnp()
        .estimate(&obs.blobs, device.id(), device.leds(), intr, &refined)
    {
        refined = better;
    }
    // A second labelling pass can pick up LEDs that only became consistent
    // after refinement.
    relabel(obs, &refined);

    state.final_cam_pose = Some(refined);
    let metrics = evaluator.evaluate(&refined, &obs.blobs, device.id(), device.leds(), intr);
    state.score = metrics;
    if !metrics.good_pose_match {
        debug!(
            device = %device.id(),
            source,
            "pose no longer good after refinement"
        );
        return false;
    }

    if let Some(cam_pose) = sensor.camera_pose() {
        let world_pose = cam_pose * refined;
        device.model_pose_update(sensor.now_ns(), frame_start_ts, entry, &world_pose, source);
        state.found_device_pose = true;
        if !state.exposure_released {
            // The exposure's claim for this device is settled; later frame
            // release must not double-release it.
            device.release_exposure(entry);
            state.exposure_released = true;
        }
        sensor.bump_poses_found();
    } else if device.kind().can_bootstrap_camera_pose()
        && state.gravity_error_rad < BOOTSTRAP_MAX_GRAVITY_ERROR_RAD
    {
        // First confident HMD observation fixes the sensor's place in the
        // world: camera_pose ∘ obj_cam = obj_world.
        let camera_pose = state.capture_world_pose * refined.inverse();
        sensor.set_camera_pose(camera_pose);
    }

    true
}
