//! Test doubles for the vision seams plus a small scenario rig.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::{Isometry3, Matrix3, Point3, Translation3, UnitQuaternion, Vector3};
use parking_lot::Mutex;

use constel::vision::{BlobExtractor, BlobObservation, CorrespondenceSolver, PnpSolver, PoseEvaluator};
use constel::{ProjectiveEvaluator, Sensor, SensorConfig, Tracker};
use constel_fusion::{ConstantVelocityFilter, CvFilterParams, PoseFilter};
use constel_types::{
    Blob, DeviceId, DeviceKind, Intrinsics, LedModel, LedPoint, PoseMetrics, SearchFlags,
    TrackerConfig, NUM_POSE_DELAY_SLOTS,
};

pub fn intrinsics() -> Intrinsics {
    Intrinsics {
        camera_matrix: Matrix3::new(700.0, 0.0, 640.0, 0.0, 700.0, 480.0, 0.0, 0.0, 1.0),
        distortion: [0.0; 5],
        dist_fisheye: false,
        width: 1280,
        height: 960,
    }
}

/// Eight LEDs in a 4x2 grid on the device's front face, normals toward -Z.
pub fn cube_model() -> LedModel {
    let mut points = Vec::new();
    for ix in 0..4 {
        for iy in 0..2 {
            points.push(LedPoint {
                pos: Point3::new(ix as f64 * 0.03 - 0.045, iy as f64 * 0.05 - 0.025, 0.0),
                dir: Vector3::new(0.0, 0.0, -1.0),
            });
        }
    }
    LedModel::new(points)
}

/// Device 70 cm in front of the camera, LED normals toward it.
pub fn facing_pose(x: f64) -> Isometry3<f64> {
    Isometry3::from_parts(Translation3::new(x, 0.0, 0.7), UnitQuaternion::identity())
}

/// Ideal blob positions for `pose`, deduplicated against `existing` so two
/// devices can share blobs.
pub fn add_blobs_for_pose(
    blobs: &mut Vec<Blob>,
    pose: &Isometry3<f64>,
    model: &LedModel,
    intr: &Intrinsics,
) {
    for led in &model.points {
        let p = pose * led.pos;
        if let Some(px) = intr.project(&p) {
            let duplicate = blobs
                .iter()
                .any(|b| (b.x as f64 - px.x).abs() < 1.0 && (b.y as f64 - px.y).abs() < 1.0);
            if !duplicate {
                blobs.push(Blob::new(px.x as f32, px.y as f32, 4.0, 4.0));
            }
        }
    }
}

pub fn blobs_for_pose(pose: &Isometry3<f64>, model: &LedModel, intr: &Intrinsics) -> Vec<Blob> {
    let mut blobs = Vec::new();
    add_blobs_for_pose(&mut blobs, pose, model, intr);
    blobs
}

/// Blob detector double: returns whatever the test staged next, carrying
/// labels published for earlier frames over as `prev_led_id`.
pub struct TestDetector {
    pub next_blobs: Arc<Mutex<Vec<Blob>>>,
    pub published: Arc<Mutex<Vec<(DeviceId, BlobObservation)>>>,
    memory: Vec<Blob>,
    pub process_delay: Option<Duration>,
}

impl TestDetector {
    pub fn new(
        next_blobs: Arc<Mutex<Vec<Blob>>>,
        published: Arc<Mutex<Vec<(DeviceId, BlobObservation)>>>,
    ) -> Self {
        TestDetector {
            next_blobs,
            published,
            memory: Vec::new(),
            process_delay: None,
        }
    }
}

impl BlobExtractor for TestDetector {
    fn process(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _led_phase: u8,
    ) -> BlobObservation {
        if let Some(delay) = self.process_delay {
            std::thread::sleep(delay);
        }
        let mut blobs = self.next_blobs.lock().clone();
        for blob in &mut blobs {
            if let Some(prev) = self
                .memory
                .iter()
                .find(|m| (m.x - blob.x).abs() < 3.0 && (m.y - blob.y).abs() < 3.0)
            {
                blob.prev_led_id = prev.led_id;
            }
        }
        BlobObservation { blobs }
    }

    fn update_labels(&mut self, observation: &BlobObservation, device: DeviceId) {
        self.published.lock().push((device, observation.clone()));
        for blob in &observation.blobs {
            if blob.led_id.device() != Some(device) {
                continue;
            }
            match self
                .memory
                .iter_mut()
                .find(|m| (m.x - blob.x).abs() < 3.0 && (m.y - blob.y).abs() < 3.0)
            {
                Some(m) => m.led_id = blob.led_id,
                None => self.memory.push(*blob),
            }
        }
    }
}

/// Correspondence-search double: an oracle that knows each device's true
/// pose and scores it against the currently set blobs.
pub struct TestSolver {
    pub true_poses: Arc<Mutex<HashMap<DeviceId, Isometry3<f64>>>>,
    models: HashMap<DeviceId, LedModel>,
    blobs: Vec<Blob>,
    evaluator: ProjectiveEvaluator,
    intr: Intrinsics,
}

impl TestSolver {
    pub fn new(true_poses: Arc<Mutex<HashMap<DeviceId, Isometry3<f64>>>>) -> Self {
        TestSolver {
            true_poses,
            models: HashMap::new(),
            blobs: Vec::new(),
            evaluator: ProjectiveEvaluator::default(),
            intr: intrinsics(),
        }
    }
}

impl CorrespondenceSolver for TestSolver {
    fn set_model(&mut self, device: DeviceId, model: &LedModel) -> bool {
        self.models.insert(device, model.clone());
        true
    }

    fn set_blobs(&mut self, blobs: &[Blob]) {
        self.blobs = blobs.to_vec();
    }

    fn find_pose(
        &mut self,
        device: DeviceId,
        _flags: SearchFlags,
    ) -> Option<(Isometry3<f64>, PoseMetrics)> {
        let pose = *self.true_poses.lock().get(&device)?;
        let model = self.models.get(&device)?;
        let metrics = self
            .evaluator
            .evaluate(&pose, &self.blobs, device, model, &self.intr);
        metrics.good_pose_match.then_some((pose, metrics))
    }

    fn find_pose_aligned(
        &mut self,
        device: DeviceId,
        flags: SearchFlags,
        _gravity: &Vector3<f64>,
        _tolerance_rad: f64,
    ) -> Option<(Isometry3<f64>, PoseMetrics)> {
        self.find_pose(device, flags)
    }
}

/// PnP double: trusts the initial estimate.
pub struct IdentityPnp;

impl PnpSolver for IdentityPnp {
    fn estimate(
        &self,
        _blobs: &[Blob],
        _device: DeviceId,
        _model: &LedModel,
        _intrinsics: &Intrinsics,
        initial: &Isometry3<f64>,
    ) -> Option<Isometry3<f64>> {
        Some(*initial)
    }
}

pub fn make_filter() -> Box<dyn PoseFilter> {
    Box::new(ConstantVelocityFilter::new(
        NUM_POSE_DELAY_SLOTS,
        CvFilterParams::default(),
    ))
}

pub fn wait_for(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

/// One tracker + one sensor wired up with the doubles above.
pub struct Rig {
    pub tracker: Arc<Tracker>,
    pub sensor: Arc<Sensor>,
    pub next_blobs: Arc<Mutex<Vec<Blob>>>,
    pub published: Arc<Mutex<Vec<(DeviceId, BlobObservation)>>>,
    pub true_poses: Arc<Mutex<HashMap<DeviceId, Isometry3<f64>>>>,
    pub pixels: Vec<u8>,
}

impl Rig {
    pub fn new(config: TrackerConfig) -> Rig {
        Rig::with_detector_delay(config, None)
    }

    pub fn with_detector_delay(config: TrackerConfig, delay: Option<Duration>) -> Rig {
        let tracker = Tracker::new(config);
        let next_blobs = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(Mutex::new(Vec::new()));
        let true_poses = Arc::new(Mutex::new(HashMap::new()));

        let mut detector = TestDetector::new(next_blobs.clone(), published.clone());
        detector.process_delay = delay;

        let intr = intrinsics();
        let pixels = vec![0u8; (intr.width * intr.height) as usize];
        let sensor = Sensor::new(
            SensorConfig {
                serial: "TEST0001".to_string(),
                intrinsics: intr,
            },
            &tracker,
            Box::new(detector),
            Box::new(TestSolver::new(true_poses.clone())),
            Arc::new(ProjectiveEvaluator::default()),
            Arc::new(IdentityPnp),
        )
        .expect("sensor setup");
        tracker.add_sensor(sensor.clone());

        Rig {
            tracker,
            sensor,
            next_blobs,
            published,
            true_poses,
            pixels,
        }
    }

    pub fn add_hmd(&self) -> Arc<constel::Device> {
        self.tracker
            .add_device(
                DeviceId(0),
                DeviceKind::Hmd,
                Isometry3::identity(),
                cube_model(),
                make_filter(),
            )
            .expect("add hmd")
    }

    pub fn add_controller(&self, id: u8) -> Arc<constel::Device> {
        self.tracker
            .add_device(
                DeviceId(id),
                DeviceKind::Controller,
                Isometry3::identity(),
                cube_model(),
                make_filter(),
            )
            .expect("add controller")
    }

    /// Feed `n` static gravity-aligned IMU samples at 1 kHz so the filter's
    /// tilt uncertainty converges.
    pub fn settle_imu(&self, device: &constel::Device, n: u32, start_us: u32) -> u32 {
        for i in 0..n {
            let ts = start_us + i * 1000;
            device.imu_update(
                ts as u64 * 1000,
                ts,
                Vector3::zeros(),
                Vector3::new(0.0, 9.80665, 0.0),
                None,
            );
        }
        start_us + n * 1000
    }
}
