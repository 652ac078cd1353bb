//! Tracker core: the set of tracked devices and sensors, and the
//! exposure-info broadcast that synchronises camera observations with the
//! fusion filters.

use std::sync::Arc;

use nalgebra::Isometry3;
use parking_lot::Mutex;
use tracing::{debug, info};

use constel_fusion::PoseFilter;
use constel_types::{DeviceId, DeviceKind, ExposureInfo, LedModel, TrackerConfig};

use crate::device::Device;
use crate::sensor::Sensor;
use crate::{Error, Result, MAX_TRACKED_DEVICES};

struct TrackerInner {
    devices: Vec<Arc<Device>>,
    sensors: Vec<Arc<Sensor>>,
    exposure: Option<ExposureInfo>,
}

/// Owns the tracked devices and sensors. Sensors hold a weak back-reference
/// for their callbacks; the tracker is the only owner.
pub struct Tracker {
    config: Arc<TrackerConfig>,
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Arc<Tracker> {
        Arc::new(Tracker {
            config: Arc::new(config),
            inner: Mutex::new(TrackerInner {
                devices: Vec::new(),
                sensors: Vec::new(),
                exposure: None,
            }),
        })
    }

    pub fn config(&self) -> &Arc<TrackerConfig> {
        &self.config
    }

    /// Register a tracked device. Devices are append-only; their index in
    /// registration order identifies them in exposure broadcasts.
    pub fn add_device(
        &self,
        id: DeviceId,
        kind: DeviceKind,
        fusion_to_model: Isometry3<f64>,
        leds: LedModel,
        filter: Box<dyn PoseFilter>,
    ) -> Result<Arc<Device>> {
        let mut inner = self.inner.lock();
        if inner.devices.len() >= MAX_TRACKED_DEVICES {
            return Err(Error::TooManyDevices {
                max: MAX_TRACKED_DEVICES,
            });
        }
        if inner.devices.iter().any(|d| d.id() == id) {
            return Err(Error::DuplicateDevice(id));
        }
        let device = Arc::new(Device::new(
            id,
            kind,
            fusion_to_model,
            leds,
            filter,
            self.config.clone(),
        ));
        inner.devices.push(device.clone());
        info!(device = %id, ?kind, "device registered");
        Ok(device)
    }

    pub fn add_sensor(&self, sensor: Arc<Sensor>) {
        let mut inner = self.inner.lock();
        info!(serial = sensor.serial(), "sensor registered");
        inner.sensors.push(sensor);
    }

    /// Snapshot of the device list in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.lock().devices.clone()
    }

    pub fn current_exposure(&self) -> Option<ExposureInfo> {
        self.inner.lock().exposure.clone()
    }

    /// Register a new LED exposure reported by the HMD.
    ///
    /// An unchanged `count` only refreshes the LED blink phase. A new count
    /// allocates one delay slot per device (round-robin, possibly none) and
    /// broadcasts the exposure to every sensor, which may bind it to the
    /// frame currently being captured.
    pub fn update_exposure(&self, local_ts: u64, hmd_ts: u32, count: u16, led_pattern_phase: u8) {
        let (info, sensors) = {
            let mut inner = self.inner.lock();
            if let Some(e) = &mut inner.exposure {
                if e.count == count {
                    e.led_pattern_phase = led_pattern_phase;
                    let info = e.clone();
                    let sensors = inner.sensors.clone();
                    drop(inner);
                    for s in &sensors {
                        s.sensor_update_exposure(&info);
                    }
                    return;
                }
            }

            let devices: Vec<_> = inner
                .devices
                .iter()
                .map(|dev| dev.update_exposure())
                .collect();
            let info = ExposureInfo {
                local_ts,
                hmd_ts,
                count,
                led_pattern_phase,
                devices,
            };
            inner.exposure = Some(info.clone());
            (info, inner.sensors.clone())
        };
        debug!(count, n_devices = info.devices.len(), "new exposure");
        for s in &sensors {
            s.sensor_update_exposure(&info);
        }
    }

    /// A sensor announced a start-of-frame bound to `exposure`: take a
    /// reference on each device's delay slot.
    pub(crate) fn frame_started(&self, start_ts: u64, exposure: Option<&ExposureInfo>) {
        let Some(exposure) = exposure else {
            debug!(start_ts, "frame started without exposure");
            return;
        };
        let devices = self.devices();
        for (entry, device) in exposure.devices.iter().zip(devices.iter()) {
            device.claim_exposure(entry);
        }
    }

    /// Matching release for a `frame_started`. `already_released` flags
    /// devices whose claim was dropped early on pose acceptance.
    pub(crate) fn frame_released(
        &self,
        start_ts: u64,
        exposure: Option<&ExposureInfo>,
        already_released: &[bool],
    ) {
        let Some(exposure) = exposure else {
            debug!(start_ts, "frame released without exposure");
            return;
        };
        let devices = self.devices();
        for (i, (entry, device)) in exposure.devices.iter().zip(devices.iter()).enumerate() {
            if already_released.get(i).copied().unwrap_or(false) {
                continue;
            }
            device.release_exposure(entry);
        }
    }

    /// A frame adopted a different exposure mid-capture: paired
    /// release-and-claim on each device.
    pub(crate) fn frame_changed_exposure(
        &self,
        old: Option<&ExposureInfo>,
        new: &ExposureInfo,
    ) {
        let devices = self.devices();
        match old {
            Some(old) => {
                for (i, device) in devices.iter().enumerate() {
                    match (old.devices.get(i), new.devices.get(i)) {
                        (Some(o), Some(n)) => device.change_exposure(o, n),
                        (Some(o), None) => device.release_exposure(o),
                        (None, Some(n)) => device.claim_exposure(n),
                        (None, None) => {}
                    }
                }
            }
            None => {
                for (entry, device) in new.devices.iter().zip(devices.iter()) {
                    device.claim_exposure(entry);
                }
            }
        }
    }

    /// Stop all sensors. Their workers drain and every in-flight frame is
    /// released back through the normal accounting.
    pub fn shutdown(&self) {
        let sensors = self.inner.lock().sensors.clone();
        for s in &sensors {
            s.stop();
        }
    }
}
