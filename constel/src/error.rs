use constel_types::DeviceId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid camera calibration: {0}")]
    InvalidCalibration(&'static str),
    #[error("too many tracked devices (max {max})")]
    TooManyDevices { max: usize },
    #[error("{0} already registered")]
    DuplicateDevice(DeviceId),
    #[error("sensor workers already started")]
    AlreadyStarted,
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
