use thiserror::Error;

use crate::acquisition::AcquisitionState;
use crate::capture::driver::DeviceError;
use crate::capture::frame::{BufferId, PixelFormat};
use crate::capture::pool::PoolError;

/// Errors surfaced by the acquisition core.
///
/// Allocation, registration, and start failures propagate to the caller of
/// `start`/`reconfigure`. Decode and teardown failures are only logged.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("allocated {allocated} of {requested} buffers")]
    AllocationShortfall { requested: usize, allocated: usize },

    #[error("announcing buffer {buffer}: {source}")]
    Registration {
        buffer: BufferId,
        #[source]
        source: DeviceError,
    },

    #[error("starting capture engine: {0}")]
    StartCapture(#[source] DeviceError),

    #[error("queueing buffer {buffer}: {source}")]
    Submit {
        buffer: BufferId,
        #[source]
        source: DeviceError,
    },

    #[error("acquisition start command: {0}")]
    AcquisitionCommand(#[source] DeviceError),

    #[error("teardown step: {0}")]
    Teardown(#[source] DeviceError),

    #[error("reading device feature: {0}")]
    Feature(#[source] DeviceError),

    #[error("pixel format {0} is not supported for acquisition")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("requested region {0} lies outside the sensor")]
    InvalidRegion(String),

    #[error("controller busy ({0:?})")]
    Busy(AcquisitionState),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("spawning processing worker: {0}")]
    Worker(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
