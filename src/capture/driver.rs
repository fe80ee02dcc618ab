//! Device driver interface consumed by the acquisition core.
//!
//! Mirrors a GenICam-style transport layer: buffers are announced, the
//! capture engine is started, buffers are queued, and completed buffers come
//! back through a single registered [`FrameHandler`] on a context the device
//! owns.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::{BufferId, DeliveredFrame, FrameBuffer, PixelFormat};

/// Failure reported by the device. The code is surfaced verbatim in logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed with device error {code}")]
pub struct DeviceError {
    pub operation: &'static str,
    pub code: i32,
}

impl DeviceError {
    pub const fn new(operation: &'static str, code: i32) -> Self {
        Self { operation, code }
    }
}

/// A queue request the device refused. The buffer comes back with the error.
#[derive(Debug)]
pub struct QueueRejection {
    pub error: DeviceError,
    pub buffer: FrameBuffer,
}

/// Acquisition mode feature of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    Continuous,
    SingleFrame,
    MultiFrame,
}

impl AcquisitionMode {
    /// Finite acquisitions where every frame matters.
    pub const fn is_finite(self) -> bool {
        matches!(self, AcquisitionMode::SingleFrame | AcquisitionMode::MultiFrame)
    }
}

/// Maximum frame bounds of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    pub max_width: u32,
    pub max_height: u32,
}

/// Active region of interest on the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn full(geometry: SensorGeometry) -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            width: geometry.max_width,
            height: geometry.max_height,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.offset_x, self.offset_y
        )
    }
}

/// Delivery callback registered with the device for one capture session.
///
/// Invoked once per completed buffer from a context the application does
/// not control; implementations must return quickly and never block.
pub trait FrameHandler: Send + Sync {
    fn on_buffer_ready(&self, frame: DeliveredFrame);
}

/// Abstraction over the camera transport and feature access
pub trait CameraDriver: Send + Sync {
    /// Bytes the device needs per frame with the current features.
    fn payload_size(&self) -> Result<usize, DeviceError>;

    /// Whether the device exposes a stream buffers can be announced to.
    fn supports_streaming(&self) -> bool {
        true
    }

    fn announce_buffer(&self, id: BufferId, size: usize) -> Result<(), DeviceError>;

    /// Open the capture engine and register the delivery callback.
    fn start_capture(&self, handler: Arc<dyn FrameHandler>) -> Result<(), DeviceError>;

    fn queue_buffer(&self, buffer: FrameBuffer) -> Result<(), QueueRejection>;

    /// Issue the acquisition start command.
    fn start_acquisition(&self) -> Result<(), DeviceError>;

    /// Issue the acquisition stop command.
    fn stop_acquisition(&self) -> Result<(), DeviceError>;

    /// Close the capture engine and drop the delivery callback.
    fn end_capture(&self) -> Result<(), DeviceError>;

    /// Cancel pending buffers, returning the ones the device still held.
    fn flush_queue(&self) -> Result<Vec<FrameBuffer>, DeviceError>;

    /// Unregister every announced buffer, returning any it still held.
    fn revoke_all_buffers(&self) -> Result<Vec<FrameBuffer>, DeviceError>;

    fn sensor_geometry(&self) -> Result<SensorGeometry, DeviceError>;
    fn region(&self) -> Result<Region, DeviceError>;
    fn set_width(&self, width: u32) -> Result<(), DeviceError>;
    fn set_height(&self, height: u32) -> Result<(), DeviceError>;
    fn set_offset_x(&self, offset: u32) -> Result<(), DeviceError>;
    fn set_offset_y(&self, offset: u32) -> Result<(), DeviceError>;

    fn pixel_format(&self) -> Result<PixelFormat, DeviceError>;
    fn set_pixel_format(&self, format: PixelFormat) -> Result<(), DeviceError>;

    fn acquisition_mode(&self) -> Result<AcquisitionMode, DeviceError>;
    fn set_acquisition_mode(&self, mode: AcquisitionMode) -> Result<(), DeviceError>;

    fn exposure_us(&self) -> Result<f64, DeviceError>;
    fn gain_db(&self) -> Result<f64, DeviceError>;
}
