pub mod decoder;
pub mod driver;
pub mod frame;
pub mod pool;
pub mod simulated;

pub use decoder::{decode_frame, DecodeError, DecodedFrame};
pub use driver::{AcquisitionMode, CameraDriver, DeviceError, FrameHandler, Region, SensorGeometry};
pub use frame::{BufferId, DeliveredFrame, FrameBuffer, FrameEnvelope, FrameMetadata, PixelFormat};
pub use pool::{BufferAllocator, BufferPool, BufferState, HeapAllocator};
pub use simulated::SimulatedCamera;
