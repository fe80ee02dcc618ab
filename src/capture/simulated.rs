//! In-process camera implementing [`CameraDriver`] for tests and demos.
//!
//! Frames are delivered on a dedicated thread at the configured rate, or on
//! demand through [`SimulatedCamera::deliver`] when the rate is zero. Every
//! driver call is recorded and any of them can be made to fail once.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::driver::{
    AcquisitionMode, CameraDriver, DeviceError, FrameHandler, QueueRejection, Region,
    SensorGeometry,
};
use super::frame::{
    BufferId, DeliveredFrame, FrameBuffer, FrameMetadata, FrameStatus, PixelFormat,
};
use crate::SimulatorConfig;

// Error codes follow the usual GenICam transport layer numbering
pub const ERR_BAD_PARAMETER: i32 = -7;
pub const ERR_INVALID_ACCESS: i32 = -6;
pub const ERR_INVALID_VALUE: i32 = -11;
pub const ERR_OTHER: i32 = -13;
pub const ERR_INVALID_CALL: i32 = -15;

/// Width/height increment and offset increment of the simulated sensor
const SIZE_INCREMENT: u32 = 4;
const OFFSET_INCREMENT: u32 = 2;

/// One-shot failure injected into the next matching driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    PayloadSize,
    AnnounceAt(usize),
    StartCapture,
    QueueAt(usize),
    StartAcquisition,
    StopAcquisition,
    EndCapture,
    FlushQueue,
    RevokeAll,
    SetWidth,
    SetPixelFormat,
    /// Next frame reports fewer bytes than its format needs
    TruncateNext,
    /// Next frame is delivered with an incomplete status
    IncompleteNext,
}

/// Driver calls in the order they were made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    PayloadSize,
    Announce(BufferId),
    StartCapture,
    Queue(BufferId),
    StartAcquisition,
    StopAcquisition,
    EndCapture,
    FlushQueue,
    RevokeAll,
    SetWidth(u32),
    SetHeight(u32),
    SetOffsetX(u32),
    SetOffsetY(u32),
    SetPixelFormat(PixelFormat),
    SetAcquisitionMode(AcquisitionMode),
}

#[derive(Debug)]
struct Features {
    geometry: SensorGeometry,
    region: Region,
    format: PixelFormat,
    mode: AcquisitionMode,
    exposure_us: f64,
    gain_db: f64,
}

struct SimState {
    features: Features,
    announced: BTreeSet<BufferId>,
    queue: VecDeque<FrameBuffer>,
    handler: Option<Arc<dyn FrameHandler>>,
    capturing: bool,
    acquiring: bool,
    next_frame_id: u64,
    started_at: Instant,
}

struct Shared {
    state: Mutex<SimState>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<DriverCall>>,
}

impl Shared {
    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    /// Consume a matching injected fault.
    fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == fault) {
            Some(index) => {
                faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn fail(&self, fault: Fault, operation: &'static str) -> Result<(), DeviceError> {
        if self.take_fault(fault) {
            debug!(operation, code = ERR_OTHER, "Injected device failure");
            return Err(DeviceError::new(operation, ERR_OTHER));
        }
        Ok(())
    }

    /// Fill and hand back the oldest queued buffer. Returns false when idle.
    fn deliver_next(&self) -> bool {
        let (handler, frame) = {
            let mut state = self.state.lock();
            if !state.acquiring {
                return false;
            }
            let Some(handler) = state.handler.clone() else {
                return false;
            };
            let Some(mut buffer) = state.queue.pop_front() else {
                return false;
            };

            let truncate = self.take_fault(Fault::TruncateNext);
            let incomplete = self.take_fault(Fault::IncompleteNext);
            let frame_id = state.next_frame_id;
            state.next_frame_id += 1;

            let region = state.features.region;
            let format = state.features.format;
            let payload = format.payload_size(region.width, region.height);
            fill_pattern(&mut buffer.data, region, format, frame_id);

            let bytes_used = if truncate { payload / 2 } else { payload };
            let meta = FrameMetadata {
                frame_id,
                width: region.width,
                height: region.height,
                offset_x: region.offset_x,
                offset_y: region.offset_y,
                format,
                bytes_used: bytes_used.min(buffer.data.len()),
                device_timestamp: Some(state.started_at.elapsed()),
            };
            let status = if incomplete {
                FrameStatus::Incomplete
            } else {
                FrameStatus::Complete
            };
            (handler, DeliveredFrame { buffer, status, meta })
        };

        trace!(frame_id = frame.meta.frame_id, buffer = %frame.buffer.id, "Delivering frame");
        handler.on_buffer_ready(frame);
        true
    }
}

/// Gradient that moves one step per frame, clamped to the format's bit depth
fn fill_pattern(data: &mut [u8], region: Region, format: PixelFormat, frame_id: u64) {
    let max = if format.bit_depth() >= 16 {
        u32::from(u16::MAX)
    } else {
        (1u32 << format.bit_depth()) - 1
    };
    let width = region.width as usize;
    let step = (frame_id % 256) as u32;

    match format.bytes_per_pixel() {
        Some(1) => {
            for (index, byte) in data.iter_mut().take(width * region.height as usize).enumerate() {
                let (x, y) = ((index % width) as u32, (index / width) as u32);
                *byte = ((x + y + step) % (max + 1)) as u8;
            }
        }
        Some(_) => {
            let pixels = width * region.height as usize;
            for (index, pair) in data.chunks_exact_mut(2).take(pixels).enumerate() {
                let (x, y) = ((index % width) as u32, (index / width) as u32);
                let value = ((x + y + step) % (max + 1)) as u16;
                pair.copy_from_slice(&value.to_le_bytes());
            }
        }
        None => data.fill(0),
    }
}

struct Streamer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Simulated camera with a fixed-size sensor
pub struct SimulatedCamera {
    shared: Arc<Shared>,
    frame_rate: f64,
    streamer: Mutex<Option<Streamer>>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        let geometry = SensorGeometry {
            max_width: config.sensor_width,
            max_height: config.sensor_height,
        };
        let features = Features {
            geometry,
            region: Region::full(geometry),
            format: config.pixel_format,
            mode: AcquisitionMode::Continuous,
            exposure_us: config.exposure_us,
            gain_db: config.gain_db,
        };

        info!(
            "Simulated camera: {}x{} {} at {} fps",
            geometry.max_width, geometry.max_height, config.pixel_format, config.frame_rate
        );

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    features,
                    announced: BTreeSet::new(),
                    queue: VecDeque::new(),
                    handler: None,
                    capturing: false,
                    acquiring: false,
                    next_frame_id: 0,
                    started_at: Instant::now(),
                }),
                faults: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }),
            frame_rate: config.frame_rate,
            streamer: Mutex::new(None),
        }
    }

    /// Arm a one-shot failure.
    pub fn inject(&self, fault: Fault) {
        self.shared.faults.lock().push(fault);
    }

    /// Deliver up to `count` frames on the calling thread.
    pub fn deliver(&self, count: usize) -> usize {
        (0..count).take_while(|_| self.shared.deliver_next()).count()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.shared.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().clear();
    }

    pub fn announced_count(&self) -> usize {
        self.shared.state.lock().announced.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_acquiring(&self) -> bool {
        self.shared.state.lock().acquiring
    }

    pub fn set_exposure_us(&self, exposure_us: f64) {
        self.shared.state.lock().features.exposure_us = exposure_us;
    }

    pub fn set_gain_db(&self, gain_db: f64) {
        self.shared.state.lock().features.gain_db = gain_db;
    }

    fn spawn_streamer(&self) {
        // anything but a positive finite rate means manual delivery
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return;
        }
        let Ok(period) = Duration::try_from_secs_f64(1.0 / self.frame_rate) else {
            tracing::warn!(rate = self.frame_rate, "Frame rate out of range; delivering manually");
            return;
        };
        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);

        let spawned = std::thread::Builder::new()
            .name("sim-delivery".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    shared.deliver_next();
                    std::thread::sleep(period);
                }
            });

        match spawned {
            Ok(handle) => *self.streamer.lock() = Some(Streamer { stop, handle }),
            Err(e) => tracing::error!("Failed to spawn delivery thread: {}", e),
        }
    }

    fn join_streamer(&self) {
        let streamer = self.streamer.lock().take();
        if let Some(streamer) = streamer {
            streamer.stop.store(true, Ordering::Release);
            if streamer.handle.join().is_err() {
                tracing::error!("Delivery thread panicked");
            }
        }
    }

    fn set_feature(
        &self,
        operation: &'static str,
        apply: impl FnOnce(&mut Features) -> bool,
    ) -> Result<(), DeviceError> {
        let mut state = self.shared.state.lock();
        if state.acquiring {
            return Err(DeviceError::new(operation, ERR_INVALID_ACCESS));
        }
        if apply(&mut state.features) {
            Ok(())
        } else {
            Err(DeviceError::new(operation, ERR_INVALID_VALUE))
        }
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.join_streamer();
    }
}

impl CameraDriver for SimulatedCamera {
    fn payload_size(&self) -> Result<usize, DeviceError> {
        self.shared.record(DriverCall::PayloadSize);
        self.shared.fail(Fault::PayloadSize, "PayloadSize")?;
        let state = self.shared.state.lock();
        let f = &state.features;
        Ok(f.format.payload_size(f.region.width, f.region.height))
    }

    fn announce_buffer(&self, id: BufferId, size: usize) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::Announce(id));
        self.shared.fail(Fault::AnnounceAt(id.0), "AnnounceFrame")?;
        let mut state = self.shared.state.lock();
        let f = &state.features;
        if size < f.format.payload_size(f.region.width, f.region.height) {
            return Err(DeviceError::new("AnnounceFrame", ERR_BAD_PARAMETER));
        }
        state.announced.insert(id);
        Ok(())
    }

    fn start_capture(&self, handler: Arc<dyn FrameHandler>) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::StartCapture);
        self.shared.fail(Fault::StartCapture, "StartCapture")?;
        let mut state = self.shared.state.lock();
        if state.capturing {
            return Err(DeviceError::new("StartCapture", ERR_INVALID_CALL));
        }
        state.capturing = true;
        state.handler = Some(handler);
        Ok(())
    }

    fn queue_buffer(&self, buffer: FrameBuffer) -> Result<(), QueueRejection> {
        self.shared.record(DriverCall::Queue(buffer.id));
        if let Err(error) = self.shared.fail(Fault::QueueAt(buffer.id.0), "QueueFrame") {
            return Err(QueueRejection { error, buffer });
        }
        let mut state = self.shared.state.lock();
        let code = if !state.capturing {
            Some(ERR_INVALID_CALL)
        } else if !state.announced.contains(&buffer.id) {
            Some(ERR_BAD_PARAMETER)
        } else {
            None
        };
        match code {
            Some(code) => Err(QueueRejection {
                error: DeviceError::new("QueueFrame", code),
                buffer,
            }),
            None => {
                state.queue.push_back(buffer);
                Ok(())
            }
        }
    }

    fn start_acquisition(&self) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::StartAcquisition);
        self.shared.fail(Fault::StartAcquisition, "AcquisitionStart")?;
        {
            let mut state = self.shared.state.lock();
            if !state.capturing {
                return Err(DeviceError::new("AcquisitionStart", ERR_INVALID_CALL));
            }
            state.acquiring = true;
        }
        self.spawn_streamer();
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::StopAcquisition);
        let result = self.shared.fail(Fault::StopAcquisition, "AcquisitionStop");
        if result.is_ok() {
            self.shared.state.lock().acquiring = false;
            self.join_streamer();
        }
        result
    }

    fn end_capture(&self) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::EndCapture);
        self.shared.fail(Fault::EndCapture, "EndCapture")?;
        {
            let mut state = self.shared.state.lock();
            state.acquiring = false;
            state.capturing = false;
            state.handler = None;
        }
        self.join_streamer();
        Ok(())
    }

    fn flush_queue(&self) -> Result<Vec<FrameBuffer>, DeviceError> {
        self.shared.record(DriverCall::FlushQueue);
        self.shared.fail(Fault::FlushQueue, "FlushQueue")?;
        Ok(self.shared.state.lock().queue.drain(..).collect())
    }

    fn revoke_all_buffers(&self) -> Result<Vec<FrameBuffer>, DeviceError> {
        self.shared.record(DriverCall::RevokeAll);
        self.shared.fail(Fault::RevokeAll, "RevokeAllFrames")?;
        let mut state = self.shared.state.lock();
        state.announced.clear();
        Ok(state.queue.drain(..).collect())
    }

    fn sensor_geometry(&self) -> Result<SensorGeometry, DeviceError> {
        Ok(self.shared.state.lock().features.geometry)
    }

    fn region(&self) -> Result<Region, DeviceError> {
        Ok(self.shared.state.lock().features.region)
    }

    fn set_width(&self, width: u32) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetWidth(width));
        self.shared.fail(Fault::SetWidth, "Width")?;
        self.set_feature("Width", |f| {
            let ok = width > 0
                && width % SIZE_INCREMENT == 0
                && width + f.region.offset_x <= f.geometry.max_width;
            if ok {
                f.region.width = width;
            }
            ok
        })
    }

    fn set_height(&self, height: u32) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetHeight(height));
        self.set_feature("Height", |f| {
            let ok = height > 0
                && height % SIZE_INCREMENT == 0
                && height + f.region.offset_y <= f.geometry.max_height;
            if ok {
                f.region.height = height;
            }
            ok
        })
    }

    fn set_offset_x(&self, offset: u32) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetOffsetX(offset));
        self.set_feature("OffsetX", |f| {
            let ok = offset % OFFSET_INCREMENT == 0
                && offset + f.region.width <= f.geometry.max_width;
            if ok {
                f.region.offset_x = offset;
            }
            ok
        })
    }

    fn set_offset_y(&self, offset: u32) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetOffsetY(offset));
        self.set_feature("OffsetY", |f| {
            let ok = offset % OFFSET_INCREMENT == 0
                && offset + f.region.height <= f.geometry.max_height;
            if ok {
                f.region.offset_y = offset;
            }
            ok
        })
    }

    fn pixel_format(&self) -> Result<PixelFormat, DeviceError> {
        Ok(self.shared.state.lock().features.format)
    }

    fn set_pixel_format(&self, format: PixelFormat) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetPixelFormat(format));
        self.shared.fail(Fault::SetPixelFormat, "PixelFormat")?;
        self.set_feature("PixelFormat", |f| {
            f.format = format;
            true
        })
    }

    fn acquisition_mode(&self) -> Result<AcquisitionMode, DeviceError> {
        Ok(self.shared.state.lock().features.mode)
    }

    fn set_acquisition_mode(&self, mode: AcquisitionMode) -> Result<(), DeviceError> {
        self.shared.record(DriverCall::SetAcquisitionMode(mode));
        self.set_feature("AcquisitionMode", |f| {
            f.mode = mode;
            true
        })
    }

    fn exposure_us(&self) -> Result<f64, DeviceError> {
        Ok(self.shared.state.lock().features.exposure_us)
    }

    fn gain_db(&self) -> Result<f64, DeviceError> {
        Ok(self.shared.state.lock().features.gain_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Mutex<Vec<DeliveredFrame>>);

    impl FrameHandler for Collect {
        fn on_buffer_ready(&self, frame: DeliveredFrame) {
            self.0.lock().push(frame);
        }
    }

    #[test]
    fn test_manual_delivery_in_queue_order() {
        let camera = SimulatedCamera::new(SimulatorConfig::manual(8, 4));
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let size = camera.payload_size().unwrap();

        for i in 0..2 {
            camera.announce_buffer(BufferId(i), size).unwrap();
        }
        camera.start_capture(sink.clone()).unwrap();
        for i in 0..2 {
            camera
                .queue_buffer(FrameBuffer::new(BufferId(i), vec![0; size]))
                .unwrap();
        }

        // not acquiring yet
        assert_eq!(camera.deliver(1), 0);

        camera.start_acquisition().unwrap();
        assert_eq!(camera.deliver(5), 2);

        let frames = sink.0.lock();
        assert_eq!(frames[0].buffer.id, BufferId(0));
        assert_eq!(frames[1].meta.frame_id, 1);
        assert_eq!(frames[1].payload()[0], 1);
    }

    #[test]
    fn test_unusable_frame_rate_falls_back_to_manual() {
        for frame_rate in [f64::NAN, f64::INFINITY, -5.0, 1e-320] {
            let camera = SimulatedCamera::new(SimulatorConfig {
                frame_rate,
                ..SimulatorConfig::manual(8, 4)
            });
            camera.start_capture(Arc::new(Collect(Mutex::new(Vec::new())))).unwrap();
            camera.start_acquisition().unwrap();
            assert!(camera.is_acquiring());
            camera.stop_acquisition().unwrap();
        }
    }

    #[test]
    fn test_queue_rejected_before_capture() {
        let camera = SimulatedCamera::new(SimulatorConfig::manual(8, 4));
        camera.announce_buffer(BufferId(0), 32).unwrap();
        let rejection = camera
            .queue_buffer(FrameBuffer::new(BufferId(0), vec![0; 32]))
            .unwrap_err();
        assert_eq!(rejection.error.code, ERR_INVALID_CALL);
        assert_eq!(rejection.buffer.id, BufferId(0));
    }

    #[test]
    fn test_features_locked_while_acquiring() {
        let camera = SimulatedCamera::new(SimulatorConfig::manual(8, 4));
        camera.start_capture(Arc::new(Collect(Mutex::new(Vec::new())))).unwrap();
        camera.start_acquisition().unwrap();

        let err = camera.set_width(4).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_ACCESS);
    }

    #[test]
    fn test_width_must_respect_increment_and_bounds() {
        let camera = SimulatedCamera::new(SimulatorConfig::manual(16, 8));
        assert_eq!(camera.set_width(6).unwrap_err().code, ERR_INVALID_VALUE);
        assert_eq!(camera.set_width(20).unwrap_err().code, ERR_INVALID_VALUE);
        camera.set_width(8).unwrap();
        camera.set_offset_x(8).unwrap();
        assert_eq!(camera.region().unwrap().offset_x, 8);
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let camera = SimulatedCamera::new(SimulatorConfig::manual(8, 4));
        camera.inject(Fault::FlushQueue);
        assert!(camera.flush_queue().is_err());
        assert!(camera.flush_queue().is_ok());
    }
}
