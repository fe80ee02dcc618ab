//! Start/stop/reconfigure scenarios against the simulated camera.
//!
//! The camera runs in manual-delivery mode: frames only arrive when a test
//! calls `deliver`, so every scenario is deterministic.

use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use camflow::acquisition::AcquisitionState;
use camflow::capture::driver::QueueRejection;
use camflow::capture::pool::{BufferAllocator, BufferState};
use camflow::capture::simulated::{DriverCall, Fault};
use camflow::capture::{
    AcquisitionMode, BufferId, CameraDriver, DeviceError, FrameBuffer, FrameHandler, PixelFormat,
    Region, SensorGeometry,
};
use camflow::{
    AcquisitionController, AcquisitionError, Config, Reconfiguration, RegionRequest,
    SimulatedCamera, SimulatorConfig,
};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

fn setup_with(config: Config) -> (Arc<SimulatedCamera>, AcquisitionController) {
    let camera = Arc::new(SimulatedCamera::new(SimulatorConfig::manual(64, 32)));
    let controller = AcquisitionController::new(camera.clone(), &config);
    (camera, controller)
}

fn setup() -> (Arc<SimulatedCamera>, AcquisitionController) {
    setup_with(Config::default())
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Simulated camera with hooks that run inside selected device calls
struct HookedCamera {
    inner: SimulatedCamera,
    on_announce: Mutex<Option<Hook>>,
    /// Taken by the next `set_width`
    width_gate: Mutex<Option<Hook>>,
}

impl HookedCamera {
    fn new() -> Self {
        Self {
            inner: SimulatedCamera::new(SimulatorConfig::manual(64, 32)),
            on_announce: Mutex::new(None),
            width_gate: Mutex::new(None),
        }
    }
}

impl CameraDriver for HookedCamera {
    fn payload_size(&self) -> Result<usize, DeviceError> {
        self.inner.payload_size()
    }

    fn announce_buffer(&self, id: BufferId, size: usize) -> Result<(), DeviceError> {
        let hook = self.on_announce.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.announce_buffer(id, size)
    }

    fn start_capture(&self, handler: Arc<dyn FrameHandler>) -> Result<(), DeviceError> {
        self.inner.start_capture(handler)
    }

    fn queue_buffer(&self, buffer: FrameBuffer) -> Result<(), QueueRejection> {
        self.inner.queue_buffer(buffer)
    }

    fn start_acquisition(&self) -> Result<(), DeviceError> {
        self.inner.start_acquisition()
    }

    fn stop_acquisition(&self) -> Result<(), DeviceError> {
        self.inner.stop_acquisition()
    }

    fn end_capture(&self) -> Result<(), DeviceError> {
        self.inner.end_capture()
    }

    fn flush_queue(&self) -> Result<Vec<FrameBuffer>, DeviceError> {
        self.inner.flush_queue()
    }

    fn revoke_all_buffers(&self) -> Result<Vec<FrameBuffer>, DeviceError> {
        self.inner.revoke_all_buffers()
    }

    fn sensor_geometry(&self) -> Result<SensorGeometry, DeviceError> {
        self.inner.sensor_geometry()
    }

    fn region(&self) -> Result<Region, DeviceError> {
        self.inner.region()
    }

    fn set_width(&self, width: u32) -> Result<(), DeviceError> {
        let gate = self.width_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate();
        }
        self.inner.set_width(width)
    }

    fn set_height(&self, height: u32) -> Result<(), DeviceError> {
        self.inner.set_height(height)
    }

    fn set_offset_x(&self, offset: u32) -> Result<(), DeviceError> {
        self.inner.set_offset_x(offset)
    }

    fn set_offset_y(&self, offset: u32) -> Result<(), DeviceError> {
        self.inner.set_offset_y(offset)
    }

    fn pixel_format(&self) -> Result<PixelFormat, DeviceError> {
        self.inner.pixel_format()
    }

    fn set_pixel_format(&self, format: PixelFormat) -> Result<(), DeviceError> {
        self.inner.set_pixel_format(format)
    }

    fn acquisition_mode(&self) -> Result<AcquisitionMode, DeviceError> {
        self.inner.acquisition_mode()
    }

    fn set_acquisition_mode(&self, mode: AcquisitionMode) -> Result<(), DeviceError> {
        self.inner.set_acquisition_mode(mode)
    }

    fn exposure_us(&self) -> Result<f64, DeviceError> {
        self.inner.exposure_us()
    }

    fn gain_db(&self) -> Result<f64, DeviceError> {
        self.inner.gain_db()
    }
}

#[test]
fn teardown_runs_every_step_when_stop_command_fails() {
    let (camera, controller) = setup();
    controller.start().expect("start");
    camera.deliver(3);

    camera.inject(Fault::StopAcquisition);
    camera.clear_calls();
    controller.stop().expect("stop never propagates teardown errors");

    assert_eq!(
        camera.calls(),
        vec![
            DriverCall::StopAcquisition,
            DriverCall::EndCapture,
            DriverCall::FlushQueue,
            DriverCall::RevokeAll,
        ]
    );
    assert_eq!(controller.state(), AcquisitionState::Idle);
    assert_eq!(controller.buffers_in(BufferState::Announced), 0);
    assert_eq!(controller.buffers_in(BufferState::Queued), 0);
    assert_eq!(camera.announced_count(), 0);
}

#[test]
fn teardown_continues_past_every_failing_step() {
    let (camera, controller) = setup();
    controller.start().expect("start");

    for fault in [
        Fault::StopAcquisition,
        Fault::EndCapture,
        Fault::FlushQueue,
        Fault::RevokeAll,
    ] {
        camera.inject(fault);
    }
    controller.stop().expect("stop");

    assert_eq!(controller.state(), AcquisitionState::Idle);
    assert_eq!(controller.buffers_in(BufferState::Announced), 0);
    assert_eq!(controller.buffers_in(BufferState::Queued), 0);
    assert_eq!(controller.buffers_in(BufferState::Revoked), 4);
}

#[test]
fn concurrent_starts_open_one_session() {
    let (camera, controller) = setup();
    let controller = Arc::new(controller);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                controller.start()
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("start thread"))
        .collect();

    assert!(results.iter().any(Result::is_ok));
    for result in &results {
        match result {
            Ok(()) => {}
            Err(AcquisitionError::Busy(AcquisitionState::Preparing)) => {}
            Err(other) => panic!("unexpected start error: {other}"),
        }
    }

    let acquisition_starts = camera
        .calls()
        .iter()
        .filter(|c| **c == DriverCall::StartAcquisition)
        .count();
    assert_eq!(acquisition_starts, 1);
    assert_eq!(controller.state(), AcquisitionState::Capturing);
    controller.stop().expect("stop");
}

#[test]
fn frame_rate_reset_keeps_cumulative_count() {
    let (camera, controller) = setup();
    controller.start().expect("start");
    assert_eq!(camera.deliver(10), 10);

    assert_eq!(controller.frame_rate().frames, 10);
    controller.reset_frame_rate();

    let rate = controller.frame_rate();
    assert_eq!(rate.frames, 10);
    assert_eq!(rate.fps, None);

    camera.deliver(2);
    assert_eq!(controller.frame_rate().frames, 12);
    controller.stop().expect("stop");
}

#[test]
fn restart_clears_frame_count() {
    let (camera, controller) = setup();
    controller.start().expect("start");
    camera.deliver(5);
    controller.stop().expect("stop");

    controller.start().expect("restart");
    assert_eq!(controller.frame_rate().frames, 0);
    controller.stop().expect("stop");
}

#[test]
fn interval_throttle_forwards_ceil_n_over_k() {
    let mut config = Config::default();
    config.capture.display_interval = 3;
    let (camera, controller) = setup_with(config);

    controller.start().expect("start");
    assert_eq!(camera.deliver(10), 10);

    let session = controller.session().expect("live session");
    assert_eq!(session.arrivals, 10);
    assert_eq!(session.forwarded, 4);
    assert_eq!(controller.frame_rate().frames, 10);
    controller.stop().expect("stop");
}

#[test]
fn finite_mode_forwards_every_frame() {
    let mut config = Config::default();
    config.capture.display_interval = 5;
    let (camera, controller) = setup_with(config);

    controller
        .set_acquisition_mode(camflow::capture::AcquisitionMode::MultiFrame)
        .expect("mode");
    controller.start().expect("start");
    camera.deliver(6);

    assert_eq!(controller.session().map(|s| s.forwarded), Some(6));
    controller.stop().expect("stop");
}

#[test]
fn incomplete_frames_are_counted_not_forwarded() {
    let (camera, controller) = setup();
    controller.start().expect("start");

    camera.inject(Fault::IncompleteNext);
    camera.deliver(3);

    let session = controller.session().expect("live session");
    assert_eq!(session.arrivals, 3);
    assert_eq!(session.forwarded, 2);
    controller.stop().expect("stop");
}

#[test]
fn repeated_region_request_is_idempotent() {
    let (camera, controller) = setup();
    controller.start().expect("start");
    let request = RegionRequest::from_rect(7, 5, 21, 9);

    controller
        .reconfigure(Reconfiguration::Region(request))
        .expect("first apply");
    let first = camera.region().expect("region");

    controller
        .reconfigure(Reconfiguration::Region(request))
        .expect("second apply");
    let second = camera.region().expect("region");

    assert_eq!(first, second);
    assert_eq!(
        first,
        Region {
            offset_x: 6,
            offset_y: 4,
            width: 24,
            height: 12,
        }
    );
    assert_eq!(controller.state(), AcquisitionState::Capturing);
    controller.stop().expect("stop");
}

#[test]
fn region_change_while_capturing_reaches_the_display() {
    let (camera, controller) = setup();
    let notifications = controller.notifications();
    controller.start().expect("start");

    controller
        .reconfigure(Reconfiguration::Region(RegionRequest::from_rect(8, 4, 16, 8)))
        .expect("reconfigure");
    while notifications.try_recv().is_ok() {}

    camera.deliver(1);
    notifications
        .recv_timeout(NOTIFY_TIMEOUT)
        .expect("frame available");

    let snapshot = controller.snapshot().expect("snapshot");
    assert_eq!((snapshot.width, snapshot.height), (16, 8));
    assert_eq!((snapshot.offset_x, snapshot.offset_y), (8, 4));
    controller.stop().expect("stop");
}

#[test]
fn full_region_restores_sensor_bounds() {
    let (camera, controller) = setup();
    controller
        .reconfigure(Reconfiguration::Region(RegionRequest::from_rect(8, 4, 16, 8)))
        .expect("region");
    controller
        .reconfigure(Reconfiguration::FullRegion)
        .expect("full region");

    let region = camera.region().expect("region");
    assert_eq!((region.offset_x, region.offset_y), (0, 0));
    assert_eq!((region.width, region.height), (64, 32));
    assert_eq!(controller.state(), AcquisitionState::Idle);
}

#[test]
fn decode_failure_drops_one_frame_only() {
    let (camera, controller) = setup();
    let notifications = controller.notifications();
    controller.start().expect("start");

    camera.inject(Fault::TruncateNext);
    camera.deliver(1);
    camera.deliver(1);

    let note = notifications
        .recv_timeout(NOTIFY_TIMEOUT)
        .expect("frame available");
    assert_eq!(note.sequence, 1);

    let snapshot = controller.snapshot().expect("snapshot");
    assert_eq!(snapshot.frame_id, 1);
    assert_eq!(snapshot.exposure_ms, Some(10.0));
    assert_eq!(controller.state(), AcquisitionState::Capturing);
    controller.stop().expect("stop");
}

#[test]
fn partial_registration_failure_revokes_everything() {
    let (camera, controller) = setup();
    camera.inject(Fault::AnnounceAt(2));

    let err = controller.start().expect_err("registration must fail");
    assert!(matches!(
        err,
        AcquisitionError::Registration {
            buffer: camflow::capture::BufferId(2),
            ..
        }
    ));

    let calls = camera.calls();
    assert!(calls.contains(&DriverCall::RevokeAll));
    assert!(!calls.contains(&DriverCall::StartCapture));
    assert_eq!(camera.announced_count(), 0);
    assert_eq!(controller.buffers_in(BufferState::Revoked), 4);
    assert_eq!(controller.state(), AcquisitionState::Idle);
}

#[test]
fn allocation_shortfall_runs_with_fewer_buffers() {
    struct FailAt(usize);
    impl BufferAllocator for FailAt {
        fn allocate(&mut self, index: usize, size: usize) -> Option<Vec<u8>> {
            (index < self.0).then(|| vec![0; size])
        }
    }

    let (camera, controller) = setup();
    let controller = controller.with_allocator(Box::new(FailAt(2)));
    controller.start().expect("start with a degraded pool");

    assert_eq!(controller.session().map(|s| s.buffers), Some(2));
    assert_eq!(camera.queued_count(), 2);
    assert_eq!(camera.deliver(5), 5);
    controller.stop().expect("stop");
}

#[test]
fn buffers_are_reused_by_the_next_session() {
    let (camera, controller) = setup();
    controller.start().expect("start");
    camera.deliver(6);
    controller.stop().expect("stop");
    assert_eq!(controller.buffers_in(BufferState::Revoked), 4);

    controller.start().expect("restart");
    assert_eq!(controller.buffer_allocations(), 4);
    assert_eq!(controller.buffers_in(BufferState::Queued), 4);
    assert_eq!(camera.deliver(2), 2);
    controller.stop().expect("stop");
}

#[test]
fn streaming_camera_delivers_on_its_own() {
    let sim = SimulatorConfig {
        sensor_width: 32,
        sensor_height: 16,
        frame_rate: 200.0,
        ..SimulatorConfig::default()
    };
    let camera = Arc::new(SimulatedCamera::new(sim));
    let controller = AcquisitionController::new(camera.clone(), &Config::default());
    let notifications = controller.notifications();

    controller.start().expect("start");
    notifications
        .recv_timeout(NOTIFY_TIMEOUT)
        .expect("frame available");
    controller.stop().expect("stop");

    assert!(controller.frame_rate().frames > 0);
    assert!(!camera.is_acquiring());
}

#[test]
fn pool_stays_available_while_the_device_registers_buffers() {
    let camera = Arc::new(HookedCamera::new());
    let controller = Arc::new(AcquisitionController::new(camera.clone(), &Config::default()));

    // another thread reads the pool from inside every announce call
    let weak = Arc::downgrade(&controller);
    let answered = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&answered);
    *camera.on_announce.lock().unwrap() = Some(Arc::new(move || {
        let Some(controller) = weak.upgrade() else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(controller.buffers_in(BufferState::Free));
        });
        let reply = rx.recv_timeout(Duration::from_secs(1));
        log.lock().unwrap().push(reply.is_ok());
    }));

    controller.start().expect("start");
    assert_eq!(*answered.lock().unwrap(), vec![true; 4]);
    assert_eq!(controller.buffers_in(BufferState::Queued), 4);

    *camera.on_announce.lock().unwrap() = None;
    controller.stop().expect("stop");
}

#[test]
fn transitions_during_reconfigure_are_busy() {
    let camera = Arc::new(HookedCamera::new());
    let controller = Arc::new(AcquisitionController::new(camera.clone(), &Config::default()));
    controller.start().expect("start");

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let (inside, leave) = (Arc::clone(&entered), Arc::clone(&release));
    *camera.width_gate.lock().unwrap() = Some(Arc::new(move || {
        inside.wait();
        leave.wait();
    }));

    let reconfiguring = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            controller.reconfigure(Reconfiguration::Region(RegionRequest::from_rect(8, 4, 16, 8)))
        })
    };
    entered.wait();

    assert_eq!(controller.state(), AcquisitionState::Reconfiguring);
    let busy = |result: camflow::Result<()>| {
        matches!(result, Err(AcquisitionError::Busy(AcquisitionState::Reconfiguring)))
    };
    assert!(busy(controller.start()));
    assert!(busy(controller.stop()));
    assert!(busy(controller.reconfigure(Reconfiguration::FullRegion)));
    assert!(busy(controller.set_acquisition_mode(AcquisitionMode::SingleFrame)));

    release.wait();
    reconfiguring
        .join()
        .expect("reconfigure thread")
        .expect("reconfigure");

    assert_eq!(controller.state(), AcquisitionState::Capturing);
    assert_eq!(
        camera.region().expect("region"),
        Region {
            offset_x: 8,
            offset_y: 4,
            width: 16,
            height: 8,
        }
    );
    controller.stop().expect("stop");
}

#[test]
fn paused_processing_keeps_capture_running() {
    let (camera, controller) = setup();
    let notifications = controller.notifications();
    controller.start().expect("start");

    controller.set_processing(false);
    assert_eq!(camera.deliver(5), 5);
    let session = controller.session().expect("live session");
    assert_eq!((session.arrivals, session.forwarded), (5, 0));
    assert_eq!(controller.frame_rate().frames, 5);
    assert_eq!(camera.queued_count(), 4);
    assert!(notifications.try_recv().is_err());

    controller.set_processing(true);
    camera.deliver(1);
    notifications
        .recv_timeout(NOTIFY_TIMEOUT)
        .expect("frame available");
    assert_eq!(controller.snapshot().map(|s| s.frame_id), Some(5));
    controller.stop().expect("stop");
}
