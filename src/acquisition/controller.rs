//! Start/stop/reconfigure state machine over one camera.
//!
//! At most one [`AcquisitionSession`] is live at a time. Every transition
//! checks and sets the state under a short lock before touching the device;
//! a transition that finds another one in flight fails with `Busy`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::region::RegionRequest;
use crate::capture::driver::{AcquisitionMode, CameraDriver, DeviceError, FrameHandler, Region};
use crate::capture::frame::{BufferId, PixelFormat};
use crate::capture::pool::{BufferAllocator, BufferPool, BufferState, HeapAllocator};
use crate::display::snapshot::{DisplaySnapshot, FrameAvailable, ProbePoint, SnapshotSlot};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::fps::{FrameRate, FrameRateTracker};
use crate::pipeline::observer::{FrameObserver, ThrottlePolicy};
use crate::pipeline::queue::EnvelopeQueue;
use crate::pipeline::worker::{ProcessingWorker, WorkerContext};
use crate::{CaptureConfig, Config, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Preparing,
    Capturing,
    Draining,
    Reconfiguring,
}

/// Device change applied while stopped
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconfiguration {
    Region(RegionRequest),
    FullRegion,
    PixelFormat(PixelFormat),
    AcquisitionMode(AcquisitionMode),
}

/// One start-to-stop acquisition lifetime
pub struct AcquisitionSession {
    id: u64,
    payload_size: usize,
    buffers: usize,
    started_at: Instant,
    observer: Arc<FrameObserver>,
    worker: ProcessingWorker,
}

impl AcquisitionSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            payload_size: self.payload_size,
            buffers: self.buffers,
            arrivals: self.observer.arrivals(),
            forwarded: self.observer.forwarded(),
            uptime: self.started_at.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub payload_size: usize,
    /// Buffers actually registered, may be fewer than configured
    pub buffers: usize,
    pub arrivals: u64,
    pub forwarded: u64,
    pub uptime: Duration,
}

#[derive(Debug, Clone, Copy)]
struct DisplayPrefs {
    every_frame: bool,
    interval: u32,
    mode: AcquisitionMode,
}

impl DisplayPrefs {
    fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy::select(self.mode, self.every_frame, self.interval)
    }
}

pub struct AcquisitionController {
    driver: Arc<dyn CameraDriver>,
    pool: Arc<Mutex<BufferPool>>,
    allocator: Mutex<Box<dyn BufferAllocator>>,
    state: Mutex<AcquisitionState>,
    state_tx: watch::Sender<AcquisitionState>,
    session: Mutex<Option<AcquisitionSession>>,
    next_session: AtomicU64,
    tracker: Arc<Mutex<FrameRateTracker>>,
    slot: Arc<SnapshotSlot>,
    notify_tx: Sender<FrameAvailable>,
    notify_rx: Receiver<FrameAvailable>,
    probe: Arc<Mutex<Option<ProbePoint>>>,
    prefs: Mutex<DisplayPrefs>,
    processing: Arc<AtomicBool>,
    capture: CaptureConfig,
    pipeline: PipelineConfig,
}

impl AcquisitionController {
    pub fn new(driver: Arc<dyn CameraDriver>, config: &Config) -> Self {
        let (notify_tx, notify_rx) = flume::bounded(config.pipeline.notify_depth.max(1));
        let (state_tx, _) = watch::channel(AcquisitionState::Idle);
        let window = Duration::from_millis(config.capture.fps_window_ms);

        Self {
            driver,
            pool: Arc::new(Mutex::new(BufferPool::new())),
            allocator: Mutex::new(Box::new(HeapAllocator)),
            state: Mutex::new(AcquisitionState::Idle),
            state_tx,
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
            tracker: Arc::new(Mutex::new(FrameRateTracker::new(window))),
            slot: Arc::new(SnapshotSlot::new()),
            notify_tx,
            notify_rx,
            probe: Arc::new(Mutex::new(None)),
            prefs: Mutex::new(DisplayPrefs {
                every_frame: config.capture.display_every_frame,
                interval: config.capture.display_interval,
                mode: AcquisitionMode::Continuous,
            }),
            processing: Arc::new(AtomicBool::new(true)),
            capture: config.capture.clone(),
            pipeline: config.pipeline.clone(),
        }
    }

    /// Build from the process-wide [`crate::CONFIG`].
    pub fn from_global(driver: Arc<dyn CameraDriver>) -> Self {
        let config = crate::CONFIG.load_full();
        Self::new(driver, &config)
    }

    /// Replace the source of buffer memory.
    pub fn with_allocator(self, allocator: Box<dyn BufferAllocator>) -> Self {
        *self.allocator.lock() = allocator;
        self
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.lock()
    }

    /// Follow state changes from async code.
    pub fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AcquisitionState::Capturing
    }

    /// Start acquisition. A no-op when already capturing.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                AcquisitionState::Capturing => return Ok(()),
                AcquisitionState::Idle => *state = AcquisitionState::Preparing,
                other => return Err(AcquisitionError::Busy(other)),
            }
        }
        self.state_tx.send_replace(AcquisitionState::Preparing);

        match self.prepare() {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.set_state(AcquisitionState::Capturing);
                Ok(())
            }
            Err(e) => {
                error!("Start failed: {}", e);
                self.set_state(AcquisitionState::Idle);
                Err(e)
            }
        }
    }

    /// Stop acquisition. Returns once every teardown step has been attempted.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                AcquisitionState::Idle => return Ok(()),
                AcquisitionState::Capturing => *state = AcquisitionState::Draining,
                other => return Err(AcquisitionError::Busy(other)),
            }
        }
        self.state_tx.send_replace(AcquisitionState::Draining);

        let session = self.session.lock().take();
        if let Some(session) = session {
            self.teardown(session);
        }
        self.set_state(AcquisitionState::Idle);
        Ok(())
    }

    /// Apply a device change while stopped, then restore the prior running state.
    #[instrument(skip(self))]
    pub fn reconfigure(&self, change: Reconfiguration) -> Result<()> {
        // validated before any state change or device write
        let region = match change {
            Reconfiguration::Region(request) => {
                let geometry = self.driver.sensor_geometry().map_err(AcquisitionError::Feature)?;
                Some(request.align(geometry)?)
            }
            _ => None,
        };

        let was_running = {
            let mut state = self.state.lock();
            let was_running = match *state {
                AcquisitionState::Idle => false,
                AcquisitionState::Capturing => true,
                other => return Err(AcquisitionError::Busy(other)),
            };
            *state = AcquisitionState::Reconfiguring;
            was_running
        };
        self.state_tx.send_replace(AcquisitionState::Reconfiguring);

        if was_running {
            let session = self.session.lock().take();
            if let Some(session) = session {
                self.teardown(session);
            }
        }

        let applied = match (change, region) {
            (Reconfiguration::Region(_), Some(region)) => self.apply_region(Some(region)),
            (Reconfiguration::FullRegion, _) => self.apply_region(None),
            (Reconfiguration::PixelFormat(format), _) => self
                .driver
                .set_pixel_format(format)
                .map_err(AcquisitionError::Feature),
            (Reconfiguration::AcquisitionMode(mode), _) => {
                let result = self
                    .driver
                    .set_acquisition_mode(mode)
                    .map_err(AcquisitionError::Feature);
                if result.is_ok() {
                    self.prefs.lock().mode = mode;
                }
                result
            }
            (Reconfiguration::Region(_), None) => Ok(()),
        };
        if let Err(e) = &applied {
            warn!("Reconfiguration not applied: {}", e);
        }

        if !was_running {
            self.set_state(AcquisitionState::Idle);
            return applied;
        }

        match self.prepare() {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.set_state(AcquisitionState::Capturing);
                applied
            }
            Err(e) => {
                error!("Restart after reconfiguration failed: {}", e);
                self.set_state(AcquisitionState::Idle);
                Err(e)
            }
        }
    }

    /// Stop any live session.
    pub fn shutdown(&self) {
        if let Err(e) = self.stop() {
            warn!("Shutdown while busy: {}", e);
        }
    }

    /// Restart the rate window, keeping the frame count.
    pub fn reset_frame_rate(&self) {
        self.tracker.lock().reset(false);
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.tracker.lock().current()
    }

    pub fn snapshot(&self) -> Option<Arc<DisplaySnapshot>> {
        self.slot.latest()
    }

    pub fn notifications(&self) -> Receiver<FrameAvailable> {
        self.notify_rx.clone()
    }

    pub fn set_probe(&self, probe: Option<ProbePoint>) {
        *self.probe.lock() = probe;
    }

    pub fn set_display_every_frame(&self, every_frame: bool) {
        let policy = {
            let mut prefs = self.prefs.lock();
            prefs.every_frame = every_frame;
            prefs.policy()
        };
        self.refresh_policy(policy);
    }

    pub fn set_display_interval(&self, interval: u32) {
        let policy = {
            let mut prefs = self.prefs.lock();
            prefs.interval = interval.max(1);
            prefs.policy()
        };
        self.refresh_policy(policy);
    }

    /// Pause or resume frame processing. Acquisition and frame counting
    /// continue while paused; the last snapshot stays published.
    pub fn set_processing(&self, enabled: bool) {
        let was = self.processing.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "Frame processing toggled");
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Change the device acquisition mode, restarting a live session.
    pub fn set_acquisition_mode(&self, mode: AcquisitionMode) -> Result<()> {
        self.reconfigure(Reconfiguration::AcquisitionMode(mode))
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        self.prefs.lock().policy()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.session.lock().as_ref().map(AcquisitionSession::info)
    }

    pub fn buffers_in(&self, state: BufferState) -> usize {
        self.pool.lock().count_in(state)
    }

    /// Total buffers the pool has ever allocated
    pub fn buffer_allocations(&self) -> u64 {
        self.pool.lock().allocations()
    }

    fn set_state(&self, next: AcquisitionState) {
        *self.state.lock() = next;
        self.state_tx.send_replace(next);
        debug!(state = ?next, "Acquisition state");
    }

    fn refresh_policy(&self, policy: ThrottlePolicy) {
        let observer = self
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.observer));
        if let Some(observer) = observer {
            observer.set_policy(policy);
        }
    }

    /// Reset to the full sensor, then apply width, height, offset X, offset Y.
    fn apply_region(&self, region: Option<Region>) -> Result<()> {
        let geometry = self.driver.sensor_geometry().map_err(AcquisitionError::Feature)?;
        let full = Region::full(geometry);

        let write = |result: std::result::Result<(), DeviceError>| {
            result.map_err(AcquisitionError::Feature)
        };
        write(self.driver.set_offset_x(0))?;
        write(self.driver.set_offset_y(0))?;
        write(self.driver.set_width(full.width))?;
        write(self.driver.set_height(full.height))?;

        let target = region.unwrap_or(full);
        if region.is_some() {
            write(self.driver.set_width(target.width))?;
            write(self.driver.set_height(target.height))?;
            write(self.driver.set_offset_x(target.offset_x))?;
            write(self.driver.set_offset_y(target.offset_y))?;
        }
        info!(region = %target, "Region applied");
        Ok(())
    }

    fn prepare(&self) -> Result<AcquisitionSession> {
        let format = self.driver.pixel_format().map_err(AcquisitionError::Feature)?;
        if format == PixelFormat::Mono12Packed {
            return Err(AcquisitionError::UnsupportedPixelFormat(format));
        }

        let mode = self.driver.acquisition_mode().map_err(AcquisitionError::Feature)?;
        let policy = {
            let mut prefs = self.prefs.lock();
            prefs.mode = mode;
            prefs.policy()
        };

        let payload_size = self.driver.payload_size().map_err(AcquisitionError::Feature)?;
        let streaming = self.driver.supports_streaming();
        let buffers = if streaming {
            self.register_buffers(payload_size)?
        } else {
            warn!("Device exposes no stream; acquiring without buffers");
            0
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let queue = EnvelopeQueue::new(self.pipeline.queue_depth);

        let worker = ProcessingWorker::spawn(WorkerContext {
            session_id: id,
            queue: queue.clone(),
            driver: Arc::clone(&self.driver),
            slot: Arc::clone(&self.slot),
            notify: self.notify_tx.clone(),
            probe: Arc::clone(&self.probe),
            poll: Duration::from_millis(self.pipeline.worker_poll_ms),
            core: self.pipeline.worker_core,
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.revoke_buffers();
                return Err(e);
            }
        };

        let observer = Arc::new(FrameObserver::new(
            id,
            &self.driver,
            Arc::clone(&self.pool),
            queue,
            policy,
            Arc::clone(&self.tracker),
            Arc::clone(&self.processing),
        ));
        let session = AcquisitionSession {
            id,
            payload_size,
            buffers,
            started_at: Instant::now(),
            observer,
            worker,
        };

        let handler: Arc<dyn FrameHandler> = session.observer.clone();
        if let Err(source) = self.driver.start_capture(handler) {
            error!(code = source.code, "Capture engine did not start");
            drop(session);
            self.revoke_buffers();
            return Err(AcquisitionError::StartCapture(source));
        }

        if streaming {
            if let Err(e) = self.queue_all() {
                self.teardown(session);
                return Err(e);
            }
        }

        self.tracker.lock().reset(true);

        if let Err(source) = self.driver.start_acquisition() {
            error!(code = source.code, "Acquisition start command failed");
            self.teardown(session);
            return Err(AcquisitionError::AcquisitionCommand(source));
        }

        info!(
            session = id,
            payload_size,
            buffers,
            format = %format,
            ?policy,
            "Acquisition started"
        );
        Ok(session)
    }

    /// Allocate (or reuse) and announce every buffer. Revokes on partial failure.
    fn register_buffers(&self, payload_size: usize) -> Result<usize> {
        let count = self.capture.buffer_count;
        let ids = {
            let mut pool = self.pool.lock();
            if pool.is_reusable(count, payload_size) {
                debug!(count, payload_size, "Reusing buffer pool");
            } else {
                let allocation = pool.allocate(count, payload_size, &mut **self.allocator.lock());
                if allocation.allocated == 0 {
                    return Err(AcquisitionError::AllocationShortfall {
                        requested: allocation.requested,
                        allocated: 0,
                    });
                }
                if allocation.is_shortfall() {
                    warn!(
                        "{}; continuing with fewer buffers",
                        AcquisitionError::AllocationShortfall {
                            requested: allocation.requested,
                            allocated: allocation.allocated,
                        }
                    );
                }
            }
            pool.ids()
        };

        for &id in &ids {
            if let Err(e) = self.announce(id) {
                error!("Registration failed: {}", e);
                self.revoke_buffers();
                return Err(e);
            }
        }
        Ok(ids.len())
    }

    /// Pool lock is released around the device call.
    fn announce(&self, id: BufferId) -> Result<()> {
        let size = self.pool.lock().announce_size(id)?;
        self.driver
            .announce_buffer(id, size)
            .map_err(|source| AcquisitionError::Registration { buffer: id, source })?;
        self.pool.lock().mark_announced(id)?;
        Ok(())
    }

    fn queue_all(&self) -> Result<()> {
        let ids = self.pool.lock().ids();
        for id in ids {
            let buffer = self.pool.lock().take_for_queue(id)?;
            if let Err(rejection) = self.driver.queue_buffer(buffer) {
                let buffer = rejection.buffer.id;
                self.pool.lock().reclaim(vec![rejection.buffer]);
                return Err(AcquisitionError::Submit {
                    buffer,
                    source: rejection.error,
                });
            }
        }
        Ok(())
    }

    fn revoke_buffers(&self) {
        let returned = match self.driver.revoke_all_buffers() {
            Ok(returned) => returned,
            Err(e) => {
                log_teardown(e);
                Vec::new()
            }
        };
        self.pool.lock().revoke_all(returned);
    }

    /// Fixed teardown sequence. Every step runs even when earlier ones fail.
    fn teardown(&self, mut session: AcquisitionSession) {
        session.observer.stop_requeue();

        if let Err(e) = self.driver.stop_acquisition() {
            log_teardown(e);
        }
        if let Err(e) = self.driver.end_capture() {
            log_teardown(e);
        }
        match self.driver.flush_queue() {
            Ok(flushed) => {
                self.pool.lock().reclaim(flushed);
            }
            Err(e) => log_teardown(e),
        }
        self.revoke_buffers();

        let stats = session.worker.stop();
        info!(
            session = session.id,
            arrivals = session.observer.arrivals(),
            forwarded = session.observer.forwarded(),
            processed = stats.processed,
            decode_failures = stats.decode_failures,
            "Acquisition stopped"
        );
    }
}

fn log_teardown(e: DeviceError) {
    let code = e.code;
    error!(code, "{}", AcquisitionError::Teardown(e));
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        let session = self.session.get_mut().take();
        if let Some(session) = session {
            self.teardown(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{DriverCall, Fault, SimulatedCamera};
    use crate::SimulatorConfig;

    fn setup() -> (Arc<SimulatedCamera>, AcquisitionController) {
        let camera = Arc::new(SimulatedCamera::new(SimulatorConfig::manual(64, 32)));
        let controller = AcquisitionController::new(camera.clone(), &Config::default());
        (camera, controller)
    }

    #[test]
    fn test_start_announces_then_queues_then_starts() {
        let (camera, controller) = setup();
        controller.start().unwrap();

        let calls = camera.calls();
        let start_capture = calls.iter().position(|c| *c == DriverCall::StartCapture).unwrap();
        let last_announce = calls
            .iter()
            .rposition(|c| matches!(c, DriverCall::Announce(_)))
            .unwrap();
        let first_queue = calls
            .iter()
            .position(|c| matches!(c, DriverCall::Queue(_)))
            .unwrap();
        assert!(last_announce < start_capture && start_capture < first_queue);
        assert_eq!(calls.last(), Some(&DriverCall::StartAcquisition));

        assert_eq!(controller.state(), AcquisitionState::Capturing);
        assert_eq!(controller.buffers_in(BufferState::Queued), 4);
        controller.stop().unwrap();
    }

    #[test]
    fn test_start_while_capturing_is_noop() {
        let (camera, controller) = setup();
        controller.start().unwrap();
        camera.clear_calls();

        controller.start().unwrap();
        assert!(camera.calls().is_empty());
        controller.stop().unwrap();
    }

    #[test]
    fn test_packed_format_refused_before_buffers() {
        let (camera, controller) = setup();
        controller
            .reconfigure(Reconfiguration::PixelFormat(PixelFormat::Mono12Packed))
            .unwrap();
        camera.clear_calls();

        let err = controller.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::UnsupportedPixelFormat(_)));
        assert!(camera.calls().is_empty());
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_start_capture_failure_revokes() {
        let (camera, controller) = setup();
        camera.inject(Fault::StartCapture);

        let err = controller.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::StartCapture(_)));
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(camera.announced_count(), 0);
        assert_eq!(controller.buffers_in(BufferState::Revoked), 4);
    }

    #[test]
    fn test_submit_failure_tears_down() {
        let (camera, controller) = setup();
        camera.inject(Fault::QueueAt(2));

        let err = controller.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::Submit { .. }));
        assert_eq!(controller.buffers_in(BufferState::Queued), 0);
        assert_eq!(controller.buffers_in(BufferState::Announced), 0);
        assert!(camera.calls().contains(&DriverCall::RevokeAll));
    }

    #[test]
    fn test_acquisition_command_failure_returns_to_idle() {
        let (camera, controller) = setup();
        camera.inject(Fault::StartAcquisition);

        let err = controller.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::AcquisitionCommand(_)));
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(camera.queued_count(), 0);
        assert_eq!(controller.buffers_in(BufferState::Revoked), 4);
    }

    #[test]
    fn test_pool_reused_across_sessions() {
        let (_camera, controller) = setup();
        controller.start().unwrap();
        controller.stop().unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        assert_eq!(controller.buffer_allocations(), 4);
    }

    #[test]
    fn test_allocation_failure_of_every_buffer() {
        struct Exhausted;
        impl BufferAllocator for Exhausted {
            fn allocate(&mut self, _: usize, _: usize) -> Option<Vec<u8>> {
                None
            }
        }

        let (_camera, controller) = setup();
        let controller = controller.with_allocator(Box::new(Exhausted));
        let err = controller.start().unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::AllocationShortfall { requested: 4, allocated: 0 }
        ));
    }

    #[test]
    fn test_display_preference_updates_live_policy() {
        let (_camera, controller) = setup();
        controller.set_display_interval(3);
        controller.start().unwrap();
        assert_eq!(controller.throttle_policy(), ThrottlePolicy::Interval(3));

        controller.set_display_every_frame(true);
        assert_eq!(controller.throttle_policy(), ThrottlePolicy::Exhaustive);
        let observer = controller.session.lock().as_ref().map(|s| s.observer.policy());
        assert_eq!(observer, Some(ThrottlePolicy::Exhaustive));
        controller.stop().unwrap();
    }

    #[test]
    fn test_reconfigure_idle_stays_idle() {
        let (camera, controller) = setup();
        controller
            .reconfigure(Reconfiguration::Region(RegionRequest::from_rect(4, 4, 16, 8)))
            .unwrap();
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert!(!camera.calls().contains(&DriverCall::StartAcquisition));
    }

    #[test]
    fn test_invalid_region_touches_nothing() {
        let (camera, controller) = setup();
        controller.start().unwrap();
        camera.clear_calls();

        let err = controller
            .reconfigure(Reconfiguration::Region(RegionRequest::from_rect(0, 0, 64, 32)))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidRegion(_)));
        assert!(camera.calls().is_empty());
        assert_eq!(controller.state(), AcquisitionState::Capturing);
        controller.stop().unwrap();
    }

    #[test]
    fn test_feature_failure_restores_running_state() {
        let (camera, controller) = setup();
        controller.start().unwrap();
        camera.inject(Fault::SetWidth);

        let err = controller
            .reconfigure(Reconfiguration::Region(RegionRequest::from_rect(4, 4, 16, 8)))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Feature(_)));
        assert_eq!(controller.state(), AcquisitionState::Capturing);
        controller.stop().unwrap();
    }

    #[test]
    fn test_drop_stops_live_session() {
        let (camera, controller) = setup();
        controller.start().unwrap();
        drop(controller);
        assert!(!camera.is_acquiring());
        assert_eq!(camera.announced_count(), 0);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_global_reads_stored_config() {
        let mut config = Config::default();
        config.capture.display_interval = 6;
        config.capture.buffer_count = 2;
        crate::CONFIG.store(Arc::new(config));

        let camera = Arc::new(SimulatedCamera::new(SimulatorConfig::manual(64, 32)));
        let controller = AcquisitionController::from_global(camera.clone());
        crate::CONFIG.store(Arc::new(Config::default()));

        assert_eq!(controller.throttle_policy(), ThrottlePolicy::Interval(6));
        controller.start().unwrap();
        assert_eq!(camera.queued_count(), 2);
        controller.stop().unwrap();
    }

    #[test]
    fn test_processing_switch_survives_restart() {
        let (camera, controller) = setup();
        controller.set_processing(false);
        controller.start().unwrap();
        camera.deliver(2);
        assert_eq!(controller.session().map(|s| s.forwarded), Some(0));
        controller.stop().unwrap();

        controller.start().unwrap();
        assert!(!controller.is_processing());
        camera.deliver(1);
        assert_eq!(controller.session().map(|s| s.forwarded), Some(0));
        controller.stop().unwrap();
    }
}
