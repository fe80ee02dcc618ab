//! Dedicated thread that decodes forwarded frames one at a time and
//! publishes the result for the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::queue::{EnvelopeQueue, WorkItem};
use crate::capture::decoder::{decode_frame, DecodeError, DecodedFrame};
use crate::capture::driver::CameraDriver;
use crate::capture::frame::FrameEnvelope;
use crate::display::snapshot::{DisplaySnapshot, FrameAvailable, ProbePoint, SnapshotSlot};
use crate::error::AcquisitionError;

/// Scalar device readouts attached to a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readouts {
    pub exposure_ms: Option<f64>,
    pub gain_db: Option<f64>,
}

impl Readouts {
    fn read(driver: &dyn CameraDriver) -> Self {
        let exposure_ms = match driver.exposure_us() {
            Ok(us) => Some(us / 1000.0),
            Err(e) => {
                debug!(code = e.code, "Exposure readout unavailable");
                None
            }
        };
        let gain_db = match driver.gain_db() {
            Ok(db) => Some(db),
            Err(e) => {
                debug!(code = e.code, "Gain readout unavailable");
                None
            }
        };
        Self { exposure_ms, gain_db }
    }
}

/// Everything a session's worker needs
pub struct WorkerContext {
    pub session_id: u64,
    pub queue: EnvelopeQueue,
    pub driver: Arc<dyn CameraDriver>,
    pub slot: Arc<SnapshotSlot>,
    pub notify: Sender<FrameAvailable>,
    pub probe: Arc<Mutex<Option<ProbePoint>>>,
    pub poll: Duration,
    pub core: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub decode_failures: u64,
    pub notifications_coalesced: u64,
}

pub struct ProcessingWorker {
    queue: EnvelopeQueue,
    poll: Duration,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl ProcessingWorker {
    pub fn spawn(ctx: WorkerContext) -> Result<Self, AcquisitionError> {
        let queue = ctx.queue.clone();
        let poll = ctx.poll;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(format!("frame-worker-{}", ctx.session_id))
            .spawn(move || run(ctx, &thread_stop))
            .map_err(AcquisitionError::Worker)?;

        Ok(Self {
            queue,
            poll,
            stop,
            handle: Some(handle),
        })
    }

    /// Finish envelopes already queued, then join the thread.
    pub fn stop(&mut self) -> WorkerStats {
        let Some(handle) = self.handle.take() else {
            return WorkerStats::default();
        };
        // the flag covers a marker that could not be queued in time
        self.stop.store(true, Ordering::Release);
        if !self.queue.close(self.poll) {
            debug!("Worker will stop once the queue drains");
        }

        match handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("Processing worker panicked");
                WorkerStats::default()
            }
        }
    }
}

impl Drop for ProcessingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(ctx: WorkerContext, stop: &AtomicBool) -> WorkerStats {
    if let Some(core) = ctx.core {
        pin_to_core(core);
    }
    debug!(session = ctx.session_id, "Processing worker started");

    let mut stats = WorkerStats::default();
    loop {
        let mut envelope = match ctx.queue.pop_timeout(ctx.poll) {
            Ok(WorkItem::Frame(envelope)) => envelope,
            Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
        };

        let probe = *ctx.probe.lock();
        let readouts = Readouts::read(ctx.driver.as_ref());

        let snapshot = match process(&mut envelope, readouts, probe) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                stats.decode_failures += 1;
                metrics::counter!("decode_failures").increment(1);
                warn!(
                    session = envelope.session_id,
                    sequence = envelope.sequence,
                    "Dropping frame: {}", e
                );
                continue;
            }
        };

        metrics::histogram!("decode_time_us").record(snapshot.decode_time.as_micros() as f64);
        ctx.slot.publish(snapshot);
        stats.processed += 1;

        let note = FrameAvailable {
            session_id: envelope.session_id,
            sequence: envelope.sequence,
        };
        match ctx.notify.try_send(note) {
            Ok(()) => {}
            // consumer already has a pending notification
            Err(TrySendError::Full(_)) => stats.notifications_coalesced += 1,
            Err(TrySendError::Disconnected(_)) => {
                trace!("No consumer listening for frame notifications");
            }
        }
    }

    info!(
        session = ctx.session_id,
        processed = stats.processed,
        decode_failures = stats.decode_failures,
        "Processing worker stopped"
    );
    stats
}

fn pin_to_core(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("Core ids unavailable; worker not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => debug!(core, "Worker pinned"),
        _ => warn!(core, "Could not pin worker"),
    }
}

/// Decode one envelope in place and derive its display view.
pub fn process(
    envelope: &mut FrameEnvelope,
    readouts: Readouts,
    probe: Option<ProbePoint>,
) -> Result<DisplaySnapshot, DecodeError> {
    let started = Instant::now();
    let decoded = decode_frame(&envelope.data, &envelope.meta)?;
    let decode_time = started.elapsed();

    let (min, max) = sample_range(&decoded);
    let probe = ProbePoint::resolve(probe, decoded.width, decoded.height);
    let (row_profile, column_profile) = profiles(&decoded, probe);

    let snapshot = DisplaySnapshot {
        session_id: envelope.session_id,
        sequence: envelope.sequence,
        frame_id: envelope.meta.frame_id,
        width: decoded.width,
        height: decoded.height,
        offset_x: envelope.meta.offset_x,
        offset_y: envelope.meta.offset_y,
        format: decoded.format,
        samples: Arc::clone(&decoded.samples),
        exposure_ms: readouts.exposure_ms,
        gain_db: readouts.gain_db,
        min,
        max,
        probe,
        row_profile,
        column_profile,
        decode_time,
        published_at: Instant::now(),
    };
    envelope.decoded = Some(decoded);
    Ok(snapshot)
}

fn sample_range(frame: &DecodedFrame) -> (u16, u16) {
    frame
        .samples
        .iter()
        .fold(None, |acc: Option<(u16, u16)>, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .unwrap_or((0, 0))
}

fn profiles(frame: &DecodedFrame, probe: ProbePoint) -> (Vec<u16>, Vec<u16>) {
    let width = frame.width as usize;
    if width == 0 || frame.height == 0 {
        return (Vec::new(), Vec::new());
    }
    let row_start = probe.y as usize * width;
    let row = frame.samples[row_start..row_start + width].to_vec();
    let column = frame
        .samples
        .iter()
        .skip(probe.x as usize)
        .step_by(width)
        .copied()
        .collect();
    (row, column)
}
