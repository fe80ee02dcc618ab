//! Delivery callback: counts every arrival, forwards a subset to the worker
//! and hands the buffer straight back to the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::fps::FrameRateTracker;
use super::queue::{EnvelopeQueue, WorkItem};
use crate::capture::driver::{AcquisitionMode, CameraDriver, FrameHandler};
use crate::capture::frame::{DeliveredFrame, FrameBuffer, FrameEnvelope, FrameStatus};
use crate::capture::pool::BufferPool;

/// Which arrivals are forwarded for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlePolicy {
    Exhaustive,
    /// Forward one arrival out of every N
    Interval(u32),
}

impl ThrottlePolicy {
    pub fn select(mode: AcquisitionMode, display_every_frame: bool, interval: u32) -> Self {
        if mode.is_finite() || display_every_frame {
            ThrottlePolicy::Exhaustive
        } else {
            ThrottlePolicy::Interval(interval.max(1))
        }
    }

    /// Whether the 0-based arrival `index` of a session is forwarded.
    pub fn forwards(self, index: u64) -> bool {
        match self {
            ThrottlePolicy::Exhaustive => true,
            ThrottlePolicy::Interval(n) => index % u64::from(n.max(1)) == 0,
        }
    }
}

pub struct FrameObserver {
    session_id: u64,
    driver: Weak<dyn CameraDriver>,
    pool: Arc<Mutex<BufferPool>>,
    queue: EnvelopeQueue,
    policy: ArcSwap<ThrottlePolicy>,
    tracker: Arc<Mutex<FrameRateTracker>>,
    arrivals: AtomicU64,
    forwarded: AtomicU64,
    requeue: AtomicBool,
    /// Cleared while processing is paused; capture keeps running
    processing: Arc<AtomicBool>,
}

impl FrameObserver {
    pub fn new(
        session_id: u64,
        driver: &Arc<dyn CameraDriver>,
        pool: Arc<Mutex<BufferPool>>,
        queue: EnvelopeQueue,
        policy: ThrottlePolicy,
        tracker: Arc<Mutex<FrameRateTracker>>,
        processing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session_id,
            driver: Arc::downgrade(driver),
            pool,
            queue,
            policy: ArcSwap::from_pointee(policy),
            tracker,
            arrivals: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            requeue: AtomicBool::new(true),
            processing,
        }
    }

    pub fn set_policy(&self, policy: ThrottlePolicy) {
        debug!(session = self.session_id, ?policy, "Throttle policy updated");
        self.policy.store(Arc::new(policy));
    }

    pub fn policy(&self) -> ThrottlePolicy {
        **self.policy.load()
    }

    /// Stop handing buffers back to the device; late deliveries go to the pool.
    pub fn stop_requeue(&self) {
        self.requeue.store(false, Ordering::Release);
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    fn return_buffer(&self, buffer: FrameBuffer) {
        let driver = if self.requeue.load(Ordering::Acquire) {
            self.driver.upgrade()
        } else {
            None
        };

        let buffer = match driver {
            Some(driver) => match driver.queue_buffer(buffer) {
                Ok(()) => return,
                Err(rejection) => {
                    warn!(
                        buffer = %rejection.buffer.id,
                        code = rejection.error.code,
                        "Re-queue failed: {}", rejection.error
                    );
                    rejection.buffer
                }
            },
            None => buffer,
        };

        let id = buffer.id;
        if let Err(e) = self.pool.lock().release(buffer) {
            warn!(buffer = %id, "Could not return buffer to pool: {}", e);
        }
    }
}

impl FrameHandler for FrameObserver {
    fn on_buffer_ready(&self, frame: DeliveredFrame) {
        let arrived_at = Instant::now();
        let index = self.arrivals.fetch_add(1, Ordering::Relaxed);
        self.tracker.lock().record(arrived_at);
        metrics::counter!("frames_received").increment(1);

        let complete = frame.status == FrameStatus::Complete;
        let processing = self.processing.load(Ordering::Acquire);
        if complete && processing && self.policy().forwards(index) {
            let envelope = FrameEnvelope {
                session_id: self.session_id,
                sequence: index,
                data: Bytes::copy_from_slice(frame.payload()),
                meta: frame.meta.clone(),
                arrived_at,
                decoded: None,
            };
            self.queue.push(WorkItem::Frame(envelope));
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_forwarded").increment(1);
        } else {
            if !complete {
                debug!(frame_id = frame.meta.frame_id, "Incomplete frame not forwarded");
            }
            metrics::counter!("frames_dropped").increment(1);
        }

        trace!(buffer = %frame.buffer.id, index, "Returning buffer");
        self.return_buffer(frame.buffer);
    }
}
