//! Bounded hand-off between the delivery context and the processing worker

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use tracing::{debug, warn};

use crate::capture::frame::FrameEnvelope;

#[derive(Debug)]
pub enum WorkItem {
    Frame(FrameEnvelope),
    /// Processed after every envelope queued before it
    Shutdown,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    superseded: AtomicUsize,
    closed: AtomicBool,
}

/// MPMC channel where a full queue supersedes its oldest envelope
/// instead of blocking the producer.
#[derive(Clone)]
pub struct EnvelopeQueue {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    stats: Arc<CachePadded<Stats>>,
}

impl EnvelopeQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = flume::bounded(depth.max(1));
        Self {
            tx,
            rx,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Producer: never blocks. Returns true when an older envelope was dropped.
    ///
    /// Frames pushed after [`EnvelopeQueue::close`] are discarded.
    pub fn push(&self, item: WorkItem) -> bool {
        let mut superseded = false;
        let mut item = item;
        loop {
            if self.stats.closed.load(Ordering::Acquire) {
                return superseded;
            }
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return superseded;
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // drop oldest; the worker may have raced us to it
                    match self.rx.try_recv() {
                        Ok(WorkItem::Frame(_)) => {
                            superseded = true;
                            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("frames_superseded").increment(1);
                        }
                        Ok(WorkItem::Shutdown) => {
                            // only reachable when closing raced this push
                            if self.tx.try_send(WorkItem::Shutdown).is_err() {
                                warn!("Shutdown marker displaced; worker exits on its stop flag");
                            }
                            return superseded;
                        }
                        Err(_) => {}
                    }
                }
                Err(TrySendError::Disconnected(_)) => return superseded,
            }
        }
    }

    /// Refuse further frames and queue a shutdown marker behind the ones
    /// already waiting. Nothing queued is evicted; the call waits up to
    /// `timeout` for the consumer to make room.
    ///
    /// Returns false when the marker could not be queued in time.
    pub fn close(&self, timeout: Duration) -> bool {
        self.stats.closed.store(true, Ordering::Release);
        match self.tx.send_timeout(WorkItem::Shutdown, timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                debug!(waiting = self.len(), "Queue still full at close");
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stats.closed.load(Ordering::Acquire)
    }

    /// Consumer: wait up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<WorkItem, RecvTimeoutError> {
        let item = self.rx.recv_timeout(timeout)?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// (pushed, popped, superseded)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.pushed.load(Ordering::Relaxed),
            self.stats.popped.load(Ordering::Relaxed),
            self.stats.superseded.load(Ordering::Relaxed),
        )
    }
}
