//! Bounded pool of frame buffers shared with the device.
//!
//! Every buffer carries a tagged [`BufferState`]; transitions are validated
//! against a fixed table instead of trusting callers. Memory is moved, not
//! shared: while a buffer is `Queued` its bytes live with the device.

use thiserror::Error;
use tracing::{debug, warn};

use super::frame::{BufferId, FrameBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Announced,
    Queued,
    Revoked,
}

impl BufferState {
    pub const fn can_transition_to(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Free, Announced)
                | (Revoked, Announced)
                | (Announced, Queued)
                | (Queued, Announced)
                | (Queued, Free)
                | (Announced, Free)
                | (_, Revoked)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: BufferId,
        from: BufferState,
        to: BufferState,
    },
    #[error("buffer {0} does not belong to this pool")]
    UnknownBuffer(BufferId),
    #[error("buffer {0} memory is not held by the pool")]
    MemoryMissing(BufferId),
}

/// Outcome of [`BufferPool::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub requested: usize,
    pub allocated: usize,
}

impl Allocation {
    pub fn is_shortfall(&self) -> bool {
        self.allocated < self.requested
    }
}

/// Source of buffer memory. Returns `None` on resource exhaustion.
pub trait BufferAllocator: Send {
    fn allocate(&mut self, index: usize, size: usize) -> Option<Vec<u8>>;
}

/// Heap allocation through fallible reservation
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, _index: usize, size: usize) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).ok()?;
        data.resize(size, 0);
        Some(data)
    }
}

#[derive(Debug)]
struct Slot {
    id: BufferId,
    state: BufferState,
    memory: Option<Vec<u8>>,
}

impl Slot {
    fn transition(&mut self, next: BufferState) -> Result<(), PoolError> {
        if !self.state.can_transition_to(next) {
            return Err(PoolError::IllegalTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<Slot>,
    capacity: usize,
    buffer_size: usize,
    allocations: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create up to `count` buffers of `size` bytes, replacing any previous ones.
    ///
    /// Stops at the first exhausted allocation and keeps what succeeded; the
    /// pool then runs with fewer buffers than `count`.
    pub fn allocate(
        &mut self,
        count: usize,
        size: usize,
        allocator: &mut dyn BufferAllocator,
    ) -> Allocation {
        if let Some(slot) = self.slots.iter().find(|s| s.state == BufferState::Queued) {
            warn!(buffer = %slot.id, "Reallocating pool while a buffer is still queued");
        }

        self.slots.clear();
        self.capacity = count;
        self.buffer_size = size;

        for index in 0..count {
            let Some(memory) = allocator.allocate(index, size) else {
                debug!(index, size, "Buffer allocation exhausted");
                break;
            };
            self.slots.push(Slot {
                id: BufferId(index),
                state: BufferState::Free,
                memory: Some(memory),
            });
            self.allocations += 1;
        }

        Allocation {
            requested: count,
            allocated: self.slots.len(),
        }
    }

    /// Size in bytes of a Free (or previously Revoked) buffer about to be
    /// registered with the device.
    ///
    /// Only checks; the slot changes in [`BufferPool::mark_announced`] once
    /// the device accepted it, so a rejected buffer keeps its previous state.
    pub fn announce_size(&self, id: BufferId) -> Result<usize, PoolError> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.id == id)
            .ok_or(PoolError::UnknownBuffer(id))?;
        if !slot.state.can_transition_to(BufferState::Announced) {
            return Err(PoolError::IllegalTransition {
                id,
                from: slot.state,
                to: BufferState::Announced,
            });
        }
        slot.memory.as_ref().map(Vec::len).ok_or(PoolError::MemoryMissing(id))
    }

    /// Record a registration the device accepted.
    pub fn mark_announced(&mut self, id: BufferId) -> Result<(), PoolError> {
        self.slot_mut(id)?.transition(BufferState::Announced)
    }

    /// Move an Announced buffer to Queued, handing its memory out for the device.
    pub fn take_for_queue(&mut self, id: BufferId) -> Result<FrameBuffer, PoolError> {
        let slot = self.slot_mut(id)?;
        if slot.memory.is_none() {
            return Err(PoolError::MemoryMissing(id));
        }
        slot.transition(BufferState::Queued)?;
        let data = slot.memory.take().ok_or(PoolError::MemoryMissing(id))?;
        Ok(FrameBuffer::new(id, data))
    }

    /// Return a buffer the device no longer holds to Free.
    pub fn release(&mut self, buffer: FrameBuffer) -> Result<(), PoolError> {
        let slot = self.slot_mut(buffer.id)?;
        slot.transition(BufferState::Free)?;
        slot.memory = Some(buffer.data);
        Ok(())
    }

    /// Take back buffers a queue flush returned; they stay Announced.
    ///
    /// A buffer that cannot be taken back is logged and skipped; the rest
    /// are still reclaimed. Returns how many were rejected.
    pub fn reclaim(&mut self, buffers: Vec<FrameBuffer>) -> usize {
        let mut rejected = 0;
        for buffer in buffers {
            let outcome = self
                .slot_mut(buffer.id)
                .and_then(|slot| slot.transition(BufferState::Announced).map(|()| slot));
            match outcome {
                Ok(slot) => slot.memory = Some(buffer.data),
                Err(e) => {
                    warn!("Could not reclaim flushed buffer: {}", e);
                    rejected += 1;
                }
            }
        }
        rejected
    }

    /// Mark every buffer Revoked after the device released them.
    ///
    /// `returned` are buffers the device handed back during revocation. A
    /// slot whose memory never came back stays Revoked without memory and
    /// makes the pool non-reusable.
    pub fn revoke_all(&mut self, returned: Vec<FrameBuffer>) {
        for buffer in returned {
            match self.slots.iter_mut().find(|s| s.id == buffer.id) {
                Some(slot) => slot.memory = Some(buffer.data),
                None => warn!(buffer = %buffer.id, "Device returned a foreign buffer"),
            }
        }
        for slot in &mut self.slots {
            if slot.memory.is_none() {
                warn!(buffer = %slot.id, "Buffer memory lost during revoke");
            }
            slot.state = BufferState::Revoked;
        }
    }

    /// Whether the next session can run on these buffers without reallocating.
    pub fn is_reusable(&self, count: usize, size: usize) -> bool {
        !self.slots.is_empty()
            && self.capacity == count
            && self.buffer_size == size
            && self.slots.iter().all(|s| {
                s.memory.is_some() && matches!(s.state, BufferState::Free | BufferState::Revoked)
            })
    }

    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.slots.iter().find(|s| s.id == id).map(|s| s.state)
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    pub fn ids(&self) -> Vec<BufferId> {
        self.slots.iter().map(|s| s.id).collect()
    }

    /// Number of buffers actually allocated
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Requested number of buffers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total buffers ever allocated by this pool
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    fn slot_mut(&mut self, id: BufferId) -> Result<&mut Slot, PoolError> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(PoolError::UnknownBuffer(id))
    }
}
