use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use super::decoder::DecodedFrame;

/// Index of a buffer slot inside a [`BufferPool`](super::pool::BufferPool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned, fixed-size memory region the device fills with one frame.
///
/// Ownership moves to the device while the buffer is queued and comes back
/// through [`DeliveredFrame`] or the flush/revoke calls.
#[derive(Debug)]
pub struct FrameBuffer {
    pub id: BufferId,
    pub data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(id: BufferId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pixel formats the sensor can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono12,
    Mono12Packed,
    Mono14,
    Mono16,
}

impl PixelFormat {
    /// Bytes per pixel for unpacked formats, `None` for packed ones.
    pub const fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Mono8 => Some(1),
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono14
            | PixelFormat::Mono16 => Some(2),
            PixelFormat::Mono12Packed => None,
        }
    }

    pub const fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono10 => 10,
            PixelFormat::Mono12 | PixelFormat::Mono12Packed => 12,
            PixelFormat::Mono14 => 14,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Bytes needed for a `width` x `height` frame.
    pub fn payload_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self.bytes_per_pixel() {
            Some(bpp) => pixels * bpp,
            // two 12-bit pixels share three bytes
            None => pixels.div_ceil(2) * 3,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono12Packed => "Mono12Packed",
            PixelFormat::Mono14 => "Mono14",
            PixelFormat::Mono16 => "Mono16",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Completion status reported by the device for a delivered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub format: PixelFormat,
    pub bytes_used: usize,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// A completed buffer handed back by the device on its delivery context
#[derive(Debug)]
pub struct DeliveredFrame {
    pub buffer: FrameBuffer,
    pub status: FrameStatus,
    pub meta: FrameMetadata,
}

impl DeliveredFrame {
    /// The filled part of the buffer.
    pub fn payload(&self) -> &[u8] {
        let used = self.meta.bytes_used.min(self.buffer.data.len());
        &self.buffer.data[..used]
    }
}

/// A forwarded frame on its way to the processing worker.
///
/// The payload is copied out of the device buffer so the buffer can be
/// re-queued immediately.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub session_id: u64,
    pub sequence: u64,
    pub data: Bytes,
    pub meta: FrameMetadata,
    pub arrived_at: Instant,
    /// Filled in place by the worker
    pub decoded: Option<DecodedFrame>,
}
