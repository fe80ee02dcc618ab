use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::capture::frame::PixelFormat;

/// Pixel the consumer wants row/column profiles through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePoint {
    pub x: u32,
    pub y: u32,
}

impl ProbePoint {
    /// Clamp into a `width` x `height` frame; the centre when no probe is set.
    pub fn resolve(probe: Option<ProbePoint>, width: u32, height: u32) -> ProbePoint {
        match probe {
            Some(p) => ProbePoint {
                x: p.x.min(width.saturating_sub(1)),
                y: p.y.min(height.saturating_sub(1)),
            },
            None => ProbePoint {
                x: width / 2,
                y: height / 2,
            },
        }
    }
}

/// Derived view of the last fully processed frame
#[derive(Debug, Clone)]
pub struct DisplaySnapshot {
    pub session_id: u64,
    pub sequence: u64,
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub format: PixelFormat,
    pub samples: Arc<[u16]>,
    /// None when the device could not report it
    pub exposure_ms: Option<f64>,
    pub gain_db: Option<f64>,
    pub min: u16,
    pub max: u16,
    pub probe: ProbePoint,
    pub row_profile: Vec<u16>,
    pub column_profile: Vec<u16>,
    pub decode_time: Duration,
    pub published_at: Instant,
}

impl DisplaySnapshot {
    pub fn format_label(&self) -> &'static str {
        self.format.label()
    }
}

/// "Frame available" notification for the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAvailable {
    pub session_id: u64,
    pub sequence: u64,
}

/// Single-writer, single-reader slot holding the latest snapshot.
///
/// Publishing swaps a pointer; the reader gets its own `Arc` and never
/// blocks the worker.
#[derive(Debug, Default)]
pub struct SnapshotSlot {
    current: ArcSwapOption<DisplaySnapshot>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: DisplaySnapshot) {
        self.current.store(Some(Arc::new(snapshot)));
    }

    pub fn latest(&self) -> Option<Arc<DisplaySnapshot>> {
        self.current.load_full()
    }

    pub fn clear(&self) {
        self.current.store(None);
    }
}
