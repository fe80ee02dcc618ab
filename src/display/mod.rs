pub mod snapshot;

pub use snapshot::{DisplaySnapshot, FrameAvailable, ProbePoint, SnapshotSlot};
