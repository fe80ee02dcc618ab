pub mod fps;
pub mod observer;
pub mod queue;
pub mod worker;

pub use fps::{FrameRate, FrameRateTracker};
pub use observer::{FrameObserver, ThrottlePolicy};
pub use queue::{EnvelopeQueue, WorkItem};
pub use worker::{ProcessingWorker, Readouts, WorkerContext, WorkerStats};
