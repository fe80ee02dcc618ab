use std::time::{Duration, Instant};

/// Frame counter with a windowed rate estimate
#[derive(Debug, Clone)]
pub struct FrameRateTracker {
    window: Duration,
    count: u64,
    window_start: Option<Instant>,
    window_samples: u32,
    fps: Option<f64>,
}

/// Point-in-time copy of the tracker for the FPS/frame-count feed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRate {
    pub frames: u64,
    pub fps: Option<f64>,
}

impl FrameRateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            count: 0,
            window_start: None,
            window_samples: 0,
            fps: None,
        }
    }

    /// Count one arrival.
    pub fn record(&mut self, at: Instant) {
        self.count += 1;

        let Some(start) = self.window_start else {
            // first arrival only marks the window start
            self.window_start = Some(at);
            self.window_samples = 0;
            return;
        };

        self.window_samples += 1;
        let elapsed = at.saturating_duration_since(start);
        // a zero window would otherwise divide by a zero interval
        if elapsed >= self.window && !elapsed.is_zero() {
            let fps = f64::from(self.window_samples) / elapsed.as_secs_f64();
            self.fps = Some(fps);
            metrics::gauge!("capture_fps").set(fps);
            self.window_start = Some(at);
            self.window_samples = 0;
        }
    }

    /// Restart the rate window. The cumulative count survives unless
    /// `clear_count` is set.
    pub fn reset(&mut self, clear_count: bool) {
        if clear_count {
            self.count = 0;
        }
        self.window_start = None;
        self.window_samples = 0;
        self.fps = None;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub fn current(&self) -> FrameRate {
        FrameRate {
            frames: self.count,
            fps: self.fps,
        }
    }
}

impl Default for FrameRateTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
