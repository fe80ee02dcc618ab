pub mod acquisition;
pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use acquisition::{AcquisitionController, AcquisitionState, Reconfiguration, RegionRequest};
pub use capture::{CameraDriver, SimulatedCamera};
pub use display::{DisplaySnapshot, FrameAvailable, ProbePoint};
pub use error::{AcquisitionError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub buffer_count: usize,
    /// Forward every frame regardless of acquisition mode
    pub display_every_frame: bool,
    /// Forward one frame out of N in continuous mode
    pub display_interval: u32,
    pub fps_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Envelopes waiting for the worker before the oldest is superseded
    pub queue_depth: usize,
    pub worker_poll_ms: u64,
    /// Pending "frame available" notifications before they coalesce
    pub notify_depth: usize,
    /// Pin the processing worker to this core
    pub worker_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub pixel_format: PixelFormat,
    /// Frames per second; 0 delivers only on demand
    pub frame_rate: f64,
    pub exposure_us: f64,
    pub gain_db: f64,
}

impl SimulatorConfig {
    /// Mono8 sensor of the given size that only delivers on demand.
    pub fn manual(width: u32, height: u32) -> Self {
        Self {
            sensor_width: width,
            sensor_height: height,
            frame_rate: 0.0,
            ..Self::default()
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            display_every_frame: false,
            display_interval: 1,
            fps_window_ms: 1000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            worker_poll_ms: 50,
            notify_depth: 1,
            worker_core: None,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensor_width: 1936,
            sensor_height: 1216,
            pixel_format: PixelFormat::Mono8,
            frame_rate: 30.0,
            exposure_us: 10_000.0,
            gain_db: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("loading configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMFLOW__*` environment
    /// variables, in that order.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded = builder
            .add_source(
                config::Environment::with_prefix("CAMFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.capture.buffer_count == 0 {
            return Err(ConfigError::Invalid("capture.buffer_count must be at least 1"));
        }
        if self.capture.fps_window_ms == 0 {
            return Err(ConfigError::Invalid("capture.fps_window_ms must be at least 1"));
        }
        let rate = self.simulator.frame_rate;
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::Invalid(
                "simulator.frame_rate must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}
