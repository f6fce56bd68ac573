pub mod capture;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::WireFormat;
use serde::{Deserialize, Serialize};

pub use capture::{DecodedFrame, FrameGeometry, InboundBuffer};
pub use error::{DropReason, GraphError, MapError, ReceiverError};
pub use graph::MediaGraph;
pub use pipeline::{
    BusMessage, IngestContext, LifecycleState, LoopControl, Receiver, StatsReport, StatsSnapshot,
};

/// Environment prefix for configuration overrides, e.g. `SHM_INGEST_RECEIVER__WIDTH`
pub const ENV_PREFIX: &str = "SHM_INGEST";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub receiver: ReceiverConfig,
    pub stats: StatsConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Shared-memory socket the producer writes to
    pub endpoint: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Caps format tag of the incoming feed (e.g. I420)
    pub source_format: String,
    /// Layout the graph converts to before handing buffers over
    pub wire_format: WireFormat,
    pub framerate: u32,
    pub endpoint_wait_attempts: u32,
    pub endpoint_wait_backoff_ms: u64,
    pub join_timeout_ms: u64,
    pub event_loop_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub report_interval_ms: u64,
    /// Minimum gap between two emitted diagnostics of the same severity
    pub error_cooldown_ms: u64,
    /// EMA factor for the frame rate
    pub smoothing: f64,
    /// Log frame details every N successful frames (0 disables)
    pub frame_log_interval: u64,
    pub low_fps_threshold: Option<f64>,
    pub low_fps_grace_ms: u64,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GStreamerConfig {
    /// Full launch string; must contain an appsink named `sink`
    pub custom_pipeline: Option<String>,
    pub max_buffers: u32,
    pub drop: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            endpoint: PathBuf::from("/tmp/video-stream"),
            width: 1920,
            height: 1080,
            source_format: "I420".into(),
            wire_format: WireFormat::Bgrx,
            framerate: 30,
            endpoint_wait_attempts: 10,
            endpoint_wait_backoff_ms: 1000,
            join_timeout_ms: 500,
            event_loop_core: None,
        }
    }
}

impl ReceiverConfig {
    pub fn endpoint_wait_backoff(&self) -> Duration {
        Duration::from_millis(self.endpoint_wait_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 5000,
            error_cooldown_ms: 5000,
            smoothing: 0.2,
            frame_log_interval: 100,
            low_fps_threshold: Some(10.0),
            low_fps_grace_ms: 10_000,
        }
    }
}

impl StatsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn low_fps_grace(&self) -> Duration {
        Duration::from_millis(self.low_fps_grace_ms)
    }
}

#[cfg(feature = "gstreamer-pipeline")]
impl Default for GStreamerConfig {
    fn default() -> Self {
        Self {
            custom_pipeline: None,
            max_buffers: 2,
            drop: true,
        }
    }
}

impl Config {
    /// Defaults, then `path` (TOML) if given, then `SHM_INGEST_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ReceiverError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
