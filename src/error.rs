//! Error types for the ingestion core

use thiserror::Error;

use crate::pipeline::dispatch::LifecycleState;

/// Errors surfaced by the receiver lifecycle
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The external graph could not reach its running state
    #[error("pipeline failed to start: {0}")]
    PipelineStartFailed(#[source] GraphError),

    #[error("receiver cannot start from state {0:?}")]
    InvalidState(LifecycleState),

    /// `stop` was called before `start` finished
    #[error("start interrupted by stop")]
    Interrupted,

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Errors reported by a media graph implementation
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to build graph: {0}")]
    Build(String),

    #[error("state change to {target} failed: {reason}")]
    StateChange { target: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A buffer whose memory could not be mapped for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer could not be mapped readable")]
pub struct MapError;

/// Why an inbound buffer did not become a published frame.
///
/// All variants are frame-local: they are counted and logged, and the
/// pipeline keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("graph delivered no sample")]
    NoBuffer,

    #[error("buffer mapping failed")]
    MapFailed,

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("corrupt frame")]
    Corrupt,
}
