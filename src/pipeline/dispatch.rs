//! Bus message classification and the coarse lifecycle state machine

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::pipeline::stats::{Severity, Statistics};

/// Run state of the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Lifecycle state shared between the orchestrator and the event loop
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Created as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the current state is one of `from`
    pub fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !from.contains(&LifecycleState::from_u8(current)) {
                return false;
            }
            match self
                .0
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Enter `Failed` from any non-terminal state
    pub fn fail(&self) -> bool {
        self.transition(
            &[
                LifecycleState::Created,
                LifecycleState::Starting,
                LifecycleState::Running,
                LifecycleState::Stopping,
            ],
            LifecycleState::Failed,
        )
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The graph's own element state, as reported on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    VoidPending,
    Null,
    Ready,
    Paused,
    Playing,
}

/// Payload of error, warning and info messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: Option<String>,
    pub message: String,
    pub debug: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            source: None,
            message: message.into(),
            debug: None,
        }
    }
}

/// Structured message posted by the media graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Error(Diagnostic),
    Warning(Diagnostic),
    Info(Diagnostic),
    StateChanged {
        old: GraphState,
        current: GraphState,
        pending: GraphState,
        /// True when the message comes from the top-level pipeline rather
        /// than one of its elements
        from_pipeline: bool,
    },
    EndOfStream,
}

/// What the event loop should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Quit,
}

/// Classify one bus message, update counters and lifecycle state
pub fn dispatch(
    message: &BusMessage,
    state: &StateCell,
    stats: &Statistics,
    at: Instant,
) -> LoopControl {
    match message {
        BusMessage::Error(diag) => {
            let count = stats.record_bus(Severity::Error);
            if stats.throttle().allow(Severity::Error, at) {
                error!(
                    source = diag.source.as_deref().unwrap_or("-"),
                    "Graph error: {} (count: {})", diag.message, count
                );
                if let Some(details) = &diag.debug {
                    debug!("Graph error debug info: {}", details);
                }
            }
            if state.fail() {
                error!("Pipeline failed, shutting down event loop");
            }
            LoopControl::Quit
        }
        BusMessage::Warning(diag) => {
            let count = stats.record_bus(Severity::Warning);
            if stats.throttle().allow(Severity::Warning, at) {
                warn!(
                    source = diag.source.as_deref().unwrap_or("-"),
                    "Graph warning: {} (count: {})", diag.message, count
                );
                if let Some(details) = &diag.debug {
                    debug!("Graph warning debug info: {}", details);
                }
            }
            LoopControl::Continue
        }
        BusMessage::Info(diag) => {
            info!("Graph info: {}", diag.message);
            LoopControl::Continue
        }
        BusMessage::StateChanged {
            old,
            current,
            from_pipeline,
            ..
        } => {
            if *from_pipeline {
                debug!("Pipeline state changed from {:?} to {:?}", old, current);
            }
            LoopControl::Continue
        }
        BusMessage::EndOfStream => {
            info!("End of stream received");
            state.transition(&[LifecycleState::Running], LifecycleState::Stopping);
            LoopControl::Quit
        }
    }
}
