//! Shared state handed to the media graph's callbacks

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::capture::{DecodedFrame, FrameGeometry, FrameValidator, InboundBuffer};
use crate::error::DropReason;
use crate::pipeline::dispatch::{self, BusMessage, LifecycleState, LoopControl, StateCell};
use crate::pipeline::latest::LatestFrame;
use crate::pipeline::stats::{Severity, Statistics, StatsReport, StatsSnapshot};
use crate::{utils, ReceiverConfig, StatsConfig};

/// Everything the buffer and bus callbacks touch.
///
/// Callbacks run one at a time on the event-loop thread; the frame slot,
/// counters and state are also read from other threads.
pub struct IngestContext {
    endpoint: PathBuf,
    validator: FrameValidator,
    stats: Statistics,
    latest: LatestFrame,
    state: StateCell,
    running: AtomicBool,
    frame_log_interval: u64,
    low_fps_threshold: Option<f64>,
    low_fps_grace: Duration,
}

impl IngestContext {
    pub fn new(receiver: &ReceiverConfig, stats: &StatsConfig) -> Self {
        Self {
            endpoint: receiver.endpoint.clone(),
            validator: FrameValidator::new(
                FrameGeometry::new(receiver.width, receiver.height),
                receiver.wire_format,
            ),
            stats: Statistics::new(stats.smoothing, stats.error_cooldown()),
            latest: LatestFrame::new(),
            state: StateCell::new(),
            running: AtomicBool::new(false),
            frame_log_interval: stats.frame_log_interval,
            low_fps_threshold: stats.low_fps_threshold,
            low_fps_grace: stats.low_fps_grace(),
        }
    }

    /// Entry point for every buffer the graph delivers; `None` means the
    /// graph signalled a sample without a buffer.
    ///
    /// Returns the sequence number of the published frame. Failures are
    /// counted and logged here and never need handling by the caller.
    pub fn push_buffer<B: InboundBuffer>(
        &self,
        buffer: Option<&B>,
        at: Instant,
    ) -> Result<u64, DropReason> {
        let Some(buffer) = buffer else {
            self.record_drop(DropReason::NoBuffer, at);
            return Err(DropReason::NoBuffer);
        };

        let sequence = self.latest.generation() + 1;
        let frame = match self.validator.decode(buffer, sequence, at) {
            Ok(frame) => frame,
            Err(reason) => {
                self.record_drop(reason, at);
                return Err(reason);
            }
        };

        if self.frame_log_interval > 0 && sequence % self.frame_log_interval == 0 {
            let (min, max) = frame.value_range().unwrap_or_default();
            debug!(
                "Frame {}: {}x{}, min={}, max={}, fps={:.2}",
                sequence,
                frame.meta.width,
                frame.meta.height,
                min,
                max,
                self.stats.fps()
            );
        }

        self.latest.publish(frame);
        self.stats.record_frame(at);
        Ok(sequence)
    }

    fn record_drop(&self, reason: DropReason, at: Instant) {
        let throttle = self.stats.throttle();
        match reason {
            DropReason::NoBuffer => {
                let count = self.stats.record_null_buffer();
                if throttle.allow(Severity::Warning, at) {
                    warn!("Received null sample (count: {})", count);
                }
            }
            DropReason::MapFailed => {
                let count = self.stats.record_mapping_error();
                if throttle.allow(Severity::Error, at) {
                    error!("Failed to map buffer (count: {})", count);
                }
            }
            DropReason::SizeMismatch { expected, actual } => {
                self.stats.record_dropped();
                if throttle.allow(Severity::Warning, at) {
                    warn!("Buffer size mismatch: expected {}, got {}", expected, actual);
                }
            }
            DropReason::Corrupt => {
                let count = self.stats.record_dropped();
                if throttle.allow(Severity::Warning, at) {
                    warn!("Corrupt frame detected (count: {})", count);
                }
            }
        }
    }

    /// Entry point for every bus message the graph posts
    pub fn push_diagnostic(&self, message: &BusMessage, at: Instant) -> LoopControl {
        let control = dispatch::dispatch(message, &self.state, &self.stats, at);
        if self.state.get() == LifecycleState::Failed {
            self.running.store(false, Ordering::Release);
        }
        control
    }

    /// Most recent decoded frame, if any has arrived
    pub fn frame(&self) -> Option<Arc<DecodedFrame>> {
        self.latest.load()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        self.stats.snapshot(now, self.state.get())
    }

    /// Snapshot plus the periodic health checks
    pub fn report(&self, now: Instant) -> StatsReport {
        let snapshot = self.snapshot_at(now);
        let low_fps = self
            .low_fps_threshold
            .is_some_and(|threshold| snapshot.uptime > self.low_fps_grace && snapshot.fps < threshold);

        StatsReport {
            drop_rate: snapshot.drop_rate(),
            endpoint_present: utils::endpoint_exists(&self.endpoint),
            low_fps,
            resident_bytes: utils::resident_memory_bytes(),
            snapshot,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn mark_started(&self, at: Instant) {
        self.stats.mark_started(at);
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.validator.geometry()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }
}
