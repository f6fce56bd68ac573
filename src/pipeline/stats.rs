//! Frame counters, smoothed frame rate and rate-limited diagnostics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::pipeline::dispatch::LifecycleState;

/// Cooldown classes for throttled diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn index(self) -> usize {
        match self {
            Self::Warning => 0,
            Self::Error => 1,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Per-severity cooldown. A class emits at most once per `cooldown`.
#[derive(Debug)]
pub struct Throttle {
    cooldown: Duration,
    last: [AtomicCell<Option<Instant>>; 2],
    emitted: [AtomicU64; 2],
}

impl Throttle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: [AtomicCell::new(None), AtomicCell::new(None)],
            emitted: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Returns true when a diagnostic of `severity` may be emitted at `now`,
    /// and starts a new cooldown window if so.
    pub fn allow(&self, severity: Severity, now: Instant) -> bool {
        let slot = &self.last[severity.index()];
        let mut current = slot.load();
        loop {
            if let Some(prev) = current {
                if now.saturating_duration_since(prev) < self.cooldown {
                    return false;
                }
            }
            match slot.compare_exchange(current, Some(now)) {
                Ok(_) => {
                    self.emitted[severity.index()].fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Diagnostics of `severity` actually emitted so far
    pub fn emitted(&self, severity: Severity) -> u64 {
        self.emitted[severity.index()].load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Counters {
    successful_frames: AtomicU64,
    dropped_frames: AtomicU64,
    null_buffers: AtomicU64,
    mapping_errors: AtomicU64,
    bus_warnings: AtomicU64,
    bus_errors: AtomicU64,
}

/// Process-wide ingest statistics.
///
/// Counters only ever grow. Frame-rate state is written by the event-loop
/// thread alone; everything is readable from any thread.
#[derive(Debug)]
pub struct Statistics {
    counters: CachePadded<Counters>,
    fps: AtomicCell<f64>,
    smoothing: f64,
    last_frame_at: AtomicCell<Option<Instant>>,
    started_at: AtomicCell<Option<Instant>>,
    throttle: Throttle,
}

/// Immutable view of [`Statistics`] at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub fps: f64,
    pub uptime: Duration,
    pub successful_frames: u64,
    pub dropped_frames: u64,
    pub null_buffers: u64,
    pub mapping_errors: u64,
    pub bus_warnings: u64,
    pub bus_errors: u64,
    pub state: LifecycleState,
}

impl StatsSnapshot {
    /// Percentage of delivered frames that were dropped
    pub fn drop_rate(&self) -> f64 {
        let total = self.successful_frames + self.dropped_frames;
        if total == 0 {
            0.0
        } else {
            self.dropped_frames as f64 / total as f64 * 100.0
        }
    }
}

/// One periodic report
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub snapshot: StatsSnapshot,
    pub drop_rate: f64,
    pub endpoint_present: bool,
    pub low_fps: bool,
    pub resident_bytes: Option<u64>,
}

impl StatsReport {
    pub fn log(&self, endpoint: &std::path::Path) {
        let s = &self.snapshot;
        info!(
            "Stats: Uptime={:.1}s, Frames={}, FPS={:.2}, Drops={} ({:.1}%), State={:?}",
            s.uptime.as_secs_f64(),
            s.successful_frames,
            s.fps,
            s.dropped_frames,
            self.drop_rate,
            s.state
        );
        if self.low_fps {
            warn!("Low FPS detected: {:.2}", s.fps);
        }
        if !self.endpoint_present {
            warn!("Shared memory endpoint {} does not exist!", endpoint.display());
        }
        if let Some(bytes) = self.resident_bytes {
            debug!("Memory usage: {:.2} MB", bytes as f64 / 1024.0 / 1024.0);
        }

        gauge!("shm_ingest_fps").set(s.fps);
        gauge!("shm_ingest_drop_rate").set(self.drop_rate);
    }
}

impl Statistics {
    pub fn new(smoothing: f64, error_cooldown: Duration) -> Self {
        Self {
            counters: CachePadded::new(Counters::default()),
            fps: AtomicCell::new(0.0),
            smoothing,
            last_frame_at: AtomicCell::new(None),
            started_at: AtomicCell::new(None),
            throttle: Throttle::new(error_cooldown),
        }
    }

    pub fn mark_started(&self, at: Instant) {
        self.started_at.store(Some(at));
    }

    /// Count a published frame and fold its arrival into the smoothed rate.
    /// Returns the total number of successful frames.
    pub fn record_frame(&self, at: Instant) -> u64 {
        let total = self.counters.successful_frames.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("shm_ingest_frames_total", "outcome" => "decoded").increment(1);

        if let Some(prev) = self.last_frame_at.swap(Some(at)) {
            if at > prev {
                let instant = 1.0 / (at - prev).as_secs_f64();
                let fps = self.fps.load();
                let next = if fps == 0.0 {
                    instant
                } else {
                    self.smoothing * instant + (1.0 - self.smoothing) * fps
                };
                self.fps.store(next);
            }
        }
        total
    }

    /// Count a frame that reached validation but was not published
    pub fn record_dropped(&self) -> u64 {
        counter!("shm_ingest_frames_total", "outcome" => "dropped").increment(1);
        self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_null_buffer(&self) -> u64 {
        counter!("shm_ingest_frames_total", "outcome" => "null").increment(1);
        self.counters.null_buffers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_mapping_error(&self) -> u64 {
        counter!("shm_ingest_frames_total", "outcome" => "unmapped").increment(1);
        self.counters.mapping_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a bus warning or error. Returns the new count for that class.
    pub fn record_bus(&self, severity: Severity) -> u64 {
        counter!("shm_ingest_bus_messages_total", "severity" => severity.label()).increment(1);
        let counter = match severity {
            Severity::Warning => &self.counters.bus_warnings,
            Severity::Error => &self.counters.bus_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn fps(&self) -> f64 {
        self.fps.load()
    }

    pub fn snapshot(&self, now: Instant, state: LifecycleState) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            fps: self.fps.load(),
            uptime: self
                .started_at
                .load()
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default(),
            successful_frames: c.successful_frames.load(Ordering::Relaxed),
            dropped_frames: c.dropped_frames.load(Ordering::Relaxed),
            null_buffers: c.null_buffers.load(Ordering::Relaxed),
            mapping_errors: c.mapping_errors.load(Ordering::Relaxed),
            bus_warnings: c.bus_warnings.load(Ordering::Relaxed),
            bus_errors: c.bus_errors.load(Ordering::Relaxed),
            state,
        }
    }
}
