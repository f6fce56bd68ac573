//! Plays back a raw dump of concatenated wire-format frames

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use memmap2::Mmap;
use tracing::{debug, info};

use crate::capture::{FrameGeometry, InboundBuffer, WireFormat};
use crate::error::{GraphError, MapError};
use crate::graph::MediaGraph;
use crate::pipeline::{BusMessage, IngestContext};
use crate::ReceiverConfig;

const PACING_STEP: Duration = Duration::from_millis(20);

/// One frame-sized window into the mapped file
struct MappedFrame<'a> {
    bytes: &'a [u8],
    format: WireFormat,
}

impl InboundBuffer for MappedFrame<'_> {
    type Map<'b> = &'b [u8] where Self: 'b;

    fn map_readable(&self) -> Result<&[u8], MapError> {
        Ok(self.bytes)
    }

    fn format(&self) -> Option<WireFormat> {
        Some(self.format)
    }
}

/// Memory-maps a file on `play` and delivers it frame by frame at a fixed
/// rate, then posts end-of-stream. A trailing partial frame is delivered
/// as is.
pub struct ReplayGraph {
    path: PathBuf,
    frame_len: usize,
    format: WireFormat,
    interval: Option<Duration>,
    mapped: ArcSwapOption<Mmap>,
    quit: AtomicBool,
}

impl ReplayGraph {
    /// `framerate` of 0 delivers frames back to back
    pub fn new(path: impl AsRef<Path>, geometry: FrameGeometry, format: WireFormat, framerate: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            frame_len: geometry.wire_len(format),
            format,
            interval: (framerate > 0).then(|| Duration::from_secs(1) / framerate),
            mapped: ArcSwapOption::empty(),
            quit: AtomicBool::new(false),
        }
    }

    /// Replay the file at the configured endpoint
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(
            &config.endpoint,
            config.geometry(),
            config.wire_format,
            config.framerate,
        )
    }

    /// Sleep until `deadline` unless asked to quit first
    fn pace(&self, deadline: Instant) -> bool {
        loop {
            if self.quit.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(PACING_STEP));
        }
    }
}

impl MediaGraph for ReplayGraph {
    fn play(&self) -> Result<(), GraphError> {
        let file = File::open(&self.path)?;
        if file.metadata()?.len() == 0 {
            return Err(GraphError::Build(format!(
                "replay file {} is empty",
                self.path.display()
            )));
        }
        // SAFETY: the mapping is only read. Like the shared-memory feed it
        // stands in for, the file is owned by its producer and must not be
        // truncated while we play it.
        let map = unsafe { Mmap::map(&file)? };
        info!(
            "Replaying {} ({} bytes, {} per frame)",
            self.path.display(),
            map.len(),
            self.frame_len
        );
        self.quit.store(false, Ordering::Release);
        self.mapped.store(Some(Arc::new(map)));
        Ok(())
    }

    fn run(&self, ctx: Arc<IngestContext>) {
        let Some(map) = self.mapped.load_full() else {
            debug!("Replay graph has nothing mapped, event loop exiting");
            return;
        };
        let step = if self.frame_len == 0 { map.len() } else { self.frame_len };

        let mut deadline = Instant::now();
        for bytes in map.chunks(step) {
            if !self.pace(deadline) {
                debug!("Replay interrupted");
                return;
            }
            let frame = MappedFrame {
                bytes,
                format: self.format,
            };
            let _ = ctx.push_buffer(Some(&frame), Instant::now());
            if let Some(interval) = self.interval {
                deadline += interval;
            }
        }

        ctx.push_diagnostic(&BusMessage::EndOfStream, Instant::now());
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    fn halt(&self) -> Result<(), GraphError> {
        self.mapped.store(None);
        Ok(())
    }
}
