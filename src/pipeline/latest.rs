//! Single-slot store for the most recent decoded frame

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::DecodedFrame;

/// Holds at most one frame. Publishing swaps the handle atomically, so a
/// reader sees either the previous frame or the new one, never a mix.
pub struct LatestFrame {
    slot: ArcSwapOption<DecodedFrame>,
    published: CachePadded<AtomicU64>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            published: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Producer: replace the current frame
    pub fn publish(&self, frame: DecodedFrame) {
        self.slot.store(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Consumer: share the current frame without taking it
    pub fn load(&self) -> Option<Arc<DecodedFrame>> {
        self.slot.load_full()
    }

    /// Number of frames published so far
    pub fn generation(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}
