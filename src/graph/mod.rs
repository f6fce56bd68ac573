//! The contract between the ingestion core and the external media graph

use std::sync::Arc;

use crate::error::GraphError;
use crate::pipeline::IngestContext;

pub mod channel;
pub mod replay;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;

pub use channel::{ChannelGraph, GraphEvent, GraphFeed, OwnedBuffer};
pub use replay::ReplayGraph;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst::GstGraph;

/// A running source of buffers and bus messages.
///
/// `run` is called once, on a dedicated thread, and must deliver callbacks
/// sequentially through the context until `quit` is called or the context
/// asks it to stop. `play` and `halt` are called from the owner's thread.
pub trait MediaGraph: Send + Sync + 'static {
    /// Bring the graph to its running state
    fn play(&self) -> Result<(), GraphError>;

    /// Event loop: push every buffer and bus message into `ctx`
    fn run(&self, ctx: Arc<IngestContext>);

    /// Ask a running `run` to return
    fn quit(&self);

    /// Bring the graph back to its idle state
    fn halt(&self) -> Result<(), GraphError>;
}
