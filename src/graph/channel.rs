//! In-process graph fed through a channel

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::capture::{InboundBuffer, WireFormat};
use crate::error::{GraphError, MapError};
use crate::graph::MediaGraph;
use crate::pipeline::{BusMessage, IngestContext, LoopControl};

/// How often the event loop re-checks its quit flag while idle
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A buffer owned by the feed side of the channel
#[derive(Debug, Clone)]
pub struct OwnedBuffer {
    data: Bytes,
    format: Option<WireFormat>,
    mappable: bool,
}

impl OwnedBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            format: None,
            mappable: true,
        }
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// A buffer whose mapping always fails
    pub fn unmappable(data: impl Into<Bytes>) -> Self {
        Self {
            mappable: false,
            ..Self::new(data)
        }
    }
}

impl InboundBuffer for OwnedBuffer {
    type Map<'a> = &'a [u8];

    fn map_readable(&self) -> Result<&[u8], MapError> {
        if self.mappable {
            Ok(&self.data)
        } else {
            Err(MapError)
        }
    }

    fn format(&self) -> Option<WireFormat> {
        self.format
    }
}

/// One item delivered to the event loop
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// `None` models a sample that carried no buffer
    Buffer(Option<OwnedBuffer>),
    Message(BusMessage),
}

/// Producer handle of a [`ChannelGraph`]
#[derive(Clone)]
pub struct GraphFeed {
    tx: Sender<GraphEvent>,
}

impl GraphFeed {
    /// Queue a buffer. Like a leaky appsink, returns false and drops the
    /// buffer when the queue is full or the graph is gone.
    pub fn push_buffer(&self, buffer: OwnedBuffer) -> bool {
        self.tx.try_send(GraphEvent::Buffer(Some(buffer))).is_ok()
    }

    pub fn push_null(&self) -> bool {
        self.tx.try_send(GraphEvent::Buffer(None)).is_ok()
    }

    pub fn post(&self, message: BusMessage) -> bool {
        self.tx.try_send(GraphEvent::Message(message)).is_ok()
    }
}

/// Media graph whose buffers and messages come from a [`GraphFeed`].
/// Dropping every feed ends the stream.
pub struct ChannelGraph {
    rx: Receiver<GraphEvent>,
    quit: AtomicBool,
    playing: AtomicBool,
    refuse_play: bool,
}

impl ChannelGraph {
    pub fn new(capacity: usize) -> (Self, GraphFeed) {
        let (tx, rx) = flume::bounded(capacity);
        let graph = Self {
            rx,
            quit: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            refuse_play: false,
        };
        (graph, GraphFeed { tx })
    }

    /// A graph that can never reach its running state
    pub fn refusing_play(capacity: usize) -> (Self, GraphFeed) {
        let (mut graph, feed) = Self::new(capacity);
        graph.refuse_play = true;
        (graph, feed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

impl MediaGraph for ChannelGraph {
    fn play(&self) -> Result<(), GraphError> {
        if self.refuse_play {
            return Err(GraphError::StateChange {
                target: "playing",
                reason: "graph refused to play".into(),
            });
        }
        self.quit.store(false, Ordering::Release);
        self.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn run(&self, ctx: Arc<IngestContext>) {
        debug!("Channel event loop starting");
        while !self.quit.load(Ordering::Acquire) {
            let event = match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    ctx.push_diagnostic(&BusMessage::EndOfStream, Instant::now());
                    break;
                }
            };

            match event {
                GraphEvent::Buffer(buffer) => {
                    let _ = ctx.push_buffer(buffer.as_ref(), Instant::now());
                }
                GraphEvent::Message(message) => {
                    if ctx.push_diagnostic(&message, Instant::now()) == LoopControl::Quit {
                        break;
                    }
                }
            }
        }
        debug!("Channel event loop exited");
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    fn halt(&self) -> Result<(), GraphError> {
        self.playing.store(false, Ordering::Release);
        Ok(())
    }
}
