//! Live shared-memory graph: shmsrc ! caps ! videoconvert ! appsink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{error, info};

use crate::capture::{InboundBuffer, WireFormat};
use crate::error::{GraphError, MapError};
use crate::graph::MediaGraph;
use crate::pipeline::{BusMessage, Diagnostic, GraphState, IngestContext, LoopControl};
use crate::{Config, GStreamerConfig, ReceiverConfig};

/// How often the main loop re-checks for a quit that raced its startup
const QUIT_POLL: Duration = Duration::from_millis(100);

/// A buffer lent by appsink for one callback
struct GstInbound<'a> {
    buffer: &'a gst::BufferRef,
    format: Option<WireFormat>,
}

impl InboundBuffer for GstInbound<'_> {
    type Map<'b> = gst::BufferMap<'b, gst::buffer::Readable> where Self: 'b;

    fn map_readable(&self) -> Result<Self::Map<'_>, MapError> {
        self.buffer.map_readable().map_err(|_| MapError)
    }

    fn format(&self) -> Option<WireFormat> {
        self.format
    }
}

impl From<gst::State> for GraphState {
    fn from(state: gst::State) -> Self {
        match state {
            gst::State::Null => Self::Null,
            gst::State::Ready => Self::Ready,
            gst::State::Paused => Self::Paused,
            gst::State::Playing => Self::Playing,
            _ => Self::VoidPending,
        }
    }
}

fn wire_format_from_caps(caps: &gst::CapsRef) -> Option<WireFormat> {
    let info = gst_video::VideoInfo::from_caps(caps).ok()?;
    match info.format() {
        gst_video::VideoFormat::Bgrx => Some(WireFormat::Bgrx),
        gst_video::VideoFormat::Rgbx => Some(WireFormat::Rgbx),
        gst_video::VideoFormat::Bgra => Some(WireFormat::Bgra),
        gst_video::VideoFormat::Rgba => Some(WireFormat::Rgba),
        gst_video::VideoFormat::Bgr => Some(WireFormat::Bgr),
        gst_video::VideoFormat::Rgb => Some(WireFormat::Rgb),
        _ => None,
    }
}

fn diagnostic(
    src: Option<&gst::Object>,
    error: &glib::Error,
    debug: Option<impl ToString>,
) -> Diagnostic {
    Diagnostic {
        source: src.map(|s| s.path_string().to_string()),
        message: error.to_string(),
        debug: debug.map(|d| d.to_string()),
    }
}

/// Map a bus message onto the core's message set; others are ignored
fn classify(msg: &gst::Message, pipeline: &gst::Object) -> Option<BusMessage> {
    use gst::MessageView;

    match msg.view() {
        MessageView::Error(err) => Some(BusMessage::Error(diagnostic(
            err.src(),
            &err.error(),
            err.debug(),
        ))),
        MessageView::Warning(warning) => Some(BusMessage::Warning(diagnostic(
            warning.src(),
            &warning.error(),
            warning.debug(),
        ))),
        MessageView::Info(info) => Some(BusMessage::Info(diagnostic(
            info.src(),
            &info.error(),
            info.debug(),
        ))),
        MessageView::StateChanged(changed) => Some(BusMessage::StateChanged {
            old: changed.old().into(),
            current: changed.current().into(),
            pending: changed.pending().into(),
            from_pipeline: msg.src() == Some(pipeline),
        }),
        MessageView::Eos(..) => Some(BusMessage::EndOfStream),
        _ => None,
    }
}

/// GStreamer graph reading from a `shmsrc` socket
pub struct GstGraph {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    main_context: glib::MainContext,
    main_loop: glib::MainLoop,
    quit: Arc<AtomicBool>,
}

impl GstGraph {
    pub fn new(config: &Config) -> Result<Self, GraphError> {
        gst::init().map_err(|e| GraphError::Build(format!("Failed to initialize GStreamer: {}", e)))?;

        let launch = match &config.gstreamer.custom_pipeline {
            Some(custom) => custom.clone(),
            None => Self::build_pipeline_string(&config.receiver, &config.gstreamer),
        };
        info!("Pipeline: {}", launch);

        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| GraphError::Build(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| GraphError::Build("launch string is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| GraphError::Build("no appsink named 'sink'".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| GraphError::Build("element 'sink' is not an appsink".into()))?;

        appsink.set_property("sync", false);
        appsink.set_max_buffers(config.gstreamer.max_buffers);
        appsink.set_drop(config.gstreamer.drop);

        let main_context = glib::MainContext::new();
        let main_loop = glib::MainLoop::new(Some(&main_context), false);

        Ok(Self {
            pipeline,
            appsink,
            main_context,
            main_loop,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Launch string for the shared-memory feed; videoconvert turns the
    /// source format into the wire format the core expects.
    fn build_pipeline_string(receiver: &ReceiverConfig, gst: &GStreamerConfig) -> String {
        format!(
            "shmsrc socket-path={} is-live=true ! \
             video/x-raw,format={},width={},height={},framerate={}/1 ! \
             videoconvert ! \
             video/x-raw,format={} ! \
             appsink name=sink sync=false max-buffers={} drop={}",
            receiver.endpoint.display(),
            receiver.source_format,
            receiver.width,
            receiver.height,
            receiver.framerate,
            receiver.wire_format.caps_name(),
            gst.max_buffers,
            gst.drop
        )
    }

    fn install_sample_callback(&self, ctx: Arc<IngestContext>) {
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let now = Instant::now();
                    let Ok(sample) = sink.pull_sample() else {
                        let _ = ctx.push_buffer(None::<&GstInbound<'_>>, now);
                        return Ok(gst::FlowSuccess::Ok);
                    };

                    let format = sample.caps().and_then(wire_format_from_caps);
                    let inbound = sample.buffer().map(|buffer| GstInbound { buffer, format });
                    let _ = ctx.push_buffer(inbound.as_ref(), now);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }
}

impl MediaGraph for GstGraph {
    fn play(&self) -> Result<(), GraphError> {
        self.quit.store(false, Ordering::Release);
        let result = self
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GraphError::StateChange {
                target: "playing",
                reason: format!("{:?}", e),
            })?;
        info!("Pipeline state change result: {:?}", result);
        Ok(())
    }

    fn run(&self, ctx: Arc<IngestContext>) {
        let Some(bus) = self.pipeline.bus() else {
            error!("Pipeline has no bus");
            return;
        };

        self.install_sample_callback(ctx.clone());

        let main_loop = self.main_loop.clone();
        let pipeline = self.pipeline.clone().upcast::<gst::Object>();
        let entered = self.main_context.with_thread_default(|| {
            let watch = bus.add_watch(move |_, msg| {
                if let Some(message) = classify(msg, &pipeline) {
                    if ctx.push_diagnostic(&message, Instant::now()) == LoopControl::Quit {
                        main_loop.quit();
                    }
                }
                glib::ControlFlow::Continue
            });

            let _guard = match watch {
                Ok(guard) => guard,
                Err(err) => {
                    error!("Failed to watch pipeline bus: {}", err);
                    return;
                }
            };

            // MainLoop::quit before run() is lost, so the flag is polled too.
            let quit = self.quit.clone();
            let poll_loop = self.main_loop.clone();
            let poll = glib::timeout_source_new(
                QUIT_POLL,
                None,
                glib::Priority::DEFAULT,
                move || {
                    if quit.load(Ordering::Acquire) {
                        poll_loop.quit();
                        glib::ControlFlow::Break
                    } else {
                        glib::ControlFlow::Continue
                    }
                },
            );
            poll.attach(Some(&self.main_context));

            if !self.quit.load(Ordering::Acquire) {
                self.main_loop.run();
            }
            poll.destroy();
        });
        if let Err(err) = entered {
            error!("Failed to acquire main context: {}", err);
        }

        self.appsink
            .set_callbacks(gst_app::AppSinkCallbacks::builder().build());
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.main_loop.quit();
    }

    fn halt(&self) -> Result<(), GraphError> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| GraphError::StateChange {
                target: "null",
                reason: format!("{:?}", e),
            })?;
        Ok(())
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        let _ = self.halt();
    }
}
