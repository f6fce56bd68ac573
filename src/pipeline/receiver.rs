//! Owns start/stop and the two background threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use flume::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::capture::DecodedFrame;
use crate::error::ReceiverError;
use crate::graph::MediaGraph;
use crate::pipeline::context::IngestContext;
use crate::pipeline::dispatch::LifecycleState;
use crate::pipeline::stats::StatsSnapshot;
use crate::utils::{self, EndpointWait};
use crate::{Config, ReceiverConfig};

/// A background thread whose completion can be awaited with a timeout
struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    // Disconnects when the thread exits, including by panic.
    done: flume::Receiver<()>,
}

impl Worker {
    fn spawn<F>(name: &'static str, body: F) -> Result<Self, ReceiverError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = flume::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _done = done_tx;
                body();
            })
            .map_err(|source| ReceiverError::Spawn { name, source })?;
        Ok(Self { name, handle, done })
    }

    /// Join, giving up after `timeout`. A thread that does not finish in
    /// time is left detached.
    fn join(self, timeout: Duration) {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} thread join timed out after {:?}", self.name, timeout);
            }
            _ => match self.handle.join() {
                Ok(()) => debug!("{} thread joined", self.name),
                Err(_) => error!("{} thread panicked", self.name),
            },
        }
    }
}

struct Workers {
    event_loop: Worker,
    reporter: Worker,
    // Dropping this wakes the reporter out of its sleep.
    stop_reporter: flume::Sender<()>,
}

/// Runs a [`MediaGraph`] and exposes the latest frame and statistics.
///
/// `start` spawns the event loop and the stats reporter; `stop` tears both
/// down and may be called any number of times from any thread.
pub struct Receiver<G: MediaGraph> {
    ctx: Arc<IngestContext>,
    graph: Arc<G>,
    config: ReceiverConfig,
    report_interval: Duration,
    workers: Mutex<Option<Workers>>,
    stopped: AtomicBool,
    endpoint_wait: AtomicCell<Option<EndpointWait>>,
}

impl<G: MediaGraph> Receiver<G> {
    pub fn new(config: &Config, graph: G) -> Self {
        info!(
            "Initializing receiver: endpoint={}, resolution={}x{}, format={}",
            config.receiver.endpoint.display(),
            config.receiver.width,
            config.receiver.height,
            config.receiver.source_format
        );
        Self {
            ctx: Arc::new(IngestContext::new(&config.receiver, &config.stats)),
            graph: Arc::new(graph),
            config: config.receiver.clone(),
            report_interval: config.stats.report_interval(),
            workers: Mutex::new(None),
            stopped: AtomicBool::new(false),
            endpoint_wait: AtomicCell::new(None),
        }
    }

    /// Start ingestion. A concurrent `stop` cuts the endpoint wait short and
    /// makes this return `Interrupted`.
    pub fn start(&self) -> Result<(), ReceiverError> {
        let state = self.ctx.state_cell();
        if !state.transition(&[LifecycleState::Created], LifecycleState::Starting) {
            return Err(ReceiverError::InvalidState(state.get()));
        }

        info!("Starting receiver");
        self.ctx.mark_started(Instant::now());
        self.ctx.set_running(true);

        let waited = utils::wait_for_endpoint(
            &self.config.endpoint,
            self.config.endpoint_wait_attempts,
            self.config.endpoint_wait_backoff(),
            || self.stop_requested(),
        );
        self.endpoint_wait.store(Some(waited));
        if waited == EndpointWait::Cancelled || self.stop_requested() {
            info!("Stop requested while waiting for endpoint, start abandoned");
            self.ctx.set_running(false);
            return Err(ReceiverError::Interrupted);
        }

        if let Err(err) = self.graph.play() {
            error!("Failed to start pipeline: {}", err);
            self.abort_start();
            return Err(ReceiverError::PipelineStartFailed(err));
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stop_requested() {
            // stop() finds no workers to join; undo the play here.
            info!("Stop requested while starting pipeline, start abandoned");
            self.ctx.set_running(false);
            self.graph.quit();
            if let Err(err) = self.graph.halt() {
                error!("Error stopping pipeline: {}", err);
            }
            return Err(ReceiverError::Interrupted);
        }

        let event_loop = match self.spawn_event_loop() {
            Ok(worker) => worker,
            Err(err) => {
                self.abort_start();
                return Err(err);
            }
        };

        let (stop_reporter, stop_rx) = flume::bounded::<()>(1);
        let reporter = match self.spawn_reporter(stop_rx) {
            Ok(worker) => worker,
            Err(err) => {
                self.abort_start();
                event_loop.join(self.config.join_timeout());
                return Err(err);
            }
        };

        *workers = Some(Workers {
            event_loop,
            reporter,
            stop_reporter,
        });

        if state.transition(&[LifecycleState::Starting], LifecycleState::Running) {
            info!("Receiver running");
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// How the endpoint wait of the last `start` ended
    pub fn endpoint_wait(&self) -> Option<EndpointWait> {
        self.endpoint_wait.load()
    }

    fn abort_start(&self) {
        self.ctx.set_running(false);
        self.ctx.state_cell().fail();
        self.graph.quit();
        if let Err(err) = self.graph.halt() {
            error!("Error stopping pipeline: {}", err);
        }
    }

    fn spawn_event_loop(&self) -> Result<Worker, ReceiverError> {
        let ctx = self.ctx.clone();
        let graph = self.graph.clone();
        let core = self.config.event_loop_core;

        Worker::spawn("event-loop", move || {
            if let Some(id) = core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!("Failed to pin event loop to core {}", id);
                }
            }
            debug!("Event loop starting");
            graph.run(ctx);
            debug!("Event loop exited");
        })
    }

    fn spawn_reporter(&self, stop_rx: flume::Receiver<()>) -> Result<Worker, ReceiverError> {
        let ctx = self.ctx.clone();
        let interval = self.report_interval;

        Worker::spawn("stats-reporter", move || {
            while ctx.is_running() {
                ctx.report(Instant::now()).log(ctx.endpoint());
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
        })
    }

    /// Stop ingestion. Never fails; later calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Receiver already stopped");
            return;
        }
        info!("Stopping receiver");

        self.ctx.set_running(false);
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let state = self.ctx.state_cell();
        state.transition(&[LifecycleState::Running], LifecycleState::Stopping);

        self.graph.quit();
        if let Err(err) = self.graph.halt() {
            error!("Error stopping pipeline: {}", err);
        }

        if let Some(Workers {
            event_loop,
            reporter,
            stop_reporter,
        }) = workers
        {
            drop(stop_reporter);
            let timeout = self.config.join_timeout();
            event_loop.join(timeout);
            reporter.join(timeout);
        }

        state.transition(
            &[
                LifecycleState::Created,
                LifecycleState::Starting,
                LifecycleState::Running,
                LifecycleState::Stopping,
            ],
            LifecycleState::Stopped,
        );

        self.ctx.report(Instant::now()).log(self.ctx.endpoint());
        info!("Receiver stopped");
    }

    /// Most recent decoded frame, if any has arrived
    pub fn frame(&self) -> Option<Arc<DecodedFrame>> {
        self.ctx.frame()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.snapshot()
    }

    pub fn state(&self) -> LifecycleState {
        self.ctx.state()
    }

    pub fn context(&self) -> &Arc<IngestContext> {
        &self.ctx
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }
}

impl<G: MediaGraph> Drop for Receiver<G> {
    fn drop(&mut self) {
        if self.ctx.state() != LifecycleState::Created {
            self.stop();
        }
    }
}
