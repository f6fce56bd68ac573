use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shm_ingest::graph::{ChannelGraph, GraphFeed, OwnedBuffer};
use shm_ingest::pipeline::Diagnostic;
use shm_ingest::utils::EndpointWait;
use shm_ingest::{
    BusMessage, Config, GraphError, IngestContext, LifecycleState, MediaGraph, Receiver,
    ReceiverError,
};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;
const WIRE_LEN: usize = (WIDTH * HEIGHT * 4) as usize;

fn test_config(endpoint: PathBuf) -> Config {
    let mut config = Config::default();
    config.receiver.endpoint = endpoint;
    config.receiver.width = WIDTH;
    config.receiver.height = HEIGHT;
    config.receiver.endpoint_wait_attempts = 3;
    config.receiver.endpoint_wait_backoff_ms = 10;
    config.stats.report_interval_ms = 50;
    config
}

fn channel_receiver() -> (Receiver<ChannelGraph>, GraphFeed) {
    let (graph, feed) = ChannelGraph::new(64);
    (Receiver::new(&test_config(std::env::temp_dir()), graph), feed)
}

fn frame(fill: u8) -> OwnedBuffer {
    OwnedBuffer::new(vec![fill; WIRE_LEN])
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn unique_path(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "shm_ingest_{label}_{}_{}",
        std::process::id(),
        nanos
    ))
}

#[test]
fn start_and_stop_walk_the_lifecycle() {
    let (receiver, _feed) = channel_receiver();
    assert_eq!(receiver.state(), LifecycleState::Created);
    assert!(receiver.frame().is_none());
    assert_eq!(receiver.stats().uptime, Duration::ZERO);

    receiver.start().unwrap();
    assert_eq!(receiver.state(), LifecycleState::Running);
    assert!(receiver.graph().is_playing());

    receiver.stop();
    assert_eq!(receiver.state(), LifecycleState::Stopped);
    assert!(!receiver.graph().is_playing());
}

#[test]
fn valid_undersized_valid_yields_two_frames_and_one_drop() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();

    assert!(feed.push_buffer(frame(1)));
    assert!(feed.push_buffer(OwnedBuffer::new(vec![2; WIRE_LEN - 1])));
    assert!(feed.push_buffer(frame(3)));

    assert!(wait_until(Duration::from_secs(2), || {
        let stats = receiver.stats();
        stats.successful_frames + stats.dropped_frames == 3
    }));

    let stats = receiver.stats();
    assert_eq!(stats.successful_frames, 2);
    assert_eq!(stats.dropped_frames, 1);

    let latest = receiver.frame().unwrap();
    assert_eq!(latest.len(), (WIDTH * HEIGHT * 3) as usize);
    assert!(latest.data.iter().all(|&b| b == 3));

    receiver.stop();
}

#[test]
fn null_and_unmappable_buffers_are_counted_separately() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();

    assert!(feed.push_null());
    assert!(feed.push_buffer(OwnedBuffer::unmappable(vec![0; WIRE_LEN])));
    assert!(feed.push_buffer(frame(5)));

    assert!(wait_until(Duration::from_secs(2), || receiver.stats().successful_frames == 1));

    let stats = receiver.stats();
    assert_eq!(stats.null_buffers, 1);
    assert_eq!(stats.mapping_errors, 1);
    assert_eq!(stats.dropped_frames, 0);
    receiver.stop();
}

#[test]
fn stop_twice_is_harmless() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();
    feed.push_buffer(frame(7));
    assert!(wait_until(Duration::from_secs(2), || receiver.frame().is_some()));

    receiver.stop();
    let first = receiver.stats();
    receiver.stop();
    let second = receiver.stats();

    assert_eq!(receiver.state(), LifecycleState::Stopped);
    assert_eq!(first.successful_frames, second.successful_frames);
    assert_eq!(second.successful_frames, 1);
    assert!(receiver.frame().is_some());
}

#[test]
fn start_requires_a_fresh_receiver() {
    let (receiver, _feed) = channel_receiver();
    receiver.start().unwrap();

    match receiver.start() {
        Err(ReceiverError::InvalidState(state)) => assert_eq!(state, LifecycleState::Running),
        other => panic!("expected InvalidState, got {:?}", other),
    }
    receiver.stop();
}

#[test]
fn graph_that_cannot_play_fails_start() {
    let (graph, _feed) = ChannelGraph::refusing_play(8);
    let receiver = Receiver::new(&test_config(std::env::temp_dir()), graph);

    let err = receiver.start().unwrap_err();
    assert!(matches!(err, ReceiverError::PipelineStartFailed(_)));
    assert_eq!(receiver.state(), LifecycleState::Failed);

    receiver.stop();
    assert_eq!(receiver.state(), LifecycleState::Failed);
}

#[test]
fn bus_error_fails_the_running_pipeline() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();

    feed.post(BusMessage::Error(Diagnostic::new("shmsrc: socket closed")));

    assert!(wait_until(Duration::from_secs(2), || {
        receiver.state() == LifecycleState::Failed
    }));
    assert!(!receiver.context().is_running());
    assert_eq!(receiver.stats().bus_errors, 1);
    assert_eq!(receiver.stats().state, LifecycleState::Failed);

    // The event loop has ended, so later buffers are never processed.
    feed.push_buffer(frame(1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(receiver.stats().successful_frames, 0);

    receiver.stop();
    assert_eq!(receiver.state(), LifecycleState::Failed);
}

#[test]
fn warnings_do_not_change_state() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();

    feed.post(BusMessage::Warning(Diagnostic::new("late buffer")));
    feed.post(BusMessage::Warning(Diagnostic::new("late buffer")));

    assert!(wait_until(Duration::from_secs(2), || receiver.stats().bus_warnings == 2));
    assert_eq!(receiver.state(), LifecycleState::Running);
    receiver.stop();
}

#[test]
fn end_of_stream_moves_to_stopping_then_stopped() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();

    feed.post(BusMessage::EndOfStream);
    assert!(wait_until(Duration::from_secs(2), || {
        receiver.state() == LifecycleState::Stopping
    }));

    receiver.stop();
    assert_eq!(receiver.state(), LifecycleState::Stopped);
}

#[test]
fn dropping_the_feed_ends_the_stream() {
    let (receiver, feed) = channel_receiver();
    receiver.start().unwrap();
    drop(feed);

    assert!(wait_until(Duration::from_secs(2), || {
        receiver.state() == LifecycleState::Stopping
    }));
    receiver.stop();
}

/// Event loop that ignores quit requests for a while
struct StubbornGraph {
    released: AtomicBool,
}

impl MediaGraph for StubbornGraph {
    fn play(&self) -> Result<(), GraphError> {
        Ok(())
    }

    fn run(&self, _ctx: Arc<IngestContext>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && !self.released.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn quit(&self) {}

    fn halt(&self) -> Result<(), GraphError> {
        Ok(())
    }
}

#[test]
fn stop_returns_even_if_event_loop_never_finishes() {
    let graph = StubbornGraph {
        released: AtomicBool::new(false),
    };
    let receiver = Receiver::new(&test_config(std::env::temp_dir()), graph);
    receiver.start().unwrap();

    let began = Instant::now();
    receiver.stop();
    let elapsed = began.elapsed();

    assert_eq!(receiver.state(), LifecycleState::Stopped);
    assert!(elapsed >= Duration::from_millis(450), "stop took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "stop took {:?}", elapsed);

    receiver.graph().released.store(true, Ordering::Release);
}

#[test]
fn missing_endpoint_does_not_block_ingestion() {
    let endpoint = unique_path("late_endpoint");
    let (graph, feed) = ChannelGraph::new(16);
    let receiver = Receiver::new(&test_config(endpoint.clone()), graph);

    let began = Instant::now();
    receiver.start().unwrap();
    assert!(began.elapsed() >= Duration::from_millis(30));
    assert_eq!(receiver.state(), LifecycleState::Running);
    assert_eq!(receiver.endpoint_wait(), Some(EndpointWait::Missing));
    assert!(!receiver.context().report(Instant::now()).endpoint_present);

    std::fs::write(&endpoint, b"").unwrap();
    feed.push_buffer(frame(4));
    assert!(wait_until(Duration::from_secs(2), || receiver.frame().is_some()));
    assert!(receiver.context().report(Instant::now()).endpoint_present);

    receiver.stop();
    std::fs::remove_file(&endpoint).ok();
}

#[test]
fn existing_endpoint_is_found_without_waiting() {
    let (receiver, _feed) = channel_receiver();
    receiver.start().unwrap();
    assert_eq!(receiver.endpoint_wait(), Some(EndpointWait::Present));
    receiver.stop();
}

#[test]
fn stop_during_endpoint_wait_returns_promptly_and_abandons_start() {
    let endpoint = unique_path("never_appears");
    let mut config = test_config(endpoint);
    config.receiver.endpoint_wait_attempts = 10;
    config.receiver.endpoint_wait_backoff_ms = 200;
    let (graph, _feed) = ChannelGraph::new(16);
    let receiver = Arc::new(Receiver::new(&config, graph));

    let starter = {
        let receiver = receiver.clone();
        std::thread::spawn(move || receiver.start())
    };
    assert!(wait_until(Duration::from_secs(1), || {
        receiver.state() == LifecycleState::Starting
    }));
    std::thread::sleep(Duration::from_millis(100));

    let began = Instant::now();
    receiver.stop();
    assert!(began.elapsed() < Duration::from_millis(500));

    let started = starter.join().unwrap();
    assert!(matches!(started, Err(ReceiverError::Interrupted)));
    assert_eq!(receiver.endpoint_wait(), Some(EndpointWait::Cancelled));
    assert_eq!(receiver.state(), LifecycleState::Stopped);
    assert!(!receiver.graph().is_playing());
    assert!(!receiver.context().is_running());
}

#[test]
fn latest_frame_is_readable_from_another_thread_while_running() {
    let (receiver, feed) = channel_receiver();
    let receiver = Arc::new(receiver);
    receiver.start().unwrap();

    let reader = {
        let receiver = receiver.clone();
        std::thread::spawn(move || {
            let mut seen = 0;
            let deadline = Instant::now() + Duration::from_secs(2);
            while seen < 20 && Instant::now() < deadline {
                if let Some(frame) = receiver.frame() {
                    let first = frame.data[0];
                    assert!(frame.data.iter().all(|&b| b == first));
                    seen = frame.meta.sequence;
                }
            }
            seen
        })
    };

    for i in 1..=20u8 {
        while !feed.push_buffer(frame(i)) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    assert_eq!(reader.join().unwrap(), 20);
    receiver.stop();
}
