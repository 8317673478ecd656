//! The dispatcher pipeline.
//!
//! Data read from sources enters a bounded ingress channel and passes through
//! one stage per workflow function, in workflow order. Each stage hands a
//! frame to one replica of its function and feeds the replica's results into
//! the next stage. Frames the replica does not observe, or that it cannot
//! take right away, pass through unchanged. After the last stage every frame is
//! broadcast to the downstreams, the data hook, and back to its source.
//!
//! ```text
//! ingress -> [stage f1] -> [stage f2] -> ... -> broadcast -> connectors
//!                                                         -> other zippers
//!            relay -----------------------------^         -> hook
//!                                                         -> source (backflow)
//! ```
//!
//! Frames relayed by another zipper skip the stages and are only delivered
//! to local output connectors and the hook.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::registry::{Downstream, DownstreamKind, Registry};
use crate::connection::Connection;
use crate::frame::{DataFrame, Frame, FrameReader, FrameType, TypedFrame};
use crate::router::Router;

/// Callback invoked with every frame that leaves the pipeline.
pub type DataHook = Arc<dyn Fn(&DataFrame) + Send + Sync>;

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Capacity of the ingress channel, of every stage channel and of each
    /// peer's outbound queue.
    pub channel_capacity: usize,
    /// Delivery attempts per downstream and frame.
    pub delivery_attempts: u32,
    /// Pause between delivery attempts.
    pub delivery_backoff: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { channel_capacity: 100, delivery_attempts: 3, delivery_backoff: Duration::from_millis(200) }
    }
}

/// Handles to a running pipeline.
pub struct DispatchChannels {
    /// Data from sources and upstream zippers.
    pub ingress: mpsc::Sender<Frame>,
    /// Data relayed by another zipper; bypasses the stages.
    pub relay: mpsc::Sender<Frame>,
    /// Stops every pipeline task.
    pub cancel: CancellationToken,
}

/// Spawns the pipeline tasks.
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn one task per workflow stage plus the broadcast task.
    pub fn spawn(
        router: &Router,
        registry: Arc<Registry>,
        options: DispatchOptions,
        hook: Option<DataHook>,
        cancel: CancellationToken,
    ) -> DispatchChannels {
        let capacity = options.channel_capacity.max(1);
        let (ingress, mut input) = mpsc::channel(capacity);
        let (relay, relay_rx) = mpsc::channel(capacity);

        for app in router.functions() {
            let (output, next) = mpsc::channel(capacity);
            tokio::spawn(pipe_stream_fn(
                app.name.clone(),
                input,
                output,
                Arc::clone(&registry),
                cancel.clone(),
            ));
            input = next;
        }
        tokio::spawn(broadcast(input, relay_rx, registry, options, hook, cancel.clone()));

        info!(stages = router.len(), capacity, "Dispatcher started");
        DispatchChannels { ingress, relay, cancel }
    }
}

/// Forward data frames read from a source's data stream into the pipeline.
///
/// A malformed frame closes the connection. Ends with the stream.
pub async fn read_data_from_source(conn: Arc<Connection>, mut reader: FrameReader, ingress: mpsc::Sender<Frame>) {
    let cancel = conn.cancel_token().clone();
    let mut frames = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.frame_type() == FrameType::Payload => {
                frames += 1;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = ingress.send(frame) => {
                        if sent.is_err() {
                            debug!(connection = conn.id(), "Pipeline closed, stopping source reader");
                            break;
                        }
                    }
                }
            }
            Some(Ok(frame)) => {
                debug!(connection = conn.id(), frame_type = %frame.frame_type(), "Ignoring frame on data stream");
            }
            Some(Err(e)) => {
                warn!(
                    connection = conn.id(),
                    name = %conn.name(),
                    peer = %conn.remote_addr(),
                    error = %e,
                    "Malformed data frame"
                );
                conn.close("protocol error");
                break;
            }
            None => break,
        }
    }
    debug!(connection = conn.id(), frames, "Source reader ended");
}

/// One pipeline stage: route every frame to a replica of `function`.
pub async fn pipe_stream_fn(
    function: String,
    mut input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<Frame>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    debug!(function = %function, "Stage started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = input.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let tag = match DataFrame::peek_tag(&frame) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(function = %function, error = %e, "Dropping unreadable frame");
                continue;
            }
        };
        let Some(replica) = registry.select_replica(&function) else {
            warn!(function = %function, tag, "No replica connected, dropping frame");
            continue;
        };

        let forward = if !replica.observes(tag) {
            trace!(function = %function, replica = replica.id(), tag, "Tag not observed, passing through");
            Some(frame)
        } else {
            match replica.dispatch(frame.clone(), &output).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        function = %function,
                        replica = replica.id(),
                        tag,
                        error = %e,
                        "Dispatch failed, passing frame through"
                    );
                    registry.remove_replica(&function, replica.id());
                    replica.cancel("dispatch failed");
                    Some(frame)
                }
            }
        };
        if let Some(frame) = forward {
            if output.send(frame).await.is_err() {
                break;
            }
        }
    }
    debug!(function = %function, "Stage ended");
}

/// Final stage: deliver every frame to downstreams, the hook, and its source.
async fn broadcast(
    mut pipeline: mpsc::Receiver<Frame>,
    mut relay: mpsc::Receiver<Frame>,
    registry: Arc<Registry>,
    options: DispatchOptions,
    hook: Option<DataHook>,
    cancel: CancellationToken,
) {
    loop {
        let (frame, relayed) = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frame) = pipeline.recv() => (frame, false),
            Some(frame) = relay.recv() => (frame, true),
            else => break,
        };
        let data = match DataFrame::from_frame(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Dropping unreadable frame at broadcast");
                continue;
            }
        };
        if let Some(hook) = &hook {
            hook(&data);
        }

        for target in registry.downstreams() {
            if relayed && target.kind() == DownstreamKind::Zipper {
                continue;
            }
            tokio::spawn(deliver_with_retry(
                target,
                frame.clone(),
                options.delivery_attempts,
                options.delivery_backoff,
            ));
        }

        if !relayed {
            if let Some(source) = registry.source(&data.source_id) {
                let frame = frame.clone();
                tokio::spawn(async move {
                    if let Err(e) = source.backflow(frame).await {
                        debug!(connection = source.connection().id(), error = %e, "Backflow failed");
                    }
                });
            }
        }
    }
    debug!("Broadcast ended");
}

/// Deliver `frame` to `target`, retrying a bounded number of times.
pub(crate) async fn deliver_with_retry(
    target: Arc<dyn Downstream>,
    frame: Frame,
    attempts: u32,
    backoff: Duration,
) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match target.deliver(frame.clone()).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(downstream = target.name(), attempt, attempts, error = %e, "Delivery failed");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    warn!(downstream = target.name(), attempts, "Giving up on delivery");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{connection_pair, info};
    use crate::connection::{ConnectionInfo, Role};
    use crate::frame::Tag;
    use crate::router::App;
    use crate::server::ServerPeer;
    use crate::server::registry::Replica;
    use crate::server::registry::tests::FakeReplica;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn data(tag: Tag, body: &'static [u8]) -> Frame {
        DataFrame::new("tx", "src-1", tag, body).to_frame().unwrap()
    }

    fn recorder() -> (DataHook, Arc<Mutex<Vec<DataFrame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: DataHook = Arc::new(move |data: &DataFrame| sink.lock().unwrap().push(data.clone()));
        (hook, seen)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn upper(frame: &Frame) -> Frame {
        let data = DataFrame::from_frame(frame).unwrap();
        let body = data.carriage.to_ascii_uppercase();
        data.respond(0x20, body).to_frame().unwrap()
    }

    #[tokio::test]
    async fn empty_workflow_broadcasts_input_unchanged() {
        let registry = Arc::new(Registry::new());
        let (hook, seen) = recorder();
        let channels = Dispatcher::spawn(
            &Router::new(Vec::new()),
            registry,
            DispatchOptions::default(),
            Some(hook),
            CancellationToken::new(),
        );
        channels.ingress.send(data(1, b"raw")).await.unwrap();
        settle().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].carriage[..], b"raw");
        channels.cancel.cancel();
    }

    #[tokio::test]
    async fn replica_results_feed_the_next_stage() {
        let registry = Arc::new(Registry::new());
        let mut first = FakeReplica::new(1);
        first.reply = Some(upper);
        let second = Arc::new(FakeReplica::new(2));
        registry.add_replica("upper", Arc::new(first));
        registry.add_replica("count", Arc::clone(&second) as Arc<dyn Replica>);

        let router = Router::new(["upper", "count"].map(App::new));
        let (hook, seen) = recorder();
        let channels =
            Dispatcher::spawn(&router, registry, DispatchOptions::default(), Some(hook), CancellationToken::new());
        channels.ingress.send(data(0x10, b"ping")).await.unwrap();
        settle().await;

        let received = second.seen.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        let upper = DataFrame::from_frame(&received[0]).unwrap();
        assert_eq!(&upper.carriage[..], b"PING");
        // The last stage swallowed the frame, so nothing was broadcast.
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unobserved_tags_pass_through() {
        let registry = Arc::new(Registry::new());
        let mut picky = FakeReplica::new(1);
        picky.tags = vec![0x10];
        let picky = Arc::new(picky);
        registry.add_replica("picky", Arc::clone(&picky) as Arc<dyn Replica>);

        let (hook, seen) = recorder();
        let channels = Dispatcher::spawn(
            &Router::new([App::new("picky")]),
            registry,
            DispatchOptions::default(),
            Some(hook),
            CancellationToken::new(),
        );
        channels.ingress.send(data(0x11, b"other")).await.unwrap();
        settle().await;

        assert_eq!(picky.seen(), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_passes_through_and_drops_the_replica() {
        let registry = Arc::new(Registry::new());
        let mut broken = FakeReplica::new(7);
        broken.fail = true;
        let broken = Arc::new(broken);
        registry.add_replica("echo", Arc::clone(&broken) as Arc<dyn Replica>);

        let connector = Arc::new(FlakyDownstream::new(DownstreamKind::Connector, 0));
        registry.add_downstream("connector", connector.clone());

        let (hook, seen) = recorder();
        let channels = Dispatcher::spawn(
            &Router::new([App::new("echo")]),
            Arc::clone(&registry),
            DispatchOptions::default(),
            Some(hook),
            CancellationToken::new(),
        );
        let input = data(0x10, b"x");
        channels.ingress.send(input.clone()).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(connector.delivered.lock().unwrap().as_slice(), [input]);
        assert_eq!(registry.replica_count("echo"), 0);
        assert_eq!(broken.cancelled.lock().unwrap().as_deref(), Some("dispatch failed"));
    }

    #[tokio::test]
    async fn frames_without_a_replica_are_dropped() {
        let (hook, seen) = recorder();
        let channels = Dispatcher::spawn(
            &Router::new([App::new("echo")]),
            Arc::new(Registry::new()),
            DispatchOptions::default(),
            Some(hook),
            CancellationToken::new(),
        );
        channels.ingress.send(data(0x10, b"x")).await.unwrap();
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    struct FlakyDownstream {
        kind: DownstreamKind,
        failures: AtomicU32,
        delivered: Mutex<Vec<Frame>>,
    }

    impl FlakyDownstream {
        fn new(kind: DownstreamKind, failures: u32) -> Self {
            Self { kind, failures: AtomicU32::new(failures), delivered: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Downstream for FlakyDownstream {
        fn name(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> DownstreamKind {
            self.kind
        }

        async fn deliver(&self, frame: Frame) -> crate::Result<()> {
            let left = self.failures.load(Ordering::Relaxed);
            if left > 0 {
                self.failures.store(left - 1, Ordering::Relaxed);
                return Err(crate::MeshError::Closed);
            }
            self.delivered.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_retries_then_gives_up() {
        let recovers = Arc::new(FlakyDownstream::new(DownstreamKind::Connector, 2));
        assert!(deliver_with_retry(recovers.clone(), data(1, b"a"), 3, Duration::from_millis(200)).await);
        assert_eq!(recovers.delivered.lock().unwrap().len(), 1);

        let broken = Arc::new(FlakyDownstream::new(DownstreamKind::Connector, 5));
        assert!(!deliver_with_retry(broken.clone(), data(1, b"a"), 3, Duration::from_millis(200)).await);
        assert_eq!(broken.failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn relayed_frames_skip_stages_and_other_zippers() {
        let registry = Arc::new(Registry::new());
        let stage = Arc::new(FakeReplica::new(1));
        registry.add_replica("echo", Arc::clone(&stage) as Arc<dyn Replica>);
        let connector = Arc::new(FlakyDownstream::new(DownstreamKind::Connector, 0));
        let zipper = Arc::new(FlakyDownstream::new(DownstreamKind::Zipper, 0));
        registry.add_downstream("connector", connector.clone());
        registry.add_downstream("zipper", zipper.clone());

        let channels = Dispatcher::spawn(
            &Router::new([App::new("echo")]),
            registry,
            DispatchOptions::default(),
            None,
            CancellationToken::new(),
        );
        channels.relay.send(data(0x10, b"from afar")).await.unwrap();
        settle().await;

        assert_eq!(stage.seen(), 0);
        assert_eq!(connector.delivered.lock().unwrap().len(), 1);
        assert!(zipper.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_replica_does_not_stall_the_stage() {
        let stalled = ConnectionInfo { observed_tags: vec![0x10], ..info(31, "slow", Role::StreamFunction) };
        let (conn, remote, _events) = connection_pair(stalled).await;
        let registry = Arc::new(Registry::new());
        registry.add_replica("slow", Arc::new(ServerPeer::new(conn, Duration::from_secs(5), 8)));

        let (hook, seen) = recorder();
        let channels = Dispatcher::spawn(
            &Router::new([App::new("slow")]),
            Arc::clone(&registry),
            DispatchOptions::default(),
            Some(hook),
            CancellationToken::new(),
        );
        channels.ingress.send(data(0x10, b"held")).await.unwrap();
        channels.ingress.send(data(0x11, b"other")).await.unwrap();
        settle().await;

        // The peer never acks its data stream, yet the unobserved frame is out.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].carriage[..], b"other");
        assert_eq!(registry.replica_count("slow"), 1);
        drop(remote);
    }
}
