//! Heartbeat liveness task.
//!
//! One task per connection. The zipper side also emits a heartbeat every
//! interval; both sides renew the deadline whenever a heartbeat arrives and
//! close the connection when the deadline passes.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{Connection, LifecycleEvent};
use crate::frame::{Frame, FrameType};

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the zipper sends a heartbeat.
    pub interval: Duration,
    /// How long without a heartbeat before the peer is considered gone.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), timeout: Duration::from_secs(5) }
    }
}

/// Handle to a running liveness task.
pub struct Heartbeat {
    renewed: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the liveness task for `conn`.
    ///
    /// With `emit` set the task also sends a heartbeat frame every interval.
    /// The task ends when the connection is cancelled or the deadline passes.
    pub fn spawn(conn: Arc<Connection>, config: HeartbeatConfig, emit: bool) -> Self {
        let renewed = Arc::new(Notify::new());
        let handle = tokio::spawn(run(conn, config, emit, Arc::clone(&renewed)));
        Self { renewed, handle }
    }

    /// Push the deadline one timeout into the future.
    pub fn renew(&self) {
        self.renewed.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(conn: Arc<Connection>, config: HeartbeatConfig, emit: bool, renewed: Arc<Notify>) {
    let cancel = conn.cancel_token().clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!(connection = conn.id(), "Heartbeat task cancelled");
                break;
            }
            _ = renewed.notified() => {
                deadline.as_mut().reset(Instant::now() + config.timeout);
            }
            _ = ticker.tick(), if emit => {
                let beat = Frame::new(FrameType::Heartbeat, Bytes::new());
                match tokio::time::timeout(config.interval, conn.send_control(beat)).await {
                    Ok(Ok(())) => trace!(connection = conn.id(), "Heartbeat sent"),
                    Ok(Err(e)) => debug!(connection = conn.id(), error = %e, "Failed to send heartbeat"),
                    Err(_) => debug!(connection = conn.id(), "Heartbeat send stalled"),
                }
            }
            _ = &mut deadline => {
                warn!(
                    connection = conn.id(),
                    name = %conn.name(),
                    peer = %conn.remote_addr(),
                    timeout = ?config.timeout,
                    "Heartbeat expired"
                );
                conn.emit(LifecycleEvent::HeartbeatExpired { connection_id: conn.id() });
                conn.close("heartbeat expired");
                break;
            }
        }
    }
}
