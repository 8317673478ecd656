//! Live connections of a zipper.
//!
//! The registry indexes every accepted connection three ways: by id, by
//! function name (the replica sets the pipeline stages pick from) and as
//! broadcast downstreams. All maps are concurrent; round-robin selection uses
//! a per-function atomic cursor so stages never contend on a lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::peer::ServerPeer;
use crate::Result;
use crate::connection::Role;
use crate::frame::{Frame, Tag};

/// One live instance of a workflow function.
#[async_trait]
pub trait Replica: Send + Sync + 'static {
    fn id(&self) -> u64;

    /// Whether frames carrying `tag` are meant for this replica.
    fn observes(&self, tag: Tag) -> bool;

    /// Hand `frame` to the replica. Its results are written to `responses`.
    ///
    /// Called from a pipeline stage, so it must not wait on the remote end.
    async fn dispatch(&self, frame: Frame, responses: &mpsc::Sender<Frame>) -> Result<()>;

    /// Tear the replica down after a failed dispatch.
    fn cancel(&self, reason: &str);
}

/// Where fully processed data is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamKind {
    /// An output connector attached to this zipper.
    Connector,
    /// Another zipper of the mesh.
    Zipper,
}

/// A broadcast target.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> DownstreamKind;

    async fn deliver(&self, frame: Frame) -> Result<()>;
}

#[derive(Default)]
struct FunctionEntry {
    replicas: Vec<Arc<dyn Replica>>,
    cursor: AtomicU64,
}

/// Concurrent index of live connections.
#[derive(Default)]
pub struct Registry {
    connections: DashMap<u64, Arc<ServerPeer>>,
    functions: DashMap<String, FunctionEntry>,
    downstreams: DashMap<String, Arc<dyn Downstream>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index an accepted connection according to its role.
    pub fn insert(&self, peer: Arc<ServerPeer>) {
        let conn = peer.connection();
        match conn.role() {
            Role::StreamFunction => {
                self.add_replica(conn.name(), Arc::clone(&peer) as Arc<dyn Replica>);
            }
            Role::OutputConnector => {
                self.add_downstream(connector_key(conn.id()), Arc::clone(&peer) as Arc<dyn Downstream>);
            }
            _ => {}
        }
        self.connections.insert(conn.id(), peer);
    }

    /// Forget connection `id` everywhere. Returns it if it was present.
    pub fn remove(&self, id: u64) -> Option<Arc<ServerPeer>> {
        let (_, peer) = self.connections.remove(&id)?;
        let conn = peer.connection();
        match conn.role() {
            Role::StreamFunction => self.remove_replica(conn.name(), id),
            Role::OutputConnector => {
                self.remove_downstream(&connector_key(id));
            }
            _ => {}
        }
        debug!(connection = id, name = %conn.name(), remaining = self.connections.len(), "Deregistered");
        Some(peer)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ServerPeer>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    /// Whether any connection named `name` is registered.
    pub fn contains_name(&self, name: &str) -> bool {
        self.connections.iter().any(|entry| entry.value().connection().name() == name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> Vec<Arc<ServerPeer>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Add a replica to function `name`.
    pub fn add_replica(&self, name: &str, replica: Arc<dyn Replica>) {
        self.functions.entry(name.to_string()).or_default().replicas.push(replica);
    }

    pub fn remove_replica(&self, name: &str, id: u64) {
        if let Some(mut entry) = self.functions.get_mut(name) {
            entry.replicas.retain(|replica| replica.id() != id);
        }
    }

    /// Next replica of `name` in round-robin order, or `None` when it has none.
    pub fn select_replica(&self, name: &str) -> Option<Arc<dyn Replica>> {
        let entry = self.functions.get(name)?;
        let len = entry.replicas.len();
        if len == 0 {
            return None;
        }
        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % len as u64;
        Some(Arc::clone(&entry.replicas[index as usize]))
    }

    pub fn replica_count(&self, name: &str) -> usize {
        self.functions.get(name).map_or(0, |entry| entry.replicas.len())
    }

    pub fn add_downstream(&self, key: impl Into<String>, downstream: Arc<dyn Downstream>) {
        self.downstreams.insert(key.into(), downstream);
    }

    pub fn remove_downstream(&self, key: &str) -> Option<Arc<dyn Downstream>> {
        self.downstreams.remove(key).map(|(_, downstream)| downstream)
    }

    /// Snapshot of the broadcast targets.
    pub fn downstreams(&self) -> Vec<Arc<dyn Downstream>> {
        self.downstreams.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// The source connection a frame's `source_id` refers to.
    pub fn source(&self, source_id: &str) -> Option<Arc<ServerPeer>> {
        let id = source_id.parse::<u64>().ok()?;
        self.get(id).filter(|peer| peer.connection().role() == Role::Source)
    }

    /// Close every connection and clear the registry.
    pub fn close_all(&self, reason: &str) {
        for peer in self.connections() {
            peer.connection().close(reason);
        }
        self.connections.clear();
        self.functions.clear();
        self.downstreams.clear();
    }
}

fn connector_key(id: u64) -> String {
    format!("connector:{id}")
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.connections.len())
            .field("functions", &self.functions.len())
            .field("downstreams", &self.downstreams.len())
            .finish()
    }
}
