//! In-Memory Coordination Service
//!
//! A process-local implementation of the coordination client contract:
//! hierarchical nodes, per-parent sequence counters, ephemeral ownership,
//! one-shot watches and session events. Every client gets its own session;
//! the test controls (`disconnect`, `resume`, `expire`, `reconnect`) drive
//! the same transitions a networked client would report.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::election::sequence::format_ticket;

use super::{
    Acl, CoordError, CoordResult, CoordinationClient, Connector, CreateMode, SessionEvent,
    SessionEvents, SessionState, WatchEvent, WatchReceiver,
};

/// Order in which `children` returns names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingOrder {
    /// Creation order
    #[default]
    Created,
    /// Reverse creation order
    Reversed,
    /// Deterministic but unrelated to sequence numbers
    Scrambled,
}

/// Per-client watch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Watches installed through `get_watch`
    pub installed: usize,
    /// Watches that fired for any reason
    pub fired: usize,
    /// Watches that fired because the watched node was deleted
    pub node_deleted: usize,
}

struct ZNode {
    data: Vec<u8>,
    owner: Option<i64>,
    created: u64,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, owner: Option<i64>, created: u64) -> Self {
        Self {
            data,
            owner,
            created,
            next_sequence: 0,
        }
    }
}

struct Watch {
    client_id: u64,
    tx: oneshot::Sender<WatchEvent>,
}

struct ClientEntry {
    session_id: i64,
    state: SessionState,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    stats: WatchStats,
}

impl ClientEntry {
    fn emit(&self, state: SessionState) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent {
                state,
                session_id: self.session_id,
            });
        }
    }
}

struct Store {
    nodes: BTreeMap<String, ZNode>,
    watches: HashMap<String, Vec<Watch>>,
    clients: HashMap<u64, ClientEntry>,
    listing: ListingOrder,
    available: bool,
    next_client: u64,
    next_session: i64,
    zxid: u64,
}

impl Store {
    fn new(listing: ListingOrder) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None, 0));
        Self {
            nodes,
            watches: HashMap::new(),
            clients: HashMap::new(),
            listing,
            available: true,
            next_client: 1,
            next_session: 0x1000,
            zxid: 0,
        }
    }

    fn client(&self, client_id: u64) -> CoordResult<&ClientEntry> {
        self.clients
            .get(&client_id)
            .ok_or_else(|| CoordError::Other(format!("unknown client {}", client_id)))
    }

    /// Session id of a client, if its session is usable
    fn live_session(&self, client_id: u64) -> CoordResult<i64> {
        let client = self.client(client_id)?;
        match client.state {
            SessionState::HasSession => Ok(client.session_id),
            SessionState::Expired => Err(CoordError::SessionExpired),
            SessionState::Closed => Err(CoordError::Closing),
            _ => Err(CoordError::ConnectionLoss),
        }
    }

    fn direct_children(&self, path: &str) -> Vec<(&String, &ZNode)> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        let Some(watches) = self.watches.remove(path) else {
            return;
        };
        for watch in watches {
            if let Some(client) = self.clients.get_mut(&watch.client_id) {
                client.stats.fired += 1;
                if event == WatchEvent::NodeDeleted {
                    client.stats.node_deleted += 1;
                }
            }
            let _ = watch.tx.send(event);
        }
    }

    /// Fire every watch held by one client with a session event
    fn fire_session(&mut self, client_id: u64, state: SessionState) {
        let mut fired = Vec::new();
        for watches in self.watches.values_mut() {
            let mut kept = Vec::with_capacity(watches.len());
            for watch in watches.drain(..) {
                if watch.client_id == client_id {
                    fired.push(watch);
                } else {
                    kept.push(watch);
                }
            }
            *watches = kept;
        }
        self.watches.retain(|_, watches| !watches.is_empty());

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.stats.fired += fired.len();
        }
        for watch in fired {
            let _ = watch.tx.send(WatchEvent::Session(state));
        }
    }

    fn delete_node(&mut self, path: &str) -> CoordResult<()> {
        if path == "/" {
            return Err(CoordError::Other("cannot delete root".into()));
        }
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        if !self.direct_children(path).is_empty() {
            return Err(CoordError::Other(format!("node {} has children", path)));
        }
        self.nodes.remove(path);
        self.fire(path, WatchEvent::NodeDeleted);
        Ok(())
    }

    /// Remove every ephemeral node owned by a session
    fn drop_ephemerals(&mut self, session_id: i64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            tracing::trace!("Removing ephemeral {} of session {:#x}", path, session_id);
            self.nodes.remove(&path);
            self.fire(&path, WatchEvent::NodeDeleted);
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn scramble_key(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// In-process coordination service shared by many clients
#[derive(Clone)]
pub struct MemoryCoordinator {
    store: Arc<Mutex<Store>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// Create an empty service containing only the root node
    pub fn new() -> Self {
        Self::with_listing_order(ListingOrder::default())
    }

    /// Create an empty service that lists children in the given order
    pub fn with_listing_order(listing: ListingOrder) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::new(listing))),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make new connections fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.store().available = available;
    }

    /// Open a new session
    pub fn open_session(&self) -> CoordResult<(Arc<MemoryClient>, SessionEvents)> {
        let mut store = self.store();
        if !store.available {
            return Err(CoordError::ConnectionLoss);
        }

        let client_id = store.next_client;
        store.next_client += 1;
        let session_id = store.next_session;
        store.next_session += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let entry = ClientEntry {
            session_id,
            state: SessionState::HasSession,
            events: Some(tx),
            stats: WatchStats::default(),
        };
        entry.emit(SessionState::Connecting);
        entry.emit(SessionState::Connected);
        entry.emit(SessionState::HasSession);
        store.clients.insert(client_id, entry);

        tracing::debug!("Opened in-memory session {:#x}", session_id);

        let client = MemoryClient {
            client_id,
            store: self.store.clone(),
        };
        Ok((Arc::new(client), rx))
    }

    /// Check whether a node exists
    pub fn exists(&self, path: &str) -> bool {
        self.store().nodes.contains_key(path)
    }

    /// Data stored at a node
    pub fn get_data(&self, path: &str) -> Option<Vec<u8>> {
        self.store().nodes.get(path).map(|node| node.data.clone())
    }

    /// Child names of a node in creation order
    pub fn children_in_creation_order(&self, path: &str) -> Vec<String> {
        let store = self.store();
        let mut children: Vec<(u64, String)> = store
            .direct_children(path)
            .into_iter()
            .map(|(p, node)| (node.created, super::node_name(p).to_string()))
            .collect();
        children.sort();
        children.into_iter().map(|(_, name)| name).collect()
    }

    /// Delete a node on behalf of an operator
    pub fn delete(&self, path: &str) -> CoordResult<()> {
        self.store().delete_node(path)
    }

    /// Replace a node's data on behalf of an operator, firing its data watches
    pub fn set_data(&self, path: &str, data: &[u8]) -> CoordResult<()> {
        let mut store = self.store();
        store.zxid += 1;
        let node = store
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        store.fire(path, WatchEvent::NodeDataChanged);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryCoordinator {
    type Client = MemoryClient;

    async fn connect(
        &self,
        addresses: &[String],
        session_timeout: Duration,
    ) -> CoordResult<(Arc<MemoryClient>, SessionEvents)> {
        tracing::debug!(
            "Connecting to in-memory service (addresses: {:?}, session timeout: {:?})",
            addresses,
            session_timeout
        );
        self.open_session()
    }
}

/// One session's client handle on a [`MemoryCoordinator`]
pub struct MemoryClient {
    client_id: u64,
    store: Arc<Mutex<Store>>,
}

impl MemoryClient {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session id
    pub fn session_id(&self) -> i64 {
        self.store()
            .clients
            .get(&self.client_id)
            .map(|c| c.session_id)
            .unwrap_or_default()
    }

    /// Watch counters for this client
    pub fn watch_stats(&self) -> WatchStats {
        self.store()
            .clients
            .get(&self.client_id)
            .map(|c| c.stats)
            .unwrap_or_default()
    }

    /// Lose the transport. The session and its ephemerals survive; pending
    /// watches fire with a disconnected event.
    pub fn disconnect(&self) {
        let mut store = self.store();
        let Some(client) = store.clients.get_mut(&self.client_id) else {
            return;
        };
        if client.state != SessionState::HasSession {
            return;
        }
        client.state = SessionState::Disconnected;
        client.emit(SessionState::Disconnected);
        store.fire_session(self.client_id, SessionState::Disconnected);
    }

    /// Resume the same session after [`disconnect`](Self::disconnect)
    pub fn resume(&self) {
        let mut store = self.store();
        let Some(client) = store.clients.get_mut(&self.client_id) else {
            return;
        };
        if client.state != SessionState::Disconnected {
            return;
        }
        client.state = SessionState::HasSession;
        client.emit(SessionState::Connected);
        client.emit(SessionState::HasSession);
    }

    /// Expire the session: its ephemerals are removed and its watches fire
    pub fn expire(&self) {
        let mut store = self.store();
        let Some(client) = store.clients.get_mut(&self.client_id) else {
            return;
        };
        if matches!(client.state, SessionState::Expired | SessionState::Closed) {
            return;
        }
        if client.state == SessionState::HasSession {
            client.emit(SessionState::Disconnected);
        }
        client.state = SessionState::Expired;
        client.emit(SessionState::Expired);
        let session_id = client.session_id;

        store.fire_session(self.client_id, SessionState::Expired);
        store.drop_ephemerals(session_id);
    }

    /// Establish a brand new session after [`expire`](Self::expire)
    pub fn reconnect(&self) {
        let mut store = self.store();
        let session_id = store.next_session;
        let Some(client) = store.clients.get_mut(&self.client_id) else {
            return;
        };
        if client.state != SessionState::Expired {
            return;
        }
        client.session_id = session_id;
        client.state = SessionState::HasSession;
        client.emit(SessionState::Connected);
        client.emit(SessionState::HasSession);
        store.next_session += 1;
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        _acl: &[Acl],
    ) -> CoordResult<String> {
        let mut store = self.store();
        let session_id = store.live_session(self.client_id)?;

        if !path.starts_with('/') || path == "/" {
            return Err(CoordError::Other(format!("invalid path {:?}", path)));
        }

        let parent = parent_of(path).to_string();
        let Some(parent_node) = store.nodes.get_mut(&parent) else {
            return Err(CoordError::NoNode(parent));
        };
        if parent_node.owner.is_some() {
            return Err(CoordError::Other(format!(
                "ephemeral node {} cannot have children",
                parent
            )));
        }

        let assigned = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format_ticket(path, seq)
        } else {
            path.to_string()
        };

        if store.nodes.contains_key(&assigned) {
            return Err(CoordError::NodeExists(assigned));
        }

        store.zxid += 1;
        let owner = mode.is_ephemeral().then_some(session_id);
        let node = ZNode::new(data.to_vec(), owner, store.zxid);
        store.nodes.insert(assigned.clone(), node);
        Ok(assigned)
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let store = self.store();
        store.live_session(self.client_id)?;

        if !store.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let mut children: Vec<(u64, String)> = store
            .direct_children(path)
            .into_iter()
            .map(|(p, node)| (node.created, super::node_name(p).to_string()))
            .collect();

        match store.listing {
            ListingOrder::Created => children.sort(),
            ListingOrder::Reversed => {
                children.sort();
                children.reverse();
            }
            ListingOrder::Scrambled => children.sort_by_key(|(_, name)| scramble_key(name)),
        }

        Ok(children.into_iter().map(|(_, name)| name).collect())
    }

    async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        let store = self.store();
        store.live_session(self.client_id)?;
        store
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn get_watch(&self, path: &str) -> CoordResult<(Vec<u8>, WatchReceiver)> {
        let mut store = self.store();
        store.live_session(self.client_id)?;

        let data = store
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;

        let (tx, rx) = oneshot::channel();
        store.watches.entry(path.to_string()).or_default().push(Watch {
            client_id: self.client_id,
            tx,
        });
        if let Some(client) = store.clients.get_mut(&self.client_id) {
            client.stats.installed += 1;
        }
        Ok((data, rx))
    }

    fn session_state(&self) -> SessionState {
        self.store()
            .clients
            .get(&self.client_id)
            .map(|c| c.state)
            .unwrap_or(SessionState::Closed)
    }

    async fn close(&self) {
        let mut store = self.store();
        let Some(client) = store.clients.get_mut(&self.client_id) else {
            return;
        };
        if client.state == SessionState::Closed {
            return;
        }
        let had_session = client.state != SessionState::Expired;
        client.state = SessionState::Closed;
        client.emit(SessionState::Closed);
        client.events = None;
        let session_id = client.session_id;

        store.fire_session(self.client_id, SessionState::Closed);
        if had_session {
            store.drop_ephemerals(session_id);
        }
        tracing::debug!("Closed in-memory session {:#x}", session_id);
    }
}
