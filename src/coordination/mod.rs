//! Coordination Service Module
//!
//! The client contract consumed by the election core: a hierarchical,
//! watch-capable store with ephemeral and sequential nodes, plus the
//! session-event stream that drives the election lifecycle.

pub mod memory;
pub mod zookeeper;

pub use memory::{ListingOrder, MemoryClient, MemoryCoordinator, WatchStats};
pub use zookeeper::{ZkClient, ZkConnector};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Result type for coordination client calls
pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Errors reported by a coordination client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Client is closing")]
    Closing,

    #[error("Coordination error: {0}")]
    Other(String),
}

impl CoordError {
    /// Check if this error means the session is gone or going away
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            CoordError::ConnectionLoss | CoordError::SessionExpired | CoordError::Closing
        )
    }

    /// Check if this is the non-fatal "already exists" kind
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists(_))
    }
}

/// Session state as reported by the coordination client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing a server
    Connecting,
    /// Transport connected, session not yet negotiated
    Connected,
    /// Session established and usable
    HasSession,
    /// Transport lost; the session may still be resumed
    Disconnected,
    /// Session expired; its ephemeral nodes are gone
    Expired,
    /// Client closed
    Closed,
}

impl SessionState {
    /// Check if the session is usable
    pub fn has_session(&self) -> bool {
        matches!(self, SessionState::HasSession)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::HasSession => write!(f, "HAS_SESSION"),
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A session-state transition delivered on the session-event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    /// New session state
    pub state: SessionState,
    /// Session the event refers to
    pub session_id: i64,
}

/// Event delivered by a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node was deleted
    NodeDeleted,
    /// The watched node's data changed
    NodeDataChanged,
    /// The session changed state before the node did
    Session(SessionState),
}

/// Node creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Access control entry attached to created nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    /// Permission bits
    pub perms: u32,
    /// Authentication scheme
    pub scheme: String,
    /// Identity within the scheme
    pub id: String,
}

impl Acl {
    pub const PERM_READ: u32 = 1;
    pub const PERM_WRITE: u32 = 1 << 1;
    pub const PERM_CREATE: u32 = 1 << 2;
    pub const PERM_DELETE: u32 = 1 << 3;
    pub const PERM_ADMIN: u32 = 1 << 4;
    pub const PERM_ALL: u32 = 0x1f;

    /// World-readable, world-writable ACL
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl {
            perms: Self::PERM_ALL,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }]
    }
}

/// Receiving half of a one-shot watch
pub type WatchReceiver = oneshot::Receiver<WatchEvent>;

/// Stream of session events for one client
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Client for a hierarchical, watch-capable coordination service.
///
/// Implementations must be safe for concurrent use: the supervisor and the
/// election worker call into the same client from different tasks.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create a node. Returns the full path assigned by the service, which
    /// carries the sequence suffix for sequential modes.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> CoordResult<String>;

    /// List child names of a node. No ordering is guaranteed.
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// Read a node's data.
    async fn get(&self, path: &str) -> CoordResult<Vec<u8>>;

    /// Read a node's data and install a one-shot watch on it.
    async fn get_watch(&self, path: &str) -> CoordResult<(Vec<u8>, WatchReceiver)>;

    /// Current session state.
    fn session_state(&self) -> SessionState;

    /// Close the session. The session-event stream receives a terminal
    /// event and then ends.
    async fn close(&self);
}

/// Opens sessions against a coordination service
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: CoordinationClient;

    async fn connect(
        &self,
        addresses: &[String],
        session_timeout: Duration,
    ) -> CoordResult<(Arc<Self::Client>, SessionEvents)>;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Final segment of a node path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every ancestor prefix of an absolute path, shallowest first, including
/// the path itself (`/a/b` yields `/a`, `/a/b`).
pub fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}
