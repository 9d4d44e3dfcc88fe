//! Election Module
//!
//! Leader election over ephemeral sequential tickets. The participant with
//! the lowest live ticket leads; every other participant watches only its
//! numeric predecessor, so a leadership change wakes exactly one waiter.

pub mod sequence;
pub mod registrar;
pub mod watch;
pub mod leader;
mod hold;
mod notify;
mod supervisor;

pub use leader::{current_leader, LeaderInfo};
pub use notify::{Notifications, NOTIFICATION_BUFFER};
pub use registrar::Ticket;

pub(crate) use hold::HoldLoop;
pub(crate) use notify::{channel as notification_channel, Notifier};
pub(crate) use supervisor::SessionSupervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::coordination::{Acl, CoordinationClient};

/// Lifecycle event delivered to the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Notification {
    /// A session was established and this participant joined the election
    Connected,
    /// The election worker for a session has stopped
    Disconnected,
    /// This participant now holds the lowest live ticket
    Leader,
    /// This participant gave up leadership
    Follower,
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Connected => write!(f, "CONNECTED"),
            Notification::Disconnected => write!(f, "DISCONNECTED"),
            Notification::Leader => write!(f, "LEADER"),
            Notification::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Parameters of one participant's election
#[derive(Debug, Clone)]
pub struct ElectionParams {
    /// Identity stored as the ticket payload
    pub node_id: String,
    /// Election path under which tickets are created
    pub path: String,
    /// Ticket name prefix
    pub ticket_prefix: String,
    /// How often a leader checks that it still holds leadership
    pub poll_interval: Duration,
    /// ACL for created nodes
    pub acl: Vec<Acl>,
}

/// State shared by the supervisor, the election worker and the handle
pub(crate) struct ElectionContext<C> {
    pub client: Arc<C>,
    pub params: ElectionParams,
    /// Set by the hold loop once elected; cleared on disconnect or relinquish
    leader: AtomicBool,
    /// Set once shutdown starts; no registration happens afterwards
    closing: AtomicBool,
    /// Ticket registered for the current session
    pub ticket: RwLock<Option<Ticket>>,
    /// Bumped on every established session; workers from an older
    /// generation stop
    pub generation: tokio::sync::watch::Sender<u64>,
}

impl<C: CoordinationClient> ElectionContext<C> {
    pub fn new(client: Arc<C>, params: ElectionParams) -> Self {
        let (generation, _) = tokio::sync::watch::channel(0);
        Self {
            client,
            params,
            leader: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            ticket: RwLock::new(None),
            generation,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Start a new session generation and return it
    pub fn next_generation(&self) -> u64 {
        self.generation.send_modify(|g| *g += 1);
        *self.generation.borrow()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn params(node_id: &str, path: &str) -> ElectionParams {
        ElectionParams {
            node_id: node_id.to_string(),
            path: path.to_string(),
            ticket_prefix: "node-".to_string(),
            poll_interval: Duration::from_millis(20),
            acl: Acl::open_unsafe(),
        }
    }
}
