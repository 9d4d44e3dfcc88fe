//! WolfElect - Leader Election over a Coordination Service
//!
//! A Rust library that elects exactly one leader among cooperating processes
//! using a hierarchical, watch-capable coordination service that supports
//! ephemeral sequential nodes.
//!
//! # Architecture
//!
//! Every participant registers an ephemeral, sequentially numbered ticket
//! under a shared election path. The participant holding the lowest live
//! ticket leads. Everyone else watches only the ticket directly below its
//! own, so when a ticket disappears exactly one waiter wakes up.
//!
//! # Features
//!
//! - Session lifecycle supervision with ticket re-registration after expiry
//! - Predecessor watching without a thundering herd
//! - Ordered `Connected` / `Leader` / `Follower` / `Disconnected` notifications
//! - Leader lookup by ticket payload
//! - Native ZooKeeper client with reconnection and session expiry handling
//! - In-memory coordination service for tests and simulation

pub mod config;
pub mod coordination;
pub mod election;
pub mod error;
pub mod participant;

pub use config::WolfElectConfig;
pub use error::{Error, Result};
pub use participant::Participant;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfElectConfig;
    pub use crate::coordination::{
        CoordinationClient, Connector, MemoryClient, MemoryCoordinator, SessionState, ZkClient,
        ZkConnector,
    };
    pub use crate::election::{LeaderInfo, Notification, Notifications};
    pub use crate::error::{Error, Result};
    pub use crate::participant::Participant;
}
