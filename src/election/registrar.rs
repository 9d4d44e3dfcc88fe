//! Election Registrar
//!
//! Creates the election path and this participant's ephemeral sequential
//! ticket beneath it.

use crate::coordination::{path_prefixes, Acl, CoordinationClient, CreateMode};
use crate::election::sequence::parse_sequence;
use crate::error::{Error, Result};

/// A registered ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Full path assigned by the coordination service
    pub path: String,
    /// Sequence number parsed from the assigned name
    pub sequence: u64,
}

impl Ticket {
    /// Name of the ticket within the election path
    pub fn name(&self) -> &str {
        crate::coordination::node_name(&self.path)
    }
}

/// Create every segment of `path`, treating "already exists" as success
pub async fn ensure_path<C>(client: &C, path: &str, acl: &[Acl]) -> Result<()>
where
    C: CoordinationClient + ?Sized,
{
    for segment in path_prefixes(path) {
        match client.create(&segment, &[], CreateMode::Persistent, acl).await {
            Ok(_) => tracing::debug!("Created election path segment {}", segment),
            Err(e) if e.is_node_exists() => continue,
            Err(e) => {
                tracing::error!("Failed to create {}: {}", segment, e);
                return Err(Error::Registration {
                    path: segment,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Ensure the election path exists and register one ticket under it
pub async fn register<C>(
    client: &C,
    path: &str,
    prefix: &str,
    data: &[u8],
    acl: &[Acl],
) -> Result<Ticket>
where
    C: CoordinationClient + ?Sized,
{
    ensure_path(client, path, acl).await?;

    let ticket_prefix = crate::coordination::join_path(path, prefix);
    let assigned = client
        .create(&ticket_prefix, data, CreateMode::EphemeralSequential, acl)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create ticket {}: {}", ticket_prefix, e);
            Error::Registration {
                path: ticket_prefix.clone(),
                reason: e.to_string(),
            }
        })?;

    let sequence = parse_sequence(&assigned).map_err(|e| {
        tracing::error!("Coordination service assigned an unparsable ticket: {}", e);
        Error::Registration {
            path: path.to_string(),
            reason: e.to_string(),
        }
    })?;

    tracing::info!("Registered ticket {} (sequence {})", assigned, sequence);
    Ok(Ticket {
        path: assigned,
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordError, CoordResult, MemoryCoordinator, SessionState, WatchReceiver};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_register_creates_nested_path() {
        let coordinator = MemoryCoordinator::new();
        let (client, _events) = coordinator.open_session().unwrap();

        let ticket = register(
            client.as_ref(),
            "/services/scheduler/election",
            "node-",
            b"node-1",
            &Acl::open_unsafe(),
        )
        .await
        .unwrap();

        assert!(coordinator.exists("/services"));
        assert!(coordinator.exists("/services/scheduler"));
        assert_eq!(ticket.sequence, 0);
        assert_eq!(ticket.path, "/services/scheduler/election/node-0000000000");
        assert_eq!(ticket.name(), "node-0000000000");
    }

    #[tokio::test]
    async fn test_second_participant_accepts_existing_path() {
        let coordinator = MemoryCoordinator::new();
        let (first, _e1) = coordinator.open_session().unwrap();
        let (second, _e2) = coordinator.open_session().unwrap();
        let acl = Acl::open_unsafe();

        let a = register(first.as_ref(), "/a/b", "node-", b"", &acl).await.unwrap();
        let b = register(second.as_ref(), "/a/b", "node-", b"", &acl).await.unwrap();

        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
    }

    #[tokio::test]
    async fn test_prefixes_without_trailing_dash_register_and_scan() {
        let coordinator = MemoryCoordinator::new();
        let acl = Acl::open_unsafe();

        for (path, prefix) in [("/locks", "lock"), ("/numbered", "node-1"), ("/named", "my-node")] {
            let (first, _e1) = coordinator.open_session().unwrap();
            let (second, _e2) = coordinator.open_session().unwrap();

            let a = register(first.as_ref(), path, prefix, b"", &acl).await.unwrap();
            let b = register(second.as_ref(), path, prefix, b"", &acl).await.unwrap();
            assert_eq!(a.name(), format!("{}0000000000", prefix));
            assert_eq!((a.sequence, b.sequence), (0, 1));

            let names = second.children(path).await.unwrap();
            let tickets = crate::election::watch::scan_tickets(path, names).unwrap();
            let predecessor = crate::election::watch::find_predecessor(b.sequence, &tickets);
            assert_eq!(predecessor.map(|t| t.1.as_str()), Some(a.name()));
        }
    }

    /// Client whose sequential creates return names without a counter
    struct BrokenSequencer {
        inner: std::sync::Arc<crate::coordination::MemoryClient>,
    }

    #[async_trait]
    impl CoordinationClient for BrokenSequencer {
        async fn create(
            &self,
            path: &str,
            data: &[u8],
            mode: CreateMode,
            acl: &[Acl],
        ) -> CoordResult<String> {
            if mode.is_sequential() {
                return Ok(format!("{}abc", path));
            }
            self.inner.create(path, data, mode, acl).await
        }

        async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
            self.inner.children(path).await
        }

        async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
            self.inner.get(path).await
        }

        async fn get_watch(&self, path: &str) -> CoordResult<(Vec<u8>, WatchReceiver)> {
            self.inner.get_watch(path).await
        }

        fn session_state(&self) -> SessionState {
            self.inner.session_state()
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_unparsable_ticket_is_registration_error() {
        let coordinator = MemoryCoordinator::new();
        let (inner, _events) = coordinator.open_session().unwrap();
        let client = BrokenSequencer { inner };

        let err = register(&client, "/e", "node-", b"", &Acl::open_unsafe())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[tokio::test]
    async fn test_path_failure_is_registration_error() {
        let coordinator = MemoryCoordinator::new();
        let (client, _events) = coordinator.open_session().unwrap();
        client.disconnect();

        let err = ensure_path(client.as_ref(), "/e", &Acl::open_unsafe())
            .await
            .unwrap_err();
        match err {
            Error::Registration { path, reason } => {
                assert_eq!(path, "/e");
                assert_eq!(reason, CoordError::ConnectionLoss.to_string());
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
