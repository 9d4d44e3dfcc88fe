//! Predecessor Watch
//!
//! Waits until this participant holds the lowest live ticket. Instead of
//! watching the leader (which would wake every participant when it goes
//! away), each participant watches only the ticket numerically right below
//! its own. The listing call gives no ordering guarantee, so the
//! predecessor is always computed from the parsed sequence numbers.

use tokio::sync::watch;

use crate::coordination::{join_path, CoordError, CoordinationClient, WatchEvent};
use crate::election::sequence::parse_sequence;
use crate::error::{Error, Result};

/// Parse every child name under `path` into `(sequence, name)` pairs
pub fn scan_tickets(path: &str, names: Vec<String>) -> Result<Vec<(u64, String)>> {
    names
        .into_iter()
        .map(|name| match parse_sequence(&name) {
            Ok(sequence) => Ok((sequence, name)),
            Err(_) => Err(Error::Scan {
                path: path.to_string(),
                name,
            }),
        })
        .collect()
}

/// The ticket with the largest sequence strictly below `own`
pub fn find_predecessor(own: u64, tickets: &[(u64, String)]) -> Option<&(u64, String)> {
    tickets
        .iter()
        .filter(|(sequence, _)| *sequence < own)
        .max_by_key(|(sequence, _)| *sequence)
}

fn session_error(e: CoordError) -> Error {
    if e.is_session_lost() {
        Error::SessionLost
    } else {
        Error::Coordination(e)
    }
}

/// Block until the ticket `own` is the lowest under `path`.
///
/// Returns `Ok(())` once elected. Returns [`Error::SessionLost`] when the
/// session drops or `generation` moves on while waiting.
pub async fn await_leadership<C>(
    client: &C,
    path: &str,
    own: u64,
    generation: &mut watch::Receiver<u64>,
) -> Result<()>
where
    C: CoordinationClient + ?Sized,
{
    loop {
        if generation.has_changed().unwrap_or(true) {
            return Err(Error::SessionLost);
        }

        let names = client.children(path).await.map_err(session_error)?;
        let tickets = scan_tickets(path, names)?;

        if !tickets.iter().any(|(sequence, _)| *sequence == own) {
            tracing::warn!("Own ticket {} no longer listed under {}", own, path);
            return Err(Error::NotRegistered);
        }

        let Some((predecessor, name)) = find_predecessor(own, &tickets) else {
            tracing::debug!("Ticket {} is the lowest under {}", own, path);
            return Ok(());
        };

        let target = join_path(path, name);
        tracing::debug!("Ticket {} waiting on predecessor {}", own, predecessor);

        let receiver = match client.get_watch(&target).await {
            Ok((_, receiver)) => receiver,
            Err(CoordError::NoNode(_)) => {
                tracing::debug!("Predecessor {} vanished before watch, rescanning", target);
                continue;
            }
            Err(e) => return Err(session_error(e)),
        };

        tokio::select! {
            event = receiver => match event {
                Ok(WatchEvent::NodeDeleted) => {
                    tracing::debug!("Predecessor {} deleted", target);
                }
                Ok(WatchEvent::NodeDataChanged) => {
                    tracing::trace!("Predecessor {} changed, re-arming", target);
                }
                Ok(WatchEvent::Session(state)) => {
                    tracing::debug!("Watch on {} ended by session state {}", target, state);
                    return Err(Error::SessionLost);
                }
                Err(_) => return Err(Error::SessionLost),
            },
            _ = generation.changed() => return Err(Error::SessionLost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{
        Acl, CoordResult, CreateMode, ListingOrder, MemoryClient, MemoryCoordinator, SessionState,
        WatchReceiver,
    };
    use crate::election::registrar::register;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn tickets(sequences: &[u64]) -> Vec<(u64, String)> {
        sequences
            .iter()
            .map(|s| (*s, format!("node-{:010}", s)))
            .collect()
    }

    #[test]
    fn test_find_predecessor_is_numeric() {
        let scanned = tickets(&[152, 150, 155, 151, 149]);
        assert_eq!(find_predecessor(152, &scanned).map(|t| t.0), Some(151));
        assert_eq!(find_predecessor(155, &scanned).map(|t| t.0), Some(152));
        assert_eq!(find_predecessor(149, &scanned), None);
        // gaps left by departed participants
        let scanned = tickets(&[3, 17, 9]);
        assert_eq!(find_predecessor(17, &scanned).map(|t| t.0), Some(9));
    }

    #[test]
    fn test_find_predecessor_ignores_listing_order() {
        use rand::seq::SliceRandom;

        let mut rng = rand::thread_rng();
        let mut scanned = tickets(&(0..50).map(|s| s * 3).collect::<Vec<_>>());
        for _ in 0..20 {
            scanned.shuffle(&mut rng);
            assert_eq!(find_predecessor(90, &scanned).map(|t| t.0), Some(87));
            assert_eq!(find_predecessor(0, &scanned), None);
        }
    }

    #[test]
    fn test_scan_rejects_malformed_names() {
        let err = scan_tickets(
            "/e",
            vec!["node-0000000001".to_string(), "lock".to_string()],
        )
        .unwrap_err();
        match err {
            Error::Scan { path, name } => {
                assert_eq!(path, "/e");
                assert_eq!(name, "lock");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    async fn enrolled(coordinator: &MemoryCoordinator) -> (Arc<MemoryClient>, u64) {
        let (client, _events) = coordinator.open_session().unwrap();
        let ticket = register(client.as_ref(), "/e", "node-", b"", &Acl::open_unsafe())
            .await
            .unwrap();
        (client, ticket.sequence)
    }

    #[tokio::test]
    async fn test_lowest_ticket_is_elected_without_watches() {
        let coordinator = MemoryCoordinator::new();
        let (client, own) = enrolled(&coordinator).await;
        let (_tx, mut generation) = watch::channel(0u64);

        await_leadership(client.as_ref(), "/e", own, &mut generation)
            .await
            .unwrap();
        assert_eq!(client.watch_stats().installed, 0);
    }

    #[tokio::test]
    async fn test_waits_for_predecessor_deletion() {
        let coordinator = MemoryCoordinator::with_listing_order(ListingOrder::Reversed);
        let (first, _) = enrolled(&coordinator).await;
        let (second, own) = enrolled(&coordinator).await;
        let (_tx, mut generation) = watch::channel(0u64);

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move {
                await_leadership(second.as_ref(), "/e", own, &mut generation).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.watch_stats().node_deleted, 1);
    }

    #[tokio::test]
    async fn test_session_loss_aborts_wait() {
        let coordinator = MemoryCoordinator::new();
        let (_first, _) = enrolled(&coordinator).await;
        let (second, own) = enrolled(&coordinator).await;
        let (_tx, mut generation) = watch::channel(0u64);

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move {
                await_leadership(second.as_ref(), "/e", own, &mut generation).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        second.disconnect();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::SessionLost)));
    }

    #[tokio::test]
    async fn test_generation_change_aborts_wait() {
        let coordinator = MemoryCoordinator::new();
        let (_first, _) = enrolled(&coordinator).await;
        let (second, own) = enrolled(&coordinator).await;
        let (tx, mut generation) = watch::channel(0u64);

        let waiter = tokio::spawn(async move {
            await_leadership(second.as_ref(), "/e", own, &mut generation).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_modify(|g| *g += 1);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::SessionLost)));
    }

    #[tokio::test]
    async fn test_foreign_child_is_scan_error() {
        let coordinator = MemoryCoordinator::new();
        let (client, own) = enrolled(&coordinator).await;
        client
            .create("/e/lock", b"", CreateMode::Persistent, &Acl::open_unsafe())
            .await
            .unwrap();
        let (_tx, mut generation) = watch::channel(0u64);

        let err = await_leadership(client.as_ref(), "/e", own, &mut generation)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Scan { .. }));
    }

    #[tokio::test]
    async fn test_missing_own_ticket_is_not_leadership() {
        let coordinator = MemoryCoordinator::new();
        let (client, own) = enrolled(&coordinator).await;
        coordinator.delete("/e/node-0000000000").unwrap();
        let (_tx, mut generation) = watch::channel(0u64);

        let err = await_leadership(client.as_ref(), "/e", own, &mut generation)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRegistered));
    }

    /// Client whose first watch target is deleted between listing and watch
    struct VanishingTarget {
        inner: Arc<MemoryClient>,
        coordinator: MemoryCoordinator,
        vanished: AtomicBool,
    }

    #[async_trait]
    impl CoordinationClient for VanishingTarget {
        async fn create(
            &self,
            path: &str,
            data: &[u8],
            mode: CreateMode,
            acl: &[Acl],
        ) -> CoordResult<String> {
            self.inner.create(path, data, mode, acl).await
        }

        async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
            self.inner.children(path).await
        }

        async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
            self.inner.get(path).await
        }

        async fn get_watch(&self, path: &str) -> CoordResult<(Vec<u8>, WatchReceiver)> {
            if !self.vanished.swap(true, Ordering::SeqCst) {
                self.coordinator.delete(path)?;
            }
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
    async fn test_predecessor_vanishing_before_watch_rescans() {
        let coordinator = MemoryCoordinator::new();
        let (first, _) = enrolled(&coordinator).await;
        let (_second, _) = enrolled(&coordinator).await;
        let (third, own) = enrolled(&coordinator).await;
        let client = Arc::new(VanishingTarget {
            inner: third.clone(),
            coordinator: coordinator.clone(),
            vanished: AtomicBool::new(false),
        });
        let (_tx, mut generation) = watch::channel(0u64);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                await_leadership(client.as_ref(), "/e", own, &mut generation).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(!coordinator.exists("/e/node-0000000001"));
        // The rescan moved the watch down to the first ticket
        assert_eq!(third.watch_stats().installed, 1);

        first.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.watch_stats().node_deleted, 1);
    }

    #[tokio::test]
    async fn test_only_predecessor_vanishing_before_watch_elects() {
        let coordinator = MemoryCoordinator::new();
        let (_first, _) = enrolled(&coordinator).await;
        let (second, own) = enrolled(&coordinator).await;
        let client = VanishingTarget {
            inner: second.clone(),
            coordinator: coordinator.clone(),
            vanished: AtomicBool::new(false),
        };
        let (_tx, mut generation) = watch::channel(0u64);

        tokio::time::timeout(
            Duration::from_secs(1),
            await_leadership(&client, "/e", own, &mut generation),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(second.watch_stats().installed, 0);
    }

    #[tokio::test]
    async fn test_predecessor_data_change_rearms_watch() {
        let coordinator = MemoryCoordinator::new();
        let (first, _) = enrolled(&coordinator).await;
        let (second, own) = enrolled(&coordinator).await;
        let (_tx, mut generation) = watch::channel(0u64);

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move {
                await_leadership(second.as_ref(), "/e", own, &mut generation).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(second.watch_stats().installed, 1);

        coordinator.set_data("/e/node-0000000000", b"moved").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while second.watch_stats().installed < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!waiter.is_finished());
        assert_eq!(second.watch_stats().node_deleted, 0);

        first.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.watch_stats().node_deleted, 1);
    }
}
