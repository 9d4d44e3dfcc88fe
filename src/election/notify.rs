//! Notification Channel
//!
//! Lifecycle events reach the application through a channel that buffers a
//! single event. Producers wait for the consumer to drain the previous event,
//! so a slow consumer delays leadership visibility but never loses events.
//!
//! The sending halves live only inside the supervisor and election worker
//! tasks. The stream therefore ends exactly when the last of those tasks has
//! been joined, and no send can ever target a closed channel.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::Notification;

/// Number of events buffered ahead of the consumer
pub const NOTIFICATION_BUFFER: usize = 1;

/// Sending half, cloned into each worker
#[derive(Clone)]
pub(crate) struct Notifier {
    node_id: String,
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Deliver an event, waiting while the buffer is full
    pub async fn send(&self, notification: Notification) {
        tracing::debug!("Node {} -> {}", self.node_id, notification);
        if self.tx.send(notification).await.is_err() {
            tracing::debug!(
                "Notification receiver for {} dropped, discarding {}",
                self.node_id,
                notification
            );
        }
    }
}

/// Receive-only, ordered stream of lifecycle events
#[derive(Debug)]
pub struct Notifications {
    rx: mpsc::Receiver<Notification>,
}

impl Notifications {
    /// Wait for the next event. Returns `None` once the participant has been
    /// closed and every event was delivered.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take an already-buffered event without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> ReceiverStream<Notification> {
        ReceiverStream::new(self.rx)
    }
}

pub(crate) fn channel(node_id: &str) -> (Notifier, Notifications) {
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    (
        Notifier {
            node_id: node_id.to_string(),
            tx,
        },
        Notifications { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_slot_backpressure() {
        let (notifier, mut notifications) = channel("n1");

        notifier.send(Notification::Connected).await;

        let blocked = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.send(Notification::Leader).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(notifications.recv().await, Some(Notification::Connected));
        blocked.await.unwrap();
        assert_eq!(notifications.recv().await, Some(Notification::Leader));
    }

    #[tokio::test]
    async fn test_stream_ends_when_senders_dropped() {
        let (notifier, notifications) = channel("n1");

        let producer = tokio::spawn(async move {
            for n in [
                Notification::Connected,
                Notification::Leader,
                Notification::Follower,
                Notification::Disconnected,
            ] {
                notifier.send(n).await;
            }
        });

        let events: Vec<_> = notifications.into_stream().collect().await;
        producer.await.unwrap();
        assert_eq!(
            events,
            vec![
                Notification::Connected,
                Notification::Leader,
                Notification::Follower,
                Notification::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_does_not_block() {
        let (notifier, notifications) = channel("n1");
        drop(notifications);

        tokio::time::timeout(Duration::from_secs(1), async {
            notifier.send(Notification::Connected).await;
            notifier.send(Notification::Disconnected).await;
        })
        .await
        .unwrap();
    }
}
