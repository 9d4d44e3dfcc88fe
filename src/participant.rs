//! Election Participant
//!
//! The handle an application holds while taking part in an election. It owns
//! the session supervisor task, exposes the notification channel and tears
//! everything down in a fixed order on [`Participant::close`].

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::WolfElectConfig;
use crate::coordination::{CoordinationClient, Connector, SessionEvents};
use crate::election::{
    current_leader, notification_channel, ElectionContext, ElectionParams, LeaderInfo,
    Notifications, SessionSupervisor,
};
use crate::error::{Error, Result};

/// A member of one leader election
pub struct Participant<C: CoordinationClient> {
    ctx: Arc<ElectionContext<C>>,
    notifications: Option<Notifications>,
    supervisor: Option<JoinHandle<()>>,
}

impl<C: CoordinationClient> Participant<C> {
    /// Connect to the coordination service and join the election described
    /// by `config`.
    ///
    /// Returns once the connection attempt has been accepted; the ticket is
    /// registered in the background when the session is established.
    pub async fn connect<K>(config: &WolfElectConfig, connector: &K) -> Result<Self>
    where
        K: Connector<Client = C>,
    {
        config.validate()?;

        let addresses = &config.coordination.addresses;
        tracing::info!(
            "Node {} connecting to {} for election {}",
            config.node.id,
            addresses.join(","),
            config.election.path
        );

        let (client, events) = connector
            .connect(addresses, config.session_timeout())
            .await
            .map_err(|e| Error::Connection {
                addresses: addresses.join(","),
                reason: e.to_string(),
            })?;

        Ok(Self::start(config.election_params(), client, events))
    }

    /// Join an election over an already connected client
    pub fn start(params: ElectionParams, client: Arc<C>, events: SessionEvents) -> Self {
        let (notifier, notifications) = notification_channel(&params.node_id);
        let ctx = Arc::new(ElectionContext::new(client, params));
        let supervisor = SessionSupervisor::new(ctx.clone(), events, notifier);

        Self {
            ctx,
            notifications: Some(notifications),
            supervisor: Some(tokio::spawn(supervisor.run())),
        }
    }

    /// Take the notification channel. Only the first call returns it.
    ///
    /// The consumer must keep draining it: producers wait for the single
    /// buffered slot, and [`Participant::close`] waits for them.
    pub fn notifications(&mut self) -> Option<Notifications> {
        self.notifications.take()
    }

    /// Identity stored in this participant's ticket
    pub fn id(&self) -> &str {
        &self.ctx.params.node_id
    }

    /// Election path
    pub fn path(&self) -> &str {
        &self.ctx.params.path
    }

    /// Coordination client used by this participant
    pub fn client(&self) -> &Arc<C> {
        &self.ctx.client
    }

    /// Sequence of the ticket registered for the current session
    pub async fn sequence(&self) -> Option<u64> {
        self.ctx.ticket.read().await.as_ref().map(|t| t.sequence)
    }

    /// Whether this participant currently leads
    pub fn is_leader(&self) -> bool {
        self.ctx.is_leader()
    }

    /// Look up the current leader as seen by the coordination service
    pub async fn current_leader(&self) -> Result<Option<LeaderInfo>> {
        current_leader(self.ctx.client.as_ref(), &self.ctx.params.path).await
    }

    /// Leave the election.
    ///
    /// Closes the session, which removes the ticket, then waits for the
    /// supervisor and election worker to finish. The notification channel
    /// ends after its final `Disconnected`.
    pub async fn close(mut self) -> Result<()> {
        tracing::info!("Node {} leaving election {}", self.id(), self.path());
        self.ctx.mark_closing();

        // Nobody can drain an untaken channel, so workers must not wait on it
        drop(self.notifications.take());

        self.ctx.client.close().await;

        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                tracing::error!("Session supervisor for {} panicked: {}", self.id(), e);
            }
        }

        self.ctx.set_leader(false);
        tracing::info!("Node {} left election {}", self.id(), self.path());
        Ok(())
    }
}

impl<C: CoordinationClient> Drop for Participant<C> {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            tracing::warn!(
                "Participant {} dropped without close(), its session stays open",
                self.ctx.params.node_id
            );
        }
    }
}
