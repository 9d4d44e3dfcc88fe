//! Leadership Hold Loop
//!
//! One worker per established session. It runs the predecessor watch until
//! elected, announces leadership, polls the leadership flag while leading
//! and re-enters the election as long as the session stays valid.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::{ElectionContext, Notification, Notifier};
use crate::coordination::CoordinationClient;
use crate::election::watch::await_leadership;

/// Worker states within one session lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Electing,
    Leading,
    Relinquished,
    Terminated,
}

/// Election worker for a single session generation
pub(crate) struct HoldLoop<C> {
    ctx: Arc<ElectionContext<C>>,
    notifier: Notifier,
    generation: watch::Receiver<u64>,
    sequence: u64,
}

impl<C: CoordinationClient> HoldLoop<C> {
    /// Create a worker for the current generation holding ticket `sequence`
    pub fn new(ctx: Arc<ElectionContext<C>>, notifier: Notifier, sequence: u64) -> Self {
        let mut generation = ctx.generation.subscribe();
        generation.borrow_and_update();
        Self {
            ctx,
            notifier,
            generation,
            sequence,
        }
    }

    pub async fn run(mut self) {
        self.notifier.send(Notification::Connected).await;

        let mut state = HoldState::Electing;
        while state != HoldState::Terminated {
            state = match state {
                HoldState::Electing => self.elect().await,
                HoldState::Leading => self.hold().await,
                HoldState::Relinquished => self.relinquish().await,
                HoldState::Terminated => HoldState::Terminated,
            };
        }

        self.notifier.send(Notification::Disconnected).await;
        tracing::debug!(
            "Election worker for {} (ticket {}) stopped",
            self.ctx.params.node_id,
            self.sequence
        );
    }

    async fn elect(&mut self) -> HoldState {
        let result = await_leadership(
            self.ctx.client.as_ref(),
            &self.ctx.params.path,
            self.sequence,
            &mut self.generation,
        )
        .await;

        match result {
            Ok(()) => {
                self.ctx.set_leader(true);
                // The session may have dropped after the listing; the
                // supervisor's clear could then precede our set
                if !self.session_valid() {
                    self.ctx.set_leader(false);
                    tracing::debug!(
                        "Session lost before ticket {} could take leadership",
                        self.sequence
                    );
                    return HoldState::Terminated;
                }
                tracing::info!(
                    "Node {} is now LEADER of {} (ticket {})",
                    self.ctx.params.node_id,
                    self.ctx.params.path,
                    self.sequence
                );
                self.notifier.send(Notification::Leader).await;
                HoldState::Leading
            }
            Err(e) if e.is_session_lost() => {
                tracing::debug!("Election for ticket {} ended: {}", self.sequence, e);
                HoldState::Terminated
            }
            Err(e) if e.is_protocol_violation() => {
                tracing::error!(
                    "Coordination service returned a malformed listing under {}: {}",
                    self.ctx.params.path,
                    e
                );
                HoldState::Terminated
            }
            Err(e) => {
                tracing::error!("Election for ticket {} failed: {}", self.sequence, e);
                HoldState::Terminated
            }
        }
    }

    async fn hold(&mut self) -> HoldState {
        let mut ticker = interval(self.ctx.params.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.ctx.is_leader() || !self.session_valid() {
                return HoldState::Relinquished;
            }
        }
    }

    async fn relinquish(&mut self) -> HoldState {
        self.ctx.set_leader(false);
        tracing::info!(
            "Node {} gave up leadership of {}",
            self.ctx.params.node_id,
            self.ctx.params.path
        );
        self.notifier.send(Notification::Follower).await;

        if self.session_valid() {
            tracing::debug!("Session still valid, re-entering election with ticket {}", self.sequence);
            HoldState::Electing
        } else {
            HoldState::Terminated
        }
    }

    fn generation_moved(&self) -> bool {
        self.generation.has_changed().unwrap_or(true)
    }

    fn session_valid(&self) -> bool {
        self.ctx.client.session_state().has_session() && !self.generation_moved()
    }
}
