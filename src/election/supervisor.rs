//! Session State Supervisor
//!
//! Consumes the coordination client's session events one at a time and
//! drives the participant's lifecycle:
//!
//! - session established: register a ticket (unless the same session is
//!   resuming with its ticket intact) and start an election worker
//! - disconnected / expired / closed: clear the leadership flag; the worker
//!   notices on its own and winds down
//!
//! The supervisor never emits notifications itself.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::registrar::register;
use super::{ElectionContext, HoldLoop, Notifier};
use crate::coordination::{CoordinationClient, SessionEvents, SessionState};
use crate::error::{Error, Result};

/// Session supervisor task state
pub(crate) struct SessionSupervisor<C> {
    ctx: Arc<ElectionContext<C>>,
    events: SessionEvents,
    notifier: Notifier,
    worker: Option<JoinHandle<()>>,
    /// Session that owns the registered ticket
    registered_session: Option<i64>,
}

impl<C: CoordinationClient> SessionSupervisor<C> {
    pub fn new(ctx: Arc<ElectionContext<C>>, events: SessionEvents, notifier: Notifier) -> Self {
        Self {
            ctx,
            events,
            notifier,
            worker: None,
            registered_session: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            tracing::trace!(
                "Node {} session {:#x} -> {}",
                self.ctx.params.node_id,
                event.session_id,
                event.state
            );

            match event.state {
                SessionState::HasSession => {
                    if let Err(e) = self.on_established(event.session_id).await {
                        if e.is_session_lost() {
                            tracing::debug!("Not joining election for {:#x}: {}", event.session_id, e);
                        } else {
                            tracing::error!(
                                "Node {} failed to join election {}: {}",
                                self.ctx.params.node_id,
                                self.ctx.params.path,
                                e
                            );
                        }
                        break;
                    }
                }
                SessionState::Disconnected => {
                    self.ctx.set_leader(false);
                }
                SessionState::Expired | SessionState::Closed => {
                    self.ctx.set_leader(false);
                    self.forget_ticket().await;
                }
                SessionState::Connecting | SessionState::Connected => {}
            }
        }

        self.join_worker().await;
        tracing::debug!("Session supervisor for {} stopped", self.ctx.params.node_id);
    }

    async fn on_established(&mut self, session_id: i64) -> Result<()> {
        if self.ctx.is_closing() {
            return Err(Error::ShuttingDown);
        }

        // Retire the worker of the previous connection window before
        // starting the next one, so its Disconnected precedes our Connected.
        self.ctx.next_generation();
        self.join_worker().await;

        let sequence = match self.current_ticket(session_id).await {
            Some(sequence) => {
                tracing::info!(
                    "Session {:#x} resumed, keeping ticket {}",
                    session_id,
                    sequence
                );
                sequence
            }
            None => {
                let params = &self.ctx.params;
                let ticket = register(
                    self.ctx.client.as_ref(),
                    &params.path,
                    &params.ticket_prefix,
                    params.node_id.as_bytes(),
                    &params.acl,
                )
                .await?;
                let sequence = ticket.sequence;
                *self.ctx.ticket.write().await = Some(ticket);
                self.registered_session = Some(session_id);
                sequence
            }
        };

        let worker = HoldLoop::new(self.ctx.clone(), self.notifier.clone(), sequence);
        self.worker = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    async fn current_ticket(&self, session_id: i64) -> Option<u64> {
        if self.registered_session != Some(session_id) {
            return None;
        }
        self.ctx.ticket.read().await.as_ref().map(|t| t.sequence)
    }

    async fn forget_ticket(&mut self) {
        self.registered_session = None;
        *self.ctx.ticket.write().await = None;
    }

    async fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::error!("Election worker for {} panicked: {}", self.ctx.params.node_id, e);
            }
        }
    }
}
