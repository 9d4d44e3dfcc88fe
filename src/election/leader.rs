//! Leader Lookup
//!
//! Resolves who currently leads an election by reading the payload of the
//! lowest live ticket.

use serde::{Deserialize, Serialize};

use crate::coordination::{join_path, CoordError, CoordinationClient};
use crate::election::watch::scan_tickets;
use crate::error::Result;

/// The current leader of an election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    /// Sequence of the leader's ticket
    pub sequence: u64,
    /// Name of the leader's ticket
    pub ticket: String,
    /// Identity the leader stored in its ticket
    pub node_id: String,
}

/// Look up the current leader of the election at `path`.
///
/// Returns `None` when the path does not exist or holds no tickets.
pub async fn current_leader<C>(client: &C, path: &str) -> Result<Option<LeaderInfo>>
where
    C: CoordinationClient + ?Sized,
{
    loop {
        let names = match client.children(path).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let tickets = scan_tickets(path, names)?;
        let Some((sequence, ticket)) = tickets.into_iter().min_by_key(|(sequence, _)| *sequence)
        else {
            return Ok(None);
        };

        match client.get(&join_path(path, &ticket)).await {
            Ok(data) => {
                return Ok(Some(LeaderInfo {
                    sequence,
                    ticket,
                    node_id: String::from_utf8_lossy(&data).into_owned(),
                }))
            }
            Err(CoordError::NoNode(_)) => {
                tracing::debug!("Leader ticket {} vanished during lookup, rescanning", ticket);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
