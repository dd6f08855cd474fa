//! # proxy
//!
//! why: let clients talk to "the cluster" without knowing which server leads
//! relations: calls servers through a ClientRpc; follows the NotLeader hints node.rs returns
//! what: LeaderProxy

use log::{debug, warn};

use crate::transport::ClientRpc;
use crate::{Error, NodeId, Result};

/// Routes client calls to the current leader, caching it between calls
#[derive(Debug)]
pub struct LeaderProxy<R> {
    rpc: R,
    servers: Vec<NodeId>,
    leader: Option<NodeId>,
    max_attempts: usize,
}

impl<R: ClientRpc> LeaderProxy<R> {
    /// By default every server gets two chances per call
    pub fn new(rpc: R, servers: impl IntoIterator<Item = NodeId>) -> Self {
        let servers: Vec<NodeId> = servers.into_iter().collect();
        let max_attempts = servers.len() * 2;
        Self {
            rpc,
            servers,
            leader: None,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The server the last successful call went to
    pub fn cached_leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    /// Run `command` on the leader
    ///
    /// Tries the cached leader first, then follows leader hints, falling back to
    /// walking the server list. Errors other than "try elsewhere" are returned as is.
    pub fn client_query(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut target = self.leader.or_else(|| self.servers.first().copied());

        for attempt in 1..=self.max_attempts {
            let Some(server) = target else {
                break;
            };
            match self.rpc.client_query(server, command) {
                Ok(response) => {
                    self.leader = Some(server);
                    return Ok(response);
                }
                Err(Error::NotLeader {
                    leader: Some(hint),
                }) if hint != server => {
                    debug!("server {} redirected to leader {} (attempt {})", server, hint, attempt);
                    target = Some(hint);
                }
                Err(err) if err.is_retryable() => {
                    debug!("server {} could not serve query (attempt {}): {}", server, attempt, err);
                    target = self.after(server);
                }
                Err(err) => return Err(err),
            }
        }

        self.leader = None;
        warn!("no leader found after {} attempts", self.max_attempts);
        Err(Error::NoLeader {
            attempts: self.max_attempts,
        })
    }

    fn after(&self, server: NodeId) -> Option<NodeId> {
        let position = self.servers.iter().position(|s| *s == server);
        let next = position.map_or(0, |p| (p + 1) % self.servers.len());
        self.servers.get(next).copied()
    }
}
