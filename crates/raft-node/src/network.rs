//! # network
//!
//! why: connect in-process nodes the way a real rpc layer would, including its failures
//! relations: server.rs registers each node's event queue; PeerTransport implements raft_core::Transport
//! what: LocalNetwork, PeerTransport

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::Sender;
use log::{debug, trace};

use raft_core::{AppendEntriesRequest, NodeId, RequestVoteRequest, Transport};

use crate::event::Event;

#[derive(Debug, Default)]
struct Routes {
    nodes: BTreeMap<NodeId, Sender<Event>>,
    isolated: BTreeSet<NodeId>,
}

/// Message fabric shared by every node of an in-process cluster
///
/// Delivery is fire-and-forget: messages to unknown, stopped or isolated nodes vanish.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: NodeId, events: Sender<Event>) {
        self.write().nodes.insert(id, events);
    }

    pub(crate) fn unregister(&self, id: NodeId) {
        self.write().nodes.remove(&id);
    }

    /// Drop all traffic to and from `id` until [`heal`](Self::heal)
    pub fn isolate(&self, id: NodeId) {
        debug!("isolating node {}", id);
        self.write().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        debug!("reconnecting node {}", id);
        self.write().isolated.remove(&id);
    }

    /// Returns whether the message was queued at the destination
    pub(crate) fn send(&self, from: NodeId, to: NodeId, event: Event) -> bool {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        if routes.isolated.contains(&from) || routes.isolated.contains(&to) {
            trace!("dropping message {} -> {}", from, to);
            return false;
        }
        match routes.nodes.get(&to) {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One node's outbound side of the network
#[derive(Debug, Clone)]
pub struct PeerTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl PeerTransport {
    pub fn new(id: NodeId, network: LocalNetwork) -> Self {
        Self { id, network }
    }
}

impl Transport for PeerTransport {
    fn connect(&self, servers: &BTreeSet<NodeId>) {
        // in-process routes exist as soon as a node registers
        debug!("node {} talking to {:?}", self.id, servers);
    }

    fn request_vote(&self, peer: NodeId, request: RequestVoteRequest) {
        self.network.send(
            self.id,
            peer,
            Event::RequestVote {
                from: self.id,
                request,
            },
        );
    }

    fn append_entries(&self, peer: NodeId, request: AppendEntriesRequest) {
        self.network.send(
            self.id,
            peer,
            Event::AppendEntries {
                from: self.id,
                request,
            },
        );
    }
}
