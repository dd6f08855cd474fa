//! # handle
//!
//! why: let application threads call into a node without touching its event loop
//! relations: wraps the event queue of server.rs; LocalClientRpc plugs handles into LeaderProxy
//! what: RaftHandle, LocalClientRpc

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};

use raft_core::{ClientRpc, Error, NodeId, NodeStatus, Result};

use crate::event::Event;

/// Cloneable, thread-safe client of one server
///
/// Every call blocks until the server answers. Calls made after the server stopped
/// fail with `Error::Cancelled`.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: Sender<Event>,
    status: Arc<NodeStatus>,
}

impl RaftHandle {
    pub(crate) fn new(id: NodeId, events: Sender<Event>, status: Arc<NodeStatus>) -> Self {
        Self { id, events, status }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Term, role, commit index and leader hint, read without a round trip
    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub(crate) fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    fn call<T>(&self, event: impl FnOnce(Sender<Result<T>>) -> Event) -> Result<T> {
        let (respond, response) = bounded(1);
        if !self.send(event(respond)) {
            return Err(Error::Cancelled);
        }
        response.recv().map_err(|_| Error::Cancelled)?
    }

    /// Give a pristine server its initial membership
    pub fn bootstrap(&self, members: BTreeSet<NodeId>) -> Result<()> {
        self.call(|respond| Event::Bootstrap { members, respond })
    }

    pub fn client_query(&self, command: &[u8]) -> Result<Vec<u8>> {
        let command = command.to_vec();
        self.call(|respond| Event::ClientQuery { command, respond })
    }

    /// Append a command on the leader; returns its log index, not its commit
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        self.call(|respond| Event::Propose { command, respond })
    }

    pub fn get_configuration(&self) -> Result<(u64, BTreeSet<NodeId>)> {
        self.call(|respond| Event::GetConfiguration { respond })
    }

    /// Change membership from configuration `old_id` to `members`
    ///
    /// Waits for the whole change: syncing new servers, the joint phase and the commit
    /// of the final configuration.
    pub fn set_configuration(&self, old_id: u64, members: BTreeSet<NodeId>) -> Result<()> {
        self.call(|respond| Event::SetConfiguration {
            old_id,
            members,
            respond,
        })
    }
}

/// ClientRpc over in-process handles, for driving a LeaderProxy
#[derive(Debug, Clone, Default)]
pub struct LocalClientRpc {
    handles: BTreeMap<NodeId, RaftHandle>,
}

impl LocalClientRpc {
    pub fn new(handles: impl IntoIterator<Item = RaftHandle>) -> Self {
        Self {
            handles: handles.into_iter().map(|h| (h.id(), h)).collect(),
        }
    }

    pub fn insert(&mut self, handle: RaftHandle) {
        self.handles.insert(handle.id(), handle);
    }

    pub fn servers(&self) -> Vec<NodeId> {
        self.handles.keys().copied().collect()
    }
}

impl ClientRpc for LocalClientRpc {
    fn client_query(&self, server: NodeId, command: &[u8]) -> Result<Vec<u8>> {
        match self.handles.get(&server) {
            Some(handle) => handle.client_query(command),
            None => Err(Error::Cancelled),
        }
    }
}
