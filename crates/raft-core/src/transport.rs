//! # transport
//!
//! why: keep the rpc framework outside the consensus engine
//! relations: node.rs sends through Transport; proxy.rs queries through ClientRpc
//! what: Transport (peer rpcs), ClientRpc (client-facing calls)

use std::collections::BTreeSet;

use crate::message::{AppendEntriesRequest, RequestVoteRequest};
use crate::{NodeId, Result};

/// Outbound peer rpcs
///
/// Sends are fire-and-forget. Replies are fed back into the sending node's serialized
/// context as separate events; a lost request or reply is simply never delivered.
pub trait Transport {
    /// Make sure connections exist to every server in `servers`
    fn connect(&self, servers: &BTreeSet<NodeId>);

    fn request_vote(&self, peer: NodeId, request: RequestVoteRequest);

    fn append_entries(&self, peer: NodeId, request: AppendEntriesRequest);
}

/// Client-facing calls against a single server
pub trait ClientRpc {
    /// Run a query on `server`; non-leaders answer `Error::NotLeader`
    fn client_query(&self, server: NodeId, command: &[u8]) -> Result<Vec<u8>>;
}
