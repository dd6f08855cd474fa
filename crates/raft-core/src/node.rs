//! # node
//!
//! why: implement leader election, log replication, commit advancement and membership change
//! relations: drives a RaftLog (log.rs), a Timer, a Transport and a StateMachine; reads configuration.rs
//! what: ConsensusModule, the per-node protocol state and every timer/rpc/client handler
//!
//! Every method here must run on the node's single serialized context. Other threads
//! observe the node through the shared `NodeStatus` only.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::configuration::{ClusterConfiguration, ConfigurationHistory, ConfigurationState};
use crate::log::{EntryPayload, LogEntry, LogMetadata, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{NodeStatus, Progress, Role, RoleState};
use crate::state_machine::StateMachine;
use crate::timer::{Timer, TimerEvent, TimerId};
use crate::transport::Transport;
use crate::{Error, NodeId, RaftConfig, Result, Term};

/// Callback completing a membership change, invoked from the serialized context
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

struct PendingReconfiguration {
    term: Term,
    target: BTreeSet<NodeId>,
    /// log size when the change was requested; the final configuration lands at or after it
    started_at: u64,
    on_complete: Completion,
}

/// One node's view of the protocol
pub struct ConsensusModule<L, T, C, S> {
    id: NodeId,
    config: RaftConfig,
    log: L,
    timer: T,
    transport: C,
    state_machine: S,
    rng: StdRng,

    term: Term,
    voted_for: Option<NodeId>,
    role: RoleState,
    commit_index: Option<u64>,
    last_applied: Option<u64>,
    configuration: ConfigurationHistory,

    election_timeout: Duration,
    /// votes are refused until this instant because a leader was heard from recently
    lease_deadline: Option<Instant>,
    pending: Option<PendingReconfiguration>,
    status: Arc<NodeStatus>,
}

impl<L, T, C, S> fmt::Debug for ConsensusModule<L, T, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusModule")
            .field("id", &self.id)
            .field("term", &self.term)
            .field("role", &self.role.role())
            .field("voted_for", &self.voted_for)
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .finish()
    }
}

impl<L, T, C, S> ConsensusModule<L, T, C, S>
where
    L: RaftLog,
    T: Timer,
    C: Transport,
    S: StateMachine,
{
    /// Restore term, vote and membership from `log`
    ///
    /// Nothing is armed or sent until [`init`](Self::init).
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        log: L,
        timer: T,
        transport: C,
        state_machine: S,
    ) -> Result<Self> {
        config.validate()?;

        let metadata = log.metadata().unwrap_or_default();
        let mut configuration = ConfigurationHistory::new();
        for index in 0..log.log_size() {
            if let EntryPayload::Configuration { prev, next } = log.entry(index)?.payload {
                configuration.insert(index, prev, next);
            }
        }
        if configuration.is_configured() {
            debug!(
                "node {} restored cluster configuration with id {}",
                id,
                configuration.active().id
            );
        }

        let status = Arc::new(NodeStatus::new(id));
        status.set_term(metadata.term);

        Ok(Self {
            id,
            election_timeout: Duration::from_millis(config.election_timeout_max),
            config,
            log,
            timer,
            transport,
            state_machine,
            rng: StdRng::from_entropy(),
            term: metadata.term,
            voted_for: metadata.vote,
            role: RoleState::Follower { leader: None },
            commit_index: None,
            last_applied: None,
            configuration,
            lease_deadline: None,
            pending: None,
            status,
        })
    }

    /// Replace the source of election-timeout randomness
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.commit_index
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// The leader this node currently believes in
    pub fn leader(&self) -> Option<NodeId> {
        match &self.role {
            RoleState::Follower { leader } => *leader,
            RoleState::Leader { .. } => Some(self.id),
            RoleState::Candidate { .. } | RoleState::Dead => None,
        }
    }

    pub fn configuration(&self) -> &ClusterConfiguration {
        self.configuration.active()
    }

    /// Votes collected so far, while a candidate
    pub fn votes(&self) -> Option<&BTreeSet<NodeId>> {
        match &self.role {
            RoleState::Candidate { votes } => Some(votes),
            _ => None,
        }
    }

    /// Replication progress for `peer`, while leader
    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        match &self.role {
            RoleState::Leader { progress } => progress.get(&peer).copied(),
            _ => None,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Scalars other threads may read
    pub fn status(&self) -> Arc<NodeStatus> {
        Arc::clone(&self.status)
    }

    // -- lifecycle --

    /// Open peer connections and arm the election timer
    pub fn init(&mut self) -> Result<()> {
        if self.role() == Role::Dead {
            return Err(Error::Cancelled);
        }
        self.connect_peers();
        self.schedule_election();
        info!(
            "node {} initialized at term {} with {} entries",
            self.id,
            self.term,
            self.log.log_size()
        );
        Ok(())
    }

    /// Seed a brand-new node with the initial cluster membership
    pub fn bootstrap(&mut self, mut members: BTreeSet<NodeId>) -> Result<()> {
        if self.role() == Role::Dead {
            return Err(Error::Cancelled);
        }
        if self.term != 0 || self.log.log_size() != 0 || self.configuration.is_configured() {
            error!(
                "node {} already has durable state, cannot override cluster configuration",
                self.id
            );
            return Err(Error::AlreadyBootstrapped);
        }
        members.insert(self.id);
        info!("node {} bootstrapping cluster {:?}", self.id, members);
        self.append_local(&[LogEntry::configuration(0, members, BTreeSet::new())])?;
        self.schedule_election();
        Ok(())
    }

    /// Cancel both timers and freeze the node; terminal
    pub fn shutdown(&mut self) {
        if self.role() == Role::Dead {
            return;
        }
        self.timer.cancel(TimerId::Election);
        self.timer.cancel(TimerId::Heartbeat);
        if let Some(pending) = self.pending.take() {
            (pending.on_complete)(Err(Error::Cancelled));
        }
        self.role = RoleState::Dead;
        self.status.set_role(Role::Dead);
        self.status.set_leader(None);
        info!("node {} shut down", self.id);
    }

    // -- timers --

    /// Election timer fired for the timer armed in `term`
    pub fn election_timeout(&mut self, term: Term) -> Result<()> {
        if !matches!(self.role(), Role::Follower | Role::Candidate) {
            debug!("node {} ignoring election timeout as {}", self.id, self.role());
            return Ok(());
        }
        if term != self.term {
            debug!("node {} ignoring stale election timer from term {}", self.id, term);
            return Ok(());
        }
        if !self.configuration.active().contains_voter(self.id) {
            debug!("node {} is not a voting member, not starting an election", self.id);
            return Ok(());
        }

        self.transition(RoleState::Candidate {
            votes: BTreeSet::from([self.id]),
        })?;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.status.set_term(self.term);
        self.persist()?;
        info!("node {} starting election for term {}", self.id, self.term);

        let request = RequestVoteRequest {
            term: self.term,
            candidate_id: self.id,
            last_log_index: self.log.last_log_index(),
            last_log_term: self.log.last_log_term(),
        };
        for peer in self.configuration.active().voters() {
            if peer != self.id {
                debug!("node {} sending RequestVote to {}", self.id, peer);
                self.transport.request_vote(peer, request.clone());
            }
        }

        // a split vote restarts the election when this fires again
        self.schedule_election();

        if self
            .configuration
            .active()
            .check_quorum(&BTreeSet::from([self.id]))
        {
            self.promote()?;
        }
        Ok(())
    }

    /// Heartbeat timer fired
    pub fn heartbeat_timeout(&mut self) -> Result<()> {
        if self.role() != Role::Leader {
            debug!("node {} ignoring heartbeat timer as {}", self.id, self.role());
            return Ok(());
        }
        self.broadcast_append_entries()?;
        self.timer
            .schedule(TimerEvent::Heartbeat, self.config.heartbeat());
        Ok(())
    }

    // -- RequestVote --

    /// Voter side of RequestVote
    pub fn handle_request_vote(
        &mut self,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        if self.role() == Role::Dead {
            return Err(Error::Cancelled);
        }

        if let Some(deadline) = self.lease_deadline {
            if self.timer.now() <= deadline {
                debug!(
                    "node {} rejecting RequestVote from {}, heard from a leader recently",
                    self.id, request.candidate_id
                );
                return Ok(RequestVoteResponse {
                    term: self.term,
                    vote_granted: false,
                });
            }
        }

        if request.term > self.term {
            debug!(
                "node {} saw term {} in RequestVote, was {}",
                self.id, request.term, self.term
            );
            self.become_follower(request.term)?;
        }

        let candidate_log = (request.last_log_term, request.last_log_index);
        let local_log = (self.log.last_log_term(), self.log.last_log_index());
        let granted = request.term == self.term
            && self
                .voted_for
                .map_or(true, |vote| vote == request.candidate_id)
            && candidate_log >= local_log;

        if granted {
            self.voted_for = Some(request.candidate_id);
            self.persist()?;
            self.schedule_election();
            info!(
                "node {} granted vote to {} for term {}",
                self.id, request.candidate_id, self.term
            );
        }

        Ok(RequestVoteResponse {
            term: self.term,
            vote_granted: granted,
        })
    }

    /// Candidate side: a voter answered `request`
    pub fn handle_request_vote_reply(
        &mut self,
        peer: NodeId,
        request: &RequestVoteRequest,
        reply: RequestVoteResponse,
    ) -> Result<()> {
        if self.role() == Role::Dead {
            return Ok(());
        }
        if reply.term > self.term {
            debug!(
                "node {} saw term {} in vote reply from {}, was {}",
                self.id, reply.term, peer, self.term
            );
            return self.become_follower(reply.term);
        }
        if request.term != self.term || reply.term != self.term {
            debug!("node {} ignoring stale vote reply from {}", self.id, peer);
            return Ok(());
        }

        let won = match &mut self.role {
            RoleState::Candidate { votes } => {
                if reply.vote_granted {
                    votes.insert(peer);
                }
                self.configuration.active().check_quorum(votes)
            }
            _ => {
                debug!("node {} no longer a candidate, ignoring vote reply", self.id);
                return Ok(());
            }
        };

        if won {
            self.promote()?;
        }
        Ok(())
    }

    // -- AppendEntries --

    /// Follower side of AppendEntries
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.role() == Role::Dead {
            return Err(Error::Cancelled);
        }

        if request.term > self.term {
            debug!(
                "node {} saw term {} in AppendEntries, was {}",
                self.id, request.term, self.term
            );
            self.become_follower(request.term)?;
        }

        let mut success = false;
        if request.term == self.term {
            if self.role() != Role::Follower {
                self.become_follower(self.term)?;
            }
            if let RoleState::Follower { leader } = &mut self.role {
                *leader = Some(request.leader_id);
            }
            self.status.set_leader(Some(request.leader_id));
            success = self.replicate(request)?;
        }

        // disk writes above may have taken a while
        if self.role() != Role::Leader {
            self.schedule_election();
        }
        if request.term == self.term {
            self.lease_deadline = Some(self.timer.now() + self.election_timeout);
        }

        Ok(AppendEntriesResponse {
            term: self.term,
            success,
        })
    }

    /// Leader side: a follower answered `request`
    pub fn handle_append_entries_reply(
        &mut self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        reply: AppendEntriesResponse,
    ) -> Result<()> {
        if self.role() == Role::Dead {
            return Ok(());
        }
        if reply.term > self.term {
            info!(
                "node {} saw term {} in AppendEntries reply from {}, stepping down",
                self.id, reply.term, peer
            );
            return self.become_follower(reply.term);
        }
        if request.term != self.term || reply.term != self.term {
            return Ok(());
        }

        let progress = match &mut self.role {
            RoleState::Leader { progress } => progress,
            _ => return Ok(()),
        };
        let Some(peer_progress) = progress.get_mut(&peer) else {
            return Ok(());
        };

        if reply.success {
            let end = request.end_index();
            let matched = end.checked_sub(1);
            if matched > peer_progress.match_index {
                peer_progress.match_index = matched;
            }
            if end > peer_progress.next_index {
                peer_progress.next_index = end;
            }
            debug!(
                "node {} AppendEntries to {} succeeded: next_index={} match_index={:?}",
                self.id, peer, peer_progress.next_index, peer_progress.match_index
            );
            self.advance_leader_commit()?;
            self.check_sync_progress()?;
        } else {
            // linear back-off, only once per rejected position
            if peer_progress.next_index == request.first_index() && peer_progress.next_index > 0 {
                peer_progress.next_index -= 1;
            }
            debug!(
                "node {} AppendEntries to {} rejected: next_index={}",
                self.id, peer, peer_progress.next_index
            );
        }
        Ok(())
    }

    // -- client operations --

    /// Leader-only read through the state machine
    pub fn client_query(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.ensure_leader()?;
        Ok(self.state_machine.query(command))
    }

    /// Leader-only write; returns the index the command will occupy once committed
    pub fn propose(&mut self, command: Vec<u8>) -> Result<u64> {
        self.ensure_leader()?;
        let range = self.append_local(&[LogEntry::new(self.term, command)])?;
        self.advance_leader_commit()?;
        Ok(range.start)
    }

    /// Committed, stable membership as `(id, members)`
    pub fn get_configuration(&self) -> Result<(u64, BTreeSet<NodeId>)> {
        self.ensure_leader()?;
        let active = self.configuration.active();
        if active.state != ConfigurationState::Stable {
            return Err(Error::ConfigurationNotStable);
        }
        if self.commit_index < Some(active.id) {
            return Err(Error::ConfigurationNotCommitted { id: active.id });
        }
        Ok((active.id, active.prev.clone()))
    }

    /// Begin moving the cluster from configuration `old_id` to `members`
    ///
    /// Returns as soon as the change is accepted. `on_complete` runs later on this
    /// context: `Ok` once the new membership is committed on its own, or an error if the
    /// term changes or the node shuts down first. Callers that want to wait must do so
    /// on a different thread than the one driving this module.
    pub fn set_configuration(
        &mut self,
        old_id: u64,
        members: BTreeSet<NodeId>,
        on_complete: Completion,
    ) -> Result<()> {
        self.ensure_leader()?;
        let active = self.configuration.active();
        if active.id != old_id {
            return Err(Error::StaleConfiguration {
                expected: old_id,
                actual: active.id,
            });
        }
        if active.state != ConfigurationState::Stable || self.pending.is_some() {
            return Err(Error::ConfigurationNotStable);
        }
        if self.commit_index < Some(active.id) {
            return Err(Error::ConfigurationNotCommitted { id: active.id });
        }
        if members.is_empty() {
            return Err(Error::InvalidConfig(
                "new configuration has no members".to_string(),
            ));
        }

        info!(
            "node {} changing configuration {} from {:?} to {:?}",
            self.id, active.id, active.prev, members
        );
        self.pending = Some(PendingReconfiguration {
            term: self.term,
            target: members.clone(),
            started_at: self.log.log_size(),
            on_complete,
        });
        self.configuration.begin_sync(members);
        self.connect_peers();
        self.refresh_progress();
        self.check_sync_progress()
    }

    // -- internals --

    fn ensure_leader(&self) -> Result<()> {
        match self.role() {
            Role::Leader => Ok(()),
            Role::Dead => Err(Error::Cancelled),
            _ => Err(Error::NotLeader {
                leader: self.leader(),
            }),
        }
    }

    /// Apply the transition table; refuses illegal moves without changing anything
    fn transition(&mut self, next: RoleState) -> Result<()> {
        let from = self.role();
        let to = next.role();
        if !from.can_transition_to(to) {
            warn!("node {} refused illegal transition {} -> {}", self.id, from, to);
            return Err(Error::IllegalTransition { from, to });
        }
        self.role = next;
        self.status.set_role(to);
        self.status.set_leader(self.leader());
        if from != to {
            info!("node {} {} -> {} in term {}", self.id, from, to, self.term);
        }
        Ok(())
    }

    /// Step down to follower at `term`; the vote is only forgotten when the term moves
    fn become_follower(&mut self, term: Term) -> Result<()> {
        debug_assert!(term >= self.term, "term must never decrease");
        let was_leader = self.role() == Role::Leader;
        self.transition(RoleState::Follower { leader: None })?;

        let previous = self.term;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.status.set_term(term);
        }
        self.timer.cancel(TimerId::Heartbeat);

        if was_leader {
            self.configuration.abort_sync();
        }
        if let Some(pending) = self.pending.take() {
            (pending.on_complete)(Err(Error::TermChanged { from: previous }));
        }

        self.persist()?;
        self.schedule_election();
        Ok(())
    }

    fn promote(&mut self) -> Result<()> {
        self.transition(RoleState::Leader {
            progress: Default::default(),
        })?;
        self.refresh_progress();
        self.timer.cancel(TimerId::Election);
        info!("node {} won election for term {}", self.id, self.term);

        // earlier entries, and an unfinished joint phase, only commit under a current-term entry
        self.append_active_configuration()?;
        if self.role() != Role::Leader {
            return Ok(());
        }
        self.broadcast_append_entries()?;
        self.timer
            .schedule(TimerEvent::Heartbeat, self.config.heartbeat());
        Ok(())
    }

    /// Re-append the active membership at the current term
    fn append_active_configuration(&mut self) -> Result<()> {
        if !self.configuration.is_configured() {
            return Ok(());
        }
        let active = self.configuration.active();
        let next = match active.state {
            ConfigurationState::Joint => active.next.clone(),
            ConfigurationState::Stable | ConfigurationState::Sync => BTreeSet::new(),
        };
        let entry = LogEntry::configuration(self.term, active.prev.clone(), next);
        debug!(
            "node {} re-appending configuration {} at term {}",
            self.id, active.id, self.term
        );
        self.append_local(&[entry])?;
        self.advance_leader_commit()
    }

    /// Keep one progress record per replication target
    fn refresh_progress(&mut self) {
        let active = self.configuration.active();
        let mut targets = active.replication_targets();
        targets.remove(&self.id);
        let joining = active.joining();
        let log_size = self.log.log_size();

        if let RoleState::Leader { progress } = &mut self.role {
            progress.retain(|peer, _| targets.contains(peer));
            for peer in targets {
                // new servers most likely have nothing; start them from the beginning
                let next_index = if joining.contains(&peer) { 0 } else { log_size };
                progress.entry(peer).or_insert(Progress {
                    next_index,
                    match_index: None,
                });
            }
        }
    }

    fn connect_peers(&self) {
        let mut servers = self.configuration.active().replication_targets();
        servers.remove(&self.id);
        if !servers.is_empty() {
            self.transport.connect(&servers);
        }
    }

    fn broadcast_append_entries(&mut self) -> Result<()> {
        let requests = match &self.role {
            RoleState::Leader { progress } => progress
                .iter()
                .map(|(peer, p)| Ok((*peer, self.build_append_entries(p.next_index)?)))
                .collect::<Result<Vec<_>>>()?,
            _ => return Ok(()),
        };
        for (peer, request) in requests {
            debug!(
                "node {} sending AppendEntries to {} with {} entries",
                self.id,
                peer,
                request.entries.len()
            );
            self.transport.append_entries(peer, request);
        }
        Ok(())
    }

    fn build_append_entries(&self, next_index: u64) -> Result<AppendEntriesRequest> {
        let log_size = self.log.log_size();
        let next = next_index.min(log_size);
        let prev_log_index = next.checked_sub(1);
        let prev_log_term = match prev_log_index {
            Some(index) => Some(self.log.entry(index)?.term),
            None => None,
        };
        Ok(AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries(next, log_size)?,
            leader_commit: self.commit_index,
        })
    }

    /// Consistency check, conflict truncation, append and follower commit
    fn replicate(&mut self, request: &AppendEntriesRequest) -> Result<bool> {
        let consistent = match request.prev_log_index {
            None => true,
            Some(prev) => {
                prev < self.log.log_size() && Some(self.log.entry(prev)?.term) == request.prev_log_term
            }
        };
        if !consistent {
            debug!(
                "node {} log does not match leader at {:?}",
                self.id, request.prev_log_index
            );
            return Ok(false);
        }

        let mut index = request.first_index();
        let mut offset = 0;
        while index < self.log.log_size() && offset < request.entries.len() {
            if self.log.entry(index)?.term == request.entries[offset].term {
                index += 1;
                offset += 1;
                continue;
            }
            if self.commit_index >= Some(index) {
                error!(
                    "node {} refusing to truncate committed entry {} (commit index {:?})",
                    self.id, index, self.commit_index
                );
                return Ok(false);
            }
            info!("node {} truncating log from index {}", self.id, index);
            if let Err(err) = self.log.truncate_suffix(index) {
                return Err(self.fail(err));
            }
            self.configuration.truncate_suffix(index);
            break;
        }

        if offset < request.entries.len() {
            self.append_local(&request.entries[offset..])?;
        }

        if request.leader_commit > self.commit_index {
            let last_new_entry = request.end_index().checked_sub(1);
            let commit = request.leader_commit.min(last_new_entry);
            if commit > self.commit_index {
                debug!("node {} setting commit index {:?}", self.id, commit);
                self.set_commit_index(commit);
                self.apply_committed()?;
            }
        }
        Ok(true)
    }

    /// Append to the durable log and install any configuration entries
    fn append_local(&mut self, entries: &[LogEntry]) -> Result<Range<u64>> {
        let range = match self.log.append(entries) {
            Ok(range) => range,
            Err(err) => return Err(self.fail(err)),
        };

        let mut reconfigured = false;
        for (index, entry) in range.clone().zip(entries) {
            if let EntryPayload::Configuration { prev, next } = &entry.payload {
                self.configuration.insert(index, prev.clone(), next.clone());
                reconfigured = true;
            }
        }
        if reconfigured {
            self.connect_peers();
            self.refresh_progress();
        }
        Ok(range)
    }

    /// Highest current-term index held by a quorum becomes committed
    fn advance_leader_commit(&mut self) -> Result<()> {
        let RoleState::Leader { progress } = &self.role else {
            return Ok(());
        };
        let active = self.configuration.active();
        let start = self.commit_index.map_or(0, |index| index + 1);

        let mut commit = self.commit_index;
        for index in (start..self.log.log_size()).rev() {
            // earlier-term entries only commit by being carried under a current-term one
            if self.log.entry(index)?.term != self.term {
                break;
            }
            let mut holders = BTreeSet::from([self.id]);
            holders.extend(
                progress
                    .iter()
                    .filter(|(_, p)| p.match_index >= Some(index))
                    .map(|(peer, _)| *peer),
            );
            if active.check_quorum(&holders) {
                commit = Some(index);
                break;
            }
        }

        if commit > self.commit_index {
            debug!("node {} leader commit index {:?}", self.id, commit);
            self.set_commit_index(commit);
            self.apply_committed()?;
            self.after_commit()?;
        }
        Ok(())
    }

    /// Continue a membership change once its latest step is committed
    fn after_commit(&mut self) -> Result<()> {
        let active = self.configuration.active().clone();
        if !self.configuration.is_configured() || self.commit_index < Some(active.id) {
            return Ok(());
        }

        match active.state {
            ConfigurationState::Joint => {
                info!(
                    "node {} joint configuration {} committed, moving to {:?}",
                    self.id, active.id, active.next
                );
                self.append_local(&[LogEntry::configuration(
                    self.term,
                    active.next.clone(),
                    BTreeSet::new(),
                )])?;
                self.advance_leader_commit()?;
            }
            ConfigurationState::Stable => {
                let finished = self.pending.as_ref().map_or(false, |pending| {
                    active.id >= pending.started_at && pending.target == active.prev
                });
                if finished {
                    if let Some(pending) = self.pending.take() {
                        info!("node {} configuration {} committed", self.id, active.id);
                        (pending.on_complete)(Ok(()));
                    }
                }
                if !active.contains_voter(self.id) && self.role() == Role::Leader {
                    info!(
                        "node {} not part of committed configuration {}, stepping down",
                        self.id, active.id
                    );
                    self.become_follower(self.term)?;
                }
            }
            ConfigurationState::Sync => {}
        }
        Ok(())
    }

    /// Append the joint entry once every joining server has caught up
    fn check_sync_progress(&mut self) -> Result<()> {
        let active = self.configuration.active();
        if active.state != ConfigurationState::Sync {
            return Ok(());
        }
        let RoleState::Leader { progress } = &self.role else {
            return Ok(());
        };
        let last = self.log.last_log_index();
        let caught_up = active.joining().iter().all(|server| {
            progress
                .get(server)
                .map_or(false, |p| p.match_index >= last)
        });
        if !caught_up {
            return Ok(());
        }

        info!(
            "node {} new servers caught up, entering joint configuration",
            self.id
        );
        let entry = LogEntry::configuration(self.term, active.prev.clone(), active.next.clone());
        self.append_local(&[entry])?;
        self.advance_leader_commit()
    }

    fn apply_committed(&mut self) -> Result<()> {
        let Some(commit) = self.commit_index else {
            return Ok(());
        };
        let start = self.last_applied.map_or(0, |index| index + 1);
        if start > commit {
            return Ok(());
        }
        let entries = self.log.entries(start, commit + 1)?;
        for (index, entry) in (start..).zip(entries.iter()) {
            self.state_machine.apply(index, entry);
        }
        self.last_applied = Some(commit);
        self.status.set_last_applied(self.last_applied);
        Ok(())
    }

    fn set_commit_index(&mut self, index: Option<u64>) {
        self.commit_index = index;
        self.status.set_commit_index(index);
    }

    fn schedule_election(&mut self) {
        self.election_timeout = self.config.random_election_timeout(&mut self.rng);
        self.timer.schedule(
            TimerEvent::Election { term: self.term },
            self.election_timeout,
        );
    }

    fn persist(&mut self) -> Result<()> {
        let metadata = LogMetadata {
            term: self.term,
            vote: self.voted_for,
        };
        match self.log.set_metadata(metadata) {
            Ok(()) => {
                debug!(
                    "node {} persisted term {} vote {:?}",
                    self.id, self.term, self.voted_for
                );
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Durability faults end the node
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            error!("node {} hit a durability fault, shutting down: {}", self.id, err);
            self.shutdown();
        }
        err
    }
}
