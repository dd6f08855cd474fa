//! # testing
//!
//! why: drive a consensus module deterministically, without threads or sockets
//! relations: implements Timer, Transport and StateMachine for tests and simulations
//! what: ManualClock, ManualTimer, RecordingTransport, RecordingStateMachine
//!
//! All handles are cheap clones sharing one underlying state, so a test can keep a
//! handle while the module owns another.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::message::{AppendEntriesRequest, RaftMessage, RequestVoteRequest};
use crate::state_machine::StateMachine;
use crate::timer::{Timer, TimerEvent, TimerId};
use crate::transport::Transport;
use crate::{LogEntry, NodeId};

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<RefCell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Rc::new(RefCell::new(Instant::now())),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Instant {
        *self.now.borrow()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.borrow_mut() += by;
    }

    /// Move forward to `instant`; never moves backwards
    pub fn advance_to(&self, instant: Instant) {
        let mut now = self.now.borrow_mut();
        if instant > *now {
            *now = instant;
        }
    }
}

/// Records armed timers instead of firing them
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    clock: ManualClock,
    armed: Rc<RefCell<BTreeMap<TimerId, (Instant, TimerEvent)>>>,
}

impl ManualTimer {
    /// A timer on its own clock
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer reading a clock shared with other nodes
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            clock,
            armed: Rc::default(),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.armed.borrow().contains_key(&timer)
    }

    /// The event that will fire for `timer`
    pub fn armed(&self, timer: TimerId) -> Option<TimerEvent> {
        self.armed.borrow().get(&timer).map(|(_, event)| *event)
    }

    pub fn deadline(&self, timer: TimerId) -> Option<Instant> {
        self.armed.borrow().get(&timer).map(|(deadline, _)| *deadline)
    }

    /// Disarm `timer` and hand back its event, as if it had just fired
    pub fn fire(&self, timer: TimerId) -> Option<TimerEvent> {
        self.armed.borrow_mut().remove(&timer).map(|(_, event)| event)
    }

    /// Earliest armed deadline and its event, without disarming
    pub fn next_deadline(&self) -> Option<(Instant, TimerEvent)> {
        self.armed
            .borrow()
            .values()
            .min_by_key(|(deadline, _)| *deadline)
            .copied()
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, event: TimerEvent, delay: Duration) {
        let deadline = self.clock.now() + delay;
        self.armed.borrow_mut().insert(event.id(), (deadline, event));
    }

    fn cancel(&self, timer: TimerId) {
        self.armed.borrow_mut().remove(&timer);
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

/// Keeps every outbound rpc for the test to inspect or deliver
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Rc<RefCell<Vec<(NodeId, RaftMessage)>>>,
    connected: Rc<RefCell<BTreeSet<NodeId>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far, as `(destination, message)`
    pub fn take(&self) -> Vec<(NodeId, RaftMessage)> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    pub fn sent(&self) -> Vec<(NodeId, RaftMessage)> {
        self.sent.borrow().clone()
    }

    pub fn connected(&self) -> BTreeSet<NodeId> {
        self.connected.borrow().clone()
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, servers: &BTreeSet<NodeId>) {
        self.connected.borrow_mut().extend(servers.iter().copied());
    }

    fn request_vote(&self, peer: NodeId, request: RequestVoteRequest) {
        self.sent
            .borrow_mut()
            .push((peer, RaftMessage::VoteRequest(request)));
    }

    fn append_entries(&self, peer: NodeId, request: AppendEntriesRequest) {
        self.sent
            .borrow_mut()
            .push((peer, RaftMessage::AppendEntries(request)));
    }
}

/// Remembers what was applied; queries answer with the number of applied entries
#[derive(Debug, Clone, Default)]
pub struct RecordingStateMachine {
    applied: Rc<RefCell<Vec<(u64, LogEntry)>>>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<(u64, LogEntry)> {
        self.applied.borrow().clone()
    }

    /// Commands of applied normal entries, in order
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.applied
            .borrow()
            .iter()
            .filter_map(|(_, entry)| entry.command().map(<[u8]>::to_vec))
            .collect()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, index: u64, entry: &LogEntry) {
        self.applied.borrow_mut().push((index, entry.clone()));
    }

    fn query(&mut self, _command: &[u8]) -> Vec<u8> {
        self.applied.borrow().len().to_string().into_bytes()
    }
}
