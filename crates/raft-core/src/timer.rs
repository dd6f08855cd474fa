//! # timer
//!
//! why: let the consensus module arm and cancel its timers without owning the timer machinery
//! relations: implemented by raft-node's TimerService and by testing::ManualTimer
//! what: TimerId, TimerEvent, Timer capability trait

use std::time::{Duration, Instant};

use crate::Term;

/// The two timers a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    Election,
    Heartbeat,
}

/// What a timer delivers back to the node when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Election timeout armed while the node was in `term`
    Election { term: Term },
    Heartbeat,
}

impl TimerEvent {
    pub fn id(&self) -> TimerId {
        match self {
            TimerEvent::Election { .. } => TimerId::Election,
            TimerEvent::Heartbeat => TimerId::Heartbeat,
        }
    }
}

/// Scheduling capability handed to the consensus module
///
/// Scheduling a timer that is already armed replaces the pending firing. A fired event
/// must be delivered back into the node's serialized context, never run inline.
pub trait Timer {
    fn schedule(&self, event: TimerEvent, delay: Duration);

    /// Stop a timer; no further firing until it is scheduled again
    fn cancel(&self, timer: TimerId);

    /// Current time as seen by this timer
    fn now(&self) -> Instant {
        Instant::now()
    }
}
