//! # timer
//!
//! why: turn the consensus module's schedule/cancel calls into events on its own queue
//! relations: ThreadTimer implements raft_core::Timer; fired timers land in server.rs as Event::Timer
//! what: TimerService (background thread), ThreadTimer (handle given to the module)
//!
//! Each arming gets a generation number. A timer that fires just before being
//! re-armed or cancelled is recognised as stale when its event is dequeued.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};

use raft_core::{NodeId, Result, Timer, TimerEvent, TimerId};

use crate::event::Event;

#[derive(Debug)]
enum Command {
    Schedule {
        event: TimerEvent,
        generation: u64,
        deadline: Instant,
    },
    Cancel(TimerId),
    Stop,
}

#[derive(Debug, Default)]
struct Generations {
    next: u64,
    armed: BTreeMap<TimerId, u64>,
}

/// Owns the timer thread of one node
#[derive(Debug)]
pub struct TimerService {
    timer: ThreadTimer,
    thread: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Start the timer thread; fired timers are sent to `events`
    pub fn start(id: NodeId, events: Sender<Event>) -> Result<Self> {
        let (commands, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name(format!("raft-timer-{}", id))
            .spawn(move || run(receiver, events))?;
        Ok(Self {
            timer: ThreadTimer {
                commands,
                generations: Arc::default(),
            },
            thread: Some(thread),
        })
    }

    pub fn timer(&self) -> ThreadTimer {
        self.timer.clone()
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.timer.commands.send(Command::Stop);
            let _ = thread.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Timer capability backed by a TimerService
#[derive(Debug, Clone)]
pub struct ThreadTimer {
    commands: Sender<Command>,
    generations: Arc<Mutex<Generations>>,
}

impl ThreadTimer {
    fn generations(&self) -> MutexGuard<'_, Generations> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a fired `event` is still the live arming; consumes it if so
    pub fn claim(&self, event: &TimerEvent, generation: u64) -> bool {
        let mut generations = self.generations();
        if generations.armed.get(&event.id()) == Some(&generation) {
            generations.armed.remove(&event.id());
            true
        } else {
            false
        }
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, event: TimerEvent, delay: Duration) {
        let generation = {
            let mut generations = self.generations();
            generations.next += 1;
            let generation = generations.next;
            generations.armed.insert(event.id(), generation);
            generation
        };
        let _ = self.commands.send(Command::Schedule {
            event,
            generation,
            deadline: Instant::now() + delay,
        });
    }

    fn cancel(&self, timer: TimerId) {
        self.generations().armed.remove(&timer);
        let _ = self.commands.send(Command::Cancel(timer));
    }
}

fn run(commands: Receiver<Command>, events: Sender<Event>) {
    let mut armed: BTreeMap<TimerId, (Instant, TimerEvent, u64)> = BTreeMap::new();
    loop {
        let now = Instant::now();
        let due: Vec<TimerId> = armed
            .iter()
            .filter(|(_, (deadline, _, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some((_, event, generation)) = armed.remove(&id) {
                trace!("timer {:?} fired (generation {})", event, generation);
                if events.send(Event::Timer { event, generation }).is_err() {
                    return;
                }
            }
        }

        let next = armed.values().map(|(deadline, _, _)| *deadline).min();
        let command = match next {
            Some(deadline) => commands.recv_deadline(deadline),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match command {
            Ok(Command::Schedule {
                event,
                generation,
                deadline,
            }) => {
                armed.insert(event.id(), (deadline, event, generation));
            }
            Ok(Command::Cancel(timer)) => {
                armed.remove(&timer);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("timer thread stopped");
}
