//! # server
//!
//! why: give each consensus module a thread of its own and feed it one event at a time
//! relations: owns the module, its TimerService and its PersistedLog; RaftHandle talks to it
//! what: RaftServer (spawn, shutdown), the event loop

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, trace, warn};

use raft_core::{Completion, ConsensusModule, NodeId, Result, StateMachine, TimerEvent};
use raft_storage::PersistedLog;

use crate::config::NodeConfig;
use crate::event::Event;
use crate::handle::RaftHandle;
use crate::network::{LocalNetwork, PeerTransport};
use crate::timer::{ThreadTimer, TimerService};

type Module<S> = ConsensusModule<PersistedLog, ThreadTimer, PeerTransport, S>;

/// A running server: one event-loop thread plus one timer thread
///
/// Dropping the server shuts it down and joins its threads.
#[derive(Debug)]
pub struct RaftServer {
    handle: RaftHandle,
    network: LocalNetwork,
    thread: Option<JoinHandle<()>>,
}

impl RaftServer {
    /// Open the server's log under `config.data_dir`, join `network` and start serving
    ///
    /// A server with no durable state stays passive until it is bootstrapped or a
    /// leader adds it to the cluster.
    pub fn spawn<S>(config: NodeConfig, network: LocalNetwork, state_machine: S) -> Result<Self>
    where
        S: StateMachine + Send + 'static,
    {
        config.validate()?;
        let id = config.id;
        let log = PersistedLog::open(&config.data_dir, config.log.clone())?;

        let (events, queue) = unbounded();
        let timers = TimerService::start(id, events.clone())?;
        let timer = timers.timer();
        let transport = PeerTransport::new(id, network.clone());

        let mut module =
            ConsensusModule::new(id, config.raft.clone(), log, timer.clone(), transport, state_machine)?;
        module.init()?;
        let status = module.status();

        network.register(id, events.clone());
        let event_loop = EventLoop {
            id,
            module,
            timer,
            _timers: timers,
            network: network.clone(),
            queue,
        };
        let thread = match thread::Builder::new()
            .name(format!("raft-node-{}", id))
            .spawn(move || event_loop.run())
        {
            Ok(thread) => thread,
            Err(err) => {
                network.unregister(id);
                return Err(err.into());
            }
        };

        info!("node {} started from {}", id, config.data_dir.display());
        Ok(Self {
            handle: RaftHandle::new(id, events, status),
            network,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> NodeId {
        self.handle.id()
    }

    /// A cloneable client handle to this server
    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    /// Stop the server; pending operations complete with `Error::Cancelled`
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.network.unregister(self.id());
            self.handle.send(Event::Shutdown);
            if thread.join().is_err() {
                error!("node {} event loop panicked", self.id());
            }
        }
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EventLoop<S> {
    id: NodeId,
    module: Module<S>,
    timer: ThreadTimer,
    // stops the timer thread when the loop ends
    _timers: TimerService,
    network: LocalNetwork,
    queue: Receiver<Event>,
}

impl<S: StateMachine> EventLoop<S> {
    fn run(mut self) {
        while let Ok(event) = self.queue.recv() {
            if !self.dispatch(event) {
                break;
            }
        }
        self.module.shutdown();
        info!("node {} stopped", self.id);
    }

    /// Returns false once the loop should stop
    fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::Timer { event, generation } => {
                if !self.timer.claim(&event, generation) {
                    trace!("node {} ignoring superseded {:?}", self.id, event);
                    return true;
                }
                let result = match event {
                    TimerEvent::Election { term } => self.module.election_timeout(term),
                    TimerEvent::Heartbeat => self.module.heartbeat_timeout(),
                };
                self.report("timer", result);
            }
            Event::RequestVote { from, request } => {
                match self.module.handle_request_vote(&request) {
                    Ok(reply) => {
                        self.network.send(
                            self.id,
                            from,
                            Event::RequestVoteReply {
                                from: self.id,
                                request,
                                reply,
                            },
                        );
                    }
                    Err(err) => self.report("request_vote", Err(err)),
                }
            }
            Event::RequestVoteReply {
                from,
                request,
                reply,
            } => {
                let result = self.module.handle_request_vote_reply(from, &request, reply);
                self.report("request_vote reply", result);
            }
            Event::AppendEntries { from, request } => {
                match self.module.handle_append_entries(&request) {
                    Ok(reply) => {
                        self.network.send(
                            self.id,
                            from,
                            Event::AppendEntriesReply {
                                from: self.id,
                                request,
                                reply,
                            },
                        );
                    }
                    Err(err) => self.report("append_entries", Err(err)),
                }
            }
            Event::AppendEntriesReply {
                from,
                request,
                reply,
            } => {
                let result = self
                    .module
                    .handle_append_entries_reply(from, &request, reply);
                self.report("append_entries reply", result);
            }
            Event::Bootstrap { members, respond } => {
                let _ = respond.try_send(self.module.bootstrap(members));
            }
            Event::ClientQuery { command, respond } => {
                let _ = respond.try_send(self.module.client_query(&command));
            }
            Event::Propose { command, respond } => {
                let _ = respond.try_send(self.module.propose(command));
            }
            Event::GetConfiguration { respond } => {
                let _ = respond.try_send(self.module.get_configuration());
            }
            Event::SetConfiguration {
                old_id,
                members,
                respond,
            } => {
                let done = respond.clone();
                let on_complete: Completion = Box::new(move |result| {
                    let _ = done.try_send(result);
                });
                if let Err(err) = self.module.set_configuration(old_id, members, on_complete) {
                    // a completion that already ran wins; try_send drops the second answer
                    let _ = respond.try_send(Err(err));
                }
            }
            Event::Shutdown => return false,
        }
        true
    }

    fn report(&self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                error!("node {} failed handling {}: {}", self.id, what, err)
            }
            Err(err) if err.is_retryable() => {
                debug!("node {} rejected {}: {}", self.id, what, err)
            }
            Err(err) => warn!("node {} could not handle {}: {}", self.id, what, err),
        }
    }
}
