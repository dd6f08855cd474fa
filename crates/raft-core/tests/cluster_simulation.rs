//! # cluster simulation
//!
//! why: check the safety properties under message delay, loss and reordering
//! relations: runs several ConsensusModules on one manual clock through the testing doubles
//! what: discrete-event network, election safety, single vote per term, log matching

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use raft_core::testing::{ManualClock, ManualTimer, RecordingStateMachine, RecordingTransport};
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusModule, MemoryLog, NodeId, RaftConfig,
    RaftLog, RaftMessage, RequestVoteRequest, RequestVoteResponse, Role, TimerEvent, Term,
};

type Node = ConsensusModule<MemoryLog, ManualTimer, RecordingTransport, RecordingStateMachine>;

struct SimNode {
    module: Node,
    timer: ManualTimer,
    transport: RecordingTransport,
    machine: RecordingStateMachine,
    crashed: bool,
}

enum Delivery {
    VoteRequest(RequestVoteRequest),
    VoteReply(RequestVoteRequest, RequestVoteResponse),
    Append(AppendEntriesRequest),
    AppendReply(AppendEntriesRequest, AppendEntriesResponse),
}

struct InFlight {
    at: Instant,
    seq: u64,
    from: NodeId,
    to: NodeId,
    delivery: Delivery,
}

struct Simulation {
    clock: ManualClock,
    nodes: BTreeMap<NodeId, SimNode>,
    network: Vec<InFlight>,
    rng: StdRng,
    drop_rate: f64,
    seq: u64,
    leaders: BTreeMap<Term, NodeId>,
    votes: BTreeMap<(NodeId, Term), NodeId>,
}

impl Simulation {
    fn new(seed: u64, size: u64, drop_rate: f64) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = ManualClock::new();
        let members: BTreeSet<NodeId> = (1..=size).collect();
        let mut nodes = BTreeMap::new();
        for &id in &members {
            let timer = ManualTimer::with_clock(clock.clone());
            let transport = RecordingTransport::new();
            let machine = RecordingStateMachine::new();
            let mut module = ConsensusModule::new(
                id,
                RaftConfig::default(),
                MemoryLog::new(),
                timer.clone(),
                transport.clone(),
                machine.clone(),
            )
            .unwrap()
            .with_rng(StdRng::seed_from_u64(seed * 1000 + id));
            module.bootstrap(members.clone()).unwrap();
            module.init().unwrap();
            nodes.insert(
                id,
                SimNode {
                    module,
                    timer,
                    transport,
                    machine,
                    crashed: false,
                },
            );
        }
        Self {
            clock,
            nodes,
            network: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate,
            seq: 0,
            leaders: BTreeMap::new(),
            votes: BTreeMap::new(),
        }
    }

    fn send(&mut self, from: NodeId, to: NodeId, delivery: Delivery) {
        if self.rng.gen_bool(self.drop_rate) {
            return;
        }
        let delay = Duration::from_millis(self.rng.gen_range(1..=20));
        self.seq += 1;
        self.network.push(InFlight {
            at: self.clock.now() + delay,
            seq: self.seq,
            from,
            to,
            delivery,
        });
    }

    fn collect_outbound(&mut self) {
        let mut outbound = Vec::new();
        for (&id, node) in &self.nodes {
            for (peer, message) in node.transport.take() {
                outbound.push((id, peer, message));
            }
        }
        for (from, to, message) in outbound {
            let delivery = match message {
                RaftMessage::VoteRequest(request) => Delivery::VoteRequest(request),
                RaftMessage::AppendEntries(request) => Delivery::Append(request),
                RaftMessage::VoteResponse(_) | RaftMessage::AppendEntriesResponse(_) => continue,
            };
            self.send(from, to, delivery);
        }
    }

    /// Process the next timer firing or message arrival
    fn step(&mut self) {
        self.collect_outbound();

        let next_message = self
            .network
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| (m.at, m.seq))
            .map(|(i, m)| (i, m.at));
        let next_timer = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.crashed)
            .filter_map(|(&id, node)| node.timer.next_deadline().map(|(at, event)| (at, id, event)))
            .min_by_key(|(at, id, _)| (*at, *id));

        match (next_message, next_timer) {
            (Some((index, at)), Some((timer_at, _, _))) if at <= timer_at => self.deliver(index),
            (Some((index, _)), None) => self.deliver(index),
            (_, Some((at, id, event))) => self.fire(at, id, event),
            (None, None) => panic!("simulation has nothing left to do"),
        }

        self.check_invariants();
    }

    fn fire(&mut self, at: Instant, id: NodeId, event: TimerEvent) {
        self.clock.advance_to(at);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.timer.fire(event.id());
        let _ = match event {
            TimerEvent::Election { term } => node.module.election_timeout(term),
            TimerEvent::Heartbeat => node.module.heartbeat_timeout(),
        };
    }

    fn deliver(&mut self, index: usize) {
        let message = self.network.swap_remove(index);
        self.clock.advance_to(message.at);
        let (from, to) = (message.from, message.to);
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if node.crashed {
            return;
        }

        match message.delivery {
            Delivery::VoteRequest(request) => {
                if let Ok(reply) = node.module.handle_request_vote(&request) {
                    if reply.vote_granted {
                        let previous = self.votes.insert((to, reply.term), request.candidate_id);
                        assert!(
                            previous.map_or(true, |p| p == request.candidate_id),
                            "node {} voted for {:?} and {} in term {}",
                            to,
                            previous,
                            request.candidate_id,
                            reply.term
                        );
                    }
                    self.send(to, from, Delivery::VoteReply(request, reply));
                }
            }
            Delivery::VoteReply(request, reply) => {
                let _ = node.module.handle_request_vote_reply(from, &request, reply);
            }
            Delivery::Append(request) => {
                if let Ok(reply) = node.module.handle_append_entries(&request) {
                    self.send(to, from, Delivery::AppendReply(request, reply));
                }
            }
            Delivery::AppendReply(request, reply) => {
                let _ = node.module.handle_append_entries_reply(from, &request, reply);
            }
        }
    }

    fn check_invariants(&mut self) {
        for (&id, node) in &self.nodes {
            if node.module.role() != Role::Leader {
                continue;
            }
            let term = node.module.term();
            let previous = *self.leaders.entry(term).or_insert(id);
            assert_eq!(previous, id, "two leaders in term {}", term);
        }
    }

    fn run_for(&mut self, duration: Duration) {
        let until = self.clock.now() + duration;
        while self.clock.now() < until {
            self.step();
        }
    }

    fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.crashed && node.module.role() == Role::Leader)
            .max_by_key(|(_, node)| node.module.term())
            .map(|(&id, _)| id)
    }

    fn run_until_leader(&mut self) -> NodeId {
        let deadline = self.clock.now() + Duration::from_secs(10);
        while self.clock.now() < deadline {
            if let Some(id) = self.leader() {
                return id;
            }
            self.step();
        }
        panic!("no leader elected within 10 simulated seconds");
    }

    fn propose(&mut self, command: &[u8]) -> bool {
        let Some(id) = self.leader() else {
            return false;
        };
        self.nodes
            .get_mut(&id)
            .map_or(false, |node| node.module.propose(command.to_vec()).is_ok())
    }

    fn crash(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.module.shutdown();
            node.crashed = true;
        }
    }

    /// Where two logs agree on an entry's term, they agree on everything before it
    fn assert_log_matching(&self) {
        let logs: Vec<_> = self.nodes.values().map(|node| node.module.log()).collect();
        for a in &logs {
            for b in &logs {
                let shared = a.log_size().min(b.log_size());
                for index in (0..shared).rev() {
                    if a.entry(index).unwrap().term == b.entry(index).unwrap().term {
                        assert_eq!(
                            a.entries(0, index + 1).unwrap(),
                            b.entries(0, index + 1).unwrap(),
                            "logs agree at {} but differ before it",
                            index
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Applied sequences of live nodes are prefixes of one another
    fn assert_state_machines_agree(&self) {
        let applied: Vec<_> = self
            .nodes
            .values()
            .filter(|node| !node.crashed)
            .map(|node| node.machine.applied())
            .collect();
        for a in &applied {
            for b in &applied {
                let shared = a.len().min(b.len());
                assert_eq!(a[..shared], b[..shared]);
            }
        }
    }
}

#[test]
fn three_nodes_elect_one_leader_and_keep_it() {
    for seed in 0..5 {
        let mut sim = Simulation::new(seed, 3, 0.0);
        let leader = sim.run_until_leader();
        let term = sim.nodes[&leader].module.term();

        sim.run_for(Duration::from_secs(3));
        assert_eq!(sim.leader(), Some(leader), "seed {}", seed);
        assert_eq!(sim.nodes[&leader].module.term(), term, "seed {}", seed);
        for (&id, node) in &sim.nodes {
            if id != leader {
                assert_eq!(node.module.role(), Role::Follower);
                assert_eq!(node.module.leader(), Some(leader));
            }
        }
    }
}

#[test]
fn election_safety_under_loss() {
    for seed in 0..8 {
        let mut sim = Simulation::new(seed, 5, 0.3);
        sim.run_for(Duration::from_secs(10));
        // invariants are checked after every step; some leader must have emerged
        assert!(!sim.leaders.is_empty(), "seed {}", seed);
    }
}

#[test]
fn replication_converges_despite_loss_and_reordering() {
    for seed in 0..4 {
        let mut sim = Simulation::new(seed, 3, 0.1);
        sim.run_until_leader();

        for i in 0..20u8 {
            sim.propose(&[i]);
            sim.run_for(Duration::from_millis(30));
        }
        sim.assert_log_matching();
        sim.assert_state_machines_agree();

        // a quiet network and one more command settle every log
        sim.drop_rate = 0.0;
        sim.run_for(Duration::from_secs(1));
        for _ in 0..5 {
            sim.run_until_leader();
            sim.propose(b"final");
            sim.run_for(Duration::from_secs(1));
            let settled = sim
                .nodes
                .values()
                .all(|n| n.machine.commands().last() == Some(&b"final".to_vec()));
            if settled {
                break;
            }
        }

        sim.assert_log_matching();
        sim.assert_state_machines_agree();
        let commits: BTreeSet<_> = sim.nodes.values().map(|n| n.module.commit_index()).collect();
        assert_eq!(commits.len(), 1, "seed {}: commit indices {:?}", seed, commits);
        for node in sim.nodes.values() {
            assert_eq!(node.machine.commands().last(), Some(&b"final".to_vec()));
        }
    }
}

#[test]
fn committed_entries_survive_leader_crash() {
    for seed in 0..4 {
        let mut sim = Simulation::new(seed, 5, 0.02);
        sim.run_until_leader();
        for i in 0..5u8 {
            sim.propose(&[i]);
            sim.run_for(Duration::from_millis(40));
        }
        sim.run_for(Duration::from_millis(500));
        let first = sim.run_until_leader();

        let committed = sim.nodes[&first].module.commit_index().expect("something committed");
        let committed_entries = sim.nodes[&first]
            .module
            .log()
            .entries(0, committed + 1)
            .unwrap();
        let old_term = sim.nodes[&first].module.term();

        sim.crash(first);
        let second = sim.run_until_leader();
        assert_ne!(second, first);
        assert!(sim.nodes[&second].module.term() > old_term);

        let new_log = sim.nodes[&second].module.log();
        assert!(new_log.log_size() > committed);
        assert_eq!(new_log.entries(0, committed + 1).unwrap(), committed_entries);
        sim.assert_log_matching();
    }
}
