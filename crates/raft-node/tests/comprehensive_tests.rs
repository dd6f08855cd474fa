//! # comprehensive node tests
//!
//! why: verify real servers on threads, timers and disks agree on one log
//! relations: spawns raft-node servers over raft-storage logs in temporary directories
//! what: election, replication, client routing, membership change, failover, restart

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use raft_core::{Error, LeaderProxy, LogEntry, NodeId, RaftConfig, Result, Role, StateMachine};
use raft_node::{LocalClientRpc, LocalNetwork, NodeConfig, RaftHandle, RaftServer};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn set(ids: &[NodeId]) -> BTreeSet<NodeId> {
    ids.iter().copied().collect()
}

/// Records applied commands; queries answer with how many were applied
#[derive(Debug, Clone, Default)]
struct Journal {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Journal {
    fn commands(&self) -> Vec<Vec<u8>> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateMachine for Journal {
    fn apply(&mut self, _index: u64, entry: &LogEntry) {
        if let Some(command) = entry.command() {
            self.commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(command.to_vec());
        }
    }

    fn query(&mut self, _command: &[u8]) -> Vec<u8> {
        self.commands().len().to_string().into_bytes()
    }
}

struct Member {
    server: RaftServer,
    journal: Journal,
    config: NodeConfig,
}

/// In-process cluster; each member keeps its own data directory
struct Cluster {
    root: TempDir,
    network: LocalNetwork,
    members: Vec<Member>,
}

fn config_for(root: &TempDir, id: NodeId) -> NodeConfig {
    let mut config = NodeConfig::new(id, root.path().join(format!("node-{}", id)));
    // wide enough that loaded test machines do not trigger spurious elections
    config.raft = RaftConfig {
        election_timeout_min: 300,
        election_timeout_max: 600,
        heartbeat_interval: 50,
    };
    config
}

impl Cluster {
    fn new() -> Self {
        init_logging();
        Self {
            root: TempDir::new().unwrap(),
            network: LocalNetwork::new(),
            members: Vec::new(),
        }
    }

    /// Spawn and bootstrap servers `ids` as the initial membership
    fn bootstrapped(ids: &[NodeId]) -> Self {
        let mut cluster = Self::new();
        for &id in ids {
            cluster.spawn(id);
        }
        for member in &cluster.members {
            member.server.handle().bootstrap(set(ids)).unwrap();
        }
        cluster
    }

    fn spawn(&mut self, id: NodeId) -> RaftHandle {
        let config = config_for(&self.root, id);
        let journal = Journal::default();
        let server =
            RaftServer::spawn(config.clone(), self.network.clone(), journal.clone()).unwrap();
        let handle = server.handle();
        self.members.push(Member {
            server,
            journal,
            config,
        });
        handle
    }

    /// Stop server `id` and start it again from its data directory
    fn restart(&mut self, id: NodeId) -> RaftHandle {
        let position = self.position(id);
        let member = self.members.remove(position);
        let config = member.config.clone();
        drop(member);

        let journal = Journal::default();
        let server =
            RaftServer::spawn(config.clone(), self.network.clone(), journal.clone()).unwrap();
        let handle = server.handle();
        self.members.push(Member {
            server,
            journal,
            config,
        });
        handle
    }

    fn position(&self, id: NodeId) -> usize {
        self.members
            .iter()
            .position(|m| m.server.id() == id)
            .unwrap()
    }

    fn handle(&self, id: NodeId) -> RaftHandle {
        self.members[self.position(id)].server.handle()
    }

    fn journal(&self, id: NodeId) -> Journal {
        self.members[self.position(id)].journal.clone()
    }

    fn handles(&self) -> Vec<RaftHandle> {
        self.members.iter().map(|m| m.server.handle()).collect()
    }

    fn leaders(&self, among: &[NodeId]) -> Vec<NodeId> {
        among
            .iter()
            .copied()
            .filter(|&id| self.handle(id).status().role() == Role::Leader)
            .collect()
    }

    /// Wait until exactly one of `among` leads and the rest follow it
    fn await_leader(&self, among: &[NodeId]) -> NodeId {
        let mut leader = None;
        wait_for("a single agreed leader", || {
            let leaders = self.leaders(among);
            if leaders.len() != 1 {
                return false;
            }
            let candidate = leaders[0];
            let agreed = among
                .iter()
                .all(|&id| id == candidate || self.handle(id).status().leader() == Some(candidate));
            if agreed {
                leader = Some(candidate);
            }
            agreed
        });
        leader.unwrap()
    }

    /// Propose on whoever leads `among`, retrying across leadership changes
    fn propose(&self, among: &[NodeId], command: &[u8]) -> u64 {
        let mut index = None;
        wait_for("an accepted proposal", || {
            let leader = self.await_leader(among);
            match self.handle(leader).propose(command.to_vec()) {
                Ok(i) => {
                    index = Some(i);
                    true
                }
                Err(err) if err.is_retryable() => false,
                Err(err) => panic!("proposal failed: {}", err),
            }
        });
        index.unwrap()
    }

    fn await_applied(&self, ids: &[NodeId], index: u64) {
        wait_for("entries applied everywhere", || {
            ids.iter()
                .all(|&id| self.handle(id).status().last_applied() >= Some(index))
        });
    }

    /// Retry a leader operation until it stops being rejected as transient
    fn on_leader<T>(&self, among: &[NodeId], op: impl Fn(&RaftHandle) -> Result<T>) -> T {
        let mut outcome = None;
        wait_for("a leader operation", || {
            let leader = self.await_leader(among);
            match op(&self.handle(leader)) {
                Ok(value) => {
                    outcome = Some(value);
                    true
                }
                Err(err) if err.is_retryable() => false,
                Err(err) => panic!("leader operation failed: {}", err),
            }
        });
        outcome.unwrap()
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// SECTION 1: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn bootstrapped_cluster_elects_one_leader() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let leader = cluster.await_leader(&[1, 2, 3]);

        let term = cluster.handle(leader).status().term();
        assert!(term >= 1);
        for id in [1, 2, 3] {
            assert_eq!(cluster.handle(id).status().term(), term);
        }
    }

    #[test]
    fn single_server_leads_itself() {
        let cluster = Cluster::bootstrapped(&[1]);
        assert_eq!(cluster.await_leader(&[1]), 1);
    }

    #[test]
    fn pristine_server_stays_passive() {
        let mut cluster = Cluster::new();
        let handle = cluster.spawn(1);
        thread::sleep(Duration::from_millis(800));
        assert_eq!(handle.status().role(), Role::Follower);
        assert_eq!(handle.status().term(), 0);
        assert!(matches!(
            handle.propose(b"x".to_vec()),
            Err(Error::NotLeader { leader: None })
        ));
    }

    #[test]
    fn isolated_leader_is_replaced() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let old = cluster.await_leader(&[1, 2, 3]);
        let old_term = cluster.handle(old).status().term();

        cluster.network.isolate(old);
        let rest: Vec<NodeId> = [1, 2, 3].into_iter().filter(|&id| id != old).collect();
        let new = cluster.await_leader(&rest);
        assert_ne!(new, old);
        assert!(cluster.handle(new).status().term() > old_term);

        cluster.network.heal(old);
        wait_for("the old leader to follow", || {
            cluster.handle(old).status().role() == Role::Follower
                && cluster.handle(old).status().leader().is_some()
        });
    }
}

// =============================================================================
// SECTION 2: REPLICATION TESTS
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn proposals_apply_in_order_everywhere() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let mut last = 0;
        for command in [b"a", b"b", b"c"] {
            last = cluster.propose(&[1, 2, 3], command);
        }
        cluster.await_applied(&[1, 2, 3], last);

        let expected = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        for id in [1, 2, 3] {
            assert_eq!(cluster.journal(id).commands(), expected);
        }
    }

    #[test]
    fn followers_refuse_client_calls() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let leader = cluster.await_leader(&[1, 2, 3]);
        let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();

        match cluster.handle(follower).client_query(b"count") {
            Err(Error::NotLeader { leader: hint }) => assert_eq!(hint, Some(leader)),
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[test]
    fn minority_cannot_commit() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"first");
        cluster.await_applied(&[1, 2, 3], index);

        let leader = cluster.await_leader(&[1, 2, 3]);
        for id in [1, 2, 3] {
            if id != leader {
                cluster.network.isolate(id);
            }
        }
        let stranded = cluster.handle(leader).propose(b"lost".to_vec()).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(cluster.handle(leader).status().commit_index() < Some(stranded));
    }
}

// =============================================================================
// SECTION 3: CLIENT ROUTING TESTS
// =============================================================================

mod routing {
    use super::*;

    #[test]
    fn proxy_finds_and_caches_the_leader() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"one");
        cluster.await_applied(&[1, 2, 3], index);
        let leader = cluster.await_leader(&[1, 2, 3]);

        let rpc = LocalClientRpc::new(cluster.handles());
        let mut proxy = LeaderProxy::new(rpc.clone(), rpc.servers());
        assert_eq!(proxy.client_query(b"count").unwrap(), b"1".to_vec());
        assert_eq!(proxy.cached_leader(), Some(leader));
    }

    #[test]
    fn proxy_gives_up_without_a_leader() {
        let mut cluster = Cluster::new();
        let handles = vec![cluster.spawn(1), cluster.spawn(2)];

        let mut proxy = LeaderProxy::new(LocalClientRpc::new(handles), [1, 2]);
        assert!(matches!(
            proxy.client_query(b"count"),
            Err(Error::NoLeader { .. })
        ));
    }
}

// =============================================================================
// SECTION 4: MEMBERSHIP TESTS
// =============================================================================

mod membership {
    use super::*;

    #[test]
    fn new_server_joins_and_catches_up() {
        let mut cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"before");
        cluster.await_applied(&[1, 2, 3], index);
        cluster.spawn(4);

        // read and change on the same leader; a new leader re-appends the membership
        let old_id = cluster.on_leader(&[1, 2, 3], |h| {
            let (old_id, _) = h.get_configuration()?;
            h.set_configuration(old_id, set(&[1, 2, 3, 4]))?;
            Ok(old_id)
        });

        let (new_id, members) = cluster.on_leader(&[1, 2, 3, 4], |h| h.get_configuration());
        assert!(new_id > old_id);
        assert_eq!(members, set(&[1, 2, 3, 4]));

        let index = cluster.propose(&[1, 2, 3, 4], b"after");
        cluster.await_applied(&[1, 2, 3, 4], index);
        assert_eq!(
            cluster.journal(4).commands(),
            vec![b"before".to_vec(), b"after".to_vec()]
        );
    }

    #[test]
    fn configuration_is_readable_before_any_write() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let (id, members) = cluster.on_leader(&[1, 2, 3], |h| h.get_configuration());
        assert!(id >= 1);
        assert_eq!(members, set(&[1, 2, 3]));
    }

    #[test]
    fn stale_configuration_id_is_rejected() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"x");
        cluster.await_applied(&[1, 2, 3], index);

        let (id, _) = cluster.on_leader(&[1, 2, 3], |h| h.get_configuration());
        let leader = cluster.await_leader(&[1, 2, 3]);
        assert!(matches!(
            cluster.handle(leader).set_configuration(id + 1, set(&[1, 2])),
            Err(Error::StaleConfiguration { .. })
        ));
    }

    #[test]
    fn removed_server_is_left_behind() {
        let cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"x");
        cluster.await_applied(&[1, 2, 3], index);

        let leader = cluster.await_leader(&[1, 2, 3]);
        let removed = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
        let remaining: Vec<NodeId> = [1, 2, 3].into_iter().filter(|&id| id != removed).collect();

        cluster.on_leader(&[1, 2, 3], |h| {
            let (old_id, _) = h.get_configuration()?;
            h.set_configuration(old_id, remaining.iter().copied().collect())
        });
        let (_, members) = cluster.on_leader(&remaining, |h| h.get_configuration());
        assert_eq!(members, remaining.iter().copied().collect());

        // the two remaining servers still make progress on their own
        cluster.network.isolate(removed);
        let index = cluster.propose(&remaining, b"y");
        cluster.await_applied(&remaining, index);
    }
}

// =============================================================================
// SECTION 5: RESTART TESTS
// =============================================================================

mod restart {
    use super::*;

    #[test]
    fn restarted_follower_recovers_from_disk() {
        let mut cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let mut last = 0;
        for command in [b"a", b"b"] {
            last = cluster.propose(&[1, 2, 3], command);
        }
        cluster.await_applied(&[1, 2, 3], last);

        let leader = cluster.await_leader(&[1, 2, 3]);
        let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
        let term = cluster.handle(follower).status().term();

        let handle = cluster.restart(follower);
        assert!(handle.status().term() >= term);
        assert!(matches!(
            handle.bootstrap(set(&[1, 2, 3])),
            Err(Error::AlreadyBootstrapped)
        ));

        let index = cluster.propose(&[1, 2, 3], b"c");
        cluster.await_applied(&[1, 2, 3], index);
        assert_eq!(
            cluster.journal(follower).commands(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn whole_cluster_restarts_with_its_log() {
        let mut cluster = Cluster::bootstrapped(&[1, 2, 3]);
        let index = cluster.propose(&[1, 2, 3], b"kept");
        cluster.await_applied(&[1, 2, 3], index);

        for id in [1, 2, 3] {
            cluster.restart(id);
        }
        let index = cluster.propose(&[1, 2, 3], b"more");
        cluster.await_applied(&[1, 2, 3], index);
        for id in [1, 2, 3] {
            assert_eq!(
                cluster.journal(id).commands(),
                vec![b"kept".to_vec(), b"more".to_vec()]
            );
        }
    }

    #[test]
    fn shutdown_cancels_handles() {
        let mut cluster = Cluster::bootstrapped(&[1]);
        let handle = cluster.handle(1);
        cluster.await_leader(&[1]);

        let member = cluster.members.remove(0);
        drop(member);
        assert!(matches!(handle.propose(b"x".to_vec()), Err(Error::Cancelled)));
    }
}
