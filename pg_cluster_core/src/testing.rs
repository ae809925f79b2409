//! Test doubles for the external collaborators
//!
//! `SimulatedCluster` models the part of repmgr and the database servers
//! the agent can observe: which nodes run, which role repmgr has recorded
//! and whom each standby follows. `TestCluster` wires in-memory stores and
//! the simulation into `Reconciler`s sharing one topology.

use crate::config::{AgentConfig, NodeEnvironment, Settings};
use crate::database::{AdminSession, DataDirectory, DatabaseControl, FileOwner};
use crate::election::reconcile::{Collaborators, Reconciler};
use crate::endpoints::MemoryServiceStore;
use crate::error::{ClusterError, Result};
use crate::identity::{parse_ordinal, pod_hostname, ExpectedNodeSet};
use crate::replication::{RepmgrCommand, ReplicationTool};
use crate::topology::MemoryLabelStore;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Role repmgr has recorded for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimRole {
    Primary,
    Standby,
}

#[derive(Debug, Clone)]
struct SimNode {
    pod: String,
    node_id: u32,
    data: DataDirectory,
    conf_dir: PathBuf,
    running: bool,
    role: Option<SimRole>,
    upstream: Option<String>,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Keyed by hostname
    nodes: BTreeMap<String, SimNode>,
    calls: Vec<(String, String)>,
    scripted: HashMap<(String, String), VecDeque<i32>>,
}

impl ClusterState {
    fn node_mut(&mut self, pod: &str) -> Option<&mut SimNode> {
        self.nodes.values_mut().find(|n| n.pod == pod)
    }

    fn node(&self, pod: &str) -> Option<&SimNode> {
        self.nodes.values().find(|n| n.pod == pod)
    }

    fn running_at(&self, host: &str) -> Option<String> {
        self.nodes
            .get(host)
            .filter(|n| n.running)
            .map(|n| n.pod.clone())
    }
}

/// Shared simulation of repmgr metadata and database processes
#[derive(Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a node of `app`
    pub fn add_node(&self, app: &str, pod: &str, data_dir: PathBuf, conf_dir: PathBuf) {
        let node = SimNode {
            pod: pod.to_string(),
            node_id: parse_ordinal(pod).map(|i| i + 1).unwrap_or(0),
            data: DataDirectory::new(data_dir),
            conf_dir,
            running: false,
            role: None,
            upstream: None,
        };
        self.lock().nodes.insert(pod_hostname(app, pod), node);
    }

    /// Simulate a crash of `pod`'s database server
    pub fn crash(&self, pod: &str) {
        if let Some(node) = self.lock().node_mut(pod) {
            node.running = false;
        }
    }

    pub fn is_running(&self, pod: &str) -> bool {
        self.lock().node(pod).map(|n| n.running).unwrap_or(false)
    }

    pub fn role(&self, pod: &str) -> Option<SimRole> {
        self.lock().node(pod).and_then(|n| n.role)
    }

    /// Pod `pod` replicates from
    pub fn upstream(&self, pod: &str) -> Option<String> {
        self.lock().node(pod).and_then(|n| n.upstream.clone())
    }

    /// Make the next invocations of `command` (by `RepmgrCommand::name`) on
    /// `pod` exit with `codes`, in order
    pub fn script_exit(&self, pod: &str, command: &str, codes: &[i32]) {
        self.lock()
            .scripted
            .entry((pod.to_string(), command.to_string()))
            .or_default()
            .extend(codes.iter().copied());
    }

    /// Actions performed on `pod`, in order
    pub fn calls(&self, pod: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|(node, _)| node == pod)
            .map(|(_, action)| action.clone())
            .collect()
    }

    pub fn repmgr(&self, pod: &str) -> SimulatedRepmgr {
        SimulatedRepmgr {
            cluster: self.clone(),
            pod: pod.to_string(),
        }
    }

    pub fn database(&self, pod: &str) -> SimulatedDatabase {
        SimulatedDatabase {
            cluster: self.clone(),
            pod: pod.to_string(),
        }
    }
}

fn failed(command: &str) -> ClusterError {
    ClusterError::Command {
        command: command.to_string(),
        code: Some(1),
        retryable: false,
    }
}

/// `DatabaseControl` over the simulation
pub struct SimulatedDatabase {
    cluster: SimulatedCluster,
    pod: String,
}

#[async_trait::async_trait]
impl DatabaseControl for SimulatedDatabase {
    async fn create_cluster(&self) -> Result<()> {
        let mut state = self.cluster.lock();
        state.calls.push((self.pod.clone(), "create_cluster".to_string()));
        let node = state.node_mut(&self.pod).ok_or_else(|| failed("pg_createcluster"))?;
        if node.data.path().exists() {
            return Err(failed("pg_createcluster"));
        }
        node.data.prepare()?;
        fs::write(node.data.path().join("PG_VERSION"), "12\n")?;
        fs::create_dir_all(node.conf_dir.join("conf.d"))?;
        fs::write(node.conf_dir.join("postgresql.conf"), "include_dir = 'conf.d'\n")?;
        fs::write(node.conf_dir.join("pg_hba.conf"), "local all all trust\n")?;
        Ok(())
    }

    async fn has_configuration(&self) -> bool {
        self.cluster
            .lock()
            .node(&self.pod)
            .map(|n| n.conf_dir.join("postgresql.conf").exists())
            .unwrap_or(false)
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.cluster.lock();
        state.calls.push((self.pod.clone(), "start".to_string()));
        let node = state.node_mut(&self.pod).ok_or_else(|| failed("pg_ctlcluster start"))?;
        if node.running || !node.data.path().is_dir() {
            return Err(failed("pg_ctlcluster start"));
        }
        node.running = true;
        Ok(())
    }

    async fn ensure_consistent(&self) -> Result<()> {
        let mut state = self.cluster.lock();
        state.calls.push((self.pod.clone(), "ensure_consistent".to_string()));
        let node = state.node_mut(&self.pod).ok_or_else(|| failed("postgres --single"))?;
        if node.running {
            return Err(failed("postgres --single"));
        }
        node.data.remove_standby_marker()?;
        Ok(())
    }
}

/// `ReplicationTool` over the simulation
pub struct SimulatedRepmgr {
    cluster: SimulatedCluster,
    pod: String,
}

impl SimulatedRepmgr {
    fn execute(state: &mut ClusterState, pod: &str, command: &RepmgrCommand) -> Result<i32> {
        let upstream = command.host().map(|host| state.running_at(host));
        let node_id_target = match command {
            RepmgrCommand::StandbyFollowNode { node_id } => state
                .nodes
                .values()
                .find(|n| n.node_id == *node_id && n.running)
                .map(|n| n.pod.clone()),
            _ => None,
        };
        let node = match state.node_mut(pod) {
            Some(node) => node,
            None => return Ok(1),
        };

        let code = match command {
            RepmgrCommand::PrimaryRegister => {
                if !node.running {
                    return Ok(1);
                }
                node.role = Some(SimRole::Primary);
                node.upstream = None;
                0
            }
            RepmgrCommand::StandbyRegister { .. } | RepmgrCommand::StandbyFollow { .. } => {
                match upstream.flatten() {
                    Some(target) if node.running => {
                        node.role = Some(SimRole::Standby);
                        node.upstream = Some(target);
                        0
                    }
                    _ => 1,
                }
            }
            RepmgrCommand::StandbyClone { .. } => {
                if upstream.flatten().is_none() || node.data.path().exists() {
                    return Ok(1);
                }
                node.data.prepare()?;
                fs::write(node.data.path().join("PG_VERSION"), "12\n")?;
                node.data.write_standby_marker()?;
                0
            }
            RepmgrCommand::NodeRejoin { .. } => match upstream.flatten() {
                Some(target) if !node.running => {
                    node.running = true;
                    node.role = Some(SimRole::Standby);
                    node.upstream = Some(target);
                    node.data.write_standby_marker()?;
                    0
                }
                _ => 24,
            },
            RepmgrCommand::ClusterShow => 0,
            RepmgrCommand::StandbyPromote => {
                if !node.running {
                    return Ok(1);
                }
                node.role = Some(SimRole::Primary);
                node.upstream = None;
                node.data.remove_standby_marker()?;
                0
            }
            RepmgrCommand::StandbyFollowNode { .. } => match node_id_target {
                Some(target) if node.running => {
                    node.upstream = Some(target);
                    0
                }
                _ => 1,
            },
        };
        Ok(code)
    }
}

#[async_trait::async_trait]
impl ReplicationTool for SimulatedRepmgr {
    async fn run(&self, command: &RepmgrCommand) -> Result<Option<i32>> {
        tokio::task::yield_now().await;
        let mut state = self.cluster.lock();
        state.calls.push((self.pod.clone(), command.name().to_string()));

        let key = (self.pod.clone(), command.name().to_string());
        if let Some(code) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(Some(code));
        }
        Self::execute(&mut state, &self.pod, command).map(Some)
    }
}

/// `AdminSession` that records the passwords it was given
#[derive(Clone, Default)]
pub struct RecordingAdmin {
    passwords: Arc<Mutex<Vec<String>>>,
}

impl RecordingAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passwords(&self) -> Vec<String> {
        match self.passwords.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl AdminSession for RecordingAdmin {
    async fn ensure_replication_admin(&self, password: &str) -> Result<()> {
        if let Ok(mut guard) = self.passwords.lock() {
            guard.push(password.to_string());
        }
        Ok(())
    }
}

/// Password written to the credential file of every `TestCluster` node
pub const TEST_PASSWORD: &str = "s3cret";

/// Owner standing in for the database account
///
/// Distinct from the caller when running as root, otherwise the caller,
/// since only root may give files away.
pub fn foreign_owner() -> FileOwner {
    if nix::unistd::Uid::effective().is_root() {
        FileOwner::new(4242, 4242)
    } else {
        FileOwner::current()
    }
}

/// Several nodes of one application sharing in-memory stores and a
/// simulated repmgr, each with its own directory tree under `root`
pub struct TestCluster {
    root: PathBuf,
    app: String,
    expected: String,
    pub labels: Arc<MemoryLabelStore>,
    pub services: Arc<MemoryServiceStore>,
    pub sim: SimulatedCluster,
    pub admin: RecordingAdmin,
}

impl TestCluster {
    /// Create a cluster whose deployment declares `pods`
    pub fn new(root: &Path, app: &str, pods: &[&str]) -> Self {
        let expected = pods
            .iter()
            .filter_map(|pod| parse_ordinal(pod))
            .map(|ordinal| format!("{}/{}", app, ordinal))
            .collect::<Vec<_>>()
            .join(" ");
        let cluster = Self {
            root: root.to_path_buf(),
            app: app.to_string(),
            expected,
            labels: Arc::new(MemoryLabelStore::with_app_pods(app, pods)),
            services: Arc::new(MemoryServiceStore::new()),
            sim: SimulatedCluster::new(),
            admin: RecordingAdmin::new(),
        };
        for pod in pods {
            let config = cluster.config(pod);
            cluster
                .sim
                .add_node(app, pod, config.env.pgdata.clone(), config.pg_conf_dir());
        }
        cluster
    }

    fn node_root(&self, pod: &str) -> PathBuf {
        self.root.join(pod)
    }

    /// Configuration of `pod`, with every path under its own directory
    pub fn config(&self, pod: &str) -> AgentConfig {
        let root = self.node_root(pod);
        let env = NodeEnvironment {
            pod_name: pod.to_string(),
            namespace: "test".to_string(),
            node_name: "worker".to_string(),
            app_name: self.app.clone(),
            expected_units: ExpectedNodeSet::parse(&self.expected),
            hostname: None,
            pgdata: root.join("pgdata/12/main"),
            pg_major: "12".to_string(),
        };

        let mut settings = Settings::default();
        settings.paths.conf_root = root.join("pgconf");
        settings.paths.repmgr_conf = root.join("pgconf/repmgr.conf");
        settings.paths.repmgr_log = root.join("log/repmgr.log");
        settings.paths.credential_file = root.join("secrets/pgsql-admin-password");
        settings.paths.pgpass_files = vec![root.join("home/root/.pgpass"), root.join("home/postgres/.pgpass")];
        settings.paths.mount_dirs = vec![root.join("pgdata"), root.join("pgconf")];
        settings.retry.primary_poll_interval = 1;

        if let Some(parent) = settings.paths.credential_file.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&settings.paths.credential_file, format!("{}\n", TEST_PASSWORD));

        match AgentConfig::new(env, settings) {
            Ok(config) => config,
            Err(e) => panic!("invalid test configuration for {}: {}", pod, e),
        }
    }

    /// A reconciler for `pod` wired to the shared doubles
    pub fn node(&self, pod: &str) -> Reconciler {
        let config = self.config(pod);
        Reconciler::new(
            &config,
            Collaborators {
                labels: self.labels.clone(),
                services: self.services.clone(),
                replication: Arc::new(self.sim.repmgr(pod)),
                database: Arc::new(self.sim.database(pod)),
                admin: Arc::new(self.admin.clone()),
                owner: foreign_owner(),
            },
        )
    }

    /// Pods currently holding the primary marker
    pub async fn primaries(&self) -> Vec<String> {
        self.labels.holders(&self.app).await
    }

    /// Value of the role label on `pod`
    pub async fn role_label(&self, pod: &str) -> Option<String> {
        self.labels
            .pod(pod)
            .await
            .and_then(|p| p.labels.get(crate::topology::ROLE_LABEL).cloned())
    }

    /// Data directory of `pod`
    pub fn data_dir(&self, pod: &str) -> DataDirectory {
        DataDirectory::new(self.config(pod).env.pgdata)
    }
}
