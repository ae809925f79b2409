//! Configuration materializer
//!
//! Renders the PostgreSQL override file, the hba rules, repmgr.conf and the
//! pgpass credential files. Rendering is pure; writing is a full rewrite
//! except for the hba rules, which are appended once behind a sentinel line.

use crate::config::AgentConfig;
use crate::database::FileOwner;
use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Sentinel line preceding the appended hba rules
pub const HBA_SENTINEL: &str = "# These rules are appended by pg-cluster";

const HEADER: &str = "# This file is maintained by pg-cluster";

const HBA_RULES: &str = "\
host all         all 0.0.0.0/0 scram-sha-256
host all         all ::0/0     scram-sha-256
host replication all 0.0.0.0/0 scram-sha-256
host replication all ::0/0     scram-sha-256
";

/// Inputs for every rendered file, resolved from the agent configuration
#[derive(Debug, Clone)]
pub struct Materializer {
    pub node_id: u32,
    pub node_name: String,
    pub hostname: String,
    pub expected_nodes: usize,
    pub pg_major: String,
    pub data_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub repmgr_conf: PathBuf,
    pub repmgr_log: PathBuf,
    pub agent_binary: PathBuf,
    pub pgpass_files: Vec<PathBuf>,
    pub replication_user: String,
    pub replication_database: String,
    /// Database account, given its pgpass file
    pub owner: Option<FileOwner>,
    pub wal_keep_segments: u32,
    pub wal_sender_slack: usize,
    pub standby_reconnect_timeout: u64,
    pub node_rejoin_timeout: u64,
}

impl Materializer {
    pub fn new(config: &AgentConfig) -> Self {
        let identity = config.identity();
        let settings = &config.settings;
        Self {
            node_id: identity.repmgr_node_id(),
            node_name: identity.name.clone(),
            hostname: identity.hostname.clone(),
            expected_nodes: config.expected().len(),
            pg_major: config.env.pg_major.clone(),
            data_dir: config.env.pgdata.clone(),
            conf_dir: config.pg_conf_dir(),
            bin_dir: config.pg_bin_dir(),
            repmgr_conf: settings.paths.repmgr_conf.clone(),
            repmgr_log: settings.paths.repmgr_log.clone(),
            agent_binary: settings.paths.agent_binary.clone(),
            pgpass_files: settings.paths.pgpass_files.clone(),
            replication_user: settings.database.replication_user.clone(),
            replication_database: settings.database.replication_database.clone(),
            owner: None,
            wal_keep_segments: settings.database.wal_keep_segments,
            wal_sender_slack: settings.database.wal_sender_slack,
            standby_reconnect_timeout: settings.database.standby_reconnect_timeout,
            node_rejoin_timeout: settings.database.node_rejoin_timeout,
        }
    }

    pub fn owned_by(mut self, owner: FileOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// The database account's pgpass file, listed last
    pub fn account_pgpass(&self) -> Option<&Path> {
        self.pgpass_files.last().map(PathBuf::as_path)
    }

    /// Path of the PostgreSQL override file
    pub fn override_path(&self) -> PathBuf {
        self.conf_dir.join("conf.d").join("pg-cluster.conf")
    }

    pub fn hba_path(&self) -> PathBuf {
        self.conf_dir.join("pg_hba.conf")
    }

    pub fn render_postgresql_override(&self) -> String {
        format!(
            "{header}
listen_addresses = '*'
hot_standby = on
wal_level = replica
max_wal_senders = {senders}
wal_log_hints = on
wal_keep_segments = {keep}
archive_mode = on
archive_command = '/bin/true'

shared_preload_libraries = 'repmgr'
",
            header = HEADER,
            senders = self.expected_nodes + self.wal_sender_slack,
            keep = self.wal_keep_segments,
        )
    }

    pub fn render_repmgr_conf(&self) -> String {
        let bin = self.bin_dir.display();
        let ctl = |verb: &str| format!("'pg_ctlcluster {} main {}'", self.pg_major, verb);
        let agent = self.agent_binary.display();
        let passfile = self
            .account_pgpass()
            .map(|path| format!(" passfile={}", path.display()))
            .unwrap_or_default();
        format!(
            "{header}

node_id={node_id}
node_name='{node_name}'
data_directory='{data_dir}'

pg_bindir='{bin}'
repmgr_bindir='{bin}'

log_level='INFO'
log_facility='STDERR'
log_file='{log}'
log_status_interval=300

conninfo='host={host} user={user} dbname={database} connect_timeout=2{passfile}'

service_start_command   = {start}
service_stop_command    = {stop}
service_restart_command = {restart}
service_reload_command  = {reload}
service_promote_command = {promote}

primary_visibility_consensus=true
standby_disconnect_on_failover=true
standby_reconnect_timeout={reconnect}
node_rejoin_timeout={rejoin}

failover=automatic
promote_command='{agent} promote'
follow_command='{agent} follow %n'

monitoring_history=yes
",
            header = HEADER,
            node_id = self.node_id,
            node_name = self.node_name,
            data_dir = self.data_dir.display(),
            bin = bin,
            log = self.repmgr_log.display(),
            host = self.hostname,
            user = self.replication_user,
            database = self.replication_database,
            passfile = passfile,
            start = ctl("start"),
            stop = ctl("stop"),
            restart = ctl("restart"),
            reload = ctl("reload"),
            promote = ctl("promote"),
            reconnect = self.standby_reconnect_timeout,
            rejoin = self.node_rejoin_timeout,
            agent = agent,
        )
    }

    pub fn render_pgpass(&self, password: &str) -> String {
        let escaped = password.replace('\\', "\\\\").replace(':', "\\:");
        format!(
            "{header}
*:*:{database}:{user}:{pw}
*:*:replication:{user}:{pw}
",
            header = HEADER,
            database = self.replication_database,
            user = self.replication_user,
            pw = escaped,
        )
    }

    /// Rewrite the PostgreSQL override file
    pub fn write_postgresql_override(&self) -> Result<()> {
        let path = self.override_path();
        tracing::info!("Updating PostgreSQL configuration in {}", path.display());
        write_with_mode(&path, &self.render_postgresql_override(), 0o644)
    }

    /// Append the hba rules unless the sentinel is already present
    ///
    /// Returns whether anything was written.
    pub fn append_hba_rules(&self) -> Result<bool> {
        let path = self.hba_path();
        let existing = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.lines().any(|line| line == HBA_SENTINEL) {
            return Ok(false);
        }

        tracing::info!("Appending access rules to {}", path.display());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        write!(file, "\n{}\n{}", HBA_SENTINEL, HBA_RULES)?;
        Ok(true)
    }

    /// Rewrite repmgr.conf
    pub fn write_repmgr_conf(&self) -> Result<()> {
        tracing::info!("Updating repmgr configuration in {}", self.repmgr_conf.display());
        write_with_mode(&self.repmgr_conf, &self.render_repmgr_conf(), 0o644)
    }

    /// Rewrite every pgpass file and hand the account's file to its owner
    pub fn write_pgpass(&self, password: &str) -> Result<()> {
        let content = self.render_pgpass(password);
        for path in &self.pgpass_files {
            tracing::info!("Overwriting {}, updating secrets", path.display());
            write_with_mode(path, &content, 0o600)?;
        }
        if let (Some(owner), Some(path)) = (self.owner, self.account_pgpass()) {
            owner.apply(path)?;
        }
        Ok(())
    }
}

fn write_with_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}
