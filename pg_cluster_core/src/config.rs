//! Configuration management for the cluster agent
//!
//! Identity comes from the environment the orchestrator injects into the pod.
//! Everything else (paths, retry timings, logging) has built-in defaults and
//! may be overridden by a TOML or YAML settings file.

use crate::database::{FileOwner, MountPoint};
use crate::error::{ClusterError, Result};
use crate::identity::{ExpectedNodeSet, NodeIdentity};
use crate::replication::ReplicationLogin;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional settings file
pub const SETTINGS_ENV: &str = "PG_CLUSTER_CONFIG";

/// Complete agent configuration, built once at process start
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity inputs injected by the orchestrator
    pub env: NodeEnvironment,
    /// Tunables
    pub settings: Settings,
    identity: NodeIdentity,
}

/// Identity inputs injected by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnvironment {
    /// Pod name, ending in the node ordinal
    pub pod_name: String,
    /// Namespace the pods live in
    pub namespace: String,
    /// Kubernetes node the pod is scheduled on
    pub node_name: String,
    /// Application name shared by every pod of the cluster
    pub app_name: String,
    /// Units the deployment currently declares
    pub expected_units: ExpectedNodeSet,
    /// Container hostname, if set
    pub hostname: Option<String>,
    /// PostgreSQL data directory
    pub pgdata: PathBuf,
    /// PostgreSQL major version
    pub pg_major: String,
}

/// Tunables, all with defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Filesystem layout
    pub paths: PathsConfig,
    /// Database server settings
    pub database: DatabaseConfig,
    /// Retry timings
    pub retry: RetryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the PostgreSQL configuration tree
    pub conf_root: PathBuf,
    /// repmgr configuration file
    pub repmgr_conf: PathBuf,
    /// repmgr log file
    pub repmgr_log: PathBuf,
    /// Shared admin password, mounted from the secret store
    pub credential_file: PathBuf,
    /// pgpass files to maintain; the last one belongs to the database account
    pub pgpass_files: Vec<PathBuf>,
    /// This binary, as invoked by repmgrd callbacks
    pub agent_binary: PathBuf,
    /// Unix socket directory of the local server
    pub socket_dir: PathBuf,
    /// Directories handed to the database account on start, together with
    /// the parent of `$PGDATA` and the repmgr log directory
    pub mount_dirs: Vec<PathBuf>,
}

/// Database server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Server port
    pub port: u16,
    /// Cluster locale
    pub locale: String,
    /// Operating system account owning the data directory
    pub os_user: String,
    /// Role used by repmgr and for replication connections
    pub replication_user: String,
    /// Database holding repmgr metadata
    pub replication_database: String,
    /// WAL segments kept for standbys
    pub wal_keep_segments: u32,
    /// WAL sender slots on top of one per expected node
    pub wal_sender_slack: usize,
    /// Seconds repmgr waits for a standby to reconnect
    pub standby_reconnect_timeout: u64,
    /// Seconds repmgr waits for a rejoin to complete
    pub node_rejoin_timeout: u64,
}

/// Retry timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Wall-clock ceiling for a retried operation, in seconds
    pub max_elapsed: u64,
    /// Exponential backoff multiplier, in seconds
    pub multiplier: f64,
    /// Upper bound for a single backoff, in seconds
    pub max_backoff: u64,
    /// Upper bound for a single backoff when connecting to the database
    pub sql_max_backoff: u64,
    /// Poll interval while waiting for a primary to appear
    pub primary_poll_interval: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional, in addition to stderr)
    pub file_path: Option<String>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl NodeEnvironment {
    /// Read identity inputs from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read identity inputs through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String> {
            match lookup(name) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(ClusterError::missing_env(name)),
            }
        };

        let pgdata = required("PGDATA")?;
        let env = Self {
            pod_name: required("POD_NAME")?,
            namespace: required("POD_NAMESPACE")?,
            node_name: required("NODE_NAME")?,
            app_name: required("APP_NAME")?,
            expected_units: ExpectedNodeSet::parse(&required("EXPECTED_UNITS")?),
            hostname: lookup("HOSTNAME"),
            pgdata: PathBuf::from(pgdata),
            pg_major: required("PG_MAJOR")?,
        };

        if crate::identity::parse_ordinal(&env.pod_name).is_none() {
            return Err(ClusterError::Environment {
                name: "POD_NAME".to_string(),
                reason: format!("{} has no numeric ordinal suffix", env.pod_name),
            });
        }

        Ok(env)
    }
}

impl AgentConfig {
    /// Load identity from the environment and settings from the file named
    /// by `PG_CLUSTER_CONFIG`, if any
    pub fn load() -> Result<Self> {
        let env = NodeEnvironment::from_env()?;
        let settings = match std::env::var(SETTINGS_ENV) {
            Ok(path) if !path.is_empty() => Settings::from_path(&path)?,
            _ => Settings::default(),
        };
        Self::new(env, settings)
    }

    /// Combine identity and settings, validating the result
    pub fn new(env: NodeEnvironment, settings: Settings) -> Result<Self> {
        settings
            .validate()
            .map_err(|errors| ClusterError::configuration(errors.join("; ")))?;
        let identity = NodeIdentity::new(&env.app_name, &env.pod_name, env.pgdata.clone())
            .ok_or_else(|| ClusterError::Environment {
                name: "POD_NAME".to_string(),
                reason: format!("{} has no numeric ordinal suffix", env.pod_name),
            })?;
        Ok(Self {
            env,
            settings,
            identity,
        })
    }

    /// Identity of this node
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Units the deployment currently declares
    pub fn expected(&self) -> &ExpectedNodeSet {
        &self.env.expected_units
    }

    /// Debian-layout configuration directory of the `main` cluster
    pub fn pg_conf_dir(&self) -> PathBuf {
        self.settings
            .paths
            .conf_root
            .join(&self.env.pg_major)
            .join("main")
    }

    /// PostgreSQL binaries
    pub fn pg_bin_dir(&self) -> PathBuf {
        PathBuf::from("/usr/lib/postgresql")
            .join(&self.env.pg_major)
            .join("bin")
    }

    pub fn replication_login(&self) -> ReplicationLogin {
        ReplicationLogin::new(
            &self.settings.database.replication_user,
            &self.settings.database.replication_database,
        )
    }

    /// Directories fixed up on start
    ///
    /// The mount directories and the parent of `$PGDATA` go to `account`
    /// with mode 0775. The log directory keeps the agent as owner, with the
    /// account's group and mode 1775.
    pub fn mount_points(&self, account: FileOwner, agent: FileOwner) -> Vec<MountPoint> {
        let mut dirs = self.settings.paths.mount_dirs.clone();
        if let Some(parent) = self.env.pgdata.parent() {
            if !dirs.iter().any(|dir| dir == parent) {
                dirs.push(parent.to_path_buf());
            }
        }
        let mut mounts: Vec<MountPoint> = dirs
            .into_iter()
            .map(|dir| MountPoint::new(dir, account, 0o775))
            .collect();

        if let Some(log_dir) = self.settings.paths.repmgr_log.parent() {
            let owner = FileOwner::new(agent.uid, account.gid);
            mounts.push(MountPoint::new(log_dir, owner, 0o1775));
        }
        mounts
    }

    /// Retry timings for replication tool invocations
    pub fn command_retry(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::from_config(&self.settings.retry, self.settings.retry.max_backoff)
    }

    /// Retry timings for database connections
    pub fn sql_retry(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::from_config(
            &self.settings.retry,
            self.settings.retry.sql_max_backoff,
        )
    }
}

impl Settings {
    /// Load settings from a TOML or YAML file, chosen by extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_file(path),
        }
    }

    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ClusterError::Settings(e.to_string()))
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| ClusterError::Settings(e.to_string()))
    }

    /// Render settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ClusterError::Settings(e.to_string()))
    }

    /// Validate settings
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.port == 0 {
            errors.push("Database port cannot be 0".to_string());
        }
        if self.database.replication_user.is_empty() {
            errors.push("Replication user cannot be empty".to_string());
        }
        if self.retry.max_elapsed == 0 {
            errors.push("Retry ceiling cannot be 0".to_string());
        }
        if self.retry.multiplier <= 0.0 {
            errors.push("Retry multiplier must be positive".to_string());
        }
        if self.retry.primary_poll_interval == 0 {
            errors.push("Primary poll interval cannot be 0".to_string());
        }
        if !self.paths.repmgr_conf.is_absolute() {
            errors.push("repmgr configuration path must be absolute".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl RetryConfig {
    /// Get duration for the retry ceiling
    pub fn max_elapsed_duration(&self) -> Duration {
        Duration::from_secs(self.max_elapsed)
    }

    /// Get duration for the primary poll interval
    pub fn primary_poll_duration(&self) -> Duration {
        Duration::from_secs(self.primary_poll_interval)
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            conf_root: PathBuf::from("/srv/pgconf"),
            repmgr_conf: PathBuf::from("/srv/pgconf/repmgr.conf"),
            repmgr_log: PathBuf::from("/var/log/postgresql/repmgr.log"),
            credential_file: PathBuf::from("/charm-secrets/pgsql-admin-password"),
            pgpass_files: vec![
                PathBuf::from("/root/.pgpass"),
                PathBuf::from("/var/lib/postgresql/.pgpass"),
            ],
            agent_binary: PathBuf::from("/usr/local/bin/pg-cluster-agent"),
            socket_dir: PathBuf::from("/var/run/postgresql"),
            mount_dirs: vec![PathBuf::from("/srv/pgdata"), PathBuf::from("/srv/pgconf")],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            port: 5432,
            locale: "en_US.UTF-8".to_string(),
            os_user: "postgres".to_string(),
            replication_user: "repmgr".to_string(),
            replication_database: "repmgr".to_string(),
            wal_keep_segments: 500,
            wal_sender_slack: 4, // 2 for repmgr, 2 spare
            standby_reconnect_timeout: 180,
            node_rejoin_timeout: 180,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_elapsed: 300,
            multiplier: 1.0,
            max_backoff: 20,
            sql_max_backoff: 15,
            primary_poll_interval: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Text,
            file_path: None,
        }
    }
}
