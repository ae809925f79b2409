//! Local database lifecycle
//!
//! The server uses the Debian cluster layout: configuration lives under
//! `<conf_root>/<major>/main`, data under `$PGDATA`, and the cluster is
//! driven through the `pg_createcluster`/`pg_ctlcluster` wrappers. Every
//! failure here is fatal; nothing in this module is retried.

pub mod admin;
pub mod datadir;
pub mod owner;

use crate::command::CommandLine;
use crate::config::AgentConfig;
use crate::error::Result;
use std::path::PathBuf;

pub use self::admin::{read_credential, AdminSession, PostgresAdmin};
pub use self::datadir::{DataDirectory, STANDBY_SIGNAL};
pub use self::owner::{prepare_mounts, FileOwner, MountPoint};

/// Control over the local database server
#[async_trait::async_trait]
pub trait DatabaseControl {
    /// Initialize a fresh cluster in the data directory
    async fn create_cluster(&self) -> Result<()>;

    /// Whether the cluster configuration files exist
    async fn has_configuration(&self) -> bool;

    /// Start the server
    async fn start(&self) -> Result<()>;

    /// Replay WAL to a consistent state with the server stopped
    async fn ensure_consistent(&self) -> Result<()>;
}

/// `DatabaseControl` through the Debian wrapper scripts
pub struct PgCtlCluster {
    node: String,
    data: DataDirectory,
    pg_major: String,
    conf_dir: PathBuf,
    bin_dir: PathBuf,
    locale: String,
    port: u16,
    os_user: String,
    owner: FileOwner,
}

impl PgCtlCluster {
    /// `owner` receives the data directory before `pg_createcluster` runs
    pub fn new(config: &AgentConfig, owner: FileOwner) -> Self {
        Self {
            node: config.identity().name.clone(),
            data: DataDirectory::new(config.env.pgdata.clone()),
            pg_major: config.env.pg_major.clone(),
            conf_dir: config.pg_conf_dir(),
            bin_dir: config.pg_bin_dir(),
            locale: config.settings.database.locale.clone(),
            port: config.settings.database.port,
            os_user: config.settings.database.os_user.clone(),
            owner,
        }
    }

    /// `pg_createcluster` invocation for this node
    pub fn create_command(&self) -> CommandLine {
        CommandLine::new(
            "pg_createcluster",
            [
                self.pg_major.clone(),
                "main".to_string(),
                format!("--locale={}", self.locale),
                format!("--port={}", self.port),
                format!("--datadir={}", self.data.path().display()),
                "--".to_string(),
                "--auth-local=trust".to_string(),
                "--auth-host=scram-sha-256".to_string(),
            ],
        )
    }

    /// `pg_ctlcluster` invocation for `verb`
    pub fn ctl_command(&self, verb: &str) -> CommandLine {
        CommandLine::new("pg_ctlcluster", [self.pg_major.as_str(), "main", verb])
    }

    /// Single-user mode invocation; stdin is closed so it exits after recovery
    pub fn single_user_command(&self) -> CommandLine {
        let postgres = self.bin_dir.join("postgres");
        CommandLine::new(
            &postgres.to_string_lossy(),
            [
                "--single".to_string(),
                "-D".to_string(),
                self.conf_dir.to_string_lossy().into_owned(),
            ],
        )
        .as_user(&self.os_user)
        .stdin_null()
    }
}

#[async_trait::async_trait]
impl DatabaseControl for PgCtlCluster {
    async fn create_cluster(&self) -> Result<()> {
        tracing::warn!("Creating new database cluster in {}", self.data.path().display());
        self.data.prepare_owned(self.owner)?;
        self.create_command().run(&self.node, false).await
    }

    async fn has_configuration(&self) -> bool {
        self.conf_dir.join("postgresql.conf").exists()
    }

    async fn start(&self) -> Result<()> {
        tracing::info!("Starting PostgreSQL cluster");
        self.ctl_command("start").run(&self.node, false).await
    }

    async fn ensure_consistent(&self) -> Result<()> {
        tracing::info!("Ensuring database is in a consistent state");
        if !self.data.remove_standby_marker()? {
            tracing::warn!("PostgreSQL was not following. Deposed primary?");
        }
        self.single_user_command().run(&self.node, false).await
    }
}
