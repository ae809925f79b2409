//! repmgr invocations
//!
//! `RepmgrCommand` enumerates the sub-commands this agent issues. The
//! `ReplicationTool` seam runs one and reports its exit code; the
//! `ReplicationController` layers retries and exit-code policy on top.

pub mod controller;

use crate::command::CommandLine;
use crate::error::Result;
use std::fmt;
use std::path::PathBuf;

pub use self::controller::ReplicationController;

/// Role and database used for replication connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationLogin {
    pub user: String,
    pub database: String,
}

impl ReplicationLogin {
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: database.into(),
        }
    }
}

impl Default for ReplicationLogin {
    fn default() -> Self {
        Self::new("repmgr", "repmgr")
    }
}

/// repmgr sub-commands issued by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepmgrCommand {
    /// `primary register --force`
    PrimaryRegister,
    /// `standby register --force --wait-sync=60` against the primary
    StandbyRegister { host: String },
    /// `standby clone -c` (fast checkpoint) from the primary
    StandbyClone { host: String },
    /// `standby follow` of the primary, with the local server running
    StandbyFollow { host: String },
    /// `node rejoin --force-rewind`, with the local server stopped
    NodeRejoin { host: String },
    /// `cluster show`
    ClusterShow,
    /// `standby promote`, run by repmgrd on failover
    StandbyPromote,
    /// `standby follow --wait --upstream-node-id=<n>`, run by repmgrd on failover
    StandbyFollowNode { node_id: u32 },
}

impl RepmgrCommand {
    /// Short name for logs and retry bookkeeping
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrimaryRegister => "primary_register",
            Self::StandbyRegister { .. } => "standby_register",
            Self::StandbyClone { .. } => "standby_clone",
            Self::StandbyFollow { .. } => "standby_follow",
            Self::NodeRejoin { .. } => "node_rejoin",
            Self::ClusterShow => "cluster_show",
            Self::StandbyPromote => "standby_promote",
            Self::StandbyFollowNode { .. } => "standby_follow_node",
        }
    }

    /// Upstream host this command connects to, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::StandbyRegister { host }
            | Self::StandbyClone { host }
            | Self::StandbyFollow { host }
            | Self::NodeRejoin { host } => Some(host),
            _ => None,
        }
    }

    /// Arguments following `repmgr`
    pub fn args(&self, conf: &str, login: &ReplicationLogin) -> Vec<String> {
        let connect = |host: &str| -> Vec<String> {
            vec![
                "-h".to_string(),
                host.to_string(),
                "-U".to_string(),
                login.user.clone(),
                "-d".to_string(),
                login.database.clone(),
            ]
        };
        let mut args = vec!["-f".to_string(), conf.to_string()];

        match self {
            Self::PrimaryRegister => {
                args.extend(["primary", "register", "--force"].map(String::from));
            }
            Self::StandbyRegister { host } => {
                args.extend(["standby", "register", "--force", "--wait-sync=60"].map(String::from));
                args.extend(connect(host));
            }
            Self::StandbyClone { host } => {
                args.extend(connect(host));
                args.extend(["standby", "clone", "-c"].map(String::from));
            }
            Self::StandbyFollow { host } => {
                args.extend(connect(host));
                args.extend(["standby", "follow"].map(String::from));
            }
            Self::NodeRejoin { host } => {
                args.extend(connect(host));
                args.extend(["node", "rejoin", "--force-rewind"].map(String::from));
            }
            Self::ClusterShow => {
                args.extend(["cluster", "show"].map(String::from));
            }
            Self::StandbyPromote => {
                args = ["standby", "promote", "-v", "-f", conf, "--log-to-file"]
                    .map(String::from)
                    .to_vec();
            }
            Self::StandbyFollowNode { node_id } => {
                args = ["standby", "follow", "-v", "--wait", "-f", conf, "--log-to-file"]
                    .map(String::from)
                    .to_vec();
                args.push(format!("--upstream-node-id={}", node_id));
            }
        }
        args
    }
}

impl fmt::Display for RepmgrCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host() {
            Some(host) => write!(f, "{} ({})", self.name(), host),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Runs repmgr sub-commands
#[async_trait::async_trait]
pub trait ReplicationTool {
    /// Run `command` to completion and return its exit code
    async fn run(&self, command: &RepmgrCommand) -> Result<Option<i32>>;
}

/// `ReplicationTool` invoking the repmgr binary as the database account
pub struct RepmgrCli {
    node: String,
    conf: PathBuf,
    os_user: String,
    login: ReplicationLogin,
}

impl RepmgrCli {
    pub fn new(
        node: impl Into<String>,
        conf: PathBuf,
        os_user: impl Into<String>,
        login: ReplicationLogin,
    ) -> Self {
        Self {
            node: node.into(),
            conf,
            os_user: os_user.into(),
            login,
        }
    }

    /// Full command line for `command`
    pub fn command_line(&self, command: &RepmgrCommand) -> CommandLine {
        let args = command.args(&self.conf.to_string_lossy(), &self.login);
        CommandLine::new("repmgr", args).as_user(&self.os_user)
    }
}

#[async_trait::async_trait]
impl ReplicationTool for RepmgrCli {
    async fn run(&self, command: &RepmgrCommand) -> Result<Option<i32>> {
        self.command_line(command).status(&self.node).await
    }
}
