//! Retrying replication operations

use super::{RepmgrCommand, ReplicationTool};
use crate::database::{DataDirectory, DatabaseControl};
use crate::error::{ClusterError, Result};
use crate::retry::RetryPolicy;
use crate::topology::PrimaryResolver;
use std::sync::Arc;

/// Outcome of `node rejoin`, by exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinStatus {
    /// 0
    Rejoined,
    /// 1: bad repmgr configuration
    ConfigurationError,
    /// 4: repmgr could not restart the database
    RestartFailed,
    /// 24: the rejoin itself failed
    RejoinFailed,
    /// Anything else, including termination by signal
    Unknown(Option<i32>),
}

impl RejoinStatus {
    pub fn from_exit(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Rejoined,
            Some(1) => Self::ConfigurationError,
            Some(4) => Self::RestartFailed,
            Some(24) => Self::RejoinFailed,
            other => Self::Unknown(other),
        }
    }

    /// Map to the error the retry loop sees
    pub fn into_result(self, command: &RepmgrCommand) -> Result<()> {
        match self {
            Self::Rejoined => Ok(()),
            Self::ConfigurationError => Err(ClusterError::configuration(
                "repmgr rejoin reported a configuration error",
            )),
            Self::RestartFailed => Err(ClusterError::data_integrity(
                "PostgreSQL could not be restarted by repmgr",
            )),
            Self::RejoinFailed => Err(ClusterError::Command {
                command: command.to_string(),
                code: Some(24),
                retryable: true,
            }),
            Self::Unknown(code) => Err(ClusterError::Command {
                command: command.to_string(),
                code,
                retryable: true,
            }),
        }
    }
}

/// Register, clone, follow, rejoin and promote through the replication tool
///
/// Operations that talk to the primary resolve its address on every attempt,
/// so a retry after a failover targets the new primary.
pub struct ReplicationController {
    tool: Arc<dyn ReplicationTool + Send + Sync>,
    resolver: Arc<dyn PrimaryResolver + Send + Sync>,
    database: Arc<dyn DatabaseControl + Send + Sync>,
    data: DataDirectory,
    retry: RetryPolicy,
}

impl ReplicationController {
    pub fn new(
        tool: Arc<dyn ReplicationTool + Send + Sync>,
        resolver: Arc<dyn PrimaryResolver + Send + Sync>,
        database: Arc<dyn DatabaseControl + Send + Sync>,
        data: DataDirectory,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tool,
            resolver,
            database,
            data,
            retry,
        }
    }

    async fn invoke(&self, command: RepmgrCommand) -> Result<()> {
        match self.tool.run(&command).await? {
            Some(0) => Ok(()),
            code => Err(ClusterError::Command {
                command: command.to_string(),
                code,
                retryable: true,
            }),
        }
    }

    /// Replace the local data directory with a copy of the primary's
    ///
    /// On success the directory is complete and carries the standby marker.
    /// On failure no directory is left behind.
    pub async fn clone_from_primary(&self) -> Result<()> {
        self.data.begin_clone()?;

        let result = self
            .retry
            .run("standby_clone", || async move {
                let host = self.resolver.primary_hostname().await?;
                tracing::info!("Cloning database from {}", host);
                self.data.wipe()?;
                let outcome = self.invoke(RepmgrCommand::StandbyClone { host }).await;
                if outcome.is_err() {
                    self.data.wipe()?;
                }
                outcome
            })
            .await;

        match result {
            Ok(()) => {
                self.data.write_standby_marker()?;
                self.data.finish_clone()?;
                Ok(())
            }
            Err(error) => {
                self.data.wipe()?;
                Err(error)
            }
        }
    }

    /// Register this node as primary, overwriting any previous record
    pub async fn register_primary(&self) -> Result<()> {
        tracing::info!("Registering PostgreSQL primary server with repmgr");
        self.retry
            .run("primary_register", || self.invoke(RepmgrCommand::PrimaryRegister))
            .await
    }

    /// Register this node as a standby of the primary
    pub async fn register_standby(&self) -> Result<()> {
        self.retry
            .run("standby_register", || async move {
                let host = self.resolver.primary_hostname().await?;
                tracing::info!("Registering PostgreSQL hot standby server with {}", host);
                self.invoke(RepmgrCommand::StandbyRegister { host }).await
            })
            .await
    }

    /// Start the local standby and point it at the current primary
    pub async fn follow(&self) -> Result<()> {
        if !self.data.has_standby_marker() {
            return Err(ClusterError::data_integrity(
                "asked to follow but the standby marker is missing",
            ));
        }
        self.database.start().await?;
        self.retry
            .run("standby_follow", || async move {
                let host = self.resolver.primary_hostname().await?;
                tracing::info!("Hot standby following {}", host);
                self.invoke(RepmgrCommand::StandbyFollow { host }).await
            })
            .await
    }

    /// Bring a deposed primary back as a standby of the current primary
    ///
    /// Every attempt replays WAL before `node rejoin`.
    pub async fn rejoin(&self) -> Result<()> {
        self.retry
            .run("node_rejoin", || async move {
                self.database.ensure_consistent().await?;
                let host = self.resolver.primary_hostname().await?;
                tracing::info!("Deposed primary rejoining, following {}", host);
                let command = RepmgrCommand::NodeRejoin { host };
                let code = self.tool.run(&command).await?;
                let status = RejoinStatus::from_exit(code);
                if status == RejoinStatus::Rejoined {
                    tracing::info!("PostgreSQL hot standby rejoined");
                }
                status.into_result(&command)
            })
            .await
    }

    /// Promote the local standby
    pub async fn promote(&self) -> Result<()> {
        self.retry
            .run("standby_promote", || self.invoke(RepmgrCommand::StandbyPromote))
            .await
    }

    /// Follow the node repmgrd chose as the new upstream
    pub async fn follow_node(&self, node_id: u32) -> Result<()> {
        self.retry
            .run("standby_follow_node", || {
                self.invoke(RepmgrCommand::StandbyFollowNode { node_id })
            })
            .await
    }

    /// Log the cluster as repmgr sees it; a single attempt
    pub async fn cluster_show(&self) -> Result<()> {
        self.invoke(RepmgrCommand::ClusterShow).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejoin_classification() {
        let command = RepmgrCommand::NodeRejoin {
            host: "pg-pg-1".to_string(),
        };
        assert!(RejoinStatus::from_exit(Some(0)).into_result(&command).is_ok());

        let config = RejoinStatus::from_exit(Some(1)).into_result(&command).unwrap_err();
        assert!(matches!(config, ClusterError::Configuration(_)));
        assert!(!config.is_retryable());

        let restart = RejoinStatus::from_exit(Some(4)).into_result(&command).unwrap_err();
        assert!(matches!(restart, ClusterError::DataIntegrity(_)));
        assert!(!restart.is_retryable());

        assert!(RejoinStatus::from_exit(Some(24))
            .into_result(&command)
            .unwrap_err()
            .is_retryable());
        assert_eq!(RejoinStatus::from_exit(Some(7)), RejoinStatus::Unknown(Some(7)));
        assert!(RejoinStatus::from_exit(None)
            .into_result(&command)
            .unwrap_err()
            .is_retryable());
    }
}
