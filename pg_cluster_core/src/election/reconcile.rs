//! Reconciliation on process start and the repmgrd callbacks

use super::bootstrap::{BootstrapOutcome, NodeBootstrap};
use super::{NodeEvent, NodeState};
use crate::config::AgentConfig;
use crate::database::{
    prepare_mounts, read_credential, AdminSession, DataDirectory, DatabaseControl, FileOwner,
    MountPoint,
};
use crate::endpoints::{EndpointPublisher, ServiceStore};
use crate::error::{ClusterError, Result};
use crate::materialize::Materializer;
use crate::replication::{ReplicationController, ReplicationTool};
use crate::retry::RetryPolicy;
use crate::topology::{ClaimOutcome, LabelStore, Topology};
use std::path::PathBuf;
use std::sync::Arc;

/// External collaborators of a node
pub struct Collaborators {
    pub labels: Arc<dyn LabelStore + Send + Sync>,
    pub services: Arc<dyn ServiceStore + Send + Sync>,
    pub replication: Arc<dyn ReplicationTool + Send + Sync>,
    pub database: Arc<dyn DatabaseControl + Send + Sync>,
    pub admin: Arc<dyn AdminSession + Send + Sync>,
    /// Database account receiving the mounts and its pgpass file
    pub owner: FileOwner,
}

/// Drives one node from whatever it finds on disk and in the topology store
/// to a running primary or standby
pub struct Reconciler {
    node: String,
    topology: Arc<Topology>,
    endpoints: EndpointPublisher,
    database: Arc<dyn DatabaseControl + Send + Sync>,
    admin: Arc<dyn AdminSession + Send + Sync>,
    replication: Arc<ReplicationController>,
    bootstrap: NodeBootstrap,
    materializer: Materializer,
    data: DataDirectory,
    credential_file: PathBuf,
    mounts: Vec<MountPoint>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(config: &AgentConfig, collaborators: Collaborators) -> Self {
        let identity = config.identity().clone();
        let retry = config.command_retry();
        let data = DataDirectory::new(identity.data_dir.clone());

        let topology = Arc::new(Topology::new(
            collaborators.labels,
            config.env.app_name.clone(),
            identity.clone(),
            config.expected().clone(),
        ));
        let endpoints = EndpointPublisher::new(
            collaborators.services,
            retry.clone(),
            config.env.app_name.clone(),
            identity.name.clone(),
            config.settings.database.port,
        );
        let replication = Arc::new(ReplicationController::new(
            collaborators.replication,
            topology.clone(),
            collaborators.database.clone(),
            data.clone(),
            retry.clone(),
        ));
        let bootstrap = NodeBootstrap::new(
            topology.clone(),
            collaborators.database.clone(),
            replication.clone(),
            data.clone(),
            config.settings.retry.primary_poll_duration(),
        );

        Self {
            node: identity.name.clone(),
            topology,
            endpoints,
            database: collaborators.database,
            admin: collaborators.admin,
            replication,
            bootstrap,
            materializer: Materializer::new(config).owned_by(collaborators.owner),
            data,
            credential_file: config.settings.paths.credential_file.clone(),
            mounts: config.mount_points(collaborators.owner, FileOwner::current()),
            retry,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn replication(&self) -> &ReplicationController {
        &self.replication
    }

    /// Label this pod for discovery and publish the Services
    pub async fn announce(&self) -> Result<()> {
        let topology = &self.topology;
        tracing::info!("Labeling this pod for service discovery");
        self.retry
            .run("label_for_discovery", || async move {
                topology.label_for_discovery().await
            })
            .await?;
        self.endpoints.publish().await
    }

    /// Bring the local node up as primary or standby
    pub async fn reconcile(&self) -> Result<NodeState> {
        prepare_mounts(&self.mounts)?;

        let password = read_credential(&self.credential_file)?;
        self.materializer.write_pgpass(&password)?;
        self.materializer.write_repmgr_conf()?;

        let outcome = self.bootstrap.ensure_local_database().await?;

        self.materializer.write_postgresql_override()?;
        self.materializer.append_hba_rules()?;

        let topology = &self.topology;
        let is_primary = self
            .retry
            .run("get_primary", || async move { topology.is_self_primary().await })
            .await?;

        let state = if is_primary {
            let state = match outcome {
                BootstrapOutcome::CreatedAsPrimary => {
                    NodeState::NoLocalDb.transition(&self.node, NodeEvent::CreatedAsPrimary)?
                }
                _ => self.restart_state().transition(&self.node, NodeEvent::RestartedAsPrimary)?,
            };
            self.start_primary(&password).await?;
            state
        } else if outcome == BootstrapOutcome::CreatedAsStandby {
            let state = NodeState::NoLocalDb.transition(&self.node, NodeEvent::ClonedAsStandby)?;
            self.database.start().await?;
            self.replication.register_standby().await?;
            self.mark_standby().await?;
            state
        } else {
            let state = self.reconnect_standby().await?;
            self.mark_standby().await?;
            state
        };

        if let Err(e) = self.replication.cluster_show().await {
            tracing::warn!("Unable to show repmgr cluster: {}", e);
        }

        Ok(state)
    }

    fn restart_state(&self) -> NodeState {
        NodeState::from_standby_marker(self.data.has_standby_marker())
    }

    async fn start_primary(&self, password: &str) -> Result<()> {
        self.database.start().await?;
        self.admin.ensure_replication_admin(password).await?;
        self.replication.register_primary().await?;

        // Advertise only once the database is ready; standbys wait for this
        match self.claim().await? {
            ClaimOutcome::Held { epoch } => {
                tracing::info!(epoch = epoch, "This pod holds the primary marker");
                Ok(())
            }
            ClaimOutcome::Superseded { winner } => {
                let mut names = vec![self.node.clone()];
                names.extend(winner);
                Err(ClusterError::MultiplePrimaries(names))
            }
        }
    }

    /// Reconnect an existing database that is not primary: follow if it was a
    /// standby, rejoin if it was a primary
    async fn reconnect_standby(&self) -> Result<NodeState> {
        let state = self.restart_state();
        match state {
            NodeState::Standby => {
                let state = state.transition(&self.node, NodeEvent::RestartedAsStandby)?;
                self.replication.follow().await?;
                state.transition(&self.node, NodeEvent::Followed)
            }
            _ => {
                let state = state.transition(&self.node, NodeEvent::Deposed)?;
                self.replication.rejoin().await?;
                state.transition(&self.node, NodeEvent::Rejoined)
            }
        }
    }

    async fn claim(&self) -> Result<ClaimOutcome> {
        let topology = &self.topology;
        self.retry
            .run("claim_primary", || async move { topology.claim_primary().await })
            .await
    }

    async fn mark_standby(&self) -> Result<()> {
        let topology = &self.topology;
        tracing::info!("Labeling this pod as standby");
        self.retry
            .run("mark_standby", || async move { topology.mark_standby().await })
            .await
    }

    /// repmgrd promote callback: take the marker, then promote
    ///
    /// A claim that settles on another pod leaves the local server a standby
    /// and fails the callback.
    pub async fn on_promote(&self) -> Result<NodeState> {
        tracing::warn!("Promoting to primary");
        let state = self.restart_state();

        // Claim first so fewer connections reach the old primary
        if let ClaimOutcome::Superseded { winner } = self.claim().await? {
            tracing::error!("Primary marker settled on {:?}, not promoting", winner);
            let mut names = vec![self.node.clone()];
            names.extend(winner);
            return Err(ClusterError::MultiplePrimaries(names));
        }
        self.replication.promote().await?;
        state.transition(&self.node, NodeEvent::Promoted)
    }

    /// repmgrd follow callback: follow node `node_id`, then label standby
    pub async fn on_follow(&self, node_id: u32) -> Result<NodeState> {
        tracing::warn!("Following repmgr node {}", node_id);
        let state = self
            .restart_state()
            .transition(&self.node, NodeEvent::FollowCallback)?;
        self.replication.follow_node(node_id).await?;
        self.mark_standby().await?;
        Ok(state)
    }
}
