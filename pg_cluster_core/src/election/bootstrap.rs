//! Node bootstrap: create a fresh cluster or clone one from the primary

use crate::database::{DataDirectory, DatabaseControl};
use crate::error::Result;
use crate::replication::ReplicationController;
use crate::retry::poll_until;
use crate::topology::Topology;
use std::sync::Arc;
use std::time::Duration;

/// What `ensure_local_database` found or did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A database was already present; nothing was touched
    AlreadyExists,
    /// This node is primary and a fresh cluster was created
    CreatedAsPrimary,
    /// A standby was cloned from the primary
    CreatedAsStandby,
}

pub struct NodeBootstrap {
    topology: Arc<Topology>,
    database: Arc<dyn DatabaseControl + Send + Sync>,
    replication: Arc<ReplicationController>,
    data: DataDirectory,
    poll_interval: Duration,
}

impl NodeBootstrap {
    pub fn new(
        topology: Arc<Topology>,
        database: Arc<dyn DatabaseControl + Send + Sync>,
        replication: Arc<ReplicationController>,
        data: DataDirectory,
        poll_interval: Duration,
    ) -> Self {
        Self {
            topology,
            database,
            replication,
            data,
            poll_interval,
        }
    }

    /// Make sure a local database exists
    ///
    /// An existing database is never modified. Otherwise this waits, without
    /// a deadline, until a primary is known. If that is this node a fresh
    /// cluster is created; if not the primary is cloned.
    pub async fn ensure_local_database(&self) -> Result<BootstrapOutcome> {
        if self.data.exists() {
            tracing::info!(
                "PostgreSQL database cluster exists at {}",
                self.data.path().display()
            );
            return Ok(BootstrapOutcome::AlreadyExists);
        }

        let topology = &self.topology;
        let primary = poll_until("wait_for_primary", self.poll_interval, || async move {
            topology.get_primary().await
        })
        .await?;

        if primary == self.topology.node().name {
            // Leftovers of an interrupted clone are discarded
            self.data.wipe()?;
            self.data.finish_clone()?;
            self.database.create_cluster().await?;
            Ok(BootstrapOutcome::CreatedAsPrimary)
        } else {
            tracing::info!("Bootstrapping hot standby of {}", primary);
            self.data.begin_clone()?;
            self.data.wipe()?;
            if !self.database.has_configuration().await {
                // Produces the configuration directory; the data is replaced
                // by the clone
                self.database.create_cluster().await?;
            }
            self.replication.clone_from_primary().await?;
            Ok(BootstrapOutcome::CreatedAsStandby)
        }
    }
}
