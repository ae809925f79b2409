pub mod command;
pub mod config;
pub mod database;
pub mod election;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod log;
pub mod materialize;
pub mod replication;
pub mod retry;
pub mod shutdown;
pub mod testing;
pub mod topology;
pub mod watchdog;

pub use config::{AgentConfig, NodeEnvironment, Settings};
pub use database::{DataDirectory, FileOwner, PgCtlCluster, PostgresAdmin};
pub use election::{BootstrapOutcome, NodeState, Reconciler};
pub use election::reconcile::Collaborators;
pub use endpoints::{EndpointPublisher, KubeServiceStore};
pub use error::{ClusterError, ErrorKind, Result};
pub use identity::{ExpectedNodeSet, NodeIdentity};
pub use replication::{ReplicationController, ReplicationLogin, RepmgrCli, RepmgrCommand};
pub use retry::RetryPolicy;
pub use topology::{ClaimOutcome, KubeLabelStore, Topology};
pub use watchdog::LogWatchdog;
