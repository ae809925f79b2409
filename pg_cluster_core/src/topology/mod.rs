//! Topology store adapter
//!
//! The primary marker is the label `role=primary` on exactly one pod of the
//! application. There is no compare-and-set on pod labels, so every claim
//! also stamps a monotonically increasing epoch annotation and then runs a
//! settle pass that clears the marker from every holder except the one with
//! the highest `(epoch, lowest ordinal)`. Once claims stop, the marker ends
//! up on exactly one pod.

pub mod k8s;
pub mod memory;

use crate::error::{ClusterError, Result};
use crate::identity::{parse_ordinal, pod_hostname, ExpectedNodeSet, NodeIdentity};
use crate::log::log_topology_change;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use self::k8s::KubeLabelStore;
pub use self::memory::MemoryLabelStore;

/// Label carrying the application name on every pod of the cluster
pub const APP_LABEL: &str = "pg-cluster/app";
/// Label carrying the replication role
pub const ROLE_LABEL: &str = "role";
/// Per-pod discovery label matched by the per-node Service
pub const POD_LABEL: &str = "pg-cluster/pod";
/// Role value of the primary marker
pub const ROLE_PRIMARY: &str = "primary";
/// Role value of a standby
pub const ROLE_STANDBY: &str = "standby";
/// Claim epoch annotation
pub const EPOCH_ANNOTATION: &str = "pg-cluster/primary-epoch";
/// Claim timestamp annotation
pub const CLAIMED_AT_ANNOTATION: &str = "pg-cluster/claimed-at";

/// Labels and annotations of one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PodRecord {
    /// Create a record with no metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether this pod carries the primary marker
    pub fn is_primary(&self) -> bool {
        self.labels.get(ROLE_LABEL).map(String::as_str) == Some(ROLE_PRIMARY)
    }

    /// Claim epoch, 0 when never claimed
    pub fn epoch(&self) -> u64 {
        self.annotations
            .get(EPOCH_ANNOTATION)
            .and_then(|e| e.parse().ok())
            .unwrap_or(0)
    }

    /// Ordinal from the pod name
    pub fn ordinal(&self) -> u32 {
        parse_ordinal(&self.name).unwrap_or(u32::MAX)
    }

    /// Whether this record satisfies an equality selector (`k=v,k2=v2`)
    pub fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => {
                    self.labels.get(key.trim()).map(String::as_str) == Some(value.trim())
                }
                None => self.labels.contains_key(term),
            })
    }
}

/// Metadata change for one pod; `None` removes the key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn remove_label(mut self, key: &str) -> Self {
        self.labels.insert(key.to_string(), None);
        self
    }

    pub fn set_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), Some(value.to_string()));
        self
    }
}

/// Low-level access to pod metadata
#[async_trait::async_trait]
pub trait LabelStore {
    /// List pods matching an equality label selector
    async fn list(&self, selector: &str) -> Result<Vec<PodRecord>>;

    /// Apply a metadata change to one pod
    async fn patch(&self, pod: &str, patch: MetadataPatch) -> Result<()>;
}

/// Resolves the address of the current primary
#[async_trait::async_trait]
pub trait PrimaryResolver {
    /// Hostname of the current primary, or `ClusterError::NoPrimary`
    async fn primary_hostname(&self) -> Result<String>;
}

/// Result of a primary claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This node holds the marker
    Held { epoch: u64 },
    /// A concurrent claim with a higher precedence won
    Superseded { winner: Option<String> },
}

/// Primary marker and node labels of one application
pub struct Topology {
    store: Arc<dyn LabelStore + Send + Sync>,
    app: String,
    node: NodeIdentity,
    expected: ExpectedNodeSet,
}

impl Topology {
    /// Create a topology adapter for `node`
    pub fn new(
        store: Arc<dyn LabelStore + Send + Sync>,
        app: impl Into<String>,
        node: NodeIdentity,
        expected: ExpectedNodeSet,
    ) -> Self {
        Self {
            store,
            app: app.into(),
            node,
            expected,
        }
    }

    /// The node this adapter acts for
    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Application name
    pub fn app(&self) -> &str {
        &self.app
    }

    fn app_selector(&self) -> String {
        format!("{}={}", APP_LABEL, self.app)
    }

    fn primary_selector(&self) -> String {
        format!("{}={},{}={}", APP_LABEL, self.app, ROLE_LABEL, ROLE_PRIMARY)
    }

    async fn holders(&self) -> Result<Vec<PodRecord>> {
        self.store.list(&self.primary_selector()).await
    }

    /// Name of the pod holding the primary marker
    ///
    /// With no holder, the canonical first node of the expected set resolves
    /// to itself without writing anything; every other node sees `None`. With
    /// more than one holder the violation is logged and `None` is returned.
    pub async fn get_primary(&self) -> Result<Option<String>> {
        let holders = self.holders().await?;
        match holders.as_slice() {
            [] => {
                if self.expected.is_canonical_first(&self.node) {
                    tracing::debug!(
                        node = %self.node,
                        "No primary labeled; canonical first node resolves to itself"
                    );
                    Ok(Some(self.node.name.clone()))
                } else {
                    Ok(None)
                }
            }
            [only] => Ok(Some(only.name.clone())),
            many => {
                let names: Vec<String> = many.iter().map(|p| p.name.clone()).collect();
                tracing::error!("{}", ClusterError::MultiplePrimaries(names));
                Ok(None)
            }
        }
    }

    /// Like `get_primary`, but absence is `ClusterError::NoPrimary`
    pub async fn require_primary(&self) -> Result<String> {
        self.get_primary().await?.ok_or(ClusterError::NoPrimary)
    }

    /// Whether this node is the current primary
    pub async fn is_self_primary(&self) -> Result<bool> {
        Ok(self.get_primary().await?.as_deref() == Some(self.node.name.as_str()))
    }

    /// Take the primary marker for this node
    pub async fn claim_primary(&self) -> Result<ClaimOutcome> {
        let pods = self.store.list(&self.app_selector()).await?;
        let epoch = pods.iter().map(PodRecord::epoch).max().unwrap_or(0) + 1;

        for holder in pods.iter().filter(|p| p.is_primary() && p.name != self.node.name) {
            // Equal or newer claims are left to the settle pass
            if holder.epoch() < epoch {
                self.store
                    .patch(&holder.name, MetadataPatch::new().remove_label(ROLE_LABEL))
                    .await?;
                log_topology_change("clear", &holder.name, Some(&self.node.name), Some(holder.epoch()));
            }
        }

        let claimed_at = chrono::Utc::now().to_rfc3339();
        self.store
            .patch(
                &self.node.name,
                MetadataPatch::new()
                    .set_label(ROLE_LABEL, ROLE_PRIMARY)
                    .set_annotation(EPOCH_ANNOTATION, &epoch.to_string())
                    .set_annotation(CLAIMED_AT_ANNOTATION, &claimed_at),
            )
            .await?;
        log_topology_change("claim", &self.node.name, None, Some(epoch));

        self.settle(epoch).await
    }

    async fn settle(&self, epoch: u64) -> Result<ClaimOutcome> {
        let holders = self.holders().await?;
        let winner = holders
            .iter()
            .max_by_key(|p| (p.epoch(), Reverse(p.ordinal())))
            .map(|p| p.name.clone());

        let Some(winner) = winner else {
            // Our own marker was cleared by a claim that outranks us
            return Ok(ClaimOutcome::Superseded { winner: None });
        };

        for loser in holders.iter().filter(|p| p.name != winner) {
            self.store
                .patch(&loser.name, MetadataPatch::new().remove_label(ROLE_LABEL))
                .await?;
            log_topology_change("settle", &loser.name, Some(&winner), Some(loser.epoch()));
        }

        if winner == self.node.name {
            Ok(ClaimOutcome::Held { epoch })
        } else {
            tracing::warn!(
                node = %self.node,
                winner = %winner,
                "Concurrent primary claim outranked this node"
            );
            Ok(ClaimOutcome::Superseded {
                winner: Some(winner),
            })
        }
    }

    /// Remove the primary marker from `node` if it holds it
    pub async fn release_if_holds(&self, node: &str) -> Result<bool> {
        let holders = self.holders().await?;
        if !holders.iter().any(|p| p.name == node) {
            return Ok(false);
        }
        self.store
            .patch(node, MetadataPatch::new().remove_label(ROLE_LABEL))
            .await?;
        log_topology_change("release", node, None, None);
        Ok(true)
    }

    /// Label this node as a standby
    pub async fn mark_standby(&self) -> Result<()> {
        self.store
            .patch(
                &self.node.name,
                MetadataPatch::new().set_label(ROLE_LABEL, ROLE_STANDBY),
            )
            .await?;
        log_topology_change("standby", &self.node.name, None, None);
        Ok(())
    }

    /// Set the per-node discovery label matched by this node's Service
    pub async fn label_for_discovery(&self) -> Result<()> {
        self.store
            .patch(
                &self.node.name,
                MetadataPatch::new().set_label(POD_LABEL, &self.node.name),
            )
            .await
    }
}

#[async_trait::async_trait]
impl PrimaryResolver for Topology {
    async fn primary_hostname(&self) -> Result<String> {
        let primary = self.require_primary().await?;
        Ok(pod_hostname(&self.app, &primary))
    }
}
