//! In-process pod metadata store
//!
//! Every operation yields to the scheduler before and after touching the
//! shared map, so concurrent tasks interleave their list and patch calls the
//! way independent processes would.

use super::{LabelStore, MetadataPatch, PodRecord, APP_LABEL, ROLE_LABEL, ROLE_PRIMARY};
use crate::error::{ClusterError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// `LabelStore` held in memory
#[derive(Default, Clone)]
pub struct MemoryLabelStore {
    pods: Arc<RwLock<BTreeMap<String, PodRecord>>>,
    failures: Arc<AtomicU32>,
}

impl MemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `pods`, each labeled with `app`
    pub fn with_app_pods(app: &str, pods: &[&str]) -> Self {
        let records = pods
            .iter()
            .map(|name| {
                let record = PodRecord::new(*name).with_label(APP_LABEL, app);
                (name.to_string(), record)
            })
            .collect();
        Self {
            pods: Arc::new(RwLock::new(records)),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Insert or replace a pod
    pub async fn insert(&self, record: PodRecord) {
        self.pods.write().await.insert(record.name.clone(), record);
    }

    /// Current state of a pod
    pub async fn pod(&self, name: &str) -> Option<PodRecord> {
        self.pods.read().await.get(name).cloned()
    }

    /// Names of the pods of `app` holding the primary marker
    pub async fn holders(&self, app: &str) -> Vec<String> {
        self.pods
            .read()
            .await
            .values()
            .filter(|p| p.labels.get(APP_LABEL).map(String::as_str) == Some(app))
            .filter(|p| p.labels.get(ROLE_LABEL).map(String::as_str) == Some(ROLE_PRIMARY))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Fail the next `count` operations with a transient error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::transient("injected label store failure"));
        }
        Ok(())
    }
}

fn not_found(pod: &str) -> ClusterError {
    ClusterError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("pods \"{}\" not found", pod),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

fn apply(target: &mut BTreeMap<String, String>, changes: &BTreeMap<String, Option<String>>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

#[async_trait::async_trait]
impl LabelStore for MemoryLabelStore {
    async fn list(&self, selector: &str) -> Result<Vec<PodRecord>> {
        tokio::task::yield_now().await;
        self.injected_failure()?;
        let matching = self
            .pods
            .read()
            .await
            .values()
            .filter(|p| p.matches(selector))
            .cloned()
            .collect();
        tokio::task::yield_now().await;
        Ok(matching)
    }

    async fn patch(&self, pod: &str, patch: MetadataPatch) -> Result<()> {
        tokio::task::yield_now().await;
        self.injected_failure()?;
        {
            let mut pods = self.pods.write().await;
            let record = pods.get_mut(pod).ok_or_else(|| not_found(pod))?;
            apply(&mut record.labels, &patch.labels);
            apply(&mut record.annotations, &patch.annotations);
        }
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_patch_sets_and_removes() {
        let store = MemoryLabelStore::with_app_pods("pg", &["pg-0"]);
        store
            .patch("pg-0", MetadataPatch::new().set_label(ROLE_LABEL, ROLE_PRIMARY))
            .await
            .unwrap();
        assert_eq!(store.holders("pg").await, vec!["pg-0".to_string()]);

        store
            .patch("pg-0", MetadataPatch::new().remove_label(ROLE_LABEL))
            .await
            .unwrap();
        assert!(store.holders("pg").await.is_empty());
    }

    #[tokio::test]
    async fn test_patch_unknown_pod_is_not_found() {
        let store = MemoryLabelStore::new();
        let err = store.patch("ghost", MetadataPatch::new()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryLabelStore::with_app_pods("pg", &["pg-0"]);
        store.fail_next(1);
        assert!(store.list("pg-cluster/app=pg").await.unwrap_err().is_retryable());
        assert_eq!(store.list("pg-cluster/app=pg").await.unwrap().len(), 1);
    }
}
