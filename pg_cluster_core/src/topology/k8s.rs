//! Pod metadata store backed by the Kubernetes API

use super::{LabelStore, MetadataPatch, PodRecord};
use crate::error::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// `LabelStore` over `Api<Pod>` in one namespace
pub struct KubeLabelStore {
    pods: Api<Pod>,
}

impl KubeLabelStore {
    /// Create a store for pods in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }
}

/// JSON merge patch body; `null` removes a key
fn merge_patch_body(patch: &MetadataPatch) -> Value {
    fn to_map(entries: &BTreeMap<String, Option<String>>) -> Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Some(v) => Value::String(v.clone()),
                    None => Value::Null,
                };
                (key.clone(), value)
            })
            .collect()
    }

    let mut metadata = Map::new();
    if !patch.labels.is_empty() {
        metadata.insert("labels".to_string(), Value::Object(to_map(&patch.labels)));
    }
    if !patch.annotations.is_empty() {
        metadata.insert(
            "annotations".to_string(),
            Value::Object(to_map(&patch.annotations)),
        );
    }
    json!({ "metadata": metadata })
}

fn to_record(pod: Pod) -> PodRecord {
    PodRecord {
        name: pod.metadata.name.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        annotations: pod.metadata.annotations.unwrap_or_default(),
    }
}

#[async_trait::async_trait]
impl LabelStore for KubeLabelStore {
    async fn list(&self, selector: &str) -> Result<Vec<PodRecord>> {
        let lp = ListParams::default().labels(selector);
        let pods = self.pods.list(&lp).await?;
        Ok(pods.items.into_iter().map(to_record).collect())
    }

    async fn patch(&self, pod: &str, patch: MetadataPatch) -> Result<()> {
        let body = merge_patch_body(&patch);
        tracing::debug!(pod = pod, patch = %body, "Patching pod metadata");
        self.pods
            .patch(pod, &PatchParams::default(), &Patch::Merge(&body))
            .await?;
        Ok(())
    }
}
