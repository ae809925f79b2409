//! Endpoint publisher
//!
//! Three kinds of Service select pods by label: one for the current primary,
//! one for all standbys and one per node for stable per-node hostnames.
//! Creation is idempotent; a Service that already exists is left alone.

use crate::error::{ClusterError, Result};
use crate::retry::RetryPolicy;
use crate::topology::{APP_LABEL, POD_LABEL, ROLE_LABEL, ROLE_PRIMARY, ROLE_STANDBY};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A label-selected Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub port: u16,
}

impl ServiceDefinition {
    fn new(name: String, selector: &[(&str, &str)], port: u16) -> Self {
        Self {
            name,
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            port,
        }
    }

    /// Service following the primary marker
    pub fn primary(app: &str, port: u16) -> Self {
        Self::new(
            format!("{}-primary", app),
            &[(APP_LABEL, app), (ROLE_LABEL, ROLE_PRIMARY)],
            port,
        )
    }

    /// Service spanning every standby
    pub fn standbys(app: &str, port: u16) -> Self {
        Self::new(
            format!("{}-standbys", app),
            &[(APP_LABEL, app), (ROLE_LABEL, ROLE_STANDBY)],
            port,
        )
    }

    /// Service resolving to a single pod; its name is the node hostname
    pub fn pod(app: &str, pod: &str, port: u16) -> Self {
        Self::new(
            crate::identity::pod_hostname(app, pod),
            &[(APP_LABEL, app), (POD_LABEL, pod)],
            port,
        )
    }

    /// Kubernetes object for this definition
    pub fn to_service(&self, namespace: &str) -> Service {
        let port = i32::from(self.port);
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    APP_LABEL.to_string(),
                    self.selector.get(APP_LABEL).cloned().unwrap_or_default(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.selector.clone()),
                ports: Some(vec![ServicePort {
                    name: Some("pgsql".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Service creation
#[async_trait::async_trait]
pub trait ServiceStore {
    /// Create a Service; an existing one yields a 409 error
    async fn create(&self, service: &ServiceDefinition) -> Result<()>;
}

/// `ServiceStore` over `Api<Service>` in one namespace
pub struct KubeServiceStore {
    services: Api<Service>,
    namespace: String,
}

impl KubeServiceStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ServiceStore for KubeServiceStore {
    async fn create(&self, service: &ServiceDefinition) -> Result<()> {
        let object = service.to_service(&self.namespace);
        self.services
            .create(&PostParams::default(), &object)
            .await?;
        Ok(())
    }
}

/// `ServiceStore` held in memory
#[derive(Default, Clone)]
pub struct MemoryServiceStore {
    services: Arc<RwLock<BTreeMap<String, ServiceDefinition>>>,
}

impl MemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the Services created so far
    pub async fn names(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    /// Look up a Service by name
    pub async fn get(&self, name: &str) -> Option<ServiceDefinition> {
        self.services.read().await.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl ServiceStore for MemoryServiceStore {
    async fn create(&self, service: &ServiceDefinition) -> Result<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&service.name) {
            return Err(ClusterError::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("services \"{}\" already exists", service.name),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })));
        }
        services.insert(service.name.clone(), service.clone());
        Ok(())
    }
}

/// Publishes the Services of one node
pub struct EndpointPublisher {
    store: Arc<dyn ServiceStore + Send + Sync>,
    retry: RetryPolicy,
    app: String,
    pod: String,
    port: u16,
}

impl EndpointPublisher {
    pub fn new(
        store: Arc<dyn ServiceStore + Send + Sync>,
        retry: RetryPolicy,
        app: impl Into<String>,
        pod: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            store,
            retry,
            app: app.into(),
            pod: pod.into(),
            port,
        }
    }

    /// Definitions this node is responsible for
    pub fn definitions(&self) -> Vec<ServiceDefinition> {
        vec![
            ServiceDefinition::primary(&self.app, self.port),
            ServiceDefinition::standbys(&self.app, self.port),
            ServiceDefinition::pod(&self.app, &self.pod, self.port),
        ]
    }

    /// Create every Service that does not exist yet
    pub async fn publish(&self) -> Result<()> {
        let store = &self.store;
        for definition in self.definitions() {
            let service = &definition;
            let created = self
                .retry
                .run("create_service", || async move {
                    match store.create(service).await {
                        Ok(()) => Ok(true),
                        Err(e) if e.is_already_exists() => Ok(false),
                        Err(e) => Err(e),
                    }
                })
                .await?;

            if created {
                tracing::info!(service = %definition.name, "Created Service");
            } else {
                tracing::debug!(service = %definition.name, "Service already exists");
            }
        }
        Ok(())
    }
}
