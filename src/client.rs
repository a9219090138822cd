//! Trait seams over the Kubernetes API
//!
//! Controllers only talk to the API server through these traits, so tests can
//! swap in mockall mocks. The `Kube*` types are the production
//! implementations wrapping a [`kube::Client`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{CatalogEntry, Condition, InstallationRecord, InstallationRecordStatus, TargetCluster};
use crate::kube_utils::{client_from_kubeconfig_yaml, get_secret_data};
use crate::Error;

/// Read access to the application catalog
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetch one entry; `None` if it does not exist
    async fn get_entry(&self, name: &str) -> Result<Option<CatalogEntry>, Error>;

    /// List every entry
    async fn list_entries(&self) -> Result<Vec<CatalogEntry>, Error>;
}

/// Access to InstallationRecords in one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// List records across all namespaces
    async fn list_records(&self) -> Result<Vec<InstallationRecord>, Error>;

    /// Create a record
    async fn create_record(&self, record: &InstallationRecord) -> Result<(), Error>;

    /// Replace a record; fails with a conflict if its resourceVersion is stale
    async fn replace_record(&self, record: &InstallationRecord) -> Result<(), Error>;

    /// Delete a record; a missing record is not an error
    async fn delete_record(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch the status sub-resource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &InstallationRecordStatus,
    ) -> Result<(), Error>;

    /// Add `finalizer` to the record as read
    async fn add_finalizer(&self, record: &InstallationRecord, finalizer: &str)
        -> Result<(), Error>;

    /// Remove `finalizer` from the record as read
    async fn remove_finalizer(
        &self,
        record: &InstallationRecord,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Namespace operations in one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Fetch a namespace; `None` if it does not exist
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create a namespace; losing a creation race is not an error
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete a namespace; a missing namespace is not an error
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;
}

/// Access to TargetCluster registrations in the management cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Add or replace one status condition of `cluster` as read.
    ///
    /// Fails with a conflict if the cluster changed since it was read.
    async fn set_condition(&self, cluster: &TargetCluster, condition: Condition)
        -> Result<(), Error>;
}

/// Clients scoped to one target cluster
#[derive(Clone)]
pub struct TargetClients {
    /// Records in the target cluster
    pub records: Arc<dyn RecordStore>,
    /// Namespaces in the target cluster
    pub namespaces: Arc<dyn NamespaceClient>,
}

/// Produces clients for target clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Clients for `cluster`
    async fn connect(&self, cluster: &TargetCluster) -> Result<TargetClients, Error>;

    /// Drop any cached connection for the named cluster
    fn forget(&self, cluster_name: &str);
}

// =============================================================================
// Kubernetes implementations
// =============================================================================

fn found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn gone_ok<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    found(result).map(|_| ())
}

/// [`CatalogStore`] over the management cluster API
pub struct KubeCatalogStore {
    client: Client,
}

impl KubeCatalogStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CatalogStore for KubeCatalogStore {
    async fn get_entry(&self, name: &str) -> Result<Option<CatalogEntry>, Error> {
        let api: Api<CatalogEntry> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn list_entries(&self) -> Result<Vec<CatalogEntry>, Error> {
        let api: Api<CatalogEntry> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// [`RecordStore`] over a cluster API
pub struct KubeRecordStore {
    client: Client,
    field_manager: String,
}

impl KubeRecordStore {
    /// Create a store using `client`, writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<InstallationRecord> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        record: &InstallationRecord,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = record.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": record.resource_version(),
            }
        });
        self.api(&namespace)
            .patch(
                &record.name_any(),
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn list_records(&self) -> Result<Vec<InstallationRecord>, Error> {
        let api: Api<InstallationRecord> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_record(&self, record: &InstallationRecord) -> Result<(), Error> {
        let namespace = record.namespace().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(&namespace).create(&params, record).await?;
        Ok(())
    }

    async fn replace_record(&self, record: &InstallationRecord) -> Result<(), Error> {
        let namespace = record.namespace().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(&namespace)
            .replace(&record.name_any(), &params, record)
            .await?;
        Ok(())
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let result = self.api(namespace).delete(name, &DeleteParams::default()).await;
        if matches!(&result, Err(kube::Error::Api(ae)) if ae.code == 404) {
            debug!(record = %name, namespace = %namespace, "record already deleted");
        }
        gone_ok(result)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &InstallationRecordStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        record: &InstallationRecord,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut finalizers = record.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(record, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        record: &InstallationRecord,
        finalizer: &str,
    ) -> Result<(), Error> {
        let finalizers: Vec<String> = record
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(record, finalizers).await
    }
}

/// [`NamespaceClient`] over a cluster API
pub struct KubeNamespaceClient {
    client: Client,
}

impl KubeNamespaceClient {
    /// Create a namespace client using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: (!labels.is_empty()).then(|| labels.clone()),
                annotations: (!annotations.is_empty()).then(|| annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %name, "namespace created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        gone_ok(api.delete(name, &DeleteParams::default()).await)
    }
}

/// [`ClusterStore`] over the management cluster API
pub struct KubeClusterStore {
    client: Client,
    field_manager: String,
}

impl KubeClusterStore {
    /// Create a store using `client`, writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

/// Status patch setting `condition` on `cluster`.
///
/// Only the conditions list is written, guarded by the resourceVersion the
/// cluster was read at, so health reported by other writers is never
/// overwritten and a stale list is rejected.
pub fn condition_patch(cluster: &TargetCluster, condition: Condition) -> serde_json::Value {
    let conditions = cluster
        .status
        .clone()
        .unwrap_or_default()
        .condition(condition)
        .conditions;
    serde_json::json!({
        "metadata": { "resourceVersion": cluster.resource_version() },
        "status": { "conditions": conditions },
    })
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn set_condition(
        &self,
        cluster: &TargetCluster,
        condition: Condition,
    ) -> Result<(), Error> {
        let api: Api<TargetCluster> = Api::all(self.client.clone());
        let patch = condition_patch(cluster, condition);
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// [`ClusterConnector`] that reads each cluster's kubeconfig secret
///
/// Clients are cached per cluster name until [`ClusterConnector::forget`].
pub struct KubeClusterConnector {
    management: Client,
    secrets_namespace: String,
    field_manager: String,
    cache: DashMap<String, Client>,
}

impl KubeClusterConnector {
    /// Create a connector reading secrets through `management`.
    ///
    /// `secrets_namespace` is used for secret references without a namespace.
    pub fn new(
        management: Client,
        secrets_namespace: impl Into<String>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            management,
            secrets_namespace: secrets_namespace.into(),
            field_manager: field_manager.into(),
            cache: DashMap::new(),
        }
    }

    async fn client_for(&self, cluster: &TargetCluster) -> Result<Client, Error> {
        let name = cluster.name_any();
        if let Some(client) = self.cache.get(&name) {
            return Ok(client.clone());
        }

        let secret_ref = &cluster.spec.kubeconfig_secret_ref;
        let namespace = secret_ref
            .namespace
            .as_deref()
            .unwrap_or(&self.secrets_namespace);
        let raw = get_secret_data(&self.management, &secret_ref.name, namespace, &secret_ref.key)
            .await
            .map_err(|e| {
                Error::cluster_connection(format!("kubeconfig for cluster {name}: {e}"))
            })?;
        let yaml = String::from_utf8(raw).map_err(|e| {
            Error::cluster_connection(format!("kubeconfig for cluster {name} is not UTF-8: {e}"))
        })?;
        let client = client_from_kubeconfig_yaml(&yaml).await?;

        info!(cluster = %name, "connected to target cluster");
        self.cache.insert(name, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ClusterConnector for KubeClusterConnector {
    async fn connect(&self, cluster: &TargetCluster) -> Result<TargetClients, Error> {
        let client = self.client_for(cluster).await?;
        Ok(TargetClients {
            records: Arc::new(KubeRecordStore::new(client.clone(), &self.field_manager)),
            namespaces: Arc::new(KubeNamespaceClient::new(client)),
        })
    }

    fn forget(&self, cluster_name: &str) {
        if self.cache.remove(cluster_name).is_some() {
            debug!(cluster = %cluster_name, "dropped cached target client");
        }
    }
}
