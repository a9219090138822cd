//! Shared setup for integration stories

use std::process::Command;

use kube::api::{Api, DeleteParams};
use kube::{Client, CustomResourceExt};

use shipyard::crd::{CatalogEntry, InstallationRecord, TargetCluster};
use shipyard::kube_utils::ensure_crds_installed;

/// Name of the kind cluster created when none is reachable
pub const TEST_CLUSTER_NAME: &str = "shipyard-integration-test";

/// Field manager used by the tests
pub const FIELD_MANAGER: &str = "shipyard-integration-test";

/// Connect to the current cluster, creating a kind cluster if needed, and
/// install the Shipyard CRDs
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = match Client::try_default().await {
        Ok(client) if client.apiserver_version().await.is_ok() => client,
        _ => {
            let status = Command::new("kind")
                .args(["create", "cluster", "--name", TEST_CLUSTER_NAME, "--wait", "120s"])
                .status()
                .map_err(|e| format!("failed to run kind: {e}"))?;
            if !status.success() {
                return Err(format!("kind create cluster exited with {status}"));
            }
            Client::try_default()
                .await
                .map_err(|e| format!("failed to connect to kind cluster: {e}"))?
        }
    };

    ensure_crds_installed(
        &client,
        vec![
            CatalogEntry::crd(),
            InstallationRecord::crd(),
            TargetCluster::crd(),
        ],
        FIELD_MANAGER,
    )
    .await
    .map_err(|e| format!("failed to install CRDs: {e}"))?;

    // Freshly created CRDs take a moment to be served
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    Ok(client)
}

/// Delete a catalog entry, ignoring absence
pub async fn delete_entry(client: &Client, name: &str) {
    let api: Api<CatalogEntry> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Delete a target cluster, ignoring absence
pub async fn delete_cluster(client: &Client, name: &str) {
    let api: Api<TargetCluster> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Force-delete a record, stripping finalizers so leftovers cannot block reruns
pub async fn purge_record(client: &Client, namespace: &str, name: &str) {
    let api: Api<InstallationRecord> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": null } });
    let _ = api
        .patch(
            name,
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await;
    let _ = api.delete(name, &DeleteParams::default()).await;
}
