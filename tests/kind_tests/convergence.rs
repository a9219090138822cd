//! Integration tests for catalog convergence
//!
//! These stories run the synthesizer and the installation reconciler against
//! a real API server. The "target cluster" is the test cluster itself and the
//! installer only records what it was asked to do, so no charts are pulled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

use shipyard::client::{ClusterConnector, KubeNamespaceClient, KubeRecordStore, TargetClients};
use shipyard::controller::{installation, synthesizer, InstallationContext, SynthesizerContext};
use shipyard::crd::{
    ApplicationSource, ApplicationVersion, CatalogEntry, CatalogEntrySpec, ClusterHealth,
    ConditionStatus, HealthStatus, HelmSource, InstallationRecord, SecretKeyRef, TargetCluster,
    TargetClusterSpec, TargetClusterStatus, TemplateMethod, VersionConstraints, CLEANUP_FINALIZER,
    CONDITION_DEFAULT_APPLICATIONS_CREATED, ENFORCED_ANNOTATION,
};
use shipyard::installer::{InstallOutcome, Installer, ResolvedApplication};

use super::helpers::{
    delete_cluster, delete_entry, ensure_test_cluster, purge_record, FIELD_MANAGER,
};

// =============================================================================
// Test Doubles
// =============================================================================

/// Connector handing out clients for the test cluster regardless of target
struct LocalConnector {
    client: Client,
}

#[async_trait]
impl ClusterConnector for LocalConnector {
    async fn connect(&self, _cluster: &TargetCluster) -> Result<TargetClients, shipyard::Error> {
        Ok(TargetClients {
            records: Arc::new(KubeRecordStore::new(self.client.clone(), FIELD_MANAGER)),
            namespaces: Arc::new(KubeNamespaceClient::new(self.client.clone())),
        })
    }

    fn forget(&self, _cluster_name: &str) {}
}

/// Installer remembering what it installed and removed
#[derive(Default)]
struct RecordingInstaller {
    applied: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn apply(
        &self,
        record: &InstallationRecord,
        app: &ResolvedApplication,
    ) -> InstallOutcome {
        self.applied
            .lock()
            .unwrap()
            .push((record.name_any(), app.version.version.clone()));
        InstallOutcome::ok()
    }

    async fn delete(&self, record: &InstallationRecord) -> InstallOutcome {
        self.deleted.lock().unwrap().push(record.name_any());
        InstallOutcome::ok()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn enforced_entry(name: &str, version: &str) -> CatalogEntry {
    CatalogEntry {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CatalogEntrySpec {
            display_name: None,
            description: format!("{name} for every cluster"),
            method: TemplateMethod::Helm,
            versions: vec![ApplicationVersion {
                version: version.to_string(),
                constraints: VersionConstraints::default(),
                source: ApplicationSource::Helm(HelmSource {
                    url: "https://charts.bitnami.com/bitnami".to_string(),
                    chart_name: "nginx".to_string(),
                    chart_version: version.trim_start_matches('v').to_string(),
                    insecure: false,
                    plain_http: false,
                    credentials: None,
                }),
                form_fields: vec![],
            }],
            default_version: None,
            is_default: false,
            is_enforced: true,
            datacenter_selector: None,
            default_namespace: None,
            default_values: None,
            default_values_block: None,
            default_deploy_options: None,
            documentation_url: None,
            source_url: None,
        },
    }
}

/// Register a cluster and mark every component healthy
async fn register_healthy_cluster(client: &Client, name: &str) -> TargetCluster {
    let api: Api<TargetCluster> = Api::all(client.clone());
    let cluster = TargetCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: TargetClusterSpec {
            datacenter: "dc1".to_string(),
            kubeconfig_secret_ref: SecretKeyRef {
                name: format!("{name}-kubeconfig"),
                namespace: Some("shipyard-system".to_string()),
                key: "value".to_string(),
            },
            paused: false,
            version: None,
        },
        status: None,
    };
    api.create(&PostParams::default(), &cluster)
        .await
        .expect("failed to create target cluster");

    let status = TargetClusterStatus {
        health: ClusterHealth {
            api_server: HealthStatus::Up,
            application_controller: HealthStatus::Up,
            cni: HealthStatus::Up,
        },
        conditions: vec![],
    };
    // Health is reported by whoever provisions the cluster
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
    .expect("failed to patch cluster status");

    api.get(name).await.expect("failed to read target cluster")
}

fn installation_context(
    client: &Client,
    installer: Arc<RecordingInstaller>,
) -> Arc<InstallationContext> {
    Arc::new(
        InstallationContext::builder(client.clone(), client.clone())
            .installer(installer)
            .field_manager(FIELD_MANAGER)
            .build(),
    )
}

/// Reconcile the record until `done` holds for it (or it is gone), re-reading
/// it between passes the way a watch would
async fn reconcile_record_until(
    client: &Client,
    ctx: &Arc<InstallationContext>,
    namespace: &str,
    name: &str,
    done: impl Fn(Option<&InstallationRecord>) -> bool,
) -> Option<InstallationRecord> {
    let api: Api<InstallationRecord> = Api::namespaced(client.clone(), namespace);
    for _ in 0..10 {
        let current = api.get_opt(name).await.expect("failed to read record");
        if done(current.as_ref()) {
            return current;
        }
        let Some(record) = current else {
            panic!("record {namespace}/{name} vanished early");
        };
        // Errors are expected on the way, e.g. while the entry is missing
        let _ = installation::reconcile(Arc::new(record), ctx.clone()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("record {namespace}/{name} did not converge");
}

// =============================================================================
// Synthesizer Stories
// =============================================================================

/// Story: An enforced application lands on a freshly registered cluster
///
/// The platform publishes nginx v1.0.0 as enforced. Once the cluster reports
/// healthy, one synthesizer pass creates the record, marks it enforced, and
/// records on the cluster that its default applications exist.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_enforced_application_lands_on_new_cluster() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let entry_name = "it-nginx";
    let cluster_name = "it-synth-cluster";
    delete_entry(&client, entry_name).await;
    delete_cluster(&client, cluster_name).await;
    purge_record(&client, entry_name, entry_name).await;

    Api::<CatalogEntry>::all(client.clone())
        .create(&PostParams::default(), &enforced_entry(entry_name, "v1.0.0"))
        .await
        .expect("failed to create catalog entry");
    let cluster = register_healthy_cluster(&client, cluster_name).await;

    let ctx = Arc::new(
        SynthesizerContext::builder(client.clone())
            .field_manager(FIELD_MANAGER)
            .connector(Arc::new(LocalConnector {
                client: client.clone(),
            }))
            .build(),
    );
    synthesizer::reconcile(Arc::new(cluster), ctx)
        .await
        .expect("synthesizer pass should succeed");

    let record = Api::<InstallationRecord>::namespaced(client.clone(), entry_name)
        .get(entry_name)
        .await
        .expect("record should have been synthesized");
    assert_eq!(record.spec.application_ref.name, entry_name);
    assert_eq!(record.spec.application_ref.version.as_deref(), Some("v1.0.0"));
    assert_eq!(
        record.annotations().get(ENFORCED_ANNOTATION).map(String::as_str),
        Some("true")
    );

    let cluster = Api::<TargetCluster>::all(client.clone())
        .get(cluster_name)
        .await
        .expect("failed to read target cluster");
    assert!(cluster
        .status
        .expect("cluster status")
        .has_condition_value(CONDITION_DEFAULT_APPLICATIONS_CREATED, ConditionStatus::True));

    purge_record(&client, entry_name, entry_name).await;
    delete_cluster(&client, cluster_name).await;
    delete_entry(&client, entry_name).await;
}

// =============================================================================
// Installation Stories
// =============================================================================

/// Story: Removing an application from the catalog removes it from clusters
///
/// A record is installed from an entry. The entry is then deleted; the next
/// passes delete the record, uninstall it, and release its finalizer.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleted_entry_cascades_to_installed_record() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let entry_name = "it-cascade";
    delete_entry(&client, entry_name).await;
    purge_record(&client, "default", entry_name).await;

    Api::<CatalogEntry>::all(client.clone())
        .create(&PostParams::default(), &enforced_entry(entry_name, "v1.0.0"))
        .await
        .expect("failed to create catalog entry");

    let mut record = synthesizer::desired_record(
        &enforced_entry(entry_name, "v1.0.0"),
        "default",
    )
    .expect("desired record");
    record.metadata.resource_version = None;
    Api::<InstallationRecord>::namespaced(client.clone(), "default")
        .create(&PostParams::default(), &record)
        .await
        .expect("failed to create record");

    let installer = Arc::new(RecordingInstaller::default());
    let ctx = installation_context(&client, installer.clone());

    reconcile_record_until(&client, &ctx, "default", entry_name, |r| {
        r.and_then(|r| r.status.as_ref())
            .map(|s| s.was_installed())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        installer.applied.lock().unwrap().first(),
        Some(&(entry_name.to_string(), "v1.0.0".to_string()))
    );
    let installed = Api::<InstallationRecord>::namespaced(client.clone(), "default")
        .get(entry_name)
        .await
        .expect("failed to read record");
    assert!(installed.finalizers().iter().any(|f| f == CLEANUP_FINALIZER));

    delete_entry(&client, entry_name).await;

    let gone = reconcile_record_until(&client, &ctx, "default", entry_name, |r| r.is_none()).await;
    assert!(gone.is_none());
    assert_eq!(
        installer.deleted.lock().unwrap().as_slice(),
        &[entry_name.to_string()]
    );
}
