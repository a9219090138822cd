//! Integration tests for CRD operations
//!
//! These tests tell the story of how a platform team publishes applications
//! and how cluster users declare installations through the Kubernetes API.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};

use shipyard::crd::{
    AppNamespaceSpec, ApplicationRef, ApplicationSource, ApplicationVersion, CatalogEntry,
    CatalogEntrySpec, HelmSource, InstallationRecord, InstallationRecordSpec, TemplateMethod,
    VersionConstraints,
};

use super::helpers::{delete_entry, ensure_test_cluster, purge_record};

// =============================================================================
// Test Fixtures
// =============================================================================

fn nginx_version(version: &str) -> ApplicationVersion {
    ApplicationVersion {
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
    }
}

fn catalog_entry(name: &str, versions: &[&str]) -> CatalogEntry {
    CatalogEntry {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CatalogEntrySpec {
            display_name: Some("NGINX".to_string()),
            description: "Web server".to_string(),
            method: TemplateMethod::Helm,
            versions: versions.iter().map(|v| nginx_version(v)).collect(),
            default_version: None,
            is_default: false,
            is_enforced: false,
            datacenter_selector: None,
            default_namespace: None,
            default_values: Some(BTreeMap::from([(
                "replicaCount".to_string(),
                serde_json::json!(2),
            )])),
            default_values_block: None,
            default_deploy_options: None,
            documentation_url: None,
            source_url: None,
        },
    }
}

// =============================================================================
// Catalog Stories
// =============================================================================

/// Story: A platform team publishes an application with two versions
///
/// Expected behavior:
/// - The CatalogEntry is stored cluster-wide
/// - Versions keep their declaration order
/// - Structured default values survive the round trip through the API
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_platform_team_publishes_application() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let api: Api<CatalogEntry> = Api::all(client.clone());
    let name = "it-publish-nginx";
    delete_entry(&client, name).await;

    api.create(&PostParams::default(), &catalog_entry(name, &["v1.0.0", "v1.1.0"]))
        .await
        .expect("failed to create catalog entry");

    let stored = api.get(name).await.expect("failed to read catalog entry");
    let versions: Vec<_> = stored.spec.versions.iter().map(|v| v.version.as_str()).collect();
    assert_eq!(versions, vec!["v1.0.0", "v1.1.0"]);
    assert_eq!(
        stored.spec.default_values.unwrap()["replicaCount"],
        serde_json::json!(2)
    );

    delete_entry(&client, name).await;
}

// =============================================================================
// Installation Record Stories
// =============================================================================

/// Story: A cluster user declares an installation with the minimum of fields
///
/// Expected behavior:
/// - The namespace is created by default
/// - The version is left unset, meaning "highest available"
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_declares_minimal_installation() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let api: Api<InstallationRecord> = Api::namespaced(client.clone(), "default");
    let name = "it-minimal-record";
    purge_record(&client, "default", name).await;

    let record = InstallationRecord {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: InstallationRecordSpec {
            namespace: AppNamespaceSpec::owned("it-minimal"),
            application_ref: ApplicationRef {
                name: "nginx".to_string(),
                version: None,
            },
            values_override: None,
            values_override_block: None,
            deploy_options: None,
            reconciliation_interval_seconds: None,
        },
        status: None,
    };
    api.create(&PostParams::default(), &record)
        .await
        .expect("failed to create record");

    let stored = api.get(name).await.expect("failed to read record");
    assert!(stored.spec.namespace.create);
    assert!(stored.spec.application_ref.version.is_none());
    assert!(stored.status.is_none());

    purge_record(&client, "default", name).await;
}
