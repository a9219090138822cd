//! Criterion benchmarks for convergence hot paths
//!
//! Version resolution runs on every record reconcile, and the fan-out mapping
//! on every catalog change against the whole cluster store.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::prelude::*;

use shipyard::controller::{clusters_for_entry, synthesizer::desired_record};
use shipyard::crd::{
    ApplicationSource, ApplicationVersion, CatalogEntry, CatalogEntrySpec, ClusterHealth,
    HealthStatus, HelmSource, SecretKeyRef, TargetCluster, TargetClusterSpec,
    TargetClusterStatus, TemplateMethod, VersionConstraints,
};
use shipyard::version;

// =============================================================================
// Test Fixtures
// =============================================================================

fn helm_version(version: String) -> ApplicationVersion {
    ApplicationVersion {
        source: ApplicationSource::Helm(HelmSource {
            url: "https://charts.example.com".to_string(),
            chart_name: "app".to_string(),
            chart_version: version.trim_start_matches('v').to_string(),
            insecure: false,
            plain_http: false,
            credentials: None,
        }),
        version,
        constraints: VersionConstraints::default(),
        form_fields: vec![],
    }
}

/// An entry with `n` versions declared in random order
fn entry_with_versions(n: usize) -> CatalogEntry {
    let mut rng = rand::thread_rng();
    let mut versions: Vec<_> = (0..n)
        .map(|i| helm_version(format!("v{}.{}.{}", i / 100, (i / 10) % 10, i % 10)))
        .collect();
    versions.shuffle(&mut rng);

    CatalogEntry {
        metadata: ObjectMeta {
            name: Some("bench-app".to_string()),
            labels: Some(BTreeMap::from([(
                "team".to_string(),
                "platform".to_string(),
            )])),
            ..Default::default()
        },
        spec: CatalogEntrySpec {
            display_name: None,
            description: "benchmark application".to_string(),
            method: TemplateMethod::Helm,
            versions,
            default_version: None,
            is_default: false,
            is_enforced: true,
            datacenter_selector: Some(vec!["dc-0".to_string(), "dc-1".to_string()]),
            default_namespace: None,
            default_values: Some(BTreeMap::from([(
                "replicaCount".to_string(),
                serde_json::json!(3),
            )])),
            default_values_block: None,
            default_deploy_options: None,
            documentation_url: None,
            source_url: None,
        },
    }
}

/// `n` healthy clusters spread over four datacenters, as a store snapshot
fn fleet(n: usize) -> Vec<Arc<TargetCluster>> {
    (0..n)
        .map(|i| Arc::new(TargetCluster {
            metadata: ObjectMeta {
                name: Some(format!("cluster-{i}")),
                ..Default::default()
            },
            spec: TargetClusterSpec {
                datacenter: format!("dc-{}", i % 4),
                kubeconfig_secret_ref: SecretKeyRef {
                    name: format!("cluster-{i}-kubeconfig"),
                    namespace: None,
                    key: "value".to_string(),
                },
                paused: false,
                version: None,
            },
            status: Some(TargetClusterStatus {
                health: ClusterHealth {
                    api_server: HealthStatus::Up,
                    application_controller: HealthStatus::Up,
                    cni: HealthStatus::Up,
                },
                conditions: vec![],
            }),
        }))
        .collect()
}

// =============================================================================
// Version Resolution
// =============================================================================

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_version");

    for size in [10, 100, 1000] {
        let entry = entry_with_versions(size);
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("highest", size), &entry, |b, entry| {
            b.iter(|| version::resolve("bench-app", black_box(&entry.spec), None));
        });

        group.bench_with_input(BenchmarkId::new("pinned", size), &entry, |b, entry| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let wanted = &entry.spec.versions[rng.gen_range(0..size)].version;
                version::resolve("bench-app", black_box(&entry.spec), Some(wanted))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Fan-out and Synthesis
// =============================================================================

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_fanout");
    let entry = entry_with_versions(10);

    for size in [10, 100, 1000] {
        let clusters = fleet(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(
            BenchmarkId::new("clusters_for_entry", size),
            &clusters,
            |b, clusters| {
                b.iter(|| clusters_for_entry(black_box(&entry), black_box(clusters)));
            },
        );
    }

    group.finish();
}

fn bench_desired_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("desired_record");

    for size in [10, 100] {
        let entry = entry_with_versions(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("build", size), &entry, |b, entry| {
            b.iter(|| desired_record(black_box(entry), "bench-app"));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_resolve,
    bench_fanout,
    bench_desired_record,
);
criterion_main!(benches);
