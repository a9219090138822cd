//! TargetCluster controller synthesizing default and enforced applications
//!
//! For every eligible cluster, each catalog entry that is enforced (or default,
//! unless the cluster opted out of defaults) gets an InstallationRecord in the
//! target cluster. Enforced records are kept in sync with their entry; default
//! records are created once and then belong to the cluster's users.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{
    CatalogStore, ClusterConnector, ClusterStore, KubeCatalogStore, KubeClusterConnector,
    KubeClusterStore, TargetClients,
};
use crate::crd::{
    annotation_is_true, AppNamespaceSpec, ApplicationRef, CatalogEntry, Condition,
    ConditionStatus, InstallationRecord, InstallationRecordSpec, TargetCluster,
    CONDITION_DEFAULT_APPLICATIONS_CREATED, CONDITION_INITIAL_APPLICATIONS_RECONCILED,
    DEFAULTED_ANNOTATION, ENFORCED_ANNOTATION, INITIAL_APPLICATIONS_ANNOTATION,
    LAST_APPLIED_ANNOTATION, RECONCILIATION_INTERVAL_ANNOTATION,
};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::kube_utils::is_deleting;
use crate::namespace::NamespaceManager;
use crate::retry::{FailureBackoff, RetryConfig};
use crate::version::default_version_string;
use crate::Error;

/// How long to wait before looking at a cluster whose components are not up
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// Shared state for the synthesizer
pub struct SynthesizerContext {
    /// TargetClusters in the management cluster
    pub clusters: Arc<dyn ClusterStore>,
    /// The catalog
    pub catalog: Arc<dyn CatalogStore>,
    /// Clients for target clusters
    pub connector: Arc<dyn ClusterConnector>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Namespace records are created in, overriding each entry's default
    pub applications_namespace: Option<String>,
    /// Requeue delays for clusters that keep failing
    pub backoff: FailureBackoff,
}

impl SynthesizerContext {
    /// Create a builder using `client` for the management cluster
    pub fn builder(client: Client) -> SynthesizerContextBuilder {
        SynthesizerContextBuilder {
            client,
            field_manager: crate::DEFAULT_FIELD_MANAGER.to_string(),
            secrets_namespace: crate::DEFAULT_SYSTEM_NAMESPACE.to_string(),
            applications_namespace: None,
            connector: None,
            events: None,
            backoff: None,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        clusters: Arc<dyn ClusterStore>,
        catalog: Arc<dyn CatalogStore>,
        connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        Self {
            clusters,
            catalog,
            connector,
            events: Arc::new(crate::events::NoopEventPublisher),
            applications_namespace: None,
            backoff: FailureBackoff::default(),
        }
    }
}

/// Builder for [`SynthesizerContext`]
pub struct SynthesizerContextBuilder {
    client: Client,
    field_manager: String,
    secrets_namespace: String,
    applications_namespace: Option<String>,
    connector: Option<Arc<dyn ClusterConnector>>,
    events: Option<Arc<dyn EventPublisher>>,
    backoff: Option<RetryConfig>,
}

impl SynthesizerContextBuilder {
    /// Field manager for writes
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Namespace for kubeconfig secrets without an explicit namespace
    pub fn secrets_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.secrets_namespace = namespace.into();
        self
    }

    /// Namespace synthesized records are created in
    pub fn applications_namespace(mut self, namespace: Option<String>) -> Self {
        self.applications_namespace = namespace;
        self
    }

    /// Override the cluster connector
    pub fn connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Requeue backoff for failing clusters
    pub fn backoff(mut self, config: RetryConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Build the context
    pub fn build(self) -> SynthesizerContext {
        let client = self.client;
        let field_manager = self.field_manager;
        let secrets_namespace = self.secrets_namespace;
        SynthesizerContext {
            clusters: Arc::new(KubeClusterStore::new(client.clone(), &field_manager)),
            catalog: Arc::new(KubeCatalogStore::new(client.clone())),
            connector: self.connector.unwrap_or_else(|| {
                Arc::new(KubeClusterConnector::new(
                    client.clone(),
                    secrets_namespace,
                    field_manager,
                ))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(client, "shipyard-synthesizer"))
            }),
            applications_namespace: self.applications_namespace,
            backoff: self.backoff.map(FailureBackoff::new).unwrap_or_default(),
        }
    }
}

/// Reconcile the applications a TargetCluster must carry.
///
/// Success clears the cluster's failure backoff. Failures other than a
/// partial batch failure, which is reported on its own, become a warning
/// Event.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(
    cluster: Arc<TargetCluster>,
    ctx: Arc<SynthesizerContext>,
) -> Result<Action, Error> {
    match synthesize(&cluster, &ctx).await {
        Ok(action) => {
            ctx.backoff.reset(&cluster.name_any());
            Ok(action)
        }
        Err(e) => {
            if !matches!(e, Error::PartialFailure(_)) {
                ctx.events
                    .publish(
                        &cluster.object_ref(&()),
                        EventType::Warning,
                        reasons::RECONCILE_FAILED,
                        actions::SYNTHESIZE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            Err(e)
        }
    }
}

async fn synthesize(cluster: &TargetCluster, ctx: &SynthesizerContext) -> Result<Action, Error> {
    let name = cluster.name_any();

    if is_deleting(cluster) {
        ctx.connector.forget(&name);
        return Ok(Action::await_change());
    }
    if cluster.spec.paused {
        debug!("cluster is paused");
        return Ok(Action::await_change());
    }
    if !cluster.is_install_eligible() {
        debug!("cluster components not up yet");
        return Ok(Action::requeue(NOT_READY_REQUEUE));
    }

    let ignore_defaults = ignores_defaults(cluster);
    let entries = ctx.catalog.list_entries().await?;
    let selected: Vec<&CatalogEntry> = entries
        .iter()
        .filter(|e| is_selected(e, &cluster.spec.datacenter, ignore_defaults))
        .collect();
    debug!(
        selected = selected.len(),
        ignore_defaults, "selected catalog entries"
    );

    let target = ctx.connector.connect(cluster).await?;
    let existing = target.records.list_records().await?;

    let mut errors = Vec::new();
    for entry in &selected {
        let result =
            converge_entry(entry, &existing, &target, ctx.applications_namespace.as_deref())
                .await;
        if let Err(e) = result {
            warn!(entry = %entry.name_any(), error = %e, "failed to synthesize record");
            errors.push(format!("{}: {e}", entry.name_any()));
        }
    }

    for record in &existing {
        if !annotation_is_true(record.annotations(), ENFORCED_ANNOTATION) {
            continue;
        }
        let app = &record.spec.application_ref.name;
        let still_enforced = selected
            .iter()
            .any(|e| e.spec.is_enforced && e.name_any() == *app);
        let entry_exists = entries.iter().any(|e| e.name_any() == *app);
        // Records whose entry is gone are removed by the installation controller
        if still_enforced || !entry_exists {
            continue;
        }
        if let Err(e) = release_enforcement(record, &target).await {
            warn!(record = %record.name_any(), error = %e, "failed to release enforcement");
            errors.push(format!("{}: {e}", record.name_any()));
        }
    }

    if !errors.is_empty() {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Warning,
                reasons::RECONCILING_ERROR,
                actions::SYNTHESIZE,
                Some(errors.join("; ")),
            )
            .await;
        return Err(Error::PartialFailure(errors));
    }

    let marked = cluster.status.as_ref().is_some_and(|s| {
        s.has_condition_value(CONDITION_DEFAULT_APPLICATIONS_CREATED, ConditionStatus::True)
    });
    if !marked {
        mark_defaults_created(cluster, ctx).await?;
    }
    Ok(Action::await_change())
}

/// Create or update the record for one selected entry
async fn converge_entry(
    entry: &CatalogEntry,
    existing: &[InstallationRecord],
    target: &TargetClients,
    applications_namespace: Option<&str>,
) -> Result<(), Error> {
    let entry_name = entry.name_any();
    let current = find_existing(&entry_name, applications_namespace, entry, existing);
    let namespace = match current {
        Some(record) => record.namespace().unwrap_or_default(),
        None => record_namespace(entry, applications_namespace),
    };
    let desired = desired_record(entry, &namespace)?;

    match current {
        None => {
            NamespaceManager::new(target.namespaces.as_ref())
                .ensure(&AppNamespaceSpec::owned(&namespace))
                .await?;
            target.records.create_record(&desired).await?;
            info!(entry = %entry_name, namespace = %namespace, "created record");
        }
        Some(record) if entry.spec.is_enforced && differs(record, &desired) => {
            let mut updated = record.clone();
            updated.spec = desired.spec;
            updated.metadata.labels = desired.metadata.labels;
            updated.metadata.annotations = desired.metadata.annotations;
            target.records.replace_record(&updated).await?;
            info!(entry = %entry_name, namespace = %namespace, "restored enforced record");
        }
        Some(_) => debug!(entry = %entry_name, "record exists"),
    }
    Ok(())
}

/// The record created for `entry`, preferring one this controller created
fn find_existing<'a>(
    entry_name: &str,
    applications_namespace: Option<&str>,
    entry: &CatalogEntry,
    records: &'a [InstallationRecord],
) -> Option<&'a InstallationRecord> {
    let synthesized = |r: &InstallationRecord| {
        r.annotations().contains_key(ENFORCED_ANNOTATION)
            || r.annotations().contains_key(DEFAULTED_ANNOTATION)
    };
    let namespace = record_namespace(entry, applications_namespace);
    records
        .iter()
        .find(|r| r.name_any() == entry_name && synthesized(r))
        .or_else(|| {
            records.iter().find(|r| {
                r.name_any() == entry_name && r.namespace().as_deref() == Some(namespace.as_str())
            })
        })
}

/// Namespace a new record for `entry` is created in
pub fn record_namespace(entry: &CatalogEntry, applications_namespace: Option<&str>) -> String {
    if let Some(ns) = applications_namespace.filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }
    entry
        .spec
        .default_namespace
        .as_ref()
        .map(|ns| ns.name.clone())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| entry.name_any())
}

/// The record an entry implies, placed in `namespace`
pub fn desired_record(entry: &CatalogEntry, namespace: &str) -> Result<InstallationRecord, Error> {
    let entry_name = entry.name_any();
    let version = default_version_string(&entry_name, &entry.spec)?;

    let mut annotations: BTreeMap<String, String> = entry
        .annotations()
        .iter()
        .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if entry.spec.is_enforced {
        annotations.insert(ENFORCED_ANNOTATION.to_string(), "true".to_string());
    }
    if entry.spec.is_default {
        annotations.insert(DEFAULTED_ANNOTATION.to_string(), "true".to_string());
    }

    let (values_override, values_override_block) = synthesized_values(entry);
    let reconciliation_interval_seconds = entry
        .annotations()
        .get(RECONCILIATION_INTERVAL_ANNOTATION)
        .and_then(|v| parse_interval(v));

    Ok(InstallationRecord {
        metadata: ObjectMeta {
            name: Some(entry_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(entry.labels().clone()).filter(|l| !l.is_empty()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: InstallationRecordSpec {
            namespace: entry
                .spec
                .default_namespace
                .clone()
                .unwrap_or_else(|| AppNamespaceSpec::owned(&entry_name)),
            application_ref: ApplicationRef {
                name: entry_name,
                version: Some(version),
            },
            values_override,
            values_override_block,
            deploy_options: entry.spec.default_deploy_options.clone(),
            reconciliation_interval_seconds,
        },
        status: None,
    })
}

type SynthesizedValues = (
    Option<BTreeMap<String, serde_json::Value>>,
    Option<String>,
);

/// Entry defaults as record overrides; structured values become a YAML block
fn synthesized_values(entry: &CatalogEntry) -> SynthesizedValues {
    if let Some(block) = entry
        .spec
        .default_values_block
        .as_ref()
        .filter(|b| !b.trim().is_empty())
    {
        return (None, Some(block.clone()));
    }
    match &entry.spec.default_values {
        Some(values) if !values.is_empty() => match serde_yaml::to_string(values) {
            Ok(block) => (None, Some(block)),
            Err(e) => {
                debug!(error = %e, "default values not representable as YAML");
                (Some(values.clone()), None)
            }
        },
        _ => (None, None),
    }
}

/// Parse "90", "90s", "15m" or "2h" into seconds
pub fn parse_interval(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last()? {
        (i, 's') => (&raw[..i], 1),
        (i, 'm') => (&raw[..i], 60),
        (i, 'h') => (&raw[..i], 3600),
        _ => (raw, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|n| *n > 0)
}

fn differs(current: &InstallationRecord, desired: &InstallationRecord) -> bool {
    let comparable = |annotations: &BTreeMap<String, String>| {
        annotations
            .iter()
            .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    current.spec != desired.spec
        || current.labels() != desired.labels()
        || comparable(current.annotations()) != comparable(desired.annotations())
}

/// Mark a record as no longer enforced so its users may change it
async fn release_enforcement(
    record: &InstallationRecord,
    target: &TargetClients,
) -> Result<(), Error> {
    let mut released = record.clone();
    released
        .annotations_mut()
        .insert(ENFORCED_ANNOTATION.to_string(), "false".to_string());
    target.records.replace_record(&released).await?;
    info!(record = %record.name_any(), "application no longer enforced");
    Ok(())
}

/// Returns true if default applications must not be (re)created on `cluster`
pub fn ignores_defaults(cluster: &TargetCluster) -> bool {
    let requested_initial = cluster
        .annotations()
        .get(INITIAL_APPLICATIONS_ANNOTATION)
        .is_some_and(|v| !v.trim().is_empty());
    let status = cluster.status.as_ref();
    requested_initial
        || status.is_some_and(|s| s.has_condition(CONDITION_INITIAL_APPLICATIONS_RECONCILED))
        || status.is_some_and(|s| {
            s.has_condition_value(CONDITION_DEFAULT_APPLICATIONS_CREATED, ConditionStatus::True)
        })
}

/// Returns true if `entry` must have a record on a cluster in `datacenter`
pub fn is_selected(entry: &CatalogEntry, datacenter: &str, ignore_defaults: bool) -> bool {
    !is_deleting(entry)
        && entry.spec.selects_datacenter(datacenter)
        && (entry.spec.is_enforced || (entry.spec.is_default && !ignore_defaults))
}

async fn mark_defaults_created(
    cluster: &TargetCluster,
    ctx: &SynthesizerContext,
) -> Result<(), Error> {
    let condition = Condition::new(
        CONDITION_DEFAULT_APPLICATIONS_CREATED,
        ConditionStatus::True,
        "DefaultApplicationsCreated",
        "all default applications have been created",
    );
    ctx.clusters.set_condition(cluster, condition).await?;
    info!("default applications created");
    Ok(())
}

/// Requeue a failed cluster with per-cluster exponential backoff
pub fn error_policy(cluster: Arc<TargetCluster>, error: &Error, ctx: Arc<SynthesizerContext>) -> Action {
    let delay = ctx
        .backoff
        .next_delay(&cluster.name_any(), error.is_retryable());
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retry_in_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );
    Action::requeue(delay)
}
