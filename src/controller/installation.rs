//! InstallationRecord controller
//!
//! Drives one record toward "installed at the resolved version" and back to
//! "gone" when the record is deleted. The lifecycle is derived from the record
//! and its finalizer rather than stored:
//!
//! ```text
//! Pending -> Installed -> Terminating -> Gone
//! ```
//!
//! The cleanup finalizer is added before anything is installed, so a remote
//! release always has a record tracking it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use semver::Version;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{
    CatalogStore, KubeCatalogStore, KubeNamespaceClient, KubeRecordStore, NamespaceClient,
    RecordStore,
};
use crate::crd::{
    annotation_is_true, ApplicationVersion, CatalogEntry, ConditionStatus, InstallationRecord,
    InstallationRecordStatus, CLEANUP_FINALIZER, CONDITION_READY, SKIP_UNINSTALL_ANNOTATION,
};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::installer::{HelmInstaller, InstallOutcome, Installer, ResolvedApplication};
use crate::kube_utils::{has_finalizer, is_deleting};
use crate::namespace::NamespaceManager;
use crate::retry::{FailureBackoff, RetryConfig};
use crate::version;
use crate::Error;

/// Consecutive failed atomic installs tolerated before giving up
pub const MAX_ATOMIC_FAILURES: u32 = 5;

/// Shared state for the installation controller
pub struct InstallationContext {
    /// Catalog, read from the management cluster
    pub catalog: Arc<dyn CatalogStore>,
    /// Records in this cluster
    pub records: Arc<dyn RecordStore>,
    /// Namespaces in this cluster
    pub namespaces: Arc<dyn NamespaceClient>,
    /// Installer bound to this cluster
    pub installer: Arc<dyn Installer>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Platform version, checked against version constraints
    pub platform_version: Option<Version>,
    /// Kubernetes version of this cluster, checked against version constraints
    pub orchestrator_version: Option<Version>,
    /// Requeue delays for records that keep failing
    pub backoff: FailureBackoff,
}

impl InstallationContext {
    /// Create a builder.
    ///
    /// `client` talks to the cluster records live in; `catalog_client` to the
    /// cluster holding the catalog, which also holds repository credentials.
    pub fn builder(client: Client, catalog_client: Client) -> InstallationContextBuilder {
        InstallationContextBuilder {
            client,
            catalog_client,
            installer: None,
            helm_binary: "helm".to_string(),
            git_binary: "git".to_string(),
            credentials_namespace: crate::DEFAULT_SYSTEM_NAMESPACE.to_string(),
            field_manager: crate::DEFAULT_FIELD_MANAGER.to_string(),
            events: None,
            platform_version: None,
            orchestrator_version: None,
            backoff: None,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        catalog: Arc<dyn CatalogStore>,
        records: Arc<dyn RecordStore>,
        namespaces: Arc<dyn NamespaceClient>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            catalog,
            records,
            namespaces,
            installer,
            events: Arc::new(crate::events::NoopEventPublisher),
            platform_version: None,
            orchestrator_version: None,
            backoff: FailureBackoff::default(),
        }
    }
}

/// Builder for [`InstallationContext`]
pub struct InstallationContextBuilder {
    client: Client,
    catalog_client: Client,
    installer: Option<Arc<dyn Installer>>,
    helm_binary: String,
    git_binary: String,
    credentials_namespace: String,
    field_manager: String,
    events: Option<Arc<dyn EventPublisher>>,
    platform_version: Option<Version>,
    orchestrator_version: Option<Version>,
    backoff: Option<RetryConfig>,
}

impl InstallationContextBuilder {
    /// Use this installer instead of helm
    pub fn installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// helm and git executables for the default installer
    pub fn binaries(mut self, helm: impl Into<String>, git: impl Into<String>) -> Self {
        self.helm_binary = helm.into();
        self.git_binary = git.into();
        self
    }

    /// Namespace for credential secret references without one
    pub fn credentials_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.credentials_namespace = namespace.into();
        self
    }

    /// Requeue backoff for failing records
    pub fn backoff(mut self, config: RetryConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Field manager for writes
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Platform version for constraint checks
    pub fn platform_version(mut self, version: Option<Version>) -> Self {
        self.platform_version = version;
        self
    }

    /// Kubernetes version for constraint checks
    pub fn orchestrator_version(mut self, version: Option<Version>) -> Self {
        self.orchestrator_version = version;
        self
    }

    /// Helm installer resolving credentials where the catalog lives
    fn helm_installer(&self) -> HelmInstaller {
        HelmInstaller::new(&self.helm_binary, &self.git_binary)
            .with_credentials(self.catalog_client.clone(), &self.credentials_namespace)
    }

    /// Build the context
    pub fn build(self) -> InstallationContext {
        let installer = self
            .installer
            .clone()
            .unwrap_or_else(|| Arc::new(self.helm_installer()));
        InstallationContext {
            catalog: Arc::new(KubeCatalogStore::new(self.catalog_client)),
            records: Arc::new(KubeRecordStore::new(self.client.clone(), &self.field_manager)),
            namespaces: Arc::new(KubeNamespaceClient::new(self.client.clone())),
            installer,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client,
                    "shipyard-installation-controller",
                ))
            }),
            platform_version: self.platform_version,
            orchestrator_version: self.orchestrator_version,
            backoff: self.backoff.map(FailureBackoff::new).unwrap_or_default(),
        }
    }
}

fn backoff_key(record: &InstallationRecord) -> String {
    format!(
        "{}/{}",
        record.namespace().unwrap_or_default(),
        record.name_any()
    )
}

/// Reconcile an InstallationRecord.
///
/// Success clears the record's failure backoff; failures are surfaced as a
/// warning Event before [`error_policy`] schedules the retry.
#[instrument(skip(record, ctx), fields(record = %record.name_any(), namespace = %record.namespace().unwrap_or_default()))]
pub async fn reconcile(
    record: Arc<InstallationRecord>,
    ctx: Arc<InstallationContext>,
) -> Result<Action, Error> {
    match reconcile_record(record.clone(), ctx.clone()).await {
        Ok(action) => {
            ctx.backoff.reset(&backoff_key(&record));
            Ok(action)
        }
        Err(e) => {
            publish(
                &ctx,
                &record,
                EventType::Warning,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            Err(e)
        }
    }
}

async fn reconcile_record(
    record: Arc<InstallationRecord>,
    ctx: Arc<InstallationContext>,
) -> Result<Action, Error> {
    if is_deleting(record.as_ref()) {
        return reconcile_delete(&record, &ctx).await;
    }

    if !has_finalizer(record.as_ref(), CLEANUP_FINALIZER) {
        ctx.records.add_finalizer(&record, CLEANUP_FINALIZER).await?;
        debug!("added cleanup finalizer");
    }

    let mut original = record.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let generation = record.metadata.generation;
    let app_name = &record.spec.application_ref.name;

    let entry = match ctx.catalog.get_entry(app_name).await? {
        Some(entry) if is_deleting(&entry) => {
            return cascade_delete(
                &record,
                &ctx,
                reasons::APPLICATION_DEFINITION_DELETING,
                format!("catalog entry {app_name} is being deleted"),
            )
            .await;
        }
        Some(entry) => entry,
        None => {
            let missing = Error::not_found(format!("catalog entry {app_name} does not exist"));
            return missing_dependency(
                &record,
                &ctx,
                status,
                &original,
                reasons::APPLICATION_DEFINITION_REMOVED,
                missing,
            )
            .await;
        }
    };

    let desired = record.spec.application_ref.version.as_deref();
    let version = match version::resolve(app_name, &entry.spec, desired) {
        Ok(v) => v.clone(),
        Err(e) if e.is_not_found() => {
            return missing_dependency(
                &record,
                &ctx,
                status,
                &original,
                reasons::APPLICATION_VERSION_REMOVED,
                e,
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = validate(&record, &entry, &version, &ctx) {
        return fail_validation(&record, &ctx, status, &original, e).await;
    }

    // Status reflects intent before the install is attempted
    if status.resolved_application_version.as_ref() != Some(&version)
        || status.method.as_ref() != Some(&entry.spec.method)
    {
        info!(version = %version.version, "resolved application version");
        status.resolved_application_version = Some(version.clone());
        status.method = Some(entry.spec.method.clone());
        persist_status(&record, &ctx, &original, &status).await?;
        original = status.clone();
    }

    let observed = status.condition(CONDITION_READY).and_then(|c| c.observed_generation);
    if observed != generation && status.failures > 0 {
        debug!(failures = status.failures, "spec changed, resetting failure count");
        status.failures = 0;
    }

    let app = ResolvedApplication::new(&entry, &record, &version)?;
    let limited = app.deploy_options.is_atomic();
    let now = Utc::now();

    if limited && status.failures > MAX_ATOMIC_FAILURES {
        let already_reported = status
            .condition(CONDITION_READY)
            .is_some_and(|c| c.reason == "InstallationFailedRetriesExceeded");
        if !already_reported {
            warn!(failures = status.failures, "giving up until the record changes");
            status.set_condition(
                CONDITION_READY,
                ConditionStatus::False,
                "InstallationFailedRetriesExceeded",
                format!(
                    "installation failed {} times; edit the record to retry",
                    status.failures
                ),
                generation,
                now,
            );
            persist_status(&record, &ctx, &original, &status).await?;
        }
        return Ok(Action::await_change());
    }

    let interval = reconciliation_interval(&record);
    let fingerprint = app.fingerprint(&record.spec.namespace)?;
    if let Some(remaining) = up_to_date(&status, generation, &fingerprint, interval, now) {
        debug!("installation is up to date");
        return Ok(remaining.map(Action::requeue).unwrap_or_else(Action::await_change));
    }

    let outcome = match NamespaceManager::new(ctx.namespaces.as_ref())
        .ensure(&record.spec.namespace)
        .await
    {
        Ok(()) => ctx.installer.apply(&record, &app).await,
        Err(e) => InstallOutcome::failed(e),
    };
    let result = outcome.apply_to(&mut status);
    status.set_ready_from_result(&result, limited, generation, now);
    if result.is_ok() {
        status.applied_fingerprint = Some(fingerprint);
    }
    persist_status(&record, &ctx, &original, &status).await?;

    result?;
    info!(version = %version.version, "application installed");
    publish(
        &ctx,
        &record,
        EventType::Normal,
        reasons::INSTALLATION_SUCCEEDED,
        actions::INSTALL,
        format!("installed {app_name} {}", version.version),
    )
    .await;
    Ok(interval.map(Action::requeue).unwrap_or_else(Action::await_change))
}

/// Deletion path: uninstall, release the namespace, release the finalizer
async fn reconcile_delete(
    record: &InstallationRecord,
    ctx: &InstallationContext,
) -> Result<Action, Error> {
    if !has_finalizer(record, CLEANUP_FINALIZER) {
        return Ok(Action::await_change());
    }

    if annotation_is_true(record.annotations(), SKIP_UNINSTALL_ANNOTATION) {
        info!("skip-uninstall set, releasing finalizer without uninstalling");
        ctx.records.remove_finalizer(record, CLEANUP_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let original = record.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let result = ctx.installer.delete(record).await.apply_to(&mut status);
    if let Err(e) = result {
        status.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            "UninstallFailed",
            e.to_string(),
            record.metadata.generation,
            Utc::now(),
        );
        persist_status(record, ctx, &original, &status).await?;
        return Err(e);
    }

    NamespaceManager::new(ctx.namespaces.as_ref())
        .cleanup(&record.spec.namespace)
        .await?;
    ctx.records.remove_finalizer(record, CLEANUP_FINALIZER).await?;
    info!("application uninstalled");
    publish(
        ctx,
        record,
        EventType::Normal,
        reasons::UNINSTALL_SUCCEEDED,
        actions::UNINSTALL,
        format!("uninstalled {}", record.spec.application_ref.name),
    )
    .await;
    Ok(Action::await_change())
}

/// Entry or version is gone: delete an installed record, wait on a new one
async fn missing_dependency(
    record: &InstallationRecord,
    ctx: &InstallationContext,
    mut status: InstallationRecordStatus,
    original: &InstallationRecordStatus,
    reason: &str,
    cause: Error,
) -> Result<Action, Error> {
    if status.was_installed() {
        return cascade_delete(record, ctx, reason, cause.to_string()).await;
    }

    status.set_condition(
        CONDITION_READY,
        ConditionStatus::False,
        "WaitingForApplication",
        cause.to_string(),
        record.metadata.generation,
        Utc::now(),
    );
    persist_status(record, ctx, original, &status).await?;
    Err(Error::dependency_missing(cause.to_string()))
}

async fn cascade_delete(
    record: &InstallationRecord,
    ctx: &InstallationContext,
    reason: &str,
    message: String,
) -> Result<Action, Error> {
    warn!(reason, %message, "deleting record whose catalog dependency is gone");
    publish(ctx, record, EventType::Warning, reason, actions::CASCADE_DELETE, message).await;
    ctx.records
        .delete_record(&record.namespace().unwrap_or_default(), &record.name_any())
        .await?;
    Ok(Action::await_change())
}

async fn fail_validation(
    record: &InstallationRecord,
    ctx: &InstallationContext,
    mut status: InstallationRecordStatus,
    original: &InstallationRecordStatus,
    error: Error,
) -> Result<Action, Error> {
    warn!(error = %error, "record failed validation");
    publish(
        ctx,
        record,
        EventType::Warning,
        reasons::VALIDATION_FAILED,
        actions::RECONCILE,
        error.to_string(),
    )
    .await;
    status.set_condition(
        CONDITION_READY,
        ConditionStatus::False,
        "InvalidSpec",
        error.to_string(),
        record.metadata.generation,
        Utc::now(),
    );
    persist_status(record, ctx, original, &status).await?;
    Err(error)
}

/// Checks that only make sense once the entry and version are known
fn validate(
    record: &InstallationRecord,
    entry: &CatalogEntry,
    version: &ApplicationVersion,
    ctx: &InstallationContext,
) -> Result<(), Error> {
    record.spec.validate()?;
    entry.spec.validate()?;
    version.source.validate()?;
    let satisfied = version.constraints.is_satisfied_by(
        ctx.platform_version.as_ref(),
        ctx.orchestrator_version.as_ref(),
    )?;
    if !satisfied {
        return Err(Error::validation(format!(
            "version {} of {} does not support this cluster (requires platform >= {}, kubernetes >= {})",
            version.version,
            record.spec.application_ref.name,
            version.constraints.min_platform_version.as_deref().unwrap_or("any"),
            version.constraints.min_orchestrator_version.as_deref().unwrap_or("any"),
        )));
    }
    Ok(())
}

fn reconciliation_interval(record: &InstallationRecord) -> Option<Duration> {
    record
        .spec
        .reconciliation_interval_seconds
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

/// `Some(remaining)` if nothing needs installing; `remaining` is the time
/// left until the periodic re-apply, when an interval is set
fn up_to_date(
    status: &InstallationRecordStatus,
    generation: Option<i64>,
    fingerprint: &str,
    interval: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<Option<Duration>> {
    let ready = status.condition(CONDITION_READY)?;
    if ready.status != ConditionStatus::True
        || ready.observed_generation != generation
        || status.applied_fingerprint.as_deref() != Some(fingerprint)
    {
        return None;
    }
    let Some(interval) = interval else {
        return Some(None);
    };
    let last = ready.last_heartbeat_time?;
    let elapsed = (now - last).to_std().unwrap_or_default();
    (elapsed < interval).then(|| Some(interval - elapsed))
}

/// Write status only if it changed
async fn persist_status(
    record: &InstallationRecord,
    ctx: &InstallationContext,
    original: &InstallationRecordStatus,
    status: &InstallationRecordStatus,
) -> Result<(), Error> {
    if status == original {
        return Ok(());
    }
    ctx.records
        .patch_status(
            &record.namespace().unwrap_or_default(),
            &record.name_any(),
            status,
        )
        .await
}

async fn publish(
    ctx: &InstallationContext,
    record: &InstallationRecord,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&record.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Requeue a failed record with per-record exponential backoff
pub fn error_policy(
    record: Arc<InstallationRecord>,
    error: &Error,
    ctx: Arc<InstallationContext>,
) -> Action {
    let delay = ctx
        .backoff
        .next_delay(&backoff_key(&record), error.is_retryable());
    error!(
        ?error,
        record = %record.name_any(),
        namespace = %record.namespace().unwrap_or_default(),
        retry_in_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );
    Action::requeue(delay)
}
