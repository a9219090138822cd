//! Custom Resource Definitions for Shipyard
//!
//! This module contains all CRD definitions used by the Shipyard operator,
//! together with the well-known annotations, finalizer and condition names
//! the controllers agree on.

mod catalog;
mod cluster;
mod installation;
mod types;

use std::collections::BTreeMap;

pub use catalog::{
    ApplicationSource, ApplicationVersion, CatalogEntry, CatalogEntrySpec, FormField, GitReference,
    GitSource, HelmSource, SecretKeyRef, VersionConstraints,
};
pub use cluster::{ClusterHealth, TargetCluster, TargetClusterSpec, TargetClusterStatus};
pub use installation::{
    ApplicationRef, InstallationRecord, InstallationRecordSpec, InstallationRecordStatus,
    InstallerState, CONDITION_MANIFESTS_RETRIEVED, CONDITION_READY,
};
pub use types::{
    AppNamespaceSpec, Condition, ConditionStatus, DeployOptions, HealthStatus, HelmDeployOptions,
    RecordCondition, TemplateMethod,
};

/// Finalizer held by records while a remote installation may exist
pub const CLEANUP_FINALIZER: &str = "shipyard.dev/cleanup-application";

/// Set to "true" on records the platform enforces
pub const ENFORCED_ANNOTATION: &str = "shipyard.dev/enforced";
/// Set to "true" on records the platform created as defaults
pub const DEFAULTED_ANNOTATION: &str = "shipyard.dev/defaulted";
/// Present on clusters whose initial applications are installed by another workflow
pub const INITIAL_APPLICATIONS_ANNOTATION: &str = "shipyard.dev/initial-applications-request";
/// Reconciliation interval copied from a catalog entry into synthesized records
pub const RECONCILIATION_INTERVAL_ANNOTATION: &str = "shipyard.dev/reconciliation-interval";
/// Release a record's finalizer without uninstalling
pub const SKIP_UNINSTALL_ANNOTATION: &str = "shipyard.dev/skip-uninstall";
/// Client-side apply bookkeeping; never compared
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Cluster condition set once every selected application has a record
pub const CONDITION_DEFAULT_APPLICATIONS_CREATED: &str = "DefaultApplicationsCreated";
/// Cluster condition owned by the initial-installation workflow
pub const CONDITION_INITIAL_APPLICATIONS_RECONCILED: &str = "InitialApplicationsReconciled";

/// Returns true if the annotation is present and parses as boolean true
pub fn annotation_is_true(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations
        .get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse a YAML values document into a map; blank documents are empty
pub(crate) fn parse_values_block(
    block: &str,
) -> Result<BTreeMap<String, serde_json::Value>, crate::Error> {
    if block.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let parsed: Option<BTreeMap<String, serde_json::Value>> = serde_yaml::from_str(block)
        .map_err(|e| crate::Error::validation(format!("invalid values block: {e}")))?;
    Ok(parsed.unwrap_or_default())
}
