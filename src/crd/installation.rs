//! InstallationRecord Custom Resource Definition
//!
//! An InstallationRecord declares that one application version should run in
//! one namespace of the cluster the record lives in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::catalog::ApplicationVersion;
use super::types::{AppNamespaceSpec, ConditionStatus, DeployOptions, RecordCondition, TemplateMethod};

/// Condition type set once the artifacts have been fetched
pub const CONDITION_MANIFESTS_RETRIEVED: &str = "ManifestsRetrieved";
/// Condition type reflecting the outcome of the last install or uninstall
pub const CONDITION_READY: &str = "Ready";

/// Specification for an InstallationRecord
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "shipyard.dev",
    version = "v1alpha1",
    kind = "InstallationRecord",
    plural = "installationrecords",
    shortname = "ir",
    status = "InstallationRecordStatus",
    namespaced,
    printcolumn = r#"{"name":"Application","type":"string","jsonPath":".spec.applicationRef.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.resolvedApplicationVersion.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions.Ready.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationRecordSpec {
    /// Target namespace; immutable after creation
    pub namespace: AppNamespaceSpec,

    /// Application to install
    pub application_ref: ApplicationRef,

    /// Values overriding the catalog defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_override: Option<BTreeMap<String, serde_json::Value>>,

    /// Values overriding the catalog defaults, as a YAML document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_override_block: Option<String>,

    /// Deploy options; falls back to the catalog entry's defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_options: Option<DeployOptions>,

    /// Re-apply periodically even without changes, to correct drift
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_interval_seconds: Option<u64>,
}

impl InstallationRecordSpec {
    /// Parse the override values into a map, whichever form they were given in
    pub fn parsed_values(&self) -> Result<BTreeMap<String, serde_json::Value>, crate::Error> {
        match (&self.values_override, &self.values_override_block) {
            (Some(values), Some(block)) if !values.is_empty() && !block.trim().is_empty() => {
                Err(crate::Error::validation(
                    "valuesOverride and valuesOverrideBlock are mutually exclusive",
                ))
            }
            (Some(values), _) if !values.is_empty() => Ok(values.clone()),
            (_, Some(block)) => super::parse_values_block(block),
            _ => Ok(BTreeMap::new()),
        }
    }

    /// Validate the record spec
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.namespace.name.is_empty() {
            return Err(crate::Error::validation("namespace.name is required"));
        }
        if self.application_ref.name.is_empty() {
            return Err(crate::Error::validation("applicationRef.name is required"));
        }
        self.parsed_values()?;
        Ok(())
    }
}

/// Reference to a catalog entry and version
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRef {
    /// CatalogEntry name; immutable after creation
    pub name: String,

    /// Version to install; the highest available when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Status for an InstallationRecord
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationRecordStatus {
    /// Conditions keyed by type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, RecordCondition>,

    /// Version record the last install pass resolved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_application_version: Option<ApplicationVersion>,

    /// Installation method of the resolved entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<TemplateMethod>,

    /// What the installer last reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_state: Option<InstallerState>,

    /// Consecutive failed installs
    #[serde(default)]
    pub failures: u32,

    /// Fingerprint of the inputs of the last successful install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_fingerprint: Option<String>,
}

impl InstallationRecordStatus {
    /// Set a condition, moving the transition time only when the status changes
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let entry = self.conditions.entry(type_.to_string()).or_default();
        if entry.status != status || entry.last_transition_time.is_none() {
            entry.last_transition_time = Some(now);
        }
        entry.status = status;
        entry.reason = reason.into();
        entry.message = message.into();
        entry.last_heartbeat_time = Some(now);
        entry.observed_generation = observed_generation;
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&RecordCondition> {
        self.conditions.get(type_)
    }

    /// Returns true if the condition exists with the given status
    pub fn has_condition_value(&self, type_: &str, status: ConditionStatus) -> bool {
        self.condition(type_).map(|c| c.status == status).unwrap_or(false)
    }

    /// Record the outcome of an install attempt on the Ready condition.
    ///
    /// With `limited_retries`, each failure is counted so the reconciler can
    /// stop after too many consecutive attempts.
    pub fn set_ready_from_result(
        &mut self,
        result: &Result<(), crate::Error>,
        limited_retries: bool,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) {
        match result {
            Ok(()) => {
                self.failures = 0;
                self.set_condition(
                    CONDITION_READY,
                    ConditionStatus::True,
                    "InstallationSuccessful",
                    "application successfully installed or upgraded",
                    observed_generation,
                    now,
                );
            }
            Err(e) => {
                if limited_retries {
                    self.failures += 1;
                }
                self.set_condition(
                    CONDITION_READY,
                    ConditionStatus::False,
                    "InstallationFailed",
                    e.to_string(),
                    observed_generation,
                    now,
                );
            }
        }
    }

    /// Returns true if the application was installed at some point
    pub fn was_installed(&self) -> bool {
        self.resolved_application_version.is_some()
    }
}

/// Installer-reported release information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallerState {
    /// Release name
    pub release_name: String,

    /// Namespace the release lives in
    pub namespace: String,

    /// Installed chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    /// Release status as reported by the installer
    #[serde(default)]
    pub status: String,
}
