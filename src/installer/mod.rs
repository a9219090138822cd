//! Installer contract
//!
//! An [`Installer`] performs the actual install, upgrade or removal of an
//! application in the cluster it is bound to. It never mutates a record's
//! spec; it reports progress by returning a [`StatusMutation`] that the
//! reconciler applies before looking at the result, so partial progress is
//! recorded even when the operation fails.
//!
//! Both operations must be idempotent: repeating a successful call has no
//! further remote effect, and deleting something already gone succeeds.

mod helm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    AppNamespaceSpec, ApplicationVersion, CatalogEntry, DeployOptions, InstallationRecord,
    InstallationRecordStatus, TemplateMethod,
};
use crate::kube_utils::deterministic_hash;
use crate::Error;

pub use helm::{release_name, HelmInstaller};

/// Deferred change to a record's status, produced by an installer
pub type StatusMutation = Box<dyn FnOnce(&mut InstallationRecordStatus) + Send>;

/// What an install or uninstall attempt produced
pub struct InstallOutcome {
    /// Status change to apply whether or not the attempt succeeded
    pub mutation: Option<StatusMutation>,
    /// Outcome of the attempt
    pub result: Result<(), Error>,
}

impl InstallOutcome {
    /// Success without a status change
    pub fn ok() -> Self {
        Self {
            mutation: None,
            result: Ok(()),
        }
    }

    /// Failure without a status change
    pub fn failed(error: Error) -> Self {
        Self {
            mutation: None,
            result: Err(error),
        }
    }

    /// Attach a status change
    pub fn with_mutation(
        mut self,
        mutation: impl FnOnce(&mut InstallationRecordStatus) + Send + 'static,
    ) -> Self {
        self.mutation = Some(Box::new(mutation));
        self
    }

    /// Apply the mutation to `status`, then hand back the result
    pub fn apply_to(self, status: &mut InstallationRecordStatus) -> Result<(), Error> {
        if let Some(mutation) = self.mutation {
            mutation(status);
        }
        self.result
    }
}

impl std::fmt::Debug for InstallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallOutcome")
            .field("mutation", &self.mutation.is_some())
            .field("result", &self.result)
            .finish()
    }
}

/// Installs and removes applications in one target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install or upgrade `app` for `record`
    async fn apply(&self, record: &InstallationRecord, app: &ResolvedApplication)
        -> InstallOutcome;

    /// Remove whatever `record` installed
    async fn delete(&self, record: &InstallationRecord) -> InstallOutcome;
}

/// Everything needed to install one record, computed from the record and its
/// catalog entry
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedApplication {
    /// Catalog entry name
    pub entry_name: String,
    /// Installation method of the entry
    pub method: TemplateMethod,
    /// Resolved version record
    pub version: ApplicationVersion,
    /// Catalog defaults with the record's override merged on top
    pub values: BTreeMap<String, Value>,
    /// Record deploy options, else the entry defaults
    pub deploy_options: DeployOptions,
}

impl ResolvedApplication {
    /// Combine a record with its entry and resolved version
    pub fn new(
        entry: &CatalogEntry,
        record: &InstallationRecord,
        version: &ApplicationVersion,
    ) -> Result<Self, Error> {
        let defaults = entry.spec.parsed_default_values()?;
        let overrides = record.spec.parsed_values()?;

        let mut merged = Value::Object(defaults.into_iter().collect());
        deep_merge(&mut merged, Value::Object(overrides.into_iter().collect()));
        let values = match merged {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };

        let deploy_options = record
            .spec
            .deploy_options
            .clone()
            .or_else(|| entry.spec.default_deploy_options.clone())
            .unwrap_or_default();

        Ok(Self {
            entry_name: entry.metadata.name.clone().unwrap_or_default(),
            method: entry.spec.method.clone(),
            version: version.clone(),
            values,
            deploy_options,
        })
    }

    /// Stable digest of every install input, including the target namespace
    pub fn fingerprint(&self, namespace: &AppNamespaceSpec) -> Result<String, Error> {
        let canonical = serde_json::to_string(&serde_json::json!({
            "entry": self.entry_name,
            "method": self.method,
            "version": self.version,
            "values": self.values,
            "deployOptions": self.deploy_options,
            "namespace": namespace,
        }))?;
        Ok(deterministic_hash(&canonical))
    }
}

/// Merge `overlay` into `base`; nested objects merge, everything else replaces
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
