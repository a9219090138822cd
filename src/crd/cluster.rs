//! TargetCluster Custom Resource Definition
//!
//! The management plane's registration of a workload cluster that
//! applications are converged onto.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::catalog::SecretKeyRef;
use super::types::{Condition, ConditionStatus, HealthStatus};

/// Specification for a TargetCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "shipyard.dev",
    version = "v1alpha1",
    kind = "TargetCluster",
    plural = "targetclusters",
    shortname = "tc",
    status = "TargetClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Datacenter","type":"string","jsonPath":".spec.datacenter"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TargetClusterSpec {
    /// Datacenter the cluster runs in
    pub datacenter: String,

    /// Secret holding a kubeconfig for the cluster
    pub kubeconfig_secret_ref: SecretKeyRef,

    /// Stop converging applications onto this cluster
    #[serde(default)]
    pub paused: bool,

    /// Kubernetes version the cluster runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Status for a TargetCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetClusterStatus {
    /// Health of platform components
    #[serde(default)]
    pub health: ClusterHealth,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TargetClusterStatus {
    /// Add or update a condition, returning self for chaining
    ///
    /// The transition time of an existing condition is kept when its status
    /// does not change.
    pub fn condition(mut self, condition: Condition) -> Self {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                let transition = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    condition.last_transition_time
                };
                *existing = Condition {
                    last_transition_time: transition,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
        self
    }

    /// Returns true if a condition of `type_` exists with `status`
    pub fn has_condition_value(&self, type_: &str, status: ConditionStatus) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == status)
    }

    /// Returns true if any condition of `type_` exists
    pub fn has_condition(&self, type_: &str) -> bool {
        self.conditions.iter().any(|c| c.type_ == type_)
    }
}

/// Health of the components applications depend on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    /// Kubernetes API server
    #[serde(default)]
    pub api_server: HealthStatus,

    /// Agent running the installation reconciler
    #[serde(default)]
    pub application_controller: HealthStatus,

    /// Pod network
    #[serde(default)]
    pub cni: HealthStatus,
}

impl ClusterHealth {
    /// Returns true once every component is up
    pub fn all_up(&self) -> bool {
        [&self.api_server, &self.application_controller, &self.cni]
            .iter()
            .all(|h| **h == HealthStatus::Up)
    }
}

impl TargetCluster {
    /// Returns true if applications may be installed onto this cluster
    pub fn is_install_eligible(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.health.all_up())
            .unwrap_or(false)
    }
}
