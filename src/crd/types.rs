//! Supporting types shared by the Shipyard CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How an application's artifacts are turned into cluster objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TemplateMethod {
    /// Packaged chart rendered and released by helm
    #[default]
    Helm,
}

impl std::str::FromStr for TemplateMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "helm" => Ok(Self::Helm),
            _ => Err(crate::Error::validation(format!(
                "invalid template method: {s}, expected one of: helm"
            ))),
        }
    }
}

impl std::fmt::Display for TemplateMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Helm => write!(f, "helm"),
        }
    }
}

/// Namespace an application is installed into
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppNamespaceSpec {
    /// Namespace name
    pub name: String,

    /// Create the namespace if it is missing, and delete it on uninstall
    #[serde(default = "default_true")]
    pub create: bool,

    /// Labels set when the namespace is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Annotations set when the namespace is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl AppNamespaceSpec {
    /// A namespace this system creates and owns, with no extra metadata
    pub fn owned(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create: true,
            labels: None,
            annotations: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Deployment knobs passed through to the installer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployOptions {
    /// Helm specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmDeployOptions>,
}

impl DeployOptions {
    /// Returns true if failed installs are rolled back and retries are capped
    pub fn is_atomic(&self) -> bool {
        self.helm.as_ref().map(|h| h.atomic).unwrap_or(false)
    }
}

/// Options for `helm upgrade --install`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelmDeployOptions {
    /// Wait for resources to become ready
    #[serde(default)]
    pub wait: bool,

    /// Timeout for wait, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Roll back on failure; also caps install retries
    #[serde(default)]
    pub atomic: bool,

    /// Enable DNS lookups while rendering templates
    #[serde(default)]
    pub enable_dns: bool,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for list-shaped statuses
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., DefaultApplicationsCreated)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Condition stored in a map keyed by its type
///
/// Absence of a condition means "not yet evaluated", never "false".
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordCondition {
    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status value changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Last time the condition was evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    /// Spec generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Health of one platform component on a target cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum HealthStatus {
    /// Component is not running
    Down,
    /// Component is coming up
    #[default]
    Provisioning,
    /// Component is running
    Up,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Down => write!(f, "Down"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Up => write!(f, "Up"),
        }
    }
}
