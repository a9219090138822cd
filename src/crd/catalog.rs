//! CatalogEntry Custom Resource Definition
//!
//! A CatalogEntry is the template for an installable application: where its
//! artifacts come from, which versions exist, and whether the platform
//! installs it by default or enforces it on every eligible cluster.

use std::collections::{BTreeMap, HashSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppNamespaceSpec, DeployOptions, TemplateMethod};

/// Specification for a CatalogEntry
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "shipyard.dev",
    version = "v1alpha1",
    kind = "CatalogEntry",
    plural = "catalogentries",
    shortname = "ce",
    namespaced = false,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.method"}"#,
    printcolumn = r#"{"name":"Default","type":"boolean","jsonPath":".spec.isDefault"}"#,
    printcolumn = r#"{"name":"Enforced","type":"boolean","jsonPath":".spec.isEnforced"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntrySpec {
    /// Human-friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// What the application does
    #[serde(default)]
    pub description: String,

    /// Installation method; immutable after creation
    #[serde(default)]
    pub method: TemplateMethod,

    /// Available versions, in declaration order
    pub versions: Vec<ApplicationVersion>,

    /// Version synthesized records pin to; highest version when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<String>,

    /// Install on fresh clusters unless they opted out
    #[serde(default)]
    pub is_default: bool,

    /// Install on every eligible cluster and keep in sync
    #[serde(default)]
    pub is_enforced: bool,

    /// Datacenters this entry applies to; absent or empty means all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter_selector: Option<Vec<String>>,

    /// Namespace synthesized records install into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<AppNamespaceSpec>,

    /// Default values as structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_values: Option<BTreeMap<String, serde_json::Value>>,

    /// Default values as a YAML document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_values_block: Option<String>,

    /// Deploy options used when a record sets none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_deploy_options: Option<DeployOptions>,

    /// Link to user documentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,

    /// Link to the upstream source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl CatalogEntrySpec {
    /// Returns true if the entry applies to clusters in `datacenter`
    pub fn selects_datacenter(&self, datacenter: &str) -> bool {
        match &self.datacenter_selector {
            Some(dcs) if !dcs.is_empty() => dcs.iter().any(|dc| dc == datacenter),
            _ => true,
        }
    }

    /// Parse the default values into a map, whichever form they were given in
    pub fn parsed_default_values(
        &self,
    ) -> Result<BTreeMap<String, serde_json::Value>, crate::Error> {
        match (&self.default_values, &self.default_values_block) {
            (Some(_), Some(block)) if !block.trim().is_empty() => Err(crate::Error::validation(
                "defaultValues and defaultValuesBlock are mutually exclusive",
            )),
            (Some(values), _) => Ok(values.clone()),
            (None, Some(block)) => super::parse_values_block(block),
            (None, None) => Ok(BTreeMap::new()),
        }
    }

    /// Validate the entry
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.versions.is_empty() {
            return Err(crate::Error::validation("at least one version is required"));
        }

        let mut seen = HashSet::new();
        for version in &self.versions {
            if !seen.insert(version.version.as_str()) {
                return Err(crate::Error::validation(format!(
                    "version '{}' is declared more than once",
                    version.version
                )));
            }
            version.source.validate()?;
        }

        if let Some(default) = &self.default_version {
            if !seen.contains(default.as_str()) {
                return Err(crate::Error::validation(format!(
                    "defaultVersion '{default}' is not one of the declared versions"
                )));
            }
        }

        self.parsed_default_values()?;
        Ok(())
    }
}

/// One installable version of an application
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationVersion {
    /// Semantic version string
    pub version: String,

    /// Minimum platform and orchestrator versions
    #[serde(default)]
    pub constraints: VersionConstraints,

    /// Where the artifacts come from
    pub source: ApplicationSource,

    /// Fields a UI may prompt for when creating a record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form_fields: Vec<FormField>,
}

/// Minimum versions a target must run; unset means no constraint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionConstraints {
    /// Minimum Shipyard platform version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_platform_version: Option<String>,

    /// Minimum Kubernetes version of the target cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_orchestrator_version: Option<String>,
}

/// Artifact source; exactly one kind per version
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ApplicationSource {
    /// Chart from a helm repository
    Helm(HelmSource),
    /// Chart from a git repository
    Git(GitSource),
}

impl ApplicationSource {
    /// Validate the populated source
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            Self::Helm(helm) => {
                if helm.url.is_empty() || helm.chart_name.is_empty() {
                    return Err(crate::Error::validation(
                        "helm source requires url and chartName",
                    ));
                }
                Ok(())
            }
            Self::Git(git) => {
                if git.remote.is_empty() {
                    return Err(crate::Error::validation("git source requires remote"));
                }
                git.ref_.validate()
            }
        }
    }

    /// Short name of the source kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Helm(_) => "helm",
            Self::Git(_) => "git",
        }
    }
}

/// Helm repository source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    /// Repository URL (https:// or oci://)
    pub url: String,

    /// Chart name within the repository
    pub chart_name: String,

    /// Chart version
    pub chart_version: String,

    /// Skip TLS verification
    #[serde(default)]
    pub insecure: bool,

    /// Use plain HTTP for OCI registries
    #[serde(default, rename = "plainHTTP")]
    pub plain_http: bool,

    /// Repository credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SecretKeyRef>,
}

/// Git repository source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    /// Clone URL
    pub remote: String,

    /// Revision to check out
    #[serde(rename = "ref")]
    pub ref_: GitReference,

    /// Chart directory inside the repository
    #[serde(default)]
    pub path: String,

    /// Repository credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SecretKeyRef>,
}

/// Git revision; exactly one field is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    /// Branch name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Commit SHA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Tag name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl GitReference {
    /// Validate that exactly one revision kind is set
    pub fn validate(&self) -> Result<(), crate::Error> {
        let set = [&self.branch, &self.commit, &self.tag]
            .iter()
            .filter(|r| r.is_some())
            .count();
        if set != 1 {
            return Err(crate::Error::validation(
                "git ref requires exactly one of branch, commit or tag",
            ));
        }
        Ok(())
    }

    /// The revision to pass to `git clone --branch`, if any
    pub fn clone_target(&self) -> Option<&str> {
        self.tag.as_deref().or(self.branch.as_deref())
    }
}

/// Reference to a key in a secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,

    /// Secret namespace; the controller's namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key inside the secret
    pub key: String,
}

/// Input field description for UIs
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    /// Dotted values path the field writes to
    pub field_name: String,

    /// Label shown to the user
    pub label: String,

    /// Input type (text, number, boolean)
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether a value is required
    #[serde(default)]
    pub required: bool,

    /// Help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::testing::helm_version;

    fn spec_with(versions: &[&str]) -> CatalogEntrySpec {
        CatalogEntrySpec {
            display_name: None,
            description: "web server".to_string(),
            method: TemplateMethod::Helm,
            versions: versions.iter().map(|v| helm_version(v)).collect(),
            default_version: None,
            is_default: false,
            is_enforced: false,
            datacenter_selector: None,
            default_namespace: None,
            default_values: None,
            default_values_block: None,
            default_deploy_options: None,
            documentation_url: None,
            source_url: None,
        }
    }

    #[test]
    fn test_valid_entry_passes() {
        assert!(spec_with(&["1.0.0", "1.1.0"]).validate().is_ok());
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let err = spec_with(&["1.0.0", "1.0.0"]).validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_empty_versions_rejected() {
        assert!(spec_with(&[]).validate().is_err());
    }

    #[test]
    fn test_unknown_default_version_rejected() {
        let mut spec = spec_with(&["1.0.0"]);
        spec.default_version = Some("2.0.0".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_values_and_block_are_mutually_exclusive() {
        let mut spec = spec_with(&["1.0.0"]);
        spec.default_values = Some(BTreeMap::from([(
            "replicas".to_string(),
            serde_json::json!(2),
        )]));
        spec.default_values_block = Some("replicas: 3".to_string());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_values_block_is_parsed() {
        let mut spec = spec_with(&["1.0.0"]);
        spec.default_values_block = Some("replicas: 3\nimage:\n  tag: stable\n".to_string());
        let values = spec.parsed_default_values().unwrap();
        assert_eq!(values["replicas"], serde_json::json!(3));
        assert_eq!(values["image"]["tag"], serde_json::json!("stable"));
    }

    #[test]
    fn test_datacenter_selector() {
        let mut spec = spec_with(&["1.0.0"]);
        assert!(spec.selects_datacenter("eu-west"));

        spec.datacenter_selector = Some(vec![]);
        assert!(spec.selects_datacenter("eu-west"));

        spec.datacenter_selector = Some(vec!["us-east".to_string()]);
        assert!(!spec.selects_datacenter("eu-west"));
        assert!(spec.selects_datacenter("us-east"));
    }

    #[test]
    fn test_git_ref_requires_exactly_one_revision() {
        assert!(GitReference::default().validate().is_err());
        let both = GitReference {
            branch: Some("main".to_string()),
            tag: Some("v1".to_string()),
            commit: None,
        };
        assert!(both.validate().is_err());
        let tag = GitReference {
            tag: Some("v1".to_string()),
            ..Default::default()
        };
        assert!(tag.validate().is_ok());
        assert_eq!(tag.clone_target(), Some("v1"));
    }

    #[test]
    fn test_source_is_externally_tagged() {
        let json = serde_json::json!({
            "git": {"remote": "https://git.example.com/charts.git", "ref": {"branch": "main"}, "path": "charts/app"}
        });
        let source: ApplicationSource = serde_json::from_value(json).unwrap();
        assert_eq!(source.kind(), "git");
        assert!(source.validate().is_ok());

        let both = serde_json::json!({
            "git": {"remote": "r", "ref": {"branch": "main"}},
            "helm": {"url": "u", "chartName": "c", "chartVersion": "1"}
        });
        assert!(serde_json::from_value::<ApplicationSource>(both).is_err());
    }
}
