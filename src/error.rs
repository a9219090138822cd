//! Error types for the Shipyard operator

use thiserror::Error;

/// Main error type for Shipyard operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced catalog entry or version does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A dependency has not appeared yet; retried until it does
    #[error("waiting for dependency: {0}")]
    DependencyMissing(String),

    /// The installer failed to apply or remove an application
    #[error("installer error: {0}")]
    Installer(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Could not build a client for a target cluster
    #[error("cluster connection error: {0}")]
    ClusterConnection(String),

    /// Some items of a batch failed; the rest were processed
    #[error("{} of the batch failed: {}", .0.len(), .0.join("; "))]
    PartialFailure(Vec<String>),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a dependency-missing error with the given message
    pub fn dependency_missing(msg: impl Into<String>) -> Self {
        Self::DependencyMissing(msg.into())
    }

    /// Create an installer error with the given message
    pub fn installer(msg: impl Into<String>) -> Self {
        Self::Installer(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cluster connection error with the given message
    pub fn cluster_connection(msg: impl Into<String>) -> Self {
        Self::ClusterConnection(msg.into())
    }

    /// Returns true if the error is a "gone" signal rather than a failure
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Returns true if retrying without outside intervention can succeed.
    ///
    /// Validation failures and client-side API rejections only clear after
    /// someone edits the object. Conflicts and throttling are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Serialization(_) => false,
            Self::Kube(kube::Error::Api(ae)) => {
                ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
            }
            _ => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: How errors steer the convergence loop
    // ==========================================================================

    /// Story: A deleted catalog entry is a soft signal, not a failure
    ///
    /// The installation reconciler branches on "gone" errors: previously
    /// installed records cascade, fresh records wait.
    #[test]
    fn story_gone_dependencies_are_recognised() {
        assert!(Error::not_found("catalog entry 'nginx'").is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::dependency_missing("nginx").is_not_found());
    }

    /// Story: Spec mistakes keep failing until an administrator fixes them
    #[rstest]
    #[case::validation(Error::validation("values and valuesBlock both set"), false)]
    #[case::serialization(Error::serialization("bad yaml"), false)]
    #[case::forbidden(api_error(403), false)]
    #[case::conflict(api_error(409), true)]
    #[case::throttled(api_error(429), true)]
    #[case::server(api_error(503), true)]
    #[case::installer(Error::installer("helm exited with 1"), true)]
    #[case::dependency(Error::dependency_missing("nginx"), true)]
    fn story_retry_classification(#[case] err: Error, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable, "{err}");
    }

    /// Story: Partial batch failures report every application once
    #[test]
    fn story_partial_failure_lists_each_item() {
        let err = Error::PartialFailure(vec![
            "cert-manager: conflict".to_string(),
            "ingress: forbidden".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 of the batch failed"));
        assert!(msg.contains("cert-manager: conflict"));
        assert!(msg.contains("ingress: forbidden"));
    }

    #[test]
    fn story_error_construction_ergonomics() {
        let name = "nginx";
        let err = Error::installer(format!("release {name} stuck"));
        assert!(err.to_string().contains("installer error"));
        assert!(err.to_string().contains("nginx"));

        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
