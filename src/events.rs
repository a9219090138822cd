//! Kubernetes Event recording for Shipyard controllers.
//!
//! Failures surface to users through conditions plus a human-readable Event.
//! Publishing is fire-and-forget: an Event that cannot be written is logged
//! and never fails the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Publishes Kubernetes Events about Shipyard resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`; never fails
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// The catalog entry a record installed was deleted
    pub const APPLICATION_DEFINITION_REMOVED: &str = "ApplicationDefinitionRemoved";
    /// The version a record installed was removed from its catalog entry
    pub const APPLICATION_VERSION_REMOVED: &str = "ApplicationVersionRemoved";
    /// The catalog entry a record installed is being deleted
    pub const APPLICATION_DEFINITION_DELETING: &str = "ApplicationDefinitionDeleting";
    /// Install or upgrade finished
    pub const INSTALLATION_SUCCEEDED: &str = "InstallationSucceeded";
    /// Uninstall finished and the finalizer was released
    pub const UNINSTALL_SUCCEEDED: &str = "UninstallSucceeded";
    /// The spec is inconsistent and needs an edit
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A reconcile pass returned an error
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Synthesizing records for a cluster failed for some applications
    pub const RECONCILING_ERROR: &str = "ReconcilingError";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Regular reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Installing or upgrading an application
    pub const INSTALL: &str = "Install";
    /// Removing an application
    pub const UNINSTALL: &str = "Uninstall";
    /// Deleting a record whose catalog dependency disappeared
    pub const CASCADE_DELETE: &str = "CascadeDelete";
    /// Creating or updating records for a cluster
    pub const SYNTHESIZE: &str = "Synthesize";
}
