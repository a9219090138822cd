//! Namespace lifecycle for installed applications
//!
//! Namespaces are provisioned once. Labels and annotations are only applied
//! when the namespace is created; an existing namespace is never modified, and
//! only namespaces marked `create` are ever deleted.

use tracing::{debug, info};

use crate::client::NamespaceClient;
use crate::crd::AppNamespaceSpec;
use crate::Error;

/// Ensures and cleans up application namespaces through a [`NamespaceClient`]
pub struct NamespaceManager<'a> {
    client: &'a dyn NamespaceClient,
}

impl<'a> NamespaceManager<'a> {
    /// Create a manager over `client`
    pub fn new(client: &'a dyn NamespaceClient) -> Self {
        Self { client }
    }

    /// Make sure the namespace exists when its creation is requested
    pub async fn ensure(&self, spec: &AppNamespaceSpec) -> Result<(), Error> {
        if !spec.create {
            return Ok(());
        }
        if self.client.get_namespace(&spec.name).await?.is_some() {
            debug!(namespace = %spec.name, "namespace exists, leaving untouched");
            return Ok(());
        }

        let labels = spec.labels.clone().unwrap_or_default();
        let annotations = spec.annotations.clone().unwrap_or_default();
        self.client
            .create_namespace(&spec.name, &labels, &annotations)
            .await?;
        info!(namespace = %spec.name, "created namespace");
        Ok(())
    }

    /// Remove the namespace if this system owns it
    pub async fn cleanup(&self, spec: &AppNamespaceSpec) -> Result<(), Error> {
        if !spec.create {
            return Ok(());
        }
        self.client.delete_namespace(&spec.name).await?;
        info!(namespace = %spec.name, "deleted namespace");
        Ok(())
    }
}
