//! Shipyard - application catalog convergence for fleets of Kubernetes clusters
//!
//! A platform team publishes installable applications as `CatalogEntry`
//! resources. Shipyard makes sure every eligible cluster carries an
//! `InstallationRecord` for each enforced (and, on fresh clusters, default)
//! entry, and installs, upgrades and removes what those records declare.
//!
//! # Architecture
//!
//! - The **manager** runs next to the catalog. Its synthesizer reconciles
//!   `TargetCluster` resources, writing records into each target cluster.
//! - The **agent** runs in each target cluster. Its installation controller
//!   reconciles the local records through an [`installer::Installer`].
//! - Both run on `kube::runtime::Controller`: level-triggered, deduplicated
//!   per object, with catalog changes mapped onto the objects they affect.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (CatalogEntry, InstallationRecord, TargetCluster)
//! - [`controller`] - Installation controller, synthesizer and catalog fan-out
//! - [`retry`] - Backoff for start-up calls and failing reconciles
//! - [`installer`] - Installer contract and the helm implementation
//! - [`version`] - Version resolution and constraint checks
//! - [`namespace`] - Namespace lifecycle for installed applications
//! - [`client`] - Trait seams over the Kubernetes API
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Command line configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod installer;
pub mod kube_utils;
pub mod namespace;
pub mod retry;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager recorded on writes unless configured otherwise
pub const DEFAULT_FIELD_MANAGER: &str = "shipyard";

/// Namespace holding kubeconfig and credential secrets by default
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "shipyard-system";
