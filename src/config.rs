//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::runtime::controller;

use crate::retry::RetryConfig;

/// Shipyard - application catalog convergence for fleets of clusters
#[derive(Parser, Debug)]
#[command(name = "shipyard", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Component to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Components shipyard can run as
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run on the management cluster: synthesize default and enforced
    /// applications onto every registered target cluster
    Manager(ManagerArgs),

    /// Run on a target cluster: install the applications its records declare
    Agent(AgentArgs),
}

/// Controller settings shared by every component
#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Concurrent reconciles per controller
    #[arg(long, env = "SHIPYARD_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "SHIPYARD_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Longest retry delay, in seconds
    #[arg(long, env = "SHIPYARD_BACKOFF_MAX", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Field manager recorded on every write
    #[arg(long, env = "SHIPYARD_FIELD_MANAGER", default_value = crate::DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,
}

impl RuntimeArgs {
    /// Concurrency actually used; zero would mean unbounded to the controller
    pub fn concurrency(&self) -> u16 {
        self.workers.max(1)
    }

    /// Controller settings derived from the flags
    pub fn controller_config(&self) -> controller::Config {
        controller::Config::default().concurrency(self.concurrency())
    }

    /// Requeue backoff for failed reconciles
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(self.backoff_base_ms.max(1)),
            max_delay: Duration::from_secs(self.backoff_max_secs.max(1)),
            backoff_multiplier: 2.0,
        }
    }
}

/// Settings for the management-side component
#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    /// Namespace synthesized records are created in; defaults to each
    /// entry's default namespace
    #[arg(long, env = "SHIPYARD_APPLICATIONS_NAMESPACE")]
    pub applications_namespace: Option<String>,

    /// Namespace holding cluster kubeconfig secrets without an explicit namespace
    #[arg(long, env = "SHIPYARD_SECRETS_NAMESPACE", default_value = crate::DEFAULT_SYSTEM_NAMESPACE)]
    pub secrets_namespace: String,

    /// Runtime settings
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

/// Settings for the target-side component
#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Kubeconfig for the management cluster holding the catalog; the local
    /// cluster is used when unset
    #[arg(long, env = "SHIPYARD_MANAGEMENT_KUBECONFIG")]
    pub management_kubeconfig: Option<PathBuf>,

    /// Platform version checked against version constraints
    #[arg(long, env = "SHIPYARD_PLATFORM_VERSION")]
    pub platform_version: Option<String>,

    /// helm executable
    #[arg(long, env = "SHIPYARD_HELM_BINARY", default_value = "helm")]
    pub helm_binary: String,

    /// git executable
    #[arg(long, env = "SHIPYARD_GIT_BINARY", default_value = "git")]
    pub git_binary: String,

    /// Namespace holding chart and repository credentials. Credentials are
    /// read from the cluster holding the catalog
    #[arg(long, env = "SHIPYARD_CREDENTIALS_NAMESPACE", default_value = crate::DEFAULT_SYSTEM_NAMESPACE)]
    pub credentials_namespace: String,

    /// Runtime settings
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}
