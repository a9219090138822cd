//! Shipyard operator - application catalog convergence

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shipyard::config::{AgentArgs, Cli, Command, ManagerArgs};
use shipyard::controller::{
    dependent_records_mapper, enforced_entry_mapper, installation, synthesizer,
    InstallationContext, SynthesizerContext,
};
use shipyard::crd::{CatalogEntry, InstallationRecord, TargetCluster};
use shipyard::kube_utils::{create_client, ensure_crds_installed};
use shipyard::version::parse_lenient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crds = [
            CatalogEntry::crd(),
            InstallationRecord::crd(),
            TargetCluster::crd(),
        ];
        let docs = crds
            .iter()
            .map(serde_yaml::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to serialize CRDs")?;
        println!("{}", docs.join("---\n"));
        return Ok(());
    }

    match cli.command {
        Some(Command::Manager(args)) => run_manager(args).await,
        Some(Command::Agent(args)) => run_agent(args).await,
        None => anyhow::bail!("no component selected; run `shipyard manager` or `shipyard agent`"),
    }
}

/// Run the management-side synthesizer
async fn run_manager(args: ManagerArgs) -> anyhow::Result<()> {
    let runtime = args.runtime;
    let client = create_client(None)
        .await
        .context("failed to connect to the management cluster")?;
    ensure_crds_installed(
        &client,
        vec![CatalogEntry::crd(), TargetCluster::crd()],
        &runtime.field_manager,
    )
    .await
    .context("failed to install CRDs")?;

    let ctx = Arc::new(
        SynthesizerContext::builder(client.clone())
            .field_manager(&runtime.field_manager)
            .secrets_namespace(args.secrets_namespace)
            .applications_namespace(args.applications_namespace)
            .backoff(runtime.backoff())
            .build(),
    );

    tracing::info!("Starting Shipyard manager...");
    tracing::info!("  - TargetCluster synthesizer");
    tracing::info!("  - CatalogEntry fan-out to enforced clusters");

    let clusters: Api<TargetCluster> = Api::all(client.clone());
    let entries: Api<CatalogEntry> = Api::all(client);

    let controller = Controller::new(clusters, WatcherConfig::default())
        .with_config(runtime.controller_config());
    let cluster_store = controller.store();
    controller
        .watches(
            entries,
            WatcherConfig::default(),
            enforced_entry_mapper(cluster_store),
        )
        .shutdown_on_signal()
        .run(synthesizer::reconcile, synthesizer::error_policy, ctx)
        .for_each(log_reconcile_result("TargetCluster"))
        .await;

    tracing::info!("Shipyard manager shutting down");
    Ok(())
}

/// Run the target-side installation controller
async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    let runtime = args.runtime;
    let client = create_client(None)
        .await
        .context("failed to connect to the local cluster")?;
    let catalog_client = match &args.management_kubeconfig {
        Some(path) => create_client(Some(path))
            .await
            .context("failed to connect to the management cluster")?,
        None => client.clone(),
    };

    let mut crds = vec![InstallationRecord::crd()];
    if args.management_kubeconfig.is_none() {
        crds.push(CatalogEntry::crd());
    }
    ensure_crds_installed(&client, crds, &runtime.field_manager)
        .await
        .context("failed to install CRDs")?;

    let orchestrator_version = match client.apiserver_version().await {
        Ok(info) => parse_lenient(&info.git_version),
        Err(e) => {
            tracing::warn!(error = %e, "could not read the Kubernetes version, skipping constraint checks");
            None
        }
    };
    let platform_version = args.platform_version.as_deref().and_then(parse_lenient);
    tracing::info!(
        kubernetes = ?orchestrator_version.as_ref().map(ToString::to_string),
        platform = ?platform_version.as_ref().map(ToString::to_string),
        "versions for constraint checks"
    );

    // Repository credentials live next to the catalog entries referencing them
    let ctx = Arc::new(
        InstallationContext::builder(client.clone(), catalog_client.clone())
            .binaries(args.helm_binary, args.git_binary)
            .credentials_namespace(args.credentials_namespace)
            .field_manager(&runtime.field_manager)
            .platform_version(platform_version)
            .orchestrator_version(orchestrator_version)
            .backoff(runtime.backoff())
            .build(),
    );

    tracing::info!("Starting Shipyard agent...");
    tracing::info!("  - InstallationRecord controller");
    tracing::info!("  - CatalogEntry fan-out to dependent records");

    let records: Api<InstallationRecord> = Api::all(client);
    let entries: Api<CatalogEntry> = Api::all(catalog_client);

    let controller = Controller::new(records, WatcherConfig::default())
        .with_config(runtime.controller_config());
    let record_store = controller.store();
    controller
        .watches(
            entries,
            WatcherConfig::default(),
            dependent_records_mapper(record_store),
        )
        .shutdown_on_signal()
        .run(installation::reconcile, installation::error_policy, ctx)
        .for_each(log_reconcile_result("InstallationRecord"))
        .await;

    tracing::info!("Shipyard agent shutting down");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
