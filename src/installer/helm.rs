//! Installer backed by the `helm` and `git` binaries
//!
//! Every attempt works in a fresh temporary directory: the chart is pulled
//! (or the repository cloned) into it, the merged values are written next to
//! it, and `helm upgrade --install` releases it. Uninstall uses
//! `helm uninstall --ignore-not-found`, so removing an absent release is a
//! no-op.
//!
//! A release left in a `pending-*` state by an interrupted helm run blocks
//! every later upgrade, so each install first checks the release history and
//! rolls back to the last deployed revision (or uninstalls when there is
//! none).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{InstallOutcome, Installer, ResolvedApplication};
use crate::crd::{
    ApplicationSource, ConditionStatus, GitSource, HelmSource, InstallationRecord, InstallerState,
    SecretKeyRef, CONDITION_MANIFESTS_RETRIEVED,
};
use crate::kube_utils::{deterministic_hash, get_secret_data};
use crate::Error;

/// Helm refuses release names longer than this
const MAX_RELEASE_NAME_LEN: usize = 53;

/// Wait timeout used when `wait` is set without one
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Digest characters appended to every release name
const RELEASE_DIGEST_LEN: usize = 9;

/// Release name for a record: a readable `<namespace>-<name>` prefix plus a
/// digest of `<namespace>/<name>`.
///
/// `-` is legal inside both parts, so the prefix alone is ambiguous; the
/// digest is over a separator names cannot contain.
pub fn release_name(record: &InstallationRecord) -> String {
    let namespace = record.namespace().unwrap_or_default();
    let name = record.name_any();
    let digest = deterministic_hash(&format!("{namespace}/{name}"));
    let keep = MAX_RELEASE_NAME_LEN - RELEASE_DIGEST_LEN - 1;
    let prefix: String = format!("{namespace}-{name}").chars().take(keep).collect();
    format!(
        "{}-{}",
        prefix.trim_end_matches('-'),
        &digest[..RELEASE_DIGEST_LEN]
    )
}

/// Secrets holding repository credentials, read from the management cluster
struct CredentialSource {
    client: Client,
    default_namespace: String,
}

/// [`Installer`] that shells out to helm
pub struct HelmInstaller {
    helm_binary: String,
    git_binary: String,
    kubeconfig: Option<PathBuf>,
    credentials: Option<CredentialSource>,
}

impl HelmInstaller {
    /// Create an installer using the given binaries against the in-cluster config
    pub fn new(helm_binary: impl Into<String>, git_binary: impl Into<String>) -> Self {
        Self {
            helm_binary: helm_binary.into(),
            git_binary: git_binary.into(),
            kubeconfig: None,
            credentials: None,
        }
    }

    /// Target the cluster described by this kubeconfig instead
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Resolve repository credentials through `client`.
    ///
    /// Secret references without a namespace are looked up in `default_namespace`.
    pub fn with_credentials(mut self, client: Client, default_namespace: impl Into<String>) -> Self {
        self.credentials = Some(CredentialSource {
            client,
            default_namespace: default_namespace.into(),
        });
        self
    }

    /// Client repository credentials are read through, if configured
    pub fn credentials_client(&self) -> Option<&Client> {
        self.credentials.as_ref().map(|c| &c.client)
    }

    async fn read_credential(&self, secret: &SecretKeyRef) -> Result<String, Error> {
        let source = self.credentials.as_ref().ok_or_else(|| {
            Error::installer(format!(
                "source references secret {} but no credential client is configured",
                secret.name
            ))
        })?;
        let namespace = secret
            .namespace
            .as_deref()
            .unwrap_or(&source.default_namespace);
        let raw = get_secret_data(&source.client, &secret.name, namespace, &secret.key).await?;
        String::from_utf8(raw)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::installer(format!("credential {} is not UTF-8: {e}", secret.name)))
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, Error> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Not killed on drop: an interrupted upgrade leaves the release
        // pending, which the next install has to roll back.
        if let Some(kubeconfig) = &self.kubeconfig {
            command.env("KUBECONFIG", kubeconfig);
        }

        debug!(program, args = ?redacted(args), "running");
        let output = command
            .output()
            .await
            .map_err(|e| Error::installer(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::installer(format!(
                "{program} {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fetch the chart into `workdir`, returning the chart directory
    async fn fetch(&self, source: &ApplicationSource, workdir: &Path) -> Result<PathBuf, Error> {
        match source {
            ApplicationSource::Helm(helm) => {
                let credential = match &helm.credentials {
                    Some(secret) => Some(self.read_credential(secret).await?),
                    None => None,
                };
                let untar = workdir.join("chart");
                let args = pull_args(helm, &untar, credential.as_deref());
                self.run(&self.helm_binary, &args).await?;
                Ok(untar.join(&helm.chart_name))
            }
            ApplicationSource::Git(git) => {
                let token = match &git.credentials {
                    Some(secret) => Some(self.read_credential(secret).await?),
                    None => None,
                };
                let checkout = workdir.join("source");
                for (program, args) in git_fetch_commands(git, &checkout, token.as_deref()) {
                    let binary = match program {
                        Tool::Git => &self.git_binary,
                        Tool::Helm => &self.helm_binary,
                    };
                    self.run(binary, &args).await?;
                }
                Ok(checkout.join(&git.path))
            }
        }
    }

    /// Roll back or remove a release stuck in a pending state
    async fn recover_stuck_release(&self, release: &str, namespace: &str) -> Result<(), Error> {
        let history = match self
            .run(&self.helm_binary, &history_args(release, namespace))
            .await
        {
            Ok(stdout) => stdout,
            Err(e) if e.to_string().contains("not found") => return Ok(()),
            Err(e) => return Err(e),
        };
        match stuck_recovery(&history)? {
            None => Ok(()),
            Some(Recovery::Rollback(revision)) => {
                warn!(release, revision, "release stuck in a pending state, rolling back");
                self.run(&self.helm_binary, &rollback_args(release, namespace, revision))
                    .await?;
                Ok(())
            }
            Some(Recovery::Uninstall) => {
                warn!(release, "release stuck with no deployed revision, uninstalling");
                self.run(&self.helm_binary, &uninstall_args(release, namespace))
                    .await?;
                Ok(())
            }
        }
    }

    async fn install(
        &self,
        record: &InstallationRecord,
        app: &ResolvedApplication,
    ) -> (bool, Result<InstallerState, Error>) {
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return (false, Err(Error::installer(format!("tempdir: {e}")))),
        };

        let chart_dir = match self.fetch(&app.version.source, workdir.path()).await {
            Ok(dir) => dir,
            Err(e) => return (false, Err(e)),
        };

        let values_path = workdir.path().join("values.yaml");
        let result = async {
            let values = serde_yaml::to_string(&app.values)?;
            tokio::fs::write(&values_path, values)
                .await
                .map_err(|e| Error::installer(format!("writing values: {e}")))?;

            let release = release_name(record);
            let namespace = &record.spec.namespace.name;
            self.recover_stuck_release(&release, namespace).await?;
            let args = upgrade_args(&release, namespace, &chart_dir, &values_path, app);
            let stdout = self.run(&self.helm_binary, &args).await?;
            Ok::<_, Error>(installer_state(&release, namespace, &stdout))
        }
        .await;
        (true, result)
    }
}

#[async_trait]
impl Installer for HelmInstaller {
    #[instrument(skip(self, record, app), fields(record = %record.name_any(), version = %app.version.version))]
    async fn apply(&self, record: &InstallationRecord, app: &ResolvedApplication) -> InstallOutcome {
        let generation = record.metadata.generation;
        let (retrieved, result) = self.install(record, app).await;

        let retrieval_message = match (&result, retrieved) {
            (Err(e), false) => e.to_string(),
            _ => String::new(),
        };
        let state = result.as_ref().ok().cloned();
        let outcome = InstallOutcome {
            mutation: None,
            result: result.map(|_| ()),
        };

        if let Some(state) = &state {
            info!(release = %state.release_name, status = %state.status, "release applied");
        }
        outcome.with_mutation(move |status| {
            let now = Utc::now();
            if retrieved {
                status.set_condition(
                    CONDITION_MANIFESTS_RETRIEVED,
                    ConditionStatus::True,
                    "ManifestsRetrieved",
                    "application manifests downloaded",
                    generation,
                    now,
                );
            } else {
                status.set_condition(
                    CONDITION_MANIFESTS_RETRIEVED,
                    ConditionStatus::False,
                    "ManifestsRetrievalFailed",
                    retrieval_message,
                    generation,
                    now,
                );
            }
            if let Some(state) = state {
                status.installer_state = Some(state);
            }
        })
    }

    #[instrument(skip(self, record), fields(record = %record.name_any()))]
    async fn delete(&self, record: &InstallationRecord) -> InstallOutcome {
        let release = release_name(record);
        let args = uninstall_args(&release, &record.spec.namespace.name);
        match self.run(&self.helm_binary, &args).await {
            Ok(_) => {
                info!(release = %release, "release removed");
                InstallOutcome::ok().with_mutation(|status| status.installer_state = None)
            }
            Err(e) => {
                warn!(release = %release, error = %e, "uninstall failed");
                InstallOutcome::failed(e)
            }
        }
    }
}

// =============================================================================
// Command lines
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Tool {
    Git,
    Helm,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `helm pull` for a chart repository or OCI registry.
///
/// A credential is `username:password`.
fn pull_args(helm: &HelmSource, untar_dir: &Path, credential: Option<&str>) -> Vec<String> {
    let mut args = vec!["pull".to_string()];
    if helm.url.starts_with("oci://") {
        args.push(format!("{}/{}", helm.url.trim_end_matches('/'), helm.chart_name));
    } else {
        args.extend([
            helm.chart_name.clone(),
            "--repo".to_string(),
            helm.url.clone(),
        ]);
    }
    args.extend([
        "--version".to_string(),
        helm.chart_version.clone(),
        "--untar".to_string(),
        "--untardir".to_string(),
        path_arg(untar_dir),
    ]);
    if helm.insecure {
        args.push("--insecure-skip-tls-verify".to_string());
    }
    if helm.plain_http {
        args.push("--plain-http".to_string());
    }
    if let Some((user, password)) = credential.and_then(|c| c.split_once(':')) {
        args.extend([
            "--username".to_string(),
            user.to_string(),
            "--password".to_string(),
            password.to_string(),
        ]);
    }
    args
}

/// Commands that produce a chart directory from a git source.
///
/// Tags and branches are shallow clones; commits need the history to check
/// out. A credential is a token injected into https remotes.
fn git_fetch_commands(git: &GitSource, checkout: &Path, token: Option<&str>) -> Vec<(Tool, Vec<String>)> {
    let remote = match token {
        Some(token) if git.remote.starts_with("https://") => git
            .remote
            .replacen("https://", &format!("https://oauth2:{token}@"), 1),
        _ => git.remote.clone(),
    };
    let dir = path_arg(checkout);

    let mut commands = Vec::new();
    match git.ref_.clone_target() {
        Some(target) => commands.push((
            Tool::Git,
            vec![
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                "--branch".to_string(),
                target.to_string(),
                remote,
                dir.clone(),
            ],
        )),
        None => {
            commands.push((Tool::Git, vec!["clone".to_string(), remote, dir.clone()]));
            if let Some(commit) = &git.ref_.commit {
                commands.push((
                    Tool::Git,
                    vec![
                        "-C".to_string(),
                        dir.clone(),
                        "checkout".to_string(),
                        commit.clone(),
                    ],
                ));
            }
        }
    }
    commands.push((
        Tool::Helm,
        vec![
            "dependency".to_string(),
            "build".to_string(),
            path_arg(&checkout.join(&git.path)),
        ],
    ));
    commands
}

fn upgrade_args(
    release: &str,
    namespace: &str,
    chart_dir: &Path,
    values: &Path,
    app: &ResolvedApplication,
) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        release.to_string(),
        path_arg(chart_dir),
        "--namespace".to_string(),
        namespace.to_string(),
        "--values".to_string(),
        path_arg(values),
        "--output".to_string(),
        "json".to_string(),
    ];
    if let Some(opts) = &app.deploy_options.helm {
        if opts.wait || opts.atomic {
            let timeout = opts.timeout_seconds.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS);
            args.extend(["--wait".to_string(), "--timeout".to_string(), format!("{timeout}s")]);
        }
        if opts.atomic {
            args.push("--atomic".to_string());
        }
        if opts.enable_dns {
            args.push("--enable-dns".to_string());
        }
    }
    args
}

fn uninstall_args(release: &str, namespace: &str) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        release.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--ignore-not-found".to_string(),
    ]
}

fn history_args(release: &str, namespace: &str) -> Vec<String> {
    vec![
        "history".to_string(),
        release.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]
}

fn rollback_args(release: &str, namespace: &str, revision: u32) -> Vec<String> {
    vec![
        "rollback".to_string(),
        release.to_string(),
        revision.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]
}

/// Mask the value following `--password` and any userinfo in URLs
fn redacted(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        mask_next = arg == "--password";
        match arg.split_once('@') {
            Some((scheme_and_user, rest)) if scheme_and_user.starts_with("https://") => {
                out.push(format!("https://***@{rest}"));
            }
            _ => out.push(arg.clone()),
        }
    }
    out
}

#[derive(Deserialize, Default)]
struct ReleaseJson {
    #[serde(default)]
    info: ReleaseInfo,
    #[serde(default)]
    chart: ReleaseChart,
}

#[derive(Deserialize, Default)]
struct ReleaseInfo {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize, Default)]
struct ReleaseChart {
    #[serde(default)]
    metadata: ReleaseChartMetadata,
}

#[derive(Deserialize, Default)]
struct ReleaseChartMetadata {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    revision: u32,
    #[serde(default)]
    status: String,
}

/// How to unblock a release whose latest revision never finished
#[derive(Debug, PartialEq, Eq)]
enum Recovery {
    Rollback(u32),
    Uninstall,
}

/// Decide from `helm history -o json` output whether the release is stuck.
///
/// Rolls back to the newest `deployed` revision, falling back to the newest
/// `superseded` one.
fn stuck_recovery(history_json: &str) -> Result<Option<Recovery>, Error> {
    let history: Vec<HistoryEntry> = serde_json::from_str(history_json)?;
    let Some(latest) = history.iter().max_by_key(|h| h.revision) else {
        return Ok(None);
    };
    if !latest.status.starts_with("pending-") {
        return Ok(None);
    }
    let newest_with = |status: &str| {
        history
            .iter()
            .filter(|h| h.revision < latest.revision && h.status == status)
            .map(|h| h.revision)
            .max()
    };
    Ok(Some(
        newest_with("deployed")
            .or_else(|| newest_with("superseded"))
            .map(Recovery::Rollback)
            .unwrap_or(Recovery::Uninstall),
    ))
}

fn installer_state(release: &str, namespace: &str, stdout: &str) -> InstallerState {
    let parsed: ReleaseJson = serde_json::from_str(stdout).unwrap_or_default();
    InstallerState {
        release_name: release.to_string(),
        namespace: namespace.to_string(),
        chart_version: parsed.chart.metadata.version,
        status: if parsed.info.status.is_empty() {
            "deployed".to_string()
        } else {
            parsed.info.status
        },
    }
}
