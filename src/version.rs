//! Version resolution for catalog entries
//!
//! Records either pin an exact version string or leave it empty, in which case
//! the highest version of the entry is picked. Ordering is plain semantic
//! version precedence, so pre-releases take part: `1.2.0-rc1` outranks
//! `1.0.3`.

use semver::Version;
use tracing::debug;

use crate::crd::{ApplicationVersion, CatalogEntrySpec, VersionConstraints};
use crate::Error;

/// Parse a version string leniently.
///
/// A leading `v` is dropped and missing minor or patch components are
/// padded with zero, so `v1.2` parses as `1.2.0`. Build metadata and
/// pre-release suffixes are kept.
pub fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).ok()
}

/// Pick the version record to install.
///
/// With `desired` set, the exact string must be declared on the entry.
/// Without it, the highest parseable version wins; malformed strings are
/// skipped rather than failing the whole resolution.
pub fn resolve<'a>(
    entry_name: &str,
    spec: &'a CatalogEntrySpec,
    desired: Option<&str>,
) -> Result<&'a ApplicationVersion, Error> {
    match desired.filter(|d| !d.is_empty()) {
        Some(wanted) => spec
            .versions
            .iter()
            .find(|v| v.version == wanted)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "version '{wanted}' does not exist in catalog entry '{entry_name}'"
                ))
            }),
        None => highest(spec).ok_or_else(|| {
            Error::not_found(format!(
                "catalog entry '{entry_name}' has no resolvable version"
            ))
        }),
    }
}

/// The highest version declared on the entry, if any parses
pub fn highest(spec: &CatalogEntrySpec) -> Option<&ApplicationVersion> {
    let mut best: Option<(Version, &ApplicationVersion)> = None;
    for candidate in &spec.versions {
        let Some(parsed) = parse_lenient(&candidate.version) else {
            debug!(version = %candidate.version, "skipping malformed version");
            continue;
        };
        match &best {
            Some((current, _)) if *current >= parsed => {}
            _ => best = Some((parsed, candidate)),
        }
    }
    best.map(|(_, v)| v)
}

/// The version string synthesized records pin to
pub fn default_version_string(entry_name: &str, spec: &CatalogEntrySpec) -> Result<String, Error> {
    match spec.default_version.as_deref().filter(|v| !v.is_empty()) {
        Some(v) => Ok(v.to_string()),
        None => resolve(entry_name, spec, None).map(|v| v.version.clone()),
    }
}

impl VersionConstraints {
    /// Check the constraints against the versions a target runs.
    ///
    /// An unset constraint is always satisfied. A set constraint against an
    /// unknown target version is also treated as satisfied, since there is
    /// nothing to compare.
    pub fn is_satisfied_by(
        &self,
        platform: Option<&Version>,
        orchestrator: Option<&Version>,
    ) -> Result<bool, Error> {
        Ok(meets_minimum(self.min_platform_version.as_deref(), platform)?
            && meets_minimum(self.min_orchestrator_version.as_deref(), orchestrator)?)
    }
}

fn meets_minimum(minimum: Option<&str>, actual: Option<&Version>) -> Result<bool, Error> {
    let Some(minimum) = minimum.filter(|m| !m.trim().is_empty()) else {
        return Ok(true);
    };
    let Some(actual) = actual else {
        return Ok(true);
    };
    let minimum = parse_lenient(minimum)
        .ok_or_else(|| Error::validation(format!("invalid version constraint '{minimum}'")))?;
    Ok(*actual >= minimum)
}
