//! Catalog-change fan-out
//!
//! A changed CatalogEntry affects two kinds of objects: every target cluster
//! its selector matches (so the synthesizer can add or restore enforced
//! records), and every record installing it (so version or source changes
//! reach installed applications). Only enforced entries fan out to clusters;
//! every change fans out to records.
//!
//! The mappers here plug into `Controller::watches`, reading the owning
//! controller's reflector store instead of listing from the API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{CatalogEntry, InstallationRecord, TargetCluster};
use crate::kube_utils::is_deleting;

/// Clusters the synthesizer must revisit after `entry` changed
pub fn clusters_for_entry(
    entry: &CatalogEntry,
    clusters: &[Arc<TargetCluster>],
) -> Vec<ObjectRef<TargetCluster>> {
    clusters
        .iter()
        .filter(|c| !is_deleting(c.as_ref()) && entry.spec.selects_datacenter(&c.spec.datacenter))
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}

/// Records installing the entry named `entry_name`
pub fn records_for_entry(
    entry_name: &str,
    records: &[Arc<InstallationRecord>],
) -> Vec<ObjectRef<InstallationRecord>> {
    records
        .iter()
        .filter(|r| r.spec.application_ref.name == entry_name)
        .map(|r| ObjectRef::from_obj(r.as_ref()))
        .collect()
}

/// Decides which catalog changes are worth a cluster-wide re-evaluation.
///
/// Watch events carry no previous object, so the uid, enforced flag and
/// generation last seen are remembered per entry. A live enforced entry
/// passes when it is first seen, when it was recreated, when it just became
/// enforced, or when its spec changed.
#[derive(Debug, Default)]
pub struct EnforcedChangeFilter {
    seen: HashMap<String, (Option<String>, bool, Option<i64>)>,
}

impl EnforcedChangeFilter {
    /// Returns true if `entry` should fan out to clusters
    pub fn admit(&mut self, entry: &CatalogEntry) -> bool {
        let name = entry.name_any();
        if is_deleting(entry) {
            self.seen.remove(&name);
            return false;
        }

        let current = (
            entry.metadata.uid.clone(),
            entry.spec.is_enforced,
            entry.metadata.generation,
        );
        let previous = self.seen.insert(name, current.clone());
        if !entry.spec.is_enforced {
            return false;
        }
        match previous {
            None => true,
            Some((uid, was_enforced, generation)) => {
                uid != current.0 || !was_enforced || generation != current.2
            }
        }
    }
}

/// Maps catalog changes to the clusters in `clusters` they affect
pub fn enforced_entry_mapper(
    clusters: Store<TargetCluster>,
) -> impl Fn(CatalogEntry) -> Vec<ObjectRef<TargetCluster>> + Send + Sync + 'static {
    let filter = Mutex::new(EnforcedChangeFilter::default());
    move |entry| {
        let admitted = filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(&entry);
        if !admitted {
            return Vec::new();
        }
        let refs = clusters_for_entry(&entry, &clusters.state());
        debug!(entry = %entry.name_any(), clusters = refs.len(), "enforced entry changed");
        refs
    }
}

/// Maps catalog changes to the records in `records` installing them
pub fn dependent_records_mapper(
    records: Store<InstallationRecord>,
) -> impl Fn(CatalogEntry) -> Vec<ObjectRef<InstallationRecord>> + Send + Sync + 'static {
    move |entry| records_for_entry(&entry.name_any(), &records.state())
}
