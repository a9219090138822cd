//! Controller implementations for Shipyard CRDs
//!
//! Controllers follow the observe-diff-act pattern: each one reads the current
//! object, computes the desired state and issues only the writes needed to get
//! there.
//!
//! - [`installation`] installs and removes what an InstallationRecord declares
//! - [`synthesizer`] creates default and enforced records on target clusters
//! - [`fanout`] maps catalog changes onto the objects of the two controllers above

pub mod fanout;
pub mod installation;
pub mod synthesizer;

pub use fanout::{
    clusters_for_entry, dependent_records_mapper, enforced_entry_mapper, records_for_entry,
    EnforcedChangeFilter,
};
pub use installation::{InstallationContext, InstallationContextBuilder, MAX_ATOMIC_FAILURES};
pub use synthesizer::{SynthesizerContext, SynthesizerContextBuilder, NOT_READY_REQUEUE};
