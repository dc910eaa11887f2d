//! The three nested reconciliation engines.
//!
//! A [`RevisionEngine`] sequences phases, a [`PhaseEngine`] reconciles the
//! objects of one phase as a set, an [`ObjectEngine`] brings a single object
//! to its desired state. Results propagate upward unchanged in meaning.
//!
//! Every call is a single sequential procedure that spawns no background
//! work; the surrounding controller schedules calls concurrently across
//! revisions. Cancellation is dropping the future: no call leaves partial
//! in-memory state behind and every operation is safe to retry, so a drop
//! between read and write at worst costs one extra iteration.

use std::{fmt, sync::Arc};

use crate::{
    client::Writer,
    ownership::{OwnerIdentity, RevisionOwnership},
    probe::Prober,
};

mod object;
mod phase;
mod result;
mod revision;

pub use object::{ObjectEngine, ObjectEngineError};
pub use phase::{PhaseEngine, PhaseEngineError};
pub use result::{
    Action, ObjectResult, PhaseResult, PhaseTeardownResult, RevisionResult,
    RevisionTeardownResult,
};
pub use revision::{RevisionEngine, RevisionEngineError};

/// How the object engine treats live objects that are not controlled by the
/// reconciling revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum CollisionProtection {
    /// Only objects already controlled by this revision are touched.
    #[default]
    Prevent,
    /// Objects without any controller may be adopted.
    IfNoController,
    /// Any object may be taken over.
    None,
}

/// Options for reconcile calls.
///
/// The same structure is accepted at revision, phase and object level.
/// Options given on a [`crate::revision::DesiredObject`] are layered over
/// the surrounding ones: an object-level owner or collision setting
/// replaces, previous owners and probes accumulate, paused is sticky.
#[derive(Clone, Default)]
pub struct ReconcileOptions {
    /// Enables owner tracking. Without it the engine still operates but
    /// only stamps the managed-by label.
    pub ownership: Option<Arc<dyn RevisionOwnership>>,
    /// Identities permitted to surrender control to this revision without
    /// triggering a collision. A flat list, never resolved transitively.
    pub previous_owners: Vec<OwnerIdentity>,
    pub collision_protection: CollisionProtection,
    /// Compute the action as if applying, but issue no write.
    pub paused: bool,
    /// Named probes run against the observed object of every result.
    pub probes: Vec<(String, Arc<dyn Prober>)>,
}

impl ReconcileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, ownership: Arc<dyn RevisionOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    pub fn with_previous_owners(
        mut self,
        owners: impl IntoIterator<Item = OwnerIdentity>,
    ) -> Self {
        self.previous_owners.extend(owners);
        self
    }

    pub fn with_collision_protection(mut self, protection: CollisionProtection) -> Self {
        self.collision_protection = protection;
        self
    }

    pub fn with_paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn with_probe(mut self, name: impl Into<String>, prober: Arc<dyn Prober>) -> Self {
        self.probes.push((name.into(), prober));
        self
    }

    /// Layers object-level options over these.
    pub(crate) fn merged_with(&self, object_level: &Self) -> Self {
        let mut merged = self.clone();
        if let Some(ownership) = &object_level.ownership {
            merged.ownership = Some(ownership.clone());
        }
        merged
            .previous_owners
            .extend(object_level.previous_owners.iter().cloned());
        if object_level.collision_protection != CollisionProtection::default() {
            merged.collision_protection = object_level.collision_protection;
        }
        merged.paused |= object_level.paused;
        merged
            .probes
            .extend(object_level.probes.iter().cloned());
        merged
    }
}

impl fmt::Debug for ReconcileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileOptions")
            .field("ownership", &self.ownership)
            .field("previous_owners", &self.previous_owners)
            .field("collision_protection", &self.collision_protection)
            .field("paused", &self.paused)
            .field(
                "probes",
                &self.probes.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Options for teardown calls.
#[derive(Clone, Default)]
pub struct TeardownOptions {
    pub ownership: Option<Arc<dyn RevisionOwnership>>,
    /// Detach engine metadata instead of deleting the objects.
    pub orphan: bool,
    /// Routes delete calls through an alternate writer, e.g. one that
    /// impersonates a service account.
    pub teardown_writer: Option<Arc<dyn Writer>>,
}

impl TeardownOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, ownership: Arc<dyn RevisionOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    pub fn with_orphan(mut self) -> Self {
        self.orphan = true;
        self
    }

    pub fn with_teardown_writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.teardown_writer = Some(writer);
        self
    }
}

impl fmt::Debug for TeardownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownOptions")
            .field("ownership", &self.ownership)
            .field("orphan", &self.orphan)
            .field(
                "teardown_writer",
                &self.teardown_writer.as_ref().map(|_| "<custom>"),
            )
            .finish()
    }
}
