//! The result taxonomy the engines report upward.
//!
//! Results are a closed tagged set: exactly one action per reconciliation
//! call, with success and completeness derived bottom-up. The `Display`
//! renderings are stable and meant for logs and CLIs.

use std::fmt::{self, Display};

use kube::core::DynamicObject;

use crate::{
    compare::CompareResult,
    ownership::OwnerIdentity,
    probe::ProbeResults,
    revision::ObjectRef,
    validation::{PhaseValidationError, RevisionValidationError},
};

/// What the object engine did (or declined to do) for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Action {
    /// The object did not exist and was posted.
    Created,
    /// The object was brought to desired state via server-side apply.
    Updated,
    /// Conflicting field managers were overridden via forced apply.
    Recovered,
    /// A newer revision controls the object, this revision stood down.
    Progressed,
    /// Nothing to do, the object is converged.
    Idle,
    /// The object belongs to someone else and collision protection stopped
    /// the takeover.
    Collision,
}

/// The outcome of reconciling a single object.
#[derive(Debug, Clone)]
pub struct ObjectResult {
    action: Action,
    object: DynamicObject,
    probes: ProbeResults,
    compare: Option<CompareResult>,
    conflicting_owner: Option<OwnerIdentity>,
}

impl ObjectResult {
    pub(crate) fn created(object: DynamicObject, probes: ProbeResults) -> Self {
        Self {
            action: Action::Created,
            object,
            probes,
            compare: None,
            conflicting_owner: None,
        }
    }

    pub(crate) fn updated(
        object: DynamicObject,
        probes: ProbeResults,
        compare: CompareResult,
    ) -> Self {
        Self {
            action: Action::Updated,
            object,
            probes,
            compare: Some(compare),
            conflicting_owner: None,
        }
    }

    pub(crate) fn recovered(
        object: DynamicObject,
        probes: ProbeResults,
        compare: CompareResult,
    ) -> Self {
        Self {
            action: Action::Recovered,
            object,
            probes,
            compare: Some(compare),
            conflicting_owner: None,
        }
    }

    pub(crate) fn progressed(object: DynamicObject, probes: ProbeResults) -> Self {
        Self {
            action: Action::Progressed,
            object,
            probes,
            compare: None,
            conflicting_owner: None,
        }
    }

    pub(crate) fn idle(
        object: DynamicObject,
        probes: ProbeResults,
        compare: CompareResult,
    ) -> Self {
        Self {
            action: Action::Idle,
            object,
            probes,
            compare: Some(compare),
            conflicting_owner: None,
        }
    }

    pub(crate) fn collision(
        object: DynamicObject,
        conflicting_owner: Option<OwnerIdentity>,
    ) -> Self {
        Self {
            action: Action::Collision,
            object,
            probes: ProbeResults::new(),
            compare: None,
            conflicting_owner,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// The observed object: the live object for `Idle`/`Progressed`/
    /// `Collision`, the server response for writes, the stamped desired
    /// object when paused.
    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    pub fn probes(&self) -> &ProbeResults {
        &self.probes
    }

    pub fn compare(&self) -> Option<&CompareResult> {
        self.compare.as_ref()
    }

    /// The owner that stopped us, for `Collision` results of owned objects.
    pub fn conflicting_owner(&self) -> Option<&OwnerIdentity> {
        self.conflicting_owner.as_ref()
    }

    /// `Collision` is never successful, `Idle` always is, everything else
    /// inherits success from the configured probes.
    pub fn is_success(&self) -> bool {
        match self.action {
            Action::Collision => false,
            Action::Idle => true,
            _ => self.probes.all_successful(),
        }
    }
}

impl Display for ObjectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = ObjectRef::from_object(&self.object)
            .map_or_else(|| "<unknown object>".to_owned(), |r| r.to_string());
        write!(f, "{name}: {action}", action = self.action)?;
        if let Some(owner) = &self.conflicting_owner {
            write!(f, " (owned by {owner})")?;
        }
        for (probe, result) in self.probes.iter() {
            if !result.success {
                write!(
                    f,
                    " [probe {probe} failed: {messages}]",
                    messages = result.messages.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

/// The outcome of reconciling one phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    name: String,
    objects: Vec<ObjectResult>,
    validation_error: Option<PhaseValidationError>,
}

impl PhaseResult {
    pub(crate) fn reconciled(name: impl Into<String>, objects: Vec<ObjectResult>) -> Self {
        Self {
            name: name.into(),
            objects,
            validation_error: None,
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, error: PhaseValidationError) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
            validation_error: Some(error),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_results(&self) -> &[ObjectResult] {
        &self.objects
    }

    pub fn validation_error(&self) -> Option<&PhaseValidationError> {
        self.validation_error.as_ref()
    }

    /// Complete means: valid, no collisions, and every configured progress
    /// probe reports success.
    pub fn is_complete(&self) -> bool {
        self.validation_error.is_none()
            && self
                .objects
                .iter()
                .all(|object| object.action() != Action::Collision)
            && self.objects.iter().all(|object| {
                object
                    .probes()
                    .progress()
                    .is_none_or(|progress| progress.success)
            })
    }

    /// In transition means: valid, at least one object is blocked behind a
    /// collision or a newer revision, and not every object has progressed.
    pub fn in_transition(&self) -> bool {
        self.validation_error.is_none()
            && self.objects.iter().any(|object| {
                matches!(object.action(), Action::Collision | Action::Progressed)
            })
            && !self.has_progressed()
    }

    /// Every object reports `Progressed`, i.e. a newer revision has taken
    /// over the whole phase.
    pub fn has_progressed(&self) -> bool {
        self.objects
            .iter()
            .all(|object| object.action() == Action::Progressed)
    }
}

impl Display for PhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {name:?}", name = self.name)?;
        if let Some(error) = &self.validation_error {
            return write!(f, ": {error}");
        }
        for object in &self.objects {
            write!(f, "\n  {object}")?;
        }
        Ok(())
    }
}

/// The outcome of reconciling a revision.
#[derive(Debug, Clone)]
pub struct RevisionResult {
    phase_names: Vec<String>,
    phases: Vec<PhaseResult>,
    validation_error: Option<RevisionValidationError>,
}

impl RevisionResult {
    pub(crate) fn reconciled(phase_names: Vec<String>, phases: Vec<PhaseResult>) -> Self {
        Self {
            phase_names,
            phases,
            validation_error: None,
        }
    }

    pub(crate) fn invalid(phase_names: Vec<String>, error: RevisionValidationError) -> Self {
        Self {
            phase_names,
            phases: Vec::new(),
            validation_error: Some(error),
        }
    }

    /// All declared phase names, in declared order. Phases the rollout has
    /// not reached yet have no entry in [`Self::phase_results`].
    pub fn phase_names(&self) -> &[String] {
        &self.phase_names
    }

    pub fn phase_results(&self) -> &[PhaseResult] {
        &self.phases
    }

    pub fn validation_error(&self) -> Option<&RevisionValidationError> {
        self.validation_error.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.validation_error.is_none()
            && self.phases.len() == self.phase_names.len()
            && self.phases.iter().all(PhaseResult::is_complete)
    }

    pub fn in_transition(&self) -> bool {
        self.validation_error.is_none()
            && (self.phases.iter().any(PhaseResult::in_transition)
                || self.phases.len() < self.phase_names.len())
    }
}

impl Display for RevisionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.validation_error {
            return write!(f, "Revision: {error}");
        }
        write!(
            f,
            "Revision: {done}/{total} phases reconciled",
            done = self.phases.len(),
            total = self.phase_names.len()
        )?;
        for phase in &self.phases {
            write!(f, "\n{phase}")?;
        }
        Ok(())
    }
}

/// The outcome of tearing down one phase.
#[derive(Debug, Clone)]
pub struct PhaseTeardownResult {
    name: String,
    gone: Vec<ObjectRef>,
    waiting: Vec<ObjectRef>,
}

impl PhaseTeardownResult {
    pub(crate) fn new(
        name: impl Into<String>,
        gone: Vec<ObjectRef>,
        waiting: Vec<ObjectRef>,
    ) -> Self {
        Self {
            name: name.into(),
            gone,
            waiting,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Objects confirmed absent.
    pub fn gone_objects(&self) -> &[ObjectRef] {
        &self.gone
    }

    /// Objects with a delete issued but finalizers still pending.
    pub fn waiting_objects(&self) -> &[ObjectRef] {
        &self.waiting
    }

    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl Display for PhaseTeardownResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Phase {name:?} teardown: {gone} gone, {waiting} waiting",
            name = self.name,
            gone = self.gone.len(),
            waiting = self.waiting.len()
        )
    }
}

/// The outcome of tearing down a revision. Phases tear down in reverse
/// declared order; at most one phase is actively tearing down at a time.
#[derive(Debug, Clone)]
pub struct RevisionTeardownResult {
    gone: Vec<String>,
    active: Option<PhaseTeardownResult>,
    waiting: Vec<String>,
}

impl RevisionTeardownResult {
    pub(crate) fn new(
        gone: Vec<String>,
        active: Option<PhaseTeardownResult>,
        waiting: Vec<String>,
    ) -> Self {
        Self {
            gone,
            active,
            waiting,
        }
    }

    /// Names of fully torn-down phases, in declared order.
    pub fn gone_phase_names(&self) -> &[String] {
        &self.gone
    }

    pub fn active_phase(&self) -> Option<&PhaseTeardownResult> {
        self.active.as_ref()
    }

    pub fn active_phase_name(&self) -> Option<&str> {
        self.active.as_ref().map(PhaseTeardownResult::name)
    }

    /// Names of phases whose teardown has not started, in declared order.
    pub fn waiting_phase_names(&self) -> &[String] {
        &self.waiting
    }

    pub fn is_complete(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty()
    }
}

impl Display for RevisionTeardownResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Revision teardown: {gone} phases gone, {waiting} waiting",
            gone = self.gone.len(),
            waiting = self.waiting.len()
        )?;
        if let Some(active) = &self.active {
            write!(f, ", active: {name}", name = active.name())?;
        }
        Ok(())
    }
}
