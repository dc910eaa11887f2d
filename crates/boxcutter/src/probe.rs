//! Probing of reconciled objects.
//!
//! Probes are named predicates attached to a reconciliation. Their outcomes
//! are carried on the object result and feed the success and completeness
//! aggregation of the surrounding phase and revision.

use std::collections::BTreeMap;

use kube::core::DynamicObject;

/// The well-known probe name consulted by phase-completeness logic. A phase
/// only counts as complete once every object's `Progress` probe reports
/// success.
pub const PROGRESS_PROBE_NAME: &str = "Progress";

/// A predicate over an observed object.
pub trait Prober: Send + Sync {
    fn probe(&self, object: &DynamicObject) -> ProbeResult;
}

impl<F> Prober for F
where
    F: Fn(&DynamicObject) -> ProbeResult + Send + Sync,
{
    fn probe(&self, object: &DynamicObject) -> ProbeResult {
        self(object)
    }
}

/// The outcome of a single probe invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub messages: Vec<String>,
}

impl ProbeResult {
    pub fn success() -> Self {
        Self {
            success: true,
            messages: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: vec![message.into()],
        }
    }
}

/// Probe outcomes keyed by probe name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResults(BTreeMap<String, ProbeResult>);

impl ProbeResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, result: ProbeResult) {
        self.0.insert(name.into(), result);
    }

    pub fn get(&self, name: &str) -> Option<&ProbeResult> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_successful(&self) -> bool {
        self.0.values().all(|result| result.success)
    }

    /// The outcome of the well-known `Progress` probe, if one was attached.
    pub fn progress(&self) -> Option<&ProbeResult> {
        self.0.get(PROGRESS_PROBE_NAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProbeResult)> {
        self.0.iter()
    }
}
