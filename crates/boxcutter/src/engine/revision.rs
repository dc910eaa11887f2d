//! The revision engine: sequences phases forward on reconcile and in
//! reverse on teardown.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use super::{
    PhaseEngine, PhaseEngineError, ReconcileOptions, RevisionResult, RevisionTeardownResult,
    TeardownOptions,
};
use crate::{revision::Revision, validation::RevisionValidator};

#[derive(Debug, Snafu)]
pub enum RevisionEngineError {
    #[snafu(display("revision validator failed"))]
    ValidateRevision { source: kube::Error },

    #[snafu(display("failed reconciling phase {phase:?}"))]
    ReconcilePhase {
        source: PhaseEngineError,
        phase: String,
    },

    #[snafu(display("failed tearing down phase {phase:?}"))]
    TeardownPhase {
        source: PhaseEngineError,
        phase: String,
    },
}

/// Rolls a whole revision out and back.
#[derive(Clone)]
pub struct RevisionEngine {
    phase_engine: PhaseEngine,
    validator: Arc<dyn RevisionValidator>,
}

impl RevisionEngine {
    pub fn new(phase_engine: PhaseEngine, validator: Arc<dyn RevisionValidator>) -> Self {
        Self {
            phase_engine,
            validator,
        }
    }

    /// Reconciles phases in declared order, gating progression on phase
    /// completeness: a phase that is not complete halts the rollout, later
    /// phases are not touched.
    ///
    /// # Panics
    ///
    /// Panics when the revision number is zero, see
    /// [`super::ObjectEngine::reconcile`].
    pub async fn reconcile(
        &self,
        revision: &Revision,
        options: &ReconcileOptions,
    ) -> Result<RevisionResult, RevisionEngineError> {
        assert!(
            revision.revision >= 1,
            "revision number must be 1 or higher"
        );

        if let Some(error) = self
            .validator
            .validate(revision)
            .await
            .context(ValidateRevisionSnafu)?
        {
            warn!(revision = %revision.name, %error, "revision failed validation");
            return Ok(RevisionResult::invalid(revision.phase_names(), error));
        }

        let mut results = Vec::new();
        for phase in &revision.phases {
            let result = self
                .phase_engine
                .reconcile(revision, phase, options)
                .await
                .with_context(|_| ReconcilePhaseSnafu {
                    phase: phase.name.clone(),
                })?;
            let complete = result.is_complete();
            results.push(result);
            if !complete {
                debug!(
                    revision = %revision.name,
                    phase = %phase.name,
                    "phase not complete, halting rollout before later phases"
                );
                break;
            }
        }
        Ok(RevisionResult::reconciled(revision.phase_names(), results))
    }

    /// Tears phases down in reverse declared order. Only one phase is
    /// actively torn down at a time; phases before it wait, phases behind
    /// it are gone.
    ///
    /// # Panics
    ///
    /// Panics when the revision number is zero.
    pub async fn teardown(
        &self,
        revision: &Revision,
        options: &TeardownOptions,
    ) -> Result<RevisionTeardownResult, RevisionEngineError> {
        assert!(
            revision.revision >= 1,
            "revision number must be 1 or higher"
        );

        let mut gone = Vec::new();
        for (index, phase) in revision.phases.iter().enumerate().rev() {
            let result = self
                .phase_engine
                .teardown(revision, phase, options)
                .await
                .with_context(|_| TeardownPhaseSnafu {
                    phase: phase.name.clone(),
                })?;
            if result.is_complete() {
                gone.push(phase.name.clone());
                continue;
            }

            debug!(
                revision = %revision.name,
                phase = %phase.name,
                "phase still tearing down, earlier phases wait"
            );
            let waiting = revision.phases[..index]
                .iter()
                .map(|waiting_phase| waiting_phase.name.clone())
                .collect();
            // Gone phases are reported in declared order.
            gone.reverse();
            return Ok(RevisionTeardownResult::new(gone, Some(result), waiting));
        }

        gone.reverse();
        Ok(RevisionTeardownResult::new(gone, None, Vec::new()))
    }
}
