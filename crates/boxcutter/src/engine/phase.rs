//! The phase engine: preflight-validates a phase, then reconciles or tears
//! down its objects as a set.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::warn;

use super::{
    ObjectEngine, ObjectEngineError, PhaseResult, PhaseTeardownResult, ReconcileOptions,
    TeardownOptions,
};
use crate::{
    revision::{Phase, Revision},
    validation::PhaseValidator,
};

#[derive(Debug, Snafu)]
pub enum PhaseEngineError {
    #[snafu(display("phase validator failed"))]
    ValidatePhase { source: kube::Error },

    #[snafu(display("failed reconciling object {object}"))]
    ReconcileObject {
        source: ObjectEngineError,
        object: String,
    },

    #[snafu(display("failed tearing down object {object}"))]
    TeardownObject {
        source: ObjectEngineError,
        object: String,
    },
}

/// Reconciles and tears down the objects of one phase.
#[derive(Clone)]
pub struct PhaseEngine {
    object_engine: Arc<ObjectEngine>,
    validator: Arc<dyn PhaseValidator>,
}

impl PhaseEngine {
    pub fn new(object_engine: Arc<ObjectEngine>, validator: Arc<dyn PhaseValidator>) -> Self {
        Self {
            object_engine,
            validator,
        }
    }

    /// Validates the phase, then reconciles its objects in declared order.
    /// A validation verdict is recorded on the result without touching any
    /// object; the first hard error aborts the phase.
    pub async fn reconcile(
        &self,
        revision: &Revision,
        phase: &Phase,
        options: &ReconcileOptions,
    ) -> Result<PhaseResult, PhaseEngineError> {
        if let Some(error) = self
            .validator
            .validate(phase)
            .await
            .context(ValidatePhaseSnafu)?
        {
            warn!(phase = %phase.name, %error, "phase failed preflight validation");
            return Ok(PhaseResult::invalid(&phase.name, error));
        }

        let mut objects = Vec::with_capacity(phase.objects.len());
        for desired in &phase.objects {
            let merged = options.merged_with(&desired.options);
            let result = self
                .object_engine
                .reconcile(revision.revision, &desired.object, &merged)
                .await
                .with_context(|_| ReconcileObjectSnafu {
                    object: object_label(desired),
                })?;
            objects.push(result);
        }
        Ok(PhaseResult::reconciled(&phase.name, objects))
    }

    /// Tears down every object of the phase, partitioning them into gone
    /// and waiting. All objects are visited, waiting objects do not
    /// short-circuit the iteration.
    pub async fn teardown(
        &self,
        revision: &Revision,
        phase: &Phase,
        options: &TeardownOptions,
    ) -> Result<PhaseTeardownResult, PhaseEngineError> {
        let mut gone = Vec::new();
        let mut waiting = Vec::new();
        for desired in &phase.objects {
            let is_gone = self
                .object_engine
                .teardown(revision.revision, &desired.object, options)
                .await
                .with_context(|_| TeardownObjectSnafu {
                    object: object_label(desired),
                })?;
            if let Some(object_ref) = desired.object_ref() {
                if is_gone {
                    gone.push(object_ref);
                } else {
                    waiting.push(object_ref);
                }
            }
        }
        Ok(PhaseTeardownResult::new(&phase.name, gone, waiting))
    }
}

fn object_label(desired: &crate::revision::DesiredObject) -> String {
    desired
        .object_ref()
        .map_or_else(|| "<unknown object>".to_owned(), |r| r.to_string())
}
