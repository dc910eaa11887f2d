//! Preflight validation of revisions and phases.
//!
//! Validation failures are not exceptional: they are recorded on the result
//! of the scope they invalidate and the scope is skipped, while
//! infrastructure failures of a validator (e.g. a failed dry-run request)
//! surface as plain errors.

// The name checks are adapted from Kubernetes.
// See apimachinery/pkg/util/validation/validation.go in the Kubernetes source

use std::{
    collections::HashSet,
    fmt::{self, Display},
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use const_format::concatcp;
use regex::Regex;

use crate::{
    ownership::RevisionOwnership,
    revision::{ObjectRef, Phase, Revision},
};

const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const RFC_1123_SUBDOMAIN_ERROR_MSG: &str = "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character";

// This is a subdomain's max length in DNS (RFC 1123)
const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

const RFC_1035_LABEL_FMT: &str = "[a-z]([-a-z0-9]*[a-z0-9])?";
const RFC_1035_LABEL_ERR_MSG: &str = "a DNS-1035 label must consist of lower case alphanumeric characters or '-', start with an alphabetic character, and end with an alphanumeric character";

// This is a label's max length in DNS (RFC 1035)
const RFC_1035_LABEL_MAX_LENGTH: usize = 63;

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

static RFC_1035_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1035_LABEL_FMT}$")).expect("failed to compile RFC 1035 label regex")
});

fn max_len_error(length: usize) -> String {
    format!("must be no more than {length} characters")
}

/// Tests for a string that conforms to the definition of a subdomain in DNS
/// (RFC 1123). Object names must pass this check.
pub fn is_rfc_1123_subdomain(value: &str) -> Result<(), Vec<String>> {
    let mut errors = vec![];
    if value.len() > RFC_1123_SUBDOMAIN_MAX_LENGTH {
        errors.push(max_len_error(RFC_1123_SUBDOMAIN_MAX_LENGTH));
    }

    if !RFC_1123_SUBDOMAIN_REGEX.is_match(value) {
        errors.push(RFC_1123_SUBDOMAIN_ERROR_MSG.to_owned());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Tests for a string that conforms to the definition of a label in DNS
/// (RFC 1035). Phase names must pass this check.
pub fn is_rfc_1035_label(value: &str) -> Result<(), Vec<String>> {
    let mut errors = vec![];
    if value.len() > RFC_1035_LABEL_MAX_LENGTH {
        errors.push(max_len_error(RFC_1035_LABEL_MAX_LENGTH));
    }

    if !RFC_1035_LABEL_REGEX.is_match(value) {
        errors.push(RFC_1035_LABEL_ERR_MSG.to_owned());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// A single violation, optionally tied to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectViolation {
    pub object: Option<ObjectRef>,
    pub message: String,
}

impl Display for ObjectViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(object) => write!(f, "{object}: {message}", message = self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A phase failed preflight validation. Recorded on the phase result, the
/// phase's objects are not reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseValidationError {
    pub phase: String,
    pub violations: Vec<ObjectViolation>,
}

impl Display for PhaseValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {phase:?} invalid: ", phase = self.phase)?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PhaseValidationError {}

/// A revision failed preflight validation. Recorded on the revision result,
/// no phase is acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionValidationError {
    pub revision: String,
    pub violations: Vec<ObjectViolation>,
}

impl Display for RevisionValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "revision {revision:?} invalid: ",
            revision = self.revision
        )?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RevisionValidationError {}

/// Validates a whole revision before any phase is reconciled.
///
/// `Ok(None)` means the revision is valid. A returned
/// [`RevisionValidationError`] is a verdict, not a failure of the validator;
/// infrastructure errors use the `Err` channel.
#[async_trait]
pub trait RevisionValidator: Send + Sync {
    async fn validate(
        &self,
        revision: &Revision,
    ) -> Result<Option<RevisionValidationError>, kube::Error>;
}

/// Validates a single phase right before its objects are reconciled.
#[async_trait]
pub trait PhaseValidator: Send + Sync {
    async fn validate(&self, phase: &Phase) -> Result<Option<PhaseValidationError>, kube::Error>;
}

/// The static structural checks every revision must pass: unique, legal
/// phase names and complete, unique object declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRevisionValidator;

#[async_trait]
impl RevisionValidator for StaticRevisionValidator {
    async fn validate(
        &self,
        revision: &Revision,
    ) -> Result<Option<RevisionValidationError>, kube::Error> {
        let mut violations = Vec::new();

        let mut phase_names = HashSet::new();
        for phase in &revision.phases {
            if !phase_names.insert(phase.name.as_str()) {
                violations.push(ObjectViolation {
                    object: None,
                    message: format!("duplicate phase name {name:?}", name = phase.name),
                });
            }
            if let Err(errors) = is_rfc_1035_label(&phase.name) {
                violations.push(ObjectViolation {
                    object: None,
                    message: format!(
                        "phase name {name:?}: {errors}",
                        name = phase.name,
                        errors = errors.join(", ")
                    ),
                });
            }
        }

        let mut seen_objects = HashSet::new();
        for phase in &revision.phases {
            for desired in &phase.objects {
                match desired.object_ref() {
                    None => violations.push(ObjectViolation {
                        object: None,
                        message: format!(
                            "object without apiVersion, kind or name in phase {name:?}",
                            name = phase.name
                        ),
                    }),
                    Some(object_ref) => {
                        validate_object_metadata(&object_ref, &mut violations);
                        if !seen_objects.insert(object_ref.clone()) {
                            violations.push(ObjectViolation {
                                object: Some(object_ref),
                                message: "declared more than once in the revision".to_owned(),
                            });
                        }
                    }
                }
            }
        }

        Ok((!violations.is_empty()).then(|| RevisionValidationError {
            revision: revision.name.clone(),
            violations,
        }))
    }
}

/// The static structural checks for one phase: name legality, per-object
/// metadata legality and namespace admissibility under the configured
/// ownership strategy.
#[derive(Clone, Default)]
pub struct StaticPhaseValidator {
    ownership: Option<Arc<dyn RevisionOwnership>>,
}

impl StaticPhaseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, ownership: Arc<dyn RevisionOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }
}

#[async_trait]
impl PhaseValidator for StaticPhaseValidator {
    async fn validate(&self, phase: &Phase) -> Result<Option<PhaseValidationError>, kube::Error> {
        let mut violations = Vec::new();

        if let Err(errors) = is_rfc_1035_label(&phase.name) {
            violations.push(ObjectViolation {
                object: None,
                message: format!("phase name: {errors}", errors = errors.join(", ")),
            });
        }

        for desired in &phase.objects {
            let Some(object_ref) = desired.object_ref() else {
                violations.push(ObjectViolation {
                    object: None,
                    message: "object without apiVersion, kind or name".to_owned(),
                });
                continue;
            };
            validate_object_metadata(&object_ref, &mut violations);
            if let Some(ownership) = &self.ownership
                && !ownership.is_namespace_allowed(&desired.object)
            {
                violations.push(ObjectViolation {
                    object: Some(object_ref),
                    message: format!(
                        "namespace not allowed for owner {owner}",
                        owner = ownership.owner()
                    ),
                });
            }
        }

        Ok((!violations.is_empty()).then(|| PhaseValidationError {
            phase: phase.name.clone(),
            violations,
        }))
    }
}

fn validate_object_metadata(object_ref: &ObjectRef, violations: &mut Vec<ObjectViolation>) {
    if let Err(errors) = is_rfc_1123_subdomain(&object_ref.name) {
        violations.push(ObjectViolation {
            object: Some(object_ref.clone()),
            message: format!("object name: {errors}", errors = errors.join(", ")),
        });
    }
    if let Some(namespace) = &object_ref.namespace
        && let Err(errors) = is_rfc_1123_subdomain(namespace)
    {
        violations.push(ObjectViolation {
            object: Some(object_ref.clone()),
            message: format!("object namespace: {errors}", errors = errors.join(", ")),
        });
    }
}
