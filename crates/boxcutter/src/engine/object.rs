//! The object engine: brings one object to its desired state with collision
//! protection, revision linearity, conflict recovery and safe deletion.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::{
    api::Preconditions,
    core::DynamicObject,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info};

use super::{CollisionProtection, ObjectResult, ReconcileOptions, TeardownOptions};
use crate::{
    client::{Reader, Writer, is_already_exists, is_not_found},
    compare::{CompareError, CompareResult, Comparator, OPERATION_UPDATE, SchemaResolver},
    constants::{MANAGED_LABEL, MANAGED_LABEL_VALUE, REVISION_ANNOTATION},
    ownership::{ClaimMode, OwnerIdentity, OwnershipError},
    probe::{ProbeResults, Prober},
    revision::ObjectRef,
};

#[derive(Debug, Snafu)]
pub enum ObjectEngineError {
    #[snafu(display("desired object has no type information or name"))]
    IncompleteObject,

    #[snafu(display("failed to set ownership on desired object"))]
    SetOwnership { source: OwnershipError },

    #[snafu(display("failed getting object"))]
    GetObject { source: kube::Error },

    #[snafu(display("failed creating object"))]
    CreateObject { source: kube::Error },

    #[snafu(display("failed applying object"))]
    ApplyObject { source: kube::Error },

    #[snafu(display("failed updating object"))]
    UpdateObject { source: kube::Error },

    #[snafu(display("failed deleting object"))]
    DeleteObject { source: kube::Error },

    #[snafu(display("failed migrating managed fields to apply operation"))]
    MigrateManagedFields { source: kube::Error },

    #[snafu(display("failed building managed-field migration patch"))]
    BuildMigrationPatch { source: serde_json::Error },

    #[snafu(display("failed to parse revision annotation {value:?}"))]
    ParseRevisionAnnotation {
        source: std::num::ParseIntError,
        value: String,
    },

    #[snafu(display("diverge check"))]
    DivergeCheck { source: CompareError },
}

/// The ownership situation of a live object, as seen by one reconciling
/// revision.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Situation {
    /// This revision controls the object.
    IsController,
    /// A declared previous owner controls the object and may surrender it.
    PreviousIsController,
    /// Some other identity controls the object, or it carries the
    /// managed-by label without a resolvable controller.
    UnknownController(Option<OwnerIdentity>),
    /// Nobody controls the object.
    NoController,
}

/// Reconciles and tears down single objects.
///
/// Reads go through a (possibly cache-backed) [`Reader`]; the uncached
/// reader is only consulted after an AlreadyExists surprise on create, when
/// the cache is known to lag. All writes use server-side apply under the
/// configured field manager, except the initial POST and the final DELETE.
#[derive(Clone)]
pub struct ObjectEngine {
    comparator: Comparator,
    field_manager: String,
    reader: Arc<dyn Reader>,
    uncached_reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
}

impl ObjectEngine {
    pub fn new(
        schema: Arc<dyn SchemaResolver>,
        reader: Arc<dyn Reader>,
        uncached_reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        field_manager: impl Into<String>,
    ) -> Self {
        let field_manager = field_manager.into();
        Self {
            comparator: Comparator::new(schema, field_manager.clone()),
            field_manager,
            reader,
            uncached_reader,
            writer,
        }
    }

    /// Brings one object to its desired state.
    ///
    /// # Panics
    ///
    /// Panics when `revision` is zero; revision numbers start at 1 and a
    /// zero revision is a programmer error.
    pub async fn reconcile(
        &self,
        revision: i64,
        desired: &DynamicObject,
        options: &ReconcileOptions,
    ) -> Result<ObjectResult, ObjectEngineError> {
        assert!(revision >= 1, "revision number must be 1 or higher");

        let mut desired = desired.clone();
        stamp(&mut desired, revision);
        if let Some(ownership) = &options.ownership {
            ownership
                .set_current(&mut desired, ClaimMode::IfUnowned)
                .context(SetOwnershipSnafu)?;
        }
        let object_ref = ObjectRef::from_object(&desired).context(IncompleteObjectSnafu)?;

        let live = match self.reader.get(&object_ref).await {
            Ok(live) => live,
            Err(error) if is_not_found(&error) => {
                match self.create(&object_ref, &desired, options).await? {
                    CreateOutcome::Done(result) => return Ok(result),
                    // The cache lagged, continue on the freshly read object.
                    CreateOutcome::AlreadyExists(live) => live,
                }
            }
            Err(error) => return Err(error).context(GetObjectSnafu),
        };

        let compare = self
            .comparator
            .compare(&desired, &live)
            .context(DivergeCheckSnafu)?;

        // Revision linearity: never overwrite a newer revision.
        let live_revision = revision_annotation(&live)?;
        if live_revision > revision {
            debug!(
                object = %object_ref,
                revision,
                live_revision,
                "a newer revision controls the object, standing down"
            );
            let probes = run_probes(&options.probes, &live);
            return Ok(ObjectResult::progressed(live, probes));
        }

        let situation = detect_situation(options, &live);
        debug!(object = %object_ref, revision, ?situation, %compare, "decided object action");

        match situation {
            Situation::IsController => {
                if compare.is_conflict() {
                    info!(
                        object = %object_ref,
                        revision,
                        %compare,
                        "recovering fields from conflicting managers"
                    );
                    return self
                        .recover(&object_ref, &desired, &live, options, compare)
                        .await;
                }
                let in_sync = compare
                    .comparison
                    .as_ref()
                    .is_some_and(crate::compare::Comparison::is_empty);
                if in_sync {
                    let probes = run_probes(&options.probes, &live);
                    return Ok(ObjectResult::idle(live, probes, compare));
                }
                self.update(&object_ref, &desired, &live, options, compare, false)
                    .await
            }
            Situation::PreviousIsController => {
                let ownership = options
                    .ownership
                    .as_ref()
                    .unwrap_or_else(|| unreachable!("previous owners imply an owner"));
                ownership
                    .copy_released(&live, &mut desired)
                    .context(SetOwnershipSnafu)?;
                ownership
                    .set_current(&mut desired, ClaimMode::Takeover)
                    .context(SetOwnershipSnafu)?;
                info!(object = %object_ref, revision, "taking over from previous owner");
                self.update(&object_ref, &desired, &live, options, compare, true)
                    .await
            }
            Situation::UnknownController(owner) => {
                if options.collision_protection == CollisionProtection::None {
                    if let Some(ownership) = &options.ownership {
                        ownership
                            .set_current(&mut desired, ClaimMode::Takeover)
                            .context(SetOwnershipSnafu)?;
                    }
                    info!(object = %object_ref, revision, "taking over foreign object, collision protection is off");
                    return self
                        .update(&object_ref, &desired, &live, options, compare, true)
                        .await;
                }
                debug!(object = %object_ref, revision, "collision with foreign controller");
                Ok(ObjectResult::collision(live, owner))
            }
            Situation::NoController => match options.collision_protection {
                CollisionProtection::Prevent => {
                    debug!(object = %object_ref, revision, "unowned object, collision protection prevents adoption");
                    Ok(ObjectResult::collision(live, None))
                }
                CollisionProtection::IfNoController | CollisionProtection::None => {
                    info!(object = %object_ref, revision, "adopting unowned object");
                    self.update(&object_ref, &desired, &live, options, compare, true)
                        .await
                }
            },
        }
    }

    /// Removes one object, or this revision's traces on it.
    ///
    /// Returns `true` once the object is confirmed gone (or was never ours
    /// to delete); `false` while a delete has been issued but finalizers
    /// keep the object around. Callers re-invoke until `true`.
    ///
    /// # Panics
    ///
    /// Panics when `revision` is zero, see [`Self::reconcile`].
    pub async fn teardown(
        &self,
        revision: i64,
        desired: &DynamicObject,
        options: &TeardownOptions,
    ) -> Result<bool, ObjectEngineError> {
        assert!(revision >= 1, "revision number must be 1 or higher");

        let object_ref = ObjectRef::from_object(desired).context(IncompleteObjectSnafu)?;
        let live = match self.reader.get(&object_ref).await {
            Ok(live) => live,
            // Object or its whole kind is gone, nothing to do.
            Err(error) if is_not_found(&error) => return Ok(true),
            Err(error) => return Err(error).context(GetObjectSnafu),
        };

        let live_revision = revision_annotation(&live)?;
        let ours = match &options.ownership {
            Some(ownership) => ownership.is_current(&live),
            None => has_managed_label(&live),
        };
        if live_revision != revision || !ours {
            debug!(
                object = %object_ref,
                revision,
                live_revision,
                "object belongs to another revision, detaching instead of deleting"
            );
            self.detach(&live, live_revision <= revision, options)
                .await?;
            return Ok(true);
        }

        if options.orphan {
            info!(object = %object_ref, revision, "orphaning object");
            self.detach(&live, true, options).await?;
            return Ok(true);
        }

        let writer = options
            .teardown_writer
            .clone()
            .unwrap_or_else(|| self.writer.clone());
        let preconditions = Preconditions {
            uid: live.metadata.uid.clone(),
            resource_version: live.metadata.resource_version.clone(),
        };
        match writer.delete(&object_ref, preconditions).await {
            Ok(()) => {
                info!(object = %object_ref, revision, "deleted object, waiting for it to go away");
                Ok(false)
            }
            Err(error) if is_not_found(&error) => Ok(true),
            Err(error) => Err(error).context(DeleteObjectSnafu),
        }
    }

    async fn create(
        &self,
        object_ref: &ObjectRef,
        desired: &DynamicObject,
        options: &ReconcileOptions,
    ) -> Result<CreateOutcome, ObjectEngineError> {
        if options.paused {
            debug!(object = %object_ref, "paused, reporting creation without writing");
            let probes = run_probes(&options.probes, desired);
            return Ok(CreateOutcome::Done(ObjectResult::created(
                desired.clone(),
                probes,
            )));
        }

        match self.writer.create(desired).await {
            Ok(created) => {
                info!(object = %object_ref, "created object");
                // A POST records our manager with an Update operation,
                // absorb it into the Apply entry right away.
                self.migrate_managed_fields(object_ref, &created).await?;
                let probes = run_probes(&options.probes, &created);
                Ok(CreateOutcome::Done(ObjectResult::created(created, probes)))
            }
            Err(error) if is_already_exists(&error) => {
                let live = self
                    .uncached_reader
                    .get(object_ref)
                    .await
                    .context(GetObjectSnafu)?;
                Ok(CreateOutcome::AlreadyExists(live))
            }
            Err(error) => Err(error).context(CreateObjectSnafu),
        }
    }

    async fn update(
        &self,
        object_ref: &ObjectRef,
        desired: &DynamicObject,
        live: &DynamicObject,
        options: &ReconcileOptions,
        compare: CompareResult,
        force: bool,
    ) -> Result<ObjectResult, ObjectEngineError> {
        if options.paused {
            debug!(object = %object_ref, "paused, reporting update without writing");
            let probes = run_probes(&options.probes, desired);
            return Ok(ObjectResult::updated(desired.clone(), probes, compare));
        }

        self.migrate_managed_fields(object_ref, live).await?;
        let applied = self
            .writer
            .apply(&self.field_manager, force, desired)
            .await
            .context(ApplyObjectSnafu)?;
        let probes = run_probes(&options.probes, &applied);
        Ok(ObjectResult::updated(applied, probes, compare))
    }

    async fn recover(
        &self,
        object_ref: &ObjectRef,
        desired: &DynamicObject,
        live: &DynamicObject,
        options: &ReconcileOptions,
        compare: CompareResult,
    ) -> Result<ObjectResult, ObjectEngineError> {
        // The forced apply may not be reflected on the cluster yet when
        // this result is assembled, probe the desired state instead.
        let probes = run_probes(&options.probes, desired);
        if options.paused {
            debug!(object = %object_ref, "paused, reporting recovery without writing");
            return Ok(ObjectResult::recovered(live.clone(), probes, compare));
        }

        self.migrate_managed_fields(object_ref, live).await?;
        let applied = self
            .writer
            .apply(&self.field_manager, true, desired)
            .await
            .context(ApplyObjectSnafu)?;
        Ok(ObjectResult::recovered(applied, probes, compare))
    }

    /// Converts stale `Update`-operation managed-field entries under our
    /// field-manager name into `Apply`-operation entries, so fields written
    /// through POST or PUT are absorbed losslessly into the apply set.
    /// Idempotent; a no-op when no such entry exists.
    async fn migrate_managed_fields(
        &self,
        object_ref: &ObjectRef,
        live: &DynamicObject,
    ) -> Result<(), ObjectEngineError> {
        let stale: Vec<usize> = managed_entries(live)
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.manager.as_deref() == Some(self.field_manager.as_str())
                    && entry.operation.as_deref() == Some(OPERATION_UPDATE)
            })
            .map(|(index, _)| index)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let operations: Vec<serde_json::Value> = stale
            .into_iter()
            .map(|index| {
                serde_json::json!({
                    "op": "replace",
                    "path": format!("/metadata/managedFields/{index}/operation"),
                    "value": "Apply",
                })
            })
            .collect();
        let patch: json_patch::Patch =
            serde_json::from_value(serde_json::Value::Array(operations))
                .context(BuildMigrationPatchSnafu)?;

        debug!(object = %object_ref, "migrating legacy managed-field entries to apply");
        self.writer
            .patch_json(object_ref, patch)
            .await
            .context(MigrateManagedFieldsSnafu)?;
        Ok(())
    }

    /// Scrubs this revision's traces from a live object and persists the
    /// result. The revision stamp is only removed when no newer revision
    /// has claimed the object since.
    async fn detach(
        &self,
        live: &DynamicObject,
        remove_stamp: bool,
        options: &TeardownOptions,
    ) -> Result<(), ObjectEngineError> {
        let mut scrubbed = live.clone();
        if let Some(ownership) = &options.ownership {
            ownership.remove(&mut scrubbed);
        }
        if remove_stamp {
            if let Some(annotations) = scrubbed.metadata.annotations.as_mut() {
                annotations.remove(REVISION_ANNOTATION);
                if annotations.is_empty() {
                    scrubbed.metadata.annotations = None;
                }
            }
            if let Some(labels) = scrubbed.metadata.labels.as_mut() {
                labels.remove(MANAGED_LABEL);
                if labels.is_empty() {
                    scrubbed.metadata.labels = None;
                }
            }
        }
        if scrubbed == *live {
            return Ok(());
        }
        self.writer
            .update(&scrubbed)
            .await
            .context(UpdateObjectSnafu)?;
        Ok(())
    }
}

enum CreateOutcome {
    Done(ObjectResult),
    AlreadyExists(DynamicObject),
}

/// Stamps the revision annotation and managed-by label on a desired copy.
fn stamp(desired: &mut DynamicObject, revision: i64) {
    desired
        .metadata
        .annotations
        .get_or_insert_default()
        .insert(REVISION_ANNOTATION.to_owned(), revision.to_string());
    desired
        .metadata
        .labels
        .get_or_insert_default()
        .insert(MANAGED_LABEL.to_owned(), MANAGED_LABEL_VALUE.to_owned());
}

/// The revision recorded on a live object; objects never touched by the
/// engine read as revision 0.
fn revision_annotation(live: &DynamicObject) -> Result<i64, ObjectEngineError> {
    let Some(value) = live
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
    else {
        return Ok(0);
    };
    value
        .parse()
        .context(ParseRevisionAnnotationSnafu { value: value.clone() })
}

fn has_managed_label(live: &DynamicObject) -> bool {
    live.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_LABEL))
        .is_some_and(|value| value == MANAGED_LABEL_VALUE)
}

fn managed_entries(live: &DynamicObject) -> &[ManagedFieldsEntry] {
    live.metadata.managed_fields.as_deref().unwrap_or_default()
}

fn detect_situation(options: &ReconcileOptions, live: &DynamicObject) -> Situation {
    let Some(ownership) = &options.ownership else {
        // Without an owner identity one engine instance cannot be told from
        // another, the managed-by label is all there is to go on.
        return if has_managed_label(live) {
            Situation::IsController
        } else {
            Situation::NoController
        };
    };

    match ownership.controller_of(live) {
        Some(_) if ownership.is_current(live) => Situation::IsController,
        Some(controller) => {
            if options
                .previous_owners
                .iter()
                .any(|previous| previous.matches(&controller))
            {
                Situation::PreviousIsController
            } else {
                Situation::UnknownController(Some(controller))
            }
        }
        // Produced by some engine instance but not owned by anyone we can
        // resolve, e.g. a cross-namespace object of an annotation owner.
        None if has_managed_label(live) => Situation::UnknownController(None),
        None => Situation::NoController,
    }
}

fn run_probes(probes: &[(String, Arc<dyn Prober>)], object: &DynamicObject) -> ProbeResults {
    let mut results = ProbeResults::new();
    for (name, prober) in probes {
        results.insert(name.clone(), prober.probe(object));
    }
    results
}
