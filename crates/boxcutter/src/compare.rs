//! Managed-field divergence analysis.
//!
//! The comparator decides whether a desired object has diverged from the
//! live object from the engine's point of view, and attributes every
//! divergent field to the field manager that last wrote it. It consumes the
//! `metadata.managedFields` bookkeeping the API server maintains for
//! server-side apply and never forges entries of its own.

use std::{collections::BTreeMap, fmt, sync::Arc};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::fieldset::{FieldSet, FieldsV1Error, ListKeys, PathElement};

/// The managed-fields operation recorded for server-side apply writes.
const OPERATION_APPLY: &str = "Apply";
/// The operation recorded for POST/PUT writes, absorbed by the
/// managed-field migration.
pub(crate) const OPERATION_UPDATE: &str = "Update";

#[derive(Debug, Snafu)]
pub enum SchemaError {
    #[snafu(display("no schema available for {group}/{version} {kind}"))]
    Unavailable {
        group: String,
        version: String,
        kind: String,
    },
}

/// Supplies the extraction schema for a group/version/kind.
///
/// Production implementations read the cluster's OpenAPI documents; the
/// shipped [`DeducedSchema`] needs no cluster access and matches the
/// deduced type server-side apply falls back to for unknown kinds.
pub trait SchemaResolver: Send + Sync {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ObjectSchema, SchemaError>;
}

/// The per-kind knowledge field-set extraction needs: which lists merge by
/// key fields. Everything else is derived from the document itself.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    pub list_keys: ListKeys,
}

/// Maps granular, lists atomic, no associative keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeducedSchema;

impl SchemaResolver for DeducedSchema {
    fn resolve(&self, _gvk: &GroupVersionKind) -> Result<ObjectSchema, SchemaError> {
        Ok(ObjectSchema::default())
    }
}

#[derive(Debug, Snafu)]
pub enum CompareError {
    #[snafu(display("failed to resolve schema for {group}/{version} {kind}"))]
    ResolveSchema {
        source: SchemaError,
        group: String,
        version: String,
        kind: String,
    },

    #[snafu(display("failed to parse managed fields of manager {manager:?}"))]
    ParseManagedFields {
        source: FieldsV1Error,
        manager: String,
    },

    #[snafu(display("failed to serialize object for comparison"))]
    SerializeObject { source: serde_json::Error },
}

/// Fields another manager owns that this engine wants to claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConflict {
    pub manager: String,
    pub fields: FieldSet,
}

/// Leaf-level structural divergence between desired and live state,
/// restricted to the fields the desired object declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub added: FieldSet,
    pub modified: FieldSet,
    pub removed: FieldSet,
}

impl Comparison {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareResult {
    /// Managers owning fields we want, sorted by manager name.
    pub conflicting_managers: Vec<ManagerConflict>,
    /// `None` when the live object carries no managed-fields entry of ours
    /// at all, i.e. it is fully externally managed.
    pub comparison: Option<Comparison>,
}

impl CompareResult {
    pub fn is_conflict(&self) -> bool {
        !self.conflicting_managers.is_empty()
    }

    pub fn is_modified(&self) -> bool {
        self.comparison
            .as_ref()
            .is_some_and(|comparison| !comparison.is_empty())
    }
}

impl fmt::Display for CompareResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflicting_managers.is_empty() {
            write!(f, "no conflicts")?;
        } else {
            write!(f, "conflicting managers: ")?;
            for (i, conflict) in self.conflicting_managers.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", conflict.manager)?;
            }
        }
        match &self.comparison {
            None => write!(f, "; not managed by us"),
            Some(comparison) if comparison.is_empty() => write!(f, "; in sync"),
            Some(comparison) => write!(
                f,
                "; diverged (+{added} ~{modified} -{removed})",
                added = comparison.added.leaf_count(),
                modified = comparison.modified.leaf_count(),
                removed = comparison.removed.leaf_count(),
            ),
        }
    }
}

/// Decides divergence and conflict attribution for one desired/live pair.
#[derive(Clone)]
pub struct Comparator {
    schema: Arc<dyn SchemaResolver>,
    field_manager: String,
}

impl Comparator {
    pub fn new(schema: Arc<dyn SchemaResolver>, field_manager: impl Into<String>) -> Self {
        Self {
            schema,
            field_manager: field_manager.into(),
        }
    }

    /// # Panics
    ///
    /// Panics when desired and actual do not share a GVK; passing objects of
    /// different kinds is a programmer error.
    pub fn compare(
        &self,
        desired: &DynamicObject,
        actual: &DynamicObject,
    ) -> Result<CompareResult, CompareError> {
        let gvk = gvk_of(desired);
        assert_eq!(
            gvk,
            gvk_of(actual),
            "desired and actual objects must share a group/version/kind"
        );

        let schema = self
            .schema
            .resolve(&gvk)
            .with_context(|_| ResolveSchemaSnafu {
                group: gvk.group.clone(),
                version: gvk.version.clone(),
                kind: gvk.kind.clone(),
            })?;

        let desired_doc = serde_json::to_value(desired).context(SerializeObjectSnafu)?;
        let actual_doc = serde_json::to_value(actual).context(SerializeObjectSnafu)?;
        let desired_set = FieldSet::extract(&desired_doc, &schema.list_keys);

        let Some(owned) = self.owned_field_set(actual)? else {
            // Not a single field on the live object is ours. Report every
            // other manager with an empty conflicting-path set.
            let mut managers: Vec<String> = managed_entries(actual)
                .iter()
                .filter_map(|entry| entry.manager.clone())
                .filter(|manager| *manager != self.field_manager)
                .collect();
            managers.sort();
            managers.dedup();
            return Ok(CompareResult {
                conflicting_managers: managers
                    .into_iter()
                    .map(|manager| ManagerConflict {
                        manager,
                        fields: FieldSet::new(),
                    })
                    .collect(),
                comparison: None,
            });
        };

        let diff = desired_set.difference(&owned).difference(&strip_set());
        let conflicting_managers = self.conflicting_managers(actual, &diff)?;
        let comparison = structural_comparison(&desired_set, &desired_doc, &actual_doc);

        Ok(CompareResult {
            conflicting_managers,
            comparison: Some(comparison),
        })
    }

    /// The managed-fields entry this engine owns on the live object,
    /// selected by `(manager, operation=Apply)`. Entry position is never
    /// consulted.
    fn owned_field_set(&self, actual: &DynamicObject) -> Result<Option<FieldSet>, CompareError> {
        let mut owned: Option<FieldSet> = None;
        for entry in managed_entries(actual) {
            if entry.manager.as_deref() != Some(self.field_manager.as_str())
                || entry.operation.as_deref() != Some(OPERATION_APPLY)
            {
                continue;
            }
            let set = field_set_of(entry).with_context(|_| ParseManagedFieldsSnafu {
                manager: self.field_manager.clone(),
            })?;
            owned = Some(match owned {
                Some(existing) => existing.union(&set),
                None => set,
            });
        }
        Ok(owned)
    }

    fn conflicting_managers(
        &self,
        actual: &DynamicObject,
        diff: &FieldSet,
    ) -> Result<Vec<ManagerConflict>, CompareError> {
        let mut by_manager: BTreeMap<String, FieldSet> = BTreeMap::new();
        for entry in managed_entries(actual) {
            let Some(manager) = entry.manager.as_deref() else {
                continue;
            };
            if manager == self.field_manager {
                continue;
            }
            let set = field_set_of(entry).with_context(|_| ParseManagedFieldsSnafu {
                manager: manager.to_owned(),
            })?;
            let overlap = set.intersection(diff);
            if overlap.is_empty() {
                continue;
            }
            let merged = match by_manager.get(manager) {
                Some(existing) => existing.union(&overlap),
                None => overlap,
            };
            by_manager.insert(manager.to_owned(), merged);
        }
        Ok(by_manager
            .into_iter()
            .map(|(manager, fields)| ManagerConflict { manager, fields })
            .collect())
    }
}

fn gvk_of(object: &DynamicObject) -> GroupVersionKind {
    let types = object.types.clone().unwrap_or_default();
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group.to_owned(), version.to_owned()),
        None => (String::new(), types.api_version),
    };
    GroupVersionKind::gvk(&group, &version, &types.kind)
}

fn managed_entries(object: &DynamicObject) -> &[ManagedFieldsEntry] {
    object
        .metadata
        .managed_fields
        .as_deref()
        .unwrap_or_default()
}

fn field_set_of(entry: &ManagedFieldsEntry) -> Result<FieldSet, FieldsV1Error> {
    match &entry.fields_v1 {
        Some(fields_v1) => FieldSet::from_fields_v1(&fields_v1.0),
        None => Ok(FieldSet::new()),
    }
}

/// Identity and server-filled leaves excluded from divergence attribution.
fn strip_set() -> FieldSet {
    let mut set = FieldSet::new();
    set.insert(&[PathElement::field("apiVersion")]);
    set.insert(&[PathElement::field("kind")]);
    for leaf in [
        "name",
        "namespace",
        "uid",
        "resourceVersion",
        "generation",
        "creationTimestamp",
        "managedFields",
        "selfLink",
        "clusterName",
    ] {
        set.insert(&[PathElement::field("metadata"), PathElement::field(leaf)]);
    }
    set
}

fn structural_comparison(
    desired_set: &FieldSet,
    desired_doc: &Value,
    actual_doc: &Value,
) -> Comparison {
    let strip = strip_set();
    let mut comparison = Comparison::default();
    for path in desired_set.leaves() {
        if strip.contains(&path.0) {
            continue;
        }
        let desired_value = crate::fieldset::lookup(desired_doc, &path);
        // Nil leaves are an extraction quirk, not real state.
        let actual_value =
            crate::fieldset::lookup(actual_doc, &path).filter(|value| !value.is_null());
        match (desired_value, actual_value) {
            (Some(desired_value), Some(actual_value)) if desired_value != actual_value => {
                comparison.modified.insert(&path.0);
            }
            (Some(_), None) => {
                comparison.added.insert(&path.0);
            }
            (None, Some(_)) => {
                comparison.removed.insert(&path.0);
            }
            _ => {}
        }
    }
    comparison
}
