//! The declarative input model: revisions, phases and the objects within.

use std::fmt::{self, Display};

use kube::core::{DynamicObject, GroupVersionKind};

use crate::engine::ReconcileOptions;

/// The identity of an API object.
///
/// Orders by the full `(group, version, kind, namespace, name)` tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Returns `None` when the object carries no type information or name.
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group.to_owned(), version.to_owned()),
            None => (String::new(), types.api_version.clone()),
        };
        Some(Self {
            group,
            version,
            kind: types.kind.clone(),
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone()?,
        })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        write!(f, "{}/{} ", self.version, self.kind)?;
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.name)
    }
}

/// A declared object state together with its per-object reconcile options.
#[derive(Clone)]
pub struct DesiredObject {
    pub object: DynamicObject,
    pub options: ReconcileOptions,
}

impl DesiredObject {
    pub fn new(object: DynamicObject) -> Self {
        Self {
            object,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(object: DynamicObject, options: ReconcileOptions) -> Self {
        Self { object, options }
    }

    pub fn object_ref(&self) -> Option<ObjectRef> {
        ObjectRef::from_object(&self.object)
    }
}

impl fmt::Debug for DesiredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredObject")
            .field("object", &self.object)
            .field("options", &self.options)
            .finish()
    }
}

/// An ordered subset of a revision's objects that must converge before the
/// next phase begins. The name must be a DNS-1035 label.
#[derive(Debug, Clone, Default)]
pub struct Phase {
    pub name: String,
    pub objects: Vec<DesiredObject>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: DynamicObject) -> Self {
        self.objects.push(DesiredObject::new(object));
        self
    }
}

/// A complete desired declaration of an owner's managed objects at a point
/// in time.
///
/// The revision number linearizes rollouts: older revisions must not
/// overwrite newer ones. Phase names must be unique and every object must be
/// unique across the whole revision; both are enforced by the revision
/// validator before any phase is acted on.
#[derive(Debug, Clone, Default)]
pub struct Revision {
    pub name: String,
    /// Must be ≥ 1. Enforced by panic in the engines, a zero revision is a
    /// programmer error.
    pub revision: i64,
    pub phases: Vec<Phase>,
}

impl Revision {
    pub fn new(name: impl Into<String>, revision: i64) -> Self {
        Self {
            name: name.into(),
            revision,
            phases: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|phase| phase.name.clone()).collect()
    }
}
