//! Revision metadata strategies.
//!
//! A strategy records which revision controls an object and answers the
//! ownership questions the object engine asks: mark this revision as the
//! current controller, check whether it is, enumerate the present
//! controller, copy prior references while releasing their controller flag,
//! and remove all marks again on teardown.
//!
//! Two representations exist: the native Kubernetes `OwnerReference`
//! (restricted to same-namespace objects by the API server) and a JSON list
//! under a well-known annotation for owners a native reference cannot
//! express. At most one reference holds `controller=true` at any instant.

use std::fmt::{self, Debug, Display};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

mod annotation;
mod native;

pub use annotation::AnnotationOwnership;
pub use native::NativeOwnership;

#[derive(Debug, Snafu)]
pub enum OwnershipError {
    #[snafu(display("object is already owned by another controller: {owner}"))]
    AlreadyOwned { owner: Box<OwnerIdentity> },

    #[snafu(display("failed to decode the owner-references annotation"))]
    DecodeOwners { source: serde_json::Error },
}

impl OwnershipError {
    pub fn is_already_owned(&self) -> bool {
        matches!(self, Self::AlreadyOwned { .. })
    }
}

/// How [`RevisionOwnership::set_current`] treats an existing controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Fail with [`OwnershipError::AlreadyOwned`] when a different
    /// controller reference is present.
    IfUnowned,
    /// Demote an existing controller reference and take over.
    Takeover,
}

/// The identity of an owning revision object.
///
/// Two identities refer to the same owner when group, kind, name and uid
/// match; the version is deliberately ignored so that an owner surviving an
/// apiVersion bump keeps its objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub uid: String,
}

impl OwnerIdentity {
    /// Builds the identity of a live object. Returns `None` when the object
    /// carries no type information or has not been persisted yet.
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        let uid = object.metadata.uid.clone()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name: object.metadata.name.clone()?,
            namespace: object.metadata.namespace.clone(),
            uid,
        })
    }

    /// The group part of `apiVersion`, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
    }

    /// Identity match by group, kind, name and uid. Version is ignored.
    pub fn matches(&self, other: &Self) -> bool {
        self.group() == other.group()
            && self.kind == other.kind
            && self.name == other.name
            && self.uid == other.uid
    }

    pub(crate) fn matches_reference(&self, reference: &OwnerReference) -> bool {
        let group = reference
            .api_version
            .split_once('/')
            .map_or("", |(group, _)| group);
        self.group() == group
            && self.kind == reference.kind
            && self.name == reference.name
            && self.uid == reference.uid
    }

    pub(crate) fn to_owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }
}

impl Display for OwnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{api_version}/{kind} {name} ({uid})",
            api_version = self.api_version,
            kind = self.kind,
            name = self.name,
            uid = self.uid,
        )
    }
}

/// The capability set shared by all revision metadata strategies.
pub trait RevisionOwnership: Debug + Send + Sync {
    /// The identity this strategy marks objects with.
    fn owner(&self) -> &OwnerIdentity;

    /// Records this revision as the controlling owner of `object`.
    fn set_current(&self, object: &mut DynamicObject, mode: ClaimMode)
    -> Result<(), OwnershipError>;

    /// Whether this revision currently controls `object`.
    fn is_current(&self, object: &DynamicObject) -> bool;

    /// The identity holding `controller=true` on `object`, whoever it is.
    fn controller_of(&self, object: &DynamicObject) -> Option<OwnerIdentity>;

    /// Copies the owner references of `from` onto `to`, releasing their
    /// controller flag. Used when taking over from a permitted previous
    /// owner so the prior reference survives as a plain owner.
    fn copy_released(&self, from: &DynamicObject, to: &mut DynamicObject)
    -> Result<(), OwnershipError>;

    /// Removes every mark this revision holds on `object`.
    fn remove(&self, object: &mut DynamicObject);

    /// Whether this strategy may own an object in the given namespace.
    fn is_namespace_allowed(&self, object: &DynamicObject) -> bool;
}
