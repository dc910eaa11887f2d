use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;

use super::{AlreadyOwnedSnafu, ClaimMode, OwnerIdentity, OwnershipError, RevisionOwnership};

/// Ownership recorded as a native Kubernetes `OwnerReference` with
/// `controller=true`.
///
/// The API server restricts native references to the owner's own namespace
/// (or any namespace for a cluster-scoped owner) and rejects objects with
/// two controller references, which backs the single-controller invariant.
#[derive(Debug, Clone)]
pub struct NativeOwnership {
    owner: OwnerIdentity,
}

impl NativeOwnership {
    /// # Panics
    ///
    /// Panics when the owner has an empty UID. An owner must be persisted
    /// before it can own objects; passing an unpersisted owner is a
    /// programmer error.
    pub fn new(owner: OwnerIdentity) -> Self {
        assert!(
            !owner.uid.is_empty(),
            "owner UID must not be empty, the owner has to be persisted first"
        );
        Self { owner }
    }
}

fn owner_references(object: &DynamicObject) -> &[OwnerReference] {
    object
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
}

fn controller_reference(object: &DynamicObject) -> Option<&OwnerReference> {
    owner_references(object)
        .iter()
        .find(|reference| reference.controller == Some(true))
}

impl RevisionOwnership for NativeOwnership {
    fn owner(&self) -> &OwnerIdentity {
        &self.owner
    }

    fn set_current(
        &self,
        object: &mut DynamicObject,
        mode: ClaimMode,
    ) -> Result<(), OwnershipError> {
        if let Some(current) = controller_reference(object) {
            if !self.owner.matches_reference(current) {
                match mode {
                    ClaimMode::IfUnowned => {
                        return AlreadyOwnedSnafu {
                            owner: Box::new(identity_of(object, current)),
                        }
                        .fail();
                    }
                    ClaimMode::Takeover => {}
                }
            }
        }

        let references = object
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new);
        let mut found = false;
        for reference in references.iter_mut() {
            if reference.uid == self.owner.uid {
                *reference = self.owner.to_owner_reference(true);
                found = true;
            } else if reference.controller == Some(true) {
                // Demote whoever held the controller flag before.
                reference.controller = Some(false);
            }
        }
        if !found {
            references.push(self.owner.to_owner_reference(true));
        }
        Ok(())
    }

    fn is_current(&self, object: &DynamicObject) -> bool {
        controller_reference(object)
            .is_some_and(|reference| self.owner.matches_reference(reference))
    }

    fn controller_of(&self, object: &DynamicObject) -> Option<OwnerIdentity> {
        controller_reference(object).map(|reference| identity_of(object, reference))
    }

    fn copy_released(
        &self,
        from: &DynamicObject,
        to: &mut DynamicObject,
    ) -> Result<(), OwnershipError> {
        let existing = to.metadata.owner_references.get_or_insert_with(Vec::new);
        for reference in owner_references(from) {
            if existing.iter().any(|known| known.uid == reference.uid) {
                continue;
            }
            let mut released = reference.clone();
            released.controller = Some(false);
            existing.push(released);
        }
        Ok(())
    }

    fn remove(&self, object: &mut DynamicObject) {
        if let Some(references) = object.metadata.owner_references.as_mut() {
            references.retain(|reference| reference.uid != self.owner.uid);
            if references.is_empty() {
                object.metadata.owner_references = None;
            }
        }
    }

    fn is_namespace_allowed(&self, object: &DynamicObject) -> bool {
        match &self.owner.namespace {
            // A cluster-scoped owner may own objects anywhere.
            None => true,
            Some(owner_namespace) => object
                .metadata
                .namespace
                .as_ref()
                .is_some_and(|namespace| namespace == owner_namespace),
        }
    }
}

/// A native reference does not carry a namespace, owned objects live in the
/// owner's namespace by definition.
fn identity_of(object: &DynamicObject, reference: &OwnerReference) -> OwnerIdentity {
    OwnerIdentity {
        api_version: reference.api_version.clone(),
        kind: reference.kind.clone(),
        name: reference.name.clone(),
        namespace: object.metadata.namespace.clone(),
        uid: reference.uid.clone(),
    }
}
