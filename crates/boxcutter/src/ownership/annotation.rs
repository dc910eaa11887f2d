use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::warn;

use super::{
    AlreadyOwnedSnafu, ClaimMode, DecodeOwnersSnafu, OwnerIdentity, OwnershipError,
    RevisionOwnership,
};
use crate::constants::OWNERS_ANNOTATION;

/// Ownership recorded as a JSON list under the owner-references annotation.
///
/// Unlike a native `OwnerReference` this representation is not checked by
/// the API server, so it can express cross-namespace and cross-cluster
/// owners. The single-controller invariant is enforced by this strategy on
/// every write instead.
#[derive(Debug, Clone)]
pub struct AnnotationOwnership {
    owner: OwnerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotatedReference {
    #[serde(flatten)]
    identity: OwnerIdentity,
    #[serde(default)]
    controller: bool,
}

impl AnnotationOwnership {
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

    fn decode(object: &DynamicObject) -> Result<Vec<AnnotatedReference>, OwnershipError> {
        let Some(raw) = object
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(OWNERS_ANNOTATION))
        else {
            return Ok(Vec::new());
        };
        serde_json::from_str(raw).context(DecodeOwnersSnafu)
    }

    /// Like [`Self::decode`], for read paths that cannot surface an error.
    /// A malformed annotation reads as "no owners recorded".
    fn decode_lossy(object: &DynamicObject) -> Vec<AnnotatedReference> {
        Self::decode(object).unwrap_or_else(|error| {
            warn!(
                object.name = object.metadata.name.as_deref().unwrap_or_default(),
                error = &error as &dyn std::error::Error,
                "Ignoring malformed owner-references annotation"
            );
            Vec::new()
        })
    }

    fn encode(object: &mut DynamicObject, references: &[AnnotatedReference]) {
        if references.is_empty() {
            if let Some(annotations) = object.metadata.annotations.as_mut() {
                annotations.remove(OWNERS_ANNOTATION);
            }
            return;
        }
        let raw = serde_json::to_string(references)
            .unwrap_or_else(|_| unreachable!("owner references always serialize"));
        object
            .metadata
            .annotations
            .get_or_insert_default()
            .insert(OWNERS_ANNOTATION.to_owned(), raw);
    }
}

impl RevisionOwnership for AnnotationOwnership {
    fn owner(&self) -> &OwnerIdentity {
        &self.owner
    }

    fn set_current(
        &self,
        object: &mut DynamicObject,
        mode: ClaimMode,
    ) -> Result<(), OwnershipError> {
        let mut references = Self::decode(object)?;

        if let Some(current) = references
            .iter()
            .find(|reference| reference.controller)
            && !self.owner.matches(&current.identity)
            && mode == ClaimMode::IfUnowned
        {
            return AlreadyOwnedSnafu {
                owner: Box::new(current.identity.clone()),
            }
            .fail();
        }

        let mut found = false;
        for reference in &mut references {
            if reference.identity.uid == self.owner.uid {
                reference.identity = self.owner.clone();
                reference.controller = true;
                found = true;
            } else if reference.controller {
                reference.controller = false;
            }
        }
        if !found {
            references.push(AnnotatedReference {
                identity: self.owner.clone(),
                controller: true,
            });
        }

        Self::encode(object, &references);
        Ok(())
    }

    fn is_current(&self, object: &DynamicObject) -> bool {
        Self::decode_lossy(object)
            .iter()
            .any(|reference| reference.controller && self.owner.matches(&reference.identity))
    }

    fn controller_of(&self, object: &DynamicObject) -> Option<OwnerIdentity> {
        Self::decode_lossy(object)
            .into_iter()
            .find(|reference| reference.controller)
            .map(|reference| reference.identity)
    }

    fn copy_released(
        &self,
        from: &DynamicObject,
        to: &mut DynamicObject,
    ) -> Result<(), OwnershipError> {
        let prior = Self::decode(from)?;
        let mut references = Self::decode(to)?;
        for reference in prior {
            if references
                .iter()
                .any(|known| known.identity.uid == reference.identity.uid)
            {
                continue;
            }
            references.push(AnnotatedReference {
                identity: reference.identity,
                controller: false,
            });
        }
        Self::encode(to, &references);
        Ok(())
    }

    fn remove(&self, object: &mut DynamicObject) {
        let mut references = Self::decode_lossy(object);
        references.retain(|reference| reference.identity.uid != self.owner.uid);
        Self::encode(object, &references);
        if object
            .metadata
            .annotations
            .as_ref()
            .is_some_and(std::collections::BTreeMap::is_empty)
        {
            object.metadata.annotations = None;
        }
    }

    fn is_namespace_allowed(&self, _object: &DynamicObject) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, GroupVersionKind};

    use super::*;

    fn owner() -> OwnerIdentity {
        OwnerIdentity {
            api_version: "example.dev/v1".into(),
            kind: "Package".into(),
            name: "pkg".into(),
            namespace: Some("package-system".into()),
            uid: "uid-1".into(),
        }
    }

    fn object() -> DynamicObject {
        let resource =
            ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        DynamicObject::new("cm1", &resource).within("default")
    }

    #[test]
    fn claims_cross_namespace_objects() {
        let strategy = AnnotationOwnership::new(owner());
        let mut object = object();

        assert!(strategy.is_namespace_allowed(&object));
        strategy
            .set_current(&mut object, ClaimMode::IfUnowned)
            .expect("object is unowned");

        assert!(strategy.is_current(&object));
        assert_eq!(
            strategy.controller_of(&object).map(|identity| identity.uid),
            Some("uid-1".to_owned())
        );
    }

    #[test]
    fn takeover_keeps_previous_owner_released() {
        let mut previous = owner();
        previous.name = "old".into();
        previous.uid = "uid-old".into();

        let mut object = object();
        AnnotationOwnership::new(previous)
            .set_current(&mut object, ClaimMode::IfUnowned)
            .expect("object is unowned");

        let strategy = AnnotationOwnership::new(owner());
        let err = strategy
            .set_current(&mut object, ClaimMode::IfUnowned)
            .expect_err("controlled by the previous owner");
        assert!(err.is_already_owned());

        strategy
            .set_current(&mut object, ClaimMode::Takeover)
            .expect("takeover is allowed");
        let references = AnnotationOwnership::decode(&object).expect("annotation is valid");
        assert_eq!(references.len(), 2);
        assert_eq!(
            references
                .iter()
                .filter(|reference| reference.controller)
                .count(),
            1
        );
    }

    #[test]
    fn remove_drops_annotation_entirely() {
        let strategy = AnnotationOwnership::new(owner());
        let mut object = object();
        strategy
            .set_current(&mut object, ClaimMode::IfUnowned)
            .expect("object is unowned");

        strategy.remove(&mut object);
        assert!(object.metadata.annotations.is_none());
    }

    #[test]
    fn malformed_annotation_reads_as_unowned() {
        let strategy = AnnotationOwnership::new(owner());
        let mut object = object();
        object
            .metadata
            .annotations
            .get_or_insert_default()
            .insert(OWNERS_ANNOTATION.to_owned(), "not json".to_owned());

        assert!(!strategy.is_current(&object));
        assert!(strategy.controller_of(&object).is_none());
    }
}
