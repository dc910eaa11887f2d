//! Capability traits for talking to the Kubernetes API.
//!
//! The engines only ever see these traits. Production deployments back the
//! [`Reader`] with a watch cache scoped to the owning object and the
//! [`Writer`] with a plain API client; [`KubeAccessor`] is the shipped
//! uncached implementation of both.

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, response::StatusSummary},
};

use crate::revision::ObjectRef;

/// Read access to live objects. Backed by a (possibly lagging) cache in
/// production; stale reads at worst cause one extra reconcile iteration.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Standard NotFound errors are returned unwrapped so callers can branch
    /// on them via [`is_not_found`].
    async fn get(&self, object_ref: &ObjectRef) -> Result<DynamicObject, kube::Error>;
}

/// Write access to live objects. Every mutation is either a POST, an SSA
/// PATCH under a named field manager, a raw JSON-patch, a PUT, or a DELETE
/// with UID/resourceVersion preconditions.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error>;

    /// Server-side apply under `field_manager`. With `force` set, conflicts
    /// with other field managers are resolved in our favor.
    async fn apply(
        &self,
        field_manager: &str,
        force: bool,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// A raw JSON-patch, used for the managed-field migration.
    async fn patch_json(
        &self,
        object_ref: &ObjectRef,
        patch: json_patch::Patch,
    ) -> Result<DynamicObject, kube::Error>;

    /// Replaces the object (PUT). Used when detaching engine metadata from
    /// an object that is not being deleted.
    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error>;

    async fn delete(
        &self,
        object_ref: &ObjectRef,
        preconditions: Preconditions,
    ) -> Result<(), kube::Error>;
}

/// Whether the error is a 404 for the object *or* its whole kind; during
/// teardown both mean there is nothing left to delete.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.reason == "AlreadyExists")
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.reason == "Conflict")
}

pub(crate) fn invalid_object(message: impl Into<String>) -> kube::Error {
    kube::Error::Api(Box::new(ErrorResponse {
        status: Some(StatusSummary::Failure),
        message: message.into(),
        metadata: None,
        reason: "Invalid".to_owned(),
        code: 422,
        details: None,
    }))
}

/// An uncached [`Reader`]/[`Writer`] over a [`kube::Client`].
///
/// Kinds are mapped to resources with [`ApiResource::from_gvk`]; supply a
/// discovery-backed mapping yourself if you manage kinds with irregular
/// plurals.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
}

impl KubeAccessor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn api_for_object(
        &self,
        object: &DynamicObject,
    ) -> Result<(Api<DynamicObject>, String), kube::Error> {
        let object_ref = ObjectRef::from_object(object)
            .ok_or_else(|| invalid_object("object has no type information or name"))?;
        Ok((
            self.api_for(&object_ref.gvk(), object_ref.namespace.as_deref()),
            object_ref.name,
        ))
    }
}

#[async_trait]
impl Reader for KubeAccessor {
    async fn get(&self, object_ref: &ObjectRef) -> Result<DynamicObject, kube::Error> {
        self.api_for(&object_ref.gvk(), object_ref.namespace.as_deref())
            .get(&object_ref.name)
            .await
    }
}

#[async_trait]
impl Writer for KubeAccessor {
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let (api, _) = self.api_for_object(object)?;
        api.create(&PostParams::default(), object).await
    }

    async fn apply(
        &self,
        field_manager: &str,
        force: bool,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let (api, name) = self.api_for_object(object)?;
        let mut params = PatchParams::apply(field_manager);
        if force {
            params = params.force();
        }
        api.patch(&name, &params, &Patch::Apply(object)).await
    }

    async fn patch_json(
        &self,
        object_ref: &ObjectRef,
        patch: json_patch::Patch,
    ) -> Result<DynamicObject, kube::Error> {
        self.api_for(&object_ref.gvk(), object_ref.namespace.as_deref())
            .patch(
                &object_ref.name,
                &PatchParams::default(),
                &Patch::Json::<()>(patch),
            )
            .await
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let (api, name) = self.api_for_object(object)?;
        api.replace(&name, &PostParams::default(), object).await
    }

    async fn delete(
        &self,
        object_ref: &ObjectRef,
        preconditions: Preconditions,
    ) -> Result<(), kube::Error> {
        let params = DeleteParams {
            preconditions: Some(preconditions),
            ..DeleteParams::default()
        };
        self.api_for(&object_ref.gvk(), object_ref.namespace.as_deref())
            .delete(&object_ref.name, &params)
            .await
            .map(|_| ())
    }
}
