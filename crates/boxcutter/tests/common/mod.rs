//! An in-memory cluster with simplified server-side apply semantics, enough
//! to exercise the engines: objects keyed by reference, uid/resourceVersion
//! bookkeeping, managed-field entries maintained per manager, finalizers
//! that hold deletion, and a write log for no-write assertions.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use boxcutter::{
    client::{Reader, Writer},
    fieldset::{FieldSet, ListKeys},
    revision::ObjectRef,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry};
use kube::{
    api::Preconditions,
    core::{DynamicObject, ErrorResponse, response::StatusSummary},
};
use serde_json::Value;

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(Box::new(ErrorResponse {
        status: Some(StatusSummary::Failure),
        message: String::new(),
        metadata: None,
        reason: reason.to_owned(),
        code,
        details: None,
    }))
}

pub fn not_found() -> kube::Error {
    api_error(404, "NotFound")
}

pub fn managed_fields_entry(manager: &str, operation: &str, set: &FieldSet) -> ManagedFieldsEntry {
    ManagedFieldsEntry {
        manager: Some(manager.to_owned()),
        operation: Some(operation.to_owned()),
        fields_v1: Some(FieldsV1(set.to_fields_v1())),
        ..Default::default()
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, DynamicObject>,
    pending_deletion: BTreeSet<ObjectRef>,
    next_uid: u64,
    next_resource_version: u64,
    writes: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds a live object without going through the write log.
    pub fn seed(&self, object: DynamicObject) {
        let mut state = self.state.lock().expect("fake cluster lock");
        let object_ref = ObjectRef::from_object(&object).expect("seeded object must be typed");
        let mut stored = object;
        if stored.metadata.uid.is_none() {
            state.next_uid += 1;
            stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
        }
        if stored.metadata.resource_version.is_none() {
            state.next_resource_version += 1;
            stored.metadata.resource_version = Some(state.next_resource_version.to_string());
        }
        state.objects.insert(object_ref, stored);
    }

    pub fn get_object(&self, object_ref: &ObjectRef) -> Option<DynamicObject> {
        self.state
            .lock()
            .expect("fake cluster lock")
            .objects
            .get(object_ref)
            .cloned()
    }

    /// Mutates a live object in place, bypassing apply semantics. Used to
    /// simulate third-party actors.
    pub fn mutate(&self, object_ref: &ObjectRef, f: impl FnOnce(&mut DynamicObject)) {
        let mut state = self.state.lock().expect("fake cluster lock");
        state.next_resource_version += 1;
        let resource_version = state.next_resource_version.to_string();
        let object = state
            .objects
            .get_mut(object_ref)
            .expect("object to mutate must exist");
        f(object);
        object.metadata.resource_version = Some(resource_version);
    }

    /// Everything written through the [`Writer`] interface, in order, as
    /// `"<verb> <object>"` lines.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().expect("fake cluster lock").writes.clone()
    }

    /// Simulates finalizer completion: drops the finalizers of an object
    /// and, if a delete is pending, removes it for good.
    pub fn clear_finalizers(&self, object_ref: &ObjectRef) {
        let mut state = self.state.lock().expect("fake cluster lock");
        if let Some(object) = state.objects.get_mut(object_ref) {
            object.metadata.finalizers = None;
        }
        if state.pending_deletion.remove(object_ref) {
            state.objects.remove(object_ref);
        }
    }
}

fn log(state: &mut State, verb: &str, object_ref: &ObjectRef) {
    state.writes.push(format!("{verb} {object_ref}"));
}

fn extraction_set(object: &DynamicObject) -> FieldSet {
    let doc = serde_json::to_value(object).expect("objects serialize");
    FieldSet::extract(&doc, &ListKeys::new())
}

/// The applied document wins, mappings merge recursively, everything else
/// is replaced.
fn merge_values(existing: &mut Value, applied: &Value) {
    match (existing, applied) {
        (Value::Object(existing), Value::Object(applied)) => {
            for (key, value) in applied {
                match existing.get_mut(key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[async_trait]
impl Reader for FakeCluster {
    async fn get(&self, object_ref: &ObjectRef) -> Result<DynamicObject, kube::Error> {
        self.state
            .lock()
            .expect("fake cluster lock")
            .objects
            .get(object_ref)
            .cloned()
            .ok_or_else(not_found)
    }
}

#[async_trait]
impl Writer for FakeCluster {
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let object_ref = ObjectRef::from_object(object)
            .ok_or_else(|| api_error(422, "Invalid"))?;
        let mut state = self.state.lock().expect("fake cluster lock");
        if state.objects.contains_key(&object_ref) {
            return Err(api_error(409, "AlreadyExists"));
        }

        let mut stored = object.clone();
        state.next_uid += 1;
        state.next_resource_version += 1;
        stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
        stored.metadata.resource_version = Some(state.next_resource_version.to_string());
        // A POST records the writer under an Update operation, same as the
        // real API server.
        stored.metadata.managed_fields = Some(vec![managed_fields_entry(
            "boxcutter",
            "Update",
            &extraction_set(object),
        )]);

        log(&mut state, "create", &object_ref);
        state.objects.insert(object_ref, stored.clone());
        Ok(stored)
    }

    async fn apply(
        &self,
        field_manager: &str,
        force: bool,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let object_ref = ObjectRef::from_object(object)
            .ok_or_else(|| api_error(422, "Invalid"))?;
        let applied_set = extraction_set(object);
        let mut state = self.state.lock().expect("fake cluster lock");
        state.next_resource_version += 1;
        let resource_version = state.next_resource_version.to_string();
        let verb = if force { "apply-force" } else { "apply" };

        let stored = if !state.objects.contains_key(&object_ref) {
            let mut stored = object.clone();
            state.next_uid += 1;
            stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
            stored.metadata.resource_version = Some(resource_version);
            stored.metadata.managed_fields = Some(vec![managed_fields_entry(
                field_manager,
                "Apply",
                &applied_set,
            )]);
            state.objects.insert(object_ref.clone(), stored.clone());
            stored
        } else {
            {
                let existing = state
                    .objects
                    .get_mut(&object_ref)
                    .expect("presence checked above");
                if let Some(labels) = &object.metadata.labels {
                    existing
                        .metadata
                        .labels
                        .get_or_insert_default()
                        .extend(labels.clone());
                }
                if let Some(annotations) = &object.metadata.annotations {
                    existing
                        .metadata
                        .annotations
                        .get_or_insert_default()
                        .extend(annotations.clone());
                }
                if object.metadata.owner_references.is_some() {
                    existing.metadata.owner_references =
                        object.metadata.owner_references.clone();
                }
                merge_values(&mut existing.data, &object.data);
                existing.metadata.resource_version = Some(resource_version);

                // Fields move to the applying manager, other managers keep
                // the rest of theirs.
                let mut entries = existing.metadata.managed_fields.take().unwrap_or_default();
                entries.retain(|entry| {
                    entry.manager.as_deref() != Some(field_manager)
                        || entry.operation.as_deref() != Some("Apply")
                });
                for entry in &mut entries {
                    if let Some(fields_v1) = &entry.fields_v1
                        && let Ok(set) = FieldSet::from_fields_v1(&fields_v1.0)
                    {
                        entry.fields_v1 =
                            Some(FieldsV1(set.difference(&applied_set).to_fields_v1()));
                    }
                }
                entries.retain(|entry| {
                    entry
                        .fields_v1
                        .as_ref()
                        .and_then(|fields_v1| FieldSet::from_fields_v1(&fields_v1.0).ok())
                        .is_none_or(|set| !set.is_empty())
                });
                entries.push(managed_fields_entry(field_manager, "Apply", &applied_set));
                existing.metadata.managed_fields = Some(entries);
                existing.clone()
            }
        };

        log(&mut state, verb, &object_ref);
        Ok(stored)
    }

    async fn patch_json(
        &self,
        object_ref: &ObjectRef,
        patch: json_patch::Patch,
    ) -> Result<DynamicObject, kube::Error> {
        let mut state = self.state.lock().expect("fake cluster lock");
        state.next_resource_version += 1;
        let resource_version = state.next_resource_version.to_string();
        let existing = state
            .objects
            .get_mut(object_ref)
            .ok_or_else(not_found)?;

        let mut doc = serde_json::to_value(&*existing).expect("objects serialize");
        json_patch::patch(&mut doc, &patch).map_err(|_| api_error(422, "Invalid"))?;
        *existing = serde_json::from_value(doc).map_err(|_| api_error(422, "Invalid"))?;
        existing.metadata.resource_version = Some(resource_version);
        let patched = existing.clone();

        log(&mut state, "patch-json", object_ref);
        Ok(patched)
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let object_ref = ObjectRef::from_object(object)
            .ok_or_else(|| api_error(422, "Invalid"))?;
        let mut state = self.state.lock().expect("fake cluster lock");
        state.next_resource_version += 1;
        let resource_version = state.next_resource_version.to_string();
        if !state.objects.contains_key(&object_ref) {
            return Err(not_found());
        }

        let mut stored = object.clone();
        stored.metadata.resource_version = Some(resource_version);
        state.objects.insert(object_ref.clone(), stored.clone());
        log(&mut state, "update", &object_ref);
        Ok(stored)
    }

    async fn delete(
        &self,
        object_ref: &ObjectRef,
        preconditions: Preconditions,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().expect("fake cluster lock");
        let Some(existing) = state.objects.get(object_ref) else {
            return Err(not_found());
        };

        if let Some(uid) = &preconditions.uid
            && existing.metadata.uid.as_ref() != Some(uid)
        {
            return Err(api_error(409, "Conflict"));
        }
        if let Some(resource_version) = &preconditions.resource_version
            && existing.metadata.resource_version.as_ref() != Some(resource_version)
        {
            return Err(api_error(409, "Conflict"));
        }

        let has_finalizers = existing
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| !finalizers.is_empty());
        if has_finalizers {
            state.pending_deletion.insert(object_ref.clone());
        } else {
            state.objects.remove(object_ref);
        }
        log(&mut state, "delete", object_ref);
        Ok(())
    }
}

/// A reader that never finds anything, standing in for a watch cache that
/// lags behind the API server.
pub struct EmptyReader;

#[async_trait]
impl Reader for EmptyReader {
    async fn get(&self, _object_ref: &ObjectRef) -> Result<DynamicObject, kube::Error> {
        Err(not_found())
    }
}

// Engine plumbing shared by the scenario tests. Not every test binary uses
// every helper.

use boxcutter::{
    compare::DeducedSchema,
    engine::{ObjectEngine, PhaseEngine, RevisionEngine},
    ownership::{NativeOwnership, OwnerIdentity, RevisionOwnership},
    validation::{StaticPhaseValidator, StaticRevisionValidator},
};

pub const FIELD_MANAGER: &str = "boxcutter";

#[allow(dead_code)]
pub fn owner_identity(name: &str, uid: &str) -> OwnerIdentity {
    OwnerIdentity {
        api_version: "example.dev/v1".to_owned(),
        kind: "Package".to_owned(),
        name: name.to_owned(),
        namespace: Some("default".to_owned()),
        uid: uid.to_owned(),
    }
}

#[allow(dead_code)]
pub fn native_ownership(name: &str, uid: &str) -> Arc<dyn RevisionOwnership> {
    Arc::new(NativeOwnership::new(owner_identity(name, uid)))
}

pub fn object_engine(cluster: &Arc<FakeCluster>) -> Arc<ObjectEngine> {
    Arc::new(ObjectEngine::new(
        Arc::new(DeducedSchema),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        FIELD_MANAGER,
    ))
}

#[allow(dead_code)]
pub fn revision_engine(cluster: &Arc<FakeCluster>) -> RevisionEngine {
    let phase_engine = PhaseEngine::new(
        object_engine(cluster),
        Arc::new(StaticPhaseValidator::new()),
    );
    RevisionEngine::new(phase_engine, Arc::new(StaticRevisionValidator))
}

/// An object engine whose cache-backed reader lags behind the API server
/// forever, forcing the AlreadyExists fallthrough.
#[allow(dead_code)]
pub fn stale_object_engine(cluster: &Arc<FakeCluster>) -> Arc<ObjectEngine> {
    Arc::new(ObjectEngine::new(
        Arc::new(DeducedSchema),
        Arc::new(EmptyReader),
        cluster.clone(),
        cluster.clone(),
        FIELD_MANAGER,
    ))
}

#[allow(dead_code)]
pub fn config_map(name: &str, data: serde_json::Value) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "default"
        },
        "data": data
    }))
    .expect("fixture is a valid object")
}

#[allow(dead_code)]
pub fn config_map_ref(name: &str) -> ObjectRef {
    ObjectRef {
        group: String::new(),
        version: "v1".to_owned(),
        kind: "ConfigMap".to_owned(),
        namespace: Some("default".to_owned()),
        name: name.to_owned(),
    }
}
