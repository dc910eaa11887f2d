//! End-to-end reconcile scenarios against the in-memory cluster.

mod common;

use std::sync::Arc;

use boxcutter::{
    constants::{MANAGED_LABEL, REVISION_ANNOTATION},
    engine::{Action, ReconcileOptions},
    probe::ProbeResult,
    revision::{Phase, Revision},
};
use serde_json::json;

use common::*;

fn single_phase_revision(revision: i64) -> Revision {
    Revision::new("rev-1", revision).with_phase(
        Phase::new("phase-1").with_object(config_map("cm1", json!({ "test": "value" }))),
    )
}

#[tokio::test]
async fn s1_create_from_nothing() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));

    let result = engine
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("reconcile succeeds");

    assert!(result.is_complete());
    let object_result = &result.phase_results()[0].object_results()[0];
    assert_eq!(object_result.action(), Action::Created);
    assert!(object_result.is_success());

    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object was created");
    let annotations = live.metadata.annotations.expect("annotations stamped");
    assert_eq!(
        annotations.get(REVISION_ANNOTATION),
        Some(&"1".to_owned())
    );
    let labels = live.metadata.labels.expect("labels stamped");
    assert_eq!(labels.get(MANAGED_LABEL), Some(&"True".to_owned()));
    let owners = live.metadata.owner_references.expect("owner stamped");
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].name, "pkg");
    assert_eq!(owners[0].controller, Some(true));

    let creates = cluster
        .writes()
        .iter()
        .filter(|write| write.starts_with("create "))
        .count();
    assert_eq!(creates, 1, "exactly one POST");
}

#[tokio::test]
async fn reconcile_converges_to_idle_and_stops_writing() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));
    let revision = single_phase_revision(1);

    engine
        .reconcile(&revision, &options)
        .await
        .expect("first reconcile succeeds");
    let writes_after_first = cluster.writes();

    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("second reconcile succeeds");

    let object_result = &result.phase_results()[0].object_results()[0];
    assert_eq!(object_result.action(), Action::Idle);
    let compare = object_result.compare().expect("idle carries a comparison");
    assert!(!compare.is_modified());
    assert!(!compare.is_conflict());
    assert_eq!(
        cluster.writes(),
        writes_after_first,
        "no writes after convergence"
    );
}

#[tokio::test]
async fn s2_third_party_patch_recovery() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));
    let revision = single_phase_revision(1);

    engine
        .reconcile(&revision, &options)
        .await
        .expect("first reconcile succeeds");

    // Hans patches .data.test, the server moves the field into his entry.
    cluster.mutate(&config_map_ref("cm1"), |object| {
        object.data["data"]["test"] = json!("hans-was-here");

        use boxcutter::fieldset::{FieldSet, PathElement};
        let mut hans_set = FieldSet::new();
        hans_set.insert(&[PathElement::field("data"), PathElement::field("test")]);

        let entries = object
            .metadata
            .managed_fields
            .as_mut()
            .expect("engine left managed fields behind");
        let ours = FieldSet::from_fields_v1(
            &entries[0].fields_v1.as_ref().expect("entry has fields").0,
        )
        .expect("our entry parses");
        entries[0].fields_v1 = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::FieldsV1(
                ours.difference(&hans_set).to_fields_v1(),
            ),
        );
        entries.push(managed_fields_entry("Hans", "Update", &hans_set));
    });

    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("recovery reconcile succeeds");

    let object_result = &result.phase_results()[0].object_results()[0];
    assert_eq!(object_result.action(), Action::Recovered);
    let compare = object_result.compare().expect("recovery carries a comparison");
    assert_eq!(compare.conflicting_managers.len(), 1);
    assert_eq!(compare.conflicting_managers[0].manager, "Hans");
    let conflicting_paths: Vec<String> = compare.conflicting_managers[0]
        .fields
        .leaves()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(conflicting_paths, [".data.test"]);

    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object survived recovery");
    assert_eq!(live.data["data"]["test"], json!("value"));
    assert!(
        cluster
            .writes()
            .last()
            .expect("recovery wrote")
            .starts_with("apply-force "),
        "recovery uses forced apply"
    );

    // Compare round-trip: the recovered object reads as converged.
    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("post-recovery reconcile succeeds");
    assert_eq!(
        result.phase_results()[0].object_results()[0].action(),
        Action::Idle
    );
}

#[tokio::test]
async fn s3_revision_linearity() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));

    engine
        .reconcile(&single_phase_revision(4), &options)
        .await
        .expect("newer revision reconciles");
    let writes_before = cluster.writes();

    let result = engine
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("older revision reconciles");

    let phase = &result.phase_results()[0];
    assert_eq!(phase.object_results()[0].action(), Action::Progressed);
    assert!(phase.has_progressed());
    assert_eq!(cluster.writes(), writes_before, "older revision wrote nothing");

    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object untouched");
    assert_eq!(
        live.metadata
            .annotations
            .expect("annotations intact")
            .get(REVISION_ANNOTATION),
        Some(&"4".to_owned())
    );
}

#[tokio::test]
async fn s4_collision_on_unowned_object() {
    let cluster = FakeCluster::new();
    cluster.seed(config_map("cm1", json!({ "test": "value" })));
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));

    let result = engine
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("reconcile succeeds");

    let object_result = &result.phase_results()[0].object_results()[0];
    assert_eq!(object_result.action(), Action::Collision);
    assert!(object_result.conflicting_owner().is_none());
    assert!(!object_result.is_success());
    assert!(!result.is_complete());
    assert!(cluster.writes().is_empty(), "collision writes nothing");
}

#[tokio::test]
async fn s5_takeover_from_previous_owner() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);

    let old_options =
        ReconcileOptions::new().with_owner(native_ownership("old-pkg", "owner-uid-old"));
    engine
        .reconcile(&single_phase_revision(1), &old_options)
        .await
        .expect("old owner reconciles");

    let new_options = ReconcileOptions::new()
        .with_owner(native_ownership("new-pkg", "owner-uid-new"))
        .with_previous_owners([owner_identity("old-pkg", "owner-uid-old")]);
    let result = engine
        .reconcile(&single_phase_revision(1), &new_options)
        .await
        .expect("new owner takes over");

    let object_result = &result.phase_results()[0].object_results()[0];
    assert_eq!(object_result.action(), Action::Updated);

    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object survived takeover");
    let owners = live.metadata.owner_references.expect("owners present");
    assert_eq!(owners.len(), 2);
    let old = owners
        .iter()
        .find(|owner| owner.uid == "owner-uid-old")
        .expect("previous owner kept");
    assert_eq!(old.controller, Some(false));
    let new = owners
        .iter()
        .find(|owner| owner.uid == "owner-uid-new")
        .expect("new owner set");
    assert_eq!(new.controller, Some(true));
}

#[tokio::test]
async fn paused_reconcile_never_writes() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let ownership = native_ownership("pkg", "owner-uid-1");

    // Pause before the object exists: Created is reported, nothing posted.
    let paused = ReconcileOptions::new()
        .with_owner(ownership.clone())
        .with_paused();
    let result = engine
        .reconcile(&single_phase_revision(1), &paused)
        .await
        .expect("paused reconcile succeeds");
    assert_eq!(
        result.phase_results()[0].object_results()[0].action(),
        Action::Created
    );
    assert!(cluster.writes().is_empty());
    assert!(cluster.get_object(&config_map_ref("cm1")).is_none());

    // Create for real, then pause with a modified desired state.
    let options = ReconcileOptions::new().with_owner(ownership);
    engine
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("unpaused reconcile succeeds");
    let writes_before = cluster.writes();

    let modified = Revision::new("rev-1", 1).with_phase(
        Phase::new("phase-1").with_object(config_map("cm1", json!({ "test": "changed" }))),
    );
    let result = engine
        .reconcile(&modified, &paused)
        .await
        .expect("paused reconcile succeeds");
    assert_eq!(
        result.phase_results()[0].object_results()[0].action(),
        Action::Updated
    );
    assert_eq!(cluster.writes(), writes_before, "pause issues no writes");
    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object untouched");
    assert_eq!(live.data["data"]["test"], json!("value"));
}

#[tokio::test]
async fn reconcile_without_owner_stamps_only_the_label() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new();
    let revision = single_phase_revision(1);

    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("reconcile succeeds");
    assert_eq!(
        result.phase_results()[0].object_results()[0].action(),
        Action::Created
    );

    let live = cluster
        .get_object(&config_map_ref("cm1"))
        .expect("object created");
    assert!(live.metadata.owner_references.is_none());
    assert_eq!(
        live.metadata
            .labels
            .expect("label stamped")
            .get(MANAGED_LABEL),
        Some(&"True".to_owned())
    );

    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("second reconcile succeeds");
    assert_eq!(
        result.phase_results()[0].object_results()[0].action(),
        Action::Idle
    );
}

#[tokio::test]
async fn already_exists_falls_through_to_the_update_path() {
    let cluster = FakeCluster::new();
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));

    revision_engine(&cluster)
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("initial reconcile succeeds");

    // This engine's cache claims the object does not exist; the POST runs
    // into AlreadyExists and the engine re-reads through the uncached path.
    let stale = stale_object_engine(&cluster);
    let desired = config_map("cm1", json!({ "test": "value" }));
    let result = stale
        .reconcile(1, &desired, &options)
        .await
        .expect("stale reconcile succeeds");

    assert_eq!(result.action(), Action::Idle);
    let creates = cluster
        .writes()
        .iter()
        .filter(|write| write.starts_with("create "))
        .count();
    assert_eq!(creates, 1, "the failed POST is not logged as a write");
}

#[tokio::test]
async fn invalid_revision_reconciles_nothing() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);
    let options = ReconcileOptions::new().with_owner(native_ownership("pkg", "owner-uid-1"));

    // The same object declared in two phases.
    let revision = Revision::new("rev-1", 1)
        .with_phase(
            Phase::new("phase-1").with_object(config_map("cm1", json!({ "test": "value" }))),
        )
        .with_phase(
            Phase::new("phase-2").with_object(config_map("cm1", json!({ "test": "other" }))),
        );

    let result = engine
        .reconcile(&revision, &options)
        .await
        .expect("reconcile returns a verdict");
    assert!(result.validation_error().is_some());
    assert!(result.phase_results().is_empty());
    assert!(!result.is_complete());
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn progress_probe_gates_later_phases() {
    let cluster = FakeCluster::new();
    let engine = revision_engine(&cluster);

    let continue_probe = Arc::new(|object: &kube::core::DynamicObject| {
        if object.data["data"]["continue"] == json!("yes") {
            ProbeResult::success()
        } else {
            ProbeResult::failure("continue is not \"yes\"")
        }
    });
    let options = ReconcileOptions::new()
        .with_owner(native_ownership("pkg", "owner-uid-1"))
        .with_probe(boxcutter::probe::PROGRESS_PROBE_NAME, continue_probe);

    let blocked = Revision::new("rev-1", 1)
        .with_phase(
            Phase::new("phase-1").with_object(config_map("cm1", json!({ "test": "value" }))),
        )
        .with_phase(Phase::new("phase-2").with_object(config_map(
            "cm2",
            json!({ "continue": "yes" }),
        )));

    let result = engine
        .reconcile(&blocked, &options)
        .await
        .expect("reconcile succeeds");
    assert_eq!(result.phase_results().len(), 1, "phase-2 is not reached");
    assert!(!result.phase_results()[0].is_complete());
    assert!(result.in_transition());
    assert!(cluster.get_object(&config_map_ref("cm2")).is_none());

    // The first phase's object signals continuation, the rollout proceeds.
    let unblocked = Revision::new("rev-1", 1)
        .with_phase(Phase::new("phase-1").with_object(config_map(
            "cm1",
            json!({ "test": "value", "continue": "yes" }),
        )))
        .with_phase(Phase::new("phase-2").with_object(config_map(
            "cm2",
            json!({ "continue": "yes" }),
        )));

    let result = engine
        .reconcile(&unblocked, &options)
        .await
        .expect("reconcile succeeds");
    assert_eq!(result.phase_results().len(), 2);
    assert!(result.is_complete());
    assert!(cluster.get_object(&config_map_ref("cm2")).is_some());
}

#[tokio::test]
async fn cross_namespace_phase_fails_validation() {
    let cluster = FakeCluster::new();
    let ownership = {
        let mut owner = owner_identity("pkg", "owner-uid-1");
        owner.namespace = Some("package-system".to_owned());
        Arc::new(boxcutter::ownership::NativeOwnership::new(owner))
            as Arc<dyn boxcutter::ownership::RevisionOwnership>
    };

    let phase_engine = boxcutter::engine::PhaseEngine::new(
        object_engine(&cluster),
        Arc::new(
            boxcutter::validation::StaticPhaseValidator::new().with_owner(ownership.clone()),
        ),
    );
    let engine = boxcutter::engine::RevisionEngine::new(
        phase_engine,
        Arc::new(boxcutter::validation::StaticRevisionValidator),
    );

    let options = ReconcileOptions::new().with_owner(ownership);
    let result = engine
        .reconcile(&single_phase_revision(1), &options)
        .await
        .expect("reconcile returns a verdict");

    let phase = &result.phase_results()[0];
    let error = phase
        .validation_error()
        .expect("cross-namespace object fails preflight");
    assert!(error.to_string().contains("namespace not allowed"));
    assert!(phase.object_results().is_empty());
    assert!(!result.is_complete());
    assert!(cluster.writes().is_empty());
}
