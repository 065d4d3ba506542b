//! Queue listener behavior over the in-memory harness.

use fhirsync_engine::{
    Delivery, Direction, EngineConfig, ListenerConfig, MessageHandler, ResourceRepository, StagedResource,
    StagingStore, SyncError, WorkerPool,
};
use fhirsync_protocol::{ExportMessage, ExternalResource, FhirVersion, ImportMessage};
use fhirsync_testkit::prelude::{
    patient, tracked_entity, RecordingTransport, ScriptedRule, Settlement, TestHarness,
};
use std::sync::Barrier;
use std::time::Duration;
use uuid::Uuid;

#[test]
fn replayed_message_applies_one_write() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness.server.seed(patient("7", 10));
    let message = ImportMessage::new(config.id, "Patient", "7");

    let first = harness.import_listener.handle(&message).unwrap();
    let second = harness.import_listener.handle(&message).unwrap();

    assert_eq!(first, Delivery::Applied);
    assert_eq!(second, Delivery::Duplicate);
    assert_eq!(harness.registry.saved_ids(), vec!["TrackedEntity/7"]);

    let stats = harness.import_listener.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.duplicates, 1);
}

#[test]
fn concurrent_deliveries_of_one_change_apply_one_write() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    let target = harness.add_registry_config("TrackedEntity");
    harness.transforms.add_rule(ScriptedRule::new(
        "slow copy",
        Direction::Import,
        "Patient",
        target,
        |_ctx, source| {
            std::thread::sleep(Duration::from_millis(100));
            let produced = ExternalResource::new("TrackedEntity", source.body().clone())
                .with_id(source.id().unwrap_or_default());
            Ok(Some(produced))
        },
    ));
    harness.server.seed(patient("7", 10));
    let message = ImportMessage::new(config.id, "Patient", "7");
    let start = Barrier::new(2);

    let mut deliveries: Vec<Delivery> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    start.wait();
                    harness.import_listener.handle(&message).unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    deliveries.sort_by_key(|d| format!("{d:?}"));

    assert_eq!(deliveries, vec![Delivery::Applied, Delivery::Duplicate]);
    assert_eq!(harness.registry.saved_ids(), vec!["TrackedEntity/7"]);
}

#[test]
fn composite_id_selects_the_producing_rule() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    let enrollments = harness.add_registry_config("Enrollment");
    let rule = harness.transforms.add_rule(ScriptedRule::copy_to(
        "Patient to Enrollment",
        Direction::Import,
        "Patient",
        "Enrollment",
        enrollments,
    ));
    let produced_id = format!("te-abc123-{}", rule.simple());
    harness.server.seed(patient(&produced_id, 10));
    harness.server.seed(patient("8", 10));
    let saved_types = || {
        harness
            .registry
            .saved()
            .into_iter()
            .map(|identity| identity.resource_type)
            .collect::<Vec<_>>()
    };

    let delivery = harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", produced_id.as_str()))
        .unwrap();
    assert_eq!(delivery, Delivery::Applied);
    assert_eq!(saved_types(), vec!["Enrollment"]);

    harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", "8"))
        .unwrap();
    assert_eq!(saved_types(), vec!["Enrollment", "TrackedEntity", "Enrollment"]);
}

#[test]
fn changed_resource_is_processed_again() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    let message = ImportMessage::new(config.id, "Patient", "7");

    harness.server.seed(patient("7", 10));
    harness.import_listener.handle(&message).unwrap();
    harness.server.seed(patient("7", 20));
    let delivery = harness.import_listener.handle(&message).unwrap();

    assert_eq!(delivery, Delivery::Applied);
    assert_eq!(harness.registry.saved().len(), 2);
}

#[test]
fn echo_of_an_import_is_not_exported_back() {
    let harness = TestHarness::new();
    let import_config = harness.import_rule("Patient", "TrackedEntity");
    let export_config = harness.export_rule("TrackedEntity", "Patient");
    harness.server.seed(patient("7", 10));

    harness
        .import_listener
        .handle(&ImportMessage::new(import_config.id, "Patient", "7"))
        .unwrap();
    let echo = harness
        .export_listener
        .handle(&ExportMessage::new(export_config.id, "TrackedEntity", "7"))
        .unwrap();

    assert_eq!(echo, Delivery::Duplicate);
    assert_eq!(harness.server.calls().writes(), 0);
}

#[test]
fn unknown_configuration_is_dropped() {
    let harness = TestHarness::new();
    harness.import_rule("Patient", "TrackedEntity");

    let delivery = harness
        .import_listener
        .handle(&ImportMessage::new(Uuid::new_v4(), "Patient", "7"))
        .unwrap();

    assert!(matches!(delivery, Delivery::Dropped(_)));
    assert_eq!(harness.import_listener.stats().dropped, 1);
}

#[test]
fn disabled_direction_drops_without_reading() {
    let harness = TestHarness::with_config(EngineConfig::default().with_listener(ListenerConfig {
        import_enabled: false,
        ..ListenerConfig::default()
    }));
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness.server.seed(patient("7", 10));

    let delivery = harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", "7"))
        .unwrap();

    assert!(matches!(delivery, Delivery::Dropped(_)));
    assert_eq!(harness.server.calls().reads, 0);
    assert!(harness.registry.is_empty());
}

#[test]
fn vanished_resource_is_dropped() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");

    let delivery = harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", "404"))
        .unwrap();

    assert!(matches!(delivery, Delivery::Dropped(_)));
    assert!(harness.registry.is_empty());
}

#[test]
fn staged_payload_is_used_and_then_deleted() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness
        .staging
        .stage(
            config.id,
            "Patient",
            "7",
            StagedResource::new(FhirVersion::R4, &patient("7", 10)).unwrap(),
        )
        .unwrap();

    let delivery = harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", "7").persisted())
        .unwrap();

    assert_eq!(delivery, Delivery::Applied);
    assert_eq!(harness.server.calls().reads, 0);
    assert!(harness.staging.find(config.id, "Patient", "7").unwrap().is_none());
}

#[test]
fn staging_record_survives_redelivery() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness
        .staging
        .stage(
            config.id,
            "Patient",
            "7",
            StagedResource::new(FhirVersion::R4, &patient("7", 10)).unwrap(),
        )
        .unwrap();
    harness.registry.fail_next_saves_with_conflict(3);
    let message = ImportMessage::new(config.id, "Patient", "7").persisted();

    let first = harness.import_listener.handle(&message).unwrap();
    assert!(matches!(first, Delivery::Redeliver(_)));
    assert!(harness.staging.find(config.id, "Patient", "7").unwrap().is_some());
    assert!(harness.ledger.is_empty());

    let second = harness.import_listener.handle(&message).unwrap();
    assert_eq!(second, Delivery::Applied);
    assert!(harness.staging.find(config.id, "Patient", "7").unwrap().is_none());
}

#[test]
fn dependency_cycle_is_fatal() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness.server.seed(patient("A", 1));
    harness.server.seed(patient("B", 1));
    harness.registry.require_dependency(
        ("TrackedEntity", "A"),
        ("Patient", "B"),
        ("TrackedEntity", "B"),
    );
    harness.registry.require_dependency(
        ("TrackedEntity", "B"),
        ("Patient", "A"),
        ("TrackedEntity", "A"),
    );

    let err = harness
        .import_listener
        .handle(&ImportMessage::new(config.id, "Patient", "A"))
        .unwrap_err();

    assert!(matches!(err, SyncError::DependencyCycle { .. }));
    let stats = harness.import_listener.stats();
    assert_eq!(stats.failed, 1);
    assert!(stats.last_error.is_some());
}

#[test]
fn export_deletion_removes_the_fhir_resource() {
    let harness = TestHarness::new();
    let config = harness.export_rule("TrackedEntity", "Patient");
    harness.server.seed(patient("5", 1));

    let delivery = harness
        .export_listener
        .handle(&ExportMessage::new(config.id, "TrackedEntity", "5").deleted())
        .unwrap();

    assert_eq!(delivery, Delivery::Applied);
    assert!(harness.server.get("Patient", "5").is_none());
    assert_eq!(harness.server.calls().deletes, 1);
}

#[test]
fn export_writes_registry_changes() {
    let harness = TestHarness::new();
    let config = harness.export_rule("TrackedEntity", "Patient");
    harness.registry.seed(tracked_entity("abc", 3));

    let delivery = harness
        .export_listener
        .handle(&ExportMessage::new(config.id, "TrackedEntity", "abc"))
        .unwrap();

    assert_eq!(delivery, Delivery::Applied);
    let stored = harness.server.get("Patient", "abc").unwrap();
    assert_eq!(stored.version(), Some("1"));
    assert_eq!(harness.export_listener.stats().applied, 1);
}

#[test]
fn worker_pool_settles_every_message() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    for id in ["1", "2", "3"] {
        harness.server.seed(patient(id, 1));
    }
    let transport = RecordingTransport::new(3);
    for id in ["1", "2", "3", "404"] {
        transport.publish(ImportMessage::new(config.id, "Patient", id));
    }

    let pool = WorkerPool::new(&ListenerConfig {
        workers: 2,
        receive_timeout: Duration::from_millis(10),
        ..ListenerConfig::default()
    });
    let report = pool.run_until_idle(&transport, &harness.import_listener);

    assert_eq!(report.received, 4);
    assert_eq!(report.acknowledged, 4);
    assert_eq!(transport.acknowledged(), 4);
    assert_eq!(transport.redelivered(), 0);
    assert!(transport
        .settlements()
        .iter()
        .all(|s| matches!(s, Settlement::Acknowledged { .. })));
    let mut saved = harness.registry.saved_ids();
    saved.sort();
    assert_eq!(
        saved,
        vec!["TrackedEntity/1", "TrackedEntity/2", "TrackedEntity/3"]
    );
}

#[test]
fn worker_pool_hands_back_conflicts() {
    let harness = TestHarness::new();
    let config = harness.import_rule("Patient", "TrackedEntity");
    harness.server.seed(patient("7", 1));
    harness.registry.fail_next_saves_with_conflict(3);
    let transport = RecordingTransport::new(5);
    transport.publish(ImportMessage::new(config.id, "Patient", "7"));

    let pool = WorkerPool::new(&ListenerConfig {
        workers: 1,
        receive_timeout: Duration::from_millis(10),
        ..ListenerConfig::default()
    });
    let report = pool.run_until_idle(&transport, &harness.import_listener);

    assert_eq!(report.redelivered, 1);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(harness.registry.saved_ids(), vec!["TrackedEntity/7"]);
    assert!(harness
        .registry
        .find_refreshed(&harness.ctx(), &config, "TrackedEntity", "7")
        .unwrap()
        .is_some());
}
