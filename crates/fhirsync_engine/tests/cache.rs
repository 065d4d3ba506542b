//! Cached lookups of the FHIR-side repository.

use fhirsync_engine::{CacheStore, ResourceRepository, SyncContext};
use fhirsync_protocol::{FhirVersion, ResourceEndpointKey, SystemCodeValue};
use fhirsync_testkit::prelude::{fhir_config, patient, registry_config, TestHarness};
use uuid::Uuid;

#[test]
fn cached_lookup_is_evicted_by_delete() {
    let harness = TestHarness::new();
    let config = harness.configurations.add(
        fhir_config(harness.client_id, "Patient", FhirVersion::R4).with_id(Uuid::from_u128(42)),
    );
    let stored = patient("7", 10);
    harness.server.seed(stored.clone());
    let key = ResourceEndpointKey::by_id(Uuid::from_u128(42), FhirVersion::R4, "Patient", "7", false);
    harness.cache.put(&key, &stored).unwrap();

    let hit = harness
        .fhir
        .find(&SyncContext::system(), &config, "Patient", "7")
        .unwrap();
    assert_eq!(hit, Some(stored));
    assert_eq!(harness.server.calls().reads, 0);

    harness
        .fhir
        .delete(&SyncContext::system(), &config, "Patient", "7")
        .unwrap();
    assert!(harness.cache.get(&key).unwrap().is_none());

    let after = harness
        .fhir
        .find(&SyncContext::system(), &config, "Patient", "7")
        .unwrap();
    assert!(after.is_none());
    assert_eq!(harness.server.calls().reads, 1);
}

#[test]
fn refused_stale_write_evicts_both_caches() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    harness.server.seed(patient("7", 10));
    let ctx = harness.ctx();

    let cached = harness.fhir.find(&ctx, &config, "Patient", "7").unwrap().unwrap();
    harness.server.seed(patient("7", 20).with_version("2"));
    let err = harness.fhir.save(&ctx, &config, &cached).unwrap_err();
    assert!(err.is_conflict());
    assert!(ctx.request_cache().is_empty());

    let current = harness.fhir.find(&ctx, &config, "Patient", "7").unwrap().unwrap();
    assert_eq!(current.version(), Some("2"));
    assert_eq!(harness.server.calls().reads, 2);
}

#[test]
fn save_forces_a_fresh_fetch() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    harness.server.seed(patient("7", 10));

    harness.fhir.find(&harness.ctx(), &config, "Patient", "7").unwrap();
    harness.fhir.find(&harness.ctx(), &config, "Patient", "7").unwrap();
    assert_eq!(harness.server.calls().reads, 1);

    let mut changed = harness.server.get("Patient", "7").unwrap();
    changed.body_mut()["active"] = serde_json::Value::Bool(false);
    harness.fhir.save(&harness.ctx(), &config, &changed).unwrap();

    let fresh = harness
        .fhir
        .find(&harness.ctx(), &config, "Patient", "7")
        .unwrap()
        .unwrap();
    assert_eq!(harness.server.calls().reads, 2);
    assert_eq!(fresh.version(), Some("2"));
    assert_eq!(fresh.body()["active"], serde_json::Value::Bool(false));
}

#[test]
fn request_cache_answers_within_one_message() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    harness.server.seed(patient("7", 10));
    let ctx = harness.ctx();

    harness.fhir.find(&ctx, &config, "Patient", "7").unwrap();
    let key = ResourceEndpointKey::by_id(config.id, FhirVersion::R4, "Patient", "7", false);
    harness.cache.clear(&key.namespace()).unwrap();
    let again = harness.fhir.find(&ctx, &config, "Patient", "7").unwrap();

    assert!(again.is_some());
    assert_eq!(harness.server.calls().reads, 1);
    assert_eq!(ctx.request_cache().len(), 1);
}

#[test]
fn refreshed_lookups_always_fetch() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    harness.server.seed(patient("7", 10));

    for _ in 0..3 {
        harness
            .fhir
            .find_refreshed(&harness.ctx(), &config, "Patient", "7")
            .unwrap();
    }
    assert_eq!(harness.server.calls().reads, 3);
}

#[test]
fn absent_resources_are_not_cached() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);

    assert!(harness.fhir.find(&harness.ctx(), &config, "Patient", "7").unwrap().is_none());
    harness.server.seed(patient("7", 10));
    assert!(harness.fhir.find(&harness.ctx(), &config, "Patient", "7").unwrap().is_some());
    assert_eq!(harness.server.calls().reads, 2);
}

#[test]
fn identifier_and_code_lookups_are_cached() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Patient", FhirVersion::R4);
    harness.server.seed(patient("7", 10));
    let mrn = SystemCodeValue::with_system("urn:mrn", "MRN-7");

    let first = harness
        .fhir
        .find_by_identifier(&harness.ctx(), &config, "Patient", &mrn)
        .unwrap();
    let second = harness
        .fhir
        .find_by_identifier(&harness.ctx(), &config, "Patient", &mrn)
        .unwrap();
    assert_eq!(first.as_ref().and_then(|p| p.id()), Some("7"));
    assert_eq!(first, second);
    assert_eq!(harness.server.calls().searches, 1);

    harness
        .fhir
        .find_refreshed_by_identifier(&harness.ctx(), &config, "Patient", &mrn)
        .unwrap();
    assert_eq!(harness.server.calls().searches, 2);

    let unknown = SystemCodeValue::new(None, "nope");
    assert!(harness
        .fhir
        .find_by_code(&harness.ctx(), &config, "Patient", &unknown)
        .unwrap()
        .is_none());
    assert!(harness
        .fhir
        .find_refreshed_by_code(&harness.ctx(), &config, "Patient", &unknown)
        .unwrap()
        .is_none());
    assert_eq!(harness.server.calls().searches, 4);
}

#[test]
fn local_endpoint_never_calls_out() {
    let harness = TestHarness::new();
    let config = harness
        .configurations
        .add(registry_config(harness.client_id, "Patient"));
    harness.server.seed(patient("7", 10));

    assert!(harness.fhir.find(&harness.ctx(), &config, "Patient", "7").unwrap().is_none());
    assert_eq!(harness.server.calls().fetches(), 0);
    assert_eq!(harness.server.clients_created(), 0);
}

#[test]
fn one_client_per_endpoint() {
    let harness = TestHarness::new();
    let patients = harness.add_fhir_config("Patient", FhirVersion::R4);
    let observations = harness.add_fhir_config("Observation", FhirVersion::R4);

    harness.fhir.find(&harness.ctx(), &patients, "Patient", "1").unwrap();
    harness.fhir.find(&harness.ctx(), &observations, "Observation", "1").unwrap();

    assert_eq!(harness.server.clients_created(), 1);
    assert_eq!(harness.cache.stats().misses, 2);
}
