//! Ancestor chains over the FHIR-side repository.

use fhirsync_engine::{parent_at, CacheStore};
use fhirsync_protocol::{CacheNamespace, ExternalResource, FhirVersion};
use fhirsync_testkit::prelude::{
    location, locations_from_links, organization, parent_links_strategy, reachable_chain_len,
    TestHarness,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn ids(chain: &[ExternalResource]) -> Vec<String> {
    chain
        .iter()
        .filter_map(|r| r.id().map(str::to_string))
        .collect()
}

#[test]
fn chain_runs_from_leaf_to_root() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L0", None));
    harness.server.seed(location("L1", Some("L0")));
    harness.server.seed(location("L2", Some("L1")));
    let hierarchy = harness.hierarchy();

    let chain = hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L2"), "partOf", &parent_at("/partOf"))
        .unwrap();
    assert_eq!(ids(&chain), vec!["L2", "L1", "L0"]);
    assert_eq!(harness.server.calls().reads, 3);

    let again = hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L2"), "partOf", &parent_at("/partOf"))
        .unwrap();
    assert_eq!(ids(&again), vec!["L2", "L1", "L0"]);
    assert_eq!(harness.server.calls().reads, 3);
}

#[test]
fn cycle_stops_the_walk() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L0", Some("L1")));
    harness.server.seed(location("L1", Some("L0")));

    let chain = harness
        .hierarchy()
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L0"), "partOf", &parent_at("/partOf"))
        .unwrap();

    assert_eq!(ids(&chain), vec!["L0", "L1"]);
}

#[test]
fn self_reference_yields_only_the_start() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Organization", FhirVersion::R4);
    harness.server.seed(organization("O1", Some("O1")));

    let chain = harness
        .hierarchy()
        .find_with_parents(&harness.ctx(), &config, "Organization", Some("O1"), "partOf", &parent_at("/partOf"))
        .unwrap();

    assert_eq!(ids(&chain), vec!["O1"]);
}

#[test]
fn missing_parent_ends_the_chain() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L1", Some("gone")));

    let chain = harness
        .hierarchy()
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "partOf", &parent_at("/partOf"))
        .unwrap();

    assert_eq!(ids(&chain), vec!["L1"]);
}

#[test]
fn empty_or_unknown_start_yields_nothing() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    let hierarchy = harness.hierarchy();
    let parent = parent_at("/partOf");

    for id in [None, Some(""), Some("nowhere")] {
        let chain = hierarchy
            .find_with_parents(&harness.ctx(), &config, "Location", id, "partOf", &parent)
            .unwrap();
        assert!(chain.is_empty());
    }
    assert_eq!(harness.server.calls().reads, 1);
}

#[test]
fn bundle_wraps_the_chain() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L0", None));
    harness.server.seed(location("L1", Some("L0")));

    let bundle = harness
        .hierarchy()
        .find_bundle_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "partOf", &parent_at("/partOf"))
        .unwrap();

    assert_eq!(bundle["resourceType"], "Bundle");
    assert_eq!(bundle["type"], "collection");
    let entries = bundle["entry"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["resource"]["id"], "L1");
    assert_eq!(entries[1]["resource"]["id"], "L0");
}

#[test]
fn evicted_chain_is_walked_again() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L0", None));
    harness.server.seed(location("L1", Some("L0")));
    let hierarchy = harness.hierarchy();
    let parent = parent_at("/partOf");

    hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "partOf", &parent)
        .unwrap();
    assert!(hierarchy.evict(&config, "Location", "L1", "partOf").unwrap());
    assert!(!hierarchy.evict(&config, "Location", "L1", "partOf").unwrap());

    harness.server.seed(location("L0", Some("L9")));
    harness.server.seed(location("L9", None));
    harness.cache.clear(&CacheNamespace::Resource).unwrap();

    let chain = hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "partOf", &parent)
        .unwrap();
    assert_eq!(ids(&chain), vec!["L1", "L0", "L9"]);
}

#[test]
fn kinds_are_cached_apart() {
    let harness = TestHarness::new();
    let config = harness.add_fhir_config("Location", FhirVersion::R4);
    harness.server.seed(location("L0", None));
    harness.server.seed(location("L1", Some("L0")));
    let hierarchy = harness.hierarchy();

    let by_part_of = hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "partOf", &parent_at("/partOf"))
        .unwrap();
    let organization_of = parent_at("/managingOrganization");
    let by_other = hierarchy
        .find_with_parents(&harness.ctx(), &config, "Location", Some("L1"), "managingOrganization", &organization_of)
        .unwrap();

    assert_eq!(ids(&by_part_of), vec!["L1", "L0"]);
    assert_eq!(ids(&by_other), vec!["L1"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn walk_terminates_on_any_link_shape(
        (links, start) in parent_links_strategy(8)
            .prop_flat_map(|links| {
                let n = links.len();
                (Just(links), 0..n)
            })
    ) {
        let harness = TestHarness::new();
        let config = harness.add_fhir_config("Location", FhirVersion::R4);
        for resource in locations_from_links(&links) {
            harness.server.seed(resource);
        }

        let start_id = format!("L{start}");
        let chain = harness
            .hierarchy()
            .find_with_parents(&harness.ctx(), &config, "Location", Some(start_id.as_str()), "partOf", &parent_at("/partOf"))
            .unwrap();

        let chain_ids = ids(&chain);
        let distinct: HashSet<&String> = chain_ids.iter().collect();
        prop_assert_eq!(distinct.len(), chain_ids.len());
        prop_assert_eq!(chain_ids.len(), reachable_chain_len(&links, start));
        prop_assert_eq!(chain_ids.first(), Some(&start_id));
    }
}
