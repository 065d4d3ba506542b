//! Property-based test generators using proptest.

use crate::fixtures::instant;
use fhirsync_protocol::{ExternalResource, ProcessedItemFingerprint};
use proptest::prelude::*;
use serde_json::json;

/// Strategy for registry-style ids: 11 alphanumerics starting with a letter.
pub fn registry_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9]{10}").expect("Invalid regex")
}

/// Strategy for FHIR logical ids.
pub fn fhir_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9\\-.]{1,64}").expect("Invalid regex")
}

/// Strategy for fingerprints of patients.
pub fn fingerprint_strategy() -> impl Strategy<Value = ProcessedItemFingerprint> {
    ("[0-9]{1,6}", 0i64..1_000_000, any::<bool>()).prop_map(|(id, seconds, deleted)| {
        ProcessedItemFingerprint::new(format!("Patient/{id}"), instant(seconds), deleted)
    })
}

/// Strategy for parent links of `1..=max_nodes` nodes.
///
/// Entry `i` is the index of the parent of node `i`, or `None` for a root.
/// Links may point anywhere, so the graph can contain cycles and
/// self-references.
pub fn parent_links_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<Option<usize>>> {
    (1..=max_nodes.max(1)).prop_flat_map(|n| prop::collection::vec(prop::option::of(0..n), n))
}

/// Builds locations `L0..Ln` wired by `links`.
pub fn locations_from_links(links: &[Option<usize>]) -> Vec<ExternalResource> {
    links
        .iter()
        .enumerate()
        .map(|(i, parent)| {
            let mut body = json!({"resourceType": "Location", "id": format!("L{i}")});
            if let Some(parent) = parent {
                body["partOf"] = json!({"reference": format!("Location/L{parent}")});
            }
            ExternalResource::from_fhir_json(body).expect("generated location")
        })
        .collect()
}

/// Number of distinct nodes reachable from `start` by following `links`,
/// `start` included.
pub fn reachable_chain_len(links: &[Option<usize>], start: usize) -> usize {
    let mut seen = vec![false; links.len()];
    let mut current = Some(start);
    let mut count = 0;
    while let Some(node) = current {
        if seen[node] {
            break;
        }
        seen[node] = true;
        count += 1;
        current = links[node];
    }
    count
}
