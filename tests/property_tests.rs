//! Property-Based Tests for fpack
//!
//! These tests verify:
//! - Coordinate text round-trips (to_string → parse)
//! - Parameter merge precedence over arbitrary layer stacks
//! - Config ordering always puts dependencies first

use proptest::prelude::*;

use fpack::ArtifactCoordinate;
use fpack::descriptor::{ConfigId, FeatureSpec, ParameterSpec};
use fpack::logic::configs::order_configs;
use fpack::logic::params::{OverrideStack, Scope, merge};

// =============================================================================
// Coordinate Property Tests
// =============================================================================

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9.-]{0,8}"
}

fn coordinate_strategy() -> impl Strategy<Value = ArtifactCoordinate> {
    (
        segment(),
        segment(),
        "[0-9]{1,3}(\\.[0-9]{1,3}){0,2}",
        proptest::option::of(segment()),
        proptest::option::of("[a-z]{1,4}"),
    )
        .prop_map(|(group, artifact, version, classifier, extension)| {
            let mut coordinate = ArtifactCoordinate::new(group, artifact, version);
            if let Some(classifier) = classifier {
                coordinate = coordinate.with_classifier(classifier);
            }
            if let Some(extension) = extension {
                coordinate = coordinate.with_extension(extension);
            }
            coordinate
        })
}

proptest! {
    /// ArtifactCoordinate: to_string → parse round-trip is identity
    #[test]
    fn coordinate_roundtrip(coordinate in coordinate_strategy()) {
        let parsed: ArtifactCoordinate = coordinate.to_string().parse().expect("Should parse");
        prop_assert_eq!(coordinate, parsed);
    }

    /// ArtifactCoordinate: ga() ignores everything after the artifact
    #[test]
    fn coordinate_ga_is_prefix(coordinate in coordinate_strategy()) {
        let text = coordinate.to_string();
        let ga = coordinate.ga();
        prop_assert!(text.starts_with(&ga));
        prop_assert_eq!(ga.matches(':').count(), 1);
    }
}

// =============================================================================
// Merge Property Tests
// =============================================================================

fn merge_spec() -> FeatureSpec {
    FeatureSpec::new("specA")
        .with_param(ParameterSpec::id("name"))
        .with_param(ParameterSpec::new("p").with_default("default"))
}

fn coord() -> ArtifactCoordinate {
    "org.test:fp1:1.0".parse().unwrap()
}

/// (depth, is_override, value) per layer; the layer index is its sequence
fn layers_strategy() -> impl Strategy<Value = Vec<(usize, bool, String)>> {
    prop::collection::vec((0usize..4, any::<bool>(), "[a-z]{1,6}"), 1..8)
}

fn stack_of(layers: &[(usize, bool, String)]) -> OverrideStack {
    let mut stack = OverrideStack::new();
    for (seq, (depth, is_override, value)) in layers.iter().enumerate() {
        let scope = if *is_override {
            Scope::inclusion_override(*depth)
        } else {
            Scope::declared(*depth)
        };
        let mut values = indexmap::IndexMap::new();
        values.insert("name".to_string(), "a1".to_string());
        values.insert("p".to_string(), value.clone());
        stack.push(scope, seq as u64, values);
    }
    stack
}

proptest! {
    /// Merge: the shallowest scope wins, declared beats override, later beats earlier
    #[test]
    fn merge_picks_most_specific(layers in layers_strategy()) {
        let stack = stack_of(&layers);
        let merged = merge(&coord(), &merge_spec(), &stack).expect("Should merge");

        let expected = layers
            .iter()
            .enumerate()
            .max_by_key(|(seq, (depth, is_override, _))| {
                (std::cmp::Reverse(*depth), !*is_override, *seq)
            })
            .map(|(_, (_, _, value))| value.clone());
        prop_assert_eq!(merged.get("p").cloned(), expected);
        prop_assert_eq!(merged.get("name").map(String::as_str), Some("a1"));
    }

    /// Merge: layer insertion order does not change the result
    #[test]
    fn merge_ignores_push_order(layers in layers_strategy()) {
        let forward = stack_of(&layers);
        let mut backward = OverrideStack::new();
        for layer in forward.layers().iter().rev() {
            backward.push(layer.scope, layer.seq, layer.values.clone());
        }
        prop_assert_eq!(
            merge(&coord(), &merge_spec(), &forward).expect("Should merge"),
            merge(&coord(), &merge_spec(), &backward).expect("Should merge")
        );
    }

    /// Merge: a second distinct id value is always a conflict
    #[test]
    fn merge_rejects_id_reassignment(first in "[a-z]{1,4}", second in "[a-z]{1,4}") {
        prop_assume!(first != second);
        let mut stack = OverrideStack::new();
        for (seq, value) in [&first, &second].into_iter().enumerate() {
            let mut values = indexmap::IndexMap::new();
            values.insert("name".to_string(), value.clone());
            stack.push(Scope::declared(0), seq as u64, values);
        }
        prop_assert!(merge(&coord(), &merge_spec(), &stack).is_err());
    }
}

// =============================================================================
// Config Ordering Property Tests
// =============================================================================

/// Config i may depend on any config declared after it, so the declared
/// order is usually wrong and the graph is always acyclic.
fn dag_strategy() -> impl Strategy<Value = (Vec<Option<ConfigId>>, Vec<Vec<ConfigId>>)> {
    (1usize..8).prop_flat_map(|n| {
        prop::collection::vec(prop::collection::vec(any::<bool>(), n), n).prop_map(move |matrix| {
            let ids: Vec<Option<ConfigId>> = (0..n)
                .map(|i| Some(ConfigId::new("model", format!("config{i}"))))
                .collect();
            let deps: Vec<Vec<ConfigId>> = (0..n)
                .map(|i| {
                    ((i + 1)..n)
                        .filter(|&j| matrix[i][j])
                        .map(|j| ConfigId::new("model", format!("config{j}")))
                        .collect()
                })
                .collect();
            (ids, deps)
        })
    })
}

proptest! {
    /// order_configs: output is a permutation with every dependency first
    #[test]
    fn order_respects_dependencies((ids, deps) in dag_strategy()) {
        let order = order_configs(&ids, &deps).expect("Acyclic graph should order");
        prop_assert_eq!(order.len(), ids.len());

        let position: Vec<usize> = {
            let mut position = vec![usize::MAX; ids.len()];
            for (pos, &i) in order.iter().enumerate() {
                position[i] = pos;
            }
            position
        };
        prop_assert!(position.iter().all(|&p| p != usize::MAX));

        for (i, config_deps) in deps.iter().enumerate() {
            for dep in config_deps {
                let j = ids.iter().position(|id| id.as_ref() == Some(dep)).unwrap();
                prop_assert!(position[j] < position[i]);
            }
        }
    }
}
