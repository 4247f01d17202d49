//! Result merging: nested contributions and flattened map results.
//!
//! Every merge checks for key collisions and fails instead of overwriting.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tandem_core::{ResultMap, Value};

use super::operation::ConfigError;

/// Merge pre-computed mapping contributions into one map.
///
/// # Errors
///
/// Returns [`ConfigError::KeyCollision`] when two contributions share a key
/// or a contribution key equals the name of an operation in the group.
pub fn merge_contributions(
    contributions: Vec<BTreeMap<String, Value>>,
    operation_names: &HashSet<String>,
) -> Result<ResultMap, ConfigError> {
    let mut merged = ResultMap::new();
    for contribution in contributions {
        for (key, value) in contribution {
            if merged.contains_key(&key) || operation_names.contains(&key) {
                return Err(ConfigError::KeyCollision { key });
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// Combine runner results with merged contributions.
///
/// With `flatten`, each map-valued result is replaced by its entries. A
/// nested key that matches any contribution key, any result name, or an
/// entry already flattened from a sibling is a collision. Non-map results
/// are never flattened.
///
/// # Errors
///
/// Returns [`ConfigError::KeyCollision`] on the first conflicting key.
pub fn merge_results(
    contributions: ResultMap,
    results: ResultMap,
    flatten: bool,
) -> Result<ResultMap, ConfigError> {
    let start_keys: BTreeSet<String> = contributions
        .keys()
        .chain(results.keys())
        .cloned()
        .collect();

    let mut merged = contributions;
    let mut plain = Vec::with_capacity(results.len());

    for (name, value) in results {
        match value {
            Value::Map(nested) if flatten => {
                for (key, value) in nested {
                    if start_keys.contains(&key) || merged.contains_key(&key) {
                        return Err(ConfigError::KeyCollision { key });
                    }
                    merged.insert(key, value);
                }
            }
            value => plain.push((name, value)),
        }
    }

    for (name, value) in plain {
        if merged.insert(name.clone(), value).is_some() {
            return Err(ConfigError::KeyCollision { key: name });
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn map(entries: &[(&str, i64)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn flattens_map_results() {
        let mut results = ResultMap::new();
        results.insert("scan".to_string(), Value::Map(map(&[("peak", 3), ("floor", -90)])));
        results.insert("power".to_string(), Value::Int(10));
        let merged = merge_results(ResultMap::new(), results, true).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["peak"], Value::Int(3));
        assert!(!merged.contains_key("scan"));
    }

    #[test]
    fn keeps_maps_nested_without_flatten() {
        let mut results = ResultMap::new();
        results.insert("scan".to_string(), Value::Map(map(&[("peak", 3)])));
        let merged = merge_results(ResultMap::new(), results, false).unwrap();
        assert_eq!(merged["scan"], Value::Map(map(&[("peak", 3)])));
    }

    #[test]
    fn arrays_are_never_flattened() {
        let mut results = ResultMap::new();
        results.insert("trace".to_string(), Value::from(vec![1, 2, 3]));
        let merged = merge_results(ResultMap::new(), results, true).unwrap();
        assert!(matches!(merged["trace"], Value::Array(_)));
    }

    #[test]
    fn nested_key_colliding_with_result_name_fails() {
        let mut results = ResultMap::new();
        results.insert("a".to_string(), Value::Map(map(&[("b", 1)])));
        results.insert("b".to_string(), Value::Int(2));
        assert_eq!(
            merge_results(ResultMap::new(), results, true).unwrap_err(),
            ConfigError::KeyCollision { key: "b".to_string() }
        );
    }

    #[test]
    fn sibling_nested_maps_colliding_fails() {
        let mut results = ResultMap::new();
        results.insert("a".to_string(), Value::Map(map(&[("x", 1)])));
        results.insert("b".to_string(), Value::Map(map(&[("x", 2)])));
        assert_eq!(
            merge_results(ResultMap::new(), results, true).unwrap_err(),
            ConfigError::KeyCollision { key: "x".to_string() }
        );
    }

    #[test]
    fn nested_key_colliding_with_contribution_fails() {
        let contributions = map(&[("x", 0)]);
        let mut results = ResultMap::new();
        results.insert("a".to_string(), Value::Map(map(&[("x", 1)])));
        assert!(merge_results(contributions, results, true).is_err());
    }

    #[test]
    fn contributions_merge_and_collide() {
        let names: HashSet<String> = ["op".to_string()].into_iter().collect();
        let merged =
            merge_contributions(vec![map(&[("a", 1)]), map(&[("b", 2)])], &names).unwrap();
        assert_eq!(merged.len(), 2);

        assert!(merge_contributions(vec![map(&[("a", 1)]), map(&[("a", 2)])], &names).is_err());
        assert!(merge_contributions(vec![map(&[("op", 1)])], &names).is_err());
    }

    proptest! {
        #[test]
        fn disjoint_nested_maps_flatten_losslessly(
            groups in proptest::collection::btree_map("[a-z]{1,6}", 0i64..100, 0..20)
        ) {
            // Split the generated keys across two nested results named with a
            // prefix that generated keys cannot carry.
            let mut left = BTreeMap::new();
            let mut right = BTreeMap::new();
            for (i, (k, v)) in groups.iter().enumerate() {
                if i % 2 == 0 {
                    left.insert(k.clone(), Value::Int(*v));
                } else {
                    right.insert(k.clone(), Value::Int(*v));
                }
            }
            let mut results = ResultMap::new();
            results.insert("_left".to_string(), Value::Map(left));
            results.insert("_right".to_string(), Value::Map(right));

            let merged = merge_results(ResultMap::new(), results, true).unwrap();
            prop_assert_eq!(merged.len(), groups.len());
            for (k, v) in &groups {
                prop_assert_eq!(&merged[k], &Value::Int(*v));
            }
        }
    }
}
