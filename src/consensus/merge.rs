//! Merge policies for reconciling divergent model outputs.
//!
//! Field-overwrite is for qualitative/classification fields; weighted
//! average is for numeric scoring. In the weighted path a response that is
//! missing a field contributes 0 to that field's average rather than being
//! excluded — scores must reproduce exactly across runs with the same
//! inputs.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Caller-selected merge policy.
#[derive(Debug, Clone)]
pub enum MergeStrategy {
    /// Last-valid-wins per key, in the caller-supplied provider order
    FieldOverwrite,
    /// Per-field averages plus a single weighted scalar
    WeightedAverage { weights: HashMap<String, f64> },
}

/// Overwrite merge: providers are iterated in the fixed priority order the
/// caller supplied; later entries overwrite earlier ones on key collision.
pub fn merge_field_overwrite(valid_responses: &[(String, Value)]) -> Map<String, Value> {
    let mut merged = Map::new();
    for (_, response) in valid_responses {
        if let Value::Object(fields) = response {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Weighted merge: average every numeric field across ALL valid responses
/// (absent fields count as 0), then fold the averages into one scalar with
/// the supplied weights. Returns the merged fields (averages plus the
/// `weighted_score` scalar) and the per-field averages.
pub fn merge_weighted_average(
    valid_responses: &[(String, Value)],
    weights: &HashMap<String, f64>,
) -> (Map<String, Value>, HashMap<String, f64>) {
    let mut merged = Map::new();
    let mut field_scores = HashMap::new();
    if valid_responses.is_empty() {
        return (merged, field_scores);
    }

    // Union of numeric field names, ordered for deterministic output.
    let mut fields = BTreeSet::new();
    for (_, response) in valid_responses {
        if let Value::Object(object) = response {
            for (key, value) in object {
                if value.is_number() {
                    fields.insert(key.clone());
                }
            }
        }
    }

    let count = valid_responses.len() as f64;
    for field in &fields {
        let sum: f64 = valid_responses
            .iter()
            .map(|(_, response)| {
                response
                    .get(field)
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
            })
            .sum();
        let average = sum / count;
        field_scores.insert(field.clone(), average);
        merged.insert(field.clone(), json_number(average));
    }

    // Fold in sorted key order so the scalar is bit-identical across runs.
    let mut weighted: Vec<(&String, &f64)> = weights.iter().collect();
    weighted.sort_by_key(|(field, _)| *field);
    let scalar: f64 = weighted
        .iter()
        .map(|(field, weight)| field_scores.get(*field).copied().unwrap_or(0.0) * **weight)
        .sum();
    merged.insert("weighted_score".to_string(), json_number(scalar));

    (merged, field_scores)
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn votes(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs
            .iter()
            .map(|(p, v)| (p.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_field_overwrite_later_wins() {
        let merged = merge_field_overwrite(&votes(&[
            ("a", json!({"genre": "essay", "tone": "formal"})),
            ("b", json!({"genre": "report"})),
        ]));

        assert_eq!(merged["genre"], "report");
        assert_eq!(merged["tone"], "formal");
    }

    #[test]
    fn test_weighted_average_reference_case() {
        let weights = HashMap::from([("quality".to_string(), 0.5), ("rigor".to_string(), 0.5)]);
        let (merged, scores) = merge_weighted_average(
            &votes(&[
                ("a", json!({"quality": 80, "rigor": 90})),
                ("b", json!({"quality": 60, "rigor": 70})),
            ]),
            &weights,
        );

        assert_eq!(scores["quality"], 70.0);
        assert_eq!(scores["rigor"], 80.0);
        assert_eq!(merged["weighted_score"], json!(75.0));
    }

    #[test]
    fn test_missing_field_counts_as_zero() {
        let weights = HashMap::from([("quality".to_string(), 1.0)]);
        let (_, scores) = merge_weighted_average(
            &votes(&[
                ("a", json!({"quality": 80})),
                ("b", json!({"rigor": 70})),
            ]),
            &weights,
        );

        // 80 and an implicit 0 average to 40; b is not excluded.
        assert_eq!(scores["quality"], 40.0);
    }

    #[test]
    fn test_non_numeric_fields_ignored_in_weighted_merge() {
        let weights = HashMap::from([("score".to_string(), 1.0)]);
        let (merged, scores) = merge_weighted_average(
            &votes(&[("a", json!({"score": 10, "comment": "fine"}))]),
            &weights,
        );

        assert_eq!(scores["score"], 10.0);
        assert!(!merged.contains_key("comment"));
    }

    #[test]
    fn test_empty_responses_merge_to_nothing() {
        let (merged, scores) = merge_weighted_average(&[], &HashMap::new());
        assert!(merged.is_empty());
        assert!(scores.is_empty());
    }
}
