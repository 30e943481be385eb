//! Similarity measures for the consensus engine.
//!
//! Text similarity is normalized Levenshtein over whitespace-normalized,
//! case-insensitive strings. Structural similarity recurses over JSON
//! values: strings by Levenshtein, numbers by relative distance, arrays
//! per index, objects over the union of keys. Deep-equal values short
//! circuit to 1.

use std::collections::BTreeSet;

use serde_json::Value;

/// Collapse whitespace runs and case before comparison.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similarity of two free-text outputs, in `[0, 1]`.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na == nb {
        return 1.0;
    }
    strsim::normalized_levenshtein(&na, &nb)
}

/// Recursive structural similarity of two JSON values, in `[0, 1]`.
pub fn structural_similarity(a: &Value, b: &Value) -> f64 {
    if std::ptr::eq(a, b) || a == b {
        return 1.0;
    }

    match (a, b) {
        (Value::String(sa), Value::String(sb)) => strsim::normalized_levenshtein(sa, sb),
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(0.0);
            let fb = nb.as_f64().unwrap_or(0.0);
            if fa == fb {
                return 1.0;
            }
            let scale = fa.abs().max(fb.abs());
            if scale == 0.0 {
                return 1.0;
            }
            (1.0 - (fa - fb).abs() / scale).max(0.0)
        }
        // Deep equality already short-circuited, so differing booleans
        // and nulls land here.
        (Value::Bool(_), Value::Bool(_)) => 0.0,
        (Value::Array(aa), Value::Array(ab)) => {
            let max_len = aa.len().max(ab.len());
            if max_len == 0 {
                return 1.0;
            }
            let sum: f64 = aa
                .iter()
                .zip(ab.iter())
                .map(|(x, y)| structural_similarity(x, y))
                .sum();
            sum / max_len as f64
        }
        (Value::Object(oa), Value::Object(ob)) => {
            let keys: BTreeSet<&String> = oa.keys().chain(ob.keys()).collect();
            if keys.is_empty() {
                return 1.0;
            }
            let sum: f64 = keys
                .iter()
                .map(|key| match (oa.get(*key), ob.get(*key)) {
                    (Some(x), Some(y)) => structural_similarity(x, y),
                    _ => 0.0,
                })
                .sum();
            sum / keys.len() as f64
        }
        _ => 0.0,
    }
}

/// Symmetric N×N similarity matrix over generic items.
pub fn matrix<T>(items: &[T], similarity: impl Fn(&T, &T) -> f64) -> Vec<Vec<f64>> {
    let n = items.len();
    let mut result = vec![vec![0.0; n]; n];
    for i in 0..n {
        result[i][i] = 1.0;
        for j in (i + 1)..n {
            let s = similarity(&items[i], &items[j]);
            result[i][j] = s;
            result[j][i] = s;
        }
    }
    result
}

/// Every leaf path of a JSON value in dotted form (`a.b.0.c`).
pub fn leaf_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(value, String::new(), &mut paths);
    paths
}

fn collect_paths(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_paths(child, path, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let path = if prefix.is_empty() {
                    index.to_string()
                } else {
                    format!("{prefix}.{index}")
                };
                collect_paths(child, path, out);
            }
        }
        _ => out.push(prefix),
    }
}

/// Look up a dotted leaf path inside a JSON value.
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_identical_after_normalization() {
        assert_eq!(text_similarity("Hello  World", "hello world"), 1.0);
        assert_eq!(text_similarity("YES", "yes"), 1.0);
    }

    #[test]
    fn test_text_disjoint_is_low() {
        assert!(text_similarity("yes", "no") < 0.5);
    }

    #[test]
    fn test_text_close_strings() {
        let s = text_similarity("the quick brown fox", "the quick brown fix");
        assert!(s > 0.9, "similarity {s}");
    }

    #[test]
    fn test_structural_deep_equal() {
        let a = json!({"x": [1, 2, {"y": true}]});
        assert_eq!(structural_similarity(&a, &a.clone()), 1.0);
    }

    #[test]
    fn test_structural_numbers_relative() {
        let s = structural_similarity(&json!(90), &json!(100));
        assert!((s - 0.9).abs() < 1e-9, "similarity {s}");
        assert_eq!(structural_similarity(&json!(0), &json!(0)), 1.0);
        assert_eq!(structural_similarity(&json!(1), &json!(-1)), 0.0);
    }

    #[test]
    fn test_structural_bools() {
        assert_eq!(structural_similarity(&json!(true), &json!(true)), 1.0);
        assert_eq!(structural_similarity(&json!(true), &json!(false)), 0.0);
    }

    #[test]
    fn test_structural_type_mismatch_zero() {
        assert_eq!(structural_similarity(&json!("1"), &json!(1)), 0.0);
        assert_eq!(structural_similarity(&json!(null), &json!(0)), 0.0);
    }

    #[test]
    fn test_structural_arrays_divide_by_max_len() {
        // Two equal elements out of max length 3.
        let s = structural_similarity(&json!([1, 2]), &json!([1, 2, 3]));
        assert!((s - 2.0 / 3.0).abs() < 1e-9, "similarity {s}");
    }

    #[test]
    fn test_structural_objects_union_keys() {
        // "a" matches (1.0), "b" differs wildly, "c" missing on one side.
        let a = json!({"a": 1, "b": 100});
        let b = json!({"a": 1, "b": 1, "c": true});
        let s = structural_similarity(&a, &b);
        let expected = (1.0 + 0.01 + 0.0) / 3.0;
        assert!((s - expected).abs() < 1e-9, "similarity {s}");
    }

    #[test]
    fn test_matrix_symmetric_with_unit_diagonal() {
        let texts = ["yes", "yes", "no"];
        let m = matrix(&texts, |a, b| text_similarity(a, b));
        for i in 0..3 {
            assert_eq!(m[i][i], 1.0);
            for j in 0..3 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
        assert_eq!(m[0][1], 1.0);
        assert!(m[0][2] < 0.8);
    }

    #[test]
    fn test_leaf_paths_nested() {
        let value = json!({"a": {"b": 1}, "c": [true, {"d": "x"}]});
        let mut paths = leaf_paths(&value);
        paths.sort();
        assert_eq!(paths, vec!["a.b", "c.0", "c.1.d"]);
    }

    #[test]
    fn test_value_at_path() {
        let value = json!({"a": {"b": [10, 20]}});
        assert_eq!(value_at_path(&value, "a.b.1"), Some(&json!(20)));
        assert_eq!(value_at_path(&value, "a.missing"), None);
    }
}
