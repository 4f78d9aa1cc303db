//! In-process streaming evaluator (SPEC_FULL.md §4.4, §4.5).
//!
//! Applies a query document directly against an already-materialized JSON
//! document, with no SQL involved. Used for three things:
//! - post-filtering rows against a [`crate::predicate::CompiledPredicate`]'s
//!   `unresolved` remainder,
//! - the T3 `$match` stream stage when a predicate can't be translated at all,
//! - the hybrid `$text` fallback (SPEC_FULL.md §4.4 "Hybrid $text").

use serde_json::{Map, Value as Json};

use crate::error::{QueryError, Result};

fn get_path<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    if path == "$" {
        return Some(doc);
    }
    let mut cur = doc;
    for segment in path.split('.') {
        match cur {
            Json::Object(m) => cur = m.get(segment)?,
            Json::Array(a) => {
                let idx: usize = segment.parse().ok()?;
                cur = a.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(cur)
}

/// Evaluates a full query document against a document (implicit top-level AND).
pub fn matches(doc: &Json, query: &Json) -> Result<bool> {
    let obj = match query {
        Json::Object(m) => m,
        Json::Null => return Ok(true),
        _ => return Err(QueryError::MalformedQuery("query must be an object".into())),
    };
    matches_object(doc, obj)
}

fn matches_object(doc: &Json, obj: &Map<String, Json>) -> Result<bool> {
    for (key, value) in obj {
        let ok = match key.as_str() {
            "$and" => value
                .as_array()
                .ok_or_else(|| QueryError::MalformedQuery("$and must be an array".into()))?
                .iter()
                .map(|sub| matches(doc, sub))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|b| b),
            "$or" => value
                .as_array()
                .ok_or_else(|| QueryError::MalformedQuery("$or must be an array".into()))?
                .iter()
                .map(|sub| matches(doc, sub))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            "$nor" => !value
                .as_array()
                .ok_or_else(|| QueryError::MalformedQuery("$nor must be an array".into()))?
                .iter()
                .map(|sub| matches(doc, sub))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            "$text" => {
                let search = value
                    .as_object()
                    .ok_or_else(|| QueryError::MalformedQuery("$text requires an object".into()))?;
                let query_str = search
                    .get("$search")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| QueryError::MalformedQuery("$text requires $search".into()))?;
                let fields: Option<Vec<&str>> = search
                    .get("$fields")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str()).collect());
                text_search(doc, query_str, fields.as_deref())
            }
            _ if key.starts_with('$') => {
                return Err(QueryError::MalformedQuery(format!("unknown operator {key}")));
            }
            path => {
                let value_at = get_path(doc, path);
                field_matches(value_at, value)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(value: Option<&Json>, spec: &Json) -> Result<bool> {
    let ops: Map<String, Json> = match spec {
        Json::Object(m) if !m.is_empty() && m.keys().all(|k| k.starts_with('$')) => m.clone(),
        other => Map::from_iter([("$eq".to_string(), other.clone())]),
    };

    let null = Json::Null;
    let v = value.unwrap_or(&null);

    for (op, arg) in &ops {
        let ok = match op.as_str() {
            "$eq" => v == arg,
            "$ne" => v != arg,
            "$gt" => docq_types::compare_values(v, arg) == std::cmp::Ordering::Greater,
            "$gte" => docq_types::compare_values(v, arg) != std::cmp::Ordering::Less,
            "$lt" => docq_types::compare_values(v, arg) == std::cmp::Ordering::Less,
            "$lte" => docq_types::compare_values(v, arg) != std::cmp::Ordering::Greater,
            "$in" => arg.as_array().is_some_and(|a| a.contains(v)),
            "$nin" => arg.as_array().is_some_and(|a| !a.contains(v)),
            "$exists" => {
                let want = arg.as_bool().unwrap_or(true);
                want == value.is_some_and(|v| !v.is_null())
            }
            "$mod" => {
                let arr = arg
                    .as_array()
                    .ok_or_else(|| QueryError::MalformedQuery("$mod requires an array".into()))?;
                if arr.len() != 2 {
                    return Err(QueryError::MalformedQuery("$mod requires [divisor, remainder]".into()));
                }
                let divisor = arr[0].as_i64().unwrap_or(1);
                let remainder = arr[1].as_i64().unwrap_or(0);
                v.as_i64().is_some_and(|n| divisor != 0 && n % divisor == remainder)
            }
            "$size" => v
                .as_array()
                .is_some_and(|a| a.len() as i64 == arg.as_i64().unwrap_or(-1)),
            "$type" => {
                let ty = docq_types::BsonType::from_query_arg(arg);
                ty.is_some_and(|t| docq_types::classify(v) == t)
            }
            "$all" => {
                let arr = arg
                    .as_array()
                    .ok_or_else(|| QueryError::MalformedQuery("$all requires an array".into()))?;
                v.as_array()
                    .is_some_and(|vals| arr.iter().all(|needle| vals.contains(needle)))
            }
            "$elemMatch" => v.as_array().is_some_and(|vals| {
                vals.iter().any(|item| matches(item, arg).unwrap_or(false))
            }),
            "$contains" => {
                let needle = arg.as_str().unwrap_or_default().to_lowercase();
                v.as_str().is_some_and(|s| s.to_lowercase().contains(&needle))
            }
            "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| QueryError::MalformedQuery("$regex requires a string".into()))?;
                let flags = ops
                    .get("$options")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                regex_matches(v, pattern, flags)?
            }
            "$options" => true, // consumed alongside $regex
            "$not" => !field_matches(value, arg)?,
            other => return Err(QueryError::MalformedQuery(format!("unknown operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn regex_matches(v: &Json, pattern: &str, flags: &str) -> Result<bool> {
    let Some(s) = v.as_str() else { return Ok(false) };
    let mut builder = regex::RegexBuilder::new(pattern);
    builder.case_insensitive(flags.contains('i'));
    builder.multi_line(flags.contains('m'));
    builder.dot_matches_new_line(flags.contains('s'));
    let re = builder
        .build()
        .map_err(|e| QueryError::MalformedQuery(format!("invalid $regex: {e}")))?;
    Ok(re.is_match(s))
}

fn fold_diacritics(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

fn normalize_text(s: &str) -> String {
    s.to_lowercase().chars().map(fold_diacritics).collect()
}

/// Case-folded, diacritic-insensitive substring search across a document's
/// string leaves (or just `fields` when given). Public entry point used by
/// the executor's `StreamStage::Text` hybrid `$text` fallback
/// (SPEC_FULL.md §4.4 "Hybrid $text").
pub fn text_filter(doc: &Json, query: &str, fields: Option<&[&str]>) -> bool {
    text_search(doc, query, fields)
}

/// Case-folded, diacritic-insensitive substring search across a document's
/// string leaves (or just `fields` when given).
fn text_search(doc: &Json, query: &str, fields: Option<&[&str]>) -> bool {
    let needle = normalize_text(query);
    match fields {
        Some(paths) => paths.iter().any(|p| {
            get_path(doc, p)
                .and_then(Json::as_str)
                .is_some_and(|s| normalize_text(s).contains(&needle))
        }),
        None => any_string_leaf(doc, &needle),
    }
}

fn any_string_leaf(value: &Json, needle: &str) -> bool {
    match value {
        Json::String(s) => normalize_text(s).contains(needle),
        Json::Array(a) => a.iter().any(|v| any_string_leaf(v, needle)),
        Json::Object(m) => m.values().any(|v| any_string_leaf(v, needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_and_range_match() {
        let doc = json!({"age": 42});
        assert!(matches(&doc, &json!({"age": 42})).unwrap());
        assert!(matches(&doc, &json!({"age": {"$gte": 40, "$lte": 45}})).unwrap());
        assert!(!matches(&doc, &json!({"age": {"$lt": 40}})).unwrap());
    }

    #[test]
    fn exists_false_matches_absent_and_null() {
        let absent = json!({});
        let null = json!({"a": null});
        assert!(matches(&absent, &json!({"a": {"$exists": false}})).unwrap());
        assert!(matches(&null, &json!({"a": {"$exists": false}})).unwrap());
    }

    #[test]
    fn regex_with_options() {
        let doc = json!({"name": "Alice"});
        assert!(matches(&doc, &json!({"name": {"$regex": "^alice$", "$options": "i"}})).unwrap());
    }

    #[test]
    fn text_search_is_diacritic_insensitive() {
        let doc = json!({"body": "café in the morning"});
        assert!(matches(&doc, &json!({"$text": {"$search": "cafe"}})).unwrap());
    }

    #[test]
    fn elem_match_on_array_of_objects() {
        let doc = json!({"items": [{"qty": 1}, {"qty": 10}]});
        assert!(matches(&doc, &json!({"items": {"$elemMatch": {"qty": {"$gte": 5}}}})).unwrap());
        assert!(!matches(&doc, &json!({"items": {"$elemMatch": {"qty": {"$gte": 50}}}})).unwrap());
    }

    #[test]
    fn nested_path_navigation() {
        let doc = json!({"a": {"b": [1, 2, {"c": 3}]}});
        assert!(matches(&doc, &json!({"a.b.2.c": 3})).unwrap());
    }
}
