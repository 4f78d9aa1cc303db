//! BSON-style type classification and ordering (SPEC_FULL.md §4.2).
//!
//! Plain JSON has no Binary/`ObjectId`/Date/Regex types, so documents that
//! want to use those MongoDB `$type` names encode them as a single-key
//! "extended JSON" object, the same convention MongoDB's own extended JSON
//! uses: `{"$oid": "<hex>"}`, `{"$date": "<rfc3339>"}`, `{"$binary": "<b64>"}`,
//! `{"$regex": "<pattern>", "$options": "<flags>"}`. Everything else classifies
//! by its literal JSON shape.

use serde_json::Value as Json;
use std::cmp::Ordering;

/// BSON type tag, ordered per the canonical comparison order used throughout
/// the engine: `Null < Number < String < Object < Array < Binary < ObjectId <
/// Boolean < Date < Regex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BsonType {
    Null,
    Number,
    String,
    Object,
    Array,
    Binary,
    ObjectId,
    Boolean,
    Date,
    Regex,
}

impl BsonType {
    /// The canonical MongoDB `$type` alias for this tag (used by `$type` queries).
    pub fn alias(self) -> &'static str {
        match self {
            BsonType::Null => "null",
            BsonType::Number => "number",
            BsonType::String => "string",
            BsonType::Object => "object",
            BsonType::Array => "array",
            BsonType::Binary => "binData",
            BsonType::ObjectId => "objectId",
            BsonType::Boolean => "bool",
            BsonType::Date => "date",
            BsonType::Regex => "regex",
        }
    }

    /// Resolves a `$type` query argument (name or legacy numeric code) to a tag.
    pub fn from_query_arg(arg: &Json) -> Option<Self> {
        match arg {
            Json::String(s) => match s.as_str() {
                "null" => Some(BsonType::Null),
                "number" | "int" | "long" | "double" | "decimal" => Some(BsonType::Number),
                "string" => Some(BsonType::String),
                "object" => Some(BsonType::Object),
                "array" => Some(BsonType::Array),
                "binData" => Some(BsonType::Binary),
                "objectId" => Some(BsonType::ObjectId),
                "bool" => Some(BsonType::Boolean),
                "date" => Some(BsonType::Date),
                "regex" => Some(BsonType::Regex),
                _ => None,
            },
            Json::Number(n) => match n.as_i64() {
                Some(10) => Some(BsonType::Null),
                Some(1 | 16 | 18 | 19) => Some(BsonType::Number),
                Some(2) => Some(BsonType::String),
                Some(3) => Some(BsonType::Object),
                Some(4) => Some(BsonType::Array),
                Some(5) => Some(BsonType::Binary),
                Some(7) => Some(BsonType::ObjectId),
                Some(8) => Some(BsonType::Boolean),
                Some(9) => Some(BsonType::Date),
                Some(11) => Some(BsonType::Regex),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Classifies a JSON value into its BSON type tag.
pub fn classify(value: &Json) -> BsonType {
    match value {
        Json::Null => BsonType::Null,
        Json::Bool(_) => BsonType::Boolean,
        Json::Number(_) => BsonType::Number,
        Json::String(_) => BsonType::String,
        Json::Array(_) => BsonType::Array,
        Json::Object(map) => {
            if map.len() == 1 {
                if map.contains_key("$oid") {
                    return BsonType::ObjectId;
                }
                if map.contains_key("$date") {
                    return BsonType::Date;
                }
                if map.contains_key("$binary") {
                    return BsonType::Binary;
                }
            }
            if map.contains_key("$regex") {
                return BsonType::Regex;
            }
            BsonType::Object
        }
    }
}

/// Total order over arbitrary JSON values following BSON type-then-value
/// ordering. Used by `$gt`/`$lt`/range compilation fallbacks and by the
/// in-process streaming evaluator (SPEC_FULL.md §4.2, §4.4).
pub fn compare_values(a: &Json, b: &Json) -> Ordering {
    let (ta, tb) = (classify(a), classify(b));
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Json::Null, Json::Null) => Ordering::Equal,
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Number(x), Json::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = compare_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Json::Object(x), Json::Object(y)) => {
            let xs: std::collections::BTreeMap<_, _> = x.iter().collect();
            let ys: std::collections::BTreeMap<_, _> = y.iter().collect();
            for ((xk, xv), (yk, yv)) in xs.iter().zip(ys.iter()) {
                let key_ord = xk.cmp(yk);
                if key_ord != Ordering::Equal {
                    return key_ord;
                }
                let val_ord = compare_values(xv, yv);
                if val_ord != Ordering::Equal {
                    return val_ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_ordering_matches_spec() {
        assert!(BsonType::Null < BsonType::Number);
        assert!(BsonType::Number < BsonType::String);
        assert!(BsonType::String < BsonType::Object);
        assert!(BsonType::Object < BsonType::Array);
        assert!(BsonType::Array < BsonType::Binary);
        assert!(BsonType::Binary < BsonType::ObjectId);
        assert!(BsonType::ObjectId < BsonType::Boolean);
        assert!(BsonType::Boolean < BsonType::Date);
        assert!(BsonType::Date < BsonType::Regex);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2.5)), Ordering::Equal);
    }

    #[test]
    fn mixed_type_comparison_follows_bson_order() {
        assert_eq!(compare_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!("a"), &json!({"k": 1})), Ordering::Less);
    }

    #[test]
    fn extended_json_classifies_as_object_id() {
        assert_eq!(classify(&json!({"$oid": "abc"})), BsonType::ObjectId);
        assert_eq!(classify(&json!({"a": 1})), BsonType::Object);
    }
}
