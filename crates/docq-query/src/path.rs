//! JSON Path Translator (SPEC_FULL.md §4.1).
//!
//! Translates dotted field paths (`a.b.2.c`) into SQL JSON-path strings
//! (`$.a.b[2].c`) and extraction expressions against either `data` or the
//! dedicated `_id` column. Consumed by every other component in this crate.

use crate::error::{QueryError, Result};

/// Whether the underlying SQLite build advertises the binary-JSON function
/// family (`jsonb_extract`, `jsonb_each`, ...) in addition to the text-JSON
/// family (`json_extract`, `json_each`, ...). Decided once per connection
/// (SPEC_FULL.md §3 "Physical encoding") and threaded through every call
/// that needs to emit JSON-function SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFlavor {
    /// Only the text-JSON function family is available.
    Text,
    /// The binary-JSON function family is available and preferred.
    Binary,
}

impl JsonFlavor {
    fn extract_fn(self) -> &'static str {
        match self {
            JsonFlavor::Text => "json_extract",
            JsonFlavor::Binary => "jsonb_extract",
        }
    }

    fn each_fn(self) -> &'static str {
        match self {
            JsonFlavor::Text => "json_each",
            JsonFlavor::Binary => "jsonb_each",
        }
    }

    fn type_fn(self) -> &'static str {
        // json_type works uniformly on both text and binary JSON blobs.
        "json_type"
    }
}

/// A path segment: either a field name or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse_segments(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Err(QueryError::InvalidPath {
            path: path.to_string(),
            reason: "empty path",
        });
    }
    if path == "$" {
        return Ok(vec![]);
    }
    if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
        return Err(QueryError::InvalidPath {
            path: path.to_string(),
            reason: "leading, trailing, or doubled dot",
        });
    }

    let mut segments = Vec::new();
    for (i, part) in path.split('.').enumerate() {
        if part.is_empty() {
            return Err(QueryError::InvalidPath {
                path: path.to_string(),
                reason: "empty segment",
            });
        }
        if i > 0 {
            if let Ok(n) = part.parse::<usize>() {
                segments.push(Segment::Index(n));
                continue;
            }
        }
        segments.push(Segment::Field(part.to_string()));
    }
    Ok(segments)
}

/// Renders a dotted path's segments as a SQLite JSON-path literal (`$.a.b[2].c`).
fn render_json_path(segments: &[Segment]) -> String {
    let mut out = String::from("$");
    for seg in segments {
        match seg {
            Segment::Field(name) => {
                out.push('.');
                out.push_str(name);
            }
            Segment::Index(n) => {
                out.push('[');
                out.push_str(&n.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Result of translating a dotted field path.
#[derive(Debug, Clone)]
pub struct PathTranslation {
    /// SQL expression extracting the value (e.g. `json_extract(data,'$.a')`).
    pub sql_expression: String,
    /// The SQLite JSON-path literal (e.g. `$.a`), reusable in `json_each`/`json_type` calls.
    pub json_path: String,
    /// Whether this path resolved against the `_id` column instead of `data`.
    pub is_id_path: bool,
}

/// Translates a dotted field path into a SQL extraction expression.
///
/// `data_column` names the JSON column to extract from when the path is not
/// rooted at `_id` (normally `"data"`, but a `$lookup`-joined alias such as
/// `"t2.data"` is also valid).
pub fn translate(path: &str, flavor: JsonFlavor, data_column: &str) -> Result<PathTranslation> {
    let segments = parse_segments(path)?;

    // A leading `_id` segment is rewritten to the dedicated `_id` column so
    // the unique index on that column can be used directly.
    let (source, rest): (&str, &[Segment]) = match segments.first() {
        Some(Segment::Field(f)) if f == "_id" => {
            let id_column = data_column
                .rsplit_once('.')
                .map(|(alias, _)| format!("{alias}._id"))
                .unwrap_or_else(|| "_id".to_string());
            return Ok(translate_against(&id_column, &segments[1..], flavor, true));
        }
        _ => (data_column, segments.as_slice()),
    };
    let _ = rest;

    Ok(translate_against(source, &segments, flavor, false))
}

fn translate_against(
    source: &str,
    segments: &[Segment],
    flavor: JsonFlavor,
    is_id_path: bool,
) -> PathTranslation {
    if segments.is_empty() {
        return PathTranslation {
            sql_expression: source.to_string(),
            json_path: "$".to_string(),
            is_id_path,
        };
    }
    let json_path = render_json_path(segments);
    let sql_expression = format!("{}({source},'{json_path}')", flavor.extract_fn());
    PathTranslation {
        sql_expression,
        json_path,
        is_id_path,
    }
}

/// Builds a `json_type(...)` expression for existence/type checks, sharing
/// the same path resolution as [`translate`].
pub fn type_expression(path: &str, flavor: JsonFlavor, data_column: &str) -> Result<String> {
    let t = translate(path, flavor, data_column)?;
    // json_type() needs (source, path) form, not the extracted value.
    if t.json_path == "$" {
        Ok(format!("{}({})", flavor.type_fn(), data_column))
    } else {
        let source = if t.is_id_path { "_id" } else { data_column };
        Ok(format!("{}({source},'{}')", flavor.type_fn(), t.json_path))
    }
}

/// Builds a `json_each(source, path)` FROM-clause fragment for array iteration.
pub fn each_expression(path: &str, flavor: JsonFlavor, data_column: &str) -> Result<String> {
    let t = translate(path, flavor, data_column)?;
    let source = if t.is_id_path { "_id" } else { data_column };
    if t.json_path == "$" {
        Ok(format!("{}({source})", flavor.each_fn()))
    } else {
        Ok(format!("{}({source},'{}')", flavor.each_fn(), t.json_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_simple_field() {
        let t = translate("a.b", JsonFlavor::Text, "data").unwrap();
        assert_eq!(t.sql_expression, "json_extract(data,'$.a.b')");
        assert_eq!(t.json_path, "$.a.b");
    }

    #[test]
    fn translates_array_index_after_field() {
        let t = translate("a.b.2.c", JsonFlavor::Text, "data").unwrap();
        assert_eq!(t.json_path, "$.a.b[2].c");
    }

    #[test]
    fn binary_flavor_uses_jsonb() {
        let t = translate("a", JsonFlavor::Binary, "data").unwrap();
        assert_eq!(t.sql_expression, "jsonb_extract(data,'$.a')");
    }

    #[test]
    fn root_selector() {
        let t = translate("$", JsonFlavor::Text, "data").unwrap();
        assert_eq!(t.sql_expression, "data");
        assert_eq!(t.json_path, "$");
    }

    #[test]
    fn id_path_uses_id_column() {
        let t = translate("_id", JsonFlavor::Text, "data").unwrap();
        assert!(t.is_id_path);
        assert_eq!(t.sql_expression, "_id");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(translate("", JsonFlavor::Text, "data").is_err());
        assert!(translate(".a", JsonFlavor::Text, "data").is_err());
        assert!(translate("a.", JsonFlavor::Text, "data").is_err());
        assert!(translate("a..b", JsonFlavor::Text, "data").is_err());
    }
}
