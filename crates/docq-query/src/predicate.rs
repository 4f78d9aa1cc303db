//! Predicate Compiler (SPEC_FULL.md §4.2).
//!
//! Converts a query document into `(where_sql, params, unresolved)`. Never
//! touches the database — `$text` resolution is delegated through
//! [`TextResolver`] so this module stays pure and callers can plug in
//! whatever connection/index-manager pairing they have open.

use serde_json::{Map, Value as Json};

use crate::error::{QueryError, Result};
use crate::path::{JsonFlavor, translate};

/// Resolves `$text` queries against the Index & FTS Manager (SPEC_FULL.md §4.3).
pub trait TextResolver {
    /// Returns an FTS table name covering `fields`, or `None` if no FTS
    /// index covers them (in which case `$text` is routed to streaming).
    fn match_text(&self, fields: &[String]) -> Result<Option<String>>;
}

/// No-op resolver: every `$text` query is unresolved. Useful for pure
/// planning contexts (e.g. tests) that don't have a live index manager.
pub struct NoTextIndex;
impl TextResolver for NoTextIndex {
    fn match_text(&self, _fields: &[String]) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Compilation context threaded through every recursive call.
pub struct CompileCtx<'a> {
    pub flavor: JsonFlavor,
    pub data_column: &'a str,
    pub text_resolver: &'a dyn TextResolver,
}

impl<'a> CompileCtx<'a> {
    pub fn new(flavor: JsonFlavor, data_column: &'a str, text_resolver: &'a dyn TextResolver) -> Self {
        Self {
            flavor,
            data_column,
            text_resolver,
        }
    }
}

/// Result of compiling a query document.
#[derive(Debug, Clone, Default)]
pub struct CompiledPredicate {
    /// `WHERE`-clause SQL fragment (without the `WHERE` keyword); `None`
    /// means "always true" (nothing SQL-translatable was found).
    pub where_sql: Option<String>,
    /// Bound parameters, in the order their `?` placeholders appear.
    pub params: Vec<Json>,
    /// The subtree of the query that could not be translated to SQL and
    /// must be evaluated in process by [`crate::stream::matches`].
    pub unresolved: Option<Json>,
}

impl CompiledPredicate {
    fn always_true() -> Self {
        Self::default()
    }

    fn sql_only(sql: String, params: Vec<Json>) -> Self {
        Self {
            where_sql: Some(sql),
            params,
            unresolved: None,
        }
    }

    fn unresolved_only(doc: Json) -> Self {
        Self {
            where_sql: None,
            params: vec![],
            unresolved: Some(doc),
        }
    }

    /// True if this predicate has no untranslatable remainder.
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_none()
    }
}

fn and_sql(mut clauses: Vec<String>) -> Option<String> {
    clauses.retain(|c| !c.is_empty());
    match clauses.len() {
        0 => None,
        1 => Some(clauses.remove(0)),
        _ => Some(format!("({})", clauses.join(" AND "))),
    }
}

fn and_unresolved(mut docs: Vec<Json>) -> Option<Json> {
    docs.retain(|d| !matches!(d, Json::Object(m) if m.is_empty()));
    match docs.len() {
        0 => None,
        1 => Some(docs.remove(0)),
        _ => Some(Json::Object(Map::from_iter([(
            "$and".to_string(),
            Json::Array(docs),
        )]))),
    }
}

/// Converts a JSON leaf value to a native `rusqlite` value, matching the
/// type SQLite's own `json_extract` returns for the same JSON shape (so
/// comparisons against an extraction expression type-match without quoting
/// mismatches).
pub fn json_leaf_to_sql(v: &Json) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlVal;
    match v {
        Json::Null => SqlVal::Null,
        Json::Bool(b) => SqlVal::Integer(i64::from(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlVal::Integer(i)
            } else {
                SqlVal::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => SqlVal::Text(s.clone()),
        Json::Array(_) | Json::Object(_) => {
            SqlVal::Text(serde_json::to_string(v).unwrap_or_default())
        }
    }
}

/// Compiles a full query document (implicit top-level AND across keys).
pub fn compile(query: &Json, ctx: &CompileCtx) -> Result<CompiledPredicate> {
    let obj = match query {
        Json::Object(m) => m,
        Json::Null => return Ok(CompiledPredicate::always_true()),
        _ => return Err(QueryError::MalformedQuery("query must be an object".into())),
    };
    compile_object(obj, ctx)
}

fn compile_object(obj: &Map<String, Json>, ctx: &CompileCtx) -> Result<CompiledPredicate> {
    let mut sql_clauses = Vec::new();
    let mut params = Vec::new();
    let mut unresolved_docs = Vec::new();

    for (key, value) in obj {
        if key == "$and" {
            let arr = expect_array(value, "$and")?;
            for sub in arr {
                let sub_obj = expect_object(sub, "$and element")?;
                let compiled = compile_object(sub_obj, ctx)?;
                if let Some(sql) = compiled.where_sql {
                    sql_clauses.push(sql);
                }
                params.extend(compiled.params);
                if let Some(u) = compiled.unresolved {
                    unresolved_docs.push(u);
                }
            }
        } else if key == "$or" || key == "$nor" {
            let arr = expect_array(value, key)?;
            let mut branch_sql = Vec::new();
            let mut branch_params = Vec::new();
            let mut all_resolved = true;
            for sub in arr {
                let sub_obj = expect_object(sub, "$or/$nor element")?;
                let compiled = compile_object(sub_obj, ctx)?;
                if !compiled.is_fully_resolved() {
                    all_resolved = false;
                    break;
                }
                branch_sql.push(compiled.where_sql.unwrap_or_else(|| "1=1".to_string()));
                branch_params.extend(compiled.params);
            }
            if all_resolved {
                let joined = branch_sql.join(" OR ");
                let sql = if key == "$or" {
                    format!("({joined})")
                } else {
                    format!("NOT ({joined})")
                };
                sql_clauses.push(sql);
                params.extend(branch_params);
            } else {
                unresolved_docs.push(Json::Object(Map::from_iter([(
                    key.clone(),
                    value.clone(),
                )])));
            }
        } else if key == "$text" {
            let search = expect_object(value, "$text")?;
            let query_str = search
                .get("$search")
                .and_then(|v| v.as_str())
                .ok_or_else(|| QueryError::MalformedQuery("$text requires $search".into()))?;
            let fields: Vec<String> = search
                .get("$fields")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            match ctx.text_resolver.match_text(&fields)? {
                Some(fts_table) => {
                    sql_clauses.push(format!(
                        "id IN (SELECT rowid FROM {fts_table} WHERE {fts_table} MATCH ?)"
                    ));
                    params.push(Json::String(query_str.to_string()));
                }
                None => {
                    unresolved_docs.push(Json::Object(Map::from_iter([(
                        key.clone(),
                        value.clone(),
                    )])));
                }
            }
        } else if key.starts_with('$') {
            return Err(QueryError::MalformedQuery(format!("unknown logical operator {key}")));
        } else {
            let field_result = compile_field(key, value, ctx)?;
            if let Some(sql) = field_result.where_sql {
                sql_clauses.push(sql);
            }
            params.extend(field_result.params);
            if let Some(u) = field_result.unresolved {
                unresolved_docs.push(u);
            }
        }
    }

    Ok(CompiledPredicate {
        where_sql: and_sql(sql_clauses),
        params,
        unresolved: and_unresolved(unresolved_docs),
    })
}

fn expect_array<'a>(v: &'a Json, what: &str) -> Result<&'a Vec<Json>> {
    v.as_array()
        .ok_or_else(|| QueryError::MalformedQuery(format!("{what} must be an array")))
}

fn expect_object<'a>(v: &'a Json, what: &str) -> Result<&'a Map<String, Json>> {
    v.as_object()
        .ok_or_else(|| QueryError::MalformedQuery(format!("{what} must be an object")))
}

/// Compiles a single field clause: either an implicit `$eq` or an operator
/// object, possibly with multiple operators conjoined (SPEC_FULL.md §4.2
/// tie-break: "a clause with multiple comparison operators on the same
/// field compiles to the conjunction of all operators").
fn compile_field(path: &str, value: &Json, ctx: &CompileCtx) -> Result<CompiledPredicate> {
    let ops: Map<String, Json> = match value {
        Json::Object(m) if m.keys().all(|k| k.starts_with('$')) && !m.is_empty() => m.clone(),
        _ => Map::from_iter([("$eq".to_string(), value.clone())]),
    };

    // _id queries may be satisfied either by the JSON `_id` value or (for
    // documents predating `_id` population) by the internal `id` column
    // (SPEC_FULL.md §4.2 tie-break, §9 open question).
    if path == "_id" {
        if let Some(eq_val) = ops.get("$eq") {
            return compile_id_eq(eq_val, ctx);
        }
    }

    let translated = translate(path, ctx.flavor, ctx.data_column)?;
    let extract = translated.sql_expression;

    let mut sql_clauses = Vec::new();
    let mut params = Vec::new();
    let mut unresolved_ops = Map::new();

    for (op, arg) in &ops {
        match op.as_str() {
            "$eq" => {
                sql_clauses.push(format!("{extract} = ?"));
                params.push(arg.clone());
            }
            "$ne" => {
                sql_clauses.push(format!("({extract} IS NULL OR {extract} != ?)"));
                params.push(arg.clone());
            }
            "$gt" | "$gte" | "$lt" | "$lte" => {
                if matches!(arg, Json::Number(_) | Json::String(_)) {
                    let sql_op = match op.as_str() {
                        "$gt" => ">",
                        "$gte" => ">=",
                        "$lt" => "<",
                        _ => "<=",
                    };
                    sql_clauses.push(format!("{extract} {sql_op} ?"));
                    params.push(arg.clone());
                } else {
                    unresolved_ops.insert(op.clone(), arg.clone());
                }
            }
            "$in" | "$nin" => {
                let arr = expect_array(arg, op)?;
                if arr.is_empty() {
                    sql_clauses.push(if op == "$in" { "0".to_string() } else { "1".to_string() });
                } else {
                    let placeholders = vec!["?"; arr.len()].join(", ");
                    let kw = if op == "$in" { "IN" } else { "NOT IN" };
                    sql_clauses.push(format!("{extract} {kw} ({placeholders})"));
                    params.extend(arr.iter().cloned());
                }
            }
            "$exists" => {
                // json_extract already collapses an explicit JSON null and a
                // missing path to SQL NULL, so comparing the extraction
                // itself (rather than json_type, which reports 'null' as a
                // non-NULL string) matches null and absent identically, per
                // SPEC_FULL.md §4.2.
                let want_exists = arg.as_bool().unwrap_or(true);
                sql_clauses.push(if want_exists {
                    format!("{extract} IS NOT NULL")
                } else {
                    format!("{extract} IS NULL")
                });
            }
            "$mod" => {
                let arr = expect_array(arg, "$mod")?;
                if arr.len() != 2 {
                    return Err(QueryError::MalformedQuery("$mod requires [divisor, remainder]".into()));
                }
                sql_clauses.push(format!("(CAST({extract} AS INTEGER) % ?) = ?"));
                params.push(arr[0].clone());
                params.push(arr[1].clone());
            }
            "$size" => {
                sql_clauses.push(format!(
                    "json_array_length({}, '{}') = ?",
                    ctx.data_column, translated.json_path
                ));
                params.push(arg.clone());
            }
            "$type" => {
                let ty = docq_types::BsonType::from_query_arg(arg)
                    .ok_or_else(|| QueryError::MalformedQuery(format!("unknown $type value {arg:?}")))?;
                let type_expr = crate::path::type_expression(path, ctx.flavor, ctx.data_column)?;
                match ty {
                    docq_types::BsonType::Number => {
                        sql_clauses.push(format!("{type_expr} IN ('integer','real')"));
                    }
                    docq_types::BsonType::Boolean => {
                        sql_clauses.push(format!("({type_expr} = 'true' OR {type_expr} = 'false')"));
                    }
                    _ => {
                        let sqlite_ty = match ty {
                            docq_types::BsonType::Null => "null",
                            docq_types::BsonType::String => "text",
                            docq_types::BsonType::Object => "object",
                            docq_types::BsonType::Array => "array",
                            _ => {
                                unresolved_ops.insert(op.clone(), arg.clone());
                                continue;
                            }
                        };
                        sql_clauses.push(format!("{type_expr} = '{sqlite_ty}'"));
                    }
                }
            }
            "$all" => {
                let arr = expect_array(arg, "$all")?;
                let each = crate::path::each_expression(path, ctx.flavor, ctx.data_column)?;
                for elem in arr {
                    sql_clauses.push(format!("EXISTS (SELECT 1 FROM {each} WHERE value = ?)"));
                    params.push(elem.clone());
                }
            }
            "$elemMatch" => {
                let each = crate::path::each_expression(path, ctx.flavor, ctx.data_column)?;
                let sub_obj = expect_object(arg, "$elemMatch")?;
                let sub_ctx = CompileCtx::new(ctx.flavor, "value", ctx.text_resolver);
                let compiled = compile_object(sub_obj, &sub_ctx)?;
                if compiled.is_fully_resolved() {
                    let where_sql = compiled.where_sql.unwrap_or_else(|| "1=1".to_string());
                    sql_clauses.push(format!("EXISTS (SELECT 1 FROM {each} WHERE {where_sql})"));
                    params.extend(compiled.params);
                } else {
                    unresolved_ops.insert(op.clone(), arg.clone());
                }
            }
            "$contains" => {
                let s = arg
                    .as_str()
                    .ok_or_else(|| QueryError::MalformedQuery("$contains requires a string".into()))?;
                sql_clauses.push(format!("{extract} LIKE '%' || ? || '%' ESCAPE '\\' COLLATE NOCASE"));
                params.push(Json::String(s.to_string()));
            }
            "$regex" => {
                // No store-provided regex predicate is wired up; always unresolved.
                unresolved_ops.insert(op.clone(), arg.clone());
            }
            "$not" => {
                let sub_obj = expect_object(arg, "$not")?;
                let compiled = compile_field(path, &Json::Object(sub_obj.clone()), ctx)?;
                if compiled.is_fully_resolved() {
                    let sql = compiled.where_sql.unwrap_or_else(|| "1=1".to_string());
                    sql_clauses.push(format!("NOT ({sql})"));
                    params.extend(compiled.params);
                } else {
                    unresolved_ops.insert(op.clone(), arg.clone());
                }
            }
            other => {
                return Err(QueryError::MalformedQuery(format!("unknown operator {other}")));
            }
        }
    }

    let unresolved = if unresolved_ops.is_empty() {
        None
    } else {
        Some(Json::Object(Map::from_iter([(
            path.to_string(),
            Json::Object(unresolved_ops),
        )])))
    };

    Ok(CompiledPredicate {
        where_sql: and_sql(sql_clauses),
        params,
        unresolved,
    })
}

/// Compiles `{_id: <value>}`: emits a disjunction covering both the opaque
/// `_id` interpretation and the legacy internal-`id` interpretation
/// (SPEC_FULL.md §4.2 tie-break, §9 open question — documented, not guessed
/// away).
fn compile_id_eq(value: &Json, ctx: &CompileCtx) -> Result<CompiledPredicate> {
    let _ = ctx;
    match value {
        Json::Number(n) if n.as_i64().is_some() => Ok(CompiledPredicate::sql_only(
            "(_id = ? OR id = ?)".to_string(),
            vec![value.clone(), value.clone()],
        )),
        _ => Ok(CompiledPredicate::sql_only(
            "_id = ?".to_string(),
            vec![value.clone()],
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CompileCtx<'static> {
        CompileCtx::new(JsonFlavor::Text, "data", &NoTextIndex)
    }

    #[test]
    fn implicit_eq() {
        let c = compile(&json!({"name": "Alice"}), &ctx()).unwrap();
        assert_eq!(c.where_sql.unwrap(), "json_extract(data,'$.name') = ?");
        assert_eq!(c.params, vec![json!("Alice")]);
        assert!(c.unresolved.is_none());
    }

    #[test]
    fn range_conjunction_applies_all_operators() {
        let c = compile(&json!({"age": {"$gte": 30, "$lte": 50}}), &ctx()).unwrap();
        let sql = c.where_sql.unwrap();
        assert!(sql.contains(">="));
        assert!(sql.contains("<="));
        assert_eq!(c.params.len(), 2);
    }

    #[test]
    fn in_operator() {
        let c = compile(&json!({"tag": {"$in": ["a", "b"]}}), &ctx()).unwrap();
        assert!(c.where_sql.unwrap().contains("IN (?, ?)"));
        assert_eq!(c.params.len(), 2);
    }

    #[test]
    fn unknown_top_level_operator_is_error() {
        let err = compile(&json!({"$bogus": []}), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::MalformedQuery(_)));
    }

    #[test]
    fn regex_is_unresolved() {
        let c = compile(&json!({"name": {"$regex": "^A"}}), &ctx()).unwrap();
        assert!(c.where_sql.is_none());
        assert!(c.unresolved.is_some());
    }

    #[test]
    fn partial_and_taints_only_its_field() {
        let c = compile(
            &json!({"name": "Alice", "bio": {"$regex": "x"}}),
            &ctx(),
        )
        .unwrap();
        assert!(c.where_sql.unwrap().contains("name"));
        assert!(c.unresolved.is_some());
    }

    #[test]
    fn id_integer_literal_disjunction() {
        let c = compile(&json!({"_id": 42}), &ctx()).unwrap();
        assert_eq!(c.where_sql.unwrap(), "(_id = ? OR id = ?)");
    }

    #[test]
    fn id_opaque_string_single_clause() {
        let c = compile(&json!({"_id": "5f1a2b3c4d5e6f7081920a3b"}), &ctx()).unwrap();
        assert_eq!(c.where_sql.unwrap(), "_id = ?");
    }

    #[test]
    fn exists_false_and_null_are_identical() {
        let present = compile(&json!({"a": {"$exists": false}}), &ctx()).unwrap();
        assert!(present.where_sql.unwrap().contains("IS NULL"));
    }

    #[test]
    fn or_with_fully_resolved_branches_compiles_to_sql() {
        let c = compile(&json!({"$or": [{"a": 1}, {"b": 2}]}), &ctx()).unwrap();
        assert!(c.where_sql.unwrap().contains("OR"));
        assert!(c.unresolved.is_none());
    }

    #[test]
    fn or_with_unresolved_branch_taints_whole_node() {
        let c = compile(
            &json!({"$or": [{"a": 1}, {"b": {"$regex": "z"}}]}),
            &ctx(),
        )
        .unwrap();
        assert!(c.where_sql.is_none());
        assert!(c.unresolved.is_some());
    }
}
