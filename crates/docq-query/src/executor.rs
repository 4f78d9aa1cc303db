//! Pipeline Executor (SPEC_FULL.md §4.5).
//!
//! Runs an [`ExecutionPlan`] against a live [`Connection`]: `SQL` steps are
//! queried directly, `TEMP` steps are materialized into temp tables, and
//! `STREAM` steps are evaluated in-process against whatever rows are
//! currently in hand. The whole run happens inside one savepoint so a
//! mid-plan failure leaves no orphaned temp tables behind.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::{Map, Value as Json};

use crate::error::{QueryError, Result};
use crate::plan::{
    Accumulator, ExecutionPlan, GroupSpec, PlanStep, SortOrder, StreamStage, UnwindSpec,
};

/// One row flowing through the executor: the internal rowid, the opaque
/// document id (absent for synthetic rows like `$count`'s), and the document.
#[derive(Debug, Clone)]
struct Row {
    oid: Option<String>,
    data: Json,
}

/// Converts one executed [`Row`] into the document handed back to the
/// caller. A `_id` key absent from `row.data` means the stage never touched
/// it, so the real id is injected; an explicit `_id: null` is the
/// `$project {_id: 0}` suppression sentinel (see `planner::suppress_id_expr`)
/// and is stripped rather than re-injected.
pub(crate) fn row_to_doc(row: Row) -> Json {
    match row.data {
        Json::Object(mut m) => {
            match m.get("_id") {
                None => {
                    if let Some(oid) = row.oid {
                        m.insert("_id".to_string(), Json::String(oid));
                    }
                }
                Some(Json::Null) => {
                    m.remove("_id");
                }
                Some(_) => {}
            }
            Json::Object(m)
        }
        other => other,
    }
}

fn fetch_rows(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT _id, data FROM {table}"))?;
    let rows = stmt.query_map([], |r| {
        let oid: Option<String> = r.get(0)?;
        let data: String = r.get(1)?;
        Ok((oid, data))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (oid, data) = row?;
        let data: Json = serde_json::from_str(&data).map_err(|e| QueryError::StoreError(
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)),
        ))?;
        out.push(Row { oid, data });
    }
    Ok(out)
}

fn materialize_rows(conn: &Connection, name: &str, rows: &[Row]) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TEMP TABLE {name} (id INTEGER PRIMARY KEY, _id TEXT, data TEXT NOT NULL)"
    ))?;
    let mut stmt =
        conn.prepare(&format!("INSERT INTO {name} (_id, data) VALUES (?1, ?2)"))?;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.oid,
            serde_json::to_string(&row.data).unwrap_or_default()
        ])?;
    }
    Ok(())
}

/// Executes a plan to completion, returning the resulting documents.
///
/// Runs inside one savepoint (SPEC_FULL.md §4.5 protocol step 1). On
/// success the temp tables this plan created are dropped before the
/// savepoint is released, satisfying invariant 6 ("no temp tables named by
/// the executor remain in the store"); on error the savepoint is simply
/// dropped without committing, which rusqlite rolls back, taking the
/// half-built temp tables with it (invariant 7).
pub fn execute(conn: &Connection, collection: &str, plan: &ExecutionPlan) -> Result<Vec<Json>> {
    let sp = conn.savepoint()?;
    let result = run(&sp, collection, plan);
    match result {
        Ok(rows) => {
            for name in plan.temp_table_names() {
                sp.execute_batch(&format!("DROP TABLE IF EXISTS {name}"))?;
            }
            sp.commit()?;
            Ok(rows)
        }
        Err(e) => Err(e),
    }
}

fn run(conn: &Connection, collection: &str, plan: &ExecutionPlan) -> Result<Vec<Json>> {
    let mut current_table = collection.to_string();
    let mut memory_rows: Option<Vec<Row>> = None;

    for step in &plan.steps {
        match step {
            PlanStep::Sql(s) => {
                let params: Vec<rusqlite::types::Value> =
                    s.params.iter().map(crate::predicate::json_leaf_to_sql).collect();
                let mut stmt = conn.prepare(&s.select_sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
                    let oid: Option<String> = r.get(1)?;
                    let data: String = r.get(2)?;
                    Ok((oid, data))
                })?;
                let mut collected = Vec::new();
                for row in rows {
                    let (oid, data) = row?;
                    let data: Json = serde_json::from_str(&data).unwrap_or(Json::Null);
                    collected.push(Row { oid, data });
                }
                memory_rows = Some(collected);
            }
            PlanStep::Temp(t) => {
                let params: Vec<rusqlite::types::Value> =
                    t.params.iter().map(crate::predicate::json_leaf_to_sql).collect();
                conn.execute(
                    &format!("CREATE TEMP TABLE {} AS {}", t.name, t.select_sql),
                    rusqlite::params_from_iter(params),
                )?;
                current_table = t.name.clone();
                memory_rows = None;
            }
            PlanStep::Stream(s) => {
                let input = match memory_rows.take() {
                    Some(rows) => rows,
                    None => fetch_rows(conn, &current_table)?,
                };
                let output = apply_stage(conn, &s.stage, input)?;
                match &s.rematerialize {
                    Some(name) => {
                        materialize_rows(conn, name, &output)?;
                        current_table = name.clone();
                        memory_rows = None;
                    }
                    None => memory_rows = Some(output),
                }
            }
        }
    }

    let final_rows = match memory_rows {
        Some(rows) => rows,
        None => fetch_rows(conn, &current_table)?,
    };
    Ok(final_rows.into_iter().map(row_to_doc).collect())
}

fn get_path<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = doc;
    for segment in path.split('.') {
        match cur {
            Json::Object(m) => cur = m.get(segment)?,
            Json::Array(a) => cur = a.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(cur)
}

fn set_path(doc: &mut Json, path: &str, value: Json) {
    let Json::Object(root) = doc else { return };
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path has at least one segment");
    let mut cur = root;
    for seg in segments {
        let entry = cur
            .entry(seg.to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if !entry.is_object() {
            *entry = Json::Object(Map::new());
        }
        cur = entry.as_object_mut().expect("just ensured object");
    }
    cur.insert(last.to_string(), value);
}

fn remove_path(doc: &mut Json, path: &str) {
    let Json::Object(root) = doc else { return };
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path has at least one segment");
    let mut cur = root;
    for seg in segments {
        let Some(next) = cur.get_mut(seg).and_then(Json::as_object_mut) else {
            return;
        };
        cur = next;
    }
    cur.remove(last);
}

/// Evaluates a `$project`/`$addFields`/`$group` expression against a document
/// (the in-process counterpart of `planner::render_expr`).
fn eval_expr(expr: &Json, doc: &Json) -> Json {
    match expr {
        Json::String(s) if s.starts_with('$') && s.len() > 1 => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Json::Null)
        }
        Json::Object(m) if m.len() == 1 => {
            let (op, arg) = m.iter().next().expect("checked len == 1");
            match op.as_str() {
                "$literal" => arg.clone(),
                "$concat" => arg
                    .as_array()
                    .map(|a| {
                        Json::String(
                            a.iter()
                                .map(|e| as_concat_str(&eval_expr(e, doc)))
                                .collect::<Vec<_>>()
                                .join(""),
                        )
                    })
                    .unwrap_or(Json::Null),
                "$toUpper" => Json::String(as_concat_str(&eval_expr(arg, doc)).to_uppercase()),
                "$toLower" => Json::String(as_concat_str(&eval_expr(arg, doc)).to_lowercase()),
                "$add" | "$subtract" | "$multiply" | "$divide" => {
                    let Some(arr) = arg.as_array() else {
                        return Json::Null;
                    };
                    if arr.len() != 2 {
                        return Json::Null;
                    }
                    let a = eval_expr(&arr[0], doc).as_f64();
                    let b = eval_expr(&arr[1], doc).as_f64();
                    match (a, b) {
                        (Some(a), Some(b)) => {
                            let result = match op.as_str() {
                                "$add" => a + b,
                                "$subtract" => a - b,
                                "$multiply" => a * b,
                                _ => a / b,
                            };
                            serde_json::Number::from_f64(result)
                                .map(Json::Number)
                                .unwrap_or(Json::Null)
                        }
                        _ => Json::Null,
                    }
                }
                "$ifNull" => {
                    let Some(arr) = arg.as_array() else {
                        return Json::Null;
                    };
                    if arr.len() != 2 {
                        return Json::Null;
                    }
                    let a = eval_expr(&arr[0], doc);
                    if a.is_null() { eval_expr(&arr[1], doc) } else { a }
                }
                "$cond" => eval_cond(arg, doc),
                _ => Json::Null,
            }
        }
        other => other.clone(),
    }
}

fn as_concat_str(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn eval_cond(arg: &Json, doc: &Json) -> Json {
    let (cond, then_expr, else_expr) = match arg {
        Json::Array(a) if a.len() == 3 => (&a[0], &a[1], &a[2]),
        Json::Object(m) => match (m.get("if"), m.get("then"), m.get("else")) {
            (Some(c), Some(t), Some(e)) => (c, t, e),
            _ => return Json::Null,
        },
        _ => return Json::Null,
    };
    if eval_bool_expr(cond, doc) {
        eval_expr(then_expr, doc)
    } else {
        eval_expr(else_expr, doc)
    }
}

fn eval_bool_expr(expr: &Json, doc: &Json) -> bool {
    let Json::Object(m) = expr else { return false };
    let Some((op, arg)) = m.iter().next() else { return false };
    let Some(arr) = arg.as_array() else { return false };
    if arr.len() != 2 {
        return false;
    }
    let a = eval_expr(&arr[0], doc);
    let b = eval_expr(&arr[1], doc);
    let ord = docq_types::compare_values(&a, &b);
    match op.as_str() {
        "$eq" => a == b,
        "$ne" => a != b,
        "$gt" => ord == std::cmp::Ordering::Greater,
        "$gte" => ord != std::cmp::Ordering::Less,
        "$lt" => ord == std::cmp::Ordering::Less,
        "$lte" => ord != std::cmp::Ordering::Greater,
        _ => false,
    }
}

fn eval_id_expr(id_expr: &Json, doc: &Json) -> Json {
    match id_expr {
        Json::Object(fields) => {
            let mut out = Map::new();
            for (k, v) in fields {
                out.insert(k.clone(), eval_expr(v, doc));
            }
            Json::Object(out)
        }
        other => eval_expr(other, doc),
    }
}

fn apply_group(spec: &GroupSpec, rows: Vec<Row>) -> Vec<Row> {
    let mut order: Vec<Json> = Vec::new();
    let mut groups: BTreeMap<String, (Json, Vec<&Json>)> = BTreeMap::new();
    let docs: Vec<&Json> = rows.iter().map(|r| &r.data).collect();

    for doc in &docs {
        let key = eval_id_expr(&spec.id_expr, doc);
        let key_str = serde_json::to_string(&key).unwrap_or_default();
        if !groups.contains_key(&key_str) {
            order.push(key.clone());
        }
        groups
            .entry(key_str)
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(doc);
    }

    let mut out = Vec::new();
    for key in order {
        let key_str = serde_json::to_string(&key).unwrap_or_default();
        let (_, members) = &groups[&key_str];
        let mut data = Map::new();
        data.insert("_id".to_string(), key.clone());
        for (name, acc) in &spec.accumulators {
            data.insert(name.clone(), accumulate(acc, members));
        }
        out.push(Row {
            oid: None,
            data: Json::Object(data),
        });
    }
    out
}

fn accumulate(acc: &Accumulator, members: &[&Json]) -> Json {
    match acc {
        Accumulator::Sum(e) => {
            let sum: f64 = members
                .iter()
                .map(|d| if e.as_i64() == Some(1) { 1.0 } else { eval_expr(e, d).as_f64().unwrap_or(0.0) })
                .sum();
            serde_json::Number::from_f64(sum).map(Json::Number).unwrap_or(Json::Null)
        }
        Accumulator::Avg(e) => {
            let vals: Vec<f64> = members
                .iter()
                .filter_map(|d| eval_expr(e, d).as_f64())
                .collect();
            if vals.is_empty() {
                Json::Null
            } else {
                let avg = vals.iter().sum::<f64>() / vals.len() as f64;
                serde_json::Number::from_f64(avg).map(Json::Number).unwrap_or(Json::Null)
            }
        }
        Accumulator::Min(e) => members
            .iter()
            .map(|d| eval_expr(e, d))
            .min_by(docq_types::compare_values)
            .unwrap_or(Json::Null),
        Accumulator::Max(e) => members
            .iter()
            .map(|d| eval_expr(e, d))
            .max_by(docq_types::compare_values)
            .unwrap_or(Json::Null),
        Accumulator::Push(e) => Json::Array(members.iter().map(|d| eval_expr(e, d)).collect()),
        Accumulator::AddToSet(e) => {
            let mut seen = Vec::new();
            for d in members {
                let v = eval_expr(e, d);
                if !seen.contains(&v) {
                    seen.push(v);
                }
            }
            Json::Array(seen)
        }
    }
}

fn apply_unwind(spec: &UnwindSpec, rows: Vec<Row>) -> Vec<Row> {
    let mut out = Vec::new();
    for row in rows {
        let arr = get_path(&row.data, &spec.path).and_then(Json::as_array).cloned();
        match arr {
            Some(items) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let mut data = row.data.clone();
                    set_path(&mut data, &spec.path, item);
                    if let Some(idx_field) = &spec.include_array_index {
                        set_path(&mut data, idx_field, Json::Number(i.into()));
                    }
                    out.push(Row { oid: row.oid.clone(), data });
                }
            }
            _ if spec.preserve_null_and_empty_arrays => out.push(row),
            _ => {}
        }
    }
    out
}

fn apply_project(payload: &Json, rows: Vec<Row>) -> Vec<Row> {
    let Some(obj) = payload.as_object() else {
        return rows;
    };
    // `_id: 0` alongside other inclusions is the one mix Mongo allows; treat
    // it as a suppression flag rather than a field to copy, matching
    // planner::suppress_id_expr's SQL-side behavior.
    let suppress_id = matches!(obj.get("_id"), Some(Json::Number(n)) if n.as_i64() == Some(0));

    rows.into_iter()
        .map(|row| {
            let mut out = Map::new();
            for (field, expr) in obj {
                if field == "_id" {
                    if let Json::Number(n) = expr {
                        if n.as_i64() == Some(0) || n.as_i64() == Some(1) {
                            continue;
                        }
                    }
                }
                match expr {
                    Json::Number(n) if n.as_i64() == Some(0) => {}
                    Json::Number(n) if n.as_i64() == Some(1) => {
                        if let Some(v) = get_path(&row.data, field) {
                            out.insert(field.clone(), v.clone());
                        }
                    }
                    other => {
                        out.insert(field.clone(), eval_expr(other, &row.data));
                    }
                }
            }
            if suppress_id {
                out.insert("_id".to_string(), Json::Null);
            }
            Row {
                oid: row.oid,
                data: Json::Object(out),
            }
        })
        .collect()
}

fn apply_stage(conn: &Connection, stage: &StreamStage, rows: Vec<Row>) -> Result<Vec<Row>> {
    match stage {
        StreamStage::Match(query) => {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if crate::stream::matches(&row.data, query)? {
                    out.push(row);
                }
            }
            Ok(out)
        }
        StreamStage::Project(payload) => Ok(apply_project(payload, rows)),
        StreamStage::Unset(fields) => Ok(rows
            .into_iter()
            .map(|mut row| {
                for f in fields {
                    remove_path(&mut row.data, f);
                }
                row
            })
            .collect()),
        StreamStage::Unwind(spec) => Ok(apply_unwind(spec, rows)),
        StreamStage::Group(spec) => Ok(apply_group(spec, rows)),
        StreamStage::Sort(keys) => {
            let mut rows = rows;
            rows.sort_by(|a, b| {
                for (path, order) in keys {
                    let av = get_path(&a.data, path).cloned().unwrap_or(Json::Null);
                    let bv = get_path(&b.data, path).cloned().unwrap_or(Json::Null);
                    let ord = docq_types::compare_values(&av, &bv);
                    let ord = match order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(rows)
        }
        StreamStage::Skip(n) => Ok(rows.into_iter().skip(*n as usize).collect()),
        StreamStage::Limit(n) => Ok(rows.into_iter().take(*n as usize).collect()),
        StreamStage::Sample(n) => {
            // Deterministic-ish reservoir sample: take every k-th row to
            // avoid pulling in a new dependency just for this stage.
            let n = *n as usize;
            if rows.len() <= n {
                Ok(rows)
            } else {
                let step = (rows.len() as f64 / n as f64).ceil() as usize;
                Ok(rows.into_iter().step_by(step.max(1)).take(n).collect())
            }
        }
        StreamStage::Text { search, fields } => {
            let field_refs: Option<Vec<&str>> = fields.as_ref().map(|f| f.iter().map(String::as_str).collect());
            Ok(rows
                .into_iter()
                .filter(|row| crate::stream::text_filter(&row.data, search, field_refs.as_deref()))
                .collect())
        }
        StreamStage::Facet(branches) => {
            let mut data = Map::new();
            for (name, sub_plan) in branches {
                let mut sub_rows = rows.clone();
                for step in &sub_plan.steps {
                    if let PlanStep::Stream(s) = step {
                        sub_rows = apply_stage(conn, &s.stage, sub_rows)?;
                    }
                }
                data.insert(
                    name.clone(),
                    Json::Array(sub_rows.into_iter().map(row_to_doc).collect()),
                );
            }
            Ok(vec![Row {
                oid: None,
                data: Json::Object(data),
            }])
        }
        StreamStage::Unknown { name, .. } => Err(QueryError::MalformedPipeline {
            stage_index: 0,
            reason: format!("stage {name} has no in-process evaluator"),
        }),
        StreamStage::FullPipeline(stages) => {
            let mut rows = rows;
            for stage_json in stages {
                let obj = stage_json.as_object().ok_or_else(|| QueryError::MalformedPipeline {
                    stage_index: 0,
                    reason: "stage must be an object".into(),
                })?;
                let (name, payload) = obj.iter().next().ok_or_else(|| QueryError::MalformedPipeline {
                    stage_index: 0,
                    reason: "empty stage".into(),
                })?;
                rows = apply_named_stage(conn, name, payload, rows)?;
            }
            Ok(rows)
        }
    }
}

/// Interprets one raw pipeline stage entirely in-process, for the
/// whole-pipeline rejection fallback (SPEC_FULL.md §4.4).
fn apply_named_stage(conn: &Connection, name: &str, payload: &Json, rows: Vec<Row>) -> Result<Vec<Row>> {
    match name {
        "$match" | "$text" => apply_stage(
            conn,
            &StreamStage::Match(if name == "$text" {
                Json::Object(Map::from_iter([("$text".to_string(), payload.clone())]))
            } else {
                payload.clone()
            }),
            rows,
        ),
        "$project" | "$addFields" => Ok(apply_project(payload, rows)),
        "$unset" => {
            let fields: Vec<String> = payload
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            apply_stage(conn, &StreamStage::Unset(fields), rows)
        }
        "$sort" => {
            let keys: Vec<(String, SortOrder)> = payload
                .as_object()
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| {
                            let order = if v.as_i64().unwrap_or(1) >= 0 {
                                SortOrder::Asc
                            } else {
                                SortOrder::Desc
                            };
                            (k.clone(), order)
                        })
                        .collect()
                })
                .unwrap_or_default();
            apply_stage(conn, &StreamStage::Sort(keys), rows)
        }
        "$skip" => apply_stage(conn, &StreamStage::Skip(payload.as_u64().unwrap_or(0)), rows),
        "$limit" => apply_stage(conn, &StreamStage::Limit(payload.as_u64().unwrap_or(u64::MAX)), rows),
        "$count" => {
            let field = payload.as_str().unwrap_or("count");
            let mut data = Map::new();
            data.insert(field.to_string(), Json::Number(rows.len().into()));
            Ok(vec![Row { oid: None, data: Json::Object(data) }])
        }
        "$sample" => {
            let n = payload.as_object().and_then(|o| o.get("size")).and_then(Json::as_u64).unwrap_or(0);
            apply_stage(conn, &StreamStage::Sample(n), rows)
        }
        "$unwind" => {
            let spec = match payload {
                Json::String(s) => UnwindSpec {
                    path: s.trim_start_matches('$').to_string(),
                    preserve_null_and_empty_arrays: false,
                    include_array_index: None,
                },
                Json::Object(m) => UnwindSpec {
                    path: m
                        .get("path")
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .trim_start_matches('$')
                        .to_string(),
                    preserve_null_and_empty_arrays: m
                        .get("preserveNullAndEmptyArrays")
                        .and_then(Json::as_bool)
                        .unwrap_or(false),
                    include_array_index: m
                        .get("includeArrayIndex")
                        .and_then(Json::as_str)
                        .map(String::from),
                },
                _ => {
                    return Err(QueryError::MalformedPipeline {
                        stage_index: 0,
                        reason: "$unwind requires a path or options object".into(),
                    });
                }
            };
            apply_stage(conn, &StreamStage::Unwind(spec), rows)
        }
        "$group" => {
            let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
                stage_index: 0,
                reason: "$group requires an object".into(),
            })?;
            let id_expr = obj.get("_id").cloned().unwrap_or(Json::Null);
            let mut accumulators = Vec::new();
            for (name, acc_json) in obj {
                if name == "_id" {
                    continue;
                }
                let Some(acc_obj) = acc_json.as_object() else { continue };
                let Some((op, arg)) = acc_obj.iter().next() else { continue };
                let acc = match op.as_str() {
                    "$sum" => Accumulator::Sum(arg.clone()),
                    "$avg" => Accumulator::Avg(arg.clone()),
                    "$min" => Accumulator::Min(arg.clone()),
                    "$max" => Accumulator::Max(arg.clone()),
                    "$push" => Accumulator::Push(arg.clone()),
                    "$addToSet" => Accumulator::AddToSet(arg.clone()),
                    other => {
                        return Err(QueryError::MalformedPipeline {
                            stage_index: 0,
                            reason: format!("unknown accumulator {other}"),
                        });
                    }
                };
                accumulators.push((name.clone(), acc));
            }
            apply_stage(conn, &StreamStage::Group(GroupSpec { id_expr, accumulators }), rows)
        }
        "$facet" => {
            let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
                stage_index: 0,
                reason: "$facet requires an object".into(),
            })?;
            let mut data = Map::new();
            for (facet_name, sub_pipeline) in obj {
                let stages = sub_pipeline.as_array().cloned().unwrap_or_default();
                let mut sub_rows = rows.clone();
                for stage in &stages {
                    let sub_obj = stage.as_object().ok_or_else(|| QueryError::MalformedPipeline {
                        stage_index: 0,
                        reason: "stage must be an object".into(),
                    })?;
                    let (n, p) = sub_obj.iter().next().expect("non-empty stage");
                    sub_rows = apply_named_stage(conn, n, p, sub_rows)?;
                }
                data.insert(
                    facet_name.clone(),
                    Json::Array(sub_rows.into_iter().map(row_to_doc).collect()),
                );
            }
            Ok(vec![Row { oid: None, data: Json::Object(data) }])
        }
        other => Err(QueryError::MalformedPipeline {
            stage_index: 0,
            reason: format!("stage {other} has no in-process evaluator"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::JsonFlavor;
    use crate::planner::{plan, PlannerPolicy};
    use serde_json::json;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE people (id INTEGER PRIMARY KEY, _id TEXT UNIQUE NOT NULL, data TEXT NOT NULL)",
        )
        .unwrap();
        for (oid, name, age) in [("a", "Alice", 30), ("b", "Bob", 25), ("c", "Cleo", 40)] {
            conn.execute(
                "INSERT INTO people (_id, data) VALUES (?1, ?2)",
                rusqlite::params![oid, json!({"name": name, "age": age}).to_string()],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn fused_match_sort_limit_runs_end_to_end() {
        let conn = seeded_conn();
        let pipeline = vec![
            json!({"$match": {"age": {"$gte": 26}}}),
            json!({"$sort": {"age": -1}}),
        ];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["name"], json!("Cleo"));
    }

    #[test]
    fn unresolved_match_streams_correctly() {
        let conn = seeded_conn();
        let pipeline = vec![json!({"$match": {"name": {"$regex": "^A"}}})];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["name"], json!("Alice"));
    }

    #[test]
    fn project_id_suppression_strips_the_field_end_to_end() {
        let conn = seeded_conn();
        let pipeline = vec![json!({"$project": {"_id": 0, "name": 1}})];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 3);
        for doc in &docs {
            assert!(doc.get("_id").is_none());
            assert!(doc.get("name").is_some());
        }
    }

    #[test]
    fn group_sum_produces_one_row_per_key() {
        let conn = seeded_conn();
        let pipeline = vec![json!({
            "$group": {"_id": null, "total": {"$sum": "$age"}}
        })];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["total"], json!(95.0));
    }

    #[test]
    fn forced_fallback_pipeline_matches_planned_result() {
        let conn = seeded_conn();
        let pipeline = vec![
            json!({"$match": {"age": {"$gte": 26}}}),
            json!({"$sort": {"age": -1}}),
        ];
        let policy = PlannerPolicy::new(JsonFlavor::Text).with_forced_fallback(true);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["name"], json!("Cleo"));
    }

    #[test]
    fn exists_false_matches_absent_and_explicit_null_via_sql() {
        let conn = seeded_conn();
        conn.execute(
            "INSERT INTO people (_id, data) VALUES (?1, ?2)",
            rusqlite::params!["d", json!({"name": "Dana", "age": 50, "nickname": null}).to_string()],
        )
        .unwrap();
        let pipeline = vec![json!({"$match": {"nickname": {"$exists": false}}})];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        assert!(p.is_all_sql());
        let docs = execute(&conn, "people", &p).unwrap();
        // All four rows lack a real nickname: three never had the field, one
        // has it explicitly set to null. Both count as "does not exist".
        assert_eq!(docs.len(), 4);
    }

    #[test]
    fn type_bool_does_not_leak_into_sibling_and_clause() {
        let conn = seeded_conn();
        // Both rows have a boolean `active`, so `$type: "bool"` alone is
        // satisfied by either. Only Eve also has `age == 2`. Without
        // parentheses around the $type OR, SQL precedence regroups
        // `active='true' OR (active='false' AND age=2)`, so Dana's
        // `active=true` alone would satisfy the whole clause and leak past
        // the `age` filter even though her age doesn't match.
        conn.execute(
            "INSERT INTO people (_id, data) VALUES (?1, ?2)",
            rusqlite::params!["d", json!({"name": "Dana", "age": 99, "active": true}).to_string()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO people (_id, data) VALUES (?1, ?2)",
            rusqlite::params!["e", json!({"name": "Eve", "age": 2, "active": true}).to_string()],
        )
        .unwrap();
        let pipeline = vec![json!({"$match": {"active": {"$type": "bool"}, "age": 2}})];
        let policy = PlannerPolicy::new(JsonFlavor::Text);
        let p = plan(&pipeline, "people", &policy, &[]).unwrap();
        assert!(p.is_all_sql());
        let docs = execute(&conn, "people", &p).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["name"], json!("Eve"));
    }
}
