//! Aggregation Planner (SPEC_FULL.md §4.4).
//!
//! Classifies each pipeline stage into one of three tiers — T1 (fuse into
//! the running `SELECT`), T2 (materialize into a temp table), T3 (stream
//! in-process) — and emits an [`ExecutionPlan`]. Building a plan performs no
//! I/O: it only reads the already-loaded index descriptor list, never the
//! connection.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::error::{QueryError, Result};
use crate::index::IndexDescriptor;
use crate::path::JsonFlavor;
use crate::plan::{
    Accumulator, ExecutionPlan, GroupSpec, LookupSpec, PlanStep, SortOrder, SqlStep, StreamStage,
    StreamStep, TempStep, UnwindSpec,
};
use crate::predicate::{CompileCtx, TextResolver, compile};

/// Threads the testing-only force-fallback flag and the connection's JSON
/// function family through planning (SPEC_FULL.md §9 "Global force fallback
/// toggle → PlannerPolicy").
#[derive(Debug, Clone, Copy)]
pub struct PlannerPolicy {
    pub flavor: JsonFlavor,
    /// When set, the planner skips classification entirely and emits a
    /// single `STREAM` step over the raw pipeline. Must not affect
    /// correctness, only performance (SPEC_FULL.md §6).
    pub force_stream_fallback: bool,
}

impl PlannerPolicy {
    pub fn new(flavor: JsonFlavor) -> Self {
        Self {
            flavor,
            force_stream_fallback: false,
        }
    }

    pub fn with_forced_fallback(mut self, forced: bool) -> Self {
        self.force_stream_fallback = forced;
        self
    }
}

/// Resolves `$text` against a snapshot of index descriptors already loaded
/// in memory, so the planner stays pure (no connection access).
struct DescriptorTextResolver<'a>(&'a [IndexDescriptor]);

impl TextResolver for DescriptorTextResolver<'_> {
    fn match_text(&self, fields: &[String]) -> Result<Option<String>> {
        for d in self.0 {
            if !d.fts {
                continue;
            }
            if fields.is_empty() || fields.iter().all(|f| d.keys.contains(f)) {
                return Ok(Some(d.name.clone()));
            }
        }
        Ok(None)
    }
}

struct PlanCtx<'a> {
    flavor: JsonFlavor,
    collection: &'a str,
    descriptors: &'a [IndexDescriptor],
}

/// Accumulates a single fused `SELECT` across consecutive T1 stages.
struct SqlBuilder {
    from: String,
    joins: Vec<String>,
    where_clauses: Vec<String>,
    params: Vec<Json>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    select_list: String,
}

impl SqlBuilder {
    fn base(collection: &str) -> Self {
        Self {
            from: collection.to_string(),
            joins: Vec::new(),
            where_clauses: Vec::new(),
            params: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            select_list: "id, _id, data".to_string(),
        }
    }

    fn from_previous(source: &str) -> Self {
        Self {
            from: source.to_string(),
            joins: Vec::new(),
            where_clauses: Vec::new(),
            params: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            select_list: "id, _id, data".to_string(),
        }
    }

    fn render_select(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.select_list, self.from);
        for j in &self.joins {
            sql.push_str(" JOIN ");
            sql.push_str(j);
        }
        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        if let Some(n) = self.offset {
            sql.push_str(&format!(" OFFSET {n}"));
        }
        sql
    }

    fn is_trivial(&self) -> bool {
        self.joins.is_empty()
            && self.where_clauses.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
            && self.select_list == "id, _id, data"
    }
}

/// Planner-internal state threaded through stage classification.
struct Planner<'a> {
    ctx: PlanCtx<'a>,
    plan: ExecutionPlan,
    pending: Option<SqlBuilder>,
    pipeline_hash: String,
    temp_counter: u32,
    total_stages: usize,
    /// The table a fresh `SqlBuilder` should read from: the collection
    /// itself, or the most recently materialized temp table. Kept in sync by
    /// [`Self::finalize_pending`] and [`Self::push_stream_auto`] so a T1
    /// stage following an unresolved T3 stage fuses against that stage's
    /// output instead of silently re-reading the raw collection.
    current_source: String,
}

impl<'a> Planner<'a> {
    fn new(ctx: PlanCtx<'a>, pipeline: &[Json]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(pipeline).unwrap_or_default());
        let pipeline_hash = format!("{:x}", hasher.finalize())[..16].to_string();
        let current_source = ctx.collection.to_string();
        Self {
            ctx,
            plan: ExecutionPlan::new(),
            pending: None,
            pipeline_hash,
            temp_counter: 0,
            total_stages: pipeline.len(),
            current_source,
        }
    }

    fn pending_or_base(&mut self) -> &mut SqlBuilder {
        let source = self.current_source.clone();
        self.pending
            .get_or_insert_with(|| SqlBuilder::from_previous(&source))
    }

    /// Names the next materialization deterministically (SPEC_FULL.md §4.4
    /// "Materialization naming").
    fn next_temp_name(&mut self, stage_index: usize, stage: &Json) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pipeline_hash.as_bytes());
        hasher.update(stage_index.to_le_bytes());
        hasher.update(serde_json::to_string(stage).unwrap_or_default());
        let h = format!("{:x}", hasher.finalize())[..12].to_string();
        self.temp_counter += 1;
        format!("tmp_{h}_{}", self.temp_counter)
    }

    /// Finalizes whatever is pending into a plan step. `as_temp` materializes
    /// it (a downstream stage needs SQL access); otherwise it is pushed as a
    /// terminal `SQL` step.
    fn finalize_pending(&mut self, as_temp: Option<String>) -> String {
        let Some(builder) = self.pending.take() else {
            return match self.plan.steps.last() {
                Some(PlanStep::Temp(t)) => t.name.clone(),
                _ => self.ctx.collection.to_string(),
            };
        };
        let select_sql = builder.render_select();
        match as_temp {
            Some(name) => {
                self.plan.push(PlanStep::Temp(TempStep {
                    name: name.clone(),
                    select_sql,
                    params: builder.params,
                }));
                self.current_source = name.clone();
                name
            }
            None => {
                self.plan.push(PlanStep::Sql(SqlStep {
                    select_sql,
                    params: builder.params,
                }));
                self.ctx.collection.to_string()
            }
        }
    }

    fn push_stream(&mut self, stage: StreamStage, rematerialize: Option<String>) {
        if let Some(name) = &rematerialize {
            self.current_source = name.clone();
        }
        self.plan.push(PlanStep::Stream(StreamStep {
            stage,
            rematerialize,
        }));
    }

    /// Pushes a `STREAM` step, materializing it unless it is provably the
    /// pipeline's last stage — a T3 step with no downstream consumer needs
    /// no SQL-visible output, but one with a stage still to come must hand
    /// off through a temp table so the next stage's `SqlBuilder` has
    /// somewhere to read from.
    fn push_stream_auto(&mut self, stage: StreamStage, index: usize, name_hint: &Json) {
        if index + 1 == self.total_stages {
            self.push_stream(stage, None);
        } else {
            let name = self.next_temp_name(index, name_hint);
            self.push_stream(stage, Some(name));
        }
    }
}

/// Plans a pipeline into an [`ExecutionPlan`] (SPEC_FULL.md §4.4).
pub fn plan(
    pipeline: &[Json],
    collection: &str,
    policy: &PlannerPolicy,
    descriptors: &[IndexDescriptor],
) -> Result<ExecutionPlan> {
    if policy.force_stream_fallback {
        let mut p = ExecutionPlan::new();
        p.push(PlanStep::Stream(StreamStep {
            stage: StreamStage::FullPipeline(pipeline.to_vec()),
            rematerialize: None,
        }));
        return Ok(p);
    }

    let ctx = PlanCtx {
        flavor: policy.flavor,
        collection,
        descriptors,
    };
    let mut planner = Planner::new(ctx, pipeline);

    for (index, stage) in pipeline.iter().enumerate() {
        let obj = stage.as_object().ok_or_else(|| QueryError::MalformedPipeline {
            stage_index: index,
            reason: "stage must be an object".into(),
        })?;
        if obj.len() != 1 {
            return Err(QueryError::MalformedPipeline {
                stage_index: index,
                reason: "stage must have exactly one operator key".into(),
            });
        }
        let (name, payload) = obj.iter().next().expect("checked len == 1");

        match name.as_str() {
            "$match" => handle_match(&mut planner, payload, index)?,
            "$project" => handle_project(&mut planner, payload, false, index)?,
            "$addFields" => handle_project(&mut planner, payload, true, index)?,
            "$unset" => handle_unset(&mut planner, payload, index)?,
            "$sort" => handle_sort(&mut planner, payload, index)?,
            "$skip" => handle_skip_limit(&mut planner, payload, index, true)?,
            "$limit" => handle_skip_limit(&mut planner, payload, index, false)?,
            "$count" => handle_count(&mut planner, payload, index)?,
            "$sample" => handle_sample(&mut planner, payload, index)?,
            "$unwind" => handle_unwind(&mut planner, payload, index)?,
            "$group" => handle_group(&mut planner, payload, index)?,
            "$lookup" => handle_lookup(&mut planner, payload, index)?,
            "$facet" => handle_facet(&mut planner, payload, index, policy)?,
            "$text" => handle_top_level_text(&mut planner, payload, index)?,
            other => {
                planner.finalize_pending(Some(planner_temp_placeholder()));
                planner.push_stream_auto(
                    StreamStage::Unknown {
                        name: other.to_string(),
                        payload: payload.clone(),
                    },
                    index,
                    payload,
                );
            }
        }
    }

    planner.finalize_pending(None);
    Ok(planner.plan)
}

// `finalize_pending` needs a name when materializing; stages that don't
// know their own index-derived name yet (the catch-all `Unknown` arm) fall
// back to a plain counter-suffixed name instead of the content hash.
fn planner_temp_placeholder() -> String {
    "tmp_unknown".to_string()
}

fn handle_match(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let resolver = DescriptorTextResolver(planner.ctx.descriptors);
    let compile_ctx = CompileCtx::new(planner.ctx.flavor, "data", &resolver);
    let compiled = compile(payload, &compile_ctx)?;

    if let Some(sql) = compiled.where_sql {
        let builder = planner.pending_or_base();
        builder.where_clauses.push(sql);
        builder.params.extend(compiled.params);
    }
    if let Some(unresolved) = compiled.unresolved {
        // The resolved half (if any) stays fused in the running SELECT; the
        // unresolved remainder becomes a STREAM post-filter over its output.
        let name = planner.next_temp_name(index, payload);
        planner.finalize_pending(Some(name));
        planner.push_stream_auto(StreamStage::Match(unresolved), index, payload);
    }
    Ok(())
}

const PROJECT_OPS: &[&str] = &[
    "$concat",
    "$toUpper",
    "$toLower",
    "$add",
    "$subtract",
    "$multiply",
    "$divide",
    "$cond",
    "$ifNull",
    "$literal",
];

fn render_expr(expr: &Json, planner: &Planner, params: &mut Vec<Json>) -> Option<String> {
    match expr {
        Json::String(s) if s.starts_with('$') && s.len() > 1 => {
            crate::path::translate(&s[1..], planner.ctx.flavor, "data")
                .ok()
                .map(|t| t.sql_expression)
        }
        Json::String(_) | Json::Number(_) | Json::Bool(_) | Json::Null => {
            params.push(expr.clone());
            Some("?".to_string())
        }
        Json::Object(m) if m.len() == 1 => {
            let (op, arg) = m.iter().next()?;
            if !PROJECT_OPS.contains(&op.as_str()) {
                return None;
            }
            match op.as_str() {
                "$literal" => {
                    params.push(arg.clone());
                    Some("?".to_string())
                }
                "$concat" => {
                    let arr = arg.as_array()?;
                    let parts: Option<Vec<String>> =
                        arr.iter().map(|e| render_expr(e, planner, params)).collect();
                    Some(format!("({})", parts?.join(" || ")))
                }
                "$toUpper" => render_expr(arg, planner, params).map(|e| format!("UPPER({e})")),
                "$toLower" => render_expr(arg, planner, params).map(|e| format!("LOWER({e})")),
                "$add" | "$subtract" | "$multiply" | "$divide" => {
                    let arr = arg.as_array()?;
                    if arr.len() != 2 {
                        return None;
                    }
                    let a = render_expr(&arr[0], planner, params)?;
                    let b = render_expr(&arr[1], planner, params)?;
                    let sql_op = match op.as_str() {
                        "$add" => "+",
                        "$subtract" => "-",
                        "$multiply" => "*",
                        _ => "/",
                    };
                    Some(format!("({a} {sql_op} {b})"))
                }
                "$ifNull" => {
                    let arr = arg.as_array()?;
                    if arr.len() != 2 {
                        return None;
                    }
                    let a = render_expr(&arr[0], planner, params)?;
                    let b = render_expr(&arr[1], planner, params)?;
                    Some(format!("COALESCE({a}, {b})"))
                }
                "$cond" => render_cond(arg, planner, params),
                _ => None,
            }
        }
        _ => None,
    }
}

/// `$cond` only supports a single binary comparison as its condition — the
/// common case, and the only one the T1 expression subset covers
/// (SPEC_FULL.md §4.4 "$project/$addFields expression subset").
fn render_cond(arg: &Json, planner: &Planner, params: &mut Vec<Json>) -> Option<String> {
    let (cond, then_expr, else_expr) = match arg {
        Json::Array(a) if a.len() == 3 => (&a[0], &a[1], &a[2]),
        Json::Object(m) => (m.get("if")?, m.get("then")?, m.get("else")?),
        _ => return None,
    };
    let cond_sql = render_bool_expr(cond, planner, params)?;
    let then_sql = render_expr(then_expr, planner, params)?;
    let else_sql = render_expr(else_expr, planner, params)?;
    Some(format!("(CASE WHEN {cond_sql} THEN {then_sql} ELSE {else_sql} END)"))
}

fn render_bool_expr(expr: &Json, planner: &Planner, params: &mut Vec<Json>) -> Option<String> {
    let Json::Object(m) = expr else { return None };
    if m.len() != 1 {
        return None;
    }
    let (op, arg) = m.iter().next()?;
    let arr = arg.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let a = render_expr(&arr[0], planner, params)?;
    let b = render_expr(&arr[1], planner, params)?;
    let sql_op = match op.as_str() {
        "$eq" => "=",
        "$ne" => "!=",
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        "$lte" => "<=",
        _ => return None,
    };
    Some(format!("({a} {sql_op} {b})"))
}

fn handle_project(planner: &mut Planner, payload: &Json, is_add_fields: bool, index: usize) -> Result<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| QueryError::MalformedPipeline {
            stage_index: index,
            reason: "$project/$addFields requires an object".into(),
        })?;

    let mut params = Vec::new();
    let mut set_pairs: Vec<String> = Vec::new();
    let mut include_pairs: Vec<String> = Vec::new();
    let mut exclude_fields: Vec<String> = Vec::new();
    let mut all_supported = true;
    // `_id: 0` can appear alongside an inclusion projection (the one mix
    // Mongo allows), so it's tracked separately rather than folding it into
    // `exclude_fields` and tripping the exclusion-mode branch below.
    let mut suppress_id = false;

    for (field, expr) in obj {
        if field == "_id" && !is_add_fields {
            if let Json::Number(n) = expr {
                if n.as_i64() == Some(0) {
                    suppress_id = true;
                    continue;
                }
                if n.as_i64() == Some(1) {
                    continue; // default behavior already retains `_id`
                }
            }
        }
        match expr {
            Json::Number(n) if !is_add_fields && n.as_i64() == Some(0) => {
                exclude_fields.push(field.clone());
            }
            Json::Number(n) if !is_add_fields && n.as_i64() == Some(1) => {
                include_pairs.push(format!("'{field}', json_extract(data,'$.{field}')"));
            }
            other => match render_expr(other, planner, &mut params) {
                Some(sql) => {
                    if is_add_fields {
                        set_pairs.push(format!("'$.{field}'"));
                        set_pairs.push(sql);
                    } else {
                        include_pairs.push(format!("'{field}', {sql}"));
                    }
                }
                None => {
                    all_supported = false;
                    break;
                }
            },
        }
    }

    if !all_supported {
        planner.finalize_pending(Some(planner.next_temp_name(index, payload)));
        planner.push_stream_auto(StreamStage::Project(payload.clone()), index, payload);
        return Ok(());
    }

    let builder = planner.pending_or_base();
    if is_add_fields {
        if !set_pairs.is_empty() {
            builder.select_list = format!("id, _id, json_set(data, {}) AS data", set_pairs.join(", "));
            builder.params.extend(params);
        }
    } else if !exclude_fields.is_empty() {
        let removals: Vec<String> = exclude_fields.iter().map(|f| format!("'$.{f}'")).collect();
        let base = format!("json_remove(data, {})", removals.join(", "));
        let expr = suppress_id_expr(base, suppress_id);
        builder.select_list = format!("id, _id, {expr} AS data");
    } else {
        let base = format!("json_object({})", include_pairs.join(", "));
        let expr = suppress_id_expr(base, suppress_id);
        builder.select_list = format!("id, _id, {expr} AS data");
        builder.params.extend(params);
    }
    Ok(())
}

/// Marks `_id` for suppression by setting it to an explicit JSON `null`,
/// which [`crate::executor::row_to_doc`] recognizes as "do not inject the
/// real `_id` back in" instead of leaving the key absent (absent means "the
/// stage didn't touch `_id`, inject the real one").
fn suppress_id_expr(base: String, suppress_id: bool) -> String {
    if suppress_id {
        format!("json_set({base}, '$._id', json('null'))")
    } else {
        base
    }
}

fn handle_unset(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let fields = payload
        .as_array()
        .ok_or_else(|| QueryError::MalformedPipeline {
            stage_index: index,
            reason: "$unset requires an array of field names".into(),
        })?;
    let removals: Option<Vec<String>> = fields
        .iter()
        .map(|f| f.as_str().map(|s| format!("'$.{s}'")))
        .collect();
    let Some(removals) = removals else {
        return Err(QueryError::MalformedPipeline {
            stage_index: index,
            reason: "$unset field names must be strings".into(),
        });
    };
    let builder = planner.pending_or_base();
    builder.select_list = format!("id, _id, json_remove(data, {}) AS data", removals.join(", "));
    Ok(())
}

fn handle_sort(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$sort requires an object".into(),
    })?;
    let mut clauses = Vec::new();
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(d) if d >= 0 => SortOrder::Asc,
            Some(_) => SortOrder::Desc,
            None => {
                return Err(QueryError::MalformedPipeline {
                    stage_index: index,
                    reason: format!("$sort direction for {field} must be 1 or -1"),
                });
            }
        };
        let expr = if field == "_id" {
            "_id".to_string()
        } else {
            crate::path::translate(field, planner.ctx.flavor, "data")?.sql_expression
        };
        let dir_sql = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        clauses.push(format!("{expr} {dir_sql}"));
    }
    planner.pending_or_base().order_by = clauses;
    Ok(())
}

fn handle_skip_limit(planner: &mut Planner, payload: &Json, index: usize, is_skip: bool) -> Result<()> {
    let n = payload.as_u64().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$skip/$limit requires a non-negative integer".into(),
    })?;
    let builder = planner.pending_or_base();
    if is_skip {
        builder.offset = Some(n);
    } else {
        builder.limit = Some(n);
    }
    Ok(())
}

fn handle_count(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let field = payload.as_str().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$count requires a field name string".into(),
    })?;
    let builder = planner.pending_or_base();
    builder.select_list = format!("NULL AS id, NULL AS _id, json_object('{field}', COUNT(*)) AS data");
    Ok(())
}

fn handle_sample(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$sample requires {size: n}".into(),
    })?;
    let n = obj
        .get("size")
        .and_then(Json::as_u64)
        .ok_or_else(|| QueryError::MalformedPipeline {
            stage_index: index,
            reason: "$sample requires a numeric size".into(),
        })?;
    let builder = planner.pending_or_base();
    builder.order_by = vec!["RANDOM()".to_string()];
    builder.limit = Some(n);
    Ok(())
}

fn handle_unwind(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let (path, preserve, include_index) = match payload {
        Json::String(s) => (s.trim_start_matches('$').to_string(), false, None),
        Json::Object(m) => {
            let path = m
                .get("path")
                .and_then(Json::as_str)
                .ok_or_else(|| QueryError::MalformedPipeline {
                    stage_index: index,
                    reason: "$unwind object form requires a path".into(),
                })?
                .trim_start_matches('$')
                .to_string();
            let preserve = m
                .get("preserveNullAndEmptyArrays")
                .and_then(Json::as_bool)
                .unwrap_or(false);
            let include_index = m
                .get("includeArrayIndex")
                .and_then(Json::as_str)
                .map(String::from);
            (path, preserve, include_index)
        }
        _ => {
            return Err(QueryError::MalformedPipeline {
                stage_index: index,
                reason: "$unwind requires a path string or options object".into(),
            });
        }
    };

    if preserve || include_index.is_some() {
        let name = planner.next_temp_name(index, payload);
        planner.finalize_pending(Some(name));
        planner.push_stream_auto(
            StreamStage::Unwind(UnwindSpec {
                path,
                preserve_null_and_empty_arrays: preserve,
                include_array_index: include_index,
            }),
            index,
            payload,
        );
        return Ok(());
    }

    let each = crate::path::each_expression(&path, planner.ctx.flavor, "data")?;
    let builder = planner.pending_or_base();
    builder.joins.push(format!("{each} AS je_{index}"));
    builder.select_list = format!(
        "id, _id, json_set(data, '$.{path}', je_{index}.value) AS data"
    );
    Ok(())
}

fn is_simple_accumulator(acc_json: &Json) -> Option<Accumulator> {
    let obj = acc_json.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (op, arg) = obj.iter().next()?;
    match op.as_str() {
        "$sum" => Some(Accumulator::Sum(arg.clone())),
        "$avg" => Some(Accumulator::Avg(arg.clone())),
        "$min" => Some(Accumulator::Min(arg.clone())),
        "$max" => Some(Accumulator::Max(arg.clone())),
        "$push" => Some(Accumulator::Push(arg.clone())),
        "$addToSet" => Some(Accumulator::AddToSet(arg.clone())),
        _ => None,
    }
}

fn render_accumulator(acc: &Accumulator, planner: &Planner, params: &mut Vec<Json>) -> Option<String> {
    let numeric_literal_one = |e: &Json, params: &mut Vec<Json>| -> Option<String> {
        if e.as_i64() == Some(1) {
            Some("1".to_string())
        } else {
            render_expr(e, planner, params)
        }
    };
    match acc {
        Accumulator::Sum(e) => numeric_literal_one(e, params).map(|e| format!("SUM({e})")),
        Accumulator::Avg(e) => render_expr(e, planner, params).map(|e| format!("AVG({e})")),
        Accumulator::Min(e) => render_expr(e, planner, params).map(|e| format!("MIN({e})")),
        Accumulator::Max(e) => render_expr(e, planner, params).map(|e| format!("MAX({e})")),
        Accumulator::Push(e) => render_expr(e, planner, params).map(|e| format!("json_group_array({e})")),
        Accumulator::AddToSet(e) => {
            render_expr(e, planner, params).map(|e| format!("json_group_array(DISTINCT {e})"))
        }
    }
}

fn handle_group(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$group requires an object".into(),
    })?;
    let id_expr = obj.get("_id").cloned().unwrap_or(Json::Null);

    let mut accumulators = Vec::new();
    let mut all_simple = true;
    for (name, spec) in obj {
        if name == "_id" {
            continue;
        }
        match is_simple_accumulator(spec) {
            Some(acc) => accumulators.push((name.clone(), acc)),
            None => {
                all_simple = false;
                break;
            }
        }
    }

    let spec = GroupSpec {
        id_expr: id_expr.clone(),
        accumulators,
    };

    if !all_simple {
        let name = planner.next_temp_name(index, payload);
        planner.finalize_pending(Some(name));
        planner.push_stream(StreamStage::Group(spec), None);
        return Ok(());
    }

    let mut params = Vec::new();
    let (group_by_sql, id_select_sql) = match &id_expr {
        Json::Null => (None, "NULL".to_string()),
        Json::String(s) if s.starts_with('$') => {
            let expr = render_expr(&Json::String(s.clone()), planner, &mut params)
                .unwrap_or_else(|| "NULL".to_string());
            (Some(expr.clone()), expr)
        }
        Json::Object(fields) => {
            let mut group_exprs = Vec::new();
            let mut object_pairs = Vec::new();
            for (k, v) in fields {
                let Some(expr) = render_expr(v, planner, &mut params) else {
                    let name = planner.next_temp_name(index, payload);
                    planner.finalize_pending(Some(name));
                    planner.push_stream(StreamStage::Group(spec), None);
                    return Ok(());
                };
                group_exprs.push(expr.clone());
                object_pairs.push(format!("'{k}', {expr}"));
            }
            (
                Some(group_exprs.join(", ")),
                format!("json_object({})", object_pairs.join(", ")),
            )
        }
        other => {
            let expr = render_expr(other, planner, &mut params).unwrap_or_else(|| "NULL".to_string());
            (Some(expr.clone()), expr)
        }
    };

    let mut acc_pairs = vec![format!("'_id', {id_select_sql}")];
    for (name, acc) in &spec.accumulators {
        match render_accumulator(acc, planner, &mut params) {
            Some(sql) => acc_pairs.push(format!("'{name}', {sql}")),
            None => {
                let name = planner.next_temp_name(index, payload);
                planner.finalize_pending(Some(name));
                planner.push_stream(StreamStage::Group(spec), None);
                return Ok(());
            }
        }
    }

    let source_select = {
        let builder = planner.pending.take().unwrap_or_else(|| SqlBuilder::base(planner.ctx.collection));
        builder.render_select()
    };

    let name = planner.next_temp_name(index, payload);
    let group_by_clause = group_by_sql
        .map(|g| format!(" GROUP BY {g}"))
        .unwrap_or_default();
    let select_sql = format!(
        "SELECT {id_select_sql} AS _id, json_object({}) AS data, MIN(id) AS id FROM ({source_select}){group_by_clause}",
        acc_pairs.join(", ")
    );
    planner.plan.push(PlanStep::Temp(TempStep {
        name: name.clone(),
        select_sql,
        params,
    }));
    planner.pending = Some(SqlBuilder::from_previous(&name));
    Ok(())
}

fn handle_lookup(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$lookup requires an object".into(),
    })?;
    let get_str = |k: &str| -> Result<String> {
        obj.get(k)
            .and_then(Json::as_str)
            .map(String::from)
            .ok_or_else(|| QueryError::MalformedPipeline {
                stage_index: index,
                reason: format!("$lookup requires {k}"),
            })
    };
    let spec = LookupSpec {
        from: get_str("from")?,
        local_field: get_str("localField")?,
        foreign_field: get_str("foreignField")?,
        as_field: get_str("as")?,
    };

    // Always materializable via a correlated subselect producing a
    // json_group_array — position-independent per SPEC_FULL.md §4.4.
    let local_expr = crate::path::translate(&spec.local_field, planner.ctx.flavor, "data")?.sql_expression;
    let foreign_expr =
        crate::path::translate(&spec.foreign_field, planner.ctx.flavor, "t.data")?.sql_expression;

    let source_select = {
        let builder = planner.pending.take().unwrap_or_else(|| SqlBuilder::base(planner.ctx.collection));
        builder.render_select()
    };

    let lookup_expr = format!(
        "(SELECT json_group_array(json(t.data)) FROM {} t WHERE {foreign_expr} = {local_expr})",
        spec.from
    );
    let select_sql = format!(
        "SELECT id, _id, json_set(data, '$.{}', COALESCE({lookup_expr}, json('[]'))) AS data FROM ({source_select})",
        spec.as_field
    );
    let name = planner.next_temp_name(index, payload);
    planner.plan.push(PlanStep::Temp(TempStep {
        name: name.clone(),
        select_sql,
        params: Vec::new(),
    }));
    planner.pending = Some(SqlBuilder::from_previous(&name));
    Ok(())
}

fn handle_facet(planner: &mut Planner, payload: &Json, index: usize, policy: &PlannerPolicy) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| QueryError::MalformedPipeline {
        stage_index: index,
        reason: "$facet requires an object".into(),
    })?;

    planner.finalize_pending(Some(planner.next_temp_name(index, payload)));

    let mut sub_plans = BTreeMap::new();
    for (facet_name, sub_pipeline_json) in obj {
        let sub_pipeline = sub_pipeline_json
            .as_array()
            .ok_or_else(|| QueryError::MalformedPipeline {
                stage_index: index,
                reason: format!("$facet.{facet_name} must be an array"),
            })?;
        let sub_plan = plan(sub_pipeline, planner.ctx.collection, policy, planner.ctx.descriptors)?;
        sub_plans.insert(facet_name.clone(), sub_plan);
    }
    planner.push_stream(StreamStage::Facet(sub_plans), None);
    Ok(())
}

fn handle_top_level_text(planner: &mut Planner, payload: &Json, index: usize) -> Result<()> {
    handle_match(
        planner,
        &Json::Object(Map::from_iter([("$text".to_string(), payload.clone())])),
        index,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> PlannerPolicy {
        PlannerPolicy::new(JsonFlavor::Text)
    }

    #[test]
    fn match_sort_limit_fuse_into_one_sql_step() {
        let pipeline = vec![
            json!({"$match": {"age": {"$gte": 21}}}),
            json!({"$sort": {"age": -1}}),
            json!({"$limit": 10}),
        ];
        let plan = plan(&pipeline, "people", &policy(), &[]).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.is_all_sql());
        let PlanStep::Sql(step) = &plan.steps[0] else {
            panic!("expected a single fused SQL step");
        };
        assert!(step.select_sql.contains("WHERE"));
        assert!(step.select_sql.contains("ORDER BY"));
        assert!(step.select_sql.contains("LIMIT 10"));
    }

    #[test]
    fn unresolved_match_splits_sql_and_stream() {
        let pipeline = vec![json!({"$match": {"name": {"$regex": "^A"}}})];
        let plan = plan(&pipeline, "people", &policy(), &[]).unwrap();
        assert!(!plan.is_all_sql());
        assert!(matches!(plan.steps.last(), Some(PlanStep::Stream(_))));
    }

    #[test]
    fn simple_group_fuses_into_a_temp_table() {
        let pipeline = vec![json!({
            "$group": {"_id": "$category", "total": {"$sum": "$amount"}}
        })];
        let plan = plan(&pipeline, "orders", &policy(), &[]).unwrap();
        assert!(matches!(plan.steps.last(), Some(PlanStep::Temp(_))));
    }

    #[test]
    fn group_with_unsupported_accumulator_streams() {
        let pipeline = vec![json!({
            "$group": {"_id": "$category", "weird": {"$stdDevPop": "$amount"}}
        })];
        let plan = plan(&pipeline, "orders", &policy(), &[]).unwrap();
        assert!(plan
            .steps
            .iter()
            .any(|s| matches!(s, PlanStep::Stream(StreamStep { stage: StreamStage::Group(_), .. }))));
    }

    #[test]
    fn simple_unwind_fuses_via_json_each_join() {
        let pipeline = vec![json!({"$unwind": "$tags"})];
        let plan = plan(&pipeline, "posts", &policy(), &[]).unwrap();
        assert!(plan.is_all_sql());
    }

    #[test]
    fn unwind_with_preserve_streams() {
        let pipeline = vec![json!({
            "$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}
        })];
        let plan = plan(&pipeline, "posts", &policy(), &[]).unwrap();
        assert!(matches!(plan.steps.last(), Some(PlanStep::Stream(_))));
    }

    #[test]
    fn facet_plans_each_branch_independently() {
        let pipeline = vec![json!({
            "$facet": {
                "byAge": [{"$sort": {"age": 1}}],
                "count": [{"$count": "n"}]
            }
        })];
        let plan = plan(&pipeline, "people", &policy(), &[]).unwrap();
        let Some(PlanStep::Stream(StreamStep { stage: StreamStage::Facet(branches), .. })) =
            plan.steps.last()
        else {
            panic!("expected a Facet stream step");
        };
        assert_eq!(branches.len(), 2);
    }

    #[test]
    fn forced_fallback_yields_single_stream_step() {
        let pipeline = vec![json!({"$match": {"a": 1}}), json!({"$sort": {"a": 1}})];
        let forced = policy().with_forced_fallback(true);
        let plan = plan(&pipeline, "people", &forced, &[]).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(
            plan.steps[0],
            PlanStep::Stream(StreamStep { stage: StreamStage::FullPipeline(_), .. })
        ));
    }

    #[test]
    fn project_inclusion_compiles_to_json_object() {
        let pipeline = vec![json!({"$project": {"name": 1, "upper": {"$toUpper": "$name"}}})];
        let plan = plan(&pipeline, "people", &policy(), &[]).unwrap();
        assert!(plan.is_all_sql());
        let PlanStep::Sql(step) = &plan.steps[0] else {
            panic!("expected a fused SQL step");
        };
        assert!(step.select_sql.contains("json_object"));
        assert!(step.select_sql.contains("UPPER"));
    }

    #[test]
    fn project_inclusion_with_id_suppression_marks_null_sentinel() {
        let pipeline = vec![json!({"$project": {"_id": 0, "name": 1}})];
        let plan = plan(&pipeline, "people", &policy(), &[]).unwrap();
        let PlanStep::Sql(step) = &plan.steps[0] else {
            panic!("expected a fused SQL step");
        };
        assert!(step.select_sql.contains("json_set(json_object"));
        assert!(step.select_sql.contains("'$._id', json('null')"));
    }
}
