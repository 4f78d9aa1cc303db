//! Execution plan intermediate representation (SPEC_FULL.md §3, §4.4).
//!
//! An [`ExecutionPlan`] is an ordered list of [`PlanStep`]s, each tagged
//! `Sql | Temp | Stream`. The planner builds these; the executor runs them.
//! Building a plan performs no I/O — it is pure data, consulted against the
//! [`crate::index::IndexManager`]'s in-memory descriptor list only.

use std::collections::BTreeMap;

use serde_json::Value as Json;

/// A single `SQL` plan step: one parameterized `SELECT` producing rows
/// shaped `(id, _id, data)` (or just `(data)` for a terminal projection).
#[derive(Debug, Clone)]
pub struct SqlStep {
    /// The `SELECT` statement text.
    pub select_sql: String,
    /// Bound parameters, in positional (`?`) order.
    pub params: Vec<Json>,
}

/// A `TEMP` plan step: materializes a `SELECT` into a deterministically
/// named temp table (§4.4 "Materialization naming").
#[derive(Debug, Clone)]
pub struct TempStep {
    /// Name reserved under the `tmp_<hash>_<counter>` scheme.
    pub name: String,
    /// The `SELECT` whose output becomes the temp table's rows.
    pub select_sql: String,
    /// Bound parameters, in positional (`?`) order.
    pub params: Vec<Json>,
}

/// Specification for an `$unwind` stage.
#[derive(Debug, Clone)]
pub struct UnwindSpec {
    /// Dotted path to the array field.
    pub path: String,
    /// Whether documents with a missing/empty/non-array field still pass
    /// through, with `path` left untouched (Mongo's `preserveNullAndEmptyArrays`).
    pub preserve_null_and_empty_arrays: bool,
    /// Field name to inject the zero-based element index under, if requested.
    pub include_array_index: Option<String>,
}

/// A single accumulator expression inside a `$group` stage.
#[derive(Debug, Clone)]
pub enum Accumulator {
    /// `$sum` over a numeric expression (or the literal `1` for counting).
    Sum(Json),
    /// `$avg` over a numeric expression.
    Avg(Json),
    /// `$min` over an expression.
    Min(Json),
    /// `$max` over an expression.
    Max(Json),
    /// `$push` — collects every value into an array, duplicates kept.
    Push(Json),
    /// `$addToSet` — collects distinct values into an array.
    AddToSet(Json),
}

/// Specification for a `$group` stage.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    /// The `_id` expression groups are keyed by (may be `null` for a single group).
    pub id_expr: Json,
    /// Named accumulator expressions, evaluated per group.
    pub accumulators: Vec<(String, Accumulator)>,
}

/// Specification for a `$lookup` stage.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    /// Target collection name.
    pub from: String,
    /// Path into the current document to join from.
    pub local_field: String,
    /// Path into the target collection's documents to join on.
    pub foreign_field: String,
    /// Field name the joined array of matches is written to.
    pub as_field: String,
}

/// A sort key and its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A single in-process pipeline stage, run against the previous step's
/// row stream rather than translated to SQL.
#[derive(Debug, Clone)]
pub enum StreamStage {
    /// `$match` with an unresolved (or fully unresolved) predicate.
    Match(Json),
    /// `$project` / `$addFields` outside the T1-supported expression subset.
    Project(Json),
    /// `$unset`.
    Unset(Vec<String>),
    /// `$unwind` that needs `preserveNullAndEmptyArrays` or `includeArrayIndex`.
    Unwind(UnwindSpec),
    /// `$group` whose accumulator set needs in-process evaluation.
    Group(GroupSpec),
    /// `$sort` applied client-side (input came from an earlier `STREAM` step).
    Sort(Vec<(String, SortOrder)>),
    /// `$skip` applied client-side.
    Skip(u64),
    /// `$limit` applied client-side.
    Limit(u64),
    /// `$sample` applied client-side (reservoir sampling over the stream).
    Sample(u64),
    /// `$text` hybrid fallback: case-folded, diacritic-insensitive substring
    /// search (§4.4 "Hybrid $text").
    Text {
        /// The search phrase.
        search: String,
        /// Fields to search; `None` means "every string leaf".
        fields: Option<Vec<String>>,
    },
    /// `$facet`, run as independent sub-plans combined into one document.
    Facet(BTreeMap<String, ExecutionPlan>),
    /// An operator or stage this planner doesn't recognize; carried opaque
    /// so the streaming evaluator can still attempt it or reject cleanly.
    Unknown {
        /// Stage name, e.g. `"$dateToString"`.
        name: String,
        /// The stage's original argument document.
        payload: Json,
    },
    /// Whole-pipeline rejection fallback (§4.4 "Rejection / fallback"):
    /// the planner couldn't classify some stage, so the entire pipeline is
    /// interpreted document-by-document.
    FullPipeline(Vec<Json>),
}

/// A `STREAM` plan step: a stage kind plus where its output goes.
#[derive(Debug, Clone)]
pub struct StreamStep {
    /// The stage to evaluate in-process.
    pub stage: StreamStage,
    /// If a downstream step needs SQL access to this stage's output, it is
    /// re-materialized into a temp table of this name before continuing.
    pub rematerialize: Option<String>,
}

/// One step of an [`ExecutionPlan`].
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Fused SQL SELECT (tier T1).
    Sql(SqlStep),
    /// Materialized temp table (tier T2).
    Temp(TempStep),
    /// In-process streaming stage (tier T3).
    Stream(StreamStep),
}

/// An ordered sequence of plan steps produced by the planner and consumed
/// by the executor. Pure data — building one performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// An empty plan (no steps).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn push(&mut self, step: PlanStep) {
        self.steps.push(step);
    }

    /// True if every step is `Sql` (the whole pipeline fused into one SELECT).
    pub fn is_all_sql(&self) -> bool {
        self.steps.iter().all(|s| matches!(s, PlanStep::Sql(_)))
    }

    /// Names of every temp table this plan will create, in creation order.
    pub fn temp_table_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::Temp(t) => Some(t.name.as_str()),
                PlanStep::Stream(StreamStep {
                    rematerialize: Some(name),
                    ..
                }) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}
