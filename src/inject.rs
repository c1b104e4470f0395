//! Feeding external cardinality estimates to the backend.
//!
//! While planning a query with subplan logging switched on, the backend writes the table sets it
//! considers to two order files, one for single tables and one for joins. Every logged subplan
//! is rebuilt as a query graph, estimated, and the estimates are written to two files the
//! backend reads back line by line when the query runs with injection switched on. The line
//! order of the estimate files is the whole contract: nothing but position ties an estimate to
//! its subplan.
use crate::backend::{Backend, BackendError};
use crate::config::InjectionSettings;
use crate::engine::PlanEngine;
use crate::estimator::{Estimator, UNKNOWN};
use crate::expr;
use crate::query::{NodeId, QueryGraph, TableInstance};
use crate::reconstruct::{merge_queries, real_node, resolve_join, EquivalenceJoin, JoinResolution};
use crate::schema::Schema;
use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("unknown alias {0} in subplan log")]
    UnknownAlias(String),
    #[error("unknown table {0} in subplan log")]
    UnknownTable(String),
    #[error("unknown join type: {0}")]
    UnknownJoinType(String),
    #[error("subplan {0} is referenced before it is logged")]
    UnknownSubplan(i64),
    #[error("join subplan {id} has {inputs} inputs")]
    MalformedSubplan { id: i64, inputs: usize },
    #[error("{infos} join infos for {estimates} join estimates")]
    JoinInfoCount { infos: usize, estimates: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid subplan log: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, InjectError>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
pub enum JoinType {
    Inner,
    Left,
    Full,
    Semi,
    Anti,
}

/// Position of a subplan's estimate: in the join estimates if `is_multi`, otherwise in the
/// single-table ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubplanRef {
    pub is_multi: bool,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinInfo {
    pub join_type: JoinType,
    pub outer: SubplanRef,
    pub inner: SubplanRef,
}

/// File names of the written estimates, relative to the backend's data directory.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimationFiles {
    pub single_table: String,
    pub multi_table: String,
    pub estimation_time: Duration,
}

/// Subplans rebuilt from the backend's JSON subplan logs. `None` marks a subplan that could not
/// be rebuilt; its estimate is `-1`.
#[derive(Debug, Clone, Default)]
pub struct ParsedSubplans {
    pub single_table: Vec<Option<QueryGraph>>,
    pub multi_table: Vec<Option<QueryGraph>>,
    pub join_infos: Vec<Option<JoinInfo>>,
}

#[derive(Debug, Deserialize)]
struct SingleTableEntry {
    id: i64,
    table_alias: String,
    table: String,
    #[serde(default)]
    predicates: Vec<String>,
    rows: f64,
}

#[derive(Debug, Deserialize)]
struct ChildEntry {
    id: i64,
    rows: f64,
}

#[derive(Debug, Deserialize)]
struct MultiTableEntry {
    id: i64,
    join_type: String,
    rows: f64,
    children: Vec<ChildEntry>,
    #[serde(default)]
    join_clauses: Vec<String>,
}

/// A logged subplan as seen by the joins above it.
#[derive(Debug, Clone)]
struct LoggedSubplan {
    query: Option<QueryGraph>,
    /// Join clauses that belong to a join further up.
    pushed_down: Vec<String>,
    rows: f64,
    join_type: Option<JoinType>,
}

impl LoggedSubplan {
    fn unresolved(rows: f64) -> Self {
        Self {
            query: None,
            pushed_down: vec![],
            rows,
            join_type: None,
        }
    }
}

/// The join-size rules of the backend's planner, applied to an inner-join estimate.
pub fn correct_estimate(join_type: JoinType, estimate: f64, outer: f64, inner: f64) -> f64 {
    if join_type == JoinType::Inner {
        return estimate;
    }
    if outer == UNKNOWN || inner == UNKNOWN {
        return UNKNOWN;
    }
    match join_type {
        JoinType::Inner => estimate,
        JoinType::Left => estimate.max(outer),
        JoinType::Full => estimate.max(outer.max(inner)),
        JoinType::Semi => UNKNOWN,
        JoinType::Anti => (outer - estimate).max(0.0),
    }
}

/// Corrects the join estimates in place, in order, so a join sees the corrected estimates of
/// the joins below it. Joins whose inputs have no estimate here are left alone.
pub fn correct_join_estimates(
    single_table: &[f64],
    multi_table: &mut [f64],
    join_infos: &[Option<JoinInfo>],
) -> Result<()> {
    if join_infos.len() != multi_table.len() {
        return Err(InjectError::JoinInfoCount {
            infos: join_infos.len(),
            estimates: multi_table.len(),
        });
    }
    for (idx, info) in join_infos.iter().enumerate() {
        let Some(info) = info else {
            continue;
        };
        if multi_table[idx] == UNKNOWN || info.join_type == JoinType::Inner {
            continue;
        }
        let lookup = |subplan: SubplanRef| {
            if subplan.is_multi {
                multi_table.get(subplan.index).copied()
            } else {
                single_table.get(subplan.index).copied()
            }
        };
        let (Some(outer), Some(inner)) = (lookup(info.outer), lookup(info.inner)) else {
            debug!("No input estimates for {} join {}", info.join_type, idx);
            continue;
        };
        let corrected = correct_estimate(info.join_type, multi_table[idx], outer, inner);
        if corrected != multi_table[idx] {
            debug!(
                "Corrected {} join {} from {} to {}",
                info.join_type, idx, multi_table[idx], corrected
            );
        }
        multi_table[idx] = corrected;
    }
    Ok(())
}

/// One `%f` formatted estimate per line.
pub fn save_estimations(estimations: &[f64], path: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for estimation in estimations {
        writeln!(writer, "{:.6}", estimation)?;
    }
    writer.flush()
}

/// Estimates `single_table ++ multi_table` in one bulk call and writes the two estimate files
/// to `data_dir`. The single-table file is only written when there are single-table subplans.
#[allow(clippy::too_many_arguments)]
pub fn estimate_and_save(
    schema: &Schema,
    single_table: &[Option<QueryGraph>],
    multi_table: &[Option<QueryGraph>],
    estimator: &dyn Estimator,
    data_dir: &Path,
    settings: &InjectionSettings,
    join_infos: Option<&[Option<JoinInfo>]>,
) -> Result<EstimationFiles> {
    let all: Vec<Option<QueryGraph>> = single_table.iter().chain(multi_table).cloned().collect();
    let start = Instant::now();
    let estimations = estimator.bulk_estimate(schema, &[all])?;
    let estimation_time = start.elapsed();

    let (single_estimations, multi_estimations) = estimations.split_at(single_table.len());
    let mut multi_estimations = multi_estimations.to_vec();
    if let Some(join_infos) = join_infos {
        correct_join_estimates(single_estimations, &mut multi_estimations, join_infos)?;
    }

    if !single_table.is_empty() {
        save_estimations(
            single_estimations,
            &data_dir.join(&settings.single_table_estimations),
        )?;
    }
    save_estimations(
        &multi_estimations,
        &data_dir.join(&settings.multi_table_estimations),
    )?;
    info!(
        "Saved {} single table and {} join estimates in {:?}",
        single_estimations.len(),
        multi_estimations.len(),
        estimation_time
    );
    Ok(EstimationFiles {
        single_table: settings.single_table_estimations.clone(),
        multi_table: settings.multi_table_estimations.clone(),
        estimation_time,
    })
}

/// Reads the alias sets of a line-oriented subplan order log. Lines starting with
/// `"table_aliases"` carry a JSON array of aliases, lines starting with `"table_alias"` a single
/// alias.
pub fn parse_subplan_order(query: &QueryGraph, text: &str) -> Result<Vec<Vec<NodeId>>> {
    let lookup =
        |alias: &str| real_node(query, alias).ok_or_else(|| InjectError::UnknownAlias(alias.to_string()));
    let value = |line: &str| {
        line.split(':')
            .nth(1)
            .unwrap_or_default()
            .trim()
            .trim_end_matches(',')
            .to_string()
    };

    let mut order = vec![];
    for line in text.lines().map(str::trim_start) {
        if line.starts_with("\"table_aliases\"") {
            let aliases: Vec<String> = serde_json::from_str(&value(line))?;
            order.push(
                aliases
                    .iter()
                    .map(|alias| lookup(alias))
                    .collect::<Result<Vec<_>>>()?,
            );
        } else if line.starts_with("\"table_alias\"") {
            let alias = value(line);
            order.push(vec![lookup(alias.trim_matches('"'))?]);
        }
    }
    Ok(order)
}

/// A missing log means the backend considered no subplans of that kind.
pub fn extract_subplan_order(query: &QueryGraph, path: &Path) -> Result<Vec<Vec<NodeId>>> {
    match fs::read_to_string(path) {
        Ok(text) => parse_subplan_order(query, &text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(vec![]),
        Err(err) => Err(err.into()),
    }
}

pub fn extract_subplan_queries(
    schema: &Schema,
    query: &QueryGraph,
    path: &Path,
) -> Result<Vec<QueryGraph>> {
    Ok(extract_subplan_order(query, path)?
        .iter()
        .map(|nodes| query.build_subquery(schema, nodes))
        .collect())
}

/// The JSON subplan logs are a sequence of objects each followed by `,\n`.
fn parse_log_entries<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    let body = text.trim_end().trim_end_matches(',');
    Ok(serde_json::from_str(&format!("[{}]", body))?)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

pub struct CardinalityInjector<'a> {
    schema: &'a Schema,
    backend: &'a dyn Backend,
    settings: InjectionSettings,
    only_inner: bool,
}

impl<'a> CardinalityInjector<'a> {
    pub fn new(schema: &'a Schema, backend: &'a dyn Backend, settings: InjectionSettings) -> Self {
        Self {
            schema,
            backend,
            settings,
            only_inner: false,
        }
    }

    /// Only rebuild inner joins from the JSON subplan logs.
    pub fn with_only_inner(mut self, only_inner: bool) -> Self {
        self.only_inner = only_inner;
        self
    }

    pub fn settings(&self) -> &InjectionSettings {
        &self.settings
    }

    /// Plans `sql` with subplan logging on and returns the paths of the fresh order logs.
    pub fn create_subplan_order_files(&self, sql: &str, data_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let single_table_file = data_dir.join(&self.settings.single_table_subplan_order);
        let multi_table_file = data_dir.join(&self.settings.multi_table_subplan_order);
        remove_if_exists(&single_table_file)?;
        remove_if_exists(&multi_table_file)?;
        self.backend
            .explain(sql, &self.settings.logging_statements())?;
        Ok((single_table_file, multi_table_file))
    }

    /// Single-table and join subqueries of `query` in the order the backend asks for them.
    pub fn build_subplan_queries(
        &self,
        data_dir: &Path,
        query: &QueryGraph,
    ) -> Result<(Vec<QueryGraph>, Vec<QueryGraph>)> {
        let (single_table_file, multi_table_file) =
            self.create_subplan_order_files(&query.sql(self.schema, false), data_dir)?;
        Ok((
            extract_subplan_queries(self.schema, query, &single_table_file)?,
            extract_subplan_queries(self.schema, query, &multi_table_file)?,
        ))
    }

    /// Estimates the subplans of `query` and writes the estimate files.
    pub fn setup(
        &self,
        query: &QueryGraph,
        estimator: &dyn Estimator,
        single_table: bool,
    ) -> Result<EstimationFiles> {
        let data_dir = self.backend.data_directory()?;
        let (single_table_queries, multi_table_queries) =
            self.build_subplan_queries(&data_dir, query)?;
        let single_table_queries: Vec<_> = if single_table {
            single_table_queries.into_iter().map(Some).collect()
        } else {
            vec![]
        };
        let multi_table_queries: Vec<_> = multi_table_queries.into_iter().map(Some).collect();
        estimate_and_save(
            self.schema,
            &single_table_queries,
            &multi_table_queries,
            estimator,
            &data_dir,
            &self.settings,
            None,
        )
    }

    /// Like `setup` for SQL text: the subplans are rebuilt from the JSON subplan logs and join
    /// estimates are corrected for their join type.
    pub fn parse_setup(
        &self,
        sql: &str,
        estimator: &dyn Estimator,
        single_table: bool,
    ) -> Result<EstimationFiles> {
        let data_dir = self.backend.data_directory()?;
        let mut parsed = self.extract_parse_subplans(sql, &data_dir)?;
        if !single_table {
            parsed.single_table.clear();
        }
        estimate_and_save(
            self.schema,
            &parsed.single_table,
            &parsed.multi_table,
            estimator,
            &data_dir,
            &self.settings,
            Some(&parsed.join_infos),
        )
    }

    pub fn extract_parse_subplans(&self, sql: &str, data_dir: &Path) -> Result<ParsedSubplans> {
        let (single_table_file, multi_table_file) = self.create_subplan_order_files(sql, data_dir)?;
        let single_entries: Vec<SingleTableEntry> = parse_log_entries(&single_table_file)?;
        let multi_entries: Vec<MultiTableEntry> = parse_log_entries(&multi_table_file)?;

        let mut id_to_index: FxHashMap<i64, SubplanRef> = FxHashMap::default();
        let mut logged: FxHashMap<i64, LoggedSubplan> = FxHashMap::default();
        let mut parsed = ParsedSubplans::default();

        for entry in single_entries {
            let subplan = self.single_table_subplan(&entry)?;
            id_to_index.insert(
                entry.id,
                SubplanRef {
                    is_multi: false,
                    index: parsed.single_table.len(),
                },
            );
            parsed.single_table.push(subplan.query.clone());
            logged.insert(entry.id, subplan);
        }

        for entry in multi_entries {
            let (subplan, children) = self.join_subplan(&entry, &logged)?;
            id_to_index.insert(
                entry.id,
                SubplanRef {
                    is_multi: true,
                    index: parsed.multi_table.len(),
                },
            );
            parsed.multi_table.push(if subplan.pushed_down.is_empty() {
                subplan.query.clone()
            } else {
                None
            });
            let join_info = match (subplan.join_type, children) {
                (Some(join_type), Some((outer, inner))) => Some(JoinInfo {
                    join_type,
                    outer: *id_to_index
                        .get(&outer)
                        .ok_or(InjectError::UnknownSubplan(outer))?,
                    inner: *id_to_index
                        .get(&inner)
                        .ok_or(InjectError::UnknownSubplan(inner))?,
                }),
                _ => None,
            };
            parsed.join_infos.push(join_info);
            logged.insert(entry.id, subplan);
        }

        let unresolved = parsed
            .single_table
            .iter()
            .chain(&parsed.multi_table)
            .filter(|query| query.is_none())
            .count();
        debug!(
            "{} of {} logged subplans could not be rebuilt",
            unresolved,
            parsed.single_table.len() + parsed.multi_table.len()
        );
        Ok(parsed)
    }

    fn single_table_subplan(&self, entry: &SingleTableEntry) -> Result<LoggedSubplan> {
        if entry.table == "(null)"
            || entry
                .predicates
                .iter()
                .any(|pred| pred.contains("unsupported expr"))
        {
            return Ok(LoggedSubplan::unresolved(UNKNOWN));
        }
        let table = self
            .schema
            .table_by_name(&entry.table)
            .ok_or_else(|| InjectError::UnknownTable(entry.table.clone()))?;
        let texts: Vec<String> = entry
            .predicates
            .iter()
            .map(|pred| format!("({})", pred))
            .collect();
        let predicates =
            expr::parse_arbitrary_predicates(self.schema, table, &entry.table_alias, &texts, true);
        let instance =
            TableInstance::build(self.schema, self.backend, table, predicates, &entry.table_alias)?;
        let mut query = QueryGraph::new();
        query.add_node_with_alias(instance, entry.table_alias.clone());
        Ok(LoggedSubplan {
            query: Some(query),
            pushed_down: vec![],
            rows: entry.rows,
            join_type: None,
        })
    }

    /// Rebuilds a logged join from its two logged inputs. Also returns the ids of the inputs
    /// when the join type can be corrected for.
    fn join_subplan(
        &self,
        entry: &MultiTableEntry,
        logged: &FxHashMap<i64, LoggedSubplan>,
    ) -> Result<(LoggedSubplan, Option<(i64, i64)>)> {
        let unresolved = Ok((LoggedSubplan::unresolved(entry.rows), None));
        let join_type = match entry.join_type.as_str() {
            "Inner" => JoinType::Inner,
            _ if self.only_inner => return unresolved,
            "Left" => JoinType::Left,
            "Full" => JoinType::Full,
            "Semi" => JoinType::Semi,
            "Anti" => JoinType::Anti,
            other => return Err(InjectError::UnknownJoinType(other.to_string())),
        };

        let mut inputs = vec![];
        let mut conditions = vec![];
        for child in &entry.children {
            if child.id == -1 {
                return unresolved;
            }
            let subplan = logged
                .get(&child.id)
                .ok_or(InjectError::UnknownSubplan(child.id))?;
            let Some(query) = &subplan.query else {
                return unresolved;
            };
            if subplan.rows != child.rows
                || subplan.join_type.map_or(false, |kind| kind != JoinType::Inner)
            {
                return unresolved;
            }
            inputs.push((child.id, query));
            conditions.extend(subplan.pushed_down.iter().cloned());
        }
        let [(outer_id, first), (inner_id, second)] = inputs[..] else {
            return Err(InjectError::MalformedSubplan {
                id: entry.id,
                inputs: inputs.len(),
            });
        };
        conditions.extend(entry.join_clauses.iter().cloned());

        let mut joins: Vec<EquivalenceJoin> = vec![];
        let mut pushed_down = vec![];
        for cond in conditions {
            let parts: Vec<&str> = cond.split_whitespace().collect();
            let [left, "=", right] = parts[..] else {
                return unresolved;
            };
            let (Some(left), Some(right)) = (split_column(left), split_column(right)) else {
                return unresolved;
            };
            match resolve_join(self.schema, first, second, left, right) {
                JoinResolution::Join(join) => {
                    if !joins.contains(&join) {
                        joins.push(join);
                    }
                }
                JoinResolution::Orphaned => pushed_down.push(cond),
                JoinResolution::Rejected => return unresolved,
            }
        }

        let query = merge_queries(self.schema, first, second, &joins);
        Ok((
            LoggedSubplan {
                query: Some(query),
                pushed_down,
                rows: entry.rows,
                join_type: Some(join_type),
            },
            Some((outer_id, inner_id)),
        ))
    }

    /// Runs `query` with the estimates in `files` injected. Returns the runtime in seconds, or
    /// `None` if the query timed out.
    pub fn execute_query(
        &self,
        files: &EstimationFiles,
        query: &QueryGraph,
        engine: &PlanEngine,
        single_table: bool,
    ) -> Result<Option<f64>> {
        let settings =
            self.settings
                .injection_statements(&files.single_table, &files.multi_table, single_table);
        Ok(engine
            .execute(query, &settings)?
            .map(|report| report.execution_time_ms / 1000.0))
    }

    pub fn execute_sql(
        &self,
        files: &EstimationFiles,
        sql: &str,
        engine: &PlanEngine,
        single_table: bool,
    ) -> Result<Option<f64>> {
        let settings =
            self.settings
                .injection_statements(&files.single_table, &files.multi_table, single_table);
        Ok(engine
            .execute_sql(sql, &settings)?
            .map(|report| report.execution_time_ms / 1000.0))
    }

    /// Estimation time and runtime of `query` with injected estimates.
    pub fn runtime(
        &self,
        query: &QueryGraph,
        estimator: &dyn Estimator,
        engine: &PlanEngine,
        single_table: bool,
    ) -> Result<(Duration, Option<f64>)> {
        let files = self.setup(query, estimator, single_table)?;
        let runtime = self.execute_query(&files, query, engine, single_table)?;
        Ok((files.estimation_time, runtime))
    }

    pub fn parse_runtime(
        &self,
        sql: &str,
        estimator: &dyn Estimator,
        engine: &PlanEngine,
        single_table: bool,
    ) -> Result<(Duration, Option<f64>)> {
        let files = self.parse_setup(sql, estimator, single_table)?;
        let runtime = self.execute_sql(&files, sql, engine, single_table)?;
        Ok((files.estimation_time, runtime))
    }
}

/// `alias.column`, nothing more and nothing less.
fn split_column(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(alias), Some(column), None) => Some((alias, column)),
        _ => None,
    }
}
