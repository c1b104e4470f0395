use crate::backend::{Backend, BackendError, Result};
use crate::config::EngineSettings;
use crate::expr;
use crate::plan::{Explain, PlanNode};
use crate::query::QueryGraph;
use crate::schema::Schema;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Actual row counts keyed by the aliases of the joined tables.
pub type Cardinalities = BTreeMap<BTreeSet<String>, f64>;

/// Executes queries with `EXPLAIN ANALYZE` under fixed plan-shape settings.
pub struct PlanEngine<'a> {
    schema: &'a Schema,
    backend: &'a dyn Backend,
    settings: EngineSettings,
    print_plan: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub execution_time_ms: f64,
    pub cardinalities: Cardinalities,
    pub used_gather: bool,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct ExecStats {
    pub planning_time_ms: f64,
    pub execution_time_ms: f64,
    pub num_cardinalities: usize,
    pub used_gather: bool,
}

impl ExecutionReport {
    pub fn stats(&self, explain: &Explain) -> ExecStats {
        ExecStats {
            planning_time_ms: explain.planning_time.unwrap_or_default(),
            execution_time_ms: self.execution_time_ms,
            num_cardinalities: self.cardinalities.len(),
            used_gather: self.used_gather,
        }
    }
}

impl<'a> PlanEngine<'a> {
    pub fn new(schema: &'a Schema, backend: &'a dyn Backend, settings: EngineSettings) -> Self {
        Self {
            schema,
            backend,
            settings,
            print_plan: false,
        }
    }

    pub fn set_print_plan(&mut self, print_plan: bool) -> &mut Self {
        self.print_plan = print_plan;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Runs the query's SQL after the engine settings and `extra_settings`. Returns `None` when
    /// the statement timed out.
    pub fn execute(
        &self,
        query: &QueryGraph,
        extra_settings: &[String],
    ) -> Result<Option<ExecutionReport>> {
        let sql = query.sql(self.schema, self.settings.count);
        Ok(self
            .run(&sql, extra_settings)?
            .map(|explain| self.report(&explain, cardinalities(query, &explain.plan))))
    }

    /// Like `execute` for SQL text. No cardinalities are collected since there is no query
    /// graph to attribute them to.
    pub fn execute_sql(
        &self,
        sql: &str,
        extra_settings: &[String],
    ) -> Result<Option<ExecutionReport>> {
        Ok(self
            .run(sql, extra_settings)?
            .map(|explain| self.report(&explain, Cardinalities::new())))
    }

    fn run(&self, sql: &str, extra_settings: &[String]) -> Result<Option<Explain>> {
        let mut settings = self.settings.statements();
        settings.extend(extra_settings.iter().cloned());
        match self.backend.explain_analyze(sql, &settings) {
            Ok(explain) => {
                if self.print_plan {
                    info!("Plan for: {}\n{}", sql, explain.plan);
                }
                Ok(Some(explain))
            }
            Err(BackendError::Timeout) => {
                debug!("Timed out: {}", sql);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn report(&self, explain: &Explain, cardinalities: Cardinalities) -> ExecutionReport {
        let used_gather = explain.contains_gather();
        if self.settings.disable_gather && used_gather {
            warn!("Gather used anyway");
        }
        ExecutionReport {
            execution_time_ms: explain.execution_time.unwrap_or_default(),
            cardinalities,
            used_gather,
        }
    }
}

/// Actual row counts of every subtree whose output is the unfiltered join of its tables, i.e.
/// whose count is the cardinality of the matching subquery.
pub fn cardinalities(query: &QueryGraph, plan: &PlanNode) -> Cardinalities {
    let all = query.real_aliases();
    let mut cardinalities = Cardinalities::new();
    collect_cardinalities(query, &all, plan, &mut cardinalities);
    cardinalities
}

fn collect_cardinalities(
    query: &QueryGraph,
    all: &BTreeSet<String>,
    node: &PlanNode,
    cardinalities: &mut Cardinalities,
) -> BTreeSet<String> {
    let tables: BTreeSet<String> = match &node.alias {
        Some(alias) => all.get(alias).cloned().into_iter().collect(),
        None => node
            .plans
            .iter()
            .flat_map(|child| collect_cardinalities(query, all, child, cardinalities))
            .collect(),
    };
    if !tables.is_empty() && is_unfiltered(query, all, &tables, node) {
        if let (Some(rows), Some(loops)) = (node.actual_rows, node.actual_loops) {
            cardinalities.insert(tables.clone(), rows * loops);
        }
    }
    tables
}

fn is_unfiltered(
    query: &QueryGraph,
    all: &BTreeSet<String>,
    tables: &BTreeSet<String>,
    node: &PlanNode,
) -> bool {
    if tables == all {
        return true;
    }
    let mut conditions = vec![];
    if let Some(index_cond) = &node.index_cond {
        conditions.push(index_cond.as_str());
    }
    if let Some(filter) = &node.filter {
        let removed = node.rows_removed_by_filter.map_or(false, |rows| rows > 0.0);
        if removed || node.index_cond.is_some() {
            conditions.push(filter.as_str());
        }
    }
    if tables.len() > 1 {
        return conditions.is_empty();
    }

    let Some(instance) = tables
        .iter()
        .next()
        .and_then(|alias| query.node_by_alias(alias))
        .map(|node| query.node(node))
    else {
        return false;
    };
    if conditions.is_empty() {
        return instance.predicates().is_empty();
    }
    let conjuncts: usize = conditions
        .iter()
        .map(|cond| expr::split_condition(cond).len())
        .sum();
    instance.predicates().len() == conjuncts
}
