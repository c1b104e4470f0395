/// Utility module useful for testing. Be warned that the backend and estimator in this module are
/// scripted by substring matching and only meant to be used in tests.
use crate::backend::{Backend, BackendError, Result};
use crate::estimator::Estimator;
use crate::plan::{Explain, PlanNode};
use crate::query::{QueryGraph, TableInstance};
use crate::schema::{AttributeId, ForeignKeyId, Schema, TableId};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

const IMDB_SCHEMA: &str = r#"{
    "name": "imdb",
    "tables": [
        {"name": "title", "cardinality": 2528312, "key_columns": ["id"],
         "indexes": ["title_pkey"],
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "title", "data_type": "text"},
            {"name": "kind_id", "data_type": "integer"},
            {"name": "production_year", "data_type": "integer", "min": "1880", "max": "2019"},
            {"name": "release_date", "data_type": "date"}]},
        {"name": "movie_companies", "cardinality": 2609129, "key_columns": ["id"],
         "indexes": ["movie_companies_pkey", "movie_id_movie_companies"],
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "movie_id", "data_type": "integer", "indexed": true},
            {"name": "company_id", "data_type": "integer"},
            {"name": "company_type_id", "data_type": "integer"},
            {"name": "note", "data_type": "text"}]},
        {"name": "movie_info", "cardinality": 14835720, "key_columns": ["id"],
         "indexes": ["movie_info_pkey", "movie_id_movie_info"],
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "movie_id", "data_type": "integer", "indexed": true},
            {"name": "info_type_id", "data_type": "integer"},
            {"name": "info", "data_type": "text"},
            {"name": "note", "data_type": "text"}]},
        {"name": "movie_keyword", "cardinality": 4523930, "key_columns": ["id"],
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "movie_id", "data_type": "integer", "indexed": true},
            {"name": "keyword_id", "data_type": "integer"}]},
        {"name": "keyword", "cardinality": 134170, "key_columns": ["id"], "is_leaf": true,
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "keyword", "data_type": "text"}]},
        {"name": "company_name", "cardinality": 234997, "key_columns": ["id"], "is_leaf": true,
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "name", "data_type": "text"}]},
        {"name": "company_type", "cardinality": 4, "key_columns": ["id"], "is_leaf": true,
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "kind", "data_type": "text"}]},
        {"name": "kind_type", "cardinality": 7, "key_columns": ["id"], "is_leaf": true,
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "kind", "data_type": "text"}]},
        {"name": "info_type", "cardinality": 113, "key_columns": ["id"], "is_leaf": true,
         "columns": [
            {"name": "id", "data_type": "integer", "indexed": true, "nullable": false},
            {"name": "info", "data_type": "text"}]}
    ],
    "foreign_keys": [
        {"name": "movie_companies_movie_id_fkey", "from_table": "movie_companies",
         "from_columns": ["movie_id"], "to_table": "title", "to_columns": ["id"]},
        {"name": "movie_companies_company_id_fkey", "from_table": "movie_companies",
         "from_columns": ["company_id"], "to_table": "company_name", "to_columns": ["id"]},
        {"name": "movie_companies_company_type_id_fkey", "from_table": "movie_companies",
         "from_columns": ["company_type_id"], "to_table": "company_type", "to_columns": ["id"]},
        {"name": "movie_info_movie_id_fkey", "from_table": "movie_info",
         "from_columns": ["movie_id"], "to_table": "title", "to_columns": ["id"]},
        {"name": "movie_info_info_type_id_fkey", "from_table": "movie_info",
         "from_columns": ["info_type_id"], "to_table": "info_type", "to_columns": ["id"]},
        {"name": "movie_keyword_movie_id_fkey", "from_table": "movie_keyword",
         "from_columns": ["movie_id"], "to_table": "title", "to_columns": ["id"]},
        {"name": "movie_keyword_keyword_id_fkey", "from_table": "movie_keyword",
         "from_columns": ["keyword_id"], "to_table": "keyword", "to_columns": ["id"]},
        {"name": "title_kind_id_fkey", "from_table": "title",
         "from_columns": ["kind_id"], "to_table": "kind_type", "to_columns": ["id"]}
    ]
}"#;

/// A cut-down IMDB schema: three fact tables hanging off `title` plus their lookup tables.
pub fn imdb_schema() -> Schema {
    Schema::from_json(IMDB_SCHEMA).unwrap()
}

pub fn table(schema: &Schema, name: &str) -> TableId {
    schema.table_by_name(name).unwrap()
}

pub fn attr(schema: &Schema, table_name: &str, column: &str) -> AttributeId {
    schema
        .attribute_by_name(table(schema, table_name), column)
        .unwrap()
}

pub fn fk(schema: &Schema, name: &str) -> ForeignKeyId {
    schema.foreign_key_by_name(name).unwrap()
}

/// An unfiltered instance of the table with the table's own cardinality.
pub fn instance(schema: &Schema, table_name: &str) -> TableInstance {
    let table = table(schema, table_name);
    TableInstance::new(table, schema.table(table).cardinality(), vec![])
}

/// A backend whose answers are decided by substrings of the statement. Rules are checked in the
/// order they were added; the first match wins.
#[derive(Default)]
pub struct ScriptedBackend {
    rows: Vec<(String, f64)>,
    counts: Vec<(String, f64)>,
    rejected: Vec<String>,
    timeouts: Vec<String>,
    explains: Vec<(String, Explain)>,
    subplan_logs: Vec<(String, String)>,
    data_dir: Option<PathBuf>,
    disconnected: bool,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedBackend {
    pub const DEFAULT_ROWS: f64 = 1000.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Statements containing `pattern` are estimated at `rows`.
    pub fn with_rows(mut self, pattern: &str, rows: f64) -> Self {
        self.rows.push((pattern.to_string(), rows));
        self
    }

    pub fn with_count(mut self, pattern: &str, count: f64) -> Self {
        self.counts.push((pattern.to_string(), count));
        self
    }

    pub fn with_explain(mut self, pattern: &str, explain: Explain) -> Self {
        self.explains.push((pattern.to_string(), explain));
        self
    }

    pub fn rejecting(mut self, pattern: &str) -> Self {
        self.rejected.push(pattern.to_string());
        self
    }

    pub fn timing_out(mut self, pattern: &str) -> Self {
        self.timeouts.push(pattern.to_string());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Written to `file` in the data directory whenever a statement runs with subplan logging
    /// switched on.
    pub fn with_subplan_log(mut self, file: &str, contents: &str) -> Self {
        self.subplan_logs.push((file.to_string(), contents.to_string()));
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.disconnected = true;
        self
    }

    /// Every statement run so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// Settings each statement ran with, in the order of `calls`.
    pub fn settings(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, settings)| settings.clone())
            .collect()
    }

    fn check(&self, sql: &str, settings: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), settings.to_vec()));
        if self.disconnected {
            return Err(BackendError::Connection("scripted disconnect".to_string()));
        }
        if self.timeouts.iter().any(|pattern| sql.contains(pattern.as_str())) {
            return Err(BackendError::Timeout);
        }
        if let Some(pattern) = self.rejected.iter().find(|pattern| sql.contains(pattern.as_str())) {
            return Err(BackendError::Rejected(format!("rejected {}", pattern)));
        }
        Ok(())
    }

    fn first_match<'a, T>(rules: &'a [(String, T)], sql: &str) -> Option<&'a T> {
        rules
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, value)| value)
    }

    fn write_subplan_logs(&self, settings: &[String]) -> Result<()> {
        let logging = settings
            .iter()
            .any(|setting| setting.contains("print_sub_queries = TRUE"));
        if let (true, Some(dir)) = (logging, &self.data_dir) {
            for (file, contents) in &self.subplan_logs {
                fs::write(dir.join(file), contents)?;
            }
        }
        Ok(())
    }

    fn plan(&self, sql: &str) -> Explain {
        if let Some(explain) = Self::first_match(&self.explains, sql) {
            return explain.clone();
        }
        let rows = Self::first_match(&self.rows, sql)
            .copied()
            .unwrap_or(Self::DEFAULT_ROWS);
        Explain {
            plan: PlanNode {
                plan_rows: rows,
                ..PlanNode::new("Seq Scan")
            },
            ..Explain::default()
        }
    }
}

impl Backend for ScriptedBackend {
    fn explain(&self, sql: &str, settings: &[String]) -> Result<Explain> {
        self.check(sql, settings)?;
        self.write_subplan_logs(settings)?;
        Ok(self.plan(sql))
    }

    fn explain_analyze(&self, sql: &str, settings: &[String]) -> Result<Explain> {
        self.check(sql, settings)?;
        let mut explain = self.plan(sql);
        explain.execution_time.get_or_insert(1.0);
        Ok(explain)
    }

    fn count(&self, sql: &str) -> Result<f64> {
        self.check(sql, &[])?;
        Ok(Self::first_match(&self.counts, sql)
            .copied()
            .unwrap_or(Self::DEFAULT_ROWS))
    }

    fn data_directory(&self) -> Result<PathBuf> {
        if self.disconnected {
            return Err(BackendError::Connection("scripted disconnect".to_string()));
        }
        self.data_dir
            .clone()
            .ok_or_else(|| BackendError::UnexpectedOutput("no data directory".to_string()))
    }
}

/// Estimates every connected query by the sum of its real nodes' cardinalities, or by a fixed
/// value for queries whose SQL contains one of the registered patterns.
#[derive(Default)]
pub struct FixedEstimator {
    values: Vec<(String, f64)>,
}

impl FixedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, pattern: &str, value: f64) -> Self {
        self.values.push((pattern.to_string(), value));
        self
    }
}

impl Estimator for FixedEstimator {
    fn estimate_connected(&self, schema: &Schema, query: &QueryGraph) -> Result<f64> {
        let sql = query.sql(schema, false);
        if let Some((_, value)) = self
            .values
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return Ok(*value);
        }
        Ok(query
            .nodes()
            .map(|node| query.node(node))
            .filter(|instance| !instance.is_virtual())
            .map(|instance| instance.cardinality())
            .sum())
    }
}
