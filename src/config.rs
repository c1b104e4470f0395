//! Settings shared by the backend, the plan engine and the injection layer. Flag names are passed
//! to the backend verbatim.
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub psql: String,
    /// Per-statement timeout in seconds. `None` disables it.
    pub timeout_secs: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "imdb".to_string(),
            user: "postgres".to_string(),
            password: None,
            psql: "psql".to_string(),
            timeout_secs: None,
        }
    }
}

/// Names of the session variables that switch estimate injection on, and of the files the
/// estimates and subplan logs live in (relative to the backend's data directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionSettings {
    pub cardest_enabled: String,
    pub joinest_enabled: String,
    pub cardest_fname: String,
    pub joinest_fname: String,
    pub query_no: String,
    pub join_est_no: String,
    pub print_sub_queries: String,
    pub print_single_tbl_queries: String,
    pub single_table_estimations: String,
    pub multi_table_estimations: String,
    pub single_table_subplan_order: String,
    pub multi_table_subplan_order: String,
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            cardest_enabled: "ml_cardest_enabled".to_string(),
            joinest_enabled: "ml_joinest_enabled".to_string(),
            cardest_fname: "ml_cardest_fname".to_string(),
            joinest_fname: "ml_joinest_fname".to_string(),
            query_no: "query_no".to_string(),
            join_est_no: "join_est_no".to_string(),
            print_sub_queries: "print_sub_queries".to_string(),
            print_single_tbl_queries: "print_single_tbl_queries".to_string(),
            single_table_estimations: "single_table_estimations.txt".to_string(),
            multi_table_estimations: "multi_table_estimations.txt".to_string(),
            single_table_subplan_order: "single_table_subplan_order.txt".to_string(),
            multi_table_subplan_order: "multi_table_subplan_order.txt".to_string(),
        }
    }
}

impl InjectionSettings {
    fn reset_counters(&self) -> [String; 2] {
        [
            format!("SET {} = 0;", self.query_no),
            format!("SET {} = 0;", self.join_est_no),
        ]
    }

    /// Statements that make the backend read injected estimates from the given files.
    pub fn injection_statements(
        &self,
        single_table_file: &str,
        multi_table_file: &str,
        single_table: bool,
    ) -> Vec<String> {
        let mut settings = vec![];
        if single_table {
            settings.push(format!("SET {} = TRUE;", self.cardest_enabled));
        }
        settings.push(format!("SET {} = TRUE;", self.joinest_enabled));
        settings.extend(self.reset_counters());
        settings.push(format!("SET {} = '{}';", self.cardest_fname, single_table_file));
        settings.push(format!("SET {} = '{}';", self.joinest_fname, multi_table_file));
        settings
    }

    /// Statements that make the backend log the subplans it considers while planning.
    pub fn logging_statements(&self) -> Vec<String> {
        let mut settings = vec![
            format!("SET {} = TRUE;", self.print_sub_queries),
            format!("SET {} = TRUE;", self.print_single_tbl_queries),
        ];
        settings.extend(self.reset_counters());
        settings
    }
}

/// Plan-shape controls applied before every executed statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub disable_gather: bool,
    pub disable_hash_join: bool,
    pub disable_merge_join: bool,
    pub disable_nested_loop: bool,
    /// Execute `SELECT COUNT(*)` instead of `SELECT *`.
    pub count: bool,
}

impl EngineSettings {
    pub fn statements(&self) -> Vec<String> {
        let mut settings = vec![];
        if self.disable_gather {
            settings.push("SET max_parallel_workers_per_gather = 0;".to_string());
        }
        if self.disable_hash_join {
            settings.push("SET enable_hashjoin = OFF;".to_string());
        }
        if self.disable_merge_join {
            settings.push("SET enable_mergejoin = OFF;".to_string());
        }
        if self.disable_nested_loop {
            settings.push("SET enable_nestloop = OFF;".to_string());
        }
        settings
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub injection: InjectionSettings,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_injection_statements() {
        let settings = InjectionSettings::default();
        assert_eq!(
            settings.injection_statements("single.txt", "multi.txt", true),
            vec![
                "SET ml_cardest_enabled = TRUE;",
                "SET ml_joinest_enabled = TRUE;",
                "SET query_no = 0;",
                "SET join_est_no = 0;",
                "SET ml_cardest_fname = 'single.txt';",
                "SET ml_joinest_fname = 'multi.txt';",
            ]
        );
        assert_eq!(
            settings.injection_statements("single.txt", "multi.txt", false)[0],
            "SET ml_joinest_enabled = TRUE;"
        );
    }

    #[test]
    fn test_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"connection": {"database": "stats"}, "engine": {"disable_gather": true}}"#,
        )
        .unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.connection.database, "stats");
        assert_eq!(config.connection.port, 5432);
        assert_eq!(config.injection, InjectionSettings::default());
        assert_eq!(
            config.engine.statements(),
            vec!["SET max_parallel_workers_per_gather = 0;"]
        );
    }
}
