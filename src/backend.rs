//! The database the plans come from. Everything the crate asks of it goes through `Backend`;
//! `PsqlBackend` talks to PostgreSQL through the `psql` client.
use crate::config::ConnectionConfig;
use crate::plan::Explain;
use log::debug;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The statement was refused. Callers usually treat this as data, not as a failure.
    #[error("statement rejected: {0}")]
    Rejected(String),
    #[error("statement timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("unexpected output: {0}")]
    UnexpectedOutput(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid EXPLAIN output: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// `settings` are complete statements (`SET x = y;`) run in the same session before the
/// statement itself.
pub trait Backend: Send + Sync {
    fn explain(&self, sql: &str, settings: &[String]) -> Result<Explain>;

    fn explain_analyze(&self, sql: &str, settings: &[String]) -> Result<Explain>;

    /// Runs a query returning a single number, usually a `COUNT(*)`.
    fn count(&self, sql: &str) -> Result<f64>;

    /// Directory the server reads injected estimates from and writes its subplan logs to.
    fn data_directory(&self) -> Result<PathBuf>;
}

pub struct PsqlBackend {
    config: ConnectionConfig,
}

impl PsqlBackend {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    fn script(&self, settings: &[String], sql: &str) -> String {
        let mut script = String::new();
        if let Some(timeout) = self.config.timeout_secs {
            script.push_str(&format!("SET statement_timeout = {};\n", timeout * 1000));
        }
        for setting in settings {
            script.push_str(setting);
            script.push('\n');
        }
        script.push_str(sql.trim());
        if !script.ends_with(';') {
            script.push(';');
        }
        script.push('\n');
        script
    }

    fn run(&self, settings: &[String], sql: &str) -> Result<String> {
        let script = self.script(settings, sql);
        debug!("Running on {}: {}", self.config.database, script);
        let mut command = Command::new(&self.config.psql);
        command
            .args(["-X", "-q", "-A", "-t", "-v", "ON_ERROR_STOP=1"])
            .arg("-h")
            .arg(&self.config.host)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-U")
            .arg(&self.config.user)
            .arg("-d")
            .arg(&self.config.database)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(password) = &self.config.password {
            command.env("PGPASSWORD", password);
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(Self::classify(output.status.code(), stderr))
    }

    /// psql exits with 3 when a statement of the script failed and with 2 when the connection
    /// was lost or never made.
    fn classify(code: Option<i32>, stderr: String) -> BackendError {
        if stderr.contains("canceling statement due to statement timeout") {
            BackendError::Timeout
        } else if code == Some(3) {
            BackendError::Rejected(stderr)
        } else {
            BackendError::Connection(stderr)
        }
    }
}

impl Backend for PsqlBackend {
    fn explain(&self, sql: &str, settings: &[String]) -> Result<Explain> {
        let output = self.run(settings, &format!("EXPLAIN (FORMAT JSON) {}", sql))?;
        Ok(Explain::from_json(&output)?)
    }

    fn explain_analyze(&self, sql: &str, settings: &[String]) -> Result<Explain> {
        let output = self.run(settings, &format!("EXPLAIN (ANALYZE TRUE, FORMAT JSON) {}", sql))?;
        Ok(Explain::from_json(&output)?)
    }

    fn count(&self, sql: &str) -> Result<f64> {
        let output = self.run(&[], sql)?;
        output
            .trim()
            .parse()
            .map_err(|_| BackendError::UnexpectedOutput(output.trim().to_string()))
    }

    fn data_directory(&self) -> Result<PathBuf> {
        let output = self.run(
            &[],
            "SELECT setting FROM pg_settings WHERE name = 'data_directory';",
        )?;
        let dir = output.trim();
        if dir.is_empty() {
            return Err(BackendError::UnexpectedOutput(output));
        }
        Ok(PathBuf::from(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_script() {
        let backend = PsqlBackend::new(ConnectionConfig {
            timeout_secs: Some(2),
            ..ConnectionConfig::default()
        });
        assert_eq!(
            backend.script(&["SET query_no = 0;".to_string()], "SELECT 1"),
            "SET statement_timeout = 2000;\nSET query_no = 0;\nSELECT 1;\n"
        );
        let backend = PsqlBackend::new(ConnectionConfig::default());
        assert_eq!(backend.script(&[], "SELECT 1;\n"), "SELECT 1;\n");
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            PsqlBackend::classify(
                Some(3),
                "ERROR:  canceling statement due to statement timeout".to_string()
            ),
            BackendError::Timeout
        ));
        assert!(matches!(
            PsqlBackend::classify(Some(3), "ERROR:  syntax error".to_string()),
            BackendError::Rejected(_)
        ));
        assert!(matches!(
            PsqlBackend::classify(Some(2), "could not connect to server".to_string()),
            BackendError::Connection(_)
        ));
    }

    #[test]
    fn test_missing_client() {
        let backend = PsqlBackend::new(ConnectionConfig {
            psql: "/nonexistent/psql".to_string(),
            ..ConnectionConfig::default()
        });
        assert!(matches!(backend.count("SELECT 1"), Err(BackendError::Io(_))));
    }
}
