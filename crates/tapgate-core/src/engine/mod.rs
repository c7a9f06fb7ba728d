use crate::classify::classify;
use crate::errors::ExecutionError;
use crate::model::{FailureClassification, SchemaSnapshot, TestCase};
use crate::tap::{self, TapSummary};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

pub mod script;
pub mod sqlite;

pub use script::ScriptBuilder;
pub use sqlite::SqliteExecutor;

/// Runs one combined script and returns every textual result value in order.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, script: &str) -> Result<Vec<String>, ExecutionError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub message: String,
    pub tests_run: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TapSummary>,
    /// Set when the script failed before producing TAP output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClassification>,
}

impl ExecutionReport {
    fn nothing_to_execute() -> Self {
        Self {
            success: true,
            message: "nothing to execute".to_string(),
            tests_run: 0,
            summary: None,
            classification: None,
        }
    }

    fn script_failed(message: String, tests_run: usize) -> Self {
        let classification = classify(&message);
        Self {
            success: false,
            message,
            tests_run,
            summary: None,
            classification: Some(classification),
        }
    }

    fn from_summary(summary: TapSummary, tests_run: usize) -> Self {
        let success = summary.failed == 0;
        let message = if success {
            format!("All {} passed", summary.passed)
        } else {
            let details: Vec<String> = summary.failures().map(|t| t.detail()).collect();
            format!("{} failed: {}", summary.failed, details.join("; "))
        };
        Self {
            success,
            message,
            tests_run,
            summary: Some(summary),
            classification: None,
        }
    }
}

pub struct ExecutionEngine {
    executor: Arc<dyn SqlExecutor>,
    timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<dyn SqlExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Applies the schema and every case's SQL inside one rolled-back transaction.
    pub async fn execute(&self, schema: &SchemaSnapshot, cases: &[&TestCase]) -> ExecutionReport {
        let builder = ScriptBuilder::for_schema(schema).tests(cases.iter().map(|tc| tc.sql.as_str()));
        let tests_run = builder.test_count();
        if tests_run == 0 {
            return ExecutionReport::nothing_to_execute();
        }

        let script = builder.build();
        tracing::debug!(
            event = "execute_script",
            executor = self.executor.name(),
            tests = tests_run,
            bytes = script.len(),
        );

        let rows = match timeout(self.timeout, self.executor.execute(&script)).await {
            Err(_) => {
                let msg = format!("execution timed out after {}s", self.timeout.as_secs());
                return ExecutionReport::script_failed(msg, tests_run);
            }
            Ok(Err(e)) => return ExecutionReport::script_failed(e.display_with_code(), tests_run),
            Ok(Ok(rows)) => rows,
        };

        let summary = tap::parse(&rows.join("\n"));
        if summary.total == 0 {
            tracing::warn!(
                event = "empty_tap_output",
                executor = self.executor.name(),
                tests = tests_run,
            );
        }
        ExecutionReport::from_summary(summary, tests_run)
    }

    /// Targeted re-run of a single case.
    pub async fn execute_one(&self, schema: &SchemaSnapshot, case: &TestCase) -> ExecutionReport {
        self.execute(schema, &[case]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureCategory, Requirement, RequirementKind, SqlDialect};
    use std::sync::Mutex;

    struct CannedExecutor {
        result: Result<Vec<String>, ExecutionError>,
        scripts: Mutex<Vec<String>>,
    }

    impl CannedExecutor {
        fn new(result: Result<Vec<String>, ExecutionError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                scripts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SqlExecutor for CannedExecutor {
        async fn execute(&self, script: &str) -> Result<Vec<String>, ExecutionError> {
            self.scripts.lock().unwrap().push(script.to_string());
            self.result.clone()
        }

        fn name(&self) -> &'static str {
            "canned"
        }
    }

    fn case(sql: &str) -> TestCase {
        let mut tc = TestCase::new(
            "tc-1",
            Requirement {
                category: "orders".into(),
                title: "t".into(),
                kind: RequirementKind::Select,
            },
        );
        tc.sql = sql.into();
        tc
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new("CREATE TABLE t (id INTEGER);", SqlDialect::Sqlite)
    }

    #[tokio::test]
    async fn no_cases_means_no_executor_call() {
        let exec = CannedExecutor::new(Ok(vec![]));
        let engine = ExecutionEngine::new(exec.clone(), Duration::from_secs(5));

        let report = engine.execute(&schema(), &[]).await;
        assert_eq!(report.message, "nothing to execute");
        assert_eq!(report.tests_run, 0);

        let blank = case("   ");
        engine.execute(&schema(), &[&blank]).await;
        assert!(exec.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_passing_rows() {
        let exec = CannedExecutor::new(Ok(vec!["1..2".into(), "ok 1 - a".into(), "ok 2 - b".into()]));
        let engine = ExecutionEngine::new(exec.clone(), Duration::from_secs(5));

        let report = engine.execute_one(&schema(), &case("SELECT 1")).await;
        assert!(report.success);
        assert_eq!(report.message, "All 2 passed");

        let scripts = exec.scripts.lock().unwrap();
        assert!(scripts[0].contains("BEGIN;\nSELECT 1;\nROLLBACK;"));
    }

    #[tokio::test]
    async fn failed_assertions_are_listed() {
        let exec = CannedExecutor::new(Ok(vec![
            "ok 1 - a".into(),
            "not ok 2 - totals match".into(),
            "# got 3".into(),
            "not ok 3 - pending # TODO later".into(),
        ]));
        let engine = ExecutionEngine::new(exec, Duration::from_secs(5));

        let report = engine.execute_one(&schema(), &case("SELECT 1")).await;
        assert!(!report.success);
        assert_eq!(report.message, "1 failed: #2 totals match (got 3)");
        assert_eq!(report.summary.as_ref().map(|s| s.todo), Some(1));
    }

    #[tokio::test]
    async fn script_error_is_classified() {
        let exec = CannedExecutor::new(Err(
            ExecutionError::new("FOREIGN KEY constraint failed").with_code("23503")
        ));
        let engine = ExecutionEngine::new(exec, Duration::from_secs(5));

        let report = engine.execute_one(&schema(), &case("INSERT INTO t VALUES (1)")).await;
        assert!(!report.success);
        assert!(report.summary.is_none());
        let c = report.classification.unwrap();
        assert_eq!(c.category, FailureCategory::Schema);
        assert_eq!(c.error_code.as_deref(), Some("23503"));
    }

    #[tokio::test]
    async fn empty_output_is_zero_total_not_an_error() {
        let exec = CannedExecutor::new(Ok(vec![]));
        let engine = ExecutionEngine::new(exec, Duration::from_secs(5));

        let report = engine.execute_one(&schema(), &case("SELECT 1")).await;
        assert!(report.success);
        assert_eq!(report.message, "All 0 passed");
        assert_eq!(report.summary.map(|s| s.total), Some(0));
    }
}
