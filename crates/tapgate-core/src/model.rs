use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequirementKind {
    Insert,
    Update,
    Delete,
    Select,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::Insert => "INSERT",
            RequirementKind::Update => "UPDATE",
            RequirementKind::Delete => "DELETE",
            RequirementKind::Select => "SELECT",
        }
    }
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub category: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
}

/// Where a recorded result came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStage {
    /// The case's SQL ran against the schema.
    #[default]
    Execution,
    /// No candidate was accepted, so nothing ran.
    Generation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub stage: ResultStage,
}

impl TestResult {
    pub fn now(success: bool, message: impl Into<String>) -> Self {
        Self {
            executed_at: Utc::now(),
            success,
            message: message.into(),
            stage: ResultStage::Execution,
        }
    }

    pub fn generation_failed(reason: impl fmt::Display) -> Self {
        Self {
            executed_at: Utc::now(),
            success: false,
            message: format!("generation failed: {}", reason),
            stage: ResultStage::Generation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub requirement: Requirement,
    #[serde(default)]
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_results: Vec<TestResult>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            id: id.into(),
            requirement,
            sql: String::new(),
            test_results: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sql.trim().is_empty()
    }

    /// The last recorded result is the authoritative pass/fail state.
    pub fn latest_result(&self) -> Option<&TestResult> {
        self.test_results.last()
    }

    pub fn attempts(&self) -> u32 {
        u32::try_from(self.test_results.len()).unwrap_or(u32::MAX)
    }

    pub fn record(&mut self, result: TestResult) {
        self.test_results.push(result);
    }

    pub fn is_failing(&self) -> bool {
        self.latest_result().is_some_and(|r| !r.success)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryPlan {
    pub name: String,
    pub test_cases: Vec<TestCase>,
}

/// Requirement to test-case mapping. Categories keep insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestPlan {
    pub categories: Vec<CategoryPlan>,
}

/// Position of a test case inside a [`TestPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub category: usize,
    pub index: usize,
}

impl TestPlan {
    pub fn get(&self, slot: Slot) -> Option<&TestCase> {
        self.categories
            .get(slot.category)
            .and_then(|c| c.test_cases.get(slot.index))
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut TestCase> {
        self.categories
            .get_mut(slot.category)
            .and_then(|c| c.test_cases.get_mut(slot.index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &TestCase)> {
        self.categories.iter().enumerate().flat_map(|(ci, cat)| {
            cat.test_cases.iter().enumerate().map(move |(ti, tc)| {
                (
                    Slot {
                        category: ci,
                        index: ti,
                    },
                    tc,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.test_cases.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[default]
    Sqlite,
    Postgres,
}

/// Read-only schema context shared by every generator and execution of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSnapshot {
    pub ddl: String,
    pub extensions: Vec<String>,
    /// Human/LLM readable rendering produced by the schema renderer.
    pub rendered: String,
    pub dialect: SqlDialect,
}

impl SchemaSnapshot {
    pub fn new(ddl: impl Into<String>, dialect: SqlDialect) -> Self {
        let ddl = ddl.into();
        Self {
            rendered: ddl.clone(),
            ddl,
            extensions: Vec::new(),
            dialect,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered = rendered.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Schema,
    SqlQuality,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Schema => "schema",
            FailureCategory::SqlQuality => "sql_quality",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureClassification {
    pub category: FailureCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    pub should_retry_with_schema_fix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaIssue {
    pub testcase_id: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Requirement {
        Requirement {
            category: "orders".into(),
            title: "place order".into(),
            kind: RequirementKind::Insert,
        }
    }

    #[test]
    fn latest_result_is_authoritative() {
        let mut tc = TestCase::new("tc-1", req());
        assert!(!tc.is_failing());
        tc.record(TestResult::now(false, "boom"));
        tc.record(TestResult::now(true, "All 1 passed"));
        assert!(!tc.is_failing());
        assert_eq!(tc.attempts(), 2);
        assert_eq!(tc.latest_result().map(|r| r.message.as_str()), Some("All 1 passed"));
    }

    #[test]
    fn requirement_kind_uses_upper_case_on_the_wire() {
        let r: Requirement =
            serde_yaml::from_str("category: c\ntitle: t\ntype: DELETE").unwrap();
        assert_eq!(r.kind, RequirementKind::Delete);
        assert_eq!(serde_json::to_value(r.kind).unwrap(), "DELETE");
    }

    #[test]
    fn plan_iterates_in_insertion_order() {
        let plan = TestPlan {
            categories: vec![
                CategoryPlan {
                    name: "b".into(),
                    test_cases: vec![TestCase::new("b1", req())],
                },
                CategoryPlan {
                    name: "a".into(),
                    test_cases: vec![TestCase::new("a1", req()), TestCase::new("a2", req())],
                },
            ],
        };
        let ids: Vec<_> = plan.iter().map(|(_, tc)| tc.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "a1", "a2"]);
        assert_eq!(plan.len(), 3);
    }
}
