use crate::model::RequirementKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything a single generation attempt may see. Built per item.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub test_case_id: String,
    /// Shared, read-only rendering of the candidate schema.
    pub schema_context: Arc<str>,
    pub goal: String,
    pub category: String,
    pub title: String,
    pub kind: RequirementKind,
    pub previous_failures: String,
}

impl GenerationRequest {
    pub fn prompt(&self) -> String {
        let mut out = String::new();
        out.push_str("Write one SQL test for the requirement below against the given schema.\n");
        out.push_str("The test runs inside a transaction that is always rolled back; ");
        out.push_str("do not emit BEGIN, COMMIT or ROLLBACK. ");
        out.push_str("Report results as TAP lines (`ok N - description` / `not ok N - description`).\n\n");
        out.push_str(&format!("## Goal\n{}\n\n", self.goal));
        out.push_str(&format!("## Schema\n{}\n\n", self.schema_context));
        out.push_str(&format!(
            "## Requirement\ncategory: {}\ntitle: {}\ntype: {}\n",
            self.category, self.title, self.kind
        ));
        if !self.previous_failures.is_empty() {
            out.push_str(&format!("\n## Previous failures\n{}\n", self.previous_failures));
        }
        out.push_str("\nAnswer with JSON: {\"sql\": \"...\", \"rationale\": \"...\"}\n");
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Candidate {
    pub fn sql(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            rationale: None,
            meta: serde_json::Value::Null,
        }
    }
}

/// Proposes candidate SQL. Only the validation contract around it is ours.
#[async_trait]
pub trait GenerationOracle: Send + Sync {
    async fn propose(&self, request: &GenerationRequest) -> anyhow::Result<Candidate>;
    fn provider_name(&self) -> &'static str;
}

pub mod fake;
pub mod fixture;
pub mod openai;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_shared_schema_context() {
        let request = GenerationRequest {
            test_case_id: "tc-1".into(),
            schema_context: Arc::from("CREATE TABLE t (id INTEGER);"),
            goal: "g".into(),
            category: "c".into(),
            title: "t".into(),
            kind: RequirementKind::Select,
            previous_failures: String::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["schema_context"], "CREATE TABLE t (id INTEGER);");
        assert_eq!(json["kind"], "SELECT");
        assert!(request.prompt().contains("## Schema\nCREATE TABLE t (id INTEGER);"));
    }
}
