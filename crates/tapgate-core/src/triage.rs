use crate::classify::classify;
use crate::model::{
    FailureCategory, FailureClassification, ResultStage, SchemaIssue, TestPlan, TestResult,
};
use serde::Serialize;

pub const DEFAULT_SQL_RETRY_CEILING: u32 = 3;

#[derive(Debug, Clone)]
pub struct TriagePolicy {
    /// History length at which a failing case stops counting as retryable.
    pub sql_retry_ceiling: u32,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            sql_retry_ceiling: DEFAULT_SQL_RETRY_CEILING,
        }
    }
}

/// A failing case as seen by the router: classification of its latest
/// result plus its history length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureInput {
    pub testcase_id: String,
    pub classification: FailureClassification,
    pub attempts: u32,
    pub message: String,
}

impl FailureInput {
    /// Unknown failures are routed like SQL issues so they are never dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification.category,
            FailureCategory::SqlQuality | FailureCategory::Unknown
        )
    }

    pub fn is_schema(&self) -> bool {
        self.classification.category == FailureCategory::Schema
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageDecision {
    End,
    RetrySql,
    EscalateSchema,
}

impl TriageDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageDecision::End => "end",
            TriageDecision::RetrySql => "retry_sql",
            TriageDecision::EscalateSchema => "escalate_schema",
        }
    }
}

/// Failures of the plan, classified from each case's latest result only.
pub fn collect_failures(plan: &TestPlan) -> Vec<FailureInput> {
    plan.iter()
        .filter_map(|(_, tc)| {
            let latest = tc.latest_result().filter(|r| !r.success)?;
            Some(FailureInput {
                testcase_id: tc.id.clone(),
                classification: classify_result(latest),
                attempts: tc.attempts(),
                message: latest.message.clone(),
            })
        })
        .collect()
}

/// Generation failures never reached the database, so their text is not
/// scanned for SQLSTATEs or schema keywords: they are always SQL issues.
pub fn classify_result(result: &TestResult) -> FailureClassification {
    match result.stage {
        ResultStage::Execution => classify(&result.message),
        ResultStage::Generation => FailureClassification {
            category: FailureCategory::SqlQuality,
            error_code: None,
            error_name: None,
            should_retry_with_schema_fix: false,
        },
    }
}

pub fn route(failures: &[FailureInput], policy: &TriagePolicy) -> TriageDecision {
    if failures.is_empty() {
        return TriageDecision::End;
    }

    let retryable: Vec<&FailureInput> = failures.iter().filter(|f| f.is_retryable()).collect();
    let ceiling_hit = retryable
        .iter()
        .any(|f| f.attempts >= policy.sql_retry_ceiling);

    if !retryable.is_empty() && !ceiling_hit {
        return TriageDecision::RetrySql;
    }
    if failures.iter().any(FailureInput::is_schema) {
        return TriageDecision::EscalateSchema;
    }
    TriageDecision::End
}

/// Escalation payload for the schema-fix consumer.
pub fn schema_issues(failures: &[FailureInput]) -> Vec<SchemaIssue> {
    failures
        .iter()
        .filter(|f| f.is_schema())
        .map(|f| {
            let mut description = f.message.clone();
            if let (Some(code), Some(name)) = (&f.classification.error_code, &f.classification.error_name) {
                if !description.contains(name.as_str()) {
                    description = format!("{} [{} {}]", description, code, name);
                }
            }
            SchemaIssue {
                testcase_id: f.testcase_id.clone(),
                description,
            }
        })
        .collect()
}
