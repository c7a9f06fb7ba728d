use crate::model::{FailureCategory, SchemaIssue, TestPlan};
use crate::triage::{classify_result, TriageDecision};
use serde::Serialize;

pub mod console;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    /// No SQL accepted and nothing executed yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseSummary {
    pub id: String,
    pub category: String,
    pub title: String,
    pub status: CaseStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Serializable end-of-run report: per-case outcome plus the triage verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub decision: TriageDecision,
    pub rounds: u32,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub cases: Vec<CaseSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schema_issues: Vec<SchemaIssue>,
}

impl RunSummary {
    pub fn from_plan(
        plan: &TestPlan,
        decision: TriageDecision,
        rounds: u32,
        schema_issues: Vec<SchemaIssue>,
    ) -> Self {
        let cases: Vec<CaseSummary> = plan
            .iter()
            .map(|(_, tc)| {
                let latest = tc.latest_result();
                let status = match latest {
                    Some(r) if r.success => CaseStatus::Passed,
                    Some(_) => CaseStatus::Failed,
                    None => CaseStatus::Pending,
                };
                let failure_category = latest
                    .filter(|r| !r.success)
                    .map(|r| classify_result(r).category);
                CaseSummary {
                    id: tc.id.clone(),
                    category: tc.requirement.category.clone(),
                    title: tc.requirement.title.clone(),
                    status,
                    attempts: tc.attempts(),
                    failure_category,
                    message: latest.map(|r| r.message.clone()),
                }
            })
            .collect();

        let count = |s: CaseStatus| cases.iter().filter(|c| c.status == s).count();
        Self {
            decision,
            rounds,
            total: cases.len(),
            passed: count(CaseStatus::Passed),
            failed: count(CaseStatus::Failed),
            pending: count(CaseStatus::Pending),
            cases,
            schema_issues,
        }
    }

    /// True when the run should be reported as unsuccessful.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.pending > 0 || self.decision == TriageDecision::EscalateSchema
    }
}
