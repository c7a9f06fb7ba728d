use super::{CaseStatus, RunSummary};
use crate::triage::TriageDecision;

pub fn print_summary(summary: &RunSummary) {
    eprintln!(
        "\nRan {} test case(s) in {} round(s)...",
        summary.total, summary.rounds
    );

    for c in &summary.cases {
        let attempts = format!("(attempts: {})", c.attempts);
        match c.status {
            CaseStatus::Passed => {
                eprintln!("✅ {:<20} PASS  {}", c.id, attempts);
            }
            CaseStatus::Failed => {
                let category = c
                    .failure_category
                    .map(|k| k.as_str())
                    .unwrap_or("unknown");
                eprintln!("❌ {:<20} FAIL [{}]  {}", c.id, category, attempts);
                if let Some(msg) = &c.message {
                    eprintln!("      → {}", truncate(msg, 200));
                }
            }
            CaseStatus::Pending => {
                eprintln!("⏭️  {:<20} PENDING (no accepted SQL)", c.id);
            }
        }
    }

    if !summary.schema_issues.is_empty() {
        eprintln!("\nSchema issues ({}):", summary.schema_issues.len());
        for issue in &summary.schema_issues {
            eprintln!("  - {}: {}", issue.testcase_id, issue.description);
        }
    }

    eprintln!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let next = match summary.decision {
        TriageDecision::End => "done",
        TriageDecision::RetrySql => "retry sql",
        TriageDecision::EscalateSchema => "escalated to schema owner",
    };
    eprintln!(
        "Summary: {} passed, {} failed, {} pending; triage: {}",
        summary.passed, summary.failed, summary.pending, next
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
