use crate::batch::{BatchId, BatchRegistry, ProgressSink, ProgressSnapshot};
use crate::distribute::pending_work;
use crate::engine::ExecutionEngine;
use crate::errors::GenerationError;
use crate::generate::{AcceptedCandidate, GenerationContext, TestCaseGenerator};
use crate::model::{SchemaIssue, SchemaSnapshot, Slot, TestPlan, TestResult};
use crate::report::RunSummary;
use crate::triage::{collect_failures, route, schema_issues, FailureInput, TriageDecision, TriagePolicy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

pub struct Pipeline {
    pub registry: Arc<BatchRegistry>,
    pub generator: Arc<TestCaseGenerator>,
    pub engine: Arc<ExecutionEngine>,
    pub progress: Arc<dyn ProgressSink>,
    pub triage: TriagePolicy,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub decision: TriageDecision,
    pub rounds: u32,
    /// Failing cases at the time of the final decision.
    pub failures: Vec<FailureInput>,
    pub schema_issues: Vec<SchemaIssue>,
    pub summary: RunSummary,
}

type GenerationOutcome = (Slot, String, Result<AcceptedCandidate, GenerationError>);

impl Pipeline {
    /// Generate, execute and triage until the router stops asking for SQL retries.
    ///
    /// The plan is updated in place: accepted SQL is stored on each case and
    /// every execution (or generation failure) appends one `TestResult`.
    pub async fn run(
        &self,
        plan: &mut TestPlan,
        schema: Arc<SchemaSnapshot>,
        goal: &str,
    ) -> anyhow::Result<PipelineOutcome> {
        let ctx = GenerationContext::new(Arc::clone(&schema), goal);
        let mut rounds: u32 = 0;

        loop {
            rounds += 1;
            let generated = self.generate_pending(plan, &ctx).await;
            self.execute_round(plan, &schema, &generated).await;

            let failures = collect_failures(plan);
            let decision = route(&failures, &self.triage);
            tracing::info!(
                event = "triage",
                round = rounds,
                failures = failures.len(),
                decision = decision.as_str(),
            );

            if decision == TriageDecision::RetrySql {
                let retry: HashSet<&str> = failures
                    .iter()
                    .filter(|f| f.is_retryable())
                    .map(|f| f.testcase_id.as_str())
                    .collect();
                for category in &mut plan.categories {
                    for tc in &mut category.test_cases {
                        if retry.contains(tc.id.as_str()) {
                            tc.sql.clear();
                        }
                    }
                }
                continue;
            }

            let issues = if decision == TriageDecision::EscalateSchema {
                schema_issues(&failures)
            } else {
                Vec::new()
            };
            let summary = RunSummary::from_plan(plan, decision, rounds, issues.clone());
            return Ok(PipelineOutcome {
                decision,
                rounds,
                failures,
                schema_issues: issues,
                summary,
            });
        }
    }

    /// Fans pending work out through a fresh batch. Returns the slots that
    /// received accepted SQL.
    async fn generate_pending(&self, plan: &mut TestPlan, ctx: &GenerationContext) -> Vec<Slot> {
        let work = pending_work(plan);
        if work.is_empty() {
            return Vec::new();
        }

        let batch = self.registry.begin(work.len());
        let batch_id = batch.id().clone();
        self.progress.batch_started(&batch_id, work.len());

        let mut outstanding: HashMap<Slot, String> = work
            .iter()
            .map(|w| (w.slot, w.test_case.id.clone()))
            .collect();

        let mut set: JoinSet<GenerationOutcome> = JoinSet::new();
        for item in work {
            let registry = Arc::clone(&self.registry);
            let generator = Arc::clone(&self.generator);
            let ctx = ctx.clone();
            let batch_id = batch_id.clone();
            set.spawn(async move {
                let _permit = registry.acquire(&batch_id).await;
                let result = generator.generate(&item, &ctx).await;
                (item.slot, item.test_case.id, result)
            });
        }

        let mut accepted = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (slot, test_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(event = "generation.task_failed", batch_id = %batch_id, error = %e);
                    continue;
                }
            };
            outstanding.remove(&slot);

            let success = result.is_ok();
            match result {
                Ok(candidate) => {
                    tracing::debug!(
                        event = "generation.accepted",
                        test_id = %test_id,
                        attempts = candidate.attempts,
                    );
                    if let Some(tc) = plan.get_mut(slot) {
                        tc.sql = candidate.sql;
                    }
                    accepted.push(slot);
                }
                Err(e) => {
                    tracing::warn!(event = "generation.failed", test_id = %test_id, error = %e);
                    if let Some(tc) = plan.get_mut(slot) {
                        tc.record(TestResult::generation_failed(&e));
                    }
                }
            }
            self.report_item(&batch_id, &test_id, success);
        }

        // Tasks that panicked still owe the case a result.
        for (slot, test_id) in outstanding {
            if let Some(tc) = plan.get_mut(slot) {
                tc.record(TestResult::generation_failed("task aborted"));
            }
            self.report_item(&batch_id, &test_id, false);
        }

        let done = self
            .registry
            .progress(&batch_id)
            .unwrap_or(ProgressSnapshot {
                completed: 0,
                total: 0,
            });
        self.progress.batch_completed(&batch_id, done);
        drop(batch);

        accepted
    }

    fn report_item(&self, batch_id: &BatchId, test_id: &str, success: bool) {
        if let Some(snapshot) = self.registry.increment_completed(batch_id) {
            self.progress.item_completed(batch_id, test_id, success, snapshot);
        }
    }

    /// Runs every case that has SQL but no result for it yet.
    async fn execute_round(&self, plan: &mut TestPlan, schema: &SchemaSnapshot, generated: &[Slot]) {
        let fresh: HashSet<Slot> = generated.iter().copied().collect();
        let targets: Vec<Slot> = plan
            .iter()
            .filter(|(slot, tc)| {
                !tc.is_pending() && (fresh.contains(slot) || tc.latest_result().is_none())
            })
            .map(|(slot, _)| slot)
            .collect();

        for slot in targets {
            let Some(tc) = plan.get(slot) else { continue };
            let report = self.engine.execute_one(schema, tc).await;
            tracing::info!(
                event = "execution",
                test_id = %tc.id,
                success = report.success,
                message = %report.message,
            );
            if let Some(tc) = plan.get_mut(slot) {
                tc.record(TestResult::now(report.success, report.message));
            }
        }
    }
}
