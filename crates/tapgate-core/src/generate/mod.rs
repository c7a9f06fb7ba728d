use crate::distribute::WorkItem;
use crate::errors::GenerationError;
use crate::model::{ResultStage, SchemaSnapshot, TestCase};
use crate::providers::oracle::{Candidate, GenerationOracle, GenerationRequest};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

pub mod validate;

pub use validate::{validate_candidate, CandidateShape};

#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    /// Candidates tried per call before giving up. `1` fails fast.
    pub max_attempts: u32,
    /// Bound on a single oracle call.
    pub timeout: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(120),
        }
    }
}

impl GenerationPolicy {
    pub fn fail_fast(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
        }
    }
}

/// Read-only inputs shared by every generation of a batch.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub schema: Arc<SchemaSnapshot>,
    pub schema_context: Arc<str>,
    pub goal: Arc<str>,
}

impl GenerationContext {
    pub fn new(schema: Arc<SchemaSnapshot>, goal: &str) -> Self {
        Self {
            schema_context: Arc::from(schema.rendered.as_str()),
            schema,
            goal: Arc::from(goal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    Execution,
    Validation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorFailure {
    pub source: FailureSource,
    pub attempt: u32,
    pub message: String,
}

impl PriorFailure {
    /// Failed results already recorded on the test case, oldest first.
    pub fn from_history(tc: &TestCase) -> Vec<PriorFailure> {
        tc.test_results
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.success)
            .map(|(i, r)| PriorFailure {
                source: match r.stage {
                    ResultStage::Execution => FailureSource::Execution,
                    ResultStage::Generation => FailureSource::Validation,
                },
                attempt: u32::try_from(i + 1).unwrap_or(u32::MAX),
                message: r.message.clone(),
            })
            .collect()
    }
}

pub fn format_previous_failures(failures: &[PriorFailure]) -> String {
    failures
        .iter()
        .map(|f| {
            let label = match f.source {
                FailureSource::Execution => "run",
                FailureSource::Validation => "rejected candidate",
            };
            format!("- {} #{}: {}", label, f.attempt, f.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct AcceptedCandidate {
    pub sql: String,
    pub shape: CandidateShape,
    /// Oracle calls spent, including the accepted one.
    pub attempts: u32,
    pub candidate: Candidate,
}

enum State {
    Generating,
    Validating(Candidate),
    Accepted(Candidate, CandidateShape),
    Rejected(Vec<String>),
}

pub struct TestCaseGenerator {
    oracle: Arc<dyn GenerationOracle>,
    policy: GenerationPolicy,
}

impl TestCaseGenerator {
    pub fn new(oracle: Arc<dyn GenerationOracle>, policy: GenerationPolicy) -> Self {
        Self { oracle, policy }
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    pub fn provider_name(&self) -> &'static str {
        self.oracle.provider_name()
    }

    pub fn request_for(
        &self,
        item: &WorkItem,
        ctx: &GenerationContext,
        failures: &[PriorFailure],
    ) -> GenerationRequest {
        let req = &item.test_case.requirement;
        GenerationRequest {
            test_case_id: item.test_case.id.clone(),
            schema_context: ctx.schema_context.clone(),
            goal: ctx.goal.to_string(),
            category: item.category.clone(),
            title: req.title.clone(),
            kind: req.kind,
            previous_failures: format_previous_failures(failures),
        }
    }

    /// Runs the generate/validate loop for one work item.
    ///
    /// Oracle errors and timeouts end the call immediately; validation
    /// rejections are fed back into the next request until the attempt
    /// ceiling is hit.
    pub async fn generate(
        &self,
        item: &WorkItem,
        ctx: &GenerationContext,
    ) -> Result<AcceptedCandidate, GenerationError> {
        let provider = self.oracle.provider_name();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut failures = PriorFailure::from_history(&item.test_case);
        let mut last_violations: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;
        let mut state = State::Generating;

        loop {
            state = match state {
                State::Generating => {
                    if attempt >= max_attempts {
                        return Err(GenerationError::Exhausted {
                            attempts: attempt,
                            violations: last_violations,
                        });
                    }
                    attempt += 1;

                    let request = self.request_for(item, ctx, &failures);
                    let fut = self.oracle.propose(&request);
                    match timeout(self.policy.timeout, fut).await {
                        Err(_) => {
                            return Err(GenerationError::Timeout {
                                provider,
                                after: self.policy.timeout,
                            })
                        }
                        Ok(Err(source)) => {
                            return Err(GenerationError::Oracle { provider, source })
                        }
                        Ok(Ok(candidate)) => State::Validating(candidate),
                    }
                }
                State::Validating(candidate) => {
                    match validate_candidate(&candidate.sql, ctx.schema.dialect) {
                        Ok(shape) => State::Accepted(candidate, shape),
                        Err(violations) => State::Rejected(violations),
                    }
                }
                State::Rejected(violations) => {
                    tracing::debug!(
                        event = "candidate_rejected",
                        test_id = %item.test_case.id,
                        attempt,
                        violations = %violations.join("; "),
                    );
                    failures.push(PriorFailure {
                        source: FailureSource::Validation,
                        attempt,
                        message: violations.join("; "),
                    });
                    last_violations = violations;
                    State::Generating
                }
                State::Accepted(candidate, shape) => {
                    return Ok(AcceptedCandidate {
                        sql: candidate.sql.trim().to_string(),
                        shape,
                        attempts: attempt,
                        candidate,
                    });
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Requirement, RequirementKind, Slot, SqlDialect, TestResult};
    use crate::providers::oracle::fake::ScriptedOracle;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            category: "orders".into(),
            slot: Slot {
                category: 0,
                index: 0,
            },
            test_case: TestCase::new(
                id,
                Requirement {
                    category: "orders".into(),
                    title: "orders need a customer".into(),
                    kind: RequirementKind::Insert,
                },
            ),
        }
    }

    fn ctx() -> GenerationContext {
        let schema = SchemaSnapshot::new("CREATE TABLE orders (id INTEGER PRIMARY KEY);", SqlDialect::Sqlite);
        GenerationContext::new(Arc::new(schema), "orders are consistent")
    }

    #[tokio::test]
    async fn valid_first_candidate_is_accepted() {
        let oracle = Arc::new(ScriptedOracle::new().answer("tc-1", "  SELECT 'ok 1 - works';\n"));
        let gen = TestCaseGenerator::new(oracle.clone(), GenerationPolicy::default());

        let accepted = gen.generate(&item("tc-1"), &ctx()).await.unwrap();
        assert_eq!(accepted.sql, "SELECT 'ok 1 - works';");
        assert_eq!(accepted.attempts, 1);
        assert_eq!(accepted.shape, CandidateShape::Statements(1));

        let reqs = oracle.requests_for("tc-1");
        assert_eq!(reqs.len(), 1);
        assert_eq!(&*reqs[0].schema_context, "CREATE TABLE orders (id INTEGER PRIMARY KEY);");
        assert!(reqs[0].previous_failures.is_empty());
    }

    #[tokio::test]
    async fn rejection_is_fed_back_into_next_attempt() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .answer("tc-1", "SELEC broken")
                .answer("tc-1", "SELECT 'ok 1 - fixed';"),
        );
        let gen = TestCaseGenerator::new(oracle.clone(), GenerationPolicy::default());

        let accepted = gen.generate(&item("tc-1"), &ctx()).await.unwrap();
        assert_eq!(accepted.attempts, 2);

        let reqs = oracle.requests_for("tc-1");
        assert_eq!(reqs.len(), 2);
        assert!(reqs[1].previous_failures.starts_with("- rejected candidate #1: SQL syntax error"));
    }

    #[tokio::test]
    async fn exhausted_after_max_attempts() {
        let oracle = Arc::new(ScriptedOracle::new().answer("tc-1", "SELECT has_table('orders');"));
        let policy = GenerationPolicy {
            max_attempts: 2,
            ..GenerationPolicy::default()
        };
        let gen = TestCaseGenerator::new(oracle.clone(), policy);

        let err = gen.generate(&item("tc-1"), &ctx()).await.unwrap_err();
        match err {
            GenerationError::Exhausted {
                attempts,
                violations,
            } => {
                assert_eq!(attempts, 2);
                assert!(violations.iter().any(|v| v.contains("finish()")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(oracle.requests_for("tc-1").len(), 2);
    }

    #[tokio::test]
    async fn fail_fast_policy_tries_once() {
        let oracle = Arc::new(ScriptedOracle::new().answer("tc-1", "nonsense here"));
        let gen = TestCaseGenerator::new(oracle.clone(), GenerationPolicy::fail_fast(Duration::from_secs(5)));

        let err = gen.generate(&item("tc-1"), &ctx()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn oracle_error_is_terminal() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .fail("tc-1", "rate limited")
                .answer("tc-1", "SELECT 1;"),
        );
        let gen = TestCaseGenerator::new(oracle.clone(), GenerationPolicy::default());

        let err = gen.generate(&item("tc-1"), &ctx()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Oracle { provider: "scripted", .. }));
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(oracle.requests_for("tc-1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_oracle_times_out() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_delay(Duration::from_secs(30))
                .answer("tc-1", "SELECT 1;"),
        );
        let gen = TestCaseGenerator::new(oracle, GenerationPolicy::fail_fast(Duration::from_secs(1)));

        let err = gen.generate(&item("tc-1"), &ctx()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout { .. }));
    }

    #[tokio::test]
    async fn recorded_failures_are_part_of_the_request() {
        let mut work = item("tc-1");
        work.test_case.record(TestResult::now(false, "1 failed: #1 inserted (got: 0)"));
        work.test_case.record(TestResult::now(true, "All 1 passed"));
        work.test_case.record(TestResult::now(false, "no such table: order (42P01)"));

        let oracle = Arc::new(ScriptedOracle::new().answer("tc-1", "SELECT 1;"));
        let gen = TestCaseGenerator::new(oracle.clone(), GenerationPolicy::default());
        gen.generate(&work, &ctx()).await.unwrap();

        let prev = &oracle.requests_for("tc-1")[0].previous_failures;
        assert_eq!(
            prev,
            "- run #1: 1 failed: #1 inserted (got: 0)\n- run #3: no such table: order (42P01)"
        );
    }

    #[test]
    fn generation_failures_in_history_read_as_rejections() {
        let mut tc = item("tc-1").test_case;
        tc.record(TestResult::generation_failed("no valid candidate after 3 attempt(s): SQL syntax error"));
        tc.record(TestResult::now(false, "1 failed: #1 x"));

        let prior = PriorFailure::from_history(&tc);
        assert_eq!(prior[0].source, FailureSource::Validation);
        assert_eq!(prior[1].source, FailureSource::Execution);
        assert_eq!(
            format_previous_failures(&prior),
            "- rejected candidate #1: generation failed: no valid candidate after 3 attempt(s): SQL syntax error\n- run #2: 1 failed: #1 x"
        );
    }
}
