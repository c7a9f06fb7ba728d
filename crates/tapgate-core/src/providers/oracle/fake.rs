use super::{Candidate, GenerationOracle, GenerationRequest};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

enum Scripted {
    Answer(Candidate),
    Fail(String),
}

/// Deterministic oracle: answers are queued per test case id and served in order.
/// The last answer for an id is repeated once its queue is down to one entry.
#[derive(Default)]
pub struct ScriptedOracle {
    answers: Mutex<HashMap<String, VecDeque<Scripted>>>,
    seen: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn answer(self, test_id: &str, sql: &str) -> Self {
        self.push(test_id, Scripted::Answer(Candidate::sql(sql)))
    }

    pub fn fail(self, test_id: &str, error: &str) -> Self {
        self.push(test_id, Scripted::Fail(error.to_string()))
    }

    fn push(self, test_id: &str, item: Scripted) -> Self {
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(test_id.to_string())
            .or_default()
            .push_back(item);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn requests_for(&self, test_id: &str) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.test_case_id == test_id)
            .collect()
    }
}

#[async_trait]
impl GenerationOracle for ScriptedOracle {
    async fn propose(&self, request: &GenerationRequest) -> anyhow::Result<Candidate> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut answers = self.answers.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = answers.get_mut(&request.test_case_id);
            match queue {
                Some(q) if q.len() > 1 => q.pop_front(),
                Some(q) => q.front().map(|s| match s {
                    Scripted::Answer(c) => Scripted::Answer(c.clone()),
                    Scripted::Fail(e) => Scripted::Fail(e.clone()),
                }),
                None => None,
            }
        };

        match next {
            Some(Scripted::Answer(c)) => Ok(c),
            Some(Scripted::Fail(e)) => anyhow::bail!(e),
            None => anyhow::bail!(
                "no scripted answer for test case '{}'",
                request.test_case_id
            ),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
