use super::{Candidate, GenerationOracle, GenerationRequest};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureAnswer {
    Plain(String),
    Full(Candidate),
}

impl FixtureAnswer {
    fn to_candidate(&self) -> Candidate {
        match self {
            FixtureAnswer::Plain(sql) => Candidate::sql(sql.clone()),
            FixtureAnswer::Full(c) => c.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    candidates: BTreeMap<String, Vec<FixtureAnswer>>,
}

/// Replays recorded candidates from a YAML file, one per attempt, keyed by test case id.
///
/// ```yaml
/// candidates:
///   tc-1:
///     - "SELECT 1"
///     - sql: "SELECT 2"
///       rationale: second try
/// ```
pub struct FixtureOracle {
    candidates: BTreeMap<String, Vec<FixtureAnswer>>,
    served: Mutex<HashMap<String, usize>>,
}

impl FixtureOracle {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid fixture file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let file: FixtureFile = serde_yaml::from_str(raw)?;
        if let Some((id, _)) = file.candidates.iter().find(|(_, v)| v.is_empty()) {
            anyhow::bail!("fixture for '{}' has no candidates", id);
        }
        Ok(Self {
            candidates: file.candidates,
            served: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl GenerationOracle for FixtureOracle {
    async fn propose(&self, request: &GenerationRequest) -> anyhow::Result<Candidate> {
        let answers = self.candidates.get(&request.test_case_id).ok_or_else(|| {
            anyhow::anyhow!(
                "fixture miss: no recorded candidate for test case '{}'",
                request.test_case_id
            )
        })?;

        let attempt = {
            let mut served = self.served.lock().unwrap_or_else(PoisonError::into_inner);
            let n = served.entry(request.test_case_id.clone()).or_insert(0);
            let current = *n;
            *n += 1;
            current
        };

        let answer = answers
            .get(attempt)
            .or_else(|| answers.last())
            .ok_or_else(|| anyhow::anyhow!("fixture for '{}' is empty", request.test_case_id))?;
        Ok(answer.to_candidate())
    }

    fn provider_name(&self) -> &'static str {
        "fixture"
    }
}
