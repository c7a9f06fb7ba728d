use super::{Candidate, GenerationOracle, GenerationRequest};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

pub struct OpenAiOracle {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub client: reqwest::Client,
}

impl OpenAiOracle {
    pub fn new(model: String, api_key: String, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            temperature,
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl GenerationOracle for OpenAiOracle {
    async fn propose(&self, request: &GenerationRequest) -> anyhow::Result<Candidate> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You write SQL tests for database schemas. Reply with JSON only."
                },
                { "role": "user", "content": request.prompt() }
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat API error ({}): {}", status, error_text);
        }

        let payload: serde_json::Value = resp.json().await?;
        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("OpenAI API response missing content"))?;

        let mut candidate = parse_answer(text)?;
        candidate.meta = json!({
            "provider": "openai",
            "model": self.model,
            "usage": payload.get("usage").cloned().unwrap_or(serde_json::Value::Null),
        });
        Ok(candidate)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:sql|json)?\s*\n(.*?)```").expect("valid regex")
    })
}

/// Reads `{"sql": ..., "rationale": ...}`, optionally fenced, else a fenced SQL block.
pub fn parse_answer(text: &str) -> anyhow::Result<Candidate> {
    let trimmed = text.trim();

    let mut bodies = vec![trimmed.to_string()];
    bodies.extend(
        fenced_block_re()
            .captures_iter(trimmed)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string()),
    );

    for body in &bodies {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(sql) = v.get("sql").and_then(|s| s.as_str()) {
                return Ok(Candidate {
                    sql: sql.to_string(),
                    rationale: v
                        .get("rationale")
                        .and_then(|r| r.as_str())
                        .map(str::to_string),
                    meta: serde_json::Value::Null,
                });
            }
        }
    }

    // No JSON envelope: take the first fenced block that is not JSON.
    if let Some(sql) = bodies.iter().skip(1).find(|b| !b.starts_with('{')) {
        return Ok(Candidate::sql(sql.clone()));
    }

    anyhow::bail!("model answer contained no SQL candidate")
}
