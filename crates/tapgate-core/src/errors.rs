use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Error)]
pub enum GenerationError {
    /// The oracle call itself failed; the surrounding policy decides what to do.
    #[error("generation oracle '{provider}' failed: {source}")]
    Oracle {
        provider: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("generation oracle '{provider}' timed out after {}s", .after.as_secs())]
    Timeout {
        provider: &'static str,
        after: Duration,
    },

    #[error("no valid candidate after {attempts} attempt(s): {}", .violations.join("; "))]
    Exhausted {
        attempts: u32,
        violations: Vec<String>,
    },
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// SQLSTATE (or equivalent) reported by the database, when known.
    pub code: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Message with the code appended in the `(CODE)` shape the classifier extracts.
    pub fn display_with_code(&self) -> String {
        match &self.code {
            Some(code) if !self.message.contains(code.as_str()) => {
                format!("{} ({})", self.message, code)
            }
            _ => self.message.clone(),
        }
    }
}
