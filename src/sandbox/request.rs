//! Execution requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SandboxError;

/// Languages the manager knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Executed in the isolation runtime.
    Python,
    /// Returned as an embeddable document; never executed.
    JavaScript,
}

impl Language {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "html" => Ok(Language::JavaScript),
            other => Err(SandboxError::Validation(format!(
                "unsupported language: {other:?}"
            ))),
        }
    }
}

/// Identifier of a single execution request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work for the sandbox manager.
///
/// `source_code` is untrusted and is only ever handed to an isolated backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub request_id: RequestId,
    pub language: Language,
    pub source_code: String,
    /// Used for workspace namespacing only.
    pub caller_id: String,
}

impl ExecutionRequest {
    /// Create a request with a freshly generated id.
    pub fn new(language: Language, source_code: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::generate(),
            language,
            source_code: source_code.into(),
            caller_id: caller_id.into(),
        }
    }

    /// Replace the generated id with a caller-supplied one.
    pub fn with_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Fail fast on requests no backend should ever see.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.request_id.as_str().trim().is_empty() {
            return Err(SandboxError::Validation("request id is empty".to_string()));
        }
        if self.source_code.trim().is_empty() {
            return Err(SandboxError::Validation("source code is empty".to_string()));
        }
        Ok(())
    }
}
