//! Normalized execution results returned to callers.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{FailureKind, SandboxError};
use crate::sandbox::request::RequestId;

/// What an artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A PNG image, base64-encoded.
    Image,
    /// An embeddable HTML/JavaScript document, passed through verbatim.
    Document,
}

/// A side-output generated alongside text output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub encoded_data: String,
    /// 1-based position in generation order.
    pub order: usize,
}

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SandboxError> for ExecutionFailure {
    fn from(err: &SandboxError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Outcome of one execution request. Built once and never mutated after
/// the manager hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub request_id: RequestId,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub artifacts: Vec<Artifact>,
}

impl ExecutionResult {
    pub(crate) fn success(
        request_id: RequestId,
        stdout_lines: Vec<String>,
        stderr_lines: Vec<String>,
        artifacts: Vec<Artifact>,
    ) -> Self {
        Self {
            request_id,
            stdout_lines,
            stderr_lines,
            error_message: None,
            error_kind: None,
            artifacts,
        }
    }

    pub(crate) fn failure(request_id: RequestId, failure: ExecutionFailure) -> Self {
        Self {
            request_id,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            error_message: Some(failure.message),
            error_kind: Some(failure.kind),
            artifacts: Vec::new(),
        }
    }

    pub(crate) fn with_output(mut self, stdout_lines: Vec<String>, stderr_lines: Vec<String>) -> Self {
        self.stdout_lines = stdout_lines;
        self.stderr_lines = stderr_lines;
        self
    }

    pub(crate) fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// True when no failure of any kind was recorded.
    pub fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error_kind
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(FailureKind::Timeout)
    }

    /// Artifacts of the given kind, in order.
    pub fn artifacts_of(&self, kind: ArtifactKind) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// The tool-result envelope consumed by the chat layer:
    /// `{"logs": {"stdout": [..], "stderr": [..]}, "error": .., "results": [..]}`.
    pub fn to_tool_payload(&self) -> Value {
        let results: Vec<Value> = self
            .artifacts
            .iter()
            .map(|artifact| match artifact.kind {
                ArtifactKind::Image => json!({ "png": artifact.encoded_data }),
                ArtifactKind::Document => json!({ "html": artifact.encoded_data }),
            })
            .collect();

        let error = match (&self.error_kind, &self.error_message) {
            (Some(kind), Some(message)) => json!({ "name": kind.to_string(), "value": message }),
            _ => Value::Null,
        };

        json!({
            "logs": {
                "stdout": self.stdout_lines,
                "stderr": self.stderr_lines,
            },
            "error": error,
            "results": results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(order: usize) -> Artifact {
        Artifact {
            kind: ArtifactKind::Image,
            encoded_data: format!("img{order}"),
            order,
        }
    }

    #[test]
    fn test_success_result() {
        let result = ExecutionResult::success(
            RequestId::from("r1"),
            vec!["x".into()],
            vec![],
            vec![image(1)],
        );
        assert!(result.is_success());
        assert_eq!(result.failure_kind(), None);
        assert_eq!(result.artifacts_of(ArtifactKind::Image).count(), 1);
        assert_eq!(result.artifacts_of(ArtifactKind::Document).count(), 0);
    }

    #[test]
    fn test_failure_from_error() {
        let err = SandboxError::Timeout(std::time::Duration::from_secs(1));
        let result = ExecutionResult::failure(RequestId::from("r1"), (&err).into());
        assert!(result.is_timeout());
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = ExecutionResult::success(RequestId::from("r1"), vec!["x".into()], vec![], vec![image(1)]);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["stdoutLines"][0], "x");
        assert_eq!(value["artifacts"][0]["encodedData"], "img1");
        assert_eq!(value["artifacts"][0]["kind"], "image");
        assert!(value["errorMessage"].is_null());
    }

    #[test]
    fn test_tool_payload_shape() {
        let failed = ExecutionResult::failure(
            RequestId::from("r2"),
            ExecutionFailure::new(FailureKind::Runtime, "NameError: name 'x' is not defined"),
        )
        .with_output(vec!["before".into()], vec!["NameError: name 'x' is not defined".into()])
        .with_artifacts(vec![image(1)]);

        let payload = failed.to_tool_payload();
        assert_eq!(payload["logs"]["stdout"][0], "before");
        assert_eq!(payload["error"]["name"], "RuntimeError");
        assert_eq!(payload["results"][0]["png"], "img1");

        let document = ExecutionResult::success(
            RequestId::from("r3"),
            vec![],
            vec![],
            vec![Artifact {
                kind: ArtifactKind::Document,
                encoded_data: "<h1>hi</h1>".into(),
                order: 1,
            }],
        );
        let payload = document.to_tool_payload();
        assert_eq!(payload["results"][0]["html"], "<h1>hi</h1>");
        assert!(payload["error"].is_null());
    }
}
