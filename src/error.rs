//! Error types for the code sandbox.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while preparing or running a sandboxed execution.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The request was malformed (empty code, unsupported language, duplicate id).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The execution exceeded the configured wall-clock budget.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The execution exceeded memory limits.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// Failed to initialize the isolation runtime.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// Failed to load or instantiate the Python interpreter module.
    #[error("failed to load Python interpreter: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The isolated process could not be driven to completion.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A Python exception was raised inside the sandbox.
    #[error("Python {exception_type}: {message}")]
    PythonException {
        /// The type of Python exception (e.g., "ValueError", "TypeError").
        exception_type: String,
        /// The exception message.
        message: String,
        /// The full Python traceback, if available.
        traceback: Option<String>,
    },

    /// I/O error on the host side (workspace, source file, artifacts).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error, raised at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The interpreter wasm file was not found.
    #[error("Python interpreter wasm not found at: {0}")]
    InterpreterNotFound(String),

    /// Execution ran out of fuel (instruction limit).
    #[error("execution ran out of fuel after {consumed:?} instructions")]
    OutOfFuel {
        /// Number of instructions consumed before running out.
        consumed: Option<u64>,
    },

    /// The container engine rejected or failed a request.
    #[error("container engine error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Coarse classification of a failed execution, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed request; no backend was invoked.
    Validation,
    /// The user code failed (error output or non-zero exit).
    Runtime,
    /// The isolation environment itself failed. Retry only after backoff.
    Infrastructure,
    /// The wall-clock budget was exceeded.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Validation => "ValidationError",
            FailureKind::Runtime => "RuntimeError",
            FailureKind::Infrastructure => "InfrastructureError",
            FailureKind::Timeout => "TimeoutError",
        };
        f.write_str(name)
    }
}

impl SandboxError {
    /// Create a Python exception error from stderr output.
    pub fn from_python_stderr(stderr: &str) -> Option<Self> {
        parse_python_exception(stderr)
    }

    /// Map this error onto the caller-facing failure taxonomy.
    ///
    /// Resource exhaustion inside the guest (memory, fuel) and Python
    /// exceptions are attributed to the user code; anything that prevented
    /// the guest from running at all is infrastructure.
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxError::Validation(_) => FailureKind::Validation,
            SandboxError::Timeout(_) => FailureKind::Timeout,
            SandboxError::MemoryLimitExceeded(_)
            | SandboxError::OutOfFuel { .. }
            | SandboxError::PythonException { .. } => FailureKind::Runtime,
            SandboxError::RuntimeInit(_)
            | SandboxError::ModuleLoad(_)
            | SandboxError::ExecutionFailed(_)
            | SandboxError::Io(_)
            | SandboxError::Config(_)
            | SandboxError::InterpreterNotFound(_)
            | SandboxError::Docker(_) => FailureKind::Infrastructure,
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }

    /// Check if this error represents a Python exception.
    pub fn is_python_exception(&self) -> bool {
        matches!(self, SandboxError::PythonException { .. })
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Parse a Python exception from stderr output.
///
/// Picks the last unindented line that looks like `SomeError: message` and
/// attaches the traceback block leading up to it, if there is one.
pub fn parse_python_exception(stderr: &str) -> Option<SandboxError> {
    let lines: Vec<&str> = stderr.lines().collect();

    let mut traceback_start = None;
    let mut exception_line = None;
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        } else if !line.starts_with(' ') && looks_like_exception(line) {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (exception_type, message) = match exception_str.split_once(':') {
        Some((exc_type, msg)) => (exc_type.trim().to_string(), msg.trim().to_string()),
        None => (exception_str.trim().to_string(), String::new()),
    };

    let traceback = traceback_start
        .filter(|start| *start < line_idx)
        .map(|start| lines[start..=line_idx].join("\n"));

    Some(SandboxError::PythonException {
        exception_type,
        message,
        traceback,
    })
}

/// Check if a line looks like a Python exception header.
fn looks_like_exception(line: &str) -> bool {
    const SUFFIXES: [&str; 3] = ["Error", "Exception", "Warning"];
    const STANDALONE: [&str; 4] = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    // Only the leading name (up to ':' or whitespace) counts. It may be
    // module-qualified, as in `json.decoder.JSONDecodeError`; the class
    // itself is the last segment.
    let name = line
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    let is_identifier =
        |segment: &str| !segment.is_empty() && segment.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !name.split('.').all(is_identifier) {
        return false;
    }

    let last_segment = name.rsplit('.').next().unwrap_or(name);
    if !last_segment.starts_with(|c: char| c.is_ascii_uppercase()) {
        return false;
    }

    SUFFIXES.iter().any(|suffix| last_segment.ends_with(suffix))
        || STANDALONE.contains(&last_segment)
}
