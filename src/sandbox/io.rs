//! Output capture for sandboxed processes.

use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};

/// Upper bound on captured bytes per stream.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const TRUNCATION_NOTICE: &str = "[output truncated]";

/// An append-only text buffer that stops growing at a byte limit.
#[derive(Debug, Clone)]
pub struct BoundedOutput {
    text: String,
    limit: usize,
    truncated: bool,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append raw bytes, decoding lossily.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(self.text.len());
        if bytes.len() > remaining {
            self.text.push_str(&String::from_utf8_lossy(&bytes[..remaining]));
            self.truncated = true;
        } else {
            self.text.push_str(&String::from_utf8_lossy(bytes));
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// The captured text, with a trailing notice when it was cut short.
    pub fn into_string(self) -> String {
        if self.truncated {
            let mut text = self.text;
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(TRUNCATION_NOTICE);
            text
        } else {
            self.text
        }
    }
}

impl Default for BoundedOutput {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_BYTES)
    }
}

/// In-memory stdio pipes handed to a WASI guest.
#[derive(Clone)]
pub struct SandboxIo {
    pub stdin: MemoryInputPipe,
    pub stdout: MemoryOutputPipe,
    pub stderr: MemoryOutputPipe,
}

impl SandboxIo {
    /// Create pipes with empty stdin and bounded output capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            stdin: MemoryInputPipe::new(Vec::<u8>::new()),
            stdout: MemoryOutputPipe::new(capacity),
            stderr: MemoryOutputPipe::new(capacity),
        }
    }

    /// Get the captured stdout as a string.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout.contents()).into_owned()
    }

    /// Get the captured stderr as a string.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr.contents()).into_owned()
    }
}

impl Default for SandboxIo {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_BYTES)
    }
}

/// Split captured output into lines, without line terminators. A final
/// newline does not produce a trailing empty line.
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}
