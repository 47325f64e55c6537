//! Test runtimes.
//!
//! [`ScriptedRuntime`] stands in for a real interpreter. It understands just
//! enough line-oriented Python to drive the manager end to end:
//!
//! - `print('text')` writes a line to stdout
//! - `sys.stderr.write('text')` writes to stderr
//! - `<anything>.savefig('/workspace/name.png')` creates that file
//! - `time.sleep(secs)` sleeps, honouring the invocation timeout
//! - `raise Name('msg')` prints a traceback and exits with status 1
//! - `sys.exit(n)` exits with status `n`
//!
//! Every other line is ignored.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use code_sandbox::{
    Invocation, IsolationRuntime, RawOutput, Result, SandboxConfig, SandboxError, SandboxManager,
    GUEST_WORKSPACE,
};

#[derive(Default)]
pub struct ScriptedRuntime {
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    workspaces: Mutex<Vec<PathBuf>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.workspaces.lock().unwrap().clone()
    }

    /// Scripts as the runtime received them, after rewriting.
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    async fn interpret(&self, invocation: &Invocation, script: &str) -> Result<RawOutput> {
        let mut out = RawOutput::default();

        for line in script.lines() {
            let line = line.trim();
            if let Some(text) = string_arg(line, "print(") {
                out.stdout.push_str(&text);
                out.stdout.push('\n');
            } else if let Some(text) = string_arg(line, "sys.stderr.write(") {
                out.stderr.push_str(&text);
            } else if let Some(idx) = line.find(".savefig(") {
                let Some(path) = string_arg(&line[idx..], ".savefig(") else {
                    continue;
                };
                match guest_to_host(&invocation.workspace, &path) {
                    Some(host) => std::fs::write(&host, file_name(&host))?,
                    None => {
                        out.stderr.push_str(&format!(
                            "PermissionError: [Errno 13] Permission denied: '{path}'\n"
                        ));
                        out.exit_code = 1;
                        return Ok(out);
                    }
                }
            } else if let Some(secs) = number_arg(line, "time.sleep(") {
                let sleep = tokio::time::sleep(Duration::from_secs_f64(secs));
                if tokio::time::timeout(invocation.timeout, sleep).await.is_err() {
                    return Err(SandboxError::Timeout(invocation.timeout));
                }
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (name, message) = match rest.split_once('(') {
                    Some((name, args)) => (name, string_arg(&format!("({args}"), "(").unwrap_or_default()),
                    None => (rest, String::new()),
                };
                out.stderr.push_str(&format!(
                    "Traceback (most recent call last):\n  File \"{GUEST_WORKSPACE}/main.py\", line 1, in <module>\n{name}: {message}\n"
                ));
                out.exit_code = 1;
                return Ok(out);
            } else if let Some(code) = number_arg(line, "sys.exit(") {
                out.exit_code = code as i64;
                return Ok(out);
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl IsolationRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.workspaces
            .lock()
            .unwrap()
            .push(invocation.workspace.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        invocation.lifecycle.mark_started();

        let script = std::fs::read_to_string(invocation.workspace.join(&invocation.script));
        let result = match script {
            Ok(script) => {
                self.scripts.lock().unwrap().push(script.clone());
                self.interpret(&invocation, &script).await
            }
            Err(e) => Err(SandboxError::Io(e)),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Never finishes and ignores the invocation timeout.
pub struct HangingRuntime;

#[async_trait]
impl IsolationRuntime for HangingRuntime {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        invocation.lifecycle.mark_started();
        std::future::pending::<Result<RawOutput>>().await
    }
}

/// Takes `startup` to get the guest going, then runs for `work`, the way a
/// container engine spends time creating and starting a container.
pub struct SlowStartRuntime {
    pub startup: Duration,
    pub work: Duration,
}

#[async_trait]
impl IsolationRuntime for SlowStartRuntime {
    fn name(&self) -> &str {
        "slow-start"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        tokio::time::sleep(self.startup).await;
        invocation.lifecycle.mark_started();
        if tokio::time::timeout(invocation.timeout, tokio::time::sleep(self.work))
            .await
            .is_err()
        {
            return Err(SandboxError::Timeout(invocation.timeout));
        }
        Ok(RawOutput {
            stdout: "finished\n".to_string(),
            ..RawOutput::default()
        })
    }
}

/// Never gets the guest running, like a pull from an unreachable registry.
pub struct StalledLaunchRuntime;

#[async_trait]
impl IsolationRuntime for StalledLaunchRuntime {
    fn name(&self) -> &str {
        "stalled-launch"
    }

    async fn run_python(&self, _invocation: Invocation) -> Result<RawOutput> {
        std::future::pending::<Result<RawOutput>>().await
    }
}

/// Starts a guest that never ends and ignores its timeout. Dropping the run
/// hands a slow teardown task to the lifecycle, which sets `torn_down`.
#[derive(Default)]
pub struct RunawayRuntime {
    pub torn_down: Arc<AtomicBool>,
}

struct RunawayGuest {
    invocation: Invocation,
    torn_down: Arc<AtomicBool>,
}

impl Drop for RunawayGuest {
    fn drop(&mut self) {
        let flag = self.torn_down.clone();
        self.invocation.lifecycle.defer_cleanup(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        }));
    }
}

#[async_trait]
impl IsolationRuntime for RunawayRuntime {
    fn name(&self) -> &str {
        "runaway"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        invocation.lifecycle.mark_started();
        let _guest = RunawayGuest {
            invocation,
            torn_down: self.torn_down.clone(),
        };
        std::future::pending::<Result<RawOutput>>().await
    }
}

/// Fails every launch, like a missing container engine.
pub struct UnavailableRuntime;

#[async_trait]
impl IsolationRuntime for UnavailableRuntime {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn run_python(&self, _invocation: Invocation) -> Result<RawOutput> {
        Err(SandboxError::ExecutionFailed(
            "cannot connect to the container engine".to_string(),
        ))
    }

    async fn health_check(&self) -> Result<()> {
        Err(SandboxError::ExecutionFailed("engine unreachable".to_string()))
    }
}

pub fn config(root: &Path, timeout: Duration, max_concurrency: usize) -> SandboxConfig {
    SandboxConfig::builder()
        .workspace_root(root)
        .timeout(timeout)
        .launch_timeout(Duration::from_secs(5))
        .max_concurrency(max_concurrency)
        .build()
}

pub fn manager(root: &Path, runtime: Arc<dyn IsolationRuntime>) -> SandboxManager {
    SandboxManager::with_runtime(config(root, Duration::from_secs(5), 4), runtime).unwrap()
}

/// True when `root` holds no leftover workspaces.
pub fn is_empty_dir(root: &Path) -> bool {
    std::fs::read_dir(root).unwrap().next().is_none()
}

fn string_arg(line: &str, prefix: &str) -> Option<String> {
    let rest = line.strip_prefix(prefix)?;
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(body[..end].to_string())
}

fn number_arg(line: &str, prefix: &str) -> Option<f64> {
    let rest = line.strip_prefix(prefix)?;
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

fn guest_to_host(workspace: &Path, guest_path: &str) -> Option<PathBuf> {
    let name = guest_path.strip_prefix(GUEST_WORKSPACE)?.strip_prefix('/')?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(workspace.join(name))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
