//! WebAssembly runtime.
//!
//! Runs a RustPython interpreter compiled to WASI inside Wasmtime. The
//! workspace is the only preopened directory, so the guest sees no other part
//! of the host filesystem and has no network or subprocess access. Memory is
//! bounded by [`GuestLimiter`](super::limits::GuestLimiter), instruction
//! count optionally by fuel, and wall time by epoch interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use wasmtime::{Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::preview1;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::limits::{GuestState, StoreLimiterExt};
use super::{Invocation, IsolationRuntime, RawOutput};
use crate::error::{Result, SandboxError};
use crate::sandbox::config::WasmConfig;
use crate::sandbox::io::SandboxIo;
use crate::sandbox::workspace::GUEST_WORKSPACE;

/// Extra time granted past the epoch deadline before giving up on the
/// blocking task.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

/// Python in Wasmtime with the workspace preopened.
pub struct WasmRuntime {
    config: WasmConfig,
    engine: Engine,
    module: Module,
    ticker_stop: Arc<AtomicBool>,
}

impl WasmRuntime {
    /// Compile the interpreter and start the epoch ticker.
    ///
    /// A missing interpreter file is reported here, at startup, rather than
    /// on every request.
    pub fn new(config: WasmConfig) -> Result<Self> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.epoch_interruption(true);
        engine_config.consume_fuel(config.max_fuel.is_some());

        let engine = Engine::new(&engine_config).map_err(|e| {
            SandboxError::RuntimeInit(anyhow::anyhow!("failed to create engine: {}", e))
        })?;

        let wasm_bytes = std::fs::read(&config.interpreter_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::InterpreterNotFound(config.interpreter_path.display().to_string())
            } else {
                SandboxError::Io(e)
            }
        })?;

        let module = Module::new(&engine, &wasm_bytes).map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to compile module: {}", e))
        })?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        spawn_epoch_ticker(engine.clone(), config.epoch_tick_interval, ticker_stop.clone());

        Ok(Self {
            config,
            engine,
            module,
            ticker_stop,
        })
    }

    /// Epoch ticks that make up `timeout`, rounded up.
    fn deadline_ticks(&self, timeout: Duration) -> u64 {
        let tick = self.config.epoch_tick_interval.as_nanos().max(1);
        let ticks = timeout.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    /// Synchronous execution (runs in a blocking task).
    fn execute_sync(
        engine: &Engine,
        module: &Module,
        invocation: &Invocation,
        limits: GuestLimits,
    ) -> Result<RawOutput> {
        let io = SandboxIo::default();
        let script_path = format!("{GUEST_WORKSPACE}/{}", invocation.script);

        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&["python".to_string(), script_path])
            .env("MPLBACKEND", "Agg")
            .stdin(io.stdin.clone())
            .stdout(io.stdout.clone())
            .stderr(io.stderr.clone());
        builder
            .preopened_dir(
                &invocation.workspace,
                GUEST_WORKSPACE,
                DirPerms::all(),
                FilePerms::all(),
            )
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to preopen workspace: {}", e)))?;
        let wasi = builder.build_p1();

        let mut store = Store::new(engine, GuestState::new(limits.max_memory, wasi));
        store.configure_limiter();
        store.epoch_deadline_trap();
        store.set_epoch_deadline(limits.deadline_ticks);

        if let Some(fuel) = limits.max_fuel {
            store.set_fuel(fuel).map_err(|e| {
                SandboxError::RuntimeInit(anyhow::anyhow!("failed to set fuel: {}", e))
            })?;
        }

        let mut linker = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to link WASI: {}", e)))?;

        let instance = linker.instantiate(&mut store, module).map_err(|e| {
            match store.data().limiter.refusal() {
                Some(refusal) => SandboxError::MemoryLimitExceeded(format!(
                    "{refusal} during instantiation"
                )),
                None => SandboxError::ModuleLoad(anyhow::anyhow!("failed to instantiate: {}", e)),
            }
        })?;

        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| {
                SandboxError::ModuleLoad(anyhow::anyhow!("failed to get _start function: {}", e))
            })?;

        // The deadline is relative to the current epoch, so instantiation
        // time is not charged to the guest.
        store.set_epoch_deadline(limits.deadline_ticks);
        invocation.lifecycle.mark_started();

        let exit_code = match start.call(&mut store, ()) {
            Ok(()) => 0,
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    i64::from(exit.0)
                } else if let Some(refusal) = store.data().limiter.refusal() {
                    return Err(SandboxError::MemoryLimitExceeded(refusal.to_string()));
                } else {
                    match e.downcast_ref::<Trap>() {
                        Some(Trap::Interrupt) => return Err(SandboxError::Timeout(limits.timeout)),
                        Some(Trap::OutOfFuel) => {
                            return Err(SandboxError::OutOfFuel {
                                consumed: limits.max_fuel,
                            })
                        }
                        _ => {
                            // A trap inside the interpreter is the guest
                            // crashing; report it like an uncaught error.
                            let mut stderr = io.stderr_str();
                            if !stderr.is_empty() && !stderr.ends_with('\n') {
                                stderr.push('\n');
                            }
                            stderr.push_str(&format!("interpreter trapped: {e}"));
                            return Ok(RawOutput {
                                stdout: io.stdout_str(),
                                stderr,
                                exit_code: 1,
                            });
                        }
                    }
                }
            }
        };

        debug!(
            exit_code,
            peak_memory = store.data().limiter.peak_memory(),
            "wasm guest finished"
        );

        Ok(RawOutput {
            stdout: io.stdout_str(),
            stderr: io.stderr_str(),
            exit_code,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct GuestLimits {
    max_memory: u64,
    max_fuel: Option<u64>,
    deadline_ticks: u64,
    timeout: Duration,
}

#[async_trait]
impl IsolationRuntime for WasmRuntime {
    fn name(&self) -> &str {
        "wasm"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        let timeout = invocation.timeout;
        let limits = GuestLimits {
            max_memory: self.config.max_memory,
            max_fuel: self.config.max_fuel,
            deadline_ticks: self.deadline_ticks(timeout),
            timeout,
        };
        let engine = self.engine.clone();
        let module = self.module.clone();
        let lifecycle = invocation.lifecycle.clone();

        // The blocking task cannot be aborted; if this future is dropped the
        // caller still waits, through the lifecycle, until the guest is gone.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        invocation.lifecycle.defer_cleanup(tokio::spawn(async move {
            let _ = done_rx.await;
        }));

        let exec_handle = tokio::task::spawn_blocking(move || {
            let _done = done_tx;
            Self::execute_sync(&engine, &module, &invocation, limits)
        });

        // The epoch deadline stops the guest; this only guards against the
        // blocking task not coming back.
        tokio::select! {
            result = exec_handle => match result {
                Ok(inner) => inner,
                Err(e) => Err(SandboxError::ExecutionFailed(format!("task panicked: {}", e))),
            },
            _ = async {
                lifecycle.started().await;
                tokio::time::sleep(timeout + INTERRUPT_GRACE).await;
            } => {
                warn!(timeout = ?timeout, "wasm guest did not stop at its epoch deadline");
                Err(SandboxError::Timeout(timeout))
            }
        }
    }
}

impl Drop for WasmRuntime {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}

/// Advance the engine epoch at a fixed interval until `stop` is set. One
/// ticker serves every concurrent guest on the engine; each store carries its
/// own deadline.
fn spawn_epoch_ticker(engine: Engine, interval: Duration, stop: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("wasm-epoch-ticker".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                engine.increment_epoch();
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start epoch ticker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn interpreter() -> PathBuf {
        PathBuf::from("assets/rustpython.wasm")
    }

    #[test]
    fn test_missing_interpreter_is_startup_error() {
        let config = WasmConfig {
            interpreter_path: PathBuf::from("does/not/exist.wasm"),
            ..WasmConfig::default()
        };
        assert!(matches!(
            WasmRuntime::new(config),
            Err(SandboxError::InterpreterNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_simple_execution() {
        let runtime = WasmRuntime::new(WasmConfig {
            interpreter_path: interpreter(),
            ..WasmConfig::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print(1 + 1)").unwrap();

        let output = runtime
            .run_python(Invocation::new(dir.path(), "main.py", Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "2");
    }

    #[tokio::test]
    #[ignore = "requires rustpython.wasm"]
    async fn test_timeout() {
        let runtime = WasmRuntime::new(WasmConfig {
            interpreter_path: interpreter(),
            ..WasmConfig::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "while True: pass").unwrap();

        let result = runtime
            .run_python(Invocation::new(dir.path(), "main.py", Duration::from_millis(200)))
            .await;

        assert!(matches!(result, Err(SandboxError::Timeout(_))));
    }
}
