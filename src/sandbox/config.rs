//! Sandbox configuration with builder pattern.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DockerConfig {
    /// Image reference with a Python interpreter (and plotting libraries).
    pub image: String,
    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// CPU share, e.g. `1.0` for one core.
    pub cpu_limit: Option<f64>,
    /// Maximum number of processes inside the container.
    pub pids_limit: Option<i64>,
    /// Disable all networking.
    pub network_disabled: bool,
}

impl DockerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            memory_limit: Some(512 * 1024 * 1024), // 512MB
            cpu_limit: Some(1.0),
            pids_limit: Some(64),
            network_disabled: true,
        }
    }
}

/// WebAssembly runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WasmConfig {
    /// Path to the RustPython wasm file.
    pub interpreter_path: PathBuf,
    /// Maximum linear memory in bytes.
    pub max_memory: u64,
    /// Maximum fuel (instruction count limit).
    pub max_fuel: Option<u64>,
    /// Epoch interruption interval for cooperative timeout.
    pub epoch_tick_interval: Duration,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            interpreter_path: PathBuf::from("assets/rustpython.wasm"),
            max_memory: 64 * 1024 * 1024, // 64MB
            max_fuel: None,
            epoch_tick_interval: Duration::from_millis(10),
        }
    }
}

/// Which isolation runtime executes Python code.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeConfig {
    Docker(DockerConfig),
    Wasm(WasmConfig),
}

/// Configuration for the sandbox manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Wall-clock budget per request, counted from guest start.
    pub timeout: Duration,
    /// How long the runtime may take to get the guest running (container
    /// creation, image pull) before the request fails as infrastructure.
    pub launch_timeout: Duration,
    /// Maximum number of backends running at once; extra requests queue FIFO.
    pub max_concurrency: usize,
    /// Directory under which per-request workspaces are created.
    pub workspace_root: PathBuf,
    /// Isolation runtime for Python.
    pub runtime: RuntimeConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(120),
            max_concurrency: 4,
            workspace_root: std::env::temp_dir(),
            runtime: RuntimeConfig::Docker(DockerConfig::new("")),
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Build a configuration from `PYTHON_DOCKER_IMAGE` and the `SANDBOX_*`
    /// environment variables. The result is validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = SandboxConfig::builder();

        if let Some(secs) = lookup("SANDBOX_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| SandboxError::Config(format!("SANDBOX_TIMEOUT_SECS: not a number: {secs:?}")))?;
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = lookup("SANDBOX_LAUNCH_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                SandboxError::Config(format!("SANDBOX_LAUNCH_TIMEOUT_SECS: not a number: {secs:?}"))
            })?;
            builder = builder.launch_timeout(Duration::from_secs(secs));
        }
        if let Some(limit) = lookup("SANDBOX_MAX_CONCURRENCY") {
            let limit: usize = limit.parse().map_err(|_| {
                SandboxError::Config(format!("SANDBOX_MAX_CONCURRENCY: not a number: {limit:?}"))
            })?;
            builder = builder.max_concurrency(limit);
        }
        if let Some(root) = lookup("SANDBOX_WORKSPACE_ROOT") {
            builder = builder.workspace_root(root);
        }

        let runtime = lookup("SANDBOX_RUNTIME").unwrap_or_else(|| "docker".to_string());
        let runtime = match runtime.to_ascii_lowercase().as_str() {
            "docker" => {
                let image = lookup("PYTHON_DOCKER_IMAGE").unwrap_or_default();
                let mut docker = DockerConfig::new(image);
                if let Some(limit) = lookup("SANDBOX_MEMORY_LIMIT") {
                    docker.memory_limit = Some(parse_memory_limit(&limit).ok_or_else(|| {
                        SandboxError::Config(format!("SANDBOX_MEMORY_LIMIT: invalid size {limit:?}"))
                    })?);
                }
                RuntimeConfig::Docker(docker)
            }
            "wasm" => {
                let mut wasm = WasmConfig::default();
                if let Some(path) = lookup("SANDBOX_WASM_INTERPRETER") {
                    wasm.interpreter_path = PathBuf::from(path);
                }
                if let Some(limit) = lookup("SANDBOX_MEMORY_LIMIT") {
                    let bytes = parse_memory_limit(&limit).ok_or_else(|| {
                        SandboxError::Config(format!("SANDBOX_MEMORY_LIMIT: invalid size {limit:?}"))
                    })?;
                    wasm.max_memory = bytes as u64;
                }
                RuntimeConfig::Wasm(wasm)
            }
            other => {
                return Err(SandboxError::Config(format!(
                    "SANDBOX_RUNTIME must be \"docker\" or \"wasm\", got {other:?}"
                )))
            }
        };

        let config = builder.runtime(runtime).build();
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the manager cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.validate_limits()?;
        match &self.runtime {
            RuntimeConfig::Docker(docker) => {
                if docker.image.trim().is_empty() {
                    return Err(SandboxError::Config(
                        "no container image configured (set PYTHON_DOCKER_IMAGE)".to_string(),
                    ));
                }
                if docker.cpu_limit.is_some_and(|cpus| cpus <= 0.0) {
                    return Err(SandboxError::Config("cpu_limit must be positive".to_string()));
                }
            }
            RuntimeConfig::Wasm(wasm) => {
                if wasm.interpreter_path.as_os_str().is_empty() {
                    return Err(SandboxError::Config("no wasm interpreter configured".to_string()));
                }
                if wasm.max_memory == 0 {
                    return Err(SandboxError::Config("max_memory must be positive".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Check the runtime-independent settings only.
    pub fn validate_limits(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(SandboxError::Config("timeout must be greater than zero".to_string()));
        }
        if self.launch_timeout.is_zero() {
            return Err(SandboxError::Config(
                "launch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(SandboxError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    timeout: Option<Duration>,
    launch_timeout: Option<Duration>,
    max_concurrency: Option<usize>,
    workspace_root: Option<PathBuf>,
    runtime: Option<RuntimeConfig>,
}

impl SandboxConfigBuilder {
    /// Set the per-request wall-clock timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of concurrently running backends.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Set the directory that holds per-request workspaces.
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(path.into());
        self
    }

    /// Use a container image as the isolation runtime.
    pub fn docker_image(mut self, image: impl Into<String>) -> Self {
        self.runtime = Some(RuntimeConfig::Docker(DockerConfig::new(image)));
        self
    }

    /// Use the WebAssembly interpreter at `path` as the isolation runtime.
    pub fn wasm_interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime = Some(RuntimeConfig::Wasm(WasmConfig {
            interpreter_path: path.into(),
            ..WasmConfig::default()
        }));
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            timeout: self.timeout.unwrap_or(default.timeout),
            launch_timeout: self.launch_timeout.unwrap_or(default.launch_timeout),
            max_concurrency: self.max_concurrency.unwrap_or(default.max_concurrency),
            workspace_root: self.workspace_root.unwrap_or(default.workspace_root),
            runtime: self.runtime.unwrap_or(default.runtime),
        }
    }
}

/// Parse a memory size such as `512m`, `1g`, `1024k` or plain bytes.
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_ascii_lowercase();
    let limit = limit.strip_suffix('b').unwrap_or(&limit);
    let (digits, multiplier) = match limit.chars().last()? {
        'g' => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        'm' => (&limit[..limit.len() - 1], 1024 * 1024),
        'k' => (&limit[..limit.len() - 1], 1024),
        _ => (limit, 1),
    };
    let value: i64 = digits.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    value.checked_mul(multiplier)
}
