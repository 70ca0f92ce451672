mod docker;
#[cfg(test)]
pub(crate) mod testing;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime api error: {0}")]
    Api(String),
    #[error("container {0} not found")]
    NotFound(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        RuntimeError::Api(err.to_string())
    }
}

/// Lowercases and trims a label key or value.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// An image discovered in the runtime, with its label map normalized.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    labels: HashMap<String, String>,
}

impl RuntimeImage {
    pub fn new(id: impl Into<String>, repo_tags: Vec<String>, labels: HashMap<String, String>) -> Self {
        let labels = labels
            .into_iter()
            .map(|(k, v)| (normalize(&k), v))
            .collect();
        Self {
            id: id.into(),
            repo_tags,
            labels,
        }
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.labels.get(&normalize(key)).map(|v| normalize(v))
    }

    pub fn label_or(&self, key: &str, default: &str) -> String {
        self.label(key).unwrap_or_else(|| default.to_string())
    }

    pub fn label_i32_or(&self, key: &str, default: i32) -> i32 {
        match self.label(key) {
            Some(val) => val.parse().unwrap_or_else(|err| {
                warn!("[{key}: {val:?}] int parse error: {err}");
                default
            }),
            None => default,
        }
    }

    pub fn label_bool_or(&self, key: &str, default: bool) -> bool {
        match self.label(key) {
            Some(val) => val.parse().unwrap_or_else(|err| {
                warn!("[{key}: {val:?}] bool parse error: {err}");
                default
            }),
            None => default,
        }
    }

    pub fn label_duration_or(&self, key: &str, default: Duration) -> Duration {
        match self.label(key) {
            Some(val) => parse_duration(&val).unwrap_or_else(|| {
                warn!("[{key}: {val:?}] duration parse error");
                default
            }),
            None => default,
        }
    }
}

/// Parses duration strings of the `90s` / `15m` / `24h` / `1h30m` form used
/// in image labels.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let mut unit = c.to_string();
        if let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            }
        }
        let value: f64 = num.parse().ok()?;
        num.clear();
        let scale = match unit.as_str() {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * scale);
    }
    if !num.is_empty() {
        // Trailing bare number has no unit.
        return None;
    }
    Some(total)
}

/// Runtime-specific create spec. The core fills it in while parsing image
/// labels and otherwise treats it as opaque.
#[derive(Debug, Clone, Default)]
pub struct ContainerTemplate {
    /// Image id or reference to launch.
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub tty: bool,
    pub network_disabled: bool,
    pub stop_signal: Option<String>,
    pub exposed_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub ip_address: Option<String>,
}

/// How a container ended.
#[derive(Debug, Clone, Default)]
pub struct ContainerExit {
    pub exit_code: i64,
    pub error_message: Option<String>,
}

/// Attached stdio of a running container.
pub struct AttachedIo {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// The capabilities the core needs from a container runtime. Errors are
/// propagated as-is; retry policy belongs to the caller.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Images tagged with the `orca.enabled` label.
    async fn list_labeled_images(&self) -> Result<Vec<RuntimeImage>, RuntimeError>;

    async fn create_container(&self, template: &ContainerTemplate) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn attach(&self, id: &str) -> Result<AttachedIo, RuntimeError>;

    async fn resize_tty(&self, id: &str, height: u16, width: u16) -> Result<(), RuntimeError>;

    /// Blocks until the container is no longer running.
    async fn wait(&self, id: &str) -> Result<ContainerExit, RuntimeError>;

    /// Force-removes the container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
