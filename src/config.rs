use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(val) => val,
            Err(_) => {
                tracing::warn!("invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Scheduling knobs threaded into every `Image`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// How long an election collects candidacies.
    pub election_window: Duration,
    /// How long a container may sit without users or reservations before it
    /// is marked end-of-life.
    pub idle_deletion: Duration,
    /// Total container launch attempts before surfacing a start error.
    pub launch_attempts: u32,
    /// Fixed delay between launch attempts.
    pub launch_retry_delay: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            election_window: Duration::from_millis(5),
            idle_deletion: Duration::from_secs(30),
            launch_attempts: 5,
            launch_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address of the HTTP gateway.
    pub http_addr: String,
    /// URL of the external web-token validator.
    pub token_checker_url: String,
    /// Name of the cookie carrying the web token.
    pub identity_cookie: String,
    /// Login redirect target; `{}` is replaced with the url-encoded original
    /// request URL.
    pub login_url_format: String,
    /// Optional format for the ORCA_INTERNAL_CONTAINER_URL env var handed to
    /// web containers; `{}` is replaced with the lowercased image name.
    pub container_url_format: Option<String>,
    pub scheduling: SchedulingConfig,
    /// Interval between image reconciliations against the runtime.
    pub image_refresh: Duration,
    /// Requested -> Demanded escalation deadline.
    pub request_deadline: Duration,
    /// Demanded -> Forced escalation deadline.
    pub demand_deadline: Duration,
    pub log_dir: String,
    pub pid_file: String,
}

impl GatewayConfig {
    /// Reads configuration from the environment (`.env` honored by the
    /// binary before calling this).
    pub fn from_env() -> Self {
        Self {
            http_addr: env_or("ORCA_HTTP_ADDR", "0.0.0.0:8080"),
            token_checker_url: env_or("ORCA_HTTP_TOKEN_CHECKER", "http://127.0.0.1:9000/check"),
            identity_cookie: env_or("ORCA_HTTP_USER_IDENTITY_COOKIE", "orca-identity"),
            login_url_format: env_or("ORCA_HTTP_LOGIN_URL", "http://127.0.0.1:9000/login?next={}"),
            container_url_format: std::env::var("ORCA_HTTP_CONTAINER_URL_FORMAT").ok(),
            scheduling: SchedulingConfig {
                election_window: Duration::from_millis(env_parse("ORCA_ELECTION_WINDOW_MS", 5)),
                idle_deletion: Duration::from_secs(env_parse("ORCA_IDLE_DELETION_SECS", 30)),
                launch_attempts: env_parse("ORCA_LAUNCH_ATTEMPTS", 5),
                launch_retry_delay: Duration::from_millis(env_parse("ORCA_LAUNCH_RETRY_MS", 500)),
            },
            image_refresh: Duration::from_secs(env_parse("ORCA_IMAGE_REFRESH_SECS", 60)),
            request_deadline: Duration::from_secs(env_parse("ORCA_REQUEST_DEADLINE_SECS", 900)),
            demand_deadline: Duration::from_secs(env_parse("ORCA_DEMAND_DEADLINE_SECS", 5)),
            log_dir: env_or("ORCA_LOG_DIR", "./logs"),
            pid_file: env_or("ORCA_PID_FILE", "/tmp/orca.pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SchedulingConfig::default();
        assert_eq!(cfg.election_window, Duration::from_millis(5));
        assert_eq!(cfg.idle_deletion, Duration::from_secs(30));
        assert_eq!(cfg.launch_attempts, 5);
    }
}
