use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::catalog::CatalogEndpoints;

/// Upper bound for a single retry delay.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Capacity of the progress channel; slow subscribers beyond this lag and
/// miss events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long a stopping server waits for cancelled tasks to wind down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settings shared by every subcommand. Each flag falls back to an
/// environment variable.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    #[arg(long, env = "STORAGE_PATH", default_value = "/workspace/models", help = "Root directory downloads are written under")]
    pub storage_path: PathBuf,

    #[arg(long, env = "CIVITAI_API_KEY", hide_env_values = true)]
    pub civitai_api_key: Option<String>,

    #[arg(long, env = "HUGGINGFACE_API_KEY", hide_env_values = true)]
    pub huggingface_api_key: Option<String>,

    #[arg(long, env = "CIVITAI_BASE_URL", default_value = "https://civitai.com")]
    pub civitai_base_url: String,

    #[arg(long, env = "HUGGINGFACE_BASE_URL", default_value = "https://huggingface.co")]
    pub huggingface_base_url: String,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30, help = "Timeout for each request and each body read")]
    pub request_timeout_secs: u64,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3, help = "Retries after a network timeout")]
    pub max_retries: u32,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 2000, help = "First retry delay, doubled on every further retry")]
    pub retry_backoff_ms: u64,
}

impl Settings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff_base: Duration::from_millis(self.retry_backoff_ms),
                backoff_cap: MAX_RETRY_BACKOFF,
            },
            endpoints: CatalogEndpoints {
                civitai_base: self.civitai_base_url.clone(),
                huggingface_base: self.huggingface_base_url.clone(),
                civitai_token: non_empty(&self.civitai_api_key),
                huggingface_token: non_empty(&self.huggingface_api_key),
            },
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: MAX_RETRY_BACKOFF,
        }
    }
}

/// Runtime configuration of the download engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub endpoints: CatalogEndpoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            endpoints: CatalogEndpoints::default(),
        }
    }
}
