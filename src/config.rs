//! Environment-driven configuration.
//!
//! Every knob has a default so a bare `.env` with a database URL and an API
//! key is enough to run. Durations are seconds unless the variable name says
//! otherwise.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/brigade".to_string()),
            pool_size: env_or("DATABASE_POOL_SIZE", 16),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// LLM provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Default supervisor model.
    pub default_model: String,
    /// Default worker model when the supervisor context has none.
    pub worker_model: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key: std::env::var("LLM_API_KEY").ok().map(SecretString::from),
            default_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-5".to_string()),
            worker_model: std::env::var("LLM_WORKER_MODEL")
                .unwrap_or_else(|_| "gpt-5-mini".to_string()),
        }
    }
}

/// ReAct engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Context trimming: maximum user-turn segments kept. Zero disables.
    pub max_user_turns: usize,
    /// Context trimming: character budget across the trimmed window. Zero
    /// disables.
    pub max_chars: usize,
    /// Tool outputs longer than this are offloaded to the tool-output store
    /// and replaced with a marker plus head-tail preview.
    pub max_tool_output_chars: usize,
    pub stream_tokens: bool,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            max_user_turns: env_or("ENGINE_MAX_USER_TURNS", 20),
            max_chars: env_or("ENGINE_MAX_CONTEXT_CHARS", 180_000),
            max_tool_output_chars: env_or("ENGINE_MAX_TOOL_OUTPUT_CHARS", 16_000),
            stream_tokens: env_or("ENGINE_STREAM_TOKENS", true),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_user_turns: 20,
            max_chars: 180_000,
            max_tool_output_chars: 16_000,
            stream_tokens: false,
        }
    }
}

/// Supervisor lifecycle settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Shielded request timeout; hitting it defers the run, never cancels it.
    pub run_timeout: Duration,
    /// Absolute barrier deadline enforced by the reaper.
    pub barrier_deadline: Duration,
    /// Inbox context messages newer than this survive pruning.
    pub inbox_stale_after: Duration,
    /// Maximum continuation-of-continuation chain length.
    pub continuation_depth_limit: u32,
}

impl SupervisorSettings {
    pub fn from_env() -> Self {
        Self {
            run_timeout: Duration::from_secs(env_or("SUPERVISOR_TIMEOUT_SECS", 60)),
            barrier_deadline: Duration::from_secs(env_or("BARRIER_DEADLINE_SECS", 600)),
            inbox_stale_after: Duration::from_secs(env_or("INBOX_STALE_SECS", 5)),
            continuation_depth_limit: env_or("CONTINUATION_DEPTH_LIMIT", 10),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(60),
            barrier_deadline: Duration::from_secs(600),
            inbox_stale_after: Duration::from_secs(5),
            continuation_depth_limit: 10,
        }
    }
}

/// Worker processor and reaper settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Queue poll interval when no job is available.
    pub poll_interval: Duration,
    /// How often the barrier reaper scans for expired barriers and orphans.
    pub reaper_interval: Duration,
    /// `created` jobs older than this without a barrier are reaped.
    pub orphan_cutoff: Duration,
    /// Concurrent worker slots.
    pub concurrency: usize,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_INTERVAL_MS", 500)),
            reaper_interval: Duration::from_secs(env_or("REAPER_INTERVAL_SECS", 30)),
            orphan_cutoff: Duration::from_secs(env_or("ORPHAN_CUTOFF_SECS", 300)),
            concurrency: env_or("WORKER_CONCURRENCY", 4),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_secs(30),
            orphan_cutoff: Duration::from_secs(300),
            concurrency: 4,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub engine: EngineSettings,
    pub supervisor: SupervisorSettings,
    pub worker: WorkerSettings,
    pub artifacts_dir: PathBuf,
}

impl Config {
    /// Load configuration from the environment (and `.env` if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database: DatabaseConfig::from_env(),
            llm: LlmConfig::from_env(),
            engine: EngineSettings::from_env(),
            supervisor: SupervisorSettings::from_env(),
            worker: WorkerSettings::from_env(),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.barrier_deadline, Duration::from_secs(600));
        assert_eq!(settings.continuation_depth_limit, 10);

        let worker = WorkerSettings::default();
        assert_eq!(worker.orphan_cutoff, Duration::from_secs(300));
    }
}
