//! Engine configuration resolved from environment variables.

use std::path::PathBuf;

/// Runtime limits and paths for the engine, with the documented defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Root directory for per-task workspaces (`WORKSPACE_ROOT`).
    pub workspace_root: PathBuf,
    /// Days before idle workspaces are swept (`WORKSPACE_TTL_DAYS`).
    pub workspace_ttl_days: Option<u32>,
    /// Days before task rows and files are purged (`TASK_TTL_DAYS`).
    pub task_ttl_days: Option<u32>,
    /// Templates directory (`TEMPLATES_DIR`).
    pub templates_dir: Option<PathBuf>,
    /// Whether container files are mirrored to the store
    /// (`ENABLE_FILE_PERSISTENCE`).
    pub file_persistence: bool,
    /// Durable store location (`DATABASE_URL`); `None` selects the
    /// in-memory store.
    pub database_url: Option<String>,
    /// Concurrency ceiling for task runners (`MAX_CONCURRENT_TASKS`).
    pub max_concurrent_tasks: usize,
    /// Per-minute `create_task` limit (`RATE_LIMIT_CREATE_TASKS_PER_MIN`).
    pub rate_limit_create_tasks_per_min: u32,
    /// Per-minute `rerun_review` limit (`RATE_LIMIT_RERUN_REVIEW_PER_MIN`).
    pub rate_limit_rerun_review_per_min: u32,
    /// Per-minute `download` limit (`RATE_LIMIT_DOWNLOADS_PER_MIN`).
    pub rate_limit_downloads_per_min: u32,
    /// Daily token quota per owner, 0 = unlimited (`MAX_TOKENS_PER_DAY`).
    pub max_tokens_per_day: u64,
    /// Daily command-run quota per owner, 0 = unlimited
    /// (`MAX_COMMAND_RUNS_PER_DAY`).
    pub max_command_runs_per_day: u64,
    /// Per-task byte cap for persisted files (`MAX_TASK_BYTES`).
    pub max_task_bytes: u64,
    /// Per-task file-count cap (`MAX_TASK_FILES`).
    pub max_task_files: u64,
    /// Command wall-clock timeout (`COMMAND_TIMEOUT_SECONDS`).
    pub command_timeout_seconds: u64,
    /// Captured-output cap per stream (`COMMAND_MAX_OUTPUT_BYTES`).
    pub command_max_output_bytes: usize,
    /// Allowlist override, comma-separated (`ALLOWED_COMMANDS`).
    pub allowed_commands: Option<Vec<String>>,
    /// Per-task LLM call ceiling, 0 = unlimited (`LLM_MAX_CALLS_PER_TASK`).
    pub llm_max_calls_per_task: u64,
    /// Per-task LLM token ceiling, 0 = unlimited
    /// (`LLM_MAX_TOTAL_TOKENS_PER_TASK`).
    pub llm_max_total_tokens_per_task: u64,
    /// Parse-repair retries per step (`LLM_MAX_RETRIES_PER_STEP`).
    pub llm_max_retries_per_step: u32,
    /// Iteration ceiling for micro-file tasks (`ORCH_MICRO_MAX_ITERATIONS`).
    pub micro_max_iterations: u64,
    /// Whether each iteration waits for a manual decision
    /// (`MANUAL_STEP_ENABLED`).
    pub manual_step_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspaces"),
            workspace_ttl_days: None,
            task_ttl_days: None,
            templates_dir: None,
            file_persistence: true,
            database_url: None,
            max_concurrent_tasks: 4,
            rate_limit_create_tasks_per_min: 0,
            rate_limit_rerun_review_per_min: 0,
            rate_limit_downloads_per_min: 0,
            max_tokens_per_day: 0,
            max_command_runs_per_day: 0,
            max_task_bytes: 50 * 1024 * 1024,
            max_task_files: 2000,
            command_timeout_seconds: 60,
            command_max_output_bytes: 20_000,
            allowed_commands: None,
            llm_max_calls_per_task: 0,
            llm_max_total_tokens_per_task: 0,
            llm_max_retries_per_step: 2,
            micro_max_iterations: 3,
            manual_step_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Resolve the configuration from the process environment, keeping
    /// defaults for unset or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: env_str("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            workspace_ttl_days: env_parse("WORKSPACE_TTL_DAYS"),
            task_ttl_days: env_parse("TASK_TTL_DAYS"),
            templates_dir: env_str("TEMPLATES_DIR").map(PathBuf::from),
            file_persistence: env_bool("ENABLE_FILE_PERSISTENCE")
                .unwrap_or(defaults.file_persistence),
            database_url: env_str("DATABASE_URL"),
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_concurrent_tasks),
            rate_limit_create_tasks_per_min: env_parse("RATE_LIMIT_CREATE_TASKS_PER_MIN")
                .unwrap_or(defaults.rate_limit_create_tasks_per_min),
            rate_limit_rerun_review_per_min: env_parse("RATE_LIMIT_RERUN_REVIEW_PER_MIN")
                .unwrap_or(defaults.rate_limit_rerun_review_per_min),
            rate_limit_downloads_per_min: env_parse("RATE_LIMIT_DOWNLOADS_PER_MIN")
                .unwrap_or(defaults.rate_limit_downloads_per_min),
            max_tokens_per_day: env_parse("MAX_TOKENS_PER_DAY")
                .unwrap_or(defaults.max_tokens_per_day),
            max_command_runs_per_day: env_parse("MAX_COMMAND_RUNS_PER_DAY")
                .unwrap_or(defaults.max_command_runs_per_day),
            max_task_bytes: env_parse("MAX_TASK_BYTES").unwrap_or(defaults.max_task_bytes),
            max_task_files: env_parse("MAX_TASK_FILES").unwrap_or(defaults.max_task_files),
            command_timeout_seconds: env_parse("COMMAND_TIMEOUT_SECONDS")
                .unwrap_or(defaults.command_timeout_seconds),
            command_max_output_bytes: env_parse("COMMAND_MAX_OUTPUT_BYTES")
                .unwrap_or(defaults.command_max_output_bytes),
            allowed_commands: env_str("ALLOWED_COMMANDS").map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            llm_max_calls_per_task: env_parse("LLM_MAX_CALLS_PER_TASK")
                .unwrap_or(defaults.llm_max_calls_per_task),
            llm_max_total_tokens_per_task: env_parse("LLM_MAX_TOTAL_TOKENS_PER_TASK")
                .unwrap_or(defaults.llm_max_total_tokens_per_task),
            llm_max_retries_per_step: env_parse("LLM_MAX_RETRIES_PER_STEP")
                .unwrap_or(defaults.llm_max_retries_per_step),
            micro_max_iterations: env_parse("ORCH_MICRO_MAX_ITERATIONS")
                .unwrap_or(defaults.micro_max_iterations),
            manual_step_enabled: env_bool("MANUAL_STEP_ENABLED")
                .unwrap_or(defaults.manual_step_enabled),
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
