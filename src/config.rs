use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine-level configuration for the orchestrator binary.
///
/// This is distinct from a project's `autocoder.yaml`, which configures the
/// Gatekeeper's verification commands for that one repository. This struct
/// configures the engine itself and is loaded once in `main` and carried in
/// a [`crate::runtime::Runtime`] rather than stashed in a global.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutocoderConfig {
    pub orchestrator: OrchestratorConfig,
    pub ports: PortConfig,
    pub feature_retry: FeatureRetryConfig,
    pub guardrails: GuardrailConfig,
    pub sdk_retry: SdkRetryConfig,
    pub logs: LogPruneConfig,
    pub artifacts: ArtifactPruneConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub max_agents: u32,
    pub poll_interval_s: u64,
    pub stale_timeout_minutes: i64,
    pub heartbeat_seconds: u64,
    pub require_gatekeeper: bool,
    pub allow_no_tests: bool,
    pub stop_when_done: bool,
    pub main_branch: Option<String>,
    pub fetch_remote: bool,
    pub push_remote: bool,
    pub prioritize_blockers: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    pub api_port_range_start: u16,
    pub api_port_range_end: u16,
    pub web_port_range_start: u16,
    pub web_port_range_end: u16,
    pub skip_port_check: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureRetryConfig {
    pub max_attempts: u32,
    pub max_same_error_streak: u32,
    pub max_same_diff_streak: u32,
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardrailConfig {
    pub max_tool_calls: u32,
    pub max_consecutive_tool_errors: u32,
    pub max_total_tool_errors: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdkRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    pub rate_limit_initial_delay_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogPruneConfig {
    pub keep_days: i64,
    pub keep_files: usize,
    pub max_total_mb: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactPruneConfig {
    pub keep_days: Option<i64>,
    pub keep_files: Option<usize>,
    pub max_total_mb: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for AutocoderConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig {
                max_agents: 3,
                poll_interval_s: 5,
                stale_timeout_minutes: 10,
                heartbeat_seconds: 60,
                require_gatekeeper: true,
                allow_no_tests: false,
                stop_when_done: true,
                main_branch: None,
                fetch_remote: false,
                push_remote: false,
                prioritize_blockers: false,
            },
            ports: PortConfig {
                api_port_range_start: 5000,
                api_port_range_end: 5100,
                web_port_range_start: 5173,
                web_port_range_end: 5273,
                skip_port_check: false,
            },
            feature_retry: FeatureRetryConfig {
                max_attempts: 10,
                max_same_error_streak: 3,
                max_same_diff_streak: 3,
                initial_delay_s: 10,
                max_delay_s: 600,
                exponential_base: 2.0,
                jitter: true,
            },
            guardrails: GuardrailConfig {
                max_tool_calls: 400,
                max_consecutive_tool_errors: 25,
                max_total_tool_errors: 150,
            },
            sdk_retry: SdkRetryConfig {
                max_attempts: 3,
                initial_delay_s: 1,
                max_delay_s: 60,
                exponential_base: 2.0,
                jitter: true,
                rate_limit_initial_delay_s: 30,
            },
            logs: LogPruneConfig {
                keep_days: 7,
                keep_files: 200,
                max_total_mb: 200,
            },
            artifacts: ArtifactPruneConfig {
                keep_days: None,
                keep_files: None,
                max_total_mb: None,
            },
            database: DatabaseConfig {
                url: ".autocoder/agent_system.db".to_string(),
                auto_migrate: true,
            },
            observability: ObservabilityConfig {
                tracing_enabled: true,
                otlp_endpoint: None,
                log_level: "info".to_string(),
            },
        }
    }
}

impl AutocoderConfig {
    /// Load configuration from, in increasing precedence:
    /// 1. defaults (above)
    /// 2. `autocoder.toml` / `.autocoder-rc` in the current directory
    /// 3. environment variables prefixed `AUTOCODER_`
    ///
    /// Returned by value; the caller is responsible for threading it through
    /// a [`crate::runtime::Runtime`] rather than storing it globally.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder().add_source(
            Config::try_from(&defaults).context("failed to serialize default config")?,
        );

        if Path::new("autocoder.toml").exists() {
            builder = builder.add_source(File::with_name("autocoder"));
        }
        if Path::new(".autocoder-rc").exists() {
            builder = builder.add_source(File::with_name(".autocoder-rc"));
        }

        // `Environment::with_prefix` needs the nested group name in the env
        // var (AUTOCODER_FEATURE_RETRY_MAX_ATTEMPTS for feature_retry.max_attempts),
        // but the documented surface is flatter than that
        // (AUTOCODER_FEATURE_MAX_ATTEMPTS). Bind the nested groups this way
        // for anything not named below, then apply the documented flat names
        // as an explicit overlay, same as the teacher's special-cased
        // `GITHUB_TOKEN` handling in `load()`.
        builder = builder.add_source(
            Environment::with_prefix("AUTOCODER")
                .separator("_")
                .try_parsing(true),
        );

        let built = builder.build()?;
        let mut config: Self = built
            .try_deserialize()
            .context("failed to parse AutocoderConfig")?;

        config.apply_documented_env_overrides()?;
        Ok(config)
    }

    /// Overlays the flat `AUTOCODER_*` env var names documented in the
    /// environment-variable surface table directly onto the nested struct,
    /// so they bind even though they don't match `config`'s
    /// group-prefixed naming convention.
    fn apply_documented_env_overrides(&mut self) -> Result<()> {
        macro_rules! apply {
            ($env:literal, $field:expr) => {
                if let Ok(raw) = std::env::var($env) {
                    $field = raw
                        .parse()
                        .with_context(|| format!("invalid value for {}: {raw:?}", $env))?;
                }
            };
        }
        macro_rules! apply_opt {
            ($env:literal, $field:expr) => {
                if let Ok(raw) = std::env::var($env) {
                    $field = Some(
                        raw.parse()
                            .with_context(|| format!("invalid value for {}: {raw:?}", $env))?,
                    );
                }
            };
        }

        apply!("AUTOCODER_REQUIRE_GATEKEEPER", self.orchestrator.require_gatekeeper);
        apply!("AUTOCODER_ALLOW_NO_TESTS", self.orchestrator.allow_no_tests);
        apply!("AUTOCODER_STOP_WHEN_DONE", self.orchestrator.stop_when_done);
        if let Ok(branch) = std::env::var("AUTOCODER_MAIN_BRANCH") {
            self.orchestrator.main_branch = Some(branch);
        }

        apply!("AUTOCODER_API_PORT_RANGE_START", self.ports.api_port_range_start);
        apply!("AUTOCODER_API_PORT_RANGE_END", self.ports.api_port_range_end);
        apply!("AUTOCODER_WEB_PORT_RANGE_START", self.ports.web_port_range_start);
        apply!("AUTOCODER_WEB_PORT_RANGE_END", self.ports.web_port_range_end);
        apply!("AUTOCODER_SKIP_PORT_CHECK", self.ports.skip_port_check);

        apply!("AUTOCODER_FEATURE_MAX_ATTEMPTS", self.feature_retry.max_attempts);
        apply!(
            "AUTOCODER_FEATURE_MAX_SAME_ERROR_STREAK",
            self.feature_retry.max_same_error_streak
        );
        apply!(
            "AUTOCODER_FEATURE_MAX_SAME_DIFF_STREAK",
            self.feature_retry.max_same_diff_streak
        );
        apply!("AUTOCODER_FEATURE_RETRY_INITIAL_DELAY_S", self.feature_retry.initial_delay_s);
        apply!("AUTOCODER_FEATURE_RETRY_MAX_DELAY_S", self.feature_retry.max_delay_s);
        apply!(
            "AUTOCODER_FEATURE_RETRY_EXPONENTIAL_BASE",
            self.feature_retry.exponential_base
        );
        apply!("AUTOCODER_FEATURE_RETRY_JITTER", self.feature_retry.jitter);

        apply!("AUTOCODER_GUARDRAIL_MAX_TOOL_CALLS", self.guardrails.max_tool_calls);
        apply!(
            "AUTOCODER_GUARDRAIL_MAX_CONSECUTIVE_TOOL_ERRORS",
            self.guardrails.max_consecutive_tool_errors
        );
        apply!("AUTOCODER_GUARDRAIL_MAX_TOOL_ERRORS", self.guardrails.max_total_tool_errors);

        apply!("AUTOCODER_SDK_MAX_ATTEMPTS", self.sdk_retry.max_attempts);
        apply!("AUTOCODER_SDK_INITIAL_DELAY_S", self.sdk_retry.initial_delay_s);
        apply!("AUTOCODER_SDK_MAX_DELAY_S", self.sdk_retry.max_delay_s);
        apply!("AUTOCODER_SDK_EXPONENTIAL_BASE", self.sdk_retry.exponential_base);
        apply!("AUTOCODER_SDK_JITTER", self.sdk_retry.jitter);
        apply!(
            "AUTOCODER_SDK_RATE_LIMIT_INITIAL_DELAY_S",
            self.sdk_retry.rate_limit_initial_delay_s
        );

        apply!("AUTOCODER_LOGS_KEEP_DAYS", self.logs.keep_days);
        apply!("AUTOCODER_LOGS_KEEP_FILES", self.logs.keep_files);
        apply!("AUTOCODER_LOGS_MAX_TOTAL_MB", self.logs.max_total_mb);

        // Artifact pruning defaults to the logs knobs when unset; only
        // override when AUTOCODER_ARTIFACTS_* is explicitly provided.
        apply_opt!("AUTOCODER_ARTIFACTS_KEEP_DAYS", self.artifacts.keep_days);
        apply_opt!("AUTOCODER_ARTIFACTS_KEEP_FILES", self.artifacts.keep_files);
        apply_opt!("AUTOCODER_ARTIFACTS_MAX_TOTAL_MB", self.artifacts.max_total_mb);

        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load a `.env` file in the current directory, if present. Best-effort.
    pub fn load_env_file() {
        if Path::new(".env").exists() {
            if let Err(err) = dotenvy::dotenv() {
                tracing::warn!(error = %err, "failed to load .env file");
            } else {
                tracing::debug!("loaded environment variables from .env file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = AutocoderConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AutocoderConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.orchestrator.max_agents, cfg.orchestrator.max_agents);
        assert_eq!(parsed.ports.api_port_range_start, 5000);
    }
}
