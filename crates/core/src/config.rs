use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub sandbox: SandboxSettings,
    pub transport: TransportSettings,
    pub resilience: ResilienceSettings,
    pub telemetry: TelemetrySettings,
}

/// Which execution backend to open.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Local,
    Container,
    /// Container when the engine is reachable, otherwise local.
    Auto,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxSettings {
    pub backend: SandboxBackend,
    /// Host working directory for the local backend. A temp dir is used when unset.
    pub local_work_dir: Option<String>,
    pub image: String,
    /// Reuse a running container with this name instead of creating one.
    pub container_name: Option<String>,
    pub container_work_dir: String,
    /// Keep the container running after close (only meaningful with a name).
    pub keep_container: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    pub binary: String,
    pub default_model: Option<String>,
    /// `json`, `stream-json` or `text`.
    pub output_format: String,
    /// `default`, `acceptEdits`, `plan`, `bypassPermissions` or `dangerouslySkipPermissions`.
    pub permission_mode: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub entrypoint: String,
    pub api_key_env: String,
    pub api_key: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub sliding_window_ms: u64,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Budget for a whole resilient call, across retries.
    pub operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    pub json_logs: bool,
    pub prometheus: bool,
}

impl AppConfig {
    /// Load layered configuration: built-in defaults, optional files, then env.
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("AGENT_RUNNER_ENV").unwrap_or_else(|_| "development".into());

        let d = AppConfig::default();
        let s = Config::builder()
            .set_default("sandbox.backend", "auto")?
            .set_default("sandbox.image", d.sandbox.image)?
            .set_default("sandbox.container_work_dir", d.sandbox.container_work_dir)?
            .set_default("sandbox.keep_container", d.sandbox.keep_container)?
            .set_default("transport.binary", d.transport.binary)?
            .set_default("transport.output_format", d.transport.output_format)?
            .set_default("transport.permission_mode", d.transport.permission_mode)?
            .set_default("transport.timeout_secs", d.transport.timeout_secs)?
            .set_default("transport.probe_timeout_secs", d.transport.probe_timeout_secs)?
            .set_default("transport.entrypoint", d.transport.entrypoint)?
            .set_default("transport.api_key_env", d.transport.api_key_env)?
            .set_default("resilience.failure_threshold", d.resilience.failure_threshold)?
            .set_default("resilience.recovery_timeout_ms", d.resilience.recovery_timeout_ms)?
            .set_default("resilience.sliding_window_ms", d.resilience.sliding_window_ms)?
            .set_default("resilience.max_attempts", d.resilience.max_attempts)?
            .set_default("resilience.initial_delay_ms", d.resilience.initial_delay_ms)?
            .set_default("resilience.max_delay_ms", d.resilience.max_delay_ms)?
            .set_default("resilience.backoff_multiplier", d.resilience.backoff_multiplier)?
            .set_default("telemetry.json_logs", d.telemetry.json_logs)?
            .set_default("telemetry.prometheus", d.telemetry.prometheus)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map AGENT_RUNNER__SANDBOX__BACKEND=container to sandbox.backend
            .add_source(Environment::with_prefix("AGENT_RUNNER").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxSettings {
                backend: SandboxBackend::Auto,
                local_work_dir: None,
                image: "agent-runner-sandbox:latest".into(),
                container_name: None,
                container_work_dir: "/work".into(),
                keep_container: false,
            },
            transport: TransportSettings {
                binary: "claude".into(),
                default_model: None,
                output_format: "json".into(),
                permission_mode: "default".into(),
                timeout_secs: 600,
                probe_timeout_secs: 5,
                entrypoint: "sdk-rust".into(),
                api_key_env: "ANTHROPIC_API_KEY".into(),
                api_key: None,
            },
            resilience: ResilienceSettings {
                failure_threshold: 5,
                recovery_timeout_ms: 30_000,
                sliding_window_ms: 60_000,
                max_attempts: 3,
                initial_delay_ms: 1_000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                operation_timeout_ms: None,
            },
            telemetry: TelemetrySettings {
                json_logs: false,
                prometheus: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.sandbox.backend, SandboxBackend::Auto);
        assert_eq!(config.sandbox.container_work_dir, "/work");
        assert_eq!(config.transport.binary, "claude");
        assert_eq!(config.resilience.max_attempts, 3);
        assert!(config.transport.api_key.is_none());
    }

    #[test]
    fn test_load_without_files_matches_defaults() {
        let loaded = AppConfig::load().unwrap();
        let defaults = AppConfig::default();
        assert_eq!(loaded.transport.binary, defaults.transport.binary);
        assert_eq!(
            loaded.resilience.failure_threshold,
            defaults.resilience.failure_threshold
        );
        assert_eq!(loaded.telemetry.json_logs, defaults.telemetry.json_logs);
    }
}
