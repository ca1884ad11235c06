use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::env_flag;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KaitConfig {
    pub ports: PortsConfig,
    pub ollama: OllamaConfig,
    pub litellm: LitellmConfig,
    pub router: RouterConfig,
    pub breaker: BreakerConfig,
    pub observability: ObservabilityConfig,
    pub watchdog: WatchdogConfig,
    pub archive: ArchiveConfig,
    pub reflection: ReflectionConfig,
}

impl KaitConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: KaitConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if the file doesn't exist, return defaults with
    /// env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply `KAIT_*` environment variable overrides on top of file config.
    pub fn apply_env_overrides(&mut self) {
        set_u16(&mut self.ports.kaitd, "KAIT_KAITD_PORT");
        set_u16(&mut self.ports.pulse, "KAIT_PULSE_PORT");
        set_u16(&mut self.ports.mind, "KAIT_MIND_PORT");
        set_u16(&mut self.ports.matrix_worker, "KAIT_MATRIX_WORKER_PORT");

        if let Ok(v) = std::env::var("KAIT_OLLAMA_HOST") {
            self.ollama.host = v;
        }
        set_u16(&mut self.ollama.port, "KAIT_OLLAMA_PORT");
        if let Ok(v) = std::env::var("KAIT_OLLAMA_MODEL") {
            self.ollama.model = Some(v);
        }
        set_flag(&mut self.ollama.olla_enabled, "KAIT_OLLA_ENABLED");
        if let Ok(v) = std::env::var("KAIT_OLLA_HOST") {
            self.ollama.olla_host = v;
        }
        set_u16(&mut self.ollama.olla_port, "KAIT_OLLA_PORT");

        set_flag(&mut self.litellm.enabled, "KAIT_LITELLM_ENABLED");
        set_u16(&mut self.litellm.port, "KAIT_LITELLM_PORT");
        if let Ok(v) = std::env::var("KAIT_LITELLM_MASTER_KEY") {
            self.litellm.master_key = Some(v);
        }

        set_flag(&mut self.router.enabled, "KAIT_ROUTER_ENABLED");
        if let Ok(v) = std::env::var("KAIT_ROUTER_TYPE") {
            self.router.router_type = v;
        }
        set_f64(&mut self.router.threshold, "KAIT_ROUTER_THRESHOLD");
        if let Ok(v) = std::env::var("KAIT_ROUTER_STRONG") {
            self.router.strong = v;
        }

        set_flag(&mut self.breaker.enabled, "KAIT_CB_ENABLED");
        set_u32(&mut self.breaker.failure_threshold, "KAIT_CB_FAILURE_THRESHOLD");
        set_f64(&mut self.breaker.recovery_timeout_s, "KAIT_CB_RECOVERY_TIMEOUT_S");
        set_u32(&mut self.breaker.half_open_tests, "KAIT_CB_HALF_OPEN_TESTS");

        set_flag(&mut self.observability.enabled, "KAIT_LLM_OBS_ENABLED");
        set_u64(&mut self.observability.jsonl_max_bytes, "KAIT_LLM_OBS_JSONL_MAX_BYTES");
        set_u32(&mut self.observability.jsonl_backups, "KAIT_LLM_OBS_JSONL_BACKUPS");

        set_flag(&mut self.watchdog.plugin_only, "KAIT_PLUGIN_ONLY");
    }
}

fn set_flag(field: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *field = env_flag(&v);
    }
}

fn set_u16(field: &mut u16, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *field = n;
        }
    }
}

fn set_u32(field: &mut u32, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *field = n;
        }
    }
}

fn set_u64(field: &mut u64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *field = n;
        }
    }
}

fn set_f64(field: &mut f64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *field = n;
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub kaitd: u16,
    pub pulse: u16,
    pub mind: u16,
    pub matrix_worker: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            kaitd: 8787,
            pulse: 8765,
            mind: 8790,
            matrix_worker: 8791,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    /// Preferred model; None means auto-detect the best installed model.
    pub model: Option<String>,
    /// Route local traffic through an Olla-style proxy instead of Ollama.
    pub olla_enabled: bool,
    pub olla_host: String,
    pub olla_port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            model: None,
            olla_enabled: false,
            olla_host: "localhost".to_string(),
            olla_port: 11435,
        }
    }
}

impl OllamaConfig {
    /// Effective base URL, honoring the Olla proxy toggle.
    pub fn base_url(&self) -> String {
        if self.olla_enabled {
            format!("http://{}:{}", self.olla_host, self.olla_port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LitellmConfig {
    pub enabled: bool,
    pub port: u16,
    pub master_key: Option<String>,
}

impl Default for LitellmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 4000,
            master_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub enabled: bool,
    /// Scorer flavor identifier; informational, passed to the scorer plugin.
    pub router_type: String,
    /// Complexity score cutoff for cloud routing. The default comes from the
    /// scorer library's out-of-the-box calibration; treat as tunable.
    pub threshold: f64,
    /// Strong provider name: "claude" or "openai".
    pub strong: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            router_type: "mf".to_string(),
            threshold: 0.11593,
            strong: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_s: f64,
    pub half_open_tests: u32,
    /// How often the registry snapshots breaker state to disk.
    pub snapshot_interval_s: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            recovery_timeout_s: 60.0,
            half_open_tests: 2,
            snapshot_interval_s: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    pub ring_size: usize,
    pub jsonl_max_bytes: u64,
    pub jsonl_backups: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_size: 1000,
            jsonl_max_bytes: 10 * 1024 * 1024,
            jsonl_backups: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds between watchdog sweeps.
    pub check_interval_s: u64,
    /// Per-worker heartbeat write interval; a worker is stale past 2x this.
    pub heartbeat_interval_s: u64,
    /// Restart budget within the rolling window.
    pub max_restarts: u32,
    pub restart_window_s: u64,
    /// Restrict restarts to core services only.
    pub plugin_only: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_s: 30,
            heartbeat_interval_s: 30,
            max_restarts: 5,
            restart_window_s: 600,
            plugin_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Sessions with no activity for this long become archivable.
    pub age_seconds: i64,
    /// How often the scheduler runs the archive cycle.
    pub cycle_interval_s: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            age_seconds: 86_400,
            cycle_interval_s: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Reflect after this many interactions...
    pub interaction_threshold: u32,
    /// ...or after this many seconds, whichever comes first.
    pub interval_seconds: f64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            interaction_threshold: 10,
            interval_seconds: 1800.0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = KaitConfig::default();
        assert_eq!(cfg.ports.kaitd, 8787);
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.breaker.half_open_tests, 2);
        assert!((cfg.router.threshold - 0.11593).abs() < 1e-9);
        assert_eq!(cfg.observability.jsonl_backups, 3);
        assert_eq!(cfg.watchdog.max_restarts, 5);
        assert_eq!(cfg.watchdog.restart_window_s, 600);
        assert!(!cfg.litellm.enabled);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[router]
enabled = false
strong = "openai"
"#;
        let cfg: KaitConfig = toml::from_str(toml_str).unwrap();
        assert!(!cfg.router.enabled);
        assert_eq!(cfg.router.strong, "openai");
        // Defaults for unspecified fields
        assert_eq!(cfg.ports.pulse, 8765);
        assert_eq!(cfg.archive.age_seconds, 86_400);
    }

    #[test]
    fn test_parse_full_sections() {
        let toml_str = r#"
[ports]
kaitd = 9000
pulse = 9001

[ollama]
host = "llmbox"
port = 11500
model = "qwen2.5:14b"
olla_enabled = true
olla_port = 12000

[breaker]
failure_threshold = 5
recovery_timeout_s = 0.05

[watchdog]
plugin_only = true
max_restarts = 2
"#;
        let cfg: KaitConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.ports.kaitd, 9000);
        assert_eq!(cfg.ollama.model.as_deref(), Some("qwen2.5:14b"));
        assert!(cfg.ollama.base_url().contains("12000"));
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert!(cfg.watchdog.plugin_only);
    }

    #[test]
    fn test_ollama_base_url_toggle() {
        let mut cfg = OllamaConfig::default();
        assert_eq!(cfg.base_url(), "http://localhost:11434");
        cfg.olla_enabled = true;
        assert_eq!(cfg.base_url(), "http://localhost:11435");
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("KAIT_CB_FAILURE_THRESHOLD", "7");
        std::env::set_var("KAIT_ROUTER_THRESHOLD", "0.5");
        std::env::set_var("KAIT_PLUGIN_ONLY", "true");

        let mut cfg = KaitConfig::default();
        cfg.apply_env_overrides();

        assert_eq!(cfg.breaker.failure_threshold, 7);
        assert!((cfg.router.threshold - 0.5).abs() < 1e-9);
        assert!(cfg.watchdog.plugin_only);

        std::env::remove_var("KAIT_CB_FAILURE_THRESHOLD");
        std::env::remove_var("KAIT_ROUTER_THRESHOLD");
        std::env::remove_var("KAIT_PLUGIN_ONLY");
    }

    #[test]
    fn test_invalid_env_value_keeps_default() {
        std::env::set_var("KAIT_CB_HALF_OPEN_TESTS", "not-a-number");
        let mut cfg = KaitConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.breaker.half_open_tests, 2);
        std::env::remove_var("KAIT_CB_HALF_OPEN_TESTS");
    }
}
