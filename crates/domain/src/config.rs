use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregate configuration for the gateway binary. Loaded from `config.toml`
/// (if present) and layered with environment overrides in `Config::load`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl Config {
    /// Load from `path` if it exists, then apply env var overrides.
    /// Mirrors the teacher's "file defaults + env override" layering.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)
                .map_err(|e| crate::error::Error::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("CHATCORE_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(path) = std::env::var("CHATCORE_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CHATCORE_ATTACHMENTS_DIR") {
            self.store.attachments_dir = PathBuf::from(path);
        }
        if std::env::var("CHATCORE_REQUIRE_LLM")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
        {
            self.llm.startup_policy = LlmStartupPolicy::RequireOne;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3210")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_3210(),
            host: d_host(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

fn d_3210() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "d_attachments_dir")]
    pub attachments_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
            attachments_dir: d_attachments_dir(),
        }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("./data/chatcore.db")
}
fn d_attachments_dir() -> PathBuf {
    PathBuf::from("./data/attachments")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_20000u")]
    pub default_timeout_ms: u64,
    /// Startup policy for LLM providers (see [`LlmStartupPolicy`]).
    #[serde(default)]
    pub startup_policy: LlmStartupPolicy,
    /// Model roles: planner, executor, summarizer (+ custom).
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    /// Registered LLM providers (data-driven: adding a provider = adding config).
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: d_20000u(),
            startup_policy: LlmStartupPolicy::AllowNone,
            roles: HashMap::new(),
            providers: Vec::new(),
        }
    }
}

/// Controls how the gateway handles LLM provider initialization at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmStartupPolicy {
    /// Gateway boots even if no LLM providers initialize; chat endpoints
    /// return a structured error until credentials are configured.
    #[default]
    AllowNone,
    /// Abort startup if no LLM providers successfully initialize.
    RequireOne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Format: "provider_id/model_name"
    pub model: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Env var containing the key.
    #[serde(default)]
    pub env: Option<String>,
    /// Direct key (config-only setups; prefer `env`).
    #[serde(default)]
    pub key: Option<String>,
}

fn d_20000u() -> u64 {
    20_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle timeout in minutes before a lazily-held per-session resource
    /// (stream slot, file handle) is eligible for reclaim.
    #[serde(default = "d_idle_minutes")]
    pub idle_minutes: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_minutes: d_idle_minutes(),
        }
    }
}

fn d_idle_minutes() -> u32 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Enable automatic compaction once the transcript exceeds the token budget.
    #[serde(default = "d_true")]
    pub auto: bool,
    /// Token budget that triggers compaction (fraction of the active model's
    /// context window, computed by the caller; stored here as an absolute
    /// token count default used when no model-specific window is known).
    #[serde(default = "d_token_budget")]
    pub token_budget: usize,
    /// Percentage (0-100) of the budget that must be used before compaction
    /// triggers.
    #[serde(default = "d_trigger_pct")]
    pub trigger_percent: u8,
    /// Minimum number of most-recent messages kept verbatim after compaction.
    #[serde(default = "d_min_verbatim")]
    pub min_verbatim_messages: usize,
    /// Percentage (0-50) of the context window reserved for the verbatim
    /// tail, independent of `trigger_percent`. Runtime-overridable via the
    /// `compaction_verbatim_budget` setting.
    #[serde(default = "d_verbatim_pct")]
    pub verbatim_budget_percent: u8,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            token_budget: d_token_budget(),
            trigger_percent: d_trigger_pct(),
            min_verbatim_messages: d_min_verbatim(),
            verbatim_budget_percent: d_verbatim_pct(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_token_budget() -> usize {
    128_000
}
fn d_trigger_pct() -> u8 {
    80
}
fn d_min_verbatim() -> usize {
    2
}
fn d_verbatim_pct() -> u8 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Tool results longer than this many characters are collapsed to a
    /// placeholder plus a pointer the model can use to re-request detail.
    #[serde(default = "d_collapse_len")]
    pub large_result_collapse_chars: usize,
    /// Whether image content parts are forwarded to providers that declare
    /// vision support. When false, images are replaced with a text stub.
    #[serde(default = "d_true")]
    pub allow_images: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            large_result_collapse_chars: d_collapse_len(),
            allow_images: true,
        }
    }
}

fn d_collapse_len() -> usize {
    4000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Root directory the filesystem tool is sandboxed to.
    #[serde(default = "d_ws_path")]
    pub workspace_path: PathBuf,
    /// Maximum rounds of tool calls per turn before the tool loop aborts.
    #[serde(default = "d_max_rounds")]
    pub max_rounds: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace_path: d_ws_path(),
            max_rounds: d_max_rounds(),
        }
    }
}

fn d_ws_path() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_max_rounds() -> u32 {
    25
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime-mutable settings (seed values, persisted overrides live in the store)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Initial key/value seed applied on first boot when the store has no
    /// persisted settings row for a given key yet.
    #[serde(default)]
    pub seed: HashMap<String, serde_json::Value>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            seed: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_internally_consistent() {
        let config = Config::default();
        assert_eq!(config.server.port, 3210);
        assert_eq!(config.compaction.min_verbatim_messages, 2);
        assert_eq!(config.tools.max_rounds, 25);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = Config::load(std::path::Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn toml_roundtrip_parses_partial_overrides() {
        let raw = r#"
            [server]
            port = 9000

            [compaction]
            trigger_percent = 90
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.compaction.trigger_percent, 90);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
