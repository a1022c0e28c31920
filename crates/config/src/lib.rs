use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── LLM ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `lmstudio`, `ollama` or `openrouter`.
    pub provider: String,
    /// Base URL of the LM Studio server (OpenAI-compatible API).  Overridden
    /// at runtime by `LMSTUDIO_BASE_URL` when set.
    pub lmstudio_base_url: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub model: String,
    pub openrouter_model: String,
    /// Ollama model used for record embeddings.  Empty means the local
    /// feature-hashed embedding is used for every record.
    pub embedding_model: String,
    pub classify_temperature: f32,
    pub synthesis_temperature: f32,
    /// Bearer token for LM Studio.  `LMSTUDIO_API_TOKEN` takes precedence.
    pub api_token: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "lmstudio".to_string(),
            lmstudio_base_url: "http://localhost:1234".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            model: "qwen/qwen3-30b-a3b-2507".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            embedding_model: String::new(),
            classify_temperature: 0.3,
            synthesis_temperature: 0.7,
            api_token: String::new(),
        }
    }
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Root directory for the event log, insight log and weight snapshot.
    pub data_dir: String,
    /// Length of every record embedding.
    pub embedding_dim: usize,
    /// Re-appending a record id seen within this many seconds is reported as
    /// a replay (`DuplicateRecordError`).
    pub duplicate_window_secs: u64,
    /// Number of most recent turns passed to the scorer as context.
    pub scoring_context_turns: usize,
    /// Per-call limit for axis scoring on append.  Synthesis uses
    /// `dreaming.oracle_timeout_secs`.
    pub scoring_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: ".awareness".to_string(),
            embedding_dim: 64,
            duplicate_window_secs: 3600,
            scoring_context_turns: 3,
            scoring_timeout_secs: 20,
        }
    }
}

// ── Dreaming ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamingConfig {
    /// Unconsolidated record count at which an automatic cycle fires.
    pub memory_threshold: usize,
    /// Maximum records per consolidation batch.
    pub batch_limit: usize,
    /// Default `k` for similarity retrieval by collaborators.  Independent of
    /// `batch_limit`.
    pub retrieval_limit: usize,
    pub oracle_timeout_secs: u64,
    /// Run the threshold check on a timer while `awareness watch` is active.
    pub auto_trigger: bool,
    pub check_interval_minutes: u64,
    pub weight_learning_rate: f32,
    pub max_axis_bias: f32,
    pub mark_retry_initial_ms: u64,
    pub mark_retry_max_ms: u64,
}

impl Default for DreamingConfig {
    fn default() -> Self {
        Self {
            memory_threshold: 50,
            batch_limit: 50,
            retrieval_limit: 7,
            oracle_timeout_secs: 300,
            auto_trigger: false,
            check_interval_minutes: 30,
            weight_learning_rate: 0.25,
            max_axis_bias: 2.0,
            mark_retry_initial_ms: 200,
            mark_retry_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub dreaming: DreamingConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("LMSTUDIO_BASE_URL") {
            if !value.is_empty() {
                config.llm.lmstudio_base_url = value;
            }
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.provider = "ollama".to_string();
                config.llm.ollama_base_url = value;
            }
        }

        if let Ok(token) = env::var("LMSTUDIO_API_TOKEN") {
            if !token.is_empty() {
                config.llm.api_token = token;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.memory.data_dir)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn dreaming_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.dreaming.memory_threshold, 50);
        assert_eq!(cfg.dreaming.batch_limit, 50);
        assert_eq!(cfg.dreaming.retrieval_limit, 7);
        assert_eq!(cfg.dreaming.oracle_timeout_secs, 300);
        assert!(!cfg.dreaming.auto_trigger);
        assert_eq!(cfg.dreaming.check_interval_minutes, 30);
    }

    #[test]
    fn cosmetic_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "lmstudio");
        assert_eq!(cfg.llm.lmstudio_base_url, "http://localhost:1234");
        assert_eq!(cfg.memory.data_dir, ".awareness");
        assert_eq!(cfg.memory.embedding_dim, 64);
        assert_eq!(cfg.memory.scoring_timeout_secs, 20);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn data_dir_follows_config() {
        let mut cfg = AppConfig::default();
        cfg.memory.data_dir = "/var/lib/awareness".to_string();
        assert_eq!(cfg.data_dir(), PathBuf::from("/var/lib/awareness"));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.dreaming.memory_threshold, 50);
        assert_eq!(cfg.memory.duplicate_window_secs, 3600);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[llm]
model = "custom:7b"
synthesis_temperature = 0.9

[memory]
data_dir = "/tmp/aw"
embedding_dim = 128

[dreaming]
memory_threshold = 20
batch_limit = 10
auto_trigger = true
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.model, "custom:7b");
        assert!((cfg.llm.synthesis_temperature - 0.9).abs() < f32::EPSILON);
        assert_eq!(cfg.memory.data_dir, "/tmp/aw");
        assert_eq!(cfg.memory.embedding_dim, 128);
        assert_eq!(cfg.dreaming.memory_threshold, 20);
        assert_eq!(cfg.dreaming.batch_limit, 10);
        assert!(cfg.dreaming.auto_trigger);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.dreaming.retrieval_limit, 7);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn threshold_and_batch_limit_are_independent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[dreaming]\nmemory_threshold = 5\n").unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.dreaming.memory_threshold, 5);
        assert_eq!(cfg.dreaming.batch_limit, 50);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.model = "roundtrip-model".to_string();
        cfg.dreaming.memory_threshold = 12;
        cfg.dreaming.max_axis_bias = 1.5;
        cfg.save_to(&path).unwrap();
        assert!(path.exists(), "save_to creates parent directories");

        let reloaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.llm.model, "roundtrip-model");
        assert_eq!(reloaded.dreaming.memory_threshold, 12);
        assert!((reloaded.dreaming.max_axis_bias - 1.5).abs() < f32::EPSILON);
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_api_token_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.toml");
        fs::write(&path, "[llm]\napi_token = \"from-file\"\n").unwrap();

        // SAFETY: no other test reads or writes this variable.
        unsafe { env::set_var("LMSTUDIO_API_TOKEN", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.api_token, "from-env");
        unsafe { env::remove_var("LMSTUDIO_API_TOKEN") };
    }
}
