//! Configuration
//!
//! `agent.yaml` under the root directory (default `~/.agents`) plus the
//! fixed on-disk layout: `did.json`, `.keys/signing.enc`, and
//! `memory/memories.db`. Identity markdown files live alongside but are
//! opaque to the core.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Config failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read or write the file.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    /// YAML did not parse.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// No home directory to place the default root in.
    #[error("could not resolve a home directory")]
    NoHome,
}

/// Agent metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMeta {
    /// Display name of the agent.
    pub name: String,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for AgentMeta {
    fn default() -> Self {
        Self {
            name: "signet-agent".to_string(),
            description: None,
        }
    }
}

/// Signing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Sign memory content on insert.
    pub sign_memories: bool,
    /// Sign computed Merkle roots.
    pub sign_roots: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            sign_memories: true,
            sign_roots: true,
        }
    }
}

/// External embedder selection. The provider itself lives outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name (e.g. "ollama", "openai", "none").
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Vector dimensionality.
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
        }
    }
}

/// Hybrid search weights and caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Weight of the vector score.
    pub alpha: f64,
    /// Candidates per source.
    pub top_k: usize,
    /// Score cutoff.
    pub min_score: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            top_k: 50,
            min_score: 0.1,
        }
    }
}

/// Memory store knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Database path relative to the root directory.
    pub database: PathBuf,
    /// Token budget per session for recall assembly.
    pub session_budget: usize,
    /// Strength decay rate per day.
    pub decay_rate: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("memory/memories.db"),
            session_budget: 8000,
            decay_rate: 0.03,
        }
    }
}

/// Federation daemon knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Listen address for inbound peers.
    pub listen: String,
    /// Keepalive ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Per-connection inbound message budget per minute.
    pub max_messages_per_minute: u32,
    /// Handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Reconnect attempt cap for outbound connections.
    pub max_reconnect_attempts: u32,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9470".to_string(),
            ping_interval_ms: 30_000,
            max_messages_per_minute: 120,
            handshake_timeout_ms: 15_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// The whole `agent.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent metadata.
    pub agent: AgentMeta,
    /// Pinned DID, once identity exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    /// Signing behavior.
    pub signing: SigningConfig,
    /// Harness integrations consuming the identity files.
    pub harnesses: Vec<String>,
    /// Embedder selection.
    pub embedding: EmbeddingConfig,
    /// Search weights.
    pub search: SearchConfig,
    /// Store knobs.
    pub memory: MemoryConfig,
    /// Federation knobs.
    pub federation: FederationConfig,
}

impl AgentConfig {
    /// Load from a YAML file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the config back out as YAML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Validate enumerated ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.search.alpha) {
            return Err(ConfigError::Invalid(format!(
                "search.alpha must be in [0, 1], got {}",
                self.search.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.search.min_score) {
            return Err(ConfigError::Invalid(format!(
                "search.min_score must be in [0, 1], got {}",
                self.search.min_score
            )));
        }
        if self.search.top_k == 0 {
            return Err(ConfigError::Invalid("search.top_k must be positive".to_string()));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be positive".to_string(),
            ));
        }
        if self.memory.decay_rate <= 0.0 {
            return Err(ConfigError::Invalid(
                "memory.decay_rate must be positive".to_string(),
            ));
        }
        if self.federation.max_messages_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "federation.max_messages_per_minute must be positive".to_string(),
            ));
        }
        if let Some(did) = &self.did {
            crate::identity::validate_did(did)
                .map_err(|e| ConfigError::Invalid(format!("did: {e}")))?;
        }
        Ok(())
    }
}

/// The on-disk layout rooted at the agent directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout at an explicit root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.agents`.
    pub fn default_root() -> Result<Self, ConfigError> {
        let home = directories::BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(Self::at(home.home_dir().join(".agents")))
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `agent.yaml` path.
    pub fn agent_yaml(&self) -> PathBuf {
        self.root.join("agent.yaml")
    }

    /// `did.json` path.
    pub fn did_json(&self) -> PathBuf {
        self.root.join("did.json")
    }

    /// Encrypted keypair file path.
    pub fn keys_file(&self) -> PathBuf {
        self.root.join(".keys").join("signing.enc")
    }

    /// Database path for a config.
    pub fn database(&self, config: &AgentConfig) -> PathBuf {
        if config.memory.database.is_absolute() {
            config.memory.database.clone()
        } else {
            self.root.join(&config.memory.database)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.search.alpha, 0.7);
        assert_eq!(config.embedding.dimensions, 768);
        assert_eq!(config.federation.max_messages_per_minute, 120);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::load(&dir.path().join("agent.yaml")).unwrap();
        assert_eq!(config.agent.name, "signet-agent");
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.yaml");

        let mut config = AgentConfig::default();
        config.agent.name = "test-agent".to_string();
        config.search.alpha = 0.5;
        config.harnesses = vec!["claude".to_string()];
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.agent.name, "test-agent");
        assert_eq!(loaded.search.alpha, 0.5);
        assert_eq!(loaded.harnesses, vec!["claude"]);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "agent:\n  name: partial\nsearch:\n  alpha: 0.4\n").unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.agent.name, "partial");
        assert_eq!(loaded.search.alpha, 0.4);
        // Everything else keeps defaults.
        assert_eq!(loaded.search.top_k, 50);
        assert_eq!(loaded.memory.decay_rate, 0.03);
    }

    #[test]
    fn out_of_range_alpha_is_rejected() {
        let config = AgentConfig {
            search: SearchConfig {
                alpha: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_did_is_rejected() {
        let config = AgentConfig {
            did: Some("did:web:nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn layout_paths_are_rooted() {
        let layout = Layout::at("/tmp/agents-root");
        assert_eq!(layout.agent_yaml(), PathBuf::from("/tmp/agents-root/agent.yaml"));
        assert_eq!(
            layout.keys_file(),
            PathBuf::from("/tmp/agents-root/.keys/signing.enc")
        );
        let config = AgentConfig::default();
        assert_eq!(
            layout.database(&config),
            PathBuf::from("/tmp/agents-root/memory/memories.db")
        );
    }
}
