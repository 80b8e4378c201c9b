//! Runtime configuration for chat-relay.
//!
//! Configuration is assembled once at startup from an optional JSON file,
//! the environment and CLI flags (in increasing precedence), validated, and
//! then shared immutably with the request handlers. API keys are only ever
//! read from the environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";
pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("configuration missing: {var} must be set for the {provider} provider")]
    MissingApiKey {
        provider: ProviderKind,
        var: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "chat-relay", about = "Relay chat messages to an LLM provider as server-sent events")]
pub struct Cli {
    /// Path to an optional configuration file (JSON).
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Upstream provider to relay to.
    #[arg(long, value_enum, env = "RELAY_PROVIDER")]
    pub provider: Option<ProviderKind>,

    /// HTTP listen address.
    #[arg(long, env = "RELAY_LISTEN")]
    pub listen: Option<String>,

    /// Listen port on all interfaces; overrides the port of `--listen`.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory served as static content.
    #[arg(long, env = "RELAY_PUBLIC_DIR")]
    pub public_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Which provider handles `/chat`.
    pub provider: ProviderKind,

    /// Google Gemini settings.
    pub gemini: GeminiConfig,

    /// OpenAI-compatible endpoint settings.
    pub openai: OpenAiConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:3000").
    pub listen: String,

    /// Directory of static files served for `GET /`.
    pub public_dir: PathBuf,

    /// Upper bound on a whole upstream exchange, in seconds.
    pub request_timeout_secs: u64,

    /// Maximum accepted request body size (images arrive inline).
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            public_dir: PathBuf::from("public"),
            request_timeout_secs: 300,
            max_body_bytes: 10 * 1024 * 1024, // 10 MiB
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen address {:?}: {e}", self.listen)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,

    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            text_model: "gemini-pro".to_string(),
            vision_model: "gemini-pro-vision".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,

    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            text_model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o".to_string(),
            api_key: None,
        }
    }
}

/// Export the variables of a `.env` file into the process environment.
///
/// Variables already set in the environment win. Returns `false` when the
/// file does not exist. Must run before [`Cli`] is parsed so its `env`
/// fallbacks see the values.
pub fn load_dotenv(path: &Path) -> Result<bool, ConfigError> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Build the final configuration for a process: file, then environment,
    /// then CLI flags, then validation.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Pull secrets and endpoint overrides from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(GEMINI_API_KEY_VAR) {
            self.gemini.api_key = Some(key);
        }
        if let Some(key) = non_empty(OPENAI_API_KEY_VAR) {
            self.openai.api_key = Some(key);
        }
        if let Some(url) = non_empty("GEMINI_BASE_URL") {
            self.gemini.base_url = url;
        }
        if let Some(url) = non_empty("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(provider) = cli.provider {
            self.provider = provider;
        }
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(port) = cli.port {
            self.server.listen = format!("0.0.0.0:{port}");
        }
        if let Some(dir) = &cli.public_dir {
            self.server.public_dir = dir.clone();
        }
    }

    /// Refuse configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_key()?;
        self.server.listen_addr()?;
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// API key of the selected provider.
    pub fn api_key(&self) -> Result<&str, ConfigError> {
        let (key, var) = match self.provider {
            ProviderKind::Gemini => (&self.gemini.api_key, GEMINI_API_KEY_VAR),
            ProviderKind::OpenAi => (&self.openai.api_key, OPENAI_API_KEY_VAR),
        };
        key.as_deref().ok_or(ConfigError::MissingApiKey {
            provider: self.provider,
            var,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.provider, ProviderKind::Gemini);
        assert_eq!(cfg.server.listen, "0.0.0.0:3000");
        assert_eq!(cfg.gemini.text_model, "gemini-pro");
        assert_eq!(cfg.server.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let cfg = Config::default();
        match cfg.validate() {
            Err(ConfigError::MissingApiKey { var, .. }) => assert_eq!(var, GEMINI_API_KEY_VAR),
            other => panic!("expected MissingApiKey, got {other:?}"),
        }
    }

    #[test]
    fn test_only_selected_provider_key_required() {
        let mut cfg = Config {
            provider: ProviderKind::OpenAi,
            ..Config::default()
        };
        cfg.apply_env(env(&[(OPENAI_API_KEY_VAR, "sk-test")]));
        assert!(cfg.validate().is_ok());
        assert!(cfg.gemini.api_key.is_none());
    }

    #[test]
    fn test_blank_env_key_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[(GEMINI_API_KEY_VAR, "   ")]));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn test_port_overrides_listen() {
        let mut cfg = Config::default();
        let cli = Cli {
            listen: Some("127.0.0.1:9000".to_string()),
            port: Some(8081),
            ..Cli::default()
        };
        cfg.apply_cli(&cli);
        assert_eq!(cfg.server.listen, "0.0.0.0:8081");
        assert_eq!(cfg.server.listen_addr().unwrap().port(), 8081);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[(GEMINI_API_KEY_VAR, "key")]));
        cfg.server.request_timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"provider": "openai", "openai": {{"text_model": "local-llama"}}, "server": {{"request_timeout_secs": 30}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.provider, ProviderKind::OpenAi);
        assert_eq!(cfg.openai.text_model, "local-llama");
        assert_eq!(cfg.openai.vision_model, "gpt-4o");
        assert_eq!(cfg.server.request_timeout_secs, 30);
        assert_eq!(cfg.server.listen, "0.0.0.0:3000");
    }

    #[test]
    fn test_file_cannot_carry_api_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gemini": {{"api_key": "from-file"}}}}"#).unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.gemini.api_key.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/chat-relay.json")).unwrap();
        assert_eq!(cfg.server.max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_dotenv_values_reach_env_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "CHAT_RELAY_TEST_DOTENV_KEY=from-dotenv\n").unwrap();

        assert!(load_dotenv(&path).unwrap());
        assert_eq!(
            std::env::var("CHAT_RELAY_TEST_DOTENV_KEY").unwrap(),
            "from-dotenv"
        );
    }

    #[test]
    fn test_missing_dotenv_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!load_dotenv(&dir.path().join(".env")).unwrap());
    }

    #[test]
    fn test_malformed_dotenv_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "NOT A VALID LINE\n").unwrap();
        assert!(matches!(load_dotenv(&path), Err(ConfigError::DotEnv(_))));
    }
}
