use crate::conversation::RetentionPolicy;
use crate::llm::LlmSettings;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Model used when `GEMINI_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
/// API endpoint used when `GEMINI_BASE_URL` is not set.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Retention knobs for the in-memory conversation store. Both default to
/// off, matching the keep-everything behavior most deployments expect.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConversationConfig {
    /// Oldest exchanges beyond this many turns are dropped on append.
    pub max_turns: Option<usize>,
    /// Conversations idle longer than this are swept.
    pub idle_timeout_secs: Option<u64>,
}

impl ConversationConfig {
    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_turns: self.max_turns,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Load configuration with priority: CLI flag > environment > config
    /// file > defaults.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 8000)?
            .set_default("server.host", "0.0.0.0")?;

        // 2. Config file (explicit path is required to exist; the implicit
        //    ./config.{toml,yaml,...} lookup is not)
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // 3. Environment variables, e.g. WAYFINDER_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("WAYFINDER")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides (clap also maps PORT and CONFIG_FILE env vars
        //    onto these flags)
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

/// Load the hosted-model settings from the environment.
///
/// Only the API key is required; model and endpoint fall back to
/// [`DEFAULT_MODEL`] and [`DEFAULT_BASE_URL`].
pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| "Missing required env var: GEMINI_API_KEY".to_string())?;
    if api_key.trim().is_empty() {
        return Err("GEMINI_API_KEY cannot be empty".to_string());
    }

    let model = std::env::var("GEMINI_MODEL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let base_url = std::env::var("GEMINI_BASE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    Ok(LlmSettings {
        api_key,
        model,
        base_url,
    })
}
