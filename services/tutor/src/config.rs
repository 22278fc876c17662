//! Application Configuration Module
//!
//! Loads the process-level configuration of the tutor from environment
//! variables. User-editable preferences live in `settings.json` instead, see
//! `rulebook_core::settings`.

use rulebook_core::search::DEFAULT_RULE_SEARCH_URL;
use rulebook_core::settings::{BuiltinProviders, DEFAULT_AI_BASE_URL};
use rulebook_core::speech::{CloudSpeechConfig, DEFAULT_TTS_ENDPOINT, DEFAULT_TTS_MODEL};
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Subdirectory of the platform data dir used when `TUTOR_DATA_DIR` is unset.
pub const DATA_DIR_NAME: &str = "rulebook-tutor";

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub ai_base_url: String,
    pub gemini_api_key: Option<SecretString>,
    pub claude_api_key: Option<SecretString>,
    pub tts_endpoint: String,
    pub tts_api_key: Option<SecretString>,
    pub tts_model: String,
    pub rule_search_url: String,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `TUTOR_DATA_DIR`: (Optional) Where games, messages and audio are kept. Defaults to the platform data dir.
    // *   `TUTOR_AI_BASE_URL`: (Optional) Base URL of the built-in chat providers.
    // *   `GEMINI_API_KEY` / `CLAUDE_API_KEY`: Keys for the built-in providers.
    // *   `TTS_ENDPOINT`, `TTS_API_KEY`, `TTS_MODEL`: (Optional) Cloud speech synthesis.
    // *   `RULE_SEARCH_URL`: (Optional) Rulebook search service.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secret = |key: &str| var(key).map(SecretString::from);

        let data_dir = match var("TUTOR_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join(DATA_DIR_NAME))
                .ok_or_else(|| {
                    ConfigError::MissingVar(
                        "TUTOR_DATA_DIR must be set when the platform has no data directory"
                            .to_string(),
                    )
                })?,
        };

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            data_dir,
            ai_base_url: var("TUTOR_AI_BASE_URL").unwrap_or_else(|| DEFAULT_AI_BASE_URL.to_string()),
            gemini_api_key: secret("GEMINI_API_KEY"),
            claude_api_key: secret("CLAUDE_API_KEY"),
            tts_endpoint: var("TTS_ENDPOINT").unwrap_or_else(|| DEFAULT_TTS_ENDPOINT.to_string()),
            tts_api_key: secret("TTS_API_KEY"),
            tts_model: var("TTS_MODEL").unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
            rule_search_url: var("RULE_SEARCH_URL")
                .unwrap_or_else(|| DEFAULT_RULE_SEARCH_URL.to_string()),
            log_level,
        })
    }

    pub fn builtin_providers(&self) -> BuiltinProviders {
        BuiltinProviders {
            base_url: self.ai_base_url.clone(),
            gemini_api_key: self.gemini_api_key.clone(),
            claude_api_key: self.claude_api_key.clone(),
        }
    }

    pub fn cloud_speech(&self) -> CloudSpeechConfig {
        CloudSpeechConfig {
            endpoint: self.tts_endpoint.clone(),
            api_key: self.tts_api_key.clone(),
            model: self.tts_model.clone(),
        }
    }
}
