//! User settings: provider choice, speech backend, voice, auto-play and rate.
//!
//! Settings are merged field by field over the defaults on load, so files
//! written by older versions keep working when new fields appear.

use crate::error::{Result, TutorError};
use crate::json_file::JsonFile;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

pub const DEFAULT_AI_BASE_URL: &str = "https://yunwu.zeabur.app/v1";
pub const GEMINI_MODEL: &str = "gemini-3-flash-preview";
pub const CLAUDE_MODEL: &str = "claude-haiku-4-5-20251001";
pub const ALLOWED_SPEECH_RATES: [f32; 5] = [1.0, 1.25, 1.5, 1.75, 2.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    Gemini,
    Claude,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeechEngine {
    #[default]
    #[serde(rename = "cloud", alias = "aliyun")]
    Cloud,
    #[serde(rename = "local", alias = "browser")]
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Cherry,
    Ethan,
    Dylan,
    Nofish,
}

impl Voice {
    pub const ALL: [Voice; 4] = [Voice::Cherry, Voice::Ethan, Voice::Dylan, Voice::Nofish];

    /// The capitalised identifier the synthesis service expects.
    pub fn wire_name(self) -> &'static str {
        match self {
            Voice::Cherry => "Cherry",
            Voice::Ethan => "Ethan",
            Voice::Dylan => "Dylan",
            Voice::Nofish => "Nofish",
        }
    }
}

impl std::str::FromStr for Voice {
    type Err = TutorError;

    fn from_str(s: &str) -> Result<Self> {
        Voice::ALL
            .into_iter()
            .find(|voice| voice.wire_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TutorError::InvalidSetting(format!("unknown voice {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiSettings {
    pub model_type: AiProvider,
    pub custom_base_url: String,
    pub custom_api_key: String,
    pub custom_model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TtsSettings {
    pub engine: SpeechEngine,
    #[serde(alias = "aliyunVoice")]
    pub voice: Voice,
    pub auto_play: bool,
    #[serde(deserialize_with = "nearest_allowed_rate")]
    pub speech_rate: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            engine: SpeechEngine::Cloud,
            voice: Voice::Cherry,
            auto_play: true,
            speech_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ai: AiSettings,
    pub tts: TtsSettings,
}

fn nearest_allowed_rate<'de, D>(deserializer: D) -> std::result::Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    let rate = f32::deserialize(deserializer)?;
    Ok(snap_speech_rate(rate))
}

/// The allowed rate closest to `rate`.
pub fn snap_speech_rate(rate: f32) -> f32 {
    if !rate.is_finite() {
        return 1.0;
    }
    ALLOWED_SPEECH_RATES
        .into_iter()
        .min_by(|a, b| (a - rate).abs().total_cmp(&(b - rate).abs()))
        .unwrap_or(1.0)
}

fn validate_speech_rate(rate: f32) -> Result<f32> {
    if ALLOWED_SPEECH_RATES.contains(&rate) {
        Ok(rate)
    } else {
        Err(TutorError::InvalidSetting(format!(
            "speech rate {rate} is not one of {ALLOWED_SPEECH_RATES:?}"
        )))
    }
}

/// API keys of the built-in providers, supplied by the process environment.
#[derive(Debug, Clone)]
pub struct BuiltinProviders {
    pub base_url: String,
    pub gemini_api_key: Option<SecretString>,
    pub claude_api_key: Option<SecretString>,
}

impl Default for BuiltinProviders {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_AI_BASE_URL.to_string(),
            gemini_api_key: None,
            claude_api_key: None,
        }
    }
}

/// A resolved chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct AiEndpoint {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
}

impl AiSettings {
    pub fn resolve(&self, builtins: &BuiltinProviders) -> AiEndpoint {
        match self.model_type {
            AiProvider::Gemini => AiEndpoint {
                base_url: builtins.base_url.clone(),
                api_key: builtins.gemini_api_key.clone(),
                model: GEMINI_MODEL.to_string(),
            },
            AiProvider::Claude => AiEndpoint {
                base_url: builtins.base_url.clone(),
                api_key: builtins.claude_api_key.clone(),
                model: CLAUDE_MODEL.to_string(),
            },
            AiProvider::Custom => AiEndpoint {
                base_url: self.custom_base_url.clone(),
                api_key: (!self.custom_api_key.is_empty())
                    .then(|| SecretString::from(self.custom_api_key.clone())),
                model: self.custom_model_name.clone(),
            },
        }
    }
}

/// Settings held in memory and written through to `settings.json` on every
/// change.
pub struct SettingsStore {
    file: Option<JsonFile<Settings>>,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads `path`, falling back to defaults if it is missing or unreadable.
    pub async fn open(path: PathBuf) -> Self {
        let file = JsonFile::new(path);
        let current = match file.load().await {
            Ok(Some(settings)) => settings,
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable settings at {:?}: {}", file.path(), e);
                Settings::default()
            }
        };
        Self {
            file: Some(file),
            current: RwLock::new(current),
        }
    }

    /// Settings that live only as long as the process.
    pub fn ephemeral(settings: Settings) -> Self {
        Self {
            file: None,
            current: RwLock::new(settings),
        }
    }

    pub async fn snapshot(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn set_provider(&self, provider: AiProvider) -> Result<()> {
        self.update(|s| s.ai.model_type = provider).await
    }

    pub async fn set_custom_provider(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> Result<()> {
        self.update(|s| {
            s.ai.custom_base_url = base_url.trim().to_string();
            s.ai.custom_api_key = api_key.trim().to_string();
            s.ai.custom_model_name = model.trim().to_string();
        })
        .await
    }

    pub async fn set_engine(&self, engine: SpeechEngine) -> Result<()> {
        self.update(|s| s.tts.engine = engine).await
    }

    pub async fn set_voice(&self, voice: Voice) -> Result<()> {
        self.update(|s| s.tts.voice = voice).await
    }

    pub async fn set_auto_play(&self, auto_play: bool) -> Result<()> {
        self.update(|s| s.tts.auto_play = auto_play).await
    }

    pub async fn set_speech_rate(&self, rate: f32) -> Result<()> {
        let rate = validate_speech_rate(rate)?;
        self.update(|s| s.tts.speech_rate = rate).await
    }

    async fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut current = self.current.write().await;
        change(&mut current);
        if let Some(file) = &self.file {
            file.save(&current).await?;
        }
        tracing::debug!("Settings updated: {:?}", *current);
        Ok(())
    }
}
