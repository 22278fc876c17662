//! Speech synthesis backends.

use crate::error::{Result, TutorError};
use crate::settings::{SpeechEngine, TtsSettings, Voice};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use rulebook_types::{SpeechSynthesisRequest, SpeechSynthesisResponse};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTS_ENDPOINT: &str = "https://tts-service-mzftnveise.cn-chengdu.fcapp.run/tts";
pub const DEFAULT_TTS_MODEL: &str = "qwen3-tts-flash";
const LANGUAGE_TYPE: &str = "Chinese";
const AUDIO_FORMAT: &str = "wav";

/// What to play for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechClip {
    /// A rendered file at a remote URL.
    CloudAudio(String),
    /// Text for the on-device engine; leaves no artifact behind.
    LocalUtterance(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Voice,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudSpeech: Send + Sync {
    /// Renders `request` and returns the URL of the audio file.
    async fn synthesize(&self, request: &SpeechRequest) -> Result<String>;

    async fn download(&self, url: &str) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
pub struct CloudSpeechConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
}

impl Default for CloudSpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_TTS_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_TTS_MODEL.to_string(),
        }
    }
}

pub struct CloudSpeechClient {
    client: Client,
    config: CloudSpeechConfig,
}

impl CloudSpeechClient {
    pub fn new(config: CloudSpeechConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CloudSpeech for CloudSpeechClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<String> {
        let body = SpeechSynthesisRequest::new(
            &self.config.model,
            &request.text,
            request.voice.wire_name(),
            LANGUAGE_TYPE,
            AUDIO_FORMAT,
        );

        let mut http = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key.expose_secret());
        }
        let response = http.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TutorError::Synthesis(format!("{status}: {text}")));
        }

        let raw = response.text().await?;
        let parsed: SpeechSynthesisResponse = serde_json::from_str(&raw)
            .map_err(|e| TutorError::Synthesis(format!("unreadable response: {e}")))?;
        parsed
            .audio_url()
            .map(str::to_string)
            .ok_or_else(|| TutorError::Synthesis(format!("no audio URL in response: {raw}")))
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }
}

/// Picks the backend per request from the current settings.
pub struct SpeechGenerator {
    cloud: Arc<dyn CloudSpeech>,
}

impl SpeechGenerator {
    pub fn new(cloud: Arc<dyn CloudSpeech>) -> Self {
        Self { cloud }
    }

    pub fn cloud(&self) -> &Arc<dyn CloudSpeech> {
        &self.cloud
    }

    /// Never fails: a broken cloud call degrades to local speech.
    pub async fn generate(&self, text: &str, tts: &TtsSettings) -> SpeechClip {
        match tts.engine {
            SpeechEngine::Local => SpeechClip::LocalUtterance(text.to_string()),
            SpeechEngine::Cloud => {
                let request = SpeechRequest {
                    text: text.to_string(),
                    voice: tts.voice,
                };
                match self.cloud.synthesize(&request).await {
                    Ok(url) => SpeechClip::CloudAudio(url),
                    Err(e) => {
                        tracing::warn!("Cloud synthesis failed, falling back to local speech: {}", e);
                        SpeechClip::LocalUtterance(text.to_string())
                    }
                }
            }
        }
    }
}
