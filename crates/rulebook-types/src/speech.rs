use serde::{Deserialize, Serialize};

/// Body of the cloud synthesis call.
///
/// ```json
/// {"model": "...", "input": {"text": "...", "voice": "Cherry", "language_type": "Chinese"},
///  "parameters": {"format": "wav"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechSynthesisRequest {
    pub model: String,
    pub input: SpeechInput,
    pub parameters: SpeechParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechInput {
    pub text: String,
    pub voice: String,
    pub language_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechParameters {
    pub format: String,
}

impl SpeechSynthesisRequest {
    pub fn new(model: &str, text: &str, voice: &str, language_type: &str, format: &str) -> Self {
        Self {
            model: model.to_string(),
            input: SpeechInput {
                text: text.to_string(),
                voice: voice.to_string(),
                language_type: language_type.to_string(),
            },
            parameters: SpeechParameters {
                format: format.to_string(),
            },
        }
    }
}

/// Response of the cloud synthesis call. The rendered file is reported either
/// at `output.audio.url` or directly at `output.url`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechSynthesisResponse {
    #[serde(default)]
    pub output: Option<SpeechOutput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechOutput {
    #[serde(default)]
    pub audio: Option<SpeechAudio>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechAudio {
    #[serde(default)]
    pub url: Option<String>,
}

impl SpeechSynthesisResponse {
    pub fn audio_url(&self) -> Option<&str> {
        let output = self.output.as_ref()?;
        output
            .audio
            .as_ref()
            .and_then(|audio| audio.url.as_deref())
            .or(output.url.as_deref())
            .filter(|url| !url.is_empty())
    }
}
