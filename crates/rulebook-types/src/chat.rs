use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

/// A single entry of the `messages` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    role: Role,
    content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, text: &str) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.to_string()),
        }
    }

    pub fn system(text: &str) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: &str) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: &str) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn builder(role: Role) -> ChatMessageBuilder {
        ChatMessageBuilder::new(role)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }
}

/// Builds a message whose content mixes text and image blocks.
pub struct ChatMessageBuilder {
    role: Role,
    parts: Vec<ContentPart>,
}

impl ChatMessageBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            parts: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.parts.push(ContentPart::text(text));
        self
    }

    pub fn with_image_url(mut self, url: &str) -> Self {
        self.parts.push(ContentPart::image_url(url));
        self
    }

    pub fn build(self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: MessageContent::Parts(self.parts),
        }
    }
}

/// Either a plain string or a list of typed content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// The plain text of the content; for block content, the text blocks joined.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: &str) -> Self {
        ContentPart::Text {
            text: text.to_string(),
        }
    }

    pub fn image_url(url: &str) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// Body of `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatCompletionRequest {
    pub fn streaming(model: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: true,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// The text delta of the first choice, if any.
    pub fn delta_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_message_serializes_as_content_blocks() {
        let message = ChatMessage::builder(Role::User)
            .with_text("rules:")
            .with_image_url("data:image/jpeg;base64,AAAA")
            .build();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn text_message_serializes_as_plain_string() {
        let json = serde_json::to_value(ChatMessage::system("hello")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "hello"}));
    }

    #[test]
    fn chunk_delta_skips_empty_and_missing_content() {
        let chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"你好"}}]}"#).unwrap();
        assert_eq!(chunk.delta_text(), Some("你好"));

        let role_only: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(role_only.delta_text(), None);

        let empty: ChatCompletionChunk = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(empty.delta_text(), None);
    }

    #[test]
    fn request_omits_unset_temperature() {
        let request = ChatCompletionRequest::streaming("m", vec![ChatMessage::user("hi")]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert!(json.get("temperature").is_none());
    }
}
