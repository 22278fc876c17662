//! Wire types for the providers the tutor talks to: an OpenAI-compatible
//! chat-completions endpoint, a cloud speech-synthesis endpoint and the
//! rule-sheet search service.
pub mod chat;
pub mod search;
pub mod speech;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Role,
};
pub use search::{RuleSearchRequest, RuleSearchResponse};
pub use speech::{SpeechSynthesisRequest, SpeechSynthesisResponse};
