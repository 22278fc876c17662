//! Turns session events into terminal output.

use rulebook_core::audio::AudioEvent;
use rulebook_core::lesson::LessonStage;
use rulebook_core::message_log::MessageId;
use rulebook_core::session::{MessageView, SessionEvent};
use rulebook_core::SendOutcome;
use rulebook_types::Role;
use std::collections::HashMap;

pub const TUTOR_LABEL: &str = "导师";
pub const USER_LABEL: &str = "你";

/// Tracks what has been printed per message so streamed replies are written
/// as deltas.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: HashMap<MessageId, String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &SessionEvent) -> Option<String> {
        match event {
            SessionEvent::MessageAppended(view) => match view.role {
                Role::Assistant => {
                    self.printed.insert(view.id, view.content.clone());
                    Some(format!("\n{TUTOR_LABEL}: {}", view.content))
                }
                _ => Some(format!("\n{USER_LABEL}: {}\n", view.content)),
            },
            SessionEvent::MessageUpdated { id, content } => {
                let printed = self.printed.entry(*id).or_default();
                let text = match content.strip_prefix(printed.as_str()) {
                    Some(delta) => delta.to_string(),
                    None => format!("\n{TUTOR_LABEL}: {content}"),
                };
                *printed = content.clone();
                (!text.is_empty()).then_some(text)
            }
            SessionEvent::TurnFinished { outcome, .. } => match outcome {
                SendOutcome::Completed | SendOutcome::Failed => Some("\n".to_string()),
                _ => None,
            },
            SessionEvent::MessagesCleared => {
                self.printed.clear();
                Some("(对话已清空)\n".to_string())
            }
            SessionEvent::Audio(AudioEvent::GenerationStarted(_)) => {
                Some("[正在生成语音…]\n".to_string())
            }
            SessionEvent::Audio(AudioEvent::PlaybackStarted(_)) => {
                Some("[正在朗读，输入 /stop 停止]\n".to_string())
            }
            SessionEvent::Audio(_) => None,
            SessionEvent::Notice(text) => Some(format!("\n{text}\n")),
        }
    }
}

/// The lesson plan the tutor follows, one numbered stage per line.
pub fn format_stages() -> String {
    LessonStage::ALL
        .iter()
        .enumerate()
        .map(|(i, stage)| format!("{:>3}. {}", i + 1, stage.label()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The whole conversation, numbered for `/play`.
pub fn format_messages(messages: &[MessageView]) -> String {
    if messages.is_empty() {
        return "(暂无对话)".to_string();
    }
    messages
        .iter()
        .enumerate()
        .map(|(i, message)| {
            let label = match message.role {
                Role::Assistant => TUTOR_LABEL,
                _ => USER_LABEL,
            };
            let marker = if message.is_audio_playing {
                " [朗读中]"
            } else if message.is_audio_generating {
                " [生成中]"
            } else if message.has_audio {
                " [有语音]"
            } else {
                ""
            };
            format!("{:>3}. {}{}: {}", i + 1, label, marker, message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
