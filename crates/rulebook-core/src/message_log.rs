//! Ordered conversation log of one session.

use crate::audio::PlayableAudio;
use rulebook_types::Role;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type MessageId = u64;

/// A turn as it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Cloud audio was generated for this turn and can be fetched from the store.
    #[serde(default)]
    pub has_audio: bool,
}

impl Message {
    pub fn user(id: MessageId, content: &str) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.to_string(),
            has_audio: false,
        }
    }

    /// An assistant turn starts empty and fills in as the reply streams.
    pub fn assistant(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            has_audio: false,
        }
    }
}

/// A turn plus the in-memory playable audio, which is never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMessage {
    pub message: Message,
    pub audio: Option<PlayableAudio>,
}

impl From<Message> for LoggedMessage {
    fn from(message: Message) -> Self {
        Self {
            message,
            audio: None,
        }
    }
}

/// One role/content pair of the conversation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

impl ContextTurn {
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }
}

/// Issues millisecond-based ids that strictly increase within the process,
/// even when two turns are created in the same millisecond.
#[derive(Debug, Default)]
pub struct MessageIdGen {
    last: AtomicU64,
}

impl MessageIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> MessageId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    /// Makes sure future ids sort after `id`, e.g. after loading a saved log.
    pub fn observe(&self, id: MessageId) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<LoggedMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(messages: Vec<Message>) -> Self {
        Self {
            entries: messages.into_iter().map(LoggedMessage::from).collect(),
        }
    }

    pub fn append(&mut self, message: Message) {
        self.entries.push(message.into());
    }

    /// Replaces the content of the final entry. Returns `false` (and changes
    /// nothing) unless `id` is the final entry and it is an assistant turn.
    pub fn update_last(&mut self, id: MessageId, content: &str) -> bool {
        match self.entries.last_mut() {
            Some(last) if last.message.id == id && last.message.role == Role::Assistant => {
                last.message.content.clear();
                last.message.content.push_str(content);
                true
            }
            _ => false,
        }
    }

    /// Empties the log, returning the ids that were removed.
    pub fn clear(&mut self) -> Vec<MessageId> {
        self.entries
            .drain(..)
            .map(|entry| entry.message.id)
            .collect()
    }

    /// The persistable form: transient audio dropped, `has_audio` kept.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|entry| {
                let mut message = entry.message.clone();
                message.has_audio = message.has_audio || entry.audio.is_some();
                message
            })
            .collect()
    }

    pub fn context(&self) -> Vec<ContextTurn> {
        self.entries
            .iter()
            .map(|entry| ContextTurn {
                role: entry.message.role,
                content: entry.message.content.clone(),
            })
            .collect()
    }

    pub fn get(&self, id: MessageId) -> Option<&LoggedMessage> {
        self.entries.iter().find(|entry| entry.message.id == id)
    }

    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut LoggedMessage> {
        self.entries.iter_mut().find(|entry| entry.message.id == id)
    }

    pub fn last(&self) -> Option<&LoggedMessage> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoggedMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn append_preserves_order() {
        let mut log = MessageLog::new();
        log.append(Message::user(1, "怎么赢？"));
        log.append(Message::assistant(2));

        let ids: Vec<_> = log.iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn update_last_replaces_content_only() {
        let mut log = MessageLog::new();
        log.append(Message::user(1, "继续"));
        log.append(Message::assistant(2));

        assert!(log.update_last(2, "第一"));
        assert!(log.update_last(2, "第一步"));

        let last = &log.last().unwrap().message;
        assert_eq!(last.id, 2);
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "第一步");
    }

    #[test]
    fn update_last_ignores_stale_or_user_targets() {
        let mut log = MessageLog::new();
        log.append(Message::assistant(1));
        log.append(Message::user(2, "没懂"));

        assert!(!log.update_last(1, "late fragment"));
        assert!(!log.update_last(2, "rewrite the user"));
        assert_eq!(log.get(1).unwrap().message.content, "");
        assert_eq!(log.get(2).unwrap().message.content, "没懂");
    }

    #[test]
    fn snapshot_strips_audio_but_keeps_the_flag() {
        let mut log = MessageLog::new();
        log.append(Message::assistant(7));
        log.append(Message::assistant(8));
        log.get_mut(7).unwrap().audio = Some(PlayableAudio::Cached(Bytes::from_static(b"RIFF")));

        let snapshot = log.snapshot();
        assert!(snapshot[0].has_audio);
        assert!(!snapshot[1].has_audio);

        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 7, "role": "assistant", "content": "", "hasAudio": true})
        );
    }

    #[test]
    fn persisted_messages_without_flag_still_load() {
        let message: Message =
            serde_json::from_str(r#"{"id": 3, "role": "user", "content": "hi"}"#).unwrap();
        assert!(!message.has_audio);
    }

    #[test]
    fn clear_returns_removed_ids() {
        let mut log = MessageLog::from_snapshot(vec![Message::user(1, "a"), Message::assistant(2)]);
        assert_eq!(log.clear(), vec![1, 2]);
        assert!(log.is_empty());
    }

    #[test]
    fn ids_strictly_increase_within_a_millisecond() {
        let ids = MessageIdGen::new();
        let generated: Vec<_> = (0..1000).map(|_| ids.next()).collect();
        assert!(generated.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn ids_sort_after_observed_ones() {
        let ids = MessageIdGen::new();
        let far_future = u64::MAX / 2;
        ids.observe(far_future);
        assert!(ids.next() > far_future);
    }
}
