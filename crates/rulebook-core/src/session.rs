//! The explanation session: one game's rules, conversation and audio.
//!
//! Turns are processed one at a time behind a busy flag. Every await point
//! re-checks that the session is still the one that started the work; a
//! session that was torn down or reloaded meanwhile drops the result.

use crate::audio::{AudioEvent, AudioEventSink, AudioManager, AudioPlayer, AudioSource, LocalSpeech, PlayableAudio};
use crate::chat::ChatCompletion;
use crate::error::{Result, TutorError};
use crate::ingest::{RuleContent, RulebookParser, ingest};
use crate::lesson::{APOLOGY, LessonTrigger, welcome_notice};
use crate::message_log::{ContextTurn, Message, MessageId, MessageIdGen, MessageLog};
use crate::roster::SessionRoster;
use crate::settings::{SettingsStore, TtsSettings};
use crate::speech::{CloudSpeech, SpeechClip, SpeechGenerator};
use crate::store::RulebookStore;
use futures::StreamExt;
use rulebook_types::Role;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Shown when no on-device speech engine is installed.
pub const LOCAL_SPEECH_UNAVAILABLE: &str = "当前设备不支持语音朗读";
/// Prefix of the notice shown when a clip stops on an error.
pub const PLAYBACK_FAILED: &str = "语音播放失败";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply streamed to its end.
    Completed,
    /// The completion failed and the reply was replaced by an apology.
    Failed,
    /// Another turn is still streaming; nothing was sent.
    Busy,
    /// No rulebook content is loaded; nothing was sent.
    NoContent,
    /// The session was torn down or replaced while the turn ran.
    Inactive,
}

/// A message as the UI shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub has_audio: bool,
    pub is_audio_playing: bool,
    pub is_audio_generating: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessageAppended(MessageView),
    MessageUpdated { id: MessageId, content: String },
    TurnFinished { id: MessageId, outcome: SendOutcome },
    MessagesCleared,
    Audio(AudioEvent),
    Notice(String),
}

/// Collaborators of a session.
pub struct SessionDeps {
    pub store: Arc<dyn RulebookStore>,
    pub roster: Arc<SessionRoster>,
    pub settings: Arc<SettingsStore>,
    pub parser: Arc<dyn RulebookParser>,
    pub chat: Arc<dyn ChatCompletion>,
    pub cloud_speech: Arc<dyn CloudSpeech>,
    pub player: Arc<dyn AudioPlayer>,
    pub local_speech: Arc<dyn LocalSpeech>,
}

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    name: String,
    rules: Option<RuleContent>,
    log: MessageLog,
}

/// Resets the busy flag when a turn ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ExplanationSession {
    store: Arc<dyn RulebookStore>,
    roster: Arc<SessionRoster>,
    settings: Arc<SettingsStore>,
    parser: Arc<dyn RulebookParser>,
    chat: Arc<dyn ChatCompletion>,
    speech: SpeechGenerator,
    audio: AudioManager,
    ids: MessageIdGen,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    active: AtomicBool,
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ExplanationSession {
    pub fn new(deps: SessionDeps) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let audio_events = events.clone();
        let sink: AudioEventSink = Arc::new(move |event| {
            let notice = match &event {
                AudioEvent::PlaybackFailed(_, reason) => Some(format!("{PLAYBACK_FAILED}：{reason}")),
                _ => None,
            };
            let _ = audio_events.send(SessionEvent::Audio(event));
            if let Some(notice) = notice {
                let _ = audio_events.send(SessionEvent::Notice(notice));
            }
        });

        let session = Arc::new(Self {
            store: deps.store,
            roster: deps.roster,
            settings: deps.settings,
            parser: deps.parser,
            chat: deps.chat,
            speech: SpeechGenerator::new(deps.cloud_speech),
            audio: AudioManager::new(deps.player, deps.local_speech, sink),
            ids: MessageIdGen::new(),
            state: Mutex::new(SessionState::default()),
            busy: AtomicBool::new(false),
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            events,
        });
        (session, receiver)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // A closed receiver only means nobody is watching any more.
        let _ = self.events.send(event);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Opens a session: looks it up in the roster, ingests its rulebook and
    /// restores its conversation.
    pub async fn load(&self, session_id: &str) -> Result<()> {
        let meta = self
            .roster
            .get(session_id)
            .await
            .ok_or_else(|| TutorError::SessionNotFound(session_id.to_string()))?;

        self.audio.reset();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(true, Ordering::SeqCst);
        {
            let mut state = self.state();
            *state = SessionState {
                session_id: Some(meta.id.clone()),
                name: meta.name.clone(),
                ..SessionState::default()
            };
        }

        if let Err(e) = self.roster.touch(session_id).await {
            tracing::warn!("Could not update last-active time of {}: {}", session_id, e);
        }

        let rules = match self.store.get_document(session_id).await? {
            Some(document) => Some(ingest(self.parser.clone(), document).await),
            None => {
                tracing::warn!("Session {} has no stored rulebook", session_id);
                None
            }
        };
        let saved = match self.store.get_messages(session_id).await {
            Ok(saved) => saved.unwrap_or_default(),
            Err(e) => {
                tracing::error!("Could not load messages of {}: {}", session_id, e);
                Vec::new()
            }
        };
        if !self.is_current(epoch) {
            return Ok(());
        }

        for message in &saved {
            self.ids.observe(message.id);
        }
        let empty = saved.is_empty();
        {
            let mut state = self.state();
            state.rules = rules;
            state.log = MessageLog::from_snapshot(saved);
        }
        tracing::info!("Loaded session {} ({:?})", meta.id, meta.name);

        if empty {
            self.emit(SessionEvent::Notice(welcome_notice(&meta.name)));
        }
        Ok(())
    }

    pub async fn send_trigger(&self, trigger: LessonTrigger) -> SendOutcome {
        self.send_message(trigger.utterance(), trigger.is_hidden(), trigger.forces_clear())
            .await
    }

    /// Sends one turn and streams the reply into the log.
    ///
    /// `hidden` turns reach the model but not the log. `force_clear` drops the
    /// whole history first.
    pub async fn send_message(&self, text: &str, hidden: bool, force_clear: bool) -> SendOutcome {
        if !self.active.load(Ordering::SeqCst) {
            return SendOutcome::Inactive;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let (session_id, rules) = {
            let state = self.state();
            match (&state.session_id, &state.rules) {
                (Some(id), Some(rules)) if rules.is_usable() => (id.clone(), rules.clone()),
                _ => return SendOutcome::NoContent,
            }
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Ignoring message while a reply is streaming");
            return SendOutcome::Busy;
        }
        let busy = BusyGuard(&self.busy);

        if force_clear {
            self.wipe_history(&session_id).await;
            if !self.is_current(epoch) {
                return SendOutcome::Inactive;
            }
        }

        let user_id = self.ids.next();
        let reply_id = self.ids.next();
        let context = {
            let mut state = self.state();
            let mut context = state.log.context();
            context.push(ContextTurn::user(text));
            if !hidden {
                state.log.append(Message::user(user_id, text));
            }
            state.log.append(Message::assistant(reply_id));
            context
        };
        if !hidden {
            self.emit(SessionEvent::MessageAppended(self.view_of(user_id)));
        }
        self.emit(SessionEvent::MessageAppended(self.view_of(reply_id)));

        let streamed = match self.chat.complete(&context, &rules).await {
            Ok(mut fragments) => {
                let mut full = String::new();
                let mut failure = None;
                while let Some(fragment) = fragments.next().await {
                    if !self.is_current(epoch) {
                        return SendOutcome::Inactive;
                    }
                    match fragment {
                        Ok(text) => {
                            full.push_str(&text);
                            self.state().log.update_last(reply_id, &full);
                            self.emit(SessionEvent::MessageUpdated {
                                id: reply_id,
                                content: full.clone(),
                            });
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(full),
                }
            }
            Err(e) => Err(e),
        };
        if !self.is_current(epoch) {
            return SendOutcome::Inactive;
        }

        let outcome = match streamed {
            Ok(reply) => {
                tracing::info!("Reply {} complete ({} chars)", reply_id, reply.chars().count());
                Ok(reply)
            }
            Err(e) => {
                tracing::error!("Failed to send message: {}", e);
                self.state().log.update_last(reply_id, APOLOGY);
                self.emit(SessionEvent::MessageUpdated {
                    id: reply_id,
                    content: APOLOGY.to_string(),
                });
                Err(e)
            }
        };
        self.persist(&session_id).await;

        let finished = if outcome.is_ok() {
            SendOutcome::Completed
        } else {
            SendOutcome::Failed
        };
        self.emit(SessionEvent::TurnFinished {
            id: reply_id,
            outcome: finished,
        });
        drop(busy);

        if let Ok(reply) = outcome {
            let auto_play = self.settings.snapshot().await.tts.auto_play;
            if auto_play && !reply.is_empty() {
                self.play_message_audio(reply_id).await;
            }
        }
        finished
    }

    /// Plays the audio of a message, generating it first if needed. Failures
    /// are logged and leave every audio flag cleared.
    pub async fn play_message_audio(&self, id: MessageId) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.audio.stop_all();

        if let Err(e) = self.prepare_and_play(id, epoch).await {
            tracing::error!("Audio playback failed for message {}: {}", id, e);
            self.audio.reset();
        }
    }

    async fn prepare_and_play(&self, id: MessageId, epoch: u64) -> Result<()> {
        let (session_id, text, has_audio, mut playable) = {
            let state = self.state();
            let entry = state
                .log
                .get(id)
                .ok_or_else(|| TutorError::Playback(format!("no message {id}")))?;
            (
                state.session_id.clone(),
                entry.message.content.clone(),
                entry.message.has_audio,
                entry.audio.clone(),
            )
        };
        let tts = self.settings.snapshot().await.tts;

        // Without a file player only the local engine can speak.
        let file_playback = self.audio.player_available();
        if !file_playback {
            playable = None;
        }
        if file_playback && playable.is_none() && has_audio {
            if let Some(bytes) = self.store.get_audio(id).await? {
                if !self.is_current(epoch) {
                    return Ok(());
                }
                let cached = PlayableAudio::Cached(bytes);
                self.remember_audio(id, cached.clone(), false);
                playable = Some(cached);
            }
        }

        let source = match playable {
            Some(audio) => AudioSource::File(audio),
            None => {
                self.audio.begin_generating(id);
                let generated = self.generate(id, &text, &tts, file_playback).await;
                self.audio.end_generating(id);
                let source = generated?;
                if !self.is_current(epoch) {
                    return Ok(());
                }
                if let (Some(session_id), AudioSource::File(_)) = (&session_id, &source) {
                    self.persist(session_id).await;
                }
                source
            }
        };

        if !self.is_current(epoch) {
            return Ok(());
        }
        self.audio.start(id, source, tts.speech_rate);
        Ok(())
    }

    /// Synthesizes speech for a message. Cloud audio is downloaded and cached
    /// in the store so replays skip synthesis. Without `file_playback` the
    /// cloud is skipped and the text goes straight to the local engine.
    async fn generate(
        &self,
        id: MessageId,
        text: &str,
        tts: &TtsSettings,
        file_playback: bool,
    ) -> Result<AudioSource> {
        let clip = if file_playback {
            self.speech.generate(text, tts).await
        } else {
            tracing::info!("No audio file player, speaking message {} locally", id);
            SpeechClip::LocalUtterance(text.to_string())
        };
        match clip {
            SpeechClip::CloudAudio(url) => {
                let (audio, saved) = match self.speech.cloud().download(&url).await {
                    Ok(bytes) => {
                        let saved = match self.store.put_audio(id, bytes.clone()).await {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::error!("Failed to save audio of message {}: {}", id, e);
                                false
                            }
                        };
                        (PlayableAudio::Cached(bytes), saved)
                    }
                    Err(e) => {
                        tracing::error!("Failed to download audio of message {}: {}", id, e);
                        (PlayableAudio::Remote(url), false)
                    }
                };
                self.remember_audio(id, audio.clone(), saved);
                Ok(AudioSource::File(audio))
            }
            SpeechClip::LocalUtterance(text) => {
                if !self.audio.local_available() {
                    self.emit(SessionEvent::Notice(LOCAL_SPEECH_UNAVAILABLE.to_string()));
                    return Err(TutorError::Unsupported("local speech synthesis".to_string()));
                }
                Ok(AudioSource::Utterance(text))
            }
        }
    }

    fn remember_audio(&self, id: MessageId, audio: PlayableAudio, saved: bool) {
        let mut state = self.state();
        if let Some(entry) = state.log.get_mut(id) {
            entry.audio = Some(audio);
            entry.message.has_audio |= saved;
        }
    }

    pub fn stop_audio(&self) {
        self.audio.stop_all();
    }

    /// Empties the conversation, in memory and in the store.
    pub async fn clear_messages(&self) {
        let session_id = self.state().session_id.clone();
        match session_id {
            Some(session_id) => self.wipe_history(&session_id).await,
            None => tracing::debug!("No session loaded, nothing to clear"),
        }
    }

    async fn wipe_history(&self, session_id: &str) {
        self.audio.stop_all();
        let removed = self.state().log.clear();
        self.emit(SessionEvent::MessagesCleared);

        if let Err(e) = self.store.put_messages(session_id, &[]).await {
            tracing::error!("Failed to save cleared history of {}: {}", session_id, e);
        }
        self.delete_audio(&removed).await;
    }

    async fn delete_audio(&self, ids: &[MessageId]) {
        for id in ids {
            if let Err(e) = self.store.delete_audio(*id).await {
                tracing::warn!("Failed to delete audio of message {}: {}", id, e);
            }
        }
    }

    /// Deletes the loaded session's rulebook, messages and audio, then drops
    /// it from the roster. The roster entry goes last so it never points at
    /// data that is half gone.
    pub async fn delete_session(&self) -> Result<()> {
        let (session_id, ids) = {
            let state = self.state();
            let session_id = state
                .session_id
                .clone()
                .ok_or_else(|| TutorError::SessionNotFound("no session loaded".to_string()))?;
            let ids: Vec<MessageId> = state.log.iter().map(|e| e.message.id).collect();
            (session_id, ids)
        };

        self.audio.stop_all();
        self.store.delete_document(&session_id).await?;
        self.store.delete_messages(&session_id).await?;
        self.delete_audio(&ids).await;
        self.roster.remove(&session_id).await?;

        self.teardown();
        *self.state() = SessionState::default();
        tracing::info!("Deleted session {}", session_id);
        Ok(())
    }

    /// Renames the loaded session. Blank names are ignored.
    pub async fn rename_session(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        let Some(session_id) = self.state().session_id.clone() else {
            return Err(TutorError::SessionNotFound("no session loaded".to_string()));
        };
        self.roster.rename(&session_id, name).await?;
        self.state().name = name.to_string();
        Ok(())
    }

    /// Marks the session inactive and silences audio. In-flight work drops
    /// its results when it next resumes.
    pub fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.audio.stop_all();
    }

    pub fn messages(&self) -> Vec<MessageView> {
        let playing = self.audio.playing();
        self.state()
            .log
            .iter()
            .map(|entry| {
                let id = entry.message.id;
                MessageView {
                    id,
                    role: entry.message.role,
                    content: entry.message.content.clone(),
                    has_audio: entry.message.has_audio || entry.audio.is_some(),
                    is_audio_playing: playing == Some(id),
                    is_audio_generating: self.audio.is_generating(id),
                }
            })
            .collect()
    }

    fn view_of(&self, id: MessageId) -> MessageView {
        self.messages()
            .into_iter()
            .find(|view| view.id == id)
            .unwrap_or(MessageView {
                id,
                role: Role::Assistant,
                content: String::new(),
                has_audio: false,
                is_audio_playing: false,
                is_audio_generating: false,
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn rule_content(&self) -> Option<RuleContent> {
        self.state().rules.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn session_name(&self) -> String {
        self.state().name.clone()
    }

    async fn persist(&self, session_id: &str) {
        let snapshot = self.state().log.snapshot();
        if let Err(e) = self.store.put_messages(session_id, &snapshot).await {
            tracing::error!("Failed to save messages of {}: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockAudioPlayer, MockLocalSpeech};
    use crate::chat::{FragmentStream, MockChatCompletion};
    use crate::ingest::{MockRulebookParser, SourceDocument};
    use crate::roster::SessionMeta;
    use crate::settings::{Settings, SpeechEngine};
    use crate::speech::MockCloudSpeech;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    const SESSION: &str = "s1";

    fn reply(fragments: &[&str]) -> FragmentStream {
        let items: Vec<Result<String>> = fragments.iter().map(|f| Ok(f.to_string())).collect();
        stream::iter(items).boxed()
    }

    fn legible_parser() -> MockRulebookParser {
        let mut parser = MockRulebookParser::new();
        parser
            .expect_page_texts()
            .returning(|_| Ok(vec!["每回合抽两张牌。".repeat(40)]));
        parser.expect_render_pages().never();
        parser
    }

    fn idle_player() -> MockAudioPlayer {
        let mut player = MockAudioPlayer::new();
        player.expect_stop().return_const(());
        player.expect_is_available().return_const(true);
        player
    }

    fn idle_local() -> MockLocalSpeech {
        let mut local = MockLocalSpeech::new();
        local.expect_cancel().return_const(());
        local.expect_is_available().return_const(true);
        local
    }

    fn quiet_tts() -> TtsSettings {
        TtsSettings {
            auto_play: false,
            ..TtsSettings::default()
        }
    }

    /// A player whose playback never ends on its own.
    struct EndlessPlayer;

    #[async_trait]
    impl AudioPlayer for EndlessPlayer {
        fn is_available(&self) -> bool {
            true
        }

        async fn play(&self, _audio: PlayableAudio, _rate: f32) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn stop(&self) {}
    }

    struct Harness {
        session: Arc<ExplanationSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        store: Arc<MemoryStore>,
        roster: Arc<SessionRoster>,
    }

    impl Harness {
        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    struct Setup {
        chat: MockChatCompletion,
        cloud: MockCloudSpeech,
        player: Arc<dyn AudioPlayer>,
        local: MockLocalSpeech,
        parser: MockRulebookParser,
        tts: TtsSettings,
        document: Option<SourceDocument>,
        history: Vec<Message>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                chat: MockChatCompletion::new(),
                cloud: MockCloudSpeech::new(),
                player: Arc::new(idle_player()),
                local: idle_local(),
                parser: legible_parser(),
                tts: quiet_tts(),
                document: Some(SourceDocument::Pdf(Bytes::from_static(b"%PDF"))),
                history: Vec::new(),
            }
        }
    }

    async fn loaded(setup: Setup) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let roster = Arc::new(SessionRoster::ephemeral());
        roster
            .add(SessionMeta::new(SESSION.into(), "卡坦岛".into()))
            .await
            .unwrap();
        if let Some(document) = &setup.document {
            store.put_document(SESSION, document).await.unwrap();
        }
        if !setup.history.is_empty() {
            store.put_messages(SESSION, &setup.history).await.unwrap();
        }

        let (session, events) = ExplanationSession::new(SessionDeps {
            store: store.clone(),
            roster: roster.clone(),
            settings: Arc::new(SettingsStore::ephemeral(Settings {
                tts: setup.tts,
                ..Settings::default()
            })),
            parser: Arc::new(setup.parser),
            chat: Arc::new(setup.chat),
            cloud_speech: Arc::new(setup.cloud),
            player: setup.player,
            local_speech: Arc::new(setup.local),
        });
        session.load(SESSION).await.unwrap();

        Harness {
            session,
            events,
            store,
            roster,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn history(len: u64) -> Vec<Message> {
        (1..=len)
            .map(|i| {
                if i % 2 == 1 {
                    Message::user(i, "继续")
                } else {
                    Message {
                        content: format!("第{i}段讲解"),
                        ..Message::assistant(i)
                    }
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn hidden_explain_streams_one_assistant_message() {
        // Arrange
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .withf(|context, rules| {
                context.len() == 1
                    && context[0] == ContextTurn::user("讲解规则")
                    && matches!(rules, RuleContent::Text { .. })
            })
            .returning(|_, _| Ok(reply(&["你好", "，我们开始吧"])))
            .times(1);
        let mut h = loaded(Setup {
            chat,
            ..Setup::default()
        })
        .await;
        h.drain_events();

        // Act
        let outcome = h.session.send_trigger(LessonTrigger::Explain).await;

        // Assert
        assert_eq!(outcome, SendOutcome::Completed);
        let messages = h.session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "你好，我们开始吧");

        let updates: Vec<String> = h
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::MessageUpdated { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec!["你好", "你好，我们开始吧"]);

        let persisted = h.store.get_messages(SESSION).await.unwrap().unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(!h.session.is_busy());
    }

    #[tokio::test]
    async fn visible_turns_are_logged_and_sent_with_history() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .withf(|context, _| {
                context.len() == 3 && context[2] == ContextTurn::user("没懂")
            })
            .returning(|_, _| Ok(reply(&["换个说法"])));
        let h = loaded(Setup {
            chat,
            history: history(2),
            ..Setup::default()
        })
        .await;

        let outcome = h.session.send_trigger(LessonTrigger::NotUnderstood).await;

        assert_eq!(outcome, SendOutcome::Completed);
        let messages = h.session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "没懂");
        assert!(messages[2].id < messages[3].id);
    }

    #[tokio::test]
    async fn restart_clears_history_before_the_new_turn() {
        // Arrange
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .withf(|context, _| context.len() == 1 && context[0] == ContextTurn::user("讲解规则"))
            .returning(|_, _| Ok(reply(&["重新开始"])))
            .times(1);
        let h = loaded(Setup {
            chat,
            history: history(10),
            ..Setup::default()
        })
        .await;
        h.store
            .put_audio(4, Bytes::from_static(b"RIFF"))
            .await
            .unwrap();
        assert_eq!(h.session.messages().len(), 10);

        // Act
        let outcome = h.session.send_trigger(LessonTrigger::Restart).await;

        // Assert
        assert_eq!(outcome, SendOutcome::Completed);
        let messages = h.session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "重新开始");
        assert_eq!(h.store.get_messages(SESSION).await.unwrap().unwrap().len(), 1);
        assert_eq!(h.store.get_audio(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_ignored() {
        // Arrange
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = gate.clone();
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .returning(move |_, _| {
                let gate = gate.clone();
                Ok(stream::once(async move {
                    gate.notified().await;
                    Ok("好的".to_string())
                })
                .boxed())
            })
            .times(1);
        let h = loaded(Setup {
            chat,
            ..Setup::default()
        })
        .await;

        let first = {
            let session = h.session.clone();
            tokio::spawn(async move { session.send_message("第一问", false, false).await })
        };
        let session = h.session.clone();
        wait_until(|| session.is_busy()).await;

        // Act
        let second = h.session.send_message("第二问", false, false).await;

        // Assert
        assert_eq!(second, SendOutcome::Busy);
        assert_eq!(h.session.messages().len(), 2);

        release.notify_one();
        assert_eq!(first.await.unwrap(), SendOutcome::Completed);
        assert!(!h.session.is_busy());
    }

    /// A reply that streams "部分" and then waits for the gate.
    fn stalled_chat(gate: Arc<tokio::sync::Notify>) -> MockChatCompletion {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .returning(move |_, _| {
                let gate = gate.clone();
                let head = stream::iter(vec![Ok("部分".to_string())]);
                let tail = stream::once(async move {
                    gate.notified().await;
                    Ok("其余".to_string())
                });
                Ok(head.chain(tail).boxed())
            })
            .times(1);
        chat
    }

    #[tokio::test]
    async fn teardown_mid_stream_drops_the_reply() {
        // Arrange
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = loaded(Setup {
            chat: stalled_chat(gate.clone()),
            ..Setup::default()
        })
        .await;
        let turn = {
            let session = h.session.clone();
            tokio::spawn(async move { session.send_message("怎么赢？", false, false).await })
        };
        let session = h.session.clone();
        wait_until(|| session.messages().last().is_some_and(|m| m.content == "部分")).await;

        // Act
        h.session.teardown();
        gate.notify_one();

        // Assert
        assert_eq!(turn.await.unwrap(), SendOutcome::Inactive);
        assert!(!h.session.is_busy());
        assert_eq!(h.store.get_messages(SESSION).await.unwrap(), None);
    }

    #[tokio::test]
    async fn switching_sessions_mid_stream_leaves_the_old_one_untouched() {
        // Arrange
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = loaded(Setup {
            chat: stalled_chat(gate.clone()),
            history: history(2),
            ..Setup::default()
        })
        .await;
        h.roster
            .add(SessionMeta::new("s2".into(), "璀璨宝石".into()))
            .await
            .unwrap();
        h.store
            .put_document("s2", &SourceDocument::Pdf(Bytes::from_static(b"%PDF")))
            .await
            .unwrap();
        let turn = {
            let session = h.session.clone();
            tokio::spawn(async move { session.send_message("然后呢？", false, false).await })
        };
        let session = h.session.clone();
        wait_until(|| session.is_busy()).await;

        // Act
        h.session.load("s2").await.unwrap();
        gate.notify_one();

        // Assert
        assert_eq!(turn.await.unwrap(), SendOutcome::Inactive);
        assert!(!h.session.is_busy());
        assert_eq!(h.session.session_id().as_deref(), Some("s2"));
        assert!(h.session.messages().is_empty());
        let saved = h.store.get_messages(SESSION).await.unwrap().unwrap();
        assert_eq!(saved, history(2));
        assert_eq!(h.store.get_messages("s2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_failure_leaves_only_the_apology() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete().returning(|_, _| {
            let items: Vec<Result<String>> = vec![
                Ok("部分内容".to_string()),
                Err(TutorError::Completion("connection reset".into())),
            ];
            Ok(stream::iter(items).boxed())
        });
        let h = loaded(Setup {
            chat,
            ..Setup::default()
        })
        .await;

        let outcome = h.session.send_message("怎么赢？", false, false).await;

        assert_eq!(outcome, SendOutcome::Failed);
        let messages = h.session.messages();
        assert_eq!(messages.last().unwrap().content, APOLOGY);
        assert!(!h.session.is_busy());
    }

    #[tokio::test]
    async fn request_failure_also_apologises() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .returning(|_, _| Err(TutorError::Completion("401".into())));
        let h = loaded(Setup {
            chat,
            ..Setup::default()
        })
        .await;

        let outcome = h.session.send_trigger(LessonTrigger::Continue).await;

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(h.session.messages().last().unwrap().content, APOLOGY);
    }

    #[tokio::test]
    async fn nothing_is_sent_without_rule_content() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete().never();
        let mut parser = MockRulebookParser::new();
        parser.expect_page_texts().never();
        let h = loaded(Setup {
            chat,
            parser,
            document: None,
            ..Setup::default()
        })
        .await;

        let outcome = h.session.send_trigger(LessonTrigger::Explain).await;

        assert_eq!(outcome, SendOutcome::NoContent);
        assert!(h.session.messages().is_empty());
    }

    #[tokio::test]
    async fn empty_session_greets_on_load() {
        let mut h = loaded(Setup::default()).await;
        let events = h.drain_events();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Notice(text) if text.contains("卡坦岛")
        )));
    }

    #[tokio::test]
    async fn torn_down_session_accepts_nothing() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete().never();
        let h = loaded(Setup {
            chat,
            ..Setup::default()
        })
        .await;

        h.session.teardown();

        assert_eq!(
            h.session.send_trigger(LessonTrigger::Explain).await,
            SendOutcome::Inactive
        );
    }

    #[tokio::test]
    async fn replay_of_cached_audio_reads_the_store() {
        // Arrange
        let mut cloud = MockCloudSpeech::new();
        cloud.expect_synthesize().never();
        let mut player = idle_player();
        player
            .expect_play()
            .withf(|audio, _| *audio == PlayableAudio::Cached(Bytes::from_static(b"RIFF-cached")))
            .returning(|_, _| Ok(()))
            .times(1);
        let mut spoken = history(2);
        spoken[1].has_audio = true;
        let h = loaded(Setup {
            cloud,
            player: Arc::new(player),
            history: spoken,
            ..Setup::default()
        })
        .await;
        h.store
            .put_audio(2, Bytes::from_static(b"RIFF-cached"))
            .await
            .unwrap();

        // Act
        h.session.play_message_audio(2).await;

        // Assert
        let session = h.session.clone();
        wait_until(|| session.messages().iter().all(|m| !m.is_audio_playing)).await;
    }

    #[tokio::test]
    async fn cloud_audio_is_cached_and_only_one_message_plays() {
        // Arrange
        let mut cloud = MockCloudSpeech::new();
        cloud
            .expect_synthesize()
            .returning(|request| Ok(format!("https://oss.example.com/{}.wav", request.text.len())));
        cloud
            .expect_download()
            .returning(|_| Ok(Bytes::from_static(b"RIFF-fresh")));
        let h = loaded(Setup {
            cloud,
            player: Arc::new(EndlessPlayer),
            tts: TtsSettings {
                engine: SpeechEngine::Cloud,
                ..quiet_tts()
            },
            history: history(4),
            ..Setup::default()
        })
        .await;

        // Act
        h.session.play_message_audio(2).await;
        h.session.play_message_audio(4).await;

        // Assert
        let playing: Vec<MessageId> = h
            .session
            .messages()
            .iter()
            .filter(|m| m.is_audio_playing)
            .map(|m| m.id)
            .collect();
        assert_eq!(playing, vec![4]);
        assert_eq!(
            h.store.get_audio(2).await.unwrap(),
            Some(Bytes::from_static(b"RIFF-fresh"))
        );
        let persisted = h.store.get_messages(SESSION).await.unwrap().unwrap();
        assert!(persisted[1].has_audio && persisted[3].has_audio);

        h.session.stop_audio();
        assert!(h.session.messages().iter().all(|m| !m.is_audio_playing));
    }

    #[tokio::test]
    async fn cloud_failure_speaks_locally_without_caching() {
        // Arrange
        let mut cloud = MockCloudSpeech::new();
        cloud
            .expect_synthesize()
            .returning(|_| Err(TutorError::Synthesis("quota".into())));
        cloud.expect_download().never();
        let mut local = idle_local();
        local
            .expect_speak()
            .withf(|text, rate| text.to_string() == "第2段讲解" && *rate == 1.0)
            .returning(|_, _| Ok(()))
            .times(1);
        let h = loaded(Setup {
            cloud,
            local,
            history: history(2),
            ..Setup::default()
        })
        .await;

        // Act
        h.session.play_message_audio(2).await;

        // Assert
        let session = h.session.clone();
        wait_until(|| session.messages().iter().all(|m| !m.is_audio_playing)).await;
        assert!(!h.session.messages()[1].has_audio);
        assert_eq!(h.store.get_audio(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_local_engine_is_reported_and_flags_reset() {
        let mut local = MockLocalSpeech::new();
        local.expect_cancel().return_const(());
        local.expect_is_available().return_const(false);
        local.expect_speak().never();
        let mut h = loaded(Setup {
            local,
            tts: TtsSettings {
                engine: SpeechEngine::Local,
                ..quiet_tts()
            },
            history: history(2),
            ..Setup::default()
        })
        .await;
        h.drain_events();

        h.session.play_message_audio(2).await;

        let events = h.drain_events();
        assert!(events.contains(&SessionEvent::Notice(LOCAL_SPEECH_UNAVAILABLE.to_string())));
        assert!(events.contains(&SessionEvent::Audio(AudioEvent::Reset)));
        let messages = h.session.messages();
        assert!(messages.iter().all(|m| !m.is_audio_playing && !m.is_audio_generating));
    }

    #[tokio::test]
    async fn failed_playback_is_reported_to_the_user() {
        // Arrange
        let mut cloud = MockCloudSpeech::new();
        cloud
            .expect_synthesize()
            .returning(|_| Ok("https://oss.example.com/2.wav".to_string()));
        cloud
            .expect_download()
            .returning(|_| Ok(Bytes::from_static(b"RIFF-fresh")));
        let mut player = idle_player();
        player
            .expect_play()
            .returning(|_, _| Err(TutorError::Unsupported("audio file playback".into())));
        let mut h = loaded(Setup {
            cloud,
            player: Arc::new(player),
            tts: TtsSettings {
                engine: SpeechEngine::Cloud,
                ..quiet_tts()
            },
            history: history(2),
            ..Setup::default()
        })
        .await;
        h.drain_events();

        // Act
        h.session.play_message_audio(2).await;
        let session = h.session.clone();
        wait_until(|| session.messages().iter().all(|m| !m.is_audio_playing)).await;

        // Assert
        let events = h.drain_events();
        assert!(!events.contains(&SessionEvent::Audio(AudioEvent::PlaybackFinished(2))));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Notice(text) if text.starts_with(PLAYBACK_FAILED)
        )));
    }

    #[tokio::test]
    async fn without_a_file_player_cloud_speech_is_skipped_for_local() {
        let mut cloud = MockCloudSpeech::new();
        cloud.expect_synthesize().never();
        cloud.expect_download().never();
        let mut player = MockAudioPlayer::new();
        player.expect_stop().return_const(());
        player.expect_is_available().return_const(false);
        player.expect_play().never();
        let mut local = idle_local();
        local
            .expect_speak()
            .withf(|text, _| text.to_string() == "第2段讲解")
            .returning(|_, _| Ok(()))
            .times(1);
        let mut spoken = history(2);
        spoken[1].has_audio = true;
        let h = loaded(Setup {
            cloud,
            player: Arc::new(player),
            local,
            tts: TtsSettings {
                engine: SpeechEngine::Cloud,
                ..quiet_tts()
            },
            history: spoken,
            ..Setup::default()
        })
        .await;

        h.session.play_message_audio(2).await;

        let session = h.session.clone();
        wait_until(|| session.messages().iter().all(|m| !m.is_audio_playing)).await;
        assert_eq!(h.store.get_audio(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn no_player_and_no_local_engine_is_reported() {
        let mut player = MockAudioPlayer::new();
        player.expect_stop().return_const(());
        player.expect_is_available().return_const(false);
        let mut local = MockLocalSpeech::new();
        local.expect_cancel().return_const(());
        local.expect_is_available().return_const(false);
        let mut h = loaded(Setup {
            player: Arc::new(player),
            local,
            history: history(2),
            ..Setup::default()
        })
        .await;
        h.drain_events();

        h.session.play_message_audio(2).await;

        let events = h.drain_events();
        assert!(events.contains(&SessionEvent::Notice(LOCAL_SPEECH_UNAVAILABLE.to_string())));
        assert!(h.session.messages().iter().all(|m| !m.is_audio_generating));
    }

    #[tokio::test]
    async fn auto_play_speaks_the_finished_reply() {
        let mut chat = MockChatCompletion::new();
        chat.expect_complete()
            .returning(|_, _| Ok(reply(&["先抽牌，", "再出牌。"])));
        let mut local = idle_local();
        local
            .expect_speak()
            .withf(|text, _| text.to_string() == "先抽牌，再出牌。")
            .returning(|_, _| Ok(()))
            .times(1);
        let h = loaded(Setup {
            chat,
            local,
            tts: TtsSettings {
                engine: SpeechEngine::Local,
                auto_play: true,
                ..TtsSettings::default()
            },
            ..Setup::default()
        })
        .await;

        let outcome = h.session.send_trigger(LessonTrigger::Continue).await;

        assert_eq!(outcome, SendOutcome::Completed);
        let session = h.session.clone();
        wait_until(|| session.messages().iter().all(|m| !m.is_audio_playing)).await;
    }

    #[tokio::test]
    async fn deleted_session_is_gone_everywhere() {
        // Arrange
        let mut spoken = history(2);
        spoken[1].has_audio = true;
        let h = loaded(Setup {
            history: spoken,
            ..Setup::default()
        })
        .await;
        h.store
            .put_audio(2, Bytes::from_static(b"RIFF"))
            .await
            .unwrap();

        // Act
        h.session.delete_session().await.unwrap();

        // Assert
        assert_eq!(h.store.get_document(SESSION).await.unwrap(), None);
        assert_eq!(h.store.get_messages(SESSION).await.unwrap(), None);
        assert_eq!(h.store.get_audio(2).await.unwrap(), None);
        assert!(h.roster.get(SESSION).await.is_none());
        assert!(matches!(
            h.session.load(SESSION).await,
            Err(TutorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_delete_keeps_the_roster_entry() {
        let roster = Arc::new(SessionRoster::ephemeral());
        roster
            .add(SessionMeta::new(SESSION.into(), "卡坦岛".into()))
            .await
            .unwrap();
        let mut mock = crate::store::MockRulebookStore::new();
        mock.expect_get_document().returning(|_| Ok(None));
        mock.expect_get_messages().returning(|_| Ok(None));
        mock.expect_delete_document()
            .returning(|_| Err(TutorError::Store("read-only".into())));
        mock.expect_delete_messages().never();
        let (session, _events) = ExplanationSession::new(SessionDeps {
            store: Arc::new(mock),
            roster: roster.clone(),
            settings: Arc::new(SettingsStore::ephemeral(Settings::default())),
            parser: Arc::new(MockRulebookParser::new()),
            chat: Arc::new(MockChatCompletion::new()),
            cloud_speech: Arc::new(MockCloudSpeech::new()),
            player: Arc::new(idle_player()),
            local_speech: Arc::new(idle_local()),
        });
        session.load(SESSION).await.unwrap();

        assert!(session.delete_session().await.is_err());
        assert!(roster.get(SESSION).await.is_some());
    }

    #[tokio::test]
    async fn rename_trims_and_ignores_blank_names() {
        let h = loaded(Setup::default()).await;

        h.session.rename_session("   ").await.unwrap();
        assert_eq!(h.roster.get(SESSION).await.unwrap().name, "卡坦岛");

        h.session.rename_session("  卡坦岛：航海家 ").await.unwrap();
        assert_eq!(h.roster.get(SESSION).await.unwrap().name, "卡坦岛：航海家");
        assert_eq!(h.session.session_name(), "卡坦岛：航海家");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = loaded(Setup::default()).await;
        assert!(matches!(
            h.session.load("missing").await,
            Err(TutorError::SessionNotFound(_))
        ));
    }
}
