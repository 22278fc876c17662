//! Audio lifecycle: which message is generating, which one is playing, and
//! stopping both playback paths.
//!
//! Only one message plays at a time. Playback runs as a spawned task whose
//! abort handle sits in a single slot; starting anything new first empties
//! the slot. A task that finishes on its own clears the slot only if it still
//! owns it, so a late completion never clears a newer playback.

use crate::error::Result;
use crate::message_log::MessageId;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

/// Audio the file player can handle.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayableAudio {
    Remote(String),
    Cached(Bytes),
}

/// Plays audio files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Whether this device can play audio files at all.
    fn is_available(&self) -> bool;

    /// Resolves once playback has ended.
    async fn play(&self, audio: PlayableAudio, rate: f32) -> Result<()>;

    fn stop(&self);
}

/// On-device speech synthesis.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalSpeech: Send + Sync {
    fn is_available(&self) -> bool;

    /// Resolves once the utterance has been spoken.
    async fn speak(&self, text: &str, rate: f32) -> Result<()>;

    fn cancel(&self);
}

/// Rate for the local engine. Steps above 1.0 count double there, so the
/// same setting feels as fast as it does on file playback.
pub fn local_rate(rate: f32) -> f32 {
    if rate == 1.0 {
        1.0
    } else {
        1.0 + (rate - 1.0) * 2.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    File(PlayableAudio),
    Utterance(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
    GenerationStarted(MessageId),
    GenerationFinished(MessageId),
    PlaybackStarted(MessageId),
    /// Playback ran to its end.
    PlaybackFinished(MessageId),
    /// Playback was cut short.
    PlaybackStopped(MessageId),
    /// Playback broke off with an error.
    PlaybackFailed(MessageId, String),
    /// Every playing and generating flag was cleared.
    Reset,
}

pub type AudioEventSink = Arc<dyn Fn(AudioEvent) + Send + Sync>;

struct Playback {
    id: MessageId,
    token: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct AudioState {
    playing: Option<Playback>,
    generating: HashSet<MessageId>,
}

fn lock(state: &Mutex<AudioState>) -> MutexGuard<'_, AudioState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AudioManager {
    player: Arc<dyn AudioPlayer>,
    local: Arc<dyn LocalSpeech>,
    state: Arc<Mutex<AudioState>>,
    sink: AudioEventSink,
    next_token: AtomicU64,
}

impl AudioManager {
    pub fn new(
        player: Arc<dyn AudioPlayer>,
        local: Arc<dyn LocalSpeech>,
        sink: AudioEventSink,
    ) -> Self {
        Self {
            player,
            local,
            state: Arc::new(Mutex::new(AudioState::default())),
            sink,
            next_token: AtomicU64::new(0),
        }
    }

    pub fn local_available(&self) -> bool {
        self.local.is_available()
    }

    pub fn player_available(&self) -> bool {
        self.player.is_available()
    }

    pub fn playing(&self) -> Option<MessageId> {
        lock(&self.state).playing.as_ref().map(|p| p.id)
    }

    pub fn is_generating(&self, id: MessageId) -> bool {
        lock(&self.state).generating.contains(&id)
    }

    pub fn begin_generating(&self, id: MessageId) {
        if lock(&self.state).generating.insert(id) {
            (self.sink)(AudioEvent::GenerationStarted(id));
        }
    }

    pub fn end_generating(&self, id: MessageId) {
        if lock(&self.state).generating.remove(&id) {
            (self.sink)(AudioEvent::GenerationFinished(id));
        }
    }

    /// Starts playing `source` for message `id`, replacing any playback.
    pub fn start(&self, id: MessageId, source: AudioSource, rate: f32) {
        self.stop_all();

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let player = self.player.clone();
        let local = self.local.clone();
        let state = self.state.clone();
        let sink = self.sink.clone();

        // Held across the spawn so the task cannot finish before the slot is set.
        let mut guard = lock(&self.state);
        let task = tokio::spawn(async move {
            let result = match source {
                AudioSource::File(audio) => player.play(audio, rate).await,
                AudioSource::Utterance(text) => local.speak(&text, local_rate(rate)).await,
            };
            let mut slot = lock(&state);
            if !slot.playing.as_ref().is_some_and(|p| p.token == token) {
                return;
            }
            slot.playing = None;
            match result {
                Ok(()) => sink(AudioEvent::PlaybackFinished(id)),
                Err(e) => {
                    tracing::error!("Playback of message {} failed: {}", id, e);
                    sink(AudioEvent::PlaybackFailed(id, e.to_string()));
                }
            }
        });
        guard.playing = Some(Playback {
            id,
            token,
            handle: task.abort_handle(),
        });
        (self.sink)(AudioEvent::PlaybackStarted(id));
        tracing::debug!("Playing audio for message {}", id);
    }

    /// Silences both playback paths, whichever one is active.
    pub fn stop_all(&self) {
        let previous = lock(&self.state).playing.take();
        if let Some(playback) = previous {
            playback.handle.abort();
            (self.sink)(AudioEvent::PlaybackStopped(playback.id));
        }
        self.player.stop();
        self.local.cancel();
    }

    /// Stops playback and forgets every generating message.
    pub fn reset(&self) {
        self.stop_all();
        lock(&self.state).generating.clear();
        (self.sink)(AudioEvent::Reset);
    }
}
