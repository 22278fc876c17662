//! Playback of synthesized audio files.

use rulebook_core::audio::AudioPlayer;
use rulebook_core::speech::CloudSpeech;
use std::sync::Arc;

/// The player for this build: the output device with `native-audio`, or one
/// that reports playback as unsupported.
pub fn default_player(cloud: Arc<dyn CloudSpeech>) -> Arc<dyn AudioPlayer> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(native::DevicePlayer::new(cloud))
    }
    #[cfg(not(feature = "native-audio"))]
    {
        let _ = cloud;
        Arc::new(UnsupportedPlayer)
    }
}

#[cfg(not(feature = "native-audio"))]
pub struct UnsupportedPlayer;

#[cfg(not(feature = "native-audio"))]
#[async_trait::async_trait]
impl AudioPlayer for UnsupportedPlayer {
    fn is_available(&self) -> bool {
        false
    }

    async fn play(
        &self,
        _audio: rulebook_core::audio::PlayableAudio,
        _rate: f32,
    ) -> rulebook_core::Result<()> {
        Err(rulebook_core::TutorError::Unsupported(
            "audio file playback (build with the native-audio feature)".to_string(),
        ))
    }

    fn stop(&self) {}
}

#[cfg(feature = "native-audio")]
mod native {
    use async_trait::async_trait;
    use bytes::Bytes;
    use rulebook_core::audio::{AudioPlayer, PlayableAudio};
    use rulebook_core::error::{Result, TutorError};
    use rulebook_core::speech::CloudSpeech;
    use rulebook_native_utils::{audio, device, playback};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Plays WAV clips on the default output device, one at a time.
    pub struct DevicePlayer {
        cloud: Arc<dyn CloudSpeech>,
        stop_flag: Mutex<Arc<AtomicBool>>,
    }

    impl DevicePlayer {
        pub fn new(cloud: Arc<dyn CloudSpeech>) -> Self {
            Self {
                cloud,
                stop_flag: Mutex::new(Arc::new(AtomicBool::new(false))),
            }
        }

        /// Raises the current stop flag and installs a fresh one.
        fn fresh_flag(&self) -> Arc<AtomicBool> {
            let mut current = self.stop_flag.lock().unwrap_or_else(PoisonError::into_inner);
            current.store(true, Ordering::SeqCst);
            *current = Arc::new(AtomicBool::new(false));
            current.clone()
        }

        async fn bytes_of(&self, audio: PlayableAudio) -> Result<Bytes> {
            match audio {
                PlayableAudio::Cached(bytes) => Ok(bytes),
                PlayableAudio::Remote(url) => self.cloud.download(&url).await,
            }
        }
    }

    #[async_trait]
    impl AudioPlayer for DevicePlayer {
        fn is_available(&self) -> bool {
            device::get_or_default_output(None).is_ok()
        }

        async fn play(&self, audio: PlayableAudio, rate: f32) -> Result<()> {
            let bytes = self.bytes_of(audio).await?;
            let clip = audio::decode_wav(&bytes).map_err(|e| TutorError::Playback(e.to_string()))?;
            tracing::debug!("Playing {:.1}s clip at {}x", clip.duration_secs(), rate);

            let stop = self.fresh_flag();
            tokio::task::spawn_blocking(move || {
                let output = device::get_or_default_output(None)?;
                playback::play_blocking(&output, &clip, rate, &stop)
            })
            .await
            .map_err(|e| TutorError::Playback(e.to_string()))?
            .map_err(|e| TutorError::Playback(e.to_string()))
        }

        fn stop(&self) {
            self.stop_flag
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(all(test, not(feature = "native-audio")))]
mod tests {
    use super::*;
    use rulebook_core::TutorError;
    use rulebook_core::audio::PlayableAudio;

    #[tokio::test]
    async fn plain_build_reports_file_playback_as_unsupported() {
        let player = UnsupportedPlayer;

        assert!(!player.is_available());
        let played = player
            .play(PlayableAudio::Remote("https://a/1.wav".into()), 1.0)
            .await;
        assert!(matches!(played, Err(TutorError::Unsupported(_))));
    }
}
