//! On-device speech through the platform's command-line synthesizer.

use async_trait::async_trait;
use rulebook_core::audio::LocalSpeech;
use rulebook_core::error::{Result, TutorError};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Notify;

/// Words per minute at rate 1.0.
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Synthesizer {
    /// macOS `say`.
    Say,
    /// `espeak-ng` or `espeak`.
    Espeak,
}

pub struct CommandSpeech {
    program: Option<(Synthesizer, PathBuf)>,
    cancelled: Notify,
}

impl CommandSpeech {
    /// Looks for a synthesizer on `PATH`.
    pub fn detect() -> Self {
        let candidates = [
            (Synthesizer::Say, "say"),
            (Synthesizer::Espeak, "espeak-ng"),
            (Synthesizer::Espeak, "espeak"),
        ];
        let program = candidates
            .into_iter()
            .find_map(|(kind, name)| find_on_path(name).map(|path| (kind, path)));
        match &program {
            Some((_, path)) => tracing::info!("Local speech via {}", path.display()),
            None => tracing::warn!("No local speech synthesizer found"),
        }
        Self {
            program,
            cancelled: Notify::new(),
        }
    }

    fn command(&self, text: &str, rate: f32) -> Option<Command> {
        let (kind, path) = self.program.as_ref()?;
        let words_per_minute = (BASE_WORDS_PER_MINUTE * rate).round() as u32;

        let mut command = Command::new(path);
        match kind {
            Synthesizer::Say => {
                command.arg("-r").arg(words_per_minute.to_string());
            }
            Synthesizer::Espeak => {
                command
                    .arg("-v")
                    .arg("cmn")
                    .arg("-s")
                    .arg(words_per_minute.to_string());
            }
        }
        command
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Some(command)
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl LocalSpeech for CommandSpeech {
    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    async fn speak(&self, text: &str, rate: f32) -> Result<()> {
        let mut command = self
            .command(text, rate)
            .ok_or_else(|| TutorError::Unsupported("local speech synthesis".to_string()))?;
        let mut child = command.spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(TutorError::Playback(format!("synthesizer exited with {status}")));
                }
            }
            _ = self.cancelled.notified() => {
                tracing::debug!("Local speech cancelled");
                child.kill().await?;
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.notify_waiters();
    }
}
