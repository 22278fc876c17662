//! Key-value persistence for documents, message logs and audio.

use crate::error::{Result, TutorError};
use crate::ingest::SourceDocument;
use crate::json_file::{JsonFile, write_atomic};
use crate::message_log::{Message, MessageId};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Three collections with exact-key lookup. Missing keys read as `None` and
/// deleting a missing key succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RulebookStore: Send + Sync {
    async fn put_document(&self, session_id: &str, document: &SourceDocument) -> Result<()>;
    async fn get_document(&self, session_id: &str) -> Result<Option<SourceDocument>>;
    async fn delete_document(&self, session_id: &str) -> Result<()>;

    async fn put_messages(&self, session_id: &str, messages: &[Message]) -> Result<()>;
    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>>;
    async fn delete_messages(&self, session_id: &str) -> Result<()>;

    async fn put_audio(&self, message_id: MessageId, audio: Bytes) -> Result<()>;
    async fn get_audio(&self, message_id: MessageId) -> Result<Option<Bytes>>;
    async fn delete_audio(&self, message_id: MessageId) -> Result<()>;
}

/// Process-local store, used for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, SourceDocument>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
    audio: RwLock<HashMap<MessageId, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RulebookStore for MemoryStore {
    async fn put_document(&self, session_id: &str, document: &SourceDocument) -> Result<()> {
        self.documents
            .write()
            .await
            .insert(session_id.to_string(), document.clone());
        Ok(())
    }

    async fn get_document(&self, session_id: &str) -> Result<Option<SourceDocument>> {
        Ok(self.documents.read().await.get(session_id).cloned())
    }

    async fn delete_document(&self, session_id: &str) -> Result<()> {
        self.documents.write().await.remove(session_id);
        Ok(())
    }

    async fn put_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.messages
            .write()
            .await
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        Ok(self.messages.read().await.get(session_id).cloned())
    }

    async fn delete_messages(&self, session_id: &str) -> Result<()> {
        self.messages.write().await.remove(session_id);
        Ok(())
    }

    async fn put_audio(&self, message_id: MessageId, audio: Bytes) -> Result<()> {
        self.audio.write().await.insert(message_id, audio);
        Ok(())
    }

    async fn get_audio(&self, message_id: MessageId) -> Result<Option<Bytes>> {
        Ok(self.audio.read().await.get(&message_id).cloned())
    }

    async fn delete_audio(&self, message_id: MessageId) -> Result<()> {
        self.audio.write().await.remove(&message_id);
        Ok(())
    }
}

/// Store laid out under a data directory:
///
/// ```text
/// files/<session>.pdf          uploaded PDF
/// files/<session>/<n>.img      photographed pages, in order
/// messages/<session>.json      message log snapshot
/// audio/<message>.wav          cloud speech
/// ```
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pdf_path(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.root.join("files").join(format!("{}.pdf", checked_key(session_id)?)))
    }

    fn pages_dir(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.root.join("files").join(checked_key(session_id)?))
    }

    fn messages_file(&self, session_id: &str) -> Result<JsonFile<Vec<Message>>> {
        Ok(JsonFile::new(
            self.root
                .join("messages")
                .join(format!("{}.json", checked_key(session_id)?)),
        ))
    }

    fn audio_path(&self, message_id: MessageId) -> PathBuf {
        self.root.join("audio").join(format!("{message_id}.wav"))
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn checked_key(key: &str) -> Result<&str> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(key)
    } else {
        Err(TutorError::Store(format!("invalid key {key:?}")))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl RulebookStore for DirStore {
    async fn put_document(&self, session_id: &str, document: &SourceDocument) -> Result<()> {
        // A session holds one representation, so clear whichever was there.
        self.delete_document(session_id).await?;
        match document {
            SourceDocument::Pdf(bytes) => write_atomic(&self.pdf_path(session_id)?, bytes).await,
            SourceDocument::Images(pages) => {
                let dir = self.pages_dir(session_id)?;
                for (index, page) in pages.iter().enumerate() {
                    write_atomic(&dir.join(format!("{index:04}.img")), page).await?;
                }
                Ok(())
            }
        }
    }

    async fn get_document(&self, session_id: &str) -> Result<Option<SourceDocument>> {
        if let Some(bytes) = read_optional(&self.pdf_path(session_id)?).await? {
            return Ok(Some(SourceDocument::Pdf(Bytes::from(bytes))));
        }

        let dir = self.pages_dir(session_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "img") {
                names.push(path);
            }
        }
        names.sort();

        let mut pages = Vec::with_capacity(names.len());
        for path in names {
            pages.push(Bytes::from(tokio::fs::read(&path).await?));
        }
        Ok(Some(SourceDocument::Images(pages)))
    }

    async fn delete_document(&self, session_id: &str) -> Result<()> {
        remove_file_if_exists(&self.pdf_path(session_id)?).await?;
        remove_dir_if_exists(&self.pages_dir(session_id)?).await
    }

    async fn put_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.messages_file(session_id)?.save(&messages.to_vec()).await
    }

    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        self.messages_file(session_id)?.load().await
    }

    async fn delete_messages(&self, session_id: &str) -> Result<()> {
        remove_file_if_exists(self.messages_file(session_id)?.path()).await
    }

    async fn put_audio(&self, message_id: MessageId, audio: Bytes) -> Result<()> {
        write_atomic(&self.audio_path(message_id), &audio).await
    }

    async fn get_audio(&self, message_id: MessageId) -> Result<Option<Bytes>> {
        Ok(read_optional(&self.audio_path(message_id))
            .await?
            .map(Bytes::from))
    }

    async fn delete_audio(&self, message_id: MessageId) -> Result<()> {
        remove_file_if_exists(&self.audio_path(message_id)).await
    }
}
