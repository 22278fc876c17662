//! The game library: one entry per rulebook the user has added.

use crate::error::Result;
use crate::ingest::SourceDocument;
use crate::json_file::JsonFile;
use crate::store::RulebookStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Default name for a game added from photographed pages.
pub const IMAGE_UPLOAD_NAME: &str = "New Game (From Images)";
const UNTITLED_NAME: &str = "Untitled Game";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub has_document: bool,
}

impl SessionMeta {
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            created_at: now,
            last_active_at: now,
            has_document: true,
        }
    }
}

/// The most recent rule-sheet search, kept so it survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LastSearch {
    pub query: String,
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RosterData {
    games: Vec<SessionMeta>,
    last_search: LastSearch,
}

/// Session metadata, newest first, persisted as `roster.json`.
pub struct SessionRoster {
    file: Option<JsonFile<RosterData>>,
    data: RwLock<RosterData>,
}

impl SessionRoster {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let file = JsonFile::<RosterData>::new(path);
        let data = file.load().await?.unwrap_or_default();
        tracing::info!("Loaded {} games from {:?}", data.games.len(), file.path());
        Ok(Self {
            file: Some(file),
            data: RwLock::new(data),
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            file: None,
            data: RwLock::new(RosterData::default()),
        }
    }

    pub async fn list(&self) -> Vec<SessionMeta> {
        self.data.read().await.games.clone()
    }

    pub async fn get(&self, id: &str) -> Option<SessionMeta> {
        self.data
            .read()
            .await
            .games
            .iter()
            .find(|game| game.id == id)
            .cloned()
    }

    pub async fn add(&self, meta: SessionMeta) -> Result<()> {
        self.update(|data| {
            data.games.retain(|game| game.id != meta.id);
            data.games.insert(0, meta);
            true
        })
        .await
        .map(|_| ())
    }

    /// Returns `false` if no session has this id.
    pub async fn rename(&self, id: &str, name: &str) -> Result<bool> {
        self.update(|data| match data.games.iter_mut().find(|g| g.id == id) {
            Some(game) => {
                game.name = name.to_string();
                true
            }
            None => false,
        })
        .await
    }

    /// Marks the session as just played.
    pub async fn touch(&self, id: &str) -> Result<bool> {
        self.update(|data| match data.games.iter_mut().find(|g| g.id == id) {
            Some(game) => {
                game.last_active_at = Utc::now();
                true
            }
            None => false,
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.update(|data| {
            let before = data.games.len();
            data.games.retain(|game| game.id != id);
            data.games.len() != before
        })
        .await
    }

    pub async fn last_search(&self) -> LastSearch {
        self.data.read().await.last_search.clone()
    }

    pub async fn set_last_search(&self, query: &str, results: Vec<String>) -> Result<()> {
        self.update(|data| {
            data.last_search = LastSearch {
                query: query.to_string(),
                results,
            };
            true
        })
        .await
        .map(|_| ())
    }

    /// Applies `change` and saves if it reports a modification.
    async fn update(&self, change: impl FnOnce(&mut RosterData) -> bool) -> Result<bool> {
        let mut data = self.data.write().await;
        let changed = change(&mut data);
        if changed {
            if let Some(file) = &self.file {
                file.save(&data).await?;
            }
        }
        Ok(changed)
    }
}

/// Stores `document` under a fresh id and adds it to the roster. The document
/// is written first so the roster never lists a game without its rulebook.
pub async fn create_session(
    roster: &SessionRoster,
    store: &dyn RulebookStore,
    name: &str,
    document: SourceDocument,
) -> Result<SessionMeta> {
    let id = uuid::Uuid::new_v4().to_string();
    store.put_document(&id, &document).await?;

    let meta = SessionMeta::new(id, name.to_string());
    roster.add(meta.clone()).await?;
    tracing::info!("Added game {:?} as session {}", meta.name, meta.id);
    Ok(meta)
}

/// A game name derived from an uploaded file: the file name without extension.
pub fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| UNTITLED_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TutorError;
    use crate::store::{MemoryStore, MockRulebookStore};
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn newest_games_come_first() {
        let roster = SessionRoster::ephemeral();
        roster
            .add(SessionMeta::new("a".into(), "Azul".into()))
            .await
            .unwrap();
        roster
            .add(SessionMeta::new("b".into(), "Brass".into()))
            .await
            .unwrap();

        let names: Vec<_> = roster.list().await.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["Brass", "Azul"]);
    }

    #[tokio::test]
    async fn rename_touch_remove_report_unknown_ids() {
        let roster = SessionRoster::ephemeral();
        assert!(!roster.rename("ghost", "x").await.unwrap());
        assert!(!roster.touch("ghost").await.unwrap());
        assert!(!roster.remove("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn touch_advances_last_active() {
        let roster = SessionRoster::ephemeral();
        let meta = SessionMeta::new("a".into(), "Azul".into());
        let created = meta.last_active_at;
        roster.add(meta).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(roster.touch("a").await.unwrap());
        assert!(roster.get("a").await.unwrap().last_active_at > created);
    }

    #[tokio::test]
    async fn roster_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");

        let roster = SessionRoster::open(path.clone()).await.unwrap();
        roster
            .add(SessionMeta::new("a".into(), "Azul".into()))
            .await
            .unwrap();
        roster.rename("a", "Azul: Summer Pavilion").await.unwrap();
        roster
            .set_last_search("azul", vec!["https://example.com/azul.pdf".into()])
            .await
            .unwrap();

        let reopened = SessionRoster::open(path).await.unwrap();
        assert_eq!(
            reopened.get("a").await.unwrap().name,
            "Azul: Summer Pavilion"
        );
        assert_eq!(reopened.last_search().await.query, "azul");
    }

    #[tokio::test]
    async fn missing_roster_file_opens_empty_and_removals_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("roster.json");

        let roster = SessionRoster::open(path.clone()).await.unwrap();
        assert!(roster.list().await.is_empty());
        assert!(roster.last_search().await.results.is_empty());

        roster
            .add(SessionMeta::new("a".into(), "Azul".into()))
            .await
            .unwrap();
        roster
            .add(SessionMeta::new("b".into(), "Brass".into()))
            .await
            .unwrap();
        assert!(roster.remove("a").await.unwrap());

        let reopened = SessionRoster::open(path).await.unwrap();
        let ids: Vec<_> = reopened.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn create_session_stores_document_then_lists_it() {
        let roster = SessionRoster::ephemeral();
        let store = MemoryStore::new();
        let document = SourceDocument::Pdf(Bytes::from_static(b"%PDF"));

        let meta = create_session(&roster, &store, "Catan", document.clone())
            .await
            .unwrap();

        assert_eq!(store.get_document(&meta.id).await.unwrap(), Some(document));
        assert_eq!(roster.list().await, vec![meta.clone()]);
        assert!(meta.has_document);
        assert!(uuid::Uuid::parse_str(&meta.id).is_ok());
    }

    #[tokio::test]
    async fn failed_document_write_adds_nothing() {
        let roster = SessionRoster::ephemeral();
        let mut store = MockRulebookStore::new();
        store
            .expect_put_document()
            .returning(|_, _| Err(TutorError::Store("disk full".into())));

        let result = create_session(
            &roster,
            &store,
            "Catan",
            SourceDocument::Pdf(Bytes::from_static(b"%PDF")),
        )
        .await;

        assert!(result.is_err());
        assert!(roster.list().await.is_empty());
    }

    #[test]
    fn names_come_from_file_stems() {
        assert_eq!(name_from_path(Path::new("/tmp/Wingspan Rules.pdf")), "Wingspan Rules");
        assert_eq!(name_from_path(Path::new("/")), UNTITLED_NAME);
    }
}
