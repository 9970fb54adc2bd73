use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BotError, BotResult};

pub const DATABASE_PATH: &str = "database.json";

const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 1_800_000;

/// Service account whose submissions never show up in the user ranking.
const SENTINEL_USER: &str = "AutoTest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongStatEntry {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub play_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub disconnect_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT_MS,
        }
    }
}

/// The whole persisted document. BTreeMaps keep the on-disk key order
/// stable so repeated save/load cycles are byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    #[serde(default)]
    pub leaderboard: BTreeMap<String, LeaderboardEntry>,
    #[serde(default)]
    pub song_stats: BTreeMap<String, SongStatEntry>,
    #[serde(default)]
    pub settings: Settings,
}

/// Leaderboard and settings store backed by a single JSON file. Every
/// mutation rewrites the file in full.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    doc: PersistedDocument,
}

impl Database {
    /// Load the document, falling back to (and writing) a default one when
    /// the file is missing or unreadable.
    pub async fn load_or_init(path: impl Into<PathBuf>) -> BotResult<Self> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("could not parse {}: {e}, starting fresh", path.display());
                    PersistedDocument::default()
                }
            },
            Err(_) => PersistedDocument::default(),
        };
        let db = Database { path, doc };
        if !Path::new(&db.path).exists() {
            db.save().await?;
        }
        Ok(db)
    }

    pub async fn save(&self) -> BotResult<()> {
        let s = serde_json::to_string_pretty(&self.doc).map_err(|e| {
            BotError::Persistence(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        tokio::fs::write(&self.path, s)
            .await
            .map_err(BotError::Persistence)?;
        Ok(())
    }

    /// One point per submission action; a playlist counts once. The latest
    /// username always wins so renames show up on the board.
    pub fn record_contribution(&mut self, user_id: &str, username: &str) {
        let entry = self
            .doc
            .leaderboard
            .entry(user_id.to_string())
            .or_insert_with(|| LeaderboardEntry {
                username: username.to_string(),
                count: 0,
            });
        entry.username = username.to_string();
        entry.count += 1;
    }

    /// Keyed by URL when known, otherwise by title.
    pub fn record_song_play(&mut self, title: &str, url: Option<&str>) {
        let key = url.unwrap_or(title).to_string();
        let entry = self
            .doc
            .song_stats
            .entry(key)
            .or_insert_with(|| SongStatEntry {
                title: title.to_string(),
                url: url.map(str::to_string),
                play_count: 0,
            });
        entry.title = title.to_string();
        entry.play_count += 1;
    }

    /// Top contributors, highest count first, sentinel excluded. Ties keep
    /// map-key order (sort is stable).
    pub fn top_users(&self, n: usize) -> Vec<(String, LeaderboardEntry)> {
        let mut users: Vec<(String, LeaderboardEntry)> = self
            .doc
            .leaderboard
            .iter()
            .filter(|(_, e)| e.username != SENTINEL_USER)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        users.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        users.truncate(n);
        users
    }

    pub fn top_songs(&self, n: usize) -> Vec<SongStatEntry> {
        let mut songs: Vec<SongStatEntry> = self.doc.song_stats.values().cloned().collect();
        songs.sort_by(|a, b| b.play_count.cmp(&a.play_count));
        songs.truncate(n);
        songs
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.doc.settings.disconnect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_db(dir: &tempfile::TempDir) -> Database {
        Database::load_or_init(dir.path().join("database.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn contributions_accumulate_and_rename_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = fresh_db(&dir).await;

        for _ in 0..3 {
            db.record_contribution("42", "old name");
        }
        db.record_contribution("42", "new name");

        let top = db.top_users(20);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "42");
        assert_eq!(top[0].1.count, 4);
        assert_eq!(top[0].1.username, "new name");
    }

    #[tokio::test]
    async fn top_users_sorts_truncates_and_skips_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = fresh_db(&dir).await;

        db.record_contribution("1", "alice");
        for _ in 0..5 {
            db.record_contribution("2", "bob");
        }
        for _ in 0..3 {
            db.record_contribution("3", "carol");
        }
        for _ in 0..100 {
            db.record_contribution("999", "AutoTest");
        }

        let top = db.top_users(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].1.username, "bob");
        assert_eq!(top[1].1.username, "carol");
        assert!(top.iter().all(|(_, e)| e.username != "AutoTest"));
    }

    #[tokio::test]
    async fn song_plays_key_by_url_then_title() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = fresh_db(&dir).await;

        db.record_song_play("Song A", Some("https://youtu.be/a"));
        db.record_song_play("Song A (remaster)", Some("https://youtu.be/a"));
        db.record_song_play("No URL Song", None);

        let top = db.top_songs(20);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].play_count, 2);
        // latest title overwrote the stored one
        assert_eq!(top[0].title, "Song A (remaster)");
        assert_eq!(top[1].title, "No URL Song");
    }

    #[tokio::test]
    async fn save_load_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");

        let mut db = Database::load_or_init(&path).await.unwrap();
        db.record_contribution("7", "dave");
        db.record_contribution("3", "erin");
        db.record_song_play("x", Some("https://youtu.be/x"));
        db.save().await.unwrap();
        let first = tokio::fs::read_to_string(&path).await.unwrap();

        let reloaded = Database::load_or_init(&path).await.unwrap();
        reloaded.save().await.unwrap();
        let second = tokio::fs::read_to_string(&path).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn legacy_document_without_song_stats_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        tokio::fs::write(
            &path,
            r#"{ "leaderboard": { "1": { "username": "alice", "count": 2 } } }"#,
        )
        .await
        .unwrap();

        let db = Database::load_or_init(&path).await.unwrap();
        assert_eq!(db.top_users(20)[0].1.count, 2);
        assert!(db.top_songs(20).is_empty());
        assert_eq!(db.disconnect_timeout(), Duration::from_millis(1_800_000));
    }
}
