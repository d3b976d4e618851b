//! Two-tier persistence
//!
//! The hot tier is authoritative: every accepted mutation is written here
//! synchronously, before the coordinator acks it, and it's the only thing
//! trusted on coordinator (re)hydration. The cold tier is a best-effort
//! mirror, written once when a session goes quiescent (last connection
//! drops) or on graceful shutdown, and is only consulted when the hot tier
//! has nothing for a session id.
//!
//! Flat files under a data directory, one subdirectory per tier: hot is
//! MessagePack-encoded (via `rmp-serde`) for fast, compact round-trips on
//! (re)hydration, cold is canonical JSON since a human or another tool may
//! want to read it directly. Both formats are self-describing — required
//! here because [`Session::effects`](crate::model::Session::effects) is an
//! opaque `serde_json::Value`, whose `Deserialize` impl calls
//! `deserialize_any`; a non-self-describing format like `bincode` rejects
//! that outright.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::PersistenceError;
use crate::model::Session;

/// Filesystem-backed two-tier session store.
#[derive(Debug, Clone)]
pub struct Persistence {
    /// Root directory for hot-tier files, one per session.
    hot_dir: PathBuf,
    /// Root directory for cold-tier files, one per session.
    cold_dir: PathBuf,
}

impl Persistence {
    /// Open (creating if necessary) a persistence store rooted at
    /// `data_dir`, with `hot/` and `cold/` subdirectories.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let hot_dir = data_dir.as_ref().join("hot");
        let cold_dir = data_dir.as_ref().join("cold");
        fs::create_dir_all(&hot_dir).await?;
        fs::create_dir_all(&cold_dir).await?;
        Ok(Persistence { hot_dir, cold_dir })
    }

    /// Path to a session's hot-tier file.
    fn hot_path(&self, session_id: &str) -> PathBuf {
        self.hot_dir.join(format!("{session_id}.msgpack"))
    }

    /// Path to a session's cold-tier file.
    fn cold_path(&self, session_id: &str) -> PathBuf {
        self.cold_dir.join(format!("{session_id}.json"))
    }

    /// Synchronously (from the caller's perspective — awaited before the
    /// coordinator acks) persist `session` to the hot tier.
    pub async fn write_hot(&self, session: &Session) -> Result<(), PersistenceError> {
        let bytes = rmp_serde::to_vec_named(session).map_err(|e| PersistenceError::Encode(e.to_string()))?;
        fs::write(self.hot_path(&session.session_id), bytes).await?;
        Ok(())
    }

    /// Best-effort mirror write to the cold tier, as canonical JSON.
    /// Failures here are logged by the caller but never roll back a
    /// mutation — only the hot tier is authoritative.
    pub async fn write_cold(&self, session: &Session) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(session).map_err(|e| PersistenceError::Encode(e.to_string()))?;
        fs::write(self.cold_path(&session.session_id), json).await?;
        Ok(())
    }

    /// Load a session from the hot tier, if present.
    pub async fn load_hot(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        let path = self.hot_path(session_id);
        if !path.try_exists()? {
            return Ok(None);
        }
        let bytes = fs::read(path).await?;
        let session = rmp_serde::from_slice(&bytes).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        Ok(Some(session))
    }

    /// Load a session from the cold tier, if present.
    pub async fn load_cold(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        let path = self.cold_path(session_id);
        if !path.try_exists()? {
            return Ok(None);
        }
        let bytes = fs::read(path).await?;
        let session = serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        Ok(Some(session))
    }

    /// Hydrate a session for coordinator startup: hot tier first (the
    /// authoritative source), falling back to the cold tier (mirroring it
    /// straight back into the hot tier so the next write lands on a warm
    /// file), and finally a brand-new empty session if neither tier has
    /// anything for this id.
    pub async fn load_or_create(&self, session_id: &str) -> Result<Session, PersistenceError> {
        if let Some(session) = self.load_hot(session_id).await? {
            debug!(session_id, "hydrated session from hot tier");
            return Ok(session);
        }

        if let Some(session) = self.load_cold(session_id).await? {
            debug!(session_id, "hot tier empty; hydrated session from cold tier");
            self.write_hot(&session).await?;
            return Ok(session);
        }

        debug!(session_id, "no persisted state found; creating new session");
        Ok(Session::new(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_hot_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = Persistence::open(dir.path()).await.unwrap();

        let mut session = Session::new("s1");
        session.tempo = 140.0;
        store.write_hot(&session).await.unwrap();

        let loaded = store.load_hot("s1").await.unwrap().unwrap();
        assert_eq!(loaded.tempo, 140.0);
    }

    #[tokio::test]
    async fn falls_back_to_cold_tier_and_rehydrates_hot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Persistence::open(dir.path()).await.unwrap();

        let mut session = Session::new("s1");
        session.tempo = 99.0;
        store.write_cold(&session).await.unwrap();

        let loaded = store.load_or_create("s1").await.unwrap();
        assert_eq!(loaded.tempo, 99.0);
        assert!(store.load_hot("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn creates_new_session_when_nothing_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Persistence::open(dir.path()).await.unwrap();

        let session = store.load_or_create("brand-new").await.unwrap();
        assert_eq!(session.session_id, "brand-new");
        assert!(session.tracks.is_empty());
    }
}
