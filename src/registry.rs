//! Session registry: lazy coordinator hydration and idle eviction
//!
//! Coordinators wake from hibernation on first connection and survive an
//! ungraceful eviction without losing committed state. This registry is the
//! component that owns that lifecycle — one shared `HashMap` behind a
//! `Mutex`, the same shape as a shared application-state map keyed by id,
//! except the map holds one [`CoordinatorHandle`] per live session instead
//! of raw data, because each session's state now lives inside its own actor
//! task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::coordinator::{self, Command, CoordinatorHandle};
use crate::persistence::Persistence;

/// How long a session is kept resident with zero connections before its
/// coordinator actor is torn down. Gives a reconnecting client a grace
/// window without paying full rehydration-from-disk on every hiccup.
const EVICTION_GRACE: Duration = Duration::from_secs(120);

/// Registry of live session coordinators, shared across every accepted
/// WebSocket connection.
#[derive(Clone)]
pub struct SessionRegistry {
    /// Live coordinator handles, keyed by session id.
    sessions: Arc<Mutex<HashMap<String, CoordinatorHandle>>>,
    /// Shared persistence store every coordinator hydrates from and
    /// flushes to.
    persistence: Persistence,
}

impl SessionRegistry {
    /// Construct an empty registry over the given persistence store.
    pub fn new(persistence: Persistence) -> Self {
        SessionRegistry {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            persistence,
        }
    }

    /// Get the coordinator handle for `session_id`, hydrating it from
    /// persistence and spawning a fresh actor if it isn't already resident.
    pub async fn get_or_spawn(&self, session_id: &str) -> CoordinatorHandle {
        let mut sessions = self.sessions.lock().await;

        if let Some(handle) = sessions.get(session_id) {
            return handle.clone();
        }

        info!(session_id, "no resident coordinator; hydrating");
        let session = self
            .persistence
            .load_or_create(session_id)
            .await
            .unwrap_or_else(|err| {
                tracing::error!(session_id, error = %err, "failed to hydrate session; starting empty");
                crate::model::Session::new(session_id)
            });

        let handle = coordinator::spawn(session, self.persistence.clone());
        sessions.insert(session_id.to_string(), handle.clone());

        self.schedule_eviction_check(session_id.to_string());

        handle
    }

    /// Periodically check `session_id`'s coordinator and evict it once it
    /// has gone a full grace window with zero connections. Re-checks on
    /// every window rather than firing once on a fixed timer, so a
    /// coordinator that's busy the whole time is never torn down out from
    /// under its own connections — only a connection count of zero,
    /// sustained across the grace window, triggers eviction.
    fn schedule_eviction_check(&self, session_id: String) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                sleep(EVICTION_GRACE).await;

                // Hold one lock guard across both the idle check and the
                // removal below: if they were two separate acquisitions, a
                // `get_or_spawn` could hand this handle to a new connection
                // in the gap between them, and the `Shutdown` sent after
                // re-acquiring the lock would tear down a coordinator with
                // a live connection.
                let mut sessions = sessions.lock().await;
                let Some(handle) = sessions.get(&session_id).cloned() else {
                    return; // already evicted or replaced
                };

                if !handle.is_idle().await {
                    drop(sessions);
                    continue;
                }

                sessions.remove(&session_id);
                drop(sessions);
                debug!(session_id, "evicting idle coordinator");
                handle.send(Command::Shutdown).await;
                return;
            }
        });
    }

    /// Shut down every resident coordinator, flushing cold-tier state.
    /// Called once from the server's graceful-shutdown path.
    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, handle) in sessions.drain() {
            debug!(session_id, "shutting down coordinator");
            handle.send(Command::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_lookups_reuse_the_same_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).await.unwrap();
        let registry = SessionRegistry::new(persistence);

        let first = registry.get_or_spawn("s1").await;
        let second = registry.get_or_spawn("s1").await;

        // Both handles should route into the same actor: sending a
        // shutdown via one and then trying to use the other should not
        // panic the test process, since `send` swallows a closed channel.
        drop(first);
        second.send(Command::Shutdown).await;
    }
}
