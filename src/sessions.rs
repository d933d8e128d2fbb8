use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A produced file waiting for its single download.
#[derive(Debug, Clone)]
pub struct Session {
    pub file_path: PathBuf,
    /// Scratch directory the extraction wrote into; removed with the file.
    pub job_dir: PathBuf,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(file_path: PathBuf, job_dir: PathBuf, title: String) -> Self {
        Self {
            file_path,
            job_dir,
            title,
            created_at: Utc::now(),
        }
    }
}

/// Process-wide table of unclaimed downloads. Every operation goes through the
/// mutex, so an id handed out by [`SessionStore::put`] can be taken at most
/// once no matter how many requests race for it.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under a fresh random id and returns the id.
    pub async fn put(&self, session: Session) -> String {
        let mut sessions = self.inner.lock().await;
        loop {
            let id = Uuid::new_v4().to_string();
            if let std::collections::hash_map::Entry::Vacant(slot) = sessions.entry(id.clone()) {
                slot.insert(session);
                return id;
            }
        }
    }

    /// Removes and returns the session, or `None` when the id was never issued
    /// or has already been claimed.
    pub async fn take(&self, id: &str) -> Option<Session> {
        self.inner.lock().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Drops every session older than `max_age` and hands them back so the
    /// caller can delete their files. Only used when expiry is switched on.
    pub async fn remove_expired(&self, max_age: Duration) -> Vec<Session> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_age;

        let mut sessions = self.inner.lock().await;
        let expired_ids = sessions
            .iter()
            .filter(|(_, session)| session.created_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        expired_ids
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> Session {
        Session::new(
            PathBuf::from(format!("/tmp/job/{name}.mkv")),
            PathBuf::from("/tmp/job"),
            name.to_string(),
        )
    }

    #[tokio::test]
    async fn take_succeeds_exactly_once() {
        let store = SessionStore::new();
        let id = store.put(session("clip")).await;

        assert!(store.contains(&id).await);
        let taken = store.take(&id).await.expect("first take");
        assert_eq!(taken.title, "clip");
        assert!(store.take(&id).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = SessionStore::new();
        store.put(session("clip")).await;
        assert!(store.take("not-a-session").await.is_none());
        assert!(store.take(&Uuid::new_v4().to_string()).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn ids_are_unique_uuids() {
        let store = SessionStore::new();
        let first = store.put(session("a")).await;
        let second = store.put(session("b")).await;
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_deliver_at_most_once() {
        let store = SessionStore::new();
        let id = store.put(session("race")).await;

        let handles = (0..16)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.take(&id).await.is_some() })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn remove_expired_only_drops_old_sessions() {
        let store = SessionStore::new();
        let mut old = session("old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        let old_id = store.put(old).await;
        let fresh_id = store.put(session("fresh")).await;

        let expired = store.remove_expired(Duration::from_secs(3600)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].title, "old");
        assert!(!store.contains(&old_id).await);
        assert!(store.contains(&fresh_id).await);
    }
}
