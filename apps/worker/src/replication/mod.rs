//! Pull/push replication between the local store and the server.
//!
//! Each synced collection replicates independently. Pulls page forward from
//! the collection's checkpoint until a short page signals the head; pushes
//! drain dirty documents in batches and mark them clean only after the
//! server acknowledges. Both directions are idempotent, so a crash between
//! apply and acknowledge costs a redundant round trip, never data.

pub mod channel;
pub mod client;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use crate::collections::{CONTENTS, DEFINITIONS};
use crate::config::ReplicationConfig;
use crate::http::HttpError;
use crate::replication::channel::ChangeNotice;
use crate::replication::client::SyncClient;
use crate::store::{DocumentStore, ReplicationMode, StoreError};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("server rejected request: {0}")]
    Server(String),

    #[error("malformed server response: {0}")]
    Parse(String),

    #[error("authentication expired and refresh failed: {0}")]
    AuthExpired(String),
}

/// What one `sync_collection` pass moved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
}

/// Called with the collection name after every successful sync pass. Lets
/// the owner invalidate caches derived from replicated data no matter which
/// path (notice, poll, forced) ran the sync.
pub type SyncedHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ReplicationEngine<C: SyncClient> {
    store: Arc<Mutex<DocumentStore>>,
    client: C,
    config: ReplicationConfig,
    synced_hook: Option<SyncedHook>,
}

impl<C: SyncClient> ReplicationEngine<C> {
    pub fn new(store: Arc<Mutex<DocumentStore>>, client: C, config: ReplicationConfig) -> Self {
        Self {
            store,
            client,
            config,
            synced_hook: None,
        }
    }

    pub fn with_synced_hook(mut self, hook: SyncedHook) -> Self {
        self.synced_hook = Some(hook);
        self
    }

    /// Pull every page newer than the local checkpoint. Returns the number
    /// of documents applied.
    pub async fn pull(&self, collection: &str) -> Result<usize, ReplicationError> {
        let mut total = 0;
        loop {
            let checkpoint = {
                let store = self.store.lock().expect("store lock");
                store.checkpoint(collection)?
            };
            let page = self
                .client
                .pull_page(collection, &checkpoint, self.config.pull_page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let count = page.len();
            {
                let store = self.store.lock().expect("store lock");
                store.apply_remote_batch(collection, &page)?;
            }
            total += count;
            tracing::debug!(collection, count, "applied pull page");
            if count < self.config.pull_page_size {
                break;
            }
        }
        Ok(total)
    }

    /// Push dirty documents in batches, oldest first. Documents are marked
    /// clean only after the server acknowledges the batch.
    pub async fn push(&self, collection: &str) -> Result<usize, ReplicationError> {
        let mut total = 0;
        loop {
            let docs = {
                let store = self.store.lock().expect("store lock");
                store.dirty_docs(collection, self.config.push_batch_size)?
            };
            if docs.is_empty() {
                break;
            }
            self.client.push_batch(collection, &docs).await?;
            let ids: Vec<String> = docs
                .iter()
                .filter_map(|d| d.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            {
                let store = self.store.lock().expect("store lock");
                store.mark_clean(collection, &ids)?;
            }
            total += docs.len();
            tracing::debug!(collection, count = docs.len(), "pushed dirty batch");
            if docs.len() < self.config.push_batch_size {
                break;
            }
        }
        Ok(total)
    }

    /// One full pass over a collection according to its replication mode.
    /// Push runs before pull so a remote copy of our own write cannot race
    /// a still-dirty local one.
    pub async fn sync_collection(&self, collection: &str) -> Result<SyncOutcome, ReplicationError> {
        let mode = {
            let store = self.store.lock().expect("store lock");
            store
                .synced_collections()
                .iter()
                .find(|s| s.name == collection)
                .map(|s| s.replication)
        };
        let mut outcome = SyncOutcome::default();
        match mode {
            None | Some(ReplicationMode::None) => {
                tracing::debug!(collection, "not a synced collection, skipping");
                return Ok(outcome);
            }
            Some(ReplicationMode::PullOnly) => {
                outcome.pulled = self.pull(collection).await?;
            }
            Some(ReplicationMode::PushPull) => {
                outcome.pushed = self.push(collection).await?;
                outcome.pulled = self.pull(collection).await?;
            }
        }
        if let Some(hook) = &self.synced_hook {
            hook(collection);
        }
        Ok(outcome)
    }

    /// Bring every synced collection up to date. Collections flagged for
    /// background initial sync are skipped here; the caller spawns them.
    pub async fn initial_sync(&self) -> Result<(), ReplicationError> {
        let specs = {
            let store = self.store.lock().expect("store lock");
            store.synced_collections()
        };
        for spec in specs.iter().filter(|s| !s.background_initial) {
            let outcome = self.sync_collection(&spec.name).await?;
            tracing::info!(
                collection = %spec.name,
                pushed = outcome.pushed,
                pulled = outcome.pulled,
                "initial sync",
            );
        }
        Ok(())
    }

    /// React to a server change notification. New content may reference
    /// dictionary entries the local store has not seen yet, so the
    /// dictionary syncs before the content list.
    pub async fn handle_notice(&self, notice: &ChangeNotice) -> Result<SyncOutcome, ReplicationError> {
        if notice.collection == CONTENTS {
            self.sync_collection(DEFINITIONS).await?;
        }
        self.sync_collection(&notice.collection).await
    }

    /// Periodic catch-up for polled collections, and a safety net for live
    /// ones when the notification channel is down. Never returns; sync
    /// failures are logged and retried on the next tick.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.poll_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let specs = {
                let store = self.store.lock().expect("store lock");
                store.synced_collections()
            };
            for spec in specs {
                if let Err(e) = self.sync_collection(&spec.name).await {
                    tracing::warn!(collection = %spec.name, error = %e, "poll sync failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Checkpoint, CollectionSpec, Selector};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned pages keyed by pull index; records pushes.
    struct FakeClient {
        pages: Vec<Vec<Value>>,
        pulls: AtomicUsize,
        pushed: Mutex<Vec<Value>>,
        fail_pushes: bool,
    }

    impl FakeClient {
        fn with_pages(pages: Vec<Vec<Value>>) -> Self {
            Self {
                pages,
                pulls: AtomicUsize::new(0),
                pushed: Mutex::new(Vec::new()),
                fail_pushes: false,
            }
        }
    }

    impl SyncClient for FakeClient {
        async fn pull_page(
            &self,
            _collection: &str,
            _checkpoint: &Checkpoint,
            _limit: usize,
        ) -> Result<Vec<Value>, ReplicationError> {
            let i = self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(i).cloned().unwrap_or_default())
        }

        async fn push_batch(
            &self,
            _collection: &str,
            docs: &[Value],
        ) -> Result<(), ReplicationError> {
            if self.fail_pushes {
                return Err(ReplicationError::Server("unavailable".to_string()));
            }
            self.pushed.lock().expect("lock").extend_from_slice(docs);
            Ok(())
        }
    }

    fn store_with(spec: CollectionSpec) -> Arc<Mutex<DocumentStore>> {
        let mut store = DocumentStore::open_in_memory().unwrap();
        store.add_collection(spec, None).unwrap();
        Arc::new(Mutex::new(store))
    }

    fn small_config() -> ReplicationConfig {
        ReplicationConfig {
            pull_page_size: 2,
            push_batch_size: 2,
            ..ReplicationConfig::default()
        }
    }

    #[tokio::test]
    async fn pull_pages_until_short_page() {
        let store = store_with(CollectionSpec::new("words", 1, ReplicationMode::PullOnly));
        let client = FakeClient::with_pages(vec![
            vec![
                json!({"id": "a", "updatedAt": 1, "deleted": false}),
                json!({"id": "b", "updatedAt": 2, "deleted": false}),
            ],
            vec![json!({"id": "c", "updatedAt": 3, "deleted": false})],
        ]);
        let engine = ReplicationEngine::new(store.clone(), client, small_config());
        let pulled = engine.pull("words").await.unwrap();
        assert_eq!(pulled, 3);
        assert_eq!(
            store.lock().unwrap().count("words", &Selector::all()).unwrap(),
            3
        );
        let checkpoint = store.lock().unwrap().checkpoint("words").unwrap();
        assert_eq!(checkpoint.last_updated_at, 3);
    }

    #[tokio::test]
    async fn reapplied_page_is_idempotent() {
        let store = store_with(CollectionSpec::new("words", 1, ReplicationMode::PullOnly));
        let page = vec![
            json!({"id": "a", "updatedAt": 1, "deleted": false}),
            json!({"id": "b", "updatedAt": 2, "deleted": false}),
        ];
        let client = FakeClient::with_pages(vec![page.clone(), page]);
        let engine = ReplicationEngine::new(store.clone(), client, small_config());
        engine.pull("words").await.unwrap();
        assert_eq!(
            store.lock().unwrap().count("words", &Selector::all()).unwrap(),
            2
        );
        let checkpoint = store.lock().unwrap().checkpoint("words").unwrap();
        assert_eq!(checkpoint.last_updated_at, 2);
    }

    #[tokio::test]
    async fn push_drains_dirty_and_marks_clean() {
        let store = store_with(CollectionSpec::new("cards", 1, ReplicationMode::PushPull));
        {
            let s = store.lock().unwrap();
            for i in 0..3 {
                s.insert("cards", &json!({"id": format!("c{i}"), "updatedAt": i}))
                    .unwrap();
            }
        }
        let client = FakeClient::with_pages(vec![]);
        let engine = ReplicationEngine::new(store.clone(), client, small_config());
        let pushed = engine.push("cards").await.unwrap();
        assert_eq!(pushed, 3);
        assert_eq!(engine.client.pushed.lock().unwrap().len(), 3);
        assert!(store.lock().unwrap().dirty_docs("cards", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_push_leaves_documents_dirty() {
        let store = store_with(CollectionSpec::new("cards", 1, ReplicationMode::PushPull));
        store
            .lock()
            .unwrap()
            .insert("cards", &json!({"id": "c1", "updatedAt": 1}))
            .unwrap();
        let mut client = FakeClient::with_pages(vec![]);
        client.fail_pushes = true;
        let engine = ReplicationEngine::new(store.clone(), client, small_config());
        assert!(engine.push("cards").await.is_err());
        assert_eq!(store.lock().unwrap().dirty_docs("cards", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn synced_hook_runs_after_every_sync_path() {
        let store = store_with(CollectionSpec::new("cards", 1, ReplicationMode::PushPull));
        let client = FakeClient::with_pages(vec![vec![
            json!({"id": "670-3", "updatedAt": 1, "deleted": false}),
        ]]);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let engine = ReplicationEngine::new(store, client, small_config()).with_synced_hook(
            Arc::new(move |collection| {
                fired_clone.lock().expect("lock").push(collection.to_string())
            }),
        );

        engine.sync_collection("cards").await.unwrap();
        engine
            .handle_notice(&ChangeNotice {
                collection: "cards".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["cards", "cards"]);
    }

    #[tokio::test]
    async fn synced_hook_skips_failed_and_unknown_syncs() {
        let store = store_with(CollectionSpec::new("cards", 1, ReplicationMode::PushPull));
        store
            .lock()
            .unwrap()
            .insert("cards", &json!({"id": "c1", "updatedAt": 1}))
            .unwrap();
        let mut client = FakeClient::with_pages(vec![]);
        client.fail_pushes = true;
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let engine = ReplicationEngine::new(store, client, small_config()).with_synced_hook(
            Arc::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(engine.sync_collection("cards").await.is_err());
        engine.sync_collection("no_such").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sync_skips_unknown_collections() {
        let store = store_with(CollectionSpec::new("words", 1, ReplicationMode::PullOnly));
        let client = FakeClient::with_pages(vec![]);
        let engine = ReplicationEngine::new(store, client, small_config());
        let outcome = engine.sync_collection("no_such").await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
    }
}
