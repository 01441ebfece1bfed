//! Process-wide coordination.
//!
//! Many host contexts (tabs, extension panels) share one worker; the
//! coordinator guarantees exactly one open store, one replication engine
//! and one outbox exist, and owns the derived known-words cache. The cache
//! is only correct if every card mutation path invalidates it: local writes
//! go through `practice_card`, and every replicated card change (notice,
//! poll or forced sync) reaches the engine's post-sync hook.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lexicore::{practice, Card, CardType, CoreError, Grade};

use crate::bootstrap::{BootstrapError, BootstrapLoader, ProgressFn};
use crate::collections::{standard_collections, CARDS, DEFINITIONS};
use crate::config::WorkerConfig;
use crate::credentials::{CredentialStore, SqliteCredentialStore};
use crate::http::HttpSession;
use crate::outbox::{EventOutbox, HttpEventSink, OutboxError};
use crate::replication::channel::{ChannelSupervisor, WebSocketTransport};
use crate::replication::client::GraphQlClient;
use crate::replication::{ReplicationEngine, ReplicationError};
use crate::store::{DocumentStore, Selector, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazily computed set of graphs the learner currently knows.
///
/// Gates whether content gets glossed, so stale entries are a correctness
/// bug: every card mutation must call `invalidate`.
pub struct KnownWordsCache {
    graphs: Mutex<Option<Arc<HashSet<String>>>>,
}

impl KnownWordsCache {
    pub fn new() -> Self {
        Self {
            graphs: Mutex::new(None),
        }
    }

    pub fn invalidate(&self) {
        *self.graphs.lock().expect("cache lock") = None;
    }

    pub fn get_or_compute(
        &self,
        store: &Arc<Mutex<DocumentStore>>,
    ) -> Result<Arc<HashSet<String>>, StoreError> {
        if let Some(graphs) = self.graphs.lock().expect("cache lock").as_ref() {
            return Ok(graphs.clone());
        }
        let computed = Arc::new(compute_known_graphs(&store.lock().expect("store lock"))?);
        *self.graphs.lock().expect("cache lock") = Some(computed.clone());
        Ok(computed)
    }
}

impl Default for KnownWordsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A word counts as known once any of its cards is flagged known or has
/// ever passed a revision.
fn compute_known_graphs(store: &DocumentStore) -> Result<HashSet<String>, StoreError> {
    let mut word_ids = HashSet::new();
    let known = store.find(
        CARDS,
        &Selector::all().eq("known", Value::Bool(true)),
        None,
        None,
    )?;
    let passed = store.find(
        CARDS,
        &Selector::all().gt("firstSuccessDate", Value::from(0)),
        None,
        None,
    )?;
    for doc in known.iter().chain(passed.iter()) {
        if let Some(id) = doc.get("id").and_then(Value::as_str) {
            if let Some((word_id, _)) = id.rsplit_once('-') {
                word_ids.insert(word_id.to_string());
            }
        }
    }

    let mut graphs = HashSet::new();
    for word_id in &word_ids {
        if let Some(def) = store.find_by_id(DEFINITIONS, word_id)? {
            if let Some(graph) = def.get("graph").and_then(Value::as_str) {
                graphs.insert(graph.to_string());
            }
        }
    }
    Ok(graphs)
}

pub struct Coordinator {
    config: WorkerConfig,
    store: Arc<Mutex<DocumentStore>>,
    creds: Arc<dyn CredentialStore>,
    engine: Arc<ReplicationEngine<GraphQlClient>>,
    outbox: Arc<EventOutbox<HttpEventSink>>,
    loader: BootstrapLoader,
    known_words: Arc<KnownWordsCache>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: WorkerConfig, progress: ProgressFn) -> Result<Self, CoordinatorError> {
        let path = config.db_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut store = DocumentStore::open(&path)?;
        for spec in standard_collections(&config.lang) {
            store.add_collection(spec, None)?;
        }
        let store = Arc::new(Mutex::new(store));
        Ok(Self::with_store(config, store, progress))
    }

    /// Build a coordinator around an already-opened store.
    pub fn with_store(
        config: WorkerConfig,
        store: Arc<Mutex<DocumentStore>>,
        progress: ProgressFn,
    ) -> Self {
        let creds: Arc<dyn CredentialStore> =
            Arc::new(SqliteCredentialStore::new(store.clone()));
        let http = Arc::new(HttpSession::new(&config.base_url, creds.clone()));
        let known_words = Arc::new(KnownWordsCache::new());
        // every card sync invalidates through this hook, whichever path
        // (notice, poll, forced) ran it
        let cache = known_words.clone();
        let engine = Arc::new(
            ReplicationEngine::new(
                store.clone(),
                GraphQlClient::new(http.clone()),
                config.replication.clone(),
            )
            .with_synced_hook(Arc::new(move |collection| {
                if collection == CARDS {
                    cache.invalidate();
                }
            })),
        );
        let outbox = Arc::new(EventOutbox::new(
            store.clone(),
            HttpEventSink::new(http.clone()),
            config.outbox.clone(),
        ));
        let loader = BootstrapLoader::new(
            store.clone(),
            http,
            config.lang.clone(),
            progress,
        );
        Self {
            config,
            store,
            creds,
            engine,
            outbox,
            loader,
            known_words,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<Mutex<DocumentStore>> {
        self.store.clone()
    }

    pub fn credentials(&self) -> Arc<dyn CredentialStore> {
        self.creds.clone()
    }

    /// Bring the worker fully online: bootstrap if needed, run initial
    /// replication (the dictionary catches up in the background), then
    /// start the long-lived sync tasks.
    pub async fn start(self: &Arc<Self>, reinitialize: bool) -> Result<(), CoordinatorError> {
        self.loader.ensure_ready(reinitialize).await?;
        self.engine.initial_sync().await?;

        let mut tasks = self.tasks.lock().expect("tasks lock");

        let engine = self.engine.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = engine.sync_collection(DEFINITIONS).await {
                tracing::warn!(error = %e, "background dictionary sync failed");
            }
        }));

        tasks.push(tokio::spawn(self.engine.clone().run_poll_loop()));
        tasks.push(tokio::spawn(self.outbox.clone().run()));

        let (notice_tx, mut notice_rx) = mpsc::channel(32);
        let transport =
            WebSocketTransport::new(&self.config.subscriptions_url(), self.creds.clone());
        let supervisor = ChannelSupervisor::new(
            transport,
            std::time::Duration::from_secs(self.config.replication.channel_retry_floor_secs),
            notice_tx,
        );
        tasks.push(tokio::spawn(supervisor.run()));

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                if let Err(e) = this.engine.handle_notice(&notice).await {
                    tracing::warn!(
                        collection = %notice.collection,
                        error = %e,
                        "notice-triggered sync failed",
                    );
                }
            }
        }));

        tracing::info!("worker online");
        Ok(())
    }

    /// Grade one aspect of a word. The card is created lazily on first
    /// grading; the result is persisted, queued as a study event, and the
    /// known-words cache is invalidated.
    pub fn practice_card(
        &self,
        word_id: &str,
        card_type: CardType,
        grade: Grade,
    ) -> Result<Card, CoordinatorError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let now_secs = now_ms / 1000;
        let id = Card::compose_id(word_id, card_type);

        let current = {
            let store = self.store.lock().expect("store lock");
            store.find_by_id(CARDS, &id)?
        };
        let card = match current {
            Some(doc) => serde_json::from_value::<Card>(doc)?,
            None => Card::new(word_id, card_type, now_ms),
        };

        let updated = practice(&card, grade, self.config.failure_wait_secs, now_secs);
        let mut doc = serde_json::to_value(&updated)?;
        if let Some(obj) = doc.as_object_mut() {
            // let the store stamp a fresh replication timestamp
            obj.remove("updatedAt");
        }
        {
            let store = self.store.lock().expect("store lock");
            store.upsert(CARDS, &doc)?;
        }

        self.outbox.submit(&serde_json::json!({
            "type": "practice",
            "cardId": id,
            "grade": grade.to_value(),
            "timestamp": now_ms,
        }))?;
        self.known_words.invalidate();
        Ok(updated)
    }

    /// Graphs the learner currently knows, recomputed lazily after any
    /// card mutation.
    pub fn known_words(&self) -> Result<Arc<HashSet<String>>, CoordinatorError> {
        Ok(self.known_words.get_or_compute(&self.store)?)
    }

    /// Cards due for revision, oldest due first. Suspended and known cards
    /// never queue.
    pub fn due_cards(&self, now_secs: i64, limit: usize) -> Result<Vec<Card>, CoordinatorError> {
        let docs = {
            let store = self.store.lock().expect("store lock");
            store.find(
                CARDS,
                &Selector::all().lte("dueDate", Value::from(now_secs)),
                Some(crate::store::SortSpec::asc("dueDate")),
                None,
            )?
        };
        let mut cards = Vec::new();
        for doc in docs {
            let card: Card = serde_json::from_value(doc)?;
            if !card.suspended && !card.known {
                cards.push(card);
                if cards.len() == limit {
                    break;
                }
            }
        }
        Ok(cards)
    }

    pub fn submit_events(&self, events: &Value) -> Result<String, CoordinatorError> {
        Ok(self.outbox.submit(events)?)
    }

    pub async fn force_sync(&self, collection: &str) -> Result<(), CoordinatorError> {
        self.engine.sync_collection(collection).await?;
        Ok(())
    }

    pub fn bootstrap_phase(&self) -> crate::bootstrap::Phase {
        self.loader.phase()
    }

    /// Cancel all timers and subscriptions and drop the cache. The store
    /// handle itself is released when the last reference goes away.
    pub fn reset_connections(&self) {
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        self.known_words.invalidate();
        tracing::info!("connections reset");
    }
}

static SHARED: tokio::sync::Mutex<Option<Arc<Coordinator>>> = tokio::sync::Mutex::const_new(None);

/// The one coordinator for this process. The first caller performs the
/// full bootstrap/open while later callers wait on the same lock and then
/// share the finished instance.
pub async fn shared_coordinator(
    config: WorkerConfig,
    progress: ProgressFn,
) -> Result<Arc<Coordinator>, CoordinatorError> {
    let mut shared = SHARED.lock().await;
    if let Some(coordinator) = shared.as_ref() {
        return Ok(coordinator.clone());
    }
    let coordinator = Arc::new(Coordinator::new(config, progress)?);
    coordinator.start(false).await?;
    *shared = Some(coordinator.clone());
    Ok(coordinator)
}

/// Tear down the shared coordinator, e.g. on account switch. The next
/// `shared_coordinator` call starts fresh.
pub async fn reset_shared_coordinator() {
    let mut shared = SHARED.lock().await;
    if let Some(coordinator) = shared.take() {
        coordinator.reset_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_coordinator() -> Coordinator {
        let mut store = DocumentStore::open_in_memory().unwrap();
        for spec in standard_collections(&Default::default()) {
            store.add_collection(spec, None).unwrap();
        }
        let config = WorkerConfig::new("https://learn.example.com", "ada");
        Coordinator::with_store(config, Arc::new(Mutex::new(store)), Arc::new(|_| {}))
    }

    fn seed_definition(coordinator: &Coordinator, word_id: &str, graph: &str) {
        let store = coordinator.store();
        let store = store.lock().unwrap();
        store
            .apply_remote_batch(
                DEFINITIONS,
                &[json!({"id": word_id, "graph": graph, "updatedAt": 1, "deleted": false})],
            )
            .unwrap();
    }

    #[test]
    fn practice_creates_card_and_invalidates_cache() {
        let coordinator = test_coordinator();
        seed_definition(&coordinator, "670", "blue");

        assert!(coordinator.known_words().unwrap().is_empty());

        let card = coordinator
            .practice_card("670", CardType::Meaning, Grade::Good)
            .unwrap();
        assert_eq!(card.id, "670-3");
        assert_eq!(card.repetition, 1);

        let known = coordinator.known_words().unwrap();
        assert!(known.contains("blue"));

        // the graded card is persisted and queued for push
        let store = coordinator.store();
        let dirty = store.lock().unwrap().dirty_docs(CARDS, 10).unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(coordinator.outbox.pending().unwrap(), 1);
    }

    #[test]
    fn failed_grade_does_not_mark_known() {
        let coordinator = test_coordinator();
        seed_definition(&coordinator, "670", "blue");
        coordinator
            .practice_card("670", CardType::Meaning, Grade::Unknown)
            .unwrap();
        assert!(coordinator.known_words().unwrap().is_empty());
    }

    #[test]
    fn due_cards_skip_suspended_and_known() {
        let coordinator = test_coordinator();
        let store = coordinator.store();
        {
            let s = store.lock().unwrap();
            let mut due = serde_json::to_value(Card::new("1", CardType::Graph, 0)).unwrap();
            due["dueDate"] = json!(100);
            let mut suspended = serde_json::to_value(Card::new("2", CardType::Graph, 0)).unwrap();
            suspended["dueDate"] = json!(100);
            suspended["suspended"] = json!(true);
            for doc in [due, suspended] {
                s.upsert(CARDS, &doc).unwrap();
            }
        }
        let cards = coordinator.due_cards(200, 10).unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].word_id(), "1");
    }
}
