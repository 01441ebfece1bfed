//! Durable event outbox.
//!
//! Analytics and study events are queued in a local-only collection and
//! flushed to the server on a fixed interval. Events are deleted only after
//! an acknowledged flush, so delivery is at-least-once; a flush failure is
//! swallowed and the same events go out on the next tick. Duplicate delivery
//! after a failed acknowledgement is possible and the server is assumed to
//! tolerate it.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use crate::collections::EVENT_QUEUE;
use crate::config::OutboxConfig;
use crate::http::{HttpError, HttpSession};
use crate::store::{DocumentStore, Selector, SortSpec, StoreError};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// Destination for flushed events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, events: &[Value]) -> impl Future<Output = Result<(), OutboxError>> + Send;
}

/// Posts events to the server's ingestion endpoint.
pub struct HttpEventSink {
    http: Arc<HttpSession>,
}

impl HttpEventSink {
    pub fn new(http: Arc<HttpSession>) -> Self {
        Self { http }
    }
}

impl EventSink for HttpEventSink {
    async fn deliver(&self, events: &[Value]) -> Result<(), OutboxError> {
        let body = Value::Array(events.to_vec());
        let resp = self
            .http
            .fetch_json("/api/v1/data/user_events", Some(&body), 2)
            .await
            .map_err(|e: HttpError| OutboxError::Delivery(e.to_string()))?;
        match resp.get("status").and_then(Value::as_str) {
            Some("success") => Ok(()),
            other => Err(OutboxError::Delivery(format!(
                "server status {:?}",
                other.unwrap_or("missing")
            ))),
        }
    }
}

pub struct EventOutbox<S: EventSink> {
    store: Arc<Mutex<DocumentStore>>,
    sink: S,
    config: OutboxConfig,
}

impl<S: EventSink> EventOutbox<S> {
    pub fn new(store: Arc<Mutex<DocumentStore>>, sink: S, config: OutboxConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Queue one event (or an array of events, stored as a single document
    /// and flattened at flush time). The event gets a fresh id; on the
    /// astronomically unlikely collision the id is regenerated.
    pub fn submit(&self, event: &Value) -> Result<String, OutboxError> {
        let store = self.store.lock().expect("store lock");
        for _ in 0..5 {
            let id = uuid::Uuid::new_v4().to_string();
            let mut doc = serde_json::json!({ "id": id, "event": event });
            doc["queuedAt"] = Value::from(crate::store::now_ms());
            match store.insert(EVENT_QUEUE, &doc) {
                Ok(()) => return Ok(id),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // repeated v4 collisions mean the id source is broken
        Err(StoreError::DataIntegrity("event id generation collided repeatedly".to_string()).into())
    }

    /// Deliver up to `max_batch` queued events, oldest first. Queued arrays
    /// are flattened into the outgoing batch. Exactly the flushed documents
    /// are removed on success.
    pub async fn flush(&self) -> Result<usize, OutboxError> {
        let docs = {
            let store = self.store.lock().expect("store lock");
            store.find(
                EVENT_QUEUE,
                &Selector::all(),
                Some(SortSpec::asc("queuedAt")),
                Some(self.config.max_batch),
            )?
        };
        if docs.is_empty() {
            return Ok(0);
        }

        let mut events = Vec::new();
        let mut flushed_ids = Vec::new();
        for doc in &docs {
            if let Some(id) = doc.get("id").and_then(Value::as_str) {
                flushed_ids.push(id.to_string());
            }
            match doc.get("event") {
                Some(Value::Array(items)) => events.extend(items.iter().cloned()),
                Some(event) => events.push(event.clone()),
                None => {}
            }
        }

        self.sink.deliver(&events).await?;

        {
            let store = self.store.lock().expect("store lock");
            store.bulk_remove(EVENT_QUEUE, &flushed_ids)?;
        }
        tracing::debug!(count = events.len(), "flushed event batch");
        Ok(events.len())
    }

    pub fn pending(&self) -> Result<usize, OutboxError> {
        let store = self.store.lock().expect("store lock");
        Ok(store.count(EVENT_QUEUE, &Selector::all())?)
    }

    /// Flush on a fixed interval forever. Failures are logged and the
    /// events stay queued for the next tick.
    pub async fn run(self: Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.flush_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "event flush failed, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionSpec, ReplicationMode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        delivered: Mutex<Vec<Value>>,
        fail_next: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    impl EventSink for RecordingSink {
        async fn deliver(&self, events: &[Value]) -> Result<(), OutboxError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(OutboxError::Delivery("offline".to_string()));
            }
            self.delivered
                .lock()
                .expect("lock")
                .extend_from_slice(events);
            Ok(())
        }
    }

    fn outbox_with(config: OutboxConfig) -> EventOutbox<RecordingSink> {
        let mut store = DocumentStore::open_in_memory().unwrap();
        store
            .add_collection(
                CollectionSpec::new(EVENT_QUEUE, 1, ReplicationMode::None),
                None,
            )
            .unwrap();
        EventOutbox::new(Arc::new(Mutex::new(store)), RecordingSink::new(), config)
    }

    #[tokio::test]
    async fn flush_delivers_and_drains() {
        let outbox = outbox_with(OutboxConfig::default());
        outbox.submit(&json!({"verb": "practiced"})).unwrap();
        outbox.submit(&json!({"verb": "read"})).unwrap();
        let flushed = outbox.flush().await.unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(outbox.pending().unwrap(), 0);
        assert_eq!(outbox.sink.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn queued_arrays_are_flattened() {
        let outbox = outbox_with(OutboxConfig::default());
        outbox
            .submit(&json!([{"verb": "a"}, {"verb": "b"}]))
            .unwrap();
        let flushed = outbox.flush().await.unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(outbox.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_events_for_retry() {
        let outbox = outbox_with(OutboxConfig::default());
        outbox.submit(&json!({"verb": "practiced"})).unwrap();
        outbox.sink.fail_next.store(true, Ordering::SeqCst);
        assert!(outbox.flush().await.is_err());
        assert_eq!(outbox.pending().unwrap(), 1);

        // next tick redelivers the same event
        let flushed = outbox.flush().await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(outbox.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_honors_batch_limit() {
        let outbox = outbox_with(OutboxConfig {
            max_batch: 2,
            ..OutboxConfig::default()
        });
        for i in 0..3 {
            outbox.submit(&json!({"n": i})).unwrap();
        }
        assert_eq!(outbox.flush().await.unwrap(), 2);
        assert_eq!(outbox.pending().unwrap(), 1);
        assert_eq!(outbox.flush().await.unwrap(), 1);
    }
}
