//! Offline-first sync worker for the language-learning client.
//!
//! One worker process owns the local document store, keeps it replicated
//! with the server, queues user-activity events for delivery, and runs the
//! spaced-repetition scheduler on behalf of every host context.

pub mod bootstrap;
pub mod collections;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod http;
pub mod messages;
pub mod outbox;
pub mod replication;
pub mod store;

pub use bootstrap::{BootstrapLoader, MessageKey, ProgressMessage};
pub use config::WorkerConfig;
pub use coordinator::{reset_shared_coordinator, shared_coordinator, Coordinator};
pub use messages::{dispatch, WorkerMessage, WorkerRequest, WorkerResponse};
pub use store::DocumentStore;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber, honoring `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
