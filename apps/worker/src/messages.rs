//! Host message protocol.
//!
//! Host contexts talk to the worker with `{source, type, value}` messages.
//! Requests are a closed enum so an unknown `type` fails at deserialization
//! instead of falling through a stringly-typed default branch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use lexicore::{CardType, Grade};

use crate::coordinator::Coordinator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Originating context, echoed back so replies can be routed.
    pub source: String,
    #[serde(flatten)]
    pub request: WorkerRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum WorkerRequest {
    #[serde(rename_all = "camelCase")]
    Practice {
        word_id: String,
        card_type: i64,
        grade: i64,
    },
    GetKnownWords,
    #[serde(rename_all = "camelCase")]
    GetDueCards { now: i64, limit: usize },
    SubmitUserEvents(Value),
    ForceSync { collection: String },
    GetBootstrapPhase,
    ResetConnections,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerResponse {
    Ok { source: String, value: Value },
    Error { source: String, message: String },
}

impl WorkerResponse {
    fn ok(source: &str, value: Value) -> Self {
        Self::Ok {
            source: source.to_string(),
            value,
        }
    }

    fn error(source: &str, message: impl ToString) -> Self {
        Self::Error {
            source: source.to_string(),
            message: message.to_string(),
        }
    }
}

/// Route one host message to its operation and build the reply.
pub async fn dispatch(coordinator: &Arc<Coordinator>, message: WorkerMessage) -> WorkerResponse {
    let source = message.source;
    match message.request {
        WorkerRequest::Practice {
            word_id,
            card_type,
            grade,
        } => {
            let card_type = match u8::try_from(card_type).ok().and_then(CardType::from_value) {
                Some(ct) => ct,
                None => return WorkerResponse::error(&source, format!("bad card type {card_type}")),
            };
            let grade = match Grade::from_value(grade) {
                Ok(g) => g,
                Err(e) => return WorkerResponse::error(&source, e),
            };
            match coordinator.practice_card(&word_id, card_type, grade) {
                Ok(card) => match serde_json::to_value(&card) {
                    Ok(value) => WorkerResponse::ok(&source, value),
                    Err(e) => WorkerResponse::error(&source, e),
                },
                Err(e) => WorkerResponse::error(&source, e),
            }
        }
        WorkerRequest::GetKnownWords => match coordinator.known_words() {
            Ok(graphs) => {
                let mut sorted: Vec<&String> = graphs.iter().collect();
                sorted.sort();
                WorkerResponse::ok(&source, serde_json::json!(sorted))
            }
            Err(e) => WorkerResponse::error(&source, e),
        },
        WorkerRequest::GetDueCards { now, limit } => {
            match coordinator
                .due_cards(now, limit)
                .and_then(|cards| Ok(serde_json::to_value(&cards)?))
            {
                Ok(value) => WorkerResponse::ok(&source, value),
                Err(e) => WorkerResponse::error(&source, e),
            }
        }
        WorkerRequest::SubmitUserEvents(events) => match coordinator.submit_events(&events) {
            Ok(id) => WorkerResponse::ok(&source, serde_json::json!({ "queuedId": id })),
            Err(e) => WorkerResponse::error(&source, e),
        },
        WorkerRequest::ForceSync { collection } => {
            match coordinator.force_sync(&collection).await {
                Ok(()) => WorkerResponse::ok(&source, Value::Null),
                Err(e) => WorkerResponse::error(&source, e),
            }
        }
        WorkerRequest::GetBootstrapPhase => WorkerResponse::ok(
            &source,
            serde_json::json!(format!("{:?}", coordinator.bootstrap_phase())),
        ),
        WorkerRequest::ResetConnections => {
            coordinator.reset_connections();
            WorkerResponse::ok(&source, Value::Null)
        }
    }
}
