//! Wire client for pull/push replication.
//!
//! The server exposes one GraphQL feed query per collection of shape
//! `feed<Collection>(id, updatedAt, limit)` and one `set<Collection>`
//! mutation for pushes.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::http::HttpSession;
use crate::replication::ReplicationError;
use crate::store::Checkpoint;

/// Transport seam for the replication engine. The production implementation
/// talks GraphQL over HTTP; tests feed pages directly.
pub trait SyncClient: Send + Sync {
    fn pull_page(
        &self,
        collection: &str,
        checkpoint: &Checkpoint,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Value>, ReplicationError>> + Send;

    fn push_batch(
        &self,
        collection: &str,
        docs: &[Value],
    ) -> impl Future<Output = Result<(), ReplicationError>> + Send;
}

pub struct GraphQlClient {
    http: Arc<HttpSession>,
}

impl GraphQlClient {
    pub fn new(http: Arc<HttpSession>) -> Self {
        Self { http }
    }

    /// Run one GraphQL request, recovering once from an expired token.
    async fn execute(&self, payload: Value) -> Result<Value, ReplicationError> {
        let resp = self
            .http
            .fetch_json("/api/v1/graphql", Some(&payload), 2)
            .await?;
        match graphql_errors(&resp) {
            Some(message) if is_auth_expired(&message) => {
                tracing::info!("replication token expired, refreshing and re-arming");
                self.http
                    .refresh_access_token()
                    .await
                    .map_err(|e| ReplicationError::AuthExpired(e.to_string()))?;
                let resp = self
                    .http
                    .fetch_json("/api/v1/graphql", Some(&payload), 2)
                    .await?;
                match graphql_errors(&resp) {
                    Some(message) => Err(ReplicationError::Server(message)),
                    None => Ok(resp),
                }
            }
            Some(message) => Err(ReplicationError::Server(message)),
            None => Ok(resp),
        }
    }
}

impl SyncClient for GraphQlClient {
    async fn pull_page(
        &self,
        collection: &str,
        checkpoint: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<Value>, ReplicationError> {
        let field = feed_field(collection);
        let query = format!(
            "query {{ {field}(id: \"{}\", updatedAt: {}, limit: {}) {{ {} }} }}",
            escape(&checkpoint.last_id),
            checkpoint.last_updated_at,
            limit,
            selection(collection),
        );
        let resp = self.execute(serde_json::json!({ "query": query })).await?;
        resp.get("data")
            .and_then(|d| d.get(&field))
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::Parse(format!("missing data.{field} in pull response"))
            })
    }

    async fn push_batch(
        &self,
        collection: &str,
        docs: &[Value],
    ) -> Result<(), ReplicationError> {
        let field = set_field(collection);
        let input_type = format!("[{}Input!]!", pascal_case(collection));
        let query = format!(
            "mutation {field}($docs: {input_type}) {{ {field}(docs: $docs) {{ ok }} }}"
        );
        let payload = serde_json::json!({
            "query": query,
            "variables": { "docs": docs },
        });
        self.execute(payload).await?;
        Ok(())
    }
}

fn feed_field(collection: &str) -> String {
    format!("feed{}", pascal_case(collection))
}

fn set_field(collection: &str) -> String {
    format!("set{}", pascal_case(collection))
}

fn pascal_case(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Per-collection GraphQL selection set.
fn selection(collection: &str) -> &'static str {
    match collection {
        "definitions" => {
            "id graph sound providerTranslations { provider posTranslations { pos values } } \
             synonyms { pos values } frequency { wcpm wcdp } levels updatedAt deleted"
        }
        "characters" => "id structure radical strokeCount updatedAt deleted",
        "word_model_stats" => "id nbSeen nbChecked lastSeen lastChecked updatedAt deleted",
        "contents" => "id title author contentType lang processing updatedAt deleted",
        "cards" => {
            "id interval repetition efactor dueDate known suspended firstRevisionDate \
             lastRevisionDate firstSuccessDate updatedAt deleted"
        }
        _ => "id updatedAt deleted",
    }
}

fn graphql_errors(resp: &Value) -> Option<String> {
    let errors = resp.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Token-expiry signature check on a replication error message.
pub fn is_auth_expired(message: &str) -> bool {
    message.contains("Signature has expired") || message.contains("token_not_valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn field_names_follow_collection_names() {
        assert_eq!(feed_field("cards"), "feedCards");
        assert_eq!(feed_field("word_model_stats"), "feedWordModelStats");
        assert_eq!(set_field("cards"), "setCards");
    }

    #[test]
    fn cursor_ids_are_escaped() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }

    #[test]
    fn auth_expiry_signature() {
        assert!(is_auth_expired("Signature has expired"));
        assert!(is_auth_expired("error: token_not_valid"));
        assert!(!is_auth_expired("some other failure"));
    }
}
