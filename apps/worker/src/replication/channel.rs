//! Live change notifications over a WebSocket subscription.
//!
//! The supervisor owns a transport and drives a small reconnect state
//! machine. Dropped connections are retried with a floor delay so a
//! flapping server cannot turn the client into a reconnect storm; missed
//! notifications are harmless because the poll loop catches up anyway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_websockets::{ClientBuilder, MaybeTlsStream, Message, WebSocketStream};

use crate::credentials::CredentialStore;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("subscription connect failed: {0}")]
    Connect(String),

    #[error("subscription protocol error: {0}")]
    Protocol(String),
}

/// A server-side change to one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: String,
}

/// Transport seam for the supervisor. `next_notice` returning `Ok(None)`
/// means the peer closed the stream cleanly.
pub trait NotificationTransport: Send {
    fn connect(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn next_notice(
        &mut self,
    ) -> impl Future<Output = Result<Option<ChangeNotice>, ChannelError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Disconnected,
    Connecting,
    Subscribed,
}

pub struct ChannelSupervisor<T> {
    transport: T,
    retry_floor: Duration,
    notices: mpsc::Sender<ChangeNotice>,
    state: ChannelState,
}

impl<T: NotificationTransport> ChannelSupervisor<T> {
    pub fn new(transport: T, retry_floor: Duration, notices: mpsc::Sender<ChangeNotice>) -> Self {
        Self {
            transport,
            retry_floor,
            notices,
            state: ChannelState::Connecting,
        }
    }

    /// Drive the channel until the notice receiver is dropped.
    pub async fn run(mut self) {
        loop {
            match self.state {
                ChannelState::Disconnected => {
                    tokio::time::sleep(self.retry_floor).await;
                    self.state = ChannelState::Connecting;
                }
                ChannelState::Connecting => match self.transport.connect().await {
                    Ok(()) => {
                        tracing::info!("subscription channel connected");
                        self.state = ChannelState::Subscribed;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "subscription connect failed");
                        self.state = ChannelState::Disconnected;
                    }
                },
                ChannelState::Subscribed => match self.transport.next_notice().await {
                    Ok(Some(notice)) => {
                        tracing::debug!(collection = %notice.collection, "change notice");
                        if self.notices.send(notice).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("subscription channel closed by peer");
                        self.state = ChannelState::Disconnected;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "subscription channel failed");
                        self.state = ChannelState::Disconnected;
                    }
                },
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Production transport: a GraphQL subscription over `wss://{host}/subscriptions`.
pub struct WebSocketTransport {
    url: String,
    creds: Arc<dyn CredentialStore>,
    ws: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(url: &str, creds: Arc<dyn CredentialStore>) -> Self {
        Self {
            url: url.to_string(),
            creds,
            ws: None,
        }
    }
}

impl NotificationTransport for WebSocketTransport {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        let uri: http::Uri = self
            .url
            .parse()
            .map_err(|e| ChannelError::Connect(format!("bad subscription url: {e}")))?;
        let (mut ws, _) = ClientBuilder::from_uri(uri)
            .connect()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let token = self.creds.access_token().unwrap_or_default();
        let query = format!(
            "subscription {{ collectionChanged(token: \"{}\") {{ name }} }}",
            token.replace('"', "")
        );
        let start = serde_json::json!({
            "type": "start",
            "payload": { "query": query },
        });
        ws.send(Message::text(start.to_string()))
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        self.ws = Some(ws);
        Ok(())
    }

    async fn next_notice(&mut self) -> Result<Option<ChangeNotice>, ChannelError> {
        loop {
            let ws = self
                .ws
                .as_mut()
                .ok_or_else(|| ChannelError::Protocol("not connected".to_string()))?;
            match ws.next().await {
                None => {
                    self.ws = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.ws = None;
                    return Err(ChannelError::Protocol(e.to_string()));
                }
                Some(Ok(msg)) => {
                    // keepalives and non-text frames carry no notices
                    if let Some(text) = msg.as_text() {
                        if let Some(notice) = parse_notice(text) {
                            return Ok(Some(notice));
                        }
                    }
                }
            }
        }
    }
}

/// Extract the changed collection name from a subscription data frame.
fn parse_notice(text: &str) -> Option<ChangeNotice> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let data = frame
        .get("payload")
        .and_then(|p| p.get("data"))
        .or_else(|| frame.get("data"))?;
    for value in data.as_object()?.values() {
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            return Some(ChangeNotice {
                collection: name.to_string(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Scripted transport: each step is one connect or notice outcome.
    enum Step {
        ConnectOk,
        ConnectFail,
        Notice(&'static str),
        Closed,
    }

    struct ScriptedTransport {
        steps: Mutex<Vec<Step>>,
    }

    impl ScriptedTransport {
        fn new(mut steps: Vec<Step>) -> Self {
            steps.reverse();
            Self {
                steps: Mutex::new(steps),
            }
        }

        fn pop(&self) -> Option<Step> {
            self.steps.lock().expect("lock").pop()
        }
    }

    impl NotificationTransport for ScriptedTransport {
        async fn connect(&mut self) -> Result<(), ChannelError> {
            match self.pop() {
                Some(Step::ConnectOk) => Ok(()),
                Some(Step::ConnectFail) | None => {
                    Err(ChannelError::Connect("refused".to_string()))
                }
                Some(other) => {
                    self.steps.lock().expect("lock").push(other);
                    Ok(())
                }
            }
        }

        async fn next_notice(&mut self) -> Result<Option<ChangeNotice>, ChannelError> {
            match self.pop() {
                Some(Step::Notice(name)) => Ok(Some(ChangeNotice {
                    collection: name.to_string(),
                })),
                Some(Step::Closed) | None => Ok(None),
                Some(other) => {
                    self.steps.lock().expect("lock").push(other);
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn notice_parses_subscription_data_frame() {
        let text = r#"{"type":"data","payload":{"data":{"collectionChanged":{"name":"cards"}}}}"#;
        assert_eq!(
            parse_notice(text),
            Some(ChangeNotice {
                collection: "cards".to_string()
            })
        );
        assert_eq!(parse_notice(r#"{"type":"ka"}"#), None);
        assert_eq!(parse_notice("not json"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_reconnects_after_drop() {
        let transport = ScriptedTransport::new(vec![
            Step::ConnectOk,
            Step::Notice("cards"),
            Step::Closed,
            Step::ConnectFail,
            Step::ConnectOk,
            Step::Notice("contents"),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let supervisor = ChannelSupervisor::new(transport, Duration::from_secs(5), tx);
        let handle = tokio::spawn(supervisor.run());

        assert_eq!(rx.recv().await.unwrap().collection, "cards");
        assert_eq!(rx.recv().await.unwrap().collection, "contents");
        drop(rx);
        handle.abort();
    }
}
