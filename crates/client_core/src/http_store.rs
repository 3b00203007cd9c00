use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, User, UserId},
    error::ApiError,
    protocol::{CreateMessageRequest, MarkReadRequest, MessageRecord, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::store::{MessageQuery, MessageStore, SnapshotFeed, UserDirectory};

const FEED_BUFFER: usize = 4;

/// Message store and user directory served by the `server` binary over HTTP,
/// with change notifications pushed over a WebSocket.
#[derive(Clone)]
pub struct HttpMessageStore {
    http: Client,
    base_url: Url,
}

impl HttpMessageStore {
    pub fn new(server_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("server_url cannot be used as a base: {server_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn ws_url(&self, user_id: &UserId) -> Result<Url> {
        let mut url = self.endpoint(&["ws"])?;
        let scheme = if self.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.base_url))?;
        url.query_pairs_mut().append_pair("user_id", user_id.as_str());
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .with_context(|| format!("invalid {what} response"));
    }
    Err(api_failure(response, what).await)
}

async fn api_failure(response: Response, what: &str) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(err) => anyhow::Error::new(err).context(format!("{what} failed with {status}")),
        Err(_) => anyhow!("{what} failed with {status}"),
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessageId> {
        let response = self
            .http
            .post(self.endpoint(&["messages"])?)
            .json(&request)
            .send()
            .await
            .context("create message request failed")?;
        let record: MessageRecord = decode(response, "create message").await?;
        Ok(record.id)
    }

    async fn mark_read(&self, message_id: MessageId, reader: &UserId) -> Result<()> {
        let id = message_id.0.to_string();
        let response = self
            .http
            .post(self.endpoint(&["messages", &id, "read"])?)
            .json(&MarkReadRequest {
                user_id: reader.clone(),
            })
            .send()
            .await
            .context("mark read request failed")?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(api_failure(response, "mark read").await)
    }

    async fn fetch_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let response = self
            .http
            .get(self.endpoint(&["messages"])?)
            .query(&[
                ("participant", query.participant.as_str()),
                ("order", query.order.as_query_value()),
            ])
            .send()
            .await
            .context("list messages request failed")?;
        decode(response, "list messages").await
    }

    /// Connects the change feed before reading the initial snapshot so that
    /// no change between the two can be missed.
    async fn open_feed(&self, query: &MessageQuery) -> Result<SnapshotFeed> {
        let ws_url = self.ws_url(&query.participant)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();
        let initial = self.fetch_messages(query).await?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let store = self.clone();
        let query = query.clone();
        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = ws_reader.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        let event = match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                warn!(error = %err, "ignoring invalid server event");
                                continue;
                            }
                        };
                        if !event.touches_messages_of(&query.participant) {
                            continue;
                        }
                        let snapshot = store.fetch_messages(&query).await;
                        let failed = snapshot.is_err();
                        if tx.send(snapshot).await.is_err() || failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx.send(Err(anyhow!("change feed closed by server"))).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = tx
                            .send(Err(
                                anyhow::Error::new(err).context("change feed receive failed")
                            ))
                            .await;
                        break;
                    }
                }
            }
            debug!(participant = %query.participant, "change feed reader stopped");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl UserDirectory for HttpMessageStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        let response = self
            .http
            .get(self.endpoint(&["users"])?)
            .send()
            .await
            .context("list users request failed")?;
        decode(response, "list users").await
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        let response = self
            .http
            .get(self.endpoint(&["users", user_id.as_str()])?)
            .send()
            .await
            .context("get user request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response, "get user").await.map(Some)
    }
}

#[cfg(test)]
#[path = "tests/http_store_tests.rs"]
mod tests;
