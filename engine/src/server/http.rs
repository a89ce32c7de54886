//! [`DocServer`] over HTTP and WebSocket, talking to `docsync-server`.

use super::wire::{
    decode_bytes, encode_bytes, ClocksResponse, PullResponse, PushRequest, PushResponse, ServerMessage,
    CONNECTION_HEADER,
};
use super::{DocServer, PullResult, ServerUpdate};
use crate::clock::ServerClock;
use crate::error::Result;
use crate::{DocId, Error};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const SUBSCRIPTION_BUFFER: usize = 256;

fn network(err: impl std::fmt::Display) -> Error {
    Error::Network(err.to_string())
}

/// Map an unsuccessful response to an engine error.
fn status_error(status: StatusCode, body: String) -> Error {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY => Error::ServerRejected(message),
        _ => Error::Network(message),
    }
}

/// HTTP client for one workspace on a `docsync-server`.
pub struct HttpDocServer {
    client: reqwest::Client,
    base_url: String,
    workspace_id: String,
    token: Option<String>,
    page_size: i64,
    subscription: Mutex<Option<JoinHandle<()>>>,
    /// Id the server assigned to the current WebSocket
    connection_id: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for HttpDocServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDocServer")
            .field("base_url", &self.base_url)
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}

impl HttpDocServer {
    /// `base_url` is the server root, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>, workspace_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            workspace_id: workspace_id.into(),
            token: None,
            page_size: 100,
            subscription: Mutex::new(None),
            connection_id: Arc::new(Mutex::new(None)),
        })
    }

    /// Send `token` as bearer credentials.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn updates_url(&self, doc_id: &str) -> String {
        format!(
            "{}/workspaces/{}/docs/{}/updates",
            self.base_url, self.workspace_id, doc_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self.authorize(request).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        response.json::<T>().await.map_err(network)
    }

    fn stop_subscription(&self) {
        let handle = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        *self.connection_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl DocServer for HttpDocServer {
    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    async fn wait_for_connection(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), String::new()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, update), fields(len = update.len()))]
    async fn push(&self, doc_id: &str, update: &[u8], since: Option<ServerClock>) -> Result<ServerClock> {
        let body = PushRequest {
            update: encode_bytes(update),
            since: since.map(|clock| clock.value()),
        };
        let mut request = self.client.post(self.updates_url(doc_id)).json(&body);
        let connection_id = self
            .connection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(connection_id) = connection_id {
            request = request.header(CONNECTION_HEADER, connection_id);
        }
        let response: PushResponse = self.send(request).await?;
        Ok(ServerClock::new(response.clock))
    }

    #[tracing::instrument(skip(self))]
    async fn pull(&self, doc_id: &str, since: Option<ServerClock>) -> Result<PullResult> {
        let mut query: Vec<(&str, String)> = vec![("limit", self.page_size.to_string())];
        if let Some(since) = since {
            query.push(("since", since.value().to_string()));
        }
        let response: PullResponse = self
            .send(self.client.get(self.updates_url(doc_id)).query(&query))
            .await?;

        let updates = response
            .updates
            .iter()
            .map(|update| decode_bytes(update).map_err(network))
            .collect::<Result<Vec<_>>>()?;
        Ok(PullResult {
            updates,
            clock: ServerClock::new(response.clock),
            has_more: response.has_more,
        })
    }

    async fn load_server_clocks(
        &self,
        after: Option<ServerClock>,
    ) -> Result<Option<HashMap<DocId, ServerClock>>> {
        let url = format!("{}/workspaces/{}/clocks", self.base_url, self.workspace_id);
        let query: Vec<(&str, String)> = after
            .map(|after| vec![("after", after.value().to_string())])
            .unwrap_or_default();
        let response: ClocksResponse = self.send(self.client.get(url).query(&query)).await?;
        Ok(Some(
            response
                .clocks
                .into_iter()
                .map(|(doc_id, clock)| (doc_id, ServerClock::new(clock)))
                .collect(),
        ))
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<ServerUpdate>>> {
        self.stop_subscription();

        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let url = format!("{ws_base}/workspaces/{}/ws", self.workspace_id);
        let mut request = url.into_client_request().map_err(network)?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(network)?;
            request.headers_mut().insert("authorization", value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request).await.map_err(network)?;
        let (_, mut incoming) = socket.split();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let connection_id = self.connection_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = incoming.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let update = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::ServerUpdate {
                        doc_id, update, clock, ..
                    }) => match decode_bytes(&update) {
                        Ok(update) => ServerUpdate {
                            doc_id,
                            update,
                            clock: ServerClock::new(clock),
                        },
                        Err(err) => {
                            tracing::warn!(doc_id, error = %err, "dropping undecodable server update");
                            continue;
                        }
                    },
                    Ok(ServerMessage::Connected { connection_id: id }) => {
                        tracing::debug!(connection_id = %id, "server subscription connected");
                        *connection_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
                        continue;
                    }
                    Ok(ServerMessage::Error { message }) => {
                        tracing::warn!(message, "server reported error");
                        continue;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "unknown server message");
                        continue;
                    }
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
            tracing::debug!("server subscription closed");
        });
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Some(rx))
    }

    async fn disconnect(&self) {
        self.stop_subscription();
    }
}

impl Drop for HttpDocServer {
    fn drop(&mut self) {
        self.stop_subscription();
    }
}
