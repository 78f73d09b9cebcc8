//! WebSocket bridge exposing the signer protocol on localhost.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};

use crate::channel::{MessageReceiver, MessageSender, drive_session};
use crate::issuer::{DelegationIssuer, StatusSender};
use crate::provider::ProviderKey;
use crate::signer::SignerSession;

#[derive(Clone)]
struct AppState {
    issuer: Arc<DelegationIssuer>,
    provider: ProviderKey,
    ic: bool,
}

pub struct ServeOptions {
    pub port: u16,
    pub provider: ProviderKey,
    pub ic: bool,
}

pub async fn serve(issuer: Arc<DelegationIssuer>, options: ServeOptions) -> Result<()> {
    let state = AppState {
        issuer,
        provider: options.provider,
        ic: options.ic,
    };
    let app = Router::new()
        .route("/signer", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind(("127.0.0.1", options.port))
        .await
        .with_context(|| format!("Failed to bind 127.0.0.1:{}", options.port))?;
    info!(
        "signer listening on ws://{}/signer",
        listener.local_addr()?
    );
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // Native relying parties cannot set an Origin header, so a query
    // parameter works as well; the header wins when both are present.
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.get("origin").cloned());
    let Some(origin) = origin else {
        return (StatusCode::BAD_REQUEST, "Could not determine app origin.").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, origin))
}

async fn handle_socket(socket: WebSocket, state: AppState, origin: String) {
    info!(origin, "relying party connected");
    let (status_tx, status_rx) = unbounded_channel();
    let session = SignerSession::new(
        state.issuer,
        state.provider,
        origin.clone(),
        state.ic,
        StatusSender::new(status_tx),
    );
    let (sink, stream) = socket.split();
    let mut sender = WsSender(sink);
    let mut receiver = WsReceiver(stream);
    if let Err(error) = drive_session(&session, status_rx, &mut sender, &mut receiver).await {
        warn!(origin, "session ended with error: {error:#}");
    } else {
        info!(origin, "relying party disconnected");
    }
}

struct WsSender(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSender for WsSender {
    async fn send(&mut self, message: Value) -> Result<()> {
        use futures::SinkExt;
        self.0
            .send(Message::Text(message.to_string().into()))
            .await
            .map_err(|error| anyhow!("Failed to send frame: {error}"))
    }
}

struct WsReceiver(SplitStream<WebSocket>);

#[async_trait]
impl MessageReceiver for WsReceiver {
    async fn recv(&mut self) -> Result<Option<String>> {
        while let Some(frame) = self.0.next().await {
            match frame {
                Ok(Message::Text(text)) => return Ok(Some(text.to_string())),
                Ok(Message::Close(_)) => return Ok(None),
                // Pings are answered by axum itself.
                Ok(_) => continue,
                Err(error) => return Err(anyhow!("Failed to read frame: {error}")),
            }
        }
        Ok(None)
    }
}
