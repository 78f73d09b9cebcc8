//! Transport-agnostic message plumbing for a signer session: one receiver
//! for inbound frames, one sender for responses and status notifications.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::issuer::StatusUpdate;
use crate::signer::SignerSession;
use crate::signer::jsonrpc;

#[async_trait]
pub trait MessageSender: Send {
    async fn send(&mut self, message: Value) -> Result<()>;
}

/// Yields raw frames; parsing stays in the drive loop so malformed JSON can
/// be answered with a parse error instead of killing the connection.
#[async_trait]
pub trait MessageReceiver: Send {
    async fn recv(&mut self) -> Result<Option<String>>;
}

fn status_notification(update: StatusUpdate) -> Value {
    let params = match update {
        StatusUpdate::Loading(message) => json!({ "status": "loading", "message": message }),
        StatusUpdate::SigningIn(message) => json!({ "status": "signing-in", "message": message }),
        StatusUpdate::Ready => json!({ "status": "ready" }),
        StatusUpdate::Error(error) => json!({ "status": "error", "error": error }),
    };
    jsonrpc::notification("identify_status", params)
}

type InFlight<'a> = Pin<Box<dyn Future<Output = Option<Value>> + Send + 'a>>;

async fn in_flight_response(request: &mut Option<InFlight<'_>>) -> Option<Value> {
    match request.as_mut() {
        Some(request) => request.await,
        None => std::future::pending().await,
    }
}

/// Runs one session until the peer disconnects. The current request is
/// polled alongside the status channel so progress notifications go out
/// while a sign-in is still running, not after its response.
pub async fn drive_session(
    session: &SignerSession,
    mut status_rx: UnboundedReceiver<StatusUpdate>,
    sender: &mut dyn MessageSender,
    receiver: &mut dyn MessageReceiver,
) -> Result<()> {
    sender.send(session.hello()).await?;
    let mut in_flight: Option<InFlight<'_>> = None;
    loop {
        let busy = in_flight.is_some();
        tokio::select! {
            update = status_rx.recv() => {
                match update {
                    Some(update) => sender.send(status_notification(update)).await?,
                    None => break,
                }
            }
            response = in_flight_response(&mut in_flight) => {
                in_flight = None;
                // Progress queued during the request goes out ahead of its
                // response.
                while let Ok(update) = status_rx.try_recv() {
                    sender.send(status_notification(update)).await?;
                }
                if let Some(response) = response {
                    sender.send(response).await?;
                }
            }
            // One request at a time; the next frame waits until the current
            // one has been answered.
            frame = receiver.recv(), if !busy => {
                let Some(frame) = frame? else { break };
                let message: Value = match serde_json::from_str(&frame) {
                    Ok(message) => message,
                    Err(error) => {
                        sender
                            .send(jsonrpc::error_response(
                                None,
                                jsonrpc::PARSE_ERROR,
                                format!("Parse error: {error}"),
                            ))
                            .await?;
                        continue;
                    }
                };
                in_flight = Some(Box::pin(session.handle(message)));
            }
        }
    }
    debug!("session closed");
    Ok(())
}

/// In-process duplex used by tests: the returned halves plug into
/// [`drive_session`], the client struct plays the relying party.
pub fn local_pair() -> (LocalSender, LocalReceiver, LocalClient) {
    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (outbound_tx, outbound_rx) = unbounded_channel();
    (
        LocalSender(outbound_tx),
        LocalReceiver(inbound_rx),
        LocalClient {
            tx: inbound_tx,
            rx: outbound_rx,
        },
    )
}

pub struct LocalSender(UnboundedSender<Value>);

#[async_trait]
impl MessageSender for LocalSender {
    async fn send(&mut self, message: Value) -> Result<()> {
        let _ = self.0.send(message);
        Ok(())
    }
}

pub struct LocalReceiver(UnboundedReceiver<String>);

#[async_trait]
impl MessageReceiver for LocalReceiver {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.0.recv().await)
    }
}

pub struct LocalClient {
    pub tx: UnboundedSender<String>,
    pub rx: UnboundedReceiver<Value>,
}

impl LocalClient {
    pub fn send(&self, message: &Value) {
        let _ = self.tx.send(message.to_string());
    }

    /// Next non-notification frame.
    pub async fn response(&mut self) -> Option<Value> {
        while let Some(frame) = self.rx.recv().await {
            if frame.get("method").is_none() {
                return Some(frame);
            }
        }
        None
    }
}
