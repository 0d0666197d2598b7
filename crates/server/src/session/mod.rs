//! Generic streaming-session scaffold shared by the chat and notification
//! protocol handlers.
//!
//! One connection runs as: `Connecting → Authorized → Streaming → Closed`.
//! Streaming is two concurrent loops, inbound (client frames to command
//! dispatch) and outbound (pub/sub wake-ups to push), plus a single writer
//! task that owns the socket's send half. All frame producers, including
//! fire-and-forget command sub-tasks, queue through the writer, so no two
//! tasks ever interleave a frame. A shared [`CancellationToken`] ties the
//! loops together: either one terminating stops the others.

pub mod chat;
pub mod notifications;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{FanoutCache, Subscription};
use crate::error::Result;
use crate::models::WsEnvelope;

pub use chat::ChatSession;
pub use notifications::NotificationSession;

/// Frames queued per connection before backpressure on producers.
const FRAME_QUEUE: usize = 64;

/// The pub/sub subscribe step is the only per-command dependency call that
/// is retried; everything else fails fast and reports.
const SUBSCRIBE_RETRIES: u32 = 3;
const SUBSCRIBE_BACKOFF: Duration = Duration::from_millis(200);

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorized,
    Streaming,
    Closed,
}

/// Items the inbound half of a connection yields to the scaffold.
#[derive(Debug)]
pub enum Incoming {
    Frame(String),
    Closed,
}

/// Clonable handle through which every concurrent producer queues frames
/// for the single writer task.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<String>,
}

impl FrameSink {
    pub async fn send_json(&self, frame: &serde_json::Value) {
        if self.tx.send(frame.to_string()).await.is_err() {
            debug!("frame dropped, writer gone");
        }
    }

    pub async fn send_error(&self, message: &str) {
        self.send_json(&json!({ "error": message })).await;
    }
}

/// Domain strategy plugged into the scaffold: what to authorize, what the
/// initial snapshot is, how to react to wake-ups, and the command table.
#[async_trait]
pub trait SessionDomain: Send + Sync + 'static {
    /// Short label for logs.
    fn label(&self) -> &'static str;

    /// The wake-up channel this session subscribes to.
    fn channel(&self) -> String;

    /// `Connecting → Authorized`. An error closes the session before
    /// anything is streamed.
    async fn authorize(&self) -> Result<()>;

    /// Push the initial snapshot. Runs once, after authorization and before
    /// the subscription is opened.
    async fn initial_snapshot(&self, out: &FrameSink) -> Result<()>;

    /// React to one pub/sub wake-up. State is always re-queried; the marker
    /// carried no information.
    async fn on_wake(&self, out: &FrameSink) -> Result<()>;

    /// Handle one decoded command envelope. Slow side effects are spawned
    /// fire-and-forget so the inbound loop can accept the next frame;
    /// returned errors become error frames (or teardown when fatal).
    async fn dispatch(
        &self,
        action: &str,
        payload: serde_json::Value,
        out: &FrameSink,
    ) -> Result<()>;
}

/// Adapt an upgraded WebSocket into the `Sink`/`Stream` halves the scaffold
/// runs on. Close frames and read errors both surface as [`Incoming::Closed`].
pub fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<String, Error = axum::Error> + Send + Unpin + 'static,
    impl Stream<Item = Incoming> + Send + Unpin,
) {
    let (sink, stream) = socket.split();
    let tx = sink.with(|text: String| {
        future::ready(Ok::<WsMessage, axum::Error>(WsMessage::Text(text.into())))
    });
    let rx = stream.filter_map(|item| {
        future::ready(match item {
            Ok(WsMessage::Text(text)) => Some(Incoming::Frame(text.to_string())),
            Ok(WsMessage::Close(_)) | Err(_) => Some(Incoming::Closed),
            Ok(_) => None,
        })
    });
    (tx, rx)
}

/// Drive one streaming session to completion.
pub async fn run_session<D, Tx, Rx>(
    domain: Arc<D>,
    cache: Arc<dyn FanoutCache>,
    tx: Tx,
    mut rx: Rx,
) where
    D: SessionDomain,
    Tx: Sink<String> + Send + Unpin + 'static,
    Tx::Error: Send,
    Rx: Stream<Item = Incoming> + Send + Unpin,
{
    let conn_id = Uuid::new_v4();
    let label = domain.label();
    let mut state = SessionState::Connecting;
    debug!(%conn_id, label, ?state, "session opened");

    let (frame_tx, frame_rx) = mpsc::channel::<String>(FRAME_QUEUE);
    let out = FrameSink { tx: frame_tx };
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(writer_task(tx, frame_rx, cancel.clone()));

    // Connecting → Authorized
    if let Err(e) = domain.authorize().await {
        warn!(%conn_id, label, error = %e, "authorization failed");
        out.send_error(e.client_message()).await;
        finish(conn_id, label, cancel, out, None, writer).await;
        return;
    }
    state = SessionState::Authorized;
    debug!(%conn_id, label, ?state, "session authorized");

    // Authorized → Streaming: snapshot first, then the wake-up subscription.
    if let Err(e) = domain.initial_snapshot(&out).await {
        warn!(%conn_id, label, error = %e, "initial snapshot failed");
        out.send_error(e.client_message()).await;
        finish(conn_id, label, cancel, out, None, writer).await;
        return;
    }

    let subscription = match subscribe_with_retry(cache.as_ref(), &domain.channel()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(%conn_id, label, error = %e, "subscribe failed");
            out.send_error(e.client_message()).await;
            finish(conn_id, label, cancel, out, None, writer).await;
            return;
        }
    };
    state = SessionState::Streaming;
    debug!(%conn_id, label, ?state, "session streaming");

    let outbound = tokio::spawn(outbound_loop(
        domain.clone(),
        subscription,
        out.clone(),
        cancel.clone(),
    ));

    // Inbound loop: frames are processed in receipt order.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.next() => match item {
                Some(Incoming::Frame(text)) => {
                    if !handle_frame(domain.as_ref(), &text, &out).await {
                        break;
                    }
                }
                Some(Incoming::Closed) | None => break,
            },
        }
    }

    finish(conn_id, label, cancel, out, Some(outbound), writer).await;
}

/// Decode and dispatch one inbound frame. Returns `false` when the session
/// must tear down.
async fn handle_frame<D: SessionDomain>(domain: &D, text: &str, out: &FrameSink) -> bool {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => {
            out.send_error("Invalid message format").await;
            return true;
        }
    };

    match domain.dispatch(&envelope.kind, envelope.payload, out).await {
        Ok(()) => true,
        Err(e) if e.is_fatal() => {
            warn!(label = domain.label(), error = %e, "fatal command failure");
            false
        }
        Err(e) => {
            out.send_error(e.client_message()).await;
            true
        }
    }
}

/// Blocks on the subscription; every wake-up re-queries state through the
/// domain. Terminates when the shared token is cancelled or the
/// subscription dies.
async fn outbound_loop<D: SessionDomain>(
    domain: Arc<D>,
    mut subscription: Subscription,
    out: FrameSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            wake = subscription.recv() => match wake {
                Some(()) => {
                    if let Err(e) = domain.on_wake(&out).await {
                        if e.is_fatal() {
                            cancel.cancel();
                            break;
                        }
                        warn!(label = domain.label(), error = %e, "wake-up handling failed");
                        out.send_error(e.client_message()).await;
                    }
                }
                None => {
                    // Subscription lost; without wake-ups this session is blind.
                    cancel.cancel();
                    break;
                }
            },
        }
    }
}

/// Single owner of the socket's send half. Ends when every producer handle
/// is dropped; a write failure cancels the rest of the session.
async fn writer_task<Tx>(mut sink: Tx, mut rx: mpsc::Receiver<String>, cancel: CancellationToken)
where
    Tx: Sink<String> + Send + Unpin + 'static,
    Tx::Error: Send,
{
    while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
            cancel.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn subscribe_with_retry(cache: &dyn FanoutCache, channel: &str) -> Result<Subscription> {
    let mut attempt = 0;
    loop {
        match cache.subscribe(channel).await {
            Ok(subscription) => return Ok(subscription),
            Err(e) if attempt < SUBSCRIBE_RETRIES => {
                attempt += 1;
                warn!(channel, attempt, error = %e, "subscribe failed, retrying");
                tokio::time::sleep(SUBSCRIBE_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Closed is terminal: stop the loops, let the writer drain, release
/// everything.
async fn finish(
    conn_id: Uuid,
    label: &str,
    cancel: CancellationToken,
    out: FrameSink,
    outbound: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
) {
    cancel.cancel();
    if let Some(handle) = outbound {
        let _ = handle.await;
    }
    drop(out);
    let _ = writer.await;
    debug!(%conn_id, label, state = ?SessionState::Closed, "session closed");
}
