use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::{sync::oneshot, task::JoinHandle, time};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::notification::model::RawNotification;
use crate::notification::store::{Action, DispatchOutcome, NotificationStore};

pub const JOIN_EVENT: &str = "join-notification-room";
pub const NEW_NOTIFICATION_EVENT: &str = "new-notification";

// How long `LiveHandle::close` waits for the task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Frame exchanged on the live channel
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn join(user_id: &str) -> Self {
        Self {
            event: JOIN_EVENT.to_string(),
            data: Value::String(user_id.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Build the live channel URL from the REST base URL.
pub fn channel_url(base: &Url, path: &str, token: &str) -> Result<Url, LiveError> {
    let mut url = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| LiveError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(LiveError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| LiveError::InvalidUrl(format!("cannot switch {} to {}", base, scheme)))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// What happened to one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Pushed(String),
    Stale,
    Ignored,
}

/// Translate an inbound text frame into a store mutation for session `epoch`.
pub fn apply_frame(store: &NotificationStore, epoch: u64, text: &str) -> FrameOutcome {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Ignoring malformed live frame: {}", e);
            return FrameOutcome::Ignored;
        }
    };

    if envelope.event != NEW_NOTIFICATION_EVENT {
        debug!("Ignoring live event {}", envelope.event);
        return FrameOutcome::Ignored;
    }

    let record = serde_json::from_value::<RawNotification>(envelope.data)
        .map_err(|e| e.to_string())
        .and_then(|raw| raw.normalize_live(Utc::now()).map_err(|e| e.to_string()));
    let record = match record {
        Ok(record) => record,
        Err(e) => {
            warn!("Ignoring invalid live notification: {}", e);
            return FrameOutcome::Ignored;
        }
    };

    let id = record.id.clone();
    match store.dispatch_for(epoch, Action::PushLive(record)) {
        DispatchOutcome::Stale => FrameOutcome::Stale,
        _ => {
            info!("New notification {} received", id);
            FrameOutcome::Pushed(id)
        }
    }
}

/// Handle to a running live channel subscription.
///
/// Dropping the handle without calling [`LiveHandle::close`] aborts the task.
pub struct LiveHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LiveHandle {
    /// Close the channel and wait for the subscriber task to finish.
    ///
    /// A task that does not stop within the grace period is aborted, so
    /// this never waits on a stalled connection.
    pub async fn close(mut self) {
        // Ask the task to send a close frame and stop
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        match time::timeout(CLOSE_GRACE, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if !e.is_cancelled() {
                    error!("Live channel task failed: {}", e);
                }
            }
            Err(_) => {
                warn!("Live channel did not stop in time, aborting it");
                self.task.abort();
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

/// Connect to the live channel and feed pushed notifications into `store`.
///
/// The subscription belongs to the store's current session; events arriving
/// after a reset are dropped.
pub fn spawn_subscriber(
    url: Url,
    user_id: String,
    heartbeat: Duration,
    store: NotificationStore,
) -> LiveHandle {
    let epoch = store.epoch();
    let (tx, rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        if let Err(e) = run_subscriber(url, &user_id, heartbeat, &store, epoch, rx).await {
            error!("Live channel for user {} ended: {}", user_id, e);
        }
    });

    LiveHandle {
        shutdown: Some(tx),
        task,
    }
}

async fn run_subscriber(
    url: Url,
    user_id: &str,
    heartbeat: Duration,
    store: &NotificationStore,
    epoch: u64,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), LiveError> {
    // The handshake can stall, so teardown must be able to interrupt it
    let socket = tokio::select! {
        _ = &mut shutdown => {
            info!("Live channel for user {} closed before connecting", user_id);
            return Ok(());
        }
        connected = connect_async(url.as_str()) => connected?.0,
    };
    info!("Live channel connected for user {}", user_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Announce the user so the server routes their notifications here
    let join = serde_json::to_string(&Envelope::join(user_id))?;
    ws_sender.send(Message::Text(join)).await?;

    let mut interval = time::interval(heartbeat);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Closing live channel for user {}", user_id);
                if let Err(e) = ws_sender.send(Message::Close(None)).await {
                    debug!("Error sending close frame: {}", e);
                }
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(vec![])).await {
                    error!("Error sending heartbeat: {}", e);
                    return Err(e.into());
                }
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if apply_frame(store, epoch, &text) == FrameOutcome::Stale {
                        debug!("Session ended, stopping live channel");
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received pong from server");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Live channel closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
