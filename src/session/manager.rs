use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::credential::{Credential, CredentialStore};
use crate::notification::service::NotificationService;
use crate::notification::store::Action;
use crate::websocket::notifications::{channel_url, spawn_subscriber, LiveHandle};

/// Where and how to open the live channel for a session.
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub base_url: Url,
    pub path: String,
    pub heartbeat: Duration,
}

struct ActiveSession {
    token: String,
    live: Option<LiveHandle>,
}

/// Drives the notification core from credential changes.
///
/// A new credential starts a session: the store is reset, one history fetch
/// is issued and one live channel is opened. Losing the credential ends it:
/// the store is reset and the channel closed. In-flight fetches are not
/// cancelled; the reset makes their results stale.
pub struct SessionManager {
    service: NotificationService,
    credentials: CredentialStore,
    live: Option<LiveSettings>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        service: NotificationService,
        credentials: CredentialStore,
        live: Option<LiveSettings>,
    ) -> Self {
        Self {
            service,
            credentials,
            live,
            active: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &NotificationService {
        &self.service
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start a session for `credential` unless it is already the active one.
    pub async fn start(&self, credential: Credential) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.token == credential.token() {
                debug!("Credential unchanged, keeping current session");
                return;
            }
        }

        if let Some(previous) = active.take() {
            info!("Credential changed, ending previous notification session");
            Self::close_live(previous).await;
        }

        if self.credentials.bearer().as_deref() != Some(credential.token()) {
            self.credentials.set(credential.clone());
        }
        let store = self.service.store();
        store.dispatch(Action::Reset);
        info!(
            "Starting notification session for user {}",
            credential.user_id()
        );

        let loader = self.service.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.load().await {
                warn!("Initial notification load did not apply: {}", e);
            }
        });

        let live = self.live.as_ref().and_then(|settings| {
            match channel_url(&settings.base_url, &settings.path, credential.token()) {
                Ok(url) => Some(spawn_subscriber(
                    url,
                    credential.user_id().to_string(),
                    settings.heartbeat,
                    store.clone(),
                )),
                Err(e) => {
                    error!("Cannot open live channel: {}", e);
                    None
                }
            }
        });

        *active = Some(ActiveSession {
            token: credential.token().to_string(),
            live,
        });
    }

    /// End the current session. Safe to call when no session is active.
    pub async fn end(&self) {
        let mut active = self.active.lock().await;
        self.credentials.clear();
        self.service.store().dispatch(Action::Reset);

        if let Some(session) = active.take() {
            info!("Notification session ended");
            Self::close_live(session).await;
        }
    }

    async fn close_live(session: ActiveSession) {
        if let Some(live) = session.live {
            live.close().await;
        }
    }

    /// Follow the credential holder until it is dropped, then end the session.
    pub async fn run(&self, mut credentials: watch::Receiver<Option<Credential>>) {
        loop {
            let current = credentials.borrow_and_update().clone();
            match current {
                Some(credential) => self.start(credential).await,
                None => {
                    if self.is_active().await {
                        self.end().await;
                    }
                }
            }

            if credentials.changed().await.is_err() {
                break;
            }
        }
        self.end().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::tests::issue_token;
    use crate::notification::api::MockNotificationApi;
    use crate::notification::model::RawNotification;
    use crate::notification::store::{LoadPhase, NotificationStore};
    use crate::notification::testing::GatedApi;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

    fn history() -> Vec<RawNotification> {
        vec![serde_json::from_value(json!({ "id": "a", "type": "message", "content": "hi" })).unwrap()]
    }

    fn credential(user: &str) -> Credential {
        Credential::parse(&issue_token(user, None, 3600)).unwrap()
    }

    fn manager_with(api: Arc<GatedApi>) -> (SessionManager, NotificationStore, CredentialStore) {
        let store = NotificationStore::new();
        let credentials = CredentialStore::new();
        let service = NotificationService::new(api, store.clone(), credentials.clone());
        (
            SessionManager::new(service, credentials.clone(), None),
            store,
            credentials,
        )
    }

    #[tokio::test]
    async fn test_start_loads_once_per_credential() {
        let api = Arc::new(GatedApi::new(history()));
        api.open();
        let (manager, store, _credentials) = manager_with(api.clone());

        // Starting twice with the same token is a no-op
        let cred = credential("u1");
        manager.start(cred.clone()).await;
        manager.start(cred).await;

        let mut rx = store.subscribe();
        rx.wait_for(|s| s.phase == LoadPhase::Loaded).await.unwrap();
        assert_eq!(store.snapshot().ids(), vec!["a"]);
        assert_eq!(api.calls(), 1);
        assert!(manager.is_active().await);
    }

    #[tokio::test]
    async fn test_logout_during_fetch_is_terminal() {
        let api = Arc::new(GatedApi::new(history()));
        let (manager, store, credentials) = manager_with(api.clone());

        manager.start(credential("u1")).await;
        api.wait_for_calls(1).await;
        assert_eq!(store.snapshot().phase, LoadPhase::Loading);

        // Logout, then let the held fetch finish
        manager.end().await;
        assert!(credentials.current().is_none());
        api.open();

        // Give the late fetch a chance to complete.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = store.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.phase, LoadPhase::Empty);
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn test_no_credential_no_fetch() {
        let mut api = MockNotificationApi::new();
        api.expect_fetch_history().never();
        let store = NotificationStore::new();
        let credentials = CredentialStore::new();
        let service = NotificationService::new(Arc::new(api), store.clone(), credentials.clone());
        let manager = Arc::new(SessionManager::new(service, credentials.clone(), None));

        let runner = {
            let manager = manager.clone();
            let rx = credentials.subscribe();
            tokio::spawn(async move { manager.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.snapshot().is_empty());
        assert!(!manager.is_active().await);
        runner.abort();
    }

    #[tokio::test]
    async fn test_run_follows_credential_changes() {
        let api = Arc::new(GatedApi::new(history()));
        api.open();
        let (manager, store, credentials) = manager_with(api.clone());
        let manager = Arc::new(manager);

        let runner = {
            let manager = manager.clone();
            let rx = credentials.subscribe();
            tokio::spawn(async move { manager.run(rx).await })
        };

        credentials.set(credential("u1"));
        let mut rx = store.subscribe();
        rx.wait_for(|s| s.phase == LoadPhase::Loaded).await.unwrap();
        assert_eq!(api.calls(), 1);

        // Logout empties the list
        credentials.clear();
        rx.wait_for(|s| s.phase == LoadPhase::Empty && s.is_empty())
            .await
            .unwrap();

        // A new user triggers a fresh fetch
        credentials.set(credential("u2"));
        rx.wait_for(|s| s.phase == LoadPhase::Loaded).await.unwrap();
        assert_eq!(api.calls(), 2);

        runner.abort();
    }

    #[tokio::test]
    async fn test_end_does_not_hang_on_unresponsive_live_server() {
        // The listener is never accepted from, so the handshake never completes
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let api = Arc::new(GatedApi::new(history()));
        api.open();
        let store = NotificationStore::new();
        let credentials = CredentialStore::new();
        let service = NotificationService::new(api, store.clone(), credentials.clone());
        let live = LiveSettings {
            base_url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            path: "/ws".to_string(),
            heartbeat: Duration::from_secs(30),
        };
        let manager = SessionManager::new(service, credentials, Some(live));

        manager.start(credential("u1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Logout must finish even though the channel never connected
        tokio::time::timeout(Duration::from_secs(3), manager.end())
            .await
            .expect("logout hung waiting for the live channel task");
        assert!(!manager.is_active().await);
        assert!(store.snapshot().is_empty());

        drop(listener);
    }

    #[tokio::test]
    async fn test_session_opens_and_closes_live_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                match message {
                    Message::Text(text) => {
                        let _ = events_tx.send(text);
                        let push = json!({
                            "event": "new-notification",
                            "data": { "id": "b", "type": "system", "content": "meeting" }
                        });
                        socket.send(Message::Text(push.to_string())).await.unwrap();
                    }
                    Message::Close(_) => {
                        let _ = events_tx.send("<close>".to_string());
                        break;
                    }
                    _ => {}
                }
            }
        });

        let api = Arc::new(GatedApi::new(history()));
        api.open();
        let store = NotificationStore::new();
        let credentials = CredentialStore::new();
        let service = NotificationService::new(api, store.clone(), credentials.clone());
        let live = LiveSettings {
            base_url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            path: "/ws".to_string(),
            heartbeat: Duration::from_secs(30),
        };
        let manager = SessionManager::new(service, credentials, Some(live));

        manager.start(credential("u1")).await;
        let join = events_rx.recv().await.unwrap();
        assert!(join.contains("join-notification-room"));
        assert!(join.contains("u1"));

        let mut rx = store.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.get("a").is_some() && s.get("b").is_some()),
        )
        .await
        .expect("history and live records should both land")
        .unwrap();

        manager.end().await;
        assert_eq!(events_rx.recv().await.as_deref(), Some("<close>"));
        assert!(store.snapshot().is_empty());
    }
}
