use dotenv::dotenv;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use welfare_notification_sync::auth::credential::{Credential, CredentialStore};
use welfare_notification_sync::config::AppConfig;
use welfare_notification_sync::console;
use welfare_notification_sync::notification::api::HttpNotificationApi;
use welfare_notification_sync::notification::service::NotificationService;
use welfare_notification_sync::notification::store::NotificationStore;
use welfare_notification_sync::notification::views::{BadgeView, DashboardTile};
use welfare_notification_sync::session::manager::{LiveSettings, SessionManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    tracing_subscriber::fmt::init();

    // Load .env file if it exists
    dotenv().ok();

    let config = AppConfig::from_env()?;
    info!("Using welfare backend at {}", config.server_url);

    let credentials = CredentialStore::new();
    let store = NotificationStore::new();
    let api = HttpNotificationApi::new(
        config.server_url.clone(),
        credentials.clone(),
        config.request_timeout,
    )?;
    let service = NotificationService::new(Arc::new(api), store.clone(), credentials.clone());
    let manager = Arc::new(SessionManager::new(
        service,
        credentials.clone(),
        Some(LiveSettings {
            base_url: config.server_url.clone(),
            path: config.live_path.clone(),
            heartbeat: config.heartbeat,
        }),
    ));

    // Start and stop sessions as the credential changes
    let session_task = {
        let manager = manager.clone();
        let rx = credentials.subscribe();
        tokio::spawn(async move { manager.run(rx).await })
    };

    // Log badge updates the way the topbar would render them
    let badge_task = {
        let manager = manager.clone();
        let mut badge = BadgeView::mount(&store);
        let tile = DashboardTile::mount(&store);
        tokio::spawn(async move {
            while let Some(unread) = badge.changed().await {
                let summary = tile.summary();
                info!(
                    "Notifications: {} unread of {} ({} messages, {} system)",
                    unread, summary.total, summary.unread_messages, summary.unread_system
                );
                if badge.has_new() {
                    if let Some(latest) = summary.latest {
                        info!("New {} notification: {}", latest.kind.as_str(), latest.content);
                    }
                    manager.service().acknowledge_new();
                }
            }
        })
    };

    match config.access_token.as_deref() {
        Some(token) => match Credential::parse(token) {
            Ok(credential) => {
                info!(
                    "Signing in as user {} ({})",
                    credential.user_id(),
                    credential.role().map(|r| r.as_str()).unwrap_or("no role")
                );
                credentials.set(credential);
            }
            Err(e) => error!("ACCESS_TOKEN rejected: {}", e),
        },
        None => warn!("ACCESS_TOKEN not set, no notification session will start"),
    }

    // Operator commands drive the reconciler until stdin closes or Ctrl-C
    info!("{}", console::HELP);
    let console_task = {
        let manager = manager.clone();
        let credentials = credentials.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            console::run(stdin, manager.service(), &credentials).await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down notification session");

    console_task.abort();
    manager.end().await;
    session_task.abort();
    badge_task.abort();

    Ok(())
}
