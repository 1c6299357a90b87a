use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::auth::credential::CredentialStore;
use crate::notification::api::NotificationApi;
use crate::notification::model::{normalize_history, NotificationError};
use crate::notification::store::{Action, DispatchOutcome, NotificationStore};

/// History loader and read-state reconciler for the signed-in user.
///
/// Every mutation waits for the backend to confirm before touching the store,
/// so a failed call leaves local state exactly as it was.
#[derive(Clone)]
pub struct NotificationService {
    api: Arc<dyn NotificationApi>,
    store: NotificationStore,
    credentials: CredentialStore,
}

impl NotificationService {
    pub fn new(
        api: Arc<dyn NotificationApi>,
        store: NotificationStore,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            api,
            store,
            credentials,
        }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    fn require_credential(&self) -> Result<(), NotificationError> {
        match self.credentials.current() {
            Some(_) => Ok(()),
            None => Err(NotificationError::NotAuthenticated),
        }
    }

    // Apply a confirmed change unless the session it belongs to has ended.
    fn apply(&self, epoch: u64, action: Action) -> Result<(), NotificationError> {
        match self.store.dispatch_for(epoch, action) {
            DispatchOutcome::Stale => Err(NotificationError::SessionEnded),
            _ => Ok(()),
        }
    }

    /// Fetch the persisted history and replace the list with it.
    ///
    /// Returns the number of records loaded.
    pub async fn load(&self) -> Result<usize, NotificationError> {
        self.require_credential()?;

        // Mark loading and remember where live pushes stood
        let ticket = self.store.begin_load();
        let raw = match self.api.fetch_history().await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to fetch notifications: {}", e);
                self.store.dispatch(Action::LoadFailed { ticket });
                return Err(e);
            }
        };

        // Drop malformed records before they reach the store
        let records = normalize_history(raw, Utc::now());
        let count = records.len();
        match self.store.dispatch(Action::LoadCompleted { ticket, records }) {
            DispatchOutcome::Stale => {
                info!("Discarding notification history fetched for an ended session");
                Err(NotificationError::SessionEnded)
            }
            _ => {
                info!("Loaded {} notifications", count);
                Ok(count)
            }
        }
    }

    /// Re-fetch history under the current credential.
    pub async fn refresh(&self) -> Result<usize, NotificationError> {
        debug!("Refreshing notifications");
        self.load().await
    }

    pub async fn mark_one_read(&self, id: &str) -> Result<(), NotificationError> {
        self.require_credential()?;
        let epoch = self.store.epoch();

        // Wait for the backend before flipping the local flag
        if let Err(e) = self.api.mark_read(id).await {
            error!("Failed to mark notification {} as read: {}", id, e);
            return Err(e);
        }
        self.apply(epoch, Action::MarkRead(id.to_string()))
    }

    pub async fn mark_all_read(&self) -> Result<(), NotificationError> {
        self.require_credential()?;

        // Nothing to mark, skip the round trip
        if self.store.snapshot().is_empty() {
            debug!("No notifications to mark as read");
            return Ok(());
        }
        let epoch = self.store.epoch();

        if let Err(e) = self.api.mark_all_read().await {
            error!("Failed to mark all notifications as read: {}", e);
            return Err(e);
        }
        self.apply(epoch, Action::MarkAllRead)
    }

    pub async fn clear_one(&self, id: &str) -> Result<(), NotificationError> {
        self.require_credential()?;
        let epoch = self.store.epoch();

        if let Err(e) = self.api.clear(id).await {
            error!("Failed to clear notification {}: {}", id, e);
            return Err(e);
        }
        self.apply(epoch, Action::Remove(id.to_string()))
    }

    pub async fn clear_all(&self) -> Result<(), NotificationError> {
        self.require_credential()?;
        let epoch = self.store.epoch();

        if let Err(e) = self.api.clear_all().await {
            error!("Failed to clear notifications: {}", e);
            return Err(e);
        }
        self.apply(epoch, Action::Clear)
    }

    /// Dismiss the "new notification" flag once the UI has shown it.
    pub fn acknowledge_new(&self) {
        self.store.dispatch(Action::AcknowledgeNew);
    }
}
