use tokio::sync::watch;

use crate::notification::model::{Notification, NotificationKind};
use crate::notification::store::{NotificationStore, StoreSnapshot};

// Consumers only hold a receiver; mounting one never triggers a fetch.

/// Unread badge shown in the navigation bar.
pub struct BadgeView {
    rx: watch::Receiver<StoreSnapshot>,
}

impl BadgeView {
    pub fn mount(store: &NotificationStore) -> Self {
        Self {
            rx: store.subscribe(),
        }
    }

    pub fn unread_count(&self) -> usize {
        self.rx.borrow().unread_count()
    }

    /// Whether a live notification arrived that the user has not acknowledged.
    pub fn has_new(&self) -> bool {
        self.rx.borrow().has_new
    }

    /// Wait for the next store change and return the new unread count.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn changed(&mut self) -> Option<usize> {
        self.rx.changed().await.ok()?;
        let count = self.rx.borrow_and_update().unread_count();
        Some(count)
    }
}

/// Dropdown list of the most recent notifications, newest first.
pub struct DropdownView {
    rx: watch::Receiver<StoreSnapshot>,
    limit: usize,
}

impl DropdownView {
    pub fn mount(store: &NotificationStore, limit: usize) -> Self {
        Self {
            rx: store.subscribe(),
            limit,
        }
    }

    pub fn items(&self) -> Vec<Notification> {
        self.rx
            .borrow()
            .records
            .iter()
            .take(self.limit)
            .cloned()
            .collect()
    }

    pub fn items_of(&self, kind: NotificationKind) -> Vec<Notification> {
        self.rx
            .borrow()
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .take(self.limit)
            .cloned()
            .collect()
    }

    pub fn hidden_count(&self) -> usize {
        self.rx.borrow().records.len().saturating_sub(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileSummary {
    pub total: usize,
    pub unread: usize,
    pub unread_messages: usize,
    pub unread_system: usize,
    pub latest: Option<Notification>,
}

/// Dashboard tile summarizing the notification list.
pub struct DashboardTile {
    rx: watch::Receiver<StoreSnapshot>,
}

impl DashboardTile {
    pub fn mount(store: &NotificationStore) -> Self {
        Self {
            rx: store.subscribe(),
        }
    }

    pub fn summary(&self) -> TileSummary {
        let snapshot = self.rx.borrow();
        TileSummary {
            total: snapshot.records.len(),
            unread: snapshot.unread_count(),
            unread_messages: snapshot.unread_of(NotificationKind::Message),
            unread_system: snapshot.unread_of(NotificationKind::System),
            latest: snapshot.records.first().cloned(),
        }
    }
}
