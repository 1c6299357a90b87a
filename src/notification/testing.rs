//! Backend double whose calls block until the test opens a gate.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::watch;

use crate::notification::api::NotificationApi;
use crate::notification::model::{NotificationError, RawNotification};

pub(crate) struct GatedApi {
    history: Mutex<Vec<RawNotification>>,
    gate: watch::Sender<bool>,
    calls: watch::Sender<usize>,
}

impl GatedApi {
    pub(crate) fn new(history: Vec<RawNotification>) -> Self {
        let (gate, _) = watch::channel(false);
        let (calls, _) = watch::channel(0);
        Self {
            history: Mutex::new(history),
            gate,
            calls,
        }
    }

    pub(crate) fn open(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn close(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    pub(crate) async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|calls| *calls >= count).await;
    }

    async fn pass(&self) {
        let mut rx = self.gate.subscribe();
        self.calls.send_modify(|calls| *calls += 1);
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl NotificationApi for GatedApi {
    async fn fetch_history(&self) -> Result<Vec<RawNotification>, NotificationError> {
        self.pass().await;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn mark_read(&self, _id: &str) -> Result<(), NotificationError> {
        self.pass().await;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), NotificationError> {
        self.pass().await;
        Ok(())
    }

    async fn clear(&self, _id: &str) -> Result<(), NotificationError> {
        self.pass().await;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), NotificationError> {
        self.pass().await;
        Ok(())
    }
}
