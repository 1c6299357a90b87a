use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::auth::credential::CredentialStore;
use crate::notification::model::{HistoryResponse, NotificationError, RawNotification};

/// Backend operations on the current user's notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_history(&self) -> Result<Vec<RawNotification>, NotificationError>;

    async fn mark_read(&self, id: &str) -> Result<(), NotificationError>;

    async fn mark_all_read(&self) -> Result<(), NotificationError>;

    async fn clear(&self, id: &str) -> Result<(), NotificationError>;

    async fn clear_all(&self) -> Result<(), NotificationError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// REST client for `/api/notifications`, authenticated with the stored bearer token.
#[derive(Clone)]
pub struct HttpNotificationApi {
    client: Client,
    base_url: Url,
    credentials: CredentialStore,
}

impl HttpNotificationApi {
    pub fn new(
        base_url: Url,
        credentials: CredentialStore,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, NotificationError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                NotificationError::Transport(format!("Cannot build URL from {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "notifications"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, NotificationError> {
        let token = self
            .credentials
            .bearer()
            .ok_or(NotificationError::NotAuthenticated)?;
        let url = self.endpoint(segments)?;
        debug!("{} {}", method, url);
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, NotificationError> {
        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

async fn error_from_response(response: Response) -> NotificationError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.clone()
            }
        });

    warn!("Notification request failed with {}: {}", status, message);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => NotificationError::Unauthorized(message),
        _ => NotificationError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn fetch_history(&self) -> Result<Vec<RawNotification>, NotificationError> {
        let response = self.send(self.request(Method::GET, &[])?).await?;
        let history: HistoryResponse = response
            .json()
            .await
            .map_err(|e| NotificationError::Decode(e.to_string()))?;
        Ok(history.into_records())
    }

    async fn mark_read(&self, id: &str) -> Result<(), NotificationError> {
        self.send(self.request(Method::PUT, &[id, "read"])?).await?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), NotificationError> {
        self.send(self.request(Method::PUT, &["read-all"])?).await?;
        Ok(())
    }

    async fn clear(&self, id: &str) -> Result<(), NotificationError> {
        self.send(self.request(Method::DELETE, &[id])?).await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), NotificationError> {
        self.send(self.request(Method::DELETE, &[])?).await?;
        Ok(())
    }
}
