use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Closed set of notification kinds the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    System,
}

impl NotificationKind {
    pub fn from_str(kind: &str) -> Option<Self> {
        match kind.trim().to_lowercase().as_str() {
            "message" => Some(NotificationKind::Message),
            "system" => Some(NotificationKind::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::System => "system",
        }
    }
}

/// A well-formed notification record as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub content: String,
    pub read: bool,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub sender_id: Option<String>,
    pub media: Vec<String>,
}

/// Notification as the backend sends it, over HTTP or the live channel.
///
/// Field names vary between endpoints, so every field is optional here and
/// validated in [`RawNotification::normalize_history`] or
/// [`RawNotification::normalize_live`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNotification {
    #[serde(default, alias = "_id")]
    pub id: Option<Value>,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: Option<Value>,
    #[serde(default, alias = "message")]
    pub content: Option<Value>,
    #[serde(default, alias = "isRead", alias = "is_read")]
    pub read: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, rename = "createdAt", alias = "created_at")]
    pub created_at: Option<Value>,
    #[serde(default, rename = "requestId", alias = "request_id")]
    pub request_id: Option<Value>,
    #[serde(default, rename = "senderId", alias = "sender_id")]
    pub sender_id: Option<Value>,
    #[serde(default)]
    pub media: Option<Vec<Value>>,
}

/// History endpoint payload: either a bare list or a wrapped one.
///
/// Elements stay untyped until [`HistoryResponse::into_records`] so one
/// ill-shaped record cannot fail the whole list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HistoryResponse {
    List(Vec<Value>),
    Wrapped {
        #[serde(alias = "data")]
        notifications: Vec<Value>,
    },
}

impl HistoryResponse {
    pub fn into_records(self) -> Vec<RawNotification> {
        let values = match self {
            HistoryResponse::List(values) => values,
            HistoryResponse::Wrapped { notifications } => notifications,
        };

        values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<RawNotification>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable notification from history: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngressError {
    #[error("Notification has no identifier")]
    MissingId,

    #[error("Unknown notification kind: {0:?}")]
    UnknownKind(Option<String>),
}

impl RawNotification {
    /// Normalize a record returned by the history endpoint.
    ///
    /// The primary `timestamp` wins over `createdAt`; a record with neither
    /// is stamped with `received_at`.
    pub fn normalize_history(
        self,
        received_at: DateTime<Utc>,
    ) -> Result<Notification, IngressError> {
        let id = self
            .id
            .as_ref()
            .and_then(identifier)
            .ok_or(IngressError::MissingId)?;
        let kind = parse_kind(self.kind)?;
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(parse_instant)
            .or_else(|| self.created_at.as_ref().and_then(parse_instant))
            .unwrap_or(received_at);

        Ok(Notification {
            id,
            kind,
            content: text(self.content),
            read: self.read.as_ref().map(flag).unwrap_or(false),
            timestamp,
            request_id: self.request_id.as_ref().and_then(identifier),
            sender_id: self.sender_id.as_ref().and_then(identifier),
            media: media_refs(self.media),
        })
    }

    /// Complete a partial record pushed on the live channel.
    ///
    /// Live events are always unread and carry the local receive time.
    pub fn normalize_live(self, received_at: DateTime<Utc>) -> Result<Notification, IngressError> {
        let kind = parse_kind(self.kind)?;
        let id = self
            .id
            .as_ref()
            .and_then(identifier)
            .unwrap_or_else(|| format!("live-{}", Uuid::new_v4()));

        Ok(Notification {
            id,
            kind,
            content: text(self.content),
            read: false,
            timestamp: received_at,
            request_id: self.request_id.as_ref().and_then(identifier),
            sender_id: self.sender_id.as_ref().and_then(identifier),
            media: media_refs(self.media),
        })
    }
}

/// Normalize a fetched history list, skipping records that fail validation.
pub fn normalize_history(
    raw: Vec<RawNotification>,
    received_at: DateTime<Utc>,
) -> Vec<Notification> {
    raw.into_iter()
        .filter_map(|record| match record.normalize_history(received_at) {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!("Skipping malformed notification from history: {}", e);
                None
            }
        })
        .collect()
}

fn parse_kind(kind: Option<Value>) -> Result<NotificationKind, IngressError> {
    match kind {
        Some(Value::String(s)) => {
            NotificationKind::from_str(&s).ok_or(IngressError::UnknownKind(Some(s)))
        }
        Some(other) => Err(IngressError::UnknownKind(Some(other.to_string()))),
        None => Err(IngressError::UnknownKind(None)),
    }
}

fn text(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// Some endpoints send the read flag as a string or 0/1.
fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

// Populated references arrive as objects carrying their own `_id`.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("_id")
            .or_else(|| map.get("id"))
            .and_then(identifier),
        _ => None,
    }
}

fn media_refs(media: Option<Vec<Value>>) -> Vec<String> {
    media
        .unwrap_or_default()
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Coerce an RFC 3339 string or epoch milliseconds into a point in time.
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(from_millis)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis),
        _ => None,
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No active credential")]
    NotAuthenticated,

    #[error("Session ended before the result could be applied")]
    SessionEnded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawNotification {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            NotificationKind::from_str("message"),
            Some(NotificationKind::Message)
        );
        assert_eq!(
            NotificationKind::from_str("SYSTEM"),
            Some(NotificationKind::System)
        );
        assert_eq!(NotificationKind::from_str("meeting"), None);
        assert_eq!(NotificationKind::Message.as_str(), "message");
    }

    #[test]
    fn test_history_record_with_backend_field_names() {
        let now = Utc::now();
        let record = raw(json!({
            "_id": "65f0c1",
            "type": "message",
            "message": "New reply on your request",
            "isRead": true,
            "createdAt": "2024-03-01T10:00:00Z",
            "requestId": { "_id": "req-9", "title": "Wheelchair" },
            "senderId": "user-4",
            "media": ["https://cdn/a.png", { "url": "https://cdn/b.png" }]
        }))
        .normalize_history(now)
        .unwrap();

        assert_eq!(record.id, "65f0c1");
        assert_eq!(record.kind, NotificationKind::Message);
        assert_eq!(record.content, "New reply on your request");
        assert!(record.read);
        assert_eq!(record.timestamp.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(record.request_id.as_deref(), Some("req-9"));
        assert_eq!(record.sender_id.as_deref(), Some("user-4"));
        assert_eq!(record.media, vec!["https://cdn/a.png", "https://cdn/b.png"]);
    }

    #[test]
    fn test_primary_timestamp_wins_over_created_at() {
        let record = raw(json!({
            "id": "a",
            "kind": "system",
            "content": "x",
            "timestamp": 1_700_000_000_000i64,
            "created_at": "2020-01-01T00:00:00Z"
        }))
        .normalize_history(Utc::now())
        .unwrap();

        assert_eq!(record.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert!(!record.read);
    }

    #[test]
    fn test_missing_time_falls_back_to_receive_time() {
        let now = Utc::now();
        let record = raw(json!({ "id": 42, "type": "system", "content": "maintenance" }))
            .normalize_history(now)
            .unwrap();

        assert_eq!(record.id, "42");
        assert_eq!(record.timestamp, now);
    }

    #[test]
    fn test_history_rejects_missing_id_and_unknown_kind() {
        let now = Utc::now();
        assert_eq!(
            raw(json!({ "type": "message", "content": "hi" })).normalize_history(now),
            Err(IngressError::MissingId)
        );
        assert_eq!(
            raw(json!({ "id": "a", "type": "donation" })).normalize_history(now),
            Err(IngressError::UnknownKind(Some("donation".to_string())))
        );
    }

    #[test]
    fn test_normalize_history_skips_bad_records() {
        let records = normalize_history(
            vec![
                raw(json!({ "id": "a", "type": "message", "content": "hi" })),
                raw(json!({ "type": "message" })),
                raw(json!({ "id": "c", "type": "system" })),
            ],
            Utc::now(),
        );

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_live_event_gets_fallback_id_and_local_time() {
        let now = Utc::now();
        let record = raw(json!({ "type": "system", "content": "meeting", "read": true }))
            .normalize_live(now)
            .unwrap();

        assert!(record.id.starts_with("live-"));
        assert_eq!(record.timestamp, now);
        assert!(!record.read, "live events always arrive unread");
    }

    #[test]
    fn test_history_response_shapes() {
        // Bare list
        let bare: HistoryResponse =
            serde_json::from_value(json!([{ "id": "a", "type": "message" }])).unwrap();
        assert_eq!(bare.into_records().len(), 1);

        // Wrapped under `notifications`
        let wrapped: HistoryResponse = serde_json::from_value(json!({
            "notifications": [{ "id": "a", "type": "message" }, { "id": "b", "type": "system" }]
        }))
        .unwrap();
        assert_eq!(wrapped.into_records().len(), 2);
    }

    #[test]
    fn test_ill_typed_record_does_not_fail_history() {
        let response: HistoryResponse = serde_json::from_value(json!([
            { "id": "a", "type": "message", "content": "hi" },
            { "id": "b", "type": 3 },
            { "id": "c", "type": "system", "read": "true" },
            "not a record"
        ]))
        .unwrap();

        // The bare string is dropped at decode, `b` at normalization
        let raw = response.into_records();
        assert_eq!(raw.len(), 3);

        let records = normalize_history(raw, Utc::now());
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(records[1].read);
    }

    #[test]
    fn test_non_string_kind_is_unknown() {
        assert_eq!(
            raw(json!({ "id": "b", "type": 3 })).normalize_history(Utc::now()),
            Err(IngressError::UnknownKind(Some("3".to_string())))
        );
    }

    #[test]
    fn test_parse_instant_variants() {
        assert!(parse_instant(&json!("2024-03-01T10:00:00.123+02:00")).is_some());
        assert_eq!(
            parse_instant(&json!("1700000000000")).map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert!(parse_instant(&json!("yesterday")).is_none());
        assert!(parse_instant(&json!(null)).is_none());
    }
}
