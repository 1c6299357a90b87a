use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// The three roles of the welfare platform
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Volunteer,
    Admin,
}

impl Role {
    pub fn from_str(role: &str) -> Result<Self, String> {
        match role.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "volunteer" => Ok(Role::Volunteer),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {}", role)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Volunteer => "volunteer",
            Role::Admin => "admin",
        }
    }
}

/// Claims carried by the backend-issued access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    #[serde(alias = "id", alias = "userId")]
    pub sub: String, // Subject (user ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CredentialError {
    #[error("No access token provided")]
    Missing,

    #[error("Access token has expired")]
    Expired,

    #[error("Invalid access token: {0}")]
    Invalid(String),
}

/// A bearer credential together with the identity it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    token: String,
    claims: Claims,
}

impl Credential {
    /// Decode the claims of an access token.
    ///
    /// The signature is not checked here; the backend verifies it on every
    /// request. Expiry is checked so a stale token never opens a session.
    pub fn parse(token: &str) -> Result<Self, CredentialError> {
        let token = token.trim();
        // A bare scheme with no token counts as no credential at all
        let token = match token.strip_prefix("Bearer") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
            _ => token,
        };
        if token.is_empty() {
            return Err(CredentialError::Missing);
        }

        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = true;
        validation.leeway = 0;

        let token_data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid(e.to_string()),
            })?;

        if token_data.claims.sub.trim().is_empty() {
            return Err(CredentialError::Invalid("missing subject".to_string()));
        }

        Ok(Self {
            token: token.to_string(),
            claims: token_data.claims,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }

    pub fn role(&self) -> Option<Role> {
        self.claims.role
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims
            .exp
            .and_then(|exp| Utc.timestamp_opt(exp as i64, 0).single())
    }
}

/// Process-wide holder of the current credential.
///
/// The HTTP client reads the bearer token from here on every request, and the
/// session manager reacts to changes through [`CredentialStore::subscribe`].
#[derive(Clone)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Option<Credential>>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn bearer(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|c| c.token().to_string())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}
