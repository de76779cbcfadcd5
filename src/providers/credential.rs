//! Provider credentials
//!
//! Access token, optional refresh token and expiry for one provider instance,
//! plus the header scheme the backend expects.

use base64::Engine;
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Seconds before the recorded expiry at which a token is treated as expired
const EXPIRY_SKEW_SECS: i64 = 300;

/// How the credential is presented in the `Authorization` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: Basic base64(user:password)`
    Basic,
    /// `Authorization: <token>` as older portal deployments expect
    LegacyRaw,
}

#[derive(Clone)]
pub struct Credential {
    pub scheme: AuthScheme,
    /// Access token, or the password for basic auth
    pub access_token: SecretString,
    /// Login for basic auth
    pub username: Option<String>,
    pub refresh_token: Option<SecretString>,
    /// Unix timestamp
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn bearer(access_token: &str, refresh_token: Option<&str>, expires_at: Option<i64>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            access_token: SecretString::from(access_token.to_string()),
            username: None,
            refresh_token: refresh_token.map(|t| SecretString::from(t.to_string())),
            expires_at,
        }
    }

    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            scheme: AuthScheme::Basic,
            access_token: SecretString::from(password.to_string()),
            username: Some(username.to_string()),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Portal session token; the scheme is settled once the server version is known
    pub fn portal(token: &str, expires_at: Option<i64>) -> Self {
        Self {
            scheme: AuthScheme::LegacyRaw,
            ..Self::bearer(token, None, expires_at)
        }
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Check if token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + EXPIRY_SKEW_SECS,
            None => false,
        }
    }

    /// Whether to refresh ahead of expiry, for a credential installed at `issued_at`.
    ///
    /// The skew is capped at half the token's lifetime so a short-lived token
    /// fresh from an exchange is used before it is renewed again.
    pub fn needs_refresh_at(&self, now: i64, issued_at: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let skew = EXPIRY_SKEW_SECS.min((expires_at - issued_at) / 2).max(0);
                expires_at <= now + skew
            }
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// `Authorization` header value for this credential's scheme
    pub fn authorization(&self) -> Result<HeaderValue, ProviderError> {
        let token = self.access_token.expose_secret();
        let value = match self.scheme {
            AuthScheme::Bearer => format!("Bearer {}", token),
            AuthScheme::LegacyRaw => token.to_string(),
            AuthScheme::Basic => {
                let user = self.username.as_deref().unwrap_or_default();
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, token));
                format!("Basic {}", encoded)
            }
        };
        let mut header = HeaderValue::from_str(&value)
            .map_err(|e| ProviderError::Auth(format!("Invalid token: {}", e)))?;
        header.set_sensitive(true);
        Ok(header)
    }

    pub fn to_record(&self) -> CredentialRecord {
        CredentialRecord {
            scheme: self.scheme,
            access_token: self.access_token.expose_secret().to_string(),
            username: self.username.clone(),
            refresh_token: self.refresh_token.as_ref().map(|t| t.expose_secret().to_string()),
            expires_at: self.expires_at,
        }
    }
}

/// Serializable credential, as kept by the registry store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub scheme: AuthScheme,
    pub access_token: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>, // Unix timestamp
}

impl From<&CredentialRecord> for Credential {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            scheme: record.scheme,
            access_token: SecretString::from(record.access_token.clone()),
            username: record.username.clone(),
            refresh_token: record.refresh_token.clone().map(SecretString::from),
            expires_at: record.expires_at,
        }
    }
}
