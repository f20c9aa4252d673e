// Authentication types

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signed-in user, mirrored next to the credential for UI convenience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
            photo_url: None,
        }
    }
}

/// Identity-state transition reported by the identity provider
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityEvent {
    SignedOut,
    /// Sign-in or token change for this user
    SignedIn(User),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Token expiry {expires_at} is not later than validation time {validated_at}")]
    ExpiryNotAfterValidation {
        expires_at: DateTime<Utc>,
        validated_at: DateTime<Utc>,
    },

    #[error("Token is empty")]
    EmptyToken,
}

/// Bearer credential with its absolute expiry and the last full validation
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
    last_validated_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential, rejecting an expiry that does not follow the validation time
    pub fn new(
        token: impl Into<String>,
        expires_at: DateTime<Utc>,
        last_validated_at: Option<DateTime<Utc>>,
    ) -> Result<Self, CredentialError> {
        let token = token.into();
        if token.is_empty() {
            return Err(CredentialError::EmptyToken);
        }
        if let Some(validated_at) = last_validated_at {
            if expires_at <= validated_at {
                return Err(CredentialError::ExpiryNotAfterValidation {
                    expires_at,
                    validated_at,
                });
            }
        }

        Ok(Self {
            token,
            expires_at,
            last_validated_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        self.last_validated_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Replace the token after a non-validating renewal, keeping the validation time
    pub fn renewed(&self, grant: &TokenGrant) -> Result<Self, CredentialError> {
        Self::new(grant.token.clone(), grant.expires_at, self.last_validated_at)
    }
}

/// Which code path the identity provider should use to mint a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Mint a token without re-validating the session
    Renew,
    /// Full round trip confirming the session is still valid
    Validate,
}

/// Token data returned by the identity provider
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: Option<User>,
}

/// Validation window and how early before its end a silent renewal fires
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    validation_window: Duration,
    refresh_threshold: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            validation_window: Duration::hours(24),
            refresh_threshold: Duration::hours(2),
        }
    }
}

impl RefreshPolicy {
    pub fn new(validation_window: Duration, refresh_threshold: Duration) -> anyhow::Result<Self> {
        if validation_window <= Duration::zero() {
            anyhow::bail!("Validation window must be positive");
        }
        if refresh_threshold < Duration::zero() || refresh_threshold >= validation_window {
            anyhow::bail!(
                "Refresh threshold ({}s) must be non-negative and shorter than the validation window ({}s)",
                refresh_threshold.num_seconds(),
                validation_window.num_seconds()
            );
        }
        Ok(Self {
            validation_window,
            refresh_threshold,
        })
    }

    pub fn validation_window(&self) -> Duration {
        self.validation_window
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    /// When the scheduled silent renewal for this validation should fire
    pub fn next_refresh_at(&self, last_validated_at: DateTime<Utc>) -> DateTime<Utc> {
        last_validated_at + self.validation_window - self.refresh_threshold
    }

    /// Classify the cached credential at `now`
    pub fn classify(&self, credential: Option<&Credential>, now: DateTime<Utc>) -> TokenState {
        let Some(credential) = credential else {
            return TokenState::Absent;
        };

        match credential.last_validated_at() {
            Some(validated_at) if now - validated_at < self.validation_window => {
                if credential.is_expired(now) {
                    TokenState::ExpiredValidationFresh
                } else {
                    TokenState::Fresh
                }
            }
            _ => TokenState::ValidationStale,
        }
    }

    /// Classification used when the scheduled renewal fires: inside the refresh
    /// threshold the validation counts as stale so the next window starts now
    pub fn classify_scheduled(
        &self,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> TokenState {
        match credential.and_then(Credential::last_validated_at) {
            Some(validated_at) if now >= self.next_refresh_at(validated_at) => {
                TokenState::ValidationStale
            }
            _ => match self.classify(credential, now) {
                TokenState::Fresh => TokenState::ExpiredValidationFresh,
                other => other,
            },
        }
    }
}

/// Token state of the cached credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Absent,
    Fresh,
    ExpiredValidationFresh,
    ValidationStale,
}

/// Durable cross-context record, as stored in the `auth_kv` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub token: String,
    /// Epoch milliseconds
    pub token_expiry: i64,
    /// Epoch milliseconds
    pub token_validation_timestamp: Option<i64>,
}

impl From<&Credential> for CredentialRecord {
    fn from(credential: &Credential) -> Self {
        Self {
            token: credential.token.clone(),
            token_expiry: credential.expires_at.timestamp_millis(),
            token_validation_timestamp: credential.last_validated_at.map(|t| t.timestamp_millis()),
        }
    }
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = anyhow::Error;

    fn try_from(record: CredentialRecord) -> anyhow::Result<Self> {
        let expires_at = from_millis(record.token_expiry)?;
        let last_validated_at = record
            .token_validation_timestamp
            .map(from_millis)
            .transpose()?;
        Ok(Credential::new(record.token, expires_at, last_validated_at)?)
    }
}

fn from_millis(ms: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow::anyhow!("Invalid epoch-ms timestamp: {}", ms))
}
