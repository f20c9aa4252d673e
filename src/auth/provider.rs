// Identity provider: mints bearer tokens on the renew and validate paths

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

use super::types::{FetchMode, TokenGrant, User};

/// Seconds shaved off the provider-reported lifetime
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Lifetime assumed when the provider omits one
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest lifetime accepted from the provider (one week)
const MAX_EXPIRES_IN_SECS: i64 = 7 * 24 * 3600;

/// Source of bearer tokens for the signed-in identity
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Mint a token. `FetchMode::Renew` never contacts the account-validation
    /// endpoint; `FetchMode::Validate` always does.
    async fn fetch_token(&self, mode: FetchMode) -> Result<TokenGrant>;

    /// Replace the long-lived credential used for future fetches
    async fn set_refresh_token(&self, _refresh_token: String) {}
}

/// Endpoints of the HTTP identity provider
#[derive(Debug, Clone)]
pub struct IdentityEndpoints {
    /// Refresh-token exchange endpoint
    pub token_url: String,
    /// Account lookup endpoint used for full validation
    pub lookup_url: String,
    pub api_key: String,
}

/// Refresh-token exchange response
#[derive(Deserialize)]
struct TokenExchangeResponse {
    id_token: String,
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    id_token: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
    #[serde(default)]
    disabled: bool,
}

/// `expires_in` arrives either as a number or as a decimal string
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(i64),
        Text(String),
    }

    Ok(match Option::<Seconds>::deserialize(deserializer)? {
        Some(Seconds::Number(n)) => Some(n),
        Some(Seconds::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// Absolute expiry for a token issued at `now` with `expires_in` seconds to live.
///
/// Lifetimes inside the expiry buffer are rejected; oversized ones are capped.
fn grant_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    if expires_in <= EXPIRY_BUFFER_SECS {
        anyhow::bail!(
            "Token lifetime of {}s is within the {}s expiry buffer",
            expires_in,
            EXPIRY_BUFFER_SECS
        );
    }

    let lifetime = expires_in.min(MAX_EXPIRES_IN_SECS) - EXPIRY_BUFFER_SECS;
    let lifetime = Duration::try_seconds(lifetime)
        .with_context(|| format!("Token lifetime out of range: {}s", expires_in))?;
    now.checked_add_signed(lifetime)
        .with_context(|| format!("Token expiry overflows: {}s from {}", expires_in, now))
}

/// Identity provider speaking a secure-token / account-lookup HTTP API
pub struct HttpIdentityProvider {
    client: Client,
    endpoints: IdentityEndpoints,
    refresh_token: RwLock<String>,
}

impl HttpIdentityProvider {
    pub fn new(client: Client, endpoints: IdentityEndpoints, refresh_token: String) -> Self {
        Self {
            client,
            endpoints,
            refresh_token: RwLock::new(refresh_token),
        }
    }

    /// Exchange the refresh token for a fresh id token
    async fn exchange(&self) -> Result<TokenGrant> {
        tracing::debug!("Exchanging refresh token...");

        let refresh_token = self.refresh_token.read().await.clone();
        if refresh_token.is_empty() {
            anyhow::bail!("No refresh token available; sign in first");
        }

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoints.token_url)
            .query(&[("key", self.endpoints.api_key.as_str())])
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await
            .context("Failed to send token exchange request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Token exchange failed: status={}, body={}",
                status,
                error_text
            );
            anyhow::bail!("Token exchange failed: {} - {}", status, error_text);
        }

        let data: TokenExchangeResponse = response
            .json()
            .await
            .context("Failed to parse token exchange response")?;

        if data.id_token.is_empty() {
            anyhow::bail!("Token exchange response does not contain id_token");
        }

        if let Some(rotated) = data.refresh_token.filter(|t| !t.is_empty()) {
            *self.refresh_token.write().await = rotated;
        }

        let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = grant_expiry(Utc::now(), expires_in)?;

        Ok(TokenGrant {
            token: data.id_token,
            expires_at,
            user: None,
        })
    }

    /// Confirm the account behind `id_token` still exists and is enabled
    async fn lookup(&self, id_token: &str) -> Result<User> {
        let response = self
            .client
            .post(&self.endpoints.lookup_url)
            .query(&[("key", self.endpoints.api_key.as_str())])
            .json(&LookupRequest { id_token })
            .send()
            .await
            .context("Failed to send account lookup request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Account lookup failed: {} - {}", status, error_text);
        }

        let data: LookupResponse = response
            .json()
            .await
            .context("Failed to parse account lookup response")?;

        let account = data
            .users
            .into_iter()
            .next()
            .context("Account lookup returned no user; session revoked")?;

        if account.disabled {
            anyhow::bail!("Account {} is disabled", account.local_id);
        }

        Ok(User {
            id: account.local_id,
            email: account.email,
            display_name: account.display_name,
            photo_url: account.photo_url,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn set_refresh_token(&self, refresh_token: String) {
        *self.refresh_token.write().await = refresh_token;
    }

    async fn fetch_token(&self, mode: FetchMode) -> Result<TokenGrant> {
        let mut grant = self.exchange().await?;

        if mode == FetchMode::Validate {
            let user = self.lookup(&grant.token).await?;
            tracing::info!("Session validated for user {}", user.id);
            grant.user = Some(user);
        }

        tracing::info!(
            "Token issued ({:?}), expires: {}",
            mode,
            grant.expires_at.to_rfc3339()
        );

        Ok(grant)
    }
}
