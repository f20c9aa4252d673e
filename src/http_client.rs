use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response};
use std::time::Duration;

use crate::auth::CredentialManager;
use crate::error::BridgeError;

/// HTTP client for the remote document store with retry logic.
///
/// Every attempt carries a bearer token resolved through the credential manager.
#[derive(Clone)]
pub struct StoreHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    credentials: CredentialManager,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl StoreHttpClient {
    pub fn new(
        credentials: CredentialManager,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            credentials,
            max_retries,
            base_delay_ms: 1000,
        })
    }

    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Execute a request with retry logic
    /// Automatically handles:
    /// - 401/403: re-validates the credential once and retries
    /// - 429: exponential backoff
    /// - 5xx: exponential backoff
    pub async fn execute(&self, request: Request) -> Result<Response, BridgeError> {
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending document store request");

        let mut token = self.credentials.resolve_token().await?;
        let mut revalidated = false;
        let mut attempt = 0;

        loop {
            let mut req = request.try_clone().ok_or_else(|| {
                BridgeError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;
            req.headers_mut()
                .insert(AUTHORIZATION, bearer_header(&token)?);

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Document store request successful");
                        return Ok(response);
                    }

                    match status.as_u16() {
                        // Token looked fresh locally but the store rejected it
                        401 | 403 if !revalidated => {
                            tracing::warn!(
                                "Received {}, re-validating credential and retrying",
                                status
                            );
                            token = self.credentials.force_revalidate().await?;
                            revalidated = true;
                            continue;
                        }

                        429 | 500..=599 if attempt < self.max_retries => {
                            let delay = self.calculate_backoff_delay(attempt);
                            tracing::warn!(
                                "Received {}, retrying after {}ms (attempt {}/{})",
                                status,
                                delay,
                                attempt + 1,
                                self.max_retries
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                            continue;
                        }

                        _ => {}
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "Document store request failed"
                    );
                    return Err(BridgeError::BackendError {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            url = %url,
                            "Request failed, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "Document store request failed after all retries"
                    );
                    return Err(BridgeError::Internal(anyhow::anyhow!(
                        "HTTP request failed: {} (kind: {})",
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Exponential backoff with up to 10% jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn bearer_header(token: &str) -> Result<HeaderValue, BridgeError> {
    HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
        BridgeError::AuthExpired(format!("Token is not a valid header value: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        FetchMode, IdentityEvent, IdentityProvider, MemoryCredentialStore, RefreshPolicy,
        TokenGrant, User,
    };
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProvider {
        clock: Arc<ManualClock>,
        validations: AtomicUsize,
    }

    #[async_trait]
    impl IdentityProvider for CountingProvider {
        async fn fetch_token(&self, mode: FetchMode) -> anyhow::Result<TokenGrant> {
            let n = self.validations.fetch_add(1, Ordering::SeqCst);
            Ok(TokenGrant {
                token: format!("token-{}", n),
                expires_at: self.clock.now() + chrono::Duration::hours(1),
                user: (mode == FetchMode::Validate).then(|| User::new("uid-1")),
            })
        }
    }

    async fn signed_in() -> (StoreHttpClient, Arc<CountingProvider>) {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let provider = Arc::new(CountingProvider {
            clock: clock.clone(),
            validations: AtomicUsize::new(0),
        });
        let credentials = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            provider.clone(),
            clock,
            RefreshPolicy::default(),
        );
        credentials
            .on_identity_change(IdentityEvent::SignedIn(User::new("uid-1")))
            .await
            .unwrap();

        let client = StoreHttpClient::new(credentials, 4, 5, 5, 3)
            .unwrap()
            .with_base_delay(1);
        (client, provider)
    }

    #[test]
    fn test_backoff_calculation() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let credentials = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(CountingProvider {
                clock: clock.clone(),
                validations: AtomicUsize::new(0),
            }),
            clock,
            RefreshPolicy::default(),
        );
        let client = StoreHttpClient::new(credentials, 20, 30, 300, 3).unwrap();

        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        assert!((1000..=1100).contains(&delay0));
        assert!((2000..=2200).contains(&delay1));
        assert!((4000..=4400).contains(&delay2));
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let (client, _) = signed_in().await;
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/doc")
            .match_header("authorization", "Bearer token-0")
            .with_status(200)
            .create_async()
            .await;

        let request = client
            .client()
            .get(format!("{}/doc", server.url()))
            .build()
            .unwrap();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let (client, _) = signed_in().await;
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/doc")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let request = client
            .client()
            .get(format!("{}/doc", server.url()))
            .build()
            .unwrap();
        let err = client.execute(request).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendError { status: 503, .. }));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_revalidates_once_on_forbidden() {
        let (client, provider) = signed_in().await;
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/doc")
            .match_header("authorization", "Bearer token-0")
            .with_status(403)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/doc")
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .create_async()
            .await;

        let request = client
            .client()
            .get(format!("{}/doc", server.url()))
            .build()
            .unwrap();
        client.execute(request).await.unwrap();

        rejected.assert_async().await;
        accepted.assert_async().await;
        assert_eq!(provider.validations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_second_rejection() {
        let (client, provider) = signed_in().await;
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/doc")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let request = client
            .client()
            .get(format!("{}/doc", server.url()))
            .build()
            .unwrap();
        let err = client.execute(request).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendError { status: 401, .. }));
        assert_eq!(provider.validations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_requires_sign_in() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let credentials = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(CountingProvider {
                clock: clock.clone(),
                validations: AtomicUsize::new(0),
            }),
            clock,
            RefreshPolicy::default(),
        );
        let client = StoreHttpClient::new(credentials, 4, 5, 5, 0).unwrap();
        let request = client.client().get("http://127.0.0.1:9/doc").build().unwrap();

        let err = client.execute(request).await.unwrap_err();
        assert!(matches!(err, BridgeError::AuthRequired));
    }
}
