// Page-context side of the bridge

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::contract::{
    AddMembership, AddOrUpdateRating, BridgeRequest, CheckMembership, GetRating, GetUser,
    ListMemberships, RemoveMembership, Search, SignIn, SignOut,
};
use super::envelope::{RequestEnvelope, RequestType, ResponseEnvelope};
use super::transport::Transport;
use crate::auth::User;
use crate::error::BridgeError;
use crate::models::{MembershipRecord, Movie, Rating};

/// Budget used by the convenience calls
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A call waiting for its response.
///
/// Dropping it deregisters the listener, so a call that ends by response or by
/// timeout releases its listener exactly once.
pub struct PendingCall {
    request_type: RequestType,
    id: Uuid,
    listener: broadcast::Receiver<ResponseEnvelope>,
}

impl PendingCall {
    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the first matching response, or `Timeout` once `budget` elapses
    pub async fn wait(mut self, budget: Duration) -> Result<ResponseEnvelope, BridgeError> {
        let id = self.id;
        let request_type = self.request_type;

        let matching = async {
            loop {
                match self.listener.recv().await {
                    Ok(envelope) if envelope.answers(id, request_type) => return Ok(envelope),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            %id,
                            kind = %request_type,
                            skipped,
                            "Bridge listener lagged; responses were dropped"
                        );
                    }
                    Err(RecvError::Closed) => return Err(BridgeError::Disconnected),
                }
            }
        };

        match tokio::time::timeout(budget, matching).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%id, kind = %request_type, "Bridge call timed out after {:?}", budget);
                Err(BridgeError::Timeout)
            }
        }
    }
}

/// Sends typed requests to the privileged process and matches their responses
/// by `(type, correlation id)`
#[derive(Clone)]
pub struct MessageBridge {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
}

impl MessageBridge {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Send an untyped request. Failures, including timeouts, come back as values.
    pub async fn send_raw(
        &self,
        kind: RequestType,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let envelope = RequestEnvelope::new(kind, payload);
        let pending = PendingCall {
            request_type: kind,
            id: envelope.id,
            // Registered before posting so a fast reply cannot be missed
            listener: self.transport.subscribe(),
        };

        tracing::debug!(id = %envelope.id, %kind, "Sending bridge request");
        self.transport.post(envelope)?;

        pending.wait(timeout).await?.into_result()
    }

    /// Send a typed request and decode its typed response
    pub async fn send<R: BridgeRequest>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, BridgeError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| BridgeError::ProtocolError(format!("Cannot encode {}: {}", R::TYPE, e)))?;

        let data = self.send_raw(R::TYPE, payload, timeout).await?;

        serde_json::from_value(data).map_err(|e| {
            BridgeError::ProtocolError(format!("Unexpected {} data: {}", R::TYPE.response_type(), e))
        })
    }

    async fn call<R: BridgeRequest>(&self, request: R) -> Result<R::Response, BridgeError> {
        self.send(&request, self.default_timeout).await
    }

    pub async fn search(
        &self,
        id_or_title: impl Into<String>,
        year: Option<i64>,
    ) -> Result<Option<Movie>, BridgeError> {
        self.call(Search {
            id_or_title: id_or_title.into(),
            year,
        })
        .await
    }

    pub async fn check_membership(&self, movie_id: impl Into<String>) -> Result<bool, BridgeError> {
        self.call(CheckMembership {
            movie_id: movie_id.into(),
        })
        .await
    }

    pub async fn add_membership(&self, record: MembershipRecord) -> Result<(), BridgeError> {
        self.call(AddMembership { record }).await
    }

    pub async fn remove_membership(&self, movie_id: impl Into<String>) -> Result<(), BridgeError> {
        self.call(RemoveMembership {
            movie_id: movie_id.into(),
        })
        .await
    }

    pub async fn list_memberships(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<MembershipRecord>, BridgeError> {
        self.call(ListMemberships { limit }).await
    }

    pub async fn add_or_update_rating(&self, rating: AddOrUpdateRating) -> Result<(), BridgeError> {
        self.call(rating).await
    }

    pub async fn get_rating(
        &self,
        movie_id: impl Into<String>,
    ) -> Result<Option<Rating>, BridgeError> {
        self.call(GetRating {
            movie_id: movie_id.into(),
        })
        .await
    }

    pub async fn current_user(&self) -> Result<Option<User>, BridgeError> {
        self.call(GetUser {}).await
    }

    pub async fn sign_in(&self, refresh_token: Option<String>) -> Result<User, BridgeError> {
        self.call(SignIn { refresh_token }).await
    }

    pub async fn sign_out(&self) -> Result<(), BridgeError> {
        self.call(SignOut {}).await
    }
}
