// Message transports between the page context and the privileged process

use reqwest::{Client, StatusCode};
use tokio::sync::{broadcast, mpsc};

use super::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::BridgeError;

/// Default number of responses buffered per listener before it lags
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An asynchronous, unordered, possibly lossy channel.
///
/// Requests are posted fire-and-forget; responses are broadcast to every
/// subscribed listener, which must pick out its own.
pub trait Transport: Send + Sync {
    fn post(&self, envelope: RequestEnvelope) -> Result<(), BridgeError>;

    /// Register a listener for responses posted from now on
    fn subscribe(&self) -> broadcast::Receiver<ResponseEnvelope>;
}

/// Privileged-side end of a [`LocalTransport`]
pub struct Inbox {
    pub requests: mpsc::UnboundedReceiver<RequestEnvelope>,
    pub responses: broadcast::Sender<ResponseEnvelope>,
}

/// In-process transport
pub struct LocalTransport {
    requests: mpsc::UnboundedSender<RequestEnvelope>,
    responses: broadcast::Sender<ResponseEnvelope>,
}

impl LocalTransport {
    pub fn channel(capacity: usize) -> (Self, Inbox) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, _) = broadcast::channel(capacity);

        let transport = Self {
            requests: request_tx,
            responses: response_tx.clone(),
        };
        let inbox = Inbox {
            requests: request_rx,
            responses: response_tx,
        };
        (transport, inbox)
    }

    /// Number of response listeners currently registered
    pub fn listener_count(&self) -> usize {
        self.responses.receiver_count()
    }
}

impl Transport for LocalTransport {
    fn post(&self, envelope: RequestEnvelope) -> Result<(), BridgeError> {
        self.requests
            .send(envelope)
            .map_err(|_| BridgeError::Disconnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResponseEnvelope> {
        self.responses.subscribe()
    }
}

/// Transport that posts envelopes to a remote `/bridge` endpoint and
/// rebroadcasts the replies locally
pub struct HttpTransport {
    client: Client,
    url: String,
    api_key: String,
    responses: broadcast::Sender<ResponseEnvelope>,
}

impl HttpTransport {
    pub fn new(client: Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let (responses, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            responses,
        }
    }

    async fn deliver(
        client: Client,
        url: String,
        api_key: String,
        envelope: RequestEnvelope,
    ) -> Option<ResponseEnvelope> {
        let result = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&envelope)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id = %envelope.id, error = %e, "Bridge request was not delivered");
                return Some(ResponseEnvelope::failure(
                    &envelope,
                    &BridgeError::Disconnected,
                ));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // Nobody handles this type; the caller times out as with any unhandled message
            tracing::debug!(id = %envelope.id, kind = %envelope.kind, "Bridge request not handled");
            return None;
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = match status {
                StatusCode::UNAUTHORIZED => BridgeError::AuthRequired,
                _ => BridgeError::ProtocolError(format!("{} - {}", status, body)),
            };
            return Some(ResponseEnvelope::failure(&envelope, &error));
        }

        match response.json::<ResponseEnvelope>().await {
            Ok(reply) => Some(reply),
            Err(e) => Some(ResponseEnvelope::failure(
                &envelope,
                &BridgeError::ProtocolError(format!("Malformed response envelope: {}", e)),
            )),
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, envelope: RequestEnvelope) -> Result<(), BridgeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BridgeError::Disconnected)?;

        let client = self.client.clone();
        let url = self.url.clone();
        let api_key = self.api_key.clone();
        let responses = self.responses.clone();

        runtime.spawn(async move {
            if let Some(reply) = Self::deliver(client, url, api_key, envelope).await {
                // No listeners left means the caller already gave up
                let _ = responses.send(reply);
            }
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResponseEnvelope> {
        self.responses.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::envelope::RequestType;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_transport_delivers_requests() {
        let (transport, mut inbox) = LocalTransport::channel(8);
        let envelope = RequestEnvelope::new(RequestType::GetUser, json!({}));
        transport.post(envelope.clone()).unwrap();

        assert_eq!(inbox.requests.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_local_transport_broadcasts_responses() {
        let (transport, inbox) = LocalTransport::channel(8);
        let mut a = transport.subscribe();
        let mut b = transport.subscribe();

        let request = RequestEnvelope::new(RequestType::GetUser, json!({}));
        inbox
            .responses
            .send(ResponseEnvelope::success(&request, json!(null)))
            .unwrap();

        assert_eq!(a.recv().await.unwrap().id, request.id);
        assert_eq!(b.recv().await.unwrap().id, request.id);
    }

    #[tokio::test]
    async fn test_local_transport_reports_disconnect() {
        let (transport, inbox) = LocalTransport::channel(8);
        drop(inbox);
        let err = transport
            .post(RequestEnvelope::new(RequestType::GetUser, json!({})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected));
    }

    #[tokio::test]
    async fn test_http_transport_rebroadcasts_reply() {
        let mut server = mockito::Server::new_async().await;
        let request = RequestEnvelope::new(RequestType::CheckMembership, json!({"movieId": "tt1"}));
        let reply = ResponseEnvelope::success(&request, json!(true));
        let mock = server
            .mock("POST", "/bridge")
            .match_header("authorization", "Bearer key")
            .with_status(200)
            .with_body(serde_json::to_string(&reply).unwrap())
            .create_async()
            .await;

        let transport = HttpTransport::new(Client::new(), format!("{}/bridge", server.url()), "key");
        let mut listener = transport.subscribe();
        transport.post(request).unwrap();

        assert_eq!(listener.recv().await.unwrap(), reply);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_transport_maps_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bridge")
            .with_status(401)
            .create_async()
            .await;

        let transport = HttpTransport::new(Client::new(), format!("{}/bridge", server.url()), "bad");
        let mut listener = transport.subscribe();
        let request = RequestEnvelope::new(RequestType::GetUser, json!({}));
        transport.post(request.clone()).unwrap();

        let reply = listener.recv().await.unwrap();
        assert!(reply.answers(request.id, RequestType::GetUser));
        assert!(matches!(reply.into_result(), Err(BridgeError::AuthRequired)));
    }
}
