// Privileged-side request dispatcher

pub mod handlers;

pub use handlers::{register_all, HandlerContext};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::bridge::{BridgeRequest, Inbox, RequestEnvelope, RequestType, ResponseEnvelope};
use crate::error::BridgeError;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BridgeError>> + Send + Sync>;

/// Routes request envelopes to registered handlers and always produces a
/// response envelope for the ones it accepts
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<RequestType, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `R`, replacing any previous one
    pub fn register<R, F, Fut>(&mut self, handler: F)
    where
        R: BridgeRequest,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, BridgeError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |payload: Value| {
            let handler = handler.clone();
            async move {
                // Requests without fields may omit the payload entirely
                let payload = if payload.is_null() {
                    Value::Object(Default::default())
                } else {
                    payload
                };
                let request: R = serde_json::from_value(payload).map_err(|e| {
                    BridgeError::ProtocolError(format!("Invalid {} payload: {}", R::TYPE, e))
                })?;

                let response = handler(request).await?;

                serde_json::to_value(response).map_err(|e| {
                    BridgeError::ProtocolError(format!("Cannot encode {} data: {}", R::TYPE, e))
                })
            }
            .boxed()
        });

        self.handlers.insert(R::TYPE, erased);
    }

    pub fn handles(&self, kind: RequestType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for `envelope`.
    ///
    /// Returns `None` when no handler is registered for its type. A handler
    /// that panics produces a `ProtocolError` response.
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Option<ResponseEnvelope> {
        let handler = self.handlers.get(&envelope.kind)?.clone();

        tracing::debug!(id = %envelope.id, kind = %envelope.kind, "Dispatching bridge request");

        let outcome = AssertUnwindSafe(handler(envelope.payload.clone()))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(data)) => ResponseEnvelope::success(&envelope, data),
            Ok(Err(e)) => {
                tracing::warn!(id = %envelope.id, kind = %envelope.kind, error = %e, "Bridge request failed");
                ResponseEnvelope::failure(&envelope, &e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(id = %envelope.id, kind = %envelope.kind, "Handler panicked: {}", message);
                ResponseEnvelope::failure(
                    &envelope,
                    &BridgeError::ProtocolError(format!("Handler failed: {}", message)),
                )
            }
        };

        Some(response)
    }

    /// Accept a message from the transport.
    ///
    /// Unknown types are ignored and `false` is returned; the sender then times
    /// out. Otherwise the handler runs in the background and `reply` is called
    /// exactly once with its response.
    pub fn on_message<F>(self: &Arc<Self>, envelope: RequestEnvelope, reply: F) -> bool
    where
        F: FnOnce(ResponseEnvelope) + Send + 'static,
    {
        if !self.handles(envelope.kind) {
            tracing::debug!(id = %envelope.id, kind = %envelope.kind, "Ignoring unhandled bridge request");
            return false;
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(response) = dispatcher.dispatch(envelope).await {
                reply(response);
            }
        });
        true
    }

    /// Serve requests from an in-process transport until it closes
    pub async fn serve(self: Arc<Self>, mut inbox: Inbox) {
        tracing::info!("Bridge dispatcher serving {} request types", self.handlers.len());

        while let Some(envelope) = inbox.requests.recv().await {
            let responses = inbox.responses.clone();
            self.on_message(envelope, move |response| {
                // Nobody listening means the caller already gave up
                let _ = responses.send(response);
            });
        }

        tracing::info!("Bridge transport closed, dispatcher stopping");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
