//! Request/response correlation over a pair of one-way message streams.
//!
//! Both directions carry [`Envelope`]s. A request has a fresh `requestId`;
//! its reply echoes that id with type `<type>-success` and the result as
//! payload, or type `error` and an [`ErrorPayload`]. Envelopes without a
//! `requestId` are notifications and get no reply.
//!
//! Replies may arrive in any order. [`CorrelationChannel`] matches them to
//! waiting callers by id only.
//!
//! On the receiving side, [`run_message_loop`] hands each inbound request
//! to a [`MessageHandler`] in its own task and posts the reply. A failing
//! or panicking handler produces an `error` reply and never stops the loop.

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;

use crate::error::{serialize_error, ErrorPayload, WorkbenchError};

pub const SUCCESS_SUFFIX: &str = "-success";
pub const ERROR_TYPE: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn notification(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            payload,
        }
    }

    pub fn request(kind: impl Into<String>, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: Some(request_id.into()),
            payload,
        }
    }

    pub fn success(kind: &str, request_id: impl Into<String>, payload: Value) -> Self {
        Self::request(format!("{kind}{SUCCESS_SUFFIX}"), request_id, payload)
    }

    pub fn error(request_id: impl Into<String>, error: &ErrorPayload) -> Self {
        Self::request(
            ERROR_TYPE,
            request_id,
            serde_json::to_value(error).unwrap_or(Value::Null),
        )
    }

    /// Whether this envelope answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.request_id.is_some()
            && (self.kind == ERROR_TYPE || self.kind.ends_with(SUCCESS_SUFFIX))
    }
}

/// Outbound half of a message stream.
#[async_trait]
pub trait MessagePort: Send + Sync {
    async fn post(&self, envelope: Envelope) -> Result<()>;
}

#[async_trait]
impl MessagePort for mpsc::UnboundedSender<Envelope> {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope)
            .map_err(|_| WorkbenchError::ChannelClosed.into())
    }
}

type Reply = std::result::Result<Value, ErrorPayload>;

/// Issues correlated requests over a [`MessagePort`].
pub struct CorrelationChannel {
    port: Arc<dyn MessagePort>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    timeout: Option<Duration>,
}

impl CorrelationChannel {
    pub fn new(port: Arc<dyn MessagePort>) -> Self {
        Self {
            port,
            pending: Mutex::new(HashMap::new()),
            timeout: None,
        }
    }

    /// Expire requests that get no reply within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send `kind` with `payload` and wait for the matching reply.
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = self
            .port
            .post(Envelope::request(kind, request_id.clone(), payload))
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.remove(&request_id);
                    return Err(WorkbenchError::RequestTimedOut(request_id).into());
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(payload.into()),
            Err(_) => Err(WorkbenchError::ChannelClosed.into()),
        }
    }

    /// Post without waiting for anything back.
    pub async fn notify(&self, kind: &str, payload: Value) -> Result<()> {
        self.port.post(Envelope::notification(kind, payload)).await
    }

    /// Offer an inbound envelope. Replies are consumed (and resolve their
    /// request); anything else is handed back to the caller.
    pub async fn receive(&self, envelope: Envelope) -> Option<Envelope> {
        if !envelope.is_reply() {
            return Some(envelope);
        }
        let Some(request_id) = envelope.request_id.as_deref() else {
            return Some(envelope);
        };

        let Some(tx) = self.pending.lock().await.remove(request_id) else {
            tracing::warn!(request_id, kind = %envelope.kind, "dropping reply with no pending request");
            return None;
        };

        let reply = if envelope.kind == ERROR_TYPE {
            Err(serde_json::from_value(envelope.payload.clone())
                .unwrap_or_else(|_| ErrorPayload::new(envelope.payload.to_string())))
        } else {
            Ok(envelope.payload)
        };
        // the caller may have timed out in between
        let _ = tx.send(reply);
        None
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Fail every outstanding request with [`WorkbenchError::ChannelClosed`].
    pub async fn close(&self) {
        self.pending.lock().await.clear();
    }
}

/// Handles one inbound request type at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value>;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `handler` on one envelope and post its reply.
pub async fn dispatch(
    handler: &dyn MessageHandler,
    port: &dyn MessagePort,
    envelope: Envelope,
) -> Result<()> {
    let Envelope {
        kind,
        request_id,
        payload,
    } = envelope;

    let outcome = AssertUnwindSafe(handler.handle(&kind, payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "handler for '{}' panicked: {}",
                kind,
                panic_message(panic.as_ref())
            ))
        });

    match (request_id, outcome) {
        (Some(id), Ok(value)) => port.post(Envelope::success(&kind, id, value)).await,
        (Some(id), Err(e)) => {
            tracing::warn!(kind = %kind, request_id = %id, "request failed: {:#}", e);
            port.post(Envelope::error(id, &serialize_error(&e))).await
        }
        (None, Ok(_)) => Ok(()),
        (None, Err(e)) => {
            tracing::warn!(kind = %kind, "notification failed: {:#}", e);
            Ok(())
        }
    }
}

/// Serve inbound envelopes until `inbound` closes.
///
/// Replies to the engine's own requests are routed to `channel` when one
/// is given; every other envelope is dispatched to `handler` in its own
/// task. In-flight handlers are awaited before returning.
pub async fn run_message_loop(
    mut inbound: mpsc::Receiver<Envelope>,
    handler: Arc<dyn MessageHandler>,
    port: Arc<dyn MessagePort>,
    channel: Option<Arc<CorrelationChannel>>,
) {
    let mut tasks = JoinSet::new();

    while let Some(envelope) = inbound.recv().await {
        let envelope = match &channel {
            Some(channel) => match channel.receive(envelope).await {
                Some(envelope) => envelope,
                None => continue,
            },
            None => envelope,
        };

        let handler = handler.clone();
        let port = port.clone();
        tasks.spawn(async move {
            if let Err(e) = dispatch(handler.as_ref(), port.as_ref(), envelope).await {
                tracing::error!("failed to post reply: {:#}", e);
            }
        });

        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
    tracing::debug!("message loop finished");
}
