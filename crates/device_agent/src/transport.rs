mod ack_tracker;
mod mqtt_session;
mod router;
mod supervisor;

pub use mqtt_session::*;
pub use router::*;
pub use supervisor::*;

pub use rumqttc::QoS;

use crate::identity::IdentityPaths;
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, Instrument, Span};

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> AgentResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| AgentError::InvalidMessage {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })
    }
}

/// Receives every message for one subscription, in delivery order.
///
/// Returning an error is fatal for the session the handler is attached to.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()>;
}

/// One authenticated publish/subscribe session with the broker
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the broker has granted the subscription
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> AgentResult<()>;

    /// Resolves once the broker has acknowledged the publish (QoS 1)
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> AgentResult<()>;

    /// Idempotent: only the first call reaches the broker
    async fn disconnect(&self) -> AgentResult<()>;
}

/// Serialize and publish at-least-once
pub async fn publish_json<T: Serialize + Sync>(
    transport: &dyn Transport,
    topic: &str,
    message: &T,
) -> AgentResult<()> {
    let payload = serde_json::to_vec(message).map_err(|e| AgentError::Publish {
        topic: topic.to_string(),
        reason: format!("cannot serialize payload: {}", e),
    })?;
    transport.publish(topic, QoS::AtLeastOnce, payload).await
}

/// Spawn `task` and keep its handle; if the task panics the join error is
/// logged and handed to `on_abort`.
pub(crate) fn spawn_watched<F, A, AF>(name: &'static str, task: F, on_abort: A)
where
    F: Future<Output = ()> + Send + 'static,
    A: FnOnce(AgentError) -> AF + Send + 'static,
    AF: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(
        async move {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task ended abnormally");
                on_abort(AgentError::Other(anyhow::anyhow!("{} task failed: {}", name, e))).await;
            }
        }
        .instrument(Span::current()),
    );
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub identity: IdentityPaths,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

/// An open session plus the channel on which it reports fatal conditions
/// (lost connection, handler failures).
pub struct Session {
    pub transport: Arc<dyn Transport>,
    pub failures: mpsc::UnboundedReceiver<AgentError>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> AgentResult<Session>;
}
