//! In-memory broker for exercising the agent without a network.
//!
//! [`FakeBroker`] implements [`Transport`] directly and can also be handed
//! out as a [`Session`] through [`FakeConnector`]. Replies are scripted with
//! [`FakeBroker::respond_to`]: whenever the device publishes on a matching
//! topic the responder's messages are delivered to the device's
//! subscriptions, just like a broker-side service answering a request.

use crate::transport::{
    ConnectRequest, InboundMessage, MessageHandler, QoS, Session, SessionConnector, TopicRouter,
    Transport,
};
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use common::topics::topic_matches;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// A publish the device issued
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Payload as JSON, `Null` when it does not parse
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

type Responder = Arc<dyn Fn(&PublishedMessage) -> Vec<InboundMessage> + Send + Sync>;

struct BrokerState {
    router: TopicRouter,
    failures_tx: mpsc::UnboundedSender<AgentError>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentError>>>,
    idle_senders: Mutex<Vec<mpsc::UnboundedSender<AgentError>>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    responders: Mutex<Vec<(String, Responder)>>,
    rejected_filters: Mutex<HashSet<String>>,
    failing_topics: Mutex<HashSet<String>>,
    disconnects: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeBroker {
    pub fn new() -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(BrokerState {
                router: TopicRouter::new(failures_tx.clone()),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
                idle_senders: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                responders: Mutex::new(Vec::new()),
                rejected_filters: Mutex::new(HashSet::new()),
                failing_topics: Mutex::new(HashSet::new()),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand the broker out as a session. The failure channel can be taken
    /// once; later sessions get a channel that never yields.
    pub fn session(&self) -> Session {
        let failures = locked(&self.state.failures_rx).take().unwrap_or_else(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            locked(&self.state.idle_senders).push(tx);
            rx
        });
        Session {
            transport: Arc::new(self.clone()),
            failures,
        }
    }

    /// Answer every publish on topics matching `filter`
    pub fn respond_to<F>(&self, filter: &str, responder: F)
    where
        F: Fn(&PublishedMessage) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        locked(&self.state.responders).push((filter.to_string(), Arc::new(responder)));
    }

    /// Refuse subscriptions to exactly this filter
    pub fn reject_subscription(&self, filter: &str) {
        locked(&self.state.rejected_filters).insert(filter.to_string());
    }

    /// Fail publishes to exactly this topic
    pub fn fail_publishes_on(&self, topic: &str) {
        locked(&self.state.failing_topics).insert(topic.to_string());
    }

    /// Deliver a message to the device's matching subscriptions
    pub fn deliver(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> usize {
        self.state.router.dispatch(InboundMessage::new(topic, payload))
    }

    /// Report a fatal session condition, as a dropped connection would
    pub fn inject_failure(&self, err: AgentError) {
        let _ = self.state.failures_tx.send(err);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        locked(&self.state.published).clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        locked(&self.state.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        locked(&self.state.subscriptions).clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` publishes on `topic` were seen or the
    /// timeout elapses; returns what was seen
    pub async fn wait_for_publishes(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.published_on(topic);
            if seen.len() >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> AgentResult<()> {
        if locked(&self.state.rejected_filters).contains(filter) {
            return Err(AgentError::SubscribeRejected {
                topic: filter.to_string(),
            });
        }
        self.state.router.register(filter, handler);
        locked(&self.state.subscriptions).push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> AgentResult<()> {
        if locked(&self.state.failing_topics).contains(topic) {
            return Err(AgentError::Publish {
                topic: topic.to_string(),
                reason: "no PUBACK".to_string(),
            });
        }

        let message = PublishedMessage {
            topic: topic.to_string(),
            qos,
            payload,
        };
        locked(&self.state.published).push(message.clone());

        let responders: Vec<Responder> = locked(&self.state.responders)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, responder)| Arc::clone(responder))
            .collect();
        for responder in responders {
            for reply in responder(&message) {
                self.state.router.dispatch(reply);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> AgentResult<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out queued fake brokers in order
#[derive(Default)]
pub struct FakeConnector {
    brokers: Mutex<VecDeque<FakeBroker>>,
    requests: Mutex<Vec<ConnectRequest>>,
}

impl FakeConnector {
    pub fn new(brokers: Vec<FakeBroker>) -> Self {
        Self {
            brokers: Mutex::new(brokers.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, request: ConnectRequest) -> AgentResult<Session> {
        let endpoint = request.endpoint.clone();
        locked(&self.requests).push(request);
        locked(&self.brokers)
            .pop_front()
            .map(|broker| broker.session())
            .ok_or_else(|| AgentError::Connection(format!("no broker at {}", endpoint)))
    }
}
