use super::ack_tracker::{AckReceiver, AckTracker, RequestKind};
use super::{
    spawn_watched, ConnectRequest, InboundMessage, MessageHandler, QoS, Session,
    SessionConnector, TopicRouter, Transport,
};
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Transport as MqttTransport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Opens mutually authenticated TLS sessions with rumqttc
#[derive(Debug, Clone)]
pub struct MqttConnector {
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ack_timeout,
        }
    }
}

#[async_trait]
impl SessionConnector for MqttConnector {
    #[instrument(
        name = "mqtt_connect",
        skip_all,
        fields(client_id = %request.client_id, endpoint = %request.endpoint)
    )]
    async fn connect(&self, request: ConnectRequest) -> AgentResult<Session> {
        let tls = request.identity.read().await?;

        let mut options = MqttOptions::new(&request.client_id, &request.endpoint, request.port);
        options.set_keep_alive(request.keep_alive);
        options.set_clean_session(request.clean_session);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(MqttTransport::tls(
            tls.ca,
            Some((tls.certificate, tls.private_key)),
            None,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        tokio::time::timeout(self.connect_timeout, await_connack(&mut event_loop))
            .await
            .map_err(|_| {
                AgentError::Connection(format!(
                    "no CONNACK from {} within {:?}",
                    request.endpoint, self.connect_timeout
                ))
            })??;

        info!(client_id = %request.client_id, "connected to broker");

        let (failures_tx, failures) = mpsc::unbounded_channel();
        let router = Arc::new(TopicRouter::new(failures_tx.clone()));
        let acks = Arc::new(AckTracker::default());
        let disconnect_requested = Arc::new(AtomicBool::new(false));

        let on_abort = {
            let failures = failures_tx.clone();
            let acks = Arc::clone(&acks);
            move |err: AgentError| async move {
                acks.close(&err.to_string());
                let _ = failures.send(err);
            }
        };
        spawn_watched(
            "event loop",
            drive_event_loop(
                event_loop,
                Arc::clone(&router),
                Arc::clone(&acks),
                Arc::clone(&disconnect_requested),
                failures_tx,
            ),
            on_abort,
        );

        let session = MqttSession {
            client,
            router,
            acks,
            request_lock: Mutex::new(()),
            ack_timeout: self.ack_timeout,
            disconnect_requested,
        };

        Ok(Session {
            transport: Arc::new(session),
            failures,
        })
    }
}

async fn await_connack(event_loop: &mut EventLoop) -> AgentResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(AgentError::Connection(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(AgentError::Connection(e.to_string())),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    router: Arc<TopicRouter>,
    acks: Arc<AckTracker>,
    disconnect_requested: Arc<AtomicBool>,
    failures: mpsc::UnboundedSender<AgentError>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                router.dispatch(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.on_puback(ack.pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => acks.on_suback(ack.pkid, &ack.return_codes),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.on_outgoing_publish(pkid),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.on_outgoing_subscribe(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                acks.close("session disconnected");
                debug!("disconnect sent, stopping event loop");
                return;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                acks.close("broker closed the session");
                error!("broker closed the session");
                let _ = failures.send(AgentError::Connection("broker closed the session".to_string()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                acks.close(&e.to_string());
                if disconnect_requested.load(Ordering::SeqCst) {
                    debug!(error = %e, "event loop stopped after disconnect");
                } else {
                    error!(error = %e, "MQTT event loop error");
                    let _ = failures.send(AgentError::Connection(e.to_string()));
                }
                return;
            }
        }
    }
}

/// Live rumqttc session
pub struct MqttSession {
    client: AsyncClient,
    router: Arc<TopicRouter>,
    acks: Arc<AckTracker>,
    request_lock: Mutex<()>,
    ack_timeout: Duration,
    disconnect_requested: Arc<AtomicBool>,
}

impl MqttSession {
    async fn await_ack(&self, receiver: AckReceiver, what: &str) -> AgentResult<()> {
        match tokio::time::timeout(self.ack_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::Connection(format!(
                "event loop stopped before {} was acknowledged",
                what
            ))),
            Err(_) => {
                self.acks.forget_abandoned();
                Err(AgentError::Connection(format!(
                    "{} not acknowledged within {:?}",
                    what, self.ack_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> AgentResult<()> {
        // Route first so retained messages sent right after SUBACK are not lost
        self.router.register(filter, handler);

        let receiver = {
            let _guard = self.request_lock.lock().await;
            let receiver = self.acks.enqueue(RequestKind::Subscribe, filter, qos);
            if let Err(e) = self.client.subscribe(filter, qos).await {
                self.acks.abandon_last(RequestKind::Subscribe);
                self.router.unregister(filter);
                return Err(AgentError::Connection(e.to_string()));
            }
            receiver
        };

        let result = self
            .await_ack(receiver, &format!("subscription to '{}'", filter))
            .await;
        match &result {
            Ok(()) => debug!(topic = %filter, "subscribed"),
            Err(_) => self.router.unregister(filter),
        }
        result
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> AgentResult<()> {
        let receiver = {
            let _guard = self.request_lock.lock().await;
            let receiver = self.acks.enqueue(RequestKind::Publish, topic, qos);
            if let Err(e) = self.client.publish(topic, qos, false, payload).await {
                self.acks.abandon_last(RequestKind::Publish);
                return Err(AgentError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
            receiver
        };

        self.await_ack(receiver, &format!("publish to '{}'", topic))
            .await
            .map_err(|e| AgentError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> AgentResult<()> {
        if self.disconnect_requested.swap(true, Ordering::SeqCst) {
            debug!("disconnect already requested");
            return Ok(());
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "disconnect request could not be queued");
            return Err(AgentError::Connection(e.to_string()));
        }
        info!("disconnect requested");
        Ok(())
    }
}
