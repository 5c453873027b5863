use super::{
    template_parameters, CreateKeysAccepted, IdentityProvisioner, ProvisionedIdentity,
    ProvisioningRejected, ProvisioningRequest, RegisterThingAccepted, RegisterThingRequest,
};
use crate::identity::{CertificateBundle, IdentityStore};
use crate::parameters::ParameterStore;
use crate::transport::{
    publish_json, ConnectRequest, InboundMessage, MessageHandler, QoS, Session, SessionConnector,
    Transport,
};
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use common::topics::ProvisioningTopics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const CLAIM_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Bounds on the two broker round-trips of a bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningTimeouts {
    pub create_keys: Duration,
    pub register_thing: Duration,
}

impl Default for ProvisioningTimeouts {
    fn default() -> Self {
        Self {
            create_keys: Duration::from_secs(12),
            register_thing: Duration::from_secs(20),
        }
    }
}

/// Forwards every reply of the claim session into one channel
struct ReplyForwarder {
    replies: mpsc::UnboundedSender<InboundMessage>,
}

#[async_trait]
impl MessageHandler for ReplyForwarder {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()> {
        if self.replies.send(message).is_err() {
            debug!("provisioning finished, dropping late reply");
        }
        Ok(())
    }
}

enum Reply {
    Accepted(InboundMessage),
    Rejected(InboundMessage),
}

/// Identity bootstrap over a dedicated claim session
pub struct FleetProvisioner {
    connector: Arc<dyn SessionConnector>,
    identity: IdentityStore,
    parameters: Arc<ParameterStore>,
    endpoint: String,
    port: u16,
    keep_alive: Duration,
    timeouts: ProvisioningTimeouts,
}

impl FleetProvisioner {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        identity: IdentityStore,
        parameters: Arc<ParameterStore>,
        endpoint: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            connector,
            identity,
            parameters,
            endpoint: endpoint.into(),
            port,
            keep_alive: CLAIM_KEEP_ALIVE,
            timeouts: ProvisioningTimeouts::default(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ProvisioningTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn exchange(
        &self,
        transport: &dyn Transport,
        failures: &mut mpsc::UnboundedReceiver<AgentError>,
        request: &ProvisioningRequest,
    ) -> AgentResult<ProvisionedIdentity> {
        let template = request.template_name.as_str();
        let (replies_tx, mut replies) = mpsc::unbounded_channel();
        let forwarder: Arc<dyn MessageHandler> = Arc::new(ReplyForwarder {
            replies: replies_tx,
        });

        for filter in [
            ProvisioningTopics::create_keys_accepted(),
            ProvisioningTopics::create_keys_rejected(),
            ProvisioningTopics::register_thing_accepted(template),
            ProvisioningTopics::register_thing_rejected(template),
        ] {
            transport
                .subscribe(&filter, QoS::AtLeastOnce, Arc::clone(&forwarder))
                .await?;
        }

        debug!("requesting new keys and certificate");
        transport
            .publish(
                &ProvisioningTopics::create_keys(),
                QoS::AtLeastOnce,
                b"{}".to_vec(),
            )
            .await?;

        let keys: CreateKeysAccepted = match await_reply(
            &mut replies,
            failures,
            &ProvisioningTopics::create_keys_accepted(),
            &ProvisioningTopics::create_keys_rejected(),
            self.timeouts.create_keys,
        )
        .await
        .ok_or(AgentError::ProvisioningTimeout(self.timeouts.create_keys))??
        {
            Reply::Accepted(message) => message.parse_json()?,
            Reply::Rejected(message) => {
                return Err(rejection("create keys and certificate", &message))
            }
        };
        info!(certificate_id = %keys.certificate_id, "received new certificate");

        let register = RegisterThingRequest {
            certificate_ownership_token: keys.certificate_ownership_token.clone(),
            parameters: template_parameters(
                self.identity.device_name(),
                &request.mode,
                chrono::Utc::now().date_naive(),
            ),
        };
        publish_json(
            transport,
            &ProvisioningTopics::register_thing(template),
            &register,
        )
        .await?;

        let registered: RegisterThingAccepted = match await_reply(
            &mut replies,
            failures,
            &ProvisioningTopics::register_thing_accepted(template),
            &ProvisioningTopics::register_thing_rejected(template),
            self.timeouts.register_thing,
        )
        .await
        .ok_or(AgentError::RegistrationTimeout(self.timeouts.register_thing))??
        {
            Reply::Accepted(message) => message.parse_json()?,
            Reply::Rejected(message) => return Err(rejection("register thing", &message)),
        };
        info!(thing_name = %registered.thing_name, "thing registered");

        self.identity
            .persist(&CertificateBundle {
                certificate_pem: keys.certificate_pem,
                private_key: keys.private_key,
            })
            .await?;
        self.parameters.update(|p| p.new_device = true).await?;

        Ok(ProvisionedIdentity {
            certificate_id: keys.certificate_id,
            thing_name: registered.thing_name,
        })
    }
}

#[async_trait]
impl IdentityProvisioner for FleetProvisioner {
    #[instrument(
        name = "provision_identity",
        skip_all,
        fields(
            device_name = %self.identity.device_name(),
            template = %request.template_name,
            mode = ?request.mode
        )
    )]
    async fn provision(&self, request: ProvisioningRequest) -> AgentResult<ProvisionedIdentity> {
        let client_id = format!("provisioning-{}", Uuid::new_v4());
        let Session {
            transport,
            mut failures,
        } = self
            .connector
            .connect(ConnectRequest {
                endpoint: self.endpoint.clone(),
                port: self.port,
                client_id,
                identity: self.identity.claim_identity(),
                keep_alive: self.keep_alive,
                clean_session: false,
            })
            .await?;

        let result = self
            .exchange(transport.as_ref(), &mut failures, &request)
            .await;

        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "failed to disconnect claim session");
        }

        match &result {
            Ok(identity) => info!(
                certificate_id = %identity.certificate_id,
                "device identity provisioned"
            ),
            Err(e) => warn!(error = %e, "identity bootstrap failed"),
        }
        result
    }
}

/// Wait for the accepted or rejected reply of one request. `None` on timeout.
async fn await_reply(
    replies: &mut mpsc::UnboundedReceiver<InboundMessage>,
    failures: &mut mpsc::UnboundedReceiver<AgentError>,
    accepted: &str,
    rejected: &str,
    window: Duration,
) -> Option<AgentResult<Reply>> {
    let wait = async {
        loop {
            tokio::select! {
                Some(message) = replies.recv() => {
                    if message.topic == accepted {
                        return Ok(Reply::Accepted(message));
                    }
                    if message.topic == rejected {
                        return Ok(Reply::Rejected(message));
                    }
                    debug!(topic = %message.topic, "ignoring unrelated reply");
                }
                Some(err) = failures.recv() => return Err(err),
                else => return Err(AgentError::Connection("claim session closed".to_string())),
            }
        }
    };

    tokio::time::timeout(window, wait).await.ok()
}

fn rejection(operation: &str, message: &InboundMessage) -> AgentError {
    match message.parse_json::<ProvisioningRejected>() {
        Ok(rejected) => AgentError::rejected(operation, rejected.error_code, rejected.error_message),
        Err(e) => AgentError::rejected(operation, "Unknown", e.to_string()),
    }
}
