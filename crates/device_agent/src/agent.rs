use crate::firmware::{FirmwareUpdater, HttpFirmwareUpdater};
use crate::identity::{IdentityStore, DEFAULT_TRUST_ANCHOR_FILE};
use crate::jobs::{JobStateMachine, SprinklerJobExecutor, TaskFailurePolicy};
use crate::parameters::ParameterStore;
use crate::provisioning::{
    DeviceMetadata, FleetProvisioner, IdentityProvisioner, ProvisioningMode, ProvisioningRequest,
    ProvisioningTimeouts,
};
use crate::rotation::{
    CertificateRotation, CertificateRotator, CustomCertificateHandler, HttpTrustAnchorFetcher,
    TrustAnchorFetcher,
};
use crate::sensor::SensorCalibration;
use crate::shadow::{
    announce_new_device, ShadowDeltaHandler, ShadowGetAcceptedHandler, SimulatedValve,
    SprinklerValve, TelemetryLoop,
};
use crate::transport::{
    ConnectRequest, MqttConnector, QoS, SessionConnector, SessionSupervisor, Transport,
};
use crate::{AgentError, AgentResult};
use common::topics::DeviceTopics;
use sprinkler_runner::AppProcess;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

pub const DEFAULT_MQTT_PORT: u16 = 8883;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub endpoint: String,
    pub port: u16,
    pub device_name: String,
    pub devices_dir: PathBuf,
    pub trust_anchor_file: String,
    pub keep_alive: Duration,
    pub claim_keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub provisioning_timeouts: ProvisioningTimeouts,
    pub custom_certificate_timeout: Duration,
    pub http_timeout: Duration,
    pub task_failure_policy: TaskFailurePolicy,
}

impl AgentSettings {
    pub fn new(endpoint: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: DEFAULT_MQTT_PORT,
            device_name: device_name.into(),
            devices_dir: PathBuf::from("devices"),
            trust_anchor_file: DEFAULT_TRUST_ANCHOR_FILE.to_string(),
            keep_alive: Duration::from_secs(6),
            claim_keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            provisioning_timeouts: ProvisioningTimeouts::default(),
            custom_certificate_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(60),
            task_failure_policy: TaskFailurePolicy::default(),
        }
    }

    pub fn identity_store(&self) -> IdentityStore {
        IdentityStore::new(
            &self.devices_dir,
            self.device_name.clone(),
            self.trust_anchor_file.clone(),
        )
    }
}

/// The pieces of the agent that touch the outside world
pub struct AgentDependencies {
    pub connector: Arc<dyn SessionConnector>,
    pub trust_anchor_fetcher: Arc<dyn TrustAnchorFetcher>,
    pub firmware: Arc<dyn FirmwareUpdater>,
    pub valve: Arc<dyn SprinklerValve>,
}

impl AgentDependencies {
    /// MQTT over TLS, HTTPS downloads and a simulated valve
    pub fn production(settings: &AgentSettings) -> AgentResult<Self> {
        let identity = settings.identity_store();
        Ok(Self {
            connector: Arc::new(MqttConnector::new(
                settings.connect_timeout,
                settings.ack_timeout,
            )),
            trust_anchor_fetcher: Arc::new(HttpTrustAnchorFetcher::new(settings.http_timeout)?),
            firmware: Arc::new(HttpFirmwareUpdater::new(
                identity.firmware_dir(),
                settings.http_timeout,
            )?),
            valve: Arc::new(SimulatedValve),
        })
    }
}

/// Wires bootstrap, the device session and every handler together
pub struct DeviceAgent {
    settings: AgentSettings,
    deps: AgentDependencies,
}

impl DeviceAgent {
    pub fn new(settings: AgentSettings, deps: AgentDependencies) -> Self {
        Self { settings, deps }
    }

    fn provisioner(
        &self,
        identity: &IdentityStore,
        parameters: &Arc<ParameterStore>,
    ) -> Arc<FleetProvisioner> {
        Arc::new(
            FleetProvisioner::new(
                Arc::clone(&self.deps.connector),
                identity.clone(),
                Arc::clone(parameters),
                self.settings.endpoint.clone(),
                self.settings.port,
            )
            .with_keep_alive(self.settings.claim_keep_alive)
            .with_timeouts(self.settings.provisioning_timeouts),
        )
    }

    /// Bootstrap the identity when there is none, open the device session
    /// and bring every subscription up. The returned agent has not started
    /// publishing telemetry yet.
    #[instrument(skip_all, fields(device_name = %self.settings.device_name))]
    pub async fn start(self) -> AgentResult<RunningAgent> {
        let identity = self.settings.identity_store();
        let parameters = Arc::new(ParameterStore::new(identity.parameters_path()));
        let provisioner = self.provisioner(&identity, &parameters);

        let mut current = parameters.load().await?;
        if !identity.has_identity().await {
            info!("no device identity, provisioning with claim certificate");
            let provisioned = provisioner
                .provision(ProvisioningRequest {
                    template_name: current.provisioning_template_name.clone(),
                    mode: ProvisioningMode::Initial(DeviceMetadata::from(&current)),
                })
                .await?;
            info!(
                thing_name = %provisioned.thing_name,
                certificate_id = %provisioned.certificate_id,
                "device provisioned"
            );
            current = parameters.load().await?;
        }

        let session = self
            .deps
            .connector
            .connect(ConnectRequest {
                endpoint: self.settings.endpoint.clone(),
                port: self.settings.port,
                client_id: self.settings.device_name.clone(),
                identity: identity.device_identity(),
                keep_alive: self.settings.keep_alive,
                clean_session: true,
            })
            .await?;
        info!("device session connected");

        let topics = DeviceTopics::new(self.settings.device_name.clone());
        let supervisor = Arc::new(SessionSupervisor::new(Arc::clone(&session.transport)));
        let (calibration_tx, calibration_rx) =
            watch::channel(SensorCalibration::from(&current));

        let rotator = Arc::new(
            CertificateRotator::new(
                topics.clone(),
                Arc::clone(&session.transport),
                identity.clone(),
                Arc::clone(&parameters),
                provisioner as Arc<dyn IdentityProvisioner>,
                Arc::clone(&self.deps.trust_anchor_fetcher),
            )
            .with_custom_certificate_timeout(self.settings.custom_certificate_timeout),
        );
        let rotation: Arc<dyn CertificateRotation> = rotator.clone();
        let executor = Arc::new(SprinklerJobExecutor::new(
            rotation,
            Arc::clone(&self.deps.firmware),
        ));
        let jobs = Arc::new(JobStateMachine::new(
            topics.clone(),
            Arc::clone(&supervisor),
            executor,
            self.settings.task_failure_policy,
        ));

        let initialized = initialize_session(
            &topics,
            session.transport.as_ref(),
            &parameters,
            &jobs,
            SessionHandlers {
                delta: Arc::new(ShadowDeltaHandler::new(
                    topics.clone(),
                    Arc::clone(&session.transport),
                    Arc::clone(&self.deps.valve),
                )),
                get_accepted: Arc::new(ShadowGetAcceptedHandler::new(
                    calibration_tx,
                    Arc::clone(&parameters),
                )),
                custom_certificate: Arc::new(CustomCertificateHandler::new(rotator)),
            },
        )
        .await;
        if let Err(e) = initialized {
            supervisor.fail(&e).await;
            return Err(e);
        }

        let telemetry = TelemetryLoop::new(
            topics,
            Arc::clone(&supervisor),
            calibration_rx,
            current.message_interval(),
        );

        Ok(RunningAgent {
            supervisor,
            jobs,
            telemetry,
            failures: session.failures,
        })
    }
}

struct SessionHandlers {
    delta: Arc<ShadowDeltaHandler>,
    get_accepted: Arc<ShadowGetAcceptedHandler>,
    custom_certificate: Arc<CustomCertificateHandler>,
}

async fn initialize_session(
    topics: &DeviceTopics,
    transport: &dyn Transport,
    parameters: &ParameterStore,
    jobs: &Arc<JobStateMachine>,
    handlers: SessionHandlers,
) -> AgentResult<()> {
    if announce_new_device(topics, transport, parameters).await? {
        info!("new device announced");
    }

    transport
        .subscribe(&topics.shadow_delta(), QoS::AtLeastOnce, handlers.delta)
        .await?;
    transport
        .subscribe(
            &topics.shadow_get_accepted(),
            QoS::AtLeastOnce,
            handlers.get_accepted,
        )
        .await?;
    transport
        .subscribe(
            &topics.custom_certificate_complete(),
            QoS::AtLeastOnce,
            handlers.custom_certificate,
        )
        .await?;
    jobs.subscribe_all().await?;
    debug!("subscriptions established");

    transport
        .publish(&topics.shadow_get(), QoS::AtLeastOnce, b"{}".to_vec())
        .await?;
    jobs.try_start_next().await
}

/// A connected agent ready to be handed to the runner
pub struct RunningAgent {
    supervisor: Arc<SessionSupervisor>,
    jobs: Arc<JobStateMachine>,
    telemetry: TelemetryLoop,
    failures: mpsc::UnboundedReceiver<AgentError>,
}

impl RunningAgent {
    pub fn supervisor(&self) -> Arc<SessionSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn jobs(&self) -> Arc<JobStateMachine> {
        Arc::clone(&self.jobs)
    }

    /// The telemetry loop and the session watchdog. The watchdog ends the
    /// run with an error when the session fails.
    pub fn into_runner_processes(self) -> Vec<(String, AppProcess)> {
        let supervisor = self.supervisor;
        let failures = self.failures;
        let session: AppProcess =
            Box::new(move |ctx| Box::pin(async move { supervisor.supervise(failures, ctx).await }));
        vec![
            ("telemetry".to_string(), self.telemetry.into_runner_process()),
            ("session".to_string(), session),
        ]
    }
}
