use crate::parameters::ParameterStore;
use crate::sensor::{MoistureSimulator, SensorCalibration};
use crate::transport::{publish_json, InboundMessage, MessageHandler, SessionSupervisor, Transport};
use crate::AgentResult;
use async_trait::async_trait;
use common::messages::{
    DeviceAnnouncement, ShadowDelta, ShadowGetAccepted, ShadowUpdate, SoilMoistureTelemetry,
    SprinklerReport, SprinklerState,
};
use common::topics::DeviceTopics;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sprinkler_runner::AppProcess;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Physical sprinkler actuation
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SprinklerValve: Send + Sync {
    async fn set(&self, state: SprinklerState) -> AgentResult<()>;
}

/// Valve for devices without actuator hardware
#[derive(Debug, Default)]
pub struct SimulatedValve;

#[async_trait]
impl SprinklerValve for SimulatedValve {
    async fn set(&self, state: SprinklerState) -> AgentResult<()> {
        info!(sprinkler_state = %state, "sprinkler turned {}", state);
        Ok(())
    }
}

/// Applies desired sprinkler state and reports it back
pub struct ShadowDeltaHandler {
    topics: DeviceTopics,
    transport: Arc<dyn Transport>,
    valve: Arc<dyn SprinklerValve>,
}

impl ShadowDeltaHandler {
    pub fn new(
        topics: DeviceTopics,
        transport: Arc<dyn Transport>,
        valve: Arc<dyn SprinklerValve>,
    ) -> Self {
        Self {
            topics,
            transport,
            valve,
        }
    }
}

#[async_trait]
impl MessageHandler for ShadowDeltaHandler {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()> {
        let delta: ShadowDelta = match message.parse_json() {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, "ignoring malformed shadow delta");
                return Ok(());
            }
        };
        let Some(desired) = delta.state.sprinkler_state else {
            debug!("shadow delta without sprinkler state");
            return Ok(());
        };

        info!(desired = %desired, "desired sprinkler state");
        if let Err(e) = self.valve.set(desired).await {
            warn!(error = %e, "valve did not switch, not reporting state");
            return Ok(());
        }

        publish_json(
            self.transport.as_ref(),
            &self.topics.shadow_update(),
            &ShadowUpdate::reported(SprinklerReport {
                sprinkler_state: desired,
            }),
        )
        .await?;
        debug!("updated shadow document");
        Ok(())
    }
}

/// Takes calibration values from the shadow, which is the source of truth
pub struct ShadowGetAcceptedHandler {
    calibration: watch::Sender<SensorCalibration>,
    parameters: Arc<ParameterStore>,
}

impl ShadowGetAcceptedHandler {
    pub fn new(calibration: watch::Sender<SensorCalibration>, parameters: Arc<ParameterStore>) -> Self {
        Self {
            calibration,
            parameters,
        }
    }
}

#[async_trait]
impl MessageHandler for ShadowGetAcceptedHandler {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()> {
        let document: ShadowGetAccepted = match message.parse_json() {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "ignoring malformed shadow document");
                return Ok(());
            }
        };
        let Some(reported) = document.state.reported else {
            debug!("shadow document has no reported section");
            return Ok(());
        };

        let current = *self.calibration.borrow();
        let updated = current.merged(&reported);
        if updated == current {
            debug!("calibration unchanged");
            return Ok(());
        }
        self.calibration.send_replace(updated);
        info!(
            hydrated = updated.hydrated,
            dry = updated.dry,
            trigger_percentage = updated.trigger_percentage,
            "calibration updated from shadow"
        );

        let persisted = self
            .parameters
            .update(|p| {
                p.abs_hydrated_state_value = updated.hydrated;
                p.abs_dry_state_value = updated.dry;
                p.sprinkler_trigger_percentage = updated.trigger_percentage;
            })
            .await;
        if let Err(e) = persisted {
            warn!(error = %e, "calibration not persisted");
        }
        Ok(())
    }
}

/// Report the sensor parameters of a freshly provisioned device once.
/// Returns whether an announcement was published.
#[instrument(skip_all, fields(device_name = %topics.thing_name()))]
pub async fn announce_new_device(
    topics: &DeviceTopics,
    transport: &dyn Transport,
    parameters: &ParameterStore,
) -> AgentResult<bool> {
    let current = parameters.load().await?;
    if !current.new_device {
        return Ok(false);
    }

    info!("updating shadow document with sensor parameters");
    publish_json(
        transport,
        &topics.shadow_update(),
        &ShadowUpdate::reported(DeviceAnnouncement {
            flow_rate: current.flow_rate,
            abs_hydrated_state_value: current.abs_hydrated_state_value,
            abs_dry_state_value: current.abs_dry_state_value,
            sprinkler_trigger_percentage: current.sprinkler_trigger_percentage,
        }),
    )
    .await?;

    parameters.update(|p| p.new_device = false).await?;
    Ok(true)
}

/// Publishes a simulated soil moisture sample every interval
pub struct TelemetryLoop {
    topics: DeviceTopics,
    supervisor: Arc<SessionSupervisor>,
    calibration: watch::Receiver<SensorCalibration>,
    interval: Duration,
    simulator: MoistureSimulator<StdRng>,
}

impl TelemetryLoop {
    pub fn new(
        topics: DeviceTopics,
        supervisor: Arc<SessionSupervisor>,
        calibration: watch::Receiver<SensorCalibration>,
        interval: Duration,
    ) -> Self {
        Self {
            topics,
            supervisor,
            calibration,
            interval,
            simulator: MoistureSimulator::new(StdRng::from_entropy()),
        }
    }

    pub fn with_simulator(mut self, simulator: MoistureSimulator<StdRng>) -> Self {
        self.simulator = simulator;
        self
    }

    #[instrument(name = "telemetry_loop", skip_all, fields(device_name = %self.topics.thing_name()))]
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        let transport = self.supervisor.transport();
        let topic = self.topics.soil_moisture();
        info!(interval = ?self.interval, "begin publishing soil moisture");

        loop {
            if self.supervisor.is_disconnecting() {
                break;
            }

            let calibration = *self.calibration.borrow();
            match self
                .simulator
                .next_reading(&calibration)
                .and_then(|raw| calibration.moisture_percentage(raw))
            {
                Some(percentage) => {
                    let sample = SoilMoistureTelemetry::new(
                        self.topics.thing_name(),
                        calibration.classify(percentage),
                        percentage,
                    );
                    if let Err(e) = publish_json(transport.as_ref(), &topic, &sample).await {
                        self.supervisor.fail(&e).await;
                        return Err(e.into());
                    }
                    debug!(
                        percentage,
                        state = ?sample.reported_state,
                        "published soil moisture"
                    );
                }
                None => warn!(
                    hydrated = calibration.hydrated,
                    dry = calibration.dry,
                    "calibration has no drying range, skipping sample"
                ),
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.supervisor.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("telemetry loop stopped");
        Ok(())
    }

    pub fn into_runner_process(self) -> AppProcess {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}
