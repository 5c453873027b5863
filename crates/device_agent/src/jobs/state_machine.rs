use super::{
    JobExecution, JobExecutor, JobRejected, NextJobExecutionChanged,
    StartNextRequest, StartNextResponse, TaskFailurePolicy, UpdateJobExecutionRequest,
};
use crate::transport::{
    publish_json, spawn_watched, InboundMessage, MessageHandler, QoS, SessionSupervisor,
    Transport,
};
use crate::{AgentError, AgentResult};
use async_trait::async_trait;
use common::topics::{job_id_from_update_topic, DeviceTopics};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    /// start-next published, waiting for the broker's answer
    Claiming,
    Working { job_id: String },
}

#[derive(Debug)]
struct JobState {
    phase: JobPhase,
    next_job_waiting: bool,
}

/// Pulls and runs jobs one at a time.
///
/// Claiming counts as busy: while a start-next request is outstanding or a
/// job is running, further triggers only set the queued flag, which fires a
/// single re-claim once the running job's status update is accepted.
pub struct JobStateMachine {
    topics: DeviceTopics,
    supervisor: Arc<SessionSupervisor>,
    executor: Arc<dyn JobExecutor>,
    policy: TaskFailurePolicy,
    state: Mutex<JobState>,
}

impl JobStateMachine {
    pub fn new(
        topics: DeviceTopics,
        supervisor: Arc<SessionSupervisor>,
        executor: Arc<dyn JobExecutor>,
        policy: TaskFailurePolicy,
    ) -> Self {
        Self {
            topics,
            supervisor,
            executor,
            policy,
            state: Mutex::new(JobState {
                phase: JobPhase::Idle,
                next_job_waiting: false,
            }),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.lock().phase.clone()
    }

    pub fn is_next_job_waiting(&self) -> bool {
        self.lock().next_job_waiting
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.supervisor.transport()
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe every jobs topic with its handler
    pub async fn subscribe_all(self: &Arc<Self>) -> AgentResult<()> {
        let transport = self.transport();
        for topic in JobTopic::ALL {
            let filter = topic.filter(&self.topics);
            let handler = Arc::new(JobTopicHandler {
                machine: Arc::clone(self),
                topic,
            });
            transport
                .subscribe(&filter, QoS::AtLeastOnce, handler)
                .await?;
            debug!(topic = %filter, "subscribed to jobs topic");
        }
        Ok(())
    }

    /// Publish start-next unless a job is being claimed or worked on, or the
    /// session is going down
    pub async fn try_start_next(&self) -> AgentResult<()> {
        {
            let mut state = self.lock();
            if state.phase != JobPhase::Idle {
                debug!(phase = ?state.phase, "already working on a job");
                return Ok(());
            }
            if self.supervisor.is_disconnecting() {
                debug!("disconnecting, not starting a job");
                return Ok(());
            }
            state.phase = JobPhase::Claiming;
            state.next_job_waiting = false;
        }

        info!("requesting next pending job execution");
        let request = StartNextRequest {
            client_token: Some(Uuid::new_v4().to_string()),
        };
        publish_json(
            self.transport().as_ref(),
            &self.topics.jobs_start_next(),
            &request,
        )
        .await
    }

    pub async fn on_next_job_changed(&self, event: NextJobExecutionChanged) -> AgentResult<()> {
        let Some(execution) = event.execution else {
            info!("no pending jobs, waiting for further jobs");
            return Ok(());
        };
        info!(job_id = %execution.job_id, "next job execution changed");

        {
            let mut state = self.lock();
            if state.phase != JobPhase::Idle {
                state.next_job_waiting = true;
                debug!("busy, job queued until the current one is done");
                return Ok(());
            }
        }
        self.try_start_next().await
    }

    pub async fn on_start_next_accepted(
        self: &Arc<Self>,
        response: StartNextResponse,
    ) -> AgentResult<()> {
        let Some(execution) = response.execution else {
            {
                let state = self.lock();
                if state.phase != JobPhase::Claiming {
                    debug!(phase = ?state.phase, "ignoring start next acceptance without a job");
                    return Ok(());
                }
            }
            info!("start next accepted without a job, waiting for further jobs");
            return self.done_working().await;
        };

        {
            let mut state = self.lock();
            match &state.phase {
                JobPhase::Claiming => {}
                JobPhase::Working { job_id } if *job_id == execution.job_id => {
                    debug!(job_id = %job_id, "duplicate start next acceptance");
                    return Ok(());
                }
                other => {
                    warn!(phase = ?other, job_id = %execution.job_id, "unexpected start next acceptance");
                    return Ok(());
                }
            }
            state.phase = JobPhase::Working {
                job_id: execution.job_id.clone(),
            };
        }

        let machine = Arc::clone(self);
        let supervisor = Arc::clone(&self.supervisor);
        let span = info_span!("job", job_id = %execution.job_id);
        spawn_watched(
            "job",
            async move { machine.run_job(execution).await }.instrument(span),
            move |err| async move {
                supervisor.fail(&err).await;
            },
        );
        Ok(())
    }

    pub async fn on_start_next_rejected(&self, rejected: JobRejected) -> AgentResult<()> {
        let err = AgentError::rejected(
            "start next pending job execution",
            rejected.code,
            rejected.message,
        );
        self.supervisor.fail(&err).await;
        Err(err)
    }

    pub async fn on_update_accepted(&self, job_id: &str) -> AgentResult<()> {
        {
            let state = self.lock();
            match &state.phase {
                JobPhase::Working { job_id: current } if current == job_id => {}
                other => {
                    debug!(job_id = %job_id, phase = ?other, "ignoring update acceptance");
                    return Ok(());
                }
            }
        }
        info!(job_id = %job_id, "job status update accepted");
        self.done_working().await
    }

    pub async fn on_update_rejected(&self, job_id: &str, rejected: JobRejected) -> AgentResult<()> {
        let err = AgentError::rejected(
            format!("update job execution {}", job_id),
            rejected.code,
            rejected.message,
        );
        self.supervisor.fail(&err).await;
        Err(err)
    }

    async fn done_working(&self) -> AgentResult<()> {
        let try_again = {
            let mut state = self.lock();
            state.phase = JobPhase::Idle;
            state.next_job_waiting
        };

        if try_again {
            self.try_start_next().await
        } else {
            Ok(())
        }
    }

    #[instrument(name = "run_job", skip_all, fields(job_id = %execution.job_id))]
    async fn run_job(self: Arc<Self>, execution: JobExecution) {
        let report = self
            .executor
            .execute(&execution.job_id, &execution.job_document)
            .await;

        if let Some(err) = report.session_failure() {
            self.supervisor.fail(err).await;
            return;
        }

        let status = report.final_status(self.policy);
        info!(%status, failures = report.failures.len(), "publishing job status");

        let request = UpdateJobExecutionRequest {
            status,
            status_details: None,
            client_token: Some(Uuid::new_v4().to_string()),
        };
        if let Err(e) = publish_json(
            self.transport().as_ref(),
            &self.topics.job_update(&execution.job_id),
            &request,
        )
        .await
        {
            self.supervisor.fail(&e).await;
        }
    }
}

/// The five jobs topics the device listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTopic {
    NotifyNext,
    StartNextAccepted,
    StartNextRejected,
    UpdateAccepted,
    UpdateRejected,
}

impl JobTopic {
    pub const ALL: [JobTopic; 5] = [
        JobTopic::NotifyNext,
        JobTopic::StartNextAccepted,
        JobTopic::StartNextRejected,
        JobTopic::UpdateAccepted,
        JobTopic::UpdateRejected,
    ];

    pub fn filter(&self, topics: &DeviceTopics) -> String {
        match self {
            JobTopic::NotifyNext => topics.jobs_notify_next(),
            JobTopic::StartNextAccepted => topics.jobs_start_next_accepted(),
            JobTopic::StartNextRejected => topics.jobs_start_next_rejected(),
            JobTopic::UpdateAccepted => topics.job_update_accepted_filter(),
            JobTopic::UpdateRejected => topics.job_update_rejected_filter(),
        }
    }
}

struct JobTopicHandler {
    machine: Arc<JobStateMachine>,
    topic: JobTopic,
}

impl JobTopicHandler {
    fn job_id(message: &InboundMessage) -> AgentResult<&str> {
        job_id_from_update_topic(&message.topic).ok_or_else(|| AgentError::InvalidMessage {
            topic: message.topic.clone(),
            reason: "no job id in topic".to_string(),
        })
    }
}

#[async_trait]
impl MessageHandler for JobTopicHandler {
    async fn handle(&self, message: InboundMessage) -> AgentResult<()> {
        match self.topic {
            JobTopic::NotifyNext => {
                self.machine
                    .on_next_job_changed(message.parse_json()?)
                    .await
            }
            JobTopic::StartNextAccepted => {
                self.machine
                    .on_start_next_accepted(message.parse_json()?)
                    .await
            }
            JobTopic::StartNextRejected => {
                self.machine
                    .on_start_next_rejected(message.parse_json()?)
                    .await
            }
            JobTopic::UpdateAccepted => {
                let job_id = Self::job_id(&message)?;
                self.machine.on_update_accepted(job_id).await
            }
            JobTopic::UpdateRejected => {
                let job_id = Self::job_id(&message)?;
                self.machine
                    .on_update_rejected(job_id, message.parse_json()?)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::MockFirmwareUpdater;
    use crate::jobs::{JobDocument, JobReport, MockJobExecutor, SprinklerJobExecutor};
    use crate::rotation::MockCertificateRotation;
    use crate::testing::FakeBroker;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    const THING: &str = "sprinkler-01";

    /// Holds every job until released
    struct GatedExecutor {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobExecutor for GatedExecutor {
        async fn execute(&self, _job_id: &str, _document: &JobDocument) -> JobReport {
            self.release.notified().await;
            JobReport::default()
        }
    }

    fn machine_with(
        broker: &FakeBroker,
        executor: Arc<dyn JobExecutor>,
        policy: TaskFailurePolicy,
    ) -> Arc<JobStateMachine> {
        let supervisor = Arc::new(SessionSupervisor::new(Arc::new(broker.clone())));
        Arc::new(JobStateMachine::new(
            DeviceTopics::new(THING),
            supervisor,
            executor,
            policy,
        ))
    }

    fn notify_next(job_id: &str) -> NextJobExecutionChanged {
        serde_json::from_value(json!({"execution": {"jobId": job_id, "jobDocument": {}}})).unwrap()
    }

    fn accepted(job_id: &str) -> StartNextResponse {
        serde_json::from_value(json!({"execution": {"jobId": job_id, "jobDocument": {}}})).unwrap()
    }

    fn start_next_count(broker: &FakeBroker) -> usize {
        broker
            .published_on(&DeviceTopics::new(THING).jobs_start_next())
            .len()
    }

    #[tokio::test]
    async fn test_try_start_next_while_claiming_is_noop() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        machine.try_start_next().await.unwrap();
        machine.try_start_next().await.unwrap();

        assert_eq!(machine.phase(), JobPhase::Claiming);
        assert_eq!(start_next_count(&broker), 1);
    }

    #[tokio::test]
    async fn test_notifications_while_working_queue_a_single_claim() {
        let broker = FakeBroker::new();
        let release = Arc::new(Notify::new());
        let machine = machine_with(
            &broker,
            Arc::new(GatedExecutor {
                release: release.clone(),
            }),
            TaskFailurePolicy::default(),
        );

        machine.on_next_job_changed(notify_next("job-1")).await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();
        assert_eq!(
            machine.phase(),
            JobPhase::Working {
                job_id: "job-1".to_string()
            }
        );

        machine.on_next_job_changed(notify_next("job-2")).await.unwrap();
        machine.on_next_job_changed(notify_next("job-2")).await.unwrap();
        assert!(machine.is_next_job_waiting());
        assert_eq!(start_next_count(&broker), 1);

        release.notify_one();
        let updates = broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-1"),
                1,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(updates[0].json()["status"], "SUCCEEDED");

        machine.on_update_accepted("job-1").await.unwrap();
        assert_eq!(start_next_count(&broker), 2);
        assert_eq!(machine.phase(), JobPhase::Claiming);
        assert!(!machine.is_next_job_waiting());
    }

    #[tokio::test]
    async fn test_accepted_without_job_returns_to_idle() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        machine.try_start_next().await.unwrap();
        machine
            .on_start_next_accepted(serde_json::from_value(json!({})).unwrap())
            .await
            .unwrap();

        assert_eq!(machine.phase(), JobPhase::Idle);
        machine.on_next_job_changed(notify_next("job-3")).await.unwrap();
        assert_eq!(start_next_count(&broker), 2);
    }

    #[tokio::test]
    async fn test_stale_acceptances_while_working_are_ignored() {
        let broker = FakeBroker::new();
        let release = Arc::new(Notify::new());
        let machine = machine_with(
            &broker,
            Arc::new(GatedExecutor {
                release: release.clone(),
            }),
            TaskFailurePolicy::default(),
        );
        let working = JobPhase::Working {
            job_id: "job-1".to_string(),
        };

        machine.try_start_next().await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();

        // redelivered empty answer to an earlier claim
        machine
            .on_start_next_accepted(serde_json::from_value(json!({})).unwrap())
            .await
            .unwrap();
        assert_eq!(machine.phase(), working);

        // answer naming a job other than the running one
        machine.on_start_next_accepted(accepted("job-0")).await.unwrap();
        assert_eq!(machine.phase(), working);

        machine.on_next_job_changed(notify_next("job-2")).await.unwrap();
        assert_eq!(machine.phase(), working);
        assert!(machine.is_next_job_waiting());
        assert_eq!(start_next_count(&broker), 1);

        release.notify_one();
        let updates = broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-1"),
                1,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(updates.len(), 1);
        assert!(broker
            .published_on(&DeviceTopics::new(THING).job_update("job-0"))
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_acceptance_while_idle_is_ignored() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        machine
            .on_start_next_accepted(serde_json::from_value(json!({})).unwrap())
            .await
            .unwrap();

        assert_eq!(machine.phase(), JobPhase::Idle);
        assert_eq!(start_next_count(&broker), 0);
    }

    #[tokio::test]
    async fn test_failed_identity_rotation_reports_succeeded_and_stays_connected() {
        let broker = FakeBroker::new();
        let mut rotation = MockCertificateRotation::new();
        rotation.expect_rotate_identity().times(1).returning(|| {
            Err(AgentError::bootstrap(AgentError::rejected(
                "register thing",
                "InvalidParameters",
                "unknown template parameter",
            )))
        });
        let mut firmware = MockFirmwareUpdater::new();
        firmware.expect_update().times(0);
        let supervisor = Arc::new(SessionSupervisor::new(Arc::new(broker.clone())));
        let machine = Arc::new(JobStateMachine::new(
            DeviceTopics::new(THING),
            supervisor.clone(),
            Arc::new(SprinklerJobExecutor::new(
                Arc::new(rotation),
                Arc::new(firmware),
            )),
            TaskFailurePolicy::default(),
        ));

        machine.try_start_next().await.unwrap();
        machine
            .on_start_next_accepted(
                serde_json::from_value(json!({"execution": {
                    "jobId": "job-rotate",
                    "jobDocument": {"task": "UPDATE_DEVICE_IOT_CERTIFICATES"}
                }}))
                .unwrap(),
            )
            .await
            .unwrap();

        let updates = broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-rotate"),
                1,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(updates[0].json()["status"], "SUCCEEDED");
        assert_eq!(broker.disconnects(), 0);
        assert!(!supervisor.is_disconnecting());
    }

    #[tokio::test]
    async fn test_duplicate_acceptance_runs_job_once() {
        let broker = FakeBroker::new();
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(|_, _| JobReport::default());
        let machine = machine_with(&broker, Arc::new(executor), TaskFailurePolicy::default());

        machine.try_start_next().await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();

        broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-1"),
                1,
                Duration::from_secs(1),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            broker
                .published_on(&DeviceTopics::new(THING).job_update("job-1"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_task_failure_reports_succeeded_by_default() {
        let broker = FakeBroker::new();
        let mut executor = MockJobExecutor::new();
        executor.expect_execute().returning(|_, _| JobReport {
            failures: vec![AgentError::TrustAnchor("not a certificate".to_string())],
        });
        let machine = machine_with(&broker, Arc::new(executor), TaskFailurePolicy::default());

        machine.try_start_next().await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();

        let updates = broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-1"),
                1,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(updates[0].json()["status"], "SUCCEEDED");
    }

    struct PanickingExecutor;

    #[async_trait]
    impl JobExecutor for PanickingExecutor {
        async fn execute(&self, job_id: &str, _document: &JobDocument) -> JobReport {
            panic!("executor bug while running {}", job_id);
        }
    }

    #[tokio::test]
    async fn test_panicking_job_ends_the_session() {
        let broker = FakeBroker::new();
        let supervisor = Arc::new(SessionSupervisor::new(Arc::new(broker.clone())));
        let machine = Arc::new(JobStateMachine::new(
            DeviceTopics::new(THING),
            supervisor.clone(),
            Arc::new(PanickingExecutor),
            TaskFailurePolicy::default(),
        ));

        machine.try_start_next().await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), supervisor.wait())
            .await
            .unwrap();
        assert_eq!(broker.disconnects(), 1);
        assert!(matches!(
            supervisor.exit_reason(),
            Some(crate::transport::ExitReason::Fatal(reason)) if reason.contains("job task failed")
        ));
        assert!(broker
            .published_on(&DeviceTopics::new(THING).job_update("job-1"))
            .is_empty());
    }

    #[tokio::test]
    async fn test_task_failure_reports_failed_when_opted_in() {
        let broker = FakeBroker::new();
        let mut executor = MockJobExecutor::new();
        executor.expect_execute().returning(|_, _| JobReport {
            failures: vec![AgentError::Firmware("404".to_string())],
        });
        let machine = machine_with(&broker, Arc::new(executor), TaskFailurePolicy::ReportFailed);

        machine.try_start_next().await.unwrap();
        machine.on_start_next_accepted(accepted("job-1")).await.unwrap();

        let updates = broker
            .wait_for_publishes(
                &DeviceTopics::new(THING).job_update("job-1"),
                1,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(updates[0].json()["status"], "FAILED");
    }

    #[tokio::test]
    async fn test_start_next_rejection_disconnects_once_and_stops() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );
        machine.try_start_next().await.unwrap();
        let published_before = broker.published().len();

        let rejected = JobRejected {
            code: "InvalidToken".to_string(),
            message: "bad token".to_string(),
            client_token: None,
        };
        let err = machine.on_start_next_rejected(rejected.clone()).await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected { ref code, .. } if code == "InvalidToken"));
        let _ = machine.on_start_next_rejected(rejected).await;

        machine.on_update_accepted("job-1").await.unwrap();
        machine.on_next_job_changed(notify_next("job-2")).await.unwrap();

        assert_eq!(broker.disconnects(), 1);
        assert_eq!(broker.published().len(), published_before);
    }

    #[tokio::test]
    async fn test_update_rejection_is_fatal() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        let result = machine
            .on_update_rejected(
                "job-1",
                JobRejected {
                    code: "InvalidStateTransition".to_string(),
                    message: "terminal".to_string(),
                    client_token: None,
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(broker.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_no_claim_while_disconnecting() {
        let broker = FakeBroker::new();
        let supervisor = Arc::new(SessionSupervisor::new(Arc::new(broker.clone())));
        let machine = JobStateMachine::new(
            DeviceTopics::new(THING),
            supervisor.clone(),
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        supervisor
            .exit(crate::transport::ExitReason::Shutdown)
            .await;
        machine.try_start_next().await.unwrap();

        assert_eq!(start_next_count(&broker), 0);
        assert_eq!(machine.phase(), JobPhase::Idle);
    }

    #[tokio::test]
    async fn test_subscribe_all_routes_job_topics() {
        let broker = FakeBroker::new();
        let machine = machine_with(
            &broker,
            Arc::new(MockJobExecutor::new()),
            TaskFailurePolicy::default(),
        );

        machine.subscribe_all().await.unwrap();
        let topics = DeviceTopics::new(THING);
        assert_eq!(
            broker.subscriptions(),
            vec![
                topics.jobs_notify_next(),
                topics.jobs_start_next_accepted(),
                topics.jobs_start_next_rejected(),
                topics.job_update_accepted_filter(),
                topics.job_update_rejected_filter(),
            ]
        );

        broker.deliver(
            &topics.jobs_notify_next(),
            json!({"execution": {"jobId": "job-9", "jobDocument": {}}}).to_string(),
        );
        let claims = broker
            .wait_for_publishes(&topics.jobs_start_next(), 1, Duration::from_secs(1))
            .await;
        assert_eq!(claims.len(), 1);
    }
}
