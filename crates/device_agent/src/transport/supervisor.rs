use super::Transport;
use crate::AgentError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Fatal(String),
    Shutdown,
}

/// Owns the guarded disconnect of one device session.
///
/// The first caller of [`SessionSupervisor::exit`] records the reason and
/// issues the disconnect; every later caller is a no-op.
pub struct SessionSupervisor {
    transport: Arc<dyn Transport>,
    disconnecting: AtomicBool,
    reason: Mutex<Option<ExitReason>>,
    finished: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            disconnecting: AtomicBool::new(false),
            reason: Mutex::new(None),
            finished: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Returns true when this call performed the disconnect
    pub async fn exit(&self, reason: ExitReason) -> bool {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            debug!(?reason, "disconnect already in progress");
            return false;
        }

        match &reason {
            ExitReason::Fatal(message) => error!(reason = %message, "disconnecting after fatal error"),
            ExitReason::Shutdown => info!("disconnecting for shutdown"),
        }
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);

        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.finished.cancel();
        true
    }

    pub async fn fail(&self, err: &AgentError) -> bool {
        self.exit(ExitReason::Fatal(err.to_string())).await
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolves once the disconnect has been issued
    pub async fn wait(&self) {
        self.finished.cancelled().await
    }

    /// Escalate session failures to a disconnect and end with the recorded reason
    pub async fn supervise(
        self: Arc<Self>,
        mut failures: mpsc::UnboundedReceiver<AgentError>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.finished.cancelled() => break,
                failure = failures.recv() => match failure {
                    Some(err) => {
                        self.fail(&err).await;
                    }
                    None => {
                        self.exit(ExitReason::Fatal("session closed unexpectedly".to_string())).await;
                        self.wait().await;
                    }
                },
                _ = shutdown.cancelled() => {
                    self.exit(ExitReason::Shutdown).await;
                    self.wait().await;
                }
            }
        }

        match self.exit_reason() {
            Some(ExitReason::Fatal(reason)) => Err(anyhow::anyhow!("session ended: {}", reason)),
            _ => {
                info!("session closed");
                Ok(())
            }
        }
    }
}
