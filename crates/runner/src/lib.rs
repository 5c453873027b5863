//! Runs the long-lived pieces of a device process side by side and tears
//! them down together.
//!
//! - Named app processes run concurrently until one fails or a shutdown
//!   signal arrives
//! - Closers always run afterwards, bounded by a timeout
//! - The process exit code reflects whether any app process failed
//!
//! # Example
//!
//! ```no_run
//! use sprinkler_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process(|ctx| async move {
//!             ctx.cancelled().await;
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("disconnecting");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Boxed app process. Receives the shared cancellation token.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Boxed cleanup function run after every app process has stopped.
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Every app process returned on its own
    Completed,
    /// A signal or the external token stopped the run
    Cancelled,
    /// An app process failed or panicked; the others were cancelled
    Failed {
        process: String,
        error: anyhow::Error,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Completed | RunOutcome::Cancelled => 0,
        }
    }
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds; SIGINT/SIGTERM are handled.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("process-{}", self.app_processes.len());
        self.with_named_process(name, Box::new(|token| Box::pin(process(token))))
    }

    /// Adds an already boxed process under a name used in logs and in
    /// [`RunOutcome::Failed`].
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push((name.into(), process));
        self
    }

    /// Closers run concurrently once all app processes have stopped. A
    /// failing closer does not prevent the others from running.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Lets the caller stop the run from outside.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disable SIGINT/SIGTERM handling, used when embedding the runner.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Runs to completion and exits the process with the outcome's code.
    pub async fn run(self) {
        let outcome = self.drive().await;
        match &outcome {
            RunOutcome::Failed { process, error } => {
                error!(process = %process, "application exiting with error: {:#}", error);
            }
            RunOutcome::Completed | RunOutcome::Cancelled => {
                info!("application exiting normally");
            }
        }
        std::process::exit(outcome.exit_code());
    }

    /// Runs all processes and closers and reports how the run ended.
    pub async fn drive(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                let result = process(process_token).await;
                (name, result)
            });
        }

        let signal_tasks = if self.handle_signals {
            spawn_signal_handlers(&token)
        } else {
            Vec::new()
        };

        let mut failure: Option<(String, anyhow::Error)> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    if token.is_cancelled() {
                        warn!(process = %name, "app process error after cancellation: {:#}", err);
                    } else {
                        error!(process = %name, "app process error: {:#}", err);
                        failure = Some((name, err));
                        token.cancel();
                    }
                }
                Err(err) => {
                    error!("app process panicked: {}", err);
                    if !token.is_cancelled() {
                        failure = Some(("unknown".to_string(), anyhow::anyhow!(err.to_string())));
                        token.cancel();
                    }
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        let cancelled = token.is_cancelled();
        token.cancel();

        // Give the remaining processes the closer timeout to notice the token
        let drained = tokio::time::timeout(self.closer_timeout, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => debug!(process = %name, "app process stopped"),
                    Ok((name, Err(err))) => {
                        warn!(process = %name, "app process error during shutdown: {:#}", err)
                    }
                    Err(err) => error!("app process panicked during shutdown: {}", err),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("app processes did not stop in time, aborting");
            join_set.shutdown().await;
        }

        for task in signal_tasks {
            task.abort();
        }

        run_closers(self.closers, self.closer_timeout).await;

        match failure {
            Some((process, error)) => RunOutcome::Failed { process, error },
            None if cancelled => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        }
    }
}

fn spawn_signal_handlers(token: &CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let ctrl_c_token = token.clone();
    tasks.push(tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => {
                error!("error setting up signal handler: {}", err);
            }
        }
    }));

    #[cfg(unix)]
    {
        let sigterm_token = token.clone();
        tasks.push(tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("received SIGTERM signal");
                    sigterm_token.cancel();
                }
                Err(err) => {
                    error!("error setting up SIGTERM handler: {}", err);
                }
            }
        }));
    }

    tasks
}

async fn run_closers(closers: Vec<Closer>, timeout: Duration) {
    if closers.is_empty() {
        return;
    }

    info!("running closers with timeout of {:?}", timeout);

    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    let drained = tokio::time::timeout(timeout, async {
        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => debug!("closer completed"),
                Ok(Err(err)) => error!("closer error: {:#}", err),
                Err(err) => error!("closer panicked: {}", err),
            }
        }
    })
    .await;

    match drained {
        Ok(()) => info!("all closers completed"),
        Err(_) => {
            error!("closers timed out after {:?}", timeout);
            closer_set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_failing_process_cancels_others_and_runs_closers() {
        let closer_called = Arc::new(AtomicBool::new(false));
        let sibling_saw_cancel = Arc::new(AtomicBool::new(false));

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_named_process(
                "telemetry",
                Box::new({
                    let flag = sibling_saw_cancel.clone();
                    move |ctx| {
                        Box::pin(async move {
                            ctx.cancelled().await;
                            flag.store(true, Ordering::SeqCst);
                            Ok(())
                        })
                    }
                }),
            )
            .with_named_process(
                "session",
                Box::new(|_ctx| Box::pin(async { Err(anyhow::anyhow!("broker went away")) })),
            )
            .with_closer({
                let flag = closer_called.clone();
                move || async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .drive()
            .await;

        match &outcome {
            RunOutcome::Failed { process, error } => {
                assert_eq!(process, "session");
                assert!(error.to_string().contains("broker went away"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert!(closer_called.load(Ordering::SeqCst));
        assert!(sibling_saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let token = CancellationToken::new();
        let trigger = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_cancellation_token(token)
            .with_app_process(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .drive()
            .await;

        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_all_processes_complete() {
        let outcome = Runner::new()
            .without_signal_handlers()
            .with_app_process(|_ctx| async { Ok(()) })
            .with_app_process(|_ctx| async { Ok(()) })
            .drive()
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
    }

    #[tokio::test]
    async fn test_every_closer_runs_even_if_one_fails() {
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = counter.clone();
        let c2 = counter.clone();
        Runner::new()
            .without_signal_handlers()
            .with_closer(move || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("closer failed"))
            })
            .with_closer(move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .drive()
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_closer_is_bounded_by_timeout() {
        let started = std::time::Instant::now();

        Runner::new()
            .without_signal_handlers()
            .with_closer(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_millis(50))
            .drive()
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
