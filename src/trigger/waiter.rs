//! Existence check, single trigger, and deadline-bounded poll loop for one node.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::platform::{RemoteJobState, RemotePlatform, retry_with_backoff};
use crate::types::{BuildNode, FailureReason, JobRun, JobStatus};

use super::config::WaitConfig;

/// How an interruptible await ended.
enum Interrupted<T> {
    Done(T),
    Cancelled,
    Deadline,
}

/// Awaits `fut` unless `cancel` fires or `deadline` passes first.
///
/// Cancellation wins ties, then the deadline.
async fn interruptible<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Interrupted<F::Output> {
    let timeout = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Interrupted::Cancelled,
        _ = timeout => Interrupted::Deadline,
        out = fut => Interrupted::Done(out),
    }
}

/// About 30 years; stands in for a delay too long to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

/// Drives one build node from branch check to a terminal [`JobRun`].
///
/// Every failure is terminalized into the returned run; nothing escapes as an
/// error.
pub struct JobWaiter<P> {
    platform: Arc<P>,
    config: WaitConfig,
}

impl<P> Clone for JobWaiter<P> {
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            config: self.config.clone(),
        }
    }
}

impl<P: RemotePlatform> JobWaiter<P> {
    pub fn new(platform: Arc<P>, config: WaitConfig) -> Self {
        Self { platform, config }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Runs `node` against `branch` and returns its terminal run.
    ///
    /// 1. Missing branch → `Skipped` without triggering.
    /// 2. One trigger call; failure → `Failed` (`TriggerError`).
    /// 3. Poll with the trigger's handle every `poll_interval` until a terminal
    ///    remote state, the timeout (`TimedOut`), or exhausted poll retries.
    ///
    /// Cancellation at any await ends the run as `Failed` (`Cancelled`).
    #[instrument(skip_all, fields(node = %node.name, repo = %node.repo, branch = %branch))]
    pub async fn run(&self, node: &BuildNode, branch: &str, cancel: &CancellationToken) -> JobRun {
        let mut run = JobRun::pending(node);
        run.start();

        let platform = &*self.platform;
        let repo = &node.repo;
        let check = retry_with_backoff(self.config.branch_check_retry, move || {
            platform.branch_exists(repo, branch)
        });
        match interruptible(cancel, None, check).await {
            Interrupted::Done(result) => match result {
                Ok(true) => {}
                Ok(false) => {
                    info!("Branch absent, skipping node");
                    run.finish(JobStatus::Skipped);
                    return run;
                }
                Err(e) => {
                    warn!(error = %e, "Branch check failed");
                    run.fail(FailureReason::BranchCheckError, e.to_string());
                    return run;
                }
            },
            Interrupted::Cancelled | Interrupted::Deadline => {
                run.fail(FailureReason::Cancelled, "cancelled before trigger");
                return run;
            }
        }

        let handle = match interruptible(
            cancel,
            None,
            self.platform.trigger_job(repo, &node.job, branch),
        )
        .await
        {
            Interrupted::Done(Ok(handle)) => handle,
            Interrupted::Done(Err(e)) => {
                warn!(job = %node.job, error = %e, "Trigger failed");
                run.fail(FailureReason::TriggerError, e.to_string());
                return run;
            }
            Interrupted::Cancelled | Interrupted::Deadline => {
                run.fail(FailureReason::Cancelled, "cancelled during trigger");
                return run;
            }
        };

        info!(job = %node.job, %handle, "Job triggered");
        run.handle = Some(handle.clone());
        run.status = JobStatus::Running;

        // No deadline if the timeout does not fit in an `Instant`.
        let deadline = Instant::now().checked_add(self.config.timeout);
        let mut next_poll = instant_after(self.config.poll_interval);
        let mut consecutive_errors = 0u32;

        loop {
            match interruptible(cancel, deadline, sleep_until(next_poll)).await {
                Interrupted::Done(()) => {}
                Interrupted::Cancelled => {
                    run.fail(FailureReason::Cancelled, "cancelled while waiting");
                    return run;
                }
                Interrupted::Deadline => {
                    warn!(polls = run.polls, "Job timed out");
                    run.finish(JobStatus::TimedOut);
                    return run;
                }
            }

            run.polls += 1;
            let polled = match interruptible(
                cancel,
                deadline,
                self.platform.poll_job_status(repo, &handle),
            )
            .await
            {
                Interrupted::Done(polled) => polled,
                Interrupted::Cancelled => {
                    run.fail(FailureReason::Cancelled, "cancelled while polling");
                    return run;
                }
                Interrupted::Deadline => {
                    warn!(polls = run.polls, "Job timed out");
                    run.finish(JobStatus::TimedOut);
                    return run;
                }
            };

            match polled {
                Ok(RemoteJobState::Succeeded) => {
                    info!(polls = run.polls, "Job succeeded");
                    run.finish(JobStatus::Succeeded);
                    return run;
                }
                Ok(RemoteJobState::Failed) => {
                    info!(polls = run.polls, "Job failed");
                    run.fail(
                        FailureReason::RemoteFailure,
                        format!("remote job {} finished unsuccessfully", handle),
                    );
                    return run;
                }
                Ok(state) => {
                    debug!(?state, polls = run.polls, "Job not finished");
                    consecutive_errors = 0;
                    next_poll = instant_after(self.config.poll_interval);
                }
                Err(e) if e.is_transient() && consecutive_errors < self.config.poll_retry.max_retries => {
                    let delay = self.config.poll_retry.delay_for_attempt(consecutive_errors);
                    consecutive_errors += 1;
                    warn!(error = %e, consecutive_errors, ?delay, "Transient poll error");
                    next_poll = instant_after(delay);
                }
                Err(e) => {
                    warn!(error = %e, consecutive_errors, "Poll failed");
                    run.fail(FailureReason::PollError, e.to_string());
                    return run;
                }
            }
        }
    }
}
