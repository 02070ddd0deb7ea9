//! The one wait loop every primitive is built on.

use crate::error::{Error, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Status poll cadence for spawned Jobs/Pods
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence while waiting for a deleted object to disappear
pub const ABSENCE_INTERVAL: Duration = Duration::from_secs(3);

/// Consecutive read errors tolerated before a wait gives up
pub const MAX_POLL_ERRORS: u32 = 3;

/// Observed state of the thing being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Succeeded,
    Failed,
}

impl Phase {
    /// `0` pending/running, `1` succeeded, `-1` failed
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Phase::Succeeded,
            -1 => Phase::Failed,
            _ => Phase::Pending,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Phase::Pending => 0,
            Phase::Succeeded => 1,
            Phase::Failed => -1,
        }
    }
}

/// Caller-supplied predicate checked on every tick; `true` abandons the wait
pub type AbortPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cancellation scope handed to every primitive.
///
/// Carries the process-wide token, an optional deadline (the tighter one wins when
/// nested) and an optional abort predicate.
#[derive(Clone, Default)]
pub struct ActionContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    abort_if: Option<AbortPredicate>,
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field("abort_if", &self.abort_if.is_some())
            .finish()
    }
}

impl ActionContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            abort_if: None,
        }
    }

    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_abort(&self, predicate: AbortPredicate) -> Self {
        Self {
            abort_if: Some(predicate),
            ..self.clone()
        }
    }

    /// Same token, no deadline and no predicate
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::new(self.token.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn should_abort(&self) -> bool {
        self.abort_if.as_ref().is_some_and(|f| f())
    }

    /// Resolves once the token is cancelled or the deadline passes
    pub async fn done(&self) -> &'static str {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => "canceled",
                    () = tokio::time::sleep_until(deadline) => "deadline exceeded",
                }
            }
            None => {
                self.token.cancelled().await;
                "canceled"
            }
        }
    }
}

/// Polls `status` every `interval` until it reports a terminal phase.
///
/// Returns `Ok(true)` on success and `Ok(false)` when the target failed. Cancellation or
/// the deadline yields [`Error::ContextDone`], the abort predicate [`Error::Canceled`],
/// and [`MAX_POLL_ERRORS`] consecutive read errors [`Error::PollAborted`].
pub async fn await_terminal<F, Fut>(
    ctx: &ActionContext,
    name: &str,
    interval: Duration,
    mut status: F,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Phase>>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut errors = 0u32;

    loop {
        tokio::select! {
            biased;
            reason = ctx.done() => {
                return Err(Error::ContextDone(format!("waiting for {name}: {reason}")));
            }
            _ = ticker.tick() => {}
        }

        if ctx.should_abort() {
            return Err(Error::Canceled(format!("wait for {name} abandoned")));
        }

        match status().await {
            Ok(Phase::Pending) => errors = 0,
            Ok(Phase::Succeeded) => return Ok(true),
            Ok(Phase::Failed) => return Ok(false),
            Err(e) => {
                errors += 1;
                warn!(target_name = %name, errors, error = %e, "Status read failed");
                if errors >= MAX_POLL_ERRORS {
                    return Err(Error::PollAborted {
                        name: name.to_string(),
                        errors,
                        last: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Blocks until `exists` reports the object gone. No deadline of its own; only the
/// context's token ends it early.
pub async fn await_absent<F, Fut>(ctx: &ActionContext, name: &str, mut exists: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let ctx = ctx.detached();
    let gone = await_terminal(&ctx, name, ABSENCE_INTERVAL, || {
        let check = exists();
        async move {
            let present = check.await?;
            Ok::<_, Error>(if present {
                Phase::Pending
            } else {
                Phase::Succeeded
            })
        }
    })
    .await?;
    debug!(target_name = %name, gone, "Previous instance removed");
    Ok(())
}

/// Sleeps unless the context ends first
pub async fn sleep_wait(ctx: &ActionContext, duration: Duration) -> Result<()> {
    tokio::select! {
        reason = ctx.done() => Err(Error::ContextDone(format!("sleep wait: {reason}"))),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Jobs run with `backoffLimit: 0`, so one failed pod fails the Job
pub fn job_phase(job: &Job) -> Phase {
    let Some(status) = job.status.as_ref() else {
        return Phase::Pending;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return Phase::Succeeded;
    }
    if status.failed.unwrap_or(0) > 0 {
        return Phase::Failed;
    }
    let failed_condition = status.conditions.as_ref().is_some_and(|conds| {
        conds
            .iter()
            .any(|c| c.type_ == "Failed" && c.status == "True")
    });
    if failed_condition {
        Phase::Failed
    } else {
        Phase::Pending
    }
}

pub fn pod_phase(pod: &Pod) -> Phase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => Phase::Succeeded,
        Some("Failed") => Phase::Failed,
        _ => Phase::Pending,
    }
}
