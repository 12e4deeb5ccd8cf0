//! Deadlines and the guard that enforces them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::AbortOnDropHandle;
use tracing::warn;

use super::{Negotiated, NegotiationStep};
use crate::error::{ProtocolError, Result};
use crate::stream::DuplexStream;

/// Sentinel millisecond value meaning "no deadline".
pub const NO_DEADLINE: i64 = -1;

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Time budget for a negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Run the step to completion, however long it takes.
    Unlimited,
    /// Close the stream and reject if the step has not finished in time.
    After(Duration),
}

impl Deadline {
    /// No deadline.
    pub const fn none() -> Self {
        Deadline::Unlimited
    }

    /// A deadline of `ms` milliseconds.
    pub const fn millis(ms: u64) -> Self {
        Deadline::After(Duration::from_millis(ms))
    }

    /// Parses the configuration form: `-1` for none, otherwise a positive number of ms.
    pub fn from_millis(ms: i64) -> Result<Self> {
        match ms {
            NO_DEADLINE => Ok(Deadline::Unlimited),
            ms if ms > 0 => Ok(Deadline::millis(ms as u64)),
            other => Err(ProtocolError::InvalidDeadline(other)),
        }
    }

    /// Returns the bound, or `None` for no deadline.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Deadline::Unlimited => None,
            Deadline::After(d) => Some(*d),
        }
    }

    /// Returns the configuration form.
    pub fn as_millis(&self) -> i64 {
        match self {
            Deadline::Unlimited => NO_DEADLINE,
            Deadline::After(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::After(DEFAULT_STEP_TIMEOUT)
    }
}

/// Runs `step` over `stream`, bounded by `deadline`.
///
/// With no deadline the step runs inline. Otherwise it runs on its own task;
/// if it misses the deadline the stream is closed (unblocking whatever I/O the
/// step was doing), the task is aborted and the outcome is `Reject`. The task
/// never outlives the guard.
pub async fn guard(
    step: Arc<dyn NegotiationStep>,
    stream: DuplexStream,
    deadline: Deadline,
) -> Result<Negotiated> {
    let Some(limit) = deadline.as_duration() else {
        return step.negotiate(stream).await;
    };

    let name = step.name();
    let close = stream.close_handle();
    let peer = stream.peer_addr();
    let mut task = AbortOnDropHandle::new(tokio::spawn(async move { step.negotiate(stream).await }));

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            close.close();
            Err(ProtocolError::Internal(format!(
                "negotiation step {name} did not complete: {join_err}"
            )))
        }
        Err(_) => {
            warn!(
                step = name,
                peer = ?peer,
                timeout_ms = deadline.as_millis(),
                "Negotiation step timed out, closing stream"
            );
            close.close();
            task.abort();
            Ok(Negotiated::Reject)
        }
    }
}
