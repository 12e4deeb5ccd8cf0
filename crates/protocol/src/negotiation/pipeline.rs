//! Ordered composition of negotiation steps.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{guard, Negotiated, NegotiationStep};
use crate::error::Result;
use crate::stream::DuplexStream;

/// Runs steps in order, stopping at the first rejection.
///
/// Cloning shares the step instances; the pipeline itself holds no
/// per-connection state, so one pipeline serves every connection of a listener.
#[derive(Clone, Default)]
pub struct NegotiationPipeline {
    steps: Vec<Arc<dyn NegotiationStep>>,
}

impl NegotiationPipeline {
    /// Creates an empty pipeline, which passes every stream through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step (builder style).
    pub fn with_step(mut self, step: impl NegotiationStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a shared step.
    pub fn push(&mut self, step: Arc<dyn NegotiationStep>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Names of the configured steps, in order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Negotiates `stream` through every step.
    ///
    /// On rejection or error the stream is closed before returning.
    pub async fn run(&self, stream: DuplexStream) -> Result<Negotiated> {
        let close = stream.close_handle();
        let peer = stream.peer_addr();
        let mut current = stream;

        for step in &self.steps {
            let name = step.name();
            debug!(step = name, peer = ?peer, "Running negotiation step");

            match guard(Arc::clone(step), current, step.deadline()).await {
                Ok(Negotiated::Continue(next)) => current = next,
                Ok(Negotiated::Reject) => {
                    close.close();
                    info!(step = name, peer = ?peer, "Negotiation rejected");
                    return Ok(Negotiated::Reject);
                }
                Err(e) => {
                    close.close();
                    warn!(step = name, peer = ?peer, error = %e, "Negotiation failed");
                    return Err(e);
                }
            }
        }

        debug!(peer = ?peer, layers = ?current.layers(), "Negotiation complete");
        Ok(Negotiated::Continue(current))
    }
}

impl std::fmt::Debug for NegotiationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::negotiation::{Deadline, NegotiationFuture};
    use crate::stream::pipe;

    /// Counts invocations and returns a fixed outcome.
    struct Fixed {
        accept: bool,
        calls: Arc<AtomicUsize>,
    }

    impl NegotiationStep for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn deadline(&self) -> Deadline {
            Deadline::millis(1_000)
        }

        fn negotiate(&self, stream: DuplexStream) -> NegotiationFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome: Result<Negotiated> = if self.accept {
                Ok(Negotiated::Continue(stream))
            } else {
                Ok(Negotiated::Reject)
            };
            Box::pin(std::future::ready(outcome))
        }
    }

    /// Fails with a transport error.
    struct Broken;

    impl NegotiationStep for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn deadline(&self) -> Deadline {
            Deadline::none()
        }

        fn negotiate(&self, _stream: DuplexStream) -> NegotiationFuture<'_> {
            let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
            let outcome: Result<Negotiated> = Err(reset.into());
            Box::pin(std::future::ready(outcome))
        }
    }

    fn fixed(accept: bool) -> (Fixed, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Fixed {
                accept,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_stream_through() {
        let (stream, _peer) = pipe(64);
        let pipeline = NegotiationPipeline::new();
        assert!(pipeline.is_empty());
        let outcome = pipeline.run(stream).await.unwrap();
        assert!(!outcome.is_reject());
    }

    #[tokio::test]
    async fn test_steps_run_in_order_until_rejection() {
        let (first, first_calls) = fixed(true);
        let (second, second_calls) = fixed(false);
        let (third, third_calls) = fixed(true);
        let pipeline = NegotiationPipeline::new()
            .with_step(first)
            .with_step(second)
            .with_step(third);
        assert_eq!(pipeline.len(), 3);

        let (stream, _peer) = pipe(64);
        let handle = stream.close_handle();
        let outcome = pipeline.run(stream).await.unwrap();

        assert!(outcome.is_reject());
        assert!(handle.is_closed());
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_a_rejection() {
        let (after, after_calls) = fixed(true);
        let pipeline = NegotiationPipeline::new().with_step(Broken).with_step(after);

        let (stream, _peer) = pipe(64);
        let handle = stream.close_handle();
        let err = pipeline.run(stream).await.unwrap_err();

        assert!(err.is_transport());
        assert!(handle.is_closed());
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pipeline_is_reusable_across_connections() {
        let (step, calls) = fixed(true);
        let pipeline = NegotiationPipeline::new().with_step(step);

        for _ in 0..3 {
            let (stream, _peer) = pipe(64);
            assert!(!pipeline.clone().run(stream).await.unwrap().is_reject());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_debug_lists_step_names() {
        let (step, _) = fixed(true);
        let pipeline = NegotiationPipeline::new().with_step(step).with_step(Broken);
        assert_eq!(pipeline.step_names(), vec!["fixed", "broken"]);
        assert!(format!("{pipeline:?}").contains("broken"));
    }
}
