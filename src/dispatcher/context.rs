use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::trace::SpanContext;

use crate::cancel::CancelSignal;
use crate::ids::RequestId;

/// Per-request information handed to every typed handler.
///
/// The deadline is the handler's timeout budget measured from the moment the
/// message was picked up. It is advisory: nothing interrupts a handler that
/// overruns it, but nested calls made through
/// [`Client::call_within`](crate::Client::call_within) never wait past it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    subject: Arc<str>,
    request_id: RequestId,
    started: Instant,
    deadline: Instant,
    span: Option<SpanContext>,
    cancel: CancelSignal,
}

impl RequestContext {
    pub fn new(subject: Arc<str>, timeout: Duration, cancel: CancelSignal) -> Self {
        let started = Instant::now();
        Self {
            subject,
            request_id: RequestId::new(),
            started,
            deadline: started + timeout,
            span: None,
            cancel,
        }
    }

    /// A context not tied to any inbound message, for top-level client calls.
    #[must_use]
    pub fn detached(timeout: Duration) -> Self {
        Self::new(Arc::from(""), timeout, CancelSignal::new())
    }

    #[must_use]
    pub fn with_span(mut self, span: SpanContext) -> Self {
        self.span = Some(span);
        self
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    #[must_use]
    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    /// True once the owning dispatcher has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}
