//! Timeout-bounded request path.
//!
//! A [`Client`] encodes a request, sends it as one correlated bus request and
//! unwraps the reply envelope. The caller sees exactly one of:
//!
//! - the decoded result
//! - [`RpcError::Application`] carrying the handler's error text unchanged
//! - [`RpcError::Timeout`]
//! - a transport error from the bus
//!
//! Nothing is retried.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::trace::SpanContext;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::codec::{Codec, JsonCodec, Payload};
use crate::dispatcher::RequestContext;
use crate::error::{Result, RpcError};
use crate::pool::ReplyPool;
use crate::trace::{self, Tracer};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Issues requests against subjects served by a [`Dispatcher`](crate::Dispatcher).
pub struct Client<C: Codec = JsonCodec> {
    bus: Arc<dyn MessageBus>,
    codec: Arc<C>,
    pool: Arc<ReplyPool>,
    tracer: Option<Arc<dyn Tracer>>,
    timeout: Duration,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            codec: Arc::clone(&self.codec),
            pool: Arc::clone(&self.pool),
            tracer: self.tracer.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: Codec> Client<C> {
    pub fn new(bus: Arc<dyn MessageBus>, codec: Arc<C>, pool: Arc<ReplyPool>) -> Self {
        Self {
            bus,
            codec,
            pool,
            tracer: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `subject` with the client's own timeout.
    pub fn call<Req, Res>(&self, subject: &str, request: &Req) -> Result<Res>
    where
        Req: Payload,
        Res: Payload,
    {
        self.invoke(subject, request, self.timeout, None)
    }

    /// Call `subject` from inside a handler.
    ///
    /// Waits no longer than the smaller of the caller's remaining budget and
    /// the client timeout, and continues the caller's trace when there is one.
    pub fn call_within<Req, Res>(
        &self,
        ctx: &RequestContext,
        subject: &str,
        request: &Req,
    ) -> Result<Res>
    where
        Req: Payload,
        Res: Payload,
    {
        let timeout = ctx.remaining().min(self.timeout);
        self.invoke(subject, request, timeout, ctx.span_context())
    }

    /// Send pre-encoded bytes and return the raw reply envelope bytes.
    pub fn request_raw(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.bus.request(subject, data, timeout)
    }

    fn invoke<Req, Res>(
        &self,
        subject: &str,
        request: &Req,
        timeout: Duration,
        parent: Option<&SpanContext>,
    ) -> Result<Res>
    where
        Req: Payload,
        Res: Payload,
    {
        if timeout.is_zero() {
            return Err(RpcError::Timeout {
                subject: subject.to_string(),
                timeout,
            });
        }

        let started = Instant::now();
        let body = request.encode_with(self.codec.as_ref())?;
        let data = match &self.tracer {
            Some(tracer) => {
                let span = tracer.start_span(subject, parent);
                let blob = tracer.inject(&span)?;
                trace::frame(&blob, &body)?
            }
            None => body,
        };

        let wire = self.bus.request(subject, data, timeout)?;

        let mut reply = self.pool.acquire();
        if let Err(e) = reply.unmarshal(&wire) {
            warn!(subject = %subject, error = %e, "Reply is not a valid envelope");
            return Err(RpcError::Transport(format!(
                "malformed reply from '{subject}': {e}"
            )));
        }
        debug!(
            subject = %subject,
            latency_ms = started.elapsed().as_millis() as u64,
            is_error = reply.has_error(),
            "Reply received"
        );

        if let Some(err) = reply.error() {
            return Err(err);
        }
        Res::decode_with(self.codec.as_ref(), reply.payload())
    }
}

impl<C: Codec> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.codec.name())
            .field("traced", &self.tracer.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::reply::ReplyEnvelope;

    fn client(bus: &MemoryBus) -> Client {
        Client::new(
            Arc::new(bus.clone()),
            Arc::new(JsonCodec),
            Arc::new(ReplyPool::new(8)),
        )
        .with_timeout(Duration::from_millis(500))
    }

    fn serve_raw(bus: &MemoryBus, subject: &str, envelope: ReplyEnvelope) -> std::thread::JoinHandle<Vec<u8>> {
        let sub = bus.queue_subscribe(subject, "g").unwrap();
        let wire = envelope.marshal().unwrap();
        std::thread::spawn(move || {
            let msg = sub.receiver.recv().unwrap();
            msg.respond(wire).unwrap();
            msg.data
        })
    }

    #[test]
    fn zero_budget_times_out_immediately() {
        let bus = MemoryBus::new();
        let err = client(&bus)
            .with_timeout(Duration::ZERO)
            .call::<String, String>("svc.Echo", &"x".to_string())
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn error_field_wins_over_payload() {
        let bus = MemoryBus::new();
        let mut envelope = ReplyEnvelope::new();
        envelope.set_error("not found");
        let server = serve_raw(&bus, "svc.Get", envelope);

        let err = client(&bus)
            .call::<u64, String>("svc.Get", &7)
            .unwrap_err();
        assert_eq!(err, RpcError::Application("not found".into()));
        assert_eq!(server.join().unwrap(), b"7");
    }

    #[test]
    fn text_request_skips_encoding() {
        let bus = MemoryBus::new();
        let mut envelope = ReplyEnvelope::new();
        envelope.set_payload(b"\"quoted\"");
        let server = serve_raw(&bus, "svc.Text", envelope);

        let reply: String = client(&bus).call("svc.Text", &"raw text".to_string()).unwrap();
        assert_eq!(reply, "quoted");
        assert_eq!(server.join().unwrap(), b"raw text");
    }

    #[test]
    fn malformed_envelope_is_transport_error() {
        let bus = MemoryBus::new();
        let sub = bus.queue_subscribe("svc.Bad", "g").unwrap();
        let server = std::thread::spawn(move || {
            let msg = sub.receiver.recv().unwrap();
            msg.respond(b"garbage".to_vec()).unwrap();
        });
        let err = client(&bus).call::<(), ()>("svc.Bad", &()).unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(err.to_string().contains("svc.Bad"));
        server.join().unwrap();
    }

    #[test]
    fn mismatched_payload_is_decode_error() {
        let bus = MemoryBus::new();
        let sub = bus.queue_subscribe("svc.Shape", "g").unwrap();
        let server = std::thread::spawn(move || {
            let msg = sub.receiver.recv().unwrap();
            let mut envelope = ReplyEnvelope::new();
            envelope.set_payload(b"\"not a number\"");
            msg.respond(envelope.marshal().unwrap()).unwrap();
        });
        let err = client(&bus).call::<(), u32>("svc.Shape", &()).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        server.join().unwrap();
    }

    #[test]
    fn call_within_expired_context_times_out() {
        let bus = MemoryBus::new();
        let ctx = RequestContext::detached(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let err = client(&bus)
            .call_within::<(), ()>(&ctx, "svc.Any", &())
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
