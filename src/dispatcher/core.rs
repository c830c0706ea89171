use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::context::RequestContext;
use crate::bus::{Message, MessageBus};
use crate::cancel::CancelSignal;
use crate::client::Client;
use crate::codec::{Codec, JsonCodec, Payload, PayloadKind};
use crate::config::RuntimeConfig;
use crate::error::{Result, RpcError};
use crate::ids::RequestId;
use crate::pool::ReplyPool;
use crate::runner::{RawHandler, Runner, RunnerConfig};
use crate::service::ServiceBuilder;
use crate::trace::{self, Tracer};

/// Per-registration overrides of the runtime defaults.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub group: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Entry point for serving and calling methods over a bus.
///
/// Owns the bus handle, codec, reply pool, optional tracer, runtime defaults
/// and the root cancellation signal shared by every runner it starts.
pub struct Dispatcher<C: Codec = JsonCodec> {
    bus: Arc<dyn MessageBus>,
    codec: Arc<C>,
    pool: Arc<ReplyPool>,
    tracer: Option<Arc<dyn Tracer>>,
    config: Arc<RuntimeConfig>,
    cancel: CancelSignal,
}

impl<C: Codec> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            codec: Arc::clone(&self.codec),
            pool: Arc::clone(&self.pool),
            tracer: self.tracer.clone(),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        }
    }
}

impl Dispatcher<JsonCodec> {
    /// A dispatcher using the JSON codec.
    pub fn new(bus: Arc<dyn MessageBus>, config: RuntimeConfig) -> Self {
        Self::with_codec(bus, config, JsonCodec)
    }
}

impl<C: Codec> Dispatcher<C> {
    pub fn with_codec(bus: Arc<dyn MessageBus>, config: RuntimeConfig, codec: C) -> Self {
        let pool = Arc::new(ReplyPool::new(config.pool_max_idle));
        Self {
            bus,
            codec: Arc::new(codec),
            pool,
            tracer: None,
            config: Arc::new(config),
            cancel: CancelSignal::new(),
        }
    }

    /// Propagate trace context on every request served or sent.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Share an existing reply pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ReplyPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Start a runner for a raw message handler.
    ///
    /// The handler receives every message as delivered; replying is up to it.
    pub fn register<F>(
        &self,
        subject: &str,
        group: &str,
        concurrency: usize,
        handler: F,
    ) -> Result<Runner>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.start_runner(subject, group, concurrency, Arc::new(handler))
    }

    /// Serve a typed handler on `subject`.
    ///
    /// Requests are decoded as `Req`, the handler's `Ok` value is encoded as the
    /// reply payload and its `Err` display text becomes the reply error.
    pub fn serve<Req, Res, F>(
        &self,
        subject: &str,
        options: HandlerOptions,
        handler: F,
    ) -> Result<Runner>
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        let (group, concurrency, timeout) = self.resolve(subject, &options)?;
        let endpoint = self.endpoint(subject, timeout, handler);
        self.start_runner(subject, &group, concurrency, endpoint)
    }

    /// A client sharing this dispatcher's codec, pool and tracer.
    #[must_use]
    pub fn client(&self) -> Client<C> {
        let client = Client::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.codec),
            Arc::clone(&self.pool),
        )
        .with_timeout(self.config.request_timeout());
        match &self.tracer {
            Some(tracer) => client.with_tracer(Arc::clone(tracer)),
            None => client,
        }
    }

    /// Begin an all-or-nothing multi-method registration.
    #[must_use]
    pub fn service(&self, name: &str) -> ServiceBuilder<C> {
        ServiceBuilder::new(self.clone(), name)
    }

    /// Stop every runner started by this dispatcher from picking up work.
    pub fn cancel(&self) {
        info!("Dispatcher cancelled");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ReplyPool> {
        &self.pool
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    #[must_use]
    pub fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.tracer.as_ref()
    }

    /// Effective group, concurrency and timeout for a registration.
    pub(crate) fn resolve(
        &self,
        subject: &str,
        options: &HandlerOptions,
    ) -> Result<(String, usize, Duration)> {
        let group = options
            .group
            .clone()
            .unwrap_or_else(|| self.config.queue_group.clone());
        let concurrency = options.concurrency.unwrap_or(self.config.concurrency);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.handler_timeout());
        if timeout.is_zero() {
            return Err(RpcError::InvalidConfig(format!(
                "handler timeout for '{subject}' must be positive"
            )));
        }
        Ok((group, concurrency, timeout))
    }

    /// Wrap a typed handler into a raw message handler.
    pub(crate) fn endpoint<Req, Res, F>(
        &self,
        subject: &str,
        timeout: Duration,
        handler: F,
    ) -> RawHandler
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        let endpoint = Endpoint {
            subject: Arc::from(subject),
            codec: Arc::clone(&self.codec),
            pool: Arc::clone(&self.pool),
            tracer: self.tracer.clone(),
            timeout,
            reply_on_codec_error: self.config.reply_on_codec_error,
            cancel: self.cancel.clone(),
            handler,
            _types: PhantomData,
        };
        Arc::new(move |msg: Message| endpoint.handle(msg))
    }

    pub(crate) fn start_runner(
        &self,
        subject: &str,
        group: &str,
        concurrency: usize,
        handler: RawHandler,
    ) -> Result<Runner> {
        let config = RunnerConfig::new(subject, group, concurrency)
            .with_stack_size(self.config.stack_size);
        Runner::start(
            Arc::clone(&self.bus),
            config,
            self.cancel.clone(),
            handler,
        )
    }
}

impl<C: Codec> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec.name())
            .field("traced", &self.tracer.is_some())
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// One typed handler plus everything needed to answer a message.
struct Endpoint<C, Req, Res, F> {
    subject: Arc<str>,
    codec: Arc<C>,
    pool: Arc<ReplyPool>,
    tracer: Option<Arc<dyn Tracer>>,
    timeout: Duration,
    reply_on_codec_error: bool,
    cancel: CancelSignal,
    handler: F,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<C, Req, Res, F> Endpoint<C, Req, Res, F>
where
    C: Codec,
    Req: Payload,
    Res: Payload,
    F: Fn(&RequestContext, Req) -> anyhow::Result<Res>,
{
    fn handle(&self, msg: Message) {
        let started = Instant::now();
        let mut ctx = RequestContext::new(Arc::clone(&self.subject), self.timeout, self.cancel.clone());
        let request_id = ctx.request_id();

        // STEP 1: Trace context (only when tracing is installed)
        let (span, body) = match &self.tracer {
            Some(tracer) => {
                let extracted = trace::split_frame(&msg.data)
                    .and_then(|(blob, body)| Ok((tracer.extract(blob)?, body)));
                match extracted {
                    Ok((parent, body)) => (Some(tracer.start_span(&self.subject, Some(&parent))), body),
                    Err(e) => {
                        warn!(
                            subject = %self.subject,
                            request_id = %request_id,
                            error = %e,
                            "Dropping message: trace context could not be extracted"
                        );
                        return;
                    }
                }
            }
            None => (None, msg.data.as_slice()),
        };

        // STEP 2: Decode the request
        let request = match Req::decode_with(self.codec.as_ref(), body) {
            Ok(request) => request,
            Err(e) => {
                if self.tracer.is_some() || self.reply_on_codec_error {
                    warn!(
                        subject = %self.subject,
                        request_id = %request_id,
                        error = %e,
                        "Failed to decode request, replying with error"
                    );
                    self.reply_error(&msg, &e.to_string(), request_id);
                } else {
                    warn!(
                        subject = %self.subject,
                        request_id = %request_id,
                        error = %e,
                        "Dropping message: request could not be decoded"
                    );
                }
                return;
            }
        };

        if let Some(span) = span {
            ctx = ctx.with_span(span);
        }
        debug!(
            subject = %self.subject,
            request_id = %request_id,
            "Request dispatched"
        );

        // STEP 3: Invoke the handler with panic recovery
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.handler)(&ctx, request)
        }));

        // STEP 4: Fill a pooled envelope; the error branch skips the payload
        let mut reply = self.pool.acquire();
        match outcome {
            Ok(Err(err)) => {
                debug!(
                    subject = %self.subject,
                    request_id = %request_id,
                    error = %err,
                    "Handler returned an error"
                );
                reply.set_error(err.to_string());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    subject = %self.subject,
                    request_id = %request_id,
                    panic_message = %message,
                    "Handler panicked"
                );
                reply.set_error(format!("handler panicked: {message}"));
            }
            Ok(Ok(value)) => {
                if Res::KIND != PayloadKind::Void {
                    match value.encode_with(self.codec.as_ref()) {
                        Ok(bytes) => reply.set_payload(&bytes),
                        Err(e) => {
                            error!(
                                subject = %self.subject,
                                request_id = %request_id,
                                error = %e,
                                "Failed to encode response"
                            );
                            if !self.reply_on_codec_error {
                                return;
                            }
                            reply.set_error(format!("failed to encode response: {e}"));
                        }
                    }
                }
            }
        }

        // STEP 5: Serialize, release, respond
        let wire = match reply.marshal() {
            Ok(wire) => wire,
            Err(e) => {
                error!(
                    subject = %self.subject,
                    request_id = %request_id,
                    error = %e,
                    "Failed to marshal reply envelope"
                );
                return;
            }
        };
        reply.release();
        self.send(&msg, wire, request_id);

        debug!(
            subject = %self.subject,
            request_id = %request_id,
            latency_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
    }

    fn reply_error(&self, msg: &Message, message: &str, request_id: RequestId) {
        let mut reply = self.pool.acquire();
        reply.set_error(message);
        match reply.marshal() {
            Ok(wire) => {
                reply.release();
                self.send(msg, wire, request_id);
            }
            Err(e) => error!(
                subject = %self.subject,
                request_id = %request_id,
                error = %e,
                "Failed to marshal reply envelope"
            ),
        }
    }

    fn send(&self, msg: &Message, wire: Vec<u8>, request_id: RequestId) {
        if !msg.has_reply() {
            debug!(subject = %self.subject, request_id = %request_id, "No reply address, result discarded");
            return;
        }
        if let Err(e) = msg.respond(wire) {
            warn!(
                subject = %self.subject,
                request_id = %request_id,
                error = %e,
                "Failed to send reply"
            );
        }
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::reply::ReplyEnvelope;

    fn dispatcher() -> (MemoryBus, Dispatcher) {
        let bus = MemoryBus::new();
        let dispatcher = Dispatcher::new(Arc::new(bus.clone()), RuntimeConfig::default());
        (bus, dispatcher)
    }

    #[test]
    fn options_override_defaults() {
        let (_bus, dispatcher) = dispatcher();
        let (group, concurrency, timeout) = dispatcher
            .resolve(
                "svc.Echo",
                &HandlerOptions::new()
                    .group("echoers")
                    .concurrency(2)
                    .timeout(Duration::from_millis(250)),
            )
            .unwrap();
        assert_eq!(group, "echoers");
        assert_eq!(concurrency, 2);
        assert_eq!(timeout, Duration::from_millis(250));

        let (group, concurrency, timeout) =
            dispatcher.resolve("svc.Echo", &HandlerOptions::new()).unwrap();
        assert_eq!(group, "busrpc");
        assert_eq!(concurrency, 5);
        assert_eq!(timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let (_bus, dispatcher) = dispatcher();
        let err = dispatcher
            .resolve("svc.Echo", &HandlerOptions::new().timeout(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[test]
    fn endpoint_replies_with_handler_error() {
        let (bus, dispatcher) = dispatcher();
        let handler = dispatcher.endpoint(
            "svc.Fail",
            Duration::from_secs(1),
            |_ctx: &RequestContext, _req: String| -> anyhow::Result<String> {
                anyhow::bail!("boom")
            },
        );
        let runner = dispatcher
            .start_runner("svc.Fail", "g", 1, handler)
            .unwrap();

        let wire = bus
            .request("svc.Fail", b"x".to_vec(), Duration::from_secs(2))
            .unwrap();
        let envelope = ReplyEnvelope::decode(&wire).unwrap();
        assert!(!envelope.has_payload());
        assert_eq!(envelope.error().unwrap().to_string(), "boom");
        runner.shutdown().unwrap();
    }

    #[test]
    fn void_result_sends_empty_envelope() {
        let (bus, dispatcher) = dispatcher();
        let runner = dispatcher
            .serve("svc.Touch", HandlerOptions::new().concurrency(1), |_ctx, _req: ()| Ok(()))
            .unwrap();
        let wire = bus
            .request("svc.Touch", Vec::new(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(wire, b"{}");
        runner.shutdown().unwrap();
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn request_ids(logs: &str) -> Vec<String> {
        logs.split_whitespace()
            .filter_map(|token| token.strip_prefix("request_id="))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn decode_failure_logs_one_request_id() {
        let bus = MemoryBus::new();
        let config = RuntimeConfig {
            reply_on_codec_error: true,
            ..RuntimeConfig::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(bus), config);
        let handler = dispatcher.endpoint(
            "svc.Number",
            Duration::from_secs(1),
            |_ctx: &RequestContext, n: u32| -> anyhow::Result<u32> { Ok(n) },
        );

        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            handler(Message::new("svc.Number", b"not a number".to_vec()));
        });

        let logs = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(logs.contains("Failed to decode request"), "{logs}");
        assert!(logs.contains("No reply address"), "{logs}");
        let ids = request_ids(&logs);
        assert_eq!(ids.len(), 2, "{logs}");
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
