//! # Trace Propagation Module
//!
//! Optional W3C trace-context propagation across the bus.
//!
//! Tracing is an injected capability: a [`Dispatcher`](crate::Dispatcher) or
//! [`Client`](crate::Client) built with a [`Tracer`] frames every outbound
//! request as
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────┐
//! │ blob length (u32 │ trace-context    │ encoded request │
//! │ big-endian)      │ blob             │ payload         │
//! └──────────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! and expects the same framing on inbound requests. A message whose frame or
//! context cannot be read is dropped without a reply.
//!
//! [`W3cTracer`] produces a JSON text map with `traceparent` (and `tracestate`
//! when non-empty) using `opentelemetry_sdk`'s `TraceContextPropagator`.

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;

use crate::error::{Result, RpcError};

const LEN_PREFIX: usize = 4;

/// Span creation and context (de)serialization at the bus boundary.
pub trait Tracer: Send + Sync + 'static {
    /// Start a span for `operation`, continuing `parent`'s trace when given.
    fn start_span(&self, operation: &str, parent: Option<&SpanContext>) -> SpanContext;

    /// Serialize a span context into an opaque blob.
    fn inject(&self, span: &SpanContext) -> Result<Vec<u8>>;

    /// Read a span context back out of a blob.
    fn extract(&self, blob: &[u8]) -> Result<SpanContext>;
}

/// W3C Trace Context over a JSON text map.
#[derive(Debug, Default)]
pub struct W3cTracer {
    propagator: TraceContextPropagator,
}

impl W3cTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for W3cTracer {
    fn start_span(&self, operation: &str, parent: Option<&SpanContext>) -> SpanContext {
        let span_id = new_span_id();
        let span = match parent.filter(|p| p.is_valid()) {
            Some(parent) => SpanContext::new(
                parent.trace_id(),
                span_id,
                parent.trace_flags(),
                false,
                parent.trace_state().clone(),
            ),
            None => SpanContext::new(
                TraceId::from_bytes(ulid::Ulid::new().to_bytes()),
                span_id,
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
        };
        tracing::trace!(
            operation = operation,
            trace_id = %span.trace_id(),
            span_id = %span.span_id(),
            "Span started"
        );
        span
    }

    fn inject(&self, span: &SpanContext) -> Result<Vec<u8>> {
        if !span.is_valid() {
            return Err(RpcError::Trace("cannot inject an invalid span context".to_string()));
        }
        let cx = Context::new().with_remote_span_context(span.clone());
        let mut carrier = TextMapCarrier::default();
        self.propagator.inject_context(&cx, &mut carrier);
        serde_json::to_vec(&carrier.0).map_err(|e| RpcError::Trace(e.to_string()))
    }

    fn extract(&self, blob: &[u8]) -> Result<SpanContext> {
        let map: BTreeMap<String, String> =
            serde_json::from_slice(blob).map_err(|e| RpcError::Trace(e.to_string()))?;
        let cx = self.propagator.extract(&TextMapCarrier(map));
        let span = cx.span().span_context().clone();
        if span.is_valid() {
            Ok(span)
        } else {
            Err(RpcError::Trace("missing or invalid traceparent".to_string()))
        }
    }
}

fn new_span_id() -> SpanId {
    // Low 64 bits of ULID randomness; zero is the invalid span id.
    let random = ulid::Ulid::new().random() as u64;
    SpanId::from_bytes(random.max(1).to_be_bytes())
}

/// Text-map carrier backed by an ordered map.
#[derive(Debug, Default)]
struct TextMapCarrier(BTreeMap<String, String>);

impl Injector for TextMapCarrier {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

impl Extractor for TextMapCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Prefix `payload` with a length-delimited trace-context blob.
pub fn frame(blob: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(blob.len())
        .map_err(|_| RpcError::Trace(format!("trace context too large: {} bytes", blob.len())))?;
    let mut out = Vec::with_capacity(LEN_PREFIX + blob.len() + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(blob);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a framed message into `(blob, payload)`.
pub fn split_frame(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let Some((prefix, rest)) = data.split_first_chunk::<LEN_PREFIX>() else {
        return Err(RpcError::Trace("frame shorter than its length prefix".to_string()));
    };
    let len = u32::from_be_bytes(*prefix) as usize;
    if rest.len() < len {
        return Err(RpcError::Trace(format!(
            "frame declares {len} context bytes but only {} remain",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}
