//! # Dispatcher Module
//!
//! The dispatcher turns a publish/subscribe bus into an RPC transport. It
//! registers handlers on subjects, runs them on pools of worker coroutines and
//! answers every request with a pooled reply envelope.
//!
//! ## Overview
//!
//! A [`Dispatcher`] owns:
//! - the bus handle (`Arc<dyn MessageBus>`)
//! - the payload [`Codec`](crate::Codec) (JSON by default)
//! - the [`ReplyPool`](crate::ReplyPool) shared by servers and clients
//! - an optional [`Tracer`](crate::Tracer)
//! - the root [`CancelSignal`](crate::CancelSignal) every runner listens on
//!
//! ## Handler Registration
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use busrpc::{Dispatcher, HandlerOptions, MemoryBus, RuntimeConfig};
//!
//! let bus = Arc::new(MemoryBus::new());
//! let dispatcher = Dispatcher::new(bus, RuntimeConfig::default());
//!
//! let runner = dispatcher.serve(
//!     "svc.Echo",
//!     HandlerOptions::new().concurrency(2),
//!     |_ctx, text: String| Ok(text),
//! )?;
//!
//! let reply: String = dispatcher.client().call("svc.Echo", &"hi".to_string())?;
//! runner.shutdown()?;
//! ```
//!
//! ## Request Flow
//!
//! 1. A worker picks the next message off the runner's subscription
//! 2. With a tracer installed, the trace-context frame is split off and extracted
//! 3. The request is decoded into the handler's argument type
//! 4. The handler runs with a [`RequestContext`] carrying its timeout budget
//! 5. The result (or error text) fills a pooled envelope, which is serialized,
//!    released and sent to the message's reply address
//!
//! ## Error Handling
//!
//! - Handler errors and panics travel back as the envelope's error field
//! - A request that cannot be decoded is dropped, so the caller times out,
//!   unless tracing is installed or `reply_on_codec_error` is set
//! - A result that cannot be encoded is logged and dropped under the same rule
//! - Respond failures are logged and never retried

mod context;
mod core;

pub use context::RequestContext;
pub use core::{Dispatcher, HandlerOptions};
