//! # busrpc
//!
//! **busrpc** turns a publish/subscribe message bus into a request/reply RPC
//! transport, running handlers on pools of `may` coroutines.
//!
//! ## Overview
//!
//! A handler registered on a subject joins a named queue group, so every
//! request reaches exactly one worker across all instances of the service.
//! Replies travel in a small self-describing envelope that separates a
//! handler's result from its error, and callers wait for exactly one reply
//! bounded by a timeout.
//!
//! ## Architecture
//!
//! - **[`codec`]** - Payload encoding with raw fast paths for text and bytes
//! - **[`reply`]** - The wire reply envelope (`{"d": ..}` or `{"e": ..}`)
//! - **[`pool`]** - Reuse pool for reply envelopes
//! - **[`bus`]** - The message bus boundary and an in-memory implementation
//! - **[`runner`]** - One subscription drained by a fixed pool of workers
//! - **[`dispatcher`]** - Typed handler registration and the per-message wrapper
//! - **[`client`]** - The timeout-bounded request path
//! - **[`service`]** / **[`descriptor`]** - All-or-nothing multi-method services
//! - **[`trace`]** - Optional W3C trace-context propagation
//! - **[`config`]** / **[`logging`]** - Runtime defaults and structured logging
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Caller
//!     participant Client
//!     participant Bus as MessageBus
//!     participant Runner as Runner worker
//!     participant Handler
//!
//!     Caller->>Client: call("svc.Echo", &req)
//!     Client->>Client: encode (+ trace frame)
//!     Client->>Bus: request(subject, bytes, timeout)
//!     Bus->>Runner: deliver to one queue-group member
//!     Runner->>Runner: extract trace, decode request
//!     Runner->>Handler: handler(&ctx, req)
//!     Handler-->>Runner: Ok(res) / Err(e)
//!     Runner->>Runner: fill pooled envelope, marshal, release
//!     Runner->>Bus: respond(envelope)
//!     Bus-->>Client: reply bytes
//!     Client->>Client: error field first, else decode payload
//!     Client-->>Caller: Ok(res) / Application / Timeout / Transport
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use busrpc::{Dispatcher, HandlerOptions, MemoryBus, RuntimeConfig};
//!
//! let bus = Arc::new(MemoryBus::new());
//! let dispatcher = Dispatcher::new(bus, RuntimeConfig::from_env());
//!
//! let runner = dispatcher
//!     .serve("svc.Echo", HandlerOptions::new().concurrency(2), |_ctx, text: String| {
//!         Ok(text)
//!     })
//!     .expect("subscribe");
//!
//! let echoed: String = dispatcher
//!     .client()
//!     .call("svc.Echo", &"hello".to_string())
//!     .expect("call");
//! assert_eq!(echoed, "hello");
//!
//! runner.shutdown().expect("unsubscribe");
//! ```
//!
//! ## Runtime Considerations
//!
//! busrpc uses the `may` coroutine runtime, not tokio or async-std:
//!
//! - Workers are stackful coroutines; the stack size is set with `BUSRPC_STACK_SIZE`
//! - Handlers run to completion; cancellation only stops new pickups
//! - Blocking inside a handler should use `may`'s blocking facilities

pub mod bus;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod logging;
pub mod pool;
pub mod reply;
pub mod runner;
pub mod service;
pub mod trace;

pub use bus::{MemoryBus, Message, MessageBus, Respond, Subscription, SubscriptionId};
pub use cancel::{CancelSignal, ListenerKey};
pub use client::Client;
pub use codec::{Codec, JsonCodec, Payload, PayloadKind, Structured};
pub use config::RuntimeConfig;
pub use descriptor::{MethodDescriptor, MethodSpec, ServiceDescriptor};
pub use dispatcher::{Dispatcher, HandlerOptions, RequestContext};
pub use error::{Result, RpcError};
pub use ids::RequestId;
pub use pool::{PooledReply, ReplyPool};
pub use reply::ReplyEnvelope;
pub use runner::{RawHandler, Runner, RunnerConfig, RunnerMetrics, RunnerState};
pub use service::{ServiceBuilder, ServiceHandle};
pub use trace::{Tracer, W3cTracer};
