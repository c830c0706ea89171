//! # Service Module
//!
//! All-or-nothing registration of several methods under one service name.
//!
//! ```rust,ignore
//! let handle = dispatcher
//!     .service("User")
//!     .method("GetById", |_ctx, id: u64| users.get(id))
//!     .method("Ping", |_ctx, text: String| Ok(text))
//!     .start()?;
//! ```
//!
//! Methods subscribe on `{prefix}.{Service}.{Method}` under the configured
//! queue group. Every problem found while collecting methods (bad options,
//! duplicate names, kinds that disagree with a [`ServiceDescriptor`]) is
//! reported by [`ServiceBuilder::start`] before anything subscribes. If a
//! subscription fails part way through, the runners already started are shut
//! down in reverse order before the error is returned.

use std::collections::HashMap;
use std::fmt;

use tracing::{error, info, warn};

use crate::codec::{Codec, JsonCodec, Payload};
use crate::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::dispatcher::{Dispatcher, HandlerOptions, RequestContext};
use crate::error::{Result, RpcError};
use crate::runner::{RawHandler, Runner};

struct PendingMethod {
    descriptor: MethodDescriptor,
    handler: RawHandler,
}

/// Collects methods for one service, then starts them together.
pub struct ServiceBuilder<C: Codec = JsonCodec> {
    dispatcher: Dispatcher<C>,
    name: String,
    declared: Option<HashMap<String, MethodDescriptor>>,
    methods: Vec<PendingMethod>,
    errors: Vec<RpcError>,
}

impl<C: Codec> ServiceBuilder<C> {
    pub(crate) fn new(dispatcher: Dispatcher<C>, name: &str) -> Self {
        Self {
            dispatcher,
            name: name.to_string(),
            declared: None,
            methods: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A builder whose methods must match `descriptor`; bind them with
    /// [`ServiceBuilder::bind`].
    ///
    /// Fails with [`RpcError::UnsupportedType`] when a declared type shape
    /// cannot be a payload.
    pub fn from_descriptor(dispatcher: &Dispatcher<C>, descriptor: &ServiceDescriptor) -> Result<Self> {
        let resolved = descriptor.resolve(dispatcher.config())?;
        let declared = resolved
            .into_iter()
            .map(|method| (method.name.clone(), method))
            .collect();
        Ok(Self {
            dispatcher: dispatcher.clone(),
            name: descriptor.name.clone(),
            declared: Some(declared),
            methods: Vec::new(),
            errors: Vec::new(),
        })
    }

    /// Add a method with the runtime defaults.
    #[must_use]
    pub fn method<Req, Res, F>(self, name: &str, handler: F) -> Self
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        self.method_with(name, HandlerOptions::new(), handler)
    }

    /// Add a method with per-method overrides.
    #[must_use]
    pub fn method_with<Req, Res, F>(mut self, name: &str, options: HandlerOptions, handler: F) -> Self
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        if self.declared.is_some() {
            self.errors.push(RpcError::InvalidConfig(format!(
                "service '{}' is bound to a descriptor; use bind for '{name}'",
                self.name
            )));
            return self;
        }

        let subject = self.dispatcher.config().subject_for(&self.name, name);
        match self.dispatcher.resolve(&subject, &options) {
            Ok((group, concurrency, timeout)) => {
                let descriptor = MethodDescriptor {
                    name: name.to_string(),
                    subject,
                    group,
                    concurrency,
                    timeout,
                    request: Req::KIND,
                    response: Res::KIND,
                };
                self.push(descriptor, handler);
            }
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Attach a handler to a method declared by the descriptor.
    ///
    /// The handler's payload kinds must match the declared ones.
    #[must_use]
    pub fn bind<Req, Res, F>(mut self, name: &str, handler: F) -> Self
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        let Some(declared) = self.declared.as_ref().and_then(|d| d.get(name)).cloned() else {
            self.errors.push(RpcError::InvalidConfig(format!(
                "method '{name}' is not declared by service '{}'",
                self.name
            )));
            return self;
        };

        if declared.request != Req::KIND {
            self.errors.push(RpcError::KindMismatch {
                method: name.to_string(),
                declared: declared.request,
                actual: Req::KIND,
            });
        } else if declared.response != Res::KIND {
            self.errors.push(RpcError::KindMismatch {
                method: name.to_string(),
                declared: declared.response,
                actual: Res::KIND,
            });
        } else {
            self.push(declared, handler);
        }
        self
    }

    fn push<Req, Res, F>(&mut self, descriptor: MethodDescriptor, handler: F)
    where
        Req: Payload,
        Res: Payload,
        F: Fn(&RequestContext, Req) -> anyhow::Result<Res> + Send + Sync + 'static,
    {
        if self.methods.iter().any(|m| m.descriptor.name == descriptor.name) {
            self.errors.push(RpcError::InvalidConfig(format!(
                "method '{}' registered twice in service '{}'",
                descriptor.name, self.name
            )));
            return;
        }
        if descriptor.concurrency == 0 {
            self.errors.push(RpcError::InvalidConfig(format!(
                "concurrency for '{}' must be at least 1",
                descriptor.subject
            )));
            return;
        }
        let handler = self
            .dispatcher
            .endpoint(&descriptor.subject, descriptor.timeout, handler);
        self.methods.push(PendingMethod { descriptor, handler });
    }

    /// Start every method, or none of them.
    pub fn start(self) -> Result<ServiceHandle> {
        if let Some(first) = self.errors.first() {
            for e in &self.errors {
                error!(service = %self.name, error = %e, "Service registration rejected");
            }
            return Err(first.clone());
        }

        if let Some(declared) = &self.declared {
            let mut names: Vec<&String> = declared.keys().collect();
            names.sort();
            for name in names {
                if !self.methods.iter().any(|m| &m.descriptor.name == name) {
                    return Err(RpcError::InvalidConfig(format!(
                        "method '{name}' of service '{}' has no handler",
                        self.name
                    )));
                }
            }
        }

        let mut started: Vec<(MethodDescriptor, Runner)> = Vec::with_capacity(self.methods.len());
        for method in self.methods {
            let d = &method.descriptor;
            match self
                .dispatcher
                .start_runner(&d.subject, &d.group, d.concurrency, method.handler)
            {
                Ok(runner) => started.push((method.descriptor, runner)),
                Err(e) => {
                    error!(
                        service = %self.name,
                        subject = %method.descriptor.subject,
                        error = %e,
                        "Method failed to start, rolling back service"
                    );
                    for (descriptor, runner) in started.iter().rev() {
                        if let Err(shutdown_err) = runner.shutdown() {
                            warn!(
                                service = %self.name,
                                subject = %descriptor.subject,
                                error = %shutdown_err,
                                "Rollback shutdown failed"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(
            service = %self.name,
            methods = started.len(),
            "Service registered"
        );

        Ok(ServiceHandle {
            name: self.name,
            runners: started,
        })
    }
}

impl<C: Codec> fmt::Debug for ServiceBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self
            .methods
            .iter()
            .map(|m| m.descriptor.subject.as_str())
            .collect();
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("methods", &methods)
            .field("declared", &self.declared.as_ref().map(HashMap::len))
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Running methods of one service.
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    runners: Vec<(MethodDescriptor, Runner)>,
}

impl ServiceHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shut down every method. All runners are attempted; the first error is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for (descriptor, runner) in self.runners.iter().rev() {
            if let Err(e) = runner.shutdown() {
                warn!(service = %self.name, subject = %descriptor.subject, error = %e, "Method shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(service = %self.name, "Service stopped");
                Ok(())
            }
        }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.runners.iter().map(|(d, _)| d)
    }

    #[must_use]
    pub fn runner(&self, method: &str) -> Option<&Runner> {
        self.runners
            .iter()
            .find(|(d, _)| d.name == method)
            .map(|(_, r)| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::codec::PayloadKind;
    use crate::config::RuntimeConfig;
    use std::sync::Arc;

    fn dispatcher(bus: &MemoryBus) -> Dispatcher {
        Dispatcher::new(Arc::new(bus.clone()), RuntimeConfig::default())
    }

    #[test]
    fn methods_get_prefixed_subjects() {
        let bus = MemoryBus::new();
        let handle = dispatcher(&bus)
            .service("User")
            .method("Ping", |_ctx, text: String| Ok(text))
            .method_with(
                "Count",
                HandlerOptions::new().concurrency(1),
                |_ctx, _req: ()| Ok(3u32),
            )
            .start()
            .unwrap();

        let subjects: Vec<&str> = handle.descriptors().map(|d| d.subject.as_str()).collect();
        assert_eq!(subjects, vec!["busrpc.User.Ping", "busrpc.User.Count"]);
        assert_eq!(handle.runner("Count").unwrap().concurrency(), 1);
        assert_eq!(bus.subscription_count("busrpc.User.Ping"), 1);

        handle.shutdown().unwrap();
        assert_eq!(bus.subscription_count("busrpc.User.Ping"), 0);
    }

    #[test]
    fn validation_errors_prevent_any_subscription() {
        let bus = MemoryBus::new();
        let err = dispatcher(&bus)
            .service("User")
            .method("Ping", |_ctx, text: String| Ok(text))
            .method_with("Broken", HandlerOptions::new().concurrency(0), |_ctx, _req: ()| Ok(()))
            .start()
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
        assert_eq!(bus.subscription_count("busrpc.User.Ping"), 0);
    }

    #[test]
    fn descriptor_binding_checks_kinds() {
        let bus = MemoryBus::new();
        let descriptor = ServiceDescriptor::from_yaml_str(
            "name: Image\nmethods:\n  - name: Resize\n    request: \"[]byte\"\n    response: \"[]byte\"\n",
        )
        .unwrap();

        let err = ServiceBuilder::from_descriptor(&dispatcher(&bus), &descriptor)
            .unwrap()
            .bind("Resize", |_ctx, text: String| Ok(text.into_bytes()))
            .start()
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::KindMismatch {
                method: "Resize".into(),
                declared: PayloadKind::Bytes,
                actual: PayloadKind::Text,
            }
        );
        assert_eq!(bus.subscription_count("busrpc.Image.Resize"), 0);
    }

    #[test]
    fn builder_debug_lists_pending_methods() {
        let bus = MemoryBus::new();
        let builder = dispatcher(&bus)
            .service("User")
            .method("Ping", |_ctx, text: String| Ok(text));
        let rendered = format!("{builder:?}");
        assert!(rendered.starts_with("ServiceBuilder"));
        assert!(rendered.contains("busrpc.User.Ping"));
        assert!(rendered.contains("declared: None"));
    }

    #[test]
    fn descriptor_methods_must_all_be_bound() {
        let bus = MemoryBus::new();
        let descriptor = ServiceDescriptor::from_yaml_str(
            "name: Image\nmethods:\n  - name: Resize\n    request: \"[]byte\"\n  - name: Crop\n    request: \"[]byte\"\n",
        )
        .unwrap();
        let err = ServiceBuilder::from_descriptor(&dispatcher(&bus), &descriptor)
            .unwrap()
            .bind("Resize", |_ctx, _img: Vec<u8>| Ok(()))
            .start()
            .unwrap_err();
        assert!(err.to_string().contains("Crop"));
    }
}
