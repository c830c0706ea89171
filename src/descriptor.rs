//! # Service Descriptor Module
//!
//! The logical description of a service as produced by an interface scanner or
//! code generator: a name plus, per method, the request and response type names
//! and optional concurrency, timeout and subject overrides.
//!
//! ## Example
//!
//! ```yaml
//! name: User
//! timeout_secs: 3
//! methods:
//!   - name: GetById
//!     request: int64
//!     response: "*api.User"
//!     concurrency: 10
//!   - name: Ping
//!     request: string
//!     response: string
//!   - name: Forget
//!     request: "*api.User"
//! ```
//!
//! Resolving a descriptor turns every type name into a [`PayloadKind`] once.
//! Type shapes that cannot travel over the bus (channels, functions,
//! interfaces) fail here with [`RpcError::UnsupportedType`].

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::codec::PayloadKind;
use crate::config::RuntimeConfig;
use crate::error::{Result, RpcError};

/// A service as described by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Handler timeout for every method without its own
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
}

/// One method of a [`ServiceDescriptor`], before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    /// Request type name; empty means no request payload
    #[serde(default)]
    pub request: String,
    /// Response type name; empty means no response payload
    #[serde(default)]
    pub response: String,
    /// Worker count; absent or zero uses the runtime default
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Explicit subject instead of `{prefix}.{Service}.{Method}`
    #[serde(default)]
    pub subject: Option<String>,
}

/// A fully resolved method, ready to be bound to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub subject: String,
    pub group: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub request: PayloadKind,
    pub response: PayloadKind,
}

impl ServiceDescriptor {
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let descriptor: Self = serde_yaml::from_str(contents)?;
        Ok(descriptor)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service descriptor: {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse service descriptor: {}", path.display()))
    }

    /// Resolve every method against the runtime defaults.
    pub fn resolve(&self, config: &RuntimeConfig) -> Result<Vec<MethodDescriptor>> {
        if self.name.trim().is_empty() {
            return Err(RpcError::InvalidConfig("service name is empty".to_string()));
        }

        let service_timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.handler_timeout());

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            if method.name.trim().is_empty() {
                return Err(RpcError::InvalidConfig(format!(
                    "service '{}' has a method without a name",
                    self.name
                )));
            }
            if !seen.insert(method.name.as_str()) {
                return Err(RpcError::InvalidConfig(format!(
                    "method '{}' is declared twice in service '{}'",
                    method.name, self.name
                )));
            }

            let timeout = method
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(service_timeout);
            if timeout.is_zero() {
                return Err(RpcError::InvalidConfig(format!(
                    "method '{}' has a zero timeout",
                    method.name
                )));
            }

            resolved.push(MethodDescriptor {
                name: method.name.clone(),
                subject: method
                    .subject
                    .clone()
                    .unwrap_or_else(|| config.subject_for(&self.name, &method.name)),
                group: config.queue_group.clone(),
                concurrency: method
                    .concurrency
                    .filter(|&n| n > 0)
                    .unwrap_or(config.concurrency),
                timeout,
                request: PayloadKind::from_type_name(&method.request)?,
                response: PayloadKind::from_type_name(&method.response)?,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_SERVICE: &str = r#"
name: User
timeout_secs: 2
methods:
  - name: GetById
    request: int64
    response: "*api.User"
    concurrency: 10
  - name: Ping
    request: string
    response: string
    timeout_secs: 1
  - name: Forget
    request: "*api.User"
  - name: Upload
    request: "[]byte"
    concurrency: 0
    subject: images.upload
"#;

    #[test]
    fn resolves_kinds_and_defaults() {
        let descriptor = ServiceDescriptor::from_yaml_str(USER_SERVICE).unwrap();
        let methods = descriptor.resolve(&RuntimeConfig::default()).unwrap();
        assert_eq!(methods.len(), 4);

        let get = &methods[0];
        assert_eq!(get.subject, "busrpc.User.GetById");
        assert_eq!(get.group, "busrpc");
        assert_eq!(get.concurrency, 10);
        assert_eq!(get.timeout, Duration::from_secs(2));
        assert_eq!(get.request, PayloadKind::Structured);
        assert_eq!(get.response, PayloadKind::Structured);

        let ping = &methods[1];
        assert_eq!(ping.request, PayloadKind::Text);
        assert_eq!(ping.timeout, Duration::from_secs(1));

        let forget = &methods[2];
        assert_eq!(forget.response, PayloadKind::Void);

        let upload = &methods[3];
        assert_eq!(upload.subject, "images.upload");
        assert_eq!(upload.concurrency, 5);
        assert_eq!(upload.request, PayloadKind::Bytes);
    }

    #[test]
    fn unsupported_shape_fails_resolution() {
        let yaml = "name: Stream\nmethods:\n  - name: Watch\n    request: string\n    response: chan int\n";
        let descriptor = ServiceDescriptor::from_yaml_str(yaml).unwrap();
        let err = descriptor.resolve(&RuntimeConfig::default()).unwrap_err();
        assert_eq!(err, RpcError::UnsupportedType("chan int".into()));
    }

    #[test]
    fn duplicate_methods_are_rejected() {
        let yaml = "name: Dup\nmethods:\n  - name: A\n  - name: A\n";
        let descriptor = ServiceDescriptor::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            descriptor.resolve(&RuntimeConfig::default()),
            Err(RpcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn file_loading_adds_context() {
        let err = ServiceDescriptor::from_yaml_file(Path::new("/nonexistent/user.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read service descriptor"));
    }
}
