use std::fmt;
use std::time::Duration;

use crate::codec::PayloadKind;

/// Convenience alias used throughout the crate.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Every failure the runtime can surface.
///
/// Callers of the client path observe a decoded value,
/// [`RpcError::Application`], [`RpcError::Timeout`] or one of the transport
/// variants. A reply that is not a valid envelope counts as transport; a valid
/// envelope whose payload does not fit the expected type is
/// [`RpcError::Decode`]. Server-side codec failures never cross the wire unless
/// the runtime is configured to answer them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// A value could not be encoded into bytes.
    Encode(String),
    /// Bytes could not be decoded into the expected value.
    Decode(String),
    /// The bus rejected a subscription.
    Subscribe {
        /// Subject that was being subscribed
        subject: String,
        /// Bus-reported reason
        reason: String,
    },
    /// The bus rejected an unsubscribe.
    Unsubscribe {
        /// Subject of the subscription
        subject: String,
        /// Bus-reported reason
        reason: String,
    },
    /// Publishing, requesting or responding failed at the bus level.
    Transport(String),
    /// No reply arrived before the deadline.
    Timeout {
        /// Subject the request was sent to
        subject: String,
        /// Budget that elapsed
        timeout: Duration,
    },
    /// The remote handler ran and returned an error.
    ///
    /// Displays as the handler's message with nothing added.
    Application(String),
    /// A service description named a type shape that cannot travel as a payload.
    UnsupportedType(String),
    /// A handler's payload kind disagrees with the service description.
    KindMismatch {
        /// Method being bound
        method: String,
        /// Kind from the description
        declared: PayloadKind,
        /// Kind implied by the handler signature
        actual: PayloadKind,
    },
    /// A registration or configuration value is out of range.
    InvalidConfig(String),
    /// A worker coroutine could not be spawned.
    Spawn(String),
    /// Trace context could not be injected or extracted.
    Trace(String),
}

impl RpcError {
    /// True when the call gave up waiting for a reply.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// True when the error was reported by the remote handler.
    #[must_use]
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::Application(_))
    }

    /// True for bus-level failures (subscribe, unsubscribe, publish, respond).
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Subscribe { .. } | RpcError::Unsubscribe { .. }
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Encode(reason) => write!(f, "encode error: {reason}"),
            RpcError::Decode(reason) => write!(f, "decode error: {reason}"),
            RpcError::Subscribe { subject, reason } => {
                write!(f, "failed to subscribe to '{subject}': {reason}")
            }
            RpcError::Unsubscribe { subject, reason } => {
                write!(f, "failed to unsubscribe from '{subject}': {reason}")
            }
            RpcError::Transport(reason) => write!(f, "transport error: {reason}"),
            RpcError::Timeout { subject, timeout } => write!(
                f,
                "request to '{subject}' timed out after {}ms",
                timeout.as_millis()
            ),
            RpcError::Application(message) => f.write_str(message),
            RpcError::UnsupportedType(shape) => {
                write!(f, "unsupported payload type '{shape}'")
            }
            RpcError::KindMismatch {
                method,
                declared,
                actual,
            } => write!(
                f,
                "method '{method}' is declared with {declared:?} payloads but the handler uses {actual:?}"
            ),
            RpcError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            RpcError::Spawn(reason) => write!(f, "failed to spawn worker: {reason}"),
            RpcError::Trace(reason) => write!(f, "trace context error: {reason}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_displays_message_verbatim() {
        let err = RpcError::Application("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert!(err.is_application());
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_display_includes_subject_and_budget() {
        let err = RpcError::Timeout {
            subject: "svc.Missing".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "request to 'svc.Missing' timed out after 250ms"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn transport_classification() {
        assert!(RpcError::Transport("closed".into()).is_transport());
        assert!(RpcError::Subscribe {
            subject: "a".into(),
            reason: "b".into()
        }
        .is_transport());
        assert!(!RpcError::Decode("bad".into()).is_transport());
    }
}
