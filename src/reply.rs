//! Wire-level reply envelope.
//!
//! The envelope is a JSON object with two optional fields:
//!
//! ```json
//! {"d": "<base64 payload>"}
//! {"e": "<base64 error text>"}
//! {}
//! ```
//!
//! `d` and `e` are mutually exclusive. An object with neither is a successful
//! call that returned nothing. A present-but-empty field is still present, so a
//! handler returning `""` is distinguishable from one returning `()`.
//!
//! Both fields are backed by retained buffers. [`ReplyEnvelope::reset`] clears
//! them without giving the allocation back, which is what makes pooling worth it.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Success payload XOR error message.
#[derive(Debug, Default)]
pub struct ReplyEnvelope {
    payload: Vec<u8>,
    error: Vec<u8>,
    has_payload: bool,
    has_error: bool,
}

#[derive(Serialize)]
struct WireOut {
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(rename = "e", skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireIn<'a> {
    #[serde(rename = "d", default, borrow)]
    payload: Option<Cow<'a, str>>,
    #[serde(rename = "e", default, borrow)]
    error: Option<Cow<'a, str>>,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a successful result.
    pub fn set_payload(&mut self, payload: &[u8]) {
        debug_assert!(!self.has_error, "payload set on an envelope carrying an error");
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.has_payload = true;
    }

    /// Store a handler error as its display text.
    pub fn set_error(&mut self, message: impl AsRef<str>) {
        debug_assert!(!self.has_payload, "error set on an envelope carrying a payload");
        self.error.clear();
        self.error.extend_from_slice(message.as_ref().as_bytes());
        self.has_error = true;
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.has_payload
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// The remote handler's error, if one was reported.
    #[must_use]
    pub fn error(&self) -> Option<RpcError> {
        self.has_error
            .then(|| RpcError::Application(String::from_utf8_lossy(&self.error).into_owned()))
    }

    /// True when neither field is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_payload && !self.has_error
    }

    /// Clear both fields, keeping their buffers.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.error.clear();
        self.has_payload = false;
        self.has_error = false;
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let wire = WireOut {
            payload: self.has_payload.then(|| STANDARD.encode(&self.payload)),
            error: self.has_error.then(|| STANDARD.encode(&self.error)),
        };
        serde_json::to_vec(&wire).map_err(|e| RpcError::Encode(e.to_string()))
    }

    /// Replace the contents with a decoded wire envelope.
    ///
    /// On error the envelope is left reset.
    pub fn unmarshal(&mut self, bytes: &[u8]) -> Result<()> {
        self.reset();
        let wire: WireIn<'_> =
            serde_json::from_slice(bytes).map_err(|e| RpcError::Decode(e.to_string()))?;

        if let Some(payload) = wire.payload {
            if let Err(e) = STANDARD.decode_vec(payload.as_bytes(), &mut self.payload) {
                self.reset();
                return Err(RpcError::Decode(format!("reply payload: {e}")));
            }
            self.has_payload = true;
        }
        if let Some(error) = wire.error {
            if let Err(e) = STANDARD.decode_vec(error.as_bytes(), &mut self.error) {
                self.reset();
                return Err(RpcError::Decode(format!("reply error: {e}")));
            }
            self.has_error = true;
        }
        Ok(())
    }

    /// Decode a fresh envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut envelope = Self::new();
        envelope.unmarshal(bytes)?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_success_is_an_empty_object() {
        let envelope = ReplyEnvelope::new();
        assert_eq!(envelope.marshal().unwrap(), b"{}");
        let back = ReplyEnvelope::decode(b"{}").unwrap();
        assert!(back.is_empty());
        assert!(back.error().is_none());
    }

    #[test]
    fn error_envelope_has_no_payload_field() {
        let mut envelope = ReplyEnvelope::new();
        envelope.set_error("boom");
        let wire = envelope.marshal().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert!(value.get("d").is_none());
        assert_eq!(value["e"], STANDARD.encode("boom"));

        let back = ReplyEnvelope::decode(&wire).unwrap();
        assert_eq!(back.error(), Some(RpcError::Application("boom".into())));
    }

    #[test]
    fn empty_payload_is_distinct_from_absent() {
        let mut envelope = ReplyEnvelope::new();
        envelope.set_payload(b"");
        let wire = envelope.marshal().unwrap();
        assert_eq!(wire, br#"{"d":""}"#);
        let back = ReplyEnvelope::decode(&wire).unwrap();
        assert!(back.has_payload());
        assert!(back.payload().is_empty());
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut envelope = ReplyEnvelope::new();
        envelope.set_payload(&[7u8; 512]);
        let cap = envelope.payload.capacity();
        envelope.reset();
        assert!(envelope.is_empty());
        assert!(envelope.payload().is_empty());
        assert!(envelope.payload.capacity() >= cap);
    }

    #[test]
    fn unmarshal_replaces_previous_contents() {
        let mut envelope = ReplyEnvelope::new();
        envelope.set_error("stale");
        envelope.unmarshal(br#"{"d":"aGk="}"#).unwrap();
        assert!(envelope.error().is_none());
        assert_eq!(envelope.payload(), b"hi");
    }

    #[test]
    fn malformed_input_is_decode_error() {
        let mut envelope = ReplyEnvelope::new();
        assert!(matches!(
            envelope.unmarshal(b"not json"),
            Err(RpcError::Decode(_))
        ));
        assert!(matches!(
            envelope.unmarshal(br#"{"d":"***"}"#),
            Err(RpcError::Decode(_))
        ));
        assert!(envelope.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let back = ReplyEnvelope::decode(br#"{"d":"eA==","extra":1}"#).unwrap();
        assert_eq!(back.payload(), b"x");
    }
}
