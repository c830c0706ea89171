//! # Payload Codec Module
//!
//! Turns handler arguments and results into bytes and back.
//!
//! Two layers cooperate here:
//!
//! - [`Codec`] is the pluggable serializer for structured values. [`JsonCodec`]
//!   is the default and the only one the wire envelope assumes nothing about.
//! - [`Payload`] is implemented by every type a handler may accept or return.
//!   Each implementation carries a [`PayloadKind`] tag so registration can
//!   resolve the kind once instead of inspecting values per call.
//!
//! ## Fast Paths
//!
//! | Rust type | Kind | Encode | Decode |
//! |---|---|---|---|
//! | `()` | `Void` | empty bytes | always succeeds |
//! | `String` | `Text` | raw UTF-8 bytes, JSON-quoted if it reads as a JSON string | unquotes a JSON string literal, otherwise verbatim |
//! | `Vec<u8>` | `Bytes` | verbatim | verbatim |
//! | any [`Structured`] type | `Structured` | through the codec | through the codec |
//!
//! Types opt into the structured path by implementing the [`Structured`]
//! marker:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! impl busrpc::Structured for User {}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Pluggable serializer for structured payloads.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Shape of a request or response payload, resolved once per registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// No payload at all
    Void,
    /// Raw UTF-8 string
    Text,
    /// Raw byte string
    Bytes,
    /// Value serialized through a [`Codec`]
    Structured,
}

impl PayloadKind {
    /// Resolve a type name from a service description.
    ///
    /// Accepts both the generator's source-language spellings (`string`,
    /// `[]byte`) and Rust spellings (`String`, `Vec<u8>`). Channel, function
    /// and interface shapes cannot travel over the bus and are rejected.
    pub fn from_type_name(name: &str) -> Result<Self> {
        let name = name.trim();
        match name {
            "" | "void" | "()" => return Ok(PayloadKind::Void),
            "string" | "String" | "&str" => return Ok(PayloadKind::Text),
            "[]byte" | "bytes" | "Vec<u8>" => return Ok(PayloadKind::Bytes),
            _ => {}
        }

        let unsupported = name.starts_with("chan ")
            || name.starts_with("<-chan")
            || name.starts_with("chan<-")
            || name.starts_with("func(")
            || name.starts_with("func ")
            || name.starts_with("interface{")
            || name.starts_with("interface {")
            || name == "any"
            || name.starts_with("dyn ")
            || name.starts_with("fn(")
            || name.starts_with("impl ");
        if unsupported {
            return Err(RpcError::UnsupportedType(name.to_string()));
        }

        // Named types, pointers, slices and maps of named types.
        let mut body = name;
        while let Some(rest) = body.strip_prefix('*').or_else(|| body.strip_prefix("[]")) {
            body = rest;
        }
        let valid = !body.is_empty()
            && body.chars().all(|c| {
                c.is_alphanumeric() || matches!(c, '_' | '.' | ':' | '<' | '>' | ',' | ' ' | '[' | ']')
            });
        if valid {
            Ok(PayloadKind::Structured)
        } else {
            Err(RpcError::UnsupportedType(name.to_string()))
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Void => "void",
            PayloadKind::Text => "text",
            PayloadKind::Bytes => "bytes",
            PayloadKind::Structured => "structured",
        };
        f.write_str(name)
    }
}

/// A type that can be a handler argument or result.
pub trait Payload: Sized + Send + 'static {
    const KIND: PayloadKind;

    fn encode_with<C: Codec>(&self, codec: &C) -> Result<Vec<u8>>;

    fn decode_with<C: Codec>(codec: &C, bytes: &[u8]) -> Result<Self>;
}

/// Marker for values that travel through the [`Codec`].
pub trait Structured: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Structured> Payload for T {
    const KIND: PayloadKind = PayloadKind::Structured;

    fn encode_with<C: Codec>(&self, codec: &C) -> Result<Vec<u8>> {
        codec.encode(self)
    }

    fn decode_with<C: Codec>(codec: &C, bytes: &[u8]) -> Result<Self> {
        codec.decode(bytes)
    }
}

impl Payload for () {
    const KIND: PayloadKind = PayloadKind::Void;

    fn encode_with<C: Codec>(&self, _codec: &C) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode_with<C: Codec>(_codec: &C, _bytes: &[u8]) -> Result<Self> {
        Ok(())
    }
}

impl Payload for String {
    const KIND: PayloadKind = PayloadKind::Text;

    fn encode_with<C: Codec>(&self, _codec: &C) -> Result<Vec<u8>> {
        // Text that would read back as a quoted literal is quoted once more.
        if json_string_literal(self.as_bytes()).is_some() {
            return serde_json::to_vec(self).map_err(|e| RpcError::Encode(e.to_string()));
        }
        Ok(self.as_bytes().to_vec())
    }

    fn decode_with<C: Codec>(_codec: &C, bytes: &[u8]) -> Result<Self> {
        if let Some(text) = json_string_literal(bytes) {
            return Ok(text);
        }
        String::from_utf8(bytes.to_vec()).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// `bytes` as a JSON string literal, quote to quote.
fn json_string_literal(bytes: &[u8]) -> Option<String> {
    match bytes {
        [b'"', _, ..] if bytes.ends_with(b"\"") => serde_json::from_slice(bytes).ok(),
        _ => None,
    }
}

impl Payload for Vec<u8> {
    const KIND: PayloadKind = PayloadKind::Bytes;

    fn encode_with<C: Codec>(&self, _codec: &C) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode_with<C: Codec>(_codec: &C, bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

macro_rules! structured {
    ($($ty:ty),* $(,)?) => {
        $(impl Structured for $ty {})*
    };
}

// `u8` is left out so that `Vec<u8>` stays on the byte fast path.
structured!(bool, char, i8, i16, i32, i64, i128, isize, u16, u32, u64, u128, usize, f32, f64);
structured!(serde_json::Value);

impl<T: Structured> Structured for Option<T> {}
impl<T: Structured> Structured for Vec<T> {}
impl<K, V> Structured for HashMap<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Send + 'static,
    V: Structured,
{
}
impl<K, V> Structured for BTreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Ord + Send + 'static,
    V: Structured,
{
}
