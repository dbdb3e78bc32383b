//! Pluggable body encodings.
//!
//! The framing layer is agnostic to how a message's value tree becomes
//! bytes. Two encodings ship with the crate:
//!
//! - [`JsonEncoding`]: UTF-8 JSON text (`serde_json`)
//! - [`CborEncoding`]: compact binary CBOR (`ciborium`)
//!
//! Both peers of a connection must use the same encoding.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Turns value trees into bytes and back.
pub trait Encoding: Send + Sync + fmt::Debug {
    /// Write the encoded form of `value` to `out`.
    fn encode(&self, value: &Value, out: &mut dyn io::Write) -> Result<()>;

    /// Decode a complete body into a value tree.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON text encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoding;

impl Encoding for JsonEncoding {
    fn encode(&self, value: &Value, out: &mut dyn io::Write) -> Result<()> {
        serde_json::to_writer(out, value).map_err(|e| Error::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Encoding(e.to_string()))
    }
}

/// CBOR binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborEncoding;

impl Encoding for CborEncoding {
    fn encode(&self, value: &Value, out: &mut dyn io::Write) -> Result<()> {
        ciborium::ser::into_writer(value, out).map_err(|e| Error::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        ciborium::de::from_reader(bytes).map_err(|e| Error::Encoding(e.to_string()))
    }
}

/// Selects an encoding by name, e.g. from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingKind {
    /// [`JsonEncoding`].
    #[default]
    Json,
    /// [`CborEncoding`].
    Cbor,
}

impl EncodingKind {
    /// Instantiate the selected encoding.
    pub fn build(self) -> Box<dyn Encoding> {
        match self {
            EncodingKind::Json => Box::new(JsonEncoding),
            EncodingKind::Cbor => Box::new(CborEncoding),
        }
    }
}

impl FromStr for EncodingKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(EncodingKind::Json),
            "cbor" => Ok(EncodingKind::Cbor),
            other => Err(format!("unknown encoding: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({"id": 7, "type": 5, "body": {"lid": 1, "bid": 100, "dat": "aGVsbG8="}})
    }

    #[test]
    fn test_json_round_trip() {
        let mut buf = Vec::new();
        JsonEncoding.encode(&sample(), &mut buf).unwrap();
        assert_eq!(JsonEncoding.decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_cbor_round_trip() {
        let mut buf = Vec::new();
        CborEncoding.encode(&sample(), &mut buf).unwrap();
        assert_eq!(CborEncoding.decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_garbage_is_encoding_error() {
        let err = JsonEncoding.decode(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("JSON".parse::<EncodingKind>().unwrap(), EncodingKind::Json);
        assert_eq!("cbor".parse::<EncodingKind>().unwrap(), EncodingKind::Cbor);
        assert!("xml".parse::<EncodingKind>().is_err());
    }
}
