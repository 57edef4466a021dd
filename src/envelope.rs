//! Wire envelopes exchanged between callers, the broker and service nodes.
//!
//! Field names follow the established JSON format (`Pattern`,
//! `ServiceRequest`, `ServiceAddress`, ...). Byte payloads travel as base64
//! strings. Decoding ignores unknown fields, so a flat business body such as
//! `{"Pattern":"role:math,cmd:sum","Left":1,"Right":2}` is a valid request
//! envelope with an empty `Payload`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Where a pattern is served, and which broker that node trusts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceRecord {
    /// Canonical pattern the node registered.
    pub pattern: String,
    /// `host:port` of the node.
    pub service_address: String,
    /// `host:port` of the node's broker.
    #[serde(rename = "ServerAddress")]
    pub broker_address: String,
}

impl ServiceRecord {
    /// Create a record.
    pub fn new(
        pattern: impl Into<String>,
        service_address: impl Into<String>,
        broker_address: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            service_address: service_address.into(),
            broker_address: broker_address.into(),
        }
    }
}

/// Request addressed to a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestEnvelope {
    /// Pattern the caller wants served.
    pub pattern: String,
    /// Ask the responder to wrap its answer in a [`ResponseEnvelope`].
    #[serde(rename = "ServiceRequest")]
    pub broker_request: bool,
    /// Opaque caller payload.
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

impl RequestEnvelope {
    /// Create a request for `pattern` carrying `payload`.
    pub fn new(pattern: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            pattern: pattern.into(),
            broker_request: false,
            payload: payload.into(),
        }
    }

    /// Set the broker-request flag.
    pub fn broker_request(mut self, flag: bool) -> Self {
        self.broker_request = flag;
        self
    }
}

/// Answer wrapped with the record of the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    /// Responder's own record.
    pub service: ServiceRecord,
    /// Handler output.
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
}

/// Encode a value as a JSON body.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a JSON body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    // `null` is what an empty byte slice looks like coming from older nodes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}
