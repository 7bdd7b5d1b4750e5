// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types, and their mapping to the on-the-wire `error` payload object.

use serde::{Deserialize, Serialize};

/// The `error` object carried inside a payload. The `kind` field is the
/// protocol-level tag; it is deliberately free of any implementation-language
/// spelling beyond the tags enumerated by the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

/// Errors raised by mKTL operations.
///
/// The first six variants correspond one-to-one with the protocol's
/// `error.type` tags. Everything else is local-only and maps to the generic
/// `RuntimeError` tag if it ever has to cross the wire.
#[derive(Debug, thiserror::Error)]
pub enum MktlError {
    /// Bad input value for a SET, unknown request type, or missing store.
    #[error("{0}")]
    Value(String),

    /// Wrong operand type used with an item.
    #[error("{0}")]
    Type(String),

    /// Unknown key or store in a HASH/CONFIG/GET.
    #[error("{0}")]
    Key(String),

    /// ACK not seen within the ack timeout, or an overall deadline elapsed.
    /// Raised locally, never forwarded to the wire.
    #[error("{0}")]
    Timeout(String),

    /// A configuration block originating from this process came back around.
    /// Silently discarded by the receiving cache.
    #[error("configuration block originated here: {0}")]
    ProvenanceLoop(String),

    /// Malformed frame or unknown protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure (bind, connect, send, receive).
    #[error("socket error: {0}")]
    Socket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MktlError>;

impl MktlError {
    /// The protocol tag for this error.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "ValueError",
            Self::Type(_) => "TypeError",
            Self::Key(_) => "KeyError",
            Self::Timeout(_) => "TimeoutError",
            Self::ProvenanceLoop(_) => "ProvenanceLoopError",
            Self::Protocol(_) => "ProtocolError",
            Self::Socket(_) | Self::Io(_) | Self::Json(_) => "RuntimeError",
        }
    }

    /// Convert into the wire representation, for inclusion in a REP payload.
    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.wire_kind().to_string(),
            text: self.to_string(),
            debug: None,
        }
    }

    /// Reconstruct a local error from a wire `error` object. Unrecognized
    /// tags collapse into `Protocol`, preserving the original tag and text.
    pub fn from_wire(wire: &WireError) -> Self {
        let text = wire.text.clone();
        match wire.kind.as_str() {
            "ValueError" => Self::Value(text),
            "TypeError" => Self::Type(text),
            "KeyError" => Self::Key(text),
            "TimeoutError" => Self::Timeout(text),
            "ProvenanceLoopError" => Self::ProvenanceLoop(text),
            "ProtocolError" => Self::Protocol(text),
            other => Self::Protocol(format!("{}: {}", other, text)),
        }
    }
}

impl From<zmq::Error> for MktlError {
    fn from(err: zmq::Error) -> Self {
        Self::Socket(err.to_string())
    }
}

impl From<tmq::TmqError> for MktlError {
    fn from(err: tmq::TmqError) -> Self {
        Self::Socket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_kind_and_text() {
        let err = MktlError::Key("unknown store: kpfmet".to_string());
        let wire = err.to_wire();
        assert_eq!(wire.kind, "KeyError");

        let back = MktlError::from_wire(&wire);
        assert!(matches!(back, MktlError::Key(_)));
        assert_eq!(back.to_string(), "unknown store: kpfmet");
    }

    #[test]
    fn unknown_tag_degrades_to_protocol() {
        let wire = WireError {
            kind: "SomethingElse".to_string(),
            text: "boom".to_string(),
            debug: None,
        };
        let err = MktlError::from_wire(&wire);
        assert!(matches!(err, MktlError::Protocol(_)));
        assert!(err.to_string().contains("SomethingElse"));
    }

    #[test]
    fn wire_error_serialization_uses_type_field() {
        let wire = MktlError::Value("bad input".to_string()).to_wire();
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"type\":\"ValueError\""));
        assert!(json.contains("\"text\":\"bad input\""));
        assert!(!json.contains("debug"));
    }
}
