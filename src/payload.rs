// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The JSON payload carried by request, response, and publish frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MktlError, Result, WireError};

/// Payload schema shared by every frame family. All fields are optional;
/// absent keys deserialize to `None` and `None` fields are omitted on encode.
///
/// `shape` and `dtype` travel together when the payload describes an
/// out-of-band bulk buffer. `key` and `id` appear only on the elements of a
/// bundle broadcast: `key` names the item the element belongs to, and every
/// element of one bundle carries the same `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// UNIX epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,

    /// On a GET, bypass the daemon-side cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,

    /// Dimensions of the bulk buffer, outermost first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,

    /// Compact scalar-type spelling for the bulk buffer, e.g. `int16`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Bundle element: the KEY this element updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Bundle element: shared identifier marking one atomic bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Payload {
    /// A payload carrying a value and its timestamp.
    pub fn of_value(value: Value, time: f64) -> Self {
        Self {
            value: Some(value),
            time: Some(time),
            ..Self::default()
        }
    }

    /// A payload describing a bulk buffer (the bytes travel in the bulk
    /// frame, not here).
    pub fn of_bulk(shape: Vec<u64>, dtype: impl Into<String>, time: f64) -> Self {
        Self {
            shape: Some(shape),
            dtype: Some(dtype.into()),
            time: Some(time),
            ..Self::default()
        }
    }

    /// A payload reporting a failure.
    pub fn of_error(err: &MktlError) -> Self {
        Self {
            error: Some(err.to_wire()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn refresh_requested(&self) -> bool {
        self.refresh.unwrap_or(false)
    }

    /// Promote a carried `error` object into a local error, otherwise hand
    /// back the payload itself.
    pub fn into_result(self) -> Result<Payload> {
        match &self.error {
            Some(wire) => Err(MktlError::from_wire(wire)),
            None => Ok(self),
        }
    }

    /// Serialize for the wire. An empty payload encodes as a zero-length
    /// frame rather than `{}`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload frame. A zero-length frame means "no payload".
    pub fn decode(frame: &[u8]) -> Result<Option<Payload>> {
        if frame.is_empty() {
            return Ok(None);
        }
        let payload = serde_json::from_slice(frame)
            .map_err(|err| MktlError::Protocol(format!("unparseable payload: {}", err)))?;
        Ok(Some(payload))
    }
}

/// Current UNIX epoch time as float seconds, the timestamp convention used
/// throughout the protocol.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
