// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Socket transports: request/response, publish/subscribe, and discovery.

pub mod discover;
pub mod publish;
pub mod request;

use std::collections::HashSet;
use std::ops::RangeInclusive;

use crate::error::{MktlError, Result};

/// Automatic port assignment range for request (ROUTER) sockets.
pub const REQUEST_PORTS: RangeInclusive<u16> = 10079..=13679;

/// Automatic port assignment range for publish (PUB) sockets.
pub const PUBLISH_PORTS: RangeInclusive<u16> = 10139..=13679;

/// Bind a socket on `preferred`, or scan `range` for the first free port.
///
/// Ports in `avoid` were previously claimed by other local daemons and are
/// passed over during the scan; if the rest of the range is exhausted they
/// are retried before giving up. `avoid` is ignored when `preferred` is set.
pub(crate) fn bind_scan<T>(
    preferred: Option<u16>,
    avoid: &HashSet<u16>,
    range: RangeInclusive<u16>,
    mut bind: impl FnMut(u16) -> std::result::Result<T, tmq::TmqError>,
) -> Result<(T, u16)> {
    if let Some(port) = preferred {
        return match bind(port) {
            Ok(socket) => Ok((socket, port)),
            Err(_) => Err(MktlError::Socket(format!("port already in use: {}", port))),
        };
    }

    let mut avoided = Vec::new();
    for trial in range.clone() {
        if avoid.contains(&trial) {
            avoided.push(trial);
            continue;
        }
        if let Ok(socket) = bind(trial) {
            return Ok((socket, trial));
        }
    }

    // The whole range is spoken for; re-take a reserved port if one is free.
    for trial in avoided {
        if let Ok(socket) = bind(trial) {
            return Ok((socket, trial));
        }
    }

    Err(MktlError::Socket(format!(
        "no ports available in range {}:{}",
        range.start(),
        range.end()
    )))
}

/// The fully qualified hostname advertised in provenance entries.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
