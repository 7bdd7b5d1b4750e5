// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! UDP discovery: how daemons, registries, and clients find each other.
//!
//! Two well-known ports carry the same call/response exchange. Registries
//! listen on 10103 and are the first stop for new clients; authoritative
//! daemons listen on 10111, where registries sweep for them. A responder
//! answers the call string with its request port; nothing else is exchanged.
//! Several daemons on one host share the port through `SO_REUSEPORT`, so a
//! single broadcast reaches all of them.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::home;

/// Registries answer here; it is the first port a client tries.
pub const REGISTRY_PORT: u16 = 10103;

/// Authoritative daemons answer here; registries sweep this port.
pub const DAEMON_PORT: u16 = 10111;

/// The call string. Any datagram with this (whitespace-trimmed) body gets a
/// response; everything else is ignored.
pub const CALL: &[u8] = b"I heard it";

/// Responses are this prefix followed by the request port in decimal ASCII.
pub const RESPONSE_PREFIX: &[u8] = b"on the X:";

/// How long a search collects responses.
pub const SEARCH_WINDOW: Duration = Duration::from_millis(500);

/// Minimum interval between responses to any one source address.
const RESPONSE_THROTTLE: Duration = Duration::from_millis(100);

/// After the first response in a no-wait search, linger briefly so
/// simultaneous responders still make the list.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

fn udp_socket(port: u16, broadcast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;

    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&address.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Answer discovery calls on `listen_port`, advertising `request_port`,
/// until cancelled. Responses to any single source are throttled.
pub async fn respond(listen_port: u16, request_port: u16, cancel: CancellationToken) -> Result<()> {
    let socket = udp_socket(listen_port, false)?;
    let response = {
        let mut bytes = RESPONSE_PREFIX.to_vec();
        bytes.extend_from_slice(request_port.to_string().as_bytes());
        bytes
    };

    debug!(listen_port, request_port, "discovery responder listening");

    let mut seen: HashMap<SocketAddr, Instant> = HashMap::new();
    let mut buffer = [0u8; 4096];

    loop {
        let (length, source) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "discovery receive error");
                    continue;
                }
            },
        };

        if trim_ascii(&buffer[..length]) != CALL {
            continue;
        }

        let now = Instant::now();
        if let Some(last) = seen.get(&source) {
            if now.duration_since(*last) < RESPONSE_THROTTLE {
                continue;
            }
        }

        if seen.len() > 1024 {
            seen.retain(|_, last| now.duration_since(*last) < RESPONSE_THROTTLE);
        }
        seen.insert(source, now);

        if let Err(err) = socket.send_to(&response, source).await {
            warn!(source = %source, error = %err, "discovery response failed");
        }
    }
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &data[start..end]
}

fn parse_response(data: &[u8]) -> Option<u16> {
    let trimmed = trim_ascii(data);
    let rest = trimmed.strip_prefix(RESPONSE_PREFIX)?;
    std::str::from_utf8(rest).ok()?.parse().ok()
}

/// Broadcast the call on `port` and collect `(address, request_port)` pairs.
///
/// With `wait` set the full collection window elapses before returning;
/// otherwise the search returns shortly after the first response. Registry
/// searches are seeded from the addresses remembered on disk, and any
/// registries found are remembered for next time.
pub async fn search(port: u16, wait: bool) -> Result<Vec<(IpAddr, u16)>> {
    let socket = udp_socket(0, true)?;

    if port == REGISTRY_PORT {
        for target in preload_registries().await {
            let targeted = (target.as_str(), port);
            if let Err(err) = socket.send_to(CALL, targeted).await {
                debug!(target = %target, error = %err, "targeted discovery send failed");
            }
        }
    }

    let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
    socket.send_to(CALL, broadcast).await?;

    let mut found: Vec<(IpAddr, u16)> = Vec::new();
    let mut deadline = Instant::now() + SEARCH_WINDOW;
    let mut buffer = [0u8; 4096];

    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await;
        let (length, source) = match received {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                warn!(error = %err, "discovery search receive error");
                continue;
            }
            Err(_) => break,
        };

        let Some(request_port) = parse_response(&buffer[..length]) else {
            continue;
        };

        let entry = (source.ip(), request_port);
        if !found.contains(&entry) {
            found.push(entry);
        }

        if !wait {
            let drain = Instant::now() + DRAIN_WINDOW;
            if drain < deadline {
                deadline = drain;
            }
        }
    }

    debug!(port, count = found.len(), "discovery search complete");

    if port == REGISTRY_PORT && !found.is_empty() {
        remember_registries(&found).await;
    }

    Ok(found)
}

/// Find authoritative daemons on the local network.
pub async fn search_direct() -> Result<Vec<(IpAddr, u16)>> {
    search(DAEMON_PORT, true).await
}

/// Find registries, fastest-first.
pub async fn search_registries() -> Result<Vec<(IpAddr, u16)>> {
    search(REGISTRY_PORT, false).await
}

fn parse_seed_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then(|| line.to_string())
        })
        .collect()
}

/// Addresses worth asking directly: the hand-maintained `registries` file
/// plus previously discovered entries in `registries.cache`.
async fn preload_registries() -> Vec<String> {
    let Ok(client) = home::client_dir() else {
        return Vec::new();
    };

    let mut seeds = Vec::new();
    for name in ["registries", "registries.cache"] {
        if let Ok(contents) = tokio::fs::read_to_string(client.join(name)).await {
            for seed in parse_seed_lines(&contents) {
                if !seeds.contains(&seed) {
                    seeds.push(seed);
                }
            }
        }
    }
    seeds
}

/// Fold newly found registries into `registries.cache`.
async fn remember_registries(found: &[(IpAddr, u16)]) {
    let Ok(client) = home::client_dir() else {
        return;
    };
    let path = client.join("registries.cache");

    let mut lines: Vec<String> = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => parse_seed_lines(&contents),
        Err(_) => Vec::new(),
    };

    for (address, _) in found {
        let address = address.to_string();
        if !lines.contains(&address) {
            lines.push(address);
        }
    }
    lines.sort();

    let mut contents = String::from("# This file is generated automatically.\n");
    for line in &lines {
        contents.push_str(line);
        contents.push('\n');
    }

    if let Err(err) = home::write_atomic(&path, contents.as_bytes()).await {
        debug!(error = %err, "could not update registry cache file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parsing() {
        assert_eq!(parse_response(b"on the X:10112"), Some(10112));
        assert_eq!(parse_response(b"  on the X:8080\n"), Some(8080));
        assert_eq!(parse_response(b"on the Y:10112"), None);
        assert_eq!(parse_response(b"on the X:notaport"), None);
        assert_eq!(parse_response(b""), None);
    }

    #[test]
    fn seed_lines_ignore_comments_and_blanks() {
        let contents = "# generated\nhost-a\n\nhost-b # trailing\n   \n";
        assert_eq!(parse_seed_lines(contents), vec!["host-a", "host-b"]);
    }

    #[tokio::test]
    #[ignore] // Binds real UDP ports; run with: cargo test -- --ignored
    async fn responder_answers_and_throttles() {
        let listen_port = 17311;
        let cancel = CancellationToken::new();
        let responder_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = respond(listen_port, 12345, responder_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let found = search(listen_port, false).await.unwrap();
        assert!(found.iter().any(|(_, port)| *port == 12345));

        cancel.cancel();
    }

    #[tokio::test]
    #[ignore] // Binds real UDP ports; run with: cargo test -- --ignored
    async fn two_responders_share_one_port() {
        let listen_port = 17313;
        let cancel = CancellationToken::new();
        for advertised in [11111, 22222] {
            let responder_cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = respond(listen_port, advertised, responder_cancel).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let found = search(listen_port, true).await.unwrap();
        let ports: Vec<u16> = found.iter().map(|(_, port)| *port).collect();
        assert!(ports.contains(&11111));
        assert!(ports.contains(&22222));

        cancel.cancel();
    }
}
