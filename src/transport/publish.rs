// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Publish/subscribe transport over PUB and SUB sockets.
//!
//! Publication is fire-and-forget: ZeroMQ filters by topic prefix on the
//! sending side and slow subscribers lose messages rather than exerting
//! backpressure. Subscriptions change at runtime, and a ZeroMQ socket must
//! stay on the thread that owns it, so the SUB socket lives on a dedicated
//! thread driven by a PAIR control socket; received broadcasts are handed
//! to the async side through an unbounded channel.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::SinkExt;
use parking_lot::Mutex;
use tmq::publish;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{MktlError, Result};
use crate::transport::{bind_scan, PUBLISH_PORTS};
use crate::wire::{Broadcast, Topic};

/// Broadcast value changes from one daemon over a PUB socket.
pub struct PublishServer {
    port: u16,
    socket: tokio::sync::Mutex<publish::Publish>,
}

impl PublishServer {
    /// Bind on `preferred`, or the first free port in the publish range.
    pub fn bind(
        context: &tmq::Context,
        preferred: Option<u16>,
        avoid: &std::collections::HashSet<u16>,
    ) -> Result<Self> {
        let (socket, port) = bind_scan(preferred, avoid, PUBLISH_PORTS, |trial| {
            publish::publish(context)
                .set_sndhwm(0)
                .bind(&format!("tcp://*:{}", trial))
        })?;

        debug!(port, "publish server bound");

        Ok(Self {
            port,
            socket: tokio::sync::Mutex::new(socket),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one broadcast. The lock serializes concurrent publishers so
    /// multipart frames from different tasks never interleave.
    pub async fn publish(&self, broadcast: &Broadcast) -> Result<()> {
        let encoded = broadcast.encode()?;
        let mut socket = self.socket.lock().await;
        socket
            .send(encoded)
            .await
            .map_err(|err| MktlError::Socket(format!("publish failed: {}", err)))
    }
}

static SUB_COUNTER: AtomicUsize = AtomicUsize::new(0);

enum Control {
    Subscribe(Vec<u8>),
    Unsubscribe(Vec<u8>),
    Stop,
}

impl Control {
    fn frames(&self) -> Vec<&[u8]> {
        match self {
            Self::Subscribe(topic) => vec![b"SUB", topic],
            Self::Unsubscribe(topic) => vec![b"UNSUB", topic],
            Self::Stop => vec![b"STOP", b""],
        }
    }
}

/// Receive broadcasts from one daemon over a SUB socket.
///
/// Decoded broadcasts arrive on the channel returned by [`connect`]; the
/// consumer is responsible for routing them to items.
///
/// [`connect`]: SubscribeClient::connect
pub struct SubscribeClient {
    address: String,
    port: u16,
    control: Mutex<zmq::Socket>,
}

impl SubscribeClient {
    pub fn connect(address: &str, port: u16) -> Result<(Self, mpsc::UnboundedReceiver<Broadcast>)> {
        let context = zmq::Context::new();
        let endpoint = format!("tcp://{}:{}", address, port);
        let internal = format!(
            "inproc://mktl.subscribe.{}",
            SUB_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        // inproc endpoints must be bound before they are connected, so the
        // control socket is set up here and its peer inside the thread.
        let control = context.socket(zmq::PAIR)?;
        control.bind(&internal)?;

        let (tx, rx) = mpsc::unbounded_channel();

        let thread_context = context;
        let thread_endpoint = endpoint.clone();
        std::thread::Builder::new()
            .name(format!("mktl-sub-{}:{}", address, port))
            .spawn(move || {
                if let Err(err) = run_subscriber(&thread_context, &thread_endpoint, &internal, tx) {
                    warn!(endpoint = %thread_endpoint, error = %err, "subscriber thread exited");
                }
            })
            .map_err(|err| MktlError::Socket(format!("subscriber thread spawn failed: {}", err)))?;

        debug!(endpoint = %endpoint, "subscribe client connected");

        Ok((
            Self {
                address: address.to_string(),
                port,
                control: Mutex::new(control),
            },
            rx,
        ))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn send_control(&self, command: Control) -> Result<()> {
        let control = self.control.lock();
        let frames = command.frames();
        control.send_multipart(frames, 0)?;
        Ok(())
    }

    /// Add a topic to the wire subscription. Filtering happens on the
    /// publishing side from this point on.
    pub fn subscribe(&self, topic: &Topic) -> Result<()> {
        self.send_control(Control::Subscribe(topic.wire()))
    }

    pub fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.send_control(Control::Unsubscribe(topic.wire()))
    }
}

impl Drop for SubscribeClient {
    fn drop(&mut self) {
        let _ = self.send_control(Control::Stop);
    }
}

/// The subscriber thread body: one SUB socket plus the control PAIR peer,
/// multiplexed with a blocking poll.
fn run_subscriber(
    context: &zmq::Context,
    endpoint: &str,
    internal: &str,
    tx: mpsc::UnboundedSender<Broadcast>,
) -> Result<()> {
    let control = context.socket(zmq::PAIR)?;
    control.connect(internal)?;

    let socket = context.socket(zmq::SUB)?;
    socket.set_rcvhwm(0)?;
    socket.connect(endpoint)?;

    loop {
        let mut poll_items = [
            socket.as_poll_item(zmq::POLLIN),
            control.as_poll_item(zmq::POLLIN),
        ];
        zmq::poll(&mut poll_items, 1000)?;

        if poll_items[1].is_readable() {
            let frames = control.recv_multipart(0)?;
            if frames.len() != 2 {
                continue;
            }
            match frames[0].as_slice() {
                b"SUB" => socket.set_subscribe(&frames[1])?,
                b"UNSUB" => socket.set_unsubscribe(&frames[1])?,
                b"STOP" => return Ok(()),
                other => {
                    warn!(
                        command = %String::from_utf8_lossy(other),
                        "unknown subscriber control command"
                    );
                }
            }
        }

        if poll_items[0].is_readable() {
            let frames = socket.recv_multipart(0)?;
            let borrowed: Vec<&[u8]> = frames.iter().map(|frame| frame.as_slice()).collect();

            match Broadcast::decode_frames(&borrowed) {
                Ok(broadcast) => {
                    if tx.send(broadcast).is_err() {
                        // Receiver is gone; nothing left to deliver to.
                        return Ok(());
                    }
                }
                Err(err) => {
                    debug!(error = %err, "undecodable broadcast dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    #[tokio::test]
    #[ignore] // Binds real sockets; run with: cargo test -- --ignored
    async fn broadcast_reaches_subscriber() {
        let context = tmq::Context::new();
        let server = PublishServer::bind(&context, None, &HashSet::new()).unwrap();

        let (client, mut rx) = SubscribeClient::connect("localhost", server.port()).unwrap();
        client.subscribe(&Topic::plain("metal.GOLD")).unwrap();

        // Give the subscription time to propagate to the PUB side.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let broadcast = Broadcast::single(
            Topic::plain("metal.GOLD"),
            Payload::of_value(json!(2450.17), 1_725_000_000.0),
            None,
        );
        server.publish(&broadcast).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, broadcast);
    }

    #[tokio::test]
    #[ignore] // Binds real sockets; run with: cargo test -- --ignored
    async fn subscription_does_not_alias_by_prefix() {
        let context = tmq::Context::new();
        let server = PublishServer::bind(&context, None, &HashSet::new()).unwrap();

        let (client, mut rx) = SubscribeClient::connect("localhost", server.port()).unwrap();
        client.subscribe(&Topic::plain("foo.BAR")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let unwanted = Broadcast::single(
            Topic::plain("foo.BARBAZ"),
            Payload::of_value(json!(1), 1.0),
            None,
        );
        let wanted = Broadcast::single(
            Topic::plain("foo.BAR"),
            Payload::of_value(json!(2), 2.0),
            None,
        );
        server.publish(&unwanted).await.unwrap();
        server.publish(&wanted).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, wanted);
    }
}
