// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request/response transport over DEALER and ROUTER sockets.
//!
//! The client keeps a persistent DEALER connection per daemon and correlates
//! in-flight requests by identifier, so thousands of requests can be
//! outstanding at once. The server runs a ROUTER socket: every inbound
//! request is acknowledged before dispatch, handlers run as independent
//! tasks, and their responses are routed back by peer identity whenever
//! they complete.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tmq::{dealer, router, Context, Multipart};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{MktlError, Result};
use crate::payload::Payload;
use crate::transport::{bind_scan, local_hostname, REQUEST_PORTS};
use crate::wire::{frames_of, MessageType, Request, RequestId, Response};

/// How long a client waits for the ACK confirming a daemon is alive.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

struct PendingEntry {
    ack: Option<oneshot::Sender<()>>,
    rep: Option<oneshot::Sender<Response>>,
}

/// A request submitted but not yet answered. `wait` blocks for the REP;
/// `poll` checks without blocking. Dropping the handle abandons the request
/// locally; the daemon is never told.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Response>,
    done: Option<Response>,
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// True once the response has arrived.
    pub fn poll(&mut self) -> bool {
        if self.done.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(response) => {
                self.done = Some(response);
                true
            }
            Err(_) => false,
        }
    }

    /// Block until the REP arrives or `timeout` elapses.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Response> {
        if let Some(response) = self.done.take() {
            return Ok(response);
        }
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MktlError::Socket(
                "connection closed before a response arrived".to_string(),
            )),
            Err(_) => Err(MktlError::Timeout(format!(
                "request {} received no response in {:.2} sec",
                self.id,
                timeout.as_secs_f64()
            ))),
        }
    }
}

impl Response {
    /// Split a REP into payload and bulk, promoting a carried error object
    /// into a local error.
    pub fn payload_result(self) -> Result<(Payload, Option<Vec<u8>>)> {
        let payload = self.payload.unwrap_or_default().into_result()?;
        Ok((payload, self.bulk))
    }
}

/// Issue requests to one daemon over a DEALER socket and receive responses.
pub struct RequestClient {
    address: String,
    port: u16,
    ack_timeout: Duration,
    pending: Arc<DashMap<RequestId, PendingEntry>>,
    send_tx: mpsc::UnboundedSender<Multipart>,
    cancel: CancellationToken,
}

impl RequestClient {
    pub fn connect(context: &Context, address: &str, port: u16) -> Result<Self> {
        let endpoint = format!("tcp://{}:{}", address, port);

        let socket = dealer::dealer(context)
            .set_sndhwm(0)
            .set_rcvhwm(0)
            .connect(&endpoint)
            .map_err(|err| MktlError::Socket(format!("connect {} failed: {}", endpoint, err)))?;

        let (mut send_half, mut recv_half) = socket.split();
        let pending: Arc<DashMap<RequestId, PendingEntry>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Multipart>();

        let send_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    queued = send_rx.recv() => {
                        let Some(message) = queued else { break };
                        if let Err(err) = send_half.send(message).await {
                            error!(error = %err, "request send failed");
                            break;
                        }
                    }
                }
            }
        });

        let recv_pending = pending.clone();
        let recv_cancel = cancel.clone();
        let recv_endpoint = endpoint.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    incoming = recv_half.next() => {
                        match incoming {
                            Some(Ok(message)) => {
                                Self::dispatch(&recv_pending, &message);
                            }
                            Some(Err(err)) => {
                                error!(endpoint = %recv_endpoint, error = %err, "receive error");
                            }
                            None => {
                                warn!(endpoint = %recv_endpoint, "DEALER socket closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        debug!(endpoint = %endpoint, "request client connected");

        Ok(Self {
            address: address.to_string(),
            port,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            pending,
            send_tx,
            cancel,
        })
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route one inbound message to the pending request it answers.
    fn dispatch(pending: &DashMap<RequestId, PendingEntry>, message: &Multipart) {
        let frames = frames_of(message);

        let response = match Response::decode_frames(&frames) {
            Ok(response) => response,
            Err(err) => {
                // A malformed response still names an id in most failure
                // modes; fail that request rather than letting it hang.
                warn!(error = %err, "malformed response");
                if frames.len() >= 2 {
                    let id = RequestId::from_bytes(frames[1]);
                    if let Some((_, mut entry)) = pending.remove(&id) {
                        let failure = Response::rep(
                            id,
                            Some(Payload::of_error(&err)),
                            None,
                        );
                        if let Some(tx) = entry.ack.take() {
                            let _ = tx.send(());
                        }
                        if let Some(tx) = entry.rep.take() {
                            let _ = tx.send(failure);
                        }
                    }
                }
                return;
            }
        };

        match response.kind {
            MessageType::Ack => {
                if let Some(mut entry) = pending.get_mut(&response.id) {
                    if let Some(tx) = entry.ack.take() {
                        let _ = tx.send(());
                    }
                } else {
                    debug!(id = %response.id, "ACK for unknown request dropped");
                }
            }
            MessageType::Rep => {
                if let Some((_, mut entry)) = pending.remove(&response.id) {
                    // The daemon sends ACK before REP, but treat an
                    // unaccompanied REP as implicit acknowledgement.
                    if let Some(tx) = entry.ack.take() {
                        let _ = tx.send(());
                    }
                    if let Some(tx) = entry.rep.take() {
                        let _ = tx.send(response);
                    }
                } else {
                    debug!(id = %response.id, "REP for unknown request dropped");
                }
            }
            other => {
                warn!(kind = %other, "unexpected response type dropped");
            }
        }
    }

    /// Submit a request. Blocks until the daemon acknowledges receipt
    /// (bounded by the ack timeout), never until the full response; use the
    /// returned handle to wait for the REP.
    pub async fn send(&self, request: Request) -> Result<PendingReply> {
        let id = request.id.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (rep_tx, rep_rx) = oneshot::channel();

        self.pending.insert(
            id.clone(),
            PendingEntry {
                ack: Some(ack_tx),
                rep: Some(rep_tx),
            },
        );

        let encoded = request.encode()?;
        if self.send_tx.send(encoded).is_err() {
            self.pending.remove(&id);
            return Err(MktlError::Socket("request client is shut down".to_string()));
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(_) => Ok(PendingReply {
                id,
                rx: rep_rx,
                done: None,
            }),
            Err(_) => {
                self.pending.remove(&id);
                Err(MktlError::Timeout(format!(
                    "{} @ {}:{}: no response received in {:.2} sec",
                    request.kind,
                    self.address,
                    self.port,
                    self.ack_timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Submit a request and block until its REP arrives.
    pub async fn transact(&self, request: Request, timeout: Duration) -> Result<Response> {
        let mut pending = self.send(request).await?;
        pending.wait(timeout).await
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dispatch seam between the transport and the daemon or registry runtime.
/// The ACK has already been sent by the time `handle` runs; the returned
/// payload and bulk become the REP, and an error becomes an error payload.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<(Option<Payload>, Option<Vec<u8>>)>;
}

/// Receive requests on a ROUTER socket and answer them.
///
/// The hostname and port of a bound server are the daemon's identity in
/// provenance entries.
pub struct RequestServer {
    hostname: String,
    port: u16,
    socket: router::Router,
}

impl RequestServer {
    /// Bind on `preferred`, or the first free port in the request range.
    pub fn bind(
        context: &Context,
        preferred: Option<u16>,
        avoid: &HashSet<u16>,
    ) -> Result<Self> {
        let (socket, port) = bind_scan(preferred, avoid, REQUEST_PORTS, |trial| {
            router::router(context)
                .set_sndhwm(0)
                .set_rcvhwm(0)
                .bind(&format!("tcp://*:{}", trial))
        })?;

        let hostname = local_hostname();
        debug!(hostname = %hostname, port, "request server bound");

        Ok(Self {
            hostname,
            port,
            socket,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve requests until cancelled. Malformed frames are dropped with a
    /// log line; handler failures come back to the peer as error payloads.
    pub async fn serve(self, handler: Arc<dyn RequestHandler>, cancel: CancellationToken) {
        let (mut send_half, mut recv_half) = self.socket.split();

        // Responses funnel through one channel so handler tasks can finish
        // in any order while the socket stays owned by a single sender.
        let (reply_tx, mut reply_rx) = mpsc::channel::<Multipart>(1024);

        let send_cancel = cancel.clone();
        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    queued = reply_rx.recv() => {
                        let Some(message) = queued else { break };
                        if let Err(err) = send_half.send(message).await {
                            error!(error = %err, "response send failed");
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(port = self.port, "request server shutting down");
                    break;
                }
                incoming = recv_half.next() => {
                    match incoming {
                        Some(Ok(message)) => {
                            Self::accept(&handler, &reply_tx, &message).await;
                        }
                        Some(Err(err)) => {
                            error!(error = %err, "ROUTER receive error");
                        }
                        None => {
                            warn!("ROUTER socket closed");
                            break;
                        }
                    }
                }
            }
        }

        drop(reply_tx);
        let _ = sender.await;
    }

    async fn accept(
        handler: &Arc<dyn RequestHandler>,
        reply_tx: &mpsc::Sender<Multipart>,
        message: &Multipart,
    ) {
        let frames = frames_of(message);
        if frames.len() != 7 {
            warn!(parts = frames.len(), "request with wrong part count dropped");
            return;
        }

        let identity = frames[0].to_vec();
        let request = match Request::decode_frames(&frames[1..]) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "malformed request dropped");
                return;
            }
        };

        // ACK before any dispatch: this is how a client knows the daemon is
        // alive, independent of how long the handler takes.
        let ack = Response::ack(request.id.clone());
        match ack.encode_routed(&identity) {
            Ok(encoded) => {
                if reply_tx.send(encoded).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                error!(error = %err, "ACK encode failed");
                return;
            }
        }

        let handler = handler.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let outcome = handler.handle(request).await;

            let response = match outcome {
                Ok((payload, bulk)) => Response::rep(id, payload, bulk),
                Err(err) => {
                    debug!(id = %id, error = %err, "request handler failed");
                    Response::rep(id, Some(Payload::of_error(&err)), None)
                }
            };

            match response.encode_routed(&identity) {
                Ok(encoded) => {
                    let _ = reply_tx.send(encoded).await;
                }
                Err(err) => error!(error = %err, "REP encode failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: Request) -> Result<(Option<Payload>, Option<Vec<u8>>)> {
            match request.kind {
                MessageType::Get => Ok((
                    Some(Payload::of_value(json!(request.target), 1.0)),
                    None,
                )),
                MessageType::Set => Err(MktlError::Value("bad input".to_string())),
                _ => Err(MktlError::Value(format!(
                    "unhandled request type: {}",
                    request.kind
                ))),
            }
        }
    }

    #[tokio::test]
    #[ignore] // Binds real sockets; run with: cargo test -- --ignored
    async fn ack_then_rep_roundtrip() {
        let context = Context::new();
        let server = RequestServer::bind(&context, None, &HashSet::new()).unwrap();
        let port = server.port();

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            server.serve(Arc::new(EchoHandler), serve_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = RequestClient::connect(&context, "localhost", port).unwrap();

        let request = Request::new(MessageType::Get, "oven.TEMP", None);
        let response = client
            .transact(request, Duration::from_secs(2))
            .await
            .unwrap();
        let (payload, bulk) = response.payload_result().unwrap();
        assert_eq!(payload.value, Some(json!("oven.TEMP")));
        assert!(bulk.is_none());

        // Handler errors come back as error payloads, not dropped requests.
        let request = Request::new(MessageType::Set, "team.SCORE", None);
        let response = client
            .transact(request, Duration::from_secs(2))
            .await
            .unwrap();
        let err = response.payload_result().unwrap_err();
        assert!(matches!(err, MktlError::Value(_)));

        cancel.cancel();
    }

    #[tokio::test]
    async fn ack_timeout_raises_locally() {
        let context = Context::new();
        // Connect to a port nobody is listening on; ZeroMQ queues the send,
        // but no ACK will ever arrive.
        let client = RequestClient::connect(&context, "localhost", 13678)
            .unwrap()
            .with_ack_timeout(Duration::from_millis(50));

        let request = Request::new(MessageType::Get, "oven.TEMP", None);
        let err = client.send(request).await.unwrap_err();
        assert!(matches!(err, MktlError::Timeout(_)));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn pending_reply_polls_without_blocking() {
        let (tx, rx) = oneshot::channel();
        let mut pending = PendingReply {
            id: RequestId::from_bytes(b"0001"),
            rx,
            done: None,
        };

        assert!(!pending.poll());
        tx.send(Response::rep(RequestId::from_bytes(b"0001"), None, None))
            .unwrap();
        assert!(pending.poll());

        let response = pending.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(response.kind, MessageType::Rep);
    }
}
