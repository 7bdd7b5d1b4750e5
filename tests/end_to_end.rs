// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A live daemon exercised over real sockets: request dispatch, broadcast
//! delivery, and configuration service. Ignored by default because it
//! binds TCP and UDP ports; run with: cargo test -- --ignored

use std::time::Duration;

use mktl::payload::Payload;
use mktl::transport::publish::SubscribeClient;
use mktl::transport::request::RequestClient;
use mktl::wire::{MessageType, Request, Topic};
use mktl::{ConfigBlock, MktlError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn start_daemon(home: &std::path::Path) -> (mktl::Daemon, CancellationToken) {
    // The cache root is process-wide; every test in this binary shares it.
    mktl::home::set(home).unwrap();

    let descriptor = home.join("thermal.json");
    tokio::fs::write(
        &descriptor,
        serde_json::to_vec(&json!({
            "TEMP": {"type": "numeric", "units": "celsius"},
            "ENABLED": {"type": "boolean", "initial": true}
        }))
        .unwrap(),
    )
    .await
    .unwrap();

    let daemon = mktl::Daemon::builder("oven", "thermal")
        .configuration(&descriptor)
        .start()
        .await
        .unwrap();

    (daemon, CancellationToken::new())
}

#[tokio::test]
#[ignore]
async fn daemon_serves_the_full_request_surface() {
    let home = tempfile::tempdir().unwrap();
    let (daemon, cancel) = start_daemon(home.path()).await;

    let uuid = daemon.uuid();
    let request_port = daemon.request_port();
    let publish_port = daemon.publish_port();

    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        daemon.run(run_cancel).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let context = tmq::Context::new();
    let client = RequestClient::connect(&context, "localhost", request_port).unwrap();

    // Subscribe before setting so the broadcast is observable.
    let (subscriber, mut broadcasts) = SubscribeClient::connect("localhost", publish_port).unwrap();
    subscriber.subscribe(&Topic::plain("oven.TEMP")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // SET succeeds with an empty payload.
    let request = Request::new(
        MessageType::Set,
        "oven.TEMP",
        Some(Payload {
            value: Some(json!(77.2)),
            time: Some(1000.0),
            ..Payload::default()
        }),
    );
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    assert!(payload.is_empty());

    // The set was broadcast.
    let broadcast = tokio::time::timeout(Duration::from_secs(2), broadcasts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broadcast.topic, Topic::plain("oven.TEMP"));

    // GET returns the value just set, with its timestamp.
    let request = Request::new(MessageType::Get, "oven.TEMP", None);
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    assert_eq!(payload.value, Some(json!(77.2)));
    assert_eq!(payload.time, Some(1000.0));

    // A refreshed GET agrees after a successful SET.
    let request = Request::new(
        MessageType::Get,
        "oven.TEMP",
        Some(Payload {
            refresh: Some(true),
            ..Payload::default()
        }),
    );
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    assert_eq!(payload.value, Some(json!(77.2)));

    // The initial value for ENABLED was applied through the set path.
    let request = Request::new(MessageType::Get, "oven.ENABLED", None);
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    assert_eq!(payload.value, Some(json!(true)));

    // HASH names the store and UUID; CONFIG serves a parseable block with
    // stratum-0 provenance pointing back at the daemon.
    let request = Request::new(MessageType::Hash, "", None);
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    let hashes = payload.value.unwrap();
    let hash = hashes["oven"][&uuid.to_string()].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 32);

    let request = Request::new(MessageType::Config, "oven", None);
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let (payload, _) = response.payload_result().unwrap();
    let blocks = payload.value.unwrap();
    let block: ConfigBlock = serde_json::from_value(blocks[&uuid.to_string()].clone()).unwrap();
    assert_eq!(block.hash, hash);
    let origin = block.authoritative_origin().unwrap();
    assert_eq!(origin.req, request_port);
    assert_eq!(origin.publish, Some(publish_port));

    // Unknown keys are KeyErrors on the wire.
    let request = Request::new(MessageType::Get, "oven.MISSING", None);
    let response = client.transact(request, Duration::from_secs(5)).await.unwrap();
    let err = response.payload_result().unwrap_err();
    assert!(matches!(err, MktlError::Key(_)));

    cancel.cancel();
}
