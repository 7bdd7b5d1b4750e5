// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The registry broker: one per host.
//!
//! The registry caches configuration blocks from every local daemon and is
//! the first stop for clients. Blocks arrive two ways: daemons push CONFIG
//! at startup, and a periodic sweep of the daemon discovery port finds
//! anything that never announced. The cache itself (merging, loop
//! rejection, collision checks, the disk mirror) lives in
//! [`crate::config::cache`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigBlock, ConfigCache};
use crate::error::{MktlError, Result};
use crate::payload::{epoch_now, Payload};
use crate::transport::discover;
use crate::transport::request::{RequestClient, RequestHandler, RequestServer};
use crate::wire::{MessageType, Request};

/// How often the registry sweeps the daemon discovery port.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Daemons that miss this many consecutive sweeps are forgotten.
const SWEEP_STRIKES: u32 = 2;

/// Deadline for HASH and CONFIG pulls from discovered daemons.
const PULL_TIMEOUT: Duration = Duration::from_secs(10);

struct RegistryState {
    cache: Arc<ConfigCache>,
}

#[async_trait]
impl RequestHandler for RegistryState {
    async fn handle(&self, request: Request) -> Result<(Option<Payload>, Option<Vec<u8>>)> {
        match request.kind {
            MessageType::Hash => {
                let target = (!request.target.is_empty()).then_some(request.target.as_str());
                let hashes = self.cache.hashes(target)?;
                let value = serde_json::to_value(hashes)?;
                Ok((Some(Payload::of_value(value, epoch_now())), None))
            }
            MessageType::Config => {
                // A CONFIG carrying a payload is a push from a daemon; one
                // without is a client asking for the consolidated view.
                let pushed = request.payload.as_ref().and_then(|p| p.value.clone());
                match pushed {
                    Some(mapping) => {
                        self.accept_push(mapping).await?;
                        Ok((None, None))
                    }
                    None => {
                        if request.target.is_empty() {
                            return Err(MktlError::Value(
                                "CONFIG requests require a target".to_string(),
                            ));
                        }
                        let blocks = self.cache.blocks(&request.target)?;
                        let value = serde_json::to_value(blocks)?;
                        Ok((Some(Payload::of_value(value, epoch_now())), None))
                    }
                }
            }
            other => Err(MktlError::Value(format!(
                "unhandled request type: {}",
                other
            ))),
        }
    }
}

impl RegistryState {
    /// Merge a pushed `{uuid: block}` mapping. A key collision comes back
    /// to the pusher as the error; loops and stale blocks are quiet.
    async fn accept_push(&self, mapping: Value) -> Result<()> {
        let blocks: BTreeMap<String, ConfigBlock> = serde_json::from_value(mapping)
            .map_err(|err| MktlError::Value(format!("unparseable CONFIG push: {}", err)))?;

        for (_, block) in blocks {
            self.cache.admit(block).await?;
        }
        Ok(())
    }
}

/// A running registry broker.
pub struct Registry {
    state: Arc<RegistryState>,
    request: RequestServer,
}

impl Registry {
    pub async fn start() -> Result<Self> {
        let context = tmq::Context::new();
        let request = RequestServer::bind(&context, None, &Default::default())?;

        let cache = Arc::new(
            ConfigCache::new(request.hostname(), request.port()).with_default_persist_root()?,
        );
        cache.load().await?;

        info!(
            hostname = %request.hostname(),
            port = request.port(),
            "registry starting"
        );

        Ok(Self {
            state: Arc::new(RegistryState { cache }),
            request,
        })
    }

    pub fn port(&self) -> u16 {
        self.request.port()
    }

    pub fn cache(&self) -> Arc<ConfigCache> {
        self.state.cache.clone()
    }

    /// Serve until cancelled: configuration queries, discovery responses,
    /// and the periodic daemon sweep.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let request_port = self.request.port();

        let responder_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) =
                discover::respond(discover::REGISTRY_PORT, request_port, responder_cancel).await
            {
                warn!(error = %err, "discovery responder failed");
            }
        });

        let sweep_cache = self.state.cache.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut strikes: HashMap<(IpAddr, u16), u32> = HashMap::new();
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&sweep_cache, &mut strikes).await;
                    }
                }
            }
        });

        let handler: Arc<dyn RequestHandler> = self.state.clone();
        self.request.serve(handler, cancel).await;
        Ok(())
    }
}

/// One pass over the daemon discovery port: pull configuration from every
/// responder whose hashes we do not already hold, and strike out daemons
/// that have stopped answering.
async fn sweep(cache: &Arc<ConfigCache>, strikes: &mut HashMap<(IpAddr, u16), u32>) {
    let found = match discover::search_direct().await {
        Ok(found) => found,
        Err(err) => {
            warn!(error = %err, "daemon sweep failed");
            return;
        }
    };

    debug!(daemons = found.len(), "sweep complete");

    for entry in &found {
        strikes.insert(*entry, 0);
        let (address, port) = *entry;
        if let Err(err) = pull_configuration(cache, address, port).await {
            warn!(daemon = %address, port, error = %err, "configuration pull failed");
        }
    }

    strikes.retain(|entry, misses| {
        if found.contains(entry) {
            return true;
        }
        *misses += 1;
        if *misses >= SWEEP_STRIKES {
            info!(daemon = %entry.0, port = entry.1, "daemon forgotten after missed sweeps");
            false
        } else {
            true
        }
    });
}

/// Ask one daemon for its hashes, then fetch full blocks for any store
/// whose contents are new to the cache.
async fn pull_configuration(cache: &Arc<ConfigCache>, address: IpAddr, port: u16) -> Result<()> {
    let context = tmq::Context::new();
    let client = RequestClient::connect(&context, &address.to_string(), port)?;

    let request = Request::new(MessageType::Hash, "", None);
    let response = client.transact(request, PULL_TIMEOUT).await?;
    let (payload, _) = response.payload_result()?;

    let theirs: BTreeMap<String, BTreeMap<String, String>> = match payload.value {
        Some(value) => serde_json::from_value(value)
            .map_err(|err| MktlError::Protocol(format!("unparseable HASH response: {}", err)))?,
        None => return Ok(()),
    };

    let ours = cache.hashes(None)?;

    for (store, their_hashes) in theirs {
        let known = ours.get(&store);
        let fresh = their_hashes.iter().any(|(uuid, hash)| {
            known
                .and_then(|hashes| hashes.get(uuid))
                .map(|cached| cached != hash)
                .unwrap_or(true)
        });
        if !fresh {
            continue;
        }

        let request = Request::new(MessageType::Config, store.clone(), None);
        let response = client.transact(request, PULL_TIMEOUT).await?;
        let (payload, _) = response.payload_result()?;

        let Some(value) = payload.value else { continue };
        let blocks: BTreeMap<String, ConfigBlock> = serde_json::from_value(value)
            .map_err(|err| MktlError::Protocol(format!("unparseable CONFIG response: {}", err)))?;

        for (_, block) in blocks {
            if let Err(err) = cache.admit(block).await {
                warn!(store = %store, error = %err, "swept block rejected");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::block::{ItemDescriptor, ItemType, Items};
    use serde_json::json;
    use uuid::Uuid;

    fn state() -> RegistryState {
        RegistryState {
            cache: Arc::new(ConfigCache::new("registry-host", 10112)),
        }
    }

    fn block_with(store: &str, keys: &[&str], req: u16) -> ConfigBlock {
        let items: Items = keys
            .iter()
            .map(|key| (key.to_string(), ItemDescriptor::new(ItemType::Numeric)))
            .collect();
        let mut block = ConfigBlock::new(store, Uuid::new_v4(), items).unwrap();
        block.append_provenance("daemon-host", req, Some(req + 1));
        block
    }

    fn push_request(store: &str, block: &ConfigBlock) -> Request {
        let mapping = json!({ block.uuid.to_string(): serde_json::to_value(block).unwrap() });
        Request::new(
            MessageType::Config,
            store,
            Some(Payload {
                value: Some(mapping),
                ..Payload::default()
            }),
        )
    }

    #[tokio::test]
    async fn push_then_hash_then_config() {
        let state = state();
        let block = block_with("kpfguide", &["EXPOSURE"], 10200);

        let (payload, _) = state.handle(push_request("kpfguide", &block)).await.unwrap();
        assert!(payload.is_none());

        let request = Request::new(MessageType::Hash, "", None);
        let (payload, _) = state.handle(request).await.unwrap();
        let hashes = payload.unwrap().value.unwrap();
        assert_eq!(
            hashes["kpfguide"][&block.uuid.to_string()],
            json!(block.hash)
        );

        let request = Request::new(MessageType::Config, "kpfguide", None);
        let (payload, _) = state.handle(request).await.unwrap();
        let blocks = payload.unwrap().value.unwrap();
        let served: ConfigBlock =
            serde_json::from_value(blocks[&block.uuid.to_string()].clone()).unwrap();
        assert_eq!(served.hash, block.hash);
        // The registry appended its own provenance hop.
        assert_eq!(served.provenance.len(), 2);
    }

    #[tokio::test]
    async fn pushed_key_collision_is_an_error_and_not_cached() {
        let state = state();
        let first = block_with("pie", &["ANGLE"], 10200);
        let second = block_with("pie", &["ANGLE"], 10300);

        state.handle(push_request("pie", &first)).await.unwrap();
        let err = state
            .handle(push_request("pie", &second))
            .await
            .unwrap_err();
        assert!(matches!(err, MktlError::Key(_)));

        let blocks = state.cache.blocks("pie").unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks.contains_key(&first.uuid.to_string()));
    }

    #[tokio::test]
    async fn looped_push_is_quietly_accepted() {
        let state = state();
        let mut block = block_with("pie", &["ANGLE"], 10200);
        block.append_provenance("registry-host", 10112, None);

        // REP carries no error; the cache stays unchanged.
        let (payload, _) = state.handle(push_request("pie", &block)).await.unwrap();
        assert!(payload.is_none());
        assert!(state.cache.blocks("pie").is_err());
    }

    #[tokio::test]
    async fn get_and_set_are_not_served_here() {
        let state = state();
        let request = Request::new(MessageType::Get, "pie.ANGLE", None);
        let err = state.handle(request).await.unwrap_err();
        assert!(matches!(err, MktlError::Value(_)));
    }

    #[tokio::test]
    async fn hash_for_unknown_store_is_a_key_error() {
        let state = state();
        let request = Request::new(MessageType::Hash, "nope", None);
        assert!(matches!(
            state.handle(request).await.unwrap_err(),
            MktlError::Key(_)
        ));
    }
}
