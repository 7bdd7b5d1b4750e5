// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The client entry point: `get("store.KEY")` and everything behind it.
//!
//! A client resolves a qualified name to a mirror item by loading the
//! store's configuration (disk cache first, refreshed against the local
//! registry when the hashes disagree), selecting the block that owns the
//! key, and connecting to that block's stratum-0 daemon. Connections are
//! pooled per daemon and items are singletons per store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConfigBlock;
use crate::error::{MktlError, Result};
use crate::home;
use crate::store::{CachedValue, Item, Store};
use crate::transport::discover;
use crate::transport::publish::SubscribeClient;
use crate::transport::request::RequestClient;
use crate::wire::{Broadcast, BroadcastBody, MessageType, Request, Topic, TopicKind};

/// Deadline for HASH and CONFIG exchanges with the registry.
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

type Endpoint = (String, u16);

/// A process-wide mKTL client. One instance serves any number of stores;
/// `get` hands back singletons, so every caller naming the same item sees
/// the same mirror.
pub struct Client {
    context: tmq::Context,
    stores: DashMap<String, Arc<Store>>,
    requests: DashMap<Endpoint, Arc<RequestClient>>,
    subscribers: DashMap<Endpoint, Arc<SubscribeClient>>,
    /// `<store>.<KEY>` → mirror, for broadcast routing.
    routes: Arc<DashMap<String, Arc<Item>>>,
    registry: Mutex<Option<(IpAddr, u16)>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            context: tmq::Context::new(),
            stores: DashMap::new(),
            requests: DashMap::new(),
            subscribers: DashMap::new(),
            routes: Arc::new(DashMap::new()),
            registry: Mutex::new(None),
        }
    }

    /// Resolve `<store>.<KEY>` to its mirror item, loading configuration
    /// and opening connections as needed.
    pub async fn get(&self, name: &str) -> Result<Arc<Item>> {
        let (store_name, key) = name
            .split_once('.')
            .ok_or_else(|| MktlError::Value(format!("not a qualified item name: {}", name)))?;
        let store_name = store_name.to_lowercase();
        let key = key.to_uppercase();

        let store = self.store(&store_name).await?;

        if let Some(item) = store.cached_item(&key) {
            return Ok(item);
        }

        let block = store.block_for_key(&key).ok_or_else(|| {
            MktlError::Key(format!("'{}' does not contain the key '{}'", store_name, key))
        })?;

        let origin = block
            .authoritative_origin()
            .ok_or_else(|| MktlError::Value(format!("no provenance for {}", name)))?
            .clone();
        let publish_port = origin.publish.ok_or_else(|| {
            MktlError::Value(format!("no publish port advertised for {}", name))
        })?;

        let descriptor = block.items.get(&key).cloned().ok_or_else(|| {
            MktlError::Key(format!("'{}' does not contain the key '{}'", store_name, key))
        })?;

        let req = self.request_client(&origin.hostname, origin.req)?;
        let sub = self.subscriber(&origin.hostname, publish_port)?;

        let item = Item::spawn(&store, key, descriptor, req, sub);
        store.insert_item(item.clone());
        self.routes.insert(item.full_key.clone(), item.clone());

        Ok(item)
    }

    /// The configuration-backed store container for `name`, loading and
    /// refreshing configuration on first use.
    pub async fn store(&self, name: &str) -> Result<Arc<Store>> {
        let name = name.to_lowercase();
        if name.is_empty() {
            return Err(MktlError::Value("store name cannot be empty".to_string()));
        }

        if let Some(store) = self.stores.get(&name) {
            return Ok(store.value().clone());
        }

        let mut blocks = load_cached_blocks(&name).await;
        blocks = self.refresh_blocks(&name, blocks).await?;

        if blocks.is_empty() {
            return Err(MktlError::Value(format!(
                "no configuration available for '{}' (local or remote)",
                name
            )));
        }

        let store = Arc::new(Store::new(name.clone(), blocks));
        self.stores.insert(name, store.clone());
        Ok(store)
    }

    /// Compare the on-disk cache against the registry's hashes and fetch
    /// CONFIG when they disagree. With no registry on the network the disk
    /// cache stands as-is.
    async fn refresh_blocks(
        &self,
        store: &str,
        cached: HashMap<Uuid, ConfigBlock>,
    ) -> Result<HashMap<Uuid, ConfigBlock>> {
        let Some((address, port)) = self.locate_registry().await else {
            return Ok(cached);
        };

        let registry = self.request_client(&address.to_string(), port)?;

        let request = Request::new(MessageType::Hash, store, None);
        let response = match registry.transact(request, REGISTRY_TIMEOUT).await {
            Ok(response) => response,
            Err(err) => {
                debug!(registry = %address, error = %err, "registry stopped answering");
                self.registry.lock().take();
                return Ok(cached);
            }
        };

        let theirs: HashMap<String, HashMap<Uuid, String>> = match response.payload_result() {
            Ok((payload, _)) => match payload.value {
                Some(value) => serde_json::from_value(value)?,
                None => return Ok(cached),
            },
            Err(MktlError::Key(_)) => {
                // The registry has nothing for this store; the disk cache
                // is the best information available.
                return Ok(cached);
            }
            Err(err) => return Err(err),
        };

        let their_hashes = theirs.get(store).cloned().unwrap_or_default();
        let fresh = their_hashes.len() != cached.len()
            || their_hashes
                .iter()
                .any(|(uuid, hash)| cached.get(uuid).map(|b| &b.hash != hash).unwrap_or(true));

        if !fresh {
            return Ok(cached);
        }

        let request = Request::new(MessageType::Config, store, None);
        let response = registry.transact(request, REGISTRY_TIMEOUT).await?;
        let (payload, _) = response.payload_result()?;
        let Some(value) = payload.value else {
            return Ok(cached);
        };

        let fetched: HashMap<String, ConfigBlock> = serde_json::from_value(value)?;
        let mut blocks = HashMap::new();
        for (_, block) in fetched {
            block.write_cache_file().await?;
            blocks.insert(block.uuid, block);
        }

        // Tidy cache files for blocks the registry no longer serves.
        for uuid in cached.keys() {
            if !blocks.contains_key(uuid) {
                if let Ok(directory) = home::client_cache(store) {
                    let _ = tokio::fs::remove_file(directory.join(format!("{}.json", uuid))).await;
                }
            }
        }

        debug!(store = %store, blocks = blocks.len(), "configuration refreshed");
        Ok(blocks)
    }

    /// The local registry, discovered once and remembered until it stops
    /// answering.
    async fn locate_registry(&self) -> Option<(IpAddr, u16)> {
        if let Some(cached) = *self.registry.lock() {
            return Some(cached);
        }

        match discover::search_registries().await {
            Ok(found) => {
                let chosen = found.first().copied();
                if let Some(registry) = chosen {
                    *self.registry.lock() = Some(registry);
                } else {
                    debug!("no registry answered discovery");
                }
                chosen
            }
            Err(err) => {
                warn!(error = %err, "registry discovery failed");
                None
            }
        }
    }

    /// Subscribe to bundle broadcasts `bundle:<store>.<prefix>.` from every
    /// daemon contributing to the store. Elements are dispatched to their
    /// mirror items once the whole bundle has parsed, so items must be
    /// resolved with [`Client::get`] (and subscribed) to observe them.
    pub async fn subscribe_bundle(&self, store: &str, prefix: &str) -> Result<()> {
        let store = self.store(store).await?;
        let topic = Topic::bundle(format!("{}.{}", store.name, prefix));

        for origin in store.origins() {
            let Some(publish_port) = origin.publish else { continue };
            let subscriber = self.subscriber(&origin.hostname, publish_port)?;
            store.retain_topic(&subscriber, &topic)?;
        }
        Ok(())
    }

    fn request_client(&self, address: &str, port: u16) -> Result<Arc<RequestClient>> {
        match self.requests.entry((address.to_string(), port)) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let client = Arc::new(RequestClient::connect(&self.context, address, port)?);
                slot.insert(client.clone());
                Ok(client)
            }
        }
    }

    /// The pooled subscriber for one daemon's publish endpoint. The first
    /// connection starts the dispatch task that routes broadcasts to
    /// mirror items.
    fn subscriber(&self, address: &str, port: u16) -> Result<Arc<SubscribeClient>> {
        match self.subscribers.entry((address.to_string(), port)) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (subscriber, rx) = SubscribeClient::connect(address, port)?;
                let subscriber = Arc::new(subscriber);
                slot.insert(subscriber.clone());

                let routes = self.routes.clone();
                tokio::spawn(async move {
                    dispatch_broadcasts(routes, rx).await;
                });

                Ok(subscriber)
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Route broadcasts from one daemon connection to their mirror items.
/// Bundles dispatch per element, after the whole bundle has parsed.
async fn dispatch_broadcasts(
    routes: Arc<DashMap<String, Arc<Item>>>,
    mut rx: mpsc::UnboundedReceiver<Broadcast>,
) {
    while let Some(broadcast) = rx.recv().await {
        match broadcast.body {
            BroadcastBody::Single { payload, bulk } => {
                let Some(item) = routes.get(&broadcast.topic.name) else {
                    continue;
                };
                item.enqueue_update(CachedValue {
                    payload: payload.unwrap_or_default(),
                    bulk,
                });
            }
            BroadcastBody::Bundle { elements } => {
                debug_assert_eq!(broadcast.topic.kind, TopicKind::Bundle);
                let Some((store, _)) = broadcast.topic.name.split_once('.') else {
                    continue;
                };
                for element in elements {
                    let Some(key) = &element.key else { continue };
                    let full_key = format!("{}.{}", store, key);
                    if let Some(item) = routes.get(&full_key) {
                        item.enqueue_update(CachedValue {
                            payload: element,
                            bulk: None,
                        });
                    }
                }
            }
        }
    }
}

/// Read every cached block for a store from disk.
async fn load_cached_blocks(store: &str) -> HashMap<Uuid, ConfigBlock> {
    let mut blocks = HashMap::new();
    let Ok(directory) = home::client_cache(store) else {
        return blocks;
    };
    let Ok(mut entries) = tokio::fs::read_dir(&directory).await else {
        return blocks;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        match ConfigBlock::read_file(&path).await {
            Ok(block) => {
                blocks.insert(block.uuid, block);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache file skipped");
            }
        }
    }

    blocks
}
