// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The item/store runtime.
//!
//! A store is a namespace of items aggregated across one or more daemons.
//! On the daemon side items are authoritative: they own the current value
//! and run handlers on a per-item serial queue. On the client side items
//! are mirrors: a cached value kept fresh by subscription, with callbacks
//! fanned out in registration order.

pub mod authoritative;
pub mod item;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::config::ConfigBlock;
use crate::error::{MktlError, Result};
use crate::transport::publish::SubscribeClient;
use crate::wire::Topic;

pub use authoritative::{bundle_of, AuthoritativeItem, CachingHandler, ItemContext, ItemHandler};
pub use item::{CachedValue, Item};

/// A client-side store: the merged configuration for one namespace, plus
/// the mirror items instantiated so far and the reference-counted wire
/// subscriptions they share.
#[derive(Debug)]
pub struct Store {
    pub name: String,
    blocks: RwLock<HashMap<Uuid, ConfigBlock>>,
    items: DashMap<String, Arc<Item>>,
    /// `(pub endpoint, wire topic)` → refcount. The wire subscription is
    /// held while the count is positive and dropped when it returns to 0.
    topic_refs: Mutex<HashMap<(String, Vec<u8>), usize>>,
}

impl Store {
    pub fn new(name: impl Into<String>, blocks: HashMap<Uuid, ConfigBlock>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            blocks: RwLock::new(blocks),
            items: DashMap::new(),
            topic_refs: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the configuration after a refresh.
    pub fn update_blocks(&self, blocks: HashMap<Uuid, ConfigBlock>) {
        *self.blocks.write() = blocks;
    }

    /// The block whose items include `key`, if any.
    pub fn block_for_key(&self, key: &str) -> Option<ConfigBlock> {
        let blocks = self.blocks.read();
        blocks
            .values()
            .find(|block| block.items.contains_key(key))
            .cloned()
    }

    /// The stratum-0 origin of every block in the store.
    pub fn origins(&self) -> Vec<crate::config::Provenance> {
        self.blocks
            .read()
            .values()
            .filter_map(|block| block.authoritative_origin().cloned())
            .collect()
    }

    /// Every key in the store, across all blocks.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blocks
            .read()
            .values()
            .flat_map(|block| block.items.keys().cloned())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn cached_item(&self, key: &str) -> Option<Arc<Item>> {
        self.items.get(key).map(|item| item.value().clone())
    }

    pub fn insert_item(&self, item: Arc<Item>) {
        self.items.insert(item.key.clone(), item);
    }

    /// Add one reference to a topic subscription, issuing the wire
    /// subscription on the transition from zero.
    pub fn retain_topic(&self, subscriber: &Arc<SubscribeClient>, topic: &Topic) -> Result<()> {
        let endpoint = format!("{}:{}", subscriber.address(), subscriber.port());
        let wire = topic.wire();
        let mut refs = self.topic_refs.lock();

        let count = refs.entry((endpoint, wire)).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(topic = %topic, "subscribing");
            subscriber.subscribe(topic)?;
        }
        Ok(())
    }

    /// Drop one reference; the wire subscription is released when the
    /// count returns to zero.
    pub fn release_topic(&self, subscriber: &Arc<SubscribeClient>, topic: &Topic) -> Result<()> {
        let endpoint = format!("{}:{}", subscriber.address(), subscriber.port());
        let wire = topic.wire();
        let mut refs = self.topic_refs.lock();

        match refs.get_mut(&(endpoint.clone(), wire.clone())) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                refs.remove(&(endpoint, wire));
                debug!(topic = %topic, "unsubscribing");
                subscriber.unsubscribe(topic)
            }
            None => Err(MktlError::Value(format!(
                "topic {} was not subscribed",
                topic
            ))),
        }
    }
}
