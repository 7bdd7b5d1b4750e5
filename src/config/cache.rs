// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The registry-side configuration cache.
//!
//! Blocks arrive from authoritative daemons, by CONFIG push or discovery
//! sweep. Admission normalizes the block, rejects anything that originated
//! here (a relay loop), reconciles by UUID and timestamp, enforces that key
//! sets stay disjoint across a store, and mirrors the accepted block to
//! disk. Admissions are mutually exclusive per store; readers snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::block::{normalize_keys, ConfigBlock};
use crate::error::{MktlError, Result};
use crate::home;

/// The outcome of offering a block to the cache. Only a key collision is an
/// error; every other outcome is a quiet success for the pushing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New or superseding block, now cached and persisted.
    Accepted,
    /// Same UUID, same hash: nothing to do, no provenance appended.
    Unchanged,
    /// Same UUID but an older timestamp than the cached block; dropped.
    Stale,
    /// The provenance chain already contains this process; dropped without
    /// complaint, since the block originated here.
    Loop,
}

struct StoreEntry {
    /// Serializes admissions (including their disk writes) for one store.
    admission: Mutex<()>,
    blocks: RwLock<HashMap<Uuid, ConfigBlock>>,
}

impl StoreEntry {
    fn new() -> Self {
        Self {
            admission: Mutex::new(()),
            blocks: RwLock::new(HashMap::new()),
        }
    }
}

pub struct ConfigCache {
    /// `(hostname, req)` identities of this process, for loop checks.
    identity: HashSet<(String, u16)>,
    /// Provenance appended to each accepted block.
    hostname: String,
    req: u16,
    stores: RwLock<HashMap<String, Arc<StoreEntry>>>,
    /// Mirror root; blocks land at `<root>/<store>/<uuid>.json`. `None`
    /// disables the disk mirror.
    persist_root: Option<PathBuf>,
}

impl ConfigCache {
    /// A cache identified by the owning process's request endpoint.
    pub fn new(hostname: impl Into<String>, req: u16) -> Self {
        let hostname = hostname.into();
        Self {
            identity: [(hostname.clone(), req)].into_iter().collect(),
            hostname,
            req,
            stores: RwLock::new(HashMap::new()),
            persist_root: None,
        }
    }

    /// Mirror accepted blocks under `root/<store>/<uuid>.json`.
    pub fn with_persist_root(mut self, root: PathBuf) -> Self {
        self.persist_root = Some(root);
        self
    }

    /// The standard mirror location, `client/cache` under the mKTL home.
    pub fn with_default_persist_root(self) -> Result<Self> {
        let root = home::client_dir()?.join("cache");
        Ok(self.with_persist_root(root))
    }

    fn entry(&self, store: &str) -> Arc<StoreEntry> {
        if let Some(entry) = self.stores.read().get(store) {
            return entry.clone();
        }
        self.stores
            .write()
            .entry(store.to_string())
            .or_insert_with(|| Arc::new(StoreEntry::new()))
            .clone()
    }

    /// Offer one block to the cache. See [`Admission`] for the outcomes; a
    /// key collision raises `KeyError` and caches nothing.
    pub async fn admit(&self, mut block: ConfigBlock) -> Result<Admission> {
        block.name = block.name.to_lowercase();
        block.sort_provenance();
        block.items = normalize_keys(std::mem::take(&mut block.items))?;

        for (hostname, req) in &self.identity {
            if block.contains_origin(hostname, *req) {
                debug!(store = %block.name, uuid = %block.uuid, "looped block ignored");
                return Ok(Admission::Loop);
            }
        }

        let entry = self.entry(&block.name);
        let _admission = entry.admission.lock().await;

        {
            let blocks = entry.blocks.read();

            if let Some(known) = blocks.get(&block.uuid) {
                if known.hash == block.hash {
                    return Ok(Admission::Unchanged);
                }
                if known.time > block.time {
                    debug!(
                        store = %block.name,
                        uuid = %block.uuid,
                        "older block dropped"
                    );
                    return Ok(Admission::Stale);
                }
            }

            // Keys must stay disjoint against every *other* UUID's keys.
            for (uuid, known) in blocks.iter() {
                if *uuid == block.uuid {
                    continue;
                }
                for key in block.items.keys() {
                    if known.items.contains_key(key) {
                        warn!(
                            store = %block.name,
                            uuid = %block.uuid,
                            conflicting = %uuid,
                            key = %key,
                            "key collision, block rejected"
                        );
                        return Err(MktlError::Key(format!(
                            "duplicate key {} in store {}",
                            key, block.name
                        )));
                    }
                }
            }
        }

        block.append_provenance(&self.hostname, self.req, None);

        if let Some(root) = &self.persist_root {
            let path = root
                .join(&block.name)
                .join(format!("{}.json", block.uuid));
            home::write_atomic(&path, &serde_json::to_vec(&block)?).await?;
        }

        info!(
            store = %block.name,
            uuid = %block.uuid,
            hash = %block.hash,
            keys = block.items.len(),
            "configuration block cached"
        );

        entry.blocks.write().insert(block.uuid, block);
        Ok(Admission::Accepted)
    }

    /// Hashes for one store, or for every store when `store` is `None`.
    /// Asking for a specific unknown store is a `KeyError`.
    pub fn hashes(&self, store: Option<&str>) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let mut result = BTreeMap::new();

        match store {
            Some(store) => {
                let store = store.to_lowercase();
                result.insert(store.clone(), self.store_hashes(&store)?);
            }
            None => {
                let names: Vec<String> = self.stores.read().keys().cloned().collect();
                for name in names {
                    if let Ok(hashes) = self.store_hashes(&name) {
                        if !hashes.is_empty() {
                            result.insert(name, hashes);
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    fn store_hashes(&self, store: &str) -> Result<BTreeMap<String, String>> {
        let entry = self
            .stores
            .read()
            .get(store)
            .cloned()
            .ok_or_else(|| MktlError::Key(format!("no configuration for store {}", store)))?;

        let blocks = entry.blocks.read();
        if blocks.is_empty() {
            return Err(MktlError::Key(format!("no configuration for store {}", store)));
        }
        Ok(blocks
            .iter()
            .map(|(uuid, block)| (uuid.to_string(), block.hash.clone()))
            .collect())
    }

    /// Every cached block for a store, keyed by UUID.
    pub fn blocks(&self, store: &str) -> Result<BTreeMap<String, ConfigBlock>> {
        let store = store.to_lowercase();
        let entry = self
            .stores
            .read()
            .get(&store)
            .cloned()
            .ok_or_else(|| MktlError::Key(format!("no configuration for store {}", store)))?;

        let blocks = entry.blocks.read();
        if blocks.is_empty() {
            return Err(MktlError::Key(format!("no configuration for store {}", store)));
        }
        Ok(blocks
            .iter()
            .map(|(uuid, block)| (uuid.to_string(), block.clone()))
            .collect())
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Read the disk mirror back into memory. Blocks were admitted before
    /// they were written, so they are restored verbatim, without another
    /// admission pass (their provenance already names this process).
    pub async fn load(&self) -> Result<usize> {
        let Some(root) = self.persist_root.clone() else {
            return Ok(0);
        };

        let mut loaded = 0;
        let mut stores = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        while let Some(store_dir) = stores.next_entry().await? {
            if !store_dir.path().is_dir() {
                continue;
            }
            let store = store_dir.file_name().to_string_lossy().to_string();
            let entry = self.entry(&store);

            let mut files = tokio::fs::read_dir(store_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().map(|e| e != "json").unwrap_or(true) {
                    continue;
                }
                match ConfigBlock::read_file(&path).await {
                    Ok(block) => {
                        entry.blocks.write().insert(block.uuid, block);
                        loaded += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "unreadable cache file skipped");
                    }
                }
            }
        }

        if loaded > 0 {
            info!(blocks = loaded, "configuration cache restored from disk");
        }
        Ok(loaded)
    }
}
