// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration blocks: one daemon's contribution to a store.
//!
//! A block carries the item descriptors, the UUID identifying the
//! contribution, an authoritative timestamp, a content hash over the items
//! section, and the provenance chain of hosts that have relayed it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{MktlError, Result};
use crate::home;
use crate::payload::epoch_now;

/// The seven item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Boolean,
    Bulk,
    Numeric,
    #[serde(rename = "numeric-array")]
    NumericArray,
    Enumerated,
    Mask,
    String,
}

/// One item's description inside a block. Unknown fields round-trip
/// untouched so a relayed block hashes the same everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    #[serde(rename = "type")]
    pub kind: ItemType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// String representations keyed by integer-as-string, for enumerated,
    /// mask, and boolean items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enumerators: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gettable: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub settable: Option<bool>,

    /// Value applied through the normal set path at daemon startup, unless
    /// a persisted value overrides it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<serde_json::Value>,

    /// Polling cadence in seconds; zero or absent means no polling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<f64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ItemDescriptor {
    pub fn new(kind: ItemType) -> Self {
        Self {
            kind,
            units: None,
            description: None,
            enumerators: None,
            persist: None,
            gettable: None,
            settable: None,
            initial: None,
            poll: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn persist(&self) -> bool {
        self.persist.unwrap_or(false)
    }

    pub fn gettable(&self) -> bool {
        self.gettable.unwrap_or(true)
    }

    pub fn settable(&self) -> bool {
        self.settable.unwrap_or(true)
    }
}

/// One hop in a block's relay chain. Stratum 0 is the authoritative daemon;
/// each relay appends itself with the next stratum number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub stratum: u32,
    pub hostname: String,
    pub req: u16,
    #[serde(rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publish: Option<u16>,
}

/// The items mapping, keyed by uppercase KEY.
pub type Items = BTreeMap<String, ItemDescriptor>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBlock {
    /// The store this block contributes to, lowercase.
    pub name: String,
    pub uuid: Uuid,
    /// Authoritative timestamp, UNIX epoch seconds.
    pub time: f64,
    /// Content hash over `items`; see [`generate_hash`].
    pub hash: String,
    pub items: Items,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
}

impl ConfigBlock {
    /// Assemble a fresh authoritative block: hash and timestamp are
    /// computed, provenance starts empty.
    pub fn new(store: impl Into<String>, uuid: Uuid, items: Items) -> Result<Self> {
        let hash = generate_hash(&items)?;
        Ok(Self {
            name: store.into().to_lowercase(),
            uuid,
            time: epoch_now(),
            hash,
            items,
            provenance: Vec::new(),
        })
    }

    pub fn sort_provenance(&mut self) {
        self.provenance.sort_by_key(|entry| entry.stratum);
    }

    /// Append the next hop. Strata increase strictly from the origin, so
    /// the new entry takes `max(existing) + 1`, or 0 for the origin itself.
    pub fn append_provenance(&mut self, hostname: &str, req: u16, publish: Option<u16>) {
        self.sort_provenance();
        let stratum = self
            .provenance
            .last()
            .map(|entry| entry.stratum + 1)
            .unwrap_or(0);
        self.provenance.push(Provenance {
            stratum,
            hostname: hostname.to_string(),
            req,
            publish,
        });
    }

    /// Whether `(hostname, req)` already appears anywhere in the chain.
    /// The stratum is ignored; this is the loop check.
    pub fn contains_origin(&self, hostname: &str, req: u16) -> bool {
        self.provenance
            .iter()
            .any(|entry| entry.hostname == hostname && entry.req == req)
    }

    /// The stratum-0 entry, the daemon to contact for items in this block.
    pub fn authoritative_origin(&self) -> Option<&Provenance> {
        self.provenance.iter().find(|entry| entry.stratum == 0)
    }

    /// Recompute the hash over the current items. Matches the stored hash
    /// for any block whose items are unchanged.
    pub fn recompute_hash(&self) -> Result<String> {
        generate_hash(&self.items)
    }

    /// The cache file location for this block.
    pub fn cache_path(&self) -> Result<PathBuf> {
        Ok(home::client_cache(&self.name)?.join(format!("{}.json", self.uuid)))
    }

    /// Mirror this block to the client cache tree, atomically.
    pub async fn write_cache_file(&self) -> Result<()> {
        let path = self.cache_path()?;
        home::write_atomic(&path, &serde_json::to_vec(self)?).await
    }

    pub async fn read_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// The content hash over an items mapping: SHA-256 of the canonical JSON
/// serialization, truncated to 128 bits, rendered as 32 lowercase hex
/// digits.
///
/// Canonical form is pinned as: object keys in lexicographic order (the
/// natural order of the underlying sorted maps) and no insignificant
/// whitespace. The protocol fixes only the width; any party recomputing a
/// hash must use these exact rules.
pub fn generate_hash(items: &Items) -> Result<String> {
    let canonical = serde_json::to_string(items)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut rendered = String::with_capacity(32);
    for byte in &digest[..16] {
        rendered.push_str(&format!("{:02x}", byte));
    }
    Ok(rendered)
}

/// Uppercase every key, rejecting collisions created by case folding.
/// Key uniqueness is case-insensitive everywhere in a store.
pub fn normalize_keys(items: Items) -> Result<Items> {
    let mut normalized = Items::new();
    for (key, descriptor) in items {
        let upper = key.to_uppercase();
        if normalized.insert(upper.clone(), descriptor).is_some() {
            return Err(MktlError::Key(format!("duplicate key: {}", upper)));
        }
    }
    Ok(normalized)
}

/// Boolean items always carry enumerators; fill in the defaults when the
/// descriptor leaves them out. Only authoritative blocks are touched, and
/// only before hashing.
pub fn ensure_boolean_enumerators(items: &mut Items) {
    for descriptor in items.values_mut() {
        if descriptor.kind != ItemType::Boolean {
            continue;
        }
        let enumerators = descriptor.enumerators.get_or_insert_with(BTreeMap::new);
        enumerators
            .entry("0".to_string())
            .or_insert_with(|| "False".to_string());
        enumerators
            .entry("1".to_string())
            .or_insert_with(|| "True".to_string());
    }
}

/// Load a daemon's items descriptor and its UUID sidecar.
///
/// The descriptor file holds only the items mapping; the envelope is built
/// at load time. The sidecar is created on first run. When `supersede`
/// names a file, its contents replace the cached descriptor.
pub async fn load_daemon_descriptor(
    store: &str,
    name: &str,
    supersede: Option<&Path>,
) -> Result<(Items, Uuid)> {
    let directory = home::daemon_store(store)?;
    let descriptor_path = directory.join(format!("{}.json", name));
    let uuid_path = directory.join(format!("{}.uuid", name));

    if let Some(source) = supersede {
        let raw = tokio::fs::read(source).await?;
        // Parse before adopting, so a bad file never clobbers the cache.
        let _: Items = serde_json::from_slice(&raw)?;
        home::write_atomic(&descriptor_path, &raw).await?;
    }

    let raw = tokio::fs::read(&descriptor_path).await.map_err(|_| {
        MktlError::Value(format!(
            "no configuration for {} under {}",
            name,
            directory.display()
        ))
    })?;
    let items: Items = serde_json::from_slice(&raw)?;

    let uuid = match tokio::fs::read_to_string(&uuid_path).await {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MktlError::Value(format!("malformed UUID file: {}", uuid_path.display())))?,
        Err(_) => {
            let fresh = Uuid::new_v4();
            home::write_atomic(&uuid_path, fresh.to_string().as_bytes()).await?;
            fresh
        }
    };

    Ok((normalize_keys(items)?, uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_items() -> Items {
        let mut items = Items::new();
        let mut temp = ItemDescriptor::new(ItemType::Numeric);
        temp.units = Some(json!("celsius"));
        items.insert("TEMP".to_string(), temp);
        items.insert(
            "ENABLED".to_string(),
            ItemDescriptor::new(ItemType::Boolean),
        );
        items
    }

    #[test]
    fn hash_is_stable_and_32_hex() {
        let items = sample_items();
        let first = generate_hash(&items).unwrap();
        let second = generate_hash(&items).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_tracks_item_changes() {
        let mut items = sample_items();
        let before = generate_hash(&items).unwrap();
        items.get_mut("TEMP").unwrap().units = Some(json!("kelvin"));
        let after = generate_hash(&items).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn recompute_matches_stored_hash() {
        let block = ConfigBlock::new("oven", Uuid::new_v4(), sample_items()).unwrap();
        assert_eq!(block.recompute_hash().unwrap(), block.hash);
    }

    #[test]
    fn block_roundtrips_through_json() {
        let mut block = ConfigBlock::new("oven", Uuid::new_v4(), sample_items()).unwrap();
        block.append_provenance("summit", 10112, Some(10140));

        let raw = serde_json::to_vec(&block).unwrap();
        let back: ConfigBlock = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, block);

        // The wire spelling of the publish port is `pub`.
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("\"pub\":10140"));
    }

    #[test]
    fn unknown_descriptor_fields_survive_a_roundtrip() {
        let raw = json!({
            "type": "numeric",
            "units": "m/s",
            "format": "%.3f"
        });
        let descriptor: ItemDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(descriptor.extra.get("format"), Some(&json!("%.3f")));
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), raw);
    }

    #[test]
    fn provenance_strata_increase_from_origin() {
        let mut block = ConfigBlock::new("oven", Uuid::new_v4(), sample_items()).unwrap();
        block.append_provenance("daemon-host", 10112, Some(10140));
        block.append_provenance("registry-host", 10200, None);

        let strata: Vec<u32> = block.provenance.iter().map(|p| p.stratum).collect();
        assert_eq!(strata, vec![0, 1]);
        assert_eq!(block.authoritative_origin().unwrap().hostname, "daemon-host");
        assert!(block.contains_origin("registry-host", 10200));
        assert!(!block.contains_origin("registry-host", 10201));
    }

    #[test]
    fn normalize_keys_uppercases_and_rejects_collisions() {
        let mut items = Items::new();
        items.insert("temp".to_string(), ItemDescriptor::new(ItemType::Numeric));
        let normalized = normalize_keys(items).unwrap();
        assert!(normalized.contains_key("TEMP"));

        let mut items = Items::new();
        items.insert("temp".to_string(), ItemDescriptor::new(ItemType::Numeric));
        items.insert("TEMP".to_string(), ItemDescriptor::new(ItemType::Numeric));
        assert!(matches!(normalize_keys(items), Err(MktlError::Key(_))));
    }

    #[test]
    fn boolean_enumerators_are_filled_in() {
        let mut items = Items::new();
        items.insert(
            "ENABLED".to_string(),
            ItemDescriptor::new(ItemType::Boolean),
        );
        ensure_boolean_enumerators(&mut items);

        let enumerators = items["ENABLED"].enumerators.as_ref().unwrap();
        assert_eq!(enumerators["0"], "False");
        assert_eq!(enumerators["1"], "True");
    }
}
