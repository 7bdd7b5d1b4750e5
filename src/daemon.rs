// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Daemon assembly: everything between an items descriptor on disk and a
//! running, discoverable, authoritative mKTL daemon.
//!
//! Startup loads the descriptor and UUID, rebinds remembered ports where
//! possible, builds the configuration block with stratum-0 provenance,
//! spawns the authoritative items, restores persistent values, and then
//! goes on the air: request dispatch, discovery responses, and a CONFIG
//! push to every local registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::block::{
    ensure_boolean_enumerators, load_daemon_descriptor, ConfigBlock, ItemDescriptor, ItemType,
};
use crate::error::{MktlError, Result};
use crate::home;
use crate::payload::{epoch_now, Payload};
use crate::store::authoritative::{
    AuthoritativeItem, CachingHandler, ItemContext, ItemHandler, PersistRecord,
};
use crate::store::item::CachedValue;
use crate::transport::discover;
use crate::transport::publish::PublishServer;
use crate::transport::request::{RequestClient, RequestHandler, RequestServer};
use crate::wire::{MessageType, Request};

/// How often the persistence sink flushes queued values to disk.
const PERSIST_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline for the is-anyone-already-running probe at startup.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for CONFIG pushes to registries during announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configure and start a [`Daemon`]. Handlers registered by key override
/// the default caching behavior for those items.
pub struct DaemonBuilder {
    store: String,
    identifier: String,
    configuration: Option<PathBuf>,
    handlers: HashMap<String, Arc<dyn ItemHandler>>,
}

impl DaemonBuilder {
    pub fn new(store: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            store: store.into().to_lowercase(),
            identifier: identifier.into().to_lowercase(),
            configuration: None,
            handlers: HashMap::new(),
        }
    }

    /// Load the items descriptor from `path`, superseding any cached copy.
    pub fn configuration(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration = Some(path.into());
        self
    }

    /// Attach a custom handler to one item.
    pub fn handler(mut self, key: impl Into<String>, handler: Arc<dyn ItemHandler>) -> Self {
        self.handlers.insert(key.into().to_uppercase(), handler);
        self
    }

    pub async fn start(self) -> Result<Daemon> {
        Daemon::start(self).await
    }
}

/// The request dispatch state shared between the transport and the items.
struct DaemonState {
    store: String,
    uuid: Uuid,
    block: parking_lot::RwLock<ConfigBlock>,
    items: HashMap<String, Arc<AuthoritativeItem>>,
}

impl DaemonState {
    fn item(&self, target: &str) -> Result<Arc<AuthoritativeItem>> {
        let (store, key) = target
            .split_once('.')
            .ok_or_else(|| MktlError::Value(format!("malformed item target: {}", target)))?;

        if store.to_lowercase() != self.store {
            return Err(MktlError::Value(format!(
                "this request is for {}, but this daemon is in {}",
                store, self.store
            )));
        }

        let key = key.to_uppercase();
        self.items
            .get(&key)
            .cloned()
            .ok_or_else(|| MktlError::Key(format!("this daemon does not contain {}", key)))
    }

    fn hashes(&self, target: &str) -> Result<Value> {
        if !target.is_empty() && target.to_lowercase() != self.store {
            return Err(MktlError::Key(format!("no configuration for store {}", target)));
        }
        let block = self.block.read();
        Ok(json!({ self.store.clone(): { self.uuid.to_string(): block.hash.clone() } }))
    }

    fn config(&self, target: &str) -> Result<Value> {
        if target.is_empty() {
            return Err(MktlError::Value("CONFIG requests require a target".to_string()));
        }
        if target.to_lowercase() != self.store {
            return Err(MktlError::Key(format!("no configuration for store {}", target)));
        }
        let block = self.block.read();
        let mut mapping = BTreeMap::new();
        mapping.insert(self.uuid.to_string(), serde_json::to_value(&*block)?);
        Ok(serde_json::to_value(mapping)?)
    }
}

#[async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Result<(Option<Payload>, Option<Vec<u8>>)> {
        match request.kind {
            MessageType::Get => {
                let item = self.item(&request.target)?;
                if !item.descriptor().gettable() {
                    return Err(MktlError::Value(format!(
                        "{} is not gettable",
                        item.full_key()
                    )));
                }
                let refresh = request
                    .payload
                    .as_ref()
                    .map(Payload::refresh_requested)
                    .unwrap_or(false);
                let value = item.get(refresh).await?;
                Ok((Some(value.payload), value.bulk))
            }
            MessageType::Set => {
                let item = self.item(&request.target)?;
                let payload = request
                    .payload
                    .ok_or_else(|| MktlError::Value("SET requests require a payload".to_string()))?;
                item.set(CachedValue {
                    payload,
                    bulk: request.bulk,
                })
                .await?;
                Ok((None, None))
            }
            MessageType::Hash => {
                let value = self.hashes(&request.target)?;
                Ok((Some(Payload::of_value(value, epoch_now())), None))
            }
            MessageType::Config => {
                let value = self.config(&request.target)?;
                Ok((Some(Payload::of_value(value, epoch_now())), None))
            }
            other => Err(MktlError::Value(format!("unhandled request type: {}", other))),
        }
    }
}

/// A running authoritative daemon.
pub struct Daemon {
    state: Arc<DaemonState>,
    request: RequestServer,
    publish: Arc<PublishServer>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn builder(store: impl Into<String>, identifier: impl Into<String>) -> DaemonBuilder {
        DaemonBuilder::new(store, identifier)
    }

    async fn start(builder: DaemonBuilder) -> Result<Self> {
        let store = builder.store.clone();
        let identifier = builder.identifier.clone();

        let (mut items, uuid) =
            load_daemon_descriptor(&store, &identifier, builder.configuration.as_deref()).await?;

        add_builtin_items(&mut items, &identifier);
        ensure_boolean_enumerators(&mut items);

        // Re-use the ports from the previous incarnation when they are
        // still free; provenance stays stable across restarts that way.
        let (remembered_req, remembered_pub) = load_ports(&store, &uuid).await;
        let avoid = used_ports().await;

        if let Some(port) = remembered_req {
            probe_running_instance(&store, &uuid, port).await?;
        }

        let context = tmq::Context::new();

        let publish = match PublishServer::bind(&context, remembered_pub, &avoid) {
            Ok(publish) => publish,
            Err(_) => PublishServer::bind(&context, None, &avoid)?,
        };
        let request = match RequestServer::bind(&context, remembered_req, &avoid) {
            Ok(request) => request,
            Err(_) => RequestServer::bind(&context, None, &avoid)?,
        };

        save_ports(&store, &uuid, request.port(), publish.port()).await?;

        let mut block = ConfigBlock::new(store.clone(), uuid, items)?;
        block.append_provenance(request.hostname(), request.port(), Some(publish.port()));

        info!(
            store = %store,
            uuid = %uuid,
            req = request.port(),
            publish = publish.port(),
            "daemon starting"
        );

        let publish = Arc::new(publish);
        let cancel = CancellationToken::new();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let mut spawned = HashMap::new();
        for (key, descriptor) in block.items.clone() {
            let handler: Arc<dyn ItemHandler> = match builder.handlers.get(&key) {
                Some(handler) => handler.clone(),
                None if key == format!("{}CLK", identifier.to_uppercase()) => {
                    Arc::new(UptimeHandler { started: Instant::now() })
                }
                None => Arc::new(CachingHandler),
            };

            let item = AuthoritativeItem::spawn(
                &store,
                key.clone(),
                descriptor,
                handler,
                publish.clone(),
                Some(persist_tx.clone()),
                cancel.clone(),
            );
            spawned.insert(key, item);
        }

        apply_initial_values(&block, &spawned).await;
        let restored = restore_persistent(&uuid, &spawned).await;
        if restored > 0 {
            info!(count = restored, "persistent values restored");
        }

        spawn_persist_sink(uuid, persist_rx, cancel.clone());

        let state = Arc::new(DaemonState {
            store,
            uuid,
            block: parking_lot::RwLock::new(block),
            items: spawned,
        });

        Ok(Self {
            state,
            request,
            publish,
            cancel,
        })
    }

    pub fn store(&self) -> &str {
        &self.state.store
    }

    pub fn uuid(&self) -> Uuid {
        self.state.uuid
    }

    pub fn request_port(&self) -> u16 {
        self.request.port()
    }

    pub fn publish_port(&self) -> u16 {
        self.publish.port()
    }

    /// The daemon's publish endpoint, for handlers that emit broadcasts of
    /// their own, bundles included. Clone before calling [`Daemon::run`].
    pub fn publisher(&self) -> Arc<PublishServer> {
        self.publish.clone()
    }

    /// Serve until `cancel` fires: request dispatch, discovery responses,
    /// and the initial announcement to local registries.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let request_port = self.request.port();

        let serve_state: Arc<dyn RequestHandler> = self.state.clone();
        let serve_cancel = cancel.clone();
        let server = self.request;
        let serving = tokio::spawn(async move {
            server.serve(serve_state, serve_cancel).await;
        });

        let responder_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) =
                discover::respond(discover::DAEMON_PORT, request_port, responder_cancel).await
            {
                warn!(error = %err, "discovery responder failed");
            }
        });

        announce(&self.state).await?;
        info!(store = %self.state.store, "daemon on the air");

        let _ = serving.await;
        self.cancel.cancel();
        Ok(())
    }
}

/// Tell every local registry about our configuration block. A registry
/// that answers with an error (other than silence about loops) means the
/// store is misconfigured, and startup fails.
async fn announce(state: &Arc<DaemonState>) -> Result<()> {
    let registries = discover::search(discover::REGISTRY_PORT, true).await?;
    if registries.is_empty() {
        warn!("no registries found; clients must discover this daemon directly");
        return Ok(());
    }

    let block = state.block.read().clone();
    let mapping = json!({ state.uuid.to_string(): serde_json::to_value(&block)? });

    let context = tmq::Context::new();
    for (address, port) in registries {
        let client = match RequestClient::connect(&context, &address.to_string(), port) {
            Ok(client) => client,
            Err(err) => {
                warn!(registry = %address, error = %err, "registry connect failed");
                continue;
            }
        };

        let request = Request::new(
            MessageType::Config,
            state.store.clone(),
            Some(Payload {
                value: Some(mapping.clone()),
                ..Payload::default()
            }),
        );

        match client.transact(request, ANNOUNCE_TIMEOUT).await {
            Ok(response) => {
                response.payload_result().map_err(|err| {
                    MktlError::Value(format!("CONFIG announce failed: {}", err))
                })?;
                debug!(registry = %address, port, "announced");
            }
            Err(err) => {
                warn!(registry = %address, error = %err, "registry did not answer the announce");
            }
        }
    }

    Ok(())
}

/// Ask whatever answers the remembered request port whether it is another
/// instance of this daemon; abort startup if so. Anything else squatting
/// on the port just costs us a new port assignment.
async fn probe_running_instance(store: &str, uuid: &Uuid, port: u16) -> Result<()> {
    let context = tmq::Context::new();
    let Ok(client) = RequestClient::connect(&context, "localhost", port) else {
        return Ok(());
    };

    let request = Request::new(MessageType::Config, store, None);
    let Ok(response) = client.transact(request, PROBE_TIMEOUT).await else {
        return Ok(());
    };

    if let Ok((payload, _)) = response.payload_result() {
        if let Some(mapping) = payload.value.as_ref().and_then(Value::as_object) {
            if mapping.contains_key(&uuid.to_string()) {
                return Err(MktlError::Value(format!(
                    "another instance of {} is already running on port {}",
                    store, port
                )));
            }
        }
    }

    Ok(())
}

/// The items every daemon carries alongside its configured ones: uptime
/// and hostname, suffixed onto the daemon's identifier.
fn add_builtin_items(items: &mut crate::config::block::Items, identifier: &str) {
    let prefix = identifier.to_uppercase();

    let mut clock = ItemDescriptor::new(ItemType::Numeric);
    clock.description = Some("Uptime for this daemon.".to_string());
    clock.units = Some(json!("seconds"));
    clock.settable = Some(false);
    clock.poll = Some(1.0);
    items.entry(format!("{}CLK", prefix)).or_insert(clock);

    let mut host = ItemDescriptor::new(ItemType::String);
    host.description = Some("The hostname where this daemon is running.".to_string());
    host.settable = Some(false);
    host.initial = Some(json!(crate::transport::local_hostname()));
    items.entry(format!("{}HOST", prefix)).or_insert(host);
}

struct UptimeHandler {
    started: Instant,
}

#[async_trait]
impl ItemHandler for UptimeHandler {
    async fn refresh(&self, _item: &ItemContext) -> Result<CachedValue> {
        Ok(CachedValue::of_value(
            json!(self.started.elapsed().as_secs_f64()),
            epoch_now(),
        ))
    }

    async fn set(&self, _item: &ItemContext, _incoming: &CachedValue) -> Result<Option<CachedValue>> {
        Err(MktlError::Value("uptime cannot be set".to_string()))
    }

    fn validate(&self, _item: &ItemContext, _incoming: &CachedValue) -> Result<()> {
        Ok(())
    }
}

/// Run configured initial values through the normal set path. A persisted
/// value loaded afterwards overrides these.
async fn apply_initial_values(
    block: &ConfigBlock,
    items: &HashMap<String, Arc<AuthoritativeItem>>,
) {
    for (key, descriptor) in &block.items {
        let Some(initial) = &descriptor.initial else { continue };
        let Some(item) = items.get(key) else { continue };

        let value = CachedValue::of_value(initial.clone(), epoch_now());
        if let Err(err) = item.initialize(value).await {
            warn!(item = %item.full_key(), error = %err, "initial value rejected");
        }
    }
}

/// Reload values persisted by a previous incarnation, before the daemon
/// goes on the air.
async fn restore_persistent(uuid: &Uuid, items: &HashMap<String, Arc<AuthoritativeItem>>) -> usize {
    let Ok(directory) = home::daemon_persist(&uuid.to_string()) else {
        return 0;
    };
    let Ok(mut entries) = tokio::fs::read_dir(&directory).await else {
        return 0;
    };

    let mut restored = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let key = entry.file_name().to_string_lossy().to_string();
        if key.starts_with("bulk:") {
            continue;
        }
        let Some(item) = items.get(&key) else { continue };

        let Ok(raw) = tokio::fs::read(entry.path()).await else {
            continue;
        };
        let payload = match Payload::decode(&raw) {
            Ok(Some(payload)) => payload,
            _ => continue,
        };
        let bulk = tokio::fs::read(directory.join(format!("bulk:{}", key)))
            .await
            .ok();

        match item.initialize(CachedValue { payload, bulk }).await {
            Ok(()) => restored += 1,
            Err(err) => {
                warn!(item = %item.full_key(), error = %err, "persisted value rejected")
            }
        }
    }

    restored
}

/// The in-process persistence sink: collect the latest value per key and
/// flush on a fixed cadence, with a final flush at shutdown.
fn spawn_persist_sink(
    uuid: Uuid,
    mut rx: mpsc::UnboundedReceiver<PersistRecord>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let Ok(directory) = home::daemon_persist(&uuid.to_string()) else {
            return;
        };

        let mut pending: HashMap<String, PersistRecord> = HashMap::new();
        let mut ticker = tokio::time::interval(PERSIST_FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush_persist(&directory, &mut pending).await;
                    break;
                }
                record = rx.recv() => match record {
                    Some(record) => {
                        pending.insert(record.key.clone(), record);
                    }
                    None => {
                        flush_persist(&directory, &mut pending).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    flush_persist(&directory, &mut pending).await;
                }
            }
        }
    });
}

async fn flush_persist(directory: &PathBuf, pending: &mut HashMap<String, PersistRecord>) {
    for (key, record) in pending.drain() {
        let path = directory.join(&key);
        if let Err(err) = home::write_atomic(&path, &record.payload).await {
            warn!(key = %key, error = %err, "persist write failed");
            continue;
        }

        let bulk_path = directory.join(format!("bulk:{}", key));
        match record.bulk {
            Some(bulk) => {
                if let Err(err) = home::write_atomic(&bulk_path, &bulk).await {
                    warn!(key = %key, error = %err, "bulk persist write failed");
                }
            }
            None => {
                let _ = tokio::fs::remove_file(&bulk_path).await;
            }
        }
    }
}

/// Remembered port numbers for this `(store, uuid)`, from the previous
/// incarnation.
async fn load_ports(store: &str, uuid: &Uuid) -> (Option<u16>, Option<u16>) {
    let Ok(directory) = home::daemon_port(store) else {
        return (None, None);
    };

    let mut ports = [None, None];
    for (slot, extension) in ports.iter_mut().zip(["req", "pub"]) {
        *slot = tokio::fs::read_to_string(directory.join(format!("{}.{}", uuid, extension)))
            .await
            .ok()
            .and_then(|raw| raw.trim().parse().ok());
    }

    (ports[0], ports[1])
}

async fn save_ports(store: &str, uuid: &Uuid, req: u16, publish: u16) -> Result<()> {
    let directory = home::daemon_port(store)?;
    home::write_atomic(
        &directory.join(format!("{}.req", uuid)),
        format!("{}\n", req).as_bytes(),
    )
    .await?;
    home::write_atomic(
        &directory.join(format!("{}.pub", uuid)),
        format!("{}\n", publish).as_bytes(),
    )
    .await?;
    Ok(())
}

/// Every port recorded on this host; remembered assignments are avoided
/// when scanning for a fresh port.
async fn used_ports() -> HashSet<u16> {
    let mut ports = HashSet::new();
    let Ok(base) = home::directory() else {
        return ports;
    };

    let root = base.join("daemon").join("port");
    let Ok(mut stores) = tokio::fs::read_dir(&root).await else {
        return ports;
    };

    while let Ok(Some(store_dir)) = stores.next_entry().await {
        let Ok(mut files) = tokio::fs::read_dir(store_dir.path()).await else {
            continue;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            if let Ok(raw) = tokio::fs::read_to_string(file.path()).await {
                if let Ok(port) = raw.trim().parse() {
                    ports.insert(port);
                }
            }
        }
    }

    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::block::Items;
    use crate::store::authoritative::CachingHandler;

    fn state_with_items(keys: &[&str]) -> Arc<DaemonState> {
        let context = tmq::Context::new();
        let publish =
            Arc::new(PublishServer::bind(&context, None, &HashSet::new()).unwrap());

        let items: Items = keys
            .iter()
            .map(|key| (key.to_string(), ItemDescriptor::new(ItemType::Numeric)))
            .collect();
        let mut block = ConfigBlock::new("oven", Uuid::new_v4(), items).unwrap();
        block.append_provenance("daemon-host", 10200, Some(10201));

        let cancel = CancellationToken::new();
        let mut spawned = HashMap::new();
        for (key, descriptor) in block.items.clone() {
            let item = AuthoritativeItem::spawn(
                "oven",
                key.clone(),
                descriptor,
                Arc::new(CachingHandler),
                publish.clone(),
                None,
                cancel.clone(),
            );
            spawned.insert(key, item);
        }

        Arc::new(DaemonState {
            store: "oven".to_string(),
            uuid: block.uuid,
            block: parking_lot::RwLock::new(block),
            items: spawned,
        })
    }

    #[tokio::test]
    async fn get_returns_the_cached_value() {
        let state = state_with_items(&["TEMP"]);
        state.items["TEMP"]
            .set(CachedValue::of_value(json!(77.2), 1000.0))
            .await
            .unwrap();

        let request = Request::new(MessageType::Get, "oven.TEMP", None);
        let (payload, bulk) = state.handle(request).await.unwrap();

        let payload = payload.unwrap();
        assert_eq!(payload.value, Some(json!(77.2)));
        assert_eq!(payload.time, Some(1000.0));
        assert!(bulk.is_none());
    }

    #[tokio::test]
    async fn get_for_the_wrong_store_is_a_value_error() {
        let state = state_with_items(&["TEMP"]);
        let request = Request::new(MessageType::Get, "freezer.TEMP", None);
        let err = state.handle(request).await.unwrap_err();
        assert!(matches!(err, MktlError::Value(_)));
    }

    #[tokio::test]
    async fn get_for_an_unknown_key_is_a_key_error() {
        let state = state_with_items(&["TEMP"]);
        let request = Request::new(MessageType::Get, "oven.MISSING", None);
        let err = state.handle(request).await.unwrap_err();
        assert!(matches!(err, MktlError::Key(_)));
    }

    #[tokio::test]
    async fn set_success_has_an_empty_payload() {
        let state = state_with_items(&["TEMP"]);
        let request = Request::new(
            MessageType::Set,
            "oven.TEMP",
            Some(Payload {
                value: Some(json!(55)),
                ..Payload::default()
            }),
        );
        let (payload, bulk) = state.handle(request).await.unwrap();
        assert!(payload.is_none());
        assert!(bulk.is_none());

        let request = Request::new(MessageType::Get, "oven.TEMP", None);
        let (payload, _) = state.handle(request).await.unwrap();
        assert_eq!(payload.unwrap().value, Some(json!(55)));
    }

    #[tokio::test]
    async fn hash_covers_the_local_store() {
        let state = state_with_items(&["TEMP"]);

        let request = Request::new(MessageType::Hash, "", None);
        let (payload, _) = state.handle(request).await.unwrap();
        let value = payload.unwrap().value.unwrap();

        let hashes = value.as_object().unwrap();
        assert!(hashes.contains_key("oven"));
        let by_uuid = hashes["oven"].as_object().unwrap();
        assert_eq!(
            by_uuid[&state.uuid.to_string()],
            json!(state.block.read().hash)
        );

        // A named unknown store is a KeyError.
        let request = Request::new(MessageType::Hash, "freezer", None);
        assert!(matches!(
            state.handle(request).await.unwrap_err(),
            MktlError::Key(_)
        ));
    }

    #[tokio::test]
    async fn config_requires_a_target_and_returns_the_block() {
        let state = state_with_items(&["TEMP"]);

        let request = Request::new(MessageType::Config, "", None);
        assert!(matches!(
            state.handle(request).await.unwrap_err(),
            MktlError::Value(_)
        ));

        let request = Request::new(MessageType::Config, "oven", None);
        let (payload, _) = state.handle(request).await.unwrap();
        let value = payload.unwrap().value.unwrap();
        let blocks = value.as_object().unwrap();

        let block: ConfigBlock =
            serde_json::from_value(blocks[&state.uuid.to_string()].clone()).unwrap();
        assert_eq!(block.name, "oven");
        assert!(block.items.contains_key("TEMP"));
    }

    #[test]
    fn builtin_items_are_added_once() {
        let mut items = Items::new();
        add_builtin_items(&mut items, "thermal");
        assert!(items.contains_key("THERMALCLK"));
        assert!(items.contains_key("THERMALHOST"));
        assert!(!items["THERMALCLK"].settable());

        // A descriptor the operator defined wins over the builtin.
        let mut items = Items::new();
        let mut custom = ItemDescriptor::new(ItemType::Numeric);
        custom.description = Some("mine".to_string());
        items.insert("THERMALCLK".to_string(), custom);
        add_builtin_items(&mut items, "thermal");
        assert_eq!(items["THERMALCLK"].description.as_deref(), Some("mine"));
    }
}
