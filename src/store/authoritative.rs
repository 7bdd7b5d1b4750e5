// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Authoritative items: the daemon-side half of the runtime.
//!
//! Each item owns its current value and a capability record of handlers.
//! Handlers execute on a per-item serial queue, the daemon's contract of
//! single-threaded handler execution: concurrent GET/SET for one item are
//! processed one at a time while different items run in parallel. Every
//! value transition, whether from a set, a poll, or a refresh, updates the
//! cache and goes out as a broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::block::{ItemDescriptor, ItemType};
use crate::error::{MktlError, Result};
use crate::payload::{epoch_now, Payload};
use crate::store::item::{coerce_incoming, validate_incoming, CachedValue};
use crate::transport::publish::PublishServer;
use crate::wire::{Broadcast, Topic};

/// Everything a handler may see: the item's identity, its descriptor, and
/// the cached value. Handlers never touch sockets; the runtime publishes.
pub struct ItemContext {
    pub key: String,
    pub full_key: String,
    pub descriptor: ItemDescriptor,
    cached: Mutex<Option<CachedValue>>,
}

impl ItemContext {
    pub fn cached(&self) -> Option<CachedValue> {
        self.cached.lock().clone()
    }
}

/// The per-item capability record. The default implementation is a cache;
/// items backed by hardware supply their own record.
///
/// `set` may block arbitrarily; that is the point of a SET request. The
/// value it returns is what gets cached and broadcast; `None` means "cache
/// the validated incoming value as-is".
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    /// Produce the most up-to-date value available.
    async fn refresh(&self, item: &ItemContext) -> Result<CachedValue>;

    /// Accept a new value. Runs after `validate`.
    async fn set(&self, item: &ItemContext, incoming: &CachedValue) -> Result<Option<CachedValue>>;

    /// Check an incoming value without side effects. Must be idempotent.
    fn validate(&self, item: &ItemContext, incoming: &CachedValue) -> Result<()>;
}

/// The default handler: a pure cache. `refresh` hands back the last known
/// payload, `set` accepts anything that passes type validation.
pub struct CachingHandler;

#[async_trait]
impl ItemHandler for CachingHandler {
    async fn refresh(&self, item: &ItemContext) -> Result<CachedValue> {
        Ok(item
            .cached()
            .unwrap_or_else(|| CachedValue::of_value(Value::Null, epoch_now())))
    }

    async fn set(&self, _item: &ItemContext, _incoming: &CachedValue) -> Result<Option<CachedValue>> {
        Ok(None)
    }

    fn validate(&self, item: &ItemContext, incoming: &CachedValue) -> Result<()> {
        validate_incoming(&item.descriptor, incoming)
    }
}

/// A record queued for the persistence sink: the latest payload for one
/// persistent item.
#[derive(Debug, Clone)]
pub struct PersistRecord {
    pub key: String,
    pub payload: Vec<u8>,
    pub bulk: Option<Vec<u8>>,
}

enum ItemJob {
    Get {
        refresh: bool,
        reply: oneshot::Sender<Result<CachedValue>>,
    },
    Set {
        incoming: CachedValue,
        reply: oneshot::Sender<Result<()>>,
    },
    Poll,
}

/// One item a daemon is authoritative for.
pub struct AuthoritativeItem {
    context: Arc<ItemContext>,
    jobs: mpsc::UnboundedSender<ItemJob>,
    cancel: CancellationToken,
}

impl AuthoritativeItem {
    /// Create the item and start its handler queue. If the descriptor
    /// declares a polling cadence the poll loop starts immediately.
    pub fn spawn(
        store: &str,
        key: impl Into<String>,
        descriptor: ItemDescriptor,
        handler: Arc<dyn ItemHandler>,
        publisher: Arc<PublishServer>,
        persist: Option<mpsc::UnboundedSender<PersistRecord>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let key = key.into();
        let poll_interval = descriptor.poll.filter(|interval| *interval > 0.0);
        let persist = persist.filter(|_| descriptor.persist());

        let context = Arc::new(ItemContext {
            full_key: format!("{}.{}", store, key),
            key,
            descriptor,
            cached: Mutex::new(None),
        });

        let (jobs, mut queue) = mpsc::unbounded_channel::<ItemJob>();

        let worker_context = context.clone();
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    job = queue.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                run_job(&worker_context, &handler, &publisher, &persist, job).await;
            }
        });

        let item = Arc::new(Self {
            context,
            jobs,
            cancel,
        });

        if let Some(interval) = poll_interval {
            item.start_polling(interval);
        }

        item
    }

    pub fn key(&self) -> &str {
        &self.context.key
    }

    pub fn full_key(&self) -> &str {
        &self.context.full_key
    }

    pub fn descriptor(&self) -> &ItemDescriptor {
        &self.context.descriptor
    }

    pub fn cached(&self) -> Option<CachedValue> {
        self.context.cached()
    }

    /// Serve a GET: answer from cache, or run the refresh handler when the
    /// cache is cold or a refresh was requested.
    pub async fn get(&self, refresh: bool) -> Result<CachedValue> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(ItemJob::Get { refresh, reply })
            .map_err(|_| MktlError::Value(format!("{} is shut down", self.context.full_key)))?;
        rx.await
            .map_err(|_| MktlError::Value(format!("{} dropped a request", self.context.full_key)))?
    }

    /// Serve a SET: validate, run the set handler, then cache and broadcast
    /// the result. Blocks until the handler returns.
    pub async fn set(&self, incoming: CachedValue) -> Result<()> {
        if !self.context.descriptor.settable() {
            return Err(MktlError::Value(format!(
                "{} is not settable",
                self.context.full_key
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(ItemJob::Set { incoming, reply })
            .map_err(|_| MktlError::Value(format!("{} is shut down", self.context.full_key)))?;
        rx.await
            .map_err(|_| MktlError::Value(format!("{} dropped a request", self.context.full_key)))?
    }

    /// Seed a value through the set path without the settable guard: used
    /// for configured initial values and restored persistent values, which
    /// apply even to items clients cannot set.
    pub async fn initialize(&self, incoming: CachedValue) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(ItemJob::Set { incoming, reply })
            .map_err(|_| MktlError::Value(format!("{} is shut down", self.context.full_key)))?;
        rx.await
            .map_err(|_| MktlError::Value(format!("{} dropped a request", self.context.full_key)))?
    }

    /// Invoke the refresh handler on a fixed cadence. The result is treated
    /// exactly like a broadcast: cache updated, PUB sent.
    pub fn start_polling(&self, interval_seconds: f64) {
        let jobs = self.jobs.clone();
        let cancel = self.cancel.clone();
        let full_key = self.context.full_key.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if jobs.send(ItemJob::Poll).is_err() {
                            debug!(item = %full_key, "poll loop ending, queue closed");
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn run_job(
    context: &Arc<ItemContext>,
    handler: &Arc<dyn ItemHandler>,
    publisher: &Arc<PublishServer>,
    persist: &Option<mpsc::UnboundedSender<PersistRecord>>,
    job: ItemJob,
) {
    match job {
        ItemJob::Get { refresh, reply } => {
            let outcome = match context.cached() {
                Some(cached) if !refresh => Ok(cached),
                _ => match handler.refresh(context).await {
                    Ok(fresh) => {
                        commit(context, publisher, persist, fresh.clone()).await;
                        Ok(fresh)
                    }
                    Err(err) => Err(err),
                },
            };
            let _ = reply.send(outcome);
        }
        ItemJob::Set { incoming, reply } => {
            let outcome = apply_set(context, handler, publisher, persist, incoming).await;
            let _ = reply.send(outcome);
        }
        ItemJob::Poll => match handler.refresh(context).await {
            Ok(fresh) => commit(context, publisher, persist, fresh).await,
            Err(err) => {
                warn!(item = %context.full_key, error = %err, "poll refresh failed");
            }
        },
    }
}

async fn apply_set(
    context: &Arc<ItemContext>,
    handler: &Arc<dyn ItemHandler>,
    publisher: &Arc<PublishServer>,
    persist: &Option<mpsc::UnboundedSender<PersistRecord>>,
    incoming: CachedValue,
) -> Result<()> {
    handler.validate(context, &incoming)?;
    let mut accepted = coerce_incoming(&context.descriptor, incoming)?;
    if accepted.payload.time.is_none() {
        accepted.payload.time = Some(epoch_now());
    }

    if let Some(replacement) = handler.set(context, &accepted).await? {
        accepted = replacement;
    }

    commit(context, publisher, persist, accepted).await;
    Ok(())
}

/// A value transition: update the cache, broadcast, and queue for the
/// persistence sink when the item persists.
async fn commit(
    context: &Arc<ItemContext>,
    publisher: &Arc<PublishServer>,
    persist: &Option<mpsc::UnboundedSender<PersistRecord>>,
    value: CachedValue,
) {
    {
        let mut cached = context.cached.lock();
        *cached = Some(value.clone());
    }

    let topic = if context.descriptor.kind == ItemType::Bulk && value.bulk.is_some() {
        Topic::bulk(&context.full_key)
    } else {
        Topic::plain(&context.full_key)
    };

    let broadcast = Broadcast::single(topic, value.payload.clone(), value.bulk.clone());
    if let Err(err) = publisher.publish(&broadcast).await {
        warn!(item = %context.full_key, error = %err, "broadcast failed");
    }

    if let Some(sink) = persist {
        match value.payload.encode() {
            Ok(payload) => {
                let record = PersistRecord {
                    key: context.key.clone(),
                    payload,
                    bulk: value.bulk,
                };
                let _ = sink.send(record);
            }
            Err(err) => warn!(item = %context.full_key, error = %err, "persist encode failed"),
        }
    }
}

/// Build a bundle broadcast from several items' current values. Every
/// element carries the item's key and one shared id; subscribers apply the
/// whole set atomically.
pub fn bundle_of(
    store: &str,
    prefix: &str,
    values: &[(String, Payload)],
) -> Broadcast {
    let id = crate::wire::RequestId::next().to_string();
    let elements = values
        .iter()
        .map(|(key, payload)| {
            let mut element = payload.clone();
            element.key = Some(key.clone());
            element.id = Some(id.clone());
            element
        })
        .collect();
    Broadcast::bundle(format!("{}.{}", store, prefix), elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::block::ItemDescriptor;
    use serde_json::json;
    use std::collections::HashSet;

    fn publisher() -> Arc<PublishServer> {
        let context = tmq::Context::new();
        Arc::new(PublishServer::bind(&context, None, &HashSet::new()).unwrap())
    }

    fn spawn_numeric(publisher: Arc<PublishServer>) -> Arc<AuthoritativeItem> {
        AuthoritativeItem::spawn(
            "oven",
            "TEMP",
            ItemDescriptor::new(ItemType::Numeric),
            Arc::new(CachingHandler),
            publisher,
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn set_then_get_returns_the_value() {
        let item = spawn_numeric(publisher());

        item.set(CachedValue::of_value(json!(77.2), 1000.0))
            .await
            .unwrap();

        let cached = item.get(false).await.unwrap();
        assert_eq!(cached.value(), Some(&json!(77.2)));
        assert_eq!(cached.time(), Some(1000.0));

        // A refreshed GET agrees with the last successful SET.
        let refreshed = item.get(true).await.unwrap();
        assert_eq!(refreshed.value(), Some(&json!(77.2)));
    }

    #[tokio::test]
    async fn invalid_set_is_rejected_and_cache_untouched() {
        let item = spawn_numeric(publisher());

        item.set(CachedValue::of_value(json!(1), 1.0)).await.unwrap();
        let err = item
            .set(CachedValue::of_value(json!("warm"), 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MktlError::Type(_)));

        let cached = item.get(false).await.unwrap();
        assert_eq!(cached.value(), Some(&json!(1)));
    }

    struct RejectNegative;

    #[async_trait]
    impl ItemHandler for RejectNegative {
        async fn refresh(&self, item: &ItemContext) -> Result<CachedValue> {
            CachingHandler.refresh(item).await
        }

        async fn set(
            &self,
            _item: &ItemContext,
            _incoming: &CachedValue,
        ) -> Result<Option<CachedValue>> {
            Ok(None)
        }

        fn validate(&self, _item: &ItemContext, incoming: &CachedValue) -> Result<()> {
            match incoming.value().and_then(Value::as_f64) {
                Some(value) if value < 0.0 => Err(MktlError::Value("bad input".to_string())),
                Some(_) => Ok(()),
                None => Err(MktlError::Value("bad input".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn custom_validation_rejects_bad_input() {
        let item = AuthoritativeItem::spawn(
            "team",
            "SCORE",
            ItemDescriptor::new(ItemType::Numeric),
            Arc::new(RejectNegative),
            publisher(),
            None,
            CancellationToken::new(),
        );

        let err = item
            .set(CachedValue::of_value(json!(-3), 0.0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        assert!(matches!(err, MktlError::Value(_)));

        item.set(CachedValue::of_value(json!(10), 0.0)).await.unwrap();
    }

    #[tokio::test]
    async fn unsettable_items_refuse_sets() {
        let mut descriptor = ItemDescriptor::new(ItemType::Numeric);
        descriptor.settable = Some(false);

        let item = AuthoritativeItem::spawn(
            "oven",
            "SERIAL",
            descriptor,
            Arc::new(CachingHandler),
            publisher(),
            None,
            CancellationToken::new(),
        );

        let err = item
            .set(CachedValue::of_value(json!(1), 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MktlError::Value(_)));
    }

    #[tokio::test]
    async fn persistent_items_queue_records() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut descriptor = ItemDescriptor::new(ItemType::Numeric);
        descriptor.persist = Some(true);

        let item = AuthoritativeItem::spawn(
            "oven",
            "SETPOINT",
            descriptor,
            Arc::new(CachingHandler),
            publisher(),
            Some(tx),
            CancellationToken::new(),
        );

        item.set(CachedValue::of_value(json!(42), 7.0)).await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.key, "SETPOINT");
        let payload = Payload::decode(&record.payload).unwrap().unwrap();
        assert_eq!(payload.value, Some(json!(42)));
    }

    #[tokio::test]
    async fn bundle_elements_share_one_id() {
        let broadcast = bundle_of(
            "scope",
            "AXIS",
            &[
                ("RA".to_string(), Payload::of_value(json!(1.5), 5.0)),
                ("DEC".to_string(), Payload::of_value(json!(-0.5), 5.0)),
            ],
        );

        match broadcast.body {
            crate::wire::BroadcastBody::Bundle { elements } => {
                assert_eq!(elements.len(), 2);
                assert_eq!(elements[0].id, elements[1].id);
                assert_eq!(elements[0].key.as_deref(), Some("RA"));
                assert_eq!(elements[1].key.as_deref(), Some("DEC"));
            }
            _ => panic!("expected a bundle"),
        }
    }
}
