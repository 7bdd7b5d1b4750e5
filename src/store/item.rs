// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mirror items, value typing, and validation.
//!
//! A mirror item lives in a client: a cached value and timestamp kept
//! current by subscription, and callbacks invoked sequentially, in
//! registration order, as updates arrive. Setting never updates the local
//! cache directly; the daemon publishes the post-set value and the mirror
//! picks it up like any other broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::block::{ItemDescriptor, ItemType};
use crate::error::{MktlError, Result};
use crate::payload::{epoch_now, Payload};
use crate::transport::publish::SubscribeClient;
use crate::transport::request::RequestClient;
use crate::wire::{MessageType, Request, Topic};

/// A value as an item holds it: the payload (value and timestamp, or the
/// shape/dtype descriptor for bulk items) plus the out-of-band bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CachedValue {
    pub payload: Payload,
    pub bulk: Option<Vec<u8>>,
}

impl CachedValue {
    pub fn of_value(value: Value, time: f64) -> Self {
        Self {
            payload: Payload::of_value(value, time),
            bulk: None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.payload.value.as_ref()
    }

    pub fn time(&self) -> Option<f64> {
        self.payload.time
    }
}

/// Bytes per element for the compact scalar-type spellings used by bulk
/// payloads.
pub fn dtype_size(dtype: &str) -> Option<usize> {
    match dtype {
        "int8" | "uint8" | "bool" => Some(1),
        "int16" | "uint16" => Some(2),
        "int32" | "uint32" | "float32" => Some(4),
        "int64" | "uint64" | "float64" => Some(8),
        _ => None,
    }
}

/// Check an incoming value against the item's declared type. Side-effect
/// free and idempotent; coercion is a separate step.
pub fn validate_incoming(descriptor: &ItemDescriptor, incoming: &CachedValue) -> Result<()> {
    if descriptor.kind == ItemType::Bulk {
        let payload = &incoming.payload;
        let (Some(shape), Some(dtype)) = (&payload.shape, &payload.dtype) else {
            return Err(MktlError::Value(
                "bulk values require shape and dtype".to_string(),
            ));
        };
        let Some(element) = dtype_size(dtype) else {
            return Err(MktlError::Value(format!("unrecognized dtype: {}", dtype)));
        };
        let expected: u64 = shape.iter().product::<u64>() * element as u64;
        let actual = incoming.bulk.as_ref().map(|bulk| bulk.len() as u64).unwrap_or(0);
        if expected != actual {
            return Err(MktlError::Value(format!(
                "bulk buffer is {} bytes, shape and dtype require {}",
                actual, expected
            )));
        }
        return Ok(());
    }

    let Some(value) = incoming.value() else {
        return Err(MktlError::Value("no value in request".to_string()));
    };

    let acceptable = match descriptor.kind {
        ItemType::Boolean => {
            value.is_boolean() || matches!(value.as_u64(), Some(0) | Some(1)) || value.is_string()
        }
        ItemType::Numeric => value.is_number(),
        ItemType::NumericArray => value
            .as_array()
            .map(|array| array.iter().all(Value::is_number))
            .unwrap_or(false),
        ItemType::String => value.is_string(),
        ItemType::Enumerated => value.is_i64() || value.is_u64() || value.is_string(),
        ItemType::Mask => value.is_u64(),
        ItemType::Bulk => unreachable!(),
    };

    if !acceptable {
        return Err(MktlError::Type(format!(
            "value {} is not acceptable for a {:?} item",
            value, descriptor.kind
        )));
    }

    // String spellings of enumerated and boolean values must name a known
    // enumerator.
    if value.is_string() && matches!(descriptor.kind, ItemType::Enumerated | ItemType::Boolean) {
        coerce_enumerator(descriptor, value)?;
    }

    Ok(())
}

/// Translate a validated value into its stored form: enumerator names
/// become their integers, booleans become true/false.
pub fn coerce_incoming(descriptor: &ItemDescriptor, mut incoming: CachedValue) -> Result<CachedValue> {
    let Some(value) = incoming.value().cloned() else {
        return Ok(incoming);
    };

    let coerced = match descriptor.kind {
        ItemType::Boolean => match &value {
            Value::Bool(_) => value,
            Value::Number(_) => Value::Bool(value.as_u64() == Some(1)),
            Value::String(_) => Value::Bool(coerce_enumerator(descriptor, &value)? == 1),
            _ => value,
        },
        ItemType::Enumerated => match &value {
            Value::String(_) => Value::from(coerce_enumerator(descriptor, &value)?),
            _ => value,
        },
        _ => value,
    };

    incoming.payload.value = Some(coerced);
    Ok(incoming)
}

/// Map an enumerator name to its integer, case-insensitively.
fn coerce_enumerator(descriptor: &ItemDescriptor, value: &Value) -> Result<i64> {
    let name = value.as_str().unwrap_or_default().to_lowercase();
    let enumerators = descriptor
        .enumerators
        .as_ref()
        .ok_or_else(|| MktlError::Value("item has no enumerators".to_string()))?;

    for (number, spelled) in enumerators {
        if spelled.to_lowercase() == name {
            return number
                .parse()
                .map_err(|_| MktlError::Value(format!("malformed enumerator key: {}", number)));
        }
    }

    Err(MktlError::Value(format!("invalid enumerator: {:?}", name)))
}

/// A callback invoked with the item, the new value, and its timestamp.
pub type Callback = Box<dyn Fn(&Item, &Value, f64) + Send + Sync>;

/// A client-side mirror of one item.
pub struct Item {
    pub key: String,
    /// `<store>.<KEY>`.
    pub full_key: String,
    pub descriptor: ItemDescriptor,
    cached: Mutex<Option<CachedValue>>,
    /// Held across fan-out so callbacks run one at a time, in registration
    /// order, never under the value lock.
    callbacks: Mutex<Vec<Callback>>,
    subscribed: AtomicBool,
    timeout: Duration,
    req: Arc<RequestClient>,
    sub: Arc<SubscribeClient>,
    store: Weak<super::Store>,
    updates: mpsc::UnboundedSender<CachedValue>,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("full_key", &self.full_key)
            .field("descriptor", &self.descriptor)
            .field("cached", &self.cached)
            .field("subscribed", &self.subscribed)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Item {
    /// Default deadline for the REP to a GET or blocking SET.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create the mirror and its update queue. Broadcast updates for this
    /// item are processed by a dedicated task, one at a time, in arrival
    /// order; a slow callback therefore delays later updates for this item
    /// but never for any other.
    pub fn spawn(
        store: &Arc<super::Store>,
        key: impl Into<String>,
        descriptor: ItemDescriptor,
        req: Arc<RequestClient>,
        sub: Arc<SubscribeClient>,
    ) -> Arc<Self> {
        let key = key.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<CachedValue>();

        let item = Arc::new(Self {
            full_key: format!("{}.{}", store.name, key),
            key,
            descriptor,
            cached: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            timeout: Self::DEFAULT_TIMEOUT,
            req,
            sub,
            store: Arc::downgrade(store),
            updates: tx,
        });

        let worker = Arc::downgrade(&item);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let Some(item) = worker.upgrade() else { break };
                item.apply_update(update);
            }
        });

        item
    }

    /// The last known value and its timestamp, if any update has arrived.
    pub fn cached(&self) -> Option<CachedValue> {
        self.cached.lock().clone()
    }

    /// Retrieve the current value. A subscribed mirror answers from cache;
    /// `refresh` forces a round trip that also bypasses the daemon's own
    /// cache.
    pub async fn get(&self, refresh: bool) -> Result<Value> {
        if !refresh && self.subscribed.load(Ordering::Acquire) {
            if let Some(cached) = self.cached() {
                return Ok(cached.value().cloned().unwrap_or(Value::Null));
            }
        }

        let payload = refresh.then(|| Payload {
            refresh: Some(true),
            ..Payload::default()
        });

        let request = Request::new(MessageType::Get, self.full_key.clone(), payload);
        let response = self.req.transact(request, self.timeout).await?;
        let (payload, bulk) = response.payload_result()?;

        let update = CachedValue { payload, bulk };
        self.apply_update(update.clone());
        Ok(update.value().cloned().unwrap_or(Value::Null))
    }

    /// Set a new value. With `wait` the call blocks until the daemon's REP
    /// and raises any error it carries; without, the returned handle can be
    /// polled or waited on later.
    pub async fn set(
        &self,
        value: Value,
        wait: bool,
    ) -> Result<Option<crate::transport::request::PendingReply>> {
        if !self.descriptor.settable() {
            return Err(MktlError::Value(format!("{} is not settable", self.full_key)));
        }

        let payload = Payload {
            value: Some(value),
            ..Payload::default()
        };
        let request = Request::new(MessageType::Set, self.full_key.clone(), Some(payload));
        let mut pending = self.req.send(request).await?;

        if !wait {
            return Ok(Some(pending));
        }

        let response = pending.wait(self.timeout).await?;
        response.payload_result()?;
        Ok(None)
    }

    /// Set a bulk value: `shape` and `dtype` describe the raw buffer.
    pub async fn set_bulk(&self, shape: Vec<u64>, dtype: &str, data: Vec<u8>) -> Result<()> {
        let payload = Payload::of_bulk(shape, dtype, epoch_now());
        let request =
            Request::new(MessageType::Set, self.full_key.clone(), Some(payload)).with_bulk(data);
        let mut pending = self.req.send(request).await?;
        let response = pending.wait(self.timeout).await?;
        response.payload_result()?;
        Ok(())
    }

    /// Register a callback for every future update. Registration implicitly
    /// subscribes; the callback also fires for values fetched by `get`.
    pub async fn register(&self, callback: Callback) -> Result<()> {
        self.callbacks.lock().push(callback);
        self.subscribe(true).await
    }

    /// Subscribe to broadcasts for this item. With `prime`, fetch a fresh
    /// value so the cache starts current rather than empty.
    pub async fn subscribe(&self, prime: bool) -> Result<()> {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(store) = self.store.upgrade() else {
            return Err(MktlError::Value("store is gone".to_string()));
        };

        store.retain_topic(&self.sub, &Topic::plain(&self.full_key))?;
        if self.descriptor.kind == ItemType::Bulk {
            store.retain_topic(&self.sub, &Topic::bulk(&self.full_key))?;
        }

        if prime {
            self.get(true).await?;
        }
        Ok(())
    }

    /// Drop the subscription and any registered callbacks.
    pub fn unsubscribe(&self) -> Result<()> {
        if !self.subscribed.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.callbacks.lock().clear();

        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };
        store.release_topic(&self.sub, &Topic::plain(&self.full_key))?;
        if self.descriptor.kind == ItemType::Bulk {
            store.release_topic(&self.sub, &Topic::bulk(&self.full_key))?;
        }
        Ok(())
    }

    /// Queue a broadcast update for sequential processing.
    pub(crate) fn enqueue_update(&self, update: CachedValue) {
        if self.updates.send(update).is_err() {
            warn!(item = %self.full_key, "update queue is gone");
        }
    }

    /// Store a new value and fan out to callbacks. The value lock is
    /// released before any callback runs.
    fn apply_update(&self, update: CachedValue) {
        let value = update.value().cloned().unwrap_or(Value::Null);
        let time = update.time().unwrap_or_else(epoch_now);

        {
            let mut cached = self.cached.lock();
            *cached = Some(update);
        }

        let callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback(self, &value, time);
        }
        if !callbacks.is_empty() {
            debug!(item = %self.full_key, count = callbacks.len(), "callbacks dispatched");
        }
    }
}

impl Item {
    /// The cached value as a float, for the arithmetic operators. NaN when
    /// nothing is cached or the value is not numeric.
    fn cached_f64(&self) -> f64 {
        self.cached()
            .and_then(|cached| cached.value().and_then(Value::as_f64))
            .unwrap_or(f64::NAN)
    }
}

impl std::ops::Add<f64> for &Item {
    type Output = f64;
    fn add(self, other: f64) -> f64 {
        self.cached_f64() + other
    }
}

impl std::ops::Sub<f64> for &Item {
    type Output = f64;
    fn sub(self, other: f64) -> f64 {
        self.cached_f64() - other
    }
}

impl std::ops::Mul<f64> for &Item {
    type Output = f64;
    fn mul(self, other: f64) -> f64 {
        self.cached_f64() * other
    }
}

impl std::ops::Div<f64> for &Item {
    type Output = f64;
    fn div(self, other: f64) -> f64 {
        self.cached_f64() / other
    }
}

impl std::ops::Add<&Item> for f64 {
    type Output = f64;
    fn add(self, other: &Item) -> f64 {
        self + other.cached_f64()
    }
}

impl std::ops::Sub<&Item> for f64 {
    type Output = f64;
    fn sub(self, other: &Item) -> f64 {
        self - other.cached_f64()
    }
}

impl std::ops::Mul<&Item> for f64 {
    type Output = f64;
    fn mul(self, other: &Item) -> f64 {
        self * other.cached_f64()
    }
}

impl std::ops::Div<&Item> for f64 {
    type Output = f64;
    fn div(self, other: &Item) -> f64 {
        self / other.cached_f64()
    }
}

impl PartialEq<Value> for Item {
    fn eq(&self, other: &Value) -> bool {
        self.cached()
            .and_then(|cached| cached.value().cloned())
            .map(|value| value == *other)
            .unwrap_or(false)
    }
}

impl PartialEq<f64> for Item {
    fn eq(&self, other: &f64) -> bool {
        self.cached()
            .and_then(|cached| cached.value().and_then(Value::as_f64))
            .map(|value| value == *other)
            .unwrap_or(false)
    }
}

impl PartialEq<i64> for Item {
    fn eq(&self, other: &i64) -> bool {
        self.cached()
            .and_then(|cached| cached.value().and_then(Value::as_i64))
            .map(|value| value == *other)
            .unwrap_or(false)
    }
}

impl PartialEq<bool> for Item {
    fn eq(&self, other: &bool) -> bool {
        self.cached()
            .and_then(|cached| cached.value().and_then(Value::as_bool))
            .map(|value| value == *other)
            .unwrap_or(false)
    }
}

impl PartialEq<&str> for Item {
    fn eq(&self, other: &&str) -> bool {
        self.cached()
            .and_then(|cached| cached.value().and_then(|v| v.as_str().map(String::from)))
            .map(|value| value == *other)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn descriptor(kind: ItemType) -> ItemDescriptor {
        ItemDescriptor::new(kind)
    }

    fn enumerated() -> ItemDescriptor {
        let mut descriptor = ItemDescriptor::new(ItemType::Enumerated);
        let mut enumerators = BTreeMap::new();
        enumerators.insert("0".to_string(), "Off".to_string());
        enumerators.insert("1".to_string(), "On".to_string());
        descriptor.enumerators = Some(enumerators);
        descriptor
    }

    #[test]
    fn numeric_accepts_numbers_only() {
        let numeric = descriptor(ItemType::Numeric);
        assert!(validate_incoming(&numeric, &CachedValue::of_value(json!(77.2), 0.0)).is_ok());
        assert!(validate_incoming(&numeric, &CachedValue::of_value(json!(-3), 0.0)).is_ok());

        let err =
            validate_incoming(&numeric, &CachedValue::of_value(json!("warm"), 0.0)).unwrap_err();
        assert!(matches!(err, MktlError::Type(_)));
    }

    #[test]
    fn numeric_array_checks_every_element() {
        let array = descriptor(ItemType::NumericArray);
        assert!(validate_incoming(&array, &CachedValue::of_value(json!([1, 2.5]), 0.0)).is_ok());
        assert!(validate_incoming(&array, &CachedValue::of_value(json!([1, "x"]), 0.0)).is_err());
    }

    #[test]
    fn enumerated_names_map_to_integers() {
        let descriptor = enumerated();
        let incoming = CachedValue::of_value(json!("on"), 0.0);
        assert!(validate_incoming(&descriptor, &incoming).is_ok());

        let coerced = coerce_incoming(&descriptor, incoming).unwrap();
        assert_eq!(coerced.value(), Some(&json!(1)));

        let bad = CachedValue::of_value(json!("sideways"), 0.0);
        assert!(validate_incoming(&descriptor, &bad).is_err());
    }

    #[test]
    fn booleans_coerce_from_numbers() {
        let boolean = descriptor(ItemType::Boolean);
        let coerced =
            coerce_incoming(&boolean, CachedValue::of_value(json!(1), 0.0)).unwrap();
        assert_eq!(coerced.value(), Some(&json!(true)));
    }

    #[test]
    fn bulk_requires_matching_buffer_size() {
        let bulk = descriptor(ItemType::Bulk);

        let good = CachedValue {
            payload: Payload::of_bulk(vec![2, 3], "int16", 0.0),
            bulk: Some(vec![0; 12]),
        };
        assert!(validate_incoming(&bulk, &good).is_ok());

        let short = CachedValue {
            payload: Payload::of_bulk(vec![2, 3], "int16", 0.0),
            bulk: Some(vec![0; 4]),
        };
        assert!(validate_incoming(&bulk, &short).is_err());

        let missing = CachedValue {
            payload: Payload::of_value(json!(1), 0.0),
            bulk: Some(vec![0; 4]),
        };
        assert!(validate_incoming(&bulk, &missing).is_err());
    }

    #[test]
    fn mask_accepts_unsigned_integers() {
        let mask = descriptor(ItemType::Mask);
        assert!(validate_incoming(&mask, &CachedValue::of_value(json!(5), 0.0)).is_ok());
        assert!(validate_incoming(&mask, &CachedValue::of_value(json!(-1), 0.0)).is_err());
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(dtype_size("float64"), Some(8));
        assert_eq!(dtype_size("int16"), Some(2));
        assert_eq!(dtype_size("complex128"), None);
    }
}
