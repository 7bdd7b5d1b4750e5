// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! mKTL: a distributed key/value messaging fabric for observatory control.
//!
//! Daemons are authoritative for named items within a store, registries
//! cache configuration per host, and clients discover, fetch, and talk to
//! daemons directly: GET/SET/HASH/CONFIG over ROUTER/DEALER sockets,
//! broadcasts over PUB/SUB, and a UDP call/response for discovery. One
//! wire protocol covers all three roles.
//!
//! The typical client needs only [`Client`]:
//!
//! ```no_run
//! # async fn example() -> mktl::Result<()> {
//! let client = mktl::Client::new();
//! let temperature = client.get("oven.TEMP").await?;
//! let current = temperature.get(false).await?;
//! temperature.set(serde_json::json!(80.5), true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Daemons assemble through [`Daemon::builder`], attaching custom
//! [`ItemHandler`] records to the items that talk to hardware; everything
//! else defaults to the caching behavior.

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod home;
pub mod payload;
pub mod registry;
pub mod store;
pub mod transport;
pub mod wire;

pub use client::Client;
pub use config::{ConfigBlock, ConfigCache, ItemDescriptor, ItemType, Provenance};
pub use daemon::{Daemon, DaemonBuilder};
pub use error::{MktlError, Result, WireError};
pub use payload::Payload;
pub use registry::Registry;
pub use store::{AuthoritativeItem, CachedValue, CachingHandler, Item, ItemHandler, Store};
pub use wire::{Broadcast, MessageType, Request, RequestId, Response, Topic};
