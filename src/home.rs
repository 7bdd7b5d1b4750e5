// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the per-process cache root.
//!
//! All on-disk access funnels through the single directory resolved here:
//! `MKTL_HOME` if set, `$HOME/.mKTL` otherwise. Once resolved (or set
//! explicitly) the location is immutable for the lifetime of the process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{MktlError, Result};

static HOME: OnceLock<PathBuf> = OnceLock::new();

/// Set the cache root explicitly. Must be an absolute path; fails if the
/// root was already resolved to a different location.
pub fn set(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.is_absolute() {
        return Err(MktlError::Value(format!(
            "cache root must be an absolute path: {}",
            path.display()
        )));
    }

    let chosen = HOME.get_or_init(|| path.to_path_buf());
    if chosen.as_path() != path {
        return Err(MktlError::Value(format!(
            "cache root already set to {}",
            chosen.display()
        )));
    }
    Ok(())
}

/// The cache root for this process.
pub fn directory() -> Result<PathBuf> {
    if let Some(found) = HOME.get() {
        return Ok(found.clone());
    }

    let resolved = match std::env::var_os("MKTL_HOME") {
        Some(dir) => PathBuf::from(dir),
        None => match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".mKTL"),
            None => {
                return Err(MktlError::Value(
                    "MKTL_HOME and HOME are both unset, cannot locate the mKTL cache root"
                        .to_string(),
                ))
            }
        },
    };

    Ok(HOME.get_or_init(|| resolved).clone())
}

/// `client/cache/<store>`: one file per cached configuration block.
pub fn client_cache(store: &str) -> Result<PathBuf> {
    Ok(directory()?.join("client").join("cache").join(store))
}

/// `client/`: registry seed and memory files live here.
pub fn client_dir() -> Result<PathBuf> {
    Ok(directory()?.join("client"))
}

/// `daemon/store/<store>`: authoritative item descriptors and UUID sidecars.
pub fn daemon_store(store: &str) -> Result<PathBuf> {
    Ok(directory()?.join("daemon").join("store").join(store))
}

/// `daemon/port/<store>`: remembered request/publish ports per UUID.
pub fn daemon_port(store: &str) -> Result<PathBuf> {
    Ok(directory()?.join("daemon").join("port").join(store))
}

/// `daemon/persist/<uuid>`: mirrored payloads for persistent items.
pub fn daemon_persist(uuid: &str) -> Result<PathBuf> {
    Ok(directory()?.join("daemon").join("persist").join(uuid))
}

/// Write a file atomically: write to a temp sibling, then rename over the
/// target. Parent directories are created as needed.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp = path.with_extension("tmp");
    tokio::fs::write(&temp, data).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}
