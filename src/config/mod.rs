// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration blocks and the registry-side cache that merges them.

pub mod block;
pub mod cache;

pub use block::{ConfigBlock, ItemDescriptor, ItemType, Provenance};
pub use cache::{Admission, ConfigCache};
