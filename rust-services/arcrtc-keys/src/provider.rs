//! Key provider capability interface
//!
//! This module defines the trait implemented by key storage backends:
//! - In-memory storage (session-lifetime keys)
//! - Local file-backed storage
//! - HSM or external KMS backends (out of tree)
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::KeyResult;
use crate::key_types::{KeyId, KeyRecord, KeyType};
use async_trait::async_trait;

/// Trait for key storage backends
///
/// Implementations are read-mostly: `get` takes no exclusive lock, while
/// `put` and `rotate` serialize through the backend's write path and bump
/// the per-key version.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Store a new key. Fails with `KeyError::Conflict` if the id exists.
    async fn put(&self, key_id: &KeyId, key_type: KeyType, material: &[u8]) -> KeyResult<()>;

    /// Retrieve the active version of a key. Fails with `KeyError::NotFound`.
    async fn get(&self, key_id: &KeyId) -> KeyResult<Vec<u8>>;

    /// Retrieve a specific version of a key
    async fn get_version(&self, key_id: &KeyId, version: u32) -> KeyResult<Vec<u8>>;

    /// Rotate a key: install `new_material` as the new active version.
    /// Previous versions remain readable via `get_version`.
    async fn rotate(&self, key_id: &KeyId, new_material: &[u8]) -> KeyResult<u32>;

    /// Delete a key and all of its versions
    async fn delete(&self, key_id: &KeyId) -> KeyResult<()>;

    /// Get the full record (metadata and version history) for a key
    async fn record(&self, key_id: &KeyId) -> KeyResult<KeyRecord>;

    /// List all key IDs
    async fn list(&self) -> KeyResult<Vec<KeyId>>;

    /// Check if a key exists
    async fn exists(&self, key_id: &KeyId) -> bool;
}
