//! In-memory key provider
//!
//! Holds session-lifetime key material in process memory. This is the
//! default backend for the media engine: SRTP master keys and salts live
//! exactly as long as their session.
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


use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyId, KeyRecord, KeyType};
use crate::provider::KeyProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// In-memory key provider backed by a `RwLock`'d map
///
/// Reads take the shared lock; `put`/`rotate`/`delete` serialize through the
/// exclusive lock and bump per-key versions.
#[derive(Default)]
pub struct InMemoryKeyProvider {
    records: RwLock<HashMap<KeyId, KeyRecord>>,
}

impl InMemoryKeyProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn put(&self, key_id: &KeyId, key_type: KeyType, material: &[u8]) -> KeyResult<()> {
        if material.is_empty() {
            return Err(KeyError::InvalidMaterial("empty key material".to_string()));
        }

        let mut records = self.records.write().await;
        if records.contains_key(key_id) {
            return Err(KeyError::Conflict(key_id.clone()));
        }
        records.insert(
            key_id.clone(),
            KeyRecord::new(key_id.clone(), key_type, material.to_vec()),
        );
        Ok(())
    }

    async fn get(&self, key_id: &KeyId) -> KeyResult<Vec<u8>> {
        let records = self.records.read().await;
        let record = records
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        record
            .active_version()
            .map(|v| v.material.clone())
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))
    }

    async fn get_version(&self, key_id: &KeyId, version: u32) -> KeyResult<Vec<u8>> {
        let records = self.records.read().await;
        let record = records
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        record
            .versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.material.clone())
            .ok_or(KeyError::UnknownVersion {
                key_id: key_id.clone(),
                version,
            })
    }

    async fn rotate(&self, key_id: &KeyId, new_material: &[u8]) -> KeyResult<u32> {
        if new_material.is_empty() {
            return Err(KeyError::InvalidMaterial("empty key material".to_string()));
        }

        let mut records = self.records.write().await;
        let record = records
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        let version = record.add_version(new_material.to_vec());
        info!(key_id = %key_id, version, "Rotated key");
        Ok(version)
    }

    async fn delete(&self, key_id: &KeyId) -> KeyResult<()> {
        let mut records = self.records.write().await;
        records
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))
    }

    async fn record(&self, key_id: &KeyId) -> KeyResult<KeyRecord> {
        let records = self.records.read().await;
        records
            .get(key_id)
            .cloned()
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))
    }

    async fn list(&self) -> KeyResult<Vec<KeyId>> {
        let records = self.records.read().await;
        Ok(records.keys().cloned().collect())
    }

    async fn exists(&self, key_id: &KeyId) -> bool {
        self.records.read().await.contains_key(key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let provider = InMemoryKeyProvider::new();
        let key_id = "srtp:master_key:test".to_string();

        provider
            .put(&key_id, KeyType::SrtpMasterKey, &[0xAB; 16])
            .await
            .unwrap();

        let material = provider.get(&key_id).await.unwrap();
        assert_eq!(material, vec![0xAB; 16]);
    }

    #[tokio::test]
    async fn test_put_conflict() {
        let provider = InMemoryKeyProvider::new();
        let key_id = "dup".to_string();

        provider.put(&key_id, KeyType::Secret, &[1]).await.unwrap();
        let err = provider.put(&key_id, KeyType::Secret, &[2]).await;
        assert!(matches!(err, Err(KeyError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let provider = InMemoryKeyProvider::new();
        let err = provider.get(&"missing".to_string()).await;
        assert!(matches!(err, Err(KeyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rotate_keeps_old_versions() {
        let provider = InMemoryKeyProvider::new();
        let key_id = "rot".to_string();

        provider.put(&key_id, KeyType::Secret, &[1]).await.unwrap();
        let v2 = provider.rotate(&key_id, &[2]).await.unwrap();
        assert_eq!(v2, 2);

        assert_eq!(provider.get(&key_id).await.unwrap(), vec![2]);
        assert_eq!(provider.get_version(&key_id, 1).await.unwrap(), vec![1]);
        assert_eq!(provider.get_version(&key_id, 2).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_delete() {
        let provider = InMemoryKeyProvider::new();
        let key_id = "gone".to_string();

        provider.put(&key_id, KeyType::Secret, &[1]).await.unwrap();
        provider.delete(&key_id).await.unwrap();
        assert!(!provider.exists(&key_id).await);
    }
}
