//! Local encrypted key storage implementation
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
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Master key for encrypting stored records
type MasterKey = [u8; 32];

/// Local key provider persisting encrypted records to a directory
///
/// Each key is one file, `"<hashed id>.key"`, holding the AES-256-GCM
/// encrypted JSON serialization of its [`KeyRecord`] (nonce prepended).
/// Records are cached in memory; reads never touch disk after startup.
pub struct LocalKeyProvider {
    /// Storage directory
    storage_path: PathBuf,
    /// Master encryption key (provided or derived from environment)
    master_key: MasterKey,
    /// In-memory cache of all records
    records: RwLock<HashMap<KeyId, KeyRecord>>,
}

impl LocalKeyProvider {
    /// Create a new local key provider
    ///
    /// # Arguments
    /// * `storage_path` - Directory where encrypted keys will be stored
    /// * `master_key` - Optional 32-byte master key (if None, derived from
    ///   the `ARCRTC_MASTER_KEY` environment variable or freshly generated)
    pub async fn new<P: AsRef<Path>>(
        storage_path: P,
        master_key: Option<&[u8]>,
    ) -> KeyResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        let master_key = if let Some(key) = master_key {
            if key.len() != 32 {
                return Err(KeyError::Configuration(
                    "Master key must be exactly 32 bytes".to_string(),
                ));
            }
            let mut mk = [0u8; 32];
            mk.copy_from_slice(key);
            mk
        } else {
            Self::derive_master_key()?
        };

        let provider = Self {
            storage_path,
            master_key,
            records: RwLock::new(HashMap::new()),
        };
        provider.load_records().await?;
        Ok(provider)
    }

    /// Derive master key from environment variable or generate a new one
    fn derive_master_key() -> KeyResult<MasterKey> {
        if let Ok(key_str) = std::env::var("ARCRTC_MASTER_KEY") {
            if let Ok(key_bytes) = hex::decode(&key_str) {
                if key_bytes.len() == 32 {
                    let mut mk = [0u8; 32];
                    mk.copy_from_slice(&key_bytes);
                    return Ok(mk);
                }
            }
            // Not 32 hex-encoded bytes, derive from the string
            let hash = Sha256::digest(key_str.as_bytes());
            let mut mk = [0u8; 32];
            mk.copy_from_slice(&hash);
            return Ok(mk);
        }

        warn!("No ARCRTC_MASTER_KEY found, generating a new one. This should be set in production!");
        let mut master_key = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut master_key);
        Ok(master_key)
    }

    /// Path of the file backing a key id
    fn record_path(&self, key_id: &KeyId) -> PathBuf {
        // Key ids contain ':' and '/'; hash them into a safe file name
        let digest = Sha256::digest(key_id.as_bytes());
        self.storage_path.join(format!("{}.key", hex::encode(&digest[..16])))
    }

    fn encrypt_record(&self, record: &KeyRecord) -> KeyResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(record)?;
        let cipher = Aes256Gcm::new(&self.master_key.into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| KeyError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt_record(&self, encrypted: &[u8]) -> KeyResult<KeyRecord> {
        if encrypted.len() < 12 {
            return Err(KeyError::Decryption("Encrypted data too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(&self.master_key.into());

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| KeyError::Decryption(format!("Decryption failed: {}", e)))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Load and decrypt all records from the storage directory
    async fn load_records(&self) -> KeyResult<()> {
        let mut dir = fs::read_dir(&self.storage_path).await?;
        let mut records = self.records.write().await;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "key") != Some(true) {
                continue;
            }
            let encrypted = fs::read(&path).await?;
            match self.decrypt_record(&encrypted) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping undecryptable key file");
                }
            }
        }

        debug!(count = records.len(), "Loaded key records");
        Ok(())
    }

    async fn persist(&self, record: &KeyRecord) -> KeyResult<()> {
        let encrypted = self.encrypt_record(record)?;
        fs::write(self.record_path(&record.id), encrypted).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyProvider for LocalKeyProvider {
    async fn put(&self, key_id: &KeyId, key_type: KeyType, material: &[u8]) -> KeyResult<()> {
        if material.is_empty() {
            return Err(KeyError::InvalidMaterial("empty key material".to_string()));
        }

        let mut records = self.records.write().await;
        if records.contains_key(key_id) {
            return Err(KeyError::Conflict(key_id.clone()));
        }
        let record = KeyRecord::new(key_id.clone(), key_type, material.to_vec());
        self.persist(&record).await?;
        records.insert(key_id.clone(), record);
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
        let snapshot = record.clone();
        self.persist(&snapshot).await?;
        Ok(version)
    }

    async fn delete(&self, key_id: &KeyId) -> KeyResult<()> {
        let mut records = self.records.write().await;
        records
            .remove(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        let path = self.record_path(key_id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(path).await?;
        }
        Ok(())
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
    use tempfile::TempDir;

    async fn create_test_provider() -> (LocalKeyProvider, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let provider = LocalKeyProvider::new(temp_dir.path(), Some(&[7u8; 32]))
            .await
            .unwrap();
        (provider, temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (provider, _dir) = create_test_provider().await;
        let key_id = "srtp:master_key:abc".to_string();

        provider
            .put(&key_id, KeyType::SrtpMasterKey, &[0x11; 16])
            .await
            .unwrap();
        assert_eq!(provider.get(&key_id).await.unwrap(), vec![0x11; 16]);
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let key_id = "persist".to_string();

        {
            let provider = LocalKeyProvider::new(temp_dir.path(), Some(&[7u8; 32]))
                .await
                .unwrap();
            provider.put(&key_id, KeyType::Secret, &[9, 9, 9]).await.unwrap();
            provider.rotate(&key_id, &[8, 8, 8]).await.unwrap();
        }

        // New provider instance over the same directory and master key
        let provider = LocalKeyProvider::new(temp_dir.path(), Some(&[7u8; 32]))
            .await
            .unwrap();
        assert_eq!(provider.get(&key_id).await.unwrap(), vec![8, 8, 8]);
        assert_eq!(provider.get_version(&key_id, 1).await.unwrap(), vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn test_wrong_master_key_skips_records() {
        let temp_dir = TempDir::new().unwrap();
        let key_id = "secret".to_string();

        {
            let provider = LocalKeyProvider::new(temp_dir.path(), Some(&[7u8; 32]))
                .await
                .unwrap();
            provider.put(&key_id, KeyType::Secret, &[1]).await.unwrap();
        }

        let provider = LocalKeyProvider::new(temp_dir.path(), Some(&[8u8; 32]))
            .await
            .unwrap();
        assert!(!provider.exists(&key_id).await);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let (provider, dir) = create_test_provider().await;
        let key_id = "gone".to_string();

        provider.put(&key_id, KeyType::Secret, &[1]).await.unwrap();
        provider.delete(&key_id).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 0);
    }
}
