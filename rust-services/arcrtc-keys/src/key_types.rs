//! Key type definitions
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


use serde::{Deserialize, Serialize};

/// Unique identifier for a key
pub type KeyId = String;

/// Key type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// SRTP master key for a session
    SrtpMasterKey,
    /// SRTP master salt for a session
    SrtpMasterSalt,
    /// Negotiated session shared secret
    SessionSecret,
    /// Generic secret
    Secret,
}

/// One stored version of a key's material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyVersion {
    /// Version number (incremental, starts at 1)
    pub version: u32,
    /// When this version was created (unix seconds)
    pub created_at: i64,
    /// Whether this is the active version
    pub is_active: bool,
    /// Key material for this version
    pub material: Vec<u8>,
}

impl KeyVersion {
    pub fn new(version: u32, material: Vec<u8>) -> Self {
        Self {
            version,
            created_at: chrono::Utc::now().timestamp(),
            is_active: true,
            material,
        }
    }
}

/// Metadata and version history for a stored key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key identifier
    pub id: KeyId,
    /// Key type
    pub key_type: KeyType,
    /// Current active version
    pub current_version: u32,
    /// All versions of this key, oldest first
    pub versions: Vec<KeyVersion>,
    /// When the key was created (unix seconds)
    pub created_at: i64,
    /// When the key was last updated (unix seconds)
    pub updated_at: i64,
}

impl KeyRecord {
    pub fn new(id: KeyId, key_type: KeyType, material: Vec<u8>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            key_type,
            current_version: 1,
            versions: vec![KeyVersion::new(1, material)],
            created_at: now,
            updated_at: now,
        }
    }

    /// The active version, if any
    pub fn active_version(&self) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.is_active)
    }

    /// Install a new version, deactivating all previous ones
    pub fn add_version(&mut self, material: Vec<u8>) -> u32 {
        for v in &mut self.versions {
            v.is_active = false;
        }
        let next = self.current_version + 1;
        self.versions.push(KeyVersion::new(next, material));
        self.current_version = next;
        self.updated_at = chrono::Utc::now().timestamp();
        next
    }
}
