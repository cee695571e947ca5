//! Session key wiring over the arcrtc-keys provider
//!
//! Names, installs, fetches, rotates and releases SRTP master key material
//! for sessions. The media engine never holds raw keys longer than it
//! takes to derive per-stream crypto contexts.
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


use crate::config::CryptoSuite;
use crate::error::{CryptoError, MediaEngineError, MediaEngineResult};
use crate::srtp_session::SESSION_SALT_LEN;
use arcrtc_keys::{KeyError, KeyProvider, KeyType};
use std::sync::Arc;
use uuid::Uuid;

/// Manages SRTP master key material for sessions
pub struct SessionKeyManager {
    provider: Arc<dyn KeyProvider>,
    suite: CryptoSuite,
}

impl SessionKeyManager {
    pub fn new(provider: Arc<dyn KeyProvider>, suite: CryptoSuite) -> Self {
        SessionKeyManager { provider, suite }
    }

    /// Key id under which a session's master key is stored
    pub fn master_key_id(session_id: &Uuid) -> String {
        format!("srtp:master_key:{}", session_id)
    }

    /// Key id under which a session's master salt is stored
    pub fn master_salt_id(session_id: &Uuid) -> String {
        format!("srtp:master_salt:{}", session_id)
    }

    /// Generate fresh random master material for the configured suite
    pub fn generate_material(&self) -> (Vec<u8>, Vec<u8>) {
        use rand::RngCore;
        let mut master_key = vec![0u8; self.suite.key_len()];
        rand::thread_rng().fill_bytes(&mut master_key);
        let mut master_salt = vec![0u8; SESSION_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut master_salt);
        (master_key, master_salt)
    }

    /// Install negotiated master material for a session
    ///
    /// Re-installation (a renegotiated session) rotates instead of
    /// conflicting, preserving the old versions for the grace window.
    pub async fn install(
        &self,
        session_id: &Uuid,
        master_key: &[u8],
        master_salt: &[u8],
    ) -> MediaEngineResult<()> {
        self.validate(master_key, master_salt)?;

        let key_id = Self::master_key_id(session_id);
        match self
            .provider
            .put(&key_id, KeyType::SrtpMasterKey, master_key)
            .await
        {
            Ok(()) => {}
            Err(KeyError::Conflict(_)) => {
                self.provider.rotate(&key_id, master_key).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let salt_id = Self::master_salt_id(session_id);
        match self
            .provider
            .put(&salt_id, KeyType::SrtpMasterSalt, master_salt)
            .await
        {
            Ok(()) => {}
            Err(KeyError::Conflict(_)) => {
                self.provider.rotate(&salt_id, master_salt).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Fetch and validate a session's master material
    pub async fn fetch(&self, session_id: &Uuid) -> MediaEngineResult<(Vec<u8>, Vec<u8>)> {
        let master_key = self.provider.get(&Self::master_key_id(session_id)).await?;
        let master_salt = self.provider.get(&Self::master_salt_id(session_id)).await?;
        self.validate(&master_key, &master_salt)?;
        Ok((master_key, master_salt))
    }

    /// Rotate a session's master material to fresh random values
    pub async fn rotate(&self, session_id: &Uuid) -> MediaEngineResult<(Vec<u8>, Vec<u8>)> {
        let (master_key, master_salt) = self.generate_material();
        self.provider
            .rotate(&Self::master_key_id(session_id), &master_key)
            .await?;
        self.provider
            .rotate(&Self::master_salt_id(session_id), &master_salt)
            .await?;
        Ok((master_key, master_salt))
    }

    /// Delete a session's key material on teardown
    pub async fn release(&self, session_id: &Uuid) {
        // Teardown is best-effort; the keys may never have been installed
        let _ = self.provider.delete(&Self::master_key_id(session_id)).await;
        let _ = self.provider.delete(&Self::master_salt_id(session_id)).await;
    }

    fn validate(&self, master_key: &[u8], master_salt: &[u8]) -> MediaEngineResult<()> {
        if master_key.len() != self.suite.key_len() {
            return Err(MediaEngineError::Crypto(CryptoError::InvalidKey(format!(
                "master key must be {} bytes for {}, got {}",
                self.suite.key_len(),
                self.suite.as_str(),
                master_key.len()
            ))));
        }
        if master_salt.len() != SESSION_SALT_LEN {
            return Err(MediaEngineError::Crypto(CryptoError::InvalidKey(format!(
                "master salt must be {} bytes, got {}",
                SESSION_SALT_LEN,
                master_salt.len()
            ))));
        }
        Ok(())
    }
}
