//! Key management for ArcRTC sessions
//!
//! This crate provides the `KeyProvider` capability used by the media
//! transport core to obtain and rotate SRTP master keys and salts:
//! - A trait-based interface implementable by external KMS/HSM backends
//! - An in-memory provider for session-lifetime keys
//! - A local file-backed provider with encryption at rest
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


pub mod error;
pub mod key_types;
pub mod local_store;
pub mod memory_store;
pub mod provider;

pub use error::{KeyError, KeyResult};
pub use key_types::{KeyId, KeyRecord, KeyType, KeyVersion};
pub use local_store::LocalKeyProvider;
pub use memory_store::InMemoryKeyProvider;
pub use provider::KeyProvider;
