//! Error types for the media transport core
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


use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for media engine operations
pub type MediaEngineResult<T> = Result<T, MediaEngineError>;

/// Malformed byte sequences (RTP, RTCP, signaling JSON)
///
/// Per-packet parse failures are counted and rate-limit logged, never
/// propagated out of the fast path.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("incomplete CSRC list")]
    TruncatedCsrcList,

    #[error("incomplete extension header")]
    TruncatedExtension,

    #[error("bad padding length: {0}")]
    BadPadding(usize),

    #[error("unknown RTCP packet type: {0}")]
    UnknownRtcpType(u8),

    #[error("truncated RTCP packet")]
    TruncatedRtcp,

    #[error("malformed signaling message: {0}")]
    MalformedSignaling(String),
}

/// SRTP sealing/opening failures
#[derive(Error, Debug)]
pub enum CryptoError {
    /// GCM tag mismatch
    #[error("authentication failed")]
    AuthFailed,

    /// Extended sequence already seen or below the replay window
    #[error("replay detected for extended sequence {0}")]
    ReplayDetected(u64),

    /// The context has sealed/opened its packet budget
    #[error("key rotation required after {0} packets")]
    RotationRequired(u64),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Stream and session lifecycle violations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid stream state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown stream: {0}")]
    UnknownStream(Uuid),

    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("unknown SSRC: {0}")]
    UnknownSsrc(u32),

    #[error("duplicate SSRC: {0}")]
    DuplicateSsrc(u32),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("stream start before connection was acknowledged")]
    PrematureStreamStart,
}

/// Datagram I/O failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("datagram write failed: {0}")]
    WriteFailed(String),

    #[error("datagram read failed: {0}")]
    ReadFailed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport closed")]
    Closed,
}

/// Errors that can occur in the media engine
#[derive(Error, Debug)]
pub enum MediaEngineError {
    /// Packet parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// SRTP error
    #[error("SRTP error: {0}")]
    Crypto(#[from] CryptoError),

    /// Lifecycle error
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Datagram transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Key management error
    #[error("key management error: {0}")]
    Key(#[from] arcrtc_keys::KeyError),

    /// Configuration error, reported at construction time
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MediaEngineError {
    fn from(err: std::io::Error) -> Self {
        MediaEngineError::Transport(TransportError::ReadFailed(err.to_string()))
    }
}
