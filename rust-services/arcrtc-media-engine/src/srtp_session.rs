//! SRTP (Secure Real-time Transport Protocol) session crypto
//!
//! Implements RFC 3711/7714 SRTP sealing and opening with AES-GCM.
//! The RTP header is authenticated as associated data; the payload is
//! encrypted and carries a 16-byte GCM tag. Each context tracks its
//! rollover counter, highest received extended sequence and a replay
//! window, so no (SSRC, extended sequence) pair is ever opened twice.
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
use crate::rtp_codec::{RtpHeader, RtpPacket};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use hkdf::Hkdf;
use sha2::Sha256;
use std::time::{Duration, Instant};

/// HKDF labels for per-stream key derivation
const LABEL_ENC: &[u8] = b"arcrtc-enc";
const LABEL_AUTH: &[u8] = b"arcrtc-auth";
const LABEL_SALT: &[u8] = b"arcrtc-salt";

/// GCM authentication tag length in bytes
pub const GCM_TAG_LEN: usize = 16;

/// Session salt length in bytes
pub const SESSION_SALT_LEN: usize = 14;

/// How long a superseded context keeps absorbing reordered packets
const ROTATION_GRACE: Duration = Duration::from_secs(1);

enum CipherKind {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl CipherKind {
    fn encrypt(&self, nonce: &[u8; 12], payload: Payload<'_, '_>) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            CipherKind::Aes128(cipher) => cipher.encrypt(nonce, payload),
            CipherKind::Aes256(cipher) => cipher.encrypt(nonce, payload),
        }
        .map_err(|_| CryptoError::AuthFailed)
    }

    fn decrypt(&self, nonce: &[u8; 12], payload: Payload<'_, '_>) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            CipherKind::Aes128(cipher) => cipher.decrypt(nonce, payload),
            CipherKind::Aes256(cipher) => cipher.decrypt(nonce, payload),
        }
        .map_err(|_| CryptoError::AuthFailed)
    }
}

/// Anti-replay window over extended sequence numbers
///
/// A sliding bitmap of `size` entries ending at the highest accepted
/// extended sequence. A sequence below the window, or one whose bit is
/// already set, is a replay.
struct ReplayWindow {
    size: u64,
    bitmap: Vec<u64>,
    highest: Option<u64>,
}

impl ReplayWindow {
    fn new(size: u32) -> Self {
        let words = ((size as usize) + 63) / 64;
        ReplayWindow {
            size: size as u64,
            bitmap: vec![0; words],
            highest: None,
        }
    }

    fn bit_index(&self, offset: u64) -> (usize, u64) {
        ((offset / 64) as usize, offset % 64)
    }

    fn is_set(&self, offset: u64) -> bool {
        let (word, bit) = self.bit_index(offset);
        self.bitmap[word] & (1 << bit) != 0
    }

    fn set(&mut self, offset: u64) {
        let (word, bit) = self.bit_index(offset);
        self.bitmap[word] |= 1 << bit;
    }

    /// Check whether `ext_seq` would be accepted, without mutating state
    fn check(&self, ext_seq: u64) -> Result<(), CryptoError> {
        let highest = match self.highest {
            Some(h) => h,
            None => return Ok(()),
        };
        if ext_seq > highest {
            return Ok(());
        }
        let offset = highest - ext_seq;
        if offset >= self.size {
            // Below the window's lower edge
            return Err(CryptoError::ReplayDetected(ext_seq));
        }
        if self.is_set(offset) {
            return Err(CryptoError::ReplayDetected(ext_seq));
        }
        Ok(())
    }

    /// Mark `ext_seq` received; caller must have passed `check` first
    fn accept(&mut self, ext_seq: u64) {
        match self.highest {
            None => {
                self.highest = Some(ext_seq);
                self.set(0);
            }
            Some(highest) if ext_seq > highest => {
                let shift = ext_seq - highest;
                self.shift_left(shift);
                self.highest = Some(ext_seq);
                self.set(0);
            }
            Some(highest) => {
                self.set(highest - ext_seq);
            }
        }
    }

    /// Slide the window forward by `shift` positions
    fn shift_left(&mut self, shift: u64) {
        if shift >= self.size {
            for word in &mut self.bitmap {
                *word = 0;
            }
            return;
        }
        let words = self.bitmap.len();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in (0..words).rev() {
            let mut value = if i >= word_shift {
                self.bitmap[i - word_shift] << bit_shift
            } else {
                0
            };
            if bit_shift > 0 && i > word_shift {
                value |= self.bitmap[i - word_shift - 1] >> (64 - bit_shift);
            }
            self.bitmap[i] = value;
        }
    }
}

/// Estimate the extended sequence of a 16-bit wire sequence given the
/// highest extended sequence seen so far (RFC 3711 Section 3.3.1)
pub fn estimate_extended(seq: u16, highest: Option<u64>) -> u64 {
    let highest = match highest {
        Some(h) => h,
        None => return seq as u64,
    };
    let roc = highest >> 16;
    let highest_low = (highest & 0xFFFF) as u16;

    let candidate_roc = if highest_low < 0x8000 {
        if seq > highest_low && seq.wrapping_sub(highest_low) > 0x8000 {
            roc.saturating_sub(1)
        } else {
            roc
        }
    } else if highest_low.wrapping_sub(seq) > 0x8000 {
        roc + 1
    } else {
        roc
    };
    (candidate_roc << 16) | seq as u64
}

/// Tracks extended sequences for unencrypted streams
///
/// The same signed-delta estimate as the SRTP context, without crypto or
/// replay state. Used by the jitter buffer when a stream runs in the clear.
#[derive(Debug, Default)]
pub struct SequenceExtender {
    highest: Option<u64>,
}

impl SequenceExtender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend a wire sequence and advance the high-water mark
    pub fn extend(&mut self, seq: u16) -> u64 {
        let ext = estimate_extended(seq, self.highest);
        if self.highest.map(|h| ext > h).unwrap_or(true) {
            self.highest = Some(ext);
        }
        ext
    }

    /// Current rollover counter
    pub fn roc(&self) -> u32 {
        (self.highest.unwrap_or(0) >> 16) as u32
    }
}

/// Per-stream SRTP state: derived keys, rollover counter, replay window
pub struct CryptoContext {
    suite: CryptoSuite,
    cipher: CipherKind,
    /// Derived authentication key; GCM folds authentication into the tag,
    /// the key is retained for non-AEAD suites and key-confirmation checks
    #[allow(dead_code)]
    auth_key: Vec<u8>,
    session_salt: [u8; SESSION_SALT_LEN],
    ssrc: u32,
    /// Highest extended sequence sealed by this context
    sent_extended: Option<u64>,
    /// Highest extended sequence opened by this context
    received_extended: Option<u64>,
    replay: ReplayWindow,
    /// Packets sealed or opened; drives mandatory rotation
    packets_processed: u64,
    rotation_limit: u64,
}

impl CryptoContext {
    /// Derive a context from master key material
    ///
    /// Deterministic in its inputs: the same master key, salt and SSRC
    /// always produce the same session keys.
    pub fn derive(
        suite: CryptoSuite,
        master_key: &[u8],
        master_salt: &[u8],
        ssrc: u32,
        replay_window_size: u32,
        rotation_limit: u64,
    ) -> Result<Self, CryptoError> {
        if master_key.len() != suite.key_len() {
            return Err(CryptoError::InvalidKey(format!(
                "master key must be {} bytes for {}, got {}",
                suite.key_len(),
                suite.as_str(),
                master_key.len()
            )));
        }
        if master_salt.len() != SESSION_SALT_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "master salt must be {} bytes, got {}",
                SESSION_SALT_LEN,
                master_salt.len()
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(master_salt), master_key);

        let mut encryption_key = vec![0u8; suite.key_len()];
        hkdf.expand(LABEL_ENC, &mut encryption_key)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

        let mut auth_key = vec![0u8; 20];
        hkdf.expand(LABEL_AUTH, &mut auth_key)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

        let mut session_salt = [0u8; SESSION_SALT_LEN];
        hkdf.expand(LABEL_SALT, &mut session_salt)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

        let cipher = match suite {
            CryptoSuite::Aes128Gcm => CipherKind::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&encryption_key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
            )),
            CryptoSuite::Aes256Gcm => CipherKind::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&encryption_key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
            )),
        };

        Ok(CryptoContext {
            suite,
            cipher,
            auth_key,
            session_salt,
            ssrc,
            sent_extended: None,
            received_extended: None,
            replay: ReplayWindow::new(replay_window_size),
            packets_processed: 0,
            rotation_limit,
        })
    }

    /// SSRC this context is bound to
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Negotiated suite
    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    /// Current receive-side rollover counter
    pub fn roc(&self) -> u32 {
        (self.received_extended.unwrap_or(0) >> 16) as u32
    }

    /// Highest received extended sequence
    pub fn highest_received(&self) -> Option<u64> {
        self.received_extended
    }

    /// Packets sealed or opened on this context
    pub fn packets_processed(&self) -> u64 {
        self.packets_processed
    }

    /// IV = session_salt XOR (SSRC || ROC || seq_low || 0x0000), 12 bytes
    /// (RFC 7714 Section 8.1)
    fn build_iv(&self, seq_low: u16, roc: u32) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        iv[4..8].copy_from_slice(&roc.to_be_bytes());
        iv[8..10].copy_from_slice(&seq_low.to_be_bytes());
        for (i, byte) in iv.iter_mut().enumerate() {
            *byte ^= self.session_salt[i];
        }
        iv
    }

    fn check_rotation_budget(&self) -> Result<(), CryptoError> {
        if self.packets_processed >= self.rotation_limit {
            return Err(CryptoError::RotationRequired(self.packets_processed));
        }
        Ok(())
    }

    /// Seal an RTP packet into SRTP bytes
    ///
    /// The serialized header is authenticated as AAD; payload and padding
    /// are encrypted; the 16-byte GCM tag is appended.
    pub fn seal(&mut self, packet: &RtpPacket) -> MediaEngineResult<Bytes> {
        if packet.header.ssrc != self.ssrc {
            return Err(CryptoError::InvalidKey(format!(
                "packet SSRC {} does not match context SSRC {}",
                packet.header.ssrc, self.ssrc
            ))
            .into());
        }
        self.check_rotation_budget()?;

        let seq = packet.header.sequence_number;
        let ext = estimate_extended(seq, self.sent_extended);
        if self.sent_extended.map(|h| ext > h).unwrap_or(true) {
            self.sent_extended = Some(ext);
        }
        let roc = (ext >> 16) as u32;

        let header_bytes = packet.header.serialize();
        let mut plaintext = BytesMut::with_capacity(packet.payload.len() + packet.padding.len());
        plaintext.put_slice(&packet.payload);
        plaintext.put_slice(&packet.padding);

        let iv = self.build_iv(seq, roc);
        let ciphertext = self.cipher.encrypt(
            &iv,
            Payload {
                msg: plaintext.as_ref(),
                aad: header_bytes.as_ref(),
            },
        )?;

        self.packets_processed += 1;

        let mut out = BytesMut::with_capacity(header_bytes.len() + ciphertext.len());
        out.put_slice(&header_bytes);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Open SRTP bytes into an RTP packet and its extended sequence
    ///
    /// Rejects replays before touching the cipher; marks the sequence
    /// received only after the tag verifies, so a forged packet cannot
    /// poison the window.
    pub fn open(&mut self, srtp_bytes: &[u8]) -> MediaEngineResult<(RtpPacket, u64)> {
        self.check_rotation_budget()?;

        let (header, ciphertext) = RtpHeader::parse(srtp_bytes)?;
        if header.ssrc != self.ssrc {
            return Err(CryptoError::AuthFailed.into());
        }
        if ciphertext.len() < GCM_TAG_LEN {
            return Err(CryptoError::AuthFailed.into());
        }

        let seq = header.sequence_number;
        let ext = estimate_extended(seq, self.received_extended);
        self.replay.check(ext).map_err(MediaEngineError::from)?;

        let roc = (ext >> 16) as u32;
        let header_len = srtp_bytes.len() - ciphertext.len();
        let aad = &srtp_bytes[..header_len];
        let iv = self.build_iv(seq, roc);

        let plaintext = self.cipher.decrypt(
            &iv,
            Payload {
                msg: ciphertext,
                aad,
            },
        )?;

        // Authenticated: commit replay and sequence state
        self.replay.accept(ext);
        if self.received_extended.map(|h| ext > h).unwrap_or(true) {
            self.received_extended = Some(ext);
        }
        self.packets_processed += 1;

        let (payload, padding) = if header.padding {
            if plaintext.is_empty() {
                return Err(CryptoError::AuthFailed.into());
            }
            let padding_len = plaintext[plaintext.len() - 1] as usize;
            if padding_len == 0 || padding_len > plaintext.len() {
                return Err(CryptoError::AuthFailed.into());
            }
            let split = plaintext.len() - padding_len;
            (
                Bytes::copy_from_slice(&plaintext[..split]),
                Bytes::copy_from_slice(&plaintext[split..]),
            )
        } else {
            (Bytes::from(plaintext), Bytes::new())
        };

        Ok((
            RtpPacket {
                header,
                payload,
                padding,
            },
            ext,
        ))
    }
}

/// Per-stream crypto session with rotation support
///
/// Owns the active [`CryptoContext`] and, after a rotation, retains the
/// superseded context for a grace window to absorb reordered packets that
/// were sealed under the old keys.
pub struct CryptoSession {
    current: CryptoContext,
    previous: Option<(CryptoContext, Instant)>,
    replay_window_size: u32,
    rotation_limit: u64,
    /// Keys also expire by age, independent of traffic volume
    max_key_age: Duration,
    derived_at: Instant,
}

impl CryptoSession {
    /// Create a session by deriving its initial context
    pub fn new(
        suite: CryptoSuite,
        master_key: &[u8],
        master_salt: &[u8],
        ssrc: u32,
        replay_window_size: u32,
        rotation_limit: u64,
    ) -> Result<Self, CryptoError> {
        Self::with_max_key_age(
            suite,
            master_key,
            master_salt,
            ssrc,
            replay_window_size,
            rotation_limit,
            Duration::from_secs(86_400),
        )
    }

    /// Create a session with an explicit key age limit
    #[allow(clippy::too_many_arguments)]
    pub fn with_max_key_age(
        suite: CryptoSuite,
        master_key: &[u8],
        master_salt: &[u8],
        ssrc: u32,
        replay_window_size: u32,
        rotation_limit: u64,
        max_key_age: Duration,
    ) -> Result<Self, CryptoError> {
        let current = CryptoContext::derive(
            suite,
            master_key,
            master_salt,
            ssrc,
            replay_window_size,
            rotation_limit,
        )?;
        Ok(CryptoSession {
            current,
            previous: None,
            replay_window_size,
            rotation_limit,
            max_key_age,
            derived_at: Instant::now(),
        })
    }

    /// Active context
    pub fn context(&self) -> &CryptoContext {
        &self.current
    }

    /// Seal an outbound packet under the active context
    pub fn seal(&mut self, packet: &RtpPacket) -> MediaEngineResult<Bytes> {
        self.current.seal(packet)
    }

    /// Open an inbound packet
    ///
    /// Tries the active context first; on tag mismatch falls back to the
    /// superseded context while its grace window is open.
    pub fn open(&mut self, srtp_bytes: &[u8]) -> MediaEngineResult<(RtpPacket, u64)> {
        match self.current.open(srtp_bytes) {
            Ok(opened) => Ok(opened),
            Err(MediaEngineError::Crypto(CryptoError::AuthFailed)) => {
                if let Some((ref mut previous, rotated_at)) = self.previous {
                    if rotated_at.elapsed() <= ROTATION_GRACE {
                        return previous.open(srtp_bytes);
                    }
                }
                Err(CryptoError::AuthFailed.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Rotate to new master key material
    ///
    /// The caller switches at an agreed extended-sequence boundary; the
    /// outgoing context remains available for the grace window.
    pub fn rotate(
        &mut self,
        new_master_key: &[u8],
        new_master_salt: &[u8],
    ) -> Result<(), CryptoError> {
        let suite = self.current.suite;
        let ssrc = self.current.ssrc;
        let fresh = CryptoContext::derive(
            suite,
            new_master_key,
            new_master_salt,
            ssrc,
            self.replay_window_size,
            self.rotation_limit,
        )?;
        let old = std::mem::replace(&mut self.current, fresh);
        self.previous = Some((old, Instant::now()));
        self.derived_at = Instant::now();
        Ok(())
    }

    /// Whether the active context has exhausted its packet budget or its
    /// age limit
    pub fn rotation_due(&self) -> bool {
        self.current.packets_processed >= self.rotation_limit
            || self.derived_at.elapsed() >= self.max_key_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const MASTER_KEY: [u8; 16] = [0x41; 16];
    const MASTER_SALT: [u8; 14] = [0x52; 14];
    const SSRC: u32 = 12345;

    fn test_session() -> CryptoSession {
        CryptoSession::new(
            CryptoSuite::Aes128Gcm,
            &MASTER_KEY,
            &MASTER_SALT,
            SSRC,
            64,
            1 << 31,
        )
        .unwrap()
    }

    fn test_packet(seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 960 * seq as u32,
                ssrc: SSRC,
                csrc: vec![],
                extension: None,
            },
            payload: Bytes::from_static(b"sixteen byte pay"),
            padding: Bytes::new(),
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let mut sender = test_session();
        let mut receiver = test_session();
        let packet = test_packet(1000);

        let sealed = sender.seal(&packet).unwrap();
        assert_eq!(sealed.len(), packet.size() + GCM_TAG_LEN);

        let (opened, ext) = receiver.open(&sealed).unwrap();
        assert_eq!(opened, packet);
        assert_eq!(ext, 1000);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = CryptoContext::derive(
            CryptoSuite::Aes128Gcm, &MASTER_KEY, &MASTER_SALT, SSRC, 64, 100,
        )
        .unwrap();
        let b = CryptoContext::derive(
            CryptoSuite::Aes128Gcm, &MASTER_KEY, &MASTER_SALT, SSRC, 64, 100,
        )
        .unwrap();
        assert_eq!(a.session_salt, b.session_salt);
        assert_eq!(a.auth_key, b.auth_key);
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let mut sender = test_session();
        let mut receiver = CryptoSession::new(
            CryptoSuite::Aes128Gcm,
            &[0x99; 16],
            &MASTER_SALT,
            SSRC,
            64,
            1 << 31,
        )
        .unwrap();

        let sealed = sender.seal(&test_packet(1)).unwrap();
        assert!(matches!(
            receiver.open(&sealed),
            Err(MediaEngineError::Crypto(CryptoError::AuthFailed))
        ));
    }

    #[test]
    fn test_tampered_header_fails_auth() {
        let mut sender = test_session();
        let mut receiver = test_session();

        let sealed = sender.seal(&test_packet(7)).unwrap();
        let mut tampered = sealed.to_vec();
        tampered[1] ^= 0x01; // flip the payload type
        assert!(matches!(
            receiver.open(&tampered),
            Err(MediaEngineError::Crypto(CryptoError::AuthFailed))
        ));
    }

    #[test]
    fn test_replay_rejected() {
        let mut sender = test_session();
        let mut receiver = test_session();

        let sealed = sender.seal(&test_packet(2000)).unwrap();
        receiver.open(&sealed).unwrap();
        assert!(matches!(
            receiver.open(&sealed),
            Err(MediaEngineError::Crypto(CryptoError::ReplayDetected(2000)))
        ));
    }

    #[test]
    fn test_replay_window_lower_edge() {
        let mut sender = test_session();
        let mut receiver = test_session();

        // Seal 1..=100 but deliver 37 out of order at the end. With a
        // 64-entry window ending at 100, sequence 37 is the lower edge.
        let mut held_back = None;
        for seq in 1..=100u16 {
            let sealed = sender.seal(&test_packet(seq)).unwrap();
            if seq == 37 {
                held_back = Some(sealed);
            } else {
                receiver.open(&sealed).unwrap();
            }
        }

        // 100 - 64 + 1 = 37: still inside the window and unmarked
        let (opened, _) = receiver.open(&held_back.unwrap()).unwrap();
        assert_eq!(opened.header.sequence_number, 37);
    }

    #[test]
    fn test_below_window_rejected() {
        let mut sender = test_session();
        let mut receiver = test_session();

        let mut held_back = None;
        for seq in 1..=100u16 {
            let sealed = sender.seal(&test_packet(seq)).unwrap();
            if seq == 36 {
                held_back = Some(sealed);
            } else {
                receiver.open(&sealed).unwrap();
            }
        }

        // 36 < 100 - 64 + 1: below the window even though never seen
        assert!(matches!(
            receiver.open(&held_back.unwrap()),
            Err(MediaEngineError::Crypto(CryptoError::ReplayDetected(36)))
        ));
    }

    #[test]
    fn test_sequence_wrap_advances_roc() {
        let mut sender = test_session();
        let mut receiver = test_session();

        for seq in [65534u16, 65535, 0, 1, 2] {
            let sealed = sender.seal(&test_packet(seq)).unwrap();
            let (_, ext) = receiver.open(&sealed).unwrap();
            if seq <= 2 {
                assert_eq!(ext, (1u64 << 16) | seq as u64);
            }
        }
        assert_eq!(receiver.context().roc(), 1);
    }

    #[test]
    fn test_rotation_grace_window() {
        let mut sender = test_session();
        let mut receiver = test_session();

        // Packet sealed under the old keys, delivered after rotation
        let late = sender.seal(&test_packet(10)).unwrap();

        let new_key = [0x77u8; 16];
        let new_salt = [0x88u8; 14];
        sender.rotate(&new_key, &new_salt).unwrap();
        receiver.rotate(&new_key, &new_salt).unwrap();

        let fresh = sender.seal(&test_packet(11)).unwrap();
        receiver.open(&fresh).unwrap();

        // Old-key packet still opens through the grace context
        let (opened, _) = receiver.open(&late).unwrap();
        assert_eq!(opened.header.sequence_number, 10);
    }

    #[test]
    fn test_rotation_budget_enforced() {
        let mut session = CryptoSession::new(
            CryptoSuite::Aes128Gcm,
            &MASTER_KEY,
            &MASTER_SALT,
            SSRC,
            64,
            3,
        )
        .unwrap();

        for seq in 0..3u16 {
            session.seal(&test_packet(seq)).unwrap();
        }
        assert!(session.rotation_due());
        assert!(matches!(
            session.seal(&test_packet(3)),
            Err(MediaEngineError::Crypto(CryptoError::RotationRequired(3)))
        ));
    }

    #[test]
    fn test_aes256_suite() {
        let key = [0x0Fu8; 32];
        let mut sender = CryptoSession::new(
            CryptoSuite::Aes256Gcm, &key, &MASTER_SALT, SSRC, 64, 1 << 31,
        )
        .unwrap();
        let mut receiver = CryptoSession::new(
            CryptoSuite::Aes256Gcm, &key, &MASTER_SALT, SSRC, 64, 1 << 31,
        )
        .unwrap();

        let packet = test_packet(5);
        let (opened, _) = receiver.open(&sender.seal(&packet).unwrap()).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn test_key_size_validated() {
        let err = CryptoContext::derive(
            CryptoSuite::Aes128Gcm, &[0u8; 8], &MASTER_SALT, SSRC, 64, 100,
        );
        assert!(matches!(err, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_sequence_extender_wrap() {
        let mut extender = SequenceExtender::new();
        assert_eq!(extender.extend(65534), 65534);
        assert_eq!(extender.extend(65535), 65535);
        assert_eq!(extender.extend(0), 1 << 16);
        assert_eq!(extender.extend(1), (1 << 16) | 1);
        assert_eq!(extender.roc(), 1);
    }

    #[test]
    fn test_sequence_extender_reorder_before_wrap() {
        let mut extender = SequenceExtender::new();
        extender.extend(65535);
        extender.extend(0);
        // A late pre-wrap packet still lands in the old cycle
        assert_eq!(extender.extend(65534), 65534);
    }
}
