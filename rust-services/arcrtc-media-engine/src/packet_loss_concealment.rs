//! Packet Loss Concealment (PLC)
//!
//! Synthesizes substitute payloads when the jitter buffer reports a gap.
//! Audio repeats the last frame with a linear fade to silence; video
//! freezes the last frame and escalates to a keyframe request when a loss
//! burst would break the P-frame chain.
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


use crate::config::PlcConfig;
use crate::rtp_codec::RtpPacket;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Cached synthesized payloads kept per stream for idempotent concealment
const CONCEAL_CACHE_LIMIT: usize = 128;

/// A keyframe is overdue after this many delta frames without one
const KEYFRAME_OVERDUE_PACKETS: u64 = 300;

/// Synthesized substitute for a lost packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcealedFrame {
    /// Extended sequence the substitute stands in for
    pub ext_seq: u64,
    /// Synthesized payload bytes
    pub payload: Bytes,
}

/// Audio concealment: repeat-with-fade, then silence
pub struct AudioPlc {
    config: PlcConfig,
    /// Last received payload, treated as 16-bit little-endian samples
    last_payload: Option<Bytes>,
    consecutive_concealed: usize,
    cache: BTreeMap<u64, Bytes>,
    degraded: bool,
}

impl AudioPlc {
    pub fn new(config: PlcConfig) -> Self {
        AudioPlc {
            config,
            last_payload: None,
            consecutive_concealed: 0,
            cache: BTreeMap::new(),
            degraded: false,
        }
    }

    /// Record a received packet; resets the consecutive-loss run
    pub fn process_packet(&mut self, packet: &RtpPacket) {
        self.last_payload = Some(packet.payload.clone());
        self.consecutive_concealed = 0;
        self.degraded = false;
    }

    /// Synthesize a substitute for the lost packet at `ext_seq`
    ///
    /// Idempotent: concealing the same sequence twice returns the same
    /// bytes. Returns `None` when concealment is disabled or no reference
    /// frame exists yet.
    pub fn conceal(&mut self, ext_seq: u64) -> Option<Bytes> {
        if !self.config.enabled {
            return None;
        }
        if let Some(cached) = self.cache.get(&ext_seq) {
            return Some(cached.clone());
        }

        let reference = self.last_payload.as_ref()?;
        self.consecutive_concealed += 1;

        let payload = if self.consecutive_concealed > self.config.audio_fade_out_frames {
            self.degraded = true;
            Bytes::from(vec![0u8; reference.len()])
        } else {
            // Linear fade: frame k of n plays at (n - k + 1) / (n + 1) gain
            let n = self.config.audio_fade_out_frames as i32;
            let k = self.consecutive_concealed as i32;
            let num = (n - k + 1).max(0);
            let den = n + 1;
            let mut faded = reference.to_vec();
            for pair in faded.chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                let scaled = (sample as i32 * num / den) as i16;
                pair.copy_from_slice(&scaled.to_le_bytes());
            }
            Bytes::from(faded)
        };

        self.remember(ext_seq, payload.clone());
        Some(payload)
    }

    /// Whether the fade budget is exhausted and the stream plays silence
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_concealed(&self) -> usize {
        self.consecutive_concealed
    }

    fn remember(&mut self, ext_seq: u64, payload: Bytes) {
        self.cache.insert(ext_seq, payload);
        while self.cache.len() > CONCEAL_CACHE_LIMIT {
            self.cache.pop_first();
        }
    }

    pub fn reset(&mut self) {
        self.last_payload = None;
        self.consecutive_concealed = 0;
        self.cache.clear();
        self.degraded = false;
    }
}

/// Video concealment: frame-freeze with keyframe escalation
pub struct VideoPlc {
    config: PlcConfig,
    /// Last received frame payload (freeze source)
    last_frame: Option<Bytes>,
    consecutive_concealed: usize,
    /// Delta frames seen since the last keyframe (marker bit set)
    packets_since_keyframe: u64,
    needs_keyframe: bool,
    cache: BTreeMap<u64, Bytes>,
}

impl VideoPlc {
    pub fn new(config: PlcConfig) -> Self {
        VideoPlc {
            config,
            last_frame: None,
            consecutive_concealed: 0,
            packets_since_keyframe: 0,
            needs_keyframe: false,
            cache: BTreeMap::new(),
        }
    }

    /// Record a received packet; marker bit marks a keyframe boundary
    pub fn process_packet(&mut self, packet: &RtpPacket) {
        self.last_frame = Some(packet.payload.clone());
        self.consecutive_concealed = 0;
        if packet.header.marker {
            self.packets_since_keyframe = 0;
            self.needs_keyframe = false;
        } else {
            self.packets_since_keyframe += 1;
        }
    }

    /// Synthesize a freeze frame for the lost packet at `ext_seq`
    pub fn conceal(&mut self, ext_seq: u64) -> Option<Bytes> {
        if !self.config.enabled {
            return None;
        }
        if let Some(cached) = self.cache.get(&ext_seq) {
            return Some(cached.clone());
        }

        self.consecutive_concealed += 1;
        if self.consecutive_concealed > self.config.max_conceal_packets
            || self.packets_since_keyframe > KEYFRAME_OVERDUE_PACKETS
        {
            self.needs_keyframe = true;
        }

        let payload = self.last_frame.clone()?;
        self.cache.insert(ext_seq, payload.clone());
        while self.cache.len() > CONCEAL_CACHE_LIMIT {
            self.cache.pop_first();
        }
        Some(payload)
    }

    /// Whether the loss burst broke the P-frame chain
    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe
    }

    pub fn consecutive_concealed(&self) -> usize {
        self.consecutive_concealed
    }

    pub fn reset(&mut self) {
        self.last_frame = None;
        self.consecutive_concealed = 0;
        self.packets_since_keyframe = 0;
        self.needs_keyframe = false;
        self.cache.clear();
    }
}

/// Per-stream concealment engine, audio or video strategy
pub enum PlcEngine {
    Audio(AudioPlc),
    Video(VideoPlc),
}

impl PlcEngine {
    /// Build the strategy matching the stream's media kind
    pub fn audio(config: PlcConfig) -> Self {
        PlcEngine::Audio(AudioPlc::new(config))
    }

    pub fn video(config: PlcConfig) -> Self {
        PlcEngine::Video(VideoPlc::new(config))
    }

    /// Record a received packet
    pub fn process_packet(&mut self, packet: &RtpPacket) {
        match self {
            PlcEngine::Audio(plc) => plc.process_packet(packet),
            PlcEngine::Video(plc) => plc.process_packet(packet),
        }
    }

    /// Synthesize a substitute for a lost packet
    pub fn conceal(&mut self, ext_seq: u64) -> Option<ConcealedFrame> {
        let payload = match self {
            PlcEngine::Audio(plc) => plc.conceal(ext_seq),
            PlcEngine::Video(plc) => plc.conceal(ext_seq),
        }?;
        Some(ConcealedFrame { ext_seq, payload })
    }

    /// Whether the controller should escalate a keyframe request
    pub fn needs_keyframe(&self) -> bool {
        match self {
            PlcEngine::Audio(plc) => plc.is_degraded(),
            PlcEngine::Video(plc) => plc.needs_keyframe(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            PlcEngine::Audio(plc) => plc.reset(),
            PlcEngine::Video(plc) => plc.reset(),
        }
    }
}
