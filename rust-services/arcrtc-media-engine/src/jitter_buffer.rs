//! Adaptive jitter buffer
//!
//! Reorders incoming packets by extended sequence number and releases them
//! strictly in order. Missing slots turn into explicit gaps once the head
//! is overdue, so the concealment engine can synthesize a substitute. The
//! target depth adapts to measured jitter and loss.
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


use crate::config::JitterConfig;
use crate::rtp_codec::RtpPacket;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Hard cap on how far ahead of the head a packet may land; anything
/// further is discarded rather than ballooning the ring
const MAX_FORWARD_SPAN: u64 = 4096;

/// Outcome of pushing a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Packet stored, pending in-order delivery
    Buffered,
    /// Packet is older than the delivery head; discarded
    Late,
    /// Slot already occupied; discarded
    Duplicate,
    /// Packet is too far ahead of the head; discarded
    TooFarAhead,
}

/// Outcome of polling the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopResult {
    /// Next in-order packet and its extended sequence
    Packet {
        ext_seq: u64,
        packet: Box<RtpPacket>,
    },
    /// The packet with this extended sequence is overdue and presumed
    /// lost; the caller should conceal it
    Gap(u64),
    /// Nothing deliverable yet
    NotYet,
}

/// Per-stream jitter buffer keyed by extended sequence number
pub struct JitterBuffer {
    slots: BTreeMap<u64, (RtpPacket, Instant)>,
    /// Next extended sequence to deliver; None until the first push
    head: Option<u64>,
    target_depth: Duration,
    min_depth: Duration,
    max_depth: Duration,
    // Counters
    delivered: u64,
    late_dropped: u64,
    duplicates: u64,
    gaps: u64,
}

impl JitterBuffer {
    /// Create a buffer from depth bounds
    pub fn new(config: &JitterConfig) -> Self {
        JitterBuffer {
            slots: BTreeMap::new(),
            head: None,
            target_depth: Duration::from_millis(config.initial_depth_ms as u64),
            min_depth: Duration::from_millis(config.min_depth_ms as u64),
            max_depth: Duration::from_millis(config.max_depth_ms as u64),
            delivered: 0,
            late_dropped: 0,
            duplicates: 0,
            gaps: 0,
        }
    }

    /// Insert a packet at its extended sequence slot
    pub fn push(&mut self, ext_seq: u64, packet: RtpPacket) -> PushResult {
        if let Some(head) = self.head {
            if ext_seq < head {
                self.late_dropped += 1;
                return PushResult::Late;
            }
            if ext_seq > head + MAX_FORWARD_SPAN {
                self.late_dropped += 1;
                return PushResult::TooFarAhead;
            }
        }
        if self.slots.contains_key(&ext_seq) {
            self.duplicates += 1;
            return PushResult::Duplicate;
        }

        self.slots.insert(ext_seq, (packet, Instant::now()));
        if self.head.is_none() {
            self.head = Some(ext_seq);
        }
        PushResult::Buffered
    }

    /// Poll for the next in-order packet
    ///
    /// Delivered extended sequences are strictly increasing: a slot is
    /// returned exactly once, and a skipped slot surfaces exactly once as
    /// a gap.
    pub fn pop(&mut self) -> PopResult {
        let head = match self.head {
            Some(head) => head,
            None => return PopResult::NotYet,
        };

        if let Some((packet, _)) = self.slots.remove(&head) {
            self.head = Some(head + 1);
            self.delivered += 1;
            return PopResult::Packet {
                ext_seq: head,
                packet: Box::new(packet),
            };
        }

        // Head slot missing. Declare a gap only when a newer packet has
        // been waiting longer than the target depth.
        match self.slots.iter().next() {
            Some((_, (_, arrival))) if arrival.elapsed() >= self.target_depth => {
                self.head = Some(head + 1);
                self.gaps += 1;
                PopResult::Gap(head)
            }
            _ => PopResult::NotYet,
        }
    }

    /// Recompute the target depth from current jitter and loss estimates
    ///
    /// target = clamp(2·jitter + 5·loss·max_depth, min_depth, max_depth)
    pub fn adapt(&mut self, jitter_ms: f64, loss_rate: f32) {
        let raw_ms = 2.0 * jitter_ms + 5.0 * loss_rate as f64 * self.max_depth.as_millis() as f64;
        let clamped = raw_ms
            .round()
            .clamp(self.min_depth.as_millis() as f64, self.max_depth.as_millis() as f64);
        self.target_depth = Duration::from_millis(clamped as u64);
    }

    /// Current adaptive target depth
    pub fn target_depth(&self) -> Duration {
        self.target_depth
    }

    /// Buffered packet count
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the buffer holds no packets
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Packets delivered in order so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Late or out-of-range packets discarded
    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Duplicate slots discarded
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Gaps surfaced to the concealment engine
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Drop all buffered packets and reset ordering state
    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
    }
}
