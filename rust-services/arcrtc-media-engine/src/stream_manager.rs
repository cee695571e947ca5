//! Stream lifecycle and packet routing
//!
//! `StreamManager` owns every live stream, enforces the stream state
//! machine, and runs the per-stream packet pipelines: inbound datagrams
//! flow crypto -> jitter buffer -> concealment -> consumer, outbound
//! packets are stamped with in-band quality bits and sealed.
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


use crate::config::MediaEngineConfig;
use crate::error::{CryptoError, MediaEngineError, MediaEngineResult, StateError};
use crate::jitter_buffer::{JitterBuffer, PopResult, PushResult};
use crate::packet_loss_concealment::PlcEngine;
use crate::connection_health::HealthMonitor;
use crate::quality_adaptation::{AdaptController, AdaptDecision, AdaptReason, QualityLevel};
use crate::rtp_codec::{ArcExtension, PacketPriority, RtpHeader, RtpPacket};
use crate::srtp_session::{CryptoSession, SequenceExtender};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Codecs this engine can carry
const SUPPORTED_CODECS: &[&str] = &["opus", "pcmu", "pcma", "g722", "h264", "vp8", "vp9", "av1"];

/// Media kind of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// RTP media clock rate in Hz
    pub fn clock_rate(&self) -> u32 {
        match self {
            MediaKind::Audio => 48_000,
            MediaKind::Video => 90_000,
        }
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is being initialized
    Initializing,
    /// Stream is active and sending/receiving
    Active,
    /// Stream is paused
    Paused,
    /// Stream is stopped
    Stopped,
    /// Stream has encountered an error (terminal)
    Error,
}

impl StreamState {
    /// Valid transitions:
    /// - Initializing -> Active
    /// - Active <-> Paused
    /// - {Initializing, Active, Paused} -> Stopped
    /// - Any -> Error
    pub fn can_transition(self, to: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, to),
            (Initializing, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Initializing, Stopped)
                | (Active, Stopped)
                | (Paused, Stopped)
                | (_, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Initializing => "initializing",
            StreamState::Active => "active",
            StreamState::Paused => "paused",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        }
    }
}

/// SRTP master key material for an encrypted stream
#[derive(Clone)]
pub struct SrtpStreamKeys {
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

/// Stream configuration
#[derive(Clone)]
pub struct StreamConfig {
    /// Owning session
    pub session_id: Uuid,
    /// Media kind (audio or video)
    pub media_kind: MediaKind,
    /// SSRC for this stream; unique within the session
    pub ssrc: u32,
    /// Payload type
    pub payload_type: u8,
    /// Codec name
    pub codec: String,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Remote endpoint for outbound datagrams
    pub remote_endpoint: SocketAddr,
    /// Master key material; None runs the stream in the clear
    pub srtp_keys: Option<SrtpStreamKeys>,
}

/// Stream statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Gaps surfaced by the jitter buffer plus queue drops
    pub packets_lost: u64,
    pub packets_concealed: u64,
    pub replayed: u64,
    pub auth_failures: u64,
    pub parse_errors: u64,
    pub late_dropped: u64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
    pub loss_rate: f32,
    pub jitter_target_ms: u64,
    pub quality_level: Option<QualityLevel>,
    pub needs_keyframe: bool,
    /// The SRTP context wants fresh keys (packet budget or age)
    pub key_rotation_due: bool,
}

/// A frame released to the consumer, real or concealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredFrame {
    /// In-order packet from the network
    Packet { ext_seq: u64, packet: RtpPacket },
    /// Substitute synthesized by the concealment engine
    Concealed { ext_seq: u64, payload: Bytes },
}

impl DeliveredFrame {
    pub fn ext_seq(&self) -> u64 {
        match self {
            DeliveredFrame::Packet { ext_seq, .. } => *ext_seq,
            DeliveredFrame::Concealed { ext_seq, .. } => *ext_seq,
        }
    }
}

/// One live media stream and its pipeline state
pub struct Stream {
    pub stream_id: Uuid,
    config: StreamConfig,
    state: StreamState,
    crypto: Option<CryptoSession>,
    /// Extended-sequence tracking for unencrypted streams
    extender: SequenceExtender,
    jitter: JitterBuffer,
    plc: PlcEngine,
    health: HealthMonitor,
    adapt: AdaptController,
    stats: StreamStats,
    /// Auth failures in the current one-second window
    auth_fail_window: (Instant, u32),
}

impl Stream {
    fn new(stream_id: Uuid, config: StreamConfig, engine_config: &MediaEngineConfig) -> MediaEngineResult<Self> {
        let crypto = match config.srtp_keys {
            Some(ref keys) => Some(
                CryptoSession::with_max_key_age(
                    engine_config.crypto.suite,
                    &keys.master_key,
                    &keys.master_salt,
                    config.ssrc,
                    engine_config.crypto.replay_window_size,
                    engine_config.crypto.key_rotation_packets,
                    Duration::from_secs(engine_config.crypto.key_rotation_interval_s),
                )
                .map_err(MediaEngineError::Crypto)?,
            ),
            None => None,
        };

        let plc = match config.media_kind {
            MediaKind::Audio => PlcEngine::audio(engine_config.plc.clone()),
            MediaKind::Video => PlcEngine::video(engine_config.plc.clone()),
        };

        let initial_level = initial_quality_level(config.media_kind, config.bitrate);

        Ok(Stream {
            stream_id,
            health: HealthMonitor::with_clock_rate(config.media_kind.clock_rate()),
            jitter: JitterBuffer::new(&engine_config.jitter),
            adapt: AdaptController::new(engine_config.adapt.clone(), initial_level),
            plc,
            crypto,
            extender: SequenceExtender::new(),
            state: StreamState::Initializing,
            stats: StreamStats::default(),
            auth_fail_window: (Instant::now(), 0),
            config,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.config.session_id
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    pub fn media_kind(&self) -> MediaKind {
        self.config.media_kind
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.config.remote_endpoint
    }

    /// Current quality level chosen by the adaptation controller
    pub fn quality_level(&self) -> QualityLevel {
        self.adapt.level()
    }

    /// Rotate this stream's SRTP keys
    pub fn rotate_keys(&mut self, master_key: &[u8], master_salt: &[u8]) -> MediaEngineResult<()> {
        match self.crypto {
            Some(ref mut session) => session
                .rotate(master_key, master_salt)
                .map_err(MediaEngineError::Crypto),
            None => Err(MediaEngineError::Crypto(CryptoError::InvalidKey(
                "stream is not encrypted".to_string(),
            ))),
        }
    }

    /// Feed a peer reception report into this stream's health monitor
    pub fn ingest_reception_report(&mut self, report: &crate::rtcp::ReceptionReport) {
        self.health.record_reception_report(report);
    }

    /// Auth failures observed in the last second
    pub fn auth_failures_last_second(&self) -> u32 {
        if self.auth_fail_window.0.elapsed() > Duration::from_secs(1) {
            0
        } else {
            self.auth_fail_window.1
        }
    }

    fn note_auth_failure(&mut self, now: Instant) {
        self.stats.auth_failures += 1;
        if now.duration_since(self.auth_fail_window.0) > Duration::from_secs(1) {
            self.auth_fail_window = (now, 1);
        } else {
            self.auth_fail_window.1 += 1;
        }
    }

    /// Run one inbound datagram through crypto and into the jitter buffer
    fn process_inbound(&mut self, bytes: &[u8], now: Instant) -> MediaEngineResult<()> {
        let (packet, ext_seq) = match self.crypto {
            Some(ref mut session) => match session.open(bytes) {
                Ok(opened) => opened,
                Err(e) => {
                    match e {
                        MediaEngineError::Crypto(CryptoError::AuthFailed) => {
                            self.note_auth_failure(now)
                        }
                        MediaEngineError::Crypto(CryptoError::ReplayDetected(_)) => {
                            self.stats.replayed += 1
                        }
                        MediaEngineError::Parse(_) => self.stats.parse_errors += 1,
                        _ => {}
                    }
                    return Err(e);
                }
            },
            None => {
                let packet = match RtpPacket::parse(bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        self.stats.parse_errors += 1;
                        return Err(e.into());
                    }
                };
                let ext_seq = self.extender.extend(packet.header.sequence_number);
                (packet, ext_seq)
            }
        };

        self.stats.packets_received += 1;
        self.stats.bytes_received += bytes.len() as u64;
        self.health.record_arrival(ext_seq, packet.header.timestamp, now);

        match self.jitter.push(ext_seq, packet) {
            PushResult::Buffered => {}
            PushResult::Late | PushResult::TooFarAhead => self.stats.late_dropped += 1,
            PushResult::Duplicate => self.stats.replayed += 1,
        }
        Ok(())
    }

    /// Drain everything the jitter buffer will release, concealing gaps
    fn poll_deliverable(&mut self) -> Vec<DeliveredFrame> {
        let mut frames = Vec::new();
        loop {
            match self.jitter.pop() {
                PopResult::Packet { ext_seq, packet } => {
                    self.plc.process_packet(&packet);
                    frames.push(DeliveredFrame::Packet {
                        ext_seq,
                        packet: *packet,
                    });
                }
                PopResult::Gap(ext_seq) => {
                    self.stats.packets_lost += 1;
                    if let Some(concealed) = self.plc.conceal(ext_seq) {
                        self.stats.packets_concealed += 1;
                        frames.push(DeliveredFrame::Concealed {
                            ext_seq,
                            payload: concealed.payload,
                        });
                    }
                    if self.plc.needs_keyframe() {
                        self.adapt.request_keyframe();
                    }
                }
                PopResult::NotYet => break,
            }
        }
        frames
    }

    /// Stamp quality bits, seal, and account one outbound packet
    fn prepare_outbound(&mut self, mut packet: RtpPacket) -> MediaEngineResult<Bytes> {
        packet.header.set_arc_extension(ArcExtension {
            quality: self.adapt.indicator(),
            priority: outbound_priority(self.config.media_kind, &packet.header),
        });

        let bytes = match self.crypto {
            Some(ref mut session) => session.seal(&packet)?,
            None => packet.serialize(),
        };

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(bytes)
    }

    /// Periodic adaptation: refresh health sample, retune the jitter
    /// target, and evaluate a quality decision
    fn adapt_tick(&mut self, now: Instant) -> Option<AdaptDecision> {
        let sample = self.health.sample();
        self.jitter.adapt(sample.jitter_ms, sample.loss_rate);
        self.adapt.evaluate_at(&sample, now)
    }

    fn snapshot_stats(&self) -> StreamStats {
        let mut stats = self.stats.clone();
        stats.jitter_ms = self.health.jitter_ms();
        stats.rtt_ms = self.health.rtt_ms();
        stats.loss_rate = self.health.loss_rate();
        stats.jitter_target_ms = self.jitter.target_depth().as_millis() as u64;
        stats.late_dropped = self.jitter.late_dropped();
        stats.quality_level = Some(self.adapt.level());
        stats.needs_keyframe = self.plc.needs_keyframe();
        stats.key_rotation_due = self
            .crypto
            .as_ref()
            .map(|c| c.rotation_due())
            .unwrap_or(false);
        stats
    }
}

/// Audio is critical; video keyframes outrank delta frames
fn outbound_priority(kind: MediaKind, header: &RtpHeader) -> PacketPriority {
    match kind {
        MediaKind::Audio => PacketPriority::Critical,
        MediaKind::Video if header.marker => PacketPriority::High,
        MediaKind::Video => PacketPriority::Medium,
    }
}

/// Highest ladder level whose bitrate fits the configured target
fn initial_quality_level(kind: MediaKind, bitrate: u32) -> QualityLevel {
    let ladder = [
        QualityLevel::Ultra,
        QualityLevel::High,
        QualityLevel::Medium,
        QualityLevel::Low,
        QualityLevel::VeryLow,
    ];
    for level in ladder {
        let required = match kind {
            MediaKind::Audio => level.audio_bitrate_bps(),
            MediaKind::Video => level.video_profile().bitrate_bps,
        };
        if bitrate >= required {
            return level;
        }
    }
    QualityLevel::VeryLow
}

/// Owner of all live streams
pub struct StreamManager {
    config: MediaEngineConfig,
    streams: HashMap<Uuid, Stream>,
    ssrc_index: HashMap<u32, Uuid>,
}

impl StreamManager {
    pub fn new(config: MediaEngineConfig) -> Self {
        StreamManager {
            config,
            streams: HashMap::new(),
            ssrc_index: HashMap::new(),
        }
    }

    /// Create a stream in the Initializing state under a fresh id
    pub fn create_stream(&mut self, config: StreamConfig) -> MediaEngineResult<Uuid> {
        let stream_id = Uuid::new_v4();
        self.create_stream_with_id(stream_id, config)?;
        Ok(stream_id)
    }

    /// Create a stream under a caller-chosen id (the signaling stream id)
    pub fn create_stream_with_id(
        &mut self,
        stream_id: Uuid,
        config: StreamConfig,
    ) -> MediaEngineResult<()> {
        if self.ssrc_index.contains_key(&config.ssrc) {
            return Err(StateError::DuplicateSsrc(config.ssrc).into());
        }
        if self.streams.contains_key(&stream_id) {
            return Err(StateError::DuplicateSsrc(config.ssrc).into());
        }
        if !SUPPORTED_CODECS.contains(&config.codec.to_ascii_lowercase().as_str()) {
            return Err(StateError::UnsupportedCodec(config.codec.clone()).into());
        }

        let ssrc = config.ssrc;
        let stream = Stream::new(stream_id, config, &self.config)?;

        self.streams.insert(stream_id, stream);
        self.ssrc_index.insert(ssrc, stream_id);
        Ok(())
    }

    /// Enforce the stream state machine
    pub fn update_state(&mut self, stream_id: Uuid, new_state: StreamState) -> MediaEngineResult<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StateError::UnknownStream(stream_id))?;

        if !stream.state.can_transition(new_state) {
            return Err(StateError::InvalidTransition {
                from: stream.state.as_str().to_string(),
                to: new_state.as_str().to_string(),
            }
            .into());
        }
        stream.state = new_state;
        Ok(())
    }

    /// Dispatch an inbound datagram to the owning stream's pipeline
    ///
    /// Returns the stream that consumed the packet so the caller can poll
    /// its deliverable frames.
    pub fn route_inbound(&mut self, bytes: &[u8]) -> MediaEngineResult<Uuid> {
        let (header, _) = RtpHeader::parse(bytes)?;
        let stream_id = *self
            .ssrc_index
            .get(&header.ssrc)
            .ok_or(StateError::UnknownSsrc(header.ssrc))?;

        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StateError::UnknownStream(stream_id))?;

        // Paused and not-yet-active streams drop inbound media
        if stream.state != StreamState::Active {
            return Ok(stream_id);
        }

        stream.process_inbound(bytes, Instant::now())?;
        Ok(stream_id)
    }

    /// Pull in-order frames (including concealed ones) for a stream
    pub fn poll_stream(&mut self, stream_id: Uuid) -> MediaEngineResult<Vec<DeliveredFrame>> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StateError::UnknownStream(stream_id))?;
        Ok(stream.poll_deliverable())
    }

    /// Seal an outbound packet and return the wire bytes with their
    /// destination; the caller hands them to the transport sink
    pub fn route_outbound(
        &mut self,
        stream_id: Uuid,
        packet: RtpPacket,
    ) -> MediaEngineResult<(SocketAddr, Bytes)> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StateError::UnknownStream(stream_id))?;

        if stream.state != StreamState::Active {
            return Err(StateError::InvalidTransition {
                from: stream.state.as_str().to_string(),
                to: "sending".to_string(),
            }
            .into());
        }

        let endpoint = stream.config.remote_endpoint;
        let bytes = stream.prepare_outbound(packet)?;
        Ok((endpoint, bytes))
    }

    /// Run the adaptation tick across all active streams
    pub fn adapt_tick(&mut self, now: Instant) -> Vec<(Uuid, AdaptDecision)> {
        let mut decisions = Vec::new();
        for (id, stream) in self.streams.iter_mut() {
            if stream.state != StreamState::Active {
                continue;
            }
            if let Some(decision) = stream.adapt_tick(now) {
                decisions.push((*id, decision));
            }
            if stream.adapt.take_keyframe_request() {
                decisions.push((
                    *id,
                    AdaptDecision {
                        level: stream.adapt.level(),
                        direction: crate::quality_adaptation::AdaptDirection::Down,
                        reason: AdaptReason::Keyframe,
                        emergency: false,
                    },
                ));
            }
        }
        decisions
    }

    /// Record a session-level RTT sample on every stream of the session
    pub fn record_session_rtt(&mut self, session_id: Uuid, rtt_ms: f64) {
        for stream in self.streams.values_mut() {
            if stream.config.session_id == session_id {
                stream.health.record_rtt(rtt_ms);
            }
        }
    }

    /// Count a drop caused by inbound queue backpressure
    pub fn record_queue_drop(&mut self, stream_id: Uuid) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.stats.packets_lost += 1;
        }
    }

    pub fn get_stream(&self, stream_id: Uuid) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: Uuid) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn stream_by_ssrc(&self, ssrc: u32) -> Option<Uuid> {
        self.ssrc_index.get(&ssrc).copied()
    }

    /// Statistics snapshot for one stream
    pub fn get_stats(&self, stream_id: Uuid) -> MediaEngineResult<StreamStats> {
        self.streams
            .get(&stream_id)
            .map(|s| s.snapshot_stats())
            .ok_or_else(|| StateError::UnknownStream(stream_id).into())
    }

    /// All stream ids owned by a session
    pub fn session_streams(&self, session_id: Uuid) -> Vec<Uuid> {
        self.streams
            .iter()
            .filter(|(_, s)| s.config.session_id == session_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove a stream and free its SSRC
    pub fn remove_stream(&mut self, stream_id: Uuid) -> MediaEngineResult<()> {
        let stream = self
            .streams
            .remove(&stream_id)
            .ok_or(StateError::UnknownStream(stream_id))?;
        self.ssrc_index.remove(&stream.config.ssrc);
        Ok(())
    }

    /// Tear down every stream of a session; buffered packets are dropped
    pub fn teardown_session(&mut self, session_id: Uuid) {
        let ids = self.session_streams(session_id);
        for id in ids {
            let _ = self.remove_stream(id);
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_codec::RtpHeader;

    fn engine_config() -> MediaEngineConfig {
        MediaEngineConfig::default()
    }

    fn stream_config(ssrc: u32) -> StreamConfig {
        StreamConfig {
            session_id: Uuid::new_v4(),
            media_kind: MediaKind::Audio,
            ssrc,
            payload_type: 96,
            codec: "opus".to_string(),
            bitrate: 64_000,
            remote_endpoint: "127.0.0.1:4000".parse().unwrap(),
            srtp_keys: None,
        }
    }

    fn test_packet(ssrc: u32, seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: seq as u32 * 960,
                ssrc,
                csrc: vec![],
                extension: None,
            },
            payload: Bytes::from(vec![0xAA; 160]),
            padding: Bytes::new(),
        }
    }

    #[test]
    fn test_create_stream() {
        let mut manager = StreamManager::new(engine_config());
        let stream_id = manager.create_stream(stream_config(12345)).unwrap();
        assert_eq!(manager.get_stream(stream_id).unwrap().state(), StreamState::Initializing);
    }

    #[test]
    fn test_duplicate_ssrc_rejected() {
        let mut manager = StreamManager::new(engine_config());
        manager.create_stream(stream_config(12345)).unwrap();
        let err = manager.create_stream(stream_config(12345));
        assert!(matches!(
            err,
            Err(MediaEngineError::State(StateError::DuplicateSsrc(12345)))
        ));
    }

    #[test]
    fn test_unsupported_codec_rejected() {
        let mut manager = StreamManager::new(engine_config());
        let mut config = stream_config(1);
        config.codec = "speex".to_string();
        assert!(matches!(
            manager.create_stream(config),
            Err(MediaEngineError::State(StateError::UnsupportedCodec(_)))
        ));
    }

    #[test]
    fn test_state_machine_valid_paths() {
        let mut manager = StreamManager::new(engine_config());
        let id = manager.create_stream(stream_config(1)).unwrap();

        manager.update_state(id, StreamState::Active).unwrap();
        manager.update_state(id, StreamState::Paused).unwrap();
        manager.update_state(id, StreamState::Active).unwrap();
        manager.update_state(id, StreamState::Stopped).unwrap();
    }

    #[test]
    fn test_state_machine_invalid_paths() {
        let mut manager = StreamManager::new(engine_config());
        let id = manager.create_stream(stream_config(1)).unwrap();

        // Initializing -> Paused is not a valid edge
        assert!(manager.update_state(id, StreamState::Paused).is_err());

        manager.update_state(id, StreamState::Active).unwrap();
        manager.update_state(id, StreamState::Stopped).unwrap();
        // Stopped is terminal except for Error
        assert!(manager.update_state(id, StreamState::Active).is_err());
        manager.update_state(id, StreamState::Error).unwrap();
    }

    #[test]
    fn test_route_inbound_unknown_ssrc() {
        let mut manager = StreamManager::new(engine_config());
        let wire = test_packet(999, 1).serialize();
        assert!(matches!(
            manager.route_inbound(&wire),
            Err(MediaEngineError::State(StateError::UnknownSsrc(999)))
        ));
    }

    #[test]
    fn test_inbound_pipeline_delivers_in_order() {
        let mut manager = StreamManager::new(engine_config());
        let id = manager.create_stream(stream_config(12345)).unwrap();
        manager.update_state(id, StreamState::Active).unwrap();

        for seq in [1000u16, 1001, 1003, 1002, 1004] {
            let wire = test_packet(12345, seq).serialize();
            assert_eq!(manager.route_inbound(&wire).unwrap(), id);
        }

        let frames = manager.poll_stream(id).unwrap();
        let seqs: Vec<u64> = frames.iter().map(|f| f.ext_seq()).collect();
        assert_eq!(seqs, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn test_outbound_stamps_quality_bits() {
        let mut manager = StreamManager::new(engine_config());
        let id = manager.create_stream(stream_config(12345)).unwrap();
        manager.update_state(id, StreamState::Active).unwrap();

        let (endpoint, bytes) = manager
            .route_outbound(id, test_packet(12345, 1))
            .unwrap();
        assert_eq!(endpoint, "127.0.0.1:4000".parse().unwrap());

        let parsed = RtpPacket::parse(&bytes).unwrap();
        let arc = parsed.header.arc_extension().unwrap();
        assert_eq!(arc.priority, PacketPriority::Critical);
    }

    #[test]
    fn test_outbound_requires_active() {
        let mut manager = StreamManager::new(engine_config());
        let id = manager.create_stream(stream_config(12345)).unwrap();
        assert!(manager.route_outbound(id, test_packet(12345, 1)).is_err());
    }

    #[test]
    fn test_encrypted_pipeline_roundtrip() {
        let keys = SrtpStreamKeys {
            master_key: vec![0x41; 16],
            master_salt: vec![0x52; 14],
        };

        let mut sender = StreamManager::new(engine_config());
        let mut send_cfg = stream_config(777);
        send_cfg.srtp_keys = Some(keys.clone());
        let send_id = sender.create_stream(send_cfg).unwrap();
        sender.update_state(send_id, StreamState::Active).unwrap();

        let mut receiver = StreamManager::new(engine_config());
        let mut recv_cfg = stream_config(777);
        recv_cfg.srtp_keys = Some(keys);
        let recv_id = receiver.create_stream(recv_cfg).unwrap();
        receiver.update_state(recv_id, StreamState::Active).unwrap();

        let (_, wire) = sender.route_outbound(send_id, test_packet(777, 42)).unwrap();
        receiver.route_inbound(&wire).unwrap();

        let frames = receiver.poll_stream(recv_id).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DeliveredFrame::Packet { packet, .. } => {
                assert_eq!(packet.header.sequence_number, 42);
                assert_eq!(packet.payload, Bytes::from(vec![0xAA; 160]));
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_counted_per_stream() {
        let keys = SrtpStreamKeys {
            master_key: vec![0x41; 16],
            master_salt: vec![0x52; 14],
        };

        let mut sender = StreamManager::new(engine_config());
        let mut send_cfg = stream_config(777);
        send_cfg.srtp_keys = Some(keys.clone());
        let send_id = sender.create_stream(send_cfg).unwrap();
        sender.update_state(send_id, StreamState::Active).unwrap();

        let mut receiver = StreamManager::new(engine_config());
        let mut recv_cfg = stream_config(777);
        recv_cfg.srtp_keys = Some(keys);
        let recv_id = receiver.create_stream(recv_cfg).unwrap();
        receiver.update_state(recv_id, StreamState::Active).unwrap();

        let (_, wire) = sender.route_outbound(send_id, test_packet(777, 2000)).unwrap();
        receiver.route_inbound(&wire).unwrap();
        assert!(matches!(
            receiver.route_inbound(&wire),
            Err(MediaEngineError::Crypto(CryptoError::ReplayDetected(_)))
        ));

        let stats = receiver.get_stats(recv_id).unwrap();
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.packets_received, 1);
    }

    #[test]
    fn test_session_teardown_removes_streams() {
        let mut manager = StreamManager::new(engine_config());
        let session_id = Uuid::new_v4();

        let mut a = stream_config(1);
        a.session_id = session_id;
        let mut b = stream_config(2);
        b.session_id = session_id;

        manager.create_stream(a).unwrap();
        manager.create_stream(b).unwrap();
        assert_eq!(manager.stream_count(), 2);

        manager.teardown_session(session_id);
        assert_eq!(manager.stream_count(), 0);
        assert!(manager.stream_by_ssrc(1).is_none());
    }

    #[test]
    fn test_initial_quality_from_bitrate() {
        assert_eq!(
            initial_quality_level(MediaKind::Video, 3_000_000),
            QualityLevel::High
        );
        assert_eq!(
            initial_quality_level(MediaKind::Video, 100_000),
            QualityLevel::VeryLow
        );
        assert_eq!(
            initial_quality_level(MediaKind::Audio, 64_000),
            QualityLevel::Medium
        );
    }
}
