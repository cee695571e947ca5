//! ArcSignaling protocol implementation
//!
//! Message-driven state machine for session establishment, stream
//! start/stop, heartbeat and quality adaptation. Messages are text-framed
//! JSON over a closed set of types; unknown tags are parse errors. The
//! engine owns session state and emits actions (replies, key installs,
//! stream lifecycle commands) that the media engine executes, so the
//! signaling layer never touches packet state itself.
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


use crate::config::{CryptoSuite, MediaEngineConfig};
use crate::error::{CryptoError, MediaEngineResult, ParseError, StateError};
use crate::srtp_session::SESSION_SALT_LEN;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

/// Protocol version spoken by this engine
pub const PROTOCOL_VERSION: &str = "1.0";

/// Audio codecs in preference order
const AUDIO_CODEC_PREFERENCE: &[&str] = &["opus", "g722", "pcmu", "pcma"];

/// Video codecs in preference order
const VIDEO_CODEC_PREFERENCE: &[&str] = &["h264", "vp9", "vp8", "av1"];

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Peer capability announcement carried by CONNECT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerCapabilities {
    /// Codec names the peer can send and receive
    pub codecs: Vec<String>,
    /// Resolutions the peer can render, e.g. "1280x720"
    pub resolutions: Vec<String>,
    /// Supported encryption suites
    pub encryption: Vec<String>,
    /// Supported transports, e.g. "udp"
    pub transport: Vec<String>,
}

/// NAT classification reported by the connecting peer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Open,
    FullCone,
    Restricted,
    PortRestricted,
    Symmetric,
    Unknown,
}

/// Connecting peer's observed network location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub public_ip: String,
    pub public_port: u16,
    pub nat_type: NatType,
}

/// Relay candidate offered to peers that cannot connect directly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayServer {
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Lower is preferred
    pub priority: u8,
}

/// CONNECT: open a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connect {
    pub version: String,
    pub session_id: Uuid,
    pub peer_id: Uuid,
    pub capabilities: PeerCapabilities,
    pub network_info: NetworkInfo,
    /// Hex-encoded X25519 public key for the ECDH exchange
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub timestamp: i64,
}

/// Codecs selected by the accepting side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectedCodecs {
    pub audio: String,
    pub video: String,
}

/// Relay candidates granted with the acceptance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckNetworkInfo {
    pub relay_servers: Vec<RelayServer>,
}

/// Encryption parameters settled by the acceptance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionParams {
    pub algorithm: String,
    pub key_exchange: String,
    /// Hex-encoded X25519 public key of the accepting side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// CONNECT_ACK: accept or refuse a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAck {
    pub session_id: Uuid,
    pub peer_id: Uuid,
    pub accepted: bool,
    pub selected_codecs: SelectedCodecs,
    pub network_info: AckNetworkInfo,
    pub encryption: EncryptionParams,
    pub timestamp: i64,
}

/// Media carried by a starting stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Audio,
    Video,
    Both,
}

/// Codec parameters for a starting stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodecParams {
    pub name: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Per-stream encryption reference; algorithm "none" runs in the clear
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamEncryption {
    pub key_id: String,
    pub algorithm: String,
}

/// STREAM_START: begin a media flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStart {
    pub session_id: Uuid,
    pub stream_id: Uuid,
    pub stream_type: StreamType,
    pub codec: CodecParams,
    pub ssrc: u32,
    pub encryption: StreamEncryption,
    pub timestamp: i64,
}

/// Why a stream stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequest,
    Error,
    Timeout,
}

/// STREAM_STOP: end a media flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStop {
    pub session_id: Uuid,
    pub stream_id: Uuid,
    pub reason: StopReason,
    pub timestamp: i64,
}

/// Quality parameters being applied
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualitySpec {
    pub bitrate: u32,
    pub resolution: String,
    pub fps: u32,
}

/// Why quality changed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    Bandwidth,
    Cpu,
    Network,
    Keyframe,
}

/// QUALITY_ADAPT: change stream quality or request a keyframe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityAdapt {
    pub session_id: Uuid,
    pub stream_id: Uuid,
    pub quality: QualitySpec,
    pub reason: QualityReason,
    pub timestamp: i64,
}

/// HEARTBEAT: liveness probe; the sequence attributes the ack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub session_id: Uuid,
    pub sequence: u64,
    pub timestamp: i64,
}

/// HEARTBEAT_ACK: mirror of a heartbeat with receive-side timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub session_id: Uuid,
    pub sequence: u64,
    pub original_timestamp: i64,
    pub response_timestamp: i64,
    pub latency_ms: i64,
}

/// The closed set of ArcSignaling messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "CONNECT")]
    Connect(Connect),
    #[serde(rename = "CONNECT_ACK")]
    ConnectAck(ConnectAck),
    #[serde(rename = "STREAM_START")]
    StreamStart(StreamStart),
    #[serde(rename = "STREAM_STOP")]
    StreamStop(StreamStop),
    #[serde(rename = "QUALITY_ADAPT")]
    QualityAdapt(QualityAdapt),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck(HeartbeatAck),
}

impl SignalingMessage {
    /// Parse a text-framed message; unknown tags and missing fields are
    /// parse errors
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        serde_json::from_str(text).map_err(|e| ParseError::MalformedSignaling(e.to_string()))
    }

    /// Serialize to the wire framing
    pub fn to_json(&self) -> Result<String, ParseError> {
        serde_json::to_string(self).map_err(|e| ParseError::MalformedSignaling(e.to_string()))
    }

    /// Session the message belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            SignalingMessage::Connect(m) => m.session_id,
            SignalingMessage::ConnectAck(m) => m.session_id,
            SignalingMessage::StreamStart(m) => m.session_id,
            SignalingMessage::StreamStop(m) => m.session_id,
            SignalingMessage::QualityAdapt(m) => m.session_id,
            SignalingMessage::Heartbeat(m) => m.session_id,
            SignalingMessage::HeartbeatAck(m) => m.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Established,
    Closing,
    Closed,
}

struct HeartbeatTracker {
    next_sequence: u64,
    /// sequence -> send instant, for RTT attribution
    outstanding: HashMap<u64, Instant>,
    last_ack: Instant,
    last_sent: Option<Instant>,
}

impl HeartbeatTracker {
    fn new() -> Self {
        HeartbeatTracker {
            next_sequence: 1,
            outstanding: HashMap::new(),
            last_ack: Instant::now(),
            last_sent: None,
        }
    }
}

/// One negotiated association between two peers
pub struct SignalingSession {
    pub session_id: Uuid,
    pub remote_peer_id: Uuid,
    state: SessionState,
    suite: CryptoSuite,
    /// Ephemeral ECDH secret for this session
    local_secret: StaticSecret,
    heartbeat: HeartbeatTracker,
    created_at: Instant,
}

impl SignalingSession {
    fn new(session_id: Uuid, remote_peer_id: Uuid, suite: CryptoSuite) -> Self {
        SignalingSession {
            session_id,
            remote_peer_id,
            state: SessionState::Idle,
            suite,
            local_secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
            heartbeat: HeartbeatTracker::new(),
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn local_public_key_hex(&self) -> String {
        hex::encode(PublicKey::from(&self.local_secret).as_bytes())
    }

    /// X25519 + HKDF-SHA256 over the shared secret yields the session's
    /// master key and salt; the session id binds the derivation
    fn derive_master_material(
        &self,
        peer_public_hex: &str,
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let raw = hex::decode(peer_public_hex)
            .map_err(|_| CryptoError::InvalidKey("peer public key is not hex".to_string()))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("peer public key must be 32 bytes".to_string()))?;
        let shared = self.local_secret.diffie_hellman(&PublicKey::from(raw));

        let hkdf = Hkdf::<Sha256>::new(Some(self.session_id.as_bytes()), shared.as_bytes());
        let mut master_key = vec![0u8; self.suite.key_len()];
        hkdf.expand(b"arcrtc-session-key", &mut master_key)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;
        let mut master_salt = vec![0u8; SESSION_SALT_LEN];
        hkdf.expand(b"arcrtc-session-salt", &mut master_salt)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;
        Ok((master_key, master_salt))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Side effect requested by the signaling state machine
///
/// The caller (the media engine) executes these; the signaling engine
/// itself never mutates stream or key state.
#[derive(Debug, Clone)]
pub enum SignalingAction {
    /// Send a message on the session's signaling channel
    Send {
        session_id: Uuid,
        message: SignalingMessage,
    },
    /// Install session master key material in the key provider
    InstallKeys {
        session_id: Uuid,
        master_key: Vec<u8>,
        master_salt: Vec<u8>,
    },
    /// Create and activate a stream
    StartStream {
        session_id: Uuid,
        stream_id: Uuid,
        stream_type: StreamType,
        codec: CodecParams,
        ssrc: u32,
        encrypted: bool,
        key_id: String,
    },
    /// Stop a stream
    StopStream {
        session_id: Uuid,
        stream_id: Uuid,
        reason: StopReason,
    },
    /// Forward a peer quality request to the local encoder interface
    ApplyQuality {
        session_id: Uuid,
        stream_id: Uuid,
        quality: QualitySpec,
        reason: QualityReason,
    },
    /// Record a measured signaling round trip
    RecordRtt { session_id: Uuid, rtt_ms: f64 },
    /// Tear down every stream of the session and release its keys
    TeardownSession {
        session_id: Uuid,
        reason: StopReason,
    },
}

/// ArcSignaling engine: owns all session registries
///
/// One instance per media engine; no process-global state. Messages on a
/// single session channel must be fed in arrival order.
pub struct ArcSignalingEngine {
    local_peer_id: Uuid,
    suite: CryptoSuite,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    reply_timeout: Duration,
    relay_servers: Vec<RelayServer>,
    sessions: HashMap<Uuid, SignalingSession>,
}

impl ArcSignalingEngine {
    pub fn new(
        local_peer_id: Uuid,
        config: &MediaEngineConfig,
        relay_servers: Vec<RelayServer>,
    ) -> Self {
        let interval = Duration::from_millis(config.session.heartbeat_interval_ms);
        ArcSignalingEngine {
            local_peer_id,
            suite: config.crypto.suite,
            heartbeat_interval: interval,
            heartbeat_timeout: interval * config.session.heartbeat_timeout_multiplier,
            reply_timeout: Duration::from_millis(config.session.signaling_reply_timeout_ms),
            relay_servers,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, session_id: Uuid) -> Option<&SignalingSession> {
        self.sessions.get(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Initiate a session toward a peer: creates local state in
    /// Negotiating and returns the CONNECT to send
    pub fn initiate(
        &mut self,
        session_id: Uuid,
        capabilities: PeerCapabilities,
        network_info: NetworkInfo,
    ) -> MediaEngineResult<SignalingMessage> {
        if self.sessions.contains_key(&session_id) {
            return Err(StateError::InvalidTransition {
                from: format!("{:?}", self.sessions[&session_id].state),
                to: "Negotiating".to_string(),
            }
            .into());
        }
        let mut session = SignalingSession::new(session_id, Uuid::nil(), self.suite);
        session.state = SessionState::Negotiating;
        let public_key = session.local_public_key_hex();
        self.sessions.insert(session_id, session);

        Ok(SignalingMessage::Connect(Connect {
            version: PROTOCOL_VERSION.to_string(),
            session_id,
            peer_id: self.local_peer_id,
            capabilities,
            network_info,
            public_key: Some(public_key),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }))
    }

    /// Feed one inbound message; returns the actions to execute
    pub fn handle_message(
        &mut self,
        message: SignalingMessage,
    ) -> MediaEngineResult<Vec<SignalingAction>> {
        match message {
            SignalingMessage::Connect(msg) => self.handle_connect(msg),
            SignalingMessage::ConnectAck(msg) => self.handle_connect_ack(msg),
            SignalingMessage::StreamStart(msg) => self.handle_stream_start(msg),
            SignalingMessage::StreamStop(msg) => self.handle_stream_stop(msg),
            SignalingMessage::QualityAdapt(msg) => self.handle_quality_adapt(msg),
            SignalingMessage::Heartbeat(msg) => self.handle_heartbeat(msg),
            SignalingMessage::HeartbeatAck(msg) => self.handle_heartbeat_ack(msg),
        }
    }

    fn handle_connect(&mut self, msg: Connect) -> MediaEngineResult<Vec<SignalingAction>> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let refusal = |reason: &str| {
            tracing::info!(session_id = %msg.session_id, reason, "Refusing CONNECT");
            SignalingMessage::ConnectAck(ConnectAck {
                session_id: msg.session_id,
                peer_id: self.local_peer_id,
                accepted: false,
                selected_codecs: SelectedCodecs {
                    audio: String::new(),
                    video: String::new(),
                },
                network_info: AckNetworkInfo {
                    relay_servers: vec![],
                },
                encryption: EncryptionParams {
                    algorithm: String::new(),
                    key_exchange: String::new(),
                    public_key: None,
                },
                timestamp: now_ms,
            })
        };

        if msg.version != PROTOCOL_VERSION {
            return Ok(vec![SignalingAction::Send {
                session_id: msg.session_id,
                message: refusal("unsupported version"),
            }]);
        }

        let audio = select_codec(AUDIO_CODEC_PREFERENCE, &msg.capabilities.codecs);
        let video = select_codec(VIDEO_CODEC_PREFERENCE, &msg.capabilities.codecs);
        if audio.is_none() && video.is_none() {
            return Ok(vec![SignalingAction::Send {
                session_id: msg.session_id,
                message: refusal("no common codec"),
            }]);
        }

        let peer_public = match msg.public_key {
            Some(ref key) => key.clone(),
            None => {
                return Ok(vec![SignalingAction::Send {
                    session_id: msg.session_id,
                    message: refusal("missing key exchange material"),
                }]);
            }
        };

        let mut session = SignalingSession::new(msg.session_id, msg.peer_id, self.suite);
        session.state = SessionState::Negotiating;
        let (master_key, master_salt) = session.derive_master_material(&peer_public)?;
        let local_public = session.local_public_key_hex();

        // Accepting side has the full exchange: the session is up once the
        // ack is on the wire
        session.state = SessionState::Established;
        session.heartbeat.last_ack = Instant::now();
        self.sessions.insert(msg.session_id, session);

        let ack = SignalingMessage::ConnectAck(ConnectAck {
            session_id: msg.session_id,
            peer_id: self.local_peer_id,
            accepted: true,
            selected_codecs: SelectedCodecs {
                audio: audio.unwrap_or_default(),
                video: video.unwrap_or_default(),
            },
            network_info: AckNetworkInfo {
                relay_servers: self.relay_candidates(msg.network_info.nat_type),
            },
            encryption: EncryptionParams {
                algorithm: self.suite.as_str().to_string(),
                key_exchange: "x25519".to_string(),
                public_key: Some(local_public),
            },
            timestamp: now_ms,
        });

        Ok(vec![
            SignalingAction::InstallKeys {
                session_id: msg.session_id,
                master_key,
                master_salt,
            },
            SignalingAction::Send {
                session_id: msg.session_id,
                message: ack,
            },
        ])
    }

    fn handle_connect_ack(&mut self, msg: ConnectAck) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get_mut(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;

        if session.state != SessionState::Negotiating {
            return Err(StateError::InvalidTransition {
                from: format!("{:?}", session.state),
                to: "Established".to_string(),
            }
            .into());
        }

        if !msg.accepted {
            session.state = SessionState::Closed;
            return Ok(vec![SignalingAction::TeardownSession {
                session_id: msg.session_id,
                reason: StopReason::UserRequest,
            }]);
        }

        let peer_public = msg
            .encryption
            .public_key
            .as_deref()
            .ok_or(StateError::UnknownSession(msg.session_id))?;
        let (master_key, master_salt) = session.derive_master_material(peer_public)?;

        session.remote_peer_id = msg.peer_id;
        session.state = SessionState::Established;
        session.heartbeat.last_ack = Instant::now();

        Ok(vec![SignalingAction::InstallKeys {
            session_id: msg.session_id,
            master_key,
            master_salt,
        }])
    }

    fn handle_stream_start(&mut self, msg: StreamStart) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;
        if session.state != SessionState::Established {
            return Err(StateError::PrematureStreamStart.into());
        }

        let encrypted = msg.encryption.algorithm != "none";
        Ok(vec![SignalingAction::StartStream {
            session_id: msg.session_id,
            stream_id: msg.stream_id,
            stream_type: msg.stream_type,
            codec: msg.codec,
            ssrc: msg.ssrc,
            encrypted,
            key_id: msg.encryption.key_id,
        }])
    }

    fn handle_stream_stop(&mut self, msg: StreamStop) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;
        if session.state != SessionState::Established {
            return Err(StateError::UnknownSession(msg.session_id).into());
        }
        // The session stays Established: future streams may start
        Ok(vec![SignalingAction::StopStream {
            session_id: msg.session_id,
            stream_id: msg.stream_id,
            reason: msg.reason,
        }])
    }

    fn handle_quality_adapt(&mut self, msg: QualityAdapt) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;
        if session.state != SessionState::Established {
            return Err(StateError::UnknownSession(msg.session_id).into());
        }
        Ok(vec![SignalingAction::ApplyQuality {
            session_id: msg.session_id,
            stream_id: msg.stream_id,
            quality: msg.quality,
            reason: msg.reason,
        }])
    }

    fn handle_heartbeat(&mut self, msg: Heartbeat) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get_mut(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;
        if session.state != SessionState::Established {
            return Err(StateError::UnknownSession(msg.session_id).into());
        }

        // A live peer: receiving its heartbeat refreshes the liveness clock
        session.heartbeat.last_ack = Instant::now();

        let response_timestamp = chrono::Utc::now().timestamp_millis();
        Ok(vec![SignalingAction::Send {
            session_id: msg.session_id,
            message: SignalingMessage::HeartbeatAck(HeartbeatAck {
                session_id: msg.session_id,
                sequence: msg.sequence,
                original_timestamp: msg.timestamp,
                response_timestamp,
                latency_ms: response_timestamp - msg.timestamp,
            }),
        }])
    }

    fn handle_heartbeat_ack(&mut self, msg: HeartbeatAck) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get_mut(&msg.session_id)
            .ok_or(StateError::UnknownSession(msg.session_id))?;

        session.heartbeat.last_ack = Instant::now();
        if let Some(sent_at) = session.heartbeat.outstanding.remove(&msg.sequence) {
            let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
            return Ok(vec![SignalingAction::RecordRtt {
                session_id: msg.session_id,
                rtt_ms,
            }]);
        }
        Ok(vec![])
    }

    /// Periodic driver: emit due heartbeats and detect dead sessions
    pub fn tick(&mut self) -> Vec<SignalingAction> {
        self.tick_at(Instant::now())
    }

    /// Deterministic tick against an explicit clock
    pub fn tick_at(&mut self, now: Instant) -> Vec<SignalingAction> {
        let mut actions = Vec::new();
        let mut dead = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            // A peer that never answered CONNECT within the reply deadline
            if session.state == SessionState::Negotiating
                && now.duration_since(session.created_at) > self.reply_timeout
            {
                session.state = SessionState::Closing;
                dead.push(*id);
                continue;
            }
            if session.state != SessionState::Established {
                continue;
            }

            // Heartbeat timeout: no ack within 3x interval
            if now.duration_since(session.heartbeat.last_ack) > self.heartbeat_timeout {
                session.state = SessionState::Closing;
                dead.push(*id);
                continue;
            }

            let due = session
                .heartbeat
                .last_sent
                .map(|at| now.duration_since(at) >= self.heartbeat_interval)
                .unwrap_or(true);
            if due {
                let sequence = session.heartbeat.next_sequence;
                session.heartbeat.next_sequence += 1;
                session.heartbeat.outstanding.insert(sequence, now);
                session.heartbeat.last_sent = Some(now);

                actions.push(SignalingAction::Send {
                    session_id: *id,
                    message: SignalingMessage::Heartbeat(Heartbeat {
                        session_id: *id,
                        sequence,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    }),
                });
            }
        }

        for id in dead {
            tracing::warn!(session_id = %id, "Session timed out, tearing down");
            actions.push(SignalingAction::TeardownSession {
                session_id: id,
                reason: StopReason::Timeout,
            });
            if let Some(session) = self.sessions.get_mut(&id) {
                session.state = SessionState::Closed;
            }
        }

        actions
    }

    /// Close a session deliberately
    pub fn close_session(
        &mut self,
        session_id: Uuid,
        reason: StopReason,
    ) -> MediaEngineResult<Vec<SignalingAction>> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(StateError::UnknownSession(session_id))?;
        session.state = SessionState::Closing;
        let actions = vec![SignalingAction::TeardownSession { session_id, reason }];
        session.state = SessionState::Closed;
        Ok(actions)
    }

    /// Drop a fully closed session from the registry
    pub fn forget_session(&mut self, session_id: Uuid) {
        if let Some(session) = self.sessions.get(&session_id) {
            if session.state == SessionState::Closed {
                self.sessions.remove(&session_id);
            }
        }
    }

    /// Host and server-reflexive peers connect directly; symmetric and
    /// port-restricted NATs get the configured relay candidates
    fn relay_candidates(&self, nat_type: NatType) -> Vec<RelayServer> {
        match nat_type {
            NatType::Symmetric | NatType::PortRestricted | NatType::Unknown => {
                let mut relays = self.relay_servers.clone();
                relays.sort_by_key(|r| r.priority);
                relays
            }
            _ => vec![],
        }
    }
}

/// First preferred codec the peer also supports
fn select_codec(preference: &[&str], offered: &[String]) -> Option<String> {
    preference
        .iter()
        .find(|c| offered.iter().any(|o| o.eq_ignore_ascii_case(c)))
        .map(|c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> PeerCapabilities {
        PeerCapabilities {
            codecs: vec!["opus".to_string(), "h264".to_string()],
            resolutions: vec!["1280x720".to_string()],
            encryption: vec!["aes128_gcm".to_string()],
            transport: vec!["udp".to_string()],
        }
    }

    fn network_info(nat_type: NatType) -> NetworkInfo {
        NetworkInfo {
            public_ip: "203.0.113.7".to_string(),
            public_port: 50_000,
            nat_type,
        }
    }

    fn engine_with_relays() -> ArcSignalingEngine {
        ArcSignalingEngine::new(
            Uuid::new_v4(),
            &MediaEngineConfig::default(),
            vec![RelayServer {
                id: "relay-1".to_string(),
                address: "198.51.100.1".to_string(),
                port: 3478,
                priority: 1,
            }],
        )
    }

    fn connect_msg(session_id: Uuid, public_key: Option<String>) -> Connect {
        Connect {
            version: PROTOCOL_VERSION.to_string(),
            session_id,
            peer_id: Uuid::new_v4(),
            capabilities: capabilities(),
            network_info: network_info(NatType::FullCone),
            public_key,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn extract_ack(actions: &[SignalingAction]) -> &ConnectAck {
        actions
            .iter()
            .find_map(|a| match a {
                SignalingAction::Send {
                    message: SignalingMessage::ConnectAck(ack),
                    ..
                } => Some(ack),
                _ => None,
            })
            .expect("no ConnectAck in actions")
    }

    #[test]
    fn test_message_json_roundtrip() {
        let msg = SignalingMessage::Heartbeat(Heartbeat {
            session_id: Uuid::new_v4(),
            sequence: 42,
            timestamp: 1_700_000_000_000,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"HEARTBEAT\""));
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = SignalingMessage::from_json(r#"{"type":"RESUME","session_id":"x"}"#);
        assert!(matches!(err, Err(ParseError::MalformedSignaling(_))));
    }

    #[test]
    fn test_missing_field_rejected() {
        // HEARTBEAT without its sequence
        let err = SignalingMessage::from_json(
            r#"{"type":"HEARTBEAT","session_id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","timestamp":1}"#,
        );
        assert!(matches!(err, Err(ParseError::MalformedSignaling(_))));
    }

    #[test]
    fn test_connect_accepted_with_keys() {
        let mut callee = engine_with_relays();
        let session_id = Uuid::new_v4();

        // Simulate the initiator side for a real key pair
        let mut initiator = engine_with_relays();
        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();

        let actions = callee.handle_message(connect).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], SignalingAction::InstallKeys { .. }));

        let ack = extract_ack(&actions);
        assert!(ack.accepted);
        assert_eq!(ack.selected_codecs.audio, "opus");
        assert_eq!(ack.selected_codecs.video, "h264");
        assert_eq!(callee.session(session_id).unwrap().state(), SessionState::Established);
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let mut initiator = engine_with_relays();
        let mut callee = engine_with_relays();
        let session_id = Uuid::new_v4();

        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();
        let callee_actions = callee.handle_message(connect).unwrap();

        let callee_keys = callee_actions
            .iter()
            .find_map(|a| match a {
                SignalingAction::InstallKeys {
                    master_key,
                    master_salt,
                    ..
                } => Some((master_key.clone(), master_salt.clone())),
                _ => None,
            })
            .unwrap();

        let ack = extract_ack(&callee_actions).clone();
        let initiator_actions = initiator
            .handle_message(SignalingMessage::ConnectAck(ack))
            .unwrap();
        let initiator_keys = initiator_actions
            .iter()
            .find_map(|a| match a {
                SignalingAction::InstallKeys {
                    master_key,
                    master_salt,
                    ..
                } => Some((master_key.clone(), master_salt.clone())),
                _ => None,
            })
            .unwrap();

        assert_eq!(callee_keys, initiator_keys);
        assert_eq!(
            initiator.session(session_id).unwrap().state(),
            SessionState::Established
        );
    }

    #[test]
    fn test_version_mismatch_refused() {
        let mut engine = engine_with_relays();
        let mut msg = connect_msg(Uuid::new_v4(), Some("00".repeat(32)));
        msg.version = "0.9".to_string();

        let actions = engine.handle_message(SignalingMessage::Connect(msg)).unwrap();
        assert!(!extract_ack(&actions).accepted);
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_no_common_codec_refused() {
        let mut engine = engine_with_relays();
        let mut msg = connect_msg(Uuid::new_v4(), Some("00".repeat(32)));
        msg.capabilities.codecs = vec!["speex".to_string()];

        let actions = engine.handle_message(SignalingMessage::Connect(msg)).unwrap();
        assert!(!extract_ack(&actions).accepted);
    }

    #[test]
    fn test_relay_offered_to_symmetric_nat() {
        let mut engine = engine_with_relays();
        let mut msg = connect_msg(Uuid::new_v4(), Some("00".repeat(32)));
        msg.network_info.nat_type = NatType::Symmetric;

        let actions = engine.handle_message(SignalingMessage::Connect(msg)).unwrap();
        assert_eq!(extract_ack(&actions).network_info.relay_servers.len(), 1);
    }

    #[test]
    fn test_no_relay_for_open_nat() {
        let mut engine = engine_with_relays();
        let msg = connect_msg(Uuid::new_v4(), Some("00".repeat(32)));
        let actions = engine.handle_message(SignalingMessage::Connect(msg)).unwrap();
        assert!(extract_ack(&actions).network_info.relay_servers.is_empty());
    }

    #[test]
    fn test_premature_stream_start() {
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();

        // Session is still Negotiating; STREAM_START must be refused
        let err = initiator.handle_message(SignalingMessage::StreamStart(StreamStart {
            session_id,
            stream_id: Uuid::new_v4(),
            stream_type: StreamType::Audio,
            codec: CodecParams {
                name: "opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
            },
            ssrc: 12345,
            encryption: StreamEncryption {
                key_id: "srtp:session:test".to_string(),
                algorithm: "aes128_gcm".to_string(),
            },
            timestamp: 0,
        }));
        assert!(matches!(
            err,
            Err(crate::error::MediaEngineError::State(
                StateError::PrematureStreamStart
            ))
        ));
    }

    #[test]
    fn test_heartbeat_ack_latency() {
        let mut callee = engine_with_relays();
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();
        callee.handle_message(connect).unwrap();

        let sent = chrono::Utc::now().timestamp_millis() - 25;
        let actions = callee
            .handle_message(SignalingMessage::Heartbeat(Heartbeat {
                session_id,
                sequence: 7,
                timestamp: sent,
            }))
            .unwrap();

        match &actions[0] {
            SignalingAction::Send {
                message: SignalingMessage::HeartbeatAck(ack),
                ..
            } => {
                assert_eq!(ack.sequence, 7);
                assert_eq!(ack.original_timestamp, sent);
                assert_eq!(ack.latency_ms, ack.response_timestamp - ack.original_timestamp);
            }
            other => panic!("expected HeartbeatAck, got {:?}", other),
        }
    }

    #[test]
    fn test_tick_emits_heartbeats_and_rtt_flows() {
        let mut callee = engine_with_relays();
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();
        let ack = extract_ack(&callee.handle_message(connect).unwrap()).clone();
        initiator
            .handle_message(SignalingMessage::ConnectAck(ack))
            .unwrap();

        let actions = initiator.tick();
        let heartbeat = actions
            .iter()
            .find_map(|a| match a {
                SignalingAction::Send {
                    message: SignalingMessage::Heartbeat(hb),
                    ..
                } => Some(hb.clone()),
                _ => None,
            })
            .unwrap();

        // Callee acks; initiator attributes the RTT
        let ack_actions = callee
            .handle_message(SignalingMessage::Heartbeat(heartbeat))
            .unwrap();
        let hb_ack = ack_actions
            .iter()
            .find_map(|a| match a {
                SignalingAction::Send {
                    message: SignalingMessage::HeartbeatAck(ack),
                    ..
                } => Some(ack.clone()),
                _ => None,
            })
            .unwrap();
        let rtt_actions = initiator
            .handle_message(SignalingMessage::HeartbeatAck(hb_ack))
            .unwrap();
        assert!(matches!(
            rtt_actions.as_slice(),
            [SignalingAction::RecordRtt { .. }]
        ));
    }

    #[test]
    fn test_heartbeat_timeout_tears_down() {
        let mut callee = engine_with_relays();
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();
        callee.handle_message(connect).unwrap();

        // 16 seconds with the default 5 s interval and 3x multiplier
        let future = Instant::now() + Duration::from_secs(16);
        let actions = callee.tick_at(future);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SignalingAction::TeardownSession { reason: StopReason::Timeout, .. })));
        assert_eq!(
            callee.session(session_id).unwrap().state(),
            SessionState::Closed
        );
    }

    #[test]
    fn test_unanswered_connect_times_out() {
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();

        // Default reply deadline is 3 s; no CONNECT_ACK ever arrives
        let actions = initiator.tick_at(Instant::now() + Duration::from_secs(4));
        assert!(actions
            .iter()
            .any(|a| matches!(a, SignalingAction::TeardownSession { .. })));
        assert_eq!(
            initiator.session(session_id).unwrap().state(),
            SessionState::Closed
        );
    }

    #[test]
    fn test_stream_stop_keeps_session_established() {
        let mut callee = engine_with_relays();
        let mut initiator = engine_with_relays();
        let session_id = Uuid::new_v4();
        let connect = initiator
            .initiate(session_id, capabilities(), network_info(NatType::FullCone))
            .unwrap();
        callee.handle_message(connect).unwrap();

        let actions = callee
            .handle_message(SignalingMessage::StreamStop(StreamStop {
                session_id,
                stream_id: Uuid::new_v4(),
                reason: StopReason::UserRequest,
                timestamp: 0,
            }))
            .unwrap();
        assert!(matches!(actions[0], SignalingAction::StopStream { .. }));
        assert_eq!(
            callee.session(session_id).unwrap().state(),
            SessionState::Established
        );
    }
}
