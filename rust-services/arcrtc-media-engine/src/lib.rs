//! Real-time media transport core for the ArcRTC protocol
//!
//! This crate provides the media transport layer for ArcRTC, including:
//! - RTP/RTCP packet parsing and construction
//! - SRTP encryption/decryption with replay protection
//! - Adaptive jitter buffering and packet loss concealment
//! - Connection health monitoring and quality adaptation
//! - Stream lifecycle management and packet routing
//! - The ArcSignaling session state machine
//!
//! The engine is driven through two injected capabilities: a `KeyProvider`
//! (arcrtc-keys) for session key material and a `TransportSink` for
//! datagram I/O. `MediaEngine` ties the components together on a tokio
//! runtime with one pipeline task per stream.
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
pub mod config;
pub mod rtp_codec;
pub mod rtcp;
pub mod srtp_session;
pub mod jitter_buffer;
pub mod packet_loss_concealment;
pub mod connection_health;
pub mod bandwidth_estimation;
pub mod quality_adaptation;
pub mod stream_manager;
pub mod arcsignaling;
pub mod key_provider;
pub mod transport_sink;
pub mod media_engine;

// Re-export main types
pub use error::{
    CryptoError, MediaEngineError, MediaEngineResult, ParseError, StateError, TransportError,
};
pub use config::{
    AdaptConfig, CryptoConfig, CryptoSuite, JitterConfig, MediaEngineConfig, PlcConfig,
    SessionConfig,
};
pub use rtp_codec::{
    ArcExtension, ExtensionHeader, PacketPriority, QualityIndicator, RtpHeader, RtpPacket,
    ARC_EXTENSION_PROFILE,
};
pub use rtcp::{
    Goodbye, ReceiverReport, ReceptionReport, RtcpPacket, SdesChunk, SdesItem, SdesItemType,
    SenderReport, SourceDescription,
};
pub use srtp_session::{CryptoContext, CryptoSession, SequenceExtender};
pub use jitter_buffer::{JitterBuffer, PopResult, PushResult};
pub use packet_loss_concealment::{AudioPlc, ConcealedFrame, PlcEngine, VideoPlc};
pub use connection_health::{
    HealthMonitor, HealthSample, HealthThresholds, ThresholdMetric,
};
pub use bandwidth_estimation::{
    BandwidthEstimate, BandwidthEstimator, BandwidthEstimatorConfig, EstimationMethod,
};
pub use quality_adaptation::{
    AdaptController, AdaptDecision, AdaptDirection, AdaptReason, QualityLevel, VideoProfile,
};
pub use stream_manager::{
    DeliveredFrame, MediaKind, SrtpStreamKeys, Stream, StreamConfig, StreamManager, StreamState,
    StreamStats,
};
pub use arcsignaling::{
    AckNetworkInfo, ArcSignalingEngine, CodecParams, Connect, ConnectAck, EncryptionParams,
    Heartbeat, HeartbeatAck, NatType, NetworkInfo, PeerCapabilities, QualityAdapt, QualityReason,
    QualitySpec, RelayServer, SelectedCodecs, SessionState, SignalingAction, SignalingMessage,
    SignalingSession, StopReason, StreamEncryption, StreamStart, StreamStop, StreamType,
    PROTOCOL_VERSION,
};
pub use key_provider::SessionKeyManager;
pub use transport_sink::{loopback_pair, LoopbackTransport, TransportSink, UdpTransport};
pub use media_engine::{EngineEvent, MediaEngine};
