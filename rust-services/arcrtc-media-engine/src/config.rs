//! Configuration for the media transport core
//!
//! Every recognized option is enumerated here with its default. The engine
//! validates the aggregate at construction time and refuses to start on any
//! out-of-range value.
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


use crate::error::{MediaEngineError, MediaEngineResult};
use serde::Deserialize;
use std::env;

/// Negotiable SRTP cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoSuite {
    /// AES-128-GCM (16-byte key)
    Aes128Gcm,
    /// AES-256-GCM (32-byte key)
    Aes256Gcm,
}

impl CryptoSuite {
    /// Encryption key length in bytes for this suite
    pub fn key_len(&self) -> usize {
        match self {
            CryptoSuite::Aes128Gcm => 16,
            CryptoSuite::Aes256Gcm => 32,
        }
    }

    /// Wire name used in signaling capability lists
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoSuite::Aes128Gcm => "aes128_gcm",
            CryptoSuite::Aes256Gcm => "aes256_gcm",
        }
    }

    /// Parse a wire name
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "aes128_gcm" => Some(CryptoSuite::Aes128Gcm),
            "aes256_gcm" => Some(CryptoSuite::Aes256Gcm),
            _ => None,
        }
    }
}

/// Session and signaling timing
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Interval between heartbeats (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Session is torn down after this many intervals without an ack
    pub heartbeat_timeout_multiplier: u32,
    /// Deadline for signaling replies (milliseconds)
    pub signaling_reply_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_multiplier: 3,
            signaling_reply_timeout_ms: 3000,
        }
    }
}

/// SRTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Cipher suite
    pub suite: CryptoSuite,
    /// Mandatory rotation after this many packets on one context
    pub key_rotation_packets: u64,
    /// Mandatory rotation after this many seconds
    pub key_rotation_interval_s: u64,
    /// Replay window size in packets
    pub replay_window_size: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        CryptoConfig {
            suite: CryptoSuite::Aes128Gcm,
            key_rotation_packets: 1 << 31,
            key_rotation_interval_s: 86_400,
            replay_window_size: 64,
        }
    }
}

/// Jitter buffer depth bounds and adaptation cadence
#[derive(Debug, Clone, Deserialize)]
pub struct JitterConfig {
    /// Minimum target depth (milliseconds)
    pub min_depth_ms: u32,
    /// Maximum target depth (milliseconds)
    pub max_depth_ms: u32,
    /// Initial target depth (milliseconds)
    pub initial_depth_ms: u32,
    /// How often the target depth is recomputed (milliseconds)
    pub adapt_interval_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        JitterConfig {
            min_depth_ms: 5,
            max_depth_ms: 50,
            initial_depth_ms: 10,
            adapt_interval_ms: 500,
        }
    }
}

/// Packet loss concealment
#[derive(Debug, Clone, Deserialize)]
pub struct PlcConfig {
    /// Enable concealment
    pub enabled: bool,
    /// Maximum consecutive concealed packets before a keyframe is requested
    pub max_conceal_packets: usize,
    /// Audio frames over which the repeated frame fades to silence
    pub audio_fade_out_frames: usize,
}

impl Default for PlcConfig {
    fn default() -> Self {
        PlcConfig {
            enabled: true,
            max_conceal_packets: 5,
            audio_fade_out_frames: 3,
        }
    }
}

/// Quality adaptation thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptConfig {
    /// Loss rate above which quality steps down
    pub loss_step_down: f32,
    /// RTT above which quality steps down (milliseconds)
    pub rtt_step_down_ms: f64,
    /// Loss rate below which quality may step up
    pub loss_step_up: f32,
    /// RTT below which quality may step up (milliseconds)
    pub rtt_step_up_ms: f64,
    /// Minimum dwell time at a quality level (milliseconds)
    pub min_dwell_ms: u64,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        AdaptConfig {
            loss_step_down: 0.05,
            rtt_step_down_ms: 100.0,
            loss_step_up: 0.01,
            rtt_step_up_ms: 50.0,
            min_dwell_ms: 2000,
        }
    }
}

/// Aggregate configuration for the media engine
#[derive(Debug, Clone, Deserialize)]
pub struct MediaEngineConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub jitter: JitterConfig,
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub adapt: AdaptConfig,
    /// Authentication failures per second that trigger session teardown
    #[serde(default = "default_auth_fail_teardown")]
    pub auth_fail_teardown_per_s: u32,
}

impl Default for MediaEngineConfig {
    fn default() -> Self {
        MediaEngineConfig {
            session: SessionConfig::default(),
            crypto: CryptoConfig::default(),
            jitter: JitterConfig::default(),
            plc: PlcConfig::default(),
            adapt: AdaptConfig::default(),
            auth_fail_teardown_per_s: default_auth_fail_teardown(),
        }
    }
}

fn default_auth_fail_teardown() -> u32 {
    100
}

impl MediaEngineConfig {
    /// Load configuration from environment variables
    ///
    /// Recognized variables use the `ARCRTC_` prefix, e.g.
    /// `ARCRTC_HEARTBEAT_INTERVAL_MS`, `ARCRTC_CRYPTO_SUITE`,
    /// `ARCRTC_JITTER_MAX_DEPTH_MS`. Unset variables keep their defaults.
    pub fn from_env() -> MediaEngineResult<Self> {
        let _ = dotenvy::dotenv();

        let mut config = MediaEngineConfig::default();

        if let Some(v) = read_env_u64("ARCRTC_HEARTBEAT_INTERVAL_MS")? {
            config.session.heartbeat_interval_ms = v;
        }
        if let Some(v) = read_env_u64("ARCRTC_SIGNALING_REPLY_TIMEOUT_MS")? {
            config.session.signaling_reply_timeout_ms = v;
        }
        if let Ok(suite) = env::var("ARCRTC_CRYPTO_SUITE") {
            config.crypto.suite = CryptoSuite::from_str_opt(&suite).ok_or_else(|| {
                MediaEngineError::Config(format!("unknown crypto suite: {}", suite))
            })?;
        }
        if let Some(v) = read_env_u64("ARCRTC_JITTER_MIN_DEPTH_MS")? {
            config.jitter.min_depth_ms = v as u32;
        }
        if let Some(v) = read_env_u64("ARCRTC_JITTER_MAX_DEPTH_MS")? {
            config.jitter.max_depth_ms = v as u32;
        }
        if let Some(v) = read_env_u64("ARCRTC_JITTER_INITIAL_DEPTH_MS")? {
            config.jitter.initial_depth_ms = v as u32;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the aggregate; any violation is a configuration error and
    /// the engine refuses to start.
    pub fn validate(&self) -> MediaEngineResult<()> {
        if self.session.heartbeat_interval_ms == 0 {
            return Err(MediaEngineError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.session.heartbeat_timeout_multiplier == 0 {
            return Err(MediaEngineError::Config(
                "heartbeat_timeout_multiplier must be positive".to_string(),
            ));
        }
        if self.jitter.min_depth_ms > self.jitter.max_depth_ms {
            return Err(MediaEngineError::Config(format!(
                "jitter min_depth_ms {} exceeds max_depth_ms {}",
                self.jitter.min_depth_ms, self.jitter.max_depth_ms
            )));
        }
        if self.jitter.initial_depth_ms < self.jitter.min_depth_ms
            || self.jitter.initial_depth_ms > self.jitter.max_depth_ms
        {
            return Err(MediaEngineError::Config(format!(
                "jitter initial_depth_ms {} outside [{}, {}]",
                self.jitter.initial_depth_ms, self.jitter.min_depth_ms, self.jitter.max_depth_ms
            )));
        }
        if self.jitter.adapt_interval_ms == 0 {
            return Err(MediaEngineError::Config(
                "jitter adapt_interval_ms must be positive".to_string(),
            ));
        }
        if self.crypto.replay_window_size < 64 {
            return Err(MediaEngineError::Config(format!(
                "replay_window_size {} below minimum of 64",
                self.crypto.replay_window_size
            )));
        }
        if self.crypto.key_rotation_packets == 0 {
            return Err(MediaEngineError::Config(
                "key_rotation_packets must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.adapt.loss_step_down)
            || !(0.0..=1.0).contains(&self.adapt.loss_step_up)
        {
            return Err(MediaEngineError::Config(
                "adapt loss thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.adapt.loss_step_up >= self.adapt.loss_step_down {
            return Err(MediaEngineError::Config(
                "adapt loss_step_up must be below loss_step_down".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env_u64(name: &str) -> MediaEngineResult<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| MediaEngineError::Config(format!("{} must be an integer: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
