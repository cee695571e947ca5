//! Quality adaptation
//!
//! Maps health metrics to concrete quality decisions over a closed ladder
//! of levels. Downgrades win over upgrades in the same tick, levels dwell
//! for a minimum period to prevent oscillation, and a heavy loss burst
//! forces an immediate emergency downgrade.
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


use crate::config::AdaptConfig;
use crate::connection_health::HealthSample;
use crate::rtp_codec::QualityIndicator;
use std::time::{Duration, Instant};

/// Loss rate that justifies breaking the dwell-time rule
const EMERGENCY_LOSS_RATE: f32 = 0.20;

/// How long conditions must stay clean before an upgrade
const SUSTAINED_GOOD: Duration = Duration::from_secs(5);

/// Upgrade requires this much estimated bandwidth headroom over the
/// current level's bitrate
const UPGRADE_HEADROOM: f64 = 1.5;

/// Closed set of quality levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Ultra,
    High,
    Medium,
    Low,
    VeryLow,
}

/// Video parameters of a quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub bitrate_bps: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl QualityLevel {
    /// Fixed video ladder
    pub fn video_profile(&self) -> VideoProfile {
        match self {
            QualityLevel::Ultra => VideoProfile {
                bitrate_bps: 6_000_000,
                width: 1920,
                height: 1080,
                framerate: 60,
            },
            QualityLevel::High => VideoProfile {
                bitrate_bps: 2_500_000,
                width: 1280,
                height: 720,
                framerate: 30,
            },
            QualityLevel::Medium => VideoProfile {
                bitrate_bps: 1_200_000,
                width: 960,
                height: 540,
                framerate: 30,
            },
            QualityLevel::Low => VideoProfile {
                bitrate_bps: 600_000,
                width: 640,
                height: 360,
                framerate: 24,
            },
            QualityLevel::VeryLow => VideoProfile {
                bitrate_bps: 250_000,
                width: 320,
                height: 180,
                framerate: 15,
            },
        }
    }

    /// Fixed audio bitrates
    pub fn audio_bitrate_bps(&self) -> u32 {
        match self {
            QualityLevel::Ultra => 128_000,
            QualityLevel::High => 96_000,
            QualityLevel::Medium => 64_000,
            QualityLevel::Low => 32_000,
            QualityLevel::VeryLow => 16_000,
        }
    }

    /// One step toward lower quality; saturates at the bottom
    pub fn step_down(&self) -> QualityLevel {
        match self {
            QualityLevel::Ultra => QualityLevel::High,
            QualityLevel::High => QualityLevel::Medium,
            QualityLevel::Medium => QualityLevel::Low,
            QualityLevel::Low => QualityLevel::VeryLow,
            QualityLevel::VeryLow => QualityLevel::VeryLow,
        }
    }

    /// One step toward higher quality; saturates at the top
    pub fn step_up(&self) -> QualityLevel {
        match self {
            QualityLevel::Ultra => QualityLevel::Ultra,
            QualityLevel::High => QualityLevel::Ultra,
            QualityLevel::Medium => QualityLevel::High,
            QualityLevel::Low => QualityLevel::Medium,
            QualityLevel::VeryLow => QualityLevel::Low,
        }
    }

    /// Resolution as a wire string, e.g. "1280x720"
    pub fn resolution_str(&self) -> String {
        let p = self.video_profile();
        format!("{}x{}", p.width, p.height)
    }

    /// The 2-bit in-band indicator broadcast with this level
    pub fn indicator(&self) -> QualityIndicator {
        match self {
            QualityLevel::Ultra => QualityIndicator::Excellent,
            QualityLevel::High => QualityIndicator::Good,
            QualityLevel::Medium => QualityIndicator::Fair,
            QualityLevel::Low | QualityLevel::VeryLow => QualityIndicator::Poor,
        }
    }
}

/// Why an adaptation was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptReason {
    Bandwidth,
    Cpu,
    Network,
    Keyframe,
}

/// Direction of a quality change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptDirection {
    Down,
    Up,
}

/// A concrete quality decision to apply and signal to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptDecision {
    pub level: QualityLevel,
    pub direction: AdaptDirection,
    pub reason: AdaptReason,
    pub emergency: bool,
}

/// Per-stream adaptation controller
pub struct AdaptController {
    config: AdaptConfig,
    level: QualityLevel,
    last_change: Option<Instant>,
    good_since: Option<Instant>,
    keyframe_pending: bool,
}

impl AdaptController {
    pub fn new(config: AdaptConfig, initial: QualityLevel) -> Self {
        AdaptController {
            config,
            level: initial,
            last_change: None,
            good_since: None,
            keyframe_pending: false,
        }
    }

    /// Current quality level
    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// The in-band indicator to stamp on outgoing packets
    pub fn indicator(&self) -> QualityIndicator {
        self.level.indicator()
    }

    /// Flag that the concealment engine needs a keyframe; surfaced by the
    /// next `take_keyframe_request`
    pub fn request_keyframe(&mut self) {
        self.keyframe_pending = true;
    }

    /// Drain a pending keyframe request
    pub fn take_keyframe_request(&mut self) -> bool {
        std::mem::take(&mut self.keyframe_pending)
    }

    /// Evaluate the latest health sample against the decision rules
    pub fn evaluate(&mut self, sample: &HealthSample) -> Option<AdaptDecision> {
        self.evaluate_at(sample, Instant::now())
    }

    /// Deterministic evaluation against an explicit clock
    pub fn evaluate_at(&mut self, sample: &HealthSample, now: Instant) -> Option<AdaptDecision> {
        let degraded = sample.loss_rate > self.config.loss_step_down
            || sample.rtt_ms > self.config.rtt_step_down_ms;
        let clean = sample.loss_rate < self.config.loss_step_up
            && sample.rtt_ms < self.config.rtt_step_up_ms;

        // Track the run of clean samples for the sustained-upgrade rule
        if clean {
            self.good_since.get_or_insert(now);
        } else {
            self.good_since = None;
        }

        let emergency = sample.loss_rate > EMERGENCY_LOSS_RATE;
        let dwelling = self
            .last_change
            .map(|at| now.duration_since(at) < Duration::from_millis(self.config.min_dwell_ms))
            .unwrap_or(false);

        // Downgrades take precedence over upgrades in the same tick
        if degraded {
            if dwelling && !emergency {
                return None;
            }
            let next = self.level.step_down();
            if next == self.level {
                return None;
            }
            self.level = next;
            self.last_change = Some(now);
            self.good_since = None;
            return Some(AdaptDecision {
                level: next,
                direction: AdaptDirection::Down,
                reason: AdaptReason::Network,
                emergency,
            });
        }

        if dwelling {
            return None;
        }

        let sustained = self
            .good_since
            .map(|since| now.duration_since(since) >= SUSTAINED_GOOD)
            .unwrap_or(false);
        let headroom = sample.bandwidth_estimate_bps
            >= self.level.video_profile().bitrate_bps as f64 * UPGRADE_HEADROOM;

        if clean && sustained && headroom {
            let next = self.level.step_up();
            if next == self.level {
                return None;
            }
            self.level = next;
            self.last_change = Some(now);
            return Some(AdaptDecision {
                level: next,
                direction: AdaptDirection::Up,
                reason: AdaptReason::Bandwidth,
                emergency: false,
            });
        }

        None
    }
}
