//! Bandwidth estimation
//!
//! Hybrid estimator combining two signals:
//! - Loss-based AIMD: decrease multiplicatively when loss exceeds 5%,
//!   increase additively while loss stays at or below 1%
//! - Delay-based: watch the trend of arrival-time deviations and decrease
//!   on a sustained positive trend (queues building up)
//!
//! The authoritative estimate is the smaller of the two.
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


use std::collections::VecDeque;

/// Estimation method that produced the current figure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationMethod {
    /// Loss-based AIMD bound
    LossBased,
    /// Delay-trend bound
    DelayBased,
}

/// Bandwidth estimate
#[derive(Debug, Clone)]
pub struct BandwidthEstimate {
    /// Available bandwidth in bits per second
    pub available_bps: f64,
    /// Which bound is currently authoritative
    pub method: EstimationMethod,
}

/// Bandwidth estimator configuration
#[derive(Debug, Clone)]
pub struct BandwidthEstimatorConfig {
    /// Initial estimate (bps)
    pub initial_bps: f64,
    /// Floor (bps)
    pub min_bps: f64,
    /// Ceiling (bps)
    pub max_bps: f64,
    /// Additive increase per clean update (bps)
    pub additive_increase_bps: f64,
    /// Multiplicative decrease factor applied on loss
    pub multiplicative_decrease: f64,
    /// Loss rate above which the loss-based bound decreases
    pub loss_decrease_threshold: f32,
    /// Loss rate at or below which the loss-based bound increases
    pub loss_increase_threshold: f32,
    /// Mean arrival-delay deviation (ms) treated as a positive trend
    pub delay_trend_threshold_ms: f64,
    /// Deviation samples considered for the trend
    pub delay_window: usize,
}

impl Default for BandwidthEstimatorConfig {
    fn default() -> Self {
        BandwidthEstimatorConfig {
            initial_bps: 1_000_000.0,
            min_bps: 64_000.0,
            max_bps: 10_000_000.0,
            additive_increase_bps: 50_000.0,
            multiplicative_decrease: 0.85,
            loss_decrease_threshold: 0.05,
            loss_increase_threshold: 0.01,
            delay_trend_threshold_ms: 1.0,
            delay_window: 16,
        }
    }
}

/// Hybrid-with-min bandwidth estimator
pub struct BandwidthEstimator {
    config: BandwidthEstimatorConfig,
    loss_based_bps: f64,
    delay_based_bps: f64,
    delay_deviations: VecDeque<f64>,
}

impl BandwidthEstimator {
    pub fn new(config: BandwidthEstimatorConfig) -> Self {
        let initial = config.initial_bps;
        BandwidthEstimator {
            config,
            loss_based_bps: initial,
            delay_based_bps: initial,
            delay_deviations: VecDeque::new(),
        }
    }

    /// Feed the windowed loss rate; applies the AIMD rule
    pub fn update_loss(&mut self, loss_rate: f32) {
        if loss_rate > self.config.loss_decrease_threshold {
            self.loss_based_bps *= self.config.multiplicative_decrease;
        } else if loss_rate <= self.config.loss_increase_threshold {
            self.loss_based_bps += self.config.additive_increase_bps;
        }
        self.loss_based_bps = self
            .loss_based_bps
            .clamp(self.config.min_bps, self.config.max_bps);
    }

    /// Feed one arrival-delay deviation: how much later than its timestamp
    /// spacing a packet arrived, in milliseconds. Positive values mean the
    /// path is queuing.
    pub fn record_delay_deviation(&mut self, deviation_ms: f64) {
        self.delay_deviations.push_back(deviation_ms);
        if self.delay_deviations.len() > self.config.delay_window {
            self.delay_deviations.pop_front();
        }

        if self.delay_deviations.len() < self.config.delay_window {
            return;
        }

        let mean: f64 =
            self.delay_deviations.iter().sum::<f64>() / self.delay_deviations.len() as f64;
        if mean > self.config.delay_trend_threshold_ms {
            // Sustained queuing: back off and restart the window
            self.delay_based_bps *= 0.9;
            self.delay_deviations.clear();
        } else {
            // Path is draining: recover slowly toward the ceiling
            self.delay_based_bps += self.config.additive_increase_bps / 4.0;
        }
        self.delay_based_bps = self
            .delay_based_bps
            .clamp(self.config.min_bps, self.config.max_bps);
    }

    /// Current authoritative estimate: min(loss-based, delay-based)
    pub fn estimate(&self) -> BandwidthEstimate {
        if self.loss_based_bps <= self.delay_based_bps {
            BandwidthEstimate {
                available_bps: self.loss_based_bps,
                method: EstimationMethod::LossBased,
            }
        } else {
            BandwidthEstimate {
                available_bps: self.delay_based_bps,
                method: EstimationMethod::DelayBased,
            }
        }
    }

    /// Reset both bounds to the initial estimate
    pub fn reset(&mut self) {
        self.loss_based_bps = self.config.initial_bps;
        self.delay_based_bps = self.config.initial_bps;
        self.delay_deviations.clear();
    }
}
