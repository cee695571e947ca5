//! Connection health monitoring
//!
//! Maintains rolling per-stream quality estimates from RTP arrivals,
//! heartbeat round trips and RTCP reception reports: windowed loss rate,
//! RFC 3550 interarrival jitter, RTT and the hybrid bandwidth estimate.
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


use crate::bandwidth_estimation::{BandwidthEstimator, BandwidthEstimatorConfig};
use crate::rtcp::{ntp_now_mid32, ReceptionReport};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples retained in the per-stream ring
const SAMPLE_RING_CAPACITY: usize = 120;

/// RTT samples retained for averaging
const RTT_SAMPLE_CAPACITY: usize = 50;

/// One point-in-time health measurement
#[derive(Debug, Clone)]
pub struct HealthSample {
    /// Packet loss rate over the observation window, [0, 1]
    pub loss_rate: f32,
    /// Interarrival jitter in milliseconds
    pub jitter_ms: f64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Estimated available bandwidth in bits per second
    pub bandwidth_estimate_bps: f64,
    /// When the sample was taken
    pub timestamp: Instant,
}

/// Metric that crossed its configured threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMetric {
    LossRate,
    Jitter,
    Rtt,
}

/// Thresholds for the subscription callback
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub loss_rate: f32,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        HealthThresholds {
            loss_rate: 0.05,
            jitter_ms: 50.0,
            rtt_ms: 100.0,
        }
    }
}

type ThresholdCallback = Box<dyn Fn(&HealthSample, ThresholdMetric) + Send + Sync>;

/// Windowed expected/received snapshot for loss computation
struct LossSnapshot {
    taken_at: Instant,
    expected: u64,
    received: u64,
}

/// Per-stream connection health monitor
pub struct HealthMonitor {
    /// Media clock rate in Hz (48000 audio, 90000 video)
    clock_rate: u32,
    /// Loss observation window
    window: Duration,

    // Arrival accounting
    base_ext_seq: Option<u64>,
    highest_ext_seq: u64,
    received: u64,
    snapshots: VecDeque<LossSnapshot>,

    // RFC 3550 Section 6.4.1 jitter state
    prev_arrival: Option<(Instant, u32)>,
    jitter_ms: f64,

    rtt_samples: VecDeque<f64>,
    estimator: BandwidthEstimator,
    samples: VecDeque<HealthSample>,

    thresholds: HealthThresholds,
    callback: Option<ThresholdCallback>,
    breached: Vec<ThresholdMetric>,
}

impl HealthMonitor {
    /// Create a monitor for a stream with the given media clock rate
    pub fn new(clock_rate: u32, window: Duration) -> Self {
        HealthMonitor {
            clock_rate: clock_rate.max(1),
            window,
            base_ext_seq: None,
            highest_ext_seq: 0,
            received: 0,
            snapshots: VecDeque::new(),
            prev_arrival: None,
            jitter_ms: 0.0,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_CAPACITY),
            estimator: BandwidthEstimator::new(BandwidthEstimatorConfig::default()),
            samples: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
            thresholds: HealthThresholds::default(),
            callback: None,
            breached: Vec::new(),
        }
    }

    /// Default monitor: 5-second loss window
    pub fn with_clock_rate(clock_rate: u32) -> Self {
        Self::new(clock_rate, Duration::from_secs(5))
    }

    /// Subscribe to threshold crossings; fires once per metric when it
    /// rises through its threshold, again only after it recovered
    pub fn set_threshold_callback(&mut self, thresholds: HealthThresholds, cb: ThresholdCallback) {
        self.thresholds = thresholds;
        self.callback = Some(cb);
    }

    /// Record an RTP arrival
    pub fn record_arrival(&mut self, ext_seq: u64, rtp_timestamp: u32, arrival: Instant) {
        if self.base_ext_seq.is_none() {
            self.base_ext_seq = Some(ext_seq);
            self.highest_ext_seq = ext_seq;
        }
        self.highest_ext_seq = self.highest_ext_seq.max(ext_seq);
        self.received += 1;

        if let Some((prev_arrival, prev_ts)) = self.prev_arrival {
            let arrival_gap_ms = arrival.duration_since(prev_arrival).as_secs_f64() * 1000.0;
            let ts_gap_ms = rtp_timestamp.wrapping_sub(prev_ts) as f64 * 1000.0
                / self.clock_rate as f64;
            // D(i-1, i), then J += (|D| - J) / 16
            let d = arrival_gap_ms - ts_gap_ms;
            self.jitter_ms += (d.abs() - self.jitter_ms) / 16.0;
            self.estimator.record_delay_deviation(d);
        }
        self.prev_arrival = Some((arrival, rtp_timestamp));
    }

    /// Record a round-trip measurement (heartbeat ack or RTCP LSR/DLSR)
    pub fn record_rtt(&mut self, rtt_ms: f64) {
        self.rtt_samples.push_back(rtt_ms);
        if self.rtt_samples.len() > RTT_SAMPLE_CAPACITY {
            self.rtt_samples.pop_front();
        }
    }

    /// Ingest a peer reception report: remote jitter and LSR/DLSR round trip
    pub fn record_reception_report(&mut self, report: &ReceptionReport) {
        if let Some(rtt) = report.rtt_ms(ntp_now_mid32()) {
            self.record_rtt(rtt);
        }
        // Remote jitter arrives in timestamp units
        let remote_jitter_ms = report.jitter as f64 * 1000.0 / self.clock_rate as f64;
        self.jitter_ms = self.jitter_ms.max(remote_jitter_ms);
    }

    /// Loss rate over the observation window
    pub fn loss_rate(&self) -> f32 {
        let (cur_expected, cur_received) = self.totals();
        let (base_expected, base_received) = self
            .snapshots
            .front()
            .map(|s| (s.expected, s.received))
            .unwrap_or((0, 0));

        let expected = cur_expected.saturating_sub(base_expected);
        let received = cur_received.saturating_sub(base_received);
        if expected == 0 {
            return 0.0;
        }
        let lost = expected.saturating_sub(received);
        (lost as f32 / expected as f32).clamp(0.0, 1.0)
    }

    /// Current interarrival jitter estimate in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    /// Average RTT over recent samples; 0 until the first measurement
    pub fn rtt_ms(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            return 0.0;
        }
        self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64
    }

    /// Take a health sample, push it onto the ring, and fire threshold
    /// crossings
    pub fn sample(&mut self) -> HealthSample {
        let now = Instant::now();
        let loss_rate = self.loss_rate();
        self.estimator.update_loss(loss_rate);

        let sample = HealthSample {
            loss_rate,
            jitter_ms: self.jitter_ms,
            rtt_ms: self.rtt_ms(),
            bandwidth_estimate_bps: self.estimator.estimate().available_bps,
            timestamp: now,
        };

        // Window bookkeeping
        let (expected, received) = self.totals();
        self.snapshots.push_back(LossSnapshot {
            taken_at: now,
            expected,
            received,
        });
        while let Some(front) = self.snapshots.front() {
            if now.duration_since(front.taken_at) > self.window && self.snapshots.len() > 1 {
                self.snapshots.pop_front();
            } else {
                break;
            }
        }

        self.samples.push_back(sample.clone());
        if self.samples.len() > SAMPLE_RING_CAPACITY {
            self.samples.pop_front();
        }

        self.fire_threshold_crossings(&sample);
        sample
    }

    /// Most recent sample, if any
    pub fn latest_sample(&self) -> Option<&HealthSample> {
        self.samples.back()
    }

    /// Full sample ring, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &HealthSample> {
        self.samples.iter()
    }

    fn totals(&self) -> (u64, u64) {
        let expected = match self.base_ext_seq {
            Some(base) => self.highest_ext_seq - base + 1,
            None => 0,
        };
        (expected, self.received)
    }

    fn fire_threshold_crossings(&mut self, sample: &HealthSample) {
        let cb = match self.callback {
            Some(ref cb) => cb,
            None => return,
        };

        let checks = [
            (
                ThresholdMetric::LossRate,
                sample.loss_rate > self.thresholds.loss_rate,
            ),
            (
                ThresholdMetric::Jitter,
                sample.jitter_ms > self.thresholds.jitter_ms,
            ),
            (ThresholdMetric::Rtt, sample.rtt_ms > self.thresholds.rtt_ms),
        ];

        let mut breached_now = Vec::new();
        for (metric, over) in checks {
            if over {
                breached_now.push(metric);
                if !self.breached.contains(&metric) {
                    cb(sample, metric);
                }
            }
        }
        self.breached = breached_now;
    }
}
