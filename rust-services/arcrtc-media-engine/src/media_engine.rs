//! Media engine root object
//!
//! Owns the stream manager, the signaling engine and the injected
//! capabilities (key provider, transport sink), and runs the task fabric:
//! an inbound pump that demultiplexes datagrams onto bounded per-stream
//! queues, one worker task per stream (the single writer for that
//! stream's pipeline), and a periodic tick driving adaptation and
//! heartbeats. A full queue drops its oldest packet: latency wins over
//! completeness.
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


use crate::arcsignaling::{
    ArcSignalingEngine, NetworkInfo, PeerCapabilities, QualityReason, QualitySpec, RelayServer,
    SignalingAction, SignalingMessage, StopReason, StreamType,
};
use crate::config::MediaEngineConfig;
use crate::error::{MediaEngineError, MediaEngineResult, StateError, TransportError};
use crate::key_provider::SessionKeyManager;
use crate::quality_adaptation::{AdaptDecision, AdaptReason};
use crate::rtp_codec::{RtpHeader, RtpPacket};
use crate::rtcp::RtcpPacket;
use crate::stream_manager::{
    DeliveredFrame, MediaKind, SrtpStreamKeys, StreamConfig, StreamManager, StreamState,
    StreamStats,
};
use crate::transport_sink::TransportSink;
use arcrtc_keys::KeyProvider;
use arcrtc_logging::{LogLimiter, LogPermit};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-stream inbound queue capacity in packets; comfortably above the
/// deepest jitter target
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Budget for cancelling per-stream tasks on teardown
const TEARDOWN_BUDGET: Duration = Duration::from_millis(200);

/// Events surfaced to the embedding application
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A signaling message to deliver on the session's channel
    SignalingOutbound {
        session_id: Uuid,
        message: SignalingMessage,
    },
    /// The local encoder should reconfigure
    EncoderUpdate {
        stream_id: Uuid,
        quality: QualitySpec,
        reason: QualityReason,
    },
    /// A session was torn down and its keys released
    SessionTorndown {
        session_id: Uuid,
        reason: StopReason,
    },
}

/// Bounded inbound queue with drop-oldest backpressure
struct InboundQueue {
    inner: std::sync::Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl InboundQueue {
    fn new() -> Self {
        InboundQueue {
            inner: std::sync::Mutex::new(VecDeque::with_capacity(INBOUND_QUEUE_CAPACITY)),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Push a datagram; returns true when the oldest packet was dropped
    fn push(&self, bytes: Bytes) -> bool {
        let dropped = {
            let mut queue = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = if queue.len() >= INBOUND_QUEUE_CAPACITY {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(bytes);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes);
                }
            }
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct StreamTask {
    queue: Arc<InboundQueue>,
    worker: JoinHandle<()>,
}

/// The engine root: one per process endpoint
pub struct MediaEngine {
    config: MediaEngineConfig,
    manager: Arc<Mutex<StreamManager>>,
    signaling: Arc<Mutex<ArcSignalingEngine>>,
    keys: Arc<SessionKeyManager>,
    sink: Arc<dyn TransportSink>,
    /// SSRC -> stream task for the inbound pump
    tasks: Arc<Mutex<HashMap<u32, StreamTask>>>,
    /// stream id -> consumer delivery channel
    deliveries: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<DeliveredFrame>>>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    packet_log: Arc<LogLimiter>,
    background: Vec<JoinHandle<()>>,
}

impl MediaEngine {
    /// Construct an engine; fails fast on configuration errors
    pub fn new(
        config: MediaEngineConfig,
        local_peer_id: Uuid,
        key_provider: Arc<dyn KeyProvider>,
        sink: Arc<dyn TransportSink>,
        relay_servers: Vec<RelayServer>,
    ) -> MediaEngineResult<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let keys = Arc::new(SessionKeyManager::new(key_provider, config.crypto.suite));
        let signaling = Arc::new(Mutex::new(ArcSignalingEngine::new(
            local_peer_id,
            &config,
            relay_servers,
        )));
        let manager = Arc::new(Mutex::new(StreamManager::new(config.clone())));

        Ok(MediaEngine {
            config,
            manager,
            signaling,
            keys,
            sink,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            deliveries: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Some(events_rx),
            packet_log: Arc::new(LogLimiter::per_second()),
            background: Vec::new(),
        })
    }

    /// Take the engine event stream; call once before `start`
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events_rx.take().expect("events already taken")
    }

    /// Spawn the inbound pump and the periodic tick
    pub fn start(&mut self) {
        self.background.push(self.spawn_inbound_pump());
        self.background.push(self.spawn_tick());
    }

    /// Initiate a session toward a peer; the returned CONNECT goes out on
    /// the signaling channel
    pub async fn initiate_session(
        &self,
        session_id: Uuid,
        capabilities: PeerCapabilities,
        network_info: NetworkInfo,
    ) -> MediaEngineResult<SignalingMessage> {
        let mut signaling = self.signaling.lock().await;
        signaling.initiate(session_id, capabilities, network_info)
    }

    /// Feed one text-framed signaling message from the session channel
    pub async fn handle_signaling(&self, text: &str) -> MediaEngineResult<()> {
        let message = SignalingMessage::from_json(text)?;
        let actions = {
            let mut signaling = self.signaling.lock().await;
            signaling.handle_message(message)?
        };
        self.execute_actions(actions).await
    }

    /// Subscribe to in-order frames delivered for a stream
    pub async fn subscribe_stream(
        &self,
        stream_id: Uuid,
    ) -> mpsc::UnboundedReceiver<DeliveredFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.deliveries.lock().await.insert(stream_id, tx);
        rx
    }

    /// Send one media packet on a stream; transient transport failures are
    /// retried once
    pub async fn send_media(&self, stream_id: Uuid, packet: RtpPacket) -> MediaEngineResult<()> {
        let (endpoint, bytes) = {
            let mut manager = self.manager.lock().await;
            manager.route_outbound(stream_id, packet)?
        };
        self.send_with_retry(endpoint, bytes).await
    }

    /// Stream statistics snapshot
    pub async fn stats(&self, stream_id: Uuid) -> MediaEngineResult<StreamStats> {
        self.manager.lock().await.get_stats(stream_id)
    }

    /// Resolve the internal stream id carrying an SSRC
    pub async fn stream_id_by_ssrc(&self, ssrc: u32) -> Option<Uuid> {
        self.manager.lock().await.stream_by_ssrc(ssrc)
    }

    /// Stop the engine: cancel all tasks within the teardown budget
    pub async fn shutdown(&mut self) {
        {
            let tasks = self.tasks.lock().await;
            for task in tasks.values() {
                task.queue.close();
            }
        }
        tokio::time::sleep(TEARDOWN_BUDGET).await;
        let mut tasks = self.tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.worker.abort();
        }
        for handle in self.background.drain(..) {
            handle.abort();
        }
    }

    async fn send_with_retry(&self, endpoint: SocketAddr, bytes: Bytes) -> MediaEngineResult<()> {
        match self.sink.send(endpoint, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(error = %first, "Datagram send failed, retrying once");
                self.sink
                    .send(endpoint, bytes)
                    .await
                    .map_err(MediaEngineError::Transport)
            }
        }
    }

    async fn execute_actions(&self, actions: Vec<SignalingAction>) -> MediaEngineResult<()> {
        for action in actions {
            match action {
                SignalingAction::Send {
                    session_id,
                    message,
                } => {
                    let _ = self.events_tx.send(EngineEvent::SignalingOutbound {
                        session_id,
                        message,
                    });
                }
                SignalingAction::InstallKeys {
                    session_id,
                    master_key,
                    master_salt,
                } => {
                    self.keys
                        .install(&session_id, &master_key, &master_salt)
                        .await?;
                    info!(session_id = %session_id, "Installed session key material");
                }
                SignalingAction::StartStream {
                    session_id,
                    stream_id,
                    stream_type,
                    codec,
                    ssrc,
                    encrypted,
                    ..
                } => {
                    self.start_stream(session_id, stream_id, stream_type, codec.name, ssrc, encrypted)
                        .await?;
                }
                SignalingAction::StopStream {
                    session_id: _,
                    stream_id,
                    reason,
                } => {
                    self.stop_stream(stream_id, reason).await?;
                }
                SignalingAction::ApplyQuality {
                    stream_id,
                    quality,
                    reason,
                    ..
                } => {
                    let _ = self.events_tx.send(EngineEvent::EncoderUpdate {
                        stream_id,
                        quality,
                        reason,
                    });
                }
                SignalingAction::RecordRtt { session_id, rtt_ms } => {
                    let mut manager = self.manager.lock().await;
                    manager.record_session_rtt(session_id, rtt_ms);
                }
                SignalingAction::TeardownSession { session_id, reason } => {
                    self.teardown_session(session_id, reason).await;
                }
            }
        }
        Ok(())
    }

    async fn start_stream(
        &self,
        session_id: Uuid,
        stream_id: Uuid,
        stream_type: StreamType,
        codec: String,
        ssrc: u32,
        encrypted: bool,
    ) -> MediaEngineResult<()> {
        let media_kind = match stream_type {
            StreamType::Audio => MediaKind::Audio,
            // A "both" stream is registered under its video clock
            StreamType::Video | StreamType::Both => MediaKind::Video,
        };

        let srtp_keys = if encrypted {
            let (master_key, master_salt) = self.keys.fetch(&session_id).await?;
            Some(SrtpStreamKeys {
                master_key,
                master_salt,
            })
        } else {
            None
        };

        let bitrate = match media_kind {
            MediaKind::Audio => 64_000,
            MediaKind::Video => 1_200_000,
        };

        {
            let mut manager = self.manager.lock().await;
            manager.create_stream_with_id(
                stream_id,
                StreamConfig {
                    session_id,
                    media_kind,
                    ssrc,
                    payload_type: 96,
                    codec,
                    bitrate,
                    // Media flows back over the signaling-negotiated path;
                    // the transport implementation resolves the endpoint
                    remote_endpoint: SocketAddr::from(([0, 0, 0, 0], 0)),
                    srtp_keys,
                },
            )?;
            manager.update_state(stream_id, StreamState::Active)?;
        }

        self.spawn_stream_worker(ssrc, stream_id).await;
        info!(session_id = %session_id, stream_id = %stream_id, ssrc, "Stream active");
        Ok(())
    }

    async fn stop_stream(&self, stream_id: Uuid, reason: StopReason) -> MediaEngineResult<()> {
        let ssrc = {
            let mut manager = self.manager.lock().await;
            let ssrc = manager
                .get_stream(stream_id)
                .map(|s| s.ssrc())
                .ok_or(StateError::UnknownStream(stream_id))?;
            manager.update_state(stream_id, StreamState::Stopped)?;
            ssrc
        };

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(&ssrc) {
            task.queue.close();
        }
        self.deliveries.lock().await.remove(&stream_id);
        info!(stream_id = %stream_id, ?reason, "Stream stopped");
        Ok(())
    }

    async fn teardown_session(&self, session_id: Uuid, reason: StopReason) {
        let members = {
            let mut manager = self.manager.lock().await;
            let members: Vec<(Uuid, u32)> = manager
                .session_streams(session_id)
                .into_iter()
                .filter_map(|id| manager.get_stream(id).map(|s| (id, s.ssrc())))
                .collect();
            manager.teardown_session(session_id);
            members
        };

        {
            let mut tasks = self.tasks.lock().await;
            let mut deliveries = self.deliveries.lock().await;
            for (stream_id, ssrc) in &members {
                deliveries.remove(stream_id);
                if let Some(task) = tasks.remove(ssrc) {
                    task.queue.close();
                }
            }
        }

        self.keys.release(&session_id).await;
        self.signaling.lock().await.forget_session(session_id);
        let _ = self.events_tx.send(EngineEvent::SessionTorndown { session_id, reason });
        warn!(session_id = %session_id, ?reason, "Session torn down");
    }

    async fn spawn_stream_worker(&self, ssrc: u32, stream_id: Uuid) {
        let queue = Arc::new(InboundQueue::new());
        let manager = Arc::clone(&self.manager);
        let deliveries = Arc::clone(&self.deliveries);
        let packet_log = Arc::clone(&self.packet_log);
        let signaling = Arc::clone(&self.signaling);
        let events_tx = self.events_tx.clone();
        let auth_teardown = self.config.auth_fail_teardown_per_s;
        let keys = Arc::clone(&self.keys);

        let worker_queue = Arc::clone(&queue);
        let worker = tokio::spawn(async move {
            while let Some(bytes) = worker_queue.pop().await {
                let mut mgr = manager.lock().await;
                match mgr.route_inbound(&bytes) {
                    Ok(id) => {
                        let frames = match mgr.poll_stream(id) {
                            Ok(frames) => frames,
                            Err(_) => continue,
                        };
                        drop(mgr);
                        if frames.is_empty() {
                            continue;
                        }
                        let deliveries = deliveries.lock().await;
                        if let Some(tx) = deliveries.get(&id) {
                            for frame in frames {
                                let _ = tx.send(frame);
                            }
                        }
                    }
                    Err(e) => {
                        // Fast-path errors are counted, not propagated
                        let flood = mgr
                            .get_stream(stream_id)
                            .map(|s| s.auth_failures_last_second() > auth_teardown)
                            .unwrap_or(false);
                        let session_id = mgr.get_stream(stream_id).map(|s| s.session_id());
                        drop(mgr);

                        if let LogPermit::Granted { suppressed } = packet_log.check() {
                            warn!(error = %e, suppressed, "Dropped inbound packet");
                        }

                        if flood {
                            if let Some(session_id) = session_id {
                                warn!(session_id = %session_id, "Auth failure flood, closing session");
                                let actions = {
                                    let mut sig = signaling.lock().await;
                                    sig.close_session(session_id, StopReason::Error)
                                };
                                if let Ok(actions) = actions {
                                    for action in actions {
                                        if let SignalingAction::TeardownSession {
                                            session_id,
                                            reason,
                                        } = action
                                        {
                                            let mut m = manager.lock().await;
                                            m.teardown_session(session_id);
                                            drop(m);
                                            keys.release(&session_id).await;
                                            let _ = events_tx.send(EngineEvent::SessionTorndown {
                                                session_id,
                                                reason,
                                            });
                                        }
                                    }
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });

        self.tasks
            .lock()
            .await
            .insert(ssrc, StreamTask { queue, worker });
    }

    fn spawn_inbound_pump(&self) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let tasks = Arc::clone(&self.tasks);
        let manager = Arc::clone(&self.manager);
        let packet_log = Arc::clone(&self.packet_log);

        tokio::spawn(async move {
            loop {
                let (_from, datagram) = match sink.recv().await {
                    Ok(received) => received,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        if let LogPermit::Granted { suppressed } = packet_log.check() {
                            warn!(error = %e, suppressed, "Datagram read failed");
                        }
                        continue;
                    }
                };

                if is_rtcp(&datagram) {
                    handle_rtcp(&manager, &datagram).await;
                    continue;
                }

                // Cheap header parse for the SSRC only
                let ssrc = match RtpHeader::parse(&datagram) {
                    Ok((header, _)) => header.ssrc,
                    Err(e) => {
                        if let LogPermit::Granted { suppressed } = packet_log.check() {
                            warn!(error = %e, suppressed, "Unparseable datagram");
                        }
                        continue;
                    }
                };

                let outcome = {
                    let tasks = tasks.lock().await;
                    match tasks.get(&ssrc) {
                        Some(task) => Some(task.queue.push(datagram)),
                        None => None,
                    }
                };
                match outcome {
                    Some(true) => {
                        // Tail drop: the oldest packet was sacrificed for latency
                        let mut mgr = manager.lock().await;
                        if let Some(id) = mgr.stream_by_ssrc(ssrc) {
                            mgr.record_queue_drop(id);
                        }
                    }
                    Some(false) => {}
                    None => {
                        if let LogPermit::Granted { suppressed } = packet_log.check() {
                            warn!(ssrc, suppressed, "Datagram for unknown SSRC");
                        }
                    }
                }
            }
        })
    }

    fn spawn_tick(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let signaling = Arc::clone(&self.signaling);
        let events_tx = self.events_tx.clone();
        let keys = Arc::clone(&self.keys);
        let deliveries = Arc::clone(&self.deliveries);
        let tasks = Arc::clone(&self.tasks);
        let interval = Duration::from_millis(self.config.jitter.adapt_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();

                // Quality adaptation across streams
                let decisions = {
                    let mut mgr = manager.lock().await;
                    mgr.adapt_tick(now)
                };
                for (stream_id, decision) in decisions {
                    emit_quality_events(&manager, &events_tx, stream_id, decision).await;
                }

                // Heartbeats and dead-session detection
                let actions = {
                    let mut sig = signaling.lock().await;
                    sig.tick_at(now)
                };
                for action in actions {
                    match action {
                        SignalingAction::Send {
                            session_id,
                            message,
                        } => {
                            let _ = events_tx.send(EngineEvent::SignalingOutbound {
                                session_id,
                                message,
                            });
                        }
                        SignalingAction::TeardownSession { session_id, reason } => {
                            let members = {
                                let mut mgr = manager.lock().await;
                                let members: Vec<(Uuid, u32)> = mgr
                                    .session_streams(session_id)
                                    .into_iter()
                                    .filter_map(|id| mgr.get_stream(id).map(|s| (id, s.ssrc())))
                                    .collect();
                                mgr.teardown_session(session_id);
                                members
                            };
                            {
                                let mut tasks = tasks.lock().await;
                                let mut deliveries = deliveries.lock().await;
                                for (stream_id, ssrc) in &members {
                                    deliveries.remove(stream_id);
                                    if let Some(task) = tasks.remove(ssrc) {
                                        task.queue.close();
                                    }
                                }
                            }
                            keys.release(&session_id).await;
                            let _ = events_tx.send(EngineEvent::SessionTorndown {
                                session_id,
                                reason,
                            });
                        }
                        _ => {}
                    }
                }
            }
        })
    }
}

/// Emit the local-encoder and peer-facing messages for one adapt decision
async fn emit_quality_events(
    manager: &Arc<Mutex<StreamManager>>,
    events_tx: &mpsc::UnboundedSender<EngineEvent>,
    stream_id: Uuid,
    decision: AdaptDecision,
) {
    let (session_id, media_kind) = {
        let mgr = manager.lock().await;
        match mgr.get_stream(stream_id) {
            Some(stream) => (stream.session_id(), stream.media_kind()),
            None => return,
        }
    };

    let profile = decision.level.video_profile();
    let quality = match media_kind {
        MediaKind::Audio => QualitySpec {
            bitrate: decision.level.audio_bitrate_bps(),
            resolution: String::new(),
            fps: 0,
        },
        MediaKind::Video => QualitySpec {
            bitrate: profile.bitrate_bps,
            resolution: decision.level.resolution_str(),
            fps: profile.framerate,
        },
    };
    let reason = match decision.reason {
        AdaptReason::Bandwidth => QualityReason::Bandwidth,
        AdaptReason::Cpu => QualityReason::Cpu,
        AdaptReason::Network => QualityReason::Network,
        AdaptReason::Keyframe => QualityReason::Keyframe,
    };

    // Local encoder reconfigures immediately
    let _ = events_tx.send(EngineEvent::EncoderUpdate {
        stream_id,
        quality: quality.clone(),
        reason,
    });

    // Peer learns via QUALITY_ADAPT; in-band bits change with the next
    // outbound packet
    let _ = events_tx.send(EngineEvent::SignalingOutbound {
        session_id,
        message: SignalingMessage::QualityAdapt(crate::arcsignaling::QualityAdapt {
            session_id,
            stream_id,
            quality,
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }),
    });
}

/// RTCP demultiplexing: packet type 200..=204 in the second byte
fn is_rtcp(datagram: &[u8]) -> bool {
    datagram.len() >= 2 && (200..=204).contains(&datagram[1])
}

/// Feed RTCP reception reports into the owning streams' health monitors
async fn handle_rtcp(manager: &Arc<Mutex<StreamManager>>, datagram: &[u8]) {
    let packets = match RtcpPacket::parse_compound(datagram) {
        Ok(packets) => packets,
        Err(e) => {
            debug!(error = %e, "Malformed RTCP datagram");
            return;
        }
    };

    let mut mgr = manager.lock().await;
    for packet in packets {
        let reports = match &packet {
            RtcpPacket::SenderReport(sr) => &sr.reception_reports,
            RtcpPacket::ReceiverReport(rr) => &rr.reception_reports,
            _ => continue,
        };
        for report in reports {
            if let Some(stream_id) = mgr.stream_by_ssrc(report.ssrc) {
                if let Some(stream) = mgr.get_stream_mut(stream_id) {
                    stream.ingest_reception_report(report);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_sink::loopback_pair;
    use arcrtc_keys::InMemoryKeyProvider;

    fn engine_pair() -> (MediaEngine, MediaEngine) {
        let (sink_a, sink_b) = loopback_pair();
        let a = MediaEngine::new(
            MediaEngineConfig::default(),
            Uuid::new_v4(),
            Arc::new(InMemoryKeyProvider::new()),
            Arc::new(sink_a),
            vec![],
        )
        .unwrap();
        let b = MediaEngine::new(
            MediaEngineConfig::default(),
            Uuid::new_v4(),
            Arc::new(InMemoryKeyProvider::new()),
            Arc::new(sink_b),
            vec![],
        )
        .unwrap();
        (a, b)
    }

    #[test]
    fn test_is_rtcp_discriminates() {
        // RTP: version 2, payload type 96
        assert!(!is_rtcp(&[0x80, 0x60, 0, 0]));
        // RTCP SR: packet type 200
        assert!(is_rtcp(&[0x80, 200, 0, 0]));
        assert!(is_rtcp(&[0x81, 203, 0, 0]));
        assert!(!is_rtcp(&[0x80]));
    }

    #[test]
    fn test_inbound_queue_drop_oldest() {
        let queue = InboundQueue::new();
        for i in 0..INBOUND_QUEUE_CAPACITY {
            assert!(!queue.push(Bytes::from(vec![i as u8])));
        }
        // Capacity reached: the oldest packet goes
        assert!(queue.push(Bytes::from_static(b"newest")));
        let first = queue.inner.lock().unwrap().pop_front().unwrap();
        assert_eq!(first[0], 1);
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let (sink, _peer) = loopback_pair();
        let mut config = MediaEngineConfig::default();
        config.jitter.min_depth_ms = 500;
        let err = MediaEngine::new(
            config,
            Uuid::new_v4(),
            Arc::new(InMemoryKeyProvider::new()),
            Arc::new(sink),
            vec![],
        );
        assert!(matches!(err, Err(MediaEngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_signaling_handshake_between_engines() {
        let (mut a, mut b) = engine_pair();
        let mut a_events = a.take_events();
        let mut b_events = b.take_events();

        let session_id = Uuid::new_v4();
        let connect = a
            .initiate_session(
                session_id,
                PeerCapabilities {
                    codecs: vec!["opus".to_string()],
                    resolutions: vec![],
                    encryption: vec!["aes128_gcm".to_string()],
                    transport: vec!["udp".to_string()],
                },
                NetworkInfo {
                    public_ip: "192.0.2.1".to_string(),
                    public_port: 40_000,
                    nat_type: crate::arcsignaling::NatType::FullCone,
                },
            )
            .await
            .unwrap();

        // Deliver CONNECT to B; collect its CONNECT_ACK
        b.handle_signaling(&connect.to_json().unwrap()).await.unwrap();
        let ack = loop {
            match b_events.recv().await.unwrap() {
                EngineEvent::SignalingOutbound { message, .. } => break message,
                _ => continue,
            }
        };

        // Deliver the ack back to A; both sides end Established with keys
        a.handle_signaling(&ack.to_json().unwrap()).await.unwrap();

        assert!(a.keys.fetch(&session_id).await.is_ok());
        assert!(b.keys.fetch(&session_id).await.is_ok());

        // No events expected on A beyond none (keys install silently)
        assert!(a_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_start_creates_active_stream() {
        let (mut a, mut b) = engine_pair();
        let _a_events = a.take_events();
        let mut b_events = b.take_events();

        let session_id = Uuid::new_v4();
        let connect = a
            .initiate_session(
                session_id,
                PeerCapabilities {
                    codecs: vec!["opus".to_string()],
                    resolutions: vec![],
                    encryption: vec!["aes128_gcm".to_string()],
                    transport: vec!["udp".to_string()],
                },
                NetworkInfo {
                    public_ip: "192.0.2.1".to_string(),
                    public_port: 40_000,
                    nat_type: crate::arcsignaling::NatType::FullCone,
                },
            )
            .await
            .unwrap();
        b.handle_signaling(&connect.to_json().unwrap()).await.unwrap();
        let ack = loop {
            match b_events.recv().await.unwrap() {
                EngineEvent::SignalingOutbound { message, .. } => break message,
                _ => continue,
            }
        };
        a.handle_signaling(&ack.to_json().unwrap()).await.unwrap();

        // Peer starts an encrypted audio stream on B
        let start = SignalingMessage::StreamStart(crate::arcsignaling::StreamStart {
            session_id,
            stream_id: Uuid::new_v4(),
            stream_type: StreamType::Audio,
            codec: crate::arcsignaling::CodecParams {
                name: "opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
            },
            ssrc: 12345,
            encryption: crate::arcsignaling::StreamEncryption {
                key_id: SessionKeyManager::master_key_id(&session_id),
                algorithm: "aes128_gcm".to_string(),
            },
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        b.handle_signaling(&start.to_json().unwrap()).await.unwrap();

        let manager = b.manager.lock().await;
        let stream_id = manager.stream_by_ssrc(12345).unwrap();
        assert_eq!(
            manager.get_stream(stream_id).unwrap().state(),
            StreamState::Active
        );
    }

    #[tokio::test]
    async fn test_premature_stream_start_rejected() {
        let (_a, b) = engine_pair();
        let session_id = Uuid::new_v4();

        let start = SignalingMessage::StreamStart(crate::arcsignaling::StreamStart {
            session_id,
            stream_id: Uuid::new_v4(),
            stream_type: StreamType::Audio,
            codec: crate::arcsignaling::CodecParams {
                name: "opus".to_string(),
                clock_rate: 48_000,
                channels: None,
            },
            ssrc: 1,
            encryption: crate::arcsignaling::StreamEncryption {
                key_id: String::new(),
                algorithm: "none".to_string(),
            },
            timestamp: 0,
        });
        // No session at all: unknown session
        assert!(b.handle_signaling(&start.to_json().unwrap()).await.is_err());
    }
}
