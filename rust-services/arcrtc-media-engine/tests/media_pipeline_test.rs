//! End-to-end pipeline tests over the stream manager
//!
//! Exercises the inbound path (crypto -> jitter buffer -> concealment)
//! and the adaptation loop with literal packet sequences.
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


use arcrtc_media_engine::{
    AdaptReason, CryptoError, DeliveredFrame, MediaEngineConfig, MediaEngineError, MediaKind,
    QualityLevel, RtpHeader, RtpPacket, SrtpStreamKeys, StreamConfig, StreamManager, StreamState,
};
use bytes::Bytes;
use std::time::{Duration, Instant};
use uuid::Uuid;

const SSRC: u32 = 12345;

fn test_keys() -> SrtpStreamKeys {
    SrtpStreamKeys {
        master_key: vec![0x41; 16],
        master_salt: vec![0x52; 14],
    }
}

fn audio_config(encrypted: bool) -> StreamConfig {
    StreamConfig {
        session_id: Uuid::new_v4(),
        media_kind: MediaKind::Audio,
        ssrc: SSRC,
        payload_type: 96,
        codec: "opus".to_string(),
        bitrate: 64_000,
        remote_endpoint: "127.0.0.1:4000".parse().unwrap(),
        srtp_keys: encrypted.then(test_keys),
    }
}

fn audio_packet(seq: u16) -> RtpPacket {
    RtpPacket {
        header: RtpHeader {
            version: 2,
            padding: false,
            marker: false,
            payload_type: 96,
            sequence_number: seq,
            timestamp: seq as u32 * 960,
            ssrc: SSRC,
            csrc: vec![],
            extension: None,
        },
        payload: Bytes::from(vec![0xAA; 160]),
        padding: Bytes::new(),
    }
}

/// Sender and receiver managers sharing the same SRTP keys
fn encrypted_pair() -> (StreamManager, Uuid, StreamManager, Uuid) {
    let mut sender = StreamManager::new(MediaEngineConfig::default());
    let send_id = sender.create_stream(audio_config(true)).unwrap();
    sender.update_state(send_id, StreamState::Active).unwrap();

    let mut receiver = StreamManager::new(MediaEngineConfig::default());
    let recv_id = receiver.create_stream(audio_config(true)).unwrap();
    receiver.update_state(recv_id, StreamState::Active).unwrap();

    (sender, send_id, receiver, recv_id)
}

fn delivered_seqs(frames: &[DeliveredFrame]) -> Vec<u64> {
    frames.iter().map(|f| f.ext_seq()).collect()
}

// Scenario A: 100 sequential packets arrive clean and in order
#[test]
fn clean_loopback_delivers_everything_in_order() {
    let (mut sender, send_id, mut receiver, recv_id) = encrypted_pair();

    for seq in 1000..1100u16 {
        let (_, wire) = sender.route_outbound(send_id, audio_packet(seq)).unwrap();
        receiver.route_inbound(&wire).unwrap();
    }

    let frames = receiver.poll_stream(recv_id).unwrap();
    assert_eq!(frames.len(), 100);
    assert_eq!(
        delivered_seqs(&frames),
        (1000..1100u64).collect::<Vec<_>>()
    );
    for frame in &frames {
        match frame {
            DeliveredFrame::Packet { packet, .. } => {
                assert_eq!(packet.payload, Bytes::from(vec![0xAA; 160]));
            }
            other => panic!("unexpected concealment: {:?}", other),
        }
    }

    let stats = receiver.get_stats(recv_id).unwrap();
    assert_eq!(stats.packets_received, 100);
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.loss_rate, 0.0);
}

// Scenario B: reorder within the buffer depth comes out sorted
#[test]
fn reorder_within_depth_is_absorbed() {
    let (mut sender, send_id, mut receiver, recv_id) = encrypted_pair();

    let mut wires = Vec::new();
    for seq in [1000u16, 1001, 1002, 1003, 1004] {
        let (_, wire) = sender.route_outbound(send_id, audio_packet(seq)).unwrap();
        wires.push(wire);
    }
    // Deliver as 1000, 1001, 1003, 1002, 1004
    wires.swap(2, 3);
    for wire in &wires {
        receiver.route_inbound(wire).unwrap();
    }

    let frames = receiver.poll_stream(recv_id).unwrap();
    assert_eq!(delivered_seqs(&frames), vec![1000, 1001, 1002, 1003, 1004]);
}

// Scenario C: a hole turns into exactly one concealed frame
#[test]
fn missing_packet_is_concealed() {
    let (mut sender, send_id, mut receiver, recv_id) = encrypted_pair();

    for seq in 1000..1010u16 {
        let (_, wire) = sender.route_outbound(send_id, audio_packet(seq)).unwrap();
        if seq != 1005 {
            receiver.route_inbound(&wire).unwrap();
        }
    }

    // Let the gap at 1005 become overdue (initial target depth is 10 ms)
    std::thread::sleep(Duration::from_millis(15));

    let frames = receiver.poll_stream(recv_id).unwrap();
    assert_eq!(frames.len(), 10);
    assert_eq!(delivered_seqs(&frames), (1000..1010u64).collect::<Vec<_>>());
    assert!(matches!(frames[5], DeliveredFrame::Concealed { ext_seq: 1005, .. }));

    let stats = receiver.get_stats(recv_id).unwrap();
    assert_eq!(stats.packets_lost, 1);
    assert_eq!(stats.packets_concealed, 1);
}

// Scenario D: a replayed datagram is rejected and counted once
#[test]
fn replayed_datagram_is_rejected() {
    let (mut sender, send_id, mut receiver, recv_id) = encrypted_pair();

    let (_, wire) = sender.route_outbound(send_id, audio_packet(2000)).unwrap();
    receiver.route_inbound(&wire).unwrap();

    let err = receiver.route_inbound(&wire);
    assert!(matches!(
        err,
        Err(MediaEngineError::Crypto(CryptoError::ReplayDetected(_)))
    ));

    let frames = receiver.poll_stream(recv_id).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].ext_seq(), 2000);

    let stats = receiver.get_stats(recv_id).unwrap();
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.packets_received, 1);
}

// Scenario E: 16-bit sequence wrap keeps ordering via the rollover counter
#[test]
fn sequence_wrap_is_ordered() {
    let (mut sender, send_id, mut receiver, recv_id) = encrypted_pair();

    for seq in [65534u16, 65535, 0, 1, 2] {
        let (_, wire) = sender.route_outbound(send_id, audio_packet(seq)).unwrap();
        receiver.route_inbound(&wire).unwrap();
    }

    let frames = receiver.poll_stream(recv_id).unwrap();
    let wire_seqs: Vec<u16> = frames
        .iter()
        .map(|f| match f {
            DeliveredFrame::Packet { packet, .. } => packet.header.sequence_number,
            DeliveredFrame::Concealed { .. } => panic!("no loss injected"),
        })
        .collect();
    assert_eq!(wire_seqs, vec![65534, 65535, 0, 1, 2]);

    // Extended sequences crossed into the next rollover cycle
    assert_eq!(frames[2].ext_seq(), 1 << 16);
}

// Scenario F: sustained loss produces exactly one downgrade per dwell
#[test]
fn sustained_loss_downgrades_once() {
    let mut manager = StreamManager::new(MediaEngineConfig::default());
    let mut config = audio_config(false);
    config.media_kind = MediaKind::Video;
    config.codec = "h264".to_string();
    config.bitrate = 2_500_000; // starts at QualityLevel::High
    let id = manager.create_stream(config).unwrap();
    manager.update_state(id, StreamState::Active).unwrap();

    // 8% of the sequence range never arrives
    for seq in 0..100u16 {
        if seq % 25 < 2 {
            continue;
        }
        let wire = {
            let mut packet = audio_packet(seq);
            packet.header.payload_type = 97;
            packet.serialize()
        };
        manager.route_inbound(&wire).unwrap();
    }

    let start = Instant::now();
    let mut decisions = Vec::new();
    for tick in 0..3u64 {
        decisions.extend(manager.adapt_tick(start + Duration::from_millis(tick * 500)));
    }

    assert_eq!(decisions.len(), 1, "one downgrade within the dwell window");
    let (decided_stream, decision) = decisions[0];
    assert_eq!(decided_stream, id);
    assert_eq!(decision.level, QualityLevel::Medium);
    assert_eq!(decision.reason, AdaptReason::Network);

    let stats = manager.get_stats(id).unwrap();
    assert_eq!(stats.quality_level, Some(QualityLevel::Medium));
}
