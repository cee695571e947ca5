//! RTCP (RTP Control Protocol) packet codec
//!
//! Implements RFC 3550 RTCP packet types for reception statistics and
//! session control: SR, RR, SDES and BYE, plus compound datagram parsing.
//! The same round-trip law as the RTP codec applies.
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


use crate::error::ParseError;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Offset between the NTP epoch (1900) and the unix epoch (1970), seconds
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// RTCP packet types (RFC 3550 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport = 200,
    /// Receiver Report (RR) - 201
    ReceiverReport = 201,
    /// Source Description (SDES) - 202
    SourceDescription = 202,
    /// Goodbye (BYE) - 203
    Goodbye = 203,
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of the reported source
    pub ssrc: u32,
    /// Fraction lost since the previous report (8 bits)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_highest_sequence: u32,
    /// Interarrival jitter in timestamp units
    pub jitter: u32,
    /// Last SR timestamp (middle 32 bits of the SR's NTP timestamp)
    pub last_sr_timestamp: u32,
    /// Delay since last SR in 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    const SIZE: usize = 24;

    /// Round-trip time derived from LSR/DLSR against the receiver's clock,
    /// `now_ntp` being the current middle-32 NTP timestamp. Returns `None`
    /// when no SR has been mirrored yet.
    pub fn rtt_ms(&self, now_ntp: u32) -> Option<f64> {
        if self.last_sr_timestamp == 0 {
            return None;
        }
        let delta = now_ntp
            .wrapping_sub(self.last_sr_timestamp)
            .wrapping_sub(self.delay_since_last_sr);
        // Middle-32 NTP units are 1/65536 seconds
        Some(delta as f64 * 1000.0 / 65536.0)
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < Self::SIZE {
            return Err(ParseError::TruncatedRtcp);
        }
        // Cumulative loss is a signed 24-bit field; sign-extend it
        let lost_raw = (data[5] as u32) << 16 | (data[6] as u32) << 8 | data[7] as u32;
        let cumulative_packets_lost = if lost_raw & 0x0080_0000 != 0 {
            (lost_raw | 0xFF00_0000) as i32
        } else {
            lost_raw as i32
        };
        Ok(ReceptionReport {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction_lost: data[4],
            cumulative_packets_lost,
            extended_highest_sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            last_sr_timestamp: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            delay_since_last_sr: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        let lost = self.cumulative_packets_lost.clamp(-0x0080_0000, 0x007F_FFFF);
        let lost_bytes = (lost as u32 & 0x00FF_FFFF).to_be_bytes();
        buf.put_u8(lost_bytes[1]);
        buf.put_u8(lost_bytes[2]);
        buf.put_u8(lost_bytes[3]);
        buf.put_u32(self.extended_highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr_timestamp);
        buf.put_u32(self.delay_since_last_sr);
    }
}

/// RTCP Sender Report (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// SSRC of the sender
    pub ssrc: u32,
    /// NTP timestamp, most significant word
    pub ntp_timestamp_msw: u32,
    /// NTP timestamp, least significant word
    pub ntp_timestamp_lsw: u32,
    /// RTP timestamp corresponding to the NTP timestamp
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub sender_packet_count: u32,
    /// Sender's octet count
    pub sender_octet_count: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// SSRC of the receiver
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

/// SDES item types (RFC 3550 Section 6.5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesItemType {
    /// Canonical end-point identifier, required
    Cname = 1,
    /// User name
    Name = 2,
    /// Application or tool name
    Tool = 6,
    /// Notice/status
    Note = 7,
}

impl SdesItemType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SdesItemType::Cname),
            2 => Some(SdesItemType::Name),
            6 => Some(SdesItemType::Tool),
            7 => Some(SdesItemType::Note),
            _ => None,
        }
    }
}

/// SDES item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: SdesItemType,
    pub value: String,
}

/// SDES chunk: one SSRC and its items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

/// RTCP Source Description (RFC 3550 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

/// RTCP Goodbye (RFC 3550 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    /// SSRCs leaving the session
    pub ssrcs: Vec<u32>,
    /// Optional reason for leaving
    pub reason: Option<String>,
}

/// One parsed RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
}

impl RtcpPacket {
    /// Parse a single RTCP packet, returning it and the bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        if data.len() < 4 {
            return Err(ParseError::TruncatedRtcp);
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let padding = (first_byte & 0x20) != 0;
        if padding {
            // SRTCP handles padding before the codec sees the packet; an
            // unprotected padded RTCP packet is not produced by this stack.
            return Err(ParseError::BadPadding(data[data.len() - 1] as usize));
        }
        let count = (first_byte & 0x1F) as usize;
        let packet_type = data[1];
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        let total_len = (length_words + 1) * 4;

        if data.len() < total_len {
            return Err(ParseError::TruncatedRtcp);
        }
        let body = &data[4..total_len];

        let packet = match packet_type {
            200 => RtcpPacket::SenderReport(Self::parse_sender_report(body, count)?),
            201 => RtcpPacket::ReceiverReport(Self::parse_receiver_report(body, count)?),
            202 => RtcpPacket::SourceDescription(Self::parse_sdes(body, count)?),
            203 => RtcpPacket::Goodbye(Self::parse_bye(body, count)?),
            other => return Err(ParseError::UnknownRtcpType(other)),
        };

        Ok((packet, total_len))
    }

    /// Parse a compound RTCP datagram: a sequence of packets terminated
    /// when the accumulated length reaches the datagram end
    pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, ParseError> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (packet, consumed) = Self::parse(&data[offset..])?;
            packets.push(packet);
            offset += consumed;
        }
        Ok(packets)
    }

    /// Serialize to wire bytes
    pub fn serialize(&self) -> Bytes {
        let mut body = BytesMut::new();
        let (packet_type, count) = match self {
            RtcpPacket::SenderReport(sr) => {
                body.put_u32(sr.ssrc);
                body.put_u32(sr.ntp_timestamp_msw);
                body.put_u32(sr.ntp_timestamp_lsw);
                body.put_u32(sr.rtp_timestamp);
                body.put_u32(sr.sender_packet_count);
                body.put_u32(sr.sender_octet_count);
                for report in &sr.reception_reports {
                    report.write(&mut body);
                }
                (RtcpPacketType::SenderReport, sr.reception_reports.len())
            }
            RtcpPacket::ReceiverReport(rr) => {
                body.put_u32(rr.ssrc);
                for report in &rr.reception_reports {
                    report.write(&mut body);
                }
                (RtcpPacketType::ReceiverReport, rr.reception_reports.len())
            }
            RtcpPacket::SourceDescription(sdes) => {
                for chunk in &sdes.chunks {
                    body.put_u32(chunk.ssrc);
                    for item in &chunk.items {
                        body.put_u8(item.item_type as u8);
                        body.put_u8(item.value.len().min(255) as u8);
                        body.put_slice(&item.value.as_bytes()[..item.value.len().min(255)]);
                    }
                    // END item, then pad the chunk to a 32-bit boundary
                    body.put_u8(0);
                    while body.len() % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                (RtcpPacketType::SourceDescription, sdes.chunks.len())
            }
            RtcpPacket::Goodbye(bye) => {
                for &ssrc in &bye.ssrcs {
                    body.put_u32(ssrc);
                }
                if let Some(ref reason) = bye.reason {
                    let reason_bytes = &reason.as_bytes()[..reason.len().min(255)];
                    body.put_u8(reason_bytes.len() as u8);
                    body.put_slice(reason_bytes);
                    while body.len() % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                (RtcpPacketType::Goodbye, bye.ssrcs.len())
            }
        };

        let mut buf = BytesMut::with_capacity(4 + body.len());
        let first_byte = (2u8 << 6) | (count as u8 & 0x1F);
        buf.put_u8(first_byte);
        buf.put_u8(packet_type as u8);
        buf.put_u16((body.len() / 4) as u16);
        buf.put_slice(&body);
        buf.freeze()
    }

    fn parse_sender_report(body: &[u8], count: usize) -> Result<SenderReport, ParseError> {
        if body.len() < 24 {
            return Err(ParseError::TruncatedRtcp);
        }
        let mut reports = Vec::with_capacity(count);
        let mut offset = 24;
        for _ in 0..count {
            reports.push(ReceptionReport::parse(
                body.get(offset..).ok_or(ParseError::TruncatedRtcp)?,
            )?);
            offset += ReceptionReport::SIZE;
        }
        Ok(SenderReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            ntp_timestamp_msw: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            ntp_timestamp_lsw: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            rtp_timestamp: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
            sender_packet_count: u32::from_be_bytes([body[16], body[17], body[18], body[19]]),
            sender_octet_count: u32::from_be_bytes([body[20], body[21], body[22], body[23]]),
            reception_reports: reports,
        })
    }

    fn parse_receiver_report(body: &[u8], count: usize) -> Result<ReceiverReport, ParseError> {
        if body.len() < 4 {
            return Err(ParseError::TruncatedRtcp);
        }
        let mut reports = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            reports.push(ReceptionReport::parse(
                body.get(offset..).ok_or(ParseError::TruncatedRtcp)?,
            )?);
            offset += ReceptionReport::SIZE;
        }
        Ok(ReceiverReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            reception_reports: reports,
        })
    }

    fn parse_sdes(body: &[u8], count: usize) -> Result<SourceDescription, ParseError> {
        let mut chunks = Vec::with_capacity(count);
        let mut offset = 0;
        for _ in 0..count {
            if body.len() < offset + 4 {
                return Err(ParseError::TruncatedRtcp);
            }
            let ssrc = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]);
            offset += 4;

            let mut items = Vec::new();
            loop {
                let type_byte = *body.get(offset).ok_or(ParseError::TruncatedRtcp)?;
                offset += 1;
                if type_byte == 0 {
                    // END item; skip chunk padding to the 32-bit boundary
                    while offset % 4 != 0 {
                        if *body.get(offset).ok_or(ParseError::TruncatedRtcp)? != 0 {
                            return Err(ParseError::TruncatedRtcp);
                        }
                        offset += 1;
                    }
                    break;
                }
                let item_type =
                    SdesItemType::from_u8(type_byte).ok_or(ParseError::UnknownRtcpType(type_byte))?;
                let len = *body.get(offset).ok_or(ParseError::TruncatedRtcp)? as usize;
                offset += 1;
                let raw = body
                    .get(offset..offset + len)
                    .ok_or(ParseError::TruncatedRtcp)?;
                offset += len;
                let value = String::from_utf8(raw.to_vec())
                    .map_err(|_| ParseError::TruncatedRtcp)?;
                items.push(SdesItem { item_type, value });
            }
            chunks.push(SdesChunk { ssrc, items });
        }
        Ok(SourceDescription { chunks })
    }

    fn parse_bye(body: &[u8], count: usize) -> Result<Goodbye, ParseError> {
        if body.len() < count * 4 {
            return Err(ParseError::TruncatedRtcp);
        }
        let mut ssrcs = Vec::with_capacity(count);
        for i in 0..count {
            ssrcs.push(u32::from_be_bytes([
                body[i * 4],
                body[i * 4 + 1],
                body[i * 4 + 2],
                body[i * 4 + 3],
            ]));
        }
        let mut offset = count * 4;
        let reason = if offset < body.len() {
            let len = body[offset] as usize;
            offset += 1;
            let raw = body
                .get(offset..offset + len)
                .ok_or(ParseError::TruncatedRtcp)?;
            Some(String::from_utf8(raw.to_vec()).map_err(|_| ParseError::TruncatedRtcp)?)
        } else {
            None
        };
        Ok(Goodbye { ssrcs, reason })
    }
}

/// Current NTP timestamp as (msw, lsw)
pub fn ntp_now() -> (u32, u32) {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let msw = (since_epoch.as_secs() + NTP_UNIX_OFFSET) as u32;
    let lsw = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (msw, lsw as u32)
}

/// Middle 32 bits of the current NTP timestamp (for LSR/DLSR fields)
pub fn ntp_now_mid32() -> u32 {
    let (msw, lsw) = ntp_now();
    (msw << 16) | (lsw >> 16)
}
