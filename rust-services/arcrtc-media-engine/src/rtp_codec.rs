//! RTP (Real-time Transport Protocol) packet codec
//!
//! Implements RFC 3550 RTP packet parsing and construction. Parsing is
//! bit-exact: serializing a parsed packet reproduces the original byte
//! sequence, including CSRC lists, extension words and padding.
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

/// Profile identifier of the ArcRTC header extension ("AR")
pub const ARC_EXTENSION_PROFILE: u16 = 0x4152;

/// In-band quality indicator carried in the ArcRTC extension (2 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityIndicator {
    /// Full-quality delivery
    Excellent = 0,
    /// Minor degradation
    Good = 1,
    /// Noticeable degradation, receiver should widen its jitter target
    Fair = 2,
    /// Severe degradation, receiver should prepare for a quality switch
    Poor = 3,
}

impl QualityIndicator {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QualityIndicator::Excellent),
            1 => Some(QualityIndicator::Good),
            2 => Some(QualityIndicator::Fair),
            3 => Some(QualityIndicator::Poor),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Packet priority carried in the ArcRTC extension (2 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketPriority {
    /// Audio, silence breaks
    Critical = 0,
    /// Video keyframes (I-frames)
    High = 1,
    /// Video delta frames (P-frames)
    Medium = 2,
    /// Redundant data, B-frames
    Low = 3,
}

impl PacketPriority {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketPriority::Critical),
            1 => Some(PacketPriority::High),
            2 => Some(PacketPriority::Medium),
            3 => Some(PacketPriority::Low),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// The two 2-bit fields of the one-word ArcRTC profile extension
///
/// Wire layout: quality and priority occupy the low 4 bits of the first
/// extension byte (`qqpp`); the remaining 28 bits are reserved zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArcExtension {
    pub quality: QualityIndicator,
    pub priority: PacketPriority,
}

impl ArcExtension {
    /// Decode from an extension header, if it carries the ArcRTC profile
    pub fn from_extension(ext: &ExtensionHeader) -> Option<Self> {
        if ext.profile != ARC_EXTENSION_PROFILE || ext.data.len() < 4 {
            return None;
        }
        let byte = ext.data[0];
        let quality = QualityIndicator::from_u8((byte >> 2) & 0x03)?;
        let priority = PacketPriority::from_u8(byte & 0x03)?;
        Some(ArcExtension { quality, priority })
    }

    /// Encode as a one-word extension header
    pub fn to_extension(self) -> ExtensionHeader {
        let byte = (self.quality.to_u8() << 2) | self.priority.to_u8();
        ExtensionHeader {
            profile: ARC_EXTENSION_PROFILE,
            data: Bytes::copy_from_slice(&[byte, 0, 0, 0]),
        }
    }
}

/// RTP extension header (RFC 3550 Section 5.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    /// Extension profile identifier
    pub profile: u16,
    /// Extension data; always a multiple of 4 bytes on the wire
    pub data: Bytes,
}

/// RTP header as defined in RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number (16 bits)
    pub sequence_number: u16,
    /// Timestamp (32 bits)
    pub timestamp: u32,
    /// SSRC (Synchronization Source) identifier (32 bits)
    pub ssrc: u32,
    /// CSRC (Contributing Source) identifiers, up to 15
    pub csrc: Vec<u32>,
    /// Extension header (optional)
    pub extension: Option<ExtensionHeader>,
}

/// Complete RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data, padding excluded
    pub payload: Bytes,
    /// Raw trailing padding bytes, count byte included; empty when the
    /// padding flag is clear. Preserved verbatim for bit-exact round trips.
    pub padding: Bytes,
}

impl RtpHeader {
    /// Minimum RTP header size (12 bytes)
    pub const MIN_SIZE: usize = 12;

    /// Parse RTP header from bytes, returning the header and the rest of
    /// the datagram (payload plus any padding)
    pub fn parse(mut data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ParseError::HeaderTooShort(data.len()));
        }

        // First byte: V(2) P(1) X(1) CC(4)
        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let padding = (first_byte & 0x20) != 0;
        let has_extension = (first_byte & 0x10) != 0;
        let csrc_count = first_byte & 0x0F;

        // Second byte: M(1) PT(7)
        let second_byte = data[1];
        let marker = (second_byte & 0x80) != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        data = &data[Self::MIN_SIZE..];

        // CSRC list (4 bytes each)
        let mut csrc = Vec::with_capacity(csrc_count as usize);
        for _ in 0..csrc_count {
            if data.len() < 4 {
                return Err(ParseError::TruncatedCsrcList);
            }
            csrc.push(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
            data = &data[4..];
        }

        // Extension header (optional); length is in 32-bit words
        let extension = if has_extension {
            if data.len() < 4 {
                return Err(ParseError::TruncatedExtension);
            }
            let profile = u16::from_be_bytes([data[0], data[1]]);
            let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
            let ext_data_len = length_words * 4;

            if data.len() < 4 + ext_data_len {
                return Err(ParseError::TruncatedExtension);
            }

            let ext_data = Bytes::copy_from_slice(&data[4..4 + ext_data_len]);
            data = &data[4 + ext_data_len..];

            Some(ExtensionHeader {
                profile,
                data: ext_data,
            })
        } else {
            None
        };

        let header = RtpHeader {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        };

        Ok((header, data))
    }

    /// Serialize RTP header to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());

        // First byte: V(2) P(1) X(1) CC(4)
        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        if self.extension.is_some() {
            first_byte |= 0x10;
        }
        first_byte |= (self.csrc.len() as u8) & 0x0F;
        buf.put_u8(first_byte);

        // Second byte: M(1) PT(7)
        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 0x80;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for &csrc_id in &self.csrc {
            buf.put_u32(csrc_id);
        }

        if let Some(ref ext) = self.extension {
            buf.put_u16(ext.profile);
            let length_words = (ext.data.len() + 3) / 4;
            buf.put_u16(length_words as u16);
            buf.put_slice(&ext.data);
            // Pad to a 32-bit boundary; parsed extensions are already aligned
            let pad = (4 - (ext.data.len() % 4)) % 4;
            for _ in 0..pad {
                buf.put_u8(0);
            }
        }

        buf
    }

    /// Header size in bytes
    pub fn size(&self) -> usize {
        let mut size = Self::MIN_SIZE + self.csrc.len() * 4;
        if let Some(ref ext) = self.extension {
            size += 4 + ext.data.len() + (4 - (ext.data.len() % 4)) % 4;
        }
        size
    }

    /// Read the ArcRTC quality/priority extension, if present
    pub fn arc_extension(&self) -> Option<ArcExtension> {
        self.extension
            .as_ref()
            .and_then(ArcExtension::from_extension)
    }

    /// Install or overwrite the ArcRTC quality/priority extension
    ///
    /// Foreign extensions are replaced; RTP allows only one extension
    /// header per packet.
    pub fn set_arc_extension(&mut self, arc: ArcExtension) {
        self.extension = Some(arc.to_extension());
    }
}

impl RtpPacket {
    /// Parse RTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (header, rest) = RtpHeader::parse(data)?;

        let (payload, padding) = if header.padding {
            if rest.is_empty() {
                return Err(ParseError::BadPadding(0));
            }
            let padding_len = rest[rest.len() - 1] as usize;
            if padding_len == 0 || padding_len > rest.len() {
                return Err(ParseError::BadPadding(padding_len));
            }
            let split = rest.len() - padding_len;
            (
                Bytes::copy_from_slice(&rest[..split]),
                Bytes::copy_from_slice(&rest[split..]),
            )
        } else {
            (Bytes::copy_from_slice(rest), Bytes::new())
        };

        Ok(RtpPacket {
            header,
            payload,
            padding,
        })
    }

    /// Serialize RTP packet to bytes
    ///
    /// Round-trip law: `serialize(parse(b)) == b` for every parsable `b`,
    /// and `parse(serialize(p)) == p` for every valid `p`.
    pub fn serialize(&self) -> Bytes {
        let mut buf = self.header.serialize();
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.freeze()
    }

    /// Total serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len() + self.padding.len()
    }
}
