//! Framed PDU packet codec
//!
//! # Wire Format Specification
//!
//! All stream and datagram comms frame PDU bodies with one of two layouts.
//! Every integer field is **little-endian**, including on the wire.
//!
//! ## V2 frame (current)
//!
//! ```text
//! ┌─────────────────────┬──────────────────────────────────────────┐
//! │ offset  size  field │                                          │
//! ├─────────────────────┼──────────────────────────────────────────┤
//! │ 0x000   128   robot_name   (NUL-padded ASCII)                  │
//! │ 0x080   4     magic        = 0x48414B4F ("HAKO")               │
//! │ 0x084   2     version      = 0x0002                            │
//! │ 0x086   2     reserved                                         │
//! │ 0x088   4     flags                                            │
//! │ 0x08C   4     request_type (PDU data = 0x42555043)             │
//! │ 0x090   4     total_len    = 172 + body_len                    │
//! │ 0x094   4     body_len                                         │
//! │ 0x098   8     hako_time_us  (i64)                              │
//! │ 0x0A0   8     asset_time_us (i64)                              │
//! │ 0x0A8   8     real_time_us  (i64)                              │
//! │ 0x0B0   4     channel_id                                       │
//! │ 0x0B4   124   padding                                          │
//! │ 0x130   n     body                                             │
//! └─────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! ## V1 frame (legacy compatibility)
//!
//! ```text
//! u32 header_len | u32 name_len | name | u32 channel_id | u32 request_type | body
//! ```
//!
//! `header_len` counts every byte after itself and is capped at 4 MiB by all
//! V1 readers. The codec is pure: no I/O, no allocation beyond the returned
//! vector.

use thiserror::Error;

/// "HAKO"
pub const PACKET_MAGIC: u32 = 0x4841_4B4F;
pub const PACKET_VERSION_V2: u16 = 0x0002;

/// Fixed size of the NUL-padded robot name field
pub const ROBOT_NAME_LEN: usize = 128;
/// Fixed size of the V2 meta section after the robot name
pub const META_FIXED_LEN: usize = 176;
/// Total V2 header size: 128 + 176
pub const HEADER_LEN_V2: usize = ROBOT_NAME_LEN + META_FIXED_LEN;
/// Interop hard cap on the V1 `header_len` field
pub const MAX_V1_HEADER_LEN: u32 = 4 * 1024 * 1024;

/// Request types carried in the packet header
pub mod request_type {
    /// "CPUB": a PDU data frame, the only type dispatched to subscribers
    pub const PDU_DATA: u32 = 0x4255_5043;
    pub const DECLARE_PDU_FOR_READ: u32 = 0x5245_5044;
    pub const DECLARE_PDU_FOR_WRITE: u32 = 0x5750_5044;
    pub const REQUEST_PDU_READ: u32 = 0x5750_5045;
    pub const REGISTER_RPC_CLIENT: u32 = 0x4350_5244;
    pub const PDU_DATA_RPC_REQUEST: u32 = 0x4350_5243;
    pub const PDU_DATA_RPC_REPLY: u32 = 0x4350_5253;
}

/// Which framing a comm speaks on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVersion {
    V1,
    V2,
}

impl PacketVersion {
    /// Parse the `comm_raw_version` config value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v1" => Some(PacketVersion::V1),
            "v2" => Some(PacketVersion::V2),
            _ => None,
        }
    }
}

/// Decoded header fields of a PDU frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketMeta {
    pub robot: String,
    pub channel_id: u32,
    pub flags: u32,
    pub request_type: u32,
    pub total_len: u32,
    pub body_len: u32,
    pub hako_time_us: i64,
    pub asset_time_us: i64,
    pub real_time_us: i64,
}

/// Reasons a frame fails to decode. The affected session is torn down;
/// decode failures never surface to API callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: {actual} bytes, {expected} required")]
    Truncated { expected: usize, actual: usize },
    #[error("bad magic: 0x{0:08X}")]
    BadMagic(u32),
    #[error("bad version: 0x{0:04X}")]
    BadVersion(u16),
    #[error("malformed header")]
    BadHeader,
}

/// One PDU frame: header fields plus the body bytes
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub meta: PacketMeta,
    pub body: Vec<u8>,
}

impl DataPacket {
    /// Build an outgoing PDU data frame
    pub fn new(robot: impl Into<String>, channel_id: u32, body: Vec<u8>) -> Self {
        Self {
            meta: PacketMeta {
                robot: robot.into(),
                channel_id,
                request_type: request_type::PDU_DATA,
                ..PacketMeta::default()
            },
            body,
        }
    }

    /// True when the frame carries PDU data (vs. a control request)
    pub fn is_pdu_data(&self) -> bool {
        self.meta.request_type == request_type::PDU_DATA
    }

    pub fn encode(&self, version: PacketVersion) -> Vec<u8> {
        match version {
            PacketVersion::V1 => self.encode_v1(),
            PacketVersion::V2 => self.encode_v2(),
        }
    }

    pub fn decode(data: &[u8], version: PacketVersion) -> Result<DataPacket, DecodeError> {
        match version {
            PacketVersion::V1 => Self::decode_v1(data),
            PacketVersion::V2 => Self::decode_v2(data),
        }
    }

    fn encode_v2(&self) -> Vec<u8> {
        let body_len = self.body.len() as u32;
        let total_len = (META_FIXED_LEN as u32 - 4) + body_len;

        let mut out = vec![0u8; HEADER_LEN_V2 + self.body.len()];
        let name = self.meta.robot.as_bytes();
        let name_len = name.len().min(ROBOT_NAME_LEN - 1);
        out[..name_len].copy_from_slice(&name[..name_len]);

        out[0x080..0x084].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        out[0x084..0x086].copy_from_slice(&PACKET_VERSION_V2.to_le_bytes());
        out[0x088..0x08C].copy_from_slice(&self.meta.flags.to_le_bytes());
        out[0x08C..0x090].copy_from_slice(&self.meta.request_type.to_le_bytes());
        out[0x090..0x094].copy_from_slice(&total_len.to_le_bytes());
        out[0x094..0x098].copy_from_slice(&body_len.to_le_bytes());
        out[0x098..0x0A0].copy_from_slice(&self.meta.hako_time_us.to_le_bytes());
        out[0x0A0..0x0A8].copy_from_slice(&self.meta.asset_time_us.to_le_bytes());
        out[0x0A8..0x0B0].copy_from_slice(&self.meta.real_time_us.to_le_bytes());
        out[0x0B0..0x0B4].copy_from_slice(&self.meta.channel_id.to_le_bytes());
        out[HEADER_LEN_V2..].copy_from_slice(&self.body);
        out
    }

    fn decode_v2(data: &[u8]) -> Result<DataPacket, DecodeError> {
        if data.len() < HEADER_LEN_V2 {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN_V2,
                actual: data.len(),
            });
        }

        let magic = read_u32_le(data, 0x080);
        if magic != PACKET_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([data[0x084], data[0x085]]);
        if version != PACKET_VERSION_V2 {
            return Err(DecodeError::BadVersion(version));
        }

        let body_len = read_u32_le(data, 0x094) as usize;
        if data.len() - HEADER_LEN_V2 < body_len {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN_V2 + body_len,
                actual: data.len(),
            });
        }

        let name_end = data[..ROBOT_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ROBOT_NAME_LEN);
        let meta = PacketMeta {
            robot: String::from_utf8_lossy(&data[..name_end]).into_owned(),
            flags: read_u32_le(data, 0x088),
            request_type: read_u32_le(data, 0x08C),
            total_len: read_u32_le(data, 0x090),
            body_len: body_len as u32,
            hako_time_us: read_i64_le(data, 0x098),
            asset_time_us: read_i64_le(data, 0x0A0),
            real_time_us: read_i64_le(data, 0x0A8),
            channel_id: read_u32_le(data, 0x0B0),
        };
        let body = data[HEADER_LEN_V2..HEADER_LEN_V2 + body_len].to_vec();
        Ok(DataPacket { meta, body })
    }

    fn encode_v1(&self) -> Vec<u8> {
        let name = self.meta.robot.as_bytes();
        let name_len = name.len() as u32;
        let body_len = self.body.len() as u32;
        // header_len counts everything after itself: name_len field, name,
        // channel_id, request_type, body
        let header_len = 4 + name_len + 4 + 4 + body_len;

        let mut out = Vec::with_capacity(4 + header_len as usize);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.meta.channel_id.to_le_bytes());
        out.extend_from_slice(&self.meta.request_type.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    fn decode_v1(data: &[u8]) -> Result<DataPacket, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated {
                expected: 4,
                actual: data.len(),
            });
        }
        let header_len = read_u32_le(data, 0);
        if header_len == 0 || header_len > MAX_V1_HEADER_LEN {
            return Err(DecodeError::BadHeader);
        }
        if data.len() < 4 + header_len as usize {
            return Err(DecodeError::Truncated {
                expected: 4 + header_len as usize,
                actual: data.len(),
            });
        }

        let name_len = read_u32_le(data, 4) as usize;
        if header_len < (4 + name_len as u32 + 4 + 4) {
            return Err(DecodeError::BadHeader);
        }
        let mut index = 8;
        if index + name_len + 8 > data.len() {
            return Err(DecodeError::BadHeader);
        }
        let robot = String::from_utf8_lossy(&data[index..index + name_len]).into_owned();
        index += name_len;
        let channel_id = read_u32_le(data, index);
        index += 4;
        let req = read_u32_le(data, index);
        index += 4;

        let body = data[index..].to_vec();
        let meta = PacketMeta {
            robot,
            channel_id,
            request_type: req,
            body_len: body.len() as u32,
            ..PacketMeta::default()
        };
        Ok(DataPacket { meta, body })
    }
}

/// Read the body length out of a complete V2 header slice
pub fn v2_body_len(header: &[u8]) -> u32 {
    read_u32_le(header, 0x094)
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_i64_le(data: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_roundtrip() {
        let packet = DataPacket::new("drone1", 42, vec![1, 2, 3, 4, 5]);
        let encoded = packet.encode(PacketVersion::V2);
        assert_eq!(encoded.len(), HEADER_LEN_V2 + 5);

        let decoded = DataPacket::decode(&encoded, PacketVersion::V2).unwrap();
        assert_eq!(decoded.meta.robot, "drone1");
        assert_eq!(decoded.meta.channel_id, 42);
        assert_eq!(decoded.body, vec![1, 2, 3, 4, 5]);
        assert!(decoded.is_pdu_data());
    }

    #[test]
    fn test_v2_total_len_field() {
        let packet = DataPacket::new("r", 0, vec![0u8; 10]);
        let encoded = packet.encode(PacketVersion::V2);
        let decoded = DataPacket::decode(&encoded, PacketVersion::V2).unwrap();
        assert_eq!(decoded.meta.total_len, 172 + 10);
        assert_eq!(decoded.meta.body_len, 10);
    }

    #[test]
    fn test_v2_empty_body() {
        let packet = DataPacket::new("r2", 7, Vec::new());
        let encoded = packet.encode(PacketVersion::V2);
        assert_eq!(encoded.len(), HEADER_LEN_V2);
        let decoded = DataPacket::decode(&encoded, PacketVersion::V2).unwrap();
        assert!(decoded.body.is_empty());
        assert_eq!(decoded.meta.channel_id, 7);
    }

    #[test]
    fn test_v2_long_name_truncated() {
        let long_name = "x".repeat(200);
        let packet = DataPacket::new(long_name, 1, vec![9]);
        let encoded = packet.encode(PacketVersion::V2);
        let decoded = DataPacket::decode(&encoded, PacketVersion::V2).unwrap();
        // 127 bytes of name plus the terminating NUL
        assert_eq!(decoded.meta.robot.len(), ROBOT_NAME_LEN - 1);
    }

    #[test]
    fn test_v2_rejects_bad_magic() {
        let packet = DataPacket::new("r", 1, vec![1]);
        let mut encoded = packet.encode(PacketVersion::V2);
        encoded[0x080] = 0xFF;
        assert!(matches!(
            DataPacket::decode(&encoded, PacketVersion::V2),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn test_v2_rejects_bad_version() {
        let packet = DataPacket::new("r", 1, vec![1]);
        let mut encoded = packet.encode(PacketVersion::V2);
        encoded[0x084] = 0x09;
        assert!(matches!(
            DataPacket::decode(&encoded, PacketVersion::V2),
            Err(DecodeError::BadVersion(_))
        ));
    }

    #[test]
    fn test_v2_rejects_short_body() {
        let packet = DataPacket::new("r", 1, vec![1, 2, 3]);
        let mut encoded = packet.encode(PacketVersion::V2);
        encoded.truncate(HEADER_LEN_V2 + 1);
        assert!(matches!(
            DataPacket::decode(&encoded, PacketVersion::V2),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_v2_rejects_truncated_header() {
        assert!(matches!(
            DataPacket::decode(&[0u8; 16], PacketVersion::V2),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_v1_roundtrip() {
        let packet = DataPacket::new("rover", 9, vec![0xDE, 0xAD]);
        let encoded = packet.encode(PacketVersion::V1);
        let decoded = DataPacket::decode(&encoded, PacketVersion::V1).unwrap();
        assert_eq!(decoded.meta.robot, "rover");
        assert_eq!(decoded.meta.channel_id, 9);
        assert_eq!(decoded.body, vec![0xDE, 0xAD]);
        assert!(decoded.is_pdu_data());
    }

    #[test]
    fn test_v1_header_len_counts_trailing_bytes() {
        let packet = DataPacket::new("ab", 1, vec![7, 7, 7]);
        let encoded = packet.encode(PacketVersion::V1);
        let header_len = read_u32_le(&encoded, 0);
        assert_eq!(encoded.len(), 4 + header_len as usize);
    }

    #[test]
    fn test_v1_rejects_oversized_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_V1_HEADER_LEN + 1).to_le_bytes());
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            DataPacket::decode(&data, PacketVersion::V1),
            Err(DecodeError::BadHeader)
        );
    }

    #[test]
    fn test_v1_rejects_inconsistent_name_len() {
        let packet = DataPacket::new("abc", 1, vec![]);
        let mut encoded = packet.encode(PacketVersion::V1);
        // claim a name longer than the header allows
        encoded[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert!(DataPacket::decode(&encoded, PacketVersion::V1).is_err());
    }

    #[test]
    fn test_v2_body_len_helper() {
        let packet = DataPacket::new("r", 1, vec![0u8; 77]);
        let encoded = packet.encode(PacketVersion::V2);
        assert_eq!(v2_body_len(&encoded[..HEADER_LEN_V2]), 77);
    }
}
