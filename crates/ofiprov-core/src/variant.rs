//! Transport variants.
//!
//! Three provider flavours share the completion and registration core and
//! differ only in how a raw completion encodes length, tag and remote data,
//! and in their registration policy:
//!
//! * [`StreamVariant`]: byte-stream transport with an explicit message
//!   header carrying op, flags, total size and header size.
//! * [`TagMatchVariant`]: tag-matching fabric where a 96-bit tag carries
//!   the application tag (or remote data) plus protocol bits.
//! * [`DatagramVariant`]: reliable-datagram layer over a lower provider
//!   whose CQ entry is passed through; registration is delegated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::flags::OpFlags;
use crate::lower::{DatagramEntry, StreamHeader, TagStatus, WireInfo};
use crate::xfer::{WireOp, XferHeader};

/// Selects a transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    /// Byte-stream transport with a message header.
    #[default]
    Stream,
    /// Tag-matching transport with 96-bit tags.
    TagMatch,
    /// Datagram transport passing completion entries through.
    Datagram,
}

/// Where registration keys come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Monotonic provider counter.
    Provider,
    /// Caller-requested keys; duplicates are rejected.
    Application,
    /// Key of the lower registration.
    Lower,
}

/// Summary of a delivered message, as a transport would put it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireSummary {
    /// Payload bytes.
    pub len: usize,
    /// Tag of a tagged send.
    pub tag: Option<u64>,
    /// Remote CQ data.
    pub data: Option<u64>,
    /// Sending lane.
    pub src_lane: u8,
    /// Receiving lane.
    pub dst_lane: u8,
}

/// Per-variant wire decoding and registration policy.
pub trait TransportVariant: Send + Sync + fmt::Debug {
    /// Which variant this is.
    fn kind(&self) -> VariantKind;

    /// Fills the transport-neutral header from raw completion material.
    /// Material of another variant leaves the header untouched.
    fn decode(&self, wire: &WireInfo, hdr: &mut XferHeader);

    /// Encodes a received message the way this transport reports it.
    fn encode(&self, msg: &WireSummary) -> WireInfo;

    /// Access mask passed to the lower registration.
    fn lower_access(&self, requested: OpFlags) -> OpFlags {
        requested & OpFlags::ACCESS_MASK
    }

    /// Where registration keys come from.
    fn key_mode(&self) -> KeyMode;
}

/// Returns the variant implementation for `kind`.
pub fn variant_for(kind: VariantKind) -> Arc<dyn TransportVariant> {
    match kind {
        VariantKind::Stream => Arc::new(StreamVariant),
        VariantKind::TagMatch => Arc::new(TagMatchVariant),
        VariantKind::Datagram => Arc::new(DatagramVariant),
    }
}

/// Byte-stream conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamVariant;

impl TransportVariant for StreamVariant {
    fn kind(&self) -> VariantKind {
        VariantKind::Stream
    }

    fn decode(&self, wire: &WireInfo, hdr: &mut XferHeader) {
        let WireInfo::Stream(raw) = wire else {
            return;
        };
        hdr.op = match raw.op {
            StreamHeader::OP_TAGGED => WireOp::Tagged,
            StreamHeader::OP_WRITE => WireOp::Write,
            StreamHeader::OP_READ_REQ | StreamHeader::OP_READ_RSP => WireOp::Read,
            _ => WireOp::Msg,
        };
        hdr.flags = 0;
        if raw.flags & StreamHeader::REMOTE_CQ_DATA != 0 {
            hdr.flags |= XferHeader::REMOTE_CQ_DATA;
        }
        if raw.flags & StreamHeader::TAGGED != 0 {
            hdr.flags |= XferHeader::TAGGED;
        }
        hdr.size = raw.size;
        hdr.hdr_size = raw.hdr_size;
        hdr.cq_data = raw.cq_data;
        hdr.tag = raw.tag;
    }

    fn encode(&self, msg: &WireSummary) -> WireInfo {
        let mut raw = StreamHeader {
            op: if msg.tag.is_some() {
                StreamHeader::OP_TAGGED
            } else {
                StreamHeader::OP_MSG
            },
            hdr_size: StreamHeader::BASE_SIZE,
            ..Default::default()
        };
        if let Some(data) = msg.data {
            raw.flags |= StreamHeader::REMOTE_CQ_DATA;
            raw.cq_data = data;
            raw.hdr_size += 8;
        }
        if let Some(tag) = msg.tag {
            raw.flags |= StreamHeader::TAGGED;
            raw.tag = tag;
            raw.hdr_size += 8;
        }
        raw.size = raw.hdr_size + msg.len as u64;
        WireInfo::Stream(raw)
    }

    fn key_mode(&self) -> KeyMode {
        KeyMode::Provider
    }
}

/// Protocol bits in the upper word of a 96-bit tag.
pub mod tag_bits {
    /// Untagged message.
    pub const MSG_BIT: u32 = 0x8000_0000;
    /// RMA traffic.
    pub const RMA_BIT: u32 = 0x4000_0000;
    /// Multi-segment payload.
    pub const IOV_BIT: u32 = 0x2000_0000;
    /// Carries immediate data in the tag.
    pub const IMM_BIT: u32 = 0x1000_0000;
    /// Sequence number.
    pub const SEQ_BITS: u32 = 0x0FFF_0000;
    /// Source lane.
    pub const SRC_BITS: u32 = 0x0000_FF00;
    /// Destination lane.
    pub const DST_BITS: u32 = 0x0000_00FF;

    /// Application tag from words 0 and 1.
    pub fn tag64(tag: &[u32; 3]) -> u64 {
        tag[0] as u64 | ((tag[1] as u64) << 32)
    }

    /// Protocol word.
    pub fn tag32(tag: &[u32; 3]) -> u32 {
        tag[2]
    }

    /// Source lane from the protocol word.
    pub fn src_lane(tag32: u32) -> u8 {
        ((tag32 & SRC_BITS) >> 8) as u8
    }

    /// Destination lane from the protocol word.
    pub fn dst_lane(tag32: u32) -> u8 {
        (tag32 & DST_BITS) as u8
    }

    /// Builds a 96-bit tag.
    pub fn pack(tag64: u64, tag32: u32) -> [u32; 3] {
        [tag64 as u32, (tag64 >> 32) as u32, tag32]
    }
}

/// Tag-matching conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagMatchVariant;

impl TransportVariant for TagMatchVariant {
    fn kind(&self) -> VariantKind {
        VariantKind::TagMatch
    }

    fn decode(&self, wire: &WireInfo, hdr: &mut XferHeader) {
        let WireInfo::Tagged(status) = wire else {
            return;
        };
        let tag32 = tag_bits::tag32(&status.tag);
        let tag64 = tag_bits::tag64(&status.tag);
        hdr.flags = 0;
        hdr.cq_data = 0;
        hdr.tag = 0;
        if tag32 & tag_bits::MSG_BIT != 0 {
            hdr.op = WireOp::Msg;
            if tag32 & tag_bits::IMM_BIT != 0 {
                hdr.flags |= XferHeader::REMOTE_CQ_DATA;
                hdr.cq_data = tag64;
            }
        } else {
            hdr.op = WireOp::Tagged;
            hdr.flags |= XferHeader::TAGGED;
            hdr.tag = tag64;
        }
        hdr.size = status.nbytes;
        hdr.hdr_size = 0;
    }

    fn encode(&self, msg: &WireSummary) -> WireInfo {
        let lanes = ((msg.src_lane as u32) << 8) | msg.dst_lane as u32;
        let (tag64, tag32) = match (msg.tag, msg.data) {
            (Some(tag), _) => (tag, lanes),
            (None, Some(data)) => (data, tag_bits::MSG_BIT | tag_bits::IMM_BIT | lanes),
            (None, None) => (0, tag_bits::MSG_BIT | lanes),
        };
        WireInfo::Tagged(TagStatus {
            tag: tag_bits::pack(tag64, tag32),
            msg_length: msg.len as u64,
            nbytes: msg.len as u64,
        })
    }

    fn key_mode(&self) -> KeyMode {
        KeyMode::Application
    }
}

/// Datagram conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramVariant;

impl TransportVariant for DatagramVariant {
    fn kind(&self) -> VariantKind {
        VariantKind::Datagram
    }

    fn decode(&self, wire: &WireInfo, hdr: &mut XferHeader) {
        let WireInfo::Datagram(entry) = wire else {
            return;
        };
        hdr.flags = 0;
        hdr.op = if entry.flags.contains(OpFlags::TAGGED) {
            hdr.flags |= XferHeader::TAGGED;
            WireOp::Tagged
        } else {
            WireOp::Msg
        };
        if entry.flags.contains(OpFlags::REMOTE_CQ_DATA) {
            hdr.flags |= XferHeader::REMOTE_CQ_DATA;
        }
        hdr.size = entry.len as u64;
        hdr.hdr_size = 0;
        hdr.cq_data = entry.data;
        hdr.tag = entry.tag;
    }

    fn encode(&self, msg: &WireSummary) -> WireInfo {
        let mut flags = OpFlags::RECV | OpFlags::MSG;
        if msg.tag.is_some() {
            flags |= OpFlags::TAGGED;
        }
        if msg.data.is_some() {
            flags |= OpFlags::REMOTE_CQ_DATA;
        }
        WireInfo::Datagram(DatagramEntry {
            flags,
            len: msg.len,
            data: msg.data.unwrap_or(0),
            tag: msg.tag.unwrap_or(0),
        })
    }

    /// The lower provider only understands local send/recv registrations;
    /// remote access is enforced in the registry instead.
    fn lower_access(&self, _requested: OpFlags) -> OpFlags {
        OpFlags::SEND | OpFlags::RECV
    }

    fn key_mode(&self) -> KeyMode {
        KeyMode::Lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(variant: &dyn TransportVariant, msg: WireSummary) -> XferHeader {
        let mut hdr = XferHeader::default();
        variant.decode(&variant.encode(&msg), &mut hdr);
        hdr
    }

    #[test]
    fn test_stream_header_sizes() {
        let hdr = decoded(
            &StreamVariant,
            WireSummary {
                len: 100,
                tag: Some(7),
                data: Some(9),
                ..Default::default()
            },
        );
        assert_eq!(hdr.hdr_size, 32);
        assert_eq!(hdr.size, 132);
        assert_eq!(hdr.payload_len(), 100);
        assert_eq!(hdr.op, WireOp::Tagged);
        assert!(hdr.has(XferHeader::TAGGED));
        assert!(hdr.has(XferHeader::REMOTE_CQ_DATA));
    }

    #[test]
    fn test_tag_match_untagged_with_data() {
        let hdr = decoded(
            &TagMatchVariant,
            WireSummary {
                len: 8,
                data: Some(0xDEAD_BEEF_0000_0001),
                ..Default::default()
            },
        );
        assert_eq!(hdr.op, WireOp::Msg);
        assert_eq!(hdr.cq_data, 0xDEAD_BEEF_0000_0001);
        assert!(!hdr.has(XferHeader::TAGGED));
        assert_eq!(hdr.payload_len(), 8);
    }

    #[test]
    fn test_tag_match_tagged() {
        let hdr = decoded(
            &TagMatchVariant,
            WireSummary {
                len: 4,
                tag: Some(0x1_0000_0002),
                src_lane: 3,
                dst_lane: 5,
                ..Default::default()
            },
        );
        assert_eq!(hdr.op, WireOp::Tagged);
        assert_eq!(hdr.tag, 0x1_0000_0002);
        assert_eq!(hdr.cq_data, 0);
    }

    #[test]
    fn test_tag_bits_lanes() {
        let tag32 = tag_bits::MSG_BIT | (3 << 8) | 5;
        assert_eq!(tag_bits::src_lane(tag32), 3);
        assert_eq!(tag_bits::dst_lane(tag32), 5);
        let packed = tag_bits::pack(0xAABB_CCDD_1122_3344, tag32);
        assert_eq!(tag_bits::tag64(&packed), 0xAABB_CCDD_1122_3344);
    }

    #[test]
    fn test_datagram_pass_through() {
        let hdr = decoded(
            &DatagramVariant,
            WireSummary {
                len: 64,
                tag: Some(11),
                ..Default::default()
            },
        );
        assert_eq!(hdr.tag, 11);
        assert_eq!(hdr.size, 64);
        assert_eq!(hdr.hdr_size, 0);
    }

    #[test]
    fn test_foreign_wire_info_ignored() {
        let mut hdr = XferHeader {
            size: 5,
            ..Default::default()
        };
        StreamVariant.decode(&WireInfo::None, &mut hdr);
        TagMatchVariant.decode(&WireInfo::Datagram(DatagramEntry::default()), &mut hdr);
        assert_eq!(hdr.size, 5);
    }

    #[test]
    fn test_registration_policy() {
        let requested = OpFlags::REMOTE_WRITE | OpFlags::REMOTE_READ;
        assert_eq!(StreamVariant.lower_access(requested), requested);
        assert_eq!(
            DatagramVariant.lower_access(requested),
            OpFlags::SEND | OpFlags::RECV
        );
        assert_eq!(variant_for(VariantKind::TagMatch).key_mode(), KeyMode::Application);
        assert_eq!(variant_for(VariantKind::Datagram).key_mode(), KeyMode::Lower);
    }
}
