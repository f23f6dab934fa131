//! CAN frame representation, 29-bit identifier field layouts, the tail
//! byte, and arbitration ordering.

use bitfield::bitfield;
use embedded_can::{ExtendedId, Id};

use crate::types::{DataTypeId, NodeId, TransferType};

/// Marks an identifier as 29-bit extended (as opposed to 11-bit standard).
pub const CAN_FRAME_EFF: u32 = 1 << 31;
/// Remote transmission request flag.
pub const CAN_FRAME_RTR: u32 = 1 << 30;
/// Error frame flag.
pub const CAN_FRAME_ERR: u32 = 1 << 29;
/// Mask isolating the 29 identifier bits from the flag bits above.
pub const CAN_EXT_ID_MASK: u32 = 0x1FFF_FFFF;

const ANON_MSG_DATA_TYPE_ID_BIT_LEN: u32 = 2;

bitfield! {
    /// The last byte of every frame: `SOT:1 | EOT:1 | TOG:1 | TID:5`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TailByte(u8);
    impl Debug;
    pub start_of_transfer, set_start_of_transfer: 7;
    pub end_of_transfer, set_end_of_transfer: 6;
    pub toggle, set_toggle: 5;
    pub transfer_id, set_transfer_id: 4, 0;
}

impl TailByte {
    pub fn new(sot: bool, eot: bool, toggle: bool, transfer_id: u8) -> Self {
        let mut tb = TailByte(0);
        tb.set_start_of_transfer(sot);
        tb.set_end_of_transfer(eot);
        tb.set_toggle(toggle);
        tb.set_transfer_id(transfer_id);
        tb
    }
}

pub(crate) fn priority(id: u32) -> u8 {
    ((id >> 24) & 0x1F) as u8
}

pub(crate) fn source_node_id(id: u32) -> NodeId {
    ((id >> 0) & 0x7F) as NodeId
}

pub(crate) fn dest_node_id(id: u32) -> NodeId {
    ((id >> 8) & 0x7F) as NodeId
}

fn is_service_frame(id: u32) -> bool {
    ((id >> 7) & 0x1) != 0
}

pub(crate) fn extract_transfer_type(id: u32) -> TransferType {
    if !is_service_frame(id) {
        TransferType::Broadcast
    } else if ((id >> 15) & 0x1) != 0 {
        TransferType::Request
    } else {
        TransferType::Response
    }
}

pub(crate) fn extract_data_type(id: u32) -> DataTypeId {
    if extract_transfer_type(id) == TransferType::Broadcast {
        let dtid = ((id >> 8) & 0xFFFF) as DataTypeId;
        if source_node_id(id) == crate::types::BROADCAST_NODE_ID {
            dtid & ((1 << ANON_MSG_DATA_TYPE_ID_BIT_LEN) - 1)
        } else {
            dtid
        }
    } else {
        ((id >> 16) & 0xFF) as DataTypeId
    }
}

/// 32-bit key identifying an RX reassembly slot:
/// `data_type_id | (transfer_type << 16) | (src_node_id << 18) | (dst_node_id << 25)`.
pub(crate) fn make_transfer_descriptor(
    data_type_id: DataTypeId,
    transfer_type: TransferType,
    source_node_id: NodeId,
    destination_node_id: NodeId,
) -> u32 {
    (data_type_id as u32)
        | ((transfer_type as u32) << 16)
        | ((source_node_id as u32) << 18)
        | ((destination_node_id as u32) << 25)
}

/// Builds the 29-bit ID (flags not yet set) for a named-node broadcast.
pub(crate) fn message_id(priority: u8, data_type_id: DataTypeId, source_node_id: NodeId) -> u32 {
    ((priority as u32) << 24) | ((data_type_id as u32) << 8) | (source_node_id as u32)
}

/// Builds the 29-bit ID for an anonymous broadcast, given the discriminator
/// already folded from the payload CRC.
pub(crate) fn anonymous_message_id(priority: u8, discriminator: u16, data_type_id: DataTypeId) -> u32 {
    let dtid_mask = (1u16 << ANON_MSG_DATA_TYPE_ID_BIT_LEN) - 1;
    ((priority as u32) << 24)
        | ((discriminator as u32) << 9)
        | (((data_type_id & dtid_mask) as u32) << 8)
}

/// Builds the 29-bit ID for a service (request or response) frame.
pub(crate) fn service_id(
    priority: u8,
    data_type_id: DataTypeId,
    request: bool,
    destination_node_id: NodeId,
    source_node_id: NodeId,
) -> u32 {
    ((priority as u32) << 24)
        | ((data_type_id as u32) << 16)
        | ((request as u32) << 15)
        | ((destination_node_id as u32) << 8)
        | (1 << 7)
        | (source_node_id as u32)
}

/// True if `rhs` would win CAN arbitration against `id` (lower value wins;
/// EXT loses STD on a shared 11-bit prefix; RTR loses to data with the
/// same identifier).
pub(crate) fn is_priority_higher(rhs: u32, id: u32) -> bool {
    let clean_id = id & CAN_EXT_ID_MASK;
    let rhs_clean_id = rhs & CAN_EXT_ID_MASK;

    let ext = (id & CAN_FRAME_EFF) != 0;
    let rhs_ext = (rhs & CAN_FRAME_EFF) != 0;
    if ext != rhs_ext {
        let arb11 = if ext { clean_id >> 18 } else { clean_id };
        let rhs_arb11 = if rhs_ext { rhs_clean_id >> 18 } else { rhs_clean_id };
        if arb11 != rhs_arb11 {
            return arb11 < rhs_arb11;
        }
        return rhs_ext;
    }

    let rtr = (id & CAN_FRAME_RTR) != 0;
    let rhs_rtr = (rhs & CAN_FRAME_RTR) != 0;
    if clean_id == rhs_clean_id && rtr != rhs_rtr {
        return rhs_rtr;
    }

    clean_id < rhs_clean_id
}

/// DLC (Data Length Code) table for CAN FD: DLC 9..15 encode lengths
/// {12, 16, 20, 24, 32, 48, 64}; DLC <= 8 is the identity mapping shared
/// with classic CAN.
pub(crate) fn dlc_to_data_length(dlc: u8) -> u8 {
    match dlc {
        0..=8 => dlc,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

pub(crate) fn data_length_to_dlc(data_length: u8) -> u8 {
    match data_length {
        0..=8 => data_length,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// Maximum payload bytes (tail byte included) a frame of this configuration can carry.
pub(crate) fn max_frame_data_len(canfd: bool) -> usize {
    if canfd {
        crate::types::MTU_CAN_FD
    } else {
        crate::types::MTU_CAN_CLASSIC
    }
}

/// One outbound or inbound CAN 2.0B/FD frame: a 29-bit extended identifier
/// plus up to 64 payload bytes (last one the tail byte on the wire).
#[derive(Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    pub id: ExtendedId,
    pub data: arrayvec::ArrayVec<[u8; crate::types::MTU_CAN_FD]>,
    #[cfg(feature = "multi-iface")]
    pub iface_mask: u8,
    pub iface_id: u8,
    #[cfg(feature = "canfd")]
    pub canfd: bool,
}

impl CanFrame {
    /// The 29-bit identifier widened back to the flagged representation the
    /// segmenter and arbitration comparison operate on. `CanFrame` is always
    /// extended, never RTR/error, so the high flag bits collapse to a
    /// constant `CAN_FRAME_EFF` rather than living in the struct.
    pub(crate) fn raw_id(&self) -> u32 {
        self.id.as_raw() | CAN_FRAME_EFF
    }
}
