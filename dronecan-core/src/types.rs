//! Shared scalar aliases and protocol constants.

/// 7-bit DroneCAN node identifier (0 is reserved for anonymous/broadcast).
pub type NodeId = u8;

/// 16-bit wire DSDL data type identifier.
pub type DataTypeId = u16;

/// 5-bit transfer ID, stored widened to a byte.
pub type TransferId = u8;

/// 64-bit DSDL signature used to seed the multi-frame CRC.
pub type DataTypeSignature = u64;

/// Node ID reserved to mean "broadcast, no destination".
pub const BROADCAST_NODE_ID: NodeId = 0;

/// Node ID an instance holds before `set_local_node_id` succeeds.
pub const ANONYMOUS_NODE_ID: NodeId = 0;

/// Width in bits of the wire transfer ID field.
pub const TRANSFER_ID_BIT_LEN: u32 = 5;

pub const TRANSFER_ID_MAX: TransferId = (1 << TRANSFER_ID_BIT_LEN) - 1;

/// Classification of a DroneCAN transfer, encoded in bits 19:20 (service frames)
/// or implied by the CAN ID layout (message frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Response = 0,
    Request = 1,
    Broadcast = 2,
}

/// Transfers are dropped from the RX state table after this many microseconds
/// without a new frame.
pub const TRANSFER_TIMEOUT_USEC: u64 = 2_000_000;

/// Minimum time since the last frame on the previous interface before a
/// redundant-bus switch is honoured.
pub const IFACE_SWITCH_DELAY_USEC: u64 = 1_000_000;

/// Maximum payload bytes a single classic CAN 2.0B frame can carry, tail byte included.
pub const MTU_CAN_CLASSIC: usize = 8;

/// Maximum payload bytes a CAN FD frame can carry, tail byte included.
pub const MTU_CAN_FD: usize = 64;

/// Largest payload that can ever arrive as the head/tail of a single frame,
/// used to size the owned buffers in [`crate::rx::CompletedTransfer`].
pub const MAX_FRAME_PAYLOAD: usize = MTU_CAN_FD - 1;
