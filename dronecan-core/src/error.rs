//! Error type shared by every fallible entry point.
//!
//! The C implementation this engine is descended from returns negated
//! `int16_t` status codes; here each failure mode gets its own variant and
//! propagates with `?` instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A caller-supplied argument is out of range (payload too long, bad node ID, ...).
    InvalidArgument,
    /// The pool allocator has no free blocks left.
    OutOfMemory,
    /// `broadcast`/`request_or_respond` needs a local node ID that hasn't been set yet.
    NodeIdNotSet,
    /// The frame's CAN ID does not belong to this protocol (wrong EFF/RTR/ERR bits, or empty payload).
    RxIncompatiblePacket,
    /// The frame is a service frame addressed to a different node.
    RxWrongAddress,
    /// The acceptance filter declined this transfer.
    RxNotWanted,
    /// A non-start frame arrived with no matching in-progress transfer.
    RxMissedStart,
    /// The frame's toggle bit does not match the expected value.
    RxWrongToggle,
    /// The frame's transfer ID does not match the transfer currently being reassembled.
    RxUnexpectedTid,
    /// A multi-frame start or middle frame was shorter than a tail byte plus useful payload.
    RxShortFrame,
    /// The reassembled payload failed the CRC-16/CCITT-FALSE check.
    RxBadCrc,
}
