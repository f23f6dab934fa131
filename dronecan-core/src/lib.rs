//! # DroneCAN (UAVCAN v0) transfer engine
//!
//! This crate covers the core of the protocol and nothing above it: transfer
//! segmentation and reassembly, the priority-ordered TX queue, the fixed-size
//! pool allocator that backs both, and the bit-level scatter/gather codec DSDL
//! field access needs. It does not drive a physical bus, generate DSDL types,
//! or implement node services like GetNodeInfo or dynamic node ID allocation —
//! those are built on top, by a transport adapter and an application layer
//! that own the `Instance`.
//!
//! The host supplies CAN frames in and drains the TX queue out; everything in
//! between runs without a heap, without threads, and without blocking.
#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(test)]
extern crate alloc;

pub mod bits;
pub mod crc;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pool;
pub mod rx;
pub mod tx;
pub mod types;

pub use bits::{encode_scalar, f16_to_f32, f32_to_f16};
pub use error::Error;
pub use frame::CanFrame;
pub use instance::{AcceptanceFilter, Instance, RxOutcome, ServiceKind, MAX_NODE_ID, MIN_NODE_ID};
pub use pool::{Pool, PoolStatistics, Slot};
pub use rx::CompletedTransfer;
pub use types::{DataTypeId, DataTypeSignature, NodeId, TransferId, TransferType};
