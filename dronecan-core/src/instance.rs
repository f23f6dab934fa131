//! The root object: node-ID lifecycle, the broadcast/request entry points,
//! the RX reassembly entry point, and stale-transfer sweeping.

use arrayvec::ArrayVec;

use crate::bits::copy_bit_array;
use crate::crc;
use crate::error::Error;
use crate::frame::{
    self, anonymous_message_id, extract_data_type, extract_transfer_type, make_transfer_descriptor,
    message_id, service_id, CanFrame, TailByte, CAN_FRAME_EFF, CAN_FRAME_ERR, CAN_FRAME_RTR,
};
use crate::pool::{Pool, PoolStatistics};
use crate::rx::{
    buffer_block_push_bytes, find_rx_state, forward_distance, prepare_for_next_transfer,
    prepend_rx_state, release_state_payload, spill_final_frame, CompletedTransfer,
};
use crate::tx::enqueue_tx_frames;
use crate::types::{
    DataTypeId, DataTypeSignature, NodeId, TransferId, TransferType, ANONYMOUS_NODE_ID,
    BROADCAST_NODE_ID, IFACE_SWITCH_DELAY_USEC, TRANSFER_ID_BIT_LEN, TRANSFER_TIMEOUT_USEC,
};

pub const MIN_NODE_ID: NodeId = 1;
pub const MAX_NODE_ID: NodeId = 127;

/// Whether an accepted transfer, and the signature to validate its CRC with.
///
/// Implemented for any `FnMut(DataTypeId, TransferType, NodeId) -> Option<DataTypeSignature>`
/// closure so simple cases don't need a named type.
pub trait AcceptanceFilter {
    fn should_accept(
        &mut self,
        data_type_id: DataTypeId,
        transfer_type: TransferType,
        source_node_id: NodeId,
    ) -> Option<DataTypeSignature>;
}

impl<F> AcceptanceFilter for F
where
    F: FnMut(DataTypeId, TransferType, NodeId) -> Option<DataTypeSignature>,
{
    fn should_accept(
        &mut self,
        data_type_id: DataTypeId,
        transfer_type: TransferType,
        source_node_id: NodeId,
    ) -> Option<DataTypeSignature> {
        self(data_type_id, transfer_type, source_node_id)
    }
}

/// Which side of a service exchange a transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Request,
    Response,
}

/// What came back from `handle_rx`.
#[derive(Debug)]
pub enum RxOutcome<const H: usize> {
    /// Frame consumed, no transfer finished (mid-transfer, or silently dropped).
    Ok,
    /// A transfer just finished reassembling; ready for the application.
    Complete(CompletedTransfer<H>),
}

/// The root object. `H` sizes each RX state's inline head buffer (at least
/// 6 per the wire format's `MULTIFRAME_HEAD_SIZE`); `B` sizes each buffer
/// block. Both default to the values the original reference firmware used.
pub struct Instance<'a, A: AcceptanceFilter, const H: usize = 6, const B: usize = 32> {
    pool: Pool<'a, H, B>,
    node_id: NodeId,
    acceptance: A,
    rx_states: Option<u16>,
    tx_queue: Option<u16>,
    #[cfg(feature = "tao")]
    tao_disabled: bool,
}

impl<'a, A: AcceptanceFilter, const H: usize, const B: usize> Instance<'a, A, H, B> {
    pub fn new(slots: &'a mut [crate::pool::Slot<H, B>], acceptance: A) -> Self {
        debug_assert!(H >= 6, "multiframe head buffer must hold at least 6 bytes");
        Self {
            pool: Pool::new(slots),
            node_id: ANONYMOUS_NODE_ID,
            acceptance,
            rx_states: None,
            tx_queue: None,
            #[cfg(feature = "tao")]
            tao_disabled: false,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    /// One-way latch: the local node ID may only be set once a process's
    /// lifetime. Panics if called a second time, mirroring the assertion
    /// the reference firmware used to guard against accidental reconfiguration.
    pub fn set_local_node_id(&mut self, node_id: NodeId) -> Result<(), Error> {
        if self.node_id != ANONYMOUS_NODE_ID {
            panic!("local node ID already set");
        }
        if node_id < MIN_NODE_ID || node_id > MAX_NODE_ID {
            return Err(Error::InvalidArgument);
        }
        self.node_id = node_id;
        Ok(())
    }

    #[cfg(feature = "tao")]
    pub fn set_tao_disabled(&mut self, disabled: bool) {
        self.tao_disabled = disabled;
    }

    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    /// Reads a scalar field out of a transfer this instance completed.
    /// Returns the number of bits actually produced, which is less than
    /// `bit_length` only when the request runs past the end of the transfer.
    pub fn decode_scalar(
        &self,
        transfer: &CompletedTransfer<H>,
        bit_offset: u32,
        bit_length: u8,
        signed: bool,
    ) -> Result<(u64, u8), Error> {
        transfer.decode_scalar(&self.pool, bit_offset, bit_length, signed)
    }

    /// Builds and enqueues the frame sequence for a broadcast, advancing
    /// `*transfer_id` on success only. When no node ID has been set yet,
    /// the transfer goes out anonymous: payload must fit in 7 bytes and
    /// `data_type_id` in 2 bits.
    pub fn broadcast(
        &mut self,
        data_type_id: DataTypeId,
        transfer_id: &mut TransferId,
        priority: u8,
        payload: &[u8],
        iface_mask: u8,
        canfd: bool,
    ) -> Result<u16, Error> {
        if priority > 31 {
            return Err(Error::InvalidArgument);
        }

        let can_id = if self.node_id == BROADCAST_NODE_ID {
            if payload.len() > 7 {
                return Err(Error::NodeIdNotSet);
            }
            let dtid_mask = (1u16 << 2) - 1;
            if (data_type_id & dtid_mask) != data_type_id {
                return Err(Error::InvalidArgument);
            }
            let discriminator = (crc::add(crc::CRC_INITIAL, payload) & 0x7FFE) as u16;
            anonymous_message_id(priority, discriminator, data_type_id)
        } else {
            message_id(priority, data_type_id, self.node_id)
        };

        let result = enqueue_tx_frames(
            &mut self.pool,
            &mut self.tx_queue,
            can_id,
            *transfer_id,
            payload,
            iface_mask,
            canfd,
        )?;

        *transfer_id = (*transfer_id + 1) & ((1 << TRANSFER_ID_BIT_LEN) - 1);
        Ok(result)
    }

    /// Builds and enqueues a service request or response. `transfer_id` only
    /// advances for requests; responses must reuse the request's ID.
    pub fn request_or_respond(
        &mut self,
        destination_node_id: NodeId,
        data_type_id: DataTypeId,
        transfer_id: &mut TransferId,
        priority: u8,
        kind: ServiceKind,
        payload: &[u8],
        iface_mask: u8,
        canfd: bool,
    ) -> Result<u16, Error> {
        if priority > 31 {
            return Err(Error::InvalidArgument);
        }
        if self.node_id == BROADCAST_NODE_ID {
            return Err(Error::NodeIdNotSet);
        }

        let can_id = service_id(
            priority,
            data_type_id,
            kind == ServiceKind::Request,
            destination_node_id,
            self.node_id,
        );

        let result = enqueue_tx_frames(
            &mut self.pool,
            &mut self.tx_queue,
            can_id,
            *transfer_id,
            payload,
            iface_mask,
            canfd,
        )?;

        if kind == ServiceKind::Request {
            *transfer_id = (*transfer_id + 1) & ((1 << TRANSFER_ID_BIT_LEN) - 1);
        }
        Ok(result)
    }

    pub fn peek_tx(&self) -> Option<&CanFrame> {
        self.tx_queue.map(|idx| &self.pool.tx(idx).frame)
    }

    pub fn pop_tx(&mut self) {
        if let Some(idx) = self.tx_queue {
            self.tx_queue = self.pool.tx(idx).next;
            self.pool.free_tx(idx);
        }
    }

    /// Releases a completed transfer's block list back to the pool. Callers
    /// that never read the payload must still call this, or its blocks stay
    /// allocated forever.
    pub fn release_rx_transfer_payload(&mut self, transfer: &mut CompletedTransfer<H>) {
        let mut cur = transfer.middle.take();
        while let Some(idx) = cur {
            let next = self.pool.buf(idx).next;
            self.pool.free_buf(idx);
            cur = next;
        }
    }

    /// Frees any RX state untouched for more than the transfer timeout.
    pub fn cleanup_stale_transfers(&mut self, now_usec: u64) {
        let mut prev: Option<u16> = None;
        let mut cur = self.rx_states;

        while let Some(idx) = cur {
            let next = self.pool.rx(idx).next;
            if now_usec.wrapping_sub(self.pool.rx(idx).timestamp_usec) > TRANSFER_TIMEOUT_USEC {
                release_state_payload(&mut self.pool, idx);
                match prev {
                    Some(p) => self.pool.rx_mut(p).next = next,
                    None => self.rx_states = next,
                }
                self.pool.free_rx(idx);
            } else {
                prev = Some(idx);
            }
            cur = next;
        }
    }

    /// Feeds one inbound frame through the reassembler. Returns
    /// [`RxOutcome::Complete`] exactly when a transfer just finished.
    pub fn handle_rx(&mut self, frame: &CanFrame, timestamp_usec: u64) -> Result<RxOutcome<H>, Error> {
        let raw_id = frame.raw_id();

        if (raw_id & CAN_FRAME_EFF) == 0
            || (raw_id & CAN_FRAME_RTR) != 0
            || (raw_id & CAN_FRAME_ERR) != 0
            || frame.data.is_empty()
        {
            return Err(Error::RxIncompatiblePacket);
        }

        let transfer_type = extract_transfer_type(raw_id);
        let destination_node_id = if transfer_type == TransferType::Broadcast {
            BROADCAST_NODE_ID
        } else {
            frame::dest_node_id(raw_id)
        };

        if transfer_type != TransferType::Broadcast && destination_node_id != self.node_id {
            return Err(Error::RxWrongAddress);
        }

        let priority = frame::priority(raw_id);
        let source_node_id = frame::source_node_id(raw_id);
        let data_type_id = extract_data_type(raw_id);
        let descriptor = make_transfer_descriptor(data_type_id, transfer_type, source_node_id, destination_node_id);

        let tail = TailByte(*frame.data.last().expect("checked non-empty above"));

        let state_idx = if tail.start_of_transfer() {
            let signature = self
                .acceptance
                .should_accept(data_type_id, transfer_type, source_node_id);
            match signature {
                None => return Err(Error::RxNotWanted),
                Some(sig) => {
                    let idx = match find_rx_state(&self.pool, self.rx_states, descriptor) {
                        Some(idx) => idx,
                        None => prepend_rx_state(&mut self.pool, &mut self.rx_states, descriptor)?,
                    };
                    self.pool.rx_mut(idx).payload_crc_signature = sig;
                    idx
                }
            }
        } else {
            find_rx_state(&self.pool, self.rx_states, descriptor).ok_or(Error::RxMissedStart)?
        };

        let frame_tid = tail.transfer_id() as u8;
        let state = self.pool.rx(state_idx);
        let not_initialized = state.timestamp_usec == 0;
        let tid_timed_out = timestamp_usec.wrapping_sub(state.timestamp_usec) > TRANSFER_TIMEOUT_USEC;
        let same_iface = frame.iface_id == state.iface_id;
        let first_frame = tail.start_of_transfer();
        let not_previous_tid = forward_distance(state.transfer_id, frame_tid) > 1;
        let iface_switch_allowed = timestamp_usec.wrapping_sub(state.timestamp_usec) > IFACE_SWITCH_DELAY_USEC;
        let non_wrapped_tid = forward_distance(frame_tid, state.transfer_id) < (1 << (TRANSFER_ID_BIT_LEN - 1));

        let need_restart = not_initialized
            || tid_timed_out
            || (same_iface && first_frame && not_previous_tid)
            || (iface_switch_allowed && first_frame && non_wrapped_tid);

        if need_restart {
            release_state_payload(&mut self.pool, state_idx);
            let state = self.pool.rx_mut(state_idx);
            state.transfer_id = frame_tid;
            state.next_toggle = false;
            state.iface_id = frame.iface_id;
            if !first_frame {
                state.transfer_id = (state.transfer_id + 1) & ((1 << TRANSFER_ID_BIT_LEN) - 1);
                return Err(Error::RxMissedStart);
            }
        }

        if frame.iface_id != self.pool.rx(state_idx).iface_id {
            return Ok(RxOutcome::Ok);
        }

        if tail.start_of_transfer() && tail.end_of_transfer() {
            let data = &frame.data;
            let mut head = [0u8; H];
            let payload_len = (data.len() - 1) as u16;
            let copy_len = (payload_len as usize).min(H);
            head[..copy_len].copy_from_slice(&data[..copy_len]);
            let tail_bytes = &data[copy_len..data.len() - 1];

            self.pool.rx_mut(state_idx).timestamp_usec = timestamp_usec;
            prepare_for_next_transfer(&mut self.pool, state_idx);

            let mut transfer = CompletedTransfer::<H> {
                timestamp_usec,
                data_type_id,
                transfer_type,
                transfer_id: frame_tid,
                priority,
                source_node_id,
                #[cfg(feature = "canfd")]
                canfd: frame.canfd,
                payload_len,
                head,
                middle: None,
                tail: ArrayVec::new(),
            };
            let _ = transfer.tail.try_extend_from_slice(tail_bytes);
            return Ok(RxOutcome::Complete(transfer));
        }

        if tail.toggle() != self.pool.rx(state_idx).next_toggle {
            return Err(Error::RxWrongToggle);
        }
        if frame_tid != self.pool.rx(state_idx).transfer_id {
            return Err(Error::RxUnexpectedTid);
        }

        if tail.start_of_transfer() && !tail.end_of_transfer() {
            if frame.data.len() <= 3 {
                return Err(Error::RxShortFrame);
            }
            self.pool.rx_mut(state_idx).timestamp_usec = timestamp_usec;
            let body = &frame.data[2..frame.data.len() - 1];
            if let Err(e) = buffer_block_push_bytes(&mut self.pool, state_idx, body) {
                release_state_payload(&mut self.pool, state_idx);
                prepare_for_next_transfer(&mut self.pool, state_idx);
                return Err(e);
            }
            let state = self.pool.rx_mut(state_idx);
            state.payload_crc = (frame.data[0] as u16) | ((frame.data[1] as u16) << 8);
            let sig = state.payload_crc_signature;
            let seeded = crc::add_signature(crc::CRC_INITIAL, sig);
            state.calculated_crc = crc::add(seeded, body);
        } else if !tail.start_of_transfer() && !tail.end_of_transfer() {
            let body = &frame.data[..frame.data.len() - 1];
            if let Err(e) = buffer_block_push_bytes(&mut self.pool, state_idx, body) {
                release_state_payload(&mut self.pool, state_idx);
                prepare_for_next_transfer(&mut self.pool, state_idx);
                return Err(e);
            }
            let state = self.pool.rx_mut(state_idx);
            state.calculated_crc = crc::add(state.calculated_crc, body);
        } else {
            // End of a multi-frame transfer. This frame's body first spills
            // into whatever spare room remains in the head buffer or the
            // last allocated block (matching how every earlier frame was
            // stored); only the leftover beyond that is delivered as the
            // owned tail slice.
            let body = &frame.data[..frame.data.len() - 1];
            let payload_len_before = self.pool.rx(state_idx).payload_len;
            let payload_len = payload_len_before + body.len() as u16;

            let consumed = spill_final_frame(&mut self.pool, state_idx, body);

            let state = self.pool.rx(state_idx);
            let head = state.buffer_head;
            let calculated_crc = crc::add(state.calculated_crc, body);
            let payload_crc = state.payload_crc;
            let middle = state.buffer_blocks;
            self.pool.rx_mut(state_idx).buffer_blocks = None;

            let mut tail_buf = ArrayVec::new();
            let _ = tail_buf.try_extend_from_slice(&body[consumed..]);

            self.pool.rx_mut(state_idx).timestamp_usec = timestamp_usec;
            prepare_for_next_transfer(&mut self.pool, state_idx);

            if calculated_crc != payload_crc {
                return Err(Error::RxBadCrc);
            }

            return Ok(RxOutcome::Complete(CompletedTransfer {
                timestamp_usec,
                data_type_id,
                transfer_type,
                transfer_id: frame_tid,
                priority,
                source_node_id,
                #[cfg(feature = "canfd")]
                canfd: frame.canfd,
                payload_len,
                head,
                middle,
                tail: tail_buf,
            }));
        }

        let state = self.pool.rx_mut(state_idx);
        state.next_toggle = !state.next_toggle;
        Ok(RxOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::pool::Slot;

    const SIGNATURE: DataTypeSignature = 0x0123_4567_89AB_CDEF;

    fn arena<const N: usize>() -> [Slot<6, 32>; N] {
        core::array::from_fn(|_| Slot::Free(None))
    }

    #[test]
    fn anonymous_broadcast_sets_discriminator_and_source_zero() {
        let mut slots = arena::<4>();
        let mut instance = Instance::new(&mut slots, |_, _, _| Some(SIGNATURE));

        let payload = [0xAAu8, 0xBB];
        let mut tid = 0u8;
        instance.broadcast(2, &mut tid, 0, &payload, 0, false).unwrap();

        let frame = instance.peek_tx().unwrap();
        let raw = frame.raw_id();

        assert_eq!(frame::source_node_id(raw), 0);
        assert_eq!(crate::frame::extract_data_type(raw), 2);
        let discriminator = (crc::add(crc::CRC_INITIAL, &payload) & 0x7FFE) as u32;
        assert_eq!((raw >> 9) & 0x7FFE, discriminator);
        assert_eq!(*frame.data.last().unwrap(), 0xC0);
    }

    #[test]
    fn multi_frame_round_trip_completes_with_matching_crc() {
        let mut tx_slots = arena::<8>();
        let mut tx = Instance::new(&mut tx_slots, |_, _, _| Some(SIGNATURE));
        tx.set_local_node_id(10).unwrap();

        let payload: [u8; 9] = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        let payload_crc = crc::transfer_crc(&payload, SIGNATURE, false);

        let mut on_wire = [0u8; 11];
        on_wire[0] = (payload_crc & 0xFF) as u8;
        on_wire[1] = (payload_crc >> 8) as u8;
        on_wire[2..].copy_from_slice(&payload);

        let mut tid = 0u8;
        let n = tx.broadcast(100, &mut tid, 5, &on_wire, 0, false).unwrap();
        assert_eq!(n, 2);

        let frame1 = tx.peek_tx().unwrap().clone();
        tx.pop_tx();
        let frame2 = tx.peek_tx().unwrap().clone();
        tx.pop_tx();

        let mut rx_slots = arena::<8>();
        let mut rx = Instance::new(&mut rx_slots, |_, _, _| Some(SIGNATURE));

        match rx.handle_rx(&frame1, 1_000).unwrap() {
            RxOutcome::Ok => {}
            RxOutcome::Complete(_) => panic!("first frame should not complete the transfer"),
        }

        match rx.handle_rx(&frame2, 1_100).unwrap() {
            RxOutcome::Complete(transfer) => {
                assert_eq!(transfer.payload_len, 9);
                assert_eq!(transfer.data_type_id, 100);

                // Byte 5 (0-indexed) straddles the inline head buffer's
                // boundary (H=6) spilled from the final frame, and byte 8
                // only ever lived in the owned tail buffer — both must come
                // back untouched, not shifted or garbled.
                for (i, expected) in payload.iter().enumerate() {
                    let (value, bits) = rx.decode_scalar(&transfer, (i as u32) * 8, 8, false).unwrap();
                    assert_eq!(bits, 8, "byte {i} truncated");
                    assert_eq!(value as u8, *expected, "byte {i} mismatched");
                }
            }
            RxOutcome::Ok => panic!("second frame should complete the transfer"),
        }
    }

    #[test]
    fn wrong_toggle_on_second_frame_is_rejected() {
        let mut tx_slots = arena::<8>();
        let mut tx = Instance::new(&mut tx_slots, |_, _, _| Some(SIGNATURE));
        tx.set_local_node_id(10).unwrap();

        let payload: [u8; 9] = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        let payload_crc = crc::transfer_crc(&payload, SIGNATURE, false);
        let mut on_wire = [0u8; 11];
        on_wire[0] = (payload_crc & 0xFF) as u8;
        on_wire[1] = (payload_crc >> 8) as u8;
        on_wire[2..].copy_from_slice(&payload);

        let mut tid = 0u8;
        tx.broadcast(100, &mut tid, 5, &on_wire, 0, false).unwrap();

        let frame1 = tx.peek_tx().unwrap().clone();
        tx.pop_tx();
        let mut frame2 = tx.peek_tx().unwrap().clone();
        tx.pop_tx();

        let last = frame2.data.len() - 1;
        frame2.data[last] &= !0x20; // clear toggle bit

        let mut rx_slots = arena::<8>();
        let mut rx = Instance::new(&mut rx_slots, |_, _, _| Some(SIGNATURE));

        rx.handle_rx(&frame1, 1_000).unwrap();
        let err = rx.handle_rx(&frame2, 1_100).unwrap_err();
        assert_eq!(err, Error::RxWrongToggle);
    }

    #[test]
    fn second_interface_within_100ms_is_dropped_silently() {
        let mut slots = arena::<8>();
        let mut rx = Instance::new(&mut slots, |_, _, _| Some(SIGNATURE));

        let raw_id = frame::message_id(0, 7, 5);
        let mut frame_a = CanFrame {
            id: embedded_can::ExtendedId::new(raw_id).unwrap(),
            data: ArrayVec::new(),
            #[cfg(feature = "multi-iface")]
            iface_mask: 0,
            iface_id: 0,
            #[cfg(feature = "canfd")]
            canfd: false,
        };
        frame_a.data.try_extend_from_slice(&[0xAA, 0xC0]).unwrap();

        match rx.handle_rx(&frame_a, 1_000).unwrap() {
            RxOutcome::Complete(_) => {}
            RxOutcome::Ok => panic!("single-frame transfer should complete"),
        }

        let mut frame_b = frame_a.clone();
        frame_b.iface_id = 1;

        match rx.handle_rx(&frame_b, 101_000).unwrap() {
            RxOutcome::Ok => {}
            RxOutcome::Complete(_) => panic!("second iface within 100ms must not restart"),
        }
    }
}
