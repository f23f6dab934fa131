//! Frame reassembly: the RX state table, buffer-block chaining, the
//! restart decision, and scatter-read access to a completed transfer's
//! payload.

use arrayvec::ArrayVec;

use crate::bits::{copy_bit_array, decode_scalar_from_storage};
use crate::crc;
use crate::error::Error;
use crate::pool::Pool;
use crate::types::{DataTypeId, DataTypeSignature, NodeId, TransferType, MAX_FRAME_PAYLOAD};

/// One in-progress (or freshly completed, briefly) reassembly slot, keyed
/// by transfer descriptor. `H` is the number of payload bytes held inline
/// before overflowing into buffer blocks.
pub struct RxState<const H: usize> {
    pub(crate) next: Option<u16>,
    pub(crate) descriptor: u32,
    pub(crate) timestamp_usec: u64,
    pub(crate) transfer_id: u8,
    pub(crate) next_toggle: bool,
    pub(crate) payload_len: u16,
    pub(crate) payload_crc: u16,
    pub(crate) calculated_crc: u16,
    pub(crate) iface_id: u8,
    pub(crate) buffer_head: [u8; H],
    pub(crate) buffer_blocks: Option<u16>,
    /// Signature handed back by the acceptance callback at start-of-transfer;
    /// carried here so later frames of the same transfer can seed the CRC
    /// without consulting the callback again.
    pub(crate) payload_crc_signature: DataTypeSignature,
}

impl<const H: usize> RxState<H> {
    pub(crate) fn new(descriptor: u32) -> Self {
        Self {
            next: None,
            descriptor,
            timestamp_usec: 0,
            transfer_id: 0,
            next_toggle: false,
            payload_len: 0,
            payload_crc: 0,
            calculated_crc: crc::CRC_INITIAL,
            iface_id: 0,
            buffer_head: [0u8; H],
            buffer_blocks: None,
            payload_crc_signature: 0,
        }
    }
}

/// Fixed-size payload fragment chained onto an `RxState` once its inline
/// head buffer fills up.
pub struct BufferBlock<const B: usize> {
    pub(crate) next: Option<u16>,
    pub(crate) data: [u8; B],
}

impl<const B: usize> BufferBlock<B> {
    pub(crate) fn new() -> Self {
        Self { next: None, data: [0u8; B] }
    }
}

/// A transfer delivered to the application by `handle_rx`. The middle
/// block list transfers ownership here as plain pool indices; the head and
/// tail are copied into owned storage so the transfer carries no borrow
/// from the inbound frame (see `DESIGN.md` for why this departs from the
/// pointer-based original).
pub struct CompletedTransfer<const H: usize> {
    pub timestamp_usec: u64,
    pub data_type_id: DataTypeId,
    pub transfer_type: TransferType,
    pub transfer_id: u8,
    pub priority: u8,
    pub source_node_id: NodeId,
    #[cfg(feature = "canfd")]
    pub canfd: bool,
    pub payload_len: u16,
    pub(crate) head: [u8; H],
    pub(crate) middle: Option<u16>,
    pub(crate) tail: ArrayVec<[u8; MAX_FRAME_PAYLOAD]>,
}

impl<const H: usize> CompletedTransfer<H> {
    fn empty() -> Self {
        Self {
            timestamp_usec: 0,
            data_type_id: 0,
            transfer_type: TransferType::Broadcast,
            transfer_id: 0,
            priority: 0,
            source_node_id: 0,
            #[cfg(feature = "canfd")]
            canfd: false,
            payload_len: 0,
            head: [0u8; H],
            middle: None,
            tail: ArrayVec::new(),
        }
    }

    /// Reads `bit_length` bits starting at `bit_offset` from the scattered
    /// payload into an 8-byte little-endian, zero-padded scratch buffer.
    /// Returns the number of bits actually produced (less than requested
    /// only if the request runs past the end of the transfer).
    fn descatter<const B: usize>(
        &self,
        pool: &Pool<H, B>,
        bit_offset: u32,
        mut bit_length: u8,
        output: &mut [u8; 8],
    ) -> u8 {
        let total_bits = self.payload_len as u32 * 8;
        if bit_offset >= total_bits {
            return 0;
        }
        if bit_offset + bit_length as u32 > total_bits {
            bit_length = (total_bits - bit_offset) as u8;
        }
        if bit_length == 0 {
            return 0;
        }

        if self.middle.is_none() && self.tail.is_empty() {
            copy_bit_array(&self.head, bit_offset, bit_length as u32, output, 0);
            return bit_length;
        }

        let head_bits = H as u32 * 8;
        let mut input_bit_offset = bit_offset;
        let mut output_bit_offset: u8 = 0;
        let mut remaining = bit_length;

        if input_bit_offset < head_bits {
            let amount = remaining.min((head_bits - input_bit_offset) as u8);
            copy_bit_array(&self.head, input_bit_offset, amount as u32, output, 0);
            input_bit_offset += amount as u32;
            output_bit_offset += amount;
            remaining -= amount;
        }

        let mut remaining_bits = total_bits - head_bits;
        let mut block_bit_offset = head_bits;
        let mut block_idx = self.middle;

        while let Some(idx) = block_idx {
            if remaining == 0 {
                break;
            }
            let block_len_bits = (B as u32 * 8).min(remaining_bits);
            let block_end_bit_offset = block_bit_offset + block_len_bits;

            if block_end_bit_offset > input_bit_offset {
                let amount = remaining.min((block_end_bit_offset - input_bit_offset) as u8);
                let bit_offset_within_block = input_bit_offset - block_bit_offset;
                copy_bit_array(&pool.buf(idx).data, bit_offset_within_block, amount as u32, output, output_bit_offset as u32);
                input_bit_offset += amount as u32;
                output_bit_offset += amount;
                remaining -= amount;
            }

            remaining_bits -= block_end_bit_offset - block_bit_offset;
            block_bit_offset = block_end_bit_offset;
            block_idx = pool.buf(idx).next;
        }

        if !self.tail.is_empty() && remaining > 0 {
            let offset = input_bit_offset - block_bit_offset;
            copy_bit_array(&self.tail, offset, remaining as u32, output, output_bit_offset as u32);
            remaining = 0;
        }

        let _ = remaining;
        bit_length
    }

    /// Decodes a scalar field, returning `(value, bits_read)`. `value`'s
    /// low `bit_length` bits are sign-extended when `signed` is set.
    ///
    /// Exposed on the transfer only within the crate: the pool it reads
    /// blocks from is owned by the `Instance` the transfer came from, so
    /// the public entry point is [`crate::instance::Instance::decode_scalar`].
    pub(crate) fn decode_scalar<const B: usize>(
        &self,
        pool: &Pool<H, B>,
        bit_offset: u32,
        bit_length: u8,
        signed: bool,
    ) -> Result<(u64, u8), Error> {
        if bit_length < 1 || bit_length > 64 || (bit_length == 1 && signed) {
            return Err(Error::InvalidArgument);
        }
        let mut storage = [0u8; 8];
        let bits_read = self.descatter(pool, bit_offset, bit_length, &mut storage);
        if bits_read == 0 {
            return Ok((0, 0));
        }
        Ok((decode_scalar_from_storage(storage, bit_length, signed), bits_read))
    }
}

pub(crate) fn find_rx_state<const H: usize, const B: usize>(
    pool: &Pool<H, B>,
    mut head: Option<u16>,
    descriptor: u32,
) -> Option<u16> {
    while let Some(idx) = head {
        if pool.rx(idx).descriptor == descriptor {
            return Some(idx);
        }
        head = pool.rx(idx).next;
    }
    None
}

pub(crate) fn prepend_rx_state<const H: usize, const B: usize>(
    pool: &mut Pool<H, B>,
    head: &mut Option<u16>,
    descriptor: u32,
) -> Result<u16, Error> {
    let idx = pool.alloc_rx(RxState::new(descriptor)).ok_or(Error::OutOfMemory)?;
    pool.rx_mut(idx).next = *head;
    *head = Some(idx);
    Ok(idx)
}

pub(crate) fn prepare_for_next_transfer<const H: usize, const B: usize>(pool: &mut Pool<H, B>, state_idx: u16) {
    let state = pool.rx_mut(state_idx);
    debug_assert!(state.buffer_blocks.is_none());
    state.transfer_id = (state.transfer_id + 1) & 0x1F;
    state.payload_len = 0;
    state.next_toggle = false;
}

pub(crate) fn release_state_payload<const H: usize, const B: usize>(pool: &mut Pool<H, B>, state_idx: u16) {
    let mut cur = pool.rx(state_idx).buffer_blocks;
    while let Some(idx) = cur {
        let next = pool.buf(idx).next;
        pool.free_buf(idx);
        cur = next;
    }
    pool.rx_mut(state_idx).buffer_blocks = None;
}

/// Before delivering the final frame of a multi-frame transfer, spills as
/// much of its body as fits into the inline head buffer (if it still has
/// spare room) or into the last allocated buffer block (if one exists and
/// isn't full), mirroring canard.c's end-of-transfer handling. No new
/// block is ever allocated here. Returns the number of leading bytes of
/// `body` absorbed this way; the remainder belongs in the completed
/// transfer's owned tail buffer.
pub(crate) fn spill_final_frame<const H: usize, const B: usize>(
    pool: &mut Pool<H, B>,
    state_idx: u16,
    body: &[u8],
) -> usize {
    let payload_len_before = pool.rx(state_idx).payload_len as usize;
    let mut consumed = 0usize;

    if payload_len_before < H {
        let state = pool.rx_mut(state_idx);
        let mut i = payload_len_before;
        while i < H && consumed < body.len() {
            state.buffer_head[i] = body[consumed];
            i += 1;
            consumed += 1;
        }
    } else if let Some(first_block) = pool.rx(state_idx).buffer_blocks {
        let mut last_block = first_block;
        let mut offset = H;
        while let Some(next) = pool.buf(last_block).next {
            last_block = next;
            offset += B;
        }
        let offset_within_block = payload_len_before - offset;
        let block = pool.buf_mut(last_block);
        let mut i = offset_within_block;
        while i < B && consumed < body.len() {
            block.data[i] = body[consumed];
            i += 1;
            consumed += 1;
        }
    }

    consumed
}

/// Appends `data` to the state's reassembly buffer: the inline head first,
/// then however many `B`-sized blocks it takes, allocating new ones only
/// when the current tail block is exactly full.
pub(crate) fn buffer_block_push_bytes<const H: usize, const B: usize>(
    pool: &mut Pool<H, B>,
    state_idx: u16,
    data: &[u8],
) -> Result<(), Error> {
    let data_len = data.len();
    let mut data_index = 0usize;
    let payload_len_before = pool.rx(state_idx).payload_len as usize;

    if payload_len_before < H {
        let state = pool.rx_mut(state_idx);
        let mut i = payload_len_before;
        while i < H && data_index < data_len {
            state.buffer_head[i] = data[data_index];
            i += 1;
            data_index += 1;
        }
        if data_index >= data_len {
            pool.rx_mut(state_idx).payload_len = (payload_len_before + data_len) as u16;
            return Ok(());
        }
    }

    let mut index_at_nth_block = payload_len_before.saturating_sub(H) % B;

    let mut block_idx = match pool.rx(state_idx).buffer_blocks {
        Some(b) => b,
        None => {
            let new_block = pool.alloc_buf(BufferBlock::new()).ok_or(Error::OutOfMemory)?;
            pool.rx_mut(state_idx).buffer_blocks = Some(new_block);
            index_at_nth_block = 0;
            new_block
        }
    };

    let mut nth_block = 1usize;
    while let Some(next) = pool.buf(block_idx).next {
        block_idx = next;
        nth_block += 1;
    }

    let num_buffer_blocks = ((payload_len_before + data_len).saturating_sub(H)) / B + 1;
    if num_buffer_blocks > nth_block && index_at_nth_block == 0 {
        let new_block = pool.alloc_buf(BufferBlock::new()).ok_or(Error::OutOfMemory)?;
        pool.buf_mut(block_idx).next = Some(new_block);
        block_idx = new_block;
    }

    while data_index < data_len {
        let block = pool.buf_mut(block_idx);
        let mut i = index_at_nth_block;
        while i < B && data_index < data_len {
            block.data[i] = data[data_index];
            i += 1;
            data_index += 1;
        }
        if data_index < data_len {
            let new_block = pool.alloc_buf(BufferBlock::new()).ok_or(Error::OutOfMemory)?;
            pool.buf_mut(block_idx).next = Some(new_block);
            block_idx = new_block;
            index_at_nth_block = 0;
        }
    }

    pool.rx_mut(state_idx).payload_len = (payload_len_before + data_len) as u16;
    Ok(())
}

/// `(a - b) mod 32`, always in `[0, 31]`.
pub(crate) fn forward_distance(a: u8, b: u8) -> u8 {
    let mut d = a as i16 - b as i16;
    if d < 0 {
        d += 1 << crate::types::TRANSFER_ID_BIT_LEN;
    }
    d as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena<const N: usize>() -> [crate::pool::Slot<6, 4>; N] {
        core::array::from_fn(|_| crate::pool::Slot::Free(None))
    }

    #[test]
    fn push_bytes_fills_head_then_blocks() {
        let mut slots = arena::<8>();
        let mut pool = Pool::new(&mut slots);
        let idx = pool.alloc_rx(RxState::new(1)).unwrap();

        buffer_block_push_bytes(&mut pool, idx, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        assert_eq!(pool.rx(idx).buffer_head, [1, 2, 3, 4, 5, 6]);
        assert_eq!(pool.rx(idx).payload_len, 10);

        let block0 = pool.rx(idx).buffer_blocks.unwrap();
        assert_eq!(pool.buf(block0).data, [7, 8, 9, 10]);
    }

    #[test]
    fn forward_distance_wraps_mod_32() {
        assert_eq!(forward_distance(1, 30), 3);
        assert_eq!(forward_distance(0, 31), 1);
        assert_eq!(forward_distance(5, 5), 0);
    }

    #[test]
    fn descatter_single_frame_transfer() {
        let slots: [crate::pool::Slot<6, 4>; 1] = core::array::from_fn(|_| crate::pool::Slot::Free(None));
        let mut slots = slots;
        let pool = Pool::new(&mut slots);

        let mut transfer = CompletedTransfer::<6>::empty();
        transfer.payload_len = 2;
        transfer.head = [0xAA, 0xBB, 0, 0, 0, 0];

        let (value, bits) = transfer.decode_scalar(&pool, 0, 16, false).unwrap();
        assert_eq!(bits, 16);
        assert_eq!(value, 0xBBAA);
    }
}
