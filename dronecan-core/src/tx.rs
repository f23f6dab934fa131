//! Outgoing frame segmentation and the priority-ordered TX queue.
//!
//! Mirrors `enqueueTxFrames`/`pushTxQueue` from the C original. Note that
//! segmentation here never touches the CRC: the original's `enqueueTxFrames`
//! only ever chunks whatever payload buffer it is handed, and its
//! `calculateCRC` helper is never called from inside the TX path — CRC
//! computation and prepending for multi-frame transfers is the caller's
//! job, done once up front with [`crate::crc::transfer_crc`] before calling
//! `broadcast`/`request_or_respond`. That helper already accounts for the
//! zero padding this module inserts ahead of a CAN FD frame's tail byte
//! (`pad_to_dlc_boundary`), so the precomputed CRC matches what the
//! receiver folds in from the wire. See `DESIGN.md` for the full account.

use arrayvec::ArrayVec;
use embedded_can::{ExtendedId, Id};

use crate::error::Error;
use crate::frame::{dlc_to_data_length, data_length_to_dlc, is_priority_higher, max_frame_data_len, CanFrame, TailByte};
use crate::pool::Pool;
use crate::types::TransferId;

pub struct TxQueueNode {
    pub(crate) frame: CanFrame,
    pub(crate) next: Option<u16>,
}

impl TxQueueNode {
    fn new() -> Self {
        Self {
            frame: CanFrame {
                id: ExtendedId::new(0).unwrap(),
                data: ArrayVec::new(),
                #[cfg(feature = "multi-iface")]
                iface_mask: 0,
                iface_id: 0,
                #[cfg(feature = "canfd")]
                canfd: false,
            },
            next: None,
        }
    }
}

/// Inserts `node_idx` into the queue so the node at the head would win
/// arbitration against every other queued node; ties keep earlier
/// insertion first.
pub(crate) fn push_tx_queue<const H: usize, const B: usize>(
    pool: &mut Pool<H, B>,
    head: &mut Option<u16>,
    node_idx: u16,
) {
    let new_id = pool.tx(node_idx).frame.raw_id();

    let first = match *head {
        None => {
            *head = Some(node_idx);
            return;
        }
        Some(first) => first,
    };

    if is_priority_higher(new_id, pool.tx(first).frame.raw_id()) {
        pool.tx_mut(node_idx).next = Some(first);
        *head = Some(node_idx);
        return;
    }

    let mut cur = first;
    loop {
        match pool.tx(cur).next {
            None => {
                pool.tx_mut(cur).next = Some(node_idx);
                return;
            }
            Some(next) => {
                if is_priority_higher(new_id, pool.tx(next).frame.raw_id()) {
                    pool.tx_mut(cur).next = Some(node_idx);
                    pool.tx_mut(node_idx).next = Some(next);
                    return;
                }
                cur = next;
            }
        }
    }
}

fn pad_to_dlc_boundary(data: &mut ArrayVec<[u8; crate::types::MTU_CAN_FD]>) {
    let target = dlc_to_data_length(data_length_to_dlc((data.len() + 1) as u8)) as usize - 1;
    while data.len() < target {
        data.push(0);
    }
}

fn finish_frame(
    node: &mut TxQueueNode,
    can_id: u32,
    #[allow(unused_variables)] iface_mask: u8,
    #[allow(unused_variables)] canfd: bool,
) {
    node.frame.id = ExtendedId::new(can_id & crate::frame::CAN_EXT_ID_MASK).expect("29-bit id");
    #[cfg(feature = "multi-iface")]
    {
        node.frame.iface_mask = iface_mask;
    }
    #[cfg(feature = "canfd")]
    {
        node.frame.canfd = canfd;
    }
}

/// Splits `payload` into one or more queued frames carrying `can_id`,
/// returning the number of frames enqueued.
#[allow(clippy::too_many_arguments)]
pub(crate) fn enqueue_tx_frames<const H: usize, const B: usize>(
    pool: &mut Pool<H, B>,
    tx_queue_head: &mut Option<u16>,
    can_id: u32,
    transfer_id: TransferId,
    payload: &[u8],
    iface_mask: u8,
    canfd: bool,
) -> Result<u16, Error> {
    let max_frame_data = max_frame_data_len(canfd);

    if payload.len() < max_frame_data {
        let idx = pool.alloc_tx(TxQueueNode::new()).ok_or(Error::OutOfMemory)?;
        {
            let node = pool.tx_mut(idx);
            node.frame.data.clear();
            node.frame
                .data
                .try_extend_from_slice(payload)
                .map_err(|_| Error::InvalidArgument)?;
            pad_to_dlc_boundary(&mut node.frame.data);
            let tail = TailByte::new(true, true, false, transfer_id);
            node.frame.data.push(tail.0);
        }
        finish_frame(pool.tx_mut(idx), can_id, iface_mask, canfd);
        push_tx_queue(pool, tx_queue_head, idx);
        return Ok(1);
    }

    let mut data_index = 0usize;
    let mut toggle = false;
    let mut first = true;
    let mut frames = 0u16;

    while data_index < payload.len() {
        let idx = pool.alloc_tx(TxQueueNode::new()).ok_or(Error::OutOfMemory)?;
        let is_last;
        {
            let node = pool.tx_mut(idx);
            node.frame.data.clear();
            let room = max_frame_data - 1;
            while node.frame.data.len() < room && data_index < payload.len() {
                node.frame.data.push(payload[data_index]);
                data_index += 1;
            }
            is_last = data_index == payload.len();
            pad_to_dlc_boundary(&mut node.frame.data);
            let tail = TailByte::new(first, is_last, toggle, transfer_id);
            node.frame.data.push(tail.0);
        }
        finish_frame(pool.tx_mut(idx), can_id, iface_mask, canfd);
        push_tx_queue(pool, tx_queue_head, idx);

        frames += 1;
        toggle = !toggle;
        first = false;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Slot;

    fn arena<const N: usize>() -> [Slot<6, 32>; N] {
        core::array::from_fn(|_| Slot::Free(None))
    }

    #[test]
    fn single_frame_payload_gets_one_frame_with_tail() {
        let mut slots = arena::<8>();
        let mut pool = Pool::new(&mut slots);
        let mut head = None;

        let n = enqueue_tx_frames(&mut pool, &mut head, 0x1234, 3, &[1, 2, 3], 0, false).unwrap();
        assert_eq!(n, 1);

        let idx = head.unwrap();
        let frame = &pool.tx(idx).frame;
        assert_eq!(frame.data.as_slice(), &[1, 2, 3, 0xC0 | 3]);
    }

    #[test]
    fn multi_frame_payload_splits_and_toggles() {
        let mut slots = arena::<8>();
        let mut pool = Pool::new(&mut slots);
        let mut head = None;

        let payload: alloc::vec::Vec<u8> = (0..9u8).collect();
        let n = enqueue_tx_frames(&mut pool, &mut head, 0x1234, 5, &payload, 0, false).unwrap();
        assert_eq!(n, 2);

        let first = head.unwrap();
        let first_frame = &pool.tx(first).frame;
        assert_eq!(first_frame.data.len(), 8);
        assert_eq!(&first_frame.data[0..7], &[0, 1, 2, 3, 4, 5, 6]);
        let tail0 = TailByte(first_frame.data[7]);
        assert!(tail0.start_of_transfer());
        assert!(!tail0.end_of_transfer());
        assert!(!tail0.toggle());

        let second = pool.tx(first).next.unwrap();
        let second_frame = &pool.tx(second).frame;
        assert_eq!(&second_frame.data[0..2], &[7, 8]);
        let tail1 = TailByte(second_frame.data[2]);
        assert!(!tail1.start_of_transfer());
        assert!(tail1.end_of_transfer());
        assert!(tail1.toggle());
    }

    #[test]
    fn queue_orders_by_arbitration_priority() {
        let mut slots = arena::<8>();
        let mut pool = Pool::new(&mut slots);
        let mut head = None;

        for id in [0x100u32, 0x080, 0x0FF, 0x080] {
            enqueue_tx_frames(&mut pool, &mut head, id, 0, &[0xAA], 0, false).unwrap();
        }

        let mut order = alloc::vec::Vec::new();
        let mut cur = head;
        while let Some(idx) = cur {
            order.push(pool.tx(idx).frame.raw_id() & crate::frame::CAN_EXT_ID_MASK);
            cur = pool.tx(idx).next;
        }
        assert_eq!(order, alloc::vec![0x080, 0x080, 0x0FF, 0x100]);
    }
}
