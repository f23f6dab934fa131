//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no xorout).
//!
//! Multi-frame transfers fold the running value byte-at-a-time across an
//! arbitrary number of `handle_rx` calls, so the accumulator has to be a bare
//! `Copy` `u16` that can live inside [`crate::rx::RxState`] rather than a
//! stateful hasher object threaded through the reassembler.

pub const CRC_INITIAL: u16 = 0xFFFF;

const POLY: u16 = 0x1021;

pub fn add_byte(crc: u16, byte: u8) -> u16 {
    let mut c = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        c = if c & 0x8000 != 0 { (c << 1) ^ POLY } else { c << 1 };
    }
    c
}

pub fn add(crc: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(crc, |c, &b| add_byte(c, b))
}

/// Folds a 64-bit DSDL signature into the CRC, little-endian byte order,
/// as the seed for a multi-frame transfer's payload CRC.
pub fn add_signature(crc: u16, signature: u64) -> u16 {
    add(crc, &signature.to_le_bytes())
}

/// The CRC a multi-frame transfer's first two wire bytes must carry,
/// seeded with the data-type signature. Single-frame payloads carry no CRC
/// on the wire, so below the segmenter's single/multi-frame threshold this
/// just hands back the untouched initial value.
///
/// CAN FD transfers additionally fold in the zero bytes the segmenter pads
/// the final frame with to reach a representable DLC, since the receiver's
/// running CRC folds those padding bytes in along with everything else
/// `handle_rx` reads off the wire (see [`crate::frame::dlc_to_data_length`]).
/// Classic CAN never needs this: its 8-byte MTU has no DLC gaps to pad.
pub fn transfer_crc(payload: &[u8], signature: u64, canfd: bool) -> u16 {
    let single_frame_threshold = if canfd { 63 } else { 7 };
    if payload.len() <= single_frame_threshold {
        return CRC_INITIAL;
    }

    let mut crc = add_signature(CRC_INITIAL, signature);
    crc = add(crc, payload);

    if canfd && payload.len() > 63 {
        let last_chunk = ((payload.len() + 2) % 63) as u8;
        let padded_chunk =
            crate::frame::dlc_to_data_length(crate::frame::data_length_to_dlc(last_chunk + 1)) - 1;
        let padding = padded_chunk - last_chunk;
        for _ in 0..padding {
            crc = add_byte(crc, 0);
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_identity() {
        assert_eq!(add(CRC_INITIAL, &[]), CRC_INITIAL);
    }

    #[test]
    fn known_vector_123456789() {
        // Canonical CRC-16/CCITT-FALSE check value.
        let crc = add(CRC_INITIAL, b"123456789");
        assert_eq!(crc, 0x29B1);
    }

    #[test]
    fn signature_folding_is_order_sensitive() {
        let a = add_signature(CRC_INITIAL, 1);
        let b = add_signature(CRC_INITIAL, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn transfer_crc_below_single_frame_threshold_is_untouched() {
        assert_eq!(transfer_crc(&[1, 2, 3], 0xDEAD_BEEF, false), CRC_INITIAL);
        assert_eq!(transfer_crc(&[0u8; 63], 0xDEAD_BEEF, true), CRC_INITIAL);
    }

    #[test]
    fn transfer_crc_matches_manual_seed_and_fold_for_classic() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let expected = add(add_signature(CRC_INITIAL, 42), &payload);
        assert_eq!(transfer_crc(&payload, 42, false), expected);
    }

    #[test]
    fn transfer_crc_folds_canfd_tail_padding() {
        // 70-byte payload: with the 2 CRC bytes, the on-wire multi-frame
        // stream is 72 bytes, i.e. one full 63-byte chunk plus a 9-byte
        // final chunk. A 9-byte chunk plus its tail byte (10 total) pads up
        // to the 12-byte DLC boundary, so the final frame's payload portion
        // pads from 9 to 11 bytes: 2 zero bytes.
        let payload = [7u8; 70];
        let manual_seed = add_signature(CRC_INITIAL, 99);
        let manual_fold = add(manual_seed, &payload);
        let with_padding = add(manual_fold, &[0u8; 2]);
        assert_eq!(transfer_crc(&payload, 99, true), with_padding);
    }
}
