//! Bit-width codec for data link payloads.
//!
//! A payload is a sequence of rows, each row a fixed number of little-endian
//! 16-bit words ("wire columns"). The word layout depends on the configured
//! sample width:
//!
//! - 16 bit: one word per channel.
//! - 20 bit: `channels` low words, then extra words packing four 4-bit high
//!   nibbles each (nibble `k` of extra word `i` belongs to channel `4i + k`).
//! - 24 bit: `channels` low words, then extra words packing two high bytes each
//!   (low byte for the even channel, high byte for the odd one).
//! - 32 bit: a low word followed by a high word for every channel.
//!
//! The extra-word counts follow the firmware formulas `(c + 1) / 4` and
//! `(c + 1) / 2`. For 20-bit streams this is smaller than `ceil(c / 4)` when
//! `c % 4` is 1 or 2, so those channels carry no high nibble on the wire.

/// Sample widths the firmware can stream.
pub const SUPPORTED_BIT_WIDTHS: [u8; 4] = [16, 20, 24, 32];

/// Width used until a channel is configured otherwise.
pub const DEFAULT_BIT_WIDTH: u8 = 16;

/// One decoded row: a value per channel, sign-extended from the stream width.
pub type SampleFrame = Vec<i32>;

pub fn is_supported_bit_width(bits: u8) -> bool {
    SUPPORTED_BIT_WIDTHS.contains(&bits)
}

/// Number of 16-bit words per row for `channels` samples of width `bits`.
///
/// Unknown widths are treated as 16 bit.
pub fn wire_columns(channels: usize, bits: u8) -> usize {
    match bits {
        16 => channels,
        20 => channels + (channels + 1) / 4,
        24 => channels + (channels + 1) / 2,
        32 => channels * 2,
        _ => channels,
    }
}

/// Find the single supported width whose row layout has `columns` words.
///
/// Returns `None` when no width or more than one width matches.
pub fn infer_bit_width(channels: usize, columns: usize) -> Option<u8> {
    let mut candidates = SUPPORTED_BIT_WIDTHS
        .iter()
        .copied()
        .filter(|&bits| wire_columns(channels, bits) == columns);
    match (candidates.next(), candidates.next()) {
        (Some(bits), None) => Some(bits),
        _ => None,
    }
}

/// Widen an unsigned `bits`-wide two's-complement value.
pub fn sign_extend(value: u32, bits: u8) -> i32 {
    let bits = u32::from(bits.clamp(1, 32));
    let mask = (1u64 << bits) - 1;
    let sign = 1i64 << (bits - 1);
    let value = (u64::from(value) & mask) as i64;
    ((value ^ sign) - sign) as i32
}

/// Decode one row of words into per-channel values.
///
/// `signed` only applies to 16-bit streams; wider streams are always signed.
/// Unknown widths fall back to signed 16 bit. Missing words read as zero.
pub fn decode_row(words: &[u16], channels: usize, bits: u8, signed: bool) -> SampleFrame {
    let row = &words[..words.len().min(wire_columns(channels, bits))];
    let word = |i: usize| row.get(i).copied().map_or(0, u32::from);
    let extras = row.get(channels..).unwrap_or(&[]);

    match bits {
        16 => (0..channels)
            .map(|ch| {
                if signed {
                    sign_extend(word(ch), 16)
                } else {
                    word(ch) as i32
                }
            })
            .collect(),
        20 => (0..channels)
            .map(|ch| {
                let hi = extras
                    .get(ch / 4)
                    .map_or(0, |&w| (u32::from(w) >> ((ch % 4) * 4)) & 0xF);
                sign_extend((hi << 16) | word(ch), 20)
            })
            .collect(),
        24 => (0..channels)
            .map(|ch| {
                let hi = extras
                    .get(ch / 2)
                    .map_or(0, |&w| (u32::from(w) >> ((ch % 2) * 8)) & 0xFF);
                sign_extend((hi << 16) | word(ch), 24)
            })
            .collect(),
        32 => (0..channels)
            .map(|ch| sign_extend((word(2 * ch + 1) << 16) | word(2 * ch), 32))
            .collect(),
        _ => (0..channels).map(|ch| sign_extend(word(ch), 16)).collect(),
    }
}

/// Decode a whole payload into rows.
///
/// A trailing partial row (or a dangling odd byte) is dropped.
pub fn decode_payload(payload: &[u8], channels: usize, bits: u8, signed: bool) -> Vec<SampleFrame> {
    let columns = wire_columns(channels, bits);
    if columns == 0 {
        return Vec::new();
    }

    let words: Vec<u16> = payload
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();

    words
        .chunks_exact(columns)
        .map(|row| decode_row(row, channels, bits, signed))
        .collect()
}

/// Pack rows the way the firmware does. Inverse of [`decode_payload`].
///
/// High bits of channels without an extra-word slot are dropped.
pub fn encode_rows(frames: &[SampleFrame], channels: usize, bits: u8) -> Vec<u8> {
    let columns = wire_columns(channels, bits);
    let mut out = Vec::with_capacity(frames.len() * columns * 2);

    for frame in frames {
        let mut row = vec![0u16; columns];
        for ch in 0..channels {
            let value = frame.get(ch).copied().unwrap_or(0) as u32;
            match bits {
                20 => {
                    row[ch] = value as u16;
                    if let Some(extra) = row.get_mut(channels + ch / 4) {
                        *extra |= (((value >> 16) & 0xF) as u16) << ((ch % 4) * 4);
                    }
                }
                24 => {
                    row[ch] = value as u16;
                    if let Some(extra) = row.get_mut(channels + ch / 2) {
                        *extra |= (((value >> 16) & 0xFF) as u16) << ((ch % 2) * 8);
                    }
                }
                32 => {
                    row[2 * ch] = value as u16;
                    row[2 * ch + 1] = (value >> 16) as u16;
                }
                _ => row[ch] = value as u16,
            }
        }
        for word in row {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value_range(bits: u8) -> (i32, i32) {
        let half = 1i64 << (bits - 1);
        (-half as i32, (half - 1) as i32)
    }

    /// Channel counts whose high bits all have a slot in the extra words.
    fn lossless(channels: usize, bits: u8) -> bool {
        bits != 20 || channels % 4 == 0 || channels % 4 == 3
    }

    fn rows(bits: u8) -> impl Strategy<Value = (usize, Vec<SampleFrame>)> {
        let (min, max) = value_range(bits);
        (1usize..=15)
            .prop_filter("lossless layout", move |&c| lossless(c, bits))
            .prop_flat_map(move |c| {
                (
                    Just(c),
                    prop::collection::vec(prop::collection::vec(min..=max, c), 0..8),
                )
            })
    }

    #[test]
    fn wire_columns_table() {
        assert_eq!(wire_columns(3, 16), 3);
        assert_eq!(wire_columns(3, 20), 4);
        assert_eq!(wire_columns(3, 24), 5);
        assert_eq!(wire_columns(3, 32), 6);
        // (c + 1) / 4 is not a ceiling: 5 channels get a single extra word.
        assert_eq!(wire_columns(5, 20), 6);
        assert_eq!(wire_columns(1, 20), 1);
        assert_eq!(wire_columns(1, 24), 2);
        assert_eq!(wire_columns(4, 99), 4);
    }

    #[test]
    fn sign_extend_boundaries() {
        assert_eq!(sign_extend(0xFFFF, 16), -1);
        assert_eq!(sign_extend(0x8000, 16), i16::MIN as i32);
        assert_eq!(sign_extend(0x7FFF, 16), i16::MAX as i32);
        assert_eq!(sign_extend(0xF_FFFF, 20), -1);
        assert_eq!(sign_extend(0x8_0000, 20), -(1 << 19));
        assert_eq!(sign_extend(0xFF_FFFF, 24), -1);
        assert_eq!(sign_extend(0x7F_FFFF, 24), (1 << 23) - 1);
        assert_eq!(sign_extend(0xFFFF_FFFF, 32), -1);
        assert_eq!(sign_extend(0x8000_0000, 32), i32::MIN);
        // bits above the width are ignored
        assert_eq!(sign_extend(0x1_0001, 16), 1);
    }

    #[test]
    fn decode_sixteen_bit_signedness() {
        let payload = [0xFF, 0xFF, 0x01, 0x00];
        assert_eq!(decode_payload(&payload, 2, 16, true), vec![vec![-1, 1]]);
        assert_eq!(decode_payload(&payload, 2, 16, false), vec![vec![65535, 1]]);
    }

    #[test]
    fn decode_twenty_bit_nibbles() {
        // 3 channels: low words 0x0001, 0x0002, 0x0003, extra word 0x0F21
        let words: [u16; 4] = [0x0001, 0x0002, 0x0003, 0x0F21];
        let row = decode_row(&words, 3, 20, true);
        assert_eq!(row, vec![0x1_0001, 0x2_0002, sign_extend(0xF_0003, 20)]);
        assert_eq!(row[2], -0x1_0000 + 3);
    }

    #[test]
    fn decode_twenty_four_bit_bytes() {
        let words: [u16; 3] = [0x0010, 0x0020, 0xFF7F];
        let row = decode_row(&words, 2, 24, true);
        assert_eq!(row, vec![0x7F_0010, sign_extend(0xFF_0020, 24)]);
        assert_eq!(row[1], -0x1_0000 + 0x20);
    }

    #[test]
    fn decode_thirty_two_bit_pairs() {
        let words: [u16; 4] = [0x5678, 0x1234, 0xFFFE, 0xFFFF];
        assert_eq!(decode_row(&words, 2, 32, true), vec![0x1234_5678, -2]);
    }

    #[test]
    fn unknown_width_decodes_as_signed_sixteen() {
        let payload = [0xFE, 0xFF];
        assert_eq!(decode_payload(&payload, 1, 18, false), vec![vec![-2]]);
    }

    #[test]
    fn trailing_partial_row_is_dropped() {
        let mut payload = encode_rows(&[vec![1, 2], vec![3, 4]], 2, 16);
        payload.extend_from_slice(&[0x05, 0x00, 0x07]);
        assert_eq!(decode_payload(&payload, 2, 16, true), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn inference_requires_a_unique_match() {
        assert_eq!(infer_bit_width(3, 4), Some(20));
        assert_eq!(infer_bit_width(3, 5), Some(24));
        assert_eq!(infer_bit_width(3, 6), Some(32));
        assert_eq!(infer_bit_width(3, 3), Some(16));
        // 1 channel: 16 and 20 both give one column, 24 and 32 both give two
        assert_eq!(infer_bit_width(1, 1), None);
        assert_eq!(infer_bit_width(1, 2), None);
        assert_eq!(infer_bit_width(3, 9), None);
    }

    #[test]
    fn single_channel_twenty_bit_loses_high_nibble() {
        let payload = encode_rows(&[vec![0x1_0005]], 1, 20);
        assert_eq!(payload.len(), 2);
        assert_eq!(decode_payload(&payload, 1, 20, true), vec![vec![5]]);
    }

    proptest! {
        #[test]
        fn prop_wire_columns_formulas(c in 0usize..64) {
            prop_assert_eq!(wire_columns(c, 16), c);
            prop_assert_eq!(wire_columns(c, 20), c + (c + 1) / 4);
            prop_assert_eq!(wire_columns(c, 24), c + (c + 1) / 2);
            prop_assert_eq!(wire_columns(c, 32), 2 * c);
        }

        #[test]
        fn prop_round_trip_16((c, frames) in rows(16)) {
            let payload = encode_rows(&frames, c, 16);
            prop_assert_eq!(decode_payload(&payload, c, 16, true), frames);
        }

        #[test]
        fn prop_round_trip_20((c, frames) in rows(20)) {
            let payload = encode_rows(&frames, c, 20);
            prop_assert_eq!(payload.len(), frames.len() * wire_columns(c, 20) * 2);
            prop_assert_eq!(decode_payload(&payload, c, 20, true), frames);
        }

        #[test]
        fn prop_round_trip_24((c, frames) in rows(24)) {
            let payload = encode_rows(&frames, c, 24);
            prop_assert_eq!(decode_payload(&payload, c, 24, true), frames);
        }

        #[test]
        fn prop_round_trip_32((c, frames) in rows(32)) {
            let payload = encode_rows(&frames, c, 32);
            prop_assert_eq!(decode_payload(&payload, c, 32, true), frames);
        }
    }

    #[test]
    fn round_trip_boundary_values() {
        for bits in SUPPORTED_BIT_WIDTHS {
            let (min, max) = value_range(bits);
            let frames = vec![vec![-1, min, max, 0], vec![max, -1, min, 1]];
            let payload = encode_rows(&frames, 4, bits);
            assert_eq!(decode_payload(&payload, 4, bits, true), frames, "bits={bits}");
        }
    }
}
