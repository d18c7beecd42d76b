// 寄存器解码
// Pure conversions from raw 16-bit Modbus words to typed values

use serde::{Deserialize, Serialize};

/// 16-bit value stored in a Modbus register.
pub type Word = u16;

/// Which of the two physical registers carries the high word of a 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// First register holds the high word
    #[default]
    HighFirst,
    /// First register holds the low word (e.g. the 1A flow sensor)
    LowFirst,
}

impl WordOrder {
    /// Split a register pair into `(high, low)` according to this order.
    pub fn split(self, first: Word, second: Word) -> (Word, Word) {
        match self {
            WordOrder::HighFirst => (first, second),
            WordOrder::LowFirst => (second, first),
        }
    }
}

/// Nonzero means set.
pub fn decode_boolean(raw: Word) -> bool {
    raw != 0
}

/// Two's-complement reinterpretation of a holding register.
pub fn decode_signed_holding(raw: Word) -> i16 {
    raw as i16
}

/// Concatenate `high` then `low` big-endian and read an IEEE-754 single.
pub fn decode_float32_be(high: Word, low: Word) -> f32 {
    let [h0, h1] = high.to_be_bytes();
    let [l0, l1] = low.to_be_bytes();
    f32::from_be_bytes([h0, h1, l0, l1])
}

/// Inverse of [`decode_float32_be`], returns `(high, low)`.
pub fn encode_float32_be(value: f32) -> (Word, Word) {
    let [b0, b1, b2, b3] = value.to_be_bytes();
    (
        Word::from_be_bytes([b0, b1]),
        Word::from_be_bytes([b2, b3]),
    )
}

/// Convert a documented (1-based) register number into the zero-based wire address.
///
/// Modicon-style numbers in the discrete (`1xxxx`, `1xxxxx`) and holding (`4xxxx`,
/// `4xxxxx`) ranges have their prefix stripped first, so `10040`, `40052` and `400052`
/// become `39`, `51` and `51`.
/// Returns `None` for `0`, which has no wire equivalent.
pub fn wire_address(documented: u32) -> Option<u16> {
    let base = match documented {
        10_001..=19_999 => 10_001,
        40_001..=49_999 => 40_001,
        100_001..=165_536 => 100_001,
        400_001..=465_536 => 400_001,
        _ => 1,
    };
    documented
        .checked_sub(base)
        .and_then(|addr| u16::try_from(addr).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_holding_is_twos_complement() {
        assert_eq!(decode_signed_holding(0xFFFF), -1);
        assert_eq!(decode_signed_holding(0x8000), -32768);
        assert_eq!(decode_signed_holding(0x7FFF), 32767);
        assert_eq!(decode_signed_holding(0xFF88), -120);
        assert_eq!(decode_signed_holding(0), 0);
    }

    #[test]
    fn boolean_is_nonzero() {
        assert!(!decode_boolean(0));
        assert!(decode_boolean(1));
        assert!(decode_boolean(0x8000));
    }

    #[test]
    fn float_reassembly_matches_known_bit_pattern() {
        // 12.5 == 0x4148_0000
        assert_eq!(decode_float32_be(0x4148, 0x0000), 12.5);
        assert_eq!(decode_float32_be(0xC148, 0x0000), -12.5);
    }

    #[test]
    fn float_round_trips_through_register_pair() {
        for value in [0.0_f32, 1.0, -1.0, 3.25, 1234.567, f32::MAX, f32::MIN_POSITIVE] {
            let (high, low) = encode_float32_be(value);
            assert_eq!(decode_float32_be(high, low), value);
        }
    }

    #[test]
    fn word_order_swaps_low_first_pairs() {
        let (high, low) = encode_float32_be(42.0);
        let (h, l) = WordOrder::LowFirst.split(low, high);
        assert_eq!(decode_float32_be(h, l), 42.0);
        assert_eq!(WordOrder::HighFirst.split(high, low), (high, low));
    }

    #[test]
    fn documented_addresses_map_to_wire() {
        assert_eq!(wire_address(10_040), Some(39));
        assert_eq!(wire_address(40_052), Some(51));
        assert_eq!(wire_address(1634), Some(1633));
        assert_eq!(wire_address(1), Some(0));
        assert_eq!(wire_address(0), None);
    }

    #[test]
    fn six_digit_modicon_numbers_are_accepted() {
        assert_eq!(wire_address(400_052), Some(51));
        assert_eq!(wire_address(400_104), Some(103));
        assert_eq!(wire_address(100_040), Some(39));
        assert_eq!(wire_address(465_536), Some(65_535));
        // Outside every range and past the u16 space
        assert_eq!(wire_address(300_001), None);
    }
}
