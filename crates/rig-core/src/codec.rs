//! Register-level value encoding shared by the motor and gas devices.
//!
//! Floats travel as IEEE-754 single precision split across two holding
//! registers, high word first. Motor commands are a single register whose
//! high byte selects the command class and low byte the axis/slot.

/// Split a float into two big-endian registers: `[high word, low word]`.
pub fn encode_f32_be(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, bits as u16]
}

/// Inverse of [`encode_f32_be`].
pub fn decode_f32_be(registers: [u16; 2]) -> f32 {
    f32::from_bits(((registers[0] as u32) << 16) | registers[1] as u32)
}

pub fn encode_cmd(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

pub fn decode_cmd(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, word as u8)
}

/// Decode an ASCII block packed two characters per register, high byte first.
/// Trailing NULs and spaces are dropped; non-ASCII bytes are skipped.
pub fn decode_ascii(registers: &[u16]) -> String {
    let text: String = registers
        .iter()
        .flat_map(|word| [(word >> 8) as u8, *word as u8])
        .take_while(|b| *b != 0)
        .filter(|b| b.is_ascii() && !b.is_ascii_control())
        .map(char::from)
        .collect();
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_uses_high_word_first() {
        // 1.0f32 == 0x3F80_0000
        assert_eq!(encode_f32_be(1.0), [0x3F80, 0x0000]);
        assert_eq!(decode_f32_be([0x4120, 0x0000]), 10.0);
    }

    #[test]
    fn command_word_packs_class_then_selector() {
        assert_eq!(encode_cmd(0x01, 0x20), 0x0120);
        assert_eq!(encode_cmd(0x05, 0x10), 0x0510);
        assert_eq!(decode_cmd(0x0402), (0x04, 0x02));
    }

    #[test]
    fn ascii_block_stops_at_nul() {
        let regs = [
            u16::from_be_bytes(*b"N2"),
            u16::from_be_bytes([b' ', 0]),
            u16::from_be_bytes(*b"xx"),
        ];
        assert_eq!(decode_ascii(&regs), "N2");
    }

    #[test]
    fn ascii_block_trims_padding() {
        let regs = [
            u16::from_be_bytes(*b"Ar"),
            u16::from_be_bytes(*b"  "),
            u16::from_be_bytes(*b"  "),
        ];
        assert_eq!(decode_ascii(&regs), "Ar");
    }
}
