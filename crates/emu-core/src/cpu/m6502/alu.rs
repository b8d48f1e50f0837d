//! Flag-exact arithmetic and shift helpers.
//!
//! Every helper takes the incoming status register and returns the result together with the
//! updated status. Decimal and binary arithmetic are separate algorithms; on the NMOS part the
//! decimal N, V and Z flags come from intermediate values, not from the corrected result.

#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_lossless
)]

use super::state::{FLAG_C, FLAG_D, FLAG_N, FLAG_V, FLAG_Z};

/// Sets N and Z from `value`.
#[must_use]
pub const fn set_nz(p: u8, value: u8) -> u8 {
    let mut p = p & !(FLAG_N | FLAG_Z);
    if value & 0x80 != 0 {
        p |= FLAG_N;
    }
    if value == 0 {
        p |= FLAG_Z;
    }
    p
}

/// Binary-mode add with carry.
#[must_use]
pub const fn adc_binary(a: u8, value: u8, p: u8) -> (u8, u8) {
    let sum = a as u16 + value as u16 + (p & FLAG_C) as u16;
    let mut p = p & !(FLAG_N | FLAG_V | FLAG_Z | FLAG_C);
    if sum as u8 == 0 {
        p |= FLAG_Z;
    } else if (sum as u8 as i8) < 0 {
        p |= FLAG_N;
    }
    if !(a ^ value) & (a ^ sum as u8) & 0x80 != 0 {
        p |= FLAG_V;
    }
    if sum & 0xff00 != 0 {
        p |= FLAG_C;
    }
    (sum as u8, p)
}

/// Decimal-mode add with carry.
#[must_use]
pub const fn adc_decimal(a: u8, value: u8, p: u8) -> (u8, u8) {
    let carry = p & FLAG_C;
    let mut p = p & !(FLAG_N | FLAG_V | FLAG_Z | FLAG_C);
    let mut low = (a & 15) + (value & 15) + carry;
    if low > 9 {
        low += 6;
    }
    let mut high = (a >> 4) + (value >> 4) + (low > 15) as u8;
    if a.wrapping_add(value).wrapping_add(carry) == 0 {
        p |= FLAG_Z;
    } else if high & 8 != 0 {
        p |= FLAG_N;
    }
    if !(a ^ value) & (a ^ (high << 4)) & 0x80 != 0 {
        p |= FLAG_V;
    }
    if high > 9 {
        high += 6;
    }
    if high > 15 {
        p |= FLAG_C;
    }
    ((high << 4) | (low & 15), p)
}

/// Add with carry in the mode selected by the D flag.
#[must_use]
pub const fn adc(a: u8, value: u8, p: u8) -> (u8, u8) {
    if p & FLAG_D != 0 {
        adc_decimal(a, value, p)
    } else {
        adc_binary(a, value, p)
    }
}

/// Binary-mode subtract with borrow.
#[must_use]
pub const fn sbc_binary(a: u8, value: u8, p: u8) -> (u8, u8) {
    let borrow = if p & FLAG_C != 0 { 0 } else { 1 };
    let diff = (a as u16).wrapping_sub(value as u16).wrapping_sub(borrow);
    let mut p = p & !(FLAG_N | FLAG_V | FLAG_Z | FLAG_C);
    if diff as u8 == 0 {
        p |= FLAG_Z;
    } else if (diff as u8 as i8) < 0 {
        p |= FLAG_N;
    }
    if (a ^ value) & (a ^ diff as u8) & 0x80 != 0 {
        p |= FLAG_V;
    }
    if diff & 0xff00 == 0 {
        p |= FLAG_C;
    }
    (diff as u8, p)
}

/// Decimal-mode subtract with borrow.
#[must_use]
pub const fn sbc_decimal(a: u8, value: u8, p: u8) -> (u8, u8) {
    let borrow: u8 = if p & FLAG_C != 0 { 0 } else { 1 };
    let mut p = p & !(FLAG_N | FLAG_V | FLAG_Z | FLAG_C);
    let diff = (a as u16).wrapping_sub(value as u16).wrapping_sub(borrow as u16);
    let mut low = (a & 15).wrapping_sub(value & 15).wrapping_sub(borrow);
    if (low as i8) < 0 {
        low = low.wrapping_sub(6);
    }
    let mut high = (a >> 4)
        .wrapping_sub(value >> 4)
        .wrapping_sub(((low as i8) < 0) as u8);
    if diff as u8 == 0 {
        p |= FLAG_Z;
    } else if diff & 0x80 != 0 {
        p |= FLAG_N;
    }
    if (a ^ value) & (a ^ diff as u8) & 0x80 != 0 {
        p |= FLAG_V;
    }
    if diff & 0xff00 == 0 {
        p |= FLAG_C;
    }
    if (high as i8) < 0 {
        high = high.wrapping_sub(6);
    }
    ((high << 4) | (low & 15), p)
}

/// Subtract with borrow in the mode selected by the D flag.
#[must_use]
pub const fn sbc(a: u8, value: u8, p: u8) -> (u8, u8) {
    if p & FLAG_D != 0 {
        sbc_decimal(a, value, p)
    } else {
        sbc_binary(a, value, p)
    }
}

/// Binary-mode ARR: rotate A right through carry, then C and V from bits 6 and 5.
#[must_use]
pub const fn arr_binary(a: u8, p: u8) -> (u8, u8) {
    let carry = p & FLAG_C != 0;
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C | FLAG_V);
    let mut a = a >> 1;
    if carry {
        a |= 0x80;
    }
    if a == 0 {
        p |= FLAG_Z;
    } else if (a as i8) < 0 {
        p |= FLAG_N;
    }
    if a & 0x40 != 0 {
        p |= FLAG_V | FLAG_C;
    }
    if a & 0x20 != 0 {
        p ^= FLAG_V;
    }
    (a, p)
}

/// Decimal-mode ARR, with the nibble fix-ups the adder applies on the rotated value.
#[must_use]
pub const fn arr_decimal(a: u8, p: u8) -> (u8, u8) {
    let carry = p & FLAG_C != 0;
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C | FLAG_V);
    let mut rotated = a >> 1;
    if carry {
        rotated |= 0x80;
    }
    if rotated == 0 {
        p |= FLAG_Z;
    } else if (rotated as i8) < 0 {
        p |= FLAG_N;
    }
    if (rotated ^ a) & 0x40 != 0 {
        p |= FLAG_V;
    }
    if a & 0x0f >= 0x05 {
        rotated = (rotated.wrapping_add(6) & 0x0f) | (rotated & 0xf0);
    }
    if a & 0xf0 >= 0x50 {
        rotated = rotated.wrapping_add(0x60);
        p |= FLAG_C;
    }
    (rotated, p)
}

/// ARR in the mode selected by the D flag.
#[must_use]
pub const fn arr(a: u8, p: u8) -> (u8, u8) {
    if p & FLAG_D != 0 {
        arr_decimal(a, p)
    } else {
        arr_binary(a, p)
    }
}

/// Compare: N, Z and C from `left - right`.
#[must_use]
pub const fn compare(left: u8, right: u8, p: u8) -> u8 {
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C);
    let result = (left as u16).wrapping_sub(right as u16);
    if result == 0 {
        p |= FLAG_Z;
    } else if (result as u8 as i8) < 0 {
        p |= FLAG_N;
    }
    if result & 0xff00 == 0 {
        p |= FLAG_C;
    }
    p
}

/// BIT: Z from `a & value`, N and V copied from the operand.
#[must_use]
pub const fn bit(a: u8, value: u8, p: u8) -> u8 {
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_V);
    if a & value == 0 {
        p |= FLAG_Z;
    }
    if value & 0x80 != 0 {
        p |= FLAG_N;
    }
    if value & 0x40 != 0 {
        p |= FLAG_V;
    }
    p
}

/// Arithmetic shift left.
#[must_use]
pub const fn asl(value: u8, p: u8) -> (u8, u8) {
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C);
    let result = value << 1;
    if result == 0 {
        p |= FLAG_Z;
    } else if (result as i8) < 0 {
        p |= FLAG_N;
    }
    if value & 0x80 != 0 {
        p |= FLAG_C;
    }
    (result, p)
}

/// Logical shift right.
#[must_use]
pub const fn lsr(value: u8, p: u8) -> (u8, u8) {
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C);
    if value & 1 != 0 {
        p |= FLAG_C;
    }
    let result = value >> 1;
    if result == 0 {
        p |= FLAG_Z;
    }
    (result, p)
}

/// Rotate right through carry.
#[must_use]
pub const fn ror(value: u8, p: u8) -> (u8, u8) {
    let carry = p & FLAG_C != 0;
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C);
    if value & 1 != 0 {
        p |= FLAG_C;
    }
    let mut result = value >> 1;
    if carry {
        result |= 0x80;
    }
    if result == 0 {
        p |= FLAG_Z;
    } else if (result as i8) < 0 {
        p |= FLAG_N;
    }
    (result, p)
}

/// Rotate left through carry.
#[must_use]
pub const fn rol(value: u8, p: u8) -> (u8, u8) {
    let carry = p & FLAG_C != 0;
    let mut p = p & !(FLAG_N | FLAG_Z | FLAG_C);
    if value & 0x80 != 0 {
        p |= FLAG_C;
    }
    let mut result = value << 1;
    if carry {
        result |= 0x01;
    }
    if result == 0 {
        p |= FLAG_Z;
    } else if (result as i8) < 0 {
        p |= FLAG_N;
    }
    (result, p)
}

#[cfg(test)]
mod tests {
    use super::{adc_binary, adc_decimal, arr_binary, compare, sbc_binary, sbc_decimal};
    use crate::cpu::m6502::state::{FLAG_C, FLAG_N, FLAG_V, FLAG_Z};
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x7f, 0x01, 0, 0x80, FLAG_N | FLAG_V)]
    #[case(0xff, 0x01, 0, 0x00, FLAG_Z | FLAG_C)]
    #[case(0x80, 0x80, 0, 0x00, FLAG_Z | FLAG_V | FLAG_C)]
    #[case(0x01, 0x01, FLAG_C, 0x03, 0)]
    fn binary_add_flags(
        #[case] a: u8,
        #[case] value: u8,
        #[case] p: u8,
        #[case] result: u8,
        #[case] flags: u8,
    ) {
        assert_eq!(adc_binary(a, value, p), (result, flags));
    }

    #[test]
    fn decimal_add_corrects_nibbles() {
        let (result, p) = adc_decimal(0x09, 0x01, 0);
        assert_eq!(result, 0x10);
        assert_eq!(p & FLAG_C, 0);
        assert_ne!(adc_binary(0x09, 0x01, 0).0, result);

        let (result, p) = adc_decimal(0x99, 0x01, 0);
        assert_eq!(result, 0x00);
        assert_eq!(p & FLAG_C, FLAG_C);
        // Z comes from the binary sum on NMOS parts
        assert_eq!(p & FLAG_Z, 0);
    }

    #[test]
    fn decimal_subtract_borrows_across_nibbles() {
        assert_eq!(sbc_decimal(0x10, 0x01, FLAG_C).0, 0x09);
        let (result, p) = sbc_decimal(0x00, 0x01, FLAG_C);
        assert_eq!(result, 0x99);
        assert_eq!(p & FLAG_C, 0);
    }

    #[test]
    fn arr_sets_carry_and_overflow_from_bits_six_and_five() {
        let (result, p) = arr_binary(0xc0, 0);
        assert_eq!(result, 0x60);
        assert_eq!(p & (FLAG_C | FLAG_V), FLAG_C);
    }

    proptest! {
        #[test]
        fn binary_add_matches_wide_arithmetic(a in any::<u8>(), value in any::<u8>(), carry in any::<bool>()) {
            let p = if carry { FLAG_C } else { 0 };
            let wide = u16::from(a) + u16::from(value) + u16::from(carry);
            let (result, flags) = adc_binary(a, value, p);
            prop_assert_eq!(u16::from(result), wide & 0xff);
            prop_assert_eq!(flags & FLAG_C != 0, wide > 0xff);
            prop_assert_eq!(flags & FLAG_Z != 0, result == 0);
            prop_assert_eq!(flags & FLAG_N != 0, result & 0x80 != 0);
            let signed = i16::from(a as i8) + i16::from(value as i8) + i16::from(carry);
            prop_assert_eq!(flags & FLAG_V != 0, !(-128..=127).contains(&signed));
        }

        #[test]
        fn binary_subtract_inverts_add(a in any::<u8>(), value in any::<u8>()) {
            let (result, flags) = sbc_binary(a, value, FLAG_C);
            prop_assert_eq!(result, a.wrapping_sub(value));
            prop_assert_eq!(flags & FLAG_C != 0, a >= value);
            prop_assert_eq!(compare(a, value, 0) & FLAG_C, flags & FLAG_C);
        }
    }
}
