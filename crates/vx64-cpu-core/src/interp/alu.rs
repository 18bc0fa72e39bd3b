//! Width-parameterized flag rules.
//!
//! Every rule is a single function over `u64` operands masked to the operation [`Width`]; the
//! `*_with_flags` helpers combine them the way each instruction family defines its flags.

use vx64_types::Width;

use crate::state::RFlags;

/// Even parity of the low 8 bits.
#[inline]
#[must_use]
pub fn parity(result: u64) -> bool {
    (result as u8).count_ones() % 2 == 0
}

#[inline]
#[must_use]
pub fn zero(width: Width, result: u64) -> bool {
    width.truncate(result) == 0
}

#[inline]
#[must_use]
pub fn sign(width: Width, result: u64) -> bool {
    result & width.sign_bit() != 0
}

/// Carry out of bit 3.
#[inline]
#[must_use]
pub fn adjust(a: u64, b: u64, result: u64) -> bool {
    (a ^ b ^ result) & 0x10 != 0
}

/// Unsigned overflow of `a + b + carry_in`.
#[inline]
#[must_use]
pub fn carry_add(width: Width, a: u64, b: u64, carry_in: bool) -> bool {
    let mask = width.mask();
    (a & mask) as u128 + (b & mask) as u128 + carry_in as u128 > mask as u128
}

/// Unsigned borrow of `a - b - borrow_in`.
#[inline]
#[must_use]
pub fn carry_sub(width: Width, a: u64, b: u64, borrow_in: bool) -> bool {
    let mask = width.mask();
    ((a & mask) as u128) < (b & mask) as u128 + borrow_in as u128
}

/// Two's-complement overflow of an addition producing `result`.
#[inline]
#[must_use]
pub fn overflow_add(width: Width, a: u64, b: u64, result: u64) -> bool {
    (a ^ result) & (b ^ result) & width.sign_bit() != 0
}

/// Two's-complement overflow of a subtraction producing `result`.
#[inline]
#[must_use]
pub fn overflow_sub(width: Width, a: u64, b: u64, result: u64) -> bool {
    (a ^ b) & (a ^ result) & width.sign_bit() != 0
}

/// Sets ZF, SF and PF from `result`.
#[inline]
pub fn set_szp(flags: &mut RFlags, width: Width, result: u64) {
    flags.set(RFlags::ZF, zero(width, result));
    flags.set(RFlags::SF, sign(width, result));
    flags.set(RFlags::PF, parity(result));
}

pub fn add_with_flags(flags: &mut RFlags, a: u64, b: u64, carry_in: bool, width: Width) -> u64 {
    let (a, b) = (width.truncate(a), width.truncate(b));
    let result = width.truncate(a.wrapping_add(b).wrapping_add(carry_in as u64));

    flags.set(RFlags::CF, carry_add(width, a, b, carry_in));
    flags.set(RFlags::OF, overflow_add(width, a, b, result));
    flags.set(RFlags::AF, adjust(a, b, result));
    set_szp(flags, width, result);
    result
}

pub fn sub_with_flags(flags: &mut RFlags, a: u64, b: u64, borrow_in: bool, width: Width) -> u64 {
    let (a, b) = (width.truncate(a), width.truncate(b));
    let result = width.truncate(a.wrapping_sub(b).wrapping_sub(borrow_in as u64));

    flags.set(RFlags::CF, carry_sub(width, a, b, borrow_in));
    flags.set(RFlags::OF, overflow_sub(width, a, b, result));
    flags.set(RFlags::AF, adjust(a, b, result));
    set_szp(flags, width, result);
    result
}

/// `and`/`or`/`xor`/`test`: CF and OF cleared, AF untouched.
pub fn logic_with_flags(flags: &mut RFlags, result: u64, width: Width) -> u64 {
    let result = width.truncate(result);
    flags.remove(RFlags::CF | RFlags::OF);
    set_szp(flags, width, result);
    result
}

/// `inc`: like `add a, 1` but CF is preserved.
pub fn inc_with_flags(flags: &mut RFlags, a: u64, width: Width) -> u64 {
    let cf = flags.contains(RFlags::CF);
    let result = add_with_flags(flags, a, 1, false, width);
    flags.set(RFlags::CF, cf);
    result
}

/// `dec`: like `sub a, 1` but CF is preserved.
pub fn dec_with_flags(flags: &mut RFlags, a: u64, width: Width) -> u64 {
    let cf = flags.contains(RFlags::CF);
    let result = sub_with_flags(flags, a, 1, false, width);
    flags.set(RFlags::CF, cf);
    result
}

/// `neg`: `0 - a`, with CF set unless the operand was zero.
pub fn neg_with_flags(flags: &mut RFlags, a: u64, width: Width) -> u64 {
    sub_with_flags(flags, 0, a, false, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_0x7f_byte() {
        let mut flags = RFlags::RESERVED1 | RFlags::CF;
        let r = inc_with_flags(&mut flags, 0x7f, Width::W8);
        assert_eq!(r, 0x80);
        assert!(flags.contains(RFlags::OF));
        assert!(flags.contains(RFlags::SF));
        assert!(!flags.contains(RFlags::ZF));
        assert!(flags.contains(RFlags::AF));
        assert!(!flags.contains(RFlags::PF));
        assert!(flags.contains(RFlags::CF), "inc preserves CF");
    }

    #[test]
    fn sbb_overflow_accounts_for_borrow() {
        let mut flags = RFlags::empty();
        // -128 - 127 - 1 = -256 wraps to 0.
        let r = sub_with_flags(&mut flags, 0x80, 0x7f, true, Width::W8);
        assert_eq!(r, 0);
        assert!(flags.contains(RFlags::OF));
        assert!(!flags.contains(RFlags::CF));
        assert!(flags.contains(RFlags::ZF));
    }

    #[test]
    fn adc_carry_at_each_width() {
        for width in [Width::W8, Width::W16, Width::W32, Width::W64] {
            let mut flags = RFlags::empty();
            let r = add_with_flags(&mut flags, width.mask(), 0, true, width);
            assert_eq!(r, 0, "{width:?}");
            assert!(flags.contains(RFlags::CF | RFlags::ZF | RFlags::AF));
            assert!(!flags.contains(RFlags::OF));
        }
    }

    #[test]
    fn logic_clears_cf_of_and_keeps_af() {
        let mut flags = RFlags::CF | RFlags::OF | RFlags::AF;
        let r = logic_with_flags(&mut flags, 0x1_0000_0000, Width::W32);
        assert_eq!(r, 0);
        assert_eq!(flags, RFlags::AF | RFlags::ZF | RFlags::PF);
    }

    #[test]
    fn neg_sets_carry_for_nonzero() {
        let mut flags = RFlags::empty();
        assert_eq!(neg_with_flags(&mut flags, 0, Width::W16), 0);
        assert!(!flags.contains(RFlags::CF));
        assert_eq!(neg_with_flags(&mut flags, 1, Width::W16), 0xffff);
        assert!(flags.contains(RFlags::CF));
        neg_with_flags(&mut flags, 0x8000, Width::W16);
        assert!(flags.contains(RFlags::OF));
    }
}
