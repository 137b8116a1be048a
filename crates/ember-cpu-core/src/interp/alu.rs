//! Flag-producing arithmetic. Flags an instruction leaves undefined are not
//! touched.

use ember_x86::{ShiftOp, Width};

use crate::state::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

#[inline]
fn set(flags: &mut u32, mask: u32, value: bool) {
    if value {
        *flags |= mask;
    } else {
        *flags &= !mask;
    }
}

pub(crate) fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// ZF, SF and PF from a masked result.
#[inline]
fn set_szp(flags: &mut u32, result: u32, width: Width) {
    set(flags, FLAG_ZF, result == 0);
    set(flags, FLAG_SF, result & width.sign_bit() != 0);
    set(flags, FLAG_PF, parity(result as u8));
}

pub(crate) fn add_with_flags(flags: &mut u32, dest: u32, src: u32, carry_in: bool, width: Width) -> u32 {
    let mask = width.mask();
    let dest = dest & mask;
    let src = src & mask;
    let full = u64::from(dest) + u64::from(src) + u64::from(carry_in);
    let result = full as u32 & mask;

    set(flags, FLAG_CF, full > u64::from(mask));
    set(flags, FLAG_OF, (dest ^ result) & (src ^ result) & width.sign_bit() != 0);
    set(flags, FLAG_AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, width);
    result
}

pub(crate) fn sub_with_flags(flags: &mut u32, dest: u32, src: u32, borrow_in: bool, width: Width) -> u32 {
    let mask = width.mask();
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = u64::from(src) + u64::from(borrow_in);
    let result = u64::from(dest).wrapping_sub(subtrahend) as u32 & mask;

    set(flags, FLAG_CF, u64::from(dest) < subtrahend);
    set(flags, FLAG_OF, (dest ^ src) & (dest ^ result) & width.sign_bit() != 0);
    set(flags, FLAG_AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, width);
    result
}

/// AND/OR/XOR/TEST: CF and OF cleared, AF undefined.
pub(crate) fn logic_with_flags(flags: &mut u32, result: u32, width: Width) -> u32 {
    let result = result & width.mask();
    *flags &= !(FLAG_CF | FLAG_OF);
    set_szp(flags, result, width);
    result
}

/// INC/DEC leave CF alone.
pub(crate) fn inc_dec_with_flags(flags: &mut u32, value: u32, inc: bool, width: Width) -> u32 {
    let cf = *flags & FLAG_CF;
    let result = if inc {
        add_with_flags(flags, value, 1, false, width)
    } else {
        sub_with_flags(flags, value, 1, false, width)
    };
    *flags = (*flags & !FLAG_CF) | cf;
    result
}

/// Shifts and rotates. `count` is the raw count operand; it is masked to
/// five bits, and a zero count changes nothing (flags included).
pub(crate) fn shift_with_flags(flags: &mut u32, op: ShiftOp, value: u32, count: u32, width: Width) -> u32 {
    let count = count & 0x1f;
    let bits = width.bits();
    let mask = width.mask();
    let value = value & mask;
    let msb = |v: u32| v & width.sign_bit() != 0;
    if count == 0 {
        return value;
    }

    match op {
        ShiftOp::Rol => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                ((value << n) | (value >> (bits - n))) & mask
            };
            let cf = result & 1 != 0;
            set(flags, FLAG_CF, cf);
            if count == 1 {
                set(flags, FLAG_OF, msb(result) ^ cf);
            }
            result
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                ((value >> n) | (value << (bits - n))) & mask
            };
            set(flags, FLAG_CF, msb(result));
            if count == 1 {
                set(flags, FLAG_OF, msb(result) ^ (result & (width.sign_bit() >> 1) != 0));
            }
            result
        }
        ShiftOp::Rcl | ShiftOp::Rcr => {
            // Rotate through a (bits + 1)-wide value with CF as the top bit.
            let n = u64::from(count % (bits + 1));
            let span = u64::from(bits) + 1;
            let wide_mask = (1u64 << span) - 1;
            let wide = u64::from(value) | (u64::from(*flags & FLAG_CF != 0) << bits);
            let rotated = if n == 0 {
                wide
            } else if op == ShiftOp::Rcl {
                ((wide << n) | (wide >> (span - n))) & wide_mask
            } else {
                ((wide >> n) | (wide << (span - n))) & wide_mask
            };
            let result = rotated as u32 & mask;
            let cf = rotated >> bits & 1 != 0;
            set(flags, FLAG_CF, cf);
            if count == 1 {
                let of = if op == ShiftOp::Rcl {
                    msb(result) ^ cf
                } else {
                    msb(result) ^ (result & (width.sign_bit() >> 1) != 0)
                };
                set(flags, FLAG_OF, of);
            }
            result
        }
        ShiftOp::Shl => {
            let wide = u64::from(value) << count;
            let result = wide as u32 & mask;
            let cf = wide >> bits & 1 != 0;
            set(flags, FLAG_CF, cf);
            if count == 1 {
                set(flags, FLAG_OF, msb(result) ^ cf);
            }
            set_szp(flags, result, width);
            result
        }
        ShiftOp::Shr => {
            let result = value >> count;
            set(flags, FLAG_CF, value >> (count - 1) & 1 != 0);
            if count == 1 {
                set(flags, FLAG_OF, msb(value));
            }
            set_szp(flags, result, width);
            result
        }
        ShiftOp::Sar => {
            let signed = width.sign_extend(value) as i32;
            let result = (signed >> count) as u32 & mask;
            set(flags, FLAG_CF, (signed >> (count - 1)) & 1 != 0);
            if count == 1 {
                set(flags, FLAG_OF, false);
            }
            set_szp(flags, result, width);
            result
        }
    }
}

/// SHLD (`left`) / SHRD. Counts above 16 on a word operand shift through a
/// `dest:src:dest` pattern.
pub(crate) fn double_shift_with_flags(
    flags: &mut u32,
    left: bool,
    dest: u32,
    src: u32,
    count: u32,
    width: Width,
) -> u32 {
    let count = count & 0x1f;
    let mask = width.mask();
    let dest = dest & mask;
    let src = src & mask;
    if count == 0 {
        return dest;
    }
    let (result, cf) = match (width, left) {
        (Width::Word, true) => {
            let wide = (u64::from(dest) << 32) | (u64::from(src) << 16) | u64::from(dest);
            let result = ((wide << count) >> 32) as u32 & mask;
            (result, (wide >> (48 - count)) & 1 != 0)
        }
        (Width::Word, false) => {
            let wide = (u64::from(dest) << 32) | (u64::from(src) << 16) | u64::from(dest);
            let result = (wide >> count) as u32 & mask;
            (result, (wide >> (count - 1)) & 1 != 0)
        }
        (_, true) => {
            let wide = (u64::from(dest) << 32) | u64::from(src);
            let result = ((wide << count) >> 32) as u32;
            (result, (dest >> (32 - count)) & 1 != 0)
        }
        (_, false) => {
            let wide = (u64::from(src) << 32) | u64::from(dest);
            let result = (wide >> count) as u32;
            (result, (dest >> (count - 1)) & 1 != 0)
        }
    };
    set(flags, FLAG_CF, cf);
    if count == 1 {
        set(flags, FLAG_OF, (result ^ dest) & width.sign_bit() != 0);
    }
    set_szp(flags, result, width);
    result
}

/// Unsigned multiply of the accumulator. Returns (low, high); CF and OF are
/// set when the high half is significant.
pub(crate) fn mul_with_flags(flags: &mut u32, a: u32, b: u32, width: Width) -> (u32, u32) {
    let bits = width.bits();
    let product = u64::from(a & width.mask()) * u64::from(b & width.mask());
    let lo = product as u32 & width.mask();
    let hi = (product >> bits) as u32 & width.mask();
    set(flags, FLAG_CF | FLAG_OF, hi != 0);
    (lo, hi)
}

/// Signed multiply. CF and OF are set when the product does not fit in
/// `width`.
pub(crate) fn imul_with_flags(flags: &mut u32, a: u32, b: u32, width: Width) -> (u32, u32) {
    let bits = width.bits();
    let product = i64::from(width.sign_extend(a) as i32) * i64::from(width.sign_extend(b) as i32);
    let lo = product as u32 & width.mask();
    let hi = (product >> bits) as u32 & width.mask();
    let fits = i64::from(width.sign_extend(lo) as i32) == product;
    set(flags, FLAG_CF | FLAG_OF, !fits);
    (lo, hi)
}

/// Unsigned divide of `hi:lo` by `divisor`; `None` on #DE.
pub(crate) fn div(lo: u32, hi: u32, divisor: u32, width: Width) -> Option<(u32, u32)> {
    let bits = width.bits();
    let divisor = u64::from(divisor & width.mask());
    if divisor == 0 {
        return None;
    }
    let dividend = (u64::from(hi & width.mask()) << bits) | u64::from(lo & width.mask());
    let quotient = dividend / divisor;
    if quotient > u64::from(width.mask()) {
        return None;
    }
    Some((quotient as u32, (dividend % divisor) as u32))
}

/// Signed divide; `None` on #DE (zero divisor or quotient overflow).
pub(crate) fn idiv(lo: u32, hi: u32, divisor: u32, width: Width) -> Option<(u32, u32)> {
    let bits = width.bits();
    let divisor = i64::from(width.sign_extend(divisor) as i32);
    if divisor == 0 {
        return None;
    }
    let raw = (u64::from(hi & width.mask()) << bits) | u64::from(lo & width.mask());
    // Sign-extend the 2*bits-wide dividend.
    let shift = 64 - 2 * bits;
    let dividend = ((raw << shift) as i64) >> shift;
    let quotient = dividend.checked_div(divisor)?;
    let remainder = dividend.checked_rem(divisor)?;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if quotient < min || quotient > max {
        return None;
    }
    Some((quotient as u32 & width.mask(), remainder as u32 & width.mask()))
}

/// DAA / DAS on AL.
pub(crate) fn decimal_adjust(flags: &mut u32, al: u8, subtract: bool) -> u8 {
    let old_al = al;
    let old_cf = *flags & FLAG_CF != 0;
    let mut al = al;
    let mut cf = false;
    let af = (al & 0x0f) > 9 || *flags & FLAG_AF != 0;
    if af {
        if subtract {
            cf = old_cf || al < 6;
            al = al.wrapping_sub(6);
        } else {
            cf = old_cf || al > 0xf9;
            al = al.wrapping_add(6);
        }
    }
    if old_al > 0x99 || old_cf {
        al = if subtract {
            al.wrapping_sub(0x60)
        } else {
            al.wrapping_add(0x60)
        };
        cf = true;
    }
    set(flags, FLAG_AF, af);
    set(flags, FLAG_CF, cf);
    set_szp(flags, u32::from(al), Width::Byte);
    al
}

/// AAA / AAS on AX.
pub(crate) fn ascii_adjust(flags: &mut u32, ax: u16, subtract: bool) -> u16 {
    let al = ax as u8;
    let ah = (ax >> 8) as u8;
    let adjust = (al & 0x0f) > 9 || *flags & FLAG_AF != 0;
    let (al, ah) = if !adjust {
        (al, ah)
    } else if subtract {
        (al.wrapping_sub(6), ah.wrapping_sub(1))
    } else {
        (al.wrapping_add(6), ah.wrapping_add(1))
    };
    set(flags, FLAG_AF | FLAG_CF, adjust);
    u16::from(al & 0x0f) | (u16::from(ah) << 8)
}

/// AAM; `None` on #DE for a zero base.
pub(crate) fn aam(flags: &mut u32, al: u8, base: u8) -> Option<u16> {
    if base == 0 {
        return None;
    }
    let ah = al / base;
    let al = al % base;
    set_szp(flags, u32::from(al), Width::Byte);
    Some(u16::from(al) | (u16::from(ah) << 8))
}

pub(crate) fn aad(flags: &mut u32, ax: u16, base: u8) -> u16 {
    let al = (ax as u8).wrapping_add(((ax >> 8) as u8).wrapping_mul(base));
    set_szp(flags, u32::from(al), Width::Byte);
    u16::from(al)
}
