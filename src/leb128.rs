use crate::error::Error::*;
use crate::error::*;

/// Checked unsigned LEB128 read of at most `bits` significant bits. Used by the
/// decoder and validator on untrusted bytes.
#[inline]
pub fn safe_read_leb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<u64> {
    let max_bytes = (bits as usize).div_ceil(7);
    let mut result: u64 = 0;
    let mut end = *pc;
    for i in 0..max_bytes {
        let byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        let payload = (byte & 0x7f) as u64;
        if i == max_bytes - 1 {
            if byte & 0x80 != 0 { return Err(Malformed(INT_TOO_LONG)); }
            let used = bits as usize - 7 * i;
            if used < 7 && payload >> used != 0 { return Err(Malformed(INT_TOO_LARGE)); }
        }
        result |= payload << (7 * i);
        if byte & 0x80 == 0 { break; }
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

/// Checked signed LEB128 read of at most `bits` significant bits (32, 33 or 64).
#[inline]
pub fn safe_read_sleb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<i64> {
    let max_bytes = (bits as usize).div_ceil(7);
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    let mut byte: u8 = 0;
    for i in 0..max_bytes {
        byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        let payload = byte & 0x7f;
        if i == max_bytes - 1 {
            if byte & 0x80 != 0 { return Err(Malformed(INT_TOO_LONG)); }
            // The unused high bits of the last byte must repeat the sign bit.
            let used = bits as u32 - 7 * i as u32;
            if used < 7 {
                let rest = payload >> (used - 1);
                if rest != 0 && rest != (0x7f >> (used - 1)) { return Err(Malformed(INT_TOO_LARGE)); }
            }
        }
        result |= ((payload as u64) << shift) as i64;
        shift += 7;
        if byte & 0x80 == 0 { break; }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= !0i64 << shift;
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

// The readers below run on bodies that already went through the validator, so
// every encoding is known to be well formed and in bounds.

#[inline(always)]
pub fn read_leb128(bytes: &[u8], pc: &mut usize) -> u32 {
    let mut result: u32 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = bytes[*pc];
        *pc += 1;
        result |= ((byte & 0x7f) as u32).wrapping_shl(shift);
        if byte & 0x80 == 0 { return result; }
        shift += 7;
    }
}

#[inline(always)]
pub fn read_sleb128_i64(bytes: &[u8], pc: &mut usize) -> i64 {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut byte: u8;
    loop {
        byte = bytes[*pc];
        *pc += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as i64).wrapping_shl(shift);
        }
        shift += 7;
        if byte & 0x80 == 0 { break; }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= !0i64 << shift;
    }
    result
}

#[inline(always)]
pub fn read_sleb128_i32(bytes: &[u8], pc: &mut usize) -> i32 {
    read_sleb128_i64(bytes, pc) as i32
}

#[inline(always)]
pub fn read_u32_le(bytes: &[u8], pc: &mut usize) -> u32 {
    let v = u32::from_le_bytes([bytes[*pc], bytes[*pc + 1], bytes[*pc + 2], bytes[*pc + 3]]);
    *pc += 4;
    v
}

#[inline(always)]
pub fn read_u64_le(bytes: &[u8], pc: &mut usize) -> u64 {
    let lo = read_u32_le(bytes, pc) as u64;
    let hi = read_u32_le(bytes, pc) as u64;
    lo | (hi << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_roundtrips_small_values() {
        let mut pc = 0;
        assert_eq!(safe_read_leb128::<u32>(&[0xe5, 0x8e, 0x26], &mut pc, 32), Ok(624485));
        assert_eq!(pc, 3);
    }

    #[test]
    fn unsigned_rejects_overlong_encoding() {
        let mut pc = 0;
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
        assert_eq!(safe_read_leb128::<u32>(&bytes, &mut pc, 32), Err(Malformed(INT_TOO_LONG)));
    }

    #[test]
    fn unsigned_rejects_unused_high_bits() {
        let mut pc = 0;
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x1f];
        assert_eq!(safe_read_leb128::<u32>(&bytes, &mut pc, 32), Err(Malformed(INT_TOO_LARGE)));
        let mut pc = 0;
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(safe_read_leb128::<u32>(&bytes, &mut pc, 32), Ok(u32::MAX));
    }

    #[test]
    fn signed_sign_extends() {
        let mut pc = 0;
        assert_eq!(safe_read_sleb128::<i32>(&[0x7f], &mut pc, 32), Ok(-1));
        let mut pc = 0;
        assert_eq!(safe_read_sleb128::<i64>(&[0xc0, 0xbb, 0x78], &mut pc, 64), Ok(-123456));
        let mut pc = 0;
        assert_eq!(read_sleb128_i64(&[0xc0, 0xbb, 0x78], &mut pc), -123456);
    }

    #[test]
    fn signed_rejects_bad_padding() {
        let mut pc = 0;
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x4f];
        assert_eq!(safe_read_sleb128::<i32>(&bytes, &mut pc, 32), Err(Malformed(INT_TOO_LARGE)));
        let mut pc = 0;
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x7f];
        assert_eq!(safe_read_sleb128::<i32>(&bytes, &mut pc, 32), Ok(-1));
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut pc = 0;
        assert_eq!(safe_read_leb128::<u32>(&[0x80], &mut pc, 32), Err(Malformed(UNEXPECTED_END)));
    }
}
