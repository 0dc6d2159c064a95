//! Variable-byte packing of log arguments.
//!
//! Every non-string argument is stored in the smallest number of bytes that
//! can represent it, together with a 4-bit pack code that tells the decoder
//! how many bytes to read back:
//!
//! - `0`: the value is zero and occupies no bytes.
//! - `1..=8`: that many little-endian bytes, zero-extended on decode.
//! - `9..=15`: `code - 8` bytes holding the magnitude of a negated signed
//!   value. Negating an 8-byte value saves nothing, so code 16 never exists.
//!
//! Floats are stored bit-exact at their native width. Pack codes are stored
//! two per byte in a nibble table that prefixes the packed arguments.

mod __test__;

/// Number of bytes needed to hold `val` without leading zero bytes.
#[inline]
pub fn byte_width(val: u64) -> usize {
  ((64 - val.leading_zeros() as usize) + 7) / 8
}

/// Packs an unsigned value, returning its pack code.
#[inline]
pub fn pack_u64(out: &mut Vec<u8>, val: u64) -> u8 {
  let n = byte_width(val);
  out.extend_from_slice(&val.to_le_bytes()[..n]);
  n as u8
}

/// An `i8` never shrinks; it is stored as a single byte.
#[inline]
pub fn pack_i8(out: &mut Vec<u8>, val: i8) -> u8 {
  out.push(val as u8);
  1
}

#[inline]
pub fn pack_i16(out: &mut Vec<u8>, val: i16) -> u8 {
  if val >= 0 || val <= -(1 << 8) {
    pack_u64(out, val as u16 as u64)
  } else {
    8 + pack_u64(out, -(val as i64) as u64)
  }
}

#[inline]
pub fn pack_i32(out: &mut Vec<u8>, val: i32) -> u8 {
  if val >= 0 || val <= -(1 << 24) {
    pack_u64(out, val as u32 as u64)
  } else {
    8 + pack_u64(out, -(val as i64) as u64)
  }
}

/// Packs a signed value. Values negative enough to need the full width are
/// stored as their unsigned reinterpretation instead of being negated.
#[inline]
pub fn pack_i64(out: &mut Vec<u8>, val: i64) -> u8 {
  if val >= 0 || val <= -(1 << 56) {
    pack_u64(out, val as u64)
  } else {
    8 + pack_u64(out, val.unsigned_abs())
  }
}

/// Floats are stored bit-exact; the code is simply the byte width.
#[inline]
pub fn pack_f32(out: &mut Vec<u8>, val: f32) -> u8 {
  out.extend_from_slice(&val.to_le_bytes());
  4
}

#[inline]
pub fn pack_f64(out: &mut Vec<u8>, val: f64) -> u8 {
  out.extend_from_slice(&val.to_le_bytes());
  8
}

/// Reads back the raw magnitude of a packed value, zero-extended. The caller
/// applies signed reinterpretation; see [`unpack_i64`].
#[inline]
pub fn unpack_u64(input: &mut &[u8], code: u8) -> Option<u64> {
  if code == 0 {
    return Some(0);
  }
  let n = if code <= 8 { code } else { code - 8 } as usize;
  if input.len() < n {
    return None;
  }
  let mut bytes = [0u8; 8];
  bytes[..n].copy_from_slice(&input[..n]);
  *input = &input[n..];
  Some(u64::from_le_bytes(bytes))
}

/// Decodes a signed value packed by one of the `pack_i*` functions.
///
/// `width` is the byte width of the original integer type; it decides how
/// far to sign-extend values that took the unsigned path.
#[inline]
pub fn unpack_i64(input: &mut &[u8], code: u8, width: usize) -> Option<i64> {
  let magnitude = unpack_u64(input, code)?;
  if code > 8 {
    return Some((magnitude as i64).wrapping_neg());
  }
  // Unsigned path: truncate to the original width, then sign-extend.
  let shift = 64 - 8 * width as u32;
  Some(((magnitude << shift) as i64) >> shift)
}

#[inline]
pub fn unpack_f32(input: &mut &[u8], code: u8) -> Option<f32> {
  if code == 0 {
    return Some(0.0);
  }
  if code != 4 || input.len() < 4 {
    return None;
  }
  let bytes: [u8; 4] = input[..4].try_into().ok()?;
  *input = &input[4..];
  Some(f32::from_le_bytes(bytes))
}

#[inline]
pub fn unpack_f64(input: &mut &[u8], code: u8) -> Option<f64> {
  if code == 0 {
    return Some(0.0);
  }
  if code != 8 || input.len() < 8 {
    return None;
  }
  let bytes: [u8; 8] = input[..8].try_into().ok()?;
  *input = &input[8..];
  Some(f64::from_le_bytes(bytes))
}

/// Bytes needed for a nibble table covering `num_nibbles` pack codes.
#[inline]
pub fn nibble_table_len(num_nibbles: usize) -> usize {
  num_nibbles.div_ceil(2)
}

/// Stores pack code `code` in slot `idx`. Even slots use the low nibble.
#[inline]
pub fn set_nibble(table: &mut [u8], idx: usize, code: u8) {
  debug_assert!(code < 16);
  let byte = &mut table[idx / 2];
  if idx % 2 == 0 {
    *byte = (*byte & 0xF0) | code;
  } else {
    *byte = (*byte & 0x0F) | (code << 4);
  }
}

#[inline]
pub fn get_nibble(table: &[u8], idx: usize) -> u8 {
  let byte = table[idx / 2];
  if idx % 2 == 0 {
    byte & 0x0F
  } else {
    byte >> 4
  }
}
