#[cfg(test)]
mod __test__ {

  use crate::packer::*;

  fn round_trip_u64(val: u64) -> (u64, usize, u8) {
    let mut buf = Vec::new();
    let code = pack_u64(&mut buf, val);
    let len = buf.len();
    let mut input = buf.as_slice();
    let decoded = unpack_u64(&mut input, code).unwrap();
    assert!(input.is_empty());
    (decoded, len, code)
  }

  #[test]
  fn test_zero_packs_to_nothing() {
    let (decoded, len, code) = round_trip_u64(0);
    assert_eq!(decoded, 0);
    assert_eq!(len, 0);
    assert_eq!(code, 0);
  }

  #[test]
  fn test_unsigned_round_trip() {
    for val in [
      1u64,
      0xFF,
      0x100,
      0xFFFF,
      0x10000,
      0xFFFFFF,
      0x1234_5678,
      0xFF_FFFF_FFFF,
      u64::MAX,
    ] {
      let (decoded, _, _) = round_trip_u64(val);
      assert_eq!(decoded, val);
    }
  }

  #[test]
  fn test_unsigned_minimality() {
    // byte_count(encode(v)) == ceil(log2(v + 1) / 8)
    for shift in 0..64u32 {
      let val = 1u64 << shift;
      let (_, len, code) = round_trip_u64(val);
      let expected = (shift as usize / 8) + 1;
      assert_eq!(len, expected, "value {val:#x}");
      assert_eq!(code as usize, expected);
    }
  }

  #[test]
  fn test_spot_check_six_byte_value() {
    let mut buf = Vec::new();
    let code = pack_u64(&mut buf, 0xF234_5678_9012);
    assert_eq!(code, 6);
    assert_eq!(buf, [0x12, 0x90, 0x78, 0x56, 0x34, 0xF2]);

    let mut input = buf.as_slice();
    assert_eq!(unpack_u64(&mut input, code), Some(0xF234_5678_9012));
  }

  #[test]
  fn test_signed_positive_behaves_like_unsigned() {
    let mut buf = Vec::new();
    let code = pack_i64(&mut buf, 300);
    assert_eq!(code, 2);
    let mut input = buf.as_slice();
    assert_eq!(unpack_i64(&mut input, code, 8), Some(300));
  }

  #[test]
  fn test_signed_negation_saves_space() {
    let mut buf = Vec::new();
    let code = pack_i64(&mut buf, -2);
    // Magnitude 2 fits one byte; the high nibble bit marks negation.
    assert_eq!(code, 9);
    assert_eq!(buf, [2]);
    let mut input = buf.as_slice();
    assert_eq!(unpack_i64(&mut input, code, 8), Some(-2));
  }

  #[test]
  fn test_signed_full_width_negative_goes_unsigned() {
    // -(1 << 56) and below keep their two's-complement representation.
    for val in [-(1i64 << 56), i64::MIN, -(1i64 << 60)] {
      let mut buf = Vec::new();
      let code = pack_i64(&mut buf, val);
      assert_eq!(code, 8);
      let mut input = buf.as_slice();
      assert_eq!(unpack_i64(&mut input, code, 8), Some(val));
    }
  }

  #[test]
  fn test_signed_round_trip_sweep() {
    for val in [
      0i64,
      1,
      -1,
      127,
      -128,
      255,
      -255,
      -256,
      65535,
      -65536,
      i64::MAX,
      i64::MIN,
      -(1i64 << 55),
      -(1i64 << 56) + 1,
    ] {
      let mut buf = Vec::new();
      let code = pack_i64(&mut buf, val);
      let mut input = buf.as_slice();
      assert_eq!(unpack_i64(&mut input, code, 8), Some(val), "value {val}");
    }
  }

  #[test]
  fn test_i32_round_trip() {
    for val in [0i32, 5, -5, i32::MIN, i32::MAX, -(1 << 24), -(1 << 24) + 1] {
      let mut buf = Vec::new();
      let code = pack_i32(&mut buf, val);
      let mut input = buf.as_slice();
      assert_eq!(
        unpack_i64(&mut input, code, 4),
        Some(val as i64),
        "value {val}"
      );
    }
  }

  #[test]
  fn test_i16_round_trip() {
    for val in [0i16, 42, -42, i16::MIN, i16::MAX, -256, -255] {
      let mut buf = Vec::new();
      let code = pack_i16(&mut buf, val);
      let mut input = buf.as_slice();
      assert_eq!(
        unpack_i64(&mut input, code, 2),
        Some(val as i64),
        "value {val}"
      );
    }
  }

  #[test]
  fn test_i8_is_always_one_byte() {
    for val in [0i8, 1, -1, i8::MIN, i8::MAX] {
      let mut buf = Vec::new();
      let code = pack_i8(&mut buf, val);
      assert_eq!(code, 1);
      assert_eq!(buf.len(), 1);
      let mut input = buf.as_slice();
      assert_eq!(unpack_i64(&mut input, code, 1), Some(val as i64));
    }
  }

  #[test]
  fn test_floats_are_bit_exact() {
    for val in [0.5f64, -1234.25, f64::MIN_POSITIVE, f64::NAN, f64::INFINITY] {
      let mut buf = Vec::new();
      let code = pack_f64(&mut buf, val);
      assert_eq!(code, 8);
      let mut input = buf.as_slice();
      let decoded = unpack_f64(&mut input, code).unwrap();
      assert_eq!(decoded.to_bits(), val.to_bits());
    }

    let mut buf = Vec::new();
    let code = pack_f32(&mut buf, -0.125f32);
    assert_eq!(code, 4);
    let mut input = buf.as_slice();
    assert_eq!(unpack_f32(&mut input, code), Some(-0.125f32));
  }

  #[test]
  fn test_unpack_rejects_truncated_input() {
    let buf = [0x12u8, 0x34];
    let mut input = &buf[..];
    assert_eq!(unpack_u64(&mut input, 4), None);
  }

  #[test]
  fn test_nibble_table() {
    assert_eq!(nibble_table_len(0), 0);
    assert_eq!(nibble_table_len(1), 1);
    assert_eq!(nibble_table_len(2), 1);
    assert_eq!(nibble_table_len(3), 2);

    let mut table = [0u8; 3];
    for (idx, code) in [3u8, 9, 0, 15, 7].iter().enumerate() {
      set_nibble(&mut table, idx, *code);
    }
    for (idx, code) in [3u8, 9, 0, 15, 7].iter().enumerate() {
      assert_eq!(get_nibble(&table, idx), *code);
    }
    // Even slot lives in the low nibble.
    assert_eq!(table[0] & 0x0F, 3);
    assert_eq!(table[0] >> 4, 9);
  }
}
