#[cfg(test)]
mod __test__ {

  use crate::decoder::*;
  use crate::site::{Level, ParamKind};
  use crate::wire::{self, Checkpoint, FILE_MODE_ALIGNED, FILE_MODE_LZ4, FILE_MODE_RAW};

  fn entry(fragments: Vec<DictFragment>) -> DictEntry {
    DictEntry {
      num_nibbles: 0,
      level: Level::Notice,
      line: 1,
      file: "fmt_test.rs".into(),
      fragments,
    }
  }

  fn frag(text: &str, kind: Option<ParamKind>) -> DictFragment {
    DictFragment {
      text: text.into(),
      arg_kind: kind,
      has_dynamic_width: false,
      has_dynamic_precision: false,
    }
  }

  #[test]
  fn test_format_plain_text() {
    let entry = entry(vec![frag("just text, 100%% sure", None)]);
    assert_eq!(format_message(&entry, &[]), "just text, 100% sure");
  }

  #[test]
  fn test_format_decimal_variants() {
    let entry = entry(vec![
      frag("%d", Some(ParamKind::I32)),
      frag(" %05d", Some(ParamKind::I32)),
      frag(" %+d", Some(ParamKind::I32)),
      frag(" %-6d|", Some(ParamKind::I32)),
      frag(" %8.5d", Some(ParamKind::I64)),
    ]);
    let args = vec![
      DecodedArg::Signed(-7),
      DecodedArg::Signed(-7),
      DecodedArg::Signed(7),
      DecodedArg::Signed(7),
      DecodedArg::Signed(42),
    ];
    assert_eq!(
      format_message(&entry, &args),
      "-7 -0007 +7 7     |    00042"
    );
  }

  #[test]
  fn test_format_hex_octal_alternate() {
    let entry = entry(vec![
      frag("%x", Some(ParamKind::U32)),
      frag(" %#x", Some(ParamKind::U32)),
      frag(" %X", Some(ParamKind::U32)),
      frag(" %#o", Some(ParamKind::U32)),
    ]);
    let args = vec![
      DecodedArg::Unsigned(0xBEEF),
      DecodedArg::Unsigned(0xBEEF),
      DecodedArg::Unsigned(0xBEEF),
      DecodedArg::Unsigned(8),
    ];
    assert_eq!(format_message(&entry, &args), "beef 0xbeef BEEF 010");
  }

  #[test]
  fn test_format_floats() {
    let entry = entry(vec![
      frag("%f", Some(ParamKind::F64)),
      frag(" %.2f", Some(ParamKind::F64)),
      frag(" %8.1f|", Some(ParamKind::F32)),
    ]);
    let args = vec![
      DecodedArg::F64(1.5),
      DecodedArg::F64(2.71828),
      DecodedArg::F32(-0.5),
    ];
    assert_eq!(format_message(&entry, &args), "1.500000 2.72     -0.5|");
  }

  #[test]
  fn test_format_strings_and_chars() {
    let entry = entry(vec![
      frag("%s", Some(ParamKind::Str)),
      frag(" [%8s]", Some(ParamKind::Str)),
      frag(" [%-8s]", Some(ParamKind::Str)),
      frag(" %c", Some(ParamKind::U32)),
    ]);
    let args = vec![
      DecodedArg::Str("plain".into()),
      DecodedArg::Str("right".into()),
      DecodedArg::Str("left".into()),
      DecodedArg::Unsigned('!' as u64),
    ];
    assert_eq!(
      format_message(&entry, &args),
      "plain [   right] [left    ] !"
    );
  }

  #[test]
  fn test_format_pointer() {
    let entry = entry(vec![frag("%p", Some(ParamKind::Ptr))]);
    let args = vec![DecodedArg::Ptr(0xDEAD_BEEF)];
    assert_eq!(format_message(&entry, &args), "0xdeadbeef");
  }

  #[test]
  fn test_format_dynamic_width() {
    let mut wide = frag("%*d", Some(ParamKind::I32));
    wide.has_dynamic_width = true;
    let entry = entry(vec![wide]);
    let args = vec![DecodedArg::Signed(6), DecodedArg::Signed(99)];
    assert_eq!(format_message(&entry, &args), "    99");

    // Negative dynamic width left-justifies.
    let mut wide = frag("%*d|", Some(ParamKind::I32));
    wide.has_dynamic_width = true;
    let entry2 = DictEntry {
      num_nibbles: 0,
      level: Level::Notice,
      line: 1,
      file: "fmt_test.rs".into(),
      fragments: vec![wide],
    };
    let args = vec![DecodedArg::Signed(-6), DecodedArg::Signed(99)];
    assert_eq!(format_message(&entry2, &args), "99    |");
  }

  #[test]
  fn test_empty_image_is_malformed() {
    assert!(matches!(
      Decoder::from_file_image(Vec::new()),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_unknown_mode_byte_is_malformed() {
    assert!(matches!(
      Decoder::from_file_image(vec![9]),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_empty_stream_reaches_clean_eof() {
    let mut decoder = Decoder::from_file_image(vec![FILE_MODE_RAW]).unwrap();
    assert!(decoder.next_record().unwrap().is_none());
  }

  #[test]
  fn test_pad_bytes_are_skipped() {
    let mut image = vec![FILE_MODE_RAW];
    let checkpoint = Checkpoint {
      rdtsc: 100,
      unix_time: 1_700_000_000,
      cycles_per_second: 1e9,
      relative_pointer: 0,
    };
    let mut body = Vec::new();
    checkpoint.encode(&mut body, false);
    body.extend_from_slice(&[0u8; 512]);
    image.extend_from_slice(&body);

    let mut decoder = Decoder::from_file_image(image).unwrap();
    assert!(decoder.next_record().unwrap().is_none());
  }

  #[test]
  fn test_record_before_checkpoint_is_malformed() {
    let mut image = vec![FILE_MODE_RAW];
    image.push(wire::log_header_byte(0, 0));
    image.extend_from_slice(&[1, 1]);

    let mut decoder = Decoder::from_file_image(image).unwrap();
    assert!(matches!(
      decoder.next_record(),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_long_garbage_run_aborts() {
    let mut image = vec![FILE_MODE_RAW];
    // Tag bytes with entry type zero but nonzero payload bits.
    image.extend(std::iter::repeat(0b1000_0100u8).take(100));

    let mut decoder = Decoder::from_file_image(image).unwrap();
    assert!(matches!(
      decoder.next_record(),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_truncated_checkpoint_is_malformed() {
    let mut image = vec![FILE_MODE_RAW];
    image.push(wire::ENTRY_CHECKPOINT);
    image.extend_from_slice(&[0u8; 8]);

    let mut decoder = Decoder::from_file_image(image).unwrap();
    assert!(matches!(
      decoder.next_record(),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_lz4_frames_match_raw_stream() {
    let checkpoint = Checkpoint {
      rdtsc: 100,
      unix_time: 1_700_000_000,
      cycles_per_second: 1e9,
      relative_pointer: 0,
    };
    let mut body = Vec::new();
    checkpoint.encode(&mut body, false);
    wire::encode_buffer_change(&mut body, 3, true);

    let compressed = lz4::block::compress(&body, None, true).unwrap();
    let mut image = vec![FILE_MODE_LZ4];
    image.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    image.extend_from_slice(&compressed);

    let mut decoder = Decoder::from_file_image(image).unwrap();
    // Only a checkpoint and a marker: clean EOF, no records.
    assert!(decoder.next_record().unwrap().is_none());
  }

  #[test]
  fn test_aligned_lz4_frames_skip_inter_frame_padding() {
    let checkpoint = Checkpoint {
      rdtsc: 100,
      unix_time: 1_700_000_000,
      cycles_per_second: 1e9,
      relative_pointer: 0,
    };
    let mut part_one = Vec::new();
    checkpoint.encode(&mut part_one, false);
    let mut part_two = Vec::new();
    wire::encode_buffer_change(&mut part_two, 3, true);

    // Two frames, each padded to the write alignment like the file
    // writer does in direct-I/O mode.
    let mut image = vec![FILE_MODE_LZ4 | FILE_MODE_ALIGNED];
    for part in [part_one, part_two] {
      let compressed = lz4::block::compress(&part, None, true).unwrap();
      image.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
      image.extend_from_slice(&compressed);
      let over = image.len() % wire::WRITE_ALIGNMENT;
      if over != 0 {
        image.resize(image.len() + wire::WRITE_ALIGNMENT - over, 0);
      }
    }
    assert!(image.len() > wire::WRITE_ALIGNMENT);

    let mut decoder = Decoder::from_file_image(image).unwrap();
    // Both frames parsed: a checkpoint and a marker, then clean EOF.
    assert!(decoder.next_record().unwrap().is_none());
  }

  #[test]
  fn test_garbage_inside_alignment_padding_is_malformed() {
    let checkpoint = Checkpoint {
      rdtsc: 100,
      unix_time: 1_700_000_000,
      cycles_per_second: 1e9,
      relative_pointer: 0,
    };
    let mut part = Vec::new();
    checkpoint.encode(&mut part, false);

    let mut image = vec![FILE_MODE_LZ4 | FILE_MODE_ALIGNED];
    let compressed = lz4::block::compress(&part, None, true).unwrap();
    image.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    image.extend_from_slice(&compressed);
    image.resize(image.len() + 10, 0);
    // A stray nonzero byte where only padding may appear.
    let at = image.len() - 3;
    image[at] = 0x5A;
    image.resize(image.len().next_multiple_of(wire::WRITE_ALIGNMENT), 0);
    image.extend_from_slice(&[9, 9, 9, 9]);

    assert!(matches!(
      Decoder::from_file_image(image),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn test_truncated_lz4_frame_is_malformed() {
    let image = vec![FILE_MODE_LZ4, 50, 0, 0, 0, 1, 2, 3];
    assert!(matches!(
      Decoder::from_file_image(image),
      Err(DecodeError::Malformed(_))
    ));
  }
}
