#[cfg(test)]
mod __test__ {

  use crate::site::*;

  #[test]
  fn test_analyze_plain_text_has_one_fragment() {
    let analysis = analyze_format("no arguments here").unwrap();
    assert!(analysis.roles.is_empty());
    assert_eq!(analysis.fragments.len(), 1);
    assert_eq!(analysis.fragments[0].text, "no arguments here");
    assert!(!analysis.fragments[0].has_arg);
  }

  #[test]
  fn test_analyze_simple_specifiers() {
    let analysis = analyze_format("count %d of %u at %f").unwrap();
    assert_eq!(
      analysis.roles,
      vec![ParamRole::NonString, ParamRole::NonString, ParamRole::NonString]
    );
    assert_eq!(analysis.fragments.len(), 3);
    assert_eq!(analysis.fragments[0].text, "count %d");
    assert_eq!(analysis.fragments[1].text, " of %u");
    assert_eq!(analysis.fragments[2].text, " at %f");
  }

  #[test]
  fn test_analyze_string_roles() {
    let analysis = analyze_format("%s %.3s %.*s").unwrap();
    assert_eq!(
      analysis.roles,
      vec![
        ParamRole::StringNoPrecision,
        ParamRole::StringFixed(3),
        ParamRole::DynamicPrecision,
        ParamRole::StringDynamicPrecision,
      ]
    );
  }

  #[test]
  fn test_analyze_dynamic_width_and_precision() {
    // One specifier can consume three parameters.
    let analysis = analyze_format("Hello World %*.*s asdf").unwrap();
    assert_eq!(
      analysis.roles,
      vec![
        ParamRole::DynamicWidth,
        ParamRole::DynamicPrecision,
        ParamRole::StringDynamicPrecision,
      ]
    );
    assert_eq!(analysis.fragments.len(), 2);
    assert_eq!(analysis.fragments[0].text, "Hello World %*.*s");
    assert_eq!(analysis.fragments[1].text, " asdf");
  }

  #[test]
  fn test_analyze_literal_percent_stays_in_text() {
    let analysis = analyze_format("100%% done, %d left").unwrap();
    assert_eq!(analysis.roles, vec![ParamRole::NonString]);
    assert_eq!(analysis.fragments.len(), 1);
    assert_eq!(analysis.fragments[0].text, "100%% done, %d left");
  }

  #[test]
  fn test_analyze_flags_and_length_modifiers() {
    let analysis = analyze_format("%-08lld %#hx %05.2Lf").unwrap();
    assert_eq!(analysis.roles.len(), 3);
    assert!(analysis.roles.iter().all(|r| *r == ParamRole::NonString));
  }

  #[test]
  fn test_analyze_rejects_unterminated_specifier() {
    assert!(matches!(
      analyze_format("oops %0"),
      Err(FormatError::UnterminatedSpecifier)
    ));
  }

  #[test]
  fn test_analyze_rejects_unsupported_specifier() {
    assert!(matches!(
      analyze_format("%n"),
      Err(FormatError::UnsupportedSpecifier('n'))
    ));
  }

  #[test]
  fn test_arg_kinds_and_sizes() {
    assert_eq!(Arg::from(5u8).kind(), ParamKind::U8);
    assert_eq!(Arg::from(5i64).kind(), ParamKind::I64);
    assert_eq!(Arg::from(1.5f32).recorded_size(), 4);
    assert_eq!(Arg::from("abc").recorded_size(), 4 + 3);
    let wide: &[u16] = &[65, 66];
    assert_eq!(Arg::from(wide).recorded_size(), 4 + 4);
    assert_eq!(Arg::from('x').kind(), ParamKind::U32);

    let value = 7u64;
    assert_eq!(Arg::from(&value as *const u64).kind(), ParamKind::Ptr);
  }

  #[test]
  fn test_arg_record_into_layout() {
    let mut buf = [0u8; 16];
    let used = Arg::Str("hey").record_into(&mut buf);
    assert_eq!(used, 7);
    assert_eq!(&buf[..4], &3u32.to_le_bytes());
    assert_eq!(&buf[4..7], b"hey");

    let used = Arg::U32(0x01020304).record_into(&mut buf);
    assert_eq!(used, 4);
    assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
  }

  #[test]
  fn test_registration_assigns_dense_ids() {
    let registry = Registry::global();
    let a = registry.register(
      &SiteDescriptor {
        format: "alpha %d",
        file: "site_test.rs",
        line: 10,
        severity: Level::Notice,
      },
      &[ParamKind::I32],
    );
    let b = registry.register(
      &SiteDescriptor {
        format: "beta %s",
        file: "site_test.rs",
        line: 11,
        severity: Level::Debug,
      },
      &[ParamKind::Str],
    );

    assert!(a >= 1);
    assert_eq!(b, a + 1);

    let meta = registry.lookup(a).unwrap();
    assert_eq!(meta.format, "alpha %d");
    assert_eq!(meta.num_nibbles, 1);
    assert_eq!(meta.params.len(), 1);

    let meta = registry.lookup(b).unwrap();
    assert_eq!(meta.num_nibbles, 0);
    assert!(meta.params[0].role.is_string());
  }

  #[test]
  fn test_lookup_of_unknown_ids() {
    let registry = Registry::global();
    assert!(registry.lookup(0).is_none());
    assert!(registry.lookup(u32::MAX).is_none());
  }

  #[test]
  fn test_site_slot_registers_once() {
    static SLOT: SiteSlot = SiteSlot::new("slot %u", "site_test.rs", 42, Level::Warning);
    let args = [Arg::U32(9)];
    let first = SLOT.get_or_register(&args);
    let second = SLOT.get_or_register(&args);
    assert_ne!(first, 0);
    assert_eq!(first, second);
  }

  #[test]
  #[should_panic(expected = "does not match argument count")]
  fn test_registration_rejects_arity_mismatch() {
    Registry::global().register(
      &SiteDescriptor {
        format: "two %d %d",
        file: "site_test.rs",
        line: 50,
        severity: Level::Notice,
      },
      &[ParamKind::I32],
    );
  }

  #[test]
  #[should_panic(expected = "string argument for a scalar specifier")]
  fn test_registration_rejects_string_for_scalar() {
    Registry::global().register(
      &SiteDescriptor {
        format: "num %d",
        file: "site_test.rs",
        line: 60,
        severity: Level::Notice,
      },
      &[ParamKind::Str],
    );
  }

  #[test]
  fn test_nibble_count_spans_dynamic_parameters() {
    let id = Registry::global().register(
      &SiteDescriptor {
        format: "%*.*s and %d",
        file: "site_test.rs",
        line: 70,
        severity: Level::Notice,
      },
      &[ParamKind::I32, ParamKind::I32, ParamKind::Str, ParamKind::I64],
    );
    let meta = Registry::global().lookup(id).unwrap();
    // width + precision + the trailing %d; the string takes no nibble.
    assert_eq!(meta.num_nibbles, 3);
  }

  #[test]
  fn test_dictionary_serialization_round_trip_size() {
    let registry = Registry::global();
    let id = registry.register(
      &SiteDescriptor {
        format: "dict %s %d",
        file: "dict_test.rs",
        line: 5,
        severity: Level::Error,
      },
      &[ParamKind::Str, ParamKind::U32],
    );

    let mut out = Vec::new();
    let next = registry
      .serialize_dictionary(id, &mut out, usize::MAX)
      .unwrap();
    assert!(next > id);
    assert!(!out.is_empty());

    // FormatMetadata for this site: nibbles, fragments, level, line, name.
    assert_eq!(out[0], 1);
    assert_eq!(out[2], Level::Error as u8);
    let line = u32::from_le_bytes(out[3..7].try_into().unwrap());
    assert_eq!(line, 5);
    let name_len = u16::from_le_bytes(out[7..9].try_into().unwrap()) as usize;
    assert_eq!(&out[9..9 + name_len], b"dict_test.rs");
    assert_eq!(out[9 + name_len], 0);
  }

  #[test]
  fn test_dictionary_serialization_respects_limit() {
    let registry = Registry::global();
    let id = registry.register(
      &SiteDescriptor {
        format: "limited %d",
        file: "dict_test.rs",
        line: 6,
        severity: Level::Notice,
      },
      &[ParamKind::I32],
    );

    let mut out = Vec::new();
    assert_eq!(
      registry.serialize_dictionary(id, &mut out, 4),
      Err(WouldOverflow)
    );
    assert!(out.is_empty());
  }

  #[test]
  fn test_level_ordering_and_names() {
    assert!(Level::Error < Level::Notice);
    assert!(Level::Notice < Level::Debug);
    assert_eq!(Level::from_u8(3), Level::Notice);
    assert_eq!(Level::Warning.as_str(), "WARNING");
    assert_eq!(format!("{}", Level::Debug), "DEBUG");
  }
}
