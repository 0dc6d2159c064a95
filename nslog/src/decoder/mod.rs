//! Offline read path for the binary log.
//!
//! A [`Decoder`] loads a log file (reassembling lz4 frames when the mode
//! byte says the stream is block-compressed), ingests dictionary blocks as
//! checkpoints deliver them, and then walks the record stream, handing each
//! log message back as a [`Record`] with fully decoded arguments. Callers
//! either print the formatted text or run their own aggregation over the
//! records.
//!
//! Formatting interprets a practical printf subset: `%d %i %u %o %x %X %f
//! %F %e %E %g %G %c %s %p`, the flags `- + space 0 #`, numeric and `*`
//! widths, and `.n` / `.*` precisions. `%%` prints a literal percent.

mod __test__;

use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::packer;
use crate::site::{Level, ParamKind};
use crate::wire::{self, Checkpoint};

#[derive(Debug)]
pub enum DecodeError {
  Io(io::Error),
  /// Unrecoverable structural problem, with a human-readable reason.
  Malformed(String),
}

impl std::fmt::Display for DecodeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DecodeError::Io(e) => write!(f, "log read failed: {e}"),
      DecodeError::Malformed(reason) => write!(f, "malformed log: {reason}"),
    }
  }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
  fn from(e: io::Error) -> Self {
    DecodeError::Io(e)
  }
}

fn malformed(reason: impl Into<String>) -> DecodeError {
  DecodeError::Malformed(reason.into())
}

/// One site's dictionary entry, as read back from the log.
#[derive(Debug, Clone)]
pub struct DictEntry {
  pub num_nibbles: u8,
  pub level: Level,
  pub line: u32,
  pub file: String,
  pub fragments: Vec<DictFragment>,
}

#[derive(Debug, Clone)]
pub struct DictFragment {
  pub text: String,
  pub arg_kind: Option<ParamKind>,
  pub has_dynamic_width: bool,
  pub has_dynamic_precision: bool,
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum DecodedArg {
  Unsigned(u64),
  Signed(i64),
  F32(f32),
  F64(f64),
  /// Absolute pointer value, already re-based on the checkpoint.
  Ptr(u64),
  Str(String),
  Wide(String),
}

/// A decoded log message.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
  pub site_id: u32,
  /// Raw counter value at record time.
  pub timestamp: u64,
  /// Wall-clock seconds (Unix epoch, fractional) derived from the
  /// governing checkpoint.
  pub wall_seconds: f64,
  pub ring_id: u32,
  /// True when the consumer's scan index wrapped just before this ring's
  /// marker; aggregators reordering by producer use this.
  pub after_scan_wrap: bool,
  pub args: Vec<DecodedArg>,
}

// Consecutive non-zero invalid tag bytes tolerated while resynchronizing.
const MAX_INVALID_RUN: usize = 64;

enum State {
  NeedCheckpoint,
  InRecords,
  Error,
}

pub struct Decoder {
  data: Vec<u8>,
  pos: usize,
  dictionary: Vec<DictEntry>,
  checkpoint: Option<Checkpoint>,
  last_site_id: u32,
  last_timestamp: u64,
  current_ring: u32,
  after_scan_wrap: bool,
  state: State,
}

impl Decoder {
  /// Opens a log file, inflating lz4 frames when the stream is compressed.
  pub fn open(path: impl AsRef<Path>) -> Result<Decoder, DecodeError> {
    let image = fs::read(path)?;
    Self::from_file_image(image)
  }

  /// Builds a decoder from a complete file image (mode byte included).
  pub fn from_file_image(image: Vec<u8>) -> Result<Decoder, DecodeError> {
    let Some((&mode, body)) = image.split_first() else {
      return Err(malformed("empty file"));
    };
    if mode & !(wire::FILE_MODE_LZ4 | wire::FILE_MODE_ALIGNED) != 0 {
      return Err(malformed(format!("unknown file mode byte {mode}")));
    }
    let aligned = mode & wire::FILE_MODE_ALIGNED != 0;

    let data = if mode & wire::FILE_MODE_LZ4 != 0 {
      let mut stream = Vec::new();
      let mut cursor = body;
      // Absolute file offset of the cursor; in aligned files every write
      // ends on a boundary, so frames after the first start aligned.
      let mut pos = 1usize;
      let mut first = true;
      loop {
        if aligned && !first {
          while pos % wire::WRITE_ALIGNMENT != 0 {
            match cursor.split_first() {
              Some((&0, rest)) => {
                cursor = rest;
                pos += 1;
              },
              Some(_) => return Err(malformed("nonzero byte inside alignment padding")),
              None => break,
            }
          }
        }
        if cursor.is_empty() {
          break;
        }
        if cursor.len() < 4 {
          return Err(malformed("truncated compression frame header"));
        }
        let frame_len = u32::from_le_bytes(cursor[..4].try_into().unwrap()) as usize;
        cursor = &cursor[4..];
        if cursor.len() < frame_len {
          return Err(malformed("truncated compression frame"));
        }
        let inflated = lz4::block::decompress(&cursor[..frame_len], None)
          .map_err(|e| malformed(format!("lz4 frame: {e}")))?;
        stream.extend_from_slice(&inflated);
        cursor = &cursor[frame_len..];
        pos += 4 + frame_len;
        first = false;
      }
      stream
    } else {
      // Raw streams need no frame handling; alignment padding shows up as
      // zero tag bytes the record loop already skips.
      body.to_vec()
    };

    Ok(Decoder {
      data,
      pos: 0,
      dictionary: Vec::new(),
      checkpoint: None,
      last_site_id: 0,
      last_timestamp: 0,
      current_ring: 0,
      after_scan_wrap: false,
      state: State::NeedCheckpoint,
    })
  }

  pub fn dictionary(&self) -> &[DictEntry] {
    &self.dictionary
  }

  pub fn dict_entry(&self, site_id: u32) -> Option<&DictEntry> {
    if site_id == 0 {
      return None;
    }
    self.dictionary.get(site_id as usize - 1)
  }

  /// Advances to the next log message, transparently handling checkpoints,
  /// buffer-change markers, and alignment padding. Returns `None` at a
  /// clean end of file.
  pub fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
    let mut invalid_run = 0usize;

    loop {
      if self.pos >= self.data.len() {
        return Ok(None);
      }
      let tag = self.data[self.pos];
      let entry_type = tag & 0b11;

      match entry_type {
        wire::ENTRY_INVALID => {
          if tag == 0 {
            // Direct-I/O alignment padding.
            self.pos += 1;
            invalid_run = 0;
            continue;
          }
          invalid_run += 1;
          self.pos += 1;
          if invalid_run > MAX_INVALID_RUN {
            self.state = State::Error;
            return Err(malformed("too many consecutive invalid record tags"));
          }
        },
        wire::ENTRY_CHECKPOINT => {
          self.read_checkpoint()?;
          invalid_run = 0;
        },
        wire::ENTRY_BUFFER_CHANGE => {
          let mut input = &self.data[self.pos..];
          let (ring_id, wrap) = wire::decode_buffer_change(&mut input)
            .ok_or_else(|| malformed("truncated buffer-change record"))?;
          self.pos = self.data.len() - input.len();
          self.current_ring = ring_id;
          self.after_scan_wrap = wrap;
          invalid_run = 0;
        },
        _ => {
          if matches!(self.state, State::NeedCheckpoint) {
            self.state = State::Error;
            return Err(malformed("log record before the initial checkpoint"));
          }
          return self.read_log_record().map(Some);
        },
      }
    }
  }

  /// Runs `visit` over every remaining record, returning how many were
  /// seen. This is the aggregation entry point: `visit` gets each decoded
  /// record along with its dictionary entry.
  pub fn for_each(
    &mut self,
    mut visit: impl FnMut(&Record, &DictEntry),
  ) -> Result<u64, DecodeError> {
    let mut count = 0u64;
    while let Some(record) = self.next_record()? {
      let entry = self
        .dict_entry(record.site_id)
        .ok_or_else(|| malformed(format!("record references unknown site {}", record.site_id)))?;
      visit(&record, entry);
      count += 1;
    }
    Ok(count)
  }

  fn read_checkpoint(&mut self) -> Result<(), DecodeError> {
    let mut input = &self.data[self.pos..];
    let (checkpoint, has_dict) =
      Checkpoint::decode(&mut input).ok_or_else(|| malformed("truncated checkpoint"))?;

    if has_dict {
      if input.len() < 4 {
        return Err(malformed("truncated dictionary block length"));
      }
      let dict_bytes = u32::from_le_bytes(input[..4].try_into().unwrap()) as usize;
      input = &input[4..];
      if input.len() < dict_bytes {
        return Err(malformed("truncated dictionary block"));
      }
      let mut block = &input[..dict_bytes];
      while !block.is_empty() {
        let entry = read_dictionary_record(&mut block)?;
        self.dictionary.push(entry);
      }
      input = &input[dict_bytes..];
    }

    self.pos = self.data.len() - input.len();
    self.last_site_id = 0;
    self.last_timestamp = checkpoint.rdtsc;
    self.checkpoint = Some(checkpoint);
    self.state = State::InRecords;
    Ok(())
  }

  fn read_log_record(&mut self) -> Result<Record, DecodeError> {
    let mut input = &self.data[self.pos..];
    let (_, fmt_extra, ts_extra) = wire::split_header_byte(input[0]);
    input = &input[1..];

    let fmt_bytes = fmt_extra as usize + 1;
    let ts_bytes = ts_extra as usize + 1;
    if input.len() < fmt_bytes + ts_bytes {
      self.state = State::Error;
      return Err(malformed("truncated log record header"));
    }

    let mut word = [0u8; 4];
    word[..fmt_bytes].copy_from_slice(&input[..fmt_bytes]);
    let site_id = self.last_site_id.wrapping_add(u32::from_le_bytes(word));
    input = &input[fmt_bytes..];

    let mut word = [0u8; 8];
    word[..ts_bytes].copy_from_slice(&input[..ts_bytes]);
    let timestamp = self.last_timestamp.wrapping_add(u64::from_le_bytes(word));
    input = &input[ts_bytes..];

    let entry = self
      .dict_entry(site_id)
      .ok_or_else(|| malformed(format!("record references unknown site {site_id}")))?
      .clone();

    let nibble_len = packer::nibble_table_len(entry.num_nibbles as usize);
    if input.len() < nibble_len {
      self.state = State::Error;
      return Err(malformed("truncated nibble table"));
    }
    let nibbles = input[..nibble_len].to_vec();
    input = &input[nibble_len..];

    // Scalars come first, in parameter order; strings follow, NUL-ended.
    let mut scalars: Vec<DecodedArg> = Vec::new();
    let mut nibble_idx = 0usize;
    let checkpoint = self.checkpoint.expect("records follow a checkpoint");

    for frag in &entry.fragments {
      let Some(kind) = frag.arg_kind else { continue };
      let mut scalar_slots = 0usize;
      scalar_slots += frag.has_dynamic_width as usize;
      scalar_slots += frag.has_dynamic_precision as usize;
      for _ in 0..scalar_slots {
        let code = packer::get_nibble(&nibbles, nibble_idx);
        nibble_idx += 1;
        let value = packer::unpack_i64(&mut input, code, 4)
          .ok_or_else(|| malformed("truncated packed width/precision"))?;
        scalars.push(DecodedArg::Signed(value));
      }
      if kind.is_string() {
        continue;
      }
      let code = packer::get_nibble(&nibbles, nibble_idx);
      nibble_idx += 1;
      scalars.push(decode_scalar(&mut input, kind, code, &checkpoint)?);
    }

    // String pass.
    let mut strings: Vec<DecodedArg> = Vec::new();
    for frag in &entry.fragments {
      let Some(kind) = frag.arg_kind else { continue };
      if !kind.is_string() {
        continue;
      }
      if kind == ParamKind::WideStr {
        let mut units = Vec::new();
        loop {
          if input.len() < 2 {
            self.state = State::Error;
            return Err(malformed("unterminated wide string"));
          }
          let unit = u16::from_le_bytes(input[..2].try_into().unwrap());
          input = &input[2..];
          if unit == 0 {
            break;
          }
          units.push(unit);
        }
        strings.push(DecodedArg::Wide(String::from_utf16_lossy(&units)));
      } else {
        let nul = input
          .iter()
          .position(|b| *b == 0)
          .ok_or_else(|| malformed("unterminated string"))?;
        strings.push(DecodedArg::Str(
          String::from_utf8_lossy(&input[..nul]).into_owned(),
        ));
        input = &input[nul + 1..];
      }
    }

    // Interleave back into parameter order.
    let mut args = Vec::with_capacity(scalars.len() + strings.len());
    let mut scalar_iter = scalars.into_iter();
    let mut string_iter = strings.into_iter();
    for frag in &entry.fragments {
      let Some(kind) = frag.arg_kind else { continue };
      for _ in 0..(frag.has_dynamic_width as usize + frag.has_dynamic_precision as usize) {
        args.push(scalar_iter.next().unwrap());
      }
      if kind.is_string() {
        args.push(string_iter.next().unwrap());
      } else {
        args.push(scalar_iter.next().unwrap());
      }
    }

    self.pos = self.data.len() - input.len();
    self.last_site_id = site_id;
    self.last_timestamp = timestamp;

    // Signed difference: entries recorded moments before the anchor was
    // captured must not wrap into a centuries-wide positive offset.
    let elapsed =
      (timestamp as i128 - checkpoint.rdtsc as i128) as f64 / checkpoint.cycles_per_second;
    Ok(Record {
      site_id,
      timestamp,
      wall_seconds: checkpoint.unix_time as f64 + elapsed,
      ring_id: self.current_ring,
      after_scan_wrap: self.after_scan_wrap,
      args,
    })
  }

  /// Renders a record the way the CLI prints it.
  pub fn format_record(&self, record: &Record) -> Result<String, DecodeError> {
    let entry = self
      .dict_entry(record.site_id)
      .ok_or_else(|| malformed(format!("record references unknown site {}", record.site_id)))?;
    let message = format_message(entry, &record.args);

    let whole = record.wall_seconds.floor();
    let nanos = ((record.wall_seconds - whole) * 1e9) as u32;
    let when = chrono::DateTime::from_timestamp(whole as i64, nanos)
      .map(|t| t.format("%Y-%m-%d %H:%M:%S%.9f").to_string())
      .unwrap_or_else(|| format!("{:.9}", record.wall_seconds));

    Ok(format!(
      "{} {} {}:{} [ring {}]: {}",
      when,
      entry.level.as_str(),
      entry.file,
      entry.line,
      record.ring_id,
      message
    ))
  }

  /// Renders a record as one NDJSON object.
  pub fn record_to_json(&self, record: &Record) -> Result<String, DecodeError> {
    let entry = self
      .dict_entry(record.site_id)
      .ok_or_else(|| malformed(format!("record references unknown site {}", record.site_id)))?;

    let args: Vec<serde_json::Value> = record
      .args
      .iter()
      .map(|arg| match arg {
        DecodedArg::Unsigned(v) => serde_json::json!(v),
        DecodedArg::Signed(v) => serde_json::json!(v),
        DecodedArg::F32(v) => serde_json::json!(v),
        DecodedArg::F64(v) => serde_json::json!(v),
        DecodedArg::Ptr(v) => serde_json::json!(format!("{v:#x}")),
        DecodedArg::Str(s) | DecodedArg::Wide(s) => serde_json::json!(s),
      })
      .collect();

    let line = serde_json::json!({
        "wall_seconds": record.wall_seconds,
        "timestamp": record.timestamp,
        "level": entry.level.as_str(),
        "file": entry.file,
        "line": entry.line,
        "ring": record.ring_id,
        "message": format_message(entry, &record.args),
        "args": args,
    });
    serde_json::to_string(&line).map_err(|e| malformed(format!("json encoding: {e}")))
  }
}

fn decode_scalar(
  input: &mut &[u8],
  kind: ParamKind,
  code: u8,
  checkpoint: &Checkpoint,
) -> Result<DecodedArg, DecodeError> {
  let truncated = || malformed("truncated packed argument");
  Ok(match kind {
    ParamKind::U8 | ParamKind::U16 | ParamKind::U32 | ParamKind::U64 => {
      DecodedArg::Unsigned(packer::unpack_u64(input, code).ok_or_else(truncated)?)
    },
    ParamKind::I8 | ParamKind::I16 | ParamKind::I32 | ParamKind::I64 => {
      let width = kind.scalar_width().unwrap();
      DecodedArg::Signed(packer::unpack_i64(input, code, width).ok_or_else(truncated)?)
    },
    ParamKind::F32 => DecodedArg::F32(packer::unpack_f32(input, code).ok_or_else(truncated)?),
    ParamKind::F64 => DecodedArg::F64(packer::unpack_f64(input, code).ok_or_else(truncated)?),
    ParamKind::Ptr => {
      let delta = packer::unpack_u64(input, code).ok_or_else(truncated)?;
      DecodedArg::Ptr(delta.wrapping_add(checkpoint.relative_pointer))
    },
    ParamKind::Str | ParamKind::WideStr => unreachable!(),
  })
}

fn read_dictionary_record(block: &mut &[u8]) -> Result<DictEntry, DecodeError> {
  if block.len() < 9 {
    return Err(malformed("truncated dictionary metadata"));
  }
  let num_nibbles = block[0];
  let num_fragments = block[1] as usize;
  let level = Level::from_u8(block[2]);
  let line = u32::from_le_bytes(block[3..7].try_into().unwrap());
  let filename_len = u16::from_le_bytes(block[7..9].try_into().unwrap()) as usize;
  *block = &block[9..];

  if block.len() < filename_len + 1 {
    return Err(malformed("truncated dictionary filename"));
  }
  let file = String::from_utf8_lossy(&block[..filename_len]).into_owned();
  if block[filename_len] != 0 {
    return Err(malformed("dictionary filename missing terminator"));
  }
  *block = &block[filename_len + 1..];

  let mut fragments = Vec::with_capacity(num_fragments);
  for _ in 0..num_fragments {
    if block.len() < 7 {
      return Err(malformed("truncated dictionary fragment"));
    }
    let arg_kind = if block[0] == 0 {
      None
    } else {
      Some(ParamKind::from_u8(block[0]).ok_or_else(|| malformed("unknown argument kind"))?)
    };
    let has_dynamic_width = block[1] != 0;
    let has_dynamic_precision = block[2] != 0;
    let text_len = u32::from_le_bytes(block[3..7].try_into().unwrap()) as usize;
    *block = &block[7..];

    if block.len() < text_len + 1 {
      return Err(malformed("truncated dictionary fragment text"));
    }
    let text = String::from_utf8_lossy(&block[..text_len]).into_owned();
    if block[text_len] != 0 {
      return Err(malformed("dictionary fragment missing terminator"));
    }
    *block = &block[text_len + 1..];

    fragments.push(DictFragment {
      text,
      arg_kind,
      has_dynamic_width,
      has_dynamic_precision,
    });
  }

  Ok(DictEntry {
    num_nibbles,
    level,
    line,
    file,
    fragments,
  })
}

/// Reconstructs the human-readable message for one record.
pub fn format_message(entry: &DictEntry, args: &[DecodedArg]) -> String {
  let mut out = String::new();
  let mut arg_idx = 0usize;

  for frag in &entry.fragments {
    if frag.arg_kind.is_none() {
      push_literal(&mut out, &frag.text);
      continue;
    }

    let (literal, spec) = split_fragment(&frag.text);
    push_literal(&mut out, literal);

    let mut dyn_width = None;
    if frag.has_dynamic_width {
      dyn_width = args.get(arg_idx).map(arg_as_i32);
      arg_idx += 1;
    }
    let mut dyn_precision = None;
    if frag.has_dynamic_precision {
      dyn_precision = args.get(arg_idx).map(arg_as_i32);
      arg_idx += 1;
    }

    match args.get(arg_idx) {
      Some(arg) => out.push_str(&format_one(spec, arg, dyn_width, dyn_precision)),
      None => out.push_str("<missing>"),
    }
    arg_idx += 1;
  }

  out
}

fn push_literal(out: &mut String, text: &str) {
  out.push_str(&text.replace("%%", "%"));
}

// A fragment holds literal text with exactly one live specifier at its end;
// find where that specifier begins.
fn split_fragment(text: &str) -> (&str, &str) {
  let bytes = text.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      if i + 1 < bytes.len() && bytes[i + 1] == b'%' {
        i += 2;
        continue;
      }
      return (&text[..i], &text[i..]);
    }
    i += 1;
  }
  (text, "")
}

struct SpecParts {
  minus: bool,
  plus: bool,
  space: bool,
  zero: bool,
  alt: bool,
  width: Option<i32>,
  precision: Option<i32>,
  terminal: u8,
}

fn parse_spec(spec: &str, dyn_width: Option<i32>, dyn_precision: Option<i32>) -> Option<SpecParts> {
  let bytes = spec.as_bytes();
  if bytes.first() != Some(&b'%') {
    return None;
  }
  let mut i = 1;
  let mut parts = SpecParts {
    minus: false,
    plus: false,
    space: false,
    zero: false,
    alt: false,
    width: None,
    precision: None,
    terminal: 0,
  };

  while i < bytes.len() {
    match bytes[i] {
      b'-' => parts.minus = true,
      b'+' => parts.plus = true,
      b' ' => parts.space = true,
      b'0' => parts.zero = true,
      b'#' => parts.alt = true,
      _ => break,
    }
    i += 1;
  }

  if i < bytes.len() && bytes[i] == b'*' {
    parts.width = dyn_width;
    i += 1;
  } else {
    let mut value = None;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
      value = Some(value.unwrap_or(0) * 10 + (bytes[i] - b'0') as i32);
      i += 1;
    }
    parts.width = value;
  }

  if i < bytes.len() && bytes[i] == b'.' {
    i += 1;
    if i < bytes.len() && bytes[i] == b'*' {
      parts.precision = dyn_precision;
      i += 1;
    } else {
      let mut value = 0;
      while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value * 10 + (bytes[i] - b'0') as i32;
        i += 1;
      }
      parts.precision = Some(value);
    }
  }

  while i < bytes.len() && matches!(bytes[i], b'h' | b'l' | b'j' | b'z' | b't' | b'L') {
    i += 1;
  }

  parts.terminal = *bytes.get(i)?;
  Some(parts)
}

fn arg_as_i32(arg: &DecodedArg) -> i32 {
  match arg {
    DecodedArg::Signed(v) => *v as i32,
    DecodedArg::Unsigned(v) => *v as i32,
    _ => 0,
  }
}

fn arg_as_i64(arg: &DecodedArg) -> i64 {
  match arg {
    DecodedArg::Signed(v) => *v,
    DecodedArg::Unsigned(v) => *v as i64,
    DecodedArg::Ptr(v) => *v as i64,
    DecodedArg::F32(v) => *v as i64,
    DecodedArg::F64(v) => *v as i64,
    _ => 0,
  }
}

fn arg_as_u64(arg: &DecodedArg) -> u64 {
  match arg {
    DecodedArg::Signed(v) => *v as u64,
    DecodedArg::Unsigned(v) => *v,
    DecodedArg::Ptr(v) => *v,
    DecodedArg::F32(v) => *v as u64,
    DecodedArg::F64(v) => *v as u64,
    _ => 0,
  }
}

fn arg_as_f64(arg: &DecodedArg) -> f64 {
  match arg {
    DecodedArg::F32(v) => *v as f64,
    DecodedArg::F64(v) => *v,
    DecodedArg::Signed(v) => *v as f64,
    DecodedArg::Unsigned(v) => *v as f64,
    _ => 0.0,
  }
}

fn format_one(
  spec: &str,
  arg: &DecodedArg,
  dyn_width: Option<i32>,
  dyn_precision: Option<i32>,
) -> String {
  let Some(parts) = parse_spec(spec, dyn_width, dyn_precision) else {
    return String::new();
  };

  let body = match parts.terminal {
    b'd' | b'i' => {
      let value = arg_as_i64(arg);
      let digits = value.unsigned_abs().to_string();
      let digits = zero_extend(digits, parts.precision);
      let sign = if value < 0 {
        "-"
      } else if parts.plus {
        "+"
      } else if parts.space {
        " "
      } else {
        ""
      };
      format!("{sign}{digits}")
    },
    b'u' => zero_extend(arg_as_u64(arg).to_string(), parts.precision),
    b'x' => prefix_alt(format!("{:x}", arg_as_u64(arg)), &parts, "0x"),
    b'X' => prefix_alt(format!("{:X}", arg_as_u64(arg)), &parts, "0X"),
    b'o' => prefix_alt(format!("{:o}", arg_as_u64(arg)), &parts, "0"),
    b'f' | b'F' => {
      let precision = parts.precision.map(|p| p.max(0) as usize).unwrap_or(6);
      let value = arg_as_f64(arg);
      let body = format!("{value:.precision$}");
      if value >= 0.0 && parts.plus {
        format!("+{body}")
      } else {
        body
      }
    },
    b'e' | b'E' => {
      let precision = parts.precision.map(|p| p.max(0) as usize).unwrap_or(6);
      let body = format!("{:.*e}", precision, arg_as_f64(arg));
      if parts.terminal == b'E' {
        body.to_uppercase()
      } else {
        body
      }
    },
    b'g' | b'G' | b'a' | b'A' => format!("{}", arg_as_f64(arg)),
    b'c' => char::from_u32(arg_as_u64(arg) as u32)
      .map(String::from)
      .unwrap_or_default(),
    b'p' => format!("{:#x}", arg_as_u64(arg)),
    b's' => match arg {
      DecodedArg::Str(s) | DecodedArg::Wide(s) => s.clone(),
      other => format!("{other:?}"),
    },
    _ => String::new(),
  };

  pad(body, &parts)
}

fn zero_extend(digits: String, precision: Option<i32>) -> String {
  match precision {
    Some(p) if p as usize > digits.len() => {
      let mut out = "0".repeat(p as usize - digits.len());
      out.push_str(&digits);
      out
    },
    _ => digits,
  }
}

fn prefix_alt(body: String, parts: &SpecParts, prefix: &str) -> String {
  let body = zero_extend(body, parts.precision);
  if parts.alt && body != "0" {
    format!("{prefix}{body}")
  } else {
    body
  }
}

fn pad(body: String, parts: &SpecParts) -> String {
  let Some(width) = parts.width else {
    return body;
  };
  let (width, left) = if width < 0 {
    (width.unsigned_abs() as usize, true)
  } else {
    (width as usize, parts.minus)
  };
  if body.chars().count() >= width {
    return body;
  }
  let fill = width - body.chars().count();
  if left {
    let mut out = body;
    out.push_str(&" ".repeat(fill));
    out
  } else if parts.zero && parts.precision.is_none() {
    // Zero fill goes between the sign and the digits.
    let split = body
      .starts_with(['-', '+', ' '])
      .then_some(1)
      .unwrap_or(0);
    let mut out = body[..split].to_string();
    out.push_str(&"0".repeat(fill));
    out.push_str(&body[split..]);
    out
  } else {
    let mut out = " ".repeat(fill);
    out.push_str(&body);
    out
  }
}
