//! Consumer-side encoding of raw ring entries into the compact output
//! format.
//!
//! The encoder owns the active output buffer and the delta state shared by
//! consecutive log records (last site id, last timestamp). It lazily emits
//! a checkpoint at the head of every file, re-emits one whenever entries
//! reference sites the on-disk dictionary does not describe yet, and drops
//! a buffer-change marker each time the consumer switches rings. All
//! "would overflow" conditions surface as a short read so the consumer can
//! flush and retry; they are never fatal.


use crate::packer;
use crate::site::{ParamKind, ParamRole, Registry, SiteMeta, WouldOverflow};
use crate::wire::{self, Checkpoint, RawHeader, RAW_HEADER_BYTES};

/// Per-site compaction entry point held in the site metadata.
pub type CompactFn = fn(&SiteMeta, &[u8], &mut Vec<u8>, u64) -> Result<(), CompactError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
  /// The raw argument bytes do not match the site's parameter table. A
  /// healthy producer never generates this.
  Malformed,
}

impl std::fmt::Display for CompactError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CompactError::Malformed => write!(f, "raw entry bytes do not match the site parameter table"),
    }
  }
}

impl std::error::Error for CompactError {}

// Upper bound on the compacted size of one entry: packed scalars never
// exceed their raw width, strings lose their length prefix but gain at
// most a two-byte terminator.
fn entry_worst_case(site: &SiteMeta, raw_args: &[u8]) -> usize {
  let num_strings = site.params.iter().filter(|p| p.role.is_string()).count();
  1 + 4 + 8 + packer::nibble_table_len(site.num_nibbles as usize) + raw_args.len() + 2 * num_strings
}

fn read_exact<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], CompactError> {
  if cursor.len() < n {
    return Err(CompactError::Malformed);
  }
  let (head, rest) = cursor.split_at(n);
  *cursor = rest;
  Ok(head)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, CompactError> {
  let bytes = read_exact(cursor, 4)?;
  Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Default table-driven compaction: one pass packing scalars and filling
/// the nibble table, then one pass copying strings at their effective
/// length with a NUL terminator. Pointers are rebased against the
/// checkpoint base before packing.
pub fn compact_args(
  site: &SiteMeta,
  raw: &[u8],
  out: &mut Vec<u8>,
  relative_pointer: u64,
) -> Result<(), CompactError> {
  let nibble_len = packer::nibble_table_len(site.num_nibbles as usize);
  let nibble_at = out.len();
  out.resize(nibble_at + nibble_len, 0);

  // Pass 1: scalars.
  let mut cursor = raw;
  let mut nibble_idx = 0usize;
  for spec in &site.params {
    if spec.role.is_string() {
      let units = read_u32(&mut cursor)? as usize;
      let unit_size = if spec.kind == ParamKind::WideStr { 2 } else { 1 };
      read_exact(&mut cursor, units * unit_size)?;
      continue;
    }

    let width = spec.kind.scalar_width().ok_or(CompactError::Malformed)?;
    let bytes = read_exact(&mut cursor, width)?;
    let code = match spec.kind {
      ParamKind::U8 | ParamKind::U16 | ParamKind::U32 | ParamKind::U64 => {
        let mut word = [0u8; 8];
        word[..width].copy_from_slice(bytes);
        packer::pack_u64(out, u64::from_le_bytes(word))
      },
      ParamKind::I8 => packer::pack_i8(out, bytes[0] as i8),
      ParamKind::I16 => packer::pack_i16(out, i16::from_le_bytes(bytes.try_into().unwrap())),
      ParamKind::I32 => packer::pack_i32(out, i32::from_le_bytes(bytes.try_into().unwrap())),
      ParamKind::I64 => packer::pack_i64(out, i64::from_le_bytes(bytes.try_into().unwrap())),
      ParamKind::F32 => packer::pack_f32(out, f32::from_le_bytes(bytes.try_into().unwrap())),
      ParamKind::F64 => packer::pack_f64(out, f64::from_le_bytes(bytes.try_into().unwrap())),
      ParamKind::Ptr => {
        let absolute = u64::from_le_bytes(bytes.try_into().unwrap());
        packer::pack_u64(out, absolute.wrapping_sub(relative_pointer))
      },
      ParamKind::Str | ParamKind::WideStr => unreachable!(),
    };
    packer::set_nibble(&mut out[nibble_at..nibble_at + nibble_len], nibble_idx, code);
    nibble_idx += 1;
  }

  // Pass 2: strings, truncated per their precision rule and terminated so
  // the decoder can find their end without a length prefix.
  let mut cursor = raw;
  let mut last_precision: Option<i32> = None;
  for spec in &site.params {
    if !spec.role.is_string() {
      let width = spec.kind.scalar_width().ok_or(CompactError::Malformed)?;
      let bytes = read_exact(&mut cursor, width)?;
      if spec.role == ParamRole::DynamicPrecision {
        last_precision = Some(match spec.kind {
          ParamKind::I32 => i32::from_le_bytes(bytes.try_into().unwrap()),
          _ => u32::from_le_bytes(bytes.try_into().unwrap()) as i32,
        });
      }
      continue;
    }

    let units = read_u32(&mut cursor)? as usize;
    let unit_size = if spec.kind == ParamKind::WideStr { 2 } else { 1 };
    let data = read_exact(&mut cursor, units * unit_size)?;

    let mut effective = match spec.role {
      ParamRole::StringNoPrecision => units,
      ParamRole::StringFixed(n) => units.min(n as usize),
      ParamRole::StringDynamicPrecision => match last_precision {
        // Negative precision means "no precision", as in printf.
        Some(p) if p >= 0 => units.min(p as usize),
        _ => units,
      },
      _ => unreachable!(),
    };

    if spec.kind == ParamKind::WideStr {
      // A zero code unit would read as the terminator; stop before it.
      for i in 0..effective {
        if data[2 * i] == 0 && data[2 * i + 1] == 0 {
          effective = i;
          break;
        }
      }
      out.extend_from_slice(&data[..2 * effective]);
      out.extend_from_slice(&[0, 0]);
    } else {
      if let Some(nul) = data[..effective].iter().position(|b| *b == 0) {
        effective = nul;
      }
      out.extend_from_slice(&data[..effective]);
      out.push(0);
    }
  }

  Ok(())
}

/// State for one output file's record stream.
pub struct Encoder {
  out: Vec<u8>,
  limit: usize,
  last_site_id: u32,
  last_timestamp: u64,
  /// First site id the on-disk dictionary does not describe yet.
  dict_next_id: u32,
  current_ring: Option<u32>,
  /// The consumer's scan index wrapped past ring zero since the last
  /// buffer-change marker went out.
  pending_wrap: bool,
  wrote_checkpoint: bool,
  /// The file's time anchor, captured at file creation before any producer
  /// could record. Every checkpoint in the stream re-encodes it verbatim,
  /// so timestamp deltas stay relative to a point at or before the
  /// earliest entry.
  anchor: Checkpoint,
  pub unknown_site_entries: u64,
  pub dropped_dictionary_sites: u64,
}

/// Result of one encoding sub-iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePass {
  /// Raw bytes consumed from the ring. Zero with pending input means the
  /// output buffer is full and must be flushed.
  pub consumed: usize,
  pub events: u64,
}

impl Encoder {
  pub fn new(limit: usize, anchor: Checkpoint) -> Self {
    Self {
      out: Vec::with_capacity(limit),
      limit,
      last_site_id: 0,
      last_timestamp: 0,
      dict_next_id: 1,
      current_ring: None,
      pending_wrap: false,
      wrote_checkpoint: false,
      anchor,
      unknown_site_entries: 0,
      dropped_dictionary_sites: 0,
    }
  }

  /// Resets all per-file stream state; the next record will be preceded by
  /// a fresh checkpoint and a full dictionary.
  pub fn begin_file(&mut self) {
    self.last_site_id = 0;
    self.last_timestamp = 0;
    self.dict_next_id = 1;
    self.current_ring = None;
    self.pending_wrap = false;
    self.wrote_checkpoint = false;
  }

  pub fn encoded_bytes(&self) -> usize {
    self.out.len()
  }

  /// Hands the filled buffer to the caller, installing `replacement`
  /// (typically the drained double buffer) as the new active one.
  pub fn swap_buffer(&mut self, mut replacement: Vec<u8>) -> Vec<u8> {
    replacement.clear();
    std::mem::replace(&mut self.out, replacement)
  }

  pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
    &mut self.out
  }

  /// Records that the consumer's scan index wrapped past ring zero; the
  /// next buffer-change marker will carry the flag.
  pub fn note_scan_wrap(&mut self) {
    self.pending_wrap = true;
  }

  /// Encodes as many whole entries from `raw` as fit in the output buffer.
  pub fn encode_log_msgs(&mut self, raw: &[u8], ring_id: u32, registry: &Registry) -> EncodePass {
    let mut pass = EncodePass {
      consumed: 0,
      events: 0,
    };

    if !self.wrote_checkpoint && self.emit_checkpoint(registry).is_err() {
      return pass;
    }

    if self.current_ring != Some(ring_id) || self.pending_wrap {
      // Marker worst case: 1 header byte + 4 extended-id bytes.
      if self.out.len() + 5 > self.limit {
        return pass;
      }
      wire::encode_buffer_change(&mut self.out, ring_id, self.pending_wrap);
      self.current_ring = Some(ring_id);
      self.pending_wrap = false;
    }

    while pass.consumed < raw.len() {
      let remaining = &raw[pass.consumed..];
      let Some(header) = RawHeader::read_from(remaining) else {
        break;
      };
      let entry_size = header.entry_size as usize;
      if entry_size < RAW_HEADER_BYTES || entry_size > remaining.len() {
        break;
      }
      let raw_args = &remaining[RAW_HEADER_BYTES..entry_size];

      let Some(site) = registry.lookup(header.site_id) else {
        eprintln!(
          "[nslog] consumer skipped an entry with unknown site id {}",
          header.site_id
        );
        self.unknown_site_entries += 1;
        pass.consumed += entry_size;
        continue;
      };

      // The dictionary must describe a site before its first record.
      if header.site_id >= self.dict_next_id && self.emit_checkpoint(registry).is_err() {
        break;
      }

      if self.encode_one(&site, &header, raw_args).is_err() {
        if entry_worst_case(&site, raw_args) > self.limit {
          // This entry can never fit, even in an empty buffer.
          eprintln!(
            "[nslog] entry for site {} exceeds the output buffer; dropped",
            site.id
          );
          pass.consumed += entry_size;
          continue;
        }
        break;
      }
      pass.consumed += entry_size;
      pass.events += 1;
    }

    pass
  }

  fn encode_one(
    &mut self,
    site: &SiteMeta,
    header: &RawHeader,
    raw_args: &[u8],
  ) -> Result<(), WouldOverflow> {
    if self.out.len() + entry_worst_case(site, raw_args) > self.limit {
      return Err(WouldOverflow);
    }

    let mark = self.out.len();
    let site_delta = header.site_id.wrapping_sub(self.last_site_id);
    let ts_delta = header.timestamp.wrapping_sub(self.last_timestamp);
    let fmt_bytes = packer::byte_width(site_delta as u64).max(1);
    let ts_bytes = packer::byte_width(ts_delta).max(1);

    self
      .out
      .push(wire::log_header_byte(fmt_bytes as u8 - 1, ts_bytes as u8 - 1));
    self.out.extend_from_slice(&site_delta.to_le_bytes()[..fmt_bytes]);
    self.out.extend_from_slice(&ts_delta.to_le_bytes()[..ts_bytes]);

    if let Err(e) = (site.compact)(site, raw_args, &mut self.out, self.anchor.relative_pointer) {
      eprintln!(
        "[nslog] consumer dropped a malformed entry for site {} ({}:{}): {e}",
        site.id, site.file, site.line
      );
      self.out.truncate(mark);
      // The entry is unrecoverable but the stream stays valid.
      return Ok(());
    }

    self.last_site_id = header.site_id;
    self.last_timestamp = header.timestamp;
    Ok(())
  }

  /// Writes a checkpoint carrying the file anchor, towing dictionary
  /// records for every site the stream has not described yet.
  fn emit_checkpoint(&mut self, registry: &Registry) -> Result<(), WouldOverflow> {
    let high_water = registry.high_water();
    let has_dict = self.dict_next_id <= high_water;
    let mark = self.out.len();

    if self.out.len() + wire::CHECKPOINT_BYTES + 4 > self.limit {
      return Err(WouldOverflow);
    }

    self.anchor.encode(&mut self.out, has_dict);

    if has_dict {
      let len_at = self.out.len();
      self.out.extend_from_slice(&0u32.to_le_bytes());

      match registry.serialize_dictionary(self.dict_next_id, &mut self.out, self.limit) {
        Ok(next) => {
          self.dict_next_id = next;
        },
        Err(WouldOverflow) => {
          self.out.truncate(mark);
          if mark == 0 {
            // Even an empty buffer cannot hold this site's record; skip it
            // rather than livelock. Its entries will decode as unknown.
            eprintln!(
              "[nslog] dictionary record for site {} exceeds the output buffer; site skipped",
              self.dict_next_id
            );
            self.dropped_dictionary_sites += 1;
            self.dict_next_id += 1;
          }
          return Err(WouldOverflow);
        },
      }

      let dict_bytes = (self.out.len() - len_at - 4) as u32;
      self.out[len_at..len_at + 4].copy_from_slice(&dict_bytes.to_le_bytes());
    }

    self.last_site_id = 0;
    self.last_timestamp = self.anchor.rdtsc;
    self.wrote_checkpoint = true;
    Ok(())
  }
}
