//! On-disk record layouts shared by the encoder and the decoder.
//!
//! The binary log is a stream of records, each introduced by a one-byte
//! header whose low two bits carry the record type. Log messages follow
//! with delta-compressed site ids and timestamps; checkpoints are
//! uncompressed anchors that may tow a block of dictionary records; buffer
//! changes mark a switch to a different producer's ring.


use crate::cycles;
use crate::packer;

pub const ENTRY_INVALID: u8 = 0;
pub const ENTRY_LOG_MSG: u8 = 1;
pub const ENTRY_CHECKPOINT: u8 = 2;
pub const ENTRY_BUFFER_CHANGE: u8 = 3;

/// First byte of the log file. Bit 0 set means the stream is chunked into
/// lz4 block frames; bit 1 set means every write was padded to a
/// [`WRITE_ALIGNMENT`] boundary (direct I/O), so readers skip zero padding
/// between frames by file offset.
pub const FILE_MODE_RAW: u8 = 0;
pub const FILE_MODE_LZ4: u8 = 1;
pub const FILE_MODE_ALIGNED: u8 = 1 << 1;

/// Alignment of on-disk writes in direct-I/O mode.
pub const WRITE_ALIGNMENT: usize = 512;

/// Header every producer writes before an entry's raw argument bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
  pub site_id: u32,
  pub timestamp: u64,
  /// Total entry size in bytes, this header included.
  pub entry_size: u32,
}

pub const RAW_HEADER_BYTES: usize = 16;

impl RawHeader {
  pub fn write_to(&self, out: &mut [u8]) {
    out[0..4].copy_from_slice(&self.site_id.to_le_bytes());
    out[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
    out[12..16].copy_from_slice(&self.entry_size.to_le_bytes());
  }

  pub fn read_from(bytes: &[u8]) -> Option<RawHeader> {
    if bytes.len() < RAW_HEADER_BYTES {
      return None;
    }
    Some(RawHeader {
      site_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
      timestamp: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
      entry_size: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
    })
  }
}

/// Builds a log-message header byte: `[entry_type:2][fmt_extra:2][ts_extra:3]`
/// where the extras are the delta byte counts minus one.
#[inline]
pub fn log_header_byte(fmt_extra: u8, ts_extra: u8) -> u8 {
  debug_assert!(fmt_extra < 4 && ts_extra < 8);
  ENTRY_LOG_MSG | (fmt_extra << 2) | (ts_extra << 4)
}

/// Splits any header byte into (entry_type, fmt_extra, ts_extra).
#[inline]
pub fn split_header_byte(byte: u8) -> (u8, u8, u8) {
  (byte & 0b11, (byte >> 2) & 0b11, (byte >> 4) & 0b111)
}

/// Uncompressed resynchronization anchor. Written at the head of every
/// output file and whenever the encoder needs to describe new sites; the
/// decoder resets its delta state (`last_site_id = 0`, `last_timestamp =
/// rdtsc`) when it reads one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
  pub rdtsc: u64,
  pub unix_time: u64,
  pub cycles_per_second: f64,
  /// Base address pointer arguments are rebased against.
  pub relative_pointer: u64,
}

/// Header byte plus the four fixed fields.
pub const CHECKPOINT_BYTES: usize = 1 + 32;

// Bit 2 of a checkpoint header marks a trailing dictionary block:
// dict_bytes: u32 followed by that many bytes of dictionary records.
const CHECKPOINT_DICT_FLAG: u8 = 1 << 2;

impl Checkpoint {
  /// Captures the current counter and wall clock.
  pub fn capture(relative_pointer: u64) -> Checkpoint {
    Checkpoint {
      rdtsc: cycles::rdtsc(),
      unix_time: chrono::Utc::now().timestamp() as u64,
      cycles_per_second: cycles::per_second(),
      relative_pointer,
    }
  }

  pub fn encode(&self, out: &mut Vec<u8>, has_dictionary: bool) {
    let mut header = ENTRY_CHECKPOINT;
    if has_dictionary {
      header |= CHECKPOINT_DICT_FLAG;
    }
    out.push(header);
    out.extend_from_slice(&self.rdtsc.to_le_bytes());
    out.extend_from_slice(&self.unix_time.to_le_bytes());
    out.extend_from_slice(&self.cycles_per_second.to_le_bytes());
    out.extend_from_slice(&self.relative_pointer.to_le_bytes());
  }

  /// Decodes a checkpoint positioned at its header byte. Returns the
  /// checkpoint and whether a dictionary block follows.
  pub fn decode(input: &mut &[u8]) -> Option<(Checkpoint, bool)> {
    if input.len() < CHECKPOINT_BYTES {
      return None;
    }
    let header = input[0];
    if header & 0b11 != ENTRY_CHECKPOINT {
      return None;
    }
    let body = &input[1..CHECKPOINT_BYTES];
    let checkpoint = Checkpoint {
      rdtsc: u64::from_le_bytes(body[0..8].try_into().ok()?),
      unix_time: u64::from_le_bytes(body[8..16].try_into().ok()?),
      cycles_per_second: f64::from_le_bytes(body[16..24].try_into().ok()?),
      relative_pointer: u64::from_le_bytes(body[24..32].try_into().ok()?),
    };
    *input = &input[CHECKPOINT_BYTES..];
    Some((checkpoint, header & CHECKPOINT_DICT_FLAG != 0))
  }
}

// Buffer-change byte: [type:2][wrap:1][short:1][id_or_nibble:4]. Ring ids
// below 16 ride inline in the top nibble; wider ids follow variable-byte
// packed, with the nibble holding their pack code.
const BUFFER_CHANGE_WRAP_FLAG: u8 = 1 << 2;
const BUFFER_CHANGE_SHORT_FLAG: u8 = 1 << 3;

pub fn encode_buffer_change(out: &mut Vec<u8>, ring_id: u32, wrap_around: bool) {
  let mut header = ENTRY_BUFFER_CHANGE;
  if wrap_around {
    header |= BUFFER_CHANGE_WRAP_FLAG;
  }

  if ring_id < 16 {
    header |= BUFFER_CHANGE_SHORT_FLAG | ((ring_id as u8) << 4);
    out.push(header);
    return;
  }

  let mut packed = Vec::with_capacity(4);
  let code = packer::pack_u64(&mut packed, ring_id as u64);
  header |= code << 4;
  out.push(header);
  out.extend_from_slice(&packed);
}

/// Decodes a buffer-change record positioned at its header byte, returning
/// `(ring_id, wrap_around)`.
pub fn decode_buffer_change(input: &mut &[u8]) -> Option<(u32, bool)> {
  let header = *input.first()?;
  if header & 0b11 != ENTRY_BUFFER_CHANGE {
    return None;
  }
  *input = &input[1..];

  let wrap_around = header & BUFFER_CHANGE_WRAP_FLAG != 0;
  if header & BUFFER_CHANGE_SHORT_FLAG != 0 {
    return Some(((header >> 4) as u32, wrap_around));
  }
  let id = packer::unpack_u64(input, header >> 4)?;
  Some((id as u32, wrap_around))
}
