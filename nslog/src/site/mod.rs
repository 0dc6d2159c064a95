//! Log sites: the static metadata behind every `nslog!` call.
//!
//! Each call location owns a [`SiteSlot`] whose id starts at zero
//! ("unassigned"). The first execution analyzes the format string, merges
//! the analysis with the kinds of the actual arguments, and claims the next
//! dense id from the process-wide [`Registry`]. Registration is the only
//! expensive step and happens once per site, off the hot path; afterwards a
//! site is a single relaxed atomic load.
//!
//! The registry also serializes itself into the on-disk dictionary so the
//! decoder can reconstruct messages without access to the binary.

mod __test__;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{OnceLock, RwLock};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::encoder::{self, CompactFn};

/// Severity of a log statement. Smaller is more severe; a statement is
/// dropped when its level is greater than the logger's current level.
/// `Silent` exists only as a filter value that suppresses everything.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
  Silent = 0,
  Error = 1,
  Warning = 2,
  Notice = 3,
  Debug = 4,
}

impl Level {
  #[inline]
  pub fn from_u8(level: u8) -> Level {
    match level {
      0 => Level::Silent,
      1 => Level::Error,
      2 => Level::Warning,
      3 => Level::Notice,
      _ => Level::Debug,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Level::Silent => "SILENT",
      Level::Error => "ERROR",
      Level::Warning => "WARNING",
      Level::Notice => "NOTICE",
      Level::Debug => "DEBUG",
    }
  }
}

impl std::fmt::Display for Level {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Full-width storage type of a raw argument, as recorded on the ring.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
  U8 = 1,
  U16 = 2,
  U32 = 3,
  U64 = 4,
  I8 = 5,
  I16 = 6,
  I32 = 7,
  I64 = 8,
  F32 = 9,
  F64 = 10,
  Ptr = 11,
  Str = 12,
  WideStr = 13,
}

impl ParamKind {
  pub fn from_u8(value: u8) -> Option<ParamKind> {
    Some(match value {
      1 => ParamKind::U8,
      2 => ParamKind::U16,
      3 => ParamKind::U32,
      4 => ParamKind::U64,
      5 => ParamKind::I8,
      6 => ParamKind::I16,
      7 => ParamKind::I32,
      8 => ParamKind::I64,
      9 => ParamKind::F32,
      10 => ParamKind::F64,
      11 => ParamKind::Ptr,
      12 => ParamKind::Str,
      13 => ParamKind::WideStr,
      _ => return None,
    })
  }

  /// Raw byte width of a scalar kind on the ring; strings are
  /// length-prefixed instead.
  pub fn scalar_width(&self) -> Option<usize> {
    Some(match self {
      ParamKind::U8 | ParamKind::I8 => 1,
      ParamKind::U16 | ParamKind::I16 => 2,
      ParamKind::U32 | ParamKind::I32 | ParamKind::F32 => 4,
      ParamKind::U64 | ParamKind::I64 | ParamKind::F64 | ParamKind::Ptr => 8,
      ParamKind::Str | ParamKind::WideStr => return None,
    })
  }

  pub fn is_string(&self) -> bool {
    matches!(self, ParamKind::Str | ParamKind::WideStr)
  }
}

/// What the format string says a parameter is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
  /// Fixed-width scalar or pointer.
  NonString,
  /// Supplies the field width of a later specifier (`%*d`).
  DynamicWidth,
  /// Supplies the precision of a later specifier (`%.*s`).
  DynamicPrecision,
  /// String emitted at full length.
  StringNoPrecision,
  /// String truncated to the preceding dynamic-precision argument.
  StringDynamicPrecision,
  /// String truncated to a precision baked into the format (`%.8s`).
  StringFixed(u32),
}

impl ParamRole {
  pub fn is_string(&self) -> bool {
    matches!(
      self,
      ParamRole::StringNoPrecision | ParamRole::StringDynamicPrecision | ParamRole::StringFixed(_)
    )
  }
}

/// One argument as captured by the `nslog!` macro. Mirrors the raw storage:
/// scalars full-width, strings length-prefixed, pointers as `usize`.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
  U8(u8),
  U16(u16),
  U32(u32),
  U64(u64),
  I8(i8),
  I16(i16),
  I32(i32),
  I64(i64),
  F32(f32),
  F64(f64),
  Ptr(usize),
  Str(&'a str),
  WideStr(&'a [u16]),
}

impl<'a> Arg<'a> {
  pub fn kind(&self) -> ParamKind {
    match self {
      Arg::U8(_) => ParamKind::U8,
      Arg::U16(_) => ParamKind::U16,
      Arg::U32(_) => ParamKind::U32,
      Arg::U64(_) => ParamKind::U64,
      Arg::I8(_) => ParamKind::I8,
      Arg::I16(_) => ParamKind::I16,
      Arg::I32(_) => ParamKind::I32,
      Arg::I64(_) => ParamKind::I64,
      Arg::F32(_) => ParamKind::F32,
      Arg::F64(_) => ParamKind::F64,
      Arg::Ptr(_) => ParamKind::Ptr,
      Arg::Str(_) => ParamKind::Str,
      Arg::WideStr(_) => ParamKind::WideStr,
    }
  }

  /// Bytes this argument occupies in a raw ring entry.
  pub fn recorded_size(&self) -> usize {
    match self {
      Arg::U8(_) | Arg::I8(_) => 1,
      Arg::U16(_) | Arg::I16(_) => 2,
      Arg::U32(_) | Arg::I32(_) | Arg::F32(_) => 4,
      Arg::U64(_) | Arg::I64(_) | Arg::F64(_) | Arg::Ptr(_) => 8,
      Arg::Str(s) => 4 + s.len(),
      Arg::WideStr(w) => 4 + 2 * w.len(),
    }
  }

  /// Writes the full-width little-endian representation at the start of
  /// `out`, returning the number of bytes used. `out` must hold at least
  /// `recorded_size()` bytes.
  pub fn record_into(&self, out: &mut [u8]) -> usize {
    match self {
      Arg::U8(v) => {
        out[0] = *v;
        1
      },
      Arg::U16(v) => {
        out[..2].copy_from_slice(&v.to_le_bytes());
        2
      },
      Arg::U32(v) => {
        out[..4].copy_from_slice(&v.to_le_bytes());
        4
      },
      Arg::U64(v) => {
        out[..8].copy_from_slice(&v.to_le_bytes());
        8
      },
      Arg::I8(v) => {
        out[0] = *v as u8;
        1
      },
      Arg::I16(v) => {
        out[..2].copy_from_slice(&v.to_le_bytes());
        2
      },
      Arg::I32(v) => {
        out[..4].copy_from_slice(&v.to_le_bytes());
        4
      },
      Arg::I64(v) => {
        out[..8].copy_from_slice(&v.to_le_bytes());
        8
      },
      Arg::F32(v) => {
        out[..4].copy_from_slice(&v.to_le_bytes());
        4
      },
      Arg::F64(v) => {
        out[..8].copy_from_slice(&v.to_le_bytes());
        8
      },
      Arg::Ptr(v) => {
        out[..8].copy_from_slice(&(*v as u64).to_le_bytes());
        8
      },
      Arg::Str(s) => {
        out[..4].copy_from_slice(&(s.len() as u32).to_le_bytes());
        out[4..4 + s.len()].copy_from_slice(s.as_bytes());
        4 + s.len()
      },
      Arg::WideStr(w) => {
        out[..4].copy_from_slice(&(w.len() as u32).to_le_bytes());
        for (i, unit) in w.iter().enumerate() {
          out[4 + 2 * i..4 + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
        }
        4 + 2 * w.len()
      },
    }
  }
}

impl From<u8> for Arg<'_> {
  fn from(v: u8) -> Self {
    Arg::U8(v)
  }
}
impl From<u16> for Arg<'_> {
  fn from(v: u16) -> Self {
    Arg::U16(v)
  }
}
impl From<u32> for Arg<'_> {
  fn from(v: u32) -> Self {
    Arg::U32(v)
  }
}
impl From<u64> for Arg<'_> {
  fn from(v: u64) -> Self {
    Arg::U64(v)
  }
}
impl From<i8> for Arg<'_> {
  fn from(v: i8) -> Self {
    Arg::I8(v)
  }
}
impl From<i16> for Arg<'_> {
  fn from(v: i16) -> Self {
    Arg::I16(v)
  }
}
impl From<i32> for Arg<'_> {
  fn from(v: i32) -> Self {
    Arg::I32(v)
  }
}
impl From<i64> for Arg<'_> {
  fn from(v: i64) -> Self {
    Arg::I64(v)
  }
}
impl From<f32> for Arg<'_> {
  fn from(v: f32) -> Self {
    Arg::F32(v)
  }
}
impl From<f64> for Arg<'_> {
  fn from(v: f64) -> Self {
    Arg::F64(v)
  }
}
impl From<char> for Arg<'_> {
  fn from(v: char) -> Self {
    Arg::U32(v as u32)
  }
}
impl<'a> From<&'a str> for Arg<'a> {
  fn from(v: &'a str) -> Self {
    Arg::Str(v)
  }
}
impl<'a> From<&'a String> for Arg<'a> {
  fn from(v: &'a String) -> Self {
    Arg::Str(v.as_str())
  }
}
impl<'a> From<&'a [u16]> for Arg<'a> {
  fn from(v: &'a [u16]) -> Self {
    Arg::WideStr(v)
  }
}
impl<'a, T> From<*const T> for Arg<'a> {
  fn from(v: *const T) -> Self {
    Arg::Ptr(v as usize)
  }
}
impl<'a, T> From<*mut T> for Arg<'a> {
  fn from(v: *mut T) -> Self {
    Arg::Ptr(v as usize)
  }
}

/// One parameter of a registered site: its raw storage kind plus the role
/// the format string assigns to it.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
  pub kind: ParamKind,
  pub role: ParamRole,
}

/// A contiguous piece of the format string ending at (and including) one
/// argument specifier; the final fragment may carry no argument.
#[derive(Debug, Clone)]
pub struct Fragment {
  pub text: String,
  pub arg_kind: Option<ParamKind>,
  pub has_dynamic_width: bool,
  pub has_dynamic_precision: bool,
}

/// Static descriptor baked into every `nslog!` expansion.
#[derive(Debug)]
pub struct SiteDescriptor {
  pub format: &'static str,
  pub file: &'static str,
  pub line: u32,
  pub severity: Level,
}

/// Immutable metadata for a registered site.
pub struct SiteMeta {
  pub id: u32,
  pub format: &'static str,
  pub file: &'static str,
  pub line: u32,
  pub severity: Level,
  pub params: SmallVec<[ParamSpec; 8]>,
  pub fragments: Vec<Fragment>,
  pub num_nibbles: u8,
  /// Consumer-side compaction entry point, specialized per site through
  /// the parameter table it closes over.
  pub compact: CompactFn,
}

impl std::fmt::Debug for SiteMeta {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SiteMeta")
      .field("id", &self.id)
      .field("format", &self.format)
      .field("file", &self.file)
      .field("line", &self.line)
      .field("severity", &self.severity)
      .field("num_nibbles", &self.num_nibbles)
      .finish()
  }
}

/// Per-call-site registration slot. Id zero means unassigned.
pub struct SiteSlot {
  id: AtomicU32,
  pub descriptor: SiteDescriptor,
}

impl SiteSlot {
  pub const fn new(format: &'static str, file: &'static str, line: u32, severity: Level) -> Self {
    Self {
      id: AtomicU32::new(0),
      descriptor: SiteDescriptor {
        format,
        file,
        line,
        severity,
      },
    }
  }

  /// Returns this site's id, registering it on the first call.
  #[inline]
  pub fn get_or_register(&self, args: &[Arg<'_>]) -> u32 {
    let id = self.id.load(Ordering::Acquire);
    if id != 0 {
      return id;
    }
    self.register_slow(args)
  }

  #[cold]
  fn register_slow(&self, args: &[Arg<'_>]) -> u32 {
    let kinds: SmallVec<[ParamKind; 8]> = args.iter().map(Arg::kind).collect();
    let new_id = Registry::global().register(&self.descriptor, &kinds);

    // Another thread may have registered concurrently; first store wins
    // and the loser's id simply stays unused.
    match self
      .id
      .compare_exchange(0, new_id, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => new_id,
      Err(existing) => existing,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
  UnterminatedSpecifier,
  UnsupportedSpecifier(char),
}

impl std::fmt::Display for FormatError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FormatError::UnterminatedSpecifier => write!(f, "format string ends inside a specifier"),
      FormatError::UnsupportedSpecifier(c) => write!(f, "unsupported specifier '%{c}'"),
    }
  }
}

impl std::error::Error for FormatError {}

/// Result of analyzing a format string: the parameter roles in argument
/// order, plus the fragments the dictionary will carry.
#[derive(Debug)]
pub struct Analysis {
  pub roles: Vec<ParamRole>,
  pub fragments: Vec<AnalyzedFragment>,
}

#[derive(Debug)]
pub struct AnalyzedFragment {
  pub text: String,
  pub has_arg: bool,
  pub arg_is_string: bool,
  pub has_dynamic_width: bool,
  pub has_dynamic_precision: bool,
}

fn is_terminal(c: u8) -> bool {
  matches!(
    c,
    b'd'
      | b'i'
      | b'u'
      | b'o'
      | b'x'
      | b'X'
      | b'f'
      | b'F'
      | b'e'
      | b'E'
      | b'g'
      | b'G'
      | b'a'
      | b'A'
      | b'c'
      | b'p'
      | b's'
  )
}

/// Printf-style scan of a static format string. Each specifier yields one
/// fragment and one to three parameter roles (dynamic width, dynamic
/// precision, then the value itself). `%%` stays literal text.
pub fn analyze_format(fmt: &str) -> Result<Analysis, FormatError> {
  let bytes = fmt.as_bytes();
  let mut roles = Vec::new();
  let mut fragments = Vec::new();
  let mut frag_start = 0usize;
  let mut i = 0usize;

  while i < bytes.len() {
    if bytes[i] != b'%' {
      i += 1;
      continue;
    }
    i += 1;
    if i < bytes.len() && bytes[i] == b'%' {
      i += 1;
      continue;
    }

    while i < bytes.len() && matches!(bytes[i], b'-' | b'+' | b' ' | b'#' | b'0') {
      i += 1;
    }

    let mut has_dynamic_width = false;
    if i < bytes.len() && bytes[i] == b'*' {
      has_dynamic_width = true;
      i += 1;
    } else {
      while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
      }
    }

    let mut has_dynamic_precision = false;
    let mut fixed_precision: Option<u32> = None;
    if i < bytes.len() && bytes[i] == b'.' {
      i += 1;
      if i < bytes.len() && bytes[i] == b'*' {
        has_dynamic_precision = true;
        i += 1;
      } else {
        let mut value = 0u32;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
          value = value * 10 + (bytes[i] - b'0') as u32;
          i += 1;
        }
        // "%.s" means precision zero, per printf.
        fixed_precision = Some(value);
      }
    }

    while i < bytes.len() && matches!(bytes[i], b'h' | b'l' | b'j' | b'z' | b't' | b'L') {
      i += 1;
    }

    if i >= bytes.len() {
      return Err(FormatError::UnterminatedSpecifier);
    }
    let terminal = bytes[i];
    i += 1;
    if !is_terminal(terminal) {
      return Err(FormatError::UnsupportedSpecifier(terminal as char));
    }

    if has_dynamic_width {
      roles.push(ParamRole::DynamicWidth);
    }
    if has_dynamic_precision {
      roles.push(ParamRole::DynamicPrecision);
    }
    let arg_is_string = terminal == b's';
    roles.push(if arg_is_string {
      if has_dynamic_precision {
        ParamRole::StringDynamicPrecision
      } else if let Some(n) = fixed_precision {
        ParamRole::StringFixed(n)
      } else {
        ParamRole::StringNoPrecision
      }
    } else {
      ParamRole::NonString
    });

    fragments.push(AnalyzedFragment {
      text: fmt[frag_start..i].to_string(),
      has_arg: true,
      arg_is_string,
      has_dynamic_width,
      has_dynamic_precision,
    });
    frag_start = i;
  }

  if frag_start < bytes.len() || fragments.is_empty() {
    fragments.push(AnalyzedFragment {
      text: fmt[frag_start..].to_string(),
      has_arg: false,
      arg_is_string: false,
      has_dynamic_width: false,
      has_dynamic_precision: false,
    });
  }

  Ok(Analysis { roles, fragments })
}

/// Returned by `serialize_dictionary` when not even one pending record fits
/// into the remaining output space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldOverflow;

/// Process-wide, append-only site table. Ids are dense from 1 and never
/// reused; metadata is immutable once registered.
pub struct Registry {
  sites: RwLock<Vec<Arc<SiteMeta>>>,
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
  fn new() -> Self {
    Self {
      sites: RwLock::new(Vec::new()),
    }
  }

  pub fn global() -> &'static Registry {
    GLOBAL_REGISTRY.get_or_init(Registry::new)
  }

  /// Registers a site, merging the format analysis with the kinds of the
  /// actual arguments. Mismatches between the format string and the
  /// arguments are programmer bugs and panic with the site location.
  pub fn register(&self, descriptor: &SiteDescriptor, kinds: &[ParamKind]) -> u32 {
    let at = |msg: &str| -> String {
      format!(
        "{} at {}:{} (format {:?})",
        msg, descriptor.file, descriptor.line, descriptor.format
      )
    };

    let analysis =
      analyze_format(descriptor.format).unwrap_or_else(|e| panic!("{}: {e}", at("bad format string")));

    assert_eq!(
      analysis.roles.len(),
      kinds.len(),
      "{}",
      at("format specifier count does not match argument count")
    );

    let mut params: SmallVec<[ParamSpec; 8]> = SmallVec::new();
    let mut num_nibbles = 0u8;
    for (kind, role) in kinds.iter().zip(analysis.roles.iter()) {
      match role {
        ParamRole::NonString => {
          assert!(!kind.is_string(), "{}", at("string argument for a scalar specifier"));
          num_nibbles += 1;
        },
        ParamRole::DynamicWidth | ParamRole::DynamicPrecision => {
          assert!(
            matches!(kind, ParamKind::I32 | ParamKind::U32),
            "{}",
            at("dynamic width/precision arguments must be 32-bit integers")
          );
          num_nibbles += 1;
        },
        _ => {
          assert!(kind.is_string(), "{}", at("scalar argument for a string specifier"));
        },
      }
      params.push(ParamSpec {
        kind: *kind,
        role: *role,
      });
    }

    // Attach the main argument's kind to each fragment for the dictionary.
    let mut param_index = 0usize;
    let fragments: Vec<Fragment> = analysis
      .fragments
      .iter()
      .map(|frag| {
        let arg_kind = if frag.has_arg {
          if frag.has_dynamic_width {
            param_index += 1;
          }
          if frag.has_dynamic_precision {
            param_index += 1;
          }
          let kind = params[param_index].kind;
          param_index += 1;
          Some(kind)
        } else {
          None
        };
        Fragment {
          text: frag.text.clone(),
          arg_kind,
          has_dynamic_width: frag.has_dynamic_width,
          has_dynamic_precision: frag.has_dynamic_precision,
        }
      })
      .collect();

    assert!(fragments.len() <= u8::MAX as usize, "{}", at("too many fragments"));

    let mut sites = self.sites.write().unwrap();
    let id = sites.len() as u32 + 1;
    sites.push(Arc::new(SiteMeta {
      id,
      format: descriptor.format,
      file: descriptor.file,
      line: descriptor.line,
      severity: descriptor.severity,
      params,
      fragments,
      num_nibbles,
      compact: encoder::compact_args,
    }));
    id
  }

  pub fn lookup(&self, id: u32) -> Option<Arc<SiteMeta>> {
    if id == 0 {
      return None;
    }
    self.sites.read().unwrap().get(id as usize - 1).cloned()
  }

  /// Highest id registered so far.
  pub fn high_water(&self) -> u32 {
    self.sites.read().unwrap().len() as u32
  }

  /// Appends dictionary records for sites `from_id..` that fit within
  /// `limit` total output bytes. Returns the first id left unserialized;
  /// fails only when the very next record cannot fit at all.
  pub fn serialize_dictionary(
    &self,
    from_id: u32,
    out: &mut Vec<u8>,
    limit: usize,
  ) -> Result<u32, WouldOverflow> {
    let sites = self.sites.read().unwrap();
    let mut next = from_id.max(1);
    let mut wrote_any = false;

    while (next as usize) <= sites.len() {
      let site = &sites[next as usize - 1];
      let record_len = dictionary_record_len(site);
      if out.len() + record_len > limit {
        return if wrote_any { Ok(next) } else { Err(WouldOverflow) };
      }
      write_dictionary_record(site, out);
      wrote_any = true;
      next += 1;
    }

    Ok(next)
  }
}

fn dictionary_record_len(site: &SiteMeta) -> usize {
  let mut len = 9 + site.file.len() + 1;
  for frag in &site.fragments {
    len += 7 + frag.text.len() + 1;
  }
  len
}

// FormatMetadata { num_nibbles, num_fragments, log_level, line, filename_len }
// + filename NUL, then one PrintFragment { arg_type, has_dynamic_width,
// has_dynamic_precision, fragment_length } + text NUL per fragment.
fn write_dictionary_record(site: &SiteMeta, out: &mut Vec<u8>) {
  out.push(site.num_nibbles);
  out.push(site.fragments.len() as u8);
  out.push(site.severity as u8);
  out.extend_from_slice(&site.line.to_le_bytes());
  out.extend_from_slice(&(site.file.len() as u16).to_le_bytes());
  out.extend_from_slice(site.file.as_bytes());
  out.push(0);

  for frag in &site.fragments {
    out.push(frag.arg_kind.map(|k| k as u8).unwrap_or(0));
    out.push(frag.has_dynamic_width as u8);
    out.push(frag.has_dynamic_precision as u8);
    out.extend_from_slice(&(frag.text.len() as u32).to_le_bytes());
    out.extend_from_slice(frag.text.as_bytes());
    out.push(0);
  }
}
