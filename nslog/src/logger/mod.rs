//! The runtime logger: ring fleet, background consumer, and user API.
//!
//! Producer threads get a lazily-created staging ring on their first log
//! call and write raw entries straight into it. One background consumer
//! scans the rings round-robin, compacts whatever it finds through the
//! encoder, and hands filled buffers to the file writer. The consumer is
//! driven by a small control channel: it waits there with a bounded
//! timeout when idle, and `sync`, file swaps, and shutdown all arrive as
//! messages.
//!
//! A process-wide default instance backs the `nslog!` macro; tests build
//! their own [`Logger`] values with their own output files.


use std::cell::RefCell;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use smallvec::SmallVec;

use crate::cycles;
use crate::encoder::Encoder;
use crate::site::{Arg, Level, Registry, SiteSlot};
use crate::staging::{self, StagingBuffer};
use crate::wire::{Checkpoint, RawHeader, RAW_HEADER_BYTES};
use crate::writer::FileWriter;

/// Runtime configuration. Everything is programmatic; there are no
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
  pub output_file: PathBuf,
  pub staging_buffer_size: usize,
  pub output_buffer_size: usize,
  /// Bytes encoded per ring before the consumer moves on, so one chatty
  /// thread cannot monopolize a pass.
  pub release_threshold: usize,
  /// How long the idle consumer sleeps on its control channel.
  pub poll_interval: Duration,
  /// Producers spin when their ring is full instead of dropping the line.
  pub blocking_producers: bool,
  pub async_io: bool,
  pub direct_io: bool,
  pub compression: bool,
  pub default_level: Level,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      output_file: PathBuf::from("/tmp/nslog.bin"),
      staging_buffer_size: staging::DEFAULT_CAPACITY,
      output_buffer_size: 8 << 20,
      release_threshold: 64 << 10,
      poll_interval: Duration::from_micros(100),
      blocking_producers: true,
      async_io: true,
      direct_io: false,
      compression: false,
      default_level: Level::Notice,
    }
  }
}

/// Control messages for the consumer thread.
enum Message {
  /// Ack once a full pass after this point finds no unconsumed data.
  Sync(Sender<()>),
  /// Finish the current pass, flush, and exit.
  Shutdown,
}

#[derive(Debug, Default)]
pub struct Metrics {
  pub total_bytes_read: AtomicU64,
  pub total_bytes_written: AtomicU64,
  pub pad_bytes_written: AtomicU64,
  pub events_processed: AtomicU64,
  pub async_writes_completed: AtomicU64,
  pub async_writes_failed: AtomicU64,
  pub unknown_site_entries: AtomicU64,
  pub cycles_encoding: AtomicU64,
  pub cycles_flushing: AtomicU64,
  pub cycles_awake: AtomicU64,
}

struct Shared {
  logger_id: u64,
  config: Config,
  current_path: Mutex<PathBuf>,
  rings: Mutex<Vec<Arc<StagingBuffer>>>,
  next_ring_id: AtomicU32,
  level: AtomicU8,
  metrics: Metrics,
  /// Base address for pointer-argument rebasing, captured at init.
  relative_pointer: u64,
}

/// A complete logging runtime instance. Dropping it syncs, stops the
/// consumer, and flushes the output file.
pub struct Logger {
  shared: Arc<Shared>,
  control: Mutex<Sender<Message>>,
  consumer: Mutex<Option<JoinHandle<()>>>,
}

static NEXT_LOGGER_ID: AtomicU64 = AtomicU64::new(1);

// Anchor for pointer rebasing; its address is stable for the process
// lifetime and recorded in every checkpoint.
static POINTER_ANCHOR: u8 = 0;

impl Logger {
  /// Builds the runtime and spawns its consumer thread. Fails only when
  /// the output file cannot be opened.
  pub fn new(config: Config) -> io::Result<Logger> {
    cycles::init();
    let writer = FileWriter::create(
      &config.output_file,
      config.async_io,
      config.direct_io,
      config.compression,
    )?;
    let relative_pointer = &POINTER_ANCHOR as *const u8 as u64;
    // Anchor the file's checkpoint now, before any producer can record,
    // so every entry's timestamp lands at or after it.
    let anchor = Checkpoint::capture(relative_pointer);

    let shared = Arc::new(Shared {
      logger_id: NEXT_LOGGER_ID.fetch_add(1, Ordering::Relaxed),
      current_path: Mutex::new(config.output_file.clone()),
      rings: Mutex::new(Vec::new()),
      next_ring_id: AtomicU32::new(0),
      level: AtomicU8::new(config.default_level as u8),
      metrics: Metrics::default(),
      relative_pointer,
      config,
    });

    let (control_tx, control_rx) = bounded(64);
    let handle = spawn_consumer(Arc::clone(&shared), control_rx, writer, anchor);

    Ok(Logger {
      shared,
      control: Mutex::new(control_tx),
      consumer: Mutex::new(Some(handle)),
    })
  }

  #[inline]
  pub fn level(&self) -> Level {
    Level::from_u8(self.shared.level.load(Ordering::Relaxed))
  }

  /// Log expansions compare against this before touching their ring.
  #[inline]
  pub fn enabled(&self, severity: Level) -> bool {
    severity as u8 <= self.shared.level.load(Ordering::Relaxed)
  }

  pub fn set_log_level(&self, level: Level) {
    self.shared.level.store(level as u8, Ordering::Relaxed);
  }

  /// Hot path: write one raw entry into this thread's staging ring.
  #[inline]
  pub fn record(&self, site: &SiteSlot, args: &[Arg<'_>]) {
    if !self.enabled(site.descriptor.severity) {
      return;
    }
    let site_id = site.get_or_register(args);
    let args_size: usize = args.iter().map(Arg::recorded_size).sum();
    let entry_size = RAW_HEADER_BYTES + args_size;

    self.with_ring(|ring| {
      let ptr = if self.shared.config.blocking_producers {
        ring.reserve(entry_size)
      } else {
        match ring.try_reserve(entry_size) {
          Some(ptr) => ptr,
          // Ring full: the line is dropped and counted.
          None => return,
        }
      };

      // SAFETY: reserve returned entry_size contiguous writable bytes that
      // only this thread touches until commit.
      let entry = unsafe { std::slice::from_raw_parts_mut(ptr, entry_size) };
      RawHeader {
        site_id,
        timestamp: cycles::rdtsc(),
        entry_size: entry_size as u32,
      }
      .write_to(entry);

      let mut offset = RAW_HEADER_BYTES;
      for arg in args {
        offset += arg.record_into(&mut entry[offset..]);
      }
      debug_assert_eq!(offset, entry_size);
      ring.commit(entry_size);
    });
  }

  /// Touches this thread's ring so the allocation happens outside any
  /// latency-critical section.
  pub fn preallocate(&self) {
    self.with_ring(|_| {});
  }

  /// Blocks until the consumer completes a full pass over all rings that
  /// finds no unconsumed data, with everything encoded so far flushed.
  pub fn sync(&self) {
    let (ack_tx, ack_rx) = bounded(1);
    if self
      .control
      .lock()
      .unwrap()
      .send(Message::Sync(ack_tx))
      .is_err()
    {
      return;
    }
    let _ = ack_rx.recv();
  }

  /// Swaps the output file: the new path is opened first so errors surface
  /// before the current consumer is disturbed, then the consumer is
  /// stopped and relaunched against the new file.
  pub fn set_log_file(&self, path: impl Into<PathBuf>) -> io::Result<()> {
    let path = path.into();
    let config = &self.shared.config;
    let writer = FileWriter::create(&path, config.async_io, config.direct_io, config.compression)?;
    // The new file's anchor, taken before entries can outrun it.
    let anchor = Checkpoint::capture(self.shared.relative_pointer);

    self.sync();
    self.stop_consumer();

    *self.shared.current_path.lock().unwrap() = path;
    let (control_tx, control_rx) = bounded(64);
    let handle = spawn_consumer(Arc::clone(&self.shared), control_rx, writer, anchor);
    *self.control.lock().unwrap() = control_tx;
    *self.consumer.lock().unwrap() = Some(handle);
    Ok(())
  }

  /// Cooperative shutdown: drain what producers have committed, stop the
  /// consumer, flush the file. Also runs on drop.
  pub fn shutdown(&self) {
    self.sync();
    self.stop_consumer();
  }

  fn stop_consumer(&self) {
    let _ = self.control.lock().unwrap().send(Message::Shutdown);
    if let Some(handle) = self.consumer.lock().unwrap().take() {
      let _ = handle.join();
    }
  }

  pub fn metrics(&self) -> &Metrics {
    &self.shared.metrics
  }

  /// Number of live staging rings.
  pub fn ring_count(&self) -> usize {
    self.shared.rings.lock().unwrap().len()
  }

  /// Counter snapshot for every live ring.
  pub fn ring_stats(&self) -> Vec<staging::RingStats> {
    self
      .shared
      .rings
      .lock()
      .unwrap()
      .iter()
      .map(|ring| ring.stats())
      .collect()
  }

  /// Human-readable statistics report.
  pub fn get_stats(&self) -> String {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct Row {
      metric: &'static str,
      value: String,
    }

    let m = &self.shared.metrics;
    let events = m.events_processed.load(Ordering::Relaxed);
    let bytes_read = m.total_bytes_read.load(Ordering::Relaxed);
    let bytes_written = m.total_bytes_written.load(Ordering::Relaxed);
    let pad_bytes = m.pad_bytes_written.load(Ordering::Relaxed);

    let (mut allocations, mut blocked, mut blocked_cycles) = (0u64, 0u64, 0u64);
    for ring in self.shared.rings.lock().unwrap().iter() {
      let stats = ring.stats();
      allocations += stats.num_allocations;
      blocked += stats.num_times_producer_blocked;
      blocked_cycles += stats.cycles_producer_blocked;
    }

    let compression_ratio = if bytes_written + pad_bytes > 0 {
      bytes_read as f64 / (bytes_written + pad_bytes) as f64
    } else {
      0.0
    };

    let rows = vec![
      Row {
        metric: "events processed",
        value: events.to_string(),
      },
      Row {
        metric: "bytes read from rings",
        value: bytes_read.to_string(),
      },
      Row {
        metric: "bytes written",
        value: bytes_written.to_string(),
      },
      Row {
        metric: "pad bytes written",
        value: pad_bytes.to_string(),
      },
      Row {
        metric: "compression ratio",
        value: format!("{compression_ratio:.2}x"),
      },
      Row {
        metric: "async writes completed",
        value: m.async_writes_completed.load(Ordering::Relaxed).to_string(),
      },
      Row {
        metric: "async writes failed",
        value: m.async_writes_failed.load(Ordering::Relaxed).to_string(),
      },
      Row {
        metric: "entries with unknown site",
        value: m.unknown_site_entries.load(Ordering::Relaxed).to_string(),
      },
      Row {
        metric: "ring reservations",
        value: allocations.to_string(),
      },
      Row {
        metric: "producer blocked/dropped",
        value: blocked.to_string(),
      },
      Row {
        metric: "seconds producers blocked",
        value: format!("{:.6}", cycles::to_seconds(blocked_cycles)),
      },
      Row {
        metric: "seconds encoding",
        value: format!(
          "{:.6}",
          cycles::to_seconds(m.cycles_encoding.load(Ordering::Relaxed))
        ),
      },
      Row {
        metric: "seconds flushing",
        value: format!(
          "{:.6}",
          cycles::to_seconds(m.cycles_flushing.load(Ordering::Relaxed))
        ),
      },
      Row {
        metric: "seconds consumer awake",
        value: format!(
          "{:.6}",
          cycles::to_seconds(m.cycles_awake.load(Ordering::Relaxed))
        ),
      },
    ];

    Table::new(rows).to_string()
  }

  /// Prints the active configuration to stdout.
  pub fn print_config(&self) {
    let config = &self.shared.config;
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    println!("==== nslog configuration ====");
    println!("host              : {hostname}");
    println!(
      "output            : {}",
      self.shared.current_path.lock().unwrap().display()
    );
    println!(
      "staging ring size : {:.3} KB",
      config.staging_buffer_size as f64 / 1000.0
    );
    println!(
      "output buffer size: {:.3} MB",
      config.output_buffer_size as f64 / 1_000_000.0
    );
    println!(
      "release threshold : {:.3} KB",
      config.release_threshold as f64 / 1000.0
    );
    println!("idle poll interval: {:?}", config.poll_interval);
    println!(
      "producers         : {}",
      if config.blocking_producers {
        "blocking"
      } else {
        "dropping"
      }
    );
    println!(
      "async I/O         : {}",
      if config.async_io { "enabled" } else { "disabled" }
    );
    println!(
      "direct I/O        : {}",
      if config.direct_io { "enabled" } else { "disabled" }
    );
    println!(
      "compression       : {}",
      if config.compression { "enabled" } else { "disabled" }
    );
    println!(
      "counter frequency : {:.0} ticks/sec",
      cycles::per_second()
    );
  }

  fn with_ring<R>(&self, f: impl FnOnce(&StagingBuffer) -> R) -> R {
    THREAD_RINGS.with(|cell| {
      let mut thread_rings = cell.borrow_mut();
      let ring = thread_rings.get_or_create(&self.shared);
      f(ring.as_ref())
    })
  }
}

impl Drop for Logger {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Rings this thread owns, one per live logger instance. The drop guard
/// runs at thread exit and marks them so the consumer can reclaim them
/// after draining.
struct ThreadRings {
  entries: SmallVec<[(u64, Arc<StagingBuffer>); 2]>,
}

impl ThreadRings {
  fn get_or_create(&mut self, shared: &Arc<Shared>) -> &Arc<StagingBuffer> {
    let index = match self
      .entries
      .iter()
      .position(|(id, _)| *id == shared.logger_id)
    {
      Some(index) => index,
      None => {
        let ring_id = shared.next_ring_id.fetch_add(1, Ordering::Relaxed);
        let ring = Arc::new(StagingBuffer::new(ring_id, shared.config.staging_buffer_size));
        shared.rings.lock().unwrap().push(Arc::clone(&ring));
        self.entries.push((shared.logger_id, ring));
        self.entries.len() - 1
      },
    };
    &self.entries[index].1
  }
}

impl Drop for ThreadRings {
  fn drop(&mut self) {
    for (_, ring) in &self.entries {
      ring.mark_for_deletion();
    }
  }
}

thread_local! {
  static THREAD_RINGS: RefCell<ThreadRings> = RefCell::new(ThreadRings {
    entries: SmallVec::new(),
  });
}

fn spawn_consumer(
  shared: Arc<Shared>,
  control: Receiver<Message>,
  writer: FileWriter,
  anchor: Checkpoint,
) -> JoinHandle<()> {
  std::thread::Builder::new()
    .name("nslog-consumer".into())
    .spawn(move || consumer_main(shared, control, writer, anchor))
    .expect("failed to spawn the consumer thread")
}

fn consumer_main(
  shared: Arc<Shared>,
  control: Receiver<Message>,
  mut writer: FileWriter,
  anchor: Checkpoint,
) {
  let mut encoder = Encoder::new(shared.config.output_buffer_size, anchor);
  encoder.begin_file();

  let mut spare: Option<Vec<u8>> = Some(Vec::with_capacity(shared.config.output_buffer_size));
  let mut sync_waiters: Vec<Sender<()>> = Vec::new();
  // A sync acks only after one further full pass finds nothing new.
  let mut sync_armed = false;
  let mut last_worked: Option<u32> = None;
  let mut should_exit = false;
  let mut awake_start = cycles::rdtsc();

  loop {
    while let Ok(message) = control.try_recv() {
      match message {
        Message::Sync(ack) => sync_waiters.push(ack),
        Message::Shutdown => should_exit = true,
      }
    }

    // One round-robin pass, starting just past the last productive ring.
    let rings: Vec<Arc<StagingBuffer>> = shared.rings.lock().unwrap().clone();
    let start = match last_worked.and_then(|id| rings.iter().position(|r| r.id() == id)) {
      Some(position) => (position + 1) % rings.len().max(1),
      None => 0,
    };

    let mut bytes_this_pass = 0usize;
    let mut output_full = false;
    let mut dead_rings: Vec<u32> = Vec::new();

    for step in 0..rings.len() {
      let index = (start + step) % rings.len();
      if index == 0 && step > 0 {
        encoder.note_scan_wrap();
      }
      let ring = &rings[index];

      // Bound this ring's turn by what it held when its turn started, so a
      // producer that keeps committing cannot starve the other rings.
      let budget = ring.peek().len();
      if budget == 0 {
        if ring.marked_for_deletion() {
          dead_rings.push(ring.id());
        }
        continue;
      }

      let encode_start = cycles::rdtsc();
      let mut ring_bytes = 0usize;
      while ring_bytes < budget {
        // Re-peek after every consume; released bytes go back to the
        // producer and must not stay visible here.
        let view = ring.peek();
        if view.is_empty() {
          break;
        }
        let end = view.len().min(shared.config.release_threshold);
        let mut pass = encoder.encode_log_msgs(&view[..end], ring.id(), Registry::global());
        if pass.consumed == 0 && end < view.len() {
          // The chunk boundary may have split an entry; retry unchunked.
          pass = encoder.encode_log_msgs(view, ring.id(), Registry::global());
        }

        shared
          .metrics
          .events_processed
          .fetch_add(pass.events, Ordering::Relaxed);

        if pass.consumed == 0 {
          output_full = true;
          break;
        }
        ring.consume(pass.consumed);
        ring_bytes += pass.consumed;
        bytes_this_pass += pass.consumed;
      }
      shared
        .metrics
        .total_bytes_read
        .fetch_add(ring_bytes as u64, Ordering::Relaxed);
      shared
        .metrics
        .cycles_encoding
        .fetch_add(cycles::rdtsc().wrapping_sub(encode_start), Ordering::Relaxed);

      if ring_bytes > 0 {
        last_worked = Some(ring.id());
      }
      if output_full {
        break;
      }
    }

    if !dead_rings.is_empty() {
      shared
        .rings
        .lock()
        .unwrap()
        .retain(|ring| !dead_rings.contains(&ring.id()));
    }

    // Flush whatever got encoded; full buffers loop straight back into the
    // scan, completed scans go through the idle path below.
    if encoder.encoded_bytes() > 0 {
      flush(&shared, &mut encoder, &mut writer, &mut spare);
    }
    shared.metrics.unknown_site_entries.store(
      encoder.unknown_site_entries,
      Ordering::Relaxed,
    );

    if should_exit && bytes_this_pass == 0 && !output_full {
      break;
    }

    if bytes_this_pass == 0 && !output_full && !should_exit {
      if sync_armed {
        // The extra pass found nothing; drain in-flight I/O so the file
        // really holds everything up to the sync request, then ack.
        writer.wait_for_outstanding();
        for ack in sync_waiters.drain(..) {
          let _ = ack.send(());
        }
        sync_armed = false;
        continue;
      }
      if !sync_waiters.is_empty() {
        sync_armed = true;
        continue;
      }

      shared
        .metrics
        .cycles_awake
        .fetch_add(cycles::rdtsc().wrapping_sub(awake_start), Ordering::Relaxed);
      match control.recv_timeout(shared.config.poll_interval) {
        Ok(Message::Sync(ack)) => sync_waiters.push(ack),
        Ok(Message::Shutdown) => should_exit = true,
        Err(RecvTimeoutError::Timeout) => {},
        Err(RecvTimeoutError::Disconnected) => should_exit = true,
      }
      awake_start = cycles::rdtsc();
    } else {
      sync_armed = false;
    }
  }

  writer.shutdown();
  shared.metrics.total_bytes_written.store(writer.bytes_written, Ordering::Relaxed);
  shared
    .metrics
    .pad_bytes_written
    .store(writer.pad_bytes_written, Ordering::Relaxed);
  shared
    .metrics
    .async_writes_completed
    .store(writer.writes_completed, Ordering::Relaxed);
  shared
    .metrics
    .async_writes_failed
    .store(writer.writes_failed(), Ordering::Relaxed);

  for ack in sync_waiters.drain(..) {
    let _ = ack.send(());
  }
  shared
    .metrics
    .cycles_awake
    .fetch_add(cycles::rdtsc().wrapping_sub(awake_start), Ordering::Relaxed);
}

fn flush(
  shared: &Arc<Shared>,
  encoder: &mut Encoder,
  writer: &mut FileWriter,
  spare: &mut Option<Vec<u8>>,
) {
  let flush_start = cycles::rdtsc();

  // The double buffer must be free before we take it over.
  writer.wait_for_outstanding();
  let replacement = spare
    .take()
    .or_else(|| writer.reclaim_buffer())
    .unwrap_or_else(|| Vec::with_capacity(shared.config.output_buffer_size));
  let filled = encoder.swap_buffer(replacement);
  writer.submit(filled);
  *spare = writer.reclaim_buffer();

  shared
    .metrics
    .total_bytes_written
    .store(writer.bytes_written, Ordering::Relaxed);
  shared
    .metrics
    .pad_bytes_written
    .store(writer.pad_bytes_written, Ordering::Relaxed);
  shared
    .metrics
    .async_writes_completed
    .store(writer.writes_completed, Ordering::Relaxed);
  shared
    .metrics
    .async_writes_failed
    .store(writer.writes_failed(), Ordering::Relaxed);
  shared
    .metrics
    .cycles_flushing
    .fetch_add(cycles::rdtsc().wrapping_sub(flush_start), Ordering::Relaxed);
}

static DEFAULT_LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the process-wide default logger, initializing it with
/// `Config::default()` on first use.
pub fn default_logger() -> &'static Logger {
  DEFAULT_LOGGER.get_or_init(|| {
    Logger::new(Config::default()).expect(
      "nslog could not open the default log file; \
       call init_with() with a writable path before logging",
    )
  })
}

/// Installs the default logger with an explicit configuration. Returns the
/// logger, or an error when one was already installed.
pub fn init_with(config: Config) -> Result<&'static Logger, AlreadyInitialized> {
  let mut fresh = false;
  let logger = DEFAULT_LOGGER.get_or_init(|| {
    fresh = true;
    Logger::new(config).expect("nslog could not open the configured log file")
  });
  if fresh {
    Ok(logger)
  } else {
    Err(AlreadyInitialized)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyInitialized;

impl std::fmt::Display for AlreadyInitialized {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "the default logger is already initialized")
  }
}

impl std::error::Error for AlreadyInitialized {}

/// Macro entry point: level gate already passed, record to the default
/// logger.
#[inline]
pub fn record_to_default(site: &SiteSlot, args: &[Arg<'_>]) {
  default_logger().record(site, args);
}

/// Macro entry point: is `severity` currently enabled on the default
/// logger?
#[inline]
pub fn log_enabled(severity: Level) -> bool {
  default_logger().enabled(severity)
}

/// Default-logger convenience wrappers mirroring the instance methods.
pub fn sync() {
  default_logger().sync();
}

pub fn set_log_level(level: Level) {
  default_logger().set_log_level(level);
}

pub fn set_log_file(path: impl Into<PathBuf>) -> io::Result<()> {
  default_logger().set_log_file(path)
}

pub fn preallocate() {
  default_logger().preallocate();
}

pub fn get_stats() -> String {
  default_logger().get_stats()
}

pub fn print_config() {
  default_logger().print_config();
}
