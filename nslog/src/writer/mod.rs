//! Output side of the consumer: hands encoded buffers to disk.
//!
//! Three concerns compose here, mirroring the consumer's flush step:
//! direct-I/O alignment (pad the tail with zeros to 512 bytes), optional
//! lz4 block compression (each flush becomes one length-prefixed frame),
//! and asynchronous submission. Async mode runs a dedicated I/O thread;
//! buffers travel to it over a channel and come back on a completion
//! channel once written, which is what makes double buffering work: the
//! consumer can keep encoding into one buffer while the other is in
//! flight.
//!
//! Write failures are reported to stderr and counted; they never stop the
//! consumer.

mod __test__;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::wire;

struct IoThread {
  submit: Sender<Vec<u8>>,
  completed: Receiver<Vec<u8>>,
  handle: Option<JoinHandle<File>>,
  in_flight: usize,
}

pub struct FileWriter {
  /// Present in blocking mode; async mode moves the file into the I/O
  /// thread.
  file: Option<File>,
  io: Option<IoThread>,
  compression: bool,
  direct_io: bool,
  wrote_mode_byte: bool,
  /// Raw buffers available for the consumer to encode into again.
  ready: Vec<Vec<u8>>,
  /// Recycled frame buffers for compression mode.
  frame_pool: Vec<Vec<u8>>,
  pub bytes_written: u64,
  pub pad_bytes_written: u64,
  pub writes_completed: u64,
  writes_failed: Arc<AtomicU64>,
}

impl FileWriter {
  /// Opens (and truncates) the output file. Errors surface to the caller;
  /// this is the one fatal I/O boundary in the system.
  pub fn create(
    path: impl AsRef<Path>,
    async_io: bool,
    direct_io: bool,
    compression: bool,
  ) -> std::io::Result<FileWriter> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(target_os = "linux")]
    if direct_io {
      use std::os::unix::fs::OpenOptionsExt;
      options.custom_flags(libc::O_DIRECT);
    }
    let file = options.open(path)?;

    let writes_failed = Arc::new(AtomicU64::new(0));
    let (file, io) = if async_io {
      let (submit_tx, submit_rx) = bounded::<Vec<u8>>(2);
      let (done_tx, done_rx) = bounded::<Vec<u8>>(2);
      let failed = Arc::clone(&writes_failed);
      let handle = thread::Builder::new()
        .name("nslog-io".into())
        .spawn(move || io_thread_main(file, submit_rx, done_tx, failed))
        .expect("failed to spawn the I/O thread");
      (
        None,
        Some(IoThread {
          submit: submit_tx,
          completed: done_rx,
          handle: Some(handle),
          in_flight: 0,
        }),
      )
    } else {
      (Some(file), None)
    };

    Ok(FileWriter {
      file,
      io,
      compression,
      direct_io,
      wrote_mode_byte: false,
      ready: Vec::new(),
      frame_pool: Vec::new(),
      bytes_written: 0,
      pad_bytes_written: 0,
      writes_completed: 0,
      writes_failed,
    })
  }

  pub fn writes_failed(&self) -> u64 {
    self.writes_failed.load(Ordering::Relaxed)
  }

  /// Submits one encoded buffer. In async mode this returns as soon as the
  /// I/O thread has the buffer; call [`wait_for_outstanding`] before the
  /// next submit to honor the double-buffer protocol.
  ///
  /// [`wait_for_outstanding`]: Self::wait_for_outstanding
  pub fn submit(&mut self, buf: Vec<u8>) {
    let mut io_bytes = if self.compression {
      let compressed = match lz4::block::compress(&buf, None, true) {
        Ok(compressed) => compressed,
        Err(e) => {
          eprintln!("[nslog] lz4 block compression failed, buffer dropped: {e}");
          self.writes_failed.fetch_add(1, Ordering::Relaxed);
          self.ready.push(buf);
          return;
        },
      };
      let mut frame = self.frame_pool.pop().unwrap_or_default();
      frame.clear();
      frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
      frame.extend_from_slice(&compressed);
      // The raw buffer is immediately reusable.
      self.ready.push(buf);
      frame
    } else {
      buf
    };

    if !self.wrote_mode_byte {
      let mut mode = if self.compression {
        wire::FILE_MODE_LZ4
      } else {
        wire::FILE_MODE_RAW
      };
      if self.direct_io {
        mode |= wire::FILE_MODE_ALIGNED;
      }
      io_bytes.insert(0, mode);
      self.wrote_mode_byte = true;
    }

    // Every write must end on an alignment boundary or O_DIRECT rejects
    // it, so pad the final on-disk bytes, not the pre-compression input.
    if self.direct_io {
      let over = io_bytes.len() % wire::WRITE_ALIGNMENT;
      if over != 0 {
        let pad = wire::WRITE_ALIGNMENT - over;
        io_bytes.resize(io_bytes.len() + pad, 0);
        self.pad_bytes_written += pad as u64;
      }
    }

    self.bytes_written += io_bytes.len() as u64;

    match &mut self.io {
      Some(io) => {
        io.in_flight += 1;
        io.submit.send(io_bytes).expect("I/O thread is alive");
      },
      None => {
        let file = self.file.as_mut().expect("blocking writer holds the file");
        if let Err(e) = file.write_all(&io_bytes) {
          eprintln!("[nslog] log write failed: {e}");
          self.writes_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.writes_completed += 1;
        self.recycle(io_bytes);
      },
    }
  }

  /// Blocks until every submitted write has completed, recycling the
  /// returned buffers.
  pub fn wait_for_outstanding(&mut self) {
    if let Some(io) = &mut self.io {
      while io.in_flight > 0 {
        let buf = io.completed.recv().expect("I/O thread is alive");
        io.in_flight -= 1;
        self.writes_completed += 1;
        if self.compression {
          self.frame_pool.push(buf);
        } else {
          self.ready.push(buf);
        }
      }
    }
  }

  fn recycle(&mut self, buf: Vec<u8>) {
    if self.compression {
      self.frame_pool.push(buf);
    } else {
      self.ready.push(buf);
    }
  }

  /// Takes back a drained buffer for reuse, if one is available.
  pub fn reclaim_buffer(&mut self) -> Option<Vec<u8>> {
    self.ready.pop()
  }

  /// Drains outstanding writes, stops the I/O thread, and flushes.
  pub fn shutdown(&mut self) {
    self.wait_for_outstanding();
    if let Some(mut io) = self.io.take() {
      drop(io.submit);
      if let Some(handle) = io.handle.take() {
        if let Ok(file) = handle.join() {
          self.file = Some(file);
        }
      }
    }
    if let Some(file) = &mut self.file {
      let _ = file.flush();
      let _ = file.sync_all();
    }
  }
}

impl Drop for FileWriter {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn io_thread_main(
  mut file: File,
  submit: Receiver<Vec<u8>>,
  completed: Sender<Vec<u8>>,
  writes_failed: Arc<AtomicU64>,
) -> File {
  while let Ok(buf) = submit.recv() {
    if let Err(e) = file.write_all(&buf) {
      eprintln!("[nslog] asynchronous log write failed: {e}");
      writes_failed.fetch_add(1, Ordering::Relaxed);
    }
    // The consumer may have exited without waiting; dropping is fine.
    let _ = completed.send(buf);
  }
  let _ = file.flush();
  file
}
