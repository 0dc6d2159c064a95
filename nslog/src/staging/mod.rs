//! Per-producer staging ring.
//!
//! A fixed-capacity byte ring implementing a single-producer /
//! single-consumer queue. The producer reserves contiguous space, writes a
//! raw entry, then commits; the consumer peeks at committed bytes and
//! consumes them after encoding. An entry never straddles the wrap point:
//! when the contiguous tail is too small the producer publishes
//! `end_of_recorded_space` and restarts from offset zero.
//!
//! All checks against free space use strict inequalities so that
//! `producer_pos == consumer_pos` always means empty; one byte of capacity
//! is sacrificed to keep full and empty distinguishable.


use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::cycles;

/// Default staging ring capacity: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// Fields touched on the producer's hot path, padded away from the
/// consumer's cache line.
struct ProducerHalf {
  /// Offset where the producer may place new data. Release-stored on commit
  /// so the consumer only ever observes completed entries.
  producer_pos: AtomicUsize,
  /// End of valid data for the consumer; set by the producer on a wrap
  /// before `producer_pos` is reset to zero.
  end_of_recorded_space: AtomicUsize,
  /// Lower bound on bytes the producer can take without re-reading
  /// `consumer_pos`. Only the producer touches this.
  min_free_space: AtomicUsize,
  num_allocations: AtomicU64,
  cycles_producer_blocked: AtomicU64,
  num_times_producer_blocked: AtomicU64,
}

/// Counters sampled by `Logger::get_stats`.
#[derive(Debug, Clone, Copy)]
pub struct RingStats {
  pub num_allocations: u64,
  pub cycles_producer_blocked: u64,
  pub num_times_producer_blocked: u64,
}

pub struct StagingBuffer {
  producer: CachePadded<ProducerHalf>,
  /// Offset the consumer reads from next. Only the consumer advances this.
  consumer_pos: CachePadded<AtomicUsize>,
  storage: Box<[UnsafeCell<u8>]>,
  id: u32,
  /// Set by the owning thread's exit guard; the consumer unlinks the ring
  /// once it has been drained.
  should_delete: AtomicBool,
}

// The storage protocol hands each byte range to exactly one side at a time:
// the producer owns [producer_pos, ...) it has reserved, the consumer owns
// [consumer_pos, producer_pos) it has peeked.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
  pub fn new(id: u32, capacity: usize) -> Self {
    assert!(capacity > 0, "staging ring capacity must be nonzero");
    Self {
      producer: CachePadded::new(ProducerHalf {
        producer_pos: AtomicUsize::new(0),
        end_of_recorded_space: AtomicUsize::new(capacity),
        min_free_space: AtomicUsize::new(capacity),
        num_allocations: AtomicU64::new(0),
        cycles_producer_blocked: AtomicU64::new(0),
        num_times_producer_blocked: AtomicU64::new(0),
      }),
      consumer_pos: CachePadded::new(AtomicUsize::new(0)),
      storage: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
      id,
      should_delete: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn id(&self) -> u32 {
    self.id
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.storage.len()
  }

  #[inline]
  fn base(&self) -> *mut u8 {
    self.storage.as_ptr() as *mut u8
  }

  /// Reserves `nbytes` of contiguous writable space without publishing it,
  /// or returns `None` after one pass when the ring is too full. The caller
  /// must `commit` exactly what it wrote.
  #[inline]
  pub fn try_reserve(&self, nbytes: usize) -> Option<*mut u8> {
    let p = &*self.producer;
    // Fast path: strictly less, so a full commit still leaves
    // producer_pos != consumer_pos.
    if nbytes < p.min_free_space.load(Ordering::Relaxed) {
      p.num_allocations.fetch_add(1, Ordering::Relaxed);
      return Some(unsafe { self.base().add(p.producer_pos.load(Ordering::Relaxed)) });
    }
    let ptr = self.reserve_slow(nbytes, false);
    if ptr.is_some() {
      p.num_allocations.fetch_add(1, Ordering::Relaxed);
    } else {
      p.num_times_producer_blocked.fetch_add(1, Ordering::Relaxed);
    }
    ptr
  }

  /// Blocking variant of [`try_reserve`](Self::try_reserve); spins with a
  /// cooperative backoff until the consumer frees space, recording how many
  /// cycles the producer stalled.
  #[inline]
  pub fn reserve(&self, nbytes: usize) -> *mut u8 {
    let p = &*self.producer;
    if nbytes < p.min_free_space.load(Ordering::Relaxed) {
      p.num_allocations.fetch_add(1, Ordering::Relaxed);
      return unsafe { self.base().add(p.producer_pos.load(Ordering::Relaxed)) };
    }

    let start = cycles::rdtsc();
    let ptr = self
      .reserve_slow(nbytes, true)
      .expect("blocking reserve cannot fail");
    p.cycles_producer_blocked
      .fetch_add(cycles::rdtsc().wrapping_sub(start), Ordering::Relaxed);
    p.num_times_producer_blocked.fetch_add(1, Ordering::Relaxed);
    p.num_allocations.fetch_add(1, Ordering::Relaxed);
    ptr
  }

  #[cold]
  fn reserve_slow(&self, nbytes: usize, blocking: bool) -> Option<*mut u8> {
    debug_assert!(nbytes < self.capacity());
    let p = &*self.producer;
    let capacity = self.capacity();
    let backoff = Backoff::new();

    loop {
      // consumer_pos is released by consume(); acquiring it here makes the
      // consumer's reads of any recycled bytes happen-before our writes.
      let consumer = self.consumer_pos.load(Ordering::Acquire);
      let producer = p.producer_pos.load(Ordering::Relaxed);

      if consumer <= producer {
        let tail = capacity - producer;
        if tail > nbytes {
          p.min_free_space.store(tail, Ordering::Relaxed);
          return Some(unsafe { self.base().add(producer) });
        }

        // Not enough space at the end; publish the wrap sentinel. The
        // release on producer_pos below orders this store before the
        // consumer can observe the reset.
        p.end_of_recorded_space.store(producer, Ordering::Release);

        // A wrap that lands on the consumer would make the ring read as
        // empty while full; hold off until the consumer moves.
        if consumer != 0 {
          p.producer_pos.store(0, Ordering::Release);
          let free = consumer;
          if free > nbytes {
            p.min_free_space.store(free, Ordering::Relaxed);
            return Some(self.base());
          }
          p.min_free_space.store(free, Ordering::Relaxed);
        }
      } else {
        let free = consumer - producer;
        if free > nbytes {
          p.min_free_space.store(free, Ordering::Relaxed);
          return Some(unsafe { self.base().add(producer) });
        }
        p.min_free_space.store(free, Ordering::Relaxed);
      }

      if !blocking {
        return None;
      }
      backoff.snooze();
    }
  }

  /// Publishes `nbytes` of previously reserved space to the consumer.
  #[inline]
  pub fn commit(&self, nbytes: usize) {
    let p = &*self.producer;
    let free = p.min_free_space.load(Ordering::Relaxed);
    debug_assert!(nbytes < free, "commit of {nbytes} exceeds reservation of {free}");
    p.min_free_space.store(free - nbytes, Ordering::Relaxed);

    let producer = p.producer_pos.load(Ordering::Relaxed);
    // Release: the entry bytes written since reserve() become visible
    // before the new position does.
    p.producer_pos.store(producer + nbytes, Ordering::Release);
  }

  /// Returns the longest contiguous run of committed, unconsumed bytes.
  /// Call `consume` to release the encoded prefix back to the producer.
  pub fn peek(&self) -> &[u8] {
    // Acquire pairs with the release in commit(): every byte inside the
    // returned region belongs to a fully written entry.
    let producer = self.producer.producer_pos.load(Ordering::Acquire);
    let mut consumer = self.consumer_pos.load(Ordering::Relaxed);

    if producer < consumer {
      // Producer wrapped. The acquire above also ordered the sentinel
      // store, so this read cannot see a stale end-of-space.
      let end = self.producer.end_of_recorded_space.load(Ordering::Acquire);
      let available = end.saturating_sub(consumer);
      if available > 0 {
        return unsafe { std::slice::from_raw_parts(self.base().add(consumer), available) };
      }
      // Tail exhausted; follow the producer to the front.
      self.consumer_pos.store(0, Ordering::Release);
      consumer = 0;
    }

    let available = producer - consumer;
    unsafe { std::slice::from_raw_parts(self.base().add(consumer), available) }
  }

  /// Releases `nbytes` starting at the last peek position back to the
  /// producer.
  #[inline]
  pub fn consume(&self, nbytes: usize) {
    let consumer = self.consumer_pos.load(Ordering::Relaxed);
    // Release: our reads of the consumed bytes happen-before the producer
    // reuses them.
    self.consumer_pos.store(consumer + nbytes, Ordering::Release);
  }

  /// Marks the ring for deletion once drained. Called by the producer
  /// thread's exit guard.
  pub fn mark_for_deletion(&self) {
    self.should_delete.store(true, Ordering::Release);
  }

  pub fn marked_for_deletion(&self) -> bool {
    self.should_delete.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> RingStats {
    let p = &*self.producer;
    RingStats {
      num_allocations: p.num_allocations.load(Ordering::Relaxed),
      cycles_producer_blocked: p.cycles_producer_blocked.load(Ordering::Relaxed),
      num_times_producer_blocked: p.num_times_producer_blocked.load(Ordering::Relaxed),
    }
  }
}
