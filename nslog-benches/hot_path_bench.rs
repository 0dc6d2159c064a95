use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use std::hint::black_box;
use std::time::Duration;

use nslog::packer;
use nslog::staging::StagingBuffer;
use nslog::{nslog_to, Config, Level, Logger};

fn configure_criterion() -> Criterion {
  Criterion::default()
    .sample_size(50)
    .measurement_time(Duration::from_secs(5))
    .warm_up_time(Duration::from_secs(2))
}

fn bench_packer(c: &mut Criterion) {
  let mut group = c.benchmark_group("packer");

  for value in [0u64, 0xFF, 0xFFFF_FFFF, u64::MAX] {
    group.bench_with_input(BenchmarkId::new("pack_u64", value), &value, |b, v| {
      let mut out = Vec::with_capacity(16);
      b.iter(|| {
        out.clear();
        black_box(packer::pack_u64(&mut out, black_box(*v)));
      });
    });
  }

  group.bench_function("round_trip_i64", |b| {
    let mut out = Vec::with_capacity(16);
    b.iter(|| {
      out.clear();
      let code = packer::pack_i64(&mut out, black_box(-123_456i64));
      let mut input = out.as_slice();
      black_box(packer::unpack_i64(&mut input, code, 8));
    });
  });

  group.bench_function("pack_u64_mixed_widths", |b| {
    let mut rng = rand::rng();
    let values: Vec<u64> = (0..1024)
      .map(|_| {
        let bits = rng.random_range(0..64);
        rng.random::<u64>() >> bits
      })
      .collect();
    let mut out = Vec::with_capacity(16);
    let mut index = 0usize;
    b.iter(|| {
      out.clear();
      index = (index + 1) % values.len();
      black_box(packer::pack_u64(&mut out, black_box(values[index])));
    });
  });

  group.finish();
}

fn bench_staging_ring(c: &mut Criterion) {
  let mut group = c.benchmark_group("staging_ring");

  group.bench_function("reserve_commit_48b", |b| {
    let ring = StagingBuffer::new(0, 1 << 20);
    let payload = [0x5Au8; 48];
    b.iter(|| {
      let ptr = ring.reserve(payload.len());
      unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
      ring.commit(payload.len());
      // Drain inline so the ring never fills.
      let view = ring.peek();
      let len = view.len();
      ring.consume(len);
    });
  });

  group.finish();
}

fn bench_log_call(c: &mut Criterion) {
  let mut group = c.benchmark_group("log_call");

  let dir = tempfile::tempdir().unwrap();
  let logger = Logger::new(Config {
    output_file: dir.path().join("bench.bin"),
    ..Config::default()
  })
  .unwrap();
  logger.preallocate();

  group.bench_function("static_message", |b| {
    b.iter(|| {
      nslog_to!(logger, Level::Notice, "benchmark tick");
    });
  });

  group.bench_function("two_scalars", |b| {
    b.iter(|| {
      nslog_to!(
        logger,
        Level::Notice,
        "value %d at %u",
        black_box(-42i32),
        black_box(9000u32)
      );
    });
  });

  group.bench_function("scalar_and_string", |b| {
    b.iter(|| {
      nslog_to!(
        logger,
        Level::Notice,
        "request %s finished in %u us",
        black_box("GET /health"),
        black_box(125u32)
      );
    });
  });

  group.bench_function("filtered_out", |b| {
    b.iter(|| {
      nslog_to!(logger, Level::Debug, "never recorded %u", black_box(1u32));
    });
  });

  group.finish();
  logger.sync();
}

criterion_group! {
  name = benches;
  config = configure_criterion();
  targets = bench_packer, bench_staging_ring, bench_log_call
}
criterion_main!(benches);
