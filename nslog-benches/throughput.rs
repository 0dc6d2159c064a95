//! Multi-threaded throughput runner: hammers a logger from N producer
//! threads, syncs, and prints a tabled report of the run.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tabled::{Table, Tabled};

use nslog::{nslog_to, Config, Level, Logger};

#[derive(Debug, Clone, Tabled)]
struct ResultRow {
  #[tabled(rename = "Metric")]
  metric: String,
  #[tabled(rename = "Value")]
  value: String,
}

fn main() {
  let threads: usize = std::env::args()
    .nth(1)
    .and_then(|v| v.parse().ok())
    .unwrap_or(4);
  let entries_per_thread: u64 = std::env::args()
    .nth(2)
    .and_then(|v| v.parse().ok())
    .unwrap_or(1_000_000);

  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("throughput.bin");
  let logger = Arc::new(
    Logger::new(Config {
      output_file: path.clone(),
      ..Config::default()
    })
    .expect("logger"),
  );

  let start = Instant::now();
  let mut handles = Vec::new();
  for thread_id in 0..threads {
    let logger = Arc::clone(&logger);
    handles.push(thread::spawn(move || {
      logger.preallocate();
      for i in 0..entries_per_thread {
        nslog_to!(
          logger,
          Level::Notice,
          "thread %u produced entry %u of %u",
          thread_id as u32,
          i,
          entries_per_thread
        );
      }
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
  let produce_elapsed = start.elapsed();

  logger.sync();
  let total_elapsed = start.elapsed();

  let total_entries = threads as u64 * entries_per_thread;
  let file_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

  let rows = vec![
    ResultRow {
      metric: "producer threads".into(),
      value: threads.to_string(),
    },
    ResultRow {
      metric: "entries".into(),
      value: total_entries.to_string(),
    },
    ResultRow {
      metric: "produce time".into(),
      value: format!("{produce_elapsed:?}"),
    },
    ResultRow {
      metric: "produce rate".into(),
      value: format!(
        "{:.2} M entries/s",
        total_entries as f64 / produce_elapsed.as_secs_f64() / 1e6
      ),
    },
    ResultRow {
      metric: "ns per entry".into(),
      value: format!(
        "{:.1}",
        produce_elapsed.as_nanos() as f64 / total_entries as f64
      ),
    },
    ResultRow {
      metric: "drain + sync time".into(),
      value: format!("{total_elapsed:?}"),
    },
    ResultRow {
      metric: "output size".into(),
      value: format!("{:.2} MB", file_bytes as f64 / 1e6),
    },
    ResultRow {
      metric: "bytes per entry".into(),
      value: format!("{:.2}", file_bytes as f64 / total_entries as f64),
    },
  ];

  println!("{}", Table::new(rows));
  println!();
  println!("{}", logger.get_stats());
  logger.print_config();
}
