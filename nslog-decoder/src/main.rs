//! Offline decoder for nslog binary logs.
//!
//! Usage: `nslog-decoder <log_file> [max_lines] [--json]`
//!
//! Prints one line per log message, colorized by severity, or NDJSON with
//! `--json`. Exits zero on a clean end of file and nonzero when the log is
//! malformed.

use color_eyre::eyre::{eyre, Result};
use colored::Colorize;

use nslog::decoder::Decoder;
use nslog::Level;

struct Options {
  log_file: String,
  max_lines: Option<u64>,
  json: bool,
}

fn parse_args() -> Result<Options> {
  let mut log_file = None;
  let mut max_lines = None;
  let mut json = false;

  for arg in std::env::args().skip(1) {
    if arg == "--json" {
      json = true;
    } else if log_file.is_none() {
      log_file = Some(arg);
    } else if max_lines.is_none() {
      max_lines = Some(
        arg
          .parse::<u64>()
          .map_err(|_| eyre!("max_lines must be a number, got {arg:?}"))?,
      );
    } else {
      return Err(eyre!("unexpected argument {arg:?}"));
    }
  }

  let log_file =
    log_file.ok_or_else(|| eyre!("usage: nslog-decoder <log_file> [max_lines] [--json]"))?;
  Ok(Options {
    log_file,
    max_lines,
    json,
  })
}

fn colorize(level: Level, line: String) -> String {
  match level {
    Level::Error => line.red().to_string(),
    Level::Warning => line.yellow().to_string(),
    Level::Notice => line,
    Level::Debug => line.dimmed().to_string(),
    Level::Silent => line,
  }
}

fn main() -> Result<()> {
  color_eyre::install()?;
  let options = parse_args()?;

  let mut decoder = Decoder::open(&options.log_file)?;
  let mut printed = 0u64;

  while let Some(record) = decoder.next_record()? {
    if let Some(limit) = options.max_lines {
      if printed >= limit {
        break;
      }
    }

    if options.json {
      println!("{}", decoder.record_to_json(&record)?);
    } else {
      let level = decoder
        .dict_entry(record.site_id)
        .map(|entry| entry.level)
        .unwrap_or(Level::Notice);
      let line = decoder.format_record(&record)?;
      println!("{}", colorize(level, line));
    }
    printed += 1;
  }

  eprintln!("{printed} records decoded");
  Ok(())
}
