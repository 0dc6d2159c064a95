pub mod cycles;
pub mod decoder;
pub mod encoder;
pub mod logger;
pub mod packer;
pub mod site;
pub mod staging;
pub mod wire;
pub mod writer;

pub use logger::{default_logger, init_with, log_enabled, Config, Logger};
pub use site::{Arg, Level};

/// Logs through the process-wide default logger.
///
/// Expands to a static site slot registered on first execution, an atomic
/// level check, and a raw write into this thread's staging ring. All
/// formatting happens offline in the decoder.
///
/// ```rust,ignore
/// nslog!(Level::Notice, "Hello %s, attempt %d of %u", name, attempt, limit);
/// ```
#[macro_export]
macro_rules! nslog {
  ($level:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
    static SITE: $crate::site::SiteSlot =
      $crate::site::SiteSlot::new($fmt, file!(), line!(), $level);
    if $crate::logger::log_enabled($level) {
      $crate::logger::record_to_default(&SITE, &[$($crate::site::Arg::from($arg)),*]);
    }
  }};
}

/// Logs through an explicit [`Logger`] instance; tests and embedders with
/// their own runtime use this.
#[macro_export]
macro_rules! nslog_to {
  ($logger:expr, $level:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
    static SITE: $crate::site::SiteSlot =
      $crate::site::SiteSlot::new($fmt, file!(), line!(), $level);
    let logger = &$logger;
    if logger.enabled($level) {
      logger.record(&SITE, &[$($crate::site::Arg::from($arg)),*]);
    }
  }};
}
