//! Calibration pipeline for imaging atmospheric
//! Cherenkov telescope cameras
//!
//! * pedestals and pedestal variations, for the whole
//!   run and in time slices
//! * relative gains and time offsets from flasher runs
//! * average pulse arrival times
//! * individual pixel rate (IPR) curves
//! * dead channel classification
//!
//! The `Calibrator` drives all of these through a run.
//!

#[macro_use] extern crate log;
extern crate env_logger;

pub mod settings;
pub mod channel_state;
pub mod trace;
pub mod pedestals;
pub mod gains;
pub mod ipr;
pub mod calibration_io;
pub mod calibrator;

use std::io::Write;

use colored::{Colorize,
              ColoredString};
use log::Level;

pub use settings::CalibrationSettings;
pub use calibrator::{Calibrator,
                     CalibratedChannel,
                     RunMode,
                     TelescopeContext};
pub use channel_state::DeadReason;

/// Fixed width, colored level tag
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error => String::from("ERR").red().bold(),
    Level::Warn  => String::from("WRN").yellow(),
    Level::Info  => String::from("INF").green(),
    Level::Debug => String::from("DBG").blue(),
    Level::Trace => String::from("TRC").dimmed(),
  }
}

/// Module path without the crate prefix,
/// `vts_calib::pedestals` -> `pedestals`
pub fn short_module_path(path : &str) -> &str {
  match path.split_once("::") {
    Some((_, rest)) => rest,
    None            => path,
  }
}

/// Set up the env logger. Without `RUST_LOG` the
/// level is `info`.
///
/// Lines look like
/// `2024-03-01 21:04:11.532 INF pedestals:214 | message`
pub fn init_env_logger() {
  let env = env_logger::Env::default().default_filter_or("info");
  env_logger::Builder::from_env(env)
    .format(|buf, record| {
      writeln!(buf, "{stamp} {level} {module}:{line} | {args}",
               stamp  = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
               level  = color_log(&record.level()),
               module = short_module_path(record.module_path().unwrap_or("?")),
               line   = record.line().unwrap_or(0),
               args   = record.args())
    }).init();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn module_path_without_crate() {
    assert_eq!(short_module_path("vts_calib::pedestals"), "pedestals");
    assert_eq!(short_module_path("vts_calib::calibrator::tests"), "calibrator::tests");
    assert_eq!(short_module_path("vts_calibrate"), "vts_calibrate");
  }

  #[test]
  fn level_tags_have_equal_width() {
    for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
      assert_eq!(color_log(&level).chars().count(), 3);
    }
  }
}
