//! Error types shared by all calibration crates
//!

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems while decoding binary records
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SerializationError {
  #[error("invalid tail signature")]
  TailInvalid,
  #[error("invalid head signature")]
  HeadInvalid,
  #[error("bytestream too short, need {needed} bytes at position {pos} but have {len}")]
  StreamTooShort {
    needed : usize,
    pos    : usize,
    len    : usize,
  },
  #[error("value not found in bytestream")]
  ValueNotFound,
  #[error("unknown enum value {0}")]
  UnknownEnumValue(u8),
}

/// Per channel problems during signal extraction.
///
/// These are never fatal, the channel is skipped
/// for the current event.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TraceError {
  #[error("channel {channel} out of range, event has {n_channels} channels")]
  ChannelOutOfRange {
    channel    : usize,
    n_channels : usize,
  },
  #[error("channel {0} carries neither samples nor a precomputed sum")]
  NoSignal(usize),
  #[error("empty integration window [{start}, {end})")]
  EmptyWindow {
    start : usize,
    end   : usize,
  },
}

/// Everything which can go wrong in the calibration
/// pipeline.
///
/// `Fatal` corresponds to conditions under which the
/// run can not be analyzed at all (e.g. a camera
/// without any live channel). The top level caller
/// is expected to stop the run.
#[derive(Debug, Error)]
pub enum CalibrationError {
  #[error("fatal calibration error: {0}")]
  Fatal(String),
  #[error("i/o error for {path}: {source}")]
  Io {
    path   : PathBuf,
    #[source]
    source : io::Error,
  },
  #[error("unable to decode {path}: {source}")]
  Serialization {
    path   : PathBuf,
    #[source]
    source : SerializationError,
  },
  #[error("unable to parse {path} line {line}: {msg}")]
  Parse {
    path : PathBuf,
    line : usize,
    msg  : String,
  },
  #[error("no {what} calibration for telescope {tel_id}")]
  MissingCalibration {
    what   : String,
    tel_id : u32,
  },
  #[error("histogram error: {0}")]
  Histogram(String),
  #[error("invalid settings: {0}")]
  Settings(String),
  #[error("database error: {0}")]
  Database(String),
}

impl CalibrationError {

  /// Attach a path to an io error
  pub fn io<P: Into<PathBuf>>(path : P, source : io::Error) -> Self {
    CalibrationError::Io {
      path   : path.into(),
      source : source,
    }
  }

  pub fn parse<P: Into<PathBuf>>(path : P, line : usize, msg : impl Into<String>) -> Self {
    CalibrationError::Parse {
      path : path.into(),
      line : line,
      msg  : msg.into(),
    }
  }

  /// True for errors which have to stop the run
  pub fn is_fatal(&self) -> bool {
    matches!(self, CalibrationError::Fatal(_))
  }
}
