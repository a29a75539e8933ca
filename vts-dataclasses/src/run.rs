//! Run level information
//!
//! The run header is the first record of each event file
//! and describes the telescopes participating in the run.
//!

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::SECONDS_PER_DAY;
use crate::serialization::{parse_bool,
                           parse_f64,
                           parse_u16,
                           parse_u32,
                           parse_u64,
                           parse_vec_f32,
                           parse_vec_u16,
                           put_vec_f32,
                           put_vec_u16,
                           Serialization,
                           SerializationError};

#[cfg(feature = "random")]
use crate::FromRandom;
#[cfg(feature = "random")]
use rand::Rng;

/// Telescopes sharing optics and camera share one type.
///
/// Pedestal and IPR statistics are pooled per type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TelescopeType(pub u64);

impl fmt::Display for TelescopeType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Convert (MJD, seconds of day) to a continuous time in seconds
pub fn continuous_time(mjd : u32, time_of_day : f64) -> f64 {
  mjd as f64 * SECONDS_PER_DAY + time_of_day
}

/// Static description of a single telescope
#[derive(Debug, Clone, PartialEq)]
pub struct TelescopeDescription {
  pub tel_id             : u32,
  pub tel_type           : TelescopeType,
  pub n_channels         : u16,
  pub n_samples          : u16,
  /// Channels carrying the FADC stop/trigger signal
  pub fadc_stop_channels : Vec<u16>,
  /// Dead channels from the simulation truth
  pub mc_dead_channels   : Vec<u16>,
  /// Per sample pedestals written by the simulation
  /// (one per channel). Empty for measured data.
  pub sim_pedestals      : Vec<f32>,
  /// Pedestal variation of a single sample written by
  /// the simulation (one per channel)
  pub sim_pedvars        : Vec<f32>,
  /// Pixel coordinates in the camera (deg)
  pub pixel_x            : Vec<f32>,
  pub pixel_y            : Vec<f32>,
}

impl TelescopeDescription {

  pub fn new(tel_id : u32, tel_type : TelescopeType, n_channels : u16, n_samples : u16) -> Self {
    Self {
      tel_id             : tel_id,
      tel_type           : tel_type,
      n_channels         : n_channels,
      n_samples          : n_samples,
      fadc_stop_channels : Vec::<u16>::new(),
      mc_dead_channels   : Vec::<u16>::new(),
      sim_pedestals      : Vec::<f32>::new(),
      sim_pedvars        : Vec::<f32>::new(),
      pixel_x            : Vec::<f32>::new(),
      pixel_y            : Vec::<f32>::new(),
    }
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.tel_id.to_le_bytes());
    stream.extend_from_slice(&self.tel_type.0.to_le_bytes());
    stream.extend_from_slice(&self.n_channels.to_le_bytes());
    stream.extend_from_slice(&self.n_samples.to_le_bytes());
    put_vec_u16(stream, &self.fadc_stop_channels);
    put_vec_u16(stream, &self.mc_dead_channels);
    put_vec_f32(stream, &self.sim_pedestals);
    put_vec_f32(stream, &self.sim_pedvars);
    put_vec_f32(stream, &self.pixel_x);
    put_vec_f32(stream, &self.pixel_y);
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let tel_id     = parse_u32(stream, pos)?;
    let tel_type   = TelescopeType(parse_u64(stream, pos)?);
    let n_channels = parse_u16(stream, pos)?;
    let n_samples  = parse_u16(stream, pos)?;
    let mut desc   = Self::new(tel_id, tel_type, n_channels, n_samples);
    desc.fadc_stop_channels = parse_vec_u16(stream, pos)?;
    desc.mc_dead_channels   = parse_vec_u16(stream, pos)?;
    desc.sim_pedestals      = parse_vec_f32(stream, pos)?;
    desc.sim_pedvars        = parse_vec_f32(stream, pos)?;
    desc.pixel_x            = parse_vec_f32(stream, pos)?;
    desc.pixel_y            = parse_vec_f32(stream, pos)?;
    Ok(desc)
  }
}

impl fmt::Display for TelescopeDescription {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<TelescopeDescription: tel {} (type {}), {} channels, {} samples>",
           self.tel_id, self.tel_type, self.n_channels, self.n_samples)
  }
}

/// Parameters of a run as seen by the event source
#[derive(Debug, Clone, PartialEq)]
pub struct RunHeader {
  pub run_number      : u32,
  pub is_simulation   : bool,
  /// Zero suppressed readout, channels without the
  /// hit bit carry no trace
  pub zero_suppressed : bool,
  pub mjd_start       : u32,
  /// seconds of day
  pub time_start      : f64,
  pub mjd_end         : u32,
  pub time_end        : f64,
  pub telescopes      : Vec<TelescopeDescription>,
}

impl RunHeader {

  pub fn new() -> Self {
    Self {
      run_number      : 0,
      is_simulation   : false,
      zero_suppressed : false,
      mjd_start       : 0,
      time_start      : 0.0,
      mjd_end         : 0,
      time_end        : 0.0,
      telescopes      : Vec::<TelescopeDescription>::new(),
    }
  }

  /// Duration of the run in seconds. 0 if the
  /// end time is not known.
  pub fn run_span_sec(&self) -> f64 {
    let span = continuous_time(self.mjd_end, self.time_end)
             - continuous_time(self.mjd_start, self.time_start);
    if span > 0.0 { span } else { 0.0 }
  }

  pub fn get_telescope(&self, tel_id : u32) -> Option<&TelescopeDescription> {
    self.telescopes.iter().find(|t| t.tel_id == tel_id)
  }

  /// All telescope types present in this run, sorted
  pub fn telescope_types(&self) -> Vec<TelescopeType> {
    let mut types : Vec<TelescopeType> = self.telescopes.iter().map(|t| t.tel_type).collect();
    types.sort();
    types.dedup();
    types
  }
}

impl Default for RunHeader {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RunHeader {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<RunHeader: run {}", self.run_number);
    if self.is_simulation {
      repr += " (simulation)";
    }
    if self.zero_suppressed {
      repr += " (zero suppressed)";
    }
    repr += &(format!("\n  start  : MJD {} {:.3}s", self.mjd_start, self.time_start));
    repr += &(format!("\n  end    : MJD {} {:.3}s", self.mjd_end, self.time_end));
    for tel in &self.telescopes {
      repr += &(format!("\n  {}", tel));
    }
    write!(f, "{}>", repr)
  }
}

impl Serialization for RunHeader {
  const HEAD : u16 = 0xAAAA;
  const TAIL : u16 = 0x5555;

  fn from_bytestream(stream : &[u8], pos : &mut usize)
    -> Result<Self, SerializationError> {
    Self::verify_head(stream, pos)?;
    let mut header          = RunHeader::new();
    header.run_number       = parse_u32 (stream, pos)?;
    header.is_simulation    = parse_bool(stream, pos)?;
    header.zero_suppressed  = parse_bool(stream, pos)?;
    header.mjd_start        = parse_u32 (stream, pos)?;
    header.time_start       = parse_f64 (stream, pos)?;
    header.mjd_end          = parse_u32 (stream, pos)?;
    header.time_end         = parse_f64 (stream, pos)?;
    let n_tel               = parse_u16 (stream, pos)?;
    for _ in 0..n_tel {
      header.telescopes.push(TelescopeDescription::read_from(stream, pos)?);
    }
    Self::verify_tail(stream, pos)?;
    Ok(header)
  }

  fn to_bytestream(&self) -> Vec<u8> {
    let mut stream = Vec::<u8>::new();
    stream.extend_from_slice(&Self::HEAD.to_le_bytes());
    stream.extend_from_slice(&self.run_number.to_le_bytes());
    stream.push(u8::from(self.is_simulation));
    stream.push(u8::from(self.zero_suppressed));
    stream.extend_from_slice(&self.mjd_start.to_le_bytes());
    stream.extend_from_slice(&self.time_start.to_le_bytes());
    stream.extend_from_slice(&self.mjd_end.to_le_bytes());
    stream.extend_from_slice(&self.time_end.to_le_bytes());
    stream.extend_from_slice(&(self.telescopes.len() as u16).to_le_bytes());
    for tel in &self.telescopes {
      tel.write_into(&mut stream);
    }
    stream.extend_from_slice(&Self::TAIL.to_le_bytes());
    stream
  }
}

#[cfg(feature = "random")]
impl FromRandom for RunHeader {
  fn from_random() -> Self {
    let mut rng     = rand::thread_rng();
    let mut header  = RunHeader::new();
    header.run_number      = rng.gen_range(10000..100000);
    header.is_simulation   = rng.gen::<bool>();
    header.zero_suppressed = rng.gen::<bool>();
    header.mjd_start       = rng.gen_range(55000..60000);
    header.time_start      = rng.gen_range(0.0..80000.0);
    header.mjd_end         = header.mjd_start;
    header.time_end        = header.time_start + rng.gen_range(60.0..1800.0);
    let n_tel              = rng.gen_range(1..5u32);
    for tel_id in 0..n_tel {
      let mut desc = TelescopeDescription::new(tel_id,
                                               TelescopeType(rng.gen_range(0..3u64)),
                                               rng.gen_range(10..500),
                                               rng.gen_range(16..64));
      desc.fadc_stop_channels = vec![desc.n_channels - 1];
      desc.mc_dead_channels   = (0..rng.gen_range(0..5)).map(|_| rng.gen_range(0..desc.n_channels)).collect();
      desc.pixel_x = (0..desc.n_channels).map(|_| rng.gen_range(-2.0..2.0)).collect();
      desc.pixel_y = (0..desc.n_channels).map(|_| rng.gen_range(-2.0..2.0)).collect();
      header.telescopes.push(desc);
    }
    header
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_span_is_never_negative() {
    let mut header = RunHeader::new();
    header.mjd_start  = 58000;
    header.time_start = 3600.0;
    header.mjd_end    = 58000;
    header.time_end   = 3000.0;
    assert_eq!(header.run_span_sec(), 0.0);
    // run across midnight
    header.time_start = 86000.0;
    header.mjd_end    = 58001;
    header.time_end   = 1000.0;
    assert!((header.run_span_sec() - 1400.0).abs() < 1e-6);
  }

  #[test]
  fn telescope_types_are_unique() {
    let mut header = RunHeader::new();
    header.telescopes.push(TelescopeDescription::new(0, TelescopeType(7), 10, 16));
    header.telescopes.push(TelescopeDescription::new(1, TelescopeType(3), 10, 16));
    header.telescopes.push(TelescopeDescription::new(2, TelescopeType(7), 10, 16));
    assert_eq!(header.telescope_types(), vec![TelescopeType(3), TelescopeType(7)]);
    assert_eq!(header.get_telescope(1).map(|t| t.tel_type), Some(TelescopeType(3)));
    assert!(header.get_telescope(5).is_none());
  }
}
