//! Calibration products
//!
//! Pedestals (per sample) and pedestal variances (per
//! summation window), relative gains, time offsets,
//! average arrival times and IPR curves.
//!
//! Gains, time offsets and arrival times are properties
//! of a single telescope. Pedestal trees and IPR curves
//! are written per telescope type.
//!

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::run::TelescopeType;
use crate::serialization::{parse_bool,
                           parse_f32,
                           parse_f64,
                           parse_u8,
                           parse_u16,
                           parse_u32,
                           parse_u64,
                           parse_vec_f32,
                           put_vec_f32,
                           Serialization,
                           SerializationError};

/// Pedestals of one telescope and one gain path
///
/// `peds` is the pedestal per sample, `pedvars[ch][w-1]`
/// the pedestal variation (rms of the summed charge)
/// for summation window `w`.
#[derive(Debug, Clone, PartialEq)]
pub struct PedestalSet {
  pub tel_id   : u32,
  pub low_gain : bool,
  pub peds     : Vec<f32>,
  pub pedvars  : Vec<Vec<f32>>,
  /// Number of events entering the pedestal per channel
  pub entries  : Vec<u64>,
}

impl PedestalSet {

  pub fn new(tel_id : u32, n_channels : usize, n_windows : usize) -> Self {
    Self {
      tel_id   : tel_id,
      low_gain : false,
      peds     : vec![0.0;n_channels],
      pedvars  : vec![vec![0.0;n_windows];n_channels],
      entries  : vec![0;n_channels],
    }
  }

  pub fn n_channels(&self) -> usize {
    self.peds.len()
  }

  /// Largest tracked summation window
  pub fn n_windows(&self) -> usize {
    self.pedvars.iter().map(|v| v.len()).max().unwrap_or(0)
  }

  pub fn ped(&self, channel : usize) -> Option<f32> {
    self.peds.get(channel).copied()
  }

  /// Pedestal variation for the given summation window (>= 1).
  ///
  /// Windows larger than the tracked ones return the
  /// value of the largest tracked window.
  pub fn pedvar(&self, channel : usize, window : usize) -> Option<f32> {
    let vars = self.pedvars.get(channel)?;
    if window == 0 || vars.is_empty() {
      return None;
    }
    let idx = usize::min(window, vars.len()) - 1;
    vars.get(idx).copied()
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.tel_id.to_le_bytes());
    stream.push(u8::from(self.low_gain));
    put_vec_f32(stream, &self.peds);
    // one row per channel, each with its own length
    for ch in 0..self.n_channels() {
      put_vec_f32(stream, self.pedvars.get(ch).map(|v| v.as_slice()).unwrap_or(&[]));
    }
    for ch in 0..self.n_channels() {
      stream.extend_from_slice(&self.entries.get(ch).copied().unwrap_or(0).to_le_bytes());
    }
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let tel_id    = parse_u32(stream, pos)?;
    let low_gain  = parse_bool(stream, pos)?;
    let peds      = parse_vec_f32(stream, pos)?;
    let mut set   = PedestalSet::new(tel_id, peds.len(), 0);
    set.low_gain  = low_gain;
    set.peds      = peds;
    for ch in 0..set.n_channels() {
      set.pedvars[ch] = parse_vec_f32(stream, pos)?;
    }
    for ch in 0..set.n_channels() {
      set.entries[ch] = parse_u64(stream, pos)?;
    }
    Ok(set)
  }
}

impl fmt::Display for PedestalSet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<PedestalSet: tel {} ({}), {} channels, {} windows>",
           self.tel_id,
           if self.low_gain {"low gain"} else {"high gain"},
           self.n_channels(),
           self.n_windows())
  }
}

/// Pedestals of one telescope for one time slice
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSlicePedestal {
  pub mjd      : u32,
  /// seconds of day at the start of the slice
  pub time     : f64,
  /// continuous time of slice start and end (s)
  pub start    : f64,
  pub end      : f64,
  pub n_events : u32,
  pub peds     : Vec<f32>,
  pub pedvars  : Vec<Vec<f32>>,
  /// pixel coordinates derotated at slice close time
  pub pixel_x  : Vec<f32>,
  pub pixel_y  : Vec<f32>,
}

impl TimeSlicePedestal {

  pub fn new() -> Self {
    Self {
      mjd      : 0,
      time     : 0.0,
      start    : 0.0,
      end      : 0.0,
      n_events : 0,
      peds     : Vec::<f32>::new(),
      pedvars  : Vec::<Vec<f32>>::new(),
      pixel_x  : Vec::<f32>::new(),
      pixel_y  : Vec::<f32>::new(),
    }
  }

  pub fn pedvar(&self, channel : usize, window : usize) -> Option<f32> {
    let vars = self.pedvars.get(channel)?;
    if window == 0 || vars.is_empty() {
      return None;
    }
    vars.get(usize::min(window, vars.len()) - 1).copied()
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.mjd.to_le_bytes());
    stream.extend_from_slice(&self.time.to_le_bytes());
    stream.extend_from_slice(&self.start.to_le_bytes());
    stream.extend_from_slice(&self.end.to_le_bytes());
    stream.extend_from_slice(&self.n_events.to_le_bytes());
    put_vec_f32(stream, &self.peds);
    stream.extend_from_slice(&(self.pedvars.len() as u32).to_le_bytes());
    for vars in &self.pedvars {
      put_vec_f32(stream, vars);
    }
    put_vec_f32(stream, &self.pixel_x);
    put_vec_f32(stream, &self.pixel_y);
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let mut slice  = TimeSlicePedestal::new();
    slice.mjd      = parse_u32(stream, pos)?;
    slice.time     = parse_f64(stream, pos)?;
    slice.start    = parse_f64(stream, pos)?;
    slice.end      = parse_f64(stream, pos)?;
    slice.n_events = parse_u32(stream, pos)?;
    slice.peds     = parse_vec_f32(stream, pos)?;
    let n_chan     = parse_u32(stream, pos)?;
    for _ in 0..n_chan {
      slice.pedvars.push(parse_vec_f32(stream, pos)?);
    }
    slice.pixel_x  = parse_vec_f32(stream, pos)?;
    slice.pixel_y  = parse_vec_f32(stream, pos)?;
    Ok(slice)
  }
}

impl Default for TimeSlicePedestal {
  fn default() -> Self {
    Self::new()
  }
}

/// Series of time slice pedestals of one telescope
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSlicePedestals {
  pub tel_id   : u32,
  pub low_gain : bool,
  pub slices   : Vec<TimeSlicePedestal>,
}

impl TimeSlicePedestals {

  pub fn new(tel_id : u32) -> Self {
    Self {
      tel_id   : tel_id,
      low_gain : false,
      slices   : Vec::<TimeSlicePedestal>::new(),
    }
  }

  /// The slice valid for the continuous time `t`.
  ///
  /// Times before the first slice map to the first,
  /// times after the last slice to the last one.
  pub fn slice_at(&self, t : f64) -> Option<&TimeSlicePedestal> {
    if self.slices.is_empty() {
      return None;
    }
    let idx = self.slices.iter()
      .rposition(|s| s.start <= t)
      .unwrap_or(0);
    self.slices.get(idx)
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.tel_id.to_le_bytes());
    stream.push(u8::from(self.low_gain));
    stream.extend_from_slice(&(self.slices.len() as u32).to_le_bytes());
    for slice in &self.slices {
      slice.write_into(stream);
    }
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let mut ts   = TimeSlicePedestals::new(parse_u32(stream, pos)?);
    ts.low_gain  = parse_bool(stream, pos)?;
    let n_slices = parse_u32(stream, pos)?;
    for _ in 0..n_slices {
      ts.slices.push(TimeSlicePedestal::read_from(stream, pos)?);
    }
    Ok(ts)
  }
}

/// Relative gains of one telescope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainSet {
  pub tel_id     : u32,
  pub low_gain   : bool,
  pub gain       : Vec<f32>,
  pub gain_var   : Vec<f32>,
  /// Neutral values substituted for missing calibration
  pub is_default : bool,
}

impl GainSet {

  /// Neutral gains (1.0, variance 0)
  pub fn neutral(tel_id : u32, n_channels : usize) -> Self {
    Self {
      tel_id     : tel_id,
      low_gain   : false,
      gain       : vec![1.0;n_channels],
      gain_var   : vec![0.0;n_channels],
      is_default : true,
    }
  }

  pub fn get(&self, channel : usize) -> Option<f32> {
    self.gain.get(channel).copied()
  }

  /// Number of channels with a gain of exactly 0
  pub fn n_zero(&self) -> usize {
    self.gain.iter().filter(|g| **g == 0.0).count()
  }

  /// True if not all gains are 1 (or 0)
  pub fn is_nontrivial(&self) -> bool {
    !self.is_default && self.gain.iter().any(|g| *g != 0.0 && *g != 1.0)
  }
}

/// Time offsets of one telescope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToffSet {
  pub tel_id     : u32,
  pub low_gain   : bool,
  pub toff       : Vec<f32>,
  pub toff_var   : Vec<f32>,
  pub is_default : bool,
}

impl ToffSet {

  /// Neutral time offsets (0.0)
  pub fn neutral(tel_id : u32, n_channels : usize) -> Self {
    Self {
      tel_id     : tel_id,
      low_gain   : false,
      toff       : vec![0.0;n_channels],
      toff_var   : vec![0.0;n_channels],
      is_default : true,
    }
  }

  pub fn get(&self, channel : usize) -> Option<f32> {
    self.toff.get(channel).copied()
  }
}

/// Average pulse arrival time per channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TZeroSet {
  pub tel_id   : u32,
  pub low_gain : bool,
  pub mean     : Vec<f32>,
  pub median   : Vec<f32>,
  pub variance : Vec<f32>,
}

impl TZeroSet {
  pub fn new(tel_id : u32, n_channels : usize) -> Self {
    Self {
      tel_id   : tel_id,
      low_gain : false,
      mean     : vec![0.0;n_channels],
      median   : vec![0.0;n_channels],
      variance : vec![0.0;n_channels],
    }
  }
}

/// Parameters the IPR curve was derived with
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct IprHeader {
  pub method             : u8,
  pub window             : u16,
  pub n_samples          : u16,
  pub fadc_time_slice_ns : f32,
  pub readout_window_ns  : f32,
  pub upsample           : u16,
}

impl IprHeader {

  /// Length of the search window in ns
  pub fn search_window_ns(&self) -> f64 {
    let upsample = u16::max(self.upsample, 1) as f64;
    self.window as f64 * self.fadc_time_slice_ns as f64 / upsample
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.push(self.method);
    stream.extend_from_slice(&self.window.to_le_bytes());
    stream.extend_from_slice(&self.n_samples.to_le_bytes());
    stream.extend_from_slice(&self.fadc_time_slice_ns.to_le_bytes());
    stream.extend_from_slice(&self.readout_window_ns.to_le_bytes());
    stream.extend_from_slice(&self.upsample.to_le_bytes());
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    Ok(Self {
      method             : parse_u8 (stream, pos)?,
      window             : parse_u16(stream, pos)?,
      n_samples          : parse_u16(stream, pos)?,
      fadc_time_slice_ns : parse_f32(stream, pos)?,
      readout_window_ns  : parse_f32(stream, pos)?,
      upsample           : parse_u16(stream, pos)?,
    })
  }
}

/// A single point of the rate vs threshold curve
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct IprPoint {
  pub threshold_pe  : f64,
  pub rate_hz       : f64,
  pub threshold_err : f64,
  pub rate_err      : f64,
}

/// Individual pixel rate vs. threshold for one
/// telescope type and summation window
#[derive(Debug, Clone, PartialEq)]
pub struct IprCurve {
  pub tel_type      : TelescopeType,
  pub header        : IprHeader,
  pub points        : Vec<IprPoint>,
  pub total_entries : f64,
  /// enough entries for a reliable curve
  pub valid         : bool,
}

impl IprCurve {

  pub fn new(tel_type : TelescopeType, header : IprHeader) -> Self {
    Self {
      tel_type      : tel_type,
      header        : header,
      points        : Vec::<IprPoint>::new(),
      total_entries : 0.0,
      valid         : false,
    }
  }

  /// Fixed name of the curve in the output files
  pub fn name(&self) -> String {
    format!("IPRcharge_TelType{}_SW{}", self.tel_type, self.header.window)
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.tel_type.0.to_le_bytes());
    self.header.write_into(stream);
    stream.extend_from_slice(&self.total_entries.to_le_bytes());
    stream.push(u8::from(self.valid));
    stream.extend_from_slice(&(self.points.len() as u32).to_le_bytes());
    for p in &self.points {
      stream.extend_from_slice(&p.threshold_pe.to_le_bytes());
      stream.extend_from_slice(&p.rate_hz.to_le_bytes());
      stream.extend_from_slice(&p.threshold_err.to_le_bytes());
      stream.extend_from_slice(&p.rate_err.to_le_bytes());
    }
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let tel_type       = TelescopeType(parse_u64(stream, pos)?);
    let header         = IprHeader::read_from(stream, pos)?;
    let mut curve      = IprCurve::new(tel_type, header);
    curve.total_entries = parse_f64(stream, pos)?;
    curve.valid         = parse_bool(stream, pos)?;
    let n_points        = parse_u32(stream, pos)?;
    for _ in 0..n_points {
      curve.points.push(IprPoint {
        threshold_pe  : parse_f64(stream, pos)?,
        rate_hz       : parse_f64(stream, pos)?,
        threshold_err : parse_f64(stream, pos)?,
        rate_err      : parse_f64(stream, pos)?,
      });
    }
    Ok(curve)
  }
}

impl fmt::Display for IprCurve {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<IprCurve {}: {} points, {} entries{}>",
           self.name(),
           self.points.len(),
           self.total_entries,
           if self.valid {""} else {" (insufficient statistics)"})
  }
}

/// Binned charge distribution of a single channel,
/// pooled over the telescopes of one type and kept
/// for quality checks of pedestal runs
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeDistribution {
  pub channel : u16,
  pub window  : u16,
  pub low     : f32,
  pub high    : f32,
  pub counts  : Vec<f32>,
}

impl ChargeDistribution {

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.channel.to_le_bytes());
    stream.extend_from_slice(&self.window.to_le_bytes());
    stream.extend_from_slice(&self.low.to_le_bytes());
    stream.extend_from_slice(&self.high.to_le_bytes());
    put_vec_f32(stream, &self.counts);
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    Ok(Self {
      channel : parse_u16(stream, pos)?,
      window  : parse_u16(stream, pos)?,
      low     : parse_f32(stream, pos)?,
      high    : parse_f32(stream, pos)?,
      counts  : parse_vec_f32(stream, pos)?,
    })
  }
}

/// Structured pedestal output of one run for all
/// telescopes of one type
#[derive(Debug, Clone, PartialEq)]
pub struct PedestalTree {
  pub run_number      : u32,
  pub tel_type        : TelescopeType,
  pub low_gain        : bool,
  /// time slice pedestals are present
  pub has_time_slices : bool,
  pub pedestals       : Vec<PedestalSet>,
  pub time_slices     : Vec<TimeSlicePedestals>,
  pub ipr_curves      : Vec<IprCurve>,
  pub distributions   : Vec<ChargeDistribution>,
}

impl PedestalTree {

  pub fn new(run_number : u32, tel_type : TelescopeType) -> Self {
    Self {
      run_number      : run_number,
      tel_type        : tel_type,
      low_gain        : false,
      has_time_slices : false,
      pedestals       : Vec::<PedestalSet>::new(),
      time_slices     : Vec::<TimeSlicePedestals>::new(),
      ipr_curves      : Vec::<IprCurve>::new(),
      distributions   : Vec::<ChargeDistribution>::new(),
    }
  }

  pub fn get_pedestals(&self, tel_id : u32) -> Option<&PedestalSet> {
    self.pedestals.iter().find(|p| p.tel_id == tel_id)
  }

  pub fn get_time_slices(&self, tel_id : u32) -> Option<&TimeSlicePedestals> {
    self.time_slices.iter().find(|t| t.tel_id == tel_id)
  }

  pub fn get_ipr_curve(&self, window : u16) -> Option<&IprCurve> {
    self.ipr_curves.iter().find(|c| c.header.window == window)
  }
}

impl fmt::Display for PedestalTree {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<PedestalTree: run {}, tel type {}, {} telescopes, {} time slice series, {} IPR curves>",
           self.run_number,
           self.tel_type,
           self.pedestals.len(),
           self.time_slices.len(),
           self.ipr_curves.len())
  }
}

impl Serialization for PedestalTree {
  const HEAD : u16 = 0xAAAA;
  const TAIL : u16 = 0x5555;

  fn from_bytestream(stream : &[u8], pos : &mut usize)
    -> Result<Self, SerializationError> {
    Self::verify_head(stream, pos)?;
    let run_number       = parse_u32(stream, pos)?;
    let tel_type         = TelescopeType(parse_u64(stream, pos)?);
    let mut tree         = PedestalTree::new(run_number, tel_type);
    tree.low_gain        = parse_bool(stream, pos)?;
    tree.has_time_slices = parse_bool(stream, pos)?;
    let n_peds = parse_u32(stream, pos)?;
    for _ in 0..n_peds {
      tree.pedestals.push(PedestalSet::read_from(stream, pos)?);
    }
    let n_ts = parse_u32(stream, pos)?;
    for _ in 0..n_ts {
      tree.time_slices.push(TimeSlicePedestals::read_from(stream, pos)?);
    }
    let n_ipr = parse_u32(stream, pos)?;
    for _ in 0..n_ipr {
      tree.ipr_curves.push(IprCurve::read_from(stream, pos)?);
    }
    let n_dist = parse_u32(stream, pos)?;
    for _ in 0..n_dist {
      tree.distributions.push(ChargeDistribution::read_from(stream, pos)?);
    }
    Self::verify_tail(stream, pos)?;
    Ok(tree)
  }

  fn to_bytestream(&self) -> Vec<u8> {
    let mut stream = Vec::<u8>::new();
    stream.extend_from_slice(&Self::HEAD.to_le_bytes());
    stream.extend_from_slice(&self.run_number.to_le_bytes());
    stream.extend_from_slice(&self.tel_type.0.to_le_bytes());
    stream.push(u8::from(self.low_gain));
    stream.push(u8::from(self.has_time_slices));
    stream.extend_from_slice(&(self.pedestals.len() as u32).to_le_bytes());
    for p in &self.pedestals {
      p.write_into(&mut stream);
    }
    stream.extend_from_slice(&(self.time_slices.len() as u32).to_le_bytes());
    for t in &self.time_slices {
      t.write_into(&mut stream);
    }
    stream.extend_from_slice(&(self.ipr_curves.len() as u32).to_le_bytes());
    for c in &self.ipr_curves {
      c.write_into(&mut stream);
    }
    stream.extend_from_slice(&(self.distributions.len() as u32).to_le_bytes());
    for d in &self.distributions {
      d.write_into(&mut stream);
    }
    stream.extend_from_slice(&Self::TAIL.to_le_bytes());
    stream
  }
}
