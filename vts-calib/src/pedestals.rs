//! Pedestals and pedestal variations
//!
//! Charges of pedestal events (or of pedestal type
//! events in data runs) are summed for the windows
//! `1..=n_windows` and enter running statistics per
//! telescope, channel and window. The pedestal per
//! sample is derived from the largest window, the
//! pedestal variation of window `w` is the rms of the
//! summed charge in that window.
//!
//! Three flavours are kept:
//!
//! * `PedestalAccumulator` - whole run, pooled per
//!   telescope type
//! * `TimeSliceBuilder` - the same statistics restarted
//!   for every time slice of a run
//! * `IprChargeHistograms` - binned charge distributions
//!   per telescope type, window and channel, input for
//!   the IPR curves
//!

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self,
              File};
use std::io::{BufWriter,
              Write};
use std::path::Path;

use vts_dataclasses::calibrations::{ChargeDistribution,
                                    PedestalSet,
                                    TimeSlicePedestal,
                                    TimeSlicePedestals};
use vts_dataclasses::errors::CalibrationError;
use vts_dataclasses::run::continuous_time;
use vts_dataclasses::stats::{ChargeHistogram,
                             RunningStats};
use vts_dataclasses::{ChannelData,
                      GainPath,
                      TelescopeDescription,
                      TelescopeType};

use crate::trace::TraceIntegrator;

/// Slack on slice boundaries, in seconds
const SLICE_TOLERANCE_SEC : f64 = 1e-6;

/// Pedestal sums of one channel for the windows `1..=n_windows`.
///
/// Channels without a trace only provide their
/// precomputed sum, which is assigned to the analysis
/// window. All other windows are 0 and will be
/// ignored by the accumulators.
pub fn channel_window_sums(integrator : &TraceIntegrator,
                           ch         : &ChannelData,
                           n_windows  : usize) -> Vec<f32> {
  if ch.has_trace() {
    return TraceIntegrator::window_sums(&ch.samples, integrator.sumfirst, n_windows);
  }
  let mut sums = vec![0.0f32;n_windows];
  if integrator.sumwindow >= 1 && integrator.sumwindow <= n_windows {
    sums[integrator.sumwindow - 1] = ch.sum;
  }
  sums
}

/// Turn per window statistics of one channel into
/// (pedestal per sample, pedvar per window, entries)
fn pedestal_from_stats(stats : &[RunningStats]) -> (f32, Vec<f32>, u64) {
  let mut pedvars = Vec::<f32>::with_capacity(stats.len());
  for s in stats {
    pedvars.push(s.finalize().1 as f32);
  }
  // largest window with entries. Short traces never
  // fill the long windows, sum-only channels fill just
  // the analysis window
  match stats.iter().enumerate().rev().find(|(_, s)| !s.is_empty()) {
    Some((k, largest)) => {
      let ped = largest.mean() / (k + 1) as f64;
      (ped as f32, pedvars, largest.n)
    }
    None => (0.0, pedvars, 0)
  }
}

/// Per channel, per window statistics of one telescope
#[derive(Debug, Clone)]
struct TelescopePedestalStats {
  /// [channel][window - 1]
  stats : Vec<Vec<RunningStats>>,
}

impl TelescopePedestalStats {
  fn new(n_channels : usize, n_windows : usize) -> Self {
    Self {
      stats : vec![vec![RunningStats::new();n_windows];n_channels],
    }
  }
}

/// Whole run pedestal statistics, pooled by
/// telescope type
#[derive(Debug, Clone)]
pub struct PedestalAccumulator {
  pub gain_path : GainPath,
  pub n_windows : usize,
  telescopes    : BTreeMap<TelescopeType, BTreeMap<u32, TelescopePedestalStats>>,
}

impl PedestalAccumulator {

  pub fn new(gain_path : GainPath, n_windows : usize) -> Self {
    Self {
      gain_path  : gain_path,
      n_windows  : n_windows,
      telescopes : BTreeMap::<TelescopeType, BTreeMap<u32, TelescopePedestalStats>>::new(),
    }
  }

  /// Allocate (empty) statistics for a telescope
  pub fn register(&mut self, desc : &TelescopeDescription) {
    self.telescopes
      .entry(desc.tel_type)
      .or_default()
      .insert(desc.tel_id,
              TelescopePedestalStats::new(desc.n_channels as usize, self.n_windows));
  }

  /// Forget everything accumulated for this type
  pub fn reset(&mut self, tel_type : TelescopeType) {
    if let Some(tels) = self.telescopes.get_mut(&tel_type) {
      for stats in tels.values_mut() {
        stats.stats.iter_mut().flatten().for_each(|s| s.reset());
      }
    }
  }

  /// Does this channel enter the accumulator?
  ///
  /// The hi/lo decision has to match the gain path,
  /// in zero suppressed runs only channels with the
  /// hit bit set are used.
  pub fn accepts(&self, ch : &ChannelData, is_low_gain : bool, zero_suppressed_run : bool) -> bool {
    if is_low_gain != self.gain_path.is_low() {
      return false;
    }
    !(zero_suppressed_run && ch.zero_suppressed)
  }

  /// Add the charge of one channel in summation window
  /// `window` (>= 1). Non positive charges and unknown
  /// telescopes, channels or windows are ignored.
  ///
  /// Returns true if the charge was used.
  pub fn accumulate(&mut self,
                    tel_type : TelescopeType,
                    tel_id   : u32,
                    channel  : usize,
                    window   : usize,
                    charge   : f32) -> bool {
    if charge <= 0.0 || window == 0 {
      return false;
    }
    let stats = self.telescopes.get_mut(&tel_type)
      .and_then(|tels| tels.get_mut(&tel_id))
      .and_then(|t| t.stats.get_mut(channel))
      .and_then(|ch| ch.get_mut(window - 1));
    match stats {
      Some(s) => {
        s.add(charge as f64);
        true
      }
      None => false
    }
  }

  /// Add the sums of all windows of one channel,
  /// `sums[w-1]` belongs to window `w`
  pub fn accumulate_sums(&mut self,
                         tel_type : TelescopeType,
                         tel_id   : u32,
                         channel  : usize,
                         sums     : &[f32]) {
    for (k, charge) in sums.iter().enumerate() {
      self.accumulate(tel_type, tel_id, channel, k + 1, *charge);
    }
  }

  /// (mean, rms, entries) of the summed charge of one
  /// channel and window
  pub fn finalize(&self,
                  tel_type : TelescopeType,
                  tel_id   : u32,
                  channel  : usize,
                  window   : usize) -> Option<(f64, f64, u64)> {
    if window == 0 {
      return None;
    }
    let s = self.telescopes.get(&tel_type)?
      .get(&tel_id)?
      .stats.get(channel)?
      .get(window - 1)?;
    let (mean, rms) = s.finalize();
    Some((mean, rms, s.n))
  }

  /// Telescopes with statistics of one type
  pub fn telescopes(&self, tel_type : TelescopeType) -> Vec<u32> {
    self.telescopes.get(&tel_type)
      .map(|tels| tels.keys().copied().collect())
      .unwrap_or_default()
  }

  /// Pedestals and pedestal variations of one telescope
  pub fn pedestal_set(&self, tel_type : TelescopeType, tel_id : u32) -> Option<PedestalSet> {
    let tel = self.telescopes.get(&tel_type)?.get(&tel_id)?;
    let mut set  = PedestalSet::new(tel_id, tel.stats.len(), self.n_windows);
    set.low_gain = self.gain_path.is_low();
    for (ch, stats) in tel.stats.iter().enumerate() {
      let (ped, pedvars, entries) = pedestal_from_stats(stats);
      set.peds[ch]    = ped;
      set.pedvars[ch] = pedvars;
      set.entries[ch] = entries;
    }
    Some(set)
  }

  /// Write the ascii summary of one telescope,
  /// `tel ch ped pedvar_1 ... pedvar_N` per line.
  ///
  /// Channels and windows with fewer than `min_entries`
  /// entries are reported as 0.
  pub fn write_ascii(&self,
                     tel_type    : TelescopeType,
                     tel_id      : u32,
                     filename    : &Path,
                     min_entries : u64) -> Result<(), CalibrationError> {
    let tel = self.telescopes.get(&tel_type)
      .and_then(|tels| tels.get(&tel_id))
      .ok_or(CalibrationError::MissingCalibration {
        what   : String::from("pedestal statistics"),
        tel_id : tel_id,
      })?;
    if let Some(dir) = filename.parent() {
      fs::create_dir_all(dir).map_err(|e| CalibrationError::io(dir, e))?;
    }
    let file = File::create(filename).map_err(|e| CalibrationError::io(filename, e))?;
    let mut writer = BufWriter::new(file);
    let mut n_low  = 0usize;
    for (ch, stats) in tel.stats.iter().enumerate() {
      let (ped, _, entries) = pedestal_from_stats(stats);
      let ped = if entries < min_entries {
        n_low += 1;
        0.0
      } else {
        ped
      };
      let mut line = format!("{} {} {:.4}", tel_id, ch, ped);
      for s in stats {
        let var = if s.n < min_entries { 0.0 } else { s.finalize().1 };
        line += &format!(" {:.4}", var);
      }
      writeln!(writer, "{}", line).map_err(|e| CalibrationError::io(filename, e))?;
    }
    writer.flush().map_err(|e| CalibrationError::io(filename, e))?;
    if n_low > 0 {
      warn!("Telescope {}: {} channels with less than {} pedestal events, pedestal set to 0",
            tel_id, n_low, min_entries);
    }
    info!("Wrote {} pedestals of telescope {} to {}",
          self.gain_path, tel_id, filename.display());
    Ok(())
  }
}

impl fmt::Display for PedestalAccumulator {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let n_tel : usize = self.telescopes.values().map(|t| t.len()).sum();
    write!(f, "<PedestalAccumulator: {}, {} windows, {} telescope types, {} telescopes>",
           self.gain_path, self.n_windows, self.telescopes.len(), n_tel)
  }
}

/// Geometric transformation of the camera coordinates
/// at the time a pedestal slice is closed
pub trait FieldRotation {
  fn derotate(&self, tel_id : u32, mjd : u32, time : f64, x : &[f32], y : &[f32]) -> (Vec<f32>, Vec<f32>);
}

/// Cameras without field rotation (e.g. simulations)
#[derive(Debug, Copy, Clone, Default)]
pub struct NoFieldRotation;

impl FieldRotation for NoFieldRotation {
  fn derotate(&self, _tel_id : u32, _mjd : u32, _time : f64, x : &[f32], y : &[f32]) -> (Vec<f32>, Vec<f32>) {
    (x.to_vec(), y.to_vec())
  }
}

/// Length of the time slices for a run, the target
/// length stretched so that the run is split into
/// slices of equal length
pub fn stretched_slice_length(target : f64, run_span : f64) -> f64 {
  let n_slices = (run_span / target).floor();
  if n_slices < 1.0 {
    return target;
  }
  let remainder = run_span - n_slices*target;
  target + remainder / n_slices
}

#[derive(Debug, Clone)]
struct OpenSlice {
  /// relative to the first event of the run
  start     : f64,
  mjd       : u32,
  time      : f64,
  last_mjd  : u32,
  last_time : f64,
  n_events  : u32,
  stats     : Vec<Vec<RunningStats>>,
}

/// Pedestals in time slices of one telescope
#[derive(Debug, Clone)]
pub struct TimeSliceBuilder {
  pub tel_id       : u32,
  pub n_channels   : usize,
  pub n_windows    : usize,
  pub slice_length : f64,
  pixel_x          : Vec<f32>,
  pixel_y          : Vec<f32>,
  t_first          : Option<f64>,
  current          : Option<OpenSlice>,
  pub slices       : TimeSlicePedestals,
}

impl TimeSliceBuilder {

  pub fn new(desc : &TelescopeDescription, n_windows : usize, target : f64, run_span : f64) -> Self {
    let slice_length = stretched_slice_length(target, run_span);
    debug!("Telescope {}: time slices of {:.1} s (target {:.1} s, run {:.1} s)",
           desc.tel_id, slice_length, target, run_span);
    Self {
      tel_id       : desc.tel_id,
      n_channels   : desc.n_channels as usize,
      n_windows    : n_windows,
      slice_length : slice_length,
      pixel_x      : desc.pixel_x.clone(),
      pixel_y      : desc.pixel_y.clone(),
      t_first      : None,
      current      : None,
      slices       : TimeSlicePedestals::new(desc.tel_id),
    }
  }

  /// Register the time of a new event. Closes the
  /// current slice if the event is past its end.
  ///
  /// Returns true if a slice was closed.
  pub fn new_event(&mut self, mjd : u32, time : f64, rotation : &dyn FieldRotation) -> bool {
    let t       = continuous_time(mjd, time);
    let t_first = *self.t_first.get_or_insert(t);
    let t_rel   = t - t_first;
    let mut closed    = false;
    let mut start_rel = 0.0;
    if let Some(open) = &self.current {
      start_rel = open.start;
      if t_rel > open.start + self.slice_length + SLICE_TOLERANCE_SEC {
        self.close(rotation);
        closed = true;
        while t_rel > start_rel + self.slice_length + SLICE_TOLERANCE_SEC {
          start_rel += self.slice_length;
        }
      }
    }
    let n_windows  = self.n_windows;
    let n_channels = self.n_channels;
    let open = self.current.get_or_insert_with(|| OpenSlice {
      start     : start_rel,
      mjd       : mjd,
      time      : time,
      last_mjd  : mjd,
      last_time : time,
      n_events  : 0,
      stats     : vec![vec![RunningStats::new();n_windows];n_channels],
    });
    open.last_mjd  = mjd;
    open.last_time = time;
    open.n_events += 1;
    closed
  }

  /// Add the window sums of a channel to the open slice
  pub fn accumulate_sums(&mut self, channel : usize, sums : &[f32]) {
    let Some(open) = self.current.as_mut() else {
      return;
    };
    let Some(stats) = open.stats.get_mut(channel) else {
      return;
    };
    for (s, charge) in stats.iter_mut().zip(sums.iter()) {
      if *charge > 0.0 {
        s.add(*charge as f64);
      }
    }
  }

  /// The slice which is currently filled, if any
  pub fn current_pedvars(&self, window : usize) -> Option<Vec<f32>> {
    let open = self.current.as_ref()?;
    if window == 0 || window > self.n_windows {
      return None;
    }
    Some(open.stats.iter().map(|s| s[window - 1].finalize().1 as f32).collect())
  }

  fn close(&mut self, rotation : &dyn FieldRotation) {
    let Some(open) = self.current.take() else {
      return;
    };
    let mut slice  = TimeSlicePedestal::new();
    slice.mjd      = open.mjd;
    slice.time     = open.time;
    slice.start    = open.start;
    slice.end      = open.start + self.slice_length;
    slice.n_events = open.n_events;
    for stats in &open.stats {
      let (ped, pedvars, _) = pedestal_from_stats(stats);
      slice.peds.push(ped);
      slice.pedvars.push(pedvars);
    }
    let (x, y) = rotation.derotate(self.tel_id, open.last_mjd, open.last_time,
                                   &self.pixel_x, &self.pixel_y);
    slice.pixel_x = x;
    slice.pixel_y = y;
    debug!("Telescope {}: closed time slice {} with {} events",
           self.tel_id, self.slices.slices.len(), slice.n_events);
    self.slices.slices.push(slice);
  }

  /// The most recently closed slice
  pub fn last_slice(&self) -> Option<&TimeSlicePedestal> {
    self.slices.slices.last()
  }

  /// Close the last slice at the end of the run
  pub fn finish(&mut self, rotation : &dyn FieldRotation) -> &TimeSlicePedestals {
    self.close(rotation);
    info!("Telescope {}: {} pedestal time slices", self.tel_id, self.slices.slices.len());
    &self.slices
  }
}

/// Per channel charge histograms of one telescope
/// type and window
#[derive(Debug, Clone)]
pub struct ChannelHistograms {
  pub window   : usize,
  pub channels : Vec<ChargeHistogram>,
}

/// Charge histograms for the IPR curves
///
/// The binning of each (type, window) is fixed by the
/// charges of the first event seen for that type.
#[derive(Debug, Clone)]
pub struct IprChargeHistograms {
  pub gain_path        : GainPath,
  pub windows          : Vec<usize>,
  pub n_bins           : usize,
  pub combine_channels : bool,
  hists                : BTreeMap<TelescopeType, Vec<ChannelHistograms>>,
}

impl IprChargeHistograms {

  pub fn new(gain_path : GainPath, windows : Vec<usize>, n_bins : usize, combine_channels : bool) -> Self {
    Self {
      gain_path        : gain_path,
      windows          : windows,
      n_bins           : n_bins,
      combine_channels : combine_channels,
      hists            : BTreeMap::<TelescopeType, Vec<ChannelHistograms>>::new(),
    }
  }

  pub fn is_sized(&self, tel_type : TelescopeType) -> bool {
    self.hists.contains_key(&tel_type)
  }

  /// Zero suppressed channels only contribute when
  /// channels are combined
  pub fn accepts(&self, ch : &ChannelData, is_low_gain : bool, zero_suppressed_run : bool) -> bool {
    if is_low_gain != self.gain_path.is_low() {
      return false;
    }
    self.combine_channels || !(zero_suppressed_run && ch.zero_suppressed)
  }

  /// Range of the histograms of one window from the
  /// smallest and largest charge of an event, widened
  /// to leave room for the tails
  pub fn range_from_charges(charges : &[f32], window : usize) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for c in charges {
      if *c > 0.0 {
        min = f64::min(min, *c as f64);
        max = f64::max(max, *c as f64);
      }
    }
    if min > max {
      return (0.0, 100.0*window as f64);
    }
    let width = f64::max(max - min, window as f64);
    (f64::max(min - width, 0.0), max + 4.0*width)
  }

  /// Book the histograms of one type from the window
  /// sums of its first event, `sums[ch][w-1]`
  pub fn size_from_event(&mut self, tel_type : TelescopeType, sums : &[Vec<f32>]) -> Result<(), CalibrationError> {
    let mut booked = Vec::<ChannelHistograms>::with_capacity(self.windows.len());
    for w in &self.windows {
      let charges : Vec<f32> = sums.iter()
        .filter_map(|s| s.get(w - 1).copied())
        .collect();
      let (low, high) = Self::range_from_charges(&charges, *w);
      debug!("IPR histograms for telescope type {}, window {}: [{:.1}, {:.1})", tel_type, w, low, high);
      let mut channels = Vec::<ChargeHistogram>::with_capacity(sums.len());
      for _ in 0..sums.len() {
        channels.push(ChargeHistogram::new(self.n_bins, low, high)?);
      }
      booked.push(ChannelHistograms {
        window   : *w,
        channels : channels,
      });
    }
    self.hists.insert(tel_type, booked);
    Ok(())
  }

  /// Fill the window sums of one channel
  pub fn fill(&mut self, tel_type : TelescopeType, channel : usize, sums : &[f32]) {
    let Some(hists) = self.hists.get_mut(&tel_type) else {
      return;
    };
    for h in hists.iter_mut() {
      let charge = match sums.get(h.window - 1) {
        Some(c) if *c > 0.0 => *c,
        _ => continue
      };
      if let Some(hist) = h.channels.get_mut(channel) {
        hist.fill(charge as f64);
      }
    }
  }

  pub fn get(&self, tel_type : TelescopeType, window : usize) -> Option<&ChannelHistograms> {
    self.hists.get(&tel_type)?.iter().find(|h| h.window == window)
  }

  pub fn telescope_types(&self) -> Vec<TelescopeType> {
    self.hists.keys().copied().collect()
  }

  /// Export all histograms of one type
  pub fn distributions(&self, tel_type : TelescopeType) -> Vec<ChargeDistribution> {
    let mut dists = Vec::<ChargeDistribution>::new();
    if let Some(hists) = self.hists.get(&tel_type) {
      for h in hists {
        for (ch, hist) in h.channels.iter().enumerate() {
          dists.push(ChargeDistribution {
            channel : ch as u16,
            window  : h.window as u16,
            low     : hist.low as f32,
            high    : hist.high as f32,
            counts  : hist.bins().iter().map(|b| b.count as f32).collect(),
          });
        }
      }
    }
    dists
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use vts_dataclasses::run::TelescopeDescription;

  fn telescope(tel_id : u32, n_channels : u16) -> TelescopeDescription {
    let mut desc = TelescopeDescription::new(tel_id, TelescopeType(1), n_channels, 16);
    desc.pixel_x = vec![1.0;n_channels as usize];
    desc.pixel_y = vec![-1.0;n_channels as usize];
    desc
  }

  #[test]
  fn accumulate_guards() {
    let mut acc = PedestalAccumulator::new(GainPath::High, 4);
    acc.register(&telescope(1, 2));
    assert!(!acc.accumulate(TelescopeType(1), 1, 0, 1, 0.0));
    assert!(!acc.accumulate(TelescopeType(1), 1, 0, 1, -3.0));
    assert!(!acc.accumulate(TelescopeType(1), 1, 0, 5, 10.0));
    assert!(!acc.accumulate(TelescopeType(1), 1, 2, 1, 10.0));
    assert!(!acc.accumulate(TelescopeType(2), 1, 0, 1, 10.0));
    assert!(acc.accumulate(TelescopeType(1), 1, 0, 1, 10.0));
    assert_eq!(acc.finalize(TelescopeType(1), 1, 0, 1), Some((10.0, 0.0, 1)));
    acc.reset(TelescopeType(1));
    assert_eq!(acc.finalize(TelescopeType(1), 1, 0, 1), Some((0.0, 0.0, 0)));
  }

  #[test]
  fn pedestal_from_largest_window() {
    let mut acc = PedestalAccumulator::new(GainPath::High, 2);
    acc.register(&telescope(1, 1));
    acc.accumulate_sums(TelescopeType(1), 1, 0, &[10.0, 18.0]);
    acc.accumulate_sums(TelescopeType(1), 1, 0, &[12.0, 22.0]);
    let set = acc.pedestal_set(TelescopeType(1), 1).unwrap();
    assert_eq!(set.ped(0), Some(10.0));
    assert_eq!(set.pedvar(0, 1), Some(1.0));
    assert_eq!(set.pedvar(0, 2), Some(2.0));
    assert_eq!(set.entries[0], 2);
  }

  #[test]
  fn gain_path_and_zero_suppression_gate() {
    let acc = PedestalAccumulator::new(GainPath::Low, 2);
    let mut ch = ChannelData::new(0);
    assert!(!acc.accepts(&ch, false, false));
    assert!(acc.accepts(&ch, true, false));
    ch.zero_suppressed = true;
    assert!(!acc.accepts(&ch, true, true));
    assert!(acc.accepts(&ch, true, false));
    let ipr = IprChargeHistograms::new(GainPath::Low, vec![1], 10, true);
    assert!(ipr.accepts(&ch, true, true));
    assert!(!ipr.accepts(&ch, false, true));
  }

  #[test]
  fn ascii_summary_with_low_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let filename = dir.path().join("Tel_1").join("100.ped");
    let mut acc = PedestalAccumulator::new(GainPath::High, 2);
    acc.register(&telescope(1, 2));
    for _ in 0..5 {
      acc.accumulate_sums(TelescopeType(1), 1, 0, &[10.0, 20.0]);
    }
    for _ in 0..120 {
      acc.accumulate_sums(TelescopeType(1), 1, 1, &[10.0, 20.0]);
    }
    acc.write_ascii(TelescopeType(1), 1, &filename, 100).unwrap();
    let text  = std::fs::read_to_string(&filename).unwrap();
    let lines : Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "1 0 0.0000 0.0000 0.0000");
    assert_eq!(lines[1], "1 1 10.0000 0.0000 0.0000");
  }

  #[test]
  fn slice_length_is_stretched() {
    assert_eq!(stretched_slice_length(180.0, 1000.0), 200.0);
    assert_eq!(stretched_slice_length(180.0, 100.0), 180.0);
    assert_eq!(stretched_slice_length(180.0, 360.0), 180.0);
  }

  #[test]
  fn time_slices_close_on_boundaries() {
    // 1000 s run, one event every 10 s
    let desc = telescope(4, 3);
    let mut builder = TimeSliceBuilder::new(&desc, 2, 180.0, 1000.0);
    let mut n_closed = 0;
    for k in 0..=100 {
      if builder.new_event(60000, 1000.0 + 10.0*k as f64, &NoFieldRotation) {
        n_closed += 1;
      }
      builder.accumulate_sums(0, &[5.0, 10.0]);
    }
    assert_eq!(n_closed, 4);
    let slices = builder.finish(&NoFieldRotation);
    assert_eq!(slices.slices.len(), 5);
    assert_eq!(slices.slices[0].n_events, 21);
    assert_eq!(slices.slices[1].time, 1210.0);
    assert_eq!(slices.slices[4].peds[0], 5.0);
    assert_eq!(slices.slices[4].pixel_x, vec![1.0;3]);
    let n_events : u32 = slices.slices.iter().map(|s| s.n_events).sum();
    assert_eq!(n_events, 101);
  }

  #[test]
  fn ipr_histograms_from_first_event() {
    let mut ipr = IprChargeHistograms::new(GainPath::High, vec![2], 50, false);
    assert!(!ipr.is_sized(TelescopeType(1)));
    let sums = vec![vec![10.0, 40.0], vec![11.0, 44.0], vec![0.0, 0.0]];
    ipr.size_from_event(TelescopeType(1), &sums).unwrap();
    assert!(ipr.is_sized(TelescopeType(1)));
    let h = ipr.get(TelescopeType(1), 2).unwrap();
    assert_eq!(h.channels.len(), 3);
    // width = max(44-40, 2) = 4
    assert_eq!(h.channels[0].low, 36.0);
    assert_eq!(h.channels[0].high, 60.0);
    ipr.fill(TelescopeType(1), 1, &[11.0, 44.0]);
    ipr.fill(TelescopeType(1), 1, &[11.0, 0.0]);
    let h = ipr.get(TelescopeType(1), 2).unwrap();
    assert_eq!(h.channels[1].entries(), 1.0);
    assert_eq!(ipr.distributions(TelescopeType(1)).len(), 3);
  }
}
