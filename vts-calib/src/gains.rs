//! Relative gains and time offsets from flasher events
//!
//! For every qualifying flasher event the charge of each
//! channel is compared to the camera average of the same
//! event (relative gain), the pulse arrival time to the
//! camera average arrival time (time offset). Both enter
//! running statistics and histograms per channel, the
//! latter provide the medians.
//!

use std::fmt;
use std::fs::{self,
              File};
use std::io::{BufWriter,
              Write};
use std::path::Path;

use vts_dataclasses::calibrations::{GainSet,
                                    TZeroSet,
                                    ToffSet};
use vts_dataclasses::errors::CalibrationError;
use vts_dataclasses::stats::{ChargeHistogram,
                             RunningStats};
use vts_dataclasses::GainPath;

use crate::settings::GainSettings;

/// Flasher events need a minimum total charge
pub fn is_qualifying_event(total_charge : f64, threshold : f64) -> bool {
  total_charge > threshold
}

/// Why a flasher event was not used
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum EventVeto {
  TooManySaturated(usize),
  TooManyLowGain(usize),
  TooFewLowGain(usize),
}

impl fmt::Display for EventVeto {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      EventVeto::TooManySaturated(n) => write!(f, "<EventVeto: {} saturated channels>", n),
      EventVeto::TooManyLowGain(n)   => write!(f, "<EventVeto: {} low gain channels in high gain pass>", n),
      EventVeto::TooFewLowGain(n)    => write!(f, "<EventVeto: only {} low gain channels in low gain pass>", n),
    }
  }
}

/// Per event vetoes of the flasher analysis
///
/// * more than `max_saturated_channels` saturated channels
/// * high gain: more than `max_low_gain_channels` low gain channels
/// * low gain: less than `min_low_gain_fraction` of the
///   channels in low gain
pub fn quality_gate(n_low_gain  : usize,
                    n_saturated : usize,
                    n_channels  : usize,
                    gain_path   : GainPath,
                    settings    : &GainSettings) -> Result<(), EventVeto> {
  if n_saturated > settings.max_saturated_channels {
    return Err(EventVeto::TooManySaturated(n_saturated));
  }
  match gain_path {
    GainPath::High => {
      if n_low_gain > settings.max_low_gain_channels {
        return Err(EventVeto::TooManyLowGain(n_low_gain));
      }
    }
    GainPath::Low => {
      if (n_low_gain as f64) < settings.min_low_gain_fraction * n_channels as f64 {
        return Err(EventVeto::TooFewLowGain(n_low_gain));
      }
    }
  }
  Ok(())
}

/// Summary of a distribution
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DistributionSummary {
  pub mean    : f64,
  pub median  : f64,
  pub rms     : f64,
  pub entries : u64,
}

impl fmt::Display for DistributionSummary {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DistributionSummary: mean {:.3}, median {:.3}, rms {:.3}, n {}>",
           self.mean, self.median, self.rms, self.entries)
  }
}

/// Running statistics together with a histogram for
/// the median
#[derive(Debug, Clone)]
struct Distribution {
  stats : RunningStats,
  hist  : ChargeHistogram,
}

impl Distribution {

  fn new(n_bins : usize, low : f64, high : f64) -> Result<Self, CalibrationError> {
    Ok(Self {
      stats : RunningStats::new(),
      hist  : ChargeHistogram::new(n_bins, low, high)?,
    })
  }

  fn add(&mut self, x : f64) {
    self.stats.add(x);
    self.hist.fill(x);
  }

  fn summary(&self) -> Option<DistributionSummary> {
    if self.stats.is_empty() {
      return None;
    }
    let (mean, rms) = self.stats.finalize();
    Some(DistributionSummary {
      mean    : mean,
      median  : self.hist.median().unwrap_or(mean),
      rms     : rms,
      entries : self.stats.n,
    })
  }
}

/// Mean pedestal subtracted trace per channel
#[derive(Debug, Clone)]
pub struct PulseShapeProfiles {
  /// [channel][sample]
  profiles : Vec<Vec<RunningStats>>,
}

impl PulseShapeProfiles {

  pub fn new(n_channels : usize) -> Self {
    Self {
      profiles : vec![Vec::<RunningStats>::new();n_channels],
    }
  }

  pub fn add(&mut self, channel : usize, samples : &[u16], ped : f32) {
    let Some(profile) = self.profiles.get_mut(channel) else {
      return;
    };
    if profile.len() < samples.len() {
      profile.resize(samples.len(), RunningStats::new());
    }
    for (s, value) in profile.iter_mut().zip(samples.iter()) {
      s.add(*value as f64 - ped as f64);
    }
  }

  pub fn mean_trace(&self, channel : usize) -> Option<Vec<f32>> {
    let profile = self.profiles.get(channel)?;
    Some(profile.iter().map(|s| s.mean() as f32).collect())
  }

  /// `ch s_0 s_1 ...` per line
  pub fn write_ascii(&self, filename : &Path) -> Result<(), CalibrationError> {
    let mut writer = create_writer(filename)?;
    for ch in 0..self.profiles.len() {
      let mut line = format!("{}", ch);
      for v in self.mean_trace(ch).unwrap_or_default() {
        line += &format!(" {:.3}", v);
      }
      writeln!(writer, "{}", line).map_err(|e| CalibrationError::io(filename, e))?;
    }
    writer.flush().map_err(|e| CalibrationError::io(filename, e))
  }
}

fn create_writer(filename : &Path) -> Result<BufWriter<File>, CalibrationError> {
  if let Some(dir) = filename.parent() {
    fs::create_dir_all(dir).map_err(|e| CalibrationError::io(dir, e))?;
  }
  let file = File::create(filename).map_err(|e| CalibrationError::io(filename, e))?;
  Ok(BufWriter::new(file))
}

/// Charge and arrival time of one channel in a
/// flasher event
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FlasherSignal {
  pub channel : usize,
  pub sum     : f32,
  pub t0      : f32,
  pub dead    : bool,
  pub masked  : bool,
}

/// Gains and time offsets of one telescope
#[derive(Debug, Clone)]
pub struct GainTimingAccumulator {
  pub tel_id       : u32,
  pub gain_path    : GainPath,
  pub min_sum      : f64,
  pub n_events     : u64,
  gains            : Vec<Distribution>,
  toffs            : Vec<Distribution>,
  pub pulse_shapes : Option<PulseShapeProfiles>,
}

impl GainTimingAccumulator {

  pub fn new(tel_id     : u32,
             n_channels : usize,
             gain_path  : GainPath,
             settings   : &GainSettings) -> Result<Self, CalibrationError> {
    let mut gains = Vec::<Distribution>::with_capacity(n_channels);
    let mut toffs = Vec::<Distribution>::with_capacity(n_channels);
    for _ in 0..n_channels {
      gains.push(Distribution::new(settings.gain_histogram_bins, 0.0, settings.gain_histogram_max)?);
      toffs.push(Distribution::new(settings.toff_histogram_bins,
                                   -settings.toff_histogram_max,
                                   settings.toff_histogram_max)?);
    }
    let pulse_shapes = if settings.pulse_shapes {
      Some(PulseShapeProfiles::new(n_channels))
    } else {
      None
    };
    Ok(Self {
      tel_id       : tel_id,
      gain_path    : gain_path,
      min_sum      : settings.min_integration_sum,
      n_events     : 0,
      gains        : gains,
      toffs        : toffs,
      pulse_shapes : pulse_shapes,
    })
  }

  pub fn n_channels(&self) -> usize {
    self.gains.len()
  }

  /// Add one channel. Channels below the minimum sum,
  /// dead or masked channels are ignored.
  ///
  /// Returns true if the channel was used.
  pub fn accumulate(&mut self,
                    channel  : usize,
                    sum      : f32,
                    mean_sum : f64,
                    t        : f32,
                    mean_t   : f64,
                    dead     : bool,
                    masked   : bool) -> bool {
    if dead || masked || (sum as f64) <= self.min_sum || mean_sum <= 0.0 {
      return false;
    }
    if channel >= self.gains.len() {
      return false;
    }
    self.gains[channel].add(sum as f64 / mean_sum);
    self.toffs[channel].add(t as f64 - mean_t);
    true
  }

  /// Add a complete flasher event. The camera averages
  /// are taken over the usable channels of the event.
  ///
  /// Returns the number of channels used.
  pub fn accumulate_event(&mut self, signals : &[FlasherSignal]) -> usize {
    let min_sum = self.min_sum;
    let usable  = |s : &&FlasherSignal| !s.dead && !s.masked && s.sum as f64 > min_sum;
    let mut charge = RunningStats::new();
    let mut time   = RunningStats::new();
    for s in signals.iter().filter(usable) {
      charge.add(s.sum as f64);
      time.add(s.t0 as f64);
    }
    if charge.is_empty() {
      return 0;
    }
    let mean_sum = charge.mean();
    let mean_t   = time.mean();
    let mut n_used = 0usize;
    for s in signals {
      if self.accumulate(s.channel, s.sum, mean_sum, s.t0, mean_t, s.dead, s.masked) {
        n_used += 1;
      }
    }
    self.n_events += 1;
    n_used
  }

  /// (mean, median, rms) of the relative gain and of
  /// the time offset of one channel
  pub fn finalize(&self, channel : usize) -> Option<(DistributionSummary, DistributionSummary)> {
    let gain = self.gains.get(channel)?.summary()?;
    let toff = self.toffs.get(channel)?.summary()?;
    Some((gain, toff))
  }

  /// Mean relative gain and its rms per channel.
  /// Channels without entries get a gain of 0.
  pub fn gain_set(&self) -> GainSet {
    let mut set = GainSet::neutral(self.tel_id, self.n_channels());
    set.low_gain   = self.gain_path.is_low();
    set.is_default = false;
    for (ch, dist) in self.gains.iter().enumerate() {
      let (g, var) = dist.summary().map(|s| (s.mean, s.rms)).unwrap_or((0.0, 0.0));
      set.gain[ch]     = g as f32;
      set.gain_var[ch] = var as f32;
    }
    set
  }

  pub fn toff_set(&self) -> ToffSet {
    let mut set = ToffSet::neutral(self.tel_id, self.n_channels());
    set.low_gain   = self.gain_path.is_low();
    set.is_default = false;
    for (ch, dist) in self.toffs.iter().enumerate() {
      let (t, var) = dist.summary().map(|s| (s.mean, s.rms)).unwrap_or((0.0, 0.0));
      set.toff[ch]     = t as f32;
      set.toff_var[ch] = var as f32;
    }
    set
  }

  /// Write `ch gain gainvar` and `ch toff toffvar` files
  pub fn write_ascii(&self, gain_file : &Path, toff_file : &Path) -> Result<(), CalibrationError> {
    let gains = self.gain_set();
    let mut writer = create_writer(gain_file)?;
    for ch in 0..gains.gain.len() {
      writeln!(writer, "{} {:.4} {:.4}", ch, gains.gain[ch], gains.gain_var[ch])
        .map_err(|e| CalibrationError::io(gain_file, e))?;
    }
    writer.flush().map_err(|e| CalibrationError::io(gain_file, e))?;
    let toffs = self.toff_set();
    let mut writer = create_writer(toff_file)?;
    for ch in 0..toffs.toff.len() {
      writeln!(writer, "{} {:.4} {:.4}", ch, toffs.toff[ch], toffs.toff_var[ch])
        .map_err(|e| CalibrationError::io(toff_file, e))?;
    }
    writer.flush().map_err(|e| CalibrationError::io(toff_file, e))?;
    info!("Telescope {} ({}): gains and toffs from {} events written to {} and {}",
          self.tel_id, self.gain_path, self.n_events, gain_file.display(), toff_file.display());
    Ok(())
  }
}

impl fmt::Display for GainTimingAccumulator {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<GainTimingAccumulator: tel {} ({}), {} channels, {} events>",
           self.tel_id, self.gain_path, self.n_channels(), self.n_events)
  }
}

/// Average pulse arrival time per channel
#[derive(Debug, Clone)]
pub struct TZeroAccumulator {
  pub tel_id    : u32,
  pub gain_path : GainPath,
  pub min_sum   : f64,
  pub n_events  : u64,
  tzeros        : Vec<Distribution>,
}

impl TZeroAccumulator {

  /// T0 histograms span the readout window `[0, n_samples)`
  pub fn new(tel_id     : u32,
             n_channels : usize,
             n_samples  : usize,
             gain_path  : GainPath,
             settings   : &GainSettings) -> Result<Self, CalibrationError> {
    let high = f64::max(n_samples as f64, 1.0);
    let mut tzeros = Vec::<Distribution>::with_capacity(n_channels);
    for _ in 0..n_channels {
      tzeros.push(Distribution::new(settings.toff_histogram_bins, 0.0, high)?);
    }
    Ok(Self {
      tel_id    : tel_id,
      gain_path : gain_path,
      min_sum   : settings.min_integration_sum,
      n_events  : 0,
      tzeros    : tzeros,
    })
  }

  pub fn accumulate(&mut self, channel : usize, sum : f32, t0 : f32, dead : bool) -> bool {
    if dead || (sum as f64) <= self.min_sum {
      return false;
    }
    match self.tzeros.get_mut(channel) {
      Some(d) => {
        d.add(t0 as f64);
        true
      }
      None => false
    }
  }

  /// (mean, median, variance) of the arrival time
  pub fn finalize(&self, channel : usize) -> Option<(f64, f64, f64)> {
    let s = self.tzeros.get(channel)?.summary()?;
    Some((s.mean, s.median, s.rms*s.rms))
  }

  pub fn tzero_set(&self) -> TZeroSet {
    let mut set  = TZeroSet::new(self.tel_id, self.tzeros.len());
    set.low_gain = self.gain_path.is_low();
    for ch in 0..self.tzeros.len() {
      if let Some((mean, median, var)) = self.finalize(ch) {
        set.mean[ch]     = mean as f32;
        set.median[ch]   = median as f32;
        set.variance[ch] = var as f32;
      }
    }
    set
  }

  /// `ch mean median variance` per line
  pub fn write_ascii(&self, filename : &Path) -> Result<(), CalibrationError> {
    let set = self.tzero_set();
    let mut writer = create_writer(filename)?;
    for ch in 0..set.mean.len() {
      writeln!(writer, "{} {:.4} {:.4} {:.4}", ch, set.mean[ch], set.median[ch], set.variance[ch])
        .map_err(|e| CalibrationError::io(filename, e))?;
    }
    writer.flush().map_err(|e| CalibrationError::io(filename, e))?;
    info!("Telescope {} ({}): average T0 from {} events written to {}",
          self.tel_id, self.gain_path, self.n_events, filename.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn qualifying_events() {
    assert!(is_qualifying_event(50001.0, 50000.0));
    assert!(!is_qualifying_event(50000.0, 50000.0));
  }

  #[test]
  fn saturation_veto_boundary() {
    let settings = GainSettings::new();
    assert_eq!(quality_gate(0, 10, 500, GainPath::High, &settings), Ok(()));
    assert_eq!(quality_gate(0, 11, 500, GainPath::High, &settings),
               Err(EventVeto::TooManySaturated(11)));
  }

  #[test]
  fn gain_path_vetoes() {
    let settings = GainSettings::new();
    assert_eq!(quality_gate(5, 0, 500, GainPath::High, &settings), Ok(()));
    assert_eq!(quality_gate(6, 0, 500, GainPath::High, &settings),
               Err(EventVeto::TooManyLowGain(6)));
    assert_eq!(quality_gate(350, 0, 500, GainPath::Low, &settings), Ok(()));
    assert_eq!(quality_gate(349, 0, 500, GainPath::Low, &settings),
               Err(EventVeto::TooFewLowGain(349)));
  }

  #[test]
  fn relative_gains_and_offsets() {
    let mut settings = GainSettings::new();
    settings.min_integration_sum = 50.0;
    let mut acc = GainTimingAccumulator::new(1, 4, GainPath::High, &settings).unwrap();
    let signal = |channel, sum, t0| FlasherSignal {
      channel : channel,
      sum     : sum,
      t0      : t0,
      dead    : false,
      masked  : false,
    };
    for _ in 0..10 {
      let mut signals = vec![signal(0, 100.0, 5.0),
                             signal(1, 200.0, 7.0),
                             signal(2, 300.0, 9.0),
                             signal(3, 400.0, 3.0)];
      signals[3].dead = true;
      assert_eq!(acc.accumulate_event(&signals), 3);
    }
    let (gain, toff) = acc.finalize(1).unwrap();
    assert!((gain.mean - 1.0).abs() < 1e-9);
    assert!((gain.median - 1.0).abs() < 0.02);
    assert!(gain.rms < 1e-6);
    assert!((toff.mean - 0.0).abs() < 1e-9);
    let (gain, toff) = acc.finalize(2).unwrap();
    assert!((gain.mean - 1.5).abs() < 1e-9);
    assert!((toff.mean - 2.0).abs() < 1e-9);
    assert!(acc.finalize(3).is_none());
    let gains = acc.gain_set();
    assert_eq!(gains.gain[3], 0.0);
    assert!(!gains.is_default);
  }

  #[test]
  fn small_signals_do_not_count() {
    let settings = GainSettings::new();
    let mut acc = GainTimingAccumulator::new(1, 2, GainPath::High, &settings).unwrap();
    assert!(!acc.accumulate(0, 10.0, 100.0, 5.0, 5.0, false, false));
    assert!(!acc.accumulate(0, 100.0, 100.0, 5.0, 5.0, false, true));
    assert!(!acc.accumulate(5, 100.0, 100.0, 5.0, 5.0, false, false));
    assert!(acc.accumulate(0, 100.0, 100.0, 5.0, 5.0, false, false));
  }

  #[test]
  fn average_tzero() {
    let settings = GainSettings::new();
    let mut acc = TZeroAccumulator::new(2, 1, 24, GainPath::High, &settings).unwrap();
    for t in [4.0, 6.0, 5.0, 5.0] {
      assert!(acc.accumulate(0, 100.0, t, false));
    }
    assert!(!acc.accumulate(0, 10.0, 20.0, false));
    let (mean, median, var) = acc.finalize(0).unwrap();
    assert!((mean - 5.0).abs() < 1e-9);
    assert!((median - 5.0).abs() < 0.1);
    assert!((var - 0.5).abs() < 1e-9);
  }

  #[test]
  fn mean_pulse_shape() {
    let mut profiles = PulseShapeProfiles::new(2);
    profiles.add(1, &[10, 20, 30], 10.0);
    profiles.add(1, &[10, 40, 10], 10.0);
    assert_eq!(profiles.mean_trace(1), Some(vec![0.0, 20.0, 10.0]));
    assert_eq!(profiles.mean_trace(0), Some(vec![]));
  }
}
