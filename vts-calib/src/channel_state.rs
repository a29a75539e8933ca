//! Dead channel classification
//!
//! Every channel of a camera is classified once per
//! gain path (and optionally once per time slice) by
//! a fixed sequence of tests on its calibration
//! values. The first failing test determines the
//! reason. Saturated traces are flagged per event
//! during the signal extraction.
//!

use std::collections::HashSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng,
           SeedableRng};
use serde::{Deserialize, Serialize};

use vts_dataclasses::calibrations::{GainSet,
                                    ToffSet};
use vts_dataclasses::constants::MAX_RANDOM_DEAD_DRAWS;
use vts_dataclasses::errors::CalibrationError;
use vts_dataclasses::serialization::SerializationError;
use vts_dataclasses::GainPath;

use crate::settings::ChannelStateSettings;

/// Why a channel is not used
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeadReason {
  Alive                    = 0u8,
  PedestalOutOfRange       = 1u8,
  AbsolutePedvarOutOfRange = 2u8,
  SmallRelativePedvar      = 3u8,
  LargeRelativePedvar      = 4u8,
  GainOutOfRange           = 5u8,
  GainVarianceOutOfRange   = 6u8,
  LargeGainDeviation       = 7u8,
  LargeTimeOffset          = 8u8,
  FadcStopSignal           = 9u8,
  Masked                   = 10u8,
  UserSet                  = 11u8,
  McDead                   = 12u8,
  L1RateOutOfRange         = 13u8,
  HvOutOfRange             = 14u8,
  TraceMax                 = 15u8,
  RandomlyDisabled         = 16u8,
}

impl DeadReason {

  pub fn is_dead(&self) -> bool {
    *self != DeadReason::Alive
  }

  pub fn code(&self) -> u8 {
    *self as u8
  }

  pub fn description(&self) -> &'static str {
    match self {
      DeadReason::Alive                    => "alive",
      DeadReason::PedestalOutOfRange       => "outside pedestal range",
      DeadReason::AbsolutePedvarOutOfRange => "small absolute pedvars",
      DeadReason::SmallRelativePedvar      => "small relative pedvars",
      DeadReason::LargeRelativePedvar      => "large relative pedvars",
      DeadReason::GainOutOfRange           => "outside gain range",
      DeadReason::GainVarianceOutOfRange   => "small/large gain variance",
      DeadReason::LargeGainDeviation       => "large gain deviation",
      DeadReason::LargeTimeOffset          => "large time offset",
      DeadReason::FadcStopSignal           => "FADC stop signal",
      DeadReason::Masked                   => "masked",
      DeadReason::UserSet                  => "user set",
      DeadReason::McDead                   => "MC set",
      DeadReason::L1RateOutOfRange         => "L1 rate out of range",
      DeadReason::HvOutOfRange             => "HV out of range",
      DeadReason::TraceMax                 => "trace max",
      DeadReason::RandomlyDisabled         => "disabled randomly",
    }
  }
}

impl fmt::Display for DeadReason {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DeadReason {}: {}>", self.code(), self.description())
  }
}

impl TryFrom<u8> for DeadReason {
  type Error = SerializationError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    match value {
      0  => Ok(DeadReason::Alive),
      1  => Ok(DeadReason::PedestalOutOfRange),
      2  => Ok(DeadReason::AbsolutePedvarOutOfRange),
      3  => Ok(DeadReason::SmallRelativePedvar),
      4  => Ok(DeadReason::LargeRelativePedvar),
      5  => Ok(DeadReason::GainOutOfRange),
      6  => Ok(DeadReason::GainVarianceOutOfRange),
      7  => Ok(DeadReason::LargeGainDeviation),
      8  => Ok(DeadReason::LargeTimeOffset),
      9  => Ok(DeadReason::FadcStopSignal),
      10 => Ok(DeadReason::Masked),
      11 => Ok(DeadReason::UserSet),
      12 => Ok(DeadReason::McDead),
      13 => Ok(DeadReason::L1RateOutOfRange),
      14 => Ok(DeadReason::HvOutOfRange),
      15 => Ok(DeadReason::TraceMax),
      16 => Ok(DeadReason::RandomlyDisabled),
      _  => Err(SerializationError::UnknownEnumValue(value)),
    }
  }
}

/// Access to slow control values of individual
/// channels, e.g. from a monitoring database
pub trait ChannelMonitor {
  /// Level 1 trigger rate of a channel in Hz
  fn l1_rate(&self, tel_id : u32, channel : u16) -> Option<f32>;
  /// High voltage of a channel in V
  fn hv(&self, tel_id : u32, channel : u16) -> Option<f32>;
}

/// Calibration values entering the dead channel
/// tests of one telescope and gain path
#[derive(Default)]
pub struct ChannelStateInputs<'a> {
  /// pedestal per sample
  pub peds      : &'a [f32],
  /// pedestal variation for the current summation window
  pub pedvars   : &'a [f32],
  /// only set if gains were read from a calibration
  pub gains     : Option<&'a GainSet>,
  pub toffs     : Option<&'a ToffSet>,
  pub fadc_stop : &'a [u16],
  /// channels disabled in the pixel status file
  pub user_set  : &'a [u16],
  pub masked    : &'a [u16],
  /// dead channels of the simulation truth
  pub mc_dead   : &'a [u16],
  pub monitor   : Option<&'a dyn ChannelMonitor>,
}

fn in_range(x : f32, low : f32, high : f32) -> bool {
  x >= low && x <= high
}

/// Mean of `values` over the channels which are still
/// alive and have a positive value
fn camera_mean(values : &[f32], states : &[DeadReason]) -> Option<f32> {
  let mut sum = 0.0f64;
  let mut n   = 0usize;
  for (v, s) in values.iter().zip(states.iter()) {
    if !s.is_dead() && *v > 0.0 {
      sum += *v as f64;
      n   += 1;
    }
  }
  if n == 0 {
    return None;
  }
  Some((sum / n as f64) as f32)
}

/// Run the test sequence for all channels of a camera
///
/// The first failing test wins, FADC stop channels
/// are set before anything else.
pub fn classify(tel_id     : u32,
                n_channels : usize,
                inputs     : &ChannelStateInputs,
                settings   : &ChannelStateSettings) -> Vec<DeadReason> {
  let mut states = vec![DeadReason::Alive;n_channels];
  let mark = |states : &mut Vec<DeadReason>, ch : usize, reason : DeadReason| {
    if let Some(s) = states.get_mut(ch) {
      if !s.is_dead() {
        *s = reason;
      }
    }
  };

  // (1) FADC stop/trigger channels
  for ch in inputs.fadc_stop {
    mark(&mut states, *ch as usize, DeadReason::FadcStopSignal);
  }

  // (2) pedestal range
  for ch in 0..n_channels {
    if let Some(ped) = inputs.peds.get(ch) {
      if !in_range(*ped, settings.ped_min, settings.ped_max) {
        mark(&mut states, ch, DeadReason::PedestalOutOfRange);
      }
    }
  }

  // (3) absolute pedvars
  for ch in 0..n_channels {
    if let Some(pv) = inputs.pedvars.get(ch) {
      if !in_range(*pv, settings.pedvar_abs_min, settings.pedvar_abs_max) {
        mark(&mut states, ch, DeadReason::AbsolutePedvarOutOfRange);
      }
    }
  }

  // (4) pedvars relative to the camera mean
  if let Some(mean_pv) = camera_mean(inputs.pedvars, &states) {
    for ch in 0..n_channels {
      if let Some(pv) = inputs.pedvars.get(ch) {
        if *pv < settings.pedvar_rel_min * mean_pv {
          mark(&mut states, ch, DeadReason::SmallRelativePedvar);
        } else if *pv > settings.pedvar_rel_max * mean_pv {
          mark(&mut states, ch, DeadReason::LargeRelativePedvar);
        }
      }
    }
  }

  // (5) gains, only if there is a real calibration
  if let Some(gains) = inputs.gains {
    if gains.is_nontrivial() {
      for ch in 0..n_channels {
        let gain = match gains.get(ch) {
          Some(g) => g,
          None    => continue
        };
        if !in_range(gain, settings.gain_min, settings.gain_max) {
          mark(&mut states, ch, DeadReason::GainOutOfRange);
        } else if let Some(gvar) = gains.gain_var.get(ch) {
          if !in_range(*gvar, settings.gain_var_min, settings.gain_var_max) {
            mark(&mut states, ch, DeadReason::GainVarianceOutOfRange);
          }
        }
      }
      if let Some(mean_gain) = camera_mean(&gains.gain, &states) {
        for ch in 0..n_channels {
          if let Some(gain) = gains.get(ch) {
            if (gain - mean_gain).abs() > settings.gain_deviation_max {
              mark(&mut states, ch, DeadReason::LargeGainDeviation);
            }
          }
        }
      }
    } else {
      debug!("Trivial gains for telescope {}, skipping gain tests", tel_id);
    }
  }

  // (6) time offsets
  if let Some(toffs) = inputs.toffs {
    for ch in 0..n_channels {
      if let Some(toff) = toffs.get(ch) {
        if toff.abs() > settings.toff_max {
          mark(&mut states, ch, DeadReason::LargeTimeOffset);
        }
      }
    }
  }

  // (7) pixel status file and channel mask
  for ch in inputs.user_set {
    mark(&mut states, *ch as usize, DeadReason::UserSet);
  }
  for ch in inputs.masked {
    mark(&mut states, *ch as usize, DeadReason::Masked);
  }

  // (8) simulation truth
  for ch in inputs.mc_dead {
    mark(&mut states, *ch as usize, DeadReason::McDead);
  }

  // (9) slow control values
  if let Some(monitor) = inputs.monitor {
    let mut candidates = Vec::<(usize, DeadReason)>::new();
    for ch in 0..n_channels {
      if states[ch].is_dead() {
        continue;
      }
      if let Some(rate) = monitor.l1_rate(tel_id, ch as u16) {
        let low  = settings.l1_rate_min.unwrap_or(f32::MIN);
        let high = settings.l1_rate_max.unwrap_or(f32::MAX);
        if !in_range(rate, low, high) {
          candidates.push((ch, DeadReason::L1RateOutOfRange));
          continue;
        }
      }
      if let Some(hv) = monitor.hv(tel_id, ch as u16) {
        let low  = settings.hv_min.unwrap_or(f32::MIN);
        let high = settings.hv_max.unwrap_or(f32::MAX);
        if !in_range(hv, low, high) {
          candidates.push((ch, DeadReason::HvOutOfRange));
        }
      }
    }
    let limit = settings.monitor_max_dead_fraction * n_channels as f32;
    if candidates.len() as f32 > limit {
      warn!("L1/HV tests would disable {} of {} channels of telescope {}, ignoring them!",
            candidates.len(), n_channels, tel_id);
    } else {
      for (ch, reason) in candidates {
        mark(&mut states, ch, reason);
      }
    }
  }
  states
}

/// Dead channel status of one telescope
#[derive(Debug, Clone)]
pub struct ChannelStateTracker {
  pub tel_id     : u32,
  pub n_channels : usize,
  pub settings   : ChannelStateSettings,
  high_gain      : Vec<DeadReason>,
  low_gain       : Vec<DeadReason>,
  /// channels disabled randomly, kept through
  /// re-evaluations
  random_dead    : HashSet<usize>,
  /// saturated in the current event
  saturated      : Vec<bool>,
}

impl ChannelStateTracker {

  pub fn new(tel_id : u32, n_channels : usize, settings : ChannelStateSettings) -> Self {
    Self {
      tel_id      : tel_id,
      n_channels  : n_channels,
      settings    : settings,
      high_gain   : vec![DeadReason::Alive;n_channels],
      low_gain    : vec![DeadReason::Alive;n_channels],
      random_dead : HashSet::<usize>::new(),
      saturated   : vec![false;n_channels],
    }
  }

  fn states_mut(&mut self, gain_path : GainPath) -> &mut Vec<DeadReason> {
    match gain_path {
      GainPath::High => &mut self.high_gain,
      GainPath::Low  => &mut self.low_gain,
    }
  }

  pub fn states(&self, gain_path : GainPath) -> &[DeadReason] {
    match gain_path {
      GainPath::High => &self.high_gain,
      GainPath::Low  => &self.low_gain,
    }
  }

  /// Classify all channels for one gain path
  ///
  /// With `time_slice_aware` the inputs are the values
  /// of the current time slice, the result replaces
  /// the previous one silently.
  ///
  /// # Errors
  ///
  /// `CalibrationError::Fatal` if no channel survives
  pub fn evaluate(&mut self,
                  inputs           : &ChannelStateInputs,
                  gain_path        : GainPath,
                  time_slice_aware : bool) -> Result<&[DeadReason], CalibrationError> {
    let mut states = classify(self.tel_id, self.n_channels, inputs, &self.settings);
    for ch in &self.random_dead {
      if let Some(s) = states.get_mut(*ch) {
        if !s.is_dead() {
          *s = DeadReason::RandomlyDisabled;
        }
      }
    }
    let n_dead = states.iter().filter(|s| s.is_dead()).count();
    if n_dead == self.n_channels {
      error!("All {} channels of telescope {} ({}) are dead!", self.n_channels, self.tel_id, gain_path);
      return Err(CalibrationError::Fatal(
        format!("no live channel in telescope {} ({})", self.tel_id, gain_path)));
    }
    if time_slice_aware {
      debug!("Telescope {} ({}): {} dead channels in this time slice", self.tel_id, gain_path, n_dead);
    } else {
      info!("Telescope {} ({}): {} of {} channels dead", self.tel_id, gain_path, n_dead, self.n_channels);
      for (ch, s) in states.iter().enumerate() {
        if s.is_dead() {
          debug!("Telescope {} channel {} is dead: {}", self.tel_id, ch, s.description());
        }
      }
    }
    *self.states_mut(gain_path) = states;
    Ok(self.states(gain_path))
  }

  /// Disable `n` additional random channels on both gain
  /// paths. Already dead channels are skipped, after
  /// `MAX_RANDOM_DEAD_DRAWS` failed draws we give up.
  ///
  /// Returns the number of channels disabled.
  pub fn inject_random_dead(&mut self, seed : u64, n : usize) -> usize {
    if n == 0 || self.n_channels == 0 {
      return 0;
    }
    let mut rng      = StdRng::seed_from_u64(seed);
    let mut disabled = 0usize;
    let mut failed   = 0usize;
    while disabled < n {
      if failed >= MAX_RANDOM_DEAD_DRAWS {
        warn!("Telescope {}: gave up disabling random channels after {} draws, disabled {} of {}",
              self.tel_id, MAX_RANDOM_DEAD_DRAWS, disabled, n);
        break;
      }
      let ch = rng.gen_range(0..self.n_channels);
      if self.high_gain[ch].is_dead() || self.random_dead.contains(&ch) {
        failed += 1;
        continue;
      }
      self.random_dead.insert(ch);
      self.high_gain[ch] = DeadReason::RandomlyDisabled;
      if !self.low_gain[ch].is_dead() {
        self.low_gain[ch] = DeadReason::RandomlyDisabled;
      }
      disabled += 1;
    }
    disabled
  }

  /// Static status of a channel, ignoring saturation
  pub fn status(&self, channel : usize, gain_path : GainPath) -> DeadReason {
    self.states(gain_path).get(channel).copied().unwrap_or(DeadReason::Alive)
  }

  /// Status including the saturation of the current event
  pub fn event_status(&self, channel : usize, gain_path : GainPath) -> DeadReason {
    let status = self.status(channel, gain_path);
    if !status.is_dead() && self.saturated.get(channel).copied().unwrap_or(false) {
      return DeadReason::TraceMax;
    }
    status
  }

  pub fn is_dead(&self, channel : usize, gain_path : GainPath) -> bool {
    self.event_status(channel, gain_path).is_dead()
  }

  pub fn is_masked(&self, channel : usize) -> bool {
    self.status(channel, GainPath::High) == DeadReason::Masked
  }

  pub fn flag_saturated(&mut self, channel : usize) {
    if let Some(s) = self.saturated.get_mut(channel) {
      *s = true;
    }
  }

  /// Forget per event flags
  pub fn new_event(&mut self) {
    self.saturated.iter_mut().for_each(|s| *s = false);
  }

  pub fn n_dead(&self, gain_path : GainPath) -> usize {
    self.states(gain_path).iter().filter(|s| s.is_dead()).count()
  }

  /// Force a status (e.g. from a calibration file)
  pub fn set_status(&mut self, channel : usize, gain_path : GainPath, reason : DeadReason) {
    if let Some(s) = self.states_mut(gain_path).get_mut(channel) {
      *s = reason;
    }
  }
}
