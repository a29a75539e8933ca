//! Signal extraction from FADC traces
//!
//! Charges are sums over a window of samples. Timing
//! estimates are derived from the pedestal subtracted
//! trace. DST style channels without traces deliver
//! their precomputed sum and arrival time instead.
//!

use std::collections::HashMap;
use std::fmt;

use vts_dataclasses::errors::TraceError;
use vts_dataclasses::{ChannelData,
                      TelescopeEvent};

use crate::settings::TraceSettings;

/// Low gain multipliers of one telescope per
/// (extraction method, summation window)
#[derive(Debug, Clone, PartialEq)]
pub struct LowGainMultipliers {
  pub table   : HashMap<(u8, usize), f32>,
  pub default : f32,
}

impl LowGainMultipliers {

  pub fn new(default : f32) -> Self {
    Self {
      table   : HashMap::<(u8, usize), f32>::new(),
      default : default,
    }
  }

  pub fn insert(&mut self, method : u8, window : usize, multiplier : f32) {
    self.table.insert((method, window), multiplier);
  }

  /// Correction of a summed charge for the low gain
  /// path. 1.0 for high gain channels, otherwise the
  /// multiplier for the actual window, the original
  /// window or the default, whichever is found first.
  pub fn low_gain_correction(&self,
                             method          : u8,
                             original_window : usize,
                             actual_window   : usize,
                             is_low_gain     : bool) -> f32 {
    if !is_low_gain {
      return 1.0;
    }
    if let Some(m) = self.table.get(&(method, actual_window)) {
      return *m;
    }
    if let Some(m) = self.table.get(&(method, original_window)) {
      return *m;
    }
    self.default
  }
}

impl Default for LowGainMultipliers {
  fn default() -> Self {
    Self::new(1.0)
  }
}

/// Calibration of a single channel needed to turn a
/// raw sum into a charge
#[derive(Debug, Clone, Copy)]
pub struct GainContext<'a> {
  /// pedestal per sample of the channel's gain path
  pub ped             : f32,
  pub low_gain        : bool,
  pub method          : u8,
  /// summation window the multipliers were derived for
  pub original_window : usize,
  pub multipliers     : &'a LowGainMultipliers,
}

/// Timing estimates of a single pulse, in samples
#[derive(Debug, Clone, PartialEq)]
pub struct PulseTiming {
  /// 50% crossing of the rising edge
  pub t0     : f32,
  /// position of the largest sample
  pub t_max  : f32,
  /// pedestal subtracted amplitude
  pub max    : f32,
  /// rising edge crossings at the configured fractions
  /// of the amplitude (fraction, time)
  pub levels : Vec<(f32, f32)>,
}

impl PulseTiming {
  pub fn new() -> Self {
    Self {
      t0     : 0.0,
      t_max  : 0.0,
      max    : 0.0,
      levels : Vec::<(f32, f32)>::new(),
    }
  }
}

impl Default for PulseTiming {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for PulseTiming {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<PulseTiming: t0 {:.2}, tmax {:.2}, max {:.2}>", self.t0, self.t_max, self.max)
  }
}

/// Clip `[start, end)` to `[0, n_samples)`
pub fn clip_window(start : i64, end : i64, n_samples : usize) -> Result<(usize, usize), TraceError> {
  let start = start.clamp(0, n_samples as i64) as usize;
  let end   = end.clamp(0, n_samples as i64) as usize;
  if start >= end {
    return Err(TraceError::EmptyWindow {start, end});
  }
  Ok((start, end))
}

/// Time at which the (pedestal subtracted) trace
/// rises through `level`, searching backwards from
/// `imax` and interpolating linearly
fn rising_edge(values : &[f32], imax : usize, level : f32) -> f32 {
  let mut i = imax;
  while i > 0 {
    let lo = values[i-1];
    let hi = values[i];
    if lo <= level && hi >= level {
      if hi == lo {
        return i as f32;
      }
      return (i - 1) as f32 + (level - lo) / (hi - lo);
    }
    i -= 1;
  }
  0.0
}

/// Sums and timing from FADC traces
#[derive(Debug, Clone)]
pub struct TraceIntegrator {
  pub method          : u8,
  pub sumfirst        : usize,
  pub sumwindow       : usize,
  pub double_pass     : bool,
  pub sumwindow_pass1 : usize,
  pub pass2_offset    : usize,
  pub hilo_threshold  : Option<u16>,
  pub timing_levels   : Vec<f32>,
}

impl TraceIntegrator {

  pub fn new(settings : &TraceSettings) -> Self {
    Self {
      method          : settings.method,
      sumfirst        : settings.sumfirst,
      sumwindow       : settings.sumwindow,
      double_pass     : settings.double_pass,
      sumwindow_pass1 : settings.sumwindow_pass1,
      pass2_offset    : settings.pass2_offset,
      hilo_threshold  : settings.hilo_threshold,
      timing_levels   : settings.timing_levels.clone(),
    }
  }

  /// Hi/lo decision, readout flag or amplitude test
  pub fn is_low_gain(&self, ch : &ChannelData) -> bool {
    if ch.low_gain {
      return true;
    }
    match self.hilo_threshold {
      Some(thr) => ch.has_trace() && ch.max_sample() >= thr,
      None      => false
    }
  }

  /// Sum of the samples in `[start, end)`.
  ///
  /// Channels without a trace return the precomputed
  /// sum. Unless `for_pedestal` is set, the pedestal
  /// of `gain_ctx` is subtracted and the low gain
  /// correction applied.
  pub fn sum(&self,
             event        : &TelescopeEvent,
             channel      : usize,
             start        : i64,
             end          : i64,
             for_pedestal : bool,
             gain_ctx     : Option<&GainContext>) -> Result<f32, TraceError> {
    let ch = event.get_channel(channel)?;
    if !ch.has_trace() {
      return Ok(ch.sum);
    }
    let (start, end) = clip_window(start, end, ch.samples.len())?;
    let raw : f32 = ch.samples[start..end].iter().map(|s| *s as f32).sum();
    if for_pedestal {
      return Ok(raw);
    }
    match gain_ctx {
      None      => Ok(raw),
      Some(ctx) => {
        let window = end - start;
        let corr   = ctx.multipliers.low_gain_correction(ctx.method,
                                                         ctx.original_window,
                                                         window,
                                                         ctx.low_gain);
        Ok((raw - ctx.ped * window as f32) * corr)
      }
    }
  }

  /// Raw sums for the windows `1..=n_windows` starting
  /// at `start`, using prefix sums.
  ///
  /// Windows which would extend beyond the trace are
  /// shifted to end at the last sample. Windows longer
  /// than the trace are not returned.
  pub fn window_sums(samples : &[u16], start : usize, n_windows : usize) -> Vec<f32> {
    let n = samples.len();
    let mut prefix = Vec::<f64>::with_capacity(n + 1);
    prefix.push(0.0);
    let mut acc = 0.0f64;
    for s in samples {
      acc += *s as f64;
      prefix.push(acc);
    }
    let mut sums = Vec::<f32>::with_capacity(n_windows);
    for w in 1..=usize::min(n_windows, n) {
      let first = usize::min(start, n - w);
      sums.push((prefix[first + w] - prefix[first]) as f32);
    }
    sums
  }

  /// Start of the window of `width` samples with the
  /// largest enclosed charge
  pub fn find_window(values : &[f32], width : usize) -> usize {
    if width == 0 || values.len() <= width {
      return 0;
    }
    let mut current : f32 = values[0..width].iter().sum();
    let mut best        = current;
    let mut best_start  = 0usize;
    for start in 1..=(values.len() - width) {
      current += values[start + width - 1] - values[start - 1];
      if current > best {
        best       = current;
        best_start = start;
      }
    }
    best_start
  }

  /// Integration window `[start, end)` for the current
  /// method. Method 2 slides a window of `width`
  /// samples over the pedestal subtracted trace.
  pub fn integration_window(&self, ch : &ChannelData, ped : f32, width : usize) -> (i64, i64) {
    match self.method {
      2 if ch.has_trace() => {
        let values : Vec<f32> = ch.samples.iter().map(|s| *s as f32 - ped).collect();
        let start = Self::find_window(&values, width);
        (start as i64, (start + width) as i64)
      }
      _ => (self.sumfirst as i64, (self.sumfirst + width) as i64)
    }
  }

  /// Timing estimates inside `[start, end)`
  pub fn timing(&self,
                event   : &TelescopeEvent,
                channel : usize,
                start   : i64,
                end     : i64,
                ped     : f32) -> Result<PulseTiming, TraceError> {
    let ch = event.get_channel(channel)?;
    let mut timing = PulseTiming::new();
    if !ch.has_trace() {
      timing.t0    = ch.tzero;
      timing.t_max = ch.tzero;
      return Ok(timing);
    }
    let (start, end) = clip_window(start, end, ch.samples.len())?;
    let values : Vec<f32> = ch.samples[start..end].iter().map(|s| *s as f32 - ped).collect();
    let mut imax = 0usize;
    for (k, v) in values.iter().enumerate() {
      if *v > values[imax] {
        imax = k;
      }
    }
    timing.max   = values[imax];
    timing.t_max = (start + imax) as f32;
    if timing.max <= 0.0 {
      timing.t0 = timing.t_max;
      return Ok(timing);
    }
    timing.t0 = start as f32 + rising_edge(&values, imax, 0.5*timing.max);
    for level in &self.timing_levels {
      let t = start as f32 + rising_edge(&values, imax, level*timing.max);
      timing.levels.push((*level, t));
    }
    Ok(timing)
  }

  /// Two pass extraction: a wide window locates the
  /// pulse, the analysis window starts `pass2_offset`
  /// samples before the T0 of the first pass.
  ///
  /// Returns the charge and the timing of the second pass
  pub fn double_pass_sum(&self,
                         event    : &TelescopeEvent,
                         channel  : usize,
                         gain_ctx : &GainContext) -> Result<(f32, PulseTiming), TraceError> {
    let ch = event.get_channel(channel)?;
    let (s1, e1) = self.integration_window(ch, gain_ctx.ped, self.sumwindow_pass1);
    let pass1    = self.timing(event, channel, s1, e1, gain_ctx.ped)?;
    let start    = pass1.t0.floor() as i64 - self.pass2_offset as i64;
    let start    = i64::max(start, 0);
    let end      = start + self.sumwindow as i64;
    let charge   = self.sum(event, channel, start, end, false, Some(gain_ctx))?;
    let timing   = self.timing(event, channel, start, end, gain_ctx.ped)?;
    Ok((charge, timing))
  }

  /// Charge and timing in the analysis window
  pub fn extract(&self,
                 event    : &TelescopeEvent,
                 channel  : usize,
                 gain_ctx : &GainContext) -> Result<(f32, PulseTiming), TraceError> {
    if self.double_pass {
      return self.double_pass_sum(event, channel, gain_ctx);
    }
    let ch = event.get_channel(channel)?;
    let (start, end) = self.integration_window(ch, gain_ctx.ped, self.sumwindow);
    let charge = self.sum(event, channel, start, end, false, Some(gain_ctx))?;
    let timing = self.timing(event, channel, start, end, gain_ctx.ped)?;
    Ok((charge, timing))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event_with(samples : Vec<Vec<u16>>) -> TelescopeEvent {
    let mut event = TelescopeEvent::new();
    for (k, s) in samples.into_iter().enumerate() {
      let mut ch = ChannelData::new(k as u16);
      ch.samples = s;
      event.channels.push(ch);
    }
    event
  }

  fn pulse() -> Vec<u16> {
    vec![10, 10, 10, 10, 12, 20, 40, 60, 40, 20, 12, 10, 10, 10, 10, 10]
  }

  #[test]
  fn sum_is_clipped() {
    let event = event_with(vec![vec![1, 2, 3, 4, 5, 6]]);
    let integ = TraceIntegrator::new(&TraceSettings::new());
    assert_eq!(integ.sum(&event, 0, 2, 4, true, None), Ok(7.0));
    assert_eq!(integ.sum(&event, 0, -3, 2, true, None), Ok(3.0));
    assert_eq!(integ.sum(&event, 0, 4, 100, true, None), Ok(11.0));
    assert!(matches!(integ.sum(&event, 0, 7, 9, true, None),
                     Err(TraceError::EmptyWindow {..})));
    assert!(matches!(integ.sum(&event, 3, 0, 2, true, None),
                     Err(TraceError::ChannelOutOfRange {..})));
  }

  #[test]
  fn dst_channels_bypass_integration() {
    let mut event = event_with(vec![vec![]]);
    event.channels[0].sum   = 123.5;
    event.channels[0].tzero = 7.25;
    let integ = TraceIntegrator::new(&TraceSettings::new());
    assert_eq!(integ.sum(&event, 0, 0, 6, false, None), Ok(123.5));
    assert_eq!(integ.timing(&event, 0, 0, 6, 0.0).map(|t| t.t0), Ok(7.25));
  }

  #[test]
  fn pedestal_subtraction_and_low_gain() {
    let event = event_with(vec![vec![10;8]]);
    let integ = TraceIntegrator::new(&TraceSettings::new());
    let mut mult = LowGainMultipliers::new(6.0);
    mult.insert(1, 4, 5.5);
    let mut ctx = GainContext {
      ped             : 8.0,
      low_gain        : false,
      method          : 1,
      original_window : 6,
      multipliers     : &mult,
    };
    assert_eq!(integ.sum(&event, 0, 0, 4, false, Some(&ctx)), Ok(8.0));
    ctx.low_gain = true;
    assert_eq!(integ.sum(&event, 0, 0, 4, false, Some(&ctx)), Ok(8.0*5.5));
    // no multiplier for window 5 nor 6, default
    assert_eq!(integ.sum(&event, 0, 0, 5, false, Some(&ctx)), Ok(10.0*6.0));
  }

  #[test]
  fn low_gain_correction_fallbacks() {
    let mut mult = LowGainMultipliers::new(6.0);
    mult.insert(2, 6, 5.8);
    mult.insert(2, 12, 5.6);
    assert_eq!(mult.low_gain_correction(2, 6, 12, false), 1.0);
    assert_eq!(mult.low_gain_correction(2, 6, 12, true), 5.6);
    assert_eq!(mult.low_gain_correction(2, 6, 8, true), 5.8);
    assert_eq!(mult.low_gain_correction(1, 6, 8, true), 6.0);
  }

  #[test]
  fn window_sums_from_prefix() {
    let samples = vec![1u16, 2, 3, 4, 5];
    let sums = TraceIntegrator::window_sums(&samples, 1, 8);
    // w=1: [2], w=2: [2,3], w=3: [2,3,4], w=4: [2..5]
    // w=5: shifted to [1..5]
    assert_eq!(sums, vec![2.0, 5.0, 9.0, 14.0, 15.0]);
  }

  #[test]
  fn sliding_window_finds_pulse() {
    let values : Vec<f32> = pulse().iter().map(|s| *s as f32 - 10.0).collect();
    assert_eq!(TraceIntegrator::find_window(&values, 3), 6);
    assert_eq!(TraceIntegrator::find_window(&values, 100), 0);
  }

  #[test]
  fn rising_edge_timing() {
    let event = event_with(vec![pulse()]);
    let mut settings = TraceSettings::new();
    settings.timing_levels = vec![0.5];
    let integ  = TraceIntegrator::new(&settings);
    let timing = integ.timing(&event, 0, 0, 16, 10.0).unwrap();
    assert_eq!(timing.t_max, 7.0);
    assert_eq!(timing.max, 50.0);
    // 25 is crossed between sample 5 (10) and 6 (30)
    assert!((timing.t0 - 5.75).abs() < 1e-6);
    assert_eq!(timing.levels, vec![(0.5, timing.t0)]);
  }

  #[test]
  fn double_pass_follows_the_pulse() {
    let event = event_with(vec![pulse()]);
    let mut settings = TraceSettings::new();
    settings.double_pass     = true;
    settings.sumfirst        = 0;
    settings.sumwindow       = 4;
    settings.sumwindow_pass1 = 16;
    settings.pass2_offset    = 0;
    let integ = TraceIntegrator::new(&settings);
    let mult  = LowGainMultipliers::default();
    let ctx = GainContext {
      ped             : 10.0,
      low_gain        : false,
      method          : 1,
      original_window : 4,
      multipliers     : &mult,
    };
    let (charge, timing) = integ.extract(&event, 0, &ctx).unwrap();
    // window [5, 9) : 10 + 30 + 50 + 30
    assert_eq!(charge, 120.0);
    assert_eq!(timing.t_max, 7.0);
  }
}
