//! Running statistics and charge histograms
//!
//! The accumulators of the calibration pipeline only
//! keep (n, sum, sum of squares) per channel and window,
//! distributions which need a median or a reverse
//! cumulative integral are kept in fixed binning
//! histograms.
//!

use std::fmt;

use ndhistogram::{ndhistogram,
                  Histogram,
                  Hist1D};
use ndhistogram::axis::{Uniform,
                        BinInterval};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

use crate::errors::CalibrationError;

/// Online first and second moment of a sample
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningStats {
  pub n    : u64,
  pub sum  : f64,
  pub sum2 : f64,
}

impl RunningStats {

  pub fn new() -> Self {
    Self {
      n    : 0,
      sum  : 0.0,
      sum2 : 0.0,
    }
  }

  pub fn add(&mut self, x : f64) {
    self.n    += 1;
    self.sum  += x;
    self.sum2 += x*x;
  }

  /// Combine with statistics of a disjoint sample
  pub fn merge(&mut self, other : &RunningStats) {
    self.n    += other.n;
    self.sum  += other.sum;
    self.sum2 += other.sum2;
  }

  pub fn reset(&mut self) {
    *self = Self::new();
  }

  pub fn is_empty(&self) -> bool {
    self.n == 0
  }

  pub fn mean(&self) -> f64 {
    if self.n == 0 {
      return 0.0;
    }
    self.sum / self.n as f64
  }

  /// Mean and rms, `rms = sqrt(|sum2/n - (sum/n)^2|)`.
  ///
  /// Returns (0, 0) for an empty sample
  pub fn finalize(&self) -> (f64, f64) {
    if self.n == 0 {
      return (0.0, 0.0);
    }
    let n    = self.n as f64;
    let mean = self.sum / n;
    let rms  = (self.sum2 / n - mean*mean).abs().sqrt();
    (mean, rms)
  }

  pub fn variance(&self) -> f64 {
    let (_, rms) = self.finalize();
    rms*rms
  }
}

impl fmt::Display for RunningStats {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let (mean, rms) = self.finalize();
    write!(f, "<RunningStats: n {}, mean {:.4}, rms {:.4}>", self.n, mean, rms)
  }
}

/// Median of a sample, `None` if the sample is empty
pub fn median(values : &[f64]) -> Option<f64> {
  if values.is_empty() {
    return None;
  }
  let data = Data::new(values.to_vec());
  Some(data.median())
}

/// Content of a single (in range) histogram bin
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HistBin {
  pub low   : f64,
  pub high  : f64,
  pub count : f64,
}

impl HistBin {
  pub fn center(&self) -> f64 {
    0.5*(self.low + self.high)
  }
}

/// A one dimensional histogram with uniform binning
/// and exact running moments of everything filled
/// into it.
#[derive(Debug, Clone)]
pub struct ChargeHistogram {
  hist       : Hist1D<Uniform<f64>>,
  pub n_bins : usize,
  pub low    : f64,
  pub high   : f64,
  /// Moments of all entries, including under/overflow
  pub stats  : RunningStats,
  entries    : f64,
}

impl ChargeHistogram {

  pub fn new(n_bins : usize, low : f64, high : f64) -> Result<Self, CalibrationError> {
    if n_bins == 0 || !(high > low) {
      return Err(CalibrationError::Histogram(
        format!("invalid binning {} bins in [{}, {})", n_bins, low, high)));
    }
    let axis = Uniform::new(n_bins, low, high)
      .map_err(|e| CalibrationError::Histogram(format!("{:?}", e)))?;
    Ok(Self {
      hist    : ndhistogram!(axis),
      n_bins  : n_bins,
      low     : low,
      high    : high,
      stats   : RunningStats::new(),
      entries : 0.0,
    })
  }

  /// An empty histogram with the binning of `other`
  pub fn with_binning_of(other : &ChargeHistogram) -> Result<Self, CalibrationError> {
    Self::new(other.n_bins, other.low, other.high)
  }

  pub fn fill(&mut self, x : f64) {
    self.hist.fill(&x);
    self.stats.add(x);
    self.entries += 1.0;
  }

  /// Add `weight` entries at `x`
  pub fn fill_weighted(&mut self, x : f64, weight : f64) {
    if weight <= 0.0 {
      return;
    }
    self.hist.fill_with(&x, weight);
    self.stats.n    += weight.round() as u64;
    self.stats.sum  += weight*x;
    self.stats.sum2 += weight*x*x;
    self.entries    += weight;
  }

  /// Total number of entries, including under and overflow
  pub fn entries(&self) -> f64 {
    self.entries
  }

  pub fn bin_width(&self) -> f64 {
    (self.high - self.low) / self.n_bins as f64
  }

  /// All in range bins, ordered from low to high
  pub fn bins(&self) -> Vec<HistBin> {
    let mut bins = Vec::<HistBin>::with_capacity(self.n_bins);
    for item in self.hist.iter() {
      if let BinInterval::Bin {start, end} = item.bin {
        bins.push(HistBin {
          low   : start,
          high  : end,
          count : *item.value,
        });
      }
    }
    bins.sort_by(|a, b| a.low.total_cmp(&b.low));
    bins
  }

  pub fn underflow(&self) -> f64 {
    self.flow_bin(true)
  }

  pub fn overflow(&self) -> f64 {
    self.flow_bin(false)
  }

  fn flow_bin(&self, under : bool) -> f64 {
    for item in self.hist.iter() {
      match item.bin {
        BinInterval::Underflow {..} if under  => return *item.value,
        BinInterval::Overflow  {..} if !under => return *item.value,
        _ => ()
      }
    }
    0.0
  }

  /// Mean and rms of all filled values
  pub fn mean_rms(&self) -> (f64, f64) {
    self.stats.finalize()
  }

  /// Median estimated from the binned distribution,
  /// interpolating linearly inside the bin holding it.
  ///
  /// Underflow entries count as sitting at the lower
  /// edge, overflow entries at the upper edge.
  pub fn median(&self) -> Option<f64> {
    if self.entries <= 0.0 {
      return None;
    }
    let half    = 0.5*self.entries;
    let mut cum = self.underflow();
    if cum >= half {
      return Some(self.low);
    }
    for bin in self.bins() {
      if bin.count > 0.0 && cum + bin.count >= half {
        let frac = (half - cum) / bin.count;
        return Some(bin.low + frac*(bin.high - bin.low));
      }
      cum += bin.count;
    }
    Some(self.high)
  }
}

impl fmt::Display for ChargeHistogram {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ChargeHistogram: {} bins [{}, {}), {} entries>",
           self.n_bins, self.low, self.high, self.entries)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn running_stats_finalize() {
    let values = [3.0, 4.5, -1.0, 7.25, 0.5];
    let mut stats = RunningStats::new();
    for v in values {
      stats.add(v);
    }
    let n    = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ms   = values.iter().map(|x| x*x).sum::<f64>() / n;
    let (m, rms) = stats.finalize();
    assert!((m - mean).abs() < 1e-12);
    assert!((rms - (ms - mean*mean).abs().sqrt()).abs() < 1e-12);
  }

  #[test]
  fn running_stats_empty() {
    let stats = RunningStats::new();
    assert_eq!(stats.finalize(), (0.0, 0.0));
    assert_eq!(stats.mean(), 0.0);
  }

  #[test]
  fn running_stats_merge() {
    let mut a = RunningStats::new();
    let mut b = RunningStats::new();
    let mut c = RunningStats::new();
    for k in 0..10 {
      let x = k as f64 * 0.7;
      if k % 2 == 0 { a.add(x) } else { b.add(x) }
      c.add(x);
    }
    a.merge(&b);
    assert_eq!(a.n, c.n);
    assert!((a.sum - c.sum).abs() < 1e-12);
  }

  #[test]
  fn median_of_sample() {
    assert_eq!(median(&[]), None);
    assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
    assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
  }

  #[test]
  fn histogram_bins_and_flow() {
    let mut hist = ChargeHistogram::new(10, 0.0, 10.0).unwrap();
    for x in [0.5, 1.5, 1.7, 9.9, -3.0, 12.0, 15.0] {
      hist.fill(x);
    }
    let bins = hist.bins();
    assert_eq!(bins.len(), 10);
    assert_eq!(bins[1].count, 2.0);
    assert_eq!(bins[9].count, 1.0);
    assert_eq!(hist.underflow(), 1.0);
    assert_eq!(hist.overflow(), 2.0);
    assert_eq!(hist.entries(), 7.0);
    assert!((bins[0].center() - 0.5).abs() < 1e-12);
  }

  #[test]
  fn histogram_median_is_interpolated() {
    let mut hist = ChargeHistogram::new(100, 0.0, 2.0).unwrap();
    for k in 0..1000 {
      hist.fill(0.5 + k as f64 / 1000.0);
    }
    let med = hist.median().unwrap();
    assert!((med - 1.0).abs() < 0.02);
  }

  #[test]
  fn invalid_binning_is_an_error() {
    assert!(ChargeHistogram::new(0, 0.0, 1.0).is_err());
    assert!(ChargeHistogram::new(10, 1.0, 1.0).is_err());
  }
}
