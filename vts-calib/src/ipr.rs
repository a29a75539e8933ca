//! Individual pixel rate (IPR) curves
//!
//! The charge histograms of all channels of a telescope
//! type are pedestal subtracted, gain corrected and
//! summed. The reverse cumulative integral of the sum,
//! normalized to the number of entries and the length
//! of the search window, is the rate at which a pixel
//! exceeds a given threshold.
//!

use vts_dataclasses::calibrations::{IprCurve,
                                    IprHeader,
                                    IprPoint};
use vts_dataclasses::constants::IPR_MIN_BIN_ENTRIES;
use vts_dataclasses::errors::CalibrationError;
use vts_dataclasses::stats::ChargeHistogram;
use vts_dataclasses::TelescopeType;

use crate::pedestals::ChannelHistograms;
use crate::settings::CalibrationSettings;

/// Turns per channel charge histograms into IPR curves
#[derive(Debug, Clone)]
pub struct IprGraphBuilder {
  pub min_stats          : f64,
  pub reference_channel  : usize,
  pub dc_per_pe          : f64,
  pub method             : u8,
  pub fadc_time_slice_ns : f32,
  pub upsample           : u16,
}

impl IprGraphBuilder {

  pub fn new(settings : &CalibrationSettings) -> Self {
    Self {
      min_stats          : settings.ipr.min_stats,
      reference_channel  : settings.ipr.reference_channel,
      dc_per_pe          : settings.ipr.dc_per_pe,
      method             : settings.trace.method,
      fadc_time_slice_ns : settings.trace.fadc_time_slice_ns,
      upsample           : settings.trace.upsample,
    }
  }

  pub fn header(&self, window : usize, n_samples : usize) -> IprHeader {
    IprHeader {
      method             : self.method,
      window             : window as u16,
      n_samples          : n_samples as u16,
      fadc_time_slice_ns : self.fadc_time_slice_ns,
      readout_window_ns  : n_samples as f32 * self.fadc_time_slice_ns,
      upsample           : self.upsample,
    }
  }

  /// Sum of the pedestal subtracted and gain corrected
  /// histograms of all channels, in photo electrons.
  ///
  /// The binning is the binning of the reference channel,
  /// shifted by its pedestal. Under- and overflow entries
  /// of the channels go to the under- and overflow of the
  /// summary.
  pub fn summary_histogram(&self,
                           hists : &ChannelHistograms,
                           peds  : &[f32],
                           gains : &[f32]) -> Result<ChargeHistogram, CalibrationError> {
    let reference = match hists.channels.get(self.reference_channel) {
      Some(h) => h,
      None    => {
        warn!("IPR reference channel {} out of range, using channel 0", self.reference_channel);
        hists.channels.first().ok_or(CalibrationError::Histogram(
          format!("no charge histograms for window {}", hists.window)))?
      }
    };
    let window  = hists.window as f64;
    let ped_ref = peds.get(self.reference_channel).copied().unwrap_or(0.0) as f64;
    let low     = (reference.low  - ped_ref*window) / self.dc_per_pe;
    let high    = (reference.high - ped_ref*window) / self.dc_per_pe;
    let mut summary = ChargeHistogram::new(reference.n_bins, low, high)?;
    let below   = summary.low  - summary.bin_width();
    let above   = summary.high + summary.bin_width();
    for (ch, hist) in hists.channels.iter().enumerate() {
      if hist.entries() <= 0.0 {
        continue;
      }
      let ped  = peds.get(ch).copied().unwrap_or(0.0) as f64;
      let gain = match gains.get(ch) {
        Some(g) if *g > 0.0 => *g as f64,
        Some(_)             => continue,
        None                => 1.0,
      };
      let correction = gain * self.dc_per_pe;
      for bin in hist.bins() {
        if bin.count > 0.0 {
          summary.fill_weighted((bin.center() - ped*window) / correction, bin.count);
        }
      }
      summary.fill_weighted(below, hist.underflow());
      summary.fill_weighted(above, hist.overflow());
    }
    Ok(summary)
  }

  /// Rate vs threshold from a summary histogram.
  ///
  /// Only bins with more than `IPR_MIN_BIN_ENTRIES`
  /// entries give a point. The integral runs from the
  /// bin to the end of the histogram, overflow included.
  pub fn curve_from_summary(&self,
                            tel_type : TelescopeType,
                            header   : IprHeader,
                            summary  : &ChargeHistogram) -> IprCurve {
    let mut curve       = IprCurve::new(tel_type, header);
    let total           = summary.entries();
    curve.total_entries = total;
    curve.valid         = total >= self.min_stats;
    if !curve.valid {
      warn!("{} has only {} entries (need {}), the curve is unreliable",
            curve.name(), total, self.min_stats);
    }
    if total <= 0.0 {
      return curve;
    }
    let conversion   = 1e9 / header.search_window_ns();
    let mut integral = summary.overflow();
    let mut points   = Vec::<IprPoint>::new();
    for bin in summary.bins().iter().rev() {
      integral += bin.count;
      if bin.count > IPR_MIN_BIN_ENTRIES {
        points.push(IprPoint {
          threshold_pe  : bin.center(),
          rate_hz       : conversion * integral / total,
          threshold_err : 0.5*(bin.high - bin.low),
          rate_err      : conversion * integral.sqrt() / total,
        });
      }
    }
    points.reverse();
    curve.points = points;
    debug!("{}", curve);
    curve
  }

  /// IPR curve of one telescope type and window
  ///
  /// `peds` are the pedestals per sample of the channels,
  /// `gains` the relative gains (empty for pedestal runs).
  pub fn build(&self,
               tel_type  : TelescopeType,
               hists     : &ChannelHistograms,
               peds      : &[f32],
               gains     : &[f32],
               n_samples : usize) -> Result<IprCurve, CalibrationError> {
    let header  = self.header(hists.window, n_samples);
    let summary = self.summary_histogram(hists, peds, gains)?;
    Ok(self.curve_from_summary(tel_type, header, &summary))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn builder() -> IprGraphBuilder {
    IprGraphBuilder {
      min_stats          : 1e5,
      reference_channel  : 0,
      dc_per_pe          : 1.0,
      method             : 1,
      fadc_time_slice_ns : 2.0,
      upsample           : 1,
    }
  }

  /// Falling charge spectrum above a pedestal of 10 per
  /// sample in a window of 2 samples
  fn histograms(n_channels : usize) -> ChannelHistograms {
    let mut channels = Vec::<ChargeHistogram>::new();
    for _ in 0..n_channels {
      let mut h = ChargeHistogram::new(40, 0.0, 80.0).unwrap();
      for k in 0..40 {
        let x = 2.0*k as f64 + 1.0;
        let n = if x < 20.0 { 0.0 } else { (2000.0 * (-(x - 20.0)/8.0).exp()).floor() };
        h.fill_weighted(x, n);
      }
      channels.push(h);
    }
    ChannelHistograms {
      window   : 2,
      channels : channels,
    }
  }

  #[test]
  fn curve_is_non_increasing() {
    let hists = histograms(4);
    let peds  = vec![10.0;4];
    let curve = builder().build(TelescopeType(1), &hists, &peds, &[], 24).unwrap();
    assert!(curve.points.len() > 5);
    for pair in curve.points.windows(2) {
      assert!(pair[0].threshold_pe < pair[1].threshold_pe);
      assert!(pair[0].rate_hz >= pair[1].rate_hz);
    }
    assert_eq!(curve.name(), "IPRcharge_TelType1_SW2");
    // search window 2 samples of 2 ns
    let first = curve.points[0];
    assert!((first.rate_hz - 2.5e8).abs() / 2.5e8 < 1e-9);
  }

  #[test]
  fn pedestals_are_subtracted() {
    let hists   = histograms(2);
    let peds    = vec![10.0, 10.0];
    let summary = builder().summary_histogram(&hists, &peds, &[]).unwrap();
    assert_eq!(summary.low, -20.0);
    assert_eq!(summary.high, 60.0);
    assert_eq!(summary.entries(), 2.0*hists.channels[0].entries());
    // the first filled bin of the channels is centered at 21
    let first = summary.bins().into_iter().find(|b| b.count > 0.0).unwrap();
    assert!((first.center() - 1.0).abs() < 1e-9);
  }

  #[test]
  fn gain_correction_and_dead_gains() {
    let hists   = histograms(2);
    let peds    = vec![10.0, 10.0];
    let summary = builder().summary_histogram(&hists, &peds, &[1.0, 0.0]).unwrap();
    assert_eq!(summary.entries(), hists.channels[0].entries());
  }

  #[test]
  fn low_statistics_marks_curve_invalid() {
    let hists = histograms(1);
    let curve = builder().build(TelescopeType(3), &hists, &[10.0], &[], 24).unwrap();
    assert!(!curve.valid);
    let mut b = builder();
    b.min_stats = 100.0;
    let curve = b.build(TelescopeType(3), &hists, &[10.0], &[], 24).unwrap();
    assert!(curve.valid);
    for p in &curve.points {
      assert!(p.rate_err > 0.0);
    }
  }
}
