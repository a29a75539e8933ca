//! Aggregate settings for a calibration pass
//!
//! Different sections configure the different
//! stages of the pipeline. All settings can be
//! written to and read from a toml file.
//!

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read,
              Write};
use std::path::{Path,
                PathBuf};

use vts_dataclasses::constants::{DEFAULT_TIMESLICE_SEC,
                                 IPR_DEFAULT_MIN_STATS,
                                 MAX_CHANNELS,
                                 MAX_SUMWINDOW,
                                 MIN_PED_ENTRIES};
use vts_dataclasses::errors::CalibrationError;

use crate::calibrator::RunMode;

/// Signal extraction
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TraceSettings {
  /// 1 : fixed window starting at `sumfirst`,
  /// 2 : sliding window maximizing the charge
  pub method                     : u8,
  /// first sample of the integration window
  pub sumfirst                   : usize,
  /// current summation window of the image analysis
  pub sumwindow                  : usize,
  /// integrate twice, first pass finds the pulse
  pub double_pass                : bool,
  /// summation window of the first pass
  pub sumwindow_pass1            : usize,
  /// the second pass starts this many samples
  /// before the T0 of the first pass
  pub pass2_offset               : usize,
  /// Flag a channel as low gain if its largest sample
  /// reaches this value (in addition to the hi/lo bit
  /// of the readout)
  pub hilo_threshold             : Option<u16>,
  /// Low gain multiplier if there is none in the
  /// multiplier file
  pub lowgain_multiplier_default : f32,
  /// fractions of the pulse maximum for the rise time
  /// based timing estimates
  pub timing_levels              : Vec<f32>,
  /// width of a FADC sample
  pub fadc_time_slice_ns         : f32,
  /// upsampling of a digital filter, 1 if unused
  pub upsample                   : u16,
}

impl TraceSettings {
  pub fn new() -> Self {
    Self {
      method                     : 1,
      sumfirst                   : 2,
      sumwindow                  : 6,
      double_pass                : false,
      sumwindow_pass1            : 18,
      pass2_offset               : 1,
      hilo_threshold             : None,
      lowgain_multiplier_default : 6.0,
      timing_levels              : vec![0.2, 0.5, 0.8],
      fadc_time_slice_ns         : 2.0,
      upsample                   : 1,
    }
  }
}

impl Default for TraceSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Pedestal runs and time slice pedestals
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PedestalSettings {
  /// pedestal variations are tracked for the
  /// windows 1..=n_sumwindows
  pub n_sumwindows        : usize,
  /// calculate pedestals in time slices during data runs
  pub time_slices         : bool,
  /// target length of a time slice
  pub timeslice_sec       : f64,
  /// minimum number of events for a pedestal in the
  /// ascii summary
  pub min_entries         : u64,
  /// number of bins of the per channel charge histograms
  pub histogram_bins      : usize,
  /// keep the per channel charge distributions in
  /// the structured output
  pub write_distributions : bool,
  /// zero suppressed channels contribute to the IPR
  /// charge histograms
  pub combine_channels    : bool,
}

impl PedestalSettings {
  pub fn new() -> Self {
    Self {
      n_sumwindows        : 24,
      time_slices         : true,
      timeslice_sec       : DEFAULT_TIMESLICE_SEC,
      min_entries         : MIN_PED_ENTRIES,
      histogram_bins      : 500,
      write_distributions : false,
      combine_channels    : false,
    }
  }
}

impl Default for PedestalSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Flasher/laser runs
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GainSettings {
  /// total charge of the camera for a laser event
  pub laser_min_sum           : f64,
  /// minimum charge of a channel to enter the gain
  /// and toff distributions
  pub min_integration_sum     : f64,
  /// high gain pass: reject events with more low
  /// gain channels
  pub max_low_gain_channels   : usize,
  /// low gain pass: require at least this fraction
  /// of low gain channels
  pub min_low_gain_fraction   : f64,
  /// reject events with more saturated channels
  pub max_saturated_channels  : usize,
  pub gain_histogram_bins     : usize,
  pub gain_histogram_max      : f64,
  pub toff_histogram_bins     : usize,
  /// toff histogram range is [-max, max]
  pub toff_histogram_max      : f64,
  /// keep mean pulse shapes per channel
  pub pulse_shapes            : bool,
  /// If more channels than this show a gain of 0,
  /// all gains are reset to 1
  pub zero_gain_reset         : Option<usize>,
}

impl GainSettings {
  pub fn new() -> Self {
    Self {
      laser_min_sum          : 50000.0,
      min_integration_sum    : 50.0,
      max_low_gain_channels  : 5,
      min_low_gain_fraction  : 0.7,
      max_saturated_channels : 10,
      gain_histogram_bins    : 500,
      gain_histogram_max     : 5.0,
      toff_histogram_bins    : 400,
      toff_histogram_max     : 20.0,
      pulse_shapes           : false,
      zero_gain_reset        : None,
    }
  }
}

impl Default for GainSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Dead channel tests
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChannelStateSettings {
  /// allowed range of the pedestal per sample
  pub ped_min                 : f32,
  pub ped_max                 : f32,
  /// allowed range of the pedvar for the current window
  pub pedvar_abs_min          : f32,
  pub pedvar_abs_max          : f32,
  /// allowed range of pedvar / camera mean pedvar
  pub pedvar_rel_min          : f32,
  pub pedvar_rel_max          : f32,
  pub gain_min                : f32,
  pub gain_max                : f32,
  pub gain_var_min            : f32,
  pub gain_var_max            : f32,
  /// maximum |gain - camera mean gain|
  pub gain_deviation_max      : f32,
  /// maximum |time offset| (samples)
  pub toff_max                : f32,
  /// user supplied list of channel states
  pub pixel_status_file       : Option<String>,
  /// emulate camera degradation in simulations
  pub n_random_dead           : usize,
  pub random_dead_seed        : u64,
  /// bounds on the L1 rate (Hz), checked only
  /// if a channel monitor is present
  pub l1_rate_min             : Option<f32>,
  pub l1_rate_max             : Option<f32>,
  /// bounds on the high voltage (V)
  pub hv_min                  : Option<f32>,
  pub hv_max                  : Option<f32>,
  /// the monitoring tests are skipped if they
  /// would kill more than this fraction of the camera
  pub monitor_max_dead_fraction : f32,
  /// masked channels per telescope id
  pub masked_channels         : HashMap<String, Vec<u16>>,
}

impl ChannelStateSettings {
  pub fn new() -> Self {
    Self {
      ped_min                   : 1.0,
      ped_max                   : 40.0,
      pedvar_abs_min            : 0.1,
      pedvar_abs_max            : 60.0,
      pedvar_rel_min            : 0.3,
      pedvar_rel_max            : 3.0,
      gain_min                  : 0.3,
      gain_max                  : 3.0,
      gain_var_min              : 0.0,
      gain_var_max              : 2.0,
      gain_deviation_max        : 0.7,
      toff_max                  : 20.0,
      pixel_status_file         : None,
      n_random_dead             : 0,
      random_dead_seed          : 0,
      l1_rate_min               : None,
      l1_rate_max               : None,
      hv_min                    : None,
      hv_max                    : None,
      monitor_max_dead_fraction : 0.5,
      masked_channels           : HashMap::<String, Vec<u16>>::new(),
    }
  }

  /// Masked channels of a single telescope
  pub fn masked_for(&self, tel_id : u32) -> Vec<u16> {
    self.masked_channels.get(&tel_id.to_string()).cloned().unwrap_or_default()
  }
}

impl Default for ChannelStateSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Individual pixel rate curves
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IprSettings {
  pub enabled           : bool,
  /// summation windows to build curves for, the
  /// current sumwindow if empty
  pub windows           : Vec<usize>,
  /// minimum number of entries for a valid curve
  pub min_stats         : f64,
  /// channel providing the binning of the
  /// summary histogram
  pub reference_channel : usize,
  /// conversion from digital counts to photo electrons
  pub dc_per_pe         : f64,
}

impl IprSettings {
  pub fn new() -> Self {
    Self {
      enabled           : true,
      windows           : Vec::<usize>::new(),
      min_stats         : IPR_DEFAULT_MIN_STATS,
      reference_channel : 0,
      dc_per_pe         : 1.0,
    }
  }
}

impl Default for IprSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Exchange of two FADC modules of one telescope
/// for a range of runs
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ModuleSwap {
  pub tel_id   : u32,
  pub run_min  : u32,
  pub run_max  : u32,
  pub module_a : u32,
  pub module_b : u32,
}

/// Location of calibration input and output
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CalibrationFileSettings {
  /// Products are written to and read from
  /// `<calibration_dir>/Tel_<id>/<run>.<ext>`
  pub calibration_dir          : String,
  pub ped_run                  : Option<u32>,
  pub lowgain_ped_run          : Option<u32>,
  pub gain_run                 : Option<u32>,
  pub lowgain_gain_run         : Option<u32>,
  pub toff_run                 : Option<u32>,
  pub lowgain_toff_run         : Option<u32>,
  pub tzero_run                : Option<u32>,
  /// multi run pedestal file (module, channel, run)
  pub combined_ped_file        : Option<String>,
  pub channels_per_module      : u32,
  /// low gain multipliers per (tel, method, window)
  pub lowgain_multiplier_file  : Option<String>,
  /// query the gain database (if one is attached)
  pub use_db                   : bool,
  /// keep the snapshot files of database queries
  pub keep_db_snapshots        : bool,
  /// write one json line per event and channel
  pub write_extra_calibration_tree : bool,
  /// historical module exchanges in the combined file
  pub module_swaps             : Vec<ModuleSwap>,
}

impl CalibrationFileSettings {
  pub fn new() -> Self {
    Self {
      calibration_dir              : String::from("calibration"),
      ped_run                      : None,
      lowgain_ped_run              : None,
      gain_run                     : None,
      lowgain_gain_run             : None,
      toff_run                     : None,
      lowgain_toff_run             : None,
      tzero_run                    : None,
      combined_ped_file            : None,
      channels_per_module          : 10,
      lowgain_multiplier_file      : None,
      use_db                       : false,
      keep_db_snapshots            : false,
      write_extra_calibration_tree : false,
      module_swaps                 : Vec::<ModuleSwap>::new(),
    }
  }

  /// Directory holding the per telescope products
  pub fn telescope_dir(&self, tel_id : u32) -> PathBuf {
    Path::new(&self.calibration_dir).join(format!("Tel_{}", tel_id))
  }

  /// `<calibration_dir>/Tel_<tel_id>/<run>.<ext>`
  pub fn product_path(&self, tel_id : u32, run : u32, ext : &str) -> PathBuf {
    self.telescope_dir(tel_id).join(format!("{}.{}", run, ext))
  }

  /// `<calibration_dir>/TelType_<type>/<run>.pedcal`
  pub fn pedestal_tree_path(&self, tel_type : u64, run : u32) -> PathBuf {
    Path::new(&self.calibration_dir)
      .join(format!("TelType_{}", tel_type))
      .join(format!("{}.pedcal", run))
  }
}

impl Default for CalibrationFileSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// All settings of a calibration pass
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CalibrationSettings {
  pub run_mode                  : RunMode,
  /// substitute neutral values for missing
  /// calibration instead of stopping
  pub no_calibration_no_problem : bool,
  pub trace                     : TraceSettings,
  pub pedestal                  : PedestalSettings,
  pub gain                      : GainSettings,
  pub channel_state             : ChannelStateSettings,
  pub ipr                       : IprSettings,
  pub files                     : CalibrationFileSettings,
}

impl CalibrationSettings {

  pub fn new() -> Self {
    Self {
      run_mode                  : RunMode::DataAnalysis,
      no_calibration_no_problem : false,
      trace                     : TraceSettings::new(),
      pedestal                  : PedestalSettings::new(),
      gain                      : GainSettings::new(),
      channel_state             : ChannelStateSettings::new(),
      ipr                       : IprSettings::new(),
      files                     : CalibrationFileSettings::new(),
    }
  }

  /// Summation windows IPR curves are built for
  pub fn ipr_windows(&self) -> Vec<usize> {
    if self.ipr.windows.is_empty() {
      vec![self.trace.sumwindow]
    } else {
      self.ipr.windows.clone()
    }
  }

  /// Check the settings against the storage limits
  /// of the pipeline
  pub fn validate(&self) -> Result<(), CalibrationError> {
    let fail = |msg : String| Err(CalibrationError::Settings(msg));
    if self.trace.method != 1 && self.trace.method != 2 {
      return fail(format!("unknown signal extraction method {}", self.trace.method));
    }
    let n_win = self.pedestal.n_sumwindows;
    if n_win == 0 || n_win > MAX_SUMWINDOW {
      return fail(format!("n_sumwindows {} not in [1, {}]", n_win, MAX_SUMWINDOW));
    }
    for (name, w) in [("sumwindow", self.trace.sumwindow),
                      ("sumwindow_pass1", self.trace.sumwindow_pass1)] {
      if w == 0 || w > n_win {
        return fail(format!("{} {} not in the tracked windows [1, {}]", name, w, n_win));
      }
    }
    for w in self.ipr_windows() {
      if w == 0 || w > n_win {
        return fail(format!("IPR window {} not in the tracked windows [1, {}]", w, n_win));
      }
    }
    if !(self.pedestal.timeslice_sec > 0.0) {
      return fail(format!("time slice length {} has to be positive", self.pedestal.timeslice_sec));
    }
    if self.pedestal.histogram_bins == 0 {
      return fail(String::from("pedestal histograms need at least one bin"));
    }
    if self.gain.gain_histogram_bins == 0 || self.gain.toff_histogram_bins == 0 {
      return fail(String::from("gain/toff histograms need at least one bin"));
    }
    if !(self.gain.gain_histogram_max > 0.0) || !(self.gain.toff_histogram_max > 0.0) {
      return fail(String::from("gain/toff histogram ranges have to be positive"));
    }
    if !(0.0..=1.0).contains(&self.gain.min_low_gain_fraction) {
      return fail(format!("low gain fraction {} not in [0, 1]", self.gain.min_low_gain_fraction));
    }
    if self.channel_state.n_random_dead > MAX_CHANNELS {
      return fail(format!("can not disable {} random channels", self.channel_state.n_random_dead));
    }
    if !(self.ipr.dc_per_pe > 0.0) {
      return fail(String::from("dc_per_pe has to be positive"));
    }
    if self.trace.upsample == 0 || !(self.trace.fadc_time_slice_ns > 0.0) {
      return fail(String::from("invalid FADC timing (upsample or time slice)"));
    }
    if self.files.channels_per_module == 0 {
      return fail(String::from("channels_per_module has to be positive"));
    }
    Ok(())
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) -> Result<(), CalibrationError> {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    let toml_string = toml::to_string_pretty(&self)
      .map_err(|e| CalibrationError::Settings(format!("Unable to serialize toml! {}", e)))?;
    let mut file = File::create(&filename)
      .map_err(|e| CalibrationError::io(&filename, e))?;
    file.write_all(toml_string.as_bytes())
      .map_err(|e| CalibrationError::io(&filename, e))?;
    debug!("Wrote settings to {}!", filename);
    Ok(())
  }

  /// Read settings from a toml file
  pub fn from_toml(filename : &str) -> Result<CalibrationSettings, CalibrationError> {
    let mut file = File::open(filename)
      .map_err(|e| CalibrationError::io(filename, e))?;
    let mut toml_string = String::from("");
    file.read_to_string(&mut toml_string)
      .map_err(|e| CalibrationError::io(filename, e))?;
    match toml::from_str::<CalibrationSettings>(&toml_string) {
      Err(err) => {
        error!("Can't interpret toml! {}", err);
        Err(CalibrationError::Settings(format!("{}: {}", filename, err)))
      }
      Ok(settings) => Ok(settings)
    }
  }
}

impl fmt::Display for CalibrationSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = match toml::to_string(self) {
      Err(err) => {
        error!("Serialization error! {err}");
        String::from("-- SERIALIZATION ERROR! --")
      }
      Ok(disp) => disp
    };
    write!(f, "<CalibrationSettings :\n{}>", disp)
  }
}

impl Default for CalibrationSettings {
  fn default() -> Self {
    Self::new()
  }
}
