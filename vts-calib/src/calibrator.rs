//! Run level driver of the calibration
//!
//! Exactly one `RunMode` is active per run. Calibration
//! modes accumulate and write products at the end of the
//! run, the data analysis mode reads the products back
//! and delivers calibrated channels per event.
//!

use std::collections::{BTreeMap,
                       HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vts_dataclasses::calibrations::{GainSet,
                                    IprCurve,
                                    PedestalTree,
                                    ToffSet};
use vts_dataclasses::errors::{CalibrationError,
                              TraceError};
use vts_dataclasses::{EventType,
                      GainPath,
                      RunHeader,
                      TelescopeDescription,
                      TelescopeEvent,
                      TelescopeType};

use crate::calibration_io::{read_lowgain_multipliers,
                            read_pixel_status,
                            write_pedestal_tree,
                            CalibrationIO,
                            ExtraCalibrationRecord,
                            ExtraCalibrationWriter,
                            GainDatabase,
                            LoadedPedestals,
                            PedestalSource};
use crate::channel_state::{ChannelMonitor,
                           ChannelStateInputs,
                           ChannelStateTracker,
                           DeadReason};
use crate::gains::{is_qualifying_event,
                   quality_gate,
                   FlasherSignal,
                   GainTimingAccumulator,
                   TZeroAccumulator};
use crate::ipr::IprGraphBuilder;
use crate::pedestals::{channel_window_sums,
                       FieldRotation,
                       IprChargeHistograms,
                       NoFieldRotation,
                       PedestalAccumulator,
                       TimeSliceBuilder};
use crate::settings::CalibrationSettings;
use crate::trace::{GainContext,
                   LowGainMultipliers,
                   PulseTiming,
                   TraceIntegrator};

/// What a run is processed for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
  DataAnalysis,
  PedestalHighGain,
  GainToffHighGain,
  GainToffLowGain,
  PedestalLowGain,
  TZeroHighGain,
  TZeroLowGain,
}

impl RunMode {

  /// Historical numeric run mode
  pub fn code(&self) -> u8 {
    match self {
      RunMode::DataAnalysis     => 0,
      RunMode::PedestalHighGain => 1,
      RunMode::GainToffHighGain => 2,
      RunMode::GainToffLowGain  => 5,
      RunMode::PedestalLowGain  => 6,
      RunMode::TZeroHighGain    => 7,
      RunMode::TZeroLowGain     => 8,
    }
  }

  pub fn from_code(code : u8) -> Option<Self> {
    match code {
      0 => Some(RunMode::DataAnalysis),
      1 => Some(RunMode::PedestalHighGain),
      2 => Some(RunMode::GainToffHighGain),
      5 => Some(RunMode::GainToffLowGain),
      6 => Some(RunMode::PedestalLowGain),
      7 => Some(RunMode::TZeroHighGain),
      8 => Some(RunMode::TZeroLowGain),
      _ => None
    }
  }

  pub fn gain_path(&self) -> GainPath {
    match self {
      RunMode::PedestalLowGain
      | RunMode::GainToffLowGain
      | RunMode::TZeroLowGain => GainPath::Low,
      _ => GainPath::High
    }
  }

  pub fn is_pedestal(&self) -> bool {
    matches!(self, RunMode::PedestalHighGain | RunMode::PedestalLowGain)
  }

  pub fn is_gain_toff(&self) -> bool {
    matches!(self, RunMode::GainToffHighGain | RunMode::GainToffLowGain)
  }

  pub fn is_tzero(&self) -> bool {
    matches!(self, RunMode::TZeroHighGain | RunMode::TZeroLowGain)
  }

  /// Flasher runs use laser events
  pub fn is_flasher(&self) -> bool {
    self.is_gain_toff() || self.is_tzero()
  }
}

impl fmt::Display for RunMode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      RunMode::DataAnalysis     => "DataAnalysis",
      RunMode::PedestalHighGain => "PedestalHighGain",
      RunMode::GainToffHighGain => "GainToffHighGain",
      RunMode::GainToffLowGain  => "GainToffLowGain",
      RunMode::PedestalLowGain  => "PedestalLowGain",
      RunMode::TZeroHighGain    => "TZeroHighGain",
      RunMode::TZeroLowGain     => "TZeroLowGain",
    };
    write!(f, "<RunMode: {}>", repr)
  }
}

impl TryFrom<u8> for RunMode {
  type Error = CalibrationError;

  fn try_from(code : u8) -> Result<Self, Self::Error> {
    RunMode::from_code(code)
      .ok_or(CalibrationError::Settings(format!("unknown run mode {}", code)))
  }
}

/// Accepts the numeric codes as well as the names
/// (case insensitive)
impl FromStr for RunMode {
  type Err = CalibrationError;

  fn from_str(s : &str) -> Result<Self, Self::Err> {
    if let Ok(code) = s.parse::<u8>() {
      return RunMode::try_from(code);
    }
    let mode = match s.to_lowercase().as_str() {
      "dataanalysis"     | "data"   => RunMode::DataAnalysis,
      "pedestalhighgain" | "peds"   => RunMode::PedestalHighGain,
      "gaintoffhighgain" | "gains"  => RunMode::GainToffHighGain,
      "gaintofflowgain"  | "lgains" => RunMode::GainToffLowGain,
      "pedestallowgain"  | "lpeds"  => RunMode::PedestalLowGain,
      "tzerohighgain"    | "tzero"  => RunMode::TZeroHighGain,
      "tzerolowgain"     | "ltzero" => RunMode::TZeroLowGain,
      _ => return Err(CalibrationError::Settings(format!("unknown run mode {}", s)))
    };
    Ok(mode)
  }
}

/// Calibrated signal of one channel in a data run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedChannel {
  pub channel  : u16,
  pub low_gain : bool,
  /// pedestal subtracted (and low gain corrected) sum
  pub sum      : f32,
  /// pedestal per sample which was subtracted
  pub ped      : f32,
  /// sum divided by the relative gain
  pub charge   : f32,
  /// arrival time corrected by the time offset
  pub t0       : f32,
  pub timing   : PulseTiming,
  pub status   : DeadReason,
}

impl CalibratedChannel {
  pub fn is_dead(&self) -> bool {
    self.status.is_dead()
  }
}

impl fmt::Display for CalibratedChannel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<CalibratedChannel {}: sum {:.2}, charge {:.2}, t0 {:.2}, {}{}>",
           self.channel, self.sum, self.charge, self.t0,
           self.status.description(),
           if self.low_gain {" (low gain)"} else {""})
  }
}

/// Calibration state of a single telescope
#[derive(Debug)]
pub struct TelescopeContext {
  pub desc        : TelescopeDescription,
  pub states      : ChannelStateTracker,
  pub peds_hg     : Option<LoadedPedestals>,
  pub peds_lg     : Option<LoadedPedestals>,
  pub gains_hg    : Option<GainSet>,
  pub gains_lg    : Option<GainSet>,
  pub toffs_hg    : Option<ToffSet>,
  pub toffs_lg    : Option<ToffSet>,
  pub multipliers : LowGainMultipliers,
  /// channels disabled in the pixel status file
  pub user_set    : Vec<u16>,
  pub masked      : Vec<u16>,
  pub time_slices : Option<TimeSliceBuilder>,
  pub gain_acc    : Option<GainTimingAccumulator>,
  pub tzero_acc   : Option<TZeroAccumulator>,
  pub n_events    : u64,
  pub n_vetoed    : u64,
  trace_warned    : bool,
}

impl TelescopeContext {

  pub fn new(desc        : &TelescopeDescription,
             settings    : &CalibrationSettings,
             user_set    : Vec<u16>,
             multipliers : LowGainMultipliers) -> Self {
    Self {
      desc        : desc.clone(),
      states      : ChannelStateTracker::new(desc.tel_id,
                                             desc.n_channels as usize,
                                             settings.channel_state.clone()),
      peds_hg     : None,
      peds_lg     : None,
      gains_hg    : None,
      gains_lg    : None,
      toffs_hg    : None,
      toffs_lg    : None,
      multipliers : multipliers,
      user_set    : user_set,
      masked      : settings.channel_state.masked_for(desc.tel_id),
      time_slices : None,
      gain_acc    : None,
      tzero_acc   : None,
      n_events    : 0,
      n_vetoed    : 0,
      trace_warned : false,
    }
  }

  pub fn tel_id(&self) -> u32 {
    self.desc.tel_id
  }

  pub fn n_channels(&self) -> usize {
    self.desc.n_channels as usize
  }

  /// Low gain pedestals fall back to the high gain ones
  pub fn pedestals(&self, gain_path : GainPath) -> Option<&LoadedPedestals> {
    match gain_path {
      GainPath::High => self.peds_hg.as_ref(),
      GainPath::Low  => self.peds_lg.as_ref().or(self.peds_hg.as_ref()),
    }
  }

  pub fn gains(&self, gain_path : GainPath) -> Option<&GainSet> {
    match gain_path {
      GainPath::High => self.gains_hg.as_ref(),
      GainPath::Low  => self.gains_lg.as_ref().or(self.gains_hg.as_ref()),
    }
  }

  pub fn toffs(&self, gain_path : GainPath) -> Option<&ToffSet> {
    match gain_path {
      GainPath::High => self.toffs_hg.as_ref(),
      GainPath::Low  => self.toffs_lg.as_ref().or(self.toffs_hg.as_ref()),
    }
  }

  /// Pedestal per sample, 0 without pedestals
  pub fn ped(&self, channel : usize, gain_path : GainPath) -> f32 {
    self.pedestals(gain_path)
      .and_then(|p| p.pedestals.ped(channel))
      .unwrap_or(0.0)
  }

  /// Pedestal variation of a window. In data runs with
  /// time slices the value of the last closed slice is
  /// used if it has one.
  pub fn pedvar(&self, channel : usize, window : usize, gain_path : GainPath) -> f32 {
    if !gain_path.is_low() {
      let sliced = self.time_slices.as_ref()
        .and_then(|ts| ts.last_slice())
        .and_then(|s| s.pedvar(channel, window));
      if let Some(pv) = sliced {
        if pv > 0.0 {
          return pv;
        }
      }
    }
    self.pedestals(gain_path)
      .and_then(|p| p.pedestals.pedvar(channel, window))
      .unwrap_or(0.0)
  }

  /// Log the first problem with a channel of this
  /// telescope as warning, the rest as debug
  fn report_trace_error(&mut self, event_number : u32, err : &TraceError) {
    if self.trace_warned {
      debug!("Telescope {} event {}: {}", self.tel_id(), event_number, err);
    } else {
      warn!("Telescope {} event {}: {} (further problems are logged at debug level)",
            self.tel_id(), event_number, err);
      self.trace_warned = true;
    }
  }

  /// Re-derive the dead channel status of one gain path
  /// from the loaded calibration
  pub fn evaluate_states(&mut self,
                         gain_path        : GainPath,
                         window           : usize,
                         monitor          : Option<&dyn ChannelMonitor>,
                         time_slice_aware : bool) -> Result<(), CalibrationError> {
    let n_channels = self.n_channels();
    let (peds, pedvars) = match self.pedestals(gain_path) {
      Some(p) if p.source != PedestalSource::Defaults => {
        let pedvars : Vec<f32> = (0..n_channels)
          .map(|ch| self.pedvar(ch, window, gain_path))
          .collect();
        (p.pedestals.peds.clone(), pedvars)
      }
      _ => (Vec::<f32>::new(), Vec::<f32>::new())
    };
    let gains = self.gains(gain_path).filter(|g| !g.is_default).cloned();
    let toffs = self.toffs(gain_path).filter(|t| !t.is_default).cloned();
    let inputs = ChannelStateInputs {
      peds      : &peds,
      pedvars   : &pedvars,
      gains     : gains.as_ref(),
      toffs     : toffs.as_ref(),
      fadc_stop : &self.desc.fadc_stop_channels,
      user_set  : &self.user_set,
      masked    : &self.masked,
      mc_dead   : &self.desc.mc_dead_channels,
      monitor   : monitor,
    };
    self.states.evaluate(&inputs, gain_path, time_slice_aware)?;
    Ok(())
  }
}

/// Drives one run through the calibration
pub struct Calibrator {
  pub settings   : CalibrationSettings,
  pub header     : RunHeader,
  pub integrator : TraceIntegrator,
  pub io         : CalibrationIO,
  pub ipr_curves : Vec<IprCurve>,
  pub n_events   : u64,
  telescopes     : BTreeMap<u32, TelescopeContext>,
  pedestals      : Option<PedestalAccumulator>,
  ipr_hists      : Option<IprChargeHistograms>,
  rotation       : Box<dyn FieldRotation>,
  monitor        : Option<Box<dyn ChannelMonitor>>,
  extra_tree     : Option<ExtraCalibrationWriter>,
  initialized    : bool,
}

impl Calibrator {

  /// # Errors
  ///
  /// Invalid settings
  pub fn new(settings : CalibrationSettings, header : RunHeader) -> Result<Self, CalibrationError> {
    settings.validate()?;
    let integrator = TraceIntegrator::new(&settings.trace);
    let io = CalibrationIO::new(settings.files.clone(),
                                header.run_number,
                                header.is_simulation,
                                settings.pedestal.n_sumwindows,
                                settings.no_calibration_no_problem);
    Ok(Self {
      settings    : settings,
      header      : header,
      integrator  : integrator,
      io          : io,
      ipr_curves  : Vec::<IprCurve>::new(),
      n_events    : 0,
      telescopes  : BTreeMap::<u32, TelescopeContext>::new(),
      pedestals   : None,
      ipr_hists   : None,
      rotation    : Box::new(NoFieldRotation),
      monitor     : None,
      extra_tree  : None,
      initialized : false,
    })
  }

  pub fn run_mode(&self) -> RunMode {
    self.settings.run_mode
  }

  pub fn set_database(&mut self, database : Box<dyn GainDatabase>) {
    self.io.set_database(database);
  }

  pub fn set_field_rotation(&mut self, rotation : Box<dyn FieldRotation>) {
    self.rotation = rotation;
  }

  pub fn set_channel_monitor(&mut self, monitor : Box<dyn ChannelMonitor>) {
    self.monitor = Some(monitor);
  }

  pub fn telescope(&self, tel_id : u32) -> Option<&TelescopeContext> {
    self.telescopes.get(&tel_id)
  }

  pub fn pedestal_accumulator(&self) -> Option<&PedestalAccumulator> {
    self.pedestals.as_ref()
  }

  /// Set up the telescopes, book accumulators and read
  /// the calibration products the run mode needs
  pub fn initialize(&mut self) -> Result<(), CalibrationError> {
    let mode      = self.run_mode();
    let gain_path = mode.gain_path();
    info!("Initializing calibration of run {} for {}", self.header.run_number, mode);
    let user_set = match &self.settings.channel_state.pixel_status_file {
      Some(f) => read_pixel_status(&PathBuf::from(f))?,
      None    => Default::default(),
    };
    let multipliers = match &self.settings.files.lowgain_multiplier_file {
      Some(f) => read_lowgain_multipliers(&PathBuf::from(f), self.settings.trace.lowgain_multiplier_default)?,
      None    => Default::default(),
    };
    let n_windows = self.settings.pedestal.n_sumwindows;
    let run_span  = self.header.run_span_sec();
    if mode.is_pedestal() {
      self.pedestals = Some(PedestalAccumulator::new(gain_path, n_windows));
      if self.settings.ipr.enabled {
        self.ipr_hists = Some(IprChargeHistograms::new(gain_path,
                                                       self.settings.ipr_windows(),
                                                       self.settings.pedestal.histogram_bins,
                                                       self.settings.pedestal.combine_channels));
      }
    }
    if mode == RunMode::DataAnalysis && self.settings.files.write_extra_calibration_tree {
      let path = PathBuf::from(&self.settings.files.calibration_dir)
        .join(format!("{}.extracalib.jsonl", self.header.run_number));
      self.extra_tree = Some(ExtraCalibrationWriter::create(&path)?);
    }
    for desc in self.header.telescopes.clone() {
      if mode.is_pedestal() && desc.n_samples > 0 && (desc.n_samples as usize) < n_windows {
        warn!("Telescope {} records {} samples, pedestal windows above that stay empty (n_sumwindows {})! Pedestals are taken from window {}.",
              desc.tel_id, desc.n_samples, n_windows, desc.n_samples);
      }
      let tel_user_set = user_set.get(&desc.tel_id).cloned().unwrap_or_default();
      let tel_mult     = multipliers.get(&desc.tel_id).cloned()
        .unwrap_or(LowGainMultipliers::new(self.settings.trace.lowgain_multiplier_default));
      let mut ctx = TelescopeContext::new(&desc, &self.settings, tel_user_set, tel_mult);
      let want_slices = self.settings.pedestal.time_slices
        && (mode.is_pedestal() || mode == RunMode::DataAnalysis);
      if want_slices {
        ctx.time_slices = Some(TimeSliceBuilder::new(&desc, n_windows,
                                                     self.settings.pedestal.timeslice_sec,
                                                     run_span));
      }
      match mode {
        RunMode::PedestalHighGain | RunMode::PedestalLowGain => {
          if let Some(peds) = self.pedestals.as_mut() {
            peds.register(&desc);
          }
        }
        RunMode::GainToffHighGain | RunMode::GainToffLowGain => {
          self.load_pedestals(&mut ctx, gain_path)?;
          ctx.evaluate_states(gain_path, self.settings.trace.sumwindow, self.monitor.as_deref(), false)?;
          ctx.gain_acc = Some(GainTimingAccumulator::new(desc.tel_id, desc.n_channels as usize,
                                                         gain_path, &self.settings.gain)?);
        }
        RunMode::TZeroHighGain | RunMode::TZeroLowGain => {
          self.load_pedestals(&mut ctx, gain_path)?;
          self.load_gains(&mut ctx, gain_path, true)?;
          ctx.evaluate_states(gain_path, self.settings.trace.sumwindow, self.monitor.as_deref(), false)?;
          ctx.tzero_acc = Some(TZeroAccumulator::new(desc.tel_id, desc.n_channels as usize,
                                                     desc.n_samples as usize, gain_path,
                                                     &self.settings.gain)?);
        }
        RunMode::DataAnalysis => {
          self.load_pedestals(&mut ctx, GainPath::High)?;
          if self.settings.files.lowgain_ped_run.is_some() {
            self.load_pedestals(&mut ctx, GainPath::Low)?;
          }
          self.load_gains(&mut ctx, GainPath::High, false)?;
          let has_low_gain = self.settings.files.lowgain_gain_run.is_some()
            || self.settings.files.lowgain_toff_run.is_some();
          if has_low_gain {
            self.load_gains(&mut ctx, GainPath::Low, false)?;
          }
          for gp in [GainPath::High, GainPath::Low] {
            ctx.evaluate_states(gp, self.settings.trace.sumwindow, self.monitor.as_deref(), false)?;
          }
          let n_random = self.settings.channel_state.n_random_dead;
          if self.header.is_simulation && n_random > 0 {
            let seed = self.settings.channel_state.random_dead_seed + desc.tel_id as u64;
            let n    = ctx.states.inject_random_dead(seed, n_random);
            info!("Telescope {}: {} channels disabled randomly", desc.tel_id, n);
          }
        }
      }
      self.telescopes.insert(desc.tel_id, ctx);
    }
    self.initialized = true;
    Ok(())
  }

  fn load_pedestals(&self, ctx : &mut TelescopeContext, gain_path : GainPath) -> Result<(), CalibrationError> {
    let loaded = self.io.read_pedestals(&ctx.desc, gain_path)?;
    match gain_path {
      GainPath::High => ctx.peds_hg = Some(loaded),
      GainPath::Low  => ctx.peds_lg = Some(loaded),
    }
    Ok(())
  }

  fn load_gains(&self, ctx : &mut TelescopeContext, gain_path : GainPath, tolerate_missing : bool) -> Result<(), CalibrationError> {
    let (gains, gsource) = self.io.read_gains(&ctx.desc, gain_path, tolerate_missing,
                                              self.settings.gain.zero_gain_reset)?;
    let (toffs, tsource) = self.io.read_toffs(&ctx.desc, gain_path, tolerate_missing)?;
    info!("Telescope {} ({}): gains from {}, toffs from {}", ctx.tel_id(), gain_path, gsource, tsource);
    match gain_path {
      GainPath::High => {
        ctx.gains_hg = Some(gains);
        ctx.toffs_hg = Some(toffs);
      }
      GainPath::Low => {
        ctx.gains_lg = Some(gains);
        ctx.toffs_lg = Some(toffs);
      }
    }
    Ok(())
  }

  /// Process one telescope event
  ///
  /// Returns the calibrated channels in data analysis
  /// mode, nothing in the calibration modes.
  ///
  /// # Errors
  ///
  /// `CalibrationError::Fatal` if the camera state turns
  /// unusable (e.g. all channels dead in a time slice)
  pub fn process_event(&mut self, event : &TelescopeEvent) -> Result<Vec<CalibratedChannel>, CalibrationError> {
    if !self.initialized {
      return Err(CalibrationError::Fatal(String::from("calibrator used before initialize()")));
    }
    let Some(ctx) = self.telescopes.get_mut(&event.tel_id) else {
      warn!("Event {} from unknown telescope {}", event.event_number, event.tel_id);
      return Ok(Vec::<CalibratedChannel>::new());
    };
    self.n_events += 1;
    ctx.states.new_event();
    for ch in &event.channels {
      if ch.is_saturated() {
        ctx.states.flag_saturated(ch.channel as usize);
      }
    }
    let mode = self.settings.run_mode;
    match mode {
      RunMode::PedestalHighGain | RunMode::PedestalLowGain => {
        if let Some(peds) = self.pedestals.as_mut() {
          pedestal_event(&self.settings, &self.integrator, self.header.zero_suppressed,
                         ctx, peds, self.ipr_hists.as_mut(), self.rotation.as_ref(), event)?;
        }
        Ok(Vec::<CalibratedChannel>::new())
      }
      RunMode::GainToffHighGain | RunMode::GainToffLowGain
      | RunMode::TZeroHighGain | RunMode::TZeroLowGain => {
        flasher_event(&self.settings, &self.integrator, mode, ctx, event);
        Ok(Vec::<CalibratedChannel>::new())
      }
      RunMode::DataAnalysis => {
        if event.event_type == EventType::Pedestal {
          data_pedestal_event(&self.settings, &self.integrator, ctx,
                              self.monitor.as_deref(), self.rotation.as_ref(), event)?;
          return Ok(Vec::<CalibratedChannel>::new());
        }
        let channels = calibrate_event(&self.integrator, &self.settings, ctx, event);
        if let Some(tree) = self.extra_tree.as_mut() {
          for c in &channels {
            tree.add(&ExtraCalibrationRecord {
              run     : self.header.run_number,
              event   : event.event_number,
              tel_id  : event.tel_id,
              channel : c.channel,
              sum     : c.sum,
              ped     : c.ped,
              dead    : c.is_dead(),
              used    : !c.is_dead() && c.sum > 0.0,
              tzero   : c.t0,
            })?;
          }
        }
        Ok(channels)
      }
    }
  }

  /// Write the products of the run. In pedestal modes
  /// the IPR curves are built once per telescope type.
  ///
  /// Returns the files written.
  pub fn terminate(&mut self) -> Result<Vec<PathBuf>, CalibrationError> {
    let mode    = self.run_mode();
    let run     = self.header.run_number;
    let gp      = mode.gain_path();
    let mut written = Vec::<PathBuf>::new();
    let rotation = self.rotation.as_ref();
    for ctx in self.telescopes.values_mut() {
      if let Some(builder) = ctx.time_slices.as_mut() {
        builder.finish(rotation);
      }
    }
    match mode {
      RunMode::PedestalHighGain | RunMode::PedestalLowGain => {
        written.extend(self.write_pedestal_products()?);
      }
      RunMode::GainToffHighGain | RunMode::GainToffLowGain => {
        for ctx in self.telescopes.values() {
          let Some(acc) = ctx.gain_acc.as_ref() else {
            continue;
          };
          let (gain_ext, toff_ext, pulse_ext) = if gp.is_low() {
            ("lgain", "ltoff", "lpulse")
          } else {
            ("gain", "toff", "pulse")
          };
          let gain_file = self.settings.files.product_path(ctx.tel_id(), run, gain_ext);
          let toff_file = self.settings.files.product_path(ctx.tel_id(), run, toff_ext);
          acc.write_ascii(&gain_file, &toff_file)?;
          written.push(gain_file);
          written.push(toff_file);
          if let Some(shapes) = acc.pulse_shapes.as_ref() {
            let path = self.settings.files.product_path(ctx.tel_id(), run, pulse_ext);
            shapes.write_ascii(&path)?;
            written.push(path);
          }
          info!("Telescope {}: {} flasher events used, {} vetoed", ctx.tel_id(), acc.n_events, ctx.n_vetoed);
        }
      }
      RunMode::TZeroHighGain | RunMode::TZeroLowGain => {
        for ctx in self.telescopes.values() {
          if let Some(acc) = ctx.tzero_acc.as_ref() {
            let ext  = if gp.is_low() {"ltzero"} else {"tzero"};
            let path = self.settings.files.product_path(ctx.tel_id(), run, ext);
            acc.write_ascii(&path)?;
            written.push(path);
          }
        }
      }
      RunMode::DataAnalysis => {
        if let Some(tree) = self.extra_tree.as_mut() {
          tree.flush()?;
          info!("Wrote {} records to {}", tree.n_records, tree.filename.display());
          written.push(tree.filename.clone());
        }
        for tel_type in self.header.telescope_types() {
          let mut tree = PedestalTree::new(run, tel_type);
          for ctx in self.telescopes.values().filter(|c| c.desc.tel_type == tel_type) {
            if let Some(builder) = ctx.time_slices.as_ref() {
              tree.time_slices.push(builder.slices.clone());
            }
          }
          if tree.time_slices.is_empty() {
            continue;
          }
          tree.has_time_slices = true;
          let path = self.settings.files.pedestal_tree_path(tel_type.0, run);
          write_pedestal_tree(&path, &tree)?;
          written.push(path);
        }
      }
    }
    info!("Calibration of run {} done, {} events, {} files written", run, self.n_events, written.len());
    Ok(written)
  }

  fn write_pedestal_products(&mut self) -> Result<Vec<PathBuf>, CalibrationError> {
    let mut written = Vec::<PathBuf>::new();
    let Some(peds) = self.pedestals.as_ref() else {
      return Ok(written);
    };
    let run = self.header.run_number;
    let gp  = self.run_mode().gain_path();
    let ext = if gp.is_low() {"lped"} else {"ped"};
    for ctx in self.telescopes.values() {
      let path = self.settings.files.product_path(ctx.tel_id(), run, ext);
      peds.write_ascii(ctx.desc.tel_type, ctx.tel_id(), &path, self.settings.pedestal.min_entries)?;
      written.push(path);
    }
    let builder   = IprGraphBuilder::new(&self.settings);
    let mut done  = HashSet::<TelescopeType>::new();
    let mut trees = BTreeMap::<TelescopeType, PedestalTree>::new();
    for ctx in self.telescopes.values() {
      let tel_type = ctx.desc.tel_type;
      let tree = trees.entry(tel_type).or_insert_with(|| {
        let mut t = PedestalTree::new(run, tel_type);
        t.low_gain = gp.is_low();
        t
      });
      if let Some(set) = peds.pedestal_set(tel_type, ctx.tel_id()) {
        tree.pedestals.push(set);
      }
      if let Some(ts) = ctx.time_slices.as_ref() {
        let mut slices  = ts.slices.clone();
        slices.low_gain = gp.is_low();
        tree.time_slices.push(slices);
        tree.has_time_slices = true;
      }
      if done.contains(&tel_type) {
        continue;
      }
      done.insert(tel_type);
      let Some(hists) = self.ipr_hists.as_ref() else {
        continue;
      };
      let type_peds = mean_pedestals(peds, tel_type);
      for window in &hists.windows {
        let Some(channel_hists) = hists.get(tel_type, *window) else {
          warn!("No IPR histograms for telescope type {}, window {}", tel_type, window);
          continue;
        };
        let curve = builder.build(tel_type, channel_hists, &type_peds, &[], ctx.desc.n_samples as usize)?;
        info!("{}", curve);
        tree.ipr_curves.push(curve.clone());
        self.ipr_curves.push(curve);
      }
      if self.settings.pedestal.write_distributions {
        tree.distributions = hists.distributions(tel_type);
      }
    }
    for (tel_type, tree) in trees {
      let path = self.settings.files.pedestal_tree_path(tel_type.0, run);
      write_pedestal_tree(&path, &tree)?;
      written.push(path);
    }
    Ok(written)
  }
}

impl fmt::Display for Calibrator {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Calibrator: run {}, {}, {} telescopes, {} events>",
           self.header.run_number, self.run_mode(), self.telescopes.len(), self.n_events)
  }
}

/// Channel mean of the pedestals of all telescopes of a type
fn mean_pedestals(peds : &PedestalAccumulator, tel_type : TelescopeType) -> Vec<f32> {
  let sets : Vec<_> = peds.telescopes(tel_type).into_iter()
    .filter_map(|tel_id| peds.pedestal_set(tel_type, tel_id))
    .collect();
  let n_channels = sets.iter().map(|s| s.n_channels()).min().unwrap_or(0);
  (0..n_channels)
    .map(|ch| sets.iter().map(|s| s.peds[ch]).sum::<f32>() / sets.len() as f32)
    .collect()
}

/// Pedestal runs use pedestal events, or all events if
/// the data carries no event types
fn is_pedestal_like(event : &TelescopeEvent) -> bool {
  matches!(event.event_type, EventType::Pedestal | EventType::Unknown)
}

fn pedestal_event(settings   : &CalibrationSettings,
                  integrator : &TraceIntegrator,
                  zs_run     : bool,
                  ctx        : &mut TelescopeContext,
                  peds       : &mut PedestalAccumulator,
                  mut ipr    : Option<&mut IprChargeHistograms>,
                  rotation   : &dyn FieldRotation,
                  event      : &TelescopeEvent) -> Result<(), CalibrationError> {
  if !is_pedestal_like(event) {
    return Ok(());
  }
  let n_windows = settings.pedestal.n_sumwindows;
  let tel_type  = ctx.desc.tel_type;
  let tel_id    = ctx.tel_id();
  ctx.n_events += 1;
  if let Some(ts) = ctx.time_slices.as_mut() {
    ts.new_event(event.mjd, event.time, rotation);
  }
  let mut ipr_sums = Vec::<Vec<f32>>::with_capacity(ctx.n_channels());
  for channel in 0..ctx.n_channels() {
    let ch = match event.get_channel(channel) {
      Ok(ch)   => ch,
      Err(err) => {
        ctx.report_trace_error(event.event_number, &err);
        ipr_sums.push(Vec::<f32>::new());
        continue;
      }
    };
    let is_low = integrator.is_low_gain(ch);
    let sums   = channel_window_sums(integrator, ch, n_windows);
    if peds.accepts(ch, is_low, zs_run) {
      peds.accumulate_sums(tel_type, tel_id, channel, &sums);
      if let Some(ts) = ctx.time_slices.as_mut() {
        ts.accumulate_sums(channel, &sums);
      }
    }
    let for_ipr = ipr.as_ref().map(|h| h.accepts(ch, is_low, zs_run)).unwrap_or(false);
    ipr_sums.push(if for_ipr { sums } else { Vec::<f32>::new() });
  }
  if let Some(hists) = ipr.as_mut() {
    if !hists.is_sized(tel_type) {
      hists.size_from_event(tel_type, &ipr_sums)?;
    }
    for (channel, sums) in ipr_sums.iter().enumerate() {
      if !sums.is_empty() {
        hists.fill(tel_type, channel, sums);
      }
    }
  }
  Ok(())
}

fn gain_context<'a>(settings    : &CalibrationSettings,
                    ctx         : &'a TelescopeContext,
                    channel     : usize,
                    is_low_gain : bool) -> GainContext<'a> {
  GainContext {
    ped             : ctx.ped(channel, GainPath::from_low_gain_flag(is_low_gain)),
    low_gain        : is_low_gain,
    method          : settings.trace.method,
    original_window : settings.trace.sumwindow,
    multipliers     : &ctx.multipliers,
  }
}

/// Gain/toff and average T0 runs
fn flasher_event(settings   : &CalibrationSettings,
                 integrator : &TraceIntegrator,
                 mode       : RunMode,
                 ctx        : &mut TelescopeContext,
                 event      : &TelescopeEvent) {
  if !matches!(event.event_type, EventType::Laser | EventType::Unknown) {
    return;
  }
  let gain_path   = mode.gain_path();
  let n_channels  = ctx.n_channels();
  let n_low_gain  = event.channels.iter().filter(|ch| integrator.is_low_gain(ch)).count();
  let n_saturated = event.n_saturated();
  if let Err(veto) = quality_gate(n_low_gain, n_saturated, n_channels, gain_path, &settings.gain) {
    debug!("Telescope {} event {} vetoed: {}", ctx.tel_id(), event.event_number, veto);
    ctx.n_vetoed += 1;
    return;
  }
  let mut signals = Vec::<FlasherSignal>::with_capacity(n_channels);
  let mut errors  = Vec::<TraceError>::new();
  let mut total   = 0.0f64;
  for channel in 0..n_channels {
    let ch = match event.get_channel(channel) {
      Ok(ch)   => ch,
      Err(err) => {
        errors.push(err);
        continue;
      }
    };
    let is_low = integrator.is_low_gain(ch);
    let gctx   = gain_context(settings, ctx, channel, is_low);
    let ped    = gctx.ped;
    let (sum, timing) = match integrator.extract(event, channel, &gctx) {
      Ok(r)    => r,
      Err(err) => {
        errors.push(err);
        continue;
      }
    };
    if let Some(acc) = ctx.gain_acc.as_mut() {
      if let Some(shapes) = acc.pulse_shapes.as_mut() {
        if is_low == gain_path.is_low() && ch.has_trace() {
          shapes.add(channel, &ch.samples, ped);
        }
      }
    }
    let dead = ctx.states.is_dead(channel, gain_path) || is_low != gain_path.is_low();
    if !dead {
      total += sum as f64;
    }
    signals.push(FlasherSignal {
      channel : channel,
      sum     : sum,
      t0      : timing.t0,
      dead    : dead,
      masked  : ctx.states.is_masked(channel),
    });
  }
  for err in &errors {
    ctx.report_trace_error(event.event_number, err);
  }
  if !is_qualifying_event(total, settings.gain.laser_min_sum) {
    debug!("Telescope {} event {}: total charge {:.0} below the laser threshold",
           ctx.tel_id(), event.event_number, total);
    ctx.n_vetoed += 1;
    return;
  }
  ctx.n_events += 1;
  if let Some(acc) = ctx.gain_acc.as_mut() {
    acc.accumulate_event(&signals);
  }
  if let Some(acc) = ctx.tzero_acc.as_mut() {
    for s in &signals {
      acc.accumulate(s.channel, s.sum, s.t0, s.dead || s.masked);
    }
    acc.n_events += 1;
  }
}

/// Pedestal events of a data run feed the time slices.
/// Whenever a slice closes, the channel states are
/// re-derived with its pedestal variations.
fn data_pedestal_event(settings   : &CalibrationSettings,
                       integrator : &TraceIntegrator,
                       ctx        : &mut TelescopeContext,
                       monitor    : Option<&dyn ChannelMonitor>,
                       rotation   : &dyn FieldRotation,
                       event      : &TelescopeEvent) -> Result<(), CalibrationError> {
  let n_windows = settings.pedestal.n_sumwindows;
  let closed = match ctx.time_slices.as_mut() {
    Some(ts) => ts.new_event(event.mjd, event.time, rotation),
    None     => return Ok(()),
  };
  if closed {
    ctx.evaluate_states(GainPath::High, settings.trace.sumwindow, monitor, true)?;
  }
  let mut errors = Vec::<TraceError>::new();
  for channel in 0..ctx.n_channels() {
    let ch = match event.get_channel(channel) {
      Ok(ch)   => ch,
      Err(err) => {
        errors.push(err);
        continue;
      }
    };
    if integrator.is_low_gain(ch) || (ch.zero_suppressed && !ch.has_trace()) {
      continue;
    }
    let sums = channel_window_sums(integrator, ch, n_windows);
    if let Some(ts) = ctx.time_slices.as_mut() {
      ts.accumulate_sums(channel, &sums);
    }
  }
  for err in &errors {
    ctx.report_trace_error(event.event_number, err);
  }
  Ok(())
}

/// Calibrated channels of a data event
fn calibrate_event(integrator : &TraceIntegrator,
                   settings   : &CalibrationSettings,
                   ctx        : &mut TelescopeContext,
                   event      : &TelescopeEvent) -> Vec<CalibratedChannel> {
  let mut channels = Vec::<CalibratedChannel>::with_capacity(ctx.n_channels());
  let mut errors   = Vec::<TraceError>::new();
  for channel in 0..ctx.n_channels() {
    let ch = match event.get_channel(channel) {
      Ok(ch)   => ch,
      Err(err) => {
        errors.push(err);
        continue;
      }
    };
    // no hit bit, nothing to calibrate
    if ch.zero_suppressed {
      continue;
    }
    let is_low    = integrator.is_low_gain(ch);
    let gain_path = GainPath::from_low_gain_flag(is_low);
    let gctx      = gain_context(settings, ctx, channel, is_low);
    let (sum, timing) = match integrator.extract(event, channel, &gctx) {
      Ok(r)    => r,
      Err(err) => {
        errors.push(err);
        continue;
      }
    };
    let gain = ctx.gains(gain_path).and_then(|g| g.get(channel)).unwrap_or(1.0);
    let toff = ctx.toffs(gain_path).and_then(|t| t.get(channel)).unwrap_or(0.0);
    channels.push(CalibratedChannel {
      channel  : channel as u16,
      low_gain : is_low,
      sum      : sum,
      ped      : gctx.ped,
      charge   : if gain > 0.0 { sum / gain } else { 0.0 },
      t0       : timing.t0 - toff,
      timing   : timing,
      status   : ctx.states.event_status(channel, gain_path),
    });
  }
  for err in &errors {
    ctx.report_trace_error(event.event_number, err);
  }
  channels
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn legacy_run_mode_codes() {
    for code in [0u8, 1, 2, 5, 6, 7, 8] {
      let mode = RunMode::from_code(code).unwrap();
      assert_eq!(mode.code(), code);
    }
    assert!(RunMode::from_code(3).is_none());
    assert!(RunMode::try_from(4u8).is_err());
    assert_eq!(RunMode::from_code(6).map(|m| m.gain_path()), Some(GainPath::Low));
  }

  #[test]
  fn run_mode_from_str() {
    assert_eq!("2".parse::<RunMode>().unwrap(), RunMode::GainToffHighGain);
    assert_eq!("PedestalLowGain".parse::<RunMode>().unwrap(), RunMode::PedestalLowGain);
    assert_eq!("ltzero".parse::<RunMode>().unwrap(), RunMode::TZeroLowGain);
    assert!("nonsense".parse::<RunMode>().is_err());
  }

  #[test]
  fn process_before_initialize_fails() {
    let mut header = RunHeader::new();
    header.telescopes.push(TelescopeDescription::new(1, TelescopeType(1), 10, 24));
    let mut calib = Calibrator::new(CalibrationSettings::new(), header).unwrap();
    assert!(calib.process_event(&TelescopeEvent::new()).is_err());
  }

  #[test]
  fn invalid_settings_are_rejected() {
    let mut settings = CalibrationSettings::new();
    settings.trace.method = 7;
    assert!(Calibrator::new(settings, RunHeader::new()).is_err());
  }
}
