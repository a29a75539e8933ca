//! Reading and writing of calibration products
//!
//! Pedestals are searched for in a fixed order, the
//! first source which delivers wins:
//!
//! 1. structured pedestal file of the telescope type
//! 2. combined multi run text file
//! 3. per telescope text file
//! 4. pedestals from the simulation run header
//!
//! Gains and time offsets come from an (optional)
//! database, from text files or fall back to neutral
//! values. What is fatal and what is tolerated depends
//! on the run mode and on `no_calibration_no_problem`.
//!

use std::collections::HashMap;
use std::fmt;
use std::fs::{self,
              File};
use std::io::{BufWriter,
              Write};
use std::path::{Path,
                PathBuf};

use serde::{Deserialize, Serialize};

use vts_dataclasses::calibrations::{GainSet,
                                    PedestalSet,
                                    PedestalTree,
                                    TimeSlicePedestals,
                                    ToffSet};
use vts_dataclasses::errors::CalibrationError;
use vts_dataclasses::io::{read_file,
                          read_lines};
use vts_dataclasses::serialization::Serialization;
use vts_dataclasses::{GainPath,
                      TelescopeDescription};

use crate::settings::{CalibrationFileSettings,
                      ModuleSwap};
use crate::trace::LowGainMultipliers;

/// Where the pedestals of a telescope came from
#[derive(Debug, Clone, PartialEq)]
pub enum PedestalSource {
  PedestalTree(PathBuf),
  CombinedFile {
    path : PathBuf,
    run  : u32,
  },
  TextFile(PathBuf),
  Simulation,
  Defaults,
}

impl fmt::Display for PedestalSource {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      PedestalSource::PedestalTree(p)          => write!(f, "<PedestalSource: tree {}>", p.display()),
      PedestalSource::CombinedFile {path, run} => write!(f, "<PedestalSource: combined file {} (run {})>", path.display(), run),
      PedestalSource::TextFile(p)              => write!(f, "<PedestalSource: text file {}>", p.display()),
      PedestalSource::Simulation               => write!(f, "<PedestalSource: simulation>"),
      PedestalSource::Defaults                 => write!(f, "<PedestalSource: defaults>"),
    }
  }
}

/// Where gains or time offsets came from
#[derive(Debug, Clone, PartialEq)]
pub enum GainSource {
  Database(String),
  TextFile(PathBuf),
  Defaults,
}

impl fmt::Display for GainSource {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      GainSource::Database(s) => write!(f, "<GainSource: database ({})>", s),
      GainSource::TextFile(p) => write!(f, "<GainSource: text file {}>", p.display()),
      GainSource::Defaults    => write!(f, "<GainSource: defaults>"),
    }
  }
}

/// Pedestals of one telescope as read by the fallback chain
#[derive(Debug, Clone)]
pub struct LoadedPedestals {
  pub pedestals   : PedestalSet,
  pub time_slices : Option<TimeSlicePedestals>,
  pub source      : PedestalSource,
}

/// Products kept in the gain database
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CalibrationProduct {
  Gain,
  Toff,
}

impl CalibrationProduct {

  /// File extension of the product
  pub fn extension(&self, gain_path : GainPath) -> &'static str {
    match (self, gain_path) {
      (CalibrationProduct::Gain, GainPath::High) => "gain",
      (CalibrationProduct::Gain, GainPath::Low)  => "lgain",
      (CalibrationProduct::Toff, GainPath::High) => "toff",
      (CalibrationProduct::Toff, GainPath::Low)  => "ltoff",
    }
  }
}

impl fmt::Display for CalibrationProduct {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      CalibrationProduct::Gain => "gain",
      CalibrationProduct::Toff => "toff",
    };
    write!(f, "{}", repr)
  }
}

/// External storage of relative gains and time offsets
pub trait GainDatabase {

  fn name(&self) -> String;

  /// (channel, value, variance) rows of a product for
  /// the given calibration run, `None` if the database
  /// does not know the run
  fn query(&self,
           tel_id    : u32,
           run       : u32,
           product   : CalibrationProduct,
           gain_path : GainPath) -> Result<Option<Vec<(u16, f32, f32)>>, CalibrationError>;
}

/// Numbers of the non empty lines of a text file,
/// together with their line number. Lines starting
/// with `#` are comments.
pub fn read_table(filename : &Path) -> Result<Vec<(usize, Vec<f64>)>, CalibrationError> {
  let lines = read_lines(filename).map_err(|e| CalibrationError::io(filename, e))?;
  let mut rows = Vec::<(usize, Vec<f64>)>::new();
  for (k, line) in lines.enumerate() {
    let line = line.map_err(|e| CalibrationError::io(filename, e))?;
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let mut values = Vec::<f64>::new();
    for token in line.split_whitespace() {
      let value = token.parse::<f64>()
        .map_err(|e| CalibrationError::parse(filename, k + 1, format!("'{}' {}", token, e)))?;
      values.push(value);
    }
    rows.push((k + 1, values));
  }
  Ok(rows)
}

fn create_writer(filename : &Path) -> Result<BufWriter<File>, CalibrationError> {
  if let Some(dir) = filename.parent() {
    fs::create_dir_all(dir).map_err(|e| CalibrationError::io(dir, e))?;
  }
  let file = File::create(filename).map_err(|e| CalibrationError::io(filename, e))?;
  Ok(BufWriter::new(file))
}

/// Read a `tel ch ped pedvar_1 ... pedvar_N` file.
///
/// Lines of other telescopes are ignored, missing
/// windows are filled with the largest window present.
pub fn read_pedestal_text(filename   : &Path,
                          tel_id     : u32,
                          n_channels : usize,
                          n_windows  : usize) -> Result<PedestalSet, CalibrationError> {
  let mut set = PedestalSet::new(tel_id, n_channels, n_windows);
  let mut n_read = 0usize;
  for (line, values) in read_table(filename)? {
    if values.len() < 3 {
      return Err(CalibrationError::parse(filename, line, "expected tel ch ped pedvars..."));
    }
    if values[0] as u32 != tel_id {
      continue;
    }
    let ch = values[1] as usize;
    if ch >= n_channels {
      warn!("{} line {}: channel {} out of range", filename.display(), line, ch);
      continue;
    }
    set.peds[ch] = values[2] as f32;
    fill_pedvars(&mut set.pedvars[ch], &values[3..]);
    n_read += 1;
  }
  if n_read == 0 {
    return Err(CalibrationError::MissingCalibration {
      what   : format!("pedestal ({})", filename.display()),
      tel_id : tel_id,
    });
  }
  Ok(set)
}

fn fill_pedvars(pedvars : &mut [f32], values : &[f64]) {
  let mut last = 0.0f32;
  for (w, var) in pedvars.iter_mut().enumerate() {
    if let Some(v) = values.get(w) {
      last = *v as f32;
    }
    *var = last;
  }
}

/// Pedestals from a structured pedestal file.
///
/// Low gain pedestals are only taken if the file
/// carries time slices.
pub fn read_pedestal_tree(filename : &Path,
                          tel_id   : u32,
                          low_gain : bool) -> Result<Option<(PedestalSet, Option<TimeSlicePedestals>)>, CalibrationError> {
  let stream   = read_file(filename).map_err(|e| CalibrationError::io(filename, e))?;
  let mut pos  = 0usize;
  let tree     = PedestalTree::from_bytestream(&stream, &mut pos)
    .map_err(|e| CalibrationError::Serialization {path : filename.to_path_buf(), source : e})?;
  if tree.low_gain != low_gain {
    return Ok(None);
  }
  if low_gain && !tree.has_time_slices {
    debug!("{} has no time slices, not used for low gain pedestals", filename.display());
    return Ok(None);
  }
  let Some(peds) = tree.get_pedestals(tel_id) else {
    return Ok(None);
  };
  let time_slices = tree.get_time_slices(tel_id).cloned();
  Ok(Some((peds.clone(), time_slices)))
}

pub fn write_pedestal_tree(filename : &Path, tree : &PedestalTree) -> Result<(), CalibrationError> {
  let mut writer = create_writer(filename)?;
  writer.write_all(&tree.to_bytestream()).map_err(|e| CalibrationError::io(filename, e))?;
  writer.flush().map_err(|e| CalibrationError::io(filename, e))?;
  info!("Wrote {} to {}", tree, filename.display());
  Ok(())
}

/// One line of the combined pedestal file
#[derive(Debug, Clone, PartialEq)]
struct CombinedEntry {
  run     : u32,
  ped     : f32,
  pedvars : Vec<f64>,
}

/// Pedestals of many calibration runs of one telescope,
/// `module fadc_channel run ped pedvar_1 ... pedvar_N`
#[derive(Debug, Clone)]
pub struct CombinedPedestalFile {
  pub filename        : PathBuf,
  channels_per_module : u32,
  /// (module, fadc channel) -> entries
  entries             : HashMap<(u32, u32), Vec<CombinedEntry>>,
}

impl CombinedPedestalFile {

  pub fn open(filename : &Path, channels_per_module : u32) -> Result<Self, CalibrationError> {
    let mut entries = HashMap::<(u32, u32), Vec<CombinedEntry>>::new();
    for (line, values) in read_table(filename)? {
      if values.len() < 4 {
        return Err(CalibrationError::parse(filename, line, "expected module channel run ped pedvars..."));
      }
      entries.entry((values[0] as u32, values[1] as u32))
        .or_default()
        .push(CombinedEntry {
          run     : values[2] as u32,
          ped     : values[3] as f32,
          pedvars : values[4..].to_vec(),
        });
    }
    Ok(Self {
      filename            : filename.to_path_buf(),
      channels_per_module : channels_per_module,
      entries             : entries,
    })
  }

  /// All calibration runs in the file, sorted
  pub fn runs(&self) -> Vec<u32> {
    let mut runs : Vec<u32> = self.entries.values().flatten().map(|e| e.run).collect();
    runs.sort();
    runs.dedup();
    runs
  }

  /// The calibration run closest to `data_run`, ties
  /// go to the earlier run
  pub fn nearest_run(&self, data_run : u32) -> Option<u32> {
    self.runs().into_iter()
      .min_by_key(|r| ((*r as i64 - data_run as i64).abs(), *r))
  }

  /// Module of a camera channel after applying module
  /// exchanges valid for this run
  fn module_of(&self, channel : u32, tel_id : u32, data_run : u32, swaps : &[ModuleSwap]) -> (u32, u32) {
    let mut module = channel / self.channels_per_module;
    let fadc_ch    = channel % self.channels_per_module;
    for swap in swaps {
      if swap.tel_id != tel_id || data_run < swap.run_min || data_run > swap.run_max {
        continue;
      }
      if module == swap.module_a {
        module = swap.module_b;
      } else if module == swap.module_b {
        module = swap.module_a;
      }
    }
    (module, fadc_ch)
  }

  /// Pedestals of the calibration run nearest to `data_run`
  pub fn pedestals(&self,
                   tel_id     : u32,
                   data_run   : u32,
                   n_channels : usize,
                   n_windows  : usize,
                   swaps      : &[ModuleSwap]) -> Option<(u32, PedestalSet)> {
    let run = self.nearest_run(data_run)?;
    let mut set = PedestalSet::new(tel_id, n_channels, n_windows);
    let mut n_found = 0usize;
    for ch in 0..n_channels {
      let key = self.module_of(ch as u32, tel_id, data_run, swaps);
      let entry = self.entries.get(&key)
        .and_then(|list| list.iter().find(|e| e.run == run));
      if let Some(e) = entry {
        set.peds[ch] = e.ped;
        fill_pedvars(&mut set.pedvars[ch], &e.pedvars);
        n_found += 1;
      }
    }
    if n_found == 0 {
      return None;
    }
    if n_found < n_channels {
      warn!("{}: only {} of {} channels of telescope {} found for run {}",
            self.filename.display(), n_found, n_channels, tel_id, run);
    }
    Some((run, set))
  }
}

/// Read a `ch value variance` file of gains or time offsets
pub fn read_channel_values(filename   : &Path,
                           n_channels : usize) -> Result<(Vec<f32>, Vec<f32>), CalibrationError> {
  let mut values = vec![0.0f32;n_channels];
  let mut vars   = vec![0.0f32;n_channels];
  for (line, row) in read_table(filename)? {
    if row.len() < 2 {
      return Err(CalibrationError::parse(filename, line, "expected ch value variance"));
    }
    let ch = row[0] as usize;
    if ch >= n_channels {
      warn!("{} line {}: channel {} out of range", filename.display(), line, ch);
      continue;
    }
    values[ch] = row[1] as f32;
    vars[ch]   = row.get(2).copied().unwrap_or(0.0) as f32;
  }
  Ok((values, vars))
}

/// Channel states of a pixel status file, `tel ch status`.
///
/// Returns the channels with a non zero status per telescope.
pub fn read_pixel_status(filename : &Path) -> Result<HashMap<u32, Vec<u16>>, CalibrationError> {
  let mut disabled = HashMap::<u32, Vec<u16>>::new();
  for (line, row) in read_table(filename)? {
    if row.len() < 3 {
      return Err(CalibrationError::parse(filename, line, "expected tel ch status"));
    }
    if row[2] as i64 != 0 {
      disabled.entry(row[0] as u32).or_default().push(row[1] as u16);
    }
  }
  Ok(disabled)
}

/// Low gain multipliers, `tel method window multiplier`
pub fn read_lowgain_multipliers(filename : &Path, default : f32) -> Result<HashMap<u32, LowGainMultipliers>, CalibrationError> {
  let mut tables = HashMap::<u32, LowGainMultipliers>::new();
  for (line, row) in read_table(filename)? {
    if row.len() < 4 {
      return Err(CalibrationError::parse(filename, line, "expected tel method window multiplier"));
    }
    tables.entry(row[0] as u32)
      .or_insert_with(|| LowGainMultipliers::new(default))
      .insert(row[1] as u8, row[2] as usize, row[3] as f32);
  }
  Ok(tables)
}

/// One channel of one event, for external checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraCalibrationRecord {
  pub run      : u32,
  pub event    : u32,
  pub tel_id   : u32,
  pub channel  : u16,
  pub sum      : f32,
  pub ped      : f32,
  pub dead     : bool,
  pub used     : bool,
  pub tzero    : f32,
}

/// Writes one json line per `ExtraCalibrationRecord`
pub struct ExtraCalibrationWriter {
  pub filename  : PathBuf,
  writer        : BufWriter<File>,
  pub n_records : usize,
}

impl ExtraCalibrationWriter {

  pub fn create(filename : &Path) -> Result<Self, CalibrationError> {
    Ok(Self {
      filename  : filename.to_path_buf(),
      writer    : create_writer(filename)?,
      n_records : 0,
    })
  }

  pub fn add(&mut self, record : &ExtraCalibrationRecord) -> Result<(), CalibrationError> {
    let line = serde_json::to_string(record)
      .map_err(|e| CalibrationError::Settings(format!("Unable to serialize record! {}", e)))?;
    writeln!(self.writer, "{}", line).map_err(|e| CalibrationError::io(&self.filename, e))?;
    self.n_records += 1;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), CalibrationError> {
    self.writer.flush().map_err(|e| CalibrationError::io(&self.filename, e))
  }
}

impl fmt::Debug for ExtraCalibrationWriter {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ExtraCalibrationWriter: {}, {} records>", self.filename.display(), self.n_records)
  }
}

/// Read and write calibration products for one run
pub struct CalibrationIO {
  pub files                     : CalibrationFileSettings,
  pub run_number                : u32,
  pub is_simulation             : bool,
  pub n_windows                 : usize,
  pub no_calibration_no_problem : bool,
  pub database                  : Option<Box<dyn GainDatabase>>,
}

impl CalibrationIO {

  pub fn new(files                     : CalibrationFileSettings,
             run_number                : u32,
             is_simulation             : bool,
             n_windows                 : usize,
             no_calibration_no_problem : bool) -> Self {
    Self {
      files                     : files,
      run_number                : run_number,
      is_simulation             : is_simulation,
      n_windows                 : n_windows,
      no_calibration_no_problem : no_calibration_no_problem,
      database                  : None,
    }
  }

  pub fn set_database(&mut self, database : Box<dyn GainDatabase>) {
    self.database = Some(database);
  }

  fn pedestal_run(&self, gain_path : GainPath) -> Option<u32> {
    match gain_path {
      GainPath::High => self.files.ped_run,
      GainPath::Low  => self.files.lowgain_ped_run,
    }
  }

  fn product_run(&self, product : CalibrationProduct, gain_path : GainPath) -> Option<u32> {
    match (product, gain_path) {
      (CalibrationProduct::Gain, GainPath::High) => self.files.gain_run,
      (CalibrationProduct::Gain, GainPath::Low)  => self.files.lowgain_gain_run,
      (CalibrationProduct::Toff, GainPath::High) => self.files.toff_run,
      (CalibrationProduct::Toff, GainPath::Low)  => self.files.lowgain_toff_run,
    }
  }

  /// Combined file of a telescope, `{tel}` in the
  /// configured name is replaced by the telescope id
  pub fn combined_file(&self, tel_id : u32) -> Option<PathBuf> {
    self.files.combined_ped_file.as_ref()
      .map(|name| PathBuf::from(name.replace("{tel}", &tel_id.to_string())))
  }

  /// Run the pedestal fallback chain for one telescope
  ///
  /// # Errors
  ///
  /// `CalibrationError::Fatal` if no source delivers and
  /// missing calibration is not tolerated
  pub fn read_pedestals(&self,
                        desc      : &TelescopeDescription,
                        gain_path : GainPath) -> Result<LoadedPedestals, CalibrationError> {
    let tel_id     = desc.tel_id;
    let n_channels = desc.n_channels as usize;
    let low_gain   = gain_path.is_low();
    let ped_run    = self.pedestal_run(gain_path);
    let done = |mut peds : PedestalSet, ts : Option<TimeSlicePedestals>, source : PedestalSource| {
      peds.low_gain = low_gain;
      info!("Telescope {} ({}) pedestals from {}", tel_id, gain_path, source);
      Ok(LoadedPedestals {
        pedestals   : peds,
        time_slices : ts,
        source      : source,
      })
    };
    if let Some(run) = ped_run {
      let path = self.files.pedestal_tree_path(desc.tel_type.0, run);
      if path.exists() {
        match read_pedestal_tree(&path, tel_id, low_gain) {
          Ok(Some((peds, ts))) => return done(peds, ts, PedestalSource::PedestalTree(path)),
          Ok(None)             => debug!("No pedestals for telescope {} in {}", tel_id, path.display()),
          Err(err)             => warn!("Unable to read {}! {}", path.display(), err),
        }
      }
    }
    if let Some(path) = self.combined_file(tel_id) {
      match CombinedPedestalFile::open(&path, self.files.channels_per_module) {
        Ok(combined) => {
          if let Some((run, peds)) = combined.pedestals(tel_id, self.run_number, n_channels,
                                                        self.n_windows, &self.files.module_swaps) {
            return done(peds, None, PedestalSource::CombinedFile {path, run});
          }
          warn!("{} has no pedestals for telescope {}", path.display(), tel_id);
        }
        Err(err) => warn!("Unable to read combined pedestal file! {}", err),
      }
    }
    if let Some(run) = ped_run {
      let ext  = if low_gain {"lped"} else {"ped"};
      let path = self.files.product_path(tel_id, run, ext);
      match read_pedestal_text(&path, tel_id, n_channels, self.n_windows) {
        Ok(peds) => return done(peds, None, PedestalSource::TextFile(path)),
        Err(err) => warn!("Unable to read pedestals! {}", err),
      }
    }
    let nothing_configured = ped_run.is_none() && self.files.combined_ped_file.is_none();
    if nothing_configured && self.is_simulation && desc.sim_pedestals.len() >= n_channels {
      let mut peds = PedestalSet::new(tel_id, n_channels, self.n_windows);
      for ch in 0..n_channels {
        peds.peds[ch] = desc.sim_pedestals[ch];
        let var1 = desc.sim_pedvars.get(ch).copied().unwrap_or(0.0);
        for w in 0..self.n_windows {
          peds.pedvars[ch][w] = var1 * ((w + 1) as f32).sqrt();
        }
      }
      return done(peds, None, PedestalSource::Simulation);
    }
    if self.no_calibration_no_problem {
      warn!("No {} pedestals for telescope {}, using pedestal 0 and pedvar 0", gain_path, tel_id);
      return done(PedestalSet::new(tel_id, n_channels, self.n_windows), None, PedestalSource::Defaults);
    }
    error!("No {} pedestals for telescope {}!", gain_path, tel_id);
    Err(CalibrationError::Fatal(format!("no {} pedestals for telescope {}", gain_path, tel_id)))
  }

  /// File of a database snapshot, unique per query
  fn snapshot_path(&self, tel_id : u32, run : u32, product : CalibrationProduct, gain_path : GainPath) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.6f");
    self.files.telescope_dir(tel_id)
      .join(format!("db_{}_{}_{}.{}", run, product, stamp, product.extension(gain_path)))
  }

  /// Query the database and cache the result in a
  /// snapshot file, which is read back like any other
  /// text file
  fn read_from_database(&self,
                        db         : &dyn GainDatabase,
                        tel_id     : u32,
                        n_channels : usize,
                        run        : u32,
                        product    : CalibrationProduct,
                        gain_path  : GainPath) -> Result<Option<(Vec<f32>, Vec<f32>)>, CalibrationError> {
    let Some(rows) = db.query(tel_id, run, product, gain_path)? else {
      return Ok(None);
    };
    let path = self.snapshot_path(tel_id, run, product, gain_path);
    {
      let mut writer = create_writer(&path)?;
      for (ch, value, var) in &rows {
        writeln!(writer, "{} {} {}", ch, value, var).map_err(|e| CalibrationError::io(&path, e))?;
      }
      writer.flush().map_err(|e| CalibrationError::io(&path, e))?;
    }
    let result = read_channel_values(&path, n_channels);
    if self.files.keep_db_snapshots {
      info!("Keeping database snapshot {}", path.display());
    } else if let Err(err) = fs::remove_file(&path) {
      warn!("Unable to remove database snapshot {}! {}", path.display(), err);
    }
    result.map(Some)
  }

  /// Values of a gain like product (database, text, defaults)
  fn read_product(&self,
                  desc             : &TelescopeDescription,
                  product          : CalibrationProduct,
                  gain_path        : GainPath,
                  tolerate_missing : bool,
                  default          : f32) -> Result<(Vec<f32>, Vec<f32>, GainSource), CalibrationError> {
    let tel_id     = desc.tel_id;
    let n_channels = desc.n_channels as usize;
    if let Some(run) = self.product_run(product, gain_path) {
      if self.files.use_db {
        if let Some(db) = &self.database {
          match self.read_from_database(db.as_ref(), tel_id, n_channels, run, product, gain_path) {
            Ok(Some((values, vars))) => return Ok((values, vars, GainSource::Database(db.name()))),
            Ok(None)  => warn!("Database {} has no {} for telescope {} run {}", db.name(), product, tel_id, run),
            Err(err)  => warn!("Database query failed! {}", err),
          }
        }
      }
      let path = self.files.product_path(tel_id, run, product.extension(gain_path));
      match read_channel_values(&path, n_channels) {
        Ok((values, vars)) => return Ok((values, vars, GainSource::TextFile(path))),
        Err(err)           => warn!("Unable to read {}! {}", product, err),
      }
    }
    if tolerate_missing || self.no_calibration_no_problem {
      warn!("No {} {} for telescope {}, using {} for all channels", gain_path, product, tel_id, default);
      return Ok((vec![default;n_channels], vec![0.0;n_channels], GainSource::Defaults));
    }
    error!("No {} {} for telescope {}!", gain_path, product, tel_id);
    Err(CalibrationError::Fatal(format!("no {} {} for telescope {}", gain_path, product, tel_id)))
  }

  /// Relative gains of one telescope
  ///
  /// Missing gains are tolerated (gain 1) for flasher
  /// runs. If more than `zero_gain_reset` channels have
  /// a gain of 0, all gains are reset to 1.
  pub fn read_gains(&self,
                    desc             : &TelescopeDescription,
                    gain_path        : GainPath,
                    tolerate_missing : bool,
                    zero_gain_reset  : Option<usize>) -> Result<(GainSet, GainSource), CalibrationError> {
    let (values, vars, source) = self.read_product(desc, CalibrationProduct::Gain, gain_path,
                                                   tolerate_missing, 1.0)?;
    let mut gains = GainSet::neutral(desc.tel_id, desc.n_channels as usize);
    gains.low_gain   = gain_path.is_low();
    gains.is_default = source == GainSource::Defaults;
    gains.gain       = values;
    gains.gain_var   = vars;
    if let Some(limit) = zero_gain_reset {
      let n_zero = gains.n_zero();
      if n_zero > limit {
        warn!("Telescope {}: {} channels with gain 0 (limit {}), resetting all gains to 1",
              desc.tel_id, n_zero, limit);
        gains.gain.iter_mut().for_each(|g| *g = 1.0);
        gains.is_default = true;
      }
    }
    Ok((gains, source))
  }

  /// Time offsets of one telescope
  pub fn read_toffs(&self,
                    desc             : &TelescopeDescription,
                    gain_path        : GainPath,
                    tolerate_missing : bool) -> Result<(ToffSet, GainSource), CalibrationError> {
    let (values, vars, source) = self.read_product(desc, CalibrationProduct::Toff, gain_path,
                                                   tolerate_missing, 0.0)?;
    let mut toffs = ToffSet::neutral(desc.tel_id, desc.n_channels as usize);
    toffs.low_gain   = gain_path.is_low();
    toffs.is_default = source == GainSource::Defaults;
    toffs.toff       = values;
    toffs.toff_var   = vars;
    Ok((toffs, source))
  }
}

impl fmt::Debug for CalibrationIO {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<CalibrationIO: run {}, dir {}, db {}>",
           self.run_number,
           self.files.calibration_dir,
           self.database.as_ref().map(|d| d.name()).unwrap_or(String::from("none")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use vts_dataclasses::TelescopeType;

  fn telescope() -> TelescopeDescription {
    TelescopeDescription::new(2, TelescopeType(5), 20, 24)
  }

  fn io_in(dir : &Path) -> CalibrationIO {
    let mut files = CalibrationFileSettings::new();
    files.calibration_dir = dir.display().to_string();
    CalibrationIO::new(files, 64100, false, 4, false)
  }

  fn write(path : &Path, text : &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
  }

  struct FixedDatabase;

  impl GainDatabase for FixedDatabase {
    fn name(&self) -> String {
      String::from("fixed")
    }

    fn query(&self, _tel_id : u32, run : u32, _product : CalibrationProduct, _gain_path : GainPath)
      -> Result<Option<Vec<(u16, f32, f32)>>, CalibrationError> {
      if run == 1 {
        return Ok(None);
      }
      Ok(Some(vec![(0, 0.8, 0.1), (3, 1.2, 0.2)]))
    }
  }

  #[test]
  fn pedestal_text_with_missing_windows() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("100.ped");
    write(&path, "# tel ch ped pedvars\n2 0 17.5 3.0 4.0\n2 1 18.0 3.5\n1 0 99.0 9.0\n");
    let set = read_pedestal_text(&path, 2, 3, 4).unwrap();
    assert_eq!(set.peds, vec![17.5, 18.0, 0.0]);
    assert_eq!(set.pedvars[0], vec![3.0, 4.0, 4.0, 4.0]);
    assert_eq!(set.pedvars[1], vec![3.5, 3.5, 3.5, 3.5]);
    assert!(read_pedestal_text(&path, 7, 3, 4).is_err());
  }

  #[test]
  fn parse_errors_name_the_line() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.ped");
    write(&path, "2 0 17.5 3.0\n2 1 x 3.0\n");
    match read_table(&path) {
      Err(CalibrationError::Parse {line, ..}) => assert_eq!(line, 2),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn combined_file_nearest_run() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("combined.txt");
    write(&path, "0 0 100 10.0 1.0\n0 0 104 11.0 1.1\n0 0 108 12.0 1.2\n0 1 104 13.0 1.3\n");
    let combined = CombinedPedestalFile::open(&path, 10).unwrap();
    assert_eq!(combined.runs(), vec![100, 104, 108]);
    assert_eq!(combined.nearest_run(105), Some(104));
    // ties go to the earlier run
    assert_eq!(combined.nearest_run(106), Some(104));
    assert_eq!(combined.nearest_run(1000), Some(108));
    let (run, set) = combined.pedestals(2, 103, 2, 2, &[]).unwrap();
    assert_eq!(run, 104);
    assert_eq!(set.peds, vec![11.0, 13.0]);
    assert_eq!(set.pedvars[1], vec![1.3, 1.3]);
  }

  #[test]
  fn combined_file_module_swap() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("combined.txt");
    write(&path, "0 1 100 10.0 1.0\n1 1 100 20.0 2.0\n");
    let combined = CombinedPedestalFile::open(&path, 10).unwrap();
    let swap = ModuleSwap {
      tel_id   : 2,
      run_min  : 90,
      run_max  : 110,
      module_a : 0,
      module_b : 1,
    };
    let (_, set) = combined.pedestals(2, 100, 12, 1, &[swap.clone()]).unwrap();
    assert_eq!(set.peds[1], 20.0);
    assert_eq!(set.peds[11], 10.0);
    // outside the run range nothing is swapped
    let (_, set) = combined.pedestals(2, 120, 12, 1, &[swap]).unwrap();
    assert_eq!(set.peds[1], 10.0);
  }

  #[test]
  fn pedestal_fallback_order() {
    let dir  = tempfile::tempdir().unwrap();
    let desc = telescope();
    let mut io = io_in(dir.path());
    io.files.ped_run = Some(64000);
    // nothing there
    let err = io.read_pedestals(&desc, GainPath::High).unwrap_err();
    assert!(err.is_fatal());
    // combined file present, the tree is not
    let combined = dir.path().join("combined_Tel2.txt");
    write(&combined, "0 0 64000 15.0 2.0 3.0\n");
    io.files.combined_ped_file = Some(dir.path().join("combined_Tel{tel}.txt").display().to_string());
    let loaded = io.read_pedestals(&desc, GainPath::High).unwrap();
    assert_eq!(loaded.source, PedestalSource::CombinedFile {path : combined, run : 64000});
    assert_eq!(loaded.pedestals.peds[0], 15.0);
    // the tree wins over everything
    let mut tree = PedestalTree::new(64000, TelescopeType(5));
    let mut set  = PedestalSet::new(2, 20, 4);
    set.peds[0]  = 16.0;
    tree.pedestals.push(set);
    let tree_path = io.files.pedestal_tree_path(5, 64000);
    write_pedestal_tree(&tree_path, &tree).unwrap();
    let loaded = io.read_pedestals(&desc, GainPath::High).unwrap();
    assert_eq!(loaded.source, PedestalSource::PedestalTree(tree_path));
    assert_eq!(loaded.pedestals.peds[0], 16.0);
    // no time slices, so no low gain pedestals from the tree
    tree.low_gain = true;
    write_pedestal_tree(&io.files.pedestal_tree_path(5, 64001), &tree).unwrap();
    io.files.lowgain_ped_run = Some(64001);
    io.files.combined_ped_file = None;
    assert!(io.read_pedestals(&desc, GainPath::Low).is_err());
    io.no_calibration_no_problem = true;
    let loaded = io.read_pedestals(&desc, GainPath::Low).unwrap();
    assert_eq!(loaded.source, PedestalSource::Defaults);
  }

  #[test]
  fn pedestals_from_simulation() {
    let dir      = tempfile::tempdir().unwrap();
    let mut desc = telescope();
    desc.sim_pedestals = vec![16.0;20];
    desc.sim_pedvars   = vec![2.0;20];
    let mut io = io_in(dir.path());
    io.is_simulation = true;
    let loaded = io.read_pedestals(&desc, GainPath::High).unwrap();
    assert_eq!(loaded.source, PedestalSource::Simulation);
    assert_eq!(loaded.pedestals.pedvar(3, 4), Some(4.0));
  }

  #[test]
  fn gains_from_text_and_defaults() {
    let dir  = tempfile::tempdir().unwrap();
    let desc = telescope();
    let mut io = io_in(dir.path());
    assert!(io.read_gains(&desc, GainPath::High, false, None).is_err());
    let (gains, source) = io.read_gains(&desc, GainPath::High, true, None).unwrap();
    assert_eq!(source, GainSource::Defaults);
    assert!(gains.is_default);
    assert_eq!(gains.gain, vec![1.0;20]);
    io.files.gain_run = Some(64050);
    write(&io.files.product_path(2, 64050, "gain"), "0 0.9 0.1\n1 1.1 0.2\n");
    let (gains, source) = io.read_gains(&desc, GainPath::High, false, None).unwrap();
    assert!(matches!(source, GainSource::TextFile(_)));
    assert_eq!(gains.gain[1], 1.1);
    assert_eq!(gains.gain[2], 0.0);
    // 18 zero gains
    let (gains, _) = io.read_gains(&desc, GainPath::High, false, Some(10)).unwrap();
    assert_eq!(gains.gain, vec![1.0;20]);
    let (toffs, source) = io.read_toffs(&desc, GainPath::Low, true).unwrap();
    assert_eq!(source, GainSource::Defaults);
    assert_eq!(toffs.toff, vec![0.0;20]);
  }

  #[test]
  fn gains_from_database_snapshot() {
    let dir  = tempfile::tempdir().unwrap();
    let desc = telescope();
    let mut io = io_in(dir.path());
    io.files.use_db   = true;
    io.files.gain_run = Some(64050);
    io.set_database(Box::new(FixedDatabase));
    let (gains, source) = io.read_gains(&desc, GainPath::High, false, None).unwrap();
    assert_eq!(source, GainSource::Database(String::from("fixed")));
    assert_eq!(gains.gain[3], 1.2);
    // snapshot removed
    let left : Vec<_> = fs::read_dir(io.files.telescope_dir(2)).unwrap().collect();
    assert!(left.is_empty());
    io.files.keep_db_snapshots = true;
    io.read_gains(&desc, GainPath::High, false, None).unwrap();
    let left : Vec<_> = fs::read_dir(io.files.telescope_dir(2)).unwrap().collect();
    assert_eq!(left.len(), 1);
    // unknown run in the database, no text file
    io.files.gain_run = Some(1);
    assert!(io.read_gains(&desc, GainPath::High, false, None).is_err());
  }

  #[test]
  fn pixel_status_and_multipliers() {
    let dir = tempfile::tempdir().unwrap();
    let status = dir.path().join("status.txt");
    write(&status, "1 5 0\n1 6 1\n2 7 2\n");
    let disabled = read_pixel_status(&status).unwrap();
    assert_eq!(disabled.get(&1), Some(&vec![6]));
    assert_eq!(disabled.get(&2), Some(&vec![7]));
    let mult = dir.path().join("lowgain.txt");
    write(&mult, "1 2 6 5.8\n1 2 12 5.6\n");
    let tables = read_lowgain_multipliers(&mult, 6.0).unwrap();
    let table  = tables.get(&1).unwrap();
    assert_eq!(table.low_gain_correction(2, 6, 12, true), 5.6);
    assert_eq!(table.low_gain_correction(1, 6, 12, true), 6.0);
  }

  #[test]
  fn extra_calibration_tree_lines() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("extra.jsonl");
    let record = ExtraCalibrationRecord {
      run     : 64100,
      event   : 3,
      tel_id  : 1,
      channel : 12,
      sum     : 55.5,
      ped     : 17.0,
      dead    : false,
      used    : true,
      tzero   : 6.5,
    };
    {
      let mut writer = ExtraCalibrationWriter::create(&path).unwrap();
      writer.add(&record).unwrap();
      writer.add(&record).unwrap();
      writer.flush().unwrap();
    }
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 2);
    let back : ExtraCalibrationRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(back, record);
  }
}
