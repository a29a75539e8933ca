//! Run one calibration pass over a telescope event file
//!
//! The run mode decides what is produced: pedestals,
//! gains/toffs, average pulse arrival times or (in data
//! analysis mode) calibrated channels.
//!

#[macro_use] extern crate log;

use std::path::PathBuf;
use std::process::exit;

use clap::{arg,
           command,
           Parser};
use indicatif::{ProgressBar,
                ProgressStyle};

use vts_dataclasses::io::{EventFileReader,
                          EventSource};
use vts_calib::{init_env_logger,
                Calibrator,
                CalibrationSettings,
                RunMode};

#[derive(Parser, Debug)]
#[command(author = "VTS calibration", version, about, long_about = None)]
struct Args {
  /// Calibration settings (.toml)
  #[arg(short, long)]
  config: Option<String>,
  /// Event file to calibrate
  #[arg(short, long, default_value_t = String::from(""))]
  input: String,
  /// Override the run mode of the settings. Either the
  /// numeric code (0,1,2,5,6,7,8) or the name
  #[arg(short, long)]
  mode: Option<RunMode>,
  /// Restrict the number of events we are running over
  #[arg(short, long, default_value_t = 0)]
  nevents: u64,
  /// Write the default settings to this file and exit
  #[arg(long)]
  write_default_config: Option<String>,
  /// Don't show a progress bar
  #[arg(long, default_value_t = false)]
  no_progress: bool,
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  if let Some(fname) = args.write_default_config {
    let settings = CalibrationSettings::new();
    if let Err(err) = settings.to_toml(fname.clone()) {
      error!("Unable to write default settings to {}! {}", fname, err);
      exit(1);
    }
    println!("=> Wrote default settings to {}", fname);
    exit(0);
  }

  let mut settings = match &args.config {
    None        => CalibrationSettings::new(),
    Some(fname) => match CalibrationSettings::from_toml(fname) {
      Ok(s)    => s,
      Err(err) => {
        error!("CRITICAL! Unable to parse .toml settings file {}! {}", fname, err);
        exit(1);
      }
    }
  };
  if let Some(mode) = args.mode {
    settings.run_mode = mode;
  }
  info!("Using settings {}", settings);

  if args.input.is_empty() {
    error!("No input file given!");
    exit(1);
  }
  let mut reader = match EventFileReader::open(PathBuf::from(&args.input)) {
    Ok(r)    => r,
    Err(err) => {
      error!("Unable to open {}! {}", args.input, err);
      exit(1);
    }
  };
  let header = reader.run_header().clone();
  let mut calibrator = match Calibrator::new(settings, header) {
    Ok(c)    => c,
    Err(err) => {
      error!("Unable to set up the calibration! {}", err);
      exit(1);
    }
  };
  if let Err(err) = calibrator.initialize() {
    error!("Initialization failed! {}", err);
    exit(1);
  }

  let bar_template : &str = "[{elapsed_precise}] {prefix} {msg} {spinner} {bar:60.blue/grey} {pos:>7}/{len:7}";
  let bar = if args.no_progress {
    ProgressBar::hidden()
  } else if args.nevents > 0 {
    ProgressBar::new(args.nevents)
  } else {
    ProgressBar::new_spinner()
  };
  if let Ok(style) = ProgressStyle::with_template(bar_template) {
    bar.set_style(style);
  }
  bar.set_prefix(format!("run {}", calibrator.header.run_number));
  bar.set_message(format!("{}", calibrator.run_mode()));

  let mut n_events   = 0u64;
  let mut n_channels = 0usize;
  loop {
    let event = match reader.next_event() {
      Ok(Some(ev)) => ev,
      Ok(None)     => break,
      Err(err)     => {
        error!("Unable to read from {}! {}", args.input, err);
        break;
      }
    };
    match calibrator.process_event(&event) {
      Ok(channels) => n_channels += channels.len(),
      Err(err) if err.is_fatal() => {
        bar.abandon();
        error!("Stopping the run! {}", err);
        exit(1);
      }
      Err(err) => warn!("Event {} telescope {}: {}", event.event_number, event.tel_id, err),
    }
    n_events += 1;
    bar.inc(1);
    if args.nevents > 0 && n_events >= args.nevents {
      break;
    }
  }
  bar.finish();

  match calibrator.terminate() {
    Ok(files) => {
      println!("=> {}", calibrator);
      if reader.n_errors > 0 {
        println!("=> Skipped {} corrupt records", reader.n_errors);
      }
      if n_channels > 0 {
        println!("=> Calibrated {} channel signals", n_channels);
      }
      for f in files {
        println!("=> Wrote {}", f.display());
      }
    }
    Err(err) => {
      error!("Unable to write the calibration! {}", err);
      exit(1);
    }
  }
}
