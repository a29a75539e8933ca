use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand::distributions::Distribution;
use statrs::distribution::Normal;

use vts_dataclasses::{ChannelData,
                      EventType,
                      GainPath,
                      RunHeader,
                      TelescopeDescription,
                      TelescopeEvent,
                      TelescopeType};
use vts_calib::calibration_io::{read_pedestal_text,
                                read_pedestal_tree};
use vts_calib::{CalibrationSettings,
                Calibrator,
                DeadReason,
                RunMode};

const N_CHANNELS : u16 = 500;
const N_SAMPLES  : u16 = 32;
const MJD        : u32 = 58000;
const T_START    : f64 = 3600.0;

fn header(run : u32, tel_ids : &[u32], span : f64) -> RunHeader {
  let mut header = RunHeader::new();
  header.run_number = run;
  header.mjd_start  = MJD;
  header.time_start = T_START;
  header.mjd_end    = MJD;
  header.time_end   = T_START + span;
  for tel_id in tel_ids {
    header.telescopes.push(TelescopeDescription::new(*tel_id, TelescopeType(1), N_CHANNELS, N_SAMPLES));
  }
  header
}

fn settings(mode : RunMode, dir : &Path) -> CalibrationSettings {
  let mut settings = CalibrationSettings::new();
  settings.run_mode              = mode;
  settings.files.calibration_dir = dir.to_string_lossy().to_string();
  settings
}

fn event(tel_id : u32, number : u32, event_type : EventType, t : f64, traces : Vec<Vec<u16>>) -> TelescopeEvent {
  let mut event = TelescopeEvent::new();
  event.tel_id       = tel_id;
  event.event_number = number;
  event.event_type   = event_type;
  event.mjd          = MJD;
  event.time         = T_START + t;
  event.n_samples    = N_SAMPLES;
  for (k, samples) in traces.into_iter().enumerate() {
    let mut ch = ChannelData::new(k as u16);
    ch.samples = samples;
    event.channels.push(ch);
  }
  event
}

fn noise_traces(rng : &mut StdRng, noise : &Normal) -> Vec<Vec<u16>> {
  (0..N_CHANNELS).map(|_| {
    (0..N_SAMPLES).map(|_| noise.sample(rng).round().clamp(0.0, 255.0) as u16).collect()
  }).collect()
}

fn flat_traces(value : u16) -> Vec<Vec<u16>> {
  vec![vec![value;N_SAMPLES as usize];N_CHANNELS as usize]
}

/// Laser pulse at samples 3..7, optionally saturated
fn laser_traces(n_saturated : usize) -> Vec<Vec<u16>> {
  let mut traces = flat_traces(20);
  for (ch, trace) in traces.iter_mut().enumerate() {
    for s in 3..7 {
      trace[s] = 200;
    }
    if ch < n_saturated {
      trace[4] = 255;
    }
  }
  traces
}

#[test]
fn pedestal_run_end_to_end() {
  let dir       = tempfile::tempdir().unwrap();
  let tels      = [1u32, 2];
  let n_events  = 1000u32;
  let mut calib = Calibrator::new(settings(RunMode::PedestalHighGain, dir.path()),
                                  header(64080, &tels, n_events as f64)).unwrap();
  calib.initialize().unwrap();
  let mut rng = StdRng::seed_from_u64(64080);
  let noise   = Normal::new(20.0, 3.0).unwrap();
  for k in 0..n_events {
    for tel_id in tels {
      let ev = event(tel_id, k, EventType::Pedestal, k as f64, noise_traces(&mut rng, &noise));
      assert!(calib.process_event(&ev).unwrap().is_empty());
    }
  }
  let written = calib.terminate().unwrap();
  for f in &written {
    assert!(f.exists(), "{} missing", f.display());
  }
  // rounding adds 1/12 to the variance of a sample
  let sigma = (9.0f64 + 1.0/12.0).sqrt();
  for tel_id in tels {
    let path = calib.settings.files.product_path(tel_id, 64080, "ped");
    let peds = read_pedestal_text(&path, tel_id, N_CHANNELS as usize, 24).unwrap();
    for ch in 0..N_CHANNELS as usize {
      assert!((peds.peds[ch] - 20.0).abs() < 3.0/(n_events as f32).sqrt(),
              "channel {} ped {}", ch, peds.peds[ch]);
    }
    for w in [1usize, 6, 12, 24] {
      let expected = sigma * (w as f64).sqrt();
      let mean : f64 = (0..N_CHANNELS as usize)
        .map(|ch| peds.pedvar(ch, w).unwrap() as f64)
        .sum::<f64>() / N_CHANNELS as f64;
      assert!((mean - expected).abs() / expected < 0.03,
              "window {}: mean pedvar {} expected {}", w, mean, expected);
    }
  }
  let tree_path = calib.settings.files.pedestal_tree_path(1, 64080);
  let (set, slices) = read_pedestal_tree(&tree_path, 2, false).unwrap().unwrap();
  assert_eq!(set.n_channels(), N_CHANNELS as usize);
  assert_eq!(set.entries[0], n_events as u64);
  assert!(slices.is_some());
  // one curve for the analysis window of the (single) telescope type
  assert_eq!(calib.ipr_curves.len(), 1);
  assert!(!calib.ipr_curves[0].points.is_empty());
}

#[test]
fn data_run_uses_pedestal_run() {
  let dir  = tempfile::tempdir().unwrap();
  let tels = [3u32];
  let mut peds = Calibrator::new(settings(RunMode::PedestalHighGain, dir.path()),
                                 header(100, &tels, 200.0)).unwrap();
  peds.initialize().unwrap();
  let mut rng = StdRng::seed_from_u64(100);
  let noise   = Normal::new(20.0, 3.0).unwrap();
  for k in 0..200u32 {
    peds.process_event(&event(3, k, EventType::Pedestal, k as f64, noise_traces(&mut rng, &noise))).unwrap();
  }
  peds.terminate().unwrap();

  let mut s = settings(RunMode::DataAnalysis, dir.path());
  s.files.ped_run              = Some(100);
  // no gains for this run
  s.no_calibration_no_problem  = true;
  let mut data = Calibrator::new(s, header(101, &tels, 10.0)).unwrap();
  data.initialize().unwrap();
  let ctx = data.telescope(3).unwrap();
  assert!((ctx.ped(0, GainPath::High) - 20.0).abs() < 0.2);
  let channels = data.process_event(&event(3, 1, EventType::Physics, 1.0, flat_traces(20))).unwrap();
  assert_eq!(channels.len(), N_CHANNELS as usize);
  for c in &channels {
    assert!(c.sum.abs() < 2.0, "{}", c);
    assert_eq!(c.status, DeadReason::Alive);
  }
}

#[test]
fn missing_pedestals_are_fatal() {
  let dir = tempfile::tempdir().unwrap();
  let mut calib = Calibrator::new(settings(RunMode::DataAnalysis, dir.path()),
                                  header(7, &[1], 10.0)).unwrap();
  let err = calib.initialize().unwrap_err();
  assert!(err.is_fatal());

  let mut s = settings(RunMode::DataAnalysis, dir.path());
  s.no_calibration_no_problem = true;
  let mut calib = Calibrator::new(s, header(7, &[1], 10.0)).unwrap();
  calib.initialize().unwrap();
  let channels = calib.process_event(&event(1, 1, EventType::Physics, 1.0, flat_traces(20))).unwrap();
  // pedestal 0, gain 1: the raw sum of 6 samples
  assert!(channels.iter().all(|c| c.sum == 120.0 && c.charge == 120.0));
  // pedestal events only feed the time slices
  let channels = calib.process_event(&event(1, 2, EventType::Pedestal, 2.0, flat_traces(20))).unwrap();
  assert!(channels.is_empty());
}

#[test]
fn saturated_flasher_events_are_vetoed() {
  let dir = tempfile::tempdir().unwrap();
  let mut s = settings(RunMode::GainToffHighGain, dir.path());
  s.no_calibration_no_problem = true;
  let mut calib = Calibrator::new(s, header(200, &[1], 10.0)).unwrap();
  calib.initialize().unwrap();
  calib.process_event(&event(1, 1, EventType::Laser, 1.0, laser_traces(11))).unwrap();
  {
    let ctx = calib.telescope(1).unwrap();
    assert_eq!(ctx.n_vetoed, 1);
    assert_eq!(ctx.gain_acc.as_ref().unwrap().n_events, 0);
  }
  calib.process_event(&event(1, 2, EventType::Laser, 2.0, laser_traces(10))).unwrap();
  // no laser light in physics events
  calib.process_event(&event(1, 3, EventType::Physics, 3.0, laser_traces(0))).unwrap();
  let ctx = calib.telescope(1).unwrap();
  assert_eq!(ctx.n_vetoed, 1);
  assert_eq!(ctx.gain_acc.as_ref().unwrap().n_events, 1);

  let written = calib.terminate().unwrap();
  let gain_file = calib.settings.files.product_path(1, 200, "gain");
  assert!(written.contains(&gain_file));
  assert!(gain_file.exists());
}

#[test]
fn low_gain_pedestals_only_use_low_gain_channels() {
  let dir = tempfile::tempdir().unwrap();
  let mut calib = Calibrator::new(settings(RunMode::PedestalLowGain, dir.path()),
                                  header(300, &[1], 10.0)).unwrap();
  calib.initialize().unwrap();
  for k in 0..10u32 {
    let mut ev = event(1, k, EventType::Pedestal, k as f64, flat_traces(20));
    for ch in ev.channels.iter_mut().filter(|c| c.channel % 2 == 1) {
      ch.low_gain = true;
    }
    calib.process_event(&ev).unwrap();
  }
  let peds = calib.pedestal_accumulator().unwrap();
  for ch in 0..N_CHANNELS as usize {
    let (mean, _, entries) = peds.finalize(TelescopeType(1), 1, ch, 6).unwrap();
    if ch % 2 == 1 {
      assert_eq!(entries, 10);
      assert_eq!(mean, 120.0);
    } else {
      assert_eq!(entries, 0);
    }
  }
  let written = calib.terminate().unwrap();
  assert!(written.contains(&calib.settings.files.product_path(1, 300, "lped")));
}

#[test]
fn pedestal_time_slices() {
  let dir = tempfile::tempdir().unwrap();
  let mut s = settings(RunMode::PedestalHighGain, dir.path());
  s.pedestal.timeslice_sec = 180.0;
  s.ipr.enabled            = false;
  let mut calib = Calibrator::new(s, header(400, &[1], 900.0)).unwrap();
  calib.initialize().unwrap();
  for k in 0..=450u32 {
    let t = 2.0 * k as f64;
    calib.process_event(&event(1, k, EventType::Pedestal, t, flat_traces(20))).unwrap();
  }
  calib.terminate().unwrap();
  let builder = calib.telescope(1).unwrap().time_slices.as_ref().unwrap();
  assert_eq!(builder.slice_length, 180.0);
  let slices = &builder.slices.slices;
  assert_eq!(slices.len(), 5);
  assert_eq!(slices[0].n_events, 91);
  assert_eq!(slices.iter().map(|s| s.n_events).sum::<u32>(), 451);
  assert_eq!(slices[0].peds[0], 20.0);

  let tree_path = calib.settings.files.pedestal_tree_path(1, 400);
  let (_, ts) = read_pedestal_tree(&tree_path, 1, false).unwrap().unwrap();
  assert_eq!(ts.unwrap().slices.len(), 5);
}

#[test]
fn run_mode_from_settings_file() {
  let dir  = tempfile::tempdir().unwrap();
  let path = dir.path().join("calib.toml");
  let mut s = CalibrationSettings::new();
  s.run_mode = RunMode::TZeroLowGain;
  s.to_toml(path.to_string_lossy().to_string()).unwrap();
  let back = CalibrationSettings::from_toml(&path.to_string_lossy()).unwrap();
  assert_eq!(back.run_mode, RunMode::TZeroLowGain);
  assert_eq!(back.run_mode.gain_path(), GainPath::Low);
}

fn header_with(run : u32, tels : &[(u32, u16)], span : f64) -> RunHeader {
  let mut header = header(run, &[], span);
  for (tel_id, n_samples) in tels {
    header.telescopes.push(TelescopeDescription::new(*tel_id, TelescopeType(1), N_CHANNELS, *n_samples));
  }
  header
}

#[test]
fn pedestals_from_short_and_sum_only_channels() {
  let dir = tempfile::tempdir().unwrap();
  let mut s = settings(RunMode::PedestalHighGain, dir.path());
  s.ipr.enabled = false;
  // 32 samples, 16 samples and DST style sums only
  let mut calib = Calibrator::new(s, header_with(500, &[(1, 32), (2, 16), (3, 0)], 200.0)).unwrap();
  calib.initialize().unwrap();
  for k in 0..200u32 {
    calib.process_event(&event(1, k, EventType::Pedestal, k as f64, flat_traces(20))).unwrap();
    let mut short = event(2, k, EventType::Pedestal, k as f64,
                          vec![vec![20u16;16];N_CHANNELS as usize]);
    short.n_samples = 16;
    calib.process_event(&short).unwrap();
    let mut dst = event(3, k, EventType::Pedestal, k as f64, vec![Vec::<u16>::new();N_CHANNELS as usize]);
    dst.n_samples = 0;
    for ch in dst.channels.iter_mut() {
      ch.sum = 120.0;
    }
    calib.process_event(&dst).unwrap();
  }
  {
    let acc = calib.pedestal_accumulator().unwrap();
    for tel_id in [1u32, 2, 3] {
      let set = acc.pedestal_set(TelescopeType(1), tel_id).unwrap();
      for ch in 0..N_CHANNELS as usize {
        assert_eq!(set.peds[ch], 20.0, "telescope {} channel {}", tel_id, ch);
        assert_eq!(set.entries[ch], 200);
      }
    }
    // nothing beyond the trace length
    assert_eq!(acc.finalize(TelescopeType(1), 2, 0, 17).unwrap().2, 0);
    assert_eq!(acc.finalize(TelescopeType(1), 2, 0, 16).unwrap().2, 200);
  }
  calib.terminate().unwrap();
  for tel_id in [2u32, 3] {
    let path = calib.settings.files.product_path(tel_id, 500, "ped");
    let peds = read_pedestal_text(&path, tel_id, N_CHANNELS as usize, 24).unwrap();
    assert!(peds.peds.iter().all(|p| *p == 20.0), "telescope {}", tel_id);
  }
}

#[test]
fn gain_paths_split_pedestal_channels() {
  let dir = tempfile::tempdir().unwrap();
  let mut ev = event(1, 0, EventType::Pedestal, 0.0, flat_traces(20));
  for ch in ev.channels.iter_mut().filter(|c| c.channel % 3 == 0) {
    ch.low_gain = true;
  }
  let mut entries = Vec::<Vec<u64>>::new();
  for mode in [RunMode::PedestalHighGain, RunMode::PedestalLowGain] {
    let mut s = settings(mode, dir.path());
    s.ipr.enabled = false;
    let mut calib = Calibrator::new(s, header(600, &[1], 10.0)).unwrap();
    calib.initialize().unwrap();
    calib.process_event(&ev).unwrap();
    let acc = calib.pedestal_accumulator().unwrap();
    entries.push((0..N_CHANNELS as usize)
      .map(|ch| acc.finalize(TelescopeType(1), 1, ch, 6).unwrap().2)
      .collect());
  }
  for ch in 0..N_CHANNELS as usize {
    assert_eq!(entries[0][ch] + entries[1][ch], 1, "channel {}", ch);
    assert_eq!(entries[1][ch] == 1, ch % 3 == 0, "channel {}", ch);
  }
}

/// Pedestal run with gaussian noise, written to `dir`
fn noise_pedestal_run(dir : &Path, run : u32, tel_id : u32) {
  let mut s = settings(RunMode::PedestalHighGain, dir);
  s.ipr.enabled = false;
  let mut calib = Calibrator::new(s, header(run, &[tel_id], 300.0)).unwrap();
  calib.initialize().unwrap();
  let mut rng = StdRng::seed_from_u64(run as u64);
  let noise   = Normal::new(20.0, 3.0).unwrap();
  for k in 0..300u32 {
    calib.process_event(&event(tel_id, k, EventType::Pedestal, k as f64, noise_traces(&mut rng, &noise))).unwrap();
  }
  calib.terminate().unwrap();
}

/// Traces jumping between 20 and 100 from event to event
fn jumping_traces(k : u32) -> Vec<Vec<u16>> {
  flat_traces(if k % 2 == 0 { 20 } else { 100 })
}

#[test]
fn data_run_time_slice_updates_channel_states() {
  let dir = tempfile::tempdir().unwrap();
  noise_pedestal_run(dir.path(), 700, 1);

  let mut s = settings(RunMode::DataAnalysis, dir.path());
  s.files.ped_run             = Some(700);
  s.no_calibration_no_problem = true;
  s.pedestal.timeslice_sec    = 100.0;
  let mut calib = Calibrator::new(s, header(701, &[1], 400.0)).unwrap();
  calib.initialize().unwrap();
  assert!(!calib.telescope(1).unwrap().states.is_dead(7, GainPath::High));

  let mut rng = StdRng::seed_from_u64(701);
  let noise   = Normal::new(20.0, 3.0).unwrap();
  // first slice: channel 7 is far too noisy
  for k in 0..=50u32 {
    let mut traces = noise_traces(&mut rng, &noise);
    traces[7] = jumping_traces(k).swap_remove(7);
    let out = calib.process_event(&event(1, k, EventType::Pedestal, 2.0 * k as f64, traces)).unwrap();
    assert!(out.is_empty());
  }
  assert!(!calib.telescope(1).unwrap().states.is_dead(7, GainPath::High));
  // past the slice end, the slice closes
  calib.process_event(&event(1, 51, EventType::Pedestal, 102.0,
                             noise_traces(&mut rng, &noise))).unwrap();
  let ctx = calib.telescope(1).unwrap();
  assert_eq!(ctx.time_slices.as_ref().unwrap().slices.slices.len(), 1);
  assert_eq!(ctx.states.states(GainPath::High)[7], DeadReason::AbsolutePedvarOutOfRange);
  assert!(!ctx.states.is_dead(8, GainPath::High));

  let channels = calib.process_event(&event(1, 52, EventType::Physics, 103.0, flat_traces(20))).unwrap();
  assert!(channels[7].is_dead());
  assert!(!channels[8].is_dead());
}

#[test]
fn data_run_slice_without_live_channels_is_fatal() {
  let dir = tempfile::tempdir().unwrap();
  noise_pedestal_run(dir.path(), 800, 2);

  let mut s = settings(RunMode::DataAnalysis, dir.path());
  s.files.ped_run             = Some(800);
  s.no_calibration_no_problem = true;
  s.pedestal.timeslice_sec    = 100.0;
  let mut calib = Calibrator::new(s, header(801, &[2], 400.0)).unwrap();
  calib.initialize().unwrap();
  for k in 0..=50u32 {
    calib.process_event(&event(2, k, EventType::Pedestal, 2.0 * k as f64, jumping_traces(k))).unwrap();
  }
  let err = calib.process_event(&event(2, 51, EventType::Pedestal, 102.0, flat_traces(20))).unwrap_err();
  assert!(err.is_fatal());
}
