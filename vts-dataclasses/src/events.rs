//! Telescope events
//!
//! One `TelescopeEvent` holds the readout of a single
//! camera for one array trigger. Channels carry either
//! the raw FADC trace or, for DST style data, only a
//! precomputed sum and arrival time.
//!

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::FADC_SATURATION;
use crate::errors::TraceError;
use crate::run::continuous_time;
use crate::serialization::{parse_bool,
                           parse_f32,
                           parse_f64,
                           parse_u8,
                           parse_u16,
                           parse_u32,
                           parse_vec_u16,
                           put_vec_u16,
                           Serialization,
                           SerializationError};

cfg_if::cfg_if! {
  if #[cfg(feature = "random")]  {
    use crate::FromRandom;
    use rand::Rng;
  }
}

/// Trigger type of an event
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
  Unknown  = 0u8,
  Physics  = 10u8,
  /// forced (random) trigger, no Cherenkov light
  Pedestal = 20u8,
  /// flasher/laser trigger
  Laser    = 30u8,
}

impl fmt::Display for EventType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let r = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this EventType"));
    write!(f, "<EventType: {}>", r)
  }
}

impl TryFrom<u8> for EventType {
  type Error = SerializationError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0u8  => Ok(EventType::Unknown),
      10u8 => Ok(EventType::Physics),
      20u8 => Ok(EventType::Pedestal),
      30u8 => Ok(EventType::Laser),
      _    => Err(SerializationError::UnknownEnumValue(value)),
    }
  }
}

#[cfg(feature = "random")]
impl FromRandom for EventType {
  fn from_random() -> Self {
    let choices = [EventType::Unknown,
                   EventType::Physics,
                   EventType::Pedestal,
                   EventType::Laser];
    let mut rng = rand::thread_rng();
    choices[rng.gen_range(0..choices.len())]
  }
}

/// Readout path of a dual gain channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GainPath {
  High,
  Low,
}

impl GainPath {
  pub fn is_low(&self) -> bool {
    matches!(self, GainPath::Low)
  }

  /// Select the path from the hi/lo flag of a channel
  pub fn from_low_gain_flag(low_gain : bool) -> Self {
    if low_gain { GainPath::Low } else { GainPath::High }
  }
}

impl fmt::Display for GainPath {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      GainPath::High => write!(f, "high gain"),
      GainPath::Low  => write!(f, "low gain"),
    }
  }
}

/// Readout of a single camera channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
  pub channel         : u16,
  /// Hit bit not set in a zero suppressed readout
  pub zero_suppressed : bool,
  /// Hi/lo flag as set by the readout electronics
  pub low_gain        : bool,
  /// Raw FADC samples. Empty for DST style data.
  pub samples         : Vec<u16>,
  /// Precomputed sum (DST style data only)
  pub sum             : f32,
  /// Precomputed arrival time in samples (DST style data only)
  pub tzero           : f32,
}

impl ChannelData {

  pub fn new(channel : u16) -> Self {
    Self {
      channel         : channel,
      zero_suppressed : false,
      low_gain        : false,
      samples         : Vec::<u16>::new(),
      sum             : 0.0,
      tzero           : 0.0,
    }
  }

  pub fn has_trace(&self) -> bool {
    !self.samples.is_empty()
  }

  /// Largest raw sample of the trace, 0 without trace
  pub fn max_sample(&self) -> u16 {
    self.samples.iter().copied().max().unwrap_or(0)
  }

  /// True if any sample reached the 8bit FADC limit
  pub fn is_saturated(&self) -> bool {
    self.max_sample() >= FADC_SATURATION
  }

  fn write_into(&self, stream : &mut Vec<u8>) {
    stream.extend_from_slice(&self.channel.to_le_bytes());
    stream.push(u8::from(self.zero_suppressed));
    stream.push(u8::from(self.low_gain));
    put_vec_u16(stream, &self.samples);
    stream.extend_from_slice(&self.sum.to_le_bytes());
    stream.extend_from_slice(&self.tzero.to_le_bytes());
  }

  fn read_from(stream : &[u8], pos : &mut usize) -> Result<Self, SerializationError> {
    let mut ch      = ChannelData::new(parse_u16(stream, pos)?);
    ch.zero_suppressed = parse_bool(stream, pos)?;
    ch.low_gain        = parse_bool(stream, pos)?;
    ch.samples         = parse_vec_u16(stream, pos)?;
    ch.sum             = parse_f32(stream, pos)?;
    ch.tzero           = parse_f32(stream, pos)?;
    Ok(ch)
  }
}

/// Readout of one camera for one trigger
#[derive(Debug, Clone, PartialEq)]
pub struct TelescopeEvent {
  pub tel_id       : u32,
  pub event_number : u32,
  pub event_type   : EventType,
  pub mjd          : u32,
  /// seconds of day
  pub time         : f64,
  pub n_samples    : u16,
  /// Channels, ordered by channel id
  pub channels     : Vec<ChannelData>,
}

impl TelescopeEvent {

  pub fn new() -> Self {
    Self {
      tel_id       : 0,
      event_number : 0,
      event_type   : EventType::Unknown,
      mjd          : 0,
      time         : 0.0,
      n_samples    : 0,
      channels     : Vec::<ChannelData>::new(),
    }
  }

  /// Event time in seconds, continuous over midnight
  pub fn run_time(&self) -> f64 {
    continuous_time(self.mjd, self.time)
  }

  pub fn get_nchan(&self) -> usize {
    self.channels.len()
  }

  /// Bounds checked channel lookup
  ///
  /// Channels are expected at the position of their
  /// id, if not (incomplete readout) the list is
  /// searched.
  pub fn get_channel(&self, channel : usize) -> Result<&ChannelData, TraceError> {
    match self.channels.get(channel) {
      Some(ch) if ch.channel as usize == channel => Ok(ch),
      _ => {
        self.channels.iter()
          .find(|ch| ch.channel as usize == channel)
          .ok_or(TraceError::ChannelOutOfRange {
            channel    : channel,
            n_channels : self.channels.len()
          })
      }
    }
  }

  /// Number of channels with a trace at the
  /// FADC saturation value
  pub fn n_saturated(&self) -> usize {
    self.channels.iter().filter(|ch| ch.is_saturated()).count()
  }

  /// Number of channels readout through the low gain path
  pub fn n_low_gain(&self) -> usize {
    self.channels.iter().filter(|ch| ch.low_gain).count()
  }

  /// DST style data carries no traces at all
  pub fn has_traces(&self) -> bool {
    self.channels.iter().any(|ch| ch.has_trace())
  }
}

impl Default for TelescopeEvent {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TelescopeEvent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<TelescopeEvent:
  tel id     : {}
  event      : {}
  type       : {}
  MJD / time : {} / {:.4}
  n samples  : {}
  n channels : {} ({} low gain, {} saturated)>",
      self.tel_id,
      self.event_number,
      self.event_type,
      self.mjd,
      self.time,
      self.n_samples,
      self.channels.len(),
      self.n_low_gain(),
      self.n_saturated())
  }
}

impl Serialization for TelescopeEvent {
  const HEAD : u16 = 0xAAAA;
  const TAIL : u16 = 0x5555;

  fn from_bytestream(stream : &[u8], pos : &mut usize)
    -> Result<Self, SerializationError> {
    Self::verify_head(stream, pos)?;
    let mut event      = TelescopeEvent::new();
    event.tel_id       = parse_u32(stream, pos)?;
    event.event_number = parse_u32(stream, pos)?;
    event.event_type   = EventType::try_from(parse_u8(stream, pos)?)?;
    event.mjd          = parse_u32(stream, pos)?;
    event.time         = parse_f64(stream, pos)?;
    event.n_samples    = parse_u16(stream, pos)?;
    let n_chan         = parse_u32(stream, pos)?;
    for _ in 0..n_chan {
      event.channels.push(ChannelData::read_from(stream, pos)?);
    }
    Self::verify_tail(stream, pos)?;
    Ok(event)
  }

  fn to_bytestream(&self) -> Vec<u8> {
    let mut stream = Vec::<u8>::new();
    stream.extend_from_slice(&Self::HEAD.to_le_bytes());
    stream.extend_from_slice(&self.tel_id.to_le_bytes());
    stream.extend_from_slice(&self.event_number.to_le_bytes());
    stream.push(self.event_type as u8);
    stream.extend_from_slice(&self.mjd.to_le_bytes());
    stream.extend_from_slice(&self.time.to_le_bytes());
    stream.extend_from_slice(&self.n_samples.to_le_bytes());
    stream.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
    for ch in &self.channels {
      ch.write_into(&mut stream);
    }
    stream.extend_from_slice(&Self::TAIL.to_le_bytes());
    stream
  }
}

#[cfg(feature = "random")]
impl FromRandom for TelescopeEvent {
  fn from_random() -> Self {
    let mut rng       = rand::thread_rng();
    let mut event     = TelescopeEvent::new();
    event.tel_id       = rng.gen_range(0..4);
    event.event_number = rng.gen();
    event.event_type   = EventType::from_random();
    event.mjd          = rng.gen_range(55000..60000);
    event.time         = rng.gen_range(0.0..86400.0);
    event.n_samples    = rng.gen_range(16..64);
    let n_chan         = rng.gen_range(1..50u16);
    let dst            = rng.gen::<bool>();
    for k in 0..n_chan {
      let mut ch = ChannelData::new(k);
      ch.zero_suppressed = rng.gen_bool(0.1);
      ch.low_gain        = rng.gen_bool(0.05);
      if dst {
        ch.sum   = rng.gen_range(-10.0..500.0);
        ch.tzero = rng.gen_range(0.0..event.n_samples as f32);
      } else {
        ch.samples = (0..event.n_samples).map(|_| rng.gen_range(10..256)).collect();
      }
      event.channels.push(ch);
    }
    event
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channel_lookup_incomplete_readout() {
    let mut event = TelescopeEvent::new();
    for k in [0u16, 1, 5, 7] {
      event.channels.push(ChannelData::new(k));
    }
    assert_eq!(event.get_channel(1).map(|ch| ch.channel), Ok(1));
    assert_eq!(event.get_channel(5).map(|ch| ch.channel), Ok(5));
    assert_eq!(event.get_channel(6),
               Err(TraceError::ChannelOutOfRange {channel : 6, n_channels : 4}));
    assert!(event.get_channel(100).is_err());
  }

  #[test]
  fn saturation_and_low_gain_counts() {
    let mut event = TelescopeEvent::new();
    for k in 0..20u16 {
      let mut ch = ChannelData::new(k);
      ch.samples = vec![20, 30, 40];
      if k < 3 {
        ch.samples[1] = FADC_SATURATION;
      }
      ch.low_gain = k % 5 == 0;
      event.channels.push(ch);
    }
    assert_eq!(event.n_saturated(), 3);
    assert_eq!(event.n_low_gain(), 4);
    assert!(event.has_traces());
  }

  #[test]
  fn event_type_codes() {
    assert_eq!(EventType::try_from(20u8), Ok(EventType::Pedestal));
    assert_eq!(EventType::try_from(21u8), Err(SerializationError::UnknownEnumValue(21)));
  }
}
