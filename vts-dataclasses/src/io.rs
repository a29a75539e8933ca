//! Input/Output
//!
//! * Read files into memory
//! * Event files: one `RunHeader` record followed
//!   by any number of `TelescopeEvent` records
//!

use std::fmt;
use std::fs::{self,
              File};
use std::io::{self,
              BufRead,
              BufReader,
              BufWriter,
              Read,
              Write};
use std::path::{Path,
                PathBuf};

use crate::errors::CalibrationError;
use crate::events::TelescopeEvent;
use crate::run::RunHeader;
use crate::serialization::{search_for_u16,
                           Serialization};

/// Represents the contents of a file
/// as a byte vector
///
/// # Arguments:
///
/// * filename : full path to the file to be read
pub fn read_file(filename: &Path) -> io::Result<Vec<u8>> {
  debug!("Reading file {}", filename.display());
  let mut f = File::open(filename)?;
  let metadata = fs::metadata(filename)?;
  let mut buffer = vec![0; metadata.len() as usize];
  f.read_exact(&mut buffer)?;
  debug!("Read {} bytes from {}", buffer.len(), filename.display());
  Ok(buffer)
}

/// Iterate over the lines of a text file
pub fn read_lines<P>(filename: P) -> io::Result<io::Lines<BufReader<File>>>
where P: AsRef<Path>, {
  let file = File::open(filename)?;
  Ok(BufReader::new(file).lines())
}

/// Anything delivering the run header and then
/// the telescope events of a run in time order
pub trait EventSource {

  fn run_header(&self) -> &RunHeader;

  /// The next event, `Ok(None)` at the end of the run
  fn next_event(&mut self) -> Result<Option<TelescopeEvent>, CalibrationError>;
}

/// Read events from a file written by `EventFileWriter`
///
/// The file is read into memory at once, events are
/// decoded on demand.
pub struct EventFileReader {
  pub filename  : PathBuf,
  header        : RunHeader,
  stream        : Vec<u8>,
  pos           : usize,
  pub n_events  : usize,
  /// corrupt records which were skipped
  pub n_errors  : usize,
}

impl EventFileReader {

  pub fn open<P: AsRef<Path>>(filename : P) -> Result<Self, CalibrationError> {
    let filename = filename.as_ref().to_path_buf();
    let stream   = read_file(&filename)
      .map_err(|e| CalibrationError::io(&filename, e))?;
    let mut pos  = 0usize;
    let header   = RunHeader::from_bytestream(&stream, &mut pos)
      .map_err(|e| CalibrationError::Serialization {
        path   : filename.clone(),
        source : e
      })?;
    info!("Opened {} for run {} with {} telescopes",
          filename.display(), header.run_number, header.telescopes.len());
    Ok(Self {
      filename : filename,
      header   : header,
      stream   : stream,
      pos      : pos,
      n_events : 0,
      n_errors : 0,
    })
  }

  pub fn is_exhausted(&self) -> bool {
    self.pos >= self.stream.len()
  }
}

impl fmt::Debug for EventFileReader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "<EventFileReader: {} at byte {}/{}, {} events read>",
           self.filename.display(), self.pos, self.stream.len(), self.n_events)
  }
}

impl EventSource for EventFileReader {

  fn run_header(&self) -> &RunHeader {
    &self.header
  }

  fn next_event(&mut self) -> Result<Option<TelescopeEvent>, CalibrationError> {
    while !self.is_exhausted() {
      let start = self.pos;
      match TelescopeEvent::from_bytestream(&self.stream, &mut self.pos) {
        Ok(event) => {
          self.n_events += 1;
          return Ok(Some(event));
        }
        Err(err) => {
          self.n_errors += 1;
          warn!("Corrupt event record at byte {} in {}! {}", start, self.filename.display(), err);
          // resync at the next head signature
          match search_for_u16(TelescopeEvent::HEAD, &self.stream, start + 1) {
            Ok(next) => self.pos = next,
            Err(_)   => self.pos = self.stream.len(),
          }
        }
      }
    }
    Ok(None)
  }
}

impl Iterator for EventFileReader {
  type Item = TelescopeEvent;

  fn next(&mut self) -> Option<Self::Item> {
    match self.next_event() {
      Ok(ev) => ev,
      Err(err) => {
        error!("Unable to read event from {}! {}", self.filename.display(), err);
        None
      }
    }
  }
}

/// Events kept in memory, e.g. from a simulation
#[derive(Debug, Clone)]
pub struct MemoryEventSource {
  header     : RunHeader,
  events     : Vec<TelescopeEvent>,
  next_index : usize,
}

impl MemoryEventSource {
  pub fn new(header : RunHeader, events : Vec<TelescopeEvent>) -> Self {
    Self {
      header     : header,
      events     : events,
      next_index : 0,
    }
  }
}

impl EventSource for MemoryEventSource {

  fn run_header(&self) -> &RunHeader {
    &self.header
  }

  fn next_event(&mut self) -> Result<Option<TelescopeEvent>, CalibrationError> {
    let ev = self.events.get(self.next_index).cloned();
    self.next_index += 1;
    Ok(ev)
  }
}

/// Write a run header and events to disk
pub struct EventFileWriter {
  pub filename : PathBuf,
  writer       : BufWriter<File>,
  pub n_events : usize,
}

impl EventFileWriter {

  pub fn create<P: AsRef<Path>>(filename : P, header : &RunHeader) -> Result<Self, CalibrationError> {
    let filename   = filename.as_ref().to_path_buf();
    let file       = File::create(&filename)
      .map_err(|e| CalibrationError::io(&filename, e))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.to_bytestream())
      .map_err(|e| CalibrationError::io(&filename, e))?;
    Ok(Self {
      filename : filename,
      writer   : writer,
      n_events : 0,
    })
  }

  pub fn add_event(&mut self, event : &TelescopeEvent) -> Result<(), CalibrationError> {
    self.writer.write_all(&event.to_bytestream())
      .map_err(|e| CalibrationError::io(&self.filename, e))?;
    self.n_events += 1;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), CalibrationError> {
    self.writer.flush()
      .map_err(|e| CalibrationError::io(&self.filename, e))
  }
}

impl Drop for EventFileWriter {
  fn drop(&mut self) {
    if let Err(err) = self.writer.flush() {
      error!("Unable to flush {}! {}", self.filename.display(), err);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::{ChannelData, EventType};
  use crate::run::{TelescopeDescription, TelescopeType};

  fn header() -> RunHeader {
    let mut header = RunHeader::new();
    header.run_number = 64080;
    header.telescopes.push(TelescopeDescription::new(1, TelescopeType(5), 4, 8));
    header
  }

  #[test]
  fn write_and_read_event_file() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.vev");
    {
      let mut writer = EventFileWriter::create(&path, &header()).unwrap();
      for k in 0..5 {
        let mut ev = TelescopeEvent::new();
        ev.tel_id       = 1;
        ev.event_number = k;
        ev.event_type   = EventType::Pedestal;
        ev.n_samples    = 8;
        for ch in 0..4 {
          let mut data = ChannelData::new(ch);
          data.samples = vec![20;8];
          ev.channels.push(data);
        }
        writer.add_event(&ev).unwrap();
      }
      writer.flush().unwrap();
    }
    let mut reader = EventFileReader::open(&path).unwrap();
    assert_eq!(reader.run_header().run_number, 64080);
    let mut n = 0;
    while let Some(ev) = reader.next_event().unwrap() {
      assert_eq!(ev.event_number, n);
      assert_eq!(ev.channels.len(), 4);
      n += 1;
    }
    assert_eq!(n, 5);
    assert_eq!(reader.n_errors, 0);
  }

  #[test]
  fn corrupt_record_is_skipped() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.vev");
    let mut stream = header().to_bytestream();
    let mut ev = TelescopeEvent::new();
    ev.event_number = 7;
    let good = ev.to_bytestream();
    // truncated record
    stream.extend_from_slice(&good[0..good.len() - 4]);
    stream.extend_from_slice(&good);
    fs::write(&path, &stream).unwrap();
    let reader = EventFileReader::open(&path).unwrap();
    let events : Vec<TelescopeEvent> = reader.collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_number, 7);
  }

  #[test]
  fn missing_file_is_io_error() {
    match EventFileReader::open("/this/path/does/not/exist.vev") {
      Err(CalibrationError::Io {..}) => (),
      other => panic!("Expected io error, got {:?}", other.map(|_| ()))
    }
  }
}
