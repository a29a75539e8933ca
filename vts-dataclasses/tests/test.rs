#[cfg(test)]
pub mod tests {

  use vts_dataclasses::{RunHeader,
                        TelescopeEvent};
  use vts_dataclasses::io::{EventFileReader,
                            EventFileWriter,
                            EventSource,
                            read_file};
  use vts_dataclasses::serialization::{Serialization,
                                       SerializationError};
  use vts_dataclasses::FromRandom;

  #[test]
  fn random_events_through_event_file() {
    let dir    = tempfile::tempdir().unwrap();
    let path   = dir.path().join("random.vev");
    let header = RunHeader::from_random();
    let events : Vec<TelescopeEvent> = (0..50).map(|_| TelescopeEvent::from_random()).collect();
    {
      let mut writer = EventFileWriter::create(&path, &header).unwrap();
      for ev in &events {
        writer.add_event(ev).unwrap();
      }
    }
    let mut reader = EventFileReader::open(&path).unwrap();
    assert_eq!(reader.run_header(), &header);
    let mut back = Vec::<TelescopeEvent>::new();
    while let Some(ev) = reader.next_event().unwrap() {
      back.push(ev);
    }
    assert_eq!(back, events);
  }

  #[test]
  fn truncated_run_header_is_rejected() {
    let header = RunHeader::from_random();
    let stream = header.to_bytestream();
    let mut pos = 0usize;
    let result = RunHeader::from_bytestream(&stream[0..stream.len() - 1], &mut pos);
    assert!(matches!(result, Err(SerializationError::StreamTooShort {..})));
  }

  #[test]
  fn broken_tail_is_rejected() {
    let event = TelescopeEvent::from_random();
    let mut stream = event.to_bytestream();
    let n = stream.len();
    stream[n - 1] = 0;
    let mut pos = 0usize;
    assert_eq!(TelescopeEvent::from_bytestream(&stream, &mut pos),
               Err(SerializationError::TailInvalid));
  }

  #[test]
  fn read_file_size() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    std::fs::write(&path, vec![7u8;1234]).unwrap();
    assert_eq!(read_file(&path).unwrap().len(), 1234);
  }
}
