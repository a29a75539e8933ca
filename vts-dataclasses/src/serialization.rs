//! Serialization/Deserialization helpers
//!
//! All binary records (run header, events, calibration
//! trees) are framed by a 2 byte head and tail signature
//! and written little endian.
//!

// re-exports
pub use crate::errors::SerializationError;

/// Convert a vector of u16 into a vector of u8
///
/// The resulting vector has twice the number
/// of entries of the original vector.
/// This is useful, when serializing data
/// represented as u16, e.g. the FADC traces.
pub fn u16_to_u8(vec_u16: &[u16]) -> Vec<u8> {
  vec_u16.iter()
    .flat_map(|&n| n.to_le_bytes())
    .collect()
}

/// Restore a vector of u16 from a vector of u8
///
/// This interpretes two following u8 as an u16
pub fn u8_to_u16(vec_u8: &[u8]) -> Vec<u16> {
  vec_u8.chunks_exact(2)
    .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
    .collect()
}

/// Make sure that there are at least `nbytes` left in
/// the stream after `pos`
#[inline]
pub fn check_len(bs : &[u8], pos : usize, nbytes : usize) -> Result<(), SerializationError> {
  if pos + nbytes > bs.len() {
    return Err(SerializationError::StreamTooShort {
      needed : nbytes,
      pos    : pos,
      len    : bs.len()
    });
  }
  Ok(())
}

pub fn parse_u8(bs : &[u8], pos : &mut usize) -> Result<u8, SerializationError> {
  check_len(bs, *pos, 1)?;
  let value = bs[*pos];
  *pos += 1;
  Ok(value)
}

pub fn parse_bool(bs : &[u8], pos : &mut usize) -> Result<bool, SerializationError> {
  Ok(parse_u8(bs, pos)? > 0)
}

/// Get u16 from a bytestream and move on the position marker
///
/// # Arguments
///
/// * bs  : the bytestream
/// * pos : position of the first byte, will be
///         advanced by 2
pub fn parse_u16(bs : &[u8], pos : &mut usize) -> Result<u16, SerializationError> {
  check_len(bs, *pos, 2)?;
  let value = u16::from_le_bytes([bs[*pos], bs[*pos+1]]);
  *pos += 2;
  Ok(value)
}

pub fn parse_u32(bs : &[u8], pos : &mut usize) -> Result<u32, SerializationError> {
  check_len(bs, *pos, 4)?;
  let value = u32::from_le_bytes([bs[*pos], bs[*pos+1], bs[*pos+2], bs[*pos+3]]);
  *pos += 4;
  Ok(value)
}

pub fn parse_u64(bs : &[u8], pos : &mut usize) -> Result<u64, SerializationError> {
  check_len(bs, *pos, 8)?;
  let mut raw = [0u8;8];
  raw.copy_from_slice(&bs[*pos..*pos+8]);
  *pos += 8;
  Ok(u64::from_le_bytes(raw))
}

pub fn parse_f32(bs : &[u8], pos : &mut usize) -> Result<f32, SerializationError> {
  check_len(bs, *pos, 4)?;
  let value = f32::from_le_bytes([bs[*pos],   bs[*pos+1],
                                  bs[*pos+2], bs[*pos+3]]);
  *pos += 4;
  Ok(value)
}

pub fn parse_f64(bs : &[u8], pos : &mut usize) -> Result<f64, SerializationError> {
  check_len(bs, *pos, 8)?;
  let mut raw = [0u8;8];
  raw.copy_from_slice(&bs[*pos..*pos+8]);
  *pos += 8;
  Ok(f64::from_le_bytes(raw))
}

/// Length prefixed (u32) vector of f32
pub fn parse_vec_f32(bs : &[u8], pos : &mut usize) -> Result<Vec<f32>, SerializationError> {
  let n = parse_u32(bs, pos)? as usize;
  check_len(bs, *pos, 4*n)?;
  let mut values = Vec::<f32>::with_capacity(n);
  for _ in 0..n {
    values.push(parse_f32(bs, pos)?);
  }
  Ok(values)
}

/// Length prefixed (u32) vector of u16
pub fn parse_vec_u16(bs : &[u8], pos : &mut usize) -> Result<Vec<u16>, SerializationError> {
  let n = parse_u32(bs, pos)? as usize;
  check_len(bs, *pos, 2*n)?;
  let values = u8_to_u16(&bs[*pos..*pos + 2*n]);
  *pos += 2*n;
  Ok(values)
}

pub fn put_vec_f32(stream : &mut Vec<u8>, values : &[f32]) {
  stream.extend_from_slice(&(values.len() as u32).to_le_bytes());
  for v in values {
    stream.extend_from_slice(&v.to_le_bytes());
  }
}

pub fn put_vec_u16(stream : &mut Vec<u8>, values : &[u16]) {
  stream.extend_from_slice(&(values.len() as u32).to_le_bytes());
  stream.extend_from_slice(&u16_to_u8(values));
}

/// Encode/decode structs to Vec::<u8> to write them
/// to a file
///
pub trait Serialization {

  const HEAD: u16;
  const TAIL: u16;

  /// Decode a serializable from a bytestream
  ///
  /// # Arguments
  ///
  /// * bytestream : the bytes to decode from
  /// * pos        : start position, points after the
  ///                tail signature if successful
  fn from_bytestream(bytestream : &[u8],
                     pos        : &mut usize)
    -> Result<Self, SerializationError>
    where Self : Sized;

  /// Encode a serializable to a bytestream
  fn to_bytestream(&self) -> Vec<u8>;

  /// Check and consume the head signature
  fn verify_head(bytestream : &[u8], pos : &mut usize) -> Result<(), SerializationError> {
    if parse_u16(bytestream, pos)? != Self::HEAD {
      return Err(SerializationError::HeadInvalid);
    }
    Ok(())
  }

  /// Check and consume the tail signature
  fn verify_tail(bytestream : &[u8], pos : &mut usize) -> Result<(), SerializationError> {
    if parse_u16(bytestream, pos)? != Self::TAIL {
      return Err(SerializationError::TailInvalid);
    }
    Ok(())
  }
}

/// Search for a certain number of type `u16` in a bytestream
pub fn search_for_u16(number : u16, bytestream : &[u8], start_pos : usize)
  -> Result<usize, SerializationError> {
  if bytestream.len() < 2 || start_pos > bytestream.len() - 2 {
    return Err(SerializationError::StreamTooShort {
      needed : 2,
      pos    : start_pos,
      len    : bytestream.len()
    });
  }
  for n in start_pos..bytestream.len() - 1 {
    if u16::from_le_bytes([bytestream[n], bytestream[n + 1]]) == number {
      trace!("Found {number} at {n}");
      return Ok(n);
    }
  }
  debug!("Can not find {} in bytestream [{}:{}]!", number, start_pos, bytestream.len());
  Err(SerializationError::ValueNotFound)
}

#[cfg(test)]
mod test_serialization {
  use crate::serialization::{search_for_u16,
                             parse_u32,
                             parse_vec_u16,
                             put_vec_u16,
                             u16_to_u8,
                             SerializationError};

  #[test]
  fn test_u16_to_u8_size_doubled() {
    let size = 1000usize;
    let data = vec![42u16;size];
    let data_u8 = u16_to_u8(data.as_slice());
    assert_eq!(data_u8.len(), 2*size);
  }

  #[test]
  fn test_search_for_2_bytemarker() {
    let mut bytestream = vec![1,2,3,0xAA, 0xAA, 5, 7];
    let mut pos = search_for_u16(0xAAAA, &bytestream, 0).unwrap();
    assert_eq!(pos, 3);

    bytestream = vec![1,2,3,244, 16, 32, 0xaa, 0xff, 5, 7];
    pos = search_for_u16(65450, &bytestream, 1).unwrap();
    assert_eq!(pos, 6);

    bytestream = vec![0xaa,0xaa,3,244, 16, 32, 0xAA, 0xFF, 5, 7];
    pos = search_for_u16(0xaaaa, &bytestream, 0).unwrap();
    assert_eq!(pos, 0);
  }

  #[test]
  fn truncated_stream_is_an_error() {
    let bytestream = vec![1u8,2,3];
    let mut pos = 0usize;
    match parse_u32(&bytestream, &mut pos) {
      Err(SerializationError::StreamTooShort {needed, pos, len}) => {
        assert_eq!(needed, 4);
        assert_eq!(pos, 0);
        assert_eq!(len, 3);
      }
      other => panic!("Expected StreamTooShort, got {:?}", other)
    }
    // position marker must not move
    assert_eq!(pos, 0);
  }

  #[test]
  fn length_prefixed_u16() {
    let trace = vec![17u16, 255, 3, 0, 42];
    let mut stream = Vec::<u8>::new();
    put_vec_u16(&mut stream, &trace);
    let mut pos = 0usize;
    assert_eq!(parse_vec_u16(&stream, &mut pos).unwrap(), trace);
    assert_eq!(pos, stream.len());
  }
}
