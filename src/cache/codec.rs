use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Encode a value to its stored byte form (MessagePack).
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
  rmp_serde::to_vec(value).map_err(|e| CacheError::Serialization { source: e.into() })
}

/// Decode a value from its stored byte form.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
  rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization { source: e.into() })
}

/// Inflate a payload read from a store. Identity when the stored entry was
/// not compressed. Works without a configured `Compressor` so a store can
/// still read compressed entries after compression has been disabled.
pub fn decompress(data: &[u8], was_compressed: bool) -> Result<Vec<u8>, CacheError> {
  if !was_compressed {
    return Ok(data.to_vec());
  }
  let mut out = Vec::with_capacity(data.len().saturating_mul(2));
  ZlibDecoder::new(data)
    .read_to_end(&mut out)
    .map_err(|e| CacheError::Serialization { source: e.into() })?;
  Ok(out)
}

/// Zlib compressor applied to serialized payloads above a size threshold.
///
/// Small payloads and payloads that do not shrink are stored as-is, so
/// incompressible data never pays a compression tax.
#[derive(Debug, Clone)]
pub struct Compressor {
  level: u32,
  threshold: usize,
}

impl Compressor {
  pub fn new(level: u32, threshold: usize) -> Self {
    Self {
      level: level.clamp(1, 9),
      threshold,
    }
  }

  /// Returns the bytes to store and whether compression was applied.
  pub fn compress(&self, data: &[u8]) -> (Vec<u8>, bool) {
    if data.len() < self.threshold {
      return (data.to_vec(), false);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
    if encoder.write_all(data).is_err() {
      return (data.to_vec(), false);
    }
    match encoder.finish() {
      Ok(compressed) if compressed.len() < data.len() => (compressed, true),
      _ => (data.to_vec(), false),
    }
  }

  pub fn decompress(&self, data: &[u8], was_compressed: bool) -> Result<Vec<u8>, CacheError> {
    decompress(data, was_compressed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Deterministic pseudo-random bytes; effectively incompressible.
  fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545f4914f6cdd1du64;
    (0..len)
      .map(|_| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 32) as u8
      })
      .collect()
  }

  #[test]
  fn serialize_round_trips_nested_values() {
    let value = serde_json::json!({
      "name": "acorn",
      "count": 42,
      "nested": { "list": [1, 2, 3], "flag": true, "none": null }
    });
    let bytes = serialize(&value).unwrap();
    let back: serde_json::Value = deserialize(&bytes).unwrap();
    assert_eq!(back, value);
  }

  #[test]
  fn deserialize_rejects_garbage() {
    let result: Result<String, _> = deserialize(&[0xc1, 0xff, 0x00]);
    assert!(result.is_err());
  }

  #[test]
  fn compress_skips_below_threshold() {
    let c = Compressor::new(6, 1024);
    let data = vec![0u8; 100];
    let (out, compressed) = c.compress(&data);
    assert!(!compressed);
    assert_eq!(out, data);
    assert_eq!(c.decompress(&out, compressed).unwrap(), data);
  }

  #[test]
  fn compress_round_trips_large_compressible_data() {
    let c = Compressor::new(6, 1024);
    let data = b"squirrel".repeat(1000);
    let (out, compressed) = c.compress(&data);
    assert!(compressed);
    assert!(out.len() < data.len());
    assert_eq!(c.decompress(&out, compressed).unwrap(), data);
  }

  #[test]
  fn compress_falls_back_on_incompressible_data() {
    let c = Compressor::new(9, 16);
    let data = noise(4096);
    let (out, compressed) = c.compress(&data);
    // zlib adds framing overhead to random input, so the original wins
    assert!(!compressed);
    assert_eq!(out, data);
    assert_eq!(c.decompress(&out, compressed).unwrap(), data);
  }

  #[test]
  fn decompress_without_compressor_handles_both_flags() {
    let c = Compressor::new(6, 16);
    let data = b"ab".repeat(512);
    let (out, compressed) = c.compress(&data);
    assert!(compressed);
    assert_eq!(decompress(&out, true).unwrap(), data);
    assert_eq!(decompress(&data, false).unwrap(), data);
  }
}
