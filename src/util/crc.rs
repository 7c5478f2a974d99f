//! CRC32 checksum helpers

use crc32fast::Hasher;

/// Checksum a single buffer.
pub fn crc32(data: &[u8]) -> u32 {
  crc32fast::hash(data)
}

/// Checksum several buffers as if they were one contiguous payload.
pub fn crc32_multi(segments: &[&[u8]]) -> u32 {
  let mut hasher = Hasher::new();
  for segment in segments {
    hasher.update(segment);
  }
  hasher.finalize()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn multi_matches_contiguous() {
    assert_eq!(crc32_multi(&[b"hello", b"-", b"world"]), crc32(b"hello-world"));
  }
}
