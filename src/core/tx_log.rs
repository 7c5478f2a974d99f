//! Framed, checksummed transaction log storage.
//!
//! Frame layout (little-endian):
//! `[magic u32][version u16][flags u16][id u64][payload_len u32][crc32 u32][payload]`

use crate::constants::{MAGIC_TX_FRAME, MAX_FRAME_PAYLOAD_BYTES, VERSION_TX_FRAME};
use crate::error::{KiteError, Result};
use crate::util::crc::{crc32, crc32_multi};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

const FRAME_FLAG_CRC32_DISABLED: u16 = 0x0001;
pub(crate) const FRAME_HEADER_SIZE: usize = std::mem::size_of::<u32>()
  + std::mem::size_of::<u16>()
  + std::mem::size_of::<u16>()
  + std::mem::size_of::<u64>()
  + std::mem::size_of::<u32>()
  + std::mem::size_of::<u32>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
  pub id: u64,
  pub payload: Vec<u8>,
}

impl LogFrame {
  pub fn new(id: u64, payload: Vec<u8>) -> Self {
    Self { id, payload }
  }
}

#[derive(Debug)]
pub struct TxLogStore {
  path: PathBuf,
  file: File,
  writable: bool,
}

impl TxLogStore {
  /// Create (or truncate) a log for writing.
  pub fn create(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .read(true)
      .write(true)
      .open(&path)?;

    Ok(Self {
      path,
      file,
      writable: true,
    })
  }

  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new().read(true).open(&path)?;

    Ok(Self {
      path,
      file,
      writable: false,
    })
  }

  pub fn open_or_create_append(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(&path)?;

    Ok(Self {
      path,
      file,
      writable: true,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&mut self, frame: &LogFrame) -> Result<u64> {
    self.append_payload_segments(frame.id, &[frame.payload.as_slice()])
  }

  /// Append one frame whose payload is the concatenation of `payload_segments`.
  /// Returns the number of bytes written.
  pub fn append_payload_segments(&mut self, id: u64, payload_segments: &[&[u8]]) -> Result<u64> {
    if !self.writable {
      return Err(KiteError::InvalidWal(
        "cannot append to read-only transaction log".to_string(),
      ));
    }

    let payload_len = payload_segments.iter().try_fold(0usize, |acc, segment| {
      acc
        .checked_add(segment.len())
        .ok_or_else(|| KiteError::InvalidWal("frame payload too large".to_string()))
    })?;

    if payload_len > MAX_FRAME_PAYLOAD_BYTES {
      return Err(KiteError::InvalidWal(format!(
        "frame payload too large: {payload_len} bytes"
      )));
    }

    let payload_len_u32 = u32::try_from(payload_len).map_err(|_| {
      KiteError::InvalidWal(format!("payload length does not fit u32: {payload_len}"))
    })?;

    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC_TX_FRAME.to_le_bytes());
    header[4..6].copy_from_slice(&VERSION_TX_FRAME.to_le_bytes());
    header[6..8].copy_from_slice(&0u16.to_le_bytes());
    header[8..16].copy_from_slice(&id.to_le_bytes());
    header[16..20].copy_from_slice(&payload_len_u32.to_le_bytes());
    header[20..24].copy_from_slice(&crc32_multi(payload_segments).to_le_bytes());

    self.file.write_all(&header)?;
    for segment in payload_segments {
      self.file.write_all(segment)?;
    }

    Ok(FRAME_HEADER_SIZE as u64 + payload_len as u64)
  }

  pub fn sync(&mut self) -> Result<()> {
    if self.writable {
      self.file.flush()?;
      self.file.sync_all()?;
    }
    Ok(())
  }

  pub fn read_all(&self) -> Result<Vec<LogFrame>> {
    self.read_filtered(|_| true, 0)
  }

  /// Read frames accepted by `include`, stopping after `max_frames` when non-zero.
  pub fn read_filtered(
    &self,
    mut include: impl FnMut(&LogFrame) -> bool,
    max_frames: usize,
  ) -> Result<Vec<LogFrame>> {
    let file = OpenOptions::new().read(true).open(&self.path)?;
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();

    while let Some(frame) = read_frame(&mut reader)? {
      if include(&frame) {
        frames.push(frame);
        if max_frames > 0 && frames.len() >= max_frames {
          break;
        }
      }
    }

    Ok(frames)
  }
}

/// Atomically replace the log at `path` with `frames` (tmp file, fsync, rename).
pub fn rewrite_log(path: &Path, frames: &[LogFrame]) -> Result<()> {
  let tmp_path = path.with_extension("rlog.tmp");
  {
    let mut store = TxLogStore::create(&tmp_path)?;
    for frame in frames {
      store.append(frame)?;
    }
    store.sync()?;
  }
  fs::rename(&tmp_path, path)?;
  crate::util::sync_parent_dir(path.parent())
}

fn read_frame(reader: &mut impl Read) -> Result<Option<LogFrame>> {
  let magic = match reader.read_u32::<LittleEndian>() {
    Ok(value) => value,
    Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(error) => return Err(KiteError::Io(error)),
  };

  if magic != MAGIC_TX_FRAME {
    return Err(KiteError::InvalidWal(format!(
      "invalid transaction frame magic: 0x{magic:08X}"
    )));
  }

  let version = read_u16_checked(reader, "version")?;
  let flags = read_u16_checked(reader, "flags")?;
  let id = read_u64_checked(reader, "id")?;
  let payload_len = read_u32_checked(reader, "payload_len")?;
  let stored_crc32 = read_u32_checked(reader, "payload_crc32")?;

  if version != VERSION_TX_FRAME {
    return Err(KiteError::VersionMismatch {
      required: version as u32,
      current: VERSION_TX_FRAME as u32,
    });
  }

  if flags & !FRAME_FLAG_CRC32_DISABLED != 0 {
    return Err(KiteError::InvalidWal(format!(
      "unsupported transaction frame flags: 0x{flags:04X}"
    )));
  }

  let payload_len = payload_len as usize;
  if payload_len > MAX_FRAME_PAYLOAD_BYTES {
    return Err(KiteError::InvalidWal(format!(
      "frame payload exceeds limit: {payload_len}"
    )));
  }

  let mut payload = vec![0; payload_len];
  reader
    .read_exact(&mut payload)
    .map_err(|error| map_unexpected_eof(error, "payload"))?;

  if flags & FRAME_FLAG_CRC32_DISABLED == 0 {
    let computed_crc32 = crc32(&payload);
    if computed_crc32 != stored_crc32 {
      return Err(KiteError::CrcMismatch {
        stored: stored_crc32,
        computed: computed_crc32,
      });
    }
  }

  Ok(Some(LogFrame::new(id, payload)))
}

fn read_u16_checked(reader: &mut impl Read, field: &'static str) -> Result<u16> {
  reader
    .read_u16::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn read_u32_checked(reader: &mut impl Read, field: &'static str) -> Result<u32> {
  reader
    .read_u32::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn read_u64_checked(reader: &mut impl Read, field: &'static str) -> Result<u64> {
  reader
    .read_u64::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn map_unexpected_eof(error: io::Error, field: &'static str) -> KiteError {
  if error.kind() == io::ErrorKind::UnexpectedEof {
    KiteError::InvalidWal(format!("truncated transaction log while reading {field}"))
  } else {
    KiteError::Io(error)
  }
}

#[cfg(test)]
mod tests {
  use super::{rewrite_log, LogFrame, TxLogStore, FRAME_HEADER_SIZE};

  #[test]
  fn append_then_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tx.rlog");

    let mut store = TxLogStore::create(&path).expect("create");
    store
      .append(&LogFrame::new(1, b"hello".to_vec()))
      .expect("append");
    store
      .append(&LogFrame::new(2, b"world".to_vec()))
      .expect("append");
    store.sync().expect("sync");

    let reader = TxLogStore::open(&path).expect("open");
    let frames = reader.read_all().expect("read");

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id, 1);
    assert_eq!(frames[1].payload, b"world");
  }

  #[test]
  fn filtered_read_honours_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tx.rlog");

    let mut store = TxLogStore::create(&path).expect("create");
    for id in 1..=10 {
      store
        .append_payload_segments(id, &[b"tx-", id.to_string().as_bytes()])
        .expect("append");
    }
    store.sync().expect("sync");

    let frames = store
      .read_filtered(|frame| frame.id > 4, 3)
      .expect("read filtered");
    let ids: Vec<u64> = frames.iter().map(|frame| frame.id).collect();
    assert_eq!(ids, vec![5, 6, 7]);
    assert_eq!(frames[0].payload, b"tx-5");
  }

  #[test]
  fn rewrite_keeps_only_given_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tx.rlog");

    let mut store = TxLogStore::create(&path).expect("create");
    for id in 1..=4 {
      store
        .append(&LogFrame::new(id, vec![id as u8]))
        .expect("append");
    }
    store.sync().expect("sync");
    drop(store);

    let kept = TxLogStore::open(&path)
      .expect("open")
      .read_filtered(|frame| frame.id >= 3, 0)
      .expect("read");
    rewrite_log(&path, &kept).expect("rewrite");

    let frames = TxLogStore::open(&path).expect("reopen").read_all().expect("read");
    assert_eq!(frames, kept);
  }

  #[test]
  fn truncated_frame_header_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tx.rlog");

    let mut store = TxLogStore::create(&path).expect("create");
    store
      .append(&LogFrame::new(1, b"abc".to_vec()))
      .expect("append");
    store.sync().expect("sync");

    let mut bytes = std::fs::read(&path).expect("read bytes");
    bytes.truncate(FRAME_HEADER_SIZE - 1);
    std::fs::write(&path, bytes).expect("write truncated");

    let reader = TxLogStore::open(&path).expect("open");
    assert!(reader.read_all().is_err());
  }

  #[test]
  fn corrupted_payload_reports_crc_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tx.rlog");

    let mut store = TxLogStore::create(&path).expect("create");
    store
      .append(&LogFrame::new(1, b"payload".to_vec()))
      .expect("append");
    store.sync().expect("sync");

    let mut bytes = std::fs::read(&path).expect("read bytes");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write corrupted");

    let err = TxLogStore::open(&path)
      .expect("open")
      .read_all()
      .expect_err("corruption must be detected");
    assert!(err.to_string().contains("CRC mismatch"), "unexpected: {err}");
  }
}
