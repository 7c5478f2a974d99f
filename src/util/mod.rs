//! Utility modules

pub mod crc;

use crate::error::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` atomically: tmp file, fsync, rename, fsync parent.
pub(crate) fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let tmp_path = path.with_extension("tmp");
  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&tmp_path)?;
  file.write_all(bytes)?;
  file.sync_all()?;
  std::fs::rename(&tmp_path, path)?;
  sync_parent_dir(path.parent())
}

pub(crate) fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      std::fs::File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(windows)]
  {
    if let Some(parent) = parent {
      use std::os::windows::fs::OpenOptionsExt;

      const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x02000000;
      let directory = OpenOptions::new()
        .read(true)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
        .open(parent)?;
      directory.sync_all()?;
    }
  }

  #[cfg(not(any(unix, windows)))]
  {
    let _ = parent;
  }

  Ok(())
}
