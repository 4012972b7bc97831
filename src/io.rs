use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use crate::{error::SmallError, types::SmallResult};

/// A file accessed by absolute position only. There is no cursor state, so
/// `&self` suffices for both reads and writes.
pub struct SmallFile {
    file: File,
    path: PathBuf,
}

impl SmallFile {
    /// Open the file, creating it when absent. The second return value
    /// tells the caller whether the file was just created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, bool), SmallError> {
        let created = !path.as_ref().exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(SmallError::io)?;

        Ok((
            Self {
                file,
                path: path.as_ref().to_path_buf(),
            },
            created,
        ))
    }

    /// Read exactly `buf.len()` bytes at `offset`. Bytes past the end of
    /// the file read as zero, so sparsely grown files behave as if they
    /// were zero-filled.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> SmallResult {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[done..], offset + done as u64)
                .map_err(SmallError::io)?;
            if n == 0 {
                for b in buf[done..].iter_mut() {
                    *b = 0;
                }
                return Ok(());
            }
            done += n;
        }
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> SmallResult {
        self.file.write_all_at(buf, offset).map_err(SmallError::io)
    }

    pub fn sync(&self) -> SmallResult {
        self.file.sync_data().map_err(SmallError::io)
    }

    pub fn size(&self) -> Result<u64, SmallError> {
        let metadata = self.file.metadata().map_err(SmallError::io)?;
        Ok(metadata.len())
    }

    pub fn set_len(&self, len: u64) -> SmallResult {
        self.file.set_len(len).map_err(SmallError::io)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_eof_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let (file, created) = SmallFile::open(dir.path().join("f")).unwrap();
        assert!(created);

        file.write_at(0, b"abc").unwrap();

        let mut buf = [0xffu8; 8];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 5]);

        // entirely past the end
        let mut buf = [0xffu8; 4];
        file.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_reopen_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");

        let (file, created) = SmallFile::open(&path).unwrap();
        assert!(created);
        file.write_at(0, b"x").unwrap();
        drop(file);

        let (file, created) = SmallFile::open(&path).unwrap();
        assert!(!created);
        assert_eq!(file.size().unwrap(), 1);
    }
}
