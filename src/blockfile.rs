//! Append-only block-data files
//!
//! A block file holds the concatenation of encoded blocks for one
//! spindle. Exactly one writer-pool worker owns the write half; reads
//! are stateless positional reads that open their own handle, so any
//! number may run in parallel with the appender.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// The write half of one block-data file.
///
/// `len` is the logical end: the byte after the last *successful*
/// append. A failed append leaves `len` unchanged, so whatever partial
/// bytes it left behind are overwritten by the next append and the file
/// length stays equal to the sum of advertised block sizes.
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl BlockFile {
    /// Create a new, empty block file. Fails if the path exists.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(path.clone())
                } else {
                    Error::Io(e)
                }
            })?;
        Ok(Self { path, file, len: 0 })
    }

    /// Open an existing block file for appending at its current end.
    pub async fn open_for_append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { path, file, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The logical length: offset of the next append.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one encoded block, returning `(offset, nbytes)`.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(u64, u32)> {
        let nbytes = u32::try_from(bytes.len())
            .map_err(|_| Error::Codec(format!("encoded block too large: {} bytes", bytes.len())))?;
        let offset = self.len;
        // A prior failed append may have left the OS file cursor (and
        // stray bytes) past the logical end; always write at `len`.
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.len = offset + nbytes as u64;
        Ok((offset, nbytes))
    }

    /// Flush appended bytes to stable storage.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_data().await?;
        Ok(())
    }

    /// Positional read of one encoded block. Opens a fresh handle, so
    /// concurrent calls never contend.
    pub async fn read_at(path: impl AsRef<Path>, offset: u64, nbytes: u32) -> Result<Bytes> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .await
            .map_err(|e| Error::ReadFailure(format!("{}: {}", path.display(), e)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::ReadFailure(format!("{}: {}", path.display(), e)))?;
        let mut buf = vec![0u8; nbytes as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::ReadFailure(format!("{}: {}", path.display(), e)))?;
        Ok(Bytes::from(buf))
    }

    /// Shrink a block file back to `len` if it has grown past it.
    ///
    /// Bytes past the highest index-advertised end are undefined after a
    /// crash; reopening discards them. A missing file is left alone so a
    /// relocated volume can still be opened and repaired via rebase.
    pub async fn truncate_to(path: impl AsRef<Path>, len: u64) -> Result<()> {
        let path = path.as_ref();
        let current = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        if current > len {
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(len).await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.0");

        let mut file = BlockFile::create(&path).await.unwrap();
        let (off_a, n_a) = file.append(b"first block").await.unwrap();
        let (off_b, n_b) = file.append(b"second").await.unwrap();
        file.sync().await.unwrap();

        assert_eq!((off_a, n_a), (0, 11));
        assert_eq!((off_b, n_b), (11, 6));
        assert_eq!(file.len(), 17);

        let a = BlockFile::read_at(&path, off_a, n_a).await.unwrap();
        let b = BlockFile::read_at(&path, off_b, n_b).await.unwrap();
        assert_eq!(&a[..], b"first block");
        assert_eq!(&b[..], b"second");
    }

    #[tokio::test]
    async fn test_create_refuses_existing_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.0");

        BlockFile::create(&path).await.unwrap();
        let err = BlockFile::create(&path).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_open_for_append_resumes_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.0");

        {
            let mut file = BlockFile::create(&path).await.unwrap();
            file.append(b"hello").await.unwrap();
            file.sync().await.unwrap();
        }

        let mut file = BlockFile::open_for_append(&path).await.unwrap();
        assert_eq!(file.len(), 5);
        let (offset, _) = file.append(b"world").await.unwrap();
        assert_eq!(offset, 5);
    }

    #[tokio::test]
    async fn test_truncate_discards_garbage_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.0");

        let mut file = BlockFile::create(&path).await.unwrap();
        file.append(b"committed").await.unwrap();
        file.sync().await.unwrap();
        drop(file);

        // Simulate a crashed writer leaving junk past the committed end.
        let mut junk = OpenOptions::new().append(true).open(&path).await.unwrap();
        junk.write_all(b"garbage").await.unwrap();
        junk.sync_data().await.unwrap();
        drop(junk);

        BlockFile::truncate_to(&path, 9).await.unwrap();
        assert_eq!(fs::metadata(&path).await.unwrap().len(), 9);

        let data = BlockFile::read_at(&path, 0, 9).await.unwrap();
        assert_eq!(&data[..], b"committed");
    }

    #[tokio::test]
    async fn test_truncate_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.9");
        assert!(BlockFile::truncate_to(&path, 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_past_end_is_read_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.0");

        let mut file = BlockFile::create(&path).await.unwrap();
        file.append(b"short").await.unwrap();
        file.sync().await.unwrap();

        let err = BlockFile::read_at(&path, 0, 64).await.unwrap_err();
        assert!(matches!(err, Error::ReadFailure(_)));
    }
}
