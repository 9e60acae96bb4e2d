//! Positional chunk reads and writes.
//!
//! Shards of one transfer share a single handle; each access seeks and
//! transfers one chunk while holding the handle's lock.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::chunk::Chunk;
use crate::error::TransferError;

/// Read side of an upload.
#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileReader {
    /// Open `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            path,
            file: Mutex::new(file),
            size,
        })
    }

    /// File size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::OutOfRange`] for a chunk past the end of the
    /// file, or [`TransferError::Io`] on read failure.
    pub async fn read_chunk(&self, chunk: Chunk) -> Result<Vec<u8>, TransferError> {
        if chunk.end() > self.size {
            return Err(TransferError::OutOfRange {
                offset: chunk.offset,
                size: chunk.size,
                file_size: self.size,
            });
        }
        let len = usize::try_from(chunk.size).map_err(|_| TransferError::OutOfRange {
            offset: chunk.offset,
            size: chunk.size,
            file_size: self.size,
        })?;

        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Write side of a download.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileWriter {
    /// Create (or reopen without truncating) `path`, sized to `size` bytes so
    /// chunks can land in any order.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be created or sized.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            size,
        })
    }

    /// Target size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one chunk at its offset.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ShortChunk`] when `data` does not fill the
    /// chunk, [`TransferError::OutOfRange`] past the end, or
    /// [`TransferError::Io`] on write failure.
    pub async fn write_chunk(&self, chunk: Chunk, data: &[u8]) -> Result<(), TransferError> {
        if chunk.end() > self.size {
            return Err(TransferError::OutOfRange {
                offset: chunk.offset,
                size: chunk.size,
                file_size: self.size,
            });
        }
        if data.len() as u64 != chunk.size {
            return Err(TransferError::ShortChunk {
                offset: chunk.offset,
                expected: chunk.size as usize,
                actual: data.len(),
            });
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Flush file contents to disk.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if syncing fails.
    pub async fn sync(&self) -> Result<(), TransferError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_out_of_order_writes_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let writer = FileWriter::create(&path, data.len() as u64).await.unwrap();
        let chunk_size = 4096;
        let mut offsets: Vec<u64> = (0..data.len() as u64).step_by(chunk_size).collect();
        offsets.reverse();
        for offset in offsets {
            let chunk = Chunk::at(offset, data.len() as u64, chunk_size as u64);
            writer
                .write_chunk(chunk, &data[offset as usize..chunk.end() as usize])
                .await
                .unwrap();
        }
        writer.sync().await.unwrap();

        let reader = FileReader::open(&path).await.unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        let tail = Chunk::at(8192, data.len() as u64, chunk_size as u64);
        assert_eq!(reader.read_chunk(tail).await.unwrap(), &data[8192..]);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_chunk_bounds_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.bin");
        let writer = FileWriter::create(&path, 10).await.unwrap();
        let chunk = Chunk { offset: 8, size: 4 };
        assert!(matches!(
            writer.write_chunk(chunk, &[0; 4]).await,
            Err(TransferError::OutOfRange { .. })
        ));
        let chunk = Chunk { offset: 0, size: 4 };
        assert!(matches!(
            writer.write_chunk(chunk, &[0; 3]).await,
            Err(TransferError::ShortChunk { .. })
        ));

        let reader = FileReader::open(&path).await.unwrap();
        assert!(reader.read_chunk(Chunk { offset: 9, size: 2 }).await.is_err());
    }
}
