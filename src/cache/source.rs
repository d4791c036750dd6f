//! Sparse local source files.
//!
//! Every materialized api path owns one [`SourceFile`] under the cache
//! directory, named by a fresh UUID. Chunks land at their natural offsets;
//! unwritten ranges stay holes and read back as zeros.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ApiResult;

/// Random-access handle over one sparse cache file.
pub struct SourceFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl SourceFile {
    /// Creates a fresh UUID-named file under `cache_dir`.
    pub async fn create(cache_dir: &Path) -> ApiResult<Self> {
        tokio::fs::create_dir_all(cache_dir).await?;
        let path = cache_dir.join(Uuid::new_v4().to_string());
        Self::open(&path).await
    }

    /// Opens (or creates) the file at `path`.
    pub async fn open(path: &Path) -> ApiResult<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path).await?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `len` bytes at `offset`; holes read as zeros, EOF shortens
    /// the result.
    pub async fn read_at(&self, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        let mut file = self.file.lock().await;
        let end = file.seek(SeekFrom::End(0)).await?;
        if offset >= end {
            return Ok(Vec::new());
        }

        let len = len.min((end - offset) as usize);
        let mut data = vec![0u8; len];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Writes `data` at `offset`, extending the file as needed.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> ApiResult<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Sets the file length; shrinking discards, growing leaves a hole.
    pub async fn truncate(&self, len: u64) -> ApiResult<()> {
        let file = self.file.lock().await;
        file.set_len(len).await?;
        Ok(())
    }

    pub async fn len(&self) -> ApiResult<u64> {
        let mut file = self.file.lock().await;
        Ok(file.seek(SeekFrom::End(0)).await?)
    }

    pub async fn flush(&self) -> ApiResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Deletes the backing file; the handle must not be used afterwards.
    pub async fn remove(&self) -> ApiResult<()> {
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }
}
