//! One open filesystem item.
//!
//! An [`OpenFile`] lives in the open-file table from first open until the
//! reaper retires it. It reference-counts client handles, owns the chunk
//! cache for files, latches the first terminal error, and carries the
//! unlink snapshot once the path is removed while still open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::cache::chunk::{ChunkCache, ChunkSource};
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::meta::MetaMap;
use crate::path::get_parent_api_path;
use crate::provider::Provider;
use crate::types::{FilesystemItem, OpenFlags, StopToken};

/// Stable identity of one open-file entry; survives rename.
pub type FileId = u64;

#[derive(Debug)]
struct FileState {
    api_path: String,
    api_parent: String,
    handles: HashMap<u64, OpenFlags>,
    modified: bool,
    pinned: bool,
    unlinked: bool,
    unlinked_meta: Option<MetaMap>,
    unlinked_path: Option<String>,
    error: Option<ApiError>,
    last_access: Instant,
}

/// Entry in the open-file table.
pub struct OpenFile {
    id: FileId,
    directory: bool,
    provider: Arc<dyn Provider>,
    events: EventSink,
    mount_stop: StopToken,
    cache: Option<ChunkCache>,
    upload_queued: AtomicBool,
    state: Mutex<FileState>,
}

impl OpenFile {
    pub fn new(
        id: FileId,
        item: &FilesystemItem,
        pinned: bool,
        cache: Option<ChunkCache>,
        provider: Arc<dyn Provider>,
        events: EventSink,
        mount_stop: StopToken,
    ) -> Self {
        Self {
            id,
            directory: item.directory,
            provider,
            events,
            mount_stop,
            cache,
            upload_queued: AtomicBool::new(false),
            state: Mutex::new(FileState {
                api_path: item.api_path.clone(),
                api_parent: item.api_parent.clone(),
                handles: HashMap::new(),
                modified: false,
                pinned,
                unlinked: false,
                unlinked_meta: None,
                unlinked_path: None,
                error: None,
                last_access: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn cache(&self) -> Option<&ChunkCache> {
        self.cache.as_ref()
    }

    pub async fn api_path(&self) -> String {
        self.state.lock().await.api_path.clone()
    }

    /// Rewrites the path under rename; subsidiary maps key on [`FileId`], so
    /// only this entry changes.
    pub async fn set_api_path(&self, api_path: &str) {
        let mut state = self.state.lock().await;
        state.api_path = api_path.to_owned();
        state.api_parent = get_parent_api_path(api_path);
    }

    pub async fn filesystem_item(&self) -> FilesystemItem {
        let state = self.state.lock().await;
        let size = match &self.cache {
            Some(cache) => cache.file_size().await,
            None => 0,
        };
        FilesystemItem {
            api_path: state.api_path.clone(),
            api_parent: state.api_parent.clone(),
            directory: self.directory,
            size,
            source_path: self
                .cache
                .as_ref()
                .map(|cache| cache.source_path())
                .unwrap_or_default(),
        }
    }

    pub async fn file_size(&self) -> u64 {
        match &self.cache {
            Some(cache) => cache.file_size().await,
            None => 0,
        }
    }

    // --- handles ---

    pub async fn add_handle(&self, handle: u64, flags: OpenFlags) {
        let mut state = self.state.lock().await;
        state.handles.insert(handle, flags);
        state.last_access = Instant::now();
        let first = state.handles.len() == 1;
        let api_path = state.api_path.clone();
        drop(state);

        if first {
            self.events.raise(Event::FilesystemItemOpened {
                api_path,
                source_path: self.cache.as_ref().map(|c| c.source_path()).unwrap_or_default(),
                directory: self.directory,
            });
        }
    }

    /// Drops one handle; returns the number still open.
    pub async fn remove_handle(&self, handle: u64) -> usize {
        let mut state = self.state.lock().await;
        state.handles.remove(&handle);
        state.last_access = Instant::now();
        let remaining = state.handles.len();
        let api_path = state.api_path.clone();
        let modified = state.modified;
        drop(state);

        if remaining == 0 {
            self.events.raise(Event::FilesystemItemClosed {
                api_path,
                source_path: self.cache.as_ref().map(|c| c.source_path()).unwrap_or_default(),
                directory: self.directory,
                modified,
            });
        }
        remaining
    }

    pub async fn handle_flags(&self, handle: u64) -> Option<OpenFlags> {
        self.state.lock().await.handles.get(&handle).copied()
    }

    pub async fn handle_count(&self) -> usize {
        self.state.lock().await.handles.len()
    }

    pub async fn handles(&self) -> Vec<u64> {
        self.state.lock().await.handles.keys().copied().collect()
    }

    // --- flags and error latch ---

    pub async fn is_modified(&self) -> bool {
        self.state.lock().await.modified
    }

    pub async fn set_modified(&self, modified: bool) {
        self.state.lock().await.modified = modified;
    }

    pub async fn is_pinned(&self) -> bool {
        self.state.lock().await.pinned
    }

    pub async fn set_pinned(&self, pinned: bool) {
        self.state.lock().await.pinned = pinned;
    }

    pub async fn is_unlinked(&self) -> bool {
        self.state.lock().await.unlinked
    }

    /// Marks the entry unlinked, capturing the meta snapshot every later
    /// stat serves and the path the unlink happened at.
    pub async fn mark_unlinked(&self, meta: MetaMap) {
        let mut state = self.state.lock().await;
        state.unlinked = true;
        state.unlinked_meta = Some(meta);
        state.unlinked_path = Some(state.api_path.clone());
    }

    pub async fn unlinked_meta(&self) -> Option<MetaMap> {
        self.state.lock().await.unlinked_meta.clone()
    }

    /// Path captured at unlink time; the deferred provider delete targets
    /// this, never a path rewritten afterwards.
    pub async fn unlinked_path(&self) -> Option<String> {
        self.state.lock().await.unlinked_path.clone()
    }

    pub async fn error(&self) -> Option<ApiError> {
        self.state.lock().await.error.clone()
    }

    /// Latches `err`: an already-latched error survives unless it was only a
    /// stopped download.
    pub async fn set_error(&self, err: ApiError) {
        let mut state = self.state.lock().await;
        match &state.error {
            None | Some(ApiError::DownloadStopped) => state.error = Some(err),
            Some(_) => {}
        }
    }

    async fn check_error(&self) -> ApiResult<()> {
        match self.state.lock().await.error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn touch(&self) {
        self.state.lock().await.last_access = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_access.elapsed()
    }

    /// Upload-queue guard; `true` when the caller won the right to enqueue.
    pub fn try_claim_upload(&self) -> bool {
        !self.upload_queued.swap(true, Ordering::SeqCst)
    }

    pub fn release_upload_claim(&self) {
        self.upload_queued.store(false, Ordering::SeqCst);
    }

    async fn chunk_source(&self) -> ChunkSource {
        ChunkSource {
            provider: Arc::clone(&self.provider),
            api_path: self.api_path().await,
            stop: self.mount_stop.clone(),
            events: self.events.clone(),
        }
    }

    // --- data path ---

    /// Reads through the chunk cache. Write-only handles cannot read.
    pub async fn read(&self, handle: u64, size: usize, offset: u64) -> ApiResult<Vec<u8>> {
        let cache = self.cache.as_ref().ok_or(ApiError::DirectoryExists)?;
        let flags = self.handle_flags(handle).await.ok_or(ApiError::InvalidHandle)?;
        if !flags.read_allowed() {
            return Err(ApiError::InvalidHandle);
        }
        self.check_error().await?;

        let ctx = self.chunk_source().await;
        let data = cache.read(&ctx, size, offset).await?;
        self.touch().await;
        Ok(data)
    }

    /// Writes through the chunk cache; `O_APPEND` handles always write at
    /// EOF. Generic and OS errors latch onto the entry.
    pub async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> ApiResult<usize> {
        let cache = self.cache.as_ref().ok_or(ApiError::DirectoryExists)?;
        let flags = self.handle_flags(handle).await.ok_or(ApiError::InvalidHandle)?;
        if !flags.write_allowed() {
            return Err(ApiError::InvalidHandle);
        }
        self.check_error().await?;

        let offset = if flags.append() { cache.file_size().await } else { offset };

        let ctx = self.chunk_source().await;
        match cache.write(&ctx, offset, data).await {
            Ok(written) => {
                self.set_modified(true).await;
                self.touch().await;
                Ok(written)
            }
            Err(err) => {
                if matches!(err, ApiError::Error | ApiError::OsError(_)) {
                    self.set_error(err.clone()).await;
                }
                Err(err)
            }
        }
    }

    /// Truncates or extends the cached file.
    pub async fn resize(&self, new_size: u64) -> ApiResult<()> {
        let cache = self.cache.as_ref().ok_or(ApiError::DirectoryExists)?;
        self.check_error().await?;
        cache.resize(new_size).await?;
        self.set_modified(true).await;
        self.touch().await;
        Ok(())
    }

    /// Reaper predicate: no handles, nothing dirty, and either the download
    /// finished, a terminal error latched, or the idle timer elapsed.
    pub async fn can_close(&self, chunk_timeout: Duration) -> bool {
        if self.directory {
            return self.state.lock().await.handles.is_empty();
        }

        let state = self.state.lock().await;
        if !state.handles.is_empty() || state.modified {
            return false;
        }
        if state.error.as_ref().map(ApiError::is_terminal).unwrap_or(false) {
            return true;
        }
        let idle = state.last_access.elapsed();
        drop(state);

        if let Some(cache) = &self.cache {
            if cache.is_complete().await {
                return true;
            }
        }
        idle >= chunk_timeout
    }
}
