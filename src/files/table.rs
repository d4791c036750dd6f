//! Open-file table.
//!
//! One entry per api path, keyed internally by a stable [`FileId`] so a
//! rename rewrites a single index instead of every subsidiary map. Client
//! handles reference-count entries; the reaper retires entries once they are
//! closable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::chunk::ChunkCache;
use crate::cache::source::SourceFile;
use crate::config::MountConfig;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::files::open_file::{FileId, OpenFile};
use crate::files::upload::UploadQueue;
use crate::meta::{get_meta_bool, MetaMap, META_PINNED, META_SOURCE};
use crate::path::is_ancestor_of;
use crate::provider::Provider;
use crate::types::{FilesystemItem, OpenFlags, StopToken};

/// Process-wide table of open filesystem items.
pub struct OpenFileTable {
    provider: Arc<dyn Provider>,
    events: EventSink,
    stop: StopToken,
    uploader: UploadQueue,
    cache_dir: PathBuf,
    chunk_size: u64,
    chunk_timeout: Duration,
    files: DashMap<FileId, Arc<OpenFile>>,
    by_path: DashMap<String, FileId>,
    by_handle: DashMap<u64, FileId>,
    /// Deferred provider deletes, keyed by the path captured at unlink time.
    /// A create or overwriting rename that reclaims the path cancels the
    /// entry, so a stale handle's close never deletes the new data.
    pending_unlinks: DashMap<String, FileId>,
    next_handle: AtomicU64,
    next_file_id: AtomicU64,
    materialize_lock: Mutex<()>,
}

impl OpenFileTable {
    pub fn new(
        provider: Arc<dyn Provider>,
        uploader: UploadQueue,
        config: &MountConfig,
        events: EventSink,
        stop: StopToken,
    ) -> Self {
        Self {
            provider,
            events,
            stop,
            uploader,
            cache_dir: config.cache_dir.clone(),
            chunk_size: config.chunk_size,
            chunk_timeout: Duration::from_secs(config.chunk_timeout_secs),
            files: DashMap::new(),
            by_path: DashMap::new(),
            by_handle: DashMap::new(),
            pending_unlinks: DashMap::new(),
            next_handle: AtomicU64::new(0),
            next_file_id: AtomicU64::new(0),
            materialize_lock: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_timeout(&self) -> Duration {
        self.chunk_timeout
    }

    /// Monotonic handle allocator; handles are never reused within a mount.
    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lookup_by_path(&self, api_path: &str) -> Option<Arc<OpenFile>> {
        let id = *self.by_path.get(api_path)?;
        self.files.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Opens `api_path`, resolving or materializing the table entry, and
    /// returns a fresh handle. Write access on a read-only provider refuses
    /// with `PermissionDenied`.
    pub async fn open(
        &self,
        api_path: &str,
        directory: bool,
        flags: OpenFlags,
    ) -> ApiResult<(u64, Arc<OpenFile>)> {
        if flags.write_allowed() && self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }

        let file = self.resolve_or_materialize(api_path, directory).await?;
        let handle = self.next_handle();
        file.add_handle(handle, flags).await;
        self.by_handle.insert(handle, file.id());
        Ok((handle, file))
    }

    /// Creates a file then opens it. Refuses directories and honors
    /// `O_EXCL` against existing files.
    pub async fn create(
        &self,
        api_path: &str,
        meta: MetaMap,
        flags: OpenFlags,
    ) -> ApiResult<(u64, Arc<OpenFile>)> {
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }
        if self.provider.is_directory(api_path).await? {
            return Err(ApiError::DirectoryExists);
        }
        let exists = self.provider.is_file(api_path).await?;
        if exists && flags.exclusive() {
            return Err(ApiError::ItemExists);
        }
        if !exists {
            self.provider.create_file(api_path, &meta).await?;
        }
        let opened = self.open(api_path, false, flags).await?;
        // the path is live again; any deferred delete must not fire
        self.pending_unlinks.remove(api_path);
        Ok(opened)
    }

    async fn resolve_or_materialize(
        &self,
        api_path: &str,
        directory: bool,
    ) -> ApiResult<Arc<OpenFile>> {
        if let Some(file) = self.lookup_by_path(api_path) {
            if file.is_directory() != directory {
                return Err(ApiError::DirectoryExists);
            }
            return Ok(file);
        }

        let _guard = self.materialize_lock.lock().await;
        if let Some(file) = self.lookup_by_path(api_path) {
            if file.is_directory() != directory {
                return Err(ApiError::DirectoryExists);
            }
            return Ok(file);
        }

        let item = self.provider.get_filesystem_item(api_path, directory).await?;
        let meta = self.provider.get_item_meta(api_path).await.unwrap_or_default();
        let pinned = get_meta_bool(&meta, META_PINNED);

        let cache = if directory { None } else { Some(self.materialize_cache(&item).await?) };

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst) + 1;
        let file = Arc::new(OpenFile::new(
            id,
            &item,
            pinned,
            cache,
            Arc::clone(&self.provider),
            self.events.clone(),
            self.stop.clone(),
        ));
        self.files.insert(id, Arc::clone(&file));
        self.by_path.insert(api_path.to_owned(), id);
        Ok(file)
    }

    /// Builds the chunk cache for a file entry. A complete source file left
    /// by an earlier lifetime is reused; anything else starts from a fresh
    /// UUID-named sparse file.
    async fn materialize_cache(&self, item: &FilesystemItem) -> ApiResult<ChunkCache> {
        if !item.source_path.is_empty() {
            let path = PathBuf::from(&item.source_path);
            if let Ok(source) = SourceFile::open(&path).await {
                if source.len().await? == item.size {
                    return Ok(ChunkCache::new(source, self.chunk_size, item.size, true));
                }
            }
        }

        let source = SourceFile::create(&self.cache_dir).await?;
        let mut changes = MetaMap::new();
        changes.insert(META_SOURCE.to_owned(), source.path().to_string_lossy().into_owned());
        self.provider.set_item_meta(&item.api_path, changes).await?;

        Ok(ChunkCache::new(source, self.chunk_size, item.size, item.size == 0))
    }

    /// Drops one handle. The entry survives until the reaper retires it; an
    /// unlinked entry finalizes on last close, a modified one heads to the
    /// uploader.
    pub async fn close(&self, handle: u64) -> ApiResult<()> {
        let (_, id) = self.by_handle.remove(&handle).ok_or(ApiError::InvalidHandle)?;
        let Some(file) = self.files.get(&id).map(|entry| Arc::clone(&entry)) else {
            return Ok(());
        };

        let remaining = file.remove_handle(handle).await;
        if remaining > 0 {
            return Ok(());
        }

        if file.is_unlinked().await {
            self.finalize_unlinked(&file).await;
            return Ok(());
        }

        if file.is_modified().await && file.error().await.is_none() && file.try_claim_upload() {
            self.uploader.enqueue(Arc::clone(&file)).await;
        }
        Ok(())
    }

    async fn finalize_unlinked(&self, file: &Arc<OpenFile>) {
        if let Some(path) = file.unlinked_path().await {
            let owns_delete =
                self.pending_unlinks.get(&path).map(|id| *id == file.id()).unwrap_or(false);
            if owns_delete {
                self.pending_unlinks.remove(&path);
                match self.provider.remove_file(&path).await {
                    Ok(()) | Err(ApiError::ItemNotFound) => {}
                    Err(err) => warn!(%path, ?err, "deferred unlink failed"),
                }
            }
        }
        if let Some(cache) = file.cache() {
            let _ = cache.remove_source().await;
        }
        self.files.remove(&file.id());
    }

    pub fn get_open_file(&self, handle: u64) -> ApiResult<Arc<OpenFile>> {
        let id = *self.by_handle.get(&handle).ok_or(ApiError::InvalidHandle)?;
        self.files
            .get(&id)
            .map(|entry| Arc::clone(&entry))
            .ok_or(ApiError::InvalidHandle)
    }

    pub fn get_open_file_by_path(&self, api_path: &str) -> Option<Arc<OpenFile>> {
        self.lookup_by_path(api_path)
    }

    pub async fn get_open_file_count(&self, api_path: &str) -> usize {
        match self.lookup_by_path(api_path) {
            Some(file) => file.handle_count().await,
            None => 0,
        }
    }

    pub fn all_files(&self) -> Vec<Arc<OpenFile>> {
        self.files.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    // --- rename ---

    /// Renames one file, updating the provider and any live entry together.
    pub async fn rename_file(&self, from: &str, to: &str, overwrite: bool) -> ApiResult<()> {
        if self.provider.is_directory(to).await? {
            return Err(ApiError::DirectoryExists);
        }
        if self.provider.is_file(to).await? {
            if !overwrite {
                return Err(ApiError::ItemExists);
            }
            self.unlink(to).await?;
            // the rename supersedes the target's provider data; a still-open
            // target entry keeps its snapshot but must not delete `to` later
            self.pending_unlinks.remove(to);
        }

        self.provider.rename_file(from, to).await?;

        if let Some((_, id)) = self.by_path.remove(from) {
            if let Some(file) = self.files.get(&id).map(|entry| Arc::clone(&entry)) {
                file.set_api_path(to).await;
            }
            self.by_path.insert(to.to_owned(), id);
        }
        Ok(())
    }

    /// Renames a directory and rewrites every open descendant entry.
    pub async fn rename_directory(&self, from: &str, to: &str) -> ApiResult<()> {
        if self.provider.is_directory(to).await? {
            return Err(ApiError::DirectoryExists);
        }
        if self.provider.is_file(to).await? {
            return Err(ApiError::ItemExists);
        }

        self.provider.rename_directory(from, to).await?;

        let moved: Vec<(String, FileId)> = self
            .by_path
            .iter()
            .filter(|entry| is_ancestor_of(from, entry.key()))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (old_path, id) in moved {
            let new_path = format!("{to}{}", &old_path[from.len()..]);
            self.by_path.remove(&old_path);
            if let Some(file) = self.files.get(&id).map(|entry| Arc::clone(&entry)) {
                file.set_api_path(&new_path).await;
            }
            self.by_path.insert(new_path, id);
        }
        Ok(())
    }

    // --- unlink ---

    /// Removes a file. An open entry switches to its unlink snapshot and the
    /// provider delete waits for the last close.
    pub async fn unlink(&self, api_path: &str) -> ApiResult<()> {
        if self.provider.is_directory(api_path).await? {
            return Err(ApiError::DirectoryExists);
        }

        if let Some((_, id)) = self.by_path.remove(api_path) {
            if let Some(file) = self.files.get(&id).map(|entry| Arc::clone(&entry)) {
                let meta = self.provider.get_item_meta(api_path).await.unwrap_or_default();
                file.mark_unlinked(meta).await;
                self.pending_unlinks.insert(api_path.to_owned(), id);
                if file.handle_count().await == 0 {
                    self.finalize_unlinked(&file).await;
                }
                return Ok(());
            }
        }

        self.provider.remove_file(api_path).await
    }

    // --- reaper ---

    /// Spawns the periodic reaper that retires closable entries.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.chunk_timeout);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if table.stop.is_stopped() {
                    break;
                }
                table.reap().await;
            }
        })
    }

    /// One reaper pass; public so tests and the unmount path can force it.
    /// Closed-but-dirty entries head back to the uploader instead of closing.
    pub async fn reap(&self) {
        for file in self.all_files() {
            if file.handle_count().await == 0
                && file.is_modified().await
                && !file.is_unlinked().await
                && file.error().await.is_none()
                && file.try_claim_upload()
            {
                self.uploader.enqueue(Arc::clone(&file)).await;
                continue;
            }
            if !file.can_close(self.chunk_timeout).await {
                continue;
            }
            self.close_entry(&file).await;
        }
    }

    async fn close_entry(&self, file: &Arc<OpenFile>) {
        let api_path = file.api_path().await;
        debug!(%api_path, "retiring idle open file");

        if file.is_unlinked().await {
            self.finalize_unlinked(file).await;
            return;
        }

        if matches!(self.provider.is_file(&api_path).await, Ok(false)) && !file.is_directory() {
            self.events.raise(Event::FileRemovedExternally {
                api_path: api_path.clone(),
                source_path: file.cache().map(|cache| cache.source_path()).unwrap_or_default(),
            });
        }

        if let Some(cache) = file.cache() {
            let _ = cache.flush().await;
            if cache.is_complete().await {
                // complete source files outlive the entry for cheap reopen
            } else {
                let _ = cache.remove_source().await;
                let mut changes = MetaMap::new();
                changes.insert(META_SOURCE.to_owned(), String::new());
                let _ = self.provider.set_item_meta(&api_path, changes).await;
            }
        }

        self.events.raise(Event::ItemTimeout { api_path: api_path.clone() });
        if self.by_path.get(&api_path).map(|id| *id == file.id()).unwrap_or(false) {
            self.by_path.remove(&api_path);
        }
        self.files.remove(&file.id());
    }

    /// Drops a closed, clean, unpinned entry together with its source file;
    /// the file-level eviction path.
    pub async fn evict_entry(&self, file: &Arc<OpenFile>) -> bool {
        if file.handle_count().await > 0 || file.is_modified().await || file.is_pinned().await {
            return false;
        }

        let api_path = file.api_path().await;
        if let Some(cache) = file.cache() {
            cache.stop_all().await;
            let _ = cache.remove_source().await;
            let mut changes = MetaMap::new();
            changes.insert(META_SOURCE.to_owned(), String::new());
            let _ = self.provider.set_item_meta(&api_path, changes).await;
        }

        if self.by_path.get(&api_path).map(|id| *id == file.id()).unwrap_or(false) {
            self.by_path.remove(&api_path);
        }
        self.files.remove(&file.id());
        true
    }

    /// Unmount teardown: cancel downloads, flush caches, retire everything.
    pub async fn shutdown(&self) {
        for file in self.all_files() {
            if let Some(cache) = file.cache() {
                cache.stop_all().await;
                let _ = cache.flush().await;
            }
        }
        self.reap().await;
    }
}
