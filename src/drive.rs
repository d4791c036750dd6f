//! Mount dispatcher.
//!
//! Translates every logical filesystem call coming from the kernel bridge
//! (or, server side, from the remote RPC dispatcher) into operations on the
//! open-file table, the chunk caches, the directory cache, and the provider.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::MountConfig;
use crate::dirs::DirectoryCache;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::files::evict::EvictionEngine;
use crate::files::table::OpenFileTable;
use crate::files::upload::Uploader;
use crate::lock::MountLock;
use crate::meta::{
    create_meta, get_meta_bool, get_meta_u32, get_meta_u64, MetaMap, META_ACCESSED, META_BACKUP,
    META_CHANGED, META_CREATION, META_GID, META_MODE, META_MODIFIED, META_PINNED, META_UID,
};
use crate::path::get_parent_api_path;
use crate::provider::Provider;
use crate::types::{now_ns, DirectoryItem, OpenFlags, StopToken, UnixStat, VolumeInfo};

pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;
pub const F_OK: u32 = 0;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// How long a timed-out unmount waits before escalating.
pub const UNMOUNT_GRACE: Duration = Duration::from_secs(30);

/// Effective identity of the caller, as the kernel bridge reports it.
#[derive(Debug, Copy, Clone, Default)]
pub struct CallerContext {
    pub uid: u32,
    pub gid: u32,
}

/// The drive core: open-file table, caches, write-back, and eviction wired
/// to one provider.
pub struct MountDispatcher {
    provider: Arc<dyn Provider>,
    table: Arc<OpenFileTable>,
    dirs: DirectoryCache,
    events: EventSink,
    stop: StopToken,
    forced_uid: Option<u32>,
    forced_gid: Option<u32>,
    forced_umask: Option<u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl MountDispatcher {
    /// Wires the core together and spawns the reaper, uploader, and eviction
    /// tasks.
    pub fn new(provider: Arc<dyn Provider>, config: &MountConfig, events: EventSink) -> Arc<Self> {
        let stop = StopToken::new();

        let (upload_queue, upload_task) =
            Uploader::spawn(Arc::clone(&provider), events.clone(), stop.clone());

        let table = Arc::new(OpenFileTable::new(
            Arc::clone(&provider),
            upload_queue,
            config,
            events.clone(),
            stop.clone(),
        ));
        let reaper_task = table.spawn_reaper();

        let evictor = EvictionEngine::new(
            Arc::clone(&table),
            config.cache_budget_bytes,
            Duration::from_secs(config.chunk_timeout_secs),
            stop.clone(),
        );
        let evict_task = evictor.spawn();

        Arc::new(Self {
            provider,
            table,
            dirs: DirectoryCache::new(),
            events,
            stop,
            forced_uid: config.forced_uid,
            forced_gid: config.forced_gid,
            forced_umask: config.forced_umask,
            tasks: vec![upload_task, reaper_task, evict_task],
        })
    }

    pub fn table(&self) -> &Arc<OpenFileTable> {
        &self.table
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    // --- stat helpers ---

    fn stat_from_meta(&self, meta: &MetaMap, size: u64, directory: bool, nlink: u32) -> UnixStat {
        let mode = get_meta_u32(meta, META_MODE);
        UnixStat {
            st_mode: mode | if directory { S_IFDIR } else { S_IFREG },
            st_nlink: nlink,
            st_uid: self.forced_uid.unwrap_or_else(|| get_meta_u32(meta, META_UID)),
            st_gid: self.forced_gid.unwrap_or_else(|| get_meta_u32(meta, META_GID)),
            st_size: size,
            st_atimespec: get_meta_u64(meta, META_ACCESSED),
            st_mtimespec: get_meta_u64(meta, META_MODIFIED),
            st_ctimespec: get_meta_u64(meta, META_CHANGED),
            st_birthtimespec: get_meta_u64(meta, META_CREATION),
            st_blksize: 4096,
            st_blocks: size.div_ceil(512),
            st_flags: 0,
        }
    }

    /// Stored-mode access evaluation: root bypasses, forced ids override,
    /// class bits select on effective uid/gid.
    pub async fn access(&self, ctx: CallerContext, api_path: &str, mask: u32) -> ApiResult<()> {
        let directory = self.provider.is_directory(api_path).await?;
        if !directory && !self.provider.is_file(api_path).await? {
            return Err(ApiError::ItemNotFound);
        }
        if mask == F_OK || ctx.uid == 0 {
            return Ok(());
        }

        let meta = self.provider.get_item_meta(api_path).await?;
        let uid = self.forced_uid.unwrap_or_else(|| get_meta_u32(&meta, META_UID));
        let gid = self.forced_gid.unwrap_or_else(|| get_meta_u32(&meta, META_GID));
        let mut mode = get_meta_u32(&meta, META_MODE);
        if let Some(umask) = self.forced_umask {
            mode &= !umask;
        }

        let granted = if ctx.uid == uid {
            (mode >> 6) & 0o7
        } else if ctx.gid == gid {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        };

        if mask & !granted != 0 {
            return Err(ApiError::PermissionDenied);
        }
        Ok(())
    }

    /// Path-based stat. An open unlinked file reports its captured snapshot
    /// through `fgetattr`; by path it is already gone.
    pub async fn getattr(&self, api_path: &str) -> ApiResult<(UnixStat, bool)> {
        if let Some(file) = self.table.get_open_file_by_path(api_path) {
            let meta = self.provider.get_item_meta(api_path).await.unwrap_or_default();
            let size = file.file_size().await;
            let directory = file.is_directory();
            return Ok((self.stat_from_meta(&meta, size, directory, if directory { 2 } else { 1 }), directory));
        }

        let directory = self.provider.is_directory(api_path).await?;
        if !directory && !self.provider.is_file(api_path).await? {
            return Err(ApiError::ItemNotFound);
        }
        let meta = self.provider.get_item_meta(api_path).await?;
        let size =
            if directory { 0 } else { self.provider.get_file_size(api_path).await.unwrap_or(0) };
        Ok((self.stat_from_meta(&meta, size, directory, if directory { 2 } else { 1 }), directory))
    }

    /// Handle-based stat; serves the unlink snapshot with a zero link count.
    pub async fn fgetattr(&self, handle: u64) -> ApiResult<(UnixStat, bool)> {
        let file = self.table.get_open_file(handle)?;
        let directory = file.is_directory();
        let size = file.file_size().await;

        if file.is_unlinked().await {
            let meta = file.unlinked_meta().await.unwrap_or_default();
            return Ok((self.stat_from_meta(&meta, size, directory, 0), directory));
        }

        let api_path = file.api_path().await;
        let meta = self.provider.get_item_meta(&api_path).await.unwrap_or_default();
        Ok((self.stat_from_meta(&meta, size, directory, if directory { 2 } else { 1 }), directory))
    }

    // --- directory structure ---

    pub async fn mkdir(&self, ctx: CallerContext, api_path: &str, mode: u32) -> ApiResult<()> {
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }
        let parent = get_parent_api_path(api_path);
        if !self.provider.is_directory(&parent).await? {
            return Err(ApiError::DirectoryNotFound);
        }
        let meta = create_meta(true, self.apply_umask(mode), ctx.uid, ctx.gid, now_ns());
        self.provider.create_directory(api_path, &meta).await
    }

    pub async fn rmdir(&self, api_path: &str) -> ApiResult<()> {
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }
        self.provider.remove_directory(api_path).await?;
        self.dirs.release_path(api_path).await;
        Ok(())
    }

    fn apply_umask(&self, mode: u32) -> u32 {
        match self.forced_umask {
            Some(umask) => mode & !umask,
            None => mode,
        }
    }

    // --- open / create / close ---

    pub async fn create(
        &self,
        ctx: CallerContext,
        api_path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> ApiResult<u64> {
        let meta = create_meta(false, self.apply_umask(mode), ctx.uid, ctx.gid, now_ns());
        let (handle, file) = self.table.create(api_path, meta, flags).await?;
        if flags.truncate() {
            file.resize(0).await?;
        }
        Ok(handle)
    }

    pub async fn open(&self, api_path: &str, flags: OpenFlags) -> ApiResult<u64> {
        let (handle, file) = self.table.open(api_path, false, flags).await?;
        if flags.truncate() && flags.write_allowed() {
            file.resize(0).await?;
        }
        Ok(handle)
    }

    pub async fn release(&self, handle: u64) -> ApiResult<()> {
        self.table.close(handle).await
    }

    // --- data path ---

    pub async fn read(&self, handle: u64, size: usize, offset: u64) -> ApiResult<Vec<u8>> {
        let file = self.table.get_open_file(handle)?;
        file.read(handle, size, offset).await
    }

    pub async fn write(&self, handle: u64, data: &[u8], offset: u64) -> ApiResult<usize> {
        if self.stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }
        let file = self.table.get_open_file(handle)?;
        file.write(handle, offset, data).await
    }

    pub async fn fsync(&self, handle: u64) -> ApiResult<()> {
        let file = self.table.get_open_file(handle)?;
        match file.cache() {
            Some(cache) => cache.flush().await,
            None => Ok(()),
        }
    }

    pub async fn truncate(&self, api_path: &str, size: u64) -> ApiResult<()> {
        if let Some(file) = self.table.get_open_file_by_path(api_path) {
            return file.resize(size).await;
        }
        let handle = self.open(api_path, OpenFlags::READ_WRITE).await?;
        let result = self.ftruncate(handle, size).await;
        let _ = self.release(handle).await;
        result
    }

    pub async fn ftruncate(&self, handle: u64, size: u64) -> ApiResult<()> {
        let file = self.table.get_open_file(handle)?;
        file.resize(size).await
    }

    // --- namespace ---

    pub async fn rename(&self, from: &str, to: &str, replace_if_exists: bool) -> ApiResult<()> {
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }
        if self.provider.is_directory(from).await? {
            self.table.rename_directory(from, to).await
        } else if self.provider.is_file(from).await? {
            self.table.rename_file(from, to, replace_if_exists).await
        } else {
            Err(ApiError::ItemNotFound)
        }
    }

    pub async fn unlink(&self, api_path: &str) -> ApiResult<()> {
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }
        self.table.unlink(api_path).await
    }

    pub async fn statfs(&self) -> VolumeInfo {
        self.provider.get_volume_info().await
    }

    // --- directories ---

    pub async fn opendir(&self, api_path: &str, client_id: Option<String>) -> ApiResult<u64> {
        let items = self.provider.get_directory_items(api_path).await?;
        Ok(self.dirs.open_directory(api_path, items, client_id).await)
    }

    pub async fn readdir(&self, handle: u64, offset: usize) -> ApiResult<DirectoryItem> {
        self.dirs.get_item(handle, offset).await
    }

    pub async fn readdir_page_json(&self, handle: u64, page: usize) -> ApiResult<String> {
        self.dirs.get_page_json(handle, page).await
    }

    pub async fn releasedir(&self, handle: u64) -> ApiResult<()> {
        self.dirs.release(handle).await
    }

    pub async fn has_open_directory(&self, handle: u64) -> bool {
        self.dirs.has_handle(handle).await
    }

    pub fn directory_cache(&self) -> &DirectoryCache {
        &self.dirs
    }

    // --- metadata ---

    pub async fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap> {
        if let Some(file) = self.table.get_open_file_by_path(api_path) {
            if file.is_unlinked().await {
                return file.unlinked_meta().await.ok_or(ApiError::ItemNotFound);
            }
        }
        self.provider.get_item_meta(api_path).await
    }

    pub async fn set_item_meta(&self, api_path: &str, changes: MetaMap) -> ApiResult<()> {
        let pinned = changes.get(META_PINNED).map(|value| value == "true");
        self.provider.set_item_meta(api_path, changes).await?;

        if let Some(pinned) = pinned {
            if let Some(file) = self.table.get_open_file_by_path(api_path) {
                file.set_pinned(pinned).await;
            }
        }
        Ok(())
    }

    pub async fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()> {
        self.provider.remove_item_meta(api_path, key).await
    }

    pub async fn is_pinned(&self, api_path: &str) -> ApiResult<bool> {
        let meta = self.get_item_meta(api_path).await?;
        Ok(get_meta_bool(&meta, META_PINNED))
    }

    // --- posix extended timestamps ---

    pub async fn setbkuptime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time_meta(api_path, META_BACKUP, ns).await
    }

    pub async fn setchgtime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time_meta(api_path, META_CHANGED, ns).await
    }

    pub async fn setcrtime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time_meta(api_path, META_CREATION, ns).await
    }

    /// Returns `(backup, creation)` in nanoseconds.
    pub async fn getxtimes(&self, api_path: &str) -> ApiResult<(u64, u64)> {
        let meta = self.get_item_meta(api_path).await?;
        Ok((get_meta_u64(&meta, META_BACKUP), get_meta_u64(&meta, META_CREATION)))
    }

    async fn set_time_meta(&self, api_path: &str, key: &str, ns: u64) -> ApiResult<()> {
        let mut changes = MetaMap::new();
        changes.insert(key.to_owned(), ns.to_string());
        self.provider.set_item_meta(api_path, changes).await
    }

    // --- xattr (stubbed) ---

    pub async fn getxattr(&self, _api_path: &str, _name: &str) -> ApiResult<Vec<u8>> {
        Err(ApiError::NotSupported)
    }

    pub async fn setxattr(&self, _api_path: &str, _name: &str, _value: &[u8]) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    pub async fn listxattr(&self, _api_path: &str) -> ApiResult<Vec<String>> {
        Err(ApiError::NotSupported)
    }

    pub async fn removexattr(&self, _api_path: &str, _name: &str) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    // --- winfsp surface (POSIX host stubs) ---

    pub async fn winfsp_can_delete(&self, _handle: u64, _api_path: &str) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_cleanup(
        &self,
        _handle: u64,
        _flags: u32,
        was_deleted: &mut bool,
    ) -> ApiResult<()> {
        *was_deleted = false;
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_get_security_by_name(&self, _api_path: &str) -> ApiResult<(String, u32)> {
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_set_basic_info(&self, _handle: u64, _attributes: u32) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_set_file_size(&self, _handle: u64, _size: u64) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_overwrite(&self, _handle: u64) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    pub async fn winfsp_get_volume_info(&self) -> ApiResult<VolumeInfo> {
        Err(ApiError::NotSupported)
    }

    // --- lifecycle ---

    /// Records the mount as active in the advisory lock and announces the
    /// outcome.
    pub async fn mounted(&self, data_dir: &Path, location: &str) -> ApiResult<()> {
        let lock = MountLock::new(data_dir);
        match lock.set_mount_state(true, location, std::process::id()).await {
            Ok(()) => {
                self.events.raise(Event::DriveMountResult {
                    location: location.to_owned(),
                    result: "success".to_owned(),
                });
                Ok(())
            }
            Err(err) => {
                self.events.raise(Event::DriveMountFailed {
                    location: location.to_owned(),
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Clears the advisory lock after [`MountDispatcher::shutdown`].
    pub async fn unmounted(&self, data_dir: &Path, location: &str) -> ApiResult<()> {
        MountLock::new(data_dir).set_mount_state(false, location, std::process::id()).await
    }

    /// Unmount: signal cancellation, wait out the grace period, escalate on
    /// timeout. Always completes.
    pub async fn shutdown(&self, location: &str) {
        self.events.raise(Event::UnmountRequested);
        self.events.raise(Event::DriveUnmountPending { location: location.to_owned() });
        self.stop.stop();

        let table = Arc::clone(&self.table);
        if tokio::time::timeout(UNMOUNT_GRACE, table.shutdown()).await.is_err() {
            self.events.raise(Event::DriveStopTimedOut { location: location.to_owned() });
        }

        for task in &self.tasks {
            task.abort();
        }
        debug!(%location, "drive dispatcher stopped");
    }
}
