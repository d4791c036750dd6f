//! Provider and metadata-store interfaces the core consumes.
//!
//! Concrete object-store drivers live outside the core; everything here is
//! the narrow contract they implement. [`memory::MemoryProvider`] backs the
//! test suites.

pub mod memory;

use async_trait::async_trait;

use crate::error::ApiResult;
use crate::meta::MetaMap;
use crate::types::{ApiFile, DirectoryItem, FilesystemItem, StopToken, VolumeInfo};

/// Object-store surface the mount drives.
#[async_trait]
pub trait Provider: Send + Sync {
    fn is_read_only(&self) -> bool;

    async fn create_directory(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()>;

    async fn create_file(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()>;

    async fn remove_file(&self, api_path: &str) -> ApiResult<()>;

    async fn remove_directory(&self, api_path: &str) -> ApiResult<()>;

    async fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap>;

    /// Merges `changes` into the item meta; atomic across the backing tables.
    async fn set_item_meta(&self, api_path: &str, changes: MetaMap) -> ApiResult<()>;

    /// Deletes one meta key. Reserved keys refuse with `PermissionDenied`.
    async fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()>;

    /// Listing always leads with `.` and `..` directory entries.
    async fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>>;

    async fn get_directory_item_count(&self, api_path: &str) -> ApiResult<u64>;

    async fn get_file(&self, api_path: &str) -> ApiResult<ApiFile>;

    async fn get_file_size(&self, api_path: &str) -> ApiResult<u64>;

    async fn get_file_list(&self) -> ApiResult<Vec<ApiFile>>;

    async fn get_filesystem_item(&self, api_path: &str, directory: bool)
        -> ApiResult<FilesystemItem>;

    async fn is_file(&self, api_path: &str) -> ApiResult<bool>;

    async fn is_directory(&self, api_path: &str) -> ApiResult<bool>;

    /// Reads `size` bytes at `offset` into `data`, honoring `stop` between
    /// ranges; a canceled read returns `DownloadStopped`.
    async fn read_file_bytes(
        &self,
        api_path: &str,
        size: usize,
        offset: u64,
        data: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()>;

    /// Streams the local source file back to the store. Idempotent retry
    /// target.
    async fn upload_file(&self, api_path: &str, source_path: &str, stop: &StopToken)
        -> ApiResult<()>;

    async fn rename_file(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()>;

    async fn rename_directory(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()>;

    async fn get_volume_info(&self) -> VolumeInfo;
}

/// Transactional key-value store behind item metadata. Four logical tables:
/// `meta`, `pinned`, `size`, and the reverse `source` index.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap>;

    async fn set_item_meta(&self, api_path: &str, changes: MetaMap) -> ApiResult<()>;

    async fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()>;

    async fn remove_item(&self, api_path: &str) -> ApiResult<()>;

    async fn rename_item_meta(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()>;

    /// Api paths currently pinned.
    async fn get_pinned_files(&self) -> ApiResult<Vec<String>>;

    /// Reverse lookup over the `source` table.
    async fn get_api_path_from_source(&self, source_path: &str) -> ApiResult<String>;
}
