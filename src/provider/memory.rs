//! In-memory provider and meta store.
//!
//! Backs the integration suites and demos: the whole object store lives in
//! process memory while honoring every contract in the trait, including stop
//! polling and the `.`/`..` listing lead.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ApiError, ApiResult};
use crate::meta::{
    check_meta_removal, create_meta, MetaMap, META_PINNED, META_SIZE, META_SOURCE,
};
use crate::path::{create_api_path, get_parent_api_path, is_ancestor_of};
use crate::provider::{MetaStore, Provider};
use crate::types::{now_ns, ApiFile, DirectoryItem, FilesystemItem, StopToken, VolumeInfo};

const STOP_POLL_RANGE: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
struct Entry {
    directory: bool,
    data: Vec<u8>,
}

/// Meta tables kept the way the persistent store keeps them: item meta,
/// pinned flags, sizes, and the reverse source index, updated together.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    state: RwLock<MetaTables>,
}

#[derive(Debug, Default)]
struct MetaTables {
    meta: HashMap<String, MetaMap>,
    pinned: HashMap<String, bool>,
    size: HashMap<String, u64>,
    source: HashMap<String, String>,
}

impl MetaTables {
    fn apply(&mut self, api_path: &str, changes: MetaMap) {
        let entry = self.meta.entry(api_path.to_owned()).or_default();
        for (key, value) in changes {
            if key == META_PINNED {
                self.pinned.insert(api_path.to_owned(), value == "true");
            } else if key == META_SIZE {
                self.size.insert(api_path.to_owned(), value.parse().unwrap_or(0));
            } else if key == META_SOURCE {
                self.source.retain(|_, owner| owner != api_path);
                if !value.is_empty() {
                    self.source.insert(value.clone(), api_path.to_owned());
                }
            }
            entry.insert(key, value);
        }
    }

    fn drop_item(&mut self, api_path: &str) {
        self.meta.remove(api_path);
        self.pinned.remove(api_path);
        self.size.remove(api_path);
        self.source.retain(|_, owner| owner != api_path);
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(meta) = self.meta.remove(from) {
            self.meta.insert(to.to_owned(), meta);
        }
        if let Some(pinned) = self.pinned.remove(from) {
            self.pinned.insert(to.to_owned(), pinned);
        }
        if let Some(size) = self.size.remove(from) {
            self.size.insert(to.to_owned(), size);
        }
        for owner in self.source.values_mut() {
            if owner == from {
                *owner = to.to_owned();
            }
        }
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap> {
        let state = self.state.read().await;
        state.meta.get(api_path).cloned().ok_or(ApiError::ItemNotFound)
    }

    async fn set_item_meta(&self, api_path: &str, changes: MetaMap) -> ApiResult<()> {
        let mut state = self.state.write().await;
        state.apply(api_path, changes);
        Ok(())
    }

    async fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()> {
        check_meta_removal(key)?;
        let mut state = self.state.write().await;
        let entry = state.meta.get_mut(api_path).ok_or(ApiError::ItemNotFound)?;
        entry.remove(key);
        Ok(())
    }

    async fn remove_item(&self, api_path: &str) -> ApiResult<()> {
        let mut state = self.state.write().await;
        state.drop_item(api_path);
        Ok(())
    }

    async fn rename_item_meta(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()> {
        let mut state = self.state.write().await;
        state.rename(from_api_path, to_api_path);
        Ok(())
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .pinned
            .iter()
            .filter(|(_, pinned)| **pinned)
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn get_api_path_from_source(&self, source_path: &str) -> ApiResult<String> {
        let state = self.state.read().await;
        state.source.get(source_path).cloned().ok_or(ApiError::ItemNotFound)
    }
}

/// Whole-store-in-memory [`Provider`].
pub struct MemoryProvider {
    items: RwLock<HashMap<String, Entry>>,
    meta_store: MemoryMetaStore,
    read_only: bool,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_read_only(false)
    }

    pub fn with_read_only(read_only: bool) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            meta_store: MemoryMetaStore::default(),
            read_only,
        }
    }

    /// Seeds the store with the root directory; call once before use.
    pub async fn init(&self) {
        let mut items = self.items.write().await;
        items.entry("/".to_owned()).or_insert(Entry { directory: true, data: Vec::new() });
        drop(items);
        let _ = self
            .meta_store
            .set_item_meta("/", create_meta(true, 0o755, 0, 0, now_ns()))
            .await;
    }

    /// Test helper: drops a file straight into the store with fresh meta.
    pub async fn seed_file(&self, api_path: &str, data: &[u8]) -> ApiResult<()> {
        let api_path = create_api_path(api_path);
        let mut meta = create_meta(false, 0o644, 0, 0, now_ns());
        meta.insert(META_SIZE.to_owned(), data.len().to_string());

        let mut items = self.items.write().await;
        items.insert(api_path.clone(), Entry { directory: false, data: data.to_vec() });
        drop(items);

        self.meta_store.set_item_meta(&api_path, meta).await
    }

    pub fn meta_store(&self) -> &MemoryMetaStore {
        &self.meta_store
    }

    async fn kind_of(&self, api_path: &str) -> Option<bool> {
        let items = self.items.read().await;
        items.get(api_path).map(|entry| entry.directory)
    }

    async fn child_count(&self, api_path: &str) -> u64 {
        let items = self.items.read().await;
        items
            .keys()
            .filter(|path| path.as_str() != "/" && get_parent_api_path(path) == api_path)
            .count() as u64
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn create_directory(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        match self.kind_of(api_path).await {
            Some(true) => return Err(ApiError::DirectoryExists),
            Some(false) => return Err(ApiError::ItemExists),
            None => {}
        }

        let mut items = self.items.write().await;
        items.insert(api_path.to_owned(), Entry { directory: true, data: Vec::new() });
        drop(items);

        self.meta_store.set_item_meta(api_path, meta.clone()).await
    }

    async fn create_file(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        match self.kind_of(api_path).await {
            Some(true) => return Err(ApiError::DirectoryExists),
            Some(false) => return Err(ApiError::ItemExists),
            None => {}
        }

        let mut items = self.items.write().await;
        items.insert(api_path.to_owned(), Entry { directory: false, data: Vec::new() });
        drop(items);

        self.meta_store.set_item_meta(api_path, meta.clone()).await
    }

    async fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        match self.kind_of(api_path).await {
            None => return Err(ApiError::ItemNotFound),
            Some(true) => return Err(ApiError::DirectoryExists),
            Some(false) => {}
        }

        let mut items = self.items.write().await;
        items.remove(api_path);
        drop(items);

        self.meta_store.remove_item(api_path).await
    }

    async fn remove_directory(&self, api_path: &str) -> ApiResult<()> {
        match self.kind_of(api_path).await {
            None => return Err(ApiError::DirectoryNotFound),
            Some(false) => return Err(ApiError::DirectoryExists),
            Some(true) => {}
        }
        if self.child_count(api_path).await > 0 {
            return Err(ApiError::NotEmpty);
        }

        let mut items = self.items.write().await;
        items.remove(api_path);
        drop(items);

        self.meta_store.remove_item(api_path).await
    }

    async fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap> {
        self.meta_store.get_item_meta(api_path).await
    }

    async fn set_item_meta(&self, api_path: &str, changes: MetaMap) -> ApiResult<()> {
        if self.kind_of(api_path).await.is_none() {
            return Err(ApiError::ItemNotFound);
        }
        self.meta_store.set_item_meta(api_path, changes).await
    }

    async fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()> {
        self.meta_store.remove_item_meta(api_path, key).await
    }

    async fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>> {
        match self.kind_of(api_path).await {
            None => return Err(ApiError::DirectoryNotFound),
            Some(false) => return Err(ApiError::DirectoryExists),
            Some(true) => {}
        }

        let mut listing = vec![
            DirectoryItem {
                api_path: ".".to_owned(),
                api_parent: api_path.to_owned(),
                directory: true,
                size: 0,
                meta: MetaMap::new(),
            },
            DirectoryItem {
                api_path: "..".to_owned(),
                api_parent: api_path.to_owned(),
                directory: true,
                size: 0,
                meta: MetaMap::new(),
            },
        ];

        let items = self.items.read().await;
        let mut children: Vec<(String, bool, u64)> = items
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && get_parent_api_path(path) == api_path)
            .map(|(path, entry)| (path.clone(), entry.directory, entry.data.len() as u64))
            .collect();
        drop(items);
        children.sort();

        for (path, directory, size) in children {
            let meta = self.meta_store.get_item_meta(&path).await.unwrap_or_default();
            listing.push(DirectoryItem {
                api_parent: get_parent_api_path(&path),
                api_path: path,
                directory,
                size,
                meta,
            });
        }

        Ok(listing)
    }

    async fn get_directory_item_count(&self, api_path: &str) -> ApiResult<u64> {
        match self.kind_of(api_path).await {
            None => Err(ApiError::DirectoryNotFound),
            Some(false) => Err(ApiError::DirectoryExists),
            Some(true) => Ok(self.child_count(api_path).await),
        }
    }

    async fn get_file(&self, api_path: &str) -> ApiResult<ApiFile> {
        let item = self.get_filesystem_item(api_path, false).await?;
        let meta = self.meta_store.get_item_meta(api_path).await.unwrap_or_default();
        Ok(ApiFile {
            accessed_at: crate::meta::get_meta_u64(&meta, crate::meta::META_ACCESSED),
            changed_at: crate::meta::get_meta_u64(&meta, crate::meta::META_CHANGED),
            created_at: crate::meta::get_meta_u64(&meta, crate::meta::META_CREATION),
            modified_at: crate::meta::get_meta_u64(&meta, crate::meta::META_MODIFIED),
            item,
        })
    }

    async fn get_file_size(&self, api_path: &str) -> ApiResult<u64> {
        let items = self.items.read().await;
        let entry = items.get(api_path).ok_or(ApiError::ItemNotFound)?;
        if entry.directory {
            return Err(ApiError::DirectoryExists);
        }
        Ok(entry.data.len() as u64)
    }

    async fn get_file_list(&self) -> ApiResult<Vec<ApiFile>> {
        let paths: Vec<String> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|(_, entry)| !entry.directory)
                .map(|(path, _)| path.clone())
                .collect()
        };

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(self.get_file(&path).await?);
        }
        Ok(files)
    }

    async fn get_filesystem_item(
        &self,
        api_path: &str,
        directory: bool,
    ) -> ApiResult<FilesystemItem> {
        let items = self.items.read().await;
        let entry = items.get(api_path).ok_or(if directory {
            ApiError::DirectoryNotFound
        } else {
            ApiError::ItemNotFound
        })?;
        if entry.directory != directory {
            return Err(ApiError::DirectoryExists);
        }

        let meta = self.meta_store.get_item_meta(api_path).await.unwrap_or_default();
        Ok(FilesystemItem {
            api_path: api_path.to_owned(),
            api_parent: get_parent_api_path(api_path),
            directory: entry.directory,
            size: if entry.directory { 0 } else { entry.data.len() as u64 },
            source_path: meta.get(META_SOURCE).cloned().unwrap_or_default(),
        })
    }

    async fn is_file(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.kind_of(api_path).await == Some(false))
    }

    async fn is_directory(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self.kind_of(api_path).await == Some(true))
    }

    async fn read_file_bytes(
        &self,
        api_path: &str,
        size: usize,
        offset: u64,
        data: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        data.clear();

        let items = self.items.read().await;
        let entry = items.get(api_path).ok_or(ApiError::ItemNotFound)?;
        if entry.directory {
            return Err(ApiError::DirectoryExists);
        }

        let start = (offset as usize).min(entry.data.len());
        let end = start.saturating_add(size).min(entry.data.len());

        let mut cursor = start;
        while cursor < end {
            if stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            let next = (cursor + STOP_POLL_RANGE).min(end);
            data.extend_from_slice(&entry.data[cursor..next]);
            cursor = next;
        }

        Ok(())
    }

    async fn upload_file(
        &self,
        api_path: &str,
        source_path: &str,
        stop: &StopToken,
    ) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }

        let bytes = tokio::fs::read(source_path).await?;

        let mut items = self.items.write().await;
        let entry = items.get_mut(api_path).ok_or(ApiError::ItemNotFound)?;
        if entry.directory {
            return Err(ApiError::DirectoryExists);
        }
        let size = bytes.len() as u64;
        entry.data = bytes;
        drop(items);

        let mut changes = MetaMap::new();
        changes.insert(META_SIZE.to_owned(), size.to_string());
        changes.insert(META_SOURCE.to_owned(), source_path.to_owned());
        self.meta_store.set_item_meta(api_path, changes).await
    }

    async fn rename_file(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()> {
        let mut items = self.items.write().await;
        let entry = items.remove(from_api_path).ok_or(ApiError::ItemNotFound)?;
        if entry.directory {
            items.insert(from_api_path.to_owned(), entry);
            return Err(ApiError::DirectoryExists);
        }
        items.insert(to_api_path.to_owned(), entry);
        drop(items);

        self.meta_store.rename_item_meta(from_api_path, to_api_path).await
    }

    async fn rename_directory(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()> {
        let mut items = self.items.write().await;
        if !items.get(from_api_path).map(|entry| entry.directory).unwrap_or(false) {
            return Err(ApiError::DirectoryNotFound);
        }

        let moved: Vec<String> = items
            .keys()
            .filter(|path| is_ancestor_of(from_api_path, path))
            .cloned()
            .collect();
        let mut renames = Vec::with_capacity(moved.len());
        for path in moved {
            let entry = items.remove(&path).unwrap_or_default();
            let suffix = &path[from_api_path.len()..];
            let target = format!("{to_api_path}{suffix}");
            items.insert(target.clone(), entry);
            renames.push((path, target));
        }
        drop(items);

        for (from, to) in renames {
            self.meta_store.rename_item_meta(&from, &to).await?;
        }
        Ok(())
    }

    async fn get_volume_info(&self) -> VolumeInfo {
        let items = self.items.read().await;
        let used: u64 = items.values().map(|entry| entry.data.len() as u64).sum();
        let total = 1u64 << 40;
        VolumeInfo {
            total_bytes: total,
            free_bytes: total.saturating_sub(used),
            used_bytes: used,
            total_items: items.len() as u64,
        }
    }
}
