//! Directory iterator cache.
//!
//! `opendir` snapshots a listing into a handle-keyed entry; later reads page
//! through the snapshot without observing concurrent mutations. Remote
//! handles remember their owning client so a disconnect can drop them in
//! bulk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::error::{ApiError, ApiResult};
use crate::types::DirectoryItem;

/// Entries per JSON page served to remote readers.
pub const DIRECTORY_PAGE_SIZE: usize = 100;

struct DirSnapshot {
    api_path: String,
    client_id: Option<String>,
    items: Vec<DirectoryItem>,
}

/// Handle-keyed snapshots of directory listings.
#[derive(Default)]
pub struct DirectoryCache {
    lookup: Mutex<HashMap<u64, DirSnapshot>>,
    next_handle: AtomicU64,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot and returns its monotonic handle.
    pub async fn open_directory(
        &self,
        api_path: &str,
        items: Vec<DirectoryItem>,
        client_id: Option<String>,
    ) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let mut lookup = self.lookup.lock().await;
        lookup.insert(
            handle,
            DirSnapshot { api_path: api_path.to_owned(), client_id, items },
        );
        handle
    }

    /// One entry at `offset`, or `ItemNotFound` past the end.
    pub async fn get_item(&self, handle: u64, offset: usize) -> ApiResult<DirectoryItem> {
        let lookup = self.lookup.lock().await;
        let snapshot = lookup.get(&handle).ok_or(ApiError::BadFileDescriptor)?;
        snapshot.items.get(offset).cloned().ok_or(ApiError::ItemNotFound)
    }

    pub async fn item_count(&self, handle: u64) -> ApiResult<usize> {
        let lookup = self.lookup.lock().await;
        let snapshot = lookup.get(&handle).ok_or(ApiError::BadFileDescriptor)?;
        Ok(snapshot.items.len())
    }

    /// One page of [`DIRECTORY_PAGE_SIZE`] entries as a JSON array, for the
    /// remote paged variant.
    pub async fn get_page_json(&self, handle: u64, page: usize) -> ApiResult<String> {
        let lookup = self.lookup.lock().await;
        let snapshot = lookup.get(&handle).ok_or(ApiError::BadFileDescriptor)?;

        let start = page * DIRECTORY_PAGE_SIZE;
        let end = (start + DIRECTORY_PAGE_SIZE).min(snapshot.items.len());
        let slice: &[DirectoryItem] =
            if start >= snapshot.items.len() { &[] } else { &snapshot.items[start..end] };
        serde_json::to_string(slice).map_err(|_| ApiError::Error)
    }

    pub async fn release(&self, handle: u64) -> ApiResult<()> {
        let mut lookup = self.lookup.lock().await;
        lookup.remove(&handle).map(|_| ()).ok_or(ApiError::BadFileDescriptor)
    }

    pub async fn has_handle(&self, handle: u64) -> bool {
        self.lookup.lock().await.contains_key(&handle)
    }

    /// Drops every snapshot a disconnected client still holds.
    pub async fn release_client(&self, client_id: &str) {
        let mut lookup = self.lookup.lock().await;
        lookup.retain(|_, snapshot| snapshot.client_id.as_deref() != Some(client_id));
    }

    /// Drops every snapshot of one directory, for path removal.
    pub async fn release_path(&self, api_path: &str) {
        let mut lookup = self.lookup.lock().await;
        lookup.retain(|_, snapshot| snapshot.api_path != api_path);
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryCache, DIRECTORY_PAGE_SIZE};
    use crate::error::ApiError;
    use crate::types::DirectoryItem;

    fn item(name: &str) -> DirectoryItem {
        DirectoryItem {
            api_path: format!("/dir/{name}"),
            api_parent: "/dir".to_owned(),
            directory: false,
            size: 0,
            meta: Default::default(),
        }
    }

    #[tokio::test]
    async fn snapshots_are_stable_and_paged() {
        let cache = DirectoryCache::new();
        let items: Vec<_> = (0..250).map(|idx| item(&idx.to_string())).collect();
        let handle = cache.open_directory("/dir", items, None).await;

        assert_eq!(cache.item_count(handle).await.unwrap(), 250);
        assert_eq!(cache.get_item(handle, 0).await.unwrap().api_path, "/dir/0");

        let page: Vec<DirectoryItem> =
            serde_json::from_str(&cache.get_page_json(handle, 2).await.unwrap()).unwrap();
        assert_eq!(page.len(), 250 - 2 * DIRECTORY_PAGE_SIZE);

        let empty: Vec<DirectoryItem> =
            serde_json::from_str(&cache.get_page_json(handle, 9).await.unwrap()).unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn missing_handle_is_bad_descriptor() {
        let cache = DirectoryCache::new();
        assert_eq!(cache.get_item(77, 0).await, Err(ApiError::BadFileDescriptor));
        assert_eq!(cache.release(77).await, Err(ApiError::BadFileDescriptor));
    }

    #[tokio::test]
    async fn client_release_drops_only_that_client() {
        let cache = DirectoryCache::new();
        let mine = cache
            .open_directory("/dir", vec![item("a")], Some("client-a".to_owned()))
            .await;
        let theirs = cache
            .open_directory("/dir", vec![item("b")], Some("client-b".to_owned()))
            .await;

        cache.release_client("client-a").await;
        assert!(!cache.has_handle(mine).await);
        assert!(cache.has_handle(theirs).await);
    }
}
