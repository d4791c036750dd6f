//! Remote open-handle table.
//!
//! The server tracks every handle a remote client holds, indexed both by
//! handle and by path, so an explicit close, a path removal, or a client
//! disconnect can all release the right resources. Directory iterators are
//! tracked per client alongside.

use std::collections::HashMap;

use tokio::sync::Mutex;

/// Open state for one path, shared by every handle a client has on it.
#[derive(Debug, Clone, Default)]
pub struct OpenInfo {
    pub client_id: String,
    pub api_path: String,
    pub handles: Vec<u64>,
}

#[derive(Debug, Default)]
struct TableState {
    file_lookup: HashMap<String, OpenInfo>,
    handle_lookup: HashMap<u64, String>,
    compat_file_lookup: HashMap<String, OpenInfo>,
    compat_handle_lookup: HashMap<u64, String>,
    directory_lookup: HashMap<String, Vec<u64>>,
}

/// Everything a disconnect has to release, in close order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClientHandles {
    pub files: Vec<u64>,
    pub compat_files: Vec<u64>,
    pub directories: Vec<u64>,
}

/// Process-wide registry of remote opens.
#[derive(Default)]
pub struct RemoteHandleTable {
    state: Mutex<TableState>,
}

impl RemoteHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle for `api_path` owned by `client_id`.
    pub async fn set_open_info(&self, handle: u64, client_id: &str, api_path: &str) {
        let mut state = self.state.lock().await;
        if state.handle_lookup.contains_key(&handle) {
            return;
        }
        let info = state.file_lookup.entry(api_path.to_owned()).or_insert_with(|| OpenInfo {
            client_id: client_id.to_owned(),
            api_path: api_path.to_owned(),
            handles: Vec::new(),
        });
        info.handles.push(handle);
        state.handle_lookup.insert(handle, api_path.to_owned());
    }

    /// Registers a compatibility-layer handle (the POSIX-numeric namespace).
    pub async fn set_compat_open_info(&self, handle: u64, client_id: &str, api_path: &str) {
        let mut state = self.state.lock().await;
        if state.compat_handle_lookup.contains_key(&handle) {
            return;
        }
        let info =
            state.compat_file_lookup.entry(api_path.to_owned()).or_insert_with(|| OpenInfo {
                client_id: client_id.to_owned(),
                api_path: api_path.to_owned(),
                handles: Vec::new(),
            });
        info.handles.push(handle);
        state.compat_handle_lookup.insert(handle, api_path.to_owned());
    }

    pub async fn set_client_id(&self, handle: u64, client_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(path) = state.handle_lookup.get(&handle).cloned() {
            if let Some(info) = state.file_lookup.get_mut(&path) {
                info.client_id = client_id.to_owned();
            }
        }
    }

    pub async fn set_compat_client_id(&self, handle: u64, client_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(path) = state.compat_handle_lookup.get(&handle).cloned() {
            if let Some(info) = state.compat_file_lookup.get_mut(&path) {
                info.client_id = client_id.to_owned();
            }
        }
    }

    pub async fn get_open_path(&self, handle: u64) -> Option<String> {
        self.state.lock().await.handle_lookup.get(&handle).cloned()
    }

    /// Live handles on `api_path`, both namespaces combined.
    pub async fn get_open_file_count(&self, api_path: &str) -> usize {
        let state = self.state.lock().await;
        state.file_lookup.get(api_path).map(|info| info.handles.len()).unwrap_or(0)
            + state.compat_file_lookup.get(api_path).map(|info| info.handles.len()).unwrap_or(0)
    }

    /// Drops one handle; the path entry goes with its last handle.
    pub async fn remove_open_info(&self, handle: u64) -> Option<String> {
        let mut state = self.state.lock().await;
        let path = state.handle_lookup.remove(&handle)?;
        if let Some(info) = state.file_lookup.get_mut(&path) {
            info.handles.retain(|item| *item != handle);
            if info.handles.is_empty() {
                state.file_lookup.remove(&path);
            }
        }
        Some(path)
    }

    pub async fn remove_compat_open_info(&self, handle: u64) -> Option<String> {
        let mut state = self.state.lock().await;
        let path = state.compat_handle_lookup.remove(&handle)?;
        if let Some(info) = state.compat_file_lookup.get_mut(&path) {
            info.handles.retain(|item| *item != handle);
            if info.handles.is_empty() {
                state.compat_file_lookup.remove(&path);
            }
        }
        Some(path)
    }

    /// Drops every handle on `api_path`, both namespaces; returns them for
    /// the caller to close.
    pub async fn remove_all(&self, api_path: &str) -> Vec<u64> {
        let mut state = self.state.lock().await;
        let mut dropped = Vec::new();
        if let Some(info) = state.file_lookup.remove(api_path) {
            for handle in info.handles {
                state.handle_lookup.remove(&handle);
                dropped.push(handle);
            }
        }
        if let Some(info) = state.compat_file_lookup.remove(api_path) {
            for handle in info.handles {
                state.compat_handle_lookup.remove(&handle);
                dropped.push(handle);
            }
        }
        dropped
    }

    // --- directory iterators ---

    pub async fn add_directory(&self, client_id: &str, handle: u64) {
        let mut state = self.state.lock().await;
        let list = state.directory_lookup.entry(client_id.to_owned()).or_default();
        if !list.contains(&handle) {
            list.push(handle);
        }
    }

    pub async fn remove_directory(&self, client_id: &str, handle: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(list) = state.directory_lookup.get_mut(client_id) else {
            return false;
        };
        let found = list.contains(&handle);
        list.retain(|item| *item != handle);
        if list.is_empty() {
            state.directory_lookup.remove(client_id);
        }
        found
    }

    pub async fn has_open_directory(&self, client_id: &str, handle: u64) -> bool {
        let state = self.state.lock().await;
        state
            .directory_lookup
            .get(client_id)
            .map(|list| list.contains(&handle))
            .unwrap_or(false)
    }

    /// Drains everything `client_id` holds, atomically with respect to later
    /// registrations from the same client.
    pub async fn close_all(&self, client_id: &str) -> ClientHandles {
        let mut state = self.state.lock().await;
        let mut drained = ClientHandles::default();

        let file_paths: Vec<String> = state
            .file_lookup
            .iter()
            .filter(|(_, info)| info.client_id == client_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in file_paths {
            if let Some(info) = state.file_lookup.remove(&path) {
                for handle in info.handles {
                    state.handle_lookup.remove(&handle);
                    drained.files.push(handle);
                }
            }
        }

        let compat_paths: Vec<String> = state
            .compat_file_lookup
            .iter()
            .filter(|(_, info)| info.client_id == client_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in compat_paths {
            if let Some(info) = state.compat_file_lookup.remove(&path) {
                for handle in info.handles {
                    state.compat_handle_lookup.remove(&handle);
                    drained.compat_files.push(handle);
                }
            }
        }

        if let Some(dirs) = state.directory_lookup.remove(client_id) {
            drained.directories = dirs;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteHandleTable;

    #[tokio::test]
    async fn handles_index_both_ways() {
        let table = RemoteHandleTable::new();
        table.set_open_info(1, "client-a", "/f.txt").await;
        table.set_open_info(2, "client-a", "/f.txt").await;

        assert_eq!(table.get_open_file_count("/f.txt").await, 2);
        assert_eq!(table.get_open_path(1).await.as_deref(), Some("/f.txt"));

        table.remove_open_info(1).await;
        assert_eq!(table.get_open_file_count("/f.txt").await, 1);
        table.remove_open_info(2).await;
        assert_eq!(table.get_open_file_count("/f.txt").await, 0);
    }

    #[tokio::test]
    async fn remove_all_drops_every_namespace() {
        let table = RemoteHandleTable::new();
        table.set_open_info(1, "client-a", "/f.txt").await;
        table.set_compat_open_info(90, "client-a", "/f.txt").await;

        let mut dropped = table.remove_all("/f.txt").await;
        dropped.sort();
        assert_eq!(dropped, vec![1, 90]);
        assert_eq!(table.get_open_file_count("/f.txt").await, 0);
    }

    #[tokio::test]
    async fn close_all_drains_one_client_only() {
        let table = RemoteHandleTable::new();
        table.set_open_info(1, "client-a", "/a.txt").await;
        table.set_open_info(2, "client-b", "/b.txt").await;
        table.add_directory("client-a", 70).await;

        let drained = table.close_all("client-a").await;
        assert_eq!(drained.files, vec![1]);
        assert_eq!(drained.directories, vec![70]);
        assert!(!table.has_open_directory("client-a", 70).await);
        assert_eq!(table.get_open_file_count("/b.txt").await, 1);
    }
}
