//! Advisory mount lock.
//!
//! One `mount.lock` file under the data directory records whether a mount is
//! active, where, and under which pid. State changes go through an atomic
//! temp-file rename so readers never observe a torn record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

const LOCK_FILE_NAME: &str = "mount.lock";

/// Persisted mount state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MountState {
    pub active: bool,
    pub location: String,
    pub pid: u32,
}

/// Handle over the advisory lock file.
pub struct MountLock {
    path: PathBuf,
}

impl MountLock {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: data_dir.join(LOCK_FILE_NAME) }
    }

    pub async fn read_state(&self) -> ApiResult<MountState> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|_| ApiError::Error),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MountState::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Records the mount state atomically; idempotent.
    pub async fn set_mount_state(
        &self,
        active: bool,
        location: &str,
        pid: u32,
    ) -> ApiResult<()> {
        let state = MountState { active, location: location.to_owned(), pid };
        if self.read_state().await.unwrap_or_default() == state {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec(&state).map_err(|_| ApiError::Error)?;
        let tmp = self.path.with_extension("lock.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
