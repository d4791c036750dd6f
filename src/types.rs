//! Core data model shared by the drive, cache, and remote layers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::meta::MetaMap;

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_nanos() as u64)
        .unwrap_or(0)
}

/// Identity of one filesystem item as the core tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilesystemItem {
    /// Canonical api path.
    pub api_path: String,
    /// Parent api path, always `parent(api_path)`.
    pub api_parent: String,
    /// Directories have `size == 0` and an empty `source_path`.
    pub directory: bool,
    pub size: u64,
    /// Local sparse cache file; nonempty iff the file was ever materialized.
    pub source_path: String,
}

/// [`FilesystemItem`] plus the four stat timestamps, in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiFile {
    pub item: FilesystemItem,
    pub accessed_at: u64,
    pub changed_at: u64,
    pub created_at: u64,
    pub modified_at: u64,
}

/// One directory listing entry; serialized to JSON for remote paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryItem {
    pub api_path: String,
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    #[serde(default)]
    pub meta: MetaMap,
}

const ACCESS_MODE_MASK: u32 = 0o3;
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

/// Open flags carried per handle, kept as the raw POSIX bit pattern so they
/// survive the wire unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0);
    pub const WRITE: OpenFlags = OpenFlags(O_WRONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(O_RDWR);

    pub fn write_allowed(self) -> bool {
        matches!(self.0 & ACCESS_MODE_MASK, O_WRONLY | O_RDWR)
    }

    pub fn read_allowed(self) -> bool {
        self.0 & ACCESS_MODE_MASK != O_WRONLY
    }

    pub fn append(self) -> bool {
        self.0 & O_APPEND != 0
    }

    pub fn create(self) -> bool {
        self.0 & O_CREAT != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & O_EXCL != 0
    }

    pub fn truncate(self) -> bool {
        self.0 & O_TRUNC != 0
    }

    pub fn with_append(self) -> OpenFlags {
        OpenFlags(self.0 | O_APPEND)
    }

    pub fn with_create(self) -> OpenFlags {
        OpenFlags(self.0 | O_CREAT)
    }

    pub fn with_exclusive(self) -> OpenFlags {
        OpenFlags(self.0 | O_EXCL)
    }

    pub fn with_truncate(self) -> OpenFlags {
        OpenFlags(self.0 | O_TRUNC)
    }
}

/// Fixed-layout stat record exchanged with the kernel bridge and the remote
/// wire. Timestamps are nanoseconds since the epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct UnixStat {
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_atimespec: u64,
    pub st_mtimespec: u64,
    pub st_ctimespec: u64,
    pub st_birthtimespec: u64,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_flags: u32,
}

/// Cooperative cancellation flag shared between long-running operations and
/// the unmount path. Providers poll it on byte-range boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Aggregated volume numbers reported by `statfs`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub total_items: u64,
}

#[cfg(test)]
mod tests {
    use super::OpenFlags;

    #[test]
    fn access_modes() {
        assert!(OpenFlags::READ.read_allowed());
        assert!(!OpenFlags::READ.write_allowed());
        assert!(OpenFlags::WRITE.write_allowed());
        assert!(!OpenFlags::WRITE.read_allowed());
        assert!(OpenFlags::READ_WRITE.read_allowed());
        assert!(OpenFlags::READ_WRITE.write_allowed());
    }

    #[test]
    fn modifier_bits() {
        let flags = OpenFlags::WRITE.with_append().with_create();
        assert!(flags.append());
        assert!(flags.create());
        assert!(!flags.exclusive());
        assert!(!flags.truncate());
    }
}
