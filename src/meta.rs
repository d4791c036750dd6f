//! Item metadata keys and accessors.
//!
//! Every filesystem item carries an unordered string map. A fixed set of
//! reserved keys drives stat reporting, pinning, and the write-back path;
//! anything else is a user extended attribute stored under a Base64-encoded
//! key.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{ApiError, ApiResult};

pub const META_ACCESSED: &str = "accessed";
pub const META_ATTRIBUTES: &str = "attributes";
pub const META_BACKUP: &str = "backup";
pub const META_CHANGED: &str = "changed";
pub const META_CREATION: &str = "creation";
pub const META_DIRECTORY: &str = "directory";
pub const META_GID: &str = "gid";
pub const META_KEY: &str = "key";
pub const META_MODIFIED: &str = "modified";
pub const META_MODE: &str = "mode";
pub const META_OSXFLAGS: &str = "osx_flags";
pub const META_PINNED: &str = "pinned";
pub const META_SIZE: &str = "size";
pub const META_SOURCE: &str = "source";
pub const META_UID: &str = "uid";
pub const META_WRITTEN: &str = "written";

/// Reserved keys; removal through the meta interface is forbidden.
pub const META_USED_NAMES: [&str; 16] = [
    META_ACCESSED,
    META_ATTRIBUTES,
    META_BACKUP,
    META_CHANGED,
    META_CREATION,
    META_DIRECTORY,
    META_GID,
    META_KEY,
    META_MODIFIED,
    META_MODE,
    META_OSXFLAGS,
    META_PINNED,
    META_SIZE,
    META_SOURCE,
    META_UID,
    META_WRITTEN,
];

/// Unordered key/value metadata for one item.
pub type MetaMap = HashMap<String, String>;

/// `true` for keys the core owns.
pub fn is_reserved_meta(key: &str) -> bool {
    META_USED_NAMES.contains(&key)
}

/// Key under which a user extended attribute is stored.
pub fn xattr_meta_key(name: &str) -> String {
    BASE64.encode(name.as_bytes())
}

/// Reverses [`xattr_meta_key`]; `None` for reserved or non-Base64 keys.
pub fn xattr_name_of(meta_key: &str) -> Option<String> {
    if is_reserved_meta(meta_key) {
        return None;
    }
    let bytes = BASE64.decode(meta_key).ok()?;
    String::from_utf8(bytes).ok()
}

/// Reads a `u64`-valued reserved key, defaulting to zero when absent or
/// unparsable.
pub fn get_meta_u64(meta: &MetaMap, key: &str) -> u64 {
    meta.get(key).and_then(|val| val.parse().ok()).unwrap_or(0)
}

/// Reads a `u32`-valued reserved key, defaulting to zero.
pub fn get_meta_u32(meta: &MetaMap, key: &str) -> u32 {
    meta.get(key).and_then(|val| val.parse().ok()).unwrap_or(0)
}

/// Reads a boolean reserved key; only the literal `"true"` is truthy.
pub fn get_meta_bool(meta: &MetaMap, key: &str) -> bool {
    meta.get(key).map(|val| val == "true").unwrap_or(false)
}

/// Rejects attempts to delete reserved keys.
pub fn check_meta_removal(key: &str) -> ApiResult<()> {
    if is_reserved_meta(key) {
        return Err(ApiError::PermissionDenied);
    }
    Ok(())
}

/// Builds the initial meta for a newly created item.
pub fn create_meta(directory: bool, mode: u32, uid: u32, gid: u32, now_ns: u64) -> MetaMap {
    let mut meta = MetaMap::new();
    meta.insert(META_ACCESSED.to_owned(), now_ns.to_string());
    meta.insert(META_CHANGED.to_owned(), now_ns.to_string());
    meta.insert(META_CREATION.to_owned(), now_ns.to_string());
    meta.insert(META_MODIFIED.to_owned(), now_ns.to_string());
    meta.insert(META_WRITTEN.to_owned(), now_ns.to_string());
    meta.insert(META_DIRECTORY.to_owned(), directory.to_string());
    meta.insert(META_MODE.to_owned(), mode.to_string());
    meta.insert(META_UID.to_owned(), uid.to_string());
    meta.insert(META_GID.to_owned(), gid.to_string());
    meta.insert(META_PINNED.to_owned(), "false".to_owned());
    meta.insert(META_SIZE.to_owned(), "0".to_owned());
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_are_recognized() {
        for key in META_USED_NAMES {
            assert!(is_reserved_meta(key));
            assert_eq!(check_meta_removal(key), Err(ApiError::PermissionDenied));
        }
        assert!(!is_reserved_meta("user.color"));
        assert!(check_meta_removal(&xattr_meta_key("user.color")).is_ok());
    }

    #[test]
    fn xattr_keys_round_trip() {
        let key = xattr_meta_key("user.color");
        assert_eq!(xattr_name_of(&key), Some("user.color".to_owned()));
        assert_eq!(xattr_name_of(META_PINNED), None);
    }

    #[test]
    fn typed_accessors_default() {
        let mut meta = MetaMap::new();
        assert_eq!(get_meta_u64(&meta, META_SIZE), 0);
        assert!(!get_meta_bool(&meta, META_PINNED));

        meta.insert(META_SIZE.to_owned(), "42".to_owned());
        meta.insert(META_PINNED.to_owned(), "true".to_owned());
        assert_eq!(get_meta_u64(&meta, META_SIZE), 42);
        assert!(get_meta_bool(&meta, META_PINNED));
    }
}
