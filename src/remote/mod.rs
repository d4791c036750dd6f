//! Remote-drive RPC: client pool, server, handle tracking, and dispatch.

pub mod bridge;
pub mod client;
pub mod dispatch;
pub mod handles;
pub mod server;

use std::sync::atomic::{AtomicU64, Ordering};

/// Wire protocol revision spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest client revision the server still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Service-capability bits advertised in every request.
pub const PACKET_SERVICE_FLAGS: u32 = 0;

/// Transfer block size; timeouts reset after each block.
pub const READ_WRITE_SIZE: usize = 64 * 1024;

/// Send attempts before a call gives up.
pub const MAX_READ_ATTEMPTS: u8 = 5;

/// A method must look like `::fuse_read`: the `::` prefix then a lowercase
/// identifier. Anything else is rejected rather than repaired.
pub fn is_valid_method(method: &str) -> bool {
    let Some(name) = method.strip_prefix("::") else {
        return false;
    };
    let mut chars = name.chars();
    match chars.next() {
        Some(chr) if chr.is_ascii_lowercase() || chr == '_' => {}
        _ => return false,
    }
    chars.all(|chr| chr.is_ascii_lowercase() || chr.is_ascii_digit() || chr == '_')
}

static NEXT_LOGICAL_THREAD: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LOGICAL_THREAD_ID: u64 = NEXT_LOGICAL_THREAD.fetch_add(1, Ordering::SeqCst) + 1;
}

/// Stable per-OS-thread id carried in the request envelope so the server can
/// keep one caller's operations ordered.
pub fn logical_thread_id() -> u64 {
    LOGICAL_THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::is_valid_method;

    #[test]
    fn method_shape() {
        assert!(is_valid_method("::fuse_read"));
        assert!(is_valid_method("::check"));
        assert!(is_valid_method("::json_readdir"));
        assert!(is_valid_method("::winfsp_set_file_size"));

        assert!(!is_valid_method("fuse_read"));
        assert!(!is_valid_method("::"));
        assert!(!is_valid_method("::Fuse_Read"));
        assert!(!is_valid_method("::fuse read"));
        assert!(!is_valid_method(":fuse_read"));
    }
}
