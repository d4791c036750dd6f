//! Error taxonomy shared by every layer of the crate.
//!
//! All operations return [`ApiError`] through `Result`. On the remote wire an
//! outcome travels as a single `i32`: `0` for success, a small positive code
//! for each named kind, and a negative value carrying a raw OS errno.

use thiserror::Error;

/// Failure kinds surfaced by drive, cache, and remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("access denied")]
    AccessDenied,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("bad address")]
    BadAddress,
    #[error("directory exists")]
    DirectoryExists,
    #[error("directory not found")]
    DirectoryNotFound,
    #[error("download stopped")]
    DownloadStopped,
    #[error("error")]
    Error,
    #[error("incompatible version")]
    IncompatibleVersion,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("item exists")]
    ItemExists,
    #[error("item not found")]
    ItemNotFound,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not implemented")]
    NotImplemented,
    #[error("not supported")]
    NotSupported,
    #[error("no tty")]
    NoTty,
    #[error("os error {0}")]
    OsError(i32),
    #[error("permission denied")]
    PermissionDenied,
    #[error("xattr buffer too small")]
    XattrBufferSmall,
    #[error("xattr exists")]
    XattrExists,
    #[error("xattr not found")]
    XattrNotFound,
    #[error("invalid osx xattr")]
    XattrOsxInvalid,
    #[error("xattr too big")]
    XattrTooBig,
}

/// Result alias used throughout the crate.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Stable wire code. `OsError` folds its errno into the negative range.
    pub fn to_code(&self) -> i32 {
        match self {
            ApiError::AccessDenied => 1,
            ApiError::BadFileDescriptor => 2,
            ApiError::BadAddress => 3,
            ApiError::DirectoryExists => 4,
            ApiError::DirectoryNotFound => 5,
            ApiError::DownloadStopped => 6,
            ApiError::Error => 7,
            ApiError::IncompatibleVersion => 8,
            ApiError::InvalidHandle => 9,
            ApiError::InvalidOperation => 10,
            ApiError::ItemExists => 11,
            ApiError::ItemNotFound => 12,
            ApiError::NotEmpty => 13,
            ApiError::NotImplemented => 14,
            ApiError::NotSupported => 15,
            ApiError::NoTty => 16,
            ApiError::PermissionDenied => 17,
            ApiError::XattrBufferSmall => 18,
            ApiError::XattrExists => 19,
            ApiError::XattrNotFound => 20,
            ApiError::XattrOsxInvalid => 21,
            ApiError::XattrTooBig => 22,
            ApiError::OsError(errno) => -errno.abs(),
        }
    }

    /// Reverses [`ApiError::to_code`]. `Ok(())` for `0`, `Error` for any
    /// positive code no kind claims.
    pub fn from_code(code: i32) -> ApiResult<()> {
        let err = match code {
            0 => return Ok(()),
            1 => ApiError::AccessDenied,
            2 => ApiError::BadFileDescriptor,
            3 => ApiError::BadAddress,
            4 => ApiError::DirectoryExists,
            5 => ApiError::DirectoryNotFound,
            6 => ApiError::DownloadStopped,
            7 => ApiError::Error,
            8 => ApiError::IncompatibleVersion,
            9 => ApiError::InvalidHandle,
            10 => ApiError::InvalidOperation,
            11 => ApiError::ItemExists,
            12 => ApiError::ItemNotFound,
            13 => ApiError::NotEmpty,
            14 => ApiError::NotImplemented,
            15 => ApiError::NotSupported,
            16 => ApiError::NoTty,
            17 => ApiError::PermissionDenied,
            18 => ApiError::XattrBufferSmall,
            19 => ApiError::XattrExists,
            20 => ApiError::XattrNotFound,
            21 => ApiError::XattrOsxInvalid,
            22 => ApiError::XattrTooBig,
            code if code < 0 => ApiError::OsError(-code),
            _ => ApiError::Error,
        };
        Err(err)
    }

    /// Converts a `Result` into its wire code.
    pub fn code_of<T>(result: &ApiResult<T>) -> i32 {
        match result {
            Ok(_) => 0,
            Err(err) => err.to_code(),
        }
    }

    /// POSIX errno equivalent, used when surfacing failures to the kernel
    /// bridge.
    pub fn to_errno(&self) -> i32 {
        match self {
            ApiError::AccessDenied | ApiError::PermissionDenied => libc_consts::EACCES,
            ApiError::BadFileDescriptor | ApiError::InvalidHandle => libc_consts::EBADF,
            ApiError::BadAddress => libc_consts::EFAULT,
            ApiError::DirectoryExists | ApiError::ItemExists => libc_consts::EEXIST,
            ApiError::DirectoryNotFound | ApiError::ItemNotFound => libc_consts::ENOENT,
            ApiError::DownloadStopped | ApiError::Error => libc_consts::EIO,
            ApiError::IncompatibleVersion => libc_consts::EPROTO,
            ApiError::InvalidOperation => libc_consts::EINVAL,
            ApiError::NotEmpty => libc_consts::ENOTEMPTY,
            ApiError::NotImplemented | ApiError::NotSupported => libc_consts::ENOTSUP,
            ApiError::NoTty => libc_consts::ENOTTY,
            ApiError::OsError(errno) => *errno,
            ApiError::XattrBufferSmall => libc_consts::ERANGE,
            ApiError::XattrExists => libc_consts::EEXIST,
            ApiError::XattrNotFound => libc_consts::ENODATA,
            ApiError::XattrOsxInvalid => libc_consts::EINVAL,
            ApiError::XattrTooBig => libc_consts::E2BIG,
        }
    }

    /// Kinds that permanently fail an open file; retrying is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApiError::PermissionDenied
                | ApiError::AccessDenied
                | ApiError::IncompatibleVersion
                | ApiError::NotImplemented
                | ApiError::NotSupported
        )
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => ApiError::OsError(errno),
            None => ApiError::Error,
        }
    }
}

/// The errno values the taxonomy maps onto, kept local so the crate stays off
/// platform bindings.
mod libc_consts {
    pub const EACCES: i32 = 13;
    pub const EBADF: i32 = 9;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EPROTO: i32 = 71;
    pub const EINVAL: i32 = 22;
    pub const ENOTEMPTY: i32 = 39;
    pub const ENOTSUP: i32 = 95;
    pub const ENOTTY: i32 = 25;
    pub const ERANGE: i32 = 34;
    pub const ENODATA: i32 = 61;
    pub const E2BIG: i32 = 7;
}

#[cfg(test)]
mod tests {
    use super::ApiError;

    #[test]
    fn wire_codes_round_trip() {
        let kinds = [
            ApiError::AccessDenied,
            ApiError::BadFileDescriptor,
            ApiError::DirectoryExists,
            ApiError::DirectoryNotFound,
            ApiError::DownloadStopped,
            ApiError::IncompatibleVersion,
            ApiError::InvalidHandle,
            ApiError::ItemExists,
            ApiError::ItemNotFound,
            ApiError::NotEmpty,
            ApiError::NotImplemented,
            ApiError::PermissionDenied,
            ApiError::XattrNotFound,
        ];
        for kind in kinds {
            let code = kind.to_code();
            assert_eq!(ApiError::from_code(code), Err(kind));
        }
    }

    #[test]
    fn os_error_keeps_errno() {
        let code = ApiError::OsError(13).to_code();
        assert_eq!(code, -13);
        assert_eq!(ApiError::from_code(code), Err(ApiError::OsError(13)));
    }

    #[test]
    fn zero_is_success() {
        assert_eq!(ApiError::from_code(0), Ok(()));
    }
}
