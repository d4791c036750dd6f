//! Cachalot - a remote-mount open-file/chunk-cache engine with an encrypted
//! remote-drive RPC.
//!
//! The drive core ([`drive::MountDispatcher`]) translates filesystem calls
//! into provider operations through a per-file chunk cache with write-back
//! and eviction. The remote layer carries the same operations between a
//! client mount and a server mount over length-prefixed, AEAD-sealed frames.

pub mod cache;
pub mod config;
pub mod dirs;
pub mod drive;
pub mod error;
pub mod event;
pub mod files;
pub mod lock;
pub mod meta;
pub mod packet;
pub mod path;
pub mod provider;
pub mod remote;
pub mod types;

pub use config::{MountConfig, RemoteConfig};
pub use drive::{CallerContext, MountDispatcher};
pub use error::{ApiError, ApiResult};
pub use event::{Event, EventSink};
pub use types::OpenFlags;
