//! Server-side RPC dispatch.
//!
//! Decodes each method's arguments off the request packet, invokes the same
//! logical operations the local kernel bridge would, and encodes the reply
//! payload. Open handles are registered against the calling client so a
//! disconnect releases everything.

use std::sync::Arc;

use tracing::trace;

use crate::drive::{CallerContext, MountDispatcher};
use crate::error::{ApiError, ApiResult};
use crate::packet::Packet;
use crate::remote::handles::RemoteHandleTable;
use crate::remote::MIN_PROTOCOL_VERSION;
use crate::types::OpenFlags;

fn arg<T>(decoded: crate::packet::Result<T>) -> ApiResult<T> {
    decoded.map_err(|_| ApiError::BadAddress)
}

/// Routes decoded frames onto the drive core.
pub struct RemoteDispatcher {
    drive: Arc<MountDispatcher>,
    handles: Arc<RemoteHandleTable>,
}

impl RemoteDispatcher {
    pub fn new(drive: Arc<MountDispatcher>, handles: Arc<RemoteHandleTable>) -> Self {
        Self { drive, handles }
    }

    pub fn handle_table(&self) -> &Arc<RemoteHandleTable> {
        &self.handles
    }

    /// Executes one request; the reply payload plus the wire error code.
    pub async fn dispatch(
        &self,
        client_id: &str,
        method: &str,
        request: &mut Packet,
    ) -> (Packet, i32) {
        trace!(client_id, method, "dispatching remote call");
        match self.route(client_id, method, request).await {
            Ok(reply) => (reply, 0),
            Err(err) => (Packet::new(), err.to_code()),
        }
    }

    async fn route(
        &self,
        client_id: &str,
        method: &str,
        request: &mut Packet,
    ) -> ApiResult<Packet> {
        let mut reply = Packet::new();
        match method {
            "::check" => {
                let version = arg(request.decode_u32())?;
                if version < MIN_PROTOCOL_VERSION {
                    return Err(ApiError::IncompatibleVersion);
                }
            }
            "::fuse_access" => {
                let api_path = arg(request.decode_str())?;
                let mask = arg(request.decode_u32())?;
                let uid = arg(request.decode_u32())?;
                let gid = arg(request.decode_u32())?;
                self.drive.access(CallerContext { uid, gid }, &api_path, mask).await?;
            }
            "::fuse_getattr" => {
                let api_path = arg(request.decode_str())?;
                let (stat, directory) = self.drive.getattr(&api_path).await?;
                reply.encode_stat(&stat);
                reply.encode_u8(directory as u8);
            }
            "::fuse_fgetattr" => {
                let handle = arg(request.decode_u64())?;
                let (stat, directory) = self.drive.fgetattr(handle).await?;
                reply.encode_stat(&stat);
                reply.encode_u8(directory as u8);
            }
            "::fuse_mkdir" => {
                let api_path = arg(request.decode_str())?;
                let mode = arg(request.decode_u32())?;
                let uid = arg(request.decode_u32())?;
                let gid = arg(request.decode_u32())?;
                self.drive.mkdir(CallerContext { uid, gid }, &api_path, mode).await?;
            }
            "::fuse_rmdir" => {
                let api_path = arg(request.decode_str())?;
                self.drive.rmdir(&api_path).await?;
            }
            "::fuse_create" => {
                let api_path = arg(request.decode_str())?;
                let flags = OpenFlags(arg(request.decode_u32())?);
                let mode = arg(request.decode_u32())?;
                let uid = arg(request.decode_u32())?;
                let gid = arg(request.decode_u32())?;
                let handle =
                    self.drive.create(CallerContext { uid, gid }, &api_path, flags, mode).await?;
                self.handles.set_open_info(handle, client_id, &api_path).await;
                reply.encode_u64(handle);
            }
            "::fuse_open" => {
                let api_path = arg(request.decode_str())?;
                let flags = OpenFlags(arg(request.decode_u32())?);
                let handle = self.drive.open(&api_path, flags).await?;
                self.handles.set_open_info(handle, client_id, &api_path).await;
                reply.encode_u64(handle);
            }
            "::fuse_read" => {
                let handle = arg(request.decode_u64())?;
                let size = arg(request.decode_u32())? as usize;
                let offset = arg(request.decode_u64())?;
                let data = self.drive.read(handle, size, offset).await?;
                reply.encode_bytes(&data);
            }
            "::fuse_write" => {
                let handle = arg(request.decode_u64())?;
                let data = arg(request.decode_bytes())?;
                let offset = arg(request.decode_u64())?;
                let written = self.drive.write(handle, &data, offset).await?;
                reply.encode_u32(written as u32);
            }
            "::fuse_truncate" => {
                let api_path = arg(request.decode_str())?;
                let size = arg(request.decode_u64())?;
                self.drive.truncate(&api_path, size).await?;
            }
            "::fuse_ftruncate" => {
                let handle = arg(request.decode_u64())?;
                let size = arg(request.decode_u64())?;
                self.drive.ftruncate(handle, size).await?;
            }
            "::fuse_fsync" => {
                let handle = arg(request.decode_u64())?;
                self.drive.fsync(handle).await?;
            }
            "::fuse_rename" => {
                let from = arg(request.decode_str())?;
                let to = arg(request.decode_str())?;
                let replace = arg(request.decode_u8())? != 0;
                self.drive.rename(&from, &to, replace).await?;
            }
            "::fuse_unlink" => {
                let api_path = arg(request.decode_str())?;
                self.drive.unlink(&api_path).await?;
                for handle in self.handles.remove_all(&api_path).await {
                    let _ = self.drive.release(handle).await;
                }
            }
            "::fuse_release" => {
                let handle = arg(request.decode_u64())?;
                self.handles.remove_open_info(handle).await;
                self.drive.release(handle).await?;
            }
            "::fuse_statfs" => {
                let info = self.drive.statfs().await;
                reply.encode_u64(info.total_bytes);
                reply.encode_u64(info.free_bytes);
                reply.encode_u64(info.used_bytes);
                reply.encode_u64(info.total_items);
            }
            "::fuse_opendir" => {
                let api_path = arg(request.decode_str())?;
                let handle = self.drive.opendir(&api_path, Some(client_id.to_owned())).await?;
                self.handles.add_directory(client_id, handle).await;
                reply.encode_u64(handle);
            }
            "::fuse_readdir" => {
                let handle = arg(request.decode_u64())?;
                let offset = arg(request.decode_u64())? as usize;
                let item = self.drive.readdir(handle, offset).await?;
                let json = serde_json::to_string(&item).map_err(|_| ApiError::Error)?;
                reply.encode_str(&json);
            }
            "::fuse_releasedir" => {
                let handle = arg(request.decode_u64())?;
                self.handles.remove_directory(client_id, handle).await;
                self.drive.releasedir(handle).await?;
            }
            "::fuse_setbkuptime" => {
                let api_path = arg(request.decode_str())?;
                let ns = arg(request.decode_u64())?;
                self.drive.setbkuptime(&api_path, ns).await?;
            }
            "::fuse_setchgtime" => {
                let api_path = arg(request.decode_str())?;
                let ns = arg(request.decode_u64())?;
                self.drive.setchgtime(&api_path, ns).await?;
            }
            "::fuse_setcrtime" => {
                let api_path = arg(request.decode_str())?;
                let ns = arg(request.decode_u64())?;
                self.drive.setcrtime(&api_path, ns).await?;
            }
            "::fuse_getxtimes" => {
                let api_path = arg(request.decode_str())?;
                let (backup, creation) = self.drive.getxtimes(&api_path).await?;
                reply.encode_u64(backup);
                reply.encode_u64(creation);
            }
            "::json_readdir" => {
                let handle = arg(request.decode_u64())?;
                let page = arg(request.decode_u32())? as usize;
                let json = self.drive.readdir_page_json(handle, page).await?;
                reply.encode_str(&json);
            }
            "::winfsp_can_delete" => {
                let handle = arg(request.decode_u64())?;
                let api_path = arg(request.decode_wstr())?;
                self.drive.winfsp_can_delete(handle, &api_path).await?;
            }
            "::winfsp_cleanup" => {
                let handle = arg(request.decode_u64())?;
                let _api_path = arg(request.decode_wstr())?;
                let flags = arg(request.decode_u32())?;
                let mut was_deleted = false;
                self.drive.winfsp_cleanup(handle, flags, &mut was_deleted).await?;
                reply.encode_u8(was_deleted as u8);
            }
            "::winfsp_get_security_by_name" => {
                let api_path = arg(request.decode_wstr())?;
                let (descriptor, attributes) =
                    self.drive.winfsp_get_security_by_name(&api_path).await?;
                reply.encode_wstr(&descriptor);
                reply.encode_u32(attributes);
            }
            "::winfsp_set_basic_info" => {
                let handle = arg(request.decode_u64())?;
                let attributes = arg(request.decode_u32())?;
                self.drive.winfsp_set_basic_info(handle, attributes).await?;
            }
            "::winfsp_set_file_size" => {
                let handle = arg(request.decode_u64())?;
                let size = arg(request.decode_u64())?;
                self.drive.winfsp_set_file_size(handle, size).await?;
            }
            "::winfsp_overwrite" => {
                let handle = arg(request.decode_u64())?;
                self.drive.winfsp_overwrite(handle).await?;
            }
            "::winfsp_get_volume_info" => {
                let info = self.drive.winfsp_get_volume_info().await?;
                reply.encode_u64(info.total_bytes);
                reply.encode_u64(info.free_bytes);
                reply.encode_u64(info.total_items);
            }
            _ => return Err(ApiError::NotImplemented),
        }
        Ok(reply)
    }

    /// Disconnect cleanup: every handle the client held is closed and its
    /// directory snapshots dropped.
    pub async fn close_client(&self, client_id: &str) {
        let drained = self.handles.close_all(client_id).await;
        for handle in drained.files.iter().chain(drained.compat_files.iter()) {
            let _ = self.drive.release(*handle).await;
        }
        for handle in drained.directories {
            let _ = self.drive.releasedir(handle).await;
        }
        self.drive.directory_cache().release_client(client_id).await;
    }
}
