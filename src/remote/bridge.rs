//! Client-side operation bridge.
//!
//! The mount on the client side speaks these typed wrappers; each one
//! composes the method payload, runs it through the packet client pool, and
//! decodes the reply. Server-side, the dispatcher mirrors every encoding
//! here.

use crate::error::{ApiError, ApiResult};
use crate::packet::Packet;
use crate::remote::client::PacketClient;
use crate::types::{DirectoryItem, OpenFlags, UnixStat, VolumeInfo};

fn field<T>(decoded: crate::packet::Result<T>) -> ApiResult<T> {
    decoded.map_err(|_| ApiError::Error)
}

/// Typed RPC surface over one [`PacketClient`].
pub struct RemoteBridge {
    client: PacketClient,
}

impl RemoteBridge {
    pub fn new(client: PacketClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PacketClient {
        &self.client
    }

    /// The reserved `::check` call; refused with `IncompatibleVersion` by a
    /// newer server.
    pub async fn check(&self) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_u32(self.client.client_version());
        self.client.send("::check", request).await?;
        Ok(())
    }

    pub async fn access(&self, api_path: &str, mask: u32, uid: u32, gid: u32) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u32(mask);
        request.encode_u32(uid);
        request.encode_u32(gid);
        self.client.send("::fuse_access", request).await?;
        Ok(())
    }

    pub async fn getattr(&self, api_path: &str) -> ApiResult<(UnixStat, bool)> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        let mut reply = self.client.send("::fuse_getattr", request).await?;
        let stat = field(reply.packet.decode_stat())?;
        let directory = field(reply.packet.decode_u8())? != 0;
        Ok((stat, directory))
    }

    pub async fn fgetattr(&self, handle: u64) -> ApiResult<(UnixStat, bool)> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        let mut reply = self.client.send("::fuse_fgetattr", request).await?;
        let stat = field(reply.packet.decode_stat())?;
        let directory = field(reply.packet.decode_u8())? != 0;
        Ok((stat, directory))
    }

    pub async fn mkdir(&self, api_path: &str, mode: u32, uid: u32, gid: u32) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u32(mode);
        request.encode_u32(uid);
        request.encode_u32(gid);
        self.client.send("::fuse_mkdir", request).await?;
        Ok(())
    }

    pub async fn rmdir(&self, api_path: &str) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        self.client.send("::fuse_rmdir", request).await?;
        Ok(())
    }

    pub async fn create(
        &self,
        api_path: &str,
        flags: OpenFlags,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> ApiResult<u64> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u32(flags.0);
        request.encode_u32(mode);
        request.encode_u32(uid);
        request.encode_u32(gid);
        let mut reply = self.client.send("::fuse_create", request).await?;
        field(reply.packet.decode_u64())
    }

    pub async fn open(&self, api_path: &str, flags: OpenFlags) -> ApiResult<u64> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u32(flags.0);
        let mut reply = self.client.send("::fuse_open", request).await?;
        field(reply.packet.decode_u64())
    }

    pub async fn read(&self, handle: u64, size: u32, offset: u64) -> ApiResult<Vec<u8>> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        request.encode_u32(size);
        request.encode_u64(offset);
        let mut reply = self.client.send("::fuse_read", request).await?;
        field(reply.packet.decode_bytes())
    }

    pub async fn write(&self, handle: u64, data: &[u8], offset: u64) -> ApiResult<u32> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        request.encode_bytes(data);
        request.encode_u64(offset);
        let mut reply = self.client.send("::fuse_write", request).await?;
        field(reply.packet.decode_u32())
    }

    pub async fn truncate(&self, api_path: &str, size: u64) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u64(size);
        self.client.send("::fuse_truncate", request).await?;
        Ok(())
    }

    pub async fn ftruncate(&self, handle: u64, size: u64) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        request.encode_u64(size);
        self.client.send("::fuse_ftruncate", request).await?;
        Ok(())
    }

    pub async fn fsync(&self, handle: u64) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        self.client.send("::fuse_fsync", request).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str, replace_if_exists: bool) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(from);
        request.encode_str(to);
        request.encode_u8(replace_if_exists as u8);
        self.client.send("::fuse_rename", request).await?;
        Ok(())
    }

    pub async fn unlink(&self, api_path: &str) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        self.client.send("::fuse_unlink", request).await?;
        Ok(())
    }

    pub async fn release(&self, handle: u64) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        self.client.send("::fuse_release", request).await?;
        Ok(())
    }

    pub async fn statfs(&self) -> ApiResult<VolumeInfo> {
        let mut reply = self.client.send("::fuse_statfs", Packet::new()).await?;
        Ok(VolumeInfo {
            total_bytes: field(reply.packet.decode_u64())?,
            free_bytes: field(reply.packet.decode_u64())?,
            used_bytes: field(reply.packet.decode_u64())?,
            total_items: field(reply.packet.decode_u64())?,
        })
    }

    pub async fn opendir(&self, api_path: &str) -> ApiResult<u64> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        let mut reply = self.client.send("::fuse_opendir", request).await?;
        field(reply.packet.decode_u64())
    }

    pub async fn readdir(&self, handle: u64, offset: u64) -> ApiResult<DirectoryItem> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        request.encode_u64(offset);
        let mut reply = self.client.send("::fuse_readdir", request).await?;
        let json = field(reply.packet.decode_str())?;
        serde_json::from_str(&json).map_err(|_| ApiError::Error)
    }

    /// One page of the paged JSON listing variant.
    pub async fn readdir_page(&self, handle: u64, page: u32) -> ApiResult<Vec<DirectoryItem>> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        request.encode_u32(page);
        let mut reply = self.client.send("::json_readdir", request).await?;
        let json = field(reply.packet.decode_str())?;
        serde_json::from_str(&json).map_err(|_| ApiError::Error)
    }

    pub async fn releasedir(&self, handle: u64) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_u64(handle);
        self.client.send("::fuse_releasedir", request).await?;
        Ok(())
    }

    pub async fn setbkuptime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time(api_path, ns, "::fuse_setbkuptime").await
    }

    pub async fn setchgtime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time(api_path, ns, "::fuse_setchgtime").await
    }

    pub async fn setcrtime(&self, api_path: &str, ns: u64) -> ApiResult<()> {
        self.set_time(api_path, ns, "::fuse_setcrtime").await
    }

    async fn set_time(&self, api_path: &str, ns: u64, method: &str) -> ApiResult<()> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        request.encode_u64(ns);
        self.client.send(method, request).await?;
        Ok(())
    }

    pub async fn getxtimes(&self, api_path: &str) -> ApiResult<(u64, u64)> {
        let mut request = Packet::new();
        request.encode_str(api_path);
        let mut reply = self.client.send("::fuse_getxtimes", request).await?;
        Ok((field(reply.packet.decode_u64())?, field(reply.packet.decode_u64())?))
    }
}
