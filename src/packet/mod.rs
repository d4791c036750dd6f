//! Length-prefixed packet codec for the remote-drive wire.
//!
//! A [`Packet`] is a byte buffer with a read cursor. Integers wider than one
//! byte travel big-endian; strings and byte blobs are `[u32 length][bytes]`;
//! wide strings are `[u32 length][utf16le]`. [`Packet::encode_top`] layers
//! protocol headers on top of an already-composed payload, which is how the
//! client builds the request envelope.

pub mod crypto;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::types::UnixStat;

/// Hard ceiling on one frame, sealed size included.
pub const MAX_PACKET_BYTES: usize = 32 * 1024 * 1024;

/// Bytes of the random challenge exchanged during the handshake.
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Short read, or a length field beyond the frame or protocol maximum.
    #[error("malformed packet")]
    Malformed,
    #[error("packet decryption failed")]
    DecryptFailed,
    /// Session nonce in the request does not match the rolling nonce.
    #[error("packet nonce mismatch")]
    NonceMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Byte buffer plus read cursor; the unit of exchange on the remote wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    buffer: Vec<u8>,
    cursor: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes not yet consumed by `decode_*`.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    // --- encode (append) ---

    pub fn encode_u8(&mut self, val: u8) {
        self.buffer.push(val);
    }

    pub fn encode_u32(&mut self, val: u32) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    pub fn encode_u64(&mut self, val: u64) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    pub fn encode_i32(&mut self, val: i32) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    /// Appends bytes with no length prefix; handshake fields are fixed-size.
    pub fn encode_raw(&mut self, val: &[u8]) {
        self.buffer.extend_from_slice(val);
    }

    pub fn encode_bytes(&mut self, val: &[u8]) {
        self.encode_u32(val.len() as u32);
        self.buffer.extend_from_slice(val);
    }

    pub fn encode_str(&mut self, val: &str) {
        self.encode_bytes(val.as_bytes());
    }

    /// Encodes a Windows-originating wide string as UTF-16LE bytes.
    pub fn encode_wstr(&mut self, val: &str) {
        let units: Vec<u16> = val.encode_utf16().collect();
        self.encode_u32((units.len() * 2) as u32);
        for unit in units {
            self.buffer.extend_from_slice(&unit.to_le_bytes());
        }
    }

    pub fn encode_stat(&mut self, stat: &UnixStat) {
        self.encode_u32(stat.st_mode);
        self.encode_u32(stat.st_nlink);
        self.encode_u32(stat.st_uid);
        self.encode_u32(stat.st_gid);
        self.encode_u64(stat.st_size);
        self.encode_u64(stat.st_atimespec);
        self.encode_u64(stat.st_mtimespec);
        self.encode_u64(stat.st_ctimespec);
        self.encode_u64(stat.st_birthtimespec);
        self.encode_u32(stat.st_blksize);
        self.encode_u64(stat.st_blocks);
        self.encode_u32(stat.st_flags);
    }

    // --- encode_top (prepend) ---

    fn splice_front(&mut self, head: Vec<u8>) {
        self.buffer.splice(0..0, head);
    }

    pub fn encode_top_u32(&mut self, val: u32) {
        self.splice_front(val.to_be_bytes().to_vec());
    }

    pub fn encode_top_u64(&mut self, val: u64) {
        self.splice_front(val.to_be_bytes().to_vec());
    }

    pub fn encode_top_i32(&mut self, val: i32) {
        self.splice_front(val.to_be_bytes().to_vec());
    }

    pub fn encode_top_str(&mut self, val: &str) {
        let mut head = Vec::with_capacity(4 + val.len());
        head.extend_from_slice(&(val.len() as u32).to_be_bytes());
        head.extend_from_slice(val.as_bytes());
        self.splice_front(head);
    }

    // --- decode (consume at cursor) ---

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            return Err(Error::Malformed);
        }
        let start = self.cursor;
        self.cursor += count;
        Ok(&self.buffer[start..self.cursor])
    }

    pub fn decode_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn decode_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn decode_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn decode_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    /// Consumes exactly `count` bytes with no length prefix.
    pub fn decode_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.decode_u32()? as usize;
        if len > MAX_PACKET_BYTES {
            return Err(Error::Malformed);
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn decode_str(&mut self) -> Result<String> {
        let bytes = self.decode_bytes()?;
        String::from_utf8(bytes).map_err(|_| Error::Malformed)
    }

    pub fn decode_wstr(&mut self) -> Result<String> {
        let bytes = self.decode_bytes()?;
        if bytes.len() % 2 != 0 {
            return Err(Error::Malformed);
        }
        let units: Vec<u16> =
            bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
        String::from_utf16(&units).map_err(|_| Error::Malformed)
    }

    pub fn decode_stat(&mut self) -> Result<UnixStat> {
        Ok(UnixStat {
            st_mode: self.decode_u32()?,
            st_nlink: self.decode_u32()?,
            st_uid: self.decode_u32()?,
            st_gid: self.decode_u32()?,
            st_size: self.decode_u64()?,
            st_atimespec: self.decode_u64()?,
            st_mtimespec: self.decode_u64()?,
            st_ctimespec: self.decode_u64()?,
            st_birthtimespec: self.decode_u64()?,
            st_blksize: self.decode_u32()?,
            st_blocks: self.decode_u64()?,
            st_flags: self.decode_u32()?,
        })
    }

    // --- encryption ---

    /// Seals the buffer in place. When `include_size_prefix` is set the final
    /// `u32` frame length is prepended, ready for the wire.
    pub fn encrypt(&mut self, token: &str, include_size_prefix: bool) -> Result<()> {
        let sealed = crypto::seal(token, &self.buffer)?;
        if sealed.len() > MAX_PACKET_BYTES {
            return Err(Error::Malformed);
        }

        self.buffer = sealed;
        if include_size_prefix {
            let len = self.buffer.len() as u32;
            self.splice_front(len.to_be_bytes().to_vec());
        }
        self.cursor = 0;
        Ok(())
    }

    /// Opens a sealed buffer in place and resets the cursor.
    pub fn decrypt(&mut self, token: &str) -> Result<()> {
        self.buffer = crypto::open(token, &self.buffer)?;
        self.cursor = 0;
        Ok(())
    }
}

impl From<Vec<u8>> for Packet {
    fn from(buffer: Vec<u8>) -> Self {
        Self { buffer, cursor: 0 }
    }
}

/// Validates the `u32` length prefix read off the wire before the frame body
/// is fetched.
pub fn check_frame_size(size: usize) -> Result<()> {
    if size > MAX_PACKET_BYTES || size < crypto::ENCRYPTION_HEADER_SIZE {
        return Err(Error::Malformed);
    }
    Ok(())
}
