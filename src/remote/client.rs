//! Packet client pool.
//!
//! Keeps up to `max_connections` authenticated sessions to one remote mount.
//! Every session carries the server's rolling nonce from its last response.
//! Transport failures retry with a one-second pause; an error code returned
//! by the server is a completed call and surfaces as-is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RemoteConfig;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::packet::{check_frame_size, Packet, HANDSHAKE_NONCE_SIZE};
use crate::remote::{
    logical_thread_id, MAX_READ_ATTEMPTS, PACKET_SERVICE_FLAGS, PROTOCOL_VERSION, READ_WRITE_SIZE,
};

/// Plaintext handshake hello: version, complemented version, challenge.
pub const HANDSHAKE_SIZE: usize = 4 + 4 + HANDSHAKE_NONCE_SIZE;

struct ClientConn {
    stream: TcpStream,
    nonce: u32,
}

/// Successful RPC outcome: the reply payload plus advertised service flags.
#[derive(Debug)]
pub struct RemoteReply {
    pub packet: Packet,
    pub service_flags: u32,
}

/// Pool of authenticated sessions to one `(host, port)`.
pub struct PacketClient {
    cfg: RemoteConfig,
    client_version: u32,
    events: EventSink,
    unique_id: StdMutex<String>,
    allow_connections: AtomicBool,
    clients: Mutex<Vec<ClientConn>>,
}

impl PacketClient {
    pub fn new(cfg: RemoteConfig, events: EventSink) -> Self {
        Self::with_version(cfg, events, PROTOCOL_VERSION)
    }

    /// Version override for compatibility testing.
    pub fn with_version(cfg: RemoteConfig, events: EventSink, client_version: u32) -> Self {
        Self {
            cfg,
            client_version,
            events,
            unique_id: StdMutex::new(Uuid::new_v4().to_string()),
            allow_connections: AtomicBool::new(true),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn unique_id(&self) -> String {
        self.unique_id.lock().expect("unique id lock").clone()
    }

    pub fn client_version(&self) -> u32 {
        self.client_version
    }

    /// Sessions currently idle in the pool.
    pub async fn pooled_connections(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Connects, completes the handshake, and reports the server's minimum
    /// version without adding a session to the pool.
    pub async fn check_version(&self) -> ApiResult<u32> {
        let mut stream = self.connect_socket().await?;
        let (min_version, _) = self.handshake(&mut stream).await?;
        Ok(min_version)
    }

    async fn connect_socket(&self) -> ApiResult<TcpStream> {
        let timeout = Duration::from_millis(self.cfg.conn_timeout_ms);
        let addr = (self.cfg.host.clone(), self.cfg.port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                self.events.raise(Event::PacketClientTimeout { phase: "connect".to_owned() });
                Err(ApiError::Error)
            }
        }
    }

    /// Client half of the handshake. Returns the server minimum version and
    /// the initial session nonce.
    async fn handshake(&self, stream: &mut TcpStream) -> ApiResult<(u32, u32)> {
        let mut hello = Packet::new();
        hello.encode_u32(self.client_version);
        hello.encode_u32(!self.client_version);
        let mut challenge = [0u8; HANDSHAKE_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut challenge);
        hello.encode_raw(&challenge);
        self.write_data(stream, hello.as_bytes()).await?;

        let mut server_hello = vec![0u8; HANDSHAKE_SIZE];
        self.read_data(stream, &mut server_hello).await?;

        let mut response = Packet::from(server_hello.clone());
        let min_version = response.decode_u32().map_err(|_| ApiError::Error)?;
        let min_version_check = response.decode_u32().map_err(|_| ApiError::Error)?;
        if min_version_check != !min_version {
            return Err(ApiError::Error);
        }
        if self.client_version < min_version {
            return Err(ApiError::IncompatibleVersion);
        }

        // prove knowledge of the token by echoing the hello sealed
        let mut proof = Packet::from(server_hello);
        proof.encrypt(&self.cfg.encryption_token, false).map_err(|_| ApiError::Error)?;
        self.write_data(stream, proof.as_bytes()).await?;

        let mut nonce_packet = self.read_packet(stream).await?;
        let nonce = nonce_packet.decode_u32().map_err(|_| ApiError::Error)?;
        Ok((min_version, nonce))
    }

    async fn connect(&self) -> ApiResult<ClientConn> {
        let mut stream = self.connect_socket().await?;
        let (_, nonce) = self.handshake(&mut stream).await?;
        Ok(ClientConn { stream, nonce })
    }

    async fn get_client(&self) -> ApiResult<ClientConn> {
        if !self.allow_connections.load(Ordering::SeqCst) {
            return Err(ApiError::Error);
        }
        let mut clients = self.clients.lock().await;
        if let Some(conn) = clients.pop() {
            return Ok(conn);
        }
        drop(clients);
        self.connect().await
    }

    async fn put_client(&self, conn: ClientConn) {
        let mut clients = self.clients.lock().await;
        if clients.len() < self.cfg.max_connections as usize {
            clients.push(conn);
        }
    }

    async fn write_data(&self, stream: &mut TcpStream, data: &[u8]) -> ApiResult<()> {
        let timeout = Duration::from_millis(self.cfg.send_timeout_ms);
        for block in data.chunks(READ_WRITE_SIZE) {
            match tokio::time::timeout(timeout, stream.write_all(block)).await {
                Ok(res) => res?,
                Err(_) => {
                    self.events
                        .raise(Event::PacketClientTimeout { phase: "request".to_owned() });
                    return Err(ApiError::Error);
                }
            }
        }
        Ok(())
    }

    async fn read_data(&self, stream: &mut TcpStream, data: &mut [u8]) -> ApiResult<()> {
        let timeout = Duration::from_millis(self.cfg.recv_timeout_ms);
        for block in data.chunks_mut(READ_WRITE_SIZE) {
            match tokio::time::timeout(timeout, stream.read_exact(block)).await {
                Ok(res) => {
                    res?;
                }
                Err(_) => {
                    self.events
                        .raise(Event::PacketClientTimeout { phase: "response".to_owned() });
                    return Err(ApiError::Error);
                }
            }
        }
        Ok(())
    }

    async fn read_packet(&self, stream: &mut TcpStream) -> ApiResult<Packet> {
        let mut size_prefix = [0u8; 4];
        self.read_data(stream, &mut size_prefix).await?;
        let size = u32::from_be_bytes(size_prefix) as usize;
        check_frame_size(size).map_err(|_| ApiError::Error)?;

        let mut body = vec![0u8; size];
        self.read_data(stream, &mut body).await?;

        let mut packet = Packet::from(body);
        packet.decrypt(&self.cfg.encryption_token).map_err(|_| ApiError::Error)?;
        Ok(packet)
    }

    /// Sends one call. The request envelope is layered top-down: session
    /// nonce, version string, service flags, client id, thread id, method,
    /// then the payload the caller composed.
    pub async fn send(&self, method: &str, request: Packet) -> ApiResult<RemoteReply> {
        let mut base = request;
        base.encode_top_str(method);
        base.encode_top_u64(logical_thread_id());
        base.encode_top_str(&self.unique_id());
        base.encode_top_u32(PACKET_SERVICE_FLAGS);
        base.encode_top_str(env!("CARGO_PKG_VERSION"));

        let mut last_error = ApiError::Error;
        for attempt in 1..=MAX_READ_ATTEMPTS {
            if !self.allow_connections.load(Ordering::SeqCst) {
                return Err(ApiError::Error);
            }

            let mut conn = match self.get_client().await {
                Ok(conn) => conn,
                Err(err) => {
                    last_error = err;
                    self.retry_pause(attempt).await;
                    continue;
                }
            };

            let mut wire = base.clone();
            wire.encode_top_u32(conn.nonce);
            wire.encrypt(&self.cfg.encryption_token, true).map_err(|_| ApiError::Error)?;

            match self.exchange(&mut conn, &wire).await {
                Ok((mut response, service_flags)) => {
                    let code = match response.decode_i32() {
                        Ok(code) => code,
                        Err(_) => {
                            last_error = ApiError::Error;
                            self.retry_pause(attempt).await;
                            continue;
                        }
                    };
                    self.put_client(conn).await;
                    ApiError::from_code(code)?;
                    return Ok(RemoteReply { packet: response, service_flags });
                }
                Err(err) => {
                    debug!(method, attempt, ?err, "remote call attempt failed");
                    last_error = err;
                    self.retry_pause(attempt).await;
                }
            }
        }

        warn!(method, "remote call exhausted retries");
        Err(last_error)
    }

    /// One write/read round; the session nonce rolls forward on success.
    async fn exchange(
        &self,
        conn: &mut ClientConn,
        wire: &Packet,
    ) -> ApiResult<(Packet, u32)> {
        self.write_data(&mut conn.stream, wire.as_bytes()).await?;
        let mut response = self.read_packet(&mut conn.stream).await?;

        conn.nonce = response.decode_u32().map_err(|_| ApiError::Error)?;
        let service_flags = response.decode_u32().map_err(|_| ApiError::Error)?;
        Ok((response, service_flags))
    }

    async fn retry_pause(&self, attempt: u8) {
        if self.allow_connections.load(Ordering::SeqCst) && attempt < MAX_READ_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Drops every pooled session and resets the client identity.
    pub async fn close_all(&self) {
        let mut clients = self.clients.lock().await;
        clients.clear();
        *self.unique_id.lock().expect("unique id lock") = Uuid::new_v4().to_string();
    }

    /// Permanently disables the pool; used on unmount.
    pub async fn shutdown(&self) {
        self.allow_connections.store(false, Ordering::SeqCst);
        self.close_all().await;
    }
}
