//! Packet server.
//!
//! Accepts connections, runs the server half of the handshake, then feeds
//! every inbound frame to a worker group keyed by `(client_id, thread_id)`.
//! One group executes its calls in submission order; different logical
//! threads of the same client run in parallel. A dropped connection releases
//! everything the client held.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::packet::{check_frame_size, Packet, HANDSHAKE_NONCE_SIZE};
use crate::remote::client::HANDSHAKE_SIZE;
use crate::remote::dispatch::RemoteDispatcher;
use crate::remote::{
    is_valid_method, MIN_PROTOCOL_VERSION, PACKET_SERVICE_FLAGS, READ_WRITE_SIZE,
};
use crate::types::StopToken;

/// Idle worker groups older than this are reaped.
const GROUP_EXPIRE: Duration = Duration::from_secs(60);

/// Cadence of the group expiry sweep.
const EXPIRE_INTERVAL: Duration = Duration::from_secs(20);

struct Job {
    client_id: String,
    method: String,
    request: Packet,
    reply: oneshot::Sender<(Packet, i32)>,
}

struct Group {
    tx: async_channel::Sender<Job>,
    last_used: Arc<StdMutex<Instant>>,
    task: JoinHandle<()>,
}

/// `(client_id, thread_id)`-keyed execution slots.
struct WorkerGroups {
    dispatcher: Arc<RemoteDispatcher>,
    events: EventSink,
    max_groups: usize,
    groups: Mutex<HashMap<(String, u64), Group>>,
}

impl WorkerGroups {
    fn new(dispatcher: Arc<RemoteDispatcher>, events: EventSink, max_groups: usize) -> Self {
        Self { dispatcher, events, max_groups, groups: Mutex::new(HashMap::new()) }
    }

    /// Queues one call on its group, creating the group on first use. The
    /// oldest idle group makes room when the cap is hit.
    async fn submit(
        &self,
        client_id: &str,
        thread_id: u64,
        method: String,
        request: Packet,
    ) -> oneshot::Receiver<(Packet, i32)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let key = (client_id.to_owned(), thread_id);

        let mut groups = self.groups.lock().await;
        if !groups.contains_key(&key) {
            if groups.len() >= self.max_groups {
                self.evict_oldest(&mut groups);
            }
            groups.insert(key.clone(), self.spawn_group());
        }
        let group = groups.get(&key).expect("group just ensured");
        *group.last_used.lock().expect("group clock") = Instant::now();
        let job = Job {
            client_id: client_id.to_owned(),
            method,
            request,
            reply: reply_tx,
        };
        if group.tx.send(job).await.is_err() {
            warn!(client_id, thread_id, "worker group queue closed");
        }
        reply_rx
    }

    fn spawn_group(&self) -> Group {
        let (tx, rx) = async_channel::unbounded::<Job>();
        let last_used = Arc::new(StdMutex::new(Instant::now()));
        let clock = Arc::clone(&last_used);
        let dispatcher = Arc::clone(&self.dispatcher);

        let task = tokio::spawn(async move {
            while let Ok(mut job) = rx.recv().await {
                *clock.lock().expect("group clock") = Instant::now();
                let (reply, code) =
                    dispatcher.dispatch(&job.client_id, &job.method, &mut job.request).await;
                let _ = job.reply.send((reply, code));
            }
        });

        Group { tx, last_used, task }
    }

    fn evict_oldest(&self, groups: &mut HashMap<(String, u64), Group>) {
        let oldest = groups
            .iter()
            .min_by_key(|(_, group)| *group.last_used.lock().expect("group clock"))
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            if let Some(group) = groups.remove(&key) {
                group.tx.close();
            }
        }
    }

    /// Reaps groups idle beyond [`GROUP_EXPIRE`].
    async fn expire_idle(&self) {
        let mut groups = self.groups.lock().await;
        let expired: Vec<(String, u64)> = groups
            .iter()
            .filter(|(_, group)| {
                group.last_used.lock().expect("group clock").elapsed() >= GROUP_EXPIRE
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(group) = groups.remove(&key) {
                group.tx.close();
            }
            self.events.raise(Event::RemoteServerExpired {
                client_id: key.0.clone(),
                thread_id: key.1,
            });
        }
    }

    async fn remove_client(&self, client_id: &str) {
        let mut groups = self.groups.lock().await;
        let keys: Vec<(String, u64)> =
            groups.keys().filter(|key| key.0 == client_id).cloned().collect();
        for key in keys {
            if let Some(group) = groups.remove(&key) {
                group.tx.close();
            }
        }
    }

    async fn shutdown(&self) {
        let mut groups = self.groups.lock().await;
        for (_, group) in groups.drain() {
            group.tx.close();
            group.task.abort();
        }
    }
}

/// The remote-drive RPC server.
pub struct PacketServer {
    cfg: RemoteConfig,
    dispatcher: Arc<RemoteDispatcher>,
    stop: StopToken,
    groups: Arc<WorkerGroups>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketServer {
    /// Binds the listener and spawns the accept loop plus the group expiry
    /// sweep. Returns the server and the actual bound port.
    pub async fn start(
        cfg: RemoteConfig,
        dispatcher: Arc<RemoteDispatcher>,
        events: EventSink,
        stop: StopToken,
        bind_all_interfaces: bool,
    ) -> ApiResult<(Arc<Self>, u16)> {
        let host = if bind_all_interfaces { "0.0.0.0" } else { "127.0.0.1" };
        let listener = TcpListener::bind((host, cfg.port)).await?;
        let port = listener.local_addr()?.port();

        let groups = Arc::new(WorkerGroups::new(
            Arc::clone(&dispatcher),
            events,
            cfg.client_pool_size,
        ));

        let server = Arc::new(Self {
            cfg,
            dispatcher,
            stop,
            groups,
            tasks: Mutex::new(Vec::new()),
        });

        let accept = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, peer)) = listener.accept().await else {
                        break;
                    };
                    if server.stop.is_stopped() {
                        break;
                    }
                    debug!(%peer, "remote client connected");
                    let _ = socket.set_nodelay(true);
                    let conn_server = Arc::clone(&server);
                    tokio::spawn(async move {
                        conn_server.handle_connection(socket).await;
                    });
                }
            })
        };

        let expiry = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);
                loop {
                    ticker.tick().await;
                    if server.stop.is_stopped() {
                        break;
                    }
                    server.groups.expire_idle().await;
                }
            })
        };

        server.tasks.lock().await.extend([accept, expiry]);
        Ok((server, port))
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let Ok(mut session_nonce) = self.server_handshake(&mut stream).await else {
            return;
        };

        let mut known_client: Option<String> = None;
        loop {
            match self.receive_frame(&mut stream, session_nonce).await {
                Ok(Some((client_id, thread_id, method, payload))) => {
                    known_client.get_or_insert_with(|| client_id.clone());

                    let (reply, code) = if is_valid_method(&method) {
                        let rx =
                            self.groups.submit(&client_id, thread_id, method, payload).await;
                        match rx.await {
                            Ok(outcome) => outcome,
                            Err(_) => (Packet::new(), ApiError::Error.to_code()),
                        }
                    } else {
                        // malformed method names are refused, never repaired
                        (Packet::new(), ApiError::InvalidOperation.to_code())
                    };

                    session_nonce = rand::thread_rng().next_u32();
                    if self
                        .write_reply(&mut stream, session_nonce, reply, code)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if let Some(client_id) = known_client {
            debug!(client_id, "remote client disconnected; releasing handles");
            self.closed_handler(&client_id).await;
        }
    }

    /// Server half of the handshake: verify the hello, issue the challenge,
    /// check the sealed echo, hand out the first session nonce.
    async fn server_handshake(&self, stream: &mut TcpStream) -> ApiResult<u32> {
        let mut hello = vec![0u8; HANDSHAKE_SIZE];
        stream.read_exact(&mut hello).await?;

        let mut decoded = Packet::from(hello);
        let client_version = decoded.decode_u32().map_err(|_| ApiError::Error)?;
        let version_check = decoded.decode_u32().map_err(|_| ApiError::Error)?;
        if version_check != !client_version {
            return Err(ApiError::Error);
        }

        let mut challenge = Packet::new();
        challenge.encode_u32(MIN_PROTOCOL_VERSION);
        challenge.encode_u32(!MIN_PROTOCOL_VERSION);
        let mut nonce_bytes = [0u8; HANDSHAKE_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        challenge.encode_raw(&nonce_bytes);
        stream.write_all(challenge.as_bytes()).await?;

        let sealed_len = HANDSHAKE_SIZE + crate::packet::crypto::ENCRYPTION_HEADER_SIZE;
        let mut proof = vec![0u8; sealed_len];
        stream.read_exact(&mut proof).await?;
        let mut proof = Packet::from(proof);
        proof.decrypt(&self.cfg.encryption_token).map_err(|_| ApiError::PermissionDenied)?;
        if proof.as_bytes() != challenge.as_bytes() {
            return Err(ApiError::PermissionDenied);
        }

        let session_nonce = rand::thread_rng().next_u32();
        let mut first = Packet::new();
        first.encode_u32(session_nonce);
        first.encrypt(&self.cfg.encryption_token, true).map_err(|_| ApiError::Error)?;
        stream.write_all(first.as_bytes()).await?;

        Ok(session_nonce)
    }

    /// Reads and validates one frame. `Ok(None)` is a clean EOF.
    #[allow(clippy::type_complexity)]
    async fn receive_frame(
        &self,
        stream: &mut TcpStream,
        expected_nonce: u32,
    ) -> ApiResult<Option<(String, u64, String, Packet)>> {
        let mut size_prefix = [0u8; 4];
        match stream.read_exact(&mut size_prefix).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let size = u32::from_be_bytes(size_prefix) as usize;
        check_frame_size(size).map_err(|_| ApiError::Error)?;

        let mut body = vec![0u8; size];
        stream.read_exact(&mut body).await?;
        let mut packet = Packet::from(body);
        packet.decrypt(&self.cfg.encryption_token).map_err(|_| ApiError::PermissionDenied)?;

        let nonce = packet.decode_u32().map_err(|_| ApiError::Error)?;
        if nonce != expected_nonce {
            warn!("session nonce mismatch; dropping connection");
            return Err(ApiError::PermissionDenied);
        }
        let _version = packet.decode_str().map_err(|_| ApiError::Error)?;
        let _service_flags = packet.decode_u32().map_err(|_| ApiError::Error)?;
        let client_id = packet.decode_str().map_err(|_| ApiError::Error)?;
        let thread_id = packet.decode_u64().map_err(|_| ApiError::Error)?;
        let method = packet.decode_str().map_err(|_| ApiError::Error)?;

        Ok(Some((client_id, thread_id, method, packet)))
    }

    async fn write_reply(
        &self,
        stream: &mut TcpStream,
        nonce: u32,
        payload: Packet,
        code: i32,
    ) -> ApiResult<()> {
        let mut reply = payload;
        reply.encode_top_i32(code);
        reply.encode_top_u32(PACKET_SERVICE_FLAGS);
        reply.encode_top_u32(nonce);
        reply.encrypt(&self.cfg.encryption_token, true).map_err(|_| ApiError::Error)?;

        for block in reply.as_bytes().chunks(READ_WRITE_SIZE) {
            stream.write_all(block).await?;
        }
        Ok(())
    }

    /// Runs when a client's socket closes for any reason.
    async fn closed_handler(&self, client_id: &str) {
        self.groups.remove_client(client_id).await;
        self.dispatcher.close_client(client_id).await;
    }

    pub async fn shutdown(&self) {
        self.groups.shutdown().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
