//! TCP transport for a lobby connection.
//!
//! [`LobbyTransport`] owns the socket and the active connection cipher. The
//! receive loop is the single driver of inbound traffic: it reads one packet
//! header, then each segment in order, decrypts the segment types that
//! require it, and fans decoded segments out to registered observers. All
//! observers for a segment run concurrently, but the loop does not advance
//! to the next segment until every one of them has completed — later
//! segments must never observe handshake state from before an earlier
//! segment was fully applied.
//!
//! Outgoing writes are serialized under a single-writer lock so concurrent
//! senders (keepalive loop, handshake replies, token requests) never
//! interleave mid-packet.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::core::ipc::{encode_ipc, IpcMessage};
use crate::core::packet::{
    ConnectionType, Packet, PacketHeader, Segment, SegmentHeader, SegmentType,
    PACKET_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use crate::crypto::LobbyCipher;
use crate::error::{ProtocolError, Result};
use crate::protocol::serverbound;

/// Observer for decoded IPC segments.
pub type IpcHandler =
    Arc<dyn Fn(PacketHeader, IpcMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer for non-IPC segments (keepalives, encrypted data, session init).
pub type SegmentHandler =
    Arc<dyn Fn(PacketHeader, Segment) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle returned by `subscribe_*`, used to remove an observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Transport over a lobby connection. Generic over the stream so tests can
/// drive it with an in-memory duplex; production code uses [`TcpStream`].
pub struct LobbyTransport<S = TcpStream> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    cipher: RwLock<Option<LobbyCipher>>,
    ipc_observers: StdMutex<HashMap<ObserverId, IpcHandler>>,
    segment_observers: StdMutex<HashMap<ObserverId, SegmentHandler>>,
    next_observer: AtomicU64,
}

impl<S> Default for LobbyTransport<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> LobbyTransport<S> {
    /// Create a transport with no stream attached. `send` and
    /// `receive_loop` fail with [`ProtocolError::NotConnected`] until
    /// `connect` or `attach` supplies one.
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            cipher: RwLock::new(None),
            ipc_observers: StdMutex::new(HashMap::new()),
            segment_observers: StdMutex::new(HashMap::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Register an observer for decoded IPC segments. Safe to call while a
    /// receive loop is active.
    pub fn subscribe_ipc(&self, handler: IpcHandler) -> Result<ObserverId> {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.ipc_observers
            .lock()
            .map_err(|_| lock_poisoned("ipc observer registry"))?
            .insert(id, handler);
        Ok(id)
    }

    /// Register an observer for non-IPC segments.
    pub fn subscribe_segments(&self, handler: SegmentHandler) -> Result<ObserverId> {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.segment_observers
            .lock()
            .map_err(|_| lock_poisoned("segment observer registry"))?
            .insert(id, handler);
        Ok(id)
    }

    /// Remove a previously registered observer. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: ObserverId) {
        if let Ok(mut map) = self.ipc_observers.lock() {
            map.remove(&id);
        }
        if let Ok(mut map) = self.segment_observers.lock() {
            map.remove(&id);
        }
    }

    /// Install the connection cipher. Called once per connection after the
    /// handshake phrase exchange; Ipc/EncryptedData segments cannot be
    /// decrypted (or sent) before this.
    pub fn set_cipher(&self, cipher: LobbyCipher) -> Result<()> {
        *self
            .cipher
            .write()
            .map_err(|_| lock_poisoned("cipher"))? = Some(cipher);
        Ok(())
    }

    fn with_cipher<T>(&self, f: impl FnOnce(&LobbyCipher) -> Result<T>) -> Result<T> {
        let guard = self.cipher.read().map_err(|_| lock_poisoned("cipher"))?;
        let cipher = guard.as_ref().ok_or(ProtocolError::CipherNotReady)?;
        f(cipher)
    }
}

impl LobbyTransport<TcpStream> {
    /// Establish the TCP connection, failing after `timeout`.
    #[instrument(skip(self, addr))]
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A, timeout: Duration) -> Result<()> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "lobby connect timed out",
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected to lobby");
        self.attach(stream).await;
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> LobbyTransport<S> {
    /// Attach an already-established stream (used by tests with an
    /// in-memory duplex).
    pub async fn attach(&self, stream: S) {
        let (read, write) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
    }

    /// Serialize the packet into one contiguous buffer and write it under
    /// the single-writer lock.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let buf = packet.encode();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        trace!(bytes = buf.len(), segments = packet.header.count, "packet sent");
        Ok(())
    }

    /// Encipher and send one IPC message addressed with `actor` as both
    /// source and target, with markers and timestamp stamped.
    pub async fn send_ipc(&self, actor: u32, opcode: u16, payload: &[u8]) -> Result<()> {
        let mut data = encode_ipc(opcode, payload);
        self.with_cipher(|cipher| cipher.encipher_padded(&mut data))?;
        let packet = Packet::stamped(
            ConnectionType::None,
            vec![Segment::addressed(SegmentType::Ipc, actor, data)],
        );
        debug!(opcode, actor = format_args!("{actor:#x}"), "sending ipc");
        self.send(&packet).await
    }

    /// Send a keepalive ping (or pong) stamped with the current fingerprint.
    pub async fn send_ping(&self, fingerprint: u32, pong: bool) -> Result<()> {
        let segment_type = if pong {
            SegmentType::KeepAlivePong
        } else {
            SegmentType::KeepAlive
        };
        let packet = Packet::new(
            ConnectionType::None,
            vec![Segment::new(segment_type, serverbound::ping(fingerprint))],
        );
        self.send(&packet).await
    }

    /// Derive and install the connection cipher, then announce the keying
    /// inputs to the server with an EncryptionInit segment.
    pub async fn initialize_encryption(&self, phrase: &str, key: u32, version: u32) -> Result<()> {
        self.set_cipher(LobbyCipher::new(phrase, key, version)?)?;
        let payload = serverbound::encryption_init(phrase, key)?;
        let packet = Packet::new(
            ConnectionType::None,
            vec![Segment::new(SegmentType::EncryptionInit, payload)],
        );
        debug!(version, "connection cipher initialized");
        self.send(&packet).await
    }

    /// Read packets until the cancellation token fires or the stream
    /// closes. Stream closure between packets is a clean exit; closure
    /// mid-structure surfaces [`ProtocolError::ConnectionClosed`]. Decode
    /// and observer errors terminate the loop and propagate.
    #[instrument(skip_all)]
    pub async fn receive_loop(&self, cancel: CancellationToken) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::NotConnected)?;

        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("receive loop cancelled");
                    return Ok(());
                }
                r = read_exact_or_eof(reader, &mut header_buf) => r?,
            };
            if read.is_none() {
                debug!("stream closed at packet boundary");
                return Ok(());
            }

            let header = PacketHeader::decode(&header_buf)?;
            trace!(
                size = header.size,
                count = header.count,
                connection = ?header.connection_type,
                "packet header received"
            );

            for _ in 0..header.count {
                let mut seg_buf = [0u8; SEGMENT_HEADER_SIZE];
                read_exact(reader, &mut seg_buf).await?;
                let seg_header = SegmentHeader::decode(&seg_buf)?;

                let mut payload = vec![0u8; seg_header.payload_len()?];
                read_exact(reader, &mut payload).await?;

                if seg_header.segment_type.is_encrypted() {
                    self.with_cipher(|cipher| cipher.decipher(&mut payload))?;
                }

                let segment = Segment {
                    source_actor: seg_header.source_actor,
                    target_actor: seg_header.target_actor,
                    segment_type: seg_header.segment_type,
                    payload,
                };
                trace!(segment = ?segment.segment_type, bytes = segment.payload.len(), "segment received");

                if segment.segment_type == SegmentType::Ipc {
                    let message = IpcMessage::from_segment_payload(&segment.payload)?;
                    self.dispatch_ipc(&header, message).await?;
                } else {
                    self.dispatch_segment(&header, segment).await?;
                }
            }
        }
    }

    async fn dispatch_ipc(&self, header: &PacketHeader, message: IpcMessage) -> Result<()> {
        let handlers: Vec<IpcHandler> = self
            .ipc_observers
            .lock()
            .map_err(|_| lock_poisoned("ipc observer registry"))?
            .values()
            .cloned()
            .collect();
        if handlers.is_empty() {
            warn!(opcode = message.opcode(), "ipc received with no observers");
            return Ok(());
        }
        try_join_all(
            handlers
                .iter()
                .map(|h| h(header.clone(), message.clone())),
        )
        .await?;
        Ok(())
    }

    async fn dispatch_segment(&self, header: &PacketHeader, segment: Segment) -> Result<()> {
        let handlers: Vec<SegmentHandler> = self
            .segment_observers
            .lock()
            .map_err(|_| lock_poisoned("segment observer registry"))?
            .values()
            .cloned()
            .collect();
        try_join_all(
            handlers
                .iter()
                .map(|h| h(header.clone(), segment.clone())),
        )
        .await?;
        Ok(())
    }
}

fn lock_poisoned(what: &str) -> ProtocolError {
    ProtocolError::Decode(format!("{what} lock poisoned"))
}

/// Fill `buf` exactly, mapping a mid-read EOF to a connection error.
async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(())
}

/// Fill `buf` exactly, distinguishing a clean EOF before any byte
/// (`Ok(None)`) from a mid-read closure (`Err(ConnectionClosed)`).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::ConnectionClosed)
            };
        }
        filled += n;
    }
    Ok(Some(()))
}
