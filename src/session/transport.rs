//! Backend wire transport.
//!
//! The backend speaks a framed byte protocol over TCP. A session opens with
//! a plain-text greeting exchange, then every message in either direction is
//! a run of chunks. A chunk header is eight ASCII bytes: seven lowercase hex
//! digits carrying the payload size, then one type byte, `d` for data or `x`
//! for an extension. A zero-size data chunk terminates the message.
//!
//! Extensions are `key=value;` pairs. `status=error;` reroutes the data
//! chunks that follow into the error channel, `status=exit;` announces that
//! the peer is closing the conversation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::errors::TransportError;

/// Greeting the client opens a session with.
pub const CLIENT_GREETING: &str = "CLIENT_TESTING_CONNECTION";
/// Answer that accepts the session.
pub const SERVER_ACCEPT: &str = "SERVER_CONNECTION_OK";
/// Answer that rejects the session.
pub const SERVER_REJECT: &str = "PROTOCOL_UNDEFINED";

/// Hex digits in a chunk header.
pub const CHUNK_SIZE_DIGITS: usize = 7;
/// Full header length: size digits plus the type byte.
pub const CHUNK_HEADER_BYTES: usize = CHUNK_SIZE_DIGITS + 1;
/// Largest payload a single chunk header can describe.
pub const MAX_CHUNK_PAYLOAD: usize = 0xfff_ffff;
/// Type byte for payload chunks.
pub const DATA_CHUNK: u8 = b'd';
/// Type byte for extension chunks.
pub const EXTENSION_CHUNK: u8 = b'x';

/// Extension that flips routing to the error channel.
pub const STATUS_ERROR: &str = "status=error";
/// Extension that announces the peer is going away.
pub const STATUS_EXIT: &str = "status=exit";

/// Payload size used when splitting outbound messages into chunks.
const WRITE_CHUNK_BYTES: usize = 65_535;
/// Upper bound on the handshake answer line.
const HANDSHAKE_LINE_MAX: usize = 256;
/// Copy buffer for relaying chunk payloads.
const RELAY_BUFFER_BYTES: usize = 8_192;

/// How one inbound message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStatus {
    /// The peer flagged error content; data after the flag went to the error
    /// capture instead of the sink.
    pub error_flagged: bool,
    /// Bytes relayed to the caller's sink.
    pub bytes_to_sink: u64,
    /// The peer announced exit or closed the connection at a message
    /// boundary. The transport is unusable afterwards.
    pub peer_closed: bool,
}

/// One live conversation with the backend.
#[async_trait]
pub trait BackendTransport: Send {
    /// Sends one complete outbound message.
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Reads one complete inbound message, relaying payload bytes to `sink`
    /// until the peer flags error content, which goes to `error_capture`.
    async fn read_message(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        error_capture: &mut Vec<u8>,
    ) -> Result<MessageStatus, TransportError>;

    /// Closes the conversation. With `inform_peer` the exit extension is sent
    /// first so the peer can wind down instead of seeing a reset.
    async fn close(&mut self, inform_peer: bool);
}

/// Chunk codec over any byte stream.
///
/// Generic so the framing logic can be exercised against in-memory pipes;
/// production sessions use it over a buffered [`TcpStream`].
pub struct ChunkedTransport<S> {
    stream: S,
    peer: String,
    max_chunk_bytes: usize,
    closed: bool,
}

impl<S> ChunkedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>, max_chunk_bytes: usize) -> Self {
        Self {
            stream,
            peer: peer.into(),
            max_chunk_bytes: max_chunk_bytes.min(MAX_CHUNK_PAYLOAD),
            closed: false,
        }
    }

    /// Runs the greeting exchange on a fresh stream.
    pub async fn handshake(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.stream
            .write_all(CLIENT_GREETING.as_bytes())
            .await
            .map_err(|e| TransportError::io("sending handshake greeting", &e))?;
        self.stream
            .write_all(b"\n")
            .await
            .map_err(|e| TransportError::io("sending handshake greeting", &e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::io("sending handshake greeting", &e))?;

        let answer = self.read_handshake_line().await?;
        if answer == SERVER_ACCEPT {
            debug!(peer = %self.peer, "backend session handshake accepted");
            return Ok(());
        }
        Err(TransportError::HandshakeRejected {
            host: host.to_string(),
            port,
            answer,
        })
    }

    async fn read_handshake_line(&mut self) -> Result<String, TransportError> {
        let mut line = Vec::with_capacity(32);
        loop {
            let byte = self
                .stream
                .read_u8()
                .await
                .map_err(|e| TransportError::io("reading handshake answer", &e))?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > HANDSHAKE_LINE_MAX {
                return Err(TransportError::BadFrame {
                    detail: format!("handshake answer exceeds {} bytes", HANDSHAKE_LINE_MAX),
                });
            }
        }
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    async fn write_chunk_header(&mut self, size: usize, kind: u8) -> Result<(), TransportError> {
        let mut header = [0u8; CHUNK_HEADER_BYTES];
        header[..CHUNK_SIZE_DIGITS].copy_from_slice(format!("{:07x}", size).as_bytes());
        header[CHUNK_SIZE_DIGITS] = kind;
        self.stream
            .write_all(&header)
            .await
            .map_err(|e| TransportError::io("sending chunk header", &e))
    }

    /// Reads a full chunk header, or `None` when the peer closed the stream
    /// cleanly at a message boundary.
    async fn read_chunk_header(&mut self) -> Result<Option<[u8; CHUNK_HEADER_BYTES]>, TransportError>
    {
        let mut header = [0u8; CHUNK_HEADER_BYTES];
        let mut filled = 0;
        while filled < CHUNK_HEADER_BYTES {
            let n = self
                .stream
                .read(&mut header[filled..])
                .await
                .map_err(|e| TransportError::io("reading chunk header", &e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::BadFrame {
                    detail: format!(
                        "connection closed {} bytes into a chunk header",
                        filled
                    ),
                });
            }
            filled += n;
        }
        Ok(Some(header))
    }

    fn parse_chunk_header(
        &self,
        header: &[u8; CHUNK_HEADER_BYTES],
    ) -> Result<(usize, u8), TransportError> {
        let digits = std::str::from_utf8(&header[..CHUNK_SIZE_DIGITS]).map_err(|_| {
            TransportError::BadFrame {
                detail: format!("non-ascii size digits {:02x?}", &header[..CHUNK_SIZE_DIGITS]),
            }
        })?;
        let size = usize::from_str_radix(digits, 16).map_err(|_| TransportError::BadFrame {
            detail: format!("unparsable chunk size {:?}", digits),
        })?;
        let kind = header[CHUNK_SIZE_DIGITS];
        if kind != DATA_CHUNK && kind != EXTENSION_CHUNK {
            return Err(TransportError::BadFrame {
                detail: format!("unknown chunk type byte 0x{:02x}", kind),
            });
        }
        if size > self.max_chunk_bytes {
            return Err(TransportError::OversizedChunk {
                size,
                limit: self.max_chunk_bytes,
            });
        }
        Ok((size, kind))
    }

    /// Relays `size` payload bytes to `target`, or buffers them into the
    /// error capture once the error flag is up.
    async fn relay_chunk_payload(
        &mut self,
        mut size: usize,
        target: ChunkTarget<'_, '_>,
    ) -> Result<u64, TransportError> {
        let mut buf = [0u8; RELAY_BUFFER_BYTES];
        let mut relayed = 0u64;
        match target {
            ChunkTarget::Sink(sink) => {
                while size > 0 {
                    let want = size.min(RELAY_BUFFER_BYTES);
                    let n = self
                        .stream
                        .read(&mut buf[..want])
                        .await
                        .map_err(|e| TransportError::io("reading chunk payload", &e))?;
                    if n == 0 {
                        return Err(TransportError::BadFrame {
                            detail: format!(
                                "connection closed with {} payload bytes outstanding",
                                size
                            ),
                        });
                    }
                    size -= n;
                    sink.write_all(&buf[..n])
                        .await
                        .map_err(|e| TransportError::io("relaying response payload", &e))?;
                    relayed += n as u64;
                }
            }
            ChunkTarget::ErrorCapture(capture) => {
                while size > 0 {
                    let want = size.min(RELAY_BUFFER_BYTES);
                    let n = self
                        .stream
                        .read(&mut buf[..want])
                        .await
                        .map_err(|e| TransportError::io("reading chunk payload", &e))?;
                    if n == 0 {
                        return Err(TransportError::BadFrame {
                            detail: format!(
                                "connection closed with {} payload bytes outstanding",
                                size
                            ),
                        });
                    }
                    size -= n;
                    let room = self.max_chunk_bytes.saturating_sub(capture.len());
                    if room > 0 {
                        capture.extend_from_slice(&buf[..n.min(room)]);
                    }
                }
            }
        }
        Ok(relayed)
    }

    async fn read_extension(&mut self, size: usize) -> Result<String, TransportError> {
        let mut raw = vec![0u8; size];
        self.stream
            .read_exact(&mut raw)
            .await
            .map_err(|e| TransportError::io("reading chunk extension", &e))?;
        Ok(String::from_utf8_lossy(&raw).to_string())
    }
}

/// Where the payload of one data chunk goes.
enum ChunkTarget<'a, 'b> {
    Sink(&'a mut (dyn AsyncWrite + Send + Unpin)),
    ErrorCapture(&'b mut Vec<u8>),
}

#[async_trait]
impl<S> BackendTransport for ChunkedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        for piece in payload.chunks(WRITE_CHUNK_BYTES) {
            self.write_chunk_header(piece.len(), DATA_CHUNK).await?;
            self.stream
                .write_all(piece)
                .await
                .map_err(|e| TransportError::io("sending chunk payload", &e))?;
        }
        self.write_chunk_header(0, DATA_CHUNK).await?;
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::io("flushing outbound message", &e))
    }

    async fn read_message(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        error_capture: &mut Vec<u8>,
    ) -> Result<MessageStatus, TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        let mut status = MessageStatus {
            error_flagged: false,
            bytes_to_sink: 0,
            peer_closed: false,
        };
        loop {
            let header = match self.read_chunk_header().await? {
                Some(header) => header,
                None => {
                    // Clean close at a chunk boundary ends the message.
                    status.peer_closed = true;
                    self.closed = true;
                    break;
                }
            };
            let (size, kind) = self.parse_chunk_header(&header)?;
            if kind == DATA_CHUNK && size == 0 {
                break;
            }
            if kind == DATA_CHUNK {
                let target = if status.error_flagged {
                    ChunkTarget::ErrorCapture(&mut *error_capture)
                } else {
                    ChunkTarget::Sink(&mut *sink)
                };
                status.bytes_to_sink += self.relay_chunk_payload(size, target).await?;
                continue;
            }
            let extension = self.read_extension(size).await?;
            for directive in extension.split(';').map(str::trim).filter(|d| !d.is_empty()) {
                match directive {
                    STATUS_ERROR => status.error_flagged = true,
                    STATUS_EXIT => {
                        debug!(peer = %self.peer, "backend announced exit");
                        status.peer_closed = true;
                        self.closed = true;
                    }
                    other => debug!(peer = %self.peer, extension = other, "ignoring extension"),
                }
            }
            if status.peer_closed {
                break;
            }
        }
        sink.flush()
            .await
            .map_err(|e| TransportError::io("flushing relayed response", &e))?;
        Ok(status)
    }

    async fn close(&mut self, inform_peer: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        if inform_peer {
            let exit = format!("{};", STATUS_EXIT);
            let sent = async {
                self.write_chunk_header(exit.len(), EXTENSION_CHUNK).await?;
                self.stream
                    .write_all(exit.as_bytes())
                    .await
                    .map_err(|e| TransportError::io("sending exit extension", &e))?;
                self.write_chunk_header(0, DATA_CHUNK).await?;
                self.stream
                    .flush()
                    .await
                    .map_err(|e| TransportError::io("flushing exit extension", &e))
            }
            .await;
            if let Err(e) = sent {
                debug!(peer = %self.peer, error = %e, "peer gone before exit notice");
            }
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "stream shutdown failed");
        }
    }
}

/// Production transport: the chunk codec over a buffered TCP stream.
pub type TcpTransport = ChunkedTransport<BufStream<TcpStream>>;

impl TcpTransport {
    /// Connects, with a bound on the TCP establishment, and runs the
    /// handshake. Any failure tears the socket down before returning.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        max_chunk_bytes: usize,
    ) -> Result<Self, TransportError> {
        let peer = format!("{}:{}", host, port);
        let attempt = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(connect_timeout, attempt).await {
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                    waited_ms: connect_timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    host: host.to_string(),
                    port,
                    message: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer, error = %e, "could not disable nagle on backend socket");
        }
        let mut transport = ChunkedTransport::new(BufStream::new(stream), peer, max_chunk_bytes);
        transport.handshake(host, port).await?;
        Ok(transport)
    }
}

/// Factory for transports, the seam the pool creates sessions through.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BackendTransport>, TransportError>;

    /// `host:port` label for logs and stats.
    fn endpoint(&self) -> String;
}

#[async_trait]
impl<T: SessionConnector + ?Sized> SessionConnector for std::sync::Arc<T> {
    async fn connect(&self) -> Result<Box<dyn BackendTransport>, TransportError> {
        (**self).connect().await
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

/// Connects real TCP sessions to one backend endpoint.
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    max_chunk_bytes: usize,
}

impl TcpConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        max_chunk_bytes: usize,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            max_chunk_bytes,
        }
    }
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn BackendTransport>, TransportError> {
        let transport = TcpTransport::connect(
            &self.host,
            self.port,
            self.connect_timeout,
            self.max_chunk_bytes,
        )
        .await?;
        Ok(Box::new(transport))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CAP: usize = 1 << 20;

    fn chunk(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = format!("{:07x}", payload.len()).into_bytes();
        out.push(kind);
        out.extend_from_slice(payload);
        out
    }

    fn terminator() -> Vec<u8> {
        chunk(DATA_CHUNK, b"")
    }

    #[tokio::test]
    async fn reads_a_plain_message() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        let mut wire = chunk(DATA_CHUNK, b"The atmosphere ");
        wire.extend(chunk(DATA_CHUNK, b"dataset"));
        wire.extend(terminator());
        server.write_all(&wire).await.unwrap();

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let status = transport.read_message(&mut sink, &mut errors).await.unwrap();

        assert_eq!(sink, b"The atmosphere dataset");
        assert!(errors.is_empty());
        assert!(!status.error_flagged);
        assert!(!status.peer_closed);
        assert_eq!(status.bytes_to_sink, 22);
    }

    #[tokio::test]
    async fn error_extension_reroutes_following_data() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        let mut wire = chunk(DATA_CHUNK, b"partial output");
        wire.extend(chunk(EXTENSION_CHUNK, b"status=error;"));
        wire.extend(chunk(DATA_CHUNK, b"<serviceError>boom</serviceError>"));
        wire.extend(terminator());
        server.write_all(&wire).await.unwrap();

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let status = transport.read_message(&mut sink, &mut errors).await.unwrap();

        assert!(status.error_flagged);
        assert_eq!(sink, b"partial output");
        assert_eq!(errors, b"<serviceError>boom</serviceError>");
    }

    #[tokio::test]
    async fn exit_extension_marks_the_transport_closed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        let mut wire = chunk(DATA_CHUNK, b"bye");
        wire.extend(chunk(EXTENSION_CHUNK, b"status=exit;"));
        server.write_all(&wire).await.unwrap();

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let status = transport.read_message(&mut sink, &mut errors).await.unwrap();
        assert!(status.peer_closed);

        let followup = transport.read_message(&mut sink, &mut errors).await;
        assert!(matches!(followup, Err(TransportError::SessionClosed)));
    }

    #[tokio::test]
    async fn clean_eof_at_chunk_boundary_ends_the_message() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        server.write_all(&chunk(DATA_CHUNK, b"tail")).await.unwrap();
        drop(server);

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let status = transport.read_message(&mut sink, &mut errors).await.unwrap();

        assert_eq!(sink, b"tail");
        assert!(status.peer_closed);
    }

    #[tokio::test]
    async fn truncated_header_is_a_framing_error() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        server.write_all(b"000").await.unwrap();
        drop(server);

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let got = transport.read_message(&mut sink, &mut errors).await;
        assert!(matches!(got, Err(TransportError::BadFrame { .. })));
    }

    #[tokio::test]
    async fn garbage_size_digits_are_rejected() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        server.write_all(b"zzzzzzzd").await.unwrap();

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let got = transport.read_message(&mut sink, &mut errors).await;
        assert!(matches!(got, Err(TransportError::BadFrame { .. })));
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_before_reading_payload() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", 1024);

        server.write_all(b"0001000d").await.unwrap();

        let mut sink = Vec::new();
        let mut errors = Vec::new();
        let got = transport.read_message(&mut sink, &mut errors).await;
        assert!(matches!(
            got,
            Err(TransportError::OversizedChunk { size: 4096, limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn send_message_frames_and_terminates() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        transport.send_message(b"show version;\n").await.unwrap();

        let mut wire = vec![0u8; 14 + 2 * CHUNK_HEADER_BYTES];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..CHUNK_HEADER_BYTES], b"000000ed");
        assert_eq!(&wire[CHUNK_HEADER_BYTES..CHUNK_HEADER_BYTES + 14], b"show version;\n");
        assert_eq!(&wire[CHUNK_HEADER_BYTES + 14..], b"0000000d");
    }

    #[tokio::test]
    async fn handshake_accepts_the_ok_answer() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        let exchange = tokio::spawn(async move {
            let mut greeting = vec![0u8; CLIENT_GREETING.len() + 1];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(&greeting[..CLIENT_GREETING.len()], CLIENT_GREETING.as_bytes());
            server
                .write_all(format!("{}\n", SERVER_ACCEPT).as_bytes())
                .await
                .unwrap();
            server
        });

        transport.handshake("backend", 10022).await.unwrap();
        exchange.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejection_carries_the_answer() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        let exchange = tokio::spawn(async move {
            let mut greeting = vec![0u8; CLIENT_GREETING.len() + 1];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(format!("{}\n", SERVER_REJECT).as_bytes())
                .await
                .unwrap();
            server
        });

        let got = transport.handshake("backend", 10022).await;
        match got {
            Err(TransportError::HandshakeRejected { answer, .. }) => {
                assert_eq!(answer, SERVER_REJECT);
            }
            other => panic!("expected handshake rejection, got {:?}", other.err()),
        }
        exchange.await.unwrap();
    }

    #[tokio::test]
    async fn close_with_inform_sends_the_exit_extension() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = ChunkedTransport::new(client, "test", TEST_CAP);

        transport.close(true).await;

        let expected = {
            let mut wire = chunk(EXTENSION_CHUNK, b"status=exit;");
            wire.extend(terminator());
            wire
        };
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }
}
