//! Test support: scripted transports and a real TCP mock backend.
//!
//! Two levels of substitution. [`scripted_transport`] swaps the wire out
//! entirely for in-memory replies, for session and pool tests that do not
//! care about framing. [`MockBackend`] is a real listener speaking the full
//! chunked protocol with its own independently written framing code, so
//! integration tests exercise the production codec against a second
//! implementation of the grammar rather than against itself.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::errors::TransportError;
use crate::session::transport::{
    BackendTransport, MessageStatus, SessionConnector, SERVER_ACCEPT, SERVER_REJECT,
};

/// One canned backend reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Clean response document.
    Document(Vec<u8>),
    /// Response that flips to the error channel partway through: `prefix`
    /// reaches the sink, `error` is the error-channel content.
    ErrorDocument { prefix: Vec<u8>, error: Vec<u8> },
    /// Response arrives only after this delay, for deadline tests.
    Stall(std::time::Duration),
    /// Peer announces exit at the end of the response.
    Exit,
    /// Connection drops instead of answering.
    Disconnect,
}

/// Builds a fault marker document with the given code and message.
pub fn fault_document(code: i32, message: &str) -> Vec<u8> {
    format!(
        "<serviceError><type>{}</type><message>{}</message></serviceError>",
        code, message
    )
    .into_bytes()
}

/// Observation handle for a [`ScriptedTransport`] after it has been moved
/// into a session.
#[derive(Clone)]
pub struct ScriptHandle {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    informed: Arc<AtomicBool>,
}

impl ScriptHandle {
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn informed_on_close(&self) -> bool {
        self.informed.load(Ordering::SeqCst)
    }
}

/// In-memory transport that answers from a script.
///
/// An exhausted script answers every further command with an empty clean
/// document, which keeps reset traffic out of test scripts.
pub struct ScriptedTransport {
    script: VecDeque<ScriptedReply>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    informed: Arc<AtomicBool>,
}

pub fn scripted_transport(script: Vec<ScriptedReply>) -> (ScriptedTransport, ScriptHandle) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let informed = Arc::new(AtomicBool::new(false));
    let handle = ScriptHandle {
        sent: Arc::clone(&sent),
        closed: Arc::clone(&closed),
        informed: Arc::clone(&informed),
    };
    let transport = ScriptedTransport {
        script: script.into(),
        sent,
        closed,
        informed,
    };
    (transport, handle)
}

#[async_trait]
impl BackendTransport for ScriptedTransport {
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.sent
            .lock()
            .push(String::from_utf8_lossy(payload).to_string());
        Ok(())
    }

    async fn read_message(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        error_capture: &mut Vec<u8>,
    ) -> Result<MessageStatus, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        let reply = self
            .script
            .pop_front()
            .unwrap_or(ScriptedReply::Document(Vec::new()));
        match reply {
            ScriptedReply::Document(body) => {
                sink.write_all(&body)
                    .await
                    .map_err(|e| TransportError::io("relaying response payload", &e))?;
                Ok(MessageStatus {
                    error_flagged: false,
                    bytes_to_sink: body.len() as u64,
                    peer_closed: false,
                })
            }
            ScriptedReply::ErrorDocument { prefix, error } => {
                sink.write_all(&prefix)
                    .await
                    .map_err(|e| TransportError::io("relaying response payload", &e))?;
                error_capture.extend_from_slice(&error);
                Ok(MessageStatus {
                    error_flagged: true,
                    bytes_to_sink: prefix.len() as u64,
                    peer_closed: false,
                })
            }
            ScriptedReply::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(MessageStatus {
                    error_flagged: false,
                    bytes_to_sink: 0,
                    peer_closed: false,
                })
            }
            ScriptedReply::Exit => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(MessageStatus {
                    error_flagged: false,
                    bytes_to_sink: 0,
                    peer_closed: true,
                })
            }
            ScriptedReply::Disconnect => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::io(
                    "reading chunk header",
                    &io::Error::new(io::ErrorKind::ConnectionReset, "scripted disconnect"),
                ))
            }
        }
    }

    async fn close(&mut self, inform_peer: bool) {
        self.closed.store(true, Ordering::SeqCst);
        self.informed.store(inform_peer, Ordering::SeqCst);
    }
}

/// Connector that manufactures scripted sessions, the pool-level twin of
/// [`scripted_transport`].
#[derive(Default)]
pub struct ScriptedConnector {
    template: Mutex<Vec<ScriptedReply>>,
    connect_failures: AtomicUsize,
    reject_handshake: AtomicBool,
    connects: AtomicUsize,
    handles: Mutex<Vec<ScriptHandle>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every new session answers from a copy of this script.
    pub fn with_script(script: Vec<ScriptedReply>) -> Self {
        Self {
            template: Mutex::new(script),
            ..Self::default()
        }
    }

    /// The next `n` connection attempts fail at the TCP level.
    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// All further handshakes are answered with the rejection line.
    pub fn reject_handshakes(&self, reject: bool) {
        self.reject_handshake.store(reject, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Handles for every transport handed out so far, in creation order.
    pub fn handles(&self) -> Vec<ScriptHandle> {
        self.handles.lock().clone()
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn BackendTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failures = self.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.connect_failures.store(failures - 1, Ordering::SeqCst);
            return Err(TransportError::Connect {
                host: "scripted".to_string(),
                port: 0,
                message: "connection refused".to_string(),
            });
        }
        if self.reject_handshake.load(Ordering::SeqCst) {
            return Err(TransportError::HandshakeRejected {
                host: "scripted".to_string(),
                port: 0,
                answer: SERVER_REJECT.to_string(),
            });
        }
        let (transport, handle) = scripted_transport(self.template.lock().clone());
        self.handles.lock().push(handle);
        Ok(Box::new(transport))
    }

    fn endpoint(&self) -> String {
        "scripted:0".to_string()
    }
}

/// Shared state between a [`MockBackend`] and its connection tasks.
struct MockState {
    received: Mutex<Vec<String>>,
    sessions_opened: AtomicUsize,
    reject_handshake: AtomicBool,
    rules: Mutex<Vec<(String, ScriptedReply)>>,
}

impl MockState {
    fn reply_for(&self, line: &str) -> ScriptedReply {
        for (needle, reply) in self.rules.lock().iter() {
            if line.contains(needle.as_str()) {
                return reply.clone();
            }
        }
        ScriptedReply::Document(b"ok\n".to_vec())
    }
}

/// A real TCP listener speaking the chunked backend protocol.
pub struct MockBackend {
    host: String,
    port: u16,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(MockState {
            received: Mutex::new(Vec::new()),
            sessions_opened: AtomicUsize::new(0),
            reject_handshake: AtomicBool::new(false),
            rules: Mutex::new(Vec::new()),
        });
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn_state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let _ = serve_connection(stream, conn_state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(Self {
            host: "127.0.0.1".to_string(),
            port,
            state,
            accept_task,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers a canned reply for any command line containing `needle`.
    /// Rules are checked in registration order; unmatched lines get a short
    /// clean document.
    pub fn respond_to(&self, needle: &str, reply: ScriptedReply) {
        self.state.rules.lock().push((needle.to_string(), reply));
    }

    pub fn reject_handshakes(&self, reject: bool) {
        self.state
            .reject_handshake
            .store(reject, Ordering::SeqCst);
    }

    /// Every command line received, across all sessions, in arrival order.
    pub fn received_lines(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<MockState>) -> io::Result<()> {
    let mut stream = BufStream::new(stream);

    // greeting line
    let mut greeting = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        greeting.push(byte);
        if greeting.len() > 512 {
            return Ok(());
        }
    }
    state.sessions_opened.fetch_add(1, Ordering::SeqCst);

    if state.reject_handshake.load(Ordering::SeqCst) {
        stream
            .write_all(format!("{}\n", SERVER_REJECT).as_bytes())
            .await?;
        stream.flush().await?;
        return Ok(());
    }
    stream
        .write_all(format!("{}\n", SERVER_ACCEPT).as_bytes())
        .await?;
    stream.flush().await?;

    while let Some(line) = read_client_message(&mut stream).await? {
        state.received.lock().push(line.clone());
        match state.reply_for(&line) {
            ScriptedReply::Disconnect => return Ok(()),
            ScriptedReply::Exit => {
                write_extension(&mut stream, "status=exit;").await?;
                write_terminator(&mut stream).await?;
                stream.flush().await?;
                return Ok(());
            }
            ScriptedReply::Stall(delay) => {
                tokio::time::sleep(delay).await;
                write_terminator(&mut stream).await?;
                stream.flush().await?;
            }
            ScriptedReply::Document(body) => {
                write_data(&mut stream, &body).await?;
                write_terminator(&mut stream).await?;
                stream.flush().await?;
            }
            ScriptedReply::ErrorDocument { prefix, error } => {
                write_data(&mut stream, &prefix).await?;
                write_extension(&mut stream, "status=error;").await?;
                write_data(&mut stream, &error).await?;
                write_terminator(&mut stream).await?;
                stream.flush().await?;
            }
        }
    }
    Ok(())
}

/// Reads one chunked message from the client. `None` means the client left,
/// either by closing the socket or by sending the exit extension.
async fn read_client_message(stream: &mut BufStream<TcpStream>) -> io::Result<Option<String>> {
    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; 8];
        match stream.read_exact(&mut header).await {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            other => {
                other?;
            }
        }
        let digits = std::str::from_utf8(&header[..7])
            .map_err(|_| io::Error::other("client sent a non-ascii chunk header"))?;
        let size = usize::from_str_radix(digits, 16)
            .map_err(|_| io::Error::other("client sent a bad chunk size"))?;
        let kind = header[7];
        if kind == b'd' && size == 0 {
            break;
        }
        let mut body = vec![0u8; size];
        stream.read_exact(&mut body).await?;
        if kind == b'x' {
            if String::from_utf8_lossy(&body).contains("status=exit") {
                return Ok(None);
            }
        } else {
            payload.extend_from_slice(&body);
        }
    }
    Ok(Some(String::from_utf8_lossy(&payload).to_string()))
}

async fn write_data(stream: &mut BufStream<TcpStream>, body: &[u8]) -> io::Result<()> {
    if body.is_empty() {
        return Ok(());
    }
    stream
        .write_all(format!("{:07x}d", body.len()).as_bytes())
        .await?;
    stream.write_all(body).await
}

async fn write_extension(stream: &mut BufStream<TcpStream>, extension: &str) -> io::Result<()> {
    stream
        .write_all(format!("{:07x}x", extension.len()).as_bytes())
        .await?;
    stream.write_all(extension.as_bytes()).await
}

async fn write_terminator(stream: &mut BufStream<TcpStream>) -> io::Result<()> {
    stream.write_all(b"0000000d").await
}
