//! Backend sessions and their wire transport.

pub mod backend_session;
pub mod transport;

pub use backend_session::{BackendSession, CommandOutcome, SessionState};
pub use transport::{
    BackendTransport, ChunkedTransport, MessageStatus, SessionConnector, TcpConnector,
    TcpTransport,
};
