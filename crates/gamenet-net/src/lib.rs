//! Binary messaging protocol over TCP or TLS: framing, fragmentation,
//! client connections with reconnection, and an authenticated server.

pub mod auth;
pub mod error;
pub mod fragment;
pub mod framing;
pub mod messages;
pub mod reassembly;
pub mod reconnection;
pub mod session;
pub mod sink;
pub mod tcp_client;
pub mod tcp_server;
pub mod transport;

pub use auth::{AuthService, AuthServiceError, LoginOutcome, MemoryAuthService, RegisterOutcome};
pub use error::{ConnectionError, DisconnectReason};
pub use fragment::{FragmentError, MAX_FRAGMENT_DATA, TransferId};
pub use framing::{
    Frame, FrameError, FrameFlags, HEADER_SIZE, MAX_MESSAGE_SIZE, MessageType, read_frame,
    write_frame,
};
pub use messages::{AuthReply, AuthRequest, DataType, GameData, PayloadError, RegisterRequest};
pub use reassembly::{Reassembler, ReassemblyBudget, ReassemblyError};
pub use reconnection::{ReconnectConfig, ReconnectError, ReconnectState, ReconnectingClient};
pub use session::{Session, SessionConfig, SessionState};
pub use sink::{DEFAULT_CHUNK_SIZE, FramedSink};
pub use tcp_client::{
    ClientEvent, ClientOptions, ConnectionState, ConnectionStateWatch, GameClient,
};
pub use tcp_server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, GameServer, IdGenerator, ServerError,
    ServerEvent, ServerOptions,
};
pub use transport::{ClientTls, ServerTls, TlsError};
