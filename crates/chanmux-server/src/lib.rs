pub mod connection;
pub mod registry;
pub mod server;
pub mod session;

pub use connection::{
    Connection, ConnectionError, Inbound, MemoryConnection, MemoryPeer, MessageKind, WsConnection,
};
pub use registry::SessionRegistry;
pub use server::{ServerConfig, ServerHandle, start};
pub use session::{Session, SessionConfig, SessionError, SessionState};
