//! Frame-locked cluster transport.
//! One server drives frames; every client renders the server's shared state for the same frame.

pub mod config;
pub mod connection;
pub mod network;
pub mod protocol;
pub mod shared;
pub mod wire;

pub use config::{ClusterConfig, NetworkMode, NodeConfig, SyncPolicy};
pub use connection::{Connection, ConnectionHandler, ConnectionParams, SendError};
pub use network::{ClusterNetwork, ClusterObserver, NetworkError, NoopObserver, SyncMode};
pub use protocol::{ConnectionKind, Header, MessageKind, Role, HEADER_SIZE};
pub use shared::{deserialize, serialize, CodecError, SharedData, SharedValue, SharedValueRef};
pub use wire::{decode_header, encode_header, encode_message, HeaderError};
