//! DBzr Smart Protocol
//!
//! Network side of dbzr:
//! - Framed request/response messages and the media that carry them
//! - An RPC client that remembers which verbs the server lacks
//! - Remote proxies for control directories, repositories and branches,
//!   falling back to plain file operations on older servers
//! - The server-side verb handler

pub mod byte_stream;
pub mod client;
pub mod medium;
pub mod open;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod translate;
pub mod vfs;

pub use client::RpcClient;
pub use medium::{ProtocolVersion, SharedMedium, SmartMedium, TcpMedium};
pub use protocol::{SmartRequest, SmartResponse};
pub use remote::{RemoteBranch, RemoteControlDir, RemoteRepository};
pub use server::{LoopbackMedium, SmartServerHandler};
pub use vfs::SmartTransport;
