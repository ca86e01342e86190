// IPC module - Communication between the CLI and a running supervisor

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Command, ErrorReply, Request, Response, ResponseData};
pub use server::{IpcServer, DEFAULT_SOCKET_PATH};
