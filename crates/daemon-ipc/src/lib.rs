//! Request-port protocol and server.
//!
//! A JSON-RPC-like protocol over Unix domain sockets. Each connection opens
//! with a handshake frame carrying the protocol-version sentinel and the
//! client's identity; every subsequent line is one request executed on
//! behalf of the attached process.

mod error;
mod protocol;
mod server;
mod status;

pub use error::{IpcError, IpcResult};
pub use protocol::{Hello, Method, Request, Response};
pub use server::{IpcClient, IpcServer, RequestHandler};
pub use status::StatusCode;
