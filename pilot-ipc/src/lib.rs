//! Broker IPC for opencode-pilot.
//!
//! Newline-delimited JSON records over a Unix domain socket, plus the
//! reconnecting client each agent session embeds.

mod client;
mod error;
mod protocol;

pub use client::{
    ClientOptions, ConnectionState, NONCE_REQUEST_TIMEOUT, PermissionResponse, SessionClient,
};
pub use error::{ClientError, Result};
pub use protocol::{
    BrokerMessage, ClientMessage, DEFAULT_SOCKET_PATH, MAX_LINE_BYTES, decode_line, encode_line,
    lines_codec,
};
