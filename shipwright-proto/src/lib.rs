//! Wire protocol for the bootstrap server↔client RPC (spec §4.7/§4.8).
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix over a mutually-authenticated TLS connection.
//! [`tls`] generates the ephemeral CA and per-peer certificates; [`codec`]
//! frames messages and streams resource bytes; [`message`] defines the
//! request/response/command vocabulary.

mod codec;
mod message;
pub mod tls;

pub use codec::{recv, recv_resource_to_writer, send, send_resource_from_reader};
pub use message::{
    Command, ErrorCode, ErrorInfo, Request, Response, ResourceFrame, PROTOCOL_VERSION,
    RESOURCE_CHUNK_SIZE, SERVER_PORT,
};
