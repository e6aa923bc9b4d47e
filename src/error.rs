use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// A wire line that cannot be dispatched.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("{verb} expects {expected} arguments, got {got}")]
    Arity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{verb}: invalid {field} '{value}'")]
    InvalidArgument {
        verb: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("body of {len} bytes exceeds limit of {limit}")]
    BodyTooLarge { len: u64, limit: u64 },
}

/// Failure of a single outbound call to another peer.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

/// Errors surfaced by peer operations.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("no peers available")]
    NoPeersAvailable,

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("transport: {0}")]
    Transport(#[from] RpcError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;
