//! Operator surface: one request line in, one reply line out.
//!
//!   - "BACKUP <name> <degree>"  -> "OK" | "ERROR <reason>"
//!   - "RESTORE <name>"          -> ""   | "ERROR <reason>"
//!   - "DELETE <name>"           -> ""   | "ERROR <reason>"
//!   - "RECLAIM <bytes>"         -> ""   | "ERROR <reason>"
//!   - "STATE"                   -> JSON document of the peer state
//!
//! File names run to the end of the line (BACKUP: up to the last word), so
//! they may contain spaces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{PeerError, ProtocolError, RpcError};
use crate::peer::Peer;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRequest {
    Backup { name: String, degree: u32 },
    Restore(String),
    Delete(String),
    Reclaim(u64),
    State,
}

impl AdminRequest {
    /// The request line, without newline.
    pub fn to_line(&self) -> String {
        match self {
            AdminRequest::Backup { name, degree } => format!("BACKUP {name} {degree}"),
            AdminRequest::Restore(name) => format!("RESTORE {name}"),
            AdminRequest::Delete(name) => format!("DELETE {name}"),
            AdminRequest::Reclaim(bytes) => format!("RECLAIM {bytes}"),
            AdminRequest::State => "STATE".to_string(),
        }
    }
}

pub fn parse_request(line: &str) -> Result<AdminRequest, ProtocolError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "" => Err(ProtocolError::Empty),
        "BACKUP" => {
            let Some((name, degree)) = rest.rsplit_once(char::is_whitespace) else {
                return Err(ProtocolError::Arity { verb: "BACKUP", expected: 2, got: word_count(rest) });
            };
            let degree = degree.parse().map_err(|_| ProtocolError::InvalidArgument {
                verb: "BACKUP",
                field: "replication degree",
                value: degree.to_string(),
            })?;
            Ok(AdminRequest::Backup { name: name.trim().to_string(), degree })
        }
        "RESTORE" => Ok(AdminRequest::Restore(name_arg("RESTORE", rest)?)),
        "DELETE" => Ok(AdminRequest::Delete(name_arg("DELETE", rest)?)),
        "RECLAIM" => {
            if word_count(rest) != 1 {
                return Err(ProtocolError::Arity { verb: "RECLAIM", expected: 1, got: word_count(rest) });
            }
            let bytes = rest.parse().map_err(|_| ProtocolError::InvalidArgument {
                verb: "RECLAIM",
                field: "quota",
                value: rest.to_string(),
            })?;
            Ok(AdminRequest::Reclaim(bytes))
        }
        "STATE" => {
            if !rest.is_empty() {
                return Err(ProtocolError::Arity { verb: "STATE", expected: 0, got: word_count(rest) });
            }
            Ok(AdminRequest::State)
        }
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

fn name_arg(verb: &'static str, rest: &str) -> Result<String, ProtocolError> {
    if rest.is_empty() {
        return Err(ProtocolError::Arity { verb, expected: 1, got: 0 });
    }
    Ok(rest.to_string())
}

/// Run `request` against `peer` and render the reply line.
pub async fn execute(peer: &Peer, request: AdminRequest) -> String {
    let outcome = match request {
        AdminRequest::Backup { name, degree } => peer.backup(&name, degree).await.map(|()| "OK".to_string()),
        AdminRequest::Restore(name) => peer.restore(&name).await.map(|()| String::new()),
        AdminRequest::Delete(name) => peer.delete(&name).await.map(|()| String::new()),
        AdminRequest::Reclaim(bytes) => peer.reclaim(bytes).await.map(|()| String::new()),
        AdminRequest::State => {
            let state = peer.state().await;
            serde_json::to_string(&state).map_err(PeerError::from)
        }
    };
    outcome.unwrap_or_else(|e| format!("ERROR {e}"))
}

/// Accept admin connections until the task is aborted.
pub async fn serve(peer: Arc<Peer>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!(peer = %peer.id(), %addr, "admin listening");
    }
    loop {
        let (stream, client) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "admin accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            if let Err(e) = handle_client(&peer, stream).await {
                debug!(%client, error = %e, "admin client error");
            }
        });
    }
}

async fn handle_client(peer: &Peer, stream: TcpStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let reply = match parse_request(&line) {
        Ok(request) => {
            debug!(peer = %peer.id(), line = %line.trim(), "admin request");
            execute(peer, request).await
        }
        Err(e) => format!("ERROR {e}"),
    };
    writer.write_all(format!("{reply}\n").as_bytes()).await?;
    writer.flush().await
}

/// Client side: send one request to the admin port at `addr`.
pub async fn send_admin(addr: SocketAddr, request: &AdminRequest, timeout: Duration) -> Result<String, RpcError> {
    Transport::new(timeout).request_line(addr, &request.to_line()).await
}
