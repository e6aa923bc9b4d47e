use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::PeerConfig;
use crate::error::ProtocolError;
use crate::peer::Peer;
use crate::protocol::{self, Command, Reply};

/// Longest header line accepted, newline included.
const MAX_LINE_BYTES: u64 = 1024;

/// Body bytes granted one extra rpc timeout each.
const BODY_BYTES_PER_TIMEOUT: u64 = 1 << 20;

#[derive(Error, Debug)]
enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("header line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("timed out reading from client")]
    Timeout,
}

/// Accept loop. Each connection gets a permit from the peer's pool of
/// `max_connections`; the accept waits while the pool is drained.
pub async fn serve(peer: Arc<Peer>, listener: TcpListener) {
    loop {
        let Ok(permit) = Arc::clone(&peer.connections).acquire_owned().await else {
            return;
        };
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(&peer, stream, remote).await {
                // protocol errors just close the connection
                debug!(peer = %peer.id(), %remote, error = %e, "connection dropped");
            }
        });
    }
}

async fn handle_connection(peer: &Arc<Peer>, stream: TcpStream, remote: SocketAddr) -> Result<(), ConnectionError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let config = peer.config();

    let Some(line) = read_header(&mut reader, config.rpc_timeout).await? else {
        return Ok(());
    };
    let cmd = protocol::parse_line(&line)?;
    if let Some(key) = cmd.key().filter(|k| !peer.space().contains(*k)) {
        return Err(ProtocolError::InvalidArgument {
            verb: cmd.verb(),
            field: "key",
            value: key.to_string(),
        }
        .into());
    }
    let body = match cmd.body_len() {
        Some(len) => read_body(&mut reader, len, config).await?,
        None => Vec::new(),
    };
    trace!(peer = %peer.id(), %remote, line = %cmd, "dispatch");

    dispatch(peer, cmd, body, &mut writer).await
}

/// One line, newline stripped. `None` if the client closed without sending.
async fn read_header<R>(reader: &mut R, limit: Duration) -> Result<Option<String>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = timeout(limit, (&mut *reader).take(MAX_LINE_BYTES).read_line(&mut line))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read as u64 == MAX_LINE_BYTES {
        return Err(ConnectionError::LineTooLong);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Exactly `len` bytes, or an error.
async fn read_body<R>(reader: &mut R, len: u64, config: &PeerConfig) -> Result<Vec<u8>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    if len > config.max_body_bytes {
        return Err(ProtocolError::BodyTooLarge { len, limit: config.max_body_bytes }.into());
    }
    let slices = u32::try_from(1 + len / BODY_BYTES_PER_TIMEOUT).unwrap_or(u32::MAX);
    let limit = config.rpc_timeout.saturating_mul(slices);

    let mut body = Vec::with_capacity(len.min(BODY_BYTES_PER_TIMEOUT) as usize);
    timeout(limit, (&mut *reader).take(len).read_to_end(&mut body))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    if body.len() as u64 != len {
        let msg = format!("body ended after {} of {len} bytes", body.len());
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg).into());
    }
    Ok(body)
}

async fn dispatch<W>(peer: &Arc<Peer>, cmd: Command, body: Vec<u8>, writer: &mut W) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    match cmd {
        Command::FindSuccessor { key, candidate, hops } => peer.handle_find_successor(key, candidate, hops).await,
        Command::UpdatePredecessor(addr) => {
            peer.set_predecessor(addr).await;
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                let sent = peer.update_table().await;
                if sent > 0 {
                    debug!(peer = %peer.id(), sent, "holder table pushed to successor");
                }
            });
        }
        Command::UpdateSuccessor(addr) => {
            peer.set_successor(addr).await;
        }
        Command::FindPredecessor(_) => {
            let reply = Reply::Predecessor(peer.predecessor().await.map(|p| p.addr));
            writer.write_all(format!("{reply}\n").as_bytes()).await?;
            writer.flush().await?;
        }
        Command::Forward { key, degree, .. } => peer.accept_forward(key, degree, body).await,
        Command::Replicate { key, degree, .. } => peer.accept_replica(key, degree, body).await,
        Command::Restore { key, requester } => peer.serve_restore(key, requester).await,
        Command::Restored { key, .. } => peer.accept_restored(key, body).await,
        Command::Delete { key, requester } => peer.handle_delete(key, requester).await,
        Command::Removed { key, holder, .. } => peer.handle_removed(key, holder, body).await,
        Command::UpdateTable { key, holder } => peer.handle_update_table(key, holder).await,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RingId;
    use crate::snapshot::{JsonSnapshotStore, SnapshotStore};

    async fn lone_peer(dir: &tempfile::TempDir, max_body_bytes: u64) -> Arc<Peer> {
        let config = PeerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            storage_root: dir.path().to_path_buf(),
            stabilize_interval: Duration::from_secs(3600),
            rpc_timeout: Duration::from_millis(500),
            max_body_bytes,
            ..PeerConfig::default()
        };
        Peer::start(config).await.unwrap()
    }

    /// Writes `bytes`, then reads until the peer closes. A reset counts as
    /// closed.
    async fn exchange(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        out
    }

    #[tokio::test]
    async fn find_predecessor_reports_none_then_address() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        let reply = exchange(peer.addr(), b"FINDPREDECESSOR 127.0.0.1 1\n").await;
        assert_eq!(reply, b"PREDECESSOR NONE\n");

        exchange(peer.addr(), b"UPDATEPREDECESSOR 127.0.0.1 4567\n").await;
        let reply = exchange(peer.addr(), b"FINDPREDECESSOR 127.0.0.1 1\n").await;
        assert_eq!(reply, b"PREDECESSOR 127.0.0.1 4567\n");
    }

    #[tokio::test]
    async fn malformed_line_closes_silently() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        assert!(exchange(peer.addr(), b"FINDSUCCESSOR\n").await.is_empty());
        assert!(exchange(peer.addr(), b"HELLO there\n").await.is_empty());
        assert!(peer.successor().await.is_none());
    }

    #[tokio::test]
    async fn forward_on_lone_peer_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        exchange(peer.addr(), b"FORWARD 17 1 5\nhello").await;
        let ledger = peer.ledger().await;
        assert_eq!(ledger.stored(RingId(17)).unwrap().size, 5);
        assert_eq!(ledger.locations(RingId(17)), &[peer.local()]);
        assert_eq!(peer.blobs().read(RingId(17)).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn keys_outside_the_ring_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        exchange(peer.addr(), b"FORWARD 1000 1 5\nhello").await;
        exchange(peer.addr(), b"UPDATETABLE 256 127.0.0.1 4567\n").await;
        let ledger = peer.ledger().await;
        assert!(ledger.stored_keys().is_empty());
        assert!(ledger.locations(RingId(256)).is_empty());

        exchange(peer.addr(), b"FORWARD 255 1 5\nhello").await;
        assert!(peer.ledger().await.is_stored(RingId(255)));
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 4).await;

        exchange(peer.addr(), b"FORWARD 17 1 10\n0123456789").await;
        assert!(!peer.ledger().await.is_stored(RingId(17)));
    }

    #[tokio::test]
    async fn short_body_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        let mut stream = TcpStream::connect(peer.addr()).await.unwrap();
        stream.write_all(b"FORWARD 17 1 10\nabc").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        assert!(!peer.ledger().await.is_stored(RingId(17)));
    }

    #[tokio::test]
    async fn shutdown_waits_for_connections_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;
        let slots = peer.config().max_connections;

        let mut stream = TcpStream::connect(peer.addr()).await.unwrap();
        stream.write_all(b"FORWARD 17 1 5\nhe").await.unwrap();
        while peer.connections.available_permits() == slots {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopping.is_finished());

        stream.write_all(b"llo").await.unwrap();
        stream.shutdown().await.unwrap();
        stopping.await.unwrap().unwrap();

        let snapshot = JsonSnapshotStore::new(peer.blobs().node_dir().join("records.json"));
        let saved = snapshot.load().await.unwrap().unwrap();
        assert_eq!(saved.stored(RingId(17)).map(|f| f.size), Some(5));
    }

    #[tokio::test]
    async fn update_successor_moves_finger_zero() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir, 1024).await;

        exchange(peer.addr(), b"UPDATESUCCESSOR 127.0.0.1 4568\n").await;
        let state = peer.ring_state().await;
        let successor = state.successor.unwrap();
        assert_eq!(successor.addr, "127.0.0.1:4568".parse().unwrap());
        assert_eq!(state.fingers.get(0), successor);
    }
}
