//! Transient connections to other peers.
//!
//! Every call opens a fresh TCP connection, writes one header line (plus an
//! optional body), optionally reads one reply line, then closes. Each step is
//! bounded by the configured timeout so an unreachable peer only costs the
//! caller that one call.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::RpcError;
use crate::protocol::Command;

#[derive(Debug, Clone, Copy)]
pub struct Transport {
    timeout: Duration,
}

impl Transport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T>(
        &self,
        addr: SocketAddr,
        fut: impl Future<Output = io::Result<T>>,
    ) -> Result<T, RpcError> {
        match timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(RpcError::from),
            Err(_) => Err(RpcError::Timeout { addr }),
        }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, RpcError> {
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(RpcError::Connect { addr, source }),
            Err(_) => Err(RpcError::Timeout { addr }),
        }
    }

    /// Best-effort send: header line, then `body` if given. No reply is read.
    pub async fn send(&self, addr: SocketAddr, cmd: &Command, body: Option<&[u8]>) -> Result<(), RpcError> {
        let mut stream = self.connect(addr).await?;
        let header = format!("{cmd}\n");
        self.bounded(addr, async {
            stream.write_all(header.as_bytes()).await?;
            if let Some(body) = body {
                stream.write_all(body).await?;
            }
            stream.flush().await?;
            stream.shutdown().await
        })
        .await?;
        tracing::trace!(%addr, line = %cmd, "sent");
        Ok(())
    }

    /// Synchronous request: header line out, one reply line back.
    pub async fn request(&self, addr: SocketAddr, cmd: &Command) -> Result<String, RpcError> {
        self.request_line(addr, &cmd.to_string()).await
    }

    /// Same exchange for a raw line, as spoken on the admin port.
    pub async fn request_line(&self, addr: SocketAddr, line: &str) -> Result<String, RpcError> {
        let stream = self.connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let header = format!("{line}\n");
        self.bounded(addr, async {
            writer.write_all(header.as_bytes()).await?;
            writer.flush().await
        })
        .await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let read = self.bounded(addr, reader.read_line(&mut line)).await?;
        if read == 0 {
            return Err(RpcError::MalformedReply(format!("{addr} closed without replying")));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RingId;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_writes_header_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let transport = Transport::new(Duration::from_secs(1));
        let cmd = Command::Forward { key: RingId(5), degree: 1, len: 3 };
        transport.send(addr, &cmd, Some(b"abc")).await.unwrap();

        assert_eq!(server.await.unwrap(), b"FORWARD 5 1 3\nabc".to_vec());
    }

    #[tokio::test]
    async fn request_reads_one_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let (r, mut w) = s.into_split();
            let mut line = String::new();
            BufReader::new(r).read_line(&mut line).await.unwrap();
            w.write_all(b"PREDECESSOR NONE\n").await.unwrap();
        });

        let transport = Transport::new(Duration::from_secs(1));
        let reply = transport
            .request(addr, &Command::FindPredecessor("127.0.0.1:1".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(reply, "PREDECESSOR NONE");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(s);
        });

        let transport = Transport::new(Duration::from_millis(100));
        let err = transport
            .request(addr, &Command::FindPredecessor("127.0.0.1:1".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Transport::new(Duration::from_secs(1));
        let err = transport
            .send(addr, &Command::UpdatePredecessor(addr), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }));
    }
}
