//! Handles naming other peers, and the calls one peer makes on another.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::id::{FileKey, PeerId, RingId, RingSpace};
use crate::protocol::{self, Command, Reply};
use crate::transport::Transport;

/// Names some peer on the ring. Never mutated; replaced when topology moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingReference {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl fmt::Display for RingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl RingReference {
    pub fn new(space: &RingSpace, addr: SocketAddr) -> Self {
        Self { id: space.peer_id(addr.ip(), addr.port()), addr }
    }

    /// Ask this peer to link `requester` into the ring near `key`.
    pub async fn find_successor(
        &self,
        net: &Transport,
        key: RingId,
        requester: SocketAddr,
        hops: u32,
    ) -> Result<(), RpcError> {
        net.send(self.addr, &Command::FindSuccessor { key, candidate: requester, hops }, None)
            .await
    }

    /// Tell `via` to consider `candidate` its predecessor.
    pub async fn notify_predecessor(
        net: &Transport,
        candidate: SocketAddr,
        via: SocketAddr,
    ) -> Result<(), RpcError> {
        net.send(via, &Command::UpdatePredecessor(candidate), None).await
    }

    /// Tell this peer to adopt `successor`.
    pub async fn set_successor(&self, net: &Transport, successor: SocketAddr) -> Result<(), RpcError> {
        net.send(self.addr, &Command::UpdateSuccessor(successor), None).await
    }

    /// Ask this peer for its predecessor. `None` when it has none yet.
    pub async fn get_predecessor(
        &self,
        space: &RingSpace,
        net: &Transport,
        requester: SocketAddr,
    ) -> Result<Option<RingReference>, RpcError> {
        let line = net.request(self.addr, &Command::FindPredecessor(requester)).await?;
        match protocol::parse_reply(&line) {
            Ok(Reply::Predecessor(addr)) => Ok(addr.map(|a| RingReference::new(space, a))),
            Err(e) => Err(RpcError::MalformedReply(format!("{line:?}: {e}"))),
        }
    }

    /// Hand a file body to this peer for storage. No acknowledgment.
    pub async fn forward_backup(
        &self,
        net: &Transport,
        key: FileKey,
        degree: u32,
        body: &[u8],
    ) -> Result<(), RpcError> {
        let cmd = Command::Forward { key, degree, len: body.len() as u64 };
        net.send(self.addr, &cmd, Some(body)).await
    }

    pub async fn replicate(
        &self,
        net: &Transport,
        key: FileKey,
        degree: u32,
        body: &[u8],
    ) -> Result<(), RpcError> {
        let cmd = Command::Replicate { key, degree, len: body.len() as u64 };
        net.send(self.addr, &cmd, Some(body)).await
    }

    pub async fn restore(&self, net: &Transport, key: FileKey, requester: SocketAddr) -> Result<(), RpcError> {
        net.send(self.addr, &Command::Restore { key, requester }, None).await
    }

    /// Stream a stored body back to the peer that asked for it.
    pub async fn deliver_restored(&self, net: &Transport, key: FileKey, body: &[u8]) -> Result<(), RpcError> {
        let cmd = Command::Restored { key, len: body.len() as u64 };
        net.send(self.addr, &cmd, Some(body)).await
    }

    pub async fn delete(&self, net: &Transport, key: FileKey, requester: SocketAddr) -> Result<(), RpcError> {
        net.send(self.addr, &Command::Delete { key, requester }, None).await
    }

    /// Report that `holder` evicted `key`, handing over the bytes.
    pub async fn removed(
        &self,
        net: &Transport,
        key: FileKey,
        holder: SocketAddr,
        body: &[u8],
    ) -> Result<(), RpcError> {
        let cmd = Command::Removed { key, holder, len: body.len() as u64 };
        net.send(self.addr, &cmd, Some(body)).await
    }

    pub async fn update_table(&self, net: &Transport, key: FileKey, holder: SocketAddr) -> Result<(), RpcError> {
        net.send(self.addr, &Command::UpdateTable { key, holder }, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_follows_address() {
        let space = RingSpace::new(8).unwrap();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let r = RingReference::new(&space, addr);
        assert_eq!(r.id, space.peer_id(addr.ip(), addr.port()));
        assert_eq!(r, RingReference::new(&space, addr));
        assert_eq!(r.to_string(), format!("{}@127.0.0.1:7000", r.id));
    }
}
