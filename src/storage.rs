//! Backup, restore, delete and reclaim, on both ends of the wire.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::id::{FileKey, is_between};
use crate::peer::Peer;
use crate::reference::RingReference;

impl Peer {
    /* ---------------- operator side ---------------- */

    /// Send the whole file at `name` towards the peer nearest to its key.
    pub async fn backup(&self, name: &str, replication_degree: u32) -> Result<()> {
        let key = self.space.file_key(name);
        let target = {
            let ring = self.ring.read().await;
            if ring.fingers.is_empty() {
                return Err(PeerError::NoPeersAvailable);
            }
            ring.fingers.nearest_peer(key)
        };

        let body = match fs::read(name).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PeerError::FileNotFound(Path::new(name).to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        self.ledger.write().await.mark_requested(key);
        target.forward_backup(&self.net, key, replication_degree, &body).await?;
        info!(peer = %self.local.id, %key, size = body.len(), to = %target, "backup dispatched");
        Ok(())
    }

    /// Ask the ring to stream `name` back into our restore directory.
    pub async fn restore(&self, name: &str) -> Result<()> {
        let key = self.space.file_key(name);
        let target = {
            let ring = self.ring.read().await;
            if ring.successor.is_none() {
                return Err(PeerError::NoPeersAvailable);
            }
            ring.fingers.nearest_peer(key)
        };

        self.pending_restores.write().await.insert(key, name.to_string());
        if let Err(e) = target.restore(&self.net, key, self.local.addr).await {
            self.pending_restores.write().await.remove(&key);
            return Err(e.into());
        }
        info!(peer = %self.local.id, %key, to = %target, "restore requested");
        Ok(())
    }

    /// Drop our own copy and walk a DELETE around the ring.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let key = self.space.file_key(name);
        let Some(successor) = self.successor().await else {
            return Err(PeerError::NoPeersAvailable);
        };

        let held = {
            let mut ledger = self.ledger.write().await;
            ledger.unmark_requested(key);
            ledger.forget(key).is_some()
        };
        if held {
            self.blobs.remove(key).await?;
        }

        successor.delete(&self.net, key, self.local.addr).await?;
        info!(peer = %self.local.id, %key, "delete sent");
        Ok(())
    }

    /// Lower the quota to `quota_bytes` and evict random stored keys until
    /// usage fits, or nothing is left.
    pub async fn reclaim(&self, quota_bytes: u64) -> Result<()> {
        if self.successor().await.is_none() {
            return Err(PeerError::NoPeersAvailable);
        }
        self.ledger.write().await.set_quota(quota_bytes);

        let mut evicted = 0usize;
        loop {
            let victim = {
                let ledger = self.ledger.read().await;
                if !ledger.is_over_quota() {
                    break;
                }
                ledger.random_stored()
            };
            let Some(key) = victim else { break };

            self.send_removed(key).await;
            {
                let mut ledger = self.ledger.write().await;
                ledger.remove_stored(key);
                ledger.remove_location(key, &self.local);
            }
            if let Err(e) = self.blobs.remove(key).await {
                warn!(peer = %self.local.id, %key, error = %e, "could not delete evicted blob");
            }
            evicted += 1;
        }

        let occupied = self.ledger.read().await.occupied();
        info!(peer = %self.local.id, quota = quota_bytes, occupied, evicted, "reclaim done");
        Ok(())
    }

    /// Hand an evicted body to the peer most interested in it.
    async fn send_removed(&self, key: FileKey) {
        let body = match self.blobs.read(key).await {
            Ok(body) => body,
            Err(e) => {
                warn!(peer = %self.local.id, %key, error = %e, "evicted blob unreadable, not announced");
                return;
            }
        };
        let target = {
            let ring = self.ring.read().await;
            let nearest = ring.fingers.nearest_peer(key);
            if nearest.id == self.local.id { ring.successor } else { Some(nearest) }
        };
        let Some(target) = target else { return };
        if let Err(e) = target.removed(&self.net, key, self.local.addr, &body).await {
            warn!(peer = %self.local.id, %key, to = %target, error = %e, "REMOVED not delivered");
        }
    }

    /// Push every holder of the keys we are responsible for to our successor.
    /// Returns the number of notifications sent.
    pub async fn update_table(&self) -> usize {
        let (predecessor, successor) = {
            let ring = self.ring.read().await;
            (ring.predecessor, ring.successor)
        };
        let (Some(predecessor), Some(successor)) = (predecessor, successor) else {
            return 0;
        };
        if successor.id == self.local.id {
            return 0;
        }

        let local = self.local.id;
        let pushes: Vec<(FileKey, SocketAddr)> = {
            let ledger = self.ledger.read().await;
            ledger
                .all_locations()
                .filter(|(key, _)| *key == local || is_between(*key, predecessor.id, local))
                .flat_map(|(key, holders)| holders.iter().map(move |h| (key, h.addr)))
                .collect()
        };

        let mut sent = 0;
        for (key, holder) in pushes {
            match successor.update_table(&self.net, key, holder).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %local, %key, error = %e, "UPDATETABLE not delivered"),
            }
        }
        sent
    }

    /* ---------------- wire side ---------------- */

    /// Keep `body` under `key`, replacing any earlier copy. False if the quota
    /// does not allow it.
    async fn store_copy(&self, key: FileKey, degree: u32, body: &[u8]) -> Result<bool> {
        let size = body.len() as u64;
        let previous = {
            let mut ledger = self.ledger.write().await;
            if !ledger.fits(key, size) {
                return Ok(false);
            }
            let previous = ledger.stored(key);
            ledger.record_stored(key, size, degree);
            ledger.add_location(key, self.local);
            previous
        };

        if let Err(e) = self.blobs.save(key, body).await {
            let mut ledger = self.ledger.write().await;
            match previous {
                Some(p) => ledger.record_stored(key, p.size, p.replication_degree),
                None => {
                    ledger.remove_stored(key);
                    ledger.remove_location(key, &self.local);
                }
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// FORWARD: store if the key is ours, otherwise pass it one hop on.
    pub(crate) async fn accept_forward(&self, key: FileKey, degree: u32, body: Vec<u8>) {
        if let Some(next) = self.next_hop(key).await {
            debug!(peer = %self.local.id, %key, to = %next, "forwarding backup");
            if let Err(e) = next.forward_backup(&self.net, key, degree, &body).await {
                warn!(peer = %self.local.id, %key, to = %next, error = %e, "FORWARD not delivered");
            }
            return;
        }

        match self.store_copy(key, degree, &body).await {
            Ok(true) => {
                info!(peer = %self.local.id, %key, size = body.len(), "stored");
                if degree > 1 {
                    self.replicate_onward(key, degree - 1, &body).await;
                }
            }
            Ok(false) => warn!(peer = %self.local.id, %key, size = body.len(), "quota exhausted, backup dropped"),
            Err(e) => warn!(peer = %self.local.id, %key, error = %e, "could not store backup"),
        }
    }

    /// REPLICATE: keep a copy and pass the remaining degree on.
    pub(crate) async fn accept_replica(&self, key: FileKey, degree: u32, body: Vec<u8>) {
        match self.store_copy(key, degree, &body).await {
            Ok(true) => debug!(peer = %self.local.id, %key, "replica stored"),
            Ok(false) => warn!(peer = %self.local.id, %key, "quota exhausted, replica dropped"),
            Err(e) => warn!(peer = %self.local.id, %key, error = %e, "could not store replica"),
        }
        if degree > 1 {
            self.replicate_onward(key, degree - 1, &body).await;
        }
    }

    async fn replicate_onward(&self, key: FileKey, degree: u32, body: &[u8]) {
        let Some(successor) = self.ring.read().await.remote_successor(self.local.id) else {
            return;
        };
        match successor.replicate(&self.net, key, degree, body).await {
            Ok(()) => {
                self.ledger.write().await.add_location(key, successor);
            }
            Err(e) => warn!(peer = %self.local.id, %key, to = %successor, error = %e, "REPLICATE not delivered"),
        }
    }

    /// RESTORE: answer the requester directly if we hold the key.
    pub(crate) async fn serve_restore(&self, key: FileKey, requester: SocketAddr) {
        if self.ledger.read().await.is_stored(key) {
            let body = match self.blobs.read(key).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(peer = %self.local.id, %key, error = %e, "stored blob unreadable");
                    return;
                }
            };
            let to = RingReference::new(&self.space, requester);
            if let Err(e) = to.deliver_restored(&self.net, key, &body).await {
                warn!(peer = %self.local.id, %key, to = %to, error = %e, "RESTORED not delivered");
            }
            return;
        }

        match self.next_hop(key).await {
            Some(next) => {
                if let Err(e) = next.restore(&self.net, key, requester).await {
                    warn!(peer = %self.local.id, %key, to = %next, error = %e, "RESTORE not forwarded");
                }
            }
            None => warn!(peer = %self.local.id, %key, %requester, "restore miss: key not held"),
        }
    }

    /// RESTORED: write the body under the name it was requested with.
    pub(crate) async fn accept_restored(&self, key: FileKey, body: Vec<u8>) {
        let name = self
            .pending_restores
            .write()
            .await
            .remove(&key)
            .unwrap_or_else(|| key.to_string());
        match self.blobs.save_restored(&name, &body).await {
            Ok(path) => info!(peer = %self.local.id, %key, path = %path.display(), "file restored"),
            Err(e) => warn!(peer = %self.local.id, %key, error = %e, "could not write restored file"),
        }
    }

    /// DELETE: drop our copy, then pass the walk on until it reaches the
    /// requester's position, member or not.
    pub(crate) async fn handle_delete(&self, key: FileKey, requester: SocketAddr) {
        let held = self.ledger.write().await.forget(key).is_some();
        if held {
            if let Err(e) = self.blobs.remove(key).await {
                warn!(peer = %self.local.id, %key, error = %e, "could not delete blob");
            }
            info!(peer = %self.local.id, %key, "deleted");
        }

        let Some(successor) = self.ring.read().await.remote_successor(self.local.id) else {
            return;
        };
        let origin = RingReference::new(&self.space, requester);
        if successor.addr == requester
            || successor.id == origin.id
            || is_between(origin.id, self.local.id, successor.id)
        {
            return;
        }
        if let Err(e) = successor.delete(&self.net, key, requester).await {
            warn!(peer = %self.local.id, %key, to = %successor, error = %e, "DELETE not forwarded");
        }
    }

    /// REMOVED: `holder` evicted `key`. Take the copy over if we can.
    pub(crate) async fn handle_removed(&self, key: FileKey, holder: SocketAddr, body: Vec<u8>) {
        if holder == self.local.addr {
            return;
        }
        let evicted_by = RingReference::new(&self.space, holder);
        let already_held = {
            let mut ledger = self.ledger.write().await;
            ledger.remove_location(key, &evicted_by);
            ledger.is_stored(key)
        };
        if already_held {
            return;
        }
        match self.store_copy(key, 1, &body).await {
            Ok(true) => info!(peer = %self.local.id, %key, from = %evicted_by, "re-replicated evicted file"),
            Ok(false) => debug!(peer = %self.local.id, %key, "no room to re-replicate"),
            Err(e) => warn!(peer = %self.local.id, %key, error = %e, "could not re-replicate"),
        }
    }

    /// UPDATETABLE: remember `holder` as a holder of `key`.
    pub(crate) async fn handle_update_table(&self, key: FileKey, holder: SocketAddr) {
        let holder = RingReference::new(&self.space, holder);
        self.ledger.write().await.add_location(key, holder);
    }
}
