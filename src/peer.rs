use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::config::PeerConfig;
use crate::error::{PeerError, Result, RpcError};
use crate::finger_table::FingerTable;
use crate::id::{FileKey, PeerId, RingId, RingSpace, is_between};
use crate::ledger::StorageLedger;
use crate::reference::RingReference;
use crate::server;
use crate::snapshot::{JsonSnapshotStore, SnapshotStore};
use crate::stabilizer::Stabilizer;
use crate::transport::Transport;

/// Forwards a join request may take before it is dropped.
pub const MAX_JOIN_HOPS: u32 = 256;

/// Ring links of one peer. Always read and written as a unit.
#[derive(Debug, Clone)]
pub struct RingState {
    pub predecessor: Option<RingReference>,
    pub successor: Option<RingReference>,
    pub next_successor: Option<RingReference>,
    pub fingers: FingerTable,
}

impl RingState {
    fn new(local: RingReference, size: usize) -> Self {
        Self {
            predecessor: None,
            successor: None,
            next_successor: None,
            fingers: FingerTable::new(size, local),
        }
    }

    /// Successor and finger 0 move together. Returns false if nothing changed.
    fn adopt_successor(&mut self, successor: RingReference) -> bool {
        if self.successor == Some(successor) && self.fingers.get(0) == successor {
            return false;
        }
        self.successor = Some(successor);
        self.fingers.set(0, successor);
        true
    }

    /// A successor that is some other peer.
    pub(crate) fn remote_successor(&self, local: PeerId) -> Option<RingReference> {
        self.successor.filter(|s| s.id != local)
    }

    fn owns(&self, local: PeerId, key: FileKey) -> bool {
        if self.remote_successor(local).is_none() {
            return true;
        }
        match self.predecessor {
            None => true,
            Some(pred) => key == local || is_between(key, pred.id, local),
        }
    }

    /// One hop towards `key`: the nearest finger if it gets strictly closer,
    /// the successor otherwise.
    fn route(&self, local: PeerId, key: FileKey) -> Option<RingReference> {
        let successor = self.remote_successor(local)?;
        let candidate = self.fingers.nearest_peer(key);
        if candidate.id != local && (candidate.id == key || is_between(candidate.id, local, key)) {
            Some(candidate)
        } else {
            Some(successor)
        }
    }
}

/// Snapshot of a peer, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PeerState {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub predecessor: Option<RingReference>,
    pub successor: Option<RingReference>,
    pub next_successor: Option<RingReference>,
    pub fingers: Vec<PeerId>,
    pub stored: Vec<(FileKey, u64)>,
    pub requested: Vec<FileKey>,
    pub quota_bytes: u64,
    pub occupied_bytes: u64,
}

/// One ring member: identity, ring links, ledger and the tasks serving them.
pub struct Peer {
    pub(crate) local: RingReference,
    pub(crate) space: RingSpace,
    pub(crate) config: PeerConfig,
    pub(crate) net: Transport,
    pub(crate) ring: RwLock<RingState>,
    pub(crate) ledger: RwLock<StorageLedger>,
    pub(crate) blobs: BlobStore,
    snapshots: Arc<dyn SnapshotStore>,

    /// Restores in flight: key -> name the file is written back under.
    pub(crate) pending_restores: RwLock<HashMap<FileKey, String>>,

    /// One permit per inbound connection being served.
    pub(crate) connections: Arc<Semaphore>,
    connection_slots: u32,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("local", &self.local).finish_non_exhaustive()
    }
}

impl Peer {
    /// Bind the listener, load the ledger, start serving and stabilizing, and
    /// join through `config.bootstrap` if one is given.
    pub async fn start(config: PeerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let space = config.ring_space()?;
        let connection_slots = u32::try_from(config.max_connections)
            .map_err(|_| PeerError::Config(format!("max connections too large: {}", config.max_connections)))?;

        let listener = TcpListener::bind(config.listen).await?;
        let bound = listener.local_addr()?;
        let advertised = config.advertise.unwrap_or(bound);
        if advertised.ip().is_unspecified() {
            warn!(%advertised, "advertising an unspecified address; set an explicit advertise address");
        }
        let local = RingReference::new(&space, advertised);

        let blobs = BlobStore::new(&config.storage_root, local.id);
        blobs.init().await?;
        let snapshots: Arc<dyn SnapshotStore> =
            Arc::new(JsonSnapshotStore::new(blobs.node_dir().join("records.json")));
        let ledger = match snapshots.load().await? {
            Some(ledger) => {
                info!(peer = %local.id, stored = ledger.stored_keys().len(), "ledger restored from snapshot");
                ledger
            }
            None => StorageLedger::new(config.quota_bytes),
        };

        let peer = Arc::new(Self {
            local,
            space,
            net: Transport::new(config.rpc_timeout),
            ring: RwLock::new(RingState::new(local, space.finger_count())),
            ledger: RwLock::new(ledger),
            blobs,
            snapshots,
            pending_restores: RwLock::new(HashMap::new()),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            connection_slots,
            tasks: Mutex::new(Vec::new()),
            config,
        });
        info!(peer = %peer.local.id, addr = %peer.local.addr, bits = space.bits(), "peer listening");

        let serve = tokio::spawn(server::serve(Arc::clone(&peer), listener));
        let stabilize = Stabilizer::new(Arc::clone(&peer)).spawn();
        peer.tasks.lock().await.extend([serve, stabilize]);

        if let Some(bootstrap) = peer.config.bootstrap {
            if let Err(e) = peer.join(bootstrap).await {
                peer.abort_tasks().await;
                return Err(e);
            }
        }
        Ok(peer)
    }

    /// Stop serving, let connections in progress finish, and persist the
    /// ledger.
    pub async fn shutdown(&self) -> Result<()> {
        self.abort_tasks().await;
        // every permit back means no handler can touch the ledger any more
        if let Ok(drained) = self.connections.acquire_many(self.connection_slots).await {
            drained.forget();
            self.connections.close();
        }
        let ledger = self.ledger.read().await.clone();
        self.snapshots.save(&ledger).await?;
        info!(peer = %self.local.id, "peer stopped, ledger saved");
        Ok(())
    }

    /// Returns once the tasks are gone, listener included.
    async fn abort_tasks(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn id(&self) -> PeerId {
        self.local.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.local.addr
    }

    pub fn local(&self) -> RingReference {
        self.local
    }

    pub fn space(&self) -> RingSpace {
        self.space
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub async fn successor(&self) -> Option<RingReference> {
        self.ring.read().await.successor
    }

    pub async fn predecessor(&self) -> Option<RingReference> {
        self.ring.read().await.predecessor
    }

    pub async fn next_successor(&self) -> Option<RingReference> {
        self.ring.read().await.next_successor
    }

    pub async fn ring_state(&self) -> RingState {
        self.ring.read().await.clone()
    }

    pub async fn ledger(&self) -> StorageLedger {
        self.ledger.read().await.clone()
    }

    pub async fn state(&self) -> PeerState {
        let ring = self.ring.read().await.clone();
        let ledger = self.ledger.read().await;
        PeerState {
            id: self.local.id,
            addr: self.local.addr,
            predecessor: ring.predecessor,
            successor: ring.successor,
            next_successor: ring.next_successor,
            fingers: ring.fingers.ids(),
            stored: ledger
                .stored_keys()
                .into_iter()
                .filter_map(|k| ledger.stored(k).map(|f| (k, f.size)))
                .collect(),
            requested: ledger.requested_keys(),
            quota_bytes: ledger.quota(),
            occupied_bytes: ledger.occupied(),
        }
    }

    /* ---------------- JOIN ---------------- */

    /// Link into an existing ring through `bootstrap`.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<()> {
        let contact = RingReference::new(&self.space, bootstrap);
        {
            let mut ring = self.ring.write().await;
            ring.adopt_successor(contact);
            ring.fingers.replace_all(contact);
        }
        contact.find_successor(&self.net, self.local.id, self.local.addr, 0).await?;
        info!(peer = %self.local.id, via = %contact, "join requested");
        Ok(())
    }

    /// FINDSUCCESSOR from `candidate_addr`, which wants a place near `key`.
    /// `hops` is how often the request was forwarded before reaching us.
    pub(crate) async fn handle_find_successor(&self, key: RingId, candidate_addr: SocketAddr, hops: u32) {
        enum Step {
            Adopted,
            Spliced(RingReference),
            Forward(RingReference),
            Ignore,
        }

        if candidate_addr == self.local.addr {
            return;
        }
        let candidate = RingReference::new(&self.space, candidate_addr);
        let local = self.local.id;
        if key == local {
            warn!(peer = %local, candidate = %candidate, %key, "join refused: id already taken by this peer");
            return;
        }

        let step = {
            let mut ring = self.ring.write().await;
            match ring.remote_successor(local) {
                None => {
                    ring.adopt_successor(candidate);
                    if ring.predecessor.is_none() {
                        ring.predecessor = Some(candidate);
                    }
                    Step::Adopted
                }
                Some(succ) if succ.addr == candidate.addr => Step::Ignore,
                Some(succ) if succ.id == key => {
                    warn!(peer = %local, candidate = %candidate, %key, taken_by = %succ, "join refused: id already taken");
                    Step::Ignore
                }
                Some(succ) if is_between(key, local, succ.id) => {
                    ring.next_successor = Some(succ);
                    ring.adopt_successor(candidate);
                    Step::Spliced(succ)
                }
                Some(_) => match ring.route(local, key) {
                    Some(next) => Step::Forward(next),
                    None => Step::Ignore,
                },
            }
        };

        let sent = match step {
            Step::Adopted => {
                info!(peer = %local, successor = %candidate, "first peer joined");
                RingReference::notify_predecessor(&self.net, self.local.addr, candidate.addr).await
            }
            Step::Spliced(old) => {
                info!(peer = %local, successor = %candidate, next = %old, "peer spliced in");
                self.splice(candidate, old).await
            }
            Step::Forward(_) if hops >= MAX_JOIN_HOPS => {
                warn!(peer = %local, candidate = %candidate, %key, hops, "join request dropped: hop limit reached");
                Ok(())
            }
            Step::Forward(next) => {
                debug!(peer = %local, %key, to = %next, hops, "forwarding join");
                next.find_successor(&self.net, key, candidate_addr, hops + 1).await
            }
            Step::Ignore => Ok(()),
        };
        if let Err(e) = sent {
            warn!(peer = %local, candidate = %candidate, error = %e, "join handling failed");
        }
    }

    /// Tell `candidate` its neighbours and `old` its new predecessor.
    async fn splice(&self, candidate: RingReference, old: RingReference) -> std::result::Result<(), RpcError> {
        candidate.set_successor(&self.net, old.addr).await?;
        RingReference::notify_predecessor(&self.net, self.local.addr, candidate.addr).await?;
        RingReference::notify_predecessor(&self.net, candidate.addr, old.addr).await
    }

    /// Returns true if the predecessor changed.
    pub(crate) async fn set_predecessor(&self, addr: SocketAddr) -> bool {
        if addr == self.local.addr {
            return false;
        }
        let reference = RingReference::new(&self.space, addr);
        let mut ring = self.ring.write().await;
        if ring.predecessor == Some(reference) {
            return false;
        }
        ring.predecessor = Some(reference);
        debug!(peer = %self.local.id, predecessor = %reference, "predecessor updated");
        true
    }

    pub(crate) async fn set_successor(&self, addr: SocketAddr) -> bool {
        if addr == self.local.addr {
            return false;
        }
        let reference = RingReference::new(&self.space, addr);
        let changed = self.ring.write().await.adopt_successor(reference);
        if changed {
            debug!(peer = %self.local.id, successor = %reference, "successor updated");
        }
        changed
    }

    /* ---------------- STABILIZATION ---------------- */

    /// One stabilization pass. Returns true if the successor changed.
    pub async fn stabilize(&self) -> std::result::Result<bool, RpcError> {
        let Some(successor) = self.successor().await else {
            return Ok(false);
        };
        let candidate = successor
            .get_predecessor(&self.space, &self.net, self.local.addr)
            .await?;
        Ok(self.consider_successor(successor, candidate).await)
    }

    /// Adopt `candidate` (the predecessor reported by `queried`) if it sits
    /// between us and our successor. Stale answers are dropped.
    pub async fn consider_successor(&self, queried: RingReference, candidate: Option<RingReference>) -> bool {
        let Some(candidate) = candidate else { return false };
        if candidate.id == self.local.id {
            return false;
        }
        let mut ring = self.ring.write().await;
        let Some(successor) = ring.successor else { return false };
        if successor != queried {
            return false;
        }
        if is_between(candidate.id, self.local.id, successor.id) || self.local.id == successor.id {
            let changed = ring.adopt_successor(candidate);
            if changed {
                info!(peer = %self.local.id, successor = %candidate, "successor adopted");
            }
            return changed;
        }
        false
    }

    /// Replace an unreachable successor with the remembered next one.
    pub async fn promote_next_successor(&self) -> bool {
        let mut ring = self.ring.write().await;
        let Some(next) = ring.next_successor.take() else { return false };
        if next.id == self.local.id || ring.successor == Some(next) {
            return false;
        }
        ring.adopt_successor(next);
        warn!(peer = %self.local.id, successor = %next, "successor unreachable, promoted next successor");
        true
    }

    /* ---------------- ROUTING ---------------- */

    pub async fn owns(&self, key: FileKey) -> bool {
        self.ring.read().await.owns(self.local.id, key)
    }

    /// Where a request for `key` goes next; `None` when it is ours.
    pub async fn next_hop(&self, key: FileKey) -> Option<RingReference> {
        let ring = self.ring.read().await;
        if ring.owns(self.local.id, key) {
            None
        } else {
            ring.route(self.local.id, key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn reference(id: u64, port: u16) -> RingReference {
        RingReference {
            id: RingId(id),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn ring(local: RingReference) -> RingState {
        RingState::new(local, 8)
    }

    async fn lone_peer(dir: &tempfile::TempDir) -> Arc<Peer> {
        let config = PeerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            storage_root: dir.path().to_path_buf(),
            stabilize_interval: Duration::from_secs(3600),
            ..PeerConfig::default()
        };
        Peer::start(config).await.unwrap()
    }

    #[test]
    fn lone_peer_owns_everything() {
        let local = reference(100, 7000);
        let state = ring(local);
        assert!(state.owns(local.id, RingId(3)));
        assert!(state.route(local.id, RingId(3)).is_none());
    }

    #[test]
    fn ownership_follows_predecessor_interval() {
        let local = reference(100, 7000);
        let mut state = ring(local);
        state.adopt_successor(reference(200, 7001));
        state.predecessor = Some(reference(50, 7002));

        assert!(state.owns(local.id, RingId(100)));
        assert!(state.owns(local.id, RingId(51)));
        assert!(!state.owns(local.id, RingId(50)));
        assert!(!state.owns(local.id, RingId(150)));
    }

    #[test]
    fn route_prefers_progressing_finger() {
        let local = reference(100, 7000);
        let mut state = ring(local);
        state.adopt_successor(reference(120, 7001));
        state.fingers.set(3, reference(180, 7003));

        assert_eq!(state.route(local.id, RingId(190)).unwrap().id, RingId(180));
        // no finger at or below 20: entry 0, the successor
        assert_eq!(state.route(local.id, RingId(20)).unwrap().id, RingId(120));
    }

    #[test]
    fn adopting_the_same_successor_twice_is_a_no_op() {
        let local = reference(100, 7000);
        let mut state = ring(local);
        assert!(state.adopt_successor(reference(120, 7001)));
        let before = (state.successor, state.fingers.ids());
        assert!(!state.adopt_successor(reference(120, 7001)));
        assert_eq!(before, (state.successor, state.fingers.ids()));
    }

    #[tokio::test]
    async fn stabilization_decision_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir).await;

        // successor just behind us, candidate just ahead: candidate sits between
        let l = peer.id().0;
        let far = RingReference { id: RingId((l + 255) % 256), addr: "127.0.0.1:1".parse().unwrap() };
        let near = RingReference { id: RingId((l + 1) % 256), addr: "127.0.0.1:2".parse().unwrap() };
        peer.ring.write().await.adopt_successor(far);

        assert!(peer.consider_successor(far, Some(near)).await);
        let after_first = peer.ring_state().await;
        assert_eq!(after_first.successor, Some(near));
        assert_eq!(after_first.fingers.get(0), near);

        assert!(!peer.consider_successor(near, Some(near)).await);
        assert!(!peer.consider_successor(far, Some(near)).await);
        let after_second = peer.ring_state().await;
        assert_eq!(after_first.successor, after_second.successor);
        assert_eq!(after_first.fingers.ids(), after_second.fingers.ids());
    }

    #[tokio::test]
    async fn self_is_never_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir).await;
        let other = RingReference::new(&peer.space, "127.0.0.1:1".parse().unwrap());
        peer.ring.write().await.adopt_successor(other);

        assert!(!peer.consider_successor(other, Some(peer.local())).await);
        assert!(!peer.consider_successor(other, None).await);
        assert_eq!(peer.successor().await, Some(other));
    }

    #[tokio::test]
    async fn next_successor_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir).await;
        assert!(!peer.promote_next_successor().await);

        let first = RingReference::new(&peer.space, "127.0.0.1:1".parse().unwrap());
        let second = RingReference::new(&peer.space, "127.0.0.1:2".parse().unwrap());
        {
            let mut ring = peer.ring.write().await;
            ring.adopt_successor(first);
            ring.next_successor = Some(second);
        }
        assert!(peer.promote_next_successor().await);
        let state = peer.ring_state().await;
        assert_eq!(state.successor, Some(second));
        assert_eq!(state.fingers.get(0), second);
        assert!(state.next_successor.is_none());
    }

    /// First line of the next connection to `listener`, if one arrives soon.
    async fn next_line(listener: &TcpListener) -> Option<String> {
        let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        let Ok(Ok((stream, _))) = accepted else { return None };
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        Some(line)
    }

    /// A lone peer whose successor, one position ahead, is a bare listener.
    async fn peer_before_listener(dir: &tempfile::TempDir) -> (Arc<Peer>, RingReference, TcpListener) {
        let peer = lone_peer(dir).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let successor = RingReference {
            id: RingId((peer.id().0 + 1) % 256),
            addr: listener.local_addr().unwrap(),
        };
        peer.ring.write().await.adopt_successor(successor);
        (peer, successor, listener)
    }

    #[tokio::test]
    async fn join_with_a_taken_id_goes_nowhere() {
        let dir = tempfile::tempdir().unwrap();
        let (peer, successor, listener) = peer_before_listener(&dir).await;
        let candidate: SocketAddr = "127.0.0.1:1".parse().unwrap();

        peer.handle_find_successor(successor.id, candidate, 0).await;
        assert_eq!(next_line(&listener).await, None);
        peer.handle_find_successor(peer.id(), candidate, 0).await;
        assert_eq!(next_line(&listener).await, None);
        assert_eq!(peer.successor().await, Some(successor));
    }

    #[tokio::test]
    async fn join_forwarding_counts_hops_up_to_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (peer, _successor, listener) = peer_before_listener(&dir).await;
        let candidate: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let key = RingId((peer.id().0 + 2) % 256);

        peer.handle_find_successor(key, candidate, 4).await;
        assert_eq!(next_line(&listener).await, Some(format!("FINDSUCCESSOR {key} 127.0.0.1 1 5\n")));

        peer.handle_find_successor(key, candidate, MAX_JOIN_HOPS).await;
        assert_eq!(next_line(&listener).await, None);
    }

    #[tokio::test]
    async fn lone_peer_stabilize_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let peer = lone_peer(&dir).await;
        assert!(!peer.stabilize().await.unwrap());
        assert!(peer.successor().await.is_none());
        peer.shutdown().await.unwrap();
    }
}
