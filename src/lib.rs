pub mod admin;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod finger_table;
pub mod id;
pub mod ledger;
pub mod peer;
pub mod protocol;
pub mod reference;
pub mod server;
pub mod snapshot;
pub mod stabilizer;
pub mod storage;
pub mod transport;

pub use config::PeerConfig;
pub use error::{PeerError, ProtocolError, RpcError};
pub use id::{FileKey, PeerId, RingId, RingSpace};
pub use peer::{Peer, PeerState};
pub use protocol::{Command, parse_line};
pub use reference::RingReference;
