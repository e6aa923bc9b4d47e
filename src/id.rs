//! Identifier space of the ring.
//!
//! Peers and files hash into the same `m`-bit space. A peer is placed by the
//! SHA-1 of `"<ip>:<port>"`, a file by the SHA-1 of its name; the first eight
//! bytes of the digest are read big endian and reduced mod 2^m.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Ring size used when nothing else is configured.
pub const DEFAULT_RING_BITS: u32 = 8;

/// Position on the ring. Both peers and file keys live here.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RingId(pub u64);

pub type PeerId = RingId;
pub type FileKey = RingId;

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An `m`-bit identifier space, `1 <= m <= 64`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingSpace {
    bits: u32,
}

impl Default for RingSpace {
    fn default() -> Self {
        Self { bits: DEFAULT_RING_BITS }
    }
}

impl RingSpace {
    /// Returns `None` when `bits` is outside `1..=64`.
    pub fn new(bits: u32) -> Option<Self> {
        (1..=64).contains(&bits).then_some(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// True if `id` is a position of this space, i.e. below 2^m.
    pub fn contains(&self, id: RingId) -> bool {
        self.bits == 64 || id.0 < (1u64 << self.bits)
    }

    /// Number of finger table entries, i.e. `m`.
    pub fn finger_count(&self) -> usize {
        self.bits as usize
    }

    fn reduce(&self, raw: u64) -> RingId {
        if self.bits == 64 {
            RingId(raw)
        } else {
            RingId(raw & ((1u64 << self.bits) - 1))
        }
    }

    fn hash(&self, bytes: &[u8]) -> RingId {
        let digest = Sha1::digest(bytes);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        self.reduce(u64::from_be_bytes(head))
    }

    /// Stable position of the endpoint `ip:port`.
    pub fn peer_id(&self, ip: IpAddr, port: u16) -> PeerId {
        self.hash(format!("{ip}:{port}").as_bytes())
    }

    /// Stable position of a file name.
    pub fn file_key(&self, name: &str) -> FileKey {
        self.hash(name.as_bytes())
    }

    /// `(id + 2^i) mod 2^m`.
    pub fn finger_start(&self, id: PeerId, i: usize) -> PeerId {
        assert!(i < self.finger_count(), "finger index {i} out of range");
        let modulus = 1u128 << self.bits;
        let start = (id.0 as u128 + (1u128 << i)) % modulus;
        RingId(start as u64)
    }
}

/// True if `x` lies strictly inside the clockwise interval `(lo, hi)`.
///
/// `lo == hi` covers the whole ring except `lo` itself.
pub fn is_between(x: RingId, lo: RingId, hi: RingId) -> bool {
    if lo < hi {
        lo < x && x < hi
    } else if lo > hi {
        x > lo || x < hi
    } else {
        x != lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn peer_id_is_deterministic_and_in_range() {
        let space = RingSpace::new(8).unwrap();
        for port in [7000u16, 7001, 7002, 9000, 65535] {
            let a = space.peer_id(LOCALHOST, port);
            let b = space.peer_id(LOCALHOST, port);
            assert_eq!(a, b);
            assert!(a.0 < 256);
        }
    }

    #[test]
    fn contains_stops_at_two_to_the_m() {
        let space = RingSpace::new(8).unwrap();
        assert!(space.contains(RingId(0)));
        assert!(space.contains(RingId(255)));
        assert!(!space.contains(RingId(256)));
        assert!(RingSpace::new(64).unwrap().contains(RingId(u64::MAX)));
    }

    #[test]
    fn full_width_space_keeps_all_bits() {
        let space = RingSpace::new(64).unwrap();
        let narrow = RingSpace::new(16).unwrap();
        let wide = space.file_key("report.pdf");
        assert_eq!(wide.0 & 0xffff, narrow.file_key("report.pdf").0);
    }

    #[test]
    fn invalid_bit_counts_are_rejected() {
        assert!(RingSpace::new(0).is_none());
        assert!(RingSpace::new(65).is_none());
        assert!(RingSpace::new(1).is_some());
    }

    #[test]
    fn finger_start_wraps_around() {
        let space = RingSpace::new(8).unwrap();
        assert_eq!(space.finger_start(RingId(0), 0), RingId(1));
        assert_eq!(space.finger_start(RingId(250), 3), RingId(2));
        assert_eq!(space.finger_start(RingId(255), 7), RingId(127));

        let full = RingSpace::new(64).unwrap();
        assert_eq!(full.finger_start(RingId(u64::MAX), 0), RingId(0));
    }

    #[test]
    #[should_panic]
    fn finger_start_rejects_out_of_range_index() {
        RingSpace::new(8).unwrap().finger_start(RingId(0), 8);
    }

    #[test]
    fn between_plain_interval() {
        assert!(is_between(RingId(5), RingId(1), RingId(10)));
        assert!(!is_between(RingId(1), RingId(1), RingId(10)));
        assert!(!is_between(RingId(10), RingId(1), RingId(10)));
        assert!(!is_between(RingId(11), RingId(1), RingId(10)));
    }

    #[test]
    fn between_wrapping_interval() {
        assert!(is_between(RingId(250), RingId(200), RingId(10)));
        assert!(is_between(RingId(3), RingId(200), RingId(10)));
        assert!(!is_between(RingId(100), RingId(200), RingId(10)));
    }

    #[test]
    fn between_degenerate_interval_is_whole_ring() {
        assert!(is_between(RingId(3), RingId(7), RingId(7)));
        assert!(!is_between(RingId(7), RingId(7), RingId(7)));
    }
}
