//! 256-bit overlay addresses and the XOR distance metric.
//!
//! Both peers and chunks live in the same address space: a peer's address is
//! the BLAKE3 hash of its transport public id, a chunk's address is the hash
//! of its encoded payload. Routing decisions use the Kademlia XOR metric:
//! the distance between two addresses is the big-endian integer value of
//! their xor, and [`proximity`] counts the leading zero bits of that
//! distance, classifying the space into bins of exponentially shrinking
//! cardinality.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of an address in bytes.
pub const ADDRESS_LENGTH: usize = 32;

/// Upper bound of the proximity scale: identical addresses.
pub const MAX_PROXIMITY: usize = 8 * ADDRESS_LENGTH;

/// A 256-bit identifier in the shared peer/chunk address space.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

/// Chunk keys are plain addresses.
pub type Key = Address;

impl Address {
    /// Derive an address as the BLAKE3 digest of arbitrary bytes.
    ///
    /// This is the system hash: chunk keys are `Address::hash(chunk data)`,
    /// peer addresses are `Address::hash(node public id)`.
    pub fn hash(data: &[u8]) -> Self {
        Address(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

/// Count the leading zero bits of `one ^ other`, in `[0, 256]`.
///
/// Equivalently: the index of the first differing bit. Larger values mean
/// closer addresses; `MAX_PROXIMITY` means equality.
pub fn proximity(one: &Address, other: &Address) -> usize {
    for (i, (a, b)) in one.0.iter().zip(other.0.iter()).enumerate() {
        let oxo = a ^ b;
        if oxo != 0 {
            return i * 8 + oxo.leading_zeros() as usize;
        }
    }
    MAX_PROXIMITY
}

/// Compare the distances `a -> target` and `b -> target`.
///
/// Returns `Less` if `a` is closer to `target`, `Greater` if `b` is closer,
/// `Equal` only when `a == b`.
pub fn prox_cmp(target: &Address, a: &Address, b: &Address) -> Ordering {
    for i in 0..ADDRESS_LENGTH {
        let da = a.0[i] ^ target.0[i];
        let db = b.0[i] ^ target.0[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
