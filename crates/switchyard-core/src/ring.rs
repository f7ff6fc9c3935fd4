//! Consistent-hash ring.

/// Virtual nodes placed on the ring per member.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Something that can be placed on the ring.
pub trait RingMember: Send + Sync + 'static {
    /// Stable id hashed onto the ring.
    fn ring_id(&self) -> &str;

    /// Whether the member currently accepts routed work.
    fn is_routable(&self) -> bool;
}

/// IEEE CRC32 of a key.
#[must_use]
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Cache key for a membership set: the comma-joined ids, which must
/// already be sorted.
#[must_use]
pub fn signature<I: AsRef<str>>(sorted_ids: &[I]) -> String {
    let mut signature = String::new();
    for (i, id) in sorted_ids.iter().enumerate() {
        if i > 0 {
            signature.push(',');
        }
        signature.push_str(id.as_ref());
    }
    signature
}

/// A sorted ring of `(hash, member index)` entries.
///
/// Member indices refer to the sorted id slice the ring was built from.
#[derive(Debug, Clone)]
pub struct HashRing {
    entries: Vec<(u32, usize)>,
    members: usize,
}

impl HashRing {
    /// Build a ring over `sorted_ids` with `virtual_nodes` entries each,
    /// keyed `"<id>#<i>"`.
    #[must_use]
    pub fn build<I: AsRef<str>>(sorted_ids: &[I], virtual_nodes: usize) -> Self {
        let mut entries = Vec::with_capacity(sorted_ids.len() * virtual_nodes);
        for (index, id) in sorted_ids.iter().enumerate() {
            for node in 0..virtual_nodes {
                entries.push((hash_key(&format!("{}#{}", id.as_ref(), node)), index));
            }
        }
        // Stable sort keeps table order for equal hashes.
        entries.sort_by_key(|&(hash, _)| hash);
        Self {
            entries,
            members: sorted_ids.len(),
        }
    }

    /// Index of the member owning `hash`: the first entry at or after it,
    /// wrapping to the start.
    #[must_use]
    pub fn lookup(&self, hash: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let position = self.entries.partition_point(|&(h, _)| h < hash);
        let (_, index) = self.entries[position % self.entries.len()];
        Some(index)
    }

    /// Index of the member owning `key`.
    #[must_use]
    pub fn locate(&self, key: &str) -> Option<usize> {
        self.lookup(hash_key(key))
    }

    /// Number of ring entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of members the ring was built over.
    #[must_use]
    pub fn members(&self) -> usize {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_matches_ieee() {
        assert_eq!(hash_key("123456789"), 0xCBF4_3926);
        assert_eq!(hash_key(""), 0);
    }

    #[test]
    fn test_signature() {
        assert_eq!(signature(&["a", "b", "c"]), "a,b,c");
        assert_eq!(signature::<&str>(&[]), "");
    }

    #[test]
    fn test_ring_is_sorted_and_sized() {
        let ring = HashRing::build(&["logic-1", "logic-2"], DEFAULT_VIRTUAL_NODES);
        assert_eq!(ring.len(), 300);
        assert_eq!(ring.members(), 2);
        assert!(ring.entries.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_lookup_wraps() {
        let ring = HashRing::build(&["only"], 4);
        let (last_hash, _) = ring.entries[ring.len() - 1];
        if last_hash < u32::MAX {
            assert_eq!(ring.lookup(last_hash + 1), Some(0));
        }
        assert_eq!(ring.lookup(0), Some(0));
        assert_eq!(HashRing::build::<&str>(&[], 4).lookup(7), None);
    }

    #[test]
    fn test_lookup_picks_first_at_or_after() {
        let ring = HashRing::build(&["a", "b", "c"], 10);
        for &(hash, _) in &ring.entries {
            // Equal hashes resolve to the first entry in table order.
            let first = ring.entries.iter().find(|&&(h, _)| h == hash).unwrap().1;
            assert_eq!(ring.lookup(hash), Some(first));
        }
    }

    #[test]
    fn test_deterministic() {
        let a = HashRing::build(&["x", "y", "z"], DEFAULT_VIRTUAL_NODES);
        let b = HashRing::build(&["x", "y", "z"], DEFAULT_VIRTUAL_NODES);
        for key in ["room-1", "room-2", "user-9", ""] {
            assert_eq!(a.locate(key), b.locate(key));
        }
    }
}
