use std::fmt;

use serde::{Deserialize, Serialize};

/// 32-byte peer identifier. Also used verbatim as the store key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(NodeId)
    }

    /// Identifier with the index written big-endian into the last eight bytes.
    /// Handy for simulations and tests that need many distinct ids.
    pub fn from_index(index: u64) -> Self {
        let mut id = [0u8; 32];
        id[24..].copy_from_slice(&index.to_be_bytes());
        NodeId(id)
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_ids_sort_by_index() {
        assert!(NodeId::from_index(1) < NodeId::from_index(2));
        assert!(NodeId::from_index(255) < NodeId::from_index(256));
    }

    #[test]
    fn display_is_full_hex() {
        let id = NodeId::from_index(0xab);
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.ends_with("ab"));
        assert_eq!(NodeId::from_slice(&hex::decode(text).unwrap()), Some(id));
    }

    #[test]
    fn wrong_length_slice_is_rejected() {
        assert_eq!(NodeId::from_slice(&[0u8; 31]), None);
    }
}
