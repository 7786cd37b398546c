//! On-disk layout for a single B-tree node, serialized into a
//! [`storage::StoredPage`] payload.

use common::RecordId;
use serde::{Deserialize, Serialize};

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

/// A B-tree node. Keys are ordered 64-bit row keys (spec §3: C6 keys are
/// totally ordered by their `long` key).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        /// Sorted `(key, row pointer)` pairs.
        entries: Vec<(i64, RecordId)>,
        /// Sibling link for in-order range scans.
        next_leaf: Option<common::PageId>,
    },
    Internal {
        /// `n` separator keys for `n + 1` children.
        keys: Vec<i64>,
        children: Vec<common::PageId>,
    },
}

impl Node {
    pub fn new_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
            next_leaf: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Internal { keys, .. } => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode_config()).expect("node encoding cannot fail")
    }

    pub fn decode(buf: &[u8]) -> common::DbResult<Self> {
        let (node, _): (Node, usize) = bincode::serde::decode_from_slice(buf, bincode_config())
            .map_err(|e| common::DbError::Storage(format!("FILE_CORRUPTED_1: bad btree node: {e}")))?;
        Ok(node)
    }
}
