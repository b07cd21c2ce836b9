//! Merkle-sum sparse merkle tree.
//!
//! A full-height (256) binary tree where every node carries a u64 sum next
//! to its hash. Subtrees holding a single leaf are stored as compacted
//! leaves tagged with their key path, so absent siblings never have to be
//! materialized; they are reconstructed from a precomputed empty-subtree
//! table instead.

use alloc::sync::Arc;
use alloc::{vec, vec::Vec};
use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash, HashEngine};
use bitcoin::io::Read;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

/// Number of levels in an MS-SMT.
pub const MAX_TREE_LEVELS: usize = 256;

/// Tag prefixing every leaf hash.
const LEAF_TAG: &[u8] = b"leaf";
/// Tag prefixing every branch hash.
const BRANCH_TAG: &[u8] = b"branch";

/// Errors returned by tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Two sums added past u64::MAX.
    #[error("node sum overflow")]
    SumOverflow,
    /// A proof did not carry one sibling per tree level.
    #[error("invalid proof length {actual}, expected {expected}")]
    InvalidProofLength {
        /// Expected number of siblings.
        expected: usize,
        /// Actual number of siblings.
        actual: usize,
    },
    /// Compressed proof bits disagree with the explicit node count.
    #[error("compressed proof bit/node count mismatch")]
    BitNodeMismatch,
}

/// Hash and sum summary of a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// The hash of the node.
    pub hash: Sha256Hash,
    /// The sum of the node.
    pub sum: u64,
}

impl Node {
    /// Returns the all-zero placeholder used on the wire for elided nodes.
    pub fn zero() -> Self {
        Node {
            hash: Sha256Hash::all_zeros(),
            sum: 0,
        }
    }

    fn is_zero(&self) -> bool {
        self.hash == Sha256Hash::all_zeros() && self.sum == 0
    }
}

/// A leaf value and its sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    /// Opaque leaf payload.
    pub value: Vec<u8>,
    /// Sum carried by the leaf.
    pub sum: u64,
}

impl LeafNode {
    pub fn new(value: Vec<u8>, sum: u64) -> Self {
        LeafNode { value, sum }
    }

    /// The canonical empty leaf.
    pub fn empty() -> Self {
        LeafNode {
            value: Vec::new(),
            sum: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.sum == 0
    }

    /// Hash/sum summary: H("leaf" || H(value) || sum_be).
    pub fn node(&self) -> Node {
        let value_hash = Sha256Hash::hash(&self.value);
        let mut engine = Sha256Hash::engine();
        engine.input(LEAF_TAG);
        engine.input(&value_hash.to_byte_array());
        engine.input(&self.sum.to_be_bytes());
        Node {
            hash: Sha256Hash::from_engine(engine),
            sum: self.sum,
        }
    }
}

/// Combines two child summaries into their parent:
/// H("branch" || left_hash || left_sum_be || right_hash || right_sum_be).
pub fn branch_node(left: &Node, right: &Node) -> Result<Node, TreeError> {
    let sum = left
        .sum
        .checked_add(right.sum)
        .ok_or(TreeError::SumOverflow)?;
    let mut engine = Sha256Hash::engine();
    engine.input(BRANCH_TAG);
    engine.input(&left.hash.to_byte_array());
    engine.input(&left.sum.to_be_bytes());
    engine.input(&right.hash.to_byte_array());
    engine.input(&right.sum.to_be_bytes());
    Ok(Node {
        hash: Sha256Hash::from_engine(engine),
        sum,
    })
}

/// Returns the bit of `key` consulted at branching depth `depth`.
///
/// Depth 0 is the root split, depth 255 the final split above the leaves.
pub fn bit_index(depth: usize, key: &[u8; 32]) -> u8 {
    (key[depth / 8] >> (depth % 8)) & 1
}

/// Precomputed summaries of the all-empty subtree, indexed by depth.
///
/// `nodes[MAX_TREE_LEVELS]` is the empty leaf; `nodes[0]` the root of a
/// fully empty tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyTree {
    nodes: Vec<Node>,
}

impl EmptyTree {
    pub fn new() -> Self {
        let leaf = LeafNode::empty().node();
        let mut nodes = vec![leaf.clone(); MAX_TREE_LEVELS + 1];
        for depth in (0..MAX_TREE_LEVELS).rev() {
            let child = nodes[depth + 1].clone();
            nodes[depth] = branch_node(&child, &child).unwrap_or_else(|_| leaf.clone());
        }
        EmptyTree { nodes }
    }

    /// Summary of the empty subtree rooted at `depth`.
    pub fn at(&self, depth: usize) -> &Node {
        &self.nodes[depth]
    }

    /// Root of a fully empty tree.
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }
}

impl Default for EmptyTree {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory tree node. A single-leaf subtree is a compacted leaf carrying
/// its key path; depth 256 compacted leaves are plain leaves.
#[derive(Debug, Clone)]
enum TreeNode {
    Branch {
        left: Arc<TreeNode>,
        right: Arc<TreeNode>,
        node: Node,
    },
    Compact {
        key: [u8; 32],
        leaf: LeafNode,
        depth: usize,
        node: Node,
    },
    Empty(usize),
}

impl TreeNode {
    fn summary(&self, empty: &EmptyTree) -> Node {
        match self {
            TreeNode::Branch { node, .. } => node.clone(),
            TreeNode::Compact { node, .. } => node.clone(),
            TreeNode::Empty(depth) => empty.at(*depth).clone(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, TreeNode::Empty(_))
    }
}

/// Summary of a single-leaf subtree rooted at `depth`: the leaf hashed up
/// through empty siblings along the key path.
fn compact_node(key: &[u8; 32], leaf: &LeafNode, depth: usize, empty: &EmptyTree) -> Node {
    let mut current = leaf.node();
    for level in (depth..MAX_TREE_LEVELS).rev() {
        let sibling = empty.at(level + 1);
        current = if bit_index(level, key) == 0 {
            branch_node(&current, sibling)
        } else {
            branch_node(sibling, &current)
        }
        .unwrap_or_else(|_| Node::zero());
    }
    current
}

fn make_compact(key: [u8; 32], leaf: LeafNode, depth: usize, empty: &EmptyTree) -> TreeNode {
    let node = compact_node(&key, &leaf, depth, empty);
    TreeNode::Compact {
        key,
        leaf,
        depth,
        node,
    }
}

/// A compacted merkle-sum sparse merkle tree.
#[derive(Debug, Clone)]
pub struct CompactedTree {
    root: Arc<TreeNode>,
    empty: Arc<EmptyTree>,
}

impl CompactedTree {
    pub fn new() -> Self {
        CompactedTree {
            root: Arc::new(TreeNode::Empty(0)),
            empty: Arc::new(EmptyTree::new()),
        }
    }

    /// Root summary of the tree.
    pub fn root(&self) -> Node {
        self.root.summary(&self.empty)
    }

    /// Inserts or replaces the leaf stored under `key`. Inserting the same
    /// (key, leaf) pair again leaves the root unchanged.
    pub fn insert(&mut self, key: [u8; 32], leaf: LeafNode) -> Result<(), TreeError> {
        let root = Self::insert_at(&self.root, key, leaf, 0, &self.empty)?;
        self.root = Arc::new(root);
        Ok(())
    }

    fn insert_at(
        node: &TreeNode,
        key: [u8; 32],
        leaf: LeafNode,
        depth: usize,
        empty: &EmptyTree,
    ) -> Result<TreeNode, TreeError> {
        match node {
            TreeNode::Empty(_) => Ok(make_compact(key, leaf, depth, empty)),
            TreeNode::Compact {
                key: existing_key, ..
            } if *existing_key == key => Ok(make_compact(key, leaf, depth, empty)),
            TreeNode::Compact {
                key: existing_key,
                leaf: existing_leaf,
                ..
            } => {
                // Keys diverge somewhere at or below this depth; grow a
                // branch here and push both leaves down one level.
                let new_bit = bit_index(depth, &key);
                let old_bit = bit_index(depth, existing_key);
                let (left, right) = if new_bit != old_bit {
                    let new_child = make_compact(key, leaf, depth + 1, empty);
                    let old_child =
                        make_compact(*existing_key, existing_leaf.clone(), depth + 1, empty);
                    if new_bit == 0 {
                        (new_child, old_child)
                    } else {
                        (old_child, new_child)
                    }
                } else {
                    let pushed =
                        make_compact(*existing_key, existing_leaf.clone(), depth + 1, empty);
                    let sub = Self::insert_at(&pushed, key, leaf, depth + 1, empty)?;
                    if new_bit == 0 {
                        (sub, TreeNode::Empty(depth + 1))
                    } else {
                        (TreeNode::Empty(depth + 1), sub)
                    }
                };
                Self::branch_of(left, right, empty)
            }
            TreeNode::Branch {
                left,
                right,
                ..
            } => {
                let (new_left, new_right) = if bit_index(depth, &key) == 0 {
                    let sub = Self::insert_at(left, key, leaf, depth + 1, empty)?;
                    (sub, right.as_ref().clone())
                } else {
                    let sub = Self::insert_at(right, key, leaf, depth + 1, empty)?;
                    (left.as_ref().clone(), sub)
                };
                Self::branch_of(new_left, new_right, empty)
            }
        }
    }

    fn branch_of(left: TreeNode, right: TreeNode, empty: &EmptyTree) -> Result<TreeNode, TreeError> {
        let node = branch_node(&left.summary(empty), &right.summary(empty))?;
        Ok(TreeNode::Branch {
            left: Arc::new(left),
            right: Arc::new(right),
            node,
        })
    }

    /// Deletes the leaf stored under `key`, if any.
    pub fn delete(&mut self, key: &[u8; 32]) -> Result<(), TreeError> {
        let root = Self::delete_at(&self.root, key, 0, &self.empty)?;
        self.root = Arc::new(root);
        Ok(())
    }

    fn delete_at(
        node: &TreeNode,
        key: &[u8; 32],
        depth: usize,
        empty: &EmptyTree,
    ) -> Result<TreeNode, TreeError> {
        match node {
            TreeNode::Empty(_) => Ok(TreeNode::Empty(depth)),
            TreeNode::Compact {
                key: existing_key, ..
            } if existing_key == key => Ok(TreeNode::Empty(depth)),
            TreeNode::Compact {
                key: existing_key,
                leaf,
                ..
            } => Ok(make_compact(*existing_key, leaf.clone(), depth, empty)),
            TreeNode::Branch {
                left,
                right,
                ..
            } => {
                let (new_left, new_right) = if bit_index(depth, key) == 0 {
                    let sub = Self::delete_at(left, key, depth + 1, empty)?;
                    (sub, right.as_ref().clone())
                } else {
                    let sub = Self::delete_at(right, key, depth + 1, empty)?;
                    (left.as_ref().clone(), sub)
                };

                // Re-compact: a branch whose surviving occupant is a single
                // leaf collapses back into a compacted leaf at this depth.
                match (&new_left, &new_right) {
                    (TreeNode::Empty(_), TreeNode::Empty(_)) => Ok(TreeNode::Empty(depth)),
                    (TreeNode::Compact { key, leaf, .. }, TreeNode::Empty(_))
                    | (TreeNode::Empty(_), TreeNode::Compact { key, leaf, .. }) => {
                        Ok(make_compact(*key, leaf.clone(), depth, empty))
                    }
                    _ => Self::branch_of(new_left, new_right, empty),
                }
            }
        }
    }

    /// Returns the leaf stored under `key`, if any.
    pub fn get(&self, key: &[u8; 32]) -> Option<LeafNode> {
        let mut node = self.root.as_ref();
        let mut depth = 0;
        loop {
            match node {
                TreeNode::Empty(_) => return None,
                TreeNode::Compact {
                    key: existing_key,
                    leaf,
                    ..
                } => {
                    return if existing_key == key {
                        Some(leaf.clone())
                    } else {
                        None
                    };
                }
                TreeNode::Branch { left, right, .. } => {
                    node = if bit_index(depth, key) == 0 {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                    depth += 1;
                }
            }
        }
    }

    /// Produces the merkle proof for `key`: one sibling summary per level.
    /// For absent keys the proof verifies against the empty leaf.
    pub fn merkle_proof(&self, key: &[u8; 32]) -> Proof {
        // Default every sibling to the empty subtree at its level. The
        // sibling consulted at branching depth d sits at depth d + 1 and is
        // stored at position MAX_TREE_LEVELS - 1 - d.
        let mut nodes: Vec<Node> = (0..MAX_TREE_LEVELS)
            .map(|position| self.empty.at(MAX_TREE_LEVELS - position).clone())
            .collect();

        let mut node = self.root.as_ref();
        let mut depth = 0;
        loop {
            match node {
                TreeNode::Empty(_) => break,
                TreeNode::Compact {
                    key: existing_key,
                    leaf,
                    ..
                } => {
                    if existing_key != key {
                        // The stored leaf shares our path until the first
                        // diverging bit; there it becomes our sole
                        // non-empty sibling.
                        if let Some(diverge) =
                            (depth..MAX_TREE_LEVELS).find(|level| {
                                bit_index(*level, key) != bit_index(*level, existing_key)
                            })
                        {
                            nodes[MAX_TREE_LEVELS - 1 - diverge] =
                                compact_node(existing_key, leaf, diverge + 1, &self.empty);
                        }
                    }
                    break;
                }
                TreeNode::Branch { left, right, .. } => {
                    let (next, sibling) = if bit_index(depth, key) == 0 {
                        (left.as_ref(), right.as_ref())
                    } else {
                        (right.as_ref(), left.as_ref())
                    };
                    nodes[MAX_TREE_LEVELS - 1 - depth] = sibling.summary(&self.empty);
                    node = next;
                    depth += 1;
                }
            }
        }

        Proof { nodes }
    }
}

impl Default for CompactedTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a merkle proof for a MS-SMT.
///
/// `nodes[0]` is the sibling at the leaf level, `nodes[255]` the sibling of
/// the root's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Siblings that should be hashed with the leaf and its parents to
    /// arrive at the root.
    pub nodes: Vec<Node>,
}

impl Proof {
    /// Recomputes the root summary implied by `leaf` stored under `key`.
    /// Sum consistency is enforced at every level via checked addition.
    pub fn root(&self, key: &[u8; 32], leaf: &LeafNode) -> Result<Node, TreeError> {
        if self.nodes.len() != MAX_TREE_LEVELS {
            return Err(TreeError::InvalidProofLength {
                expected: MAX_TREE_LEVELS,
                actual: self.nodes.len(),
            });
        }

        let empty = EmptyTree::new();
        let mut current = leaf.node();
        for depth in (0..MAX_TREE_LEVELS).rev() {
            let raw = &self.nodes[MAX_TREE_LEVELS - 1 - depth];
            // Zero placeholders stand in for elided empty subtrees.
            let sibling = if raw.is_zero() {
                empty.at(depth + 1).clone()
            } else {
                raw.clone()
            };
            current = if bit_index(depth, key) == 0 {
                branch_node(&current, &sibling)?
            } else {
                branch_node(&sibling, &current)?
            };
        }
        Ok(current)
    }

    /// Verifies that `leaf` is committed under `key` in the tree rooted at
    /// `root`.
    pub fn verify_inclusion(&self, key: &[u8; 32], leaf: &LeafNode, root: &Node) -> bool {
        match self.root(key, leaf) {
            Ok(derived) => derived == *root,
            Err(_) => false,
        }
    }

    /// Verifies that no leaf is committed under `key` in the tree rooted at
    /// `root`.
    pub fn verify_non_inclusion(&self, key: &[u8; 32], root: &Node) -> bool {
        self.verify_inclusion(key, &LeafNode::empty(), root)
    }

    /// Encodes the proof in the compressed format: a u16 count of explicit
    /// nodes, the explicit nodes themselves, then 32 bytes of packed bits
    /// marking which levels were elided as empty.
    pub fn compress(&self) -> Result<Vec<u8>, Error> {
        if self.nodes.len() != MAX_TREE_LEVELS {
            return Err(Error::Tree(TreeError::InvalidProofLength {
                expected: MAX_TREE_LEVELS,
                actual: self.nodes.len(),
            }));
        }

        let empty = EmptyTree::new();
        let mut bits = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut explicit = Vec::new();
        for (position, node) in self.nodes.iter().enumerate() {
            let depth = MAX_TREE_LEVELS - position;
            let is_empty = node == empty.at(depth) || node.is_zero();
            bits.push(is_empty);
            if !is_empty {
                explicit.push(node);
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(explicit.len() as u16).to_be_bytes());
        for node in explicit {
            out.extend_from_slice(&node.hash.to_byte_array());
            out.extend_from_slice(&node.sum.to_be_bytes());
        }
        out.extend_from_slice(&pack_bits(&bits));
        Ok(out)
    }

    /// Decodes the compressed MS-SMT proof format:
    /// - 2 bytes: number of explicit nodes (uint16, big endian)
    /// - For each node: 32 bytes hash + 8 bytes sum (uint64, big endian)
    /// - 32 bytes of packed bits marking empty levels
    pub fn decode_compressed<R: Read>(mut r: R) -> Result<Self, Error> {
        let mut num_nodes_bytes = [0u8; 2];
        r.read_exact(&mut num_nodes_bytes).map_err(Error::Io)?;
        let num_nodes = u16::from_be_bytes(num_nodes_bytes) as usize;

        let mut explicit_nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let mut hash_bytes = [0u8; 32];
            r.read_exact(&mut hash_bytes).map_err(Error::Io)?;
            let mut sum_bytes = [0u8; 8];
            r.read_exact(&mut sum_bytes).map_err(Error::Io)?;
            explicit_nodes.push(Node {
                hash: Sha256Hash::from_byte_array(hash_bytes),
                sum: u64::from_be_bytes(sum_bytes),
            });
        }

        let mut packed_bits = [0u8; MAX_TREE_LEVELS / 8];
        r.read_exact(&mut packed_bits).map_err(Error::Io)?;

        let empty = EmptyTree::new();
        let mut nodes = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut explicit_idx = 0;
        for position in 0..MAX_TREE_LEVELS {
            let byte_val = packed_bits[position / 8];
            let bit_set = (byte_val >> (position % 8)) & 1 == 1;
            if bit_set {
                nodes.push(empty.at(MAX_TREE_LEVELS - position).clone());
            } else {
                if explicit_idx >= explicit_nodes.len() {
                    return Err(Error::Tree(TreeError::BitNodeMismatch));
                }
                nodes.push(explicit_nodes[explicit_idx].clone());
                explicit_idx += 1;
            }
        }

        if explicit_idx != explicit_nodes.len() {
            return Err(Error::Tree(TreeError::BitNodeMismatch));
        }

        Ok(Proof { nodes })
    }
}

/// Packs a bit slice into bytes using little-endian bit ordering.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (idx, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[idx / 8] |= 1 << (idx % 8);
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(tag: u8) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[0] = tag;
        key[31] = tag.wrapping_mul(7);
        key
    }

    fn test_leaf(tag: u8, sum: u64) -> LeafNode {
        LeafNode::new(vec![tag; 12], sum)
    }

    #[test]
    fn empty_tree_root_matches_empty_table() {
        let tree = CompactedTree::new();
        let empty = EmptyTree::new();
        assert_eq!(tree.root(), *empty.root());
        assert_eq!(tree.root().sum, 0);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let entries: Vec<_> = (1u8..=9).map(|i| (test_key(i), test_leaf(i, i as u64 * 10))).collect();

        let mut forward = CompactedTree::new();
        for (key, leaf) in &entries {
            forward.insert(*key, leaf.clone()).unwrap();
        }

        let mut backward = CompactedTree::new();
        for (key, leaf) in entries.iter().rev() {
            backward.insert(*key, leaf.clone()).unwrap();
        }

        assert_eq!(forward.root(), backward.root());
        assert_eq!(forward.root().sum, (1..=9u64).map(|i| i * 10).sum::<u64>());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut tree = CompactedTree::new();
        tree.insert(test_key(1), test_leaf(1, 100)).unwrap();
        let first = tree.root();
        tree.insert(test_key(1), test_leaf(1, 100)).unwrap();
        assert_eq!(tree.root(), first);
    }

    #[test]
    fn get_returns_inserted_leaves() {
        let mut tree = CompactedTree::new();
        tree.insert(test_key(1), test_leaf(1, 5)).unwrap();
        tree.insert(test_key(2), test_leaf(2, 7)).unwrap();

        assert_eq!(tree.get(&test_key(1)), Some(test_leaf(1, 5)));
        assert_eq!(tree.get(&test_key(2)), Some(test_leaf(2, 7)));
        assert_eq!(tree.get(&test_key(3)), None);
    }

    #[test]
    fn delete_restores_prior_root() {
        let mut tree = CompactedTree::new();
        tree.insert(test_key(1), test_leaf(1, 5)).unwrap();
        let one_leaf = tree.root();

        tree.insert(test_key(2), test_leaf(2, 7)).unwrap();
        tree.delete(&test_key(2)).unwrap();
        assert_eq!(tree.root(), one_leaf);

        tree.delete(&test_key(1)).unwrap();
        assert_eq!(tree.root(), *EmptyTree::new().root());
    }

    #[test]
    fn inclusion_proofs_verify() {
        let mut tree = CompactedTree::new();
        for i in 1u8..=6 {
            tree.insert(test_key(i), test_leaf(i, i as u64)).unwrap();
        }

        let root = tree.root();
        for i in 1u8..=6 {
            let proof = tree.merkle_proof(&test_key(i));
            assert!(proof.verify_inclusion(&test_key(i), &test_leaf(i, i as u64), &root));
            // A different leaf under the same key must not verify.
            assert!(!proof.verify_inclusion(&test_key(i), &test_leaf(i, i as u64 + 1), &root));
        }
    }

    #[test]
    fn non_inclusion_proofs_verify_for_absent_keys() {
        let mut tree = CompactedTree::new();
        tree.insert(test_key(1), test_leaf(1, 5)).unwrap();
        tree.insert(test_key(2), test_leaf(2, 7)).unwrap();

        let root = tree.root();
        let absent = test_key(9);
        let proof = tree.merkle_proof(&absent);
        assert!(proof.verify_non_inclusion(&absent, &root));

        let present = test_key(1);
        let proof = tree.merkle_proof(&present);
        assert!(!proof.verify_non_inclusion(&present, &root));
    }

    #[test]
    fn compressed_proof_round_trip() {
        let mut tree = CompactedTree::new();
        for i in 1u8..=4 {
            tree.insert(test_key(i), test_leaf(i, i as u64)).unwrap();
        }

        let proof = tree.merkle_proof(&test_key(3));
        let compressed = proof.compress().unwrap();
        let decoded =
            Proof::decode_compressed(bitcoin::io::Cursor::new(compressed.as_slice())).unwrap();
        assert_eq!(
            decoded.root(&test_key(3), &test_leaf(3, 3)).unwrap(),
            tree.root()
        );
    }

    #[test]
    fn sum_overflow_is_rejected() {
        let mut tree = CompactedTree::new();
        tree.insert(test_key(1), test_leaf(1, u64::MAX)).unwrap();
        assert_eq!(
            tree.insert(test_key(2), test_leaf(2, 1)),
            Err(TreeError::SumOverflow)
        );
    }
}
