//! Hierarchical node identifiers.
//!
//! Every tree node is addressed by a [`MortonId`]: the root-to-node path in a
//! binary tree, packed together with its depth into a single `u64`. The
//! packing makes ancestor/descendant queries a shift-and-compare, with no
//! tree walk and no communication, which is what the interaction-list and
//! sampling phases lean on when they reason about nodes other ranks own.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};

/// Number of low bits reserved for the level field.
const LEVEL_BITS: u32 = 6;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;

/// Deepest representable level. Path bits occupy the remaining 58 bits.
pub const MAX_LEVEL: u32 = 58;

/// Identifier of one node of the binary hierarchy: `(level, path)` with the
/// path in the high bits and the level in the low [`LEVEL_BITS`] bits.
///
/// The path reads root-to-node, one bit per level, `0` = left child,
/// `1` = right child. The root is `(0, 0)`.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize,
)]
pub struct MortonId(u64);

impl MortonId {
    pub fn root() -> Self {
        Self(0)
    }

    pub fn new(level: u32, path: u64) -> Self {
        debug_assert!(level <= MAX_LEVEL);
        debug_assert!(level == 64 || path >> level == 0);
        Self((path << LEVEL_BITS) | level as u64)
    }

    pub fn level(&self) -> u32 {
        (self.0 & LEVEL_MASK) as u32
    }

    pub fn path(&self) -> u64 {
        self.0 >> LEVEL_BITS
    }

    pub fn left_child(&self) -> Self {
        Self::new(self.level() + 1, self.path() << 1)
    }

    pub fn right_child(&self) -> Self {
        Self::new(self.level() + 1, (self.path() << 1) | 1)
    }

    pub fn child(&self, right: bool) -> Self {
        if right {
            self.right_child()
        } else {
            self.left_child()
        }
    }

    /// The other child of this node's parent. The root is its own sibling.
    pub fn sibling(&self) -> Self {
        if self.level() == 0 {
            *self
        } else {
            Self::new(self.level(), self.path() ^ 1)
        }
    }

    pub fn parent(&self) -> Option<Self> {
        (self.level() > 0).then(|| Self::new(self.level() - 1, self.path() >> 1))
    }

    /// `true` if `self` is `other` or an ancestor of `other`.
    pub fn contains(&self, other: MortonId) -> bool {
        other.level() >= self.level()
            && other.path() >> (other.level() - self.level()) == self.path()
    }

    /// `true` if any id in `ids` lies in the subtree rooted at `self`.
    pub fn contains_any<'a>(&self, ids: impl IntoIterator<Item = &'a MortonId>) -> bool {
        ids.into_iter().any(|id| self.contains(*id))
    }

    /// Position of this node's subtree along the space-filling order,
    /// left-aligned to the deepest representable level. Disjoint subtrees
    /// compare the way their leaf ranges do, regardless of level, which is
    /// the ordering the symmetric interaction tie-break relies on.
    pub fn position(&self) -> u64 {
        self.path() << (MAX_LEVEL - self.level())
    }

    /// The rank that owns this node in a group of `2^levels` ranks.
    ///
    /// Nodes at or below the distributed depth map to the unique rank whose
    /// leading path bits they share; coarser nodes map to the first rank of
    /// their rank range. Every rank computes the same answer without
    /// communication, which makes this the owner function used to route
    /// symmetrization traffic.
    pub fn owner_rank(&self, levels: u32) -> usize {
        let level = self.level();
        if level >= levels {
            (self.path() >> (level - levels)) as usize
        } else {
            (self.path() << (levels - level)) as usize
        }
    }
}

impl Debug for MortonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.level() == 0 {
            return write!(f, "*");
        }
        // Path bits, most significant (root decision) first.
        for i in (0..self.level()).rev() {
            write!(f, "{}", (self.path() >> i) & 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn root_children() {
        let root = MortonId::root();
        assert_eq!(root.left_child(), MortonId::new(1, 0));
        assert_eq!(root.right_child(), MortonId::new(1, 1));
        assert_eq!(root.left_child().sibling(), root.right_child());
        assert_eq!(root.left_child().parent(), Some(root));
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn containment_is_subtree_membership() {
        let a = MortonId::new(2, 0b10);
        assert!(a.contains(a));
        assert!(a.contains(MortonId::new(4, 0b1001)));
        assert!(!a.contains(MortonId::new(4, 0b1101)));
        // A descendant never contains its ancestor.
        assert!(!MortonId::new(4, 0b1001).contains(a));
        // Unrelated same-level nodes reject each other.
        assert!(!a.contains(MortonId::new(2, 0b11)));
        assert!(!MortonId::new(2, 0b11).contains(a));
    }

    #[test]
    fn owner_rank_of_coarse_and_deep_nodes() {
        // 4 ranks = 2 distributed levels.
        assert_eq!(MortonId::root().owner_rank(2), 0);
        assert_eq!(MortonId::new(1, 1).owner_rank(2), 2);
        assert_eq!(MortonId::new(2, 0b11).owner_rank(2), 3);
        assert_eq!(MortonId::new(4, 0b1011).owner_rank(2), 2);
    }

    proptest! {
        #[test]
        fn ancestors_contain_descendants(path in 0u64..(1 << 16), cut in 0u32..16) {
            let node = MortonId::new(16, path);
            let ancestor = MortonId::new(cut, path >> (16 - cut));
            prop_assert!(ancestor.contains(node));
            if ancestor.level() < node.level() {
                prop_assert!(!node.contains(ancestor));
            }
        }

        #[test]
        fn siblings_never_contain_each_other(path in 0u64..(1 << 16)) {
            let node = MortonId::new(16, path);
            prop_assert!(!node.contains(node.sibling()));
            prop_assert!(!node.sibling().contains(node));
        }

        #[test]
        fn owner_rank_in_range(path in 0u64..(1 << 10), levels in 0u32..5) {
            let node = MortonId::new(10, path);
            prop_assert!(node.owner_rank(levels) < (1 << levels));
        }
    }
}
