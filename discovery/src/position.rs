// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Candidate-superior walk over the implicit k-ary tree spanned by the
//! subnet's host positions. Pure arithmetic on the 1-based position; the
//! iterator is lazy so probing stops as soon as a candidate accepts.
//!
//! Positions number the tree layer by layer: layer 0 is position 1 (the
//! root), layer 1 holds the next `fanout` positions, and so on.

/// Position expressed as (layer, offset within layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreePosition {
    pub layer: u32,
    pub offset: u64,
    pub fanout: u64,
}

impl TreePosition {
    pub fn from_linear(position: u64, fanout: u64) -> Self {
        let fanout = fanout.max(1);
        debug_assert!(position >= 1);
        let mut remaining = position;
        let mut layer = 0u32;
        let mut size = 1u64;
        while remaining > size {
            remaining -= size;
            layer += 1;
            size = size.saturating_mul(fanout);
        }
        Self { layer, offset: remaining - 1, fanout }
    }

    pub fn to_linear(&self) -> u64 {
        let mut position = 0u64;
        let mut size = 1u64;
        for _ in 0..self.layer {
            position = position.saturating_add(size);
            size = size.saturating_mul(self.fanout);
        }
        position + self.offset + 1
    }

    /// Number of positions in this layer.
    pub fn layer_size(&self) -> u64 {
        let mut size = 1u64;
        for _ in 0..self.layer {
            size = size.saturating_mul(self.fanout);
        }
        size
    }

    pub fn parent(&self) -> Option<TreePosition> {
        if self.layer == 0 {
            return None;
        }
        Some(TreePosition {
            layer: self.layer - 1,
            offset: self.offset / self.fanout,
            fanout: self.fanout,
        })
    }
}

/// Candidate superiors of `position`, in probe order: the parent first,
/// then the rest of the parent's layer (wrapping around the branches), then
/// the same one layer up, ending at the root.
pub fn candidates(position: u64, fanout: u64) -> CandidateWalk {
    let fanout = fanout.max(1);
    let me = TreePosition::from_linear(position.max(1), fanout);
    CandidateWalk { ancestor: me.parent(), step: 0 }
}

pub struct CandidateWalk {
    /// Ancestor anchoring the layer currently being visited.
    ancestor: Option<TreePosition>,
    /// How many candidates of this layer were already yielded.
    step: u64,
}

impl Iterator for CandidateWalk {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            let anchor = self.ancestor?;
            let size = anchor.layer_size();
            if self.step >= size {
                self.ancestor = anchor.parent();
                self.step = 0;
                continue;
            }
            let offset = (anchor.offset + self.step) % size;
            self.step += 1;
            let candidate = TreePosition { offset, ..anchor };
            return Some(candidate.to_linear());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn linear_round_trip() {
        for fanout in [1u64, 2, 3, 64] {
            for position in 1..200u64 {
                let pos = TreePosition::from_linear(position, fanout);
                assert_eq!(pos.to_linear(), position, "fanout {fanout}");
            }
        }
    }

    #[test]
    fn layers_number_breadth_first() {
        // fanout 2: layer sizes 1, 2, 4, ...
        let p = TreePosition::from_linear(1, 2);
        assert_eq!((p.layer, p.offset), (0, 0));
        let p = TreePosition::from_linear(2, 2);
        assert_eq!((p.layer, p.offset), (1, 0));
        let p = TreePosition::from_linear(3, 2);
        assert_eq!((p.layer, p.offset), (1, 1));
        let p = TreePosition::from_linear(7, 2);
        assert_eq!((p.layer, p.offset), (2, 3));
    }

    #[test]
    fn parent_follows_the_tree() {
        // position 5 with fanout 2 = (layer 2, offset 1); parent = (1, 0) = 2
        let p = TreePosition::from_linear(5, 2);
        assert_eq!(p.parent().unwrap().to_linear(), 2);
        // the root has no parent
        assert!(TreePosition::from_linear(1, 2).parent().is_none());
    }

    #[test]
    fn candidate_order_parent_then_branches_then_up() {
        // position 5, fanout 2: parent 2, wrap to 3, then root 1
        let order: Vec<u64> = candidates(5, 2).collect();
        assert_eq!(order, vec![2, 3, 1]);

        // position 2: only the root
        let order: Vec<u64> = candidates(2, 2).collect();
        assert_eq!(order, vec![1]);

        // the root itself has no candidates
        assert_eq!(candidates(1, 2).count(), 0);
    }

    #[test]
    fn candidate_order_is_deterministic() {
        let a: Vec<u64> = candidates(23, 3).collect();
        let b: Vec<u64> = candidates(23, 3).collect();
        assert_eq!(a, b);
        // all candidates rank strictly above (before) the position itself
        assert!(a.iter().all(|c| *c < 23));
        // and the walk terminates at the root
        assert_eq!(*a.last().unwrap(), 1);
    }

    #[test]
    fn fanout_one_degenerates_to_a_chain() {
        let order: Vec<u64> = candidates(4, 1).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
