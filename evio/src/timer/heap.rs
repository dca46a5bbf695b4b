// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intrusive Fibonacci min-heap.
//!
//! Nodes embed a [`FibAnchor`] and the heap links through it; no
//! allocation happens in any heap operation, which keeps the timer
//! dispatch path allocation-free. `insert` and the structural parts of
//! `remove` are O(1), `extract_min` is amortized O(log n).
//!
//! Every operation requires external synchronization (the timer
//! dispatcher calls them under its mutex) and node lifetimes managed by
//! the caller.

use core::ptr::{self, NonNull};

use util::non_null;

/// Upper bound on a root's degree: ~1.44 · log2(len), so 96 covers any
/// heap that fits in a 64-bit address space.
const MAX_DEGREE: usize = 96;

/// Heap linkage embedded in each node.
///
/// Siblings form a circular doubly-linked ring through `left`/`right`;
/// `child` points at one element of the child ring.
pub(crate) struct FibAnchor<L> {
    parent: *mut L,
    child: *mut L,
    left: *mut L,
    right: *mut L,
    degree: u32,
    marked: bool,
}

impl<L> FibAnchor<L> {
    pub(crate) const fn new() -> Self {
        Self {
            parent: ptr::null_mut(),
            child: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            degree: 0,
            marked: false,
        }
    }

    // The sibling pointers double as linkage for an external list (the
    // timer dispatcher's suspended list) while the node is out of the
    // heap; membership is exclusive.

    pub(crate) fn list_prev(&self) -> *mut L {
        self.left
    }

    pub(crate) fn list_next(&self) -> *mut L {
        self.right
    }

    pub(crate) fn set_list_prev(&mut self, prev: *mut L) {
        self.left = prev;
    }

    pub(crate) fn set_list_next(&mut self, next: *mut L) {
        self.right = next;
    }
}

/// A node linkable into a [`FibHeap`].
pub(crate) trait FibNode: Sized {
    /// Raw access to the node's embedded anchor.
    fn anchor(&self) -> *mut FibAnchor<Self>;

    /// Strict weak ordering on the node's key.
    fn before(&self, other: &Self) -> bool;
}

/// Intrusive Fibonacci min-heap over `L`.
pub(crate) struct FibHeap<L: FibNode> {
    /// Minimum root; the root ring is reachable from it.
    min: *mut L,
    len: usize,
}

impl<L: FibNode> FibHeap<L> {
    pub(crate) const fn new() -> Self {
        Self {
            min: ptr::null_mut(),
            len: 0,
        }
    }

    #[allow(dead_code, reason = "exercised by the model tests")]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.min.is_null()
    }

    /// The node with the smallest key, or null.
    pub(crate) fn peek_min(&self) -> *mut L {
        self.min
    }

    /// Inserts `node`.
    ///
    /// # Safety
    ///
    /// `node` must be alive and a member of no heap or list sharing its
    /// anchor.
    pub(crate) unsafe fn insert(&mut self, node: NonNull<L>) {
        let node = node.as_ptr();
        // Safety: per the contract.
        unsafe {
            let anchor = (*node).anchor();
            (*anchor).parent = ptr::null_mut();
            (*anchor).child = ptr::null_mut();
            (*anchor).degree = 0;
            (*anchor).marked = false;

            if self.min.is_null() {
                (*anchor).left = node;
                (*anchor).right = node;
                self.min = node;
            } else {
                ring_insert(self.min, node);
                if (*node).before(&*self.min) {
                    self.min = node;
                }
            }
        }
        self.len += 1;
    }

    /// Removes and returns the node with the smallest key. The returned
    /// node's anchor is reset and free for reuse.
    pub(crate) fn extract_min(&mut self) -> Option<NonNull<L>> {
        if self.min.is_null() {
            return None;
        }
        let min = self.min;
        // Safety: `min` is a live heap member; structure invariants hold.
        unsafe {
            // promote the children to roots
            let child = (*(*min).anchor()).child;
            if !child.is_null() {
                let mut current = child;
                loop {
                    (*(*current).anchor()).parent = ptr::null_mut();
                    current = (*(*current).anchor()).right;
                    if current == child {
                        break;
                    }
                }
                ring_splice(min, child);
                (*(*min).anchor()).child = ptr::null_mut();
            }

            let right = (*(*min).anchor()).right;
            let was_only_root = right == min;
            ring_remove(min);
            self.len -= 1;
            clear_anchor(min);

            if was_only_root {
                self.min = ptr::null_mut();
            } else {
                self.min = right;
                self.consolidate(right);
            }

            Some(non_null(min))
        }
    }

    /// Removes an arbitrary node. Its anchor is reset afterwards.
    ///
    /// # Safety
    ///
    /// `node` must be a member of *this* heap.
    pub(crate) unsafe fn remove(&mut self, node: NonNull<L>) {
        let node = node.as_ptr();
        if node == self.min {
            self.extract_min();
            return;
        }
        // Safety: per the contract; `node` is not the minimum, so the
        // heap has at least two nodes and `self.min` stays valid
        // throughout.
        unsafe {
            let parent = (*(*node).anchor()).parent;
            if !parent.is_null() {
                self.cut(node);
                self.cascading_cut(parent);
            }

            // promote the children to roots
            let child = (*(*node).anchor()).child;
            if !child.is_null() {
                let mut current = child;
                loop {
                    (*(*current).anchor()).parent = ptr::null_mut();
                    current = (*(*current).anchor()).right;
                    if current == child {
                        break;
                    }
                }
                ring_splice(node, child);
                (*(*node).anchor()).child = ptr::null_mut();
            }

            ring_remove(node);
            self.len -= 1;
            clear_anchor(node);
        }
    }

    /// Moves `node` from its parent's child ring into the root ring.
    ///
    /// # Safety
    ///
    /// `node` must have a parent; the heap must be non-empty.
    unsafe fn cut(&mut self, node: *mut L) {
        // Safety: per the contract.
        unsafe {
            let parent = (*(*node).anchor()).parent;
            debug_assert!(!parent.is_null());

            if (*(*parent).anchor()).child == node {
                let right = (*(*node).anchor()).right;
                (*(*parent).anchor()).child = if right == node { ptr::null_mut() } else { right };
            }
            ring_remove(node);
            (*(*parent).anchor()).degree -= 1;

            (*(*node).anchor()).parent = ptr::null_mut();
            (*(*node).anchor()).marked = false;
            ring_insert(self.min, node);
            // The key set is unchanged, so `min` stays correct.
        }
    }

    /// Classic cascading cut: a node losing its second child is cut as
    /// well, which is what bounds root degrees.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this heap.
    unsafe fn cascading_cut(&mut self, node: *mut L) {
        let mut node = node;
        // Safety: per the contract.
        unsafe {
            loop {
                let parent = (*(*node).anchor()).parent;
                if parent.is_null() {
                    break;
                }
                if !(*(*node).anchor()).marked {
                    (*(*node).anchor()).marked = true;
                    break;
                }
                self.cut(node);
                node = parent;
            }
        }
    }

    /// Merges roots of equal degree until all degrees are distinct, and
    /// re-locates the minimum. `start` must be a root of the (non-empty)
    /// heap.
    ///
    /// # Safety
    ///
    /// The root ring must be consistent and reachable from `start`.
    unsafe fn consolidate(&mut self, start: *mut L) {
        let mut by_degree: [*mut L; MAX_DEGREE] = [ptr::null_mut(); MAX_DEGREE];

        // Safety: per the contract.
        unsafe {
            // Dismantle the root ring into a singly-linked worklist
            // (reusing `right` as the chain pointer).
            let mut chain: *mut L = ptr::null_mut();
            let mut node = start;
            loop {
                let next = (*(*node).anchor()).right;
                let was_last = next == node;
                ring_remove(node);
                (*(*node).anchor()).right = chain;
                chain = node;
                if was_last {
                    break;
                }
                node = next;
            }

            // Merge equal-degree trees.
            while !chain.is_null() {
                let mut root = chain;
                chain = (*(*root).anchor()).right;

                (*(*root).anchor()).left = root;
                (*(*root).anchor()).right = root;
                (*(*root).anchor()).parent = ptr::null_mut();

                let mut degree = (*(*root).anchor()).degree as usize;
                while !by_degree[degree].is_null() {
                    let mut other = by_degree[degree];
                    by_degree[degree] = ptr::null_mut();
                    if (*other).before(&*root) {
                        core::mem::swap(&mut root, &mut other);
                    }
                    link_child(root, other);
                    degree += 1;
                }
                by_degree[degree] = root;
            }

            // Rebuild the root ring and find the minimum.
            self.min = ptr::null_mut();
            for root in by_degree {
                if root.is_null() {
                    continue;
                }
                if self.min.is_null() {
                    (*(*root).anchor()).left = root;
                    (*(*root).anchor()).right = root;
                    self.min = root;
                } else {
                    ring_insert(self.min, root);
                    if (*root).before(&*self.min) {
                        self.min = root;
                    }
                }
            }
        }
    }
}

/// Inserts `node` into the ring right of `pos`.
///
/// # Safety
///
/// `pos` must be in a consistent ring; `node` must be free.
unsafe fn ring_insert<L: FibNode>(pos: *mut L, node: *mut L) {
    // Safety: per the contract.
    unsafe {
        let right = (*(*pos).anchor()).right;
        (*(*node).anchor()).left = pos;
        (*(*node).anchor()).right = right;
        (*(*right).anchor()).left = node;
        (*(*pos).anchor()).right = node;
    }
}

/// Concatenates the ring containing `other` into the ring of `pos`.
///
/// # Safety
///
/// Both must be consistent, disjoint rings.
unsafe fn ring_splice<L: FibNode>(pos: *mut L, other: *mut L) {
    // Safety: per the contract.
    unsafe {
        let pos_right = (*(*pos).anchor()).right;
        let other_left = (*(*other).anchor()).left;
        (*(*pos).anchor()).right = other;
        (*(*other).anchor()).left = pos;
        (*(*other_left).anchor()).right = pos_right;
        (*(*pos_right).anchor()).left = other_left;
    }
}

/// Unlinks `node` from its ring (leaving it self-ringed).
///
/// # Safety
///
/// `node` must be in a consistent ring.
unsafe fn ring_remove<L: FibNode>(node: *mut L) {
    // Safety: per the contract.
    unsafe {
        let left = (*(*node).anchor()).left;
        let right = (*(*node).anchor()).right;
        (*(*left).anchor()).right = right;
        (*(*right).anchor()).left = left;
        (*(*node).anchor()).left = node;
        (*(*node).anchor()).right = node;
    }
}

/// Makes (self-ringed) `child` a child of `parent`.
///
/// # Safety
///
/// Both must be live roots; `child` must be self-ringed.
unsafe fn link_child<L: FibNode>(parent: *mut L, child: *mut L) {
    // Safety: per the contract.
    unsafe {
        (*(*child).anchor()).parent = parent;
        (*(*child).anchor()).marked = false;
        let existing = (*(*parent).anchor()).child;
        if existing.is_null() {
            (*(*parent).anchor()).child = child;
        } else {
            ring_insert(existing, child);
        }
        (*(*parent).anchor()).degree += 1;
    }
}

/// Resets `node`'s anchor for reuse.
///
/// # Safety
///
/// `node` must be alive and unlinked.
unsafe fn clear_anchor<L: FibNode>(node: *mut L) {
    // Safety: per the contract.
    unsafe {
        let anchor = (*node).anchor();
        (*anchor).parent = ptr::null_mut();
        (*anchor).child = ptr::null_mut();
        (*anchor).left = ptr::null_mut();
        (*anchor).right = ptr::null_mut();
        (*anchor).degree = 0;
        (*anchor).marked = false;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use proptest::prelude::*;

    struct TestNode {
        key: u64,
        anchor: UnsafeCell<FibAnchor<TestNode>>,
    }

    impl TestNode {
        fn boxed(key: u64) -> Box<Self> {
            Box::new(Self {
                key,
                anchor: UnsafeCell::new(FibAnchor::new()),
            })
        }
    }

    impl FibNode for TestNode {
        fn anchor(&self) -> *mut FibAnchor<TestNode> {
            self.anchor.get()
        }

        fn before(&self, other: &TestNode) -> bool {
            self.key < other.key
        }
    }

    fn drain(heap: &mut FibHeap<TestNode>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(node) = heap.extract_min() {
            // Safety: nodes are owned by the test's Vec<Box<_>>.
            out.push(unsafe { node.as_ref().key });
        }
        out
    }

    #[test]
    fn extracts_in_key_order() {
        let nodes: Vec<_> = [5u64, 1, 9, 3, 7, 3, 0, 12]
            .iter()
            .map(|&k| TestNode::boxed(k))
            .collect();

        let mut heap = FibHeap::new();
        for node in &nodes {
            // Safety: each node is inserted exactly once and outlives
            // the heap.
            unsafe { heap.insert(NonNull::from(&**node)) };
        }
        assert_eq!(heap.len(), 8);

        assert_eq!(drain(&mut heap), vec![0, 1, 3, 3, 5, 7, 9, 12]);
        assert!(heap.is_empty());
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn peek_tracks_minimum() {
        let a = TestNode::boxed(10);
        let b = TestNode::boxed(4);
        let c = TestNode::boxed(6);

        let mut heap: FibHeap<TestNode> = FibHeap::new();
        assert!(heap.peek_min().is_null());

        // Safety: see above.
        unsafe {
            heap.insert(NonNull::from(&*a));
            assert_eq!((*heap.peek_min()).key, 10);
            heap.insert(NonNull::from(&*b));
            assert_eq!((*heap.peek_min()).key, 4);
            heap.insert(NonNull::from(&*c));
            assert_eq!((*heap.peek_min()).key, 4);

            heap.extract_min();
            assert_eq!((*heap.peek_min()).key, 6);
        }
    }

    #[test]
    fn remove_arbitrary_nodes() {
        let nodes: Vec<_> = (0u64..20).map(TestNode::boxed).collect();
        let mut heap = FibHeap::new();
        // Safety: see above.
        unsafe {
            for node in &nodes {
                heap.insert(NonNull::from(&**node));
            }
            // trigger some consolidation so removals hit tree-internal
            // nodes too
            let first = heap.extract_min().unwrap();
            assert_eq!(first.as_ref().key, 0);

            heap.remove(NonNull::from(&*nodes[5]));
            heap.remove(NonNull::from(&*nodes[19]));
            heap.remove(NonNull::from(&*nodes[1]));
        }

        assert_eq!(
            drain(&mut heap),
            (2u64..19).filter(|&k| k != 5).collect::<Vec<_>>()
        );
    }

    #[test]
    fn reinsert_after_extract() {
        let node = TestNode::boxed(42);
        let other = TestNode::boxed(7);
        let mut heap = FibHeap::new();
        // Safety: see above.
        unsafe {
            heap.insert(NonNull::from(&*node));
            let popped = heap.extract_min().unwrap();
            assert_eq!(popped.as_ref().key, 42);

            heap.insert(NonNull::from(&*other));
            heap.insert(NonNull::from(&*node));
        }
        assert_eq!(drain(&mut heap), vec![7, 42]);
    }

    proptest! {
        #[test]
        fn matches_sorted_model(keys in proptest::collection::vec(0u64..1_000, 1..256)) {
            let nodes: Vec<_> = keys.iter().map(|&k| TestNode::boxed(k)).collect();
            let mut heap = FibHeap::new();
            // Safety: see above.
            unsafe {
                for node in &nodes {
                    heap.insert(NonNull::from(&**node));
                }
            }

            let mut expected = keys.clone();
            expected.sort_unstable();
            prop_assert_eq!(drain(&mut heap), expected);
        }

        #[test]
        fn interleaved_remove_matches_model(
            keys in proptest::collection::vec(0u64..1_000, 1..128),
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..32),
        ) {
            let nodes: Vec<_> = keys.iter().map(|&k| TestNode::boxed(k)).collect();
            let mut heap = FibHeap::new();
            // Safety: see above.
            unsafe {
                for node in &nodes {
                    heap.insert(NonNull::from(&**node));
                }
            }

            let mut removed = vec![false; nodes.len()];
            for index in &removals {
                let index = index.index(nodes.len());
                if !removed[index] {
                    removed[index] = true;
                    // Safety: the node is a member (not removed yet).
                    unsafe { heap.remove(NonNull::from(&*nodes[index])) };
                }
            }

            let mut expected: Vec<u64> = keys
                .iter()
                .zip(&removed)
                .filter(|&(_, &r)| !r)
                .map(|(&k, _)| k)
                .collect();
            expected.sort_unstable();
            prop_assert_eq!(drain(&mut heap), expected);
        }
    }
}
