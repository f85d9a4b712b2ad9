//! Evacuation planning: finding and moving nodes that lie beyond a limit.
//!
//! When the tail of a file is to be given back, every node ending beyond the
//! evacuation point must be copied to lower offsets. [`get_outliers`] walks
//! the tree and records the child-index path of each such node in a
//! [`NodeTree`]; [`copy_on_write`] then rewrites exactly those nodes and
//! their ancestors.

use crate::error::CoreResult;
use slabdb_storage::{Node, Ref, RefOrTagged, SlabAlloc};
use std::collections::BTreeMap;

/// Sparse plan of nodes to move, indexed by child-index path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTree {
    /// The node at this path must be moved.
    pub marked: bool,
    /// Sub-plans by child index.
    pub children: BTreeMap<u32, NodeTree>,
}

impl NodeTree {
    /// Returns true if nothing needs to move.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.marked && self.children.is_empty()
    }

    /// Marks the node at `path`.
    pub fn mark(&mut self, path: &[u32]) {
        let mut node = self;
        for &ndx in path {
            node = node.children.entry(ndx).or_default();
        }
        node.marked = true;
    }

    /// Returns the sub-plan at child `ndx`.
    #[must_use]
    pub fn child(&self, ndx: u32) -> Option<&NodeTree> {
        self.children.get(&ndx)
    }

    /// Returns the paths of all marked nodes in depth-first order.
    #[must_use]
    pub fn outlier_paths(&self) -> Vec<Vec<u32>> {
        let mut out = Vec::new();
        let mut stack: Vec<(Vec<u32>, &NodeTree)> = vec![(Vec::new(), self)];
        while let Some((path, node)) = stack.pop() {
            if node.marked {
                out.push(path.clone());
            }
            for (&ndx, child) in node.children.iter().rev() {
                let mut child_path = path.clone();
                child_path.push(ndx);
                stack.push((child_path, child));
            }
        }
        out
    }
}

struct Frame {
    node: Node,
    next: usize,
}

/// Walks the tree rooted at `top_ref` depth first, calling
/// `visit(path, end_offset)` for every node, root included.
///
/// The walk keeps an explicit stack of frames, so tree depth does not
/// affect the call stack.
///
/// # Errors
///
/// Returns an error if a node cannot be read.
pub fn traverse(
    alloc: &SlabAlloc,
    top_ref: Ref,
    mut visit: impl FnMut(&[u32], u64),
) -> CoreResult<()> {
    if top_ref == 0 {
        return Ok(());
    }
    let mut path: Vec<u32> = Vec::new();
    let root = alloc.read_node(top_ref)?;
    visit(&path, top_ref + root.byte_size());
    let mut stack = vec![Frame { node: root, next: 0 }];

    while let Some(frame) = stack.last_mut() {
        let child = frame.node.values()[frame.next..]
            .iter()
            .position(|&raw| RefOrTagged::from_raw(raw).is_ref() && frame.node.kind().has_refs())
            .map(|offset| frame.next + offset);
        match child {
            Some(ndx) => {
                frame.next = ndx + 1;
                let child_ref = frame.node.values()[ndx];
                let node = alloc.read_node(child_ref)?;
                path.push(ndx as u32);
                visit(&path, child_ref + node.byte_size());
                stack.push(Frame { node, next: 0 });
            }
            None => {
                stack.pop();
                path.pop();
            }
        }
    }
    Ok(())
}

/// Plans every node of the tree at `top_ref` that ends beyond `limit`.
///
/// # Errors
///
/// Returns an error if a node cannot be read.
pub fn get_outliers(alloc: &SlabAlloc, top_ref: Ref, limit: u64) -> CoreResult<NodeTree> {
    let mut plan = NodeTree::default();
    traverse(alloc, top_ref, |path, end| {
        if end > limit {
            plan.mark(path);
        }
    })?;
    Ok(plan)
}

/// Copies every planned node under `ref_`, and the ancestors of every
/// copied node, to newly allocated space. Returns the new ref (equal to
/// `ref_` if nothing moved) and the number of nodes copied.
///
/// # Errors
///
/// Returns an error if a node cannot be read, allocated or freed.
pub fn copy_on_write(alloc: &SlabAlloc, ref_: Ref, plan: &NodeTree) -> CoreResult<(Ref, usize)> {
    let mut node = alloc.read_node(ref_)?;
    let mut copied = 0;
    let mut changed = false;
    if let Node::Inner(values) = &mut node {
        for (&ndx, sub) in &plan.children {
            let Some(slot) = values.get_mut(ndx as usize) else {
                continue;
            };
            let Some(child) = RefOrTagged::from_raw(*slot).as_ref() else {
                continue;
            };
            let (new_child, n) = copy_on_write(alloc, child, sub)?;
            copied += n;
            if new_child != child {
                *slot = new_child;
                changed = true;
            }
        }
    }
    if !plan.marked && !changed {
        return Ok((ref_, copied));
    }
    let new_ref = alloc.alloc_node(&node)?;
    alloc.free(ref_)?;
    Ok((new_ref, copied + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: usize) -> Node {
        Node::Leaf(vec![1; n])
    }

    #[test]
    fn traverse_visits_every_node_with_its_path() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let a = alloc.alloc_node(&leaf(1)).unwrap();
        let b = alloc.alloc_node(&leaf(2)).unwrap();
        let mid = alloc
            .alloc_node(&Node::inner([RefOrTagged::make_tagged(9), RefOrTagged::make_ref(b)]))
            .unwrap();
        let top = alloc
            .alloc_node(&Node::inner([RefOrTagged::make_ref(a), RefOrTagged::make_ref(mid)]))
            .unwrap();

        let mut seen = Vec::new();
        traverse(&alloc, top, |path, end| seen.push((path.to_vec(), end))).unwrap();
        assert_eq!(
            seen,
            vec![
                (vec![], top + 24),
                (vec![0], a + 16),
                (vec![1], mid + 24),
                (vec![1, 1], b + 24),
            ]
        );
    }

    #[test]
    fn outliers_are_exactly_the_nodes_past_the_limit() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let low = alloc.alloc_node(&leaf(1)).unwrap();
        let limit = alloc.logical_size();
        let high = alloc.alloc_node(&leaf(1)).unwrap();
        let inner = alloc
            .alloc_node(&Node::inner([RefOrTagged::make_ref(high)]))
            .unwrap();
        let top = alloc
            .alloc_node(&Node::inner([RefOrTagged::make_ref(low), RefOrTagged::make_ref(inner)]))
            .unwrap();

        let plan = get_outliers(&alloc, top, limit).unwrap();
        assert_eq!(plan.outlier_paths(), vec![vec![], vec![1], vec![1, 0]]);
        assert!(plan.child(0).is_none());
    }

    #[test]
    fn copy_on_write_leaves_unplanned_nodes_alone() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let a = alloc.alloc_node(&leaf(1)).unwrap();
        let b = alloc.alloc_node(&leaf(1)).unwrap();
        let top = alloc
            .alloc_node(&Node::inner([RefOrTagged::make_ref(a), RefOrTagged::make_ref(b)]))
            .unwrap();

        let mut plan = NodeTree::default();
        plan.mark(&[1]);
        let (new_top, copied) = copy_on_write(&alloc, top, &plan).unwrap();
        assert_eq!(copied, 2);
        assert_ne!(new_top, top);
        let node = alloc.read_node(new_top).unwrap();
        assert_eq!(node.slot(0).as_ref(), Some(a));
        assert_ne!(node.slot(1).as_ref(), Some(b));
        assert_eq!(alloc.read_node(node.slot(1).as_ref().unwrap()).unwrap(), leaf(1));
    }

    proptest! {
        #[test]
        fn marked_paths_round_trip(paths in proptest::collection::btree_set(
            proptest::collection::vec(0u32..4, 0..4), 0..12)) {
            let mut plan = NodeTree::default();
            for path in &paths {
                plan.mark(path);
            }
            let found: std::collections::BTreeSet<Vec<u32>> =
                plan.outlier_paths().into_iter().collect();
            prop_assert_eq!(found, paths);
        }
    }
}
