use crate::infomap::Infomap;
use crate::objective::FlowData;
use rustc_hash::FxHashSet;

/// Handle to a node slot in a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Module,
    Leaf,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: f64,
    pub flow: f64,
}

impl Edge {
    #[inline]
    pub fn is_self_pointing(&self) -> bool {
        self.source == self.target
    }
}

/// Deeper structure found inside one module by a nested instance.
#[derive(Debug, Clone, Default)]
pub struct SubStructure {
    pub infomap: Option<Box<Infomap>>,
    pub explored_without_improvement: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub uid: u64,
    pub kind: NodeKind,
    /// Module assignment while optimizing, or position among siblings.
    pub index: u32,
    /// Position in the leaf-level input network, kept across nesting.
    pub original_index: u32,
    pub data: FlowData,
    pub codelength: f64,
    pub parent: Option<NodeId>,
    pub sub_structure: SubStructure,
    children: Vec<NodeId>,
    out_edges: Vec<EdgeId>,
    in_edges: Vec<EdgeId>,
}

impl Node {
    fn new(uid: u64, kind: NodeKind, data: FlowData) -> Self {
        Self {
            uid,
            kind,
            index: 0,
            original_index: 0,
            data,
            codelength: 0.0,
            parent: None,
            sub_structure: SubStructure::default(),
            children: Vec::new(),
            out_edges: Vec::new(),
            in_edges: Vec::new(),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    #[inline]
    pub fn child_degree(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[inline]
    pub fn out_edges(&self) -> &[EdgeId] {
        &self.out_edges
    }

    #[inline]
    pub fn in_edges(&self) -> &[EdgeId] {
        &self.in_edges
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.out_edges.len() + self.in_edges.len()
    }

    #[inline]
    pub fn is_dangling(&self) -> bool {
        self.out_edges.is_empty()
    }
}

/// Arena holding the root, the module levels and the leaves of one instance.
///
/// Slots of deleted nodes and edges are recycled, so handles must not be
/// kept across the operation that deleted them.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    free_nodes: Vec<NodeId>,
    free_edges: Vec<EdgeId>,
    root: NodeId,
    leaves: Vec<NodeId>,
    num_leaf_edges: usize,
    next_uid: u64,
}

impl Tree {
    /// Creates a tree holding only a root. Uids start at `first_uid`.
    pub fn new(first_uid: u64) -> Self {
        let root = Node::new(first_uid, NodeKind::Root, FlowData::default());
        Self {
            nodes: vec![Some(root)],
            edges: Vec::new(),
            free_nodes: Vec::new(),
            free_edges: Vec::new(),
            root: NodeId(0),
            leaves: Vec::new(),
            num_leaf_edges: 0,
            next_uid: first_uid.wrapping_add(1),
        }
    }

    /// Next value of the monotonic uid sequence; also used to seed nested instances.
    pub fn next_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid = self.next_uid.wrapping_add(1);
        uid
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    #[inline]
    pub fn num_leaf_nodes(&self) -> usize {
        self.leaves.len()
    }

    #[inline]
    pub fn num_leaf_edges(&self) -> usize {
        self.num_leaf_edges
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        match &self.nodes[id.index()] {
            Some(node) => node,
            None => unreachable!("stale node handle {:?}", id),
        }
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match &mut self.nodes[id.index()] {
            Some(node) => node,
            None => unreachable!("stale node handle {:?}", id),
        }
    }

    #[inline]
    pub fn edge(&self, id: EdgeId) -> &Edge {
        match &self.edges[id.0 as usize] {
            Some(edge) => edge,
            None => unreachable!("stale edge handle {:?}", id),
        }
    }

    #[inline]
    pub fn data(&self, id: NodeId) -> &FlowData {
        &self.node(id).data
    }

    #[inline]
    pub fn data_mut(&mut self, id: NodeId) -> &mut FlowData {
        &mut self.node_mut(id).data
    }

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    #[inline]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    #[inline]
    pub fn child_degree(&self, id: NodeId) -> usize {
        self.node(id).children.len()
    }

    #[inline]
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).is_leaf()
    }

    #[inline]
    pub fn num_top_modules(&self) -> usize {
        self.child_degree(self.root)
    }

    /// True while no module level separates the leaves from the root.
    pub fn is_leaf_level_flat(&self) -> bool {
        self.leaves
            .first()
            .map_or(true, |&leaf| self.parent(leaf) == Some(self.root))
    }

    fn alloc_node(&mut self, kind: NodeKind, data: FlowData) -> NodeId {
        let uid = self.next_uid();
        let node = Node::new(uid, kind, data);
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id.index()] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    /// Appends a leaf under the root.
    pub fn add_leaf(&mut self, original_index: u32, data: FlowData) -> NodeId {
        let id = self.alloc_node(NodeKind::Leaf, data);
        let position = self.leaves.len() as u32;
        {
            let node = self.node_mut(id);
            node.original_index = original_index;
            node.index = position;
        }
        self.leaves.push(id);
        let root = self.root;
        self.add_child(root, id);
        id
    }

    /// Creates a detached module node.
    pub fn create_module(&mut self, data: FlowData) -> NodeId {
        self.alloc_node(NodeKind::Module, data)
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(parent).children.push(child);
        self.node_mut(child).parent = Some(parent);
    }

    /// Empties the child list of `id`. The released children keep their
    /// parent handle until they are attached somewhere else.
    pub fn release_children(&mut self, id: NodeId) -> Vec<NodeId> {
        std::mem::take(&mut self.node_mut(id).children)
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, weight: f64, flow: f64) -> EdgeId {
        let edge = Edge {
            source,
            target,
            weight,
            flow,
        };
        let id = match self.free_edges.pop() {
            Some(id) => {
                self.edges[id.0 as usize] = Some(edge);
                id
            }
            None => {
                self.edges.push(Some(edge));
                EdgeId((self.edges.len() - 1) as u32)
            }
        };
        self.node_mut(source).out_edges.push(id);
        self.node_mut(target).in_edges.push(id);
        if self.is_leaf(source) {
            self.num_leaf_edges += 1;
        }
        id
    }

    /// Splices every non-leaf child's children into the child list of `id`,
    /// keeping their order, and deletes those children. Returns how many were replaced.
    pub fn replace_children_with_grandchildren(&mut self, id: NodeId) -> usize {
        let children = std::mem::take(&mut self.node_mut(id).children);
        let mut spliced = Vec::with_capacity(children.len());
        let mut removed = Vec::new();
        for child in children {
            if self.is_leaf(child) || self.child_degree(child) == 0 {
                spliced.push(child);
                continue;
            }
            let grandchildren = std::mem::take(&mut self.node_mut(child).children);
            for &grandchild in &grandchildren {
                self.node_mut(grandchild).parent = Some(id);
            }
            spliced.extend(grandchildren);
            removed.push(child);
        }
        self.node_mut(id).children = spliced;
        let count = removed.len();
        self.delete_nodes(&removed);
        count
    }

    /// Puts the children of `id` in its place under its parent and deletes it.
    pub fn replace_with_children(&mut self, id: NodeId) -> bool {
        if self.is_leaf(id) || self.child_degree(id) == 0 {
            return false;
        }
        let Some(parent) = self.parent(id) else {
            return false;
        };
        let children = std::mem::take(&mut self.node_mut(id).children);
        for &child in &children {
            self.node_mut(child).parent = Some(parent);
        }
        let siblings = &mut self.node_mut(parent).children;
        match siblings.iter().position(|&s| s == id) {
            Some(position) => {
                siblings.splice(position..=position, children);
            }
            None => siblings.extend(children),
        }
        self.delete_nodes(&[id]);
        true
    }

    /// Removes childless module nodes together with their edges.
    pub fn delete_nodes(&mut self, ids: &[NodeId]) {
        if ids.is_empty() {
            return;
        }
        let dying: FxHashSet<NodeId> = ids.iter().copied().collect();
        for &id in ids {
            debug_assert!(!self.is_leaf(id), "leaves are never deleted");
            debug_assert!(self.child_degree(id) == 0, "delete of a node with children");
            let (out_edges, in_edges) = {
                let node = self.node_mut(id);
                (
                    std::mem::take(&mut node.out_edges),
                    std::mem::take(&mut node.in_edges),
                )
            };
            for e in out_edges {
                // Links from an earlier dying node were released with its in-edges.
                let Some(edge) = self.edges[e.0 as usize].as_ref() else {
                    continue;
                };
                let target = edge.target;
                if !dying.contains(&target) {
                    self.node_mut(target).in_edges.retain(|&x| x != e);
                }
                self.free_edge(e);
            }
            for e in in_edges {
                // Self-links were already released with the out-edges.
                let Some(edge) = self.edges[e.0 as usize].as_ref() else {
                    continue;
                };
                let source = edge.source;
                if !dying.contains(&source) {
                    self.node_mut(source).out_edges.retain(|&x| x != e);
                }
                self.free_edge(e);
            }
        }
        for &id in ids {
            self.nodes[id.index()] = None;
            self.free_nodes.push(id);
        }
    }

    fn free_edge(&mut self, id: EdgeId) {
        if self.edges[id.0 as usize].take().is_some() {
            self.free_edges.push(id);
        }
    }

    /// Top-level module (child of the root) containing `id`.
    pub fn top_module_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if parent == self.root {
                break;
            }
            current = parent;
        }
        current
    }

    /// Depth-first walk over the descendants of `id`, children in order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_leaves(n: usize) -> Tree {
        let mut tree = Tree::new(0);
        for i in 0..n {
            tree.add_leaf(i as u32, FlowData::with_flow(1.0 / n as f64));
        }
        tree
    }

    #[test]
    fn leaves_start_under_root() {
        let tree = tree_with_leaves(4);
        assert_eq!(tree.num_leaf_nodes(), 4);
        assert_eq!(tree.num_top_modules(), 4);
        assert!(tree.is_leaf_level_flat());
        let uids: Vec<u64> = tree.leaves().iter().map(|&l| tree.node(l).uid).collect();
        assert!(uids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn modules_splice_back_in_order() {
        let mut tree = tree_with_leaves(4);
        let root = tree.root();
        let leaves = tree.leaves().to_vec();
        tree.release_children(root);
        let a = tree.create_module(FlowData::default());
        let b = tree.create_module(FlowData::default());
        tree.add_child(root, a);
        tree.add_child(root, b);
        tree.add_child(a, leaves[0]);
        tree.add_child(a, leaves[2]);
        tree.add_child(b, leaves[1]);
        tree.add_child(b, leaves[3]);
        tree.add_edge(a, b, 0.0, 0.25);
        assert!(!tree.is_leaf_level_flat());
        assert_eq!(tree.top_module_of(leaves[3]), b);

        assert_eq!(tree.replace_children_with_grandchildren(root), 2);
        assert_eq!(
            tree.children(root),
            &[leaves[0], leaves[2], leaves[1], leaves[3]]
        );
        assert!(tree.is_leaf_level_flat());
        for &leaf in &leaves {
            assert_eq!(tree.parent(leaf), Some(root));
        }
    }

    #[test]
    fn deleted_modules_drop_their_edges_from_neighbours() {
        let mut tree = tree_with_leaves(3);
        let root = tree.root();
        let leaves = tree.leaves().to_vec();
        tree.release_children(root);
        let a = tree.create_module(FlowData::default());
        let b = tree.create_module(FlowData::default());
        tree.add_child(root, a);
        tree.add_child(root, b);
        tree.add_child(a, leaves[0]);
        tree.add_child(b, leaves[1]);
        tree.add_child(b, leaves[2]);
        tree.add_edge(a, b, 0.0, 0.1);
        tree.add_edge(b, a, 0.0, 0.2);

        assert!(tree.replace_with_children(a));
        assert_eq!(tree.children(root), &[leaves[0], b]);
        assert!(tree.node(b).out_edges().is_empty());
        assert!(tree.node(b).in_edges().is_empty());

        // Recycled slot gets a fresh uid.
        let c = tree.create_module(FlowData::default());
        assert_eq!(c, a);
        assert!(tree.node(c).uid > tree.node(b).uid);
    }

    #[test]
    fn modules_linked_both_ways_are_deleted_together() {
        let mut tree = tree_with_leaves(4);
        let root = tree.root();
        let leaves = tree.leaves().to_vec();
        tree.release_children(root);
        let a = tree.create_module(FlowData::default());
        let b = tree.create_module(FlowData::default());
        let c = tree.create_module(FlowData::default());
        for module in [a, b, c] {
            tree.add_child(root, module);
        }
        tree.add_child(a, leaves[0]);
        tree.add_child(a, leaves[1]);
        tree.add_child(b, leaves[2]);
        tree.add_child(c, leaves[3]);
        tree.add_edge(a, b, 0.0, 0.1);
        tree.add_edge(b, a, 0.0, 0.2);
        tree.add_edge(b, c, 0.0, 0.3);
        let kept = tree.add_edge(leaves[0], leaves[2], 1.0, 0.1);

        assert_eq!(tree.replace_children_with_grandchildren(root), 3);
        assert!(tree.is_leaf_level_flat());
        assert_eq!(tree.node(leaves[0]).out_edges(), &[kept]);
        assert_eq!(tree.node(leaves[2]).in_edges(), &[kept]);

        // All three module edges went back to the free list.
        let x = tree.create_module(FlowData::default());
        let y = tree.create_module(FlowData::default());
        let recycled = [
            tree.add_edge(x, y, 0.0, 0.0),
            tree.add_edge(y, x, 0.0, 0.0),
            tree.add_edge(x, x, 0.0, 0.0),
        ];
        assert!(recycled.iter().all(|&e| e != kept && e.0 < 4));
    }

    #[test]
    fn leaf_edges_are_counted_and_self_links_recognised() {
        let mut tree = tree_with_leaves(2);
        let leaves = tree.leaves().to_vec();
        let e = tree.add_edge(leaves[0], leaves[1], 1.0, 0.5);
        let s = tree.add_edge(leaves[1], leaves[1], 1.0, 0.5);
        assert_eq!(tree.num_leaf_edges(), 2);
        assert!(!tree.edge(e).is_self_pointing());
        assert!(tree.edge(s).is_self_pointing());
        assert_eq!(tree.node(leaves[1]).degree(), 3);
        assert!(tree.node(leaves[0]).in_edges().is_empty());
    }

    #[test]
    fn descendants_walk_depth_first() {
        let mut tree = tree_with_leaves(3);
        let root = tree.root();
        let leaves = tree.leaves().to_vec();
        tree.release_children(root);
        let m = tree.create_module(FlowData::default());
        tree.add_child(root, m);
        tree.add_child(m, leaves[1]);
        tree.add_child(root, leaves[0]);
        tree.add_child(root, leaves[2]);
        assert_eq!(
            tree.descendants(root),
            vec![m, leaves[1], leaves[0], leaves[2]]
        );
    }
}
