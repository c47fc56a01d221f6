//! Dependency arena shared by every graph element.
//!
//! A node's depth is the longest path from any source. Adding an edge raises depths along the
//! successor cone; removing one never lowers them, so depths read as "maximum over history"
//! until the node is cleared.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("Adding {input:?} as an input of {node:?} would close a cycle")]
    CycleDetected { node: NodeId, input: NodeId },
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    inner: usize,
}

#[derive(Debug)]
pub struct NodeEntry<T> {
    depth: usize,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    visited: bool,
    pub payload: T,
}

impl<T> NodeEntry<T> {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }
}

/// Result of [`DependencyGraph::walk`].
#[derive(Debug, Clone, PartialEq)]
pub enum Walk<R> {
    ByDepth(BTreeMap<usize, Vec<R>>),
    Flat(Vec<R>),
}

impl<R> Walk<R> {
    /// Flattens grouped results in ascending depth.
    pub fn into_vec(self) -> Vec<R> {
        match self {
            Walk::ByDepth(groups) => groups.into_values().flatten().collect(),
            Walk::Flat(results) => results,
        }
    }
}

#[derive(Debug)]
pub struct DependencyGraph<T> {
    nodes: HashMap<NodeId, NodeEntry<T>>,
    next_node_id: usize,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DependencyGraph<T> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_node_id: 0,
        }
    }

    pub fn add_node(&mut self, payload: T) -> NodeId {
        let id = NodeId {
            inner: self.next_node_id,
        };
        self.next_node_id += 1;
        self.nodes.insert(
            id,
            NodeEntry {
                depth: 0,
                inputs: Vec::new(),
                outputs: Vec::new(),
                visited: false,
                payload,
            },
        );
        id
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<T, NodeError> {
        self.clear(id)?;
        self.nodes
            .remove(&id)
            .map(|entry| entry.payload)
            .ok_or(NodeError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn entry(&self, id: NodeId) -> Result<&NodeEntry<T>, NodeError> {
        self.nodes.get(&id).ok_or(NodeError::UnknownNode(id))
    }

    pub fn get(&self, id: NodeId) -> Result<&T, NodeError> {
        self.entry(id).map(|entry| &entry.payload)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut T, NodeError> {
        self.nodes
            .get_mut(&id)
            .map(|entry| &mut entry.payload)
            .ok_or(NodeError::UnknownNode(id))
    }

    pub fn depth(&self, id: NodeId) -> Result<usize, NodeError> {
        self.entry(id).map(|entry| entry.depth)
    }

    pub fn inputs(&self, id: NodeId) -> Result<&[NodeId], NodeError> {
        self.entry(id).map(|entry| entry.inputs.as_slice())
    }

    pub fn outputs(&self, id: NodeId) -> Result<&[NodeId], NodeError> {
        self.entry(id).map(|entry| entry.outputs.as_slice())
    }

    /// Adds `input` as a predecessor of `node` and raises depths downstream.
    pub fn add_input(&mut self, node: NodeId, input: NodeId) -> Result<(), NodeError> {
        self.entry(node)?;
        self.entry(input)?;
        if node == input || self.reaches(node, input) {
            return Err(NodeError::CycleDetected { node, input });
        }
        let entry = self.entry_mut(node)?;
        if !entry.inputs.contains(&input) {
            entry.inputs.push(input);
        }
        let entry = self.entry_mut(input)?;
        if !entry.outputs.contains(&node) {
            entry.outputs.push(node);
        }
        self.propagate_depth(node)
    }

    /// Removes the edge in both directions. Depths are left as they are.
    pub fn remove_input(&mut self, node: NodeId, input: NodeId) -> Result<(), NodeError> {
        self.entry_mut(node)?.inputs.retain(|x| *x != input);
        self.entry_mut(input)?.outputs.retain(|x| *x != node);
        Ok(())
    }

    /// Detaches `id` from every neighbour and resets its depth.
    pub fn clear(&mut self, id: NodeId) -> Result<(), NodeError> {
        let entry = self.entry_mut(id)?;
        let inputs = std::mem::take(&mut entry.inputs);
        let outputs = std::mem::take(&mut entry.outputs);
        entry.depth = 0;
        for input in inputs {
            if let Some(prev) = self.nodes.get_mut(&input) {
                prev.outputs.retain(|x| *x != id);
            }
        }
        for output in outputs {
            if let Some(next) = self.nodes.get_mut(&output) {
                next.inputs.retain(|x| *x != id);
            }
        }
        Ok(())
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry<T>, NodeError> {
        self.nodes.get_mut(&id).ok_or(NodeError::UnknownNode(id))
    }

    fn required_depth(&self, id: NodeId) -> usize {
        self.nodes[&id]
            .inputs
            .iter()
            .map(|input| self.nodes[input].depth + 1)
            .max()
            .unwrap_or(0)
    }

    fn propagate_depth(&mut self, start: NodeId) -> Result<(), NodeError> {
        let mut pending = vec![start];
        while let Some(id) = pending.pop() {
            let required = self.required_depth(id);
            let entry = self.entry_mut(id)?;
            if required > entry.depth {
                entry.depth = required;
                pending.extend(entry.outputs.iter().copied());
            }
        }
        Ok(())
    }

    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![from];
        while let Some(id) = pending.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                if let Some(entry) = self.nodes.get(&id) {
                    pending.extend(entry.outputs.iter().copied());
                }
            }
        }
        false
    }

    /// Depth-first walk from `start`.
    ///
    /// Predecessors are visited before the node itself, successors afterwards in ascending
    /// depth, only descending into those exactly one level deeper. Each node is visited once.
    pub fn walk<R>(
        &mut self,
        start: NodeId,
        flatten: bool,
        mut visitor: impl FnMut(NodeId, &mut T) -> R,
    ) -> Result<Walk<R>, NodeError> {
        self.entry(start)?;
        let mut results = Vec::new();
        let mut touched = Vec::new();
        self.walk_from(start, &mut visitor, &mut results, &mut touched);
        for id in touched {
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.visited = false;
            }
        }
        Ok(if flatten {
            Walk::Flat(results.into_iter().map(|(_, r)| r).collect())
        } else {
            let mut groups: BTreeMap<usize, Vec<R>> = BTreeMap::new();
            for (depth, r) in results {
                groups.entry(depth).or_default().push(r);
            }
            Walk::ByDepth(groups)
        })
    }

    fn walk_from<R>(
        &mut self,
        id: NodeId,
        visitor: &mut impl FnMut(NodeId, &mut T) -> R,
        results: &mut Vec<(usize, R)>,
        touched: &mut Vec<NodeId>,
    ) {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return;
        };
        if entry.visited {
            return;
        }
        entry.visited = true;
        touched.push(id);
        let inputs = entry.inputs.clone();
        for input in inputs {
            self.walk_from(input, visitor, results, touched);
        }
        let Some(entry) = self.nodes.get_mut(&id) else {
            return;
        };
        let depth = entry.depth;
        results.push((depth, visitor(id, &mut entry.payload)));
        let mut outputs = entry.outputs.clone();
        outputs.sort_by_key(|output| self.nodes[output].depth);
        for output in outputs {
            if self.nodes[&output].depth == depth + 1 {
                self.walk_from(output, visitor, results, touched);
            }
        }
    }

    /// `node` and all of its transitive predecessors, ordered by depth.
    pub fn ancestors(&self, node: NodeId) -> Result<Vec<NodeId>, NodeError> {
        self.entry(node)?;
        let mut seen = HashSet::new();
        let mut pending = vec![node];
        while let Some(id) = pending.pop() {
            if seen.insert(id) {
                pending.extend(self.nodes[&id].inputs.iter().copied());
            }
        }
        let mut result: Vec<_> = seen.into_iter().collect();
        result.sort_by_key(|id| (self.nodes[id].depth, *id));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_depths<T>(graph: &DependencyGraph<T>) {
        for id in graph.node_ids() {
            let entry = graph.entry(id).unwrap();
            for input in entry.inputs() {
                assert!(entry.depth() >= graph.depth(*input).unwrap() + 1);
                assert!(graph.outputs(*input).unwrap().contains(&id));
            }
            for output in entry.outputs() {
                assert!(graph.inputs(*output).unwrap().contains(&id));
            }
        }
    }

    #[test]
    fn test_diamond_walk_visits_once() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        let d = graph.add_node("d");
        graph.add_input(b, a).unwrap();
        graph.add_input(c, a).unwrap();
        graph.add_input(d, b).unwrap();
        graph.add_input(d, c).unwrap();
        assert_eq!(graph.depth(d).unwrap(), 2);

        let mut seen = Vec::new();
        let walk = graph
            .walk(d, true, |id, name| {
                seen.push(id);
                *name
            })
            .unwrap();
        assert_eq!(seen.iter().filter(|x| **x == a).count(), 1);
        // `c` is reached from `a` as a depth-1 successor before the walk unwinds to `b`.
        assert_eq!(walk.into_vec(), vec!["a", "c", "b", "d"]);

        // Flags are cleared, a second walk sees everything again.
        let Walk::ByDepth(groups) = graph.walk(d, false, |_, name| *name).unwrap() else {
            panic!("expected grouped walk");
        };
        assert_eq!(groups[&0], vec!["a"]);
        assert_eq!(groups[&1], vec!["c", "b"]);
        assert_eq!(groups[&2], vec!["d"]);
    }

    #[test]
    fn test_depth_propagates_and_never_shrinks() {
        let mut graph = DependencyGraph::new();
        let ids: Vec<_> = (0..5).map(|i| graph.add_node(i)).collect();
        graph.add_input(ids[1], ids[0]).unwrap();
        graph.add_input(ids[2], ids[1]).unwrap();
        graph.add_input(ids[4], ids[3]).unwrap();
        assert_eq!(graph.depth(ids[4]).unwrap(), 1);
        graph.add_input(ids[3], ids[2]).unwrap();
        assert_eq!(graph.depth(ids[3]).unwrap(), 3);
        assert_eq!(graph.depth(ids[4]).unwrap(), 4);
        check_depths(&graph);

        graph.remove_input(ids[3], ids[2]).unwrap();
        assert_eq!(graph.depth(ids[3]).unwrap(), 3);
        check_depths(&graph);

        graph.clear(ids[3]).unwrap();
        assert_eq!(graph.depth(ids[3]).unwrap(), 0);
        assert!(graph.outputs(ids[2]).unwrap().is_empty());
        check_depths(&graph);
    }

    #[test]
    fn test_duplicate_edges_and_cycles() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(());
        let b = graph.add_node(());
        graph.add_input(b, a).unwrap();
        graph.add_input(b, a).unwrap();
        assert_eq!(graph.inputs(b).unwrap(), &[a]);
        assert_eq!(graph.outputs(a).unwrap(), &[b]);
        assert!(matches!(
            graph.add_input(a, b),
            Err(NodeError::CycleDetected { .. })
        ));
        assert!(matches!(
            graph.add_input(a, a),
            Err(NodeError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_remove_node_detaches() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(1);
        let b = graph.add_node(2);
        let c = graph.add_node(3);
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        assert_eq!(graph.remove_node(b).unwrap(), 2);
        assert!(graph.outputs(a).unwrap().is_empty());
        assert!(graph.inputs(c).unwrap().is_empty());
        assert_eq!(graph.ancestors(c).unwrap(), vec![c]);
        assert!(graph.get(b).is_err());
    }
}
