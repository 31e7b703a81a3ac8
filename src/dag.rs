use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use thiserror::Error;

/// Something that can sit in a [`Dag`]: it knows its own id and the ids of the
/// nodes it depends on (its "children" in dependency-graph terms, i.e. the
/// things that must be processed before it).
pub trait GraphNode {
    type NodeId: Eq + Hash + Clone;

    fn id(&self) -> impl Borrow<Self::NodeId>;
    fn child_ids(&self) -> Vec<impl Borrow<Self::NodeId>>;
}

#[derive(Error, Debug)]
pub enum DagError<Id: std::fmt::Debug> {
    #[error("duplicate node id {0:?}")]
    DuplicateId(Id),
    #[error("node {parent:?} depends on unknown node {child:?}")]
    UnknownChild { parent: Id, child: Id },
    #[error("dependency cycle detected, involving node {0:?}")]
    Cycle(Id),
}

/// A directed acyclic graph of nodes, keyed by [`GraphNode::id`]. Used both for
/// limmat's original test-dependency graphs and, in this project, for a Group's
/// `depends_on` set.
///
/// Construction validates acyclicity up front (Kahn's algorithm) so that every
/// other method can assume the graph is a valid DAG.
#[derive(Debug, Clone)]
pub struct Dag<T: GraphNode> {
    nodes: HashMap<T::NodeId, T>,
    // Preserves insertion order, for deterministic iteration where ties need
    // breaking by something other than the DAG structure itself.
    order: Vec<T::NodeId>,
}

impl<T: GraphNode> Dag<T>
where
    T::NodeId: std::fmt::Debug,
{
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Build a DAG from a flat collection of nodes, validating that every
    /// referenced child exists and that there are no cycles.
    pub fn new(items: impl IntoIterator<Item = T>) -> Result<Self, DagError<T::NodeId>> {
        let mut zelf = Self::empty();
        for item in items {
            let id = item.id().borrow().clone();
            if zelf.nodes.contains_key(&id) {
                return Err(DagError::DuplicateId(id));
            }
            zelf.order.push(id.clone());
            zelf.nodes.insert(id, item);
        }

        for node in zelf.nodes.values() {
            let parent_id = node.id().borrow().clone();
            for child in node.child_ids() {
                let child_id = child.borrow();
                if !zelf.nodes.contains_key(child_id) {
                    return Err(DagError::UnknownChild {
                        parent: parent_id,
                        child: child_id.clone(),
                    });
                }
            }
        }

        zelf.check_acyclic()?;
        Ok(zelf)
    }

    /// Insert a new node whose children must already be present. Returns `None`
    /// if any child id is missing from the DAG so far, so callers building a DAG
    /// incrementally (e.g. folding over another DAG in dependency order) get a
    /// clear signal rather than a silently dangling edge.
    pub fn with_node(mut self, node: T) -> Option<Self> {
        for child in node.child_ids() {
            if !self.nodes.contains_key(child.borrow()) {
                return None;
            }
        }
        let id = node.id().borrow().clone();
        if self.nodes.contains_key(&id) {
            return None;
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        Some(self)
    }

    pub fn node(&self, id: &T::NodeId) -> Option<&T> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in dependency order: a node's children (dependencies) are
    /// always yielded before the node itself.
    pub fn bottom_up(&self) -> impl Iterator<Item = &T> {
        self.layers().into_iter().flatten()
    }

    /// Partition the DAG into topological layers: layer 0 contains all nodes
    /// with no dependencies, layer 1 contains nodes whose dependencies are all
    /// in layer 0 (or earlier), and so on. Nodes within one layer are
    /// independent of each other and may be processed in any order (including
    /// concurrently); across layers, earlier layers must complete first.
    ///
    /// Within a layer, nodes are ordered by their original insertion order.
    pub fn layers(&self) -> Vec<Vec<&T>> {
        let mut remaining: HashSet<T::NodeId> = self.nodes.keys().cloned().collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let mut layer_ids = Vec::new();
            for id in &self.order {
                if !remaining.contains(id) {
                    continue;
                }
                let node = &self.nodes[id];
                let ready = node
                    .child_ids()
                    .iter()
                    .all(|child| !remaining.contains(child.borrow()));
                if ready {
                    layer_ids.push(id.clone());
                }
            }
            // check_acyclic at construction time guarantees this can't happen,
            // but guard against it anyway rather than looping forever.
            assert!(
                !layer_ids.is_empty(),
                "cycle survived DAG construction - this is a bug"
            );
            for id in &layer_ids {
                remaining.remove(id);
            }
            layers.push(layer_ids.into_iter().map(|id| &self.nodes[&id]).collect());
        }

        layers
    }

    fn check_acyclic(&self) -> Result<(), DagError<T::NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<T::NodeId, Mark> = HashMap::new();

        fn visit<T: GraphNode>(
            id: &T::NodeId,
            nodes: &HashMap<T::NodeId, T>,
            marks: &mut HashMap<T::NodeId, Mark>,
        ) -> Result<(), DagError<T::NodeId>>
        where
            T::NodeId: std::fmt::Debug,
        {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(DagError::Cycle(id.clone())),
                None => {}
            }
            marks.insert(id.clone(), Mark::Visiting);
            for child in nodes[id].child_ids() {
                visit::<T>(child.borrow(), nodes, marks)?;
            }
            marks.insert(id.clone(), Mark::Done);
            Ok(())
        }

        for id in self.nodes.keys() {
            visit::<T>(id, &self.nodes, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone)]
    struct N {
        id: String,
        deps: Vec<String>,
    }

    impl GraphNode for N {
        type NodeId = String;

        fn id(&self) -> impl Borrow<String> {
            &self.id
        }

        fn child_ids(&self) -> Vec<impl Borrow<String>> {
            self.deps.iter().collect()
        }
    }

    fn n(id: &str, deps: &[&str]) -> N {
        N {
            id: id.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn layers_respect_dependencies() {
        let dag = Dag::new([n("a", &[]), n("b", &["a"]), n("c", &["a", "b"])]).unwrap();
        let layers: Vec<Vec<String>> = dag
            .layers()
            .into_iter()
            .map(|l| l.into_iter().map(|n| n.id.clone()).collect())
            .collect();
        assert_eq!(layers, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn independent_nodes_share_a_layer() {
        let dag = Dag::new([n("a", &[]), n("b", &[])]).unwrap();
        assert_eq!(dag.layers().len(), 1);
    }

    #[test]
    fn detects_cycle() {
        let result = Dag::new([n("a", &["b"]), n("b", &["a"])]);
        assert!(result.is_err());
    }

    #[test]
    fn detects_unknown_child() {
        let result = Dag::new([n("a", &["ghost"])]);
        assert!(matches!(result, Err(DagError::UnknownChild { .. })));
    }

    #[test]
    fn bottom_up_visits_dependencies_first() {
        let dag = Dag::new([n("a", &[]), n("b", &["a"])]).unwrap();
        let order: Vec<&str> = dag.bottom_up().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
