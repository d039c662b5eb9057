//! Decides whether a node needs the value of an input, not just its shape.
//!
//! Three sources can declare a value dependency:
//! 1. The operator's registered bundle (authoritative).
//! 2. The node's legacy `infer_depends` list of IR input names.
//! 3. For fused nodes, the preserved original subgraph: an input is needed if
//!    its `Data` placeholder feeds an input that is needed by the consumer
//!    inside the subgraph.
//!
//! A fused node's subgraph metadata is validated before any answer is given.
//! A missing registry or an unregistered op type is not an error; it falls
//! through to the next source.

use crate::op_impl::OpImplFunctions;
use crate::space_registry::{DefaultSpaceRegistry, OpImplHandle, SpaceRegistry};
use crate::{Error, Result};
use std::sync::Arc;
use tessera_core::ir::DATA_OP_TYPE;
use tessera_core::{IrGraph, IrNode, IrNodeId};

/// Which source decided a dependency question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencySource {
    /// The registered bundle declares the dependency.
    Registry,
    /// The node's legacy `infer_depends` list names the input.
    Legacy,
    /// The fused node's original subgraph needs the value.
    Subgraph,
    /// No source declares a dependency.
    None,
}

impl DependencySource {
    pub fn is_dependent(self) -> bool {
        !matches!(self, DependencySource::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    InferShape,
    Tiling,
}

impl Query {
    fn registered(self, funcs: &OpImplFunctions, ir_index: usize) -> bool {
        match self {
            Query::InferShape => funcs.is_input_data_dependency(ir_index),
            Query::Tiling => funcs.is_tiling_input_data_dependency(ir_index),
        }
    }
}

/// Answers value-dependency questions for one graph node.
pub struct DataDependentInterpreter<'a> {
    graph: &'a IrGraph,
    node_id: IrNodeId,
    registry: Option<Arc<SpaceRegistry>>,
}

impl<'a> DataDependentInterpreter<'a> {
    /// Interpret `node_id` in `graph`. Without an explicit registry the
    /// default space registry is used, if one is set.
    pub fn new(graph: &'a IrGraph, node_id: IrNodeId, registry: Option<Arc<SpaceRegistry>>) -> Self {
        Self {
            graph,
            node_id,
            registry: registry.or_else(DefaultSpaceRegistry::get),
        }
    }

    /// Whether shape inference needs the value of IR input `ir_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is missing from the graph or its fused
    /// subgraph metadata is malformed.
    pub fn is_data_dependent(&self, ir_index: usize) -> Result<bool> {
        Ok(self.resolve(ir_index)?.is_dependent())
    }

    /// Whether tiling needs the value of IR input `ir_index`.
    ///
    /// Only registrations declare tiling dependencies; there is no legacy
    /// fallback.
    pub fn is_tiling_input_data_dependent(&self, ir_index: usize) -> Result<bool> {
        Ok(self.resolve_tiling(ir_index)?.is_dependent())
    }

    /// Which source, if any, makes IR input `ir_index` value-dependent for
    /// shape inference.
    pub fn resolve(&self, ir_index: usize) -> Result<DependencySource> {
        self.resolve_query(ir_index, Query::InferShape)
    }

    /// Which source, if any, makes IR input `ir_index` value-dependent for
    /// tiling.
    pub fn resolve_tiling(&self, ir_index: usize) -> Result<DependencySource> {
        self.resolve_query(ir_index, Query::Tiling)
    }

    fn resolve_query(&self, ir_index: usize, query: Query) -> Result<DependencySource> {
        let node = self.graph.node(self.node_id)?;
        let from_subgraph = match node.fused_subgraph() {
            Some(subgraph) => Some(self.subgraph_dependency(node, subgraph, ir_index, query)?),
            None => None,
        };
        let op_impl = self.op_impl(node);

        if let Some(funcs) = &op_impl {
            if query.registered(funcs, ir_index) {
                if from_subgraph == Some(false) {
                    tracing::warn!(
                        node = %node.name,
                        op_type = %node.op_type,
                        ir_index,
                        "registered as value-dependent, but the fused subgraph does not need the value"
                    );
                }
                return Ok(DependencySource::Registry);
            }
        }

        if query == Query::InferShape && legacy_depends(node, ir_index) {
            if op_impl.is_some() {
                tracing::warn!(
                    node = %node.name,
                    op_type = %node.op_type,
                    ir_index,
                    "value dependency declared only by legacy infer_depends"
                );
            } else {
                tracing::debug!(node = %node.name, ir_index, "unregistered op, using legacy infer_depends");
            }
            return Ok(DependencySource::Legacy);
        }

        if from_subgraph == Some(true) {
            if op_impl.is_some() {
                tracing::warn!(
                    node = %node.name,
                    op_type = %node.op_type,
                    ir_index,
                    "fused subgraph needs the value, but the registration does not declare it"
                );
            }
            return Ok(DependencySource::Subgraph);
        }

        Ok(DependencySource::None)
    }

    fn op_impl(&self, node: &IrNode) -> Option<OpImplHandle> {
        let Some(registry) = &self.registry else {
            tracing::trace!(op_type = %node.op_type, "no space registry");
            return None;
        };
        registry.get_op_impl(&node.op_type)
    }

    fn subgraph_dependency(
        &self,
        node: &IrNode,
        subgraph: &IrGraph,
        ir_index: usize,
        query: Query,
    ) -> Result<bool> {
        let data_nodes = validate_subgraph(node, subgraph)?;
        let Some(&(data_id, _)) = data_nodes.iter().find(|&&(_, parent)| parent == ir_index) else {
            return Ok(false);
        };

        for &output in subgraph.node(data_id)?.outputs() {
            for (consumer_id, flat) in subgraph.edge_consumer_inputs(output) {
                let consumer = subgraph.node(consumer_id)?;
                let Some(consumer_index) = consumer.ir_index_of_input(flat) else {
                    continue;
                };
                let inner = DataDependentInterpreter {
                    graph: subgraph,
                    node_id: consumer_id,
                    registry: self.registry.clone(),
                };
                if inner.resolve_query(consumer_index, query)?.is_dependent() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn legacy_depends(node: &IrNode, ir_index: usize) -> bool {
    node.ir_input_name(ir_index)
        .is_some_and(|name| node.infer_depends.iter().any(|depend| *depend == name))
}

/// Check that the subgraph's `Data` nodes map one-to-one onto the fused
/// node's IR inputs and return them with their parent indices.
fn validate_subgraph(node: &IrNode, subgraph: &IrGraph) -> Result<Vec<(IrNodeId, usize)>> {
    let expected = node.ir_input_num();
    let mismatch = |reason: String| Error::ParentIndexMismatch {
        node: node.name.clone(),
        reason,
    };

    let mut seen = vec![false; expected];
    let mut data_nodes = Vec::with_capacity(expected);
    for (id, data) in subgraph.nodes_of_type(DATA_OP_TYPE) {
        let parent = data.parent_index().ok_or_else(|| Error::MissingParentIndex {
            node: node.name.clone(),
            data: data.name.clone(),
        })?;
        match seen.get_mut(parent) {
            None => {
                return Err(mismatch(format!(
                    "Data node '{}' has parent index {}, but the node has {} inputs",
                    data.name, parent, expected
                )));
            }
            Some(true) => {
                return Err(mismatch(format!(
                    "parent index {} is used by more than one Data node",
                    parent
                )));
            }
            Some(slot) => *slot = true,
        }
        data_nodes.push((id, parent));
    }

    if data_nodes.len() != expected {
        return Err(mismatch(format!(
            "fused subgraph has {} Data nodes for {} inputs",
            data_nodes.len(),
            expected
        )));
    }
    Ok(data_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::OpImplRegistryHolder;
    use crate::register::OpImplRegister;
    use crate::registry::OpImplRegistry;
    use tessera_core::{DataType, IrEdge, IrPort, StorageShape};

    fn space(build: impl FnOnce(&OpImplRegistry)) -> Arc<SpaceRegistry> {
        let registry = OpImplRegistry::new();
        build(&registry);
        let space = SpaceRegistry::new();
        space.add_registry(Arc::new(OpImplRegistryHolder::from_registry(&registry)));
        Arc::new(space)
    }

    /// One node of `op_type` reading inputs x, y, z.
    fn three_input_graph(op_type: &str) -> (IrGraph, IrNodeId) {
        let mut graph = IrGraph::new();
        let mut node = IrNode::named("n0", op_type);
        node.ir_inputs = vec![
            IrPort::required("x"),
            IrPort::required("y"),
            IrPort::required("z"),
        ];
        for name in ["x", "y", "z"] {
            let edge = graph.add_edge(IrEdge::new(name, DataType::F32, StorageShape::uniform(vec![2])));
            node.add_input(edge);
        }
        let id = graph.add_node(node);
        (graph, id)
    }

    #[test]
    fn test_unregistered_without_legacy_is_false() {
        let (graph, id) = three_input_graph("Unknown");
        let ddi = DataDependentInterpreter::new(&graph, id, Some(space(|_| {})));
        assert!(!ddi.is_data_dependent(0).unwrap());
        assert!(!ddi.is_tiling_input_data_dependent(0).unwrap());
    }

    #[test]
    fn test_legacy_index_reported_when_unregistered() {
        let (mut graph, id) = three_input_graph("Unknown");
        graph.node_mut(id).unwrap().set_infer_depends(["z"]);
        let ddi = DataDependentInterpreter::new(&graph, id, Some(space(|_| {})));
        assert_eq!(ddi.resolve(2).unwrap(), DependencySource::Legacy);
        assert_eq!(ddi.resolve(1).unwrap(), DependencySource::None);
        // Tiling has no legacy path.
        assert!(!ddi.is_tiling_input_data_dependent(2).unwrap());
    }

    #[test]
    fn test_registry_then_legacy() {
        let (mut graph, id) = three_input_graph("Ddit02");
        graph.node_mut(id).unwrap().set_infer_depends(["y"]);
        let registry = space(|r| {
            OpImplRegister::new("Ddit02")
                .inputs_data_dependency(&[0, 2])
                .register_into(r)
        });
        let ddi = DataDependentInterpreter::new(&graph, id, Some(registry));

        assert_eq!(ddi.resolve(0).unwrap(), DependencySource::Registry);
        assert_eq!(ddi.resolve(1).unwrap(), DependencySource::Legacy);
        assert_eq!(ddi.resolve(2).unwrap(), DependencySource::Registry);
        assert_eq!(ddi.resolve(3).unwrap(), DependencySource::None);
    }

    #[test]
    fn test_tiling_uses_tiling_mask() {
        let (graph, id) = three_input_graph("Ddit3");
        let registry = space(|r| {
            OpImplRegister::new("Ddit3")
                .tiling_inputs_data_dependency(&[1, 2])
                .register_into(r)
        });
        let ddi = DataDependentInterpreter::new(&graph, id, Some(registry));

        assert!(!ddi.is_tiling_input_data_dependent(0).unwrap());
        assert!(ddi.is_tiling_input_data_dependent(1).unwrap());
        assert!(ddi.is_tiling_input_data_dependent(2).unwrap());
        assert!(!ddi.is_data_dependent(1).unwrap());
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let (graph, _) = three_input_graph("Any");
        let ddi = DataDependentInterpreter::new(&graph, IrNodeId::new(42), Some(space(|_| {})));
        assert!(matches!(ddi.resolve(0), Err(Error::Core(_))));
    }

    #[test]
    fn test_validate_subgraph_duplicate_parent() {
        let (graph, id) = three_input_graph("Fused");
        let node = graph.node(id).unwrap();

        let mut subgraph = IrGraph::new();
        for (name, parent) in [("d0", 0), ("d1", 1), ("d2", 1)] {
            let mut data = IrNode::named(name, DATA_OP_TYPE);
            data.set_parent_index(parent);
            subgraph.add_node(data);
        }
        let result = validate_subgraph(node, &subgraph);
        assert!(matches!(result, Err(Error::ParentIndexMismatch { .. })));
    }

    #[test]
    fn test_validate_subgraph_out_of_range_parent() {
        let (graph, id) = three_input_graph("Fused");
        let node = graph.node(id).unwrap();

        let mut subgraph = IrGraph::new();
        for (name, parent) in [("d0", 0), ("d1", 1), ("d2", 3)] {
            let mut data = IrNode::named(name, DATA_OP_TYPE);
            data.set_parent_index(parent);
            subgraph.add_node(data);
        }
        let result = validate_subgraph(node, &subgraph);
        assert!(matches!(result, Err(Error::ParentIndexMismatch { .. })));
    }
}
