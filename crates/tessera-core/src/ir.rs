//! Graph IR consumed by the registry and context machinery.
//!
//! The IR is a directed graph where:
//! - **Nodes** (`IrNode`) are operator instances (e.g. Add, MatMul, or a fused
//!   black-box node carrying its original subgraph)
//! - **Edges** (`IrEdge`) are tensor value flows between nodes
//!
//! Besides the flattened input list, a node keeps its IR prototype: the named
//! IR inputs and how many concrete instances each one expanded to. That table
//! is what kernel contexts are sized from.

use crate::types::{DataType, StorageFormat, StorageShape, TensorData};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;

use std::collections::HashMap;
use std::sync::Arc;

/// Type alias for IR node identifiers (backed by petgraph NodeIndex).
pub type IrNodeId = NodeIndex;

/// Op type of the placeholder nodes that stand for a subgraph's inputs.
pub const DATA_OP_TYPE: &str = "Data";

/// Attribute holding the original subgraph of a fused node.
pub const FUSED_GRAPH_ATTR: &str = "_original_fusion_graph";

/// Attribute on a `Data` node naming the parent node input it stands for.
pub const PARENT_INDEX_ATTR: &str = "_parent_node_index";

/// Unique identifier for an edge (tensor flow) in the IR graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrEdgeId(pub usize);

impl IrEdgeId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

// ─────────────────────────────── AttrValue ───────────────────────────────

/// A node or private attribute value.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    /// A nested graph, e.g. the original subgraph of a fused node.
    Graph(Arc<IrGraph>),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&IrGraph> {
        match self {
            AttrValue::Graph(g) => Some(g),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl PartialEq for AttrValue {
    /// Nested graphs are equal only when they are the same shared graph.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Int(a), AttrValue::Int(b)) => a == b,
            (AttrValue::Float(a), AttrValue::Float(b)) => a == b,
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a == b,
            (AttrValue::String(a), AttrValue::String(b)) => a == b,
            (AttrValue::Ints(a), AttrValue::Ints(b)) => a == b,
            (AttrValue::Floats(a), AttrValue::Floats(b)) => a == b,
            (AttrValue::Strings(a), AttrValue::Strings(b)) => a == b,
            (AttrValue::Graph(a), AttrValue::Graph(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ──────────────────────────────── IrGraph ────────────────────────────────

/// Intermediate representation graph.
///
/// Nodes are operators; edges are tensor value flows stored in a side-table.
#[derive(Debug, Clone)]
pub struct IrGraph {
    /// The graph structure (nodes only, no edge data).
    graph: StableGraph<IrNode, ()>,

    /// Edge metadata side-table.
    edges: Vec<IrEdge>,

    /// Lookup table: edge ID -> producing node ID.
    edge_producer: HashMap<IrEdgeId, IrNodeId>,

    /// Lookup table: edge ID -> consuming node IDs.
    edge_consumers: HashMap<IrEdgeId, Vec<IrNodeId>>,

    /// Graph name.
    pub name: String,
}

impl IrGraph {
    /// Create a new empty IR graph.
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            edges: Vec::new(),
            edge_producer: HashMap::new(),
            edge_consumers: HashMap::new(),
            name: String::new(),
        }
    }

    // ── Node access ──

    /// Get an immutable reference to a node.
    pub fn node(&self, id: IrNodeId) -> Result<&IrNode> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: IrNodeId) -> Result<&mut IrNode> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Iterate over all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = (IrNodeId, &IrNode)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|node| (id, node)))
    }

    /// Iterate over the nodes of a given op type.
    pub fn nodes_of_type<'a>(
        &'a self,
        op_type: &'a str,
    ) -> impl Iterator<Item = (IrNodeId, &'a IrNode)> + 'a {
        self.nodes().filter(move |(_, node)| node.op_type == op_type)
    }

    // ── Edge access ──

    /// Get an immutable reference to an edge.
    pub fn edge(&self, id: IrEdgeId) -> Result<&IrEdge> {
        self.edges
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Edge {:?} not found", id)))
    }

    /// Get the node that produces an edge, if any.
    pub fn edge_producer(&self, id: IrEdgeId) -> Option<IrNodeId> {
        self.edge_producer.get(&id).copied()
    }

    /// Get every `(consumer, flat input position)` pair reading an edge.
    ///
    /// A node that reads the same edge twice appears once per position.
    pub fn edge_consumer_inputs(&self, id: IrEdgeId) -> Vec<(IrNodeId, usize)> {
        let mut result = Vec::new();
        let Some(consumers) = self.edge_consumers.get(&id) else {
            return result;
        };
        for &consumer in consumers {
            if result.iter().any(|&(seen, _)| seen == consumer) {
                continue;
            }
            if let Some(node) = self.graph.node_weight(consumer) {
                for (position, &input) in node.inputs.iter().enumerate() {
                    if input == id {
                        result.push((consumer, position));
                    }
                }
            }
        }
        result
    }

    // ── Graph mutation ──

    /// Add a new node to the graph and return its ID.
    ///
    /// This also updates the producer/consumer lookup tables.
    pub fn add_node(&mut self, mut node: IrNode) -> IrNodeId {
        let node_id = self.graph.add_node(IrNode::new(String::new()));
        node.node_index = node_id;

        for &output_id in &node.outputs {
            self.edge_producer.insert(output_id, node_id);
        }

        for &input_id in &node.inputs {
            self.edge_consumers
                .entry(input_id)
                .or_default()
                .push(node_id);
        }

        if let Some(slot) = self.graph.node_weight_mut(node_id) {
            *slot = node;
        }

        node_id
    }

    /// Add an edge (tensor) to the graph and return its ID.
    pub fn add_edge(&mut self, edge: IrEdge) -> IrEdgeId {
        let id = IrEdgeId::new(self.edges.len());
        self.edges.push(edge);
        id
    }

    // ── Graph queries ──

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Find a node by its name.
    ///
    /// # Errors
    ///
    /// Returns an error if no node with the given name exists.
    pub fn find_node_by_name(&self, name: &str) -> Result<IrNodeId> {
        self.nodes()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node '{}' not found", name)))
    }
}

impl Default for IrGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────── IrNode ─────────────────────────────────

/// How an IR input or output expands into concrete instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrPortKind {
    /// Exactly one instance.
    Required,
    /// Zero or one instance.
    Optional,
    /// Any number of instances (variadic).
    Dynamic,
}

/// One named position in an operator's prototype, with the number of
/// concrete instances it expanded to on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrPort {
    pub name: String,
    pub kind: IrPortKind,
    pub instance_num: usize,
}

impl IrPort {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IrPortKind::Required,
            instance_num: 1,
        }
    }

    pub fn optional(name: impl Into<String>, present: bool) -> Self {
        Self {
            name: name.into(),
            kind: IrPortKind::Optional,
            instance_num: usize::from(present),
        }
    }

    pub fn dynamic(name: impl Into<String>, instance_num: usize) -> Self {
        Self {
            name: name.into(),
            kind: IrPortKind::Dynamic,
            instance_num,
        }
    }
}

/// A node in the IR graph.
#[derive(Debug, Clone)]
pub struct IrNode {
    /// Node name (may be empty).
    pub name: String,

    /// Operator type (e.g., "Add", "MatMul").
    pub op_type: String,

    /// Operator attributes.
    pub attributes: HashMap<String, AttrValue>,

    /// Flattened input edge IDs.
    pub inputs: Vec<IrEdgeId>,

    /// Flattened output edge IDs.
    pub outputs: Vec<IrEdgeId>,

    /// IR input prototype. When empty, every flat input is its own
    /// required IR input.
    pub ir_inputs: Vec<IrPort>,

    /// IR output prototype. When empty, every flat output is its own
    /// required IR output.
    pub ir_outputs: Vec<IrPort>,

    /// Names of IR inputs this node's author declared value-dependent,
    /// from before implementations declared it themselves.
    pub infer_depends: Vec<String>,

    /// The graph node index.
    pub node_index: IrNodeId,
}

impl IrNode {
    /// Create a new operator node.
    pub fn new(op_type: String) -> Self {
        Self {
            name: String::new(),
            op_type,
            attributes: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            ir_inputs: Vec::new(),
            ir_outputs: Vec::new(),
            infer_depends: Vec::new(),
            node_index: NodeIndex::default(),
        }
    }

    /// Create a named node.
    pub fn named(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        let mut node = Self::new(op_type.into());
        node.name = name.into();
        node
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[IrEdgeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IrEdgeId] {
        &self.outputs
    }

    pub fn add_input(&mut self, edge_id: IrEdgeId) {
        self.inputs.push(edge_id);
    }

    pub fn add_output(&mut self, edge_id: IrEdgeId) {
        self.outputs.push(edge_id);
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttrValue) {
        self.attributes.insert(key.into(), value);
    }

    pub fn get_attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    // ── IR prototype ──

    /// The IR input prototype, synthesizing one required port per flat
    /// input when none was declared.
    pub fn ir_input_ports(&self) -> Vec<IrPort> {
        Self::ports_or_flat(&self.ir_inputs, self.inputs.len(), "input")
    }

    /// The IR output prototype, synthesizing one required port per flat
    /// output when none was declared.
    pub fn ir_output_ports(&self) -> Vec<IrPort> {
        Self::ports_or_flat(&self.ir_outputs, self.outputs.len(), "output")
    }

    fn ports_or_flat(declared: &[IrPort], flat: usize, prefix: &str) -> Vec<IrPort> {
        if declared.is_empty() {
            (0..flat)
                .map(|i| IrPort::required(format!("{}{}", prefix, i)))
                .collect()
        } else {
            declared.to_vec()
        }
    }

    /// Number of IR inputs.
    pub fn ir_input_num(&self) -> usize {
        if self.ir_inputs.is_empty() {
            self.inputs.len()
        } else {
            self.ir_inputs.len()
        }
    }

    /// Name of an IR input.
    pub fn ir_input_name(&self, ir_index: usize) -> Option<String> {
        if self.ir_inputs.is_empty() {
            (ir_index < self.inputs.len()).then(|| format!("input{}", ir_index))
        } else {
            self.ir_inputs.get(ir_index).map(|port| port.name.clone())
        }
    }

    /// Map a flattened input position back to the IR input it instantiates.
    pub fn ir_index_of_input(&self, flat: usize) -> Option<usize> {
        if self.ir_inputs.is_empty() {
            return (flat < self.inputs.len()).then_some(flat);
        }
        let mut start = 0;
        for (ir_index, port) in self.ir_inputs.iter().enumerate() {
            if flat < start + port.instance_num {
                return Some(ir_index);
            }
            start += port.instance_num;
        }
        None
    }

    // ── Legacy and fusion metadata ──

    /// Declare value-dependent inputs by IR input name.
    pub fn set_infer_depends<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.infer_depends = names.into_iter().map(Into::into).collect();
    }

    /// The original subgraph of a fused node, if preserved.
    pub fn fused_subgraph(&self) -> Option<&IrGraph> {
        self.get_attribute(FUSED_GRAPH_ATTR)
            .and_then(AttrValue::as_graph)
    }

    /// Attach the original subgraph of a fused node.
    pub fn set_fused_subgraph(&mut self, graph: IrGraph) {
        self.set_attribute(FUSED_GRAPH_ATTR, AttrValue::Graph(Arc::new(graph)));
    }

    /// The parent input index of a subgraph `Data` node.
    ///
    /// Returns `None` when the attribute is absent, negative or not an int.
    pub fn parent_index(&self) -> Option<usize> {
        self.get_attribute(PARENT_INDEX_ATTR)
            .and_then(AttrValue::as_int)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn set_parent_index(&mut self, index: usize) {
        self.set_attribute(PARENT_INDEX_ATTR, AttrValue::Int(index as i64));
    }
}

// ──────────────────────────────── EdgeData ───────────────────────────────

/// What compile-time data an edge carries.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeData {
    /// No compile-time data; the value arrives at runtime.
    Runtime,

    /// A value computed ahead of time (a weight or a folded constant).
    Constant(TensorData),
}

// ──────────────────────────────── IrEdge ─────────────────────────────────

/// An edge (tensor value flow) in the IR graph.
#[derive(Debug, Clone)]
pub struct IrEdge {
    /// Tensor name (must be unique within the graph).
    pub name: String,

    pub dtype: DataType,

    pub shape: StorageShape,

    pub format: StorageFormat,

    /// Compile-time data carried by this edge.
    pub data: EdgeData,
}

impl IrEdge {
    /// Create a new runtime edge (no compile-time data).
    pub fn new(name: impl Into<String>, dtype: DataType, shape: StorageShape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            format: StorageFormat::default(),
            data: EdgeData::Runtime,
        }
    }

    /// Create a new edge with a known constant value.
    pub fn with_constant(name: impl Into<String>, shape: StorageShape, value: TensorData) -> Self {
        Self {
            name: name.into(),
            dtype: value.dtype(),
            shape,
            format: StorageFormat::default(),
            data: EdgeData::Constant(value),
        }
    }

    pub fn constant_value(&self) -> Option<&TensorData> {
        match &self.data {
            EdgeData::Constant(value) => Some(value),
            EdgeData::Runtime => None,
        }
    }
}
