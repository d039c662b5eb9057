//! IR-level description of the node a kernel context was built for.
//!
//! A kernel context addresses its inputs by flat slot offset. `ComputeNodeInfo`
//! is the side table that maps IR input positions onto those offsets: each IR
//! input records where its instances start and how many there are, so an
//! uninstantiated optional input (zero instances) and an out-of-range dynamic
//! instance resolve the same way, to "absent".

use crate::ir::{AttrValue, IrGraph, IrNodeId};
use crate::types::{DataType, Format, StorageFormat};
use crate::{Error, Result};

/// Where the instances of one IR input or output sit in the flat slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnchorInstanceInfo {
    pub instance_start: usize,
    pub instance_num: usize,
}

impl AnchorInstanceInfo {
    pub fn new(instance_start: usize, instance_num: usize) -> Self {
        Self {
            instance_start,
            instance_num,
        }
    }

    /// Flat offset of instance `relative`, if it exists.
    pub fn offset(&self, relative: usize) -> Option<usize> {
        (relative < self.instance_num).then(|| self.instance_start + relative)
    }
}

/// Data type and format of one input or output, fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileTimeTensorDesc {
    pub data_type: DataType,
    pub format: StorageFormat,
}

impl CompileTimeTensorDesc {
    pub fn new(data_type: DataType, origin: Format, storage: Format) -> Self {
        Self {
            data_type,
            format: StorageFormat::new(origin, storage),
        }
    }
}

/// An attribute an implementation reads that is not part of the operator's
/// IR prototype, with the value used when a node does not set it.
#[derive(Debug, Clone, PartialEq)]
pub struct PrivateAttr {
    pub name: String,
    pub default: Option<AttrValue>,
}

impl PrivateAttr {
    pub fn new(name: impl Into<String>, default: Option<AttrValue>) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// Attribute values visible to a kernel: the node's IR attributes in order,
/// followed by the implementation's private attributes. A private attribute
/// without a default that the node does not set keeps its position but has
/// no value.
#[derive(Debug, Clone, Default)]
pub struct RuntimeAttrs {
    entries: Vec<(String, Option<AttrValue>)>,
}

impl RuntimeAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Option<AttrValue>) {
        self.entries.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attribute by position.
    pub fn get(&self, index: usize) -> Option<&AttrValue> {
        self.entries.get(index)?.1.as_ref()
    }

    /// Attribute by name.
    pub fn get_by_name(&self, name: &str) -> Option<&AttrValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)?
            .1
            .as_ref()
    }

    pub fn get_int(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(AttrValue::as_int)
    }

    pub fn get_float(&self, index: usize) -> Option<f32> {
        self.get(index).and_then(AttrValue::as_float)
    }

    pub fn get_bool(&self, index: usize) -> Option<bool> {
        self.get(index).and_then(AttrValue::as_bool)
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(AttrValue::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

/// IR-level shape of a node as seen from inside a kernel context.
#[derive(Debug, Clone, Default)]
pub struct ComputeNodeInfo {
    node_name: String,
    node_type: String,
    ir_inputs: Vec<AnchorInstanceInfo>,
    ir_outputs: Vec<AnchorInstanceInfo>,
    input_descs: Vec<CompileTimeTensorDesc>,
    output_descs: Vec<CompileTimeTensorDesc>,
    attrs: RuntimeAttrs,
}

impl ComputeNodeInfo {
    /// Start building a node description.
    pub fn builder() -> ComputeNodeInfoBuilder {
        ComputeNodeInfoBuilder::default()
    }

    /// Describe a graph node. `private_attrs` are appended after the node's
    /// own attributes; a node attribute of the same name overrides the
    /// private default.
    pub fn from_node(
        graph: &IrGraph,
        node_id: IrNodeId,
        private_attrs: &[PrivateAttr],
    ) -> Result<Self> {
        let node = graph.node(node_id)?;

        let mut builder = Self::builder()
            .node_name(node.name.clone())
            .node_type(node.op_type.clone())
            .ir_instance_num(
                &node
                    .ir_input_ports()
                    .iter()
                    .map(|port| port.instance_num)
                    .collect::<Vec<_>>(),
            )
            .ir_output_instance_num(
                &node
                    .ir_output_ports()
                    .iter()
                    .map(|port| port.instance_num)
                    .collect::<Vec<_>>(),
            )
            .node_io_num(node.inputs.len(), node.outputs.len());

        for (index, &edge_id) in node.inputs.iter().enumerate() {
            let edge = graph.edge(edge_id)?;
            builder = builder.input_td(index, edge.dtype, edge.format.origin, edge.format.storage);
        }
        for (index, &edge_id) in node.outputs.iter().enumerate() {
            let edge = graph.edge(edge_id)?;
            builder = builder.output_td(index, edge.dtype, edge.format.origin, edge.format.storage);
        }

        let mut names: Vec<&String> = node.attributes.keys().collect();
        names.sort();
        for name in names {
            if private_attrs.iter().any(|private| &private.name == name) {
                continue;
            }
            builder = builder.attr(name.clone(), node.attributes[name].clone());
        }
        for private in private_attrs {
            let value = node
                .attributes
                .get(&private.name)
                .or(private.default.as_ref())
                .cloned();
            builder.attrs.push(private.name.clone(), value);
        }

        builder.build()
    }

    /// A node with no inputs or outputs, identified only by its op type.
    pub fn for_op_type(op_type: impl Into<String>) -> Self {
        Self {
            node_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn ir_inputs_num(&self) -> usize {
        self.ir_inputs.len()
    }

    pub fn ir_outputs_num(&self) -> usize {
        self.ir_outputs.len()
    }

    /// Number of flattened inputs.
    pub fn inputs_num(&self) -> usize {
        self.input_descs.len()
    }

    /// Number of flattened outputs.
    pub fn outputs_num(&self) -> usize {
        self.output_descs.len()
    }

    pub fn input_instance_info(&self, ir_index: usize) -> Option<&AnchorInstanceInfo> {
        self.ir_inputs.get(ir_index)
    }

    /// Flat input offset of instance `relative` of IR input `ir_index`.
    pub fn input_offset(&self, ir_index: usize, relative: usize) -> Option<usize> {
        self.ir_inputs.get(ir_index)?.offset(relative)
    }

    /// The IR input a flat input position instantiates.
    pub fn ir_index_of_input(&self, flat: usize) -> Option<usize> {
        self.ir_inputs
            .iter()
            .position(|info| {
                flat >= info.instance_start && flat - info.instance_start < info.instance_num
            })
    }

    pub fn input_td(&self, index: usize) -> Option<&CompileTimeTensorDesc> {
        self.input_descs.get(index)
    }

    pub fn output_td(&self, index: usize) -> Option<&CompileTimeTensorDesc> {
        self.output_descs.get(index)
    }

    pub fn attrs(&self) -> &RuntimeAttrs {
        &self.attrs
    }
}

// ──────────────────────────── Builder ─────────────────────────────

/// Builder for [`ComputeNodeInfo`].
///
/// ```ignore
/// let info = ComputeNodeInfo::builder()
///     .ir_instance_num(&[1, 2, 0, 1])
///     .node_io_num(4, 1)
///     .build()?;
/// assert_eq!(info.input_offset(3, 0), Some(3));
/// ```
#[derive(Debug, Default)]
pub struct ComputeNodeInfoBuilder {
    node_name: String,
    node_type: String,
    ir_input_instances: Option<Vec<usize>>,
    ir_output_instances: Option<Vec<usize>>,
    inputs_num: usize,
    outputs_num: usize,
    input_descs: Vec<(usize, CompileTimeTensorDesc)>,
    output_descs: Vec<(usize, CompileTimeTensorDesc)>,
    attrs: RuntimeAttrs,
}

impl ComputeNodeInfoBuilder {
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn node_type(mut self, op_type: impl Into<String>) -> Self {
        self.node_type = op_type.into();
        self
    }

    /// `count` IR inputs with one instance each.
    pub fn ir_input_num(mut self, count: usize) -> Self {
        self.ir_input_instances = Some(vec![1; count]);
        self
    }

    /// Instance count per IR input.
    pub fn ir_instance_num(mut self, instances: &[usize]) -> Self {
        self.ir_input_instances = Some(instances.to_vec());
        self
    }

    /// Instance count per IR output.
    pub fn ir_output_instance_num(mut self, instances: &[usize]) -> Self {
        self.ir_output_instances = Some(instances.to_vec());
        self
    }

    /// Flattened input and output counts.
    pub fn node_io_num(mut self, inputs: usize, outputs: usize) -> Self {
        self.inputs_num = inputs;
        self.outputs_num = outputs;
        self
    }

    pub fn input_td(mut self, index: usize, data_type: DataType, origin: Format, storage: Format) -> Self {
        self.input_descs
            .push((index, CompileTimeTensorDesc::new(data_type, origin, storage)));
        self
    }

    pub fn output_td(mut self, index: usize, data_type: DataType, origin: Format, storage: Format) -> Self {
        self.output_descs
            .push((index, CompileTimeTensorDesc::new(data_type, origin, storage)));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.push(name, Some(value));
        self
    }

    /// Finish the description.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance counts do not add up to the flat
    /// input or output count, or a descriptor index is out of range.
    pub fn build(self) -> Result<ComputeNodeInfo> {
        let input_instances = self
            .ir_input_instances
            .unwrap_or_else(|| vec![1; self.inputs_num]);
        let output_instances = self
            .ir_output_instances
            .unwrap_or_else(|| vec![1; self.outputs_num]);

        let ir_inputs = Self::instance_table(&input_instances, self.inputs_num, "input")?;
        let ir_outputs = Self::instance_table(&output_instances, self.outputs_num, "output")?;

        let input_descs = Self::descs(self.input_descs, self.inputs_num, "input")?;
        let output_descs = Self::descs(self.output_descs, self.outputs_num, "output")?;

        Ok(ComputeNodeInfo {
            node_name: self.node_name,
            node_type: self.node_type,
            ir_inputs,
            ir_outputs,
            input_descs,
            output_descs,
            attrs: self.attrs,
        })
    }

    fn instance_table(
        instances: &[usize],
        flat: usize,
        what: &str,
    ) -> Result<Vec<AnchorInstanceInfo>> {
        let mut start = 0;
        let table = instances
            .iter()
            .map(|&num| {
                let info = AnchorInstanceInfo::new(start, num);
                start += num;
                info
            })
            .collect();
        if start != flat {
            return Err(Error::Layout(format!(
                "IR {} instances sum to {}, but the node has {} {}s",
                what, start, flat, what
            )));
        }
        Ok(table)
    }

    fn descs(
        given: Vec<(usize, CompileTimeTensorDesc)>,
        count: usize,
        what: &str,
    ) -> Result<Vec<CompileTimeTensorDesc>> {
        let mut descs = vec![CompileTimeTensorDesc::default(); count];
        for (index, desc) in given {
            let slot = descs.get_mut(index).ok_or_else(|| {
                Error::Layout(format!("{} desc index {} out of {}", what, index, count))
            })?;
            *slot = desc;
        }
        Ok(descs)
    }
}
