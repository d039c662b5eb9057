//! Kernel contexts for graph nodes.
//!
//! The factory ties the IR to the registry: private attributes come from the
//! node's registered bundle, and the data dependency interpreter decides
//! which inputs carry their constant value into a context.

use crate::data_dependent::DataDependentInterpreter;
use crate::space_registry::{DefaultSpaceRegistry, OpImplHandle, SpaceRegistry};
use crate::{Error, Result};
use std::sync::Arc;
use tessera_core::{
    CompileInfo, ComputeNodeInfo, InferShapeContext, IrEdge, IrGraph, IrNode, IrNodeId,
    PlatformInfo, Tensor, TilingContext, TilingParseContext,
};

/// Builds the contexts a node's callbacks run against.
pub struct NodeContextFactory<'a> {
    graph: &'a IrGraph,
    node_id: IrNodeId,
    registry: Option<Arc<SpaceRegistry>>,
}

impl<'a> NodeContextFactory<'a> {
    /// Without an explicit registry the default space registry is used.
    pub fn new(graph: &'a IrGraph, node_id: IrNodeId, registry: Option<Arc<SpaceRegistry>>) -> Self {
        Self {
            graph,
            node_id,
            registry: registry.or_else(DefaultSpaceRegistry::get),
        }
    }

    fn node(&self) -> Result<&'a IrNode> {
        Ok(self.graph.node(self.node_id)?)
    }

    /// The registered bundle for the node's op type, if any.
    pub fn op_impl(&self) -> Result<Option<OpImplHandle>> {
        let node = self.node()?;
        Ok(self
            .registry
            .as_ref()
            .and_then(|registry| registry.get_op_impl(&node.op_type)))
    }

    fn interpreter(&self) -> DataDependentInterpreter<'a> {
        DataDependentInterpreter::new(self.graph, self.node_id, self.registry.clone())
    }

    /// The node's compute info with its registered private attributes
    /// appended after the public ones.
    pub fn compute_node_info(&self) -> Result<ComputeNodeInfo> {
        let private_attrs = self
            .op_impl()?
            .map(|funcs| funcs.private_attrs().to_vec())
            .unwrap_or_default();
        Ok(ComputeNodeInfo::from_node(self.graph, self.node_id, &private_attrs)?)
    }

    /// A shape inference context for the node.
    ///
    /// Inputs whose value the node depends on are passed as tensors carrying
    /// the edge's constant; all others are passed as shapes only.
    #[tracing::instrument(skip_all, fields(node_id = self.node_id.index()))]
    pub fn infer_shape_context(&self) -> Result<InferShapeContext> {
        let node = self.node()?;
        let op_impl = self.op_impl()?;
        let dependent = self.dependent_inputs(node, |ddi, ir| ddi.is_data_dependent(ir))?;

        let mut builder = InferShapeContext::builder(self.compute_node_info()?);
        for (flat, &edge_id) in node.inputs().iter().enumerate() {
            let edge = self.graph.edge(edge_id)?;
            builder = if dependent[flat] {
                builder.input_tensor(self.value_tensor(node, flat, edge))
            } else {
                builder.input_shape(edge.shape.clone())
            };
        }
        for &edge_id in node.outputs() {
            builder = builder.output_shape(self.graph.edge(edge_id)?.shape.clone());
        }
        if let Some(infer) = op_impl.as_ref().and_then(|funcs| funcs.infer_shape()) {
            builder = builder.infer_shape_fn(infer);
        }
        Ok(builder.build()?)
    }

    /// Allocate compile info through the registered creator and run the
    /// registered tiling-parse callback on it.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingCallback` if the op type has no tiling-parse
    /// callback.
    pub fn parse_compile_info(
        &self,
        compiled_json: impl Into<String>,
        platform_info: Arc<PlatformInfo>,
    ) -> Result<CompileInfo> {
        let node = self.node()?;
        let op_impl = self.op_impl()?;
        let missing = || Error::MissingCallback {
            op_type: node.op_type.clone(),
            callback: "tiling parse",
        };
        let funcs = op_impl.ok_or_else(missing)?;
        let parse = funcs.tiling_parse().ok_or_else(missing)?;
        let creator = funcs.compile_info_creator().ok_or_else(missing)?;

        let mut ctx = TilingParseContext::builder()
            .node(self.compute_node_info()?)
            .op_type(node.op_type.clone())
            .compiled_json(compiled_json)
            .platform_info(platform_info)
            .compile_info_creator(creator, funcs.compile_info_deleter())
            .build()?;
        ctx.run(parse)?;
        ctx.take_compile_info().ok_or_else(|| {
            Error::Core(tessera_core::Error::Layout(format!(
                "tiling parse for '{}' left no compile info",
                node.op_type
            )))
        })
    }

    /// A tiling context for the node, sized by the registered maximum tiling
    /// data size.
    ///
    /// Only inputs the tiling callback depends on keep their value.
    #[tracing::instrument(skip_all, fields(node_id = self.node_id.index()))]
    pub fn tiling_context(
        &self,
        compile_info: Arc<CompileInfo>,
        platform_info: Arc<PlatformInfo>,
    ) -> Result<TilingContext> {
        let node = self.node()?;
        let funcs = self.op_impl()?.ok_or_else(|| Error::MissingCallback {
            op_type: node.op_type.clone(),
            callback: "tiling",
        })?;

        let ddi = self.interpreter();
        let needed = (0..node.ir_input_num())
            .map(|ir| ddi.is_tiling_input_data_dependent(ir))
            .collect::<Result<Vec<bool>>>()?;

        let mut builder = TilingContext::builder(self.compute_node_info()?)
            .compile_info(compile_info)
            .platform_info(platform_info)
            .max_tiling_data_size(funcs.max_tiling_data_size())
            .value_needed(move |ir| needed.get(ir).copied().unwrap_or(false));
        for (flat, &edge_id) in node.inputs().iter().enumerate() {
            let edge = self.graph.edge(edge_id)?;
            builder = builder.input_tensor(self.value_tensor(node, flat, edge));
        }
        for &edge_id in node.outputs() {
            builder = builder.output_shape(self.graph.edge(edge_id)?.shape.clone());
        }
        if let Some(tiling) = funcs.tiling() {
            builder = builder.tiling_fn(tiling);
        }
        Ok(builder.build()?)
    }

    // Per flat input, whether the IR input it instantiates is value-dependent.
    fn dependent_inputs(
        &self,
        node: &IrNode,
        query: impl Fn(&DataDependentInterpreter<'a>, usize) -> Result<bool>,
    ) -> Result<Vec<bool>> {
        let ddi = self.interpreter();
        let by_ir = (0..node.ir_input_num())
            .map(|ir| query(&ddi, ir))
            .collect::<Result<Vec<bool>>>()?;
        Ok((0..node.inputs().len())
            .map(|flat| {
                node.ir_index_of_input(flat)
                    .and_then(|ir| by_ir.get(ir).copied())
                    .unwrap_or(false)
            })
            .collect())
    }

    fn value_tensor(&self, node: &IrNode, flat: usize, edge: &IrEdge) -> Tensor {
        let mut tensor = match edge.constant_value() {
            Some(data) => Tensor::with_data(edge.shape.clone(), data.clone()),
            None => {
                tracing::debug!(
                    node = %node.name,
                    input = flat,
                    edge = %edge.name,
                    "input has no constant value"
                );
                Tensor::new(edge.shape.clone(), edge.dtype)
            }
        };
        tensor.format = edge.format;
        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::OpImplRegistryHolder;
    use crate::register::OpImplRegister;
    use crate::registry::OpImplRegistry;
    use tessera_core::{AttrValue, DataType, IrPort, StorageShape, TensorData};

    #[derive(Default)]
    struct ReshapeCompileInfo {
        core_num: u32,
    }

    fn infer_reshape(ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
        let dims = ctx
            .input_tensor(1)
            .and_then(|tensor| tensor.data.as_ref())
            .and_then(|data| data.as_i64())
            .ok_or_else(|| tessera_core::Error::Kernel("shape input has no value".into()))?
            .to_vec();
        let out = ctx
            .output_shape_mut(0)
            .ok_or_else(|| tessera_core::Error::Kernel("missing output".into()))?;
        *out = dims.into();
        Ok(())
    }

    fn parse_reshape(ctx: &mut TilingParseContext) -> tessera_core::Result<()> {
        let core_num = ctx.platform_info().map(|info| info.core_num).unwrap_or(1);
        if let Some(info) = ctx.compiled_info_mut::<ReshapeCompileInfo>() {
            info.core_num = core_num;
        }
        Ok(())
    }

    fn tiling_reshape(ctx: &mut TilingContext) -> tessera_core::Result<()> {
        let has_value = ctx.input_tensor(1).is_some_and(Tensor::has_data);
        ctx.set_tiling_key(if has_value { 1 } else { 0 })
    }

    fn reshape_space() -> Arc<SpaceRegistry> {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Reshape")
            .infer_shape(infer_reshape)
            .tiling_with_max_size(tiling_reshape, 256)
            .tiling_parse::<ReshapeCompileInfo>(parse_reshape)
            .inputs_data_dependency(&[1])
            .tiling_inputs_data_dependency(&[1])
            .private_attr_with_default("allowzero", 0i64)
            .register_into(&registry);
        let space = SpaceRegistry::new();
        space.add_registry(Arc::new(OpImplRegistryHolder::from_registry(&registry)));
        Arc::new(space)
    }

    fn reshape_graph() -> (IrGraph, IrNodeId) {
        let mut graph = IrGraph::new();
        let data = graph.add_edge(IrEdge::new(
            "data",
            DataType::F32,
            StorageShape::uniform(vec![2, 3]),
        ));
        let shape = graph.add_edge(IrEdge::with_constant(
            "shape",
            StorageShape::uniform(vec![1]),
            TensorData::I64(vec![6]),
        ));
        let out = graph.add_edge(IrEdge::new("out", DataType::F32, StorageShape::default()));

        let mut node = IrNode::named("reshape", "Reshape");
        node.ir_inputs = vec![IrPort::required("data"), IrPort::required("shape")];
        node.add_input(data);
        node.add_input(shape);
        node.add_output(out);
        let id = graph.add_node(node);
        (graph, id)
    }

    #[test]
    fn test_private_attrs_appended() {
        let (graph, id) = reshape_graph();
        let factory = NodeContextFactory::new(&graph, id, Some(reshape_space()));
        let info = factory.compute_node_info().unwrap();
        assert_eq!(
            info.attrs().get_by_name("allowzero"),
            Some(&AttrValue::Int(0))
        );
    }

    #[test]
    fn test_infer_shape_receives_dependent_value() {
        let (graph, id) = reshape_graph();
        let factory = NodeContextFactory::new(&graph, id, Some(reshape_space()));
        let mut ctx = factory.infer_shape_context().unwrap();

        assert!(ctx.input_tensor(0).is_none());
        assert!(ctx.input_shape(0).is_some());
        assert!(ctx.input_tensor(1).is_some());

        ctx.run().unwrap();
        assert_eq!(ctx.output_shape(0).unwrap().dims(), &[6]);
    }

    #[test]
    fn test_unregistered_node_has_no_infer_fn() {
        let (graph, id) = reshape_graph();
        let factory = NodeContextFactory::new(&graph, id, Some(Arc::new(SpaceRegistry::new())));
        let ctx = factory.infer_shape_context().unwrap();
        assert!(ctx.infer_shape_fn().is_none());
        assert!(ctx.input_tensor(1).is_none());
    }

    #[test]
    fn test_tiling_keeps_only_needed_values() {
        let (graph, id) = reshape_graph();
        let factory = NodeContextFactory::new(&graph, id, Some(reshape_space()));
        let platform = Arc::new(PlatformInfo::new("sim", 8));

        let compile_info = factory
            .parse_compile_info("{}", Arc::clone(&platform))
            .unwrap();
        assert_eq!(compile_info.get::<ReshapeCompileInfo>().unwrap().core_num, 8);

        let mut ctx = factory
            .tiling_context(Arc::new(compile_info), platform)
            .unwrap();
        assert_eq!(ctx.raw_tiling_data().unwrap().capacity(), 256);
        ctx.run().unwrap();
        assert_eq!(ctx.tiling_key(), 1);
    }

    #[test]
    fn test_tiling_requires_registration() {
        let (graph, id) = reshape_graph();
        let factory = NodeContextFactory::new(&graph, id, Some(Arc::new(SpaceRegistry::new())));
        let platform = Arc::new(PlatformInfo::new("sim", 1));
        let result = factory.parse_compile_info("{}", platform);
        assert!(matches!(result, Err(Error::MissingCallback { .. })));
    }
}
