//! Programmatic graph construction.
//!
//! The graph loader is external; this builder is how embedders and tests
//! assemble graphs, including the TorchScript control-flow encoding:
//!
//! - `prim::Loop(trip_count, cond, carried...)` owns one body block with
//!   parameters `(iter, carried...)` returning `(cond, carried...)`.
//! - `prim::If(cond)` owns a then-block and an else-block, each returning the
//!   node's outputs.

use crate::ir::{BlockId, Graph, InsertPoint, NewNode, NodeId, ValueId};
use crate::types::{ConstantValue, ValueType};
use crate::Result;

/// Builds a graph block by block.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: Graph,
    block: BlockId,
}

impl GraphBuilder {
    /// Create a builder positioned at the root block of an empty graph.
    pub fn new() -> Self {
        let graph = Graph::new();
        let block = graph.root();
        Self { graph, block }
    }

    /// Add a graph input.
    pub fn input(&mut self, name: &str, ty: ValueType) -> ValueId {
        self.graph.add_input(name, ty)
    }

    /// Append a `prim::Constant`.
    pub fn constant(&mut self, value: ConstantValue) -> Result<ValueId> {
        self.graph
            .insert_constant(InsertPoint::AtEnd(self.block), value)
    }

    /// Append a single-output node.
    pub fn op(&mut self, op: &str, inputs: &[ValueId], ty: ValueType) -> Result<ValueId> {
        let outputs = self.op_multi(op, inputs, &[ty])?;
        Ok(outputs[0])
    }

    /// Append a node with any number of outputs.
    pub fn op_multi(&mut self, op: &str, inputs: &[ValueId], types: &[ValueType]) -> Result<Vec<ValueId>> {
        let mut template = NewNode::new(op).inputs(inputs);
        for ty in types {
            template = template.output("", ty.clone());
        }
        let node = self.graph.append_node(self.block, template)?;
        Ok(self.graph.node(node)?.outputs().to_vec())
    }

    /// Append a node without outputs.
    pub fn op_void(&mut self, op: &str, inputs: &[ValueId]) -> Result<NodeId> {
        self.graph
            .append_node(self.block, NewNode::new(op).inputs(inputs))
    }

    /// Append `prim::GetAttr[name=...](module)`.
    pub fn get_attr(&mut self, module: ValueId, name: &str, ty: ValueType) -> Result<ValueId> {
        let node = self.graph.append_node(
            self.block,
            NewNode::new("prim::GetAttr")
                .inputs(&[module])
                .output(name, ty)
                .attribute("name", ConstantValue::Str(name.to_string())),
        )?;
        Ok(self.graph.node(node)?.outputs()[0])
    }

    /// Append `prim::SetAttr[name=...](module, value)`.
    pub fn set_attr(&mut self, module: ValueId, name: &str, value: ValueId) -> Result<NodeId> {
        self.graph.append_node(
            self.block,
            NewNode::new("prim::SetAttr")
                .inputs(&[module, value])
                .attribute("name", ConstantValue::Str(name.to_string())),
        )
    }

    /// Append a `prim::Loop` running `trip_count` times.
    ///
    /// `body` receives the iteration counter and the carried values visible
    /// inside the body and returns the next carried values. Returns the
    /// loop's outputs.
    pub fn build_loop<F>(&mut self, trip_count: ValueId, carried: &[ValueId], body: F) -> Result<Vec<ValueId>>
    where
        F: FnOnce(&mut Self, ValueId, &[ValueId]) -> Result<Vec<ValueId>>,
    {
        let cond = self.constant(ConstantValue::Bool(true))?;
        let types = carried
            .iter()
            .map(|&v| Ok(self.graph.value(v)?.ty.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut template = NewNode::new("prim::Loop").inputs(&[trip_count, cond]).inputs(carried);
        for ty in &types {
            template = template.output("", ty.clone());
        }
        let node = self.graph.append_node(self.block, template)?;

        let body_block = self.graph.add_sub_block(node)?;
        let iter = self.graph.add_block_param(body_block, "i", ValueType::Int)?;
        let mut params = Vec::with_capacity(types.len());
        for ty in types {
            params.push(self.graph.add_block_param(body_block, "", ty)?);
        }

        let outer = std::mem::replace(&mut self.block, body_block);
        let next = body(self, iter, &params);
        self.block = outer;
        let next = next?;

        let mut returns = Vec::with_capacity(next.len() + 1);
        returns.push(cond);
        returns.extend(next);
        self.graph.set_returns(body_block, &returns)?;

        Ok(self.graph.node(node)?.outputs().to_vec())
    }

    /// Append a `prim::If` with outputs of the given types.
    pub fn build_if<T, E>(
        &mut self,
        cond: ValueId,
        types: &[ValueType],
        then_branch: T,
        else_branch: E,
    ) -> Result<Vec<ValueId>>
    where
        T: FnOnce(&mut Self) -> Result<Vec<ValueId>>,
        E: FnOnce(&mut Self) -> Result<Vec<ValueId>>,
    {
        let mut template = NewNode::new("prim::If").inputs(&[cond]);
        for ty in types {
            template = template.output("", ty.clone());
        }
        let node = self.graph.append_node(self.block, template)?;
        let then_block = self.graph.add_sub_block(node)?;
        let else_block = self.graph.add_sub_block(node)?;

        let outer = std::mem::replace(&mut self.block, then_block);
        let then_returns = then_branch(self);
        self.block = else_block;
        let else_returns = else_branch(self);
        self.block = outer;

        self.graph.set_returns(then_block, &then_returns?)?;
        self.graph.set_returns(else_block, &else_returns?)?;
        Ok(self.graph.node(node)?.outputs().to_vec())
    }

    /// Mark a value as a graph output.
    pub fn output(&mut self, value: ValueId) -> Result<()> {
        let root = self.graph.root();
        self.graph.push_return(root, value)
    }

    /// Get the graph under construction.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Get the graph under construction for direct edits.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Verify and return the finished graph.
    pub fn finish(self) -> Result<Graph> {
        self.graph.verify()?;
        Ok(self.graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_straight_line_graph() {
        let mut b = GraphBuilder::new();
        let module = b.input("self", ValueType::Module("Net".to_string()));
        let x = b.input("x", ValueType::Tensor);
        let w = b.get_attr(module, "weight", ValueType::Tensor).unwrap();
        let y = b.op("aten::mul.Tensor", &[x, w], ValueType::Tensor).unwrap();
        b.output(y).unwrap();
        let graph = b.finish().unwrap();

        assert_eq!(graph.inputs().len(), 2);
        assert_eq!(graph.node_count(), 2);
        let get_attr = graph.node(graph.producer(w).unwrap()).unwrap();
        assert_eq!(get_attr.str_attribute("name"), Some("weight"));
    }

    #[test]
    fn test_build_loop_threads_carried_values() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let trip = b.constant(ConstantValue::Int(3)).unwrap();
        let outs = b
            .build_loop(trip, &[x], |b, _iter, carried| {
                let next = b.op("aten::relu", &[carried[0]], ValueType::Tensor)?;
                Ok(vec![next])
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        let graph = b.finish().unwrap();

        let lp = graph.node(graph.producer(outs[0]).unwrap()).unwrap();
        assert_eq!(lp.op(), "prim::Loop");
        assert_eq!(lp.inputs().len(), 3);
        let body = graph.block(lp.blocks()[0]).unwrap();
        assert_eq!(body.params().len(), 2);
        assert_eq!(body.returns().len(), 2);
        assert_eq!(graph.constant_value(body.returns()[0]), Some(ConstantValue::Bool(true)));
    }

    #[test]
    fn test_build_if_has_two_branches() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let flag = b.input("flag", ValueType::Bool);
        let outs = b
            .build_if(
                flag,
                &[ValueType::Tensor],
                |b| Ok(vec![b.op("aten::relu", &[x], ValueType::Tensor)?]),
                |_| Ok(vec![x]),
            )
            .unwrap();
        b.output(outs[0]).unwrap();
        let graph = b.finish().unwrap();

        let node = graph.node(graph.producer(outs[0]).unwrap()).unwrap();
        assert_eq!(node.blocks().len(), 2);
        assert_eq!(graph.block(node.blocks()[1]).unwrap().returns(), &[x]);
    }
}
