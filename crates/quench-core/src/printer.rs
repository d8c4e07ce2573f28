//! Textual IR dump.
//!
//! ```text
//! graph(%self : Module(Net), %x : Tensor):
//!   %weight : Tensor = prim::GetAttr[name="weight"](%self)
//!   %3 : Tensor = aten::mul.Tensor(%x, %weight)
//!   return (%3)
//! ```
//!
//! The output depends only on graph structure and value names, so two dumps
//! compare equal exactly when the graphs are structurally identical.

use crate::ir::{BlockId, Graph, NodeId, ValueId};
use std::fmt::{self, Write};

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("graph(")?;
        write_params(self, f, self.inputs())?;
        f.write_str("):\n")?;

        let root = self.block(self.root()).map_err(|_| fmt::Error)?;
        for &node in root.nodes() {
            write_node(self, f, node, 1)?;
        }
        f.write_str("  return (")?;
        write_values(self, f, self.outputs())?;
        f.write_str(")\n")
    }
}

fn name(graph: &Graph, value: ValueId) -> &str {
    graph.value(value).map(|v| v.name.as_str()).unwrap_or("<dead>")
}

fn write_values(graph: &Graph, f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
    for (i, &value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "%{}", name(graph, value))?;
    }
    Ok(())
}

fn write_params(graph: &Graph, f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
    for (i, &value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        let v = graph.value(value).map_err(|_| fmt::Error)?;
        write!(f, "%{} : {}", v.name, v.ty)?;
    }
    Ok(())
}

fn write_node(graph: &Graph, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
    let node = graph.node(id).map_err(|_| fmt::Error)?;
    let indent = "  ".repeat(depth);
    f.write_str(&indent)?;

    if !node.outputs().is_empty() {
        write_params(graph, f, node.outputs())?;
        f.write_str(" = ")?;
    }
    f.write_str(node.op())?;

    if !node.attributes().is_empty() {
        let mut attrs = String::new();
        for (i, (key, value)) in node.attributes().iter().enumerate() {
            if i > 0 {
                attrs.push_str(", ");
            }
            write!(attrs, "{key}={value}")?;
        }
        write!(f, "[{attrs}]")?;
    }

    f.write_str("(")?;
    write_values(graph, f, node.inputs())?;
    f.write_str(")\n")?;

    for (index, &block) in node.blocks().iter().enumerate() {
        write_block(graph, f, block, index, depth + 1)?;
    }
    Ok(())
}

fn write_block(
    graph: &Graph,
    f: &mut fmt::Formatter<'_>,
    id: BlockId,
    index: usize,
    depth: usize,
) -> fmt::Result {
    let block = graph.block(id).map_err(|_| fmt::Error)?;
    let indent = "  ".repeat(depth);

    write!(f, "{indent}block{index}(")?;
    write_params(graph, f, block.params())?;
    f.write_str("):\n")?;
    for &node in block.nodes() {
        write_node(graph, f, node, depth + 1)?;
    }
    write!(f, "{indent}  -> (")?;
    write_values(graph, f, block.returns())?;
    f.write_str(")\n")
}

#[cfg(test)]
mod tests {
    use crate::ir_builder::GraphBuilder;
    use crate::types::{ConstantValue, ValueType};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_print_straight_line() {
        let mut b = GraphBuilder::new();
        let module = b.input("self", ValueType::Module("Net".to_string()));
        let x = b.input("x", ValueType::Tensor);
        let w = b.get_attr(module, "weight", ValueType::Tensor).unwrap();
        let y = b.op("aten::mul.Tensor", &[x, w], ValueType::Tensor).unwrap();
        b.output(y).unwrap();
        let graph = b.finish().unwrap();

        let expected = "\
graph(%self : Module(Net), %x : Tensor):
  %weight : Tensor = prim::GetAttr[name=\"weight\"](%self)
  %3 : Tensor = aten::mul.Tensor(%x, %weight)
  return (%3)
";
        assert_eq!(graph.to_string(), expected);
    }

    #[test]
    fn test_print_nested_loop() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let trip = b.constant(ConstantValue::Int(2)).unwrap();
        let outs = b
            .build_loop(trip, &[x], |b, _i, carried| {
                Ok(vec![b.op("aten::relu", &[carried[0]], ValueType::Tensor)?])
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        let graph = b.finish().unwrap();

        let expected = "\
graph(%x : Tensor):
  %1 : int = prim::Constant[value=2]()
  %2 : bool = prim::Constant[value=true]()
  %3 : Tensor = prim::Loop(%1, %2, %x)
    block0(%i : int, %5 : Tensor):
      %6 : Tensor = aten::relu(%5)
      -> (%2, %6)
  return (%3)
";
        assert_eq!(graph.to_string(), expected);
    }
}
