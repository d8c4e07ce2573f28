//! Dead code elimination shared by the rewrite passes.

use quench_core::{Graph, NodeId, Result, SchemaLookup, SchemaRegistry};

/// Remove nodes whose outputs are unused and that have no observable effect.
///
/// Nodes are visited users-first, so a whole dead chain goes in one sweep;
/// sweeps repeat until nothing more can be removed. Returns the number of
/// removed nodes (nested nodes destroyed with their owner are not counted).
pub fn eliminate_dead_code(graph: &mut Graph, registry: &SchemaRegistry) -> Result<usize> {
    let mut removed = 0;
    loop {
        let mut changed = false;
        for id in graph.nodes_pre_order().into_iter().rev() {
            if !graph.contains_node(id) {
                continue;
            }
            if is_dead(graph, registry, id)? {
                tracing::trace!(node = ?id, op = graph.node(id)?.op(), "Removing dead node");
                graph.remove_node(id)?;
                removed += 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, "Eliminated dead nodes");
    }
    Ok(removed)
}

fn is_dead(graph: &Graph, registry: &SchemaRegistry, id: NodeId) -> Result<bool> {
    let node = graph.node(id)?;
    for &output in node.outputs() {
        if graph.value(output)?.has_uses() {
            return Ok(false);
        }
    }
    Ok(!has_effects(graph, registry, id)?)
}

/// Check whether a node, or anything nested inside it, may have an effect
/// beyond producing its outputs.
pub(crate) fn has_effects(graph: &Graph, registry: &SchemaRegistry, id: NodeId) -> Result<bool> {
    let node = graph.node(id)?;
    match registry.resolve(node.op()) {
        SchemaLookup::Unknown => return Ok(true),
        SchemaLookup::Known(def) if def.has_observable_effects() => return Ok(true),
        SchemaLookup::Known(_) => {}
    }
    for &block in node.blocks() {
        for &nested in graph.block(block)?.nodes() {
            if has_effects(graph, registry, nested)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quench_core::{ConstantValue, GraphBuilder, ValueType};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::with_defaults().unwrap()
    }

    #[test]
    fn test_removes_unused_chain() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let a = b.op("aten::relu", &[x], ValueType::Tensor).unwrap();
        b.op("aten::tanh", &[a], ValueType::Tensor).unwrap();
        let kept = b.op("aten::sigmoid", &[x], ValueType::Tensor).unwrap();
        b.output(kept).unwrap();
        let mut graph = b.finish().unwrap();

        let removed = eliminate_dead_code(&mut graph, &registry()).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_keeps_side_effects_and_writes() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        b.op("aten::relu_", &[x], ValueType::Tensor).unwrap();
        b.op_void("prim::Print", &[x]).unwrap();
        let mut graph = b.finish().unwrap();

        let removed = eliminate_dead_code(&mut graph, &registry()).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_keeps_unknown_operators() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        b.op("custom::mystery", &[x], ValueType::Tensor).unwrap();
        let mut graph = b.finish().unwrap();

        assert_eq!(eliminate_dead_code(&mut graph, &registry()).unwrap(), 0);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_loop_with_effectful_body_survives() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let trip = b.constant(ConstantValue::Int(2)).unwrap();
        b.build_loop(trip, &[x], |b, _i, carried| {
            b.op_void("prim::Print", &[carried[0]])?;
            Ok(vec![carried[0]])
        })
        .unwrap();
        let pure_trip = b.constant(ConstantValue::Int(3)).unwrap();
        b.build_loop(pure_trip, &[x], |b, _i, carried| {
            Ok(vec![b.op("aten::relu", &[carried[0]], ValueType::Tensor)?])
        })
        .unwrap();
        let mut graph = b.finish().unwrap();

        eliminate_dead_code(&mut graph, &registry()).unwrap();
        let loops = graph
            .nodes_pre_order()
            .into_iter()
            .filter(|&n| graph.node(n).unwrap().op() == "prim::Loop")
            .count();
        assert_eq!(loops, 1);
        assert!(graph.verify().is_ok());
    }
}
