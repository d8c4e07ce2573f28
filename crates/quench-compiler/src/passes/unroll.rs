//! Unrolling of loops with constant trip counts.

use crate::pass::{Analysis, Diagnostic, Pass, PassContext, Stage};
use crate::passes::eliminate_dead_code;
use quench_core::{ConstantValue, Graph, InsertPoint, NodeId, Result, ValueId};
use std::collections::HashMap;

/// Replace `prim::Loop` nodes whose trip count is a known integer with that
/// many copies of the body.
///
/// Only counted loops qualify: the entry condition and the body's
/// continuation condition must both be the constant `true`. Loops above the
/// configured ceiling are left rolled and reported.
pub struct UnrollConstantLoopsPass;

impl UnrollConstantLoopsPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnrollConstantLoopsPass {
    fn default() -> Self {
        Self::new()
    }
}

fn is_true(graph: &Graph, value: ValueId) -> bool {
    graph.constant_value(value).and_then(|c| c.as_bool()) == Some(true)
}

/// Trip count of a counted loop, `None` when the loop does not qualify.
fn constant_trip_count(graph: &Graph, id: NodeId) -> Result<Option<i64>> {
    graph.check_encoding(id)?;
    let node = graph.node(id)?;
    let block = graph.block(node.blocks()[0])?;
    if !is_true(graph, node.inputs()[1]) || !is_true(graph, block.returns()[0]) {
        return Ok(None);
    }
    Ok(graph
        .constant_value(node.inputs()[0])
        .and_then(|c| c.as_int())
        .map(|n| n.max(0)))
}

/// Splice `trip_count` copies of the loop body in front of the loop, then
/// remove the loop.
fn unroll(graph: &mut Graph, id: NodeId, trip_count: i64) -> Result<()> {
    let node = graph.node(id)?.clone();
    let body = node.blocks()[0];
    let params = graph.block(body)?.params().to_vec();
    let returns = graph.block(body)?.returns().to_vec();
    let point = InsertPoint::Before(id);

    let mut current: Vec<ValueId> = node.inputs()[2..].to_vec();
    for iteration in 0..trip_count {
        let mut map = HashMap::new();
        if graph.value(params[0])?.has_uses() {
            let counter = graph.insert_constant(point, ConstantValue::Int(iteration))?;
            map.insert(params[0], counter);
        }
        for (&param, &value) in params[1..].iter().zip(&current) {
            map.insert(param, value);
        }
        graph.clone_nodes(body, point, &mut map)?;
        current = returns[1..]
            .iter()
            .map(|v| *map.get(v).unwrap_or(v))
            .collect();
    }

    for (&output, &value) in node.outputs().iter().zip(&current) {
        graph.replace_all_uses_with(output, value)?;
    }
    graph.remove_node(id)
}

impl Pass for UnrollConstantLoopsPass {
    fn name(&self) -> &str {
        "unroll_constant_loops"
    }

    fn stage(&self) -> Stage {
        Stage::Unrolling
    }

    fn requires(&self) -> &[Analysis] {
        &[Analysis::Shape]
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<bool> {
        let ceiling = ctx.config.unroll_ceiling;
        let loops: Vec<NodeId> = graph
            .nodes_post_order()
            .into_iter()
            .filter(|&n| graph.node(n).is_ok_and(|node| node.op() == "prim::Loop"))
            .collect();

        let mut unrolled = 0;
        for id in loops {
            if !graph.contains_node(id) {
                continue;
            }
            let Some(trip_count) = constant_trip_count(graph, id)? else {
                continue;
            };
            if trip_count as u64 > ceiling as u64 {
                let value = match graph.node(id)?.outputs().first() {
                    Some(&output) => graph.value(output)?.name.clone(),
                    None => String::new(),
                };
                tracing::debug!(trip_count, ceiling, "UnrollCeilingExceeded");
                ctx.report(Diagnostic::UnrollCeilingExceeded {
                    value,
                    trip_count,
                    ceiling,
                });
                continue;
            }

            tracing::debug!(trip_count, "Unrolling loop");
            unroll(graph, id, trip_count)?;
            unrolled += 1;
        }

        if unrolled == 0 {
            return Ok(false);
        }
        if ctx.config.run_dead_code_elimination {
            eliminate_dead_code(graph, ctx.registry)?;
        }
        tracing::debug!(unrolled, "Unrolled constant loops");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use quench_core::{GraphBuilder, ParameterSnapshot, SchemaRegistry, ValueType};

    fn run(graph: &mut Graph, config: &PipelineConfig) -> (bool, Vec<Diagnostic>) {
        let registry = SchemaRegistry::with_defaults().unwrap();
        let snapshot = ParameterSnapshot::new();
        let mut ctx = PassContext::new(&registry, &snapshot, config);
        let changed = UnrollConstantLoopsPass::new().run(graph, &mut ctx).unwrap();
        (changed, ctx.diagnostics().to_vec())
    }

    fn count_op(graph: &Graph, op: &str) -> usize {
        graph
            .nodes_pre_order()
            .into_iter()
            .filter(|&n| graph.node(n).unwrap().op() == op)
            .count()
    }

    /// `for i in range(n): acc = acc + x`
    fn accumulate(trip: ConstantValue) -> (Graph, ValueId) {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let n = b.constant(trip).unwrap();
        let outs = b
            .build_loop(n, &[x], |b, _i, carried| {
                Ok(vec![b.op("aten::add.Tensor", &[carried[0], x], ValueType::Tensor)?])
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        (b.finish().unwrap(), x)
    }

    #[test]
    fn test_unrolls_and_threads_carried_values() {
        let (mut graph, x) = accumulate(ConstantValue::Int(3));
        let (changed, _) = run(&mut graph, &PipelineConfig::default());

        assert!(changed);
        assert_eq!(count_op(&graph, "prim::Loop"), 0);
        assert_eq!(count_op(&graph, "aten::add.Tensor"), 3);

        // Walk the chain back from the output: add(add(add(x, x), x), x)
        let mut current = graph.outputs()[0];
        for _ in 0..3 {
            let node = graph.node(graph.producer(current).unwrap()).unwrap();
            assert_eq!(node.op(), "aten::add.Tensor");
            assert_eq!(node.inputs()[1], x);
            current = node.inputs()[0];
        }
        assert_eq!(current, x);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_zero_trip_count_forwards_initial_values() {
        let (mut graph, x) = accumulate(ConstantValue::Int(0));
        let (changed, _) = run(&mut graph, &PipelineConfig::default());

        assert!(changed);
        assert_eq!(graph.outputs(), &[x]);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_iteration_counter_becomes_constant() {
        let mut b = GraphBuilder::new();
        let start = b.input("start", ValueType::Int);
        let n = b.constant(ConstantValue::Int(2)).unwrap();
        let outs = b
            .build_loop(n, &[start], |b, i, carried| {
                Ok(vec![b.op("aten::add.int", &[carried[0], i], ValueType::Int)?])
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        let mut graph = b.finish().unwrap();

        run(&mut graph, &PipelineConfig::default());
        let last = graph.node(graph.producer(graph.outputs()[0]).unwrap()).unwrap();
        assert_eq!(graph.constant_value(last.inputs()[1]), Some(ConstantValue::Int(1)));
        let first = graph.node(graph.producer(last.inputs()[0]).unwrap()).unwrap();
        assert_eq!(graph.constant_value(first.inputs()[1]), Some(ConstantValue::Int(0)));
        assert_eq!(first.inputs()[0], start);
    }

    #[test]
    fn test_ceiling_leaves_loop_rolled() {
        let (mut graph, _) = accumulate(ConstantValue::Int(100));
        let before = graph.to_string();
        let (changed, diagnostics) = run(&mut graph, &PipelineConfig::default());

        assert!(!changed);
        assert_eq!(graph.to_string(), before);
        assert!(matches!(
            diagnostics.as_slice(),
            [Diagnostic::UnrollCeilingExceeded { trip_count: 100, ceiling: 8, .. }]
        ));
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let (mut graph, _) = accumulate(ConstantValue::Int(4));
        let (changed, _) = run(&mut graph, &PipelineConfig::default().with_unroll_ceiling(4));
        assert!(changed);
        assert_eq!(count_op(&graph, "prim::Loop"), 0);
    }

    #[test]
    fn test_unknown_trip_count_is_untouched() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let n = b.input("n", ValueType::Int);
        let outs = b
            .build_loop(n, &[x], |b, _i, carried| {
                Ok(vec![b.op("aten::relu", &[carried[0]], ValueType::Tensor)?])
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        let mut graph = b.finish().unwrap();

        let (changed, diagnostics) = run(&mut graph, &PipelineConfig::default());
        assert!(!changed);
        assert!(diagnostics.is_empty());
        assert_eq!(count_op(&graph, "prim::Loop"), 1);
    }

    #[test]
    fn test_nested_loops_unroll_inside_out() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let outer = b.constant(ConstantValue::Int(2)).unwrap();
        let outs = b
            .build_loop(outer, &[x], |b, _i, carried| {
                let inner = b.constant(ConstantValue::Int(2))?;
                b.build_loop(inner, carried, |b, _j, acc| {
                    Ok(vec![b.op("aten::relu", &[acc[0]], ValueType::Tensor)?])
                })
            })
            .unwrap();
        b.output(outs[0]).unwrap();
        let mut graph = b.finish().unwrap();

        let (changed, _) = run(&mut graph, &PipelineConfig::default());
        assert!(changed);
        assert_eq!(count_op(&graph, "prim::Loop"), 0);
        assert_eq!(count_op(&graph, "aten::relu"), 4);
        assert!(graph.verify().is_ok());
    }
}
