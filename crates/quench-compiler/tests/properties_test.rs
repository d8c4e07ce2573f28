//! Property tests over randomly built graphs.

mod common;

use common::{count_op, registry};
use proptest::prelude::*;
use quench_compiler::{run_pipeline, AliasDb, PipelineConfig, ShapeAnalysis};
use quench_core::{
    ConstantValue, DataType, Graph, GraphBuilder, ParameterSnapshot, ShapeFact, TypeRecord, ValueId,
    ValueType,
};

#[derive(Debug, Clone)]
enum Step {
    Relu(usize),
    Tanh(usize),
    Add(usize, usize),
    Transpose(usize),
    ReluInPlace(usize),
    Opaque(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<usize>().prop_map(Step::Relu),
        any::<usize>().prop_map(Step::Tanh),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Add(a, b)),
        any::<usize>().prop_map(Step::Transpose),
        any::<usize>().prop_map(Step::ReluInPlace),
        any::<usize>().prop_map(Step::Opaque),
    ]
}

/// Graph built from steps; each step picks operands among earlier values.
struct Built {
    graph: Graph,
    values: Vec<ValueId>,
    views: Vec<(ValueId, ValueId)>,
    opaque: Vec<ValueId>,
}

fn build(steps: &[Step], allow_unknown: bool) -> Built {
    let mut b = GraphBuilder::new();
    let x = b.input("x", ValueType::Tensor);
    let swap = b.constant(ConstantValue::IntList(vec![1, 0])).unwrap();
    let mut values = vec![x];
    let mut views = Vec::new();
    let mut opaque = Vec::new();

    for s in steps {
        let pick = |i: usize| values[i % values.len()];
        let out = match *s {
            Step::Relu(a) => b.op("aten::relu", &[pick(a)], ValueType::Tensor).unwrap(),
            Step::Tanh(a) => b.op("aten::tanh", &[pick(a)], ValueType::Tensor).unwrap(),
            Step::Add(l, r) => b
                .op("aten::add.Tensor", &[pick(l), pick(r)], ValueType::Tensor)
                .unwrap(),
            Step::Transpose(a) => {
                let input = pick(a);
                let out = b.op("aten::permute", &[input, swap], ValueType::Tensor).unwrap();
                views.push((input, out));
                out
            }
            Step::ReluInPlace(a) => {
                let input = pick(a);
                let out = b.op("aten::relu_", &[input], ValueType::Tensor).unwrap();
                views.push((input, out));
                out
            }
            Step::Opaque(a) if allow_unknown => {
                let out = b.op("custom::opaque", &[pick(a)], ValueType::Tensor).unwrap();
                opaque.push(out);
                out
            }
            Step::Opaque(a) => b.op("aten::relu", &[pick(a)], ValueType::Tensor).unwrap(),
        };
        values.push(out);
    }
    b.output(*values.last().unwrap()).unwrap();

    Built {
        graph: b.finish().unwrap(),
        values,
        views,
        opaque,
    }
}

fn inverse(perm: &[i64]) -> Vec<i64> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p as usize] = i as i64;
    }
    inv
}

fn permutation() -> impl Strategy<Value = Vec<i64>> {
    (1usize..=5).prop_flat_map(|rank| Just((0..rank as i64).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Aliasing is an equivalence over the analyzed values.
    #[test]
    fn alias_relation_is_an_equivalence(steps in prop::collection::vec(step(), 1..12)) {
        let built = build(&steps, true);
        let db = AliasDb::analyze(&built.graph, &registry()).unwrap();

        for &a in &built.values {
            prop_assert!(db.may_alias(a, a));
            for &b in &built.values {
                prop_assert_eq!(db.may_alias(a, b), db.may_alias(b, a));
                for &c in &built.values {
                    if db.may_alias(a, b) && db.may_alias(b, c) {
                        prop_assert!(db.may_alias(a, c));
                    }
                }
            }
        }
    }

    /// Views and in-place results share storage with their operand, and
    /// outputs of unknown operators are conservatively wildcard.
    #[test]
    fn views_alias_and_unknown_outputs_are_wildcard(steps in prop::collection::vec(step(), 1..12)) {
        let built = build(&steps, true);
        let db = AliasDb::analyze(&built.graph, &registry()).unwrap();

        for &(input, view) in &built.views {
            prop_assert!(db.may_alias(input, view));
        }
        for &out in &built.opaque {
            prop_assert!(db.is_wildcard(out));
            prop_assert!(db.may_be_mutated(out));
        }
    }

    /// Applying a fixpoint never loses precision, and a second run over the
    /// refined graph agrees with the first.
    #[test]
    fn shape_analysis_is_monotone(
        steps in prop::collection::vec(step(), 1..12),
        rows in 1usize..6,
        cols in 1usize..6,
    ) {
        let mut graph = build(&steps, false).graph;
        let x = graph.inputs()[0];
        graph
            .set_record(x, TypeRecord::tensor(ShapeFact::Known(vec![rows, cols]), Some(DataType::F32), None))
            .unwrap();
        let registry = registry();
        let alias = AliasDb::analyze(&graph, &registry).unwrap();

        let before = ShapeAnalysis::run(&graph, &registry, Some(&alias)).unwrap();
        let stored: Vec<(ValueId, TypeRecord)> = graph
            .values()
            .map(|(v, _)| (v, graph.record(v).unwrap().clone()))
            .collect();
        before.apply(&mut graph).unwrap();

        for (v, old) in &stored {
            let new = graph.record(*v).unwrap();
            prop_assert!(new.shape.is_at_least_as_precise_as(&old.shape));
            prop_assert!(new.dtype.is_at_least_as_precise_as(&old.dtype));
        }

        let after = ShapeAnalysis::run(&graph, &registry, Some(&alias)).unwrap();
        for (v, _) in &stored {
            if let (Some(a), Some(b)) = (after.record(*v), before.record(*v)) {
                prop_assert!(a.is_at_least_as_precise_as(b));
            }
        }
    }

    /// A permutation followed by its inverse disappears.
    #[test]
    fn inverse_permutations_cancel(perm in permutation()) {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let forward = b.constant(ConstantValue::IntList(perm.clone())).unwrap();
        let backward = b.constant(ConstantValue::IntList(inverse(&perm))).unwrap();
        let p = b.op("aten::permute", &[x, forward], ValueType::Tensor).unwrap();
        let q = b.op("aten::permute", &[p, backward], ValueType::Tensor).unwrap();
        let y = b.op("aten::relu", &[q], ValueType::Tensor).unwrap();
        b.output(y).unwrap();
        let mut graph = b.finish().unwrap();

        run_pipeline(&mut graph, &registry(), &ParameterSnapshot::new(), PipelineConfig::default())
            .unwrap();

        prop_assert_eq!(count_op(&graph, "aten::permute"), 0);
        let relu = graph.node(graph.producer(graph.outputs()[0]).unwrap()).unwrap();
        prop_assert_eq!(relu.inputs(), &[x][..]);
    }
}
