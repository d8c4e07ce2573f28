//! Peephole elimination of permutation pairs that cancel out.

use crate::analysis::{normalize_dim, AliasDb};
use crate::pass::{Analysis, Pass, PassContext, Stage};
use crate::passes::eliminate_dead_code;
use quench_core::{
    AliasAnalysisKind, ConstantValue, Graph, NodeId, Result, SchemaLookup, SchemaRegistry,
    ShapeRule, User, ValueId,
};

/// Remove `permute`/`transpose` pairs whose composition is the identity.
///
/// The pattern is a permutation whose output feeds nothing but input 0 of a
/// second permutation. Consumers of the second output are rewired to the
/// first input and both nodes are deleted.
pub struct EliminatePermutationsPass;

impl EliminatePermutationsPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EliminatePermutationsPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Permutation as written on the node, before normalization.
#[derive(Debug, Clone, PartialEq)]
enum Permutation {
    /// `aten::permute(x, dims)`
    Dims(Vec<i64>),
    /// `aten::transpose(x, a, b)`
    Swap(i64, i64),
}

impl Permutation {
    fn rank_hint(&self) -> Option<usize> {
        match self {
            Permutation::Dims(dims) => Some(dims.len()),
            Permutation::Swap(a, b) if *a >= 0 && *b >= 0 => Some((*a.max(b) + 1) as usize),
            Permutation::Swap(..) => None,
        }
    }

    /// Resolve to `perm[i] = source dim of output dim i` for a given rank.
    fn resolve(&self, rank: usize) -> Option<Vec<usize>> {
        match self {
            Permutation::Dims(dims) => {
                if dims.len() != rank {
                    return None;
                }
                let perm: Vec<usize> = dims
                    .iter()
                    .map(|&d| normalize_dim(d, rank))
                    .collect::<Option<_>>()?;
                let mut seen = vec![false; rank];
                for &d in &perm {
                    if std::mem::replace(&mut seen[d], true) {
                        return None;
                    }
                }
                Some(perm)
            }
            Permutation::Swap(a, b) => {
                let (a, b) = (normalize_dim(*a, rank)?, normalize_dim(*b, rank)?);
                let mut perm: Vec<usize> = (0..rank).collect();
                perm.swap(a, b);
                Some(perm)
            }
        }
    }
}

/// Check that `second ∘ first` maps every dimension back to itself.
fn composes_to_identity(first: &[usize], second: &[usize]) -> bool {
    first.len() == second.len() && second.iter().enumerate().all(|(i, &d)| first[d] == i)
}

fn permutation_rule(registry: &SchemaRegistry, op: &str) -> Option<ShapeRule> {
    registry
        .resolve(op)
        .known()
        .filter(|def| def.is_permutation())
        .map(|def| def.shape_rule)
}

/// Check that no user of a value may write it in place.
fn is_never_written(graph: &Graph, registry: &SchemaRegistry, value: ValueId) -> Result<bool> {
    for u in graph.value(value)?.uses() {
        let User::Node(user) = u.user else {
            continue;
        };
        match registry.resolve(graph.node(user)?.op()) {
            SchemaLookup::Unknown => return Ok(false),
            SchemaLookup::Known(def) => {
                if def.alias_kind == AliasAnalysisKind::Conservative
                    || def.schema.writes_argument(u.index)
                {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Integer list behind a value: a constant, or a list built from constants.
///
/// Lists that may be written, directly or through a container holding
/// them, are not static.
fn static_int_list(
    graph: &Graph,
    registry: &SchemaRegistry,
    alias: &AliasDb,
    value: ValueId,
) -> Result<Option<Vec<i64>>> {
    if alias.may_be_mutated(value) || alias.is_wildcard(value) {
        return Ok(None);
    }
    if !is_never_written(graph, registry, value)? {
        return Ok(None);
    }
    if let Some(constant) = graph.constant_value(value) {
        return Ok(match constant {
            ConstantValue::IntList(dims) => Some(dims),
            _ => None,
        });
    }
    let Some(producer) = graph.producer(value) else {
        return Ok(None);
    };
    let node = graph.node(producer)?;
    if node.op() != "prim::ListConstruct" {
        return Ok(None);
    }
    Ok(node
        .inputs()
        .iter()
        .map(|&v| graph.constant_value(v).and_then(|c| c.as_int()))
        .collect())
}

fn read_permutation(
    graph: &Graph,
    registry: &SchemaRegistry,
    alias: &AliasDb,
    id: NodeId,
) -> Result<Option<Permutation>> {
    let node = graph.node(id)?;
    let inputs = node.inputs();
    let permutation = match permutation_rule(registry, node.op()) {
        Some(ShapeRule::Permute) if inputs.len() == 2 => {
            static_int_list(graph, registry, alias, inputs[1])?.map(Permutation::Dims)
        }
        Some(ShapeRule::Transpose) if inputs.len() == 3 => {
            let dim = |v: ValueId| graph.constant_value(v).and_then(|c| c.as_int());
            match (dim(inputs[1]), dim(inputs[2])) {
                (Some(a), Some(b)) => Some(Permutation::Swap(a, b)),
                _ => None,
            }
        }
        _ => None,
    };
    Ok(permutation)
}

/// Find the first node of a cancelling pair ending at `second`.
fn match_pair(
    graph: &Graph,
    registry: &SchemaRegistry,
    alias: &AliasDb,
    second: NodeId,
) -> Result<Option<NodeId>> {
    let node = graph.node(second)?;
    if node.outputs().len() != 1 || permutation_rule(registry, node.op()).is_none() {
        return Ok(None);
    }
    let Some(&between) = node.inputs().first() else {
        return Ok(None);
    };
    let Some(first) = graph.producer(between) else {
        return Ok(None);
    };
    let uses = graph.value(between)?.uses();
    if uses.len() != 1 || uses[0].index != 0 || graph.node(first)?.outputs().len() != 1 {
        return Ok(None);
    }

    let (Some(p1), Some(p2)) = (
        read_permutation(graph, registry, alias, first)?,
        read_permutation(graph, registry, alias, second)?,
    ) else {
        return Ok(None);
    };

    let source = graph.node(first)?.inputs()[0];
    let rank = graph
        .record(source)?
        .shape
        .rank()
        .or_else(|| match (&p1, &p2) {
            (Permutation::Dims(d), _) | (_, Permutation::Dims(d)) => Some(d.len()),
            _ => p1.rank_hint().zip(p2.rank_hint()).map(|(a, b)| a.max(b)),
        });
    let Some(rank) = rank else {
        return Ok(None);
    };

    match (p1.resolve(rank), p2.resolve(rank)) {
        (Some(a), Some(b)) if composes_to_identity(&a, &b) => Ok(Some(first)),
        _ => Ok(None),
    }
}

impl Pass for EliminatePermutationsPass {
    fn name(&self) -> &str {
        "eliminate_permutations"
    }

    fn stage(&self) -> Stage {
        Stage::Peephole
    }

    fn requires(&self) -> &[Analysis] {
        &[Analysis::Alias]
    }

    fn invalidates(&self) -> &[Analysis] {
        &[Analysis::Alias]
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<bool> {
        // Removing nodes only drops writes, so facts from before the first
        // rewrite stay sound for the rest of the sweep.
        let alias = ctx.alias()?;
        let mut eliminated = 0;
        for second in graph.nodes_pre_order() {
            if !graph.contains_node(second) {
                continue;
            }
            let Some(first) = match_pair(graph, ctx.registry, alias, second)? else {
                continue;
            };

            let source = graph.node(first)?.inputs()[0];
            let result = graph.node(second)?.outputs()[0];
            graph.replace_all_uses_with(result, source)?;
            graph.remove_node(second)?;
            graph.remove_node(first)?;
            eliminated += 1;
        }

        if eliminated == 0 {
            return Ok(false);
        }
        if ctx.config.run_dead_code_elimination {
            eliminate_dead_code(graph, ctx.registry)?;
        }
        tracing::debug!(eliminated, "Eliminated permutation pairs");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use quench_core::{GraphBuilder, ParameterSnapshot, ShapeFact, TypeRecord, ValueType};

    fn run(graph: &mut Graph) -> bool {
        let registry = SchemaRegistry::with_defaults().unwrap();
        let snapshot = ParameterSnapshot::new();
        let config = PipelineConfig::default();
        let mut ctx = PassContext::new(&registry, &snapshot, &config);
        ctx.refresh_alias(graph).unwrap();
        EliminatePermutationsPass::new().run(graph, &mut ctx).unwrap()
    }

    fn permute_pair(p1: Vec<i64>, p2: Vec<i64>) -> (Graph, ValueId) {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let d1 = b.constant(ConstantValue::IntList(p1)).unwrap();
        let y = b.op("aten::permute", &[x, d1], ValueType::Tensor).unwrap();
        let d2 = b.constant(ConstantValue::IntList(p2)).unwrap();
        let z = b.op("aten::permute", &[y, d2], ValueType::Tensor).unwrap();
        let out = b.op("aten::relu", &[z], ValueType::Tensor).unwrap();
        b.output(out).unwrap();
        (b.finish().unwrap(), x)
    }

    fn count_op(graph: &Graph, op: &str) -> usize {
        graph
            .nodes_pre_order()
            .into_iter()
            .filter(|&n| graph.node(n).unwrap().op() == op)
            .count()
    }

    #[test]
    fn test_composes_to_identity() {
        assert!(composes_to_identity(&[1, 2, 0], &[2, 0, 1]));
        assert!(composes_to_identity(&[0, 1], &[0, 1]));
        assert!(!composes_to_identity(&[1, 2, 0], &[1, 2, 0]));
        assert!(!composes_to_identity(&[1, 0], &[0, 1, 2]));
    }

    #[test]
    fn test_inverse_pair_is_removed() {
        let (mut graph, x) = permute_pair(vec![0, 2, 3, 1], vec![0, 3, 1, 2]);
        assert!(run(&mut graph));
        assert_eq!(count_op(&graph, "aten::permute"), 0);
        assert_eq!(count_op(&graph, "prim::Constant"), 0);
        let relu = graph.node(graph.producer(graph.outputs()[0]).unwrap()).unwrap();
        assert_eq!(relu.inputs(), &[x]);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_negative_dims_are_normalized() {
        let (mut graph, _) = permute_pair(vec![0, 2, 3, 1], vec![0, -1, 1, 2]);
        assert!(run(&mut graph));
        assert_eq!(count_op(&graph, "aten::permute"), 0);
    }

    #[test]
    fn test_non_identity_pair_is_kept() {
        let (mut graph, _) = permute_pair(vec![1, 2, 0], vec![1, 2, 0]);
        let before = graph.to_string();
        assert!(!run(&mut graph));
        assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn test_intermediate_with_other_users_is_kept() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let dims = b.constant(ConstantValue::IntList(vec![1, 0])).unwrap();
        let y = b.op("aten::permute", &[x, dims], ValueType::Tensor).unwrap();
        let z = b.op("aten::permute", &[y, dims], ValueType::Tensor).unwrap();
        b.output(z).unwrap();
        b.output(y).unwrap();
        let mut graph = b.finish().unwrap();

        assert!(!run(&mut graph));
        assert_eq!(count_op(&graph, "aten::permute"), 2);
    }

    #[test]
    fn test_transpose_pair_uses_recorded_rank() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let a = b.constant(ConstantValue::Int(-1)).unwrap();
        let c = b.constant(ConstantValue::Int(1)).unwrap();
        let y = b.op("aten::transpose.int", &[x, c, a], ValueType::Tensor).unwrap();
        let z = b.op("aten::transpose.int", &[y, a, c], ValueType::Tensor).unwrap();
        b.output(z).unwrap();
        let mut graph = b.finish().unwrap();

        // Rank is needed to resolve the negative dim
        assert!(!run(&mut graph));
        graph
            .set_record(x, TypeRecord::tensor(ShapeFact::Known(vec![2, 3, 4]), None, None))
            .unwrap();
        assert!(run(&mut graph));
        assert_eq!(graph.outputs(), &[x]);
    }

    #[test]
    fn test_permute_then_transpose() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let dims = b.constant(ConstantValue::IntList(vec![1, 0, 2])).unwrap();
        let y = b.op("aten::permute", &[x, dims], ValueType::Tensor).unwrap();
        let zero = b.constant(ConstantValue::Int(0)).unwrap();
        let one = b.constant(ConstantValue::Int(1)).unwrap();
        let z = b.op("aten::transpose.int", &[y, zero, one], ValueType::Tensor).unwrap();
        b.output(z).unwrap();
        let mut graph = b.finish().unwrap();

        assert!(run(&mut graph));
        assert_eq!(graph.outputs(), &[x]);
    }

    #[test]
    fn test_dims_written_through_a_container_are_not_static() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let dims = b.constant(ConstantValue::IntList(vec![1, 0])).unwrap();
        let nested = b
            .op("prim::ListConstruct", &[dims], ValueType::List(Box::new(ValueType::IntList)))
            .unwrap();
        let zero = b.constant(ConstantValue::Int(0)).unwrap();
        let inner = b
            .op("aten::__getitem__.t", &[nested, zero], ValueType::IntList)
            .unwrap();
        let two = b.constant(ConstantValue::Int(2)).unwrap();
        let grown = b.op("aten::append.t", &[inner, two], ValueType::IntList).unwrap();
        let y = b.op("aten::permute", &[x, dims], ValueType::Tensor).unwrap();
        let z = b.op("aten::permute", &[y, dims], ValueType::Tensor).unwrap();
        b.output(z).unwrap();
        b.output(grown).unwrap();
        let mut graph = b.finish().unwrap();
        let before = graph.to_string();

        assert!(!run(&mut graph));
        assert_eq!(count_op(&graph, "aten::permute"), 2);
        assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn test_dims_built_from_constants() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", ValueType::Tensor);
        let zero = b.constant(ConstantValue::Int(0)).unwrap();
        let one = b.constant(ConstantValue::Int(1)).unwrap();
        let dims = b
            .op("prim::ListConstruct", &[one, zero], ValueType::List(Box::new(ValueType::Int)))
            .unwrap();
        let y = b.op("aten::permute", &[x, dims], ValueType::Tensor).unwrap();
        let z = b.op("aten::permute", &[y, dims], ValueType::Tensor).unwrap();
        b.output(z).unwrap();
        let mut graph = b.finish().unwrap();

        assert!(run(&mut graph));
        assert_eq!(graph.outputs(), &[x]);
        assert_eq!(graph.node_count(), 0);
    }
}
