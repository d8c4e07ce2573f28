//! Shape, dtype, device and constant-value propagation.
//!
//! A forward dataflow fixpoint over the flattened block hierarchy. Node
//! outputs are recomputed by per-operator transfer functions; loop-carried
//! parameters and control-node outputs are the join of every incoming path.
//! A value's state only ever moves toward `Unknown`, and each move costs one
//! step, so the step count is bounded by the lattice height times the number
//! of values. Exceeding that bound is reported as non-termination.

use crate::analysis::AliasDb;
use quench_core::record::MAX_RANK;
use quench_core::{
    ConstantValue, Error, Fact, Graph, NodeId, Result, SchemaLookup, SchemaRegistry, ShapeFact,
    ShapeRule, TypeRecord, User, ValueId, ValueType,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Fixpoint result: one record per reached value.
#[derive(Debug)]
pub struct ShapeAnalysis {
    records: HashMap<ValueId, TypeRecord>,
    steps: usize,
}

impl ShapeAnalysis {
    /// Run the analysis.
    ///
    /// With an alias database, constant-value facts survive on mutable values
    /// that are never written; without one they are dropped.
    #[tracing::instrument(skip_all, fields(values = graph.value_count()))]
    pub fn run(graph: &Graph, registry: &SchemaRegistry, alias: Option<&AliasDb>) -> Result<Self> {
        let limit = graph.value_capacity().max(1) * (MAX_RANK + 8);
        let mut solver = Solver {
            graph,
            registry,
            alias,
            state: HashMap::new(),
            worklist: VecDeque::new(),
            queued: HashSet::new(),
            steps: 0,
            limit,
        };

        for &input in graph.inputs() {
            let record = solver.seal(input, graph.record(input)?.clone());
            solver.state.insert(input, record);
        }
        for node in graph.nodes_pre_order() {
            solver.enqueue(node);
        }
        while let Some(node) = solver.worklist.pop_front() {
            solver.queued.remove(&node);
            solver.visit(node)?;
        }

        tracing::debug!(
            values = solver.state.len(),
            steps = solver.steps,
            "Shape analysis reached fixpoint"
        );
        Ok(Self {
            records: solver.state,
            steps: solver.steps,
        })
    }

    /// Computed record of a value.
    pub fn record(&self, value: ValueId) -> Option<&TypeRecord> {
        self.records.get(&value)
    }

    /// Number of state changes it took to reach the fixpoint.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Refine the records stored in the graph with the computed ones.
    ///
    /// Shape, dtype and device facts never lose precision. Constant-value
    /// facts are replaced, since a value fact the analysis could not confirm
    /// may have been invalidated by a write.
    pub fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for (&value, computed) in &self.records {
            if !graph.contains_value(value) {
                continue;
            }
            let old = graph.record(value)?;
            let mut refined = computed.refine(old);
            refined.value = computed.value.clone();
            if &refined != old {
                graph.set_record(value, refined)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

struct Solver<'a> {
    graph: &'a Graph,
    registry: &'a SchemaRegistry,
    alias: Option<&'a AliasDb>,
    state: HashMap<ValueId, TypeRecord>,
    worklist: VecDeque<NodeId>,
    queued: HashSet<NodeId>,
    steps: usize,
    limit: usize,
}

impl Solver<'_> {
    fn enqueue(&mut self, node: NodeId) {
        if self.queued.insert(node) {
            self.worklist.push_back(node);
        }
    }

    fn get(&self, value: ValueId) -> TypeRecord {
        self.state.get(&value).cloned().unwrap_or_default()
    }

    /// Drop value facts the alias information cannot vouch for.
    fn seal(&self, value: ValueId, record: TypeRecord) -> TypeRecord {
        let mutable = self
            .graph
            .value(value)
            .map(|v| v.ty.is_mutable())
            .unwrap_or(true);
        let trusted = match self.alias {
            Some(alias) => !alias.may_be_mutated(value) && !alias.is_wildcard(value),
            None => false,
        };
        if mutable && !trusted {
            record.without_value()
        } else {
            record
        }
    }

    /// Lower the state of a value, waking its users on change.
    fn update(&mut self, value: ValueId, record: TypeRecord) -> Result<()> {
        let record = self.seal(value, record);
        let next = match self.state.get(&value) {
            None => record,
            Some(old) => {
                let joined = old.join(&record);
                if &joined == old {
                    return Ok(());
                }
                joined
            }
        };
        self.state.insert(value, next);

        self.steps += 1;
        if self.steps > self.limit {
            return Err(Error::AnalysisNonTermination {
                analysis: "shape analysis".to_string(),
                limit: self.limit,
            });
        }

        let graph = self.graph;
        for u in graph.value(value)?.uses() {
            match u.user {
                User::Node(node) => self.enqueue(node),
                User::Return(block) => {
                    if let Some(owner) = graph.block(block)?.owner() {
                        self.enqueue(owner);
                    }
                }
            }
        }
        Ok(())
    }

    fn visit(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        if !graph.contains_node(id) {
            return Ok(());
        }
        let node = graph.node(id)?;
        match node.op() {
            "prim::Loop" => return self.visit_loop(id),
            "prim::If" => return self.visit_if(id),
            _ => {}
        }

        let inputs: Vec<TypeRecord> = node.inputs().iter().map(|&v| self.get(v)).collect();
        let rule = match self.registry.resolve(node.op()) {
            SchemaLookup::Known(def) => def.shape_rule,
            SchemaLookup::Unknown => ShapeRule::None,
        };
        let outputs = transfer(graph, id, rule, &inputs, self.alias)?;
        for (&output, record) in node.outputs().iter().zip(outputs) {
            self.update(output, record)?;
        }
        Ok(())
    }

    fn visit_loop(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        graph.check_encoding(id)?;
        let node = graph.node(id)?;
        let body = graph.block(node.blocks()[0])?;
        let inputs = node.inputs();

        self.update(body.params()[0], TypeRecord::unknown())?;
        for (k, &output) in node.outputs().iter().enumerate() {
            let entry = self.get(inputs[2 + k]);
            let merged = match self.state.get(&body.returns()[1 + k]) {
                Some(back) => entry.join(back),
                None => entry,
            };
            self.update(body.params()[1 + k], merged.clone())?;
            self.update(output, merged)?;
        }
        Ok(())
    }

    fn visit_if(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        graph.check_encoding(id)?;
        let node = graph.node(id)?;
        let cond = self.get(node.inputs()[0]).constant().and_then(ConstantValue::as_bool);
        let branches: Vec<_> = match cond {
            Some(true) => vec![node.blocks()[0]],
            Some(false) => vec![node.blocks()[1]],
            None => node.blocks().to_vec(),
        };

        for (k, &output) in node.outputs().iter().enumerate() {
            let mut merged: Option<TypeRecord> = None;
            for &block in &branches {
                let Some(record) = self.state.get(&graph.block(block)?.returns()[k]) else {
                    continue;
                };
                merged = Some(match merged {
                    Some(m) => m.join(record),
                    None => record.clone(),
                });
            }
            if let Some(record) = merged {
                self.update(output, record)?;
            }
        }
        Ok(())
    }
}

/// Compute output records of a node from its input records.
fn transfer(
    graph: &Graph,
    id: NodeId,
    rule: ShapeRule,
    inputs: &[TypeRecord],
    alias: Option<&AliasDb>,
) -> Result<Vec<TypeRecord>> {
    let node = graph.node(id)?;
    let arity = node.outputs().len();
    let unknown = || vec![TypeRecord::unknown(); arity];
    let int_at = |i: usize| inputs.get(i).and_then(|r| r.constant()).and_then(ConstantValue::as_int);
    let list_at = |i: usize| {
        inputs.get(i).and_then(|r| match r.constant() {
            Some(ConstantValue::IntList(v)) => Some(v.clone()),
            Some(ConstantValue::Int(v)) => Some(vec![*v]),
            _ => None,
        })
    };
    let single = |record: TypeRecord| {
        let mut out = unknown();
        if let Some(first) = out.first_mut() {
            *first = record;
        }
        out
    };

    let out = match rule {
        ShapeRule::None => unknown(),
        ShapeRule::Constant => match node.attribute("value") {
            Some(value) => single(TypeRecord::from_constant(value)),
            None => unknown(),
        },
        ShapeRule::SameAsInput => match inputs.first() {
            Some(input) => single(input.clone().without_value()),
            None => unknown(),
        },
        ShapeRule::Elementwise => {
            let tensors: Vec<&TypeRecord> = node
                .inputs()
                .iter()
                .zip(inputs)
                .filter(|(&v, _)| graph.value(v).map(|v| v.ty.is_tensor()).unwrap_or(false))
                .map(|(_, r)| r)
                .collect();
            single(elementwise(&tensors))
        }
        ShapeRule::Reduction => {
            let input = inputs.first().cloned().unwrap_or_default();
            let keepdim = inputs
                .get(2)
                .and_then(|r| r.constant())
                .and_then(ConstantValue::as_bool)
                .unwrap_or(false);
            let shape = reduce(&input.shape, list_at(1), keepdim);
            let dtype = match input.dtype.known() {
                Some(d) if d.is_floating_point() => input.dtype.clone(),
                _ => Fact::Unknown,
            };
            single(TypeRecord {
                shape,
                dtype,
                device: input.device.clone(),
                value: Fact::Unknown,
            })
        }
        ShapeRule::Reshape => {
            let input = inputs.first().cloned().unwrap_or_default();
            let shape = reshape(&input.shape, list_at(1));
            single(TypeRecord {
                shape,
                ..input.without_value()
            })
        }
        ShapeRule::Permute => {
            let input = inputs.first().cloned().unwrap_or_default();
            let shape = match list_at(1) {
                Some(perm) => permute(&input.shape, &perm),
                None => ShapeFact::Unknown,
            };
            single(TypeRecord {
                shape,
                ..input.without_value()
            })
        }
        ShapeRule::Transpose => {
            let input = inputs.first().cloned().unwrap_or_default();
            let shape = match (input.shape.rank(), int_at(1), int_at(2)) {
                (Some(rank), Some(a), Some(b)) => match (normalize_dim(a, rank), normalize_dim(b, rank)) {
                    (Some(a), Some(b)) => {
                        let mut perm: Vec<i64> = (0..rank as i64).collect();
                        perm.swap(a, b);
                        permute(&input.shape, &perm)
                    }
                    _ => ShapeFact::Unknown,
                },
                (Some(rank), _, _) => ShapeFact::of_rank(rank),
                _ => ShapeFact::Unknown,
            };
            single(TypeRecord {
                shape,
                ..input.without_value()
            })
        }
        ShapeRule::MatMul => match (inputs.first(), inputs.get(1)) {
            (Some(a), Some(b)) => single(TypeRecord {
                shape: matmul(&a.shape, &b.shape),
                dtype: a.dtype.join(&b.dtype),
                device: a.device.join(&b.device),
                value: Fact::Unknown,
            }),
            _ => unknown(),
        },
        ShapeRule::SizeOf => {
            let input = inputs.first().cloned().unwrap_or_default();
            let size = match (input.shape.rank(), int_at(1)) {
                (Some(rank), Some(dim)) => normalize_dim(dim, rank).and_then(|d| input.shape.dim(d)),
                _ => None,
            };
            match size {
                Some(size) => single(TypeRecord::from_constant(&ConstantValue::Int(size as i64))),
                None => unknown(),
            }
        }
        ShapeRule::IntArith(op) => match (int_at(0), int_at(1)) {
            (Some(a), Some(b)) => match op.apply(a, b) {
                Some(result) => single(TypeRecord::from_constant(&ConstantValue::Int(result))),
                None => unknown(),
            },
            _ => unknown(),
        },
        ShapeRule::ListConstruct => {
            let ints: Option<Vec<i64>> = (0..inputs.len()).map(int_at).collect();
            let is_int_list = node
                .outputs()
                .first()
                .and_then(|&out| graph.value(out).ok())
                .map(|v| matches!(&v.ty, ValueType::IntList) || v.ty == ValueType::List(Box::new(ValueType::Int)))
                .unwrap_or(false);
            match ints {
                Some(ints) if is_int_list => single(TypeRecord::unknown().with_value(ConstantValue::IntList(ints))),
                _ => unknown(),
            }
        }
        ShapeRule::ListLength => {
            let from_value = list_at(0).map(|l| l.len());
            let from_producer = || {
                let &list = node.inputs().first()?;
                let producer = graph.node(graph.producer(list)?).ok()?;
                let unmutated = alias.is_some_and(|a| !a.may_be_mutated(list) && !a.is_wildcard(list));
                (producer.op() == "prim::ListConstruct" && unmutated).then(|| producer.inputs().len())
            };
            match from_value.or_else(from_producer) {
                Some(len) => single(TypeRecord::from_constant(&ConstantValue::Int(len as i64))),
                None => unknown(),
            }
        }
        ShapeRule::ListUnpack => match list_at(0) {
            Some(items) if items.len() == arity => items
                .into_iter()
                .map(|i| TypeRecord::from_constant(&ConstantValue::Int(i)))
                .collect(),
            _ => unknown(),
        },
    };
    Ok(out)
}

/// Normalize a possibly negative dimension index.
pub(crate) fn normalize_dim(dim: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let dim = if dim < 0 { dim + rank } else { dim };
    (0..rank).contains(&dim).then_some(dim as usize)
}

/// Broadcast per-dimension knowledge, right-aligned.
fn broadcast(a: &[Option<usize>], b: &[Option<usize>]) -> Option<Vec<Option<usize>>> {
    let rank = a.len().max(b.len());
    let mut out = vec![None; rank];
    for i in 0..rank {
        let x = if i < rank - a.len() { Some(1) } else { a[i - (rank - a.len())] };
        let y = if i < rank - b.len() { Some(1) } else { b[i - (rank - b.len())] };
        out[i] = match (x, y) {
            (Some(x), Some(y)) if x == y => Some(x),
            (Some(1), y) | (y, Some(1)) => y,
            (Some(_), Some(_)) => return None,
            (Some(d), None) | (None, Some(d)) => Some(d),
            (None, None) => None,
        };
    }
    Some(out)
}

fn elementwise(tensors: &[&TypeRecord]) -> TypeRecord {
    let Some((first, rest)) = tensors.split_first() else {
        return TypeRecord::unknown();
    };
    let mut dims = first.shape.dims();
    let mut dtype = first.dtype.clone();
    let mut device = first.device.clone();
    for record in rest {
        dims = match (dims, record.shape.dims()) {
            (Some(a), Some(b)) => broadcast(&a, &b),
            _ => None,
        };
        dtype = dtype.join(&record.dtype);
        device = device.join(&record.device);
    }
    TypeRecord {
        shape: dims.map(ShapeFact::from_dims).unwrap_or_default(),
        dtype,
        device,
        value: Fact::Unknown,
    }
}

fn reduce(shape: &ShapeFact, dims: Option<Vec<i64>>, keepdim: bool) -> ShapeFact {
    let Some(input) = shape.dims() else {
        return ShapeFact::Unknown;
    };
    let rank = input.len();
    let Some(dims) = dims else {
        return if keepdim { ShapeFact::of_rank(rank) } else { ShapeFact::Unknown };
    };
    let reduced: Option<HashSet<usize>> = if dims.is_empty() {
        Some((0..rank).collect())
    } else {
        dims.iter().map(|&d| normalize_dim(d, rank)).collect()
    };
    let Some(reduced) = reduced else {
        return ShapeFact::Unknown;
    };

    let out = input
        .into_iter()
        .enumerate()
        .filter_map(|(i, d)| match (reduced.contains(&i), keepdim) {
            (true, true) => Some(Some(1)),
            (true, false) => None,
            (false, _) => Some(d),
        })
        .collect();
    ShapeFact::from_dims(out)
}

fn reshape(input: &ShapeFact, target: Option<Vec<i64>>) -> ShapeFact {
    let Some(target) = target else {
        return ShapeFact::Unknown;
    };
    if target.iter().any(|&d| d < -1) || target.iter().filter(|&&d| d == -1).count() > 1 {
        return ShapeFact::Unknown;
    }
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let numel: Option<usize> = input.as_known().map(|dims| dims.iter().product());
    let inferred = match numel {
        Some(n) if known > 0 && n % known == 0 => Some(n / known),
        _ => None,
    };
    ShapeFact::from_dims(
        target
            .iter()
            .map(|&d| if d == -1 { inferred } else { Some(d as usize) })
            .collect(),
    )
}

fn permute(input: &ShapeFact, perm: &[i64]) -> ShapeFact {
    let rank = perm.len();
    let normalized: Option<Vec<usize>> = perm.iter().map(|&d| normalize_dim(d, rank)).collect();
    let Some(normalized) = normalized else {
        return ShapeFact::Unknown;
    };
    let distinct: HashSet<usize> = normalized.iter().copied().collect();
    if distinct.len() != rank {
        return ShapeFact::Unknown;
    }
    match input.dims() {
        Some(dims) if dims.len() == rank => {
            ShapeFact::from_dims(normalized.iter().map(|&p| dims[p]).collect())
        }
        Some(_) => ShapeFact::Unknown,
        None => ShapeFact::of_rank(rank),
    }
}

fn matmul(a: &ShapeFact, b: &ShapeFact) -> ShapeFact {
    let (Some(a), Some(b)) = (a.dims(), b.dims()) else {
        return ShapeFact::Unknown;
    };
    match (a.len(), b.len()) {
        (0, _) | (_, 0) => ShapeFact::Unknown,
        (1, 1) => ShapeFact::Known(vec![]),
        (2, 1) => ShapeFact::from_dims(vec![a[0]]),
        (1, 2) => ShapeFact::from_dims(vec![b[1]]),
        (ra, rb) if ra >= 2 && rb >= 2 => {
            let Some(mut out) = broadcast(&a[..ra - 2], &b[..rb - 2]) else {
                return ShapeFact::Unknown;
            };
            out.push(a[ra - 2]);
            out.push(b[rb - 1]);
            ShapeFact::from_dims(out)
        }
        _ => ShapeFact::Unknown,
    }
}
