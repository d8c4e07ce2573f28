//! Common test utilities for pipeline tests.
//!
//! Holds graph builders shared across the integration tests and a small
//! reference interpreter used to compare a graph's observable outputs before
//! and after rewriting.

#![allow(dead_code)]

use quench_core::{
    BlockId, ConstantValue, Graph, ModuleSnapshot, NodeId, SchemaRegistry, TensorData, TensorValue,
    ValueId,
};
use std::collections::HashMap;

/// Install a test log subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn registry() -> SchemaRegistry {
    SchemaRegistry::with_defaults().expect("built-in catalog parses")
}

/// Build an f32 tensor of the given shape.
pub fn tensor(values: Vec<f32>, shape: Vec<usize>) -> ConstantValue {
    ConstantValue::Tensor(TensorValue::new(TensorData::F32(values), shape).expect("valid tensor"))
}

/// Count live nodes with the given operator, nested blocks included.
pub fn count_op(graph: &Graph, op: &str) -> usize {
    graph
        .nodes_pre_order()
        .into_iter()
        .filter(|&n| graph.node(n).map(|node| node.op() == op).unwrap_or(false))
        .count()
}

/// Evaluate a graph on concrete inputs.
///
/// Module-typed values are represented by their attribute path as a string
/// (pass `ConstantValue::Str(String::new())` for the root module); attribute
/// reads resolve against `snapshot`. Supports the operators the integration
/// tests use and panics on anything else.
pub fn interpret(
    graph: &Graph,
    snapshot: &dyn ModuleSnapshot,
    inputs: &[ConstantValue],
) -> Vec<ConstantValue> {
    let mut interpreter = Interpreter {
        graph,
        snapshot,
        env: HashMap::new(),
    };
    for (&param, value) in graph.inputs().iter().zip(inputs) {
        interpreter.env.insert(param, value.clone());
    }
    interpreter.run_block(graph.root())
}

struct Interpreter<'a> {
    graph: &'a Graph,
    snapshot: &'a dyn ModuleSnapshot,
    env: HashMap<ValueId, ConstantValue>,
}

impl Interpreter<'_> {
    fn get(&self, value: ValueId) -> ConstantValue {
        self.env
            .get(&value)
            .cloned()
            .unwrap_or_else(|| panic!("value {value:?} read before definition"))
    }

    fn int(&self, value: ValueId) -> i64 {
        self.get(value).as_int().expect("int operand")
    }

    fn tensor(&self, value: ValueId) -> TensorValue {
        self.get(value).as_tensor().cloned().expect("tensor operand")
    }

    fn run_block(&mut self, block: BlockId) -> Vec<ConstantValue> {
        let graph = self.graph;
        let data = graph.block(block).unwrap();
        for &node in data.nodes() {
            self.run_node(node);
        }
        data.returns().iter().map(|&v| self.get(v)).collect()
    }

    fn run_node(&mut self, id: NodeId) {
        let graph = self.graph;
        let node = graph.node(id).unwrap();
        let inputs = node.inputs();

        let outputs: Vec<ConstantValue> = match node.op() {
            "prim::Constant" => vec![node.attribute("value").cloned().unwrap()],
            "prim::GetAttr" => {
                let parent = self.get(inputs[0]);
                let parent = parent.as_str().expect("module operand");
                let name = node.str_attribute("name").unwrap();
                let path = if parent.is_empty() {
                    name.to_string()
                } else {
                    format!("{parent}.{name}")
                };
                let output = node.outputs()[0];
                if graph.value(output).unwrap().ty.is_module() {
                    vec![ConstantValue::Str(path)]
                } else {
                    vec![self.snapshot.get(&path).cloned().expect("attribute in snapshot")]
                }
            }
            "prim::Loop" => {
                let body = node.blocks()[0];
                let params = graph.block(body).unwrap().params().to_vec();
                let trip_count = self.int(inputs[0]);
                let mut cond = self.get(inputs[1]).as_bool().unwrap();
                let mut carried: Vec<ConstantValue> = inputs[2..].iter().map(|&v| self.get(v)).collect();
                let mut i = 0;
                while i < trip_count && cond {
                    self.env.insert(params[0], ConstantValue::Int(i));
                    for (&param, value) in params[1..].iter().zip(&carried) {
                        self.env.insert(param, value.clone());
                    }
                    let mut returns = self.run_block(body);
                    cond = returns.remove(0).as_bool().unwrap();
                    carried = returns;
                    i += 1;
                }
                carried
            }
            "prim::If" => {
                let branch = if self.get(inputs[0]).as_bool().unwrap() {
                    node.blocks()[0]
                } else {
                    node.blocks()[1]
                };
                self.run_block(branch)
            }
            "prim::ListConstruct" => {
                vec![ConstantValue::IntList(inputs.iter().map(|&v| self.int(v)).collect())]
            }
            "aten::add.Tensor" => vec![binary(&self.tensor(inputs[0]), &self.tensor(inputs[1]), |a, b| a + b)],
            "aten::sub.Tensor" => vec![binary(&self.tensor(inputs[0]), &self.tensor(inputs[1]), |a, b| a - b)],
            "aten::mul.Tensor" => vec![binary(&self.tensor(inputs[0]), &self.tensor(inputs[1]), |a, b| a * b)],
            "aten::relu" => vec![unary(&self.tensor(inputs[0]), |a| a.max(0.0))],
            "aten::tanh" => vec![unary(&self.tensor(inputs[0]), f32::tanh)],
            "aten::permute" => {
                let t = self.tensor(inputs[0]);
                let dims = self.get(inputs[1]).as_int_list().unwrap().to_vec();
                let rank = t.shape.len() as i64;
                let perm: Vec<usize> = dims
                    .iter()
                    .map(|&d| (if d < 0 { d + rank } else { d }) as usize)
                    .collect();
                vec![permute(&t, &perm)]
            }
            "aten::transpose.int" => {
                let t = self.tensor(inputs[0]);
                let rank = t.shape.len() as i64;
                let norm = |d: i64| (if d < 0 { d + rank } else { d }) as usize;
                let mut perm: Vec<usize> = (0..t.shape.len()).collect();
                perm.swap(norm(self.int(inputs[1])), norm(self.int(inputs[2])));
                vec![permute(&t, &perm)]
            }
            "aten::size.int" => {
                let t = self.tensor(inputs[0]);
                let rank = t.shape.len() as i64;
                let d = self.int(inputs[1]);
                let d = if d < 0 { d + rank } else { d };
                vec![ConstantValue::Int(t.shape[d as usize] as i64)]
            }
            "aten::add.int" => vec![ConstantValue::Int(self.int(inputs[0]) + self.int(inputs[1]))],
            "aten::mul.int" => vec![ConstantValue::Int(self.int(inputs[0]) * self.int(inputs[1]))],
            other => panic!("reference interpreter does not support {other}"),
        };

        for (&output, value) in node.outputs().iter().zip(outputs) {
            self.env.insert(output, value);
        }
    }
}

fn unary(t: &TensorValue, f: impl Fn(f32) -> f32) -> ConstantValue {
    let data = t.as_f32().unwrap().iter().map(|&a| f(a)).collect();
    ConstantValue::Tensor(TensorValue::new(TensorData::F32(data), t.shape.clone()).unwrap())
}

/// Elementwise binary op; a single-element operand broadcasts.
fn binary(a: &TensorValue, b: &TensorValue, f: impl Fn(f32, f32) -> f32) -> ConstantValue {
    let (x, y) = (a.as_f32().unwrap(), b.as_f32().unwrap());
    let (shape, data) = if x.len() == y.len() {
        (a.shape.clone(), x.iter().zip(y).map(|(&p, &q)| f(p, q)).collect())
    } else if y.len() == 1 {
        (a.shape.clone(), x.iter().map(|&p| f(p, y[0])).collect())
    } else if x.len() == 1 {
        (b.shape.clone(), y.iter().map(|&q| f(x[0], q)).collect())
    } else {
        panic!("incompatible shapes {:?} and {:?}", a.shape, b.shape);
    };
    ConstantValue::Tensor(TensorValue::new(TensorData::F32(data), shape).unwrap())
}

/// Output dim `i` reads input dim `perm[i]`.
fn permute(t: &TensorValue, perm: &[usize]) -> ConstantValue {
    let data = t.as_f32().unwrap();
    let shape = &t.shape;
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();

    let mut out = Vec::with_capacity(data.len());
    for flat in 0..data.len() {
        let mut rem = flat;
        let mut src = 0;
        for d in (0..out_shape.len()).rev() {
            let index = rem % out_shape[d];
            rem /= out_shape[d];
            src += index * strides[perm[d]];
        }
        out.push(data[src]);
    }
    ConstantValue::Tensor(TensorValue::new(TensorData::F32(out), out_shape).unwrap())
}
