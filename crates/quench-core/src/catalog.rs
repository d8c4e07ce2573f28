//! Built-in operator catalog.

use crate::registry::{AliasAnalysisKind, ArithOp, OperatorDef, SchemaRegistry, ShapeRule};
use crate::schema::Schema;
use crate::Result;

use AliasAnalysisKind::{Conservative, FromSchema, InternalSpecialCase, PureFunction};

struct Entry {
    signature: &'static str,
    alias_kind: AliasAnalysisKind,
    shape_rule: ShapeRule,
    side_effects: bool,
}

const fn op(signature: &'static str, alias_kind: AliasAnalysisKind, shape_rule: ShapeRule) -> Entry {
    Entry {
        signature,
        alias_kind,
        shape_rule,
        side_effects: false,
    }
}

const fn effectful(signature: &'static str, alias_kind: AliasAnalysisKind) -> Entry {
    Entry {
        signature,
        alias_kind,
        shape_rule: ShapeRule::None,
        side_effects: true,
    }
}

const BUILTINS: &[Entry] = &[
    // Structural
    op("prim::Constant() -> Any", InternalSpecialCase, ShapeRule::Constant),
    op("prim::GetAttr(Module self) -> Any", InternalSpecialCase, ShapeRule::None),
    effectful("prim::SetAttr(Module self, Any value) -> ()", InternalSpecialCase),
    op("prim::Loop(int max_trip_count, bool cond, ...) -> ...", InternalSpecialCase, ShapeRule::None),
    op("prim::If(bool cond) -> ...", InternalSpecialCase, ShapeRule::None),
    effectful("prim::Print(...) -> ()", PureFunction),
    effectful("prim::RaiseException(str msg) -> ()", PureFunction),
    effectful("prim::PythonOp(...) -> ...", Conservative),
    // Containers
    op("prim::ListConstruct(...) -> Any", InternalSpecialCase, ShapeRule::ListConstruct),
    op("prim::ListUnpack(Any list) -> ...", InternalSpecialCase, ShapeRule::ListUnpack),
    op("prim::TupleConstruct(...) -> Any", InternalSpecialCase, ShapeRule::None),
    op("prim::TupleUnpack(Any tup) -> ...", InternalSpecialCase, ShapeRule::None),
    op("aten::__getitem__.t(t[](a) list, int idx) -> t(*)", InternalSpecialCase, ShapeRule::None),
    op("aten::append.t(t[](a!) self, t(c -> *) el) -> t[](a!)", InternalSpecialCase, ShapeRule::None),
    op("aten::len.t(t[] a) -> int", FromSchema, ShapeRule::ListLength),
    // Elementwise
    op("aten::add.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::sub.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::mul.Tensor(Tensor self, Tensor other) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::div.Tensor(Tensor self, Tensor other) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::relu(Tensor self) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::sigmoid(Tensor self) -> Tensor", FromSchema, ShapeRule::Elementwise),
    op("aten::tanh(Tensor self) -> Tensor", FromSchema, ShapeRule::Elementwise),
    // In-place
    op("aten::add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)", FromSchema, ShapeRule::SameAsInput),
    op("aten::mul_.Tensor(Tensor(a!) self, Tensor other) -> Tensor(a!)", FromSchema, ShapeRule::SameAsInput),
    op("aten::relu_(Tensor(a!) self) -> Tensor(a!)", FromSchema, ShapeRule::SameAsInput),
    op("aten::copy_(Tensor(a!) self, Tensor src, bool non_blocking=False) -> Tensor(a!)", FromSchema, ShapeRule::SameAsInput),
    op("aten::zero_(Tensor(a!) self) -> Tensor(a!)", FromSchema, ShapeRule::SameAsInput),
    // Linear algebra and reductions
    op("aten::matmul(Tensor self, Tensor other) -> Tensor", FromSchema, ShapeRule::MatMul),
    op("aten::linear(Tensor input, Tensor weight, Tensor? bias=None) -> Tensor", FromSchema, ShapeRule::None),
    op("aten::sum.dim_IntList(Tensor self, int[1]? dim, bool keepdim=False, *, ScalarType? dtype=None) -> Tensor", FromSchema, ShapeRule::Reduction),
    op("aten::mean.dim(Tensor self, int[1]? dim, bool keepdim=False, *, ScalarType? dtype=None) -> Tensor", FromSchema, ShapeRule::Reduction),
    // Views and layout
    op("aten::reshape(Tensor(a) self, SymInt[] shape) -> Tensor(a)", FromSchema, ShapeRule::Reshape),
    op("aten::view(Tensor(a) self, SymInt[] size) -> Tensor(a)", FromSchema, ShapeRule::Reshape),
    op("aten::permute(Tensor(a) self, int[] dims) -> Tensor(a)", FromSchema, ShapeRule::Permute),
    op("aten::transpose.int(Tensor(a) self, int dim0, int dim1) -> Tensor(a)", FromSchema, ShapeRule::Transpose),
    op("aten::contiguous(Tensor(a) self, *, MemoryFormat memory_format=contiguous_format) -> Tensor(a)", FromSchema, ShapeRule::SameAsInput),
    op("aten::clone(Tensor self, *, MemoryFormat? memory_format=None) -> Tensor", FromSchema, ShapeRule::SameAsInput),
    op("aten::dropout(Tensor input, float p, bool train) -> Tensor", FromSchema, ShapeRule::SameAsInput),
    op("aten::cat(Tensor[] tensors, int dim=0) -> Tensor", FromSchema, ShapeRule::None),
    op("aten::item(Tensor self) -> Scalar", FromSchema, ShapeRule::None),
    // Scalars
    op("aten::size.int(Tensor self, int dim) -> int", FromSchema, ShapeRule::SizeOf),
    op("aten::add.int(int a, int b) -> int", FromSchema, ShapeRule::IntArith(ArithOp::Add)),
    op("aten::sub.int(int a, int b) -> int", FromSchema, ShapeRule::IntArith(ArithOp::Sub)),
    op("aten::mul.int(int a, int b) -> int", FromSchema, ShapeRule::IntArith(ArithOp::Mul)),
    op("aten::floordiv.int(int a, int b) -> int", FromSchema, ShapeRule::IntArith(ArithOp::FloorDiv)),
    op("aten::eq.int(int a, int b) -> bool", FromSchema, ShapeRule::None),
    op("aten::lt.int(int a, int b) -> bool", FromSchema, ShapeRule::None),
];

/// Register every built-in operator.
pub(crate) fn register_builtins(registry: &mut SchemaRegistry) -> Result<()> {
    for entry in BUILTINS {
        let mut def = OperatorDef::new(Schema::parse(entry.signature)?)
            .with_alias_kind(entry.alias_kind)
            .with_shape_rule(entry.shape_rule);
        if entry.side_effects {
            def = def.with_side_effects();
        }
        registry.register(def);
    }
    tracing::debug!(operators = registry.len(), "Registered built-in operators");
    Ok(())
}
