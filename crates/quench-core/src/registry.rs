//! Schema registry: a closed operator lookup table built once at startup.

use crate::ir::Graph;
use crate::schema::Schema;
use crate::{Error, Result};
use std::collections::HashMap;

/// How alias analysis treats an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAnalysisKind {
    /// Follow the alias annotations of the schema.
    FromSchema,
    /// Aliasing is unknown: link every mutable input and output to the
    /// wildcard location and assume it is written.
    Conservative,
    /// No output aliases any input and nothing is written.
    PureFunction,
    /// Handled by dedicated rules (control flow, containers, attributes).
    InternalSpecialCase,
}

/// Integer operation of a scalar arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
}

impl ArithOp {
    /// Evaluate on constants. `None` on overflow or division by zero.
    pub fn apply(&self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            ArithOp::Add => lhs.checked_add(rhs),
            ArithOp::Sub => lhs.checked_sub(rhs),
            ArithOp::Mul => lhs.checked_mul(rhs),
            ArithOp::FloorDiv => {
                if rhs == 0 {
                    return None;
                }
                let quotient = lhs.checked_div(rhs)?;
                if (lhs % rhs != 0) && ((lhs < 0) != (rhs < 0)) {
                    Some(quotient - 1)
                } else {
                    Some(quotient)
                }
            }
        }
    }
}

/// Shape/dtype/constant propagation rule of an operator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    /// Nothing is derived; outputs are `Unknown`.
    None,
    /// `prim::Constant`: the record is exact.
    Constant,
    /// Output has the input's shape, dtype and device.
    SameAsInput,
    /// Broadcasting elementwise operation.
    Elementwise,
    /// Reduction over the dims given by input 1, honoring `keepdim` (input 2).
    Reduction,
    /// Target shape is given by the constant int list in input 1.
    Reshape,
    /// Dimension order is given by the constant int list in input 1.
    Permute,
    /// Swap the dims given by inputs 1 and 2.
    Transpose,
    MatMul,
    /// Constant size of one dimension (input 1) of a tensor.
    SizeOf,
    IntArith(ArithOp),
    ListConstruct,
    ListLength,
    ListUnpack,
}

/// One registry entry.
#[derive(Debug, Clone)]
pub struct OperatorDef {
    pub schema: Schema,
    pub alias_kind: AliasAnalysisKind,
    pub shape_rule: ShapeRule,
    /// Observable effect beyond its outputs (printing, raising, attribute
    /// stores). Such nodes are never removed as dead.
    pub has_side_effects: bool,
}

impl OperatorDef {
    /// Create a definition that follows its schema annotations.
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            alias_kind: AliasAnalysisKind::FromSchema,
            shape_rule: ShapeRule::None,
            has_side_effects: false,
        }
    }

    pub fn with_alias_kind(mut self, kind: AliasAnalysisKind) -> Self {
        self.alias_kind = kind;
        self
    }

    pub fn with_shape_rule(mut self, rule: ShapeRule) -> Self {
        self.shape_rule = rule;
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.has_side_effects = true;
        self
    }

    /// Check if this is a permutation-family operator.
    pub fn is_permutation(&self) -> bool {
        matches!(self.shape_rule, ShapeRule::Permute | ShapeRule::Transpose)
    }

    /// Check if removing an unused invocation could change behavior.
    pub fn has_observable_effects(&self) -> bool {
        self.has_side_effects
            || self.alias_kind == AliasAnalysisKind::Conservative
            || self.schema.is_mutable()
    }
}

/// Result of resolving an operator identity.
#[derive(Debug, Clone, Copy)]
pub enum SchemaLookup<'a> {
    Known(&'a OperatorDef),
    /// No schema is registered; analyses must treat the node conservatively.
    Unknown,
}

impl<'a> SchemaLookup<'a> {
    pub fn known(self) -> Option<&'a OperatorDef> {
        match self {
            SchemaLookup::Known(def) => Some(def),
            SchemaLookup::Unknown => None,
        }
    }
}

/// Registry of operator schemas.
///
/// Maps operator identities (e.g. `aten::add.Tensor`) to their definitions.
/// Populated once, then shared read-only by every analysis and pass.
///
/// # Example
///
/// ```
/// use quench_core::{AliasAnalysisKind, SchemaRegistry, ShapeRule};
///
/// let mut registry = SchemaRegistry::new();
/// registry
///     .register_signature("aten::relu(Tensor self) -> Tensor", AliasAnalysisKind::FromSchema, ShapeRule::Elementwise)
///     .unwrap();
/// assert!(registry.lookup("aten::relu").is_ok());
/// assert!(registry.lookup("aten::gelu").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    operators: HashMap<String, OperatorDef>,
}

impl SchemaRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in operator catalog.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        crate::catalog::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Register an operator definition under its schema's qualified name.
    ///
    /// Returns `self` for method chaining.
    pub fn register(&mut self, def: OperatorDef) -> &mut Self {
        self.operators.insert(def.schema.qualified_name(), def);
        self
    }

    /// Parse a signature and register it.
    pub fn register_signature(
        &mut self,
        signature: &str,
        alias_kind: AliasAnalysisKind,
        shape_rule: ShapeRule,
    ) -> Result<&mut Self> {
        let def = OperatorDef::new(Schema::parse(signature)?)
            .with_alias_kind(alias_kind)
            .with_shape_rule(shape_rule);
        Ok(self.register(def))
    }

    /// Look up an operator.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperator` if no schema is registered under `op`.
    pub fn lookup(&self, op: &str) -> Result<&OperatorDef> {
        self.operators.get(op).ok_or_else(|| Error::UnknownOperator {
            op: op.to_string(),
        })
    }

    /// Resolve an operator, representing a miss as `SchemaLookup::Unknown`.
    pub fn resolve(&self, op: &str) -> SchemaLookup<'_> {
        match self.operators.get(op) {
            Some(def) => SchemaLookup::Known(def),
            None => SchemaLookup::Unknown,
        }
    }

    /// Check if an operator is registered.
    pub fn contains(&self, op: &str) -> bool {
        self.operators.contains_key(op)
    }

    /// Get the number of registered operators.
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Check that every node of the graph has a registered schema.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperator` for the first unregistered node in program
    /// order.
    pub fn validate_graph(&self, graph: &Graph) -> Result<()> {
        for id in graph.nodes_pre_order() {
            let node = graph.node(id)?;
            self.lookup(node.op())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NewNode;
    use crate::types::ValueType;

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.is_empty());

        registry
            .register_signature(
                "aten::relu(Tensor self) -> Tensor",
                AliasAnalysisKind::FromSchema,
                ShapeRule::Elementwise,
            )
            .unwrap()
            .register_signature(
                "aten::relu_(Tensor(a!) self) -> Tensor(a!)",
                AliasAnalysisKind::FromSchema,
                ShapeRule::SameAsInput,
            )
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("aten::relu"));
        assert_eq!(registry.lookup("aten::relu").unwrap().shape_rule, ShapeRule::Elementwise);
        assert!(registry.lookup("aten::relu_").unwrap().has_observable_effects());
        assert!(!registry.lookup("aten::relu").unwrap().has_observable_effects());
    }

    #[test]
    fn test_lookup_unknown_operator() {
        let registry = SchemaRegistry::new();
        let err = registry.lookup("custom::frobnicate").unwrap_err();
        assert_eq!(err.to_string(), "Unknown operator: custom::frobnicate");
        assert!(matches!(registry.resolve("custom::frobnicate"), SchemaLookup::Unknown));
    }

    #[test]
    fn test_defaults_cover_control_flow_and_permutations() {
        let registry = SchemaRegistry::with_defaults().unwrap();
        for op in [
            "prim::Constant",
            "prim::GetAttr",
            "prim::SetAttr",
            "prim::Loop",
            "prim::If",
            "aten::permute",
            "aten::transpose.int",
            "aten::add_.Tensor",
        ] {
            assert!(registry.contains(op), "missing {op}");
        }
        assert!(registry.lookup("aten::permute").unwrap().is_permutation());
        assert!(registry.lookup("prim::SetAttr").unwrap().has_side_effects);
    }

    #[test]
    fn test_validate_graph_reports_first_unknown() {
        let registry = SchemaRegistry::with_defaults().unwrap();
        let mut graph = Graph::new();
        let x = graph.add_input("x", ValueType::Tensor);
        let root = graph.root();
        graph
            .append_node(root, NewNode::new("aten::relu").inputs(&[x]).output("y", ValueType::Tensor))
            .unwrap();
        assert!(registry.validate_graph(&graph).is_ok());

        graph
            .append_node(root, NewNode::new("custom::op").inputs(&[x]).output("z", ValueType::Tensor))
            .unwrap();
        let err = registry.validate_graph(&graph).unwrap_err();
        assert!(matches!(err, Error::UnknownOperator { op } if op == "custom::op"));
    }

    #[test]
    fn test_floor_div_rounds_down() {
        assert_eq!(ArithOp::FloorDiv.apply(7, 2), Some(3));
        assert_eq!(ArithOp::FloorDiv.apply(-7, 2), Some(-4));
        assert_eq!(ArithOp::FloorDiv.apply(7, 0), None);
        assert_eq!(ArithOp::Add.apply(i64::MAX, 1), None);
    }
}
