//! Core intermediate representation, operator schemas and schema registry for quench.
//!
//! This crate provides the foundational abstractions the pass pipeline works on:
//! - Arena-backed graph IR (`Graph`, `Block`, `Node`, `Value`) with stable indices
//! - Per-value type records (`TypeRecord`) forming the shape/dtype/device lattice
//! - Operator schemas with mutability and aliasing annotations (`Schema`)
//! - A closed operator lookup table built once at startup (`SchemaRegistry`)
//! - The read-only module parameter boundary (`ModuleSnapshot`)

mod catalog;
pub mod ir;
pub mod ir_builder;
pub mod printer;
pub mod record;
pub mod registry;
pub mod schema;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use ir::{
    Block, BlockId, Graph, InsertPoint, NewNode, Node, NodeId, Use, User, Value, ValueDef, ValueId,
};
pub use ir_builder::GraphBuilder;
pub use record::{Fact, ShapeFact, TypeRecord};
pub use registry::{AliasAnalysisKind, ArithOp, OperatorDef, SchemaLookup, SchemaRegistry, ShapeRule};
pub use schema::{AliasAnnotation, ArgType, Argument, Schema};
pub use snapshot::{ModuleSnapshot, ParameterSnapshot};
pub use types::{ConstantValue, DataType, Device, TensorData, TensorValue, ValueType};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by the IR, the registry and every pass.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown operator: {op}")]
    UnknownOperator { op: String },

    #[error("{analysis} did not reach a fixpoint within {limit} steps")]
    AnalysisNonTermination { analysis: String, limit: usize },

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Malformed schema '{signature}': {message}")]
    SchemaParse { signature: String, message: String },

    #[error("Analysis '{analysis}' is not available")]
    AnalysisUnavailable { analysis: String },

    #[error("Shape error: {0}")]
    Shape(String),
}
