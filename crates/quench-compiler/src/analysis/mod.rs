//! Graph analyses consumed by the rewrite passes.

mod alias;
mod shape;

pub use alias::AliasDb;
pub use shape::ShapeAnalysis;

pub(crate) use shape::normalize_dim;
