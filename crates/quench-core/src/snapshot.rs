//! Read-only view of module parameters and buffers.
//!
//! The freezer consults a snapshot to replace attribute reads with embedded
//! constants. Identifiers are dotted attribute paths relative to the root
//! module (`weight`, `encoder.layer1.bias`).

use crate::types::ConstantValue;
use std::collections::{HashMap, HashSet};

/// External mapping from parameter/buffer identifiers to constant values.
///
/// Implementations must not change while a pipeline is running.
pub trait ModuleSnapshot {
    /// Get the value of a parameter, buffer or constant attribute.
    fn get(&self, id: &str) -> Option<&ConstantValue>;

    /// Check whether an attribute may be treated as a constant.
    ///
    /// Attributes that the module itself updates between calls (running
    /// statistics, counters) must answer `false`.
    fn is_constant(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

/// In-memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct ParameterSnapshot {
    values: HashMap<String, ConstantValue>,
    mutable: HashSet<String>,
}

impl ParameterSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant attribute.
    pub fn insert(&mut self, id: impl Into<String>, value: ConstantValue) -> &mut Self {
        let id = id.into();
        self.mutable.remove(&id);
        self.values.insert(id, value);
        self
    }

    /// Add an attribute whose current value must not be folded.
    pub fn insert_mutable(&mut self, id: impl Into<String>, value: ConstantValue) -> &mut Self {
        let id = id.into();
        self.mutable.insert(id.clone());
        self.values.insert(id, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ModuleSnapshot for ParameterSnapshot {
    fn get(&self, id: &str) -> Option<&ConstantValue> {
        self.values.get(id)
    }

    fn is_constant(&self, id: &str) -> bool {
        self.values.contains_key(id) && !self.mutable.contains(id)
    }
}
