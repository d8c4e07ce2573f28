//! Intermediate representation for the pass pipeline.
//!
//! The IR is an arena of blocks, nodes and values addressed by stable indices:
//! - **Nodes** (`Node`) are operator invocations, stored in a petgraph
//!   `StableGraph` whose edges record data dependences (producer → user).
//! - **Values** (`Value`) are SSA definitions stored in a side-table. Each has
//!   exactly one definition (a node output or a block parameter) and a use list.
//! - **Blocks** (`Block`) own an ordered node list. The graph's root block
//!   holds the graph inputs and outputs; control nodes (`prim::Loop`,
//!   `prim::If`) own nested blocks.
//!
//! Rewrites are index rewiring. Removed nodes and values leave tombstones so
//! that indices held by analyses stay meaningful across mutation.

use crate::record::TypeRecord;
use crate::types::{ConstantValue, ValueType};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Type alias for node identifiers (backed by petgraph NodeIndex).
pub type NodeId = NodeIndex;

/// Unique identifier for a value. Index into the graph's value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl ValueId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Unique identifier for a block. Index into the graph's block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl BlockId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where a value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    NodeOutput { node: NodeId, index: usize },
    BlockParam { block: BlockId, index: usize },
}

/// Something that reads a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum User {
    /// An input slot of a node.
    Node(NodeId),
    /// A return slot of a block.
    Return(BlockId),
}

/// One use of a value: the user and the slot index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: User,
    pub index: usize,
}

// ──────────────────────────────── Graph ──────────────────────────────────

/// Where to place a newly created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Immediately before an existing node, in that node's block.
    Before(NodeId),
    /// At the end of a block.
    AtEnd(BlockId),
}

/// Description of a node to create.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub op: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<(String, ValueType)>,
    pub attributes: BTreeMap<String, ConstantValue>,
}

impl NewNode {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn inputs(mut self, inputs: &[ValueId]) -> Self {
        self.inputs.extend_from_slice(inputs);
        self
    }

    pub fn output(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.outputs.push((name.into(), ty));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: ConstantValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Computation graph.
///
/// Nodes live in a `StableGraph` so that removing one never invalidates the
/// ids of the others; petgraph edges exist solely to track data dependences.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Node storage plus producer → user dependence edges.
    nodes: StableGraph<Node, ()>,

    /// Value side-table. Removed values stay as tombstones.
    values: Vec<Value>,

    /// Block table. Index 0 is the root block.
    blocks: Vec<Block>,

    /// Display names already handed out.
    names: HashSet<String>,
}

impl Graph {
    /// Create a new graph with an empty root block.
    pub fn new() -> Self {
        Self {
            nodes: StableGraph::new(),
            values: Vec::new(),
            blocks: vec![Block::new(None)],
            names: HashSet::new(),
        }
    }

    /// The root block.
    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    /// Graph inputs (root block parameters).
    pub fn inputs(&self) -> &[ValueId] {
        &self.blocks[0].params
    }

    /// Graph outputs (root block returns).
    pub fn outputs(&self) -> &[ValueId] {
        &self.blocks[0].returns
    }

    // ── Access ──

    /// Get an immutable reference to a node.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Check whether a node is still part of the graph.
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.node_weight(id).is_some()
    }

    /// Get an immutable reference to a live value.
    pub fn value(&self, id: ValueId) -> Result<&Value> {
        match self.values.get(id.index()) {
            Some(value) if value.live => Ok(value),
            _ => Err(Error::InvalidGraph(format!("Value {:?} not found", id))),
        }
    }

    fn value_mut(&mut self, id: ValueId) -> Result<&mut Value> {
        match self.values.get_mut(id.index()) {
            Some(value) if value.live => Ok(value),
            _ => Err(Error::InvalidGraph(format!("Value {:?} not found", id))),
        }
    }

    /// Check whether a value is still part of the graph.
    pub fn contains_value(&self, id: ValueId) -> bool {
        self.values.get(id.index()).is_some_and(|v| v.live)
    }

    /// Get an immutable reference to a live block.
    pub fn block(&self, id: BlockId) -> Result<&Block> {
        match self.blocks.get(id.index()) {
            Some(block) if block.live => Ok(block),
            _ => Err(Error::InvalidGraph(format!("Block {:?} not found", id))),
        }
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        match self.blocks.get_mut(id.index()) {
            Some(block) if block.live => Ok(block),
            _ => Err(Error::InvalidGraph(format!("Block {:?} not found", id))),
        }
    }

    /// Get the type record of a value.
    pub fn record(&self, id: ValueId) -> Result<&TypeRecord> {
        Ok(&self.value(id)?.record)
    }

    /// Overwrite the type record of a value.
    pub fn set_record(&mut self, id: ValueId, record: TypeRecord) -> Result<()> {
        self.value_mut(id)?.record = record;
        Ok(())
    }

    /// Get the node that produces a value, if it is a node output.
    pub fn producer(&self, id: ValueId) -> Option<NodeId> {
        match self.value(id).ok()?.def {
            ValueDef::NodeOutput { node, .. } => Some(node),
            ValueDef::BlockParam { .. } => None,
        }
    }

    /// Number of live nodes, nested blocks included.
    pub fn node_count(&self) -> usize {
        self.nodes.node_count()
    }

    /// Number of live values.
    pub fn value_count(&self) -> usize {
        self.values.iter().filter(|v| v.live).count()
    }

    /// Size of the value table including tombstones. Every `ValueId` ever
    /// handed out is below this bound.
    pub fn value_capacity(&self) -> usize {
        self.values.len()
    }

    /// Iterate over all live values.
    pub fn values(&self) -> impl Iterator<Item = (ValueId, &Value)> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.live)
            .map(|(i, v)| (ValueId(i), v))
    }

    /// The compile-time constant behind a value, from its constant-value fact
    /// or from a producing `prim::Constant`.
    pub fn constant_value(&self, id: ValueId) -> Option<ConstantValue> {
        let value = self.value(id).ok()?;
        if let Some(constant) = value.record.constant() {
            return Some(constant.clone());
        }
        let producer = self.node(self.producer(id)?).ok()?;
        if producer.op() == "prim::Constant" {
            return producer.attribute("value").cloned();
        }
        None
    }

    // ── Traversal ──

    /// Nodes of one block, in program order (a topological order).
    pub fn topological_order(&self, block: BlockId) -> Result<Vec<NodeId>> {
        Ok(self.block(block)?.nodes.clone())
    }

    /// Every node of the graph in program order, each control node before the
    /// contents of its nested blocks.
    pub fn nodes_pre_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.node_count());
        self.collect_pre_order(self.root(), &mut order);
        order
    }

    fn collect_pre_order(&self, block: BlockId, order: &mut Vec<NodeId>) {
        for &id in &self.blocks[block.index()].nodes {
            order.push(id);
            if let Some(node) = self.nodes.node_weight(id) {
                for &sub in &node.blocks {
                    self.collect_pre_order(sub, order);
                }
            }
        }
    }

    /// Every node of the graph, the contents of nested blocks before the
    /// control node that owns them.
    pub fn nodes_post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.node_count());
        self.collect_post_order(self.root(), &mut order);
        order
    }

    fn collect_post_order(&self, block: BlockId, order: &mut Vec<NodeId>) {
        for &id in &self.blocks[block.index()].nodes {
            if let Some(node) = self.nodes.node_weight(id) {
                for &sub in &node.blocks {
                    self.collect_post_order(sub, order);
                }
            }
            order.push(id);
        }
    }

    // ── Graph mutation ──

    /// Hand out a display name not used anywhere else in the graph.
    fn fresh_name(&mut self, hint: &str) -> String {
        let base = if hint.is_empty() {
            self.values.len().to_string()
        } else {
            hint.split('.').next().unwrap_or(hint).to_string()
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.names.contains(&candidate) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        self.names.insert(candidate.clone());
        candidate
    }

    fn new_value(&mut self, hint: &str, ty: ValueType, def: ValueDef) -> ValueId {
        let name = self.fresh_name(hint);
        let id = ValueId(self.values.len());
        self.values.push(Value {
            name,
            ty,
            record: TypeRecord::unknown(),
            def,
            uses: Vec::new(),
            live: true,
        });
        id
    }

    /// Add a graph input.
    pub fn add_input(&mut self, name: &str, ty: ValueType) -> ValueId {
        let block = self.root();
        let index = self.blocks[0].params.len();
        let id = self.new_value(name, ty, ValueDef::BlockParam { block, index });
        self.blocks[0].params.push(id);
        id
    }

    /// Add a parameter to a block.
    pub fn add_block_param(&mut self, block: BlockId, name: &str, ty: ValueType) -> Result<ValueId> {
        let index = self.block(block)?.params.len();
        let id = self.new_value(name, ty, ValueDef::BlockParam { block, index });
        self.block_mut(block)?.params.push(id);
        Ok(id)
    }

    /// Create a nested block owned by a control node.
    pub fn add_sub_block(&mut self, owner: NodeId) -> Result<BlockId> {
        self.node(owner)?;
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block::new(Some(owner)));
        self.node_mut(owner)?.blocks.push(id);
        Ok(id)
    }

    /// Create a node at the given insertion point and return its ID.
    ///
    /// Registers a use on every input and adds dependence edges from the
    /// inputs' producers. Output values start with an unknown type record,
    /// except for `prim::Constant` whose record is exact.
    pub fn insert_node(&mut self, point: InsertPoint, template: NewNode) -> Result<NodeId> {
        let (block, position) = match point {
            InsertPoint::Before(anchor) => {
                let block = self.node(anchor)?.block;
                let position = self
                    .block(block)?
                    .nodes
                    .iter()
                    .position(|&n| n == anchor)
                    .ok_or_else(|| {
                        Error::InvalidGraph(format!("Node {:?} missing from its block", anchor))
                    })?;
                (block, position)
            }
            InsertPoint::AtEnd(block) => (block, self.block(block)?.nodes.len()),
        };

        for &input in &template.inputs {
            self.value(input)?;
        }

        let node_id = self.nodes.add_node(Node {
            op: template.op,
            attributes: template.attributes,
            inputs: template.inputs,
            outputs: Vec::new(),
            block,
            blocks: Vec::new(),
        });

        let inputs = self.node(node_id)?.inputs.clone();
        for (index, &input) in inputs.iter().enumerate() {
            self.add_use(
                input,
                Use {
                    user: User::Node(node_id),
                    index,
                },
            )?;
        }

        let mut outputs = Vec::with_capacity(template.outputs.len());
        for (index, (name, ty)) in template.outputs.into_iter().enumerate() {
            outputs.push(self.new_value(
                &name,
                ty,
                ValueDef::NodeOutput {
                    node: node_id,
                    index,
                },
            ));
        }

        let node = self.node_mut(node_id)?;
        node.outputs = outputs;
        let constant = match (node.op.as_str(), node.attributes.get("value")) {
            ("prim::Constant", Some(value)) => node
                .outputs
                .first()
                .map(|&output| (output, TypeRecord::from_constant(value))),
            _ => None,
        };
        if let Some((output, record)) = constant {
            self.values[output.index()].record = record;
        }

        self.block_mut(block)?.nodes.insert(position, node_id);
        Ok(node_id)
    }

    /// Append a node at the end of a block.
    pub fn append_node(&mut self, block: BlockId, template: NewNode) -> Result<NodeId> {
        self.insert_node(InsertPoint::AtEnd(block), template)
    }

    /// Create a `prim::Constant` node and return its output.
    pub fn insert_constant(&mut self, point: InsertPoint, value: ConstantValue) -> Result<ValueId> {
        let ty = value.value_type();
        let node = self.insert_node(
            point,
            NewNode::new("prim::Constant")
                .output("", ty)
                .attribute("value", value),
        )?;
        Ok(self.node(node)?.outputs[0])
    }

    /// Set an attribute on a node.
    pub fn set_attribute(&mut self, node: NodeId, key: &str, value: ConstantValue) -> Result<()> {
        self.node_mut(node)?.attributes.insert(key.to_string(), value);
        Ok(())
    }

    /// Append a value to a block's returns.
    pub fn push_return(&mut self, block: BlockId, value: ValueId) -> Result<()> {
        self.value(value)?;
        let index = self.block(block)?.returns.len();
        self.block_mut(block)?.returns.push(value);
        self.add_use(
            value,
            Use {
                user: User::Return(block),
                index,
            },
        )
    }

    /// Replace all of a block's returns.
    pub fn set_returns(&mut self, block: BlockId, values: &[ValueId]) -> Result<()> {
        let old = std::mem::take(&mut self.block_mut(block)?.returns);
        for (index, value) in old.into_iter().enumerate() {
            self.remove_use(
                value,
                Use {
                    user: User::Return(block),
                    index,
                },
            )?;
        }
        for &value in values {
            self.push_return(block, value)?;
        }
        Ok(())
    }

    /// Point one input slot of a node at a different value.
    pub fn replace_input(&mut self, node: NodeId, index: usize, new: ValueId) -> Result<()> {
        self.value(new)?;
        let old = *self.node(node)?.inputs.get(index).ok_or_else(|| {
            Error::InvalidGraph(format!("Node {:?} has no input {}", node, index))
        })?;
        if old == new {
            return Ok(());
        }
        let slot = Use {
            user: User::Node(node),
            index,
        };
        self.remove_use(old, slot)?;
        self.node_mut(node)?.inputs[index] = new;
        self.add_use(new, slot)
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.value(new)?;
        let uses = std::mem::take(&mut self.value_mut(old)?.uses);
        let old_producer = self.producer(old);
        let new_producer = self.producer(new);

        for u in &uses {
            match u.user {
                User::Node(user) => {
                    self.node_mut(user)?.inputs[u.index] = new;
                    if let Some(p) = old_producer {
                        self.remove_dependence(p, user);
                    }
                    if let Some(p) = new_producer {
                        self.nodes.add_edge(p, user, ());
                    }
                }
                User::Return(block) => {
                    self.block_mut(block)?.returns[u.index] = new;
                }
            }
        }

        self.value_mut(new)?.uses.extend(uses);
        Ok(())
    }

    /// Remove a node from the graph.
    ///
    /// The node's outputs must have no remaining uses. Nested blocks are
    /// destroyed together with the node.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?.clone();

        for &output in &node.outputs {
            if self.value(output)?.has_uses() {
                return Err(Error::InvalidGraph(format!(
                    "Cannot remove node {:?} ({}): output '{}' still has uses",
                    id,
                    node.op,
                    self.values[output.index()].name
                )));
            }
        }

        for &sub in node.blocks.iter().rev() {
            self.destroy_block(sub)?;
        }

        for (index, &input) in node.inputs.iter().enumerate() {
            self.remove_use(
                input,
                Use {
                    user: User::Node(id),
                    index,
                },
            )?;
        }

        self.block_mut(node.block)?.nodes.retain(|&n| n != id);
        for &output in &node.outputs {
            self.kill_value(output);
        }

        // Removing the node also drops its dependence edges
        self.nodes.remove_node(id);
        Ok(())
    }

    fn destroy_block(&mut self, block: BlockId) -> Result<()> {
        self.set_returns(block, &[])?;
        let nodes = self.block(block)?.nodes.clone();
        for &node in nodes.iter().rev() {
            self.remove_node(node)?;
        }
        let params = self.block(block)?.params.clone();
        for param in params {
            if self.value(param)?.has_uses() {
                return Err(Error::InvalidGraph(format!(
                    "Block parameter {:?} is used outside its block",
                    param
                )));
            }
            self.kill_value(param);
        }
        self.blocks[block.index()].live = false;
        Ok(())
    }

    fn kill_value(&mut self, id: ValueId) {
        if let Some(value) = self.values.get_mut(id.index()) {
            value.live = false;
            value.uses.clear();
        }
    }

    fn add_use(&mut self, value: ValueId, u: Use) -> Result<()> {
        let producer = self.producer(value);
        self.value_mut(value)?.uses.push(u);
        if let (Some(p), User::Node(user)) = (producer, u.user) {
            self.nodes.add_edge(p, user, ());
        }
        Ok(())
    }

    fn remove_use(&mut self, value: ValueId, u: Use) -> Result<()> {
        let producer = self.producer(value);
        self.value_mut(value)?.uses.retain(|x| *x != u);
        if let (Some(p), User::Node(user)) = (producer, u.user) {
            self.remove_dependence(p, user);
        }
        Ok(())
    }

    fn remove_dependence(&mut self, producer: NodeId, user: NodeId) {
        if let Some(edge) = self.nodes.find_edge(producer, user) {
            self.nodes.remove_edge(edge);
        }
    }

    // ── Cloning ──

    /// Clone one node (and its nested blocks) to `point`.
    ///
    /// Inputs are translated through `map`; inputs not in the map refer to
    /// values visible at the insertion point and are used as-is. Every value
    /// the clone defines is added to `map` and inherits the original's record.
    pub fn clone_node(
        &mut self,
        original: NodeId,
        point: InsertPoint,
        map: &mut HashMap<ValueId, ValueId>,
    ) -> Result<NodeId> {
        let node = self.node(original)?.clone();
        let inputs: Vec<ValueId> = node
            .inputs
            .iter()
            .map(|v| *map.get(v).unwrap_or(v))
            .collect();

        let mut template = NewNode::new(node.op.clone()).inputs(&inputs);
        template.attributes = node.attributes.clone();
        for &output in &node.outputs {
            let value = self.value(output)?;
            template = template.output(value.name.clone(), value.ty.clone());
        }

        let copy = self.insert_node(point, template)?;
        let copied_outputs = self.node(copy)?.outputs.clone();
        for (&from, &to) in node.outputs.iter().zip(&copied_outputs) {
            let record = self.value(from)?.record.clone();
            self.set_record(to, record)?;
            map.insert(from, to);
        }

        for &sub in &node.blocks {
            let new_block = self.add_sub_block(copy)?;
            self.clone_block_into(sub, new_block, map)?;
        }

        Ok(copy)
    }

    fn clone_block_into(
        &mut self,
        source: BlockId,
        target: BlockId,
        map: &mut HashMap<ValueId, ValueId>,
    ) -> Result<()> {
        let params = self.block(source)?.params.clone();
        for param in params {
            let value = self.value(param)?;
            let (name, ty, record) = (value.name.clone(), value.ty.clone(), value.record.clone());
            let copy = self.add_block_param(target, &name, ty)?;
            self.set_record(copy, record)?;
            map.insert(param, copy);
        }

        self.clone_nodes(source, InsertPoint::AtEnd(target), map)?;

        let returns: Vec<ValueId> = self
            .block(source)?
            .returns
            .iter()
            .map(|v| *map.get(v).unwrap_or(v))
            .collect();
        self.set_returns(target, &returns)
    }

    /// Clone every node of `source` to `point`, in order. Parameters of
    /// `source` must already be mapped by the caller.
    pub fn clone_nodes(
        &mut self,
        source: BlockId,
        point: InsertPoint,
        map: &mut HashMap<ValueId, ValueId>,
    ) -> Result<()> {
        let nodes = self.block(source)?.nodes.clone();
        for node in nodes {
            self.clone_node(node, point, map)?;
        }
        Ok(())
    }

    // ── Verification ──

    /// Check the structural invariants of the graph.
    ///
    /// - every value has exactly one definition, consistent with its definer
    /// - every use references a live user whose slot holds the value
    /// - every node input and block return is defined before it is used
    ///   (in its block or an enclosing one)
    /// - the data dependence graph is acyclic
    pub fn verify(&self) -> Result<()> {
        for (id, value) in self.values() {
            match value.def {
                ValueDef::NodeOutput { node, index } => {
                    if self.node(node)?.outputs.get(index) != Some(&id) {
                        return Err(Error::InvalidGraph(format!(
                            "Value '{}' claims to be output {} of {:?}",
                            value.name, index, node
                        )));
                    }
                }
                ValueDef::BlockParam { block, index } => {
                    if self.block(block)?.params.get(index) != Some(&id) {
                        return Err(Error::InvalidGraph(format!(
                            "Value '{}' claims to be parameter {} of {:?}",
                            value.name, index, block
                        )));
                    }
                }
            }

            for u in &value.uses {
                let slot = match u.user {
                    User::Node(node) => self.node(node)?.inputs.get(u.index),
                    User::Return(block) => self.block(block)?.returns.get(u.index),
                };
                if slot != Some(&id) {
                    return Err(Error::InvalidGraph(format!(
                        "Use list of '{}' disagrees with {:?}",
                        value.name, u.user
                    )));
                }
            }
        }

        let mut visible = HashSet::new();
        self.verify_block(self.root(), &mut visible)?;

        if petgraph::algo::is_cyclic_directed(&self.nodes) {
            return Err(Error::InvalidGraph(
                "Data dependence graph contains a cycle".to_string(),
            ));
        }

        Ok(())
    }

    /// Check the operand layout of nodes the analyses take apart.
    ///
    /// - `prim::Loop(trip_count, cond, carried...)` owns one body with params
    ///   `(iter, carried...)` and returns `(cond, carried...)`.
    /// - `prim::If(cond)` owns two blocks, each returning one value per output.
    /// - `prim::GetAttr(module)` has one output and `prim::SetAttr(module, value)`
    ///   none; both carry a `name`.
    pub fn check_encoding(&self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let malformed = |what: &str| Error::InvalidGraph(format!("{} node {:?} {}", node.op, id, what));
        match node.op.as_str() {
            "prim::Loop" => {
                let [body] = node.blocks[..] else {
                    return Err(malformed("must own exactly one body block"));
                };
                let data = self.block(body)?;
                let carried = node.outputs.len();
                if node.inputs.len() != carried + 2
                    || data.params.len() != carried + 1
                    || data.returns.len() != carried + 1
                {
                    return Err(malformed("does not follow the (trip_count, cond, carried...) encoding"));
                }
            }
            "prim::If" => {
                if node.inputs.len() != 1 || node.blocks.len() != 2 {
                    return Err(malformed("must have one condition and two blocks"));
                }
                for &branch in &node.blocks {
                    if self.block(branch)?.returns.len() != node.outputs.len() {
                        return Err(malformed("has a branch whose returns do not match its outputs"));
                    }
                }
            }
            "prim::GetAttr" => {
                if node.inputs.len() != 1 || node.outputs.len() != 1 || node.str_attribute("name").is_none() {
                    return Err(malformed("must read one named attribute of one module"));
                }
            }
            "prim::SetAttr" => {
                if node.inputs.len() != 2 || !node.outputs.is_empty() || node.str_attribute("name").is_none() {
                    return Err(malformed("must write one named attribute of one module"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn verify_block(&self, block: BlockId, visible: &mut HashSet<ValueId>) -> Result<()> {
        let data = self.block(block)?;
        visible.extend(data.params.iter().copied());

        for &id in &data.nodes {
            let node = self.node(id)?;
            if node.block != block {
                return Err(Error::InvalidGraph(format!(
                    "Node {:?} ({}) is listed in the wrong block",
                    id, node.op
                )));
            }
            self.check_encoding(id)?;
            for (index, input) in node.inputs.iter().enumerate() {
                let used = self.value(*input)?.uses.contains(&Use {
                    user: User::Node(id),
                    index,
                });
                if !visible.contains(input) || !used {
                    return Err(Error::InvalidGraph(format!(
                        "Node {:?} ({}) input {} is not defined before use",
                        id, node.op, index
                    )));
                }
            }
            for &sub in &node.blocks {
                let mut inner = visible.clone();
                self.verify_block(sub, &mut inner)?;
            }
            visible.extend(node.outputs.iter().copied());
        }

        for ret in &data.returns {
            if !visible.contains(ret) {
                return Err(Error::InvalidGraph(format!(
                    "Block {:?} returns a value that is not visible",
                    block
                )));
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────── Block ──────────────────────────────────

/// An ordered list of nodes with parameters and returns.
#[derive(Debug, Clone)]
pub struct Block {
    params: Vec<ValueId>,
    returns: Vec<ValueId>,
    nodes: Vec<NodeId>,
    owner: Option<NodeId>,
    live: bool,
}

impl Block {
    fn new(owner: Option<NodeId>) -> Self {
        Self {
            params: Vec::new(),
            returns: Vec::new(),
            nodes: Vec::new(),
            owner,
            live: true,
        }
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    pub fn returns(&self) -> &[ValueId] {
        &self.returns
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// The control node owning this block (`None` for the root block).
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }
}

// ──────────────────────────────── Node ───────────────────────────────────

/// A node in the IR graph: one operator invocation.
#[derive(Debug, Clone)]
pub struct Node {
    /// Operator identity (e.g. `aten::add.Tensor`), the registry key.
    op: String,

    /// Operator attributes (`value` on constants, `name` on attribute access).
    attributes: BTreeMap<String, ConstantValue>,

    /// Input value IDs.
    inputs: Vec<ValueId>,

    /// Output value IDs.
    outputs: Vec<ValueId>,

    /// Owning block.
    block: BlockId,

    /// Nested blocks (loop body, if branches).
    blocks: Vec<BlockId>,
}

impl Node {
    /// Get the operator identity.
    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn attributes(&self) -> &BTreeMap<String, ConstantValue> {
        &self.attributes
    }

    /// Get an attribute.
    pub fn attribute(&self, key: &str) -> Option<&ConstantValue> {
        self.attributes.get(key)
    }

    /// Get a string attribute.
    pub fn str_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(ConstantValue::as_str)
    }
}

// ──────────────────────────────── Value ──────────────────────────────────

/// An SSA value.
#[derive(Debug, Clone)]
pub struct Value {
    /// Display name (unique within the graph).
    pub name: String,

    /// Static type.
    pub ty: ValueType,

    /// Lattice facts; refined in place by shape analysis.
    pub record: TypeRecord,

    def: ValueDef,
    uses: Vec<Use>,
    live: bool,
}

impl Value {
    pub fn def(&self) -> ValueDef {
        self.def
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn has_uses(&self) -> bool {
        !self.uses.is_empty()
    }
}
