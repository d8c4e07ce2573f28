//! Alias analysis.
//!
//! Unification-based and flow-insensitive. Every value of a mutable type is
//! mapped to a memory-location element; "may share storage" is element
//! equivalence in a union-find.
//!
//! Construction runs in two phases:
//! 1. A forward walk over every block in program order collects unification
//!    constraints, container containment edges and writes, consulting each
//!    node's schema.
//! 2. The constraints are solved with `petgraph::unionfind::UnionFind`, then
//!    containment is closed: all elements contained in one location are
//!    unified, and the contents of anything reaching the wildcard location
//!    join the wildcard.
//!
//! Two distinguished elements exist: the wildcard, which every value escaping
//! analysis is linked to, and the external location shared by all non-module
//! graph inputs (callers may pass one tensor as several arguments).

use petgraph::unionfind::UnionFind;
use quench_core::{
    AliasAnalysisKind, BlockId, Graph, NodeId, Result, SchemaLookup, SchemaRegistry, ValueId,
};
use std::collections::{HashMap, HashSet};

const WILDCARD: usize = 0;
const EXTERNAL: usize = 1;

/// Result of alias analysis, valid until the next structural mutation.
#[derive(Debug)]
pub struct AliasDb {
    sets: UnionFind<usize>,
    elements: HashMap<ValueId, usize>,
    /// Location root to the element standing for everything it contains.
    contained: HashMap<usize, usize>,
    /// Roots of written locations.
    written: HashSet<usize>,
    /// Location root to nodes that may write it.
    writers: HashMap<usize, Vec<NodeId>>,
    /// Attribute path of the root module to its location element.
    attributes: HashMap<String, usize>,
}

impl AliasDb {
    /// Analyze a graph.
    #[tracing::instrument(skip_all, fields(values = graph.value_count()))]
    pub fn analyze(graph: &Graph, registry: &SchemaRegistry) -> Result<Self> {
        let mut builder = Builder::new(graph, registry);
        builder.seed_inputs()?;
        builder.walk_block(graph.root())?;
        let db = builder.solve();

        tracing::debug!(
            elements = db.elements.len(),
            written = db.written.len(),
            "Alias analysis complete"
        );
        Ok(db)
    }

    fn root_of(&self, value: ValueId) -> Option<usize> {
        self.elements.get(&value).map(|&e| self.sets.find(e))
    }

    /// Check whether two values may share storage. Reflexive and symmetric.
    pub fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        match (self.root_of(a), self.root_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Check whether anything reachable from `a` (itself or its contents)
    /// may share storage with anything reachable from `b`.
    pub fn may_contain_alias(&self, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        let (Some(x), Some(y)) = (self.root_of(a), self.root_of(b)) else {
            return false;
        };
        let reachable = self.reachable(x);
        self.reachable(y).iter().any(|r| reachable.contains(r))
    }

    /// Check whether the storage behind a value, or anything it contains,
    /// may be written anywhere in the graph.
    pub fn may_be_mutated(&self, value: ValueId) -> bool {
        match self.root_of(value) {
            Some(root) => self
                .reachable(root)
                .iter()
                .any(|r| self.written.contains(r)),
            None => false,
        }
    }

    /// Check whether the attribute at a dotted path, or any module on the way
    /// to it, may be assigned anywhere in the graph.
    ///
    /// Reassigning `encoder` changes what `encoder.weight` reads even though
    /// the two paths are distinct locations.
    pub fn may_write_attribute_path(&self, path: &str) -> bool {
        let mut prefix = String::new();
        for segment in path.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            let written = self
                .attributes
                .get(&prefix)
                .is_some_and(|&element| self.written.contains(&self.sets.find(element)));
            if written {
                return true;
            }
        }
        false
    }

    /// Check whether a value is linked to the wildcard location.
    pub fn is_wildcard(&self, value: ValueId) -> bool {
        self.root_of(value) == Some(self.sets.find(WILDCARD))
    }

    /// Nodes that may write the storage behind a value.
    pub fn writers_of(&self, value: ValueId) -> Vec<NodeId> {
        let Some(root) = self.root_of(value) else {
            return Vec::new();
        };
        let mut writers: Vec<NodeId> = self
            .reachable(root)
            .iter()
            .filter_map(|r| self.writers.get(r))
            .flatten()
            .copied()
            .collect();
        writers.sort();
        writers.dedup();
        writers
    }

    /// Every value sharing a location with `value`.
    pub fn aliases_of(&self, value: ValueId) -> Vec<ValueId> {
        let Some(root) = self.root_of(value) else {
            return vec![value];
        };
        let mut aliases: Vec<ValueId> = self
            .elements
            .iter()
            .filter(|(_, &e)| self.sets.find(e) == root)
            .map(|(&v, _)| v)
            .collect();
        aliases.sort();
        aliases
    }

    /// Location roots reachable through containment, starting at `root`.
    fn reachable(&self, root: usize) -> Vec<usize> {
        let mut seen = vec![root];
        let mut current = root;
        while let Some(&inner) = self.contained.get(&current) {
            let next = self.sets.find(inner);
            if seen.contains(&next) {
                break;
            }
            seen.push(next);
            current = next;
        }
        seen
    }
}

/// Constraint collection.
struct Builder<'a> {
    graph: &'a Graph,
    registry: &'a SchemaRegistry,
    next: usize,
    elements: HashMap<ValueId, usize>,
    unions: Vec<(usize, usize)>,
    /// (container element, contained element)
    contained: Vec<(usize, usize)>,
    /// (module element, attribute location)
    module_attributes: Vec<(usize, usize)>,
    writes: Vec<(usize, NodeId)>,
    /// Attribute path of module-typed values reachable from the root module.
    module_paths: HashMap<ValueId, String>,
    attribute_locations: HashMap<String, usize>,
}

impl<'a> Builder<'a> {
    fn new(graph: &'a Graph, registry: &'a SchemaRegistry) -> Self {
        Self {
            graph,
            registry,
            next: 2,
            elements: HashMap::new(),
            unions: Vec::new(),
            contained: vec![(WILDCARD, WILDCARD)],
            module_attributes: Vec::new(),
            writes: Vec::new(),
            module_paths: HashMap::new(),
            attribute_locations: HashMap::new(),
        }
    }

    fn fresh(&mut self) -> usize {
        let element = self.next;
        self.next += 1;
        element
    }

    fn is_mutable(&self, value: ValueId) -> bool {
        self.graph
            .value(value)
            .map(|v| v.ty.is_mutable())
            .unwrap_or(false)
    }

    /// Element of a value, created on first request.
    fn element(&mut self, value: ValueId) -> usize {
        if let Some(&element) = self.elements.get(&value) {
            return element;
        }
        let element = self.fresh();
        self.elements.insert(value, element);
        element
    }

    /// Element of a mutable value, `None` for immutable ones.
    fn mutable_element(&mut self, value: ValueId) -> Option<usize> {
        if self.is_mutable(value) {
            Some(self.element(value))
        } else {
            None
        }
    }

    fn union(&mut self, a: usize, b: usize) {
        if a != b {
            self.unions.push((a, b));
        }
    }

    fn union_values(&mut self, a: ValueId, b: ValueId) {
        if let (Some(x), Some(y)) = (self.mutable_element(a), self.mutable_element(b)) {
            self.union(x, y);
        }
    }

    fn attribute_location(&mut self, path: &str) -> usize {
        if let Some(&element) = self.attribute_locations.get(path) {
            return element;
        }
        let element = self.fresh();
        self.attribute_locations.insert(path.to_string(), element);
        element
    }

    fn seed_inputs(&mut self) -> Result<()> {
        let graph = self.graph;
        let mut root_module = true;
        for &input in graph.inputs() {
            let value = graph.value(input)?;
            if value.ty.is_module() {
                self.element(input);
                if root_module {
                    self.module_paths.insert(input, String::new());
                    root_module = false;
                }
            } else if let Some(element) = self.mutable_element(input) {
                self.union(element, EXTERNAL);
            }
        }
        Ok(())
    }

    fn walk_block(&mut self, block: BlockId) -> Result<()> {
        let graph = self.graph;
        for &node in graph.block(block)?.nodes() {
            self.visit(node)?;
        }
        Ok(())
    }

    fn visit(&mut self, id: NodeId) -> Result<()> {
        let (graph, registry) = (self.graph, self.registry);
        let node = graph.node(id)?;
        for &output in node.outputs() {
            self.mutable_element(output);
        }

        let def = match registry.resolve(node.op()) {
            SchemaLookup::Known(def) => def,
            SchemaLookup::Unknown => return self.visit_conservative(id),
        };

        match def.alias_kind {
            AliasAnalysisKind::PureFunction => Ok(()),
            AliasAnalysisKind::Conservative => self.visit_conservative(id),
            AliasAnalysisKind::FromSchema => self.visit_from_schema(id),
            AliasAnalysisKind::InternalSpecialCase => self.visit_special(id),
        }
    }

    /// Link every mutable input and every output to the wildcard and assume
    /// the wildcard is written.
    fn visit_conservative(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(id)?;
        for &input in node.inputs() {
            if let Some(element) = self.mutable_element(input) {
                self.union(element, WILDCARD);
            }
        }
        for &output in node.outputs() {
            let element = self.element(output);
            self.union(element, WILDCARD);
        }
        self.writes.push((WILDCARD, id));
        for &block in node.blocks() {
            self.walk_block(block)?;
        }
        Ok(())
    }

    fn visit_from_schema(&mut self, id: NodeId) -> Result<()> {
        let (graph, registry) = (self.graph, self.registry);
        let node = graph.node(id)?;
        let schema = &registry.lookup(node.op())?.schema;
        let mut sets: HashMap<&str, Vec<usize>> = HashMap::new();

        for (index, &input) in node.inputs().iter().enumerate() {
            let Some(element) = self.mutable_element(input) else {
                continue;
            };
            if index >= schema.arguments.len() {
                // Extra inputs matched by `...`
                self.union(element, WILDCARD);
                continue;
            }
            let Some(alias) = schema.argument_alias(index) else {
                continue;
            };
            if alias.set == "*" || alias.escapes {
                self.union(element, WILDCARD);
            } else {
                sets.entry(alias.set.as_str()).or_default().push(element);
            }
            if alias.is_write {
                self.writes.push((element, id));
            }
        }

        for (index, &output) in node.outputs().iter().enumerate() {
            let Some(element) = self.mutable_element(output) else {
                continue;
            };
            if index >= schema.returns.len() {
                self.union(element, WILDCARD);
                continue;
            }
            let Some(alias) = schema.output_alias(index) else {
                continue;
            };
            match sets.get(alias.set.as_str()) {
                Some(inputs) if alias.set != "*" => {
                    for &input in inputs {
                        self.union(element, input);
                    }
                }
                _ => self.union(element, WILDCARD),
            }
        }
        Ok(())
    }

    fn visit_special(&mut self, id: NodeId) -> Result<()> {
        let graph = self.graph;
        graph.check_encoding(id)?;
        let node = graph.node(id)?;
        let inputs = node.inputs();
        let outputs = node.outputs();

        match node.op() {
            "prim::Constant" => {}
            "prim::GetAttr" => {
                let name = node.str_attribute("name").unwrap_or_default();
                let output = outputs[0];
                match self.module_paths.get(&inputs[0]).cloned() {
                    Some(parent) => {
                        let path = join_path(&parent, name);
                        let location = self.attribute_location(&path);
                        let module = self.element(inputs[0]);
                        self.module_attributes.push((module, location));
                        if let Some(element) = self.mutable_element(output) {
                            self.union(element, location);
                        }
                        if graph.value(output)?.ty.is_module() {
                            self.module_paths.insert(output, path);
                        }
                    }
                    None => {
                        // A module of unknown path may be the root module
                        // itself; its attributes escape with it
                        if let Some(module) = self.mutable_element(inputs[0]) {
                            self.union(module, WILDCARD);
                        }
                        if let Some(element) = self.mutable_element(output) {
                            self.union(element, WILDCARD);
                        }
                    }
                }
            }
            "prim::SetAttr" => {
                let name = node.str_attribute("name").unwrap_or_default();
                let location = match self.module_paths.get(&inputs[0]).cloned() {
                    Some(parent) => {
                        let location = self.attribute_location(&join_path(&parent, name));
                        let module = self.element(inputs[0]);
                        self.module_attributes.push((module, location));
                        location
                    }
                    None => {
                        if let Some(module) = self.mutable_element(inputs[0]) {
                            self.union(module, WILDCARD);
                        }
                        WILDCARD
                    }
                };
                if let Some(element) = self.mutable_element(inputs[1]) {
                    self.union(element, location);
                }
                self.writes.push((location, id));
            }
            "prim::Loop" => {
                let body = node.blocks()[0];
                let params = graph.block(body)?.params().to_vec();
                for (k, &output) in outputs.iter().enumerate() {
                    self.union_values(inputs[2 + k], params[1 + k]);
                    self.union_values(params[1 + k], output);
                }
                self.walk_block(body)?;
                let returns = graph.block(body)?.returns().to_vec();
                for (k, &output) in outputs.iter().enumerate() {
                    self.union_values(returns[1 + k], output);
                }
            }
            "prim::If" => {
                for &block in node.blocks() {
                    self.walk_block(block)?;
                    let returns = graph.block(block)?.returns().to_vec();
                    for (&ret, &output) in returns.iter().zip(outputs) {
                        self.union_values(ret, output);
                    }
                }
            }
            "prim::ListConstruct" | "prim::TupleConstruct" => {
                let Some(&output) = outputs.first() else {
                    return Ok(());
                };
                let container = self.element(output);
                let content = self.fresh();
                self.contained.push((container, content));
                for &input in inputs {
                    if let Some(element) = self.mutable_element(input) {
                        self.union(element, content);
                    }
                }
            }
            "prim::ListUnpack" | "prim::TupleUnpack" | "aten::__getitem__.t" => {
                let Some(&list) = inputs.first() else {
                    return self.visit_conservative(id);
                };
                let container = self.element(list);
                for &output in outputs {
                    if let Some(element) = self.mutable_element(output) {
                        self.contained.push((container, element));
                    }
                }
            }
            "aten::append.t" => {
                let [list, item] = inputs[..] else {
                    return self.visit_conservative(id);
                };
                let list = self.element(list);
                let content = self.fresh();
                self.contained.push((list, content));
                if let Some(element) = self.mutable_element(item) {
                    self.union(element, content);
                }
                if let Some(&output) = outputs.first() {
                    let element = self.element(output);
                    self.union(element, list);
                }
                self.writes.push((list, id));
            }
            _ => return self.visit_conservative(id),
        }
        Ok(())
    }

    fn solve(self) -> AliasDb {
        let mut sets = UnionFind::new(self.next);
        for &(a, b) in &self.unions {
            sets.union(a, b);
        }

        // Close containment until no location gains new members
        loop {
            let mut changed = false;
            let mut first: HashMap<usize, usize> = HashMap::new();
            for &(container, content) in &self.contained {
                let root = sets.find(container);
                match first.get(&root) {
                    Some(&existing) => changed |= sets.union(existing, content),
                    None => {
                        first.insert(root, content);
                    }
                }
            }
            let wildcard = sets.find(WILDCARD);
            for &(module, attribute) in &self.module_attributes {
                if sets.find(module) == wildcard {
                    changed |= sets.union(WILDCARD, attribute);
                }
            }
            if !changed {
                break;
            }
        }

        let mut contained = HashMap::new();
        for &(container, content) in &self.contained {
            contained.entry(sets.find(container)).or_insert(content);
        }

        let mut written = HashSet::new();
        let mut writers: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for &(element, node) in &self.writes {
            let root = sets.find(element);
            written.insert(root);
            writers.entry(root).or_default().push(node);
        }

        AliasDb {
            sets,
            elements: self.elements,
            contained,
            written,
            writers,
            attributes: self.attribute_locations,
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}
