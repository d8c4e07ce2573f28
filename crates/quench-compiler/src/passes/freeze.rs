//! Module freezing: fold parameter and buffer reads into constants.

use crate::pass::{Analysis, Diagnostic, Pass, PassContext, Stage};
use crate::passes::eliminate_dead_code;
use quench_core::{Graph, InsertPoint, NodeId, Result, ValueId};
use std::collections::HashMap;

/// Replace reads of module attributes with the snapshot's values.
///
/// The first graph input is the root module when it is module-typed.
/// `prim::GetAttr` chains through submodules resolve to dotted paths
/// (`self.encoder.weight` reads `encoder.weight`). A read is folded only when
/// the snapshot holds a constant for its path, the path is not preserved and
/// alias analysis rules out any write to the storage behind it, to the
/// attribute itself, or to a module on its path.
pub struct FreezeModulePass;

impl FreezeModulePass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FreezeModulePass {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-module attribute read reachable from the root module.
struct AttributeRead {
    node: NodeId,
    output: ValueId,
    path: String,
}

fn collect_reads(graph: &Graph) -> Result<Vec<AttributeRead>> {
    let mut paths: HashMap<ValueId, String> = HashMap::new();
    match graph.inputs().first() {
        Some(&root) if graph.value(root)?.ty.is_module() => {
            paths.insert(root, String::new());
        }
        _ => return Ok(Vec::new()),
    }

    let mut reads = Vec::new();
    for id in graph.nodes_pre_order() {
        let node = graph.node(id)?;
        if node.op() != "prim::GetAttr" {
            continue;
        }
        let (Some(parent), Some(name)) = (
            node.inputs().first().and_then(|m| paths.get(m)),
            node.str_attribute("name"),
        ) else {
            continue;
        };
        let path = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}.{name}")
        };

        let Some(&output) = node.outputs().first() else {
            continue;
        };
        if graph.value(output)?.ty.is_module() {
            paths.insert(output, path);
        } else {
            reads.push(AttributeRead {
                node: id,
                output,
                path,
            });
        }
    }
    Ok(reads)
}

impl Pass for FreezeModulePass {
    fn name(&self) -> &str {
        "freeze_module"
    }

    fn stage(&self) -> Stage {
        Stage::Freezing
    }

    fn requires(&self) -> &[Analysis] {
        &[Analysis::Alias]
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<bool> {
        let reads = collect_reads(graph)?;
        let mut folded = Vec::new();
        let mut skipped = Vec::new();

        {
            let alias = ctx.alias()?;
            for read in reads {
                let reason = if ctx.config.is_preserved(&read.path) {
                    Some("attribute is preserved")
                } else if ctx.snapshot.get(&read.path).is_none() {
                    Some("attribute is missing from the module snapshot")
                } else if !ctx.snapshot.is_constant(&read.path) {
                    Some("attribute is not constant in the module snapshot")
                } else if alias.may_be_mutated(read.output) {
                    Some("value may be mutated")
                } else if alias.may_write_attribute_path(&read.path) {
                    Some("attribute or an enclosing module may be reassigned")
                } else {
                    None
                };
                match reason {
                    Some(reason) => skipped.push((read, reason)),
                    None => folded.push(read),
                }
            }
        }

        for (read, reason) in skipped {
            let value = graph.value(read.output)?.name.clone();
            tracing::info!(attribute = %read.path, value = %value, reason, "UnsafeFreezeSkipped");
            ctx.report(Diagnostic::UnsafeFreezeSkipped {
                attribute: read.path,
                value,
                reason: reason.to_string(),
            });
        }

        if folded.is_empty() {
            return Ok(false);
        }

        for read in &folded {
            let Some(value) = ctx.snapshot.get(&read.path).cloned() else {
                continue;
            };
            let constant = graph.insert_constant(InsertPoint::Before(read.node), value)?;
            graph.replace_all_uses_with(read.output, constant)?;
            tracing::debug!(attribute = %read.path, "Folded attribute read");
        }

        if ctx.config.run_dead_code_elimination {
            eliminate_dead_code(graph, ctx.registry)?;
        } else {
            for read in &folded {
                graph.remove_node(read.node)?;
            }
        }

        tracing::debug!(folded = folded.len(), "Froze module attributes");
        Ok(true)
    }
}
