//! Pass trait, stages and the context passes run in.

use crate::analysis::AliasDb;
use crate::config::PipelineConfig;
use quench_core::{Error, Graph, ModuleSnapshot, Result, SchemaRegistry};
use std::fmt;

/// Pipeline stage for ordering passes.
///
/// Passes are sorted by stage; within a stage they run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Replace module attribute reads with constants.
    Freezing,

    /// Expand loops with constant trip counts.
    Unrolling,

    /// Local pattern rewrites.
    Peephole,
}

/// An analysis a pass can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Analysis {
    /// `AliasDb` in `PassContext`.
    Alias,
    /// Type records in the graph, refined by shape analysis.
    Shape,
}

/// A non-fatal decision worth reporting to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A module attribute read was left in place.
    UnsafeFreezeSkipped {
        attribute: String,
        value: String,
        reason: String,
    },
    /// A loop with a constant trip count was left rolled.
    UnrollCeilingExceeded {
        value: String,
        trip_count: i64,
        ceiling: usize,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnsafeFreezeSkipped {
                attribute,
                value,
                reason,
            } => write!(f, "kept read of '{attribute}' (%{value}): {reason}"),
            Diagnostic::UnrollCeilingExceeded {
                value,
                trip_count,
                ceiling,
            } => write!(
                f,
                "kept loop producing %{value}: trip count {trip_count} exceeds ceiling {ceiling}"
            ),
        }
    }
}

/// Shared state handed to every pass.
pub struct PassContext<'a> {
    pub registry: &'a SchemaRegistry,
    pub snapshot: &'a dyn ModuleSnapshot,
    pub config: &'a PipelineConfig,
    pub(crate) alias: Option<AliasDb>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> PassContext<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        snapshot: &'a dyn ModuleSnapshot,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            registry,
            snapshot,
            config,
            alias: None,
            diagnostics: Vec::new(),
        }
    }

    /// Compute alias information for the graph's current structure.
    pub fn refresh_alias(&mut self, graph: &Graph) -> Result<()> {
        self.alias = Some(AliasDb::analyze(graph, self.registry)?);
        Ok(())
    }

    /// Get the current alias information.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisUnavailable` if it was never computed or has been
    /// invalidated.
    pub fn alias(&self) -> Result<&AliasDb> {
        self.alias.as_ref().ok_or_else(|| Error::AnalysisUnavailable {
            analysis: "alias".to_string(),
        })
    }

    /// Record a diagnostic once.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub(crate) fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

/// A graph rewrite.
///
/// `run()` returns `Ok(true)` if the pass changed the graph and `Ok(false)`
/// otherwise; the driver uses this to reach a fixed point. A pass that
/// returns an error must leave no half-applied rewrite behind it.
///
/// # Example
///
/// ```
/// use quench_compiler::{Pass, PassContext, Stage};
/// use quench_core::{Graph, Result};
///
/// struct CountNodes;
///
/// impl Pass for CountNodes {
///     fn name(&self) -> &str {
///         "count_nodes"
///     }
///
///     fn stage(&self) -> Stage {
///         Stage::Peephole
///     }
///
///     fn run(&self, graph: &mut Graph, _ctx: &mut PassContext<'_>) -> Result<bool> {
///         tracing::debug!(nodes = graph.node_count());
///         Ok(false)
///     }
/// }
/// ```
pub trait Pass: Send + Sync {
    /// Get the pass name (used for logging and debugging).
    fn name(&self) -> &str;

    /// Get the stage this pass belongs to.
    fn stage(&self) -> Stage;

    /// Analyses that must be valid before the pass runs.
    fn requires(&self) -> &[Analysis] {
        &[]
    }

    /// Analyses made stale when the pass reports a change.
    fn invalidates(&self) -> &[Analysis] {
        &[Analysis::Alias, Analysis::Shape]
    }

    /// Run the pass on the given graph.
    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<bool>;
}
