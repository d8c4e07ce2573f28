//! Analyses and rewrite passes for quench graphs.
//!
//! The pipeline prepares a graph for a lowering backend. Passes run in stages:
//! 1. **Freezing** - Fold module parameter/buffer reads into constants
//! 2. **Unrolling** - Expand loops whose trip count became constant
//! 3. **Peephole** - Cancel permutation pairs that compose to the identity
//!
//! Alias analysis and shape analysis are shared services. Each pass declares
//! which of them it needs and which of them it invalidates when it changes
//! the graph; the driver recomputes stale analyses before the next pass that
//! needs them and repeats full rounds until one round changes nothing.
//!
//! # Example
//!
//! ```
//! use quench_compiler::{run_pipeline, PipelineConfig};
//! use quench_core::{ConstantValue, GraphBuilder, ParameterSnapshot, SchemaRegistry, TensorValue, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut b = GraphBuilder::new();
//! let module = b.input("self", ValueType::Module("Net".to_string()));
//! let x = b.input("x", ValueType::Tensor);
//! let w = b.get_attr(module, "weight", ValueType::Tensor)?;
//! let y = b.op("aten::mul.Tensor", &[x, w], ValueType::Tensor)?;
//! b.output(y)?;
//! let mut graph = b.finish()?;
//!
//! let registry = SchemaRegistry::with_defaults()?;
//! let mut snapshot = ParameterSnapshot::new();
//! snapshot.insert("weight", ConstantValue::Tensor(TensorValue::from_f32(vec![0.5])));
//!
//! let report = run_pipeline(&mut graph, &registry, &snapshot, PipelineConfig::default())?;
//! assert!(report.changed);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod pass;
pub mod passes;

pub use analysis::{AliasDb, ShapeAnalysis};
pub use config::PipelineConfig;
pub use pass::{Analysis, Diagnostic, Pass, PassContext, Stage};
pub use passes::{
    eliminate_dead_code, EliminatePermutationsPass, FreezeModulePass, UnrollConstantLoopsPass,
};

use quench_core::{Error, Graph, ModuleSnapshot, Result, SchemaRegistry};

/// Driver states, in the order a clean run passes through them.
///
/// `AliasValid` and `ShapeValid` are re-entered whenever a pass invalidates
/// an analysis that a later pass requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Fresh,
    AliasValid,
    ShapeValid,
    Frozen,
    Unrolled,
    Peepholed,
    Done,
}

impl PipelineState {
    fn after(stage: Stage) -> Self {
        match stage {
            Stage::Freezing => PipelineState::Frozen,
            Stage::Unrolling => PipelineState::Unrolled,
            Stage::Peephole => PipelineState::Peepholed,
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Whether any pass changed the graph.
    pub changed: bool,

    /// Number of full rounds, the final unchanged one included.
    pub iterations: usize,

    /// Final state (always `Done` on success).
    pub state: PipelineState,

    /// Every state transition, starting at `Fresh`.
    pub trace: Vec<PipelineState>,

    /// Conservative decisions taken along the way.
    pub diagnostics: Vec<Diagnostic>,
}

/// Pass pipeline with pluggable passes.
///
/// Built-in passes are registered in their stages; custom passes can be
/// added via `add_pass()`.
pub struct Pipeline {
    /// All passes to run, ordered by (stage, registration order).
    passes: Vec<Box<dyn Pass>>,

    config: PipelineConfig,
}

/// Analysis validity tracked across one run.
struct Analyses {
    shape_valid: bool,
    trace: Vec<PipelineState>,
}

impl Analyses {
    fn enter(&mut self, state: PipelineState) {
        if self.trace.last() != Some(&state) {
            self.trace.push(state);
        }
    }

    fn ensure(&mut self, analysis: Analysis, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<()> {
        if ctx.alias.is_none() {
            ctx.refresh_alias(graph)?;
            self.shape_valid = false;
            self.enter(PipelineState::AliasValid);
        }
        if analysis == Analysis::Shape && !self.shape_valid {
            let shapes = ShapeAnalysis::run(graph, ctx.registry, ctx.alias.as_ref())?;
            shapes.apply(graph)?;
            self.shape_valid = true;
            self.enter(PipelineState::ShapeValid);
        }
        Ok(())
    }

    fn invalidate(&mut self, analysis: Analysis, ctx: &mut PassContext<'_>) {
        match analysis {
            Analysis::Alias => ctx.alias = None,
            Analysis::Shape => self.shape_valid = false,
        }
    }
}

impl Pipeline {
    /// Create a pipeline with built-in passes.
    ///
    /// The built-in passes are:
    /// - `FreezeModulePass` (Freezing stage)
    /// - `UnrollConstantLoopsPass` (Unrolling stage)
    /// - `EliminatePermutationsPass` (Peephole stage)
    pub fn new(config: PipelineConfig) -> Self {
        let mut pipeline = Self {
            passes: Vec::new(),
            config,
        };

        pipeline.add_pass(FreezeModulePass::new());
        pipeline.add_pass(UnrollConstantLoopsPass::new());
        pipeline.add_pass(EliminatePermutationsPass::new());

        pipeline
    }

    /// Add a custom pass to the pipeline.
    ///
    /// The pass will be inserted into the appropriate stage (determined by
    /// `pass.stage()`). Within a stage, passes run in the order they were
    /// registered.
    ///
    /// # Returns
    ///
    /// Returns a mutable reference to self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run all passes to a fixed point.
    ///
    /// The passes work on a copy of `graph`, which is written back only when
    /// the run succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a node has no registered schema (`UnknownOperator`)
    /// - the input graph fails verification
    /// - an analysis or the round loop exceeds its bound
    ///   (`AnalysisNonTermination`)
    /// - any pass fails
    #[tracing::instrument(skip_all, fields(nodes = graph.node_count(), values = graph.value_count()))]
    pub fn run(
        &mut self,
        graph: &mut Graph,
        registry: &SchemaRegistry,
        snapshot: &dyn ModuleSnapshot,
    ) -> Result<PipelineReport> {
        registry.validate_graph(graph)?;
        graph.verify()?;

        self.passes.sort_by_key(|p| p.stage());

        let mut working = graph.clone();
        let mut ctx = PassContext::new(registry, snapshot, &self.config);
        let mut analyses = Analyses {
            shape_valid: false,
            trace: vec![PipelineState::Fresh],
        };
        analyses.ensure(Analysis::Shape, &mut working, &mut ctx)?;

        let mut changed_any = false;
        let mut iterations = 0;
        loop {
            if iterations >= self.config.max_iterations {
                return Err(Error::AnalysisNonTermination {
                    analysis: "pass pipeline".to_string(),
                    limit: self.config.max_iterations,
                });
            }
            iterations += 1;

            let mut changed = false;
            for pass in &self.passes {
                let _span = tracing::debug_span!(
                    "pass",
                    name = pass.name(),
                    stage = ?pass.stage(),
                    iteration = iterations
                )
                .entered();

                for &analysis in pass.requires() {
                    analyses.ensure(analysis, &mut working, &mut ctx)?;
                }

                if pass.run(&mut working, &mut ctx)? {
                    working.verify()?;
                    changed = true;
                    for &analysis in pass.invalidates() {
                        analyses.invalidate(analysis, &mut ctx);
                    }
                    tracing::debug!("Pass changed the graph");
                }
                analyses.enter(PipelineState::after(pass.stage()));
            }

            changed_any |= changed;
            if !changed {
                break;
            }
        }

        // Leave the graph with records describing its final structure
        analyses.ensure(Analysis::Shape, &mut working, &mut ctx)?;
        analyses.enter(PipelineState::Done);

        let diagnostics = ctx.into_diagnostics();
        tracing::debug!(
            iterations,
            changed = changed_any,
            diagnostics = diagnostics.len(),
            "Pipeline finished"
        );

        *graph = working;
        Ok(PipelineReport {
            changed: changed_any,
            iterations,
            state: PipelineState::Done,
            trace: analyses.trace,
            diagnostics,
        })
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

/// Convenience function: creates a pipeline with the built-in passes and
/// runs it.
#[tracing::instrument(skip_all)]
pub fn run_pipeline(
    graph: &mut Graph,
    registry: &SchemaRegistry,
    snapshot: &dyn ModuleSnapshot,
    config: PipelineConfig,
) -> Result<PipelineReport> {
    let mut pipeline = Pipeline::new(config);
    pipeline.run(graph, registry, snapshot)
}
