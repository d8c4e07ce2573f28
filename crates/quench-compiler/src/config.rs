//! Pipeline configuration.

/// Tuning knobs for the pass pipeline.
///
/// # Example
///
/// ```
/// use quench_compiler::PipelineConfig;
///
/// let config = PipelineConfig::default()
///     .with_unroll_ceiling(32)
///     .with_preserved_attribute("training");
/// assert_eq!(config.unroll_ceiling, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Loops with a larger constant trip count are left rolled.
    pub unroll_ceiling: usize,

    /// Bound on full Freezer → Unroller → Peephole rounds.
    pub max_iterations: usize,

    /// Module attribute paths that must never be folded into constants.
    /// A path also covers everything below it (`encoder` covers
    /// `encoder.layer1.weight`).
    pub preserved_attributes: Vec<String>,

    /// Sweep dead nodes after rewrites.
    pub run_dead_code_elimination: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unroll_ceiling: 8,
            max_iterations: 16,
            preserved_attributes: Vec::new(),
            run_dead_code_elimination: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_unroll_ceiling(mut self, ceiling: usize) -> Self {
        self.unroll_ceiling = ceiling;
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_preserved_attribute(mut self, path: impl Into<String>) -> Self {
        self.preserved_attributes.push(path.into());
        self
    }

    pub fn with_dead_code_elimination(mut self, enabled: bool) -> Self {
        self.run_dead_code_elimination = enabled;
        self
    }

    /// Check whether an attribute path is covered by a preserved path.
    pub fn is_preserved(&self, path: &str) -> bool {
        self.preserved_attributes.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}
