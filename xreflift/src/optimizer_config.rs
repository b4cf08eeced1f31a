//! Flags that impact how a lifted module is optimized.
//!
//! Unlike a process-wide store, an [`OptimizerConfig`] is an ordinary value handed to
//! [`optimize_module`](crate::optimize::optimize_module), so differently configured runs can
//! coexist in one process.

use crate::pipeline::PipelineConfig;

/// The optimizer configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Preset for the standard pipeline run between the two scaffolding removals
    pub pipeline: PipelineConfig,
    /// Run the standard pipeline at all. Without it, scaffolding is still stripped and
    /// placeholders are still lowered, but the semantic functions are never inlined.
    pub run_standard_pipeline: bool,
    /// Log the number of functions and globals before and after each step
    pub log_module_statistics: bool,
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Optimizer configuration parameters
pub enum CommandLineOptimizerConfig {
    DisableStandardPipeline,
    DisableInlining,
    DisableLoopUnrolling,
    DisableTailCalls,
    EnableLibraryCallRecognition,
    EnableVectorization,
    /// Allow fully unrolled loops of any size the unroller supports
    DisableSizeOptimization,
    /// Only fold constants and simplify control flow
    MinimalOptimizationLevel,
    EnableModuleStatistics,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            pipeline: PipelineConfig::aggressive(),
            run_standard_pipeline: true,
            log_module_statistics: false,
        }
    }
}

impl From<Vec<CommandLineOptimizerConfig>> for OptimizerConfig {
    fn from(v: Vec<CommandLineOptimizerConfig>) -> Self {
        use CommandLineOptimizerConfig::*;
        let mut r = OptimizerConfig::default();
        for v in v {
            match v {
                DisableStandardPipeline => {
                    r.run_standard_pipeline = false;
                }
                DisableInlining => {
                    r.pipeline.inline_threshold = 0;
                }
                DisableLoopUnrolling => {
                    r.pipeline.unroll_loops = false;
                }
                DisableTailCalls => {
                    r.pipeline.tail_calls = false;
                }
                EnableLibraryCallRecognition => {
                    r.pipeline.recognize_lib_calls = true;
                }
                EnableVectorization => {
                    r.pipeline.vectorize = true;
                }
                DisableSizeOptimization => {
                    r.pipeline.size_level = 0;
                }
                MinimalOptimizationLevel => {
                    r.pipeline.opt_level = 1;
                }
                EnableModuleStatistics => {
                    r.log_module_statistics = true;
                }
            }
        }
        r
    }
}
