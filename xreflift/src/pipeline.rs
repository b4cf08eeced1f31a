//! The standard optimization pipeline: a fixed sequence of passes, repeated until the module stops
//! changing.

use crate::ir::Module;
use crate::log::*;

/// Knobs of the standard pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// 0 disables everything but dead-code elimination; 1 adds constant folding and control-flow
    /// simplification; 2 and above add inlining and the loop passes.
    pub opt_level: u32,
    /// Preference for smaller code. Each level halves the largest loop the unroller may produce.
    pub size_level: u32,
    /// Maximum callee size (in instructions) to inline
    pub inline_threshold: usize,
    pub unroll_loops: bool,
    pub unroll_max_trip_count: usize,
    /// Not supported; requesting it only produces a warning
    pub vectorize: bool,
    pub tail_calls: bool,
    /// Treat calls to external functions named like C library functions as those functions
    pub recognize_lib_calls: bool,
    /// Bound on the number of rounds over all passes
    pub max_iterations: usize,
}

impl PipelineConfig {
    /// The most aggressive preset, for use on freshly lifted code
    pub fn aggressive() -> Self {
        Self {
            opt_level: 3,
            size_level: 2,
            inline_threshold: 100,
            unroll_loops: true,
            unroll_max_trip_count: 32,
            vectorize: false,
            tail_calls: true,
            recognize_lib_calls: false,
            max_iterations: 16,
        }
    }

    /// Largest number of instructions a fully unrolled loop may have
    fn max_unrolled_size(&self) -> usize {
        crate::loop_unroll::MAX_UNROLLED_SIZE >> self.size_level.min(8)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::aggressive()
    }
}

/// Run the pipeline over `module` until nothing changes, or for at most
/// [`PipelineConfig::max_iterations`] rounds. Returns the number of rounds that changed something.
pub fn run_pipeline(module: &mut Module, config: &PipelineConfig) -> usize {
    if config.vectorize {
        warn!("Vectorization was requested but is not supported; skipping it");
    }
    info!("Running optimization pipeline"; "opt_level" => config.opt_level, "module" => &module.name);

    let mut rounds = 0;
    for round in 0..config.max_iterations {
        let mut changed = false;
        if config.opt_level >= 2 {
            changed |= crate::inliner::run(module, config.inline_threshold);
        }
        if config.opt_level >= 1 {
            changed |= crate::constant_folding::run(module);
            changed |= crate::simplify_cfg::run(module);
        }
        if config.recognize_lib_calls {
            changed |= crate::lib_calls::run(module);
        }
        changed |= crate::dead_code::run(module);
        if config.opt_level >= 2 && config.unroll_loops {
            changed |= crate::loop_unroll::run(
                module,
                config.unroll_max_trip_count,
                config.max_unrolled_size(),
            );
        }
        if config.opt_level >= 2 && config.tail_calls {
            changed |= crate::tail_calls::run(module);
        }
        if !changed {
            debug!("Pipeline reached a fixed point"; "rounds" => round);
            return rounds;
        }
        rounds += 1;
    }
    warn!("Pipeline did not converge"; "max_iterations" => config.max_iterations);
    rounds
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Function, InstKind, Linkage, Type, Value};
    use crate::serialize_ir::Parseable;

    #[test]
    fn internal_helpers_are_inlined_and_folded_away() {
        let mut m = Module::parse_from(
            r#"
module "m" pointer_bits 32
define internal @double(i32) -> i32 {
entry:
  %0 = mul i32 %arg0, 2:i32
  ret %0
}
define @f() -> i32 {
entry:
  %0 = call i32 @double(21:i32)
  ret %0
}
"#,
        )
        .unwrap();
        assert!(run_pipeline(&mut m, &PipelineConfig::aggressive()) > 0);

        assert!(m.get_function("double").is_none());
        let f = m.function(m.get_function("f").unwrap());
        assert_eq!(f.block_ids().len(), 1);
        let insts = f.instructions();
        assert_eq!(insts.len(), 1);
        assert_eq!(
            f.inst(insts[0]).kind,
            InstKind::Ret {
                value: Some(Value::int(42, 32))
            }
        );
    }

    #[test]
    fn level_zero_only_removes_dead_code() {
        let mut m = Module::new("m", 32);
        let mut f = Function::new("f", vec![], Type::Int(32));
        let entry = f.add_block("entry");
        let c = f.append_inst(
            entry,
            InstKind::Cast {
                op: crate::ir::CastOp::ZExt,
                value: Value::int(1, 8),
            },
            Type::Int(32),
        );
        f.append_inst(
            entry,
            InstKind::Ret {
                value: Some(Value::Inst(c)),
            },
            Type::Void,
        );
        f.linkage = Linkage::External;
        let f = m.add_function(f);

        let config = PipelineConfig {
            opt_level: 0,
            ..PipelineConfig::aggressive()
        };
        assert_eq!(run_pipeline(&mut m, &config), 0);
        assert_eq!(m.function(f).num_instructions(), 2);
    }

    #[test]
    fn aggressive_preset_prefers_small_unrolled_loops() {
        let config = PipelineConfig::aggressive();
        assert_eq!(config.size_level, 2);
        assert_eq!(config.inline_threshold, 100);
        assert_eq!(
            config.max_unrolled_size(),
            crate::loop_unroll::MAX_UNROLLED_SIZE / 4
        );
        let config = PipelineConfig {
            size_level: 0,
            ..config
        };
        assert_eq!(config.max_unrolled_size(), crate::loop_unroll::MAX_UNROLLED_SIZE);
    }
}
