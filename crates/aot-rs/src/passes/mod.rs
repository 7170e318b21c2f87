//! Computation-level rewrite passes and the pipeline that sequences them.

mod dce;
mod operand_count_splitter;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::hlo::{Computation, InstructionId};

pub use dce::DeadCodeElimination;
pub use operand_count_splitter::OperandCountSplitter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    #[error("{pass}: cannot rewrite {instruction}: {reason}")]
    UnsupportedStructure {
        pass: &'static str,
        instruction: InstructionId,
        reason: String,
    },
    #[error("invalid pass configuration: {0}")]
    InvalidConfiguration(String),
}

pub type PassResult<T> = Result<T, PassError>;

/// Statistics reported by a single pass run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Whether the pass changed the computation.
    pub changed: bool,
    /// Instructions created by the pass.
    pub inserted_insts: usize,
    /// Instructions removed by the pass.
    pub erased_insts: usize,
}

impl PassStats {
    pub fn merge(self, other: PassStats) -> PassStats {
        PassStats {
            changed: self.changed || other.changed,
            inserted_insts: self.inserted_insts + other.inserted_insts,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

pub trait ComputationPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, computation: &mut Computation) -> PassResult<PassStats>;
}

pub enum Step {
    Pass(Arc<dyn ComputationPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn ComputationPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> PassPipeline {
        PassPipeline {
            steps: self.steps,
            log_stats: crate::env::pass_stats_enabled(),
            dump_ir: crate::env::dump_ir_enabled(),
        }
    }
}

/// Ordered passes with optional bounded fixed-point groups.
pub struct PassPipeline {
    steps: Vec<Step>,
    log_stats: bool,
    dump_ir: bool,
}

impl PassPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn with_logging(mut self, log_stats: bool, dump_ir: bool) -> Self {
        self.log_stats = log_stats;
        self.dump_ir = dump_ir;
        self
    }

    /// Runs every step, stopping at the first pass error.
    pub fn run(&self, computation: &mut Computation) -> PassResult<PassStats> {
        let mut totals = PassStats::default();
        run_steps(&self.steps, computation, &mut totals, self.log_stats, self.dump_ir)?;
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    computation: &mut Computation,
    totals: &mut PassStats,
    log_stats: bool,
    dump_ir: bool,
) -> PassResult<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(computation)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if log_stats {
                    info!(
                        computation = computation.name(),
                        pass = pass.name(),
                        changed = stats.changed,
                        inserted = stats.inserted_insts,
                        erased = stats.erased_insts,
                        insts = computation.len(),
                        "pass stats"
                    );
                }
                if dump_ir && stats.changed {
                    debug!(pass = pass.name(), "after pass:\n{computation}");
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                while iter < *max_iters {
                    iter += 1;
                    let changed = run_steps(steps, computation, totals, log_stats, dump_ir)?;
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}
