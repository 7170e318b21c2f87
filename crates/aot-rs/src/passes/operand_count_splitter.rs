use tracing::debug;

use crate::hlo::{infer_concatenate_shape, Computation, InstructionId, Opcode, Shape};

use super::{ComputationPass, PassError, PassResult, PassStats};

/// Rewrites concatenations with more than `max_operands` operands into a
/// balanced tree of smaller concatenations.
///
/// Operands are grouped left to right into runs of `max_operands`; each run
/// becomes a new concatenation placed before the original, and the process
/// repeats on the list of partial results until it fits. The original
/// instruction keeps its id, name and shape, so users are untouched.
#[derive(Debug, Clone, Copy)]
pub struct OperandCountSplitter {
    max_operands: usize,
}

impl OperandCountSplitter {
    const NAME: &'static str = "operand-count-splitter";

    pub fn new(max_operands: usize) -> PassResult<Self> {
        if max_operands < 2 {
            return Err(PassError::InvalidConfiguration(format!(
                "operand limit must be at least 2, got {max_operands}"
            )));
        }
        Ok(Self { max_operands })
    }

    /// Uses `AOTRS_MAX_OPERANDS` when set, otherwise `default_max`.
    pub fn from_env(default_max: usize) -> PassResult<Self> {
        Self::new(crate::env::max_operands_override().unwrap_or(default_max))
    }

    pub fn max_operands(&self) -> usize {
        self.max_operands
    }

    fn split(
        &self,
        computation: &mut Computation,
        target: InstructionId,
        dimension: usize,
    ) -> PassResult<usize> {
        let Some(original) = computation.instruction(target) else {
            return Ok(0);
        };
        let base_name = original.name.clone();
        let layout = original.shape.layout().cloned();
        let mut current = original.operands.clone();
        let mut created = 0usize;

        while current.len() > self.max_operands {
            let mut next = Vec::with_capacity(current.len().div_ceil(self.max_operands));
            for group in current.chunks(self.max_operands) {
                if group.len() == 1 {
                    next.push(group[0]);
                    continue;
                }
                let shape = self.group_shape(computation, target, group, dimension)?;
                let shape = match &layout {
                    Some(layout) => shape.with_layout(layout.clone()).map_err(|err| {
                        self.unsupported(target, format!("cannot carry layout: {err}"))
                    })?,
                    None => shape,
                };
                let id = computation.insert_before(
                    target,
                    format!("{base_name}.split{created}"),
                    Opcode::Concatenate { dimension },
                    group.to_vec(),
                    shape,
                );
                created += 1;
                next.push(id);
            }
            current = next;
        }

        if let Some(inst) = computation.instruction_mut(target) {
            inst.operands = current;
        }
        Ok(created)
    }

    fn group_shape(
        &self,
        computation: &Computation,
        target: InstructionId,
        group: &[InstructionId],
        dimension: usize,
    ) -> PassResult<Shape> {
        let mut shapes = Vec::with_capacity(group.len());
        for id in group {
            let operand = computation
                .instruction(*id)
                .ok_or_else(|| self.unsupported(target, format!("operand {id} is undefined")))?;
            if !operand.shape.is_array() {
                return Err(self.unsupported(
                    target,
                    format!("operand {id} has non-array shape {}", operand.shape),
                ));
            }
            shapes.push(operand.shape.clone());
        }
        infer_concatenate_shape(&shapes, dimension)
            .map_err(|err| self.unsupported(target, err.to_string()))
    }

    fn unsupported(&self, instruction: InstructionId, reason: impl Into<String>) -> PassError {
        PassError::UnsupportedStructure {
            pass: Self::NAME,
            instruction,
            reason: reason.into(),
        }
    }
}

impl ComputationPass for OperandCountSplitter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, computation: &mut Computation) -> PassResult<PassStats> {
        let mut targets = Vec::new();
        for inst in computation.instructions() {
            if inst.operands.len() <= self.max_operands {
                continue;
            }
            match &inst.opcode {
                Opcode::Concatenate { dimension } => targets.push((inst.id, *dimension)),
                Opcode::CustomCall(spec) => {
                    return Err(self.unsupported(
                        inst.id,
                        format!(
                            "custom call '{}' takes {} operands, limit is {}",
                            spec.target,
                            inst.operands.len(),
                            self.max_operands
                        ),
                    ));
                }
                _ => {}
            }
        }

        let mut inserted = 0usize;
        for (target, dimension) in targets {
            let created = self.split(computation, target, dimension)?;
            debug!(instruction = %target, created, limit = self.max_operands, "split concatenate");
            inserted += created;
        }

        Ok(PassStats {
            changed: inserted > 0,
            inserted_insts: inserted,
            erased_insts: 0,
        })
    }
}
