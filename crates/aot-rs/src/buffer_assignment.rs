//! Compile-time assignment of abstract buffers to instruction results.
//!
//! Every array leaf produced by an instruction is a logical buffer. Tuples and
//! tuple projections do not own storage; they alias the buffers of their
//! operands. Alias groups are merged with [`DisjointSet`] and each group
//! becomes one [`BufferAllocation`].

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::disjoint_set::DisjointSet;
use crate::hlo::{Computation, InstructionId, Opcode, ShapeIndex};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferAssignmentError {
    #[error("operand {operand} of {instruction} is not defined")]
    UnknownOperand {
        instruction: InstructionId,
        operand: InstructionId,
    },
    #[error("{instruction} aliases missing buffer at {index} of {operand}")]
    MissingAlias {
        instruction: InstructionId,
        operand: InstructionId,
        index: ShapeIndex,
    },
    #[error("alias group containing {0} has no defining instruction")]
    Undefined(InstructionId),
    #[error("no buffer for {instruction} at {index}")]
    NoSlice {
        instruction: InstructionId,
        index: ShapeIndex,
    },
}

pub type BufferAssignmentResult<T> = Result<T, BufferAssignmentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferAllocationIndex(pub usize);

impl fmt::Display for BufferAllocationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationKind {
    /// Caller-provided argument memory for leaf `index` of parameter `number`.
    Parameter { number: usize, index: ShapeIndex },
    /// Read-only constant data, initialized from the literal of `instruction`.
    Constant { instruction: InstructionId },
    /// Scratch owned by the execution invocation.
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferAllocation {
    pub index: BufferAllocationIndex,
    pub size: usize,
    pub kind: AllocationKind,
    /// Holds part of the computation result.
    pub is_output: bool,
    /// Instruction leaf that writes this buffer.
    pub defined_by: (InstructionId, ShapeIndex),
}

impl BufferAllocation {
    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, AllocationKind::Parameter { .. })
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, AllocationKind::Constant { .. })
    }
}

/// Byte range inside one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub allocation: BufferAllocationIndex,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct BufferAssignment {
    allocations: Vec<BufferAllocation>,
    slices: HashMap<(InstructionId, ShapeIndex), BufferSlice>,
    outputs: Vec<(ShapeIndex, BufferSlice)>,
}

impl BufferAssignment {
    pub fn run(computation: &Computation) -> BufferAssignmentResult<Self> {
        let mut keys: HashMap<(InstructionId, ShapeIndex), usize> = HashMap::new();
        let mut members: Vec<(InstructionId, ShapeIndex)> = Vec::new();
        let mut sets = DisjointSet::default();

        for inst in computation.instructions() {
            for (index, leaf) in inst.shape.leaves() {
                if !leaf.is_array() {
                    continue;
                }
                let key = sets.push();
                keys.insert((inst.id, index.clone()), key);
                members.push((inst.id, index));
            }
        }

        for inst in computation.instructions() {
            let aliases: Vec<(ShapeIndex, InstructionId, ShapeIndex)> = match inst.opcode {
                Opcode::Tuple => inst
                    .shape
                    .leaves()
                    .into_iter()
                    .filter(|(_, leaf)| leaf.is_array())
                    .filter_map(|(index, _)| {
                        let (element, rest) = index.split_first()?;
                        Some((index, *inst.operands.get(element)?, rest))
                    })
                    .collect(),
                Opcode::GetTupleElement { index: element } => {
                    let Some(operand) = inst.operands.first().copied() else {
                        continue;
                    };
                    inst.shape
                        .leaves()
                        .into_iter()
                        .filter(|(_, leaf)| leaf.is_array())
                        .map(|(index, _)| {
                            let source = index.prepended(element);
                            (index, operand, source)
                        })
                        .collect()
                }
                _ => continue,
            };
            for (index, operand, source) in aliases {
                if computation.instruction(operand).is_none() {
                    return Err(BufferAssignmentError::UnknownOperand {
                        instruction: inst.id,
                        operand,
                    });
                }
                let own = keys[&(inst.id, index)];
                let Some(&other) = keys.get(&(operand, source.clone())) else {
                    return Err(BufferAssignmentError::MissingAlias {
                        instruction: inst.id,
                        operand,
                        index: source,
                    });
                };
                sets.union(own, other);
            }
        }

        let root = computation.root();
        let mut allocations = Vec::new();
        let mut slices = HashMap::new();
        for group in sets.groups() {
            let definer = group
                .iter()
                .map(|key| &members[*key])
                .find(|(id, _)| {
                    computation.instruction(*id).is_some_and(|inst| {
                        !matches!(
                            inst.opcode,
                            Opcode::Tuple | Opcode::GetTupleElement { .. }
                        )
                    })
                })
                .cloned()
                .ok_or_else(|| BufferAssignmentError::Undefined(members[group[0]].0))?;
            let defining = computation
                .instruction(definer.0)
                .ok_or(BufferAssignmentError::Undefined(definer.0))?;
            let size = defining
                .shape
                .subshape(&definer.1)
                .map(|s| s.byte_size())
                .unwrap_or(0);
            let kind = match defining.opcode {
                Opcode::Parameter { number } => AllocationKind::Parameter {
                    number,
                    index: definer.1.clone(),
                },
                Opcode::Constant(_) => AllocationKind::Constant {
                    instruction: defining.id,
                },
                _ => AllocationKind::Temporary,
            };
            let is_output = group.iter().any(|key| members[*key].0 == root);
            let index = BufferAllocationIndex(allocations.len());
            let slice = BufferSlice {
                allocation: index,
                offset: 0,
                size,
            };
            for key in &group {
                slices.insert(members[*key].clone(), slice);
            }
            allocations.push(BufferAllocation {
                index,
                size,
                kind,
                is_output,
                defined_by: definer,
            });
        }

        let mut outputs = Vec::new();
        for (index, leaf) in computation.result_shape().leaves() {
            if !leaf.is_array() {
                continue;
            }
            let slice = slices
                .get(&(root, index.clone()))
                .copied()
                .ok_or_else(|| BufferAssignmentError::NoSlice {
                    instruction: root,
                    index: index.clone(),
                })?;
            outputs.push((index, slice));
        }

        debug!(
            computation = computation.name(),
            allocations = allocations.len(),
            total_bytes = allocations.iter().map(|a| a.size).sum::<usize>(),
            "buffer assignment finished"
        );

        Ok(Self {
            allocations,
            slices,
            outputs,
        })
    }

    pub fn allocations(&self) -> &[BufferAllocation] {
        &self.allocations
    }

    pub fn allocation(&self, index: BufferAllocationIndex) -> Option<&BufferAllocation> {
        self.allocations.get(index.0)
    }

    pub fn slice(&self, instruction: InstructionId, index: &ShapeIndex) -> Option<BufferSlice> {
        self.slices.get(&(instruction, index.clone())).copied()
    }

    /// Slice for the whole (array) result of `instruction`.
    pub fn unique_slice(&self, instruction: InstructionId) -> BufferAssignmentResult<BufferSlice> {
        self.slice(instruction, &ShapeIndex::root())
            .ok_or(BufferAssignmentError::NoSlice {
                instruction,
                index: ShapeIndex::root(),
            })
    }

    /// Result leaves in depth-first order with their slices.
    pub fn output_slices(&self) -> &[(ShapeIndex, BufferSlice)] {
        &self.outputs
    }

    pub fn parameter_allocation(
        &self,
        number: usize,
        index: &ShapeIndex,
    ) -> Option<&BufferAllocation> {
        self.allocations.iter().find(|alloc| {
            matches!(&alloc.kind, AllocationKind::Parameter { number: n, index: i } if *n == number && i == index)
        })
    }

    pub fn total_bytes(&self) -> usize {
        self.allocations.iter().map(|alloc| alloc.size).sum()
    }
}
