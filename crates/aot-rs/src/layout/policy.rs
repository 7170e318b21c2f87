use crate::hlo::{Computation, Instruction, Layout, Opcode, ShapeIndex};
use crate::primitive::ElementType;

use super::constraints::LayoutLocation;

/// A layout the backend needs at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRequirement {
    pub location: LayoutLocation,
    pub layout: Layout,
}

impl LayoutRequirement {
    pub fn new(location: LayoutLocation, layout: Layout) -> Self {
        Self { location, layout }
    }
}

/// Injected backend knowledge: which locations need which physical layout.
pub trait BackendConstraintPolicy: Send + Sync {
    fn requirements(&self, computation: &Computation, instruction: &Instruction)
        -> Vec<LayoutRequirement>;
}

impl<F> BackendConstraintPolicy for F
where
    F: Fn(&Computation, &Instruction) -> Vec<LayoutRequirement> + Send + Sync,
{
    fn requirements(
        &self,
        computation: &Computation,
        instruction: &Instruction,
    ) -> Vec<LayoutRequirement> {
        self(computation, instruction)
    }
}

/// Policy that adds nothing; every layout comes from entry constraints or defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackendConstraints;

impl BackendConstraintPolicy for NoBackendConstraints {
    fn requirements(&self, _: &Computation, _: &Instruction) -> Vec<LayoutRequirement> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryRoutine {
    MatMul,
}

/// Target-machine queries consulted while choosing layouts.
pub trait TargetMachineFeatures: Send + Sync {
    fn has_library_routine(&self, routine: LibraryRoutine, element_type: ElementType) -> bool;
}

/// Requires row-major layouts wherever the emitted code calls a routine with
/// fixed memory-layout expectations.
///
/// - `Dot` with a library matmul for its element type: both operands and the result.
/// - Custom calls declaring operand layouts: those layouts.
/// - `Concatenate`: operands and result, since its thunk copies contiguous row-major chunks.
#[derive(Debug, Clone)]
pub struct LibraryCallLayoutPolicy<T> {
    features: T,
}

impl<T: TargetMachineFeatures> LibraryCallLayoutPolicy<T> {
    pub fn new(features: T) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &T {
        &self.features
    }
}

impl<T: TargetMachineFeatures> BackendConstraintPolicy for LibraryCallLayoutPolicy<T> {
    fn requirements(
        &self,
        computation: &Computation,
        instruction: &Instruction,
    ) -> Vec<LayoutRequirement> {
        let mut out = Vec::new();
        match &instruction.opcode {
            Opcode::Dot => {
                let element_type = instruction.shape.element_type();
                if self
                    .features
                    .has_library_routine(LibraryRoutine::MatMul, element_type)
                {
                    row_major_operands_and_result(computation, instruction, &mut out);
                }
            }
            Opcode::Concatenate { .. } => {
                row_major_operands_and_result(computation, instruction, &mut out);
            }
            Opcode::CustomCall(spec) => {
                if let Some(layouts) = &spec.operand_layouts {
                    for (operand, layout) in layouts.iter().enumerate() {
                        out.push(LayoutRequirement::new(
                            LayoutLocation::operand(instruction.id, operand),
                            layout.clone(),
                        ));
                    }
                }
            }
            _ => {}
        }
        out
    }
}

fn row_major_operands_and_result(
    computation: &Computation,
    instruction: &Instruction,
    out: &mut Vec<LayoutRequirement>,
) {
    for (operand, id) in instruction.operands.iter().enumerate() {
        if let Some(producer) = computation.instruction(*id) {
            if producer.shape.is_array() {
                out.push(LayoutRequirement::new(
                    LayoutLocation::operand(instruction.id, operand),
                    Layout::descending(producer.shape.rank()),
                ));
            }
        }
    }
    out.push(LayoutRequirement::new(
        LayoutLocation::Result {
            instruction: instruction.id,
            index: ShapeIndex::root(),
        },
        Layout::descending(instruction.shape.rank()),
    ));
}
