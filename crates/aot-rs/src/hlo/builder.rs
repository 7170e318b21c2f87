use std::collections::BTreeMap;

use thiserror::Error;

use super::computation::{Computation, CustomCallSpec, Instruction, InstructionId, Opcode};
use super::literal::Literal;
use super::shape::{Shape, ShapeError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("operand {0} is not defined in this computation")]
    UnknownOperand(InstructionId),
    #[error("parameter number {0} is declared twice")]
    DuplicateParameter(usize),
    #[error("parameter numbers must be contiguous from zero; missing {0}")]
    MissingParameter(usize),
    #[error("{op}: {reason}")]
    Invalid { op: &'static str, reason: String },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl BuildError {
    pub(super) fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        BuildError::Invalid {
            op,
            reason: reason.into(),
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Incrementally constructs a [`Computation`], inferring result shapes.
#[derive(Debug)]
pub struct ComputationBuilder {
    name: String,
    instructions: Vec<Instruction>,
    parameters: BTreeMap<usize, InstructionId>,
    next_id: u32,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            parameters: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn shape_of(&self, id: InstructionId) -> BuildResult<&Shape> {
        self.instructions
            .iter()
            .find(|inst| inst.id == id)
            .map(|inst| &inst.shape)
            .ok_or(BuildError::UnknownOperand(id))
    }

    fn emit(
        &mut self,
        opcode: Opcode,
        operands: Vec<InstructionId>,
        shape: Shape,
    ) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        let name = format!("{}.{}", opcode.name(), id.0);
        self.instructions.push(Instruction {
            id,
            name,
            opcode,
            operands,
            shape,
        });
        id
    }

    pub fn parameter(&mut self, number: usize, shape: Shape) -> BuildResult<InstructionId> {
        if self.parameters.contains_key(&number) {
            return Err(BuildError::DuplicateParameter(number));
        }
        validate_layouts(&shape)?;
        let id = self.emit(Opcode::Parameter { number }, Vec::new(), shape);
        self.parameters.insert(number, id);
        Ok(id)
    }

    pub fn constant(&mut self, literal: Literal) -> BuildResult<InstructionId> {
        if !literal.is_consistent() {
            return Err(BuildError::invalid(
                "constant",
                format!(
                    "{} bytes do not match shape {}",
                    literal.byte_len(),
                    literal.shape
                ),
            ));
        }
        let shape = literal.shape.clone();
        validate_layouts(&shape)?;
        Ok(self.emit(Opcode::Constant(literal), Vec::new(), shape))
    }

    pub fn concatenate(
        &mut self,
        operands: &[InstructionId],
        dimension: usize,
    ) -> BuildResult<InstructionId> {
        let shapes = operands
            .iter()
            .map(|id| self.shape_of(*id).cloned())
            .collect::<BuildResult<Vec<_>>>()?;
        let shape = infer_concatenate_shape(&shapes, dimension)?;
        Ok(self.emit(
            Opcode::Concatenate { dimension },
            operands.to_vec(),
            shape,
        ))
    }

    pub fn copy(&mut self, operand: InstructionId) -> BuildResult<InstructionId> {
        let shape = self.shape_of(operand)?.clone();
        if !shape.is_array() {
            return Err(BuildError::invalid("copy", format!("operand shape {shape} is not an array")));
        }
        Ok(self.emit(Opcode::Copy, vec![operand], shape))
    }

    pub fn tuple(&mut self, operands: &[InstructionId]) -> BuildResult<InstructionId> {
        let shapes = operands
            .iter()
            .map(|id| self.shape_of(*id).cloned())
            .collect::<BuildResult<Vec<_>>>()?;
        Ok(self.emit(Opcode::Tuple, operands.to_vec(), Shape::tuple(shapes)))
    }

    pub fn get_tuple_element(
        &mut self,
        operand: InstructionId,
        index: usize,
    ) -> BuildResult<InstructionId> {
        let shape = self.shape_of(operand)?;
        if !shape.is_tuple() {
            return Err(BuildError::invalid(
                "get-tuple-element",
                format!("operand shape {shape} is not a tuple"),
            ));
        }
        let element = shape.tuple_shapes().get(index).cloned().ok_or_else(|| {
            BuildError::invalid(
                "get-tuple-element",
                format!("index {index} out of range for {shape}"),
            )
        })?;
        Ok(self.emit(Opcode::GetTupleElement { index }, vec![operand], element))
    }

    pub fn dot(&mut self, lhs: InstructionId, rhs: InstructionId) -> BuildResult<InstructionId> {
        let lhs_shape = self.shape_of(lhs)?.clone();
        let rhs_shape = self.shape_of(rhs)?.clone();
        let shape = infer_dot_shape(&lhs_shape, &rhs_shape)?;
        Ok(self.emit(Opcode::Dot, vec![lhs, rhs], shape))
    }

    pub fn custom_call(
        &mut self,
        spec: CustomCallSpec,
        operands: &[InstructionId],
        shape: Shape,
    ) -> BuildResult<InstructionId> {
        for id in operands {
            self.shape_of(*id)?;
        }
        if spec.target.is_empty() {
            return Err(BuildError::invalid("custom-call", "target symbol is empty"));
        }
        if let Some(layouts) = &spec.operand_layouts {
            if layouts.len() != operands.len() {
                return Err(BuildError::invalid(
                    "custom-call",
                    format!(
                        "{} operand layouts declared for {} operands",
                        layouts.len(),
                        operands.len()
                    ),
                ));
            }
            for (layout, id) in layouts.iter().zip(operands) {
                let operand_shape = self.shape_of(*id)?;
                if !operand_shape.is_array() {
                    return Err(BuildError::invalid(
                        "custom-call",
                        format!("layout declared for non-array operand {id}"),
                    ));
                }
                layout.validate_for_rank(operand_shape.rank())?;
            }
        }
        validate_layouts(&shape)?;
        Ok(self.emit(Opcode::CustomCall(spec), operands.to_vec(), shape))
    }

    /// Finishes the computation with `root` as its result.
    pub fn build(self, root: InstructionId) -> BuildResult<Computation> {
        if !self.instructions.iter().any(|inst| inst.id == root) {
            return Err(BuildError::UnknownOperand(root));
        }
        for (expected, number) in self.parameters.keys().enumerate() {
            if *number != expected {
                return Err(BuildError::MissingParameter(expected));
            }
        }
        Ok(Computation::from_parts(self.name, self.instructions, root))
    }
}

pub(super) fn validate_layouts(shape: &Shape) -> BuildResult<()> {
    for (_, leaf) in shape.leaves() {
        if let Some(layout) = leaf.layout() {
            layout.validate_for_rank(leaf.rank())?;
        }
    }
    Ok(())
}

/// Result shape of concatenating `shapes` along `dimension`.
pub fn infer_concatenate_shape(shapes: &[Shape], dimension: usize) -> BuildResult<Shape> {
    let first = shapes
        .first()
        .ok_or_else(|| BuildError::invalid("concatenate", "requires at least one operand"))?;
    for shape in shapes {
        if !shape.is_array() {
            return Err(BuildError::invalid(
                "concatenate",
                format!("operand shape {shape} is not an array"),
            ));
        }
    }
    if dimension >= first.rank() {
        return Err(BuildError::invalid(
            "concatenate",
            format!("dimension {dimension} out of range for rank {}", first.rank()),
        ));
    }
    let mut dims = first.dims().to_vec();
    for shape in &shapes[1..] {
        if shape.element_type() != first.element_type() || shape.rank() != first.rank() {
            return Err(BuildError::invalid(
                "concatenate",
                format!("operand {shape} does not match {first}"),
            ));
        }
        for (axis, (a, b)) in shape.dims().iter().zip(first.dims()).enumerate() {
            if axis != dimension && a != b {
                return Err(BuildError::invalid(
                    "concatenate",
                    format!("operand {shape} differs from {first} in dimension {axis}"),
                ));
            }
        }
        dims[dimension] += shape.dims()[dimension];
    }
    Ok(Shape::array(first.element_type(), dims))
}

pub(super) fn infer_dot_shape(lhs: &Shape, rhs: &Shape) -> BuildResult<Shape> {
    if !lhs.is_array() || !rhs.is_array() || lhs.rank() != 2 || rhs.rank() != 2 {
        return Err(BuildError::invalid(
            "dot",
            format!("expects rank-2 arrays, got {lhs} and {rhs}"),
        ));
    }
    if lhs.element_type() != rhs.element_type() {
        return Err(BuildError::invalid(
            "dot",
            format!("element types differ: {lhs} vs {rhs}"),
        ));
    }
    if lhs.dims()[1] != rhs.dims()[0] {
        return Err(BuildError::invalid(
            "dot",
            format!("contracting dimensions differ: {lhs} vs {rhs}"),
        ));
    }
    Ok(Shape::array(
        lhs.element_type(),
        vec![lhs.dims()[0], rhs.dims()[1]],
    ))
}
