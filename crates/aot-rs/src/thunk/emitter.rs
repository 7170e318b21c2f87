use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::buffer_assignment::{BufferAssignment, BufferAssignmentError, BufferSlice};
use crate::hlo::{Computation, Instruction, InstructionId, Layout, Opcode, Shape};
use crate::primitive::ElementType;

use super::{
    ConcatenateThunk, ConstantThunk, CopyThunk, CustomCallThunk, Relayout, SequentialThunk, Thunk,
    ThunkInfo,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("computation {0} has instructions without layouts")]
    MissingLayouts(String),
    #[error("cannot emit {instruction}: {reason}")]
    Unsupported {
        instruction: InstructionId,
        reason: String,
    },
    #[error(transparent)]
    BufferAssignment(#[from] BufferAssignmentError),
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Runtime routine implementing `Dot` for `element_type`, if there is one.
pub fn matmul_symbol(element_type: ElementType) -> Option<&'static str> {
    match element_type {
        ElementType::F32 => Some("__aot_rt_matmul_f32"),
        ElementType::F64 => Some("__aot_rt_matmul_f64"),
        _ => None,
    }
}

/// Problem sizes and element strides handed to the runtime matmul routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulDescriptor {
    pub m: u64,
    pub k: u64,
    pub n: u64,
    /// `[row stride, column stride]` in elements for lhs, rhs and output.
    pub lhs_strides: [u64; 2],
    pub rhs_strides: [u64; 2],
    pub out_strides: [u64; 2],
}

impl MatMulDescriptor {
    pub const ENCODED_LEN: usize = 9 * 8;

    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            self.m,
            self.k,
            self.n,
            self.lhs_strides[0],
            self.lhs_strides[1],
            self.rhs_strides[0],
            self.rhs_strides[1],
            self.out_strides[0],
            self.out_strides[1],
        ];
        fields.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut fields = [0u64; 9];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *field = u64::from_le_bytes(raw);
        }
        Some(Self {
            m: fields[0],
            k: fields[1],
            n: fields[2],
            lhs_strides: [fields[3], fields[4]],
            rhs_strides: [fields[5], fields[6]],
            out_strides: [fields[7], fields[8]],
        })
    }

    /// Returns `true` when all three matrices are dense row-major.
    pub fn is_row_major(&self) -> bool {
        self.lhs_strides == [self.k, 1]
            && self.rhs_strides == [self.n, 1]
            && self.out_strides == [self.n, 1]
    }
}

/// Element strides of each logical dimension under `layout`.
pub fn element_strides(dims: &[usize], layout: &Layout) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for &dim in layout.minor_to_major() {
        strides[dim] = stride;
        stride *= dims[dim];
    }
    strides
}

/// Lowers a laid-out computation into a sequence of thunks.
pub fn emit_thunks(
    computation: &Computation,
    assignment: &BufferAssignment,
) -> EmitResult<SequentialThunk> {
    if !computation.has_layouts() {
        return Err(EmitError::MissingLayouts(computation.name().to_string()));
    }
    let mut thunks: Vec<Box<dyn Thunk>> = Vec::new();
    for inst in computation.instructions() {
        let info = ThunkInfo::for_instruction(inst.id, inst.name.clone());
        match &inst.opcode {
            Opcode::Parameter { .. } | Opcode::Tuple | Opcode::GetTupleElement { .. } => {}
            Opcode::Constant(literal) => {
                let destination = assignment.unique_slice(inst.id)?;
                let layout = array_layout(inst, &inst.shape)?;
                let bytes = if layout.is_descending() {
                    Arc::clone(&literal.bytes)
                } else {
                    let relayout = Relayout {
                        dims: inst.shape.dims().to_vec(),
                        element_bytes: inst.shape.element_type().byte_width(),
                        source: Layout::descending(inst.shape.rank()),
                        destination: layout.clone(),
                    };
                    let mut out = vec![0u8; relayout.byte_size()];
                    if literal.bytes.len() < out.len() {
                        return Err(unsupported(inst.id, "literal is smaller than its shape"));
                    }
                    relayout.apply(&literal.bytes, &mut out);
                    Arc::from(out)
                };
                thunks.push(Box::new(ConstantThunk::new(info, bytes, destination)));
            }
            Opcode::Copy => {
                let operand = operand_of(computation, inst, 0)?;
                let source = assignment.unique_slice(operand.id)?;
                let destination = assignment.unique_slice(inst.id)?;
                let from = array_layout(operand, &operand.shape)?;
                let to = array_layout(inst, &inst.shape)?;
                let relayout = (from != to).then(|| Relayout {
                    dims: inst.shape.dims().to_vec(),
                    element_bytes: inst.shape.element_type().byte_width(),
                    source: from.clone(),
                    destination: to.clone(),
                });
                thunks.push(Box::new(CopyThunk::new(info, source, destination, relayout)));
            }
            Opcode::Concatenate { dimension } => {
                require_row_major(inst, &inst.shape)?;
                let mut slices = Vec::with_capacity(inst.operands.len());
                let mut dims = Vec::with_capacity(inst.operands.len());
                for position in 0..inst.operands.len() {
                    let operand = operand_of(computation, inst, position)?;
                    require_row_major(inst, &operand.shape)?;
                    slices.push(assignment.unique_slice(operand.id)?);
                    dims.push(operand.shape.dims().to_vec());
                }
                let destination = assignment.unique_slice(inst.id)?;
                thunks.push(Box::new(ConcatenateThunk::new(
                    info,
                    slices,
                    &dims,
                    *dimension,
                    inst.shape.element_type().byte_width(),
                    destination,
                )));
            }
            Opcode::Dot => {
                let element_type = inst.shape.element_type();
                let symbol = matmul_symbol(element_type).ok_or_else(|| {
                    unsupported(inst.id, format!("no runtime matmul for {element_type}"))
                })?;
                let lhs = operand_of(computation, inst, 0)?;
                let rhs = operand_of(computation, inst, 1)?;
                if lhs.shape.rank() != 2 || rhs.shape.rank() != 2 || inst.shape.rank() != 2 {
                    return Err(unsupported(
                        inst.id,
                        format!("dot expects rank-2 arrays, got {} and {}", lhs.shape, rhs.shape),
                    ));
                }
                let lhs_strides = element_strides(lhs.shape.dims(), array_layout(lhs, &lhs.shape)?);
                let rhs_strides = element_strides(rhs.shape.dims(), array_layout(rhs, &rhs.shape)?);
                let out_strides =
                    element_strides(inst.shape.dims(), array_layout(inst, &inst.shape)?);
                let descriptor = MatMulDescriptor {
                    m: lhs.shape.dims()[0] as u64,
                    k: lhs.shape.dims()[1] as u64,
                    n: rhs.shape.dims()[1] as u64,
                    lhs_strides: [lhs_strides[0] as u64, lhs_strides[1] as u64],
                    rhs_strides: [rhs_strides[0] as u64, rhs_strides[1] as u64],
                    out_strides: [out_strides[0] as u64, out_strides[1] as u64],
                };
                thunks.push(Box::new(CustomCallThunk::new(
                    info,
                    symbol,
                    Arc::from(descriptor.encode()),
                    vec![
                        assignment.unique_slice(lhs.id)?,
                        assignment.unique_slice(rhs.id)?,
                    ],
                    vec![assignment.unique_slice(inst.id)?],
                )));
            }
            Opcode::CustomCall(spec) => {
                let mut operands = Vec::with_capacity(inst.operands.len());
                for position in 0..inst.operands.len() {
                    let operand = operand_of(computation, inst, position)?;
                    operands.push(assignment.unique_slice(operand.id)?);
                }
                let results = result_slices(assignment, inst)?;
                thunks.push(Box::new(CustomCallThunk::new(
                    info,
                    spec.target.clone(),
                    Arc::from(spec.opaque.clone()),
                    operands,
                    results,
                )));
            }
        }
    }
    debug!(
        computation = computation.name(),
        thunks = thunks.len(),
        "emitted thunk sequence"
    );
    Ok(SequentialThunk::new(
        ThunkInfo::new(None, computation.name()),
        thunks,
    ))
}

fn operand_of<'a>(
    computation: &'a Computation,
    inst: &Instruction,
    position: usize,
) -> EmitResult<&'a Instruction> {
    inst.operands
        .get(position)
        .and_then(|id| computation.instruction(*id))
        .ok_or_else(|| unsupported(inst.id, format!("operand {position} is missing")))
}

fn array_layout<'a>(inst: &Instruction, shape: &'a Shape) -> EmitResult<&'a Layout> {
    if !shape.is_array() {
        return Err(unsupported(inst.id, format!("{shape} is not an array")));
    }
    shape
        .layout()
        .ok_or_else(|| unsupported(inst.id, format!("{shape} has no layout")))
}

fn require_row_major(inst: &Instruction, shape: &Shape) -> EmitResult<()> {
    let layout = array_layout(inst, shape)?;
    if !layout.is_descending() {
        return Err(unsupported(
            inst.id,
            format!("{} needs row-major buffers, got {shape}", inst.opcode.name()),
        ));
    }
    Ok(())
}

fn result_slices(assignment: &BufferAssignment, inst: &Instruction) -> EmitResult<Vec<BufferSlice>> {
    let mut out = Vec::new();
    for (index, leaf) in inst.shape.leaves() {
        if !leaf.is_array() {
            continue;
        }
        let slice = assignment
            .slice(inst.id, &index)
            .ok_or(BufferAssignmentError::NoSlice {
                instruction: inst.id,
                index,
            })?;
        out.push(slice);
    }
    Ok(out)
}

fn unsupported(instruction: InstructionId, reason: impl Into<String>) -> EmitError {
    EmitError::Unsupported {
        instruction,
        reason: reason.into(),
    }
}
