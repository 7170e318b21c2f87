use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::builder::{
    infer_concatenate_shape, infer_dot_shape, validate_layouts, BuildError, BuildResult,
};
use super::literal::Literal;
use super::shape::{Layout, Shape};

/// Stable identifier of an instruction within its computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionId(pub u32);

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Call into an externally supplied native routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCallSpec {
    /// Symbol resolved through the custom call target registry at execution time.
    pub target: String,
    /// Backend-opaque payload forwarded verbatim to the routine.
    pub opaque: Vec<u8>,
    /// Physical layouts the routine expects for each operand, if it cares.
    pub operand_layouts: Option<Vec<Layout>>,
    /// Side-effecting calls survive dead code elimination.
    pub has_side_effect: bool,
}

impl CustomCallSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            opaque: Vec::new(),
            operand_layouts: None,
            has_side_effect: false,
        }
    }

    pub fn with_opaque(mut self, opaque: impl Into<Vec<u8>>) -> Self {
        self.opaque = opaque.into();
        self
    }

    pub fn with_operand_layouts(mut self, layouts: Vec<Layout>) -> Self {
        self.operand_layouts = Some(layouts);
        self
    }

    pub fn with_side_effect(mut self) -> Self {
        self.has_side_effect = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Parameter { number: usize },
    Constant(Literal),
    /// Variadic concatenation along `dimension`; order-sensitive.
    Concatenate { dimension: usize },
    /// Identity on values; may change the physical layout.
    Copy,
    Tuple,
    GetTupleElement { index: usize },
    /// Rank-2 matrix product `[m, k] x [k, n] -> [m, n]`.
    Dot,
    CustomCall(CustomCallSpec),
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Parameter { .. } => "parameter",
            Opcode::Constant(_) => "constant",
            Opcode::Concatenate { .. } => "concatenate",
            Opcode::Copy => "copy",
            Opcode::Tuple => "tuple",
            Opcode::GetTupleElement { .. } => "get-tuple-element",
            Opcode::Dot => "dot",
            Opcode::CustomCall(_) => "custom-call",
        }
    }

    pub fn has_side_effect(&self) -> bool {
        matches!(self, Opcode::CustomCall(spec) if spec.has_side_effect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstructionId,
    pub name: String,
    pub opcode: Opcode,
    pub operands: Vec<InstructionId>,
    pub shape: Shape,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operands = self
            .operands
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{} = {} {}", self.id, self.shape, self.opcode.name())?;
        match &self.opcode {
            Opcode::Parameter { number } => write!(f, "({number})")?,
            Opcode::Constant(literal) => write!(f, "({} bytes)", literal.byte_len())?,
            _ => write!(f, "({operands})")?,
        }
        match &self.opcode {
            Opcode::Concatenate { dimension } => write!(f, ", dimension={dimension}")?,
            Opcode::GetTupleElement { index } => write!(f, ", index={index}")?,
            Opcode::CustomCall(spec) => write!(f, ", target=\"{}\"", spec.target)?,
            _ => {}
        }
        write!(f, " // {}", self.name)
    }
}

/// Dataflow program stored in topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    name: String,
    instructions: Vec<Instruction>,
    root: InstructionId,
    next_id: u32,
}

impl Computation {
    pub(crate) fn from_parts(
        name: String,
        instructions: Vec<Instruction>,
        root: InstructionId,
    ) -> Self {
        let next_id = instructions
            .iter()
            .map(|inst| inst.id.0 + 1)
            .max()
            .unwrap_or(0);
        Self {
            name,
            instructions,
            root,
            next_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn root(&self) -> InstructionId {
        self.root
    }

    pub fn set_root(&mut self, root: InstructionId) {
        self.root = root;
    }

    /// # Panics
    ///
    /// Panics when the root id is not part of the computation; see [`Computation::validate`].
    pub fn root_instruction(&self) -> &Instruction {
        self.instruction(self.root)
            .unwrap_or_else(|| panic!("root {} missing from computation {}", self.root, self.name))
    }

    pub fn result_shape(&self) -> &Shape {
        &self.root_instruction().shape
    }

    pub fn position(&self, id: InstructionId) -> Option<usize> {
        self.instructions.iter().position(|inst| inst.id == id)
    }

    pub fn instruction(&self, id: InstructionId) -> Option<&Instruction> {
        self.instructions.iter().find(|inst| inst.id == id)
    }

    pub fn instruction_mut(&mut self, id: InstructionId) -> Option<&mut Instruction> {
        self.instructions.iter_mut().find(|inst| inst.id == id)
    }

    /// Parameters ordered by parameter number.
    pub fn parameters(&self) -> Vec<&Instruction> {
        let mut params: Vec<(usize, &Instruction)> = self
            .instructions
            .iter()
            .filter_map(|inst| match inst.opcode {
                Opcode::Parameter { number } => Some((number, inst)),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(number, _)| *number);
        params.into_iter().map(|(_, inst)| inst).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().len()
    }

    /// Map from instruction id to the ids of instructions consuming it.
    pub fn users(&self) -> HashMap<InstructionId, Vec<InstructionId>> {
        let mut users: HashMap<InstructionId, Vec<InstructionId>> = HashMap::new();
        for inst in &self.instructions {
            for operand in &inst.operands {
                let entry = users.entry(*operand).or_default();
                if !entry.contains(&inst.id) {
                    entry.push(inst.id);
                }
            }
        }
        users
    }

    /// Inserts a new instruction immediately before `anchor` and returns its id.
    ///
    /// # Panics
    ///
    /// Panics when `anchor` is not part of this computation.
    pub fn insert_before(
        &mut self,
        anchor: InstructionId,
        name: impl Into<String>,
        opcode: Opcode,
        operands: Vec<InstructionId>,
        shape: Shape,
    ) -> InstructionId {
        let position = self
            .position(anchor)
            .unwrap_or_else(|| panic!("anchor {anchor} missing from computation {}", self.name));
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        self.instructions.insert(
            position,
            Instruction {
                id,
                name: name.into(),
                opcode,
                operands,
                shape,
            },
        );
        id
    }

    /// Appends a new instruction at the end of the body.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        opcode: Opcode,
        operands: Vec<InstructionId>,
        shape: Shape,
    ) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        self.instructions.push(Instruction {
            id,
            name: name.into(),
            opcode,
            operands,
            shape,
        });
        id
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Instruction) -> bool) -> usize {
        let before = self.instructions.len();
        self.instructions.retain(|inst| keep(inst));
        before - self.instructions.len()
    }

    pub fn clear_layouts(&mut self) {
        for inst in &mut self.instructions {
            inst.shape.clear_layouts();
        }
    }

    /// Returns `true` when every array leaf of every instruction carries a layout.
    pub fn has_layouts(&self) -> bool {
        self.instructions.iter().all(|inst| inst.shape.has_layouts())
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_bincode_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bincode_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Checks the invariants the builder establishes, for computations that
    /// arrive from outside it (deserialized artifacts, hand-assembled IR).
    ///
    /// Ids are unique, operands are defined before use, the root exists,
    /// parameters are numbered contiguously from zero, layouts fit their
    /// shapes and every result shape agrees with its opcode.
    pub fn validate(&self) -> BuildResult<()> {
        let mut defined: HashMap<InstructionId, &Shape> = HashMap::new();
        let mut parameters = BTreeSet::new();
        for inst in &self.instructions {
            let op = inst.opcode.name();
            let mut operand_shapes = Vec::with_capacity(inst.operands.len());
            for operand in &inst.operands {
                let shape = defined
                    .get(operand)
                    .copied()
                    .ok_or(BuildError::UnknownOperand(*operand))?;
                operand_shapes.push(shape);
            }
            validate_layouts(&inst.shape)?;
            check_opcode(inst, &operand_shapes)?;
            if let Opcode::Parameter { number } = inst.opcode {
                if !parameters.insert(number) {
                    return Err(BuildError::DuplicateParameter(number));
                }
            }
            if defined.insert(inst.id, &inst.shape).is_some() {
                return Err(BuildError::invalid(op, format!("{} is defined twice", inst.id)));
            }
        }
        if !defined.contains_key(&self.root) {
            return Err(BuildError::UnknownOperand(self.root));
        }
        for (expected, number) in parameters.iter().enumerate() {
            if *number != expected {
                return Err(BuildError::MissingParameter(expected));
            }
        }
        Ok(())
    }
}

fn check_opcode(inst: &Instruction, operands: &[&Shape]) -> BuildResult<()> {
    let op = inst.opcode.name();
    let expect_arity = |count: usize| {
        if operands.len() == count {
            Ok(())
        } else {
            Err(BuildError::invalid(
                op,
                format!("{} takes {count} operands, found {}", inst.id, operands.len()),
            ))
        }
    };
    let expected = match &inst.opcode {
        Opcode::Parameter { .. } => {
            expect_arity(0)?;
            return Ok(());
        }
        Opcode::Constant(literal) => {
            expect_arity(0)?;
            if !literal.is_consistent() {
                return Err(BuildError::invalid(
                    op,
                    format!(
                        "{}: {} bytes do not match {}",
                        inst.id,
                        literal.byte_len(),
                        literal.shape
                    ),
                ));
            }
            literal.shape.clone()
        }
        Opcode::Concatenate { dimension } => {
            let shapes: Vec<Shape> = operands.iter().map(|shape| (*shape).clone()).collect();
            infer_concatenate_shape(&shapes, *dimension)?
        }
        Opcode::Copy => {
            expect_arity(1)?;
            if !operands[0].is_array() {
                return Err(BuildError::invalid(
                    op,
                    format!("{}: operand shape {} is not an array", inst.id, operands[0]),
                ));
            }
            operands[0].clone()
        }
        Opcode::Tuple => Shape::tuple(
            operands
                .iter()
                .map(|shape| (*shape).clone())
                .collect::<Vec<_>>(),
        ),
        Opcode::GetTupleElement { index } => {
            expect_arity(1)?;
            operands[0]
                .tuple_shapes()
                .get(*index)
                .filter(|_| operands[0].is_tuple())
                .cloned()
                .ok_or_else(|| {
                    BuildError::invalid(
                        op,
                        format!("{}: index {index} out of range for {}", inst.id, operands[0]),
                    )
                })?
        }
        Opcode::Dot => {
            expect_arity(2)?;
            infer_dot_shape(operands[0], operands[1])?
        }
        Opcode::CustomCall(spec) => {
            if let Some(layouts) = &spec.operand_layouts {
                if layouts.len() != operands.len() {
                    return Err(BuildError::invalid(
                        op,
                        format!(
                            "{}: {} operand layouts declared for {} operands",
                            inst.id,
                            layouts.len(),
                            operands.len()
                        ),
                    ));
                }
                for (layout, shape) in layouts.iter().zip(operands) {
                    layout.validate_for_rank(shape.rank())?;
                }
            }
            return Ok(());
        }
    };
    if !expected.compatible(&inst.shape) {
        return Err(BuildError::invalid(
            op,
            format!("{} has shape {} but its operands produce {expected}", inst.id, inst.shape),
        ));
    }
    Ok(())
}

impl fmt::Display for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "computation {} {{", self.name)?;
        for inst in &self.instructions {
            let marker = if inst.id == self.root { "ROOT " } else { "" };
            writeln!(f, "  {marker}{inst}")?;
        }
        write!(f, "}}")
    }
}
