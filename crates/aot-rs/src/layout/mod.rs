//! Physical layout assignment.
//!
//! Constraints are gathered in three stages: entry constraints seeded from a
//! [`ComputationLayout`], backend constraints from an injected
//! [`BackendConstraintPolicy`], then resolution. Resolution picks one layout per
//! array leaf of every instruction, inserts layout-changing copies where a
//! consumer or the computation result needs something else, and writes the
//! final layouts into every shape.

mod constraints;
mod policy;

use std::collections::HashMap;

use tracing::debug;

use crate::hlo::{Computation, Instruction, InstructionId, Layout, Opcode, Shape, ShapeIndex};

pub use constraints::{
    ConstraintOrigin, LayoutConstraint, LayoutConstraints, LayoutError, LayoutLocation,
    LayoutResult,
};
pub use policy::{
    BackendConstraintPolicy, LayoutRequirement, LibraryCallLayoutPolicy, LibraryRoutine,
    NoBackendConstraints, TargetMachineFeatures,
};

/// Required layouts at the computation boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationLayout {
    pub parameter_layouts: Vec<Shape>,
    pub result_layout: Shape,
}

impl ComputationLayout {
    pub fn new(parameter_layouts: Vec<Shape>, result_layout: Shape) -> Self {
        Self {
            parameter_layouts,
            result_layout,
        }
    }

    /// Boundary layout taken from the computation's own shapes, defaulting to row-major.
    pub fn from_computation(computation: &Computation) -> Self {
        let parameter_layouts = computation
            .parameters()
            .into_iter()
            .map(|param| with_default_layouts(&param.shape))
            .collect();
        Self {
            parameter_layouts,
            result_layout: with_default_layouts(computation.result_shape()),
        }
    }

    /// Adds entry constraints for every parameter leaf and the computation result.
    ///
    /// Leaves without a layout in this signature are left unconstrained.
    pub fn seed(
        &self,
        computation: &Computation,
        constraints: &mut LayoutConstraints,
    ) -> LayoutResult<usize> {
        let params = computation.parameters();
        if params.len() != self.parameter_layouts.len() {
            return Err(LayoutError::SignatureMismatch(format!(
                "{} parameter layouts for {} parameters",
                self.parameter_layouts.len(),
                params.len()
            )));
        }
        let mut added = 0usize;
        for (param, expected) in params.iter().zip(&self.parameter_layouts) {
            if !param.shape.compatible(expected) {
                return Err(LayoutError::SignatureMismatch(format!(
                    "parameter {} has shape {} but layout signature says {}",
                    param.id, param.shape, expected
                )));
            }
            for (index, leaf) in expected.leaves() {
                let Some(layout) = leaf.layout() else {
                    continue;
                };
                let location = LayoutLocation::Result {
                    instruction: param.id,
                    index,
                };
                validate_for(&location, layout, leaf)?;
                if constraints.add(location, layout.clone(), ConstraintOrigin::Entry)? {
                    added += 1;
                }
            }
        }
        let result_shape = computation.result_shape();
        if !result_shape.compatible(&self.result_layout) {
            return Err(LayoutError::SignatureMismatch(format!(
                "result has shape {} but layout signature says {}",
                result_shape, self.result_layout
            )));
        }
        for (index, leaf) in self.result_layout.leaves() {
            let Some(layout) = leaf.layout() else {
                continue;
            };
            let location = LayoutLocation::ComputationResult { index };
            validate_for(&location, layout, leaf)?;
            if constraints.add(location, layout.clone(), ConstraintOrigin::Entry)? {
                added += 1;
            }
        }
        Ok(added)
    }
}

/// Copies `shape`, filling in row-major layouts on array leaves that lack one.
pub fn with_default_layouts(shape: &Shape) -> Shape {
    let mut out = shape.clone();
    out.fill_default_layouts();
    out
}

fn validate_for(location: &LayoutLocation, layout: &Layout, shape: &Shape) -> LayoutResult<()> {
    if !shape.is_array() {
        return Err(LayoutError::NotAnArray {
            location: location.clone(),
        });
    }
    layout
        .validate_for_rank(shape.rank())
        .map_err(|source| LayoutError::InvalidLayout {
            location: location.clone(),
            source,
        })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayoutAssignmentStats {
    pub backend_constraints_added: usize,
    pub copies_inserted: usize,
}

/// Backend-independent layout solver parameterized by a constraint policy.
#[derive(Debug, Clone)]
pub struct LayoutAssignment<P> {
    policy: P,
}

type ResolvedLayouts = HashMap<(InstructionId, ShapeIndex), Layout>;

impl<P: BackendConstraintPolicy> LayoutAssignment<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Adds the policy's requirements to `constraints`.
    ///
    /// Returns how many new entries were added. A requirement that disagrees with an
    /// existing constraint is reported as [`LayoutError::Conflict`]; nothing is overridden.
    pub fn add_backend_constraints(
        &self,
        computation: &Computation,
        constraints: &mut LayoutConstraints,
    ) -> LayoutResult<usize> {
        let mut added = 0usize;
        for instruction in computation.instructions() {
            for requirement in self.policy.requirements(computation, instruction) {
                let target = location_shape(computation, &requirement.location)?;
                validate_for(&requirement.location, &requirement.layout, &target)?;
                if constraints.add(
                    requirement.location,
                    requirement.layout,
                    ConstraintOrigin::Backend,
                )? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Adds backend constraints, then resolves and writes layouts into `computation`.
    pub fn run(
        &self,
        computation: &mut Computation,
        constraints: &mut LayoutConstraints,
    ) -> LayoutResult<LayoutAssignmentStats> {
        let backend_constraints_added = self.add_backend_constraints(computation, constraints)?;
        let mut resolved = resolve_result_layouts(computation, constraints)?;
        let mut copies_inserted = insert_operand_copies(computation, constraints, &mut resolved)?;
        copies_inserted += fix_root_layouts(computation, constraints, &mut resolved)?;
        finalize(computation, &resolved)?;

        let stats = LayoutAssignmentStats {
            backend_constraints_added,
            copies_inserted,
        };
        debug!(
            computation = computation.name(),
            constraints = constraints.len(),
            backend_constraints_added,
            copies_inserted,
            "layout assignment finished"
        );
        Ok(stats)
    }
}

fn location_shape(computation: &Computation, location: &LayoutLocation) -> LayoutResult<Shape> {
    match location {
        LayoutLocation::Operand {
            instruction,
            operand,
        } => {
            let inst = computation
                .instruction(*instruction)
                .ok_or(LayoutError::UnknownInstruction(*instruction))?;
            let producer_id = inst.operands.get(*operand).ok_or_else(|| {
                LayoutError::NotAnArray {
                    location: location.clone(),
                }
            })?;
            let producer = computation
                .instruction(*producer_id)
                .ok_or(LayoutError::UnknownInstruction(*producer_id))?;
            Ok(producer.shape.clone())
        }
        LayoutLocation::Result { instruction, index } => {
            let inst = computation
                .instruction(*instruction)
                .ok_or(LayoutError::UnknownInstruction(*instruction))?;
            inst.shape
                .subshape(index)
                .cloned()
                .ok_or_else(|| LayoutError::NotAnArray {
                    location: location.clone(),
                })
        }
        LayoutLocation::ComputationResult { index } => computation
            .result_shape()
            .subshape(index)
            .cloned()
            .ok_or_else(|| LayoutError::NotAnArray {
                location: location.clone(),
            }),
    }
}

fn resolve_result_layouts(
    computation: &Computation,
    constraints: &LayoutConstraints,
) -> LayoutResult<ResolvedLayouts> {
    let mut resolved = ResolvedLayouts::new();
    for inst in computation.instructions() {
        for (index, leaf) in inst.shape.leaves() {
            if !leaf.is_array() {
                continue;
            }
            let aliased = aliased_layout(inst, &index, &resolved);
            let location = LayoutLocation::Result {
                instruction: inst.id,
                index: index.clone(),
            };
            let constrained = constraints.get(&location);
            let layout = match (aliased, constrained) {
                (Some(aliased), Some(constrained)) if aliased != constrained.layout => {
                    return Err(LayoutError::Conflict {
                        location,
                        existing: constrained.layout.clone(),
                        existing_origin: constrained.origin,
                        requested: aliased,
                        requested_origin: ConstraintOrigin::Alias,
                    });
                }
                (Some(aliased), _) => aliased,
                (None, Some(constrained)) => constrained.layout.clone(),
                (None, None) => leaf.layout_or_default(),
            };
            resolved.insert((inst.id, index), layout);
        }
    }
    Ok(resolved)
}

/// Tuples and tuple projections share their operands' buffers, so their layouts follow.
fn aliased_layout(
    inst: &Instruction,
    index: &ShapeIndex,
    resolved: &ResolvedLayouts,
) -> Option<Layout> {
    match inst.opcode {
        Opcode::Tuple => {
            let (element, rest) = index.split_first()?;
            let operand = inst.operands.get(element)?;
            resolved.get(&(*operand, rest)).cloned()
        }
        Opcode::GetTupleElement { index: element } => {
            let operand = inst.operands.first()?;
            resolved.get(&(*operand, index.prepended(element))).cloned()
        }
        _ => None,
    }
}

fn insert_operand_copies(
    computation: &mut Computation,
    constraints: &LayoutConstraints,
    resolved: &mut ResolvedLayouts,
) -> LayoutResult<usize> {
    let mut copies: HashMap<(InstructionId, Layout), InstructionId> = HashMap::new();
    let order: Vec<InstructionId> = computation.instructions().iter().map(|i| i.id).collect();
    let mut inserted = 0usize;

    for consumer in order {
        let operands = match computation.instruction(consumer) {
            Some(inst) => inst.operands.clone(),
            None => continue,
        };
        for (operand_index, producer) in operands.iter().enumerate() {
            let Some(required) = constraints.operand_layout(consumer, operand_index) else {
                continue;
            };
            let location = LayoutLocation::operand(consumer, operand_index);
            let current = resolved
                .get(&(*producer, ShapeIndex::root()))
                .ok_or_else(|| LayoutError::NotAnArray {
                    location: location.clone(),
                })?;
            if current == required {
                continue;
            }
            let key = (*producer, required.clone());
            let copy = match copies.get(&key) {
                Some(copy) => *copy,
                None => {
                    let copy = insert_copy_before(computation, consumer, *producer, required)?;
                    resolved.insert((copy, ShapeIndex::root()), required.clone());
                    copies.insert(key, copy);
                    inserted += 1;
                    copy
                }
            };
            if let Some(inst) = computation.instruction_mut(consumer) {
                inst.operands[operand_index] = copy;
            }
        }
    }
    Ok(inserted)
}

fn insert_copy_before(
    computation: &mut Computation,
    anchor: InstructionId,
    producer: InstructionId,
    layout: &Layout,
) -> LayoutResult<InstructionId> {
    let source = computation
        .instruction(producer)
        .ok_or(LayoutError::UnknownInstruction(producer))?;
    let name = format!("{}.relayout", source.name);
    let mut shape = source.shape.clone();
    shape.clear_layouts();
    debug!(producer = %producer, layout = %layout, "inserting layout copy");
    Ok(computation.insert_before(anchor, name, Opcode::Copy, vec![producer], shape))
}

fn push_copy(
    computation: &mut Computation,
    producer: InstructionId,
    layout: &Layout,
) -> LayoutResult<InstructionId> {
    let source = computation
        .instruction(producer)
        .ok_or(LayoutError::UnknownInstruction(producer))?;
    let name = format!("{}.relayout", source.name);
    let mut shape = source.shape.clone();
    shape.clear_layouts();
    debug!(producer = %producer, layout = %layout, "inserting result layout copy");
    Ok(computation.push(name, Opcode::Copy, vec![producer], shape))
}

fn fix_root_layouts(
    computation: &mut Computation,
    constraints: &LayoutConstraints,
    resolved: &mut ResolvedLayouts,
) -> LayoutResult<usize> {
    let root = computation.root();
    let root_shape = computation.result_shape().clone();
    let mut mismatched: Vec<(ShapeIndex, Layout)> = Vec::new();
    for (index, leaf) in root_shape.leaves() {
        if !leaf.is_array() {
            continue;
        }
        let Some(required) = constraints.computation_result_layout(&index) else {
            continue;
        };
        if resolved.get(&(root, index.clone())) != Some(required) {
            mismatched.push((index, required.clone()));
        }
    }
    if mismatched.is_empty() {
        return Ok(0);
    }

    if !root_shape.is_tuple() {
        let (_, layout) = &mismatched[0];
        let copy = push_copy(computation, root, layout)?;
        resolved.insert((copy, ShapeIndex::root()), layout.clone());
        computation.set_root(copy);
        return Ok(1);
    }

    if mismatched.iter().any(|(index, _)| index.as_slice().len() != 1) {
        return Err(LayoutError::Unsupported(format!(
            "result layout change inside nested tuple of {}",
            computation.name()
        )));
    }

    let root_inst = computation.root_instruction().clone();
    let mut elements = Vec::with_capacity(root_shape.tuple_shapes().len());
    for (element, element_shape) in root_shape.tuple_shapes().iter().enumerate() {
        let value = if matches!(root_inst.opcode, Opcode::Tuple) {
            root_inst.operands[element]
        } else {
            let gte = computation.push(
                format!("{}.{element}", root_inst.name),
                Opcode::GetTupleElement { index: element },
                vec![root],
                element_shape.clone(),
            );
            for (index, leaf) in element_shape.leaves() {
                if leaf.is_array() {
                    if let Some(layout) = resolved.get(&(root, index.prepended(element))).cloned() {
                        resolved.insert((gte, index), layout);
                    }
                }
            }
            gte
        };
        elements.push(value);
    }

    let mut inserted = 0usize;
    for (index, layout) in &mismatched {
        let element = index.as_slice()[0];
        let copy = push_copy(computation, elements[element], layout)?;
        resolved.insert((copy, ShapeIndex::root()), layout.clone());
        elements[element] = copy;
        inserted += 1;
    }

    let mut element_shapes = Vec::with_capacity(elements.len());
    for id in &elements {
        let inst = computation
            .instruction(*id)
            .ok_or(LayoutError::UnknownInstruction(*id))?;
        let mut shape = inst.shape.clone();
        shape.clear_layouts();
        element_shapes.push(shape);
    }
    let tuple_shape = Shape::tuple(element_shapes);
    let new_root = computation.push(
        format!("{}.relayout", root_inst.name),
        Opcode::Tuple,
        elements.clone(),
        tuple_shape.clone(),
    );
    for (index, leaf) in tuple_shape.leaves() {
        if !leaf.is_array() {
            continue;
        }
        if let Some((element, rest)) = index.split_first() {
            if let Some(layout) = resolved.get(&(elements[element], rest)).cloned() {
                resolved.insert((new_root, index), layout);
            }
        }
    }
    computation.set_root(new_root);
    Ok(inserted)
}

fn finalize(computation: &mut Computation, resolved: &ResolvedLayouts) -> LayoutResult<()> {
    let ids: Vec<InstructionId> = computation.instructions().iter().map(|i| i.id).collect();
    for id in ids {
        let Some(inst) = computation.instruction_mut(id) else {
            continue;
        };
        let leaves: Vec<ShapeIndex> = inst
            .shape
            .leaves()
            .into_iter()
            .filter(|(_, leaf)| leaf.is_array())
            .map(|(index, _)| index)
            .collect();
        for index in leaves {
            let location = LayoutLocation::Result {
                instruction: id,
                index: index.clone(),
            };
            let layout = resolved
                .get(&(id, index.clone()))
                .cloned()
                .ok_or_else(|| LayoutError::Unsupported(format!("no layout resolved for {location}")))?;
            let leaf = inst
                .shape
                .subshape_mut(&index)
                .ok_or_else(|| LayoutError::NotAnArray {
                    location: location.clone(),
                })?;
            leaf.set_layout(layout)
                .map_err(|source| LayoutError::InvalidLayout { location, source })?;
        }
    }
    Ok(())
}
