use aot_rs::hlo::{
    Computation, ComputationBuilder, CustomCallSpec, InstructionId, Layout, Opcode, Shape,
    ShapeIndex,
};
use aot_rs::layout::{
    ComputationLayout, ConstraintOrigin, LayoutAssignment, LayoutConstraints, LayoutError,
    LayoutLocation, LibraryCallLayoutPolicy, LibraryRoutine, NoBackendConstraints,
    TargetMachineFeatures,
};
use aot_rs::ElementType;

#[derive(Debug, Clone, Copy)]
struct Features {
    matmul: bool,
}

impl TargetMachineFeatures for Features {
    fn has_library_routine(&self, routine: LibraryRoutine, element_type: ElementType) -> bool {
        matches!(routine, LibraryRoutine::MatMul) && self.matmul && element_type == ElementType::F32
    }
}

fn library_policy(matmul: bool) -> LayoutAssignment<LibraryCallLayoutPolicy<Features>> {
    LayoutAssignment::new(LibraryCallLayoutPolicy::new(Features { matmul }))
}

fn f32s(dims: &[usize]) -> Shape {
    Shape::array(ElementType::F32, dims.to_vec())
}

fn column_major(dims: &[usize]) -> Shape {
    Shape::array_with_layout(ElementType::F32, dims.to_vec(), Layout::ascending(dims.len()))
}

fn row_major(dims: &[usize]) -> Shape {
    Shape::array_with_layout(ElementType::F32, dims.to_vec(), Layout::descending(dims.len()))
}

/// `dot(p0: f32[2,3], p1: f32[3,4])`
fn matmul() -> anyhow::Result<(Computation, InstructionId)> {
    let mut b = ComputationBuilder::new("matmul");
    let lhs = b.parameter(0, f32s(&[2, 3]))?;
    let rhs = b.parameter(1, f32s(&[3, 4]))?;
    let dot = b.dot(lhs, rhs)?;
    Ok((b.build(dot)?, dot))
}

#[test]
fn constraint_set_rejects_a_second_layout_for_one_location() -> anyhow::Result<()> {
    let mut constraints = LayoutConstraints::new();
    let location = LayoutLocation::operand(InstructionId(3), 0);

    assert!(constraints.add(location.clone(), Layout::descending(2), ConstraintOrigin::Entry)?);
    assert!(!constraints.add(location.clone(), Layout::descending(2), ConstraintOrigin::Backend)?);

    let err = constraints
        .add(location.clone(), Layout::ascending(2), ConstraintOrigin::Backend)
        .unwrap_err();
    match err {
        LayoutError::Conflict {
            location: reported,
            existing,
            existing_origin,
            requested,
            requested_origin,
        } => {
            assert_eq!(reported, location);
            assert_eq!(existing, Layout::descending(2));
            assert_eq!(existing_origin, ConstraintOrigin::Entry);
            assert_eq!(requested, Layout::ascending(2));
            assert_eq!(requested_origin, ConstraintOrigin::Backend);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(constraints.len(), 1);
    assert_eq!(
        constraints.get(&location).map(|c| &c.layout),
        Some(&Layout::descending(2))
    );
    Ok(())
}

#[test]
fn backend_requirement_conflicting_with_existing_constraint_is_an_error() -> anyhow::Result<()> {
    let (computation, dot) = matmul()?;
    let mut constraints = LayoutConstraints::new();
    constraints.add(
        LayoutLocation::operand(dot, 0),
        Layout::ascending(2),
        ConstraintOrigin::User,
    )?;

    let err = library_policy(true)
        .add_backend_constraints(&computation, &mut constraints)
        .unwrap_err();
    assert!(
        matches!(
            &err,
            LayoutError::Conflict {
                location,
                existing_origin: ConstraintOrigin::User,
                requested_origin: ConstraintOrigin::Backend,
                ..
            } if *location == LayoutLocation::operand(dot, 0)
        ),
        "unexpected error {err:?}"
    );
    assert_eq!(
        constraints.operand_layout(dot, 0),
        Some(&Layout::ascending(2)),
        "existing constraint must survive"
    );
    Ok(())
}

#[test]
fn library_matmul_adds_row_major_constraints_exactly_once() -> anyhow::Result<()> {
    let (computation, dot) = matmul()?;
    let mut constraints = LayoutConstraints::new();
    let assignment = library_policy(true);

    let added = assignment.add_backend_constraints(&computation, &mut constraints)?;
    assert_eq!(added, 3);
    assert_eq!(constraints.operand_layout(dot, 0), Some(&Layout::descending(2)));
    assert_eq!(constraints.operand_layout(dot, 1), Some(&Layout::descending(2)));
    assert_eq!(
        constraints.result_layout(dot, &ShapeIndex::root()),
        Some(&Layout::descending(2))
    );
    for (_, constraint) in constraints.iter() {
        assert_eq!(constraint.origin, ConstraintOrigin::Backend);
    }

    let again = assignment.add_backend_constraints(&computation, &mut constraints)?;
    assert_eq!(again, 0);
    assert_eq!(constraints.len(), 3);
    Ok(())
}

#[test]
fn no_constraint_without_library_routine() -> anyhow::Result<()> {
    let (computation, _) = matmul()?;
    let mut constraints = LayoutConstraints::new();
    let added = library_policy(false).add_backend_constraints(&computation, &mut constraints)?;
    assert_eq!(added, 0);
    assert!(constraints.is_empty());
    Ok(())
}

#[test]
fn custom_call_operand_layouts_become_constraints() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("kernel");
    let x = b.parameter(0, f32s(&[4, 2]))?;
    let spec = CustomCallSpec::new("kernel_f32").with_operand_layouts(vec![Layout::ascending(2)]);
    let call = b.custom_call(spec, &[x], f32s(&[4, 2]))?;
    let computation = b.build(call)?;

    let mut constraints = LayoutConstraints::new();
    let added = library_policy(true).add_backend_constraints(&computation, &mut constraints)?;
    assert_eq!(added, 1);
    assert_eq!(constraints.operand_layout(call, 0), Some(&Layout::ascending(2)));
    Ok(())
}

#[test]
fn column_major_argument_gets_a_relayout_copy() -> anyhow::Result<()> {
    let (mut computation, dot) = matmul()?;
    let entry = ComputationLayout::new(
        vec![column_major(&[2, 3]), row_major(&[3, 4])],
        row_major(&[2, 4]),
    );
    let mut constraints = LayoutConstraints::new();
    assert_eq!(entry.seed(&computation, &mut constraints)?, 3);

    let stats = library_policy(true).run(&mut computation, &mut constraints)?;
    assert_eq!(stats.backend_constraints_added, 3);
    assert_eq!(stats.copies_inserted, 1);
    assert!(computation.has_layouts());

    let dot_inst = computation.instruction(dot).expect("dot survives");
    let copy = computation
        .instruction(dot_inst.operands[0])
        .expect("copy exists");
    assert!(matches!(copy.opcode, Opcode::Copy));
    assert_eq!(copy.shape.layout(), Some(&Layout::descending(2)));
    let source = computation.instruction(copy.operands[0]).expect("parameter");
    assert!(matches!(source.opcode, Opcode::Parameter { number: 0 }));
    assert_eq!(source.shape.layout(), Some(&Layout::ascending(2)));
    assert!(
        computation.position(copy.id) < computation.position(dot),
        "copy must precede its user"
    );
    Ok(())
}

#[test]
fn rerunning_on_a_laid_out_computation_inserts_nothing() -> anyhow::Result<()> {
    let (mut computation, _) = matmul()?;
    let entry = ComputationLayout::new(
        vec![column_major(&[2, 3]), row_major(&[3, 4])],
        row_major(&[2, 4]),
    );
    let assignment = library_policy(true);

    let mut first = LayoutConstraints::new();
    entry.seed(&computation, &mut first)?;
    assignment.run(&mut computation, &mut first)?;
    let after_first = computation.len();

    let mut second = LayoutConstraints::new();
    entry.seed(&computation, &mut second)?;
    let stats = assignment.run(&mut computation, &mut second)?;
    assert_eq!(stats.copies_inserted, 0);
    assert_eq!(computation.len(), after_first);
    Ok(())
}

#[test]
fn result_layout_mismatch_appends_a_root_copy() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("concat");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[2, 3]))?;
    let concat = b.concatenate(&[x, y], 0)?;
    let mut computation = b.build(concat)?;

    let entry = ComputationLayout::new(
        vec![row_major(&[2, 3]), row_major(&[2, 3])],
        column_major(&[4, 3]),
    );
    let mut constraints = LayoutConstraints::new();
    entry.seed(&computation, &mut constraints)?;
    let stats = library_policy(true).run(&mut computation, &mut constraints)?;

    assert_eq!(stats.copies_inserted, 1);
    let root = computation.root_instruction();
    assert!(matches!(root.opcode, Opcode::Copy));
    assert_eq!(root.operands, vec![concat]);
    assert_eq!(computation.result_shape().layout(), Some(&Layout::ascending(2)));
    assert_eq!(
        computation.instruction(concat).and_then(|i| i.shape.layout()),
        Some(&Layout::descending(2))
    );
    Ok(())
}

#[test]
fn tuple_elements_follow_their_operands() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("pair");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[3]))?;
    let pair = b.tuple(&[x, y])?;
    let first = b.get_tuple_element(pair, 0)?;
    let mut computation = b.build(first)?;

    let entry = ComputationLayout::new(
        vec![column_major(&[2, 3]), row_major(&[3])],
        column_major(&[2, 3]),
    );
    let mut constraints = LayoutConstraints::new();
    entry.seed(&computation, &mut constraints)?;
    let stats = LayoutAssignment::new(NoBackendConstraints).run(&mut computation, &mut constraints)?;

    assert_eq!(stats.copies_inserted, 0);
    let tuple_shape = &computation.instruction(pair).expect("tuple").shape;
    assert_eq!(
        tuple_shape
            .subshape(&ShapeIndex::from_slice(&[0]))
            .and_then(|s| s.layout()),
        Some(&Layout::ascending(2))
    );
    assert_eq!(computation.result_shape().layout(), Some(&Layout::ascending(2)));
    Ok(())
}

#[test]
fn seeding_rejects_mismatched_signature() -> anyhow::Result<()> {
    let (computation, _) = matmul()?;
    let entry = ComputationLayout::new(vec![row_major(&[2, 3])], row_major(&[2, 4]));
    let mut constraints = LayoutConstraints::new();
    let err = entry.seed(&computation, &mut constraints).unwrap_err();
    assert!(matches!(err, LayoutError::SignatureMismatch(_)));
    Ok(())
}
