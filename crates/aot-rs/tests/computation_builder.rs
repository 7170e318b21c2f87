use aot_rs::hlo::{
    BuildError, Computation, ComputationBuilder, InstructionId, Layout, Literal, Opcode, Shape,
    ShapeError,
};
use aot_rs::layout::with_default_layouts;
use aot_rs::ElementType;

fn f32s(dims: &[usize]) -> Shape {
    Shape::array(ElementType::F32, dims.to_vec())
}

#[test]
fn concatenate_infers_summed_dimension() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("cat");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[2, 5]))?;
    let cat = b.concatenate(&[x, y], 1)?;
    assert_eq!(b.shape_of(cat)?.dims(), &[2, 8]);
    Ok(())
}

#[test]
fn concatenate_rejects_mismatched_operands() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("cat");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[4, 3]))?;
    let z = b.parameter(2, Shape::array(ElementType::S32, vec![2, 3]))?;
    assert!(matches!(b.concatenate(&[x, y], 1), Err(BuildError::Invalid { .. })));
    assert!(matches!(b.concatenate(&[x, z], 0), Err(BuildError::Invalid { .. })));
    assert!(matches!(b.concatenate(&[x, y], 2), Err(BuildError::Invalid { .. })));
    assert!(matches!(b.concatenate(&[], 0), Err(BuildError::Invalid { .. })));
    Ok(())
}

#[test]
fn dot_requires_matching_contraction() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("dot");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[3, 4]))?;
    let dot = b.dot(x, y)?;
    assert_eq!(b.shape_of(dot)?.dims(), &[2, 4]);
    assert!(b.dot(y, x).is_err());
    Ok(())
}

#[test]
fn parameters_must_be_contiguous_and_unique() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("params");
    let x = b.parameter(0, f32s(&[1]))?;
    assert_eq!(
        b.parameter(0, f32s(&[1])).unwrap_err(),
        BuildError::DuplicateParameter(0)
    );
    b.parameter(2, f32s(&[1]))?;
    assert_eq!(b.build(x).unwrap_err(), BuildError::MissingParameter(1));
    Ok(())
}

#[test]
fn invalid_layouts_are_rejected() {
    let mut b = ComputationBuilder::new("layouts");
    let bad = Shape::array_with_layout(ElementType::F32, vec![2, 3], Layout::new(vec![0, 0]));
    assert!(matches!(
        b.parameter(0, bad),
        Err(BuildError::Shape(ShapeError::LayoutDuplicate { dim: 0, .. }))
    ));
    let short = Shape::array_with_layout(ElementType::F32, vec![2, 3], Layout::new(vec![0]));
    assert!(matches!(
        b.parameter(0, short),
        Err(BuildError::Shape(ShapeError::LayoutRankMismatch { .. }))
    ));
}

#[test]
fn layout_offsets_follow_minor_to_major_order() {
    let dims = [2, 3];
    let row_major = Layout::descending(2);
    let col_major = Layout::ascending(2);
    assert_eq!(row_major.linear_offset(&dims, &[1, 2]), 5);
    assert_eq!(col_major.linear_offset(&dims, &[1, 2]), 5);
    assert_eq!(row_major.linear_offset(&dims, &[1, 0]), 3);
    assert_eq!(col_major.linear_offset(&dims, &[1, 0]), 1);
    assert_eq!(row_major.major_to_minor(), vec![0, 1]);
    assert!(row_major.is_descending());
    assert!(!col_major.is_descending());
    assert_eq!(row_major.to_string(), "{1,0}");
}

#[test]
fn display_marks_the_root() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("show");
    let x = b.parameter(0, f32s(&[2]))?;
    let k = b.constant(Literal::from_f32(vec![2], &[1.0, 2.0]))?;
    let cat = b.concatenate(&[x, k], 0)?;
    let text = b.build(cat)?.to_string();
    assert!(text.starts_with("computation show {"));
    assert!(text.contains("ROOT"));
    assert_eq!(text.matches("ROOT").count(), 1);
    Ok(())
}

#[test]
fn serialized_forms_decode_to_the_same_computation() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("serde");
    let x = b.parameter(0, f32s(&[2, 2]))?;
    let k = b.constant(Literal::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]))?;
    let dot = b.dot(x, k)?;
    let pair = b.tuple(&[dot, x])?;
    let computation = b.build(pair)?;

    let json = computation.to_json_string()?;
    assert_eq!(Computation::from_json_str(&json)?, computation);
    let bytes = computation.to_bincode_bytes()?;
    let decoded = Computation::from_bincode_bytes(&bytes)?;
    assert_eq!(decoded, computation);
    assert!(matches!(
        decoded.instruction(k).map(|i| &i.opcode),
        Some(Opcode::Constant(_))
    ));
    Ok(())
}

#[test]
fn validate_accepts_built_computations() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("valid");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[3, 2]))?;
    let k = b.constant(Literal::from_f32(vec![2, 2], &[0.0; 4]))?;
    let dot = b.dot(x, y)?;
    let cat = b.concatenate(&[dot, k], 1)?;
    let pair = b.tuple(&[cat, x])?;
    let first = b.get_tuple_element(pair, 0)?;
    let computation = b.build(first)?;
    computation.validate()?;
    Ok(())
}

#[test]
fn validate_reports_malformed_instructions() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("broken");
    let x = b.parameter(0, f32s(&[2]))?;
    let y = b.copy(x)?;
    let computation = b.build(y)?;

    let mut missing_root = computation.clone();
    missing_root.set_root(InstructionId(40));
    assert_eq!(
        missing_root.validate(),
        Err(BuildError::UnknownOperand(InstructionId(40)))
    );

    let mut forward = computation.clone();
    forward.push("late", Opcode::Copy, vec![InstructionId(50)], f32s(&[2]));
    assert_eq!(
        forward.validate(),
        Err(BuildError::UnknownOperand(InstructionId(50)))
    );

    let mut reshaped = computation.clone();
    reshaped.push("grown", Opcode::Copy, vec![x], f32s(&[3]));
    assert!(matches!(
        reshaped.validate(),
        Err(BuildError::Invalid { op: "copy", .. })
    ));

    let mut twice = computation.clone();
    twice.push("p0", Opcode::Parameter { number: 0 }, Vec::new(), f32s(&[2]));
    assert_eq!(twice.validate(), Err(BuildError::DuplicateParameter(0)));

    let mut flat_dot = computation;
    flat_dot.push("flat", Opcode::Dot, vec![x, x], f32s(&[1]));
    assert!(matches!(
        flat_dot.validate(),
        Err(BuildError::Invalid { op: "dot", .. })
    ));
    Ok(())
}

#[test]
fn default_layouts_fill_only_missing_array_leaves() {
    let column = Shape::array_with_layout(ElementType::F32, vec![2, 3], Layout::ascending(2));
    let shape = Shape::tuple(vec![f32s(&[4, 5, 6]), column.clone()]);
    let filled = with_default_layouts(&shape);
    assert_eq!(
        filled.tuple_shapes()[0].layout(),
        Some(&Layout::descending(3))
    );
    assert_eq!(filled.tuple_shapes()[1], column);
    assert!(filled.has_layouts());
    assert!(filled.compatible(&shape));
}
