use aot_rs::hlo::{Computation, ComputationBuilder, CustomCallSpec, InstructionId, Opcode, Shape};
use aot_rs::passes::{ComputationPass, OperandCountSplitter, PassError};
use aot_rs::ElementType;

fn vector(len: usize) -> Shape {
    Shape::array(ElementType::F32, vec![len])
}

/// Concatenates `count` parameters of lengths 1, 2, 3, ... along dimension 0.
fn wide_concat(count: usize) -> anyhow::Result<(Computation, Vec<InstructionId>, InstructionId)> {
    let mut b = ComputationBuilder::new("wide");
    let params = (0..count)
        .map(|i| b.parameter(i, vector(i + 1)))
        .collect::<Result<Vec<_>, _>>()?;
    let concat = b.concatenate(&params, 0)?;
    Ok((b.build(concat)?, params, concat))
}

/// Leaves of the concatenate tree rooted at `id`, left to right.
fn flatten(computation: &Computation, id: InstructionId, out: &mut Vec<InstructionId>) {
    let inst = computation.instruction(id).expect("defined");
    match inst.opcode {
        Opcode::Concatenate { .. } => {
            for operand in &inst.operands {
                flatten(computation, *operand, out);
            }
        }
        _ => out.push(id),
    }
}

#[test]
fn rejects_limits_below_two() {
    assert!(matches!(
        OperandCountSplitter::new(1),
        Err(PassError::InvalidConfiguration(_))
    ));
    assert!(OperandCountSplitter::new(2).is_ok());
}

#[test]
fn within_limit_is_a_no_op() -> anyhow::Result<()> {
    let (mut computation, _, _) = wide_concat(4)?;
    let before = computation.clone();
    let stats = OperandCountSplitter::new(4)?.run(&mut computation)?;
    assert!(!stats.changed);
    assert_eq!(stats.inserted_insts, 0);
    assert_eq!(computation, before);
    Ok(())
}

#[test]
fn every_instruction_respects_the_limit() -> anyhow::Result<()> {
    for (count, limit) in [(5, 2), (9, 3), (40, 8), (17, 4), (100, 7)] {
        let (mut computation, _, _) = wide_concat(count)?;
        let stats = OperandCountSplitter::new(limit)?.run(&mut computation)?;
        assert!(stats.changed, "{count} operands, limit {limit}");
        for inst in computation.instructions() {
            assert!(
                inst.operands.len() <= limit,
                "{} has {} operands with limit {limit}",
                inst.name,
                inst.operands.len()
            );
        }
    }
    Ok(())
}

#[test]
fn operand_order_and_result_shape_are_preserved() -> anyhow::Result<()> {
    let (mut computation, params, concat) = wide_concat(11)?;
    let shape_before = computation.result_shape().clone();
    OperandCountSplitter::new(3)?.run(&mut computation)?;

    assert_eq!(computation.root(), concat);
    assert_eq!(computation.result_shape(), &shape_before);
    let mut leaves = Vec::new();
    flatten(&computation, concat, &mut leaves);
    assert_eq!(leaves, params);
    Ok(())
}

#[test]
fn new_instructions_precede_their_users() -> anyhow::Result<()> {
    let (mut computation, _, _) = wide_concat(20)?;
    OperandCountSplitter::new(3)?.run(&mut computation)?;
    for inst in computation.instructions() {
        let at = computation.position(inst.id).expect("placed");
        for operand in &inst.operands {
            assert!(computation.position(*operand).expect("placed") < at);
        }
    }
    Ok(())
}

#[test]
fn split_concats_have_consistent_shapes() -> anyhow::Result<()> {
    let (mut computation, _, _) = wide_concat(10)?;
    OperandCountSplitter::new(4)?.run(&mut computation)?;
    for inst in computation.instructions() {
        if let Opcode::Concatenate { dimension } = inst.opcode {
            let total: usize = inst
                .operands
                .iter()
                .map(|id| computation.instruction(*id).expect("defined").shape.dims()[dimension])
                .sum();
            assert_eq!(inst.shape.dims()[dimension], total, "{}", inst.name);
        }
    }
    Ok(())
}

#[test]
fn running_twice_changes_nothing_more() -> anyhow::Result<()> {
    let (mut computation, _, _) = wide_concat(30)?;
    let pass = OperandCountSplitter::new(4)?;
    let first = pass.run(&mut computation)?;
    assert!(first.changed);
    let snapshot = computation.clone();
    let second = pass.run(&mut computation)?;
    assert!(!second.changed);
    assert_eq!(computation, snapshot);
    Ok(())
}

#[test]
fn tree_depth_is_logarithmic_in_the_limit() -> anyhow::Result<()> {
    let (mut computation, _, _) = wide_concat(64)?;
    let stats = OperandCountSplitter::new(4)?.run(&mut computation)?;
    // 64 -> 16 -> 4 operands
    assert_eq!(stats.inserted_insts, 16 + 4);
    assert_eq!(computation.root_instruction().operands.len(), 4);
    Ok(())
}

#[test]
fn oversized_custom_call_is_unsupported() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("call");
    let params = (0..5)
        .map(|i| b.parameter(i, vector(2)))
        .collect::<Result<Vec<_>, _>>()?;
    let call = b.custom_call(CustomCallSpec::new("many_args"), &params, vector(2))?;
    let mut computation = b.build(call)?;
    let before = computation.clone();

    let err = OperandCountSplitter::new(4)?.run(&mut computation).unwrap_err();
    assert!(matches!(
        err,
        PassError::UnsupportedStructure { instruction, .. } if instruction == call
    ));
    assert_eq!(computation, before);
    Ok(())
}
