use std::collections::{HashMap, HashSet};

use crate::hlo::{Computation, InstructionId, Opcode};

use super::{ComputationPass, PassResult, PassStats};

/// Removes instructions the root does not depend on.
///
/// Parameters are kept so the signature never changes; side-effecting custom
/// calls and everything they read are kept as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    const NAME: &'static str = "dce";
}

impl ComputationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, computation: &mut Computation) -> PassResult<PassStats> {
        let mut def_map: HashMap<InstructionId, usize> =
            HashMap::with_capacity(computation.len());
        for (idx, inst) in computation.instructions().iter().enumerate() {
            def_map.insert(inst.id, idx);
        }

        let mut worklist: Vec<InstructionId> = vec![computation.root()];
        for inst in computation.instructions() {
            if is_pinned(&inst.opcode) {
                worklist.push(inst.id);
            }
        }

        let mut live: HashSet<InstructionId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            worklist.extend(computation.instructions()[idx].operands.iter().copied());
        }

        let removed = computation.retain(|inst| live.contains(&inst.id));
        Ok(PassStats {
            changed: removed > 0,
            inserted_insts: 0,
            erased_insts: removed,
        })
    }
}

fn is_pinned(opcode: &Opcode) -> bool {
    matches!(opcode, Opcode::Parameter { .. }) || opcode.has_side_effect()
}
