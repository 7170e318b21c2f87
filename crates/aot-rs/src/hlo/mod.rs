//! Dataflow IR consumed by the compiler: shapes, layouts, instructions and computations.

mod builder;
mod computation;
mod literal;
mod shape;

pub use builder::{infer_concatenate_shape, BuildError, BuildResult, ComputationBuilder};
pub use computation::{Computation, CustomCallSpec, Instruction, InstructionId, Opcode};
pub use literal::{bytes_to_f32s, bytes_to_f64s, f32s_to_bytes, Literal};
pub use shape::{Layout, Shape, ShapeError, ShapeIndex, ShapeResult};
