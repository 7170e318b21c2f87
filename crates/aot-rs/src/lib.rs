//! Ahead-of-time compilation and thunk-based execution for dataflow computations.
//!
//! A computation built with [`hlo::ComputationBuilder`] flows through the
//! operand-count splitting pass and layout assignment, is packaged by the AOT
//! client for a compilation service, and is finally realized as a thunk tree
//! that runs against device buffers on a stream. Native routines referenced by
//! the computation resolve through the process-wide
//! [`custom_call::CustomCallTargetRegistry`].

pub mod aot;
pub mod buffer_assignment;
pub mod custom_call;
pub mod disjoint_set;
pub mod env;
pub mod executable;
pub mod hlo;
pub mod layout;
pub mod passes;
pub mod primitive;
pub mod runtime;
pub mod thunk;

pub use executable::{Executable, ExecutableInfo, ExecutionOutput, OutputBuffer};
pub use primitive::ElementType;
