use aot_rs::layout::{LibraryRoutine, TargetMachineFeatures};
use aot_rs::thunk::matmul_symbol;
use aot_rs::ElementType;

/// What the host target offers to the layout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTargetFeatures {
    library_matmul: bool,
}

impl HostTargetFeatures {
    pub fn new(library_matmul: bool) -> Self {
        Self { library_matmul }
    }

    /// Reads `AOTRS_HOST_LIBRARY_MATMUL` (on unless set to a falsy value).
    pub fn from_env() -> Self {
        Self::new(aot_rs::env::read_flag("AOTRS_HOST_LIBRARY_MATMUL", true))
    }

    pub fn library_matmul(&self) -> bool {
        self.library_matmul
    }
}

impl Default for HostTargetFeatures {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TargetMachineFeatures for HostTargetFeatures {
    fn has_library_routine(&self, routine: LibraryRoutine, element_type: ElementType) -> bool {
        match routine {
            LibraryRoutine::MatMul => self.library_matmul && matmul_symbol(element_type).is_some(),
        }
    }
}
