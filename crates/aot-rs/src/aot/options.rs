use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelocationModel {
    #[default]
    Static,
    SmallPic,
    BigPic,
}

impl RelocationModel {
    pub fn is_position_independent(self) -> bool {
        !matches!(self, RelocationModel::Static)
    }
}

/// Compile-time switches that travel with a request to the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugOptions {
    pub pass_stats: bool,
    pub dump_ir: bool,
    pub max_operands_override: Option<usize>,
}

impl DebugOptions {
    /// Reads `AOTRS_PASS_STATS`, `AOTRS_DUMP_IR` and `AOTRS_MAX_OPERANDS`.
    pub fn from_env() -> Self {
        Self {
            pass_stats: crate::env::pass_stats_enabled(),
            dump_ir: crate::env::dump_ir_enabled(),
            max_operands_override: crate::env::max_operands_override(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotCompilationOptions {
    pub target_triple: String,
    /// Symbol name of the entry function in each emitted object.
    pub entry_point_name: String,
    pub relocation_model: RelocationModel,
    pub debug_options: DebugOptions,
}

impl AotCompilationOptions {
    pub fn new(target_triple: impl Into<String>, entry_point_name: impl Into<String>) -> Self {
        Self {
            target_triple: target_triple.into(),
            entry_point_name: entry_point_name.into(),
            relocation_model: RelocationModel::default(),
            debug_options: DebugOptions::from_env(),
        }
    }

    pub fn with_relocation_model(mut self, relocation_model: RelocationModel) -> Self {
        self.relocation_model = relocation_model;
        self
    }

    pub fn with_debug_options(mut self, debug_options: DebugOptions) -> Self {
        self.debug_options = debug_options;
        self
    }
}
