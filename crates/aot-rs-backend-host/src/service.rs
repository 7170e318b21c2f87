//! Compilation service that lowers modules for the host backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use aot_rs::aot::{
    AotCompilationMetadata, AotCompilationOptions, AotCompilationResult, CompilationService,
    HloModule, ModuleGroup, ServiceError, ServiceResponse, ServiceResult,
};
use aot_rs::hlo::Computation;
use aot_rs::layout::{LayoutAssignment, LayoutConstraints, LibraryCallLayoutPolicy};
use aot_rs::passes::{DeadCodeElimination, OperandCountSplitter, PassPipeline};
use aot_rs::Executable;
use tracing::{debug, info};

use crate::artifact::{entry_symbol, ObjectFile};
use crate::features::HostTargetFeatures;

/// Largest operand list a host instruction may carry.
pub const DEFAULT_MAX_OPERANDS: usize = 32;

const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64"];

/// Compiles module groups into host [`ObjectFile`]s.
#[derive(Debug, Clone)]
pub struct HostCompilationService {
    features: HostTargetFeatures,
    max_operands: usize,
}

impl HostCompilationService {
    pub fn new(features: HostTargetFeatures) -> Self {
        Self {
            features,
            max_operands: DEFAULT_MAX_OPERANDS,
        }
    }

    pub fn with_max_operands(mut self, max_operands: usize) -> Self {
        self.max_operands = max_operands;
        self
    }

    pub fn into_shared(self) -> Arc<dyn CompilationService> {
        Arc::new(self)
    }

    pub fn features(&self) -> HostTargetFeatures {
        self.features
    }

    /// Runs the full host lowering on a copy of `module`'s computation.
    ///
    /// The returned computation is split, laid out and known to emit.
    pub fn lower(
        &self,
        module: &HloModule,
        options: &AotCompilationOptions,
    ) -> ServiceResult<Computation> {
        let fail = |reason: String| ServiceError::Compilation {
            module: module.name.clone(),
            reason,
        };
        let mut computation = module.computation.clone();
        let debug_options = &options.debug_options;

        let limit = debug_options
            .max_operands_override
            .unwrap_or(self.max_operands);
        let splitter = OperandCountSplitter::new(limit).map_err(|err| fail(err.to_string()))?;
        let mut builder = PassPipeline::builder();
        builder.pass(Arc::new(splitter));
        builder.pass(Arc::new(DeadCodeElimination));
        let pipeline = builder
            .finish()
            .with_logging(debug_options.pass_stats, debug_options.dump_ir);
        let pass_stats = pipeline
            .run(&mut computation)
            .map_err(|err| fail(err.to_string()))?;

        let mut constraints = LayoutConstraints::new();
        module
            .computation_layout()
            .seed(&computation, &mut constraints)
            .map_err(|err| fail(err.to_string()))?;
        let layout_stats = LayoutAssignment::new(LibraryCallLayoutPolicy::new(self.features))
            .run(&mut computation, &mut constraints)
            .map_err(|err| fail(err.to_string()))?;

        Executable::from_computation(&computation).map_err(|err| fail(err.to_string()))?;
        debug!(
            module = %module.name,
            inserted = pass_stats.inserted_insts,
            erased = pass_stats.erased_insts,
            copies = layout_stats.copies_inserted,
            "module lowered"
        );
        Ok(computation)
    }
}

impl Default for HostCompilationService {
    fn default() -> Self {
        Self::new(HostTargetFeatures::from_env())
    }
}

impl CompilationService for HostCompilationService {
    fn platform_name(&self) -> &str {
        "host"
    }

    fn compile_ahead_of_time(
        &self,
        group: ModuleGroup,
        options: &AotCompilationOptions,
    ) -> ServiceResult<ServiceResponse> {
        let arch = options
            .target_triple
            .split('-')
            .next()
            .unwrap_or_default();
        if !SUPPORTED_ARCHES.contains(&arch) {
            return Err(ServiceError::UnsupportedTarget(options.target_triple.clone()));
        }

        let mut results = Vec::with_capacity(group.modules.len());
        let mut custom_call_targets = BTreeSet::new();
        for module in &group.modules {
            let computation = self.lower(module, options)?;
            let entry_point = entry_symbol(&options.entry_point_name, &module.name, &computation);
            let object = ObjectFile::new(
                options.target_triple.clone(),
                entry_point.clone(),
                options.relocation_model,
                computation,
            );
            custom_call_targets.extend(object.custom_call_targets.iter().cloned());
            let object_file = object.to_bytes().map_err(|err| ServiceError::Compilation {
                module: module.name.clone(),
                reason: err.to_string(),
            })?;
            results.push(AotCompilationResult {
                module_name: module.name.clone(),
                entry_point,
                object_file,
            });
        }

        info!(
            group = %group.name,
            modules = results.len(),
            target = %options.target_triple,
            "host aot compilation finished"
        );
        Ok(ServiceResponse {
            metadata: Some(AotCompilationMetadata {
                target_triple: options.target_triple.clone(),
                module_names: results.iter().map(|r| r.module_name.clone()).collect(),
                custom_call_targets,
            }),
            results,
        })
    }
}
