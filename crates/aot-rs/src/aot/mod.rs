//! Ahead-of-time compilation: a compile-only client that validates a batch of
//! instances and hands it to a [`CompilationService`] as one request.

mod options;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::hlo::{Computation, Shape};
use crate::layout::ComputationLayout;

pub use options::{AotCompilationOptions, DebugOptions, RelocationModel};

/// Failures reported by a compilation service for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("module {module} failed to compile: {reason}")]
    Compilation { module: String, reason: String },
    #[error("compilation resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("target {0} is not supported by this service")]
    UnsupportedTarget(String),
    #[error("compilation service unavailable: {0}")]
    Unavailable(String),
    #[error("compilation service internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AotError {
    /// The caller passed an invalid batch; nothing was compiled.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// The service rejected or failed the batch; no artifacts are returned.
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type AotResult<T> = Result<T, AotError>;

/// One computation to compile, with the layouts its callers will use.
#[derive(Debug, Clone)]
pub struct AotCompilationInstance<'a> {
    /// `None` models a missing computation and is rejected before dispatch.
    pub computation: Option<&'a Computation>,
    pub argument_layouts: Vec<Shape>,
    pub result_layout: Shape,
}

impl<'a> AotCompilationInstance<'a> {
    pub fn new(
        computation: &'a Computation,
        argument_layouts: Vec<Shape>,
        result_layout: Shape,
    ) -> Self {
        Self {
            computation: Some(computation),
            argument_layouts,
            result_layout,
        }
    }

    /// Row-major layouts for every argument and the result.
    pub fn with_default_layouts(computation: &'a Computation) -> Self {
        let layout = ComputationLayout::from_computation(computation);
        Self::new(computation, layout.parameter_layouts, layout.result_layout)
    }
}

/// A computation plus its entry layout, as shipped to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HloModule {
    pub name: String,
    pub computation: Computation,
    pub parameter_layouts: Vec<Shape>,
    pub result_layout: Shape,
}

impl HloModule {
    pub fn computation_layout(&self) -> ComputationLayout {
        ComputationLayout::new(self.parameter_layouts.clone(), self.result_layout.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleGroup {
    pub name: String,
    pub modules: Vec<HloModule>,
}

/// Backend-defined compiled artifact for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotCompilationResult {
    pub module_name: String,
    pub entry_point: String,
    pub object_file: Vec<u8>,
}

/// Facts shared by every artifact of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AotCompilationMetadata {
    pub target_triple: String,
    pub module_names: Vec<String>,
    /// Native symbols the artifacts resolve through the custom call registry.
    pub custom_call_targets: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub results: Vec<AotCompilationResult>,
    pub metadata: Option<AotCompilationMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotCompilationOutput {
    /// One per input instance, in input order.
    pub results: Vec<AotCompilationResult>,
    pub metadata: Option<AotCompilationMetadata>,
}

pub trait CompilationService: Send + Sync {
    fn platform_name(&self) -> &str;

    fn compile_ahead_of_time(
        &self,
        group: ModuleGroup,
        options: &AotCompilationOptions,
    ) -> ServiceResult<ServiceResponse>;
}

/// Client that only compiles; it never executes artifacts.
#[derive(Clone)]
pub struct CompileOnlyClient {
    service: Arc<dyn CompilationService>,
}

impl CompileOnlyClient {
    pub fn new(service: Arc<dyn CompilationService>) -> Self {
        Self { service }
    }

    pub fn platform_name(&self) -> &str {
        self.service.platform_name()
    }

    /// Compiles every instance in a single service request.
    ///
    /// Preconditions are checked before anything is dispatched. A service failure
    /// fails the whole batch.
    pub fn compile_ahead_of_time(
        &self,
        instances: &[AotCompilationInstance<'_>],
        options: &AotCompilationOptions,
    ) -> AotResult<AotCompilationOutput> {
        let group = build_module_group(instances, options)?;
        let expected = group.modules.len();
        info!(
            platform = self.service.platform_name(),
            target = %options.target_triple,
            modules = expected,
            "dispatching aot compilation"
        );

        let response = match self.service.compile_ahead_of_time(group, options) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "aot compilation failed");
                return Err(AotError::Service(err));
            }
        };
        if response.results.len() != expected {
            return Err(AotError::Internal(format!(
                "service returned {} artifacts for {expected} instances",
                response.results.len()
            )));
        }
        Ok(AotCompilationOutput {
            results: response.results,
            metadata: response.metadata,
        })
    }
}

fn build_module_group(
    instances: &[AotCompilationInstance<'_>],
    options: &AotCompilationOptions,
) -> AotResult<ModuleGroup> {
    if instances.is_empty() {
        return Err(AotError::Precondition(
            "at least one computation is required".into(),
        ));
    }
    if options.target_triple.trim().is_empty() {
        return Err(AotError::Precondition("target triple is empty".into()));
    }
    if options.entry_point_name.trim().is_empty() {
        return Err(AotError::Precondition("entry point name is empty".into()));
    }

    let mut used_names = HashSet::new();
    let mut modules = Vec::with_capacity(instances.len());
    for (position, instance) in instances.iter().enumerate() {
        let computation = instance.computation.ok_or_else(|| {
            AotError::Precondition(format!("instance {position} has no computation"))
        })?;
        check_signature(position, computation, instance)?;

        let base = computation.name();
        let mut name = base.to_string();
        let mut suffix = position;
        while !used_names.insert(name.clone()) {
            name = format!("{base}.{suffix}");
            suffix += 1;
        }
        modules.push(HloModule {
            name,
            computation: computation.clone(),
            parameter_layouts: instance.argument_layouts.clone(),
            result_layout: instance.result_layout.clone(),
        });
    }

    let name = modules
        .first()
        .map(|m| m.name.clone())
        .unwrap_or_default();
    Ok(ModuleGroup { name, modules })
}

fn check_signature(
    position: usize,
    computation: &Computation,
    instance: &AotCompilationInstance<'_>,
) -> AotResult<()> {
    let params = computation.parameters();
    if params.len() != instance.argument_layouts.len() {
        return Err(AotError::Precondition(format!(
            "instance {position}: {} takes {} arguments but {} layouts were given",
            computation.name(),
            params.len(),
            instance.argument_layouts.len()
        )));
    }
    for (param, layout) in params.iter().zip(&instance.argument_layouts) {
        if !param.shape.compatible(layout) {
            return Err(AotError::Precondition(format!(
                "instance {position}: argument layout {layout} does not match parameter {}",
                param.shape
            )));
        }
        if !layout.has_layouts() {
            return Err(AotError::Precondition(format!(
                "instance {position}: argument layout {layout} is missing a layout"
            )));
        }
    }
    if !computation.result_shape().compatible(&instance.result_layout) {
        return Err(AotError::Precondition(format!(
            "instance {position}: result layout {} does not match result {}",
            instance.result_layout,
            computation.result_shape()
        )));
    }
    if !instance.result_layout.has_layouts() {
        return Err(AotError::Precondition(format!(
            "instance {position}: result layout {} is missing a layout",
            instance.result_layout
        )));
    }
    Ok(())
}
