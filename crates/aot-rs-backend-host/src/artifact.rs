//! Relocatable object format emitted by the host compilation service.

use std::collections::BTreeSet;

use aot_rs::aot::RelocationModel;
use aot_rs::hlo::{BuildError, Computation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HOST_OBJECT_MAGIC: [u8; 4] = *b"AOTH";
pub const HOST_OBJECT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact encoding failed: {0}")]
    Encode(String),
    #[error("artifact decoding failed: {0}")]
    Decode(String),
    #[error("not a host object file")]
    BadMagic,
    #[error("unsupported object version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("object targets {found} but this process runs {expected}")]
    TargetMismatch { found: String, expected: String },
    #[error("object holds a malformed computation: {0}")]
    Invalid(#[source] BuildError),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// A compiled computation with everything the loader needs to rebuild it.
///
/// The computation is stored after splitting and layout assignment, so the
/// loader only has to plan buffers and emit thunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectFile {
    pub magic: [u8; 4],
    pub version: u32,
    pub target_triple: String,
    pub entry_point: String,
    pub relocation_model: RelocationModel,
    pub custom_call_targets: BTreeSet<String>,
    pub computation: Computation,
}

impl ObjectFile {
    pub fn new(
        target_triple: impl Into<String>,
        entry_point: impl Into<String>,
        relocation_model: RelocationModel,
        computation: Computation,
    ) -> Self {
        let custom_call_targets = referenced_custom_calls(&computation);
        Self {
            magic: HOST_OBJECT_MAGIC,
            version: HOST_OBJECT_VERSION,
            target_triple: target_triple.into(),
            entry_point: entry_point.into(),
            relocation_model,
            custom_call_targets,
            computation,
        }
    }

    pub fn to_bytes(&self) -> ArtifactResult<Vec<u8>> {
        bincode::serialize(self).map_err(|err| ArtifactError::Encode(err.to_string()))
    }

    /// Decodes and checks the magic, the format version and the computation.
    pub fn from_bytes(bytes: &[u8]) -> ArtifactResult<Self> {
        let object: ObjectFile =
            bincode::deserialize(bytes).map_err(|err| ArtifactError::Decode(err.to_string()))?;
        if object.magic != HOST_OBJECT_MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        if object.version != HOST_OBJECT_VERSION {
            return Err(ArtifactError::Version {
                found: object.version,
                expected: HOST_OBJECT_VERSION,
            });
        }
        object
            .computation
            .validate()
            .map_err(ArtifactError::Invalid)?;
        Ok(object)
    }
}

/// Symbols of the runtime routines and custom calls a computation calls.
pub fn referenced_custom_calls(computation: &Computation) -> BTreeSet<String> {
    use aot_rs::hlo::Opcode;
    use aot_rs::thunk::matmul_symbol;

    let mut out = BTreeSet::new();
    for inst in computation.instructions() {
        match &inst.opcode {
            Opcode::CustomCall(spec) => {
                out.insert(spec.target.clone());
            }
            Opcode::Dot => {
                if let Some(symbol) = matmul_symbol(inst.shape.element_type()) {
                    out.insert(symbol.to_string());
                }
            }
            _ => {}
        }
    }
    out
}

pub fn sanitize_symbol(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        let is_valid = ch.is_ascii_alphanumeric() || ch == '_';
        if idx == 0 && ch.is_ascii_digit() {
            out.push('_');
        }
        out.push(if is_valid { ch } else { '_' });
    }
    if out.is_empty() {
        out.push_str("entry");
    }
    out
}

/// `<entry>__<module>__<hash>`: unique per module content within a batch.
pub fn entry_symbol(entry_point_name: &str, module_name: &str, computation: &Computation) -> String {
    let base = sanitize_symbol(entry_point_name);
    let module = sanitize_symbol(module_name);
    let hash = computation
        .to_bincode_bytes()
        .map(|bytes| fnv_hash(&bytes))
        .unwrap_or_default();
    format!("{base}__{module}__{hash:016x}")
}

fn fnv_hash(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
