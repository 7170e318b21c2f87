use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::hlo::{InstructionId, Layout, ShapeError, ShapeIndex};

/// A place in the computation that can carry a required physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayoutLocation {
    /// The `operand`-th operand as seen by `instruction`.
    Operand {
        instruction: InstructionId,
        operand: usize,
    },
    /// The array leaf at `index` of the value `instruction` produces.
    Result {
        instruction: InstructionId,
        index: ShapeIndex,
    },
    /// The array leaf at `index` of the value the computation returns.
    ComputationResult { index: ShapeIndex },
}

impl LayoutLocation {
    pub fn operand(instruction: InstructionId, operand: usize) -> Self {
        LayoutLocation::Operand {
            instruction,
            operand,
        }
    }

    pub fn result(instruction: InstructionId) -> Self {
        LayoutLocation::Result {
            instruction,
            index: ShapeIndex::root(),
        }
    }

    pub fn instruction(&self) -> Option<InstructionId> {
        match self {
            LayoutLocation::Operand { instruction, .. }
            | LayoutLocation::Result { instruction, .. } => Some(*instruction),
            LayoutLocation::ComputationResult { .. } => None,
        }
    }
}

impl fmt::Display for LayoutLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutLocation::Operand {
                instruction,
                operand,
            } => write!(f, "operand {operand} of {instruction}"),
            LayoutLocation::Result { instruction, index } => {
                write!(f, "result {index} of {instruction}")
            }
            LayoutLocation::ComputationResult { index } => {
                write!(f, "computation result {index}")
            }
        }
    }
}

/// Who asked for a constraint. Used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOrigin {
    Entry,
    Backend,
    User,
    /// Implied by buffer sharing through tuples and tuple projections.
    Alias,
}

impl fmt::Display for ConstraintOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintOrigin::Entry => "entry",
            ConstraintOrigin::Backend => "backend",
            ConstraintOrigin::User => "user",
            ConstraintOrigin::Alias => "alias",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutConstraint {
    pub layout: Layout,
    pub origin: ConstraintOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("conflicting layouts for {location}: {existing} ({existing_origin}) vs {requested} ({requested_origin})")]
    Conflict {
        location: LayoutLocation,
        existing: Layout,
        existing_origin: ConstraintOrigin,
        requested: Layout,
        requested_origin: ConstraintOrigin,
    },
    #[error("invalid layout for {location}: {source}")]
    InvalidLayout {
        location: LayoutLocation,
        #[source]
        source: ShapeError,
    },
    #[error("{location} does not name an array value")]
    NotAnArray { location: LayoutLocation },
    #[error("instruction {0} is not part of the computation")]
    UnknownInstruction(InstructionId),
    #[error("computation layout does not match computation: {0}")]
    SignatureMismatch(String),
    #[error("unsupported layout structure: {0}")]
    Unsupported(String),
}

pub type LayoutResult<T> = Result<T, LayoutError>;

/// Per-compilation set of required layouts, at most one per location.
#[derive(Debug, Clone, Default)]
pub struct LayoutConstraints {
    entries: BTreeMap<LayoutLocation, LayoutConstraint>,
}

impl LayoutConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `layout` for `location`.
    ///
    /// Returns `Ok(true)` when a new entry was added and `Ok(false)` when the same
    /// layout was already present. A different existing layout is a conflict and the
    /// set is left unchanged.
    pub fn add(
        &mut self,
        location: LayoutLocation,
        layout: Layout,
        origin: ConstraintOrigin,
    ) -> LayoutResult<bool> {
        match self.entries.get(&location) {
            Some(existing) if existing.layout == layout => Ok(false),
            Some(existing) => Err(LayoutError::Conflict {
                location,
                existing: existing.layout.clone(),
                existing_origin: existing.origin,
                requested: layout,
                requested_origin: origin,
            }),
            None => {
                self.entries
                    .insert(location, LayoutConstraint { layout, origin });
                Ok(true)
            }
        }
    }

    pub fn get(&self, location: &LayoutLocation) -> Option<&LayoutConstraint> {
        self.entries.get(location)
    }

    pub fn operand_layout(&self, instruction: InstructionId, operand: usize) -> Option<&Layout> {
        self.get(&LayoutLocation::operand(instruction, operand))
            .map(|c| &c.layout)
    }

    pub fn result_layout(&self, instruction: InstructionId, index: &ShapeIndex) -> Option<&Layout> {
        self.get(&LayoutLocation::Result {
            instruction,
            index: index.clone(),
        })
        .map(|c| &c.layout)
    }

    pub fn computation_result_layout(&self, index: &ShapeIndex) -> Option<&Layout> {
        self.get(&LayoutLocation::ComputationResult {
            index: index.clone(),
        })
        .map(|c| &c.layout)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LayoutLocation, &LayoutConstraint)> {
        self.entries.iter()
    }
}
