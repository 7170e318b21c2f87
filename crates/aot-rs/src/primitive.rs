//! Scalar element types and their classification.
//!
//! Every query here is total over array-representable types. Width queries on
//! `tuple`, `opaque`, `token` or the invalid sentinel are programming errors
//! and panic instead of returning a placeholder.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumerates the element types a shape can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementType {
    /// Sentinel for an unset or corrupt type.
    Invalid,
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    /// Complex number with two `f32` components.
    C64,
    Tuple,
    Opaque,
    Token,
}

impl ElementType {
    pub const ALL: [ElementType; 18] = [
        ElementType::Invalid,
        ElementType::Pred,
        ElementType::S8,
        ElementType::S16,
        ElementType::S32,
        ElementType::S64,
        ElementType::U8,
        ElementType::U16,
        ElementType::U32,
        ElementType::U64,
        ElementType::F16,
        ElementType::Bf16,
        ElementType::F32,
        ElementType::F64,
        ElementType::C64,
        ElementType::Tuple,
        ElementType::Opaque,
        ElementType::Token,
    ];

    /// Returns `true` for real floating-point types.
    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            ElementType::F16 | ElementType::Bf16 | ElementType::F32 | ElementType::F64
        )
    }

    pub fn is_complex(self) -> bool {
        matches!(self, ElementType::C64)
    }

    pub fn is_signed_integral(self) -> bool {
        matches!(
            self,
            ElementType::S8 | ElementType::S16 | ElementType::S32 | ElementType::S64
        )
    }

    pub fn is_unsigned_integral(self) -> bool {
        matches!(
            self,
            ElementType::U8 | ElementType::U16 | ElementType::U32 | ElementType::U64
        )
    }

    /// Union of signed and unsigned integers. Predicates are not integral.
    pub fn is_integral(self) -> bool {
        self.is_signed_integral() || self.is_unsigned_integral()
    }

    /// Returns `true` when values of this type can be stored in a dense array.
    pub fn is_array_type(self) -> bool {
        !matches!(
            self,
            ElementType::Invalid | ElementType::Tuple | ElementType::Opaque | ElementType::Token
        )
    }

    /// Storage width in bits, or `None` for types without one.
    pub fn try_bit_width(self) -> Option<usize> {
        match self {
            ElementType::Pred => Some(1),
            ElementType::S8 | ElementType::U8 => Some(8),
            ElementType::S16 | ElementType::U16 | ElementType::F16 | ElementType::Bf16 => Some(16),
            ElementType::S32 | ElementType::U32 | ElementType::F32 => Some(32),
            ElementType::S64 | ElementType::U64 | ElementType::F64 | ElementType::C64 => Some(64),
            ElementType::Invalid | ElementType::Tuple | ElementType::Opaque | ElementType::Token => {
                None
            }
        }
    }

    /// Storage width in bits.
    ///
    /// # Panics
    ///
    /// Panics for `tuple`, `opaque`, `token` and the invalid sentinel.
    pub fn bit_width(self) -> usize {
        match self.try_bit_width() {
            Some(bits) => bits,
            None => panic!("{self} is an invalid type for bit_width"),
        }
    }

    /// Storage width in bytes. Predicates occupy a full byte.
    ///
    /// # Panics
    ///
    /// Same as [`ElementType::bit_width`].
    pub fn byte_width(self) -> usize {
        self.bit_width().div_ceil(8)
    }

    /// Returns the type of the real and imaginary components.
    ///
    /// # Panics
    ///
    /// Panics when `self` is not complex.
    pub fn complex_component_type(self) -> ElementType {
        match self {
            ElementType::C64 => ElementType::F32,
            other => panic!("{other} is not a complex type"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::Invalid => "invalid",
            ElementType::Pred => "pred",
            ElementType::S8 => "s8",
            ElementType::S16 => "s16",
            ElementType::S32 => "s32",
            ElementType::S64 => "s64",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::F16 => "f16",
            ElementType::Bf16 => "bf16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::C64 => "c64",
            ElementType::Tuple => "tuple",
            ElementType::Opaque => "opaque",
            ElementType::Token => "token",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown element type name '{0}'")]
pub struct UnknownElementType(pub String);

impl FromStr for ElementType {
    type Err = UnknownElementType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ElementType::ALL
            .iter()
            .copied()
            .find(|ty| *ty != ElementType::Invalid && ty.name() == trimmed)
            .ok_or_else(|| UnknownElementType(trimmed.to_string()))
    }
}
