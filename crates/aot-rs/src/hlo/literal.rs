use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};

use super::shape::Shape;
use crate::primitive::ElementType;

/// Constant array value: a shape plus its dense row-major bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub shape: Shape,
    pub bytes: Arc<[u8]>,
}

impl Literal {
    pub fn new(shape: Shape, bytes: Arc<[u8]>) -> Self {
        Self { shape, bytes }
    }

    pub fn from_f32(dims: impl Into<Vec<usize>>, values: &[f32]) -> Self {
        Self::new(
            Shape::array(ElementType::F32, dims),
            Arc::from(f32s_to_bytes(values)),
        )
    }

    pub fn from_f64(dims: impl Into<Vec<usize>>, values: &[f64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Shape::array(ElementType::F64, dims), Arc::from(bytes))
    }

    pub fn from_i32(dims: impl Into<Vec<usize>>, values: &[i32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Shape::array(ElementType::S32, dims), Arc::from(bytes))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the byte payload matches the dense size of the shape.
    pub fn is_consistent(&self) -> bool {
        self.shape.is_array() && self.shape.byte_size() == self.bytes.len()
    }
}

impl Serialize for Literal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Literal", 2)?;
        state.serialize_field("shape", &self.shape)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Literal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct LiteralHelper {
            shape: Shape,
            bytes: Vec<u8>,
        }

        let helper = LiteralHelper::deserialize(deserializer)?;
        Ok(Literal {
            shape: helper.shape,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decodes little-endian `f32` values. Trailing partial elements are ignored.
pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn bytes_to_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect()
}
