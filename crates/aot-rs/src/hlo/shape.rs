use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::primitive::ElementType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("element type {0} cannot form an array shape")]
    NotArrayType(ElementType),
    #[error("layout {layout} has {got} entries but shape is rank {rank}")]
    LayoutRankMismatch {
        layout: Layout,
        got: usize,
        rank: usize,
    },
    #[error("layout {layout} has out-of-bounds dimension {dim}")]
    LayoutOutOfBounds { layout: Layout, dim: usize },
    #[error("layout {layout} repeats dimension {dim}")]
    LayoutDuplicate { layout: Layout, dim: usize },
    #[error("a single layout is not valid for tuple shape {0}")]
    LayoutOnTuple(Shape),
    #[error("shape {0} has no leaf at index {1}")]
    InvalidIndex(Shape, ShapeIndex),
}

pub type ShapeResult<T> = Result<T, ShapeError>;

/// Physical dimension order of a dense array, listed from minor to major.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Layout {
    minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: impl Into<Vec<usize>>) -> Self {
        Self {
            minor_to_major: minor_to_major.into(),
        }
    }

    /// Builds a layout from a major-to-minor dimension list.
    pub fn from_major_to_minor(major_to_minor: &[usize]) -> Self {
        Self::new(major_to_minor.iter().rev().copied().collect::<Vec<_>>())
    }

    /// Row-major layout: dimension 0 is most major.
    pub fn descending(rank: usize) -> Self {
        Self::new((0..rank).rev().collect::<Vec<_>>())
    }

    /// Column-major layout: dimension 0 is most minor.
    pub fn ascending(rank: usize) -> Self {
        Self::new((0..rank).collect::<Vec<_>>())
    }

    pub fn minor_to_major(&self) -> &[usize] {
        &self.minor_to_major
    }

    pub fn major_to_minor(&self) -> Vec<usize> {
        self.minor_to_major.iter().rev().copied().collect()
    }

    pub fn rank(&self) -> usize {
        self.minor_to_major.len()
    }

    pub fn is_descending(&self) -> bool {
        self.minor_to_major
            .iter()
            .enumerate()
            .all(|(idx, dim)| *dim + idx + 1 == self.minor_to_major.len())
    }

    /// Maps each logical dimension to its physical position, counted from the major end.
    pub fn logical_to_physical(&self) -> Vec<usize> {
        let mut out = vec![0usize; self.rank()];
        for (physical, logical) in self.major_to_minor().into_iter().enumerate() {
            out[logical] = physical;
        }
        out
    }

    /// Checks that this layout is a permutation of `0..rank`.
    pub fn validate_for_rank(&self, rank: usize) -> ShapeResult<()> {
        if self.rank() != rank {
            return Err(ShapeError::LayoutRankMismatch {
                layout: self.clone(),
                got: self.rank(),
                rank,
            });
        }
        let mut seen = vec![false; rank];
        for &dim in &self.minor_to_major {
            if dim >= rank {
                return Err(ShapeError::LayoutOutOfBounds {
                    layout: self.clone(),
                    dim,
                });
            }
            if seen[dim] {
                return Err(ShapeError::LayoutDuplicate {
                    layout: self.clone(),
                    dim,
                });
            }
            seen[dim] = true;
        }
        Ok(())
    }

    /// Element offset of `index` inside a buffer of `dims` stored with this layout.
    pub fn linear_offset(&self, dims: &[usize], index: &[usize]) -> usize {
        let mut offset = 0usize;
        let mut stride = 1usize;
        for &dim in &self.minor_to_major {
            offset += index[dim] * stride;
            stride *= dims[dim];
        }
        offset
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .minor_to_major
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{{{dims}}}")
    }
}

/// Path to a subshape inside a (possibly nested) tuple shape. Empty for the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeIndex(SmallVec<[usize; 2]>);

impl ShapeIndex {
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_slice(path: &[usize]) -> Self {
        Self(SmallVec::from_slice(path))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn push(&mut self, index: usize) {
        self.0.push(index);
    }

    /// Returns `prefix ++ self`.
    pub fn prepended(&self, prefix: usize) -> ShapeIndex {
        let mut out = SmallVec::with_capacity(self.0.len() + 1);
        out.push(prefix);
        out.extend_from_slice(&self.0);
        ShapeIndex(out)
    }

    /// Splits off the first element.
    pub fn split_first(&self) -> Option<(usize, ShapeIndex)> {
        let (first, rest) = self.0.split_first()?;
        Some((*first, ShapeIndex::from_slice(rest)))
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(|i| i.to_string()).collect::<Vec<_>>();
        write!(f, "{{{}}}", parts.join(","))
    }
}

/// Array or tuple shape. Array shapes may carry a physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    element_type: ElementType,
    dims: Vec<usize>,
    tuple_shapes: Vec<Shape>,
    layout: Option<Layout>,
}

impl Shape {
    pub fn array(element_type: ElementType, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            element_type,
            dims: dims.into(),
            tuple_shapes: Vec::new(),
            layout: None,
        }
    }

    pub fn array_with_layout(
        element_type: ElementType,
        dims: impl Into<Vec<usize>>,
        layout: Layout,
    ) -> Self {
        let mut shape = Self::array(element_type, dims);
        shape.layout = Some(layout);
        shape
    }

    pub fn tuple(elements: impl Into<Vec<Shape>>) -> Self {
        Self {
            element_type: ElementType::Tuple,
            dims: Vec::new(),
            tuple_shapes: elements.into(),
            layout: None,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn is_tuple(&self) -> bool {
        self.element_type == ElementType::Tuple
    }

    pub fn is_array(&self) -> bool {
        self.element_type.is_array_type()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn tuple_shapes(&self) -> &[Shape] {
        &self.tuple_shapes
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn set_layout(&mut self, layout: Layout) -> ShapeResult<()> {
        if self.is_tuple() {
            return Err(ShapeError::LayoutOnTuple(self.clone()));
        }
        layout.validate_for_rank(self.rank())?;
        self.layout = Some(layout);
        Ok(())
    }

    /// Gives every array leaf without a layout the row-major layout of its rank.
    pub fn fill_default_layouts(&mut self) {
        if self.is_tuple() {
            for element in &mut self.tuple_shapes {
                element.fill_default_layouts();
            }
        } else if self.is_array() && self.layout.is_none() {
            self.layout = Some(Layout::descending(self.rank()));
        }
    }

    pub fn clear_layouts(&mut self) {
        self.layout = None;
        for element in &mut self.tuple_shapes {
            element.clear_layouts();
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> ShapeResult<Self> {
        self.set_layout(layout)?;
        Ok(self)
    }

    /// Layout of an array shape, falling back to row-major when unset.
    pub fn layout_or_default(&self) -> Layout {
        self.layout
            .clone()
            .unwrap_or_else(|| Layout::descending(self.rank()))
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Dense byte size of an array shape; zero for tuples.
    pub fn byte_size(&self) -> usize {
        if !self.is_array() {
            return 0;
        }
        self.element_count() * self.element_type.byte_width()
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        let mut current = self;
        for &i in index.as_slice() {
            current = current.tuple_shapes.get(i)?;
        }
        Some(current)
    }

    pub fn subshape_mut(&mut self, index: &ShapeIndex) -> Option<&mut Shape> {
        let mut current = self;
        for &i in index.as_slice() {
            current = current.tuple_shapes.get_mut(i)?;
        }
        Some(current)
    }

    /// Non-tuple subshapes in depth-first order together with their indices.
    pub fn leaves(&self) -> Vec<(ShapeIndex, &Shape)> {
        let mut out = Vec::new();
        collect_leaves(self, ShapeIndex::root(), &mut out);
        out
    }

    /// Structural equality ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        self.element_type == other.element_type
            && self.dims == other.dims
            && self.tuple_shapes.len() == other.tuple_shapes.len()
            && self
                .tuple_shapes
                .iter()
                .zip(&other.tuple_shapes)
                .all(|(a, b)| a.compatible(b))
    }

    /// Returns `true` when every array leaf carries a layout.
    pub fn has_layouts(&self) -> bool {
        self.leaves()
            .iter()
            .all(|(_, leaf)| !leaf.is_array() || leaf.layout.is_some())
    }
}

fn collect_leaves<'a>(shape: &'a Shape, index: ShapeIndex, out: &mut Vec<(ShapeIndex, &'a Shape)>) {
    if shape.is_tuple() {
        for (i, element) in shape.tuple_shapes.iter().enumerate() {
            let mut child = index.clone();
            child.push(i);
            collect_leaves(element, child, out);
        }
    } else {
        out.push((index, shape));
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tuple() {
            let inner = self
                .tuple_shapes
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return write!(f, "({inner})");
        }
        let dims = self
            .dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}[{dims}]", self.element_type)?;
        if let Some(layout) = &self.layout {
            write!(f, "{layout}")?;
        }
        Ok(())
    }
}
