use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::shape::TensorShape;

/// Assignment of output dimensions to the x/y/z dispatch axes.
///
/// Each list is in row-major order (outermost first). Together the three lists
/// partition `0..rank`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchLayout {
    pub x: Vec<usize>,
    pub y: Vec<usize>,
    pub z: Vec<usize>,
}

impl DispatchLayout {
    pub fn new(x: Vec<usize>, y: Vec<usize>, z: Vec<usize>) -> Self {
        Self { x, y, z }
    }

    pub fn axes(&self) -> [&[usize]; 3] {
        [&self.x, &self.y, &self.z]
    }

    /// True when every dimension is covered by the x axis.
    pub fn is_flat(&self) -> bool {
        self.y.is_empty() && self.z.is_empty()
    }

    /// Product of the extents an axis covers; an empty axis covers 1.
    pub fn axis_extents(&self, shape: &TensorShape) -> [usize; 3] {
        let [x, y, z] = self.axes();
        [shape.product_of(x), shape.product_of(y), shape.product_of(z)]
    }

    pub fn validate(&self, rank: usize) -> Result<()> {
        let mut seen = vec![false; rank];
        for &dim in self.x.iter().chain(&self.y).chain(&self.z) {
            if dim >= rank || seen[dim] {
                return Err(KernelError::shape(
                    "dispatch_layout",
                    format!("{self:?} does not partition the {rank} output dimensions"),
                ));
            }
            seen[dim] = true;
        }
        if seen.iter().any(|covered| !covered) {
            return Err(KernelError::shape(
                "dispatch_layout",
                format!("{self:?} leaves output dimensions uncovered (rank {rank})"),
            ));
        }
        Ok(())
    }

    pub fn tag(&self) -> String {
        let join = |dims: &[usize]| {
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(".")
        };
        format!("x{}_y{}_z{}", join(&self.x), join(&self.y), join(&self.z))
    }
}

/// Every dimension on x, decoded as one flat index.
pub fn flat_dispatch_layout(shape: &TensorShape) -> DispatchLayout {
    DispatchLayout::new((0..shape.rank()).collect(), Vec::new(), Vec::new())
}

/// Innermost dimension on x, the next on y, everything further out on z.
pub fn flatten_to_dispatch_layout(shape: &TensorShape) -> DispatchLayout {
    let rank = shape.rank();
    match rank {
        0 => DispatchLayout::default(),
        1 => DispatchLayout::new(vec![0], Vec::new(), Vec::new()),
        2 => DispatchLayout::new(vec![1], vec![0], Vec::new()),
        _ => DispatchLayout::new(vec![rank - 1], vec![rank - 2], (0..rank - 2).collect()),
    }
}

/// Layout used by convolution outputs in channels-last order: channels on x,
/// output rows and columns together on y, batch on z.
pub fn conv_dispatch_layout() -> DispatchLayout {
    DispatchLayout::new(vec![3], vec![1, 2], vec![0])
}

/// Decode a flat row-major index into coordinates of `shape`.
pub fn coords_from_index(shape: &TensorShape, mut index: usize) -> Vec<usize> {
    let strides = shape.strides();
    let mut coords = vec![0; shape.rank()];
    for (d, stride) in strides.iter().enumerate() {
        coords[d] = index / stride;
        index -= coords[d] * stride;
    }
    coords
}

/// Host mirror of the generated `getOutputCoords`: each axis decodes its
/// bucket with repeated div/mod from the innermost dimension out. The
/// outermost dimension of a bucket keeps the quotient, so ids past the end
/// stay out of bounds instead of wrapping.
pub fn decode_axis_coords(
    layout: &DispatchLayout,
    shape: &TensorShape,
    global: [usize; 3],
) -> Vec<usize> {
    let mut coords = vec![0; shape.rank()];
    for (axis, dims) in layout.axes().iter().enumerate() {
        let mut rem = global[axis];
        for (pos, &d) in dims.iter().enumerate().rev() {
            if pos == 0 {
                coords[d] = rem;
            } else {
                coords[d] = rem % shape[d].max(1);
                rem /= shape[d].max(1);
            }
        }
    }
    coords
}
