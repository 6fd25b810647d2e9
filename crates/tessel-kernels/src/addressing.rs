//! Host mirrors of the virtual matmul addressing emitted by the tiled
//! generators.
//!
//! A convolution is computed as a matmul whose A and B operands are never
//! materialized: every `(batch, row, col)` of the virtual matrices is mapped
//! back onto the original 4-D tensors. These mirrors follow the generated
//! `mm_readA` / `mm_readB` / `mm_write` exactly, so the tiled algorithm can be
//! checked on the host.

use crate::heuristics::MatMulDims;
use crate::shape::{Conv2dInfo, Conv2dTransposeInfo};

/// Where an element of the virtual A matrix comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ASource {
    /// Flat index into the A-side tensor.
    Read(usize),
    /// Outside the matrix or the padded input; contributes zero.
    OutOfBounds,
    /// Falls between two real samples of a strided transposed convolution.
    FractionalStride,
}

pub trait MatMulOperands {
    fn dims(&self) -> MatMulDims;

    fn a_source(&self, batch: usize, row: usize, col: usize) -> ASource;

    /// Flat index into the B-side tensor, `None` when out of bounds.
    fn b_index(&self, batch: usize, row: usize, col: usize) -> Option<usize>;

    /// Flat index into the output, `None` when out of bounds.
    fn out_index(&self, batch: usize, row: usize, col: usize) -> Option<usize> {
        let d = self.dims();
        (batch < d.batch && row < d.a_outer && col < d.b_outer)
            .then(|| (batch * d.a_outer + row) * d.b_outer + col)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatMulIndexer {
    pub dims: MatMulDims,
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub a_batched: bool,
    pub b_batched: bool,
}

fn matrix_index(
    batch: usize,
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
    transposed: bool,
    batched: bool,
) -> usize {
    let base = if batched { batch * rows * cols } else { 0 };
    if transposed {
        base + col * rows + row
    } else {
        base + row * cols + col
    }
}

impl MatMulOperands for MatMulIndexer {
    fn dims(&self) -> MatMulDims {
        self.dims
    }

    fn a_source(&self, batch: usize, row: usize, col: usize) -> ASource {
        let d = self.dims;
        if row >= d.a_outer || col >= d.inner {
            return ASource::OutOfBounds;
        }
        ASource::Read(matrix_index(
            batch,
            row,
            col,
            d.a_outer,
            d.inner,
            self.transpose_a,
            self.a_batched,
        ))
    }

    fn b_index(&self, batch: usize, row: usize, col: usize) -> Option<usize> {
        let d = self.dims;
        (row < d.inner && col < d.b_outer).then(|| {
            matrix_index(batch, row, col, d.inner, d.b_outer, self.transpose_b, self.b_batched)
        })
    }
}

/// Forward convolution: A is the implicit im2col of the input
/// (`row = out_y * out_w + out_x`, `col = (fy * f_w + fx) * in_c + c`), B is
/// the filter viewed as `[f_h * f_w * in_c, out_c]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conv2dIndexer {
    pub info: Conv2dInfo,
}

impl MatMulOperands for Conv2dIndexer {
    fn dims(&self) -> MatMulDims {
        let out = &self.info.out_shape;
        let f = &self.info.filter_shape;
        MatMulDims {
            batch: out[0],
            a_outer: out[1] * out[2],
            inner: f[0] * f[1] * f[2],
            b_outer: f[3],
        }
    }

    fn a_source(&self, batch: usize, row: usize, col: usize) -> ASource {
        let d = self.dims();
        if row >= d.a_outer || col >= d.inner {
            return ASource::OutOfBounds;
        }
        let x = &self.info.in_shape;
        let out_w = self.info.out_shape[2];
        let (f_w, in_c) = (self.info.filter_shape[1], x[3]);
        let (out_row, out_col) = ((row / out_w) as i64, (row % out_w) as i64);
        let (w_row, w_col, ch) = ((col / (f_w * in_c)) as i64, ((col / in_c) % f_w) as i64, col % in_c);
        let x_row = out_row * self.info.strides[0] as i64 - self.info.pad[0] as i64
            + self.info.dilations[0] as i64 * w_row;
        let x_col = out_col * self.info.strides[1] as i64 - self.info.pad[1] as i64
            + self.info.dilations[1] as i64 * w_col;
        if x_row < 0 || x_row >= x[1] as i64 || x_col < 0 || x_col >= x[2] as i64 {
            return ASource::OutOfBounds;
        }
        ASource::Read(((batch * x[1] + x_row as usize) * x[2] + x_col as usize) * in_c + ch)
    }

    fn b_index(&self, _batch: usize, row: usize, col: usize) -> Option<usize> {
        let d = self.dims();
        (row < d.inner && col < d.b_outer).then(|| row * d.b_outer + col)
    }
}

/// Transposed convolution: A is a virtual zero-inserted, padded view of `dy`
/// (`row = y * dx_w + x`, `col = (fy * f_w + fx) * dy_c + c`) and B reads the
/// filter flipped in both spatial axes with its channel axes swapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conv2dTransposeIndexer {
    pub info: Conv2dTransposeInfo,
}

impl Conv2dTransposeIndexer {
    /// Leading pad of the equivalent forward convolution over the
    /// zero-inserted input.
    pub fn transposed_pad(&self) -> [i64; 2] {
        let fwd = &self.info.forward;
        let f = fwd.filter_hw();
        [
            (fwd.dilations[0] * f[0].saturating_sub(1)) as i64 - fwd.pad[0] as i64,
            (fwd.dilations[1] * f[1].saturating_sub(1)) as i64 - fwd.pad[1] as i64,
        ]
    }
}

impl MatMulOperands for Conv2dTransposeIndexer {
    fn dims(&self) -> MatMulDims {
        let dx = &self.info.dx_shape;
        let f = &self.info.filter_shape;
        MatMulDims {
            batch: dx[0],
            a_outer: dx[1] * dx[2],
            inner: f[0] * f[1] * f[3],
            b_outer: f[2],
        }
    }

    fn a_source(&self, batch: usize, row: usize, col: usize) -> ASource {
        let d = self.dims();
        if row >= d.a_outer || col >= d.inner {
            return ASource::OutOfBounds;
        }
        let dy = &self.info.dy_shape;
        let fwd = &self.info.forward;
        let dx_w = self.info.dx_shape[2];
        let (f_w, dy_c) = (self.info.filter_shape[1], dy[3]);
        let pad = self.transposed_pad();
        let (out_row, out_col) = ((row / dx_w) as i64, (row % dx_w) as i64);
        let (w_row, w_col, ch) = ((col / (f_w * dy_c)) as i64, ((col / dy_c) % f_w) as i64, col % dy_c);
        let num_row = out_row - pad[0] + fwd.dilations[0] as i64 * w_row;
        let num_col = out_col - pad[1] + fwd.dilations[1] as i64 * w_col;
        let (s_row, s_col) = (fwd.strides[0] as i64, fwd.strides[1] as i64);
        if num_row < 0 || num_col < 0 {
            return ASource::OutOfBounds;
        }
        if num_row % s_row != 0 || num_col % s_col != 0 {
            return ASource::FractionalStride;
        }
        let (y_row, y_col) = (num_row / s_row, num_col / s_col);
        if y_row >= dy[1] as i64 || y_col >= dy[2] as i64 {
            return ASource::OutOfBounds;
        }
        ASource::Read(((batch * dy[1] + y_row as usize) * dy[2] + y_col as usize) * dy_c + ch)
    }

    fn b_index(&self, _batch: usize, row: usize, col: usize) -> Option<usize> {
        let d = self.dims();
        if row >= d.inner || col >= d.b_outer {
            return None;
        }
        let f = &self.info.filter_shape;
        let (f_h, f_w, dx_c, dy_c) = (f[0], f[1], f[2], f[3]);
        let f_row = f_h - 1 - row / (f_w * dy_c);
        let f_col = f_w - 1 - (row / dy_c) % f_w;
        let ch = row % dy_c;
        Some(((f_row * f_w + f_col) * dx_c + col) * dy_c + ch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{conv2d_transpose_info, Conv2dParams, Conv2dTransposeParams, Padding, TensorShape};

    fn transpose_indexer(stride: usize, padding: Padding) -> Conv2dTransposeIndexer {
        let params = Conv2dTransposeParams {
            conv: Conv2dParams {
                strides: [stride, stride],
                padding,
                ..Conv2dParams::default()
            },
            output_shape: None,
        };
        let info = conv2d_transpose_info(
            &TensorShape::from([1, 3, 3, 2]),
            &TensorShape::from([3, 3, 4, 2]),
            &params,
        )
        .expect("transpose info");
        Conv2dTransposeIndexer { info }
    }

    #[test]
    fn filter_is_flipped() {
        let idx = transpose_indexer(1, Padding::Valid);
        // Reduction row 0 is filter tap (0, 0) of the flipped filter, i.e. (2, 2).
        assert_eq!(idx.b_index(0, 0, 1), Some(((2 * 3 + 2) * 4 + 1) * 2));
        assert_eq!(idx.b_index(0, idx.dims().inner, 0), None);
    }

    #[test]
    fn stride_two_rejects_odd_positions() {
        let idx = transpose_indexer(2, Padding::Valid);
        assert_eq!(idx.transposed_pad(), [2, 2]);
        // dx row 1, col 0 with tap (0, 0): 1 - 2 < 0 is out of bounds.
        assert_eq!(idx.a_source(0, idx.info.dx_shape[2], 0), ASource::OutOfBounds);
        // dx (3, 2), tap (0, 0): rows 1, cols 0 -> row is fractional.
        let row = 3 * idx.info.dx_shape[2] + 2;
        assert_eq!(idx.a_source(0, row, 0), ASource::FractionalStride);
        // dx (2, 2), tap (0, 0): maps onto dy (0, 0).
        let row = 2 * idx.info.dx_shape[2] + 2;
        assert_eq!(idx.a_source(0, row, 1), ASource::Read(1));
    }
}
