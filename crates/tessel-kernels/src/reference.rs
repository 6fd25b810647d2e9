//! Host emulation of the tiled matmul programs.
//!
//! [`emulate_tiled_matmul`] replays the generated tiled loop workgroup by
//! workgroup and thread by thread: every tile is staged into emulated shared
//! memory by the threads that own it in the shader, then consumed in the same
//! reduction order. Staging cells nobody wrote stay NaN, so a tiling or
//! addressing mistake shows up in the output rather than being masked by a
//! direct dot product.

use crate::addressing::{ASource, MatMulOperands};
use crate::heuristics::MatMulDims;
use crate::tiling::TilingPlan;

/// Output of an emulated dispatch, padded to whole tiles.
#[derive(Clone, Debug, PartialEq)]
pub struct TiledOutput {
    pub dims: MatMulDims,
    pub padded_rows: usize,
    pub padded_cols: usize,
    values: Vec<f32>,
}

impl TiledOutput {
    pub fn get(&self, batch: usize, row: usize, col: usize) -> f32 {
        self.values[(batch * self.padded_rows + row) * self.padded_cols + col]
    }

    /// Scatter the in-bounds part of the grid to the output tensor layout of
    /// `operands`, the way `mm_write` does.
    pub fn crop(&self, operands: &dyn MatMulOperands) -> Vec<f32> {
        let d = self.dims;
        let mut out = vec![0.0; d.batch * d.a_outer * d.b_outer];
        for batch in 0..d.batch {
            for row in 0..self.padded_rows {
                for col in 0..self.padded_cols {
                    if let Some(index) = operands.out_index(batch, row, col) {
                        out[index] = self.get(batch, row, col);
                    }
                }
            }
        }
        out
    }
}

struct Staging {
    a: Vec<f32>,
    b: Vec<f32>,
    tile_inner: usize,
    tile_b: usize,
}

impl Staging {
    fn new(tile_a: usize, tile_b: usize, tile_inner: usize) -> Self {
        Self {
            a: vec![f32::NAN; tile_a * tile_inner],
            b: vec![f32::NAN; tile_inner * tile_b],
            tile_inner,
            tile_b,
        }
    }

    fn reset(&mut self) {
        self.a.fill(f32::NAN);
        self.b.fill(f32::NAN);
    }

    fn set_a(&mut self, row: usize, k: usize, value: f32) {
        self.a[row * self.tile_inner + k] = value;
    }

    fn set_b(&mut self, k: usize, col: usize, value: f32) {
        self.b[k * self.tile_b + col] = value;
    }

    fn a(&self, row: usize, k: usize) -> f32 {
        self.a[row * self.tile_inner + k]
    }

    fn b(&self, k: usize, col: usize) -> f32 {
        self.b[k * self.tile_b + col]
    }
}

fn read_a(operands: &dyn MatMulOperands, a: &[f32], batch: usize, row: usize, col: usize) -> f32 {
    match operands.a_source(batch, row, col) {
        ASource::Read(index) => a[index],
        ASource::OutOfBounds | ASource::FractionalStride => 0.0,
    }
}

fn read_b(operands: &dyn MatMulOperands, b: &[f32], batch: usize, row: usize, col: usize) -> f32 {
    operands.b_index(batch, row, col).map_or(0.0, |index| b[index])
}

/// Run `plan` over `operands` with host buffers `a` and `b`.
pub fn emulate_tiled_matmul(
    plan: &TilingPlan,
    operands: &dyn MatMulOperands,
    a: &[f32],
    b: &[f32],
) -> TiledOutput {
    let dims = operands.dims();
    let [wg_x, wg_y, _] = plan.workgroup_size.map(|v| v as usize);
    let [cols, rows, _] = plan.elements_per_thread.map(|v| v as usize);
    let (tile_a, tile_b, tile_inner) = (
        plan.tile_a_outer as usize,
        plan.tile_b_outer as usize,
        plan.tile_inner as usize,
    );
    let groups_x = dims.b_outer.div_ceil(tile_b).max(1);
    let groups_y = dims.a_outer.div_ceil(tile_a).max(1);
    let num_tiles = dims.inner.max(1).div_ceil(tile_inner);
    let (padded_rows, padded_cols) = (groups_y * tile_a, groups_x * tile_b);
    let mut values = vec![0.0; dims.batch * padded_rows * padded_cols];
    let mut staging = Staging::new(tile_a, tile_b, tile_inner);
    let threads = wg_x * wg_y;

    for batch in 0..dims.batch {
        for group_y in 0..groups_y {
            for group_x in 0..groups_x {
                let mut acc = vec![0.0f32; threads * rows * cols];
                for t in 0..num_tiles {
                    staging.reset();
                    let k_start = t * tile_inner;
                    for ly in 0..wg_y {
                        for lx in 0..wg_x {
                            let global_row = group_y * tile_a + ly * rows;
                            if plan.is_vec4() {
                                let global_col = (group_x * wg_x + lx) * 4;
                                for inner_row in 0..rows {
                                    for lane in 0..4 {
                                        let k = lx * 4 + lane;
                                        let v = read_a(operands, a, batch, global_row + inner_row, k_start + k);
                                        staging.set_a(ly * rows + inner_row, k, v);
                                    }
                                }
                                let rows_b = plan.rows_per_thread_b() as usize;
                                for inner_row in 0..rows_b {
                                    let k = ly * rows_b + inner_row;
                                    for lane in 0..4 {
                                        let v = read_b(operands, b, batch, k_start + k, global_col + lane);
                                        staging.set_b(k, lx * 4 + lane, v);
                                    }
                                }
                            } else {
                                let global_col = group_x * tile_b + lx * cols;
                                let (rows_a, cols_a) =
                                    (plan.rows_per_thread_a() as usize, plan.cols_per_thread_a() as usize);
                                for inner_row in 0..rows_a {
                                    for inner_col in 0..cols_a {
                                        let k = lx * cols_a + inner_col;
                                        let v = read_a(operands, a, batch, global_row + inner_row, k_start + k);
                                        staging.set_a(ly * rows_a + inner_row, k, v);
                                    }
                                }
                                let rows_b = plan.rows_per_thread_b() as usize;
                                for inner_row in 0..rows_b {
                                    let k = ly * rows_b + inner_row;
                                    for inner_col in 0..cols {
                                        let v = read_b(operands, b, batch, k_start + k, global_col + inner_col);
                                        staging.set_b(k, lx * cols + inner_col, v);
                                    }
                                }
                            }
                        }
                    }
                    // workgroupBarrier()
                    for ly in 0..wg_y {
                        for lx in 0..wg_x {
                            let thread = ly * wg_x + lx;
                            let acc = &mut acc[thread * rows * cols..(thread + 1) * rows * cols];
                            for k in 0..tile_inner {
                                for inner_row in 0..rows {
                                    let a_cached = staging.a(ly * rows + inner_row, k);
                                    for inner_col in 0..cols {
                                        let slot = inner_row * cols + inner_col;
                                        acc[slot] += a_cached * staging.b(k, lx * cols + inner_col);
                                    }
                                }
                            }
                        }
                    }
                }
                for ly in 0..wg_y {
                    for lx in 0..wg_x {
                        let thread = ly * wg_x + lx;
                        for inner_row in 0..rows {
                            for inner_col in 0..cols {
                                let row = group_y * tile_a + ly * rows + inner_row;
                                let col = group_x * tile_b + lx * cols + inner_col;
                                values[(batch * padded_rows + row) * padded_cols + col] =
                                    acc[(thread * rows + inner_row) * cols + inner_col];
                            }
                        }
                    }
                }
            }
        }
    }

    TiledOutput {
        dims,
        padded_rows,
        padded_cols,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::MatMulIndexer;
    use crate::config::DeviceLimits;

    fn naive(dims: &MatMulDims, a: &[f32], b: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; dims.a_outer * dims.b_outer];
        for row in 0..dims.a_outer {
            for col in 0..dims.b_outer {
                let mut acc = 0.0f32;
                for k in 0..dims.inner {
                    acc += a[row * dims.inner + k] * b[k * dims.b_outer + col];
                }
                out[row * dims.b_outer + col] = acc;
            }
        }
        out
    }

    fn indexer(m: usize, k: usize, n: usize) -> MatMulIndexer {
        MatMulIndexer {
            dims: MatMulDims {
                batch: 1,
                a_outer: m,
                inner: k,
                b_outer: n,
            },
            transpose_a: false,
            transpose_b: false,
            a_batched: false,
            b_batched: false,
        }
    }

    fn ramp(len: usize, modulus: usize) -> Vec<f32> {
        (0..len).map(|i| (i % modulus) as f32 - 3.0).collect()
    }

    #[test]
    fn scalar_plan_with_ragged_edges_matches_naive() {
        let idx = indexer(13, 21, 9);
        let plan = TilingPlan::scalar([4, 8, 1], [2, 2, 1], &DeviceLimits::default()).expect("plan");
        let (a, b) = (ramp(13 * 21, 7), ramp(21 * 9, 5));
        let out = emulate_tiled_matmul(&plan, &idx, &a, &b);
        assert_eq!(out.crop(&idx), naive(&idx.dims, &a, &b));
    }

    #[test]
    fn vec4_plan_matches_naive() {
        let idx = indexer(10, 16, 12);
        let plan = TilingPlan::vec4([8, 8, 1], [4, 4, 1], &DeviceLimits::default()).expect("plan");
        let (a, b) = (ramp(10 * 16, 6), ramp(16 * 12, 4));
        let out = emulate_tiled_matmul(&plan, &idx, &a, &b);
        assert_eq!(out.crop(&idx), naive(&idx.dims, &a, &b));
        assert_eq!(out.padded_cols, 32);
    }
}
