//! Workgroup and per-thread work selection.
//!
//! Every choice here is a deterministic function of the output shape, the
//! operation class and the [`PlannerConfig`]. The thresholds are named
//! constants so they can be recalibrated for a device.

use serde::{Deserialize, Serialize};

use crate::config::{PlannerConfig, REDUCTION_MIN_WORKGROUP};
use crate::error::Result;
use crate::layout::DispatchLayout;
use crate::tiling::TilingPlan;

pub const MATMUL_WORKGROUP: [u32; 3] = [8, 8, 1];
pub const MATMUL_WORK_PER_THREAD: [u32; 3] = [4, 4, 1];
/// At or below this many output rows, each thread computes a single row.
pub const SMALL_OUTER_ROWS: usize = 8;
/// At or below this reduction length and column count, the x extent halves.
pub const SMALL_INNER_EXTENT: usize = 16;
pub const CONV_SMALL_CHANNELS: usize = 4;
pub const CONV_SMALL_SPATIAL: usize = 4;
pub const VEC4_WIDTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    Elementwise,
    Reduction,
    TiledMatMul,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkDistribution {
    pub workgroup_size: [u32; 3],
    pub elements_per_thread: [u32; 3],
}

/// Logical matmul extents: `batch` independent `[a_outer, inner] x [inner, b_outer]` products.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatMulDims {
    pub batch: usize,
    pub a_outer: usize,
    pub inner: usize,
    pub b_outer: usize,
}

pub fn elementwise_distribution(layout: &DispatchLayout, config: &PlannerConfig) -> WorkDistribution {
    let per_thread = if layout.is_flat() {
        config.elementwise_work_per_thread.max(1)
    } else {
        1
    };
    WorkDistribution {
        workgroup_size: [config.sanitize_linear_workgroup(config.elementwise_workgroup), 1, 1],
        elements_per_thread: [per_thread, 1, 1],
    }
}

/// One workgroup per reduced output; the workgroup spans the reduced length
/// rounded up to a power of two.
pub fn reduction_distribution(reduced_len: usize, config: &PlannerConfig) -> WorkDistribution {
    let ceiling = config.sanitize_linear_workgroup(config.reduction_max_workgroup);
    let floor = REDUCTION_MIN_WORKGROUP.min(ceiling);
    let wanted = u32::try_from(reduced_len.max(1).next_power_of_two()).unwrap_or(u32::MAX);
    WorkDistribution {
        workgroup_size: [wanted.clamp(floor, ceiling), 1, 1],
        elements_per_thread: [1, 1, 1],
    }
}

/// Scalar tiled-matmul geometry.
pub fn matmul_distribution(dims: &MatMulDims) -> WorkDistribution {
    let mut workgroup_size = MATMUL_WORKGROUP;
    let mut elements_per_thread = MATMUL_WORK_PER_THREAD;
    if dims.a_outer <= SMALL_OUTER_ROWS {
        elements_per_thread[1] = 1;
    }
    if dims.inner <= SMALL_INNER_EXTENT && dims.b_outer <= SMALL_INNER_EXTENT {
        workgroup_size[0] = 4;
    }
    WorkDistribution {
        workgroup_size,
        elements_per_thread,
    }
}

/// Scalar convolution-as-matmul geometry from output channels and output
/// spatial size (rows times columns).
pub fn conv_distribution(out_channels: usize, out_spatial: usize) -> WorkDistribution {
    let (workgroup_size, elements_per_thread) = if out_channels <= CONV_SMALL_CHANNELS {
        ([4, 16, 1], [1, 2, 1])
    } else if out_spatial <= CONV_SMALL_SPATIAL {
        ([16, 4, 1], [2, 1, 1])
    } else {
        ([16, 16, 1], [2, 2, 1])
    };
    WorkDistribution {
        workgroup_size,
        elements_per_thread,
    }
}

/// Geometry of the four-wide path; `a_outer` is the row count of the output.
pub fn vec4_distribution(a_outer: usize) -> WorkDistribution {
    let rows = if a_outer <= SMALL_OUTER_ROWS { 1 } else { 4 };
    WorkDistribution {
        workgroup_size: MATMUL_WORKGROUP,
        elements_per_thread: [4, rows, 1],
    }
}

/// The four-wide matmul path requires the reduction and column extents to be
/// multiples of four and untransposed operands.
pub fn matmul_uses_vec4(dims: &MatMulDims, transposed: bool, config: &PlannerConfig) -> bool {
    !config.disable_vec4
        && !transposed
        && dims.inner % VEC4_WIDTH == 0
        && dims.b_outer % VEC4_WIDTH == 0
}

/// Convolutions vectorize over channels: both channel counts must be multiples of four.
pub fn conv_uses_vec4(in_channels: usize, out_channels: usize, config: &PlannerConfig) -> bool {
    !config.disable_vec4 && in_channels % VEC4_WIDTH == 0 && out_channels % VEC4_WIDTH == 0
}

/// Shrink a 2-D workgroup until it fits under the invocation ceiling, halving
/// the larger extent first.
pub fn fit_workgroup(mut dist: WorkDistribution, config: &PlannerConfig) -> WorkDistribution {
    let ceiling = config.limits.max_invocations_per_workgroup.max(1);
    let [mut x, mut y, z] = dist.workgroup_size;
    while x * y * z > ceiling && (x > 1 || y > 1) {
        if x >= y {
            x = (x / 2).max(1);
        } else {
            y = (y / 2).max(1);
        }
    }
    x = x.min(config.limits.max_workgroup_size[0].max(1));
    y = y.min(config.limits.max_workgroup_size[1].max(1));
    dist.workgroup_size = [x, y, z];
    dist
}

/// Tiling plan for a matmul-shaped kernel.
pub fn plan_tiling(
    dims: &MatMulDims,
    vec4: bool,
    scalar: WorkDistribution,
    config: &PlannerConfig,
) -> Result<TilingPlan> {
    if vec4 {
        let dist = fit_workgroup(vec4_distribution(dims.a_outer), config);
        TilingPlan::vec4(dist.workgroup_size, dist.elements_per_thread, &config.limits)
    } else {
        let dist = fit_workgroup(scalar, config);
        TilingPlan::scalar(dist.workgroup_size, dist.elements_per_thread, &config.limits)
    }
}
