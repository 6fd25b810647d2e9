use serde::{Deserialize, Serialize};

use crate::config::DeviceLimits;
use crate::error::{KernelError, Result};
use crate::layout::DispatchLayout;
use crate::shape::TensorShape;

/// Geometry a program is dispatched with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchGeometry {
    pub layout: DispatchLayout,
    pub workgroup_size: [u32; 3],
    pub elements_per_thread: [u32; 3],
    pub dispatch: [u32; 3],
}

impl DispatchGeometry {
    pub fn invocations_per_workgroup(&self) -> u32 {
        self.workgroup_size.iter().product()
    }

    /// Logical output elements covered along each axis.
    pub fn coverage(&self) -> [u64; 3] {
        std::array::from_fn(|i| {
            self.dispatch[i] as u64
                * self.workgroup_size[i] as u64
                * self.elements_per_thread[i] as u64
        })
    }
}

/// Workgroups needed for `elements` when each covers `per_group`; never 0.
pub fn dispatch_size(elements: u64, per_group: u64) -> u64 {
    elements.div_ceil(per_group.max(1)).max(1)
}

/// Workgroup counts along x/y/z for `shape` under `layout`.
///
/// Flat layouts whose x count exceeds the per-dimension limit are folded into a
/// roughly square x/y grid; `getGlobalIndex` in the generated preamble
/// linearises the workgroup id so the folded grid still enumerates every index.
pub fn compute_dispatch(
    layout: &DispatchLayout,
    shape: &TensorShape,
    workgroup_size: [u32; 3],
    elements_per_thread: [u32; 3],
    limits: &DeviceLimits,
) -> Result<[u32; 3]> {
    let extents = layout.axis_extents(shape);
    let mut counts = [1u64; 3];
    for axis in 0..3 {
        let per_group = workgroup_size[axis].max(1) as u64 * elements_per_thread[axis].max(1) as u64;
        counts[axis] = dispatch_size(extents[axis] as u64, per_group);
    }
    let limit = limits.max_workgroups_per_dimension.max(1) as u64;
    if counts.iter().all(|&c| c <= limit) {
        return Ok(counts.map(|c| c as u32));
    }
    if layout.is_flat() {
        return fold_flat(counts[0], limit);
    }
    let axis = counts.iter().position(|&c| c > limit).unwrap_or(0);
    Err(KernelError::unsupported(
        "dispatch",
        "dispatch_count",
        format!("{} workgroups on axis {} exceeds {limit}", counts[axis], ["x", "y", "z"][axis]),
    ))
}

fn fold_flat(total: u64, limit: u64) -> Result<[u32; 3]> {
    let mut x = ceil_sqrt(total).min(limit);
    let mut y = total.div_ceil(x);
    let mut z = 1;
    if y > limit {
        x = limit;
        let rows = total.div_ceil(x);
        y = limit;
        z = rows.div_ceil(y);
    }
    if z > limit {
        return Err(KernelError::unsupported(
            "dispatch",
            "dispatch_count",
            format!("{total} workgroups cannot be folded under {limit} per axis"),
        ));
    }
    log::debug!("folded {total} flat workgroups into ({x}, {y}, {z})");
    Ok([x as u32, y as u32, z as u32])
}

fn ceil_sqrt(n: u64) -> u64 {
    let mut r = (n as f64).sqrt() as u64;
    while r * r < n {
        r += 1;
    }
    while r > 1 && (r - 1) * (r - 1) >= n {
        r -= 1;
    }
    r.max(1)
}
