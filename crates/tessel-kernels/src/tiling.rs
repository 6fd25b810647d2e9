use serde::{Deserialize, Serialize};

use crate::config::DeviceLimits;
use crate::error::{KernelError, Result};

/// Bytes of one staged element (f32 / i32).
const STAGED_ELEMENT_BYTES: u32 = 4;

/// Shared-memory tiling of a matmul-shaped kernel.
///
/// `tile_a_outer` rows of A and `tile_b_outer` columns of B are produced per
/// workgroup, walking the reduction dimension `tile_inner` elements at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingPlan {
    pub workgroup_size: [u32; 3],
    pub elements_per_thread: [u32; 3],
    pub tile_a_outer: u32,
    pub tile_b_outer: u32,
    pub tile_inner: u32,
    pub vector_width: u32,
}

impl TilingPlan {
    /// Scalar plan: the reduction tile starts at the larger outer tile, rounded
    /// to a multiple of both workgroup extents, and shrinks until the staged
    /// tiles fit in workgroup storage.
    pub fn scalar(
        workgroup_size: [u32; 3],
        elements_per_thread: [u32; 3],
        limits: &DeviceLimits,
    ) -> Result<Self> {
        check_positive(workgroup_size, elements_per_thread)?;
        let tile_a_outer = workgroup_size[1] * elements_per_thread[1];
        let tile_b_outer = workgroup_size[0] * elements_per_thread[0];
        let step = lcm(workgroup_size[0], workgroup_size[1]);
        let mut tile_inner = tile_a_outer.max(tile_b_outer).div_ceil(step) * step;
        while tile_inner > step
            && staged_bytes(tile_a_outer, tile_b_outer, tile_inner) > limits.max_workgroup_storage_bytes
        {
            tile_inner -= step;
        }
        Self::explicit(workgroup_size, elements_per_thread, tile_inner, 1, limits)
    }

    /// Four-wide plan: each thread stages one vec4 of A per row and the
    /// reduction tile spans four columns per x-invocation.
    pub fn vec4(
        workgroup_size: [u32; 3],
        elements_per_thread: [u32; 3],
        limits: &DeviceLimits,
    ) -> Result<Self> {
        check_positive(workgroup_size, elements_per_thread)?;
        Self::explicit(workgroup_size, elements_per_thread, workgroup_size[0] * 4, 4, limits)
    }

    /// Validate a fully specified plan.
    pub fn explicit(
        workgroup_size: [u32; 3],
        elements_per_thread: [u32; 3],
        tile_inner: u32,
        vector_width: u32,
        limits: &DeviceLimits,
    ) -> Result<Self> {
        const OP: &str = "tiling";
        check_positive(workgroup_size, elements_per_thread)?;
        let invocations: u32 = workgroup_size.iter().product();
        if invocations > limits.max_invocations_per_workgroup {
            return Err(KernelError::unsupported(
                OP,
                "workgroup_size",
                format!(
                    "{workgroup_size:?} ({invocations} invocations, ceiling {})",
                    limits.max_invocations_per_workgroup
                ),
            ));
        }
        if workgroup_size[2] != 1 || elements_per_thread[2] != 1 {
            return Err(KernelError::unsupported(
                OP,
                "workgroup_size",
                format!("{workgroup_size:?} x {elements_per_thread:?}: tiled kernels use z = 1"),
            ));
        }
        let plan = TilingPlan {
            workgroup_size,
            elements_per_thread,
            tile_a_outer: workgroup_size[1] * elements_per_thread[1],
            tile_b_outer: workgroup_size[0] * elements_per_thread[0],
            tile_inner,
            vector_width,
        };
        match vector_width {
            1 => {
                if tile_inner == 0
                    || tile_inner % workgroup_size[0] != 0
                    || tile_inner % workgroup_size[1] != 0
                {
                    return Err(KernelError::unsupported(
                        OP,
                        "tile_inner",
                        format!("{tile_inner} is not a multiple of workgroup {workgroup_size:?}"),
                    ));
                }
            }
            4 => {
                if elements_per_thread[0] != 4 {
                    return Err(KernelError::unsupported(
                        OP,
                        "elements_per_thread",
                        format!("{elements_per_thread:?}: the vec4 path computes 4 columns per thread"),
                    ));
                }
                if tile_inner != workgroup_size[0] * 4 || tile_inner % workgroup_size[1] != 0 {
                    return Err(KernelError::unsupported(
                        OP,
                        "tile_inner",
                        format!("{tile_inner} with workgroup {workgroup_size:?} on the vec4 path"),
                    ));
                }
            }
            other => return Err(KernelError::unsupported(OP, "inner_element_size", other)),
        }
        let bytes = plan.shared_memory_bytes();
        if bytes > limits.max_workgroup_storage_bytes {
            return Err(KernelError::unsupported(
                OP,
                "workgroup_storage",
                format!("{bytes} bytes exceeds {}", limits.max_workgroup_storage_bytes),
            ));
        }
        Ok(plan)
    }

    pub fn is_vec4(&self) -> bool {
        self.vector_width == 4
    }

    pub fn shared_memory_bytes(&self) -> u32 {
        staged_bytes(self.tile_a_outer, self.tile_b_outer, self.tile_inner)
    }

    /// Rows of A each thread stages per tile.
    pub fn rows_per_thread_a(&self) -> u32 {
        self.tile_a_outer / self.workgroup_size[1]
    }

    /// Reduction-dimension columns of A each thread stages per tile (scalar path).
    pub fn cols_per_thread_a(&self) -> u32 {
        self.tile_inner / self.workgroup_size[0]
    }

    /// Reduction-dimension rows of B each thread stages per tile.
    pub fn rows_per_thread_b(&self) -> u32 {
        self.tile_inner / self.workgroup_size[1]
    }

    pub fn tag(&self) -> String {
        format!(
            "wg{}x{}_ept{}x{}_ti{}_v{}",
            self.workgroup_size[0],
            self.workgroup_size[1],
            self.elements_per_thread[0],
            self.elements_per_thread[1],
            self.tile_inner,
            self.vector_width
        )
    }
}

fn staged_bytes(tile_a_outer: u32, tile_b_outer: u32, tile_inner: u32) -> u32 {
    (tile_a_outer * tile_inner + tile_inner * tile_b_outer) * STAGED_ELEMENT_BYTES
}

fn check_positive(workgroup_size: [u32; 3], elements_per_thread: [u32; 3]) -> Result<()> {
    if workgroup_size.contains(&0) || elements_per_thread.contains(&0) {
        return Err(KernelError::unsupported(
            "tiling",
            "workgroup_size",
            format!("{workgroup_size:?} x {elements_per_thread:?} has a zero extent"),
        ));
    }
    Ok(())
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_plan_shrinks_inner_tile_to_fit_storage() {
        let plan = TilingPlan::scalar([16, 16, 1], [4, 4, 1], &DeviceLimits::default()).expect("plan");
        assert_eq!((plan.tile_a_outer, plan.tile_b_outer), (64, 64));
        assert_eq!(plan.tile_inner, 32);
        assert_eq!(plan.shared_memory_bytes(), 16_384);
    }

    #[test]
    fn scalar_plan_for_uneven_workgroup_uses_common_multiple() {
        let plan = TilingPlan::scalar([4, 16, 1], [1, 2, 1], &DeviceLimits::default()).expect("plan");
        assert_eq!(plan.tile_a_outer, 32);
        assert_eq!(plan.tile_b_outer, 4);
        assert_eq!(plan.tile_inner % 16, 0);
        assert_eq!(plan.tile_inner % 4, 0);
    }

    #[test]
    fn vec4_plan_rules() {
        let plan = TilingPlan::vec4([8, 8, 1], [4, 4, 1], &DeviceLimits::default()).expect("plan");
        assert_eq!(plan.tile_inner, 32);
        assert_eq!(plan.rows_per_thread_b(), 4);
        let err = TilingPlan::vec4([8, 8, 1], [2, 4, 1], &DeviceLimits::default()).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn unknown_vector_width_names_inner_element_size() {
        let err = TilingPlan::explicit([8, 8, 1], [4, 4, 1], 32, 2, &DeviceLimits::default())
            .unwrap_err();
        match err {
            KernelError::UnsupportedConfiguration { parameter, value, .. } => {
                assert_eq!(parameter, "inner_element_size");
                assert_eq!(value, "2");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_workgroup_is_rejected() {
        let err = TilingPlan::scalar([32, 16, 1], [1, 1, 1], &DeviceLimits::default()).unwrap_err();
        assert!(err.is_unsupported());
    }
}
