use crate::bindings::{BindingSchema, InputBinding};
use crate::config::PlannerConfig;
use crate::error::Result;
use crate::heuristics::{elementwise_distribution, OpClass, WorkDistribution};
use crate::layout::flatten_to_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{KernelProgram, ProgramInfo};
use crate::shaders::preamble::{coord_at, coord_ctor, main_header};
use crate::shape::{permute_output_shape, DType, TensorShape};

/// Axis permutation: output dimension `i` is input dimension `perm[i]`.
///
/// Dispatched over a multi-axis layout so each invocation decodes its output
/// coordinate from `globalId` directly.
#[derive(Debug)]
pub struct PermuteProgram {
    info: ProgramInfo,
    perm: Vec<usize>,
}

impl PermuteProgram {
    pub fn new(x: &TensorShape, perm: &[usize], dtype: DType, config: &PlannerConfig) -> Result<Self> {
        const OP: &str = "permute";
        let out = permute_output_shape(x, perm)?;
        let layout = flatten_to_dispatch_layout(&out);
        let distribution = WorkDistribution {
            elements_per_thread: [1, 1, 1],
            ..elementwise_distribution(&layout, config)
        };
        let key = KeyBuilder::new(OP).list("perm", perm);
        let bindings = BindingSchema::new(vec![InputBinding::new("x", x.clone(), dtype)], out, dtype);
        let info = ProgramInfo::new(OP, OpClass::Elementwise, bindings, layout, distribution, None, key, config)?;
        Ok(Self {
            info,
            perm: perm.to_vec(),
        })
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    fn input_coords(&self) -> String {
        let rank = self.perm.len();
        if rank == 0 {
            return "coords".to_string();
        }
        let mut parts = vec![String::new(); rank];
        for (i, &p) in self.perm.iter().enumerate() {
            parts[p] = coord_at(rank, "coords", i);
        }
        coord_ctor(rank, &parts)
    }
}

impl KernelProgram for PermuteProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        format!(
            "{} {{\n    let coords = getOutputCoords();\n    if (coordsInBounds(coords)) {{\n        \
             result[getOutputIndex(coords)] = x[getXIndex({})];\n    }}\n}}\n",
            main_header(),
            self.input_coords()
        )
    }
}
