use std::fmt::Write as _;

use crate::bindings::{BindingSchema, InputBinding};
use crate::config::PlannerConfig;
use crate::error::{KernelError, Result};
use crate::heuristics::{elementwise_distribution, OpClass};
use crate::layout::flat_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{KernelProgram, ProgramInfo};
use crate::shaders::preamble::{coord_at, coord_ctor, index_fn_name, main_header};
use crate::shape::{concat_output_shape, DType, TensorShape};

/// N-ary concatenation along one axis.
///
/// Inputs with zero extent along the axis contribute nothing and are not
/// bound; the remaining inputs keep their original position in their binding
/// name (`T0`, `T1`, ...).
#[derive(Debug)]
pub struct ConcatProgram {
    info: ProgramInfo,
    axis: usize,
    /// Original input index of each bound input.
    sources: Vec<usize>,
    /// Exclusive end of each bound input along the axis.
    boundaries: Vec<usize>,
}

impl ConcatProgram {
    pub fn new(inputs: &[TensorShape], axis: usize, dtype: DType, config: &PlannerConfig) -> Result<Self> {
        const OP: &str = "concat";
        let out = concat_output_shape(inputs, axis)?;
        let mut sources = Vec::new();
        let mut boundaries = Vec::new();
        let mut bound = Vec::new();
        let mut end = 0;
        for (i, shape) in inputs.iter().enumerate() {
            if shape[axis] == 0 {
                continue;
            }
            end += shape[axis];
            sources.push(i);
            boundaries.push(end);
            bound.push(InputBinding::new(format!("T{i}"), shape.clone(), dtype));
        }
        if bound.is_empty() {
            return Err(KernelError::shape(OP, format!("every input is empty along axis {axis}")));
        }
        let layout = flat_dispatch_layout(&out);
        let distribution = elementwise_distribution(&layout, config);
        let key = KeyBuilder::new(OP).push("axis", axis).list("sources", &sources);
        let info = ProgramInfo::new(
            OP,
            OpClass::Elementwise,
            BindingSchema::new(bound, out, dtype),
            layout,
            distribution,
            None,
            key,
            config,
        )?;
        Ok(Self {
            info,
            axis,
            sources,
            boundaries,
        })
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    /// The input (original index) and input coordinate an output coordinate
    /// reads from; mirrors the generated branch ladder.
    pub fn route(&self, coords: &[usize]) -> (usize, Vec<usize>) {
        let c = coords[self.axis];
        let last = self.sources.len() - 1;
        let slot = self
            .boundaries
            .iter()
            .take(last)
            .position(|&b| c < b)
            .unwrap_or(last);
        let start = if slot == 0 { 0 } else { self.boundaries[slot - 1] };
        let mut local = coords.to_vec();
        local[self.axis] = c - start;
        (self.sources[slot], local)
    }

    fn shifted_coords(&self, start: usize) -> String {
        let rank = self.info.output_shape.rank();
        if start == 0 {
            return "coords".to_string();
        }
        if rank <= 1 {
            return format!("coords - {start}");
        }
        let parts: Vec<String> = (0..rank)
            .map(|d| {
                let c = coord_at(rank, "coords", d);
                if d == self.axis {
                    format!("{c} - {start}")
                } else {
                    c
                }
            })
            .collect();
        coord_ctor(rank, &parts)
    }

    fn read_expr(&self, slot: usize) -> String {
        let name = &self.info.bindings.inputs[slot].name;
        let start = if slot == 0 { 0 } else { self.boundaries[slot - 1] };
        format!("{name}[{}({})]", index_fn_name(name), self.shifted_coords(start))
    }
}

impl KernelProgram for ConcatProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let per_thread = self.info.geometry.elements_per_thread[0];
        let rank = self.info.output_shape.rank();
        let mut src = format!(
            "{} {{\n    for (var i: i32 = 0; i < {per_thread}; i = i + 1) {{\n        \
             let flatIndex = getGlobalIndex() * {per_thread} + i;\n        \
             if (flatIndex < outSize) {{\n",
            main_header()
        );
        if self.sources.len() == 1 {
            let name = &self.info.bindings.inputs[0].name;
            let _ = writeln!(src, "            result[flatIndex] = {name}[flatIndex];");
        } else {
            let _ = writeln!(src, "            let coords = getCoordsFromIndex(flatIndex);");
            let _ = writeln!(src, "            let c = {};", coord_at(rank, "coords", self.axis));
            let last = self.sources.len() - 1;
            for slot in 0..=last {
                let head = match slot {
                    0 => format!("if (c < {}) {{", self.boundaries[0]),
                    s if s == last => "} else {".to_string(),
                    s => format!("}} else if (c < {}) {{", self.boundaries[s]),
                };
                let _ = writeln!(src, "            {head}");
                let _ = writeln!(src, "                result[flatIndex] = {};", self.read_expr(slot));
            }
            src.push_str("            }\n");
        }
        src.push_str("        }\n    }\n}\n");
        src
    }
}
