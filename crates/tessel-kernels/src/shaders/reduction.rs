//! Trailing-axis reductions, one workgroup per output element.

use std::fmt::Write as _;

use crate::bindings::{BindingSchema, InputBinding};
use crate::config::PlannerConfig;
use crate::error::{KernelError, Result};
use crate::heuristics::{reduction_distribution, OpClass};
use crate::layout::flat_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{require_float, KernelProgram, ProgramInfo};
use crate::shaders::preamble::main_header;
use crate::shape::{reduce_output_shape, DType, ReduceOp, TensorShape};

const F32_LOWEST: &str = "-3.4028234663852886e38";
const F32_HIGHEST: &str = "3.4028234663852886e38";
const I32_LOWEST: &str = "(-2147483647 - 1)";
const I32_HIGHEST: &str = "2147483647";

/// Reduction of the trailing `axes` of `x`.
///
/// Each workgroup strides over one contiguous run of `reduceSize` inputs,
/// then folds its partials in shared memory with a halving tree.
#[derive(Debug)]
pub struct ReduceProgram {
    info: ProgramInfo,
    op: ReduceOp,
    axes: Vec<usize>,
    reduced_len: usize,
}

impl ReduceProgram {
    pub fn new(
        x: &TensorShape,
        op: ReduceOp,
        axes: &[usize],
        keep_dims: bool,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "reduce";
        if op == ReduceOp::Mean {
            require_float(OP, dtype)?;
        }
        let out = reduce_output_shape(x, axes, keep_dims)?;
        let first_reduced = x.rank() - axes.len();
        if axes.iter().any(|&axis| axis < first_reduced) {
            return Err(KernelError::unsupported(
                OP,
                "axes",
                format_args!("{axes:?} are not the trailing axes of {x}"),
            ));
        }
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        let reduced_len = x.product_of(&axes);

        let layout = flat_dispatch_layout(&out);
        let distribution = reduction_distribution(reduced_len, config);
        let key = KeyBuilder::new(OP)
            .push("op", format_args!("{op:?}"))
            .list("axes", &axes);
        let bindings = BindingSchema::new(vec![InputBinding::new("x", x.clone(), dtype)], out, dtype);
        let info = ProgramInfo::new(OP, OpClass::Reduction, bindings, layout, distribution, None, key, config)?;
        Ok(Self {
            info,
            op,
            axes,
            reduced_len,
        })
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    /// Number of inputs folded into each output.
    pub fn reduced_len(&self) -> usize {
        self.reduced_len
    }

    fn identity(&self) -> &'static str {
        match (self.op, self.info.dtype) {
            (ReduceOp::Sum | ReduceOp::Mean, DType::F32) => "0.0",
            (ReduceOp::Sum | ReduceOp::Mean, DType::I32) => "0",
            (ReduceOp::Prod, DType::F32) => "1.0",
            (ReduceOp::Prod, DType::I32) => "1",
            (ReduceOp::Max, DType::F32) => F32_LOWEST,
            (ReduceOp::Max, DType::I32) => I32_LOWEST,
            (ReduceOp::Min, DType::F32) => F32_HIGHEST,
            (ReduceOp::Min, DType::I32) => I32_HIGHEST,
        }
    }

    fn combine(&self, a: &str, b: &str) -> String {
        match self.op {
            ReduceOp::Sum | ReduceOp::Mean => format!("{a} + {b}"),
            ReduceOp::Prod => format!("{a} * {b}"),
            ReduceOp::Max => format!("max({a}, {b})"),
            ReduceOp::Min => format!("min({a}, {b})"),
        }
    }
}

impl KernelProgram for ReduceProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let width = self.info.geometry.workgroup_size[0];
        let ty = self.info.dtype.wgsl();
        let mut src = format!(
            "const reduceSize: i32 = {};\n\nvar<workgroup> xBestValues: array<{ty}, {width}>;\n\n",
            self.reduced_len
        );
        let _ = writeln!(src, "{} {{", main_header());
        let _ = writeln!(src, "    let outputIndex = getWorkgroupIndex();");
        let _ = writeln!(src, "    let inRange = outputIndex < outSize;");
        let _ = writeln!(src, "    let tid = i32(localIndex);");
        let _ = writeln!(src, "    var acc: {ty} = {};", self.identity());
        let _ = writeln!(src, "    if (inRange) {{");
        let _ = writeln!(src, "        let rowStart = outputIndex * reduceSize;");
        let _ = writeln!(
            src,
            "        for (var k: i32 = tid; k < reduceSize; k = k + {width}) {{"
        );
        let _ = writeln!(src, "            acc = {};", self.combine("acc", "x[rowStart + k]"));
        src.push_str("        }\n    }\n");
        src.push_str("    xBestValues[tid] = acc;\n    workgroupBarrier();\n");
        let _ = writeln!(
            src,
            "    for (var span: i32 = {}; span > 0; span = span / 2) {{",
            width / 2
        );
        src.push_str("        if (tid < span) {\n");
        let _ = writeln!(
            src,
            "            xBestValues[tid] = {};",
            self.combine("xBestValues[tid]", "xBestValues[tid + span]")
        );
        src.push_str("        }\n        workgroupBarrier();\n    }\n");
        let finish = match self.op {
            ReduceOp::Mean => format!("xBestValues[0] / {ty}(reduceSize)"),
            _ => "xBestValues[0]".to_string(),
        };
        src.push_str("    if (inRange && tid == 0) {\n");
        let _ = writeln!(src, "        result[outputIndex] = {finish};");
        src.push_str("    }\n}\n");
        src
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduce(shape: &[usize], op: ReduceOp, axes: &[usize], dtype: DType) -> Result<ReduceProgram> {
        ReduceProgram::new(&TensorShape::new(shape), op, axes, false, dtype, &PlannerConfig::default())
    }

    #[test]
    fn one_workgroup_per_output() {
        let program = reduce(&[6, 100], ReduceOp::Sum, &[1], DType::F32).expect("reduce");
        assert_eq!(program.output_shape(), &TensorShape::from([6]));
        assert_eq!(program.geometry().workgroup_size, [128, 1, 1]);
        assert_eq!(program.dispatch(), [6, 1, 1]);
        assert_eq!(program.reduced_len(), 100);
    }

    #[test]
    fn tree_fold_synchronizes_every_level() {
        let program = reduce(&[4, 3, 5], ReduceOp::Max, &[2, 1], DType::F32).expect("reduce");
        let body = program.shader_body();
        assert!(body.contains("const reduceSize: i32 = 15;"));
        assert!(body.contains("var<workgroup> xBestValues: array<f32, 32>;"));
        assert!(body.contains("var acc: f32 = -3.4028234663852886e38;"));
        assert!(body.contains("for (var span: i32 = 16; span > 0; span = span / 2) {"));
        assert_eq!(body.matches("workgroupBarrier();").count(), 2);
        assert!(!body.contains("return;"));
    }

    #[test]
    fn mean_divides_by_reduced_length() {
        let program = reduce(&[2, 8], ReduceOp::Mean, &[1], DType::F32).expect("reduce");
        assert!(program
            .shader_body()
            .contains("result[outputIndex] = xBestValues[0] / f32(reduceSize);"));
        assert!(reduce(&[2, 8], ReduceOp::Mean, &[1], DType::I32)
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn integer_extrema_use_representable_identities() {
        let program = reduce(&[2, 8], ReduceOp::Max, &[1], DType::I32).expect("reduce");
        assert!(program.shader_body().contains("var acc: i32 = (-2147483647 - 1);"));
    }

    #[test]
    fn leading_axes_are_unsupported() {
        let err = reduce(&[2, 8], ReduceOp::Sum, &[0], DType::F32).unwrap_err();
        assert!(err.is_unsupported());
        let err = reduce(&[2, 8], ReduceOp::Sum, &[2], DType::F32).unwrap_err();
        assert!(err.is_shape_error());
    }
}
