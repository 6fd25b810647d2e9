//! Convolution and transposed convolution as tiled matmul over virtual
//! operands. Only channels-last tensors are handled.

use std::fmt::Write as _;

use crate::addressing::{Conv2dIndexer, Conv2dTransposeIndexer, MatMulOperands};
use crate::bindings::{BindingSchema, InputBinding, UniformBlock};
use crate::config::PlannerConfig;
use crate::error::{KernelError, Result};
use crate::heuristics::{
    conv_distribution, conv_uses_vec4, plan_tiling, MatMulDims, OpClass, WorkDistribution,
};
use crate::layout::conv_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{require_float, KernelProgram, ProgramInfo};
use crate::shaders::matmul::{dims_constants, lane_type, tiled_source};
use crate::shape::{
    conv2d_info, conv2d_transpose_info, Conv2dInfo, Conv2dParams, Conv2dTransposeInfo,
    Conv2dTransposeParams, DType, DataFormat, TensorShape,
};
use crate::tiling::TilingPlan;

fn require_channels_last(op: &'static str, format: DataFormat) -> Result<()> {
    match format {
        DataFormat::ChannelsLast => Ok(()),
        other => Err(KernelError::unsupported(op, "data_format", format_args!("{other:?}"))),
    }
}

fn to_i32(op: &'static str, parameter: &'static str, value: i64) -> Result<i32> {
    i32::try_from(value).map_err(|_| KernelError::unsupported(op, parameter, value))
}

fn conv_uniforms(op: &'static str, pad: [i64; 2], stride: [usize; 2], dilation: [usize; 2]) -> Result<UniformBlock> {
    Ok(UniformBlock::new()
        .with_vec2_i32("pad", [to_i32(op, "pad", pad[0])?, to_i32(op, "pad", pad[1])?])
        .with_vec2_i32(
            "stride",
            [to_i32(op, "stride", stride[0] as i64)?, to_i32(op, "stride", stride[1] as i64)?],
        )
        .with_vec2_i32(
            "dilation",
            [
                to_i32(op, "dilation", dilation[0] as i64)?,
                to_i32(op, "dilation", dilation[1] as i64)?,
            ],
        ))
}

/// Output writer shared by both convolutions: the virtual output matrix is
/// `[rows * cols, channels]` per batch, contiguous in channels-last order.
fn conv_write_fn(plan: &TilingPlan, dims: &MatMulDims) -> String {
    let ty = lane_type(plan);
    let lanes = if plan.is_vec4() { " / 4" } else { "" };
    format!(
        r#"fn mm_write(batch: i32, row: i32, col: i32, value: {ty}) {{
    if (batch < batchCount && row < dimAOuter && col < dimBOuter) {{
        result[(batch * {stride} + row * dimBOuter + col){lanes}] = value;
    }}
}}

"#,
        stride = dims.a_outer * dims.b_outer,
    )
}

/// Forward 2-D convolution (`x: [n, h, w, c]`, `W: [f_h, f_w, c, out_c]`).
#[derive(Debug)]
pub struct Conv2dProgram {
    info: ProgramInfo,
    conv: Conv2dInfo,
    dims: MatMulDims,
    plan: TilingPlan,
}

impl Conv2dProgram {
    pub fn new(
        x: &TensorShape,
        w: &TensorShape,
        params: &Conv2dParams,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "conv2d";
        require_channels_last(OP, params.data_format)?;
        require_float(OP, dtype)?;
        let conv = conv2d_info(x, w, params)?;
        let indexer = Conv2dIndexer { info: conv.clone() };
        let dims = indexer.dims();
        let out = conv.out_shape.clone();
        let (in_c, out_c) = (x[3], w[3]);
        let vec4 = conv_uses_vec4(in_c, out_c, config);
        let plan = plan_tiling(&dims, vec4, conv_distribution(out_c, dims.a_outer), config)?;
        let width = plan.vector_width;
        let pad = [conv.pad[0] as i64, conv.pad[1] as i64];
        let bindings = BindingSchema::new(
            vec![
                InputBinding::new("x", x.clone(), dtype).vectorized(width),
                InputBinding::new("W", w.clone(), dtype).vectorized(width),
            ],
            out.clone(),
            dtype,
        )
        .with_output_width(width)
        .with_uniforms(conv_uniforms(OP, pad, conv.strides, conv.dilations)?);
        let info = ProgramInfo::new(
            OP,
            OpClass::TiledMatMul,
            bindings,
            conv_dispatch_layout(),
            WorkDistribution {
                workgroup_size: plan.workgroup_size,
                elements_per_thread: plan.elements_per_thread,
            },
            Some(plan),
            KeyBuilder::new(OP),
            config,
        )?;
        Ok(Self {
            info,
            conv,
            dims,
            plan,
        })
    }

    pub fn conv_info(&self) -> &Conv2dInfo {
        &self.conv
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    pub fn indexer(&self) -> Conv2dIndexer {
        Conv2dIndexer {
            info: self.conv.clone(),
        }
    }
}

impl KernelProgram for Conv2dProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let x = &self.conv.in_shape;
        let f = &self.conv.filter_shape;
        let ty = lane_type(&self.plan);
        let lanes = if self.plan.is_vec4() { " / 4" } else { "" };
        let mut src = dims_constants(&self.dims);
        let _ = write!(
            src,
            "const inHeight: i32 = {};\nconst inWidth: i32 = {};\nconst inChannels: i32 = {};\n\
             const outWidth: i32 = {};\nconst filterWidth: i32 = {};\n\n",
            x[1], x[2], x[3], self.conv.out_shape[2], f[1]
        );
        let _ = write!(
            src,
            r#"fn mm_readA(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row >= dimAOuter || col >= dimInner) {{
        return {ty}(0.0);
    }}
    let outRow = row / outWidth;
    let outCol = row % outWidth;
    let wRow = col / (filterWidth * inChannels);
    let wCol = (col / inChannels) % filterWidth;
    let ch = col % inChannels;
    let xRow = outRow * uniforms.stride.x - uniforms.pad.x + uniforms.dilation.x * wRow;
    let xCol = outCol * uniforms.stride.y - uniforms.pad.y + uniforms.dilation.y * wCol;
    if (xRow < 0 || xRow >= inHeight || xCol < 0 || xCol >= inWidth) {{
        return {ty}(0.0);
    }}
    return x[getXIndex(vec4<i32>(batch, xRow, xCol, ch)){lanes}];
}}

fn mm_readB(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row >= dimInner || col >= dimBOuter) {{
        return {ty}(0.0);
    }}
    return W[(row * dimBOuter + col){lanes}];
}}

"#
        );
        src.push_str(&conv_write_fn(&self.plan, &self.dims));
        src.push_str(&tiled_source(&self.plan));
        src
    }
}

/// Transposed 2-D convolution (gradient of [`Conv2dProgram`] with respect to
/// its input): `dy: [n, out_h, out_w, out_c]`, `W: [f_h, f_w, in_c, out_c]`,
/// producing `[n, h, w, in_c]`.
#[derive(Debug)]
pub struct Conv2dTransposeProgram {
    info: ProgramInfo,
    conv: Conv2dTransposeInfo,
    dims: MatMulDims,
    plan: TilingPlan,
}

impl Conv2dTransposeProgram {
    pub fn new(
        dy: &TensorShape,
        w: &TensorShape,
        params: &Conv2dTransposeParams,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "conv2d_transpose";
        require_channels_last(OP, params.conv.data_format)?;
        require_float(OP, dtype)?;
        let conv = conv2d_transpose_info(dy, w, params)?;
        let indexer = Conv2dTransposeIndexer { info: conv.clone() };
        let dims = indexer.dims();
        let (dx_c, dy_c) = (w[2], w[3]);
        let vec4 = conv_uses_vec4(dy_c, dx_c, config);
        let plan = plan_tiling(&dims, vec4, conv_distribution(dx_c, dims.a_outer), config)?;
        let width = plan.vector_width;
        let forward = &conv.forward;
        let bindings = BindingSchema::new(
            vec![
                InputBinding::new("dy", dy.clone(), dtype).vectorized(width),
                InputBinding::new("W", w.clone(), dtype),
            ],
            conv.dx_shape.clone(),
            dtype,
        )
        .with_output_width(width)
        .with_uniforms(conv_uniforms(
            OP,
            indexer.transposed_pad(),
            forward.strides,
            forward.dilations,
        )?);
        let info = ProgramInfo::new(
            OP,
            OpClass::TiledMatMul,
            bindings,
            conv_dispatch_layout(),
            WorkDistribution {
                workgroup_size: plan.workgroup_size,
                elements_per_thread: plan.elements_per_thread,
            },
            Some(plan),
            KeyBuilder::new(OP),
            config,
        )?;
        Ok(Self {
            info,
            conv,
            dims,
            plan,
        })
    }

    pub fn conv_info(&self) -> &Conv2dTransposeInfo {
        &self.conv
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    pub fn indexer(&self) -> Conv2dTransposeIndexer {
        Conv2dTransposeIndexer {
            info: self.conv.clone(),
        }
    }

    fn read_b_fn(&self) -> String {
        let gather = |col: &str| format!("W[getWIndex(vec4<i32>(fRow, fCol, {col}, ch))]");
        let value = if self.plan.is_vec4() {
            format!(
                "vec4<f32>({}, {}, {}, {})",
                gather("col"),
                gather("col + 1"),
                gather("col + 2"),
                gather("col + 3")
            )
        } else {
            gather("col")
        };
        let ty = lane_type(&self.plan);
        format!(
            r#"fn mm_readB(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row >= dimInner || col >= dimBOuter) {{
        return {ty}(0.0);
    }}
    let fRow = filterHeight - 1 - row / (filterWidth * dyChannels);
    let fCol = filterWidth - 1 - (row / dyChannels) % filterWidth;
    let ch = row % dyChannels;
    return {value};
}}

"#
        )
    }
}

impl KernelProgram for Conv2dTransposeProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let dy = &self.conv.dy_shape;
        let f = &self.conv.filter_shape;
        let ty = lane_type(&self.plan);
        let lanes = if self.plan.is_vec4() { " / 4" } else { "" };
        let mut src = dims_constants(&self.dims);
        let _ = write!(
            src,
            "const dyHeight: i32 = {};\nconst dyWidth: i32 = {};\nconst dyChannels: i32 = {};\n\
             const outWidth: i32 = {};\nconst filterHeight: i32 = {};\nconst filterWidth: i32 = {};\n\n",
            dy[1], dy[2], dy[3], self.conv.dx_shape[2], f[0], f[1]
        );
        // Positions between real dy samples divide unevenly by the stride.
        let _ = write!(
            src,
            r#"fn mm_readA(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row >= dimAOuter || col >= dimInner) {{
        return {ty}(0.0);
    }}
    let outRow = row / outWidth;
    let outCol = row % outWidth;
    let wRow = col / (filterWidth * dyChannels);
    let wCol = (col / dyChannels) % filterWidth;
    let ch = col % dyChannels;
    let numRow = outRow - uniforms.pad.x + uniforms.dilation.x * wRow;
    let numCol = outCol - uniforms.pad.y + uniforms.dilation.y * wCol;
    if (numRow < 0 || numCol < 0) {{
        return {ty}(0.0);
    }}
    if (numRow % uniforms.stride.x != 0 || numCol % uniforms.stride.y != 0) {{
        return {ty}(0.0);
    }}
    let yRow = numRow / uniforms.stride.x;
    let yCol = numCol / uniforms.stride.y;
    if (yRow >= dyHeight || yCol >= dyWidth) {{
        return {ty}(0.0);
    }}
    return dy[getDyIndex(vec4<i32>(batch, yRow, yCol, ch)){lanes}];
}}

"#
        );
        src.push_str(&self.read_b_fn());
        src.push_str(&conv_write_fn(&self.plan, &self.dims));
        src.push_str(&tiled_source(&self.plan));
        src
    }
}
