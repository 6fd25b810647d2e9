//! Shared-memory tiled matrix multiplication.
//!
//! The tiled loop is written once against three addressing functions that a
//! program supplies: `mm_readA(batch, row, col)`, `mm_readB(batch, row, col)`
//! and `mm_write(batch, row, col, value)`. Plain matmul reads its operands
//! directly; convolutions remap the virtual matrix indices onto 4-D tensors.

use std::fmt::Write as _;

use crate::addressing::MatMulIndexer;
use crate::bindings::{BindingSchema, InputBinding};
use crate::config::PlannerConfig;
use crate::error::{KernelError, Result};
use crate::heuristics::{
    matmul_distribution, matmul_uses_vec4, plan_tiling, MatMulDims, OpClass, WorkDistribution,
};
use crate::layout::flatten_to_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{require_float, KernelProgram, ProgramInfo};
use crate::shaders::preamble::main_header;
use crate::shape::{compute_output_shape, matrix_dims, Activation, DType, MatMulParams, OpParams, TensorShape};
use crate::tiling::TilingPlan;

/// Scalar tiled loop: each thread accumulates `ept.y x ept.x` outputs.
pub fn scalar_tiled_source(plan: &TilingPlan) -> String {
    let rows = plan.elements_per_thread[1];
    let cols = plan.elements_per_thread[0];
    let rows_a = plan.rows_per_thread_a();
    let cols_a = plan.cols_per_thread_a();
    let rows_b = plan.rows_per_thread_b();
    let tile_a = plan.tile_a_outer;
    let tile_b = plan.tile_b_outer;
    let tile_inner = plan.tile_inner;
    format!(
        r#"var<workgroup> mm_Asub: array<array<f32, {tile_inner}>, {tile_a}>;
var<workgroup> mm_Bsub: array<array<f32, {tile_b}>, {tile_inner}>;

{header} {{
    let batch = i32(globalId.z);
    let tileRow = i32(localId.y) * {rows};
    let tileCol = i32(localId.x) * {cols};
    let globalRow = i32(workgroupId.y) * {tile_a} + tileRow;
    let globalCol = i32(workgroupId.x) * {tile_b} + tileCol;
    let numTiles = (dimInner - 1) / {tile_inner} + 1;
    let tileRowA = i32(localId.y) * {rows_a};
    let tileColA = i32(localId.x) * {cols_a};
    let tileRowB = i32(localId.y) * {rows_b};

    var acc: array<array<f32, {cols}>, {rows}>;
    var BCached: array<f32, {cols}>;
    for (var innerRow: i32 = 0; innerRow < {rows}; innerRow = innerRow + 1) {{
        for (var innerCol: i32 = 0; innerCol < {cols}; innerCol = innerCol + 1) {{
            acc[innerRow][innerCol] = 0.0;
        }}
    }}

    for (var t: i32 = 0; t < numTiles; t = t + 1) {{
        for (var innerRow: i32 = 0; innerRow < {rows_a}; innerRow = innerRow + 1) {{
            for (var innerCol: i32 = 0; innerCol < {cols_a}; innerCol = innerCol + 1) {{
                let inputRow = tileRowA + innerRow;
                let inputCol = tileColA + innerCol;
                mm_Asub[inputRow][inputCol] = mm_readA(batch, globalRow + innerRow, t * {tile_inner} + inputCol);
            }}
        }}
        for (var innerRow: i32 = 0; innerRow < {rows_b}; innerRow = innerRow + 1) {{
            for (var innerCol: i32 = 0; innerCol < {cols}; innerCol = innerCol + 1) {{
                let inputRow = tileRowB + innerRow;
                let inputCol = tileCol + innerCol;
                mm_Bsub[inputRow][inputCol] = mm_readB(batch, t * {tile_inner} + inputRow, globalCol + innerCol);
            }}
        }}
        workgroupBarrier();

        for (var k: i32 = 0; k < {tile_inner}; k = k + 1) {{
            for (var inner: i32 = 0; inner < {cols}; inner = inner + 1) {{
                BCached[inner] = mm_Bsub[k][tileCol + inner];
            }}
            for (var innerRow: i32 = 0; innerRow < {rows}; innerRow = innerRow + 1) {{
                let ACached = mm_Asub[tileRow + innerRow][k];
                for (var innerCol: i32 = 0; innerCol < {cols}; innerCol = innerCol + 1) {{
                    acc[innerRow][innerCol] = acc[innerRow][innerCol] + ACached * BCached[innerCol];
                }}
            }}
        }}
        workgroupBarrier();
    }}

    for (var innerRow: i32 = 0; innerRow < {rows}; innerRow = innerRow + 1) {{
        for (var innerCol: i32 = 0; innerCol < {cols}; innerCol = innerCol + 1) {{
            mm_write(batch, globalRow + innerRow, globalCol + innerCol, acc[innerRow][innerCol]);
        }}
    }}
}}
"#,
        header = main_header(),
    )
}

/// Four-wide tiled loop: A and B are staged as `vec4<f32>` along the
/// reduction and column directions; each thread owns four adjacent columns.
pub fn vec4_tiled_source(plan: &TilingPlan) -> String {
    let rows = plan.elements_per_thread[1];
    let rows_b = plan.rows_per_thread_b();
    let wg_x = plan.workgroup_size[0];
    let tile_a = plan.tile_a_outer;
    let tile_inner = plan.tile_inner;
    format!(
        r#"var<workgroup> mm_Asub: array<array<vec4<f32>, {wg_x}>, {tile_a}>;
var<workgroup> mm_Bsub: array<array<vec4<f32>, {wg_x}>, {tile_inner}>;

{header} {{
    let batch = i32(globalId.z);
    let tileRow = i32(localId.y) * {rows};
    let tileCol = i32(localId.x);
    let globalRow = i32(workgroupId.y) * {tile_a} + tileRow;
    let globalCol = (i32(workgroupId.x) * {wg_x} + tileCol) * 4;
    let numTiles = (dimInner - 1) / {tile_inner} + 1;
    let tileRowB = i32(localId.y) * {rows_b};

    var acc: array<vec4<f32>, {rows}>;
    for (var i: i32 = 0; i < {rows}; i = i + 1) {{
        acc[i] = vec4<f32>(0.0);
    }}

    for (var t: i32 = 0; t < numTiles; t = t + 1) {{
        let kStart = t * {tile_inner};
        for (var innerRow: i32 = 0; innerRow < {rows}; innerRow = innerRow + 1) {{
            let inputRow = tileRow + innerRow;
            mm_Asub[inputRow][tileCol] = mm_readA(batch, globalRow + innerRow, kStart + tileCol * 4);
        }}
        for (var innerRow: i32 = 0; innerRow < {rows_b}; innerRow = innerRow + 1) {{
            let inputRow = tileRowB + innerRow;
            mm_Bsub[inputRow][tileCol] = mm_readB(batch, kStart + inputRow, globalCol);
        }}
        workgroupBarrier();

        for (var k: i32 = 0; k < {wg_x}; k = k + 1) {{
            let BCached0 = mm_Bsub[k * 4][tileCol];
            let BCached1 = mm_Bsub[k * 4 + 1][tileCol];
            let BCached2 = mm_Bsub[k * 4 + 2][tileCol];
            let BCached3 = mm_Bsub[k * 4 + 3][tileCol];
            for (var i: i32 = 0; i < {rows}; i = i + 1) {{
                let ACached = mm_Asub[tileRow + i][k];
                acc[i] = BCached0 * ACached.x + acc[i];
                acc[i] = BCached1 * ACached.y + acc[i];
                acc[i] = BCached2 * ACached.z + acc[i];
                acc[i] = BCached3 * ACached.w + acc[i];
            }}
        }}
        workgroupBarrier();
    }}

    for (var i: i32 = 0; i < {rows}; i = i + 1) {{
        mm_write(batch, globalRow + i, globalCol, acc[i]);
    }}
}}
"#,
        header = main_header(),
    )
}

pub fn tiled_source(plan: &TilingPlan) -> String {
    if plan.is_vec4() {
        vec4_tiled_source(plan)
    } else {
        scalar_tiled_source(plan)
    }
}

pub(crate) fn dims_constants(dims: &MatMulDims) -> String {
    format!(
        "const batchCount: i32 = {};\nconst dimAOuter: i32 = {};\nconst dimInner: i32 = {};\nconst dimBOuter: i32 = {};\n",
        dims.batch, dims.a_outer, dims.inner, dims.b_outer
    )
}

/// Value type read and written by the addressing functions.
pub(crate) fn lane_type(plan: &TilingPlan) -> &'static str {
    if plan.is_vec4() {
        "vec4<f32>"
    } else {
        "f32"
    }
}

pub(crate) fn activation_expr(activation: Activation, value: &str, ty: &str) -> String {
    match activation {
        Activation::Linear => value.to_string(),
        Activation::Relu => format!("max({value}, {ty}(0.0))"),
        Activation::Relu6 => format!("clamp({value}, {ty}(0.0), {ty}(6.0))"),
        Activation::Sigmoid => format!("1.0 / (1.0 + exp(-{value}))"),
    }
}

/// Batched matrix multiplication with optional transposes, bias and activation.
#[derive(Debug)]
pub struct MatMulProgram {
    info: ProgramInfo,
    params: MatMulParams,
    dims: MatMulDims,
    plan: TilingPlan,
    a_batched: bool,
    b_batched: bool,
}

impl MatMulProgram {
    pub fn new(
        inputs: &[TensorShape],
        params: MatMulParams,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "matmul";
        require_float(OP, dtype)?;
        let out = compute_output_shape(&OpParams::MatMul(params), inputs)?;
        let (a, b) = (&inputs[0], &inputs[1]);
        let (m, k) = matrix_dims(a, params.transpose_a);
        let n = out[out.rank() - 1];
        let batch: usize = out.dims()[..out.rank() - 2].iter().product();
        let batch_of = |s: &TensorShape| -> usize { s.dims()[..s.rank() - 2].iter().product() };
        let (a_batch, b_batch) = (batch_of(a), batch_of(b));
        for (name, operand_batch) in [("A", a_batch), ("B", b_batch)] {
            if operand_batch != 1 && operand_batch != batch {
                return Err(KernelError::unsupported(
                    OP,
                    "batch_broadcast",
                    format!("operand {name} batch {operand_batch} against output batch {batch}"),
                ));
            }
        }
        let dims = MatMulDims {
            batch,
            a_outer: m,
            inner: k,
            b_outer: n,
        };
        let transposed = params.transpose_a || params.transpose_b;
        let vec4 = matmul_uses_vec4(&dims, transposed, config);
        let plan = plan_tiling(&dims, vec4, matmul_distribution(&dims), config)?;
        let width = plan.vector_width;

        let mut inputs_decl = vec![
            InputBinding::new("A", a.clone(), dtype).vectorized(width),
            InputBinding::new("B", b.clone(), dtype).vectorized(width),
        ];
        if params.bias {
            inputs_decl.push(InputBinding::new("bias", inputs[2].clone(), dtype).vectorized(width));
        }
        let bindings = BindingSchema::new(inputs_decl, out.clone(), dtype).with_output_width(width);
        let key = KeyBuilder::new(OP)
            .push("ta", params.transpose_a)
            .push("tb", params.transpose_b)
            .push("bias", params.bias)
            .push("act", format_args!("{:?}", params.activation));
        let info = ProgramInfo::new(
            OP,
            OpClass::TiledMatMul,
            bindings,
            flatten_to_dispatch_layout(&out),
            WorkDistribution {
                workgroup_size: plan.workgroup_size,
                elements_per_thread: plan.elements_per_thread,
            },
            Some(plan),
            key,
            config,
        )?;
        Ok(Self {
            info,
            params,
            dims,
            plan,
            a_batched: a_batch > 1,
            b_batched: b_batch > 1,
        })
    }

    pub fn dims(&self) -> MatMulDims {
        self.dims
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    /// Host mirror of this program's operand addressing.
    pub fn indexer(&self) -> MatMulIndexer {
        MatMulIndexer {
            dims: self.dims,
            transpose_a: self.params.transpose_a,
            transpose_b: self.params.transpose_b,
            a_batched: self.a_batched,
            b_batched: self.b_batched,
        }
    }

    fn operand_index(&self, rows: usize, cols: usize, transposed: bool, batched: bool) -> String {
        let batch = if batched {
            format!("batch * {}", rows * cols)
        } else {
            "0".to_string()
        };
        if transposed {
            format!("{batch} + col * {rows} + row")
        } else {
            format!("{batch} + row * {cols} + col")
        }
    }
}

impl KernelProgram for MatMulProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let MatMulDims {
            a_outer: m,
            inner: k,
            b_outer: n,
            ..
        } = self.dims;
        let ty = lane_type(&self.plan);
        let lanes = if self.plan.is_vec4() { " / 4" } else { "" };
        let a_index = self.operand_index(m, k, self.params.transpose_a, self.a_batched);
        let b_index = self.operand_index(k, n, self.params.transpose_b, self.b_batched);

        let mut src = dims_constants(&self.dims);
        src.push('\n');
        let _ = write!(
            src,
            r#"fn mm_readA(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row < dimAOuter && col < dimInner) {{
        return A[({a_index}){lanes}];
    }}
    return {ty}(0.0);
}}

fn mm_readB(batch: i32, row: i32, col: i32) -> {ty} {{
    if (row < dimInner && col < dimBOuter) {{
        return B[({b_index}){lanes}];
    }}
    return {ty}(0.0);
}}

"#
        );
        let mut value = "value".to_string();
        if self.params.bias {
            value = format!("{value} + bias[col{lanes}]");
        }
        let value = activation_expr(self.params.activation, &format!("({value})"), ty);
        let _ = write!(
            src,
            r#"fn mm_write(batch: i32, row: i32, col: i32, value: {ty}) {{
    if (batch < batchCount && row < dimAOuter && col < dimBOuter) {{
        result[(batch * {out_stride} + row * dimBOuter + col){lanes}] = {value};
    }}
}}

"#,
            out_stride = m * n,
        );
        src.push_str(&tiled_source(&self.plan));
        src
    }
}
