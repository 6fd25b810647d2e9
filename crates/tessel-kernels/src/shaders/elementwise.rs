//! Unary and broadcasting binary maps over a flat dispatch.

use crate::bindings::{BindingSchema, InputBinding, UniformBlock};
use crate::config::PlannerConfig;
use crate::error::{KernelError, Result};
use crate::heuristics::{elementwise_distribution, OpClass};
use crate::layout::flat_dispatch_layout;
use crate::program::key::KeyBuilder;
use crate::program::{KernelProgram, ProgramInfo};
use crate::shaders::preamble::{coord_at, coord_ctor, index_fn_name, main_header};
use crate::shape::{broadcast_shapes, BinaryOp, DType, TensorShape, UnaryOp};

/// Loop each invocation runs over its `per_thread` consecutive outputs.
fn per_thread_loop(per_thread: u32, statements: &str) -> String {
    format!(
        "{} {{\n    for (var i: i32 = 0; i < {per_thread}; i = i + 1) {{\n        \
         let flatIndex = getGlobalIndex() * {per_thread} + i;\n        \
         if (flatIndex < outSize) {{\n{statements}        }}\n    }}\n}}\n",
        main_header()
    )
}

/// Scalar parameters of the parameterized unary ops, passed as uniforms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnaryScalars {
    pub alpha: f32,
    pub min: f32,
    pub max: f32,
}

impl Default for UnaryScalars {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            min: 0.0,
            max: 6.0,
        }
    }
}

#[derive(Debug)]
pub struct UnaryProgram {
    info: ProgramInfo,
    op: UnaryOp,
}

impl UnaryProgram {
    pub fn new(
        x: &TensorShape,
        op: UnaryOp,
        scalars: UnaryScalars,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "unary";
        let integer_ok = matches!(op, UnaryOp::Abs | UnaryOp::Neg | UnaryOp::Relu);
        if dtype != DType::F32 && !integer_ok {
            return Err(KernelError::unsupported(
                OP,
                "dtype",
                format_args!("{} for {op:?}", dtype.wgsl()),
            ));
        }
        let uniforms = match op {
            UnaryOp::LeakyRelu => UniformBlock::new().with_f32("alpha", scalars.alpha),
            UnaryOp::Clip => UniformBlock::new()
                .with_f32("clipMin", scalars.min)
                .with_f32("clipMax", scalars.max),
            _ => UniformBlock::new(),
        };
        let bindings = BindingSchema::new(vec![InputBinding::new("x", x.clone(), dtype)], x.clone(), dtype)
            .with_uniforms(uniforms);
        let layout = flat_dispatch_layout(x);
        let distribution = elementwise_distribution(&layout, config);
        let key = KeyBuilder::new(OP).push("op", format_args!("{op:?}"));
        let info = ProgramInfo::new(OP, OpClass::Elementwise, bindings, layout, distribution, None, key, config)?;
        Ok(Self { info, op })
    }

    fn expr(&self, v: &str) -> String {
        let zero = match self.info.dtype {
            DType::F32 => "0.0",
            DType::I32 => "0",
        };
        match self.op {
            UnaryOp::Abs => format!("abs({v})"),
            UnaryOp::Neg => format!("-{v}"),
            UnaryOp::Exp => format!("exp({v})"),
            UnaryOp::Log => format!("log({v})"),
            UnaryOp::Sqrt => format!("sqrt({v})"),
            UnaryOp::Rsqrt => format!("inverseSqrt({v})"),
            UnaryOp::Relu => format!("max({v}, {zero})"),
            UnaryOp::Sigmoid => format!("1.0 / (1.0 + exp(-{v}))"),
            UnaryOp::Tanh => format!("tanh({v})"),
            UnaryOp::LeakyRelu => format!("select(uniforms.alpha * {v}, {v}, {v} >= 0.0)"),
            UnaryOp::Clip => format!("clamp({v}, uniforms.clipMin, uniforms.clipMax)"),
        }
    }
}

impl KernelProgram for UnaryProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let statements = format!(
            "            let v = x[flatIndex];\n            result[flatIndex] = {};\n",
            self.expr("v")
        );
        per_thread_loop(self.info.geometry.elements_per_thread[0], &statements)
    }
}

#[derive(Debug)]
pub struct BinaryProgram {
    info: ProgramInfo,
    op: BinaryOp,
}

impl BinaryProgram {
    pub fn new(
        a: &TensorShape,
        b: &TensorShape,
        op: BinaryOp,
        dtype: DType,
        config: &PlannerConfig,
    ) -> Result<Self> {
        const OP: &str = "binary";
        if op == BinaryOp::Pow && dtype != DType::F32 {
            return Err(KernelError::unsupported(OP, "dtype", format_args!("{} for Pow", dtype.wgsl())));
        }
        let out = broadcast_shapes(OP, a, b)?;
        let bindings = BindingSchema::new(
            vec![
                InputBinding::new("a", a.clone(), dtype),
                InputBinding::new("b", b.clone(), dtype),
            ],
            out.clone(),
            dtype,
        );
        let layout = flat_dispatch_layout(&out);
        let distribution = elementwise_distribution(&layout, config);
        let key = KeyBuilder::new(OP).push("op", format_args!("{op:?}"));
        let info = ProgramInfo::new(OP, OpClass::Elementwise, bindings, layout, distribution, None, key, config)?;
        Ok(Self { info, op })
    }

    /// Index into a broadcast operand for the current output coordinate.
    fn operand_index(&self, slot: usize) -> String {
        let input = &self.info.bindings.inputs[slot];
        let out = &self.info.output_shape;
        if input.shape == *out {
            return "flatIndex".to_string();
        }
        if input.shape.size() == 1 {
            return "0".to_string();
        }
        let (rank, in_rank) = (out.rank(), input.shape.rank());
        let parts: Vec<String> = (0..in_rank)
            .map(|j| {
                let d = rank - in_rank + j;
                if input.shape[j] == 1 && out[d] != 1 {
                    "0".to_string()
                } else {
                    coord_at(rank, "coords", d)
                }
            })
            .collect();
        format!("{}({})", index_fn_name(&input.name), coord_ctor(in_rank, &parts))
    }

    fn expr(&self, a: &str, b: &str) -> String {
        match self.op {
            BinaryOp::Add => format!("{a} + {b}"),
            BinaryOp::Sub => format!("{a} - {b}"),
            BinaryOp::Mul => format!("{a} * {b}"),
            BinaryOp::Div => format!("{a} / {b}"),
            BinaryOp::Max => format!("max({a}, {b})"),
            BinaryOp::Min => format!("min({a}, {b})"),
            BinaryOp::Pow => format!("pow({a}, {b})"),
        }
    }
}

impl KernelProgram for BinaryProgram {
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn emit_shader_body(&self) -> String {
        let (ia, ib) = (self.operand_index(0), self.operand_index(1));
        let mut statements = String::new();
        if ia.contains("coords") || ib.contains("coords") {
            statements.push_str("            let coords = getCoordsFromIndex(flatIndex);\n");
        }
        statements.push_str(&format!("            let lhs = a[{ia}];\n"));
        statements.push_str(&format!("            let rhs = b[{ib}];\n"));
        statements.push_str(&format!("            result[flatIndex] = {};\n", self.expr("lhs", "rhs")));
        per_thread_loop(self.info.geometry.elements_per_thread[0], &statements)
    }
}
