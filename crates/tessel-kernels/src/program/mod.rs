//! The program contract shared by every generator.

pub mod key;
pub mod persist;
pub mod registry;

use std::fmt;

use once_cell::sync::OnceCell;

use crate::bindings::BindingSchema;
use crate::config::PlannerConfig;
use crate::dispatch::{compute_dispatch, DispatchGeometry};
use crate::error::{KernelError, Result};
use crate::heuristics::{OpClass, WorkDistribution};
use crate::layout::DispatchLayout;
use crate::shaders::conv::{Conv2dProgram, Conv2dTransposeProgram};
use crate::shaders::elementwise::{BinaryProgram, UnaryProgram, UnaryScalars};
use crate::shaders::matmul::MatMulProgram;
use crate::shaders::preamble;
use crate::shaders::{ConcatProgram, PermuteProgram, ReduceProgram};
use crate::shape::{expect_inputs, DType, OpParams, TensorShape};
use crate::tiling::TilingPlan;

use self::key::{program_hash, KeyBuilder};
use self::persist::{ProgramDescriptor, PROGRAM_CACHE_VERSION};

/// Everything about a program that is fixed at construction.
#[derive(Debug)]
pub struct ProgramInfo {
    pub name: &'static str,
    pub output_shape: TensorShape,
    pub dtype: DType,
    pub geometry: DispatchGeometry,
    pub bindings: BindingSchema,
    pub tiling: Option<TilingPlan>,
    pub cache_key: String,
    shader: OnceCell<String>,
}

impl ProgramInfo {
    /// Fix the geometry of a program and derive its cache key.
    ///
    /// `key` carries the program-specific parameters; shapes, bindings and
    /// geometry are appended here. Reductions launch one workgroup per output
    /// element, every other class covers `workgroup * elements_per_thread`
    /// outputs per workgroup along each axis.
    pub(crate) fn new(
        name: &'static str,
        class: OpClass,
        bindings: BindingSchema,
        layout: DispatchLayout,
        distribution: WorkDistribution,
        tiling: Option<TilingPlan>,
        key: KeyBuilder,
        config: &PlannerConfig,
    ) -> Result<Self> {
        let output_shape = bindings.output.shape.clone();
        preamble::check_rank(name, &output_shape)?;
        for input in &bindings.inputs {
            preamble::check_rank(name, &input.shape)?;
        }
        layout.validate(output_shape.rank())?;
        let WorkDistribution {
            workgroup_size,
            elements_per_thread,
        } = distribution;
        let invocations: u32 = workgroup_size.iter().product();
        if invocations == 0 || invocations > config.limits.max_invocations_per_workgroup {
            return Err(KernelError::unsupported(
                name,
                "workgroup_size",
                format!("{workgroup_size:?} ({invocations} invocations)"),
            ));
        }
        let (per_group, per_thread) = match class {
            OpClass::Reduction => ([1, 1, 1], [1, 1, 1]),
            OpClass::Elementwise | OpClass::TiledMatMul => (workgroup_size, elements_per_thread),
        };
        let dispatch = compute_dispatch(&layout, &output_shape, per_group, per_thread, &config.limits)?;

        let mut key = key
            .shape("out", &output_shape)
            .push("dtype", bindings.output.dtype.wgsl())
            .push("out_vec", bindings.output.vector_width);
        for input in &bindings.inputs {
            key = key.push(
                &input.name,
                format_args!("{}:{}:{}", input.shape, input.dtype.wgsl(), input.vector_width),
            );
        }
        if let Some(block) = &bindings.uniforms {
            let fields: Vec<String> = block
                .fields
                .iter()
                .map(|f| format!("{}:{}", f.name, f.ty.wgsl()))
                .collect();
            key = key.list("uniforms", &fields);
        }
        let key = key
            .push("layout", layout.tag())
            .list("wg", &workgroup_size)
            .list("ept", &elements_per_thread);
        let key = match &tiling {
            Some(plan) => key.push("tiling", plan.tag()),
            None => key,
        };
        let cache_key = key.finish();

        log::debug!(
            "{name}: out={output_shape} wg={workgroup_size:?} ept={elements_per_thread:?} dispatch={dispatch:?} key={cache_key}"
        );
        Ok(Self {
            name,
            dtype: bindings.output.dtype,
            output_shape,
            geometry: DispatchGeometry {
                layout,
                workgroup_size,
                elements_per_thread,
                dispatch,
            },
            bindings,
            tiling,
            cache_key,
            shader: OnceCell::new(),
        })
    }
}

/// A shape-specialized GPU program.
///
/// Implementors provide their fixed [`ProgramInfo`] and a pure body emitter;
/// everything else is derived.
pub trait KernelProgram: Send + Sync + fmt::Debug {
    fn info(&self) -> &ProgramInfo;

    /// WGSL for the program body, starting with [`preamble::main_header`].
    /// Must return identical text on every call.
    fn emit_shader_body(&self) -> String;

    fn name(&self) -> &'static str {
        self.info().name
    }

    fn output_shape(&self) -> &TensorShape {
        &self.info().output_shape
    }

    fn geometry(&self) -> &DispatchGeometry {
        &self.info().geometry
    }

    fn dispatch(&self) -> [u32; 3] {
        self.info().geometry.dispatch
    }

    fn bindings(&self) -> &BindingSchema {
        &self.info().bindings
    }

    fn cache_key(&self) -> &str {
        &self.info().cache_key
    }

    /// Body text, generated on first request.
    fn shader_body(&self) -> &str {
        let info = self.info();
        info.shader.get_or_init(|| {
            let body = self.emit_shader_body();
            log::trace!("{}: generated {} bytes of shader body", info.name, body.len());
            body
        })
    }

    fn descriptor(&self) -> ProgramDescriptor {
        let info = self.info();
        ProgramDescriptor {
            name: info.name.to_string(),
            cache_key: info.cache_key.clone(),
            hash: program_hash(&info.cache_key),
            output_shape: info.output_shape.clone(),
            dtype: info.dtype,
            geometry: info.geometry.clone(),
            bindings: info.bindings.clone(),
            tiling: info.tiling,
            layout_tag: info.bindings.layout_tag(),
            version: Some(PROGRAM_CACHE_VERSION),
        }
    }
}

/// Complete WGSL module: bindings, preamble helpers, body and entry point.
pub fn make_shader(program: &dyn KernelProgram) -> String {
    let info = program.info();
    let geometry = &info.geometry;
    let out_dims = preamble::effective_dims(&info.output_shape);
    let mut src = String::new();
    src.push_str(&info.bindings.wgsl_declarations());
    src.push('\n');
    src.push_str(preamble::builtin_vars());
    src.push('\n');
    src.push_str(&preamble::shape_constants(&info.bindings));
    src.push('\n');
    src.push_str(&preamble::global_index_fns(geometry.workgroup_size));
    src.push('\n');
    src.push_str(&preamble::coords_from_index_fn("getCoordsFromIndex", &out_dims));
    src.push('\n');
    src.push_str(&preamble::index_from_coords_fn("getOutputIndex", &out_dims));
    src.push('\n');
    for input in &info.bindings.inputs {
        let dims = preamble::effective_dims(&input.shape);
        src.push_str(&preamble::index_from_coords_fn(
            &preamble::index_fn_name(&input.name),
            &dims,
        ));
        src.push('\n');
    }
    src.push_str(&preamble::coords_in_bounds_fn(&out_dims));
    src.push('\n');
    src.push_str(&preamble::output_coords_fn(&geometry.layout, &info.output_shape));
    src.push('\n');
    src.push_str(program.shader_body());
    src.push('\n');
    src.push_str(&preamble::entry_point(geometry.workgroup_size));
    src
}

/// Build the program for `op` over `inputs`.
pub fn construct(
    op: &OpParams,
    inputs: &[TensorShape],
    dtype: DType,
    config: &PlannerConfig,
) -> Result<Box<dyn KernelProgram>> {
    let name = op.name();
    let program: Box<dyn KernelProgram> = match op {
        OpParams::Concat { axis } => Box::new(ConcatProgram::new(inputs, *axis, dtype, config)?),
        OpParams::Unary { op, alpha, min, max } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            let scalars = UnaryScalars {
                alpha: *alpha,
                min: *min,
                max: *max,
            };
            Box::new(UnaryProgram::new(x, *op, scalars, dtype, config)?)
        }
        OpParams::Binary { op } => {
            let [a, b] = expect_inputs::<2>(name, inputs)?;
            Box::new(BinaryProgram::new(a, b, *op, dtype, config)?)
        }
        OpParams::Permute { perm } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            Box::new(PermuteProgram::new(x, perm, dtype, config)?)
        }
        OpParams::Reduce {
            op,
            axes,
            keep_dims,
        } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            Box::new(ReduceProgram::new(x, *op, axes, *keep_dims, dtype, config)?)
        }
        OpParams::MatMul(params) => Box::new(MatMulProgram::new(inputs, *params, dtype, config)?),
        OpParams::Conv2d(params) => {
            let [x, w] = expect_inputs::<2>(name, inputs)?;
            Box::new(Conv2dProgram::new(x, w, params, dtype, config)?)
        }
        OpParams::Conv2dTranspose(params) => {
            let [dy, w] = expect_inputs::<2>(name, inputs)?;
            Box::new(Conv2dTransposeProgram::new(dy, w, params, dtype, config)?)
        }
    };
    Ok(program)
}

pub(crate) fn require_float(op: &'static str, dtype: DType) -> Result<()> {
    match dtype {
        DType::F32 => Ok(()),
        other => Err(KernelError::unsupported(op, "dtype", other.wgsl())),
    }
}
