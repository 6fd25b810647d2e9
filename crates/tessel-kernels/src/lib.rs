//! Tessel kernels: WGSL program synthesis and dispatch planning for tensor operations.
//!
//! Goals:
//! - Turn an operation and its input shapes into a shape-specialized WGSL compute program.
//! - Plan the workgroup size, per-thread work and dispatch grid so every output is covered.
//! - Describe the bindings a program expects so a runtime can validate and bind buffers.
//! - Derive a deterministic cache key per program so compiled pipelines can be reused.
//!
//! This crate does not own a device: it produces text, geometry and binding
//! schemas. With the `wgpu` feature it also maps schemas to wgpu layout entries.

pub mod addressing;
pub mod bindings;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heuristics;
pub mod layout;
pub mod program;
pub mod reference;
pub mod shaders;
pub mod shape;
pub mod tiling;

pub use bindings::{BindingSchema, BoundBuffer, BufferUsage, InputBinding, UniformBlock};
pub use config::{DeviceLimits, PlannerConfig};
pub use dispatch::{compute_dispatch, DispatchGeometry};
pub use error::{KernelError, Result};
pub use heuristics::{MatMulDims, OpClass, WorkDistribution};
pub use layout::DispatchLayout;
pub use program::key::{program_hash, KeyBuilder};
pub use program::registry::ProgramRegistry;
pub use program::{construct, make_shader, KernelProgram, ProgramInfo};
pub use shape::{
    compute_output_shape, Activation, BinaryOp, Conv2dParams, Conv2dTransposeParams, DType, DataFormat,
    MatMulParams, OpParams, Padding, ReduceOp, TensorShape, UnaryOp,
};
pub use tiling::TilingPlan;
