//! Declared binding schema of a program.
//!
//! Buffers are bound in declaration order in group 0: inputs first, then the
//! output, then the uniform block (if any). The consumer validates what it
//! actually bound against the schema before dispatch.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::shape::{DType, TensorShape};

pub const OUTPUT_BINDING_NAME: &str = "result";
pub const UNIFORM_BINDING_NAME: &str = "uniforms";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    pub shape: TensorShape,
    pub dtype: DType,
    /// Elements per storage element: 1 (`array<f32>`) or 4 (`array<vec4<f32>>`).
    pub vector_width: u32,
}

impl InputBinding {
    pub fn new(name: impl Into<String>, shape: TensorShape, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            vector_width: 1,
        }
    }

    pub fn vectorized(mut self, width: u32) -> Self {
        self.vector_width = width;
        self
    }

    pub fn storage_type(&self) -> String {
        element_type(self.dtype, self.vector_width)
    }

    pub fn min_size_bytes(&self) -> u64 {
        (self.shape.size() * self.dtype.bytes_per_element()) as u64
    }
}

pub(crate) fn element_type(dtype: DType, vector_width: u32) -> String {
    if vector_width == 4 {
        format!("vec4<{}>", dtype.wgsl())
    } else {
        dtype.wgsl().to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniformType {
    I32,
    U32,
    F32,
    Vec2I32,
    Vec2F32,
    Vec4I32,
    Vec4F32,
}

impl UniformType {
    pub fn wgsl(self) -> &'static str {
        match self {
            UniformType::I32 => "i32",
            UniformType::U32 => "u32",
            UniformType::F32 => "f32",
            UniformType::Vec2I32 => "vec2<i32>",
            UniformType::Vec2F32 => "vec2<f32>",
            UniformType::Vec4I32 => "vec4<i32>",
            UniformType::Vec4F32 => "vec4<f32>",
        }
    }

    pub fn components(self) -> usize {
        match self {
            UniformType::I32 | UniformType::U32 | UniformType::F32 => 1,
            UniformType::Vec2I32 | UniformType::Vec2F32 => 2,
            UniformType::Vec4I32 | UniformType::Vec4F32 => 4,
        }
    }

    /// Alignment in the uniform address space.
    pub fn align(self) -> u32 {
        match self.components() {
            1 => 4,
            2 => 8,
            _ => 16,
        }
    }

    pub fn size(self) -> u32 {
        4 * self.components() as u32
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UniformValue {
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl UniformValue {
    fn matches(&self, ty: UniformType) -> bool {
        let (len, kind_ok) = match (self, ty) {
            (UniformValue::I32(v), UniformType::I32 | UniformType::Vec2I32 | UniformType::Vec4I32) => {
                (v.len(), true)
            }
            (UniformValue::U32(v), UniformType::U32) => (v.len(), true),
            (UniformValue::F32(v), UniformType::F32 | UniformType::Vec2F32 | UniformType::Vec4F32) => {
                (v.len(), true)
            }
            _ => (0, false),
        };
        kind_ok && len == ty.components()
    }

    fn bytes(&self) -> &[u8] {
        match self {
            UniformValue::I32(v) => bytemuck::cast_slice(v),
            UniformValue::U32(v) => bytemuck::cast_slice(v),
            UniformValue::F32(v) => bytemuck::cast_slice(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformField {
    pub name: String,
    pub ty: UniformType,
    pub value: UniformValue,
}

/// Ordered uniform fields with the values this program expects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformBlock {
    pub fields: Vec<UniformField>,
}

impl UniformBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_f32(mut self, name: &str, value: f32) -> Self {
        self.fields.push(UniformField {
            name: name.to_string(),
            ty: UniformType::F32,
            value: UniformValue::F32(vec![value]),
        });
        self
    }

    pub fn with_vec2_i32(mut self, name: &str, value: [i32; 2]) -> Self {
        self.fields.push(UniformField {
            name: name.to_string(),
            ty: UniformType::Vec2I32,
            value: UniformValue::I32(value.to_vec()),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&UniformField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn layout(&self) -> UniformLayout {
        UniformLayout::compute(self.fields.iter().map(|f| (f.name.as_str(), f.ty)))
    }

    /// Bytes of the block exactly as the shader reads them.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let layout = self.layout();
        let mut out = vec![0u8; layout.size as usize];
        for (field, offset) in self.fields.iter().zip(&layout.offsets) {
            if !field.value.matches(field.ty) {
                return Err(KernelError::binding(format!(
                    "uniform `{}` declared {} but holds {:?}",
                    field.name,
                    field.ty.wgsl(),
                    field.value
                )));
            }
            let bytes = field.value.bytes();
            let start = *offset as usize;
            out[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(out)
    }

    pub fn wgsl_struct(&self) -> String {
        let mut src = String::from("struct Uniforms {\n");
        for field in &self.fields {
            let _ = writeln!(src, "    {}: {},", field.name, field.ty.wgsl());
        }
        src.push_str("};\n");
        src
    }
}

/// Member offsets and total size of a uniform struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformLayout {
    pub names: Vec<String>,
    pub offsets: Vec<u32>,
    /// Struct size rounded up to 16 bytes.
    pub size: u32,
}

impl UniformLayout {
    pub fn compute<'a>(fields: impl IntoIterator<Item = (&'a str, UniformType)>) -> Self {
        let mut names = Vec::new();
        let mut offsets = Vec::new();
        let mut cursor = 0u32;
        for (name, ty) in fields {
            cursor = cursor.next_multiple_of(ty.align());
            names.push(name.to_string());
            offsets.push(cursor);
            cursor += ty.size();
        }
        Self {
            names,
            offsets,
            size: cursor.max(1).next_multiple_of(16),
        }
    }

    pub fn check_len(&self, len: usize) -> Result<()> {
        if len < self.size as usize {
            return Err(KernelError::binding(format!(
                "uniform buffer of {len} bytes is smaller than the declared {} bytes",
                self.size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferUsage {
    StorageRead,
    StorageReadWrite,
    Uniform,
}

/// What a consumer actually bound at one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundBuffer {
    pub binding: u32,
    pub usage: BufferUsage,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindingSchema {
    pub inputs: Vec<InputBinding>,
    pub output: InputBinding,
    pub uniforms: Option<UniformBlock>,
}

impl BindingSchema {
    pub fn new(inputs: Vec<InputBinding>, output_shape: TensorShape, dtype: DType) -> Self {
        Self {
            inputs,
            output: InputBinding::new(OUTPUT_BINDING_NAME, output_shape, dtype),
            uniforms: None,
        }
    }

    pub fn with_output_width(mut self, width: u32) -> Self {
        self.output.vector_width = width;
        self
    }

    pub fn with_uniforms(mut self, block: UniformBlock) -> Self {
        self.uniforms = Some(block).filter(|b| !b.fields.is_empty());
        self
    }

    pub fn output_binding(&self) -> u32 {
        self.inputs.len() as u32
    }

    pub fn uniform_binding(&self) -> Option<u32> {
        self.uniforms.as_ref().map(|_| self.inputs.len() as u32 + 1)
    }

    pub fn binding_count(&self) -> usize {
        self.inputs.len() + 1 + usize::from(self.uniforms.is_some())
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|b| b.name == name)
    }

    /// Expected usage of each slot, in binding order.
    pub fn expected_usages(&self) -> Vec<BufferUsage> {
        let mut usages = vec![BufferUsage::StorageRead; self.inputs.len()];
        usages.push(BufferUsage::StorageReadWrite);
        if self.uniforms.is_some() {
            usages.push(BufferUsage::Uniform);
        }
        usages
    }

    /// Check the buffers a consumer bound against this schema.
    pub fn validate(&self, bound: &[BoundBuffer]) -> Result<()> {
        let expected = self.expected_usages();
        if bound.len() != expected.len() {
            return Err(KernelError::binding(format!(
                "expected {} bindings, got {}",
                expected.len(),
                bound.len()
            )));
        }
        for (slot, (buffer, usage)) in bound.iter().zip(&expected).enumerate() {
            if buffer.binding != slot as u32 {
                return Err(KernelError::binding(format!(
                    "slot {slot} is bound at binding {}",
                    buffer.binding
                )));
            }
            if buffer.usage != *usage {
                return Err(KernelError::binding(format!(
                    "binding {slot} expects {usage:?}, got {:?}",
                    buffer.usage
                )));
            }
            let min = match usage {
                BufferUsage::StorageRead => self.inputs[slot].min_size_bytes(),
                BufferUsage::StorageReadWrite => self.output.min_size_bytes(),
                BufferUsage::Uniform => self
                    .uniforms
                    .as_ref()
                    .map(|u| u.layout().size as u64)
                    .unwrap_or(0),
            };
            if buffer.size_bytes < min {
                return Err(KernelError::binding(format!(
                    "binding {slot} holds {} bytes but needs at least {min}",
                    buffer.size_bytes
                )));
            }
        }
        Ok(())
    }

    /// Binding declarations in WGSL.
    pub fn wgsl_declarations(&self) -> String {
        let mut src = String::new();
        for (i, input) in self.inputs.iter().enumerate() {
            let _ = writeln!(
                src,
                "@group(0) @binding({i}) var<storage, read> {}: array<{}>;",
                input.name,
                input.storage_type()
            );
        }
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read_write> {}: array<{}>;",
            self.output_binding(),
            self.output.name,
            self.output.storage_type()
        );
        if let (Some(block), Some(binding)) = (&self.uniforms, self.uniform_binding()) {
            src.push_str(&block.wgsl_struct());
            let _ = writeln!(
                src,
                "@group(0) @binding({binding}) var<uniform> {UNIFORM_BINDING_NAME}: Uniforms;"
            );
        }
        src
    }

    pub fn layout_tag(&self) -> String {
        format!(
            "tessel-layout-{}{}",
            self.inputs.len(),
            if self.uniforms.is_some() { "-u" } else { "" }
        )
    }
}

#[cfg(feature = "wgpu")]
pub use self::wgpu_entries::*;

#[cfg(feature = "wgpu")]
mod wgpu_entries {
    use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

    use super::{BindingSchema, BufferUsage};

    fn buffer_entry(binding: u32, ty: BufferBindingType) -> BindGroupLayoutEntry {
        BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    pub fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
        buffer_entry(binding, BufferBindingType::Storage { read_only: true })
    }

    pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
        buffer_entry(binding, BufferBindingType::Storage { read_only: false })
    }

    pub fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
        buffer_entry(binding, BufferBindingType::Uniform)
    }

    /// Layout entries matching a schema's declaration order.
    pub fn wgpu_layout_entries(schema: &BindingSchema) -> Vec<BindGroupLayoutEntry> {
        schema
            .expected_usages()
            .into_iter()
            .enumerate()
            .map(|(slot, usage)| match usage {
                BufferUsage::StorageRead => storage_read_entry(slot as u32),
                BufferUsage::StorageReadWrite => storage_read_write_entry(slot as u32),
                BufferUsage::Uniform => uniform_entry(slot as u32),
            })
            .collect()
    }
}
