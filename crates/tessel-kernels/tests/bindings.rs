mod common;

use common::shape;
use tessel_kernels::{
    construct, BoundBuffer, BufferUsage, DType, KernelProgram, OpParams, PlannerConfig, UnaryOp,
};

fn bound(program: &dyn KernelProgram) -> Vec<BoundBuffer> {
    let schema = program.bindings();
    let mut buffers: Vec<BoundBuffer> = schema
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| BoundBuffer {
            binding: i as u32,
            usage: BufferUsage::StorageRead,
            size_bytes: input.min_size_bytes(),
        })
        .collect();
    buffers.push(BoundBuffer {
        binding: schema.output_binding(),
        usage: BufferUsage::StorageReadWrite,
        size_bytes: schema.output.min_size_bytes(),
    });
    if let (Some(block), Some(binding)) = (&schema.uniforms, schema.uniform_binding()) {
        buffers.push(BoundBuffer {
            binding,
            usage: BufferUsage::Uniform,
            size_bytes: block.pack().expect("pack").len() as u64,
        });
    }
    buffers
}

fn clip() -> Box<dyn KernelProgram> {
    construct(
        &OpParams::unary(UnaryOp::Clip),
        &[shape(&[6, 5])],
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("clip")
}

#[test]
fn matching_bindings_validate() {
    let program = clip();
    let buffers = bound(program.as_ref());
    assert_eq!(buffers.len(), program.bindings().binding_count());
    assert_eq!(program.bindings().input_index("x"), Some(0));
    assert_eq!(program.bindings().input_index("missing"), None);
    program.bindings().validate(&buffers).expect("valid");
}

#[test]
fn wrong_count_usage_or_size_is_a_mismatch() {
    let program = clip();
    let schema = program.bindings();
    let good = bound(program.as_ref());

    let missing = &good[..good.len() - 1];
    assert!(schema.validate(missing).unwrap_err().is_binding_mismatch());

    let mut wrong_usage = good.clone();
    wrong_usage[0].usage = BufferUsage::Uniform;
    assert!(schema.validate(&wrong_usage).unwrap_err().is_binding_mismatch());

    let mut short = good.clone();
    short[1].size_bytes = 4;
    assert!(schema.validate(&short).unwrap_err().is_binding_mismatch());
}

#[test]
fn packed_uniforms_follow_declaration_order() {
    let program = clip();
    let block = program.bindings().uniforms.as_ref().expect("uniforms");
    let bytes = block.pack().expect("pack");
    assert_eq!(bytes.len(), 16);
    let read = |offset: usize| {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        f32::from_le_bytes(word)
    };
    assert_eq!((read(0), read(4)), (0.0, 6.0));
}

#[cfg(feature = "wgpu")]
#[test]
fn wgpu_layout_entries_mirror_schema() {
    use tessel_kernels::bindings::wgpu_layout_entries;

    let program = clip();
    let entries = wgpu_layout_entries(program.bindings());
    assert_eq!(entries.len(), 3);
    assert!(matches!(
        entries[1].ty,
        wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            ..
        }
    ));
    assert!(matches!(
        entries[2].ty,
        wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            ..
        }
    ));
}
