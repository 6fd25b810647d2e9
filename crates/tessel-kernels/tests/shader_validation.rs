mod common;

use common::{init_logging, shape, validated_shader};
use tessel_kernels::{
    construct, make_shader, BinaryOp, DType, KernelProgram, OpParams, PlannerConfig, ReduceOp, TensorShape,
    UnaryOp,
};

fn build(op: OpParams, inputs: &[TensorShape], dtype: DType) -> Box<dyn KernelProgram> {
    construct(&op, inputs, dtype, &PlannerConfig::default()).expect("program")
}

#[test]
fn elementwise_programs_validate() {
    init_logging();
    for op in [
        UnaryOp::Abs,
        UnaryOp::Neg,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
        UnaryOp::Rsqrt,
        UnaryOp::Relu,
        UnaryOp::Sigmoid,
        UnaryOp::Tanh,
        UnaryOp::LeakyRelu,
        UnaryOp::Clip,
    ] {
        validated_shader(build(OpParams::unary(op), &[shape(&[3, 17])], DType::F32).as_ref());
    }
    validated_shader(build(OpParams::unary(UnaryOp::Relu), &[shape(&[40])], DType::I32).as_ref());
    for op in [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Max,
        BinaryOp::Min,
        BinaryOp::Pow,
    ] {
        let program = build(OpParams::Binary { op }, &[shape(&[2, 1, 6]), shape(&[5, 1])], DType::F32);
        validated_shader(program.as_ref());
    }
}

#[test]
fn high_rank_programs_validate() {
    let x = shape(&[2, 1, 3, 2, 2, 3]);
    validated_shader(build(OpParams::Permute { perm: vec![5, 4, 3, 2, 1, 0] }, &[x.clone()], DType::F32).as_ref());
    validated_shader(build(OpParams::Concat { axis: 4 }, &[x.clone(), x.clone()], DType::F32).as_ref());
    validated_shader(
        build(OpParams::Binary { op: BinaryOp::Mul }, &[x.clone(), shape(&[3, 1, 1, 3])], DType::F32).as_ref(),
    );
}

#[test]
fn reductions_validate() {
    for op in [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Max, ReduceOp::Min, ReduceOp::Prod] {
        let params = OpParams::Reduce {
            op,
            axes: vec![1, 2],
            keep_dims: false,
        };
        validated_shader(build(params, &[shape(&[5, 4, 6])], DType::F32).as_ref());
    }
    let full = OpParams::Reduce {
        op: ReduceOp::Min,
        axes: vec![0],
        keep_dims: false,
    };
    let program = build(full, &[shape(&[1000])], DType::I32);
    assert_eq!(program.output_shape(), &TensorShape::scalar());
    validated_shader(program.as_ref());
}

#[test]
fn generation_is_deterministic() {
    let inputs = [shape(&[2, 24, 16]), shape(&[16, 32])];
    let op = OpParams::MatMul(Default::default());
    let first = build(op.clone(), &inputs, DType::F32);
    let second = build(op, &inputs, DType::F32);
    assert_eq!(first.cache_key(), second.cache_key());
    assert_eq!(make_shader(first.as_ref()), make_shader(second.as_ref()));
    assert_eq!(first.shader_body(), first.shader_body());
    assert_eq!(first.dispatch(), second.dispatch());
}

#[test]
fn structural_changes_change_the_key() {
    let base = build(OpParams::Concat { axis: 1 }, &[shape(&[2, 3]), shape(&[2, 5])], DType::F32);
    let other_shape = build(OpParams::Concat { axis: 1 }, &[shape(&[2, 4]), shape(&[2, 4])], DType::F32);
    let other_dtype = build(OpParams::Concat { axis: 1 }, &[shape(&[2, 3]), shape(&[2, 5])], DType::I32);
    assert_ne!(base.cache_key(), other_shape.cache_key());
    assert_ne!(base.cache_key(), other_dtype.cache_key());

    // Uniform values are not structural.
    let leaky = |alpha: f32| {
        build(
            OpParams::Unary {
                op: UnaryOp::LeakyRelu,
                alpha,
                min: 0.0,
                max: 6.0,
            },
            &[shape(&[32])],
            DType::F32,
        )
    };
    let (a, b) = (leaky(0.1), leaky(0.3));
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(make_shader(a.as_ref()), make_shader(b.as_ref()));
    assert_ne!(a.bindings().uniforms, b.bindings().uniforms);
}
