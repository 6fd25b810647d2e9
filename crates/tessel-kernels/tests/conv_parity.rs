mod common;

use common::{assert_close, init_logging, naive_conv2d, naive_conv2d_transpose, ramp, shape, validated_shader};
use tessel_kernels::addressing::{ASource, MatMulOperands};
use tessel_kernels::reference::emulate_tiled_matmul;
use tessel_kernels::shaders::{Conv2dProgram, Conv2dTransposeProgram};
use tessel_kernels::{
    construct, Conv2dParams, Conv2dTransposeParams, DType, OpParams, Padding, PlannerConfig,
    TensorShape,
};

fn dims4(s: &TensorShape) -> [usize; 4] {
    [s[0], s[1], s[2], s[3]]
}

fn check_forward(x_shape: TensorShape, w_shape: TensorShape, params: Conv2dParams) {
    let program = Conv2dProgram::new(&x_shape, &w_shape, &params, DType::F32, &PlannerConfig::default())
        .expect("conv2d");
    let info = program.conv_info().clone();
    let x = ramp(x_shape.size(), 7, 3.0);
    let w = ramp(w_shape.size(), 5, 2.0);
    let indexer = program.indexer();
    let out = emulate_tiled_matmul(program.plan(), &indexer, &x, &w).crop(&indexer);
    let expected = naive_conv2d(
        &x,
        dims4(&x_shape),
        &w,
        dims4(&w_shape),
        dims4(&info.out_shape),
        info.strides,
        info.dilations,
        info.pad,
    );
    assert_close(&out, &expected, 1e-3);
    validated_shader(&program);
}

fn check_transpose(dy_shape: TensorShape, w_shape: TensorShape, params: Conv2dTransposeParams) {
    let program = Conv2dTransposeProgram::new(&dy_shape, &w_shape, &params, DType::F32, &PlannerConfig::default())
        .expect("conv2d_transpose");
    let info = program.conv_info().clone();
    let dy = ramp(dy_shape.size(), 7, 3.0);
    let w = ramp(w_shape.size(), 5, 2.0);
    let indexer = program.indexer();
    let dx = emulate_tiled_matmul(program.plan(), &indexer, &dy, &w).crop(&indexer);
    let expected = naive_conv2d_transpose(
        &dy,
        dims4(&dy_shape),
        &w,
        dims4(&w_shape),
        dims4(&info.dx_shape),
        info.forward.strides,
        info.forward.dilations,
        info.forward.pad,
    );
    assert_close(&dx, &expected, 1e-3);
    validated_shader(&program);
}

#[test]
fn forward_conv_matches_direct_convolution() {
    init_logging();
    check_forward(shape(&[1, 6, 7, 3]), shape(&[3, 3, 3, 2]), Conv2dParams::default());
    check_forward(
        shape(&[2, 9, 8, 4]),
        shape(&[3, 2, 4, 8]),
        Conv2dParams {
            strides: [2, 1],
            padding: Padding::Same,
            ..Conv2dParams::default()
        },
    );
    check_forward(
        shape(&[1, 10, 10, 2]),
        shape(&[3, 3, 2, 5]),
        Conv2dParams {
            dilations: [2, 2],
            padding: Padding::Explicit {
                top: 1,
                bottom: 2,
                left: 2,
                right: 0,
            },
            ..Conv2dParams::default()
        },
    );
}

#[test]
fn transposed_conv_matches_scatter() {
    init_logging();
    for stride in [1, 2, 3] {
        let forward = Conv2dParams {
            strides: [stride, stride],
            padding: Padding::Same,
            ..Conv2dParams::default()
        };
        check_transpose(
            shape(&[1, 4, 3, 2]),
            shape(&[3, 3, 3, 2]),
            Conv2dTransposeParams {
                conv: forward,
                output_shape: None,
            },
        );
    }
    // Vectorized path with an explicit output shape.
    check_transpose(
        shape(&[2, 3, 3, 8]),
        shape(&[2, 2, 4, 8]),
        Conv2dTransposeParams {
            conv: Conv2dParams {
                strides: [2, 2],
                ..Conv2dParams::default()
            },
            output_shape: Some(shape(&[2, 7, 6, 4])),
        },
    );
}

#[test]
fn unit_stride_never_reads_between_samples() {
    let program = Conv2dTransposeProgram::new(
        &shape(&[1, 5, 5, 3]),
        &shape(&[3, 3, 2, 3]),
        &Conv2dTransposeParams {
            conv: Conv2dParams {
                padding: Padding::Same,
                ..Conv2dParams::default()
            },
            output_shape: None,
        },
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("conv2d_transpose");
    let indexer = program.indexer();
    let dims = indexer.dims();
    for row in 0..dims.a_outer {
        for col in 0..dims.inner {
            assert_ne!(indexer.a_source(0, row, col), ASource::FractionalStride);
        }
    }
}

#[test]
fn padded_taps_contribute_zero() {
    let program = Conv2dProgram::new(
        &shape(&[1, 4, 4, 1]),
        &shape(&[3, 3, 1, 1]),
        &Conv2dParams {
            padding: Padding::Same,
            ..Conv2dParams::default()
        },
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("conv2d");
    let indexer = program.indexer();
    // Output (0, 0) with tap (0, 0) reaches input (-1, -1).
    assert_eq!(indexer.a_source(0, 0, 0), ASource::OutOfBounds);
    // Ones everywhere: corner outputs see four taps, the centre sees nine.
    let x = vec![1.0; 16];
    let w = vec![1.0; 9];
    let out = emulate_tiled_matmul(program.plan(), &indexer, &x, &w).crop(&indexer);
    assert_eq!(out[0], 4.0);
    assert_eq!(out[5], 9.0);
    assert_eq!(out[1], 6.0);
}

#[test]
fn construct_dispatches_conv_ops() {
    let conv = construct(
        &OpParams::Conv2d(Conv2dParams::default()),
        &[shape(&[1, 5, 5, 4]), shape(&[3, 3, 4, 4])],
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("conv2d");
    assert_eq!(conv.name(), "conv2d");
    assert_eq!(conv.output_shape(), &shape(&[1, 3, 3, 4]));

    let err = construct(
        &OpParams::Conv2d(Conv2dParams::default()),
        &[shape(&[1, 5, 5, 4]), shape(&[3, 3, 4, 4])],
        DType::I32,
        &PlannerConfig::default(),
    )
    .unwrap_err();
    assert!(err.is_unsupported());
}
