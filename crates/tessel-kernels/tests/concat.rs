mod common;

use common::{init_logging, shape, validated_shader};
use tessel_kernels::layout::coords_from_index;
use tessel_kernels::shaders::ConcatProgram;
use tessel_kernels::{construct, DType, KernelProgram, OpParams, PlannerConfig};

#[test]
fn concat_along_columns_routes_across_boundary() {
    init_logging();
    let program = ConcatProgram::new(
        &[shape(&[2, 3]), shape(&[2, 5])],
        1,
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("concat");
    assert_eq!(program.output_shape(), &shape(&[2, 8]));
    assert_eq!(program.route(&[1, 4]), (1, vec![1, 1]));

    // Every output element reads exactly the element a host concat would place there.
    let a: Vec<usize> = (0..6).collect();
    let b: Vec<usize> = (100..110).collect();
    let out = program.output_shape().clone();
    for flat in 0..out.size() {
        let coords = coords_from_index(&out, flat);
        let expected = if coords[1] < 3 {
            a[coords[0] * 3 + coords[1]]
        } else {
            b[coords[0] * 5 + coords[1] - 3]
        };
        let (source, local) = program.route(&coords);
        let actual = match source {
            0 => a[local[0] * 3 + local[1]],
            _ => b[local[0] * 5 + local[1]],
        };
        assert_eq!(actual, expected, "output {coords:?}");
    }
    validated_shader(&program);
}

#[test]
fn concat_of_many_inputs_validates() {
    let inputs = [shape(&[4, 1, 2]), shape(&[4, 3, 2]), shape(&[4, 0, 2]), shape(&[4, 2, 2])];
    let program = construct(&OpParams::Concat { axis: 1 }, &inputs, DType::F32, &PlannerConfig::default())
        .expect("concat");
    assert_eq!(program.output_shape(), &shape(&[4, 6, 2]));
    assert_eq!(program.bindings().inputs.len(), 3);
    let src = validated_shader(program.as_ref());
    assert!(!src.contains("T2"));
    assert!(src.contains("T3[getT3Index(vec3<i32>(coords[0], coords[1] - 4, coords[2]))]"));
}

#[test]
fn mismatched_inputs_are_shape_errors() {
    let err = ConcatProgram::new(
        &[shape(&[2, 3]), shape(&[3, 5])],
        1,
        DType::F32,
        &PlannerConfig::default(),
    )
    .unwrap_err();
    assert!(err.is_shape_error());

    let err = ConcatProgram::new(&[shape(&[2, 0]), shape(&[2, 0])], 1, DType::F32, &PlannerConfig::default())
        .unwrap_err();
    assert!(err.is_shape_error());
}
