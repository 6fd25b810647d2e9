#![allow(dead_code)]

use std::sync::Once;

use tessel_kernels::{make_shader, KernelProgram, TensorShape};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn shape(dims: &[usize]) -> TensorShape {
    TensorShape::new(dims)
}

/// Parse and validate the complete module of `program`, returning its text.
pub fn validated_shader(program: &dyn KernelProgram) -> String {
    let src = make_shader(program);
    let module = match naga::front::wgsl::parse_str(&src) {
        Ok(module) => module,
        Err(err) => panic!(
            "{} failed to parse: {}\n{src}",
            program.name(),
            err.emit_to_string(&src)
        ),
    };
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(err) = validator.validate(&module) {
        panic!("{} failed validation: {err:?}\n{src}", program.name());
    }
    src
}

/// Deterministic small-integer data so sums stay exact in f32.
pub fn ramp(len: usize, modulus: usize, offset: f32) -> Vec<f32> {
    (0..len).map(|i| (i % modulus) as f32 - offset).collect()
}

/// Batched `A x B` over row-major operands; an operand without a batch axis
/// is shared by every batch.
pub fn naive_matmul(
    a: &[f32],
    b: &[f32],
    batch: usize,
    [m, k, n]: [usize; 3],
    transpose_a: bool,
) -> Vec<f32> {
    let a_batched = a.len() == batch * m * k && batch > 1;
    let b_batched = b.len() == batch * k * n && batch > 1;
    let mut out = vec![0.0f32; batch * m * n];
    for bi in 0..batch {
        let a_off = if a_batched { bi * m * k } else { 0 };
        let b_off = if b_batched { bi * k * n } else { 0 };
        for row in 0..m {
            for col in 0..n {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    let av = if transpose_a {
                        a[a_off + kk * m + row]
                    } else {
                        a[a_off + row * k + kk]
                    };
                    acc += av * b[b_off + kk * n + col];
                }
                out[(bi * m + row) * n + col] = acc;
            }
        }
    }
    out
}

/// Direct NHWC convolution.
pub fn naive_conv2d(
    x: &[f32],
    x_shape: [usize; 4],
    w: &[f32],
    w_shape: [usize; 4],
    out_shape: [usize; 4],
    strides: [usize; 2],
    dilations: [usize; 2],
    pad: [usize; 2],
) -> Vec<f32> {
    let [n, h, wd, c] = x_shape;
    let [fh, fw, _, oc] = w_shape;
    let [_, oh, ow, _] = out_shape;
    let mut out = vec![0.0f32; n * oh * ow * oc];
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for co in 0..oc {
                    let mut acc = 0.0f32;
                    for fy in 0..fh {
                        for fx in 0..fw {
                            let iy = (oy * strides[0] + fy * dilations[0]) as i64 - pad[0] as i64;
                            let ix = (ox * strides[1] + fx * dilations[1]) as i64 - pad[1] as i64;
                            if iy < 0 || ix < 0 || iy >= h as i64 || ix >= wd as i64 {
                                continue;
                            }
                            for ci in 0..c {
                                let xv = x[((b * h + iy as usize) * wd + ix as usize) * c + ci];
                                let wv = w[((fy * fw + fx) * c + ci) * oc + co];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((b * oh + oy) * ow + ox) * oc + co] = acc;
                }
            }
        }
    }
    out
}

/// Transposed convolution as the scatter of every `dy` element through the
/// forward taps.
pub fn naive_conv2d_transpose(
    dy: &[f32],
    dy_shape: [usize; 4],
    w: &[f32],
    w_shape: [usize; 4],
    dx_shape: [usize; 4],
    strides: [usize; 2],
    dilations: [usize; 2],
    pad: [usize; 2],
) -> Vec<f32> {
    let [n, oh, ow, oc] = dy_shape;
    let [fh, fw, ic, _] = w_shape;
    let [_, h, wd, _] = dx_shape;
    let mut dx = vec![0.0f32; n * h * wd * ic];
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for fy in 0..fh {
                    for fx in 0..fw {
                        let iy = (oy * strides[0] + fy * dilations[0]) as i64 - pad[0] as i64;
                        let ix = (ox * strides[1] + fx * dilations[1]) as i64 - pad[1] as i64;
                        if iy < 0 || ix < 0 || iy >= h as i64 || ix >= wd as i64 {
                            continue;
                        }
                        for ci in 0..ic {
                            for co in 0..oc {
                                let g = dy[((b * oh + oy) * ow + ox) * oc + co];
                                let wv = w[((fy * fw + fx) * ic + ci) * oc + co];
                                dx[((b * h + iy as usize) * wd + ix as usize) * ic + ci] += g * wv;
                            }
                        }
                    }
                }
            }
        }
    }
    dx
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "mismatch at {i}: got {a}, expected {e}"
        );
    }
}
