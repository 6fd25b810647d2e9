//! Tensor shapes and per-operation output-shape inference.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{KernelError, Result};

/// Ordered tensor extents. The empty shape is a scalar of size 1.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape(SmallVec<[usize; 6]>);

impl TensorShape {
    pub fn new(dims: &[usize]) -> Self {
        Self(SmallVec::from_slice(dims))
    }

    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }

    /// Row-major strides (innermost stride 1).
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.rank()];
        for i in (0..self.rank().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        strides
    }

    pub fn product_of(&self, dims: &[usize]) -> usize {
        dims.iter().map(|&d| self.0[d]).product()
    }

    pub fn with_dim(&self, axis: usize, extent: usize) -> Self {
        let mut dims = self.0.clone();
        dims[axis] = extent;
        Self(dims)
    }
}

impl std::ops::Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.0[index]
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        TensorShape::new(dims)
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        Self(SmallVec::from_vec(dims))
    }
}

impl<const N: usize> From<[usize; N]> for TensorShape {
    fn from(dims: [usize; N]) -> Self {
        TensorShape::new(&dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
}

impl DType {
    pub fn wgsl(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
        }
    }

    pub fn bytes_per_element(self) -> usize {
        4
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Neg,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu,
    Clip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Sigmoid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    ChannelsLast,
    ChannelsFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    Valid,
    Same,
    Explicit {
        top: usize,
        bottom: usize,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub padding: Padding,
    pub data_format: DataFormat,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            dilations: [1, 1],
            padding: Padding::Valid,
            data_format: DataFormat::ChannelsLast,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dTransposeParams {
    pub conv: Conv2dParams,
    /// Full output (input-gradient) shape; derived from the padding when absent.
    pub output_shape: Option<TensorShape>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatMulParams {
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub bias: bool,
    pub activation: Activation,
}

impl Default for MatMulParams {
    fn default() -> Self {
        Self {
            transpose_a: false,
            transpose_b: false,
            bias: false,
            activation: Activation::Linear,
        }
    }
}

/// An operation kind together with its static parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpParams {
    Concat { axis: usize },
    Unary { op: UnaryOp, alpha: f32, min: f32, max: f32 },
    Binary { op: BinaryOp },
    Permute { perm: Vec<usize> },
    Reduce { op: ReduceOp, axes: Vec<usize>, keep_dims: bool },
    MatMul(MatMulParams),
    Conv2d(Conv2dParams),
    Conv2dTranspose(Conv2dTransposeParams),
}

impl OpParams {
    pub fn unary(op: UnaryOp) -> Self {
        OpParams::Unary {
            op,
            alpha: 0.2,
            min: 0.0,
            max: 6.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpParams::Concat { .. } => "concat",
            OpParams::Unary { .. } => "unary",
            OpParams::Binary { .. } => "binary",
            OpParams::Permute { .. } => "permute",
            OpParams::Reduce { .. } => "reduce",
            OpParams::MatMul(_) => "matmul",
            OpParams::Conv2d(_) => "conv2d",
            OpParams::Conv2dTranspose(_) => "conv2d_transpose",
        }
    }
}

/// Derive the output shape of `op` applied to `inputs`.
pub fn compute_output_shape(op: &OpParams, inputs: &[TensorShape]) -> Result<TensorShape> {
    let name = op.name();
    match op {
        OpParams::Concat { axis } => concat_output_shape(inputs, *axis),
        OpParams::Unary { .. } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            Ok(x.clone())
        }
        OpParams::Binary { .. } => {
            let [a, b] = expect_inputs::<2>(name, inputs)?;
            broadcast_shapes(name, a, b)
        }
        OpParams::Permute { perm } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            permute_output_shape(x, perm)
        }
        OpParams::Reduce { axes, keep_dims, .. } => {
            let [x] = expect_inputs::<1>(name, inputs)?;
            reduce_output_shape(x, axes, *keep_dims)
        }
        OpParams::MatMul(params) => {
            if inputs.len() != 2 && !(params.bias && inputs.len() == 3) {
                return Err(KernelError::shape(
                    name,
                    format!("expected 2 operands (3 with bias), got {}", inputs.len()),
                ));
            }
            let out = matmul_output_shape(&inputs[0], &inputs[1], params)?;
            if params.bias {
                let bias = inputs.get(2).ok_or_else(|| {
                    KernelError::shape(name, "bias epilogue requested without a bias operand")
                })?;
                let n = out[out.rank() - 1];
                if bias.size() != n {
                    return Err(KernelError::shape(
                        name,
                        format!("bias {bias} does not match output columns {n}"),
                    ));
                }
            }
            Ok(out)
        }
        OpParams::Conv2d(params) => {
            let [x, w] = expect_inputs::<2>(name, inputs)?;
            Ok(conv2d_info(x, w, params)?.out_shape)
        }
        OpParams::Conv2dTranspose(params) => {
            let [dy, w] = expect_inputs::<2>(name, inputs)?;
            Ok(conv2d_transpose_info(dy, w, params)?.dx_shape)
        }
    }
}

pub(crate) fn expect_inputs<'a, const N: usize>(
    op: &'static str,
    inputs: &'a [TensorShape],
) -> Result<[&'a TensorShape; N]> {
    if inputs.len() != N {
        return Err(KernelError::shape(
            op,
            format!("expected {N} operand(s), got {}", inputs.len()),
        ));
    }
    Ok(std::array::from_fn(|i| &inputs[i]))
}

pub fn concat_output_shape(inputs: &[TensorShape], axis: usize) -> Result<TensorShape> {
    let first = inputs
        .first()
        .ok_or_else(|| KernelError::shape("concat", "no inputs"))?;
    if axis >= first.rank() {
        return Err(KernelError::shape(
            "concat",
            format!("axis {axis} out of range for rank {}", first.rank()),
        ));
    }
    let mut total = 0usize;
    for (i, shape) in inputs.iter().enumerate() {
        if shape.rank() != first.rank() {
            return Err(KernelError::shape(
                "concat",
                format!("input {i} has rank {} but input 0 has rank {}", shape.rank(), first.rank()),
            ));
        }
        for d in 0..shape.rank() {
            if d == axis {
                continue;
            }
            if shape[d] == 0 {
                return Err(KernelError::shape(
                    "concat",
                    format!("input {i} {shape} has a zero extent on non-concat axis {d}"),
                ));
            }
            if shape[d] != first[d] {
                return Err(KernelError::shape(
                    "concat",
                    format!("input {i} {shape} does not match {first} outside axis {axis}"),
                ));
            }
        }
        total += shape[axis];
    }
    Ok(first.with_dim(axis, total))
}

pub fn broadcast_shapes(op: &'static str, a: &TensorShape, b: &TensorShape) -> Result<TensorShape> {
    let rank = a.rank().max(b.rank());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = dim_from_end(a, rank - 1 - i);
        let db = dim_from_end(b, rank - 1 - i);
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(KernelError::shape(
                    op,
                    format!("cannot broadcast {a} with {b} (dimension {i}: {x} vs {y})"),
                ))
            }
        };
    }
    Ok(TensorShape::from(out))
}

fn dim_from_end(shape: &TensorShape, from_end: usize) -> usize {
    if from_end < shape.rank() {
        shape[shape.rank() - 1 - from_end]
    } else {
        1
    }
}

pub fn permute_output_shape(x: &TensorShape, perm: &[usize]) -> Result<TensorShape> {
    if perm.len() != x.rank() {
        return Err(KernelError::shape(
            "permute",
            format!("permutation {perm:?} has length {} but input rank is {}", perm.len(), x.rank()),
        ));
    }
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return Err(KernelError::shape(
                "permute",
                format!("{perm:?} is not a permutation of 0..{}", perm.len()),
            ));
        }
        seen[p] = true;
    }
    Ok(TensorShape::from(perm.iter().map(|&p| x[p]).collect::<Vec<_>>()))
}

pub fn reduce_output_shape(x: &TensorShape, axes: &[usize], keep_dims: bool) -> Result<TensorShape> {
    let mut reduced = vec![false; x.rank()];
    for &axis in axes {
        if axis >= x.rank() || reduced[axis] {
            return Err(KernelError::shape(
                "reduce",
                format!("invalid reduction axes {axes:?} for rank {}", x.rank()),
            ));
        }
        reduced[axis] = true;
    }
    let dims: Vec<usize> = (0..x.rank())
        .filter_map(|d| match (reduced[d], keep_dims) {
            (false, _) => Some(x[d]),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    Ok(TensorShape::from(dims))
}

pub fn matmul_output_shape(a: &TensorShape, b: &TensorShape, params: &MatMulParams) -> Result<TensorShape> {
    if a.rank() < 2 || b.rank() < 2 {
        return Err(KernelError::shape(
            "matmul",
            format!("operands must have rank >= 2, got {a} and {b}"),
        ));
    }
    let (m, k_a) = matrix_dims(a, params.transpose_a);
    let (k_b, n) = matrix_dims(b, params.transpose_b);
    if k_a != k_b {
        return Err(KernelError::shape(
            "matmul",
            format!("inner dimensions differ: {a} has {k_a}, {b} has {k_b}"),
        ));
    }
    let batch_a = TensorShape::new(&a.dims()[..a.rank() - 2]);
    let batch_b = TensorShape::new(&b.dims()[..b.rank() - 2]);
    let batch = broadcast_shapes("matmul", &batch_a, &batch_b)?;
    let mut dims = batch.dims().to_vec();
    dims.push(m);
    dims.push(n);
    Ok(TensorShape::from(dims))
}

/// `(rows, cols)` of the logical matrix stored in the two innermost dims.
pub(crate) fn matrix_dims(shape: &TensorShape, transposed: bool) -> (usize, usize) {
    let r = shape[shape.rank() - 2];
    let c = shape[shape.rank() - 1];
    if transposed {
        (c, r)
    } else {
        (r, c)
    }
}

/// Resolved geometry of a channels-last 2-D convolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dInfo {
    pub in_shape: TensorShape,
    pub filter_shape: TensorShape,
    pub out_shape: TensorShape,
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    /// `[top, left]`
    pub pad: [usize; 2],
}

impl Conv2dInfo {
    pub fn batch(&self) -> usize {
        self.in_shape[0]
    }

    pub fn filter_hw(&self) -> [usize; 2] {
        [self.filter_shape[0], self.filter_shape[1]]
    }

    pub fn effective_filter(&self) -> [usize; 2] {
        effective_filter(self.filter_hw(), self.dilations)
    }
}

fn effective_filter(filter: [usize; 2], dilations: [usize; 2]) -> [usize; 2] {
    [
        filter[0].saturating_sub(1) * dilations[0] + 1,
        filter[1].saturating_sub(1) * dilations[1] + 1,
    ]
}

fn spatial_dims(shape: &TensorShape, format: DataFormat) -> (usize, usize, usize, usize) {
    match format {
        DataFormat::ChannelsLast => (shape[0], shape[1], shape[2], shape[3]),
        DataFormat::ChannelsFirst => (shape[0], shape[2], shape[3], shape[1]),
    }
}

fn nhwc_or_nchw(format: DataFormat, n: usize, h: usize, w: usize, c: usize) -> TensorShape {
    match format {
        DataFormat::ChannelsLast => TensorShape::from([n, h, w, c]),
        DataFormat::ChannelsFirst => TensorShape::from([n, c, h, w]),
    }
}

fn check_conv_params(op: &'static str, params: &Conv2dParams) -> Result<()> {
    if params.strides.iter().any(|&s| s == 0) {
        return Err(KernelError::shape(op, format!("strides {:?} must be positive", params.strides)));
    }
    if params.dilations.iter().any(|&d| d == 0) {
        return Err(KernelError::shape(
            op,
            format!("dilations {:?} must be positive", params.dilations),
        ));
    }
    Ok(())
}

fn check_filter(op: &'static str, w: &TensorShape) -> Result<()> {
    if w.dims().contains(&0) {
        return Err(KernelError::shape(op, format!("filter {w} has an empty extent")));
    }
    Ok(())
}

/// Output size and leading pad along one spatial axis.
fn conv_axis(
    op: &'static str,
    input: usize,
    eff_filter: usize,
    stride: usize,
    padding: Padding,
    axis: usize,
) -> Result<(usize, usize)> {
    let (out, pad_before) = match padding {
        Padding::Valid => {
            if input < eff_filter {
                (0, 0)
            } else {
                ((input - eff_filter) / stride + 1, 0)
            }
        }
        Padding::Same => {
            let out = input.div_ceil(stride);
            let needed = ((out.max(1) - 1) * stride + eff_filter).saturating_sub(input);
            (out, needed / 2)
        }
        Padding::Explicit {
            top,
            bottom,
            left,
            right,
        } => {
            let (before, after) = if axis == 0 { (top, bottom) } else { (left, right) };
            let padded = input + before + after;
            if padded < eff_filter {
                (0, before)
            } else {
                ((padded - eff_filter) / stride + 1, before)
            }
        }
    };
    if out == 0 {
        return Err(KernelError::shape(
            op,
            format!("spatial axis {axis} of extent {input} yields an empty output with filter extent {eff_filter}"),
        ));
    }
    Ok((out, pad_before))
}

pub fn conv2d_info(x: &TensorShape, w: &TensorShape, params: &Conv2dParams) -> Result<Conv2dInfo> {
    let op = "conv2d";
    check_conv_params(op, params)?;
    if x.rank() != 4 || w.rank() != 4 {
        return Err(KernelError::shape(op, format!("expected 4-D input and filter, got {x} and {w}")));
    }
    check_filter(op, w)?;
    let (n, h, wd, c) = spatial_dims(x, params.data_format);
    if w[2] != c {
        return Err(KernelError::shape(
            op,
            format!("filter {w} expects {} input channels but input {x} has {c}", w[2]),
        ));
    }
    let eff = effective_filter([w[0], w[1]], params.dilations);
    let (out_h, pad_top) = conv_axis(op, h, eff[0], params.strides[0], params.padding, 0)?;
    let (out_w, pad_left) = conv_axis(op, wd, eff[1], params.strides[1], params.padding, 1)?;
    Ok(Conv2dInfo {
        in_shape: x.clone(),
        filter_shape: w.clone(),
        out_shape: nhwc_or_nchw(params.data_format, n, out_h, out_w, w[3]),
        strides: params.strides,
        dilations: params.dilations,
        pad: [pad_top, pad_left],
    })
}

/// Geometry of a transposed convolution: `dy` is the forward output, `dx` the forward input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dTransposeInfo {
    pub dy_shape: TensorShape,
    pub filter_shape: TensorShape,
    pub dx_shape: TensorShape,
    pub forward: Conv2dInfo,
}

pub fn conv2d_transpose_info(
    dy: &TensorShape,
    w: &TensorShape,
    params: &Conv2dTransposeParams,
) -> Result<Conv2dTransposeInfo> {
    let op = "conv2d_transpose";
    let conv = &params.conv;
    check_conv_params(op, conv)?;
    if dy.rank() != 4 || w.rank() != 4 {
        return Err(KernelError::shape(op, format!("expected 4-D input and filter, got {dy} and {w}")));
    }
    check_filter(op, w)?;
    let (n, out_h, out_w, dy_c) = spatial_dims(dy, conv.data_format);
    if out_h == 0 || out_w == 0 {
        return Err(KernelError::shape(op, format!("input {dy} has an empty spatial extent")));
    }
    if w[3] != dy_c {
        return Err(KernelError::shape(
            op,
            format!("filter {w} produces {} channels but the input {dy} has {dy_c}", w[3]),
        ));
    }
    let dx_shape = match &params.output_shape {
        Some(shape) => shape.clone(),
        None => {
            let eff = effective_filter([w[0], w[1]], conv.dilations);
            let derive = |out: usize, eff: usize, stride: usize, before: usize, after: usize| {
                ((out - 1) * stride + eff).checked_sub(before + after)
            };
            let (h, wd) = match conv.padding {
                Padding::Valid => (
                    derive(out_h, eff[0], conv.strides[0], 0, 0),
                    derive(out_w, eff[1], conv.strides[1], 0, 0),
                ),
                Padding::Same => (Some(out_h * conv.strides[0]), Some(out_w * conv.strides[1])),
                Padding::Explicit {
                    top,
                    bottom,
                    left,
                    right,
                } => (
                    derive(out_h, eff[0], conv.strides[0], top, bottom),
                    derive(out_w, eff[1], conv.strides[1], left, right),
                ),
            };
            match (h, wd) {
                (Some(h), Some(wd)) if h > 0 && wd > 0 => {
                    nhwc_or_nchw(conv.data_format, n, h, wd, w[2])
                }
                _ => {
                    return Err(KernelError::shape(
                        op,
                        format!("padding {:?} leaves no output for input {dy}", conv.padding),
                    ))
                }
            }
        }
    };
    if dx_shape.rank() != 4 {
        return Err(KernelError::shape(op, format!("output shape {dx_shape} must be 4-D")));
    }
    let forward = conv2d_info(&dx_shape, w, conv)
        .map_err(|err| KernelError::shape(op, format!("output shape {dx_shape} is not consistent: {err}")))?;
    if forward.out_shape != *dy {
        return Err(KernelError::shape(
            op,
            format!(
                "a forward convolution of {dx_shape} produces {}, not the input {dy}",
                forward.out_shape
            ),
        ));
    }
    Ok(Conv2dTransposeInfo {
        dy_shape: dy.clone(),
        filter_shape: w.clone(),
        dx_shape,
        forward,
    })
}
