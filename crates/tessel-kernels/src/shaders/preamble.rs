//! Helper functions injected ahead of every program body.
//!
//! Shapes are baked in as literals: strides and extents are unrolled into the
//! helpers rather than read from arrays, so a program's text is fully
//! determined by its shapes.

use std::fmt::Write as _;

use crate::bindings::BindingSchema;
use crate::error::{KernelError, Result};
use crate::layout::DispatchLayout;
use crate::shape::TensorShape;

/// Largest rank the coordinate helpers handle.
pub const MAX_SHADER_RANK: usize = 6;

pub fn main_header() -> &'static str {
    "fn kernel_main()"
}

pub fn check_rank(op: &'static str, shape: &TensorShape) -> Result<()> {
    if shape.rank() > MAX_SHADER_RANK {
        return Err(KernelError::unsupported(op, "rank", shape.rank()));
    }
    Ok(())
}

/// A rank-0 tensor is addressed as `[1]`.
pub(crate) fn effective_dims(shape: &TensorShape) -> Vec<usize> {
    if shape.rank() == 0 {
        vec![1]
    } else {
        shape.dims().to_vec()
    }
}

pub fn coord_type(rank: usize) -> String {
    match rank {
        0 | 1 => "i32".to_string(),
        2..=4 => format!("vec{rank}<i32>"),
        _ => format!("array<i32, {rank}>"),
    }
}

pub(crate) fn coord_ctor(rank: usize, parts: &[String]) -> String {
    match rank {
        0 | 1 => parts.first().cloned().unwrap_or_else(|| "0".to_string()),
        _ => format!("{}({})", coord_type(rank), parts.join(", ")),
    }
}

/// Component `d` of a coordinate value named `var`.
pub(crate) fn coord_at(rank: usize, var: &str, d: usize) -> String {
    if rank <= 1 {
        var.to_string()
    } else {
        format!("{var}[{d}]")
    }
}

pub(crate) fn index_fn_name(binding: &str) -> String {
    let mut chars = binding.chars();
    match chars.next() {
        Some(first) => format!("get{}{}Index", first.to_ascii_uppercase(), chars.as_str()),
        None => "getIndex".to_string(),
    }
}

fn strides(dims: &[usize]) -> Vec<usize> {
    TensorShape::new(dims).strides()
}

/// `fn {name}(index: i32) -> Coord`: row-major decode of a flat index.
pub fn coords_from_index_fn(name: &str, dims: &[usize]) -> String {
    let rank = dims.len();
    let ty = coord_type(rank);
    if rank <= 1 {
        return format!("fn {name}(index: i32) -> {ty} {{\n    return index;\n}}\n");
    }
    let strides = strides(dims);
    let mut src = format!("fn {name}(index: i32) -> {ty} {{\n    var rem = index;\n");
    let mut parts = Vec::with_capacity(rank);
    for (d, stride) in strides.iter().enumerate() {
        if d + 1 == rank {
            let _ = writeln!(src, "    let d{d} = rem;");
        } else {
            let _ = writeln!(src, "    let d{d} = rem / {stride};");
            let _ = writeln!(src, "    rem = rem - d{d} * {stride};");
        }
        parts.push(format!("d{d}"));
    }
    let _ = writeln!(src, "    return {};\n}}", coord_ctor(rank, &parts));
    src
}

/// `fn {name}(coords: Coord) -> i32`: row-major flat index of a coordinate.
pub fn index_from_coords_fn(name: &str, dims: &[usize]) -> String {
    let rank = dims.len();
    let ty = coord_type(rank);
    let terms: Vec<String> = strides(dims)
        .iter()
        .enumerate()
        .map(|(d, stride)| match stride {
            1 => coord_at(rank, "coords", d),
            s => format!("{} * {s}", coord_at(rank, "coords", d)),
        })
        .collect();
    format!(
        "fn {name}(coords: {ty}) -> i32 {{\n    return {};\n}}\n",
        terms.join(" + ")
    )
}

pub fn coords_in_bounds_fn(dims: &[usize]) -> String {
    let rank = dims.len();
    let checks: Vec<String> = dims
        .iter()
        .enumerate()
        .map(|(d, extent)| {
            let c = coord_at(rank, "coords", d);
            format!("{c} >= 0 && {c} < {extent}")
        })
        .collect();
    format!(
        "fn coordsInBounds(coords: {}) -> bool {{\n    return {};\n}}\n",
        coord_type(rank),
        checks.join(" && ")
    )
}

/// Output coordinate of the current invocation under `layout`.
///
/// Flat layouts decode the linear global index; otherwise each axis decodes
/// its bucket from `globalId`, the outermost dimension of a bucket keeping the
/// quotient so overflow ids fall out of bounds.
pub fn output_coords_fn(layout: &DispatchLayout, shape: &TensorShape) -> String {
    let dims = effective_dims(shape);
    let rank = dims.len();
    let ty = coord_type(rank);
    if layout.is_flat() || shape.rank() == 0 {
        return format!(
            "fn getOutputCoords() -> {ty} {{\n    return getCoordsFromIndex(getGlobalIndex());\n}}\n"
        );
    }
    let mut src = format!("fn getOutputCoords() -> {ty} {{\n");
    let mut parts = vec![String::from("0"); rank];
    for (axis, bucket) in layout.axes().iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let component = ["x", "y", "z"][axis];
        let var = format!("g{component}");
        let _ = writeln!(src, "    var {var} = i32(globalId.{component});");
        for (pos, &d) in bucket.iter().enumerate().rev() {
            if pos == 0 {
                let _ = writeln!(src, "    let d{d} = {var};");
            } else {
                let _ = writeln!(src, "    let d{d} = {var} % {};", dims[d]);
                let _ = writeln!(src, "    {var} = {var} / {};", dims[d]);
            }
            parts[d] = format!("d{d}");
        }
    }
    let _ = writeln!(src, "    return {};\n}}", coord_ctor(rank, &parts));
    src
}

pub fn builtin_vars() -> &'static str {
    "var<private> localId: vec3<u32>;\n\
     var<private> globalId: vec3<u32>;\n\
     var<private> localIndex: u32;\n\
     var<private> workgroupId: vec3<u32>;\n\
     var<private> numWorkgroups: vec3<u32>;\n"
}

/// Linear workgroup id and linear invocation id; both stay correct when a
/// flat dispatch is folded over y and z.
pub fn global_index_fns(workgroup_size: [u32; 3]) -> String {
    let invocations: u32 = workgroup_size.iter().product();
    format!(
        "fn getWorkgroupIndex() -> i32 {{\n    \
         return i32(workgroupId.z * numWorkgroups.x * numWorkgroups.y + workgroupId.y * numWorkgroups.x + workgroupId.x);\n\
         }}\n\n\
         fn getGlobalIndex() -> i32 {{\n    \
         return getWorkgroupIndex() * {invocations} + i32(localIndex);\n\
         }}\n"
    )
}

pub fn shape_constants(bindings: &BindingSchema) -> String {
    let mut src = format!("const outSize: i32 = {};\n", bindings.output.shape.size());
    for input in &bindings.inputs {
        let _ = writeln!(src, "const {}Size: i32 = {};", input.name, input.shape.size());
    }
    src
}

pub fn entry_point(workgroup_size: [u32; 3]) -> String {
    format!(
        "@compute @workgroup_size({}, {}, {})\n\
         fn main(\n    \
         @builtin(local_invocation_id) lid: vec3<u32>,\n    \
         @builtin(global_invocation_id) gid: vec3<u32>,\n    \
         @builtin(local_invocation_index) lidx: u32,\n    \
         @builtin(workgroup_id) wid: vec3<u32>,\n    \
         @builtin(num_workgroups) nwg: vec3<u32>,\n\
         ) {{\n    \
         localId = lid;\n    \
         globalId = gid;\n    \
         localIndex = lidx;\n    \
         workgroupId = wid;\n    \
         numWorkgroups = nwg;\n    \
         kernel_main();\n\
         }}\n",
        workgroup_size[0], workgroup_size[1], workgroup_size[2]
    )
}
