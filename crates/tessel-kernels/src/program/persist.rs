use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bindings::BindingSchema;
use crate::dispatch::DispatchGeometry;
use crate::error::Result;
use crate::shape::{DType, TensorShape};
use crate::tiling::TilingPlan;

/// Bump when emitted text, binding order or descriptor fields change.
pub const PROGRAM_CACHE_VERSION: u32 = 1;

/// Immutable snapshot of a constructed program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub name: String,
    pub cache_key: String,
    pub hash: u64,
    pub output_shape: TensorShape,
    pub dtype: DType,
    pub geometry: DispatchGeometry,
    pub bindings: BindingSchema,
    pub tiling: Option<TilingPlan>,
    pub layout_tag: String,
    /// Absent in files written before versioning; treated as incompatible.
    pub version: Option<u32>,
}

/// Write `<hash>.json` (and `<hash>.wgsl` when `wgsl` is given) under `dir`.
pub fn persist_program_meta(
    dir: &Path,
    descriptor: &ProgramDescriptor,
    wgsl: Option<&str>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    if let Some(src) = wgsl {
        std::fs::write(dir.join(format!("{:016x}.wgsl", descriptor.hash)), src)?;
    }
    let meta_path = dir.join(format!("{:016x}.json", descriptor.hash));
    let json = serde_json::to_vec_pretty(descriptor)?;
    std::fs::write(&meta_path, json)?;
    log::info!(
        "persisted program '{}' ({:016x}) to {}",
        descriptor.name,
        descriptor.hash,
        meta_path.display()
    );
    Ok(meta_path)
}

/// Read a descriptor back; `None` when it was written by another cache version.
pub fn load_program_meta(path: &Path) -> Result<Option<ProgramDescriptor>> {
    let bytes = std::fs::read(path)?;
    let descriptor: ProgramDescriptor = serde_json::from_slice(&bytes)?;
    if descriptor.version != Some(PROGRAM_CACHE_VERSION) {
        log::debug!(
            "ignoring program metadata {} with version {:?}",
            path.display(),
            descriptor.version
        );
        return Ok(None);
    }
    Ok(Some(descriptor))
}
