mod common;

use std::sync::Arc;

use common::{init_logging, shape};
use tessel_kernels::program::persist::{load_program_meta, persist_program_meta, PROGRAM_CACHE_VERSION};
use tessel_kernels::{
    construct, make_shader, program_hash, DType, OpParams, PlannerConfig, ProgramRegistry,
    ReduceOp,
};

#[test]
fn descriptor_round_trips_through_disk() {
    init_logging();
    let program = construct(
        &OpParams::Reduce {
            op: ReduceOp::Mean,
            axes: vec![1],
            keep_dims: true,
        },
        &[shape(&[8, 40])],
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("reduce");
    let descriptor = program.descriptor();
    assert_eq!(descriptor.hash, program_hash(program.cache_key()));
    assert_eq!(descriptor.version, Some(PROGRAM_CACHE_VERSION));

    let dir = tempfile::tempdir().expect("tempdir");
    let src = make_shader(program.as_ref());
    let path = persist_program_meta(dir.path(), &descriptor, Some(&src)).expect("persist");
    assert!(path.with_extension("wgsl").exists());
    let loaded = load_program_meta(&path).expect("load").expect("current version");
    assert_eq!(loaded, descriptor);
}

#[test]
fn stale_versions_are_ignored() {
    let program = construct(
        &OpParams::Concat { axis: 0 },
        &[shape(&[2]), shape(&[3])],
        DType::F32,
        &PlannerConfig::default(),
    )
    .expect("concat");
    let mut descriptor = program.descriptor();
    descriptor.version = None;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = persist_program_meta(dir.path(), &descriptor, None).expect("persist");
    assert!(load_program_meta(&path).expect("load").is_none());
}

#[test]
fn registry_reuses_artifacts_by_key() {
    let registry: ProgramRegistry<Arc<String>> = ProgramRegistry::new();
    let config = PlannerConfig::default();
    for _ in 0..3 {
        for rows in [4, 8] {
            let program = construct(
                &OpParams::Concat { axis: 0 },
                &[shape(&[rows, 3]), shape(&[2, 3])],
                DType::F32,
                &config,
            )
            .expect("concat");
            let compiled = registry
                .get_or_insert_with::<std::convert::Infallible>(program.cache_key(), || {
                    Ok(Arc::new(make_shader(program.as_ref())))
                })
                .expect("infallible");
            assert!(compiled.contains("kernel_main"));
        }
    }
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.counters(), (4, 2));
}
