mod common;

use std::sync::Mutex;

use common::init_logging;
use once_cell::sync::Lazy;
use tessel_kernels::config::{ELEMENTWISE_WORKGROUP_SIZE, ELEMENTWISE_WORK_PER_THREAD, REDUCTION_MAX_WORKGROUP};
use tessel_kernels::PlannerConfig;

static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const VARS: [&str; 4] = [
    "TESSEL_WG",
    "TESSEL_WORK_PER_THREAD",
    "TESSEL_REDUCTION_WG",
    "TESSEL_DISABLE_VEC4",
];

fn with_env(vars: &[(&str, &str)], check: impl FnOnce()) {
    let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for var in VARS {
        std::env::remove_var(var);
    }
    for (var, value) in vars {
        std::env::set_var(var, value);
    }
    check();
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn overrides_are_sanitised() {
    init_logging();
    with_env(
        &[
            ("TESSEL_WG", "100"),
            ("TESSEL_WORK_PER_THREAD", "64"),
            ("TESSEL_REDUCTION_WG", "5000"),
            ("TESSEL_DISABLE_VEC4", "yes"),
        ],
        || {
            let config = PlannerConfig::from_env();
            assert_eq!(config.elementwise_workgroup, 64);
            assert_eq!(config.elementwise_work_per_thread, 16);
            assert_eq!(config.reduction_max_workgroup, 256);
            assert!(config.disable_vec4);
        },
    );
}

#[test]
fn small_workgroup_override_survives() {
    with_env(&[("TESSEL_WG", "16")], || {
        assert_eq!(PlannerConfig::from_env().elementwise_workgroup, 16);
    });
}

#[test]
fn malformed_overrides_are_ignored() {
    init_logging();
    with_env(
        &[
            ("TESSEL_WG", "wide"),
            ("TESSEL_WORK_PER_THREAD", "0"),
            ("TESSEL_REDUCTION_WG", "-8"),
            ("TESSEL_DISABLE_VEC4", "maybe"),
        ],
        || {
            assert_eq!(PlannerConfig::from_env(), PlannerConfig::default());
        },
    );
}

#[test]
fn global_config_reads_environment_once() {
    with_env(&[("TESSEL_REDUCTION_WG", "64")], || {
        let global = PlannerConfig::global();
        assert_eq!(global.reduction_max_workgroup, 64);
        assert_eq!(global.elementwise_workgroup, ELEMENTWISE_WORKGROUP_SIZE);
        assert_eq!(global.elementwise_work_per_thread, ELEMENTWISE_WORK_PER_THREAD);
    });
    with_env(&[], || {
        assert_eq!(PlannerConfig::global().reduction_max_workgroup, 64);
        assert_eq!(PlannerConfig::from_env().reduction_max_workgroup, REDUCTION_MAX_WORKGROUP);
    });
}
