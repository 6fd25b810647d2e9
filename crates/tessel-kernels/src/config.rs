use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub const MAX_INVOCATIONS_PER_WORKGROUP: u32 = 256;
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;
pub const MAX_WORKGROUP_STORAGE_BYTES: u32 = 16_384;
pub const ELEMENTWISE_WORKGROUP_SIZE: u32 = 64;
pub const ELEMENTWISE_WORK_PER_THREAD: u32 = 4;
pub const REDUCTION_MAX_WORKGROUP: u32 = 256;
pub const REDUCTION_MIN_WORKGROUP: u32 = 32;

/// Device capabilities the planner must respect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    pub max_invocations_per_workgroup: u32,
    pub max_workgroup_size: [u32; 3],
    pub max_workgroups_per_dimension: u32,
    pub max_workgroup_storage_bytes: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_invocations_per_workgroup: MAX_INVOCATIONS_PER_WORKGROUP,
            max_workgroup_size: [256, 256, 64],
            max_workgroups_per_dimension: MAX_WORKGROUPS_PER_DIMENSION,
            max_workgroup_storage_bytes: MAX_WORKGROUP_STORAGE_BYTES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub limits: DeviceLimits,
    pub elementwise_workgroup: u32,
    pub elementwise_work_per_thread: u32,
    pub reduction_max_workgroup: u32,
    pub disable_vec4: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            elementwise_workgroup: ELEMENTWISE_WORKGROUP_SIZE,
            elementwise_work_per_thread: ELEMENTWISE_WORK_PER_THREAD,
            reduction_max_workgroup: REDUCTION_MAX_WORKGROUP,
            disable_vec4: false,
        }
    }
}

static GLOBAL_CONFIG: Lazy<PlannerConfig> = Lazy::new(PlannerConfig::from_env);

impl PlannerConfig {
    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static PlannerConfig {
        &GLOBAL_CONFIG
    }

    /// Defaults overridden by `TESSEL_WG`, `TESSEL_WORK_PER_THREAD`,
    /// `TESSEL_REDUCTION_WG` and `TESSEL_DISABLE_VEC4`.
    pub fn from_env() -> Self {
        let mut config = PlannerConfig::default();
        if let Some(wg) = env_u32("TESSEL_WG") {
            config.elementwise_workgroup = config.sanitize_linear_workgroup(wg);
        }
        if let Some(wpt) = env_u32("TESSEL_WORK_PER_THREAD") {
            config.elementwise_work_per_thread = wpt.clamp(1, 16);
        }
        if let Some(wg) = env_u32("TESSEL_REDUCTION_WG") {
            config.reduction_max_workgroup = config.sanitize_linear_workgroup(wg);
        }
        if let Ok(raw) = std::env::var("TESSEL_DISABLE_VEC4") {
            match parse_bool(&raw) {
                Some(flag) => config.disable_vec4 = flag,
                None => log::warn!("ignoring TESSEL_DISABLE_VEC4={raw:?}: expected a boolean"),
            }
        }
        config
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self.elementwise_workgroup = self.sanitize_linear_workgroup(self.elementwise_workgroup);
        self.reduction_max_workgroup = self.sanitize_linear_workgroup(self.reduction_max_workgroup);
        self
    }

    pub fn with_vec4_disabled(mut self, disabled: bool) -> Self {
        self.disable_vec4 = disabled;
        self
    }

    /// Clamp a 1-D workgroup request to the device ceiling, floored to a power of two.
    pub fn sanitize_linear_workgroup(&self, requested: u32) -> u32 {
        let max_dim = self.limits.max_workgroup_size[0].max(1);
        let max_inv = self.limits.max_invocations_per_workgroup.max(1);
        clamp_linear_workgroup(requested, max_dim, max_inv)
    }
}

fn env_u32(var: &str) -> Option<u32> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            log::warn!("ignoring {var}={raw:?}: expected a positive integer");
            None
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn clamp_linear_workgroup(requested: u32, max_dim: u32, max_inv: u32) -> u32 {
    let allowed_max = max_dim.min(max_inv).max(1);
    floor_power_of_two(requested.max(1).min(allowed_max))
}

pub(crate) fn floor_power_of_two(value: u32) -> u32 {
    if value == 0 {
        return 1;
    }
    1 << (31 - value.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_floors_to_power_of_two_within_ceiling() {
        let config = PlannerConfig::default();
        assert_eq!(config.sanitize_linear_workgroup(100), 64);
        assert_eq!(config.sanitize_linear_workgroup(4096), 256);
        assert_eq!(config.sanitize_linear_workgroup(1), 1);
        assert_eq!(config.sanitize_linear_workgroup(33), 32);
        assert_eq!(config.sanitize_linear_workgroup(16), 16);
        assert_eq!(config.sanitize_linear_workgroup(24), 16);
        assert_eq!(config.sanitize_linear_workgroup(2), 2);
    }

    #[test]
    fn tighter_limits_shrink_defaults() {
        let limits = DeviceLimits {
            max_invocations_per_workgroup: 128,
            ..DeviceLimits::default()
        };
        let config = PlannerConfig {
            reduction_max_workgroup: 256,
            ..PlannerConfig::default()
        }
        .with_limits(limits);
        assert_eq!(config.reduction_max_workgroup, 128);
        assert_eq!(config.elementwise_workgroup, 64);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: PlannerConfig =
            serde_json::from_str(r#"{ "disable_vec4": true }"#).expect("parse config");
        assert!(config.disable_vec4);
        assert_eq!(config.elementwise_workgroup, ELEMENTWISE_WORKGROUP_SIZE);
        assert_eq!(config.limits, DeviceLimits::default());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
