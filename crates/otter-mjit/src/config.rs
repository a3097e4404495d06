//! Compiler knobs, read once from the environment.

use std::sync::OnceLock;

/// Default cap on attached specializations per inline cache
pub const DEFAULT_IC_MAX_STUBS: u32 = 4;

static ENV_CONFIG: OnceLock<JitConfig> = OnceLock::new();

/// Switches that select which code the compiler emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    /// Route every operation through its generic stub; no guards, no ICs
    pub generic_only: bool,
    /// Specializations an IC may attach before it goes megamorphic
    pub ic_max_stubs: u32,
    /// Compile compare-and-branch, typeof-compare and inc/dec-pop pairs separately
    pub disable_fusion: bool,
    /// Count executor events in [`crate::machine::ExecStats`]
    pub stats: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            generic_only: false,
            ic_max_stubs: DEFAULT_IC_MAX_STUBS,
            disable_fusion: false,
            stats: false,
        }
    }
}

impl JitConfig {
    /// Configuration from `OTTER_MJIT_*` variables, cached for the process
    pub fn from_env() -> Self {
        *ENV_CONFIG.get_or_init(|| Self {
            generic_only: env_flag("OTTER_MJIT_GENERIC_ONLY"),
            ic_max_stubs: parse_env_u32("OTTER_MJIT_IC_MAX_STUBS")
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_IC_MAX_STUBS),
            disable_fusion: env_flag("OTTER_MJIT_DISABLE_FUSION"),
            stats: env_flag("OTTER_MJIT_STATS"),
        })
    }

    /// Everything through the generic stubs
    pub fn generic() -> Self {
        Self {
            generic_only: true,
            ..Self::default()
        }
    }
}

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

fn env_flag(var_name: &str) -> bool {
    std::env::var(var_name)
        .ok()
        .is_some_and(|v| parse_env_truthy(&v))
}

fn parse_env_u32(var_name: &str) -> Option<u32> {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}
