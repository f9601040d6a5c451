//! Environment-driven JIT configuration.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Calls before a function becomes a compile candidate.
pub const DEFAULT_HOT_THRESHOLD: u32 = 1000;

/// Typed view of the `OTTER_*` JIT switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitConfig {
    /// `OTTER_DISABLE_JIT` unset.
    pub enabled: bool,
    /// `OTTER_JIT_STATS`: log a JSON stats dump.
    pub stats: bool,
    /// `OTTER_JIT_HOT_THRESHOLD`
    pub hot_threshold: u32,
    /// `OTTER_JIT_CRASH_ON_ERROR`: panic instead of falling back.
    pub crash_on_error: bool,
    /// `OTTER_JIT_DUMP`: log emitted machine code.
    pub dump: bool,
    /// `OTTER_JIT_VERBOSE`: log every compile failure.
    pub verbose: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stats: false,
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            crash_on_error: false,
            dump: false,
            verbose: false,
        }
    }
}

static ENV_CONFIG: OnceLock<JitConfig> = OnceLock::new();

impl JitConfig {
    /// Configuration from the process environment, read once.
    pub fn from_env() -> Self {
        *ENV_CONFIG.get_or_init(|| Self::from_lookup(|name| std::env::var(name).ok()))
    }

    /// Configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| parse_env_truthy(&v));
        Self {
            enabled: !flag("OTTER_DISABLE_JIT"),
            stats: flag("OTTER_JIT_STATS"),
            hot_threshold: lookup("OTTER_JIT_HOT_THRESHOLD")
                .and_then(|v| parse_u32(&v))
                .filter(|threshold| *threshold > 0)
                .unwrap_or(DEFAULT_HOT_THRESHOLD),
            crash_on_error: flag("OTTER_JIT_CRASH_ON_ERROR"),
            dump: flag("OTTER_JIT_DUMP"),
            verbose: flag("OTTER_JIT_VERBOSE"),
        }
    }
}

/// `""`, `0`, `false`, `off` and `no` are false; anything else is true.
pub fn parse_env_truthy(value: &str) -> bool {
    let value = value.trim();
    !matches!(value, "" | "0")
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("off")
        && !value.eq_ignore_ascii_case("no")
}

fn parse_u32(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn config(vars: &[(&str, &str)]) -> JitConfig {
        let vars: FxHashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        JitConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "yes", "ON", " anything "] {
            assert!(parse_env_truthy(v), "{v:?}");
        }
        for v in ["", "0", "false", "FALSE", "off", "No", "  "] {
            assert!(!parse_env_truthy(v), "{v:?}");
        }
    }

    #[test]
    fn empty_environment_is_default() {
        assert_eq!(config(&[]), JitConfig::default());
    }

    #[test]
    fn switches_and_threshold() {
        let c = config(&[
            ("OTTER_DISABLE_JIT", "1"),
            ("OTTER_JIT_HOT_THRESHOLD", " 25 "),
            ("OTTER_JIT_DUMP", "on"),
            ("OTTER_JIT_VERBOSE", "off"),
        ]);
        assert!(!c.enabled);
        assert_eq!(c.hot_threshold, 25);
        assert!(c.dump);
        assert!(!c.verbose);
        assert!(!c.crash_on_error);
    }

    #[test]
    fn bad_threshold_falls_back() {
        assert_eq!(config(&[("OTTER_JIT_HOT_THRESHOLD", "0")]).hot_threshold, DEFAULT_HOT_THRESHOLD);
        assert_eq!(config(&[("OTTER_JIT_HOT_THRESHOLD", "lots")]).hot_threshold, DEFAULT_HOT_THRESHOLD);
    }
}
