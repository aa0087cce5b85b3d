use serde::{Deserialize, Serialize};

/// Lock-monitor thresholds, clamped the way `init_py_gil_interceptor` clamps
/// its four integer arguments before anything is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMonitorConfig {
    pub acquire_warning_ms: u32,
    pub hold_warning_ms: u32,
    pub stat_interval_s: u32,
    pub max_stat_threads: u32,
}

impl Default for LockMonitorConfig {
    fn default() -> Self {
        LockMonitorConfig {
            acquire_warning_ms: 10,
            hold_warning_ms: 10,
            stat_interval_s: 5,
            max_stat_threads: 500,
        }
    }
}

impl LockMonitorConfig {
    /// Build a config from raw, caller-supplied (possibly nonsensical)
    /// integers, applying the same clamps as the original interceptor entry
    /// point: non-positive thresholds fall back to their default, the
    /// interval is forced to at least 1s, and the thread cap is capped at
    /// 1000.
    pub fn from_raw(
        acquire_warning_ms: i32,
        hold_warning_ms: i32,
        stat_interval_s: i32,
        max_stat_threads: i32,
    ) -> Self {
        let defaults = Self::default();
        LockMonitorConfig {
            acquire_warning_ms: if acquire_warning_ms > 0 {
                acquire_warning_ms as u32
            } else {
                defaults.acquire_warning_ms
            },
            hold_warning_ms: if hold_warning_ms > 0 {
                hold_warning_ms as u32
            } else {
                defaults.hold_warning_ms
            },
            stat_interval_s: if stat_interval_s > 1 {
                stat_interval_s as u32
            } else if stat_interval_s <= 0 {
                defaults.stat_interval_s
            } else {
                1
            },
            max_stat_threads: if max_stat_threads > 0 {
                (max_stat_threads as u32).min(1000)
            } else {
                defaults.max_stat_threads
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_interceptor_defaults() {
        assert_eq!(LockMonitorConfig::default().acquire_warning_ms, 10);
        assert_eq!(LockMonitorConfig::default().stat_interval_s, 5);
        assert_eq!(LockMonitorConfig::default().max_stat_threads, 500);
    }

    #[test]
    fn interval_of_exactly_one_is_kept_not_defaulted() {
        let cfg = LockMonitorConfig::from_raw(10, 10, 1, 500);
        assert_eq!(cfg.stat_interval_s, 1);
    }

    #[test]
    fn negative_interval_falls_back_to_default() {
        let cfg = LockMonitorConfig::from_raw(10, 10, -3, 500);
        assert_eq!(cfg.stat_interval_s, 5);
    }

    #[test]
    fn oversized_thread_cap_is_clamped() {
        let cfg = LockMonitorConfig::from_raw(10, 10, 5, 5000);
        assert_eq!(cfg.max_stat_threads, 1000);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = LockMonitorConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: LockMonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
