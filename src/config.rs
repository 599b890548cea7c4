//! Runtime configuration for the core substrate.
//!
//! Mirrors the donor crate's flat `NetConfig` struct: plain data, `Clone`+`Debug`,
//! constructed once at startup and threaded through by reference.

use serde::{Deserialize, Serialize};

/// Feature-flag-equivalent thresholds for the IPcheck connection-rate defense and
/// the engine's failure handling. Field defaults match §4.6.2 / §4.5.7 of the design
/// doc (`IPCHECK_CLONE_LIMIT` etc. in the original `ircd.conf` feature table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Max recent connection attempts per canonicalized address before throttling.
    pub ipcheck_clone_limit: u32,
    /// Window, in seconds, over which `ipcheck_clone_limit` attempts are counted.
    pub ipcheck_clone_period: u64,
    /// Same pair, for the IPv6 /48 aggregate tier.
    pub ipcheck_48_clone_limit: u32,
    pub ipcheck_48_clone_period: u64,
    /// Grace period after startup during which IPcheck throttling is disabled.
    pub ipcheck_clone_delay: u64,
    /// Initial/maximum free-target credit per address.
    pub start_targets: u8,
    /// Seconds per free-target credit regained.
    pub target_delay: u64,
    /// Upper bound on simultaneously registered sockets, passed to the engine backend.
    pub max_sockets: usize,
    /// Consecutive (hourly-decayed) backend errors before the engine requests restart.
    pub backend_error_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipcheck_clone_limit: 4,
            ipcheck_clone_period: 40,
            ipcheck_48_clone_limit: 4,
            ipcheck_48_clone_period: 40,
            ipcheck_clone_delay: 15,
            start_targets: 10,
            target_delay: 10,
            max_sockets: 4096,
            backend_error_threshold: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_doc() {
        let cfg = Config::default();
        assert_eq!(cfg.ipcheck_clone_limit, 4);
        assert_eq!(cfg.ipcheck_clone_period, 40);
        assert_eq!(cfg.ipcheck_clone_delay, 15);
        assert_eq!(cfg.start_targets, 10);
    }
}
