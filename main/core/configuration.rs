use serde::{Deserialize, Serialize};

/// Options controlling a [`Runtime`](crate::host::runtime::Runtime) instance.
///
/// All fields have defaults so that an embedder can start from
/// `RuntimeOptions::default()` and override selectively, or deserialize a
/// partial YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Allow cages to reach the host filesystem. When false, every
    /// path-based operation fails with EACCES.
    #[serde(default = "default_bypass_acl")]
    pub bypass_acl: bool,

    /// Report clock values at full resolution. When false, times are
    /// coarsened to 10 microseconds.
    #[serde(default)]
    pub high_resolution_timer: Option<bool>,

    /// log2 of the size of each cage's address window.
    #[serde(default = "default_addr_bits")]
    pub addr_bits: u32,

    /// Default stack size for cage threads, in bytes.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Number of slots in the cross-cage pipe set.
    #[serde(default = "default_pipe_slots")]
    pub pipe_slots: usize,

    /// Capacity of each pipe slot buffer, in bytes.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Whether cages may install user exception handlers.
    #[serde(default)]
    pub enable_exception_handling: bool,
}

fn default_bypass_acl() -> bool {
    false
}

fn default_addr_bits() -> u32 {
    // 64 MiB windows; large enough for the data segment, heap growth, and
    // mmap placement in one reservation.
    26
}

fn default_stack_size() -> usize {
    512 * 1024
}

fn default_pipe_slots() -> usize {
    5
}

fn default_pipe_capacity() -> usize {
    65536
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        // An empty document deserializes to all defaults.
        serde_yaml::from_str("{}").unwrap()
    }
}

impl RuntimeOptions {
    /// Parse options from a YAML document. Unknown keys are rejected.
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// The effective high-resolution-timer flag. Unless configured
    /// explicitly it follows `bypass_acl`, matching the behaviour of the
    /// trusted-debug builds this runtime descends from.
    pub fn high_resolution_timer_enabled(&self) -> bool {
        self.high_resolution_timer.unwrap_or(self.bypass_acl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RuntimeOptions::default();
        assert!(!opts.bypass_acl);
        assert_eq!(opts.addr_bits, 26);
        assert_eq!(opts.pipe_slots, 5);
        assert!(!opts.high_resolution_timer_enabled());
    }

    #[test]
    fn test_partial_yaml() {
        let opts = RuntimeOptions::from_yaml_str("bypass_acl: true\naddr_bits: 24\n").unwrap();
        assert!(opts.bypass_acl);
        assert_eq!(opts.addr_bits, 24);
        // follows bypass_acl when not set explicitly
        assert!(opts.high_resolution_timer_enabled());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(RuntimeOptions::from_yaml_str("no_such_option: 3\n").is_err());
    }
}
