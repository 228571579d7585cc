//! VM configuration.
//!
//! Arena and stack sizing, loadable from an optional `xen.toml` and shown
//! by `xen --vm-config`. The value stack and frame stack are fixed-size at
//! runtime; the arena figures describe the memory regions reserved for the
//! heap's long-lived, per-run and scratch allocations.

use serde::Deserialize;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Memory sizing for one VM instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Long-lived allocations: interned strings, globals, namespaces.
    pub mem_size_permanent: usize,
    /// Allocations scoped to the current execution generation.
    pub mem_size_generation: usize,
    /// Per-expression scratch.
    pub mem_size_temporary: usize,
    /// Value stack reservation.
    pub stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            mem_size_permanent: 64 * MB,
            mem_size_generation: 64 * MB,
            mem_size_temporary: 4 * MB,
            stack_size: KB,
        }
    }
}

impl VmConfig {
    /// Parse a TOML configuration, e.g. the contents of `xen.toml`.
    pub fn from_toml(text: &str) -> Result<VmConfig, String> {
        toml::from_str(text).map_err(|e| format!("invalid VM config: {}", e))
    }
}

/// Scale a byte count to a human-readable magnitude, returning the scaled
/// value and its unit suffix.
pub fn bytes_order_of_magnitude(size: usize) -> (usize, &'static str) {
    if size < KB {
        (size, "bytes")
    } else if size < MB {
        (size / KB, "Kb")
    } else if size < 1024 * MB {
        (size / MB, "Mb")
    } else {
        (size / (1024 * MB), "Gb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.mem_size_permanent, 64 * MB);
        assert_eq!(config.mem_size_temporary, 4 * MB);
        assert_eq!(config.stack_size, KB);
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = VmConfig::from_toml("mem_size_temporary = 1048576").unwrap();
        assert_eq!(config.mem_size_temporary, MB);
        assert_eq!(config.mem_size_permanent, 64 * MB);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(VmConfig::from_toml("mem_size_temporary = \"lots\"").is_err());
    }

    #[test]
    fn test_bytes_order_of_magnitude() {
        assert_eq!(bytes_order_of_magnitude(512), (512, "bytes"));
        assert_eq!(bytes_order_of_magnitude(64 * MB), (64, "Mb"));
        assert_eq!(bytes_order_of_magnitude(KB), (1, "Kb"));
    }
}
