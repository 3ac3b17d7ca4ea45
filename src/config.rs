//! Mount-time configuration.

use std::path::PathBuf;

/// Tunables a driver process chooses at mount time. Not an on-disk
/// structure; purely in-memory, process-local configuration.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Path to the backing file or block device.
    pub path: PathBuf,
    /// Open the backing file read-only. The file descriptor itself carries
    /// the restriction: any write attempted through the core surfaces as
    /// [`crate::error::Ext4Error::Io`] from the OS, not a separate check.
    pub read_only: bool,
    /// When the allocator finds a group whose free-block count disagrees
    /// with its bitmap (a zero-length run where free blocks were expected),
    /// return [`crate::error::Ext4Error::Corruption`] instead of the
    /// original driver's self-healing log-and-zero behavior.
    pub strict_corruption_checks: bool,
}

impl Default for MountConfig {
    /// Read-write, permissive (log-and-zero) self-healing policy, with an
    /// empty path. Callers still need to set a real path before mounting;
    /// this exists so the tunables have a documented zero-value baseline.
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            read_only: false,
            strict_corruption_checks: false,
        }
    }
}

impl MountConfig {
    /// Build a config for the given path with the default (permissive)
    /// policy, matching the original driver's behavior.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            strict_corruption_checks: false,
        }
    }

    /// Open read-only.
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Opt into strict corruption checking.
    pub fn strict_corruption_checks(mut self, yes: bool) -> Self {
        self.strict_corruption_checks = yes;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_read_write_and_permissive() {
        let config = MountConfig::default();
        assert_eq!(config.path, PathBuf::new());
        assert!(!config.read_only);
        assert!(!config.strict_corruption_checks);
    }

    #[test]
    fn builder_methods_override_the_defaults() {
        let config = MountConfig::new("/tmp/image.img")
            .read_only(true)
            .strict_corruption_checks(true);
        assert!(config.read_only);
        assert!(config.strict_corruption_checks);
    }
}
