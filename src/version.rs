//! Version information reported by the `--version` flag and startup log
//!
//! The teacher stamps its binary with a build-time git hash via
//! `src/build.rs`; that machinery has no counterpart here (there's no git
//! checkout to introspect in this workspace), so this collapses to the
//! package version `cargo` itself already knows.

/// Version information for the running binary.
pub struct Version {
    /// Version of the package, reported in `Cargo.toml`.
    pkg_version: &'static str,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            pkg_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pkg_version)
    }
}
