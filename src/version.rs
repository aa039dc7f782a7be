//! Version and build information
//!
//! Values are embedded by `build.rs` at compile time.

use std::fmt;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub name: &'static str,
    /// Git commit hash (short)
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    /// "true", "false" or "unknown"
    git_dirty_str: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple (e.g., x86_64-unknown-linux-gnu)
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
    pub rustc_version: &'static str,
    pub host: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            name: env!("CARGO_PKG_NAME"),
            git_hash: env!("PERSONA_RELAY_GIT_HASH"),
            git_branch: env!("PERSONA_RELAY_GIT_BRANCH"),
            git_dirty_str: env!("PERSONA_RELAY_GIT_DIRTY"),
            build_timestamp: env!("PERSONA_RELAY_BUILD_TIMESTAMP"),
            target: env!("PERSONA_RELAY_TARGET"),
            profile: env!("PERSONA_RELAY_PROFILE"),
            rustc_version: env!("PERSONA_RELAY_RUSTC_VERSION"),
            host: env!("PERSONA_RELAY_HOST"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty_str == "true"
    }

    /// Full version string (e.g., "0.1.0-abc1234" or "0.1.0-abc1234-dirty")
    pub fn full_version(&self) -> String {
        if self.git_dirty() {
            format!("{}-{}-dirty", self.version, self.git_hash)
        } else {
            format!("{}-{}", self.version, self.git_hash)
        }
    }

    /// User-Agent header sent to the completion service and seed source
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.name, self.full_version())
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(f, "  Git Hash:   {}{}", self.git_hash, if self.git_dirty() { " (dirty)" } else { "" })?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f)?;
        writeln!(f, "Target:")?;
        writeln!(f, "  Triple:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f)?;
        writeln!(f, "Compiler:")?;
        writeln!(f, "  {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_contains_hash() {
        let info = build_info();
        let full = info.full_version();
        assert!(full.starts_with(info.version));
        assert!(full.contains(info.git_hash));
    }

    #[test]
    fn test_user_agent() {
        let info = build_info();
        assert!(info.user_agent().starts_with("persona-relay/"));
    }

    #[test]
    fn test_display_format() {
        let display = build_info().to_string();
        assert!(display.contains("Version:"));
        assert!(display.contains("Git Hash:"));
        assert!(display.contains("Target:"));
    }
}
