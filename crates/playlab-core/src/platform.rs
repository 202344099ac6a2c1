use std::fmt;

/// Environment variable selecting contained mode (fixed well-known ports,
/// wildcard probe host). Read once at startup, then threaded down explicitly.
pub const CONTAINED_ENV_VAR: &str = "PLAYLAB_CONTAINED";

/// Where this run executes. Resolved once by the CLI and passed down; nothing
/// below the entry point reads ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    /// Interactive run on a developer machine: ephemeral ports, loopback.
    Local,
    /// Inside a container image: fixed published ports, wildcard bind.
    Contained,
}

impl RuntimeEnvironment {
    pub fn from_env() -> Self {
        match std::env::var(CONTAINED_ENV_VAR) {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => RuntimeEnvironment::Contained,
            _ => RuntimeEnvironment::Local,
        }
    }

    pub fn is_contained(self) -> bool {
        self == RuntimeEnvironment::Contained
    }
}

/// Archive layouts the installer can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

/// Platform-conditional facts, resolved once at startup instead of being
/// re-derived at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub environment: RuntimeEnvironment,
    pub archive_kind: ArchiveKind,
    /// Suffix for launched executables ("" on Unix, ".exe" on Windows).
    pub exe_suffix: &'static str,
    /// Host the readiness probes and printed endpoints use.
    pub probe_host: &'static str,
}

impl PlatformProfile {
    pub fn resolve(environment: RuntimeEnvironment) -> Self {
        PlatformProfile {
            environment,
            archive_kind: if cfg!(windows) {
                ArchiveKind::Zip
            } else {
                ArchiveKind::TarGz
            },
            exe_suffix: if cfg!(windows) { ".exe" } else { "" },
            probe_host: if environment.is_contained() {
                "0.0.0.0"
            } else {
                "127.0.0.1"
            },
        }
    }
}

impl fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEnvironment::Local => write!(f, "local"),
            RuntimeEnvironment::Contained => write!(f, "contained"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_profile_binds_wildcard() {
        let profile = PlatformProfile::resolve(RuntimeEnvironment::Contained);
        assert_eq!(profile.probe_host, "0.0.0.0");
        assert!(profile.environment.is_contained());
    }

    #[test]
    fn local_profile_binds_loopback() {
        let profile = PlatformProfile::resolve(RuntimeEnvironment::Local);
        assert_eq!(profile.probe_host, "127.0.0.1");
        #[cfg(unix)]
        {
            assert_eq!(profile.archive_kind, ArchiveKind::TarGz);
            assert_eq!(profile.exe_suffix, "");
        }
    }
}
