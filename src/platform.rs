// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host platform detection.
//!
//! llama.cpp release assets encode the target in their file name
//! (`llama-b6780-bin-ubuntu-x64.zip`, `llama-b6780-bin-win-cpu-x64.zip`,
//! `llama-b6780-bin-macos-arm64.zip`). This module maps the running host onto
//! the tokens used in those names.

use std::fmt;

/// Base name of the managed executable.
pub const SERVER_BINARY_STEM: &str = "llama-server";

/// Operating system family, as far as release assets care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
    MacOs,
    /// Anything else; no release asset will match.
    Other,
}

impl OsFamily {
    /// Detect the OS this binary was compiled for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => OsFamily::Windows,
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            _ => OsFamily::Other,
        }
    }

    /// Name tokens that identify this OS in an asset name.
    pub fn tokens(&self) -> &'static [&'static str] {
        match self {
            OsFamily::Windows => &["win"],
            OsFamily::Linux => &["ubuntu", "linux"],
            OsFamily::MacOs => &["macos"],
            OsFamily::Other => &[],
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Windows => write!(f, "win"),
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Other => write!(f, "{}", std::env::consts::OS),
        }
    }
}

/// CPU architecture, as far as release assets care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X64,
    Arm64,
    /// Not determinable from asset names; only the OS filter applies.
    Unknown,
}

impl Arch {
    /// Detect the architecture this binary was compiled for.
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Arch::X64,
            "aarch64" => Arch::Arm64,
            _ => Arch::Unknown,
        }
    }

    /// Name tokens that identify this architecture in an asset name.
    pub fn tokens(&self) -> &'static [&'static str] {
        match self {
            Arch::X64 => &["x64", "x86_64", "amd64"],
            Arch::Arm64 => &["arm64", "aarch64"],
            Arch::Unknown => &[],
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X64 => write!(f, "x64"),
            Arch::Arm64 => write!(f, "arm64"),
            Arch::Unknown => write!(f, "{}", std::env::consts::ARCH),
        }
    }
}

/// The OS/architecture pair used to filter release assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: OsFamily,
    pub arch: Arch,
}

impl HostPlatform {
    pub fn new(os: OsFamily, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// The platform this process is running on.
    pub fn current() -> Self {
        Self::new(OsFamily::current(), Arch::current())
    }

    /// Whether a lower-cased asset name targets this platform.
    ///
    /// The OS token is mandatory. The architecture token is only required
    /// when the host architecture is one the release index names.
    pub fn matches(&self, lowercase_name: &str) -> bool {
        let os_ok = self.os.tokens().iter().any(|t| contains_token(lowercase_name, t));
        if !os_ok {
            return false;
        }
        let arch_tokens = self.arch.tokens();
        arch_tokens.is_empty() || arch_tokens.iter().any(|t| contains_token(lowercase_name, t))
    }

    /// File name of the server executable on this platform.
    pub fn executable_name(&self) -> String {
        match self.os {
            OsFamily::Windows => format!("{}.exe", SERVER_BINARY_STEM),
            _ => SERVER_BINARY_STEM.to_string(),
        }
    }
}

/// `token` appears in `name` bounded by `-`, `_`, `.` or the ends, so
/// `win` matches `bin-win-cpu` but not `darwin`.
fn contains_token(name: &str, token: &str) -> bool {
    let is_delim = |c: char| matches!(c, '-' | '_' | '.');
    name.match_indices(token).any(|(start, _)| {
        let end = start + token.len();
        let before_ok = name[..start].chars().next_back().map_or(true, is_delim);
        let after_ok = name[end..].chars().next().map_or(true, is_delim);
        before_ok && after_ok
    })
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_accepts_ubuntu_and_linux_tokens() {
        let host = HostPlatform::new(OsFamily::Linux, Arch::X64);
        assert!(host.matches("llama-b6780-bin-ubuntu-x64.zip"));
        assert!(host.matches("llama-b6780-bin-linux-x86_64.tar.gz"));
        assert!(!host.matches("llama-b6780-bin-ubuntu-arm64.zip"));
        assert!(!host.matches("llama-b6780-bin-win-cpu-x64.zip"));
    }

    #[test]
    fn test_tokens_must_be_delimited() {
        let windows = HostPlatform::new(OsFamily::Windows, Arch::X64);
        assert!(windows.matches("llama-b6780-bin-win-cpu-x64.zip"));
        assert!(!windows.matches("llama-b6780-bin-darwin-x64.tar.gz"));
        assert!(!windows.matches("llama-b6780-bin-winx-x64.zip"));

        let linux = HostPlatform::new(OsFamily::Linux, Arch::X64);
        assert!(linux.matches("llama_b1_linux_x86_64.tar.gz"));
        assert!(!linux.matches("llama-b1-bin-ubuntu-x645.zip"));
    }

    #[test]
    fn test_unknown_arch_only_filters_os() {
        let host = HostPlatform::new(OsFamily::MacOs, Arch::Unknown);
        assert!(host.matches("llama-b6780-bin-macos-arm64.zip"));
        assert!(host.matches("llama-b6780-bin-macos-x64.zip"));
        assert!(!host.matches("llama-b6780-bin-ubuntu-x64.zip"));
    }

    #[test]
    fn test_other_os_matches_nothing() {
        let host = HostPlatform::new(OsFamily::Other, Arch::X64);
        assert!(!host.matches("llama-b6780-bin-ubuntu-x64.zip"));
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(
            HostPlatform::new(OsFamily::Windows, Arch::X64).executable_name(),
            "llama-server.exe"
        );
        assert_eq!(
            HostPlatform::new(OsFamily::Linux, Arch::Arm64).executable_name(),
            "llama-server"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(HostPlatform::new(OsFamily::Windows, Arch::Arm64).to_string(), "win-arm64");
    }
}
