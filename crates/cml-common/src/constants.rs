// Defaults, environment variable names, return codes and platform values
// shared by every crate in the workspace.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "OSX"),
            OsPlatform::Windows => write!(f, "Windows"),
        }
    }
}

impl OsPlatform {
    /// Platform segment of the GitHub Actions runner tarball name.
    pub fn github_runner_name(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "linux",
            OsPlatform::MacOS => "osx",
            OsPlatform::Windows => "win",
        }
    }

    /// Platform segment of the gitlab-runner binary name.
    pub fn gitlab_runner_name(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "linux",
            OsPlatform::MacOS => "darwin",
            OsPlatform::Windows => "windows",
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X64 => write!(f, "X64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Arm64 => write!(f, "ARM64"),
        }
    }
}

impl Architecture {
    pub fn github_runner_name(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        }
    }

    pub fn gitlab_runner_name(&self) -> &'static str {
        match self {
            Architecture::X64 => "amd64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        }
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;
#[cfg(target_arch = "arm")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm;
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;

// ---------------------------------------------------------------------------
// Runner defaults
// ---------------------------------------------------------------------------

pub mod defaults {
    pub const LABELS: &str = "cml";
    pub const IDLE_TIMEOUT: &str = "5 minutes";
    pub const NAME_PREFIX: &str = "cml-";
    pub const CLOUD_REGION: &str = "us-west";
    pub const CLOUD_SPOT_PRICE: f64 = -1.0;
    pub const DESTROY_DELAY_SECS: u64 = 10;
    /// Directory under `$HOME` holding one working directory per runner name.
    pub const WORKDIR_BASE: &str = ".cml";
    /// Mode applied to a freshly created working directory.
    pub const WORKDIR_MODE: u32 = 0o766;
}

/// Interval at which the idle timer ticks.
pub const IDLE_TICK: Duration = Duration::from_secs(1);

/// Interval at which the long-job watchdog checks the current job's age.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(60);

/// GitHub cancels hosted jobs after 72 hours; restart slightly earlier.
pub const GITHUB_JOB_LIMIT: Duration = Duration::from_secs(72 * 60 * 60 - 5 * 60);

/// Shutdown reason emitted by the long-job watchdog.
pub const GITHUB_JOB_LIMIT_REASON: &str = "timeout:72h";

/// Substring of the unregister error returned while a job is still assigned.
pub const STILL_RUNNING_JOB: &str = "is still running a job";

/// Unix socket published by acpid.
pub const ACPID_SOCKET: &str = "/var/run/acpid.socket";

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub mod variables {
    pub const REPO_TOKEN: &str = "REPO_TOKEN";
    /// Comma-separated override of the sensitive environment deny list.
    pub const SENSITIVE_ENV: &str = "CML_RUNNER_SENSITIVE_ENV";
    /// Default `RUST_LOG`-style filter when none is given.
    pub const LOG_FILTER: &str = "RUST_LOG";

    /// Variables never forwarded to the runner process.
    pub fn default_sensitive_env() -> Vec<String> {
        [
            "REPO_TOKEN",
            "repo_token",
            "CML_TOKEN",
            "GITHUB_TOKEN",
            "GITLAB_TOKEN",
            "BITBUCKET_TOKEN",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Return codes
// ---------------------------------------------------------------------------

pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
}

// ---------------------------------------------------------------------------
// Terraform
// ---------------------------------------------------------------------------

pub mod terraform {
    pub const MIN_VERSION: (u64, u64, u64) = (0, 14, 0);
    pub const MAIN_FILE: &str = "main.tf";
    pub const STATE_FILE: &str = "terraform.tfstate";
    pub const RESOURCE_TYPE: &str = "iterative_cml_runner";
    pub const PROVIDER_SOURCE: &str = "iterative/iterative";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_threshold_is_just_under_72_hours() {
        assert_eq!(GITHUB_JOB_LIMIT.as_secs(), 259_200 - 300);
    }

    #[test]
    fn default_sensitive_env_covers_tokens() {
        let names = variables::default_sensitive_env();
        assert!(names.contains(&"REPO_TOKEN".to_string()));
        assert!(names.contains(&"repo_token".to_string()));
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn platform_names() {
        assert_eq!(OsPlatform::MacOS.github_runner_name(), "osx");
        assert_eq!(Architecture::X64.gitlab_runner_name(), "amd64");
    }
}
