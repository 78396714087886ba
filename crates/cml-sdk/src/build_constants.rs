// Build constants for the `cml` binary, taken from compile-time
// environment variables with defaults.

/// Source control information.
pub struct Source;

impl Source {
    /// Set via the `CML_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("CML_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Package metadata.
#[derive(Debug, Clone)]
pub struct CmlPackage;

impl CmlPackage {
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    pub const PACKAGE_NAME: &'static str = "cml";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!CmlPackage::VERSION.is_empty());
        assert!(!Source::COMMIT_HASH.is_empty());
    }
}
