//! Environment fingerprint stored in every saved model.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use sysinfo::System;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// The runtime, platform and packages which produced a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Producing library and its version, e.g. `modelvault-core 0.1.0`.
    pub runtime: String,
    /// OS, kernel and architecture.
    pub platform: String,
    /// `(name, version)` pairs, sorted by name.
    #[serde(default)]
    pub packages: Vec<(String, String)>,
}

impl Environment {
    /// Format the packages as `name==version` separated by spaces.
    pub fn packages_line(&self) -> String {
        self.packages
            .iter()
            .map(|(name, version)| format!("{}=={}", name, version))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Return the environment without the package list.
pub fn collect_environment_without_packages() -> Environment {
    let os = System::long_os_version()
        .or_else(System::name)
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let kernel = System::kernel_version().unwrap_or_default();
    let platform = format!("{} {} {}", os, kernel, std::env::consts::ARCH)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    Environment {
        runtime: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        platform,
        packages: Vec::new(),
    }
}

/// Return the full environment. Collected once per process.
pub fn collect_environment() -> Environment {
    ENVIRONMENT
        .get_or_init(|| {
            let mut env = collect_environment_without_packages();
            env.packages = collect_packages();
            env
        })
        .clone()
}

fn collect_packages() -> Vec<(String, String)> {
    let mut packages = vec![(
        env!("CARGO_PKG_NAME").to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    )];
    if let Some(rustc) = option_env!("RUSTC_VERSION") {
        packages.push(("rustc".to_string(), rustc.to_string()));
    }
    packages.sort();
    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_environment() {
        let env = collect_environment();
        assert!(env.runtime.starts_with("modelvault-core"));
        assert!(env.platform.contains(std::env::consts::ARCH));
        assert!(env
            .packages
            .iter()
            .any(|(name, _)| name == "modelvault-core"));
        assert_eq!(collect_environment(), env);
    }

    #[test]
    fn test_packages_line() {
        let env = Environment {
            runtime: "x".into(),
            platform: "y".into(),
            packages: vec![("a".into(), "1".into()), ("b".into(), "2.0".into())],
        };
        assert_eq!(env.packages_line(), "a==1 b==2.0");
    }
}
