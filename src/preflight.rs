//! Preflight checks before a deployment.
//!
//! Validates the project layout and that the host has the tools the pipeline
//! shells out to, so a missing `pio` is reported up front instead of after
//! the assets were already compressed.
//!
//! # Example
//!
//! ```rust
//! use noox_deploy::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("pio") {
//!     println!("PlatformIO is not installed");
//! }
//!
//! let tools = &[("pio", "platformio")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::DeployConfig;

/// Check if a command exists on `PATH` (or is a path to an existing file).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command_name, install hint).
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, hint)| format!("  {} (install: {})", tool, hint))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// The deployment must run from a PlatformIO project root.
pub fn check_project(config: &DeployConfig) -> Result<()> {
    let ini = config.ini_path();
    if !ini.is_file() {
        bail!(
            "Not in NOOX project root directory!\n\
             {} not found; run from the project root or pass --project <dir>.",
            ini.display()
        );
    }
    Ok(())
}

/// Everything [`crate::pipeline::Deployer`] needs on the host.
pub fn check_deploy_host(config: &DeployConfig) -> Result<()> {
    check_project(config)?;
    check_required_tools(&[
        (config.pio.as_str(), "pip install platformio"),
        (config.python.as_str(), "python 3 with esptool"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_required_tools_success() {
        assert!(check_required_tools(&[("sh", "coreutils")]).is_ok());
    }

    #[test]
    fn test_check_required_tools_lists_missing() {
        let err = check_required_tools(&[("nonexistent_command_xyz", "fake-package")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
    }

    #[test]
    fn test_check_project() {
        let temp = TempDir::new().unwrap();
        let config = DeployConfig::new(temp.path());
        assert!(check_project(&config).is_err());

        fs::write(temp.path().join("platformio.ini"), "[env]\n").unwrap();
        assert!(check_project(&config).is_ok());
    }
}
