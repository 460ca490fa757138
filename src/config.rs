//! Deployment settings.
//!
//! Built-in defaults match the NOOX project layout. A `deploy.toml` in the
//! project root may override any of them:
//!
//! ```toml
//! [deploy]
//! pio_env = "esp32s3_NOOX"
//! upload_port = "/dev/ttyUSB0"
//! settle_secs = 2
//! ```
//!
//! `NOOX_UPLOAD_PORT` and `NOOX_PIO_PACKAGES` override the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::image::FilesystemKind;

pub const CONFIG_FILENAME: &str = "deploy.toml";
pub const UPLOAD_PORT_ENV: &str = "NOOX_UPLOAD_PORT";
pub const PIO_PACKAGES_ENV: &str = "NOOX_PIO_PACKAGES";

pub const DEFAULT_PIO_ENV: &str = "esp32s3_NOOX";
pub const DEFAULT_CHIP: &str = "esp32s3";
pub const DEFAULT_BAUD: u32 = 460_800;
pub const DEFAULT_PORT: &str = "COM3";
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// Everything the pipeline needs to know about the project and the host.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub project_dir: PathBuf,
    pub platformio_ini: PathBuf,
    pub pio_env: String,
    pub source_dir: PathBuf,
    pub littlefs_dir: PathBuf,
    pub ffat_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// `~/.platformio/packages`; `None` when no home directory is known.
    pub packages_root: Option<PathBuf>,
    pub pio: String,
    pub python: String,
    pub chip: String,
    pub baud: u32,
    /// Explicit upload port; skips serial port detection.
    pub upload_port: Option<String>,
    pub default_port: String,
    /// Pause after a flash so the device can reboot.
    pub settle_delay: Duration,
}

impl DeployConfig {
    /// Defaults for a project rooted at `project_dir`.
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            platformio_ini: PathBuf::from("platformio.ini"),
            pio_env: DEFAULT_PIO_ENV.to_string(),
            source_dir: PathBuf::from("source_data"),
            littlefs_dir: PathBuf::from("data_littlefs"),
            ffat_dir: PathBuf::from("data_ffat"),
            staging_dir: PathBuf::from("data"),
            packages_root: dirs::home_dir().map(|home| home.join(".platformio").join("packages")),
            pio: "pio".to_string(),
            python: default_python(),
            chip: DEFAULT_CHIP.to_string(),
            baud: DEFAULT_BAUD,
            upload_port: None,
            default_port: DEFAULT_PORT.to_string(),
            settle_delay: DEFAULT_SETTLE,
        }
    }

    /// Defaults, then `deploy.toml` (if present), then environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::new(project_dir);

        let config_path = project_dir.join(CONFIG_FILENAME);
        if config_path.is_file() {
            let text = fs::read_to_string(&config_path)
                .with_context(|| format!("reading deploy config '{}'", config_path.display()))?;
            config
                .apply_toml(&text)
                .with_context(|| format!("parsing deploy config '{}'", config_path.display()))?;
        }

        if let Ok(port) = std::env::var(UPLOAD_PORT_ENV) {
            if !port.trim().is_empty() {
                config.upload_port = Some(port.trim().to_string());
            }
        }
        if let Some(root) = std::env::var_os(PIO_PACKAGES_ENV) {
            config.packages_root = Some(PathBuf::from(root));
        }

        Ok(config)
    }

    /// Overlay the `[deploy]` table of a `deploy.toml` document.
    pub fn apply_toml(&mut self, text: &str) -> Result<()> {
        let parsed: DeployToml = toml::from_str(text)?;
        let Some(deploy) = parsed.deploy else {
            return Ok(());
        };

        if let Some(v) = deploy.platformio_ini {
            self.platformio_ini = v;
        }
        if let Some(v) = deploy.pio_env {
            if v.trim().is_empty() {
                bail!("pio_env must not be empty");
            }
            self.pio_env = v;
        }
        if let Some(v) = deploy.source_dir {
            self.source_dir = v;
        }
        if let Some(v) = deploy.littlefs_dir {
            self.littlefs_dir = v;
        }
        if let Some(v) = deploy.ffat_dir {
            self.ffat_dir = v;
        }
        if let Some(v) = deploy.staging_dir {
            self.staging_dir = v;
        }
        if let Some(v) = deploy.packages_root {
            self.packages_root = Some(v);
        }
        if let Some(v) = deploy.pio {
            self.pio = v;
        }
        if let Some(v) = deploy.python {
            self.python = v;
        }
        if let Some(v) = deploy.chip {
            self.chip = v;
        }
        if let Some(v) = deploy.baud {
            if v == 0 {
                bail!("baud must be greater than zero");
            }
            self.baud = v;
        }
        if let Some(v) = deploy.upload_port {
            self.upload_port = Some(v);
        }
        if let Some(v) = deploy.default_port {
            self.default_port = v;
        }
        if let Some(v) = deploy.settle_secs {
            self.settle_delay = Duration::from_secs(v);
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn ini_path(&self) -> PathBuf {
        self.resolve(&self.platformio_ini)
    }

    pub fn source_path(&self) -> PathBuf {
        self.resolve(&self.source_dir)
    }

    pub fn littlefs_path(&self) -> PathBuf {
        self.resolve(&self.littlefs_dir)
    }

    pub fn ffat_path(&self) -> PathBuf {
        self.resolve(&self.ffat_dir)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.resolve(&self.staging_dir)
    }

    /// Where assets for `kind` are precomputed before staging.
    pub fn image_source(&self, kind: FilesystemKind) -> PathBuf {
        match kind {
            FilesystemKind::LittleFs => self.littlefs_path(),
            FilesystemKind::FFat => self.ffat_path(),
        }
    }

    /// `.pio/build/<env>`
    pub fn build_dir(&self) -> PathBuf {
        self.project_dir.join(".pio").join("build").join(&self.pio_env)
    }

    pub fn image_output(&self, kind: FilesystemKind) -> PathBuf {
        self.build_dir().join(kind.image_filename())
    }

    /// Scratch directory for the run lock and manifest.
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(".pio").join("noox-deploy")
    }
}

fn default_python() -> String {
    if which::which("python3").is_ok() {
        "python3".to_string()
    } else {
        "python".to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployToml {
    deploy: Option<DeployTable>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployTable {
    platformio_ini: Option<PathBuf>,
    pio_env: Option<String>,
    source_dir: Option<PathBuf>,
    littlefs_dir: Option<PathBuf>,
    ffat_dir: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    packages_root: Option<PathBuf>,
    pio: Option<String>,
    python: Option<String>,
    chip: Option<String>,
    baud: Option<u32>,
    upload_port: Option<String>,
    default_port: Option<String>,
    settle_secs: Option<u64>,
}
