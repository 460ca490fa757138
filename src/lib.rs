//! Build and deployment tooling for the NOOX ESP32-S3 device.
//!
//! The device carries two filesystems next to its firmware: LittleFS for the
//! gzipped web UI and FFat for agent files. This crate replaces the manual
//! sequence of PlatformIO and esptool invocations with one pipeline:
//!
//! ```text
//! source_data/ ──gzip──▶ data_littlefs/ ─┐
//!                                         ├─▶ data/ ─mklittlefs─▶ littlefs.bin ─esptool─▶ 0x810000
//! data_ffat/ ─────────────────────────────┘        ─mkfatfs───▶ fatfs.bin    ─esptool─▶ 0xA10000
//! ```
//!
//! - **Asset compression** - [`compress`]
//! - **`platformio.ini` patching with backup/restore** - [`platformio`]
//! - **Filesystem images** - [`image`]
//! - **Flashing** - [`flash`]
//! - **The staged pipeline and its cleanup** - [`pipeline`]
//!
//! # Example
//!
//! ```rust,ignore
//! use noox_deploy::{flash, DeployConfig, Deployer, InterruptFlag, SystemRunner};
//!
//! let config = DeployConfig::load(std::path::Path::new("."))?;
//! let ports = flash::host_scanner();
//! Deployer::new(&config, &SystemRunner, &*ports, InterruptFlag::install()).run()?;
//! ```

pub mod compress;
pub mod config;
pub mod exit;
pub mod flash;
pub mod image;
pub mod pipeline;
pub mod platformio;
pub mod preflight;
pub mod process;
pub mod signal;
pub mod ui;

pub use config::DeployConfig;
pub use flash::{PnpPortScanner, PortScanner, StaticPorts, SysfsPortScanner};
pub use image::FilesystemKind;
pub use pipeline::{Deployer, RunManifest, RunStatus, Stage};
pub use process::{Cmd, CommandRunner, ScriptedRunner, SystemRunner};
pub use signal::{InterruptFlag, Interrupted};
