//! Filesystem image construction.
//!
//! PlatformIO's own `buildfs` target sizes the image from the partition
//! table, which has produced images of the wrong size for this board. When the
//! standalone `mklittlefs` / `mkfatfs` tools are installed under the
//! PlatformIO package root they are invoked directly with the sizes the
//! partition layout actually reserves.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::config::DeployConfig;
use crate::platformio;
use crate::process::{Cmd, CommandRunner};
use crate::ui;

pub const LITTLEFS_SIZE: u64 = 2_097_152;
pub const LITTLEFS_OFFSET: u32 = 0x81_0000;
pub const LITTLEFS_PAGE: u32 = 256;
pub const LITTLEFS_BLOCK: u32 = 4096;

pub const FFAT_SIZE: u64 = 6_225_920;
pub const FFAT_OFFSET: u32 = 0xA1_0000;

/// The two filesystems flashed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    /// Web assets.
    LittleFs,
    /// Agent files.
    FFat,
}

impl FilesystemKind {
    pub fn label(self) -> &'static str {
        match self {
            FilesystemKind::LittleFs => "LittleFS",
            FilesystemKind::FFat => "FFat",
        }
    }

    /// Value written to `board_build.filesystem`.
    pub fn backend(self) -> &'static str {
        match self {
            FilesystemKind::LittleFs => "littlefs",
            FilesystemKind::FFat => "fatfs",
        }
    }

    /// Standalone image tool, without platform suffix.
    pub fn tool_name(self) -> &'static str {
        match self {
            FilesystemKind::LittleFs => "mklittlefs",
            FilesystemKind::FFat => "mkfatfs",
        }
    }

    pub fn image_filename(self) -> &'static str {
        match self {
            FilesystemKind::LittleFs => "littlefs.bin",
            FilesystemKind::FFat => "fatfs.bin",
        }
    }

    /// Exact image size the partition reserves.
    pub fn size(self) -> u64 {
        match self {
            FilesystemKind::LittleFs => LITTLEFS_SIZE,
            FilesystemKind::FFat => FFAT_SIZE,
        }
    }

    pub fn flash_offset(self) -> u32 {
        match self {
            FilesystemKind::LittleFs => LITTLEFS_OFFSET,
            FilesystemKind::FFat => FFAT_OFFSET,
        }
    }

    /// Extra geometry arguments for the standalone tool.
    pub fn geometry_args(self) -> Vec<String> {
        match self {
            FilesystemKind::LittleFs => vec![
                "-p".to_string(),
                LITTLEFS_PAGE.to_string(),
                "-b".to_string(),
                LITTLEFS_BLOCK.to_string(),
            ],
            FilesystemKind::FFat => Vec::new(),
        }
    }
}

/// Look for `tool-<name>*/<name>[.exe]` under the PlatformIO package root.
///
/// Package directories are tried in name order so the pick is stable when
/// several versions are installed.
pub fn find_image_tool(packages_root: &Path, kind: FilesystemKind) -> Option<PathBuf> {
    let prefix = format!("tool-{}", kind.tool_name());
    let executable = format!("{}{}", kind.tool_name(), std::env::consts::EXE_SUFFIX);

    let mut candidates: Vec<PathBuf> = fs::read_dir(packages_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .map(|dir| dir.join(&executable))
        .find(|tool| tool.is_file())
}

/// Command that packs `staging` into `output` with the standalone tool.
pub fn direct_build_command(
    tool: &Path,
    kind: FilesystemKind,
    staging: &Path,
    output: &Path,
) -> Cmd {
    Cmd::new(tool)
        .arg("-c")
        .arg_path(staging)
        .arg("-s")
        .arg(kind.size().to_string())
        .args(kind.geometry_args())
        .arg_path(output)
        .description(&format!("Build {} image", kind.label()))
}

/// `pio run -e <env> --target buildfs`
pub fn fallback_build_command(config: &DeployConfig, kind: FilesystemKind) -> Cmd {
    platformio::pio_run(config, Some("buildfs"))
        .description(&format!("Build {} image", kind.label()))
}

/// Build the image for `kind` from the staging directory.
///
/// Returns the path of the produced image. An image left over from an earlier
/// run is deleted first, so the image must have been written by this build;
/// its size is checked separately by [`verify_image`].
pub fn build_image(
    config: &DeployConfig,
    runner: &dyn CommandRunner,
    kind: FilesystemKind,
) -> Result<PathBuf> {
    let output = config.image_output(kind);
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating build directory '{}'", parent.display()))?;
    }
    match fs::remove_file(&output) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("removing stale image '{}'", output.display()));
        }
    }

    let tool = config
        .packages_root
        .as_deref()
        .and_then(|root| find_image_tool(root, kind));

    match tool {
        Some(tool) => {
            println!(
                "Building {} with forced size: {} bytes ({})",
                kind.label(),
                ui::thousands(kind.size()),
                ui::mebibytes(kind.size())
            );
            direct_build_command(&tool, kind, &config.staging_path(), &output)
                .current_dir(&config.project_dir)
                .run(runner)
                .with_context(|| format!("Failed to build {} image", kind.label()))?;
        }
        None => {
            ui::warning(&format!(
                "{} tool not found, falling back to PlatformIO buildfs",
                kind.tool_name()
            ));
            fallback_build_command(config, kind)
                .run(runner)
                .with_context(|| format!("Failed to build {} image", kind.label()))?;
        }
    }

    if !output.is_file() {
        bail!("{} image not found at {}", kind.label(), output.display());
    }
    Ok(output)
}

/// Result of comparing an image against the size its partition expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCheck {
    pub path: PathBuf,
    pub expected_size: u64,
    pub actual_size: u64,
    pub sha256: String,
}

impl ImageCheck {
    pub fn size_matches(&self) -> bool {
        self.expected_size == self.actual_size
    }
}

/// Measure and hash an image. A size mismatch is reported as a warning only.
pub fn verify_image(path: &Path, kind: FilesystemKind) -> Result<ImageCheck> {
    let (sha256, actual_size) = sha256_file(path)?;
    let check = ImageCheck {
        path: path.to_path_buf(),
        expected_size: kind.size(),
        actual_size,
        sha256,
    };

    println!(
        "{} image size: {} bytes ({})",
        kind.label(),
        ui::thousands(check.actual_size),
        ui::mebibytes(check.actual_size)
    );
    println!("{} image sha256: {}", kind.label(), check.sha256);

    if !check.size_matches() {
        ui::warning(&format!(
            "WARNING: {} image size ({} bytes) != expected size ({} bytes)",
            kind.label(),
            check.actual_size,
            check.expected_size
        ));
        ui::warning("Filesystem may not work correctly!");
    }
    Ok(check)
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
